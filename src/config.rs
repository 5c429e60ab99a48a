// Serial link, topics, calibration defaults
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::board::kinematics::BaseGeometry;
use crate::imu::ImuCalibration;

// Serial port for the motor controller board
pub const SERIAL_PORT: &str = "/dev/ttyACM0";
pub const SERIAL_BAUDRATE: u32 = 38_400;

// Bounds how long a single byte read may block, and with it shutdown latency
pub const READ_TIMEOUT_MS: u64 = 100;

// Zenoh topics
pub const TOPIC_CMD_VEL: &str = "base/cmd_vel"; // commands
pub const TOPIC_ODOM: &str = "base/odom"; // wheel odometry
pub const TOPIC_IMU: &str = "base/imu"; // inertial data
pub const TOPIC_HEALTH: &str = "base/health"; // bridge status

// Frame ids stamped on outbound telemetry
pub const ODOM_FRAME_ID: &str = "odom";
pub const BASE_FRAME_ID: &str = "base_link";
pub const IMU_FRAME_ID: &str = "imu_link";

// Time the IMU needs after init before its first reading is trustworthy
pub const IMU_SETTLE_MS: u64 = 3000;

// Telemetry records buffered between the receiver thread and the publisher
pub const TELEMETRY_CAPACITY: usize = 64;

pub const HEALTH_PERIOD: Duration = Duration::from_secs(1);

/// Errors loading the calibration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read calibration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid calibration file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Command line options for the bridge binary
#[derive(Debug, Clone, Parser)]
#[command(name = "mecanum-base-bridge", about = "Serial bridge to a mecanum base controller")]
pub struct BridgeArgs {
    /// Serial device of the motor controller board
    #[arg(long, default_value = SERIAL_PORT)]
    pub port: String,

    #[arg(long, default_value_t = SERIAL_BAUDRATE)]
    pub baud: u32,

    /// Serial read timeout in milliseconds
    #[arg(long, default_value_t = READ_TIMEOUT_MS)]
    pub read_timeout_ms: u64,

    /// JSON file overriding base geometry and IMU calibration
    #[arg(long)]
    pub calibration: Option<PathBuf>,

    /// Delay between IMU init and the startup sanity check, in milliseconds
    #[arg(long, default_value_t = IMU_SETTLE_MS)]
    pub imu_settle_ms: u64,
}

/// Per-unit calibration, loaded from JSON. Any missing field keeps its default.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Calibration {
    pub geometry: BaseGeometry,
    pub imu: ImuCalibration,
}

impl Calibration {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

/// Fully resolved settings handed to the runtime
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub port: String,
    pub baud: u32,
    pub read_timeout: Duration,
    pub imu_settle: Duration,
    pub calibration: Calibration,
}

impl BridgeConfig {
    pub fn from_args(args: &BridgeArgs) -> Result<Self, ConfigError> {
        let calibration = match &args.calibration {
            Some(path) => Calibration::load(path)?,
            None => Calibration::default(),
        };

        Ok(Self {
            port: args.port.clone(),
            baud: args.baud,
            read_timeout: Duration::from_millis(args.read_timeout_ms),
            imu_settle: Duration::from_millis(args.imu_settle_ms),
            calibration,
        })
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: SERIAL_PORT.to_string(),
            baud: SERIAL_BAUDRATE,
            read_timeout: Duration::from_millis(READ_TIMEOUT_MS),
            imu_settle: Duration::from_millis(IMU_SETTLE_MS),
            calibration: Calibration::default(),
        }
    }
}
