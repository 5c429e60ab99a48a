// Define message types exchanged over zenoh

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::board::kinematics::{BodyVelocity, Covariance6, CovariancePreset, Pose};
use crate::board::protocol::CommandFrame;
use crate::config::{BASE_FRAME_ID, ODOM_FRAME_ID};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, z: 0.0, w: 1.0 }
    }
}

impl Quaternion {
    /// Rotation about z only (roll = pitch = 0)
    pub fn from_yaw(yaw: f64) -> Self {
        let (sin, cos) = (yaw / 2.0).sin_cos();
        Self { x: 0.0, y: 0.0, z: sin, w: cos }
    }
}

// Velocity command from teleop/planner -> bridge
// Only linear.x, linear.y and angular.z reach the board
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Twist {
    pub linear: Vector3,
    pub angular: Vector3,
}

impl From<&Twist> for CommandFrame {
    fn from(cmd: &Twist) -> Self {
        CommandFrame::new(cmd.linear.x, cmd.linear.y, cmd.angular.z)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Microseconds since the UNIX epoch
    pub stamp_us: u64,
    pub frame_id: String,
}

impl Header {
    pub fn now(frame_id: &str) -> Self {
        let stamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        Self {
            stamp_us,
            frame_id: frame_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseWithCovariance {
    pub position: Vector3,
    pub orientation: Quaternion,
    pub covariance: Covariance6,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwistWithCovariance {
    pub twist: Twist,
    pub covariance: Covariance6,
}

// Wheel odometry published by the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Odometry {
    pub header: Header,
    pub child_frame_id: String,
    pub pose: PoseWithCovariance,
    pub twist: TwistWithCovariance,
}

impl Odometry {
    /// Assemble odometry for the pose reached after integrating `velocity`
    pub fn new(pose: Pose, velocity: BodyVelocity) -> Self {
        let preset = CovariancePreset::for_velocity(&velocity);
        Self {
            header: Header::now(ODOM_FRAME_ID),
            child_frame_id: BASE_FRAME_ID.to_string(),
            pose: PoseWithCovariance {
                position: Vector3::new(pose.x, pose.y, 0.0),
                orientation: Quaternion::from_yaw(pose.yaw),
                covariance: preset.pose,
            },
            twist: TwistWithCovariance {
                twist: Twist {
                    linear: Vector3::new(velocity.x, velocity.y, 0.0),
                    angular: Vector3::new(0.0, 0.0, velocity.z),
                },
                covariance: preset.twist,
            },
        }
    }
}

/// Row-major 3x3 covariance
pub type Covariance3 = [f64; 9];

// Inertial data published by the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Imu {
    pub header: Header,
    pub orientation: Quaternion,
    /// Element 0 is -1: orientation is not estimated
    pub orientation_covariance: Covariance3,
    pub angular_velocity: Vector3,
    pub angular_velocity_covariance: Covariance3,
    pub linear_acceleration: Vector3,
    pub linear_acceleration_covariance: Covariance3,
}

/// Records handed from the receiver thread to the publisher
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    Odometry(Odometry),
    Imu(Imu),
}

/// Serial link state reported on the health topic
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Ok,
    /// Port never opened, or the receiver is gone
    SerialUnavailable,
    /// Port open but reads keep failing (e.g. device unplugged)
    SerialIoError,
}

/// Health status published by the bridge
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BridgeHealth {
    pub status: LinkStatus,
    pub frames_decoded: u64,
    pub frames_rejected: u64,
    pub commands_sent: u64,
    pub commands_failed: u64,
}
