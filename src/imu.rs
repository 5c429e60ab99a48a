// Inertial measurement unit: driver seam, calibration and message assembly

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::IMU_FRAME_ID;
use crate::messages::{Covariance3, Header, Imu, Quaternion, Vector3};

/// Largest tolerated deviation of the resting gravity reading, in g
pub const GRAVITY_TOLERANCE: f64 = 0.2;

/// Expected accelerometer y reading of a unit at rest in its mount, in g
pub const RESTING_ACCEL_Y: f64 = -1.0;

const VELOCITY_COVARIANCE: Covariance3 = [1e-6, 0.0, 0.0, 0.0, 1e-6, 0.0, 0.0, 0.0, 1e-6];
const UNKNOWN_ORIENTATION: Covariance3 = [-1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];

#[derive(Debug, thiserror::Error)]
pub enum ImuError {
    #[error("IMU not detected")]
    NotDetected,

    #[error("IMU read failed: {0}")]
    Read(String),
}

/// Sensor reported by the driver after init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImuKind {
    Icm20948,
    Unknown,
}

/// One raw reading in the sensor's own axes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImuReading {
    /// Roll, pitch, yaw in degrees
    pub angles: Vector3,
    /// deg/s
    pub gyro: Vector3,
    /// g
    pub accel: Vector3,
    pub magnetometer: Vector3,
}

/// Driver seam for the IMU
pub trait ImuSource: Send {
    fn init(&mut self) -> Result<ImuKind, ImuError>;

    /// Latest available sample
    fn poll(&mut self) -> Result<ImuReading, ImuError>;
}

/// Stand-in used when no IMU driver is linked: a level unit at rest
#[derive(Debug, Clone, Copy, Default)]
pub struct NullImu;

impl ImuSource for NullImu {
    fn init(&mut self) -> Result<ImuKind, ImuError> {
        Ok(ImuKind::Unknown)
    }

    fn poll(&mut self) -> Result<ImuReading, ImuError> {
        Ok(ImuReading {
            accel: Vector3::new(0.0, RESTING_ACCEL_Y, 0.0),
            ..ImuReading::default()
        })
    }
}

/// Axis remap and bias constants for one physical sensor mount.
///
/// The defaults match a single calibrated unit; other units need their own
/// values (see `Calibration` in config).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ImuCalibration {
    /// deg/s subtracted from the raw gyro y axis
    pub gyro_y_bias: f64,
    /// g subtracted from the raw accel x axis
    pub accel_x_bias: f64,
    /// g subtracted from the raw accel z axis
    pub accel_z_bias: f64,
    pub deg_per_rad: f64,
    /// m/s^2 per g
    pub gravity: f64,
}

impl Default for ImuCalibration {
    fn default() -> Self {
        Self {
            gyro_y_bias: -0.061,
            accel_x_bias: 0.039,
            accel_z_bias: -0.033,
            deg_per_rad: 57.3,
            gravity: 9.81,
        }
    }
}

impl ImuCalibration {
    /// Gyro (deg/s, sensor axes) -> angular velocity (rad/s, body axes)
    pub fn angular_velocity(&self, gyro: Vector3) -> Vector3 {
        Vector3 {
            x: gyro.z / self.deg_per_rad,
            y: -gyro.x / self.deg_per_rad,
            z: -(gyro.y - self.gyro_y_bias) / self.deg_per_rad,
        }
    }

    /// Accel (g, sensor axes) -> linear acceleration (m/s^2, body axes)
    pub fn linear_acceleration(&self, accel: Vector3) -> Vector3 {
        Vector3 {
            x: (accel.z - self.accel_z_bias) * self.gravity,
            y: -(accel.x - self.accel_x_bias) * self.gravity,
            z: -accel.y * self.gravity,
        }
    }

    pub fn to_message(&self, reading: &ImuReading) -> Imu {
        Imu {
            header: Header::now(IMU_FRAME_ID),
            orientation: Quaternion::default(),
            orientation_covariance: UNKNOWN_ORIENTATION,
            angular_velocity: self.angular_velocity(reading.gyro),
            angular_velocity_covariance: VELOCITY_COVARIANCE,
            linear_acceleration: self.linear_acceleration(reading.accel),
            linear_acceleration_covariance: VELOCITY_COVARIANCE,
        }
    }
}

/// Deviation of the resting gravity reading, if it exceeds the tolerance
pub fn gravity_anomaly(reading: &ImuReading) -> Option<f64> {
    let deviation = (reading.accel.y - RESTING_ACCEL_Y).abs();
    (deviation > GRAVITY_TOLERANCE).then_some(deviation)
}

/// Initialize the IMU, wait for it to settle and sanity-check gravity.
///
/// Never fails: problems are logged and the bridge keeps going.
pub fn bring_up(imu: &mut dyn ImuSource, settle: std::time::Duration) {
    match imu.init() {
        Ok(ImuKind::Icm20948) => info!("Motion sensor is ICM-20948"),
        Ok(ImuKind::Unknown) => info!("Motion sensor not identified"),
        Err(e) => warn!("IMU init failed: {}", e),
    }

    std::thread::sleep(settle);

    match imu.poll() {
        Ok(reading) => {
            if let Some(deviation) = gravity_anomaly(&reading) {
                warn!("IMU gravity reading off by {:.3} g", deviation);
            }
        }
        Err(e) => warn!("IMU startup read failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_angular_velocity_remap() {
        let cal = ImuCalibration::default();
        let w = cal.angular_velocity(Vector3::new(5.73, -11.46, 57.3));
        assert!(approx(w.x, 1.0));
        assert!(approx(w.y, -0.1));
        assert!(approx(w.z, -(-11.46 + 0.061) / 57.3));
    }

    #[test]
    fn test_linear_acceleration_remap() {
        let cal = ImuCalibration::default();
        let a = cal.linear_acceleration(Vector3::new(0.5, -1.0, 0.25));
        assert!(approx(a.x, (0.25 + 0.033) * 9.81));
        assert!(approx(a.y, -(0.5 - 0.039) * 9.81));
        assert!(approx(a.z, 9.81));
    }

    #[test]
    fn test_message_marks_orientation_unknown() {
        let msg = ImuCalibration::default().to_message(&ImuReading::default());
        assert_eq!(msg.header.frame_id, "imu_link");
        assert_eq!(msg.orientation_covariance[0], -1.0);
        assert_eq!(msg.angular_velocity_covariance[4], 1e-6);
        assert_eq!(msg.linear_acceleration_covariance[8], 1e-6);
        assert_eq!(msg.linear_acceleration_covariance[1], 0.0);
    }

    #[test]
    fn test_gravity_anomaly() {
        let mut reading = NullImu.poll().unwrap();
        assert_eq!(gravity_anomaly(&reading), None);

        reading.accel.y = -0.5;
        assert!(gravity_anomaly(&reading).is_some());
    }

    #[test]
    fn test_bring_up_tolerates_missing_sensor() {
        struct Missing;
        impl ImuSource for Missing {
            fn init(&mut self) -> Result<ImuKind, ImuError> {
                Err(ImuError::NotDetected)
            }
            fn poll(&mut self) -> Result<ImuReading, ImuError> {
                Err(ImuError::Read("no device".to_string()))
            }
        }

        bring_up(&mut Missing, std::time::Duration::ZERO);
    }
}
