// Mecanum forward kinematics and dead-reckoning odometry
// Converts the four measured wheel velocities into body velocity and integrates pose.

use serde::Deserialize;

use super::protocol::WheelSample;

/// Wheel configuration of the base
pub const WHEEL_RADIUS: f64 = 0.03; // meters
pub const HALF_TRACK: f64 = 0.195 / 2.0; // meters, half the distance between front wheels
pub const HALF_WHEELBASE: f64 = 0.151 / 2.0; // meters, half the distance between front and rear axle

/// Physical dimensions used by the kinematic transform
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BaseGeometry {
    pub wheel_radius: f64,
    pub half_track: f64,
    pub half_wheelbase: f64,
}

impl Default for BaseGeometry {
    fn default() -> Self {
        Self {
            wheel_radius: WHEEL_RADIUS,
            half_track: HALF_TRACK,
            half_wheelbase: HALF_WHEELBASE,
        }
    }
}

/// Body-frame velocity: x forward (m/s), y left (m/s), z yaw rate (rad/s)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BodyVelocity {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl BodyVelocity {
    pub fn is_stationary(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }
}

/// Planar pose in the odom frame: x, y in meters, yaw in radians
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
}

impl BaseGeometry {
    /// Convert wheel velocities [c1, c2, c3, c4] to body velocity
    ///
    /// The channel order follows the board firmware; the signs below are
    /// taken from it as-is rather than derived from a wheel layout.
    pub fn body_velocity(&self, wheels: [f64; 4]) -> BodyVelocity {
        let [c1, c2, c3, c4] = wheels;
        let r = self.wheel_radius;

        BodyVelocity {
            x: r * (c2 + c1 + c4 + c3) / 4.0,
            y: r * (c2 - c1 + c4 - c3) / 4.0,
            z: r * (-c2 - c1 + c4 + c3) / 4.0 / (self.half_track + self.half_wheelbase),
        }
    }

    pub fn body_velocity_of(&self, sample: &WheelSample) -> BodyVelocity {
        self.body_velocity(sample.wheels)
    }
}

/// Forward-Euler pose integrator.
///
/// Owned by exactly one receiver loop; the pose starts at the origin and is
/// never reset while the owner lives.
#[derive(Debug, Clone, Default)]
pub struct OdometryIntegrator {
    pose: Pose,
}

impl OdometryIntegrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    /// Advance the pose by `velocity` applied for `dt` seconds in the current heading
    pub fn update(&mut self, dt: f64, velocity: BodyVelocity) -> Pose {
        let (sin, cos) = self.pose.yaw.sin_cos();

        self.pose.x += (velocity.x * cos - velocity.y * sin) * dt;
        self.pose.y += (velocity.x * sin + velocity.y * cos) * dt;
        self.pose.yaw += velocity.z * dt;

        self.pose
    }
}

/// Row-major 6x6 covariance over (x, y, z, roll, pitch, yaw)
pub type Covariance6 = [[f64; 6]; 6];

const fn diagonal(values: [f64; 6]) -> Covariance6 {
    let mut m = [[0.0; 6]; 6];
    let mut i = 0;
    while i < 6 {
        m[i][i] = values[i];
        i += 1;
    }
    m
}

/// Fixed pose/twist covariance pair attached to odometry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CovariancePreset {
    pub pose: Covariance6,
    pub twist: Covariance6,
}

impl CovariancePreset {
    /// Base is moving: wheel slip makes encoders less trustworthy than the IMU
    pub const MOVING: Self = Self {
        pose: diagonal([1e-3, 1e-3, 1e6, 1e6, 1e6, 1e3]),
        twist: diagonal([1e-3, 1e-3, 1e6, 1e6, 1e6, 1e3]),
    };

    /// Base is standing still: encoders are trusted
    pub const STATIONARY: Self = Self {
        pose: diagonal([1e-9, 1e-3, 1e6, 1e6, 1e6, 1e-9]),
        twist: diagonal([1e-9, 1e-3, 1e6, 1e6, 1e6, 1e-9]),
    };

    pub fn for_velocity(velocity: &BodyVelocity) -> Self {
        if velocity.is_stationary() {
            Self::STATIONARY
        } else {
            Self::MOVING
        }
    }
}
