// Motor controller board interface for the mecanum base
//
// Provides:
// - Frame codec for the board's serial protocol (telemetry in, commands out)
// - Mecanum forward kinematics and dead-reckoning odometry
// - Serial link setup and the command writer

pub mod kinematics;
pub mod link;
pub mod protocol;

pub use kinematics::{BaseGeometry, BodyVelocity, CovariancePreset, OdometryIntegrator, Pose};
pub use link::{CommandWriter, LinkError, SerialLink};
pub use protocol::{CommandFrame, FrameDecoder, FrameError, FrameStats, WheelSample};
