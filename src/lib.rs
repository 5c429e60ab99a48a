pub mod board;
pub mod config;
pub mod imu;
pub mod messages;
pub mod receiver;
pub mod runtime;
