use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("no responding device found on any serial port")]
    DeviceNotFound,
    #[error("invalid actuator command: {0}")]
    InvalidCommand(String),
    #[error("not connected to a device")]
    NotConnected,
    #[error("acquisition is already running")]
    AlreadyRunning,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;
