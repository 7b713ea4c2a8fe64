//! Errors returned by controller commands.

use crate::driver::DriverError;
use crate::state::StatusKind;

/// Error type for controller commands.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The device is in a state that does not permit the command.
    #[error("Device is busy ({0})")]
    AlreadyBusy(StatusKind),
    /// A capture loop is already running.
    #[error("A timelapse is already running")]
    AlreadyRunning,
    /// Another operation holds the camera driver.
    #[error("Camera is in use by another operation")]
    DriverBusy,
    /// The capture driver failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// The command input was rejected before any state change.
    #[error("Invalid request: {0}")]
    Validation(String),
    /// The background capture thread could not be started.
    #[error("Failed to spawn capture thread: {0}")]
    Spawn(std::io::Error),
}

/// Result type for controller commands.
pub type Result<T> = std::result::Result<T, ControlError>;
