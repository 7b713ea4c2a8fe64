//! Pi-Timelapse: preview and timelapse capture control for a Raspberry Pi camera
//!
//! The [`Controller`] accepts commands, checks them against the single
//! [`DeviceState`] snapshot and hands timelapse runs to the [`Scheduler`] or a
//! [`CaptureLoop`] thread. Hardware access goes through the [`CaptureDriver`]
//! trait, implemented for V4L2 devices and, in tests, by a mock.

pub mod capture;
pub mod config;
pub mod controller;
pub mod device;
pub mod driver;
pub mod encode;
pub mod error;
pub mod scheduler;
pub mod state;
pub mod timer;

#[cfg(test)]
pub mod mock;

pub use capture::{CaptureJob, CaptureLoop, LoopOutcome, TimelapseRequest};
pub use config::{CameraConfig, ConfigError, Settings};
pub use controller::Controller;
pub use device::V4L2Driver;
pub use driver::{CaptureDriver, DriverError, DriverSession, Resolution};
pub use error::ControlError;
pub use scheduler::Scheduler;
pub use state::{DeviceState, DeviceStatus, StatusKind};
