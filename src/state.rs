//! Authoritative lifecycle state of the camera.

use serde::{Serialize, Serializer};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Name of a [`DeviceStatus`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// Nothing in progress.
    Idle,
    /// A timelapse is waiting for its delay to elapse.
    Scheduled,
    /// A capture loop is producing frames.
    Running,
    /// Cancellation was requested; the loop has not observed it yet.
    Cancelled,
    /// The last capture loop stopped on a driver error.
    Failed,
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Immutable snapshot of what the camera is doing.
///
/// Each variant carries exactly the fields that are meaningful for it.
/// Durations serialize as fractional seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Nothing in progress.
    Idle,
    /// Waiting `delay` before running for `duration`, one frame per `interval`.
    Scheduled {
        /// Time until the run starts, measured from scheduling.
        #[serde(serialize_with = "as_secs")]
        delay: Duration,
        /// Total requested run length.
        #[serde(serialize_with = "as_secs")]
        duration: Duration,
        /// Spacing between captures.
        #[serde(serialize_with = "as_secs")]
        interval: Duration,
    },
    /// Capturing for `duration`, one frame per `interval`.
    Running {
        /// Total requested run length.
        #[serde(serialize_with = "as_secs")]
        duration: Duration,
        /// Spacing between captures.
        #[serde(serialize_with = "as_secs")]
        interval: Duration,
    },
    /// Cancellation requested, not yet observed by the loop.
    Cancelled,
    /// Stopped on a driver error.
    Failed,
}

fn as_secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

impl DeviceStatus {
    /// Variant name.
    pub const fn kind(&self) -> StatusKind {
        match self {
            Self::Idle => StatusKind::Idle,
            Self::Scheduled { .. } => StatusKind::Scheduled,
            Self::Running { .. } => StatusKind::Running,
            Self::Cancelled => StatusKind::Cancelled,
            Self::Failed => StatusKind::Failed,
        }
    }

    /// Scheduling delay, only while scheduled.
    pub const fn delay(&self) -> Option<Duration> {
        match self {
            Self::Scheduled { delay, .. } => Some(*delay),
            _ => None,
        }
    }

    /// Requested run length, while scheduled or running.
    pub const fn duration(&self) -> Option<Duration> {
        match self {
            Self::Scheduled { duration, .. } | Self::Running { duration, .. } => Some(*duration),
            _ => None,
        }
    }

    /// Capture spacing, while scheduled or running.
    pub const fn interval(&self) -> Option<Duration> {
        match self {
            Self::Scheduled { interval, .. } | Self::Running { interval, .. } => Some(*interval),
            _ => None,
        }
    }

    /// Whether a timelapse is pending or a capture loop is still alive.
    ///
    /// `Cancelled` counts as busy: the loop keeps the driver until it observes
    /// the request.
    pub const fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Scheduled { .. } | Self::Running { .. } | Self::Cancelled
        )
    }
}

/// Single source of truth for the device lifecycle.
///
/// The lock is held only to copy or replace a snapshot, never across a capture,
/// so readers do not wait on the capture loop.
#[derive(Debug)]
pub struct DeviceState {
    current: Mutex<DeviceStatus>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceState {
    /// Create the state of a freshly initialized device.
    pub const fn new() -> Self {
        Self {
            current: Mutex::new(DeviceStatus::Idle),
        }
    }

    /// Current snapshot.
    pub fn read(&self) -> DeviceStatus {
        self.update(|status| *status)
    }

    /// Replace the snapshot.
    pub fn publish(&self, status: DeviceStatus) {
        self.update(|current| {
            debug!(from = %current.kind(), to = %status.kind(), "device state");
            *current = status;
        });
    }

    /// Atomically inspect and optionally replace the snapshot.
    ///
    /// `f` sees the current snapshot and may overwrite it wholesale; no other
    /// reader or writer runs in between.
    pub fn update<R>(&self, f: impl FnOnce(&mut DeviceStatus) -> R) -> R {
        // A panicking writer can only leave a whole snapshot behind.
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut current)
    }
}
