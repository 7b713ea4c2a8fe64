//! Capture driver abstraction and scoped driver ownership.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, ErrorKind};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use chrono::{DateTime, TimeZone};
use tracing::warn;

/// Sensor resolution requested from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

impl Resolution {
    /// Create a new resolution.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Error type for driver operations.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// A capture was requested before `open`.
    #[error("Device is not open")]
    NotOpen,
    /// Failed to open device.
    #[error("Failed to open device: {0}")]
    OpenFailed(String),
    /// The device rejected the requested configuration.
    #[error("Failed to configure device: {0}")]
    Configuration(String),
    /// A single frame could not be captured or stored.
    #[error("Capture failed: {0}")]
    CaptureFailed(String),
    /// The frame sequence stopped producing frames.
    #[error("Frame sequence ended unexpectedly")]
    SequenceEnded,
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Hardware-facing capability that operates the camera sensor.
///
/// Implementations are owned by exactly one operation at a time; see
/// [`DriverSession`].
pub trait CaptureDriver: Send + 'static {
    /// Lazy frame sequence returned by `capture_sequence`.
    type Sequence<'a>: Iterator<Item = Result<PathBuf>>
    where
        Self: 'a;

    /// Open the device.
    fn open(&mut self) -> Result<()>;

    /// Apply a sensor resolution.
    fn set_resolution(&mut self, resolution: Resolution) -> Result<()>;

    /// Capture one image to `path`.
    fn capture_single(&mut self, path: &Path) -> Result<()>;

    /// Start a frame sequence writing into `directory`.
    ///
    /// Each call to `next()` captures one frame and yields its path. Frames are
    /// named by [`frame_path`].
    fn capture_sequence(&mut self, directory: &Path) -> Result<Self::Sequence<'_>>;

    /// Release the device.
    fn close(&mut self) -> Result<()>;
}

/// Path of the frame with the given 1-based `counter` inside a run directory.
pub fn frame_path(directory: &Path, counter: u32) -> PathBuf {
    directory.join(format!("image{counter:06}.jpg"))
}

/// Run directory under `root` named by the run's start time.
pub fn run_directory<Tz>(root: &Path, started: &DateTime<Tz>) -> PathBuf
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    root.join(started.format("%Y-%m-%d_%H-%M-%S").to_string())
}

/// Upper bound on runs sharing one start second.
const MAX_RUNS_PER_SECOND: u32 = 1000;

/// Create a fresh run directory under `root` for a run started at `started`.
///
/// The directory is named by [`run_directory`]. Runs starting within the same
/// second get a `-2`, `-3`, ... suffix, so no run writes into another run's
/// directory.
pub fn claim_run_directory<Tz>(root: &Path, started: &DateTime<Tz>) -> io::Result<PathBuf>
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    fs::create_dir_all(root)?;
    let base = run_directory(root, started);
    let mut candidate = base.clone();
    let mut suffix = 1;
    loop {
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == ErrorKind::AlreadyExists && suffix < MAX_RUNS_PER_SECOND => {
                suffix += 1;
                let mut name = base.clone().into_os_string();
                name.push(format!("-{suffix}"));
                candidate = PathBuf::from(name);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Exclusive, opened handle on a shared driver.
///
/// The driver is closed when the session is dropped, whatever the exit path.
pub struct DriverSession<'a, D: CaptureDriver> {
    driver: MutexGuard<'a, D>,
    open: bool,
}

impl<'a, D: CaptureDriver> DriverSession<'a, D> {
    /// Lock the driver, waiting for any current owner, and open it.
    pub fn acquire(driver: &'a Mutex<D>) -> Result<Self> {
        let guard = driver.lock().unwrap_or_else(PoisonError::into_inner);
        Self::opened(guard)
    }

    /// Lock and open the driver only if no other operation owns it.
    ///
    /// Returns `Ok(None)` when the driver is busy.
    pub fn try_acquire(driver: &'a Mutex<D>) -> Result<Option<Self>> {
        let guard = match driver.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(None),
        };
        Self::opened(guard).map(Some)
    }

    fn opened(mut driver: MutexGuard<'a, D>) -> Result<Self> {
        driver.open()?;
        Ok(Self { driver, open: true })
    }

    /// Close the driver now, reporting a close failure.
    pub fn release(mut self) -> Result<()> {
        self.open = false;
        self.driver.close()
    }
}

impl<D: CaptureDriver> Deref for DriverSession<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.driver
    }
}

impl<D: CaptureDriver> DerefMut for DriverSession<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}

impl<D: CaptureDriver> Drop for DriverSession<'_, D> {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.driver.close() {
                warn!(error = %err, "failed to close capture driver");
            }
        }
    }
}
