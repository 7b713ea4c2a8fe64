//! Mock driver implementation for testing without hardware.

use crate::driver::{frame_path, CaptureDriver, DriverError, Resolution, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Calls recorded by a [`MockDriver`], shared with the test after the driver
/// has been handed to the controller.
#[derive(Debug, Default)]
pub struct DriverLog {
    opens: AtomicUsize,
    closes: AtomicUsize,
    previews: AtomicUsize,
    resolution: Mutex<Option<Resolution>>,
    frames: Mutex<Vec<PathBuf>>,
}

impl DriverLog {
    /// Number of successful `open` calls.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of `close` calls.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Number of single captures.
    pub fn previews(&self) -> usize {
        self.previews.load(Ordering::SeqCst)
    }

    /// Last resolution applied.
    pub fn resolution(&self) -> Option<Resolution> {
        *self.resolution.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Paths of all sequence frames captured so far.
    pub fn frames(&self) -> Vec<PathBuf> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of sequence frames captured so far.
    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Mock driver for testing without hardware.
pub struct MockDriver {
    log: Arc<DriverLog>,
    open: bool,
    fail_open: bool,
    fail_preview: bool,
    fail_after: Option<usize>,
    panic_after: Option<u32>,
    capture_time: Duration,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Create a new mock driver that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            log: Arc::new(DriverLog::default()),
            open: false,
            fail_open: false,
            fail_preview: false,
            fail_after: None,
            panic_after: None,
            capture_time: Duration::ZERO,
        }
    }

    /// Fail every sequence frame after `frames` successful ones.
    #[must_use]
    pub fn failing_after(mut self, frames: usize) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Panic on the next sequence frame after `frames` successful ones.
    #[must_use]
    pub fn panicking_after(mut self, frames: u32) -> Self {
        self.panic_after = Some(frames);
        self
    }

    /// Fail every `open` call.
    #[must_use]
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Fail every single capture.
    #[must_use]
    pub fn failing_preview(mut self) -> Self {
        self.fail_preview = true;
        self
    }

    /// Spend `time` on every capture.
    #[must_use]
    pub fn with_capture_time(mut self, time: Duration) -> Self {
        self.capture_time = time;
        self
    }

    /// Shared call log.
    pub fn log(&self) -> Arc<DriverLog> {
        Arc::clone(&self.log)
    }
}

impl CaptureDriver for MockDriver {
    type Sequence<'a> = MockSequence<'a>;

    fn open(&mut self) -> Result<()> {
        if self.fail_open {
            return Err(DriverError::OpenFailed("mock open failure".to_owned()));
        }
        self.open = true;
        self.log.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_resolution(&mut self, resolution: Resolution) -> Result<()> {
        if !self.open {
            return Err(DriverError::NotOpen);
        }
        *self
            .log
            .resolution
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(resolution);
        Ok(())
    }

    fn capture_single(&mut self, _path: &Path) -> Result<()> {
        if !self.open {
            return Err(DriverError::NotOpen);
        }
        if self.fail_preview {
            return Err(DriverError::CaptureFailed("mock preview failure".to_owned()));
        }
        std::thread::sleep(self.capture_time);
        self.log.previews.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn capture_sequence(&mut self, directory: &Path) -> Result<Self::Sequence<'_>> {
        if !self.open {
            return Err(DriverError::NotOpen);
        }
        Ok(MockSequence {
            driver: self,
            directory: directory.to_path_buf(),
            counter: 0,
        })
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Mock frame sequence; records a path per frame instead of writing files.
pub struct MockSequence<'a> {
    driver: &'a mut MockDriver,
    directory: PathBuf,
    counter: u32,
}

impl Iterator for MockSequence<'_> {
    type Item = Result<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.driver.open {
            return Some(Err(DriverError::NotOpen));
        }
        if self.driver.panic_after.is_some_and(|limit| self.counter >= limit) {
            simulated_panic();
        }
        std::thread::sleep(self.driver.capture_time);

        let mut frames = self
            .driver
            .log
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.driver.fail_after.is_some_and(|limit| frames.len() >= limit) {
            return Some(Err(DriverError::CaptureFailed(
                "mock sequence failure".to_owned(),
            )));
        }

        self.counter += 1;
        let path = frame_path(&self.directory, self.counter);
        frames.push(path.clone());
        Some(Ok(path))
    }
}

#[allow(clippy::panic)]
fn simulated_panic() -> ! {
    panic!("mock sequence panic")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_driver_requires_open() {
        let mut driver = MockDriver::new();
        let result = driver.capture_single(Path::new("preview.jpg"));
        assert!(matches!(result, Err(DriverError::NotOpen)));
    }

    #[test]
    fn test_mock_sequence_names_frames() {
        let mut driver = MockDriver::new();
        let log = driver.log();
        driver.open().expect("open should succeed");

        let mut frames = driver
            .capture_sequence(Path::new("/tmp/run"))
            .expect("capture_sequence should succeed");

        let first = frames.next().expect("sequence is endless").expect("frame");
        let second = frames.next().expect("sequence is endless").expect("frame");
        assert_eq!(first, PathBuf::from("/tmp/run/image000001.jpg"));
        assert_eq!(second, PathBuf::from("/tmp/run/image000002.jpg"));
        assert_eq!(log.frame_count(), 2);
    }

    #[test]
    fn test_mock_sequence_fails_after_limit() {
        let mut driver = MockDriver::new().failing_after(1);
        driver.open().expect("open should succeed");

        let mut frames = driver
            .capture_sequence(Path::new("/tmp/run"))
            .expect("capture_sequence should succeed");

        assert!(matches!(frames.next(), Some(Ok(_))));
        assert!(matches!(
            frames.next(),
            Some(Err(DriverError::CaptureFailed(_)))
        ));
    }
}
