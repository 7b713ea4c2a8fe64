//! Timelapse capture loop.
//!
//! The loop owns the driver for the whole run and checks the device state only
//! between captures. Captures are spaced `interval` apart from start to start.
//! Cancellation is cooperative: a request is observed after the current frame
//! and the following wait, so a cancelled run stops within one interval plus
//! one capture.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::driver::{claim_run_directory, CaptureDriver, DriverError, DriverSession, Resolution};
use crate::error::{ControlError, Result};
use crate::state::{DeviceState, DeviceStatus};

/// Parameters of a timelapse before its run directory is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelapseRequest {
    /// Root under which the run directory is created.
    pub output_root: PathBuf,
    /// Total requested run length.
    pub duration: Duration,
    /// Spacing between captures.
    pub interval: Duration,
    /// Sensor resolution for the run.
    pub resolution: Resolution,
}

impl TimelapseRequest {
    /// Reject requests that can never produce a meaningful run.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(ControlError::Validation(
                "interval must be greater than zero".to_owned(),
            ));
        }
        if self.duration.is_zero() {
            return Err(ControlError::Validation(
                "duration must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }

    /// Create the job for a run starting now, claiming a new run directory
    /// named by the current local time.
    pub fn into_job(self) -> Result<CaptureJob> {
        let directory =
            claim_run_directory(&self.output_root, &Local::now()).map_err(DriverError::from)?;
        Ok(CaptureJob::new(
            directory,
            self.duration,
            self.interval,
            self.resolution,
        ))
    }
}

/// A timelapse run, owned by the thread executing it.
#[derive(Debug, Clone)]
pub struct CaptureJob {
    /// Directory receiving this run's frames.
    pub output_directory: PathBuf,
    /// Soft deadline, checked between captures.
    pub duration: Duration,
    /// Wait between captures.
    pub interval: Duration,
    /// Sensor resolution applied before the first frame.
    pub resolution: Resolution,
    /// When the driver became ready; reset when the loop starts capturing.
    pub start_time: Instant,
}

impl CaptureJob {
    /// Describe a run writing into `output_directory`.
    pub fn new(
        output_directory: PathBuf,
        duration: Duration,
        interval: Duration,
        resolution: Resolution,
    ) -> Self {
        Self {
            output_directory,
            duration,
            interval,
            resolution,
            start_time: Instant::now(),
        }
    }
}

/// How a run ended without a driver error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The duration elapsed.
    Completed {
        /// Frames captured during the run.
        frames: u32,
    },
    /// A cancellation request was observed.
    Cancelled {
        /// Frames captured before the request was observed.
        frames: u32,
    },
}

enum Check {
    Continue,
    Cancelled,
    Elapsed,
}

/// Publishes `Failed` when the capture thread unwinds, so a panicking driver
/// cannot leave the device `Running`.
struct FailOnUnwind<'a>(&'a DeviceState);

impl Drop for FailOnUnwind<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("capture loop panicked");
            self.0.publish(DeviceStatus::Failed);
        }
    }
}

/// Drives the capture driver for timelapse runs.
pub struct CaptureLoop<D: CaptureDriver> {
    state: Arc<DeviceState>,
    driver: Arc<Mutex<D>>,
}

impl<D: CaptureDriver> Clone for CaptureLoop<D> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            driver: Arc::clone(&self.driver),
        }
    }
}

impl<D: CaptureDriver> CaptureLoop<D> {
    /// Create a loop sharing `state` and `driver` with the controller.
    pub fn new(state: Arc<DeviceState>, driver: Arc<Mutex<D>>) -> Self {
        Self { state, driver }
    }

    /// Claim the device for a run by publishing `Running`.
    ///
    /// Fails with `AlreadyRunning` while another loop is alive.
    pub fn enter(&self, duration: Duration, interval: Duration) -> Result<()> {
        self.state.update(|status| match status {
            DeviceStatus::Running { .. } | DeviceStatus::Cancelled => {
                Err(ControlError::AlreadyRunning)
            }
            _ => {
                debug!(from = %status.kind(), "entering capture loop");
                *status = DeviceStatus::Running { duration, interval };
                Ok(())
            }
        })
    }

    /// Run `job` on a dedicated thread. The device must already be `Running`.
    pub fn spawn(&self, job: CaptureJob) -> Result<JoinHandle<Result<LoopOutcome>>> {
        let capture = self.clone();
        thread::Builder::new()
            .name("timelapse-capture".to_owned())
            .spawn(move || capture.run(job))
            .map_err(ControlError::Spawn)
    }

    /// Claim a run directory for `request` and run it on the calling thread.
    /// The device must already be `Running`.
    pub fn run_request(&self, request: TimelapseRequest) -> Result<LoopOutcome> {
        match request.into_job() {
            Ok(job) => self.run(job),
            Err(err) => {
                self.state.publish(DeviceStatus::Failed);
                error!(error = %err, "timelapse failed");
                Err(err)
            }
        }
    }

    /// Run `job` on the calling thread until it completes, is cancelled or
    /// fails, then publish `Idle` or `Failed`.
    ///
    /// The driver is released before the final state is published, on every
    /// exit path including a panic.
    pub fn run(&self, mut job: CaptureJob) -> Result<LoopOutcome> {
        let _unwind = FailOnUnwind(&self.state);
        info!(
            directory = %job.output_directory.display(),
            duration = ?job.duration,
            interval = ?job.interval,
            resolution = %job.resolution,
            "timelapse started"
        );

        match self.drive(&mut job) {
            Ok(outcome) => {
                self.state.publish(DeviceStatus::Idle);
                info!(
                    ?outcome,
                    elapsed = ?job.start_time.elapsed(),
                    "timelapse finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                self.state.publish(DeviceStatus::Failed);
                error!(error = %err, "timelapse failed");
                Err(err.into())
            }
        }
    }

    fn drive(&self, job: &mut CaptureJob) -> std::result::Result<LoopOutcome, DriverError> {
        let mut session = DriverSession::acquire(&self.driver)?;
        session.set_resolution(job.resolution)?;
        job.start_time = Instant::now();

        let outcome = {
            let mut frames = session.capture_sequence(&job.output_directory)?;
            let mut captured = 0u32;
            loop {
                let path = frames.next().ok_or(DriverError::SequenceEnded)??;
                captured += 1;
                debug!(frame = %path.display(), count = captured, "captured frame");

                thread::sleep(until_next_capture(job, captured));

                match self.check(job) {
                    Check::Continue => {}
                    Check::Cancelled => break LoopOutcome::Cancelled { frames: captured },
                    Check::Elapsed => break LoopOutcome::Completed { frames: captured },
                }
            }
        };

        session.release()?;
        Ok(outcome)
    }

    fn check(&self, job: &CaptureJob) -> Check {
        let elapsed = job.start_time.elapsed();
        self.state.update(|status| match status {
            DeviceStatus::Cancelled => {
                debug!("cancellation observed");
                Check::Cancelled
            }
            DeviceStatus::Running { .. } if elapsed > job.duration => Check::Elapsed,
            DeviceStatus::Running { .. } => Check::Continue,
            other => {
                warn!(state = %other.kind(), "unexpected state during capture, stopping");
                Check::Cancelled
            }
        })
    }
}

/// Time left until the capture following frame `captured` is due.
fn until_next_capture(job: &CaptureJob, captured: u32) -> Duration {
    job.interval
        .checked_mul(captured)
        .and_then(|offset| job.start_time.checked_add(offset))
        .map_or(job.interval, |due| {
            due.saturating_duration_since(Instant::now())
        })
}
