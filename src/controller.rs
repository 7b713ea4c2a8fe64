//! Public entry point for camera commands.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::capture::{CaptureLoop, TimelapseRequest};
use crate::config::{CameraConfig, Settings};
use crate::driver::{CaptureDriver, DriverSession, Resolution};
use crate::error::{ControlError, Result};
use crate::scheduler::Scheduler;
use crate::state::{DeviceState, DeviceStatus};

enum CancelAction {
    Signalled,
    Disarm,
    Nothing,
}

/// Validates commands against the device state and routes them to the
/// scheduler and capture loop.
///
/// All methods return without waiting for a timelapse; only `preview` blocks,
/// for the length of one capture.
pub struct Controller<D: CaptureDriver> {
    state: Arc<DeviceState>,
    driver: Arc<Mutex<D>>,
    capture: CaptureLoop<D>,
    scheduler: Scheduler<D>,
    settings: Settings,
    camera: RwLock<CameraConfig>,
}

impl<D: CaptureDriver> Controller<D> {
    /// Take ownership of `driver` and start in `Idle`.
    pub fn new(driver: D, settings: Settings) -> Self {
        let state = Arc::new(DeviceState::new());
        let driver = Arc::new(Mutex::new(driver));
        let capture = CaptureLoop::new(Arc::clone(&state), Arc::clone(&driver));
        let scheduler = Scheduler::new(Arc::clone(&state), capture.clone());
        let camera = RwLock::new(settings.camera.clone());

        Self {
            state,
            driver,
            capture,
            scheduler,
            settings,
            camera,
        }
    }

    /// Settings the controller was created with.
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Current device status.
    pub fn status(&self) -> DeviceStatus {
        self.state.read()
    }

    /// Capture one photo at the preview resolution into `path`.
    ///
    /// Fails with `AlreadyBusy` while a capture loop owns the driver and with
    /// `DriverBusy` while another preview does; the device state is left
    /// untouched. A successful preview clears `Failed`.
    pub fn preview(&self, path: &Path) -> Result<()> {
        let Some(mut session) = DriverSession::try_acquire(&self.driver)? else {
            let err = match self.state.read() {
                status @ (DeviceStatus::Running { .. } | DeviceStatus::Cancelled) => {
                    ControlError::AlreadyBusy(status.kind())
                }
                _ => ControlError::DriverBusy,
            };
            warn!(error = %err, "preview rejected");
            return Err(err);
        };

        session.set_resolution(self.settings.resolution.preview)?;
        session.capture_single(path)?;
        session.release()?;

        self.state.update(|status| {
            if *status == DeviceStatus::Failed {
                *status = DeviceStatus::Idle;
            }
        });
        info!(path = %path.display(), "preview captured");
        Ok(())
    }

    /// Capture a preview into the configured preview path.
    pub fn preview_default(&self) -> Result<PathBuf> {
        let path = self.settings.preview_path.clone();
        self.preview(&path)?;
        Ok(path)
    }

    /// Start a timelapse now, in a new run directory under `output_root`.
    ///
    /// Returns the run directory. Fails with `AlreadyBusy` unless the device
    /// is `Idle` or `Failed`.
    pub fn start_now(
        &self,
        output_root: &Path,
        duration: Duration,
        interval: Duration,
    ) -> Result<PathBuf> {
        let request = self.request(output_root, duration, interval);
        request.validate()?;

        let previous = self
            .state
            .update(|status| {
                if status.is_busy() {
                    return Err(ControlError::AlreadyBusy(status.kind()));
                }
                let previous = *status;
                *status = DeviceStatus::Running { duration, interval };
                Ok(previous)
            })
            .inspect_err(|err| warn!(error = %err, "timelapse rejected"))?;

        let spawned = request.into_job().and_then(|job| {
            let directory = job.output_directory.clone();
            self.capture.spawn(job).map(|_| directory)
        });
        if spawned.is_err() {
            self.state.publish(previous);
        }
        spawned
    }

    /// Start a timelapse under `output_root` after `delay`. Returns
    /// immediately.
    pub fn schedule(
        &self,
        delay: Duration,
        output_root: &Path,
        duration: Duration,
        interval: Duration,
    ) -> Result<()> {
        self.scheduler
            .schedule(delay, self.request(output_root, duration, interval))
            .inspect_err(|err| warn!(error = %err, "schedule rejected"))
    }

    /// Request cancellation and return the status right after the request.
    ///
    /// A running loop is only signalled: it stops at its next check, within
    /// one interval. A scheduled run is disarmed and never starts. Otherwise
    /// this is a no-op, so the call currently never fails.
    pub fn cancel(&self) -> Result<DeviceStatus> {
        let action = self.state.update(|status| match status {
            DeviceStatus::Running { .. } => {
                *status = DeviceStatus::Cancelled;
                CancelAction::Signalled
            }
            DeviceStatus::Scheduled { .. } => CancelAction::Disarm,
            _ => CancelAction::Nothing,
        });

        match action {
            CancelAction::Signalled => info!("cancellation requested"),
            CancelAction::Disarm => {
                if !self.scheduler.cancel_scheduled() {
                    // The timer claimed the device first; stop the loop instead.
                    self.signal_running();
                }
            }
            CancelAction::Nothing => debug!("nothing to cancel"),
        }
        Ok(self.state.read())
    }

    fn signal_running(&self) {
        self.state.update(|status| {
            if matches!(status, DeviceStatus::Running { .. }) {
                *status = DeviceStatus::Cancelled;
                info!("cancellation requested");
            }
        });
    }

    /// Current camera configuration.
    pub fn camera_config(&self) -> Value {
        self.camera
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .to_value()
    }

    /// Validate `value` and swap it in as the camera configuration.
    ///
    /// Its optional `resolution` applies to timelapses started afterwards.
    pub fn replace_camera_config(&self, value: Value) -> Result<Value> {
        let config = CameraConfig::try_from(value)
            .inspect_err(|err| warn!(error = %err, "camera configuration rejected"))?;
        let applied = config.to_value();
        info!(
            title = ?config.title(),
            resolution = ?config.resolution(),
            "camera configuration replaced"
        );
        *self.camera.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(applied)
    }

    fn timelapse_resolution(&self) -> Resolution {
        self.camera
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resolution()
            .unwrap_or(self.settings.resolution.timelapse)
    }

    fn request(
        &self,
        output_root: &Path,
        duration: Duration,
        interval: Duration,
    ) -> TimelapseRequest {
        TimelapseRequest {
            output_root: output_root.to_path_buf(),
            duration,
            interval,
            resolution: self.timelapse_resolution(),
        }
    }
}
