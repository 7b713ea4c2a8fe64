//! Delayed start of timelapse runs.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::capture::{CaptureLoop, TimelapseRequest};
use crate::driver::CaptureDriver;
use crate::error::{ControlError, Result};
use crate::state::{DeviceState, DeviceStatus};
use crate::timer::{OneShotTimer, TimerHandle};

struct PendingRun {
    ticket: u64,
    timer: TimerHandle,
}

#[derive(Default)]
struct Slot {
    next_ticket: u64,
    pending: Option<PendingRun>,
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Arms at most one delayed timelapse and disarms it on request.
///
/// Arming, disarming and the timer's own claim of the device are serialized on
/// one lock, and every armed run carries a ticket. A timer whose ticket is no
/// longer pending does nothing, so a cancelled run never starts even if its
/// timer already fired.
pub struct Scheduler<D: CaptureDriver> {
    state: Arc<DeviceState>,
    capture: CaptureLoop<D>,
    slot: Arc<Mutex<Slot>>,
}

impl<D: CaptureDriver> Scheduler<D> {
    /// Create a scheduler starting runs through `capture`.
    pub fn new(state: Arc<DeviceState>, capture: CaptureLoop<D>) -> Self {
        Self {
            state,
            capture,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Start `request` after `delay`. Returns immediately.
    ///
    /// Fails with `AlreadyBusy` while a run is scheduled or alive.
    pub fn schedule(&self, delay: Duration, request: TimelapseRequest) -> Result<()> {
        request.validate()?;
        if Instant::now().checked_add(delay).is_none() {
            return Err(ControlError::Validation(format!(
                "delay of {delay:?} is too large"
            )));
        }

        let mut slot = lock(&self.slot);
        let previous = self.state.update(|status| {
            if status.is_busy() {
                return Err(ControlError::AlreadyBusy(status.kind()));
            }
            let previous = *status;
            *status = DeviceStatus::Scheduled {
                delay,
                duration: request.duration,
                interval: request.interval,
            };
            Ok(previous)
        })?;

        slot.next_ticket += 1;
        let ticket = slot.next_ticket;
        let on_fire = {
            let slot = Arc::clone(&self.slot);
            let capture = self.capture.clone();
            let request = request.clone();
            move || fire(&slot, ticket, &capture, request)
        };

        match OneShotTimer::arm("timelapse-timer", delay, on_fire) {
            Ok(timer) => {
                slot.pending = Some(PendingRun { ticket, timer });
                info!(
                    ?delay,
                    duration = ?request.duration,
                    interval = ?request.interval,
                    "timelapse scheduled"
                );
                Ok(())
            }
            Err(err) => {
                self.state.publish(previous);
                Err(ControlError::Spawn(err))
            }
        }
    }

    /// Disarm the pending run, if any, and return the device to `Idle`.
    ///
    /// Returns false when nothing was pending, which includes a run whose
    /// timer already fired and claimed the device.
    pub fn cancel_scheduled(&self) -> bool {
        let mut slot = lock(&self.slot);
        let Some(pending) = slot.pending.take() else {
            return false;
        };

        pending.timer.disarm();
        debug!(ticket = pending.ticket, "scheduled run disarmed");
        self.state.update(|status| {
            if matches!(status, DeviceStatus::Scheduled { .. }) {
                *status = DeviceStatus::Idle;
            }
        });
        info!("scheduled timelapse cancelled");
        true
    }

    /// Whether a run is armed and has not claimed the device yet.
    pub fn is_pending(&self) -> bool {
        lock(&self.slot).pending.is_some()
    }
}

fn fire<D: CaptureDriver>(
    slot: &Mutex<Slot>,
    ticket: u64,
    capture: &CaptureLoop<D>,
    request: TimelapseRequest,
) {
    {
        let mut slot = lock(slot);
        if slot.pending.as_ref().map(|pending| pending.ticket) != Some(ticket) {
            debug!(ticket, "stale timer ignored");
            return;
        }
        slot.pending = None;

        if let Err(err) = capture.enter(request.duration, request.interval) {
            warn!(error = %err, "scheduled timelapse not started");
            return;
        }
    }

    if let Err(err) = capture.run_request(request) {
        debug!(error = %err, "scheduled timelapse ended with an error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Resolution;
    use crate::mock::MockDriver;
    use crate::state::StatusKind;
    use std::thread;

    fn setup(driver: MockDriver) -> (Scheduler<MockDriver>, Arc<DeviceState>) {
        let state = Arc::new(DeviceState::new());
        let capture = CaptureLoop::new(Arc::clone(&state), Arc::new(Mutex::new(driver)));
        (Scheduler::new(Arc::clone(&state), capture), state)
    }

    fn request(duration_ms: u64, interval_ms: u64) -> TimelapseRequest {
        TimelapseRequest {
            output_root: std::env::temp_dir().join("pi-timelapse-scheduler"),
            duration: Duration::from_millis(duration_ms),
            interval: Duration::from_millis(interval_ms),
            resolution: Resolution::new(640, 480),
        }
    }

    #[test]
    fn test_schedule_publishes_scheduled_and_returns_immediately() {
        let (scheduler, state) = setup(MockDriver::new());

        scheduler
            .schedule(Duration::from_secs(5), request(10_000, 2000))
            .expect("schedule failed");

        assert_eq!(
            state.read(),
            DeviceStatus::Scheduled {
                delay: Duration::from_secs(5),
                duration: Duration::from_secs(10),
                interval: Duration::from_secs(2),
            }
        );
        assert!(scheduler.is_pending());
        assert!(scheduler.cancel_scheduled());
    }

    #[test]
    fn test_schedule_rejects_busy_device() {
        let (scheduler, state) = setup(MockDriver::new());
        scheduler
            .schedule(Duration::from_secs(5), request(1000, 100))
            .expect("schedule failed");
        let before = state.read();

        let result = scheduler.schedule(Duration::from_secs(1), request(2000, 200));
        assert!(matches!(
            result,
            Err(ControlError::AlreadyBusy(StatusKind::Scheduled))
        ));
        assert_eq!(state.read(), before);
        assert!(scheduler.cancel_scheduled());
    }

    #[test]
    fn test_unrepresentable_delay_is_rejected_before_transition() {
        let (scheduler, state) = setup(MockDriver::new());

        let result = scheduler.schedule(Duration::MAX, request(1000, 100));
        assert!(matches!(result, Err(ControlError::Validation(_))));
        assert_eq!(state.read(), DeviceStatus::Idle);
        assert!(!scheduler.is_pending());

        scheduler
            .schedule(Duration::from_secs(5), request(1000, 100))
            .expect("schedule after rejection failed");
        assert!(scheduler.cancel_scheduled());
    }

    #[test]
    fn test_cancel_before_fire_never_captures() {
        let driver = MockDriver::new();
        let log = driver.log();
        let (scheduler, state) = setup(driver);

        scheduler
            .schedule(Duration::from_millis(80), request(200, 20))
            .expect("schedule failed");
        assert!(scheduler.cancel_scheduled());
        assert_eq!(state.read(), DeviceStatus::Idle);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(state.read(), DeviceStatus::Idle);
        assert_eq!(log.opens(), 0);
        assert_eq!(log.frame_count(), 0);
    }

    #[test]
    fn test_cancel_without_pending_run_is_noop() {
        let (scheduler, state) = setup(MockDriver::new());
        assert!(!scheduler.cancel_scheduled());
        assert_eq!(state.read(), DeviceStatus::Idle);
    }

    #[test]
    fn test_fired_timer_runs_timelapse() {
        let driver = MockDriver::new();
        let log = driver.log();
        let (scheduler, state) = setup(driver);

        scheduler
            .schedule(Duration::from_millis(30), request(100, 20))
            .expect("schedule failed");

        thread::sleep(Duration::from_millis(80));
        assert_eq!(state.read().kind(), StatusKind::Running);
        assert!(!scheduler.is_pending());
        assert!(!scheduler.cancel_scheduled());

        thread::sleep(Duration::from_millis(250));
        assert_eq!(state.read(), DeviceStatus::Idle);
        assert!(log.frame_count() >= 3);
        assert_eq!(log.closes(), 1);
    }

    #[test]
    fn test_rescheduling_after_cancel_ignores_old_timer() {
        let driver = MockDriver::new();
        let log = driver.log();
        let (scheduler, state) = setup(driver);

        scheduler
            .schedule(Duration::from_millis(40), request(100, 20))
            .expect("schedule failed");
        assert!(scheduler.cancel_scheduled());
        scheduler
            .schedule(Duration::from_secs(5), request(100, 20))
            .expect("reschedule failed");

        thread::sleep(Duration::from_millis(120));
        assert_eq!(state.read().kind(), StatusKind::Scheduled);
        assert_eq!(log.opens(), 0);
        assert!(scheduler.cancel_scheduled());
    }
}
