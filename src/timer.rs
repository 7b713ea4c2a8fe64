//! One-shot delayed trigger that can be disarmed before it fires.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{after, bounded, select, Sender};
use tracing::debug;

/// Spawns one-shot timers on dedicated threads.
pub struct OneShotTimer;

impl OneShotTimer {
    /// Run `callback` on a thread named `name` once `delay` has elapsed,
    /// unless the returned handle is disarmed or dropped first.
    ///
    /// A delay too large to be represented never fires.
    pub fn arm<F>(name: &str, delay: Duration, callback: F) -> std::io::Result<TimerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let (disarm, disarmed) = bounded::<()>(1);

        thread::Builder::new().name(name.to_owned()).spawn(move || {
            select! {
                recv(disarmed) -> _ => debug!("timer disarmed"),
                recv(after(delay)) -> _ => callback(),
            }
        })?;

        Ok(TimerHandle { disarm })
    }
}

/// Handle on an armed timer. Dropping it disarms the timer.
///
/// Disarming races with the deadline: a callback that was already chosen
/// still runs, so callers that need a definite answer must decide it under
/// their own lock.
#[derive(Debug)]
pub struct TimerHandle {
    disarm: Sender<()>,
}

impl TimerHandle {
    /// Disarm the timer.
    pub fn disarm(self) {
        // A closed channel means the timer thread already returned.
        let _ = self.disarm.try_send(());
    }
}
