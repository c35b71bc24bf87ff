//! Background recovery loop for the quarantine manager.

use crate::manager::QuarantineManager;
use crate::state::QuarantineManagerState;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Wait between monitor ticks: doubles after each failed tick up to `max`,
/// back to `initial` after a healthy one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Wait to apply after a tick with the given outcome.
    pub fn next_wait(&mut self, healthy: bool) -> Duration {
        if healthy {
            self.current = self.initial;
            return self.current;
        }
        let wait = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        wait
    }
}

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for up to `timeout`. Returns `true` once stopped.
    fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.wake
                .wait_while_for(&mut stopped, |stopped| !*stopped, timeout);
        }
        *stopped
    }
}

/// Keeps the manager initialised, recovering a corrupt database when needed.
pub struct StateMonitor {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl StateMonitor {
    pub fn start(manager: Arc<QuarantineManager>, backoff: Backoff) -> io::Result<Self> {
        let signal = Arc::new(StopSignal::default());
        let thread_signal = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("safestore-monitor".to_string())
            .spawn(move || run(&manager, &thread_signal, backoff))?;
        info!("SafeStore state monitor started");
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Wake the loop and wait for it to exit.
    pub fn stop(&mut self) {
        self.signal.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("SafeStore state monitor thread panicked");
            } else {
                info!("SafeStore state monitor stopped");
            }
        }
    }
}

impl Drop for StateMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(manager: &QuarantineManager, signal: &StopSignal, mut backoff: Backoff) {
    loop {
        if signal.is_stopped() {
            return;
        }
        let healthy = tick(manager);
        let wait = backoff.next_wait(healthy);
        debug!(healthy, wait_secs = wait.as_secs_f64(), "SafeStore monitor tick");
        if signal.wait(wait) {
            return;
        }
    }
}

/// One pass of the recovery loop. Returns whether the manager ends up
/// initialised.
pub fn tick(manager: &QuarantineManager) -> bool {
    match manager.state() {
        QuarantineManagerState::Initialised => true,
        QuarantineManagerState::Startup | QuarantineManagerState::Uninitialised => {
            manager.initialise()
        }
        QuarantineManagerState::Corrupt => recover_corrupt(manager),
    }
}

fn recover_corrupt(manager: &QuarantineManager) -> bool {
    if manager.remove_stale_lock() && manager.initialise() {
        info!("SafeStore recovered after removing a stale lock");
        return true;
    }

    warn!("SafeStore database is corrupt, recreating it");
    if !manager.delete_database() {
        error!("Unable to recreate corrupt SafeStore database");
        return false;
    }
    manager.initialise()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_backoff_doubles_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(300));
        assert_eq!(backoff.next_wait(false), Duration::from_secs(60));
        assert_eq!(backoff.next_wait(false), Duration::from_secs(120));
        assert_eq!(backoff.next_wait(false), Duration::from_secs(240));
        assert_eq!(backoff.next_wait(false), Duration::from_secs(300));
        assert_eq!(backoff.next_wait(false), Duration::from_secs(300));
        assert_eq!(backoff.next_wait(true), Duration::from_secs(60));
        assert_eq!(backoff.current(), Duration::from_secs(60));
    }

    #[test]
    fn test_max_below_initial_is_raised() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(backoff.next_wait(false), Duration::from_secs(10));
        assert_eq!(backoff.next_wait(false), Duration::from_secs(10));
    }

    #[test]
    fn test_stop_signal_wakes_waiter() {
        let signal = Arc::new(StopSignal::default());
        let waiter = Arc::clone(&signal);
        let handle = thread::spawn(move || waiter.wait(Duration::from_secs(3600)));
        signal.stop();
        assert!(handle.join().unwrap());
        assert!(!StopSignal::default().wait(Duration::from_millis(1)));
    }

    proptest! {
        #[test]
        fn prop_failed_waits_monotone_and_capped(
            initial in 1u64..1_000,
            factor in 1u64..64,
            failures in 1usize..40,
        ) {
            let initial = Duration::from_millis(initial);
            let max = initial * factor as u32;
            let mut backoff = Backoff::new(initial, max);
            let mut previous = Duration::ZERO;
            for _ in 0..failures {
                let wait = backoff.next_wait(false);
                prop_assert!(wait >= previous);
                prop_assert!(wait <= max);
                previous = wait;
            }
            prop_assert_eq!(backoff.next_wait(true), initial);
        }
    }
}
