use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Local, TimeZone};
use tracing::{debug, trace};

/// Longest uninterrupted wait of a system timer before it re-reads the wall
/// clock. Bounds how late a timer fires after a clock jump or device sleep.
const MAX_WAIT_SLICE: StdDuration = StdDuration::from_secs(1);

/// Identifies one scheduled timer. Handles are never reused by a clock.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Source of wall-clock time and one-shot timers.
///
/// A timer does not run a callback itself: on expiry its handle is delivered
/// to whoever drives the engine, which then calls `AlarmEngine::on_fire`.
pub trait Clock: Send {
    type Tz: TimeZone + Send;

    fn now(&self) -> DateTime<Self::Tz>;
    fn schedule(&mut self, delay: Duration) -> TimerHandle;
    fn cancel(&mut self, handle: TimerHandle);
}

/// Local-time clock backed by one waiting thread per outstanding timer.
pub struct SystemClock {
    next_id: u64,
    timers: HashMap<TimerHandle, Sender<()>>,
    fired_tx: Sender<TimerHandle>,
}

impl SystemClock {
    /// Returns the clock and the receiving end of its expiry channel.
    pub fn new() -> (Self, Receiver<TimerHandle>) {
        let (fired_tx, fired_rx) = mpsc::channel();
        let clock = Self {
            next_id: 1,
            timers: HashMap::new(),
            fired_tx,
        };
        (clock, fired_rx)
    }
}

impl Clock for SystemClock {
    type Tz = Local;

    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn schedule(&mut self, delay: Duration) -> TimerHandle {
        let handle = TimerHandle(self.next_id);
        self.next_id += 1;

        let deadline = Local::now() + delay;
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let fired_tx = self.fired_tx.clone();
        thread::spawn(move || {
            if wait_until(deadline, &cancel_rx) {
                trace!(timer = handle.id(), "timer expired");
                let _ = fired_tx.send(handle);
            }
        });
        self.timers.insert(handle, cancel_tx);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        // Dropping the sender disconnects the waiting thread.
        if self.timers.remove(&handle).is_some() {
            debug!(timer = handle.id(), "timer cancelled");
        }
    }
}

/// Waits for the wall clock to reach `deadline`. Returns `false` if the timer
/// was cancelled first.
fn wait_until(deadline: DateTime<Local>, cancel_rx: &Receiver<()>) -> bool {
    loop {
        let remaining = deadline - Local::now();
        let Ok(remaining) = remaining.to_std() else {
            return true;
        };
        if remaining.is_zero() {
            return true;
        }
        match cancel_rx.recv_timeout(remaining.min(MAX_WAIT_SLICE)) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return false,
        }
    }
}

#[cfg(test)]
pub mod manual {
    use std::sync::{Arc, Mutex, MutexGuard};

    use super::*;

    #[derive(Debug)]
    struct ManualState<Tz: TimeZone> {
        now: DateTime<Tz>,
        auto_advance: Duration,
        next_id: u64,
        pending: Vec<(TimerHandle, DateTime<Tz>)>,
    }

    /// Test clock whose time only moves when told to.
    #[derive(Debug, Clone)]
    pub struct ManualClock<Tz: TimeZone> {
        state: Arc<Mutex<ManualState<Tz>>>,
    }

    impl<Tz> ManualClock<Tz>
    where
        Tz: TimeZone + Send,
        Tz::Offset: Send,
    {
        pub fn new(now: DateTime<Tz>) -> Self {
            Self {
                state: Arc::new(Mutex::new(ManualState {
                    now,
                    auto_advance: Duration::zero(),
                    next_id: 1,
                    pending: Vec::new(),
                })),
            }
        }

        fn lock(&self) -> MutexGuard<'_, ManualState<Tz>> {
            self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        /// Moves time forward by `step` after every `now()` read.
        pub fn set_auto_advance(&self, step: Duration) {
            self.lock().auto_advance = step;
        }

        /// Outstanding timers as `(handle, deadline)`.
        pub fn pending(&self) -> Vec<(TimerHandle, DateTime<Tz>)> {
            self.lock().pending.clone()
        }

        /// Sets the clock to `to` and returns every timer that expired, in
        /// deadline order. Expired timers are no longer pending.
        pub fn advance_to(&self, to: DateTime<Tz>) -> Vec<TimerHandle> {
            let mut state = self.lock();
            state.now = to.clone();
            let mut expired = state
                .pending
                .iter()
                .filter(|(_, deadline)| *deadline <= to)
                .cloned()
                .collect::<Vec<_>>();
            state.pending.retain(|(_, deadline)| *deadline > to);
            expired.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
            expired.into_iter().map(|(handle, _)| handle).collect()
        }
    }

    impl<Tz> Clock for ManualClock<Tz>
    where
        Tz: TimeZone + Send,
        Tz::Offset: Send,
    {
        type Tz = Tz;

        fn now(&self) -> DateTime<Tz> {
            let mut state = self.lock();
            let now = state.now.clone();
            let step = state.auto_advance;
            state.now = now.clone() + step;
            now
        }

        fn schedule(&mut self, delay: Duration) -> TimerHandle {
            let mut state = self.lock();
            let handle = TimerHandle(state.next_id);
            state.next_id += 1;
            let deadline = state.now.clone() + delay;
            state.pending.push((handle, deadline));
            handle
        }

        fn cancel(&mut self, handle: TimerHandle) {
            self.lock().pending.retain(|(pending, _)| *pending != handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use super::*;

    #[test]
    fn system_timer_delivers_handle_on_expiry() {
        let (mut clock, fired_rx) = SystemClock::new();
        let handle = clock.schedule(Duration::milliseconds(20));
        let delivered = fired_rx
            .recv_timeout(StdDuration::from_secs(2))
            .expect("timer should fire");
        assert_eq!(delivered, handle);
    }

    #[test]
    fn cancelled_system_timer_never_fires() {
        let (mut clock, fired_rx) = SystemClock::new();
        let handle = clock.schedule(Duration::milliseconds(50));
        clock.cancel(handle);
        assert!(fired_rx.recv_timeout(StdDuration::from_millis(300)).is_err());
    }

    #[test]
    fn handles_are_unique() {
        let (mut clock, _fired_rx) = SystemClock::new();
        let first = clock.schedule(Duration::hours(1));
        let second = clock.schedule(Duration::hours(1));
        assert_ne!(first, second);
        clock.cancel(first);
        clock.cancel(second);
    }
}
