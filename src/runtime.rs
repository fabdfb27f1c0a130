use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::alarm::scheduler::AlarmEngine;
use crate::clock::{SystemClock, TimerHandle};

/// Engine shared between the scheduler loop and the HTTP API.
pub type SharedEngine = Arc<Mutex<AlarmEngine<SystemClock>>>;

const STOP_POLL: Duration = Duration::from_millis(200);

/// Delivers expired timers to the engine until `stop` is set or every timer
/// sender is gone.
pub fn run_scheduler_loop(
    engine: SharedEngine,
    fired: Receiver<TimerHandle>,
    stop: Arc<AtomicBool>,
) {
    info!("scheduler loop started");
    while !stop.load(Ordering::Relaxed) {
        let handle = match fired.recv_timeout(STOP_POLL) {
            Ok(handle) => handle,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("timer channel closed");
                break;
            }
        };
        match engine.lock() {
            Ok(mut guard) => guard.on_fire(handle),
            Err(_) => {
                error!("alarm engine lock poisoned, stopping scheduler loop");
                break;
            }
        }
    }
    info!("scheduler loop stopped");
}

#[cfg(test)]
mod tests {
    use std::thread;

    use chrono::{Duration as ChronoDuration, Local, Timelike};

    use super::*;
    use crate::alarm::model::{AlarmDefinition, TimeOfDay};
    use crate::alarm::scheduler::{OneShotPolicy, SchedulerPhase};
    use crate::alarm::store::AlarmStore;
    use crate::alarm::store::testing::MemoryBackend;
    use crate::alarm::trigger::FiredLog;
    use crate::clock::Clock;

    #[test]
    fn loop_exits_when_stop_is_set() {
        let (clock, fired_rx) = SystemClock::new();
        let store = AlarmStore::open(MemoryBackend::default()).expect("open");
        let engine = Arc::new(Mutex::new(AlarmEngine::new(
            store,
            clock,
            FiredLog::new(4),
            OneShotPolicy::default(),
        )));
        let stop = Arc::new(AtomicBool::new(false));

        let join = {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            thread::spawn(move || run_scheduler_loop(engine, fired_rx, stop))
        };
        stop.store(true, Ordering::Relaxed);
        join.join().expect("loop thread");

        let guard = engine.lock().expect("engine");
        assert_eq!(guard.state().phase, SchedulerPhase::Idle);
    }

    #[test]
    fn stale_handles_from_channel_do_not_fire() {
        let (mut clock, fired_rx) = SystemClock::new();
        let stale = clock.schedule(ChronoDuration::milliseconds(10));
        clock.cancel(stale);

        let history = FiredLog::new(4);
        let store = AlarmStore::open(MemoryBackend::default()).expect("open");
        let mut engine = AlarmEngine::new(store, clock, history.clone(), OneShotPolicy::default());
        // An alarm a minute or more away keeps the armed timer well in the future.
        let later = (Local::now() + ChronoDuration::minutes(2)).time();
        let time = TimeOfDay::new(later.hour(), later.minute()).expect("time");
        engine
            .add(&AlarmDefinition::new(time.to_string(), None, vec![]))
            .expect("add");
        engine.on_fire(stale);

        assert!(history.recent().is_empty());
        assert_eq!(engine.state().phase, SchedulerPhase::Armed);
        drop(fired_rx);
    }
}
