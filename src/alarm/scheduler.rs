use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike};
use tracing::{debug, error, info, warn};

use crate::alarm::model::{Alarm, AlarmDefinition, AlarmError};
use crate::alarm::occurrence::next_occurrence;
use crate::alarm::store::AlarmStore;
use crate::alarm::trigger::TriggerSink;
use crate::clock::{Clock, TimerHandle};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SchedulerPhase {
    Idle,
    Armed,
    Firing,
}

/// What happens to an alarm without repeat days once it has fired.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum OneShotPolicy {
    /// Mark the alarm inactive so it fires exactly once.
    #[default]
    Deactivate,
    /// Leave it active; it fires again the next day at the same time.
    RollOver,
}

#[derive(Debug, Clone)]
pub struct SchedulerState<Tz: TimeZone> {
    pub phase: SchedulerPhase,
    pub armed_target: Option<DateTime<Tz>>,
}

#[derive(Debug, Clone)]
struct ArmedTimer<Tz: TimeZone> {
    target: DateTime<Tz>,
    handle: TimerHandle,
}

/// Owns the alarm store, the clock and the single outstanding timer.
///
/// Every mutation goes through the engine so that persisting and rearming
/// happen together. Callers sharing an engine across threads must hold one
/// lock around each call.
pub struct AlarmEngine<C: Clock> {
    store: AlarmStore,
    clock: C,
    sink: Box<dyn TriggerSink>,
    one_shot_policy: OneShotPolicy,
    phase: SchedulerPhase,
    armed: Option<ArmedTimer<C::Tz>>,
}

impl<C> AlarmEngine<C>
where
    C: Clock,
    <C::Tz as TimeZone>::Offset: Copy,
{
    /// Builds the engine and arms it for the stored alarms.
    pub fn new(
        store: AlarmStore,
        clock: C,
        sink: impl TriggerSink + 'static,
        one_shot_policy: OneShotPolicy,
    ) -> Self {
        let mut engine = Self {
            store,
            clock,
            sink: Box::new(sink),
            one_shot_policy,
            phase: SchedulerPhase::Idle,
            armed: None,
        };
        engine.rearm();
        engine
    }

    pub fn state(&self) -> SchedulerState<C::Tz> {
        SchedulerState {
            phase: self.phase,
            armed_target: self.armed_target(),
        }
    }

    pub fn armed_target(&self) -> Option<DateTime<C::Tz>> {
        self.armed.as_ref().map(|armed| armed.target.clone())
    }

    pub fn list(&self) -> &[Alarm] {
        self.store.list()
    }

    pub fn get(&self, id: &str) -> Option<&Alarm> {
        self.store.get(id)
    }

    pub fn last_persist_error(&self) -> Option<&str> {
        self.store.last_persist_error()
    }

    pub fn now(&self) -> DateTime<C::Tz> {
        self.clock.now()
    }

    pub fn add(&mut self, definition: &AlarmDefinition) -> Result<Alarm, AlarmError> {
        let alarm = self.store.add(definition)?;
        info!(alarm_id = %alarm.id, time = %alarm.time, "alarm added");
        self.rearm();
        Ok(alarm)
    }

    pub fn toggle(&mut self, id: &str, active: bool) -> Result<(), AlarmError> {
        if !self.store.toggle(id, active) {
            return Err(AlarmError::UnknownAlarm(id.to_string()));
        }
        info!(alarm_id = %id, active, "alarm toggled");
        self.rearm();
        Ok(())
    }

    pub fn delete(&mut self, id: &str) -> Result<Alarm, AlarmError> {
        let removed = self
            .store
            .delete(id)
            .ok_or_else(|| AlarmError::UnknownAlarm(id.to_string()))?;
        info!(alarm_id = %id, "alarm deleted");
        self.rearm();
        Ok(removed)
    }

    /// Every stored alarm with its next occurrence; inactive alarms have none.
    pub fn upcoming(&self) -> Vec<(Alarm, Option<DateTime<C::Tz>>)> {
        let now = self.clock.now();
        self.store
            .list()
            .iter()
            .map(|alarm| {
                let next = if alarm.is_active {
                    next_occurrence(alarm, &now)
                } else {
                    None
                };
                (alarm.clone(), next)
            })
            .collect()
    }

    /// The earliest next occurrence across active alarms and every alarm due
    /// at that instant, in stored order.
    pub fn next_due(&self) -> Option<(DateTime<C::Tz>, Vec<Alarm>)> {
        next_due_at(&self.store, &self.clock.now())
    }

    /// Cancels the outstanding timer and arms one for the earliest next
    /// occurrence. A target that is already due fires in place.
    pub fn rearm(&mut self) {
        loop {
            self.cancel_armed();
            let now = self.clock.now();
            let Some(target) = earliest_occurrence(&self.store, &now) else {
                self.phase = SchedulerPhase::Idle;
                debug!("no active alarms, scheduler idle");
                return;
            };

            let delay = target.clone() - self.clock.now();
            if delay > Duration::zero() {
                let handle = self.clock.schedule(delay);
                debug!(
                    target = %target.naive_local(),
                    delay_ms = delay.num_milliseconds(),
                    timer = handle.id(),
                    "scheduler armed"
                );
                self.armed = Some(ArmedTimer { target, handle });
                self.phase = SchedulerPhase::Armed;
                return;
            }

            info!(
                target = %target.naive_local(),
                "next occurrence already due, firing immediately"
            );
            self.fire(&target);
        }
    }

    /// Handles expiry of `handle`. Expiry of anything but the armed timer is
    /// ignored.
    pub fn on_fire(&mut self, handle: TimerHandle) {
        let Some(armed) = self.armed.take_if(|armed| armed.handle == handle) else {
            debug!(timer = handle.id(), "ignoring stale timer");
            return;
        };
        self.clock.cancel(armed.handle);
        self.fire(&armed.target);
        self.rearm();
    }

    fn fire(&mut self, target: &DateTime<C::Tz>) {
        self.phase = SchedulerPhase::Firing;
        // Re-evaluate against the current alarm set rather than remembering
        // which alarm was armed: it may have been toggled or deleted since.
        let due = match next_due_at(&self.store, &just_before(target)) {
            Some((instant, alarms)) if instant == *target => alarms,
            _ => Vec::new(),
        };
        if due.is_empty() {
            debug!(target = %target.naive_local(), "no alarm due at armed target");
        }

        let due_at = target.fixed_offset();
        for alarm in &due {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.sink.on_alarm_fired(alarm, due_at)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(alarm_id = %alarm.id, "trigger sink failed: {err:#}"),
                Err(_) => error!(alarm_id = %alarm.id, "trigger sink panicked"),
            }
            if alarm.is_one_shot() && self.one_shot_policy == OneShotPolicy::Deactivate {
                self.store.toggle(&alarm.id, false);
                debug!(alarm_id = %alarm.id, "one-shot alarm deactivated");
            }
        }
    }

    fn cancel_armed(&mut self) {
        if let Some(armed) = self.armed.take() {
            self.clock.cancel(armed.handle);
        }
    }
}

fn just_before<Tz: TimeZone>(instant: &DateTime<Tz>) -> DateTime<Tz> {
    instant.clone() - Duration::nanoseconds(1)
}

fn earliest_occurrence<Tz>(store: &AlarmStore, now: &DateTime<Tz>) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    // `min` keeps the first of equal elements, i.e. stored order wins ties.
    store
        .active()
        .filter_map(|alarm| next_occurrence(alarm, now))
        .min()
}

pub fn next_due_at<Tz>(
    store: &AlarmStore,
    now: &DateTime<Tz>,
) -> Option<(DateTime<Tz>, Vec<Alarm>)>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    let target = earliest_occurrence(store, now)?;
    let due = store
        .active()
        .filter(|alarm| next_occurrence(alarm, now).as_ref() == Some(&target))
        .cloned()
        .collect();
    Some((target, due))
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TimeDisplayMode {
    Hour24,
    Hour12,
}

pub fn format_next_occurrence_with_mode<Tz: TimeZone>(
    next: Option<&DateTime<Tz>>,
    mode: TimeDisplayMode,
) -> String {
    let Some(dt) = next else {
        return "-".to_string();
    };
    let weekday = dt.weekday();
    match mode {
        TimeDisplayMode::Hour24 => format!(
            "{weekday} {:04}-{:02}-{:02} {:02}:{:02}",
            dt.year(),
            dt.month(),
            dt.day(),
            dt.hour(),
            dt.minute()
        ),
        TimeDisplayMode::Hour12 => {
            let (is_pm, hour12) = dt.hour12();
            let meridiem = if is_pm { "PM" } else { "AM" };
            format!(
                "{weekday} {:04}-{:02}-{:02} {:02}:{:02} {meridiem}",
                dt.year(),
                dt.month(),
                dt.day(),
                hour12,
                dt.minute()
            )
        }
    }
}
