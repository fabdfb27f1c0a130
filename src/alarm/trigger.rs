use std::collections::VecDeque;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use tracing::info;

use crate::alarm::model::Alarm;

/// Receives alarms as they fire. Implementations must return promptly; the
/// scheduler calls them inline and does not retry on error.
///
/// `due_at` is the occurrence the alarm fired for, read from the scheduler's
/// clock rather than the wall clock.
pub trait TriggerSink: Send {
    fn on_alarm_fired(&mut self, alarm: &Alarm, due_at: DateTime<FixedOffset>) -> Result<()>;
}

/// Writes one log line per fired alarm.
#[derive(Debug, Default)]
pub struct LogSink;

impl TriggerSink for LogSink {
    fn on_alarm_fired(&mut self, alarm: &Alarm, due_at: DateTime<FixedOffset>) -> Result<()> {
        info!(
            alarm_id = %alarm.id,
            due_at = %due_at.to_rfc3339(),
            "alarm fired: {}",
            alarm.label
        );
        Ok(())
    }
}

/// Spawns a shell command per fired alarm without waiting for it.
#[derive(Debug, Clone)]
pub struct CommandSink {
    command: String,
}

impl CommandSink {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn shell(&self) -> Command {
        #[cfg(windows)]
        {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(&self.command);
            cmd
        }

        #[cfg(not(windows))]
        {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.command);
            cmd
        }
    }
}

impl TriggerSink for CommandSink {
    fn on_alarm_fired(&mut self, alarm: &Alarm, due_at: DateTime<FixedOffset>) -> Result<()> {
        let mut child = self
            .shell()
            .env("ALARM_ID", &alarm.id)
            .env("ALARM_LABEL", &alarm.label)
            .env("ALARM_TIME", alarm.time.to_string())
            .env("ALARM_DUE_AT", due_at.to_rfc3339())
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn on-fire command '{}'", self.command))?;
        // Reap in the background so the scheduler never waits on the command.
        thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FiredRecord {
    pub alarm_id: String,
    pub label: String,
    pub time: String,
    pub due_at: String,
}

/// Bounded history of recent fires, shared with the HTTP API.
#[derive(Debug, Clone)]
pub struct FiredLog {
    capacity: usize,
    records: Arc<Mutex<VecDeque<FiredRecord>>>,
}

impl FiredLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.max(1)))),
        }
    }

    /// Most recent first.
    pub fn recent(&self) -> Vec<FiredRecord> {
        match self.records.lock() {
            Ok(records) => records.iter().rev().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl TriggerSink for FiredLog {
    fn on_alarm_fired(&mut self, alarm: &Alarm, due_at: DateTime<FixedOffset>) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow!("fired alarm history lock poisoned"))?;
        if records.len() == self.capacity {
            let _ = records.pop_front();
        }
        records.push_back(FiredRecord {
            alarm_id: alarm.id.clone(),
            label: alarm.label.clone(),
            time: alarm.time.to_string(),
            due_at: due_at.to_rfc3339(),
        });
        Ok(())
    }
}

/// Forwards every alarm to each inner sink. All sinks are called even when an
/// earlier one fails; the first failure is returned.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn TriggerSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl TriggerSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl TriggerSink for FanoutSink {
    fn on_alarm_fired(&mut self, alarm: &Alarm, due_at: DateTime<FixedOffset>) -> Result<()> {
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(err) = sink.on_alarm_fired(alarm, due_at) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
