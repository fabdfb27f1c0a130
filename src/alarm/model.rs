use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use chrono::{NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_LABEL: &str = "Alarm";

const WEEKDAY_TOKENS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum AlarmError {
    #[error("invalid time '{0}', expected HH:MM with hour 0-23 and minute 0-59")]
    InvalidTime(String),
    #[error("invalid day index {0}, expected 0 (Sunday) through 6 (Saturday)")]
    InvalidDay(i64),
    #[error("no alarm with id '{0}'")]
    UnknownAlarm(String),
}

/// Wall-clock time of day with minute granularity.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self, AlarmError> {
        NaiveTime::from_hms_opt(hour, minute, 0)
            .map(Self)
            .ok_or_else(|| AlarmError::InvalidTime(format!("{hour}:{minute}")))
    }

    pub fn hour(&self) -> u32 {
        self.0.hour()
    }

    pub fn minute(&self) -> u32 {
        self.0.minute()
    }

    pub fn to_naive_time(self) -> NaiveTime {
        self.0
    }
}

impl FromStr for TimeOfDay {
    type Err = AlarmError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        NaiveTime::parse_from_str(input.trim(), "%H:%M")
            .map(Self)
            .map_err(|_| AlarmError::InvalidTime(input.to_string()))
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Alarm {
    pub id: String,
    pub time: TimeOfDay,
    pub label: String,
    /// Weekday indices, 0 = Sunday. Sorted and unique; empty means one-shot.
    pub days: Vec<u8>,
    pub is_active: bool,
}

impl Alarm {
    pub fn is_one_shot(&self) -> bool {
        self.days.is_empty()
    }

    pub fn repeats_on(&self, day: Weekday) -> bool {
        self.days.contains(&weekday_index(day))
    }

    pub fn repeat_summary(&self) -> String {
        if self.days.is_empty() {
            return "Once".to_string();
        }
        self.days
            .iter()
            .map(|day| WEEKDAY_TOKENS[usize::from(*day)])
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// User-submitted alarm fields, validated by the store on `add`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlarmDefinition {
    pub time: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub days: Vec<i64>,
}

impl AlarmDefinition {
    pub fn new(time: impl Into<String>, label: Option<String>, days: Vec<i64>) -> Self {
        Self {
            time: time.into(),
            label,
            days,
        }
    }

    pub(crate) fn validate(&self) -> Result<(TimeOfDay, String, Vec<u8>), AlarmError> {
        let time = self.time.parse::<TimeOfDay>()?;
        let days = normalize_days(&self.days)?;
        let label = match self.label.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => DEFAULT_LABEL.to_string(),
        };
        Ok((time, label, days))
    }
}

pub fn weekday_index(day: Weekday) -> u8 {
    day.num_days_from_sunday() as u8
}

pub(crate) fn normalize_days(raw: &[i64]) -> Result<Vec<u8>, AlarmError> {
    let mut days = BTreeSet::new();
    for day in raw {
        if !(0..=6).contains(day) {
            return Err(AlarmError::InvalidDay(*day));
        }
        days.insert(*day as u8);
    }
    Ok(days.into_iter().collect())
}

pub fn load_alarm_file(path: &Path) -> Result<Vec<Alarm>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("unable to read alarm file {}", path.display()));
        }
    };
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    parse_alarm_file_text(&content)
}

/// Parses the persisted alarm list. Records that fail validation are dropped
/// with a warning; only a broken document as a whole is an error.
pub fn parse_alarm_file_text(content: &str) -> Result<Vec<Alarm>> {
    let raw = serde_json::from_str::<Value>(content).map_err(|err| {
        let line = err.line();
        let column = err.column();
        anyhow::anyhow!("invalid JSON at line {line}, column {column}: {err}")
    })?;
    let Value::Array(records) = raw else {
        bail!("alarm file must contain a JSON array of alarm records");
    };

    let mut ids = HashSet::new();
    let mut alarms = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        let alarm = match parse_record(record) {
            Ok(alarm) => alarm,
            Err(err) => {
                warn!(index, "dropping malformed alarm record: {err:#}");
                continue;
            }
        };
        if !ids.insert(alarm.id.clone()) {
            warn!(index, alarm_id = %alarm.id, "dropping alarm record with duplicate id");
            continue;
        }
        alarms.push(alarm);
    }
    Ok(alarms)
}

pub fn save_alarm_file(path: &Path, alarms: &[Alarm]) -> Result<()> {
    let text = alarm_file_text(alarms)?;
    fs::write(path, text)
        .with_context(|| format!("unable to write alarm file {}", path.display()))?;
    Ok(())
}

pub fn alarm_file_text(alarms: &[Alarm]) -> Result<String> {
    let records = alarms.iter().map(AlarmRecord::from).collect::<Vec<_>>();
    let text = serde_json::to_string_pretty(&records)?;
    Ok(format!("{text}\n"))
}

fn parse_record(value: Value) -> Result<Alarm> {
    let record = serde_json::from_value::<AlarmRecord>(value)?;
    if record.id.trim().is_empty() {
        bail!("alarm id must not be empty");
    }
    let time = record.time.parse::<TimeOfDay>()?;
    let days = normalize_days(&record.days)
        .with_context(|| format!("alarm '{}' has an invalid repeat day", record.id))?;
    Ok(Alarm {
        id: record.id,
        time,
        label: record.label,
        days,
        is_active: record.is_active,
    })
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlarmRecord {
    id: String,
    time: String,
    #[serde(default = "default_label")]
    label: String,
    #[serde(default)]
    days: Vec<i64>,
    #[serde(default = "default_active")]
    is_active: bool,
}

impl From<&Alarm> for AlarmRecord {
    fn from(alarm: &Alarm) -> Self {
        Self {
            id: alarm.id.clone(),
            time: alarm.time.to_string(),
            label: alarm.label.clone(),
            days: alarm.days.iter().map(|day| i64::from(*day)).collect(),
            is_active: alarm.is_active,
        }
    }
}

fn default_label() -> String {
    DEFAULT_LABEL.to_string()
}

fn default_active() -> bool {
    true
}
