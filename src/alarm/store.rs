use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::alarm::model::{
    Alarm, AlarmDefinition, AlarmError, load_alarm_file, save_alarm_file,
};

/// Where the alarm collection is persisted.
pub trait AlarmBackend: Send {
    fn load(&self) -> Result<Vec<Alarm>>;
    fn save(&self, alarms: &[Alarm]) -> Result<()>;
}

/// JSON array file, written in full on every mutation.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AlarmBackend for JsonFileBackend {
    fn load(&self) -> Result<Vec<Alarm>> {
        load_alarm_file(&self.path)
    }

    fn save(&self, alarms: &[Alarm]) -> Result<()> {
        save_alarm_file(&self.path, alarms)
    }
}

/// Exclusive advisory lock on `<alarm file>.lock`.
///
/// Held by `run` for its whole lifetime and by each editing command while it
/// writes, so only one process owns the collection at a time. The OS releases
/// the lock when the holder exits, even if it is killed.
#[derive(Debug)]
pub struct StoreLock {
    // Held only to keep the lock; released on drop.
    _file: File,
}

impl StoreLock {
    pub fn acquire(alarm_path: &Path) -> Result<Self> {
        let path = lock_path(alarm_path);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("unable to open lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            let holder = read_holder_pid(&mut file)
                .map(|pid| format!(" (pid {pid})"))
                .unwrap_or_default();
            bail!(
                "alarm file {} is in use by another alarmkeeper process{holder}; \
                 while `run` is active, change alarms through its HTTP API",
                alarm_path.display()
            );
        }

        write_holder_pid(&mut file)
            .with_context(|| format!("unable to write lock file {}", path.display()))?;
        debug!(lock = %path.display(), "alarm store lock acquired");
        Ok(Self { _file: file })
    }
}

fn lock_path(alarm_path: &Path) -> PathBuf {
    let mut name = alarm_path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn write_holder_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", process::id())
}

fn read_holder_pid(file: &mut File) -> Option<u32> {
    let mut text = String::new();
    file.read_to_string(&mut text).ok()?;
    text.trim().parse().ok()
}

/// Sole owner of the alarm collection. Every mutation is written through to
/// the backend before returning; a failed write is logged and remembered but
/// the in-memory collection stays authoritative.
pub struct AlarmStore {
    alarms: Vec<Alarm>,
    backend: Box<dyn AlarmBackend>,
    last_persist_error: Option<String>,
}

impl AlarmStore {
    pub fn open(backend: impl AlarmBackend + 'static) -> Result<Self> {
        let alarms = backend.load()?;
        debug!(count = alarms.len(), "alarm store loaded");
        Ok(Self {
            alarms,
            backend: Box::new(backend),
            last_persist_error: None,
        })
    }

    pub fn list(&self) -> &[Alarm] {
        &self.alarms
    }

    pub fn active(&self) -> impl Iterator<Item = &Alarm> {
        self.alarms.iter().filter(|alarm| alarm.is_active)
    }

    pub fn get(&self, id: &str) -> Option<&Alarm> {
        self.alarms.iter().find(|alarm| alarm.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.alarms.is_empty()
    }

    pub fn last_persist_error(&self) -> Option<&str> {
        self.last_persist_error.as_deref()
    }

    pub fn add(&mut self, definition: &AlarmDefinition) -> Result<Alarm, AlarmError> {
        let (time, label, days) = definition.validate()?;
        let alarm = Alarm {
            id: self.fresh_id(),
            time,
            label,
            days,
            is_active: true,
        };
        self.alarms.push(alarm.clone());
        self.persist();
        Ok(alarm)
    }

    /// Sets `is_active`. Returns `false`, without persisting, when `id` is
    /// unknown.
    pub fn toggle(&mut self, id: &str, active: bool) -> bool {
        let Some(alarm) = self.alarms.iter_mut().find(|alarm| alarm.id == id) else {
            return false;
        };
        alarm.is_active = active;
        self.persist();
        true
    }

    pub fn delete(&mut self, id: &str) -> Option<Alarm> {
        let index = self.alarms.iter().position(|alarm| alarm.id == id)?;
        let removed = self.alarms.remove(index);
        self.persist();
        Some(removed)
    }

    fn fresh_id(&self) -> String {
        loop {
            let id = Uuid::new_v4().to_string();
            if self.get(&id).is_none() {
                return id;
            }
        }
    }

    fn persist(&mut self) {
        match self.backend.save(&self.alarms) {
            Ok(()) => self.last_persist_error = None,
            Err(err) => {
                warn!("failed to persist alarms, keeping in-memory state: {err:#}");
                self.last_persist_error = Some(format!("{err:#}"));
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;

    use super::*;

    /// Backend holding the last saved collection in memory.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryBackend {
        pub saved: Arc<Mutex<Vec<Alarm>>>,
        pub saves: Arc<Mutex<usize>>,
    }

    impl MemoryBackend {
        pub fn with_alarms(alarms: Vec<Alarm>) -> Self {
            Self {
                saved: Arc::new(Mutex::new(alarms)),
                saves: Arc::default(),
            }
        }

        pub fn saved(&self) -> Vec<Alarm> {
            self.saved.lock().map(|saved| saved.clone()).unwrap_or_default()
        }

        pub fn save_count(&self) -> usize {
            self.saves.lock().map(|count| *count).unwrap_or_default()
        }
    }

    impl AlarmBackend for MemoryBackend {
        fn load(&self) -> Result<Vec<Alarm>> {
            Ok(self.saved())
        }

        fn save(&self, alarms: &[Alarm]) -> Result<()> {
            let mut saved = self.saved.lock().map_err(|_| anyhow!("poisoned"))?;
            *saved = alarms.to_vec();
            let mut saves = self.saves.lock().map_err(|_| anyhow!("poisoned"))?;
            *saves += 1;
            Ok(())
        }
    }

    /// Backend whose writes always fail.
    #[derive(Debug, Clone, Default)]
    pub struct ReadOnlyBackend;

    impl AlarmBackend for ReadOnlyBackend {
        fn load(&self) -> Result<Vec<Alarm>> {
            Ok(Vec::new())
        }

        fn save(&self, _alarms: &[Alarm]) -> Result<()> {
            Err(anyhow!("disk is read-only"))
        }
    }
}
