//! Persisted settings record and run history.

use crate::card::FormValues;
use crate::ledger::Ledger;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// User-edited settings, re-read at the start of every run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Card-number pattern handed to the card source.
    pub pattern: String,
    /// Newline-separated identifiers, used round-robin.
    pub identifier_list: String,
    pub first_name: String,
    pub last_name: String,
    pub postal_code: String,
    pub cursor: usize,
}

impl Settings {
    /// Non-blank lines of the identifier list, trimmed.
    pub fn identifiers(&self) -> Vec<String> {
        self.identifier_list
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn form_values(&self) -> FormValues {
        FormValues {
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            postal_code: self.postal_code.clone(),
        }
    }
}

/// Key-value persistence for [`Settings`] and the run [`Ledger`].
pub trait Store {
    fn load_settings(&self) -> Result<Settings>;
    fn save_settings(&self, settings: &Settings) -> Result<()>;
    fn load_history(&self) -> Result<Ledger>;
    fn save_history(&self, history: &Ledger) -> Result<()>;
}

const SETTINGS_FILE: &str = "settings.json";
const HISTORY_FILE: &str = "history.json";

/// JSON files in one directory. Missing files read as defaults.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read<T: for<'de> Deserialize<'de> + Default>(&self, name: &str) -> Result<T> {
        let path = self.dir.join(name);
        if !path.exists() {
            debug!("{} not present, using defaults", path.display());
            return Ok(T::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = path.with_extension("json.tmp");
        let write = || -> std::result::Result<(), Box<dyn std::error::Error>> {
            std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        };
        write().map_err(|e| Error::PersistenceWriteFailed(format!("{}: {}", path.display(), e)))
    }
}

impl Store for FileStore {
    fn load_settings(&self) -> Result<Settings> {
        self.read(SETTINGS_FILE)
    }

    fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.write(SETTINGS_FILE, settings)
    }

    fn load_history(&self) -> Result<Ledger> {
        let history: Ledger = self.read(HISTORY_FILE)?;
        // Re-apply the cap in case the file was edited by hand.
        Ok(Ledger::from_entries(history.iter().cloned()))
    }

    fn save_history(&self, history: &Ledger) -> Result<()> {
        self.write(HISTORY_FILE, history)
    }
}

/// In-process store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    settings: Settings,
    history: Ledger,
    fail_writes: bool,
    fail_reads: bool,
}

impl MemoryStore {
    pub fn new(settings: Settings) -> Self {
        let store = Self::default();
        store.lock().settings = settings;
        store
    }

    /// Make every save fail, as a full or read-only disk would.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Make settings loads fail, as a file locked by another process would.
    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn settings(&self) -> Settings {
        self.lock().settings.clone()
    }

    pub fn history(&self) -> Ledger {
        self.lock().history.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // A panic while holding the lock cannot leave the plain data invalid.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Store for MemoryStore {
    fn load_settings(&self) -> Result<Settings> {
        let inner = self.lock();
        if inner.fail_reads {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "settings: store is unreadable",
            )));
        }
        Ok(inner.settings.clone())
    }

    fn save_settings(&self, settings: &Settings) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(Error::PersistenceWriteFailed("settings: store is read-only".into()));
        }
        inner.settings = settings.clone();
        Ok(())
    }

    fn load_history(&self) -> Result<Ledger> {
        Ok(self.lock().history.clone())
    }

    fn save_history(&self, history: &Ledger) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(Error::PersistenceWriteFailed("history: store is read-only".into()));
        }
        inner.history = history.clone();
        Ok(())
    }
}
