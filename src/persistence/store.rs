//! File-backed series store
//!
//! Layout under the data directory:
//! - `<name>.json`        live record or history array
//! - `<name>_temp.json`   transient, renamed over `<name>.json`
//! - `<name>.json.lock`   advisory lock held during a history write
//!
//! One writer process per directory is assumed. The lock file guards that
//! assumption; a lock older than `stale_lock_age` is left over from a crashed
//! writer and gets removed.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

use super::{names, HistoryRecord};
use crate::config::PersistenceConfig;
use crate::error::PersistError;

const LOCK_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct PersistenceStore {
    dir: PathBuf,
    lock_timeout: Duration,
    stale_lock_age: Duration,
}

/// Removes the lock file on drop
#[derive(Debug)]
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("failed to release lock {:?}: {}", self.path, e);
        }
    }
}

impl PersistenceStore {
    pub fn new(dir: impl Into<PathBuf>, lock_timeout: Duration, stale_lock_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            lock_timeout,
            stale_lock_age,
        }
    }

    pub fn from_config(dir: impl Into<PathBuf>, config: &PersistenceConfig) -> Self {
        Self::new(dir, config.lock_timeout(), config.stale_lock_age())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}_temp.json"))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json.lock"))
    }

    pub fn signals_log_path(&self) -> PathBuf {
        self.dir.join(names::SIGNALS_LOG)
    }

    /// Create the directory and an empty signal log if missing
    pub fn ensure_layout(&self) -> Result<(), PersistError> {
        fs::create_dir_all(&self.dir).map_err(|e| PersistError::io(&self.dir, e))?;
        let log = self.signals_log_path();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log)
            .map_err(|e| PersistError::io(&log, e))?;
        Ok(())
    }

    /// Delete everything in the data directory, then recreate the layout
    pub fn clear(&self) -> Result<usize, PersistError> {
        let mut removed = 0;
        match fs::read_dir(&self.dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry.map_err(|e| PersistError::io(&self.dir, e))?;
                    let path = entry.path();
                    let result = if path.is_dir() {
                        fs::remove_dir_all(&path)
                    } else {
                        fs::remove_file(&path)
                    };
                    result.map_err(|e| PersistError::io(&path, e))?;
                    debug!("removed {:?}", path);
                    removed += 1;
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(PersistError::io(&self.dir, e)),
        }
        self.ensure_layout()?;
        Ok(removed)
    }

    /// Overwrite a single-record file via temp file and rename
    pub fn write_live<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), PersistError> {
        let bytes = serde_json::to_vec(value)?;
        self.replace(name, &bytes)
    }

    /// `None` if the file does not exist yet
    pub fn read_live<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, PersistError> {
        let path = self.path(name);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| PersistError::Corrupt {
                path,
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistError::io(path, e)),
        }
    }

    /// Merge records into a history file under its lock.
    ///
    /// Existing records with the same key are replaced; the file stays sorted
    /// by key. An unreadable history is logged and overwritten. Returns the
    /// number of records now in the file.
    pub fn append_history<T: HistoryRecord>(&self, name: &str, records: &[T]) -> Result<usize, PersistError> {
        let _lock = self.lock(name)?;

        let path = self.path(name);
        let existing: Vec<T> = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    warn!("corrupt history {:?} ({}), starting over", path, e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(PersistError::io(path, e)),
        };

        let mut merged: BTreeMap<i64, T> = existing.into_iter().map(|r| (r.history_key(), r)).collect();
        for record in records {
            merged.insert(record.history_key(), record.clone());
        }
        let merged: Vec<&T> = merged.values().collect();

        let bytes = serde_json::to_vec(&merged)?;
        self.replace(name, &bytes)?;
        Ok(merged.len())
    }

    /// Ordered history; missing file is empty, unreadable file is `Corrupt`
    pub fn read_history<T: HistoryRecord>(&self, name: &str) -> Result<Vec<T>, PersistError> {
        Ok(self.read_live::<Vec<T>>(name)?.unwrap_or_default())
    }

    /// Append lines to the human-readable signal log
    pub fn append_log(&self, lines: &[String]) -> Result<(), PersistError> {
        if lines.is_empty() {
            return Ok(());
        }
        let path = self.signals_log_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PersistError::io(&path, e))?;
        let mut buf = String::new();
        for line in lines {
            buf.push_str(line);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes()).map_err(|e| PersistError::io(&path, e))
    }

    fn replace(&self, name: &str, bytes: &[u8]) -> Result<(), PersistError> {
        fs::create_dir_all(&self.dir).map_err(|e| PersistError::io(&self.dir, e))?;
        let temp = self.temp_path(name);
        let path = self.path(name);
        fs::write(&temp, bytes).map_err(|e| PersistError::io(&temp, e))?;
        fs::rename(&temp, &path).map_err(|e| {
            let _ = fs::remove_file(&temp);
            PersistError::io(&path, e)
        })
    }

    fn lock(&self, name: &str) -> Result<LockGuard, PersistError> {
        fs::create_dir_all(&self.dir).map_err(|e| PersistError::io(&self.dir, e))?;
        let path = self.lock_path(name);
        let started = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(LockGuard { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.is_stale(&path) {
                        warn!("removing stale lock {:?}", path);
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    let waited = started.elapsed();
                    if waited >= self.lock_timeout {
                        return Err(PersistError::LockTimeout { path, waited });
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(PersistError::io(path, e)),
            }
        }
    }

    fn is_stale(&self, lock: &Path) -> bool {
        fs::metadata(lock)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > self.stale_lock_age)
    }
}
