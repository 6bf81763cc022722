//! Persisted agent state: the worker status snapshot and the activity log.
//!
//! Neither is needed for correctness. The snapshot seeds the status registry
//! after a restart; the log is for operators.

use crate::types::{ChallengeSignal, Lifecycle, WorkerId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Activity log never holds more entries than this
pub const MAX_LOG_ENTRIES: usize = 1000;

const SNAPSHOT_FILE: &str = "worker_status.json";
const LOG_FILE: &str = "activity_log.json";

/// Persisted form of one worker status registry entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub address: String,
    pub lifecycle: Lifecycle,
    /// Wall clock time of the last lifecycle change, ms since epoch
    pub last_transition_ms: u64,
    pub challenge_signal: ChallengeSignal,
}

pub type StatusSnapshot = BTreeMap<WorkerId, WorkerSnapshot>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: u64,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: crate::utils::now_millis(),
            level,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait StateStore: Debug + Send + Sync {
    /// Last saved snapshot, empty if none was ever saved
    async fn load_snapshot(&self) -> Result<StatusSnapshot>;

    async fn save_snapshot(&self, snapshot: &StatusSnapshot) -> Result<()>;

    /// Append one entry, dropping the oldest beyond [`MAX_LOG_ENTRIES`]
    async fn append_log(&self, entry: LogEntry) -> Result<()>;

    async fn logs(&self) -> Result<Vec<LogEntry>>;
}

fn push_bounded(log: &mut VecDeque<LogEntry>, entry: LogEntry) {
    log.push_back(entry);
    while log.len() > MAX_LOG_ENTRIES {
        log.pop_front();
    }
}

/// Volatile store used when no state directory is configured
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<StatusSnapshot>,
    log: Mutex<VecDeque<LogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_snapshot(&self) -> Result<StatusSnapshot> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn save_snapshot(&self, snapshot: &StatusSnapshot) -> Result<()> {
        *self.snapshot.lock().await = snapshot.clone();
        Ok(())
    }

    async fn append_log(&self, entry: LogEntry) -> Result<()> {
        push_bounded(&mut *self.log.lock().await, entry);
        Ok(())
    }

    async fn logs(&self) -> Result<Vec<LogEntry>> {
        Ok(self.log.lock().await.iter().cloned().collect())
    }
}

/// Store keeping one JSON document per collection in a directory.
///
/// Files are replaced atomically (write to a temp file, then rename).
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    // Lazily loaded copy of the log file
    log: Mutex<Option<VecDeque<LogEntry>>>,
}

impl JsonFileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create state dir {}", dir.display()))?;
        Ok(Self {
            dir,
            log: Mutex::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_json<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        let path = self.dir.join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Corrupt state file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{}.tmp", name));
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load_snapshot(&self) -> Result<StatusSnapshot> {
        self.read_json(SNAPSHOT_FILE).await
    }

    async fn save_snapshot(&self, snapshot: &StatusSnapshot) -> Result<()> {
        self.write_json(SNAPSHOT_FILE, snapshot).await
    }

    async fn append_log(&self, entry: LogEntry) -> Result<()> {
        let mut guard = self.log.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_json(LOG_FILE).await?);
        }
        let log = guard.get_or_insert_with(VecDeque::new);
        push_bounded(log, entry);
        self.write_json(LOG_FILE, &*log).await
    }

    async fn logs(&self) -> Result<Vec<LogEntry>> {
        if let Some(log) = self.log.lock().await.as_ref() {
            return Ok(log.iter().cloned().collect());
        }
        self.read_json(LOG_FILE).await
    }
}
