//! Performance history: an append-only log of conversion attempts.
//!
//! Every collaborator call, successful or not, is recorded as a
//! [`PerformanceRecord`]. The configuration layer reads per-(profile, file
//! type) success rates from it to rank profiles when quality prediction is on.
//!
//! The store is injected (shared via `Arc`) rather than global, so tests and
//! embedders can each hold their own. Writes are serialized by a single
//! mutex; the log is bounded and evicts its oldest entries first.
//!
//! Persistence is an explicit flush (`save`) to JSON, written atomically
//! through a temp file in the destination directory.

use crate::error::ConfigError;
use crate::types::FileType;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Default bound, matching `user_preferences.max_history_items`.
pub const DEFAULT_MAX_ITEMS: usize = 1000;
/// Largest bound `user_preferences.max_history_items` accepts.
pub const MAX_HISTORY_ITEMS: usize = 100_000;

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

/// One attempt. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub profile: String,
    pub file_type: FileType,
    pub outcome: AttemptOutcome,
    /// Overall quality score; only present for successful attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub duration_ms: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl PerformanceRecord {
    pub fn new(
        profile: impl Into<String>,
        file_type: FileType,
        outcome: AttemptOutcome,
        score: Option<f64>,
        duration_ms: u64,
    ) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            profile: profile.into(),
            file_type,
            outcome,
            score,
            duration_ms,
            timestamp_ms,
        }
    }
}

/// Aggregates for one (profile, file type) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProfileStats {
    pub attempts: u64,
    pub successes: u64,
    pub transient_failures: u64,
    pub permanent_failures: u64,
    score_sum: f64,
}

impl ProfileStats {
    pub fn success_rate(&self) -> Option<f64> {
        (self.attempts > 0).then(|| self.successes as f64 / self.attempts as f64)
    }

    pub fn mean_score(&self) -> Option<f64> {
        (self.successes > 0).then(|| self.score_sum / self.successes as f64)
    }

    fn add(&mut self, r: &PerformanceRecord) {
        self.attempts += 1;
        match r.outcome {
            AttemptOutcome::Success => {
                self.successes += 1;
                self.score_sum += r.score.unwrap_or(0.0);
            }
            AttemptOutcome::TransientFailure => self.transient_failures += 1,
            AttemptOutcome::PermanentFailure => self.permanent_failures += 1,
        }
    }

    fn remove(&mut self, r: &PerformanceRecord) {
        self.attempts = self.attempts.saturating_sub(1);
        match r.outcome {
            AttemptOutcome::Success => {
                self.successes = self.successes.saturating_sub(1);
                self.score_sum -= r.score.unwrap_or(0.0);
            }
            AttemptOutcome::TransientFailure => {
                self.transient_failures = self.transient_failures.saturating_sub(1)
            }
            AttemptOutcome::PermanentFailure => {
                self.permanent_failures = self.permanent_failures.saturating_sub(1)
            }
        }
    }
}

#[derive(Debug)]
struct HistoryLog {
    records: VecDeque<PerformanceRecord>,
    index: HashMap<(String, FileType), ProfileStats>,
    max_items: usize,
}

impl HistoryLog {
    fn push(&mut self, record: PerformanceRecord) {
        self.index
            .entry((record.profile.clone(), record.file_type))
            .or_default()
            .add(&record);
        self.records.push_back(record);
        self.evict();
    }

    fn evict(&mut self) {
        while self.records.len() > self.max_items {
            if let Some(old) = self.records.pop_front() {
                let key = (old.profile.clone(), old.file_type);
                if let Some(stats) = self.index.get_mut(&key) {
                    stats.remove(&old);
                    if stats.attempts == 0 {
                        self.index.remove(&key);
                    }
                }
            }
        }
    }
}

/// Shared, bounded log of attempt outcomes.
#[derive(Debug)]
pub struct PerformanceHistory {
    log: Mutex<HistoryLog>,
}

impl Default for PerformanceHistory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITEMS)
    }
}

impl PerformanceHistory {
    pub fn new(max_items: usize) -> Self {
        Self {
            log: Mutex::new(HistoryLog {
                records: VecDeque::new(),
                index: HashMap::new(),
                max_items: max_items.max(1),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HistoryLog> {
        // A panic while holding the lock cannot leave the log half-written:
        // each mutation is a push followed by eviction.
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, record: PerformanceRecord) {
        self.lock().push(record);
    }

    /// Change the bound; evicts immediately when shrinking.
    pub fn set_max_items(&self, max_items: usize) {
        let mut log = self.lock();
        log.max_items = max_items.max(1);
        log.evict();
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all retained records, oldest first.
    pub fn records(&self) -> Vec<PerformanceRecord> {
        self.lock().records.iter().cloned().collect()
    }

    pub fn stats(&self, profile: &str, file_type: FileType) -> Option<ProfileStats> {
        self.lock()
            .index
            .get(&(profile.to_string(), file_type))
            .copied()
    }

    /// Success rate for the pair, `None` when it has no attempts yet.
    pub fn success_rate(&self, profile: &str, file_type: FileType) -> Option<f64> {
        self.stats(profile, file_type).and_then(|s| s.success_rate())
    }

    /// Write the log as pretty JSON. Atomic: readers see the old file or the
    /// new one, never a torn write.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let records = self.records();
        let json = serde_json::to_vec_pretty(&records).map_err(|e| ConfigError::Schema {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        write_atomic(path, &json)?;
        debug!(path = %path.display(), records = records.len(), "Saved performance history");
        Ok(())
    }

    /// Load a log written by [`save`](Self::save). Records beyond
    /// `max_items` are dropped oldest first.
    pub fn load(path: &Path, max_items: usize) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let records: Vec<PerformanceRecord> =
            serde_json::from_slice(&bytes).map_err(|e| ConfigError::Schema {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        let history = Self::new(max_items);
        {
            let mut log = history.lock();
            for r in records {
                log.push(r);
            }
        }
        Ok(history)
    }
}

/// Write `bytes` to `path` through a sibling temp file, then rename over it.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(io_err)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.flush().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
