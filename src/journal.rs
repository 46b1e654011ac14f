// =============================================================================
// Journal — append-only durable log backing restart recovery (S6)
// =============================================================================
//
// Spec.md §6 specifies the persisted tables only logically: append,
// point-lookup, range-by-time, snapshot-consistent read. The teacher's
// atomic tmp+rename idiom (see `config.rs`) is reused here: the file-backed
// implementation appends one JSON line per record and periodically
// rewrites an index file atomically so a crash mid-write never corrupts
// the log consumers rely on for recovery.
// =============================================================================

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::JournalError;

/// One journaled record: an opaque JSON payload, keyed by `key` and ordered
/// by `at` for range queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord<T> {
    pub key: String,
    pub at: DateTime<Utc>,
    pub payload: T,
}

pub trait Journal<T: Clone + Serialize + DeserializeOwned + Send + Sync>: Send + Sync {
    fn append(&self, key: &str, at: DateTime<Utc>, payload: T) -> Result<(), JournalError>;
    fn point_lookup(&self, key: &str) -> Option<T>;
    fn range_by_time(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<JournalRecord<T>>;
    /// A consistent read of every key's latest value, as of one instant.
    fn snapshot(&self) -> Vec<JournalRecord<T>>;
}

/// In-memory journal. Default implementation; sufficient for demo mode and
/// tests where restart recovery is simulated rather than exercised across
/// real process boundaries.
pub struct InMemoryJournal<T> {
    records: RwLock<BTreeMap<String, JournalRecord<T>>>,
    log: RwLock<Vec<JournalRecord<T>>>,
}

impl<T: Clone> InMemoryJournal<T> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            log: RwLock::new(Vec::new()),
        }
    }
}

impl<T: Clone> Default for InMemoryJournal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Serialize + DeserializeOwned + Send + Sync> Journal<T> for InMemoryJournal<T> {
    fn append(&self, key: &str, at: DateTime<Utc>, payload: T) -> Result<(), JournalError> {
        let record = JournalRecord {
            key: key.to_string(),
            at,
            payload,
        };
        self.records.write().insert(key.to_string(), record.clone());
        self.log.write().push(record);
        Ok(())
    }

    fn point_lookup(&self, key: &str) -> Option<T> {
        self.records.read().get(key).map(|r| r.payload.clone())
    }

    fn range_by_time(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<JournalRecord<T>> {
        self.log
            .read()
            .iter()
            .filter(|r| r.at >= from && r.at <= to)
            .cloned()
            .collect()
    }

    fn snapshot(&self) -> Vec<JournalRecord<T>> {
        self.records.read().values().cloned().collect()
    }
}

/// JSONL-file-backed journal: one atomically-appended line per record, plus
/// an atomic tmp+rename index rewrite so point-lookup does not have to
/// replay the whole log on every call.
pub struct FileJournal<T> {
    log_path: PathBuf,
    index_path: PathBuf,
    index: RwLock<BTreeMap<String, JournalRecord<T>>>,
}

impl<T: Clone + Serialize + DeserializeOwned> FileJournal<T> {
    pub fn open(log_path: PathBuf, index_path: PathBuf) -> Result<Self, JournalError> {
        let mut index = BTreeMap::new();
        if log_path.exists() {
            let content = std::fs::read_to_string(&log_path).map_err(|e| JournalError::Io(e.to_string()))?;
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let record: JournalRecord<T> =
                    serde_json::from_str(line).map_err(|e| JournalError::Serde(e.to_string()))?;
                index.insert(record.key.clone(), record);
            }
        }
        Ok(Self {
            log_path,
            index_path,
            index: RwLock::new(index),
        })
    }

    fn rewrite_index(&self) -> Result<(), JournalError> {
        let index = self.index.read();
        let content = serde_json::to_string_pretty(&*index).map_err(|e| JournalError::Serde(e.to_string()))?;
        let tmp = self.index_path.with_extension("json.tmp");
        std::fs::write(&tmp, &content).map_err(|e| JournalError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &self.index_path).map_err(|e| JournalError::Io(e.to_string()))?;
        Ok(())
    }
}

impl<T: Clone + Serialize + DeserializeOwned + Send + Sync> Journal<T> for FileJournal<T> {
    fn append(&self, key: &str, at: DateTime<Utc>, payload: T) -> Result<(), JournalError> {
        let record = JournalRecord {
            key: key.to_string(),
            at,
            payload,
        };
        let line = serde_json::to_string(&record).map_err(|e| JournalError::Serde(e.to_string()))?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| JournalError::Io(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| JournalError::Io(e.to_string()))?;

        self.index.write().insert(key.to_string(), record);
        self.rewrite_index()
    }

    fn point_lookup(&self, key: &str) -> Option<T> {
        self.index.read().get(key).map(|r| r.payload.clone())
    }

    fn range_by_time(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<JournalRecord<T>> {
        self.index
            .read()
            .values()
            .filter(|r| r.at >= from && r.at <= to)
            .cloned()
            .collect()
    }

    fn snapshot(&self) -> Vec<JournalRecord<T>> {
        self.index.read().values().cloned().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_point_lookup_returns_latest() {
        let journal: InMemoryJournal<i32> = InMemoryJournal::new();
        journal.append("k1", Utc::now(), 1).unwrap();
        journal.append("k1", Utc::now(), 2).unwrap();
        assert_eq!(journal.point_lookup("k1"), Some(2));
        assert_eq!(journal.log.read().len(), 2);
    }

    #[test]
    fn range_by_time_filters_correctly() {
        let journal: InMemoryJournal<i32> = InMemoryJournal::new();
        let t0 = Utc::now();
        journal.append("k1", t0 - chrono::Duration::hours(2), 1).unwrap();
        journal.append("k2", t0, 2).unwrap();
        let results = journal.range_by_time(t0 - chrono::Duration::minutes(1), t0 + chrono::Duration::minutes(1));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, "k2");
    }

    #[test]
    fn file_journal_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("canopy-journal-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let log_path = dir.join("journal.jsonl");
        let index_path = dir.join("journal.index.json");

        {
            let journal: FileJournal<i32> = FileJournal::open(log_path.clone(), index_path.clone()).unwrap();
            journal.append("k1", Utc::now(), 42).unwrap();
        }

        let reopened: FileJournal<i32> = FileJournal::open(log_path, index_path).unwrap();
        assert_eq!(reopened.point_lookup("k1"), Some(42));

        std::fs::remove_dir_all(&dir).ok();
    }
}
