//! Session-scoped key/value storage.
//!
//! Carries the session identifiers and the locally counted violations
//! across the submission boundary, from the exam run to the report.

use crate::errors::ProctorError;
use crate::types::{SessionIds, ViolationCounters};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Well-known keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKey {
    StudentId,
    ExamId,
    TabSwitchCount,
    FullscreenExitCount,
    Answers,
}

impl StoreKey {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StudentId => "studentId",
            Self::ExamId => "examId",
            Self::TabSwitchCount => "tabSwitchCount",
            Self::FullscreenExitCount => "fullscreenExitCount",
            Self::Answers => "answers",
        }
    }
}

/// String key/value store with get-and-set semantics.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: StoreKey) -> Result<Option<String>, ProctorError>;
    fn set(&self, key: StoreKey, value: &str) -> Result<(), ProctorError>;
    fn remove(&self, key: StoreKey) -> Result<(), ProctorError>;

    /// Persist the identifiers entered before the exam.
    fn save_ids(&self, ids: &SessionIds) -> Result<(), ProctorError> {
        self.set(StoreKey::StudentId, &ids.student_id)?;
        self.set(StoreKey::ExamId, &ids.exam_id)
    }

    /// Load the session identifiers. Missing or empty values are a
    /// precondition failure.
    fn load_ids(&self) -> Result<SessionIds, ProctorError> {
        let student = self.get(StoreKey::StudentId)?.filter(|s| !s.is_empty());
        let exam = self.get(StoreKey::ExamId)?.filter(|s| !s.is_empty());
        match (student, exam) {
            (Some(student_id), Some(exam_id)) => Ok(SessionIds {
                student_id,
                exam_id,
            }),
            _ => Err(ProctorError::MissingSessionIds),
        }
    }

    fn save_counters(&self, tab_switches: u32, fullscreen_exits: u32) -> Result<(), ProctorError> {
        self.set(StoreKey::TabSwitchCount, &tab_switches.to_string())?;
        self.set(StoreKey::FullscreenExitCount, &fullscreen_exits.to_string())
    }

    /// Load counters; absent or unparseable values become `None`.
    fn load_counters(&self) -> Result<ViolationCounters, ProctorError> {
        let parse = |key: StoreKey| -> Result<Option<u32>, ProctorError> {
            Ok(self.get(key)?.and_then(|raw| match raw.trim().parse::<u32>() {
                Ok(n) => Some(n),
                Err(_) => {
                    warn!(key = key.as_str(), value = %raw, "Ignoring unparseable counter");
                    None
                }
            }))
        };
        Ok(ViolationCounters {
            tab_switches: parse(StoreKey::TabSwitchCount)?,
            fullscreen_exits: parse(StoreKey::FullscreenExitCount)?,
        })
    }

    /// Drop the previous session's answers and counters. Ids are kept.
    fn clear_session(&self) -> Result<(), ProctorError> {
        self.remove(StoreKey::TabSwitchCount)?;
        self.remove(StoreKey::FullscreenExitCount)?;
        self.remove(StoreKey::Answers)
    }

    fn save_answers(&self, answers: &BTreeMap<String, String>) -> Result<(), ProctorError> {
        let json = serde_json::to_string(answers)
            .map_err(|e| ProctorError::Storage(format!("serialize answers: {e}")))?;
        self.set(StoreKey::Answers, &json)
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: StoreKey) -> Result<Option<String>, ProctorError> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key.as_str()).cloned())
    }

    fn set(&self, key: StoreKey, value: &str) -> Result<(), ProctorError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.as_str().to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: StoreKey) -> Result<(), ProctorError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.remove(key.as_str());
        Ok(())
    }
}

/// JSON-object file store. Every write rewrites the file atomically.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ProctorError> {
        let path = path.into();
        let values = if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| ProctorError::Storage(format!("read {}: {e}", path.display())))?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw).map_err(|e| {
                    ProctorError::Storage(format!("parse {}: {e}", path.display()))
                })?
            }
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), entries = values.len(), "Opened session store");
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, values: &BTreeMap<String, String>) -> Result<(), ProctorError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ProctorError::Storage(format!("create {}: {e}", parent.display())))?;
        }
        let json = serde_json::to_string_pretty(values)
            .map_err(|e| ProctorError::Storage(format!("serialize: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .map_err(|e| ProctorError::Storage(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| ProctorError::Storage(format!("rename {}: {e}", self.path.display())))
    }
}

impl SessionStore for FileStore {
    fn get(&self, key: StoreKey) -> Result<Option<String>, ProctorError> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key.as_str()).cloned())
    }

    fn set(&self, key: StoreKey, value: &str) -> Result<(), ProctorError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = values.clone();
        next.insert(key.as_str().to_string(), value.to_string());
        self.flush(&next)?;
        *values = next;
        Ok(())
    }

    fn remove(&self, key: StoreKey) -> Result<(), ProctorError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        if !values.contains_key(key.as_str()) {
            return Ok(());
        }
        let mut next = values.clone();
        next.remove(key.as_str());
        self.flush(&next)?;
        *values = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_either_id_is_a_precondition_error() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.load_ids(),
            Err(ProctorError::MissingSessionIds)
        ));
        store.set(StoreKey::StudentId, "s-17").unwrap();
        assert!(matches!(
            store.load_ids(),
            Err(ProctorError::MissingSessionIds)
        ));
        store.set(StoreKey::ExamId, "").unwrap();
        assert!(matches!(
            store.load_ids(),
            Err(ProctorError::MissingSessionIds)
        ));
        store.set(StoreKey::ExamId, "midterm").unwrap();
        assert_eq!(store.load_ids().unwrap(), SessionIds::new("s-17", "midterm"));
    }

    #[test]
    fn counters_absent_until_saved() {
        let store = MemoryStore::new();
        assert_eq!(store.load_counters().unwrap(), ViolationCounters::default());
        store.save_counters(4, 2).unwrap();
        assert_eq!(store.load_counters().unwrap(), ViolationCounters::new(4, 2));
    }

    #[test]
    fn garbage_counter_reads_as_absent() {
        let store = MemoryStore::new();
        store.set(StoreKey::TabSwitchCount, "lots").unwrap();
        store.set(StoreKey::FullscreenExitCount, "1").unwrap();
        let counters = store.load_counters().unwrap();
        assert_eq!(counters.tab_switches, None);
        assert_eq!(counters.fullscreen_exits, Some(1));
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");

        let store = FileStore::open(&path).unwrap();
        store.save_ids(&SessionIds::new("s1", "e1")).unwrap();
        store.save_counters(3, 0).unwrap();
        let mut answers = BTreeMap::new();
        answers.insert("q1".to_string(), "b".to_string());
        store.save_answers(&answers).unwrap();
        drop(store);

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.load_ids().unwrap(), SessionIds::new("s1", "e1"));
        assert_eq!(reopened.load_counters().unwrap(), ViolationCounters::new(3, 0));
        assert_eq!(
            reopened.get(StoreKey::Answers).unwrap().as_deref(),
            Some(r#"{"q1":"b"}"#)
        );

        reopened.remove(StoreKey::TabSwitchCount).unwrap();
        let again = FileStore::open(&path).unwrap();
        assert_eq!(again.load_counters().unwrap().tab_switches, None);
    }

    #[test]
    fn clear_session_keeps_ids() {
        let store = MemoryStore::new();
        store.save_ids(&SessionIds::new("s1", "e1")).unwrap();
        store.save_counters(5, 1).unwrap();
        store.set(StoreKey::Answers, "{}").unwrap();

        store.clear_session().unwrap();

        assert_eq!(store.load_ids().unwrap(), SessionIds::new("s1", "e1"));
        assert_eq!(store.load_counters().unwrap(), ViolationCounters::default());
        assert_eq!(store.get(StoreKey::Answers).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn failed_write_leaves_memory_unchanged() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let store = FileStore::open(&path).unwrap();
        store.save_counters(2, 0).unwrap();

        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o500)).unwrap();
        let blocked = fs::write(dir.path().join("write-check"), "x").is_err();
        let result = store.set(StoreKey::TabSwitchCount, "9");
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();

        // Running as root ignores directory permissions.
        if !blocked {
            return;
        }
        assert!(matches!(result, Err(ProctorError::Storage(_))));
        assert_eq!(store.load_counters().unwrap(), ViolationCounters::new(2, 0));
        assert_eq!(
            FileStore::open(&path).unwrap().load_counters().unwrap(),
            ViolationCounters::new(2, 0)
        );
    }

    #[test]
    fn corrupt_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            FileStore::open(&path),
            Err(ProctorError::Storage(_))
        ));
    }
}
