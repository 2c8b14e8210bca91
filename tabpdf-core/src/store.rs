use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::session::DocumentSession;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access store file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode value for {key}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("value for {key} is malformed")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("value for {key} has the wrong type")]
    TypeMismatch { key: String },
}

/// Flat string-keyed persistent store.
pub trait KeyValueStore: Send + Sync {
    fn get_string(&self, key: &str, default: &str) -> Result<String, StoreError>;
    fn put_string(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn get_int(&self, key: &str, default: i64) -> Result<i64, StoreError>;
    fn put_int(&self, key: &str, value: i64) -> Result<(), StoreError>;

    /// Writes several values as one update, in order. Stores that can commit
    /// them together override this.
    fn put_values(&self, values: Vec<(&str, StoredValue)>) -> Result<(), StoreError> {
        for (key, value) in values {
            match value {
                StoredValue::Int(value) => self.put_int(key, value)?,
                StoredValue::Text(value) => self.put_string(key, &value)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    Int(i64),
    Text(String),
}

fn read_string(
    values: &BTreeMap<String, StoredValue>,
    key: &str,
    default: &str,
) -> Result<String, StoreError> {
    match values.get(key) {
        None => Ok(default.to_owned()),
        Some(StoredValue::Text(text)) => Ok(text.clone()),
        Some(StoredValue::Int(_)) => Err(StoreError::TypeMismatch {
            key: key.to_owned(),
        }),
    }
}

fn read_int(
    values: &BTreeMap<String, StoredValue>,
    key: &str,
    default: i64,
) -> Result<i64, StoreError> {
    match values.get(key) {
        None => Ok(default),
        Some(StoredValue::Int(value)) => Ok(*value),
        Some(StoredValue::Text(_)) => Err(StoreError::TypeMismatch {
            key: key.to_owned(),
        }),
    }
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    inner: Mutex<BTreeMap<String, StoredValue>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get_string(&self, key: &str, default: &str) -> Result<String, StoreError> {
        read_string(&self.inner.lock(), key, default)
    }

    fn put_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .insert(key.to_owned(), StoredValue::Text(value.to_owned()));
        Ok(())
    }

    fn get_int(&self, key: &str, default: i64) -> Result<i64, StoreError> {
        read_int(&self.inner.lock(), key, default)
    }

    fn put_int(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.inner
            .lock()
            .insert(key.to_owned(), StoredValue::Int(value));
        Ok(())
    }

    fn put_values(&self, values: Vec<(&str, StoredValue)>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        for (key, value) in values {
            inner.insert(key.to_owned(), value);
        }
        Ok(())
    }
}

/// Key-value store backed by a single JSON file. Every write replaces the
/// file through a temporary sibling and a rename. A file that no longer
/// decodes is moved aside to `*.json.corrupt` and the store starts empty.
pub struct FileKeyValueStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, StoredValue>>,
}

impl FileKeyValueStore {
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let values = match fs::read_to_string(&path) {
            Ok(buf) if buf.trim().is_empty() => BTreeMap::new(),
            Ok(buf) => match serde_json::from_str(&buf) {
                Ok(values) => values,
                Err(err) => {
                    set_aside(&path, &err);
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, values: &BTreeMap<String, StoredValue>) -> Result<(), StoreError> {
        let payload = serde_json::to_string_pretty(values).map_err(|source| StoreError::Encode {
            key: self.path.display().to_string(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        let io_err = |source| StoreError::Io {
            path: tmp.clone(),
            source,
        };
        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(payload.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    fn insert(&self, key: &str, value: StoredValue) -> Result<(), StoreError> {
        let mut values = self.values.lock();
        values.insert(key.to_owned(), value);
        self.flush(&values)
    }
}

fn set_aside(path: &Path, err: &serde_json::Error) {
    let corrupt = path.with_extension("json.corrupt");
    match fs::rename(path, &corrupt) {
        Ok(()) => warn!(
            path = %path.display(),
            moved_to = %corrupt.display(),
            error = %err,
            "store file is unreadable; starting empty"
        ),
        Err(rename_err) => warn!(
            path = %path.display(),
            error = %err,
            rename_error = %rename_err,
            "store file is unreadable and could not be moved aside; starting empty"
        ),
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get_string(&self, key: &str, default: &str) -> Result<String, StoreError> {
        read_string(&self.values.lock(), key, default)
    }

    fn put_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.insert(key, StoredValue::Text(value.to_owned()))
    }

    fn get_int(&self, key: &str, default: i64) -> Result<i64, StoreError> {
        read_int(&self.values.lock(), key, default)
    }

    fn put_int(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.insert(key, StoredValue::Int(value))
    }

    fn put_values(&self, values: Vec<(&str, StoredValue)>) -> Result<(), StoreError> {
        let mut stored = self.values.lock();
        for (key, value) in values {
            stored.insert(key.to_owned(), value);
        }
        self.flush(&stored)
    }
}

const DOCUMENTS_KEY: &str = "session.documents";
const PAGES_KEY: &str = "session.pages";
const ACTIVE_INDEX_KEY: &str = "session.active_index";
const LEGACY_DELIMITER: char = '|';
const NO_ACTIVE_INDEX: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotEntry {
    pub locator: String,
    pub current_page: usize,
}

/// What the store remembers about a session: locators in tab order, the page
/// last seen in each, and the active index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub entries: Vec<SnapshotEntry>,
    pub active_index: Option<usize>,
}

impl SessionSnapshot {
    pub fn capture(session: &DocumentSession) -> Self {
        Self {
            entries: session
                .documents()
                .iter()
                .map(|doc| SnapshotEntry {
                    locator: doc.locator.to_string(),
                    current_page: doc.current_page,
                })
                .collect(),
            active_index: session.active_index(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn locators(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.locator.as_str())
    }
}

/// Snapshot persistence on top of a [`KeyValueStore`]. The in-memory
/// session stays authoritative; this only writes and reads snapshots.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    pub fn save(&self, session: &DocumentSession) -> Result<(), StoreError> {
        self.write(&SessionSnapshot::capture(session))
    }

    #[instrument(skip_all, fields(documents = snapshot.entries.len()))]
    pub fn write(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        let locators: Vec<&str> = snapshot.locators().collect();
        let pages: Vec<usize> = snapshot.entries.iter().map(|e| e.current_page).collect();
        let encode = |key: &str, source| StoreError::Encode {
            key: key.to_owned(),
            source,
        };

        let documents =
            serde_json::to_string(&locators).map_err(|source| encode(DOCUMENTS_KEY, source))?;
        let pages = serde_json::to_string(&pages).map_err(|source| encode(PAGES_KEY, source))?;
        let active = snapshot
            .active_index
            .and_then(|index| i64::try_from(index).ok())
            .unwrap_or(NO_ACTIVE_INDEX);

        // Documents go last so a store without batched writes never pairs a
        // new document list with stale pages.
        self.backend.put_values(vec![
            (PAGES_KEY, StoredValue::Text(pages)),
            (ACTIVE_INDEX_KEY, StoredValue::Int(active)),
            (DOCUMENTS_KEY, StoredValue::Text(documents)),
        ])?;
        debug!(active, "session snapshot written");
        Ok(())
    }

    /// Reads the last snapshot; an empty snapshot when nothing was saved.
    pub fn restore(&self) -> Result<SessionSnapshot, StoreError> {
        let documents = self.backend.get_string(DOCUMENTS_KEY, "")?;
        let locators = decode_locators(&documents)?;
        if locators.is_empty() {
            return Ok(SessionSnapshot::default());
        }

        let pages = self.restore_pages();

        let active = self.backend.get_int(ACTIVE_INDEX_KEY, NO_ACTIVE_INDEX)?;
        let active_index = usize::try_from(active).ok();

        let entries = locators
            .into_iter()
            .enumerate()
            .map(|(i, locator)| SnapshotEntry {
                locator,
                current_page: pages.get(i).copied().unwrap_or_default(),
            })
            .collect();

        Ok(SessionSnapshot {
            entries,
            active_index,
        })
    }

    /// Remembered pages; unreadable positions fall back to the first page.
    fn restore_pages(&self) -> Vec<usize> {
        let raw = match self.backend.get_string(PAGES_KEY, "") {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "ignoring stored page positions");
                return Vec::new();
            }
        };
        if raw.trim().is_empty() {
            return Vec::new();
        }
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(error = %err, "ignoring malformed page positions");
            Vec::new()
        })
    }
}

/// Accepts the JSON array layout and the older delimiter-joined one.
fn decode_locators(raw: &str) -> Result<Vec<String>, StoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|source| StoreError::Malformed {
            key: DOCUMENTS_KEY.to_owned(),
            source,
        });
    }
    Ok(trimmed
        .split(LEGACY_DELIMITER)
        .filter(|segment| !segment.is_empty())
        .map(str::to_owned)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Locator;
    use tempfile::tempdir;

    fn session_with(names: &[&str], active: usize) -> DocumentSession {
        let mut session = DocumentSession::new();
        for name in names {
            let locator = Locator::parse(format!("file:///docs/{name}.pdf")).unwrap();
            session.open(locator, |_| name.to_string());
        }
        session.switch_to(active);
        session
    }

    #[test]
    fn save_then_restore_round_trips() {
        let store = SessionStore::new(Arc::new(MemoryKeyValueStore::new()));
        let mut session = session_with(&["a", "b", "c"], 1);
        let id = session.get(2).unwrap().id;
        session.record_page_seen(&id, 17);

        store.save(&session).unwrap();
        let snapshot = store.restore().unwrap();

        assert_eq!(snapshot, SessionSnapshot::capture(&session));
        assert_eq!(snapshot.active_index, Some(1));
        assert_eq!(snapshot.entries[2].current_page, 17);
    }

    #[test]
    fn restore_without_record_is_empty() {
        let store = SessionStore::new(Arc::new(MemoryKeyValueStore::new()));
        assert!(store.restore().unwrap().is_empty());
    }

    #[test]
    fn locators_containing_the_legacy_delimiter_survive() {
        let store = SessionStore::new(Arc::new(MemoryKeyValueStore::new()));
        let session = session_with(&["left|right"], 0);
        store.save(&session).unwrap();

        let snapshot = store.restore().unwrap();
        let locators: Vec<_> = snapshot.locators().collect();
        assert_eq!(locators, ["file:///docs/left|right.pdf"]);
    }

    #[test]
    fn legacy_delimited_records_are_read() {
        let backend = Arc::new(MemoryKeyValueStore::new());
        backend
            .put_string(DOCUMENTS_KEY, "content://a|content://b||content://c")
            .unwrap();
        backend.put_int(ACTIVE_INDEX_KEY, 2).unwrap();
        let store = SessionStore::new(backend);

        let snapshot = store.restore().unwrap();
        let locators: Vec<_> = snapshot.locators().collect();
        assert_eq!(locators, ["content://a", "content://b", "content://c"]);
        assert!(snapshot.entries.iter().all(|e| e.current_page == 0));
        assert_eq!(snapshot.active_index, Some(2));
    }

    #[test]
    fn empty_session_saves_sentinel_index() {
        let backend = Arc::new(MemoryKeyValueStore::new());
        let store = SessionStore::new(backend.clone());
        store.save(&DocumentSession::new()).unwrap();

        assert_eq!(backend.get_int(ACTIVE_INDEX_KEY, 0).unwrap(), NO_ACTIVE_INDEX);
        assert!(store.restore().unwrap().is_empty());
    }

    #[test]
    fn malformed_record_is_an_error() {
        let backend = Arc::new(MemoryKeyValueStore::new());
        backend.put_string(DOCUMENTS_KEY, "[\"unterminated").unwrap();
        let store = SessionStore::new(backend);
        assert!(matches!(
            store.restore(),
            Err(StoreError::Malformed { .. })
        ));
    }

    #[test]
    fn type_mismatch_is_reported() {
        let backend = MemoryKeyValueStore::new();
        backend.put_int("key", 3).unwrap();
        assert!(matches!(
            backend.get_string("key", ""),
            Err(StoreError::TypeMismatch { .. })
        ));
        assert_eq!(backend.get_int("missing", 9).unwrap(), 9);
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("session.json");

        {
            let backend = Arc::new(FileKeyValueStore::open(path.clone()).unwrap());
            let store = SessionStore::new(backend);
            store.save(&session_with(&["a", "b"], 0)).unwrap();
        }

        let backend = Arc::new(FileKeyValueStore::open(path.clone()).unwrap());
        assert_eq!(backend.path(), path.as_path());
        let snapshot = SessionStore::new(backend).restore().unwrap();
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.active_index, Some(0));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_store_opens_empty_and_keeps_the_bad_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, b"{\"session.documents\": [\"file:///a.pdf\"").unwrap();

        let backend = Arc::new(FileKeyValueStore::open(path.clone()).unwrap());
        assert_eq!(backend.get_string(DOCUMENTS_KEY, "").unwrap(), "");
        assert!(path.with_extension("json.corrupt").exists());

        let store = SessionStore::new(backend);
        assert!(store.restore().unwrap().is_empty());
        store.save(&session_with(&["a"], 0)).unwrap();
        assert_eq!(store.restore().unwrap().entries.len(), 1);
    }

    #[test]
    fn malformed_pages_keep_the_documents() {
        let backend = Arc::new(MemoryKeyValueStore::new());
        backend
            .put_string(DOCUMENTS_KEY, r#"["file:///a.pdf","file:///b.pdf"]"#)
            .unwrap();
        backend.put_string(PAGES_KEY, "[3, -1]").unwrap();
        backend.put_int(ACTIVE_INDEX_KEY, 1).unwrap();

        let snapshot = SessionStore::new(backend).restore().unwrap();
        let locators: Vec<_> = snapshot.locators().collect();
        assert_eq!(locators, ["file:///a.pdf", "file:///b.pdf"]);
        assert!(snapshot.entries.iter().all(|e| e.current_page == 0));
        assert_eq!(snapshot.active_index, Some(1));
    }

    #[test]
    fn pages_stored_with_the_wrong_type_are_ignored() {
        let backend = Arc::new(MemoryKeyValueStore::new());
        backend.put_string(DOCUMENTS_KEY, r#"["file:///a.pdf"]"#).unwrap();
        backend.put_int(PAGES_KEY, 4).unwrap();

        let snapshot = SessionStore::new(backend).restore().unwrap();
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].current_page, 0);
    }

    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryKeyValueStore,
        writes: Mutex<Vec<String>>,
    }

    impl KeyValueStore for RecordingStore {
        fn get_string(&self, key: &str, default: &str) -> Result<String, StoreError> {
            self.inner.get_string(key, default)
        }

        fn put_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.writes.lock().push(key.to_owned());
            self.inner.put_string(key, value)
        }

        fn get_int(&self, key: &str, default: i64) -> Result<i64, StoreError> {
            self.inner.get_int(key, default)
        }

        fn put_int(&self, key: &str, value: i64) -> Result<(), StoreError> {
            self.writes.lock().push(key.to_owned());
            self.inner.put_int(key, value)
        }
    }

    #[test]
    fn document_list_is_written_last() {
        let backend = Arc::new(RecordingStore::default());
        let store = SessionStore::new(backend.clone());
        store.save(&session_with(&["a", "b"], 1)).unwrap();

        assert_eq!(
            backend.writes.lock().as_slice(),
            [PAGES_KEY, ACTIVE_INDEX_KEY, DOCUMENTS_KEY]
        );
        assert_eq!(store.restore().unwrap().entries.len(), 2);
    }

    #[test]
    fn file_store_commits_a_snapshot_in_one_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        let backend = Arc::new(FileKeyValueStore::open(path.clone()).unwrap());
        SessionStore::new(backend)
            .save(&session_with(&["a", "b"], 1))
            .unwrap();

        let on_disk: BTreeMap<String, StoredValue> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.get(ACTIVE_INDEX_KEY), Some(&StoredValue::Int(1)));
        assert_eq!(
            on_disk.get(PAGES_KEY),
            Some(&StoredValue::Text("[0,0]".to_owned()))
        );
        assert!(matches!(on_disk.get(DOCUMENTS_KEY), Some(StoredValue::Text(_))));
    }
}
