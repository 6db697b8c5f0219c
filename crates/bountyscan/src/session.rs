//! Local session storage.
//!
//! A process-local key/value store that survives restarts, plus the
//! session record the scan writes into it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub const USER_ID_KEY: &str = "userId";
pub const SESSION_ID_KEY: &str = "sessionId";
pub const SESSION_TIMESTAMP_KEY: &str = "sessionTimestamp";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session storage is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait SessionStorage: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<(), SessionError>;
    fn get(&self, key: &str) -> Result<Option<String>, SessionError>;
    fn remove(&self, key: &str) -> Result<(), SessionError>;
}

#[derive(Default)]
pub struct MemorySessionStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl SessionStorage for MemorySessionStorage {
    fn set(&self, key: &str, value: &str) -> Result<(), SessionError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<(), SessionError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// JSON object on disk, rewritten atomically on every change.
pub struct FileSessionStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSessionStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, SessionError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn modify(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>),
    ) -> Result<(), SessionError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.load()?;
        f(&mut entries);
        self.save(&entries)
    }
}

impl SessionStorage for FileSessionStorage {
    fn set(&self, key: &str, value: &str) -> Result<(), SessionError> {
        self.modify(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.remove(key))
    }

    fn remove(&self, key: &str) -> Result<(), SessionError> {
        self.modify(|entries| {
            entries.remove(key);
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub user_id: Uuid,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

/// Reads and writes the current session record.
#[derive(Clone)]
pub struct SessionManager {
    storage: Arc<dyn SessionStorage>,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        Self { storage }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySessionStorage::default()))
    }

    pub fn clear(&self) -> Result<(), SessionError> {
        for key in [USER_ID_KEY, SESSION_ID_KEY, SESSION_TIMESTAMP_KEY] {
            self.storage.remove(key)?;
        }
        tracing::debug!("local session cleared");
        Ok(())
    }

    /// Bind a new session to `user_id`, replacing whatever was stored.
    pub fn create(&self, user_id: Uuid) -> Result<Session, SessionError> {
        let timestamp_ms = Utc::now().timestamp_millis();
        let session = Session {
            session_id: format!("session-{user_id}-{timestamp_ms}"),
            user_id,
            timestamp_ms,
        };
        self.storage.set(USER_ID_KEY, &user_id.to_string())?;
        self.storage.set(SESSION_ID_KEY, &session.session_id)?;
        self.storage
            .set(SESSION_TIMESTAMP_KEY, &timestamp_ms.to_string())?;
        tracing::info!(%user_id, session_id = %session.session_id, "session created");
        Ok(session)
    }

    /// The stored session, if all of its keys are present and well formed.
    pub fn current(&self) -> Result<Option<Session>, SessionError> {
        let user_id = self
            .storage
            .get(USER_ID_KEY)?
            .and_then(|raw| Uuid::parse_str(&raw).ok());
        let session_id = self.storage.get(SESSION_ID_KEY)?;
        let timestamp_ms = self
            .storage
            .get(SESSION_TIMESTAMP_KEY)?
            .and_then(|raw| raw.parse::<i64>().ok());

        Ok(match (user_id, session_id, timestamp_ms) {
            (Some(user_id), Some(session_id), Some(timestamp_ms)) => Some(Session {
                session_id,
                user_id,
                timestamp_ms,
            }),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("bountyscan-session-{}", Uuid::new_v4()))
            .join("session.json")
    }

    #[test]
    fn test_create_supersedes_previous_session() {
        let sessions = SessionManager::in_memory();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        sessions.create(alice).unwrap();
        let session = sessions.create(bob).unwrap();

        let current = sessions.current().unwrap().unwrap();
        assert_eq!(current, session);
        assert_eq!(current.user_id, bob);
        assert!(current
            .session_id
            .starts_with(&format!("session-{bob}-")));
    }

    #[test]
    fn test_clear_removes_all_keys() {
        let storage = Arc::new(MemorySessionStorage::default());
        let sessions = SessionManager::new(storage.clone());
        sessions.create(Uuid::new_v4()).unwrap();
        sessions.clear().unwrap();

        assert!(sessions.current().unwrap().is_none());
        for key in [USER_ID_KEY, SESSION_ID_KEY, SESSION_TIMESTAMP_KEY] {
            assert!(storage.get(key).unwrap().is_none());
        }
    }

    #[test]
    fn test_partial_session_is_absent() {
        let storage = Arc::new(MemorySessionStorage::default());
        storage.set(USER_ID_KEY, &Uuid::new_v4().to_string()).unwrap();
        let sessions = SessionManager::new(storage.clone());
        assert!(sessions.current().unwrap().is_none());

        storage.set(SESSION_ID_KEY, "session-x").unwrap();
        storage.set(SESSION_TIMESTAMP_KEY, "yesterday").unwrap();
        assert!(sessions.current().unwrap().is_none());
    }

    #[test]
    fn test_file_storage_survives_reopen() {
        let path = temp_path();
        let user = Uuid::new_v4();
        {
            let sessions = SessionManager::new(Arc::new(FileSessionStorage::new(&path)));
            sessions.create(user).unwrap();
        }
        let sessions = SessionManager::new(Arc::new(FileSessionStorage::new(&path)));
        assert_eq!(sessions.current().unwrap().unwrap().user_id, user);

        sessions.clear().unwrap();
        assert!(sessions.current().unwrap().is_none());

        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[test]
    fn test_file_storage_missing_file_is_empty() {
        let storage = FileSessionStorage::new(temp_path());
        assert!(storage.get(USER_ID_KEY).unwrap().is_none());
    }

    #[test]
    fn test_file_storage_rejects_garbage() {
        let path = temp_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(&path, b"not json").unwrap();
        let storage = FileSessionStorage::new(&path);
        assert!(matches!(storage.get(USER_ID_KEY), Err(SessionError::Json(_))));

        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }
}
