//! Session persistence: access/refresh tokens and the cached user profile.
//!
//! [`TokenStore`] never fails. With no backend attached every call is a
//! no-op, and backend errors are logged and reported as "absent".

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use shared::protocol::{AuthTokens, User};
use tracing::{debug, error};

use crate::error::StoreError;

pub const ACCESS_TOKEN_KEY: &str = "thogmi_access_token";
pub const REFRESH_TOKEN_KEY: &str = "thogmi_refresh_token";
pub const USER_DATA_KEY: &str = "thogmi_user_data";

/// String key/value persistence, the equivalent of browser local storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// JSON object on disk, rewritten through a temp file on every change.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new())
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let encoded = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, encoded).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock();
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut entries = self.read_all()?;
        if entries.remove(key).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}

/// Process-wide session handle shared by the HTTP and chat clients.
#[derive(Clone, Default)]
pub struct TokenStore {
    backend: Option<Arc<dyn KeyValueStore>>,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// A store with nowhere to persist; every operation is a no-op.
    pub fn detached() -> Self {
        Self { backend: None }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    pub fn set_tokens(&self, tokens: &AuthTokens) {
        let Some(backend) = &self.backend else {
            return;
        };
        let result = backend
            .set(ACCESS_TOKEN_KEY, &tokens.access)
            .and_then(|()| backend.set(REFRESH_TOKEN_KEY, &tokens.refresh));
        if let Err(err) = result {
            error!("error storing tokens: {err}");
        }
    }

    /// Both tokens, or `None` if either is missing.
    pub fn get_tokens(&self) -> Option<AuthTokens> {
        let access = self.read(ACCESS_TOKEN_KEY)?;
        let refresh = self.read(REFRESH_TOKEN_KEY)?;
        Some(AuthTokens { access, refresh })
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(ACCESS_TOKEN_KEY)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read(REFRESH_TOKEN_KEY)
    }

    pub fn clear_tokens(&self) {
        let Some(backend) = &self.backend else {
            return;
        };
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_DATA_KEY] {
            if let Err(err) = backend.remove(key) {
                error!(key, "error clearing tokens: {err}");
            }
        }
    }

    pub fn clear_all(&self) {
        self.clear_tokens();
        debug!("session cleared");
    }

    pub fn set_user(&self, user: &User) {
        let Some(backend) = &self.backend else {
            return;
        };
        let result = serde_json::to_string(user)
            .map_err(StoreError::from)
            .and_then(|encoded| backend.set(USER_DATA_KEY, &encoded));
        if let Err(err) = result {
            error!("error storing user data: {err}");
        }
    }

    pub fn get_user(&self) -> Option<User> {
        let raw = self.read(USER_DATA_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(err) => {
                error!("error retrieving user data: {err}");
                None
            }
        }
    }

    /// True iff an access token is present. Expiry is the server's call.
    pub fn is_authenticated(&self) -> bool {
        self.access_token().is_some()
    }

    fn read(&self, key: &str) -> Option<String> {
        let backend = self.backend.as_ref()?;
        match backend.get(key) {
            Ok(value) => value,
            Err(err) => {
                error!(key, "error retrieving session value: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
