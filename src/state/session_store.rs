use crate::error::StoreError;
use crate::types::{Session, UserProfile};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

const KEYRING_SERVICE: &str = "com.knowyourstats.client";

pub const KEY_ACCESS_TOKEN: &str = "access_token";
pub const KEY_REFRESH_TOKEN: &str = "refresh_token";
pub const KEY_USER: &str = "user";

const SESSION_KEYS: [&str; 3] = [KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN, KEY_USER];

/// Durable key-value storage. Writes and removals always cover the whole
/// entry set handed in, never a subset of it.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set_all(&self, entries: &[(&str, String)]) -> Result<(), StoreError>;
    fn remove_all(&self, keys: &[&str]) -> Result<(), StoreError>;
}

/// JSON object on disk, rewritten through a temp file and rename.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(data) if data.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if map.is_empty() {
            return match std::fs::remove_file(&self.path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(map)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_map()?.remove(key))
    }

    fn set_all(&self, entries: &[(&str, String)]) -> Result<(), StoreError> {
        let mut map = self.read_map().unwrap_or_default();
        for (key, value) in entries {
            map.insert(key.to_string(), value.clone());
        }
        self.write_map(&map)
    }

    fn remove_all(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut map = self.read_map().unwrap_or_default();
        for key in keys {
            map.remove(*key);
        }
        self.write_map(&map)
    }
}

/// OS keychain / secret service, one entry per key.
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new() -> Self {
        Self::with_service(KEYRING_SERVICE)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, keyring::Error> {
        keyring::Entry::new(&self.service, key)
    }

    pub fn is_available(&self) -> bool {
        let Ok(entry) = self.entry(KEY_ACCESS_TOKEN) else {
            return false;
        };

        match entry.get_password() {
            Ok(_) => true,
            Err(keyring::Error::NoEntry) => true,
            Err(keyring::Error::BadEncoding(_)) => true,
            Err(keyring::Error::Ambiguous(_)) => true,
            Err(keyring::Error::NoStorageAccess(_)) => false,
            Err(keyring::Error::PlatformFailure(_)) => false,
            Err(_) => false,
        }
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for KeyringBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_all(&self, entries: &[(&str, String)]) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.entry(key)?.set_password(value)?;
        }
        Ok(())
    }

    fn remove_all(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut first_error = None;
        for key in keys {
            let result = self.entry(key).and_then(|entry| entry.delete_credential());
            match result {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    entries: std::sync::Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set_all(&self, entries: &[(&str, String)]) -> Result<(), StoreError> {
        let mut map = self.lock();
        for (key, value) in entries {
            map.insert(key.to_string(), value.clone());
        }
        Ok(())
    }

    fn remove_all(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut map = self.lock();
        for key in keys {
            map.remove(*key);
        }
        Ok(())
    }
}

/// The three persisted values. Only ever constructed complete.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedSession {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserProfile,
}

impl From<PersistedSession> for Session {
    fn from(value: PersistedSession) -> Self {
        Session {
            access_token: Some(value.access_token),
            refresh_token: Some(value.refresh_token),
            user: Some(value.user),
        }
    }
}

enum Cached {
    Unloaded,
    Loaded(Option<PersistedSession>),
}

/// Write-through cache over a [`StorageBackend`]. Cloning shares both the
/// backend and the cache.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn StorageBackend>,
    cached: Arc<Mutex<Cached>>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl SessionStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            cached: Arc::new(Mutex::new(Cached::Unloaded)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    fn read_backend(&self) -> Result<Option<PersistedSession>, StoreError> {
        let access = non_empty(self.backend.get(KEY_ACCESS_TOKEN)?);
        let refresh = non_empty(self.backend.get(KEY_REFRESH_TOKEN)?);
        let user = non_empty(self.backend.get(KEY_USER)?);

        let (Some(access_token), Some(refresh_token), Some(user)) = (access, refresh, user) else {
            return Ok(None);
        };
        let user = match serde_json::from_str::<UserProfile>(&user) {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(error = %e, "cached user profile is unreadable, ignoring session");
                return Ok(None);
            }
        };

        Ok(Some(PersistedSession {
            access_token,
            refresh_token,
            user,
        }))
    }

    fn load_locked(&self, cached: &mut Cached) -> Result<Option<PersistedSession>, StoreError> {
        if let Cached::Loaded(value) = cached {
            return Ok(value.clone());
        }
        let value = self.read_backend()?;
        *cached = Cached::Loaded(value.clone());
        Ok(value)
    }

    fn write_locked(&self, cached: &mut Cached, session: PersistedSession) -> Result<(), StoreError> {
        let user = serde_json::to_string(&session.user)?;
        self.backend.set_all(&[
            (KEY_ACCESS_TOKEN, session.access_token.clone()),
            (KEY_REFRESH_TOKEN, session.refresh_token.clone()),
            (KEY_USER, user),
        ])?;
        *cached = Cached::Loaded(Some(session));
        Ok(())
    }

    /// The complete persisted session, or `None` when any of the three
    /// keys is missing.
    pub async fn load(&self) -> Result<Option<PersistedSession>, StoreError> {
        let mut cached = self.cached.lock().await;
        self.load_locked(&mut cached)
    }

    pub async fn access_token(&self) -> Option<String> {
        match self.load().await {
            Ok(session) => session.map(|s| s.access_token),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read persisted session");
                None
            }
        }
    }

    pub async fn refresh_token(&self) -> Option<String> {
        match self.load().await {
            Ok(session) => session.map(|s| s.refresh_token),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read persisted session");
                None
            }
        }
    }

    pub async fn save(&self, session: PersistedSession) -> Result<(), StoreError> {
        let mut cached = self.cached.lock().await;
        self.write_locked(&mut cached, session)
    }

    /// Rewrites the stored session with a new access token, and a new
    /// refresh token when the server rotated it. Only applies while the
    /// stored refresh token is still `expected_refresh`; returns `false`
    /// without writing otherwise.
    pub async fn replace_tokens(
        &self,
        expected_refresh: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut cached = self.cached.lock().await;
        let Some(mut session) = self.load_locked(&mut cached)? else {
            return Ok(false);
        };
        if session.refresh_token != expected_refresh {
            return Ok(false);
        }
        session.access_token = access_token.to_string();
        if let Some(refresh_token) = refresh_token {
            session.refresh_token = refresh_token.to_string();
        }
        self.write_locked(&mut cached, session)?;
        Ok(true)
    }

    pub async fn replace_user(&self, user: UserProfile) -> Result<bool, StoreError> {
        let mut cached = self.cached.lock().await;
        let Some(mut session) = self.load_locked(&mut cached)? else {
            return Ok(false);
        };
        session.user = user;
        self.write_locked(&mut cached, session)?;
        Ok(true)
    }

    /// Removes all three keys. The cache is emptied even if the backend
    /// fails, so nothing stale is served afterwards.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut cached = self.cached.lock().await;
        *cached = Cached::Loaded(None);
        self.backend.remove_all(&SESSION_KEYS)
    }

    /// Like [`clear`](Self::clear), but only while the stored refresh token
    /// is `expected_refresh` (`None`: no complete session is stored).
    pub async fn clear_if_current(&self, expected_refresh: Option<&str>) -> Result<bool, StoreError> {
        let mut cached = self.cached.lock().await;
        let current = self.load_locked(&mut cached)?;
        if current.as_ref().map(|s| s.refresh_token.as_str()) != expected_refresh {
            return Ok(false);
        }
        *cached = Cached::Loaded(None);
        self.backend.remove_all(&SESSION_KEYS)?;
        Ok(true)
    }
}
