//! Durable account state.
//!
//! [`AccountStore`] keeps every account in memory and mirrors it to a
//! [`SnapshotBackend`] with whole-snapshot semantics: each write produces the
//! complete next map, saves it, and only then replaces the in-memory copy.
//! Writes are serialized store-wide; reads never wait for a save.

use crate::account::{Account, AccountId};
use crate::allocator::AddressIndex;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Account snapshot: the full mapping persisted by a backend.
pub type Snapshot = HashMap<AccountId, Account>;

/// Failure to load or save a snapshot.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Filesystem failure.
    #[error("I/O error on {}", path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The snapshot could not be serialized.
    #[error("cannot encode snapshot")]
    Encode(#[source] serde_json::Error),

    /// The stored snapshot is not valid JSON for the expected shape.
    #[error("corrupt snapshot {}", path.display())]
    Decode {
        /// File involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A backend refused the write for a reason of its own.
    #[error("snapshot backend unavailable: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },
}

/// Load/save interface of the persistence collaborator.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Reads the last saved snapshot; a backend with nothing saved yet returns an empty map.
    async fn load(&self) -> Result<Snapshot, PersistenceError>;

    /// Atomically replaces the saved snapshot.
    async fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON file backend
// ─────────────────────────────────────────────────────────────────────────────

/// Snapshot stored as one pretty-printed JSON object keyed by account id.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    /// Creates a backend for `path`. Nothing is touched until the first load or save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotBackend for JsonFileBackend {
    #[instrument(name = "store::load", skip(self), fields(path = %self.path.display()))]
    async fn load(&self) -> Result<Snapshot, PersistenceError> {
        let snapshot: Snapshot = read_json_file(&self.path).await?.unwrap_or_default();
        debug!(accounts = snapshot.len(), "Loaded account snapshot");
        Ok(snapshot)
    }

    #[instrument(name = "store::save", skip_all, fields(path = %self.path.display(), accounts = snapshot.len()))]
    async fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        write_json_file(&self.path, snapshot).await
    }
}

/// Reads a JSON file; a missing or empty file yields `None`.
pub(crate) async fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistenceError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistenceError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| PersistenceError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

/// Writes JSON next to `path` and renames it into place.
pub(crate) async fn write_json_file<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let io_error = |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    };

    let bytes = serde_json::to_vec_pretty(value).map_err(PersistenceError::Encode)?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await.map_err(io_error)?;
    }

    // Unique per call: concurrent writers of the same file must not share a temp file.
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await.map_err(io_error)?;
    if let Err(source) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_error(source));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory backend
// ─────────────────────────────────────────────────────────────────────────────

/// Backend that keeps the snapshot in memory. Used when no storage directory is
/// configured, and in tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    snapshot: StdMutex<Snapshot>,
    fail_saves: AtomicBool,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend pre-loaded with accounts.
    pub fn with_accounts(accounts: impl IntoIterator<Item = Account>) -> Self {
        let snapshot = accounts.into_iter().map(|a| (a.id(), a)).collect();
        Self {
            snapshot: StdMutex::new(snapshot),
            fail_saves: AtomicBool::new(false),
        }
    }

    /// Copy of the last saved snapshot.
    #[must_use]
    pub fn saved(&self) -> Snapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Makes every following save fail with [`PersistenceError::Backend`].
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SnapshotBackend for MemoryBackend {
    async fn load(&self) -> Result<Snapshot, PersistenceError> {
        Ok(self.saved())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(PersistenceError::Backend {
                message: "saves disabled".into(),
            });
        }
        *self
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// Process-wide account container, loaded once and mirrored on every write.
pub struct AccountStore {
    accounts: RwLock<Snapshot>,
    backend: Arc<dyn SnapshotBackend>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for AccountStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountStore").finish_non_exhaustive()
    }
}

impl AccountStore {
    /// Loads the backend's snapshot.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the snapshot cannot be read.
    pub async fn open(backend: Arc<dyn SnapshotBackend>) -> Result<Self, PersistenceError> {
        let accounts = backend.load().await?;
        Ok(Self {
            accounts: RwLock::new(accounts),
            backend,
            write_lock: Mutex::new(()),
        })
    }

    /// Copy of one account.
    pub async fn get(&self, id: AccountId) -> Option<Account> {
        self.accounts.read().await.get(&id).cloned()
    }

    /// Returns `true` if the account exists.
    pub async fn contains(&self, id: AccountId) -> bool {
        self.accounts.read().await.contains_key(&id)
    }

    /// Copies of all accounts, oldest first.
    pub async fn list(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self.accounts.read().await.values().cloned().collect();
        accounts.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then(a.id().cmp(&b.id())));
        accounts
    }

    /// Ids of all accounts.
    pub async fn ids(&self) -> Vec<AccountId> {
        self.accounts.read().await.keys().copied().collect()
    }

    /// Number of accounts.
    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    /// Returns `true` if there are no accounts.
    pub async fn is_empty(&self) -> bool {
        self.accounts.read().await.is_empty()
    }

    /// Index of every address currently bound.
    pub async fn address_index(&self) -> AddressIndex {
        let accounts = self.accounts.read().await;
        let mut index = AddressIndex::new();
        for account in accounts.values() {
            if account.address().is_empty() {
                index.insert_prefix(account.prefix());
            } else {
                index.insert_address(account.address());
            }
        }
        index
    }

    /// Adds an account and persists.
    ///
    /// # Errors
    ///
    /// Returns the backend's error; the account is not added in that case.
    pub async fn insert(&self, account: Account) -> Result<(), PersistenceError> {
        self.commit(|accounts| {
            accounts.insert(account.id(), account);
            Some(())
        })
        .await
        .map(|_| ())
    }

    /// Removes an account and persists, returning it if it existed.
    ///
    /// # Errors
    ///
    /// Returns the backend's error; the account stays in that case.
    pub async fn remove(&self, id: AccountId) -> Result<Option<Account>, PersistenceError> {
        self.commit(|accounts| accounts.remove(&id)).await
    }

    /// Mutates one account and persists. Returns `None` without saving if the
    /// account does not exist (e.g. it was deleted meanwhile).
    ///
    /// # Errors
    ///
    /// Returns the backend's error; the mutation is discarded in that case.
    pub async fn update<T>(
        &self,
        id: AccountId,
        mutate: impl FnOnce(&mut Account) -> T,
    ) -> Result<Option<T>, PersistenceError> {
        self.commit(|accounts| accounts.get_mut(&id).map(mutate)).await
    }

    /// Applies `mutate` to a copy of the map; a `Some` result is saved and swapped in.
    async fn commit<T>(&self, mutate: impl FnOnce(&mut Snapshot) -> Option<T>) -> Result<Option<T>, PersistenceError> {
        let _write = self.write_lock.lock().await;

        let mut next = self.accounts.read().await.clone();
        let Some(out) = mutate(&mut next) else {
            return Ok(None);
        };

        self.backend.save(&next).await?;
        *self.accounts.write().await = next;
        Ok(Some(out))
    }
}
