//! The account manager façade: the one type external
//! callers hold. Composes [`KeyStore`], an [`Index`] trait object, and
//! an [`UnlockTable`], serializing every operation that touches the
//! unlock table or the on-disk key files through a single mutex, so
//! `new_account`/`delete_account`/`update`/`timed_unlock`/`lock`/`sign`
//! can't race each other or the background [`watcher`]. Without this, a
//! `timed_unlock` racing a `delete_account` on the same address could
//! install a fresh unlock entry right after the delete clears it but
//! before the file is actually gone, letting a subsequent `sign` succeed
//! against a deleted account.
//!
//! `accounts` and `has_address` are the only reads that bypass the mutex
//! — they go straight to the Index's own lock, which is safe because
//! they never touch the unlock table.

use crate::account::Account;
use crate::config::{IndexKind, ScryptParams};
use crate::error::{Error, Result};
use crate::index::{Index, MemoryIndex, PersistentIndex};
use crate::store::KeyStore;
use crate::unlock::UnlockTable;
use crate::watcher::{self, WatcherHandle};
use alloy_primitives::{Address, Signature, B256};
use alloy_signer::Signer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct Manager {
    store: KeyStore,
    index: Arc<dyn Index>,
    unlock: UnlockTable,
    mutation_lock: Mutex<()>,
    watcher: Option<WatcherHandle>,
}

pub struct ManagerConfig {
    pub dir: PathBuf,
    pub scrypt_params: ScryptParams,
    pub index_kind: IndexKind,
    /// Required when `index_kind` is [`IndexKind::Persistent`]; the path
    /// to the `sled` database directory.
    pub index_db_path: Option<PathBuf>,
    pub start_watcher: bool,
}

impl ManagerConfig {
    pub fn memory(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            scrypt_params: ScryptParams::default(),
            index_kind: IndexKind::Memory,
            index_db_path: None,
            start_watcher: true,
        }
    }
}

impl Manager {
    /// Opens (or creates) the keystore directory, builds the selected
    /// Index variant, runs one full reload to populate it, and starts
    /// the background watcher unless disabled.
    pub async fn open(config: ManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let store = KeyStore::new(config.dir.clone(), config.scrypt_params);

        let index: Arc<dyn Index> = match config.index_kind {
            IndexKind::Memory => Arc::new(MemoryIndex::new(config.dir.clone())),
            IndexKind::Persistent => {
                let db_path = config.index_db_path.clone().ok_or_else(|| {
                    Error::Configuration("index_db_path is required for a persistent index".into())
                })?;
                Arc::new(PersistentIndex::open(config.dir.clone(), db_path)?)
            }
        };

        for err in index.reload().await {
            tracing::warn!(error = %err, "error during initial reload");
        }

        let watcher = config.start_watcher.then(|| watcher::spawn(config.dir.clone(), index.clone()));

        Ok(Self { store, index, unlock: UnlockTable::new(), mutation_lock: Mutex::new(()), watcher })
    }

    pub fn dir(&self) -> &Path {
        self.store.dir()
    }

    /// All known accounts, ordered by file path.
    pub fn accounts(&self) -> Vec<Account> {
        self.index.accounts()
    }

    pub fn has_address(&self, address: Address) -> bool {
        self.index.has_address(address)
    }

    /// Resolves `index` into the account at that position in the
    /// (stable) ordered `accounts()` view.
    pub fn account_by_index(&self, index: usize) -> Result<Account> {
        self.accounts().into_iter().nth(index).ok_or(Error::NoMatch)
    }

    /// Generates a random key, encrypts it, writes it to disk, and adds
    /// it to the index before returning.
    pub async fn new_account(&self, passphrase: String) -> Result<Account> {
        let _guard = self.mutation_lock.lock().await;
        let store = self.store.clone();
        let (address, file) =
            tokio::task::spawn_blocking(move || store.insert_random(&passphrase)).await.map_err(join_err)??;
        let account = Account::new(address, file);
        self.index.add(account.clone());
        Ok(account)
    }

    /// Imports an existing 32-byte private key.
    pub async fn import_key(&self, raw_key: [u8; 32], passphrase: String) -> Result<Account> {
        let _guard = self.mutation_lock.lock().await;
        let store = self.store.clone();
        let (address, file) =
            tokio::task::spawn_blocking(move || store.insert(&raw_key, &passphrase)).await.map_err(join_err)??;
        let account = Account::new(address, file);
        self.index.add(account.clone());
        Ok(account)
    }

    /// Re-encrypts the account's key file under a new passphrase. The old
    /// passphrase must still decrypt the current file.
    pub async fn update(&self, account: &Account, old_passphrase: &str, new_passphrase: &str) -> Result<()> {
        let _guard = self.mutation_lock.lock().await;
        let resolved = self.index.find(account)?;
        let store = self.store.clone();
        let file = resolved.file.clone();
        let old_passphrase = old_passphrase.to_string();
        let new_passphrase = new_passphrase.to_string();
        let key = {
            let store = store.clone();
            let file = file.clone();
            tokio::task::spawn_blocking(move || store.load(&file, &old_passphrase)).await.map_err(join_err)??
        };
        tokio::task::spawn_blocking(move || store.update(&file, &key, &new_passphrase))
            .await
            .map_err(join_err)??;
        Ok(())
    }

    pub async fn delete_account(&self, account: &Account, passphrase: &str) -> Result<()> {
        let _guard = self.mutation_lock.lock().await;
        let resolved = self.index.find(account)?;
        let store = self.store.clone();
        let file = resolved.file.clone();
        let passphrase = passphrase.to_string();
        {
            let store = store.clone();
            let file = file.clone();
            tokio::task::spawn_blocking(move || store.load(&file, &passphrase)).await.map_err(join_err)??;
        }
        self.unlock.lock(resolved.address);
        tokio::task::spawn_blocking(move || store.remove(&file)).await.map_err(join_err)??;
        self.index.delete(&resolved);
        Ok(())
    }

    /// Decrypts and holds the key in memory, indefinitely or until
    /// `duration` elapses or [`lock`](Manager::lock) is called.
    pub async fn timed_unlock(&self, account: &Account, passphrase: &str, duration: Option<Duration>) -> Result<()> {
        let _guard = self.mutation_lock.lock().await;
        let resolved = self.index.find(account)?;
        let store = self.store.clone();
        let file = resolved.file.clone();
        let passphrase = passphrase.to_string();
        let key = tokio::task::spawn_blocking(move || store.load(&file, &passphrase)).await.map_err(join_err)??;
        self.unlock.unlock(key, duration);
        Ok(())
    }

    pub async fn lock(&self, address: Address) {
        let _guard = self.mutation_lock.lock().await;
        self.unlock.lock(address);
    }

    /// Signs `hash` with the address's currently unlocked key. Serializes
    /// on the same mutex as every mutating call so a concurrent
    /// `delete_account`/`timed_unlock` can't install or remove the unlock
    /// entry out from under this read.
    pub async fn sign(&self, address: Address, hash: B256) -> Result<Signature> {
        let _guard = self.mutation_lock.lock().await;
        let key = self.unlock.get(address).ok_or(Error::Locked(address))?;
        key.signer()?.sign_hash(&hash).await.map_err(|_| Error::Decryption)
    }

    /// Signs without requiring a prior unlock; the passphrase decrypts
    /// the key for this call only, without touching the unlock table.
    pub async fn sign_with_passphrase(&self, account: &Account, passphrase: &str, hash: B256) -> Result<Signature> {
        let _guard = self.mutation_lock.lock().await;
        let resolved = self.index.find(account)?;
        let store = self.store.clone();
        let file = resolved.file.clone();
        let passphrase = passphrase.to_string();
        let key = tokio::task::spawn_blocking(move || store.load(&file, &passphrase)).await.map_err(join_err)??;
        key.signer()?.sign_hash(&hash).await.map_err(|_| Error::Decryption)
    }

    pub async fn close(self) {
        if let Some(watcher) = self.watcher {
            watcher.shutdown().await;
        }
        self.index.close().await;
    }
}

fn join_err(e: tokio::task::JoinError) -> Error {
    Error::Configuration(format!("background task panicked: {e}"))
}
