//! `sled`-backed [`Index`] variant: survives process restarts without a
//! full directory rescan. Three named trees mirror the in-memory
//! variant's two maps plus a small stats bucket.
//!
//! - `byFile`: basename -> `StoredEntry` (bincode-free, serde_json values
//!   since entries are small and human-inspectable with `sled`'s own
//!   tooling).
//! - `byAddr`: `address.as_slice() ++ basename` -> `()`, so a prefix scan
//!   over the 20 address bytes lists every file carrying that address in
//!   file order.
//! - `stats`: a handful of housekeeping counters (`lastUpdated`, scan
//!   generation).

use super::{should_skip, Index};
use crate::account::Account;
use crate::error::{Error, Result};
use alloy_primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sled::transaction::TransactionError;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinSet;

const STALE_MARKER_TTL_SECS: u64 = 24 * 3600;
const GENERATION_KEY: &[u8] = b"generation";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    address: Option<[u8; 20]>,
    encrypted_key: Option<Vec<u8>>,
    generation: u64,
}

pub struct PersistentIndex {
    dir: PathBuf,
    db: sled::Db,
    by_file: sled::Tree,
    by_addr: sled::Tree,
    stats: sled::Tree,
}

impl PersistentIndex {
    pub fn open(dir: impl Into<PathBuf>, db_path: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.into();
        let db = sled::open(db_path.as_ref()).map_err(|e| Error::Index(e.to_string()))?;
        let by_file = db.open_tree("byFile").map_err(|e| Error::Index(e.to_string()))?;
        let by_addr = db.open_tree("byAddr").map_err(|e| Error::Index(e.to_string()))?;
        let stats = db.open_tree("stats").map_err(|e| Error::Index(e.to_string()))?;
        Ok(Self { dir, db, by_file, by_addr, stats })
    }

    fn joined(&self, basename: &str) -> PathBuf {
        self.dir.join(basename)
    }

    fn basename_of(path: &Path) -> String {
        path.file_name().unwrap_or(path.as_os_str()).to_string_lossy().into_owned()
    }

    fn by_addr_key(address: Address, basename: &str) -> Vec<u8> {
        let mut key = address.as_slice().to_vec();
        key.extend_from_slice(basename.as_bytes());
        key
    }

    fn get_entry(&self, basename: &str) -> Option<StoredEntry> {
        self.by_file
            .get(basename.as_bytes())
            .ok()
            .flatten()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    fn put_entry(&self, basename: &str, entry: &StoredEntry) -> Result<()> {
        let bytes = serde_json::to_vec(entry)
            .map_err(|e| Error::Index(format!("failed to serialize index entry: {e}")))?;
        self.by_file
            .insert(basename.as_bytes(), bytes)
            .map_err(|e| Error::Index(e.to_string()))?;
        Ok(())
    }

    fn bump_generation(&self) -> Result<u64> {
        let next = self
            .stats
            .update_and_fetch(GENERATION_KEY, |old| {
                let current = old
                    .and_then(|b| b.try_into().ok())
                    .map(u64::from_be_bytes)
                    .unwrap_or(0);
                Some((current + 1).to_be_bytes().to_vec())
            })
            .map_err(|e| Error::Index(e.to_string()))?;
        Ok(next.map(|b| u64::from_be_bytes(b.as_ref().try_into().unwrap())).unwrap_or(1))
    }

    fn touch_last_updated(&self) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        self.stats
            .insert(b"lastUpdated", now.to_be_bytes().to_vec())
            .map_err(|e| Error::Index(e.to_string()))?;
        Ok(())
    }

    /// Upserts `byFile` and `byAddr` for one basename inside a single
    /// `sled` transaction, so a failure partway through never leaves the
    /// two trees disagreeing about a file's address.
    fn transactional_upsert(
        &self,
        basename: &str,
        entry: &StoredEntry,
        old_addr_key: Option<Vec<u8>>,
        new_addr_key: Option<Vec<u8>>,
    ) -> Result<()> {
        let entry_bytes = serde_json::to_vec(entry)
            .map_err(|e| Error::Index(format!("failed to serialize index entry: {e}")))?;
        let basename_bytes = basename.as_bytes().to_vec();
        let result: std::result::Result<(), TransactionError<()>> =
            (&self.by_file, &self.by_addr).transaction(|(tx_file, tx_addr)| {
                tx_file.insert(basename_bytes.as_slice(), entry_bytes.clone())?;
                if let Some(old_key) = &old_addr_key {
                    if Some(old_key) != new_addr_key.as_ref() {
                        tx_addr.remove(old_key.as_slice())?;
                    }
                }
                if let Some(new_key) = &new_addr_key {
                    tx_addr.insert(new_key.as_slice(), &[][..])?;
                }
                Ok(())
            });
        result.map_err(|e| Error::Index(e.to_string()))
    }

    /// Removes a basename from both trees inside a single transaction.
    fn transactional_remove(&self, basename: &str, addr_key: Option<Vec<u8>>) -> Result<()> {
        let basename_bytes = basename.as_bytes().to_vec();
        let result: std::result::Result<(), TransactionError<()>> =
            (&self.by_file, &self.by_addr).transaction(|(tx_file, tx_addr)| {
                tx_file.remove(basename_bytes.as_slice())?;
                if let Some(key) = &addr_key {
                    tx_addr.remove(key.as_slice())?;
                }
                Ok(())
            });
        result.map_err(|e| Error::Index(e.to_string()))
    }

    /// Upserts a batch of freshly-parsed files in one transaction, so
    /// Phase B commits ≈`reconcile_batch_size` writes at a time instead
    /// of one per file.
    fn transactional_upsert_batch(&self, batch: &mut Vec<(String, Address, Vec<u8>)>, current_gen: u64) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut prepared = Vec::with_capacity(batch.len());
        for (basename, address, bytes) in batch.drain(..) {
            let old_addr = self.get_entry(&basename).and_then(|e| e.address);
            let entry =
                StoredEntry { address: Some(address.into_array()), encrypted_key: Some(bytes), generation: current_gen };
            let entry_bytes = serde_json::to_vec(&entry)
                .map_err(|e| Error::Index(format!("failed to serialize index entry: {e}")))?;
            let new_key = Self::by_addr_key(address, &basename);
            let old_key = old_addr
                .filter(|old| *old != address.into_array())
                .map(|old| Self::by_addr_key(Address::from(old), &basename));
            prepared.push((basename, entry_bytes, old_key, new_key));
        }

        let result: std::result::Result<(), TransactionError<()>> =
            (&self.by_file, &self.by_addr).transaction(|(tx_file, tx_addr)| {
                for (basename, entry_bytes, old_key, new_key) in &prepared {
                    tx_file.insert(basename.as_bytes(), entry_bytes.clone())?;
                    if let Some(old_key) = old_key {
                        tx_addr.remove(old_key.as_slice())?;
                    }
                    tx_addr.insert(new_key.as_slice(), &[][..])?;
                }
                Ok(())
            });
        result.map_err(|e| Error::Index(e.to_string()))
    }

    async fn reconcile(&self, hint: Option<&[PathBuf]>) -> Vec<Error> {
        let mut errors = Vec::new();
        let current_gen = match self.bump_generation() {
            Ok(g) => g,
            Err(e) => {
                errors.push(e);
                return errors;
            }
        };

        let candidates: Vec<String> = match hint {
            Some(paths) => paths.iter().map(|p| Self::basename_of(p)).collect(),
            None => self
                .by_file
                .iter()
                .keys()
                .filter_map(|k| k.ok())
                .map(|k| String::from_utf8_lossy(&k).into_owned())
                .collect(),
        };

        for basename in &candidates {
            let path = self.joined(basename);
            if path.is_file() {
                if let Some(mut entry) = self.get_entry(basename) {
                    entry.generation = current_gen;
                    if let Err(e) = self.put_entry(basename, &entry) {
                        errors.push(e);
                    }
                }
            } else if let Some(entry) = self.get_entry(basename) {
                let addr_key = entry.address.map(|raw| Self::by_addr_key(Address::from(raw), basename));
                if let Err(e) = self.transactional_remove(basename, addr_key) {
                    errors.push(e);
                }
            }
        }

        // Address-only bookkeeping entries (empty-file markers) older than
        // 24h are dropped, mirroring the in-memory variant's stale_markers.
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let empty_markers: Vec<(sled::IVec, sled::IVec)> = self
            .by_addr
            .iter()
            .filter_map(|r| r.ok())
            .filter(|(k, _)| k.len() == 20)
            .collect();
        for (key, value) in empty_markers {
            let seen = value.as_ref().try_into().ok().map(u64::from_be_bytes).unwrap_or(now);
            if now.saturating_sub(seen) > STALE_MARKER_TTL_SECS {
                let _ = self.by_addr.remove(key);
            }
        }

        let to_scan: Vec<PathBuf> = match hint {
            Some(paths) => paths.to_vec(),
            None => match std::fs::read_dir(&self.dir) {
                Ok(entries) => entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| !should_skip(p))
                    .collect(),
                Err(e) => {
                    errors.push(Error::Io(e));
                    Vec::new()
                }
            },
        };

        let limit = crate::config::reconcile_fanout_limit();
        let batch_size = crate::config::reconcile_batch_size(true);
        let mut join_set = JoinSet::new();
        let mut pending = to_scan.into_iter();
        let mut inflight = 0usize;
        let mut batch: Vec<(String, Address, Vec<u8>)> = Vec::with_capacity(batch_size.min(4096));

        loop {
            while inflight < limit {
                let Some(path) = pending.next() else { break };
                if should_skip(&path) {
                    continue;
                }
                inflight += 1;
                join_set.spawn_blocking(move || {
                    let basename = Self::basename_of(&path);
                    match std::fs::read(&path) {
                        Ok(bytes) => match super::parse_address(&bytes) {
                            Ok(address) => Ok((basename, address, bytes)),
                            Err(e) => Err((basename, e)),
                        },
                        Err(e) => Err((basename, Error::Io(e))),
                    }
                });
            }
            let Some(joined) = join_set.join_next().await else {
                if let Err(e) = self.transactional_upsert_batch(&mut batch, current_gen) {
                    errors.push(e);
                }
                break;
            };
            inflight -= 1;
            match joined {
                Ok(Ok((basename, address, bytes))) => {
                    let needs_update = self
                        .get_entry(&basename)
                        .map(|e| e.generation != current_gen || e.address.is_none())
                        .unwrap_or(true);
                    if needs_update {
                        batch.push((basename, address, bytes));
                        if batch.len() >= batch_size {
                            if let Err(e) = self.transactional_upsert_batch(&mut batch, current_gen) {
                                errors.push(e);
                            }
                        }
                    }
                }
                Ok(Err((_basename, e))) => errors.push(e),
                Err(join_err) => errors.push(Error::Index(format!("reconcile task panicked: {join_err}"))),
            }
        }

        if let Err(e) = self.touch_last_updated() {
            errors.push(e);
        }
        errors
    }
}

#[async_trait]
impl Index for PersistentIndex {
    fn accounts(&self) -> Vec<Account> {
        self.by_file
            .iter()
            .filter_map(|r| r.ok())
            .filter_map(|(k, v)| {
                let basename = String::from_utf8_lossy(&k).into_owned();
                let entry: StoredEntry = serde_json::from_slice(&v).ok()?;
                let address = entry.address?;
                Some(Account {
                    address: Address::from(address),
                    file: self.joined(&basename),
                    encrypted_key: entry.encrypted_key,
                })
            })
            .collect()
    }

    fn has_address(&self, address: Address) -> bool {
        self.by_addr
            .scan_prefix(address.as_slice())
            .keys()
            .next()
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    fn add(&self, account: Account) {
        if account.has_file() {
            let basename = Self::basename_of(&account.file);
            let mut entry = self.get_entry(&basename).unwrap_or(StoredEntry {
                address: None,
                encrypted_key: None,
                generation: 0,
            });
            if account.encrypted_key.is_some() {
                entry.encrypted_key = account.encrypted_key.clone();
            }
            let old_addr_key = entry.address.map(|old| Self::by_addr_key(Address::from(old), &basename));
            let new_addr_key = if account.address != Address::ZERO {
                entry.address = Some(account.address.into_array());
                Some(Self::by_addr_key(account.address, &basename))
            } else {
                old_addr_key.clone()
            };
            let _ = self.transactional_upsert(&basename, &entry, old_addr_key, new_addr_key);
        } else if account.address != Address::ZERO {
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
            let _ = self.by_addr.insert(account.address.as_slice().to_vec(), now.to_be_bytes().to_vec());
        }
    }

    fn delete(&self, account: &Account) {
        if account.has_file() {
            let basename = Self::basename_of(&account.file);
            if let Some(entry) = self.get_entry(&basename) {
                let addr_key = entry.address.map(|addr| Self::by_addr_key(Address::from(addr), &basename));
                let _ = self.transactional_remove(&basename, addr_key);
            }
        } else {
            let _ = self.by_addr.remove(account.address.as_slice().to_vec());
        }
    }

    fn find(&self, query: &Account) -> Result<Account> {
        if query.has_file() {
            let basename = Self::basename_of(&query.file);
            if let Some(entry) = self.get_entry(&basename) {
                if let Some(address) = entry.address {
                    return Ok(Account {
                        address: Address::from(address),
                        file: self.joined(&basename),
                        encrypted_key: entry.encrypted_key,
                    });
                }
            }
            if query.address == Address::ZERO {
                return Err(Error::NoMatch);
            }
        }

        if query.address != Address::ZERO {
            let mut matches = Vec::new();
            for item in self.by_addr.scan_prefix(query.address.as_slice()) {
                let (key, _) = item.map_err(|e| Error::Index(e.to_string()))?;
                if key.len() == 20 {
                    continue; // bare address-only bookkeeping marker
                }
                let basename = String::from_utf8_lossy(&key[20..]).into_owned();
                let encrypted_key = self.get_entry(&basename).and_then(|e| e.encrypted_key);
                matches.push(Account { address: query.address, file: self.joined(&basename), encrypted_key });
            }
            return match matches.len() {
                0 => Err(Error::NoMatch),
                1 => Ok(matches.into_iter().next().unwrap()),
                _ => Err(Error::AmbiguousAddress { address: query.address, matches }),
            };
        }

        Err(Error::NoMatch)
    }

    async fn reload(&self) -> Vec<Error> {
        self.reconcile(None).await
    }

    async fn sync_from_disk(&self, changed: &[PathBuf]) -> Vec<Error> {
        if changed.is_empty() {
            self.reconcile(None).await
        } else {
            self.reconcile(Some(changed)).await
        }
    }

    async fn close(&self) {
        let _ = self.db.flush_async().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScryptParams;
    use crate::store::KeyStore;

    fn open_index() -> (tempfile::TempDir, tempfile::TempDir, PersistentIndex) {
        let keys_dir = tempfile::tempdir().unwrap();
        let db_dir = tempfile::tempdir().unwrap();
        let index = PersistentIndex::open(keys_dir.path(), db_dir.path().join("accounts.db")).unwrap();
        (keys_dir, db_dir, index)
    }

    fn write_key(store: &KeyStore, seed: u8) -> (Address, PathBuf) {
        store.insert(&[seed; 32], "pw").unwrap()
    }

    /// Confirms `byFile` and `byAddr` always agree after an upsert/delete
    /// cycle driven through the transactional helpers directly (not just
    /// through `reconcile`).
    fn assert_trees_agree(index: &PersistentIndex) {
        for item in index.by_addr.iter() {
            let (key, _) = item.unwrap();
            if key.len() == 20 {
                continue;
            }
            let basename = String::from_utf8_lossy(&key[20..]).into_owned();
            assert!(index.get_entry(&basename).is_some(), "byAddr references a basename missing from byFile: {basename}");
        }
        for item in index.by_file.iter() {
            let (k, v) = item.unwrap();
            let basename = String::from_utf8_lossy(&k).into_owned();
            let entry: StoredEntry = serde_json::from_slice(&v).unwrap();
            if let Some(addr) = entry.address {
                let key = PersistentIndex::by_addr_key(Address::from(addr), &basename);
                assert!(index.by_addr.get(&key).unwrap().is_some(), "byFile entry {basename} has no matching byAddr key");
            }
        }
    }

    #[tokio::test]
    async fn reload_finds_files_written_directly_to_disk() {
        let (keys_dir, _db_dir, index) = open_index();
        let store = KeyStore::new(keys_dir.path(), ScryptParams::LIGHT);
        let (addr1, _) = write_key(&store, 1);
        let (addr2, _) = write_key(&store, 2);

        let errors = index.reload().await;
        assert!(errors.is_empty());
        assert_eq!(index.accounts().len(), 2);
        assert!(index.has_address(addr1));
        assert!(index.has_address(addr2));
        assert_trees_agree(&index);
    }

    #[tokio::test]
    async fn add_and_delete_update_both_trees_consistently() {
        let (_keys_dir, _db_dir, index) = open_index();
        let address = Address::with_last_byte(9);
        let account = Account { address, file: PathBuf::from("UTC--x--a"), encrypted_key: Some(vec![1, 2, 3]) };
        index.add(account.clone());
        assert!(index.has_address(address));
        assert_eq!(index.accounts().len(), 1);
        assert_trees_agree(&index);

        index.delete(&account);
        assert!(!index.has_address(address));
        assert_eq!(index.accounts().len(), 0);
        assert_trees_agree(&index);
    }

    #[tokio::test]
    async fn find_prefers_an_exact_file_hit_over_address_lookup() {
        let (_keys_dir, _db_dir, index) = open_index();
        let address = Address::with_last_byte(4);
        index.add(Account { address, file: PathBuf::from("UTC--x--f1"), encrypted_key: None });

        let found = index.find(&Account::by_file(PathBuf::from("UTC--x--f1"))).unwrap();
        assert_eq!(found.address, address);
    }

    #[tokio::test]
    async fn find_by_address_is_ambiguous_across_two_files() {
        let (_keys_dir, _db_dir, index) = open_index();
        let address = Address::with_last_byte(5);
        index.add(Account { address, file: PathBuf::from("UTC--x--a"), encrypted_key: None });
        index.add(Account { address, file: PathBuf::from("UTC--x--b"), encrypted_key: None });

        match index.find(&Account::by_address(address)) {
            Err(Error::AmbiguousAddress { matches, .. }) => assert_eq!(matches.len(), 2),
            other => panic!("expected AmbiguousAddress, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reassigning_a_files_address_drops_the_stale_byaddr_entry() {
        let (_keys_dir, _db_dir, index) = open_index();
        let file = PathBuf::from("UTC--x--a");
        let first = Address::with_last_byte(1);
        let second = Address::with_last_byte(2);
        index.add(Account { address: first, file: file.clone(), encrypted_key: None });
        index.add(Account { address: second, file: file.clone(), encrypted_key: None });

        assert!(!index.has_address(first));
        assert!(index.has_address(second));
        assert_trees_agree(&index);
    }

    #[tokio::test]
    async fn reconcile_drops_entries_whose_file_disappeared() {
        let (keys_dir, _db_dir, index) = open_index();
        let store = KeyStore::new(keys_dir.path(), ScryptParams::LIGHT);
        let (address, file) = write_key(&store, 3);

        index.reload().await;
        assert!(index.has_address(address));

        std::fs::remove_file(&file).unwrap();
        index.reload().await;
        assert!(!index.has_address(address));
        assert!(index.accounts().is_empty());
        assert_trees_agree(&index);
    }

    #[tokio::test]
    async fn batched_reconcile_ingests_more_files_than_one_batch() {
        let (keys_dir, _db_dir, index) = open_index();
        let store = KeyStore::new(keys_dir.path(), ScryptParams::LIGHT);
        for seed in 0..5u8 {
            write_key(&store, seed);
        }

        let errors = index.reload().await;
        assert!(errors.is_empty());
        assert_eq!(index.accounts().len(), 5);
        assert_trees_agree(&index);
    }
}
