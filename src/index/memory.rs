//! In-memory sorted-view [`Index`]. An ordered map keyed by file basename
//! (giving binary-search-equivalent insert/lookup without hand-rolled
//! index bookkeeping) plus a side map from address to the basenames that
//! carry it, kept in file-path order.

use super::{should_skip, Index};
use crate::account::Account;
use crate::error::{Error, Result};
use alloy_primitives::Address;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

const STALE_MARKER_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Default, Clone)]
struct FileEntry {
    address: Option<Address>,
    encrypted_key: Option<Vec<u8>>,
    generation: u64,
}

#[derive(Default)]
struct Inner {
    by_file: BTreeMap<String, FileEntry>,
    by_addr: HashMap<Address, BTreeSet<String>>,
    stale_markers: HashMap<Address, Instant>,
    generation: u64,
}

pub struct MemoryIndex {
    dir: PathBuf,
    inner: RwLock<Inner>,
}

impl MemoryIndex {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), inner: RwLock::new(Inner::default()) }
    }

    fn joined(&self, basename: &str) -> PathBuf {
        self.dir.join(basename)
    }

    fn basename_of(path: &Path) -> String {
        path.file_name().unwrap_or(path.as_os_str()).to_string_lossy().into_owned()
    }

    async fn reconcile(&self, hint: Option<&[PathBuf]>) -> Vec<Error> {
        let mut errors = Vec::new();
        let current_gen = {
            let mut inner = self.inner.write().unwrap();
            inner.generation += 1;
            inner.generation
        };

        // Phase A: drop entries whose backing file is gone; touch the
        // generation of entries that still exist.
        let candidates: Vec<String> = {
            let inner = self.inner.read().unwrap();
            match hint {
                Some(paths) => paths.iter().map(|p| Self::basename_of(p)).collect(),
                None => inner.by_file.keys().cloned().collect(),
            }
        };
        for basename in &candidates {
            let path = self.joined(basename);
            let exists = path.is_file();
            let mut inner = self.inner.write().unwrap();
            if let Some(entry) = inner.by_file.get_mut(basename) {
                if exists {
                    entry.generation = current_gen;
                } else {
                    let addr = entry.address;
                    inner.by_file.remove(basename);
                    if let Some(addr) = addr {
                        if let Some(set) = inner.by_addr.get_mut(&addr) {
                            set.remove(basename);
                            if set.is_empty() {
                                inner.by_addr.remove(&addr);
                            }
                        }
                    }
                }
            }
        }
        {
            let mut inner = self.inner.write().unwrap();
            let now = Instant::now();
            inner.stale_markers.retain(|_, seen| now.duration_since(*seen) < STALE_MARKER_TTL);
        }

        // Phase B: ingest files that weren't touched above (new, or not
        // covered by the hint at all).
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
        let batch_size = crate::config::reconcile_batch_size(false);
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
                Self::apply_batch(&self.inner, &mut batch, current_gen);
                break;
            };
            inflight -= 1;
            match joined {
                Ok(Ok((basename, address, bytes))) => {
                    batch.push((basename, address, bytes));
                    if batch.len() >= batch_size {
                        Self::apply_batch(&self.inner, &mut batch, current_gen);
                    }
                }
                Ok(Err((_basename, e))) => errors.push(e),
                Err(join_err) => errors.push(Error::Configuration(format!("reconcile task panicked: {join_err}"))),
            }
        }

        errors
    }

    /// Applies a batch of parsed files under a single write-lock
    /// acquisition, so Phase B's lock contention scales with the number
    /// of batches rather than the number of files.
    fn apply_batch(inner_lock: &RwLock<Inner>, batch: &mut Vec<(String, Address, Vec<u8>)>, current_gen: u64) {
        if batch.is_empty() {
            return;
        }
        let mut inner = inner_lock.write().unwrap();
        for (basename, address, bytes) in batch.drain(..) {
            // Skip files Phase A already confirmed present this cycle with
            // a resolved address (avoids redundant re-parse cost when
            // `hint` overlaps an already-indexed file).
            let needs_update = inner
                .by_file
                .get(&basename)
                .map(|e| e.generation != current_gen || e.address.is_none())
                .unwrap_or(true);
            if needs_update {
                let entry = inner.by_file.entry(basename.clone()).or_default();
                entry.generation = current_gen;
                entry.encrypted_key = Some(bytes);
                if entry.address != Some(address) {
                    if let Some(old) = entry.address {
                        if let Some(set) = inner.by_addr.get_mut(&old) {
                            set.remove(&basename);
                        }
                    }
                    entry.address = Some(address);
                }
                inner.by_addr.entry(address).or_default().insert(basename);
            }
        }
    }
}

#[async_trait]
impl Index for MemoryIndex {
    fn accounts(&self) -> Vec<Account> {
        let inner = self.inner.read().unwrap();
        inner
            .by_file
            .iter()
            .filter_map(|(basename, entry)| {
                entry.address.map(|address| Account {
                    address,
                    file: self.joined(basename),
                    encrypted_key: entry.encrypted_key.clone(),
                })
            })
            .collect()
    }

    fn has_address(&self, address: Address) -> bool {
        let inner = self.inner.read().unwrap();
        inner.by_addr.get(&address).map(|s| !s.is_empty()).unwrap_or(false)
    }

    fn add(&self, account: Account) {
        let mut inner = self.inner.write().unwrap();
        let gen = inner.generation;
        if account.has_file() {
            let basename = Self::basename_of(&account.file);
            let entry = inner.by_file.entry(basename.clone()).or_default();
            entry.generation = gen;
            if account.encrypted_key.is_some() {
                entry.encrypted_key = account.encrypted_key.clone();
            }
            if account.address != Address::ZERO {
                if entry.address != Some(account.address) {
                    if let Some(old) = entry.address {
                        if let Some(set) = inner.by_addr.get_mut(&old) {
                            set.remove(&basename);
                        }
                    }
                    entry.address = Some(account.address);
                }
                inner.by_addr.entry(account.address).or_default().insert(basename);
            }
        } else if account.address != Address::ZERO {
            inner.stale_markers.entry(account.address).or_insert_with(Instant::now);
        }
    }

    fn delete(&self, account: &Account) {
        let mut inner = self.inner.write().unwrap();
        if account.has_file() {
            let basename = Self::basename_of(&account.file);
            if let Some(entry) = inner.by_file.remove(&basename) {
                if let Some(addr) = entry.address {
                    if let Some(set) = inner.by_addr.get_mut(&addr) {
                        set.remove(&basename);
                        if set.is_empty() {
                            inner.by_addr.remove(&addr);
                        }
                    }
                }
            }
        } else {
            inner.stale_markers.remove(&account.address);
        }
    }

    fn find(&self, query: &Account) -> Result<Account> {
        let inner = self.inner.read().unwrap();
        if query.has_file() {
            let basename = Self::basename_of(&query.file);
            if let Some(entry) = inner.by_file.get(&basename) {
                if let Some(address) = entry.address {
                    return Ok(Account {
                        address,
                        file: self.joined(&basename),
                        encrypted_key: entry.encrypted_key.clone(),
                    });
                }
            }
            if query.address == Address::ZERO {
                return Err(Error::NoMatch);
            }
        }

        if query.address != Address::ZERO {
            let Some(basenames) = inner.by_addr.get(&query.address) else {
                return Err(Error::NoMatch);
            };
            let matches: Vec<Account> = basenames
                .iter()
                .map(|b| Account {
                    address: query.address,
                    file: self.joined(b),
                    encrypted_key: inner.by_file.get(b).and_then(|e| e.encrypted_key.clone()),
                })
                .collect();
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

    async fn close(&self) {}
}
