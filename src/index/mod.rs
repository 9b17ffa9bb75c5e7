//! The address-and-file index: two interchangeable variants behind one
//! `Index` trait, so `Manager` never needs to know which one it holds.

pub mod memory;
pub mod persistent;

use crate::account::Account;
use crate::error::{Error, Result};
use alloy_primitives::Address;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub use memory::MemoryIndex;
pub use persistent::PersistentIndex;

#[async_trait]
pub trait Index: Send + Sync {
    /// Ordered by file path, copy-on-return.
    fn accounts(&self) -> Vec<Account>;

    fn has_address(&self, address: Address) -> bool;

    /// Idempotent on `(address, file)`. A query with only `file` or only
    /// `address` set is legal during a two-phase reconcile.
    fn add(&self, account: Account);

    fn delete(&self, account: &Account);

    /// Precedence: exact file hit wins outright; otherwise resolve by
    /// address, which may be ambiguous.
    fn find(&self, query: &Account) -> Result<Account>;

    /// Full reconcile against the filesystem.
    async fn reload(&self) -> Vec<Error>;

    /// Targeted reconcile over a specific set of changed paths, used by
    /// the Watcher after its debounce window fires. Falls back to a full
    /// [`reload`](Index::reload) when `changed` is empty.
    async fn sync_from_disk(&self, changed: &[PathBuf]) -> Vec<Error>;

    async fn close(&self);
}

/// A file is skipped during a directory scan if it: ends with `~`, is
/// hidden (leading `.`), is the persistent index file, is a directory,
/// or is not a regular file.
pub fn should_skip(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return true;
    };
    if name.ends_with('~') || name.starts_with('.') || name.ends_with("accounts.db") {
        return true;
    }
    match std::fs::symlink_metadata(path) {
        Ok(meta) => !meta.file_type().is_file(),
        Err(_) => true,
    }
}

pub(crate) fn resolve_query_file(dir: &Path, query_file: &Path) -> PathBuf {
    crate::account::join_path(dir, query_file)
}

/// Extracts the cleartext `address` field from a keystore JSON blob,
/// without touching `crypto` at all (no passphrase needed for this).
pub(crate) fn parse_address(bytes: &[u8]) -> Result<Address> {
    #[derive(serde::Deserialize)]
    struct Stub {
        address: String,
    }
    let stub: Stub = serde_json::from_slice(bytes)
        .map_err(|e| Error::Configuration(format!("malformed keystore JSON: {e}")))?;
    let with_prefix =
        if stub.address.starts_with("0x") { stub.address } else { format!("0x{}", stub.address) };
    with_prefix
        .parse::<Address>()
        .map_err(|e| Error::Configuration(format!("invalid address field: {e}")))
}
