//! The index's external identity of a key.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// `(address, file)` uniquely identifies an account. Addresses are not
/// unique on their own: two files may legitimately encode the same key
/// (e.g. the same key imported twice).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub file: PathBuf,
    /// The raw encrypted JSON payload, cached so the persistent index can
    /// answer `find` without a second disk read.
    pub encrypted_key: Option<Vec<u8>>,
}

impl Account {
    pub fn new(address: Address, file: impl Into<PathBuf>) -> Self {
        Self { address, file: file.into(), encrypted_key: None }
    }

    /// A query account naming only a file (used with [`Index::find`](crate::index::Index::find)).
    pub fn by_file(file: impl Into<PathBuf>) -> Self {
        Self { address: Address::ZERO, file: file.into(), encrypted_key: None }
    }

    /// A query account naming only an address.
    pub fn by_address(address: Address) -> Self {
        Self { address, file: PathBuf::new(), encrypted_key: None }
    }

    pub fn has_file(&self) -> bool {
        !self.file.as_os_str().is_empty()
    }

    /// Basename of `file`, used as the canonical key in both index
    /// variants regardless of whether the caller passed a relative or
    /// absolute path.
    pub fn basename(&self) -> &std::ffi::OsStr {
        self.file.file_name().unwrap_or(self.file.as_os_str())
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.file == other.file
    }
}
impl Eq for Account {}

/// Completes a bare filename against the keystore directory; absolute
/// paths pass through unchanged.
pub fn join_path(dir: &Path, name: &Path) -> PathBuf {
    if name.is_absolute() {
        name.to_path_buf()
    } else {
        dir.join(name)
    }
}
