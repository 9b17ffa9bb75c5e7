//! Error taxonomy shared by every component of the account manager.
//!
//! One enum on purpose: callers need to pattern-match `AmbiguousAddress`
//! to recover the candidate list and `Locked` to distinguish "no unlock"
//! from an I/O failure, so the taxonomy isn't split per-module.

use crate::account::Account;
use alloy_primitives::Address;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// `find` resolved to zero accounts.
    #[error("no matching account")]
    NoMatch,

    /// `find` resolved to two or more accounts sharing an address.
    #[error("address {address} is ambiguous ({} candidates)", matches.len())]
    AmbiguousAddress {
        address: Address,
        matches: Vec<Account>,
    },

    /// MAC mismatch, unsupported cipher/KDF, or wrong passphrase.
    /// Deliberately undifferentiated so it can't be used as a
    /// passphrase-guessing oracle.
    #[error("decryption failed")]
    Decryption,

    /// The key content's derived address doesn't match the file's
    /// declared `address` field (swap-attack detection).
    #[error("key content mismatch: file declares {declared} but decrypts to {derived}")]
    KeyContentMismatch { declared: Address, derived: Address },

    /// `sign` was called on an address with no live unlock.
    #[error("account {0} is locked")]
    Locked(Address),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unsupported KDF PRF, non-positive KDF parameters, malformed JSON.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("persistent index error: {0}")]
    Index(String),
}

pub type Result<T> = std::result::Result<T, Error>;
