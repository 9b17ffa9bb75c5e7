//! Thin disk-I/O layer: reads a file and asks [`codec`] to decrypt it;
//! encrypts and writes atomically. Owns the keystore directory and the
//! scrypt parameters new/updated keys are encrypted with.

use crate::account::join_path;
use crate::codec::{self, EncryptedKeyRecord};
use crate::config::ScryptParams;
use crate::error::{Error, Result};
use crate::key::Key;
use alloy_primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use rand::RngCore;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Clone)]
pub struct KeyStore {
    dir: PathBuf,
    scrypt_params: ScryptParams,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>, scrypt_params: ScryptParams) -> Self {
        Self { dir: dir.into(), scrypt_params }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn scrypt_params(&self) -> ScryptParams {
        self.scrypt_params
    }

    /// Resolve a possibly-relative file name against the keystore
    /// directory.
    pub fn join_path(&self, name: impl AsRef<Path>) -> PathBuf {
        join_path(&self.dir, name.as_ref())
    }

    /// Read and decrypt a key file, verifying the decrypted address
    /// matches the file's declared `address` (swap-attack check).
    pub fn load(&self, file: impl AsRef<Path>, passphrase: &str) -> Result<Key> {
        let path = self.join_path(&file);
        let bytes = fs::read(&path)?;
        let record: EncryptedKeyRecord = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Configuration(format!("malformed keystore JSON: {e}")))?;

        let private_key = codec::decrypt(&record, passphrase)?;
        let signer = PrivateKeySigner::from_bytes(&private_key.into())
            .map_err(|_| Error::Decryption)?;
        let derived = signer.address();

        let declared: Address = record
            .address
            .parse::<AddressHex>()
            .map(|a| a.0)
            .map_err(|e| Error::Configuration(format!("invalid address field: {e}")))?;

        if declared != derived {
            return Err(Error::KeyContentMismatch { declared, derived });
        }

        let id = Uuid::parse_str(&record.id)
            .map_err(|e| Error::Configuration(format!("invalid id field: {e}")))?;
        Ok(Key::new(id, derived, private_key))
    }

    /// Generate a random key, encrypt, and write it under the canonical
    /// `UTC--<timestamp>Z--<address>` filename. Returns the written
    /// account path.
    pub fn insert_random(&self, passphrase: &str) -> Result<(Address, PathBuf)> {
        let mut raw = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        // A 32-byte CSPRNG draw has astronomically low odds of landing
        // outside the curve order; reject and redraw defensively.
        let signer = loop {
            if let Ok(s) = PrivateKeySigner::from_bytes(&raw.into()) {
                break s;
            }
            rand::rngs::OsRng.fill_bytes(&mut raw);
        };
        let address = signer.address();
        let file = self.write_new(&raw, address, passphrase)?;
        Ok((address, file))
    }

    /// Import the given 32-byte scalar (used by tests and by callers that
    /// already hold raw key material).
    pub fn insert(&self, raw_key: &[u8; 32], passphrase: &str) -> Result<(Address, PathBuf)> {
        let signer = PrivateKeySigner::from_bytes(&(*raw_key).into()).map_err(|_| Error::Decryption)?;
        let address = signer.address();
        let file = self.write_new(raw_key, address, passphrase)?;
        Ok((address, file))
    }

    fn write_new(&self, raw_key: &[u8; 32], address: Address, passphrase: &str) -> Result<PathBuf> {
        let record = codec::encrypt(raw_key, passphrase, self.scrypt_params)?;
        let filename = key_filename(address);
        let path = self.dir.join(&filename);
        self.write_atomic(&path, &record)?;
        Ok(path)
    }

    /// Re-encrypt under `new_passphrase` and atomically overwrite `file`.
    pub fn update(&self, file: impl AsRef<Path>, key: &Key, new_passphrase: &str) -> Result<()> {
        let record = codec::encrypt(&key.private_key, new_passphrase, self.scrypt_params)?;
        let path = self.join_path(&file);
        self.write_atomic(&path, &record)
    }

    fn write_atomic(&self, path: &Path, record: &EncryptedKeyRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let payload = serde_json::to_vec(record)
            .map_err(|e| Error::Configuration(format!("failed to serialize keystore: {e}")))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        set_owner_only_permissions(tmp.as_file())?;
        tmp.write_all(&payload)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    pub fn remove(&self, file: impl AsRef<Path>) -> Result<()> {
        let path = self.join_path(&file);
        fs::remove_file(path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_owner_only_permissions(file: &fs::File) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_file: &fs::File) -> Result<()> {
    // Non-POSIX platforms have no direct mode-0600 equivalent; the
    // nearest approximation (ACLs restricting the owner) is left to the
    // deployment environment.
    Ok(())
}

pub fn key_filename(address: Address) -> String {
    let now = chrono_like_timestamp();
    format!("UTC--{now}Z--{}", hex::encode(address))
}

/// `YYYY-MM-DDTHH-MM-SS.NNNNNNNNN` in UTC, matching the conventional
/// keystore filename grammar without pulling in a datetime crate for one
/// format call.
fn chrono_like_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = now.as_secs();
    let nanos = now.subsec_nanos();
    let (year, month, day, hour, min, sec) = civil_from_unix(secs as i64);
    format!("{year:04}-{month:02}-{day:02}T{hour:02}-{min:02}-{sec:02}.{nanos:09}")
}

/// Howard Hinnant's `civil_from_days` algorithm, adapted for a full
/// unix timestamp. Dependency-free proleptic-Gregorian conversion.
fn civil_from_unix(unix_secs: i64) -> (i64, u32, u32, u32, u32, u32) {
    let days = unix_secs.div_euclid(86_400);
    let secs_of_day = unix_secs.rem_euclid(86_400);
    let hour = (secs_of_day / 3600) as u32;
    let min = ((secs_of_day % 3600) / 60) as u32;
    let sec = (secs_of_day % 60) as u32;

    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = if month <= 2 { y + 1 } else { y };
    (year, month, day, hour, min, sec)
}

/// Parses a 40-hex-char address with or without a `0x` prefix.
struct AddressHex(Address);

impl std::str::FromStr for AddressHex {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let with_prefix = if s.starts_with("0x") || s.starts_with("0X") {
            s.to_string()
        } else {
            format!("0x{s}")
        };
        with_prefix.parse::<Address>().map(AddressHex).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path(), ScryptParams::LIGHT);
        (dir, store)
    }

    #[test]
    fn insert_then_load_roundtrips() {
        let (_dir, store) = store();
        let (address, file) = store.insert(&[0x07; 32], "hunter2").unwrap();
        let key = store.load(&file, "hunter2").unwrap();
        assert_eq!(key.address, address);
    }

    #[test]
    fn load_rejects_wrong_passphrase() {
        let (_dir, store) = store();
        let (_address, file) = store.insert(&[0x09; 32], "right").unwrap();
        assert!(matches!(store.load(&file, "wrong"), Err(Error::Decryption)));
    }

    #[test]
    fn update_reencrypts_and_invalidates_old_passphrase() {
        let (_dir, store) = store();
        let (_address, file) = store.insert(&[0x0a; 32], "old").unwrap();
        let key = store.load(&file, "old").unwrap();
        store.update(&file, &key, "new").unwrap();

        assert!(matches!(store.load(&file, "old"), Err(Error::Decryption)));
        let reloaded = store.load(&file, "new").unwrap();
        assert_eq!(reloaded.address, key.address);
    }

    #[test]
    fn remove_deletes_the_file() {
        let (_dir, store) = store();
        let (_address, file) = store.insert(&[0x0b; 32], "pw").unwrap();
        assert!(file.exists());
        store.remove(&file).unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn load_detects_swapped_address_field() {
        let (_dir, store) = store();
        let (_address, file) = store.insert(&[0x0c; 32], "pw").unwrap();
        let bytes = fs::read(&file).unwrap();
        let mut record: EncryptedKeyRecord = serde_json::from_slice(&bytes).unwrap();
        record.address = format!("0x{}", "00".repeat(20));
        fs::write(&file, serde_json::to_vec(&record).unwrap()).unwrap();
        assert!(matches!(store.load(&file, "pw"), Err(Error::KeyContentMismatch { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn written_keystore_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, store) = store();
        let (_address, file) = store.insert(&[0x0d; 32], "pw").unwrap();
        let mode = fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn key_filename_has_the_conventional_shape() {
        let name = key_filename(Address::ZERO);
        assert!(name.starts_with("UTC--"));
        assert!(name.ends_with(&hex::encode(Address::ZERO)));
    }

    #[test]
    fn civil_from_unix_matches_known_instants() {
        // 2021-01-01T00:00:00Z
        assert_eq!(civil_from_unix(1_609_459_200), (2021, 1, 1, 0, 0, 0));
        // 1970-01-01T00:00:00Z (unix epoch)
        assert_eq!(civil_from_unix(0), (1970, 1, 1, 0, 0, 0));
        // 2000-02-29T12:34:56Z (leap day)
        assert_eq!(civil_from_unix(951_827_696), (2000, 2, 29, 12, 34, 56));
    }
}
