//! Web3 Secret Storage codec: serializes/deserializes an encrypted key
//! record, decrypts v1 and v3, always encrypts as v3.

use crate::config::{ScryptParams, SCRYPT_DKLEN};
use crate::error::{Error, Result};
use alloy_signer_local::PrivateKeySigner;
use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use alloy_primitives::{keccak256, Address};
use cbc::cipher::BlockDecryptMut;
use rand::{rngs::OsRng, RngCore};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use uuid::Uuid;

type Aes128Ctr = ctr::Ctr64BE<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// On-disk JSON form. `version` is numeric for v3 and a
/// string for v1 in the wild, so it round-trips through [`Version`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKeyRecord {
    pub id: String,
    pub address: String,
    pub crypto: CryptoJson,
    pub version: Version,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Version {
    Number(u32),
    Text(String),
}

impl Version {
    fn as_u32(&self) -> Option<u32> {
        match self {
            Version::Number(n) => Some(*n),
            Version::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoJson {
    pub cipher: String,
    pub ciphertext: String,
    pub cipherparams: CipherParams,
    pub kdf: String,
    pub kdfparams: KdfParams,
    pub mac: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherParams {
    pub iv: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KdfParams {
    Scrypt {
        dklen: FlexInt,
        n: FlexInt,
        r: FlexInt,
        p: FlexInt,
        salt: String,
    },
    Pbkdf2 {
        dklen: FlexInt,
        c: FlexInt,
        prf: String,
        salt: String,
    },
}

/// A KDF parameter that may arrive as a JSON float (some writers encode
/// integers as floats); truncated to an integer on decode.
#[derive(Debug, Clone, Copy)]
pub struct FlexInt(i64);

impl FlexInt {
    pub fn positive_u32(self, field: &str) -> Result<u32> {
        if self.0 <= 0 {
            return Err(Error::Configuration(format!("{field} must be positive, got {}", self.0)));
        }
        Ok(self.0 as u32)
    }
}

impl From<u32> for FlexInt {
    fn from(v: u32) -> Self {
        FlexInt(v as i64)
    }
}

impl<'de> Deserialize<'de> for FlexInt {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Number::deserialize(deserializer)?;
        if let Some(i) = value.as_i64() {
            Ok(FlexInt(i))
        } else if let Some(f) = value.as_f64() {
            Ok(FlexInt(f.trunc() as i64))
        } else {
            Err(D::Error::custom("expected a numeric KDF parameter"))
        }
    }
}

impl Serialize for FlexInt {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

/// Encrypt a 32-byte private scalar as a v3 record.
pub fn encrypt(private_key: &[u8; 32], passphrase: &str, params: ScryptParams) -> Result<EncryptedKeyRecord> {
    let address = PrivateKeySigner::from_bytes(&(*private_key).into())
        .map_err(|_| Error::Decryption)?
        .address();

    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    let mut iv = [0u8; 16];
    OsRng.fill_bytes(&mut iv);

    let derived_key = scrypt_derive(passphrase, &salt, params, SCRYPT_DKLEN)?;

    let mut ciphertext = *private_key;
    let mut cipher = Aes128Ctr::new(derived_key[..16].into(), iv.as_slice().into());
    cipher.apply_keystream(&mut ciphertext);

    let mac = compute_mac(&derived_key[16..32], &ciphertext);

    Ok(EncryptedKeyRecord {
        id: Uuid::new_v4().to_string(),
        address: hex::encode(address),
        crypto: CryptoJson {
            cipher: "aes-128-ctr".to_string(),
            ciphertext: hex::encode(ciphertext),
            cipherparams: CipherParams { iv: hex::encode(iv) },
            kdf: "scrypt".to_string(),
            kdfparams: KdfParams::Scrypt {
                dklen: FlexInt::from(SCRYPT_DKLEN as u32),
                n: FlexInt::from(params.n),
                r: FlexInt::from(params.r),
                p: FlexInt::from(params.p),
                salt: hex::encode(salt),
            },
            mac: hex::encode(mac),
        },
        version: Version::Number(3),
    })
}

/// Decrypt a v1 or v3 record, dispatching on `version`/`kdf`/`cipher`.
pub fn decrypt(record: &EncryptedKeyRecord, passphrase: &str) -> Result<[u8; 32]> {
    let version = record
        .version
        .as_u32()
        .ok_or_else(|| Error::Configuration("unreadable keystore version".to_string()))?;

    let salt = hex::decode(kdf_salt(&record.crypto.kdfparams))
        .map_err(|_| Error::Configuration("invalid salt hex".to_string()))?;
    let dklen = kdf_dklen(&record.crypto.kdfparams)?;

    let derived_key = match record.crypto.kdf.as_str() {
        "scrypt" => {
            let (n, r, p) = scrypt_params(&record.crypto.kdfparams)?;
            scrypt_derive(passphrase, &salt, ScryptParams { n, r, p }, dklen)?
        }
        "pbkdf2" => pbkdf2_derive(passphrase, &salt, &record.crypto.kdfparams, dklen)?,
        other => return Err(Error::Configuration(format!("unsupported KDF: {other}"))),
    };

    let ciphertext = hex::decode(&record.crypto.ciphertext)
        .map_err(|_| Error::Configuration("invalid ciphertext hex".to_string()))?;
    let expected_mac = hex::decode(&record.crypto.mac)
        .map_err(|_| Error::Configuration("invalid MAC hex".to_string()))?;

    if expected_mac.len() != 32 || derived_key.len() < 32 {
        return Err(Error::Decryption);
    }
    let computed_mac = compute_mac(&derived_key[16..32], &ciphertext);
    if bool::from(computed_mac[..].ct_ne(&expected_mac[..])) {
        return Err(Error::Decryption);
    }

    let iv = hex::decode(&record.crypto.cipherparams.iv)
        .map_err(|_| Error::Configuration("invalid IV hex".to_string()))?;

    let plaintext = match (version, record.crypto.cipher.as_str()) {
        (3, "aes-128-ctr") => {
            let mut buf = ciphertext;
            let mut cipher = Aes128Ctr::new(derived_key[..16].into(), iv.as_slice().into());
            cipher.apply_keystream(&mut buf);
            buf
        }
        (1, _) => {
            // v1 uses AES-128-CBC with key = keccak256(derivedKey[:16])[:16].
            let cbc_key = keccak256(&derived_key[..16]);
            let mut buf = ciphertext;
            let decryptor = Aes128CbcDec::new(cbc_key[..16].into(), iv.as_slice().into());
            decryptor
                .decrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buf)
                .map_err(|_| Error::Decryption)?;
            buf.to_vec()
        }
        (_, other) => return Err(Error::Configuration(format!("unsupported cipher: {other}"))),
    };

    if plaintext.len() != 32 {
        return Err(Error::Decryption);
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&plaintext);
    Ok(key)
}

fn kdf_salt(params: &KdfParams) -> &str {
    match params {
        KdfParams::Scrypt { salt, .. } | KdfParams::Pbkdf2 { salt, .. } => salt,
    }
}

fn kdf_dklen(params: &KdfParams) -> Result<usize> {
    let dklen = match params {
        KdfParams::Scrypt { dklen, .. } | KdfParams::Pbkdf2 { dklen, .. } => *dklen,
    };
    Ok(dklen.positive_u32("dklen")? as usize)
}

fn scrypt_params(params: &KdfParams) -> Result<(u32, u32, u32)> {
    match params {
        KdfParams::Scrypt { n, r, p, .. } => {
            Ok((n.positive_u32("n")?, r.positive_u32("r")?, p.positive_u32("p")?))
        }
        KdfParams::Pbkdf2 { .. } => Err(Error::Configuration("expected scrypt kdfparams".to_string())),
    }
}

fn scrypt_derive(passphrase: &str, salt: &[u8], params: ScryptParams, dklen: usize) -> Result<Vec<u8>> {
    let log_n = (params.n as f64).log2();
    if log_n.fract() != 0.0 || log_n < 1.0 {
        return Err(Error::Configuration(format!("scrypt N must be a power of two, got {}", params.n)));
    }
    let scrypt_params = scrypt::Params::new(log_n as u8, params.r, params.p, dklen)
        .map_err(|e| Error::Configuration(format!("invalid scrypt params: {e}")))?;
    let mut out = vec![0u8; dklen];
    scrypt::scrypt(passphrase.as_bytes(), salt, &scrypt_params, &mut out)
        .map_err(|e| Error::Configuration(format!("scrypt derivation failed: {e}")))?;
    Ok(out)
}

fn pbkdf2_derive(passphrase: &str, salt: &[u8], params: &KdfParams, dklen: usize) -> Result<Vec<u8>> {
    let (c, prf) = match params {
        KdfParams::Pbkdf2 { c, prf, .. } => (c.positive_u32("c")?, prf.as_str()),
        KdfParams::Scrypt { .. } => return Err(Error::Configuration("expected pbkdf2 kdfparams".to_string())),
    };
    if prf != "hmac-sha256" {
        return Err(Error::Configuration(format!("unsupported PRF: {prf}")));
    }
    let mut out = vec![0u8; dklen];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(passphrase.as_bytes(), salt, c, &mut out);
    Ok(out)
}

fn compute_mac(key_half: &[u8], ciphertext: &[u8]) -> [u8; 32] {
    let mut input = Vec::with_capacity(key_half.len() + ciphertext.len());
    input.extend_from_slice(key_half);
    input.extend_from_slice(ciphertext);
    keccak256(&input).0
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: [u8; 32] = [
        0xac, 0x09, 0x74, 0xbe, 0xc3, 0x9a, 0x17, 0xe3, 0x6b, 0xa4, 0xa6, 0xb4, 0xd2, 0x38, 0xff,
        0x94, 0x4b, 0xac, 0xb4, 0x78, 0xcb, 0xed, 0x5e, 0xfc, 0xae, 0x78, 0x4d, 0x7b, 0xf4, 0xf2,
        0xff, 0x80,
    ];

    #[test]
    fn roundtrip_scrypt() {
        let record = encrypt(&TEST_KEY, "hunter2", ScryptParams { n: 1 << 10, r: 8, p: 1 }).unwrap();
        let recovered = decrypt(&record, "hunter2").unwrap();
        assert_eq!(recovered, TEST_KEY);
        assert_eq!(record.version.as_u32(), Some(3));
        assert_eq!(record.crypto.kdf, "scrypt");
    }

    #[test]
    fn wrong_passphrase_fails_with_undifferentiated_error() {
        let record = encrypt(&TEST_KEY, "hunter2", ScryptParams { n: 1 << 10, r: 8, p: 1 }).unwrap();
        let err = decrypt(&record, "wrong").unwrap_err();
        assert!(matches!(err, Error::Decryption));
    }

    #[test]
    fn tampered_ciphertext_fails_mac() {
        let mut record = encrypt(&TEST_KEY, "hunter2", ScryptParams { n: 1 << 10, r: 8, p: 1 }).unwrap();
        let mut bytes = hex::decode(&record.crypto.ciphertext).unwrap();
        bytes[0] ^= 0xff;
        record.crypto.ciphertext = hex::encode(bytes);
        assert!(matches!(decrypt(&record, "hunter2"), Err(Error::Decryption)));
    }

    #[test]
    fn decrypt_v1_cbc() {
        // Hand-construct a v1 record the way a legacy geth keystore would.
        let salt = [7u8; 32];
        let iv = [9u8; 16];
        let params = ScryptParams { n: 1 << 10, r: 8, p: 1 };
        let derived = scrypt_derive("legacy-pass", &salt, params, 32).unwrap();
        let cbc_key = keccak256(&derived[..16]);

        let mut ciphertext = TEST_KEY.to_vec();
        let encryptor = cbc::Encryptor::<Aes128>::new(cbc_key[..16].into(), iv.as_slice().into());
        use cbc::cipher::BlockEncryptMut;
        let ct_len = encryptor
            .encrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut ciphertext, 32)
            .unwrap()
            .len();
        ciphertext.truncate(ct_len);

        let mac = compute_mac(&derived[16..32], &ciphertext);

        let record = EncryptedKeyRecord {
            id: Uuid::new_v4().to_string(),
            address: hex::encode(Address::ZERO),
            crypto: CryptoJson {
                cipher: "aes-128-cbc".to_string(),
                ciphertext: hex::encode(&ciphertext),
                cipherparams: CipherParams { iv: hex::encode(iv) },
                kdf: "scrypt".to_string(),
                kdfparams: KdfParams::Scrypt {
                    dklen: FlexInt::from(32),
                    n: FlexInt::from(params.n),
                    r: FlexInt::from(params.r),
                    p: FlexInt::from(params.p),
                    salt: hex::encode(salt),
                },
                mac: hex::encode(mac),
            },
            version: Version::Text("1".to_string()),
        };

        let recovered = decrypt(&record, "legacy-pass").unwrap();
        assert_eq!(recovered, TEST_KEY);
    }

    #[test]
    fn rejects_non_positive_kdf_params() {
        let mut record = encrypt(&TEST_KEY, "hunter2", ScryptParams { n: 1 << 10, r: 8, p: 1 }).unwrap();
        if let KdfParams::Scrypt { n, .. } = &mut record.crypto.kdfparams {
            *n = FlexInt(0);
        }
        assert!(matches!(decrypt(&record, "hunter2"), Err(Error::Configuration(_))));
    }

    #[test]
    fn rejects_unsupported_prf() {
        let record = EncryptedKeyRecord {
            id: Uuid::new_v4().to_string(),
            address: hex::encode(Address::ZERO),
            crypto: CryptoJson {
                cipher: "aes-128-ctr".to_string(),
                ciphertext: hex::encode([0u8; 32]),
                cipherparams: CipherParams { iv: hex::encode([0u8; 16]) },
                kdf: "pbkdf2".to_string(),
                kdfparams: KdfParams::Pbkdf2 {
                    dklen: FlexInt::from(32),
                    c: FlexInt::from(1000),
                    prf: "hmac-sha512".to_string(),
                    salt: hex::encode([0u8; 32]),
                },
                mac: hex::encode([0u8; 32]),
            },
            version: Version::Number(3),
        };
        assert!(matches!(decrypt(&record, "x"), Err(Error::Configuration(_))));
    }
}
