//! The decrypted private key. Never persisted in plaintext — it exists
//! only transiently during a sign operation or inside the [`UnlockTable`](crate::unlock::UnlockTable).

use alloy_primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use uuid::Uuid;
use zeroize::Zeroizing;

pub struct Key {
    pub id: Uuid,
    pub address: Address,
    pub private_key: Zeroizing<[u8; 32]>,
}

impl Key {
    pub fn new(id: Uuid, address: Address, private_key: [u8; 32]) -> Self {
        Self { id, address, private_key: Zeroizing::new(private_key) }
    }

    /// Build the ECDSA signer used for the actual `sign` call. Constructed
    /// on demand rather than stored, so the raw scalar in `self` remains
    /// the only copy outside the signer's own (also-zeroizing) storage.
    pub fn signer(&self) -> crate::error::Result<PrivateKeySigner> {
        PrivateKeySigner::from_bytes(&(*self.private_key).into())
            .map_err(|_| crate::error::Error::Decryption)
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key").field("id", &self.id).field("address", &self.address).finish()
    }
}

impl Clone for Key {
    fn clone(&self) -> Self {
        Key::new(self.id, self.address, *self.private_key)
    }
}
