//! Tracks which addresses are currently unlocked and for how long. A
//! timed unlock schedules its own expiration; a second `timedUnlock` call
//! on the same address unconditionally replaces the first, whether it
//! lengthens or shortens the remaining time.
//!
//! The override is framed as an abort signal on the superseded timer. A
//! generation counter gets the same race-free behavior without a
//! channel: each entry carries a `generation`, bumped on every unlock
//! call; an expiration task fires only if its captured generation still
//! matches the live one when its sleep completes. Without this check, a
//! call that *shortens* the unlock window would still leave the original
//! (longer) expiration task scheduled, which would delete the newer
//! entry out from under it once the old deadline arrived.

use alloy_primitives::Address;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::key::Key;

struct Entry {
    key: Key,
    generation: u64,
    expires_at: Option<Instant>,
    expiry_task: Option<JoinHandle<()>>,
}

/// Shared across clones; `Manager` holds one behind its own serialization
/// so callers never race each other's unlock/lock calls.
#[derive(Clone)]
pub struct UnlockTable {
    inner: Arc<Mutex<HashMap<Address, Entry>>>,
}

impl Default for UnlockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl UnlockTable {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Unlocks `key` indefinitely, or for `duration` if given. Always
    /// replaces whatever unlock state currently exists for this address.
    pub fn unlock(&self, key: Key, duration: Option<Duration>) {
        let address = key.address;
        let new_deadline = duration.map(|d| Instant::now() + d);

        let generation = {
            let mut table = self.inner.lock().unwrap();
            let generation = table.get(&address).map(|e| e.generation + 1).unwrap_or(0);
            if let Some(old) = table.remove(&address) {
                if let Some(task) = old.expiry_task {
                    task.abort();
                }
            }
            table.insert(address, Entry { key, generation, expires_at: new_deadline, expiry_task: None });
            generation
        };

        if let Some(deadline) = new_deadline {
            let table = self.inner.clone();
            let handle = tokio::spawn(async move {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(remaining).await;
                let mut table = table.lock().unwrap();
                if let Some(entry) = table.get(&address) {
                    if entry.generation == generation {
                        table.remove(&address);
                    }
                }
            });
            if let Some(entry) = self.inner.lock().unwrap().get_mut(&address) {
                if entry.generation == generation {
                    entry.expiry_task = Some(handle);
                }
            }
        }
    }

    pub fn is_unlocked(&self, address: Address) -> bool {
        self.inner.lock().unwrap().contains_key(&address)
    }

    pub fn get(&self, address: Address) -> Option<Key> {
        self.inner.lock().unwrap().get(&address).map(|e| e.key.clone())
    }

    /// Explicit lock, overriding any remaining timed unlock.
    pub fn lock(&self, address: Address) {
        if let Some(entry) = self.inner.lock().unwrap().remove(&address) {
            if let Some(task) = entry.expiry_task {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn key(byte: u8) -> Key {
        let address = Address::with_last_byte(byte);
        Key::new(Uuid::new_v4(), address, [byte; 32])
    }

    #[tokio::test]
    async fn unlock_then_get_returns_the_key() {
        let table = UnlockTable::new();
        let k = key(1);
        let address = k.address;
        table.unlock(k, None);
        assert!(table.is_unlocked(address));
        assert_eq!(table.get(address).unwrap().address, address);
    }

    #[tokio::test]
    async fn lock_clears_unlock_state() {
        let table = UnlockTable::new();
        let k = key(2);
        let address = k.address;
        table.unlock(k, None);
        table.lock(address);
        assert!(!table.is_unlocked(address));
        assert!(table.get(address).is_none());
    }

    #[tokio::test]
    async fn indefinite_unlock_never_expires_on_its_own() {
        let table = UnlockTable::new();
        let k = key(3);
        let address = k.address;
        table.unlock(k, None);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(table.is_unlocked(address));
    }

    #[tokio::test]
    async fn unlock_expires_after_its_duration() {
        let table = UnlockTable::new();
        let k = key(4);
        let address = k.address;
        table.unlock(k, Some(Duration::from_millis(20)));
        assert!(table.is_unlocked(address));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!table.is_unlocked(address));
    }

    #[tokio::test]
    async fn second_unlock_call_replaces_the_first_key() {
        let table = UnlockTable::new();
        let first = key(5);
        let address = first.address;
        table.unlock(first, None);
        let second = Key::new(Uuid::new_v4(), address, [0xaa; 32]);
        table.unlock(second, None);
        assert_eq!(*table.get(address).unwrap().private_key, [0xaa; 32]);
    }

    /// Shortening an unlock must not leave the account unlocked past the
    /// new, shorter deadline just because a longer expiry task was already
    /// scheduled for the earlier call.
    #[tokio::test]
    async fn shortening_the_unlock_window_takes_effect() {
        let table = UnlockTable::new();
        let address = key(6).address;
        table.unlock(key(6), Some(Duration::from_millis(200)));
        table.unlock(key(6), Some(Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!table.is_unlocked(address));
    }

    /// Lengthening an unlock must abort the original (shorter) expiry task
    /// so it doesn't delete the newer, longer-lived entry out from under it.
    #[tokio::test]
    async fn lengthening_the_unlock_window_survives_the_original_deadline() {
        let table = UnlockTable::new();
        let address = key(7).address;
        table.unlock(key(7), Some(Duration::from_millis(20)));
        table.unlock(key(7), Some(Duration::from_millis(200)));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(table.is_unlocked(address));
    }
}
