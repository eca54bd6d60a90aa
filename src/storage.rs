//! Encrypted key-value storage seam
//!
//! The actual encrypted storage engine is an external collaborator; this
//! module defines the trait the stores talk to. Values are opaque bytes,
//! transparently encrypted by the implementation, namespaced into named
//! collections that can be enumerated.
//!
//! `MemoryStore` is a plain in-memory implementation used by tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{KeyError, KeyResult};

/// Collection names, one per store
pub mod collections {
    /// The device's own identity keypair
    pub const IDENTITY: &str = "identity";
    /// Trusted remote identities, keyed by peer:device
    pub const REMOTE_IDENTITIES: &str = "remote_identities";
    /// One-time pre-keys, keyed by ID
    pub const PREKEYS: &str = "prekeys";
    /// Signed pre-keys, keyed by ID
    pub const SIGNED_PREKEYS: &str = "signed_prekeys";
    /// Ratchet session records, keyed by peer:device
    pub const SESSIONS: &str = "sessions";
    /// Per-peer sender group keys (group-messaging extension)
    pub const SENDER_KEYS: &str = "sender_keys";
}

/// Key-value abstraction over the encrypted storage engine
///
/// No transactions: multi-key consistency is the caller's responsibility,
/// achieved by sequencing writes.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` if absent
    async fn get(&self, collection: &str, key: &str) -> KeyResult<Option<Vec<u8>>>;

    /// Write a value, overwriting any existing one
    async fn put(&self, collection: &str, key: &str, value: &[u8]) -> KeyResult<()>;

    /// Delete a value; deleting an absent key is not an error
    async fn delete(&self, collection: &str, key: &str) -> KeyResult<()>;

    /// Enumerate the keys of a collection
    async fn list_keys(&self, collection: &str) -> KeyResult<Vec<String>>;
}

/// In-memory implementation for tests and simulations
///
/// Clones share the same underlying map via `Arc`, so one instance can be
/// handed to several stores.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> KeyResult<std::sync::MutexGuard<'_, BTreeMap<String, BTreeMap<String, Vec<u8>>>>> {
        self.inner
            .lock()
            .map_err(|_| KeyError::Storage("Memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, collection: &str, key: &str) -> KeyResult<Option<Vec<u8>>> {
        let map = self.lock()?;
        Ok(map.get(collection).and_then(|c| c.get(key)).cloned())
    }

    async fn put(&self, collection: &str, key: &str, value: &[u8]) -> KeyResult<()> {
        let mut map = self.lock()?;
        map.entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> KeyResult<()> {
        let mut map = self.lock()?;
        if let Some(c) = map.get_mut(collection) {
            c.remove(key);
        }
        Ok(())
    }

    async fn list_keys(&self, collection: &str) -> KeyResult<Vec<String>> {
        let map = self.lock()?;
        Ok(map
            .get(collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }
}
