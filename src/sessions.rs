//! Session record storage
//!
//! Ratchet session state is opaque to the lifecycle core; the session
//! protocol library (de)serializes it. This store keys records by
//! (peer, device), returns a fresh record when none exists, and provides
//! the delete cascades used when a contact is removed or the identity key
//! is regenerated.

use std::sync::Arc;

use crate::error::KeyResult;
use crate::health::HealthHandle;
use crate::storage::{collections, KeyValueStore};

/// Opaque ratchet state for one peer device
///
/// An empty record means no established session; callers use that as the
/// signal to perform key exchange first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    bytes: Vec<u8>,
}

impl SessionRecord {
    /// Wrap serialized ratchet state
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// The serialized ratchet state
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether this is an uninitialized record (no session established)
    pub fn is_fresh(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn record_key(peer: &str, device: u32) -> String {
    format!("{}:{}", peer, device)
}

/// Parse a stored key back into (peer, device)
///
/// Peer IDs may themselves contain `:`, so the device ID is split off the
/// end.
fn parse_record_key(key: &str) -> Option<(&str, u32)> {
    let (peer, device) = key.rsplit_once(':')?;
    Some((peer, device.parse().ok()?))
}

/// Manages per-peer-device ratchet session records
pub struct SessionStore {
    storage: Arc<dyn KeyValueStore>,
    health: HealthHandle,
}

impl SessionStore {
    /// Create a new session store
    pub fn new(storage: Arc<dyn KeyValueStore>, health: HealthHandle) -> Self {
        Self { storage, health }
    }

    /// Load the session for a peer device, or a fresh record if none exists
    pub async fn load(&self, peer: &str, device: u32) -> KeyResult<SessionRecord> {
        let bytes = self
            .storage
            .get(collections::SESSIONS, &record_key(peer, device))
            .await?;
        Ok(bytes.map(SessionRecord::new).unwrap_or_default())
    }

    /// Persist a (possibly ratchet-advanced) session record
    pub async fn store(&self, peer: &str, device: u32, record: &SessionRecord) -> KeyResult<()> {
        self.storage
            .put(collections::SESSIONS, &record_key(peer, device), record.bytes())
            .await?;
        self.refresh_count().await?;
        Ok(())
    }

    /// Delete the session for one peer device
    pub async fn delete(&self, peer: &str, device: u32) -> KeyResult<()> {
        self.storage
            .delete(collections::SESSIONS, &record_key(peer, device))
            .await?;
        self.refresh_count().await?;
        Ok(())
    }

    /// Delete all sessions for a peer (blocking or removing a contact)
    pub async fn delete_all_for_peer(&self, peer: &str) -> KeyResult<()> {
        for key in self.storage.list_keys(collections::SESSIONS).await? {
            if let Some((record_peer, _)) = parse_record_key(&key) {
                if record_peer == peer {
                    self.storage.delete(collections::SESSIONS, &key).await?;
                }
            }
        }
        self.refresh_count().await?;
        Ok(())
    }

    /// Delete every session (cascade primitive after identity regeneration)
    pub async fn delete_all(&self) -> KeyResult<()> {
        for key in self.storage.list_keys(collections::SESSIONS).await? {
            self.storage.delete(collections::SESSIONS, &key).await?;
        }
        self.health.set_count(0);
        Ok(())
    }

    /// Known device IDs for a peer, for multi-device fan-out
    ///
    /// The primary-device convention (device ID 1) belongs to the caller;
    /// this store only filters it out when asked.
    pub async fn list_devices(&self, peer: &str, include_primary: bool) -> KeyResult<Vec<u32>> {
        let mut devices: Vec<u32> = self
            .storage
            .list_keys(collections::SESSIONS)
            .await?
            .iter()
            .filter_map(|key| parse_record_key(key))
            .filter(|(record_peer, device)| {
                *record_peer == peer && (include_primary || *device != 1)
            })
            .map(|(_, device)| device)
            .collect();
        devices.sort_unstable();
        Ok(devices)
    }

    /// Number of stored sessions
    pub async fn count(&self) -> KeyResult<usize> {
        Ok(self.storage.list_keys(collections::SESSIONS).await?.len())
    }

    /// Recount stored sessions into the health snapshot
    pub async fn refresh_count(&self) -> KeyResult<()> {
        let count = self.count().await?;
        self.health.set_count(count);
        Ok(())
    }
}
