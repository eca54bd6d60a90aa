//! Identity key store
//!
//! Owns the device's long-term identity keypair and the set of trusted
//! remote identities (trust-on-first-use). Everything else in the key core
//! depends on this store being valid.
//!
//! The identity keypair is created lazily on first access and destroyed
//! only by explicit regeneration, which is serialized through a fair
//! (FIFO) lock with a bounded wait: key generation plus a network upload
//! can stall indefinitely on a bad connection, and queued operations must
//! fail with a timeout instead of hanging.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::api::{IdentityUpload, KeyServer};
use crate::error::{KeyError, KeyResult};
use crate::health::HealthHandle;
use crate::keys::{IdentityKeyPair, StoredIdentity};
use crate::storage::{collections, KeyValueStore};

/// Storage key for the device's own keypair
const OWN_KEY: &str = "own";
/// Marker recording that the current public key reached the server
const PUBLISHED_KEY: &str = "published";

fn remote_key(peer: &str, device: u32) -> String {
    format!("{}:{}", peer, device)
}

/// Manages the long-term identity keypair and remote identity trust
pub struct IdentityStore {
    storage: Arc<dyn KeyValueStore>,
    server: Arc<dyn KeyServer>,
    health: HealthHandle,
    cached: RwLock<Option<Arc<IdentityKeyPair>>>,
    regen_lock: Arc<Mutex<()>>,
    lock_wait: Duration,
}

impl IdentityStore {
    /// Create a new identity store
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        server: Arc<dyn KeyServer>,
        health: HealthHandle,
        lock_wait: Duration,
    ) -> Self {
        Self {
            storage,
            server,
            health,
            cached: RwLock::new(None),
            regen_lock: Arc::new(Mutex::new(())),
            lock_wait,
        }
    }

    /// Acquire the regeneration lock, waiting at most the configured time
    ///
    /// Waiters resume in FIFO order. Exceeding the wait is a distinct
    /// error, not conflated with generation failure.
    pub(crate) async fn lock_for_regeneration(&self) -> KeyResult<OwnedMutexGuard<()>> {
        tokio::time::timeout(self.lock_wait, Arc::clone(&self.regen_lock).lock_owned())
            .await
            .map_err(|_| KeyError::LockTimeout)
    }

    /// Get the identity keypair, creating and publishing it on first use
    ///
    /// Idempotent: concurrent callers on an empty store serialize on the
    /// regeneration lock, so exactly one keypair is generated and uploaded.
    pub async fn get_identity_keypair(&self) -> KeyResult<Arc<IdentityKeyPair>> {
        if let Some(keypair) = self.cached.read().await.clone() {
            return Ok(keypair);
        }

        let _guard = self.lock_for_regeneration().await?;

        // A concurrent caller may have initialized while we waited
        if let Some(keypair) = self.cached.read().await.clone() {
            return Ok(keypair);
        }

        let keypair = match self.load_own().await? {
            Some(keypair) => Arc::new(keypair),
            None => {
                tracing::info!("No identity keypair in storage, generating");
                self.health.set_busy(true);
                let keypair = Arc::new(IdentityKeyPair::generate());
                let result = self.persist_own(&keypair).await;
                self.health.set_busy(false);
                result?;
                keypair
            }
        };

        // Publication may have failed on an earlier attempt; local state is
        // valid either way, so retry until the server has the key.
        if !self.is_published().await? {
            self.publish(&keypair).await?;
        }

        *self.cached.write().await = Some(Arc::clone(&keypair));
        self.health.set_count(1);
        self.health.clear_error();
        Ok(keypair)
    }

    /// Load the own keypair from storage
    ///
    /// Corruption here is fatal and surfaced as-is: auto-recovery would
    /// silently destroy the device's identity.
    async fn load_own(&self) -> KeyResult<Option<IdentityKeyPair>> {
        let Some(bytes) = self.storage.get(collections::IDENTITY, OWN_KEY).await? else {
            return Ok(None);
        };

        let stored: StoredIdentity =
            serde_json::from_slice(&bytes).map_err(|e| KeyError::Corrupt {
                collection: collections::IDENTITY,
                reason: e.to_string(),
            })?;
        let keypair = IdentityKeyPair::from_stored(&stored).map_err(|e| KeyError::Corrupt {
            collection: collections::IDENTITY,
            reason: e.to_string(),
        })?;
        Ok(Some(keypair))
    }

    async fn persist_own(&self, keypair: &IdentityKeyPair) -> KeyResult<()> {
        let bytes = serde_json::to_vec(&keypair.to_stored())?;
        self.storage.put(collections::IDENTITY, OWN_KEY, &bytes).await
    }

    async fn is_published(&self) -> KeyResult<bool> {
        Ok(self
            .storage
            .get(collections::IDENTITY, PUBLISHED_KEY)
            .await?
            .is_some())
    }

    /// Upload the public key and record the publication
    ///
    /// The keypair enters the in-memory cache only here: a cached keypair
    /// the server never heard of would short-circuit the retry in
    /// [`get_identity_keypair`](Self::get_identity_keypair) forever.
    pub(crate) async fn publish(&self, keypair: &Arc<IdentityKeyPair>) -> KeyResult<()> {
        let upload = IdentityUpload {
            identity_key: hex::encode(keypair.public_key_bytes()),
            registration_id: keypair.registration_id(),
        };

        if let Err(e) = self.server.upload_identity(&upload).await {
            self.health.record_error(&e);
            return Err(e);
        }

        self.storage
            .put(collections::IDENTITY, PUBLISHED_KEY, b"1")
            .await?;
        *self.cached.write().await = Some(Arc::clone(keypair));
        tracing::info!(
            fingerprint = %keypair.fingerprint(),
            "Published identity public key"
        );
        Ok(())
    }

    /// Destroy the current keypair and create a fresh one, without upload
    ///
    /// Caller must hold the regeneration lock and must run the cleanup
    /// cascade before publishing the returned keypair. The cache stays
    /// empty until that publish succeeds, so if the upload fails the next
    /// [`get_identity_keypair`](Self::get_identity_keypair) reloads from
    /// storage and retries it.
    pub(crate) async fn replace_keypair(&self) -> KeyResult<Arc<IdentityKeyPair>> {
        *self.cached.write().await = None;
        self.storage.delete(collections::IDENTITY, OWN_KEY).await?;
        self.storage
            .delete(collections::IDENTITY, PUBLISHED_KEY)
            .await?;

        self.health.set_busy(true);
        let keypair = Arc::new(IdentityKeyPair::generate());
        let result = self.persist_own(&keypair).await;
        self.health.set_busy(false);
        result?;

        self.health.set_count(1);
        tracing::warn!(
            fingerprint = %keypair.fingerprint(),
            "Identity keypair regenerated"
        );
        Ok(keypair)
    }

    /// Load a remote identity, degrading corruption to "no trusted key"
    ///
    /// Next contact wins: a record we can no longer read must not block the
    /// peer forever, so the offending record is purged.
    async fn load_remote(&self, peer: &str, device: u32) -> Option<Vec<u8>> {
        let key = remote_key(peer, device);
        match self.storage.get(collections::REMOTE_IDENTITIES, &key).await {
            Ok(Some(bytes)) if !bytes.is_empty() => Some(bytes),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(peer, device, "Purging unreadable remote identity: {}", e);
                let _ = self.storage.delete(collections::REMOTE_IDENTITIES, &key).await;
                None
            }
        }
    }

    /// Trust-on-first-use check
    ///
    /// No stored identity means unconditional trust (the caller is expected
    /// to persist the key via [`save_identity`](Self::save_identity));
    /// otherwise the candidate must match the stored key byte for byte.
    pub async fn is_trusted(&self, peer: &str, device: u32, candidate: &[u8]) -> KeyResult<bool> {
        match self.load_remote(peer, device).await {
            None => Ok(true),
            Some(stored) => Ok(stored == candidate),
        }
    }

    /// Store a peer's identity key; returns whether anything changed
    ///
    /// A replaced key is a potential compromise or identity rotation. It is
    /// recorded and logged, never silently rejected; acting on it is the
    /// caller's trust decision.
    pub async fn save_identity(&self, peer: &str, device: u32, key: &[u8]) -> KeyResult<bool> {
        let existing = self.load_remote(peer, device).await;
        if existing.as_deref() == Some(key) {
            return Ok(false);
        }

        self.storage
            .put(collections::REMOTE_IDENTITIES, &remote_key(peer, device), key)
            .await?;

        if existing.is_some() {
            tracing::warn!(
                peer,
                device,
                "Remote identity key changed; possible rotation or compromise"
            );
        } else {
            tracing::info!(peer, device, "Recorded new remote identity");
        }
        Ok(true)
    }

    /// Delete a trust record (blocking or removing a contact)
    pub async fn remove_identity(&self, peer: &str, device: u32) -> KeyResult<()> {
        self.storage
            .delete(collections::REMOTE_IDENTITIES, &remote_key(peer, device))
            .await
    }
}
