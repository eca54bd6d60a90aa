//! Signed pre-key rotation and retention
//!
//! Owns the medium-term signed pre-key. Rotation is evaluated lazily at the
//! start of any operation that needs the current key, so rotation latency
//! is bounded by usage frequency; a stale-but-valid key is safe, just
//! suboptimal.
//!
//! Retention is two-tier: up to 3 keys locally (current + backups, to
//! decrypt messages encrypted against a recently-rotated key) and up to 2
//! on the server (current + immediately-previous, to tolerate bundles
//! fetched moments before rotation).

use std::sync::Arc;

use base64::Engine;

use crate::api::{KeyServer, SignedPreKeyStatus, SignedPreKeyUpload};
use crate::config::KeyConfig;
use crate::error::{KeyError, KeyResult};
use crate::health::HealthHandle;
use crate::identity::IdentityStore;
use crate::keys::{SignedPreKeyRecord, StoredSignedPreKey, SIGNATURE_LENGTH};
use crate::storage::{collections, KeyValueStore};

/// Manages the current signed pre-key and its retired backups
pub struct SignedPreKeyStore {
    storage: Arc<dyn KeyValueStore>,
    server: Arc<dyn KeyServer>,
    health: HealthHandle,
    config: KeyConfig,
    identity: Arc<IdentityStore>,
}

impl SignedPreKeyStore {
    /// Create a new signed pre-key store
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        server: Arc<dyn KeyServer>,
        health: HealthHandle,
        config: KeyConfig,
        identity: Arc<IdentityStore>,
    ) -> Self {
        Self {
            storage,
            server,
            health,
            config,
            identity,
        }
    }

    /// All locally stored signed pre-keys, sorted oldest ID first
    ///
    /// Unreadable records are purged and skipped; a record without a
    /// restorable timestamp cannot be trusted as current, and losing a
    /// backup only narrows the decrypt grace window.
    async fn load_all(&self) -> KeyResult<Vec<SignedPreKeyRecord>> {
        let mut records = Vec::new();
        for key in self.storage.list_keys(collections::SIGNED_PREKEYS).await? {
            let Some(bytes) = self.storage.get(collections::SIGNED_PREKEYS, &key).await? else {
                continue;
            };
            let restored = serde_json::from_slice::<StoredSignedPreKey>(&bytes)
                .map_err(KeyError::from)
                .and_then(|stored| SignedPreKeyRecord::from_stored(&stored));
            match restored {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(key, "Purging unreadable signed pre-key: {}", e);
                    self.storage.delete(collections::SIGNED_PREKEYS, &key).await?;
                }
            }
        }
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    /// Number of locally stored signed pre-keys
    pub async fn count(&self) -> KeyResult<usize> {
        Ok(self
            .storage
            .list_keys(collections::SIGNED_PREKEYS)
            .await?
            .len())
    }

    /// Get the current signed pre-key, generating or rotating as needed
    ///
    /// First use generates ID 0 and uploads it. A key at or past the
    /// rotation age triggers rotation; otherwise the newest key is returned
    /// after pruning excess backups.
    pub async fn get_current(&self) -> KeyResult<SignedPreKeyRecord> {
        let mut records = self.load_all().await?;

        let Some(newest) = records.last() else {
            tracing::info!("No signed pre-key in storage, generating ID 0");
            return self.generate_and_publish(0).await;
        };

        if newest.is_due_for_rotation(self.config.signed_prekey_rotate_after_days) {
            tracing::info!(
                id = newest.id,
                age_seconds = newest.age_seconds(),
                "Signed pre-key due, rotating"
            );
            return self.rotate().await;
        }

        self.prune(&records).await?;
        records
            .pop()
            .ok_or_else(|| KeyError::Internal("Signed pre-key vanished during prune".to_string()))
    }

    /// Rotate to a fresh key with the next sequential ID
    pub async fn rotate(&self) -> KeyResult<SignedPreKeyRecord> {
        let records = self.load_all().await?;
        let next_id = records.last().map(|r| r.id + 1).unwrap_or(0);
        self.generate_and_publish(next_id).await
    }

    async fn generate_and_publish(&self, id: u32) -> KeyResult<SignedPreKeyRecord> {
        let identity = self.identity.get_identity_keypair().await?;

        self.health.set_busy(true);
        let record = SignedPreKeyRecord::generate(id, &identity);
        let persisted = self.persist(&record).await;
        self.health.set_busy(false);
        persisted?;

        self.upload(&record).await?;

        let records = self.load_all().await?;
        self.prune(&records).await?;
        self.health.clear_error();
        Ok(record)
    }

    async fn persist(&self, record: &SignedPreKeyRecord) -> KeyResult<()> {
        // Record and creation timestamp are one serialized value, so a
        // crash cannot leave the timestamp behind.
        let bytes = serde_json::to_vec(&record.to_stored())?;
        self.storage
            .put(collections::SIGNED_PREKEYS, &record.id.to_string(), &bytes)
            .await
    }

    async fn upload(&self, record: &SignedPreKeyRecord) -> KeyResult<()> {
        let upload = SignedPreKeyUpload {
            key_id: record.id,
            public_key: hex::encode(record.keypair.public_key_bytes()),
            signature: base64::engine::general_purpose::STANDARD.encode(&record.signature),
        };

        if let Err(e) = self.server.upload_signed_prekey(&upload).await {
            self.health.record_error(&e);
            return Err(e);
        }
        tracing::info!(id = record.id, "Uploaded signed pre-key");
        Ok(())
    }

    /// Apply the two-tier retention policy
    ///
    /// Server deletions are best-effort: a key we failed to retire remotely
    /// is retried on the next rotation, and keeping it one round longer is
    /// harmless.
    async fn prune(&self, records: &[SignedPreKeyRecord]) -> KeyResult<()> {
        let ids: Vec<u32> = records.iter().map(|r| r.id).collect();

        if ids.len() > self.config.remote_signed_prekey_retention {
            let cutoff = ids.len() - self.config.remote_signed_prekey_retention;
            for &id in &ids[..cutoff] {
                if let Err(e) = self.server.delete_signed_prekey(id).await {
                    tracing::warn!(id, "Server signed pre-key deletion failed: {}", e);
                }
            }
        }

        if ids.len() > self.config.local_signed_prekey_retention {
            let cutoff = ids.len() - self.config.local_signed_prekey_retention;
            for &id in &ids[..cutoff] {
                tracing::debug!(id, "Pruning retired signed pre-key");
                self.storage
                    .delete(collections::SIGNED_PREKEYS, &id.to_string())
                    .await?;
            }
        }

        self.health.set_count(self.count().await?);
        Ok(())
    }

    /// Defensive check of the server-advertised signed pre-key
    ///
    /// Re-verifies the advertised signature against the identity key's
    /// public half. Any mismatch (missing data, bad signature, wrong
    /// length) regenerates ID 0 and re-uploads rather than attempting a
    /// partial repair: a bad signed pre-key silently breaks every new
    /// session other peers try to establish.
    pub async fn validate_against_server(&self, remote: &SignedPreKeyStatus) -> KeyResult<()> {
        let identity = self.identity.get_identity_keypair().await?;

        if let Err(reason) = validate_status(remote, &identity.public) {
            tracing::warn!(
                "Server-advertised signed pre-key invalid ({}), regenerating",
                reason
            );
            self.health.record_error(&reason);
            self.delete_all_local().await?;
            self.generate_and_publish(0).await?;
        }
        Ok(())
    }

    /// Re-publish the current key, generating one if needed
    ///
    /// Invoked when the server reports it holds no signed pre-key for this
    /// device.
    pub async fn ensure_published(&self) -> KeyResult<()> {
        let record = self.get_current().await?;
        self.upload(&record).await
    }

    /// Delete every local signed pre-key (cascade primitive, no server calls)
    pub(crate) async fn delete_all_local(&self) -> KeyResult<()> {
        for key in self.storage.list_keys(collections::SIGNED_PREKEYS).await? {
            self.storage.delete(collections::SIGNED_PREKEYS, &key).await?;
        }
        self.health.set_count(0);
        Ok(())
    }
}

/// Check an advertised status, returning why it does not verify
fn validate_status(
    remote: &SignedPreKeyStatus,
    identity_public: &vodozemac::Ed25519PublicKey,
) -> Result<(), String> {
    let public_key = remote.public_key.as_ref().ok_or("missing public key")?;
    let signature = remote.signature.as_ref().ok_or("missing signature")?;
    remote.key_id.ok_or("missing key ID")?;

    let public_bytes = hex::decode(public_key).map_err(|e| format!("bad public key: {}", e))?;
    let signature_bytes = base64::engine::general_purpose::STANDARD
        .decode(signature)
        .map_err(|e| format!("bad signature encoding: {}", e))?;

    if signature_bytes.len() != SIGNATURE_LENGTH {
        return Err(format!("signature is {} bytes", signature_bytes.len()));
    }

    let signature = vodozemac::Ed25519Signature::from_slice(&signature_bytes)
        .map_err(|e| format!("unparseable signature: {:?}", e))?;
    identity_public
        .verify(&public_bytes, &signature)
        .map_err(|e| format!("verification failed: {}", e))
}
