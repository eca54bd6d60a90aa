//! One-time pre-key pool management
//!
//! Maintains the pool of single-use pre-keys inside [MIN, TARGET], assigns
//! IDs from the 24-bit space, and keeps the server's copy of the pool in
//! step with local storage. Replenishment runs behind a single-flight
//! guard; consumption never blocks on the network.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::api::{KeyServer, PreKeyBatchUpload, PreKeyUpload};
use crate::config::KeyConfig;
use crate::error::{KeyError, KeyResult};
use crate::health::HealthHandle;
use crate::keys::{PreKeyRecord, StoredPreKey, MAX_PREKEY_ID};
use crate::storage::{collections, KeyValueStore};

/// Pick the next batch of pre-key IDs
///
/// IDs increment contiguously from the current maximum while headroom
/// remains below the wrap threshold. Past it, IDs are reclaimed from the
/// lowest unused integers on the assumption that keys that low have long
/// been consumed. A still-outstanding low ID is skipped locally, but the
/// server may have handed its public half to a peer since; that collision
/// window is accepted.
fn next_prekey_ids(existing: &BTreeSet<u32>, needed: usize, wrap_threshold: u32) -> Vec<u32> {
    let Some(&max) = existing.iter().next_back() else {
        return (0..needed as u32).collect();
    };

    if max < wrap_threshold && (max as u64 + needed as u64) <= MAX_PREKEY_ID as u64 {
        return ((max + 1)..=(max + needed as u32)).collect();
    }

    // Wrap mode: fill gaps from zero upward
    (0..=MAX_PREKEY_ID)
        .filter(|id| !existing.contains(id))
        .take(needed)
        .collect()
}

/// Manages the one-time pre-key pool
#[derive(Clone)]
pub struct PreKeyStore {
    storage: Arc<dyn KeyValueStore>,
    server: Arc<dyn KeyServer>,
    health: Arc<HealthHandle>,
    config: KeyConfig,
    generating: Arc<AtomicBool>,
}

impl PreKeyStore {
    /// Create a new pre-key store
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        server: Arc<dyn KeyServer>,
        health: HealthHandle,
        config: KeyConfig,
    ) -> Self {
        Self {
            storage,
            server,
            health: Arc::new(health),
            config,
            generating: Arc::new(AtomicBool::new(false)),
        }
    }

    /// IDs of all locally stored pre-keys
    pub async fn stored_ids(&self) -> KeyResult<BTreeSet<u32>> {
        Ok(self
            .storage
            .list_keys(collections::PREKEYS)
            .await?
            .iter()
            .filter_map(|k| k.parse().ok())
            .collect())
    }

    /// Number of locally stored pre-keys
    pub async fn count(&self) -> KeyResult<usize> {
        Ok(self.stored_ids().await?.len())
    }

    /// Top the pool back up to TARGET if it has fallen below MIN
    ///
    /// Single-flight: a concurrent call is a no-op returning 0, trusting
    /// the in-flight call to satisfy the invariant. Returns the number of
    /// keys generated.
    pub async fn ensure_sufficient_prekeys(&self) -> KeyResult<usize> {
        self.replenish_if_below(self.config.min_prekey_count).await
    }

    /// Generate up to TARGET whenever the pool is below `threshold`
    ///
    /// The normal path uses MIN as the threshold; the purge path in
    /// [`reconcile_with_server`](Self::reconcile_with_server) uses TARGET so
    /// purged keys are replaced immediately.
    async fn replenish_if_below(&self, threshold: usize) -> KeyResult<usize> {
        if self
            .generating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Pre-key generation already in flight");
            return Ok(0);
        }

        let result = self.replenish(threshold).await;
        self.generating.store(false, Ordering::SeqCst);

        match &result {
            Ok(_) => self.health.clear_error(),
            Err(e) => self.health.record_error(e),
        }
        result
    }

    async fn replenish(&self, threshold: usize) -> KeyResult<usize> {
        let existing = self.stored_ids().await?;
        self.health.set_count(existing.len());

        if existing.len() >= threshold {
            return Ok(0);
        }

        let needed = self.config.target_prekey_count - existing.len();
        let ids = next_prekey_ids(&existing, needed, self.config.prekey_id_wrap_threshold);
        tracing::info!(
            have = existing.len(),
            generating = ids.len(),
            "Replenishing pre-key pool"
        );

        self.health.set_busy(true);
        let generated = self.generate_and_store(&ids).await;
        self.health.set_busy(false);
        let batch = generated?;

        self.health.set_count(existing.len() + ids.len());

        // Local records are kept on failure so a later reconcile can still
        // complete the publication.
        self.upload_with_retries(&batch).await?;
        Ok(ids.len())
    }

    async fn generate_and_store(&self, ids: &[u32]) -> KeyResult<PreKeyBatchUpload> {
        let mut prekeys = Vec::with_capacity(ids.len());
        for &id in ids {
            let record = PreKeyRecord::generate(id);
            let bytes = serde_json::to_vec(&record.to_stored())?;
            self.storage
                .put(collections::PREKEYS, &id.to_string(), &bytes)
                .await?;
            prekeys.push(PreKeyUpload {
                key_id: id,
                public_key: hex::encode(record.keypair.public_key_bytes()),
            });
        }
        Ok(PreKeyBatchUpload { prekeys })
    }

    /// Upload a batch with bounded retries and a fixed backoff
    async fn upload_with_retries(&self, batch: &PreKeyBatchUpload) -> KeyResult<()> {
        let attempts = self.config.upload_attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=attempts {
            match self.server.upload_prekey_batch(batch).await {
                Ok(()) => {
                    tracing::info!(count = batch.prekeys.len(), "Uploaded pre-key batch");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, attempts, "Pre-key batch upload failed: {}", e);
                    last = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.upload_retry_delay).await;
            }
        }

        Err(KeyError::Publication { attempts, last })
    }

    /// Delete a consumed pre-key and replenish in the background
    ///
    /// The decrypt path calls this, so nothing here waits on the network:
    /// server notification and the replenishment check run in a spawned
    /// task whose failures surface through the health error field. Pass
    /// `notify_server = false` for bulk local cleanup that is not true
    /// consumption. The returned handle lets callers await the background
    /// work when they need to.
    pub async fn consume(&self, id: u32, notify_server: bool) -> KeyResult<JoinHandle<()>> {
        self.storage
            .delete(collections::PREKEYS, &id.to_string())
            .await?;
        let count = self.count().await?;
        self.health.set_count(count);
        tracing::debug!(id, remaining = count, "Consumed pre-key");

        let store = self.clone();
        Ok(tokio::spawn(async move {
            if notify_server {
                if let Err(e) = store.server.delete_prekey(id).await {
                    tracing::warn!(id, "Server pre-key deletion failed: {}", e);
                    store.health.record_error(&e);
                }
            }
            if let Err(e) = store.ensure_sufficient_prekeys().await {
                tracing::warn!("Background pre-key replenishment failed: {}", e);
            }
        }))
    }

    /// Bring the server's pre-key set in step with local storage
    ///
    /// Uploads any local key the server is missing. A local record that can
    /// no longer be read is purged and the pool regenerated: partially
    /// reconciling with unreadable keys would hand peers a broken bundle.
    pub async fn reconcile_with_server(&self, server_ids: &[u32]) -> KeyResult<()> {
        let server: BTreeSet<u32> = server_ids.iter().copied().collect();
        let local = self.stored_ids().await?;

        let mut prekeys = Vec::new();
        let mut purged = 0usize;
        for &id in local.difference(&server) {
            match self.load_record(id).await? {
                Some(record) => prekeys.push(PreKeyUpload {
                    key_id: id,
                    public_key: hex::encode(record.keypair.public_key_bytes()),
                }),
                None => purged += 1,
            }
        }

        if !prekeys.is_empty() {
            tracing::info!(count = prekeys.len(), "Uploading pre-keys missing on server");
            self.upload_with_retries(&PreKeyBatchUpload { prekeys }).await?;
        }

        if purged > 0 {
            tracing::warn!(purged, "Purged unreadable pre-keys, regenerating pool");
            self.replenish_if_below(self.config.target_prekey_count).await?;
        } else {
            self.health.set_count(self.count().await?);
        }
        Ok(())
    }

    /// Load one record, purging it if it cannot be restored
    async fn load_record(&self, id: u32) -> KeyResult<Option<PreKeyRecord>> {
        let key = id.to_string();
        let Some(bytes) = self.storage.get(collections::PREKEYS, &key).await? else {
            return Ok(None);
        };

        let restored = serde_json::from_slice::<StoredPreKey>(&bytes)
            .map_err(KeyError::from)
            .and_then(|stored| PreKeyRecord::from_stored(&stored));
        match restored {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(id, "Purging unreadable pre-key: {}", e);
                self.storage.delete(collections::PREKEYS, &key).await?;
                Ok(None)
            }
        }
    }

    /// Delete every local pre-key (cascade primitive, no server calls)
    pub(crate) async fn delete_all_local(&self) -> KeyResult<()> {
        for key in self.storage.list_keys(collections::PREKEYS).await? {
            self.storage.delete(collections::PREKEYS, &key).await?;
        }
        self.health.set_count(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockKeyServer;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    fn fast_config() -> KeyConfig {
        KeyConfig {
            upload_retry_delay: Duration::from_millis(10),
            ..KeyConfig::default()
        }
    }

    fn store_with(config: KeyConfig) -> (PreKeyStore, Arc<MockKeyServer>) {
        let server = Arc::new(MockKeyServer::new());
        let (health, _rx) = HealthHandle::new();
        let store = PreKeyStore::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&server) as Arc<dyn KeyServer>,
            health,
            config,
        );
        (store, server)
    }

    #[test]
    fn test_id_assignment_contiguous() {
        let existing: BTreeSet<u32> = (0..=4).collect();
        assert_eq!(next_prekey_ids(&existing, 3, 16_000_000), vec![5, 6, 7]);
    }

    #[test]
    fn test_id_assignment_empty_starts_at_zero() {
        assert_eq!(next_prekey_ids(&BTreeSet::new(), 3, 16_000_000), vec![0, 1, 2]);
    }

    #[test]
    fn test_id_assignment_wraps_past_threshold() {
        let existing: BTreeSet<u32> = [16_000_001].into_iter().collect();
        assert_eq!(next_prekey_ids(&existing, 3, 16_000_000), vec![0, 1, 2]);
    }

    #[test]
    fn test_id_assignment_wrap_skips_live_ids() {
        let existing: BTreeSet<u32> = [0, 1, 3, 16_000_001].into_iter().collect();
        assert_eq!(next_prekey_ids(&existing, 3, 16_000_000), vec![2, 4, 5]);
    }

    #[test]
    fn test_id_assignment_never_exceeds_id_space() {
        let existing: BTreeSet<u32> = [MAX_PREKEY_ID - 1].into_iter().collect();
        let ids = next_prekey_ids(&existing, 3, 16_000_000);
        assert!(ids.iter().all(|&id| id <= MAX_PREKEY_ID));
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_ensure_fills_to_target_from_empty() {
        let (store, server) = store_with(fast_config());

        let generated = store.ensure_sufficient_prekeys().await.unwrap();
        assert_eq!(generated, 110);

        let ids = store.stored_ids().await.unwrap();
        assert_eq!(ids.len(), 110);
        assert_eq!(ids.iter().next(), Some(&0));
        assert_eq!(ids.iter().next_back(), Some(&109));

        let state = server.state.lock().unwrap();
        assert_eq!(state.prekey_batch_uploads, 1);
        assert_eq!(state.prekeys.len(), 110);
    }

    #[tokio::test]
    async fn test_ensure_noop_above_minimum() {
        let (store, server) = store_with(fast_config());

        store.ensure_sufficient_prekeys().await.unwrap();
        let generated = store.ensure_sufficient_prekeys().await.unwrap();

        assert_eq!(generated, 0);
        assert_eq!(server.state.lock().unwrap().prekey_batch_uploads, 1);
    }

    #[tokio::test]
    async fn test_in_flight_guard_short_circuits() {
        let (store, server) = store_with(fast_config());
        store.generating.store(true, Ordering::SeqCst);

        let generated = store.ensure_sufficient_prekeys().await.unwrap();
        assert_eq!(generated, 0);
        assert_eq!(server.state.lock().unwrap().prekey_batch_uploads, 0);
    }

    #[tokio::test]
    async fn test_consume_deletes_and_notifies() {
        let (store, server) = store_with(fast_config());
        store.ensure_sufficient_prekeys().await.unwrap();

        let handle = store.consume(5, true).await.unwrap();
        handle.await.unwrap();

        let ids = store.stored_ids().await.unwrap();
        assert_eq!(ids.len(), 109); // 109 >= MIN, no replenishment
        assert!(!ids.contains(&5));

        let state = server.state.lock().unwrap();
        assert!(!state.prekeys.contains(&5));
        assert_eq!(state.prekey_batch_uploads, 1);
    }

    #[tokio::test]
    async fn test_consume_below_minimum_replenishes() {
        let config = KeyConfig {
            min_prekey_count: 5,
            target_prekey_count: 12,
            upload_retry_delay: Duration::from_millis(10),
            ..KeyConfig::default()
        };
        let (store, server) = store_with(config);
        store.ensure_sufficient_prekeys().await.unwrap();

        // Consume down to 4, one below MIN
        for id in 0..8 {
            let handle = store.consume(id, false).await.unwrap();
            handle.await.unwrap();
        }

        let ids = store.stored_ids().await.unwrap();
        assert_eq!(ids.len(), 12);
        // New IDs continue past the previous maximum
        assert_eq!(ids.iter().next_back(), Some(&19));
        assert!(server.state.lock().unwrap().prekey_batch_uploads >= 2);
    }

    #[tokio::test]
    async fn test_no_duplicate_ids_after_churn() {
        let config = KeyConfig {
            min_prekey_count: 5,
            target_prekey_count: 12,
            upload_retry_delay: Duration::from_millis(10),
            ..KeyConfig::default()
        };
        let (store, _server) = store_with(config);

        store.ensure_sufficient_prekeys().await.unwrap();
        for id in [0, 3, 7, 9, 10, 11, 1, 2] {
            let handle = store.consume(id, false).await.unwrap();
            handle.await.unwrap();
        }

        // BTreeSet canonically dedupes; cross-check against raw storage keys
        let ids = store.stored_ids().await.unwrap();
        let raw = store.storage.list_keys(collections::PREKEYS).await.unwrap();
        assert_eq!(ids.len(), raw.len());
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_local_records() {
        let (store, server) = store_with(fast_config());
        server.state.lock().unwrap().fail_batch_uploads = 3;

        match store.ensure_sufficient_prekeys().await {
            Err(KeyError::Publication { attempts: 3, .. }) => {}
            other => panic!("expected publication failure, got {:?}", other),
        }

        // Local pool is full; the server has nothing yet
        assert_eq!(store.count().await.unwrap(), 110);
        assert_eq!(server.state.lock().unwrap().prekeys.len(), 0);

        // Reconciliation later completes the publication
        store.reconcile_with_server(&[]).await.unwrap();
        assert_eq!(server.state.lock().unwrap().prekeys.len(), 110);
    }

    #[tokio::test]
    async fn test_upload_retries_through_transient_failure() {
        let (store, server) = store_with(fast_config());
        server.state.lock().unwrap().fail_batch_uploads = 2;

        store.ensure_sufficient_prekeys().await.unwrap();
        assert_eq!(server.state.lock().unwrap().prekeys.len(), 110);
    }

    #[tokio::test]
    async fn test_reconcile_purges_unreadable_and_regenerates() {
        let config = KeyConfig {
            min_prekey_count: 5,
            target_prekey_count: 8,
            upload_retry_delay: Duration::from_millis(10),
            ..KeyConfig::default()
        };
        let (store, server) = store_with(config);
        store.ensure_sufficient_prekeys().await.unwrap();

        // Corrupt one record behind the store's back
        store
            .storage
            .put(collections::PREKEYS, "3", b"garbage")
            .await
            .unwrap();

        store.reconcile_with_server(&[]).await.unwrap();

        // Back at target even though 7 readable keys already satisfied MIN:
        // the purged key is replaced by a fresh one with the next ID
        let ids = store.stored_ids().await.unwrap();
        assert_eq!(ids.len(), 8);
        assert!(!ids.contains(&3));
        assert!(ids.contains(&8));
        assert!(server.state.lock().unwrap().prekeys.contains(&8));
    }

    #[tokio::test]
    async fn test_delete_all_local_skips_server() {
        let (store, server) = store_with(fast_config());
        store.ensure_sufficient_prekeys().await.unwrap();

        store.delete_all_local().await.unwrap();

        assert_eq!(store.count().await.unwrap(), 0);
        // Server copy untouched; the cascade wipes it separately
        assert_eq!(server.state.lock().unwrap().prekeys.len(), 110);
    }
}
