//! Key manager facade
//!
//! Composes the four stores behind one owner: supplies them with the
//! shared storage and server handles, initializes them in dependency order
//! (identity → signed pre-key → pre-keys → sessions), and runs the cleanup
//! cascade when the identity key is regenerated.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::{KeyServer, ServerEvent};
use crate::config::KeyConfig;
use crate::error::KeyResult;
use crate::health::{HealthHandle, KeyHealth};
use crate::identity::IdentityStore;
use crate::keys::IdentityKeyPair;
use crate::prekeys::PreKeyStore;
use crate::sessions::{SessionRecord, SessionStore};
use crate::signed_prekeys::SignedPreKeyStore;
use crate::storage::{collections, KeyValueStore};

/// Where the cleanup cascade currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadePhase {
    /// No cascade in flight
    Idle,
    /// Purging local pre-keys, signed pre-keys, sessions and sender keys
    CleaningLocal,
    /// Requesting server-side deletion of this device's key material
    CleaningRemote,
    /// Publishing the regenerated identity key
    Uploading,
}

/// Owns and orchestrates the four key stores
pub struct KeyManager {
    storage: Arc<dyn KeyValueStore>,
    server: Arc<dyn KeyServer>,
    identity: Arc<IdentityStore>,
    prekeys: PreKeyStore,
    signed_prekeys: SignedPreKeyStore,
    sessions: SessionStore,
    identity_health: watch::Receiver<KeyHealth>,
    prekey_health: watch::Receiver<KeyHealth>,
    signed_prekey_health: watch::Receiver<KeyHealth>,
    session_health: watch::Receiver<KeyHealth>,
    phase_tx: watch::Sender<CascadePhase>,
    phase_rx: watch::Receiver<CascadePhase>,
}

impl KeyManager {
    /// Wire up the stores around shared storage and server handles
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        server: Arc<dyn KeyServer>,
        config: KeyConfig,
    ) -> Self {
        let (identity_handle, identity_health) = HealthHandle::new();
        let (prekey_handle, prekey_health) = HealthHandle::new();
        let (signed_handle, signed_prekey_health) = HealthHandle::new();
        let (session_handle, session_health) = HealthHandle::new();

        let identity = Arc::new(IdentityStore::new(
            Arc::clone(&storage),
            Arc::clone(&server),
            identity_handle,
            config.regeneration_wait,
        ));
        let prekeys = PreKeyStore::new(
            Arc::clone(&storage),
            Arc::clone(&server),
            prekey_handle,
            config.clone(),
        );
        let signed_prekeys = SignedPreKeyStore::new(
            Arc::clone(&storage),
            Arc::clone(&server),
            signed_handle,
            config,
            Arc::clone(&identity),
        );
        let sessions = SessionStore::new(Arc::clone(&storage), session_handle);

        let (phase_tx, phase_rx) = watch::channel(CascadePhase::Idle);

        Self {
            storage,
            server,
            identity,
            prekeys,
            signed_prekeys,
            sessions,
            identity_health,
            prekey_health,
            signed_prekey_health,
            session_health,
            phase_tx,
            phase_rx,
        }
    }

    /// Bring every store up in dependency order
    pub async fn initialize(&self) -> KeyResult<()> {
        let identity = self.identity.get_identity_keypair().await?;
        tracing::info!(fingerprint = %identity.fingerprint(), "Identity ready");

        let signed = self.signed_prekeys.get_current().await?;
        tracing::info!(id = signed.id, "Signed pre-key ready");

        let generated = self.prekeys.ensure_sufficient_prekeys().await?;
        tracing::info!(generated, "Pre-key pool ready");

        self.sessions.refresh_count().await?;
        Ok(())
    }

    fn set_phase(&self, phase: CascadePhase) {
        tracing::info!(?phase, "Cleanup cascade phase");
        let _ = self.phase_tx.send(phase);
    }

    /// Destroy the identity keypair and everything derived from it
    ///
    /// Runs the cleanup cascade strictly in order: all local key material
    /// is purged, then server-side deletion is requested, and only then is
    /// the new identity key published. Publishing first would let a peer
    /// fetch a bundle mixing the new identity with pre-keys signed under
    /// the old one. Cleanup steps are best-effort and independently
    /// logged; partial cleanup is strictly better than none, and the new
    /// key must still go out.
    pub async fn regenerate_identity(&self) -> KeyResult<Arc<IdentityKeyPair>> {
        let _guard = self.identity.lock_for_regeneration().await?;
        tracing::warn!("Regenerating identity keypair, destroying dependent key material");

        self.set_phase(CascadePhase::CleaningLocal);
        if let Err(e) = self.prekeys.delete_all_local().await {
            tracing::error!("Cascade: pre-key purge failed: {}", e);
        }
        if let Err(e) = self.signed_prekeys.delete_all_local().await {
            tracing::error!("Cascade: signed pre-key purge failed: {}", e);
        }
        if let Err(e) = self.sessions.delete_all().await {
            tracing::error!("Cascade: session purge failed: {}", e);
        }
        if let Err(e) = self.delete_sender_keys().await {
            tracing::error!("Cascade: sender key purge failed: {}", e);
        }

        self.set_phase(CascadePhase::CleaningRemote);
        if let Err(e) = self.server.delete_all_keys().await {
            tracing::error!("Cascade: server-side key deletion failed: {}", e);
        }

        let keypair = match self.identity.replace_keypair().await {
            Ok(keypair) => keypair,
            Err(e) => {
                self.set_phase(CascadePhase::Idle);
                return Err(e);
            }
        };

        self.set_phase(CascadePhase::Uploading);
        let published = self.identity.publish(&keypair).await;
        self.set_phase(CascadePhase::Idle);
        published?;

        Ok(keypair)
    }

    /// Purge per-peer sender group keys (group-messaging extension)
    async fn delete_sender_keys(&self) -> KeyResult<()> {
        for key in self.storage.list_keys(collections::SENDER_KEYS).await? {
            self.storage.delete(collections::SENDER_KEYS, &key).await?;
        }
        Ok(())
    }

    /// React to an inbound real-time event
    pub async fn handle_server_event(&self, event: ServerEvent) -> KeyResult<()> {
        match event {
            ServerEvent::SignedPreKeyMissing => {
                tracing::warn!("Server reports no signed pre-key, republishing");
                self.signed_prekeys.ensure_published().await
            }
        }
    }

    // ------------------------------------------------------------------
    // Store surface exposed to the UI/session layer
    // ------------------------------------------------------------------

    /// The device's identity keypair, created on first use
    pub async fn get_identity_keypair(&self) -> KeyResult<Arc<IdentityKeyPair>> {
        self.identity.get_identity_keypair().await
    }

    /// Trust-on-first-use check for a peer's identity key
    pub async fn is_trusted(&self, peer: &str, device: u32, candidate: &[u8]) -> KeyResult<bool> {
        self.identity.is_trusted(peer, device, candidate).await
    }

    /// Record a peer's identity key; true if it was new or changed
    pub async fn save_identity(&self, peer: &str, device: u32, key: &[u8]) -> KeyResult<bool> {
        self.identity.save_identity(peer, device, key).await
    }

    /// Drop the trust record for a peer device
    pub async fn remove_identity(&self, peer: &str, device: u32) -> KeyResult<()> {
        self.identity.remove_identity(peer, device).await
    }

    /// Top the pre-key pool back up if it has fallen below the minimum
    pub async fn ensure_sufficient_prekeys(&self) -> KeyResult<usize> {
        self.prekeys.ensure_sufficient_prekeys().await
    }

    /// Consume a pre-key; replenishment happens in the background
    pub async fn consume_prekey(&self, id: u32, notify_server: bool) -> KeyResult<JoinHandle<()>> {
        self.prekeys.consume(id, notify_server).await
    }

    /// The current signed pre-key, rotating it first if due
    pub async fn get_current_signed_prekey(&self) -> KeyResult<crate::keys::SignedPreKeyRecord> {
        self.signed_prekeys.get_current().await
    }

    /// Load a session record, fresh if none exists
    pub async fn load_session(&self, peer: &str, device: u32) -> KeyResult<SessionRecord> {
        self.sessions.load(peer, device).await
    }

    /// Persist a session record
    pub async fn store_session(
        &self,
        peer: &str,
        device: u32,
        record: &SessionRecord,
    ) -> KeyResult<()> {
        self.sessions.store(peer, device, record).await
    }

    /// Delete one peer device's session
    pub async fn delete_session(&self, peer: &str, device: u32) -> KeyResult<()> {
        self.sessions.delete(peer, device).await
    }

    /// Delete all of a peer's sessions
    pub async fn delete_sessions_for_peer(&self, peer: &str) -> KeyResult<()> {
        self.sessions.delete_all_for_peer(peer).await
    }

    /// Known device IDs for a peer
    pub async fn list_devices(&self, peer: &str, include_primary: bool) -> KeyResult<Vec<u32>> {
        self.sessions.list_devices(peer, include_primary).await
    }

    /// Direct access to the pre-key store (reconciliation, counts)
    pub fn prekeys(&self) -> &PreKeyStore {
        &self.prekeys
    }

    /// Direct access to the signed pre-key store (server validation)
    pub fn signed_prekeys(&self) -> &SignedPreKeyStore {
        &self.signed_prekeys
    }

    /// Direct access to the session store
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    /// Identity store health observer
    pub fn identity_health(&self) -> watch::Receiver<KeyHealth> {
        self.identity_health.clone()
    }

    /// Pre-key store health observer
    pub fn prekey_health(&self) -> watch::Receiver<KeyHealth> {
        self.prekey_health.clone()
    }

    /// Signed pre-key store health observer
    pub fn signed_prekey_health(&self) -> watch::Receiver<KeyHealth> {
        self.signed_prekey_health.clone()
    }

    /// Session store health observer
    pub fn session_health(&self) -> watch::Receiver<KeyHealth> {
        self.session_health.clone()
    }

    /// Cleanup cascade phase observer
    pub fn cascade_phase(&self) -> watch::Receiver<CascadePhase> {
        self.phase_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockKeyServer;
    use crate::error::KeyError;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// MemoryStore wrapper that rejects identity writes once armed
    struct BrokenIdentityWrites {
        inner: MemoryStore,
        armed: AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for BrokenIdentityWrites {
        async fn get(&self, collection: &str, key: &str) -> KeyResult<Option<Vec<u8>>> {
            self.inner.get(collection, key).await
        }

        async fn put(&self, collection: &str, key: &str, value: &[u8]) -> KeyResult<()> {
            if self.armed.load(Ordering::SeqCst) && collection == collections::IDENTITY {
                return Err(KeyError::Storage("identity write rejected".to_string()));
            }
            self.inner.put(collection, key, value).await
        }

        async fn delete(&self, collection: &str, key: &str) -> KeyResult<()> {
            self.inner.delete(collection, key).await
        }

        async fn list_keys(&self, collection: &str) -> KeyResult<Vec<String>> {
            self.inner.list_keys(collection).await
        }
    }

    fn manager() -> (KeyManager, Arc<MockKeyServer>) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "courier_keys=info".into()),
            )
            .with_test_writer()
            .try_init();

        let server = Arc::new(MockKeyServer::new());
        let manager = KeyManager::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&server) as Arc<dyn KeyServer>,
            KeyConfig::default(),
        );
        (manager, server)
    }

    #[tokio::test]
    async fn test_cold_start_end_to_end() {
        let (manager, server) = manager();

        // Identity first: one pair, one upload
        let identity = manager.get_identity_keypair().await.unwrap();
        assert_eq!(server.state.lock().unwrap().identity_uploads, 1);

        // Pre-key pool: exactly 110 keys, IDs 0-109, one batch
        let generated = manager.ensure_sufficient_prekeys().await.unwrap();
        assert_eq!(generated, 110);
        let ids = manager.prekeys().stored_ids().await.unwrap();
        assert_eq!(ids.iter().next(), Some(&0));
        assert_eq!(ids.iter().next_back(), Some(&109));
        assert_eq!(server.state.lock().unwrap().prekey_batch_uploads, 1);

        // Signed pre-key: ID 0, signed by the identity key, one upload
        let signed = manager.get_current_signed_prekey().await.unwrap();
        assert_eq!(signed.id, 0);
        assert!(signed.verify(&identity.public).is_ok());
        assert_eq!(server.state.lock().unwrap().signed_prekey_uploads, 1);

        // Consuming one key leaves 109, well above the minimum
        let handle = manager.consume_prekey(5, true).await.unwrap();
        handle.await.unwrap();
        assert_eq!(manager.prekeys().count().await.unwrap(), 109);
        assert_eq!(server.state.lock().unwrap().prekey_batch_uploads, 1);
    }

    #[tokio::test]
    async fn test_initialize_brings_all_stores_up() {
        let (manager, server) = manager();

        manager.initialize().await.unwrap();

        let state = server.state.lock().unwrap();
        assert_eq!(state.identity_uploads, 1);
        assert_eq!(state.signed_prekey_uploads, 1);
        assert_eq!(state.prekeys.len(), 110);
        assert_eq!(manager.identity_health().borrow().count, 1);
        assert_eq!(manager.prekey_health().borrow().count, 110);
    }

    #[tokio::test]
    async fn test_regeneration_cascade_completeness() {
        let (manager, server) = manager();
        manager.initialize().await.unwrap();

        // Establish some dependent state
        let record = SessionRecord::new(vec![1, 2, 3]);
        manager.store_session("alice", 1, &record).await.unwrap();
        manager.store_session("alice", 2, &record).await.unwrap();
        manager.store_session("bob", 1, &record).await.unwrap();

        let old = manager.get_identity_keypair().await.unwrap();
        let new = manager.regenerate_identity().await.unwrap();

        // A fresh keypair, and the old one is gone everywhere
        assert_ne!(old.public_key_bytes(), new.public_key_bytes());
        assert!(manager.load_session("alice", 1).await.unwrap().is_fresh());
        assert!(manager.load_session("bob", 1).await.unwrap().is_fresh());
        assert!(manager.list_devices("alice", true).await.unwrap().is_empty());
        assert_eq!(manager.prekeys().count().await.unwrap(), 0);
        assert_eq!(manager.signed_prekeys().count().await.unwrap(), 0);

        // Server was wiped before the new key was published; were the order
        // reversed, the wipe would have erased the advertised key too
        let state = server.state.lock().unwrap();
        assert_eq!(state.wipes, 1);
        assert_eq!(
            state.identity_key.as_deref(),
            Some(hex::encode(new.public_key_bytes()).as_str())
        );
        assert!(state.prekeys.is_empty());
        assert!(state.signed_prekeys.is_empty());
    }

    #[tokio::test]
    async fn test_reinitialize_after_regeneration() {
        let (manager, server) = manager();
        manager.initialize().await.unwrap();
        let new = manager.regenerate_identity().await.unwrap();

        manager.initialize().await.unwrap();

        assert_eq!(manager.prekeys().count().await.unwrap(), 110);
        let signed = manager.get_current_signed_prekey().await.unwrap();
        assert_eq!(signed.id, 0);
        assert!(signed.verify(&new.public).is_ok());
        assert_eq!(server.state.lock().unwrap().prekeys.len(), 110);
    }

    #[tokio::test]
    async fn test_missing_signed_prekey_event_republishes() {
        let (manager, server) = manager();
        manager.initialize().await.unwrap();

        server.state.lock().unwrap().signed_prekeys.clear();

        manager
            .handle_server_event(ServerEvent::SignedPreKeyMissing)
            .await
            .unwrap();

        assert!(server.state.lock().unwrap().signed_prekeys.contains_key(&0));
    }

    #[tokio::test]
    async fn test_regeneration_publish_failure_retried_on_next_access() {
        let (manager, server) = manager();
        manager.initialize().await.unwrap();
        let old = manager.get_identity_keypair().await.unwrap();

        server.state.lock().unwrap().fail_identity_uploads = 1;
        assert!(manager.regenerate_identity().await.is_err());

        // The regenerated keypair survived locally; the next access must
        // reload it and complete the interrupted upload
        let keypair = manager.get_identity_keypair().await.unwrap();
        assert_ne!(old.public_key_bytes(), keypair.public_key_bytes());

        let state = server.state.lock().unwrap();
        assert_eq!(state.identity_uploads, 2);
        assert_eq!(
            state.identity_key.as_deref(),
            Some(hex::encode(keypair.public_key_bytes()).as_str())
        );
    }

    #[tokio::test]
    async fn test_phase_idle_after_keypair_replacement_failure() {
        let storage = Arc::new(BrokenIdentityWrites {
            inner: MemoryStore::new(),
            armed: AtomicBool::new(false),
        });
        let server = Arc::new(MockKeyServer::new());
        let manager = KeyManager::new(
            Arc::clone(&storage) as Arc<dyn KeyValueStore>,
            Arc::clone(&server) as Arc<dyn KeyServer>,
            KeyConfig::default(),
        );
        manager.initialize().await.unwrap();

        storage.armed.store(true, Ordering::SeqCst);
        assert!(manager.regenerate_identity().await.is_err());
        assert_eq!(*manager.cascade_phase().borrow(), CascadePhase::Idle);
    }

    #[tokio::test]
    async fn test_cascade_phase_returns_to_idle() {
        let (manager, _server) = manager();
        manager.initialize().await.unwrap();

        let phases = manager.cascade_phase();
        manager.regenerate_identity().await.unwrap();

        assert_eq!(*phases.borrow(), CascadePhase::Idle);
    }
}
