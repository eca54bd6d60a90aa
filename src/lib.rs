//! Courier key lifecycle core
//!
//! This crate owns the device's key material for the Courier end-to-end
//! encrypted messaging protocol and keeps it synchronized with the
//! key-distribution server:
//!
//! - **identity**: long-term identity keypair and trust-on-first-use
//!   records for remote identities
//! - **prekeys**: the rotating pool of one-time pre-keys (24-bit ID space)
//! - **signed_prekeys**: the periodically rotated signed pre-key
//! - **sessions**: opaque per-peer-device ratchet session records
//! - **manager**: the `KeyManager` composing the stores, including the
//!   cleanup cascade run when the identity key is regenerated
//!
//! The encrypted local store and the server transport are injected through
//! the `KeyValueStore` and `KeyServer` traits; the ratchet math itself
//! belongs to the session protocol library.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use courier_keys::{HttpKeyServer, KeyConfig, KeyManager};
//!
//! let server = Arc::new(HttpKeyServer::new("https://api.courier.example", Some(token))?);
//! let manager = KeyManager::new(storage, server, KeyConfig::default());
//!
//! // First run generates and publishes everything
//! manager.initialize().await?;
//!
//! // Session layer consumes a pre-key during key exchange
//! manager.consume_prekey(bundle_prekey_id, true).await?;
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod identity;
pub mod keys;
pub mod manager;
pub mod prekeys;
pub mod sessions;
pub mod signed_prekeys;
pub mod storage;

// Re-export commonly used types
pub use api::{HttpKeyServer, KeyServer, ServerEvent};
pub use config::KeyConfig;
pub use error::{KeyError, KeyResult};
pub use health::KeyHealth;
pub use identity::IdentityStore;
pub use keys::{IdentityKeyPair, PreKeyRecord, SignedPreKeyRecord};
pub use manager::{CascadePhase, KeyManager};
pub use prekeys::PreKeyStore;
pub use sessions::{SessionRecord, SessionStore};
pub use signed_prekeys::SignedPreKeyStore;
pub use storage::{KeyValueStore, MemoryStore};
