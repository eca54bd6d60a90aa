//! Key-distribution server API
//!
//! Typed payloads and the transport seam for every server endpoint the key
//! stores publish to. `HttpKeyServer` is the production implementation over
//! reqwest; tests inject an in-memory mock through the `KeyServer` trait.
//!
//! The server answers 200 for applied operations and 202 for accepted/queued
//! ones; both count as success.

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};

use crate::error::{KeyError, KeyResult};

/// Identity public key upload payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityUpload {
    /// Hex-encoded Ed25519 public key
    pub identity_key: String,
    /// Registration ID assigned with the keypair
    pub registration_id: u32,
}

/// Single one-time pre-key upload payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyUpload {
    /// Pre-key ID
    pub key_id: u32,
    /// Hex-encoded Curve25519 public key
    pub public_key: String,
}

/// Batch of one-time pre-keys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyBatchUpload {
    /// The pre-keys in the batch
    pub prekeys: Vec<PreKeyUpload>,
}

/// Signed pre-key upload payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyUpload {
    /// Signed pre-key ID
    pub key_id: u32,
    /// Hex-encoded Curve25519 public key
    pub public_key: String,
    /// Base64-encoded Ed25519 signature
    pub signature: String,
}

/// Server-advertised signed pre-key, as returned by the status endpoint
///
/// Fields are optional because a misbehaving or freshly-wiped server may
/// advertise partial data; validation treats any missing field as a
/// mismatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignedPreKeyStatus {
    /// Signed pre-key ID
    pub key_id: Option<u32>,
    /// Hex-encoded Curve25519 public key
    pub public_key: Option<String>,
    /// Base64-encoded Ed25519 signature
    pub signature: Option<String>,
}

/// Inbound real-time events relevant to key management
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// The server reports it holds no signed pre-key for this device
    SignedPreKeyMissing,
}

/// Transport seam for the key-distribution server
#[async_trait]
pub trait KeyServer: Send + Sync {
    /// Publish the identity public key
    async fn upload_identity(&self, upload: &IdentityUpload) -> KeyResult<()>;

    /// Publish a single one-time pre-key
    async fn upload_prekey(&self, prekey: &PreKeyUpload) -> KeyResult<()>;

    /// Publish a batch of one-time pre-keys
    async fn upload_prekey_batch(&self, batch: &PreKeyBatchUpload) -> KeyResult<()>;

    /// Remove a consumed one-time pre-key
    async fn delete_prekey(&self, key_id: u32) -> KeyResult<()>;

    /// Publish a signed pre-key
    async fn upload_signed_prekey(&self, upload: &SignedPreKeyUpload) -> KeyResult<()>;

    /// Remove a retired signed pre-key
    async fn delete_signed_prekey(&self, key_id: u32) -> KeyResult<()>;

    /// List the signed pre-keys the server currently advertises
    async fn list_signed_prekeys(&self) -> KeyResult<Vec<SignedPreKeyStatus>>;

    /// Delete all key material tied to this device
    async fn delete_all_keys(&self) -> KeyResult<()>;
}

/// HTTP implementation of [`KeyServer`]
#[derive(Debug, Clone)]
pub struct HttpKeyServer {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpKeyServer {
    /// Create a new client for the given server
    pub fn new(base_url: &str, token: Option<String>) -> KeyResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(KeyError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn post<B: Serialize>(&self, endpoint: &str, body: &B) -> KeyResult<()> {
        let request = self.authorize(self.client.post(self.url(endpoint)).json(body));
        let response = request.send().await?;
        Self::check_status(response).await
    }

    async fn delete(&self, endpoint: &str) -> KeyResult<()> {
        let request = self.authorize(self.client.delete(self.url(endpoint)));
        let response = request.send().await?;
        Self::check_status(response).await
    }

    /// 200 applied and 202 accepted/queued both count as success
    async fn check_status(response: Response) -> KeyResult<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(KeyError::Server {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl KeyServer for HttpKeyServer {
    async fn upload_identity(&self, upload: &IdentityUpload) -> KeyResult<()> {
        self.post("/signal/identity", upload).await
    }

    async fn upload_prekey(&self, prekey: &PreKeyUpload) -> KeyResult<()> {
        self.post("/signal/prekey", prekey).await
    }

    async fn upload_prekey_batch(&self, batch: &PreKeyBatchUpload) -> KeyResult<()> {
        self.post("/signal/prekeys/batch", batch).await
    }

    async fn delete_prekey(&self, key_id: u32) -> KeyResult<()> {
        self.delete(&format!("/signal/prekey/{}", key_id)).await
    }

    async fn upload_signed_prekey(&self, upload: &SignedPreKeyUpload) -> KeyResult<()> {
        self.post("/signal/signedprekey", upload).await
    }

    async fn delete_signed_prekey(&self, key_id: u32) -> KeyResult<()> {
        self.delete(&format!("/signal/signedprekey/{}", key_id)).await
    }

    async fn list_signed_prekeys(&self) -> KeyResult<Vec<SignedPreKeyStatus>> {
        let request = self.authorize(self.client.get(self.url("/signal/signedprekeys")));
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KeyError::Server {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }

    async fn delete_all_keys(&self) -> KeyResult<()> {
        self.delete("/api/signal/keys").await
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory server double used across store tests

    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub(crate) struct MockState {
        pub identity_key: Option<String>,
        pub identity_uploads: u32,
        pub prekeys: BTreeSet<u32>,
        pub prekey_batch_uploads: u32,
        pub signed_prekeys: BTreeMap<u32, SignedPreKeyUpload>,
        pub signed_prekey_uploads: u32,
        pub wipes: u32,
        /// Remaining injected failures for batch uploads
        pub fail_batch_uploads: u32,
        /// Remaining injected failures for identity uploads
        pub fail_identity_uploads: u32,
    }

    #[derive(Default)]
    pub(crate) struct MockKeyServer {
        pub state: Mutex<MockState>,
    }

    impl MockKeyServer {
        pub fn new() -> Self {
            Self::default()
        }

        fn injected(reason: &str) -> KeyError {
            KeyError::Server {
                status: 500,
                body: format!("injected failure: {}", reason),
            }
        }
    }

    #[async_trait]
    impl KeyServer for MockKeyServer {
        async fn upload_identity(&self, upload: &IdentityUpload) -> KeyResult<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_identity_uploads > 0 {
                state.fail_identity_uploads -= 1;
                return Err(Self::injected("identity"));
            }
            state.identity_key = Some(upload.identity_key.clone());
            state.identity_uploads += 1;
            Ok(())
        }

        async fn upload_prekey(&self, prekey: &PreKeyUpload) -> KeyResult<()> {
            let mut state = self.state.lock().unwrap();
            state.prekeys.insert(prekey.key_id);
            Ok(())
        }

        async fn upload_prekey_batch(&self, batch: &PreKeyBatchUpload) -> KeyResult<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_batch_uploads > 0 {
                state.fail_batch_uploads -= 1;
                return Err(Self::injected("batch"));
            }
            for prekey in &batch.prekeys {
                state.prekeys.insert(prekey.key_id);
            }
            state.prekey_batch_uploads += 1;
            Ok(())
        }

        async fn delete_prekey(&self, key_id: u32) -> KeyResult<()> {
            self.state.lock().unwrap().prekeys.remove(&key_id);
            Ok(())
        }

        async fn upload_signed_prekey(&self, upload: &SignedPreKeyUpload) -> KeyResult<()> {
            let mut state = self.state.lock().unwrap();
            state.signed_prekeys.insert(upload.key_id, upload.clone());
            state.signed_prekey_uploads += 1;
            Ok(())
        }

        async fn delete_signed_prekey(&self, key_id: u32) -> KeyResult<()> {
            self.state.lock().unwrap().signed_prekeys.remove(&key_id);
            Ok(())
        }

        async fn list_signed_prekeys(&self) -> KeyResult<Vec<SignedPreKeyStatus>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .signed_prekeys
                .values()
                .map(|u| SignedPreKeyStatus {
                    key_id: Some(u.key_id),
                    public_key: Some(u.public_key.clone()),
                    signature: Some(u.signature.clone()),
                })
                .collect())
        }

        async fn delete_all_keys(&self) -> KeyResult<()> {
            let mut state = self.state.lock().unwrap();
            state.identity_key = None;
            state.prekeys.clear();
            state.signed_prekeys.clear();
            state.wipes += 1;
            Ok(())
        }
    }
}
