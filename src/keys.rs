//! Key types and generation for the session protocol
//!
//! This module defines the key material owned by the lifecycle core:
//! - Identity keypairs (Ed25519) for long-term identity and signing
//! - Curve25519 keypairs backing pre-keys
//! - One-time pre-key records with 24-bit IDs
//! - Signed pre-key records carrying their signature and creation time
//!
//! Each type has a stored form (serde) with hex-encoded public and
//! base64-encoded secret halves, matching what the encrypted store holds.

use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};
use vodozemac::{Curve25519PublicKey, Curve25519SecretKey, Ed25519PublicKey, Ed25519SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{KeyError, KeyResult};

/// Highest assignable one-time pre-key ID (24-bit ID space)
pub const MAX_PREKEY_ID: u32 = 0x00FF_FFFF;

/// Registration IDs are drawn from `[1, 0x3FFF]`
pub const MAX_REGISTRATION_ID: u32 = 0x3FFF;

/// Length of an Ed25519 signature in bytes
pub const SIGNATURE_LENGTH: usize = 64;

fn encode_secret(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn decode_secret(s: &str) -> KeyResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| KeyError::InvalidKey(format!("Bad secret key encoding: {}", e)))
}

fn decode_public(s: &str) -> KeyResult<Vec<u8>> {
    hex::decode(s).map_err(|e| KeyError::InvalidKey(format!("Bad public key encoding: {}", e)))
}

/// Long-term identity keypair (Ed25519) plus the registration ID
///
/// Used for:
/// - Signing pre-keys to prove ownership
/// - Long-term identity verification
/// - Key fingerprint generation for verification
pub struct IdentityKeyPair {
    /// Public key (safe to share)
    pub public: Ed25519PublicKey,
    /// Secret key (never leaves device)
    secret: Ed25519SecretKey,
    /// Random registration ID used by the session protocol
    registration_id: u32,
}

impl IdentityKeyPair {
    /// Generate a new random identity keypair with a fresh registration ID
    pub fn generate() -> Self {
        let secret = Ed25519SecretKey::new();
        let public = secret.public_key();
        let registration_id = rand::thread_rng().gen_range(1..=MAX_REGISTRATION_ID);
        Self {
            public,
            secret,
            registration_id,
        }
    }

    /// Restore from existing key bytes
    pub fn from_bytes(
        public_bytes: &[u8],
        secret_bytes: &[u8],
        registration_id: u32,
    ) -> KeyResult<Self> {
        let public_arr: [u8; 32] = public_bytes
            .try_into()
            .map_err(|_| KeyError::InvalidKey("Public key must be 32 bytes".to_string()))?;
        let secret_arr: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| KeyError::InvalidKey("Secret key must be 32 bytes".to_string()))?;

        let public = Ed25519PublicKey::from_slice(&public_arr)?;
        let secret = Ed25519SecretKey::from_slice(&secret_arr);
        Ok(Self {
            public,
            secret,
            registration_id,
        })
    }

    /// Restore from the stored form
    pub fn from_stored(stored: &StoredIdentity) -> KeyResult<Self> {
        let public = decode_public(&stored.public_key)?;
        let secret = decode_secret(&stored.secret_key)?;
        Self::from_bytes(&public, &secret, stored.registration_id)
    }

    /// Stored form for the encrypted key-value store
    pub fn to_stored(&self) -> StoredIdentity {
        StoredIdentity {
            public_key: hex::encode(self.public.as_bytes()),
            secret_key: encode_secret(self.secret.to_bytes().as_slice()),
            registration_id: self.registration_id,
        }
    }

    /// Sign a message with this identity key
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.secret.sign(message).to_bytes().to_vec()
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }

    /// Registration ID assigned at generation time
    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    /// Compute a fingerprint for key verification
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(self.public.as_bytes());
        hex::encode(&hash[..8])
    }
}

/// Stored form of the identity keypair (single serialized value)
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredIdentity {
    /// Hex-encoded public key
    pub public_key: String,
    /// Base64-encoded secret key
    pub secret_key: String,
    /// Registration ID
    pub registration_id: u32,
}

/// Curve25519 keypair backing pre-keys and signed pre-keys
pub struct Curve25519KeyPair {
    /// Public key (safe to share)
    pub public: Curve25519PublicKey,
    /// Secret key (never leaves device)
    secret: Curve25519SecretKey,
}

impl Curve25519KeyPair {
    /// Generate a new random Curve25519 keypair
    pub fn generate() -> Self {
        let secret = Curve25519SecretKey::new();
        let public = Curve25519PublicKey::from(&secret);
        Self { public, secret }
    }

    /// Restore from existing key bytes
    pub fn from_bytes(public_bytes: &[u8], secret_bytes: &[u8]) -> KeyResult<Self> {
        let public_arr: [u8; 32] = public_bytes
            .try_into()
            .map_err(|_| KeyError::InvalidKey("Public key must be 32 bytes".to_string()))?;
        let secret_arr: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| KeyError::InvalidKey("Secret key must be 32 bytes".to_string()))?;

        let public = Curve25519PublicKey::from_slice(&public_arr)?;
        let secret = Curve25519SecretKey::from_slice(&secret_arr);
        Ok(Self { public, secret })
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.to_bytes().to_vec()
    }

    /// Get the secret key bytes (for secure storage)
    pub fn secret_key_bytes(&self) -> Vec<u8> {
        self.secret.to_bytes().to_vec()
    }
}

/// One-time pre-key (single use, consumed on session establishment)
pub struct PreKeyRecord {
    /// Unique 24-bit identifier
    pub id: u32,
    /// The Curve25519 keypair
    pub keypair: Curve25519KeyPair,
}

impl PreKeyRecord {
    /// Generate a fresh pre-key with the given ID
    pub fn generate(id: u32) -> Self {
        Self {
            id,
            keypair: Curve25519KeyPair::generate(),
        }
    }

    /// Restore from the stored form
    pub fn from_stored(stored: &StoredPreKey) -> KeyResult<Self> {
        let public = decode_public(&stored.public_key)?;
        let secret = decode_secret(&stored.secret_key)?;
        Ok(Self {
            id: stored.key_id,
            keypair: Curve25519KeyPair::from_bytes(&public, &secret)?,
        })
    }

    /// Stored form for the encrypted key-value store
    pub fn to_stored(&self) -> StoredPreKey {
        StoredPreKey {
            key_id: self.id,
            public_key: hex::encode(self.keypair.public_key_bytes()),
            secret_key: encode_secret(&self.keypair.secret_key_bytes()),
        }
    }
}

/// Stored form of a one-time pre-key
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredPreKey {
    /// Unique identifier
    pub key_id: u32,
    /// Hex-encoded public key
    pub public_key: String,
    /// Base64-encoded secret key
    pub secret_key: String,
}

/// Signed pre-key (rotated periodically, signed by the identity key)
///
/// The creation timestamp lives inside the record itself so the record and
/// its metadata are always written as one value.
pub struct SignedPreKeyRecord {
    /// Monotonic identifier
    pub id: u32,
    /// The Curve25519 keypair
    pub keypair: Curve25519KeyPair,
    /// Ed25519 signature of the public key by the identity key
    pub signature: Vec<u8>,
    /// Unix timestamp (seconds) when this key was created
    pub created_at: i64,
}

impl SignedPreKeyRecord {
    /// Generate a fresh signed pre-key, signed by the identity key
    pub fn generate(id: u32, identity: &IdentityKeyPair) -> Self {
        let keypair = Curve25519KeyPair::generate();
        let signature = identity.sign(&keypair.public_key_bytes());
        Self {
            id,
            keypair,
            signature,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Verify the signature with the identity public key
    pub fn verify(&self, identity_public: &Ed25519PublicKey) -> KeyResult<()> {
        let signature = vodozemac::Ed25519Signature::from_slice(&self.signature)
            .map_err(|e| KeyError::Signature(format!("Invalid signature format: {:?}", e)))?;

        identity_public
            .verify(&self.keypair.public_key_bytes(), &signature)
            .map_err(|e| KeyError::Signature(format!("Signature verification failed: {}", e)))
    }

    /// Age of this key in seconds
    pub fn age_seconds(&self) -> i64 {
        chrono::Utc::now().timestamp() - self.created_at
    }

    /// Whether this key is due for rotation (older than max_age_days)
    pub fn is_due_for_rotation(&self, max_age_days: i64) -> bool {
        self.age_seconds() >= max_age_days * 24 * 60 * 60
    }

    /// Restore from the stored form
    pub fn from_stored(stored: &StoredSignedPreKey) -> KeyResult<Self> {
        let public = decode_public(&stored.public_key)?;
        let secret = decode_secret(&stored.secret_key)?;
        let signature = base64::engine::general_purpose::STANDARD
            .decode(&stored.signature)
            .map_err(|e| KeyError::InvalidKey(format!("Bad signature encoding: {}", e)))?;
        Ok(Self {
            id: stored.key_id,
            keypair: Curve25519KeyPair::from_bytes(&public, &secret)?,
            signature,
            created_at: stored.created_at,
        })
    }

    /// Stored form for the encrypted key-value store
    pub fn to_stored(&self) -> StoredSignedPreKey {
        StoredSignedPreKey {
            key_id: self.id,
            public_key: hex::encode(self.keypair.public_key_bytes()),
            secret_key: encode_secret(&self.keypair.secret_key_bytes()),
            signature: base64::engine::general_purpose::STANDARD.encode(&self.signature),
            created_at: self.created_at,
        }
    }
}

/// Stored form of a signed pre-key, timestamp folded in
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredSignedPreKey {
    /// Unique identifier
    pub key_id: u32,
    /// Hex-encoded public key
    pub public_key: String,
    /// Base64-encoded secret key
    pub secret_key: String,
    /// Base64-encoded Ed25519 signature
    pub signature: String,
    /// Unix timestamp (seconds) of creation
    pub created_at: i64,
}
