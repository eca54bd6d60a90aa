//! Configuration for key lifecycle policy

use std::time::Duration;

/// Numeric policy for key generation, rotation and retention
#[derive(Debug, Clone)]
pub struct KeyConfig {
    /// Minimum pre-key pool size before replenishment triggers
    pub min_prekey_count: usize,
    /// Pool size that replenishment fills back up to
    pub target_prekey_count: usize,
    /// Once the highest assigned pre-key ID passes this, IDs are reclaimed
    /// from the lowest unused integers
    pub prekey_id_wrap_threshold: u32,
    /// Maximum age of the signed pre-key before rotation, in days
    pub signed_prekey_rotate_after_days: i64,
    /// How many signed pre-keys to retain locally (current + backups)
    pub local_signed_prekey_retention: usize,
    /// How many signed pre-keys to retain on the server (current + previous)
    pub remote_signed_prekey_retention: usize,
    /// Bounded retry attempts for server publications
    pub upload_attempts: u32,
    /// Fixed delay between publication retries
    pub upload_retry_delay: Duration,
    /// How long a caller waits on the identity regeneration lock
    pub regeneration_wait: Duration,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            min_prekey_count: 20,
            target_prekey_count: 110,
            prekey_id_wrap_threshold: 16_000_000,
            signed_prekey_rotate_after_days: 7,
            local_signed_prekey_retention: 3,
            remote_signed_prekey_retention: 2,
            upload_attempts: 3,
            upload_retry_delay: Duration::from_secs(1),
            regeneration_wait: Duration::from_secs(30),
        }
    }
}
