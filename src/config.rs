//! Recognized session options.

use chrono::Duration;

/// Tunables for key management and the ratchet engine
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Initial Curve25519 one-time keys generated per device
    pub initial_curve_one_time_count: usize,
    /// Initial ML-KEM one-time keys generated per device
    pub initial_kem_one_time_count: usize,
    /// Pool size below which fresh one-time keys are generated and published
    pub low_watermark: usize,
    /// Cap on the skipped-message-key cache per ratchet
    pub max_skip: usize,
    /// Time before a forced key rotation
    pub rotate_keys_after: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            initial_curve_one_time_count: 100,
            initial_kem_one_time_count: 100,
            low_watermark: 10,
            max_skip: 1000,
            rotate_keys_after: Duration::days(30),
        }
    }
}
