/// Device-private key material: the signing key, the long-term X25519 key,
/// the one-time key pools, and the final ML-KEM fallback key.
///
/// One-time keys are consumed exactly once: the consumer removes them from
/// the pool, the orchestrator mirrors the removal in the published bundle
/// and asks the transport to delete them server-side.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::crypto::{key_exchange, pqc, signing};

#[derive(Error, Debug)]
pub enum KeyMaterialError {
    #[error("Invalid key id")]
    InvalidKeyId,
    #[error("One-time key not found")]
    CannotFindOneTimeKey,
    #[error("User configuration not found")]
    CannotFindUserConfiguration,
    #[error("Payload encoding failed")]
    Encoding,
    #[error("Signing failed: {0}")]
    Signing(#[from] signing::SigningError),
}

pub type Result<T> = std::result::Result<T, KeyMaterialError>;

/// One-time Curve25519 keypair
///
/// Serde tags are the compact at-rest form inside the session context
/// envelope and must stay stable.
#[derive(Clone, Serialize, Deserialize)]
pub struct CurveOneTimeKey {
    #[serde(rename = "i")]
    pub id: Uuid,
    #[serde(rename = "p")]
    pub public: [u8; 32],
    #[serde(rename = "k")]
    pub private: [u8; 32],
    #[serde(rename = "c")]
    pub created_at: DateTime<Utc>,
}

impl Drop for CurveOneTimeKey {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl CurveOneTimeKey {
    pub fn generate() -> Self {
        let (public, private) = key_exchange::generate_keypair();
        Self {
            id: Uuid::new_v4(),
            public,
            private,
            created_at: Utc::now(),
        }
    }
}

/// One-time ML-KEM-1024 keypair
#[derive(Clone, Serialize, Deserialize)]
pub struct KemOneTimeKey {
    #[serde(rename = "i")]
    pub id: Uuid,
    #[serde(rename = "p")]
    pub public: Vec<u8>,
    #[serde(rename = "k")]
    pub private: Vec<u8>,
    #[serde(rename = "c")]
    pub created_at: DateTime<Utc>,
}

impl Drop for KemOneTimeKey {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl KemOneTimeKey {
    pub fn generate() -> Self {
        let keypair = pqc::generate_keypair();
        Self {
            id: Uuid::new_v4(),
            public: keypair.public.clone(),
            private: keypair.secret.clone(),
            created_at: Utc::now(),
        }
    }
}

/// The full private key bundle for one device
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceKeys {
    #[serde(rename = "i")]
    pub device_id: Uuid,
    #[serde(rename = "s")]
    pub signing_private_key: [u8; 32],
    #[serde(rename = "l")]
    pub long_term_private_key: [u8; 32],
    #[serde(rename = "o")]
    pub one_time_keys: Vec<CurveOneTimeKey>,
    #[serde(rename = "q")]
    pub kem_one_time_keys: Vec<KemOneTimeKey>,
    /// Long-lived fallback, used only when the one-time ML-KEM pool is empty
    #[serde(rename = "f")]
    pub final_kem_key: KemOneTimeKey,
    #[serde(rename = "r")]
    pub rotate_keys_at: Option<DateTime<Utc>>,
}

impl Drop for DeviceKeys {
    fn drop(&mut self) {
        self.signing_private_key.zeroize();
        self.long_term_private_key.zeroize();
    }
}

impl DeviceKeys {
    /// Generate a fresh device bundle
    pub fn generate(
        device_id: Uuid,
        curve_one_time_count: usize,
        kem_one_time_count: usize,
        rotate_keys_at: Option<DateTime<Utc>>,
    ) -> Self {
        let (_, signing_private_key) = signing::generate_keypair();
        let (_, long_term_private_key) = key_exchange::generate_keypair();

        let one_time_keys = (0..curve_one_time_count)
            .map(|_| CurveOneTimeKey::generate())
            .collect();
        let kem_one_time_keys = (0..kem_one_time_count)
            .map(|_| KemOneTimeKey::generate())
            .collect();

        Self {
            device_id,
            signing_private_key,
            long_term_private_key,
            one_time_keys,
            kem_one_time_keys,
            final_kem_key: KemOneTimeKey::generate(),
            rotate_keys_at,
        }
    }

    pub fn signing_public_key(&self) -> Result<[u8; 32]> {
        Ok(signing::public_key(&self.signing_private_key)?)
    }

    pub fn long_term_public_key(&self) -> [u8; 32] {
        key_exchange::public_key(&self.long_term_private_key)
            .expect("long-term key is 32 bytes")
    }

    /// Look up a one-time Curve key by id; `None` lets the caller decide
    /// whether to proceed without it
    pub fn one_time_key(&self, id: Uuid) -> Option<&CurveOneTimeKey> {
        self.one_time_keys.iter().find(|k| k.id == id)
    }

    /// Resolve an ML-KEM private key by id, falling back to the final key
    pub fn kem_key(&self, id: Uuid) -> &KemOneTimeKey {
        self.kem_one_time_keys
            .iter()
            .find(|k| k.id == id)
            .unwrap_or(&self.final_kem_key)
    }

    /// The newest one-time Curve key, if the pool is not empty
    pub fn most_recent_one_time_key(&self) -> Option<&CurveOneTimeKey> {
        self.one_time_keys.last()
    }

    /// The newest one-time ML-KEM key, or the final key when exhausted
    pub fn most_recent_kem_key(&self) -> &KemOneTimeKey {
        self.kem_one_time_keys.last().unwrap_or(&self.final_kem_key)
    }

    /// Remove a consumed one-time Curve key
    pub fn remove_one_time_key(&mut self, id: Uuid) -> Option<CurveOneTimeKey> {
        let idx = self.one_time_keys.iter().position(|k| k.id == id)?;
        Some(self.one_time_keys.remove(idx))
    }

    /// Remove a consumed one-time ML-KEM key; the final key is never removed
    pub fn remove_kem_one_time_key(&mut self, id: Uuid) -> Option<KemOneTimeKey> {
        let idx = self.kem_one_time_keys.iter().position(|k| k.id == id)?;
        Some(self.kem_one_time_keys.remove(idx))
    }

    /// Top up the Curve pool, returning the fresh keys for publication
    pub fn replenish_one_time_keys(&mut self, count: usize) -> Vec<CurveOneTimeKey> {
        let fresh: Vec<CurveOneTimeKey> =
            (0..count).map(|_| CurveOneTimeKey::generate()).collect();
        self.one_time_keys.extend(fresh.iter().cloned());
        fresh
    }

    /// Top up the ML-KEM pool, returning the fresh keys for publication
    pub fn replenish_kem_one_time_keys(&mut self, count: usize) -> Vec<KemOneTimeKey> {
        let fresh: Vec<KemOneTimeKey> = (0..count).map(|_| KemOneTimeKey::generate()).collect();
        self.kem_one_time_keys.extend(fresh.iter().cloned());
        fresh
    }

    /// Whether the configured rotation deadline has passed
    pub fn rotation_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.rotate_keys_at, Some(at) if at <= now)
    }
}
