/// Per-peer-device session identity.
///
/// One identity exists per (peer secret name, peer device id). The encrypted
/// props hold the peer's verified public keys and, once a session epoch has
/// been established, the ratchet state.
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::envelope::{EnvelopeError, SecureEnvelope};
use crate::crypto::ratchet::RatchetState;
use crate::keys::{KemOneTimePublicKey, OneTimePublicKey};

/// Encrypted props of a session identity
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionIdentityProps {
    #[serde(rename = "n")]
    pub secret_name: String,
    #[serde(rename = "d")]
    pub device_id: Uuid,
    #[serde(rename = "s")]
    pub signing_public_key: [u8; 32],
    #[serde(rename = "l")]
    pub long_term_public_key: [u8; 32],
    #[serde(rename = "o")]
    pub one_time_public_key: Option<OneTimePublicKey>,
    #[serde(rename = "q")]
    pub kem_public_key: KemOneTimePublicKey,
    #[serde(rename = "r")]
    pub state: Option<RatchetState>,
    #[serde(rename = "m")]
    pub is_master_device: bool,
}

/// A peer device record, encrypted at rest
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionIdentity {
    envelope: SecureEnvelope,
}

impl SessionIdentity {
    pub fn create(props: &SessionIdentityProps, key: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(Self {
            envelope: SecureEnvelope::seal(Uuid::new_v4(), props, key)?,
        })
    }

    pub fn id(&self) -> Uuid {
        self.envelope.id()
    }

    pub fn props(&self, key: &[u8]) -> Option<SessionIdentityProps> {
        self.envelope.props(key)
    }

    pub fn decrypt_props(&self, key: &[u8]) -> Result<SessionIdentityProps, EnvelopeError> {
        self.envelope.decrypt_props(key)
    }

    pub fn update_props(
        &self,
        key: &[u8],
        props: &SessionIdentityProps,
    ) -> Result<(), EnvelopeError> {
        self.envelope.update_props(key, props)
    }

    pub fn modify<F>(&self, key: &[u8], f: F) -> Result<SessionIdentityProps, EnvelopeError>
    where
        F: FnOnce(SessionIdentityProps) -> SessionIdentityProps,
    {
        self.envelope.modify(key, f)
    }

    pub fn raw_data(&self) -> Result<Vec<u8>, EnvelopeError> {
        self.envelope.raw_data()
    }
}
