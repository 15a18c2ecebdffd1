/// The current user's session context: private key bundle, the active
/// published configuration, and the database encryption key.
///
/// The context is the single most sensitive record in the system. It is
/// persisted only through [`seal`](SessionContext::seal) under the
/// app-supplied symmetric key and updated read-modify-write under the
/// orchestrator.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use zeroize::Zeroize;

use super::envelope::EnvelopeError;
use crate::keys::{DeviceKeys, UserConfiguration};
use uuid::Uuid;

/// Registration lifecycle of this device with the transport
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    Unregistered,
    Registered,
}

/// The current user
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionUser {
    #[serde(rename = "n")]
    pub secret_name: String,
    #[serde(rename = "d")]
    pub device_id: Uuid,
    #[serde(rename = "k")]
    pub device_keys: DeviceKeys,
    #[serde(rename = "m")]
    pub metadata: HashMap<String, Vec<u8>>,
}

/// Everything the orchestrator needs to act as the current user
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionContext {
    #[serde(rename = "u")]
    pub session_user: SessionUser,
    #[serde(rename = "k")]
    pub database_encryption_key: [u8; 32],
    #[serde(rename = "i")]
    pub session_context_id: i32,
    #[serde(rename = "c")]
    pub active_user_configuration: UserConfiguration,
    #[serde(rename = "r")]
    pub registration_state: RegistrationState,
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.database_encryption_key.zeroize();
    }
}

impl SessionContext {
    /// Seal for persistence under the app symmetric key
    pub fn seal(&self, app_key: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let mut encoded = Vec::new();
        ciborium::ser::into_writer(self, &mut encoded).map_err(|_| EnvelopeError::PropsError)?;
        let sealed =
            crate::crypto::aead::seal(&encoded, app_key).map_err(|_| EnvelopeError::SealFailed)?;
        encoded.zeroize();
        Ok(sealed)
    }

    /// Open a sealed context fetched from the cache
    pub fn open(sealed: &[u8], app_key: &[u8]) -> Result<Self, EnvelopeError> {
        let plaintext =
            crate::crypto::aead::open(sealed, app_key).map_err(|_| EnvelopeError::PropsError)?;
        ciborium::de::from_reader(plaintext.as_slice()).map_err(|_| EnvelopeError::PropsError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aead::generate_key;

    fn context() -> SessionContext {
        let device_keys = DeviceKeys::generate(Uuid::new_v4(), 2, 2, None);
        let config = UserConfiguration::build(&device_keys, true).unwrap();
        SessionContext {
            session_user: SessionUser {
                secret_name: "alice".into(),
                device_id: device_keys.device_id,
                device_keys,
                metadata: HashMap::new(),
            },
            database_encryption_key: generate_key(),
            session_context_id: 1,
            active_user_configuration: config,
            registration_state: RegistrationState::Registered,
        }
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let ctx = context();
        let app_key = generate_key();

        let sealed = ctx.seal(&app_key).unwrap();
        let opened = SessionContext::open(&sealed, &app_key).unwrap();

        assert_eq!(opened.session_user.secret_name, "alice");
        assert_eq!(
            opened.database_encryption_key,
            ctx.database_encryption_key
        );
        assert_eq!(opened.registration_state, RegistrationState::Registered);
    }

    #[test]
    fn test_wrong_app_key_fails() {
        let ctx = context();
        let sealed = ctx.seal(&generate_key()).unwrap();
        assert!(SessionContext::open(&sealed, &generate_key()).is_err());
    }

    #[test]
    fn test_sealed_context_hides_key_material() {
        let ctx = context();
        let signing_private = ctx.session_user.device_keys.signing_private_key;
        let sealed = ctx.seal(&generate_key()).unwrap();

        assert!(!sealed
            .windows(signing_private.len())
            .any(|w| w == signing_private));
    }
}
