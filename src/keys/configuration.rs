/// Signed public key configuration exchanged between peers.
///
/// Every published element is a `{id, device_id, data, signature}` wrapper:
/// `data` is the bincode-encoded payload, `signature` a detached Ed25519
/// signature over `data` under the owner's signing key. Verification
/// filters to one device and silently discards elements whose signature
/// does not check out — there is no partial trust in a bundle element.
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use uuid::Uuid;

use super::device::{DeviceKeys, KeyMaterialError, Result};
use crate::crypto::signing;

/// Decoded device payload inside a signed device configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserDeviceConfiguration {
    pub device_id: Uuid,
    pub signing_public_key: [u8; 32],
    pub long_term_public_key: [u8; 32],
    pub final_kem_key_id: Uuid,
    pub final_kem_public_key: Vec<u8>,
    pub is_master_device: bool,
}

/// Decoded one-time Curve25519 public key payload
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OneTimePublicKey {
    pub id: Uuid,
    pub public: [u8; 32],
}

/// Decoded one-time ML-KEM public key payload
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KemOneTimePublicKey {
    pub id: Uuid,
    pub public: Vec<u8>,
}

/// A device record with a detached signature over its encoded payload
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedDeviceConfiguration {
    #[serde(rename = "i")]
    pub id: Uuid,
    #[serde(rename = "d")]
    pub device_id: Uuid,
    #[serde(rename = "a")]
    pub data: Vec<u8>,
    #[serde(rename = "s", with = "BigArray")]
    pub signature: [u8; 64],
}

impl SignedDeviceConfiguration {
    pub fn seal(
        id: Uuid,
        device_id: Uuid,
        payload: &UserDeviceConfiguration,
        signing_private_key: &[u8],
    ) -> Result<Self> {
        let data = bincode::serialize(payload).map_err(|_| KeyMaterialError::Encoding)?;
        let signature = signing::sign(&data, signing_private_key)?;
        Ok(Self {
            id,
            device_id,
            data,
            signature,
        })
    }

    /// Verify the signature and decode the payload; `None` discards the
    /// element without affecting the rest of the bundle
    pub fn verify(&self, signing_public_key: &[u8]) -> Option<UserDeviceConfiguration> {
        match signing::verify(&self.data, &self.signature, signing_public_key) {
            Ok(true) => bincode::deserialize(&self.data).ok(),
            _ => None,
        }
    }
}

/// A published one-time Curve25519 public key with a detached signature
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedOneTimePublicKey {
    #[serde(rename = "i")]
    pub id: Uuid,
    #[serde(rename = "d")]
    pub device_id: Uuid,
    #[serde(rename = "a")]
    pub data: Vec<u8>,
    #[serde(rename = "s", with = "BigArray")]
    pub signature: [u8; 64],
}

impl SignedOneTimePublicKey {
    pub fn seal(
        id: Uuid,
        device_id: Uuid,
        payload: &OneTimePublicKey,
        signing_private_key: &[u8],
    ) -> Result<Self> {
        let data = bincode::serialize(payload).map_err(|_| KeyMaterialError::Encoding)?;
        let signature = signing::sign(&data, signing_private_key)?;
        Ok(Self {
            id,
            device_id,
            data,
            signature,
        })
    }

    pub fn verify(&self, signing_public_key: &[u8]) -> Option<OneTimePublicKey> {
        match signing::verify(&self.data, &self.signature, signing_public_key) {
            Ok(true) => bincode::deserialize(&self.data).ok(),
            _ => None,
        }
    }
}

/// A published one-time ML-KEM public key with a detached signature
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedKemOneTimePublicKey {
    #[serde(rename = "i")]
    pub id: Uuid,
    #[serde(rename = "d")]
    pub device_id: Uuid,
    #[serde(rename = "a")]
    pub data: Vec<u8>,
    #[serde(rename = "s", with = "BigArray")]
    pub signature: [u8; 64],
}

impl SignedKemOneTimePublicKey {
    pub fn seal(
        id: Uuid,
        device_id: Uuid,
        payload: &KemOneTimePublicKey,
        signing_private_key: &[u8],
    ) -> Result<Self> {
        let data = bincode::serialize(payload).map_err(|_| KeyMaterialError::Encoding)?;
        let signature = signing::sign(&data, signing_private_key)?;
        Ok(Self {
            id,
            device_id,
            data,
            signature,
        })
    }

    pub fn verify(&self, signing_public_key: &[u8]) -> Option<KemOneTimePublicKey> {
        match signing::verify(&self.data, &self.signature, signing_public_key) {
            Ok(true) => bincode::deserialize(&self.data).ok(),
            _ => None,
        }
    }
}

/// A user's published bundle: all devices and their one-time key pools
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserConfiguration {
    #[serde(rename = "s")]
    pub signing_public_key: [u8; 32],
    #[serde(rename = "d")]
    pub signed_devices: Vec<SignedDeviceConfiguration>,
    #[serde(rename = "o")]
    pub signed_one_time_public_keys: Vec<SignedOneTimePublicKey>,
    #[serde(rename = "q")]
    pub signed_kem_one_time_public_keys: Vec<SignedKemOneTimePublicKey>,
}

/// Everything verified for a single peer device
#[derive(Clone, Debug)]
pub struct VerifiedDeviceBundle {
    pub signing_public_key: [u8; 32],
    pub device: UserDeviceConfiguration,
    pub one_time_public_keys: Vec<OneTimePublicKey>,
    pub kem_one_time_public_keys: Vec<KemOneTimePublicKey>,
}

impl UserConfiguration {
    /// Build and sign a configuration from the device's private bundle
    pub fn build(device_keys: &DeviceKeys, is_master_device: bool) -> Result<Self> {
        let signing_public_key = device_keys.signing_public_key()?;
        let device_id = device_keys.device_id;

        let device_payload = UserDeviceConfiguration {
            device_id,
            signing_public_key,
            long_term_public_key: device_keys.long_term_public_key(),
            final_kem_key_id: device_keys.final_kem_key.id,
            final_kem_public_key: device_keys.final_kem_key.public.clone(),
            is_master_device,
        };
        let signed_device = SignedDeviceConfiguration::seal(
            device_id,
            device_id,
            &device_payload,
            &device_keys.signing_private_key,
        )?;

        let mut signed_one_time_public_keys = Vec::with_capacity(device_keys.one_time_keys.len());
        for key in &device_keys.one_time_keys {
            signed_one_time_public_keys.push(SignedOneTimePublicKey::seal(
                key.id,
                device_id,
                &OneTimePublicKey {
                    id: key.id,
                    public: key.public,
                },
                &device_keys.signing_private_key,
            )?);
        }

        let mut signed_kem_one_time_public_keys =
            Vec::with_capacity(device_keys.kem_one_time_keys.len());
        for key in &device_keys.kem_one_time_keys {
            signed_kem_one_time_public_keys.push(SignedKemOneTimePublicKey::seal(
                key.id,
                device_id,
                &KemOneTimePublicKey {
                    id: key.id,
                    public: key.public.clone(),
                },
                &device_keys.signing_private_key,
            )?);
        }

        Ok(Self {
            signing_public_key,
            signed_devices: vec![signed_device],
            signed_one_time_public_keys,
            signed_kem_one_time_public_keys,
        })
    }

    /// Verify and decode the bundle for one device id
    ///
    /// Elements with invalid signatures are dropped silently; an absent or
    /// unverifiable device record fails the whole lookup.
    pub fn verify_device(&self, device_id: Uuid) -> Result<VerifiedDeviceBundle> {
        let device = self
            .signed_devices
            .iter()
            .filter(|d| d.device_id == device_id)
            .find_map(|d| d.verify(&self.signing_public_key))
            .ok_or(KeyMaterialError::CannotFindUserConfiguration)?;

        let one_time_public_keys = self
            .signed_one_time_public_keys
            .iter()
            .filter(|k| k.device_id == device_id)
            .filter_map(|k| k.verify(&self.signing_public_key))
            .collect();

        let kem_one_time_public_keys = self
            .signed_kem_one_time_public_keys
            .iter()
            .filter(|k| k.device_id == device_id)
            .filter_map(|k| k.verify(&self.signing_public_key))
            .collect();

        Ok(VerifiedDeviceBundle {
            signing_public_key: self.signing_public_key,
            device,
            one_time_public_keys,
            kem_one_time_public_keys,
        })
    }

    /// Remove a published one-time Curve key after consumption
    pub fn remove_one_time_key(&mut self, id: Uuid) {
        self.signed_one_time_public_keys.retain(|k| k.id != id);
    }

    /// Remove a published one-time ML-KEM key after consumption
    pub fn remove_kem_one_time_key(&mut self, id: Uuid) {
        self.signed_kem_one_time_public_keys.retain(|k| k.id != id);
    }
}
