/// Uniform at-rest encryption wrapper for model properties.
///
/// A `SecureEnvelope` is the `{id, data}` record the cache persists: `data`
/// is the CBOR-encoded props sealed with XChaCha20-Poly1305 under the
/// session's database key. Props structs use compact single-letter field
/// tags; those tag strings are part of the on-disk format and must not
/// change.
///
/// The envelope owns an internal mutex so decrypt-mutate-reencrypt cycles
/// from different call sites serialize instead of racing.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::aead;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Props could not be decoded")]
    PropsError,
    #[error("Envelope sealing failed")]
    SealFailed,
    #[error("Envelope mutex poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// Serialized form of an envelope, as handed to the cache
#[derive(Clone, Serialize, Deserialize)]
struct EnvelopeRecord {
    #[serde(rename = "i")]
    id: Uuid,
    #[serde(rename = "d")]
    data: Vec<u8>,
}

pub struct SecureEnvelope {
    id: Uuid,
    data: Mutex<Vec<u8>>,
}

impl SecureEnvelope {
    /// Encode `props` to CBOR, seal under `key`, and wrap
    pub fn seal<P: Serialize>(id: Uuid, props: &P, key: &[u8]) -> Result<Self> {
        let data = seal_props(props, key)?;
        Ok(Self {
            id,
            data: Mutex::new(data),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Decrypt and decode the props; `None` on any failure
    pub fn props<P: DeserializeOwned>(&self, key: &[u8]) -> Option<P> {
        self.decrypt_props(key).ok()
    }

    /// Decrypt and decode the props, surfacing the failure
    pub fn decrypt_props<P: DeserializeOwned>(&self, key: &[u8]) -> Result<P> {
        let data = self.data.lock().map_err(|_| EnvelopeError::Poisoned)?;
        open_props(&data, key)
    }

    /// Re-encode and re-encrypt, replacing the ciphertext atomically
    pub fn update_props<P: Serialize>(&self, key: &[u8], props: &P) -> Result<()> {
        let sealed = seal_props(props, key)?;
        let mut data = self.data.lock().map_err(|_| EnvelopeError::Poisoned)?;
        *data = sealed;
        Ok(())
    }

    /// Decrypt, apply `f`, re-encrypt — one atomic step under the envelope
    /// mutex. Returns the updated props.
    pub fn modify<P, F>(&self, key: &[u8], f: F) -> Result<P>
    where
        P: Serialize + DeserializeOwned,
        F: FnOnce(P) -> P,
    {
        let mut data = self.data.lock().map_err(|_| EnvelopeError::Poisoned)?;
        let props: P = open_props(&data, key)?;
        let updated = f(props);
        *data = seal_props(&updated, key)?;
        Ok(updated)
    }

    /// Map the decrypted props into a plain value type
    pub fn decrypted_model<P, T>(&self, key: &[u8]) -> Result<T>
    where
        P: DeserializeOwned,
        T: From<P>,
    {
        Ok(T::from(self.decrypt_props::<P>(key)?))
    }

    /// Raw ciphertext snapshot, e.g. for confidentiality assertions
    pub fn raw_data(&self) -> Result<Vec<u8>> {
        Ok(self
            .data
            .lock()
            .map_err(|_| EnvelopeError::Poisoned)?
            .clone())
    }
}

impl Clone for SecureEnvelope {
    fn clone(&self) -> Self {
        let data = self.data.lock().map(|d| d.clone()).unwrap_or_default();
        Self {
            id: self.id,
            data: Mutex::new(data),
        }
    }
}

impl Serialize for SecureEnvelope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let data = self
            .data
            .lock()
            .map_err(|_| serde::ser::Error::custom("envelope mutex poisoned"))?;
        EnvelopeRecord {
            id: self.id,
            data: data.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SecureEnvelope {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let record = EnvelopeRecord::deserialize(deserializer)?;
        Ok(Self {
            id: record.id,
            data: Mutex::new(record.data),
        })
    }
}

fn seal_props<P: Serialize>(props: &P, key: &[u8]) -> Result<Vec<u8>> {
    let mut encoded = Vec::new();
    ciborium::ser::into_writer(props, &mut encoded).map_err(|_| EnvelopeError::PropsError)?;
    let sealed = aead::seal(&encoded, key).map_err(|_| EnvelopeError::SealFailed)?;

    use zeroize::Zeroize;
    encoded.zeroize();

    Ok(sealed)
}

fn open_props<P: DeserializeOwned>(data: &[u8], key: &[u8]) -> Result<P> {
    let plaintext = aead::open(data, key).map_err(|_| EnvelopeError::PropsError)?;
    ciborium::de::from_reader(plaintext.as_slice()).map_err(|_| EnvelopeError::PropsError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aead::generate_key;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct TestProps {
        #[serde(rename = "n")]
        name: String,
        #[serde(rename = "c")]
        count: u64,
    }

    fn props() -> TestProps {
        TestProps {
            name: "alice".into(),
            count: 1,
        }
    }

    #[test]
    fn test_seal_and_open() {
        let key = generate_key();
        let envelope = SecureEnvelope::seal(Uuid::new_v4(), &props(), &key).unwrap();

        let decoded: TestProps = envelope.decrypt_props(&key).unwrap();
        assert_eq!(decoded, props());
    }

    #[test]
    fn test_wrong_key_is_none() {
        let envelope = SecureEnvelope::seal(Uuid::new_v4(), &props(), &generate_key()).unwrap();
        assert!(envelope.props::<TestProps>(&generate_key()).is_none());
        assert!(envelope.decrypt_props::<TestProps>(&generate_key()).is_err());
    }

    #[test]
    fn test_update_props() {
        let key = generate_key();
        let envelope = SecureEnvelope::seal(Uuid::new_v4(), &props(), &key).unwrap();

        let mut updated = props();
        updated.count = 7;
        envelope.update_props(&key, &updated).unwrap();

        let decoded: TestProps = envelope.decrypt_props(&key).unwrap();
        assert_eq!(decoded.count, 7);
    }

    #[test]
    fn test_modify_atomic() {
        let key = generate_key();
        let envelope = SecureEnvelope::seal(Uuid::new_v4(), &props(), &key).unwrap();

        let updated = envelope
            .modify(&key, |mut p: TestProps| {
                p.count += 1;
                p
            })
            .unwrap();
        assert_eq!(updated.count, 2);

        let decoded: TestProps = envelope.decrypt_props(&key).unwrap();
        assert_eq!(decoded.count, 2);
    }

    #[test]
    fn test_decrypted_model() {
        struct NameOnly(String);

        impl From<TestProps> for NameOnly {
            fn from(props: TestProps) -> Self {
                NameOnly(props.name)
            }
        }

        let key = generate_key();
        let envelope = SecureEnvelope::seal(Uuid::new_v4(), &props(), &key).unwrap();

        let model: NameOnly = envelope.decrypted_model::<TestProps, _>(&key).unwrap();
        assert_eq!(model.0, "alice");
    }

    #[test]
    fn test_ciphertext_contains_no_plaintext() {
        let key = generate_key();
        let secret = TestProps {
            name: "extremely secret nickname".into(),
            count: 0,
        };
        let envelope = SecureEnvelope::seal(Uuid::new_v4(), &secret, &key).unwrap();

        let raw = envelope.raw_data().unwrap();
        let needle = b"extremely secret";
        assert!(!raw.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_serde_roundtrip_preserves_ciphertext() {
        let key = generate_key();
        let envelope = SecureEnvelope::seal(Uuid::new_v4(), &props(), &key).unwrap();

        let encoded = bincode::serialize(&envelope).unwrap();
        let restored: SecureEnvelope = bincode::deserialize(&encoded).unwrap();

        assert_eq!(restored.id(), envelope.id());
        let decoded: TestProps = restored.decrypt_props(&key).unwrap();
        assert_eq!(decoded, props());
    }
}
