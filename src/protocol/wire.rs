/// Wire-level message formats.
///
/// A `RatchetMessage` is the header + ciphertext the ratchet engine
/// produces; it travels inside a `SignedRatchetMessage` whose signature is
/// a detached Ed25519 signature over the binary-encoded message. The
/// accompanying `SignedRatchetMessageMetadata` rides next to the signed
/// payload so the transport can route without touching the ciphertext.
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::ratchet::RatchetHeader;
use crate::crypto::signing;
use crate::model::message::MessageRecipient;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Wire encoding failed")]
    Encoding,
    #[error("Missing signature")]
    MissingSignature,
    #[error("Invalid signature")]
    InvalidSignature,
}

pub type Result<T> = std::result::Result<T, WireError>;

/// Header + sealed payload, as produced by the ratchet engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RatchetMessage {
    pub header: RatchetHeader,
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|_| WireError::Encoding)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|_| WireError::Encoding)
    }
}

/// `{data, signature}` — data is the encoded [`RatchetMessage`], the
/// signature is over `data` under the sender's signing key
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedRatchetMessage {
    pub data: Vec<u8>,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl SignedRatchetMessage {
    /// Encode and sign a ratchet message
    pub fn seal(message: &RatchetMessage, signing_private_key: &[u8]) -> Result<Self> {
        let data = message.encode()?;
        let signature =
            signing::sign(&data, signing_private_key).map_err(|_| WireError::MissingSignature)?;
        Ok(Self { data, signature })
    }

    /// Verify the detached signature under a candidate signing key
    pub fn verify(&self, signing_public_key: &[u8]) -> bool {
        signing::verify(&self.data, &self.signature, signing_public_key).unwrap_or(false)
    }

    /// Decode the inner ratchet message (signature must be checked first)
    pub fn message(&self) -> Result<RatchetMessage> {
        RatchetMessage::decode(&self.data)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|_| WireError::Encoding)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|_| WireError::Encoding)
    }
}

/// Routing metadata accompanying a signed message on the wire
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedRatchetMessageMetadata {
    pub secret_name: String,
    pub device_id: Uuid,
    pub recipient: MessageRecipient,
    pub transport_metadata: Option<Vec<u8>>,
    pub shared_message_id: Uuid,
    pub synchronization_key_ids: Option<SynchronizationKeyIdentities>,
}

/// One-time key ids exchanged so both sides can retire consumed keys
///
/// The sender fills `sender_*` with its own ids in use; `recipient_*` name
/// the receiving side's keys, which the receiver deletes on arrival.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizationKeyIdentities {
    pub sender_curve_id: Option<Uuid>,
    pub sender_kem_id: Option<Uuid>,
    pub recipient_curve_id: Uuid,
    pub recipient_kem_id: Uuid,
}

impl SynchronizationKeyIdentities {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|_| WireError::Encoding)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|_| WireError::Encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signing;

    fn ratchet_message() -> RatchetMessage {
        RatchetMessage {
            header: RatchetHeader {
                long_term_public: [3u8; 32],
                one_time_public: None,
                kem_public: vec![7u8; 16],
                one_time_key_id: None,
                kem_key_id: Uuid::new_v4(),
                message_number: 4,
                previous_message_count: 0,
                kem_ciphertext: vec![9u8; 16],
            },
            ciphertext: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn test_signed_message_roundtrip() {
        let (public, private) = signing::generate_keypair();
        let msg = ratchet_message();

        let signed = SignedRatchetMessage::seal(&msg, &private).unwrap();
        assert!(signed.verify(&public));

        let decoded = signed.message().unwrap();
        assert_eq!(decoded.ciphertext, msg.ciphertext);
        assert_eq!(decoded.header.message_number, 4);
    }

    #[test]
    fn test_tampered_data_fails_verification() {
        let (public, private) = signing::generate_keypair();
        let mut signed = SignedRatchetMessage::seal(&ratchet_message(), &private).unwrap();

        signed.data[0] ^= 0x01;
        assert!(!signed.verify(&public));
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let (_, private) = signing::generate_keypair();
        let (other_public, _) = signing::generate_keypair();
        let signed = SignedRatchetMessage::seal(&ratchet_message(), &private).unwrap();

        assert!(!signed.verify(&other_public));
    }

    #[test]
    fn test_sync_key_ids_roundtrip() {
        let ids = SynchronizationKeyIdentities {
            sender_curve_id: Some(Uuid::new_v4()),
            sender_kem_id: None,
            recipient_curve_id: Uuid::new_v4(),
            recipient_kem_id: Uuid::new_v4(),
        };

        let decoded = SynchronizationKeyIdentities::decode(&ids.encode().unwrap()).unwrap();
        assert_eq!(decoded, ids);
    }

    #[test]
    fn test_wire_encoding_roundtrip() {
        let (_, private) = signing::generate_keypair();
        let signed = SignedRatchetMessage::seal(&ratchet_message(), &private).unwrap();

        let encoded = signed.encode().unwrap();
        let decoded = SignedRatchetMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.data, signed.data);
        assert_eq!(decoded.signature[..], signed.signature[..]);
    }
}
