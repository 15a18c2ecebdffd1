/// Message and communication models.
///
/// `CryptoMessage` is the plaintext payload the ratchet seals; it never
/// touches the cache unencrypted. `Communication` and `EncryptedMessage`
/// are the envelope models the persist paths maintain for the application.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use uuid::Uuid;

use super::envelope::{EnvelopeError, SecureEnvelope};

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Message encoding failed")]
    Encoding,
    #[error("A channel requires at least three members")]
    InvalidMemberCount,
    #[error("A channel requires at least one operator")]
    InvalidOperatorCount,
}

/// Who a message is addressed to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRecipient {
    /// The current user's own devices
    Personal,
    /// A single peer by secret name
    Nickname(String),
    /// A named channel; fan-out is pairwise per member
    Channel(String),
    /// Accepted by the API, not implemented
    Broadcast,
}

/// The plaintext message payload sealed by the ratchet
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CryptoMessage {
    #[serde(rename = "t")]
    pub text: String,
    #[serde(rename = "m")]
    pub metadata: HashMap<String, Vec<u8>>,
    #[serde(rename = "r")]
    pub recipient: MessageRecipient,
    #[serde(rename = "i")]
    pub transport_info: Option<Vec<u8>>,
    #[serde(rename = "s")]
    pub sent_at: DateTime<Utc>,
    #[serde(rename = "d")]
    pub destruction_after_seconds: Option<i64>,
    #[serde(rename = "u")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CryptoMessage {
    pub fn new(text: impl Into<String>, recipient: MessageRecipient) -> Self {
        Self {
            text: text.into(),
            metadata: HashMap::new(),
            recipient,
            transport_info: None,
            sent_at: Utc::now(),
            destruction_after_seconds: None,
            updated_at: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        bincode::serialize(self).map_err(|_| MessageError::Encoding)
    }

    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        bincode::deserialize(data).map_err(|_| MessageError::Encoding)
    }
}

/// Channel description embedded in the first message to a new channel
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelInfo {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "m")]
    pub members: BTreeSet<String>,
    #[serde(rename = "o")]
    pub operators: BTreeSet<String>,
}

impl ChannelInfo {
    /// A channel needs at least three members and one operator
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.members.len() < 3 {
            return Err(MessageError::InvalidMemberCount);
        }
        if self.operators.is_empty() {
            return Err(MessageError::InvalidOperatorCount);
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        bincode::serialize(self).map_err(|_| MessageError::Encoding)
    }

    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        bincode::deserialize(data).map_err(|_| MessageError::Encoding)
    }
}

/// Delivery lifecycle of a persisted message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Sending,
    Sent,
    Received,
    Failed,
}

/// Encrypted props of a communication (a chat thread)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommunicationProps {
    /// Secret names of the participants; for channels, the channel name too
    #[serde(rename = "m")]
    pub members: BTreeSet<String>,
    #[serde(rename = "c")]
    pub message_count: u64,
    #[serde(rename = "h")]
    pub channel_info: Option<ChannelInfo>,
    #[serde(rename = "b")]
    pub blocked: bool,
}

/// A persisted chat thread, encrypted at rest
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Communication {
    envelope: SecureEnvelope,
}

impl Communication {
    pub fn create(
        props: &CommunicationProps,
        key: &[u8],
    ) -> Result<Self, EnvelopeError> {
        Ok(Self {
            envelope: SecureEnvelope::seal(Uuid::new_v4(), props, key)?,
        })
    }

    pub fn id(&self) -> Uuid {
        self.envelope.id()
    }

    pub fn props(&self, key: &[u8]) -> Option<CommunicationProps> {
        self.envelope.props(key)
    }

    pub fn decrypt_props(&self, key: &[u8]) -> Result<CommunicationProps, EnvelopeError> {
        self.envelope.decrypt_props(key)
    }

    pub fn modify<F>(&self, key: &[u8], f: F) -> Result<CommunicationProps, EnvelopeError>
    where
        F: FnOnce(CommunicationProps) -> CommunicationProps,
    {
        self.envelope.modify(key, f)
    }
}

/// Encrypted props of a persisted message
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedMessageProps {
    #[serde(rename = "c")]
    pub communication_id: Uuid,
    #[serde(rename = "n")]
    pub sender_secret_name: String,
    #[serde(rename = "i")]
    pub shared_message_id: Uuid,
    #[serde(rename = "d")]
    pub delivery_state: DeliveryState,
    #[serde(rename = "m")]
    pub message: CryptoMessage,
}

/// A persisted communication message, encrypted at rest
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedMessage {
    envelope: SecureEnvelope,
}

impl EncryptedMessage {
    pub fn create(
        props: &EncryptedMessageProps,
        key: &[u8],
    ) -> Result<Self, EnvelopeError> {
        Ok(Self {
            envelope: SecureEnvelope::seal(Uuid::new_v4(), props, key)?,
        })
    }

    pub fn id(&self) -> Uuid {
        self.envelope.id()
    }

    pub fn props(&self, key: &[u8]) -> Option<EncryptedMessageProps> {
        self.envelope.props(key)
    }

    pub fn decrypt_props(&self, key: &[u8]) -> Result<EncryptedMessageProps, EnvelopeError> {
        self.envelope.decrypt_props(key)
    }

    pub fn modify<F>(&self, key: &[u8], f: F) -> Result<EncryptedMessageProps, EnvelopeError>
    where
        F: FnOnce(EncryptedMessageProps) -> EncryptedMessageProps,
    {
        self.envelope.modify(key, f)
    }

    pub fn raw_data(&self) -> Result<Vec<u8>, EnvelopeError> {
        self.envelope.raw_data()
    }
}
