/// Queued cryptographic work, encrypted at rest.
///
/// A `JobModel` wraps one `EncryptableTask` with its queue bookkeeping.
/// Jobs persist before execution and are deleted on success or on a
/// permanent failure; plaintext task data never reaches the cache.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::envelope::{EnvelopeError, SecureEnvelope};
use super::message::CryptoMessage;
use crate::protocol::wire::SignedRatchetMessage;

/// Outbound work: encrypt and ship one message to one recipient device
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundTaskMessage {
    #[serde(rename = "m")]
    pub message: CryptoMessage,
    /// Weak reference; the identity is re-resolved at execution time
    #[serde(rename = "r")]
    pub recipient_identity_id: Uuid,
    #[serde(rename = "n")]
    pub recipient_secret_name: String,
    #[serde(rename = "d")]
    pub recipient_device_id: Uuid,
    /// Links the fan-out copies of one logical message
    #[serde(rename = "i")]
    pub shared_message_id: Uuid,
    /// Persisted message whose delivery state records this job's outcome
    #[serde(rename = "p")]
    pub local_message_id: Option<Uuid>,
}

/// Inbound work: verify, decrypt, and deliver one received message
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundTaskMessage {
    #[serde(rename = "g")]
    pub signed_message: SignedRatchetMessage,
    #[serde(rename = "n")]
    pub sender_secret_name: String,
    #[serde(rename = "d")]
    pub sender_device_id: Uuid,
    #[serde(rename = "i")]
    pub shared_message_id: Uuid,
}

/// The two kinds of ratchet work
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TaskKind {
    WriteMessage(OutboundTaskMessage),
    StreamMessage(InboundTaskMessage),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPriority {
    Standard,
    Background,
    Urgent,
}

/// An immutable unit of work fed to the queue
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptableTask {
    #[serde(rename = "t")]
    pub task: TaskKind,
    #[serde(rename = "p")]
    pub priority: TaskPriority,
    #[serde(rename = "s")]
    pub scheduled_at: DateTime<Utc>,
}

impl EncryptableTask {
    pub fn outbound(message: OutboundTaskMessage) -> Self {
        Self {
            task: TaskKind::WriteMessage(message),
            priority: TaskPriority::Standard,
            scheduled_at: Utc::now(),
        }
    }

    pub fn inbound(message: InboundTaskMessage) -> Self {
        Self {
            task: TaskKind::StreamMessage(message),
            priority: TaskPriority::Standard,
            scheduled_at: Utc::now(),
        }
    }
}

/// Encrypted props of a queued job
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobProps {
    #[serde(rename = "s")]
    pub sequence_id: u64,
    #[serde(rename = "t")]
    pub task: EncryptableTask,
    #[serde(rename = "b")]
    pub is_background: bool,
    #[serde(rename = "d")]
    pub delayed_until: Option<DateTime<Utc>>,
    #[serde(rename = "a")]
    pub scheduled_at: DateTime<Utc>,
    #[serde(rename = "n")]
    pub attempts: u32,
}

/// A persisted job, encrypted at rest
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobModel {
    envelope: SecureEnvelope,
}

impl JobModel {
    pub fn create(props: &JobProps, key: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(Self {
            envelope: SecureEnvelope::seal(Uuid::new_v4(), props, key)?,
        })
    }

    pub fn id(&self) -> Uuid {
        self.envelope.id()
    }

    pub fn props(&self, key: &[u8]) -> Option<JobProps> {
        self.envelope.props(key)
    }

    pub fn decrypt_props(&self, key: &[u8]) -> Result<JobProps, EnvelopeError> {
        self.envelope.decrypt_props(key)
    }

    pub fn update_props(&self, key: &[u8], props: &JobProps) -> Result<(), EnvelopeError> {
        self.envelope.update_props(key, props)
    }

    pub fn raw_data(&self) -> Result<Vec<u8>, EnvelopeError> {
        self.envelope.raw_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aead::generate_key;
    use crate::model::message::MessageRecipient;

    fn outbound_props(sequence_id: u64) -> JobProps {
        JobProps {
            sequence_id,
            task: EncryptableTask::outbound(OutboundTaskMessage {
                message: CryptoMessage::new(
                    "queued text",
                    MessageRecipient::Nickname("bob".into()),
                ),
                recipient_identity_id: Uuid::new_v4(),
                recipient_secret_name: "bob".into(),
                recipient_device_id: Uuid::new_v4(),
                shared_message_id: Uuid::new_v4(),
                local_message_id: None,
            }),
            is_background: false,
            delayed_until: None,
            scheduled_at: Utc::now(),
            attempts: 0,
        }
    }

    #[test]
    fn test_job_roundtrip() {
        let key = generate_key();
        let job = JobModel::create(&outbound_props(3), &key).unwrap();

        let props = job.props(&key).unwrap();
        assert_eq!(props.sequence_id, 3);
        assert!(matches!(props.task.task, TaskKind::WriteMessage(_)));
    }

    #[test]
    fn test_job_ciphertext_hides_task() {
        let key = generate_key();
        let job = JobModel::create(&outbound_props(0), &key).unwrap();

        let raw = job.raw_data().unwrap();
        let needle = b"queued text";
        assert!(!raw.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_attempts_update() {
        let key = generate_key();
        let job = JobModel::create(&outbound_props(1), &key).unwrap();

        let mut props = job.decrypt_props(&key).unwrap();
        props.attempts += 1;
        job.update_props(&key, &props).unwrap();

        assert_eq!(job.props(&key).unwrap().attempts, 1);
    }
}
