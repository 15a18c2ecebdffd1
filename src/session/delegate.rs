/// Application hooks.
///
/// The orchestrator depends on these capability traits, never on concrete
/// application types. Every method is small and single-purpose; defaults
/// keep a minimal integration to a handful of lines.
use uuid::Uuid;

use crate::model::message::{ChannelInfo, CryptoMessage};

/// Policy hooks consulted while building and persisting messages
pub trait SessionDelegate: Send + Sync {
    /// Pick a specific recipient device from transport info; `None` keeps
    /// the default master-device filtering
    fn retrieve_user_info(&self, _transport_info: Option<&[u8]>) -> Option<Uuid> {
        None
    }

    /// Rewrite message metadata per recipient before encryption
    fn update_encryptable_message(
        &self,
        message: CryptoMessage,
        _recipient_secret_name: &str,
        _recipient_device_id: Uuid,
    ) -> CryptoMessage {
        message
    }

    /// Whether an inbound message should be persisted to the cache
    fn should_persist(&self, _message: &CryptoMessage) -> bool {
        true
    }
}

/// Notifications surfaced after inbound processing; cryptographic errors
/// never reach this layer untranslated
pub trait ReceiverDelegate: Send + Sync {
    /// A message was decrypted and (if policy allowed) persisted
    fn created_message(&self, sender_secret_name: &str, message: &CryptoMessage);

    /// A communication's message count advanced
    fn updated_communication(&self, _communication_id: Uuid, _message_count: u64) {}

    /// A channel was created from an inbound or outbound message
    fn created_channel(&self, _info: &ChannelInfo) {}
}

/// Default no-op policy
pub struct DefaultSessionDelegate;

impl SessionDelegate for DefaultSessionDelegate {}
