//! Persistable models and the at-rest encryption envelope.

pub mod context;
pub mod envelope;
pub mod identity;
pub mod job;
pub mod message;

pub use context::{RegistrationState, SessionContext, SessionUser};
pub use envelope::{EnvelopeError, SecureEnvelope};
pub use identity::{SessionIdentity, SessionIdentityProps};
pub use job::{
    EncryptableTask, InboundTaskMessage, JobModel, JobProps, OutboundTaskMessage, TaskKind,
    TaskPriority,
};
pub use message::{
    ChannelInfo, Communication, CommunicationProps, CryptoMessage, DeliveryState,
    EncryptedMessage, EncryptedMessageProps, MessageError, MessageRecipient,
};
