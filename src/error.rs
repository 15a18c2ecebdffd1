//! Crate-level error aggregation.
//!
//! Each module defines its own error enum; `SessionError` collects them at
//! the orchestrator seam and classifies which failures are permanent for
//! the job queue (reprocessing cannot succeed, the job is deleted) versus
//! transient (the job stays persisted and is retried).

use thiserror::Error;

use crate::crypto::aead::AeadError;
use crate::crypto::key_exchange::KeyExchangeError;
use crate::crypto::pqc::PqcError;
use crate::crypto::ratchet::RatchetError;
use crate::crypto::signing::SigningError;
use crate::keys::device::KeyMaterialError;
use crate::model::envelope::EnvelopeError;
use crate::model::message::MessageError;
use crate::protocol::wire::WireError;

/// I/O failure reported by a cache implementation
#[derive(Error, Debug)]
#[error("Cache error: {0}")]
pub struct CacheError(pub String);

/// I/O failure reported by a transport implementation
#[derive(Error, Debug)]
#[error("Transport error: {0}")]
pub struct TransportError(pub String);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Ratchet(#[from] RatchetError),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error(transparent)]
    KeyExchange(#[from] KeyExchangeError),
    #[error(transparent)]
    Pqc(#[from] PqcError),
    #[error(transparent)]
    Aead(#[from] AeadError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    KeyMaterial(#[from] KeyMaterialError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Executor(#[from] crate::session::executor::ExecutorError),

    #[error("No session identity found for the sender")]
    MissingIdentity,
    #[error("Session identity not found")]
    MissingSessionIdentity,
    #[error("Signature did not verify under any known signing key")]
    InvalidSignature,
    #[error("Message metadata is missing")]
    MissingMetadata,
    #[error("Database has not been initialized")]
    DatabaseNotInitialized,
}

impl SessionError {
    /// Whether a job failing with this error should be deleted rather than
    /// retried — reprocessing a cryptographically dead message cannot
    /// succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SessionError::Ratchet(RatchetError::AuthenticationFailure)
                | SessionError::MissingIdentity
                | SessionError::KeyMaterial(KeyMaterialError::InvalidKeyId)
                | SessionError::KeyMaterial(KeyMaterialError::CannotFindOneTimeKey)
        )
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
