/// Network port consumed by the core.
///
/// The transport ships signed messages, serves peer configurations, and
/// mirrors one-time-key lifecycle changes server-side. It owns its own
/// timeouts; the core only distinguishes success from failure.
use serde::{Deserialize, Serialize};
use std::future::Future;
use uuid::Uuid;

use crate::error::TransportError;
use crate::keys::{SignedKemOneTimePublicKey, SignedOneTimePublicKey, UserConfiguration};
use crate::protocol::wire::{SignedRatchetMessage, SignedRatchetMessageMetadata};

/// Which one-time key pool a server-side deletion targets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OneTimeKeyKind {
    Curve,
    MlKem,
}

/// Fresh signed one-time keys for publication
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OneTimeKeysUpdate {
    pub curve: Vec<SignedOneTimePublicKey>,
    pub kem: Vec<SignedKemOneTimePublicKey>,
}

pub trait SessionTransport: Send + Sync + 'static {
    fn send_message(
        &self,
        message: SignedRatchetMessage,
        metadata: SignedRatchetMessageMetadata,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn find_configuration(
        &self,
        secret_name: &str,
    ) -> impl Future<Output = Result<UserConfiguration, TransportError>> + Send;

    /// Announce a full configuration (registration and key rotation)
    fn publish_configuration(
        &self,
        secret_name: &str,
        configuration: UserConfiguration,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn update_one_time_keys(
        &self,
        secret_name: &str,
        device_id: Uuid,
        keys: OneTimeKeysUpdate,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn delete_one_time_keys(
        &self,
        secret_name: &str,
        id: Uuid,
        kind: OneTimeKeyKind,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Whether the session can currently reach the network; a non-viable
    /// transport pauses the job queue without dropping jobs
    fn is_viable(&self) -> bool;
}
