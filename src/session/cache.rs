/// Persistence port consumed by the core.
///
/// Implementations store opaque, already-encrypted records; nothing handed
/// to the cache contains plaintext. The core treats every call as a
/// suspension point and commits its own state only after the call returns.
use std::future::Future;
use uuid::Uuid;

use crate::error::CacheError;
use crate::model::{Communication, EncryptedMessage, JobModel, SessionIdentity};

pub trait SessionCache: Send + Sync + 'static {
    /// The sealed session context, if one has been created on this device
    fn fetch_local_session_context(
        &self,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, CacheError>> + Send;
    fn update_local_session_context(
        &self,
        ciphertext: Vec<u8>,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;

    fn fetch_session_identities(
        &self,
    ) -> impl Future<Output = Result<Vec<SessionIdentity>, CacheError>> + Send;
    fn update_session_identity(
        &self,
        identity: SessionIdentity,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;

    fn fetch_communications(
        &self,
    ) -> impl Future<Output = Result<Vec<Communication>, CacheError>> + Send;
    fn create_communication(
        &self,
        communication: Communication,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;
    fn update_communication(
        &self,
        communication: Communication,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;

    fn create_message(
        &self,
        message: EncryptedMessage,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;
    fn fetch_message(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<EncryptedMessage>, CacheError>> + Send;
    fn update_message(
        &self,
        message: EncryptedMessage,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;

    fn fetch_jobs(&self) -> impl Future<Output = Result<Vec<JobModel>, CacheError>> + Send;
    fn create_job(&self, job: JobModel) -> impl Future<Output = Result<(), CacheError>> + Send;
    fn delete_job(&self, id: Uuid) -> impl Future<Output = Result<(), CacheError>> + Send;
}
