/// Session orchestrator.
///
/// Translates high-level send/receive requests into ratchet jobs, resolves
/// key material, rotates and consumes one-time keys, and notifies the
/// delegates. All mutable session state lives behind one async mutex, so
/// mutations are mutually exclusive and commit only after cache and
/// transport calls return. Two serial executors isolate the work: ratchet
/// operations and job consumption run on the crypto executor, one-time key
/// publication and deletion on the key-transport executor.
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::SessionOptions;
use crate::crypto::{aead, ratchet};
use crate::error::{Result, SessionError};
use crate::keys::{
    DeviceKeys, KemOneTimePublicKey, OneTimePublicKey, SignedKemOneTimePublicKey,
    SignedOneTimePublicKey, UserConfiguration,
};
use crate::model::{
    ChannelInfo, Communication, CommunicationProps, CryptoMessage, DeliveryState,
    EncryptableTask, EncryptedMessage, EncryptedMessageProps, InboundTaskMessage, JobModel,
    MessageRecipient, OutboundTaskMessage, RegistrationState, SessionContext, SessionIdentity,
    SessionIdentityProps, SessionUser, TaskKind,
};
use crate::protocol::wire::{
    RatchetMessage, SignedRatchetMessage, SignedRatchetMessageMetadata,
    SynchronizationKeyIdentities,
};
use crate::session::cache::SessionCache;
use crate::session::delegate::{ReceiverDelegate, SessionDelegate};
use crate::session::executor::SerialExecutor;
use crate::session::queue::{JobQueue, TaskRunner};
use crate::session::transport::{OneTimeKeyKind, OneTimeKeysUpdate, SessionTransport};

/// Metadata key whose value `b"requested"` marks the friendship-request
/// phase of a nickname conversation
pub const METADATA_FRIENDSHIP_STATE: &str = "friendshipState";
/// Metadata key carrying an encoded [`ChannelInfo`] on channel creation
pub const METADATA_CHANNEL_INFO: &str = "channelInfo";

const FRIENDSHIP_REQUESTED: &[u8] = b"requested";

struct CoreState {
    context: SessionContext,
    /// Identities whose next outbound message must open a fresh session
    /// epoch and retire the one-time keys it consumes
    rotation_pending: HashSet<Uuid>,
}

struct CoreInner<C: SessionCache, T: SessionTransport> {
    cache: Arc<C>,
    transport: Arc<T>,
    session_delegate: Option<Arc<dyn SessionDelegate>>,
    receiver_delegate: Arc<dyn ReceiverDelegate>,
    options: SessionOptions,
    app_key: [u8; 32],
    state: Mutex<CoreState>,
    queue: JobQueue<C>,
    crypto_executor: SerialExecutor,
    key_transport_executor: SerialExecutor,
}

/// The public face of the session core
pub struct SessionCore<C: SessionCache, T: SessionTransport> {
    inner: Arc<CoreInner<C, T>>,
}

impl<C: SessionCache, T: SessionTransport> Clone for SessionCore<C, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: SessionCache, T: SessionTransport> SessionCore<C, T> {
    /// Load the session from the cache, or register a fresh device.
    ///
    /// A fresh device generates its key bundle, persists the encrypted
    /// context, and publishes its signed configuration. An existing device
    /// re-stages any persisted jobs so interrupted work resumes.
    pub async fn create(
        cache: Arc<C>,
        transport: Arc<T>,
        receiver_delegate: Arc<dyn ReceiverDelegate>,
        session_delegate: Option<Arc<dyn SessionDelegate>>,
        options: SessionOptions,
        app_key: [u8; 32],
        secret_name: &str,
    ) -> Result<Self> {
        let context = match cache.fetch_local_session_context().await? {
            Some(sealed) => SessionContext::open(&sealed, &app_key)?,
            None => {
                let device_id = Uuid::new_v4();
                let device_keys = DeviceKeys::generate(
                    device_id,
                    options.initial_curve_one_time_count,
                    options.initial_kem_one_time_count,
                    Some(Utc::now() + options.rotate_keys_after),
                );
                let configuration = UserConfiguration::build(&device_keys, true)?;

                let mut context = SessionContext {
                    session_user: SessionUser {
                        secret_name: secret_name.to_string(),
                        device_id,
                        device_keys,
                        metadata: HashMap::new(),
                    },
                    database_encryption_key: aead::generate_key(),
                    session_context_id: 0,
                    active_user_configuration: configuration.clone(),
                    registration_state: RegistrationState::Unregistered,
                };
                cache
                    .update_local_session_context(context.seal(&app_key)?)
                    .await?;

                transport
                    .publish_configuration(secret_name, configuration)
                    .await?;
                context.registration_state = RegistrationState::Registered;
                cache
                    .update_local_session_context(context.seal(&app_key)?)
                    .await?;

                log::info!("registered device {} for '{}'", device_id, secret_name);
                context
            }
        };

        let queue = JobQueue::new(cache.clone());
        let db_key = context.database_encryption_key;
        queue.hydrate(&db_key).await?;
        queue.load_tasks(None, &db_key).await?;

        let inner = Arc::new(CoreInner {
            cache,
            transport,
            session_delegate,
            receiver_delegate,
            options,
            app_key,
            state: Mutex::new(CoreState {
                context,
                rotation_pending: HashSet::new(),
            }),
            queue,
            crypto_executor: SerialExecutor::new("crypto"),
            key_transport_executor: SerialExecutor::new("key-transport"),
        });

        Ok(Self { inner })
    }

    pub async fn secret_name(&self) -> String {
        self.inner
            .state
            .lock()
            .await
            .context
            .session_user
            .secret_name
            .clone()
    }

    pub async fn device_id(&self) -> Uuid {
        self.inner.state.lock().await.context.session_user.device_id
    }

    /// The symmetric key model envelopes are sealed under; the application
    /// needs it to open persisted communications and messages
    pub async fn database_encryption_key(&self) -> [u8; 32] {
        self.inner
            .state
            .lock()
            .await
            .context
            .database_encryption_key
    }

    /// Outbound pipeline: resolve recipients, optionally persist, and
    /// enqueue one ratchet job per recipient device
    pub async fn send_message(
        &self,
        message: CryptoMessage,
        should_persist: bool,
    ) -> Result<()> {
        self.inner.send_message(message, should_persist).await?;
        self.process_jobs();
        Ok(())
    }

    /// Inbound pipeline: enqueue a received signed message for verification
    /// and decryption
    pub async fn inbound_task(
        &self,
        signed_message: SignedRatchetMessage,
        sender_secret_name: &str,
        sender_device_id: Uuid,
        shared_message_id: Uuid,
    ) -> Result<()> {
        let db_key = self.inner.db_key().await;
        let task = EncryptableTask::inbound(InboundTaskMessage {
            signed_message,
            sender_secret_name: sender_secret_name.to_string(),
            sender_device_id,
            shared_message_id,
        });
        self.inner.queue.feed_task(task, false, None, &db_key).await?;
        self.process_jobs();
        Ok(())
    }

    /// Re-stage persisted jobs (all, or one) and start the loop
    pub async fn load_tasks(&self, job: Option<JobModel>) -> Result<()> {
        let db_key = self.inner.db_key().await;
        self.inner.queue.load_tasks(job, &db_key).await?;
        self.process_jobs();
        Ok(())
    }

    /// Start the job loop on the crypto executor if it is idle
    pub fn process_jobs(&self) {
        let inner = self.inner.clone();
        self.inner.crypto_executor.spawn(async move {
            let db_key = inner.db_key().await;
            let transport = inner.transport.clone();
            inner
                .queue
                .attempt_task_sequence(inner.as_ref(), move || transport.is_viable(), &db_key)
                .await;
        });
    }

    /// Ask the job loop to stop between jobs
    pub fn cancel_processing(&self) {
        self.inner.queue.cancel();
    }

    pub fn resume_processing(&self) {
        self.inner.queue.resume();
        self.process_jobs();
    }

    /// Generate and publish a fresh key set; every peer session is marked
    /// for a fresh epoch whose first message retires the keys it consumes
    pub async fn rotate_keys(&self) -> Result<()> {
        self.inner.rotate_keys().await
    }

    /// Whether the rotation deadline configured at registration has passed
    pub async fn rotation_due(&self) -> bool {
        let st = self.inner.state.lock().await;
        st.context.session_user.device_keys.rotation_due(Utc::now())
    }
}

impl<C: SessionCache, T: SessionTransport> TaskRunner for CoreInner<C, T> {
    async fn run_task(&self, task: &EncryptableTask) -> Result<()> {
        match &task.task {
            TaskKind::WriteMessage(outbound) => self.run_outbound(outbound).await,
            TaskKind::StreamMessage(inbound) => self.run_inbound(inbound).await,
        }
    }
}

impl<C: SessionCache, T: SessionTransport> CoreInner<C, T> {
    async fn db_key(&self) -> [u8; 32] {
        self.state.lock().await.context.database_encryption_key
    }

    async fn user_info(&self) -> (String, Uuid) {
        let st = self.state.lock().await;
        (
            st.context.session_user.secret_name.clone(),
            st.context.session_user.device_id,
        )
    }

    async fn persist_context(&self, context: &SessionContext) -> Result<()> {
        let sealed = context.seal(&self.app_key)?;
        self.cache.update_local_session_context(sealed).await?;
        Ok(())
    }

    // ── Outbound pipeline ────────────────────────────────────────────

    async fn send_message(
        self: &Arc<Self>,
        mut message: CryptoMessage,
        should_persist: bool,
    ) -> Result<()> {
        let (secret_name, own_device_id) = self.user_info().await;
        let db_key = self.db_key().await;

        let identities = match message.recipient.clone() {
            MessageRecipient::Personal => {
                self.refresh_identities(&secret_name, false).await?
            }
            MessageRecipient::Nickname(name) => {
                let identities = self.refresh_identities(&name, false).await?;
                let requested = message
                    .metadata
                    .get(METADATA_FRIENDSHIP_STATE)
                    .map(|v| v.as_slice() == FRIENDSHIP_REQUESTED)
                    .unwrap_or(false);
                if requested && message.transport_info.is_none() {
                    // The job fills in the key ids once it selects them;
                    // the peer's first reply closes the consumption loop
                    let placeholder = SynchronizationKeyIdentities {
                        sender_curve_id: None,
                        sender_kem_id: None,
                        recipient_curve_id: Uuid::nil(),
                        recipient_kem_id: Uuid::nil(),
                    };
                    message.transport_info = Some(placeholder.encode()?);
                }
                identities
            }
            MessageRecipient::Channel(name) => {
                let info = self.resolve_channel(&name, &message, &db_key).await?;
                let mut all = Vec::new();
                for member in info.members.iter().filter(|m| **m != secret_name) {
                    all.extend(self.refresh_identities(member, true).await?);
                }
                all
            }
            MessageRecipient::Broadcast => {
                log::debug!("broadcast recipient accepted but not implemented");
                Vec::new()
            }
        };

        // Device selection: an explicit delegate choice wins, otherwise
        // non-master devices are excluded
        let selected_device = self
            .session_delegate
            .as_ref()
            .and_then(|d| d.retrieve_user_info(message.transport_info.as_deref()));
        let identities: Vec<_> = identities
            .into_iter()
            .filter(|(_, props)| props.device_id != own_device_id)
            .filter(|(_, props)| match selected_device {
                Some(device_id) => props.device_id == device_id,
                None => props.is_master_device,
            })
            .collect();

        let shared_message_id = Uuid::new_v4();
        let mut local_message_id = None;
        if should_persist {
            let (communication, _) = self
                .find_or_create_communication(&message, &secret_name, &secret_name, &db_key)
                .await?;
            let props = communication.modify(&db_key, |mut p| {
                p.message_count += 1;
                p
            })?;
            self.cache
                .update_communication(communication.clone())
                .await?;
            self.receiver_delegate
                .updated_communication(communication.id(), props.message_count);

            let model = EncryptedMessage::create(
                &EncryptedMessageProps {
                    communication_id: communication.id(),
                    sender_secret_name: secret_name.clone(),
                    shared_message_id,
                    delivery_state: DeliveryState::Sending,
                    message: message.clone(),
                },
                &db_key,
            )?;
            local_message_id = Some(model.id());
            self.cache.create_message(model).await?;
        }

        for (identity, props) in identities {
            let per_recipient = match &self.session_delegate {
                Some(delegate) => delegate.update_encryptable_message(
                    message.clone(),
                    &props.secret_name,
                    props.device_id,
                ),
                None => message.clone(),
            };
            let task = EncryptableTask::outbound(OutboundTaskMessage {
                message: per_recipient,
                recipient_identity_id: identity.id(),
                recipient_secret_name: props.secret_name.clone(),
                recipient_device_id: props.device_id,
                shared_message_id,
                local_message_id,
            });
            self.queue.feed_task(task, false, None, &db_key).await?;
        }

        Ok(())
    }

    /// Outbound ratchet job: encrypt and ship, then record the delivery
    /// outcome on the persisted copy of the message
    async fn run_outbound(&self, task: &OutboundTaskMessage) -> Result<()> {
        match self.run_outbound_inner(task).await {
            Ok(()) => {
                self.set_delivery_state(task.local_message_id, DeliveryState::Sent)
                    .await;
                Ok(())
            }
            Err(e) => {
                // A permanently failed job is about to be dropped; leave a
                // Failed record rather than a forever-Sending one
                if e.is_permanent() {
                    self.set_delivery_state(task.local_message_id, DeliveryState::Failed)
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Best-effort flip of a persisted message out of `Sending`
    async fn set_delivery_state(&self, message_id: Option<Uuid>, state: DeliveryState) {
        let Some(id) = message_id else { return };
        let db_key = self.db_key().await;

        let message = match self.cache.fetch_message(id).await {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(e) => {
                log::warn!("delivery state for message {} not updated: {}", id, e);
                return;
            }
        };

        let modified = message.modify(&db_key, |mut props| {
            if props.delivery_state == DeliveryState::Sending {
                props.delivery_state = state;
            }
            props
        });
        if modified.is_ok() {
            if let Err(e) = self.cache.update_message(message).await {
                log::warn!("delivery state for message {} not persisted: {}", id, e);
            }
        }
    }

    /// Initialize or advance the session, sign, ship, and retire keys
    /// where required
    async fn run_outbound_inner(&self, task: &OutboundTaskMessage) -> Result<()> {
        let db_key = self.db_key().await;

        let identity = self
            .cache
            .fetch_session_identities()
            .await?
            .into_iter()
            .find(|identity| identity.id() == task.recipient_identity_id)
            .ok_or(SessionError::MissingIdentity)?;
        let mut props: SessionIdentityProps = identity.decrypt_props(&db_key)?;

        let rotating = {
            self.state
                .lock()
                .await
                .rotation_pending
                .contains(&identity.id())
        };

        let fresh_epoch = props.state.is_none() || rotating;
        let mut ratchet_state = if fresh_epoch {
            let local = {
                let st = self.state.lock().await;
                let device_keys = &st.context.session_user.device_keys;
                let kem = device_keys.most_recent_kem_key();
                ratchet::SenderKeys {
                    long_term_private: device_keys.long_term_private_key,
                    one_time: device_keys
                        .most_recent_one_time_key()
                        .map(|k| (k.id, k.private)),
                    kem_key_id: kem.id,
                    kem_public: kem.public.clone(),
                    kem_private: kem.private.clone(),
                }
            };
            let remote = ratchet::RemoteKeys {
                long_term_public: props.long_term_public_key,
                one_time: props
                    .one_time_public_key
                    .as_ref()
                    .map(|k| (k.id, k.public)),
                kem_key_id: props.kem_public_key.id,
                kem_public: props.kem_public_key.public.clone(),
            };
            let state = ratchet::sender_init(local, remote)?;
            // The peer's one-time key is consumed; never address it again
            props.one_time_public_key = None;
            state
        } else {
            props.state.clone().ok_or(SessionError::MissingIdentity)?
        };

        // Fill synchronization ids with the keys actually in use
        let mut message = task.message.clone();
        let mut sync_ids = None;
        if let Some(info) = &message.transport_info {
            if let Ok(mut sync) = SynchronizationKeyIdentities::decode(info) {
                sync.sender_curve_id = ratchet_state.local_one_time_key_id;
                sync.sender_kem_id = ratchet_state.local_kem_key_id;
                if sync.recipient_curve_id.is_nil() {
                    sync.recipient_curve_id = ratchet_state
                        .established_one_time_key_id
                        .unwrap_or_else(Uuid::nil);
                }
                if sync.recipient_kem_id.is_nil() {
                    sync.recipient_kem_id = ratchet_state.established_kem_key_id;
                }
                message.transport_info = Some(sync.encode()?);
                sync_ids = Some(sync);
            }
        }

        let plaintext = message.encode()?;
        let (header, ciphertext) = ratchet_state.encrypt(&plaintext)?;

        let signing_private_key = {
            let st = self.state.lock().await;
            st.context.session_user.device_keys.signing_private_key
        };
        let signed = SignedRatchetMessage::seal(
            &RatchetMessage { header, ciphertext },
            &signing_private_key,
        )?;
        // Routing identifiers name the recipient; the server attaches the
        // sender's on delivery
        let metadata = SignedRatchetMessageMetadata {
            secret_name: task.recipient_secret_name.clone(),
            device_id: task.recipient_device_id,
            recipient: message.recipient.clone(),
            transport_metadata: message.transport_info.clone(),
            shared_message_id: task.shared_message_id,
            synchronization_key_ids: sync_ids,
        };
        self.transport.send_message(signed, metadata).await?;

        let local_one_time_key_id = ratchet_state.local_one_time_key_id;
        let local_kem_key_id = ratchet_state.local_kem_key_id;
        props.state = Some(ratchet_state);
        identity.update_props(&db_key, &props)?;
        self.cache.update_session_identity(identity.clone()).await?;

        if rotating {
            // The fresh epoch is on the wire; retire the one-time keys it
            // consumed, locally and server-side
            self.remove_local_keys(local_one_time_key_id, local_kem_key_id)
                .await?;
            self.state
                .lock()
                .await
                .rotation_pending
                .remove(&identity.id());
        }

        log::debug!(
            "sent message {} to {}/{}",
            task.shared_message_id,
            task.recipient_secret_name,
            task.recipient_device_id
        );
        Ok(())
    }

    // ── Inbound pipeline ─────────────────────────────────────────────

    /// Inbound ratchet job: verify, initialize or advance the session,
    /// decrypt, consume indicated keys, persist, and notify
    async fn run_inbound(&self, task: &InboundTaskMessage) -> Result<()> {
        let db_key = self.db_key().await;
        let (self_name, _) = self.user_info().await;

        // Resolve the sender identity, forcing one refresh if unknown; a
        // sender that cannot be resolved at all drops the job
        let mut found = self
            .find_identity(&task.sender_secret_name, task.sender_device_id, false)
            .await
            .unwrap_or(None);
        if found.is_none() {
            found = self
                .find_identity(&task.sender_secret_name, task.sender_device_id, true)
                .await
                .unwrap_or(None);
        }
        let Some((identity, mut props)) = found else {
            return Err(SessionError::MissingIdentity);
        };

        // Verify under the cached signing key, then once under the peer's
        // freshly fetched configuration (signature rotation recovery)
        if !task.signed_message.verify(&props.signing_public_key) {
            let configuration = self
                .transport
                .find_configuration(&task.sender_secret_name)
                .await?;
            let bundle = configuration
                .verify_device(task.sender_device_id)
                .map_err(|_| SessionError::InvalidSignature)?;
            if !task.signed_message.verify(&bundle.signing_public_key) {
                return Err(SessionError::InvalidSignature);
            }
            log::info!(
                "adopted rotated signing key {} for {}/{}",
                hex::encode(&bundle.signing_public_key[..8]),
                task.sender_secret_name,
                task.sender_device_id
            );
            props.signing_public_key = bundle.signing_public_key;
            props.long_term_public_key = bundle.device.long_term_public_key;
            identity.update_props(&db_key, &props)?;
            self.cache.update_session_identity(identity.clone()).await?;
        }

        let ratchet_message = task.signed_message.message()?;
        let header = &ratchet_message.header;

        // A header anchored on an unknown epoch id re-initializes the
        // session (first contact, or the peer rotated its keys)
        let needs_init = match &props.state {
            None => true,
            Some(state) => state.established_kem_key_id != header.kem_key_id,
        };

        let (mut ratchet_state, consumed) = if needs_init {
            let local = {
                let st = self.state.lock().await;
                let device_keys = &st.context.session_user.device_keys;
                let one_time = match header.one_time_key_id {
                    Some(id) => {
                        let key = device_keys.one_time_key(id).ok_or(
                            crate::keys::KeyMaterialError::CannotFindOneTimeKey,
                        )?;
                        Some((key.id, key.private))
                    }
                    None => None,
                };
                let kem = device_keys.kem_key(header.kem_key_id);
                ratchet::RecipientKeys {
                    long_term_private: device_keys.long_term_private_key,
                    one_time,
                    kem_key_id: kem.id,
                    kem_public: kem.public.clone(),
                    kem_private: kem.private.clone(),
                }
            };
            let consumed = (header.one_time_key_id, Some(header.kem_key_id));
            (ratchet::recipient_init(local, header)?, consumed)
        } else {
            (
                props.state.clone().ok_or(SessionError::MissingIdentity)?,
                (None, None),
            )
        };

        let plaintext =
            ratchet_state.decrypt(header, &ratchet_message.ciphertext, self.options.max_skip)?;
        let message = CryptoMessage::decode(&plaintext)?;

        props.state = Some(ratchet_state);
        identity.update_props(&db_key, &props)?;
        self.cache.update_session_identity(identity.clone()).await?;

        // Retire the one-time keys this epoch consumed on our side
        let (consumed_curve, consumed_kem) = consumed;
        if consumed_curve.is_some() || consumed_kem.is_some() {
            self.remove_local_keys(consumed_curve, consumed_kem).await?;
        }

        // Retire keys the peer tells us it has consumed
        if let Some(info) = &message.transport_info {
            if let Ok(sync) = SynchronizationKeyIdentities::decode(info) {
                let curve =
                    (!sync.recipient_curve_id.is_nil()).then_some(sync.recipient_curve_id);
                let kem = (!sync.recipient_kem_id.is_nil()).then_some(sync.recipient_kem_id);
                if curve.is_some() || kem.is_some() {
                    self.remove_local_keys(curve, kem).await?;
                }
            }
        }

        let persist = self
            .session_delegate
            .as_ref()
            .map(|d| d.should_persist(&message))
            .unwrap_or(true);
        if persist {
            let (communication, _) = self
                .find_or_create_communication(
                    &message,
                    &task.sender_secret_name,
                    &self_name,
                    &db_key,
                )
                .await?;
            let comm_props = communication.modify(&db_key, |mut p| {
                p.message_count += 1;
                p
            })?;
            self.cache
                .update_communication(communication.clone())
                .await?;
            self.receiver_delegate
                .updated_communication(communication.id(), comm_props.message_count);

            let model = EncryptedMessage::create(
                &EncryptedMessageProps {
                    communication_id: communication.id(),
                    sender_secret_name: task.sender_secret_name.clone(),
                    shared_message_id: task.shared_message_id,
                    delivery_state: DeliveryState::Received,
                    message: message.clone(),
                },
                &db_key,
            )?;
            self.cache.create_message(model).await?;
        }

        self.receiver_delegate
            .created_message(&task.sender_secret_name, &message);
        Ok(())
    }

    // ── Identity resolution ──────────────────────────────────────────

    /// All identities for a secret name, fetched from the peer's published
    /// configuration when nothing is cached, a refresh is forced, or a
    /// cached identity has no established session (its one-time keys may be
    /// stale)
    async fn refresh_identities(
        &self,
        secret_name: &str,
        force_refresh: bool,
    ) -> Result<Vec<(SessionIdentity, SessionIdentityProps)>> {
        let db_key = self.db_key().await;

        let mut found = Vec::new();
        for identity in self.cache.fetch_session_identities().await? {
            if let Some(props) = identity.props(&db_key) {
                if props.secret_name == secret_name {
                    found.push((identity, props));
                }
            }
        }

        let stale = found.iter().any(|(_, props)| props.state.is_none());
        if found.is_empty() || stale || force_refresh {
            let configuration = self.transport.find_configuration(secret_name).await?;
            found = self
                .ingest_configuration(secret_name, &configuration, found, &db_key)
                .await?;
        }

        Ok(found)
    }

    async fn find_identity(
        &self,
        secret_name: &str,
        device_id: Uuid,
        force_refresh: bool,
    ) -> Result<Option<(SessionIdentity, SessionIdentityProps)>> {
        let identities = self.refresh_identities(secret_name, force_refresh).await?;
        Ok(identities
            .into_iter()
            .find(|(_, props)| props.device_id == device_id))
    }

    /// Verify a fetched configuration and create or update one identity per
    /// device, preserving any established ratchet state
    async fn ingest_configuration(
        &self,
        secret_name: &str,
        configuration: &UserConfiguration,
        existing: Vec<(SessionIdentity, SessionIdentityProps)>,
        db_key: &[u8],
    ) -> Result<Vec<(SessionIdentity, SessionIdentityProps)>> {
        let device_ids: BTreeSet<Uuid> = configuration
            .signed_devices
            .iter()
            .map(|d| d.device_id)
            .collect();

        let mut result = Vec::new();
        for device_id in device_ids {
            let Ok(bundle) = configuration.verify_device(device_id) else {
                log::warn!(
                    "discarding unverifiable device {} for '{}'",
                    device_id,
                    secret_name
                );
                continue;
            };

            let one_time_public_key = bundle.one_time_public_keys.last().cloned();
            let kem_public_key = bundle
                .kem_one_time_public_keys
                .last()
                .cloned()
                .unwrap_or(KemOneTimePublicKey {
                    id: bundle.device.final_kem_key_id,
                    public: bundle.device.final_kem_public_key.clone(),
                });

            if let Some((identity, props)) = existing
                .iter()
                .find(|(_, props)| props.device_id == device_id)
            {
                let mut updated = props.clone();
                updated.signing_public_key = bundle.signing_public_key;
                updated.long_term_public_key = bundle.device.long_term_public_key;
                updated.one_time_public_key = one_time_public_key;
                updated.kem_public_key = kem_public_key;
                updated.is_master_device = bundle.device.is_master_device;
                identity.update_props(db_key, &updated)?;
                self.cache.update_session_identity(identity.clone()).await?;
                result.push((identity.clone(), updated));
            } else {
                let props = SessionIdentityProps {
                    secret_name: secret_name.to_string(),
                    device_id,
                    signing_public_key: bundle.signing_public_key,
                    long_term_public_key: bundle.device.long_term_public_key,
                    one_time_public_key,
                    kem_public_key,
                    state: None,
                    is_master_device: bundle.device.is_master_device,
                };
                let identity = SessionIdentity::create(&props, db_key)?;
                self.cache.update_session_identity(identity.clone()).await?;
                result.push((identity, props));
            }
        }

        Ok(result)
    }

    // ── Communications ───────────────────────────────────────────────

    /// Channel info for an outbound channel message: an existing channel's
    /// record, or a new channel built from the embedded info
    async fn resolve_channel(
        &self,
        name: &str,
        message: &CryptoMessage,
        db_key: &[u8],
    ) -> Result<ChannelInfo> {
        for communication in self.cache.fetch_communications().await? {
            if let Some(props) = communication.props(db_key) {
                if let Some(info) = props.channel_info {
                    if info.name == name {
                        return Ok(info);
                    }
                }
            }
        }

        let encoded = message
            .metadata
            .get(METADATA_CHANNEL_INFO)
            .ok_or(SessionError::MissingMetadata)?;
        let info = ChannelInfo::decode(encoded)?;
        info.validate()?;

        let communication = Communication::create(
            &CommunicationProps {
                members: info.members.clone(),
                message_count: 0,
                channel_info: Some(info.clone()),
                blocked: false,
            },
            db_key,
        )?;
        self.cache.create_communication(communication).await?;
        self.receiver_delegate.created_channel(&info);

        log::info!("created channel '{}'", name);
        Ok(info)
    }

    /// Find or create the communication a message belongs to
    async fn find_or_create_communication(
        &self,
        message: &CryptoMessage,
        sender_secret_name: &str,
        self_name: &str,
        db_key: &[u8],
    ) -> Result<(Communication, bool)> {
        match &message.recipient {
            MessageRecipient::Channel(name) => {
                for communication in self.cache.fetch_communications().await? {
                    if let Some(props) = communication.props(db_key) {
                        if props.channel_info.as_ref().map(|i| i.name.as_str())
                            == Some(name.as_str())
                        {
                            return Ok((communication, false));
                        }
                    }
                }

                let encoded = message
                    .metadata
                    .get(METADATA_CHANNEL_INFO)
                    .ok_or(SessionError::MissingMetadata)?;
                let info = ChannelInfo::decode(encoded)?;
                info.validate()?;
                let communication = Communication::create(
                    &CommunicationProps {
                        members: info.members.clone(),
                        message_count: 0,
                        channel_info: Some(info.clone()),
                        blocked: false,
                    },
                    db_key,
                )?;
                self.cache
                    .create_communication(communication.clone())
                    .await?;
                self.receiver_delegate.created_channel(&info);
                Ok((communication, true))
            }
            recipient => {
                // For a nickname chat, the thread partner is the sender —
                // unless the sender is one of our own devices, in which
                // case it is the addressed peer
                let partner = if sender_secret_name == self_name {
                    match recipient {
                        MessageRecipient::Nickname(name) => name.clone(),
                        _ => self_name.to_string(),
                    }
                } else {
                    sender_secret_name.to_string()
                };

                let mut members = BTreeSet::new();
                members.insert(self_name.to_string());
                members.insert(partner);

                for communication in self.cache.fetch_communications().await? {
                    if let Some(props) = communication.props(db_key) {
                        if props.channel_info.is_none() && props.members == members {
                            return Ok((communication, false));
                        }
                    }
                }

                let communication = Communication::create(
                    &CommunicationProps {
                        members,
                        message_count: 0,
                        channel_info: None,
                        blocked: false,
                    },
                    db_key,
                )?;
                self.cache
                    .create_communication(communication.clone())
                    .await?;
                Ok((communication, true))
            }
        }
    }

    // ── Key lifecycle ────────────────────────────────────────────────

    /// Remove consumed one-time keys from the private store and the active
    /// published bundle, mirror the deletion server-side, and replenish the
    /// pools when they run low
    async fn remove_local_keys(
        &self,
        curve_id: Option<Uuid>,
        kem_id: Option<Uuid>,
    ) -> Result<()> {
        let mut deletions = Vec::new();
        let secret_name = {
            let mut st = self.state.lock().await;
            let secret_name = st.context.session_user.secret_name.clone();
            let mut touched = false;

            if let Some(id) = curve_id {
                if st
                    .context
                    .session_user
                    .device_keys
                    .remove_one_time_key(id)
                    .is_some()
                {
                    st.context.active_user_configuration.remove_one_time_key(id);
                    deletions.push((id, OneTimeKeyKind::Curve));
                    touched = true;
                }
            }
            if let Some(id) = kem_id {
                if st
                    .context
                    .session_user
                    .device_keys
                    .remove_kem_one_time_key(id)
                    .is_some()
                {
                    st.context
                        .active_user_configuration
                        .remove_kem_one_time_key(id);
                    deletions.push((id, OneTimeKeyKind::MlKem));
                    touched = true;
                }
            }

            if touched {
                self.persist_context(&st.context).await?;
            }
            secret_name
        };

        for (id, kind) in deletions {
            let transport = self.transport.clone();
            let name = secret_name.clone();
            self.key_transport_executor
                .run(async move { transport.delete_one_time_keys(&name, id, kind).await })
                .await??;
            log::debug!("deleted consumed one-time key {} ({:?})", id, kind);
        }

        self.maybe_replenish().await
    }

    /// Refill one-time pools that dropped below the low watermark and
    /// publish the fresh signed keys
    async fn maybe_replenish(&self) -> Result<()> {
        let (secret_name, device_id, update) = {
            let mut st = self.state.lock().await;
            let secret_name = st.context.session_user.secret_name.clone();
            let device_id = st.context.session_user.device_id;

            let context = &mut st.context;
            let mut update = OneTimeKeysUpdate::default();

            if context.session_user.device_keys.one_time_keys.len() < self.options.low_watermark
            {
                let count = self
                    .options
                    .initial_curve_one_time_count
                    .saturating_sub(context.session_user.device_keys.one_time_keys.len());
                let fresh = context
                    .session_user
                    .device_keys
                    .replenish_one_time_keys(count);
                let signing_key = context.session_user.device_keys.signing_private_key;
                for key in &fresh {
                    let signed = SignedOneTimePublicKey::seal(
                        key.id,
                        device_id,
                        &OneTimePublicKey {
                            id: key.id,
                            public: key.public,
                        },
                        &signing_key,
                    )?;
                    context
                        .active_user_configuration
                        .signed_one_time_public_keys
                        .push(signed.clone());
                    update.curve.push(signed);
                }
            }

            if context.session_user.device_keys.kem_one_time_keys.len()
                < self.options.low_watermark
            {
                let count = self
                    .options
                    .initial_kem_one_time_count
                    .saturating_sub(context.session_user.device_keys.kem_one_time_keys.len());
                let fresh = context
                    .session_user
                    .device_keys
                    .replenish_kem_one_time_keys(count);
                let signing_key = context.session_user.device_keys.signing_private_key;
                for key in &fresh {
                    let signed = SignedKemOneTimePublicKey::seal(
                        key.id,
                        device_id,
                        &KemOneTimePublicKey {
                            id: key.id,
                            public: key.public.clone(),
                        },
                        &signing_key,
                    )?;
                    context
                        .active_user_configuration
                        .signed_kem_one_time_public_keys
                        .push(signed.clone());
                    update.kem.push(signed);
                }
            }

            if update.curve.is_empty() && update.kem.is_empty() {
                return Ok(());
            }
            self.persist_context(context).await?;
            (secret_name, device_id, update)
        };

        log::info!(
            "replenishing one-time keys: {} curve, {} ml-kem",
            update.curve.len(),
            update.kem.len()
        );
        let transport = self.transport.clone();
        self.key_transport_executor
            .run(async move {
                transport
                    .update_one_time_keys(&secret_name, device_id, update)
                    .await
            })
            .await??;
        Ok(())
    }

    /// Generate a fresh key set, publish it, and mark every peer session
    /// for a fresh epoch
    async fn rotate_keys(&self) -> Result<()> {
        let (secret_name, configuration) = {
            let mut st = self.state.lock().await;
            let device_id = st.context.session_user.device_id;
            let device_keys = DeviceKeys::generate(
                device_id,
                self.options.initial_curve_one_time_count,
                self.options.initial_kem_one_time_count,
                Some(Utc::now() + self.options.rotate_keys_after),
            );
            let configuration = UserConfiguration::build(&device_keys, true)?;
            st.context.session_user.device_keys = device_keys;
            st.context.active_user_configuration = configuration.clone();
            self.persist_context(&st.context).await?;
            (
                st.context.session_user.secret_name.clone(),
                configuration,
            )
        };

        let db_key = self.db_key().await;
        for identity in self.cache.fetch_session_identities().await? {
            if identity.props(&db_key).is_some() {
                identity.modify(&db_key, |mut props: SessionIdentityProps| {
                    props.state = None;
                    props
                })?;
                self.cache.update_session_identity(identity.clone()).await?;
                self.state
                    .lock()
                    .await
                    .rotation_pending
                    .insert(identity.id());
            }
        }

        let transport = self.transport.clone();
        let name = secret_name.clone();
        self.key_transport_executor
            .run(async move { transport.publish_configuration(&name, configuration).await })
            .await??;

        log::info!("rotated device keys for '{}'", secret_name);
        Ok(())
    }
}
