//! End-to-end session flows over in-memory cache and transport doubles.
//!
//! Two (or three) parties share a mock key server; signed messages are
//! pumped between their transports by hand so every scenario is
//! deterministic.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use aegis_protocol::config::SessionOptions;
use aegis_protocol::error::{CacheError, TransportError};
use aegis_protocol::keys::UserConfiguration;
use aegis_protocol::model::{
    ChannelInfo, Communication, CryptoMessage, DeliveryState, EncryptedMessage, JobModel,
    MessageRecipient, SessionIdentity, SessionIdentityProps,
};
use aegis_protocol::protocol::wire::{SignedRatchetMessage, SignedRatchetMessageMetadata};
use aegis_protocol::session::{
    OneTimeKeyKind, OneTimeKeysUpdate, ReceiverDelegate, SessionCache, SessionCore,
    SessionTransport, METADATA_CHANNEL_INFO,
};

// ── In-memory cache ─────────────────────────────────────────────────

#[derive(Default)]
struct MemoryCache {
    context: Mutex<Option<Vec<u8>>>,
    identities: Mutex<HashMap<Uuid, SessionIdentity>>,
    communications: Mutex<HashMap<Uuid, Communication>>,
    messages: Mutex<HashMap<Uuid, EncryptedMessage>>,
    jobs: Mutex<HashMap<Uuid, JobModel>>,
}

impl SessionCache for MemoryCache {
    async fn fetch_local_session_context(&self) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.context.lock().unwrap().clone())
    }
    async fn update_local_session_context(&self, ciphertext: Vec<u8>) -> Result<(), CacheError> {
        *self.context.lock().unwrap() = Some(ciphertext);
        Ok(())
    }
    async fn fetch_session_identities(&self) -> Result<Vec<SessionIdentity>, CacheError> {
        Ok(self.identities.lock().unwrap().values().cloned().collect())
    }
    async fn update_session_identity(
        &self,
        identity: SessionIdentity,
    ) -> Result<(), CacheError> {
        self.identities
            .lock()
            .unwrap()
            .insert(identity.id(), identity);
        Ok(())
    }
    async fn fetch_communications(&self) -> Result<Vec<Communication>, CacheError> {
        Ok(self
            .communications
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect())
    }
    async fn create_communication(&self, communication: Communication) -> Result<(), CacheError> {
        self.communications
            .lock()
            .unwrap()
            .insert(communication.id(), communication);
        Ok(())
    }
    async fn update_communication(&self, communication: Communication) -> Result<(), CacheError> {
        self.communications
            .lock()
            .unwrap()
            .insert(communication.id(), communication);
        Ok(())
    }
    async fn create_message(&self, message: EncryptedMessage) -> Result<(), CacheError> {
        self.messages.lock().unwrap().insert(message.id(), message);
        Ok(())
    }
    async fn fetch_message(&self, id: Uuid) -> Result<Option<EncryptedMessage>, CacheError> {
        Ok(self.messages.lock().unwrap().get(&id).cloned())
    }
    async fn update_message(&self, message: EncryptedMessage) -> Result<(), CacheError> {
        self.messages.lock().unwrap().insert(message.id(), message);
        Ok(())
    }
    async fn fetch_jobs(&self) -> Result<Vec<JobModel>, CacheError> {
        Ok(self.jobs.lock().unwrap().values().cloned().collect())
    }
    async fn create_job(&self, job: JobModel) -> Result<(), CacheError> {
        self.jobs.lock().unwrap().insert(job.id(), job);
        Ok(())
    }
    async fn delete_job(&self, id: Uuid) -> Result<(), CacheError> {
        self.jobs.lock().unwrap().remove(&id);
        Ok(())
    }
}

// ── Mock key server + transport ─────────────────────────────────────

type Registry = Arc<Mutex<HashMap<String, UserConfiguration>>>;

struct MockTransport {
    registry: Registry,
    outbox: Mutex<Vec<(SignedRatchetMessage, SignedRatchetMessageMetadata)>>,
    deleted_keys: Mutex<Vec<(String, Uuid, OneTimeKeyKind)>>,
    viable: AtomicBool,
}

impl MockTransport {
    fn new(registry: Registry) -> Self {
        Self {
            registry,
            outbox: Mutex::new(Vec::new()),
            deleted_keys: Mutex::new(Vec::new()),
            viable: AtomicBool::new(true),
        }
    }

    fn drain_outbox(&self) -> Vec<(SignedRatchetMessage, SignedRatchetMessageMetadata)> {
        std::mem::take(&mut self.outbox.lock().unwrap())
    }

    fn outbox_len(&self) -> usize {
        self.outbox.lock().unwrap().len()
    }

    fn deleted(&self, kind: OneTimeKeyKind) -> usize {
        self.deleted_keys
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, k)| *k == kind)
            .count()
    }

    fn set_viable(&self, viable: bool) {
        self.viable.store(viable, Ordering::SeqCst);
    }
}

impl SessionTransport for MockTransport {
    async fn send_message(
        &self,
        message: SignedRatchetMessage,
        metadata: SignedRatchetMessageMetadata,
    ) -> Result<(), TransportError> {
        self.outbox.lock().unwrap().push((message, metadata));
        Ok(())
    }

    async fn find_configuration(
        &self,
        secret_name: &str,
    ) -> Result<UserConfiguration, TransportError> {
        self.registry
            .lock()
            .unwrap()
            .get(secret_name)
            .cloned()
            .ok_or_else(|| TransportError(format!("no configuration for '{}'", secret_name)))
    }

    async fn publish_configuration(
        &self,
        secret_name: &str,
        configuration: UserConfiguration,
    ) -> Result<(), TransportError> {
        self.registry
            .lock()
            .unwrap()
            .insert(secret_name.to_string(), configuration);
        Ok(())
    }

    async fn update_one_time_keys(
        &self,
        secret_name: &str,
        _device_id: Uuid,
        keys: OneTimeKeysUpdate,
    ) -> Result<(), TransportError> {
        let mut registry = self.registry.lock().unwrap();
        if let Some(config) = registry.get_mut(secret_name) {
            config.signed_one_time_public_keys.extend(keys.curve);
            config.signed_kem_one_time_public_keys.extend(keys.kem);
        }
        Ok(())
    }

    async fn delete_one_time_keys(
        &self,
        secret_name: &str,
        id: Uuid,
        kind: OneTimeKeyKind,
    ) -> Result<(), TransportError> {
        let mut registry = self.registry.lock().unwrap();
        if let Some(config) = registry.get_mut(secret_name) {
            match kind {
                OneTimeKeyKind::Curve => config.remove_one_time_key(id),
                OneTimeKeyKind::MlKem => config.remove_kem_one_time_key(id),
            }
        }
        self.deleted_keys
            .lock()
            .unwrap()
            .push((secret_name.to_string(), id, kind));
        Ok(())
    }

    fn is_viable(&self) -> bool {
        self.viable.load(Ordering::SeqCst)
    }
}

// ── Recording receiver ──────────────────────────────────────────────

#[derive(Default)]
struct RecordingReceiver {
    messages: Mutex<Vec<(String, String)>>,
    channels: Mutex<Vec<String>>,
}

impl RecordingReceiver {
    fn texts(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }
}

impl ReceiverDelegate for RecordingReceiver {
    fn created_message(&self, sender_secret_name: &str, message: &CryptoMessage) {
        self.messages
            .lock()
            .unwrap()
            .push((sender_secret_name.to_string(), message.text.clone()));
    }

    fn created_channel(&self, info: &ChannelInfo) {
        self.channels.lock().unwrap().push(info.name.clone());
    }
}

// ── Fixture ─────────────────────────────────────────────────────────

struct Party {
    core: SessionCore<MemoryCache, MockTransport>,
    cache: Arc<MemoryCache>,
    transport: Arc<MockTransport>,
    receiver: Arc<RecordingReceiver>,
}

async fn party(name: &str, registry: &Registry) -> Party {
    let cache = Arc::new(MemoryCache::default());
    let transport = Arc::new(MockTransport::new(registry.clone()));
    let receiver = Arc::new(RecordingReceiver::default());

    let options = SessionOptions {
        initial_curve_one_time_count: 8,
        initial_kem_one_time_count: 8,
        low_watermark: 2,
        ..SessionOptions::default()
    };
    let core = SessionCore::create(
        cache.clone(),
        transport.clone(),
        receiver.clone(),
        None,
        options,
        [7u8; 32],
        name,
    )
    .await
    .expect("session core");

    Party {
        core,
        cache,
        transport,
        receiver,
    }
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Ship everything in `from`'s outbox into `to`'s inbound pipeline, the
/// way a server would: sender identifiers ride alongside the payload
async fn deliver_all(from: &Party, to: &Party) {
    let sender_name = from.core.secret_name().await;
    let sender_device = from.core.device_id().await;
    for (signed, metadata) in from.transport.drain_outbox() {
        to.core
            .inbound_task(
                signed,
                &sender_name,
                sender_device,
                metadata.shared_message_id,
            )
            .await
            .expect("inbound task");
    }
}

/// The ratchet state one party holds for a peer, decrypted from its cache
async fn ratchet_state_for(
    party: &Party,
    peer: &str,
) -> Option<aegis_protocol::crypto::ratchet::RatchetState> {
    let key = party.core.database_encryption_key().await;
    for identity in party.cache.identities.lock().unwrap().values() {
        if let Some(props) = identity.props(&key) {
            if props.secret_name == peer {
                return props.state;
            }
        }
    }
    None
}

fn nickname(text: &str, peer: &str) -> CryptoMessage {
    CryptoMessage::new(text, MessageRecipient::Nickname(peer.to_string()))
}

// ── Scenarios ───────────────────────────────────────────────────────

/// S1 — first contact establishes matching sessions and consumes the
/// one-time keys involved
#[tokio::test]
async fn first_contact() -> anyhow::Result<()> {
    let registry: Registry = Default::default();
    let alice = party("alice", &registry).await;
    let bob = party("bob", &registry).await;

    alice.core.send_message(nickname("hi", "bob"), true).await?;
    wait_for("alice to send", || alice.transport.outbox_len() == 1).await;

    deliver_all(&alice, &bob).await;
    wait_for("bob to receive", || !bob.receiver.texts().is_empty()).await;
    assert_eq!(bob.receiver.texts(), vec!["hi"]);
    wait_for("queues to drain", || {
        alice.cache.jobs.lock().unwrap().is_empty() && bob.cache.jobs.lock().unwrap().is_empty()
    })
    .await;

    // Both sides hold state with identical roots
    let alice_state = ratchet_state_for(&alice, "bob").await.expect("alice state");
    let bob_state = ratchet_state_for(&bob, "alice").await.expect("bob state");
    assert_eq!(alice_state.root_key, bob_state.root_key);

    // Bob consumed the one-time keys alice addressed, and told the server
    assert_eq!(bob.transport.deleted(OneTimeKeyKind::Curve), 1);
    assert_eq!(bob.transport.deleted(OneTimeKeyKind::MlKem), 1);

    // The persisted copies reflect the delivery outcome on both ends
    {
        let alice_key = alice.core.database_encryption_key().await;
        let messages = alice.cache.messages.lock().unwrap();
        let stored = messages.values().find_map(|m| m.props(&alice_key)).unwrap();
        assert_eq!(stored.delivery_state, DeliveryState::Sent);
    }
    {
        let bob_key = bob.core.database_encryption_key().await;
        let messages = bob.cache.messages.lock().unwrap();
        let stored = messages.values().find_map(|m| m.props(&bob_key)).unwrap();
        assert_eq!(stored.delivery_state, DeliveryState::Received);
    }

    // Alice will never address that one-time key again
    let key = alice.core.database_encryption_key().await;
    let identities = alice.cache.identities.lock().unwrap();
    let props = identities
        .values()
        .find_map(|i| i.props(&key))
        .unwrap();
    assert!(props.one_time_public_key.is_none());
    Ok(())
}

/// S2 — the reply closes the loop with a ratchet step on alice's side
#[tokio::test]
async fn reply_closes_the_loop() {
    let registry: Registry = Default::default();
    let alice = party("alice", &registry).await;
    let bob = party("bob", &registry).await;

    alice
        .core
        .send_message(nickname("hi", "bob"), false)
        .await
        .unwrap();
    wait_for("alice to send", || alice.transport.outbox_len() == 1).await;
    wait_for("alice's job to finish", || {
        alice.cache.jobs.lock().unwrap().is_empty()
    })
    .await;
    deliver_all(&alice, &bob).await;
    wait_for("bob to receive", || !bob.receiver.texts().is_empty()).await;

    let alice_state_before = ratchet_state_for(&alice, "bob").await.unwrap();
    assert!(alice_state_before.receiving_chain_key.is_none());

    bob.core
        .send_message(nickname("hey", "alice"), false)
        .await
        .unwrap();
    wait_for("bob to send", || bob.transport.outbox_len() == 1).await;
    deliver_all(&bob, &alice).await;
    wait_for("alice to receive", || !alice.receiver.texts().is_empty()).await;
    assert_eq!(alice.receiver.texts(), vec!["hey"]);

    // The reply advanced alice's root chain and gave her a receiving chain
    let alice_state_after = ratchet_state_for(&alice, "bob").await.unwrap();
    assert!(alice_state_after.receiving_chain_key.is_some());
    assert_ne!(alice_state_after.root_key, alice_state_before.root_key);
}

/// S3 — out-of-order delivery decrypts each message exactly once and
/// leaves no skipped keys behind
#[tokio::test]
async fn out_of_order_delivery() {
    let registry: Registry = Default::default();
    let alice = party("alice", &registry).await;
    let bob = party("bob", &registry).await;

    for text in ["1", "2", "3"] {
        alice
            .core
            .send_message(nickname(text, "bob"), false)
            .await
            .unwrap();
    }
    wait_for("alice to send three", || alice.transport.outbox_len() == 3).await;

    // Deliver in order 3, 1, 2
    let alice_name = alice.core.secret_name().await;
    let alice_device = alice.core.device_id().await;
    let mut sent = alice.transport.drain_outbox();
    let permuted = vec![sent.remove(2), sent.remove(0), sent.remove(0)];
    for (signed, metadata) in permuted {
        bob.core
            .inbound_task(signed, &alice_name, alice_device, metadata.shared_message_id)
            .await
            .unwrap();
    }

    wait_for("bob to receive all", || bob.receiver.texts().len() == 3).await;
    let mut texts = bob.receiver.texts();
    texts.sort();
    assert_eq!(texts, vec!["1", "2", "3"]);

    let bob_state = ratchet_state_for(&bob, "alice").await.unwrap();
    assert!(bob_state.skipped_message_keys.is_empty());
}

/// Replay — a bit-identical ciphertext decrypts exactly once
#[tokio::test]
async fn replay_is_rejected() {
    let registry: Registry = Default::default();
    let alice = party("alice", &registry).await;
    let bob = party("bob", &registry).await;

    alice
        .core
        .send_message(nickname("once", "bob"), false)
        .await
        .unwrap();
    wait_for("alice to send", || alice.transport.outbox_len() == 1).await;

    let alice_name = alice.core.secret_name().await;
    let alice_device = alice.core.device_id().await;
    let sent = alice.transport.drain_outbox();
    let (signed, metadata) = sent.into_iter().next().unwrap();

    for _ in 0..2 {
        bob.core
            .inbound_task(
                signed.clone(),
                &alice_name,
                alice_device,
                metadata.shared_message_id,
            )
            .await
            .unwrap();
        wait_for("queue to drain", || {
            bob.cache.jobs.lock().unwrap().is_empty()
        })
        .await;
    }

    // Exactly one delivery; the replayed job was deleted permanently
    assert_eq!(bob.receiver.texts(), vec!["once"]);
}

/// S4 + S5 — key rotation: the next message opens a fresh epoch, consumed
/// keys are deleted server-side, and the peer recovers the new signing key
#[tokio::test]
async fn key_rotation() -> anyhow::Result<()> {
    let registry: Registry = Default::default();
    let alice = party("alice", &registry).await;
    let bob = party("bob", &registry).await;

    alice
        .core
        .send_message(nickname("before", "bob"), false)
        .await?;
    wait_for("alice to send", || alice.transport.outbox_len() == 1).await;
    deliver_all(&alice, &bob).await;
    wait_for("bob to receive", || bob.receiver.texts().len() == 1).await;

    let bob_key = bob.core.database_encryption_key().await;
    let old_signing_key = {
        let identities = bob.cache.identities.lock().unwrap();
        identities
            .values()
            .find_map(|i| i.props(&bob_key))
            .unwrap()
            .signing_public_key
    };

    alice.core.rotate_keys().await?;
    alice
        .core
        .send_message(nickname("post", "bob"), false)
        .await?;
    wait_for("alice to send post-rotation", || {
        alice.transport.outbox_len() == 1
    })
    .await;
    deliver_all(&alice, &bob).await;
    wait_for("bob to receive post-rotation", || {
        bob.receiver.texts().len() == 2
    })
    .await;
    assert_eq!(bob.receiver.texts()[1], "post");

    // Alice retired the one-time keys the fresh epoch consumed
    assert!(alice.transport.deleted(OneTimeKeyKind::Curve) >= 1);
    assert!(alice.transport.deleted(OneTimeKeyKind::MlKem) >= 1);

    // Bob verified under alice's rotated signing key and adopted it
    let new_signing_key = {
        let identities = bob.cache.identities.lock().unwrap();
        identities
            .values()
            .find_map(|i| i.props(&bob_key))
            .unwrap()
            .signing_public_key
    };
    assert_ne!(new_signing_key, old_signing_key);
    Ok(())
}

/// S6 — an offline queue survives a restart and ships in order
#[tokio::test]
async fn offline_queue_survives_restart() {
    let registry: Registry = Default::default();
    let alice = party("alice", &registry).await;
    let bob = party("bob", &registry).await;

    alice.transport.set_viable(false);
    for text in ["1", "2", "3"] {
        alice
            .core
            .send_message(nickname(text, "bob"), false)
            .await
            .unwrap();
    }
    // Give the loop a chance to observe non-viability
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.transport.outbox_len(), 0);
    assert_eq!(alice.cache.jobs.lock().unwrap().len(), 3);

    // "Restart": a fresh core over the same cache, with connectivity back
    let transport2 = Arc::new(MockTransport::new(registry.clone()));
    let receiver2 = Arc::new(RecordingReceiver::default());
    let core2 = SessionCore::create(
        alice.cache.clone(),
        transport2.clone(),
        receiver2,
        None,
        SessionOptions::default(),
        [7u8; 32],
        "alice",
    )
    .await
    .unwrap();

    core2.load_tasks(None).await.unwrap();
    wait_for("restarted core to ship all three", || {
        transport2.outbox_len() == 3
    })
    .await;
    wait_for("jobs to be deleted", || {
        alice.cache.jobs.lock().unwrap().is_empty()
    })
    .await;

    // Deliver in the order they were shipped; bob sees 1, 2, 3
    let alice_name = core2.secret_name().await;
    let alice_device = core2.device_id().await;
    for (signed, metadata) in transport2.drain_outbox() {
        bob.core
            .inbound_task(signed, &alice_name, alice_device, metadata.shared_message_id)
            .await
            .unwrap();
    }
    wait_for("bob to receive all", || bob.receiver.texts().len() == 3).await;
    assert_eq!(bob.receiver.texts(), vec!["1", "2", "3"]);
}

/// A long conversation ping-pongs through many ratchet epochs
#[tokio::test]
async fn extended_conversation() {
    let registry: Registry = Default::default();
    let alice = party("alice", &registry).await;
    let bob = party("bob", &registry).await;

    for round in 0..4 {
        let text = format!("alice {}", round);
        alice
            .core
            .send_message(nickname(&text, "bob"), false)
            .await
            .unwrap();
        wait_for("alice send", || alice.transport.outbox_len() == 1).await;
        deliver_all(&alice, &bob).await;
        wait_for("bob receive", || {
            bob.receiver.texts().contains(&text)
        })
        .await;

        let reply = format!("bob {}", round);
        bob.core
            .send_message(nickname(&reply, "alice"), false)
            .await
            .unwrap();
        wait_for("bob send", || bob.transport.outbox_len() == 1).await;
        deliver_all(&bob, &alice).await;
        wait_for("alice receive", || {
            alice.receiver.texts().contains(&reply)
        })
        .await;
    }

    assert_eq!(alice.receiver.texts().len(), 4);
    assert_eq!(bob.receiver.texts().len(), 4);
}

/// Channel messages fan out pairwise to every member
#[tokio::test]
async fn channel_fan_out() {
    let registry: Registry = Default::default();
    let alice = party("alice", &registry).await;
    let bob = party("bob", &registry).await;
    let carol = party("carol", &registry).await;

    let info = ChannelInfo {
        name: "ops".into(),
        members: BTreeSet::from(["alice".into(), "bob".into(), "carol".into()]),
        operators: BTreeSet::from(["alice".into()]),
    };
    let mut message = CryptoMessage::new("standup", MessageRecipient::Channel("ops".into()));
    message
        .metadata
        .insert(METADATA_CHANNEL_INFO.into(), info.encode().unwrap());

    alice.core.send_message(message, true).await.unwrap();
    wait_for("alice to fan out", || alice.transport.outbox_len() == 2).await;

    // Route each copy by the recipient identifiers in its metadata
    let alice_name = alice.core.secret_name().await;
    let alice_device = alice.core.device_id().await;
    for (signed, metadata) in alice.transport.drain_outbox() {
        let target = if metadata.secret_name == "bob" { &bob } else { &carol };
        target
            .core
            .inbound_task(signed, &alice_name, alice_device, metadata.shared_message_id)
            .await
            .unwrap();
    }

    wait_for("bob to receive", || !bob.receiver.texts().is_empty()).await;
    wait_for("carol to receive", || !carol.receiver.texts().is_empty()).await;
    assert_eq!(bob.receiver.texts(), vec!["standup"]);
    assert_eq!(carol.receiver.texts(), vec!["standup"]);

    // The channel exists on alice's side and was announced
    assert_eq!(*alice.receiver.channels.lock().unwrap(), vec!["ops"]);
}

/// Channel creation enforces the member and operator minimums
#[tokio::test]
async fn channel_requires_three_members_and_an_operator() {
    let registry: Registry = Default::default();
    let alice = party("alice", &registry).await;

    let too_small = ChannelInfo {
        name: "pair".into(),
        members: BTreeSet::from(["alice".into(), "bob".into()]),
        operators: BTreeSet::from(["alice".into()]),
    };
    let mut message = CryptoMessage::new("hi", MessageRecipient::Channel("pair".into()));
    message
        .metadata
        .insert(METADATA_CHANNEL_INFO.into(), too_small.encode().unwrap());
    assert!(alice.core.send_message(message, false).await.is_err());

    let no_operator = ChannelInfo {
        name: "flat".into(),
        members: BTreeSet::from(["alice".into(), "bob".into(), "carol".into()]),
        operators: BTreeSet::new(),
    };
    let mut message = CryptoMessage::new("hi", MessageRecipient::Channel("flat".into()));
    message
        .metadata
        .insert(METADATA_CHANNEL_INFO.into(), no_operator.encode().unwrap());
    assert!(alice.core.send_message(message, false).await.is_err());
}
