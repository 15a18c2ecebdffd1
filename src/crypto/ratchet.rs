/// Hybrid Double Ratchet
///
/// A Signal-style double ratchet where the ratchet "public key" is the pair
/// (sender long-term X25519 public, ML-KEM-1024 encapsulation ciphertext):
///
/// 1. **Symmetric ratchet**: HMAC-SHA256 chain key evolution per message.
/// 2. **Hybrid ratchet**: every sending chain is created with a fresh
///    ML-KEM encapsulation to the peer's current KEM key, mixed with an
///    X25519 output through the root KDF. A changed ciphertext in the
///    header signals a new chain epoch to the receiver.
///
/// Session initialization additionally folds the one-time-key DH outputs
/// into the first root, so compromise of long-term keys alone does not
/// reveal past sessions. Confidentiality holds while either X25519 or
/// ML-KEM-1024 remains unbroken.
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::crypto::{
    aead, kdf,
    key_exchange::{self, KeyExchangeError},
    pqc::{self, PqcError},
};

#[derive(Error, Debug)]
pub enum RatchetError {
    #[error("Ratchet session not initialized")]
    NotInitialized,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Message failed authentication")]
    AuthenticationFailure,
    #[error("Too many skipped messages")]
    SkippedOverflow,
    #[error("KEM operation failed: {0}")]
    Kem(#[from] PqcError),
    #[error("Key exchange failed: {0}")]
    KeyExchange(#[from] KeyExchangeError),
    #[error("Key derivation failed: {0}")]
    Kdf(#[from] kdf::KdfError),
    #[error("Header encoding failed")]
    HeaderEncoding,
}

pub type Result<T> = std::result::Result<T, RatchetError>;

/// Header carried by every ratchet message
///
/// The `long_term_public` / `one_time_public` / `kem_public` fields are the
/// sender's own keys, named from the receiver's point of view once decoded.
/// `one_time_key_id` and `kem_key_id` name the *receiver's* keys the sender
/// consumed; `kem_key_id` anchors the session epoch and is carried by both
/// directions until a re-initialization replaces it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    pub long_term_public: [u8; 32],
    pub one_time_public: Option<[u8; 32]>,
    pub kem_public: Vec<u8>,
    pub one_time_key_id: Option<Uuid>,
    pub kem_key_id: Uuid,
    pub message_number: u64,
    pub previous_message_count: u64,
    pub kem_ciphertext: Vec<u8>,
}

impl RatchetHeader {
    /// Binary encoding — doubles as the AEAD associated data
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|_| RatchetError::HeaderEncoding)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|_| RatchetError::HeaderEncoding)
    }
}

/// Message key stashed for an out-of-order message
///
/// Serde tags are the compact at-rest form; they persist inside the
/// session identity envelope and must stay stable.
#[derive(Clone, Serialize, Deserialize)]
pub struct SkippedMessageKey {
    #[serde(rename = "t")]
    chain_tag: [u8; 32],
    #[serde(rename = "n")]
    message_number: u64,
    #[serde(rename = "k")]
    message_key: [u8; 32],
}

impl Drop for SkippedMessageKey {
    fn drop(&mut self) {
        self.message_key.zeroize();
    }
}

/// Local key material selected for initiating a session epoch
pub struct SenderKeys {
    pub long_term_private: [u8; 32],
    /// Own one-time Curve key in use: (id, private)
    pub one_time: Option<(Uuid, [u8; 32])>,
    /// Own ML-KEM key advertised for the peer's reply chain
    pub kem_key_id: Uuid,
    pub kem_public: Vec<u8>,
    pub kem_private: Vec<u8>,
}

/// The peer's verified key material selected from its published bundle
pub struct RemoteKeys {
    pub long_term_public: [u8; 32],
    pub one_time: Option<(Uuid, [u8; 32])>,
    pub kem_key_id: Uuid,
    pub kem_public: Vec<u8>,
}

/// Local key material resolved from the first header of an inbound epoch
pub struct RecipientKeys {
    pub long_term_private: [u8; 32],
    /// Own one-time Curve key the header's `one_time_key_id` resolved to
    pub one_time: Option<(Uuid, [u8; 32])>,
    /// Own ML-KEM key the header's `kem_key_id` resolved to
    pub kem_key_id: Uuid,
    pub kem_public: Vec<u8>,
    pub kem_private: Vec<u8>,
}

/// Per-peer ratchet state, persisted inside the session identity envelope
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    // ── Chains ──
    #[serde(rename = "rk")]
    pub root_key: [u8; 32],
    #[serde(rename = "sc")]
    pub sending_chain_key: Option<[u8; 32]>,
    #[serde(rename = "rc")]
    pub receiving_chain_key: Option<[u8; 32]>,
    #[serde(rename = "sn")]
    pub sending_message_number: u64,
    #[serde(rename = "rn")]
    pub receiving_message_number: u64,
    #[serde(rename = "pn")]
    pub previous_sending_message_count: u64,
    #[serde(rename = "sk")]
    pub skipped_message_keys: Vec<SkippedMessageKey>,

    // ── Local key material ──
    #[serde(rename = "lp")]
    pub local_long_term_private: [u8; 32],
    #[serde(rename = "lq")]
    pub local_long_term_public: [u8; 32],
    #[serde(rename = "op")]
    pub local_one_time_private: Option<[u8; 32]>,
    #[serde(rename = "oq")]
    pub local_one_time_public: Option<[u8; 32]>,
    #[serde(rename = "kp")]
    pub local_kem_private: Vec<u8>,
    #[serde(rename = "kq")]
    pub local_kem_public: Vec<u8>,
    #[serde(rename = "li")]
    pub local_one_time_key_id: Option<Uuid>,
    #[serde(rename = "lk")]
    pub local_kem_key_id: Option<Uuid>,

    // ── Remote key material ──
    #[serde(rename = "rl")]
    pub remote_long_term_public: [u8; 32],
    #[serde(rename = "ro")]
    pub remote_one_time_public: Option<[u8; 32]>,
    #[serde(rename = "rq")]
    pub remote_kem_public: Vec<u8>,

    // ── Epoch anchors ──
    #[serde(rename = "ek")]
    pub established_kem_key_id: Uuid,
    #[serde(rename = "eo")]
    pub established_one_time_key_id: Option<Uuid>,
    #[serde(rename = "ct")]
    pub sending_kem_ciphertext: Option<Vec<u8>>,
    #[serde(rename = "tg")]
    pub receiving_chain_tag: Option<[u8; 32]>,
    #[serde(rename = "ic")]
    pub initial_sending_chain: bool,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        if let Some(ref mut k) = self.sending_chain_key {
            k.zeroize();
        }
        if let Some(ref mut k) = self.receiving_chain_key {
            k.zeroize();
        }
        self.local_long_term_private.zeroize();
        if let Some(ref mut k) = self.local_one_time_private {
            k.zeroize();
        }
        self.local_kem_private.zeroize();
    }
}

/// Identify a chain by the header fields that created it
fn chain_tag(long_term_public: &[u8; 32], kem_ciphertext: &[u8]) -> [u8; 32] {
    let mut input = Vec::with_capacity(32 + kem_ciphertext.len());
    input.extend_from_slice(long_term_public);
    input.extend_from_slice(kem_ciphertext);
    blake3::derive_key("AegisProtocol-Ratchet-ChainTag-v1", &input)
}

/// Initialize a session epoch as the sender (first outbound, no prior state)
///
/// Derives the initial shared secret from the hybrid combination of
/// long-term / one-time DH outputs and a fresh KEM encapsulation to the
/// peer's ML-KEM key, in the canonical order:
/// `DH(lt, lt') ‖ DH(lt, ot')? ‖ DH(ot, lt')? ‖ DH(ot, ot')? ‖ KEM_ss`.
pub fn sender_init(local: SenderKeys, remote: RemoteKeys) -> Result<RatchetState> {
    let dh1 = key_exchange::diffie_hellman(&local.long_term_private, &remote.long_term_public)?;
    let dh2 = match remote.one_time {
        Some((_, ref ot_pub)) => {
            Some(key_exchange::diffie_hellman(&local.long_term_private, ot_pub)?)
        }
        None => None,
    };
    let dh3 = match local.one_time {
        Some((_, ref ot_priv)) => Some(key_exchange::diffie_hellman(
            ot_priv,
            &remote.long_term_public,
        )?),
        None => None,
    };
    let dh4 = match (local.one_time.as_ref(), remote.one_time.as_ref()) {
        (Some((_, ot_priv)), Some((_, ot_pub))) => {
            Some(key_exchange::diffie_hellman(ot_priv, ot_pub)?)
        }
        _ => None,
    };

    let (kem_ciphertext, kem_ss) = pqc::encapsulate(&remote.kem_public)?;

    let mut dh_outputs: Vec<&[u8; 32]> = vec![&dh1];
    if let Some(ref dh) = dh2 {
        dh_outputs.push(dh);
    }
    if let Some(ref dh) = dh3 {
        dh_outputs.push(dh);
    }
    if let Some(ref dh) = dh4 {
        dh_outputs.push(dh);
    }

    let (root_key, sending_chain_key) = kdf::hybrid_extract(&dh_outputs, &kem_ss)?;

    let local_long_term_public = key_exchange::public_key(&local.long_term_private)?;
    let local_one_time_public = match local.one_time {
        Some((_, ref priv_key)) => Some(key_exchange::public_key(priv_key)?),
        None => None,
    };

    Ok(RatchetState {
        root_key,
        sending_chain_key: Some(sending_chain_key),
        receiving_chain_key: None,
        sending_message_number: 0,
        receiving_message_number: 0,
        previous_sending_message_count: 0,
        skipped_message_keys: Vec::new(),
        local_long_term_private: local.long_term_private,
        local_long_term_public,
        local_one_time_private: local.one_time.map(|(_, k)| k),
        local_one_time_public,
        local_kem_private: local.kem_private,
        local_kem_public: local.kem_public,
        local_one_time_key_id: local.one_time.map(|(id, _)| id),
        local_kem_key_id: Some(local.kem_key_id),
        remote_long_term_public: remote.long_term_public,
        remote_one_time_public: remote.one_time.map(|(_, pk)| pk),
        remote_kem_public: remote.kem_public,
        established_kem_key_id: remote.kem_key_id,
        established_one_time_key_id: remote.one_time.map(|(id, _)| id),
        sending_kem_ciphertext: Some(kem_ciphertext),
        receiving_chain_tag: None,
        initial_sending_chain: true,
    })
}

/// Initialize a session epoch as the recipient of a first inbound message
///
/// Mirrors [`sender_init`]: the one-time and KEM private keys are the ones
/// the header's `one_time_key_id` / `kem_key_id` resolved to.
pub fn recipient_init(local: RecipientKeys, header: &RatchetHeader) -> Result<RatchetState> {
    let dh1 =
        key_exchange::diffie_hellman(&local.long_term_private, &header.long_term_public)?;
    let dh2 = match local.one_time {
        Some((_, ref ot_priv)) => Some(key_exchange::diffie_hellman(
            ot_priv,
            &header.long_term_public,
        )?),
        None => None,
    };
    let dh3 = match header.one_time_public {
        Some(ref ot_pub) => {
            Some(key_exchange::diffie_hellman(&local.long_term_private, ot_pub)?)
        }
        None => None,
    };
    let dh4 = match (local.one_time.as_ref(), header.one_time_public.as_ref()) {
        (Some((_, ot_priv)), Some(ot_pub)) => {
            Some(key_exchange::diffie_hellman(ot_priv, ot_pub)?)
        }
        _ => None,
    };

    let kem_ss = pqc::decapsulate(&local.kem_private, &header.kem_ciphertext)?;

    let mut dh_outputs: Vec<&[u8; 32]> = vec![&dh1];
    if let Some(ref dh) = dh2 {
        dh_outputs.push(dh);
    }
    if let Some(ref dh) = dh3 {
        dh_outputs.push(dh);
    }
    if let Some(ref dh) = dh4 {
        dh_outputs.push(dh);
    }

    let (root_key, receiving_chain_key) = kdf::hybrid_extract(&dh_outputs, &kem_ss)?;

    let local_long_term_public = key_exchange::public_key(&local.long_term_private)?;

    Ok(RatchetState {
        root_key,
        sending_chain_key: None,
        receiving_chain_key: Some(receiving_chain_key),
        sending_message_number: 0,
        receiving_message_number: 0,
        previous_sending_message_count: 0,
        skipped_message_keys: Vec::new(),
        local_long_term_private: local.long_term_private,
        local_long_term_public,
        local_one_time_private: local.one_time.map(|(_, k)| k),
        local_one_time_public: None,
        local_kem_private: local.kem_private,
        local_kem_public: local.kem_public,
        local_one_time_key_id: local.one_time.map(|(id, _)| id),
        local_kem_key_id: Some(local.kem_key_id),
        remote_long_term_public: header.long_term_public,
        remote_one_time_public: header.one_time_public,
        remote_kem_public: header.kem_public.clone(),
        established_kem_key_id: header.kem_key_id,
        established_one_time_key_id: header.one_time_key_id,
        sending_kem_ciphertext: None,
        receiving_chain_tag: Some(chain_tag(&header.long_term_public, &header.kem_ciphertext)),
        initial_sending_chain: false,
    })
}

impl RatchetState {
    /// Encrypt a message and advance the sending chain
    ///
    /// Creates a fresh sending chain first if the previous one was retired
    /// by a ratchet step (or this side has not sent since initialization as
    /// recipient).
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(RatchetHeader, Vec<u8>)> {
        if self.sending_chain_key.is_none() {
            self.start_sending_chain()?;
        }

        let chain_key = self.sending_chain_key.ok_or(RatchetError::NotInitialized)?;
        let (next_chain_key, message_key) = kdf::kdf_chain(&chain_key);

        let header = RatchetHeader {
            long_term_public: self.local_long_term_public,
            one_time_public: if self.initial_sending_chain {
                self.local_one_time_public
            } else {
                None
            },
            kem_public: self.local_kem_public.clone(),
            one_time_key_id: if self.initial_sending_chain {
                self.established_one_time_key_id
            } else {
                None
            },
            kem_key_id: self.established_kem_key_id,
            message_number: self.sending_message_number,
            previous_message_count: self.previous_sending_message_count,
            kem_ciphertext: self
                .sending_kem_ciphertext
                .clone()
                .ok_or(RatchetError::NotInitialized)?,
        };

        let aad = header.encode()?;
        let nonce = aead::derive_nonce(self.sending_message_number);
        let ciphertext = aead::seal_with_nonce(&message_key, &nonce, &aad, plaintext)
            .map_err(|_| RatchetError::EncryptionFailed)?;

        self.sending_chain_key = Some(next_chain_key);
        self.sending_message_number += 1;

        Ok((header, ciphertext))
    }

    /// Decrypt a received message, performing a ratchet step when the header
    /// announces a new chain
    ///
    /// State mutations commit only on success; a forged or replayed message
    /// leaves the ratchet untouched.
    pub fn decrypt(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
        max_skip: usize,
    ) -> Result<Vec<u8>> {
        let mut working = self.clone();
        let plaintext = working.decrypt_inner(header, ciphertext, max_skip)?;
        *self = working;
        Ok(plaintext)
    }

    fn decrypt_inner(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
        max_skip: usize,
    ) -> Result<Vec<u8>> {
        let tag = chain_tag(&header.long_term_public, &header.kem_ciphertext);
        let aad = header.encode()?;
        let nonce = aead::derive_nonce(header.message_number);

        // Out-of-order message from a chain we already advanced past
        use subtle::ConstantTimeEq;
        if let Some(idx) = self.skipped_message_keys.iter().position(|sk| {
            bool::from(sk.chain_tag.ct_eq(&tag)) && sk.message_number == header.message_number
        }) {
            let skipped = self.skipped_message_keys.remove(idx);
            return aead::open_with_nonce(&skipped.message_key, &nonce, &aad, ciphertext)
                .map_err(|_| RatchetError::AuthenticationFailure);
        }

        if self.receiving_chain_tag != Some(tag) {
            self.ratchet_step(header, tag, max_skip)?;
        }

        // A number below the counter that is not in the skipped cache is a
        // replay (or a key long since evicted); never derive a key for it.
        if header.message_number < self.receiving_message_number {
            return Err(RatchetError::AuthenticationFailure);
        }

        self.skip_to(header.message_number, tag, max_skip)?;

        let chain_key = self
            .receiving_chain_key
            .ok_or(RatchetError::NotInitialized)?;
        let (next_chain_key, message_key) = kdf::kdf_chain(&chain_key);

        let plaintext = aead::open_with_nonce(&message_key, &nonce, &aad, ciphertext)
            .map_err(|_| RatchetError::AuthenticationFailure)?;

        self.receiving_chain_key = Some(next_chain_key);
        self.receiving_message_number += 1;

        Ok(plaintext)
    }

    /// Advance the root chain for a new inbound chain epoch
    fn ratchet_step(
        &mut self,
        header: &RatchetHeader,
        tag: [u8; 32],
        max_skip: usize,
    ) -> Result<()> {
        // Stash the tail of the outgoing receiving chain before retiring it
        if self.receiving_chain_key.is_some() {
            if let Some(old_tag) = self.receiving_chain_tag {
                self.skip_to(header.previous_message_count, old_tag, max_skip)?;
            }
        }

        let kem_ss = pqc::decapsulate(&self.local_kem_private, &header.kem_ciphertext)?;
        let dh = key_exchange::diffie_hellman(
            &self.local_long_term_private,
            &header.long_term_public,
        )?;

        let mut input = [0u8; 64];
        input[..32].copy_from_slice(&dh);
        input[32..].copy_from_slice(&kem_ss);
        let (new_root, receiving_chain_key) = kdf::kdf_root(&self.root_key, &input);
        input.zeroize();

        self.root_key = new_root;
        self.receiving_chain_key = Some(receiving_chain_key);
        self.receiving_message_number = 0;
        self.receiving_chain_tag = Some(tag);
        self.remote_long_term_public = header.long_term_public;
        self.remote_kem_public = header.kem_public.clone();
        if header.one_time_public.is_some() {
            self.remote_one_time_public = header.one_time_public;
        }

        // The reply direction builds a fresh chain with fresh KEM entropy
        self.sending_chain_key = None;

        Ok(())
    }

    /// Create a new sending chain: fresh KEM encapsulation to the peer's
    /// current key mixed with a long-term DH output, and a fresh local KEM
    /// ratchet keypair advertised in the headers
    fn start_sending_chain(&mut self) -> Result<()> {
        let (kem_ciphertext, kem_ss) = pqc::encapsulate(&self.remote_kem_public)?;
        let dh = key_exchange::diffie_hellman(
            &self.local_long_term_private,
            &self.remote_long_term_public,
        )?;

        let mut input = [0u8; 64];
        input[..32].copy_from_slice(&dh);
        input[32..].copy_from_slice(&kem_ss);
        let (new_root, sending_chain_key) = kdf::kdf_root(&self.root_key, &input);
        input.zeroize();

        let fresh_kem = pqc::generate_keypair();

        self.root_key = new_root;
        self.sending_chain_key = Some(sending_chain_key);
        self.previous_sending_message_count = self.sending_message_number;
        self.sending_message_number = 0;
        self.sending_kem_ciphertext = Some(kem_ciphertext);
        self.local_kem_private = fresh_kem.secret.clone();
        self.local_kem_public = fresh_kem.public.clone();
        // The fresh ratchet keypair has no published pool id
        self.local_kem_key_id = None;
        self.initial_sending_chain = false;

        Ok(())
    }

    /// Advance the receiving chain to `until`, stashing skipped message keys
    fn skip_to(&mut self, until: u64, tag: [u8; 32], max_skip: usize) -> Result<()> {
        let Some(mut chain_key) = self.receiving_chain_key else {
            return Ok(());
        };

        let to_skip = until.saturating_sub(self.receiving_message_number);
        if to_skip as usize > max_skip {
            return Err(RatchetError::SkippedOverflow);
        }

        for _ in 0..to_skip {
            let (next_chain_key, message_key) = kdf::kdf_chain(&chain_key);
            self.skipped_message_keys.push(SkippedMessageKey {
                chain_tag: tag,
                message_number: self.receiving_message_number,
                message_key,
            });
            chain_key = next_chain_key;
            self.receiving_message_number += 1;
        }

        self.receiving_chain_key = Some(chain_key);

        // Oldest entries give way under pressure, old chain generations included
        while self.skipped_message_keys.len() > max_skip {
            self.skipped_message_keys.remove(0);
        }

        Ok(())
    }
}
