use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// XChaCha20-Poly1305 nonce size
pub const NONCE_BYTES: usize = 24;
/// Poly1305 authentication tag size
pub const TAG_BYTES: usize = 16;

#[derive(Error, Debug)]
pub enum AeadError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key length")]
    InvalidKeyLength,
}

pub type Result<T> = std::result::Result<T, AeadError>;

/// Seal `plaintext` under `key` with a random nonce (at-rest envelope form)
///
/// # Returns
/// `nonce || ciphertext` — 24-byte nonce prepended to the sealed payload
pub fn seal(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if key.len() != 32 {
        return Err(AeadError::InvalidKeyLength);
    }

    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| AeadError::InvalidKeyLength)?;

    let mut nonce_bytes = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| AeadError::EncryptionFailed)?;

    let mut result = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Open a `nonce || ciphertext` payload sealed with [`seal`]
pub fn open(sealed: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if key.len() != 32 {
        return Err(AeadError::InvalidKeyLength);
    }
    if sealed.len() < NONCE_BYTES + TAG_BYTES {
        return Err(AeadError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_BYTES);
    let nonce = XNonce::from_slice(nonce_bytes);

    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| AeadError::InvalidKeyLength)?;

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| AeadError::DecryptionFailed)
}

/// Seal with an explicit nonce and associated data (ratchet message form)
pub fn seal_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; NONCE_BYTES],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| AeadError::InvalidKeyLength)?;

    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| AeadError::EncryptionFailed)
}

/// Open a payload sealed with [`seal_with_nonce`]
pub fn open_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; NONCE_BYTES],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_BYTES {
        return Err(AeadError::DecryptionFailed);
    }

    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| AeadError::InvalidKeyLength)?;

    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AeadError::DecryptionFailed)
}

/// Derive a deterministic nonce from a message counter
///
/// Message keys are single-use, so a counter nonce cannot repeat under a key.
pub fn derive_nonce(counter: u64) -> [u8; NONCE_BYTES] {
    let mut nonce = [0u8; NONCE_BYTES];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Generate a random 32-byte symmetric key
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}
