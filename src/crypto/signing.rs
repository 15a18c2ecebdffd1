use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Invalid signature")]
    InvalidSignature,
}

pub type Result<T> = std::result::Result<T, SigningError>;

/// Generate an Ed25519 signing keypair
///
/// # Returns
/// (public_key, private_key) - Both as 32-byte arrays
pub fn generate_keypair() -> ([u8; 32], [u8; 32]) {
    let signing_key = SigningKey::generate(&mut OsRng);

    (
        signing_key.verifying_key().to_bytes(),
        signing_key.to_bytes(),
    )
}

/// Produce a detached Ed25519 signature over `data`
pub fn sign(data: &[u8], private_key: &[u8]) -> Result<[u8; 64]> {
    if private_key.len() != 32 {
        return Err(SigningError::InvalidKeyLength);
    }

    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(private_key);
    let signing_key = SigningKey::from_bytes(&key_bytes);

    Ok(signing_key.sign(data).to_bytes())
}

/// Verify a detached Ed25519 signature
///
/// Returns `Ok(false)` for a well-formed but non-matching signature;
/// malformed keys or signatures are errors.
pub fn verify(data: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool> {
    if public_key.len() != 32 {
        return Err(SigningError::InvalidKeyLength);
    }
    if signature.len() != 64 {
        return Err(SigningError::InvalidSignature);
    }

    let mut pub_bytes = [0u8; 32];
    pub_bytes.copy_from_slice(public_key);
    let verifying_key =
        VerifyingKey::from_bytes(&pub_bytes).map_err(|_| SigningError::InvalidKeyLength)?;

    let mut sig_bytes = [0u8; 64];
    sig_bytes.copy_from_slice(signature);
    let sig = Signature::from_bytes(&sig_bytes);

    Ok(verifying_key.verify(data, &sig).is_ok())
}

/// Derive the verifying key from a signing private key
pub fn public_key(private_key: &[u8]) -> Result<[u8; 32]> {
    if private_key.len() != 32 {
        return Err(SigningError::InvalidKeyLength);
    }

    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(private_key);
    let signing_key = SigningKey::from_bytes(&key_bytes);

    Ok(signing_key.verifying_key().to_bytes())
}
