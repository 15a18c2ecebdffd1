use rand::rngs::OsRng;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Error, Debug)]
pub enum KeyExchangeError {
    #[error("Invalid key length")]
    InvalidKeyLength,
}

pub type Result<T> = std::result::Result<T, KeyExchangeError>;

/// Generate a static X25519 keypair
///
/// # Returns
/// (public_key, private_key) - Both as 32-byte arrays
pub fn generate_keypair() -> ([u8; 32], [u8; 32]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    (public.to_bytes(), secret.to_bytes())
}

/// Derive a shared secret using X25519
///
/// # Arguments
/// * `our_private_key` - Our 32-byte X25519 private key
/// * `their_public_key` - Their 32-byte X25519 public key
///
/// # Returns
/// 32-byte shared secret
pub fn diffie_hellman(our_private_key: &[u8], their_public_key: &[u8]) -> Result<[u8; 32]> {
    if our_private_key.len() != 32 || their_public_key.len() != 32 {
        return Err(KeyExchangeError::InvalidKeyLength);
    }

    let mut secret_bytes = [0u8; 32];
    secret_bytes.copy_from_slice(our_private_key);
    let secret = StaticSecret::from(secret_bytes);

    let mut public_bytes = [0u8; 32];
    public_bytes.copy_from_slice(their_public_key);
    let public = PublicKey::from(public_bytes);

    Ok(secret.diffie_hellman(&public).to_bytes())
}

/// Derive the public key from a private key
pub fn public_key(private_key: &[u8]) -> Result<[u8; 32]> {
    if private_key.len() != 32 {
        return Err(KeyExchangeError::InvalidKeyLength);
    }

    let mut secret_bytes = [0u8; 32];
    secret_bytes.copy_from_slice(private_key);
    let secret = StaticSecret::from(secret_bytes);

    Ok(PublicKey::from(&secret).to_bytes())
}
