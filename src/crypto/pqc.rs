/// Post-Quantum Key Encapsulation — ML-KEM-1024 (NIST FIPS 203)
///
/// Raw-byte seams for the ratchet and the key store: encapsulation keys,
/// decapsulation keys, and ciphertexts travel as `Vec<u8>` / slices and are
/// reconstructed at the call site.
///
/// Key sizes (ML-KEM-1024):
/// - Encapsulation key (public):  1568 bytes
/// - Decapsulation key (secret):  3168 bytes
/// - Ciphertext:                  1568 bytes
/// - Shared secret:               32 bytes
use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{Encoded, EncodedSizeUser, KemCore, MlKem1024, MlKem1024Params};
use rand::rngs::OsRng;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use zeroize::Zeroize;

/// ML-KEM-1024 encapsulation key (public) size in bytes
pub const MLKEM1024_EK_BYTES: usize = 1568;
/// ML-KEM-1024 ciphertext size in bytes
pub const MLKEM1024_CT_BYTES: usize = 1568;
/// ML-KEM-1024 decapsulation key (secret) size in bytes
pub const MLKEM1024_DK_BYTES: usize = 3168;

#[derive(Error, Debug)]
pub enum PqcError {
    #[error("ML-KEM encapsulation failed")]
    EncapsulateFailed,
    #[error("ML-KEM decapsulation failed")]
    DecapsulateFailed,
    #[error("Invalid key length")]
    InvalidKeyLength,
}

pub type Result<T> = std::result::Result<T, PqcError>;

/// ML-KEM-1024 keypair with raw-byte key material
#[derive(Clone)]
pub struct KemKeypair {
    /// Encapsulation key / public key (1568 bytes)
    pub public: Vec<u8>,
    /// Decapsulation key / secret key (3168 bytes)
    pub secret: Vec<u8>,
}

impl Drop for KemKeypair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Generate an ML-KEM-1024 keypair with random keys
pub fn generate_keypair() -> KemKeypair {
    let (dk, ek) = MlKem1024::generate(&mut OsRng);

    KemKeypair {
        public: ek.as_bytes().to_vec(),
        secret: dk.as_bytes().to_vec(),
    }
}

/// Generate an ML-KEM-1024 keypair from a 32-byte seed (deterministic)
pub fn generate_keypair_from_seed(seed: &[u8; 32]) -> KemKeypair {
    let mut rng = ChaCha20Rng::from_seed(*seed);
    let (dk, ek) = MlKem1024::generate(&mut rng);

    KemKeypair {
        public: ek.as_bytes().to_vec(),
        secret: dk.as_bytes().to_vec(),
    }
}

/// Encapsulate to a recipient's encapsulation key
///
/// # Returns
/// (ciphertext, shared_secret) — ciphertext goes into the message header,
/// the 32-byte shared secret feeds the root KDF.
pub fn encapsulate(recipient_public: &[u8]) -> Result<(Vec<u8>, [u8; 32])> {
    if recipient_public.len() != MLKEM1024_EK_BYTES {
        return Err(PqcError::InvalidKeyLength);
    }

    let ek_encoded =
        Encoded::<ml_kem::kem::EncapsulationKey<MlKem1024Params>>::try_from(recipient_public)
            .map_err(|_| PqcError::InvalidKeyLength)?;
    let ek = ml_kem::kem::EncapsulationKey::<MlKem1024Params>::from_bytes(&ek_encoded);

    let (ct, ss) = ek
        .encapsulate(&mut OsRng)
        .map_err(|_| PqcError::EncapsulateFailed)?;

    let ct_bytes: Vec<u8> = ct.iter().copied().collect();
    let mut shared = [0u8; 32];
    shared.copy_from_slice(ss.as_ref());

    Ok((ct_bytes, shared))
}

/// Decapsulate a ciphertext with our decapsulation key
pub fn decapsulate(our_secret: &[u8], ciphertext: &[u8]) -> Result<[u8; 32]> {
    if our_secret.len() != MLKEM1024_DK_BYTES {
        return Err(PqcError::InvalidKeyLength);
    }
    if ciphertext.len() != MLKEM1024_CT_BYTES {
        return Err(PqcError::InvalidKeyLength);
    }

    let dk_encoded =
        Encoded::<ml_kem::kem::DecapsulationKey<MlKem1024Params>>::try_from(our_secret)
            .map_err(|_| PqcError::InvalidKeyLength)?;
    let dk = ml_kem::kem::DecapsulationKey::<MlKem1024Params>::from_bytes(&dk_encoded);

    let ct: ml_kem::Ciphertext<MlKem1024> = ml_kem::Ciphertext::<MlKem1024>::try_from(ciphertext)
        .map_err(|_| PqcError::InvalidKeyLength)?;

    let ss = dk
        .decapsulate(&ct)
        .map_err(|_| PqcError::DecapsulateFailed)?;

    let mut shared = [0u8; 32];
    shared.copy_from_slice(ss.as_ref());

    Ok(shared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_sizes() {
        let kp = generate_keypair();
        assert_eq!(kp.public.len(), MLKEM1024_EK_BYTES);
        assert_eq!(kp.secret.len(), MLKEM1024_DK_BYTES);
    }

    #[test]
    fn test_keypair_from_seed_deterministic() {
        let kp1 = generate_keypair_from_seed(&[7u8; 32]);
        let kp2 = generate_keypair_from_seed(&[7u8; 32]);
        assert_eq!(kp1.public, kp2.public);
        assert_eq!(kp1.secret, kp2.secret);

        let kp3 = generate_keypair_from_seed(&[8u8; 32]);
        assert_ne!(kp1.public, kp3.public);
    }

    #[test]
    fn test_encapsulate_decapsulate_roundtrip() {
        let kp = generate_keypair();

        let (ct, ss1) = encapsulate(&kp.public).unwrap();
        assert_eq!(ct.len(), MLKEM1024_CT_BYTES);

        let ss2 = decapsulate(&kp.secret, &ct).unwrap();
        assert_eq!(ss1, ss2);
    }

    #[test]
    fn test_wrong_secret_yields_different_secret() {
        let kp1 = generate_keypair();
        let kp2 = generate_keypair();

        let (ct, ss1) = encapsulate(&kp1.public).unwrap();
        let ss2 = decapsulate(&kp2.secret, &ct).unwrap();

        // Implicit rejection: decapsulation succeeds but yields garbage
        assert_ne!(ss1, ss2);
    }

    #[test]
    fn test_invalid_lengths_rejected() {
        assert!(encapsulate(&[0u8; 100]).is_err());
        assert!(decapsulate(&[0u8; 100], &[0u8; MLKEM1024_CT_BYTES]).is_err());
        assert!(decapsulate(&[0u8; MLKEM1024_DK_BYTES], &[0u8; 100]).is_err());
    }
}
