/// Key derivation functions for the hybrid Double Ratchet
///
/// Three KDFs with distinct domains:
/// 1. **Hybrid extract** — HKDF-SHA256 over the concatenated X25519 outputs
///    and the ML-KEM shared secret, producing the session's initial
///    `(root_key, chain_key)` pair.
/// 2. **Root KDF** — BLAKE3 derive_key over `root_key || input`, advancing
///    the root chain on every ratchet step.
/// 3. **Chain KDF** — HMAC-SHA256 with constant inputs 0x01 / 0x02,
///    advancing a symmetric chain and yielding the per-message key.
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const HYBRID_EXTRACT_DOMAIN: &[u8] = b"AegisProtocol-HybridRatchet-Init-v1";
const ROOT_KDF_RK_DOMAIN: &str = "AegisProtocol-Ratchet-RootKDF-RK-v1";
const ROOT_KDF_CK_DOMAIN: &str = "AegisProtocol-Ratchet-RootKDF-CK-v1";

#[derive(Error, Debug)]
pub enum KdfError {
    #[error("HKDF expansion failed")]
    HkdfExpansionFailed,
}

pub type Result<T> = std::result::Result<T, KdfError>;

/// Hybrid extract: concatenated DH outputs + KEM shared secret → (root, chain)
///
/// The caller supplies the DH outputs in the pinned canonical order; the
/// KEM shared secret is always last. Both peers must feed byte-identical
/// input or the derived roots diverge.
pub fn hybrid_extract(
    dh_outputs: &[&[u8; 32]],
    kem_shared_secret: &[u8; 32],
) -> Result<([u8; 32], [u8; 32])> {
    let mut ikm = Vec::with_capacity(32 * (dh_outputs.len() + 1));
    for dh in dh_outputs {
        ikm.extend_from_slice(&dh[..]);
    }
    ikm.extend_from_slice(kem_shared_secret);

    let hkdf = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = [0u8; 64];
    hkdf.expand(HYBRID_EXTRACT_DOMAIN, &mut okm)
        .map_err(|_| KdfError::HkdfExpansionFailed)?;

    use zeroize::Zeroize;
    ikm.zeroize();

    let mut root_key = [0u8; 32];
    let mut chain_key = [0u8; 32];
    root_key.copy_from_slice(&okm[..32]);
    chain_key.copy_from_slice(&okm[32..]);
    okm.zeroize();

    Ok((root_key, chain_key))
}

/// Root KDF: derive a new root key and chain key from root key + ratchet input
///
/// The input is `DH_output || KEM_shared_secret` on ratchet steps.
pub fn kdf_root(root_key: &[u8; 32], input: &[u8]) -> ([u8; 32], [u8; 32]) {
    let mut material = Vec::with_capacity(32 + input.len());
    material.extend_from_slice(root_key);
    material.extend_from_slice(input);

    let new_root = blake3::derive_key(ROOT_KDF_RK_DOMAIN, &material);
    let chain_key = blake3::derive_key(ROOT_KDF_CK_DOMAIN, &material);

    use zeroize::Zeroize;
    material.zeroize();

    (new_root, chain_key)
}

/// Chain KDF: derive the next chain key and this message's key
pub fn kdf_chain(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut mac_ck =
        <HmacSha256 as Mac>::new_from_slice(chain_key).expect("HMAC key length valid");
    mac_ck.update(&[0x01]); // 0x01 → next chain key
    let next_chain_key: [u8; 32] = mac_ck.finalize().into_bytes().into();

    let mut mac_mk =
        <HmacSha256 as Mac>::new_from_slice(chain_key).expect("HMAC key length valid");
    mac_mk.update(&[0x02]); // 0x02 → message key
    let message_key: [u8; 32] = mac_mk.finalize().into_bytes().into();

    (next_chain_key, message_key)
}
