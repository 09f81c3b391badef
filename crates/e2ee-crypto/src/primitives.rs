//! Deterministic, side-channel-conscious wrappers over the underlying crypto
//! libraries. Every other module goes through here rather than calling
//! `ed25519_dalek`/`x25519_dalek`/`aes_gcm` directly.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Fill `n` bytes from the OS CSPRNG.
pub fn random(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Derive an X25519 keypair from a 32-byte seed by clamping it directly as a
/// scalar, the same convention `Identity::to_x25519_secret` uses for deriving
/// a DH keypair from an Ed25519 seed.
pub fn x25519_keypair_from_seed(seed: &[u8; 32]) -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::from(*seed);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Validate a candidate X25519/Ed25519 public key encoding: exactly 32 bytes
/// and not the identity (all-zero) point. Curve25519's cofactor-8 low-order
/// points are not separately enumerated here — `x25519_dalek` already maps
/// them to a fixed output, so rejecting the all-zero encoding is the
/// practical check implementations are expected to make at the import
/// boundary.
pub fn validate_public_key(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    if bytes.len() != KEY_LEN {
        return Err(CryptoError::InvalidPublicKey);
    }
    if bytes.iter().all(|b| *b == 0) {
        return Err(CryptoError::InvalidPublicKey);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    Ok(out)
}

pub fn x25519_dh(sk: &StaticSecret, pk: &PublicKey) -> [u8; 32] {
    *sk.diffie_hellman(pk).as_bytes()
}

pub fn ed25519_sign_from_seed(seed: &[u8; 32], msg: &[u8]) -> Signature {
    let key = SigningKey::from_bytes(seed);
    key.sign(msg)
}

pub fn ed25519_verify(pk: &[u8; 32], msg: &[u8], sig: &[u8; 64]) -> bool {
    let Ok(verifying) = VerifyingKey::from_bytes(pk) else {
        return false;
    };
    let signature = Signature::from_bytes(sig);
    verifying.verify(msg, &signature).is_ok()
}

/// HKDF-SHA256 extract-and-expand in one call.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], out_len: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = vec![0u8; out_len];
    hk.expand(info, &mut out)
        .expect("requested HKDF output length is within RFC 5869 bounds");
    out
}

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Constant-time byte-slice equality. Lengths are compared first (that
/// comparison is not secret-dependent here since both sides know the
/// expected length out of band); the byte comparison itself never
/// short-circuits.
pub fn const_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Seal `pt` with AES-256-GCM under `key`/`nonce`, authenticating `aad`.
pub fn aead_seal(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    pt: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::StoreIoError(e.to_string()))?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            aes_gcm::aead::Payload { msg: pt, aad },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Open a ciphertext produced by [`aead_seal`]. Any failure — wrong key,
/// tampered ciphertext/tag, or mismatched `aad` — collapses to
/// `DecryptionFailed`, matching §4.1's AEAD failure contract.
pub fn aead_open(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ct: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::StoreIoError(e.to_string()))?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            aes_gcm::aead::Payload { msg: ct, aad },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Deterministic nonce for a ratchet message key: all-zero except for the
/// big-endian message counter in the low 4 bytes. Resolves the open question
/// on AEAD nonce derivation (see DESIGN.md) — every `mk` is one-shot, so a
/// counter-derived nonce never repeats under a given key.
pub fn counter_nonce(counter: u32) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[NONCE_LEN - 4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}
