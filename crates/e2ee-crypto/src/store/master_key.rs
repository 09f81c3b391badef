//! Master-key derivation and per-record sealing for the Encrypted Local
//! Store (§4.3). Grounded on the reference app's Stronghold keystore, which
//! derives its snapshot key via Argon2id with debug/release parameter
//! tiers; the derivation here does the same but with a per-install random
//! salt rather than a fixed string constant, since §4.3 mandates a
//! persisted, per-install salt rather than a hardcoded one.

use argon2::{Algorithm, Argon2, Params, Version};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::primitives::{self, NONCE_LEN};

pub const MASTER_KEY_SALT_LEN: usize = 16;

#[derive(ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; 32],
}

impl MasterKey {
    /// Derive the 32-byte master key from a user passphrase, a per-install
    /// salt, and Argon2id cost parameters. `m_cost` is in KiB, matching
    /// `argon2::Params`'s own unit.
    pub fn derive(
        passphrase: &str,
        salt: &[u8; MASTER_KEY_SALT_LEN],
        m_cost_kib: u32,
        t_cost: u32,
        p_cost: u32,
    ) -> Result<Self, CryptoError> {
        let params = Params::new(m_cost_kib, t_cost, p_cost, Some(32))
            .map_err(|e| CryptoError::StoreIoError(e.to_string()))?;
        let hasher = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut key = [0u8; 32];
        hasher
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| CryptoError::StoreIoError(e.to_string()))?;
        Ok(Self { key })
    }

    pub fn generate_salt() -> [u8; MASTER_KEY_SALT_LEN] {
        let bytes = primitives::random(MASTER_KEY_SALT_LEN);
        let mut salt = [0u8; MASTER_KEY_SALT_LEN];
        salt.copy_from_slice(&bytes);
        salt
    }

    /// Seal `plaintext` under this key with a fresh random nonce, returning
    /// `nonce || ciphertext || tag`. Random (not counter-derived) nonces are
    /// correct here because store records are sealed independently and
    /// irregularly, unlike ratchet message keys which are one-shot per
    /// counter.
    pub fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = primitives::random(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&nonce_bytes);
        let ct = primitives::aead_seal(&self.key, &nonce, aad, plaintext)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn open(&self, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::StoreCorrupted(
                "sealed record shorter than nonce".into(),
            ));
        }
        let (nonce_bytes, ct) = sealed.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        primitives::aead_open(&self.key, &nonce, aad, ct)
            .map_err(|_| CryptoError::StoreCorrupted("master key cannot open sealed record".into()))
    }
}
