//! Long-lived identity material: a 32-byte seed deterministically expands
//! into both an Ed25519 signing pair and an X25519 DH pair.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::primitives;

/// A user's long-lived identity, derived from a single 32-byte seed.
///
/// Both the Ed25519 signing pair and the X25519 DH pair are reduced from the
/// same seed. The two primitives operate on algebraically independent
/// structures, so this reuse does not weaken either one (§4.2).
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    seed: [u8; 32],
}

impl Identity {
    pub fn generate() -> Self {
        let bytes = primitives::random(32);
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes);
        Self { seed }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { seed }
    }

    pub fn seed_bytes(&self) -> &[u8; 32] {
        &self.seed
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.seed)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey::from(&self.signing_key())
    }

    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.verifying_key().to_bytes()
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key().sign(msg)
    }

    pub fn verify(pk: &[u8; 32], msg: &[u8], sig: &Signature) -> bool {
        let Ok(verifying) = VerifyingKey::from_bytes(pk) else {
            return false;
        };
        verifying.verify(msg, sig).is_ok()
    }

    /// Derive the X25519 static secret by clamping the seed directly, the
    /// same expansion used throughout for deterministic key derivation.
    pub fn x25519_secret(&self) -> StaticSecret {
        StaticSecret::from(self.seed)
    }

    pub fn x25519_public(&self) -> PublicKey {
        PublicKey::from(&self.x25519_secret())
    }

    /// Full-width, uppercase-hex SHA-256 of the X25519 public half.
    /// Truncation is forbidden by the data model's global invariant (2).
    pub fn fingerprint(&self) -> String {
        let digest = primitives::sha256(self.x25519_public().as_bytes());
        hex::encode_upper(digest)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Validate and parse a 32-byte X25519/Ed25519 public key from wire bytes.
pub fn parse_public_key(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    primitives::validate_public_key(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_full_width_hex() {
        let id = Identity::from_seed([5u8; 32]);
        let fp = id.fingerprint();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn fingerprint_is_deterministic_across_instances() {
        let a = Identity::from_seed([11u8; 32]);
        let b = Identity::from_seed([11u8; 32]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn different_seeds_yield_different_fingerprints() {
        let a = Identity::from_seed([1u8; 32]);
        let b = Identity::from_seed([2u8; 32]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let id = Identity::generate();
        let sig = id.sign(b"hello world");
        assert!(Identity::verify(&id.verifying_key_bytes(), b"hello world", &sig));
        assert!(!Identity::verify(&id.verifying_key_bytes(), b"tampered", &sig));
    }

    #[test]
    fn x25519_and_ed25519_pairs_are_both_derived_from_one_seed() {
        let id = Identity::from_seed([42u8; 32]);
        let id2 = Identity::from_seed([42u8; 32]);
        assert_eq!(id.x25519_public().as_bytes(), id2.x25519_public().as_bytes());
        assert_eq!(id.verifying_key_bytes(), id2.verifying_key_bytes());
    }
}
