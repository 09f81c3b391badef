//! X3DH Engine (§4.4): the four-way Diffie-Hellman combination that derives
//! a session's initial 32-byte shared secret, run once per session as
//! either the initiator or the responder.

use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;
use crate::identity::Identity;
use crate::primitives;

/// Fixed ASCII label both sides MUST use identically, per §4.4 step 5.
pub const X3DH_INFO_LABEL: &[u8] = b"E2EE-X3DH-v1";
const X3DH_SALT: [u8; 32] = [0u8; 32];
const SHARED_SECRET_LEN: usize = 32;

/// Everything the responder needs to mirror the initiator's DH set, looked
/// up by the `usedSignedPrekeyId`/`usedOneTimePrekeyId` in the incoming
/// `x3dh` block.
pub struct RemoteBundle {
    pub identity_key: [u8; 32],
    pub signing_key: [u8; 32],
    pub signed_prekey_id: u32,
    pub signed_prekey_public: [u8; 32],
    pub signed_prekey_signature: [u8; 64],
    pub one_time_prekey_id: Option<u32>,
    pub one_time_prekey_public: Option<[u8; 32]>,
}

/// Output of running X3DH as initiator (§4.4).
pub struct InitiatorOutput {
    pub shared_secret: [u8; 32],
    pub local_identity_pub: [u8; 32],
    pub local_ephemeral_pub: [u8; 32],
    pub local_ephemeral_secret: StaticSecret,
    pub used_spk_id: u32,
    pub used_opk_id: Option<u32>,
}

fn verify_signed_prekey(
    signing_key: &[u8; 32],
    spk_public: &[u8; 32],
    signature: &[u8; 64],
) -> Result<(), CryptoError> {
    if !primitives::ed25519_verify(signing_key, spk_public, signature) {
        return Err(CryptoError::InvalidSignedPrekey);
    }
    Ok(())
}

/// Run X3DH as the initiator against a fetched remote bundle (§4.4).
pub fn run_initiator(
    local_identity: &Identity,
    remote: &RemoteBundle,
) -> Result<InitiatorOutput, CryptoError> {
    verify_signed_prekey(
        &remote.signing_key,
        &remote.signed_prekey_public,
        &remote.signed_prekey_signature,
    )?;

    let ik_remote = primitives::validate_public_key(&remote.identity_key)?;
    let spk_remote = primitives::validate_public_key(&remote.signed_prekey_public)?;
    let opk_remote = remote
        .one_time_prekey_public
        .map(|bytes| primitives::validate_public_key(&bytes))
        .transpose()?;

    let ik_remote_pub = PublicKey::from(ik_remote);
    let spk_remote_pub = PublicKey::from(spk_remote);

    let ik_local_secret = local_identity.x25519_secret();
    let ephemeral_bytes = primitives::random(32);
    let mut ephemeral_seed = [0u8; 32];
    ephemeral_seed.copy_from_slice(&ephemeral_bytes);
    let ephemeral_secret = StaticSecret::from(ephemeral_seed);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);

    let dh1 = primitives::x25519_dh(&ik_local_secret, &spk_remote_pub);
    let dh2 = primitives::x25519_dh(&ephemeral_secret, &ik_remote_pub);
    let dh3 = primitives::x25519_dh(&ephemeral_secret, &spk_remote_pub);
    let dh4 = opk_remote.map(|opk| primitives::x25519_dh(&ephemeral_secret, &PublicKey::from(opk)));

    let ikm = concat_dh(dh1, dh2, dh3, dh4);
    let okm = primitives::hkdf_sha256(&ikm, &X3DH_SALT, X3DH_INFO_LABEL, SHARED_SECRET_LEN);
    let mut shared_secret = [0u8; 32];
    shared_secret.copy_from_slice(&okm);

    Ok(InitiatorOutput {
        shared_secret,
        local_identity_pub: local_identity.x25519_public().to_bytes(),
        local_ephemeral_pub: ephemeral_public.to_bytes(),
        local_ephemeral_secret: ephemeral_secret,
        used_spk_id: remote.signed_prekey_id,
        used_opk_id: remote.one_time_prekey_id.filter(|_| opk_remote.is_some()),
    })
}

/// Run X3DH as the responder. `local_spk_secret`/`local_opk_secret` are the
/// caller's own secret halves looked up by the ids carried in the incoming
/// `x3dh` block; the caller is responsible for translating "not found" into
/// `UnknownSignedPrekey`/`UnknownOneTimePrekey` before calling this (the
/// Session Manager owns that lookup against the Encrypted Local Store).
pub fn run_responder(
    local_identity: &Identity,
    local_spk_secret: &StaticSecret,
    local_opk_secret: Option<&StaticSecret>,
    remote_identity_pub: &[u8; 32],
    remote_ephemeral_pub: &[u8; 32],
) -> Result<[u8; 32], CryptoError> {
    let ik_remote = primitives::validate_public_key(remote_identity_pub)?;
    let ek_remote = primitives::validate_public_key(remote_ephemeral_pub)?;
    let ik_remote_pub = PublicKey::from(ik_remote);
    let ek_remote_pub = PublicKey::from(ek_remote);

    let ik_local_secret = local_identity.x25519_secret();

    // Mirror of the initiator's DH set with roles swapped:
    // DH1 = DH(SPK_local, IK_remote), DH2 = DH(IK_local, EK_remote),
    // DH3 = DH(SPK_local, EK_remote), DH4 = DH(OPK_local, EK_remote).
    let dh1 = primitives::x25519_dh(local_spk_secret, &ik_remote_pub);
    let dh2 = primitives::x25519_dh(&ik_local_secret, &ek_remote_pub);
    let dh3 = primitives::x25519_dh(local_spk_secret, &ek_remote_pub);
    let dh4 = local_opk_secret.map(|opk| primitives::x25519_dh(opk, &ek_remote_pub));

    let ikm = concat_dh(dh1, dh2, dh3, dh4);
    let okm = primitives::hkdf_sha256(&ikm, &X3DH_SALT, X3DH_INFO_LABEL, SHARED_SECRET_LEN);
    let mut shared_secret = [0u8; 32];
    shared_secret.copy_from_slice(&okm);
    Ok(shared_secret)
}

fn concat_dh(dh1: [u8; 32], dh2: [u8; 32], dh3: [u8; 32], dh4: Option<[u8; 32]>) -> Vec<u8> {
    let mut ikm = Vec::with_capacity(32 * 4);
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(&dh4);
    }
    ikm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_from(
        bob: &Identity,
        spk_secret: &StaticSecret,
        spk_id: u32,
        opk_secret: Option<(&StaticSecret, u32)>,
    ) -> RemoteBundle {
        let spk_public = PublicKey::from(spk_secret).to_bytes();
        let signature = bob.sign(&spk_public).to_bytes();
        RemoteBundle {
            identity_key: bob.x25519_public().to_bytes(),
            signing_key: bob.verifying_key_bytes(),
            signed_prekey_id: spk_id,
            signed_prekey_public: spk_public,
            signed_prekey_signature: signature,
            one_time_prekey_id: opk_secret.map(|(_, id)| id),
            one_time_prekey_public: opk_secret.map(|(s, _)| PublicKey::from(s).to_bytes()),
        }
    }

    #[test]
    fn initiator_and_responder_derive_identical_shared_secret_with_one_time_prekey() {
        let alice = Identity::from_seed([1u8; 32]);
        let bob = Identity::from_seed([2u8; 32]);
        let spk_secret = StaticSecret::from([3u8; 32]);
        let opk_secret = StaticSecret::from([4u8; 32]);

        let bundle = bundle_from(&bob, &spk_secret, 1, Some((&opk_secret, 42)));
        let out = run_initiator(&alice, &bundle).unwrap();

        let responder_secret = run_responder(
            &bob,
            &spk_secret,
            Some(&opk_secret),
            &alice.x25519_public().to_bytes(),
            &out.local_ephemeral_pub,
        )
        .unwrap();

        assert_eq!(out.shared_secret, responder_secret);
        assert_eq!(out.used_opk_id, Some(42));
    }

    #[test]
    fn works_without_one_time_prekey() {
        let alice = Identity::from_seed([5u8; 32]);
        let bob = Identity::from_seed([6u8; 32]);
        let spk_secret = StaticSecret::from([7u8; 32]);

        let bundle = bundle_from(&bob, &spk_secret, 9, None);
        let out = run_initiator(&alice, &bundle).unwrap();
        assert!(out.used_opk_id.is_none());

        let responder_secret = run_responder(
            &bob,
            &spk_secret,
            None,
            &alice.x25519_public().to_bytes(),
            &out.local_ephemeral_pub,
        )
        .unwrap();
        assert_eq!(out.shared_secret, responder_secret);
    }

    #[test]
    fn forged_signature_is_rejected() {
        let alice = Identity::from_seed([8u8; 32]);
        let bob = Identity::from_seed([9u8; 32]);
        let mallory = Identity::from_seed([10u8; 32]);
        let spk_secret = StaticSecret::from([11u8; 32]);

        let mut bundle = bundle_from(&bob, &spk_secret, 1, None);
        // Sign the prekey with the wrong identity.
        bundle.signed_prekey_signature = mallory.sign(&bundle.signed_prekey_public).to_bytes();

        assert!(matches!(
            run_initiator(&alice, &bundle),
            Err(CryptoError::InvalidSignedPrekey)
        ));
    }

    #[test]
    fn invalid_public_key_is_rejected() {
        let alice = Identity::from_seed([12u8; 32]);
        let bob = Identity::from_seed([13u8; 32]);
        let spk_secret = StaticSecret::from([14u8; 32]);

        let mut bundle = bundle_from(&bob, &spk_secret, 1, None);
        bundle.identity_key = [0u8; 32];

        assert!(matches!(
            run_initiator(&alice, &bundle),
            Err(CryptoError::InvalidPublicKey)
        ));
    }
}
