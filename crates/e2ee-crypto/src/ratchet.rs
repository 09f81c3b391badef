//! Double Ratchet Engine (§4.5): per-session root/sending/receiving chain
//! keys, DH ratchet steps on direction change, message-key derivation, and
//! skipped-key handling for out-of-order delivery.
//!
//! Resolved open question (see DESIGN.md): the initiator's first ratchet
//! keypair (`DHs`) *is* its X3DH ephemeral pair `EK`, and its initial `DHr`
//! is the responder's signed-prekey public — so the initiator derives a
//! sending chain immediately. The responder's `DHs` is its signed-prekey
//! pair but its `DHr` starts unset; receiving the initiator's first header
//! (carrying `EK` as `header.dh`) drives the responder's first DH ratchet
//! step, which derives its receiving chain and a fresh sending chain in the
//! same step. Both sides' first chain-key derivation run the identical DH
//! (`DH(EK, SPK)`), matching P1's byte-identical shared-secret requirement
//! one level up into the ratchet.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::primitives;
use crate::wire::RatchetHeader;

type HmacSha256 = Hmac<Sha256>;

const KDF_RK_INFO: &[u8] = b"E2EE-Ratchet-RK-v1";
const CK_TAG_CHAIN: [u8; 1] = [0x01];
const CK_TAG_MESSAGE: [u8; 1] = [0x02];

pub struct RatchetState {
    root_key: [u8; 32],
    sending_chain_key: Option<[u8; 32]>,
    receiving_chain_key: Option<[u8; 32]>,
    dhs_secret: StaticSecret,
    dhs_public: [u8; 32],
    dhr: Option<[u8; 32]>,
    ns: u32,
    nr: u32,
    pn: u32,
    skipped: HashMap<([u8; 32], u32), [u8; 32]>,
    max_skip: usize,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        if let Some(ref mut ck) = self.sending_chain_key {
            ck.zeroize();
        }
        if let Some(ref mut ck) = self.receiving_chain_key {
            ck.zeroize();
        }
        // `dhs_secret` is an `x25519_dalek::StaticSecret`, which zeroizes
        // itself on drop (the crate's default-enabled `zeroize` feature).
        for mk in self.skipped.values_mut() {
            mk.zeroize();
        }
        self.skipped.clear();
    }
}

fn kdf_rk(rk: &[u8; 32], dh_out: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let okm = primitives::hkdf_sha256(dh_out, rk, KDF_RK_INFO, 64);
    let mut new_rk = [0u8; 32];
    let mut chain_key = [0u8; 32];
    new_rk.copy_from_slice(&okm[..32]);
    chain_key.copy_from_slice(&okm[32..]);
    (new_rk, chain_key)
}

fn kdf_ck(ck: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut mac_chain =
        HmacSha256::new_from_slice(ck).expect("HMAC accepts any key length");
    mac_chain.update(&CK_TAG_CHAIN);
    let new_ck: [u8; 32] = mac_chain.finalize().into_bytes().into();

    let mut mac_msg = HmacSha256::new_from_slice(ck).expect("HMAC accepts any key length");
    mac_msg.update(&CK_TAG_MESSAGE);
    let mk: [u8; 32] = mac_msg.finalize().into_bytes().into();

    (new_ck, mk)
}

impl RatchetState {
    /// Initialize as the session's initiator: `dhs` is the X3DH ephemeral
    /// keypair, `initial_dhr` is the remote's signed-prekey public (§4.5
    /// initiator init).
    pub fn init_initiator(
        shared_secret: [u8; 32],
        dhs_secret: StaticSecret,
        initial_dhr: [u8; 32],
        max_skip: usize,
    ) -> Self {
        let dhs_public = PublicKey::from(&dhs_secret).to_bytes();
        let dh_out = primitives::x25519_dh(&dhs_secret, &PublicKey::from(initial_dhr));
        let (root_key, sending_chain_key) = kdf_rk(&shared_secret, &dh_out);
        Self {
            root_key,
            sending_chain_key: Some(sending_chain_key),
            receiving_chain_key: None,
            dhs_secret,
            dhs_public,
            dhr: Some(initial_dhr),
            ns: 0,
            nr: 0,
            pn: 0,
            skipped: HashMap::new(),
            max_skip,
        }
    }

    /// Initialize as the session's responder: `dhs` is the local
    /// signed-prekey keypair. `DHr` starts unset: the responder derives both
    /// its receiving chain *and* a fresh sending chain together, the first
    /// time [`Self::decrypt`] runs a DH ratchet step against the initiator's
    /// first header (§4.5 responder init — DHr only becomes known from a
    /// received header, never preset).
    pub fn init_responder(shared_secret: [u8; 32], dhs_secret: StaticSecret, max_skip: usize) -> Self {
        let dhs_public = PublicKey::from(&dhs_secret).to_bytes();
        Self {
            root_key: shared_secret,
            sending_chain_key: None,
            receiving_chain_key: None,
            dhs_secret,
            dhs_public,
            dhr: None,
            ns: 0,
            nr: 0,
            pn: 0,
            skipped: HashMap::new(),
            max_skip,
        }
    }

    pub fn dhs_public(&self) -> [u8; 32] {
        self.dhs_public
    }

    pub fn status_should_be_ready(&self) -> bool {
        self.sending_chain_key.is_some() && self.receiving_chain_key.is_some()
    }

    /// Encrypt one message (§4.5 per-message encrypt). Returns the header
    /// and ciphertext; the caller (Session Manager) attaches the X3DH block
    /// on the session's first outbound message.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(RatchetHeader, Vec<u8>), CryptoError> {
        let cks = self
            .sending_chain_key
            .ok_or(CryptoError::MalformedHeader("no sending chain key".into()))?;
        let (new_cks, mk) = kdf_ck(&cks);
        self.sending_chain_key = Some(new_cks);

        let header = RatchetHeader {
            dh: crate::wire::encode_key(&self.dhs_public),
            pn: self.pn,
            n: self.ns,
        };
        let aad = header_aad(&header);
        let nonce = primitives::counter_nonce(self.ns);
        let ciphertext = primitives::aead_seal(&mk, &nonce, &aad, plaintext)?;
        self.ns += 1;
        Ok((header, ciphertext))
    }

    /// Decrypt one message (§4.5 per-message decrypt).
    pub fn decrypt(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let header_dh_bytes = crate::wire::decode_key(&header.dh)
            .map_err(CryptoError::MalformedHeader)?;
        let header_dh = primitives::validate_public_key(&header_dh_bytes)?;

        if self.dhr != Some(header_dh) {
            self.stash_skipped_for_current_chain(header.pn)?;
            self.dh_ratchet_step(header_dh)?;
        }

        self.stash_skipped_for_current_chain(header.n)?;

        let mk = if let Some(mk) = self.skipped.remove(&(header_dh, header.n)) {
            mk
        } else {
            let ckr = self
                .receiving_chain_key
                .ok_or(CryptoError::MalformedHeader("no receiving chain key".into()))?;
            let (new_ckr, mk) = kdf_ck(&ckr);
            self.receiving_chain_key = Some(new_ckr);
            self.nr += 1;
            mk
        };

        let aad = header_aad(header);
        let nonce = primitives::counter_nonce(header.n);
        primitives::aead_open(&mk, &nonce, &aad, ciphertext)
    }

    fn dh_ratchet_step(&mut self, new_dhr: [u8; 32]) -> Result<(), CryptoError> {
        let dh_out_recv = primitives::x25519_dh(&self.dhs_secret, &PublicKey::from(new_dhr));
        let (rk_after_recv, ckr) = kdf_rk(&self.root_key, &dh_out_recv);

        let new_secret = {
            let bytes = primitives::random(32);
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&bytes);
            StaticSecret::from(seed)
        };
        let new_public = PublicKey::from(&new_secret).to_bytes();
        let dh_out_send = primitives::x25519_dh(&new_secret, &PublicKey::from(new_dhr));
        let (rk_after_send, cks) = kdf_rk(&rk_after_recv, &dh_out_send);

        self.root_key = rk_after_send;
        self.receiving_chain_key = Some(ckr);
        self.sending_chain_key = Some(cks);
        self.dhs_secret = new_secret;
        self.dhs_public = new_public;
        self.dhr = Some(new_dhr);
        self.pn = self.ns;
        self.ns = 0;
        self.nr = 0;
        Ok(())
    }

    /// Derive and stash message keys for the receiving chain up through
    /// `up_to` (exclusive), bounded by `max_skip` (§4.5 step 2–3).
    fn stash_skipped_for_current_chain(&mut self, up_to: u32) -> Result<(), CryptoError> {
        let Some(dhr) = self.dhr else { return Ok(()) };
        let Some(mut ckr) = self.receiving_chain_key else {
            return Ok(());
        };
        while self.nr < up_to {
            if self.skipped.len() >= self.max_skip {
                return Err(CryptoError::SkipOverflow(up_to));
            }
            let (new_ckr, mk) = kdf_ck(&ckr);
            self.skipped.insert((dhr, self.nr), mk);
            ckr = new_ckr;
            self.nr += 1;
        }
        self.receiving_chain_key = Some(ckr);
        Ok(())
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn sent_count(&self) -> u32 {
        self.ns
    }

    pub fn received_count(&self) -> u32 {
        self.nr
    }

    /// Flatten to the plain-data form the Encrypted Local Store seals as one
    /// blob (§4.3's atomicity requirement: a session is persisted whole or
    /// not at all).
    pub fn to_wire(&self) -> RatchetStateWire {
        RatchetStateWire {
            root_key: self.root_key,
            sending_chain_key: self.sending_chain_key,
            receiving_chain_key: self.receiving_chain_key,
            dhs_secret: self.dhs_secret.to_bytes(),
            dhs_public: self.dhs_public,
            dhr: self.dhr,
            ns: self.ns,
            nr: self.nr,
            pn: self.pn,
            skipped: self
                .skipped
                .iter()
                .map(|((dh, n), mk)| (*dh, *n, *mk))
                .collect(),
            max_skip: self.max_skip,
        }
    }

    pub fn from_wire(wire: RatchetStateWire) -> Self {
        Self {
            root_key: wire.root_key,
            sending_chain_key: wire.sending_chain_key,
            receiving_chain_key: wire.receiving_chain_key,
            dhs_secret: StaticSecret::from(wire.dhs_secret),
            dhs_public: wire.dhs_public,
            dhr: wire.dhr,
            ns: wire.ns,
            nr: wire.nr,
            pn: wire.pn,
            skipped: wire
                .skipped
                .into_iter()
                .map(|(dh, n, mk)| ((dh, n), mk))
                .collect(),
            max_skip: wire.max_skip,
        }
    }
}

/// Serde-friendly mirror of [`RatchetState`]'s private fields. `skipped` is a
/// flat vec rather than a map because JSON object keys must be strings.
#[derive(Serialize, Deserialize)]
pub struct RatchetStateWire {
    root_key: [u8; 32],
    sending_chain_key: Option<[u8; 32]>,
    receiving_chain_key: Option<[u8; 32]>,
    dhs_secret: [u8; 32],
    dhs_public: [u8; 32],
    dhr: Option<[u8; 32]>,
    ns: u32,
    nr: u32,
    pn: u32,
    skipped: Vec<([u8; 32], u32, [u8; 32])>,
    max_skip: usize,
}

impl Drop for RatchetStateWire {
    fn drop(&mut self) {
        self.root_key.zeroize();
        if let Some(ref mut ck) = self.sending_chain_key {
            ck.zeroize();
        }
        if let Some(ref mut ck) = self.receiving_chain_key {
            ck.zeroize();
        }
        self.dhs_secret.zeroize();
        for (_, _, mk) in &mut self.skipped {
            mk.zeroize();
        }
        self.skipped.clear();
    }
}

fn header_aad(header: &RatchetHeader) -> Vec<u8> {
    serde_json::to_vec(header).expect("RatchetHeader always serializes")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_states(max_skip: usize) -> (RatchetState, RatchetState) {
        let shared_secret = [1u8; 32];
        let ephemeral = StaticSecret::from([2u8; 32]);
        let spk = StaticSecret::from([3u8; 32]);
        let spk_public = PublicKey::from(&spk).to_bytes();

        let alice = RatchetState::init_initiator(shared_secret, ephemeral, spk_public, max_skip);
        let bob = RatchetState::init_responder(shared_secret, spk, max_skip);
        (alice, bob)
    }

    #[test]
    fn initiator_has_sending_chain_responder_has_neither() {
        // Alice already has a sending chain (she ran the X3DH DH herself);
        // Bob's DHr is unset until he actually receives Alice's first
        // header, so he has neither chain yet.
        let (alice, bob) = paired_states(1000);
        assert!(alice.sending_chain_key.is_some());
        assert!(alice.receiving_chain_key.is_none());
        assert!(bob.receiving_chain_key.is_none());
        assert!(bob.sending_chain_key.is_none());
        assert!(!alice.status_should_be_ready());
        assert!(!bob.status_should_be_ready());
    }

    #[test]
    fn responder_gets_sending_chain_after_first_decrypt() {
        let (mut alice, mut bob) = paired_states(1000);
        let (header, ct) = alice.encrypt(b"hi").unwrap();
        bob.decrypt(&header, &ct).unwrap();
        assert!(bob.sending_chain_key.is_some());
        assert_eq!(bob.dhr, Some(alice.dhs_public()));
    }

    #[test]
    fn simple_round_trip() {
        let (mut alice, mut bob) = paired_states(1000);
        let (header, ct) = alice.encrypt(b"hi").unwrap();
        let pt = bob.decrypt(&header, &ct).unwrap();
        assert_eq!(pt, b"hi");
    }

    #[test]
    fn wire_round_trip_preserves_state() {
        let (mut alice, mut bob) = paired_states(1000);
        let (h1, ct1) = alice.encrypt(b"one").unwrap();
        bob.decrypt(&h1, &ct1).unwrap();

        let restored_json = serde_json::to_vec(&alice.to_wire()).unwrap();
        let restored_wire: RatchetStateWire = serde_json::from_slice(&restored_json).unwrap();
        let mut restored = RatchetState::from_wire(restored_wire);

        let (h2, ct2) = restored.encrypt(b"two").unwrap();
        assert_eq!(bob.decrypt(&h2, &ct2).unwrap(), b"two");
    }

    #[test]
    fn bidirectional_messages_ratchet_dh() {
        let (mut alice, mut bob) = paired_states(1000);
        let (h1, ct1) = alice.encrypt(b"hi").unwrap();
        assert_eq!(bob.decrypt(&h1, &ct1).unwrap(), b"hi");

        let (h2, ct2) = bob.encrypt(b"hello").unwrap();
        assert_eq!(alice.decrypt(&h2, &ct2).unwrap(), b"hello");
        assert_eq!(alice.dhr, Some(h2_dh(&h2)));

        let (h3, ct3) = alice.encrypt(b"again").unwrap();
        assert_eq!(bob.decrypt(&h3, &ct3).unwrap(), b"again");
    }

    fn h2_dh(header: &RatchetHeader) -> [u8; 32] {
        let bytes = crate::wire::decode_key(&header.dh).unwrap();
        primitives::validate_public_key(&bytes).unwrap()
    }

    #[test]
    fn out_of_order_delivery_within_window() {
        let (mut alice, mut bob) = paired_states(1000);
        let m1 = alice.encrypt(b"m1").unwrap();
        let m2 = alice.encrypt(b"m2").unwrap();
        let m3 = alice.encrypt(b"m3").unwrap();

        assert_eq!(bob.decrypt(&m3.0, &m3.1).unwrap(), b"m3");
        assert_eq!(bob.skipped_key_count(), 2);
        assert_eq!(bob.decrypt(&m1.0, &m1.1).unwrap(), b"m1");
        assert_eq!(bob.decrypt(&m2.0, &m2.1).unwrap(), b"m2");
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn skip_overflow_beyond_max_skip() {
        let (mut alice, mut bob) = paired_states(5);
        let mut last = None;
        for i in 0..10u32 {
            let msg = alice.encrypt(format!("m{i}").as_bytes()).unwrap();
            last = Some(msg);
        }
        let (header, ct) = last.unwrap();
        assert!(bob.decrypt(&header, &ct).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (mut alice, mut bob) = paired_states(1000);
        let (header, mut ct) = alice.encrypt(b"secret").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(bob.decrypt(&header, &ct).is_err());
    }

    #[test]
    fn tampered_header_fails() {
        let (mut alice, mut bob) = paired_states(1000);
        let (mut header, ct) = alice.encrypt(b"secret").unwrap();
        header.n += 1;
        assert!(bob.decrypt(&header, &ct).is_err());
    }
}
