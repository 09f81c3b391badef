//! Session Manager (§4.6): the per-peer orchestration layer tying the Key
//! Manager, the X3DH engine, the Double Ratchet, and the Encrypted Local
//! Store together behind `encrypt`/`decrypt`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use x25519_dalek::StaticSecret;

use crate::error::CryptoError;
use crate::keymanager::KeyManager;
use crate::primitives;
use crate::ratchet::{RatchetState, RatchetStateWire};
use crate::store::{MasterKey, SessionRecordRow, SessionStatus, Store};
use crate::wire::{self, MessageEnvelope, PrekeyBundle, X3dhInit};
use crate::x3dh::{self, RemoteBundle};

const AEAD_TAG_LEN: usize = 16;

/// How many consecutive `DecryptionFailed` results a session tolerates
/// before its status moves to `error` (§4.5/§7: "repeated decrypt
/// failures"). A single bad or reordered-beyond-window ciphertext must not
/// trip this on its own.
const MAX_CONSECUTIVE_DECRYPT_FAILURES: u32 = 5;

/// How the Session Manager fetches a peer's prekey bundle to start a new
/// session as initiator (§4.7 `GET /users/{peerId}/prekeys`). The HTTP
/// client lives outside this crate; callers (the desktop app, the relay's
/// own test harness) supply an implementation.
pub trait PrekeyBundleSource: Send + Sync {
    fn fetch_bundle(&self, peer_id: &str) -> Result<PrekeyBundle, CryptoError>;
}

struct SessionEntry {
    ratchet: RatchetState,
    peer_identity_public: [u8; 32],
    status: SessionStatus,
    /// Set only on a freshly-created initiator session; attached to the
    /// very next outgoing envelope and then cleared (§4.4 step 6, §6).
    pending_x3dh: Option<X3dhInit>,
    /// Consecutive `DecryptionFailed` results since the last successful
    /// decrypt. Reset to 0 on success; past `MAX_CONSECUTIVE_DECRYPT_FAILURES`
    /// the session is considered fatally broken (§4.5/§7).
    consecutive_decrypt_failures: u32,
}

pub struct SessionManager {
    key_manager: KeyManager,
    store: Arc<dyn Store>,
    master_key: Arc<MasterKey>,
    max_skipped_message_keys: usize,
    cache: Mutex<HashMap<String, Arc<Mutex<SessionEntry>>>>,
}

fn session_aad(peer_id: &str) -> Vec<u8> {
    format!("session:{peer_id}").into_bytes()
}

fn pending_x3dh_aad(peer_id: &str) -> Vec<u8> {
    format!("pending-x3dh:{peer_id}").into_bytes()
}

fn decode_bundle(bundle: &PrekeyBundle) -> Result<RemoteBundle, CryptoError> {
    let identity_key = primitives::validate_public_key(
        &wire::decode_key(&bundle.identity_key).map_err(CryptoError::MalformedHeader)?,
    )?;
    let signing_key_bytes =
        wire::decode_key(&bundle.signing_key).map_err(CryptoError::MalformedHeader)?;
    let signing_key: [u8; 32] = signing_key_bytes
        .try_into()
        .map_err(|_| CryptoError::MalformedHeader("signing key wrong length".into()))?;
    let signed_prekey_public = primitives::validate_public_key(
        &wire::decode_key(&bundle.signed_prekey.public_key).map_err(CryptoError::MalformedHeader)?,
    )?;
    let signature_bytes =
        wire::decode_key(&bundle.signed_prekey.signature).map_err(CryptoError::MalformedHeader)?;
    let signed_prekey_signature: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|_| CryptoError::MalformedHeader("signature wrong length".into()))?;

    let (one_time_prekey_id, one_time_prekey_public) = match &bundle.one_time_prekey {
        Some(otk) => {
            let public = primitives::validate_public_key(
                &wire::decode_key(&otk.public_key).map_err(CryptoError::MalformedHeader)?,
            )?;
            (Some(otk.key_id), Some(public))
        }
        None => (None, None),
    };

    Ok(RemoteBundle {
        identity_key,
        signing_key,
        signed_prekey_id: bundle.signed_prekey.key_id,
        signed_prekey_public,
        signed_prekey_signature,
        one_time_prekey_id,
        one_time_prekey_public,
    })
}

impl SessionManager {
    pub fn new(
        key_manager: KeyManager,
        store: Arc<dyn Store>,
        master_key: Arc<MasterKey>,
        max_skipped_message_keys: usize,
    ) -> Self {
        Self {
            key_manager,
            store,
            master_key,
            max_skipped_message_keys,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn entry_handle(&self, peer_id: &str) -> Arc<Mutex<SessionEntry>> {
        self.cache
            .lock()
            .entry(peer_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(placeholder_entry())))
            .clone()
    }

    /// Load a previously-persisted session into `*guard`, if one exists and
    /// `*guard` doesn't already hold a real (non-placeholder) session.
    /// Returns whether `*guard` holds a session afterwards.
    fn hydrate_locked(&self, peer_id: &str, guard: &mut SessionEntry) -> Result<bool, CryptoError> {
        if guard.status != SessionStatus::Establishing || guard.peer_identity_public != [0u8; 32] {
            return Ok(true);
        }
        let Some(row) = self.store.load_session(peer_id)? else {
            return Ok(false);
        };
        let plaintext = self.master_key.open(&session_aad(peer_id), &row.state_sealed)?;
        let wire_state: RatchetStateWire = serde_json::from_slice(&plaintext)
            .map_err(|e| CryptoError::StoreCorrupted(e.to_string()))?;
        let pending_x3dh = row
            .pending_x3dh_sealed
            .as_ref()
            .map(|sealed| -> Result<X3dhInit, CryptoError> {
                let bytes = self.master_key.open(&pending_x3dh_aad(peer_id), sealed)?;
                serde_json::from_slice(&bytes).map_err(|e| CryptoError::StoreCorrupted(e.to_string()))
            })
            .transpose()?;
        *guard = SessionEntry {
            ratchet: RatchetState::from_wire(wire_state),
            peer_identity_public: row.peer_identity_public,
            status: row.status,
            pending_x3dh,
            consecutive_decrypt_failures: 0,
        };
        Ok(true)
    }

    /// Load a previously-persisted session into the in-memory cache, if one
    /// exists and is not already cached. No-op if the peer has no session.
    fn hydrate(&self, peer_id: &str, handle: &Arc<Mutex<SessionEntry>>) -> Result<bool, CryptoError> {
        let mut guard = handle.lock();
        self.hydrate_locked(peer_id, &mut guard)
    }

    fn persist(&self, peer_id: &str, entry: &SessionEntry) -> Result<(), CryptoError> {
        let plaintext = serde_json::to_vec(&entry.ratchet.to_wire())
            .expect("RatchetStateWire always serializes");
        let state_sealed = self.master_key.seal(&session_aad(peer_id), &plaintext)?;
        let pending_x3dh_sealed = entry
            .pending_x3dh
            .as_ref()
            .map(|x3dh| -> Result<Vec<u8>, CryptoError> {
                let bytes = serde_json::to_vec(x3dh).expect("X3dhInit always serializes");
                self.master_key.seal(&pending_x3dh_aad(peer_id), &bytes)
            })
            .transpose()?;
        self.store.save_session(&SessionRecordRow {
            peer_id: peer_id.to_string(),
            peer_identity_public: entry.peer_identity_public,
            status: entry.status,
            state_sealed,
            pending_x3dh_sealed,
            updated_at_unix_ms: now_unix_ms(),
        })
    }

    /// Ensure a session with `peer_id` exists, establishing one as the
    /// initiator via `source` if none is cached or persisted (§4.6 step 1).
    pub fn ensure_session(
        &self,
        peer_id: &str,
        source: &dyn PrekeyBundleSource,
    ) -> Result<(), CryptoError> {
        let handle = self.entry_handle(peer_id);
        // Hold this peer's lock across the whole fetch-and-establish
        // sequence (§5): concurrent callers for the same not-yet-established
        // peer block here and coalesce onto one establishment, rather than
        // each fetching a bundle and spending a one-time prekey on its own.
        let mut guard = handle.lock();
        if self.hydrate_locked(peer_id, &mut guard)? {
            return Ok(());
        }

        let bundle = source.fetch_bundle(peer_id)?;
        let remote = decode_bundle(&bundle)?;
        let out = x3dh::run_initiator(self.key_manager.identity(), &remote)?;

        let ratchet = RatchetState::init_initiator(
            out.shared_secret,
            out.local_ephemeral_secret,
            remote.signed_prekey_public,
            self.max_skipped_message_keys,
        );

        let pending_x3dh = X3dhInit {
            sender_identity_key: wire::encode_key(&out.local_identity_pub),
            sender_ephemeral_key: wire::encode_key(&out.local_ephemeral_pub),
            used_signed_prekey_id: out.used_spk_id,
            used_one_time_prekey_id: out.used_opk_id,
        };

        *guard = SessionEntry {
            ratchet,
            peer_identity_public: remote.identity_key,
            status: SessionStatus::Establishing,
            pending_x3dh: Some(pending_x3dh),
            consecutive_decrypt_failures: 0,
        };
        self.persist(peer_id, &guard)?;
        Ok(())
    }

    /// Encrypt `plaintext` for `peer_id`. The session must already exist
    /// (via [`Self::ensure_session`] or a prior inbound message).
    pub fn encrypt(&self, peer_id: &str, plaintext: &[u8]) -> Result<MessageEnvelope, CryptoError> {
        let handle = self.entry_handle(peer_id);
        if !self.hydrate(peer_id, &handle)? {
            return Err(CryptoError::NoSession);
        }
        let mut guard = handle.lock();
        let (header, sealed) = guard.ratchet.encrypt(plaintext)?;
        let x3dh = guard.pending_x3dh.take();
        if x3dh.is_some() {
            guard.status = SessionStatus::Ready;
        }
        let envelope = split_envelope(header, &sealed, x3dh);
        self.persist(peer_id, &guard)?;
        Ok(envelope)
    }

    /// Decrypt an inbound envelope from `peer_id`. If no session exists yet
    /// and the envelope carries an `x3dh` block, establishes one as the
    /// responder (§4.4 responder flow, §4.6 step 2).
    pub fn decrypt(&self, peer_id: &str, envelope: &MessageEnvelope) -> Result<Vec<u8>, CryptoError> {
        let handle = self.entry_handle(peer_id);
        let have_session = self.hydrate(peer_id, &handle)?;

        if !have_session {
            let Some(x3dh) = &envelope.x3dh else {
                return Err(CryptoError::NoSession);
            };
            let entry = self.establish_as_responder(peer_id, x3dh)?;
            *handle.lock() = entry;
        }

        let mut guard = handle.lock();
        let sealed = join_ciphertext(envelope)?;
        let plaintext = guard.ratchet.decrypt(&envelope.header, &sealed);
        match plaintext {
            Ok(pt) => {
                guard.consecutive_decrypt_failures = 0;
                self.persist(peer_id, &guard)?;
                Ok(pt)
            }
            Err(e) => {
                if matches!(e, CryptoError::DecryptionFailed) {
                    guard.consecutive_decrypt_failures += 1;
                }
                let fatal = e.is_session_fatal()
                    || guard.consecutive_decrypt_failures >= MAX_CONSECUTIVE_DECRYPT_FAILURES;
                if fatal {
                    guard.status = SessionStatus::Error;
                    let _ = self.persist(peer_id, &guard);
                }
                Err(e)
            }
        }
    }

    fn establish_as_responder(&self, peer_id: &str, x3dh: &X3dhInit) -> Result<SessionEntry, CryptoError> {
        let sender_identity_pub = primitives::validate_public_key(
            &wire::decode_key(&x3dh.sender_identity_key).map_err(CryptoError::MalformedHeader)?,
        )?;
        let sender_ephemeral_pub = primitives::validate_public_key(
            &wire::decode_key(&x3dh.sender_ephemeral_key).map_err(CryptoError::MalformedHeader)?,
        )?;

        let spk_secret = self.key_manager.signed_prekey_secret(x3dh.used_signed_prekey_id)?;
        let otk_secret = x3dh
            .used_one_time_prekey_id
            .map(|id| self.key_manager.consume_one_time_prekey(id))
            .transpose()?;

        let shared_secret = x3dh::run_responder(
            self.key_manager.identity(),
            &spk_secret,
            otk_secret.as_ref(),
            &sender_identity_pub,
            &sender_ephemeral_pub,
        )?;

        let ratchet =
            RatchetState::init_responder(shared_secret, spk_secret, self.max_skipped_message_keys);

        Ok(SessionEntry {
            ratchet,
            peer_identity_public: sender_identity_pub,
            status: SessionStatus::Ready,
            pending_x3dh: None,
            consecutive_decrypt_failures: 0,
        })
    }

    /// Tear down a session so the next message to or from `peer_id` starts a
    /// fresh handshake (§4.6 edge case "peer reinstalled the app").
    pub fn reset(&self, peer_id: &str) -> Result<(), CryptoError> {
        self.cache.lock().remove(peer_id);
        self.store.delete_session(peer_id)
    }

    pub fn session_status(&self, peer_id: &str) -> Result<Option<SessionStatus>, CryptoError> {
        let handle = self.entry_handle(peer_id);
        if !self.hydrate(peer_id, &handle)? {
            self.cache.lock().remove(peer_id);
            return Ok(None);
        }
        Ok(Some(handle.lock().status))
    }
}

fn placeholder_entry() -> SessionEntry {
    SessionEntry {
        ratchet: RatchetState::init_initiator(
            [0u8; 32],
            StaticSecret::from([0u8; 32]),
            [1u8; 32],
            0,
        ),
        peer_identity_public: [0u8; 32],
        status: SessionStatus::Establishing,
        pending_x3dh: None,
        consecutive_decrypt_failures: 0,
    }
}

/// Split the combined AES-256-GCM output into the wire's separate
/// `ciphertext`/`authTag` fields. `iv` carries the same counter-derived
/// nonce both sides already recompute from `header.n` (§4.1) — present on
/// the wire for parity with the envelope shape, never a fresh random value.
fn split_envelope(
    header: crate::wire::RatchetHeader,
    sealed: &[u8],
    x3dh: Option<X3dhInit>,
) -> MessageEnvelope {
    let nonce = primitives::counter_nonce(header.n);
    let tag_at = sealed.len().saturating_sub(AEAD_TAG_LEN);
    let (ciphertext, tag) = sealed.split_at(tag_at);
    MessageEnvelope {
        header,
        ciphertext: wire::encode_key(ciphertext),
        auth_tag: wire::encode_key(tag),
        iv: wire::encode_key(&nonce),
        x3dh,
    }
}

fn join_ciphertext(envelope: &MessageEnvelope) -> Result<Vec<u8>, CryptoError> {
    let mut ciphertext =
        wire::decode_key(&envelope.ciphertext).map_err(CryptoError::MalformedHeader)?;
    let mut tag = wire::decode_key(&envelope.auth_tag).map_err(CryptoError::MalformedHeader)?;
    ciphertext.append(&mut tag);
    Ok(ciphertext)
}

fn now_unix_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the Unix epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::identity::Identity;
    use crate::store::MemoryStore;
    use crate::wire::{OneTimePrekeyPublic, SignedPrekeyPublic};
    use std::sync::Arc;
    use x25519_dalek::StaticSecret;

    struct FixedBundleSource(PrekeyBundle);

    impl PrekeyBundleSource for FixedBundleSource {
        fn fetch_bundle(&self, _peer_id: &str) -> Result<PrekeyBundle, CryptoError> {
            Ok(self.0.clone())
        }
    }

    fn manager_with_identity() -> (SessionManager, Identity, Arc<dyn Store>) {
        let salt = MasterKey::generate_salt();
        let master_key = Arc::new(MasterKey::derive("pw", &salt, 256, 1, 1).unwrap());
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        let km = KeyManager::initialize(store.clone(), master_key.clone(), ClientConfig::default())
            .unwrap();
        let identity_clone = Identity::from_seed(*km.identity().seed_bytes());
        let sm = SessionManager::new(km, store.clone(), master_key, 1000);
        (sm, identity_clone, store)
    }

    fn bundle_for(identity: &Identity, spk_secret: &StaticSecret, spk_id: u32) -> PrekeyBundle {
        let spk_public = x25519_dalek::PublicKey::from(spk_secret).to_bytes();
        let signature = identity.sign(&spk_public);
        PrekeyBundle {
            identity_key: wire::encode_key(&identity.x25519_public().to_bytes()),
            signing_key: wire::encode_key(&identity.verifying_key_bytes()),
            signed_prekey: SignedPrekeyPublic {
                key_id: spk_id,
                public_key: wire::encode_key(&spk_public),
                signature: wire::encode_key(&signature.to_bytes()),
            },
            one_time_prekey: None,
        }
    }

    #[test]
    fn full_handshake_and_message_round_trip() {
        let (alice_sm, _alice_identity, _alice_store) = manager_with_identity();
        let (bob_sm, bob_identity, bob_store) = manager_with_identity();

        // Publish Bob's real signed prekey so Alice's fetch resolves to a
        // bundle Bob can actually respond to.
        let bob_spk = bob_store.latest_signed_prekey().unwrap().unwrap();
        let bob_spk_secret = bob_sm.key_manager.signed_prekey_secret(bob_spk.key_id).unwrap();
        let bundle = bundle_for(&bob_identity, &bob_spk_secret, bob_spk.key_id);
        let source = FixedBundleSource(bundle);

        alice_sm.ensure_session("bob", &source).unwrap();
        let envelope = alice_sm.encrypt("bob", b"hello bob").unwrap();
        assert!(envelope.x3dh.is_some());

        let plaintext = bob_sm.decrypt("alice", &envelope).unwrap();
        assert_eq!(plaintext, b"hello bob");

        let reply = bob_sm.encrypt("alice", b"hi alice").unwrap();
        assert!(reply.x3dh.is_none());
        let reply_plain = alice_sm.decrypt("bob", &reply).unwrap();
        assert_eq!(reply_plain, b"hi alice");
    }

    #[test]
    fn status_stays_establishing_until_first_message_is_sent() {
        let (alice_sm, _alice_identity, _alice_store) = manager_with_identity();
        let (bob_sm, bob_identity, bob_store) = manager_with_identity();
        let bob_spk = bob_store.latest_signed_prekey().unwrap().unwrap();
        let bob_spk_secret = bob_sm.key_manager.signed_prekey_secret(bob_spk.key_id).unwrap();
        let bundle = bundle_for(&bob_identity, &bob_spk_secret, bob_spk.key_id);

        alice_sm.ensure_session("bob", &FixedBundleSource(bundle)).unwrap();
        assert_eq!(
            alice_sm.session_status("bob").unwrap(),
            Some(SessionStatus::Establishing)
        );

        alice_sm.encrypt("bob", b"hello").unwrap();
        assert_eq!(
            alice_sm.session_status("bob").unwrap(),
            Some(SessionStatus::Ready)
        );
    }

    #[test]
    fn pending_x3dh_survives_cache_eviction_before_first_send() {
        let (alice_sm, _alice_identity, _alice_store) = manager_with_identity();
        let (bob_sm, bob_identity, bob_store) = manager_with_identity();
        let bob_spk = bob_store.latest_signed_prekey().unwrap().unwrap();
        let bob_spk_secret = bob_sm.key_manager.signed_prekey_secret(bob_spk.key_id).unwrap();
        let bundle = bundle_for(&bob_identity, &bob_spk_secret, bob_spk.key_id);

        alice_sm.ensure_session("bob", &FixedBundleSource(bundle)).unwrap();
        // Simulate a process restart (or cache eviction) between
        // `ensure_session` and the first `encrypt`: the in-memory entry is
        // gone, so the next call must rehydrate from the persisted row.
        alice_sm.cache.lock().remove("bob");

        let envelope = alice_sm.encrypt("bob", b"hello bob").unwrap();
        assert!(envelope.x3dh.is_some());

        let plaintext = bob_sm.decrypt("alice", &envelope).unwrap();
        assert_eq!(plaintext, b"hello bob");
    }

    #[test]
    fn repeated_decrypt_failures_mark_session_error() {
        let (alice_sm, _alice_identity, _alice_store) = manager_with_identity();
        let (bob_sm, bob_identity, bob_store) = manager_with_identity();
        let bob_spk = bob_store.latest_signed_prekey().unwrap().unwrap();
        let bob_spk_secret = bob_sm.key_manager.signed_prekey_secret(bob_spk.key_id).unwrap();
        let bundle = bundle_for(&bob_identity, &bob_spk_secret, bob_spk.key_id);
        alice_sm.ensure_session("bob", &FixedBundleSource(bundle)).unwrap();
        let envelope = alice_sm.encrypt("bob", b"hello bob").unwrap();
        // Establish Bob's side of the session first so subsequent garbage
        // envelopes hit ratchet decryption (DecryptionFailed) rather than
        // the NoSession path.
        bob_sm.decrypt("alice", &envelope).unwrap();

        let mut garbage = envelope.clone();
        garbage.x3dh = None;
        garbage.ciphertext = wire::encode_key(b"not the real ciphertext");

        for _ in 0..MAX_CONSECUTIVE_DECRYPT_FAILURES {
            assert!(bob_sm.decrypt("alice", &garbage).is_err());
        }
        assert_eq!(
            bob_sm.session_status("alice").unwrap(),
            Some(SessionStatus::Error)
        );
    }

    #[test]
    fn decrypt_without_session_or_x3dh_block_is_rejected() {
        let (_alice_sm, _alice_identity, _alice_store) = manager_with_identity();
        let (bob_sm, _bob_identity, _bob_store) = manager_with_identity();
        let envelope = MessageEnvelope {
            header: crate::wire::RatchetHeader {
                dh: wire::encode_key(&[1u8; 32]),
                pn: 0,
                n: 0,
            },
            ciphertext: wire::encode_key(b"nonsense"),
            auth_tag: wire::encode_key(&[0u8; 16]),
            iv: wire::encode_key(&[0u8; 12]),
            x3dh: None,
        };
        assert!(matches!(
            bob_sm.decrypt("stranger", &envelope),
            Err(CryptoError::NoSession)
        ));
    }

    #[test]
    fn reset_clears_cached_and_persisted_session() {
        let (alice_sm, _alice_identity, _alice_store) = manager_with_identity();
        let (bob_sm, bob_identity, bob_store) = manager_with_identity();
        let bob_spk = bob_store.latest_signed_prekey().unwrap().unwrap();
        let bob_spk_secret = bob_sm.key_manager.signed_prekey_secret(bob_spk.key_id).unwrap();
        let bundle = bundle_for(&bob_identity, &bob_spk_secret, bob_spk.key_id);
        alice_sm.ensure_session("bob", &FixedBundleSource(bundle)).unwrap();
        assert!(alice_sm.session_status("bob").unwrap().is_some());

        alice_sm.reset("bob").unwrap();
        assert!(alice_sm.session_status("bob").unwrap().is_none());
    }
}
