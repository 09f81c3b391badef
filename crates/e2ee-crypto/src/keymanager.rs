//! Key Manager (§4.2): owns the long-lived identity and the signed/one-time
//! prekey pool, and is the only component allowed to touch their secret
//! halves. The Session Manager asks this for prekeys; it never reaches into
//! the [`Store`] directly for key material.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::ClientConfig;
use crate::error::CryptoError;
use crate::identity::Identity;
use crate::primitives;
use crate::store::{IdentityRecord, MasterKey, OneTimePrekeyRecord, SignedPrekeyRecord, Store};
use crate::wire::{self, OneTimePrekeyPublic, PrekeyUploadRequest, SignedPrekeyPublic};

const IDENTITY_AAD: &[u8] = b"identity-seed";
const SIGNED_PREKEY_AAD: &[u8] = b"signed-prekey-secret";
const ONE_TIME_PREKEY_AAD: &[u8] = b"one-time-prekey-secret";

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the Unix epoch")
        .as_millis() as i64
}

fn random_key_id() -> u32 {
    let bytes = primitives::random(4);
    u32::from_be_bytes(bytes.try_into().expect("4 bytes"))
}

fn random_x25519_keypair() -> ([u8; 32], StaticSecret, [u8; 32]) {
    let bytes = primitives::random(32);
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&bytes);
    let secret = StaticSecret::from(seed);
    let public = PublicKey::from(&secret).to_bytes();
    (seed, secret, public)
}

/// Owns identity generation/loading and signed/one-time prekey lifecycle
/// (§4.2). Cheap to clone — everything inside is an `Arc`.
#[derive(Clone)]
pub struct KeyManager {
    identity: Arc<Identity>,
    store: Arc<dyn Store>,
    master_key: Arc<MasterKey>,
    config: ClientConfig,
}

impl KeyManager {
    /// Load an existing identity/prekey pool from `store`, or provision a
    /// fresh one if `store` is empty (§4.2 step 1). Always leaves the
    /// one-time prekey pool at or above `config.one_time_prekey_floor`.
    pub fn initialize(
        store: Arc<dyn Store>,
        master_key: Arc<MasterKey>,
        config: ClientConfig,
    ) -> Result<Self, CryptoError> {
        let identity = match store.load_identity()? {
            Some(record) => {
                let seed_bytes = master_key.open(IDENTITY_AAD, &record.seed_sealed)?;
                let seed: [u8; 32] = seed_bytes
                    .try_into()
                    .map_err(|_| CryptoError::StoreCorrupted("identity seed wrong length".into()))?;
                Identity::from_seed(seed)
            }
            None => {
                let identity = Identity::generate();
                let sealed = master_key.seal(IDENTITY_AAD, identity.seed_bytes())?;
                store.save_identity(&IdentityRecord {
                    seed_sealed: sealed,
                    uploaded: false,
                })?;
                identity
            }
        };

        let manager = Self {
            identity: Arc::new(identity),
            store,
            master_key,
            config,
        };

        manager.rotate_signed_prekey_if_needed(now_unix_ms())?;
        manager.replenish_one_time_prekeys()?;
        Ok(manager)
    }

    pub fn identity_fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Rotate the signed prekey if none exists or the current one is older
    /// than `config.signed_prekey_ttl` (§4.2 step 3, edge case "expired
    /// signed prekey still on the server").
    pub fn rotate_signed_prekey_if_needed(&self, now_unix_ms: i64) -> Result<(), CryptoError> {
        let ttl_ms = self.config.signed_prekey_ttl.as_millis() as i64;
        let needs_rotation = match self.store.latest_signed_prekey()? {
            Some(record) => now_unix_ms.saturating_sub(record.created_at_unix_ms) >= ttl_ms,
            None => true,
        };
        if !needs_rotation {
            return Ok(());
        }

        let mut key_id = random_key_id();
        while self.store.load_signed_prekey(key_id)?.is_some() {
            key_id = random_key_id();
        }

        let (seed, _secret, public) = random_x25519_keypair();
        let signature = self.identity.sign(&public).to_bytes();
        let secret_sealed = self.master_key.seal(SIGNED_PREKEY_AAD, &seed)?;

        self.store.save_signed_prekey(&SignedPrekeyRecord {
            key_id,
            public_key: public,
            secret_sealed,
            signature,
            created_at_unix_ms: now_unix_ms,
            uploaded: false,
        })
    }

    /// Top up the one-time prekey pool to `config.one_time_prekey_target`
    /// whenever it has fallen to or below the floor (§4.2 step 4).
    pub fn replenish_one_time_prekeys(&self) -> Result<(), CryptoError> {
        let remaining = self.store.count_unconsumed_one_time_prekeys()?;
        if remaining > self.config.one_time_prekey_floor {
            return Ok(());
        }
        let to_generate = self.config.one_time_prekey_target.saturating_sub(remaining);
        if to_generate == 0 {
            return Ok(());
        }

        let mut fresh = Vec::with_capacity(to_generate);
        for _ in 0..to_generate {
            let mut key_id = random_key_id();
            while self.store.load_one_time_prekey(key_id)?.is_some() {
                key_id = random_key_id();
            }
            let (seed, _secret, public) = random_x25519_keypair();
            let secret_sealed = self.master_key.seal(ONE_TIME_PREKEY_AAD, &seed)?;
            fresh.push(OneTimePrekeyRecord {
                key_id,
                public_key: public,
                secret_sealed,
                created_at_unix_ms: now_unix_ms(),
                uploaded: false,
                consumed: false,
            });
        }
        self.store.save_one_time_prekeys(&fresh)
    }

    /// Build the upload request for every prekey this device has generated
    /// but not yet told the server about (§4.7 `POST /users/prekeys`).
    /// Returns `None` only if no signed prekey has ever been provisioned,
    /// which cannot happen once [`Self::initialize`] has run.
    pub fn pending_upload(&self) -> Result<Option<PrekeyUploadRequest>, CryptoError> {
        let Some(spk) = self.store.latest_signed_prekey()? else {
            return Ok(None);
        };
        let one_time_prekeys = self
            .store
            .unuploaded_one_time_prekeys()?
            .into_iter()
            .map(|record| OneTimePrekeyPublic {
                key_id: record.key_id,
                public_key: wire::encode_key(&record.public_key),
            })
            .collect();

        Ok(Some(PrekeyUploadRequest {
            identity_key: wire::encode_key(&self.identity.x25519_public().to_bytes()),
            signing_key: wire::encode_key(&self.identity.verifying_key_bytes()),
            signed_prekey: SignedPrekeyPublic {
                key_id: spk.key_id,
                public_key: wire::encode_key(&spk.public_key),
                signature: wire::encode_key(&spk.signature),
            },
            one_time_prekeys,
        }))
    }

    /// Record that the server accepted a batch of prekey uploads (§4.2 step
    /// 5, edge case "upload ack lost"): safe to call twice with the same ids.
    pub fn mark_uploaded(
        &self,
        signed_prekey_id: u32,
        one_time_prekey_ids: &[u32],
    ) -> Result<(), CryptoError> {
        if let Some(mut record) = self.store.load_signed_prekey(signed_prekey_id)? {
            record.uploaded = true;
            self.store.save_signed_prekey(&record)?;
        }
        for key_id in one_time_prekey_ids {
            if let Some(mut record) = self.store.load_one_time_prekey(*key_id)? {
                record.uploaded = true;
                self.store.save_one_time_prekeys(std::slice::from_ref(&record))?;
            }
        }
        Ok(())
    }

    /// Consume a one-time prekey by id for an incoming X3DH handshake,
    /// returning its secret half (§4.4 responder flow, global invariant
    /// 4: single-use). Returns `UnknownOneTimePrekey` if absent or already
    /// consumed.
    pub fn consume_one_time_prekey(&self, key_id: u32) -> Result<StaticSecret, CryptoError> {
        let record = self.store.consume_one_time_prekey(key_id)?;
        let seed_bytes = self.master_key.open(ONE_TIME_PREKEY_AAD, &record.secret_sealed)?;
        let seed: [u8; 32] = seed_bytes
            .try_into()
            .map_err(|_| CryptoError::StoreCorrupted("one-time prekey secret wrong length".into()))?;
        Ok(StaticSecret::from(seed))
    }

    /// Look up the secret half of a signed prekey by id, as the responder
    /// needs for `run_responder`'s DH1/DH3 (§4.4).
    pub fn signed_prekey_secret(&self, key_id: u32) -> Result<StaticSecret, CryptoError> {
        let record = self
            .store
            .load_signed_prekey(key_id)?
            .ok_or(CryptoError::UnknownSignedPrekey(key_id))?;
        let seed_bytes = self.master_key.open(SIGNED_PREKEY_AAD, &record.secret_sealed)?;
        let seed: [u8; 32] = seed_bytes
            .try_into()
            .map_err(|_| CryptoError::StoreCorrupted("signed prekey secret wrong length".into()))?;
        Ok(StaticSecret::from(seed))
    }

    /// Wipe the long-term identity and provision a fresh one plus a fresh
    /// prekey pool (§4.2 edge case "user resets their account").
    pub fn reset(&mut self) -> Result<(), CryptoError> {
        let identity = Identity::generate();
        let sealed = self.master_key.seal(IDENTITY_AAD, identity.seed_bytes())?;
        self.store.save_identity(&IdentityRecord {
            seed_sealed: sealed,
            uploaded: false,
        })?;
        self.identity = Arc::new(identity);
        self.rotate_signed_prekey_if_needed(now_unix_ms())?;
        self.replenish_one_time_prekeys()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn fresh_manager() -> (KeyManager, Arc<dyn Store>) {
        let salt = MasterKey::generate_salt();
        let master_key = Arc::new(MasterKey::derive("pass", &salt, 256, 1, 1).unwrap());
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        let mgr = KeyManager::initialize(store.clone(), master_key, ClientConfig::default()).unwrap();
        (mgr, store)
    }

    #[test]
    fn initialize_provisions_identity_and_prekeys() {
        let (mgr, store) = fresh_manager();
        assert_eq!(mgr.identity_fingerprint().len(), 64);
        assert!(store.latest_signed_prekey().unwrap().is_some());
        assert!(store.count_unconsumed_one_time_prekeys().unwrap() > 0);
    }

    #[test]
    fn reinitializing_with_same_store_reuses_identity() {
        let salt = MasterKey::generate_salt();
        let master_key = Arc::new(MasterKey::derive("pass", &salt, 256, 1, 1).unwrap());
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        let mgr1 =
            KeyManager::initialize(store.clone(), master_key.clone(), ClientConfig::default())
                .unwrap();
        let fp1 = mgr1.identity_fingerprint();
        let mgr2 = KeyManager::initialize(store, master_key, ClientConfig::default()).unwrap();
        assert_eq!(fp1, mgr2.identity_fingerprint());
    }

    #[test]
    fn consume_one_time_prekey_is_single_use() {
        let (mgr, store) = fresh_manager();
        let pending = mgr.pending_upload().unwrap().unwrap();
        let key_id = pending
            .one_time_prekeys
            .first()
            .expect("pool was replenished")
            .key_id;

        assert!(mgr.consume_one_time_prekey(key_id).is_ok());
        assert!(matches!(
            mgr.consume_one_time_prekey(key_id),
            Err(CryptoError::UnknownOneTimePrekey(id)) if id == key_id
        ));
        let _ = store;
    }

    #[test]
    fn rotation_replaces_expired_signed_prekey() {
        let (mgr, store) = fresh_manager();
        let original = store.latest_signed_prekey().unwrap().unwrap();
        let mut expiring_config = ClientConfig::default();
        expiring_config.signed_prekey_ttl = std::time::Duration::from_millis(0);
        let mgr = KeyManager {
            config: expiring_config,
            ..mgr
        };
        mgr.rotate_signed_prekey_if_needed(original.created_at_unix_ms + 1)
            .unwrap();
        let rotated = store.latest_signed_prekey().unwrap().unwrap();
        assert_ne!(original.key_id, rotated.key_id);
    }

    #[test]
    fn mark_uploaded_is_idempotent() {
        let (mgr, store) = fresh_manager();
        let pending = mgr.pending_upload().unwrap().unwrap();
        let otk_ids: Vec<u32> = pending.one_time_prekeys.iter().map(|k| k.key_id).collect();

        mgr.mark_uploaded(pending.signed_prekey.key_id, &otk_ids).unwrap();
        mgr.mark_uploaded(pending.signed_prekey.key_id, &otk_ids).unwrap();

        let spk = store
            .load_signed_prekey(pending.signed_prekey.key_id)
            .unwrap()
            .unwrap();
        assert!(spk.uploaded);
        assert!(mgr.pending_upload().unwrap().unwrap().one_time_prekeys.is_empty());
    }

    #[test]
    fn reset_generates_a_new_identity() {
        let (mut mgr, _store) = fresh_manager();
        let before = mgr.identity_fingerprint();
        mgr.reset().unwrap();
        assert_ne!(before, mgr.identity_fingerprint());
    }
}
