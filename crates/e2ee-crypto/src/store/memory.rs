//! Process-local `Store` implementation backed by `parking_lot::Mutex`-guarded
//! `HashMap`s. Data is lost on process exit — this exists for tests and for
//! exercising the Key Manager/Session Manager without a filesystem, the
//! same role the teacher's `MemoryIdentityStore`/`MemoryPreKeyStore`/
//! `MemorySessionStore` play for `SignalSessionManager`.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::{IdentityRecord, OneTimePrekeyRecord, SessionRecordRow, Store, SignedPrekeyRecord};
use crate::error::CryptoError;

#[derive(Default)]
pub struct MemoryStore {
    identity: Mutex<Option<IdentityRecord>>,
    signed_prekeys: Mutex<HashMap<u32, SignedPrekeyRecord>>,
    one_time_prekeys: Mutex<HashMap<u32, OneTimePrekeyRecord>>,
    sessions: Mutex<HashMap<String, SessionRecordRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn load_identity(&self) -> Result<Option<IdentityRecord>, CryptoError> {
        Ok(self.identity.lock().clone())
    }

    fn save_identity(&self, record: &IdentityRecord) -> Result<(), CryptoError> {
        *self.identity.lock() = Some(record.clone());
        Ok(())
    }

    fn load_signed_prekey(&self, key_id: u32) -> Result<Option<SignedPrekeyRecord>, CryptoError> {
        Ok(self.signed_prekeys.lock().get(&key_id).cloned())
    }

    fn save_signed_prekey(&self, record: &SignedPrekeyRecord) -> Result<(), CryptoError> {
        self.signed_prekeys
            .lock()
            .insert(record.key_id, record.clone());
        Ok(())
    }

    fn latest_signed_prekey(&self) -> Result<Option<SignedPrekeyRecord>, CryptoError> {
        Ok(self
            .signed_prekeys
            .lock()
            .values()
            .max_by_key(|r| r.created_at_unix_ms)
            .cloned())
    }

    fn load_one_time_prekey(
        &self,
        key_id: u32,
    ) -> Result<Option<OneTimePrekeyRecord>, CryptoError> {
        Ok(self.one_time_prekeys.lock().get(&key_id).cloned())
    }

    fn save_one_time_prekeys(&self, records: &[OneTimePrekeyRecord]) -> Result<(), CryptoError> {
        let mut guard = self.one_time_prekeys.lock();
        for record in records {
            guard.insert(record.key_id, record.clone());
        }
        Ok(())
    }

    fn consume_one_time_prekey(&self, key_id: u32) -> Result<OneTimePrekeyRecord, CryptoError> {
        let mut guard = self.one_time_prekeys.lock();
        let record = guard
            .get(&key_id)
            .filter(|r| !r.consumed)
            .cloned()
            .ok_or(CryptoError::UnknownOneTimePrekey(key_id))?;
        guard.remove(&key_id);
        Ok(record)
    }

    fn count_unconsumed_one_time_prekeys(&self) -> Result<usize, CryptoError> {
        Ok(self
            .one_time_prekeys
            .lock()
            .values()
            .filter(|r| !r.consumed)
            .count())
    }

    fn unuploaded_one_time_prekeys(&self) -> Result<Vec<OneTimePrekeyRecord>, CryptoError> {
        Ok(self
            .one_time_prekeys
            .lock()
            .values()
            .filter(|r| !r.consumed && !r.uploaded)
            .cloned()
            .collect())
    }

    fn load_session(&self, peer_id: &str) -> Result<Option<SessionRecordRow>, CryptoError> {
        Ok(self.sessions.lock().get(peer_id).cloned())
    }

    fn save_session(&self, record: &SessionRecordRow) -> Result<(), CryptoError> {
        self.sessions
            .lock()
            .insert(record.peer_id.clone(), record.clone());
        Ok(())
    }

    fn delete_session(&self, peer_id: &str) -> Result<(), CryptoError> {
        self.sessions.lock().remove(peer_id);
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<String>, CryptoError> {
        Ok(self.sessions.lock().keys().cloned().collect())
    }

    fn cleanup_older_than(&self, cutoff_unix_ms: i64) -> Result<(), CryptoError> {
        self.sessions
            .lock()
            .retain(|_, row| row.updated_at_unix_ms >= cutoff_unix_ms);
        Ok(())
    }
}
