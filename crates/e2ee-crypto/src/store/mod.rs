//! The Encrypted Local Store (§4.3): the sole durable sink for secret
//! material. `Store` is the abstract trait design note §12 calls for
//! ("Browser-side key-value store with cursors" → "an abstract `Store`
//! trait with transactional single-record updates"); [`SqliteStore`] is the
//! concrete rusqlite-backed implementation, and [`MemoryStore`] is a
//! process-local implementation kept for tests, the way the teacher keeps
//! `MemoryIdentityStore`/`MemoryPreKeyStore`/`MemorySessionStore` alongside
//! its production store.

mod master_key;
mod memory;
mod records;
mod sqlite;

pub use master_key::{MasterKey, MASTER_KEY_SALT_LEN};
pub use memory::MemoryStore;
pub use records::{
    IdentityRecord, OneTimePrekeyRecord, SessionRecordRow, SessionStatus, SignedPrekeyRecord,
};
pub use sqlite::SqliteStore;

use crate::error::CryptoError;

/// Transactional single-record CRUD over every kind of secret material the
/// encryption core persists (§4.3). Implementations MUST encrypt every
/// secret field under the store's master key before it touches disk; see
/// `SqliteStore`'s column layout for the concrete at-rest format.
pub trait Store: Send + Sync {
    fn load_identity(&self) -> Result<Option<IdentityRecord>, CryptoError>;
    fn save_identity(&self, record: &IdentityRecord) -> Result<(), CryptoError>;

    fn load_signed_prekey(&self, key_id: u32) -> Result<Option<SignedPrekeyRecord>, CryptoError>;
    fn save_signed_prekey(&self, record: &SignedPrekeyRecord) -> Result<(), CryptoError>;
    fn latest_signed_prekey(&self) -> Result<Option<SignedPrekeyRecord>, CryptoError>;

    fn load_one_time_prekey(
        &self,
        key_id: u32,
    ) -> Result<Option<OneTimePrekeyRecord>, CryptoError>;
    fn save_one_time_prekeys(
        &self,
        records: &[OneTimePrekeyRecord],
    ) -> Result<(), CryptoError>;
    /// Unconsumed one-time prekeys this device has not yet told the server
    /// about, for building a `POST /users/prekeys` upload batch (§4.7).
    fn unuploaded_one_time_prekeys(&self) -> Result<Vec<OneTimePrekeyRecord>, CryptoError>;
    /// Atomically mark a one-time prekey consumed and return its secret.
    /// Returns `UnknownOneTimePrekey` if it does not exist or was already
    /// consumed — enforcing global invariant (4).
    fn consume_one_time_prekey(
        &self,
        key_id: u32,
    ) -> Result<OneTimePrekeyRecord, CryptoError>;
    fn count_unconsumed_one_time_prekeys(&self) -> Result<usize, CryptoError>;

    fn load_session(&self, peer_id: &str) -> Result<Option<SessionRecordRow>, CryptoError>;
    /// Replace a session record as a single transaction — a failed ratchet
    /// step must never leave the session half-updated (§4.3 atomicity).
    fn save_session(&self, record: &SessionRecordRow) -> Result<(), CryptoError>;
    fn delete_session(&self, peer_id: &str) -> Result<(), CryptoError>;
    fn list_sessions(&self) -> Result<Vec<String>, CryptoError>;

    fn cleanup_older_than(&self, cutoff_unix_ms: i64) -> Result<(), CryptoError>;
}

impl<T: Store + ?Sized> Store for std::sync::Arc<T> {
    fn load_identity(&self) -> Result<Option<IdentityRecord>, CryptoError> {
        (**self).load_identity()
    }
    fn save_identity(&self, record: &IdentityRecord) -> Result<(), CryptoError> {
        (**self).save_identity(record)
    }
    fn load_signed_prekey(&self, key_id: u32) -> Result<Option<SignedPrekeyRecord>, CryptoError> {
        (**self).load_signed_prekey(key_id)
    }
    fn save_signed_prekey(&self, record: &SignedPrekeyRecord) -> Result<(), CryptoError> {
        (**self).save_signed_prekey(record)
    }
    fn latest_signed_prekey(&self) -> Result<Option<SignedPrekeyRecord>, CryptoError> {
        (**self).latest_signed_prekey()
    }
    fn load_one_time_prekey(
        &self,
        key_id: u32,
    ) -> Result<Option<OneTimePrekeyRecord>, CryptoError> {
        (**self).load_one_time_prekey(key_id)
    }
    fn save_one_time_prekeys(&self, records: &[OneTimePrekeyRecord]) -> Result<(), CryptoError> {
        (**self).save_one_time_prekeys(records)
    }
    fn unuploaded_one_time_prekeys(&self) -> Result<Vec<OneTimePrekeyRecord>, CryptoError> {
        (**self).unuploaded_one_time_prekeys()
    }
    fn consume_one_time_prekey(&self, key_id: u32) -> Result<OneTimePrekeyRecord, CryptoError> {
        (**self).consume_one_time_prekey(key_id)
    }
    fn count_unconsumed_one_time_prekeys(&self) -> Result<usize, CryptoError> {
        (**self).count_unconsumed_one_time_prekeys()
    }
    fn load_session(&self, peer_id: &str) -> Result<Option<SessionRecordRow>, CryptoError> {
        (**self).load_session(peer_id)
    }
    fn save_session(&self, record: &SessionRecordRow) -> Result<(), CryptoError> {
        (**self).save_session(record)
    }
    fn delete_session(&self, peer_id: &str) -> Result<(), CryptoError> {
        (**self).delete_session(peer_id)
    }
    fn list_sessions(&self) -> Result<Vec<String>, CryptoError> {
        (**self).list_sessions()
    }
    fn cleanup_older_than(&self, cutoff_unix_ms: i64) -> Result<(), CryptoError> {
        (**self).cleanup_older_than(cutoff_unix_ms)
    }
}
