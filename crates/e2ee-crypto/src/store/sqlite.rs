//! rusqlite-backed `Store`, following the connection-setup convention used
//! throughout the reference workspace (`db.rs`'s `create_pool`: WAL mode,
//! foreign keys on, a `user_version` schema gate).

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::records::SessionStatus;
use super::{IdentityRecord, OneTimePrekeyRecord, SessionRecordRow, Store, SignedPrekeyRecord};
use crate::error::CryptoError;

const SCHEMA_VERSION: i64 = 2;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS store_identity (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    seed_sealed BLOB NOT NULL,
    uploaded INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS store_signed_prekeys (
    key_id INTEGER PRIMARY KEY,
    public_key BLOB NOT NULL,
    secret_sealed BLOB NOT NULL,
    signature BLOB NOT NULL,
    created_at_unix_ms INTEGER NOT NULL,
    uploaded INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS store_one_time_prekeys (
    key_id INTEGER PRIMARY KEY,
    public_key BLOB NOT NULL,
    secret_sealed BLOB NOT NULL,
    created_at_unix_ms INTEGER NOT NULL,
    uploaded INTEGER NOT NULL,
    consumed INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS store_sessions (
    peer_id TEXT PRIMARY KEY,
    peer_identity_public BLOB NOT NULL,
    status TEXT NOT NULL,
    state_sealed BLOB NOT NULL,
    pending_x3dh_sealed BLOB,
    updated_at_unix_ms INTEGER NOT NULL
);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn map_sql_err(e: rusqlite::Error) -> CryptoError {
    CryptoError::StoreIoError(e.to_string())
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let conn = Connection::open(path).map_err(map_sql_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, CryptoError> {
        let conn = Connection::open_in_memory().map_err(map_sql_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, CryptoError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(map_sql_err)?;
        let current: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);
        if current != SCHEMA_VERSION {
            conn.execute_batch(SCHEMA).map_err(map_sql_err)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(map_sql_err)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl Store for SqliteStore {
    fn load_identity(&self) -> Result<Option<IdentityRecord>, CryptoError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT seed_sealed, uploaded FROM store_identity WHERE id = 1",
            [],
            |row| {
                Ok(IdentityRecord {
                    seed_sealed: row.get(0)?,
                    uploaded: row.get::<_, i64>(1)? != 0,
                })
            },
        )
        .optional()
        .map_err(map_sql_err)
    }

    fn save_identity(&self, record: &IdentityRecord) -> Result<(), CryptoError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO store_identity (id, seed_sealed, uploaded) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET seed_sealed = excluded.seed_sealed, uploaded = excluded.uploaded",
            params![record.seed_sealed, i64::from(record.uploaded)],
        )
        .map_err(map_sql_err)?;
        Ok(())
    }

    fn load_signed_prekey(&self, key_id: u32) -> Result<Option<SignedPrekeyRecord>, CryptoError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT key_id, public_key, secret_sealed, signature, created_at_unix_ms, uploaded
             FROM store_signed_prekeys WHERE key_id = ?1",
            params![key_id],
            row_to_signed_prekey,
        )
        .optional()
        .map_err(map_sql_err)
    }

    fn save_signed_prekey(&self, record: &SignedPrekeyRecord) -> Result<(), CryptoError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO store_signed_prekeys
                (key_id, public_key, secret_sealed, signature, created_at_unix_ms, uploaded)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(key_id) DO UPDATE SET
                public_key = excluded.public_key,
                secret_sealed = excluded.secret_sealed,
                signature = excluded.signature,
                created_at_unix_ms = excluded.created_at_unix_ms,
                uploaded = excluded.uploaded",
            params![
                record.key_id,
                record.public_key.as_slice(),
                record.secret_sealed,
                record.signature.as_slice(),
                record.created_at_unix_ms,
                i64::from(record.uploaded),
            ],
        )
        .map_err(map_sql_err)?;
        Ok(())
    }

    fn latest_signed_prekey(&self) -> Result<Option<SignedPrekeyRecord>, CryptoError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT key_id, public_key, secret_sealed, signature, created_at_unix_ms, uploaded
             FROM store_signed_prekeys ORDER BY created_at_unix_ms DESC LIMIT 1",
            [],
            row_to_signed_prekey,
        )
        .optional()
        .map_err(map_sql_err)
    }

    fn load_one_time_prekey(
        &self,
        key_id: u32,
    ) -> Result<Option<OneTimePrekeyRecord>, CryptoError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT key_id, public_key, secret_sealed, created_at_unix_ms, uploaded, consumed
             FROM store_one_time_prekeys WHERE key_id = ?1",
            params![key_id],
            row_to_one_time_prekey,
        )
        .optional()
        .map_err(map_sql_err)
    }

    fn save_one_time_prekeys(&self, records: &[OneTimePrekeyRecord]) -> Result<(), CryptoError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(map_sql_err)?;
        for record in records {
            tx.execute(
                "INSERT INTO store_one_time_prekeys
                    (key_id, public_key, secret_sealed, created_at_unix_ms, uploaded, consumed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(key_id) DO UPDATE SET
                    public_key = excluded.public_key,
                    secret_sealed = excluded.secret_sealed,
                    created_at_unix_ms = excluded.created_at_unix_ms,
                    uploaded = excluded.uploaded,
                    consumed = excluded.consumed",
                params![
                    record.key_id,
                    record.public_key.as_slice(),
                    record.secret_sealed,
                    record.created_at_unix_ms,
                    i64::from(record.uploaded),
                    i64::from(record.consumed),
                ],
            )
            .map_err(map_sql_err)?;
        }
        tx.commit().map_err(map_sql_err)
    }

    fn consume_one_time_prekey(&self, key_id: u32) -> Result<OneTimePrekeyRecord, CryptoError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(map_sql_err)?;
        let record = tx
            .query_row(
                "SELECT key_id, public_key, secret_sealed, created_at_unix_ms, uploaded, consumed
                 FROM store_one_time_prekeys WHERE key_id = ?1 AND consumed = 0",
                params![key_id],
                row_to_one_time_prekey,
            )
            .optional()
            .map_err(map_sql_err)?
            .ok_or(CryptoError::UnknownOneTimePrekey(key_id))?;
        tx.execute(
            "DELETE FROM store_one_time_prekeys WHERE key_id = ?1",
            params![key_id],
        )
        .map_err(map_sql_err)?;
        tx.commit().map_err(map_sql_err)?;
        Ok(record)
    }

    fn count_unconsumed_one_time_prekeys(&self) -> Result<usize, CryptoError> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM store_one_time_prekeys WHERE consumed = 0",
                [],
                |row| row.get(0),
            )
            .map_err(map_sql_err)?;
        Ok(count.max(0) as usize)
    }

    fn unuploaded_one_time_prekeys(&self) -> Result<Vec<OneTimePrekeyRecord>, CryptoError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT key_id, public_key, secret_sealed, created_at_unix_ms, uploaded, consumed
                 FROM store_one_time_prekeys WHERE consumed = 0 AND uploaded = 0",
            )
            .map_err(map_sql_err)?;
        let rows = stmt.query_map([], row_to_one_time_prekey).map_err(map_sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_sql_err)
    }

    fn load_session(&self, peer_id: &str) -> Result<Option<SessionRecordRow>, CryptoError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT peer_id, peer_identity_public, status, state_sealed, pending_x3dh_sealed, updated_at_unix_ms
             FROM store_sessions WHERE peer_id = ?1",
            params![peer_id],
            row_to_session,
        )
        .optional()
        .map_err(map_sql_err)
    }

    fn save_session(&self, record: &SessionRecordRow) -> Result<(), CryptoError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO store_sessions
                (peer_id, peer_identity_public, status, state_sealed, pending_x3dh_sealed, updated_at_unix_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(peer_id) DO UPDATE SET
                peer_identity_public = excluded.peer_identity_public,
                status = excluded.status,
                state_sealed = excluded.state_sealed,
                pending_x3dh_sealed = excluded.pending_x3dh_sealed,
                updated_at_unix_ms = excluded.updated_at_unix_ms",
            params![
                record.peer_id,
                record.peer_identity_public.as_slice(),
                record.status.as_str(),
                record.state_sealed,
                record.pending_x3dh_sealed,
                record.updated_at_unix_ms,
            ],
        )
        .map_err(map_sql_err)?;
        Ok(())
    }

    fn delete_session(&self, peer_id: &str) -> Result<(), CryptoError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM store_sessions WHERE peer_id = ?1",
            params![peer_id],
        )
        .map_err(map_sql_err)?;
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<String>, CryptoError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT peer_id FROM store_sessions")
            .map_err(map_sql_err)?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(map_sql_err)?;
        rows.collect::<Result<Vec<String>, _>>().map_err(map_sql_err)
    }

    fn cleanup_older_than(&self, cutoff_unix_ms: i64) -> Result<(), CryptoError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM store_sessions WHERE updated_at_unix_ms < ?1",
            params![cutoff_unix_ms],
        )
        .map_err(map_sql_err)?;
        Ok(())
    }
}

fn row_to_signed_prekey(row: &rusqlite::Row<'_>) -> rusqlite::Result<SignedPrekeyRecord> {
    let public_key: Vec<u8> = row.get(1)?;
    let signature: Vec<u8> = row.get(3)?;
    Ok(SignedPrekeyRecord {
        key_id: row.get(0)?,
        public_key: public_key.try_into().unwrap_or([0u8; 32]),
        secret_sealed: row.get(2)?,
        signature: signature.try_into().unwrap_or([0u8; 64]),
        created_at_unix_ms: row.get(4)?,
        uploaded: row.get::<_, i64>(5)? != 0,
    })
}

fn row_to_one_time_prekey(row: &rusqlite::Row<'_>) -> rusqlite::Result<OneTimePrekeyRecord> {
    let public_key: Vec<u8> = row.get(1)?;
    Ok(OneTimePrekeyRecord {
        key_id: row.get(0)?,
        public_key: public_key.try_into().unwrap_or([0u8; 32]),
        secret_sealed: row.get(2)?,
        created_at_unix_ms: row.get(3)?,
        uploaded: row.get::<_, i64>(4)? != 0,
        consumed: row.get::<_, i64>(5)? != 0,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecordRow> {
    let peer_identity_public: Vec<u8> = row.get(1)?;
    let status: String = row.get(2)?;
    Ok(SessionRecordRow {
        peer_id: row.get(0)?,
        peer_identity_public: peer_identity_public.try_into().unwrap_or([0u8; 32]),
        status: SessionStatus::from_str(&status).unwrap_or(SessionStatus::Error),
        state_sealed: row.get(3)?,
        pending_x3dh_sealed: row.get(4)?,
        updated_at_unix_ms: row.get(5)?,
    })
}
