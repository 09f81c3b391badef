//! rusqlite-backed storage for the prekey repository (§4.7) and the message
//! relay (§4.8), following the same connection-setup convention as
//! `e2ee_crypto::store::SqliteStore` and the teacher's `db.rs`: WAL mode,
//! foreign keys on, a `user_version` schema gate.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::RelayError;
use e2ee_crypto::wire::{OneTimePrekeyPublic, PrekeyBundle, SignedPrekeyPublic};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS relay_users (
    user_id TEXT PRIMARY KEY,
    identity_key TEXT NOT NULL,
    signing_key TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS relay_signed_prekeys (
    user_id TEXT PRIMARY KEY REFERENCES relay_users(user_id) ON DELETE CASCADE,
    key_id INTEGER NOT NULL,
    public_key TEXT NOT NULL,
    signature TEXT NOT NULL,
    created_at_unix_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS relay_one_time_prekeys (
    user_id TEXT NOT NULL REFERENCES relay_users(user_id) ON DELETE CASCADE,
    key_id INTEGER NOT NULL,
    public_key TEXT NOT NULL,
    consumed INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, key_id)
);

CREATE TABLE IF NOT EXISTS relay_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_user TEXT NOT NULL,
    to_user TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp_unix_ms INTEGER NOT NULL,
    status TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_relay_messages_recipient
    ON relay_messages(to_user, timestamp_unix_ms);
";

pub struct RelayDb {
    conn: Mutex<Connection>,
}

impl RelayDb {
    pub fn open(path: &str) -> Result<Self, RelayError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, RelayError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, RelayError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let current: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);
        if current != SCHEMA_VERSION {
            conn.execute_batch(SCHEMA)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn user_exists(&self, user_id: &str) -> Result<bool, RelayError> {
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM relay_users WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Fetch a bundle for `user_id`, atomically consuming one unconsumed
    /// one-time prekey in the same transaction (§4.7).
    pub fn fetch_bundle(&self, user_id: &str) -> Result<Option<PrekeyBundle>, RelayError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let Some((identity_key, signing_key)) = tx
            .query_row(
                "SELECT identity_key, signing_key FROM relay_users WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?
        else {
            return Ok(None);
        };

        let signed_prekey = tx.query_row(
            "SELECT key_id, public_key, signature FROM relay_signed_prekeys WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(SignedPrekeyPublic {
                    key_id: row.get(0)?,
                    public_key: row.get(1)?,
                    signature: row.get(2)?,
                })
            },
        )?;

        let one_time_prekey = tx
            .query_row(
                "SELECT key_id, public_key FROM relay_one_time_prekeys
                 WHERE user_id = ?1 AND consumed = 0 LIMIT 1",
                params![user_id],
                |row| {
                    Ok(OneTimePrekeyPublic {
                        key_id: row.get(0)?,
                        public_key: row.get(1)?,
                    })
                },
            )
            .optional()?;

        if let Some(otk) = &one_time_prekey {
            tx.execute(
                "UPDATE relay_one_time_prekeys SET consumed = 1
                 WHERE user_id = ?1 AND key_id = ?2",
                params![user_id, otk.key_id],
            )?;
        }

        tx.commit()?;
        Ok(Some(PrekeyBundle {
            identity_key,
            signing_key,
            signed_prekey,
            one_time_prekey,
        }))
    }

    /// Upsert a user's identity, signed prekey, and newly-contributed
    /// one-time prekeys (§4.7 `PUT bundle`). Caps are enforced by the caller
    /// before this is invoked.
    pub fn upsert_bundle(
        &self,
        user_id: &str,
        identity_key: &str,
        signing_key: &str,
        signed_prekey: &SignedPrekeyPublic,
        one_time_prekeys: &[OneTimePrekeyPublic],
        now_unix_ms: i64,
    ) -> Result<(), RelayError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO relay_users (user_id, identity_key, signing_key) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                identity_key = excluded.identity_key,
                signing_key = excluded.signing_key",
            params![user_id, identity_key, signing_key],
        )?;

        tx.execute(
            "INSERT INTO relay_signed_prekeys (user_id, key_id, public_key, signature, created_at_unix_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                key_id = excluded.key_id,
                public_key = excluded.public_key,
                signature = excluded.signature,
                created_at_unix_ms = excluded.created_at_unix_ms",
            params![
                user_id,
                signed_prekey.key_id,
                signed_prekey.public_key,
                signed_prekey.signature,
                now_unix_ms,
            ],
        )?;

        for otk in one_time_prekeys {
            tx.execute(
                "INSERT INTO relay_one_time_prekeys (user_id, key_id, public_key, consumed)
                 VALUES (?1, ?2, ?3, 0)
                 ON CONFLICT(user_id, key_id) DO UPDATE SET public_key = excluded.public_key",
                params![user_id, otk.key_id, otk.public_key],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn count_unconsumed_one_time_prekeys(&self, user_id: &str) -> Result<usize, RelayError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM relay_one_time_prekeys WHERE user_id = ?1 AND consumed = 0",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    pub fn insert_message(
        &self,
        from_user: &str,
        to_user: &str,
        content: &str,
        timestamp_unix_ms: i64,
    ) -> Result<i64, RelayError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO relay_messages (from_user, to_user, content, timestamp_unix_ms, status)
             VALUES (?1, ?2, ?3, ?4, 'sent')",
            params![from_user, to_user, content, timestamp_unix_ms],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn messages_since(
        &self,
        user_id: &str,
        since_unix_ms: i64,
    ) -> Result<Vec<RelayMessageRow>, RelayError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, from_user, to_user, content, timestamp_unix_ms, status
             FROM relay_messages WHERE to_user = ?1 AND timestamp_unix_ms > ?2
             ORDER BY timestamp_unix_ms ASC",
        )?;
        let rows = stmt.query_map(params![user_id, since_unix_ms], |row| {
            Ok(RelayMessageRow {
                id: row.get(0)?,
                from_user: row.get(1)?,
                to_user: row.get(2)?,
                content: row.get(3)?,
                timestamp_unix_ms: row.get(4)?,
                status: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn ack_message(&self, id: i64, status: &str) -> Result<bool, RelayError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE relay_messages SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        Ok(updated > 0)
    }
}

#[derive(Debug, Clone)]
pub struct RelayMessageRow {
    pub id: i64,
    pub from_user: String,
    pub to_user: String,
    pub content: String,
    pub timestamp_unix_ms: i64,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_signed_prekey() -> SignedPrekeyPublic {
        SignedPrekeyPublic {
            key_id: 1,
            public_key: "pub".to_string(),
            signature: "sig".to_string(),
        }
    }

    #[test]
    fn schema_survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sqlite3");
        let path_str = path.to_str().unwrap();

        {
            let db = RelayDb::open(path_str).unwrap();
            db.upsert_bundle("bob", "idkey", "signkey", &sample_signed_prekey(), &[], 0)
                .unwrap();
        }

        let reopened = RelayDb::open(path_str).unwrap();
        assert!(reopened.user_exists("bob").unwrap());
    }

    #[test]
    fn fetch_bundle_consumes_one_time_prekey() {
        let db = RelayDb::open_in_memory().unwrap();
        let otk = OneTimePrekeyPublic {
            key_id: 42,
            public_key: "otkpub".to_string(),
        };
        db.upsert_bundle("bob", "idkey", "signkey", &sample_signed_prekey(), &[otk], 0)
            .unwrap();
        assert_eq!(db.count_unconsumed_one_time_prekeys("bob").unwrap(), 1);

        let bundle = db.fetch_bundle("bob").unwrap().unwrap();
        assert_eq!(bundle.one_time_prekey.unwrap().key_id, 42);
        assert_eq!(db.count_unconsumed_one_time_prekeys("bob").unwrap(), 0);

        let second = db.fetch_bundle("bob").unwrap().unwrap();
        assert!(second.one_time_prekey.is_none());
    }

    #[test]
    fn messages_are_inserted_and_polled_by_recipient() {
        let db = RelayDb::open_in_memory().unwrap();
        let id = db.insert_message("alice", "bob", "{}", 100).unwrap();
        assert!(db.messages_since("bob", 0).unwrap().iter().any(|m| m.id == id));
        assert!(db.messages_since("bob", 100).unwrap().is_empty());
        assert!(db.messages_since("alice", 0).unwrap().is_empty());
    }

    #[test]
    fn acking_unknown_message_reports_false() {
        let db = RelayDb::open_in_memory().unwrap();
        assert!(!db.ack_message(999, "delivered").unwrap());
    }
}
