//! SQLite persistence adapter.
//!
//! Three tables keyed by (user_id, mailbox), messages additionally by uid.
//! Every write is a single-statement upsert on the compound key; the store is
//! shared across processes and coherence rests on that atomicity plus the
//! UIDVALIDITY/UIDNEXT snapshots carried in the rows. Rows carry an optional
//! unix-seconds expiry swept by [`CacheStore::gc`].

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::codec;
use crate::codec::{IndexRow, ThreadRow};
use crate::error::CacheError;
use crate::flags;
use crate::types::{MessageHeaders, Uid};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Handle to the cache tables.
pub struct CacheStore {
    pool: DbPool,
}

impl CacheStore {
    /// Open (or create) the cache database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| CacheError::Store(format!("Failed to create database pool: {}", e)))?;

        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, CacheError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| CacheError::Store(format!("Failed to create database pool: {}", e)))?;

        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    fn connection(&self) -> Result<DbConnection, CacheError> {
        self.pool
            .get()
            .map_err(|e| CacheError::Store(format!("Failed to get database connection: {}", e)))
    }

    fn initialize_schema(&self) -> Result<(), CacheError> {
        let conn = self.connection()?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS cache_index (
                user_id TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                expires INTEGER,
                valid INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL,
                PRIMARY KEY (user_id, mailbox)
            );

            CREATE TABLE IF NOT EXISTS cache_thread (
                user_id TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                expires INTEGER,
                data TEXT NOT NULL,
                PRIMARY KEY (user_id, mailbox)
            );

            CREATE TABLE IF NOT EXISTS cache_messages (
                user_id TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                uid INTEGER NOT NULL,
                flags INTEGER NOT NULL DEFAULT 0,
                expires INTEGER,
                data TEXT NOT NULL,
                PRIMARY KEY (user_id, mailbox, uid)
            );

            CREATE INDEX IF NOT EXISTS idx_cache_index_expires ON cache_index(expires);
            CREATE INDEX IF NOT EXISTS idx_cache_thread_expires ON cache_thread(expires);
            CREATE INDEX IF NOT EXISTS idx_cache_messages_expires ON cache_messages(expires);
        "#,
        )
        .map_err(|e| CacheError::Store(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    /// Expiry timestamp for a row written now. `ttl_secs == 0` means never
    /// expires (NULL).
    pub fn expires_from_ttl(ttl_secs: u64) -> Option<i64> {
        if ttl_secs == 0 {
            None
        } else {
            Some(Utc::now().timestamp() + ttl_secs as i64)
        }
    }

    // ========== Index rows ==========

    pub fn select_index(
        &self,
        user_id: &str,
        mailbox: &str,
    ) -> Result<Option<IndexRow>, CacheError> {
        let conn = self.connection()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT data, valid FROM cache_index WHERE user_id = ?1 AND mailbox = ?2",
                params![user_id, mailbox],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(row.and_then(|(data, valid)| codec::decode_index(&data, valid != 0)))
    }

    pub fn upsert_index(
        &self,
        user_id: &str,
        mailbox: &str,
        row: &IndexRow,
        expires: Option<i64>,
    ) -> Result<(), CacheError> {
        let data = codec::encode_index(row)?;
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO cache_index (user_id, mailbox, expires, valid, data)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, mailbox) DO UPDATE SET
                expires = excluded.expires,
                valid = excluded.valid,
                data = excluded.data",
            params![user_id, mailbox, expires, row.valid as i64, data],
        )?;
        Ok(())
    }

    /// Flip the `valid` flag off without touching the row data, so the
    /// HIGHESTMODSEQ snapshot survives for a later incremental repair.
    pub fn set_index_invalid(
        &self,
        user_id: &str,
        mailbox: Option<&str>,
    ) -> Result<(), CacheError> {
        let conn = self.connection()?;
        match mailbox {
            Some(mailbox) => conn.execute(
                "UPDATE cache_index SET valid = 0 WHERE user_id = ?1 AND mailbox = ?2",
                params![user_id, mailbox],
            )?,
            None => conn.execute(
                "UPDATE cache_index SET valid = 0 WHERE user_id = ?1",
                params![user_id],
            )?,
        };
        Ok(())
    }

    pub fn delete_index(&self, user_id: &str, mailbox: Option<&str>) -> Result<(), CacheError> {
        let conn = self.connection()?;
        match mailbox {
            Some(mailbox) => conn.execute(
                "DELETE FROM cache_index WHERE user_id = ?1 AND mailbox = ?2",
                params![user_id, mailbox],
            )?,
            None => conn.execute("DELETE FROM cache_index WHERE user_id = ?1", params![user_id])?,
        };
        Ok(())
    }

    // ========== Thread rows ==========

    pub fn select_thread(
        &self,
        user_id: &str,
        mailbox: &str,
    ) -> Result<Option<ThreadRow>, CacheError> {
        let conn = self.connection()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM cache_thread WHERE user_id = ?1 AND mailbox = ?2",
                params![user_id, mailbox],
                |row| row.get(0),
            )
            .optional()?;

        Ok(data.and_then(|d| codec::decode_thread(&d)))
    }

    pub fn upsert_thread(
        &self,
        user_id: &str,
        mailbox: &str,
        row: &ThreadRow,
        expires: Option<i64>,
    ) -> Result<(), CacheError> {
        let data = codec::encode_thread(row)?;
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO cache_thread (user_id, mailbox, expires, data)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, mailbox) DO UPDATE SET
                expires = excluded.expires,
                data = excluded.data",
            params![user_id, mailbox, expires, data],
        )?;
        Ok(())
    }

    pub fn delete_thread(&self, user_id: &str, mailbox: Option<&str>) -> Result<(), CacheError> {
        let conn = self.connection()?;
        match mailbox {
            Some(mailbox) => conn.execute(
                "DELETE FROM cache_thread WHERE user_id = ?1 AND mailbox = ?2",
                params![user_id, mailbox],
            )?,
            None => {
                conn.execute("DELETE FROM cache_thread WHERE user_id = ?1", params![user_id])?
            }
        };
        Ok(())
    }

    // ========== Message rows ==========

    /// Load one message, merging the packed flag column back into the
    /// object. A corrupt blob reads as a miss.
    pub fn select_message(
        &self,
        user_id: &str,
        mailbox: &str,
        uid: Uid,
    ) -> Result<Option<MessageHeaders>, CacheError> {
        let conn = self.connection()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT data, flags FROM cache_messages
                 WHERE user_id = ?1 AND mailbox = ?2 AND uid = ?3",
                params![user_id, mailbox, uid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(row.and_then(|(data, bits)| {
            codec::decode_message(&data, uid).map(|mut msg| {
                msg.flags = flags::unpack(bits as u32);
                msg
            })
        }))
    }

    /// Load the subset of `uids` present in the store, keyed by UID.
    pub fn select_messages(
        &self,
        user_id: &str,
        mailbox: &str,
        uids: &[Uid],
    ) -> Result<HashMap<Uid, MessageHeaders>, CacheError> {
        if uids.is_empty() {
            return Ok(HashMap::new());
        }

        let conn = self.connection()?;
        let sql = format!(
            "SELECT uid, data, flags FROM cache_messages
             WHERE user_id = ?1 AND mailbox = ?2 AND uid IN ({})",
            uid_list(uids)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, mailbox], |row| {
            Ok((
                row.get::<_, i64>(0)? as Uid,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut found = HashMap::new();
        for row in rows {
            let (uid, data, bits) = row?;
            if let Some(mut msg) = codec::decode_message(&data, uid) {
                msg.flags = flags::unpack(bits as u32);
                found.insert(uid, msg);
            }
        }
        Ok(found)
    }

    /// All cached UIDs for a folder, ascending.
    pub fn select_message_uids(
        &self,
        user_id: &str,
        mailbox: &str,
    ) -> Result<Vec<Uid>, CacheError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT uid FROM cache_messages
             WHERE user_id = ?1 AND mailbox = ?2 ORDER BY uid",
        )?;
        let rows = stmt.query_map(params![user_id, mailbox], |row| {
            Ok(row.get::<_, i64>(0)? as Uid)
        })?;

        let mut uids = Vec::new();
        for row in rows {
            uids.push(row?);
        }
        Ok(uids)
    }

    /// Persist a message. The flag set is packed into the bitmap column and
    /// stripped from the stored clone; a body above `body_threshold` is
    /// stripped too.
    pub fn upsert_message(
        &self,
        user_id: &str,
        mailbox: &str,
        message: &MessageHeaders,
        body_threshold: usize,
        expires: Option<i64>,
    ) -> Result<(), CacheError> {
        let bits = flags::pack(message.flags.iter());

        let mut clone = message.clone();
        clone.flags.clear();
        if clone.body.as_ref().map_or(false, |b| b.len() > body_threshold) {
            clone.body = None;
        }
        let data = codec::encode_message(&clone)?;

        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO cache_messages (user_id, mailbox, uid, flags, expires, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id, mailbox, uid) DO UPDATE SET
                flags = excluded.flags,
                expires = excluded.expires,
                data = excluded.data",
            params![user_id, mailbox, message.uid, bits as i64, expires, data],
        )?;
        Ok(())
    }

    /// Overwrite a message's flag bitmap, skipping the write when the value
    /// is already current. Returns whether a row changed.
    pub fn update_message_flags(
        &self,
        user_id: &str,
        mailbox: &str,
        uid: Uid,
        bits: u32,
    ) -> Result<bool, CacheError> {
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE cache_messages SET flags = ?4
             WHERE user_id = ?1 AND mailbox = ?2 AND uid = ?3 AND flags <> ?4",
            params![user_id, mailbox, uid, bits as i64],
        )?;
        Ok(changed > 0)
    }

    /// Add or subtract one registry bit across a UID set. The guard keeps
    /// the statement a no-op for rows already in the target state.
    pub fn change_flag(
        &self,
        user_id: &str,
        mailbox: &str,
        uids: &[Uid],
        bit: u32,
        enabled: bool,
    ) -> Result<(), CacheError> {
        if uids.is_empty() {
            return Ok(());
        }

        let conn = self.connection()?;
        let sql = if enabled {
            format!(
                "UPDATE cache_messages SET flags = flags + ?3
                 WHERE user_id = ?1 AND mailbox = ?2 AND uid IN ({}) AND (flags & ?3) = 0",
                uid_list(uids)
            )
        } else {
            format!(
                "UPDATE cache_messages SET flags = flags - ?3
                 WHERE user_id = ?1 AND mailbox = ?2 AND uid IN ({}) AND (flags & ?3) = ?3",
                uid_list(uids)
            )
        };
        let changed = conn.execute(&sql, params![user_id, mailbox, bit as i64])?;
        debug!("change_flag bit {} on {} rows in {}", bit, changed, mailbox);
        Ok(())
    }

    /// Delete messages: all for the user (no mailbox), all in a folder (no
    /// uids), or an explicit UID list.
    pub fn delete_messages(
        &self,
        user_id: &str,
        mailbox: Option<&str>,
        uids: Option<&[Uid]>,
    ) -> Result<(), CacheError> {
        let conn = self.connection()?;
        match (mailbox, uids) {
            (None, _) => {
                conn.execute("DELETE FROM cache_messages WHERE user_id = ?1", params![user_id])?;
            }
            (Some(mailbox), None) => {
                conn.execute(
                    "DELETE FROM cache_messages WHERE user_id = ?1 AND mailbox = ?2",
                    params![user_id, mailbox],
                )?;
            }
            (Some(mailbox), Some(uids)) => {
                if uids.is_empty() {
                    return Ok(());
                }
                let sql = format!(
                    "DELETE FROM cache_messages
                     WHERE user_id = ?1 AND mailbox = ?2 AND uid IN ({})",
                    uid_list(uids)
                );
                conn.execute(&sql, params![user_id, mailbox])?;
            }
        }
        Ok(())
    }

    // ========== Expiry ==========

    /// Sweep expired rows from all three tables. Rows with NULL expiry are
    /// retained. Safe to run concurrently with live sessions.
    pub fn gc(&self) -> Result<(), CacheError> {
        let now = Utc::now().timestamp();
        let conn = self.connection()?;
        let mut removed = 0;
        for table in ["cache_index", "cache_thread", "cache_messages"] {
            let sql = format!(
                "DELETE FROM {} WHERE expires IS NOT NULL AND expires < ?1",
                table
            );
            removed += conn.execute(&sql, params![now])?;
        }
        if removed > 0 {
            debug!("gc removed {} expired cache rows", removed);
        }
        Ok(())
    }
}

/// Render a UID set as a SQL IN-list. UIDs are numeric so direct
/// interpolation is safe.
fn uid_list(uids: &[Uid]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
