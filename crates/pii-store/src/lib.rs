//! Document-store abstraction (§1 "assumed: transactional single-document
//! ops and ordered collection scans") backing the aggregator's
//! conversation root and utterances sub-collection (§3, §4.3).
//!
//! The aggregator is the exclusive owner of this store (§3 "Ownership").

use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::sync::Mutex;

use pii_core::error::{PiiError, Result};
use pii_core::types::{ConversationRoot, PersistedUtterance};

/// Conversation-root + utterances-subcollection persistence, modeling
/// `conversations_in_progress/<id>` and `conversations/<id>/utterances/<idx>`
/// from §3/§4.3.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Idempotently persist one utterance (the document id IS
    /// `original_entry_index`, §4.3) and recompute the conversation root's
    /// `utterance_count`/`last_utterance_timestamp`/`expire_at` from the
    /// persisted rows — redelivery of the same index never increments the
    /// count twice (I1, I5).
    async fn record_utterance(
        &self,
        utterance: &PersistedUtterance,
        context_ttl_seconds: u64,
        now_unix: i64,
    ) -> Result<ConversationRoot>;

    async fn get_conversation_root(&self, conversation_id: &str) -> Result<Option<ConversationRoot>>;

    /// Utterances for `conversation_id`, ordered ascending by
    /// `original_entry_index` (§4.3 "Scan the utterances sub-collection").
    async fn list_utterances_ordered(&self, conversation_id: &str) -> Result<Vec<PersistedUtterance>>;

    /// Delete the sub-collection and the conversation root (§4.3 "On
    /// successful write, delete the sub-collection and the conversation
    /// root").
    async fn delete_conversation(&self, conversation_id: &str) -> Result<()>;
}

pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
}

impl SqliteDocumentStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::new(conn)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS utterances (
            conversation_id       TEXT NOT NULL,
            original_entry_index  INTEGER NOT NULL,
            participant_role      TEXT NOT NULL,
            user_id               TEXT,
            text                  TEXT NOT NULL,
            start_timestamp_usec  INTEGER NOT NULL,
            received_at           TEXT NOT NULL,
            PRIMARY KEY (conversation_id, original_entry_index)
        );
        CREATE TABLE IF NOT EXISTS conversations_in_progress (
            conversation_id          TEXT PRIMARY KEY,
            utterance_count          INTEGER NOT NULL,
            last_utterance_timestamp INTEGER NOT NULL,
            expire_at                INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn record_utterance(
        &self,
        utterance: &PersistedUtterance,
        context_ttl_seconds: u64,
        now_unix: i64,
    ) -> Result<ConversationRoot> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        // INSERT OR IGNORE: the document id is (conversation_id, index), so a
        // redelivered utterance is a silent no-op (§4.3, I5).
        tx.execute(
            "INSERT OR IGNORE INTO utterances
             (conversation_id, original_entry_index, participant_role, user_id, text, start_timestamp_usec, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                utterance.conversation_id,
                utterance.original_entry_index as i64,
                utterance.participant_role,
                utterance.user_id,
                utterance.text,
                utterance.start_timestamp_usec,
                utterance.received_at,
            ],
        )?;

        let (count, max_ts): (i64, i64) = tx.query_row(
            "SELECT COUNT(*), COALESCE(MAX(start_timestamp_usec), 0)
             FROM utterances WHERE conversation_id = ?1",
            params![utterance.conversation_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let expire_at = now_unix + context_ttl_seconds as i64;

        tx.execute(
            "INSERT INTO conversations_in_progress (conversation_id, utterance_count, last_utterance_timestamp, expire_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(conversation_id) DO UPDATE SET
                utterance_count = excluded.utterance_count,
                last_utterance_timestamp = excluded.last_utterance_timestamp,
                expire_at = excluded.expire_at",
            params![utterance.conversation_id, count, max_ts, expire_at],
        )?;

        tx.commit()?;

        Ok(ConversationRoot {
            conversation_id: utterance.conversation_id.clone(),
            utterance_count: count as u64,
            last_utterance_timestamp: max_ts,
            expire_at,
        })
    }

    async fn get_conversation_root(&self, conversation_id: &str) -> Result<Option<ConversationRoot>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT conversation_id, utterance_count, last_utterance_timestamp, expire_at
             FROM conversations_in_progress WHERE conversation_id = ?1",
            params![conversation_id],
            |row| {
                Ok(ConversationRoot {
                    conversation_id: row.get(0)?,
                    utterance_count: row.get::<_, i64>(1)? as u64,
                    last_utterance_timestamp: row.get(2)?,
                    expire_at: row.get(3)?,
                })
            },
        ) {
            Ok(root) => Ok(Some(root)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(PiiError::Internal(format!("document store query failed: {e}"))),
        }
    }

    async fn list_utterances_ordered(&self, conversation_id: &str) -> Result<Vec<PersistedUtterance>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT conversation_id, original_entry_index, participant_role, user_id, text, start_timestamp_usec, received_at
             FROM utterances WHERE conversation_id = ?1 ORDER BY original_entry_index ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok(PersistedUtterance {
                conversation_id: row.get(0)?,
                original_entry_index: row.get::<_, i64>(1)? as u64,
                participant_role: row.get(2)?,
                user_id: row.get(3)?,
                text: row.get(4)?,
                start_timestamp_usec: row.get(5)?,
                received_at: row.get(6)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM utterances WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        conn.execute(
            "DELETE FROM conversations_in_progress WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(())
    }
}
