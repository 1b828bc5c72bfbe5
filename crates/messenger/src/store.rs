//! Durable, per-identity message store.
//!
//! SQLite with two connection pools: a single-connection writer pool (SQLite
//! write lock) and a multi-connection reader pool. Sensitive fields
//! (content, attachment, reply-to, reactions) are encrypted at rest with a
//! key derived from the owning identity's public key; plaintext metadata
//! (ids, timestamps, status, keys, retry counts) is stored alongside for
//! querying.
//!
//! All writes are idempotent under replay: the same id overwrites, never
//! duplicates.

use crate::error::StoreError;
use crate::message::{
    Attachment, Message, MessageDirection, MessageStatus, OutgoingMessage, Reaction,
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bitcoin::hashes::{sha256, Hash};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use tracing::{debug, info};

const NONCE_SIZE: usize = 24;
const KEY_DOMAIN: &[u8] = b"nostr-messenger:at-rest:v1:";

type StoreResult<T> = std::result::Result<T, StoreError>;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    pub path: PathBuf,
    /// Retention cap per conversation
    pub max_messages_per_conversation: usize,
    /// Retry budget used when selecting due outbox entries
    pub max_queue_retries: u32,
    /// Maximum number of reader connections
    pub max_reader_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("messenger.db"),
            max_messages_per_conversation: 500,
            max_queue_retries: 5,
            max_reader_connections: 4,
        }
    }
}

/// Query window for conversation reads. Results are newest-first.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Only messages strictly older than this unix timestamp
    pub before: Option<u64>,
    /// Only messages strictly newer than this unix timestamp
    pub after: Option<u64>,
}

/// Aggregate storage counters for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUsage {
    pub message_count: u64,
    pub conversation_count: u64,
    pub queued_count: u64,
}

struct ConnectionPool {
    writer: Pool<SqliteConnectionManager>,
    reader: Pool<SqliteConnectionManager>,
}

impl ConnectionPool {
    fn new(config: &StoreConfig) -> StoreResult<Self> {
        // Single writer connection; SQLite serializes writes anyway
        let writer = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::file(&config.path))?;
        let reader = Pool::builder()
            .max_size(config.max_reader_connections)
            .build(SqliteConnectionManager::file(&config.path))?;
        Ok(Self { writer, reader })
    }

    fn writer(&self) -> StoreResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.writer.get()?)
    }

    fn reader(&self) -> StoreResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.reader.get()?)
    }
}

/// Durable message store scoped to one identity.
pub struct MessageStore {
    pool: ConnectionPool,
    config: StoreConfig,
    at_rest_key: [u8; 32],
}

impl MessageStore {
    /// Open (or create) the store for an identity.
    pub fn open(config: StoreConfig, identity_pubkey: &str) -> StoreResult<Self> {
        let pool = ConnectionPool::new(&config)?;

        {
            let conn = pool.writer()?;
            Self::init_schema(&conn)?;
        }

        let mut material = Vec::with_capacity(KEY_DOMAIN.len() + identity_pubkey.len());
        material.extend_from_slice(KEY_DOMAIN);
        material.extend_from_slice(identity_pubkey.as_bytes());
        let at_rest_key = sha256::Hash::hash(&material).to_byte_array();

        info!("Message store opened at {:?}", config.path);
        Ok(Self {
            pool,
            config,
            at_rest_key,
        })
    }

    fn init_schema(conn: &Connection) -> StoreResult<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                direction TEXT NOT NULL,
                status TEXT NOT NULL,
                sender_key TEXT NOT NULL,
                recipient_key TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                content_enc TEXT NOT NULL,
                attachment_enc TEXT,
                reply_to_enc TEXT,
                reactions_enc TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages(conversation_id, timestamp)",
            [],
        )?;

        // Ordered per-conversation index; kept in lockstep with messages
        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversation_index (
                conversation_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                PRIMARY KEY (conversation_id, message_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_conversation_index_ts
             ON conversation_index(conversation_id, timestamp)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS outbox (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                recipient_key TEXT NOT NULL,
                content_enc TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at INTEGER NOT NULL,
                event_json TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_outbox_due ON outbox(next_retry_at)",
            [],
        )?;

        debug!("Store schema initialized");
        Ok(())
    }

    // --- at-rest field crypto ---

    fn encrypt_field(&self, plaintext: &str) -> StoreResult<String> {
        let cipher = XChaCha20Poly1305::new((&self.at_rest_key).into());
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| StoreError::Encrypt)?;

        let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(payload))
    }

    fn decrypt_field(&self, payload: &str) -> StoreResult<String> {
        let bytes = BASE64.decode(payload).map_err(|_| StoreError::Decrypt)?;
        if bytes.len() <= NONCE_SIZE {
            return Err(StoreError::Decrypt);
        }
        let cipher = XChaCha20Poly1305::new((&self.at_rest_key).into());
        let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
        let plaintext = cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| StoreError::Decrypt)
    }

    fn encrypt_json<T: serde::Serialize>(&self, value: &Option<T>) -> StoreResult<Option<String>> {
        match value {
            Some(v) => {
                let json = serde_json::to_string(v)?;
                Ok(Some(self.encrypt_field(&json)?))
            }
            None => Ok(None),
        }
    }

    fn decrypt_json<T: serde::de::DeserializeOwned>(
        &self,
        payload: &Option<String>,
    ) -> StoreResult<Option<T>> {
        match payload {
            Some(p) => {
                let json = self.decrypt_field(p)?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    // --- messages ---

    /// Persist a message and update the conversation index.
    ///
    /// Enforces the per-conversation retention cap: inserting beyond the cap
    /// evicts the oldest entries from both tables in the same transaction.
    pub fn persist_message(&self, msg: &Message) -> StoreResult<()> {
        let content_enc = self.encrypt_field(&msg.content)?;
        let attachment_enc = self.encrypt_json(&msg.attachment)?;
        let reply_to_enc = match &msg.reply_to {
            Some(r) => Some(self.encrypt_field(r)?),
            None => None,
        };
        let reactions_enc = if msg.reactions.is_empty() {
            None
        } else {
            Some(self.encrypt_field(&serde_json::to_string(&msg.reactions)?)?)
        };

        let mut conn = self.pool.writer()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR REPLACE INTO messages
             (id, conversation_id, timestamp, direction, status, sender_key,
              recipient_key, retry_count, content_enc, attachment_enc,
              reply_to_enc, reactions_enc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                msg.id,
                msg.conversation_id,
                msg.timestamp as i64,
                msg.direction.as_str(),
                msg.status.as_str(),
                msg.sender_key,
                msg.recipient_key,
                msg.retry_count,
                content_enc,
                attachment_enc,
                reply_to_enc,
                reactions_enc,
            ],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO conversation_index
             (conversation_id, message_id, timestamp)
             VALUES (?1, ?2, ?3)",
            params![msg.conversation_id, msg.id, msg.timestamp as i64],
        )?;

        // Retention cap: evict oldest beyond the limit, atomically with the
        // insert so the index never dangles
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM conversation_index WHERE conversation_id = ?1",
            params![msg.conversation_id],
            |row| row.get(0),
        )?;
        let cap = self.config.max_messages_per_conversation as i64;
        if count > cap {
            let overflow = count - cap;
            let mut stmt = tx.prepare(
                "SELECT message_id FROM conversation_index
                 WHERE conversation_id = ?1
                 ORDER BY timestamp ASC, message_id ASC
                 LIMIT ?2",
            )?;
            let evict: Vec<String> = stmt
                .query_map(params![msg.conversation_id, overflow], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            drop(stmt);

            for id in &evict {
                tx.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
                tx.execute(
                    "DELETE FROM conversation_index
                     WHERE conversation_id = ?1 AND message_id = ?2",
                    params![msg.conversation_id, id],
                )?;
            }
            debug!(
                "Evicted {} oldest messages from conversation {}",
                evict.len(),
                msg.conversation_id
            );
        }

        tx.commit()?;
        Ok(())
    }

    /// Update a message's delivery status. Returns false if the id is unknown.
    pub fn update_message_status(&self, id: &str, status: MessageStatus) -> StoreResult<bool> {
        let conn = self.pool.writer()?;
        let changed = conn.execute(
            "UPDATE messages SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(changed > 0)
    }

    /// Update a message's retry count.
    pub fn update_message_retry_count(&self, id: &str, retry_count: u32) -> StoreResult<bool> {
        let conn = self.pool.writer()?;
        let changed = conn.execute(
            "UPDATE messages SET retry_count = ?1 WHERE id = ?2",
            params![retry_count, id],
        )?;
        Ok(changed > 0)
    }

    /// Fetch one message by id.
    pub fn get_message(&self, id: &str) -> StoreResult<Option<Message>> {
        let conn = self.pool.reader()?;
        let row = conn
            .query_row(
                "SELECT id, conversation_id, timestamp, direction, status,
                        sender_key, recipient_key, retry_count, content_enc,
                        attachment_enc, reply_to_enc, reactions_enc
                 FROM messages WHERE id = ?1",
                params![id],
                Self::read_raw_row,
            )
            .optional()?;

        match row {
            Some(raw) => Ok(Some(self.decode_row(raw)?)),
            None => Ok(None),
        }
    }

    /// Fetch messages for a conversation, newest-first, then sliced by the
    /// query window.
    pub fn get_messages(
        &self,
        conversation_id: &str,
        query: &MessageQuery,
    ) -> StoreResult<Vec<Message>> {
        let before = query.before.map(|t| t as i64).unwrap_or(i64::MAX);
        let after = query.after.map(|t| t as i64).unwrap_or(-1);
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
        let offset = query.offset.map(|o| o as i64).unwrap_or(0);

        let conn = self.pool.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, timestamp, direction, status,
                    sender_key, recipient_key, retry_count, content_enc,
                    attachment_enc, reply_to_enc, reactions_enc
             FROM messages
             WHERE conversation_id = ?1 AND timestamp < ?2 AND timestamp > ?3
             ORDER BY timestamp DESC, id ASC
             LIMIT ?4 OFFSET ?5",
        )?;
        let rows: Vec<RawRow> = stmt
            .query_map(
                params![conversation_id, before, after, limit, offset],
                Self::read_raw_row,
            )?
            .collect::<rusqlite::Result<_>>()?;

        rows.into_iter().map(|r| self.decode_row(r)).collect()
    }

    /// Most recent incoming message timestamp, used as the default sync
    /// watermark.
    pub fn latest_incoming_timestamp(&self) -> StoreResult<Option<u64>> {
        let conn = self.pool.reader()?;
        let ts: Option<i64> = conn.query_row(
            "SELECT MAX(timestamp) FROM messages WHERE direction = 'incoming'",
            [],
            |row| row.get(0),
        )?;
        Ok(ts.map(|t| t as u64))
    }

    /// Purge messages older than the cutoff across all conversations.
    /// Returns the number purged.
    pub fn cleanup_old_messages(&self, cutoff: u64) -> StoreResult<usize> {
        let mut conn = self.pool.writer()?;
        let tx = conn.transaction()?;
        let purged = tx.execute(
            "DELETE FROM messages WHERE timestamp < ?1",
            params![cutoff as i64],
        )?;
        tx.execute(
            "DELETE FROM conversation_index WHERE timestamp < ?1",
            params![cutoff as i64],
        )?;
        tx.commit()?;
        if purged > 0 {
            info!("Purged {} messages older than {}", purged, cutoff);
        }
        Ok(purged)
    }

    /// Aggregate counters for observability.
    pub fn storage_usage(&self) -> StoreResult<StorageUsage> {
        let conn = self.pool.reader()?;
        let message_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        let conversation_count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT conversation_id) FROM conversation_index",
            [],
            |row| row.get(0),
        )?;
        let queued_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(StorageUsage {
            message_count: message_count as u64,
            conversation_count: conversation_count as u64,
            queued_count: queued_count as u64,
        })
    }

    /// Ids of index entries for a conversation, oldest first. Used by tests
    /// to check the index never dangles.
    pub fn conversation_index_ids(&self, conversation_id: &str) -> StoreResult<Vec<String>> {
        let conn = self.pool.reader()?;
        let mut stmt = conn.prepare(
            "SELECT message_id FROM conversation_index
             WHERE conversation_id = ?1 ORDER BY timestamp ASC, message_id ASC",
        )?;
        let ids = stmt
            .query_map(params![conversation_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids)
    }

    // --- outbox ---

    /// Queue an outgoing message for later delivery.
    pub fn queue_outgoing(&self, out: &OutgoingMessage) -> StoreResult<()> {
        let content_enc = self.encrypt_field(&out.content)?;
        let event_json = match &out.event {
            Some(e) => Some(serde_json::to_string(e)?),
            None => None,
        };

        let conn = self.pool.writer()?;
        conn.execute(
            "INSERT OR REPLACE INTO outbox
             (id, conversation_id, recipient_key, content_enc, created_at,
              retry_count, next_retry_at, event_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                out.id,
                out.conversation_id,
                out.recipient_key,
                content_enc,
                out.created_at as i64,
                out.retry_count,
                out.next_retry_at as i64,
                event_json,
            ],
        )?;
        Ok(())
    }

    /// Outbox entries due for redelivery: `next_retry_at <= now` and retry
    /// budget not exhausted. Oldest first.
    pub fn get_queued_messages(&self, now_ms: u64) -> StoreResult<Vec<OutgoingMessage>> {
        let conn = self.pool.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, recipient_key, content_enc,
                    created_at, retry_count, next_retry_at, event_json
             FROM outbox
             WHERE next_retry_at <= ?1 AND retry_count < ?2
             ORDER BY created_at ASC",
        )?;

        struct RawOut {
            id: String,
            conversation_id: String,
            recipient_key: String,
            content_enc: String,
            created_at: i64,
            retry_count: u32,
            next_retry_at: i64,
            event_json: Option<String>,
        }

        // Clamp so a flush-everything sentinel does not wrap negative
        let now_ms = now_ms.min(i64::MAX as u64) as i64;
        let rows: Vec<RawOut> = stmt
            .query_map(
                params![now_ms, self.config.max_queue_retries],
                |row| {
                    Ok(RawOut {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        recipient_key: row.get(2)?,
                        content_enc: row.get(3)?,
                        created_at: row.get(4)?,
                        retry_count: row.get(5)?,
                        next_retry_at: row.get(6)?,
                        event_json: row.get(7)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<_>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for raw in rows {
            let event = match &raw.event_json {
                Some(json) => Some(serde_json::from_str(json)?),
                None => None,
            };
            out.push(OutgoingMessage {
                id: raw.id,
                conversation_id: raw.conversation_id,
                recipient_key: raw.recipient_key,
                content: self.decrypt_field(&raw.content_enc)?,
                created_at: raw.created_at as u64,
                retry_count: raw.retry_count,
                next_retry_at: raw.next_retry_at as u64,
                event,
            });
        }
        Ok(out)
    }

    /// Queued message ids for one conversation, regardless of due time.
    pub fn queued_ids_for_conversation(&self, conversation_id: &str) -> StoreResult<Vec<String>> {
        let conn = self.pool.reader()?;
        let mut stmt =
            conn.prepare("SELECT id FROM outbox WHERE conversation_id = ?1")?;
        let ids = stmt
            .query_map(params![conversation_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids)
    }

    /// Update an outbox entry's retry bookkeeping.
    pub fn update_queue_retry(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: u64,
    ) -> StoreResult<bool> {
        let conn = self.pool.writer()?;
        let changed = conn.execute(
            "UPDATE outbox SET retry_count = ?1, next_retry_at = ?2 WHERE id = ?3",
            params![retry_count, next_retry_at as i64, id],
        )?;
        Ok(changed > 0)
    }

    /// Remove an entry from the outbox.
    pub fn remove_from_queue(&self, id: &str) -> StoreResult<bool> {
        let conn = self.pool.writer()?;
        let changed = conn.execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    // --- row decoding ---

    fn read_raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
        Ok(RawRow {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            timestamp: row.get(2)?,
            direction: row.get(3)?,
            status: row.get(4)?,
            sender_key: row.get(5)?,
            recipient_key: row.get(6)?,
            retry_count: row.get(7)?,
            content_enc: row.get(8)?,
            attachment_enc: row.get(9)?,
            reply_to_enc: row.get(10)?,
            reactions_enc: row.get(11)?,
        })
    }

    fn decode_row(&self, raw: RawRow) -> StoreResult<Message> {
        let direction = MessageDirection::parse(&raw.direction)
            .ok_or_else(|| StoreError::InvalidValue(format!("direction: {}", raw.direction)))?;
        let status = MessageStatus::parse(&raw.status)
            .ok_or_else(|| StoreError::InvalidValue(format!("status: {}", raw.status)))?;

        let attachment: Option<Attachment> = self.decrypt_json(&raw.attachment_enc)?;
        let reply_to = match &raw.reply_to_enc {
            Some(p) => Some(self.decrypt_field(p)?),
            None => None,
        };
        let reactions: Vec<Reaction> = match &raw.reactions_enc {
            Some(p) => serde_json::from_str(&self.decrypt_field(p)?)?,
            None => Vec::new(),
        };

        Ok(Message {
            id: raw.id,
            conversation_id: raw.conversation_id,
            content: self.decrypt_field(&raw.content_enc)?,
            timestamp: raw.timestamp as u64,
            direction,
            status,
            sender_key: raw.sender_key,
            recipient_key: raw.recipient_key,
            retry_count: raw.retry_count,
            attachment,
            reply_to,
            reactions,
        })
    }
}

struct RawRow {
    id: String,
    conversation_id: String,
    timestamp: i64,
    direction: String,
    status: String,
    sender_key: String,
    recipient_key: String,
    retry_count: u32,
    content_enc: String,
    attachment_enc: Option<String>,
    reply_to_enc: Option<String>,
    reactions_enc: Option<String>,
}
