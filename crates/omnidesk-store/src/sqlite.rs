//! SQLite-backed conversation store (thread-safe via Arc<Mutex>)

use async_trait::async_trait;
use chrono::Utc;
use omnidesk_core::error::StoreError;
use omnidesk_core::store::ConversationStore;
use omnidesk_core::types::{
    Client, Conversation, ConversationStatus, Direction, MessageStatus, ProviderType,
    UnifiedMessage,
};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn map_db_err(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict
        }
        _ => StoreError::Database(e.to_string()),
    }
}

fn join_err(e: tokio::task::JoinError) -> StoreError {
    StoreError::Database(format!("blocking task panicked: {e}"))
}

fn lock_conn(conn: &Mutex<Connection>) -> std::sync::MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| {
        warn!("Database mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

impl SqliteStore {
    /// Open (or create) the database and initialize the schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).map_err(map_db_err)?;
        info!("Initializing conversation database at {:?}", path.as_ref());

        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(map_db_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS clients (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                channel_ids TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(map_db_err)?;

        // One external identity per provider per client; the resolver's
        // optimistic insert relies on these racing to Conflict
        for provider in ["whatsapp", "facebook", "instagram"] {
            conn.execute(
                &format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS idx_clients_{provider}
                     ON clients(json_extract(channel_ids, '$.{provider}'))
                     WHERE json_extract(channel_ids, '$.{provider}') IS NOT NULL"
                ),
                [],
            )
            .map_err(map_db_err)?;
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                last_message_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(channel_id, client_id),
                FOREIGN KEY(client_id) REFERENCES clients(id)
            )",
            [],
        )
        .map_err(map_db_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                channel_type TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                sender_name TEXT,
                content TEXT NOT NULL,
                content_type TEXT NOT NULL,
                direction TEXT NOT NULL,
                status TEXT NOT NULL,
                provider_message_id TEXT,
                metadata TEXT,
                sent_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY(conversation_id) REFERENCES conversations(id)
            )",
            [],
        )
        .map_err(map_db_err)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages(conversation_id, created_at)",
            [],
        )
        .map_err(map_db_err)?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_provider_id
             ON messages(provider_message_id)",
            [],
        )
        .map_err(map_db_err)?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_conversations_channel
             ON conversations(channel_id)",
            [],
        )
        .map_err(map_db_err)?;

        debug!("Conversation database schema initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_client(row: &rusqlite::Row) -> rusqlite::Result<Client> {
        let channel_ids_str: String = row.get(2)?;
        let channel_ids: HashMap<ProviderType, String> = serde_json::from_str(&channel_ids_str)
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
        Ok(Client {
            id: row.get(0)?,
            name: row.get(1)?,
            channel_ids,
            created_at: row.get::<_, String>(3)?.parse().unwrap_or_else(|_| Utc::now()),
        })
    }

    fn row_to_conversation(row: &rusqlite::Row) -> rusqlite::Result<Conversation> {
        let status_str: String = row.get(3)?;
        Ok(Conversation {
            id: row.get(0)?,
            channel_id: row.get(1)?,
            client_id: row.get(2)?,
            status: ConversationStatus::from_string(&status_str)
                .unwrap_or(ConversationStatus::Pending),
            last_message_at: row.get::<_, String>(4)?.parse().unwrap_or_else(|_| Utc::now()),
            created_at: row.get::<_, String>(5)?.parse().unwrap_or_else(|_| Utc::now()),
        })
    }

    fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<UnifiedMessage> {
        let metadata_str: Option<String> = row.get(11)?;
        let metadata = metadata_str
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    11,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
        let channel_type_str: String = row.get(3)?;
        let direction_str: String = row.get(8)?;
        let status_str: String = row.get(9)?;
        let content_type_str: String = row.get(7)?;
        Ok(UnifiedMessage {
            id: row.get(0)?,
            conversation_id: Some(row.get(1)?),
            channel_id: row.get(2)?,
            channel_type: ProviderType::from_string(&channel_type_str)
                .unwrap_or(ProviderType::Whatsapp),
            sender_id: row.get(4)?,
            sender_name: row.get(5)?,
            content: row.get(6)?,
            content_type: omnidesk_core::types::ContentType::from_string(&content_type_str),
            direction: if direction_str == "outbound" {
                Direction::Outbound
            } else {
                Direction::Inbound
            },
            status: MessageStatus::from_string(&status_str).unwrap_or(MessageStatus::Delivered),
            timestamp: row.get::<_, String>(12)?.parse().unwrap_or_else(|_| Utc::now()),
            provider_message_id: row.get(10)?,
            metadata,
        })
    }
}

const CONVERSATION_COLS: &str =
    "id, channel_id, client_id, status, last_message_at, created_at";
const MESSAGE_COLS: &str = "id, conversation_id, channel_id, channel_type, sender_id, \
     sender_name, content, content_type, direction, status, provider_message_id, metadata, \
     sent_at, created_at";

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn find_conversation(
        &self,
        channel_id: &str,
        provider: ProviderType,
        external_sender_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let channel_id = channel_id.to_owned();
        let external_sender_id = external_sender_id.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = lock_conn(&conn);
            conn.query_row(
                &format!(
                    "SELECT c.id, c.channel_id, c.client_id, c.status, c.last_message_at, c.created_at
                     FROM conversations c
                     JOIN clients cl ON cl.id = c.client_id
                     WHERE c.channel_id = ?1
                       AND json_extract(cl.channel_ids, '$.{provider}') = ?2"
                ),
                params![&channel_id, &external_sender_id],
                Self::row_to_conversation,
            )
            .optional()
            .map_err(map_db_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let id = id.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = lock_conn(&conn);
            conn.query_row(
                &format!("SELECT {CONVERSATION_COLS} FROM conversations WHERE id = ?1"),
                params![&id],
                Self::row_to_conversation,
            )
            .optional()
            .map_err(map_db_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn get_client(&self, id: &str) -> Result<Option<Client>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let id = id.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = lock_conn(&conn);
            conn.query_row(
                "SELECT id, name, channel_ids, created_at FROM clients WHERE id = ?1",
                params![&id],
                Self::row_to_client,
            )
            .optional()
            .map_err(map_db_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn find_client(
        &self,
        provider: ProviderType,
        external_sender_id: &str,
    ) -> Result<Option<Client>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let external_sender_id = external_sender_id.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = lock_conn(&conn);
            conn.query_row(
                &format!(
                    "SELECT id, name, channel_ids, created_at FROM clients
                     WHERE json_extract(channel_ids, '$.{provider}') = ?1"
                ),
                params![&external_sender_id],
                Self::row_to_client,
            )
            .optional()
            .map_err(map_db_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn create_client(
        &self,
        name: &str,
        provider: ProviderType,
        external_sender_id: &str,
    ) -> Result<Client, StoreError> {
        let conn = Arc::clone(&self.conn);
        let name = name.to_owned();
        let external_sender_id = external_sender_id.to_owned();

        tokio::task::spawn_blocking(move || {
            let client = Client {
                id: Uuid::new_v4().to_string(),
                name,
                channel_ids: HashMap::from([(provider, external_sender_id)]),
                created_at: Utc::now(),
            };
            let channel_ids_json =
                serde_json::to_string(&client.channel_ids).map_err(|e| {
                    StoreError::Database(format!("failed to encode channel ids: {e}"))
                })?;

            let conn = lock_conn(&conn);
            conn.execute(
                "INSERT INTO clients (id, name, channel_ids, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    &client.id,
                    &client.name,
                    channel_ids_json,
                    client.created_at.to_rfc3339(),
                ],
            )
            .map_err(map_db_err)?;

            debug!("Inserted client {} ({})", client.name, client.id);
            Ok(client)
        })
        .await
        .map_err(join_err)?
    }

    async fn create_conversation(
        &self,
        channel_id: &str,
        client_id: &str,
    ) -> Result<Conversation, StoreError> {
        let conn = Arc::clone(&self.conn);
        let channel_id = channel_id.to_owned();
        let client_id = client_id.to_owned();

        tokio::task::spawn_blocking(move || {
            let now = Utc::now();
            let conv = Conversation {
                id: Uuid::new_v4().to_string(),
                channel_id,
                client_id,
                status: ConversationStatus::Pending,
                last_message_at: now,
                created_at: now,
            };
            let conn = lock_conn(&conn);
            conn.execute(
                "INSERT INTO conversations (id, channel_id, client_id, status, last_message_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    &conv.id,
                    &conv.channel_id,
                    &conv.client_id,
                    conv.status.as_str(),
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .map_err(map_db_err)?;

            debug!("Inserted conversation {} on {}", conv.id, conv.channel_id);
            Ok(conv)
        })
        .await
        .map_err(join_err)?
    }

    async fn append_message(
        &self,
        msg: &UnifiedMessage,
        conversation_id: &str,
    ) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        let msg = msg.clone();
        let conversation_id = conversation_id.to_owned();

        tokio::task::spawn_blocking(move || {
            let now = Utc::now();
            let metadata_json = msg
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| StoreError::Database(format!("failed to encode metadata: {e}")))?;

            let mut conn = lock_conn(&conn);
            let tx = conn.transaction().map_err(map_db_err)?;

            let updated = tx
                .execute(
                    "UPDATE conversations SET last_message_at = ?1 WHERE id = ?2",
                    params![now.to_rfc3339(), &conversation_id],
                )
                .map_err(map_db_err)?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!(
                    "conversation {conversation_id}"
                )));
            }

            tx.execute(
                "INSERT INTO messages (id, conversation_id, channel_id, channel_type, sender_id,
                     sender_name, content, content_type, direction, status, provider_message_id,
                     metadata, sent_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    &msg.id,
                    &conversation_id,
                    &msg.channel_id,
                    msg.channel_type.to_string(),
                    &msg.sender_id,
                    &msg.sender_name,
                    &msg.content,
                    msg.content_type.to_string(),
                    match msg.direction {
                        Direction::Inbound => "inbound",
                        Direction::Outbound => "outbound",
                    },
                    msg.status.as_str(),
                    &msg.provider_message_id,
                    metadata_json,
                    msg.timestamp.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .map_err(map_db_err)?;

            tx.commit().map_err(map_db_err)?;
            debug!("Appended message {} to conversation {}", msg.id, conversation_id);
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn update_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        let message_id = message_id.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = lock_conn(&conn);
            let updated = conn
                .execute(
                    "UPDATE messages SET status = ?1 WHERE id = ?2",
                    params![status.as_str(), &message_id],
                )
                .map_err(map_db_err)?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("message {message_id}")));
            }
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn update_message_status_by_provider_id(
        &self,
        provider_message_id: &str,
        status: MessageStatus,
    ) -> Result<Option<UnifiedMessage>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let provider_message_id = provider_message_id.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = lock_conn(&conn);
            let updated = conn
                .execute(
                    "UPDATE messages SET status = ?1 WHERE provider_message_id = ?2",
                    params![status.as_str(), &provider_message_id],
                )
                .map_err(map_db_err)?;
            if updated == 0 {
                return Ok(None);
            }
            conn.query_row(
                &format!(
                    "SELECT {MESSAGE_COLS} FROM messages WHERE provider_message_id = ?1"
                ),
                params![&provider_message_id],
                Self::row_to_message,
            )
            .optional()
            .map_err(map_db_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn set_provider_message_id(
        &self,
        message_id: &str,
        provider_message_id: &str,
    ) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        let message_id = message_id.to_owned();
        let provider_message_id = provider_message_id.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = lock_conn(&conn);
            let updated = conn
                .execute(
                    "UPDATE messages SET provider_message_id = ?1 WHERE id = ?2",
                    params![&provider_message_id, &message_id],
                )
                .map_err(map_db_err)?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("message {message_id}")));
            }
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn update_conversation_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        let id = id.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = lock_conn(&conn);
            let updated = conn
                .execute(
                    "UPDATE conversations SET status = ?1 WHERE id = ?2",
                    params![status.as_str(), &id],
                )
                .map_err(map_db_err)?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("conversation {id}")));
            }
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<UnifiedMessage>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let conversation_id = conversation_id.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = lock_conn(&conn);
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {MESSAGE_COLS} FROM messages
                     WHERE conversation_id = ?1
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?2"
                ))
                .map_err(map_db_err)?;
            let mut messages = stmt
                .query_map(params![&conversation_id, limit as i64], Self::row_to_message)
                .map_err(map_db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_db_err)?;
            // newest last for display order
            messages.reverse();
            Ok(messages)
        })
        .await
        .map_err(join_err)?
    }
}
