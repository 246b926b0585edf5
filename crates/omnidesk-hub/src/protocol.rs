//! Hub WebSocket protocol — JSON messages between operator clients and
//! the server
//!
//! Closed enums on both directions; unknown client events fail to
//! parse and are ignored by the socket loop rather than being relayed.

use omnidesk_core::types::{ConnectionState, ConversationStatus, UnifiedMessage};
use serde::{Deserialize, Serialize};

/// Server → client event, tagged `{"event": ..., "data": ...}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// A message was persisted into a conversation (room-scoped)
    NewMessage(UnifiedMessage),
    /// Connector health change (all clients)
    #[serde(rename_all = "camelCase")]
    ChannelStatusChange {
        channel_id: String,
        state: ConnectionState,
    },
    #[serde(rename_all = "camelCase")]
    ConversationAssigned {
        conversation_id: String,
        agent_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ConversationStatusChange {
        conversation_id: String,
        status: ConversationStatus,
    },
    /// Transient typing relay, never persisted. `is_typing: false`
    /// signals the peer stopped typing.
    #[serde(rename_all = "camelCase")]
    Typing {
        conversation_id: String,
        agent_id: String,
        is_typing: bool,
    },
    /// Transient read-position relay, never persisted
    #[serde(rename_all = "camelCase")]
    MessagesRead {
        conversation_id: String,
        agent_id: String,
        message_ids: Vec<String>,
    },
}

/// Client → server command, same envelope shape
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientCommand {
    #[serde(rename_all = "camelCase")]
    JoinConversation { conversation_id: String },
    #[serde(rename_all = "camelCase")]
    LeaveConversation { conversation_id: String },
    #[serde(rename_all = "camelCase")]
    Typing {
        conversation_id: String,
        is_typing: bool,
    },
    #[serde(rename_all = "camelCase")]
    ReadMessages {
        conversation_id: String,
        message_ids: Vec<String>,
    },
}
