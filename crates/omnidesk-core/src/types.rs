//! Shared types for the omnidesk pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// External messaging provider a channel account belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Whatsapp,
    Facebook,
    Instagram,
}

impl ProviderType {
    /// Parse a provider type from a string (e.g., from config or stored JSON keys)
    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "whatsapp" => Some(Self::Whatsapp),
            "facebook" => Some(Self::Facebook),
            "instagram" => Some(Self::Instagram),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Whatsapp => write!(f, "whatsapp"),
            Self::Facebook => write!(f, "facebook"),
            Self::Instagram => write!(f, "instagram"),
        }
    }
}

/// Connection state of one channel adapter
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Normalized content kind of a message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
    Video,
    File,
    Unknown,
}

impl ContentType {
    pub fn from_string(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "text" => Self::Text,
            "image" => Self::Image,
            "video" => Self::Video,
            "file" => Self::File,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Image => write!(f, "image"),
            Self::Video => write!(f, "video"),
            Self::File => write!(f, "file"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Direction of a message relative to the operator side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Delivery status of a message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Lifecycle status of a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Pending,
    Active,
    Resolved,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Resolved => "resolved",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

/// Event emitted by a channel adapter onto the registry's aggregated stream.
///
/// `MessageReceived` carries the provider payload verbatim; normalization
/// happens downstream in the integration core, never in the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelEvent {
    StatusChanged {
        channel_id: String,
        state: ConnectionState,
    },
    MessageReceived {
        channel_id: String,
        provider: ProviderType,
        raw: JsonValue,
    },
    /// Out-of-band pairing data emitted while connecting (e.g., a WhatsApp
    /// pairing code). A side channel, not a connection state.
    Pairing {
        channel_id: String,
        code: String,
    },
    /// Asynchronous delivery/read confirmation for a previously sent message
    Receipt {
        channel_id: String,
        provider_message_id: String,
        status: MessageStatus,
    },
    Error {
        channel_id: String,
        cause: String,
        recoverable: bool,
    },
}

impl ChannelEvent {
    pub fn channel_id(&self) -> &str {
        match self {
            Self::StatusChanged { channel_id, .. }
            | Self::MessageReceived { channel_id, .. }
            | Self::Pairing { channel_id, .. }
            | Self::Receipt { channel_id, .. }
            | Self::Error { channel_id, .. } => channel_id,
        }
    }
}

/// Provider-agnostic representation of one message.
///
/// Produced by the normalizer without a conversation identity; the
/// integration core fills `conversation_id` after identity resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedMessage {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub channel_id: String,
    pub channel_type: ProviderType,
    pub sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    pub content_type: ContentType,
    pub direction: Direction,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

/// Stable person identity across channels.
///
/// `channel_ids` maps a provider to the external sender id on that
/// provider; at most one external id per provider per client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub name: String,
    pub channel_ids: HashMap<ProviderType, String>,
    pub created_at: DateTime<Utc>,
}

/// Ongoing thread between one client and one channel.
///
/// At most one conversation exists per `(channel_id, client_id)` pair;
/// the resolver and the store's uniqueness constraint uphold this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub channel_id: String,
    pub client_id: String,
    pub status: ConversationStatus,
    pub last_message_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Event emitted by the integration core toward the real-time hub
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// A message was persisted (or its status changed); fan out to the
    /// conversation's room.
    MessagePersisted(UnifiedMessage),
    /// Connector health change; broadcast globally.
    ChannelStatus {
        channel_id: String,
        state: ConnectionState,
    },
    /// An inbound event could not be persisted and was dead-lettered.
    /// Operational signal only, never delivered to operator sockets.
    ProcessingFailed {
        channel_id: String,
        reason: String,
    },
    ConversationAssigned {
        conversation_id: String,
        agent_id: String,
    },
    ConversationStatusChanged {
        conversation_id: String,
        status: ConversationStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_type_roundtrip() {
        for (s, p) in [
            ("whatsapp", ProviderType::Whatsapp),
            ("facebook", ProviderType::Facebook),
            ("instagram", ProviderType::Instagram),
        ] {
            assert_eq!(ProviderType::from_string(s), Some(p));
            assert_eq!(p.to_string(), s);
        }
        assert_eq!(ProviderType::from_string("telegram"), None);
    }

    #[test]
    fn test_unified_message_wire_shape() {
        let msg = UnifiedMessage {
            id: "m1".to_string(),
            conversation_id: Some("c1".to_string()),
            channel_id: "wa-1".to_string(),
            channel_type: ProviderType::Whatsapp,
            sender_id: "+511234".to_string(),
            sender_name: None,
            content: "hola".to_string(),
            content_type: ContentType::Text,
            direction: Direction::Inbound,
            status: MessageStatus::Delivered,
            timestamp: Utc::now(),
            provider_message_id: None,
            metadata: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["conversationId"], "c1");
        assert_eq!(json["channelType"], "whatsapp");
        assert_eq!(json["contentType"], "text");
        assert_eq!(json["status"], "delivered");
        // absent optionals are omitted from the wire
        assert!(json.get("senderName").is_none());
    }

    #[test]
    fn test_channel_event_channel_id() {
        let ev = ChannelEvent::StatusChanged {
            channel_id: "fb-1".to_string(),
            state: ConnectionState::Connected,
        };
        assert_eq!(ev.channel_id(), "fb-1");
        let ev = ChannelEvent::MessageReceived {
            channel_id: "ig-2".to_string(),
            provider: ProviderType::Instagram,
            raw: serde_json::json!({}),
        };
        assert_eq!(ev.channel_id(), "ig-2");
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(MessageStatus::from_string("failed"), Some(MessageStatus::Failed));
        assert_eq!(MessageStatus::from_string("bogus"), None);
        assert_eq!(ConversationStatus::from_string("pending"), Some(ConversationStatus::Pending));
    }
}
