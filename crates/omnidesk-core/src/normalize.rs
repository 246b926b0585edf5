//! Message normalizer — provider-native payloads to the unified model
//!
//! Pure mapping, no I/O. Each provider has one deterministic extraction
//! of sender identity, display name, content, and content type. Shapes
//! the mapping does not recognize become `ContentType::Unknown` with
//! the original payload preserved under `metadata["raw"]`; nothing is
//! ever dropped here.

use crate::types::{ContentType, Direction, MessageStatus, ProviderType, UnifiedMessage};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value as JsonValue, json};
use uuid::Uuid;

/// Normalize a raw provider payload into a [`UnifiedMessage`] without a
/// conversation identity (filled in after identity resolution).
pub fn normalize(provider: ProviderType, channel_id: &str, raw: &JsonValue) -> UnifiedMessage {
    let extracted = match provider {
        ProviderType::Whatsapp => extract_whatsapp(raw),
        ProviderType::Facebook => extract_facebook(raw),
        ProviderType::Instagram => extract_instagram(raw),
    };

    match extracted {
        Some(e) => UnifiedMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: None,
            channel_id: channel_id.to_string(),
            channel_type: provider,
            sender_id: e.sender_id,
            sender_name: e.sender_name,
            content: e.content,
            content_type: e.content_type,
            direction: Direction::Inbound,
            status: MessageStatus::Delivered,
            timestamp: e.timestamp.unwrap_or_else(Utc::now),
            provider_message_id: e.provider_message_id,
            metadata: e.metadata,
        },
        // Unrecognized shape: keep the event, flag it unknown
        None => UnifiedMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: None,
            channel_id: channel_id.to_string(),
            channel_type: provider,
            sender_id: sender_fallback(raw),
            sender_name: None,
            content: String::new(),
            content_type: ContentType::Unknown,
            direction: Direction::Inbound,
            status: MessageStatus::Delivered,
            timestamp: Utc::now(),
            provider_message_id: None,
            metadata: Some(json!({ "raw": raw })),
        },
    }
}

struct Extracted {
    sender_id: String,
    sender_name: Option<String>,
    content: String,
    content_type: ContentType,
    timestamp: Option<DateTime<Utc>>,
    provider_message_id: Option<String>,
    metadata: Option<JsonValue>,
}

/// Best-effort sender id for unrecognized payloads, so identity
/// resolution still groups repeated garbage from one peer.
fn sender_fallback(raw: &JsonValue) -> String {
    for key in ["from", "senderID", "sender_id", "user_id"] {
        if let Some(s) = field_str(raw, key) {
            return s;
        }
    }
    "unknown".to_string()
}

fn field_str(raw: &JsonValue, key: &str) -> Option<String> {
    let v = raw.get(key)?;
    if let Some(s) = v.as_str() {
        if s.is_empty() {
            return None;
        }
        return Some(s.to_string());
    }
    // Instagram user ids arrive as bare numbers
    v.as_i64().map(|n| n.to_string())
}

// ── WhatsApp (web-client bridge payloads) ──

fn extract_whatsapp(raw: &JsonValue) -> Option<Extracted> {
    let sender_id = field_str(raw, "from")?;
    let body = raw.get("body").and_then(|v| v.as_str()).unwrap_or("");

    let content_type = match raw.get("type").and_then(|v| v.as_str()) {
        Some("chat") | Some("text") => ContentType::Text,
        Some("image") | Some("sticker") => ContentType::Image,
        Some("video") => ContentType::Video,
        Some("document") => ContentType::File,
        None if !body.is_empty() => ContentType::Text,
        _ => return None,
    };

    Some(Extracted {
        sender_id,
        sender_name: field_str(raw, "notifyName"),
        content: body.to_string(),
        content_type,
        // WhatsApp timestamps are unix seconds
        timestamp: raw
            .get("timestamp")
            .and_then(|v| v.as_i64())
            .and_then(|s| Utc.timestamp_opt(s, 0).single()),
        provider_message_id: field_str(raw, "id"),
        metadata: media_metadata(raw.get("media"), content_type),
    })
}

// ── Facebook Messenger (page inbox payloads) ──

fn extract_facebook(raw: &JsonValue) -> Option<Extracted> {
    let sender_id = field_str(raw, "senderID")?;
    let body = raw.get("body").and_then(|v| v.as_str()).unwrap_or("");
    let attachment = raw
        .get("attachments")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first());

    let content_type = match attachment.and_then(|a| a.get("type")).and_then(|v| v.as_str()) {
        Some("photo") => ContentType::Image,
        Some("video") => ContentType::Video,
        Some("file") | Some("audio") => ContentType::File,
        Some(_) => return None,
        None if !body.is_empty() => ContentType::Text,
        None => return None,
    };

    Some(Extracted {
        sender_id,
        sender_name: field_str(raw, "senderName"),
        content: body.to_string(),
        content_type,
        // Facebook timestamps are unix milliseconds
        timestamp: raw
            .get("timestamp")
            .and_then(|v| v.as_i64())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        provider_message_id: field_str(raw, "messageID"),
        metadata: media_metadata(attachment, content_type),
    })
}

// ── Instagram Direct (direct-thread item payloads) ──

fn extract_instagram(raw: &JsonValue) -> Option<Extracted> {
    let sender_id = field_str(raw, "user_id")?;
    let sender_name = raw
        .get("user")
        .and_then(|u| u.get("username"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let (content, content_type) = match raw.get("item_type").and_then(|v| v.as_str()) {
        Some("text") => (
            raw.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            ContentType::Text,
        ),
        Some("media") => {
            // media_type 1 = photo, 2 = video
            let kind = raw
                .get("media")
                .and_then(|m| m.get("media_type"))
                .and_then(|v| v.as_i64());
            match kind {
                Some(1) => (String::new(), ContentType::Image),
                Some(2) => (String::new(), ContentType::Video),
                _ => return None,
            }
        }
        Some("voice_media") => (String::new(), ContentType::File),
        _ => return None,
    };

    Some(Extracted {
        sender_id,
        sender_name,
        content,
        content_type,
        // Instagram timestamps are unix microseconds
        timestamp: raw
            .get("timestamp")
            .and_then(|v| v.as_i64())
            .and_then(|us| Utc.timestamp_micros(us).single()),
        provider_message_id: field_str(raw, "item_id"),
        metadata: media_metadata(raw.get("media"), content_type),
    })
}

fn media_metadata(media: Option<&JsonValue>, content_type: ContentType) -> Option<JsonValue> {
    if content_type == ContentType::Text {
        return None;
    }
    media.map(|m| json!({ "media": m }))
}
