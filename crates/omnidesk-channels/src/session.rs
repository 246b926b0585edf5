//! Provider session boundary
//!
//! A session owns the provider-specific transport and nothing else:
//! credentials, connection handshake, event intake, and outbound
//! delivery. Everything above this trait is provider-agnostic.

use async_trait::async_trait;
use omnidesk_core::error::{ConnectError, SendError};
use omnidesk_core::pipeline::ProviderMessageId;
use omnidesk_core::types::{ContentType, MessageStatus, ProviderType};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

/// Event emitted by a provider session toward its adapter.
///
/// `Payload` carries the provider-native message JSON verbatim; the
/// session never reshapes it. Normalization happens downstream.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Session is live and receiving
    Up,
    /// Session lost its connection but may come back
    Down,
    /// Session is dead and will not recover without a reconnect
    Fatal(String),
    /// Out-of-band pairing data surfaced while connecting
    Pairing(String),
    /// One provider-native inbound message, untouched
    Payload(JsonValue),
    /// Delivery/read confirmation for a previously sent message
    Receipt {
        provider_message_id: String,
        status: MessageStatus,
    },
}

/// One live connection to an external messaging provider.
///
/// `connect` performs the handshake and hands ongoing intake to a
/// background task feeding `events`; it returns once the session is
/// established (or has failed), not when it ends.
#[async_trait]
pub trait ProviderSession: Send + Sync {
    async fn connect(&self, events: mpsc::Sender<SessionEvent>) -> Result<(), ConnectError>;

    /// Deliver one outbound message to `target` (the external id of the
    /// recipient on this provider).
    async fn send(
        &self,
        target: &str,
        content: &str,
        content_type: ContentType,
    ) -> Result<ProviderMessageId, SendError>;

    async fn disconnect(&self);

    fn provider(&self) -> ProviderType;
}
