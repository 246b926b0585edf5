//! Channel registry
//!
//! Owns every registered adapter and aggregates their event streams
//! into a single mpsc channel for the integration core. Per-adapter
//! event order is preserved because each adapter writes to the shared
//! stream sequentially; a failing adapter never takes the others down.

use crate::adapter::ChannelAdapter;
use crate::session::ProviderSession;
use dashmap::DashMap;
use omnidesk_core::error::{ConnectError, SendError};
use omnidesk_core::pipeline::{OutboundSender, ProviderMessageId};
use omnidesk_core::types::{ChannelEvent, ConnectionState, ContentType, ProviderType};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("channel already registered: {0}")]
    AlreadyRegistered(String),
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Snapshot of one registered channel for status reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelState {
    pub channel_id: String,
    pub provider: ProviderType,
    pub state: ConnectionState,
}

pub struct ChannelRegistry {
    adapters: Arc<DashMap<String, Arc<ChannelAdapter>>>,
    events_tx: mpsc::Sender<ChannelEvent>,
    events_rx: mpsc::Receiver<ChannelEvent>,
}

impl ChannelRegistry {
    /// Create a registry whose aggregated stream buffers up to
    /// `buffer_size` events.
    pub fn new(buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size);
        info!("Created channel registry with buffer size {}", buffer_size);
        Self {
            adapters: Arc::new(DashMap::new()),
            events_tx: tx,
            events_rx: rx,
        }
    }

    /// Register a channel account and attempt its first connection.
    ///
    /// The entry is retained even when the connect fails, so the
    /// channel stays visible in `states()` and can be reconnected
    /// later. Only transient failures are retried here.
    pub async fn register(
        &self,
        channel_id: &str,
        session: Arc<dyn ProviderSession>,
    ) -> Result<(), RegistryError> {
        if self.adapters.contains_key(channel_id) {
            return Err(RegistryError::AlreadyRegistered(channel_id.to_string()));
        }

        let adapter = Arc::new(ChannelAdapter::new(
            channel_id.to_string(),
            session,
            self.events_tx.clone(),
        ));
        info!("Registering channel {} ({})", channel_id, adapter.provider());
        self.adapters.insert(channel_id.to_string(), adapter.clone());

        connect_with_retry(&adapter).await?;
        Ok(())
    }

    pub async fn deregister(&self, channel_id: &str) -> Result<(), RegistryError> {
        deregister_from(&self.adapters, channel_id).await
    }

    /// Reconnect a registered channel, typically after a fatal session
    /// error or a permanent connect failure.
    pub async fn reconnect(&self, channel_id: &str) -> Result<(), RegistryError> {
        reconnect_in(&self.adapters, channel_id).await
    }

    pub async fn states(&self) -> Vec<ChannelState> {
        let adapters: Vec<Arc<ChannelAdapter>> =
            self.adapters.iter().map(|a| a.clone()).collect();
        let mut out = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            out.push(ChannelState {
                channel_id: adapter.channel_id().to_string(),
                provider: adapter.provider(),
                state: adapter.state().await,
            });
        }
        out
    }

    pub fn channel_count(&self) -> usize {
        self.adapters.len()
    }

    /// Split the registry into the aggregated event receiver and a
    /// cloneable send handle. The receiver feeds the integration core;
    /// the handle serves outbound sends and status snapshots.
    pub fn split(self) -> (mpsc::Receiver<ChannelEvent>, RegistrySender) {
        let sender = RegistrySender {
            adapters: self.adapters,
        };
        (self.events_rx, sender)
    }
}

async fn connect_with_retry(adapter: &Arc<ChannelAdapter>) -> Result<(), ConnectError> {
    let mut backoff = CONNECT_BACKOFF;
    let mut attempt = 1;
    loop {
        match adapter.connect().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < CONNECT_ATTEMPTS => {
                warn!(
                    "Channel {} connect attempt {}/{} failed: {}, retrying in {:?}",
                    adapter.channel_id(),
                    attempt,
                    CONNECT_ATTEMPTS,
                    e,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn deregister_from(
    adapters: &DashMap<String, Arc<ChannelAdapter>>,
    channel_id: &str,
) -> Result<(), RegistryError> {
    let (_, adapter) = adapters
        .remove(channel_id)
        .ok_or_else(|| RegistryError::UnknownChannel(channel_id.to_string()))?;
    adapter.disconnect().await;
    info!("Deregistered channel {}", channel_id);
    Ok(())
}

async fn reconnect_in(
    adapters: &DashMap<String, Arc<ChannelAdapter>>,
    channel_id: &str,
) -> Result<(), RegistryError> {
    let adapter = adapters
        .get(channel_id)
        .map(|a| a.clone())
        .ok_or_else(|| RegistryError::UnknownChannel(channel_id.to_string()))?;
    adapter.disconnect().await;
    connect_with_retry(&adapter).await?;
    Ok(())
}

/// Registry handle that survives `split()`. Separated from the event
/// receiver so the integration core can consume events while the hub
/// routes outbound sends, status snapshots, and channel lifecycle
/// operations.
#[derive(Clone)]
pub struct RegistrySender {
    adapters: Arc<DashMap<String, Arc<ChannelAdapter>>>,
}

impl RegistrySender {
    /// Reconnect a registered channel at runtime, e.g. after a fatal
    /// session error or a credential failure that was since resolved.
    pub async fn reconnect(&self, channel_id: &str) -> Result<(), RegistryError> {
        reconnect_in(&self.adapters, channel_id).await
    }

    pub async fn deregister(&self, channel_id: &str) -> Result<(), RegistryError> {
        deregister_from(&self.adapters, channel_id).await
    }

    pub async fn states(&self) -> Vec<ChannelState> {
        let adapters: Vec<Arc<ChannelAdapter>> =
            self.adapters.iter().map(|a| a.clone()).collect();
        let mut out = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            out.push(ChannelState {
                channel_id: adapter.channel_id().to_string(),
                provider: adapter.provider(),
                state: adapter.state().await,
            });
        }
        out
    }
}

#[async_trait]
impl OutboundSender for RegistrySender {
    async fn send(
        &self,
        channel_id: &str,
        target: &str,
        content: &str,
        content_type: ContentType,
    ) -> Result<ProviderMessageId, SendError> {
        let adapter = self
            .adapters
            .get(channel_id)
            .map(|a| a.clone())
            .ok_or_else(|| SendError::Rejected(format!("no such channel: {channel_id}")))?;
        adapter.send(target, content, content_type).await
    }

    async fn channel_provider(&self, channel_id: &str) -> Option<ProviderType> {
        self.adapters.get(channel_id).map(|a| a.provider())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::MockSession;
    use crate::session::SessionEvent;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_register_and_duplicate() {
        let registry = ChannelRegistry::new(32);
        let session = Arc::new(MockSession::new(ProviderType::Whatsapp));
        registry.register("wa-1", session.clone()).await.unwrap();
        assert_eq!(registry.channel_count(), 1);

        let err = registry
            .register("wa-1", Arc::new(MockSession::new(ProviderType::Whatsapp)))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(_)));
        assert_eq!(registry.channel_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_connect_failure_is_retried() {
        let registry = ChannelRegistry::new(32);
        let session = Arc::new(
            MockSession::new(ProviderType::Facebook).with_connect_results(vec![
                Err(ConnectError::Network("timeout".to_string())),
                Ok(()),
            ]),
        );
        registry.register("fb-1", session.clone()).await.unwrap();
        assert_eq!(session.connect_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_credential_failure_not_retried_entry_kept() {
        let registry = ChannelRegistry::new(32);
        let session = Arc::new(
            MockSession::new(ProviderType::Instagram).with_connect_results(vec![Err(
                ConnectError::InvalidCredentials("expired".to_string()),
            )]),
        );
        let err = registry.register("ig-1", session.clone()).await.unwrap_err();
        assert!(matches!(err, RegistryError::Connect(ConnectError::InvalidCredentials(_))));
        assert_eq!(session.connect_calls.load(Ordering::SeqCst), 1);

        // entry stays visible, disconnected
        let states = registry.states().await;
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].channel_id, "ig-1");
        assert_eq!(states[0].state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_events_aggregate_across_adapters() {
        let registry = ChannelRegistry::new(32);
        let wa = Arc::new(MockSession::new(ProviderType::Whatsapp));
        let fb = Arc::new(MockSession::new(ProviderType::Facebook));
        registry.register("wa-1", wa.clone()).await.unwrap();
        registry.register("fb-1", fb.clone()).await.unwrap();

        let (mut rx, _sender) = registry.split();

        wa.emit_payload(json!({ "from": "+51", "body": "a" })).await;
        fb.emit_payload(json!({ "senderID": "42", "body": "b" })).await;

        let mut got = Vec::new();
        while got.len() < 2 {
            match rx.recv().await.unwrap() {
                ChannelEvent::MessageReceived { channel_id, .. } => got.push(channel_id),
                _ => continue,
            }
        }
        got.sort();
        assert_eq!(got, vec!["fb-1", "wa-1"]);
    }

    #[tokio::test]
    async fn test_fatal_on_one_adapter_leaves_others_running() {
        let registry = ChannelRegistry::new(32);
        let wa = Arc::new(MockSession::new(ProviderType::Whatsapp));
        let fb = Arc::new(MockSession::new(ProviderType::Facebook));
        registry.register("wa-1", wa.clone()).await.unwrap();
        registry.register("fb-1", fb.clone()).await.unwrap();

        wa.emit(SessionEvent::Fatal("session expired".to_string())).await;
        fb.emit_payload(json!({ "senderID": "42", "body": "still works" })).await;

        let states_before = registry.states().await;
        let (mut rx, sender) = registry.split();

        // the healthy adapter still delivers
        let mut saw_fb_message = false;
        let mut saw_wa_error = false;
        while !(saw_fb_message && saw_wa_error) {
            match rx.recv().await.unwrap() {
                ChannelEvent::MessageReceived { channel_id, .. } if channel_id == "fb-1" => {
                    saw_fb_message = true;
                }
                ChannelEvent::Error { channel_id, .. } if channel_id == "wa-1" => {
                    saw_wa_error = true;
                }
                _ => continue,
            }
        }

        // both entries remain visible
        assert_eq!(states_before.len(), 2);
        assert_eq!(sender.states().await.len(), 2);
        assert_eq!(sender.channel_provider("fb-1").await, Some(ProviderType::Facebook));
    }

    #[tokio::test]
    async fn test_sender_unknown_channel() {
        let registry = ChannelRegistry::new(32);
        let (_rx, sender) = registry.split();
        let err = sender
            .send("nope", "+51", "hi", ContentType::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Rejected(_)));
        assert_eq!(sender.channel_provider("nope").await, None);
    }

    #[tokio::test]
    async fn test_sender_reconnect_after_split() {
        let registry = ChannelRegistry::new(32);
        let session = Arc::new(MockSession::new(ProviderType::Whatsapp));
        registry.register("wa-1", session.clone()).await.unwrap();
        assert_eq!(session.connect_calls.load(Ordering::SeqCst), 1);

        let (_rx, sender) = registry.split();
        sender.reconnect("wa-1").await.unwrap();
        assert_eq!(session.connect_calls.load(Ordering::SeqCst), 2);

        let err = sender.reconnect("nope").await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownChannel(_)));
    }

    #[tokio::test]
    async fn test_sender_deregister_after_split() {
        let registry = ChannelRegistry::new(32);
        registry
            .register("wa-1", Arc::new(MockSession::new(ProviderType::Whatsapp)))
            .await
            .unwrap();
        let (_rx, sender) = registry.split();

        sender.deregister("wa-1").await.unwrap();
        assert!(sender.states().await.is_empty());
        let err = sender.deregister("wa-1").await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownChannel(_)));
    }

    #[tokio::test]
    async fn test_deregister_removes_entry() {
        let registry = ChannelRegistry::new(32);
        let session = Arc::new(MockSession::new(ProviderType::Whatsapp));
        registry.register("wa-1", session).await.unwrap();
        registry.deregister("wa-1").await.unwrap();
        assert_eq!(registry.channel_count(), 0);

        let err = registry.deregister("wa-1").await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownChannel(_)));
    }
}
