//! Integration core — drives registry events through normalization,
//! identity resolution, and transactional persistence, then republishes
//! persisted-confirmed events toward the real-time hub
//!
//! Events are dispatched onto one lane per channel id, so per-channel
//! order is preserved end-to-end while channels proceed independently.
//! A failed persistence never halts a lane: the event is retried once,
//! then dead-lettered and surfaced as `HubEvent::ProcessingFailed`.

use crate::error::{PipelineError, SendError, StoreError};
use crate::normalize::normalize;
use crate::resolve::IdentityResolver;
use crate::store::ConversationStore;
use crate::types::{
    ChannelEvent, ContentType, ConversationStatus, Direction, HubEvent, MessageStatus,
    ProviderType, UnifiedMessage,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Provider-assigned id and enqueue time returned by a successful send
#[derive(Debug, Clone)]
pub struct ProviderMessageId {
    pub id: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Outbound seam toward the channel registry.
///
/// Implemented by the registry's send handle; the core never holds
/// adapters directly.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send(
        &self,
        channel_id: &str,
        target: &str,
        content: &str,
        content_type: ContentType,
    ) -> Result<ProviderMessageId, SendError>;

    /// Provider type of a registered channel, if known.
    async fn channel_provider(&self, channel_id: &str) -> Option<ProviderType>;
}

/// Result of an outbound send request
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message_id: String,
    pub status: MessageStatus,
}

/// An inbound event that could not be persisted, kept for tooling
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub channel_id: String,
    pub raw: JsonValue,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

const LANE_BUFFER: usize = 64;

pub struct IntegrationCore {
    store: Arc<dyn ConversationStore>,
    outbound: Arc<dyn OutboundSender>,
    resolver: IdentityResolver,
    hub_tx: mpsc::Sender<HubEvent>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    dead_letter_capacity: usize,
}

impl IntegrationCore {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        outbound: Arc<dyn OutboundSender>,
        hub_tx: mpsc::Sender<HubEvent>,
        dead_letter_capacity: usize,
    ) -> Self {
        Self {
            resolver: IdentityResolver::new(store.clone()),
            store,
            outbound,
            hub_tx,
            dead_letters: Mutex::new(VecDeque::new()),
            dead_letter_capacity,
        }
    }

    /// Consume the registry's aggregated event stream until cancellation
    /// or stream end. Cancellation stops intake only; events already on
    /// a lane drain to completion.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ChannelEvent>,
        cancel: CancellationToken,
    ) {
        let lanes: DashMap<String, mpsc::Sender<ChannelEvent>> = DashMap::new();
        info!("Integration core started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Integration core shutting down");
                    break;
                }
                ev = events.recv() => {
                    match ev {
                        Some(ev) => self.dispatch(&lanes, ev).await,
                        None => {
                            info!("Channel event stream closed");
                            break;
                        }
                    }
                }
            }
        }
        // Dropping the lane senders lets workers drain in-flight events
    }

    async fn dispatch(
        self: &Arc<Self>,
        lanes: &DashMap<String, mpsc::Sender<ChannelEvent>>,
        ev: ChannelEvent,
    ) {
        let channel_id = ev.channel_id().to_string();
        let tx = lanes
            .entry(channel_id.clone())
            .or_insert_with(|| self.spawn_lane(&channel_id))
            .clone();
        if tx.send(ev).await.is_err() {
            error!("Lane for channel {} is gone, dropping event", channel_id);
        }
    }

    fn spawn_lane(self: &Arc<Self>, channel_id: &str) -> mpsc::Sender<ChannelEvent> {
        let (tx, mut rx) = mpsc::channel::<ChannelEvent>(LANE_BUFFER);
        debug!("Spawning event lane for channel {}", channel_id);
        let core = self.clone();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                core.handle_event(ev).await;
            }
        });
        tx
    }

    /// Handle one channel event. Public so tests (and the lane workers)
    /// can drive the pipeline directly.
    pub async fn handle_event(&self, ev: ChannelEvent) {
        match ev {
            ChannelEvent::StatusChanged { channel_id, state } => {
                info!("Channel {} is now {}", channel_id, state);
                self.emit(HubEvent::ChannelStatus { channel_id, state }).await;
            }
            ChannelEvent::MessageReceived {
                channel_id,
                provider,
                raw,
            } => {
                self.handle_inbound(channel_id, provider, raw).await;
            }
            ChannelEvent::Pairing { channel_id, code } => {
                // Side-channel pairing data; operators read it from logs
                info!("Channel {} pairing code: {}", channel_id, code);
            }
            ChannelEvent::Receipt {
                channel_id,
                provider_message_id,
                status,
            } => {
                match self
                    .store
                    .update_message_status_by_provider_id(&provider_message_id, status)
                    .await
                {
                    Ok(Some(msg)) => {
                        debug!("Receipt on {}: message {} is now {}", channel_id, msg.id, status.as_str());
                        self.emit(HubEvent::MessagePersisted(msg)).await;
                    }
                    Ok(None) => {
                        debug!("Receipt on {} for unknown provider message {}", channel_id, provider_message_id);
                    }
                    Err(e) => warn!("Failed to apply receipt on {}: {}", channel_id, e),
                }
            }
            ChannelEvent::Error {
                channel_id,
                cause,
                recoverable,
            } => {
                warn!(
                    "Channel {} error (recoverable: {}): {}",
                    channel_id, recoverable, cause
                );
            }
        }
    }

    async fn handle_inbound(&self, channel_id: String, provider: ProviderType, raw: JsonValue) {
        let mut msg = normalize(provider, &channel_id, &raw);

        let resolved = self
            .resolver
            .resolve(&channel_id, provider, &msg.sender_id, msg.sender_name.as_deref())
            .await;
        let conversation = match resolved {
            Ok((_, conv)) => conv,
            Err(e) => {
                self.dead_letter(channel_id, raw, format!("identity resolution failed: {e}"))
                    .await;
                return;
            }
        };
        msg.conversation_id = Some(conversation.id.clone());

        // One immediate retry, then dead-letter; the lane keeps going
        let mut result = self.store.append_message(&msg, &conversation.id).await;
        if let Err(e) = &result {
            warn!("Persisting message on {} failed, retrying once: {}", channel_id, e);
            result = self.store.append_message(&msg, &conversation.id).await;
        }
        match result {
            Ok(()) => {
                debug!(
                    "Persisted {} message {} into conversation {}",
                    provider, msg.id, conversation.id
                );
                self.emit(HubEvent::MessagePersisted(msg)).await;
            }
            Err(e) => {
                self.dead_letter(channel_id, raw, format!("persistence failed: {e}"))
                    .await;
            }
        }
    }

    /// Outbound path: persist a provisional `outbound/sent` message
    /// first, then attempt the provider send. A failed send flips the
    /// status to `failed`; the provisional record is never deleted, so
    /// the operator keeps an audit trail of the attempt.
    pub async fn send_message(
        &self,
        channel_id: &str,
        conversation_id: &str,
        content: &str,
        content_type: ContentType,
    ) -> Result<SendOutcome, PipelineError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| PipelineError::UnknownConversation(conversation_id.to_string()))?;
        let client = self
            .store
            .get_client(&conversation.client_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("client {}", conversation.client_id)))?;
        let provider = self
            .outbound
            .channel_provider(channel_id)
            .await
            .ok_or_else(|| PipelineError::UnknownChannel(channel_id.to_string()))?;
        let target = client
            .channel_ids
            .get(&provider)
            .ok_or_else(|| PipelineError::NoProviderIdentity {
                client_id: client.id.clone(),
                provider,
            })?
            .clone();

        let mut msg = UnifiedMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: Some(conversation_id.to_string()),
            channel_id: channel_id.to_string(),
            channel_type: provider,
            sender_id: "operator".to_string(),
            sender_name: None,
            content: content.to_string(),
            content_type,
            direction: Direction::Outbound,
            status: MessageStatus::Sent,
            timestamp: Utc::now(),
            provider_message_id: None,
            metadata: None,
        };

        self.store.append_message(&msg, conversation_id).await?;
        self.emit(HubEvent::MessagePersisted(msg.clone())).await;

        match self
            .outbound
            .send(channel_id, &target, content, content_type)
            .await
        {
            Ok(provider_id) => {
                if let Err(e) = self
                    .store
                    .set_provider_message_id(&msg.id, &provider_id.id)
                    .await
                {
                    warn!("Failed to record provider id for message {}: {}", msg.id, e);
                }
                info!(
                    "Sent message {} via {} (provider id {})",
                    msg.id, channel_id, provider_id.id
                );
                Ok(SendOutcome {
                    message_id: msg.id,
                    status: MessageStatus::Sent,
                })
            }
            Err(e) => {
                warn!("Send via {} failed: {}", channel_id, e);
                if let Err(e) = self
                    .store
                    .update_message_status(&msg.id, MessageStatus::Failed)
                    .await
                {
                    error!("Failed to mark message {} as failed: {}", msg.id, e);
                }
                msg.status = MessageStatus::Failed;
                self.emit(HubEvent::MessagePersisted(msg.clone())).await;
                Ok(SendOutcome {
                    message_id: msg.id,
                    status: MessageStatus::Failed,
                })
            }
        }
    }

    /// Relay a conversation assignment to the conversation's room.
    /// Assignment is presentation state; nothing is persisted.
    pub async fn assign_conversation(
        &self,
        conversation_id: &str,
        agent_id: &str,
    ) -> Result<(), PipelineError> {
        self.store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| PipelineError::UnknownConversation(conversation_id.to_string()))?;
        self.emit(HubEvent::ConversationAssigned {
            conversation_id: conversation_id.to_string(),
            agent_id: agent_id.to_string(),
        })
        .await;
        Ok(())
    }

    pub async fn update_conversation_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> Result<(), PipelineError> {
        self.store
            .update_conversation_status(conversation_id, status)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => {
                    PipelineError::UnknownConversation(conversation_id.to_string())
                }
                other => PipelineError::Store(other),
            })?;
        self.emit(HubEvent::ConversationStatusChanged {
            conversation_id: conversation_id.to_string(),
            status,
        })
        .await;
        Ok(())
    }

    /// Message history backfill for the operator UI.
    pub async fn history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<UnifiedMessage>, PipelineError> {
        Ok(self.store.recent_messages(conversation_id, limit).await?)
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Snapshot of the dead-letter queue for operational tooling.
    pub fn dead_letter_snapshot(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn dead_letter(&self, channel_id: String, raw: JsonValue, reason: String) {
        error!("Dead-lettering event from {}: {}", channel_id, reason);
        {
            let mut queue = match self.dead_letters.lock() {
                Ok(q) => q,
                Err(poisoned) => poisoned.into_inner(),
            };
            if queue.len() >= self.dead_letter_capacity {
                queue.pop_front();
            }
            queue.push_back(DeadLetter {
                channel_id: channel_id.clone(),
                raw,
                reason: reason.clone(),
                failed_at: Utc::now(),
            });
        }
        self.emit(HubEvent::ProcessingFailed { channel_id, reason }).await;
    }

    async fn emit(&self, ev: HubEvent) {
        if self.hub_tx.send(ev).await.is_err() {
            debug!("Hub receiver is gone, discarding event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockOutbound {
        provider: ProviderType,
        known_channels: Vec<String>,
        fail_not_connected: AtomicBool,
        calls: AtomicUsize,
    }

    impl MockOutbound {
        fn new(provider: ProviderType, channels: &[&str]) -> Self {
            Self {
                provider,
                known_channels: channels.iter().map(|s| s.to_string()).collect(),
                fail_not_connected: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl OutboundSender for MockOutbound {
        async fn send(
            &self,
            _channel_id: &str,
            _target: &str,
            _content: &str,
            _content_type: ContentType,
        ) -> Result<ProviderMessageId, SendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_not_connected.load(Ordering::SeqCst) {
                return Err(SendError::NotConnected);
            }
            Ok(ProviderMessageId {
                id: "prov-1".to_string(),
                enqueued_at: Utc::now(),
            })
        }

        async fn channel_provider(&self, channel_id: &str) -> Option<ProviderType> {
            self.known_channels
                .iter()
                .any(|c| c == channel_id)
                .then_some(self.provider)
        }
    }

    fn core_with(
        outbound: Arc<MockOutbound>,
    ) -> (Arc<MemoryStore>, Arc<IntegrationCore>, mpsc::Receiver<HubEvent>) {
        let store = Arc::new(MemoryStore::new());
        let (hub_tx, hub_rx) = mpsc::channel(64);
        let core = Arc::new(IntegrationCore::new(
            store.clone(),
            outbound,
            hub_tx,
            16,
        ));
        (store, core, hub_rx)
    }

    fn wa_payload(from: &str, body: &str) -> JsonValue {
        json!({ "id": "wa-msg", "from": from, "body": body, "type": "chat" })
    }

    #[tokio::test]
    async fn test_inbound_message_persisted_and_emitted() {
        let outbound = Arc::new(MockOutbound::new(ProviderType::Whatsapp, &["wa-1"]));
        let (store, core, mut hub_rx) = core_with(outbound);

        core.handle_event(ChannelEvent::MessageReceived {
            channel_id: "wa-1".to_string(),
            provider: ProviderType::Whatsapp,
            raw: wa_payload("+511234", "hola"),
        })
        .await;

        assert_eq!(store.message_count(), 1);
        assert_eq!(store.conversation_count(), 1);
        let ev = hub_rx.recv().await.unwrap();
        match ev {
            HubEvent::MessagePersisted(m) => {
                assert!(m.conversation_id.is_some());
                assert_eq!(m.content, "hola");
                assert_eq!(m.direction, Direction::Inbound);
            }
            other => panic!("unexpected hub event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_payload_still_persisted() {
        let outbound = Arc::new(MockOutbound::new(ProviderType::Whatsapp, &["wa-1"]));
        let (store, core, mut hub_rx) = core_with(outbound);

        core.handle_event(ChannelEvent::MessageReceived {
            channel_id: "wa-1".to_string(),
            provider: ProviderType::Whatsapp,
            raw: json!({ "from": "+511234", "weird": true }),
        })
        .await;

        assert_eq!(store.message_count(), 1);
        let msgs = store.messages();
        assert_eq!(msgs[0].content_type, ContentType::Unknown);
        assert!(msgs[0].metadata.is_some());
        assert!(matches!(hub_rx.recv().await, Some(HubEvent::MessagePersisted(_))));
    }

    #[tokio::test]
    async fn test_burst_from_one_sender_creates_one_conversation() {
        let outbound = Arc::new(MockOutbound::new(ProviderType::Whatsapp, &["wa-1"]));
        let (store, core, _hub_rx) = core_with(outbound);

        let mut handles = Vec::new();
        for i in 0..2 {
            let core = core.clone();
            handles.push(tokio::spawn(async move {
                core.handle_event(ChannelEvent::MessageReceived {
                    channel_id: "wa-1".to_string(),
                    provider: ProviderType::Whatsapp,
                    raw: wa_payload("+511234", &format!("msg {i}")),
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.client_count(), 1);
        assert_eq!(store.conversation_count(), 1);
        let convs = store.conversations();
        assert_eq!(convs[0].status, ConversationStatus::Pending);
        let clients = store.clients();
        assert_eq!(clients[0].channel_ids[&ProviderType::Whatsapp], "+511234");
        // both messages landed under the single conversation
        let msgs = store.messages();
        assert_eq!(msgs.len(), 2);
        assert!(msgs.iter().all(|m| m.conversation_id.as_deref() == Some(convs[0].id.as_str())));
    }

    #[tokio::test]
    async fn test_store_failure_dead_letters_and_stream_continues() {
        let outbound = Arc::new(MockOutbound::new(ProviderType::Whatsapp, &["wa-1"]));
        let (store, core, mut hub_rx) = core_with(outbound);

        store.fail_appends.store(true, Ordering::SeqCst);
        core.handle_event(ChannelEvent::MessageReceived {
            channel_id: "wa-1".to_string(),
            provider: ProviderType::Whatsapp,
            raw: wa_payload("+511234", "lost?"),
        })
        .await;

        assert_eq!(core.dead_letter_count(), 1);
        assert!(matches!(
            hub_rx.recv().await,
            Some(HubEvent::ProcessingFailed { .. })
        ));
        let letters = core.dead_letter_snapshot();
        assert_eq!(letters[0].channel_id, "wa-1");
        assert_eq!(letters[0].raw["body"], "lost?");

        // recovery: the next event processes normally
        store.fail_appends.store(false, Ordering::SeqCst);
        core.handle_event(ChannelEvent::MessageReceived {
            channel_id: "wa-1".to_string(),
            provider: ProviderType::Whatsapp,
            raw: wa_payload("+511234", "still here"),
        })
        .await;
        assert_eq!(store.message_count(), 1);
        assert!(matches!(hub_rx.recv().await, Some(HubEvent::MessagePersisted(_))));
    }

    #[tokio::test]
    async fn test_status_change_reaches_hub() {
        let outbound = Arc::new(MockOutbound::new(ProviderType::Facebook, &["fb-1"]));
        let (_store, core, mut hub_rx) = core_with(outbound);

        core.handle_event(ChannelEvent::StatusChanged {
            channel_id: "fb-1".to_string(),
            state: crate::types::ConnectionState::Connected,
        })
        .await;

        match hub_rx.recv().await.unwrap() {
            HubEvent::ChannelStatus { channel_id, state } => {
                assert_eq!(channel_id, "fb-1");
                assert_eq!(state, crate::types::ConnectionState::Connected);
            }
            other => panic!("unexpected hub event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_outbound_send_success() {
        let outbound = Arc::new(MockOutbound::new(ProviderType::Whatsapp, &["wa-1"]));
        let (store, core, mut hub_rx) = core_with(outbound.clone());

        // seed identity via one inbound message
        core.handle_event(ChannelEvent::MessageReceived {
            channel_id: "wa-1".to_string(),
            provider: ProviderType::Whatsapp,
            raw: wa_payload("+511234", "hola"),
        })
        .await;
        let conv_id = store.conversations()[0].id.clone();
        let _ = hub_rx.recv().await;

        let outcome = core
            .send_message("wa-1", &conv_id, "hello back", ContentType::Text)
            .await
            .unwrap();
        assert_eq!(outcome.status, MessageStatus::Sent);
        assert_eq!(outbound.calls.load(Ordering::SeqCst), 1);

        let msgs = store.messages();
        let sent = msgs.iter().find(|m| m.id == outcome.message_id).unwrap();
        assert_eq!(sent.direction, Direction::Outbound);
        assert_eq!(sent.provider_message_id.as_deref(), Some("prov-1"));
    }

    #[tokio::test]
    async fn test_outbound_send_failure_persists_failed_status() {
        let outbound = Arc::new(MockOutbound::new(ProviderType::Whatsapp, &["wa-1"]));
        let (store, core, mut hub_rx) = core_with(outbound.clone());

        core.handle_event(ChannelEvent::MessageReceived {
            channel_id: "wa-1".to_string(),
            provider: ProviderType::Whatsapp,
            raw: wa_payload("+511234", "hola"),
        })
        .await;
        let conv_id = store.conversations()[0].id.clone();
        let _ = hub_rx.recv().await;

        // adapter is down: the attempt is still made, and fails
        outbound.fail_not_connected.store(true, Ordering::SeqCst);
        let outcome = core
            .send_message("wa-1", &conv_id, "hello", ContentType::Text)
            .await
            .unwrap();
        assert_eq!(outcome.status, MessageStatus::Failed);
        assert_eq!(outbound.calls.load(Ordering::SeqCst), 1);

        // provisional record kept with failed status, never deleted
        let msgs = store.messages();
        let failed = msgs.iter().find(|m| m.id == outcome.message_id).unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(msgs.len(), 2);

        // both emissions observed: provisional sent, then failed
        let first = hub_rx.recv().await.unwrap();
        let second = hub_rx.recv().await.unwrap();
        match (first, second) {
            (HubEvent::MessagePersisted(a), HubEvent::MessagePersisted(b)) => {
                assert_eq!(a.status, MessageStatus::Sent);
                assert_eq!(b.status, MessageStatus::Failed);
                assert_eq!(a.id, b.id);
            }
            other => panic!("unexpected hub events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_outbound_unknown_conversation() {
        let outbound = Arc::new(MockOutbound::new(ProviderType::Whatsapp, &["wa-1"]));
        let (_store, core, _hub_rx) = core_with(outbound);
        let err = core
            .send_message("wa-1", "no-such-conv", "hello", ContentType::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownConversation(_)));
    }

    #[tokio::test]
    async fn test_receipt_updates_persisted_status() {
        let outbound = Arc::new(MockOutbound::new(ProviderType::Whatsapp, &["wa-1"]));
        let (store, core, mut hub_rx) = core_with(outbound);

        core.handle_event(ChannelEvent::MessageReceived {
            channel_id: "wa-1".to_string(),
            provider: ProviderType::Whatsapp,
            raw: wa_payload("+511234", "hola"),
        })
        .await;
        let conv_id = store.conversations()[0].id.clone();
        let _ = hub_rx.recv().await;
        let outcome = core
            .send_message("wa-1", &conv_id, "reply", ContentType::Text)
            .await
            .unwrap();

        let _ = hub_rx.recv().await; // provisional sent emission

        core.handle_event(ChannelEvent::Receipt {
            channel_id: "wa-1".to_string(),
            provider_message_id: "prov-1".to_string(),
            status: MessageStatus::Read,
        })
        .await;

        let msgs = store.messages();
        let sent = msgs.iter().find(|m| m.id == outcome.message_id).unwrap();
        assert_eq!(sent.status, MessageStatus::Read);

        // the status change is republished to the hub
        match hub_rx.recv().await.unwrap() {
            HubEvent::MessagePersisted(m) => {
                assert_eq!(m.id, outcome.message_id);
                assert_eq!(m.status, MessageStatus::Read);
            }
            other => panic!("unexpected hub event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_preserves_per_channel_order() {
        let outbound = Arc::new(MockOutbound::new(ProviderType::Whatsapp, &["wa-1"]));
        let (store, core, mut hub_rx) = core_with(outbound);

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let runner = tokio::spawn(core.clone().run(rx, cancel.clone()));

        for i in 0..4 {
            tx.send(ChannelEvent::MessageReceived {
                channel_id: "wa-1".to_string(),
                provider: ProviderType::Whatsapp,
                raw: wa_payload("+511234", &format!("msg {i}")),
            })
            .await
            .unwrap();
        }

        let mut contents = Vec::new();
        for _ in 0..4 {
            match hub_rx.recv().await.unwrap() {
                HubEvent::MessagePersisted(m) => contents.push(m.content),
                other => panic!("unexpected hub event: {other:?}"),
            }
        }
        assert_eq!(contents, vec!["msg 0", "msg 1", "msg 2", "msg 3"]);
        assert_eq!(store.message_count(), 4);

        cancel.cancel();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_conversation_status_update_emits() {
        let outbound = Arc::new(MockOutbound::new(ProviderType::Whatsapp, &["wa-1"]));
        let (store, core, mut hub_rx) = core_with(outbound);

        core.handle_event(ChannelEvent::MessageReceived {
            channel_id: "wa-1".to_string(),
            provider: ProviderType::Whatsapp,
            raw: wa_payload("+511234", "hola"),
        })
        .await;
        let conv_id = store.conversations()[0].id.clone();
        let _ = hub_rx.recv().await;

        core.update_conversation_status(&conv_id, ConversationStatus::Active)
            .await
            .unwrap();
        assert_eq!(store.conversations()[0].status, ConversationStatus::Active);
        assert!(matches!(
            hub_rx.recv().await,
            Some(HubEvent::ConversationStatusChanged { .. })
        ));

        let err = core
            .update_conversation_status("nope", ConversationStatus::Resolved)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownConversation(_)));
    }
}
