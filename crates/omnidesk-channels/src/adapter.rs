//! Channel adapter state machine
//!
//! One adapter per registered channel account. It owns a provider
//! session, tracks the connection state, and translates session events
//! into channel events for the registry's aggregated stream. No
//! message content is inspected here.

use crate::session::{ProviderSession, SessionEvent};
use omnidesk_core::error::{ConnectError, SendError};
use omnidesk_core::pipeline::ProviderMessageId;
use omnidesk_core::types::{ChannelEvent, ConnectionState, ContentType, ProviderType};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};

const SESSION_EVENT_BUFFER: usize = 64;

pub struct ChannelAdapter {
    channel_id: String,
    session: Arc<dyn ProviderSession>,
    state: Arc<RwLock<ConnectionState>>,
    events_tx: mpsc::Sender<ChannelEvent>,
}

impl ChannelAdapter {
    pub fn new(
        channel_id: String,
        session: Arc<dyn ProviderSession>,
        events_tx: mpsc::Sender<ChannelEvent>,
    ) -> Self {
        Self {
            channel_id,
            session,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            events_tx,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn provider(&self) -> ProviderType {
        self.session.provider()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Establish the provider session. On success the session's `Up`
    /// event drives the transition to `connected`; a connect failure
    /// returns the adapter to `disconnected`.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        info!("Connecting channel {} ({})", self.channel_id, self.provider());
        self.set_state(ConnectionState::Connecting).await;

        let (session_tx, session_rx) = mpsc::channel(SESSION_EVENT_BUFFER);
        self.spawn_translator(session_rx);

        match self.session.connect(session_tx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Channel {} failed to connect: {}", self.channel_id, e);
                self.set_state(ConnectionState::Disconnected).await;
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) {
        info!("Disconnecting channel {}", self.channel_id);
        self.session.disconnect().await;
        self.set_state(ConnectionState::Disconnected).await;
    }

    /// Send through the underlying session. Rejected immediately when
    /// the adapter is not connected; the caller decides what a failed
    /// attempt means.
    pub async fn send(
        &self,
        target: &str,
        content: &str,
        content_type: ContentType,
    ) -> Result<ProviderMessageId, SendError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }
        self.session.send(target, content, content_type).await
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
        self.emit_status(state).await;
    }

    async fn emit_status(&self, state: ConnectionState) {
        let ev = ChannelEvent::StatusChanged {
            channel_id: self.channel_id.clone(),
            state,
        };
        if self.events_tx.send(ev).await.is_err() {
            error!("Event stream closed, dropping status for {}", self.channel_id);
        }
    }

    fn spawn_translator(&self, mut session_rx: mpsc::Receiver<SessionEvent>) {
        let channel_id = self.channel_id.clone();
        let provider = self.provider();
        let state = self.state.clone();
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            while let Some(ev) = session_rx.recv().await {
                let out = match ev {
                    SessionEvent::Up => {
                        *state.write().await = ConnectionState::Connected;
                        ChannelEvent::StatusChanged {
                            channel_id: channel_id.clone(),
                            state: ConnectionState::Connected,
                        }
                    }
                    SessionEvent::Down => {
                        *state.write().await = ConnectionState::Disconnected;
                        ChannelEvent::StatusChanged {
                            channel_id: channel_id.clone(),
                            state: ConnectionState::Disconnected,
                        }
                    }
                    SessionEvent::Fatal(cause) => {
                        warn!("Channel {} session fatal: {}", channel_id, cause);
                        *state.write().await = ConnectionState::Disconnected;
                        let err = ChannelEvent::Error {
                            channel_id: channel_id.clone(),
                            cause,
                            recoverable: false,
                        };
                        if events_tx.send(err).await.is_err() {
                            break;
                        }
                        ChannelEvent::StatusChanged {
                            channel_id: channel_id.clone(),
                            state: ConnectionState::Disconnected,
                        }
                    }
                    SessionEvent::Pairing(code) => ChannelEvent::Pairing {
                        channel_id: channel_id.clone(),
                        code,
                    },
                    SessionEvent::Payload(raw) => ChannelEvent::MessageReceived {
                        channel_id: channel_id.clone(),
                        provider,
                        raw,
                    },
                    SessionEvent::Receipt {
                        provider_message_id,
                        status,
                    } => ChannelEvent::Receipt {
                        channel_id: channel_id.clone(),
                        provider_message_id,
                        status,
                    },
                };
                if events_tx.send(out).await.is_err() {
                    break;
                }
            }
            debug!("Translator for channel {} finished", channel_id);
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable session used by adapter and registry tests

    use super::*;
    use omnidesk_core::types::MessageStatus;
    use serde_json::Value as JsonValue;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use async_trait::async_trait;
    use chrono::Utc;

    pub struct MockSession {
        provider: ProviderType,
        /// Connect results consumed in order; once exhausted, Ok.
        connect_results: Mutex<Vec<Result<(), ConnectError>>>,
        pub connect_calls: AtomicUsize,
        pub send_calls: AtomicUsize,
        pub fail_sends: std::sync::atomic::AtomicBool,
        events_tx: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    }

    impl MockSession {
        pub fn new(provider: ProviderType) -> Self {
            Self {
                provider,
                connect_results: Mutex::new(Vec::new()),
                connect_calls: AtomicUsize::new(0),
                send_calls: AtomicUsize::new(0),
                fail_sends: std::sync::atomic::AtomicBool::new(false),
                events_tx: Mutex::new(None),
            }
        }

        pub fn with_connect_results(self, results: Vec<Result<(), ConnectError>>) -> Self {
            *self.connect_results.lock().unwrap() = results;
            self
        }

        /// Emit a session event as if the provider produced it.
        pub async fn emit(&self, ev: SessionEvent) {
            let tx = self.events_tx.lock().unwrap().clone();
            if let Some(tx) = tx {
                tx.send(ev).await.unwrap();
            }
        }

        pub async fn emit_payload(&self, raw: JsonValue) {
            self.emit(SessionEvent::Payload(raw)).await;
        }

        pub async fn emit_receipt(&self, provider_message_id: &str, status: MessageStatus) {
            self.emit(SessionEvent::Receipt {
                provider_message_id: provider_message_id.to_string(),
                status,
            })
            .await;
        }
    }

    #[async_trait]
    impl ProviderSession for MockSession {
        async fn connect(&self, events: mpsc::Sender<SessionEvent>) -> Result<(), ConnectError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            let result = {
                let mut results = self.connect_results.lock().unwrap();
                if results.is_empty() {
                    Ok(())
                } else {
                    results.remove(0)
                }
            };
            if result.is_ok() {
                events.send(SessionEvent::Up).await.ok();
                *self.events_tx.lock().unwrap() = Some(events);
            }
            result
        }

        async fn send(
            &self,
            _target: &str,
            _content: &str,
            _content_type: ContentType,
        ) -> Result<ProviderMessageId, SendError> {
            self.send_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(SendError::Transient("mock send failure".to_string()));
            }
            Ok(ProviderMessageId {
                id: format!("mock-{}", self.send_calls.load(Ordering::SeqCst)),
                enqueued_at: Utc::now(),
            })
        }

        async fn disconnect(&self) {
            *self.events_tx.lock().unwrap() = None;
        }

        fn provider(&self) -> ProviderType {
            self.provider
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockSession;
    use super::*;
    use omnidesk_core::types::MessageStatus;
    use serde_json::json;

    async fn connected_adapter() -> (Arc<MockSession>, ChannelAdapter, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(32);
        let session = Arc::new(MockSession::new(ProviderType::Whatsapp));
        let adapter = ChannelAdapter::new("wa-1".to_string(), session.clone(), tx);
        adapter.connect().await.unwrap();
        (session, adapter, rx)
    }

    async fn next_status(rx: &mut mpsc::Receiver<ChannelEvent>) -> ConnectionState {
        loop {
            match rx.recv().await.unwrap() {
                ChannelEvent::StatusChanged { state, .. } => return state,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_connect_transitions_through_states() {
        let (_session, adapter, mut rx) = connected_adapter().await;
        assert_eq!(next_status(&mut rx).await, ConnectionState::Connecting);
        assert_eq!(next_status(&mut rx).await, ConnectionState::Connected);
        assert_eq!(adapter.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let (tx, mut rx) = mpsc::channel(32);
        let session = Arc::new(
            MockSession::new(ProviderType::Facebook).with_connect_results(vec![Err(
                ConnectError::InvalidCredentials("bad token".to_string()),
            )]),
        );
        let adapter = ChannelAdapter::new("fb-1".to_string(), session, tx);

        let err = adapter.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::InvalidCredentials(_)));
        assert_eq!(adapter.state().await, ConnectionState::Disconnected);
        assert_eq!(next_status(&mut rx).await, ConnectionState::Connecting);
        assert_eq!(next_status(&mut rx).await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_payload_forwarded_verbatim() {
        let (session, _adapter, mut rx) = connected_adapter().await;
        let raw = json!({ "from": "+511234", "body": "hola", "extra": { "deep": [1, 2] } });
        session.emit_payload(raw.clone()).await;

        loop {
            match rx.recv().await.unwrap() {
                ChannelEvent::MessageReceived {
                    channel_id,
                    provider,
                    raw: got,
                } => {
                    assert_eq!(channel_id, "wa-1");
                    assert_eq!(provider, ProviderType::Whatsapp);
                    assert_eq!(got, raw);
                    break;
                }
                ChannelEvent::StatusChanged { .. } => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_send_when_disconnected_is_rejected() {
        let (tx, _rx) = mpsc::channel(32);
        let session = Arc::new(MockSession::new(ProviderType::Whatsapp));
        let adapter = ChannelAdapter::new("wa-1".to_string(), session.clone(), tx);

        let err = adapter
            .send("+511234", "hello", ContentType::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::NotConnected));
        // the session was never asked
        assert_eq!(session.send_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_when_connected_delegates() {
        let (session, adapter, _rx) = connected_adapter().await;
        // state flip happens in the translator task
        tokio::task::yield_now().await;
        while adapter.state().await != ConnectionState::Connected {
            tokio::task::yield_now().await;
        }
        let id = adapter
            .send("+511234", "hello", ContentType::Text)
            .await
            .unwrap();
        assert_eq!(id.id, "mock-1");
        assert_eq!(session.send_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fatal_emits_error_then_disconnected() {
        let (session, adapter, mut rx) = connected_adapter().await;
        assert_eq!(next_status(&mut rx).await, ConnectionState::Connecting);
        assert_eq!(next_status(&mut rx).await, ConnectionState::Connected);

        session.emit(SessionEvent::Fatal("session expired".to_string())).await;

        match rx.recv().await.unwrap() {
            ChannelEvent::Error {
                channel_id,
                cause,
                recoverable,
            } => {
                assert_eq!(channel_id, "wa-1");
                assert!(cause.contains("expired"));
                assert!(!recoverable);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(next_status(&mut rx).await, ConnectionState::Disconnected);
        assert_eq!(adapter.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_pairing_and_receipt_pass_through() {
        let (session, _adapter, mut rx) = connected_adapter().await;
        session.emit(SessionEvent::Pairing("ABCD-1234".to_string())).await;
        session.emit_receipt("prov-9", MessageStatus::Read).await;

        let mut saw_pairing = false;
        let mut saw_receipt = false;
        while !(saw_pairing && saw_receipt) {
            match rx.recv().await.unwrap() {
                ChannelEvent::Pairing { code, .. } => {
                    assert_eq!(code, "ABCD-1234");
                    saw_pairing = true;
                }
                ChannelEvent::Receipt {
                    provider_message_id,
                    status,
                    ..
                } => {
                    assert_eq!(provider_message_id, "prov-9");
                    assert_eq!(status, MessageStatus::Read);
                    saw_receipt = true;
                }
                ChannelEvent::StatusChanged { .. } => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
}
