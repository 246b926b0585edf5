//! WhatsApp session over the web-client bridge HTTP API
//!
//! The bridge wraps a WhatsApp web client and exposes it as plain
//! HTTP: `POST /session` begins a session (answering with a pairing
//! code until the account is linked), `GET /events` is a cursor poll,
//! `POST /send` delivers. Payloads come through verbatim.

use crate::session::{ProviderSession, SessionEvent};
use async_trait::async_trait;
use chrono::Utc;
use omnidesk_core::error::{ConnectError, SendError};
use omnidesk_core::pipeline::ProviderMessageId;
use omnidesk_core::types::{ContentType, MessageStatus, ProviderType};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct WhatsAppSession {
    base_url: String,
    api_key: String,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
}

impl WhatsAppSession {
    pub fn new(base_url: String, api_key: String, poll_interval: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            poll_interval,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn http_client() -> Result<reqwest::Client, ConnectError> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ConnectError::Network(e.to_string()))
    }

    /// One poll cycle: fetch events after `cursor`, forward them,
    /// return the new cursor.
    async fn poll_once(
        client: &reqwest::Client,
        base_url: &str,
        api_key: &str,
        cursor: i64,
        events: &mpsc::Sender<SessionEvent>,
    ) -> anyhow::Result<i64> {
        let body: JsonValue = client
            .get(format!("{base_url}/events"))
            .bearer_auth(api_key)
            .query(&[("after", cursor.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let next = body.get("cursor").and_then(|v| v.as_i64()).unwrap_or(cursor);
        let Some(items) = body.get("events").and_then(|v| v.as_array()) else {
            return Ok(next);
        };

        for item in items {
            let ev = match item.get("type").and_then(|v| v.as_str()) {
                Some("message") => item
                    .get("payload")
                    .cloned()
                    .map(SessionEvent::Payload),
                Some("ack") => {
                    let id = item.get("id").and_then(|v| v.as_str()).unwrap_or("");
                    // web-client ack levels: 2 = delivered, 3 = read
                    let status = match item.get("ack").and_then(|v| v.as_i64()) {
                        Some(2) => Some(MessageStatus::Delivered),
                        Some(3) => Some(MessageStatus::Read),
                        _ => None,
                    };
                    match (id.is_empty(), status) {
                        (false, Some(status)) => Some(SessionEvent::Receipt {
                            provider_message_id: id.to_string(),
                            status,
                        }),
                        _ => None,
                    }
                }
                Some("state") => match item.get("state").and_then(|v| v.as_str()) {
                    Some("ready") => Some(SessionEvent::Up),
                    Some("disconnected") => Some(SessionEvent::Down),
                    Some("logged_out") => {
                        Some(SessionEvent::Fatal("account logged out".to_string()))
                    }
                    _ => None,
                },
                other => {
                    debug!("Ignoring unknown bridge event type: {:?}", other);
                    None
                }
            };
            if let Some(ev) = ev
                && events.send(ev).await.is_err()
            {
                anyhow::bail!("event stream closed");
            }
        }
        Ok(next)
    }
}

#[async_trait]
impl ProviderSession for WhatsAppSession {
    async fn connect(&self, events: mpsc::Sender<SessionEvent>) -> Result<(), ConnectError> {
        info!("Starting WhatsApp bridge session at {}", self.base_url);
        if self.api_key.is_empty() {
            return Err(ConnectError::InvalidCredentials(
                "bridge api key is empty".to_string(),
            ));
        }

        let client = Self::http_client()?;
        let response = client
            .post(format!("{}/session", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ConnectError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ConnectError::InvalidCredentials(
                "bridge rejected api key".to_string(),
            ));
        }
        if !response.status().is_success() {
            return Err(ConnectError::Rejected(format!(
                "bridge answered {}",
                response.status()
            )));
        }
        let body: JsonValue = response
            .json()
            .await
            .map_err(|e| ConnectError::Network(e.to_string()))?;

        match body.get("status").and_then(|v| v.as_str()) {
            Some("ready") => {
                let _ = events.send(SessionEvent::Up).await;
            }
            Some("pairing") => {
                // Account not linked yet; the ready state arrives on the
                // event stream once the user enters the code
                if let Some(code) = body.get("pairingCode").and_then(|v| v.as_str()) {
                    info!("WhatsApp bridge awaiting pairing");
                    let _ = events.send(SessionEvent::Pairing(code.to_string())).await;
                }
            }
            other => {
                return Err(ConnectError::Rejected(format!(
                    "unexpected session status: {other:?}"
                )));
            }
        }

        self.running.store(true, Ordering::SeqCst);
        let base_url = self.base_url.clone();
        let api_key = self.api_key.clone();
        let poll_interval = self.poll_interval;
        let running = self.running.clone();

        tokio::spawn(async move {
            info!("WhatsApp polling task started");
            let client = match Self::http_client() {
                Ok(c) => c,
                Err(e) => {
                    error!("Failed to build WhatsApp poll client: {}", e);
                    return;
                }
            };
            let mut cursor = 0i64;
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                if !running.load(Ordering::SeqCst) {
                    debug!("WhatsApp polling task stopping");
                    break;
                }
                match Self::poll_once(&client, &base_url, &api_key, cursor, &events).await {
                    Ok(next) => cursor = next,
                    Err(e) => {
                        if e.to_string().contains("event stream closed") {
                            break;
                        }
                        warn!("WhatsApp poll cycle failed: {}", e);
                    }
                }
            }
        });

        Ok(())
    }

    async fn send(
        &self,
        target: &str,
        content: &str,
        content_type: ContentType,
    ) -> Result<ProviderMessageId, SendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SendError::Transient(e.to_string()))?;

        let body = serde_json::json!({
            "to": target,
            "body": content,
            "type": content_type.to_string(),
        });
        let response = client
            .post(format!("{}/send", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SendError::Rejected(format!(
                "bridge answered {}",
                response.status()
            )));
        }
        let result: JsonValue = response
            .json()
            .await
            .map_err(|e| SendError::Transient(e.to_string()))?;
        let id = result
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SendError::Rejected("bridge returned no message id".to_string()))?;

        Ok(ProviderMessageId {
            id: id.to_string(),
            enqueued_at: Utc::now(),
        })
    }

    async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Ok(client) = Self::http_client() {
            let result = client
                .delete(format!("{}/session", self.base_url))
                .bearer_auth(&self.api_key)
                .send()
                .await;
            if let Err(e) = result {
                debug!("WhatsApp session teardown request failed: {}", e);
            }
        }
    }

    fn provider(&self) -> ProviderType {
        ProviderType::Whatsapp
    }
}
