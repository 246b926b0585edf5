//! Instagram Direct session over the direct-inbox bridge HTTP API
//!
//! Same bridge pattern as the other providers: `POST /session` with the
//! account's session token, `GET /inbox` cursor poll returning direct
//! thread items verbatim (`user_id`/`item_type`/`item_id` shape),
//! `POST /send`.

use crate::session::{ProviderSession, SessionEvent};
use async_trait::async_trait;
use chrono::Utc;
use omnidesk_core::error::{ConnectError, SendError};
use omnidesk_core::pipeline::ProviderMessageId;
use omnidesk_core::types::{ContentType, ProviderType};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct InstagramSession {
    base_url: String,
    username: String,
    session_token: String,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
}

impl InstagramSession {
    pub fn new(
        base_url: String,
        username: String,
        session_token: String,
        poll_interval: Duration,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            session_token,
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

    async fn poll_once(
        client: &reqwest::Client,
        base_url: &str,
        cursor: i64,
        events: &mpsc::Sender<SessionEvent>,
    ) -> anyhow::Result<i64> {
        let body: JsonValue = client
            .get(format!("{base_url}/inbox"))
            .query(&[("after", cursor.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let next = body.get("cursor").and_then(|v| v.as_i64()).unwrap_or(cursor);
        let Some(items) = body.get("items").and_then(|v| v.as_array()) else {
            return Ok(next);
        };

        for item in items {
            let ev = match item.get("type").and_then(|v| v.as_str()) {
                Some("item") => item.get("payload").cloned().map(SessionEvent::Payload),
                Some("disconnect") => Some(SessionEvent::Down),
                Some("challenge_required") => Some(SessionEvent::Fatal(
                    "account challenge required".to_string(),
                )),
                other => {
                    debug!("Ignoring unknown inbox event type: {:?}", other);
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
impl ProviderSession for InstagramSession {
    async fn connect(&self, events: mpsc::Sender<SessionEvent>) -> Result<(), ConnectError> {
        info!(
            "Starting Instagram bridge session for @{} at {}",
            self.username, self.base_url
        );
        if self.username.is_empty() || self.session_token.is_empty() {
            return Err(ConnectError::InvalidCredentials(
                "instagram username or session token is empty".to_string(),
            ));
        }

        let client = Self::http_client()?;
        let response = client
            .post(format!("{}/session", self.base_url))
            .json(&serde_json::json!({
                "username": self.username,
                "token": self.session_token,
            }))
            .send()
            .await
            .map_err(|e| ConnectError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ConnectError::InvalidCredentials(
                "instagram session rejected".to_string(),
            ));
        }
        if !response.status().is_success() {
            return Err(ConnectError::Rejected(format!(
                "bridge answered {}",
                response.status()
            )));
        }

        let _ = events.send(SessionEvent::Up).await;
        self.running.store(true, Ordering::SeqCst);

        let base_url = self.base_url.clone();
        let poll_interval = self.poll_interval;
        let running = self.running.clone();
        tokio::spawn(async move {
            info!("Instagram polling task started");
            let client = match Self::http_client() {
                Ok(c) => c,
                Err(e) => {
                    error!("Failed to build Instagram poll client: {}", e);
                    return;
                }
            };
            let mut cursor = 0i64;
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                if !running.load(Ordering::SeqCst) {
                    debug!("Instagram polling task stopping");
                    break;
                }
                match Self::poll_once(&client, &base_url, cursor, &events).await {
                    Ok(next) => cursor = next,
                    Err(e) => {
                        if e.to_string().contains("event stream closed") {
                            break;
                        }
                        warn!("Instagram poll cycle failed: {}", e);
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
        _content_type: ContentType,
    ) -> Result<ProviderMessageId, SendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SendError::Transient(e.to_string()))?;

        let response = client
            .post(format!("{}/send", self.base_url))
            .json(&serde_json::json!({ "userID": target, "text": content }))
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
            .get("item_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SendError::Rejected("bridge returned no item id".to_string()))?;

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
                .send()
                .await;
            if let Err(e) = result {
                debug!("Instagram session teardown request failed: {}", e);
            }
        }
    }

    fn provider(&self) -> ProviderType {
        ProviderType::Instagram
    }
}
