//! Error taxonomy for the integration pipeline

use thiserror::Error;

/// Failure to establish a provider connection.
///
/// Only `Network` is considered transient; the registry never
/// auto-retries credential or rejection failures.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid or expired credentials: {0}")]
    InvalidCredentials(String),
    #[error("provider network error: {0}")]
    Network(String),
    #[error("provider rejected connection: {0}")]
    Rejected(String),
}

impl ConnectError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// Failure to deliver an outbound message to a provider
#[derive(Debug, Error)]
pub enum SendError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("provider rejected the message: {0}")]
    Rejected(String),
    #[error("transient send failure: {0}")]
    Transient(String),
}

/// Failure at the persistence boundary.
///
/// `Conflict` is kept distinct from other database failures so the
/// identity resolver can recover a uniqueness race by re-reading the
/// winning row instead of failing the event.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("uniqueness conflict")]
    Conflict,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(String),
}

/// Failure surfaced by the integration core to its callers
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("unknown conversation: {0}")]
    UnknownConversation(String),
    #[error("client {client_id} has no {provider} identity")]
    NoProviderIdentity {
        client_id: String,
        provider: crate::types::ProviderType,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_transience() {
        assert!(ConnectError::Network("timeout".to_string()).is_transient());
        assert!(!ConnectError::InvalidCredentials("expired token".to_string()).is_transient());
        assert!(!ConnectError::Rejected("banned".to_string()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let e = SendError::NotConnected;
        assert_eq!(e.to_string(), "channel is not connected");
        let e = StoreError::NotFound("conversation c-9".to_string());
        assert!(e.to_string().contains("c-9"));
    }
}
