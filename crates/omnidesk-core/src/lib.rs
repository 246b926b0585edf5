//! Core integration pipeline for omnidesk
//!
//! This crate holds the unified message model, the message normalizer,
//! the identity resolver, and the integration core that drives channel
//! events through normalization, identity resolution, and persistence.

pub mod error;
pub mod normalize;
pub mod pipeline;
pub mod resolve;
pub mod store;
pub mod types;

// Re-export main types
pub use error::{ConnectError, PipelineError, SendError, StoreError};
pub use pipeline::{IntegrationCore, OutboundSender, ProviderMessageId, SendOutcome};
pub use resolve::IdentityResolver;
pub use store::ConversationStore;
pub use types::{
    ChannelEvent, Client, ConnectionState, ContentType, Conversation, ConversationStatus,
    Direction, HubEvent, MessageStatus, ProviderType, UnifiedMessage,
};
