//! Channel adapters and registry for omnidesk
//!
//! This crate provides the provider session boundary, the adapter state
//! machine around it, and the registry that aggregates all adapters
//! into one channel-event stream for the integration core.

pub mod adapter;
pub mod facebook;
pub mod instagram;
pub mod registry;
pub mod session;
pub mod whatsapp;

// Re-export main types
pub use adapter::ChannelAdapter;
pub use facebook::FacebookSession;
pub use instagram::InstagramSession;
pub use registry::{ChannelRegistry, ChannelState, RegistryError, RegistrySender};
pub use session::{ProviderSession, SessionEvent};
pub use whatsapp::WhatsAppSession;
