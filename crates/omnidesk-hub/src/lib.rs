//! Real-time operator hub for omnidesk
//!
//! Axum-based HTTP + WebSocket server. Persisted pipeline events fan
//! out to operator sockets scoped by conversation room; transient
//! typing and read signals are relayed peer-to-peer within a room and
//! never persisted.

pub mod protocol;
pub mod rooms;
pub mod server;

pub use protocol::{ClientCommand, ServerEvent};
pub use rooms::RoomManager;
pub use server::{HubServer, HubState};
