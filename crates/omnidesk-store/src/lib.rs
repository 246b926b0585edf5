//! SQLite persistence for omnidesk
//!
//! Implements the `ConversationStore` boundary on a single SQLite
//! database: clients, conversations, and the append-only message log.

pub mod sqlite;

pub use sqlite::SqliteStore;
