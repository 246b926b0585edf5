//! Persistence boundary consumed by the resolver and the integration core
//!
//! All writers to the conversation/client/message store go through this
//! trait; no other component touches the database directly.

use crate::error::StoreError;
use crate::types::{
    Client, Conversation, ConversationStatus, MessageStatus, ProviderType, UnifiedMessage,
};
use async_trait::async_trait;

/// Storage operations required by the pipeline.
///
/// `create_client` and `create_conversation` must surface a uniqueness
/// violation as [`StoreError::Conflict`], distinct from other failures,
/// so the resolver can retry by re-reading the winner.
/// `append_message` must insert the message row and bump the
/// conversation's `last_message_at` in one transaction.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Find the conversation on `channel_id` whose client owns
    /// `external_sender_id` on `provider`.
    async fn find_conversation(
        &self,
        channel_id: &str,
        provider: ProviderType,
        external_sender_id: &str,
    ) -> Result<Option<Conversation>, StoreError>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    async fn get_client(&self, id: &str) -> Result<Option<Client>, StoreError>;

    async fn find_client(
        &self,
        provider: ProviderType,
        external_sender_id: &str,
    ) -> Result<Option<Client>, StoreError>;

    async fn create_client(
        &self,
        name: &str,
        provider: ProviderType,
        external_sender_id: &str,
    ) -> Result<Client, StoreError>;

    /// Create a `pending` conversation for `(channel_id, client_id)`.
    async fn create_conversation(
        &self,
        channel_id: &str,
        client_id: &str,
    ) -> Result<Conversation, StoreError>;

    /// Persist a message under `conversation_id` and update the
    /// conversation's `last_message_at`, transactionally.
    async fn append_message(
        &self,
        msg: &UnifiedMessage,
        conversation_id: &str,
    ) -> Result<(), StoreError>;

    async fn update_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<(), StoreError>;

    /// Update a message's status by its provider-assigned id (receipt
    /// path). Returns the updated message when a row matched, so the
    /// pipeline can re-publish it with the new status.
    async fn update_message_status_by_provider_id(
        &self,
        provider_message_id: &str,
        status: MessageStatus,
    ) -> Result<Option<UnifiedMessage>, StoreError>;

    async fn set_provider_message_id(
        &self,
        message_id: &str,
        provider_message_id: &str,
    ) -> Result<(), StoreError>;

    async fn update_conversation_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<(), StoreError>;

    /// Most recent messages in a conversation, newest last.
    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<UnifiedMessage>, StoreError>;
}
