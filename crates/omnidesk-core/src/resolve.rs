//! Identity resolver — maps a channel-scoped external sender to a
//! stable (Client, Conversation) pair, creating either when absent
//!
//! Concurrent inbound messages for the same external sender serialize
//! through a per-identity lock; different identities proceed in
//! parallel. The store's uniqueness constraints plus retry-by-read
//! back the lock up when writers race from outside this process.

use crate::error::StoreError;
use crate::store::ConversationStore;
use crate::types::{Client, Conversation, ProviderType};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct IdentityResolver {
    store: Arc<dyn ConversationStore>,
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    /// Find or create the client and conversation for an external sender
    /// on a channel. At most one conversation ever results per
    /// `(channel_id, client)` pair, regardless of arrival order.
    pub async fn resolve(
        &self,
        channel_id: &str,
        provider: ProviderType,
        external_sender_id: &str,
        sender_name: Option<&str>,
    ) -> Result<(Client, Conversation), StoreError> {
        let key = (channel_id.to_string(), external_sender_id.to_string());
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.find_or_create(channel_id, provider, external_sender_id, sender_name)
                .await
        };
        // Evict the entry once no other task holds this identity's lock
        // (map + our clone = 2); a concurrent waiter keeps it alive
        self.locks.remove_if(&key, |_, v| Arc::strong_count(v) <= 2);
        result
    }

    async fn find_or_create(
        &self,
        channel_id: &str,
        provider: ProviderType,
        external_sender_id: &str,
        sender_name: Option<&str>,
    ) -> Result<(Client, Conversation), StoreError> {
        if let Some(conv) = self
            .store
            .find_conversation(channel_id, provider, external_sender_id)
            .await?
        {
            let client = self
                .store
                .get_client(&conv.client_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("client {}", conv.client_id)))?;
            return Ok((client, conv));
        }

        let client = match self.store.find_client(provider, external_sender_id).await? {
            Some(client) => client,
            None => {
                let name = sender_name
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Customer {external_sender_id}"));
                match self
                    .store
                    .create_client(&name, provider, external_sender_id)
                    .await
                {
                    Ok(client) => {
                        info!("Created client '{}' for {}:{}", name, provider, external_sender_id);
                        client
                    }
                    // Lost a creation race; the winner's row is authoritative
                    Err(StoreError::Conflict) => {
                        debug!("Client insert conflict for {}:{}, re-reading", provider, external_sender_id);
                        self.store
                            .find_client(provider, external_sender_id)
                            .await?
                            .ok_or_else(|| {
                                StoreError::NotFound(format!("client {provider}:{external_sender_id}"))
                            })?
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let conversation = match self.store.create_conversation(channel_id, &client.id).await {
            Ok(conv) => {
                info!("Created conversation {} on {} for client {}", conv.id, channel_id, client.id);
                conv
            }
            Err(StoreError::Conflict) => {
                debug!("Conversation insert conflict on {}, re-reading", channel_id);
                self.store
                    .find_conversation(channel_id, provider, external_sender_id)
                    .await?
                    .ok_or_else(|| {
                        StoreError::NotFound(format!("conversation on {channel_id} for {external_sender_id}"))
                    })?
            }
            Err(e) => return Err(e),
        };

        Ok((client, conversation))
    }
}
