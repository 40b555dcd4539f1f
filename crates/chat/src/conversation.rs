use duet_storage::{ConversationId, ConversationRecord, NewConversation, UserId};

use crate::error::ChatResult;
use crate::identity;
use crate::store_call::{SharedStorage, store_call};

/// Create-once registry of two-party conversations.
#[derive(Clone)]
pub struct ConversationDirectory {
    storage: SharedStorage,
}

impl ConversationDirectory {
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }

    /// Returns the pair's conversation id, creating the record on first contact.
    ///
    /// Safe to call repeatedly and from racing callers: every caller writes the
    /// same participants, and an existing record is never rewritten.
    pub async fn ensure_conversation(
        &self,
        first: &UserId,
        second: &UserId,
    ) -> ChatResult<ConversationId> {
        let conversation_id = identity::resolve(first, second)?;
        let input = NewConversation::new(conversation_id.clone(), first.clone(), second.clone());

        let creation = store_call(&self.storage, "ensure-conversation", move |storage| {
            storage.create_conversation_if_absent(input)
        })
        .await?;

        if creation.created {
            tracing::info!(conversation_id = %conversation_id, "created conversation");
        } else {
            tracing::debug!(conversation_id = %conversation_id, "conversation already exists");
        }

        Ok(creation.record.id)
    }

    pub async fn conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> ChatResult<Option<ConversationRecord>> {
        let conversation_id = conversation_id.clone();
        store_call(&self.storage, "load-conversation", move |storage| {
            storage.get_conversation(&conversation_id)
        })
        .await
    }

    /// Conversations `user_id` takes part in, newest first.
    pub async fn conversations_for(&self, user_id: &UserId) -> ChatResult<Vec<ConversationRecord>> {
        let user_id = user_id.clone();
        store_call(&self.storage, "list-conversations", move |storage| {
            storage.list_conversations_for(&user_id)
        })
        .await
    }
}
