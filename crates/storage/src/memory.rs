use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::{NotFoundSnafu, PoisonedSnafu, StorageResult};
use super::ids::{ConversationId, MessageId, UserId};
use super::types::{
    ConversationCreation, ConversationRecord, MessageRecord, NewConversation, NewMessage,
};
use super::{ConversationStore, MessageStore};

/// Process-local store with the same contract as [`crate::SqliteStorage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, ConversationRecord>,
    messages: HashMap<ConversationId, Vec<MessageRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, stage: &'static str) -> StorageResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| PoisonedSnafu { stage }.build())
    }
}

impl ConversationStore for MemoryStorage {
    fn create_conversation_if_absent(
        &self,
        input: NewConversation,
    ) -> StorageResult<ConversationCreation> {
        input.ensure_distinct_participants("memory-conversation-create-participants")?;
        let mut state = self.lock("memory-conversation-create")?;
        if let Some(existing) = state.conversations.get(&input.id) {
            return Ok(ConversationCreation {
                record: existing.clone(),
                created: false,
            });
        }

        let record = ConversationRecord {
            id: input.id.clone(),
            participants: input.participants,
            created_at_unix_millis: unix_timestamp_millis(),
        };
        state.conversations.insert(input.id, record.clone());
        Ok(ConversationCreation {
            record,
            created: true,
        })
    }

    fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> StorageResult<Option<ConversationRecord>> {
        let state = self.lock("memory-conversation-get")?;
        Ok(state.conversations.get(conversation_id).cloned())
    }

    fn list_conversations_for(&self, user_id: &UserId) -> StorageResult<Vec<ConversationRecord>> {
        let state = self.lock("memory-conversation-list")?;
        let mut records = state
            .conversations
            .values()
            .filter(|record| record.has_participant(user_id))
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|left, right| {
            right
                .created_at_unix_millis
                .cmp(&left.created_at_unix_millis)
                .then_with(|| right.id.cmp(&left.id))
        });
        Ok(records)
    }
}

impl MessageStore for MemoryStorage {
    fn append_message(
        &self,
        conversation_id: &ConversationId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        let mut state = self.lock("memory-message-append")?;
        if !state.conversations.contains_key(conversation_id) {
            return NotFoundSnafu {
                stage: "memory-message-append-missing",
                entity: "conversation",
                id: conversation_id.to_string(),
            }
            .fail();
        }

        let log = state.messages.entry(conversation_id.clone()).or_default();
        let next_seq = log.last().map_or(1, |last| last.seq + 1);
        let record = MessageRecord {
            id: MessageId::new_v7(),
            conversation_id: conversation_id.clone(),
            seq: next_seq,
            sender_id: input.sender_id,
            sender_display_name: input.sender_display_name,
            text: input.text,
            created_at_unix_millis: unix_timestamp_millis(),
        };
        log.push(record.clone());
        Ok(record)
    }

    fn list_messages(&self, conversation_id: &ConversationId) -> StorageResult<Vec<MessageRecord>> {
        let state = self.lock("memory-message-list")?;
        // The log vector is appended in seq order, so no sort is needed.
        Ok(state
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}

fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}
