use super::error::{InvariantViolationSnafu, StorageResult};
use super::ids::{ConversationId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    /// Always stored in ascending order so equal pairs compare equal.
    pub participants: [UserId; 2],
    pub created_at_unix_millis: u64,
}

impl ConversationRecord {
    pub fn has_participant(&self, user_id: &UserId) -> bool {
        self.participants.iter().any(|participant| participant == user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub id: ConversationId,
    pub participants: [UserId; 2],
}

impl NewConversation {
    pub fn new(id: ConversationId, first: UserId, second: UserId) -> Self {
        let participants = if first <= second {
            [first, second]
        } else {
            [second, first]
        };
        Self { id, participants }
    }

    pub(crate) fn ensure_distinct_participants(&self, stage: &'static str) -> StorageResult<()> {
        let [first, second] = &self.participants;
        if first == second {
            return InvariantViolationSnafu {
                stage,
                details: format!("conversation '{}' names '{}' twice", self.id, first),
            }
            .fail();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationCreation {
    pub record: ConversationRecord,
    /// False when the conversation already existed and was left untouched.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    /// Store-assigned ordering key, strictly increasing within a conversation.
    pub seq: u64,
    pub sender_id: UserId,
    pub sender_display_name: String,
    pub text: String,
    pub created_at_unix_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub sender_display_name: String,
    pub text: String,
}
