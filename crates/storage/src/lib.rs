pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, MessageId, UserId};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::{
    ConversationCreation, ConversationRecord, MessageRecord, NewConversation, NewMessage,
};

pub trait ConversationStore: Send + Sync {
    /// Inserts the conversation unless a row with the same id exists; never overwrites.
    fn create_conversation_if_absent(
        &self,
        input: NewConversation,
    ) -> StorageResult<ConversationCreation>;
    fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> StorageResult<Option<ConversationRecord>>;
    fn list_conversations_for(&self, user_id: &UserId) -> StorageResult<Vec<ConversationRecord>>;
}

pub trait MessageStore: Send + Sync {
    fn append_message(
        &self,
        conversation_id: &ConversationId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord>;
    /// All messages of the conversation ordered by `seq`, then `id`.
    fn list_messages(&self, conversation_id: &ConversationId) -> StorageResult<Vec<MessageRecord>>;
}

pub trait Storage: ConversationStore + MessageStore {}

impl<T> Storage for T where T: ConversationStore + MessageStore {}
