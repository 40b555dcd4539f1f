//! Two-party conversations with live, snapshot-based message delivery.
//!
//! - [`identity`] derives the canonical id of a user pair.
//! - [`ConversationDirectory`] creates each pair's conversation exactly once.
//! - [`MessageLog`] is the append-only ledger; it pushes full ordered
//!   [`Snapshot`]s to every subscriber after each append.
//! - [`ConversationSession`] ties them together for one signed-in user.

pub mod channel;
pub mod conversation;
pub mod error;
pub mod identity;
pub mod message_log;
pub mod profile;
pub mod session;
pub mod settings;
mod store_call;
pub mod view;

use std::sync::Arc;

use duet_storage::{MemoryStorage, SqliteStorage};
use snafu::ResultExt;

pub use channel::{Snapshot, SnapshotStream, Subscription, Update};
pub use conversation::ConversationDirectory;
pub use error::{ChatError, ChatResult, ErrorKind};
pub use identity::{parse_user, resolve};
pub use message_log::MessageLog;
pub use profile::{
    Authenticator, ProfileDirectory, StaticAuthenticator, StaticProfiles, UserProfile,
};
pub use session::{ConversationSession, SessionContext, SessionView};
pub use settings::{ChatSettings, SettingsStore};
pub use store_call::SharedStorage;
pub use view::{MessageView, UNKNOWN_SENDER_LABEL};

pub use duet_storage::{ConversationId, ConversationRecord, MessageId, MessageRecord, UserId};

/// The conversation directory and message log over one shared store.
///
/// Cloning is cheap; clones share subscribers.
#[derive(Clone)]
pub struct ChatCore {
    pub conversations: ConversationDirectory,
    pub log: MessageLog,
}

impl ChatCore {
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            conversations: ConversationDirectory::new(Arc::clone(&storage)),
            log: MessageLog::new(storage),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// Opens the SQLite database named by `settings`.
    pub async fn open(settings: &ChatSettings) -> ChatResult<Self> {
        let location = settings.database_path.display().to_string();
        let storage = SqliteStorage::open(&location)
            .await
            .context(error::StorageSnafu {
                stage: "open-sqlite-storage",
            })?;
        tracing::info!(database_url = storage.database_url(), "opened chat storage");
        Ok(Self::new(Arc::new(storage)))
    }

    pub fn session(&self, context: SessionContext) -> ConversationSession {
        ConversationSession::new(self.clone(), context)
    }
}
