use duet_storage::StorageError;
use snafu::Snafu;

/// Coarse failure classes callers branch on; [`ChatError`] carries the detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidIdentity,
    InvalidMessage,
    Unauthorized,
    StorageUnavailable,
    SubscriptionLost,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("invalid participant identity '{raw}': {reason}"))]
    InvalidIdentity {
        stage: &'static str,
        raw: String,
        reason: &'static str,
    },
    #[snafu(display("message rejected on `{stage}`: {reason}"))]
    InvalidMessage {
        stage: &'static str,
        reason: &'static str,
    },
    #[snafu(display("user '{user_id}' is not a participant of conversation '{conversation_id}'"))]
    Unauthorized {
        stage: &'static str,
        user_id: String,
        conversation_id: String,
    },
    #[snafu(display("no authenticated user for this session on `{stage}`"))]
    Unauthenticated { stage: &'static str },
    #[snafu(display("conversation '{conversation_id}' does not exist"))]
    ConversationNotFound {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("session has no active conversation on `{stage}`"))]
    NoActiveConversation { stage: &'static str },
    #[snafu(display("storage unavailable on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("storage task failed on `{stage}`: {source}"))]
    BlockingTask {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
    #[snafu(display("live delivery for conversation '{conversation_id}' was interrupted: {details}"))]
    SubscriptionLost {
        stage: &'static str,
        conversation_id: String,
        details: String,
    },
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidIdentity { .. } => ErrorKind::InvalidIdentity,
            Self::InvalidMessage { .. } => ErrorKind::InvalidMessage,
            Self::Unauthorized { .. }
            | Self::Unauthenticated { .. }
            | Self::ConversationNotFound { .. }
            | Self::NoActiveConversation { .. } => ErrorKind::Unauthorized,
            Self::Storage { .. } | Self::BlockingTask { .. } => ErrorKind::StorageUnavailable,
            Self::SubscriptionLost { .. } => ErrorKind::SubscriptionLost,
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
