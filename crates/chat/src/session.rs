use std::sync::Arc;

use duet_storage::{ConversationId, MessageRecord, UserId};
use tokio::sync::watch;

use crate::ChatCore;
use crate::channel::{Snapshot, Subscription, Update};
use crate::error::{
    ChatError, ChatResult, InvalidMessageSnafu, NoActiveConversationSnafu, UnauthenticatedSnafu,
};
use crate::profile::{Authenticator, ProfileDirectory, UserProfile};
use crate::settings::DEFAULT_PLACEHOLDER_DISPLAY_NAME;
use crate::view::{MessageView, render_for_viewer};

/// Everything a session needs about its user, passed in instead of read from globals.
#[derive(Clone)]
pub struct SessionContext {
    pub local_user: UserId,
    pub auth: Arc<dyn Authenticator>,
    pub profiles: Arc<dyn ProfileDirectory>,
    pub placeholder_display_name: String,
}

impl SessionContext {
    pub fn new(
        local_user: UserId,
        auth: Arc<dyn Authenticator>,
        profiles: Arc<dyn ProfileDirectory>,
    ) -> Self {
        Self {
            local_user,
            auth,
            profiles,
            placeholder_display_name: DEFAULT_PLACEHOLDER_DISPLAY_NAME.to_string(),
        }
    }

    pub fn with_placeholder_display_name(mut self, name: impl Into<String>) -> Self {
        self.placeholder_display_name = name.into();
        self
    }
}

/// What the session currently shows.
#[derive(Debug, Clone, Default)]
pub struct SessionView {
    pub conversation_id: Option<ConversationId>,
    pub snapshot: Option<Arc<Snapshot>>,
    /// Set when live delivery broke; cleared by the next full snapshot.
    pub lost: Option<Arc<ChatError>>,
}

struct ActiveConversation {
    conversation_id: ConversationId,
    peer: UserId,
    subscription: Subscription,
}

/// One user's view onto one two-party conversation at a time.
///
/// Holds at most one live subscription: switching peers or closing the session
/// unsubscribes before anything else happens.
pub struct ConversationSession {
    context: SessionContext,
    core: ChatCore,
    active: Option<ActiveConversation>,
    view: Arc<watch::Sender<SessionView>>,
}

impl ConversationSession {
    pub fn new(core: ChatCore, context: SessionContext) -> Self {
        let (view, _) = watch::channel(SessionView::default());
        Self {
            context,
            core,
            active: None,
            view: Arc::new(view),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.context.local_user
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.active.as_ref().map(|active| &active.conversation_id)
    }

    pub fn peer(&self) -> Option<&UserId> {
        self.active.as_ref().map(|active| &active.peer)
    }

    pub fn is_subscribed(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.subscription.is_active())
    }

    /// Opens the conversation with `peer`, creating it on first contact, and starts
    /// live delivery into [`ConversationSession::updates`].
    pub async fn select_peer(&mut self, peer: &UserId) -> ChatResult<ConversationId> {
        self.release();
        self.require_authenticated("select-peer-auth").await?;

        let conversation_id = self
            .core
            .conversations
            .ensure_conversation(&self.context.local_user, peer)
            .await?;

        self.view.send_replace(SessionView {
            conversation_id: Some(conversation_id.clone()),
            snapshot: None,
            lost: None,
        });

        let view = Arc::clone(&self.view);
        let expected = conversation_id.clone();
        let subscription = match self
            .core
            .log
            .subscribe(&conversation_id, move |update| {
                apply_update(&view, &expected, update);
            })
            .await
        {
            Ok(subscription) => subscription,
            Err(error) => {
                self.view.send_replace(SessionView::default());
                return Err(error);
            }
        };

        tracing::info!(
            local_user = %self.context.local_user,
            peer = %peer,
            conversation_id = %conversation_id,
            "opened conversation"
        );

        self.active = Some(ActiveConversation {
            conversation_id: conversation_id.clone(),
            peer: peer.clone(),
            subscription,
        });
        Ok(conversation_id)
    }

    /// Appends `text` to the active conversation as the local user.
    pub async fn send(&self, text: &str) -> ChatResult<MessageRecord> {
        if text.trim().is_empty() {
            return InvalidMessageSnafu {
                stage: "session-send-validate",
                reason: "message text is empty",
            }
            .fail();
        }
        self.require_authenticated("session-send-auth").await?;

        let Some(active) = self.active.as_ref() else {
            return NoActiveConversationSnafu {
                stage: "session-send",
            }
            .fail();
        };

        let display_name = self.resolve_display_name().await;
        self.core
            .log
            .append(
                &active.conversation_id,
                &self.context.local_user,
                &display_name,
                text,
            )
            .await
    }

    /// Re-requests the full snapshot after a lost delivery.
    pub async fn resync(&self) -> ChatResult<usize> {
        let Some(active) = self.active.as_ref() else {
            return NoActiveConversationSnafu {
                stage: "session-resync",
            }
            .fail();
        };
        self.core.log.resync(&active.conversation_id).await
    }

    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.view.borrow().snapshot.clone()
    }

    pub fn updates(&self) -> watch::Receiver<SessionView> {
        self.view.subscribe()
    }

    pub fn messages_for_display(&self) -> Vec<MessageView> {
        self.latest_snapshot()
            .map(|snapshot| render_for_viewer(&snapshot.messages, &self.context.local_user))
            .unwrap_or_default()
    }

    /// Everyone the local user can start a conversation with.
    pub async fn peers(&self) -> ChatResult<Vec<UserProfile>> {
        let mut users = self.context.profiles.list_users().await?;
        users.retain(|profile| profile.user_id != self.context.local_user);
        Ok(users)
    }

    /// Ends live delivery. The session can select another peer afterwards.
    pub fn close(&mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(active) = self.active.take() {
            active.subscription.unsubscribe();
            tracing::debug!(
                conversation_id = %active.conversation_id,
                "released conversation subscription"
            );
        }
        self.view.send_replace(SessionView::default());
    }

    async fn require_authenticated(&self, stage: &'static str) -> ChatResult<()> {
        match self.context.auth.current_user().await {
            Some(user) if user == self.context.local_user => Ok(()),
            _ => UnauthenticatedSnafu { stage }.fail(),
        }
    }

    async fn resolve_display_name(&self) -> String {
        match self
            .context
            .profiles
            .display_name(&self.context.local_user)
            .await
        {
            Ok(Some(name)) if !name.trim().is_empty() => name,
            Ok(_) => self.context.placeholder_display_name.clone(),
            Err(error) => {
                tracing::warn!(
                    user_id = %self.context.local_user,
                    "profile lookup failed, sending with placeholder name: {error}"
                );
                self.context.placeholder_display_name.clone()
            }
        }
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.subscription.unsubscribe();
        }
    }
}

fn apply_update(view: &watch::Sender<SessionView>, expected: &ConversationId, update: Update) {
    view.send_if_modified(|current| {
        if current.conversation_id.as_ref() != Some(expected) {
            return false;
        }
        match update {
            Update::Snapshot(snapshot) => {
                current.snapshot = Some(snapshot);
                current.lost = None;
            }
            Update::Lost(error) => current.lost = Some(error),
        }
        true
    });
}
