use std::sync::Arc;

use duet_storage::{ConversationId, MessageRecord, NewMessage, UserId};
use snafu::ResultExt;
use tokio::sync::watch;

use crate::channel::{
    ConversationChannel, Snapshot, SnapshotStream, Subscription, SubscriptionHub, Update,
};
use crate::error::{
    BlockingTaskSnafu, ChatError, ChatResult, ConversationNotFoundSnafu, InvalidMessageSnafu,
    UnauthorizedSnafu,
};
use crate::store_call::{SharedStorage, store_call};

/// Append-only message ledger with live snapshot delivery.
#[derive(Clone)]
pub struct MessageLog {
    storage: SharedStorage,
    hub: Arc<SubscriptionHub>,
}

impl MessageLog {
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            storage,
            hub: Arc::new(SubscriptionHub::default()),
        }
    }

    /// Stores a message from a participant and pushes the new snapshot to every observer.
    ///
    /// Runs to completion even if the calling future is dropped.
    pub async fn append(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        sender_display_name: &str,
        text: &str,
    ) -> ChatResult<MessageRecord> {
        if text.trim().is_empty() {
            return InvalidMessageSnafu {
                stage: "append-validate-text",
                reason: "message text is empty",
            }
            .fail();
        }

        let log = self.clone();
        let conversation_id = conversation_id.clone();
        let input = NewMessage {
            sender_id: sender_id.clone(),
            sender_display_name: sender_display_name.to_string(),
            text: text.to_string(),
        };

        tokio::spawn(async move { log.append_detached(conversation_id, input).await })
            .await
            .context(BlockingTaskSnafu {
                stage: "append-task",
            })?
    }

    async fn append_detached(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> ChatResult<MessageRecord> {
        self.ensure_participant(&conversation_id, &input.sender_id).await?;
        let result = self.append_gated(&conversation_id, input).await;
        self.hub.release(&conversation_id);
        result
    }

    async fn append_gated(
        &self,
        conversation_id: &ConversationId,
        input: NewMessage,
    ) -> ChatResult<MessageRecord> {
        let channel = self.hub.channel(conversation_id);
        let _gate = channel.lock_gate().await;

        let target = conversation_id.clone();
        let record = store_call(&self.storage, "append-message", move |storage| {
            storage.append_message(&target, input)
        })
        .await?;

        tracing::debug!(
            conversation_id = %conversation_id,
            sender_id = %record.sender_id,
            seq = record.seq,
            "appended message"
        );

        // The write already succeeded; a failed re-read is reported to observers, not the sender.
        if let Err(error) = self.publish(&channel).await {
            tracing::warn!(
                conversation_id = %conversation_id,
                seq = record.seq,
                "snapshot after append failed: {error}"
            );
        }

        Ok(record)
    }

    /// All messages of the conversation in log order.
    pub async fn read_ordered(
        &self,
        conversation_id: &ConversationId,
    ) -> ChatResult<Vec<MessageRecord>> {
        let conversation_id = conversation_id.clone();
        store_call(&self.storage, "read-ordered", move |storage| {
            storage.list_messages(&conversation_id)
        })
        .await
    }

    /// Delivers the current snapshot to `on_update`, then a fresh one after every append,
    /// until the returned handle is unsubscribed or dropped.
    pub async fn subscribe<F>(
        &self,
        conversation_id: &ConversationId,
        on_update: F,
    ) -> ChatResult<Subscription>
    where
        F: FnMut(Update) + Send + 'static,
    {
        let result = self.subscribe_gated(conversation_id, on_update).await;
        // A failed subscribe drops its handle while the channel is still borrowed above.
        self.hub.release(conversation_id);
        result
    }

    async fn subscribe_gated<F>(
        &self,
        conversation_id: &ConversationId,
        on_update: F,
    ) -> ChatResult<Subscription>
    where
        F: FnMut(Update) + Send + 'static,
    {
        let channel = self.hub.channel(conversation_id);
        let _gate = channel.lock_gate().await;

        // Attached under the gate, so no append can slip between this read and the next push.
        let subscription = self.hub.attach(&channel, on_update);
        let snapshot = self.snapshot(conversation_id).await?;
        subscription.deliver(Update::Snapshot(Arc::new(snapshot)));

        tracing::debug!(
            conversation_id = %conversation_id,
            observers = channel.observer_count(),
            "subscribed"
        );
        Ok(subscription)
    }

    /// [`MessageLog::subscribe`] as a stream of updates.
    pub async fn watch(&self, conversation_id: &ConversationId) -> ChatResult<SnapshotStream> {
        let (sender, receiver) = watch::channel(None);
        let subscription = self
            .subscribe(conversation_id, move |update| {
                sender.send_replace(Some(update));
            })
            .await?;
        Ok(SnapshotStream::new(subscription, receiver))
    }

    /// Re-delivers the full current snapshot to every observer of the conversation.
    ///
    /// Used to recover observers after an [`Update::Lost`]. Returns how many observers
    /// received the snapshot.
    pub async fn resync(&self, conversation_id: &ConversationId) -> ChatResult<usize> {
        let result = {
            let channel = self.hub.channel(conversation_id);
            let _gate = channel.lock_gate().await;
            self.publish(&channel).await
        };
        self.hub.release(conversation_id);
        result
    }

    /// Live observers currently attached to the conversation.
    pub fn observer_count(&self, conversation_id: &ConversationId) -> usize {
        self.hub.observer_count(conversation_id)
    }

    async fn ensure_participant(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
    ) -> ChatResult<()> {
        let target = conversation_id.clone();
        let conversation = store_call(&self.storage, "append-load-conversation", move |storage| {
            storage.get_conversation(&target)
        })
        .await?;

        let Some(conversation) = conversation else {
            return ConversationNotFoundSnafu {
                stage: "append-load-conversation-missing",
                conversation_id: conversation_id.to_string(),
            }
            .fail();
        };

        if !conversation.has_participant(sender_id) {
            tracing::warn!(
                conversation_id = %conversation_id,
                sender_id = %sender_id,
                "rejected message from non-participant"
            );
            return UnauthorizedSnafu {
                stage: "append-check-participant",
                user_id: sender_id.to_string(),
                conversation_id: conversation_id.to_string(),
            }
            .fail();
        }

        Ok(())
    }

    async fn snapshot(&self, conversation_id: &ConversationId) -> ChatResult<Snapshot> {
        let messages = self.read_ordered(conversation_id).await?;
        Ok(Snapshot {
            conversation_id: conversation_id.clone(),
            messages,
        })
    }

    // Callers hold the channel gate.
    async fn publish(&self, channel: &ConversationChannel) -> ChatResult<usize> {
        let conversation_id = channel.conversation_id();
        match self.snapshot(conversation_id).await {
            Ok(snapshot) => Ok(channel.broadcast(&Update::Snapshot(Arc::new(snapshot)))),
            Err(error) => {
                let lost = ChatError::SubscriptionLost {
                    stage: "publish-snapshot",
                    conversation_id: conversation_id.to_string(),
                    details: error.to_string(),
                };
                channel.broadcast(&Update::Lost(Arc::new(lost)));
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use duet_storage::{
        ConversationCreation, ConversationRecord, ConversationStore, MemoryStorage, MessageStore,
        NewConversation, StorageError, StorageResult,
    };
    use futures::StreamExt;

    use super::*;
    use crate::error::ErrorKind;
    use crate::identity::{parse_user, resolve};

    fn user(raw: &str) -> UserId {
        parse_user(raw).expect("valid user id")
    }

    async fn log_with_pair(storage: SharedStorage) -> (MessageLog, ConversationId) {
        let id = resolve(&user("alice"), &user("bob")).expect("resolve");
        let input = NewConversation::new(id.clone(), user("alice"), user("bob"));
        storage
            .create_conversation_if_absent(input)
            .expect("create conversation");
        (MessageLog::new(storage), id)
    }

    fn recording() -> (Arc<Mutex<Vec<Update>>>, impl FnMut(Update) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |update: Update| {
            sink.lock().expect("updates lock").push(update)
        })
    }

    fn texts(update: &Update) -> Vec<String> {
        update
            .snapshot()
            .expect("snapshot update")
            .messages
            .iter()
            .map(|message| message.text.clone())
            .collect()
    }

    #[tokio::test]
    async fn read_ordered_returns_append_order() {
        let (log, id) = log_with_pair(Arc::new(MemoryStorage::new())).await;

        let m1 = log.append(&id, &user("alice"), "Alice", "m1").await.expect("m1");
        let m2 = log.append(&id, &user("bob"), "Bob", "m2").await.expect("m2");
        let m3 = log.append(&id, &user("alice"), "Alice", "m3").await.expect("m3");

        let ordered = log.read_ordered(&id).await.expect("read");
        assert_eq!(ordered, vec![m1.clone(), m2.clone(), m3.clone()]);
        assert!(m1.id != m2.id && m2.id != m3.id && m1.id != m3.id);
    }

    #[tokio::test]
    async fn blank_text_is_rejected_without_a_write() {
        let (log, id) = log_with_pair(Arc::new(MemoryStorage::new())).await;

        for text in ["", "   ", "\n\t"] {
            let error = log
                .append(&id, &user("alice"), "Alice", text)
                .await
                .expect_err("blank text");
            assert_eq!(error.kind(), ErrorKind::InvalidMessage);
        }
        assert!(log.read_ordered(&id).await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn non_participant_is_unauthorized() {
        let (log, id) = log_with_pair(Arc::new(MemoryStorage::new())).await;

        let error = log
            .append(&id, &user("mallory"), "Mallory", "let me in")
            .await
            .expect_err("outsider");
        assert_eq!(error.kind(), ErrorKind::Unauthorized);
        assert!(matches!(error, ChatError::Unauthorized { .. }));
        assert!(log.read_ordered(&id).await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn unknown_conversation_is_rejected() {
        let log = MessageLog::new(Arc::new(MemoryStorage::new()));
        let id = resolve(&user("alice"), &user("carol")).expect("resolve");

        let error = log
            .append(&id, &user("alice"), "Alice", "hello?")
            .await
            .expect_err("missing conversation");
        assert!(matches!(error, ChatError::ConversationNotFound { .. }));
    }

    #[tokio::test]
    async fn subscriber_gets_full_snapshots_in_order() {
        let (log, id) = log_with_pair(Arc::new(MemoryStorage::new())).await;
        let (seen, callback) = recording();

        let _subscription = log.subscribe(&id, callback).await.expect("subscribe");
        log.append(&id, &user("alice"), "Alice", "m1").await.expect("m1");
        log.append(&id, &user("bob"), "Bob", "m2").await.expect("m2");

        let seen = seen.lock().expect("updates lock");
        let rendered = seen.iter().map(texts).collect::<Vec<_>>();
        assert_eq!(
            rendered,
            vec![
                Vec::<String>::new(),
                vec!["m1".to_string()],
                vec!["m1".to_string(), "m2".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn unsubscribed_handle_receives_nothing_more() {
        let (log, id) = log_with_pair(Arc::new(MemoryStorage::new())).await;
        let (seen, callback) = recording();

        let subscription = log.subscribe(&id, callback).await.expect("subscribe");
        log.append(&id, &user("alice"), "Alice", "m1").await.expect("m1");
        subscription.unsubscribe();
        subscription.unsubscribe();
        log.append(&id, &user("bob"), "Bob", "m2").await.expect("m2");

        assert_eq!(seen.lock().expect("updates lock").len(), 2);
        assert_eq!(log.observer_count(&id), 0);
    }

    #[tokio::test]
    async fn subscriptions_to_one_conversation_are_isolated() {
        let (log, id) = log_with_pair(Arc::new(MemoryStorage::new())).await;
        let (first_seen, first) = recording();
        let (second_seen, second) = recording();

        let first = log.subscribe(&id, first).await.expect("first");
        let _second = log.subscribe(&id, second).await.expect("second");
        assert_eq!(log.observer_count(&id), 2);

        first.unsubscribe();
        log.append(&id, &user("alice"), "Alice", "only second sees this")
            .await
            .expect("append");

        assert_eq!(first_seen.lock().expect("lock").len(), 1);
        let second_seen = second_seen.lock().expect("lock");
        assert_eq!(second_seen.len(), 2);
        assert_eq!(texts(&second_seen[1]), vec!["only second sees this".to_string()]);
    }

    #[tokio::test]
    async fn watch_streams_snapshots() {
        let (log, id) = log_with_pair(Arc::new(MemoryStorage::new())).await;
        let mut stream = log.watch(&id).await.expect("watch");

        let initial = stream.next().await.expect("initial");
        assert!(initial.snapshot().expect("snapshot").is_empty());

        log.append(&id, &user("bob"), "Bob", "hey").await.expect("append");
        let next = stream.next().await.expect("after append");
        assert_eq!(texts(&next), vec!["hey".to_string()]);

        drop(stream);
        assert_eq!(log.observer_count(&id), 0);
    }

    #[tokio::test]
    async fn released_subscriptions_leave_no_channels_behind() {
        let (log, id) = log_with_pair(Arc::new(MemoryStorage::new())).await;

        for index in 0..100 {
            let ghost = ConversationId::parse(format!("ghost{index}_nobody")).expect("id");
            let subscription = log
                .subscribe(&ghost, |_update: Update| {})
                .await
                .expect("subscribe");
            subscription.unsubscribe();
        }
        assert_eq!(log.hub.channel_count(), 0);

        log.append(&id, &user("alice"), "Alice", "nobody listening")
            .await
            .expect("append");
        assert_eq!(log.resync(&id).await.expect("resync"), 0);
        assert_eq!(log.hub.channel_count(), 0);

        let live = log.subscribe(&id, |_update: Update| {}).await.expect("subscribe");
        assert_eq!(log.hub.channel_count(), 1);
        drop(live);
        assert_eq!(log.hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn unread_stream_keeps_only_the_latest_snapshot() {
        let (log, id) = log_with_pair(Arc::new(MemoryStorage::new())).await;
        let mut stream = log.watch(&id).await.expect("watch");

        for text in ["m1", "m2", "m3"] {
            log.append(&id, &user("alice"), "Alice", text).await.expect("append");
        }

        let latest = stream.next().await.expect("latest");
        assert_eq!(
            texts(&latest),
            vec!["m1".to_string(), "m2".to_string(), "m3".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_all_land_and_snapshots_never_regress() {
        let (log, id) = log_with_pair(Arc::new(MemoryStorage::new())).await;
        let (seen, callback) = recording();
        let _subscription = log.subscribe(&id, callback).await.expect("subscribe");

        let writers = (0..12).map(|index| {
            let log = log.clone();
            let id = id.clone();
            let sender = if index % 2 == 0 { "alice" } else { "bob" };
            tokio::spawn(async move {
                log.append(&id, &user(sender), sender, &format!("msg-{index}"))
                    .await
            })
        });
        for joined in futures::future::join_all(writers).await {
            joined.expect("task").expect("append");
        }

        let messages = log.read_ordered(&id).await.expect("read");
        assert_eq!(messages.len(), 12);
        assert!(messages.windows(2).all(|pair| pair[0].seq < pair[1].seq));

        let seen = seen.lock().expect("lock");
        let lengths = seen
            .iter()
            .map(|update| update.snapshot().expect("snapshot").len())
            .collect::<Vec<_>>();
        assert!(lengths.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(lengths.last().copied(), Some(12));
    }

    /// Memory store whose reads can be switched off to simulate a dropped backend.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        reads_down: AtomicBool,
    }

    impl FlakyStorage {
        fn check(&self, stage: &'static str) -> StorageResult<()> {
            if self.reads_down.load(Ordering::SeqCst) {
                return Err(StorageError::InvariantViolation {
                    stage,
                    details: "backend unreachable".to_string(),
                });
            }
            Ok(())
        }
    }

    impl ConversationStore for FlakyStorage {
        fn create_conversation_if_absent(
            &self,
            input: NewConversation,
        ) -> StorageResult<ConversationCreation> {
            self.inner.create_conversation_if_absent(input)
        }

        fn get_conversation(
            &self,
            conversation_id: &ConversationId,
        ) -> StorageResult<Option<ConversationRecord>> {
            self.inner.get_conversation(conversation_id)
        }

        fn list_conversations_for(
            &self,
            user_id: &UserId,
        ) -> StorageResult<Vec<ConversationRecord>> {
            self.inner.list_conversations_for(user_id)
        }
    }

    impl MessageStore for FlakyStorage {
        fn append_message(
            &self,
            conversation_id: &ConversationId,
            input: NewMessage,
        ) -> StorageResult<MessageRecord> {
            self.inner.append_message(conversation_id, input)
        }

        fn list_messages(
            &self,
            conversation_id: &ConversationId,
        ) -> StorageResult<Vec<MessageRecord>> {
            self.check("flaky-list-messages")?;
            self.inner.list_messages(conversation_id)
        }
    }

    #[tokio::test]
    async fn lost_delivery_is_explicit_and_resync_restores_the_full_snapshot() {
        let storage = Arc::new(FlakyStorage::default());
        let (log, id) = log_with_pair(storage.clone()).await;
        let (seen, callback) = recording();
        let _subscription = log.subscribe(&id, callback).await.expect("subscribe");

        storage.reads_down.store(true, Ordering::SeqCst);
        log.append(&id, &user("alice"), "Alice", "during outage")
            .await
            .expect("append itself succeeds");
        assert!(log.resync(&id).await.is_err());

        storage.reads_down.store(false, Ordering::SeqCst);
        assert_eq!(log.resync(&id).await.expect("resync"), 1);

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 4);
        for lost in &seen[1..3] {
            match lost {
                Update::Lost(error) => assert_eq!(error.kind(), ErrorKind::SubscriptionLost),
                Update::Snapshot(_) => panic!("expected a lost marker during the outage"),
            }
        }
        assert_eq!(texts(&seen[3]), vec!["during outage".to_string()]);
    }

    #[tokio::test]
    async fn subscribe_failure_leaves_no_observer_behind() {
        let storage = Arc::new(FlakyStorage::default());
        let (log, id) = log_with_pair(storage.clone()).await;
        storage.reads_down.store(true, Ordering::SeqCst);

        let (_seen, callback) = recording();
        let error = log.subscribe(&id, callback).await.expect_err("reads are down");
        assert_eq!(error.kind(), ErrorKind::StorageUnavailable);
        assert_eq!(log.observer_count(&id), 0);
        assert_eq!(log.hub.channel_count(), 0);
    }
}
