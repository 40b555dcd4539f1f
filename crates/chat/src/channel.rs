//! Per-conversation observer registry behind live snapshot delivery.
//!
//! Every observer receives complete, ordered snapshots of a conversation's log,
//! never deltas. Deliveries for one conversation pass through a single async
//! gate, so an observer never sees a snapshot older than one it already got.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use duet_storage::{ConversationId, MessageRecord};
use futures::Stream;
use tokio::sync::watch;

use crate::error::ChatError;

/// The full ordered message list of one conversation at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub conversation_id: ConversationId,
    pub messages: Vec<MessageRecord>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum Update {
    Snapshot(Arc<Snapshot>),
    /// Delivery broke; the next `Snapshot` for this observer is the full current state.
    Lost(Arc<ChatError>),
}

impl Update {
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            Self::Snapshot(snapshot) => Some(snapshot),
            Self::Lost(_) => None,
        }
    }
}

type Callback = Box<dyn FnMut(Update) + Send>;

thread_local! {
    // Observer whose callback is running on this thread, if any.
    static DELIVERING: Cell<Option<u64>> = const { Cell::new(None) };
}

struct Observer {
    id: u64,
    attached: AtomicBool,
    // Delivery holds this lock while the callback runs, so `unsubscribe` from another
    // thread returns only once no callback is running or can start.
    callback: Mutex<Option<Callback>>,
}

impl Observer {
    fn new(id: u64, callback: Callback) -> Self {
        Self {
            id,
            attached: AtomicBool::new(true),
            callback: Mutex::new(Some(callback)),
        }
    }

    fn notify(&self, update: Update) -> bool {
        let mut slot = lock_unpoisoned(&self.callback);
        if !self.is_attached() {
            let stale = slot.take();
            drop(slot);
            drop(stale);
            return false;
        }
        let Some(callback) = slot.as_mut() else {
            return false;
        };

        let outer = DELIVERING.replace(Some(self.id));
        callback(update);
        DELIVERING.set(outer);

        // The callback may have unsubscribed its own handle.
        if !self.is_attached() {
            let stale = slot.take();
            drop(slot);
            drop(stale);
        }
        true
    }

    fn detach(&self) -> bool {
        let was_attached = self.attached.swap(false, Ordering::AcqRel);
        // Inside our own callback the slot lock is already held by this thread;
        // `notify` drops the callback once it returns.
        if DELIVERING.get() != Some(self.id) {
            let stale = lock_unpoisoned(&self.callback).take();
            drop(stale);
        }
        was_attached
    }

    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}

pub(crate) struct ConversationChannel {
    conversation_id: ConversationId,
    gate: tokio::sync::Mutex<()>,
    observers: Mutex<Vec<Arc<Observer>>>,
}

impl ConversationChannel {
    fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            gate: tokio::sync::Mutex::new(()),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Serializes log writes and snapshot deliveries for this conversation.
    pub(crate) async fn lock_gate(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    /// Hands `update` to every attached observer and returns how many received it.
    pub(crate) fn broadcast(&self, update: &Update) -> usize {
        let observers = lock_unpoisoned(&self.observers).clone();
        observers
            .iter()
            .filter(|observer| observer.notify(update.clone()))
            .count()
    }

    pub(crate) fn observer_count(&self) -> usize {
        lock_unpoisoned(&self.observers).len()
    }

    fn attach(&self, observer: Arc<Observer>) {
        lock_unpoisoned(&self.observers).push(observer);
    }

    fn remove(&self, observer_id: u64) {
        lock_unpoisoned(&self.observers).retain(|observer| observer.id != observer_id);
    }
}

/// Owns one [`ConversationChannel`] per conversation with observers or work in flight.
///
/// An entry is dropped only when nobody else holds its `Arc` and no observer is attached,
/// so every concurrent writer and subscriber of a conversation shares one gate.
#[derive(Default)]
pub(crate) struct SubscriptionHub {
    channels: Mutex<HashMap<ConversationId, Arc<ConversationChannel>>>,
    next_observer_id: AtomicU64,
}

impl SubscriptionHub {
    pub(crate) fn channel(&self, conversation_id: &ConversationId) -> Arc<ConversationChannel> {
        let mut channels = lock_unpoisoned(&self.channels);
        Arc::clone(
            channels
                .entry(conversation_id.clone())
                .or_insert_with(|| Arc::new(ConversationChannel::new(conversation_id.clone()))),
        )
    }

    pub(crate) fn observer_count(&self, conversation_id: &ConversationId) -> usize {
        lock_unpoisoned(&self.channels)
            .get(conversation_id)
            .map_or(0, |channel| channel.observer_count())
    }

    /// Registers `callback` on `channel`. The returned handle is live immediately.
    pub(crate) fn attach<F>(
        self: &Arc<Self>,
        channel: &Arc<ConversationChannel>,
        callback: F,
    ) -> Subscription
    where
        F: FnMut(Update) + Send + 'static,
    {
        let observer = Arc::new(Observer::new(
            self.next_observer_id.fetch_add(1, Ordering::Relaxed),
            Box::new(callback),
        ));
        channel.attach(Arc::clone(&observer));

        Subscription {
            conversation_id: channel.conversation_id.clone(),
            observer,
            channel: Arc::downgrade(channel),
            hub: Arc::downgrade(self),
        }
    }

    /// Forgets the conversation's channel if it is idle.
    ///
    /// Callers must have dropped their own clone of the channel first.
    pub(crate) fn release(&self, conversation_id: &ConversationId) {
        let mut channels = lock_unpoisoned(&self.channels);
        let idle = channels.get(conversation_id).is_some_and(|channel| {
            Arc::strong_count(channel) == 1 && channel.observer_count() == 0
        });
        if idle {
            channels.remove(conversation_id);
        }
    }

    #[cfg(test)]
    pub(crate) fn channel_count(&self) -> usize {
        lock_unpoisoned(&self.channels).len()
    }
}

/// Handle for one live subscription. Dropping it unsubscribes.
pub struct Subscription {
    conversation_id: ConversationId,
    observer: Arc<Observer>,
    channel: Weak<ConversationChannel>,
    hub: Weak<SubscriptionHub>,
}

impl Subscription {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn is_active(&self) -> bool {
        self.observer.is_attached()
    }

    /// Stops delivery and releases the observer slot. Calling it again is a no-op.
    ///
    /// May be called from inside this subscription's own callback; the update being
    /// handled is the last one it sees.
    pub fn unsubscribe(&self) {
        let was_attached = self.observer.detach();
        if let Some(channel) = self.channel.upgrade() {
            channel.remove(self.observer.id);
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.release(&self.conversation_id);
        }
        if was_attached {
            tracing::debug!(
                conversation_id = %self.conversation_id,
                observer = self.observer.id,
                "unsubscribed"
            );
        }
    }

    pub(crate) fn deliver(&self, update: Update) -> bool {
        self.observer.notify(update)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("conversation_id", &self.conversation_id)
            .field("observer", &self.observer.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Updates of one subscription as a [`Stream`]. Dropping the stream unsubscribes.
///
/// Only the newest update is kept: a slow reader skips straight to the latest
/// full snapshot instead of queueing every intermediate one.
pub struct SnapshotStream {
    subscription: Subscription,
    updates: Pin<Box<dyn Stream<Item = Update> + Send>>,
}

impl SnapshotStream {
    pub(crate) fn new(subscription: Subscription, receiver: watch::Receiver<Option<Update>>) -> Self {
        let updates = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.changed().await.ok()?;
            let update = receiver.borrow_and_update().clone()?;
            Some((update, receiver))
        });
        Self {
            subscription,
            updates: Box::pin(updates),
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl Stream for SnapshotStream {
    type Item = Update;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Update>> {
        self.get_mut().updates.as_mut().poll_next(cx)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
