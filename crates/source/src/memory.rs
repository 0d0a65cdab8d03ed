use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use snafu::OptionExt;
use tokio::sync::{RwLock, oneshot};

use super::error::{
    ConversationNotFoundSnafu, IdentityLookupSnafu, SourceError, SourceResult,
    SubscriptionClosedSnafu,
};
use super::ids::{ConversationId, UserId};
use super::subscription::{Subscription, SubscriptionSink};
use super::types::{FeedEvent, Identity, Message, SearchFilter};
use super::{BoxFuture, DataSource, IdentitySource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceOp {
    FetchPage,
    Search,
    Subscribe,
    ResolveIdentity,
}

impl SourceOp {
    const ALL: [SourceOp; 4] = [
        SourceOp::FetchPage,
        SourceOp::Search,
        SourceOp::Subscribe,
        SourceOp::ResolveIdentity,
    ];

    fn index(self) -> usize {
        match self {
            Self::FetchPage => 0,
            Self::Search => 1,
            Self::Subscribe => 2,
            Self::ResolveIdentity => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::FetchPage => "fetch-page",
            Self::Search => "search",
            Self::Subscribe => "subscribe",
            Self::ResolveIdentity => "resolve-identity",
        }
    }
}

struct PendingHold {
    release_rx: oneshot::Receiver<()>,
    parked_tx: oneshot::Sender<()>,
}

/// Parks the next call of one operation until released or dropped.
pub struct HoldRelease {
    release_tx: Option<oneshot::Sender<()>>,
    parked_rx: Option<oneshot::Receiver<()>>,
}

impl HoldRelease {
    /// Waits until a call has reached the hold point.
    pub async fn parked(&mut self) {
        if let Some(parked_rx) = self.parked_rx.take() {
            let _ = parked_rx.await;
        }
    }

    pub fn release(mut self) {
        if let Some(release_tx) = self.release_tx.take() {
            let _ = release_tx.send(());
        }
    }
}

impl Drop for HoldRelease {
    fn drop(&mut self) {
        if let Some(release_tx) = self.release_tx.take() {
            let _ = release_tx.send(());
        }
    }
}

/// In-process backend used by tests and the QA runner.
#[derive(Default)]
pub struct MemorySource {
    conversations: RwLock<HashMap<ConversationId, Vec<Message>>>,
    identities: RwLock<HashMap<UserId, Identity>>,
    subscribers: Mutex<HashMap<ConversationId, Vec<SubscriptionSink>>>,
    holds: Mutex<HashMap<SourceOp, VecDeque<PendingHold>>>,
    failures: Mutex<HashMap<SourceOp, VecDeque<String>>>,
    calls: [AtomicUsize; 4],
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_conversation(
        &self,
        conversation_id: ConversationId,
        messages: Vec<Message>,
    ) {
        let mut conversations = self.conversations.write().await;
        conversations.insert(conversation_id, messages);
    }

    pub async fn insert_identity(&self, identity: Identity) {
        let mut identities = self.identities.write().await;
        identities.insert(identity.user_id, identity);
    }

    pub async fn stored_messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        let conversations = self.conversations.read().await;
        conversations
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn call_count(&self, op: SourceOp) -> usize {
        self.calls[op.index()].load(Ordering::SeqCst)
    }

    pub fn call_counts(&self) -> Vec<(SourceOp, usize)> {
        SourceOp::ALL
            .iter()
            .map(|op| (*op, self.call_count(*op)))
            .collect()
    }

    pub fn hold(&self, op: SourceOp) -> HoldRelease {
        let (release_tx, release_rx) = oneshot::channel();
        let (parked_tx, parked_rx) = oneshot::channel();
        lock(&self.holds)
            .entry(op)
            .or_default()
            .push_back(PendingHold {
                release_rx,
                parked_tx,
            });

        HoldRelease {
            release_tx: Some(release_tx),
            parked_rx: Some(parked_rx),
        }
    }

    /// Makes the next call of `op` fail with the error kind that operation reports.
    pub fn fail_next(&self, op: SourceOp, details: impl Into<String>) {
        lock(&self.failures)
            .entry(op)
            .or_default()
            .push_back(details.into());
    }

    pub fn live_subscriber_count(&self, conversation_id: ConversationId) -> usize {
        let mut subscribers = lock(&self.subscribers);
        let Some(sinks) = subscribers.get_mut(&conversation_id) else {
            return 0;
        };
        sinks.retain(|sink| !sink.is_closed());
        sinks.len()
    }

    /// Drops every producer for the conversation, as a transport disconnect would.
    pub fn disconnect_subscribers(&self, conversation_id: ConversationId) -> usize {
        lock(&self.subscribers)
            .remove(&conversation_id)
            .map(|sinks| sinks.len())
            .unwrap_or(0)
    }

    /// Stores the row and pushes it to live subscribers. Returns the delivery count.
    pub async fn publish_insert(&self, message: Message) -> usize {
        {
            let mut conversations = self.conversations.write().await;
            conversations
                .entry(message.conversation_id)
                .or_default()
                .push(message.clone());
        }
        self.broadcast(FeedEvent::Insert(message))
    }

    pub async fn publish_update(&self, message: Message) -> usize {
        {
            let mut conversations = self.conversations.write().await;
            if let Some(stored) = conversations
                .get_mut(&message.conversation_id)
                .and_then(|messages| messages.iter_mut().find(|row| row.id == message.id))
            {
                *stored = message.clone();
            }
        }
        self.broadcast(FeedEvent::Update(message))
    }

    fn broadcast(&self, event: FeedEvent) -> usize {
        let conversation_id = event.message().conversation_id;
        let mut subscribers = lock(&self.subscribers);
        let Some(sinks) = subscribers.get_mut(&conversation_id) else {
            return 0;
        };

        sinks.retain(|sink| sink.emit(event.clone()));
        sinks.len()
    }

    fn record_call(&self, op: SourceOp) {
        self.calls[op.index()].fetch_add(1, Ordering::SeqCst);
    }

    fn pop_failure(&self, op: SourceOp) -> Option<String> {
        lock(&self.failures)
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
    }

    fn take_failure(&self, op: SourceOp) -> SourceResult<()> {
        match self.pop_failure(op) {
            Some(details) if op == SourceOp::ResolveIdentity => IdentityLookupSnafu {
                stage: op.name(),
                details,
            }
            .fail(),
            Some(details) => Err(SourceError::transport(op.name(), details)),
            None => Ok(()),
        }
    }

    async fn enter(&self, op: SourceOp) -> SourceResult<()> {
        self.record_call(op);

        let pending = lock(&self.holds).get_mut(&op).and_then(VecDeque::pop_front);
        if let Some(pending) = pending {
            let _ = pending.parked_tx.send(());
            let _ = pending.release_rx.await;
        }

        self.take_failure(op)
    }
}

impl DataSource for MemorySource {
    fn fetch_page<'a>(
        &'a self,
        conversation_id: ConversationId,
        limit: usize,
        before: Option<u64>,
    ) -> BoxFuture<'a, SourceResult<Vec<Message>>> {
        Box::pin(async move {
            self.enter(SourceOp::FetchPage).await?;

            let conversations = self.conversations.read().await;
            let messages = conversations
                .get(&conversation_id)
                .context(ConversationNotFoundSnafu {
                    stage: "memory-fetch-page",
                    conversation_id,
                })?;

            let mut page = messages
                .iter()
                .filter(|message| {
                    before.is_none_or(|before| message.created_at_unix_millis < before)
                })
                .cloned()
                .collect::<Vec<_>>();
            page.sort_by(|left, right| right.chronological_cmp(left));
            page.truncate(limit);
            Ok(page)
        })
    }

    fn search<'a>(
        &'a self,
        conversation_id: ConversationId,
        filter: &'a SearchFilter,
    ) -> BoxFuture<'a, SourceResult<Vec<Message>>> {
        Box::pin(async move {
            self.enter(SourceOp::Search).await?;
            filter.validate()?;

            let conversations = self.conversations.read().await;
            let messages = conversations
                .get(&conversation_id)
                .context(ConversationNotFoundSnafu {
                    stage: "memory-search",
                    conversation_id,
                })?;

            let mut matches = messages
                .iter()
                .filter(|message| filter.matches(message))
                .cloned()
                .collect::<Vec<_>>();
            matches.sort_by(Message::chronological_cmp);
            Ok(matches)
        })
    }

    fn subscribe(&self, conversation_id: ConversationId) -> SourceResult<Subscription> {
        self.record_call(SourceOp::Subscribe);
        if let Some(details) = self.pop_failure(SourceOp::Subscribe) {
            tracing::debug!(%conversation_id, %details, "memory source refused subscription");
            return SubscriptionClosedSnafu {
                stage: "memory-subscribe",
                conversation_id,
            }
            .fail();
        }

        let (sink, subscription) = Subscription::channel(conversation_id);
        let mut subscribers = lock(&self.subscribers);
        let sinks = subscribers.entry(conversation_id).or_default();
        sinks.retain(|sink| !sink.is_closed());
        sinks.push(sink);
        tracing::trace!(%conversation_id, live = sinks.len(), "memory source subscription opened");
        Ok(subscription)
    }
}

impl IdentitySource for MemorySource {
    fn resolve_identity<'a>(
        &'a self,
        user_id: UserId,
    ) -> BoxFuture<'a, SourceResult<Option<Identity>>> {
        Box::pin(async move {
            self.enter(SourceOp::ResolveIdentity).await?;
            let identities = self.identities.read().await;
            Ok(identities.get(&user_id).cloned())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MessageId;
    use crate::types::SenderKind;

    fn message(conversation_id: ConversationId, id: u64) -> Message {
        Message::new(
            MessageId::new(id),
            conversation_id,
            id * 1_000,
            SenderKind::EndUser,
            Some(format!("message {id}")),
        )
    }

    async fn seeded(count: u64) -> (MemorySource, ConversationId) {
        let source = MemorySource::new();
        let conversation_id = ConversationId::new_v7();
        let messages = (1..=count).map(|id| message(conversation_id, id)).collect();
        source.insert_conversation(conversation_id, messages).await;
        (source, conversation_id)
    }

    #[tokio::test]
    async fn fetch_page_returns_newest_first_before_cursor() {
        let (source, conversation_id) = seeded(10).await;

        let first = source
            .fetch_page(conversation_id, 3, None)
            .await
            .expect("first page");
        let ids = first.iter().map(|m| m.id.0).collect::<Vec<_>>();
        assert_eq!(ids, vec![10, 9, 8]);

        let older = source
            .fetch_page(conversation_id, 5, Some(8_000))
            .await
            .expect("older page");
        let ids = older.iter().map(|m| m.id.0).collect::<Vec<_>>();
        assert_eq!(ids, vec![7, 6, 5, 4, 3]);
        assert_eq!(source.call_count(SourceOp::FetchPage), 2);
    }

    #[tokio::test]
    async fn unknown_conversation_and_injected_failures_surface_as_errors() {
        let (source, conversation_id) = seeded(1).await;

        let missing = source.fetch_page(ConversationId::new_v7(), 5, None).await;
        assert!(matches!(missing, Err(SourceError::ConversationNotFound { .. })));

        source.fail_next(SourceOp::Search, "gateway timeout");
        let failed = source
            .search(conversation_id, &SearchFilter::new("message"))
            .await;
        assert!(matches!(failed, Err(SourceError::Transport { .. })));

        let recovered = source
            .search(conversation_id, &SearchFilter::new("message"))
            .await
            .expect("second search succeeds");
        assert_eq!(recovered.len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_keep_their_operation_kind() {
        let (source, conversation_id) = seeded(1).await;

        source.fail_next(SourceOp::Subscribe, "socket closed");
        assert!(matches!(
            source.subscribe(conversation_id),
            Err(SourceError::SubscriptionClosed { .. })
        ));
        assert_eq!(source.live_subscriber_count(conversation_id), 0);

        source.fail_next(SourceOp::ResolveIdentity, "profile service down");
        assert!(matches!(
            source.resolve_identity(UserId::new_v7()).await,
            Err(SourceError::IdentityLookup { .. })
        ));
    }

    #[tokio::test]
    async fn hold_parks_a_call_until_released() {
        let (source, conversation_id) = seeded(2).await;
        let source = std::sync::Arc::new(source);
        let mut hold = source.hold(SourceOp::FetchPage);

        let task = tokio::spawn({
            let source = source.clone();
            async move { source.fetch_page(conversation_id, 10, None).await }
        });

        hold.parked().await;
        assert!(!task.is_finished());
        hold.release();

        let page = task.await.expect("join").expect("page");
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn publish_reaches_live_subscribers_only() {
        let (source, conversation_id) = seeded(1).await;
        let mut live = source.subscribe(conversation_id).expect("subscribe");
        let mut gone = source.subscribe(conversation_id).expect("subscribe");
        gone.unsubscribe();

        let delivered = source.publish_insert(message(conversation_id, 2)).await;
        assert_eq!(delivered, 1);
        assert_eq!(source.live_subscriber_count(conversation_id), 1);

        let event = live.recv().await.expect("insert delivered");
        assert_eq!(event.message().id, MessageId::new(2));
        assert_eq!(source.stored_messages(conversation_id).await.len(), 2);
    }
}
