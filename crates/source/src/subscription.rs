use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use super::ids::ConversationId;
use super::types::FeedEvent;

/// Consumer half of a realtime channel scoped to one conversation.
///
/// Dropping the handle has the same effect as [`Subscription::unsubscribe`], so a
/// subscription can never outlive the task that owns it.
pub struct Subscription {
    conversation_id: ConversationId,
    events: mpsc::UnboundedReceiver<FeedEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// Producer half held by the transport adapter.
pub struct SubscriptionSink {
    conversation_id: ConversationId,
    events: mpsc::UnboundedSender<FeedEvent>,
    cancel_rx: oneshot::Receiver<()>,
}

impl Subscription {
    pub fn channel(conversation_id: ConversationId) -> (SubscriptionSink, Subscription) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        (
            SubscriptionSink {
                conversation_id,
                events: event_tx,
                cancel_rx,
            },
            Subscription {
                conversation_id,
                events: event_rx,
                cancel_tx: Some(cancel_tx),
            },
        )
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        self.events.try_recv().ok()
    }

    pub fn is_active(&self) -> bool {
        self.cancel_tx.is_some()
    }

    /// Stops delivery. Returns true when the producer was still listening.
    pub fn unsubscribe(&mut self) -> bool {
        self.events.close();
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Stream for Subscription {
    type Item = FeedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<FeedEvent>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

impl SubscriptionSink {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Forwards one event. Returns false once the consumer is gone.
    pub fn emit(&self, event: FeedEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Resolves when the consumer unsubscribes or drops its handle.
    pub async fn cancelled(&mut self) {
        let _ = (&mut self.cancel_rx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MessageId;
    use crate::types::{Message, SenderKind};

    fn insert(conversation_id: ConversationId, id: u64) -> FeedEvent {
        FeedEvent::Insert(Message::new(
            MessageId::new(id),
            conversation_id,
            id * 10,
            SenderKind::EndUser,
            Some(format!("m{id}")),
        ))
    }

    #[tokio::test]
    async fn events_flow_until_unsubscribe() {
        let conversation_id = ConversationId::new_v7();
        let (sink, mut subscription) = Subscription::channel(conversation_id);

        assert!(sink.emit(insert(conversation_id, 1)));
        let received = subscription.recv().await.expect("event delivered");
        assert_eq!(received.message().id, MessageId::new(1));

        assert!(subscription.unsubscribe());
        assert!(!subscription.is_active());
        assert!(sink.is_closed());
        assert!(!sink.emit(insert(conversation_id, 2)));
        // A second unsubscribe is a no-op.
        assert!(!subscription.unsubscribe());
    }

    #[tokio::test]
    async fn dropping_the_handle_cancels_the_producer() {
        let conversation_id = ConversationId::new_v7();
        let (mut sink, subscription) = Subscription::channel(conversation_id);

        drop(subscription);
        sink.cancelled().await;
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn recv_returns_none_once_producer_drops() {
        let conversation_id = ConversationId::new_v7();
        let (sink, mut subscription) = Subscription::channel(conversation_id);

        drop(sink);
        assert!(subscription.recv().await.is_none());
    }

    #[tokio::test]
    async fn stream_yields_buffered_events_then_ends() {
        use futures::StreamExt;

        let conversation_id = ConversationId::new_v7();
        let (sink, subscription) = Subscription::channel(conversation_id);
        sink.emit(insert(conversation_id, 1));
        sink.emit(insert(conversation_id, 2));
        drop(sink);

        let ids = subscription
            .map(|event| event.message().id.0)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(ids, vec![1, 2]);
    }
}
