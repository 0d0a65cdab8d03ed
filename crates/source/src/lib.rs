pub mod error;
pub mod ids;
pub mod memory;
pub mod subscription;
pub mod types;

use std::future::Future;
use std::pin::Pin;

pub use error::{SourceError, SourceResult};
pub use ids::{ConversationId, MessageId, UserId};
pub use memory::{HoldRelease, MemorySource, SourceOp};
pub use subscription::{Subscription, SubscriptionSink};
pub use types::{
    ClientRecord, FeedEvent, FeedEventKind, Identity, Message, ProfileRecord, SearchFilter,
    SenderKind,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Hosted backend access for one ordered message table.
pub trait DataSource: Send + Sync {
    /// Returns up to `limit` messages strictly older than `before`, newest first.
    fn fetch_page<'a>(
        &'a self,
        conversation_id: ConversationId,
        limit: usize,
        before: Option<u64>,
    ) -> BoxFuture<'a, SourceResult<Vec<Message>>>;

    fn search<'a>(
        &'a self,
        conversation_id: ConversationId,
        filter: &'a SearchFilter,
    ) -> BoxFuture<'a, SourceResult<Vec<Message>>>;

    fn subscribe(&self, conversation_id: ConversationId) -> SourceResult<Subscription>;
}

/// Client/profile lookup keyed by the authenticated user.
pub trait IdentitySource: Send + Sync {
    fn resolve_identity<'a>(&'a self, user_id: UserId)
    -> BoxFuture<'a, SourceResult<Option<Identity>>>;
}
