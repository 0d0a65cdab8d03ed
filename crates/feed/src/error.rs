use courier_source::{ConversationId, SourceError, UserId};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FeedError {
    #[snafu(display("failed to load messages for conversation '{conversation_id}': {source}"))]
    FetchFailure {
        stage: &'static str,
        conversation_id: ConversationId,
        source: SourceError,
    },
    #[snafu(display("search failed for conversation '{conversation_id}': {source}"))]
    SearchFailure {
        stage: &'static str,
        conversation_id: ConversationId,
        source: SourceError,
    },
    #[snafu(display("failed to subscribe to conversation '{conversation_id}': {source}"))]
    SubscriptionFailure {
        stage: &'static str,
        conversation_id: ConversationId,
        source: SourceError,
    },
    #[snafu(display("realtime delivery for conversation '{conversation_id}' stopped"))]
    SubscriptionDropped {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("no conversation is selected"))]
    NoConversation { stage: &'static str },
    #[snafu(display("session for user '{user_id}' has signed out"))]
    SignedOut {
        stage: &'static str,
        user_id: UserId,
    },
}

pub type FeedResult<T> = Result<T, FeedError>;

/// Coarse error class shown next to the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedErrorKind {
    Fetch,
    Search,
    Subscription,
}

/// User-visible copy of a [`FeedError`] kept in the feed's error slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedErrorNotice {
    pub kind: FeedErrorKind,
    pub message: String,
}

impl FeedError {
    pub fn kind(&self) -> Option<FeedErrorKind> {
        match self {
            Self::FetchFailure { .. } => Some(FeedErrorKind::Fetch),
            Self::SearchFailure { .. } => Some(FeedErrorKind::Search),
            Self::SubscriptionFailure { .. } | Self::SubscriptionDropped { .. } => {
                Some(FeedErrorKind::Subscription)
            }
            Self::NoConversation { .. } | Self::SignedOut { .. } => None,
        }
    }

    /// Returns the slot entry for errors that belong in the feed view.
    pub fn notice(&self) -> Option<FeedErrorNotice> {
        self.kind().map(|kind| FeedErrorNotice {
            kind,
            message: self.to_string(),
        })
    }
}
