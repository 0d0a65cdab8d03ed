use snafu::Snafu;

use super::ids::ConversationId;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SourceError {
    #[snafu(display("source id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("search date range starts at {start} after it ends at {end}"))]
    InvalidDateRange {
        stage: &'static str,
        start: u64,
        end: u64,
    },
    #[snafu(display("conversation '{conversation_id}' was not found"))]
    ConversationNotFound {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("transport failed at {stage}: {details}"))]
    Transport {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("subscription for conversation '{conversation_id}' is closed"))]
    SubscriptionClosed {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("identity lookup failed: {details}"))]
    IdentityLookup {
        stage: &'static str,
        details: String,
    },
}

impl SourceError {
    /// Builds a transport failure from a message supplied by an external adapter.
    pub fn transport(stage: &'static str, details: impl Into<String>) -> Self {
        Self::Transport {
            stage,
            details: details.into(),
        }
    }
}

pub type SourceResult<T> = Result<T, SourceError>;
