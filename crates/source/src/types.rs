use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use snafu::ensure;

use super::error::{InvalidDateRangeSnafu, SourceResult};
use super::ids::{ConversationId, MessageId, UserId};

/// Who produced a message, as classified by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    EndUser,
    AutomatedAgent,
    HumanAgent,
    System,
}

impl SenderKind {
    /// Returns true for messages written on the operator side of the conversation.
    pub fn is_operator(self) -> bool {
        matches!(self, Self::AutomatedAgent | Self::HumanAgent)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub created_at_unix_millis: u64,
    pub sender: SenderKind,
    #[serde(default)]
    pub content: Option<String>,
    // Delivery receipts and channel payloads are opaque to the feed.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Message {
    pub fn new(
        id: MessageId,
        conversation_id: ConversationId,
        created_at_unix_millis: u64,
        sender: SenderKind,
        content: Option<String>,
    ) -> Self {
        Self {
            id,
            conversation_id,
            created_at_unix_millis,
            sender,
            content,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Chronological ordering key; ties on timestamp fall back to the row id.
    pub fn order_key(&self) -> (u64, MessageId) {
        (self.created_at_unix_millis, self.id)
    }

    pub fn chronological_cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

/// Query text plus optional inclusive unix-millis bounds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub date_start: Option<u64>,
    #[serde(default)]
    pub date_end: Option<u64>,
}

impl SearchFilter {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            date_start: None,
            date_end: None,
        }
    }

    pub fn with_date_range(mut self, date_start: Option<u64>, date_end: Option<u64>) -> Self {
        self.date_start = date_start;
        self.date_end = date_end;
        self
    }

    pub fn normalized(mut self) -> Self {
        self.query = self.query.trim().to_string();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.query.trim().is_empty() && self.date_start.is_none() && self.date_end.is_none()
    }

    pub fn validate(&self) -> SourceResult<()> {
        if let (Some(start), Some(end)) = (self.date_start, self.date_end) {
            ensure!(
                start <= end,
                InvalidDateRangeSnafu {
                    stage: "validate-search-filter",
                    start,
                    end,
                }
            );
        }
        Ok(())
    }

    /// Case-insensitive content match within the date bounds.
    pub fn matches(&self, message: &Message) -> bool {
        if self
            .date_start
            .is_some_and(|start| message.created_at_unix_millis < start)
        {
            return false;
        }
        if self
            .date_end
            .is_some_and(|end| message.created_at_unix_millis > end)
        {
            return false;
        }

        let needle = self.query.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }

        message
            .content
            .as_deref()
            .is_some_and(|content| content.to_lowercase().contains(&needle))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedEventKind {
    Insert,
    Update,
}

/// Row change pushed by the realtime channel.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Insert(Message),
    Update(Message),
}

impl FeedEvent {
    pub fn message(&self) -> &Message {
        match self {
            Self::Insert(message) | Self::Update(message) => message,
        }
    }

    pub fn kind(&self) -> FeedEventKind {
        match self {
            Self::Insert(_) => FeedEventKind::Insert,
            Self::Update(_) => FeedEventKind::Update,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub client_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub user_id: UserId,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Tenant client and operator profile bound to an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub client: ClientRecord,
    pub profile: ProfileRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: u64, at: u64, content: Option<&str>) -> Message {
        Message::new(
            MessageId::new(id),
            ConversationId::new_v7(),
            at,
            SenderKind::EndUser,
            content.map(str::to_string),
        )
    }

    #[test]
    fn filter_matches_query_case_insensitively_within_bounds() {
        let filter = SearchFilter::new("  Ciao ").with_date_range(Some(100), Some(200));

        assert!(filter.matches(&message(1, 150, Some("ciao a tutti"))));
        assert!(filter.matches(&message(2, 200, Some("CIAO"))));
        assert!(!filter.matches(&message(3, 201, Some("ciao"))));
        assert!(!filter.matches(&message(4, 150, Some("hello"))));
        assert!(!filter.matches(&message(5, 150, None)));
    }

    #[test]
    fn blank_filter_is_empty_and_inverted_range_is_rejected() {
        assert!(SearchFilter::new("   ").is_empty());
        assert!(!SearchFilter::new("").with_date_range(Some(1), None).is_empty());

        let inverted = SearchFilter::new("x").with_date_range(Some(10), Some(5));
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn order_key_breaks_timestamp_ties_by_id() {
        let earlier = message(7, 100, None);
        let later = message(8, 100, None);
        assert_eq!(earlier.chronological_cmp(&later), Ordering::Less);
    }

    #[test]
    fn sender_kind_uses_snake_case_on_the_wire() {
        let encoded = serde_json::to_string(&SenderKind::HumanAgent).expect("serialize");
        assert_eq!(encoded, "\"human_agent\"");
        assert!(SenderKind::AutomatedAgent.is_operator());
        assert!(!SenderKind::System.is_operator());
    }
}
