use courier_source::{ConversationId, Message, SearchFilter};

use crate::error::FeedErrorNotice;
use crate::phase::SyncPhase;
use crate::store::FeedStore;

const MILLIS_PER_DAY: u64 = 86_400_000;

/// Read-only copy of the feed handed to the view layer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeedSnapshot {
    pub conversation_id: Option<ConversationId>,
    pub phase: SyncPhase,
    pub messages: Vec<Message>,
    pub is_loading_initial: bool,
    pub is_loading_more: bool,
    pub has_more_older: bool,
    pub filter: Option<SearchFilter>,
    pub error: Option<FeedErrorNotice>,
}

/// Consecutive messages created on the same UTC day.
#[derive(Debug, Clone, PartialEq)]
pub struct DayGroup<'a> {
    /// Days since the unix epoch.
    pub day: u64,
    pub messages: &'a [Message],
}

impl DayGroup<'_> {
    pub fn starts_at_unix_millis(&self) -> u64 {
        self.day * MILLIS_PER_DAY
    }
}

impl FeedSnapshot {
    pub(crate) fn capture(
        conversation_id: Option<ConversationId>,
        phase: SyncPhase,
        store: &FeedStore,
    ) -> Self {
        Self {
            conversation_id,
            phase,
            messages: store.messages().to_vec(),
            is_loading_initial: store.is_loading_initial(),
            is_loading_more: store.is_loading_more(),
            has_more_older: store.has_more_older(),
            filter: store.filter().cloned(),
            error: store.error().cloned(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn earliest(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn latest(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn message_ids(&self) -> Vec<u64> {
        self.messages.iter().map(|message| message.id.0).collect()
    }

    /// Splits the feed into runs of messages sharing a UTC day, keeping feed order.
    pub fn day_groups(&self) -> Vec<DayGroup<'_>> {
        let mut groups = Vec::new();
        let mut start = 0;

        while start < self.messages.len() {
            let day = self.messages[start].created_at_unix_millis / MILLIS_PER_DAY;
            let run = self.messages[start..]
                .iter()
                .take_while(|message| message.created_at_unix_millis / MILLIS_PER_DAY == day)
                .count();
            groups.push(DayGroup {
                day,
                messages: &self.messages[start..start + run],
            });
            start += run;
        }

        groups
    }
}
