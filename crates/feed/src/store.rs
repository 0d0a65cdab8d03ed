use std::collections::HashSet;

use courier_source::{Message, MessageId, SearchFilter};

use crate::error::FeedErrorNotice;

/// Result of merging one older page into the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrependOutcome {
    pub added: usize,
    pub skipped_duplicates: usize,
    pub exhausted: bool,
}

/// Ordered, deduplicated message window for one conversation plus its status flags.
///
/// The sequence is only changed through [`reset`](Self::reset),
/// [`replace_all`](Self::replace_all), [`prepend_older_page`](Self::prepend_older_page),
/// [`apply_insert`](Self::apply_insert) and [`apply_update`](Self::apply_update).
/// Canonical order is oldest first, newest last.
#[derive(Debug, Clone, Default)]
pub struct FeedStore {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
    is_loading_initial: bool,
    is_loading_more: bool,
    has_more_older: bool,
    filter: Option<SearchFilter>,
    error: Option<FeedErrorNotice>,
}

impl FeedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.ids.contains(&id)
    }

    pub fn earliest(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn latest(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn is_loading_initial(&self) -> bool {
        self.is_loading_initial
    }

    pub fn is_loading_more(&self) -> bool {
        self.is_loading_more
    }

    pub fn has_more_older(&self) -> bool {
        self.has_more_older
    }

    pub fn filter(&self) -> Option<&SearchFilter> {
        self.filter.as_ref()
    }

    pub fn error(&self) -> Option<&FeedErrorNotice> {
        self.error.as_ref()
    }

    pub(crate) fn set_loading_initial(&mut self, loading: bool) {
        self.is_loading_initial = loading;
    }

    pub(crate) fn set_loading_more(&mut self, loading: bool) {
        self.is_loading_more = loading;
    }

    pub(crate) fn set_filter(&mut self, filter: Option<SearchFilter>) {
        self.filter = filter;
    }

    pub(crate) fn set_error(&mut self, error: Option<FeedErrorNotice>) {
        self.error = error;
    }

    /// Clears the sequence and every status flag.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.ids.clear();
        self.is_loading_initial = false;
        self.is_loading_more = false;
        self.has_more_older = false;
        self.filter = None;
        self.error = None;
    }

    /// Installs a search result set in source order and suspends older-page loading.
    ///
    /// Repeated identifiers keep their first occurrence. Returns the installed count.
    pub fn replace_all(&mut self, items: Vec<Message>) -> usize {
        self.messages.clear();
        self.ids.clear();

        for item in items {
            if self.ids.insert(item.id) {
                self.messages.push(item);
            }
        }

        self.has_more_older = false;
        self.messages.len()
    }

    /// Merges an oldest-to-newest page at the head of the feed.
    ///
    /// A page shorter than `requested_limit` marks the history as exhausted. Rows
    /// already present are skipped. Rows that are not older than the current head
    /// are placed at their chronological position so existing rows never move
    /// relative to each other.
    pub fn prepend_older_page(
        &mut self,
        items: Vec<Message>,
        requested_limit: usize,
    ) -> PrependOutcome {
        let exhausted = items.len() < requested_limit;
        let returned = items.len();

        let mut head = Vec::with_capacity(items.len());
        let mut misplaced = Vec::new();
        let earliest_key = self.messages.first().map(Message::order_key);

        for item in items {
            if !self.ids.insert(item.id) {
                continue;
            }
            match earliest_key {
                Some(key) if item.order_key() >= key => misplaced.push(item),
                _ => head.push(item),
            }
        }

        let added = head.len() + misplaced.len();
        self.messages.splice(0..0, head);

        for item in misplaced {
            tracing::debug!(
                message_id = %item.id,
                created_at = item.created_at_unix_millis,
                "older page row overlaps the loaded window; merging in place"
            );
            let key = item.order_key();
            let position = self
                .messages
                .partition_point(|message| message.order_key() <= key);
            self.messages.insert(position, item);
        }

        self.has_more_older = !exhausted;

        PrependOutcome {
            added,
            skipped_duplicates: returned - added,
            exhausted,
        }
    }

    /// Appends a pushed row unless a row with the same id is already present.
    pub fn apply_insert(&mut self, item: Message) -> bool {
        if !self.ids.insert(item.id) {
            tracing::trace!(message_id = %item.id, "duplicate insert suppressed");
            return false;
        }

        self.messages.push(item);
        true
    }

    /// Replaces the row with the same id in place. Rows outside the window are dropped.
    pub fn apply_update(&mut self, item: Message) -> bool {
        let Some(slot) = self
            .messages
            .iter_mut()
            .find(|message| message.id == item.id)
        else {
            tracing::trace!(message_id = %item.id, "update for row outside the window dropped");
            return false;
        };

        *slot = item;
        true
    }
}
