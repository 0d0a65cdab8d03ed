use std::collections::HashSet;
use std::sync::{Arc, Weak};

use courier_source::{ConversationId, DataSource, FeedEvent, Message, SearchFilter, Subscription};
use futures::StreamExt;
use snafu::{OptionExt, ResultExt};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use crate::error::{
    FeedError, FeedErrorKind, FeedResult, FetchFailureSnafu, NoConversationSnafu,
    SearchFailureSnafu, SignedOutSnafu, SubscriptionFailureSnafu,
};
use crate::phase::{SyncPhase, SyncTransition, SyncTransitionRejection};
use crate::session::Session;
use crate::settings::FeedSettings;
use crate::snapshot::FeedSnapshot;
use crate::store::FeedStore;

/// Monotonic counter bumped on every selection, search submit and filter clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedEpoch(pub u64);

/// Routing key for staleness checks on async completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedTarget {
    pub conversation_id: ConversationId,
    pub epoch: FeedEpoch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The result was installed into the feed.
    Applied,
    /// The view moved on while the request was in flight; the result was dropped.
    Discarded,
    /// Nothing to do in the current state.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoConversation,
    AlreadyLoading,
    Exhausted,
    EmptyFeed,
    Filtered,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMoreOutcome {
    Loaded { added: usize, exhausted: bool },
    Skipped(SkipReason),
    Discarded,
}

struct RealtimePump {
    pump_id: u64,
    conversation_id: ConversationId,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ControllerState {
    phase: SyncPhase,
    target: Option<FeedTarget>,
    next_epoch: u64,
    next_pump_id: u64,
    store: FeedStore,
    realtime: Option<RealtimePump>,
    /// No unfiltered page of the current conversation has landed yet.
    newest_page_missing: bool,
}

impl ControllerState {
    fn mint_target(&mut self, conversation_id: ConversationId) -> FeedTarget {
        self.next_epoch = self.next_epoch.saturating_add(1);
        let target = FeedTarget {
            conversation_id,
            epoch: FeedEpoch(self.next_epoch),
        };
        self.target = Some(target);
        target
    }

    fn is_current(&self, target: FeedTarget) -> bool {
        self.target == Some(target)
    }

    fn conversation_id(&self) -> Option<ConversationId> {
        self.target.map(|target| target.conversation_id)
    }

    fn transition(&mut self, transition: SyncTransition) -> Result<(), SyncTransitionRejection> {
        self.phase = self.phase.apply(transition)?;
        Ok(())
    }

    /// Applies a settle transition whose precondition was checked by the staleness guard.
    fn settle(&mut self, transition: SyncTransition) {
        if let Err(rejection) = self.transition(transition) {
            tracing::warn!(
                phase = ?self.phase,
                ?transition,
                ?rejection,
                "sync transition rejected on settle"
            );
        }
    }

    fn record_error(&mut self, error: &FeedError) {
        self.store.set_error(error.notice());
    }
}

struct ControllerInner {
    source: Arc<dyn DataSource>,
    session: Arc<Session>,
    settings: FeedSettings,
    state: Mutex<ControllerState>,
}

/// Keeps one conversation feed in sync with paging, search and realtime push.
///
/// Cloning yields another handle to the same controller. The state lock is never
/// held across a data source call, so realtime events interleave with page loads.
#[derive(Clone)]
pub struct SyncController {
    inner: Arc<ControllerInner>,
}

impl SyncController {
    pub fn new(session: Arc<Session>, source: Arc<dyn DataSource>, settings: FeedSettings) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                source,
                session,
                settings: settings.normalized(),
                state: Mutex::new(ControllerState::default()),
            }),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    pub fn settings(&self) -> &FeedSettings {
        &self.inner.settings
    }

    pub async fn snapshot(&self) -> FeedSnapshot {
        let state = self.inner.state.lock().await;
        FeedSnapshot::capture(state.conversation_id(), state.phase, &state.store)
    }

    pub async fn phase(&self) -> SyncPhase {
        self.inner.state.lock().await.phase
    }

    pub async fn has_live_subscription(&self) -> bool {
        let state = self.inner.state.lock().await;
        state
            .realtime
            .as_ref()
            .is_some_and(|pump| !pump.task.is_finished())
    }

    pub async fn clear_error(&self) {
        self.inner.state.lock().await.store.set_error(None);
    }

    /// Switches the feed to `conversation_id`, or to nothing.
    ///
    /// The previous subscription is fully stopped before the new page is requested,
    /// and the new subscription opens only once that page has been installed.
    pub async fn select_conversation(
        &self,
        conversation_id: Option<ConversationId>,
    ) -> FeedResult<SyncOutcome> {
        if conversation_id.is_some() && !self.inner.session.is_signed_in() {
            self.close().await;
            return SignedOutSnafu {
                stage: "select-conversation",
                user_id: self.inner.session.user_id(),
            }
            .fail();
        }

        let (target, previous_pump) = {
            let mut state = self.inner.state.lock().await;
            // Reselecting the current conversation only retries a failed initial load.
            let reselected = state.conversation_id() == conversation_id;
            if reselected && !(state.phase == SyncPhase::Ready && state.newest_page_missing) {
                return Ok(SyncOutcome::Unchanged);
            }

            // A retry keeps the live subscription; rows it delivers survive the reload.
            let previous_pump = if reselected {
                None
            } else {
                state.realtime.take()
            };
            state.newest_page_missing = conversation_id.is_some();
            state.store.reset();

            let target = match conversation_id {
                Some(conversation_id) => {
                    let target = state.mint_target(conversation_id);
                    state.settle(SyncTransition::Select);
                    state.store.set_loading_initial(true);
                    Some(target)
                }
                None => {
                    state.target = None;
                    state.settle(SyncTransition::Close);
                    None
                }
            };
            (target, previous_pump)
        };

        tracing::info!(
            conversation_id = ?conversation_id,
            epoch = ?target.map(|target| target.epoch),
            "conversation selected"
        );
        stop_pump(previous_pump).await;

        match target {
            Some(target) => self.run_initial_load(target).await,
            None => Ok(SyncOutcome::Applied),
        }
    }

    /// Requests the page older than the current earliest row.
    ///
    /// Triggers while a page is in flight, after exhaustion, on an empty feed, or
    /// while filtered are dropped without contacting the data source.
    pub async fn load_more(&self) -> FeedResult<LoadMoreOutcome> {
        let limit = self.inner.settings.page_size;
        let (target, before) = {
            let mut state = self.inner.state.lock().await;
            let Some(target) = state.target else {
                return Ok(LoadMoreOutcome::Skipped(SkipReason::NoConversation));
            };

            let skip = if state.store.is_loading_more() {
                Some(SkipReason::AlreadyLoading)
            } else if state.phase.is_filtered() {
                Some(SkipReason::Filtered)
            } else if state.phase == SyncPhase::Loading {
                Some(SkipReason::Busy)
            } else if !state.store.has_more_older() {
                Some(SkipReason::Exhausted)
            } else {
                None
            };
            if let Some(reason) = skip {
                tracing::trace!(
                    conversation_id = %target.conversation_id,
                    ?reason,
                    "load more skipped"
                );
                return Ok(LoadMoreOutcome::Skipped(reason));
            }

            let Some(before) = state
                .store
                .earliest()
                .map(|message| message.created_at_unix_millis)
            else {
                return Ok(LoadMoreOutcome::Skipped(SkipReason::EmptyFeed));
            };

            if let Err(rejection) = state.transition(SyncTransition::BeginLoadMore) {
                tracing::debug!(?rejection, "load more rejected by phase");
                return Ok(LoadMoreOutcome::Skipped(SkipReason::Busy));
            }
            state.store.set_loading_more(true);
            (target, before)
        };

        let result = self
            .inner
            .source
            .fetch_page(target.conversation_id, limit, Some(before))
            .await;

        let mut state = self.inner.state.lock().await;
        if !state.is_current(target) {
            tracing::debug!(target = ?target, "stale older page discarded");
            return Ok(LoadMoreOutcome::Discarded);
        }

        state.store.set_loading_more(false);
        state.settle(SyncTransition::LoadMoreSettled);

        match result.context(FetchFailureSnafu {
            stage: "load-older-page",
            conversation_id: target.conversation_id,
        }) {
            Ok(page) => {
                let outcome = state.store.prepend_older_page(chronological(page), limit);
                state.store.set_error(None);
                tracing::debug!(
                    conversation_id = %target.conversation_id,
                    added = outcome.added,
                    skipped_duplicates = outcome.skipped_duplicates,
                    exhausted = outcome.exhausted,
                    "older page prepended"
                );
                Ok(LoadMoreOutcome::Loaded {
                    added: outcome.added,
                    exhausted: outcome.exhausted,
                })
            }
            Err(error) => {
                tracing::warn!(error = %error, "older page fetch failed");
                state.record_error(&error);
                Err(error)
            }
        }
    }

    /// Replaces the feed with the rows matching `filter` and suspends pagination.
    ///
    /// An empty filter behaves like [`clear_filters`](Self::clear_filters).
    pub async fn search(&self, filter: SearchFilter) -> FeedResult<SyncOutcome> {
        let filter = filter.normalized();
        if filter.is_empty() {
            return self.clear_filters().await;
        }

        let (target, replaces_initial_load) = {
            let mut state = self.inner.state.lock().await;
            let conversation_id = state.conversation_id().context(NoConversationSnafu {
                stage: "search-select",
            })?;

            if let Err(source) = filter.validate() {
                let error = FeedError::SearchFailure {
                    stage: "search-validate-filter",
                    conversation_id,
                    source,
                };
                state.record_error(&error);
                return Err(error);
            }

            // A pending first page never installs once this search takes its epoch.
            let replaces_initial_load =
                state.newest_page_missing && state.store.filter().is_none();
            if state.transition(SyncTransition::BeginSearch).is_err() {
                return NoConversationSnafu {
                    stage: "search-begin",
                }
                .fail();
            }
            // A pending older page belongs to the window this search replaces.
            state.store.set_loading_more(false);
            state.store.set_loading_initial(false);
            (state.mint_target(conversation_id), replaces_initial_load)
        };

        tracing::info!(
            conversation_id = %target.conversation_id,
            query = %filter.query,
            "search submitted"
        );
        let result = self
            .inner
            .source
            .search(target.conversation_id, &filter)
            .await;

        let mut state = self.inner.state.lock().await;
        if !state.is_current(target) {
            tracing::debug!(target = ?target, "stale search result discarded");
            return Ok(SyncOutcome::Discarded);
        }

        match result.context(SearchFailureSnafu {
            stage: "run-search",
            conversation_id: target.conversation_id,
        }) {
            Ok(mut rows) => {
                if let Some(limit) = self.inner.settings.search_result_limit
                    && rows.len() > limit
                {
                    let excess = rows.len() - limit;
                    rows.drain(..excess);
                }

                let matches = state.store.replace_all(rows);
                state.store.set_filter(Some(filter));
                state.store.set_error(None);
                state.settle(SyncTransition::SearchLoaded);
                tracing::debug!(
                    conversation_id = %target.conversation_id,
                    matches,
                    "search results installed"
                );
                self.ensure_realtime(&mut state);
                Ok(SyncOutcome::Applied)
            }
            Err(error) if replaces_initial_load => {
                tracing::warn!(error = %error, "search failed; reloading the newest page");
                state.record_error(&error);
                state.store.set_loading_initial(true);
                // Back to the initial load the search replaced, under the same epoch.
                state.settle(SyncTransition::Select);
                drop(state);

                match self.run_initial_load(target).await {
                    Ok(SyncOutcome::Applied) => {
                        let mut state = self.inner.state.lock().await;
                        if state.is_current(target) {
                            state.record_error(&error);
                        }
                    }
                    Ok(_) => {}
                    Err(reload_error) => {
                        tracing::debug!(error = %reload_error, "reload after failed search failed");
                    }
                }
                Err(error)
            }
            Err(error) => {
                tracing::warn!(error = %error, "search failed");
                let filtered = state.store.filter().is_some();
                state.record_error(&error);
                state.settle(SyncTransition::SearchFailed { filtered });
                self.ensure_realtime(&mut state);
                Err(error)
            }
        }
    }

    /// Drops the active filter and reloads the newest unfiltered page.
    ///
    /// The filtered rows stay visible until the reload succeeds.
    pub async fn clear_filters(&self) -> FeedResult<SyncOutcome> {
        let target = {
            let mut state = self.inner.state.lock().await;
            let conversation_id = state.conversation_id().context(NoConversationSnafu {
                stage: "clear-filters-select",
            })?;

            if let Err(rejection) = state.transition(SyncTransition::BeginClearFilters) {
                tracing::trace!(?rejection, "nothing to clear");
                return Ok(SyncOutcome::Unchanged);
            }
            state.store.set_loading_initial(true);
            state.mint_target(conversation_id)
        };

        tracing::info!(conversation_id = %target.conversation_id, "filters cleared; reloading");
        self.run_initial_load(target).await
    }

    /// Reopens realtime delivery for the current conversation.
    pub async fn resubscribe(&self) -> FeedResult<()> {
        let (conversation_id, previous_pump) = {
            let mut state = self.inner.state.lock().await;
            let conversation_id = state.conversation_id().context(NoConversationSnafu {
                stage: "resubscribe-select",
            })?;
            (conversation_id, state.realtime.take())
        };

        stop_pump(previous_pump).await;

        let mut state = self.inner.state.lock().await;
        if state.conversation_id() != Some(conversation_id) || state.realtime.is_some() {
            return Ok(());
        }

        self.open_realtime(&mut state, conversation_id)?;
        if state
            .store
            .error()
            .is_some_and(|notice| notice.kind == FeedErrorKind::Subscription)
        {
            state.store.set_error(None);
        }
        Ok(())
    }

    /// Tears the view down: subscription closed, feed discarded, phase `Idle`.
    pub async fn close(&self) {
        let previous_pump = {
            let mut state = self.inner.state.lock().await;
            state.target = None;
            state.newest_page_missing = false;
            state.store.reset();
            state.settle(SyncTransition::Close);
            state.realtime.take()
        };

        stop_pump(previous_pump).await;
    }

    async fn run_initial_load(&self, target: FeedTarget) -> FeedResult<SyncOutcome> {
        let limit = self.inner.settings.page_size;
        let result = self
            .inner
            .source
            .fetch_page(target.conversation_id, limit, None)
            .await;

        let mut state = self.inner.state.lock().await;
        if !state.is_current(target) {
            tracing::debug!(target = ?target, "stale initial page discarded");
            return Ok(SyncOutcome::Discarded);
        }

        match result.context(FetchFailureSnafu {
            stage: "load-initial-page",
            conversation_id: target.conversation_id,
        }) {
            Ok(page) => {
                let page = chronological(page);
                let late_arrivals = late_arrivals(state.store.messages(), &page);

                state.store.reset();
                state.newest_page_missing = false;
                let outcome = state.store.prepend_older_page(page, limit);
                for message in late_arrivals {
                    state.store.apply_insert(message);
                }
                state.settle(SyncTransition::InitialLoaded);
                tracing::debug!(
                    conversation_id = %target.conversation_id,
                    loaded = outcome.added,
                    exhausted = outcome.exhausted,
                    "initial page installed"
                );

                self.ensure_realtime(&mut state);
                Ok(SyncOutcome::Applied)
            }
            Err(error) => {
                tracing::warn!(error = %error, "initial page fetch failed");
                let filtered = state.store.filter().is_some();
                state.store.set_loading_initial(false);
                state.record_error(&error);
                state.settle(SyncTransition::InitialFailed { filtered });
                // Rows pushed before a retry still land in the empty feed.
                self.ensure_realtime(&mut state);
                Err(error)
            }
        }
    }

    /// Opens realtime delivery if the current conversation has none yet.
    ///
    /// A failure is recorded in the error slot and not retried.
    fn ensure_realtime(&self, state: &mut ControllerState) {
        let Some(conversation_id) = state.conversation_id() else {
            return;
        };
        if state.realtime.is_some() {
            return;
        }

        if let Err(error) = self.open_realtime(state, conversation_id) {
            tracing::warn!(error = %error, "realtime subscription failed");
        }
    }

    fn open_realtime(
        &self,
        state: &mut ControllerState,
        conversation_id: ConversationId,
    ) -> FeedResult<()> {
        let subscription = match self.inner.source.subscribe(conversation_id).context(
            SubscriptionFailureSnafu {
                stage: "open-subscription",
                conversation_id,
            },
        ) {
            Ok(subscription) => subscription,
            Err(error) => {
                state.record_error(&error);
                return Err(error);
            }
        };

        state.next_pump_id = state.next_pump_id.saturating_add(1);
        let pump_id = state.next_pump_id;
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_realtime_pump(
            Arc::downgrade(&self.inner),
            pump_id,
            subscription,
            stop_rx,
        ));

        tracing::debug!(%conversation_id, pump_id, "realtime subscription opened");
        state.realtime = Some(RealtimePump {
            pump_id,
            conversation_id,
            stop_tx: Some(stop_tx),
            task,
        });
        Ok(())
    }
}

impl ControllerInner {
    async fn apply_realtime(&self, conversation_id: ConversationId, event: FeedEvent) {
        let mut state = self.state.lock().await;
        if state.conversation_id() != Some(conversation_id) {
            tracing::trace!(%conversation_id, "realtime event for inactive conversation dropped");
            return;
        }

        match event {
            FeedEvent::Insert(message) => {
                state.store.apply_insert(message);
            }
            FeedEvent::Update(message) => {
                state.store.apply_update(message);
            }
        }
    }

    async fn realtime_closed(&self, pump_id: u64, conversation_id: ConversationId) {
        let mut state = self.state.lock().await;
        let owns_slot = state
            .realtime
            .as_ref()
            .is_some_and(|pump| pump.pump_id == pump_id);
        if !owns_slot {
            return;
        }

        state.realtime = None;
        let error = FeedError::SubscriptionDropped {
            stage: "realtime-pump",
            conversation_id,
        };
        tracing::warn!(error = %error, "realtime channel closed by the source");
        state.record_error(&error);
    }
}

async fn run_realtime_pump(
    inner: Weak<ControllerInner>,
    pump_id: u64,
    mut subscription: Subscription,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let conversation_id = subscription.conversation_id();

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => {
                subscription.unsubscribe();
                tracing::debug!(%conversation_id, pump_id, "realtime subscription closed");
                return;
            }
            event = subscription.next() => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                match event {
                    Some(event) => inner.apply_realtime(conversation_id, event).await,
                    None => {
                        inner.realtime_closed(pump_id, conversation_id).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn stop_pump(pump: Option<RealtimePump>) {
    let Some(mut pump) = pump else {
        return;
    };

    if let Some(stop_tx) = pump.stop_tx.take() {
        let _ = stop_tx.send(());
    }

    if let Err(error) = pump.task.await
        && error.is_panic()
    {
        tracing::error!(
            conversation_id = %pump.conversation_id,
            pump_id = pump.pump_id,
            "realtime pump panicked"
        );
    }
}

fn chronological(mut page: Vec<Message>) -> Vec<Message> {
    page.sort_by(Message::chronological_cmp);
    page
}

/// Rows pushed while a reload was in flight that the fresh page does not cover.
fn late_arrivals(current: &[Message], page: &[Message]) -> Vec<Message> {
    let page_ids = page.iter().map(|message| message.id).collect::<HashSet<_>>();
    let newest = page.last().map(Message::order_key);

    current
        .iter()
        .filter(|message| !page_ids.contains(&message.id))
        .filter(|message| newest.is_none_or(|key| message.order_key() > key))
        .cloned()
        .collect()
}
