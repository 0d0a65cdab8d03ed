use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};

use courier_feed::{
    FeedError, FeedErrorKind, FeedSettings, FeedSettingsStore, FeedSnapshot, IdentityRegistry,
    LoadMoreOutcome, Resolution, Session, SingleFlightResolver, SkipReason, SyncController,
    SyncOutcome, SyncPhase,
};
use courier_source::{
    ClientRecord, ConversationId, Identity, MemorySource, Message, MessageId, ProfileRecord,
    SearchFilter, SenderKind, SourceOp, UserId,
};

const SEARCH_TERM: &str = "ciao";
const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    settings_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    InitialLoad,
    ScrollBack,
    SearchThenClear,
    ConversationSwitch,
    RealtimeDrop,
    IdentitySingleFlight,
    All,
}

impl Scenario {
    const EACH: [Self; 6] = [
        Self::InitialLoad,
        Self::ScrollBack,
        Self::SearchThenClear,
        Self::ConversationSwitch,
        Self::RealtimeDrop,
        Self::IdentitySingleFlight,
    ];

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "initial_load" => Some(Self::InitialLoad),
            "scroll_back" => Some(Self::ScrollBack),
            "search_then_clear" => Some(Self::SearchThenClear),
            "conversation_switch" => Some(Self::ConversationSwitch),
            "realtime_drop" => Some(Self::RealtimeDrop),
            "identity_single_flight" => Some(Self::IdentitySingleFlight),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::InitialLoad => "initial_load",
            Self::ScrollBack => "scroll_back",
            Self::SearchThenClear => "search_then_clear",
            Self::ConversationSwitch => "conversation_switch",
            Self::RealtimeDrop => "realtime_drop",
            Self::IdentitySingleFlight => "identity_single_flight",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("feed operation failed: {source}"))]
    Feed {
        stage: &'static str,
        source: FeedError,
    },
    #[snafu(display("background task failed: {source}"))]
    Join {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
    #[snafu(display("timed out waiting for {condition}"))]
    WaitTimeout {
        stage: &'static str,
        condition: &'static str,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
    #[snafu(display("{failed} of {total} scenarios failed"))]
    ScenariosFailed {
        stage: &'static str,
        failed: usize,
        total: usize,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
    println!("runner_ok=true");
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    let settings = match args.settings_path.as_ref() {
        Some(path) => FeedSettingsStore::new(path.clone()).settings().as_ref().clone(),
        None => FeedSettings::default().with_page_size(4),
    };
    println!("scenario={}", args.scenario.name());
    println!("page_size={}", settings.page_size);

    let scenarios = match args.scenario {
        Scenario::All => Scenario::EACH.to_vec(),
        single => vec![single],
    };

    let total = scenarios.len();
    let mut failed = 0usize;
    for scenario in scenarios {
        match run_scenario(scenario, &settings).await {
            Ok(()) => println!("{}=PASS", scenario.name()),
            Err(error) => {
                failed += 1;
                println!("{}=FAIL", scenario.name());
                eprintln!("{}_error={error}", scenario.name());
            }
        }
    }

    if failed > 0 {
        return ScenariosFailedSnafu {
            stage: "run-scenarios",
            failed,
            total,
        }
        .fail();
    }
    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut settings_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--settings" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-settings-value",
                    arg: "--settings",
                })?;
                settings_path = Some(PathBuf::from(value));
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        settings_path,
    })
}

async fn run_scenario(scenario: Scenario, settings: &FeedSettings) -> RunnerResult<()> {
    match scenario {
        Scenario::InitialLoad => run_initial_load(settings).await,
        Scenario::ScrollBack => run_scroll_back(settings).await,
        Scenario::SearchThenClear => run_search_then_clear(settings).await,
        Scenario::ConversationSwitch => run_conversation_switch(settings).await,
        Scenario::RealtimeDrop => run_realtime_drop(settings).await,
        Scenario::IdentitySingleFlight => run_identity_single_flight().await,
        Scenario::All => Ok(()),
    }
}

struct Harness {
    source: Arc<MemorySource>,
    controller: SyncController,
    conversation_id: ConversationId,
    history_len: u64,
    page_size: usize,
}

impl Harness {
    /// Seeds two and a half pages of history so paging always ends on a short page.
    async fn seeded(settings: &FeedSettings) -> Self {
        let source = Arc::new(MemorySource::new());
        let conversation_id = ConversationId::new_v7();
        let page_size = settings.page_size;
        let history_len = (page_size * 2 + page_size / 2 + 1) as u64;
        source
            .insert_conversation(conversation_id, history(conversation_id, history_len))
            .await;

        let session = Session::sign_in(UserId::new_v7());
        let controller = SyncController::new(session, source.clone(), settings.clone());
        Self {
            source,
            controller,
            conversation_id,
            history_len,
            page_size,
        }
    }

    async fn select(&self) -> RunnerResult<SyncOutcome> {
        self.controller
            .select_conversation(Some(self.conversation_id))
            .await
            .context(FeedSnafu {
                stage: "harness-select",
            })
    }

    fn search_match_count(&self) -> usize {
        (0..self.history_len).filter(|id| is_search_hit(*id)).count()
    }
}

fn is_search_hit(id: u64) -> bool {
    id % 4 == 1
}

fn message(conversation_id: ConversationId, id: u64) -> Message {
    let content = if is_search_hit(id) {
        format!("Ciao, following up on #{id}")
    } else {
        format!("update #{id}")
    };
    let sender = match id % 3 {
        0 => SenderKind::EndUser,
        1 => SenderKind::AutomatedAgent,
        _ => SenderKind::HumanAgent,
    };
    Message::new(
        MessageId::new(id),
        conversation_id,
        1_700_000_000_000 + id * 60_000,
        sender,
        Some(content),
    )
}

fn history(conversation_id: ConversationId, len: u64) -> Vec<Message> {
    (0..len).map(|id| message(conversation_id, id)).collect()
}

fn ensure(
    condition: bool,
    scenario: &'static str,
    reason: impl FnOnce() -> String,
) -> RunnerResult<()> {
    if condition {
        return Ok(());
    }
    ScenarioFailedSnafu {
        stage: "scenario-check",
        scenario,
        reason: reason(),
    }
    .fail()
}

fn is_chronological(snapshot: &FeedSnapshot) -> bool {
    snapshot
        .messages
        .windows(2)
        .all(|pair| pair[0].order_key() < pair[1].order_key())
}

async fn wait_for(
    controller: &SyncController,
    condition: &'static str,
    predicate: impl Fn(&FeedSnapshot) -> bool,
) -> RunnerResult<FeedSnapshot> {
    let polled = tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            let snapshot = controller.snapshot().await;
            if predicate(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    polled.ok().context(WaitTimeoutSnafu {
        stage: "wait-for-snapshot",
        condition,
    })
}

async fn run_initial_load(settings: &FeedSettings) -> RunnerResult<()> {
    const NAME: &str = "initial_load";
    let harness = Harness::seeded(settings).await;
    harness.select().await?;

    let snapshot = harness.controller.snapshot().await;
    let first_id = harness.history_len - harness.page_size as u64;
    let expected = (first_id..harness.history_len).collect::<Vec<_>>();
    println!("initial_ids={:?}", snapshot.message_ids());

    ensure(snapshot.message_ids() == expected, NAME, || {
        format!("expected newest page {expected:?}, got {:?}", snapshot.message_ids())
    })?;
    ensure(snapshot.phase == SyncPhase::Ready, NAME, || {
        format!("expected ready phase, got {:?}", snapshot.phase)
    })?;
    ensure(snapshot.has_more_older, NAME, || "full page must leave history open".to_string())?;
    ensure(harness.controller.has_live_subscription().await, NAME, || {
        "realtime subscription was not opened".to_string()
    })
}

async fn run_scroll_back(settings: &FeedSettings) -> RunnerResult<()> {
    const NAME: &str = "scroll_back";
    let harness = Harness::seeded(settings).await;
    harness.select().await?;

    let mut pages = 1;
    loop {
        let outcome = harness.controller.load_more().await.context(FeedSnafu {
            stage: "scenario-scroll-back-load-more",
        })?;
        match outcome {
            LoadMoreOutcome::Loaded { added, exhausted } => {
                pages += 1;
                println!("page={pages} added={added} exhausted={exhausted}");
            }
            LoadMoreOutcome::Skipped(SkipReason::Exhausted) => break,
            other => {
                return ScenarioFailedSnafu {
                    stage: "scenario-scroll-back-outcome",
                    scenario: NAME,
                    reason: format!("unexpected load more outcome {other:?}"),
                }
                .fail();
            }
        }
    }

    for (op, count) in harness.source.call_counts() {
        println!("{}_calls={count}", op.name());
    }

    let snapshot = harness.controller.snapshot().await;
    ensure(snapshot.messages.len() as u64 == harness.history_len, NAME, || {
        format!(
            "expected {} rows after scrolling back, got {}",
            harness.history_len,
            snapshot.messages.len()
        )
    })?;
    ensure(is_chronological(&snapshot), NAME, || {
        "feed is not in chronological order".to_string()
    })?;
    let fetches = harness.source.call_count(SourceOp::FetchPage);
    ensure(fetches == pages, NAME, || {
        format!("expected {pages} page fetches, source saw {fetches}")
    })
}

async fn run_search_then_clear(settings: &FeedSettings) -> RunnerResult<()> {
    const NAME: &str = "search_then_clear";
    let harness = Harness::seeded(settings).await;
    harness.select().await?;
    let before = harness.controller.snapshot().await.message_ids();

    harness
        .controller
        .search(SearchFilter::new(SEARCH_TERM))
        .await
        .context(FeedSnafu {
            stage: "scenario-search",
        })?;

    let filtered = harness.controller.snapshot().await;
    let expected_matches = match settings.search_result_limit {
        Some(limit) => harness.search_match_count().min(limit),
        None => harness.search_match_count(),
    };
    println!("search_matches={}", filtered.messages.len());
    ensure(filtered.messages.len() == expected_matches, NAME, || {
        format!(
            "expected {expected_matches} matches, got {}",
            filtered.messages.len()
        )
    })?;
    ensure(filtered.phase == SyncPhase::Filtered, NAME, || {
        format!("expected filtered phase, got {:?}", filtered.phase)
    })?;

    let fetches = harness.source.call_count(SourceOp::FetchPage);
    let outcome = harness.controller.load_more().await.context(FeedSnafu {
        stage: "scenario-search-load-more",
    })?;
    ensure(
        outcome == LoadMoreOutcome::Skipped(SkipReason::Filtered)
            && harness.source.call_count(SourceOp::FetchPage) == fetches,
        NAME,
        || format!("load more while filtered must not fetch, got {outcome:?}"),
    )?;

    harness.controller.clear_filters().await.context(FeedSnafu {
        stage: "scenario-clear-filters",
    })?;
    let restored = harness.controller.snapshot().await;
    ensure(restored.message_ids() == before && restored.filter.is_none(), NAME, || {
        format!("expected {before:?} after clearing, got {:?}", restored.message_ids())
    })
}

async fn run_conversation_switch(settings: &FeedSettings) -> RunnerResult<()> {
    const NAME: &str = "conversation_switch";
    let harness = Harness::seeded(settings).await;
    harness.select().await?;

    let other = ConversationId::new_v7();
    harness.source.insert_conversation(other, history(other, 2)).await;

    let mut hold = harness.source.hold(SourceOp::FetchPage);
    let stale = tokio::spawn({
        let controller = harness.controller.clone();
        async move { controller.load_more().await }
    });
    hold.parked().await;

    harness
        .controller
        .select_conversation(Some(other))
        .await
        .context(FeedSnafu {
            stage: "scenario-switch-select",
        })?;
    hold.release();

    let outcome = stale
        .await
        .context(JoinSnafu {
            stage: "scenario-switch-join",
        })?
        .context(FeedSnafu {
            stage: "scenario-switch-stale-page",
        })?;
    println!("stale_outcome={outcome:?}");
    ensure(outcome == LoadMoreOutcome::Discarded, NAME, || {
        format!("stale page was not discarded: {outcome:?}")
    })?;

    let snapshot = harness.controller.snapshot().await;
    ensure(
        snapshot.conversation_id == Some(other) && snapshot.message_ids() == vec![0, 1],
        NAME,
        || format!("feed leaked rows across conversations: {:?}", snapshot.message_ids()),
    )?;
    let leftover = harness.source.live_subscriber_count(harness.conversation_id);
    ensure(leftover == 0, NAME, || {
        format!("previous conversation still has {leftover} live subscribers")
    })
}

async fn run_realtime_drop(settings: &FeedSettings) -> RunnerResult<()> {
    const NAME: &str = "realtime_drop";
    let harness = Harness::seeded(settings).await;
    harness.select().await?;

    let pushed = harness.history_len;
    harness
        .source
        .publish_insert(message(harness.conversation_id, pushed))
        .await;
    wait_for(&harness.controller, "pushed row", |snapshot| {
        snapshot.latest().is_some_and(|latest| latest.id.0 == pushed)
    })
    .await?;

    harness.source.disconnect_subscribers(harness.conversation_id);
    let dropped = wait_for(&harness.controller, "subscription notice", |snapshot| {
        snapshot
            .error
            .as_ref()
            .is_some_and(|notice| notice.kind == FeedErrorKind::Subscription)
    })
    .await?;
    println!(
        "drop_notice={}",
        dropped.error.map(|notice| notice.message).unwrap_or_default()
    );

    harness.controller.resubscribe().await.context(FeedSnafu {
        stage: "scenario-realtime-resubscribe",
    })?;
    harness
        .source
        .publish_insert(message(harness.conversation_id, pushed + 1))
        .await;
    wait_for(&harness.controller, "row after resubscribe", |snapshot| {
        snapshot.latest().is_some_and(|latest| latest.id.0 == pushed + 1)
    })
    .await?;

    let snapshot = harness.controller.snapshot().await;
    ensure(snapshot.error.is_none() && is_chronological(&snapshot), NAME, || {
        "feed did not recover after resubscribe".to_string()
    })
}

async fn run_identity_single_flight() -> RunnerResult<()> {
    const NAME: &str = "identity_single_flight";
    let source = Arc::new(MemorySource::new());
    let user_id = UserId::new_v7();
    source
        .insert_identity(Identity {
            user_id,
            client: ClientRecord {
                client_id: "client-qa".to_string(),
                display_name: "QA Client".to_string(),
            },
            profile: ProfileRecord {
                user_id,
                full_name: Some("QA Operator".to_string()),
                email: None,
            },
        })
        .await;
    let resolver =
        SingleFlightResolver::with_registry(source.clone(), Arc::new(IdentityRegistry::new()));

    let mut hold = source.hold(SourceOp::ResolveIdentity);
    let owner = tokio::spawn({
        let resolver = resolver.clone();
        async move { resolver.resolve(user_id).await }
    });
    hold.parked().await;

    let second = resolver.resolve(user_id).await;
    hold.release();
    let first = owner.await.context(JoinSnafu {
        stage: "scenario-identity-join",
    })?;

    let lookups = source.call_count(SourceOp::ResolveIdentity);
    println!("identity_lookups={lookups}");
    ensure(second == Resolution::Deferred, NAME, || {
        "concurrent resolve was not deferred".to_string()
    })?;
    ensure(first.into_resolved().is_some() && lookups == 1, NAME, || {
        format!("expected one successful lookup, saw {lookups}")
    })?;
    ensure(resolver.published(user_id).is_some(), NAME, || {
        "resolved identity was not published".to_string()
    })
}
