pub mod controller;
pub mod error;
pub mod phase;
pub mod session;
pub mod settings;
pub mod single_flight;
pub mod snapshot;
pub mod store;

pub use controller::{
    FeedEpoch, FeedTarget, LoadMoreOutcome, SkipReason, SyncController, SyncOutcome,
};
pub use error::{FeedError, FeedErrorKind, FeedErrorNotice, FeedResult};
pub use phase::{SyncPhase, SyncTransition, SyncTransitionRejection};
pub use session::Session;
pub use settings::{DEFAULT_PAGE_SIZE, FeedSettings, FeedSettingsError, FeedSettingsStore};
pub use single_flight::{
    FlightGuard, FlightRegistry, IdentityRegistry, Resolution, SingleFlightResolver,
    global_identity_registry,
};
pub use snapshot::{DayGroup, FeedSnapshot};
pub use store::{FeedStore, PrependOutcome};
