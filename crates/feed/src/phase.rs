/// Lifecycle of one conversation view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncPhase {
    /// No conversation selected.
    #[default]
    Idle,
    /// First page in flight.
    Loading,
    /// Page loaded, realtime live.
    Ready,
    /// Older page in flight; realtime stays live.
    LoadingMore,
    /// Filtered query in flight.
    Searching,
    /// Search results shown; pagination suspended.
    Filtered,
}

/// State transition input for the sync lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTransition {
    Select,
    Close,
    InitialLoaded,
    InitialFailed { filtered: bool },
    BeginLoadMore,
    LoadMoreSettled,
    BeginSearch,
    SearchLoaded,
    SearchFailed { filtered: bool },
    BeginClearFilters,
}

/// Rejection reason for transitions that do not apply in the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTransitionRejection {
    NoConversation,
    AlreadyLoadingMore,
    PaginationSuspended,
    InitialLoadPending,
    NoActiveFilter,
    OutOfOrder {
        phase: SyncPhase,
        transition: SyncTransition,
    },
}

pub type SyncTransitionResult = Result<SyncPhase, SyncTransitionRejection>;

impl SyncPhase {
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// True while search results replace the chronological window.
    pub fn is_filtered(self) -> bool {
        matches!(self, Self::Searching | Self::Filtered)
    }

    /// Applies one transition deterministically.
    ///
    /// Selection and close are accepted from every phase. Settle transitions must
    /// match the operation that is currently in flight.
    pub fn apply(self, transition: SyncTransition) -> SyncTransitionResult {
        match transition {
            SyncTransition::Select => Ok(Self::Loading),
            SyncTransition::Close => Ok(Self::Idle),
            SyncTransition::InitialLoaded => self.settle(Self::Loading, transition, Self::Ready),
            SyncTransition::InitialFailed { filtered } => {
                self.settle(Self::Loading, transition, Self::resting(filtered))
            }
            SyncTransition::BeginLoadMore => self.apply_begin_load_more(),
            SyncTransition::LoadMoreSettled => {
                self.settle(Self::LoadingMore, transition, Self::Ready)
            }
            SyncTransition::BeginSearch => match self {
                Self::Idle => Err(SyncTransitionRejection::NoConversation),
                Self::Loading
                | Self::Ready
                | Self::LoadingMore
                | Self::Searching
                | Self::Filtered => Ok(Self::Searching),
            },
            SyncTransition::SearchLoaded => {
                self.settle(Self::Searching, transition, Self::Filtered)
            }
            SyncTransition::SearchFailed { filtered } => {
                self.settle(Self::Searching, transition, Self::resting(filtered))
            }
            SyncTransition::BeginClearFilters => match self {
                Self::Idle => Err(SyncTransitionRejection::NoConversation),
                Self::Searching | Self::Filtered => Ok(Self::Loading),
                Self::Loading | Self::Ready | Self::LoadingMore => {
                    Err(SyncTransitionRejection::NoActiveFilter)
                }
            },
        }
    }

    fn resting(filtered: bool) -> Self {
        if filtered { Self::Filtered } else { Self::Ready }
    }

    fn settle(
        self,
        expected: Self,
        transition: SyncTransition,
        next: Self,
    ) -> SyncTransitionResult {
        if self == expected {
            Ok(next)
        } else {
            Err(SyncTransitionRejection::OutOfOrder {
                phase: self,
                transition,
            })
        }
    }

    fn apply_begin_load_more(self) -> SyncTransitionResult {
        match self {
            Self::Ready => Ok(Self::LoadingMore),
            Self::Idle => Err(SyncTransitionRejection::NoConversation),
            Self::LoadingMore => Err(SyncTransitionRejection::AlreadyLoadingMore),
            Self::Loading => Err(SyncTransitionRejection::InitialLoadPending),
            Self::Searching | Self::Filtered => Err(SyncTransitionRejection::PaginationSuspended),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_walks_every_phase() {
        let phase = SyncPhase::Idle
            .apply(SyncTransition::Select)
            .and_then(|phase| phase.apply(SyncTransition::InitialLoaded))
            .and_then(|phase| phase.apply(SyncTransition::BeginLoadMore))
            .and_then(|phase| phase.apply(SyncTransition::LoadMoreSettled))
            .and_then(|phase| phase.apply(SyncTransition::BeginSearch))
            .and_then(|phase| phase.apply(SyncTransition::SearchLoaded));
        assert_eq!(phase, Ok(SyncPhase::Filtered));

        let cleared = SyncPhase::Filtered
            .apply(SyncTransition::BeginClearFilters)
            .and_then(|phase| phase.apply(SyncTransition::InitialLoaded));
        assert_eq!(cleared, Ok(SyncPhase::Ready));
    }

    #[test]
    fn load_more_is_rejected_outside_ready() {
        assert_eq!(
            SyncPhase::LoadingMore.apply(SyncTransition::BeginLoadMore),
            Err(SyncTransitionRejection::AlreadyLoadingMore)
        );
        assert_eq!(
            SyncPhase::Filtered.apply(SyncTransition::BeginLoadMore),
            Err(SyncTransitionRejection::PaginationSuspended)
        );
        assert_eq!(
            SyncPhase::Idle.apply(SyncTransition::BeginLoadMore),
            Err(SyncTransitionRejection::NoConversation)
        );
        assert_eq!(
            SyncPhase::Loading.apply(SyncTransition::BeginLoadMore),
            Err(SyncTransitionRejection::InitialLoadPending)
        );
    }

    #[test]
    fn failures_return_to_the_resting_phase() {
        assert_eq!(
            SyncPhase::Searching.apply(SyncTransition::SearchFailed { filtered: false }),
            Ok(SyncPhase::Ready)
        );
        assert_eq!(
            SyncPhase::Searching.apply(SyncTransition::SearchFailed { filtered: true }),
            Ok(SyncPhase::Filtered)
        );
        assert_eq!(
            SyncPhase::Loading.apply(SyncTransition::InitialFailed { filtered: true }),
            Ok(SyncPhase::Filtered)
        );
    }

    #[test]
    fn settle_without_matching_operation_is_out_of_order() {
        assert!(matches!(
            SyncPhase::Ready.apply(SyncTransition::LoadMoreSettled),
            Err(SyncTransitionRejection::OutOfOrder { .. })
        ));
        assert_eq!(
            SyncPhase::Ready.apply(SyncTransition::BeginClearFilters),
            Err(SyncTransitionRejection::NoActiveFilter)
        );
    }
}
