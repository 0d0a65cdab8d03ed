use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwapOption;
use courier_source::{Identity, UserId};

use crate::single_flight::{Resolution, SingleFlightResolver};

/// Authenticated user scope, created on sign-in and ended on sign-out.
///
/// Controllers receive the session explicitly instead of reading ambient auth state.
pub struct Session {
    user_id: UserId,
    identity: ArcSwapOption<Identity>,
    signed_in: AtomicBool,
}

impl Session {
    pub fn sign_in(user_id: UserId) -> Arc<Self> {
        tracing::info!(%user_id, "session started");
        Arc::new(Self {
            user_id,
            identity: ArcSwapOption::empty(),
            signed_in: AtomicBool::new(true),
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn identity(&self) -> Option<Arc<Identity>> {
        self.identity.load_full()
    }

    pub fn is_signed_in(&self) -> bool {
        self.signed_in.load(Ordering::Acquire)
    }

    /// Resolves client/profile through the single-flight resolver.
    ///
    /// A deferred lookup falls back to whatever the in-flight owner has already
    /// published. Results that land after sign-out are discarded.
    pub async fn refresh_identity(&self, resolver: &SingleFlightResolver) -> Option<Arc<Identity>> {
        if !self.is_signed_in() {
            return None;
        }

        let resolved = match resolver.resolve(self.user_id).await {
            Resolution::Resolved(identity) => identity,
            Resolution::Deferred => match resolver.published(self.user_id) {
                Some(identity) => Some(identity),
                None => return self.identity(),
            },
        };

        if !self.is_signed_in() {
            tracing::debug!(user_id = %self.user_id, "identity resolved after sign-out; discarded");
            resolver.forget(self.user_id);
            return None;
        }

        self.identity.store(resolved.clone());
        // sign_out may have run between the check and the store.
        if !self.is_signed_in() {
            self.identity.store(None);
            resolver.forget(self.user_id);
            return None;
        }
        resolved
    }

    /// Ends the session and drops the user's identity from the shared registry.
    /// Further refreshes are ignored.
    pub fn sign_out(&self, resolver: &SingleFlightResolver) {
        if self.signed_in.swap(false, Ordering::AcqRel) {
            self.identity.store(None);
            resolver.forget(self.user_id);
            tracing::info!(user_id = %self.user_id, "session ended");
        }
    }
}
