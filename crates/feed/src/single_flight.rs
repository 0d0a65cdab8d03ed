use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};

use courier_source::{Identity, IdentitySource, UserId};

/// Outcome of a single-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    /// This caller ran the lookup. `None` covers both absence and swallowed failures.
    Resolved(Option<T>),
    /// Another caller owns the lookup for this key; read the published value later.
    Deferred,
}

impl<T> Resolution<T> {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred)
    }

    pub fn into_resolved(self) -> Option<T> {
        match self {
            Self::Resolved(value) => value,
            Self::Deferred => None,
        }
    }
}

/// Process-wide in-flight markers plus the last published value per key.
pub struct FlightRegistry<K, V> {
    in_flight: Mutex<HashSet<K>>,
    published: RwLock<HashMap<K, V>>,
}

/// Holds the in-flight mark for one key; dropping it clears the mark.
pub struct FlightGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
{
    registry: &'a FlightRegistry<K, V>,
    key: K,
}

impl<K, V> Default for FlightRegistry<K, V> {
    fn default() -> Self {
        Self {
            in_flight: Mutex::new(HashSet::new()),
            published: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> FlightRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `key` in flight, or returns `None` when another caller already holds it.
    pub fn try_begin(&self, key: K) -> Option<FlightGuard<'_, K, V>> {
        let mut in_flight = self.lock_in_flight();
        if !in_flight.insert(key.clone()) {
            return None;
        }

        Some(FlightGuard {
            registry: self,
            key,
        })
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.lock_in_flight().contains(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock_in_flight().len()
    }

    pub fn publish(&self, key: K, value: V) {
        self.published
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
    }

    pub fn published(&self, key: &K) -> Option<V> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn forget(&self, key: &K) -> Option<V> {
        self.published
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashSet<K>> {
        // Markers are plain set entries; a panic elsewhere cannot leave them half-written.
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> Drop for FlightGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.registry
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

pub type IdentityRegistry = FlightRegistry<UserId, Arc<Identity>>;

static IDENTITY_REGISTRY: OnceLock<Arc<IdentityRegistry>> = OnceLock::new();

pub fn global_identity_registry() -> Arc<IdentityRegistry> {
    IDENTITY_REGISTRY
        .get_or_init(|| Arc::new(IdentityRegistry::new()))
        .clone()
}

/// Client/profile lookup that never runs two fetches for the same user at once.
#[derive(Clone)]
pub struct SingleFlightResolver {
    source: Arc<dyn IdentitySource>,
    registry: Arc<IdentityRegistry>,
}

impl SingleFlightResolver {
    pub fn new(source: Arc<dyn IdentitySource>) -> Self {
        Self::with_registry(source, global_identity_registry())
    }

    pub fn with_registry(source: Arc<dyn IdentitySource>, registry: Arc<IdentityRegistry>) -> Self {
        Self { source, registry }
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub async fn resolve(&self, user_id: UserId) -> Resolution<Arc<Identity>> {
        let Some(_flight) = self.registry.try_begin(user_id) else {
            tracing::debug!(%user_id, "identity lookup already in flight; deferring");
            return Resolution::Deferred;
        };

        match self.source.resolve_identity(user_id).await {
            Ok(Some(identity)) => {
                let identity = Arc::new(identity);
                self.registry.publish(user_id, identity.clone());
                tracing::debug!(
                    %user_id,
                    client_id = %identity.client.client_id,
                    "identity resolved"
                );
                Resolution::Resolved(Some(identity))
            }
            Ok(None) => {
                self.registry.forget(&user_id);
                tracing::info!(%user_id, "no client/profile bound to user");
                Resolution::Resolved(None)
            }
            Err(error) => {
                // Failures stay local to this caller so concurrent callers do not amplify them.
                tracing::warn!(%user_id, error = %error, "identity lookup failed");
                Resolution::Resolved(None)
            }
        }
    }

    pub fn published(&self, user_id: UserId) -> Option<Arc<Identity>> {
        self.registry.published(&user_id)
    }

    pub fn is_in_flight(&self, user_id: UserId) -> bool {
        self.registry.is_in_flight(&user_id)
    }

    pub fn forget(&self, user_id: UserId) {
        self.registry.forget(&user_id);
    }
}
