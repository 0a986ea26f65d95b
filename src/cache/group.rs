//! Named cache namespaces.
//!
//! A [`Group`] is one namespace of cached values: a byte-budgeted LRU shard
//! behind a mutex, an optional source loader consulted on miss, an optional
//! peer picker for cluster reads, and a per-group coalescer so that a herd
//! of concurrent readers of one missing key costs a single load. Groups are
//! registered process-wide by name and live for the life of the process.
//!
//! # Examples
//!
//! ```rust,no_run
//! use ika::cache::{Group, GetterFn};
//!
//! # async fn example() -> Result<(), ika::cache::CacheError> {
//! let scores = Group::new(
//!     "scores",
//!     2 << 10,
//!     GetterFn(|key: String| async move { Ok(key.into_bytes()) }),
//! );
//! let view = scores.get("alice").await?;
//! assert_eq!(view.to_string(), "alice");
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::cache::byte_view::ByteView;
use crate::cache::lru;
use crate::cache::peers::PeerPicker;
use crate::cache::singleflight::Flight;
use crate::cache::CacheError;

/// Source-of-truth loader consulted when a key misses the cache cluster.
#[async_trait]
pub trait Getter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError>;
}

/// Adapts an async closure into a [`Getter`].
pub struct GetterFn<F>(pub F);

#[async_trait]
impl<F, Fut> Getter for GetterFn<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>, CacheError>> + Send,
{
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        (self.0)(key.to_string()).await
    }
}

/// Mutex-guarded LRU shard. The inner cache is built lazily on first write
/// so an idle group costs only its registration.
struct Shard {
    cache_bytes: usize,
    lru: Mutex<Option<lru::Cache<ByteView>>>,
}

impl Shard {
    fn new(cache_bytes: usize) -> Self {
        Self { cache_bytes, lru: Mutex::new(None) }
    }

    fn get(&self, key: &str) -> Option<ByteView> {
        self.lru.lock().as_mut()?.get(key).cloned()
    }

    fn add(&self, key: &str, value: ByteView) {
        let mut guard = self.lru.lock();
        let cache = guard.get_or_insert_with(|| lru::Cache::new(self.cache_bytes, None));
        cache.add(key, value);
    }
}

/// Process-wide group registry.
static GROUPS: Lazy<RwLock<HashMap<String, Arc<Group>>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// One named cache namespace.
pub struct Group {
    name: String,
    getter: Option<Arc<dyn Getter>>,
    main_cache: Shard,
    peers: OnceLock<Arc<dyn PeerPicker>>,
    flight: Flight<Result<ByteView, CacheError>>,
}

impl Group {
    /// Creates and registers a group.
    ///
    /// `cache_bytes` bounds the group's LRU shard (0 = unbounded).
    ///
    /// # Panics
    ///
    /// Panics if a group with the same name already exists; names are
    /// insertion-unique for the life of the process.
    pub fn new(name: impl Into<String>, cache_bytes: usize, getter: impl Getter + 'static) -> Arc<Group> {
        Self::build(name, cache_bytes, Some(Arc::new(getter)))
    }

    /// Creates and registers a group with no source loader.
    ///
    /// Such a group serves cluster and cache reads only; a local miss with
    /// no owning peer fails with [`CacheError::NotFound`].
    pub fn without_getter(name: impl Into<String>, cache_bytes: usize) -> Arc<Group> {
        Self::build(name, cache_bytes, None)
    }

    fn build(name: impl Into<String>, cache_bytes: usize, getter: Option<Arc<dyn Getter>>) -> Arc<Group> {
        let name = name.into();
        let group = Arc::new(Group {
            name: name.clone(),
            getter,
            main_cache: Shard::new(cache_bytes),
            peers: OnceLock::new(),
            flight: Flight::new(),
        });

        let mut groups = GROUPS.write();
        if groups.contains_key(&name) {
            panic!("cache group {name:?} registered twice");
        }
        groups.insert(name, Arc::clone(&group));
        group
    }

    /// Looks up a previously registered group by name.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use ika::cache::{Group, GetterFn};
    ///
    /// let created = Group::new("users", 0, GetterFn(|key: String| async move {
    ///     Ok(key.into_bytes())
    /// }));
    /// let found = Group::get_group("users").unwrap();
    /// assert_eq!(found.name(), created.name());
    /// ```
    pub fn get_group(name: &str) -> Option<Arc<Group>> {
        GROUPS.read().get(name).cloned()
    }

    /// Wires the group into a cluster.
    ///
    /// # Panics
    ///
    /// Panics when called twice; a group's peer picker is set once.
    pub fn register_peers(&self, peers: Arc<dyn PeerPicker>) {
        if self.peers.set(peers).is_err() {
            panic!("cache group {:?}: register_peers called more than once", self.name);
        }
    }

    /// Namespace name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the value for `key`, loading it on miss.
    ///
    /// The whole lookup runs under the group's coalescer, so any readers of
    /// one key that overlap in time observe a single unit of work: one
    /// cache probe and, on miss, one load. A reader that joins a wave
    /// started before the key was cached therefore gets that wave's loaded
    /// value rather than probing the cache itself.
    pub async fn get(&self, key: &str) -> Result<ByteView, CacheError> {
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }

        self.flight
            .run(key, || async {
                if let Some(view) = self.main_cache.get(key) {
                    tracing::debug!(group = %self.name, key, "cache hit");
                    return Ok(view);
                }
                self.load(key).await
            })
            .await
    }

    /// Miss path: prefer the owning peer, fall back to the local loader.
    ///
    /// A peer failure surfaces to the caller as-is; it is not retried
    /// against the local loader.
    async fn load(&self, key: &str) -> Result<ByteView, CacheError> {
        if let Some(picker) = self.peers.get() {
            if let Some(peer) = picker.pick_peer(key) {
                tracing::debug!(group = %self.name, key, "loading from peer");
                let bytes = peer.get(&self.name, key).await?;
                let view = ByteView::from(bytes);
                self.populate_cache(key, view.clone());
                return Ok(view);
            }
        }
        self.get_locally(key).await
    }

    async fn get_locally(&self, key: &str) -> Result<ByteView, CacheError> {
        let getter = self.getter.as_ref().ok_or_else(|| CacheError::NotFound {
            group: self.name.clone(),
            key: key.to_string(),
        })?;

        let payload = getter.get(key).await?;
        let view = ByteView::from(payload);
        self.populate_cache(key, view.clone());
        Ok(view)
    }

    fn populate_cache(&self, key: &str, value: ByteView) {
        self.main_cache.add(key, value);
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    fn sample_db() -> HashMap<&'static str, &'static str> {
        HashMap::from([("A", "A"), ("B", "B"), ("C", "C")])
    }

    #[tokio::test]
    async fn getter_fn_adapts_closures() {
        let getter = GetterFn(|key: String| async move { Ok(key.into_bytes()) });
        assert_eq!(getter.get("key").await.unwrap(), b"key");
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let loads: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let counter = Arc::clone(&loads);

        let group = Group::new(
            "group-test-loads",
            2 << 10,
            GetterFn(move |key: String| {
                let counter = Arc::clone(&counter);
                async move {
                    match sample_db().get(key.as_str()) {
                        Some(value) => {
                            *counter.lock().entry(key).or_insert(0) += 1;
                            Ok(value.as_bytes().to_vec())
                        }
                        None => Err(CacheError::NotFound {
                            group: "group-test-loads".into(),
                            key,
                        }),
                    }
                }
            }),
        );

        let first = group.get("A").await.unwrap();
        assert_eq!(first.to_string(), "A");
        assert_eq!(loads.lock().get("A"), Some(&1));

        let second = group.get("A").await.unwrap();
        assert_eq!(second.to_string(), "A");
        assert_eq!(loads.lock().get("A"), Some(&1), "hit must not reload");
    }

    #[tokio::test]
    async fn loader_errors_surface_unchanged() {
        let group = Group::new(
            "group-test-missing",
            2 << 10,
            GetterFn(|key: String| async move {
                let missing = CacheError::NotFound { group: "group-test-missing".into(), key };
                Err::<Vec<u8>, _>(missing)
            }),
        );

        let err = group.get("unknown").await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound { ref key, .. } if key == "unknown"));
    }

    #[tokio::test]
    async fn empty_key_fails_fast() {
        let group = Group::new(
            "group-test-empty-key",
            2 << 10,
            GetterFn(|key: String| async move { Ok(key.into_bytes()) }),
        );
        assert!(matches!(group.get("").await, Err(CacheError::EmptyKey)));
    }

    #[tokio::test]
    async fn registry_resolves_registered_groups() {
        let group = Group::new(
            "group-test-registry",
            16,
            GetterFn(|key: String| async move { Ok(key.into_bytes()) }),
        );
        let found = Group::get_group("group-test-registry").unwrap();
        assert_eq!(found.name(), group.name());
        assert!(Group::get_group("group-test-unregistered").is_none());
    }

    #[tokio::test]
    async fn getterless_group_misses_with_not_found() {
        let group = Group::without_getter("group-test-no-getter", 16);
        let err = group.get("anything").await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound { .. }));
    }
}
