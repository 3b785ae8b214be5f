//! Cache invalidation per shard.
//!
//! A [`ShardAwareStore`] wraps a backing [`Store`] and remembers which shard
//! wrote each key. When a shard goes away its keys can be dropped without
//! touching data that other shards still own.

use crate::error::Error;
use crate::shard::ShardInfo;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, warn};

/// A key-value cache backend
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    async fn save(&self, key: Self::Key, value: Self::Value) -> Result<(), Error>;

    async fn find(&self, key: &Self::Key) -> Result<Option<Self::Value>, Error>;

    async fn delete(&self, key: &Self::Key) -> Result<(), Error>;

    async fn keys(&self) -> Result<Vec<Self::Key>, Error>;

    /// The backend's own reaction to a shard going away
    async fn invalidate(&self, shard: ShardInfo) -> Result<(), Error>;
}

/// `DashMap`-backed store. Its own `invalidate` clears everything.
#[derive(Debug)]
pub struct MemoryStore<K: Eq + Hash, V> {
    entries: DashMap<K, V>,
}

impl<K: Eq + Hash, V> MemoryStore<K, V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash, V> Default for MemoryStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K, V> Store for MemoryStore<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Key = K;
    type Value = V;

    async fn save(&self, key: K, value: V) -> Result<(), Error> {
        self.entries.insert(key, value);
        Ok(())
    }

    async fn find(&self, key: &K) -> Result<Option<V>, Error> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, key: &K) -> Result<(), Error> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<K>, Error> {
        Ok(self.entries.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn invalidate(&self, shard: ShardInfo) -> Result<(), Error> {
        debug!("[SHARD-{}] Clearing memory store", shard.index());
        self.entries.clear();
        Ok(())
    }
}

/// Records which keys each shard wrote
#[async_trait]
pub trait KeyStore<K: Send + Sync + 'static>: Send + Sync {
    async fn add(&self, shard: u32, key: K) -> Result<(), Error>;

    /// Forget `key` for every shard
    async fn remove(&self, key: &K) -> Result<(), Error>;

    async fn keys(&self, shard: u32) -> Result<Vec<K>, Error>;
}

/// In-memory key sets, one per shard
#[derive(Debug)]
pub struct LocalKeyStore<K: Eq + Hash> {
    shards: DashMap<u32, DashSet<K>>,
}

impl<K: Eq + Hash> LocalKeyStore<K> {
    pub fn new() -> Self {
        Self {
            shards: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash> Default for LocalKeyStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K> KeyStore<K> for LocalKeyStore<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    async fn add(&self, shard: u32, key: K) -> Result<(), Error> {
        self.shards.entry(shard).or_default().insert(key);
        Ok(())
    }

    async fn remove(&self, key: &K) -> Result<(), Error> {
        for keys in self.shards.iter() {
            keys.value().remove(key);
        }
        Ok(())
    }

    async fn keys(&self, shard: u32) -> Result<Vec<K>, Error> {
        Ok(self
            .shards
            .get(&shard)
            .map(|keys| keys.iter().map(|key| key.key().clone()).collect())
            .unwrap_or_default())
    }
}

/// A store that tracks the shard responsible for each write.
///
/// The backing operation always runs first. Key tracking is best effort:
/// a key-store failure is logged and the write still succeeds.
pub struct ShardAwareStore<S: Store> {
    inner: S,
    keys: Arc<dyn KeyStore<S::Key>>,
}

impl<S: Store> ShardAwareStore<S> {
    pub fn new(inner: S) -> Self {
        Self::with_key_store(inner, Arc::new(LocalKeyStore::new()))
    }

    pub fn with_key_store(inner: S, keys: Arc<dyn KeyStore<S::Key>>) -> Self {
        Self { inner, keys }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub async fn save(&self, shard: ShardInfo, key: S::Key, value: S::Value) -> Result<(), Error> {
        self.inner.save(key.clone(), value).await?;
        if let Err(e) = self.keys.add(shard.index(), key).await {
            warn!("[SHARD-{}] Failed to record cache key: {}", shard.index(), e);
        }
        Ok(())
    }

    pub async fn delete(&self, shard: ShardInfo, key: &S::Key) -> Result<(), Error> {
        self.inner.delete(key).await?;
        if let Err(e) = self.keys.remove(key).await {
            warn!("[SHARD-{}] Failed to forget cache key: {}", shard.index(), e);
        }
        Ok(())
    }

    /// Save several entries written by `shard`
    pub async fn save_all(
        &self,
        shard: ShardInfo,
        entries: impl IntoIterator<Item = (S::Key, S::Value)>,
    ) -> Result<(), Error> {
        for (key, value) in entries {
            self.save(shard, key, value).await?;
        }
        Ok(())
    }

    /// Delete several keys, forgetting them for every shard
    pub async fn delete_all<'a>(
        &self,
        shard: ShardInfo,
        keys: impl IntoIterator<Item = &'a S::Key>,
    ) -> Result<(), Error> {
        for key in keys {
            self.delete(shard, key).await?;
        }
        Ok(())
    }

    pub async fn find(&self, key: &S::Key) -> Result<Option<S::Value>, Error> {
        self.inner.find(key).await
    }

    pub async fn keys(&self) -> Result<Vec<S::Key>, Error> {
        self.inner.keys().await
    }

    /// Keys currently attributed to `shard`
    pub async fn tracked_keys(&self, shard: ShardInfo) -> Result<Vec<S::Key>, Error> {
        self.keys.keys(shard.index()).await
    }
}

/// Type-erased view of a [`ShardAwareStore`] for the registry
#[async_trait]
pub trait TrackedStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Delete every key recorded for `shard`, returning how many went
    async fn invalidate_tracked(&self, shard: ShardInfo) -> Result<usize, Error>;

    /// Delegate to the backing store's own invalidation
    async fn invalidate_backing(&self, shard: ShardInfo) -> Result<(), Error>;
}

#[async_trait]
impl<S: Store> TrackedStore for ShardAwareStore<S> {
    fn name(&self) -> &'static str {
        std::any::type_name::<S::Value>()
    }

    async fn invalidate_tracked(&self, shard: ShardInfo) -> Result<usize, Error> {
        // Only the keys read here are forgotten; saves that land during
        // the deletes stay tracked for the next invalidation
        let keys = self.keys.keys(shard.index()).await?;
        let mut removed = 0;

        for key in &keys {
            match self.inner.delete(key).await {
                Ok(()) => {
                    removed += 1;
                    // Other shards may have touched the same key
                    if let Err(e) = self.keys.remove(key).await {
                        warn!("[SHARD-{}] Failed to forget cache key: {}", shard.index(), e);
                    }
                }
                Err(e) => warn!(
                    "[SHARD-{}] Failed to delete {:?} from {}: {}",
                    shard.index(),
                    key,
                    self.name(),
                    e
                ),
            }
        }

        Ok(removed)
    }

    async fn invalidate_backing(&self, shard: ShardInfo) -> Result<(), Error> {
        self.inner.invalidate(shard).await
    }
}

/// Registered shard-aware stores, keyed by entity type name
#[derive(Default)]
pub struct KeyStoreRegistry {
    stores: DashMap<&'static str, Arc<dyn TrackedStore>>,
}

impl KeyStoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, store: Arc<dyn TrackedStore>) {
        if self.stores.insert(store.name(), store).is_some() {
            debug!("Replaced registered store");
        }
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stores.iter().map(|entry| *entry.key()).collect()
    }

    // Cloned out so no map lock is held across an await
    fn snapshot(&self) -> Vec<Arc<dyn TrackedStore>> {
        self.stores.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// How cached data is dropped when a shard disconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidationStrategy {
    /// Keep everything
    Disabled,
    /// Let each backing store decide
    Identity,
    /// Delete only the keys the shard wrote
    #[default]
    KeyTracking,
}

/// Applies an [`InvalidationStrategy`] to the registered stores
pub struct Invalidation {
    strategy: InvalidationStrategy,
    registry: KeyStoreRegistry,
}

impl Invalidation {
    pub fn new(strategy: InvalidationStrategy) -> Self {
        Self {
            strategy,
            registry: KeyStoreRegistry::new(),
        }
    }

    pub fn strategy(&self) -> InvalidationStrategy {
        self.strategy
    }

    pub fn registry(&self) -> &KeyStoreRegistry {
        &self.registry
    }

    /// Wrap `store` with key tracking and register it
    pub fn adapt<S: Store>(&self, store: S) -> Arc<ShardAwareStore<S>> {
        self.register(Arc::new(ShardAwareStore::new(store)))
    }

    /// Like [`adapt`](Self::adapt) with an external key store
    pub fn adapt_with<S: Store>(
        &self,
        store: S,
        keys: Arc<dyn KeyStore<S::Key>>,
    ) -> Arc<ShardAwareStore<S>> {
        self.register(Arc::new(ShardAwareStore::with_key_store(store, keys)))
    }

    fn register<S: Store>(&self, store: Arc<ShardAwareStore<S>>) -> Arc<ShardAwareStore<S>> {
        self.registry.register(store.clone());
        store
    }

    /// Invalidate everything attributed to `shard`.
    ///
    /// Failures in one store are logged and do not stop the others.
    /// Returns the number of keys removed under key tracking.
    pub async fn invalidate(&self, shard: ShardInfo) -> usize {
        let mut removed = 0;

        match self.strategy {
            InvalidationStrategy::Disabled => {}
            InvalidationStrategy::Identity => {
                for store in self.registry.snapshot() {
                    if let Err(e) = store.invalidate_backing(shard).await {
                        warn!(
                            "[SHARD-{}] Failed to invalidate {}: {}",
                            shard.index(),
                            store.name(),
                            e
                        );
                    }
                }
            }
            InvalidationStrategy::KeyTracking => {
                for store in self.registry.snapshot() {
                    match store.invalidate_tracked(shard).await {
                        Ok(count) => removed += count,
                        Err(e) => warn!(
                            "[SHARD-{}] Failed to invalidate {}: {}",
                            shard.index(),
                            store.name(),
                            e
                        ),
                    }
                }
            }
        }

        removed
    }
}

impl Default for Invalidation {
    fn default() -> Self {
        Self::new(InvalidationStrategy::default())
    }
}
