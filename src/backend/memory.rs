//! In-process backend with memcached item semantics.
//!
//! Items expire by TTL against an injectable [`Clock`], keys follow the
//! memcached key rules and values above the item ceiling are rejected. Used
//! by the CLI, the tests and the benches; also handy as a local stand-in for
//! a real cluster.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{
    is_valid_key, BackendError, BackendResult, BlockingMemcachedClient, Item, MemcachedClient,
};
use crate::clock::{Clock, SystemClock, Ticks};

/// memcached's default `-I` item size.
pub const DEFAULT_MAX_ITEM_SIZE: usize = 1024 * 1024;

/// TTLs above this many seconds are absolute Unix timestamps.
const RELATIVE_TTL_LIMIT: u32 = 60 * 60 * 24 * 30;

#[derive(Debug, Clone)]
struct StoredItem {
    flags: u32,
    value: Bytes,
    /// None = never expires.
    expires_at: Option<Ticks>,
}

impl StoredItem {
    fn is_expired(&self, now: Ticks) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Operation counters.
#[derive(Debug, Default)]
struct Counters {
    gets: AtomicU64,
    get_and_touches: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    touches: AtomicU64,
}

/// Snapshot of the operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub gets: u64,
    pub get_and_touches: u64,
    pub sets: u64,
    pub deletes: u64,
    pub touches: u64,
}

/// The in-memory backend.
#[derive(Debug)]
pub struct InMemoryBackend {
    items: DashMap<String, StoredItem>,
    clock: Arc<dyn Clock>,
    max_item_size: usize,
    latency: Option<Duration>,
    offline: AtomicBool,
    counters: Counters,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            items: DashMap::new(),
            clock,
            max_item_size: DEFAULT_MAX_ITEM_SIZE,
            latency: None,
            offline: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn with_max_item_size(mut self, max_item_size: usize) -> Self {
        self.max_item_size = max_item_size;
        self
    }

    /// Delay every operation, to make concurrency and cancellation observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// While offline every operation fails with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Drop an item as if the backend had evicted it.
    pub fn evict(&self, key: &str) -> bool {
        self.items.remove(key).is_some()
    }

    /// Read an item without counting the access or touching it.
    pub fn peek(&self, key: &str) -> Option<Item> {
        let now = self.clock.now();
        self.items
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| Item::new(entry.flags, entry.value.clone()))
    }

    /// Remaining lifetime of a live item; `Some(None)` when it never expires.
    pub fn ttl_remaining(&self, key: &str) -> Option<Option<Duration>> {
        let now = self.clock.now();
        let entry = self.items.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        Some(entry.expires_at.map(|at| {
            let ticks = (at - now).as_i64().max(0) as u64;
            Duration::from_nanos(ticks.saturating_mul(100))
        }))
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.items.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            gets: self.counters.gets.load(Ordering::Relaxed),
            get_and_touches: self.counters.get_and_touches.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            touches: self.counters.touches.load(Ordering::Relaxed),
        }
    }

    fn expiry(&self, ttl: u32, now: Ticks) -> Option<Ticks> {
        match ttl {
            0 => None,
            t if t <= RELATIVE_TTL_LIMIT => Some(now + Ticks::from_secs(i64::from(t))),
            t => Some(Ticks::UNIX_EPOCH + Ticks::from_secs(i64::from(t))),
        }
    }

    fn check(&self, key: &str) -> BackendResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Connection("backend offline".to_string()));
        }
        if !is_valid_key(key) {
            return Err(BackendError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn load(&self, key: &str, touch: Option<u32>) -> BackendResult<Option<Item>> {
        self.check(key)?;
        let now = self.clock.now();
        let mut expired = false;

        let item = match self.items.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                if let Some(ttl) = touch {
                    entry.expires_at = self.expiry(ttl, now);
                }
                Some(Item::new(entry.flags, entry.value.clone()))
            }
            Some(_) => {
                expired = true;
                None
            }
            None => None,
        };

        if expired {
            self.items.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(item)
    }

    fn store(&self, key: &str, flags: u32, ttl: u32, value: Bytes) -> BackendResult<()> {
        self.check(key)?;
        if value.len() > self.max_item_size {
            return Err(BackendError::ItemTooLarge {
                size: value.len(),
                max: self.max_item_size,
            });
        }

        let now = self.clock.now();
        debug!(key, flags, ttl, size = value.len(), "Stored item");
        self.items.insert(
            key.to_string(),
            StoredItem {
                flags,
                value,
                expires_at: self.expiry(ttl, now),
            },
        );
        Ok(())
    }

    fn remove(&self, key: &str) -> BackendResult<bool> {
        self.check(key)?;
        let now = self.clock.now();
        Ok(self
            .items
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    fn renew(&self, key: &str, ttl: u32) -> BackendResult<bool> {
        self.check(key)?;
        let now = self.clock.now();
        match self.items.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = self.expiry(ttl, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delay(&self, cancel: &CancellationToken) -> BackendResult<()> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        if let Some(latency) = self.latency {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        }
        Ok(())
    }

    fn delay_blocking(&self) {
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemcachedClient for InMemoryBackend {
    async fn get(&self, key: &str, cancel: &CancellationToken) -> BackendResult<Option<Item>> {
        self.delay(cancel).await?;
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        self.load(key, None)
    }

    async fn get_and_touch(
        &self,
        key: &str,
        ttl: u32,
        cancel: &CancellationToken,
    ) -> BackendResult<Option<Item>> {
        self.delay(cancel).await?;
        self.counters.get_and_touches.fetch_add(1, Ordering::Relaxed);
        self.load(key, Some(ttl))
    }

    async fn set(
        &self,
        key: &str,
        flags: u32,
        ttl: u32,
        value: Bytes,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        self.delay(cancel).await?;
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        self.store(key, flags, ttl, value)
    }

    async fn delete(&self, key: &str, cancel: &CancellationToken) -> BackendResult<bool> {
        self.delay(cancel).await?;
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.remove(key)
    }

    async fn touch(&self, key: &str, ttl: u32, cancel: &CancellationToken) -> BackendResult<bool> {
        self.delay(cancel).await?;
        self.counters.touches.fetch_add(1, Ordering::Relaxed);
        self.renew(key, ttl)
    }
}

impl BlockingMemcachedClient for InMemoryBackend {
    fn get(&self, key: &str) -> BackendResult<Option<Item>> {
        self.delay_blocking();
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        self.load(key, None)
    }

    fn get_and_touch(&self, key: &str, ttl: u32) -> BackendResult<Option<Item>> {
        self.delay_blocking();
        self.counters.get_and_touches.fetch_add(1, Ordering::Relaxed);
        self.load(key, Some(ttl))
    }

    fn set(&self, key: &str, flags: u32, ttl: u32, value: Bytes) -> BackendResult<()> {
        self.delay_blocking();
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        self.store(key, flags, ttl, value)
    }

    fn delete(&self, key: &str) -> BackendResult<bool> {
        self.delay_blocking();
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.remove(key)
    }

    fn touch(&self, key: &str, ttl: u32) -> BackendResult<bool> {
        self.delay_blocking();
        self.counters.touches.fetch_add(1, Ordering::Relaxed);
        self.renew(key, ttl)
    }
}
