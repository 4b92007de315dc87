//! Distributed-cache facade over a memcached client.
//!
//! Every operation normalizes the key, then hands the item to a per-call
//! [`ValueWriter`] or [`ValueReader`]. Blocking methods require a
//! [`BlockingMemcachedClient`]; the `_async` methods require a
//! [`MemcachedClient`] and take a cancellation token.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::backend::{BlockingMemcachedClient, MemcachedClient};
use crate::cache::compressor::{Compress, Compressor};
use crate::cache::format::EntryOptions;
use crate::cache::key::{HashingKeyTransform, KeyTransform};
use crate::cache::reader::ValueReader;
use crate::cache::writer::ValueWriter;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{CacheError, Result};

/// memcached-backed distributed cache.
pub struct Memcached<C: ?Sized> {
    client: Arc<C>,
    keys: Arc<dyn KeyTransform>,
    compressor: Arc<dyn Compress>,
    /// Compress on write. Reads always decompress flagged items.
    compress_values: bool,
    clock: Arc<dyn Clock>,
    max_item_size: usize,
    /// Detached renewal writes issued by `get_async`.
    refreshes: TaskTracker,
}

impl<C: ?Sized> Memcached<C> {
    pub fn new(client: Arc<C>, config: &Config) -> Self {
        Self {
            client,
            keys: Arc::new(HashingKeyTransform),
            compressor: Arc::new(Compressor::new(&config.compression)),
            compress_values: config.compression.enabled,
            clock: Arc::new(SystemClock),
            max_item_size: config.storage.max_item_size,
            refreshes: TaskTracker::new(),
        }
    }

    pub fn with_key_transform(mut self, keys: Arc<dyn KeyTransform>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn Compress>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Number of detached renewal writes still running.
    pub fn pending_refreshes(&self) -> usize {
        self.refreshes.len()
    }

    /// Wait for every detached renewal write issued so far.
    pub async fn settle(&self) {
        self.refreshes.close();
        self.refreshes.wait().await;
        self.refreshes.reopen();
    }

    fn writer<'a>(&'a self, value: &'a [u8], options: Option<&EntryOptions>) -> ValueWriter<'a> {
        let compressor = self.compress_values.then_some(self.compressor.as_ref());
        ValueWriter::new(value, options, compressor).with_max_item_size(self.max_item_size)
    }
}

// ─── Blocking ──────────────────────────────────────────────────────────────

impl<C: BlockingMemcachedClient + ?Sized> Memcached<C> {
    /// Fetch a value. Absent, expired and partially evicted values are `None`.
    pub fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let key = self.keys.transform(key)?;
        let Some(item) = self.client.get(&key)? else {
            debug!(key = %key, "Cache miss");
            return Ok(None);
        };
        ValueReader::new(&key, item, self.compressor.as_ref())?
            .read(self.client.as_ref(), self.clock.now())
    }

    /// Store a value. Shards are written first; the main item is written
    /// only once all of them succeeded.
    pub fn set(&self, key: &str, value: &[u8], options: Option<&EntryOptions>) -> Result<()> {
        let key = self.keys.transform(key)?;
        let encoded = self
            .writer(value, options)
            .prepare(self.client.as_ref(), self.clock.now())?;
        self.client
            .set(&key, encoded.flags.bits(), encoded.ttl, encoded.value)?;
        debug!(key = %key, flags = %encoded.flags, ttl = encoded.ttl, "Stored value");
        Ok(())
    }

    /// Renew a sliding value without reading it.
    pub fn refresh(&self, key: &str) -> Result<()> {
        let key = self.keys.transform(key)?;
        let Some(item) = self.client.get(&key)? else {
            return Ok(());
        };
        ValueReader::new(&key, item, self.compressor.as_ref())?
            .refresh(self.client.as_ref(), self.clock.now())
    }

    /// Delete the main item. Shards expire on their own.
    pub fn remove(&self, key: &str) -> Result<()> {
        let key = self.keys.transform(key)?;
        let existed = self.client.delete(&key)?;
        debug!(key = %key, existed, "Removed value");
        Ok(())
    }
}

// ─── Async ─────────────────────────────────────────────────────────────────

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(CacheError::Cancelled);
    }
    Ok(())
}

impl<C: MemcachedClient + ?Sized + 'static> Memcached<C> {
    /// Read `key`, renewing a sliding value that is due.
    ///
    /// The renewal rewrite of the main item is detached and may complete after
    /// this call returns. A later write to the same key can then be replaced
    /// by the renewed old value, so call [`Memcached::settle`] before writing
    /// a key that was just read.
    pub async fn get_async(&self, key: &str, cancel: &CancellationToken) -> Result<Option<Bytes>> {
        check_cancelled(cancel)?;
        let key = self.keys.transform(key)?;
        let Some(item) = self.client.get(&key, cancel).await? else {
            debug!(key = %key, "Cache miss");
            return Ok(None);
        };
        ValueReader::new(&key, item, self.compressor.as_ref())?
            .read_async(&self.client, self.clock.now(), cancel, &self.refreshes)
            .await
    }

    pub async fn set_async(
        &self,
        key: &str,
        value: &[u8],
        options: Option<&EntryOptions>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        check_cancelled(cancel)?;
        let key = self.keys.transform(key)?;
        let encoded = self
            .writer(value, options)
            .prepare_async(self.client.as_ref(), self.clock.now(), cancel)
            .await?;
        self.client
            .set(&key, encoded.flags.bits(), encoded.ttl, encoded.value, cancel)
            .await?;
        debug!(key = %key, flags = %encoded.flags, ttl = encoded.ttl, "Stored value");
        Ok(())
    }

    pub async fn refresh_async(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let key = self.keys.transform(key)?;
        let Some(item) = self.client.get(&key, cancel).await? else {
            return Ok(());
        };
        ValueReader::new(&key, item, self.compressor.as_ref())?
            .refresh_async(self.client.as_ref(), self.clock.now(), cancel)
            .await
    }

    pub async fn remove_async(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let key = self.keys.transform(key)?;
        let existed = self.client.delete(&key, cancel).await?;
        debug!(key = %key, existed, "Removed value");
        Ok(())
    }
}
