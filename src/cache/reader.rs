//! Value reader: reconstructs the logical value from a stored item.
//!
//! Sliding items are renewed lazily. A read that lands inside the renewal
//! window rewrites the main item with a later expiration and touches the
//! shards while fetching them. Sharded values are all-or-nothing: one missing
//! shard turns the read into a miss.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::backend::{BackendError, BackendResult, BlockingMemcachedClient, Item, MemcachedClient};
use crate::cache::compressor::Compress;
use crate::cache::fanout::scatter;
use crate::cache::format::{
    decode_shard_ids, extend_window, ShardId, SlidingHeader, ValueFlags, MAX_EXPIRATION,
    SLIDING_HEADER_LEN,
};
use crate::clock::Ticks;
use crate::error::{CacheError, Result};

/// What a read at a given instant does to a sliding item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renewal {
    /// The window has elapsed; the item is a logical miss.
    Expired,
    /// Still far from expiring, or not sliding at all.
    Current,
    /// Rewrite the main item with `expiration` and reset TTLs to `ttl` seconds.
    Extend { ttl: u32, expiration: Ticks },
}

/// Per-call decoder over one fetched main item.
pub struct ValueReader<'a> {
    key: &'a str,
    item: Item,
    flags: ValueFlags,
    header: Option<SlidingHeader>,
    compressor: &'a dyn Compress,
}

impl<'a> ValueReader<'a> {
    /// Validate the flags and the sliding header of a fetched item.
    pub fn new(key: &'a str, item: Item, compressor: &'a dyn Compress) -> Result<Self> {
        let flags = ValueFlags::from_bits(item.flags)?;
        let header = if flags.contains(ValueFlags::SLIDING) {
            Some(SlidingHeader::decode(&item.value)?)
        } else {
            None
        };
        Ok(Self {
            key,
            item,
            flags,
            header,
            compressor,
        })
    }

    pub fn flags(&self) -> ValueFlags {
        self.flags
    }

    pub fn header(&self) -> Option<SlidingHeader> {
        self.header
    }

    /// Decide whether a read at `now` renews the item.
    pub fn renewal(&self, now: Ticks) -> Renewal {
        let Some(header) = self.header else {
            return Renewal::Current;
        };

        let extend = extend_window(header.duration);
        if header.expiration < now + extend {
            return Renewal::Expired;
        }

        let duration = header.duration.min(MAX_EXPIRATION - extend);
        if header.expiration - now - extend > duration {
            return Renewal::Current;
        }

        let span = duration + extend;
        Renewal::Extend {
            // span is below MAX_EXPIRATION
            ttl: span.ceil_secs().max(1) as u32,
            expiration: now + span,
        }
    }

    /// Stored bytes after the sliding header.
    fn body(&self) -> Bytes {
        if self.header.is_some() {
            self.item.value.slice(SLIDING_HEADER_LEN..)
        } else {
            self.item.value.clone()
        }
    }

    /// Shard ids of a split item; empty otherwise.
    pub fn shard_ids(&self) -> Result<Vec<ShardId>> {
        if !self.flags.contains(ValueFlags::SPLIT) {
            return Ok(Vec::new());
        }
        Ok(decode_shard_ids(&self.body())?)
    }

    fn shard_keys(&self) -> Result<Vec<String>> {
        Ok(self.shard_ids()?.iter().map(ShardId::key).collect())
    }

    fn rewritten(&self, expiration: Ticks) -> Bytes {
        SlidingHeader::rewrite_expiration(&self.item.value, expiration)
    }

    /// Concatenate fetched shards in order. A missing or failed shard makes
    /// the whole value a miss; cancellation is reported as such.
    fn assemble(&self, fetched: Vec<BackendResult<Option<Item>>>) -> Result<Option<Bytes>> {
        if fetched
            .iter()
            .any(|r| matches!(r, Err(BackendError::Cancelled)))
        {
            return Err(CacheError::Cancelled);
        }

        let mut parts = Vec::with_capacity(fetched.len());
        for (index, result) in fetched.into_iter().enumerate() {
            match result {
                Ok(Some(item)) => parts.push(item.value),
                Ok(None) => {
                    debug!(key = self.key, index, "Shard missing, treating value as absent");
                    return Ok(None);
                }
                Err(e) => {
                    warn!(key = self.key, index, error = %e, "Shard fetch failed, treating value as absent");
                    return Ok(None);
                }
            }
        }

        let total = parts.iter().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(total);
        for part in parts {
            buf.put_slice(&part);
        }
        Ok(Some(buf.freeze()))
    }

    fn decode(&self, payload: Bytes) -> Result<Bytes> {
        if self.flags.contains(ValueFlags::COMPRESS) {
            Ok(Bytes::from(self.compressor.decompress(&payload)?))
        } else {
            Ok(payload)
        }
    }

    /// Shard TTL to apply while fetching, or `None` when the value is a miss.
    fn renew_or_miss(&self, now: Ticks) -> Option<Renewal> {
        match self.renewal(now) {
            Renewal::Expired => {
                debug!(key = self.key, "Sliding window elapsed");
                None
            }
            renewal => Some(renewal),
        }
    }

    /// Reconstruct the value, blocking. The renewal rewrite is issued inline
    /// and its failure only logged.
    pub fn read<C>(&self, client: &C, now: Ticks) -> Result<Option<Bytes>>
    where
        C: BlockingMemcachedClient + ?Sized,
    {
        if self.flags.is_original() {
            return Ok(Some(self.item.value.clone()));
        }

        let Some(renewal) = self.renew_or_miss(now) else {
            return Ok(None);
        };
        let touch = match renewal {
            Renewal::Extend { ttl, expiration } => {
                if let Err(e) = client.set(self.key, self.flags.bits(), ttl, self.rewritten(expiration)) {
                    warn!(key = self.key, error = %e, "Sliding refresh failed");
                }
                Some(ttl)
            }
            _ => None,
        };

        let payload = if self.flags.contains(ValueFlags::SPLIT) {
            let keys = self.shard_keys()?;
            let fetched = scatter(&keys, |key| match touch {
                Some(ttl) => client.get_and_touch(key, ttl),
                None => client.get(key),
            });
            match self.assemble(fetched)? {
                Some(payload) => payload,
                None => return Ok(None),
            }
        } else {
            self.body()
        };

        self.decode(payload).map(Some)
    }

    /// Reconstruct the value. The renewal rewrite is detached onto `tracker`
    /// and does not delay the read.
    pub async fn read_async<C>(
        &self,
        client: &Arc<C>,
        now: Ticks,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<Option<Bytes>>
    where
        C: MemcachedClient + ?Sized + 'static,
    {
        if self.flags.is_original() {
            return Ok(Some(self.item.value.clone()));
        }

        let Some(renewal) = self.renew_or_miss(now) else {
            return Ok(None);
        };
        let touch = match renewal {
            Renewal::Extend { ttl, expiration } => {
                let client = Arc::clone(client);
                let key = self.key.to_string();
                let flags = self.flags.bits();
                let value = self.rewritten(expiration);
                let cancel = cancel.clone();
                tracker.spawn(async move {
                    match client.set(&key, flags, ttl, value, &cancel).await {
                        Ok(()) => {}
                        Err(BackendError::Cancelled) => {
                            debug!(key = %key, "Sliding refresh cancelled");
                        }
                        Err(e) => warn!(key = %key, error = %e, "Sliding refresh failed"),
                    }
                });
                Some(ttl)
            }
            _ => None,
        };

        let payload = if self.flags.contains(ValueFlags::SPLIT) {
            let keys = self.shard_keys()?;
            let fetched = join_all(keys.iter().map(|key| async move {
                match touch {
                    Some(ttl) => client.get_and_touch(key, ttl, cancel).await,
                    None => client.get(key, cancel).await,
                }
            }))
            .await;
            match self.assemble(fetched)? {
                Some(payload) => payload,
                None => return Ok(None),
            }
        } else {
            self.body()
        };

        self.decode(payload).map(Some)
    }

    /// Renew a sliding item without reading it: rewrite the main item, then
    /// touch every shard. No-op unless the item is due for renewal.
    pub fn refresh<C>(&self, client: &C, now: Ticks) -> Result<()>
    where
        C: BlockingMemcachedClient + ?Sized,
    {
        let Renewal::Extend { ttl, expiration } = self.renewal(now) else {
            return Ok(());
        };

        client.set(self.key, self.flags.bits(), ttl, self.rewritten(expiration))?;
        let keys = self.shard_keys()?;
        scatter(&keys, |key| client.touch(key, ttl))
            .into_iter()
            .collect::<BackendResult<Vec<bool>>>()?;

        debug!(key = self.key, ttl, shards = keys.len(), "Refreshed sliding item");
        Ok(())
    }

    pub async fn refresh_async<C>(
        &self,
        client: &C,
        now: Ticks,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        C: MemcachedClient + ?Sized,
    {
        let Renewal::Extend { ttl, expiration } = self.renewal(now) else {
            return Ok(());
        };

        client
            .set(self.key, self.flags.bits(), ttl, self.rewritten(expiration), cancel)
            .await?;
        let keys = self.shard_keys()?;
        join_all(keys.iter().map(|key| client.touch(key, ttl, cancel)))
            .await
            .into_iter()
            .collect::<BackendResult<Vec<bool>>>()?;

        debug!(key = self.key, ttl, shards = keys.len(), "Refreshed sliding item");
        Ok(())
    }
}
