//! Value writer: turns a logical value and its expiration options into the
//! item stored under the caller's key, plus shard items for oversized values.

use bytes::{BufMut, Bytes, BytesMut};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{BackendResult, BlockingMemcachedClient, MemcachedClient};
use crate::cache::compressor::Compress;
use crate::cache::fanout::scatter;
use crate::cache::format::{
    extend_window, EntryOptions, ExpirationPolicy, ShardId, SlidingHeader, ValueFlags,
    MAX_EXPIRATION, MAX_ITEM_SIZE, SHARD_ID_LEN, SLIDING_HEADER_LEN,
};
use crate::clock::Ticks;
use crate::error::{CacheError, Result};

/// Smallest usable item ceiling: a sliding header plus one shard id.
pub const MIN_ITEM_SIZE: usize = SLIDING_HEADER_LEN + SHARD_ID_LEN;

/// One chunk of an oversized payload.
#[derive(Debug, Clone)]
pub struct Shard {
    pub id: ShardId,
    pub key: String,
    pub data: Bytes,
}

/// Everything needed to store a value.
#[derive(Debug, Clone)]
pub struct EncodedValue {
    pub flags: ValueFlags,
    /// Backend TTL in seconds, shared by the main item and its shards.
    pub ttl: u32,
    /// Bytes stored under the caller's key.
    pub value: Bytes,
    /// Chunks to store under their own keys, in payload order.
    pub shards: Vec<Shard>,
}

/// Per-call encoder.
pub struct ValueWriter<'a> {
    value: &'a [u8],
    policy: ExpirationPolicy,
    compressor: Option<&'a dyn Compress>,
    max_item_size: usize,
}

impl<'a> ValueWriter<'a> {
    pub fn new(
        value: &'a [u8],
        options: Option<&EntryOptions>,
        compressor: Option<&'a dyn Compress>,
    ) -> Self {
        Self {
            value,
            policy: ExpirationPolicy::from(options),
            compressor,
            max_item_size: MAX_ITEM_SIZE,
        }
    }

    pub fn with_max_item_size(mut self, max_item_size: usize) -> Self {
        self.max_item_size = max_item_size.max(MIN_ITEM_SIZE);
        self
    }

    /// Resolve the policy into an optional sliding header and a TTL.
    fn expiration(&self, now: Ticks) -> Result<(Option<SlidingHeader>, u32)> {
        let ceiling = now + MAX_EXPIRATION;

        let (header, expiration) = match self.policy {
            ExpirationPolicy::None => (None, ceiling),
            ExpirationPolicy::Sliding(window) => {
                let duration = window.max(Ticks::ONE_SECOND);
                let expiration = (now + duration + extend_window(duration)).min(ceiling);
                (
                    Some(SlidingHeader {
                        duration,
                        expiration,
                    }),
                    expiration,
                )
            }
            ExpirationPolicy::Absolute(at) => (None, at.min(ceiling)),
            ExpirationPolicy::Relative(after) => (None, (now + after).min(ceiling)),
        };

        if expiration <= now {
            return Err(CacheError::InvalidArgument(
                "expiration must lie in the future".to_string(),
            ));
        }

        // Bounded by MAX_EXPIRATION, so it fits in u32.
        let ttl = (expiration - now).ceil_secs() as u32;
        Ok((header, ttl))
    }

    /// Encode without touching the backend.
    pub fn encode(&self, now: Ticks) -> Result<EncodedValue> {
        let (header, ttl) = self.expiration(now)?;

        let mut flags = ValueFlags::ORIGINAL;
        if header.is_some() {
            flags |= ValueFlags::SLIDING;
        }

        let payload = match self.compressor.and_then(|c| c.compress(self.value)) {
            Some(compressed) => {
                flags |= ValueFlags::COMPRESS;
                Bytes::from(compressed)
            }
            None => Bytes::copy_from_slice(self.value),
        };

        let header_len = if header.is_some() { SLIDING_HEADER_LEN } else { 0 };
        let (payload, shards) = if header_len + payload.len() > self.max_item_size {
            flags |= ValueFlags::SPLIT;
            self.split(payload)
        } else {
            (payload, Vec::new())
        };

        let value = match header {
            Some(header) => {
                let mut buf = BytesMut::with_capacity(SLIDING_HEADER_LEN + payload.len());
                buf.put_slice(&header.encode());
                buf.put_slice(&payload);
                buf.freeze()
            }
            None => payload,
        };

        debug!(
            %flags,
            ttl,
            original = self.value.len(),
            stored = value.len(),
            shards = shards.len(),
            "Encoded value"
        );

        Ok(EncodedValue {
            flags,
            ttl,
            value,
            shards,
        })
    }

    /// Cut the payload into item-sized chunks; returns the id list and the chunks.
    fn split(&self, payload: Bytes) -> (Bytes, Vec<Shard>) {
        let shards: Vec<Shard> = (0..payload.len())
            .step_by(self.max_item_size)
            .map(|start| {
                let end = (start + self.max_item_size).min(payload.len());
                let id = ShardId::new_random();
                Shard {
                    id,
                    key: id.key(),
                    data: payload.slice(start..end),
                }
            })
            .collect();

        let mut list = BytesMut::with_capacity(shards.len() * SHARD_ID_LEN);
        for shard in &shards {
            list.put_slice(&shard.id.to_bytes());
        }
        (list.freeze(), shards)
    }

    /// Encode and store the shard items, blocking. The caller stores the
    /// main item afterwards.
    pub fn prepare<C>(&self, client: &C, now: Ticks) -> Result<EncodedValue>
    where
        C: BlockingMemcachedClient + ?Sized,
    {
        let encoded = self.encode(now)?;
        let ttl = encoded.ttl;
        let results = scatter(&encoded.shards, |shard| {
            client.set(&shard.key, 0, ttl, shard.data.clone())
        });
        results.into_iter().collect::<BackendResult<Vec<()>>>()?;
        Ok(encoded)
    }

    /// Encode and store the shard items concurrently. The caller stores the
    /// main item afterwards.
    pub async fn prepare_async<C>(
        &self,
        client: &C,
        now: Ticks,
        cancel: &CancellationToken,
    ) -> Result<EncodedValue>
    where
        C: MemcachedClient + ?Sized,
    {
        let encoded = self.encode(now)?;
        let ttl = encoded.ttl;
        let results = join_all(
            encoded
                .shards
                .iter()
                .map(|shard| client.set(&shard.key, 0, ttl, shard.data.clone(), cancel)),
        )
        .await;
        results.into_iter().collect::<BackendResult<Vec<()>>>()?;
        Ok(encoded)
    }
}
