//! Backend client contract.
//!
//! The adapter talks to memcached through these traits only. A network
//! client implements them; [`memory::InMemoryBackend`] implements them in
//! process with memcached's item semantics.
//!
//! - [`MemcachedClient`]: non-blocking operations, each taking a cancellation token
//! - [`BlockingMemcachedClient`]: the same operations, blocking the caller

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Longest key memcached accepts.
pub const MAX_KEY_LENGTH: usize = 250;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Key rejected by backend: {0:?}")]
    InvalidKey(String),

    #[error("Item of {size} bytes exceeds the backend limit of {max} bytes")]
    ItemTooLarge { size: usize, max: usize },

    #[error("Operation cancelled")]
    Cancelled,
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// One stored item as returned by a get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub flags: u32,
    pub value: Bytes,
}

impl Item {
    pub fn new(flags: u32, value: impl Into<Bytes>) -> Self {
        Self {
            flags,
            value: value.into(),
        }
    }
}

/// Non-blocking memcached operations.
///
/// Implementations must abandon the operation and return
/// [`BackendError::Cancelled`] once `cancel` fires.
#[async_trait]
pub trait MemcachedClient: Send + Sync {
    async fn get(&self, key: &str, cancel: &CancellationToken) -> BackendResult<Option<Item>>;

    /// Fetch an item and reset its TTL in one round trip.
    async fn get_and_touch(
        &self,
        key: &str,
        ttl: u32,
        cancel: &CancellationToken,
    ) -> BackendResult<Option<Item>>;

    async fn set(
        &self,
        key: &str,
        flags: u32,
        ttl: u32,
        value: Bytes,
        cancel: &CancellationToken,
    ) -> BackendResult<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str, cancel: &CancellationToken) -> BackendResult<bool>;

    /// Returns whether the key existed.
    async fn touch(&self, key: &str, ttl: u32, cancel: &CancellationToken) -> BackendResult<bool>;
}

/// Blocking memcached operations.
pub trait BlockingMemcachedClient: Send + Sync {
    fn get(&self, key: &str) -> BackendResult<Option<Item>>;

    fn get_and_touch(&self, key: &str, ttl: u32) -> BackendResult<Option<Item>>;

    fn set(&self, key: &str, flags: u32, ttl: u32, value: Bytes) -> BackendResult<()>;

    fn delete(&self, key: &str) -> BackendResult<bool>;

    fn touch(&self, key: &str, ttl: u32) -> BackendResult<bool>;
}

/// Whether `key` satisfies memcached's key rules.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LENGTH
        && key.bytes().all(|b| (0x21..=0x7e).contains(&b))
}
