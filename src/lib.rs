//! memcached-tiny: a distributed-cache adapter for memcached.
//!
//! Maps get/set/refresh/remove with absolute, relative or sliding expiration
//! onto memcached's item model. Adds what memcached lacks: sliding expiration
//! renewed on read, adaptive compression and sharding of values larger than
//! the item size ceiling.

pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;

pub use backend::{BlockingMemcachedClient, MemcachedClient};
pub use cache::{EntryOptions, Memcached};
pub use error::{CacheError, Result};
