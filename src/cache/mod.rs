//! Distributed-cache adapter over memcached.
//!
//! - [`format`]: flags, sliding header, shard ids and expiration options
//! - [`key`]: key normalization to backend-safe keys
//! - [`compressor`]: adaptive gzip/zstd compression
//! - [`writer`]: value → stored item (+ shards)
//! - [`reader`]: stored item → value, with sliding renewal
//! - [`facade`]: the `Memcached` cache exposing get/set/refresh/remove

pub mod compressor;
pub mod facade;
pub mod format;
pub mod key;
pub mod reader;
pub mod writer;

mod fanout;

pub use compressor::{Compress, Compressor};
pub use facade::Memcached;
pub use format::{EntryOptions, ValueFlags};
pub use key::{HashingKeyTransform, KeyTransform};
