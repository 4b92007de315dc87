//! Cache key normalization.
//!
//! memcached keys are at most 250 printable ASCII bytes. Keys that break
//! those rules are replaced by (or shortened with) their SHA-1 digest.

use sha1::{Digest, Sha1};

use crate::backend::MAX_KEY_LENGTH;
use crate::error::{CacheError, Result};

/// Prefix of keys replaced entirely by their digest.
pub const HASHED_KEY_PREFIX: &str = "HASHKEY-";

/// Characters of an oversized key kept in front of its digest.
const KEPT_PREFIX_LEN: usize = 40;

/// Maps caller keys onto backend-safe keys.
pub trait KeyTransform: Send + Sync {
    fn transform(&self, key: &str) -> Result<String>;
}

/// SHA-1 based key transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashingKeyTransform;

impl HashingKeyTransform {
    fn digest(key: &str) -> String {
        hex::encode_upper(Sha1::digest(key.as_bytes()))
    }
}

impl KeyTransform for HashingKeyTransform {
    fn transform(&self, key: &str) -> Result<String> {
        if key.trim().is_empty() {
            return Err(CacheError::InvalidArgument(
                "cache key must not be empty or whitespace".to_string(),
            ));
        }

        if key.bytes().any(|b| !(0x21..=0x7e).contains(&b)) {
            return Ok(format!("{HASHED_KEY_PREFIX}{}", Self::digest(key)));
        }

        if key.len() > MAX_KEY_LENGTH {
            // All bytes are ASCII here, so slicing on a byte index is safe.
            return Ok(format!("{}{}", &key[..KEPT_PREFIX_LEN], Self::digest(key)));
        }

        Ok(key.to_string())
    }
}
