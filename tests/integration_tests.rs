//! Integration tests for the async cache path: round trips, concurrency and
//! cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use memcached_tiny::backend::memory::InMemoryBackend;
use memcached_tiny::cache::format::{decode_shard_ids, MAX_ITEM_SIZE};
use memcached_tiny::cache::{EntryOptions, Memcached};
use memcached_tiny::clock::ManualClock;
use memcached_tiny::config::{CompressionCodec, Config};
use memcached_tiny::CacheError;

fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

fn cache_with(backend: InMemoryBackend) -> Memcached<InMemoryBackend> {
    Memcached::new(Arc::new(backend), &Config::default())
}

#[tokio::test]
async fn test_async_roundtrip_sizes() {
    let cache = cache_with(InMemoryBackend::new());
    let cancel = CancellationToken::new();
    let sizes = [
        0,
        1,
        MAX_ITEM_SIZE - 1,
        MAX_ITEM_SIZE,
        MAX_ITEM_SIZE + 1,
        9 * 1024 * 1024,
    ];

    for size in sizes {
        let key = format!("size:{size}");
        let value = noise(size, size as u64);
        cache.set_async(&key, &value, None, &cancel).await.unwrap();
        let read = cache.get_async(&key, &cancel).await.unwrap().unwrap();
        assert!(read == value, "mismatch for size {size}");
    }
}

#[tokio::test]
async fn test_blocking_and_async_paths_interoperate() {
    let cache = cache_with(InMemoryBackend::new());
    let cancel = CancellationToken::new();
    let value = noise(MAX_ITEM_SIZE * 3, 7);

    cache.set("written-blocking", &value, None).unwrap();
    let read = cache.get_async("written-blocking", &cancel).await.unwrap();
    assert!(read.unwrap() == value);

    cache
        .set_async("written-async", &value, None, &cancel)
        .await
        .unwrap();
    assert!(cache.get("written-async").unwrap().unwrap() == value);
}

#[tokio::test]
async fn test_zstd_codec_roundtrip() {
    let mut config = Config::default();
    config.compression.codec = CompressionCodec::Zstd;
    let cache = Memcached::new(Arc::new(InMemoryBackend::new()), &config);
    let cancel = CancellationToken::new();

    let value = b"memcached-tiny ".repeat(10_000);
    cache.set_async("z", &value, None, &cancel).await.unwrap();
    assert!(cache.client().peek("z").unwrap().value.len() < value.len() / 4);
    assert_eq!(cache.get_async("z", &cancel).await.unwrap().unwrap(), value);
}

#[tokio::test]
async fn test_codec_change_keeps_items_readable() {
    let backend = Arc::new(InMemoryBackend::new());
    let cancel = CancellationToken::new();
    let value = b"codec switch ".repeat(5_000);

    let with_codec = |codec| {
        let mut config = Config::default();
        config.compression.codec = codec;
        Memcached::new(backend.clone(), &config)
    };
    let gzip = with_codec(CompressionCodec::Gzip);
    let zstd = with_codec(CompressionCodec::Zstd);

    gzip.set_async("from-gzip", &value, None, &cancel).await.unwrap();
    zstd.set("from-zstd", &value, None).unwrap();
    assert_eq!(backend.peek("from-gzip").unwrap().flags, 2);
    assert_eq!(backend.peek("from-zstd").unwrap().flags, 2);

    assert_eq!(zstd.get_async("from-gzip", &cancel).await.unwrap().unwrap(), value);
    assert_eq!(zstd.get("from-gzip").unwrap().unwrap(), value);
    assert_eq!(gzip.get_async("from-zstd", &cancel).await.unwrap().unwrap(), value);
    assert_eq!(gzip.get("from-zstd").unwrap().unwrap(), value);
}

#[tokio::test]
async fn test_compression_disabled_still_reads_compressed() {
    let backend = Arc::new(InMemoryBackend::new());
    let cancel = CancellationToken::new();
    let value = vec![b'q'; 32 * 1024];

    let writer = Memcached::new(backend.clone(), &Config::default());
    writer.set_async("k", &value, None, &cancel).await.unwrap();
    assert_eq!(backend.peek("k").unwrap().flags, 2);

    let mut config = Config::default();
    config.compression.enabled = false;
    let reader = Memcached::new(backend, &config);
    assert_eq!(reader.get_async("k", &cancel).await.unwrap().unwrap(), value);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_keys() {
    let cache = Arc::new(cache_with(
        InMemoryBackend::new().with_latency(Duration::from_millis(1)),
    ));

    let mut handles = Vec::new();
    for i in 0..32u64 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let key = format!("task:{i}");
            let size = if i % 8 == 0 { MAX_ITEM_SIZE + 4096 } else { 512 * i as usize };
            let value = noise(size, i);
            let options = EntryOptions::sliding(Duration::from_secs(60));

            cache
                .set_async(&key, &value, Some(&options), &cancel)
                .await
                .unwrap();
            for _ in 0..3 {
                let read = cache.get_async(&key, &cancel).await.unwrap().unwrap();
                assert!(read == value, "mismatch for {key}");
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    cache.settle().await;
    assert_eq!(cache.pending_refreshes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_blocking_callers() {
    let cache = Arc::new(cache_with(InMemoryBackend::new()));

    let handles: Vec<_> = (0..8u64)
        .map(|i| {
            let cache = cache.clone();
            tokio::task::spawn_blocking(move || {
                let key = format!("blocking:{i}");
                let value = noise(MAX_ITEM_SIZE + 1000 * i as usize, i);
                cache.set(&key, &value, None).unwrap();
                assert!(cache.get(&key).unwrap().unwrap() == value);
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_cancelled_before_call() {
    let cache = cache_with(InMemoryBackend::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(matches!(
        cache.get_async("k", &cancel).await,
        Err(CacheError::Cancelled)
    ));
    assert!(matches!(
        cache.remove_async("k", &cancel).await,
        Err(CacheError::Cancelled)
    ));
    assert!(matches!(
        cache.refresh_async("k", &cancel).await,
        Err(CacheError::Cancelled)
    ));
    assert_eq!(cache.client().stats(), Default::default());
}

#[tokio::test]
async fn test_cancelled_while_in_flight() {
    let cache = cache_with(InMemoryBackend::new().with_latency(Duration::from_millis(500)));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let value = noise(MAX_ITEM_SIZE * 2, 3);
    let result = cache.set_async("k", &value, None, &cancel).await;
    assert!(matches!(result, Err(CacheError::Cancelled)));
    assert!(cache.client().peek("k").is_none());
}

#[tokio::test]
async fn test_evicted_shard_is_a_miss() {
    let cache = cache_with(InMemoryBackend::new());
    let cancel = CancellationToken::new();
    cache
        .set_async("big", &noise(MAX_ITEM_SIZE * 2 + 1, 11), None, &cancel)
        .await
        .unwrap();

    let item = cache.client().peek("big").unwrap();
    let ids = decode_shard_ids(&item.value).unwrap();
    assert_eq!(ids.len(), 3);
    cache.client().evict(&ids[0].key());

    assert!(cache.get_async("big", &cancel).await.unwrap().is_none());
}

#[tokio::test]
async fn test_async_sliding_refresh() {
    let clock = Arc::new(ManualClock::new());
    let backend = Arc::new(InMemoryBackend::with_clock(clock.clone()));
    let cache = Memcached::new(backend, &Config::default()).with_clock(clock.clone());
    let cancel = CancellationToken::new();
    let options = EntryOptions::sliding(Duration::from_secs(10));

    cache
        .set_async("s", b"value", Some(&options), &cancel)
        .await
        .unwrap();

    for _ in 0..5 {
        clock.advance(Duration::from_secs(8));
        cache.refresh_async("s", &cancel).await.unwrap();
    }
    assert!(cache.get_async("s", &cancel).await.unwrap().is_some());
    cache.settle().await;

    clock.advance(Duration::from_secs(20));
    assert!(cache.get_async("s", &cancel).await.unwrap().is_none());
}

#[tokio::test]
async fn test_async_remove() {
    let cache = cache_with(InMemoryBackend::new());
    let cancel = CancellationToken::new();
    cache.set_async("k", b"v", None, &cancel).await.unwrap();
    cache.remove_async("k", &cancel).await.unwrap();
    assert!(cache.get_async("k", &cancel).await.unwrap().is_none());
}
