//! Benchmarks for the value encoding path.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use memcached_tiny::backend::memory::InMemoryBackend;
use memcached_tiny::cache::compressor::{Compress, Compressor};
use memcached_tiny::cache::format::MAX_ITEM_SIZE;
use memcached_tiny::cache::key::{HashingKeyTransform, KeyTransform};
use memcached_tiny::cache::writer::ValueWriter;
use memcached_tiny::cache::Memcached;
use memcached_tiny::clock::{Clock, SystemClock};
use memcached_tiny::config::{CompressionCodec, CompressionConfig, Config};

fn bench_compression(c: &mut Criterion) {
    // 256KB of mildly repetitive text.
    let data: Vec<u8> = (0..256 * 1024u32)
        .map(|i| b"the quick brown fox "[(i % 20) as usize] ^ (i / 4096) as u8)
        .collect();

    for codec in [CompressionCodec::Gzip, CompressionCodec::Zstd] {
        let compressor = Compressor::new(&CompressionConfig {
            codec,
            ..Default::default()
        });
        let framed = compressor.compress(&data).expect("compressible");

        c.bench_function(&format!("{codec:?}_compress_256kb"), |b| {
            b.iter(|| black_box(compressor.compress(black_box(&data))))
        });
        c.bench_function(&format!("{codec:?}_decompress_256kb"), |b| {
            b.iter(|| black_box(compressor.decompress(black_box(&framed))))
        });
    }
}

fn bench_key_transform(c: &mut Criterion) {
    let plain = "session:4f1c2a:profile";
    let long = "k".repeat(400);
    let unicode = "пользователь 42";

    c.bench_function("key_transform_plain", |b| {
        b.iter(|| black_box(HashingKeyTransform.transform(black_box(plain))))
    });
    c.bench_function("key_transform_long", |b| {
        b.iter(|| black_box(HashingKeyTransform.transform(black_box(&long))))
    });
    c.bench_function("key_transform_unicode", |b| {
        b.iter(|| black_box(HashingKeyTransform.transform(black_box(unicode))))
    });
}

fn bench_encode_sharded(c: &mut Criterion) {
    let data = vec![0xa5u8; MAX_ITEM_SIZE * 4];

    c.bench_function("encode_4mb_sharded", |b| {
        b.iter(|| {
            let encoded = ValueWriter::new(black_box(&data), None, None)
                .encode(SystemClock.now())
                .expect("encodable");
            black_box(encoded);
        })
    });
}

fn bench_roundtrip(c: &mut Criterion) {
    let mut config = Config::default();
    config.compression.enabled = false;
    let cache = Memcached::new(Arc::new(InMemoryBackend::new()), &config);
    let data = vec![0x3cu8; MAX_ITEM_SIZE * 2];

    c.bench_function("set_get_2mb_blocking", |b| {
        b.iter(|| {
            cache.set("bench", black_box(&data), None).expect("set");
            black_box(cache.get("bench").expect("get"));
        })
    });
}

criterion_group!(
    benches,
    bench_compression,
    bench_key_transform,
    bench_encode_sharded,
    bench_roundtrip,
);
criterion_main!(benches);
