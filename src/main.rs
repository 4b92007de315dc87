//! memcached-tiny: command-line tools for the distributed-cache adapter.
//!
//! Shows how keys are normalized and how values are laid out in memcached
//! items, and round-trips files through an in-memory backend.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use memcached_tiny::backend::memory::InMemoryBackend;
use memcached_tiny::cache::format::MAX_ITEM_SIZE;
use memcached_tiny::cache::writer::ValueWriter;
use memcached_tiny::cache::{Compress, Compressor, HashingKeyTransform, KeyTransform, Memcached};
use memcached_tiny::clock::{Clock, SystemClock};
use memcached_tiny::config::{Cli, Command, Config, ExpirationArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "memcached_tiny=debug"
    } else {
        "memcached_tiny=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("memcached-tiny v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    info!(
        compression = config.compression.enabled,
        codec = ?config.compression.codec,
        min_size = config.compression.min_size,
        max_item_size = config.storage.max_item_size,
        "Configuration loaded"
    );

    let report = match &cli.command {
        Command::Key { key } => key_report(key)?,
        Command::Inspect { file, expiration } => {
            let value = std::fs::read(file)
                .with_context(|| format!("reading {}", file.display()))?;
            inspect_report(&config, &value, expiration)?
        }
        Command::Roundtrip { file, expiration } => {
            let value = std::fs::read(file)
                .with_context(|| format!("reading {}", file.display()))?;
            roundtrip_report(&config, &value, expiration).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn key_report(key: &str) -> anyhow::Result<serde_json::Value> {
    let stored = HashingKeyTransform.transform(key)?;
    let changed = stored != key;
    Ok(json!({
        "key": key,
        "backend_key": stored,
        "changed": changed,
    }))
}

fn inspect_report(
    config: &Config,
    value: &[u8],
    expiration: &ExpirationArgs,
) -> anyhow::Result<serde_json::Value> {
    let compressor = Compressor::new(&config.compression);
    let options = expiration.to_options();
    let encoded = ValueWriter::new(
        value,
        options.as_ref(),
        config.compression.enabled.then_some(&compressor as &dyn Compress),
    )
    .with_max_item_size(config.storage.max_item_size)
    .encode(SystemClock.now())?;

    let shards: Vec<_> = encoded
        .shards
        .iter()
        .map(|shard| json!({ "key": shard.key, "size": shard.data.len() }))
        .collect();

    Ok(json!({
        "size": value.len(),
        "flags": encoded.flags.to_string(),
        "flag_bits": encoded.flags.bits(),
        "ttl_secs": encoded.ttl,
        "item_size": encoded.value.len(),
        "max_item_size": config.storage.max_item_size,
        "default_max_item_size": MAX_ITEM_SIZE,
        "shards": shards,
    }))
}

async fn roundtrip_report(
    config: &Config,
    value: &[u8],
    expiration: &ExpirationArgs,
) -> anyhow::Result<serde_json::Value> {
    let backend = Arc::new(InMemoryBackend::new());
    let cache = Memcached::new(backend.clone(), config);
    let cancel = CancellationToken::new();
    let options = expiration.to_options();
    let key = "memcached-tiny:roundtrip";

    let start = Instant::now();
    cache
        .set_async(key, value, options.as_ref(), &cancel)
        .await?;
    let write_us = start.elapsed().as_micros() as u64;

    let start = Instant::now();
    let read = cache
        .get_async(key, &cancel)
        .await?
        .context("value missing right after write")?;
    let read_us = start.elapsed().as_micros() as u64;
    cache.settle().await;

    if &read[..] != value {
        anyhow::bail!(
            "round-trip mismatch: wrote {} bytes, read {} bytes",
            value.len(),
            read.len()
        );
    }

    let stats = backend.stats();
    info!(size = value.len(), items = backend.len(), "Round-trip verified");
    Ok(json!({
        "size": value.len(),
        "items": backend.len(),
        "write_us": write_us,
        "read_us": read_us,
        "backend": {
            "gets": stats.gets,
            "get_and_touches": stats.get_and_touches,
            "sets": stats.sets,
        },
    }))
}
