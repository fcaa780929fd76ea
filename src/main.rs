//! Entry Cache demo
//!
//! Fetches widgets through the cache and prints them as JSON:
//!
//! ```text
//! entry_cache 1 2 3
//! ```
//!
//! Uses Redis when `REDIS_URL` is set, the in-memory store otherwise.

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use entry_cache::{
    spawn_sweeper, CacheConfig, CacheContext, CacheError, EntityDescriptor, MapSource, MemoryStore,
    RedisStore, StorageMode, StoreGateway, StoreRegistry,
};
use entry_cache::store::DEFAULT_POOL;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" for this crate, overridable with RUST_LOG
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "entry_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CacheConfig::from_env();
    info!(
        default_ttl = config.default_ttl,
        tombstone_ttl = config.tombstone_ttl,
        lock_tries = config.lock_tries,
        "configuration loaded"
    );

    let mut sweeper = None;
    let registry = match config.redis_url.clone() {
        // Connected on first use, once per pool
        Some(url) => StoreRegistry::with_factory(move |pool| {
            let url = url.clone();
            let pool = pool.to_string();
            async move {
                let redis = RedisStore::connect(&url).await?;
                info!(pool = %pool, url = %url, "using redis store");
                Ok::<_, CacheError>(Arc::new(redis) as Arc<dyn StoreGateway>)
            }
        }),
        None => {
            let memory = MemoryStore::new();
            sweeper = Some(spawn_sweeper(memory.clone(), config.sweep_interval));
            info!("using in-memory store");
            StoreRegistry::single(Arc::new(memory))
        }
    };
    registry
        .store(DEFAULT_POOL)
        .await
        .with_context(|| format!("initializing store pool '{}'", DEFAULT_POOL))?;

    let source = Arc::new(MapSource::new());
    source.insert("1", json!({"id": 1, "name": "sprocket", "status": "1", "sort": "10"}));
    source.insert("2", json!({"id": 2, "name": "flange", "status": "0", "sort": "20"}));
    source.insert(
        "3",
        json!({"id": 3, "name": "gizmo", "status": "1", "sort": "30", "deleted_at": "2020-01-01"}),
    );

    let widgets = EntityDescriptor::builder("widget", source.clone())
        .mode(StorageMode::FieldMap)
        .int_field("id")
        .build()?;

    let ctx = CacheContext::new(config, registry);

    let mut ids: Vec<String> = std::env::args().skip(1).collect();
    if ids.is_empty() {
        ids = vec!["1".to_string(), "2".to_string(), "404".to_string(), "3".to_string()];
    }

    // Second pass is served from the cache
    for pass in 1..=2 {
        let result = ctx.get_many(&widgets, ids.as_slice(), &[], Some("id")).await?;
        info!(pass, resolved = result.len(), requested = ids.len(), "batch fetched");
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    let stats = ctx.stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        source_loads = stats.source_loads,
        tombstone_hits = stats.tombstone_hits,
        hit_rate = stats.hit_rate(),
        "cache stats"
    );

    if let Some(handle) = sweeper {
        handle.abort();
        warn!("expiry sweeper aborted");
    }
    Ok(())
}
