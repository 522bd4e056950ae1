//! Three-tier cache behavior against a real database L2.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use vanopticon_mimir::db::SqlParam;
use vanopticon_mimir::enrich::fs_tier::{FsCacheTier, FsTierConfig};
use vanopticon_mimir::enrich::{HybridCache, HybridCacheConfig};

use common::sqlite_store;

fn cache_config(dir: &std::path::Path) -> HybridCacheConfig {
	HybridCacheConfig {
		fs: FsTierConfig {
			root: dir.join("fscache"),
			ttl: Duration::from_secs(3600),
		},
		..HybridCacheConfig::default()
	}
}

#[tokio::test]
async fn write_through_reaches_all_tiers_and_l2_survives_restart() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;
	let cache = HybridCache::new(cache_config(dir.path()), Some(store.clone()));

	cache
		.store_cached("dshield", "1.2.3.4", &json!({"attacks": 7}))
		.await;

	// L2 row exists with a TTL.
	let row = store
		.fetch_optional(
			"SELECT cache_value, expires_at FROM enrichment_cache WHERE service = $1 AND cache_key = $2",
			&[SqlParam::Text("dshield".to_string()), SqlParam::Text("1.2.3.4".to_string())],
		)
		.await
		.unwrap()
		.expect("l2 row");
	assert_eq!(row.json("cache_value").unwrap()["attacks"], 7);
	assert!(row.timestamp("expires_at").unwrap() > Utc::now());

	// A fresh cache instance (empty L1) still hits via L2.
	let rebuilt = HybridCache::new(cache_config(dir.path()), Some(store.clone()));
	assert_eq!(
		rebuilt.get_cached("dshield", "1.2.3.4").await,
		Some(json!({"attacks": 7}))
	);
	assert_eq!(rebuilt.stats.l2_database.hits(), 1);
}

#[tokio::test]
async fn expired_l2_rows_are_deleted_on_access() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;
	let cache = HybridCache::new(
		HybridCacheConfig {
			enable_memory: false,
			enable_filesystem: false,
			..cache_config(dir.path())
		},
		Some(store.clone()),
	);

	// Insert an already-expired row directly.
	let past = Utc::now() - chrono::Duration::days(2);
	store
		.execute(
			"INSERT INTO enrichment_cache (service, cache_key, cache_value, created_at, expires_at)
			 VALUES ($1, $2, $3, $4, $5)",
			&[
				SqlParam::Text("dshield".to_string()),
				SqlParam::Text("9.9.9.9".to_string()),
				SqlParam::Text("{\"attacks\":1}".to_string()),
				SqlParam::Timestamp(past),
				SqlParam::Timestamp(past),
			],
		)
		.await
		.unwrap();

	assert_eq!(cache.get_cached("dshield", "9.9.9.9").await, None);
	let remaining = store
		.fetch_optional("SELECT COUNT(*) AS n FROM enrichment_cache", &[])
		.await
		.unwrap()
		.unwrap();
	assert_eq!(remaining.i64("n").unwrap(), 0);
}

#[tokio::test]
async fn l3_hit_backfills_l2_and_l1() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;
	let config = cache_config(dir.path());

	// Pre-populate the filesystem tier out of band.
	FsCacheTier::new(config.fs.clone())
		.store("dshield", "1.2.3.4", &json!({"attacks": 3, "ascountry": "NL"}))
		.unwrap();

	let cache = HybridCache::new(config, Some(store.clone()));
	let value = cache.get_cached("dshield", "1.2.3.4").await;
	assert_eq!(value, Some(json!({"attacks": 3, "ascountry": "NL"})));
	assert_eq!(cache.stats.l3_filesystem.hits(), 1);

	// Backfilled into L2...
	let row = store
		.fetch_optional(
			"SELECT cache_value FROM enrichment_cache WHERE service = $1 AND cache_key = $2",
			&[SqlParam::Text("dshield".to_string()), SqlParam::Text("1.2.3.4".to_string())],
		)
		.await
		.unwrap();
	assert!(row.is_some());

	// ...and into L1: the next read never reaches L2 or L3.
	let again = cache.get_cached("dshield", "1.2.3.4").await;
	assert_eq!(again, Some(json!({"attacks": 3, "ascountry": "NL"})));
	assert_eq!(cache.stats.l1_memory.hits(), 1);
	assert_eq!(cache.stats.l3_filesystem.hits(), 1);
	assert!(cache.stats.overall_hit_rate() > 0.99);
}

#[tokio::test]
async fn cleanup_sweeps_expired_rows_with_dry_run() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;
	let cache = HybridCache::new(cache_config(dir.path()), Some(store.clone()));

	let past = Utc::now() - chrono::Duration::days(1);
	for (key, expires) in [("old", past), ("fresh", Utc::now() + chrono::Duration::days(1))] {
		store
			.execute(
				"INSERT INTO enrichment_cache (service, cache_key, cache_value, created_at, expires_at)
				 VALUES ($1, $2, $3, $4, $5)",
				&[
					SqlParam::Text("urlhaus".to_string()),
					SqlParam::Text(key.to_string()),
					SqlParam::Text("{}".to_string()),
					SqlParam::Timestamp(past),
					SqlParam::Timestamp(expires),
				],
			)
			.await
			.unwrap();
	}

	assert_eq!(cache.cleanup_expired(true).await.unwrap(), 1);
	// Dry run deleted nothing.
	let count = store
		.fetch_optional("SELECT COUNT(*) AS n FROM enrichment_cache", &[])
		.await
		.unwrap()
		.unwrap();
	assert_eq!(count.i64("n").unwrap(), 2);

	assert_eq!(cache.cleanup_expired(false).await.unwrap(), 1);
	let count = store
		.fetch_optional("SELECT COUNT(*) AS n FROM enrichment_cache", &[])
		.await
		.unwrap()
		.unwrap();
	assert_eq!(count.i64("n").unwrap(), 1);
}
