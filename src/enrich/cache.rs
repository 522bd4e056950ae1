//! Three-tier enrichment cache.
//!
//! Reads walk down the tiers (memory -> database -> filesystem), writes walk
//! across all of them, and any lower-tier hit backfills the tiers above it.
//! Every tier failure is isolated: logged, counted, never fatal — a cache
//! can only ever make enrichment slower, not wrong.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::db::{SqlParam, Store, StoreResult};
use crate::enrich::fs_tier::{FsCacheTier, FsTierConfig};
use crate::event::sanitize::sanitize_value;

/// Per-tier counters. Latency is accumulated in microseconds.
#[derive(Debug, Default)]
pub struct TierStats {
	hits: AtomicU64,
	misses: AtomicU64,
	stores: AtomicU64,
	errors: AtomicU64,
	latency_us: AtomicU64,
}

impl TierStats {
	fn record_hit(&self, elapsed: Duration) {
		self.hits.fetch_add(1, Ordering::Relaxed);
		self.latency_us
			.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
	}

	fn record_miss(&self, elapsed: Duration) {
		self.misses.fetch_add(1, Ordering::Relaxed);
		self.latency_us
			.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
	}

	fn record_store(&self) {
		self.stores.fetch_add(1, Ordering::Relaxed);
	}

	fn record_error(&self) {
		self.errors.fetch_add(1, Ordering::Relaxed);
	}

	pub fn hits(&self) -> u64 {
		self.hits.load(Ordering::Relaxed)
	}

	pub fn misses(&self) -> u64 {
		self.misses.load(Ordering::Relaxed)
	}

	pub fn hit_rate(&self) -> f64 {
		let hits = self.hits() as f64;
		let total = hits + self.misses() as f64;
		if total == 0.0 {
			0.0
		} else {
			hits / total
		}
	}

	fn snapshot(&self) -> Value {
		json!({
			"hits": self.hits(),
			"misses": self.misses(),
			"stores": self.stores.load(Ordering::Relaxed),
			"errors": self.errors.load(Ordering::Relaxed),
			"total_latency_ms": self.latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
			"hit_rate": self.hit_rate(),
		})
	}
}

/// Counters for the whole hierarchy.
#[derive(Debug, Default)]
pub struct CacheStats {
	pub l1_memory: TierStats,
	pub l2_database: TierStats,
	pub l3_filesystem: TierStats,
	api_calls: AtomicU64,
	requests: AtomicU64,
}

impl CacheStats {
	/// Overall hit rate: any-tier hits over all lookups.
	pub fn overall_hit_rate(&self) -> f64 {
		let requests = self.requests.load(Ordering::Relaxed) as f64;
		if requests == 0.0 {
			return 0.0;
		}
		let misses = self.api_calls.load(Ordering::Relaxed) as f64;
		(requests - misses) / requests
	}

	pub fn snapshot(&self) -> Value {
		json!({
			"l1_memory": self.l1_memory.snapshot(),
			"l2_database": self.l2_database.snapshot(),
			"l3_filesystem": self.l3_filesystem.snapshot(),
			"api_calls": self.api_calls.load(Ordering::Relaxed),
			"requests": self.requests.load(Ordering::Relaxed),
			"overall_hit_rate": self.overall_hit_rate(),
		})
	}
}

/// TTL policy across tiers and services.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
	pub l1_default: Duration,
	pub l2_default: Duration,
	pub l2_per_service: HashMap<String, Duration>,
}

impl Default for TtlPolicy {
	fn default() -> Self {
		const DAY: u64 = 24 * 60 * 60;
		let mut l2_per_service = HashMap::new();
		l2_per_service.insert("virustotal".to_string(), Duration::from_secs(30 * DAY));
		l2_per_service.insert("dshield".to_string(), Duration::from_secs(7 * DAY));
		l2_per_service.insert("urlhaus".to_string(), Duration::from_secs(3 * DAY));
		l2_per_service.insert("spur".to_string(), Duration::from_secs(7 * DAY));
		l2_per_service.insert("hibp".to_string(), Duration::from_secs(90 * DAY));
		l2_per_service.insert("ip_classification".to_string(), Duration::from_secs(7 * DAY));
		Self {
			l1_default: Duration::from_secs(60 * 60),
			l2_default: Duration::from_secs(30 * DAY),
			l2_per_service,
		}
	}
}

impl TtlPolicy {
	pub fn l2_ttl(&self, service: &str) -> Duration {
		self.l2_per_service
			.get(service)
			.copied()
			.unwrap_or(self.l2_default)
	}
}

/// In-process L1 tier: a TTL map guarded by a mutex. Sub-millisecond and
/// process-local, standing in for the short-TTL network store the same way.
struct MemoryTier {
	entries: Mutex<HashMap<String, (Value, Instant)>>,
}

impl MemoryTier {
	fn new() -> Self {
		Self {
			entries: Mutex::new(HashMap::new()),
		}
	}

	fn get(&self, composite: &str) -> Option<Value> {
		let mut entries = self.entries.lock();
		match entries.get(composite) {
			Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
			Some(_) => {
				entries.remove(composite);
				None
			}
			None => None,
		}
	}

	fn store(&self, composite: String, value: Value, ttl: Duration) {
		let mut entries = self.entries.lock();
		// Opportunistic sweep to keep the map from accumulating corpses.
		if entries.len() > 10_000 {
			let now = Instant::now();
			entries.retain(|_, (_, expires)| *expires > now);
		}
		entries.insert(composite, (value, Instant::now() + ttl));
	}
}

#[derive(Debug, Clone)]
pub struct HybridCacheConfig {
	pub enable_memory: bool,
	pub enable_filesystem: bool,
	pub ttls: TtlPolicy,
	pub fs: FsTierConfig,
}

impl Default for HybridCacheConfig {
	fn default() -> Self {
		Self {
			enable_memory: true,
			enable_filesystem: true,
			ttls: TtlPolicy::default(),
			fs: FsTierConfig::default(),
		}
	}
}

/// The three-tier cache itself.
pub struct HybridCache {
	memory: Option<MemoryTier>,
	db: Option<Arc<Store>>,
	fs: Option<FsCacheTier>,
	ttls: TtlPolicy,
	pub stats: CacheStats,
}

impl HybridCache {
	pub fn new(config: HybridCacheConfig, db: Option<Arc<Store>>) -> Self {
		let memory = config.enable_memory.then(MemoryTier::new);
		let fs = config
			.enable_filesystem
			.then(|| FsCacheTier::new(config.fs.clone()));
		if db.is_none() {
			debug!("database cache tier not configured; operating without L2");
		}
		Self {
			memory,
			db,
			fs,
			ttls: config.ttls,
			stats: CacheStats::default(),
		}
	}

	fn composite(service: &str, key: &str) -> String {
		format!("{service}:{key}")
	}

	/// Walk the tiers for `(service, key)`. A hit from a lower tier
	/// backfills every tier above it; a full miss returns `None` and the
	/// caller goes to the API.
	pub async fn get_cached(&self, service: &str, key: &str) -> Option<Value> {
		self.stats.requests.fetch_add(1, Ordering::Relaxed);
		let composite = Self::composite(service, key);

		if let Some(memory) = &self.memory {
			let started = Instant::now();
			match memory.get(&composite) {
				Some(value) => {
					self.stats.l1_memory.record_hit(started.elapsed());
					return Some(value);
				}
				None => self.stats.l1_memory.record_miss(started.elapsed()),
			}
		}

		if self.db.is_some() {
			let started = Instant::now();
			match self.db_get(service, key).await {
				Ok(Some(value)) => {
					self.stats.l2_database.record_hit(started.elapsed());
					self.backfill_memory(&composite, &value);
					return Some(value);
				}
				Ok(None) => self.stats.l2_database.record_miss(started.elapsed()),
				Err(e) => {
					self.stats.l2_database.record_error();
					warn!(service, key, error = %e, "database cache read failed");
				}
			}
		}

		if let Some(fs) = &self.fs {
			let started = Instant::now();
			match fs.get(service, key) {
				Some(value) => {
					self.stats.l3_filesystem.record_hit(started.elapsed());
					self.backfill_db(service, key, &value).await;
					self.backfill_memory(&composite, &value);
					return Some(value);
				}
				None => self.stats.l3_filesystem.record_miss(started.elapsed()),
			}
		}

		self.stats.api_calls.fetch_add(1, Ordering::Relaxed);
		None
	}

	/// Write-through store into every enabled tier, with the default L1 TTL.
	pub async fn store_cached(&self, service: &str, key: &str, value: &Value) {
		self.store_with_l1_ttl(service, key, value, self.ttls.l1_default)
			.await;
	}

	/// Write-through store with an explicit L1 TTL (the IP classifier keys
	/// its short-tier TTL off the classified type).
	pub async fn store_with_l1_ttl(
		&self,
		service: &str,
		key: &str,
		value: &Value,
		l1_ttl: Duration,
	) {
		let value = sanitize_value(value);
		if let Some(memory) = &self.memory {
			memory.store(Self::composite(service, key), value.clone(), l1_ttl);
			self.stats.l1_memory.record_store();
		}
		if self.db.is_some() {
			match self.db_set(service, key, &value).await {
				Ok(()) => self.stats.l2_database.record_store(),
				Err(e) => {
					self.stats.l2_database.record_error();
					warn!(service, key, error = %e, "database cache write failed");
				}
			}
		}
		if let Some(fs) = &self.fs {
			match fs.store(service, key, &value) {
				Ok(()) => self.stats.l3_filesystem.record_store(),
				Err(e) => {
					self.stats.l3_filesystem.record_error();
					warn!(service, key, error = %e, "filesystem cache write failed");
				}
			}
		}
	}

	fn backfill_memory(&self, composite: &str, value: &Value) {
		if let Some(memory) = &self.memory {
			memory.store(composite.to_string(), value.clone(), self.ttls.l1_default);
			self.stats.l1_memory.record_store();
		}
	}

	async fn backfill_db(&self, service: &str, key: &str, value: &Value) {
		if self.db.is_none() {
			return;
		}
		match self.db_set(service, key, value).await {
			Ok(()) => self.stats.l2_database.record_store(),
			Err(e) => {
				self.stats.l2_database.record_error();
				warn!(service, key, error = %e, "database cache backfill failed");
			}
		}
	}

	/// L2 read. Expired rows are deleted on access so the table cleans
	/// itself under normal read traffic.
	async fn db_get(&self, service: &str, key: &str) -> StoreResult<Option<Value>> {
		let Some(db) = &self.db else { return Ok(None) };
		let now = Utc::now();
		db.execute(
			"DELETE FROM enrichment_cache
			 WHERE service = $1 AND cache_key = $2 AND expires_at < $3",
			&[
				SqlParam::Text(service.to_string()),
				SqlParam::Text(key.to_string()),
				SqlParam::Timestamp(now),
			],
		)
		.await?;
		let row = db
			.fetch_optional(
				"SELECT cache_value FROM enrichment_cache
				 WHERE service = $1 AND cache_key = $2",
				&[
					SqlParam::Text(service.to_string()),
					SqlParam::Text(key.to_string()),
				],
			)
			.await?;
		row.map(|r| r.json("cache_value")).transpose()
	}

	/// L2 write: native UPSERT refreshing both the value and the TTL.
	async fn db_set(&self, service: &str, key: &str, value: &Value) -> StoreResult<()> {
		let Some(db) = &self.db else { return Ok(()) };
		let now = Utc::now();
		let ttl = self.ttls.l2_ttl(service);
		let expires = now + chrono::Duration::seconds(ttl.as_secs() as i64);
		db.execute(
			"INSERT INTO enrichment_cache (service, cache_key, cache_value, created_at, expires_at)
			 VALUES ($1, $2, $3, $4, $5)
			 ON CONFLICT (service, cache_key) DO UPDATE SET
				cache_value = excluded.cache_value,
				created_at = excluded.created_at,
				expires_at = excluded.expires_at",
			&[
				SqlParam::Text(service.to_string()),
				SqlParam::Text(key.to_string()),
				SqlParam::Json(value.clone()),
				SqlParam::Timestamp(now),
				SqlParam::Timestamp(expires),
			],
		)
		.await?;
		Ok(())
	}

	/// Sweep expired L2 rows. With `dry_run` the count is reported without
	/// deleting anything.
	pub async fn cleanup_expired(&self, dry_run: bool) -> StoreResult<u64> {
		let Some(db) = &self.db else { return Ok(0) };
		let now = Utc::now();
		if dry_run {
			let row = db
				.fetch_optional(
					"SELECT COUNT(*) AS n FROM enrichment_cache WHERE expires_at < $1",
					&[SqlParam::Timestamp(now)],
				)
				.await?;
			return Ok(row.map(|r| r.i64("n")).transpose()?.unwrap_or(0) as u64);
		}
		let deleted = db
			.execute(
				"DELETE FROM enrichment_cache WHERE expires_at < $1",
				&[SqlParam::Timestamp(now)],
			)
			.await?;
		Ok(deleted)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn memory_tier_expires_entries() {
		let tier = MemoryTier::new();
		tier.store("svc:k".to_string(), json!(1), Duration::from_millis(5));
		assert_eq!(tier.get("svc:k"), Some(json!(1)));
		std::thread::sleep(Duration::from_millis(10));
		assert_eq!(tier.get("svc:k"), None);
	}

	#[test]
	fn ttl_policy_service_overrides() {
		let policy = TtlPolicy::default();
		assert_eq!(policy.l2_ttl("hibp"), Duration::from_secs(90 * 24 * 60 * 60));
		assert_eq!(policy.l2_ttl("urlhaus"), Duration::from_secs(3 * 24 * 60 * 60));
		assert_eq!(policy.l2_ttl("unheard-of"), policy.l2_default);
	}

	#[tokio::test]
	async fn memory_only_cache_round_trips_and_counts() {
		let config = HybridCacheConfig {
			enable_filesystem: false,
			..HybridCacheConfig::default()
		};
		let cache = HybridCache::new(config, None);
		assert_eq!(cache.get_cached("dshield", "1.2.3.4").await, None);

		cache.store_cached("dshield", "1.2.3.4", &json!({"attacks": 2})).await;
		assert_eq!(
			cache.get_cached("dshield", "1.2.3.4").await,
			Some(json!({"attacks": 2}))
		);
		assert_eq!(cache.stats.l1_memory.hits(), 1);
		assert_eq!(cache.stats.l1_memory.misses(), 1);
		assert!(cache.stats.overall_hit_rate() > 0.0);
	}

	#[tokio::test]
	async fn filesystem_hit_backfills_memory() {
		let dir = tempfile::tempdir().unwrap();
		let config = HybridCacheConfig {
			fs: FsTierConfig {
				root: dir.path().to_path_buf(),
				ttl: Duration::from_secs(60),
			},
			..HybridCacheConfig::default()
		};
		// Pre-populate L3 out of band.
		FsCacheTier::new(config.fs.clone())
			.store("dshield", "1.2.3.4", &json!({"attacks": 9}))
			.unwrap();

		let cache = HybridCache::new(config, None);
		assert_eq!(
			cache.get_cached("dshield", "1.2.3.4").await,
			Some(json!({"attacks": 9}))
		);
		assert_eq!(cache.stats.l3_filesystem.hits(), 1);
		// Second read is served by the backfilled L1.
		assert_eq!(
			cache.get_cached("dshield", "1.2.3.4").await,
			Some(json!({"attacks": 9}))
		);
		assert_eq!(cache.stats.l1_memory.hits(), 1);
		assert_eq!(cache.stats.l3_filesystem.hits(), 1);
	}

	#[tokio::test]
	async fn stored_values_are_sanitized() {
		let config = HybridCacheConfig {
			enable_filesystem: false,
			..HybridCacheConfig::default()
		};
		let cache = HybridCache::new(config, None);
		cache
			.store_cached("spur", "1.2.3.4", &json!({"organization": "Bad\u{0000}Org"}))
			.await;
		assert_eq!(
			cache.get_cached("spur", "1.2.3.4").await,
			Some(json!({"organization": "BadOrg"}))
		);
	}
}
