//! Source-IP infrastructure classification.
//!
//! A priority-ordered chain of matchers (TOR exits, cloud ranges, datacenter
//! ranges, residential heuristic) backed by downloadable prefix lists and
//! mediated by the three-tier enrichment cache. The first matcher to claim
//! an address wins; everything else is `unknown` with a short cache TTL so
//! it is retried after the next list update.

pub mod cloud;
pub mod datacenter;
pub mod model;
pub mod refresh;
pub mod residential;
pub mod tor;
pub mod trie;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use serde_json::{json, Value};
use tracing::debug;

use crate::enrich::cache::HybridCache;
use crate::enrich::providers::HttpFetcher;
use crate::ipclass::cloud::{CloudProviderMatcher, DEFAULT_CLOUD_BASE_URL};
use crate::ipclass::datacenter::{DatacenterMatcher, DEFAULT_DATACENTER_URL};
use crate::ipclass::refresh::Matcher;
use crate::ipclass::residential::ResidentialHeuristic;
use crate::ipclass::tor::{TorExitMatcher, DEFAULT_TOR_URL};
use crate::ipclass::trie::parse_ip;

pub use model::{IpClassification, IpType};

/// Cache service name shared with the enrichment document.
pub const CACHE_SERVICE: &str = "ip_classification";

#[derive(Debug, Clone)]
pub struct IpClassifierConfig {
	pub cache_dir: PathBuf,
	pub tor_url: String,
	pub cloud_base_url: String,
	pub datacenter_url: String,
	pub request_timeout: Duration,
}

impl Default for IpClassifierConfig {
	fn default() -> Self {
		Self {
			cache_dir: crate::enrich::fs_tier::FsTierConfig::default_root()
				.join("ip_classification"),
			tor_url: DEFAULT_TOR_URL.to_string(),
			cloud_base_url: DEFAULT_CLOUD_BASE_URL.to_string(),
			datacenter_url: DEFAULT_DATACENTER_URL.to_string(),
			request_timeout: Duration::from_secs(30),
		}
	}
}

#[derive(Debug, Default)]
struct ClassifierStats {
	classifications: AtomicU64,
	cache_hits: AtomicU64,
	cache_misses: AtomicU64,
	tor: AtomicU64,
	cloud: AtomicU64,
	datacenter: AtomicU64,
	residential: AtomicU64,
	unknown: AtomicU64,
}

impl ClassifierStats {
	fn bump_type(&self, ip_type: IpType) {
		let counter = match ip_type {
			IpType::Tor => &self.tor,
			IpType::Cloud => &self.cloud,
			IpType::Datacenter => &self.datacenter,
			IpType::Residential => &self.residential,
			IpType::Unknown => &self.unknown,
		};
		counter.fetch_add(1, Ordering::Relaxed);
	}
}

/// Priority-ordered IP classifier.
///
/// Not internally locked: `classify` takes `&mut self` because matchers
/// refresh in place. Use one instance per task or serialize externally.
pub struct IpClassifier {
	matchers: Vec<Box<dyn Matcher>>,
	cache: Arc<HybridCache>,
	fetcher: HttpFetcher,
	stats: ClassifierStats,
}

impl IpClassifier {
	pub fn new(config: IpClassifierConfig, cache: Arc<HybridCache>) -> anyhow::Result<Self> {
		let fetcher = HttpFetcher::new(config.request_timeout, 2)?;
		let matchers: Vec<Box<dyn Matcher>> = vec![
			Box::new(TorExitMatcher::new(config.tor_url.clone(), config.cache_dir.clone())),
			Box::new(CloudProviderMatcher::new(
				config.cloud_base_url.clone(),
				config.cache_dir.clone(),
			)),
			Box::new(DatacenterMatcher::new(
				config.datacenter_url.clone(),
				config.cache_dir.clone(),
			)),
			Box::new(ResidentialHeuristic::new()),
		];
		Ok(Self {
			matchers,
			cache,
			fetcher,
			stats: ClassifierStats::default(),
		})
	}

	/// Build a classifier around pre-constructed matchers (tests seed these
	/// with fixture data instead of live downloads).
	pub fn with_matchers(
		matchers: Vec<Box<dyn Matcher>>,
		cache: Arc<HybridCache>,
		request_timeout: Duration,
	) -> anyhow::Result<Self> {
		Ok(Self {
			matchers,
			cache,
			fetcher: HttpFetcher::new(request_timeout, 2)?,
			stats: ClassifierStats::default(),
		})
	}

	/// Classify one address. Matchers run in strict priority order; each
	/// refreshes on demand when its data is stale. A refresh failure on a
	/// never-loaded matcher propagates, matching the "no data at all"
	/// startup contract.
	pub async fn classify(
		&mut self,
		ip: &str,
		asn: Option<i64>,
		as_name: Option<&str>,
	) -> anyhow::Result<IpClassification> {
		self.stats.classifications.fetch_add(1, Ordering::Relaxed);

		if let Some(cached) = self.cache.get_cached(CACHE_SERVICE, ip).await {
			if let Ok(classification) = serde_json::from_value::<IpClassification>(cached) {
				self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
				return Ok(classification);
			}
		}
		self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);

		let Some(parsed) = parse_ip(ip) else {
			debug!(ip, "unparseable address; classifying as unknown");
			let classification = IpClassification::unknown();
			self.stats.bump_type(IpType::Unknown);
			return Ok(classification);
		};

		let mut verdict: Option<IpClassification> = None;
		for matcher in &mut self.matchers {
			matcher.ensure_fresh(&self.fetcher).await?;
			if let Some(hit) = matcher.lookup(parsed, asn, as_name) {
				verdict = Some(IpClassification::new(
					matcher.ip_type(),
					hit.provider,
					hit.confidence,
					hit.source,
				));
				break;
			}
		}

		// Unknowns are cached too, with the short TTL, so they are retried
		// after the next list update.
		let classification = verdict.unwrap_or_else(IpClassification::unknown);
		self.stats.bump_type(classification.ip_type);
		self.store(ip, &classification).await;
		Ok(classification)
	}

	/// Classify a batch of `(ip, asn, as_name)` tuples.
	pub async fn bulk_classify(
		&mut self,
		ips: &[(String, Option<i64>, Option<String>)],
	) -> anyhow::Result<std::collections::BTreeMap<String, IpClassification>> {
		let mut results = std::collections::BTreeMap::new();
		for (ip, asn, as_name) in ips {
			let classification = self.classify(ip, *asn, as_name.as_deref()).await?;
			results.insert(ip.clone(), classification);
		}
		Ok(results)
	}

	async fn store(&self, ip: &str, classification: &IpClassification) {
		let Ok(value) = serde_json::to_value(classification) else {
			return;
		};
		self.cache
			.store_with_l1_ttl(CACHE_SERVICE, ip, &value, classification.ip_type.l1_ttl())
			.await;
	}

	/// Force-refresh every data source (cron entry point: TOR hourly, cloud
	/// daily, datacenter weekly — callers pick the cadence).
	pub async fn update_all_sources(&mut self) -> anyhow::Result<()> {
		let mut failures = Vec::new();
		for matcher in &mut self.matchers {
			match matcher.download(&self.fetcher).await {
				Ok(()) => matcher.state_mut().mark_updated(),
				Err(e) => failures.push(format!("{}: {e}", matcher.name())),
			}
		}
		if !failures.is_empty() {
			bail!("source updates failed: {}", failures.join("; "));
		}
		Ok(())
	}

	pub fn stats(&self) -> Value {
		json!({
			"classifications": self.stats.classifications.load(Ordering::Relaxed),
			"cache_hits": self.stats.cache_hits.load(Ordering::Relaxed),
			"cache_misses": self.stats.cache_misses.load(Ordering::Relaxed),
			"tor_matches": self.stats.tor.load(Ordering::Relaxed),
			"cloud_matches": self.stats.cloud.load(Ordering::Relaxed),
			"datacenter_matches": self.stats.datacenter.load(Ordering::Relaxed),
			"residential_matches": self.stats.residential.load(Ordering::Relaxed),
			"unknown_matches": self.stats.unknown.load(Ordering::Relaxed),
			"matchers": self.matchers.iter().map(|m| m.stats()).collect::<Vec<_>>(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::enrich::cache::HybridCacheConfig;

	fn seeded_classifier() -> IpClassifier {
		let dir = tempfile::tempdir().unwrap();
		let mut tor = TorExitMatcher::new(DEFAULT_TOR_URL, dir.path().to_path_buf());
		tor.load_from_text("9.9.9.9\n").unwrap();
		let mut cloud = CloudProviderMatcher::new(DEFAULT_CLOUD_BASE_URL, dir.path().to_path_buf());
		cloud
			.load_provider("aws", "ip_prefix,region,service\n52.0.0.0/16,us-east-1,ec2\n")
			.unwrap();
		let mut datacenter = DatacenterMatcher::new(DEFAULT_DATACENTER_URL, dir.path().to_path_buf());
		datacenter
			.load_from_csv("cidr,hostmin,hostmax,vendor\n52.0.0.0/12,a,b,bulkhost\n104.236.0.0/16,a,b,digitalocean\n")
			.unwrap();

		let cache = Arc::new(HybridCache::new(
			HybridCacheConfig {
				enable_filesystem: false,
				..HybridCacheConfig::default()
			},
			None,
		));
		IpClassifier::with_matchers(
			vec![
				Box::new(tor),
				Box::new(cloud),
				Box::new(datacenter),
				Box::new(ResidentialHeuristic::new()),
			],
			cache,
			Duration::from_secs(5),
		)
		.unwrap()
	}

	#[tokio::test]
	async fn priority_order_cloud_beats_datacenter() {
		let mut classifier = seeded_classifier();
		// 52.0.0.1 is in both the AWS /16 and the datacenter /12.
		let verdict = classifier.classify("52.0.0.1", None, None).await.unwrap();
		assert_eq!(verdict.ip_type, IpType::Cloud);
		assert_eq!(verdict.provider.as_deref(), Some("aws"));
		assert_eq!(verdict.confidence, 0.99);
		assert_eq!(verdict.source, "cloud_ranges_aws");
	}

	#[tokio::test]
	async fn tor_outranks_everything() {
		let mut classifier = seeded_classifier();
		let verdict = classifier.classify("9.9.9.9", None, None).await.unwrap();
		assert_eq!(verdict.ip_type, IpType::Tor);
		assert_eq!(verdict.confidence, 0.95);
	}

	#[tokio::test]
	async fn residential_heuristic_is_last_resort_before_unknown() {
		let mut classifier = seeded_classifier();
		let verdict = classifier
			.classify("198.51.100.7", Some(64496), Some("Example Broadband Cable"))
			.await
			.unwrap();
		assert_eq!(verdict.ip_type, IpType::Residential);
		assert_eq!(verdict.confidence, 0.8);

		let unknown = classifier.classify("198.51.100.8", None, None).await.unwrap();
		assert_eq!(unknown.ip_type, IpType::Unknown);
		assert_eq!(unknown.confidence, 0.0);
		assert_eq!(unknown.source, "none");
	}

	#[tokio::test]
	async fn cached_verdicts_are_identical_and_counted() {
		let mut classifier = seeded_classifier();
		let first = classifier.classify("52.0.0.1", None, None).await.unwrap();
		let second = classifier.classify("52.0.0.1", None, None).await.unwrap();
		assert_eq!(first.ip_type, second.ip_type);
		assert_eq!(first.provider, second.provider);
		assert_eq!(first.confidence, second.confidence);
		assert_eq!(first.source, second.source);
		let stats = classifier.stats();
		assert_eq!(stats["cache_hits"], 1);
		assert_eq!(stats["cache_misses"], 1);
	}

	#[tokio::test]
	async fn unparseable_addresses_are_unknown() {
		let mut classifier = seeded_classifier();
		let verdict = classifier.classify("not-an-ip", None, None).await.unwrap();
		assert_eq!(verdict.ip_type, IpType::Unknown);
	}

	#[tokio::test]
	async fn bulk_classify_maps_every_input() {
		let mut classifier = seeded_classifier();
		let inputs = vec![
			("9.9.9.9".to_string(), None, None),
			("52.0.0.1".to_string(), None, None),
			("104.236.1.1".to_string(), None, None),
			(
				"198.51.100.7".to_string(),
				Some(64496),
				Some("Example Broadband Cable".to_string()),
			),
		];
		let results = classifier.bulk_classify(&inputs).await.unwrap();
		assert_eq!(results["9.9.9.9"].ip_type, IpType::Tor);
		assert_eq!(results["52.0.0.1"].ip_type, IpType::Cloud);
		assert_eq!(results["104.236.1.1"].ip_type, IpType::Datacenter);
		assert_eq!(results["198.51.100.7"].ip_type, IpType::Residential);
	}
}
