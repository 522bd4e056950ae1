//! Enrichment service: cache-mediated, rate-limited provider fan-out.
//!
//! Every lookup walks the three-tier cache first; only a full miss spends a
//! rate-limit token and goes to the network. A provider failure never fails
//! the enrichment — the merged document simply omits that provider and the
//! failure is counted.

pub mod cache;
pub mod fs_tier;
pub mod providers;
pub mod rate_limit;
pub mod ssh_keys;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{info_span, Instrument};

use crate::ipclass::IpClassifier;

pub use cache::{HybridCache, HybridCacheConfig, TtlPolicy};
pub use providers::{HttpFetcher, ProviderEndpoints, ProviderError};
pub use rate_limit::{RateLimitConfig, RateLimiter};

/// The external providers this service can fan out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
	VirusTotal,
	Dshield,
	UrlHaus,
	Spur,
	Hibp,
	IpClassification,
}

impl ProviderKind {
	pub fn service_name(&self) -> &'static str {
		match self {
			Self::VirusTotal => "virustotal",
			Self::Dshield => "dshield",
			Self::UrlHaus => "urlhaus",
			Self::Spur => "spur",
			Self::Hibp => "hibp",
			Self::IpClassification => "ip_classification",
		}
	}

	pub fn all() -> HashSet<Self> {
		[
			Self::VirusTotal,
			Self::Dshield,
			Self::UrlHaus,
			Self::Spur,
			Self::Hibp,
			Self::IpClassification,
		]
		.into_iter()
		.collect()
	}
}

/// Seam the loaders use to resolve session-level enrichment.
#[async_trait]
pub trait SessionEnricher: Send + Sync {
	async fn enrich_session(&self, session_id: &str, src_ip: &str) -> anyhow::Result<Value>;
}

/// True when any VirusTotal analysis reported the file malicious.
pub fn vt_flagged(doc: &Value) -> bool {
	doc.pointer("/virustotal/malicious")
		.and_then(Value::as_i64)
		.map_or(false, |n| n > 0)
}

/// True when DShield reports attack activity for the source IP.
pub fn dshield_flagged(doc: &Value) -> bool {
	doc.pointer("/dshield/attacks")
		.and_then(Value::as_i64)
		.map_or(false, |n| n > 0)
}

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
	pub endpoints: ProviderEndpoints,
	pub enabled: HashSet<ProviderKind>,
	pub rate_limits: RateLimitConfig,
	/// Fan-out width for bulk entity enrichment.
	pub concurrency: usize,
}

impl Default for EnrichmentConfig {
	fn default() -> Self {
		Self {
			endpoints: ProviderEndpoints::default(),
			enabled: ProviderKind::all(),
			rate_limits: RateLimitConfig::default(),
			concurrency: 8,
		}
	}
}

/// Cache-mediated enrichment over the configured provider subset.
pub struct EnrichmentService {
	config: EnrichmentConfig,
	cache: Arc<HybridCache>,
	limiter: RateLimiter,
	fetcher: HttpFetcher,
	classifier: Option<tokio::sync::Mutex<IpClassifier>>,
	errors: Mutex<HashMap<&'static str, u64>>,
}

impl EnrichmentService {
	pub fn new(
		config: EnrichmentConfig,
		cache: Arc<HybridCache>,
		classifier: Option<IpClassifier>,
	) -> Result<Self, ProviderError> {
		let fetcher = HttpFetcher::new(
			config.endpoints.request_timeout,
			config.endpoints.max_retries,
		)?;
		let limiter = RateLimiter::new(config.rate_limits.clone());
		Ok(Self {
			config,
			cache,
			limiter,
			fetcher,
			classifier: classifier.map(tokio::sync::Mutex::new),
			errors: Mutex::new(HashMap::new()),
		})
	}

	pub fn cache(&self) -> &HybridCache {
		&self.cache
	}

	fn enabled(&self, kind: ProviderKind) -> bool {
		self.config.enabled.contains(&kind)
	}

	fn count_error(&self, service: &'static str) {
		*self.errors.lock().entry(service).or_insert(0) += 1;
	}

	/// Per-provider failure counts since construction.
	pub fn error_counts(&self) -> Value {
		let errors = self.errors.lock();
		json!(errors
			.iter()
			.map(|(k, v)| ((*k).to_string(), json!(v)))
			.collect::<serde_json::Map<String, Value>>())
	}

	/// One provider lookup, mediated by the cache and the rate limiter.
	async fn cached_lookup<F>(&self, kind: ProviderKind, key: &str, fetch: F) -> Option<Value>
	where
		F: std::future::Future<Output = Result<Value, ProviderError>>,
	{
		let service = kind.service_name();
		if let Some(hit) = self.cache.get_cached(service, key).await {
			return Some(hit);
		}
		self.limiter.acquire(service).await;
		match fetch.await {
			Ok(value) => {
				self.cache.store_cached(service, key, &value).await;
				Some(value)
			}
			Err(e) => {
				providers::log_provider_failure(service, key, &e);
				self.count_error(service);
				None
			}
		}
	}

	/// Merge the IP-oriented providers into one enrichment document.
	pub async fn enrich_ip(&self, ip: &str) -> Value {
		let dshield = async {
			if !self.enabled(ProviderKind::Dshield) {
				return None;
			}
			self.cached_lookup(
				ProviderKind::Dshield,
				ip,
				providers::lookup_dshield(&self.fetcher, &self.config.endpoints, ip),
			)
			.await
		};
		let spur = async {
			if !self.enabled(ProviderKind::Spur) {
				return None;
			}
			self.cached_lookup(
				ProviderKind::Spur,
				ip,
				providers::lookup_spur(&self.fetcher, &self.config.endpoints, ip),
			)
			.await
		};
		let classification = async {
			if !self.enabled(ProviderKind::IpClassification) {
				return None;
			}
			let classifier = self.classifier.as_ref()?;
			let mut classifier = classifier.lock().await;
			match classifier.classify(ip, None, None).await {
				Ok(verdict) => serde_json::to_value(verdict).ok(),
				Err(e) => {
					tracing::warn!(ip, error = %e, "ip classification failed");
					self.count_error("ip_classification");
					None
				}
			}
		};

		let (dshield, spur, classification) = futures::join!(dshield, spur, classification);

		let mut doc = serde_json::Map::new();
		if let Some(value) = dshield {
			doc.insert("dshield".to_string(), value);
		}
		if let Some(value) = spur {
			doc.insert("spur".to_string(), value);
		}
		if let Some(value) = classification {
			doc.insert("ip_classification".to_string(), value);
		}
		Value::Object(doc)
	}

	/// File-hash enrichment (VirusTotal).
	pub async fn enrich_file(&self, file_hash: &str, filename: Option<&str>) -> Value {
		let mut doc = serde_json::Map::new();
		if self.enabled(ProviderKind::VirusTotal) {
			if let Some(value) = self
				.cached_lookup(
					ProviderKind::VirusTotal,
					file_hash,
					providers::lookup_virustotal(&self.fetcher, &self.config.endpoints, file_hash),
				)
				.await
			{
				doc.insert("virustotal".to_string(), value);
			}
		}
		if let Some(filename) = filename {
			doc.insert(
				"filename".to_string(),
				json!(crate::event::sanitize::sanitize_text(filename)),
			);
		}
		Value::Object(doc)
	}

	/// Download-URL enrichment (URLHaus).
	pub async fn enrich_url(&self, url: &str) -> Value {
		let mut doc = serde_json::Map::new();
		if self.enabled(ProviderKind::UrlHaus) {
			if let Some(value) = self
				.cached_lookup(
					ProviderKind::UrlHaus,
					url,
					providers::lookup_urlhaus(&self.fetcher, &self.config.endpoints, url),
				)
				.await
			{
				doc.insert("urlhaus".to_string(), value);
			}
		}
		Value::Object(doc)
	}

	/// HIBP k-anonymity range lookup over a 5-hex-char SHA-1 prefix.
	pub async fn check_password_prefix(&self, prefix: &str) -> Option<Value> {
		if !self.enabled(ProviderKind::Hibp) {
			return None;
		}
		self.cached_lookup(
			ProviderKind::Hibp,
			prefix,
			providers::lookup_hibp(&self.fetcher, &self.config.endpoints, prefix),
		)
		.await
	}

	/// Bulk IP enrichment with bounded concurrency.
	pub async fn enrich_ips(&self, ips: &[String]) -> HashMap<String, Value> {
		stream::iter(ips.iter().cloned())
			.map(|ip| async move {
				let doc = self.enrich_ip(&ip).await;
				(ip, doc)
			})
			.buffer_unordered(self.config.concurrency.max(1))
			.collect()
			.await
	}
}

#[async_trait]
impl SessionEnricher for EnrichmentService {
	async fn enrich_session(&self, session_id: &str, src_ip: &str) -> anyhow::Result<Value> {
		let span = info_span!("mimir.enrich.session", session = %session_id, ip = %src_ip);
		let doc = self.enrich_ip(src_ip).instrument(span).await;
		Ok(doc)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flag_extraction_from_merged_documents() {
		let doc = json!({
			"virustotal": {"malicious": 3},
			"dshield": {"attacks": 0, "count": 12},
		});
		assert!(vt_flagged(&doc));
		assert!(!dshield_flagged(&doc));

		let hostile = json!({"dshield": {"attacks": 9}});
		assert!(dshield_flagged(&hostile));
		assert!(!vt_flagged(&hostile));
		assert!(!vt_flagged(&json!({})));
	}

	#[tokio::test]
	async fn disabled_providers_are_omitted() {
		let cache = Arc::new(HybridCache::new(
			HybridCacheConfig {
				enable_filesystem: false,
				..HybridCacheConfig::default()
			},
			None,
		));
		let config = EnrichmentConfig {
			enabled: HashSet::new(),
			..EnrichmentConfig::default()
		};
		let service = EnrichmentService::new(config, cache, None).unwrap();
		let doc = service.enrich_ip("1.2.3.4").await;
		assert_eq!(doc, json!({}));
		assert!(service.check_password_prefix("5BAA6").await.is_none());
	}

	#[tokio::test]
	async fn file_and_url_enrichment_read_through_the_cache() {
		let cache = Arc::new(HybridCache::new(
			HybridCacheConfig {
				enable_filesystem: false,
				..HybridCacheConfig::default()
			},
			None,
		));
		cache
			.store_cached(
				"virustotal",
				"d4c9d9027326271a89ce51fcaf328ed673f17be33469ff979e8ab8dd501e664f",
				&json!({"malicious": 12, "threat_label": "trojan.mirai"}),
			)
			.await;
		cache
			.store_cached("urlhaus", "http://evil.example/m.sh", &json!({"tags": ["elf"]}))
			.await;
		let service = EnrichmentService::new(EnrichmentConfig::default(), cache, None).unwrap();

		let file_doc = service
			.enrich_file(
				"d4c9d9027326271a89ce51fcaf328ed673f17be33469ff979e8ab8dd501e664f",
				Some("m\u{0000}.sh"),
			)
			.await;
		assert!(vt_flagged(&file_doc));
		assert_eq!(file_doc["virustotal"]["threat_label"], "trojan.mirai");
		// Filenames are sanitized on the way through.
		assert_eq!(file_doc["filename"], "m.sh");

		let url_doc = service.enrich_url("http://evil.example/m.sh").await;
		assert_eq!(url_doc["urlhaus"]["tags"], json!(["elf"]));
	}

	#[tokio::test]
	async fn bulk_ip_enrichment_fans_out_with_bounded_concurrency() {
		let cache = Arc::new(HybridCache::new(
			HybridCacheConfig {
				enable_filesystem: false,
				..HybridCacheConfig::default()
			},
			None,
		));
		for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
			cache
				.store_cached("dshield", ip, &json!({"attacks": 1, "ascountry": "NL"}))
				.await;
		}
		let config = EnrichmentConfig {
			enabled: [ProviderKind::Dshield].into_iter().collect(),
			concurrency: 2,
			..EnrichmentConfig::default()
		};
		let service = EnrichmentService::new(config, cache, None).unwrap();

		let ips: Vec<String> = ["1.1.1.1", "2.2.2.2", "3.3.3.3"]
			.iter()
			.map(|s| s.to_string())
			.collect();
		let docs = service.enrich_ips(&ips).await;
		assert_eq!(docs.len(), 3);
		assert!(docs.values().all(dshield_flagged));
	}

	#[tokio::test]
	async fn cached_documents_bypass_the_network() {
		let cache = Arc::new(HybridCache::new(
			HybridCacheConfig {
				enable_filesystem: false,
				..HybridCacheConfig::default()
			},
			None,
		));
		// Seed the cache so no provider call is needed.
		cache
			.store_cached("dshield", "1.2.3.4", &json!({"attacks": 5, "ascountry": "NL"}))
			.await;
		let config = EnrichmentConfig {
			enabled: [ProviderKind::Dshield].into_iter().collect(),
			..EnrichmentConfig::default()
		};
		let service = EnrichmentService::new(config, cache, None).unwrap();
		let doc = service.enrich_ip("1.2.3.4").await;
		assert_eq!(doc["dshield"]["attacks"], 5);
		assert!(dshield_flagged(&doc));
	}
}
