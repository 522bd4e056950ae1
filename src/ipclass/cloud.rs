//! Cloud provider range matcher (AWS, Azure, GCP, CloudFlare).
//!
//! Per-provider CSVs (`ip_prefix,region,service`) are parsed into one prefix
//! trie per provider. Partial download failure is tolerated: classification
//! keeps working as long as at least one provider's ranges loaded.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::enrich::providers::HttpFetcher;
use crate::ipclass::model::IpType;
use crate::ipclass::refresh::{Matcher, MatcherHit, RefreshState};
use crate::ipclass::trie::PrefixTrie;

pub const DEFAULT_CLOUD_BASE_URL: &str =
	"https://raw.githubusercontent.com/rezmoss/cloud-provider-ip-addresses/main";

pub const CLOUD_PROVIDERS: &[&str] = &["aws", "azure", "gcp", "cloudflare"];

/// Region/service annotations carried on each range.
#[derive(Debug, Clone)]
pub struct RangeMeta {
	pub region: String,
	pub service: String,
}

pub struct CloudProviderMatcher {
	state: RefreshState,
	base_url: String,
	tries: Vec<(String, PrefixTrie<RangeMeta>)>,
}

impl CloudProviderMatcher {
	pub fn new(base_url: impl Into<String>, cache_dir: PathBuf) -> Self {
		Self {
			state: RefreshState::new(Duration::from_secs(24 * 60 * 60), cache_dir),
			base_url: base_url.into(),
			tries: Vec::new(),
		}
	}

	/// Parse one provider's CSV (`ip_prefix,region,service`) into a trie.
	pub fn parse_provider_csv(csv_text: &str) -> anyhow::Result<PrefixTrie<RangeMeta>> {
		let mut reader = csv::ReaderBuilder::new()
			.has_headers(true)
			.trim(csv::Trim::All)
			.from_reader(csv_text.as_bytes());
		let mut trie = PrefixTrie::new();
		for record in reader.records() {
			let record = record?;
			let Some(prefix) = record.get(0).filter(|p| !p.is_empty()) else {
				continue;
			};
			let meta = RangeMeta {
				region: record.get(1).unwrap_or("unknown").to_string(),
				service: record.get(2).unwrap_or("unknown").to_string(),
			};
			if let Err(e) = trie.insert(prefix, meta) {
				debug!(prefix, error = %e, "skipping invalid cloud CIDR");
			}
		}
		if trie.is_empty() {
			bail!("no valid CIDRs parsed from provider CSV");
		}
		Ok(trie)
	}

	/// Replace one provider's trie; exposed for tests and disk-cache loads.
	pub fn load_provider(&mut self, provider: &str, csv_text: &str) -> anyhow::Result<usize> {
		let trie = Self::parse_provider_csv(csv_text)?;
		let count = trie.len();
		match self.tries.iter_mut().find(|(name, _)| name == provider) {
			Some((_, existing)) => *existing = trie,
			None => self.tries.push((provider.to_string(), trie)),
		}
		if !self.tries.is_empty() {
			self.state.mark_updated();
		}
		Ok(count)
	}

	pub fn total_cidrs(&self) -> usize {
		self.tries.iter().map(|(_, t)| t.len()).sum()
	}
}

#[async_trait]
impl Matcher for CloudProviderMatcher {
	fn ip_type(&self) -> IpType {
		IpType::Cloud
	}

	fn name(&self) -> &'static str {
		"cloud_ranges"
	}

	fn state(&self) -> &RefreshState {
		&self.state
	}

	fn state_mut(&mut self) -> &mut RefreshState {
		&mut self.state
	}

	async fn download(&mut self, fetcher: &HttpFetcher) -> anyhow::Result<()> {
		let mut loaded = 0usize;
		let mut failed: Vec<&str> = Vec::new();
		for provider in CLOUD_PROVIDERS {
			let url = format!("{}/{}/ipv4.csv", self.base_url.trim_end_matches('/'), provider);
			let outcome = match fetcher.get_text(&url).await {
				Ok(body) => {
					// Best-effort disk copy beside the matcher state.
					let cache_file = self.state.cache_dir.join(format!("{provider}_ipv4.csv"));
					if let Some(parent) = cache_file.parent() {
						let _ = std::fs::create_dir_all(parent);
					}
					let _ = std::fs::write(&cache_file, &body);
					self.load_provider(provider, &body)
				}
				Err(e) => Err(e.into()),
			};
			match outcome {
				Ok(count) => {
					debug!(provider, cidrs = count, "cloud ranges updated");
					loaded += count;
				}
				Err(e) => {
					warn!(provider, error = %e, "cloud range update failed");
					failed.push(provider);
				}
			}
		}
		if loaded == 0 {
			bail!(
				"no valid CIDRs loaded from any cloud provider (failed: {})",
				failed.join(", ")
			);
		}
		info!(total_cidrs = self.total_cidrs(), failed = failed.len(), "cloud ranges loaded");
		Ok(())
	}

	fn lookup(&self, ip: IpAddr, _asn: Option<i64>, _as_name: Option<&str>) -> Option<MatcherHit> {
		for (provider, trie) in &self.tries {
			if let Some(meta) = trie.longest_match(ip) {
				return Some(MatcherHit {
					provider: Some(provider.clone()),
					confidence: 0.99,
					source: format!("cloud_ranges_{provider}"),
					metadata: json!({
						"region": meta.region,
						"service": meta.service,
					}),
				});
			}
		}
		None
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ipclass::trie::parse_ip;

	const AWS_CSV: &str = "ip_prefix,region,service\n52.0.0.0/16,us-east-1,ec2\n54.230.0.0/16,global,cloudfront\n";

	#[test]
	fn parses_and_matches_provider_ranges() {
		let dir = tempfile::tempdir().unwrap();
		let mut matcher = CloudProviderMatcher::new(DEFAULT_CLOUD_BASE_URL, dir.path().to_path_buf());
		assert_eq!(matcher.load_provider("aws", AWS_CSV).unwrap(), 2);

		let hit = matcher.lookup(parse_ip("52.0.0.1").unwrap(), None, None).unwrap();
		assert_eq!(hit.provider.as_deref(), Some("aws"));
		assert_eq!(hit.confidence, 0.99);
		assert_eq!(hit.source, "cloud_ranges_aws");
		assert_eq!(hit.metadata["region"], "us-east-1");
		assert!(matcher.lookup(parse_ip("8.8.8.8").unwrap(), None, None).is_none());
	}

	#[test]
	fn invalid_rows_are_skipped_not_fatal() {
		let csv = "ip_prefix,region,service\nbogus,us,ec2\n52.0.0.0/16,us-east-1,ec2\n";
		let trie = CloudProviderMatcher::parse_provider_csv(csv).unwrap();
		assert_eq!(trie.len(), 1);
	}

	#[test]
	fn all_invalid_rows_is_an_error() {
		let csv = "ip_prefix,region,service\nbogus,us,ec2\n";
		assert!(CloudProviderMatcher::parse_provider_csv(csv).is_err());
	}

	#[test]
	fn providers_are_checked_in_load_order() {
		let dir = tempfile::tempdir().unwrap();
		let mut matcher = CloudProviderMatcher::new(DEFAULT_CLOUD_BASE_URL, dir.path().to_path_buf());
		matcher.load_provider("aws", AWS_CSV).unwrap();
		matcher
			.load_provider("azure", "ip_prefix,region,service\n52.0.0.0/8,europe,vm\n")
			.unwrap();
		// AWS loaded first and matches; azure never consulted.
		let hit = matcher.lookup(parse_ip("52.0.0.1").unwrap(), None, None).unwrap();
		assert_eq!(hit.provider.as_deref(), Some("aws"));
	}
}
