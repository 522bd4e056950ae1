//! Datacenter/hosting range matcher.
//!
//! One community-maintained CSV (`cidr,hostmin,hostmax,vendor`) builds a
//! single unified trie; vendor names ride along as the provider metadata.
//! Weekly refresh — hosting allocations move slowly.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::enrich::providers::HttpFetcher;
use crate::ipclass::model::IpType;
use crate::ipclass::refresh::{Matcher, MatcherHit, RefreshState};
use crate::ipclass::trie::PrefixTrie;

pub const DEFAULT_DATACENTER_URL: &str =
	"https://raw.githubusercontent.com/jhassine/server-ip-addresses/master/data/datacenters.csv";

pub struct DatacenterMatcher {
	state: RefreshState,
	data_url: String,
	trie: PrefixTrie<String>,
}

impl DatacenterMatcher {
	pub fn new(data_url: impl Into<String>, cache_dir: PathBuf) -> Self {
		Self {
			state: RefreshState::new(Duration::from_secs(7 * 24 * 60 * 60), cache_dir),
			data_url: data_url.into(),
			trie: PrefixTrie::new(),
		}
	}

	/// Parse the unified CSV and replace the trie. Exposed for tests and
	/// disk-cache loads.
	pub fn load_from_csv(&mut self, csv_text: &str) -> anyhow::Result<usize> {
		let mut reader = csv::ReaderBuilder::new()
			.has_headers(true)
			.trim(csv::Trim::All)
			.from_reader(csv_text.as_bytes());
		let mut trie = PrefixTrie::new();
		for record in reader.records() {
			let record = record?;
			let Some(cidr) = record.get(0).filter(|c| !c.is_empty()) else {
				continue;
			};
			let vendor = record
				.get(3)
				.filter(|v| !v.is_empty())
				.unwrap_or("unknown")
				.to_string();
			if let Err(e) = trie.insert(cidr, vendor) {
				debug!(cidr, error = %e, "skipping invalid datacenter CIDR");
			}
		}
		if trie.is_empty() {
			bail!("no valid CIDRs parsed from datacenter CSV");
		}
		let count = trie.len();
		self.trie = trie;
		self.state.mark_updated();
		Ok(count)
	}

	pub fn cidr_count(&self) -> usize {
		self.trie.len()
	}
}

#[async_trait]
impl Matcher for DatacenterMatcher {
	fn ip_type(&self) -> IpType {
		IpType::Datacenter
	}

	fn name(&self) -> &'static str {
		"datacenter_ranges"
	}

	fn state(&self) -> &RefreshState {
		&self.state
	}

	fn state_mut(&mut self) -> &mut RefreshState {
		&mut self.state
	}

	async fn download(&mut self, fetcher: &HttpFetcher) -> anyhow::Result<()> {
		let body = fetcher
			.get_text(&self.data_url)
			.await
			.context("download datacenter ranges")?;
		let cache_file = self.state.cache_dir.join("datacenters.csv");
		if let Some(parent) = cache_file.parent() {
			let _ = std::fs::create_dir_all(parent);
		}
		let _ = std::fs::write(&cache_file, &body);
		let count = self.load_from_csv(&body)?;
		info!(cidrs = count, "datacenter ranges loaded");
		Ok(())
	}

	fn lookup(&self, ip: IpAddr, _asn: Option<i64>, _as_name: Option<&str>) -> Option<MatcherHit> {
		self.trie.longest_match(ip).map(|vendor| MatcherHit {
			provider: Some(vendor.clone()),
			confidence: 0.75,
			source: "datacenter_community_lists".to_string(),
			metadata: json!({"vendor": vendor}),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ipclass::trie::parse_ip;

	const CSV: &str = "cidr,hostmin,hostmax,vendor\n\
104.236.0.0/16,104.236.0.1,104.236.255.254,digitalocean\n\
5.9.0.0/16,5.9.0.1,5.9.255.254,hetzner\n";

	#[test]
	fn matches_vendor_ranges() {
		let dir = tempfile::tempdir().unwrap();
		let mut matcher = DatacenterMatcher::new(DEFAULT_DATACENTER_URL, dir.path().to_path_buf());
		assert_eq!(matcher.load_from_csv(CSV).unwrap(), 2);
		assert_eq!(matcher.cidr_count(), 2);

		let hit = matcher.lookup(parse_ip("104.236.1.1").unwrap(), None, None).unwrap();
		assert_eq!(hit.provider.as_deref(), Some("digitalocean"));
		assert_eq!(hit.confidence, 0.75);
		assert_eq!(hit.source, "datacenter_community_lists");
		assert!(matcher.lookup(parse_ip("8.8.8.8").unwrap(), None, None).is_none());
	}

	#[test]
	fn header_only_csv_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let mut matcher = DatacenterMatcher::new(DEFAULT_DATACENTER_URL, dir.path().to_path_buf());
		assert!(matcher.load_from_csv("cidr,hostmin,hostmax,vendor\n").is_err());
	}
}
