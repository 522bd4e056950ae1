//! TOR exit node matcher.
//!
//! Matches against the Tor Project bulk exit list: a plain-text file with
//! one address per line, refreshed hourly. Lookups are set membership.

use std::collections::HashSet;
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
use crate::ipclass::trie::parse_ip;

pub const DEFAULT_TOR_URL: &str = "https://check.torproject.org/torbulkexitlist";

pub struct TorExitMatcher {
	state: RefreshState,
	data_url: String,
	exit_nodes: HashSet<IpAddr>,
}

impl TorExitMatcher {
	pub fn new(data_url: impl Into<String>, cache_dir: PathBuf) -> Self {
		Self {
			state: RefreshState::new(Duration::from_secs(60 * 60), cache_dir),
			data_url: data_url.into(),
			exit_nodes: HashSet::new(),
		}
	}

	/// Parse the plain-text exit list and replace the in-memory set.
	/// Exposed so tests (and the disk-cache path) can load without network.
	pub fn load_from_text(&mut self, text: &str) -> anyhow::Result<usize> {
		let nodes: HashSet<IpAddr> = text
			.lines()
			.filter_map(|line| parse_ip(line))
			.collect();
		if nodes.is_empty() {
			bail!("no valid addresses in TOR exit list");
		}
		let count = nodes.len();
		self.exit_nodes = nodes;
		self.state.mark_updated();
		Ok(count)
	}

	pub fn exit_node_count(&self) -> usize {
		self.exit_nodes.len()
	}
}

#[async_trait]
impl Matcher for TorExitMatcher {
	fn ip_type(&self) -> IpType {
		IpType::Tor
	}

	fn name(&self) -> &'static str {
		"tor_exit_nodes"
	}

	fn state(&self) -> &RefreshState {
		&self.state
	}

	fn state_mut(&mut self) -> &mut RefreshState {
		&mut self.state
	}

	async fn download(&mut self, fetcher: &HttpFetcher) -> anyhow::Result<()> {
		debug!(url = %self.data_url, "downloading TOR exit list");
		let body = fetcher
			.get_text(&self.data_url)
			.await
			.context("download TOR exit list")?;
		let count = self.load_from_text(&body)?;

		// Best-effort disk cache for operators inspecting state.
		let cache_file = self.state.cache_dir.join("tor_exit_nodes.txt");
		if let Some(parent) = cache_file.parent() {
			let _ = std::fs::create_dir_all(parent);
		}
		let _ = std::fs::write(&cache_file, &body);

		info!(count, "loaded TOR exit nodes");
		Ok(())
	}

	fn lookup(&self, ip: IpAddr, _asn: Option<i64>, _as_name: Option<&str>) -> Option<MatcherHit> {
		self.exit_nodes.contains(&ip).then(|| MatcherHit {
			provider: Some("tor".to_string()),
			confidence: 0.95,
			source: "tor_bulk_list".to_string(),
			metadata: json!({}),
		})
	}
}
