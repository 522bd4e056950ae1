//! Residential ISP heuristic.
//!
//! No external data: the AS organization name is matched against telecom,
//! broadband and mobile patterns, with hosting/CDN exclusions checked first.
//! Confidence reflects how many strong indicators fire.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use regex::RegexSet;
use serde_json::json;

use crate::enrich::providers::HttpFetcher;
use crate::ipclass::model::IpType;
use crate::ipclass::refresh::{Matcher, MatcherHit, RefreshState};

const STRONG_PATTERNS: &[&str] = &[
	r"(?i)\b(verizon|at&t|att|comcast|xfinity|cox|charter|spectrum)\b",
	r"(?i)\b(telecom|telecommunications?|telco)\b",
	r"(?i)\b(broadband|cable|dsl|fiber)\b",
	r"(?i)\b(mobile|wireless|cellular|gsm|lte|5g)\b",
];

const WEAK_PATTERNS: &[&str] = &[
	r"(?i)\b(isp|internet service|network provider)\b",
	r"(?i)\b(residential|consumer|subscriber)\b",
];

const EXCLUSION_PATTERNS: &[&str] = &[
	r"(?i)\b(hosting|host|datacenter|data center|cloud|server|vps|dedicated)\b",
	r"(?i)\b(colo|colocation|facility)\b",
	r"(?i)\b(cdn|content delivery|edge|akamai|cloudflare|fastly)\b",
	r"(?i)\b(corporate|enterprise|business network)\b",
];

pub struct ResidentialHeuristic {
	state: RefreshState,
	strong: RegexSet,
	weak: RegexSet,
	exclusions: RegexSet,
}

impl ResidentialHeuristic {
	pub fn new() -> Self {
		// Static patterns, nothing to refresh; mark loaded immediately.
		let mut state = RefreshState::new(Duration::from_secs(u32::MAX as u64), PathBuf::new());
		state.mark_updated();
		Self {
			state,
			strong: RegexSet::new(STRONG_PATTERNS).expect("strong patterns compile"),
			weak: RegexSet::new(WEAK_PATTERNS).expect("weak patterns compile"),
			exclusions: RegexSet::new(EXCLUSION_PATTERNS).expect("exclusion patterns compile"),
		}
	}
}

impl Default for ResidentialHeuristic {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Matcher for ResidentialHeuristic {
	fn ip_type(&self) -> IpType {
		IpType::Residential
	}

	fn name(&self) -> &'static str {
		"residential_heuristic"
	}

	fn state(&self) -> &RefreshState {
		&self.state
	}

	fn state_mut(&mut self) -> &mut RefreshState {
		&mut self.state
	}

	async fn download(&mut self, _fetcher: &HttpFetcher) -> anyhow::Result<()> {
		Ok(())
	}

	fn lookup(&self, _ip: IpAddr, asn: Option<i64>, as_name: Option<&str>) -> Option<MatcherHit> {
		let as_name = as_name?.trim();
		if as_name.is_empty() || self.exclusions.is_match(as_name) {
			return None;
		}

		let strong_matches = self.strong.matches(as_name).iter().count();
		let (confidence, pattern_type) = if strong_matches >= 2 {
			(0.8, "strong_multiple")
		} else if strong_matches == 1 {
			(0.7, "strong_single")
		} else if self.weak.is_match(as_name) {
			(0.5, "weak")
		} else {
			return None;
		};

		Some(MatcherHit {
			provider: Some(as_name.to_string()),
			confidence,
			source: "asn_name_heuristic".to_string(),
			metadata: json!({
				"asn": asn,
				"as_name": as_name,
				"pattern_type": pattern_type,
			}),
		})
	}
}
