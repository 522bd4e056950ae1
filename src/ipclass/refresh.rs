//! The matcher seam: one interface per data source, plus shared refresh
//! bookkeeping.
//!
//! Matchers are not internally locked. Lookup on a loaded matcher is safe to
//! share; refresh mutates, so callers either keep per-task instances or
//! serialize refreshes externally (the classifier owns its matchers and does
//! exactly that).

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::enrich::providers::HttpFetcher;
use crate::ipclass::model::IpType;

/// Refresh bookkeeping shared by every downloadable matcher.
#[derive(Debug, Clone)]
pub struct RefreshState {
	pub last_update: Option<DateTime<Utc>>,
	pub update_interval: Duration,
	pub cache_dir: PathBuf,
	pub loaded: bool,
}

impl RefreshState {
	pub fn new(update_interval: Duration, cache_dir: PathBuf) -> Self {
		Self {
			last_update: None,
			update_interval,
			cache_dir,
			loaded: false,
		}
	}

	/// Data needs (re)loading: never loaded, or older than the interval.
	pub fn is_stale(&self) -> bool {
		if !self.loaded {
			return true;
		}
		match self.last_update {
			Some(at) => {
				let age = Utc::now().signed_duration_since(at);
				age.num_seconds() < 0 || age.num_seconds() as u64 > self.update_interval.as_secs()
			}
			None => true,
		}
	}

	pub fn mark_updated(&mut self) {
		self.last_update = Some(Utc::now());
		self.loaded = true;
	}

	pub fn age_seconds(&self) -> Option<i64> {
		self.last_update
			.map(|at| Utc::now().signed_duration_since(at).num_seconds())
	}
}

/// A successful match from one matcher.
#[derive(Debug, Clone)]
pub struct MatcherHit {
	pub provider: Option<String>,
	pub confidence: f64,
	pub source: String,
	pub metadata: Value,
}

/// One classification data source.
#[async_trait]
pub trait Matcher: Send + Sync {
	/// The category this matcher assigns on a hit.
	fn ip_type(&self) -> IpType;

	fn name(&self) -> &'static str;

	fn state(&self) -> &RefreshState;

	fn state_mut(&mut self) -> &mut RefreshState;

	/// Download and parse the source data, replacing in-memory structures.
	async fn download(&mut self, fetcher: &HttpFetcher) -> anyhow::Result<()>;

	/// Match an address against the loaded data. Must only be called on a
	/// loaded matcher.
	fn lookup(&self, ip: IpAddr, asn: Option<i64>, as_name: Option<&str>) -> Option<MatcherHit>;

	/// Refresh on demand when stale. A failed refresh with stale data in
	/// memory logs and continues; a failed initial load propagates.
	async fn ensure_fresh(&mut self, fetcher: &HttpFetcher) -> anyhow::Result<()> {
		if !self.state().is_stale() {
			return Ok(());
		}
		match self.download(fetcher).await {
			Ok(()) => {
				self.state_mut().mark_updated();
				Ok(())
			}
			Err(e) => {
				if self.state().loaded {
					warn!(
						matcher = self.name(),
						age_seconds = self.state().age_seconds(),
						error = %e,
						"refresh failed; continuing with stale data"
					);
					Ok(())
				} else {
					Err(e.context(format!(
						"{}: initial data load failed and no cache is available",
						self.name()
					)))
				}
			}
		}
	}

	/// Refresh statistics for telemetry.
	fn stats(&self) -> Value {
		let state = self.state();
		serde_json::json!({
			"matcher": self.name(),
			"data_loaded": state.loaded,
			"last_update": state.last_update.map(|t| t.to_rfc3339()),
			"is_stale": state.is_stale(),
			"age_seconds": state.age_seconds(),
			"update_interval_seconds": state.update_interval.as_secs(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fresh_state_is_stale_until_loaded() {
		let mut state = RefreshState::new(Duration::from_secs(3600), PathBuf::from("/tmp"));
		assert!(state.is_stale());
		state.mark_updated();
		assert!(!state.is_stale());
	}

	#[test]
	fn state_goes_stale_after_interval() {
		let mut state = RefreshState::new(Duration::from_secs(0), PathBuf::from("/tmp"));
		state.mark_updated();
		state.last_update = Some(Utc::now() - chrono::Duration::seconds(5));
		assert!(state.is_stale());
	}
}
