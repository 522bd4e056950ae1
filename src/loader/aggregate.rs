//! Per-batch session aggregation.
//!
//! Events are folded into rolling aggregates keyed by session id; each flush
//! merges the batch deltas into `session_summaries` and resets the map.
//! Aggregates only ever hold one batch's worth of state, so there is no
//! back-pointer from sessions to events anywhere in memory.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::enrich::ssh_keys::SshKeyExtractor;
use crate::event::scoring::{is_command_event, is_file_event, is_login_event};
use crate::event::ProcessedEvent;

/// Rolling aggregate for one session within the current batch.
#[derive(Debug, Clone, Default)]
pub struct SessionAggregate {
	pub event_count: i64,
	pub command_count: i64,
	pub file_downloads: i64,
	pub login_attempts: i64,
	pub first_event_at: Option<DateTime<Utc>>,
	pub last_event_at: Option<DateTime<Utc>>,
	pub highest_risk: i64,
	pub source_files: BTreeSet<String>,
	pub matcher: Option<String>,
	pub source_ip: Option<String>,
	pub ssh_key_injections: i64,
	pub unique_ssh_keys: BTreeSet<String>,
}

impl SessionAggregate {
	fn update_timestamp(&mut self, ts: Option<DateTime<Utc>>) {
		let Some(ts) = ts else { return };
		if self.first_event_at.map_or(true, |first| ts < first) {
			self.first_event_at = Some(ts);
		}
		if self.last_event_at.map_or(true, |last| ts > last) {
			self.last_event_at = Some(ts);
		}
	}
}

/// Batch-scoped aggregator shared by the bulk and delta loaders.
pub struct SessionAggregator {
	aggregates: BTreeMap<String, SessionAggregate>,
	ssh_keys: SshKeyExtractor,
}

impl Default for SessionAggregator {
	fn default() -> Self {
		Self::new()
	}
}

impl SessionAggregator {
	pub fn new() -> Self {
		Self {
			aggregates: BTreeMap::new(),
			ssh_keys: SshKeyExtractor::new(),
		}
	}

	/// Fold one processed event into its session aggregate.
	pub fn fold(&mut self, processed: &ProcessedEvent, source: &str) {
		let Some(session_id) = processed.session_id.as_deref() else {
			return;
		};
		let agg = self.aggregates.entry(session_id.to_string()).or_default();
		agg.event_count += 1;

		if let Some(event_type) = processed.event_type.as_deref() {
			if is_command_event(event_type) {
				agg.command_count += 1;
			}
			if is_file_event(event_type) {
				agg.file_downloads += 1;
			}
			if is_login_event(event_type) {
				agg.login_attempts += 1;
			}
		}

		agg.update_timestamp(processed.event_timestamp);
		agg.highest_risk = agg.highest_risk.max(processed.risk_score);
		agg.source_files.insert(source.to_string());

		if agg.matcher.is_none() {
			agg.matcher = processed.sensor.clone();
		}
		// Canonical source IP for the session: first non-empty observation.
		if agg.source_ip.is_none() {
			agg.source_ip = processed.src_ip.clone();
		}

		if let Some(command) = processed.command.as_deref() {
			if processed
				.event_type
				.as_deref()
				.map_or(false, is_command_event)
				&& self.ssh_keys.is_injection_candidate(command)
			{
				let keys = self.ssh_keys.extract_from_command(command);
				if !keys.is_empty() {
					agg.ssh_key_injections += keys.len() as i64;
					for key in keys {
						agg.unique_ssh_keys.insert(key.fingerprint);
					}
				}
			}
		}
	}

	pub fn is_empty(&self) -> bool {
		self.aggregates.is_empty()
	}

	pub fn len(&self) -> usize {
		self.aggregates.len()
	}

	pub fn session_ids(&self) -> Vec<String> {
		self.aggregates.keys().cloned().collect()
	}

	/// Drain the batch's aggregates for a flush.
	pub fn take(&mut self) -> BTreeMap<String, SessionAggregate> {
		std::mem::take(&mut self.aggregates)
	}
}
