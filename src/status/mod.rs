//! Per-phase status files for external monitors.
//!
//! One JSON file per ingest phase, rewritten atomically (write to a temp
//! file, rename over the target) so a monitor reading mid-update never sees
//! a torn document. Updates are serialized by an internal lock.

use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::warn;

use crate::loader::{LoaderCheckpoint, LoaderMetrics};

pub struct StatusEmitter {
	phase: String,
	path: PathBuf,
	state: Mutex<EmitterState>,
}

struct EmitterState {
	document: Value,
	dead_letter_total: u64,
}

impl StatusEmitter {
	/// Create an emitter for one ingest phase; the status directory is
	/// created if missing.
	pub fn new(phase: &str, status_dir: &Path) -> std::io::Result<Self> {
		std::fs::create_dir_all(status_dir)?;
		let path = status_dir.join(format!("{phase}.json"));
		let document = json!({
			"phase": phase,
			"ingest_id": null,
			"last_updated": null,
			"metrics": {},
			"checkpoint": {},
			"dead_letter": {"total": 0},
		});
		Ok(Self {
			phase: phase.to_string(),
			path,
			state: Mutex::new(EmitterState {
				document,
				dead_letter_total: 0,
			}),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Persist the latest loader metrics snapshot.
	pub fn record_metrics(&self, metrics: &LoaderMetrics) {
		let mut state = self.state.lock();
		state.document["ingest_id"] = json!(metrics.ingest_id);
		state.document["metrics"] = serde_json::to_value(metrics).unwrap_or_else(|_| json!({}));
		state.document["last_updated"] = json!(Utc::now().to_rfc3339());
		self.write(&state);
	}

	/// Record the latest committed batch checkpoint.
	pub fn record_checkpoint(&self, checkpoint: &LoaderCheckpoint) {
		let mut state = self.state.lock();
		state.document["checkpoint"] =
			serde_json::to_value(checkpoint).unwrap_or_else(|_| json!({}));
		state.document["last_updated"] = json!(Utc::now().to_rfc3339());
		self.write(&state);
	}

	/// Increment dead-letter totals and note the latest failure context.
	pub fn record_dead_letters(&self, count: u64, last_reason: Option<&str>, last_source: Option<&str>) {
		if count == 0 {
			return;
		}
		let mut state = self.state.lock();
		state.dead_letter_total += count;
		state.document["dead_letter"] = json!({
			"total": state.dead_letter_total,
			"last_reason": last_reason,
			"last_source": last_source,
			"last_updated": Utc::now().to_rfc3339(),
		});
		self.write(&state);
	}

	/// Attach an arbitrary metrics subtree (cache stats, classifier stats).
	pub fn record_extra(&self, key: &str, value: Value) {
		let mut state = self.state.lock();
		state.document[key] = value;
		state.document["last_updated"] = json!(Utc::now().to_rfc3339());
		self.write(&state);
	}

	fn write(&self, state: &EmitterState) {
		let payload = state.document.to_string();
		let tmp = self.path.with_extension("tmp");
		let outcome = std::fs::write(&tmp, payload).and_then(|()| std::fs::rename(&tmp, &self.path));
		if let Err(e) = outcome {
			warn!(phase = %self.phase, error = %e, "failed to write status file");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;

	fn metrics() -> LoaderMetrics {
		let mut m = LoaderMetrics::new("ing-1");
		m.events_read = 10;
		m.events_inserted = 8;
		m
	}

	#[test]
	fn writes_and_updates_the_phase_file() {
		let dir = tempfile::tempdir().unwrap();
		let emitter = StatusEmitter::new("delta", dir.path()).unwrap();
		emitter.record_metrics(&metrics());

		let doc: Value =
			serde_json::from_str(&std::fs::read_to_string(emitter.path()).unwrap()).unwrap();
		assert_eq!(doc["phase"], "delta");
		assert_eq!(doc["ingest_id"], "ing-1");
		assert_eq!(doc["metrics"]["events_read"], 10);
		assert!(doc["last_updated"].is_string());
	}

	#[test]
	fn dead_letter_totals_accumulate() {
		let dir = tempfile::tempdir().unwrap();
		let emitter = StatusEmitter::new("delta", dir.path()).unwrap();
		emitter.record_dead_letters(2, Some("validation"), Some("log-a"));
		emitter.record_dead_letters(3, Some("quarantined"), Some("log-b"));
		emitter.record_dead_letters(0, None, None);

		let doc: Value =
			serde_json::from_str(&std::fs::read_to_string(emitter.path()).unwrap()).unwrap();
		assert_eq!(doc["dead_letter"]["total"], 5);
		assert_eq!(doc["dead_letter"]["last_reason"], "quarantined");
		assert_eq!(doc["dead_letter"]["last_source"], "log-b");
	}

	#[test]
	fn checkpoints_replace_previous_state() {
		let dir = tempfile::tempdir().unwrap();
		let emitter = StatusEmitter::new("bulk", dir.path()).unwrap();
		let checkpoint = LoaderCheckpoint {
			ingest_id: "ing-1".to_string(),
			source: "log-a".to_string(),
			offset: 42,
			batch_index: 3,
			events_inserted: 100,
			events_quarantined: 1,
			sessions: vec!["s1".to_string()],
			created_at: Utc::now(),
		};
		emitter.record_checkpoint(&checkpoint);

		let doc: Value =
			serde_json::from_str(&std::fs::read_to_string(emitter.path()).unwrap()).unwrap();
		assert_eq!(doc["checkpoint"]["offset"], 42);
		assert_eq!(doc["checkpoint"]["batch_index"], 3);
		assert!(!emitter.path().with_extension("tmp").exists());
	}
}
