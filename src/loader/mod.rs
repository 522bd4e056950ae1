pub mod aggregate;
pub mod bulk;
pub mod delta;
pub mod snapshot;

use chrono::{DateTime, Utc};

use crate::event::reader::ReaderConfig;
use crate::event::EventProcessor;

/// Configuration knobs for the bulk loader.
#[derive(Debug, Clone)]
pub struct BulkLoaderConfig {
	pub batch_size: usize,
	/// An event at or above this risk score is quarantined.
	pub quarantine_threshold: i64,
	/// A flush whose summed risk reaches this counts as a quarantined batch
	/// (it still commits).
	pub batch_risk_threshold: i64,
	pub telemetry_interval: usize,
	pub processor: EventProcessor,
	pub reader: ReaderConfig,
}

impl Default for BulkLoaderConfig {
	fn default() -> Self {
		Self {
			batch_size: 500,
			quarantine_threshold: 80,
			batch_risk_threshold: 400,
			telemetry_interval: 5,
			processor: EventProcessor::default(),
			reader: ReaderConfig::default(),
		}
	}
}

/// Configuration for delta ingestion; wraps the bulk knobs with a smaller
/// default batch.
#[derive(Debug, Clone)]
pub struct DeltaLoaderConfig {
	pub bulk: BulkLoaderConfig,
	/// Process a rotated file from the top (generation bump). Disabling this
	/// freezes a rotated source until an operator intervenes.
	pub allow_inode_reset: bool,
}

impl Default for DeltaLoaderConfig {
	fn default() -> Self {
		Self {
			bulk: BulkLoaderConfig {
				batch_size: 200,
				..BulkLoaderConfig::default()
			},
			allow_inode_reset: true,
		}
	}
}

/// Telemetry accumulated while processing batches.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LoaderMetrics {
	pub ingest_id: String,
	pub files_processed: u64,
	pub events_read: u64,
	pub events_inserted: u64,
	pub events_quarantined: u64,
	pub events_invalid: u64,
	pub duplicates_skipped: u64,
	pub batches_committed: u64,
	pub batches_quarantined: u64,
	pub dead_letters: u64,
	pub last_source: Option<String>,
	pub last_offset: i64,
	pub duration_seconds: f64,
}

impl LoaderMetrics {
	pub fn new(ingest_id: impl Into<String>) -> Self {
		Self {
			ingest_id: ingest_id.into(),
			..Self::default()
		}
	}
}

/// Snapshot emitted after each committed batch.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LoaderCheckpoint {
	pub ingest_id: String,
	pub source: String,
	pub offset: i64,
	pub batch_index: u64,
	pub events_inserted: u64,
	pub events_quarantined: u64,
	pub sessions: Vec<String>,
	pub created_at: DateTime<Utc>,
}

/// Observer callbacks fired by the loaders. Both are optional and both are
/// called synchronously at flush boundaries, so implementations should be
/// cheap (the status emitter's atomic file write qualifies).
pub struct LoaderCallbacks<'a> {
	pub telemetry: Option<&'a (dyn Fn(&LoaderMetrics) + Send + Sync)>,
	pub checkpoint: Option<&'a (dyn Fn(&LoaderCheckpoint) + Send + Sync)>,
	pub dead_letter: Option<&'a (dyn Fn(u64, Option<&str>, Option<&str>) + Send + Sync)>,
}

impl Default for LoaderCallbacks<'_> {
	fn default() -> Self {
		Self {
			telemetry: None,
			checkpoint: None,
			dead_letter: None,
		}
	}
}

impl LoaderCallbacks<'_> {
	pub fn emit_telemetry(&self, metrics: &LoaderMetrics) {
		if let Some(cb) = self.telemetry {
			cb(metrics);
		}
	}

	pub fn emit_checkpoint(&self, checkpoint: &LoaderCheckpoint) {
		if let Some(cb) = self.checkpoint {
			cb(checkpoint);
		}
	}

	pub fn emit_dead_letters(&self, count: u64, reason: Option<&str>, source: Option<&str>) {
		if count == 0 {
			return;
		}
		if let Some(cb) = self.dead_letter {
			cb(count, reason, source);
		}
	}
}
