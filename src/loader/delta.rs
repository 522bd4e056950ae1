//! Incremental ingestion with per-source cursors.
//!
//! The delta loader wraps the bulk pipeline and only processes events past
//! the recorded cursor for each source. File rotation (inode change) and
//! truncate-and-rewrite (same inode, different offset-0 payload hash) both
//! bump the generation counter and re-ingest the file from the top, keeping
//! the natural key unique across the file's successive lives.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::db::models::IngestCursor;
use crate::db::{SqlParam, Store, StoreResult};
use crate::dlq::DeadLetterInsert;
use crate::enrich::SessionEnricher;
use crate::event::reader::{source_inode, EventReader};
use crate::event::sanitize::payload_hash;
use crate::loader::aggregate::SessionAggregator;
use crate::loader::bulk::{display_path, BulkLoader, LoaderError};
use crate::loader::{DeltaLoaderConfig, LoaderCallbacks, LoaderMetrics};

/// Incremental loader that only ingests new events since the last run.
pub struct DeltaLoader<'a> {
	bulk: BulkLoader<'a>,
	config: DeltaLoaderConfig,
}

impl<'a> DeltaLoader<'a> {
	pub fn new(store: &'a Store, config: DeltaLoaderConfig) -> Self {
		let bulk = BulkLoader::new(store, config.bulk.clone());
		Self { bulk, config }
	}

	pub fn with_enricher(mut self, enricher: &'a dyn SessionEnricher) -> Self {
		self.bulk = self.bulk.with_enricher(enricher);
		self
	}

	pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
		self.bulk = self.bulk.with_cancel_flag(cancel);
		self
	}

	fn store(&self) -> &'a Store {
		self.bulk.store()
	}

	/// Process only new events from the provided sources and return metrics.
	pub async fn load_paths(
		&self,
		sources: &[PathBuf],
		ingest_id: Option<String>,
		callbacks: &LoaderCallbacks<'_>,
	) -> Result<LoaderMetrics, LoaderError> {
		let ingest_ref = ingest_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
		let mut metrics = LoaderMetrics::new(&ingest_ref);
		let started = Instant::now();

		let span = info_span!("mimir.delta.load", ingest_id = %ingest_ref, sources = sources.len());
		async {
			for source in sources {
				if self.bulk.cancelled() {
					break;
				}
				self.load_file(source, &ingest_ref, &mut metrics, callbacks).await?;
			}
			Ok::<(), LoaderError>(())
		}
		.instrument(span)
		.await?;

		metrics.duration_seconds = started.elapsed().as_secs_f64();
		callbacks.emit_telemetry(&metrics);
		Ok(metrics)
	}

	async fn load_file(
		&self,
		source: &PathBuf,
		ingest_ref: &str,
		metrics: &mut LoaderMetrics,
		callbacks: &LoaderCallbacks<'_>,
	) -> Result<(), LoaderError> {
		let source_name = display_path(source);
		let span = info_span!("mimir.delta.file", source = %source_name);
		async {
			metrics.files_processed += 1;

			let stored_cursor = match self.load_cursor(&source_name).await? {
				Some(cursor) => Some(cursor),
				None => self.bootstrap_cursor(&source_name, ingest_ref).await?,
			};
			let current_inode = source_inode(source).map(|i| i.to_string());

			let mut generation = stored_cursor.as_ref().map_or(0, |c| c.generation);
			let mut last_offset = stored_cursor.as_ref().map_or(-1, |c| c.last_offset);
			let mut first_hash = stored_cursor.as_ref().and_then(|c| c.first_hash.clone());
			let cursor_inode = stored_cursor.as_ref().and_then(|c| c.inode.clone());

			// Rotation: the file on disk is not the file the cursor knew.
			let mut rotation = matches!(
				(&cursor_inode, &current_inode),
				(Some(old), Some(new)) if old != new
			);
			let mut generation_bumped = false;
			let initial_offset = last_offset;
			let initial_generation = generation;

			let reader = match EventReader::open(source, self.config.bulk.reader.clone()) {
				Ok(reader) => reader,
				Err(e) => {
					warn!(source = %source_name, error = %e, "skipping unreadable source");
					return Ok(());
				}
			};

			let mut pending = Vec::new();
			let mut aggregator = SessionAggregator::new();
			let mut dead_letters: Vec<DeadLetterInsert> = Vec::new();
			let mut telemetry_counter = 0usize;

			for item in reader {
				let (offset, payload) = match item {
					Ok(pair) => pair,
					Err(e) => {
						warn!(source = %source_name, error = %e, "read error; abandoning file");
						break;
					}
				};
				let processed = self.bulk.config().processor.process(payload);

				if offset == 0 {
					let hash = payload_hash(&processed.payload);
					if !rotation
						&& stored_cursor.is_some()
						&& first_hash.as_deref().map_or(false, |known| known != hash)
					{
						// Same inode, different first line: truncated and
						// rewritten in place.
						debug!(source = %source_name, "offset-0 hash changed; treating as rewrite");
						rotation = true;
					}
					first_hash = Some(hash);
				}

				if rotation && !generation_bumped {
					if !self.config.allow_inode_reset {
						warn!(source = %source_name, "rotation detected but inode reset disabled");
						return Ok(());
					}
					generation += 1;
					last_offset = -1;
					generation_bumped = true;
				}

				if offset <= last_offset {
					continue;
				}

				metrics.events_read += 1;
				self.bulk.gather(
					ingest_ref,
					&source_name,
					current_inode.clone(),
					generation,
					offset,
					processed,
					&mut pending,
					&mut aggregator,
					&mut dead_letters,
					metrics,
				);
				last_offset = offset;

				if pending.len() >= self.config.bulk.batch_size {
					self.bulk
						.flush_batch(&mut pending, &mut aggregator, &mut dead_letters, metrics, callbacks)
						.await?;
					self.save_cursor(
						&source_name,
						current_inode.clone(),
						last_offset,
						ingest_ref,
						generation,
						first_hash.clone(),
					)
					.await?;
					telemetry_counter += 1;
					if telemetry_counter % self.config.bulk.telemetry_interval.max(1) == 0 {
						callbacks.emit_telemetry(metrics);
					}
					if self.bulk.cancelled() {
						break;
					}
				}
			}

			if !pending.is_empty() || !dead_letters.is_empty() {
				self.bulk
					.flush_batch(&mut pending, &mut aggregator, &mut dead_letters, metrics, callbacks)
					.await?;
			}
			if last_offset > initial_offset || generation != initial_generation || stored_cursor.is_none()
			{
				self.save_cursor(
					&source_name,
					current_inode,
					last_offset,
					ingest_ref,
					generation,
					first_hash,
				)
				.await?;
			}
			Ok(())
		}
		.instrument(span)
		.await
	}

	async fn load_cursor(&self, source: &str) -> StoreResult<Option<IngestCursor>> {
		let row = self
			.store()
			.fetch_optional(
				"SELECT source, inode, last_offset, last_ingest_id, metadata
				 FROM ingest_cursors WHERE source = $1",
				&[SqlParam::Text(source.to_string())],
			)
			.await?;
		row.map(|r| IngestCursor::from_row(&r)).transpose()
	}

	/// First delta run against a database that bulk ingestion already
	/// populated: reconstruct the cursor from the stored events.
	async fn bootstrap_cursor(
		&self,
		source: &str,
		ingest_ref: &str,
	) -> StoreResult<Option<IngestCursor>> {
		let row = self
			.store()
			.fetch_optional(
				"SELECT source_inode, source_generation, MAX(source_offset) AS max_offset
				 FROM raw_events
				 WHERE source = $1
				 GROUP BY source_inode, source_generation
				 ORDER BY source_generation DESC
				 LIMIT 1",
				&[SqlParam::Text(source.to_string())],
			)
			.await?;
		let Some(row) = row else {
			return Ok(None);
		};
		let inode = row.opt_text("source_inode")?.filter(|s| !s.is_empty());
		let generation = row.i64("source_generation")?;
		let max_offset = row.opt_i64("max_offset")?.unwrap_or(-1);

		let first_hash = self
			.store()
			.fetch_optional(
				"SELECT payload_hash FROM raw_events
				 WHERE source = $1 AND source_generation = $2 AND source_offset = 0
				 LIMIT 1",
				&[SqlParam::Text(source.to_string()), SqlParam::I64(generation)],
			)
			.await?
			.map(|r| r.text("payload_hash"))
			.transpose()?;

		let cursor = IngestCursor {
			source: source.to_string(),
			inode,
			last_offset: max_offset,
			last_ingest_id: Some(ingest_ref.to_string()),
			generation,
			first_hash,
		};
		self.save_cursor(
			source,
			cursor.inode.clone(),
			cursor.last_offset,
			ingest_ref,
			cursor.generation,
			cursor.first_hash.clone(),
		)
		.await?;
		debug!(source = %source, offset = cursor.last_offset, generation = cursor.generation,
			"bootstrapped cursor from raw events");
		Ok(Some(cursor))
	}

	async fn save_cursor(
		&self,
		source: &str,
		inode: Option<String>,
		last_offset: i64,
		ingest_ref: &str,
		generation: i64,
		first_hash: Option<String>,
	) -> StoreResult<()> {
		let cursor = IngestCursor {
			source: source.to_string(),
			inode,
			last_offset,
			last_ingest_id: Some(ingest_ref.to_string()),
			generation,
			first_hash,
		};
		self.store()
			.execute(
				"INSERT INTO ingest_cursors
					(source, inode, last_offset, last_ingest_id, metadata, last_ingest_at)
				 VALUES ($1, $2, $3, $4, $5, $6)
				 ON CONFLICT (source) DO UPDATE SET
					inode = excluded.inode,
					last_offset = excluded.last_offset,
					last_ingest_id = excluded.last_ingest_id,
					metadata = excluded.metadata,
					last_ingest_at = excluded.last_ingest_at",
				&[
					SqlParam::Text(cursor.source.clone()),
					SqlParam::opt_text(cursor.inode.clone()),
					SqlParam::I64(cursor.last_offset),
					SqlParam::opt_text(cursor.last_ingest_id.clone()),
					SqlParam::Json(cursor.metadata()),
					SqlParam::Timestamp(Utc::now()),
				],
			)
			.await?;
		Ok(())
	}
}
