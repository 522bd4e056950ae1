//! Bulk loading pipeline that streams honeypot JSON lines into the schema.
//!
//! Two phases per file, interleaved by batch: gather events from the reader
//! into raw-event records and per-session aggregates, then flush each full
//! batch inside a single transaction (conflict-ignoring raw event insert,
//! merge-UPSERT of session summaries, snapshot population). Validation
//! failures divert to the dead-letter queue; quarantined events land in both
//! places.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use crate::db::models::RawEventRecord;
use crate::db::{
	is_unique_violation, values_placeholders, Dialect, SqlParam, Store, StoreError,
	StoreTransaction,
};
use crate::dlq::{DeadLetterInsert, DeadLetterQueue, DeadLetterReason};
use crate::enrich::{dshield_flagged, vt_flagged, SessionEnricher};
use crate::event::reader::{source_inode, EventReader};
use crate::event::sanitize::{payload_hash, sanitize_text};
use crate::event::ProcessedEvent;
use crate::loader::aggregate::{SessionAggregate, SessionAggregator};
use crate::loader::snapshot::{lookup_snapshots, record_ip_sightings, IpSnapshot};
use crate::loader::{BulkLoaderConfig, LoaderCallbacks, LoaderCheckpoint, LoaderMetrics};

#[derive(Debug, Error)]
pub enum LoaderError {
	#[error(transparent)]
	Store(#[from] StoreError),

	#[error("source {}: {source}", path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

/// Session-level enrichment flags resolved before a flush commits.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionFlags {
	pub vt_flagged: bool,
	pub dshield_flagged: bool,
	pub enriched_at: Option<DateTime<Utc>>,
}

/// Stream honeypot JSON lines into the structured schema.
pub struct BulkLoader<'a> {
	store: &'a Store,
	config: BulkLoaderConfig,
	enricher: Option<&'a dyn SessionEnricher>,
	cancel: Option<Arc<AtomicBool>>,
}

impl<'a> BulkLoader<'a> {
	pub fn new(store: &'a Store, config: BulkLoaderConfig) -> Self {
		Self {
			store,
			config,
			enricher: None,
			cancel: None,
		}
	}

	/// Attach an enrichment service; flushes will resolve session flags and
	/// enrichment timestamps through it (best effort, never fatal).
	pub fn with_enricher(mut self, enricher: &'a dyn SessionEnricher) -> Self {
		self.enricher = Some(enricher);
		self
	}

	/// Attach a cancellation flag. A set flag lets the in-flight flush
	/// commit, then the pipeline exits cleanly.
	pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
		self.cancel = Some(cancel);
		self
	}

	pub fn config(&self) -> &BulkLoaderConfig {
		&self.config
	}

	pub(crate) fn store(&self) -> &'a Store {
		self.store
	}

	pub(crate) fn cancelled(&self) -> bool {
		self.cancel
			.as_ref()
			.map_or(false, |flag| flag.load(Ordering::Relaxed))
	}

	/// Ingest a sequence of log files and return metrics.
	pub async fn load_paths(
		&self,
		sources: &[PathBuf],
		ingest_id: Option<String>,
		callbacks: &LoaderCallbacks<'_>,
	) -> Result<LoaderMetrics, LoaderError> {
		let ingest_ref = ingest_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
		let mut metrics = LoaderMetrics::new(&ingest_ref);
		let started = Instant::now();

		let span = info_span!("mimir.bulk.load", ingest_id = %ingest_ref, sources = sources.len());
		async {
			let mut pending: Vec<RawEventRecord> = Vec::new();
			let mut aggregator = SessionAggregator::new();
			let mut dead_letters: Vec<DeadLetterInsert> = Vec::new();
			let mut telemetry_counter = 0usize;

			'files: for source in sources {
				metrics.files_processed += 1;
				let source_name = source.display().to_string();
				let inode = source_inode(source).map(|i| i.to_string());
				let reader = match EventReader::open(source, self.config.reader.clone()) {
					Ok(reader) => reader,
					Err(e) => {
						warn!(source = %source_name, error = %e, "skipping unreadable source");
						continue;
					}
				};

				for item in reader {
					let (offset, payload) = match item {
						Ok(pair) => pair,
						Err(e) => {
							warn!(source = %source_name, error = %e, "read error; abandoning file");
							break;
						}
					};
					metrics.events_read += 1;
					let processed = self.config.processor.process(payload);
					self.gather(
						&ingest_ref,
						&source_name,
						inode.clone(),
						0,
						offset,
						processed,
						&mut pending,
						&mut aggregator,
						&mut dead_letters,
						&mut metrics,
					);

					if pending.len() >= self.config.batch_size {
						self.flush_batch(
							&mut pending,
							&mut aggregator,
							&mut dead_letters,
							&mut metrics,
							callbacks,
						)
						.await?;
						telemetry_counter += 1;
						if telemetry_counter % self.config.telemetry_interval.max(1) == 0 {
							callbacks.emit_telemetry(&metrics);
						}
						if self.cancelled() {
							break 'files;
						}
					}
				}
			}

			if !pending.is_empty() || !dead_letters.is_empty() {
				self.flush_batch(
					&mut pending,
					&mut aggregator,
					&mut dead_letters,
					&mut metrics,
					callbacks,
				)
				.await?;
			}
			Ok::<(), LoaderError>(())
		}
		.instrument(span)
		.await?;

		metrics.duration_seconds = started.elapsed().as_secs_f64();
		callbacks.emit_telemetry(&metrics);
		Ok(metrics)
	}

	/// Phase one: classify a processed event into the pending batch, the
	/// aggregates and/or the dead-letter buffer.
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn gather(
		&self,
		ingest_id: &str,
		source: &str,
		inode: Option<String>,
		generation: i64,
		offset: i64,
		processed: ProcessedEvent,
		pending: &mut Vec<RawEventRecord>,
		aggregator: &mut SessionAggregator,
		dead_letters: &mut Vec<DeadLetterInsert>,
		metrics: &mut LoaderMetrics,
	) {
		metrics.last_source = Some(source.to_string());
		metrics.last_offset = offset;

		if processed.has_validation_errors() {
			// Validation failures never reach raw_events.
			metrics.events_invalid += 1;
			dead_letters.push(DeadLetterInsert::new(
				ingest_id,
				source,
				offset,
				inode,
				DeadLetterReason::Validation,
				processed.payload,
			));
			return;
		}

		if processed.quarantined {
			metrics.events_quarantined += 1;
			dead_letters.push(DeadLetterInsert::new(
				ingest_id,
				source,
				offset,
				inode.clone(),
				DeadLetterReason::Quarantined,
				processed.payload.clone(),
			));
		}

		let record = RawEventRecord {
			ingest_id: ingest_id.to_string(),
			source: source.to_string(),
			source_offset: offset,
			source_inode: inode.unwrap_or_default(),
			source_generation: generation,
			payload_hash: payload_hash(&processed.payload),
			payload: processed.payload.clone(),
			risk_score: processed.risk_score,
			quarantined: processed.quarantined,
			session_id: processed.session_id.clone(),
			event_type: processed.event_type.clone(),
			event_timestamp: processed.event_timestamp,
		};
		aggregator.fold(&processed, source);
		pending.push(record);
	}

	/// Phase two: commit one batch atomically, then hand dead letters to the
	/// queue and fire the checkpoint callback.
	pub(crate) async fn flush_batch(
		&self,
		pending: &mut Vec<RawEventRecord>,
		aggregator: &mut SessionAggregator,
		dead_letters: &mut Vec<DeadLetterInsert>,
		metrics: &mut LoaderMetrics,
		callbacks: &LoaderCallbacks<'_>,
	) -> Result<(), LoaderError> {
		let records: Vec<RawEventRecord> = std::mem::take(pending);
		let aggregates = aggregator.take();
		let letters: Vec<DeadLetterInsert> = std::mem::take(dead_letters);
		let batch_index = metrics.batches_committed + 1;

		let span = info_span!(
			"mimir.bulk.flush",
			records = records.len(),
			sessions = aggregates.len(),
			batch = batch_index,
		);
		async {
			let batch_risk: i64 = records.iter().map(|r| r.risk_score).sum();
			if batch_risk >= self.config.batch_risk_threshold {
				metrics.batches_quarantined += 1;
			}

			// Enrichment happens before the transaction opens: network I/O
			// has no business inside a storage commit.
			let flags = self.resolve_session_flags(&aggregates).await;

			let inserted = match self.commit_batch(&records, &aggregates, &flags).await {
				Ok(inserted) => inserted,
				Err(e) if is_unique_violation(&e) => {
					warn!("batch insert hit an integrity error; replaying per row");
					self.commit_per_row(&records, &aggregates, &flags).await?
				}
				Err(e) => return Err(LoaderError::Store(e)),
			};

			metrics.events_inserted += inserted;
			metrics.duplicates_skipped += records.len() as u64 - inserted;
			metrics.batches_committed += 1;

			if !letters.is_empty() {
				let queue = DeadLetterQueue::new(self.store);
				let count = queue.insert_batch(&letters).await?;
				metrics.dead_letters += count;
				let last = letters.last();
				callbacks.emit_dead_letters(
					count,
					last.map(|l| l.reason.as_str()),
					last.map(|l| l.source.as_str()),
				);
			}

			if let Some(last_record) = records.last() {
				callbacks.emit_checkpoint(&LoaderCheckpoint {
					ingest_id: last_record.ingest_id.clone(),
					source: last_record.source.clone(),
					offset: last_record.source_offset,
					batch_index,
					events_inserted: inserted,
					events_quarantined: records.iter().filter(|r| r.quarantined).count() as u64,
					sessions: aggregates.keys().cloned().collect(),
					created_at: Utc::now(),
				});
			}
			Ok(())
		}
		.instrument(span)
		.await
	}

	async fn resolve_session_flags(
		&self,
		aggregates: &BTreeMap<String, SessionAggregate>,
	) -> BTreeMap<String, SessionFlags> {
		let mut flags = BTreeMap::new();
		let Some(enricher) = self.enricher else {
			return flags;
		};
		for (session_id, agg) in aggregates {
			let Some(src_ip) = agg.source_ip.as_deref() else {
				continue;
			};
			match enricher.enrich_session(session_id, src_ip).await {
				Ok(doc) => {
					flags.insert(
						session_id.clone(),
						SessionFlags {
							vt_flagged: vt_flagged(&doc),
							dshield_flagged: dshield_flagged(&doc),
							enriched_at: Some(Utc::now()),
						},
					);
				}
				Err(e) => {
					warn!(session = %session_id, error = %e, "session enrichment failed");
				}
			}
		}
		flags
	}

	async fn commit_batch(
		&self,
		records: &[RawEventRecord],
		aggregates: &BTreeMap<String, SessionAggregate>,
		flags: &BTreeMap<String, SessionFlags>,
	) -> Result<u64, StoreError> {
		let mut tx = self.store.begin().await?;
		let inserted = insert_raw_events(&mut tx, records).await?;
		record_ip_sightings(&mut tx, aggregates).await?;
		upsert_session_summaries(&mut tx, aggregates, flags).await?;
		tx.commit().await?;
		Ok(inserted)
	}

	async fn commit_per_row(
		&self,
		records: &[RawEventRecord],
		aggregates: &BTreeMap<String, SessionAggregate>,
		flags: &BTreeMap<String, SessionFlags>,
	) -> Result<u64, StoreError> {
		let mut tx = self.store.begin().await?;
		let mut inserted = 0u64;
		for record in records {
			inserted += insert_raw_events(&mut tx, std::slice::from_ref(record)).await?;
		}
		record_ip_sightings(&mut tx, aggregates).await?;
		upsert_session_summaries(&mut tx, aggregates, flags).await?;
		tx.commit().await?;
		Ok(inserted)
	}
}

/// Batched conflict-ignoring insert into `raw_events`. Returns the number of
/// rows actually inserted; the difference from the input length is the
/// duplicate count.
pub(crate) async fn insert_raw_events(
	tx: &mut StoreTransaction<'_>,
	records: &[RawEventRecord],
) -> Result<u64, StoreError> {
	if records.is_empty() {
		return Ok(0);
	}
	const COLS: usize = 13;
	let mut inserted = 0u64;
	for chunk in records.chunks(75) {
		let values = values_placeholders(1, chunk.len(), COLS);
		let sql = format!(
			"INSERT INTO raw_events
				(ingest_id, source, source_offset, source_inode, source_generation,
				 payload, payload_hash, risk_score, quarantined, session_id,
				 event_type, event_timestamp, ingested_at)
			 VALUES {values}
			 ON CONFLICT (source, source_inode, source_generation, source_offset) DO NOTHING"
		);
		let now = Utc::now();
		let mut params = Vec::with_capacity(chunk.len() * COLS);
		for record in chunk {
			params.push(SqlParam::Text(record.ingest_id.clone()));
			params.push(SqlParam::Text(record.source.clone()));
			params.push(SqlParam::I64(record.source_offset));
			params.push(SqlParam::Text(record.source_inode.clone()));
			params.push(SqlParam::I64(record.source_generation));
			params.push(SqlParam::Json(record.payload.clone()));
			params.push(SqlParam::Text(record.payload_hash.clone()));
			params.push(SqlParam::I64(record.risk_score));
			params.push(SqlParam::Bool(record.quarantined));
			params.push(SqlParam::opt_text(record.session_id.clone()));
			params.push(SqlParam::opt_text(record.event_type.clone()));
			params.push(SqlParam::opt_timestamp(record.event_timestamp));
			params.push(SqlParam::Timestamp(now));
		}
		inserted += tx.execute(&sql, &params).await?;
	}
	Ok(inserted)
}

/// Merge-UPSERT of per-session aggregates.
///
/// Counters merge additively, first-seen takes the minimum, last-seen and
/// risk take the maximum, `source_files` is overwritten with the sanitized
/// sorted set, flags latch on, and every snapshot column goes through
/// `COALESCE` so the first write wins.
pub(crate) async fn upsert_session_summaries(
	tx: &mut StoreTransaction<'_>,
	aggregates: &BTreeMap<String, SessionAggregate>,
	flags: &BTreeMap<String, SessionFlags>,
) -> Result<(), StoreError> {
	if aggregates.is_empty() {
		return Ok(());
	}

	let ips: Vec<String> = aggregates
		.values()
		.filter_map(|a| a.source_ip.clone())
		.collect();
	let snapshots = lookup_snapshots(tx, &ips).await?;
	let existing_keys = fetch_existing_ssh_keys(tx, aggregates).await?;

	let dialect = tx.dialect();
	let first_event = dialect.least(
		"coalesce(session_summaries.first_event_at, excluded.first_event_at)",
		"coalesce(excluded.first_event_at, session_summaries.first_event_at)",
	);
	let last_event = dialect.greatest(
		"coalesce(session_summaries.last_event_at, excluded.last_event_at)",
		"coalesce(excluded.last_event_at, session_summaries.last_event_at)",
	);
	let risk = dialect.greatest("session_summaries.risk_score", "excluded.risk_score");
	let (vt, dshield) = match dialect {
		Dialect::Sqlite => (
			"max(session_summaries.vt_flagged, excluded.vt_flagged)",
			"max(session_summaries.dshield_flagged, excluded.dshield_flagged)",
		),
		Dialect::Postgres => (
			"(session_summaries.vt_flagged OR excluded.vt_flagged)",
			"(session_summaries.dshield_flagged OR excluded.dshield_flagged)",
		),
	};

	let sql = format!(
		"INSERT INTO session_summaries
			(session_id, event_count, command_count, file_downloads, login_attempts,
			 first_event_at, last_event_at, risk_score, source_files, matcher,
			 vt_flagged, dshield_flagged, ssh_key_injections, unique_ssh_keys,
			 source_ip, snapshot_asn, snapshot_country, snapshot_ip_type,
			 enrichment_at, created_at, updated_at)
		 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
			 $15, $16, $17, $18, $19, $20, $21)
		 ON CONFLICT (session_id) DO UPDATE SET
			event_count = session_summaries.event_count + excluded.event_count,
			command_count = session_summaries.command_count + excluded.command_count,
			file_downloads = session_summaries.file_downloads + excluded.file_downloads,
			login_attempts = session_summaries.login_attempts + excluded.login_attempts,
			first_event_at = {first_event},
			last_event_at = {last_event},
			risk_score = {risk},
			source_files = excluded.source_files,
			matcher = coalesce(session_summaries.matcher, excluded.matcher),
			vt_flagged = {vt},
			dshield_flagged = {dshield},
			ssh_key_injections = session_summaries.ssh_key_injections + excluded.ssh_key_injections,
			unique_ssh_keys = excluded.unique_ssh_keys,
			source_ip = coalesce(session_summaries.source_ip, excluded.source_ip),
			snapshot_asn = coalesce(session_summaries.snapshot_asn, excluded.snapshot_asn),
			snapshot_country = coalesce(session_summaries.snapshot_country, excluded.snapshot_country),
			snapshot_ip_type = coalesce(session_summaries.snapshot_ip_type, excluded.snapshot_ip_type),
			enrichment_at = coalesce(session_summaries.enrichment_at, excluded.enrichment_at),
			updated_at = excluded.updated_at"
	);

	let now = Utc::now();
	for (session_id, agg) in aggregates {
		let source_files: Vec<String> = agg
			.source_files
			.iter()
			.map(|f| sanitize_text(f))
			.collect();
		let source_files_param = if source_files.is_empty() {
			SqlParam::Null
		} else {
			SqlParam::Json(Value::Array(
				source_files.into_iter().map(Value::String).collect(),
			))
		};

		// Union this batch's fingerprints with what the row already holds;
		// the set column is overwritten, so the union has to happen here.
		let mut keys = existing_keys.get(session_id).cloned().unwrap_or_default();
		keys.extend(agg.unique_ssh_keys.iter().cloned());
		let keys_param = if keys.is_empty() {
			SqlParam::Null
		} else {
			SqlParam::Json(Value::Array(keys.into_iter().map(Value::String).collect()))
		};

		let session_flags = flags.get(session_id).cloned().unwrap_or_default();
		let snapshot = agg
			.source_ip
			.as_ref()
			.and_then(|ip| snapshots.get(ip).cloned())
			.unwrap_or_else(IpSnapshot::default);

		tx.execute(
			&sql,
			&[
				SqlParam::Text(session_id.clone()),
				SqlParam::I64(agg.event_count),
				SqlParam::I64(agg.command_count),
				SqlParam::I64(agg.file_downloads),
				SqlParam::I64(agg.login_attempts),
				SqlParam::opt_timestamp(agg.first_event_at),
				SqlParam::opt_timestamp(agg.last_event_at),
				SqlParam::I64(agg.highest_risk),
				source_files_param,
				SqlParam::opt_text(agg.matcher.clone().map(|m| sanitize_text(&m))),
				SqlParam::Bool(session_flags.vt_flagged),
				SqlParam::Bool(session_flags.dshield_flagged),
				SqlParam::I64(agg.ssh_key_injections),
				keys_param,
				SqlParam::opt_text(agg.source_ip.clone()),
				SqlParam::opt_text(snapshot.asn),
				SqlParam::opt_text(snapshot.country),
				SqlParam::opt_text(snapshot.ip_type),
				SqlParam::opt_timestamp(session_flags.enriched_at),
				SqlParam::Timestamp(now),
				SqlParam::Timestamp(now),
			],
		)
		.await?;
	}
	Ok(())
}

async fn fetch_existing_ssh_keys(
	tx: &mut StoreTransaction<'_>,
	aggregates: &BTreeMap<String, SessionAggregate>,
) -> Result<BTreeMap<String, std::collections::BTreeSet<String>>, StoreError> {
	let mut out = BTreeMap::new();
	let with_keys: Vec<&String> = aggregates
		.iter()
		.filter(|(_, a)| !a.unique_ssh_keys.is_empty())
		.map(|(id, _)| id)
		.collect();
	if with_keys.is_empty() {
		return Ok(out);
	}
	for chunk in with_keys.chunks(200) {
		let placeholders = (1..=chunk.len())
			.map(|n| format!("${n}"))
			.collect::<Vec<_>>()
			.join(", ");
		let sql = format!(
			"SELECT session_id, unique_ssh_keys FROM session_summaries
			 WHERE session_id IN ({placeholders})"
		);
		let params: Vec<SqlParam> = chunk
			.iter()
			.map(|id| SqlParam::Text((*id).clone()))
			.collect();
		for row in tx.fetch_all(&sql, &params).await? {
			let session_id = row.text("session_id")?;
			let keys = row
				.opt_json("unique_ssh_keys")?
				.and_then(|v| v.as_array().cloned())
				.unwrap_or_default()
				.into_iter()
				.filter_map(|v| v.as_str().map(|s| s.to_string()))
				.collect();
			out.insert(session_id, keys);
		}
	}
	Ok(out)
}

/// Source path helper shared with the delta loader.
pub(crate) fn display_path(path: &Path) -> String {
	path.display().to_string()
}
