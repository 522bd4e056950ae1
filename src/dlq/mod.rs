//! Dead-letter queue.
//!
//! Events that fail validation or trip the quarantine threshold are never
//! silently dropped: they land here with their payload preserved, an audit
//! trail of processing attempts, and row-level locks so concurrent
//! reprocessors cannot double-handle an event.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::models::DeadLetterRow;
use crate::db::{is_unique_violation, SqlParam, Store, StoreResult};
use crate::event::sanitize::canonical_json;
use crate::event::{EventProcessor, ProcessedEvent};

/// Reasons a record can be dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
	Validation,
	Quarantined,
}

impl DeadLetterReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Validation => "validation",
			Self::Quarantined => "quarantined",
		}
	}
}

/// One record headed for the queue.
#[derive(Debug, Clone)]
pub struct DeadLetterInsert {
	pub ingest_id: String,
	pub source: String,
	pub source_offset: i64,
	pub source_inode: Option<String>,
	pub reason: DeadLetterReason,
	pub payload: Value,
	pub classification: Option<String>,
	pub priority: i64,
}

impl DeadLetterInsert {
	pub fn new(
		ingest_id: &str,
		source: &str,
		source_offset: i64,
		source_inode: Option<String>,
		reason: DeadLetterReason,
		payload: Value,
	) -> Self {
		Self {
			ingest_id: ingest_id.to_string(),
			source: source.to_string(),
			source_offset,
			source_inode,
			reason,
			payload,
			classification: None,
			priority: 5,
		}
	}
}

/// Guarantee the stored payload is a non-empty object.
///
/// Malformed lines keep their raw text under `_malformed_content`; non-object
/// and empty payloads are wrapped with provenance markers.
pub fn prepare_payload(payload: &Value, reason: DeadLetterReason, now: DateTime<Utc>) -> Value {
	let wrap = |content: Value| {
		json!({
			"_dead_letter": true,
			"_reason": reason.as_str(),
			"_malformed_content": content,
			"_timestamp": now.to_rfc3339(),
		})
	};
	match payload {
		Value::Object(map) if map.is_empty() => wrap(Value::Null),
		Value::Object(map) => {
			if map.len() == 1 {
				if let Some(raw) = map.get("malformed") {
					return wrap(raw.clone());
				}
			}
			payload.clone()
		}
		other => wrap(other.clone()),
	}
}

fn sha256_hex(bytes: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(bytes);
	hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

/// SHA-256 over the canonical payload JSON; stored beside the payload so
/// tampering or corruption is detectable later.
pub fn payload_checksum(payload: &Value) -> String {
	sha256_hex(canonical_json(payload).as_bytes())
}

/// Deterministic reprocessing key for one dead-lettered event.
pub fn idempotency_key(source: &str, source_offset: i64, checksum: &str) -> String {
	sha256_hex(format!("{}:{}:{}", source, source_offset, checksum).as_bytes())
}

pub struct DeadLetterQueue<'a> {
	store: &'a Store,
}

impl<'a> DeadLetterQueue<'a> {
	pub fn new(store: &'a Store) -> Self {
		Self { store }
	}

	/// Insert a batch, preferring one statement and falling back to per-row
	/// inserts when an integrity error spoils the batch.
	pub async fn insert_batch(&self, records: &[DeadLetterInsert]) -> StoreResult<u64> {
		if records.is_empty() {
			return Ok(0);
		}
		match self.insert_batch_once(records).await {
			Ok(count) => Ok(count),
			Err(e) if is_unique_violation(&e) => {
				warn!("dead letter batch hit an integrity error; retrying per row");
				let mut inserted = 0;
				for record in records {
					match self.insert_one(record).await {
						Ok(()) => inserted += 1,
						Err(e) if is_unique_violation(&e) => {
							debug!(source = %record.source, offset = record.source_offset,
								"skipping duplicate dead letter");
						}
						Err(e) => return Err(e),
					}
				}
				Ok(inserted)
			}
			Err(e) => Err(e),
		}
	}

	async fn insert_batch_once(&self, records: &[DeadLetterInsert]) -> StoreResult<u64> {
		let now = Utc::now();
		let mut total = 0u64;
		// Nine columns per row; chunk to stay well below driver bind limits.
		for chunk in records.chunks(100) {
			let values = crate::db::values_placeholders(1, chunk.len(), 9);
			let sql = format!(
				"INSERT INTO dead_letter_events
					(ingest_id, source, source_offset, source_inode, reason, payload,
					 payload_checksum, priority, created_at)
				 VALUES {values}"
			);
			let mut params = Vec::with_capacity(chunk.len() * 9);
			for record in chunk {
				let payload = prepare_payload(&record.payload, record.reason, now);
				let checksum = payload_checksum(&payload);
				params.push(SqlParam::Text(record.ingest_id.clone()));
				params.push(SqlParam::Text(record.source.clone()));
				params.push(SqlParam::I64(record.source_offset));
				params.push(SqlParam::opt_text(record.source_inode.clone()));
				params.push(SqlParam::Text(record.reason.as_str().to_string()));
				params.push(SqlParam::Json(payload));
				params.push(SqlParam::Text(checksum));
				params.push(SqlParam::I64(record.priority));
				params.push(SqlParam::Timestamp(now));
			}
			total += self.store.execute(&sql, &params).await?;
		}
		Ok(total)
	}

	async fn insert_one(&self, record: &DeadLetterInsert) -> StoreResult<()> {
		let now = Utc::now();
		let payload = prepare_payload(&record.payload, record.reason, now);
		let checksum = payload_checksum(&payload);
		self.store
			.execute(
				"INSERT INTO dead_letter_events
					(ingest_id, source, source_offset, source_inode, reason, payload,
					 payload_checksum, classification, priority, created_at)
				 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
				&[
					SqlParam::Text(record.ingest_id.clone()),
					SqlParam::Text(record.source.clone()),
					SqlParam::I64(record.source_offset),
					SqlParam::opt_text(record.source_inode.clone()),
					SqlParam::Text(record.reason.as_str().to_string()),
					SqlParam::Json(payload),
					SqlParam::Text(checksum),
					SqlParam::opt_text(record.classification.clone()),
					SqlParam::I64(record.priority),
					SqlParam::Timestamp(now),
				],
			)
			.await?;
		Ok(())
	}

	pub async fn fetch(&self, id: i64) -> StoreResult<Option<DeadLetterRow>> {
		let row = self
			.store
			.fetch_optional(
				"SELECT * FROM dead_letter_events WHERE id = $1",
				&[SqlParam::I64(id)],
			)
			.await?;
		row.map(|r| DeadLetterRow::from_row(&r)).transpose()
	}

	/// Unresolved events, highest priority first, oldest first within a
	/// priority band.
	pub async fn fetch_unresolved(&self, limit: i64) -> StoreResult<Vec<DeadLetterRow>> {
		let rows = self
			.store
			.fetch_all(
				"SELECT * FROM dead_letter_events
				 WHERE resolved = $1
				 ORDER BY priority ASC, id ASC
				 LIMIT $2",
				&[SqlParam::Bool(false), SqlParam::I64(limit)],
			)
			.await?;
		rows.iter().map(DeadLetterRow::from_row).collect()
	}

	/// Claim an event for processing. Fails (returns `None`) while another
	/// non-expired lock exists.
	pub async fn acquire_lock(&self, id: i64, ttl_minutes: i64) -> StoreResult<Option<String>> {
		let lock_id = Uuid::new_v4().to_string();
		let now = Utc::now();
		let expires = now + Duration::minutes(ttl_minutes);
		let updated = self
			.store
			.execute(
				"UPDATE dead_letter_events
				 SET processing_lock = $1, lock_expires_at = $2, updated_at = $3
				 WHERE id = $4
				   AND (processing_lock IS NULL OR lock_expires_at IS NULL OR lock_expires_at < $5)",
				&[
					SqlParam::Text(lock_id.clone()),
					SqlParam::Timestamp(expires),
					SqlParam::Timestamp(now),
					SqlParam::I64(id),
					SqlParam::Timestamp(now),
				],
			)
			.await?;
		Ok((updated > 0).then_some(lock_id))
	}

	pub async fn release_lock(&self, id: i64, lock_id: &str) -> StoreResult<bool> {
		let updated = self
			.store
			.execute(
				"UPDATE dead_letter_events
				 SET processing_lock = NULL, lock_expires_at = NULL, updated_at = $1
				 WHERE id = $2 AND processing_lock = $3",
				&[
					SqlParam::Timestamp(Utc::now()),
					SqlParam::I64(id),
					SqlParam::Text(lock_id.to_string()),
				],
			)
			.await?;
		Ok(updated > 0)
	}

	/// Append an attempt record to the audit trail.
	pub async fn record_attempt(
		&self,
		id: i64,
		method: &str,
		success: bool,
		duration_ms: Option<i64>,
	) -> StoreResult<()> {
		let Some(row) = self.fetch(id).await? else {
			return Ok(());
		};
		let mut attempts = row.processing_attempts;
		attempts.push(json!({
			"timestamp": Utc::now().to_rfc3339(),
			"method": method,
			"success": success,
			"processing_time_ms": duration_ms,
			"retry_count": row.retry_count,
		}));
		self.store
			.execute(
				"UPDATE dead_letter_events SET processing_attempts = $1, updated_at = $2 WHERE id = $3",
				&[
					SqlParam::Json(Value::Array(attempts)),
					SqlParam::Timestamp(Utc::now()),
					SqlParam::I64(id),
				],
			)
			.await?;
		Ok(())
	}

	/// Append to the error history and bump the retry counter.
	pub async fn record_error(
		&self,
		id: i64,
		error_type: &str,
		message: &str,
		method: &str,
	) -> StoreResult<()> {
		let Some(row) = self.fetch(id).await? else {
			return Ok(());
		};
		let mut history = row.error_history;
		history.push(json!({
			"timestamp": Utc::now().to_rfc3339(),
			"error_type": error_type,
			"error_message": message,
			"processing_method": method,
			"retry_count": row.retry_count,
		}));
		self.store
			.execute(
				"UPDATE dead_letter_events
				 SET error_history = $1, retry_count = retry_count + 1,
				     last_processed_at = $2, updated_at = $3
				 WHERE id = $4",
				&[
					SqlParam::Json(Value::Array(history)),
					SqlParam::Timestamp(Utc::now()),
					SqlParam::Timestamp(Utc::now()),
					SqlParam::I64(id),
				],
			)
			.await?;
		Ok(())
	}

	/// Resolve an event and clear its lock.
	pub async fn mark_resolved(&self, id: i64, method: &str) -> StoreResult<()> {
		self.store
			.execute(
				"UPDATE dead_letter_events
				 SET resolved = $1, resolved_at = $2, resolution_method = $3,
				     processing_lock = NULL, lock_expires_at = NULL, updated_at = $4
				 WHERE id = $5",
				&[
					SqlParam::Bool(true),
					SqlParam::Timestamp(Utc::now()),
					SqlParam::Text(method.to_string()),
					SqlParam::Timestamp(Utc::now()),
					SqlParam::I64(id),
				],
			)
			.await?;
		Ok(())
	}

	/// Generate (or return) the deterministic idempotency key for an event.
	pub async fn ensure_idempotency_key(&self, id: i64) -> StoreResult<Option<String>> {
		let Some(row) = self.fetch(id).await? else {
			return Ok(None);
		};
		if let Some(existing) = row.idempotency_key {
			return Ok(Some(existing));
		}
		let checksum = row
			.payload_checksum
			.unwrap_or_else(|| payload_checksum(&row.payload));
		let key = idempotency_key(
			row.source.as_deref().unwrap_or(""),
			row.source_offset.unwrap_or(0),
			&checksum,
		);
		self.store
			.execute(
				"UPDATE dead_letter_events SET idempotency_key = $1, updated_at = $2 WHERE id = $3",
				&[
					SqlParam::Text(key.clone()),
					SqlParam::Timestamp(Utc::now()),
					SqlParam::I64(id),
				],
			)
			.await?;
		Ok(Some(key))
	}

	/// Recompute the payload checksum and compare it to the stored value.
	pub fn checksum_valid(row: &DeadLetterRow) -> bool {
		match &row.payload_checksum {
			Some(stored) => payload_checksum(&row.payload) == *stored,
			None => true,
		}
	}

	pub async fn unresolved_count(&self) -> StoreResult<i64> {
		let row = self
			.store
			.fetch_optional(
				"SELECT COUNT(*) AS n FROM dead_letter_events WHERE resolved = $1",
				&[SqlParam::Bool(false)],
			)
			.await?;
		Ok(row.map(|r| r.i64("n")).transpose()?.unwrap_or(0))
	}

	/// Replay unresolved events through the normal processing pipeline.
	///
	/// Each event is locked, re-validated, and — when it now parses clean —
	/// written to `raw_events` (generation 0, conflict-ignoring) and resolved.
	/// Events that still fail keep their lock released and gain an error
	/// record, so the retry counter reflects reality.
	pub async fn replay(
		&self,
		processor: &EventProcessor,
		limit: i64,
		lock_ttl_minutes: i64,
	) -> StoreResult<ReplayOutcome> {
		let mut outcome = ReplayOutcome::default();
		let candidates = self.fetch_unresolved(limit).await?;
		for row in candidates {
			let Some(lock_id) = self.acquire_lock(row.id, lock_ttl_minutes).await? else {
				outcome.locked += 1;
				continue;
			};
			if !Self::checksum_valid(&row) {
				self.record_error(row.id, "integrity", "payload checksum mismatch", "replay")
					.await?;
				self.release_lock(row.id, &lock_id).await?;
				outcome.failed += 1;
				continue;
			}
			let started = std::time::Instant::now();
			let processed = processor.process(row.payload.clone());
			let elapsed_ms = started.elapsed().as_millis() as i64;
			if processed.has_validation_errors() {
				self.record_attempt(row.id, "replay", false, Some(elapsed_ms)).await?;
				self.record_error(
					row.id,
					"validation",
					&describe_errors(&processed),
					"replay",
				)
				.await?;
				self.release_lock(row.id, &lock_id).await?;
				outcome.failed += 1;
				continue;
			}
			self.reinsert(&row, &processed).await?;
			self.record_attempt(row.id, "replay", true, Some(elapsed_ms)).await?;
			self.mark_resolved(row.id, "replay").await?;
			outcome.resolved += 1;
		}
		Ok(outcome)
	}

	async fn reinsert(&self, row: &DeadLetterRow, processed: &ProcessedEvent) -> StoreResult<()> {
		let conflict = "ON CONFLICT (source, source_inode, source_generation, source_offset) DO NOTHING";
		let sql = format!(
			"INSERT INTO raw_events
				(ingest_id, source, source_offset, source_inode, source_generation,
				 payload, payload_hash, risk_score, quarantined, session_id,
				 event_type, event_timestamp, ingested_at)
			 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) {conflict}"
		);
		self.store
			.execute(
				&sql,
				&[
					SqlParam::opt_text(row.ingest_id.clone()),
					SqlParam::opt_text(row.source.clone()),
					SqlParam::I64(row.source_offset.unwrap_or(0)),
					SqlParam::Text(String::new()),
					SqlParam::I64(0),
					SqlParam::Json(processed.payload.clone()),
					SqlParam::Text(crate::event::sanitize::payload_hash(&processed.payload)),
					SqlParam::I64(processed.risk_score),
					SqlParam::Bool(processed.quarantined),
					SqlParam::opt_text(processed.session_id.clone()),
					SqlParam::opt_text(processed.event_type.clone()),
					SqlParam::opt_timestamp(processed.event_timestamp),
					SqlParam::Timestamp(Utc::now()),
				],
			)
			.await?;
		Ok(())
	}
}

fn describe_errors(processed: &ProcessedEvent) -> String {
	processed
		.validation_errors
		.iter()
		.map(|e| e.as_str())
		.collect::<Vec<_>>()
		.join(", ")
}

/// Totals from one replay pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayOutcome {
	pub resolved: u64,
	pub failed: u64,
	pub locked: u64,
}
