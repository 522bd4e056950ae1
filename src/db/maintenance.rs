//! Database maintenance operations behind `mimir db ...`.
//!
//! The sanitization pass applies the same Unicode control-character
//! stripping the ingest path performs, retroactively, to rows that predate
//! it. Payload hashes are recomputed when a payload changes so the stored
//! hash always matches the stored document.

use serde_json::Value;
use tracing::info;

use crate::db::{SqlParam, Store, StoreResult};
use crate::event::sanitize::{needs_sanitization, payload_hash, sanitize_value};

/// Counts from one retroactive sanitization pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SanitizeReport {
	pub raw_events_scanned: u64,
	pub raw_events_updated: u64,
	pub summaries_scanned: u64,
	pub summaries_updated: u64,
}

/// Sanitize stored payloads and summary file lists in place.
pub async fn sanitize_existing(store: &Store, dry_run: bool) -> StoreResult<SanitizeReport> {
	let mut report = SanitizeReport::default();
	let mut cursor = 0i64;
	loop {
		let rows = store
			.fetch_all(
				"SELECT id, payload FROM raw_events WHERE id > $1 ORDER BY id LIMIT 500",
				&[SqlParam::I64(cursor)],
			)
			.await?;
		if rows.is_empty() {
			break;
		}
		for row in &rows {
			let id = row.i64("id")?;
			cursor = cursor.max(id);
			report.raw_events_scanned += 1;
			let payload: Value = row.json("payload")?;
			if !needs_sanitization(&payload) {
				continue;
			}
			report.raw_events_updated += 1;
			if dry_run {
				continue;
			}
			let clean = sanitize_value(&payload);
			store
				.execute(
					"UPDATE raw_events SET payload = $1, payload_hash = $2 WHERE id = $3",
					&[
						SqlParam::Json(clean.clone()),
						SqlParam::Text(payload_hash(&clean)),
						SqlParam::I64(id),
					],
				)
				.await?;
		}
	}

	let rows = store
		.fetch_all(
			"SELECT session_id, source_files FROM session_summaries WHERE source_files IS NOT NULL",
			&[],
		)
		.await?;
	for row in &rows {
		report.summaries_scanned += 1;
		let session_id = row.text("session_id")?;
		let Some(files) = row.opt_json("source_files")? else {
			continue;
		};
		if !needs_sanitization(&files) {
			continue;
		}
		report.summaries_updated += 1;
		if dry_run {
			continue;
		}
		store
			.execute(
				"UPDATE session_summaries SET source_files = $1 WHERE session_id = $2",
				&[SqlParam::Json(sanitize_value(&files)), SqlParam::Text(session_id)],
			)
			.await?;
	}

	info!(
		raw_updated = report.raw_events_updated,
		summaries_updated = report.summaries_updated,
		dry_run,
		"sanitization pass complete"
	);
	Ok(report)
}

/// Reclaim storage. Both supported engines accept a bare `VACUUM`.
pub async fn vacuum(store: &Store) -> StoreResult<()> {
	store.execute_unprepared("VACUUM").await
}

/// Basic table counts for `db verify` output.
pub async fn table_counts(store: &Store) -> StoreResult<Vec<(String, i64)>> {
	let mut counts = Vec::new();
	for table in [
		"raw_events",
		"session_summaries",
		"ingest_cursors",
		"dead_letter_events",
		"enrichment_cache",
		"ip_inventory",
	] {
		let sql = format!("SELECT COUNT(*) AS n FROM {table}");
		let n = store
			.fetch_optional(&sql, &[])
			.await?
			.map(|r| r.i64("n"))
			.transpose()?
			.unwrap_or(0);
		counts.push((table.to_string(), n));
	}
	Ok(counts)
}
