//! Point-in-time enrichment snapshots for sessions.
//!
//! When a session summary is first written, the loader captures what the
//! enrichment state of record (`ip_inventory`) said about the source IP at
//! that moment. Snapshot columns are written through `COALESCE` so the first
//! non-NULL value wins and later flushes can never rewrite history.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::db::models::IpInventoryRow;
use crate::db::{SqlParam, StoreResult, StoreTransaction};
use crate::loader::aggregate::SessionAggregate;

/// Snapshot values resolved for one source IP.
#[derive(Debug, Clone, Default)]
pub struct IpSnapshot {
	pub asn: Option<String>,
	pub country: Option<String>,
	pub ip_type: Option<String>,
}

/// Record first/last sightings and session counts for every source IP in the
/// batch. Runs inside the flush transaction so sightings commit atomically
/// with the sessions that produced them.
pub async fn record_ip_sightings(
	tx: &mut StoreTransaction<'_>,
	aggregates: &BTreeMap<String, SessionAggregate>,
) -> StoreResult<()> {
	// One batch row per IP: session count plus the observed time bounds.
	let mut per_ip: BTreeMap<&str, (i64, Option<chrono::DateTime<Utc>>, Option<chrono::DateTime<Utc>>)> =
		BTreeMap::new();
	for agg in aggregates.values() {
		let Some(ip) = agg.source_ip.as_deref() else {
			continue;
		};
		let entry = per_ip.entry(ip).or_insert((0, None, None));
		entry.0 += 1;
		if let Some(first) = agg.first_event_at {
			entry.1 = Some(entry.1.map_or(first, |cur| cur.min(first)));
		}
		if let Some(last) = agg.last_event_at {
			entry.2 = Some(entry.2.map_or(last, |cur| cur.max(last)));
		}
	}
	if per_ip.is_empty() {
		return Ok(());
	}

	let dialect = tx.dialect();
	let first_seen = dialect.least(
		"coalesce(ip_inventory.first_seen, excluded.first_seen)",
		"coalesce(excluded.first_seen, ip_inventory.first_seen)",
	);
	let last_seen = dialect.greatest(
		"coalesce(ip_inventory.last_seen, excluded.last_seen)",
		"coalesce(excluded.last_seen, ip_inventory.last_seen)",
	);
	let sql = format!(
		"INSERT INTO ip_inventory (ip_address, first_seen, last_seen, session_count)
		 VALUES ($1, $2, $3, $4)
		 ON CONFLICT (ip_address) DO UPDATE SET
			first_seen = {first_seen},
			last_seen = {last_seen},
			session_count = ip_inventory.session_count + excluded.session_count"
	);
	for (ip, (sessions, first, last)) in per_ip {
		tx.execute(
			&sql,
			&[
				SqlParam::Text(ip.to_string()),
				SqlParam::opt_timestamp(first),
				SqlParam::opt_timestamp(last),
				SqlParam::I64(sessions),
			],
		)
		.await?;
	}
	Ok(())
}

/// Batch-resolve snapshot values for the given IPs from `ip_inventory`.
///
/// Only IPs with recorded enrichment contribute; the `XX` country sentinel is
/// treated as unknown by the projection and surfaces as NULL.
pub async fn lookup_snapshots(
	tx: &mut StoreTransaction<'_>,
	ips: &[String],
) -> StoreResult<BTreeMap<String, IpSnapshot>> {
	let mut snapshots = BTreeMap::new();
	if ips.is_empty() {
		return Ok(snapshots);
	}
	for chunk in ips.chunks(200) {
		let placeholders = (1..=chunk.len())
			.map(|n| format!("${n}"))
			.collect::<Vec<_>>()
			.join(", ");
		let sql = format!(
			"SELECT ip_address, first_seen, last_seen, session_count, enrichment,
				current_asn, enrichment_updated_at
			 FROM ip_inventory WHERE ip_address IN ({placeholders})"
		);
		let params: Vec<SqlParam> = chunk.iter().map(|ip| SqlParam::Text(ip.clone())).collect();
		for row in tx.fetch_all(&sql, &params).await? {
			let inventory = IpInventoryRow::from_row(&row)?;
			let snapshot = IpSnapshot {
				asn: inventory.current_asn.clone(),
				country: inventory.geo_country(),
				ip_type: inventory.ip_types().into_iter().next(),
			};
			snapshots.insert(inventory.ip_address, snapshot);
		}
	}
	Ok(snapshots)
}
