//! Row types and projections for the relational schema.
//!
//! Computed attributes (geo country, prioritized IP types) are explicit
//! functions over the stored enrichment document rather than properties on a
//! mapped row: callers ask the repository layer for what they need.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::db::{DbRow, StoreResult};

/// One raw event, ready for the batched UPSERT.
#[derive(Debug, Clone)]
pub struct RawEventRecord {
	pub ingest_id: String,
	pub source: String,
	pub source_offset: i64,
	/// Empty string when the platform exposes no inode; the natural-key
	/// uniqueness constraint requires a non-NULL value.
	pub source_inode: String,
	pub source_generation: i64,
	pub payload: Value,
	pub payload_hash: String,
	pub risk_score: i64,
	pub quarantined: bool,
	pub session_id: Option<String>,
	pub event_type: Option<String>,
	pub event_timestamp: Option<DateTime<Utc>>,
}

/// Cursor state for one source file.
#[derive(Debug, Clone)]
pub struct IngestCursor {
	pub source: String,
	pub inode: Option<String>,
	pub last_offset: i64,
	pub last_ingest_id: Option<String>,
	pub generation: i64,
	/// Payload hash of offset 0 in the current generation; a change without
	/// an inode change means the file was truncated and rewritten.
	pub first_hash: Option<String>,
}

impl IngestCursor {
	/// Serialize generation/first-hash into the cursor metadata document.
	pub fn metadata(&self) -> Value {
		let mut meta = json!({"generation": self.generation});
		if let Some(hash) = &self.first_hash {
			meta["first_hash"] = json!(hash);
		}
		meta
	}

	pub fn from_row(row: &DbRow) -> StoreResult<Self> {
		let metadata = row.opt_json("metadata")?.unwrap_or_else(|| json!({}));
		let generation = metadata
			.get("generation")
			.and_then(Value::as_i64)
			.unwrap_or(0);
		let first_hash = metadata
			.get("first_hash")
			.and_then(Value::as_str)
			.map(|s| s.to_string());
		Ok(Self {
			source: row.text("source")?,
			inode: row.opt_text("inode")?,
			last_offset: row.i64("last_offset")?,
			last_ingest_id: row.opt_text("last_ingest_id")?,
			generation,
			first_hash,
		})
	}
}

/// Fully decoded dead-letter row.
#[derive(Debug, Clone)]
pub struct DeadLetterRow {
	pub id: i64,
	pub ingest_id: Option<String>,
	pub source: Option<String>,
	pub source_offset: Option<i64>,
	pub reason: String,
	pub payload: Value,
	pub payload_checksum: Option<String>,
	pub retry_count: i64,
	pub error_history: Vec<Value>,
	pub processing_attempts: Vec<Value>,
	pub resolved: bool,
	pub resolved_at: Option<DateTime<Utc>>,
	pub resolution_method: Option<String>,
	pub idempotency_key: Option<String>,
	pub processing_lock: Option<String>,
	pub lock_expires_at: Option<DateTime<Utc>>,
	pub priority: i64,
	pub classification: Option<String>,
}

impl DeadLetterRow {
	pub fn from_row(row: &DbRow) -> StoreResult<Self> {
		let json_list = |value: Option<Value>| -> Vec<Value> {
			value
				.and_then(|v| v.as_array().cloned())
				.unwrap_or_default()
		};
		Ok(Self {
			id: row.i64("id")?,
			ingest_id: row.opt_text("ingest_id")?,
			source: row.opt_text("source")?,
			source_offset: row.opt_i64("source_offset")?,
			reason: row.text("reason")?,
			payload: row.json("payload")?,
			payload_checksum: row.opt_text("payload_checksum")?,
			retry_count: row.i64("retry_count")?,
			error_history: json_list(row.opt_json("error_history")?),
			processing_attempts: json_list(row.opt_json("processing_attempts")?),
			resolved: row.bool("resolved")?,
			resolved_at: row.opt_timestamp("resolved_at")?,
			resolution_method: row.opt_text("resolution_method")?,
			idempotency_key: row.opt_text("idempotency_key")?,
			processing_lock: row.opt_text("processing_lock")?,
			lock_expires_at: row.opt_timestamp("lock_expires_at")?,
			priority: row.i64("priority")?,
			classification: row.opt_text("classification")?,
		})
	}

	/// True while a non-expired processing lock is held.
	pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
		match (&self.processing_lock, self.lock_expires_at) {
			(Some(_), Some(expires)) => now < expires,
			_ => false,
		}
	}
}

/// Per-IP enrichment state of record.
#[derive(Debug, Clone)]
pub struct IpInventoryRow {
	pub ip_address: String,
	pub first_seen: Option<DateTime<Utc>>,
	pub last_seen: Option<DateTime<Utc>>,
	pub session_count: i64,
	pub enrichment: Option<Value>,
	pub current_asn: Option<String>,
	pub enrichment_updated_at: Option<DateTime<Utc>>,
}

impl IpInventoryRow {
	pub fn from_row(row: &DbRow) -> StoreResult<Self> {
		Ok(Self {
			ip_address: row.text("ip_address")?,
			first_seen: row.opt_timestamp("first_seen")?,
			last_seen: row.opt_timestamp("last_seen")?,
			session_count: row.i64("session_count")?,
			enrichment: row.opt_json("enrichment")?,
			current_asn: row.opt_text("current_asn")?,
			enrichment_updated_at: row.opt_timestamp("enrichment_updated_at")?,
		})
	}

	pub fn geo_country(&self) -> Option<String> {
		self.enrichment.as_ref().and_then(geo_country)
	}

	pub fn ip_types(&self) -> Vec<String> {
		self.enrichment.as_ref().map(ip_types).unwrap_or_default()
	}
}

/// Project the geolocation country out of an enrichment document.
///
/// DShield's AS country wins; SPUR's context country is the fallback. The
/// `XX` sentinel means "unknown" upstream and is treated as absent.
pub fn geo_country(enrichment: &Value) -> Option<String> {
	let candidates = [
		enrichment.pointer("/dshield/ascountry"),
		enrichment.pointer("/spur/country"),
	];
	for candidate in candidates.into_iter().flatten() {
		if let Some(country) = candidate.as_str() {
			let trimmed = country.trim();
			if !trimmed.is_empty() && trimmed != "XX" {
				return Some(trimmed.to_string());
			}
		}
	}
	None
}

fn type_priority(ip_type: &str) -> usize {
	match ip_type {
		"tor" => 0,
		"cloud" => 1,
		"datacenter" => 2,
		"residential" => 3,
		_ => 4,
	}
}

/// Project the prioritized list of IP types out of an enrichment document.
///
/// The classifier verdict leads; SPUR infrastructure hints follow. Output is
/// deduplicated and ordered by threat priority so `ip_types[0]` is always the
/// snapshot value.
pub fn ip_types(enrichment: &Value) -> Vec<String> {
	let mut types: Vec<String> = Vec::new();
	if let Some(primary) = enrichment
		.pointer("/ip_classification/ip_type")
		.and_then(Value::as_str)
	{
		types.push(primary.to_string());
	}
	if let Some(infrastructure) = enrichment
		.pointer("/spur/infrastructure")
		.and_then(Value::as_str)
	{
		let mapped = match infrastructure.to_ascii_lowercase().as_str() {
			"datacenter" | "hosting" => Some("datacenter"),
			"mobile" | "residential" => Some("residential"),
			_ => None,
		};
		if let Some(t) = mapped {
			types.push(t.to_string());
		}
	}
	types.sort_by_key(|t| type_priority(t));
	types.dedup();
	types
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cursor_metadata_round_trip() {
		let cursor = IngestCursor {
			source: "/var/log/cowrie.json".to_string(),
			inode: Some("42".to_string()),
			last_offset: 17,
			last_ingest_id: None,
			generation: 3,
			first_hash: Some("abc".to_string()),
		};
		let meta = cursor.metadata();
		assert_eq!(meta["generation"], 3);
		assert_eq!(meta["first_hash"], "abc");
	}

	#[test]
	fn geo_country_prefers_dshield_and_skips_sentinel() {
		let doc = json!({"dshield": {"ascountry": "NL"}, "spur": {"country": "US"}});
		assert_eq!(geo_country(&doc).as_deref(), Some("NL"));

		let sentinel = json!({"dshield": {"ascountry": "XX"}, "spur": {"country": "US"}});
		assert_eq!(geo_country(&sentinel).as_deref(), Some("US"));

		let empty = json!({"dshield": {"ascountry": "XX"}});
		assert_eq!(geo_country(&empty), None);
	}

	#[test]
	fn ip_types_are_priority_ordered_and_deduped() {
		let doc = json!({
			"ip_classification": {"ip_type": "residential"},
			"spur": {"infrastructure": "DATACENTER"},
		});
		assert_eq!(ip_types(&doc), vec!["datacenter", "residential"]);

		let dup = json!({
			"ip_classification": {"ip_type": "datacenter"},
			"spur": {"infrastructure": "hosting"},
		});
		assert_eq!(ip_types(&dup), vec!["datacenter"]);
	}
}
