//! SSH key extraction from attacker command input.
//!
//! Attackers frequently persist access by appending public keys to
//! `authorized_keys`. One extractor serves both the ingest-time path (delta
//! loader folding keys into session aggregates) and the standalone backfill
//! command, so the two can never drift.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::db::{SqlParam, Store, StoreResult};

/// A public key found in a command, with its stable fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedSshKey {
	pub key_type: String,
	pub key_data: String,
	pub comment: Option<String>,
	/// SHA-256 hex over `<type> <base64 data>`; used as the dedup key in
	/// `session_summaries.unique_ssh_keys`.
	pub fingerprint: String,
}

pub struct SshKeyExtractor {
	key_re: Regex,
}

impl Default for SshKeyExtractor {
	fn default() -> Self {
		Self::new()
	}
}

impl SshKeyExtractor {
	pub fn new() -> Self {
		// Key type, base64 blob, optional comment up to a quote or delimiter.
		let key_re = Regex::new(
			r"(ssh-(?:rsa|dss|ed25519)|ecdsa-sha2-nistp(?:256|384|521))\s+([A-Za-z0-9+/=]{40,})(?:\s+([^\s\x22'>;|&]+))?",
		)
		.expect("ssh key regex compiles");
		Self { key_re }
	}

	/// True when the command is worth scanning at all.
	pub fn is_injection_candidate(&self, command: &str) -> bool {
		command.contains("authorized_keys")
	}

	/// Extract every plausible public key from a command string.
	///
	/// Only commands touching `authorized_keys` are scanned; echoing a key to
	/// stdout without persisting it is not an injection.
	pub fn extract_from_command(&self, command: &str) -> Vec<ExtractedSshKey> {
		if !self.is_injection_candidate(command) {
			return Vec::new();
		}
		self.key_re
			.captures_iter(command)
			.map(|caps| {
				let key_type = caps[1].to_string();
				let key_data = caps[2].to_string();
				let comment = caps.get(3).map(|m| m.as_str().to_string());
				let fingerprint = fingerprint(&key_type, &key_data);
				ExtractedSshKey {
					key_type,
					key_data,
					comment,
					fingerprint,
				}
			})
			.collect()
	}
}

fn fingerprint(key_type: &str, key_data: &str) -> String {
	let mut hasher = Sha256::new();
	hasher.update(key_type.as_bytes());
	hasher.update(b" ");
	hasher.update(key_data.as_bytes());
	let digest = hasher.finalize();
	digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Pull the command text out of a stored event payload. Defanged events
/// keep the attacker's original under `input_original`.
fn command_text(payload: &Value) -> Option<&str> {
	for field in ["input_original", "input", "command"] {
		if let Some(text) = payload.get(field).and_then(Value::as_str) {
			if !text.is_empty() {
				return Some(text);
			}
		}
	}
	None
}

/// Counts from one backfill pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshKeyBackfillReport {
	pub events_scanned: u64,
	pub injections_found: u64,
	pub sessions_updated: u64,
}

/// Recompute SSH key aggregates for every session from stored command
/// events, using the same extractor the delta loader runs at ingest time.
/// The recomputed values are authoritative and overwrite the summary row.
pub async fn backfill_session_keys(store: &Store) -> StoreResult<SshKeyBackfillReport> {
	let extractor = SshKeyExtractor::new();
	let mut report = SshKeyBackfillReport::default();
	let mut per_session: BTreeMap<String, (i64, BTreeSet<String>)> = BTreeMap::new();

	let mut cursor = 0i64;
	loop {
		let rows = store
			.fetch_all(
				"SELECT id, session_id, payload FROM raw_events
				 WHERE id > $1 AND event_type LIKE '%command%'
				 ORDER BY id LIMIT 500",
				&[SqlParam::I64(cursor)],
			)
			.await?;
		if rows.is_empty() {
			break;
		}
		for row in &rows {
			cursor = cursor.max(row.i64("id")?);
			report.events_scanned += 1;
			let Some(session_id) = row.opt_text("session_id")? else {
				continue;
			};
			let payload: Value = row.json("payload")?;
			let Some(command) = command_text(&payload) else {
				continue;
			};
			let keys = extractor.extract_from_command(command);
			if keys.is_empty() {
				continue;
			}
			report.injections_found += keys.len() as u64;
			let entry = per_session.entry(session_id).or_default();
			entry.0 += keys.len() as i64;
			for key in keys {
				entry.1.insert(key.fingerprint);
			}
		}
	}

	for (session_id, (injections, fingerprints)) in per_session {
		let updated = store
			.execute(
				"UPDATE session_summaries
				 SET ssh_key_injections = $1, unique_ssh_keys = $2
				 WHERE session_id = $3",
				&[
					SqlParam::I64(injections),
					SqlParam::Json(Value::Array(
						fingerprints.into_iter().map(Value::String).collect(),
					)),
					SqlParam::Text(session_id),
				],
			)
			.await?;
		report.sessions_updated += updated;
	}

	info!(
		events = report.events_scanned,
		injections = report.injections_found,
		sessions = report.sessions_updated,
		"ssh key backfill complete"
	);
	Ok(report)
}

/// Export every unique injected key with the sessions it appeared in.
pub async fn export_unique_keys(store: &Store) -> StoreResult<Vec<Value>> {
	let extractor = SshKeyExtractor::new();
	let mut keys: BTreeMap<String, (ExtractedSshKey, BTreeSet<String>)> = BTreeMap::new();

	let mut cursor = 0i64;
	loop {
		let rows = store
			.fetch_all(
				"SELECT id, session_id, payload FROM raw_events
				 WHERE id > $1 AND event_type LIKE '%command%'
				 ORDER BY id LIMIT 500",
				&[SqlParam::I64(cursor)],
			)
			.await?;
		if rows.is_empty() {
			break;
		}
		for row in &rows {
			cursor = cursor.max(row.i64("id")?);
			let session_id = row.opt_text("session_id")?.unwrap_or_default();
			let payload: Value = row.json("payload")?;
			let Some(command) = command_text(&payload) else {
				continue;
			};
			for key in extractor.extract_from_command(command) {
				let entry = keys
					.entry(key.fingerprint.clone())
					.or_insert_with(|| (key, BTreeSet::new()));
				if !session_id.is_empty() {
					entry.1.insert(session_id.clone());
				}
			}
		}
	}

	Ok(keys
		.into_values()
		.map(|(key, sessions)| {
			json!({
				"fingerprint": key.fingerprint,
				"key_type": key.key_type,
				"key_data": key.key_data,
				"comment": key.comment,
				"sessions": sessions.into_iter().collect::<Vec<_>>(),
			})
		})
		.collect())
}
