use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde_json::Value;

/// BLAKE2b with a 32-byte digest, the canonical payload hash for this crate.
type Blake2b256 = Blake2b<U32>;

/// Strip C0 control characters (except tab, LF, CR) and DEL from a string.
///
/// Live honeypot payloads routinely embed NUL bytes and terminal escapes;
/// stripping them here keeps every downstream consumer (SQL text columns,
/// JSON status files, log output) safe without altering printable content.
pub fn sanitize_text(input: &str) -> String {
	if !input.chars().any(is_stripped_control) {
		return input.to_string();
	}
	input.chars().filter(|c| !is_stripped_control(*c)).collect()
}

fn is_stripped_control(c: char) -> bool {
	(c < '\u{20}' && c != '\t' && c != '\n' && c != '\r') || c == '\u{7f}'
}

/// Recursively sanitize every string value (and key) in a JSON document.
///
/// Applied at ingestion before persisting payloads, before storing enrichment
/// results, and during file-metadata extraction. The same function backs the
/// retroactive `db sanitize` maintenance pass.
pub fn sanitize_value(value: &Value) -> Value {
	match value {
		Value::String(s) => Value::String(sanitize_text(s)),
		Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
		Value::Object(map) => Value::Object(
			map.iter()
				.map(|(k, v)| (sanitize_text(k), sanitize_value(v)))
				.collect(),
		),
		other => other.clone(),
	}
}

/// True when the document would be altered by [`sanitize_value`].
pub fn needs_sanitization(value: &Value) -> bool {
	match value {
		Value::String(s) => s.chars().any(is_stripped_control),
		Value::Array(items) => items.iter().any(needs_sanitization),
		Value::Object(map) => map
			.iter()
			.any(|(k, v)| k.chars().any(is_stripped_control) || needs_sanitization(v)),
		_ => false,
	}
}

/// Serialize a JSON document in canonical form: object keys sorted, compact
/// separators, no trailing whitespace.
///
/// `serde_json::Value` objects are backed by a `BTreeMap` in this crate
/// (the `preserve_order` feature is deliberately not enabled), so ordinary
/// serialization is already key-sorted; this function exists so callers never
/// hash a representation that depends on map iteration order.
pub fn canonical_json(value: &Value) -> String {
	serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// BLAKE2b-256 hex digest of the canonical JSON form of a payload.
pub fn payload_hash(value: &Value) -> String {
	hash_bytes(canonical_json(value).as_bytes())
}

/// BLAKE2b-256 hex digest of raw bytes (used for command input hashes).
pub fn hash_bytes(bytes: &[u8]) -> String {
	let mut hasher = Blake2b256::new();
	hasher.update(bytes);
	let digest = hasher.finalize();
	hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
	let mut out = String::with_capacity(bytes.len() * 2);
	for b in bytes {
		out.push_str(&format!("{:02x}", b));
	}
	out
}
