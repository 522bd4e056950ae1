//! Filesystem cache tier (L3).
//!
//! Long-TTL fallback storage, sharded so no directory grows unbounded:
//! IP keys shard per octet, hex digests shard by leading byte pairs, HIBP
//! range keys by their first two characters. Writes go to a temp file in the
//! target directory and are renamed into place, so readers never observe a
//! torn entry.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FsTierConfig {
	pub root: PathBuf,
	pub ttl: Duration,
}

impl FsTierConfig {
	/// Default root under the platform cache directory.
	pub fn default_root() -> PathBuf {
		dirs::cache_dir()
			.unwrap_or_else(std::env::temp_dir)
			.join("mimir")
			.join("enrichment")
	}
}

impl Default for FsTierConfig {
	fn default() -> Self {
		Self {
			root: Self::default_root(),
			ttl: Duration::from_secs(30 * 24 * 60 * 60),
		}
	}
}

pub struct FsCacheTier {
	config: FsTierConfig,
}

impl FsCacheTier {
	pub fn new(config: FsTierConfig) -> Self {
		Self { config }
	}

	/// Resolve the sharded path for a cache entry.
	pub fn entry_path(&self, service: &str, key: &str) -> PathBuf {
		let service_dir = self.config.root.join(sanitize_component(service));
		let filename = format!("{}.json", sanitize_component(key));

		if let Some(octets) = ip_octets(key) {
			let mut dir = service_dir;
			for octet in &octets[..octets.len() - 1] {
				dir = dir.join(octet);
			}
			return dir.join(format!("{}.json", octets[octets.len() - 1]));
		}
		if service.eq_ignore_ascii_case("hibp") && key.len() >= 2 {
			return service_dir.join(&key[..2].to_lowercase()).join(filename);
		}
		if is_hex_digest(key) {
			return service_dir
				.join(&key[..2].to_lowercase())
				.join(&key[2..4].to_lowercase())
				.join(filename);
		}
		let shard = sanitize_component(key);
		let prefix = if shard.len() >= 2 { &shard[..2] } else { "_" };
		service_dir.join(prefix).join(filename)
	}

	/// Read a cached entry; expired or unreadable entries are treated as
	/// misses (expired files are unlinked best-effort).
	pub fn get(&self, service: &str, key: &str) -> Option<Value> {
		let path = self.entry_path(service, key);
		let raw = fs::read_to_string(&path).ok()?;
		let envelope: Value = serde_json::from_str(&raw).ok()?;
		let stored_at = envelope
			.get("stored_at")
			.and_then(Value::as_str)
			.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
			.map(|dt| dt.with_timezone(&Utc))?;
		let age = Utc::now().signed_duration_since(stored_at);
		if age.num_seconds() < 0 || age.num_seconds() as u64 > self.config.ttl.as_secs() {
			debug!(service, key, "expired filesystem cache entry");
			let _ = fs::remove_file(&path);
			return None;
		}
		envelope.get("value").cloned()
	}

	/// Write-through store with atomic replace.
	pub fn store(&self, service: &str, key: &str, value: &Value) -> std::io::Result<()> {
		let path = self.entry_path(service, key);
		let dir = path.parent().expect("entry path always has a parent");
		fs::create_dir_all(dir)?;
		let envelope = json!({
			"stored_at": Utc::now().to_rfc3339(),
			"service": service,
			"key": key,
			"value": value,
		});
		let tmp = dir.join(format!(
			".{}.tmp",
			path.file_name().and_then(|n| n.to_str()).unwrap_or("entry")
		));
		fs::write(&tmp, envelope.to_string())?;
		fs::rename(&tmp, &path)?;
		Ok(())
	}

	pub fn root(&self) -> &Path {
		&self.config.root
	}
}

fn sanitize_component(raw: &str) -> String {
	let cleaned: String = raw
		.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
				c
			} else {
				'_'
			}
		})
		.collect();
	// A leading dot would allow hidden files or `..` traversal components.
	let trimmed = cleaned.trim_start_matches('.');
	if trimmed.is_empty() {
		"_".to_string()
	} else {
		trimmed.to_string()
	}
}

fn ip_octets(key: &str) -> Option<Vec<String>> {
	let parts: Vec<&str> = key.split('.').collect();
	if parts.len() != 4 {
		return None;
	}
	if parts.iter().all(|p| p.parse::<u8>().is_ok()) {
		Some(parts.iter().map(|p| p.to_string()).collect())
	} else {
		None
	}
}

fn is_hex_digest(key: &str) -> bool {
	key.len() >= 8 && key.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn tier(ttl: Duration) -> (tempfile::TempDir, FsCacheTier) {
		let dir = tempfile::tempdir().unwrap();
		let tier = FsCacheTier::new(FsTierConfig {
			root: dir.path().to_path_buf(),
			ttl,
		});
		(dir, tier)
	}

	#[test]
	fn ip_keys_shard_per_octet() {
		let (_dir, tier) = tier(Duration::from_secs(60));
		let path = tier.entry_path("dshield", "1.2.3.4");
		let rel: Vec<_> = path
			.strip_prefix(tier.root())
			.unwrap()
			.components()
			.map(|c| c.as_os_str().to_string_lossy().to_string())
			.collect();
		assert_eq!(rel, vec!["dshield", "1", "2", "3", "4.json"]);
	}

	#[test]
	fn hash_keys_shard_by_hex_fragments() {
		let (_dir, tier) = tier(Duration::from_secs(60));
		let path = tier.entry_path("virustotal", "ABCDEF0123456789");
		let rel: Vec<_> = path
			.strip_prefix(tier.root())
			.unwrap()
			.components()
			.map(|c| c.as_os_str().to_string_lossy().to_string())
			.collect();
		assert_eq!(rel[..3], ["virustotal", "ab", "cd"]);
	}

	#[test]
	fn hibp_keys_shard_by_first_two_chars() {
		let (_dir, tier) = tier(Duration::from_secs(60));
		let path = tier.entry_path("hibp", "5BAA6");
		let rel: Vec<_> = path
			.strip_prefix(tier.root())
			.unwrap()
			.components()
			.map(|c| c.as_os_str().to_string_lossy().to_string())
			.collect();
		assert_eq!(rel, vec!["hibp", "5b", "5BAA6.json"]);
	}

	#[test]
	fn store_then_get_round_trips() {
		let (_dir, tier) = tier(Duration::from_secs(60));
		let value = json!({"attacks": 12});
		tier.store("dshield", "1.2.3.4", &value).unwrap();
		assert_eq!(tier.get("dshield", "1.2.3.4"), Some(value));
	}

	#[test]
	fn expired_entries_miss_and_are_removed() {
		let (_dir, tier) = tier(Duration::from_secs(0));
		tier.store("dshield", "1.2.3.4", &json!({"attacks": 1})).unwrap();
		std::thread::sleep(std::time::Duration::from_millis(1100));
		assert_eq!(tier.get("dshield", "1.2.3.4"), None);
		assert!(!tier.entry_path("dshield", "1.2.3.4").exists());
	}

	#[test]
	fn hostile_keys_cannot_escape_the_root() {
		let (_dir, tier) = tier(Duration::from_secs(60));
		let path = tier.entry_path("dshield", "../../etc/passwd");
		assert!(path.starts_with(tier.root()));
	}
}
