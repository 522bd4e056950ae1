//! External threat-intelligence provider clients.
//!
//! Each provider client owns its endpoint shape and extraction rules and
//! returns a compact, named sub-document destined for the per-entity
//! enrichment document. Transport concerns (timeouts, retry with jittered
//! backoff) live in [`HttpFetcher`].

use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ProviderError {
	#[error("http status {0}")]
	Status(StatusCode),

	#[error("request failed: {0}")]
	Request(#[from] reqwest::Error),

	#[error("unexpected response shape: {0}")]
	InvalidResponse(String),

	#[error("provider requires an api key")]
	MissingCredentials,
}

/// Endpoint and credential configuration for the provider fan-out. Every URL
/// is overridable so tests can point at a local fixture server.
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
	pub virustotal_url: String,
	pub virustotal_api_key: Option<String>,
	pub dshield_url: String,
	pub urlhaus_url: String,
	pub spur_url: String,
	pub spur_api_key: Option<String>,
	pub hibp_url: String,
	pub request_timeout: Duration,
	pub max_retries: u32,
}

impl Default for ProviderEndpoints {
	fn default() -> Self {
		Self {
			virustotal_url: "https://www.virustotal.com/api/v3".to_string(),
			virustotal_api_key: None,
			dshield_url: "https://isc.sans.edu/api".to_string(),
			urlhaus_url: "https://urlhaus-api.abuse.ch/v1".to_string(),
			spur_url: "https://api.spur.us/v2".to_string(),
			spur_api_key: None,
			hibp_url: "https://api.pwnedpasswords.com".to_string(),
			request_timeout: Duration::from_secs(30),
			max_retries: 2,
		}
	}
}

/// Shared HTTP transport with per-request timeout and retry/backoff.
pub struct HttpFetcher {
	client: reqwest::Client,
	max_retries: u32,
}

impl HttpFetcher {
	pub fn new(timeout: Duration, max_retries: u32) -> Result<Self, ProviderError> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.user_agent(concat!("vanopticon-mimir/", env!("CARGO_PKG_VERSION")))
			.build()?;
		Ok(Self {
			client,
			max_retries,
		})
	}

	fn retryable(status: Option<StatusCode>) -> bool {
		match status {
			Some(status) => {
				status.is_server_error()
					|| status == StatusCode::TOO_MANY_REQUESTS
					|| status == StatusCode::REQUEST_TIMEOUT
			}
			// Transport-level failure (timeout, connection reset).
			None => true,
		}
	}

	async fn execute_with_retry(
		&self,
		build: impl Fn() -> reqwest::RequestBuilder,
	) -> Result<reqwest::Response, ProviderError> {
		let mut backoff = Duration::from_millis(250);
		let mut attempt = 0u32;
		loop {
			let last_err = match build().send().await {
				Ok(response) if response.status().is_success() => return Ok(response),
				Ok(response) => {
					let status = response.status();
					if !Self::retryable(Some(status)) {
						return Err(ProviderError::Status(status));
					}
					ProviderError::Status(status)
				}
				Err(e) => {
					if !Self::retryable(e.status()) {
						return Err(ProviderError::Request(e));
					}
					ProviderError::Request(e)
				}
			};
			attempt += 1;
			if attempt > self.max_retries {
				return Err(last_err);
			}
			// Exponential backoff with jitter, as the sibling ingest
			// component does for its enrichment calls.
			let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
			tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
			backoff = (backoff * 2).min(Duration::from_secs(10));
		}
	}

	pub async fn get_json(
		&self,
		url: &str,
		headers: HeaderMap,
	) -> Result<Value, ProviderError> {
		let response = self
			.execute_with_retry(|| self.client.get(url).headers(headers.clone()))
			.await?;
		Ok(response.json().await?)
	}

	pub async fn get_text(&self, url: &str) -> Result<String, ProviderError> {
		let response = self.execute_with_retry(|| self.client.get(url)).await?;
		Ok(response.text().await?)
	}

	pub async fn post_form_json(
		&self,
		url: &str,
		form: &[(&str, &str)],
	) -> Result<Value, ProviderError> {
		let form: Vec<(String, String)> = form
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect();
		let response = self
			.execute_with_retry(|| self.client.post(url).form(&form))
			.await?;
		Ok(response.json().await?)
	}
}

fn api_key_headers(name: &str, key: &str) -> Result<HeaderMap, ProviderError> {
	let mut headers = HeaderMap::new();
	let value = HeaderValue::from_str(key)
		.map_err(|_| ProviderError::InvalidResponse("api key is not header-safe".to_string()))?;
	headers.insert(
		reqwest::header::HeaderName::from_bytes(name.as_bytes())
			.map_err(|_| ProviderError::InvalidResponse("bad header name".to_string()))?,
		value,
	);
	Ok(headers)
}

/// VirusTotal file-hash lookup.
pub async fn lookup_virustotal(
	fetcher: &HttpFetcher,
	endpoints: &ProviderEndpoints,
	file_hash: &str,
) -> Result<Value, ProviderError> {
	let key = endpoints
		.virustotal_api_key
		.as_deref()
		.ok_or(ProviderError::MissingCredentials)?;
	let url = format!("{}/files/{}", endpoints.virustotal_url.trim_end_matches('/'), file_hash);
	let body = fetcher.get_json(&url, api_key_headers("x-apikey", key)?).await?;
	Ok(extract_virustotal(&body))
}

/// Pull the analysis verdict out of a VirusTotal file object.
pub fn extract_virustotal(body: &Value) -> Value {
	let malicious = body
		.pointer("/data/attributes/last_analysis_stats/malicious")
		.and_then(Value::as_i64)
		.unwrap_or(0);
	let label = body
		.pointer("/data/attributes/popular_threat_classification/suggested_threat_label")
		.and_then(Value::as_str);
	let mut out = json!({"malicious": malicious});
	if let Some(label) = label {
		out["threat_label"] = json!(label);
	}
	out
}

/// DShield IP reputation lookup.
pub async fn lookup_dshield(
	fetcher: &HttpFetcher,
	endpoints: &ProviderEndpoints,
	ip: &str,
) -> Result<Value, ProviderError> {
	let url = format!("{}/ip/{}?json", endpoints.dshield_url.trim_end_matches('/'), ip);
	let body = fetcher.get_json(&url, HeaderMap::new()).await?;
	Ok(extract_dshield(&body))
}

/// Flatten the `ip.*` reputation fields DShield returns.
pub fn extract_dshield(body: &Value) -> Value {
	let ip = body.get("ip").cloned().unwrap_or_else(|| json!({}));
	let number = |field: &str| -> i64 {
		match ip.get(field) {
			Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
			// DShield emits numbers as strings for some records.
			Some(Value::String(s)) => s.parse().unwrap_or(0),
			_ => 0,
		}
	};
	let text = |field: &str| -> Option<String> {
		ip.get(field)
			.and_then(Value::as_str)
			.filter(|s| !s.is_empty())
			.map(|s| s.to_string())
	};
	json!({
		"count": number("count"),
		"attacks": number("attacks"),
		"asname": text("asname"),
		"ascountry": text("ascountry"),
		"asnum": number("asnum"),
	})
}

/// URLHaus URL lookup.
pub async fn lookup_urlhaus(
	fetcher: &HttpFetcher,
	endpoints: &ProviderEndpoints,
	url_to_check: &str,
) -> Result<Value, ProviderError> {
	let url = format!("{}/url/", endpoints.urlhaus_url.trim_end_matches('/'));
	let body = fetcher.post_form_json(&url, &[("url", url_to_check)]).await?;
	Ok(extract_urlhaus(&body))
}

pub fn extract_urlhaus(body: &Value) -> Value {
	let status = body
		.get("query_status")
		.and_then(Value::as_str)
		.unwrap_or("no_results");
	let tags: Vec<String> = body
		.get("tags")
		.and_then(Value::as_array)
		.map(|tags| {
			tags.iter()
				.filter_map(Value::as_str)
				.map(|s| s.to_string())
				.collect()
		})
		.unwrap_or_default();
	json!({"query_status": status, "tags": tags})
}

/// SPUR IP context lookup.
pub async fn lookup_spur(
	fetcher: &HttpFetcher,
	endpoints: &ProviderEndpoints,
	ip: &str,
) -> Result<Value, ProviderError> {
	let key = endpoints
		.spur_api_key
		.as_deref()
		.ok_or(ProviderError::MissingCredentials)?;
	let url = format!("{}/context/{}", endpoints.spur_url.trim_end_matches('/'), ip);
	let body = fetcher.get_json(&url, api_key_headers("token", key)?).await?;
	Ok(extract_spur(&body))
}

/// Named projection of the SPUR context fields this pipeline consumes.
pub fn extract_spur(body: &Value) -> Value {
	let behaviors: Vec<String> = body
		.pointer("/risks")
		.or_else(|| body.pointer("/behaviors"))
		.and_then(Value::as_array)
		.map(|list| {
			list.iter()
				.filter_map(Value::as_str)
				.map(|s| s.to_string())
				.collect()
		})
		.unwrap_or_default();
	json!({
		"organization": body.pointer("/as/organization").and_then(Value::as_str),
		"behaviors": behaviors,
		"infrastructure": body.pointer("/infrastructure").and_then(Value::as_str),
		"city": body.pointer("/location/city").and_then(Value::as_str),
		"country": body.pointer("/location/country").and_then(Value::as_str),
	})
}

/// HIBP range lookup over a 5-hex-char SHA-1 prefix.
///
/// The k-anonymity interface means the full password hash never leaves the
/// process; only the prefix is sent and the caller matches the suffix list.
pub async fn lookup_hibp(
	fetcher: &HttpFetcher,
	endpoints: &ProviderEndpoints,
	prefix: &str,
) -> Result<Value, ProviderError> {
	if prefix.len() != 5 || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
		return Err(ProviderError::InvalidResponse(format!(
			"hibp prefix must be 5 hex chars, got {prefix:?}"
		)));
	}
	let url = format!(
		"{}/range/{}",
		endpoints.hibp_url.trim_end_matches('/'),
		prefix.to_uppercase()
	);
	let body = fetcher.get_text(&url).await?;
	Ok(extract_hibp(prefix, &body))
}

pub fn extract_hibp(prefix: &str, body: &str) -> Value {
	let mut suffixes = serde_json::Map::new();
	for line in body.lines() {
		if let Some((suffix, count)) = line.trim().split_once(':') {
			if let Ok(count) = count.trim().parse::<i64>() {
				suffixes.insert(suffix.to_uppercase(), json!(count));
			}
		}
	}
	json!({
		"prefix": prefix.to_uppercase(),
		"suffix_count": suffixes.len(),
		"suffixes": Value::Object(suffixes),
	})
}

/// Log-and-drop helper for the fan-out: a provider failure is that
/// provider's problem only.
pub fn log_provider_failure(service: &str, key: &str, error: &ProviderError) {
	warn!(service, key, error = %error, "provider lookup failed; omitting from enrichment");
}
