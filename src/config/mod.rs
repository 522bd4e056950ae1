use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::enrich::fs_tier::FsTierConfig;
use crate::enrich::{EnrichmentConfig, HybridCacheConfig, ProviderEndpoints, ProviderKind, RateLimitConfig};
use crate::event::defang::{DefangConfig, DefangMode};
use crate::event::reader::ReaderConfig;
use crate::event::EventProcessor;
use crate::ipclass::IpClassifierConfig;
use crate::loader::{BulkLoaderConfig, DeltaLoaderConfig};

/// Runtime configuration for Mimir.
///
/// Values are loaded from (in order): a `mimir` config file (optional) and
/// environment variables prefixed with `MIM_` (e.g. `MIM_DATABASE_URL`).
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct Settings {
	pub database_url: String,
	pub status_dir: PathBuf,
	pub cache_dir: Option<PathBuf>,
	pub log_level: String,
	pub batch_size: usize,
	pub delta_batch_size: usize,
	pub quarantine_threshold: i64,
	pub batch_risk_threshold: i64,
	pub telemetry_interval: usize,
	pub defang_mode: String,
	pub preserve_original: bool,
	pub multiline_json: bool,
	pub request_timeout_secs: u64,
	pub virustotal_api_key: Option<String>,
	pub spur_api_key: Option<String>,
	pub enabled_providers: Option<Vec<String>>,
	pub tor_url: Option<String>,
	pub cloud_base_url: Option<String>,
	pub datacenter_url: Option<String>,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			database_url: "sqlite:mimir.db".to_string(),
			status_dir: PathBuf::from("status"),
			cache_dir: None,
			log_level: "info".to_string(),
			batch_size: 500,
			delta_batch_size: 200,
			quarantine_threshold: 80,
			batch_risk_threshold: 400,
			telemetry_interval: 5,
			defang_mode: "intelligent".to_string(),
			preserve_original: true,
			multiline_json: false,
			request_timeout_secs: 30,
			virustotal_api_key: None,
			spur_api_key: None,
			enabled_providers: None,
			tor_url: None,
			cloud_base_url: None,
			datacenter_url: None,
		}
	}
}

/// Partial settings used to overlay config-file/env values on defaults.
#[derive(Debug, Deserialize, Default)]
struct PartialSettings {
	database_url: Option<String>,
	status_dir: Option<PathBuf>,
	cache_dir: Option<PathBuf>,
	log_level: Option<String>,
	batch_size: Option<usize>,
	delta_batch_size: Option<usize>,
	quarantine_threshold: Option<i64>,
	batch_risk_threshold: Option<i64>,
	telemetry_interval: Option<usize>,
	defang_mode: Option<String>,
	preserve_original: Option<bool>,
	multiline_json: Option<bool>,
	request_timeout_secs: Option<u64>,
	virustotal_api_key: Option<String>,
	spur_api_key: Option<String>,
	enabled_providers: Option<Vec<String>>,
	tor_url: Option<String>,
	cloud_base_url: Option<String>,
	datacenter_url: Option<String>,
}

/// Load settings from the optional `mimir` config file and environment.
pub fn load() -> Result<Settings> {
	let builder = config::Config::builder()
		.add_source(config::File::with_name("mimir").required(false))
		// Double-underscore separator so `MIM_DATABASE_URL` maps to the flat
		// `database_url` key instead of a nested table.
		.add_source(config::Environment::with_prefix("MIM").separator("__"));

	let cfg = builder.build()?;
	let partial: PartialSettings = cfg.try_deserialize().unwrap_or_default();

	let mut s = Settings::default();
	macro_rules! overlay {
		($partial:ident => $s:ident, $($field:ident),+ $(,)?) => {
			$(if let Some(value) = $partial.$field { $s.$field = value; })+
		};
	}
	overlay!(
		partial => s,
		database_url,
		status_dir,
		log_level,
		batch_size,
		delta_batch_size,
		quarantine_threshold,
		batch_risk_threshold,
		telemetry_interval,
		defang_mode,
		preserve_original,
		multiline_json,
		request_timeout_secs,
	);
	if partial.cache_dir.is_some() {
		s.cache_dir = partial.cache_dir;
	}
	if partial.virustotal_api_key.is_some() {
		s.virustotal_api_key = partial.virustotal_api_key;
	}
	if partial.spur_api_key.is_some() {
		s.spur_api_key = partial.spur_api_key;
	}
	if partial.enabled_providers.is_some() {
		s.enabled_providers = partial.enabled_providers;
	}
	if partial.tor_url.is_some() {
		s.tor_url = partial.tor_url;
	}
	if partial.cloud_base_url.is_some() {
		s.cloud_base_url = partial.cloud_base_url;
	}
	if partial.datacenter_url.is_some() {
		s.datacenter_url = partial.datacenter_url;
	}

	// Direct environment variables win over everything; some CI harnesses
	// set env vars in ways the config crate does not map as expected.
	if let Ok(v) = std::env::var("MIM_DATABASE_URL") {
		if !v.is_empty() {
			s.database_url = v;
		}
	}
	if let Ok(v) = std::env::var("MIM_STATUS_DIR") {
		if !v.is_empty() {
			s.status_dir = PathBuf::from(v);
		}
	}
	if let Ok(v) = std::env::var("MIM_CACHE_DIR") {
		if !v.is_empty() {
			s.cache_dir = Some(PathBuf::from(v));
		}
	}
	if let Ok(v) = std::env::var("MIM_LOG_LEVEL") {
		if !v.is_empty() {
			s.log_level = v;
		}
	}
	if let Ok(v) = std::env::var("MIM_VIRUSTOTAL_API_KEY") {
		if !v.is_empty() {
			s.virustotal_api_key = Some(v);
		}
	}
	if let Ok(v) = std::env::var("MIM_SPUR_API_KEY") {
		if !v.is_empty() {
			s.spur_api_key = Some(v);
		}
	}

	Ok(s)
}

impl Settings {
	fn defang_config(&self) -> DefangConfig {
		DefangConfig {
			mode: DefangMode::parse(&self.defang_mode).unwrap_or(DefangMode::Intelligent),
			preserve_original: self.preserve_original,
		}
	}

	fn processor(&self) -> EventProcessor {
		EventProcessor {
			quarantine_threshold: self.quarantine_threshold,
			defang: self.defang_config(),
		}
	}

	pub fn bulk_loader_config(&self) -> BulkLoaderConfig {
		BulkLoaderConfig {
			batch_size: self.batch_size,
			quarantine_threshold: self.quarantine_threshold,
			batch_risk_threshold: self.batch_risk_threshold,
			telemetry_interval: self.telemetry_interval.max(1),
			processor: self.processor(),
			reader: ReaderConfig {
				multiline_json: self.multiline_json,
			},
		}
	}

	pub fn delta_loader_config(&self) -> DeltaLoaderConfig {
		DeltaLoaderConfig {
			bulk: BulkLoaderConfig {
				batch_size: self.delta_batch_size,
				..self.bulk_loader_config()
			},
			allow_inode_reset: true,
		}
	}

	pub fn cache_root(&self) -> PathBuf {
		self.cache_dir
			.clone()
			.unwrap_or_else(FsTierConfig::default_root)
	}

	pub fn hybrid_cache_config(&self) -> HybridCacheConfig {
		HybridCacheConfig {
			fs: FsTierConfig {
				root: self.cache_root(),
				..FsTierConfig::default()
			},
			..HybridCacheConfig::default()
		}
	}

	pub fn classifier_config(&self) -> IpClassifierConfig {
		let mut config = IpClassifierConfig {
			cache_dir: self.cache_root().join("ip_classification"),
			request_timeout: Duration::from_secs(self.request_timeout_secs),
			..IpClassifierConfig::default()
		};
		if let Some(url) = &self.tor_url {
			config.tor_url = url.clone();
		}
		if let Some(url) = &self.cloud_base_url {
			config.cloud_base_url = url.clone();
		}
		if let Some(url) = &self.datacenter_url {
			config.datacenter_url = url.clone();
		}
		config
	}

	pub fn enrichment_config(&self) -> EnrichmentConfig {
		let enabled: HashSet<ProviderKind> = match &self.enabled_providers {
			Some(names) => names
				.iter()
				.filter_map(|name| match name.to_ascii_lowercase().as_str() {
					"virustotal" => Some(ProviderKind::VirusTotal),
					"dshield" => Some(ProviderKind::Dshield),
					"urlhaus" => Some(ProviderKind::UrlHaus),
					"spur" => Some(ProviderKind::Spur),
					"hibp" => Some(ProviderKind::Hibp),
					"ip_classification" => Some(ProviderKind::IpClassification),
					_ => None,
				})
				.collect(),
			None => ProviderKind::all(),
		};
		EnrichmentConfig {
			endpoints: ProviderEndpoints {
				virustotal_api_key: self.virustotal_api_key.clone(),
				spur_api_key: self.spur_api_key.clone(),
				request_timeout: Duration::from_secs(self.request_timeout_secs),
				..ProviderEndpoints::default()
			},
			enabled,
			rate_limits: RateLimitConfig::default(),
			concurrency: 8,
		}
	}
}
