//! Classification result types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Infrastructure categories, ordered by threat priority (TOR highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpType {
	Tor,
	Cloud,
	Datacenter,
	Residential,
	Unknown,
}

impl IpType {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Tor => "tor",
			Self::Cloud => "cloud",
			Self::Datacenter => "datacenter",
			Self::Residential => "residential",
			Self::Unknown => "unknown",
		}
	}

	/// Short-tier cache TTL per type: volatile categories (TOR exits churn
	/// hourly, unknowns may resolve after a list update) expire fast.
	pub fn l1_ttl(&self) -> Duration {
		match self {
			Self::Tor | Self::Unknown => Duration::from_secs(60 * 60),
			Self::Cloud | Self::Datacenter | Self::Residential => {
				Duration::from_secs(24 * 60 * 60)
			}
		}
	}
}

/// Immutable classification verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpClassification {
	pub ip_type: IpType,
	pub provider: Option<String>,
	pub confidence: f64,
	pub source: String,
	pub classified_at: DateTime<Utc>,
}

impl IpClassification {
	/// Build a verdict; confidence is clamped into `[0, 1]`.
	pub fn new(
		ip_type: IpType,
		provider: Option<String>,
		confidence: f64,
		source: impl Into<String>,
	) -> Self {
		Self {
			ip_type,
			provider,
			confidence: confidence.clamp(0.0, 1.0),
			source: source.into(),
			classified_at: Utc::now(),
		}
	}

	pub fn unknown() -> Self {
		Self::new(IpType::Unknown, None, 0.0, "none")
	}
}
