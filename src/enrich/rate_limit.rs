//! Per-service rate limiting for provider calls.
//!
//! Each provider gets its own token bucket sized in tokens-per-minute.
//! Acquisition is a bounded wait: exceeding the rate blocks the caller until
//! a token refills instead of failing the enrichment.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last_refill: Instant,
}

impl TokenBucket {
	fn new(per_minute: u32) -> Self {
		let capacity = per_minute.max(1) as f64;
		Self {
			capacity,
			tokens: capacity,
			refill_per_sec: capacity / 60.0,
			last_refill: Instant::now(),
		}
	}

	fn refill(&mut self) {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last_refill).as_secs_f64();
		self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
		self.last_refill = now;
	}

	fn try_acquire(&mut self) -> bool {
		self.refill();
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}

	fn wait_for_token(&mut self) -> Duration {
		self.refill();
		if self.tokens >= 1.0 {
			return Duration::ZERO;
		}
		let missing = 1.0 - self.tokens;
		Duration::from_secs_f64(missing / self.refill_per_sec)
	}
}

/// Tokens-per-minute budgets, keyed by service name.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
	pub per_service: HashMap<String, u32>,
	pub default_per_minute: u32,
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		let mut per_service = HashMap::new();
		// Public-tier budgets for the external APIs.
		per_service.insert("virustotal".to_string(), 4);
		per_service.insert("dshield".to_string(), 30);
		per_service.insert("urlhaus".to_string(), 30);
		per_service.insert("spur".to_string(), 10);
		per_service.insert("hibp".to_string(), 40);
		Self {
			per_service,
			default_per_minute: 60,
		}
	}
}

/// Shared limiter handed to every provider client.
pub struct RateLimiter {
	config: RateLimitConfig,
	buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
	pub fn new(config: RateLimitConfig) -> Self {
		Self {
			config,
			buckets: Mutex::new(HashMap::new()),
		}
	}

	fn budget(&self, service: &str) -> u32 {
		self.config
			.per_service
			.get(service)
			.copied()
			.unwrap_or(self.config.default_per_minute)
	}

	/// Take one token for `service`, sleeping until one is available.
	pub async fn acquire(&self, service: &str) {
		loop {
			let wait = {
				let mut buckets = self.buckets.lock().await;
				let bucket = buckets
					.entry(service.to_string())
					.or_insert_with(|| TokenBucket::new(self.budget(service)));
				if bucket.try_acquire() {
					return;
				}
				bucket.wait_for_token()
			};
			debug!(service, wait_ms = wait.as_millis() as u64, "rate limit wait");
			tokio::time::sleep(wait.max(Duration::from_millis(10))).await;
		}
	}

	/// Non-blocking variant used by tests and opportunistic callers.
	pub async fn try_acquire(&self, service: &str) -> bool {
		let mut buckets = self.buckets.lock().await;
		let bucket = buckets
			.entry(service.to_string())
			.or_insert_with(|| TokenBucket::new(self.budget(service)));
		bucket.try_acquire()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bucket_exhausts_and_reports_wait() {
		let mut bucket = TokenBucket::new(2);
		assert!(bucket.try_acquire());
		assert!(bucket.try_acquire());
		assert!(!bucket.try_acquire());
		assert!(bucket.wait_for_token() > Duration::ZERO);
	}

	#[tokio::test]
	async fn limiter_tracks_services_independently() {
		let mut config = RateLimitConfig::default();
		config.per_service.insert("tiny".to_string(), 1);
		let limiter = RateLimiter::new(config);

		assert!(limiter.try_acquire("tiny").await);
		assert!(!limiter.try_acquire("tiny").await);
		// A different service still has tokens.
		assert!(limiter.try_acquire("dshield").await);
	}

	#[tokio::test]
	async fn acquire_blocks_until_refill() {
		let mut config = RateLimitConfig::default();
		// 600/minute refills one token every 100ms.
		config.per_service.insert("fast".to_string(), 600);
		let limiter = RateLimiter::new(config);
		while limiter.try_acquire("fast").await {}

		let started = Instant::now();
		limiter.acquire("fast").await;
		assert!(started.elapsed() >= Duration::from_millis(10));
	}
}
