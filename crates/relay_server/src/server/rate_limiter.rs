#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_domain::ClientOrigin;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Text reported to a client whose session request was rejected.
pub const RATE_LIMIT_MESSAGE: &str = "You have opened too many connections or made too many connection requests. \
	Please reduce the number of connections/requests or host your own server instance. \
	The connections are limited to avoid that the server IP gets blocked by TikTok.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
	pub enabled: bool,
	pub max_connections: u32,
	pub max_requests_per_window: u32,
	pub window: Duration,
}

impl Default for RateLimitPolicy {
	fn default() -> Self {
		Self {
			enabled: false,
			max_connections: 10,
			max_requests_per_window: 5,
			window: Duration::from_secs(60),
		}
	}
}

/// Per-origin counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitState {
	pub request_count: u32,
	pub connection_count: u32,
}

/// Storage behind the limiter. All operations are infallible.
pub trait RateLimitStore: Send + Sync + 'static {
	fn record_request(&self, origin: &ClientOrigin);
	fn state(&self, origin: &ClientOrigin) -> RateLimitState;
	fn increment_connection(&self, origin: &ClientOrigin);
	/// Clamps at zero.
	fn decrement_connection(&self, origin: &ClientOrigin);
	/// Zero every request count. Connection counts are kept.
	fn reset_requests(&self);
}

#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
	entries: Mutex<HashMap<ClientOrigin, RateLimitState>>,
}

impl InMemoryRateLimitStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn tracked_origins(&self) -> usize {
		self.entries.lock().len()
	}
}

impl RateLimitStore for InMemoryRateLimitStore {
	fn record_request(&self, origin: &ClientOrigin) {
		let mut entries = self.entries.lock();
		let entry = entries.entry(origin.clone()).or_default();
		entry.request_count = entry.request_count.saturating_add(1);
	}

	fn state(&self, origin: &ClientOrigin) -> RateLimitState {
		self.entries.lock().get(origin).copied().unwrap_or_default()
	}

	fn increment_connection(&self, origin: &ClientOrigin) {
		let mut entries = self.entries.lock();
		let entry = entries.entry(origin.clone()).or_default();
		entry.connection_count = entry.connection_count.saturating_add(1);
	}

	fn decrement_connection(&self, origin: &ClientOrigin) {
		let mut entries = self.entries.lock();
		if let Some(entry) = entries.get_mut(origin) {
			entry.connection_count = entry.connection_count.saturating_sub(1);
			if *entry == RateLimitState::default() {
				entries.remove(origin);
			}
		}
	}

	fn reset_requests(&self) {
		let mut entries = self.entries.lock();
		for entry in entries.values_mut() {
			entry.request_count = 0;
		}
		entries.retain(|_, entry| entry.connection_count > 0);
	}
}

/// Per-origin admission gate for new upstream sessions.
pub struct RateLimiter {
	policy: RateLimitPolicy,
	store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
	pub fn new(policy: RateLimitPolicy) -> Self {
		Self::with_store(policy, Arc::new(InMemoryRateLimitStore::new()))
	}

	pub fn with_store(policy: RateLimitPolicy, store: Arc<dyn RateLimitStore>) -> Self {
		Self { policy, store }
	}

	pub fn rejection_message(&self) -> &'static str {
		RATE_LIMIT_MESSAGE
	}

	/// Counted whether or not limiting is enabled.
	pub fn record_request(&self, origin: &ClientOrigin) {
		self.store.record_request(origin);
	}

	pub fn is_over_request_limit(&self, origin: &ClientOrigin) -> bool {
		self.store.state(origin).request_count > self.policy.max_requests_per_window
	}

	pub fn connection_count(&self, origin: &ClientOrigin) -> u32 {
		self.store.state(origin).connection_count
	}

	pub fn increment_connection(&self, origin: &ClientOrigin) {
		self.store.increment_connection(origin);
	}

	pub fn decrement_connection(&self, origin: &ClientOrigin) {
		self.store.decrement_connection(origin);
	}

	/// Connection bound first, then the request bound. A disabled limiter never blocks and skips the lookup.
	pub fn should_block(&self, origin: &ClientOrigin) -> bool {
		if !self.policy.enabled {
			return false;
		}

		let state = self.store.state(origin);
		if state.connection_count > self.policy.max_connections {
			debug!(%origin, connections = state.connection_count, "origin over connection limit");
			return true;
		}
		if state.request_count > self.policy.max_requests_per_window {
			debug!(%origin, requests = state.request_count, "origin over request limit");
			return true;
		}
		false
	}

	pub fn reset_requests(&self) {
		self.store.reset_requests();
	}

	/// Clear request counts every window. Runs until aborted.
	pub fn spawn_window_reset(self: &Arc<Self>) -> JoinHandle<()> {
		let limiter = Arc::clone(self);
		let window = self.policy.window;
		info!(window_secs = window.as_secs(), "rate limit window reset scheduled");
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + window, window);
			loop {
				ticker.tick().await;
				limiter.reset_requests();
				debug!("rate limit request counts reset");
			}
		})
	}
}
