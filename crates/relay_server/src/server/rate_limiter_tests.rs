#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use proptest::prelude::*;
use relay_domain::ClientOrigin;

use crate::server::rate_limiter::{
	InMemoryRateLimitStore, RATE_LIMIT_MESSAGE, RateLimitPolicy, RateLimitState, RateLimitStore, RateLimiter,
};

fn origin(s: &str) -> ClientOrigin {
	ClientOrigin::new(s)
}

fn enabled(max_connections: u32, max_requests_per_window: u32) -> RateLimitPolicy {
	RateLimitPolicy {
		enabled: true,
		max_connections,
		max_requests_per_window,
		window: Duration::from_secs(60),
	}
}

/// Store that counts every call.
#[derive(Default)]
struct TouchCountingStore {
	inner: InMemoryRateLimitStore,
	touches: AtomicUsize,
}

impl TouchCountingStore {
	fn touch(&self) {
		self.touches.fetch_add(1, Ordering::SeqCst);
	}
}

impl RateLimitStore for TouchCountingStore {
	fn record_request(&self, origin: &ClientOrigin) {
		self.touch();
		self.inner.record_request(origin);
	}

	fn state(&self, origin: &ClientOrigin) -> RateLimitState {
		self.touch();
		self.inner.state(origin)
	}

	fn increment_connection(&self, origin: &ClientOrigin) {
		self.touch();
		self.inner.increment_connection(origin);
	}

	fn decrement_connection(&self, origin: &ClientOrigin) {
		self.touch();
		self.inner.decrement_connection(origin);
	}

	fn reset_requests(&self) {
		self.touch();
		self.inner.reset_requests();
	}
}

#[test]
fn disabled_limiter_never_blocks_and_skips_the_lookup() {
	let store = Arc::new(TouchCountingStore::default());
	let limiter = RateLimiter::with_store(RateLimitPolicy::default(), store.clone());
	let o = origin("1.2.3.4");

	for _ in 0..50 {
		assert!(!limiter.should_block(&o));
	}
	assert_eq!(store.touches.load(Ordering::SeqCst), 0);
}

#[test]
fn disabled_limiter_still_keeps_counts() {
	let limiter = RateLimiter::new(RateLimitPolicy::default());
	let o = origin("1.2.3.4");

	for _ in 0..50 {
		limiter.record_request(&o);
	}
	limiter.increment_connection(&o);
	limiter.increment_connection(&o);
	assert_eq!(limiter.connection_count(&o), 2);
	assert!(limiter.is_over_request_limit(&o));
	assert!(!limiter.should_block(&o));

	limiter.decrement_connection(&o);
	assert_eq!(limiter.connection_count(&o), 1);
}

#[test]
fn connection_bound_blocks_regardless_of_requests() {
	let limiter = RateLimiter::new(enabled(10, 1000));
	let o = origin("10.0.0.1");

	for _ in 0..10 {
		limiter.increment_connection(&o);
	}
	assert!(!limiter.should_block(&o), "ten connections fall through to the request check");

	limiter.increment_connection(&o);
	assert_eq!(limiter.connection_count(&o), 11);
	assert!(limiter.should_block(&o));
}

#[test]
fn request_bound_applies_when_connections_are_fine() {
	let limiter = RateLimiter::new(enabled(10, 5));
	let o = origin("10.0.0.2");

	for _ in 0..5 {
		limiter.record_request(&o);
	}
	assert!(!limiter.is_over_request_limit(&o));
	assert!(!limiter.should_block(&o));

	limiter.record_request(&o);
	assert!(limiter.is_over_request_limit(&o));
	assert!(limiter.should_block(&o));
	assert!(!limiter.should_block(&origin("10.0.0.3")));
}

#[test]
fn reset_clears_requests_but_keeps_connections() {
	let limiter = RateLimiter::new(enabled(10, 1));
	let o = origin("10.0.0.4");
	limiter.record_request(&o);
	limiter.record_request(&o);
	limiter.increment_connection(&o);
	assert!(limiter.should_block(&o));

	limiter.reset_requests();

	assert!(!limiter.is_over_request_limit(&o));
	assert!(!limiter.should_block(&o));
	assert_eq!(limiter.connection_count(&o), 1);
}

#[test]
fn idle_origins_are_forgotten_after_reset() {
	let store = Arc::new(InMemoryRateLimitStore::new());
	let limiter = RateLimiter::with_store(enabled(10, 5), store.clone());
	limiter.record_request(&origin("a"));
	limiter.record_request(&origin("b"));
	limiter.increment_connection(&origin("b"));
	assert_eq!(store.tracked_origins(), 2);

	limiter.reset_requests();
	assert_eq!(store.tracked_origins(), 1);
}

#[test]
fn decrement_clamps_at_zero() {
	let limiter = RateLimiter::new(enabled(10, 5));
	let o = origin("10.0.0.5");
	limiter.decrement_connection(&o);
	limiter.decrement_connection(&o);
	assert_eq!(limiter.connection_count(&o), 0);
	limiter.increment_connection(&o);
	assert_eq!(limiter.connection_count(&o), 1);
}

#[test]
fn rejection_message_explains_the_limit() {
	let limiter = RateLimiter::new(enabled(1, 1));
	assert_eq!(limiter.rejection_message(), RATE_LIMIT_MESSAGE);
	assert!(RATE_LIMIT_MESSAGE.starts_with("You have opened too many connections"));
	assert!(RATE_LIMIT_MESSAGE.contains("requests. Please reduce"));
	assert!(RATE_LIMIT_MESSAGE.ends_with("blocked by TikTok."));
}

#[tokio::test(start_paused = true)]
async fn window_reset_runs_on_schedule() {
	let limiter = Arc::new(RateLimiter::new(RateLimitPolicy {
		window: Duration::from_secs(60),
		..enabled(10, 1)
	}));
	let o = origin("10.0.0.6");
	limiter.record_request(&o);
	limiter.record_request(&o);
	let handle = limiter.spawn_window_reset();

	tokio::time::sleep(Duration::from_secs(59)).await;
	assert!(limiter.should_block(&o));

	tokio::time::sleep(Duration::from_secs(2)).await;
	assert!(!limiter.should_block(&o));
	handle.abort();
}

proptest! {
	#[test]
	fn connection_count_is_clamped_difference(ops in proptest::collection::vec(any::<bool>(), 0..200)) {
		let limiter = RateLimiter::new(enabled(10, 5));
		let o = origin("prop");
		let mut expected: u32 = 0;
		for inc in ops {
			if inc {
				limiter.increment_connection(&o);
				expected += 1;
			} else {
				limiter.decrement_connection(&o);
				expected = expected.saturating_sub(1);
			}
			prop_assert_eq!(limiter.connection_count(&o), expected);
		}
	}
}
