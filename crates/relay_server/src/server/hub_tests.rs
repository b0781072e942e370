#![forbid(unsafe_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use relay_platform::FallbackConfig;
use relay_platform::backoff::BackoffPolicy;
use serde_json::json;

use crate::providers::DemoProvider;
use crate::server::hub::SessionHub;
use crate::server::outward::{ChannelSink, OutwardEvent};
use crate::server::rate_limiter::{RateLimitPolicy, RateLimiter};
use crate::server::statistics::{Statistics, StatisticsCounter, StatisticsSink};
use crate::server::supervisor::{SupervisorContext, SupervisorPhase};

fn make_hub(trust_forwarded_for: bool) -> (SessionHub, Arc<RateLimiter>, Arc<StatisticsCounter>) {
	let limiter = Arc::new(RateLimiter::new(RateLimitPolicy {
		enabled: true,
		..RateLimitPolicy::default()
	}));
	let statistics = Arc::new(StatisticsCounter::new());
	let ctx = SupervisorContext {
		rate_limiter: limiter.clone(),
		statistics: statistics.clone(),
		provider: Arc::new(DemoProvider::default()),
		upstream_policy: BackoffPolicy::default(),
		fallback: FallbackConfig::default(),
		session_id: None,
	};
	(SessionHub::new(ctx, trust_forwarded_for), limiter, statistics)
}

fn loopback() -> IpAddr {
	IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[tokio::test]
async fn forwarded_origin_is_used_behind_a_local_proxy() {
	let (hub, _, _) = make_hub(true);
	let (sink, _rx) = ChannelSink::new();
	let (_, supervisor) = hub.open_session(loopback(), Some("1.2.3.4, 10.0.0.1"), sink);
	assert_eq!(supervisor.origin().as_str(), "1.2.3.4");

	let (hub, _, _) = make_hub(false);
	let (sink, _rx) = ChannelSink::new();
	let (_, supervisor) = hub.open_session(loopback(), Some("1.2.3.4"), sink);
	assert_eq!(supervisor.origin().as_str(), "127.0.0.1");
}

#[tokio::test]
async fn closing_a_session_releases_its_connection() {
	let (hub, limiter, statistics) = make_hub(true);
	let (sink, mut rx) = ChannelSink::new();
	let (key, supervisor) = hub.open_session(loopback(), Some("1.2.3.4"), sink);

	supervisor.start("streamer", &json!({})).expect("start");
	assert!(matches!(rx.recv().await, Some(OutwardEvent::Connected(_))));
	assert_eq!(statistics.global_connection_count(), 1);
	assert_eq!(limiter.connection_count(supervisor.origin()), 1);
	assert!(hub.session(&key).is_some());

	assert!(hub.close_session(&key));
	assert!(!hub.close_session(&key));
	assert!(hub.session(&key).is_none());
	assert_eq!(supervisor.snapshot().phase, SupervisorPhase::Closed);
	assert_eq!(statistics.global_connection_count(), 0);
	assert_eq!(limiter.connection_count(supervisor.origin()), 0);
}

#[tokio::test]
async fn statistics_reach_every_live_session() {
	let (hub, _, _) = make_hub(false);
	let (first, mut first_rx) = ChannelSink::new();
	let (second, mut second_rx) = ChannelSink::new();
	hub.open_session(loopback(), None, first);
	hub.open_session(loopback(), None, second);
	assert_eq!(hub.live_sessions(), 2);

	let stats = Statistics {
		global_connection_count: 4,
	};
	hub.broadcast(stats);
	assert_eq!(first_rx.try_recv().ok(), Some(OutwardEvent::Statistic(stats)));
	assert_eq!(second_rx.try_recv().ok(), Some(OutwardEvent::Statistic(stats)));

	assert_eq!(hub.close_all(), 2);
	assert_eq!(hub.live_sessions(), 0);
	hub.broadcast(stats);
	assert!(first_rx.try_recv().is_err());
}
