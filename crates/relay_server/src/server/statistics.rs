#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

/// Snapshot broadcast to every client as `statistic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
	pub global_connection_count: u64,
}

/// Process-wide count of open upstream connections.
#[derive(Debug, Default)]
pub struct StatisticsCounter {
	open: AtomicU64,
}

impl StatisticsCounter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn increment(&self) {
		let now = self.open.fetch_add(1, Ordering::SeqCst).saturating_add(1);
		metrics::gauge!("relay_open_upstream_connections").set(now as f64);
	}

	/// Clamps at zero.
	pub fn decrement(&self) {
		let prev = self
			.open
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)))
			.unwrap_or(0);
		metrics::gauge!("relay_open_upstream_connections").set(prev.saturating_sub(1) as f64);
	}

	pub fn global_connection_count(&self) -> u64 {
		self.open.load(Ordering::SeqCst)
	}

	pub fn snapshot(&self) -> Statistics {
		Statistics {
			global_connection_count: self.global_connection_count(),
		}
	}
}

/// Receiver of periodic statistics snapshots.
pub trait StatisticsSink: Send + Sync + 'static {
	fn broadcast(&self, stats: Statistics);
}

/// Push a snapshot to `sink` every `every`. Runs until aborted.
pub fn spawn_statistics_broadcast(
	counter: Arc<StatisticsCounter>,
	sink: Arc<dyn StatisticsSink>,
	every: Duration,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
		loop {
			ticker.tick().await;
			let stats = counter.snapshot();
			debug!(global_connection_count = stats.global_connection_count, "broadcasting statistics");
			sink.broadcast(stats);
		}
	})
}
