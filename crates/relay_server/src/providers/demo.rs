#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_domain::{ConnectionOptions, EventCategory, ViewerId};
use relay_platform::{
	ProviderBinding, ProviderClient, ProviderError, ProviderEvent, ProviderEventTx, ProviderFactory, ProviderRoom,
	provider_channel,
};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Synthetic provider for local end-to-end runs without upstream credentials.
pub struct DemoProvider {
	emit_interval: Duration,
}

impl Default for DemoProvider {
	fn default() -> Self {
		Self {
			emit_interval: Duration::from_millis(250),
		}
	}
}

impl DemoProvider {
	pub fn with_emit_interval(mut self, interval: Duration) -> Self {
		self.emit_interval = interval;
		self
	}
}

impl ProviderFactory for DemoProvider {
	fn name(&self) -> &'static str {
		"demo"
	}

	fn create(&self, viewer: &ViewerId, options: &ConnectionOptions) -> Result<ProviderBinding, ProviderError> {
		let (events_tx, events) = provider_channel();
		let client = Arc::new(DemoClient {
			viewer: viewer.clone(),
			extended_gifts: options.enable_extended_gift_info(),
			emit_interval: self.emit_interval,
			events_tx,
			ticker: Mutex::new(None),
		});
		Ok(ProviderBinding { client, events })
	}
}

struct DemoClient {
	viewer: ViewerId,
	extended_gifts: bool,
	emit_interval: Duration,
	events_tx: ProviderEventTx,
	ticker: Mutex<Option<JoinHandle<()>>>,
}

impl DemoClient {
	fn make_event(viewer: &ViewerId, n: u64, extended_gifts: bool) -> (EventCategory, Value) {
		match n % 4 {
			0 => (EventCategory::RoomUser, json!({ "viewerCount": 100 + n })),
			1 => (
				EventCategory::Chat,
				json!({ "uniqueId": "demo_user", "comment": format!("demo message #{n} for {viewer}") }),
			),
			2 => (EventCategory::Like, json!({ "uniqueId": "demo_user", "likeCount": 1, "totalLikeCount": n })),
			_ => {
				let mut gift = json!({ "uniqueId": "demo_user", "giftId": 5655, "repeatCount": 1 });
				if extended_gifts {
					gift["extendedGiftInfo"] = json!({ "name": "Rose", "diamond_count": 1 });
				}
				(EventCategory::Gift, gift)
			}
		}
	}
}

#[async_trait]
impl ProviderClient for DemoClient {
	async fn connect(&self) -> Result<ProviderRoom, ProviderError> {
		let viewer = self.viewer.clone();
		let events_tx = self.events_tx.clone();
		let every = self.emit_interval;
		let extended_gifts = self.extended_gifts;
		let handle = tokio::spawn(async move {
			let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			let mut n: u64 = 0;
			loop {
				interval.tick().await;
				n += 1;
				let (category, payload) = Self::make_event(&viewer, n, extended_gifts);
				if events_tx.send(ProviderEvent::Message { category, payload }).is_err() {
					debug!(%viewer, "demo event receiver gone; stopping");
					return;
				}
			}
		});
		if let Some(old) = self.ticker.lock().replace(handle) {
			old.abort();
		}

		info!(viewer = %self.viewer, interval_ms = every.as_millis() as u64, "demo provider connected");
		Ok(ProviderRoom::new(format!("demo-{}", self.viewer)))
	}

	fn disconnect(&self) {
		if let Some(ticker) = self.ticker.lock().take() {
			ticker.abort();
			debug!(viewer = %self.viewer, "demo provider disconnected");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn emits_synthetic_events_until_disconnected() {
		let provider = DemoProvider::default().with_emit_interval(Duration::from_millis(10));
		let viewer = ViewerId::new("streamer").expect("viewer");
		let mut binding = provider.create(&viewer, &ConnectionOptions::default()).expect("create");

		let room = binding.client.connect().await.expect("connect");
		assert_eq!(room.room_id, "demo-streamer");

		let mut seen = Vec::new();
		for _ in 0..4 {
			match binding.events.recv().await {
				Some(ProviderEvent::Message { category, .. }) => seen.push(category),
				other => panic!("expected message, got {other:?}"),
			}
		}
		assert_eq!(
			seen,
			vec![EventCategory::Chat, EventCategory::Like, EventCategory::Gift, EventCategory::RoomUser]
		);

		binding.client.disconnect();
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert!(binding.events.try_recv().is_err());
	}
}
