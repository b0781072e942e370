#![forbid(unsafe_code)]

use std::sync::Arc;

use relay_domain::{ConnectionInfo, EventCategory};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::server::statistics::Statistics;

/// Event pushed to one client session.
#[derive(Debug, Clone, PartialEq)]
pub enum OutwardEvent {
	Connected(ConnectionInfo),
	Disconnected { reason: String },
	StreamEnd,
	Message { category: EventCategory, payload: Value },
	Statistic(Statistics),
}

impl OutwardEvent {
	/// Stable event name understood by browser clients.
	pub fn name(&self) -> &str {
		match self {
			Self::Connected(_) => "tiktokConnected",
			Self::Disconnected { .. } => "tiktokDisconnected",
			Self::StreamEnd => "streamEnd",
			Self::Message { category, .. } => category.as_str(),
			Self::Statistic(_) => "statistic",
		}
	}

	pub fn payload(&self) -> Value {
		match self {
			Self::Connected(info) => serde_json::to_value(info).unwrap_or(Value::Null),
			Self::Disconnected { reason } => Value::String(reason.clone()),
			Self::StreamEnd => Value::Null,
			Self::Message { payload, .. } => payload.clone(),
			Self::Statistic(stats) => serde_json::to_value(stats).unwrap_or(Value::Null),
		}
	}
}

/// Per-session push channel owned by the transport.
pub trait OutwardSink: Send + Sync + 'static {
	fn emit(&self, event: OutwardEvent);
}

/// Sink that queues events for a transport task to drain.
pub struct ChannelSink {
	tx: mpsc::UnboundedSender<OutwardEvent>,
}

impl ChannelSink {
	pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<OutwardEvent>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Arc::new(Self { tx }), rx)
	}
}

impl OutwardSink for ChannelSink {
	fn emit(&self, event: OutwardEvent) {
		let _ = self.tx.send(event);
	}
}
