#![forbid(unsafe_code)]

pub mod backoff;
pub mod fallback;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use relay_domain::{ConnectionInfo, ConnectionOptions, EventCategory, ProviderKind, ViewerId};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub use fallback::{FallbackConfig, FallbackSession};
pub use upstream::UpstreamSession;

/// Raw event surfaced by an upstream provider client.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
	/// The provider link dropped without the session asking for it.
	Disconnected,

	/// The broadcast itself ended.
	StreamEnd,

	/// Non-fatal provider error. Logged, never forwarded.
	Error(String),

	/// Live event to relay.
	Message { category: EventCategory, payload: Value },
}

pub type ProviderEventTx = mpsc::UnboundedSender<ProviderEvent>;
pub type ProviderEventRx = mpsc::UnboundedReceiver<ProviderEvent>;

pub fn provider_channel() -> (ProviderEventTx, ProviderEventRx) {
	mpsc::unbounded_channel()
}

/// Room state reported by a successful provider connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRoom {
	pub room_id: String,
}

impl ProviderRoom {
	pub fn new(room_id: impl Into<String>) -> Self {
		Self { room_id: room_id.into() }
	}
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
	/// The provider client could not be built for this viewer/options pair.
	#[error("{0}")]
	Init(String),

	/// A connect attempt failed. The message is kept verbatim for throttling classification.
	#[error("{0}")]
	Connect(String),
}

/// Handle to a single upstream provider client.
#[async_trait]
pub trait ProviderClient: Send + Sync + 'static {
	async fn connect(&self) -> Result<ProviderRoom, ProviderError>;

	/// Drop the link. Must be safe to call repeatedly and while a connect is in flight.
	fn disconnect(&self);
}

/// A provider client together with the stream of events it produces.
pub struct ProviderBinding {
	pub client: Arc<dyn ProviderClient>,
	pub events: ProviderEventRx,
}

/// Builds provider clients. One binding per upstream session.
pub trait ProviderFactory: Send + Sync + 'static {
	fn name(&self) -> &'static str;

	fn create(&self, viewer: &ViewerId, options: &ConnectionOptions) -> Result<ProviderBinding, ProviderError>;
}

/// Connection accounting hook supplied by the session owner.
///
/// Sessions call `increment` once when a link becomes counted and `decrement`
/// exactly once when it stops being counted.
pub trait ConnectionCounter: Send + Sync + 'static {
	fn increment(&self);
	fn decrement(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
	/// The broadcast ended. Never retried.
	StreamEnded,

	/// Reconnect budget used up.
	RetriesExhausted,

	/// The link dropped and reconnecting is turned off.
	ReconnectDisabled,

	/// The provider stopped producing events entirely.
	ProviderClosed,
}

/// Session → supervisor event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
	Connected(ConnectionInfo),
	Message { category: EventCategory, payload: Value },
	StreamEnd,
	/// Terminal. No further events follow.
	Disconnected { reason: String, cause: DisconnectCause },
}

pub type SessionEventTx = mpsc::UnboundedSender<SessionEvent>;
pub type SessionEventRx = mpsc::UnboundedReceiver<SessionEvent>;

pub fn session_channel() -> (SessionEventTx, SessionEventRx) {
	mpsc::unbounded_channel()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
	Idle,
	Connecting,
	Connected,
	Reconnecting,
	Disconnected,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
	#[error("{0}")]
	Connect(String),

	#[error("Client disconnected during connection")]
	Cancelled,

	#[error("session already started")]
	AlreadyStarted,
}

/// The delegate a supervisor currently drives.
#[derive(Clone)]
pub enum ActiveSession {
	Upstream(UpstreamSession),
	Fallback(FallbackSession),
}

impl ActiveSession {
	pub fn kind(&self) -> ProviderKind {
		match self {
			Self::Upstream(_) => ProviderKind::Primary,
			Self::Fallback(_) => ProviderKind::Fallback,
		}
	}

	pub async fn connect(&self) -> Result<ConnectionInfo, SessionError> {
		match self {
			Self::Upstream(s) => s.connect().await,
			Self::Fallback(s) => s.connect().await,
		}
	}

	pub fn disconnect(&self) {
		match self {
			Self::Upstream(s) => s.disconnect(),
			Self::Fallback(s) => s.disconnect(),
		}
	}

	pub fn is_connected(&self) -> bool {
		match self {
			Self::Upstream(s) => s.is_connected(),
			Self::Fallback(s) => s.is_connected(),
		}
	}
}
