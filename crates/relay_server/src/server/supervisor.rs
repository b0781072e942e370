#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use relay_domain::{ClientOrigin, ConnectionInfo, ConnectionOptions, ParseIdError, ProviderKind, ViewerId};
use relay_platform::backoff::BackoffPolicy;
use relay_platform::{
	ActiveSession, ConnectionCounter, DisconnectCause, FallbackConfig, FallbackSession, ProviderError, ProviderFactory,
	SessionError, SessionEvent, SessionEventRx, UpstreamSession, session_channel,
};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::outward::{OutwardEvent, OutwardSink};
use crate::server::rate_limiter::RateLimiter;
use crate::server::statistics::StatisticsCounter;

/// Lower-case fragments that mark an upstream failure as provider-side throttling.
pub const THROTTLING_SIGNATURES: [&str; 7] = [
	"rate limit",
	"too many requests",
	"429",
	"eulerstream",
	"temporarily blocked",
	"quota exceeded",
	"request limit",
];

const BOTH_FAILED_PREFIX: &str = "Both TikTok and TikFinity connections failed";

pub fn is_throttling_failure(reason: &str) -> bool {
	let reason = reason.to_lowercase();
	THROTTLING_SIGNATURES.iter().any(|sig| reason.contains(sig))
}

/// Shared collaborators for every supervisor in the process.
#[derive(Clone)]
pub struct SupervisorContext {
	pub rate_limiter: Arc<RateLimiter>,
	pub statistics: Arc<StatisticsCounter>,
	pub provider: Arc<dyn ProviderFactory>,
	pub upstream_policy: BackoffPolicy,
	pub fallback: FallbackConfig,
	/// Provider session id forced into every session's options.
	pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
	NoSession,
	ConnectingPrimary,
	ConnectingFallback,
	Active,
	Closed,
}

#[derive(Debug, Error)]
pub enum StartError {
	#[error("{0}")]
	RateLimited(&'static str),

	#[error("invalid viewer id: {0}")]
	InvalidViewer(#[from] ParseIdError),

	#[error(transparent)]
	Provider(#[from] ProviderError),

	#[error("session closed")]
	Closed,
}

/// Point-in-time view of a supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSnapshot {
	pub phase: SupervisorPhase,
	pub active: Option<ProviderKind>,
	pub used_fallback: bool,
	pub sessions_created: u32,
	pub viewer: Option<ViewerId>,
}

/// Counts a session's link against its origin and the process total.
struct OriginLedger {
	origin: ClientOrigin,
	rate_limiter: Arc<RateLimiter>,
	statistics: Arc<StatisticsCounter>,
}

impl ConnectionCounter for OriginLedger {
	fn increment(&self) {
		self.rate_limiter.increment_connection(&self.origin);
		self.statistics.increment();
	}

	fn decrement(&self) {
		self.rate_limiter.decrement_connection(&self.origin);
		self.statistics.decrement();
	}
}

/// Owns the upstream (or fallback) session of one client session.
///
/// Dropping the supervisor closes it.
pub struct ConnectionSupervisor {
	inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
	origin: ClientOrigin,
	ctx: SupervisorContext,
	sink: Arc<dyn OutwardSink>,
	ledger: Arc<dyn ConnectionCounter>,
	state: Mutex<SupervisedSession>,
}

struct SupervisedSession {
	phase: SupervisorPhase,
	delegate: Option<ActiveSession>,
	viewer: Option<ViewerId>,
	used_fallback: bool,
	/// Bumped whenever the delegate changes; events from older pumps are dropped.
	generation: u64,
	pump: Option<JoinHandle<()>>,
	connected_reported: bool,
	terminal_reported: bool,
	sessions_created: u32,
}

impl ConnectionSupervisor {
	pub fn new(origin: ClientOrigin, ctx: SupervisorContext, sink: Arc<dyn OutwardSink>) -> Self {
		let ledger: Arc<dyn ConnectionCounter> = Arc::new(OriginLedger {
			origin: origin.clone(),
			rate_limiter: Arc::clone(&ctx.rate_limiter),
			statistics: Arc::clone(&ctx.statistics),
		});
		Self {
			inner: Arc::new(SupervisorInner {
				origin,
				ctx,
				sink,
				ledger,
				state: Mutex::new(SupervisedSession {
					phase: SupervisorPhase::NoSession,
					delegate: None,
					viewer: None,
					used_fallback: false,
					generation: 0,
					pump: None,
					connected_reported: false,
					terminal_reported: false,
					sessions_created: 0,
				}),
			}),
		}
	}

	pub fn origin(&self) -> &ClientOrigin {
		&self.inner.origin
	}

	/// Begin relaying `viewer`. Replaces any session already running.
	///
	/// Rejections and construction failures are reported to the sink as well as returned.
	pub fn start(&self, viewer: &str, raw_options: &Value) -> Result<(), StartError> {
		let inner = &self.inner;
		let origin = &inner.origin;

		if inner.state.lock().phase == SupervisorPhase::Closed {
			return Err(StartError::Closed);
		}

		let mut options = ConnectionOptions::sanitize(raw_options);
		if let Some(session_id) = &inner.ctx.session_id {
			options.set_session_id(session_id.clone());
		}

		let limiter = &inner.ctx.rate_limiter;
		limiter.record_request(origin);
		if limiter.should_block(origin) {
			metrics::counter!("relay_rate_limited_total").increment(1);
			warn!(%origin, "session request rejected by rate limiter");
			let message = limiter.rejection_message();
			inner.sink.emit(OutwardEvent::Disconnected {
				reason: message.to_string(),
			});
			return Err(StartError::RateLimited(message));
		}

		let viewer = match ViewerId::new(viewer) {
			Ok(v) => v,
			Err(e) => {
				let err = StartError::from(e);
				inner.sink.emit(OutwardEvent::Disconnected { reason: err.to_string() });
				return Err(err);
			}
		};

		let mut st = inner.state.lock();
		if st.phase == SupervisorPhase::Closed {
			return Err(StartError::Closed);
		}
		inner.teardown(&mut st);
		st.viewer = Some(viewer.clone());
		st.used_fallback = false;
		st.connected_reported = false;
		st.terminal_reported = false;

		let (events_tx, events_rx) = session_channel();
		let session = match UpstreamSession::create(
			inner.ctx.provider.as_ref(),
			viewer.clone(),
			&options,
			inner.ctx.upstream_policy,
			Arc::clone(&inner.ledger),
			events_tx,
		) {
			Ok(s) => s,
			Err(e) => {
				warn!(%origin, %viewer, provider = inner.ctx.provider.name(), error = %e, "upstream session init failed");
				inner.report_terminal(&mut st, e.to_string());
				return Err(e.into());
			}
		};

		info!(%origin, %viewer, provider = inner.ctx.provider.name(), ?options, "starting upstream session");
		st.sessions_created += 1;
		st.phase = SupervisorPhase::ConnectingPrimary;
		inner.install(&mut st, ActiveSession::Upstream(session), events_rx);
		Ok(())
	}

	/// Disconnect the active delegate, if any. The supervisor can be started again.
	pub fn stop(&self) {
		let mut st = self.inner.state.lock();
		self.inner.teardown(&mut st);
		if st.phase != SupervisorPhase::Closed {
			st.phase = SupervisorPhase::NoSession;
		}
	}

	/// Disconnect the active delegate and refuse further starts. Idempotent.
	pub fn close(&self) {
		let mut st = self.inner.state.lock();
		if st.phase == SupervisorPhase::Closed {
			return;
		}
		self.inner.teardown(&mut st);
		st.phase = SupervisorPhase::Closed;
		debug!(origin = %self.inner.origin, "supervisor closed");
	}

	pub fn is_connected(&self) -> bool {
		self.inner
			.state
			.lock()
			.delegate
			.as_ref()
			.is_some_and(ActiveSession::is_connected)
	}

	pub fn snapshot(&self) -> SupervisorSnapshot {
		let st = self.inner.state.lock();
		SupervisorSnapshot {
			phase: st.phase,
			active: st.delegate.as_ref().map(ActiveSession::kind),
			used_fallback: st.used_fallback,
			sessions_created: st.sessions_created,
			viewer: st.viewer.clone(),
		}
	}
}

impl Drop for ConnectionSupervisor {
	fn drop(&mut self) {
		self.close();
	}
}

impl SupervisorInner {
	/// Drop the current delegate. Its pump is cancelled and its late events ignored.
	fn teardown(&self, st: &mut SupervisedSession) {
		st.generation += 1;
		if let Some(pump) = st.pump.take() {
			pump.abort();
		}
		if let Some(delegate) = st.delegate.take() {
			debug!(origin = %self.origin, kind = %delegate.kind(), "disconnecting delegate");
			delegate.disconnect();
		}
	}

	fn install(self: &Arc<Self>, st: &mut SupervisedSession, delegate: ActiveSession, events: SessionEventRx) {
		st.generation += 1;
		st.delegate = Some(delegate.clone());
		st.pump = Some(tokio::spawn(pump(Arc::clone(self), st.generation, delegate, events)));
	}

	fn report_terminal(&self, st: &mut SupervisedSession, reason: String) {
		st.phase = SupervisorPhase::NoSession;
		if st.terminal_reported {
			return;
		}
		st.terminal_reported = true;
		info!(origin = %self.origin, %reason, "session failed");
		self.sink.emit(OutwardEvent::Disconnected { reason });
	}

	fn on_connected(&self, generation: u64, info: ConnectionInfo) {
		let mut st = self.state.lock();
		if st.generation != generation {
			return;
		}
		st.phase = SupervisorPhase::Active;
		if st.connected_reported {
			debug!(origin = %self.origin, room_id = %info.room_id, "suppressing repeated connected event");
			return;
		}
		st.connected_reported = true;
		self.sink.emit(OutwardEvent::Connected(info));
	}

	fn forward(&self, generation: u64, event: OutwardEvent) {
		let st = self.state.lock();
		if st.generation != generation {
			return;
		}
		self.sink.emit(event);
	}

	/// Terminal failure of the delegate installed at `generation`.
	fn on_failure(self: &Arc<Self>, generation: u64, kind: ProviderKind, reason: String, cause: Option<DisconnectCause>) {
		let mut st = self.state.lock();
		if st.generation != generation {
			return;
		}
		if let Some(delegate) = st.delegate.take() {
			delegate.disconnect();
		}
		st.pump = None;

		if cause == Some(DisconnectCause::StreamEnded) {
			st.phase = SupervisorPhase::NoSession;
			st.terminal_reported = true;
			return;
		}

		if kind == ProviderKind::Primary && !st.used_fallback && is_throttling_failure(&reason) {
			st.used_fallback = true;
			self.start_fallback(&mut st, &reason);
			return;
		}

		let reason = match kind {
			ProviderKind::Fallback => format!("{BOTH_FAILED_PREFIX}: {reason}"),
			ProviderKind::Primary => reason,
		};
		self.report_terminal(&mut st, reason);
	}

	fn start_fallback(self: &Arc<Self>, st: &mut SupervisedSession, upstream_reason: &str) {
		let Some(viewer) = st.viewer.clone() else {
			self.report_terminal(st, upstream_reason.to_string());
			return;
		};

		metrics::counter!("relay_fallback_sessions_total").increment(1);
		info!(origin = %self.origin, %viewer, reason = %upstream_reason, "upstream throttled; switching to fallback provider");

		let (events_tx, events_rx) = session_channel();
		match FallbackSession::new(viewer, self.ctx.fallback.clone(), Arc::clone(&self.ledger), events_tx) {
			Ok(fallback) => {
				st.sessions_created += 1;
				st.phase = SupervisorPhase::ConnectingFallback;
				self.install(st, ActiveSession::Fallback(fallback), events_rx);
			}
			Err(e) => {
				warn!(origin = %self.origin, error = %e, "fallback session init failed");
				self.report_terminal(st, format!("{BOTH_FAILED_PREFIX}: {e}"));
			}
		}
	}
}

/// Connect one delegate and relay its events until it reports a terminal state.
async fn pump(inner: Arc<SupervisorInner>, generation: u64, session: ActiveSession, mut events: SessionEventRx) {
	let kind = session.kind();
	match session.connect().await {
		Ok(_) => {}
		Err(SessionError::Cancelled) => return,
		Err(e) => {
			inner.on_failure(generation, kind, e.to_string(), None);
			return;
		}
	}

	while let Some(event) = events.recv().await {
		match event {
			SessionEvent::Connected(info) => inner.on_connected(generation, info),
			SessionEvent::Message { category, payload } => {
				inner.forward(generation, OutwardEvent::Message { category, payload });
			}
			SessionEvent::StreamEnd => inner.forward(generation, OutwardEvent::StreamEnd),
			SessionEvent::Disconnected { reason, cause } => {
				inner.on_failure(generation, kind, reason, Some(cause));
				return;
			}
		}
	}
}
