#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use relay_domain::{ConnectionInfo, ConnectionOptions, ProviderKind, ViewerId};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffPolicy, ExponentialBackoff, RetryStep};
use crate::{
	ConnectionCounter, DisconnectCause, ProviderBinding, ProviderClient, ProviderError, ProviderEvent, ProviderEventRx,
	ProviderFactory, ProviderRoom, SessionError, SessionEvent, SessionEventTx, SessionPhase,
};

const DEFAULT_LOSS_REASON: &str = "Max reconnect attempts exceeded";

/// The broadcast ended while a reconnect was pending.
struct StreamEndedDuringRecovery;

/// One viewer's link to the primary upstream provider.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct UpstreamSession {
	inner: Arc<Inner>,
}

struct Inner {
	viewer: ViewerId,
	client: Arc<dyn ProviderClient>,
	counter: Arc<dyn ConnectionCounter>,
	events_tx: SessionEventTx,
	state: Mutex<LinkState>,
}

struct LinkState {
	phase: SessionPhase,
	backoff: ExponentialBackoff,
	client_requested_disconnect: bool,
	stream_ended: bool,
	counted: bool,
	connected_reported: bool,
	terminal_reported: bool,
	provider_events: Option<ProviderEventRx>,
	driver: Option<JoinHandle<()>>,
}

impl UpstreamSession {
	/// Build the provider client and wrap it. Fails without side effects if the provider rejects the options.
	pub fn create(
		factory: &dyn ProviderFactory,
		viewer: ViewerId,
		options: &ConnectionOptions,
		policy: BackoffPolicy,
		counter: Arc<dyn ConnectionCounter>,
		events_tx: SessionEventTx,
	) -> Result<Self, ProviderError> {
		let binding = factory.create(&viewer, options)?;
		Ok(Self::new(viewer, binding, policy, counter, events_tx))
	}

	pub fn new(
		viewer: ViewerId,
		binding: ProviderBinding,
		policy: BackoffPolicy,
		counter: Arc<dyn ConnectionCounter>,
		events_tx: SessionEventTx,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				viewer,
				client: binding.client,
				counter,
				events_tx,
				state: Mutex::new(LinkState {
					phase: SessionPhase::Idle,
					backoff: ExponentialBackoff::new(policy),
					client_requested_disconnect: false,
					stream_ended: false,
					counted: false,
					connected_reported: false,
					terminal_reported: false,
					provider_events: Some(binding.events),
					driver: None,
				}),
			}),
		}
	}

	pub fn phase(&self) -> SessionPhase {
		self.inner.state.lock().phase
	}

	pub fn is_connected(&self) -> bool {
		let st = self.inner.state.lock();
		st.phase == SessionPhase::Connected && !st.client_requested_disconnect
	}

	/// Retries fired since the link was last established.
	pub fn reconnect_attempt(&self) -> u32 {
		self.inner.state.lock().backoff.attempt()
	}

	/// First connect. Emits `Connected` once, after the connection has been counted.
	pub async fn connect(&self) -> Result<ConnectionInfo, SessionError> {
		{
			let mut st = self.inner.state.lock();
			if st.client_requested_disconnect {
				return Err(SessionError::Cancelled);
			}
			if st.phase != SessionPhase::Idle {
				return Err(SessionError::AlreadyStarted);
			}
			st.phase = SessionPhase::Connecting;
		}

		metrics::counter!("relay_upstream_connect_total", "provider" => ProviderKind::Primary.as_str()).increment(1);
		let viewer = self.inner.viewer.as_str();

		let room = match self.inner.client.connect().await {
			Ok(room) => room,
			Err(e) => {
				metrics::counter!("relay_upstream_connect_errors_total", "provider" => ProviderKind::Primary.as_str())
					.increment(1);
				warn!(%viewer, error = %e, "upstream connect failed");
				let mut st = self.inner.state.lock();
				if st.client_requested_disconnect {
					return Err(SessionError::Cancelled);
				}
				st.phase = SessionPhase::Disconnected;
				return Err(SessionError::Connect(e.to_string()));
			}
		};

		let Some(info) = self.inner.establish(&room) else {
			debug!(%viewer, "connect landed after disconnect; dropping link");
			return Err(SessionError::Cancelled);
		};
		info!(%viewer, room_id = %info.room_id, "upstream connected");

		self.spawn_driver();
		Ok(info)
	}

	/// Stop the session. Idempotent; the connection is uncounted at most once.
	pub fn disconnect(&self) {
		let (driver, was_counted) = {
			let mut st = self.inner.state.lock();
			if st.client_requested_disconnect {
				return;
			}
			st.client_requested_disconnect = true;
			st.phase = SessionPhase::Disconnected;
			st.provider_events = None;
			let was_counted = std::mem::take(&mut st.counted);
			if was_counted {
				self.inner.counter.decrement();
			}
			(st.driver.take(), was_counted)
		};

		if let Some(handle) = driver {
			handle.abort();
		}
		self.inner.client.disconnect();
		debug!(viewer = %self.inner.viewer, was_counted, "upstream session disconnected");
	}

	fn spawn_driver(&self) {
		let mut st = self.inner.state.lock();
		if st.client_requested_disconnect {
			return;
		}
		let Some(events) = st.provider_events.take() else {
			return;
		};
		let inner = self.inner.clone();
		st.driver = Some(tokio::spawn(drive(inner, events)));
	}
}

impl Inner {
	/// Mark the link live. Returns `None` when the session was stopped meanwhile.
	fn establish(&self, room: &ProviderRoom) -> Option<ConnectionInfo> {
		let mut st = self.state.lock();
		if st.client_requested_disconnect || st.stream_ended {
			drop(st);
			self.client.disconnect();
			return None;
		}

		st.backoff.reset();
		st.phase = SessionPhase::Connected;
		if !st.counted {
			st.counted = true;
			self.counter.increment();
		}

		let info = ConnectionInfo::connected(room.room_id.clone(), ProviderKind::Primary);
		if !st.connected_reported {
			st.connected_reported = true;
			let _ = self.events_tx.send(SessionEvent::Connected(info.clone()));
		}
		Some(info)
	}

	fn is_stopped(&self) -> bool {
		self.state.lock().client_requested_disconnect
	}

	fn forward(&self, event: SessionEvent) {
		if self.is_stopped() {
			return;
		}
		let _ = self.events_tx.send(event);
	}

	fn uncount(&self, st: &mut LinkState) {
		if std::mem::take(&mut st.counted) {
			self.counter.decrement();
		}
	}

	/// Emit the single terminal event and release the connection count.
	fn finish(&self, reason: String, cause: DisconnectCause) {
		let mut st = self.state.lock();
		if st.client_requested_disconnect || st.terminal_reported {
			return;
		}
		st.terminal_reported = true;
		st.phase = SessionPhase::Disconnected;
		self.uncount(&mut st);
		st.driver = None;
		drop(st);

		if cause == DisconnectCause::RetriesExhausted {
			metrics::counter!("relay_upstream_terminal_total", "provider" => ProviderKind::Primary.as_str()).increment(1);
		}
		info!(viewer = %self.viewer, %reason, ?cause, "upstream session finished");
		let _ = self.events_tx.send(SessionEvent::Disconnected { reason, cause });
	}

	fn end_stream(&self) {
		{
			let mut st = self.state.lock();
			if st.client_requested_disconnect {
				return;
			}
			st.stream_ended = true;
		}
		let _ = self.events_tx.send(SessionEvent::StreamEnd);
		self.client.disconnect();
		self.finish("Stream ended".to_string(), DisconnectCause::StreamEnded);
	}

	/// Drive `fut` while still draining provider events.
	///
	/// Messages keep flowing; a stream end abandons `fut` and ends the session.
	async fn watching<F: Future>(
		&self,
		events: &mut ProviderEventRx,
		fut: F,
	) -> Result<F::Output, StreamEndedDuringRecovery> {
		tokio::pin!(fut);
		loop {
			tokio::select! {
				out = &mut fut => return Ok(out),
				event = events.recv() => match event {
					Some(ProviderEvent::StreamEnd) => {
						info!(viewer = %self.viewer, "stream ended while reconnecting");
						self.end_stream();
						return Err(StreamEndedDuringRecovery);
					}
					Some(ProviderEvent::Message { category, payload }) => {
						self.forward(SessionEvent::Message { category, payload });
					}
					Some(ProviderEvent::Error(message)) => {
						warn!(viewer = %self.viewer, error = %message, "upstream provider error");
					}
					Some(ProviderEvent::Disconnected) => debug!(viewer = %self.viewer, "drop reported while already reconnecting"),
					None => return Ok(fut.await),
				},
			}
		}
	}

	/// Walk the backoff schedule after an unsolicited drop. Returns `true` once the link is back.
	async fn recover(self: &Arc<Self>, events: &mut ProviderEventRx) -> bool {
		{
			let mut st = self.state.lock();
			if st.client_requested_disconnect || st.stream_ended {
				return false;
			}
			self.uncount(&mut st);
			st.phase = SessionPhase::Reconnecting;
		}

		let viewer = self.viewer.as_str();
		let mut last_error: Option<String> = None;

		loop {
			let (delay, attempt) = {
				let st = self.state.lock();
				if st.client_requested_disconnect {
					return false;
				}
				match st.backoff.next_step() {
					RetryStep::Retry { delay, attempt } => (delay, attempt),
					RetryStep::GiveUp => {
						let enabled = st.backoff.policy().enabled;
						drop(st);
						let (reason, cause) = if enabled {
							(
								format!("Connection lost. {}", last_error.as_deref().unwrap_or(DEFAULT_LOSS_REASON)),
								DisconnectCause::RetriesExhausted,
							)
						} else {
							("Connection lost. Reconnect disabled".to_string(), DisconnectCause::ReconnectDisabled)
						};
						self.finish(reason, cause);
						return false;
					}
				}
			};

			info!(%viewer, attempt, delay_ms = delay.as_millis() as u64, "scheduling upstream reconnect");
			if self.watching(events, tokio::time::sleep(delay)).await.is_err() {
				return false;
			}

			{
				let mut st = self.state.lock();
				if st.client_requested_disconnect {
					return false;
				}
				st.backoff.advance();
			}
			metrics::counter!("relay_upstream_reconnect_attempts_total", "provider" => ProviderKind::Primary.as_str()).increment(1);

			let outcome = match self.watching(events, self.client.connect()).await {
				Ok(outcome) => outcome,
				Err(StreamEndedDuringRecovery) => return false,
			};
			match outcome {
				Ok(room) => {
					if self.establish(&room).is_none() {
						return false;
					}
					info!(%viewer, attempt, "upstream reconnected");
					return true;
				}
				Err(e) => {
					warn!(%viewer, attempt, error = %e, "upstream reconnect failed");
					last_error = Some(e.to_string());
				}
			}
		}
	}
}

async fn drive(inner: Arc<Inner>, mut events: ProviderEventRx) {
	while let Some(event) = events.recv().await {
		match event {
			ProviderEvent::Message { category, payload } => {
				inner.forward(SessionEvent::Message { category, payload });
			}
			ProviderEvent::Error(message) => {
				warn!(viewer = %inner.viewer, error = %message, "upstream provider error");
			}
			ProviderEvent::StreamEnd => {
				inner.end_stream();
				return;
			}
			ProviderEvent::Disconnected => {
				info!(viewer = %inner.viewer, "upstream link dropped");
				if !inner.recover(&mut events).await {
					return;
				}
			}
		}
	}

	inner.finish(
		"Connection lost. provider event stream closed".to_string(),
		DisconnectCause::ProviderClosed,
	);
}
