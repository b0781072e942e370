#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use relay_domain::{ConnectionInfo, ProviderKind, ViewerId};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::protocol::{FallbackFrame, decode_frame};
use crate::backoff::{LinearBackoff, RetryStep};
use crate::{ConnectionCounter, DisconnectCause, ProviderError, SessionError, SessionEvent, SessionEventTx, SessionPhase};

/// Upper bound on sending our close frame during a requested disconnect.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub(crate) type FallbackWs =
	tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
pub struct FallbackConfig {
	pub endpoint: String,
	pub reconnect_enabled: bool,
	pub max_attempts: u32,
	/// Retry `n` waits `retry_delay * n`.
	pub retry_delay: Duration,
	pub connect_timeout: Duration,
	pub ping_interval: Duration,
}

impl Default for FallbackConfig {
	fn default() -> Self {
		Self {
			endpoint: "wss://tikfinity.zerody.one/tiktok/dapi".to_string(),
			reconnect_enabled: true,
			max_attempts: 3,
			retry_delay: Duration::from_millis(2000),
			connect_timeout: Duration::from_secs(15),
			ping_interval: Duration::from_secs(30),
		}
	}
}

/// `<endpoint>?uniqueId=<viewer>`, rejecting anything that is not a websocket URL.
pub fn fallback_url(endpoint: &str, viewer: &ViewerId) -> Result<Url, ProviderError> {
	let mut url =
		Url::parse(endpoint).map_err(|e| ProviderError::Init(format!("invalid fallback endpoint {endpoint}: {e}")))?;
	if !matches!(url.scheme(), "ws" | "wss") {
		return Err(ProviderError::Init(format!(
			"fallback endpoint must use ws or wss, got {}",
			url.scheme()
		)));
	}
	url.query_pairs_mut().append_pair("uniqueId", viewer.as_str());
	Ok(url)
}

/// Websocket link to the secondary provider.
#[derive(Clone)]
pub struct FallbackSession {
	inner: Arc<Inner>,
}

struct Inner {
	viewer: ViewerId,
	url: Url,
	cfg: FallbackConfig,
	counter: Arc<dyn ConnectionCounter>,
	events_tx: SessionEventTx,
	/// Wakes the driver when the client asks to disconnect.
	shutdown: Notify,
	state: Mutex<FallbackState>,
}

struct FallbackState {
	phase: SessionPhase,
	retry: LinearBackoff,
	client_requested_disconnect: bool,
	counted: bool,
	connected_reported: bool,
	terminal_reported: bool,
	driver: Option<JoinHandle<()>>,
}

enum LinkOutcome {
	StreamEnded,
	Closed(String),
	Cancelled,
}

impl FallbackSession {
	pub fn new(
		viewer: ViewerId,
		cfg: FallbackConfig,
		counter: Arc<dyn ConnectionCounter>,
		events_tx: SessionEventTx,
	) -> Result<Self, ProviderError> {
		let url = fallback_url(&cfg.endpoint, &viewer)?;
		let retry = LinearBackoff::new(cfg.retry_delay, cfg.max_attempts);
		Ok(Self {
			inner: Arc::new(Inner {
				viewer,
				url,
				cfg,
				counter,
				events_tx,
				shutdown: Notify::new(),
				state: Mutex::new(FallbackState {
					phase: SessionPhase::Idle,
					retry,
					client_requested_disconnect: false,
					counted: false,
					connected_reported: false,
					terminal_reported: false,
					driver: None,
				}),
			}),
		})
	}

	pub fn phase(&self) -> SessionPhase {
		self.inner.state.lock().phase
	}

	pub fn is_connected(&self) -> bool {
		let st = self.inner.state.lock();
		st.phase == SessionPhase::Connected && !st.client_requested_disconnect
	}

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

		metrics::counter!("relay_upstream_connect_total", "provider" => ProviderKind::Fallback.as_str()).increment(1);
		let viewer = self.inner.viewer.as_str();
		info!(%viewer, url = %self.inner.url, "connecting fallback provider");

		let mut ws = match self.inner.open().await {
			Ok(ws) => ws,
			Err(e) => {
				metrics::counter!("relay_upstream_connect_errors_total", "provider" => ProviderKind::Fallback.as_str()).increment(1);
				warn!(%viewer, error = %e, "fallback connect failed");
				let mut st = self.inner.state.lock();
				if st.client_requested_disconnect {
					return Err(SessionError::Cancelled);
				}
				st.phase = SessionPhase::Disconnected;
				return Err(SessionError::Connect(e.to_string()));
			}
		};

		let Some(info) = self.inner.establish() else {
			debug!(%viewer, "fallback connect landed after disconnect; closing socket");
			close_quietly(&mut ws).await;
			return Err(SessionError::Cancelled);
		};
		info!(%viewer, room_id = %info.room_id, "fallback connected");

		let unused = {
			let mut st = self.inner.state.lock();
			if st.client_requested_disconnect {
				Some(ws)
			} else {
				st.driver = Some(tokio::spawn(drive(self.inner.clone(), ws)));
				None
			}
		};
		if let Some(mut ws) = unused {
			close_quietly(&mut ws).await;
		}
		Ok(info)
	}

	/// Stop the session. Idempotent; uncounts at most once.
	///
	/// The driver sends a close frame and exits on its own.
	pub fn disconnect(&self) {
		{
			let mut st = self.inner.state.lock();
			if st.client_requested_disconnect {
				return;
			}
			st.client_requested_disconnect = true;
			st.phase = SessionPhase::Disconnected;
			self.inner.uncount(&mut st);
			st.driver = None;
		}
		self.inner.shutdown.notify_one();
		debug!(viewer = %self.inner.viewer, "fallback session disconnected");
	}
}

impl Inner {
	async fn open(&self) -> Result<FallbackWs, ProviderError> {
		match timeout(self.cfg.connect_timeout, tokio_tungstenite::connect_async(self.url.as_str())).await {
			Ok(Ok((ws, _resp))) => Ok(ws),
			Ok(Err(e)) => Err(ProviderError::Connect(e.to_string())),
			Err(_) => Err(ProviderError::Connect("TikFinity connection timeout".to_string())),
		}
	}

	fn establish(&self) -> Option<ConnectionInfo> {
		let mut st = self.state.lock();
		if st.client_requested_disconnect {
			return None;
		}
		st.retry.reset();
		st.phase = SessionPhase::Connected;
		if !st.counted {
			st.counted = true;
			self.counter.increment();
		}

		let info = ConnectionInfo::connected(format!("tikfinity_{}", self.viewer), ProviderKind::Fallback);
		if !st.connected_reported {
			st.connected_reported = true;
			let _ = self.events_tx.send(SessionEvent::Connected(info.clone()));
		}
		Some(info)
	}

	fn is_stopped(&self) -> bool {
		self.state.lock().client_requested_disconnect
	}

	fn uncount(&self, st: &mut FallbackState) {
		if std::mem::take(&mut st.counted) {
			self.counter.decrement();
		}
	}

	fn forward(&self, event: SessionEvent) {
		if self.is_stopped() {
			return;
		}
		let _ = self.events_tx.send(event);
	}

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
			metrics::counter!("relay_upstream_terminal_total", "provider" => ProviderKind::Fallback.as_str()).increment(1);
		}
		info!(viewer = %self.viewer, %reason, ?cause, "fallback session finished");
		let _ = self.events_tx.send(SessionEvent::Disconnected { reason, cause });
	}

	async fn pump(&self, ws: &mut FallbackWs) -> LinkOutcome {
		let period = self.cfg.ping_interval;
		let mut ping = interval_at(Instant::now() + period, period);
		let viewer = self.viewer.as_str();

		loop {
			tokio::select! {
				_ = self.shutdown.notified() => return LinkOutcome::Cancelled,

				_ = ping.tick() => {
					if let Err(e) = ws.send(Message::Ping(Default::default())).await {
						return LinkOutcome::Closed(e.to_string());
					}
				}

				msg = ws.next() => {
					let Some(msg) = msg else {
						return LinkOutcome::Closed(String::new());
					};
					let msg = match msg {
						Ok(m) => m,
						Err(e) => return LinkOutcome::Closed(e.to_string()),
					};

					match msg {
						Message::Text(t) => match decode_frame(&t) {
							Ok(FallbackFrame::StreamEnd) => return LinkOutcome::StreamEnded,
							Ok(FallbackFrame::Message { category, payload }) => {
								self.forward(SessionEvent::Message { category, payload });
							}
							Err(e) => debug!(%viewer, error = %e, "dropping unparsable fallback frame"),
						},
						Message::Pong(_) => debug!(%viewer, "fallback pong"),
						Message::Close(frame) => {
							let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
							return LinkOutcome::Closed(reason);
						}
						_ => {}
					}
				}
			}
		}
	}

	/// Linear retries after the socket closed. Returns the new socket once re-established.
	async fn recover(&self, reason: String) -> Option<FallbackWs> {
		{
			let mut st = self.state.lock();
			if st.client_requested_disconnect {
				return None;
			}
			self.uncount(&mut st);
			st.phase = SessionPhase::Reconnecting;
		}

		let viewer = self.viewer.as_str();
		info!(%viewer, %reason, "fallback socket closed");

		if !self.cfg.reconnect_enabled {
			let reason = if reason.is_empty() { "Connection closed".to_string() } else { reason };
			self.finish(reason, DisconnectCause::ReconnectDisabled);
			return None;
		}

		loop {
			let (delay, attempt) = {
				let mut st = self.state.lock();
				if st.client_requested_disconnect {
					return None;
				}
				match st.retry.next_step() {
					RetryStep::Retry { delay, attempt } => (delay, attempt),
					RetryStep::GiveUp => {
						drop(st);
						self.finish(
							"Max reconnect attempts exceeded".to_string(),
							DisconnectCause::RetriesExhausted,
						);
						return None;
					}
				}
			};

			info!(%viewer, attempt, delay_ms = delay.as_millis() as u64, "scheduling fallback reconnect");
			tokio::select! {
				_ = self.shutdown.notified() => return None,
				_ = sleep(delay) => {}
			}
			if self.is_stopped() {
				return None;
			}
			metrics::counter!("relay_upstream_reconnect_attempts_total", "provider" => ProviderKind::Fallback.as_str()).increment(1);

			let opened = tokio::select! {
				_ = self.shutdown.notified() => return None,
				opened = self.open() => opened,
			};
			match opened {
				Ok(mut ws) => {
					if self.establish().is_none() {
						close_quietly(&mut ws).await;
						return None;
					}
					info!(%viewer, attempt, "fallback reconnected");
					return Some(ws);
				}
				Err(e) => warn!(%viewer, attempt, error = %e, "fallback reconnect failed"),
			}
		}
	}

	fn end_stream(&self) {
		if self.is_stopped() {
			return;
		}
		let _ = self.events_tx.send(SessionEvent::StreamEnd);
		self.finish("Stream ended".to_string(), DisconnectCause::StreamEnded);
	}
}

/// Send a close frame, giving up after [`CLOSE_GRACE`].
async fn close_quietly(ws: &mut FallbackWs) {
	if let Err(e) = timeout(CLOSE_GRACE, ws.close(None)).await.unwrap_or(Ok(())) {
		debug!(error = %e, "fallback close frame not delivered");
	}
}

async fn drive(inner: Arc<Inner>, mut ws: FallbackWs) {
	loop {
		match inner.pump(&mut ws).await {
			LinkOutcome::StreamEnded => {
				close_quietly(&mut ws).await;
				inner.end_stream();
				return;
			}
			LinkOutcome::Cancelled => {
				debug!(viewer = %inner.viewer, "closing fallback socket on request");
				close_quietly(&mut ws).await;
				return;
			}
			LinkOutcome::Closed(reason) => {
				drop(ws);
				match inner.recover(reason).await {
					Some(next) => ws = next,
					None => return,
				}
			}
		}
	}
}
