#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::statistics::StatisticsCounter;

#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	statistics: Arc<StatisticsCounter>,
}

impl HealthState {
	pub fn new(statistics: Arc<StatisticsCounter>) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			statistics,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, "health endpoint listening");
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(route(req.method(), req.uri().path(), &state))
}

fn reply(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

pub(crate) fn route(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return reply(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
	}

	match path {
		"/healthz" => reply(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" if state.is_ready() => reply(StatusCode::OK, Bytes::from_static(b"ready")),
		"/readyz" => reply(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready")),
		"/statistics" => match serde_json::to_vec(&state.statistics.snapshot()) {
			Ok(body) => {
				let mut resp = reply(StatusCode::OK, body);
				resp.headers_mut()
					.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
				resp
			}
			Err(err) => {
				warn!(error = %err, "failed to encode statistics");
				reply(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
			}
		},
		_ => reply(StatusCode::NOT_FOUND, Bytes::new()),
	}
}

#[cfg(test)]
mod tests {
	use http_body_util::BodyExt;

	use super::*;

	async fn body(resp: Response<Full<Bytes>>) -> Bytes {
		resp.into_body().collect().await.expect("infallible body").to_bytes()
	}

	#[tokio::test]
	async fn readiness_flips_once_marked() {
		let state = HealthState::new(Arc::new(StatisticsCounter::new()));
		assert_eq!(route(&Method::GET, "/healthz", &state).status(), StatusCode::OK);

		let resp = route(&Method::GET, "/readyz", &state);
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(body(resp).await, Bytes::from_static(b"not-ready"));

		state.mark_ready();
		assert_eq!(route(&Method::GET, "/readyz", &state).status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn statistics_are_served_as_json() {
		let counter = Arc::new(StatisticsCounter::new());
		counter.increment();
		counter.increment();
		let state = HealthState::new(counter);

		let resp = route(&Method::GET, "/statistics", &state);
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(
			resp.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
			Some("application/json")
		);
		let value: serde_json::Value = serde_json::from_slice(&body(resp).await).expect("json");
		assert_eq!(value, serde_json::json!({"globalConnectionCount": 2}));
	}

	#[test]
	fn unknown_paths_and_methods_are_rejected() {
		let state = HealthState::new(Arc::new(StatisticsCounter::new()));
		assert_eq!(route(&Method::POST, "/healthz", &state).status(), StatusCode::METHOD_NOT_ALLOWED);
		assert_eq!(route(&Method::GET, "/nope", &state).status(), StatusCode::NOT_FOUND);
	}
}
