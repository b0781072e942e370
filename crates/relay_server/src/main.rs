#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use relay_platform::ProviderFactory;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use relay_server::config::{self, RelayConfig};
use relay_server::providers::{DemoProvider, NullProvider};
use relay_server::server::health::{HealthState, spawn_health_server};
use relay_server::server::hub::SessionHub;
use relay_server::server::rate_limiter::RateLimiter;
use relay_server::server::statistics::{StatisticsCounter, StatisticsSink, spawn_statistics_broadcast};
use relay_server::server::supervisor::SupervisorContext;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: relay_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.live-relay/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,relay_server=debug,relay_platform=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("relay_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// Upstream provider for this process. The demo provider is a dev-build-only opt-in.
fn select_provider(cfg: &RelayConfig) -> Arc<dyn ProviderFactory> {
	if cfg!(debug_assertions) && cfg.server.enable_demo_provider {
		info!("starting dev-only demo provider (enabled by config)");
		return Arc::new(DemoProvider::default());
	}
	if cfg.server.enable_demo_provider {
		warn!("demo provider requested but ignored in release builds");
	}
	Arc::new(NullProvider)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let relay_cfg = config::load_relay_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded relay config (toml + env overrides)");

	init_metrics(relay_cfg.server.metrics_bind.as_deref());

	let statistics = Arc::new(StatisticsCounter::new());
	let health_state = HealthState::new(statistics.clone());
	if let Some(bind) = relay_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => spawn_health_server(addr, health_state.clone()),
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let rate_limiter = Arc::new(RateLimiter::new(relay_cfg.rate_limit.policy()));
	let window_reset = rate_limiter.spawn_window_reset();

	let provider = select_provider(&relay_cfg);
	let ctx = SupervisorContext {
		rate_limiter,
		statistics: statistics.clone(),
		provider,
		upstream_policy: relay_cfg.upstream.backoff_policy(),
		fallback: relay_cfg.fallback.session_config(),
		session_id: relay_cfg.server.session_id.clone(),
	};
	let hub = Arc::new(SessionHub::new(ctx, relay_cfg.server.trust_forwarded_for));
	let stats_sink: Arc<dyn StatisticsSink> = hub.clone();
	let broadcast = spawn_statistics_broadcast(statistics, stats_sink, relay_cfg.server.statistics_interval);

	health_state.mark_ready();
	info!(
		rate_limit = relay_cfg.rate_limit.enabled,
		fallback = %relay_cfg.fallback.endpoint,
		"relay core ready"
	);

	tokio::signal::ctrl_c().await?;
	let closed = hub.close_all();
	window_reset.abort();
	broadcast.abort();
	info!(closed, "relay core shut down");

	Ok(())
}
