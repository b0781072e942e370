#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use relay_platform::FallbackConfig;
use relay_platform::backoff::BackoffPolicy;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::server::rate_limiter::RateLimitPolicy;

/// Default config path: `~/.live-relay/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".live-relay").join("config.toml"))
}

/// Load the relay config from TOML, apply `RELAY_*` env overrides and validate.
pub fn load_relay_config_from_path(path: &Path) -> anyhow::Result<RelayConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = RelayConfig::from_file(file_cfg);
	apply_overrides(&mut cfg, |key| std::env::var(key).ok()).context("apply env overrides")?;
	cfg.validate().context("validate relay config")?;

	Ok(cfg)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
	#[error("{var}: expected {expected}, got {value:?}")]
	InvalidEnv {
		var: &'static str,
		expected: &'static str,
		value: String,
	},

	#[error("{field} must be at least 1")]
	NonPositive { field: &'static str },

	#[error("upstream.initial_delay_ms ({initial_ms}) exceeds upstream.max_delay_ms ({max_ms})")]
	BackoffOrder { initial_ms: u64, max_ms: u64 },

	#[error("fallback.endpoint {0:?} must be a ws:// or wss:// URL")]
	FallbackEndpoint(String),
}

#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
	pub server: ServerSettings,
	pub rate_limit: RateLimitSettings,
	pub upstream: UpstreamSettings,
	pub fallback: FallbackSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	pub statistics_interval: Duration,
	/// Provider session id injected into every session's options.
	pub session_id: Option<String>,
	/// Use `x-forwarded-for` for loopback peers.
	pub trust_forwarded_for: bool,
	pub enable_demo_provider: bool,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			metrics_bind: None,
			health_bind: None,
			statistics_interval: Duration::from_millis(5000),
			session_id: None,
			trust_forwarded_for: true,
			enable_demo_provider: false,
		}
	}
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
	pub enabled: bool,
	pub max_connections: u32,
	pub max_requests_per_window: u32,
	pub window: Duration,
}

impl Default for RateLimitSettings {
	fn default() -> Self {
		Self {
			enabled: false,
			max_connections: 10,
			max_requests_per_window: 5,
			window: Duration::from_secs(60),
		}
	}
}

impl RateLimitSettings {
	pub fn policy(&self) -> RateLimitPolicy {
		RateLimitPolicy {
			enabled: self.enabled,
			max_connections: self.max_connections,
			max_requests_per_window: self.max_requests_per_window,
			window: self.window,
		}
	}
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
	pub reconnect_enabled: bool,
	pub initial_delay: Duration,
	pub max_delay: Duration,
	pub max_attempts: u32,
}

impl Default for UpstreamSettings {
	fn default() -> Self {
		let policy = BackoffPolicy::default();
		Self {
			reconnect_enabled: policy.enabled,
			initial_delay: policy.initial_delay,
			max_delay: policy.max_delay,
			max_attempts: policy.max_attempts,
		}
	}
}

impl UpstreamSettings {
	pub fn backoff_policy(&self) -> BackoffPolicy {
		BackoffPolicy {
			enabled: self.reconnect_enabled,
			initial_delay: self.initial_delay,
			max_delay: self.max_delay,
			max_attempts: self.max_attempts,
		}
	}
}

#[derive(Debug, Clone)]
pub struct FallbackSettings {
	pub endpoint: String,
	pub reconnect_enabled: bool,
	pub max_attempts: u32,
	pub retry_delay: Duration,
	pub connect_timeout: Duration,
	pub ping_interval: Duration,
}

impl Default for FallbackSettings {
	fn default() -> Self {
		let cfg = FallbackConfig::default();
		Self {
			endpoint: cfg.endpoint,
			reconnect_enabled: cfg.reconnect_enabled,
			max_attempts: cfg.max_attempts,
			retry_delay: cfg.retry_delay,
			connect_timeout: cfg.connect_timeout,
			ping_interval: cfg.ping_interval,
		}
	}
}

impl FallbackSettings {
	pub fn session_config(&self) -> FallbackConfig {
		FallbackConfig {
			endpoint: self.endpoint.clone(),
			reconnect_enabled: self.reconnect_enabled,
			max_attempts: self.max_attempts,
			retry_delay: self.retry_delay,
			connect_timeout: self.connect_timeout,
			ping_interval: self.ping_interval,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	rate_limit: FileRateLimitSettings,

	#[serde(default)]
	upstream: FileUpstreamSettings,

	#[serde(default)]
	fallback: FileFallbackSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	statistics_interval_ms: Option<u64>,
	session_id: Option<String>,
	trust_forwarded_for: Option<bool>,
	enable_demo_provider: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRateLimitSettings {
	enabled: Option<bool>,
	max_connections: Option<u32>,
	max_requests_per_window: Option<u32>,
	window_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileUpstreamSettings {
	reconnect_enabled: Option<bool>,
	initial_delay_ms: Option<u64>,
	max_delay_ms: Option<u64>,
	max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileFallbackSettings {
	endpoint: Option<String>,
	reconnect_enabled: Option<bool>,
	max_attempts: Option<u32>,
	delay_ms: Option<u64>,
	connect_timeout_ms: Option<u64>,
	ping_interval_ms: Option<u64>,
}

impl RelayConfig {
	fn from_file(file: FileConfig) -> Self {
		let server_defaults = ServerSettings::default();
		let rate_defaults = RateLimitSettings::default();
		let upstream_defaults = UpstreamSettings::default();
		let fallback_defaults = FallbackSettings::default();

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				statistics_interval: file
					.server
					.statistics_interval_ms
					.map(Duration::from_millis)
					.unwrap_or(server_defaults.statistics_interval),
				session_id: file.server.session_id.filter(|s| !s.trim().is_empty()),
				trust_forwarded_for: file
					.server
					.trust_forwarded_for
					.unwrap_or(server_defaults.trust_forwarded_for),
				enable_demo_provider: file.server.enable_demo_provider.unwrap_or(false),
			},
			rate_limit: RateLimitSettings {
				enabled: file.rate_limit.enabled.unwrap_or(rate_defaults.enabled),
				max_connections: file.rate_limit.max_connections.unwrap_or(rate_defaults.max_connections),
				max_requests_per_window: file
					.rate_limit
					.max_requests_per_window
					.unwrap_or(rate_defaults.max_requests_per_window),
				window: file
					.rate_limit
					.window_secs
					.map(Duration::from_secs)
					.unwrap_or(rate_defaults.window),
			},
			upstream: UpstreamSettings {
				reconnect_enabled: file.upstream.reconnect_enabled.unwrap_or(upstream_defaults.reconnect_enabled),
				initial_delay: file
					.upstream
					.initial_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(upstream_defaults.initial_delay),
				max_delay: file
					.upstream
					.max_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(upstream_defaults.max_delay),
				max_attempts: file.upstream.max_attempts.unwrap_or(upstream_defaults.max_attempts),
			},
			fallback: FallbackSettings {
				endpoint: file
					.fallback
					.endpoint
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(fallback_defaults.endpoint),
				reconnect_enabled: file.fallback.reconnect_enabled.unwrap_or(fallback_defaults.reconnect_enabled),
				max_attempts: file.fallback.max_attempts.unwrap_or(fallback_defaults.max_attempts),
				retry_delay: file
					.fallback
					.delay_ms
					.map(Duration::from_millis)
					.unwrap_or(fallback_defaults.retry_delay),
				connect_timeout: file
					.fallback
					.connect_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(fallback_defaults.connect_timeout),
				ping_interval: file
					.fallback
					.ping_interval_ms
					.map(Duration::from_millis)
					.unwrap_or(fallback_defaults.ping_interval),
			},
		}
	}

	/// Reject bounds that would make the relay misbehave at runtime.
	pub fn validate(&self) -> Result<(), ConfigError> {
		let positive: [(&'static str, u64); 8] = [
			("rate_limit.max_connections", self.rate_limit.max_connections.into()),
			("rate_limit.max_requests_per_window", self.rate_limit.max_requests_per_window.into()),
			("rate_limit.window_secs", self.rate_limit.window.as_secs()),
			("upstream.initial_delay_ms", self.upstream.initial_delay.as_millis() as u64),
			("upstream.max_delay_ms", self.upstream.max_delay.as_millis() as u64),
			("server.statistics_interval_ms", self.server.statistics_interval.as_millis() as u64),
			("fallback.connect_timeout_ms", self.fallback.connect_timeout.as_millis() as u64),
			("fallback.ping_interval_ms", self.fallback.ping_interval.as_millis() as u64),
		];
		for (field, value) in positive {
			if value == 0 {
				return Err(ConfigError::NonPositive { field });
			}
		}

		if self.upstream.initial_delay > self.upstream.max_delay {
			return Err(ConfigError::BackoffOrder {
				initial_ms: self.upstream.initial_delay.as_millis() as u64,
				max_ms: self.upstream.max_delay.as_millis() as u64,
			});
		}

		let endpoint = self.fallback.endpoint.trim();
		if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
			return Err(ConfigError::FallbackEndpoint(self.fallback.endpoint.clone()));
		}

		Ok(())
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn env_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
	parse_env_bool(value).ok_or_else(|| ConfigError::InvalidEnv {
		var,
		expected: "a boolean",
		value: value.to_string(),
	})
}

fn env_number<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
	value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnv {
		var,
		expected: "a non-negative integer",
		value: value.to_string(),
	})
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// Apply `RELAY_*` overrides read through `lookup`. Unparsable values are errors.
pub(crate) fn apply_overrides(
	cfg: &mut RelayConfig,
	lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
	if let Some(v) = lookup("RELAY_ENABLE_RATE_LIMIT") {
		cfg.rate_limit.enabled = env_bool("RELAY_ENABLE_RATE_LIMIT", &v)?;
		info!(enabled = cfg.rate_limit.enabled, "rate limit: enabled overridden by env");
	}

	if let Some(v) = lookup("RELAY_MAX_CONNECTIONS") {
		cfg.rate_limit.max_connections = env_number("RELAY_MAX_CONNECTIONS", &v)?;
		info!(
			max_connections = cfg.rate_limit.max_connections,
			"rate limit: max_connections overridden by env"
		);
	}

	if let Some(v) = lookup("RELAY_MAX_REQUESTS_PER_MINUTE") {
		cfg.rate_limit.max_requests_per_window = env_number("RELAY_MAX_REQUESTS_PER_MINUTE", &v)?;
		info!(
			max_requests = cfg.rate_limit.max_requests_per_window,
			"rate limit: max_requests_per_window overridden by env"
		);
	}

	if let Some(v) = lookup("RELAY_RATE_LIMIT_WINDOW_SECS") {
		let secs: u64 = env_number("RELAY_RATE_LIMIT_WINDOW_SECS", &v)?;
		cfg.rate_limit.window = Duration::from_secs(secs);
		info!(secs, "rate limit: window overridden by env");
	}

	if let Some(v) = lookup("RELAY_RECONNECT_INITIAL_DELAY_MS") {
		let ms: u64 = env_number("RELAY_RECONNECT_INITIAL_DELAY_MS", &v)?;
		cfg.upstream.initial_delay = Duration::from_millis(ms);
		debug!(ms, "upstream: initial_delay overridden by env");
	}

	if let Some(v) = lookup("RELAY_RECONNECT_MAX_DELAY_MS") {
		let ms: u64 = env_number("RELAY_RECONNECT_MAX_DELAY_MS", &v)?;
		cfg.upstream.max_delay = Duration::from_millis(ms);
		debug!(ms, "upstream: max_delay overridden by env");
	}

	if let Some(v) = lookup("RELAY_RECONNECT_MAX_ATTEMPTS") {
		cfg.upstream.max_attempts = env_number("RELAY_RECONNECT_MAX_ATTEMPTS", &v)?;
		debug!(
			max_attempts = cfg.upstream.max_attempts,
			"upstream: max_attempts overridden by env"
		);
	}

	if let Some(v) = lookup("RELAY_FALLBACK_WS_ENDPOINT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.fallback.endpoint = v;
			info!("fallback: endpoint overridden by env");
		}
	}

	if let Some(v) = lookup("RELAY_SESSION_ID") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.session_id = Some(v);
			info!("server config: session_id overridden by env");
		}
	}

	if let Some(v) = lookup("RELAY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Some(v) = lookup("RELAY_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Some(v) = lookup("RELAY_STATISTICS_INTERVAL_MS") {
		let ms: u64 = env_number("RELAY_STATISTICS_INTERVAL_MS", &v)?;
		cfg.server.statistics_interval = Duration::from_millis(ms);
		info!(ms, "server config: statistics_interval overridden by env");
	}

	if let Some(v) = lookup("RELAY_ENABLE_DEMO_PROVIDER") {
		cfg.server.enable_demo_provider = env_bool("RELAY_ENABLE_DEMO_PROVIDER", &v)?;
	}

	Ok(())
}
