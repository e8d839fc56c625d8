use crate::model::RangeError;
use crate::types::{Priority, Timestamp, AE};
use chrono::TimeDelta;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULTS: &str = include_str!("defaults.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub protocol: ProtocolConfig,
	pub rate: RateConfig,
	pub retry: RetryConfig,
	pub fetch: FetchConfig,
}

impl AppConfig {
	/// Loads the embedded defaults, overridden by an optional `config.toml` in the working
	/// directory, overridden by `DICOM_FETCH_*` environment variables
	/// (e.g. `DICOM_FETCH_PROTOCOL__REMOTE__HOST`).
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::Config;
		Config::builder()
			.add_source(config::File::from_str(DEFAULTS, config::FileFormat::Toml))
			.add_source(config::File::with_name("config.toml").required(false))
			.add_source(
				config::Environment::with_prefix("DICOM_FETCH")
					.prefix_separator("_")
					.separator("__")
					.list_separator(",")
					.with_list_parse_key("retry.cooldowns")
					.try_parsing(true),
			)
			.build()?
			.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	// Also configurable via RUST_LOG
	pub level: String,
	/// Sentry DSN. Sentry is disabled if unset.
	pub sentry: Option<String>,
}

impl TelemetryConfig {
	pub fn level(&self) -> tracing::Level {
		tracing::Level::from_str(&self.level).unwrap_or(tracing::Level::INFO)
	}
}

/// Connection parameters of the protocol client, fixed for its lifetime.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
	/// The calling AE title of this node.
	pub aet: AE,
	/// The AE title C-MOVE sub-operations are sent to.
	pub destination: AE,
	pub remote: RemoteConfig,
	/// Timeout of one whole exchange in milliseconds, including all pending responses of a
	/// C-MOVE. Must cover moving the largest expected study.
	pub timeout: u64,
	/// Delay after every successful exchange in milliseconds.
	pub cooldown: u64,
	#[serde(default)]
	pub priority: Priority,
}

impl ProtocolConfig {
	pub const fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout)
	}

	pub const fn cooldown(&self) -> Duration {
		Duration::from_millis(self.cooldown)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
	pub aet: AE,
	pub host: String,
	pub port: u16,
}

impl RemoteConfig {
	pub fn address(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateConfig {
	/// Exchanges per rolling minute before the gauge reports an excess.
	pub threshold: usize,
	/// Pause in milliseconds before an exchange while over the threshold.
	pub pause: u64,
}

impl RateConfig {
	pub const fn pause(&self) -> Duration {
		Duration::from_millis(self.pause)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
	/// Retries after the first attempt of a window.
	pub max_attempts: u32,
	/// Delays in milliseconds before each retry. The last delay repeats.
	pub cooldowns: Vec<u64>,
}

impl RetryConfig {
	pub fn cooldowns(&self) -> Vec<Duration> {
		self.cooldowns
			.iter()
			.copied()
			.map(Duration::from_millis)
			.collect()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
	pub cache_root: PathBuf,
	/// Maximum window size in seconds.
	pub window: i64,
	/// Category tag, used as modality filter and cache subdirectory.
	pub modality: String,
	pub from: Timestamp,
	/// Defaults to the current local time.
	pub to: Option<Timestamp>,
}

impl FetchConfig {
	pub fn window(&self) -> Result<TimeDelta, RangeError> {
		TimeDelta::try_seconds(self.window).ok_or(RangeError::WindowOverflow(self.window))
	}
}
