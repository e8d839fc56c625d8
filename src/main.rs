use chrono::Local;
use dicom_fetch::config::AppConfig;
use dicom_fetch::dimse::DimseClient;
use dicom_fetch::engine::FetchEngine;
use dicom_fetch::gauge::RateGauge;
use dicom_fetch::model::DateRange;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logger(level: tracing::Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	};

	guard
}

fn main() -> anyhow::Result<()> {
	let config = AppConfig::new()?;
	init_logger(config.telemetry.level());

	// Manually create the Tokio runtime because the Sentry client needs to be created *before* the
	// Tokio runtime, which prevents us from using the #[tokio::main] macro.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	let result = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(run(config));
	if let Err(error) = &result {
		error!("Fetch aborted due to error: {error:#}");
	}
	result
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
	let cancel = CancellationToken::new();
	tokio::spawn(shutdown_signal(cancel.clone()));

	let gauge = Arc::new(RateGauge::new(config.rate.threshold));
	let client = DimseClient::new(config.protocol.clone());
	let engine = FetchEngine::from_config(client, &config, gauge)?;

	engine.check(&cancel).await?;

	let now = Local::now().naive_local();
	let range = DateRange::new(config.fetch.from, config.fetch.to.unwrap_or(now))?;
	info!(
		from = %range.from(),
		to = %range.to(),
		modality = %config.fetch.modality,
		"Fetching range"
	);

	let summary = engine
		.fetch_range(range, &config.fetch.modality, now, &cancel, |result| {
			match result {
				Ok(chunk) => info!(
					window = %chunk.window,
					studies = chunk.studies.len(),
					directory = %chunk.directory.display(),
					"Window complete"
				),
				// The window is skipped, a later run with the same range picks it up again.
				Err(err) => warn!("Skipping window: {err}"),
			}
			ControlFlow::Continue(())
		})
		.await?;

	info!(
		windows_fetched = summary.windows_fetched,
		windows_failed = summary.windows_failed,
		studies_moved = summary.studies_moved,
		"Fetched range"
	);
	Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
	let ctrl_c = async {
		if let Err(err) = signal::ctrl_c().await {
			error!("Failed to listen for Ctrl-C: {err}");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut terminate) => {
				terminate.recv().await;
			}
			Err(err) => {
				error!("Failed to listen for SIGTERM: {err}");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}

	info!("Received shutdown signal, cancelling fetch");
	cancel.cancel();
}
