//! Throttled request/response exchanges with the remote PACS.

use crate::client::{ClientError, PacsClient, PacsRequest, PacsResponse};
use crate::config::{ProtocolConfig, RateConfig};
use crate::gauge::RateGauge;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum SendError {
	#[error("{request} to {endpoint} timed out after {timeout:?}")]
	Timeout {
		endpoint: String,
		request: String,
		timeout: Duration,
	},
	#[error("{request} to {endpoint} was cancelled")]
	Cancelled { endpoint: String, request: String },
	#[error("{request} to {endpoint} failed: {source}")]
	Exchange {
		endpoint: String,
		request: String,
		#[source]
		source: ClientError,
	},
}

impl SendError {
	/// Whether the remote rejected the request itself.
	pub const fn is_fatal(&self) -> bool {
		match self {
			Self::Exchange { source, .. } => source.is_fatal(),
			Self::Timeout { .. } | Self::Cancelled { .. } => false,
		}
	}

	pub const fn is_cancelled(&self) -> bool {
		matches!(self, Self::Cancelled { .. })
	}
}

/// Sleeps for `duration` unless `cancel` fires first. Returns `false` if cancelled.
pub(crate) async fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
	if duration.is_zero() {
		return !cancel.is_cancelled();
	}
	tokio::select! {
		biased;
		() = cancel.cancelled() => false,
		() = tokio::time::sleep(duration) => true,
	}
}

/// Wraps single exchanges with a timeout, cancellation, a rate gate and a post-send cooldown.
///
/// The cooldown is a fixed delay after every successful exchange, independent of how long the
/// exchange took.
///
/// A timed-out or cancelled exchange is no longer awaited: its future is dropped, which for
/// [`crate::dimse::DimseClient`] shuts down the association socket and aborts the exchange at the
/// transport level. The remote may still complete work it had already started, such as C-MOVE
/// sub-operations.
#[derive(Debug, Clone)]
pub struct RequestThrottler {
	timeout: Duration,
	cooldown: Duration,
	gauge: Arc<RateGauge>,
	pause: Duration,
}

impl RequestThrottler {
	pub const fn new(
		timeout: Duration,
		cooldown: Duration,
		gauge: Arc<RateGauge>,
		pause: Duration,
	) -> Self {
		Self {
			timeout,
			cooldown,
			gauge,
			pause,
		}
	}

	pub fn from_config(protocol: &ProtocolConfig, rate: &RateConfig, gauge: Arc<RateGauge>) -> Self {
		Self::new(protocol.timeout(), protocol.cooldown(), gauge, rate.pause())
	}

	/// Performs one exchange and waits for it at most `timeout`.
	pub async fn send<C: PacsClient>(
		&self,
		client: &C,
		request: &PacsRequest,
		cancel: &CancellationToken,
	) -> Result<PacsResponse, SendError> {
		let cancelled = || SendError::Cancelled {
			endpoint: String::from(client.endpoint()),
			request: request.to_string(),
		};

		if !self.gate(cancel).await {
			return Err(cancelled());
		}

		let started = Instant::now();
		let result = tokio::select! {
			biased;
			() = cancel.cancelled() => return Err(cancelled()),
			result = tokio::time::timeout(self.timeout, client.send(request)) => result,
		};

		match result {
			Ok(Ok(response)) => {
				debug!(
					endpoint = client.endpoint(),
					%request,
					elapsed = ?started.elapsed(),
					"Exchange completed"
				);
				Ok(response)
			}
			Ok(Err(source)) => {
				error!(endpoint = client.endpoint(), %request, "Exchange failed: {source}");
				Err(SendError::Exchange {
					endpoint: String::from(client.endpoint()),
					request: request.to_string(),
					source,
				})
			}
			Err(_) => {
				warn!(
					endpoint = client.endpoint(),
					%request,
					timeout = ?self.timeout,
					"Exchange timed out"
				);
				Err(SendError::Timeout {
					endpoint: String::from(client.endpoint()),
					request: request.to_string(),
					timeout: self.timeout,
				})
			}
		}
	}

	/// Like [`Self::send`], followed by the configured cooldown if the exchange succeeded.
	pub async fn cooldown_send<C: PacsClient>(
		&self,
		client: &C,
		request: &PacsRequest,
		cancel: &CancellationToken,
	) -> Result<PacsResponse, SendError> {
		let response = self.send(client, request, cancel).await?;
		if sleep_unless_cancelled(self.cooldown, cancel).await {
			Ok(response)
		} else {
			Err(SendError::Cancelled {
				endpoint: String::from(client.endpoint()),
				request: request.to_string(),
			})
		}
	}

	/// Sends a liveness probe through the same path as every other request.
	pub async fn check<C: PacsClient>(
		&self,
		client: &C,
		cancel: &CancellationToken,
	) -> Result<(), SendError> {
		match self.send(client, &PacsRequest::Echo, cancel).await? {
			PacsResponse::Echo => Ok(()),
			_ => Err(SendError::Exchange {
				endpoint: String::from(client.endpoint()),
				request: PacsRequest::Echo.to_string(),
				source: ClientError::UnexpectedResponse(PacsRequest::Echo.to_string()),
			}),
		}
	}

	/// Records the exchange with the rate gauge and pauses while the rate is exceeded.
	async fn gate(&self, cancel: &CancellationToken) -> bool {
		let exceeded = self.gauge.tick(Instant::now(), || {
			warn!(
				threshold = self.gauge.threshold(),
				pause = ?self.pause,
				"Request rate exceeded"
			);
		});
		if exceeded {
			sleep_unless_cancelled(self.pause, cancel).await
		} else {
			!cancel.is_cancelled()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::client::testing::{connection_lost, rejected, ScriptedClient};
	use crate::client::MoveSummary;
	use crate::model::StudyToFetch;

	fn throttler(threshold: usize) -> RequestThrottler {
		RequestThrottler::new(
			Duration::from_secs(10),
			Duration::from_secs(2),
			Arc::new(RateGauge::new(threshold)),
			Duration::from_secs(30),
		)
	}

	#[tokio::test(start_paused = true)]
	async fn completes_within_timeout() {
		let client = ScriptedClient::new().then_after(
			Duration::from_secs(3),
			Ok(PacsResponse::Studies(vec![StudyToFetch::new("1.2.3")])),
		);
		let started = Instant::now();

		let response = throttler(10)
			.send(&client, &PacsRequest::Echo, &CancellationToken::new())
			.await
			.unwrap();

		assert_eq!(
			response,
			PacsResponse::Studies(vec![StudyToFetch::new("1.2.3")])
		);
		assert_eq!(started.elapsed(), Duration::from_secs(3));
	}

	#[tokio::test(start_paused = true)]
	async fn cooldown_follows_successful_send() {
		let client = ScriptedClient::new().then_after(Duration::from_secs(1), Ok(PacsResponse::Echo));
		let started = Instant::now();

		throttler(10)
			.cooldown_send(&client, &PacsRequest::Echo, &CancellationToken::new())
			.await
			.unwrap();

		assert_eq!(started.elapsed(), Duration::from_secs(3));
	}

	#[tokio::test(start_paused = true)]
	async fn no_cooldown_after_failure() {
		let client = ScriptedClient::new().then(Err(connection_lost()));
		let started = Instant::now();

		let err = throttler(10)
			.cooldown_send(&client, &PacsRequest::Echo, &CancellationToken::new())
			.await
			.unwrap_err();

		assert!(matches!(err, SendError::Exchange { .. }));
		assert_eq!(started.elapsed(), Duration::ZERO);
	}

	#[tokio::test(start_paused = true)]
	async fn times_out() {
		let client = ScriptedClient::new().then_after(Duration::from_secs(60), Ok(PacsResponse::Echo));
		let started = Instant::now();

		let err = throttler(10)
			.send(&client, &PacsRequest::Echo, &CancellationToken::new())
			.await
			.unwrap_err();

		assert!(matches!(err, SendError::Timeout { timeout, .. } if timeout == Duration::from_secs(10)));
		assert_eq!(started.elapsed(), Duration::from_secs(10));
		assert!(!err.is_fatal());
	}

	#[tokio::test(start_paused = true)]
	async fn timeout_bounds_the_whole_move() {
		let client = ScriptedClient::new().then_after(
			Duration::from_secs(11),
			Ok(PacsResponse::Moved(MoveSummary {
				completed: 500,
				failed: 0,
				warning: 0,
			})),
		);
		let request = PacsRequest::MoveStudy {
			study_instance_uid: String::from("1.2.3"),
		};

		let err = throttler(10)
			.send(&client, &request, &CancellationToken::new())
			.await
			.unwrap_err();

		assert!(matches!(err, SendError::Timeout { ref request, .. } if request == "C-MOVE 1.2.3"));
	}

	#[tokio::test(start_paused = true)]
	async fn exchange_error_carries_context() {
		let client = ScriptedClient::new().then(Err(rejected("C-FIND")));
		let request = PacsRequest::MoveStudy {
			study_instance_uid: String::from("1.2.3"),
		};

		let err = throttler(10)
			.send(&client, &request, &CancellationToken::new())
			.await
			.unwrap_err();

		assert!(err.is_fatal());
		assert_eq!(
			err.to_string(),
			"C-MOVE 1.2.3 to PACS@127.0.0.1:11112 failed: C-FIND failed with status 0xA900"
		);
	}

	#[tokio::test(start_paused = true)]
	async fn cancellation_aborts_the_wait() {
		let client = ScriptedClient::new().then_after(Duration::from_secs(5), Ok(PacsResponse::Echo));
		let cancel = CancellationToken::new();
		let started = Instant::now();

		let trigger = cancel.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_secs(1)).await;
			trigger.cancel();
		});

		let err = throttler(10)
			.send(&client, &PacsRequest::Echo, &cancel)
			.await
			.unwrap_err();

		assert!(err.is_cancelled());
		assert_eq!(started.elapsed(), Duration::from_secs(1));
	}

	#[tokio::test(start_paused = true)]
	async fn pauses_while_rate_is_exceeded() {
		let client = ScriptedClient::new()
			.then(Ok(PacsResponse::Echo))
			.then(Ok(PacsResponse::Echo));
		let throttler = throttler(1);
		let cancel = CancellationToken::new();
		let started = Instant::now();

		throttler.send(&client, &PacsRequest::Echo, &cancel).await.unwrap();
		assert_eq!(started.elapsed(), Duration::ZERO);

		throttler.send(&client, &PacsRequest::Echo, &cancel).await.unwrap();
		assert_eq!(started.elapsed(), Duration::from_secs(30));
	}

	#[tokio::test(start_paused = true)]
	async fn check_sends_echo() {
		let client = ScriptedClient::new()
			.then(Ok(PacsResponse::Echo))
			.then(Ok(PacsResponse::Studies(Vec::new())));
		let throttler = throttler(10);
		let cancel = CancellationToken::new();

		throttler.check(&client, &cancel).await.unwrap();
		let err = throttler.check(&client, &cancel).await.unwrap_err();

		assert!(matches!(
			err,
			SendError::Exchange {
				source: ClientError::UnexpectedResponse(_),
				..
			}
		));
		assert_eq!(client.requests(), vec![PacsRequest::Echo, PacsRequest::Echo]);
	}
}
