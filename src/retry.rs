//! Retry with backoff for the fetch of one window.
//!
//! Each window goes through an explicit state machine:
//!
//! ```text
//! Attempting ──ok──────────────────────────► Succeeded
//!     │ ├──fatal───────────────────────────► Failed
//!     │ ├──cancelled───────────────────────► Cancelled
//!     │ └──retryable, budget exhausted─────► Failed
//!     └──retryable, budget left──► Retrying ──cooldown──► Attempting
//! ```

use crate::config::RetryConfig;
use crate::model::FetchWindow;
use crate::throttle::sleep_unless_cancelled;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Outcome of a failed attempt, classified by the operation itself.
#[derive(Debug, Error)]
pub enum AttemptError<E> {
	#[error("{0}")]
	Retryable(E),
	#[error("{0}")]
	Fatal(E),
	#[error("Attempt was cancelled")]
	Cancelled,
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
	#[error("Fetch was cancelled")]
	Cancelled,
	#[error("Download of window {window} failed after {attempts} attempt(s): {cause}")]
	DownloadFailed {
		window: FetchWindow,
		attempts: u32,
		#[source]
		cause: E,
	},
}

impl<E> RetryError<E> {
	pub const fn is_cancelled(&self) -> bool {
		matches!(self, Self::Cancelled)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
	Attempting,
	Retrying,
	Succeeded,
	Failed,
	Cancelled,
}

/// What to do after a failed attempt.
#[derive(Debug)]
pub enum Decision<E> {
	Retry { cooldown: Duration },
	Stop(RetryError<E>),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
	max_attempts: u32,
	cooldowns: Vec<Duration>,
}

impl RetryPolicy {
	/// `max_attempts` counts retries, so an operation runs at most `max_attempts + 1` times.
	pub const fn new(max_attempts: u32, cooldowns: Vec<Duration>) -> Self {
		Self {
			max_attempts,
			cooldowns,
		}
	}

	pub fn from_config(config: &RetryConfig) -> Self {
		Self::new(config.max_attempts, config.cooldowns())
	}

	/// Delay before retry number `retry` (zero-based). The last configured delay repeats.
	pub fn cooldown(&self, retry: u32) -> Duration {
		let index = usize::try_from(retry).unwrap_or(usize::MAX);
		self.cooldowns
			.get(index)
			.or_else(|| self.cooldowns.last())
			.copied()
			.unwrap_or_default()
	}

	pub const fn begin(&self, window: FetchWindow) -> RetryState<'_> {
		RetryState {
			policy: self,
			window,
			attempts_remaining: self.max_attempts,
			attempt: 0,
			phase: RetryPhase::Attempting,
		}
	}

	/// Runs `operation` until it succeeds, fails fatally, runs out of retries or is cancelled.
	/// The operation receives the one-based attempt number.
	pub async fn run<T, E, F, Fut>(
		&self,
		window: FetchWindow,
		cancel: &CancellationToken,
		mut operation: F,
	) -> Result<T, RetryError<E>>
	where
		E: std::fmt::Display,
		F: FnMut(u32) -> Fut,
		Fut: Future<Output = Result<T, AttemptError<E>>>,
	{
		let mut state = self.begin(window);
		loop {
			let attempt = state.next_attempt::<E>(cancel)?;
			match operation(attempt).await {
				Ok(value) => {
					state.succeed();
					return Ok(value);
				}
				Err(failure) => state.fail(failure, cancel).await?,
			}
		}
	}
}

/// Bookkeeping for the attempts of one window.
#[derive(Debug)]
pub struct RetryState<'a> {
	policy: &'a RetryPolicy,
	window: FetchWindow,
	attempts_remaining: u32,
	attempt: u32,
	phase: RetryPhase,
}

impl RetryState<'_> {
	pub const fn phase(&self) -> RetryPhase {
		self.phase
	}

	pub const fn attempts_remaining(&self) -> u32 {
		self.attempts_remaining
	}

	/// Number of attempts started so far.
	pub const fn attempts(&self) -> u32 {
		self.attempt
	}

	/// Starts the next attempt, unless cancellation was requested.
	pub fn next_attempt<E>(&mut self, cancel: &CancellationToken) -> Result<u32, RetryError<E>> {
		if cancel.is_cancelled() {
			self.phase = RetryPhase::Cancelled;
			return Err(RetryError::Cancelled);
		}
		self.phase = RetryPhase::Attempting;
		self.attempt += 1;
		Ok(self.attempt)
	}

	pub fn succeed(&mut self) {
		self.phase = RetryPhase::Succeeded;
	}

	/// Applies a failed attempt to the state machine.
	pub fn on_failure<E>(&mut self, failure: AttemptError<E>) -> Decision<E> {
		let give_up = |cause| RetryError::DownloadFailed {
			window: self.window,
			attempts: self.attempt,
			cause,
		};

		match failure {
			AttemptError::Cancelled => {
				self.phase = RetryPhase::Cancelled;
				Decision::Stop(RetryError::Cancelled)
			}
			AttemptError::Fatal(cause) => {
				let err = give_up(cause);
				self.phase = RetryPhase::Failed;
				Decision::Stop(err)
			}
			AttemptError::Retryable(cause) if self.attempts_remaining == 0 => {
				let err = give_up(cause);
				self.phase = RetryPhase::Failed;
				Decision::Stop(err)
			}
			AttemptError::Retryable(_) => {
				let cooldown = self
					.policy
					.cooldown(self.policy.max_attempts - self.attempts_remaining);
				self.attempts_remaining -= 1;
				self.phase = RetryPhase::Retrying;
				Decision::Retry { cooldown }
			}
		}
	}

	/// Applies a failed attempt and sleeps through the cooldown if a retry follows.
	pub async fn fail<E: std::fmt::Display>(
		&mut self,
		failure: AttemptError<E>,
		cancel: &CancellationToken,
	) -> Result<(), RetryError<E>> {
		let cause = failure.to_string();
		match self.on_failure(failure) {
			Decision::Retry { cooldown } => {
				warn!(
					window = %self.window,
					attempt = self.attempt,
					attempts_remaining = self.attempts_remaining,
					?cooldown,
					"Attempt failed, retrying: {cause}"
				);
				if sleep_unless_cancelled(cooldown, cancel).await {
					Ok(())
				} else {
					self.phase = RetryPhase::Cancelled;
					Err(RetryError::Cancelled)
				}
			}
			Decision::Stop(err) => {
				if !err.is_cancelled() {
					error!(window = %self.window, attempt = self.attempt, "Giving up: {cause}");
				}
				Err(err)
			}
		}
	}
}
