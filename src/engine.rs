//! Window-by-window retrieval of studies from a remote PACS.

use crate::cache::{CacheError, CacheLayout};
use crate::client::{PacsClient, PacsRequest, PacsResponse};
use crate::config::AppConfig;
use crate::gauge::RateGauge;
use crate::model::{DataChunk, DateRange, FetchWindow, RangeError, StudyToFetch};
use crate::retry::{AttemptError, RetryError, RetryPolicy};
use crate::throttle::{RequestThrottler, SendError};
use crate::types::Timestamp;
use crate::window::{TimeWindows, WindowSize};
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Why an attempt to fetch a window failed.
#[derive(Debug, Error)]
pub enum FetchCause {
	#[error(transparent)]
	Send(#[from] SendError),
	#[error(transparent)]
	Cache(#[from] CacheError),
	#[error("Unexpected response to {0}")]
	UnexpectedResponse(String),
}

impl FetchCause {
	fn classify(self) -> AttemptError<Self> {
		match self {
			Self::Send(ref err) if err.is_cancelled() => AttemptError::Cancelled,
			Self::Send(ref err) if err.is_fatal() => AttemptError::Fatal(self),
			Self::Cache(CacheError::InvalidTag(_)) => AttemptError::Fatal(self),
			_ => AttemptError::Retryable(self),
		}
	}

	const fn is_cancelled(&self) -> bool {
		matches!(self, Self::Send(err) if err.is_cancelled())
	}
}

pub type FetchError = RetryError<FetchCause>;

/// Totals of one [`FetchEngine::fetch_range`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSummary {
	pub windows_fetched: usize,
	pub windows_failed: usize,
	pub studies_moved: usize,
	/// Whether the driver callback broke off the range.
	pub stopped_early: bool,
}

/// Progress of one window, kept across its attempts.
#[derive(Debug, Default)]
struct WindowProgress {
	/// `None` until the study query succeeded.
	pending: Option<VecDeque<StudyToFetch>>,
	moved: Vec<StudyToFetch>,
}

pub struct FetchEngine<C> {
	client: C,
	throttler: RequestThrottler,
	retry: RetryPolicy,
	cache: CacheLayout,
	max_window: WindowSize,
}

impl<C: PacsClient> FetchEngine<C> {
	pub const fn new(
		client: C,
		throttler: RequestThrottler,
		retry: RetryPolicy,
		cache: CacheLayout,
		max_window: WindowSize,
	) -> Self {
		Self {
			client,
			throttler,
			retry,
			cache,
			max_window,
		}
	}

	/// Builds an engine from the application config. The gauge may be shared with other engines
	/// to enforce a global rate.
	pub fn from_config(
		client: C,
		config: &AppConfig,
		gauge: Arc<RateGauge>,
	) -> Result<Self, RangeError> {
		Ok(Self::new(
			client,
			RequestThrottler::from_config(&config.protocol, &config.rate, gauge),
			RetryPolicy::from_config(&config.retry),
			CacheLayout::new(&config.fetch.cache_root),
			WindowSize::new(config.fetch.window()?)?,
		))
	}

	pub const fn client(&self) -> &C {
		&self.client
	}

	/// Verifies that the remote PACS answers.
	pub async fn check(&self, cancel: &CancellationToken) -> Result<(), SendError> {
		self.throttler.check(&self.client, cancel).await?;
		info!(endpoint = self.client.endpoint(), "Remote PACS is reachable");
		Ok(())
	}

	/// Moves every study of `category` in `window`, retrying according to the retry policy.
	///
	/// Studies moved by an earlier attempt are not moved again. The chunk is returned only once
	/// every study found for the window has been moved.
	#[instrument(skip_all, name = "FETCH", fields(window = %window, category = category))]
	pub async fn fetch_window(
		&self,
		window: FetchWindow,
		category: &str,
		cancel: &CancellationToken,
	) -> Result<DataChunk, FetchError> {
		let mut progress = WindowProgress::default();
		let mut state = self.retry.begin(window);

		loop {
			let attempt = state.next_attempt::<FetchCause>(cancel)?;
			debug!(attempt, "Fetching window");
			match self.attempt(window, category, &mut progress, cancel).await {
				Ok(directory) => {
					state.succeed();
					info!(
						attempt,
						studies = progress.moved.len(),
						"Fetched window"
					);
					return Ok(DataChunk {
						window,
						category: String::from(category),
						directory,
						studies: progress.moved,
					});
				}
				Err(cause) => state.fail(cause.classify(), cancel).await?,
			}
		}
	}

	/// Fetches the windows of `range` up to `now` in order, handing each result to `on_window`.
	///
	/// A failed window is reported to `on_window` like a fetched one; the callback decides
	/// whether to go on. Cancellation ends the range with [`RetryError::Cancelled`].
	pub async fn fetch_range<F>(
		&self,
		range: DateRange,
		category: &str,
		now: Timestamp,
		cancel: &CancellationToken,
		mut on_window: F,
	) -> Result<RangeSummary, FetchError>
	where
		F: FnMut(Result<DataChunk, FetchError>) -> ControlFlow<()>,
	{
		let mut summary = RangeSummary::default();

		for window in TimeWindows::new(range, self.max_window, now) {
			let result = self.fetch_window(window, category, cancel).await;
			match &result {
				Ok(chunk) => {
					summary.windows_fetched += 1;
					summary.studies_moved += chunk.studies.len();
				}
				Err(RetryError::Cancelled) => return Err(RetryError::Cancelled),
				Err(_) => summary.windows_failed += 1,
			}

			if on_window(result).is_break() {
				warn!(%window, "Fetch of range stopped early");
				summary.stopped_early = true;
				break;
			}
		}

		Ok(summary)
	}

	async fn attempt(
		&self,
		window: FetchWindow,
		category: &str,
		progress: &mut WindowProgress,
		cancel: &CancellationToken,
	) -> Result<PathBuf, FetchCause> {
		let directory = self.cache.resolve(category).await?;

		if progress.pending.is_none() {
			let request = PacsRequest::FindStudies {
				window,
				modality: String::from(category),
			};
			let PacsResponse::Studies(studies) = self
				.throttler
				.cooldown_send(&self.client, &request, cancel)
				.await?
			else {
				return Err(FetchCause::UnexpectedResponse(request.to_string()));
			};
			info!(studies = studies.len(), "Found studies");
			progress.pending = Some(VecDeque::from(studies));
		}
		let pending = progress.pending.get_or_insert_with(VecDeque::new);

		while let Some(mut study) = pending.pop_front() {
			let request = PacsRequest::MoveStudy {
				study_instance_uid: study.study_instance_uid.clone(),
			};
			let cause = match self.throttler.cooldown_send(&self.client, &request, cancel).await {
				Ok(PacsResponse::Moved(summary)) => {
					debug!(
						study_instance_uid = %study.study_instance_uid,
						retry_count = study.retry_count,
						completed = summary.completed,
						warning = summary.warning,
						"Moved study"
					);
					progress.moved.push(study);
					continue;
				}
				Ok(_) => FetchCause::UnexpectedResponse(request.to_string()),
				Err(err) => FetchCause::from(err),
			};

			if !cause.is_cancelled() {
				study.retry_count += 1;
			}
			pending.push_front(study);
			return Err(cause);
		}

		Ok(directory.into_path())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::client::testing::{connection_lost, rejected, ScriptedClient};
	use crate::client::{ClientError, MoveSummary};
	use chrono::{NaiveDate, TimeDelta};
	use std::path::Path;
	use std::time::Duration;
	use tempfile::TempDir;
	use tokio::time::Instant;

	fn at(day: u32) -> Timestamp {
		NaiveDate::from_ymd_opt(2024, 1, day)
			.and_then(|date| date.and_hms_opt(0, 0, 0))
			.unwrap()
	}

	fn engine(client: ScriptedClient, root: &Path) -> FetchEngine<ScriptedClient> {
		FetchEngine::new(
			client,
			RequestThrottler::new(
				Duration::from_secs(30),
				Duration::from_secs(1),
				Arc::new(RateGauge::new(1000)),
				Duration::from_secs(5),
			),
			RetryPolicy::new(2, vec![Duration::from_secs(10)]),
			CacheLayout::new(root),
			WindowSize::new(TimeDelta::days(1)).unwrap(),
		)
	}

	fn find(day: u32) -> PacsRequest {
		PacsRequest::FindStudies {
			window: FetchWindow::new(at(day), at(day + 1)),
			modality: String::from("CT"),
		}
	}

	fn move_study(uid: &str) -> PacsRequest {
		PacsRequest::MoveStudy {
			study_instance_uid: String::from(uid),
		}
	}

	fn studies(uids: &[&str]) -> Result<PacsResponse, ClientError> {
		Ok(PacsResponse::Studies(
			uids.iter().copied().map(StudyToFetch::new).collect(),
		))
	}

	fn moved() -> Result<PacsResponse, ClientError> {
		Ok(PacsResponse::Moved(MoveSummary {
			completed: 1,
			..MoveSummary::default()
		}))
	}

	/// Answers every query with one study per window and every move with success.
	fn cooperative(request: &PacsRequest) -> Result<PacsResponse, ClientError> {
		match request {
			PacsRequest::Echo => Ok(PacsResponse::Echo),
			PacsRequest::FindStudies { window, .. } => Ok(PacsResponse::Studies(vec![
				StudyToFetch::new(window.start.format("1.2.%Y%m%d").to_string()),
			])),
			PacsRequest::MoveStudy { .. } => moved(),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn fetches_window() {
		let temp_dir = TempDir::new().unwrap();
		let client = ScriptedClient::new()
			.then(studies(&["1.2.3", "1.2.4"]))
			.then(moved())
			.then(moved());
		let engine = engine(client, temp_dir.path());
		let window = FetchWindow::new(at(1), at(2));

		let chunk = engine
			.fetch_window(window, "CT", &CancellationToken::new())
			.await
			.unwrap();

		assert_eq!(chunk.window, window);
		assert_eq!(chunk.category, "CT");
		assert_eq!(chunk.directory, temp_dir.path().join("CT"));
		assert!(chunk.directory.is_dir());
		assert_eq!(
			chunk.studies,
			vec![StudyToFetch::new("1.2.3"), StudyToFetch::new("1.2.4")]
		);
		assert_eq!(
			engine.client().requests(),
			vec![find(1), move_study("1.2.3"), move_study("1.2.4")]
		);
	}

	#[tokio::test(start_paused = true)]
	async fn retry_resumes_with_pending_studies() {
		let temp_dir = TempDir::new().unwrap();
		let client = ScriptedClient::new()
			.then(studies(&["1.2.3", "1.2.4"]))
			.then(moved())
			.then(Err(connection_lost()))
			.then(moved());
		let engine = engine(client, temp_dir.path());
		let started = Instant::now();

		let chunk = engine
			.fetch_window(FetchWindow::new(at(1), at(2)), "CT", &CancellationToken::new())
			.await
			.unwrap();

		assert_eq!(
			engine.client().requests(),
			vec![
				find(1),
				move_study("1.2.3"),
				move_study("1.2.4"),
				move_study("1.2.4")
			]
		);
		let retry_counts: Vec<_> = chunk.studies.iter().map(|s| s.retry_count).collect();
		assert_eq!(retry_counts, vec![0, 1]);
		// Three cooldowns after successful exchanges plus one retry cooldown.
		assert_eq!(started.elapsed(), Duration::from_secs(1 + 1 + 10 + 1));
	}

	#[tokio::test(start_paused = true)]
	async fn rejected_query_is_not_retried() {
		let temp_dir = TempDir::new().unwrap();
		let client = ScriptedClient::new().then(Err(rejected("C-FIND")));
		let engine = engine(client, temp_dir.path());

		let err = engine
			.fetch_window(FetchWindow::new(at(1), at(2)), "CT", &CancellationToken::new())
			.await
			.unwrap_err();

		assert!(matches!(
			err,
			RetryError::DownloadFailed {
				attempts: 1,
				cause: FetchCause::Send(_),
				..
			}
		));
		assert_eq!(engine.client().requests().len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn gives_up_after_retry_budget() {
		let temp_dir = TempDir::new().unwrap();
		let client = ScriptedClient::new().otherwise(|_| Err(connection_lost()));
		let engine = engine(client, temp_dir.path());
		let window = FetchWindow::new(at(1), at(2));
		let started = Instant::now();

		let err = engine
			.fetch_window(window, "CT", &CancellationToken::new())
			.await
			.unwrap_err();

		assert!(
			matches!(err, RetryError::DownloadFailed { window: failed, attempts: 3, .. } if failed == window)
		);
		assert_eq!(engine.client().requests(), vec![find(1), find(1), find(1)]);
		assert_eq!(started.elapsed(), Duration::from_secs(20));
	}

	#[tokio::test(start_paused = true)]
	async fn invalid_category_is_fatal() {
		let temp_dir = TempDir::new().unwrap();
		let engine = engine(ScriptedClient::new().otherwise(cooperative), temp_dir.path());

		let err = engine
			.fetch_window(FetchWindow::new(at(1), at(2)), "../CT", &CancellationToken::new())
			.await
			.unwrap_err();

		assert!(matches!(
			err,
			RetryError::DownloadFailed {
				attempts: 1,
				cause: FetchCause::Cache(CacheError::InvalidTag(_)),
				..
			}
		));
		assert!(engine.client().requests().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn unexpected_response_is_retried() {
		let temp_dir = TempDir::new().unwrap();
		let client = ScriptedClient::new()
			.then(Ok(PacsResponse::Echo))
			.then(studies(&[]));
		let engine = engine(client, temp_dir.path());

		let chunk = engine
			.fetch_window(FetchWindow::new(at(1), at(2)), "CT", &CancellationToken::new())
			.await
			.unwrap();

		assert!(chunk.studies.is_empty());
		assert_eq!(engine.client().requests(), vec![find(1), find(1)]);
	}

	#[tokio::test(start_paused = true)]
	async fn cancellation_is_not_a_download_failure() {
		let temp_dir = TempDir::new().unwrap();
		let engine = engine(ScriptedClient::new().otherwise(cooperative), temp_dir.path());
		let cancel = CancellationToken::new();
		cancel.cancel();

		let err = engine
			.fetch_window(FetchWindow::new(at(1), at(2)), "CT", &cancel)
			.await
			.unwrap_err();

		assert!(err.is_cancelled());
		assert!(engine.client().requests().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn fetches_range_window_by_window() {
		let temp_dir = TempDir::new().unwrap();
		let engine = engine(ScriptedClient::new().otherwise(cooperative), temp_dir.path());
		let range = DateRange::new(at(1), at(3)).unwrap();
		let mut chunks = Vec::new();

		let summary = engine
			.fetch_range(range, "CT", at(5), &CancellationToken::new(), |result| {
				chunks.push(result.unwrap());
				ControlFlow::Continue(())
			})
			.await
			.unwrap();

		let windows: Vec<_> = chunks.iter().map(|chunk| chunk.window).collect();
		assert_eq!(
			windows,
			vec![
				FetchWindow::new(at(1), at(2)),
				FetchWindow::new(at(2), at(3)),
				FetchWindow::new(at(3), at(3)),
			]
		);
		assert_eq!(
			summary,
			RangeSummary {
				windows_fetched: 3,
				windows_failed: 0,
				studies_moved: 3,
				stopped_early: false,
			}
		);
	}

	#[tokio::test(start_paused = true)]
	async fn failed_window_can_be_skipped() {
		let temp_dir = TempDir::new().unwrap();
		let client = ScriptedClient::new().otherwise(|request| match request {
			PacsRequest::FindStudies { window, .. } if window.start == at(2) => {
				Err(rejected("C-FIND"))
			}
			_ => cooperative(request),
		});
		let engine = engine(client, temp_dir.path());
		let range = DateRange::new(at(1), at(4)).unwrap();
		let mut failed = Vec::new();

		let summary = engine
			.fetch_range(range, "CT", at(4), &CancellationToken::new(), |result| {
				if let Err(RetryError::DownloadFailed { window, .. }) = result {
					failed.push(window);
				}
				ControlFlow::Continue(())
			})
			.await
			.unwrap();

		assert_eq!(failed, vec![FetchWindow::new(at(2), at(3))]);
		assert_eq!(summary.windows_fetched, 2);
		assert_eq!(summary.windows_failed, 1);
		assert!(!summary.stopped_early);
	}

	#[tokio::test(start_paused = true)]
	async fn driver_can_abort_range() {
		let temp_dir = TempDir::new().unwrap();
		let client = ScriptedClient::new().otherwise(|request| match request {
			PacsRequest::FindStudies { window, .. } if window.start == at(2) => {
				Err(rejected("C-FIND"))
			}
			_ => cooperative(request),
		});
		let engine = engine(client, temp_dir.path());
		let range = DateRange::new(at(1), at(6)).unwrap();

		let summary = engine
			.fetch_range(range, "CT", at(6), &CancellationToken::new(), |result| {
				if result.is_ok() {
					ControlFlow::Continue(())
				} else {
					ControlFlow::Break(())
				}
			})
			.await
			.unwrap();

		assert_eq!(
			summary,
			RangeSummary {
				windows_fetched: 1,
				windows_failed: 1,
				studies_moved: 1,
				stopped_early: true,
			}
		);
		assert!(!engine.client().requests().contains(&find(3)));
	}

	#[tokio::test(start_paused = true)]
	async fn cancellation_stops_range() {
		let temp_dir = TempDir::new().unwrap();
		let engine = engine(ScriptedClient::new().otherwise(cooperative), temp_dir.path());
		let range = DateRange::new(at(1), at(6)).unwrap();
		let cancel = CancellationToken::new();
		let mut visited = 0;

		let result = engine
			.fetch_range(range, "CT", at(6), &cancel, |_| {
				visited += 1;
				cancel.cancel();
				ControlFlow::Continue(())
			})
			.await;

		assert!(matches!(result, Err(RetryError::Cancelled)));
		assert_eq!(visited, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn check_probes_remote() {
		let temp_dir = TempDir::new().unwrap();
		let engine = engine(ScriptedClient::new().then(Ok(PacsResponse::Echo)), temp_dir.path());

		engine.check(&CancellationToken::new()).await.unwrap();

		assert_eq!(engine.client().requests(), vec![PacsRequest::Echo]);
	}
}
