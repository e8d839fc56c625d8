//! Sliding one-minute event rate gauge.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Length of the sliding window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Upper bound of the buffer allocated up front. Larger thresholds grow it on demand.
const INITIAL_CAPACITY: usize = 1024;

/// Counts events in the trailing minute and reports when more than `threshold` happened.
///
/// A gauge can be shared between fetch sequences (behind an `Arc`) to enforce a global cap.
/// Callers must tick with non-decreasing event times, the gauge does not validate this.
#[derive(Debug)]
pub struct RateGauge {
	threshold: usize,
	events: Mutex<VecDeque<Instant>>,
}

impl RateGauge {
	pub fn new(threshold: usize) -> Self {
		Self {
			threshold,
			// Only the newest `threshold + 1` events are needed to tell whether the threshold
			// is exceeded, so the buffer never grows beyond that.
			events: Mutex::new(VecDeque::with_capacity(
				threshold.saturating_add(1).min(INITIAL_CAPACITY),
			)),
		}
	}

	pub const fn threshold(&self) -> usize {
		self.threshold
	}

	/// Records an event at `event_time` and invokes `on_exceeded` if the trailing minute now
	/// holds more than `threshold` events.
	///
	/// The callback fires on every tick that stays above the threshold. It runs after the lock
	/// is released, but must still not tick this gauge again synchronously.
	pub fn tick(&self, event_time: Instant, on_exceeded: impl FnOnce()) -> bool {
		let exceeded = {
			let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
			while events
				.front()
				.is_some_and(|&oldest| event_time.saturating_duration_since(oldest) > RATE_WINDOW)
			{
				events.pop_front();
			}
			if events.len() > self.threshold {
				events.pop_front();
			}
			events.push_back(event_time);
			events.len() > self.threshold
		};

		if exceeded {
			on_exceeded();
		}
		exceeded
	}

	/// Number of events in the trailing minute as of the last tick, capped at `threshold + 1`.
	pub fn len(&self) -> usize {
		self.events
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
