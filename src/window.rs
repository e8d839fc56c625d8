//! Decomposition of a [`DateRange`] into consecutive fetch windows.

use crate::model::{DateRange, FetchWindow, RangeError};
use crate::types::Timestamp;
use chrono::TimeDelta;

/// Maximum length of a fetch window. Always positive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WindowSize(TimeDelta);

impl WindowSize {
	pub fn new(size: TimeDelta) -> Result<Self, RangeError> {
		if size <= TimeDelta::zero() {
			return Err(RangeError::WindowSize(size));
		}
		Ok(Self(size))
	}

	pub const fn get(self) -> TimeDelta {
		self.0
	}
}

impl TryFrom<TimeDelta> for WindowSize {
	type Error = RangeError;

	fn try_from(size: TimeDelta) -> Result<Self, Self::Error> {
		Self::new(size)
	}
}

/// Iterator over the windows of a range, each at most `max_window` long and never ending after
/// `now`.
///
/// The part of the range that lies after `now` is not visited. It will be picked up by a later
/// call with an updated `now`.
#[derive(Debug, Clone)]
pub struct TimeWindows {
	current: Option<Timestamp>,
	to: Timestamp,
	now: Timestamp,
	max_window: TimeDelta,
}

impl TimeWindows {
	pub const fn new(range: DateRange, max_window: WindowSize, now: Timestamp) -> Self {
		Self {
			current: Some(range.from()),
			to: range.to(),
			now,
			max_window: max_window.get(),
		}
	}
}

impl Iterator for TimeWindows {
	type Item = FetchWindow;

	fn next(&mut self) -> Option<Self::Item> {
		let current = self.current?;
		let next = current
			.checked_add_signed(self.max_window)
			.map_or(self.now, |next| next.min(self.now));

		if next > self.to {
			// Closing window, may be zero-length if `current` is already at the range end.
			self.current = None;
			return Some(FetchWindow::new(current, self.to));
		}
		if next <= current {
			// Caught up with `now`.
			self.current = None;
			return None;
		}

		self.current = Some(next);
		Some(FetchWindow::new(current, next))
	}
}

/// Invokes `action` once per window of `range`, stopping at the first error.
pub fn each_window<E>(
	range: DateRange,
	max_window: TimeDelta,
	now: Timestamp,
	mut action: impl FnMut(FetchWindow) -> Result<(), E>,
) -> Result<(), E>
where
	E: From<RangeError>,
{
	let max_window = WindowSize::new(max_window)?;
	for window in TimeWindows::new(range, max_window, now) {
		action(window)?;
	}
	Ok(())
}
