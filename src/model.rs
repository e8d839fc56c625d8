//! Value objects passed between the fetch components.

use crate::types::{Timestamp, UI};
use chrono::TimeDelta;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
	#[error("Range start {from} is after range end {to}")]
	Inverted { from: Timestamp, to: Timestamp },
	#[error("Window size must be positive, got {0}")]
	WindowSize(TimeDelta),
	#[error("Window size of {0} seconds is out of range")]
	WindowOverflow(i64),
}

/// The overall period a driver wants to fetch. `from <= to` always holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DateRange {
	from: Timestamp,
	to: Timestamp,
}

impl DateRange {
	pub fn new(from: Timestamp, to: Timestamp) -> Result<Self, RangeError> {
		if from > to {
			return Err(RangeError::Inverted { from, to });
		}
		Ok(Self { from, to })
	}

	pub const fn from(&self) -> Timestamp {
		self.from
	}

	pub const fn to(&self) -> Timestamp {
		self.to
	}
}

/// A sub-range of a [`DateRange`] that is fetched as one unit.
///
/// Windows are half-open (`[start, end)`), except for the closing window of a range which
/// includes its end. That closing window may be zero-length when the range end falls exactly
/// on a window boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FetchWindow {
	pub start: Timestamp,
	pub end: Timestamp,
}

impl FetchWindow {
	pub const fn new(start: Timestamp, end: Timestamp) -> Self {
		Self { start, end }
	}

	pub fn duration(&self) -> TimeDelta {
		self.end - self.start
	}
}

impl Display for FetchWindow {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"[{}, {}]",
			self.start.format("%Y-%m-%dT%H:%M:%S"),
			self.end.format("%Y-%m-%dT%H:%M:%S")
		)
	}
}

/// A study found on the remote PACS that still has to be moved.
///
/// Identity is the Study Instance UID alone; `retry_count` is bookkeeping.
#[derive(Debug, Clone)]
pub struct StudyToFetch {
	pub study_instance_uid: UI,
	pub retry_count: u32,
}

impl StudyToFetch {
	pub fn new(study_instance_uid: impl Into<UI>) -> Self {
		Self {
			study_instance_uid: study_instance_uid.into(),
			retry_count: 0,
		}
	}
}

impl PartialEq for StudyToFetch {
	fn eq(&self, other: &Self) -> bool {
		self.study_instance_uid == other.study_instance_uid
	}
}

impl Eq for StudyToFetch {}

impl Hash for StudyToFetch {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.study_instance_uid.hash(state);
	}
}

/// The result of one successfully fetched window. Owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
	pub window: FetchWindow,
	pub category: String,
	pub directory: PathBuf,
	pub studies: Vec<StudyToFetch>,
}
