//! The request/response capability the fetch engine depends on.

use crate::dimse::{is_rejecting_status, AssociationError, ReadError, WriteError};
use crate::model::{FetchWindow, StudyToFetch};
use crate::types::{UI, US};
use std::fmt::{Display, Formatter};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacsRequest {
	/// Zero-payload liveness probe.
	Echo,
	FindStudies { window: FetchWindow, modality: String },
	MoveStudy { study_instance_uid: UI },
}

impl Display for PacsRequest {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Echo => write!(f, "C-ECHO"),
			Self::FindStudies { window, modality } => write!(f, "C-FIND {modality} {window}"),
			Self::MoveStudy { study_instance_uid } => write!(f, "C-MOVE {study_instance_uid}"),
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveSummary {
	pub completed: u32,
	pub failed: u32,
	pub warning: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacsResponse {
	Echo,
	Studies(Vec<StudyToFetch>),
	Moved(MoveSummary),
}

#[derive(Debug, Error)]
pub enum ClientError {
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error("{operation} failed with status {status:#06X}")]
	Status { operation: &'static str, status: US },
	#[error("Unexpected response to {0}")]
	UnexpectedResponse(String),
}

impl ClientError {
	/// Whether the remote rejected the request itself, so that sending it again cannot succeed.
	pub const fn is_fatal(&self) -> bool {
		match self {
			Self::Status { status, .. } => is_rejecting_status(*status),
			Self::Association(_) | Self::Read(_) | Self::Write(_) | Self::UnexpectedResponse(_) => {
				false
			}
		}
	}
}

/// A remote archive that answers requests one exchange at a time.
pub trait PacsClient {
	/// Human-readable identity of the remote endpoint, used as error context.
	fn endpoint(&self) -> &str;

	async fn send(&self, request: &PacsRequest) -> Result<PacsResponse, ClientError>;
}
