//! DIMSE implementation of the PACS client.
//! - The liveness probe is a verification service class user (C-ECHO service).
//! - Study lookup per fetch window is a find service class user (C-FIND service).
//! - Retrieval is a move service class user (C-MOVE service) targeting an external
//!   storage receiver that writes the instances below the cache directory.

mod association;
mod cecho;
mod cfind;
mod client;
mod cmove;

pub use association::{AssociationError, ChannelError};
pub use cfind::study_date_range;
pub use client::DimseClient;

use crate::types::{UI, US};
use association::ClientAssociation;
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, trace};

/// Value of [`tags::COMMAND_DATA_SET_TYPE`] for messages that carry a data set.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Value of [`tags::COMMAND_DATA_SET_TYPE`] for messages without a data set.
pub const DATA_SET_MISSING: US = 0x0101; // DICOM NULL

/// A DICOM message composed of a command set followed by an optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	pub command: InMemDicomObject,
	pub data: Option<InMemDicomObject>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if self.data.is_some() {
			write!(f, "DicomMessage {{ command, data }}")
		} else {
			write!(f, "DicomMessage {{ command }}")
		}
	}
}

impl DicomMessage {
	/// Reads the Status (0000,0900) of a response command set.
	pub fn status(&self) -> Result<US, ReadError> {
		self.command
			.get(tags::STATUS)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.ok_or(ReadError::MissingAttribute(tags::STATUS))
	}
}

/// Status types supported by the DIMSE services.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl From<US> for StatusType {
	fn from(value: US) -> Self {
		match value {
			0 => Self::Success,
			1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Self::Warning,
			0xFE00 => Self::Cancel,
			0xFF00 | 0xFF01 => Self::Pending,
			_ => Self::Failure,
		}
	}
}

/// Failure statuses that reject the request itself, so repeating it cannot succeed.
pub const fn is_rejecting_status(status: US) -> bool {
	matches!(status, 0x0122 | 0xA801 | 0xA900 | 0xC000..=0xCFFF)
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Box<Pdu>),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("Failed to receive PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Mandatory attribute {0} is missing")]
	MissingAttribute(Tag),
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to send PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("Failed to negotiate a presentation context")]
	NoPresentationContext,
}

impl ClientAssociation {
	/// Writes the command set and, if present, the data set of a message, each in its own
	/// P-DATA-TF PDU.
	#[instrument(skip_all)]
	pub async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		timeout: Duration,
	) -> Result<(), WriteError> {
		let message: DicomMessage = message.into();
		let presentation_context = self
			.presentation_contexts()
			.first()
			.ok_or(NegotiationError::NoPresentationContext)?;
		let presentation_context_id = presentation_context.id;

		let mut command_buf = Vec::new();
		message
			.command
			.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;
		self.send(
			Self::pdata(PDataValueType::Command, presentation_context_id, command_buf),
			timeout,
		)
		.await?;

		if let Some(data) = message.data {
			let transfer_syntax = TransferSyntaxRegistry
				.get(&presentation_context.transfer_syntax)
				.ok_or_else(|| {
					NegotiationError::UnknownTransferSyntax(UI::from(
						&presentation_context.transfer_syntax,
					))
				})?;
			let mut data_buf = Vec::new();
			data.write_dataset_with_ts(&mut data_buf, transfer_syntax)?;
			self.send(
				Self::pdata(PDataValueType::Data, presentation_context_id, data_buf),
				timeout,
			)
			.await?;
		}

		Ok(())
	}

	fn pdata(value_type: PDataValueType, presentation_context_id: u8, data: Vec<u8>) -> Pdu {
		Pdu::PData {
			data: vec![PDataValue {
				value_type,
				presentation_context_id,
				is_last: true,
				data,
			}],
		}
	}

	/// Collects P-DATA fragments until a complete message has been received.
	#[instrument(skip_all)]
	pub async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError> {
		let mut command_fragments = Vec::new();
		let mut data_fragments = Vec::new();
		let mut command: Option<InMemDicomObject> = None;

		loop {
			let data = match self.receive(timeout).await? {
				Pdu::PData { data } => data,
				pdu => return Err(ReadError::UnexpectedPdu(Box::new(pdu))),
			};

			for mut pdv in data {
				match pdv.value_type {
					PDataValueType::Command => {
						trace!("Received command fragment (last={})", pdv.is_last);
						if command.is_some() {
							return Err(ReadError::OutOfOrder);
						}
						command_fragments.append(&mut pdv.data);
						if !pdv.is_last {
							continue;
						}

						let command_set = InMemDicomObject::read_dataset_with_ts(
							command_fragments.as_slice(),
							&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
						)?;
						let has_data_set = command_set
							.get(tags::COMMAND_DATA_SET_TYPE)
							.map(InMemElement::to_int::<US>)
							.and_then(Result::ok)
							.is_some_and(|value| value != DATA_SET_MISSING);

						if !has_data_set {
							return Ok(DicomMessage {
								command: command_set,
								data: None,
							});
						}
						command = Some(command_set);
					}
					PDataValueType::Data => {
						trace!("Received data fragment (last={})", pdv.is_last);
						data_fragments.append(&mut pdv.data);
						if !pdv.is_last {
							continue;
						}

						let Some(command) = command.take() else {
							return Err(ReadError::OutOfOrder);
						};
						let transfer_syntax = self
							.presentation_contexts()
							.iter()
							.find(|pctx| pctx.id == pdv.presentation_context_id)
							.ok_or(NegotiationError::NoPresentationContext)
							.and_then(|pctx| {
								TransferSyntaxRegistry
									.get(&pctx.transfer_syntax)
									.ok_or_else(|| {
										NegotiationError::UnknownTransferSyntax(UI::from(
											&pctx.transfer_syntax,
										))
									})
							})?;
						let data = InMemDicomObject::read_dataset_with_ts(
							data_fragments.as_slice(),
							transfer_syntax,
						)?;
						return Ok(DicomMessage {
							command,
							data: Some(data),
						});
					}
				}
			}
		}
	}
}

/// Returns a new message id by incrementing a global counter.
pub fn next_message_id() -> US {
	static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(1);
	CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst)
}
