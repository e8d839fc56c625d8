use super::association::ClientAssociation;
use super::{next_message_id, DicomMessage, StatusType, DATA_SET_EXISTS};
use crate::client::{ClientError, MoveSummary};
use crate::types::{Priority, QueryRetrieveLevel, AE, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use std::time::Duration;
use tracing::{info, instrument, trace, warn};

// Magic numbers defined by the DICOM specification.
const COMMAND_FIELD_COMPOSITE_MOVE_REQUEST: US = 0x0021;

/// C-MOVE-RQ
pub struct CompositeMoveRequest {
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: US,
	pub destination: AE,
}

impl CompositeMoveRequest {
	pub fn study(study_instance_uid: &str, destination: AE, priority: Priority) -> Self {
		let mut identifier = InMemDicomObject::new_empty();
		identifier.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, QueryRetrieveLevel::Study.to_string());
		identifier.put_str(tags::STUDY_INSTANCE_UID, VR::UI, study_instance_uid);

		Self {
			identifier,
			message_id: next_message_id(),
			priority: priority.into(),
			destination,
		}
	}
}

impl From<CompositeMoveRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeMoveRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_MOVE_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, request.destination)),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self {
			command,
			data: Some(request.identifier),
		}
	}
}

fn counter(message: &DicomMessage, tag: dicom::object::Tag) -> u32 {
	message
		.command
		.get(tag)
		.map(InMemElement::to_int::<US>)
		.and_then(Result::ok)
		.map_or(0, u32::from)
}

/// Moves one study to `destination` and waits for the final C-MOVE-RSP.
///
/// Pending responses only report progress. A final warning status means some sub-operations
/// failed, which is reported as an error so the study is retried as a whole.
#[instrument(skip_all, name = "MOVE-SCU", fields(study_instance_uid = %study_instance_uid))]
pub async fn move_study(
	association: &ClientAssociation,
	study_instance_uid: &str,
	destination: &str,
	priority: Priority,
	timeout: Duration,
) -> Result<MoveSummary, ClientError> {
	let request = CompositeMoveRequest::study(study_instance_uid, AE::from(destination), priority);
	association.write_message(request, timeout).await?;
	trace!("Sent C-MOVE-RQ");

	loop {
		let response = association.read_message(timeout).await?;
		let status = response.status()?;
		let summary = MoveSummary {
			completed: counter(&response, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
			failed: counter(&response, tags::NUMBER_OF_FAILED_SUBOPERATIONS),
			warning: counter(&response, tags::NUMBER_OF_WARNING_SUBOPERATIONS),
		};

		match StatusType::from(status) {
			StatusType::Pending => {
				trace!(
					completed = summary.completed,
					remaining = counter(&response, tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
					"C-MOVE is pending"
				);
			}
			StatusType::Success => {
				info!(completed = summary.completed, "C-MOVE completed successfully");
				return Ok(summary);
			}
			StatusType::Warning | StatusType::Failure | StatusType::Cancel => {
				warn!(
					status,
					completed = summary.completed,
					failed = summary.failed,
					"C-MOVE did not complete"
				);
				return Err(ClientError::Status {
					operation: "C-MOVE",
					status,
				});
			}
		}
	}
}
