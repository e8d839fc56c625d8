use super::association::ClientAssociation;
use super::{next_message_id, DicomMessage, StatusType, DATA_SET_EXISTS};
use crate::client::ClientError;
use crate::model::{FetchWindow, StudyToFetch};
use crate::types::{Priority, QueryRetrieveLevel, UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

// Magic numbers defined by the DICOM specification.
const COMMAND_FIELD_COMPOSITE_FIND_REQUEST: US = 0x0020;

/// C-FIND-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.1-2>
pub struct CompositeFindRequest {
	pub message_id: US,
	pub priority: US,
	pub identifier: InMemDicomObject,
}

impl From<CompositeFindRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeFindRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self {
			command,
			data: Some(request.identifier),
		}
	}
}

/// Encodes a window as DICOM range matching values for (StudyDate, StudyTime).
///
/// A window end at midnight is exclusive, so `[Jan 1 00:00, Jan 2 00:00]` only matches Jan 1.
/// A window within a single day that does not cover it fully also gets a StudyTime range.
/// Without extended negotiation the remote matches StudyTime on every date of the StudyDate
/// range separately, so a window spanning several dates only sends StudyDate and matches
/// those dates in full.
pub fn study_date_range(window: &FetchWindow) -> (String, Option<String>) {
	let first = window.start.date();
	let end_at_midnight = window.end.time() == chrono::NaiveTime::MIN;
	let last = if end_at_midnight && window.end > window.start {
		window.end.date().pred_opt().unwrap_or(first)
	} else {
		window.end.date()
	};

	let date = if first == last {
		first.format("%Y%m%d").to_string()
	} else {
		format!("{}-{}", first.format("%Y%m%d"), last.format("%Y%m%d"))
	};

	let aligned = window.start.time() == chrono::NaiveTime::MIN && end_at_midnight;
	let time = (first == last && !aligned).then(|| {
		let end = if end_at_midnight {
			String::from("235959")
		} else {
			window.end.format("%H%M%S").to_string()
		};
		format!("{}-{end}", window.start.format("%H%M%S"))
	});

	(date, time)
}

/// Builds the STUDY level identifier matching all studies of a window that contain `modality`.
pub fn study_identifier(window: &FetchWindow, modality: &str) -> InMemDicomObject {
	let (study_date, study_time) = study_date_range(window);

	let mut identifier = InMemDicomObject::new_empty();
	identifier.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, QueryRetrieveLevel::Study.to_string());
	identifier.put_str(tags::STUDY_INSTANCE_UID, VR::UI, "");
	identifier.put_str(tags::STUDY_DATE, VR::DA, study_date);
	identifier.put_str(tags::STUDY_TIME, VR::TM, study_time.unwrap_or_default());
	identifier.put_str(tags::MODALITIES_IN_STUDY, VR::CS, modality);
	identifier
}

fn study_instance_uid(identifier: &InMemDicomObject) -> Option<UI> {
	identifier
		.get(tags::STUDY_INSTANCE_UID)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|uid| UI::from(uid.trim_end_matches(['\0', ' '])))
		.filter(|uid| !uid.is_empty())
}

/// Queries the studies of a window and collects them until the final C-FIND-RSP.
#[instrument(skip_all, name = "FIND-SCU")]
pub async fn find_studies(
	association: &ClientAssociation,
	window: &FetchWindow,
	modality: &str,
	priority: Priority,
	timeout: Duration,
) -> Result<Vec<StudyToFetch>, ClientError> {
	let request = CompositeFindRequest {
		message_id: next_message_id(),
		priority: priority.into(),
		identifier: study_identifier(window, modality),
	};
	association.write_message(request, timeout).await?;
	trace!("Sent C-FIND-RQ");

	let mut studies: Vec<StudyToFetch> = Vec::new();
	loop {
		let response = association.read_message(timeout).await?;
		let status = response.status()?;
		trace!(status, "Received C-FIND-RSP");

		match StatusType::from(status) {
			StatusType::Pending => {
				let uid = response.data.as_ref().and_then(study_instance_uid);
				match uid {
					Some(uid) => {
						let study = StudyToFetch::new(uid);
						if !studies.contains(&study) {
							studies.push(study);
						}
					}
					None => warn!("Ignoring C-FIND match without Study Instance UID"),
				}
			}
			StatusType::Success => break,
			StatusType::Warning | StatusType::Failure | StatusType::Cancel => {
				return Err(ClientError::Status {
					operation: "C-FIND",
					status,
				});
			}
		}
	}

	debug!(window = %window, modality, count = studies.len(), "Found studies");
	Ok(studies)
}
