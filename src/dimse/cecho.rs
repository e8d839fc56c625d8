use super::association::ClientAssociation;
use super::{next_message_id, DicomMessage, StatusType, DATA_SET_MISSING};
use crate::client::ClientError;
use crate::types::US;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use std::time::Duration;
use tracing::{debug, instrument};

const COMMAND_FIELD_COMPOSITE_ECHO_REQUEST: US = 0x0030;

/// C-ECHO-RQ
struct CompositeEchoRequest {
	message_id: US,
}

impl From<CompositeEchoRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeEchoRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_ECHO_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
		]);

		Self { command, data: None }
	}
}

/// Sends a C-ECHO-RQ and succeeds if the C-ECHO-RSP reports success.
#[instrument(skip_all, name = "ECHO-SCU")]
pub async fn echo(association: &ClientAssociation, timeout: Duration) -> Result<(), ClientError> {
	let request = CompositeEchoRequest {
		message_id: next_message_id(),
	};
	association.write_message(request, timeout).await?;

	let response = association.read_message(timeout).await?;
	let status = response.status()?;
	let status_type = StatusType::from(status);
	debug!(status, "Received C-ECHO-RSP ({status_type:?})");

	if status_type == StatusType::Success {
		Ok(())
	} else {
		Err(ClientError::Status {
			operation: "C-ECHO",
			status,
		})
	}
}
