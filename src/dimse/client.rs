use super::association::{AssociationOptions, ClientAssociation};
use super::{cecho, cfind, cmove};
use crate::client::{ClientError, PacsClient, PacsRequest, PacsResponse};
use crate::config::ProtocolConfig;
use dicom::dictionary_std::uids;
use tracing::debug;

/// [`PacsClient`] speaking DIMSE over one short-lived association per exchange.
pub struct DimseClient {
	config: ProtocolConfig,
	endpoint: String,
}

impl DimseClient {
	pub fn new(config: ProtocolConfig) -> Self {
		let endpoint = format!("{}@{}", config.remote.aet, config.remote.address());
		Self { config, endpoint }
	}

	async fn associate(&self, abstract_syntax: &str) -> Result<ClientAssociation, ClientError> {
		let association = ClientAssociation::open(AssociationOptions {
			calling_aet: self.config.aet.clone(),
			called_aet: self.config.remote.aet.clone(),
			address: self.config.remote.address(),
			abstract_syntax: String::from(abstract_syntax),
			transfer_syntaxes: vec![String::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
			connect_timeout: self.config.timeout(),
		})
		.await?;
		debug!(
			association_uuid = %association.uuid(),
			endpoint = %self.endpoint,
			"Opened association"
		);
		Ok(association)
	}
}

impl PacsClient for DimseClient {
	fn endpoint(&self) -> &str {
		&self.endpoint
	}

	async fn send(&self, request: &PacsRequest) -> Result<PacsResponse, ClientError> {
		let timeout = self.config.timeout();
		match request {
			PacsRequest::Echo => {
				let association = self.associate(uids::VERIFICATION).await?;
				cecho::echo(&association, timeout).await?;
				association.release(timeout).await;
				Ok(PacsResponse::Echo)
			}
			PacsRequest::FindStudies { window, modality } => {
				let association = self
					.associate(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
					.await?;
				let studies = cfind::find_studies(
					&association,
					window,
					modality,
					self.config.priority,
					timeout,
				)
				.await?;
				association.release(timeout).await;
				Ok(PacsResponse::Studies(studies))
			}
			PacsRequest::MoveStudy { study_instance_uid } => {
				let association = self
					.associate(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)
					.await?;
				let summary = cmove::move_study(
					&association,
					study_instance_uid,
					&self.config.destination,
					self.config.priority,
					timeout,
				)
				.await?;
				association.release(timeout).await;
				Ok(PacsResponse::Moved(summary))
			}
		}
	}
}
