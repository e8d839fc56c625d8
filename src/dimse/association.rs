use dicom::ul::pdu::PresentationContextNegotiated;
use dicom::ul::Pdu;
use std::convert::identity;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, Sender};
use tokio::sync::oneshot;
use tracing::{debug, error, trace};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AssociationError {
	#[error(transparent)]
	Channel(#[from] ChannelError),
	#[error("Failed to spawn association thread")]
	OsThread(#[source] std::io::Error),
	#[error("Failed to clone association stream")]
	Stream(#[source] std::io::Error),
	#[error(transparent)]
	Upper(#[from] dicom::ul::association::Error),
}

#[derive(Debug, Error)]
pub enum ChannelError {
	#[error("Timed out")]
	Timeout,
	#[error("Channel is closed")]
	Closed,
}

#[derive(Debug)]
enum Command {
	Send(Pdu, oneshot::Sender<Result<(), AssociationError>>),
	Receive(oneshot::Sender<Result<Pdu, AssociationError>>),
	Release(oneshot::Sender<Result<(), AssociationError>>),
}

/// Sends a command to the association thread and waits for its reply.
trait Ask<T> {
	async fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T,
		timeout: Duration,
	) -> Result<R, ChannelError>;
}

impl<T> Ask<T> for Sender<T> {
	async fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T,
		timeout: Duration,
	) -> Result<R, ChannelError> {
		let (tx, rx) = oneshot::channel();
		tokio::time::timeout(timeout, async {
			self.send(command(tx))
				.await
				.map_err(|_| ChannelError::Closed)?;
			rx.await.map_err(|_| ChannelError::Closed)
		})
		.await
		.map_err(|_| ChannelError::Timeout)?
	}
}

pub struct AssociationOptions {
	pub calling_aet: String,
	pub called_aet: String,
	pub address: String,
	pub abstract_syntax: String,
	pub transfer_syntaxes: Vec<String>,
	pub connect_timeout: Duration,
}

/// A requestor association whose blocking upper-layer I/O runs on a dedicated thread.
///
/// Awaiting an exchange that timed out or got cancelled leaves the thread blocked on the
/// socket. Dropping the association shuts the socket down, which aborts that pending I/O.
pub struct ClientAssociation {
	channel: Sender<Command>,
	uuid: Uuid,
	tcp_stream: TcpStream,
	presentation_contexts: Vec<PresentationContextNegotiated>,
}

impl ClientAssociation {
	pub async fn open(options: AssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let (tx, mut rx) = mpsc::channel::<Command>(1);
		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let address = options.address;
		let connect_timeout = options.connect_timeout;
		let ul_options = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(options.calling_aet)
			.called_ae_title(options.called_aet.clone())
			.with_presentation_context(options.abstract_syntax, options.transfer_syntaxes);

		thread::Builder::new()
			.name(format!("assoc-{}", options.called_aet))
			.spawn(move || {
				let established = ul_options
					.establish(address.as_str())
					.map_err(AssociationError::from)
					.and_then(|mut association| {
						let stream = association
							.inner_stream()
							.try_clone()
							.map_err(AssociationError::Stream)?;
						Ok((association, stream))
					});

				let mut association = match established {
					Ok((association, stream)) => {
						let contexts = Vec::from(association.presentation_contexts());
						if connect_tx.send(Ok((stream, contexts))).is_err() {
							// Nobody waits for this association anymore.
							let _ = association.abort();
							return;
						}
						association
					}
					Err(err) => {
						error!(association_uuid = %uuid, "Failed to connect to {address}: {err}");
						let _ = connect_tx.send(Err(err));
						return;
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let delivered = match command {
						Command::Send(pdu, reply_to) => {
							let result = association.send(&pdu).map_err(AssociationError::from);
							reply_to.send(result).is_ok()
						}
						Command::Receive(reply_to) => {
							let result = association.receive().map_err(AssociationError::from);
							reply_to.send(result).is_ok()
						}
						Command::Release(reply_to) => {
							let result = association.release().map_err(AssociationError::from);
							let _ = reply_to.send(result);
							trace!(association_uuid = %uuid, "Released association");
							return;
						}
					};
					if !delivered {
						debug!(association_uuid = %uuid, "Caller stopped waiting, aborting association");
						break;
					}
				}

				if let Err(err) = association.abort() {
					debug!(association_uuid = %uuid, "Failed to abort association: {err}");
				}
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts) =
			tokio::time::timeout(connect_timeout, connect_result)
				.await
				.map_err(|_| ChannelError::Timeout)?
				.map_err(|_| ChannelError::Closed)??;

		debug!(association_uuid = %uuid, "Established association");
		Ok(Self {
			channel: tx,
			uuid,
			tcp_stream,
			presentation_contexts,
		})
	}

	pub const fn uuid(&self) -> &Uuid {
		&self.uuid
	}

	pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}

	pub async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	pub async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	/// Gracefully releases the association. Failures are only logged since the exchange that
	/// used the association has completed at this point.
	pub async fn release(self, timeout: Duration) {
		let result = self
			.channel
			.ask(Command::Release, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity);
		if let Err(err) = result {
			debug!(association_uuid = %self.uuid, "Failed to release association: {err}");
		}
	}
}

impl Drop for ClientAssociation {
	fn drop(&mut self) {
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			trace!(association_uuid = %self.uuid, "Failed to shut down TcpStream: {err}");
		}
	}
}
