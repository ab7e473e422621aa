//! Connection layer: messages over one transport channel.
//!
//! A [`Connection`] owns three background tasks:
//!
//! - **reader**: drives the [`TransportReceiver`], forwarding raw chunks
//! - **writer**: encodes queued [`Message`]s, fragments them, and sends records
//! - **dispatcher**: the receive loop; parses records, reassembles messages,
//!   and hands them to a [`MessageHandler`]
//!
//! # Message Flow
//!
//! 1. Caller queues a message with [`MessageSender::send`] (never blocks)
//! 2. Writer encodes it, splits it under a fresh object id, sends each record
//! 3. Remote records arrive in arbitrary chunks; the dispatcher frames them
//! 4. Completed messages go to [`MessageHandler::on_message`]
//! 5. A bad fragment sequence fails only that message
//!    ([`MessageHandler::on_framing_error`]); a corrupt byte stream or a dead
//!    transport ends the channel ([`MessageHandler::on_closed`])
//! 6. An outbound message that cannot be encoded, or is larger than
//!    `max_message_size`, is dropped and reported through
//!    [`MessageHandler::on_send_failed`]; the channel stays up
//!
//! The handler is held weakly so the owner of a connection can also be its
//! handler without forming a cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use rsh_protocol::{Fragment, FrameDecoder, Message, Target};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::fragment::{Fragmenter, Reassembler};
use crate::transport::{Transport, TransportParts};

/// Default fragment payload size.
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 32 * 1024;

/// Default cap on a reassembled message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Receives everything the dispatcher extracts from the channel.
///
/// Callbacks run on the dispatcher task and must not block.
pub trait MessageHandler: Send + Sync {
	/// A complete, decoded message arrived.
	fn on_message(&self, message: Message);

	/// One inbound message addressed to `target` was malformed and dropped.
	fn on_framing_error(&self, target: Target, error: Error);

	/// One outbound message addressed to `target` was never sent.
	fn on_send_failed(&self, target: Target, error: Error);

	/// The channel ended: `None` for an orderly close by the remote side.
	///
	/// Called at most once, after every message received before the end.
	fn on_closed(&self, error: Option<Error>);
}

/// Size limits for one connection.
///
/// `max_message_size` bounds message bodies in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
	pub max_fragment_size: usize,
	pub max_message_size: usize,
}

impl Default for ConnectionOptions {
	fn default() -> Self {
		Self {
			max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
			max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
		}
	}
}

/// Cloneable handle for queueing outbound messages.
#[derive(Debug, Clone)]
pub struct MessageSender {
	tx: mpsc::UnboundedSender<Message>,
}

impl MessageSender {
	/// Queues a message for the writer task.
	pub fn send(&self, message: Message) -> Result<()> {
		self.tx.send(message).map_err(|_| {
			tracing::debug!("Failed to queue message: writer has stopped");
			Error::ChannelClosed
		})
	}
}

/// Fires [`MessageHandler::on_closed`] exactly once.
struct CloseSignal {
	fired: AtomicBool,
	handler: Weak<dyn MessageHandler>,
}

impl CloseSignal {
	fn fire(&self, error: Option<Error>) {
		if self.fired.swap(true, Ordering::SeqCst) {
			return;
		}
		if let Some(handler) = self.handler.upgrade() {
			handler.on_closed(error);
		}
	}

	/// Suppresses the notification for a locally initiated shutdown.
	fn disarm(&self) {
		self.fired.store(true, Ordering::SeqCst);
	}
}

/// A running channel to one remote host.
pub struct Connection {
	sender: MessageSender,
	shutdown_tx: oneshot::Sender<()>,
	closed: Arc<CloseSignal>,
	reader: JoinHandle<()>,
	writer: JoinHandle<()>,
	dispatcher: JoinHandle<()>,
}

impl Connection {
	/// Starts the background tasks for an opened transport.
	///
	/// Must be called from within a Tokio runtime.
	pub fn start(
		parts: TransportParts,
		handler: Weak<dyn MessageHandler>,
		options: ConnectionOptions,
	) -> Result<Self> {
		let fragmenter = Fragmenter::new(options.max_fragment_size)?;
		let TransportParts {
			sender: transport,
			receiver,
			inbound_rx,
		} = parts;

		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		let (reader_done_tx, reader_done_rx) = oneshot::channel();
		let closed = Arc::new(CloseSignal {
			fired: AtomicBool::new(false),
			handler: handler.clone(),
		});

		let reader = tokio::spawn(async move {
			let outcome = receiver.run().await;
			if let Err(e) = &outcome {
				tracing::warn!(error = %e, "Transport read error");
			}
			let _ = reader_done_tx.send(outcome);
		});

		let writer = tokio::spawn(write_loop(
			transport,
			outbound_rx,
			shutdown_rx,
			Outbound {
				fragmenter,
				max_message_size: options.max_message_size,
				handler: handler.clone(),
			},
			Arc::clone(&closed),
		));

		let dispatcher = tokio::spawn(dispatch_loop(
			inbound_rx,
			reader_done_rx,
			handler,
			Arc::clone(&closed),
			options.max_message_size,
		));

		Ok(Self {
			sender: MessageSender { tx: outbound_tx },
			shutdown_tx,
			closed,
			reader,
			writer,
			dispatcher,
		})
	}

	/// Returns a handle for queueing outbound messages.
	pub fn sender(&self) -> MessageSender {
		self.sender.clone()
	}

	/// Flushes queued messages, closes the transport, and stops all tasks.
	///
	/// The handler is not notified about a shutdown it requested.
	pub async fn shutdown(self) {
		let Connection {
			sender,
			shutdown_tx,
			closed,
			reader,
			writer,
			dispatcher,
		} = self;

		closed.disarm();
		drop(sender);
		let _ = shutdown_tx.send(());
		let _ = writer.await;

		reader.abort();
		dispatcher.abort();
		let _ = reader.await;
		let _ = dispatcher.await;
		tracing::debug!("Connection shut down");
	}
}

/// Writer-side state: framing plus where to report dropped messages.
struct Outbound {
	fragmenter: Fragmenter,
	max_message_size: usize,
	handler: Weak<dyn MessageHandler>,
}

impl Outbound {
	/// Encodes and fragments one message, or explains why it cannot be sent.
	fn frame(&mut self, message: &Message) -> Result<Vec<Fragment>> {
		let bytes = message.encode()?;
		if bytes.len() > self.max_message_size {
			return Err(Error::InvalidArgument(format!(
				"message of {} bytes exceeds the {}-byte limit",
				bytes.len(),
				self.max_message_size
			)));
		}

		let fragments = self.fragmenter.push(message.target, &bytes);
		tracing::trace!(
			destination = ?message.target,
			object_id = fragments[0].object_id,
			fragments = fragments.len(),
			bytes = bytes.len(),
			"Sending message"
		);
		Ok(fragments)
	}
}

async fn write_loop(
	mut transport: Box<dyn Transport>,
	mut outbound: mpsc::UnboundedReceiver<Message>,
	mut shutdown: oneshot::Receiver<()>,
	mut framing: Outbound,
	closed: Arc<CloseSignal>,
) {
	loop {
		// Queued messages win over shutdown so a close request is flushed first.
		let message = tokio::select! {
			biased;
			message = outbound.recv() => match message {
				Some(message) => message,
				None => break,
			},
			_ = &mut shutdown => break,
		};

		let fragments = match framing.frame(&message) {
			Ok(fragments) => fragments,
			Err(e) => {
				tracing::error!(destination = ?message.target, error = %e, "Dropping unsendable message");
				if let Some(handler) = framing.handler.upgrade() {
					handler.on_send_failed(message.target, e);
				}
				continue;
			}
		};

		if let Err(e) = send_fragments(transport.as_mut(), &fragments).await {
			tracing::error!(error = %e, "Transport write error");
			closed.fire(Some(e));
			break;
		}
	}

	if let Err(e) = transport.close().await {
		tracing::debug!(error = %e, "Error closing transport");
	}
}

async fn send_fragments(transport: &mut dyn Transport, fragments: &[Fragment]) -> Result<()> {
	for fragment in fragments {
		transport.send(fragment.encode()?).await?;
	}
	Ok(())
}

async fn dispatch_loop(
	mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
	reader_done: oneshot::Receiver<Result<()>>,
	handler: Weak<dyn MessageHandler>,
	closed: Arc<CloseSignal>,
	max_message_size: usize,
) {
	let mut decoder = FrameDecoder::new();
	let mut reassembler = Reassembler::new(max_message_size);

	let fault = 'receive: loop {
		let Some(chunk) = inbound.recv().await else {
			break None;
		};
		decoder.extend(&chunk);

		loop {
			match decoder.next_fragment() {
				Ok(Some(fragment)) => {
					let Some(handler) = handler.upgrade() else {
						tracing::debug!("Message handler dropped, stopping receive loop");
						return;
					};
					route_fragment(&mut reassembler, fragment, handler.as_ref());
				}
				Ok(None) => break,
				Err(e) => {
					break 'receive Some(Error::Transport(format!(
						"Corrupt fragment stream: {e}"
					)));
				}
			}
		}
	};

	let error = match fault {
		Some(error) => Some(error),
		None => match reader_done.await {
			Ok(Err(error)) => Some(error),
			Err(_) => Some(Error::ChannelClosed),
			Ok(Ok(())) if decoder.buffered() > 0 => Some(Error::Transport(format!(
				"Stream ended inside a fragment record ({} bytes pending)",
				decoder.buffered()
			))),
			Ok(Ok(())) => None,
		},
	};

	if reassembler.pending_objects() > 0 {
		tracing::debug!(
			pending = reassembler.pending_objects(),
			"Channel ended with partially received messages"
		);
	}
	closed.fire(error);
}

fn route_fragment(reassembler: &mut Reassembler, fragment: Fragment, handler: &dyn MessageHandler) {
	let target = fragment.target;
	match reassembler.feed(fragment) {
		Ok(None) => {}
		Ok(Some(body)) => match Message::decode(target, &body) {
			Ok(message) => handler.on_message(message),
			Err(e) => {
				tracing::warn!(destination = ?target, error = %e, "Dropping undecodable message");
				handler.on_framing_error(target, e.into());
			}
		},
		Err(e) => {
			tracing::warn!(object_id = e.object_id, destination = ?e.target, error = %e, "Dropping malformed message");
			handler.on_framing_error(e.target, e.into());
		}
	}
}

#[cfg(test)]
mod tests;
