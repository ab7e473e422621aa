//! Transport layer: the duplex channel a pool runs over.
//!
//! The core depends only on these traits. Concrete endpoints (HTTP, SSH,
//! sockets) live elsewhere and plug in through a [`Connector`].
//!
//! A transport is split into two halves so reading and writing run on
//! independent tasks:
//!
//! - [`Transport`]: ordered, reliable byte sender
//! - [`TransportReceiver`]: drives reads and forwards raw chunks into the
//!   `inbound_rx` channel handed out in [`TransportParts`]
//!
//! Chunk boundaries carry no meaning; record framing happens above this layer.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Boxed future used by the object-safe transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Read buffer size for [`PipeTransportReceiver`].
const READ_CHUNK: usize = 32 * 1024;

/// Opens channels to one remote endpoint.
///
/// Called once by `open` and again by every `reconnect`.
pub trait Connector: Send + Sync {
	/// Opens a fresh channel. Failures surface as [`Error::Connection`].
	fn connect(&self) -> BoxFuture<'_, Result<TransportParts>>;
}

/// Sending half of a channel.
pub trait Transport: Send {
	/// Writes `bytes` in order after everything sent before.
	fn send(&mut self, bytes: Vec<u8>) -> BoxFuture<'_, Result<()>>;

	/// Releases the channel. Safe to call more than once.
	fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Receiving half of a channel.
pub trait TransportReceiver: Send {
	/// Reads until the remote closes (`Ok`) or the channel fails (`Err`).
	///
	/// Stops early, returning `Ok`, once the inbound consumer goes away.
	fn run(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

/// An opened channel, ready to be handed to a connection.
pub struct TransportParts {
	pub sender: Box<dyn Transport>,
	pub receiver: Box<dyn TransportReceiver>,
	/// Raw inbound chunks produced by `receiver`.
	pub inbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Transport over any pair of async byte streams.
///
/// Works for child-process stdio, Unix sockets, TCP streams, and
/// [`tokio::io::duplex`] pipes in tests.
pub struct PipeTransport<W, R> {
	writer: W,
	reader: R,
	inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl<W, R> PipeTransport<W, R>
where
	W: AsyncWrite + Unpin + Send + 'static,
	R: AsyncRead + Unpin + Send + 'static,
{
	/// Creates a transport and the receiver for its inbound chunks.
	pub fn new(writer: W, reader: R) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
		let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
		(
			Self {
				writer,
				reader,
				inbound_tx,
			},
			inbound_rx,
		)
	}

	/// Splits into independently owned halves.
	pub fn into_parts(self) -> (PipeTransportSender<W>, PipeTransportReceiver<R>) {
		(
			PipeTransportSender {
				writer: Some(self.writer),
			},
			PipeTransportReceiver {
				reader: self.reader,
				inbound_tx: self.inbound_tx,
			},
		)
	}

	/// Packages the halves as [`TransportParts`].
	pub fn into_transport_parts(
		self,
		inbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
	) -> TransportParts {
		let (sender, receiver) = self.into_parts();
		TransportParts {
			sender: Box::new(sender),
			receiver: Box::new(receiver),
			inbound_rx,
		}
	}
}

/// Writing half of a [`PipeTransport`].
pub struct PipeTransportSender<W> {
	writer: Option<W>,
}

impl<W> Transport for PipeTransportSender<W>
where
	W: AsyncWrite + Unpin + Send + 'static,
{
	fn send(&mut self, bytes: Vec<u8>) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			let writer = self.writer.as_mut().ok_or(Error::ChannelClosed)?;
			writer
				.write_all(&bytes)
				.await
				.map_err(|e| Error::Transport(format!("Failed to write: {e}")))?;
			writer
				.flush()
				.await
				.map_err(|e| Error::Transport(format!("Failed to flush: {e}")))
		})
	}

	fn close(&mut self) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			if let Some(mut writer) = self.writer.take() {
				writer
					.shutdown()
					.await
					.map_err(|e| Error::Transport(format!("Failed to shut down writer: {e}")))?;
			}
			Ok(())
		})
	}
}

/// Reading half of a [`PipeTransport`].
pub struct PipeTransportReceiver<R> {
	reader: R,
	inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl<R> PipeTransportReceiver<R>
where
	R: AsyncRead + Unpin + Send + 'static,
{
	/// Forwards chunks until EOF, a read error, or the consumer hanging up.
	pub async fn read_loop(mut self) -> Result<()> {
		loop {
			let mut chunk = vec![0u8; READ_CHUNK];
			let read = self
				.reader
				.read(&mut chunk)
				.await
				.map_err(|e| Error::Transport(format!("Failed to read: {e}")))?;

			if read == 0 {
				tracing::debug!("Transport reached end of stream");
				return Ok(());
			}

			chunk.truncate(read);
			if self.inbound_tx.send(chunk).is_err() {
				tracing::debug!("Inbound consumer dropped, stopping transport reader");
				return Ok(());
			}
		}
	}
}

impl<R> TransportReceiver for PipeTransportReceiver<R>
where
	R: AsyncRead + Unpin + Send + 'static,
{
	fn run(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
		Box::pin((*self).read_loop())
	}
}
