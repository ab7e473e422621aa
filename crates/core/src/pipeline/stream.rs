//! Single-consumer record streams.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use rsh_protocol::StreamKind;
use serde_json::Value;
use tokio::sync::mpsc;

/// Ordered records from one stream of one pipeline.
///
/// Records can be read as they arrive ([`recv`](Self::recv), or as a
/// [`Stream`]) or all at once after completion ([`drain`](Self::drain)). The
/// sequence ends when the pipeline reaches a terminal state.
#[derive(Debug)]
pub struct RecordStream {
	kind: StreamKind,
	rx: mpsc::UnboundedReceiver<Value>,
}

impl RecordStream {
	pub(crate) fn channel(kind: StreamKind) -> (mpsc::UnboundedSender<Value>, Self) {
		let (tx, rx) = mpsc::unbounded_channel();
		(tx, Self { kind, rx })
	}

	pub fn kind(&self) -> StreamKind {
		self.kind
	}

	/// Waits for the next record; `None` once the pipeline has finished and
	/// every buffered record was read.
	pub async fn recv(&mut self) -> Option<Value> {
		self.rx.recv().await
	}

	/// Returns a buffered record without waiting.
	pub fn try_recv(&mut self) -> Option<Value> {
		self.rx.try_recv().ok()
	}

	/// Waits for the pipeline to finish and returns every remaining record.
	pub async fn drain(mut self) -> Vec<Value> {
		let mut records = Vec::new();
		while let Some(record) = self.rx.recv().await {
			records.push(record);
		}
		records
	}
}

impl Stream for RecordStream {
	type Item = Value;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
		self.rx.poll_recv(cx)
	}
}
