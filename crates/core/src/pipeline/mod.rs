//! Pipelines: one remote command chain and its result streams.
//!
//! A [`Pipeline`] is a handle; its state lives in a [`PipelineCore`] owned by
//! the pool's registry. All state transitions happen under the pool lock so
//! admission counts and pipeline states never disagree.

mod stream;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rsh_protocol::{Command, PipelineId, StreamKind};
use rsh_runtime::{Error, Result};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};

pub use self::stream::RecordStream;
use crate::pool::PoolInner;
use crate::state::PipelineState;

/// Record appended to the error stream when a local fault ends a pipeline.
pub(crate) fn error_record(error: &Error) -> Value {
	json!({
		"message": error.to_string(),
		"category": error.category(),
	})
}

/// Record appended when the host reports a failure.
pub(crate) fn remote_error_record(reason: Option<&str>) -> Value {
	json!({
		"message": reason.unwrap_or("Remote pipeline failed"),
		"category": "RemoteError",
	})
}

pub(crate) struct PipelineCore {
	id: PipelineId,
	commands: Vec<Command>,
	state: watch::Sender<PipelineState>,
	/// Indexed by [`StreamKind::index`]; dropped on the terminal transition.
	writers: Mutex<Option<Vec<mpsc::UnboundedSender<Value>>>>,
	readers: Mutex<Vec<Option<RecordStream>>>,
	invoked: AtomicBool,
}

impl PipelineCore {
	pub(crate) fn new(id: PipelineId, commands: Vec<Command>) -> Self {
		let (writers, readers) = StreamKind::ALL
			.iter()
			.map(|&kind| {
				let (tx, stream) = RecordStream::channel(kind);
				(tx, Some(stream))
			})
			.unzip();

		Self {
			id,
			commands,
			state: watch::Sender::new(PipelineState::NotStarted),
			writers: Mutex::new(Some(writers)),
			readers: Mutex::new(readers),
			invoked: AtomicBool::new(false),
		}
	}

	pub(crate) fn id(&self) -> PipelineId {
		self.id
	}

	pub(crate) fn commands(&self) -> &[Command] {
		&self.commands
	}

	pub(crate) fn state(&self) -> PipelineState {
		*self.state.borrow()
	}

	pub(crate) fn is_invoked(&self) -> bool {
		self.invoked.load(Ordering::SeqCst)
	}

	pub(crate) fn mark_invoked(&self) {
		self.invoked.store(true, Ordering::SeqCst);
	}

	pub(crate) fn set_state(&self, state: PipelineState) {
		tracing::debug!(pipeline = %self.id, %state, "Pipeline state changed");
		self.state.send_replace(state);
	}

	/// Appends a record. Returns false once the streams are closed.
	pub(crate) fn push(&self, kind: StreamKind, data: Value) -> bool {
		let writers = self.writers.lock();
		match writers.as_ref() {
			// A dropped reader just means nobody is listening to that stream.
			Some(writers) => {
				let _ = writers[kind.index()].send(data);
				true
			}
			None => false,
		}
	}

	/// Moves to a terminal state, optionally appending a final error record.
	///
	/// Streams close before the new state is published.
	pub(crate) fn finish(&self, state: PipelineState, error: Option<Value>) {
		debug_assert!(state.is_terminal());
		if let Some(record) = error {
			self.push(StreamKind::Error, record);
		}
		self.writers.lock().take();
		self.set_state(state);
	}

	fn take_stream(&self, kind: StreamKind) -> Option<RecordStream> {
		self.readers.lock()[kind.index()].take()
	}
}

/// Handle to one pipeline of a [`RunspacePool`](crate::RunspacePool).
pub struct Pipeline {
	core: Arc<PipelineCore>,
	pool: Arc<PoolInner>,
}

impl Pipeline {
	pub(crate) fn new(core: Arc<PipelineCore>, pool: Arc<PoolInner>) -> Self {
		Self { core, pool }
	}

	pub fn id(&self) -> PipelineId {
		self.core.id()
	}

	pub fn commands(&self) -> &[Command] {
		self.core.commands()
	}

	pub fn state(&self) -> PipelineState {
		self.core.state()
	}

	/// Watches state transitions; the terminal state is the completion signal.
	pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
		self.core.state.subscribe()
	}

	/// Takes the consumer end of one stream. Each stream can be taken once.
	pub fn take_stream(&self, kind: StreamKind) -> Option<RecordStream> {
		self.core.take_stream(kind)
	}

	/// Shorthand for `take_stream(StreamKind::Output)`.
	pub fn output(&self) -> Option<RecordStream> {
		self.take_stream(StreamKind::Output)
	}

	/// Shorthand for `take_stream(StreamKind::Error)`.
	pub fn errors(&self) -> Option<RecordStream> {
		self.take_stream(StreamKind::Error)
	}

	/// Submits the pipeline for execution without waiting.
	///
	/// The pool starts it at once when a runspace is free, otherwise it is
	/// `Queued`. Fails with [`Error::AlreadyInvoked`] on a second call.
	pub fn begin_invoke(&self) -> Result<()> {
		self.pool.admit(&self.core)
	}

	/// Submits the pipeline and waits for its terminal state.
	///
	/// A `Failed` outcome is a state, not an error: the cause is the last
	/// record on the error stream.
	pub async fn invoke(&self) -> Result<PipelineState> {
		self.begin_invoke()?;
		Ok(self.wait().await)
	}

	/// Waits until the pipeline reaches a terminal state.
	pub async fn wait(&self) -> PipelineState {
		self.wait_until(PipelineState::is_terminal).await
	}

	/// Waits until the pipeline is no longer `Queued`.
	pub async fn wait_admitted(&self) -> PipelineState {
		self.wait_until(|state| *state != PipelineState::Queued).await
	}

	async fn wait_until(&self, done: impl FnMut(&PipelineState) -> bool) -> PipelineState {
		let mut rx = self.core.state.subscribe();
		let reached = rx.wait_for(done).await.map(|state| *state);
		reached.unwrap_or_else(|_| self.state())
	}

	/// Requests cancellation.
	///
	/// The pipeline is `Stopped` when this returns; records produced before
	/// the stop stay readable. Calling it on a pipeline that was never
	/// invoked, or one already finished, does nothing.
	pub fn stop(&self) {
		self.pool.stop_pipeline(&self.core);
	}

	/// Stops the pipeline if needed and removes it from the pool.
	pub fn dispose(self) {
		self.pool.dispose_pipeline(&self.core);
	}
}

impl fmt::Debug for Pipeline {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Pipeline")
			.field("id", &self.core.id)
			.field("state", &self.core.state())
			.field("commands", &self.core.commands.len())
			.finish()
	}
}
