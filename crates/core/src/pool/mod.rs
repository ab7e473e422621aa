//! Runspace pools: admission control over one remote channel.
//!
//! A [`RunspacePool`] owns one [`Connection`](rsh_runtime::Connection) at a time and a registry of
//! pipelines keyed by [`PipelineId`]. Everything that changes admission
//! counts, the FIFO queue, or the registry happens under a single lock,
//! which is never held across an `.await`.
//!
//! # Lifecycle
//!
//! 1. [`RunspacePool::open`] connects, sends `InitPool`, and waits for the
//!    host to report the pool opened
//! 2. [`RunspacePool::submit`] starts pipelines up to `max_runspaces`;
//!    the rest wait in the queue
//! 3. A dropped channel moves the pool to `Disconnected`;
//!    [`RunspacePool::reconnect`] re-attaches with `ConnectPool`
//! 4. [`RunspacePool::close`] stops every pipeline and releases the channel

mod link;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rsh_protocol::{Command, Message, Payload, PipelineId, PoolId};
use rsh_runtime::{Connector, Error, MessageSender, Result, TransportParts};
use tokio::sync::{oneshot, watch};

use self::link::Link;
use crate::batch::{self, ChainDescriptor};
use crate::config::PoolOptions;
use crate::pipeline::{Pipeline, PipelineCore, error_record};
use crate::state::{PipelineState, PoolState};

fn invalid_state(operation: &'static str, state: impl fmt::Display) -> Error {
	Error::InvalidState {
		operation,
		state: state.to_string(),
	}
}

fn wire_count(value: usize) -> Result<u32> {
	u32::try_from(value)
		.map_err(|_| Error::InvalidArgument(format!("runspace count {value} is too large")))
}

/// Connector failures always surface as connection errors.
fn connection_error(error: Error) -> Error {
	if matches!(error, Error::Connection(_)) {
		error
	} else {
		Error::Connection(error.to_string())
	}
}

/// A pool of remote runspaces sharing one channel.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct RunspacePool {
	inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
	id: PoolId,
	options: PoolOptions,
	connector: Arc<dyn Connector>,
	shared: Mutex<Shared>,
	state_tx: watch::Sender<PoolState>,
	next_pipeline_id: AtomicU64,
}

struct Shared {
	state: PoolState,
	/// Bumped whenever the channel is replaced; stale callbacks are ignored.
	generation: u64,
	link: Option<Link>,
	/// Present only while `Opened`.
	sender: Option<MessageSender>,
	/// Pending open or reconnect handshake.
	handshake: Option<oneshot::Sender<Result<()>>>,
	reconnecting: bool,
	pipelines: HashMap<PipelineId, Arc<PipelineCore>>,
	queue: VecDeque<PipelineId>,
	running: usize,
	max: usize,
}

impl RunspacePool {
	/// Creates a pool in `BeforeOpen`; nothing is connected yet.
	pub fn new(connector: impl Connector + 'static, options: PoolOptions) -> Self {
		Self::with_id(PoolId::new(), Arc::new(connector), options)
	}

	/// Creates a pool with a caller-chosen identity.
	pub fn with_id(id: PoolId, connector: Arc<dyn Connector>, options: PoolOptions) -> Self {
		let max = options.max_runspaces;
		let (state_tx, _) = watch::channel(PoolState::BeforeOpen);
		Self {
			inner: Arc::new(PoolInner {
				id,
				options,
				connector,
				shared: Mutex::new(Shared {
					state: PoolState::BeforeOpen,
					generation: 0,
					link: None,
					sender: None,
					handshake: None,
					reconnecting: false,
					pipelines: HashMap::new(),
					queue: VecDeque::new(),
					running: 0,
					max,
				}),
				state_tx,
				next_pipeline_id: AtomicU64::new(1),
			}),
		}
	}

	/// Creates and opens a pool in one step.
	pub async fn connect(connector: impl Connector + 'static, options: PoolOptions) -> Result<Self> {
		let pool = Self::new(connector, options);
		pool.open().await?;
		Ok(pool)
	}

	pub fn id(&self) -> PoolId {
		self.inner.id
	}

	pub fn state(&self) -> PoolState {
		self.inner.shared.lock().state
	}

	/// Watches pool state transitions, including asynchronous disconnects.
	pub fn subscribe(&self) -> watch::Receiver<PoolState> {
		self.inner.state_tx.subscribe()
	}

	pub fn min_runspaces(&self) -> usize {
		self.inner.options.min_runspaces
	}

	pub fn max_runspaces(&self) -> usize {
		self.inner.shared.lock().max
	}

	/// Free admission slots; zero unless `Opened`.
	pub fn available_runspaces(&self) -> usize {
		let shared = self.inner.shared.lock();
		if shared.state == PoolState::Opened {
			shared.max.saturating_sub(shared.running)
		} else {
			0
		}
	}

	pub fn running_pipelines(&self) -> usize {
		self.inner.shared.lock().running
	}

	pub fn queued_pipelines(&self) -> usize {
		self.inner.shared.lock().queue.len()
	}

	/// Connects and performs the open handshake.
	///
	/// `BeforeOpen → Opening → Opened`, or `Broken` with a connection error.
	pub async fn open(&self) -> Result<()> {
		self.inner.options.validate()?;
		let (min, max) = (
			wire_count(self.inner.options.min_runspaces)?,
			wire_count(self.inner.options.max_runspaces)?,
		);
		{
			let mut shared = self.inner.shared.lock();
			if shared.state != PoolState::BeforeOpen {
				return Err(invalid_state("open", shared.state));
			}
			self.inner.set_state(&mut shared, PoolState::Opening);
		}

		let hello = Payload::InitPool {
			pool_id: self.inner.id,
			min_runspaces: min,
			max_runspaces: max,
		};
		let outcome = match self.inner.connector.connect().await {
			Ok(parts) => {
				self.inner
					.handshake("open", PoolState::Opening, parts, hello)
					.await
			}
			Err(e) => Err(connection_error(e)),
		};

		if let Err(e) = outcome {
			tracing::warn!(pool = %self.inner.id, error = %e, "Failed to open pool");
			let link = {
				let mut shared = self.inner.shared.lock();
				if shared.state == PoolState::Opening {
					self.inner.set_state(&mut shared, PoolState::Broken);
				}
				PoolInner::detach(&mut shared)
			};
			if let Some(link) = link {
				link.shutdown().await;
			}
			return Err(e);
		}
		Ok(())
	}

	/// Re-attaches a `Disconnected` pool over a fresh channel.
	///
	/// On success the pool is `Opened` again and queued pipelines are admitted.
	/// On failure it stays `Disconnected`. No retries are made.
	pub async fn reconnect(&self) -> Result<()> {
		{
			let mut shared = self.inner.shared.lock();
			if shared.state != PoolState::Disconnected {
				return Err(invalid_state("reconnect", shared.state));
			}
			if shared.reconnecting {
				return Err(invalid_state("reconnect", "reconnecting"));
			}
			shared.reconnecting = true;
		}

		let hello = Payload::ConnectPool {
			pool_id: self.inner.id,
		};
		let outcome = match self.inner.connector.connect().await {
			Ok(parts) => {
				self.inner
					.handshake("reconnect", PoolState::Disconnected, parts, hello)
					.await
			}
			Err(e) => Err(connection_error(e)),
		};

		let link = {
			let mut shared = self.inner.shared.lock();
			shared.reconnecting = false;
			match &outcome {
				Ok(()) => None,
				Err(_) => PoolInner::detach(&mut shared),
			}
		};
		if let Some(link) = link {
			link.shutdown().await;
		}
		if let Err(e) = &outcome {
			tracing::warn!(pool = %self.inner.id, error = %e, "Reconnect failed");
		}
		outcome
	}

	/// Stops every unfinished pipeline and closes the channel.
	///
	/// An `Opened` pool passes through `Closing`; one still opening or
	/// disconnected goes straight to `Closed`. Idempotent; closing a `Broken`
	/// pool is a no-op.
	pub async fn close(&self) -> Result<()> {
		let link = {
			let mut shared = self.inner.shared.lock();
			match shared.state {
				PoolState::Closing | PoolState::Closed | PoolState::Broken => return Ok(()),
				PoolState::BeforeOpen => {
					self.inner.set_state(&mut shared, PoolState::Closed);
					return Ok(());
				}
				PoolState::Opening | PoolState::Opened | PoolState::Disconnected => {}
			}

			// Only an opened pool has a host to say goodbye to.
			let next = if shared.state == PoolState::Opened {
				PoolState::Closing
			} else {
				PoolState::Closed
			};
			self.inner.set_state(&mut shared, next);
			if let Some(handshake) = shared.handshake.take() {
				let _ = handshake.send(Err(Error::Connection("pool closed during handshake".into())));
			}

			let live: Vec<_> = shared
				.pipelines
				.values()
				.filter(|core| !core.state().is_terminal())
				.cloned()
				.collect();
			for core in live {
				self.inner.stop_locked(&mut shared, &core);
			}

			if let Some(sender) = shared.sender.take() {
				let _ = sender.send(Message::pool(Payload::ClosePool));
			}
			PoolInner::detach(&mut shared)
		};

		if let Some(link) = link {
			link.shutdown().await;
		}

		let mut shared = self.inner.shared.lock();
		if shared.state == PoolState::Closing {
			self.inner.set_state(&mut shared, PoolState::Closed);
		}
		Ok(())
	}

	/// Changes the concurrency limit; raising it admits queued pipelines.
	pub fn set_max_runspaces(&self, max: usize) -> Result<()> {
		let wire = wire_count(max)?;
		if max < self.inner.options.min_runspaces {
			return Err(Error::InvalidArgument(format!(
				"max runspaces {max} is below min {}",
				self.inner.options.min_runspaces
			)));
		}

		let mut shared = self.inner.shared.lock();
		match shared.state {
			PoolState::BeforeOpen | PoolState::Disconnected => {}
			PoolState::Opened => {
				if let Some(sender) = &shared.sender {
					sender.send(Message::pool(Payload::SetMaxRunspaces { max_runspaces: wire }))?;
				}
			}
			state => return Err(invalid_state("set max runspaces", state)),
		}
		tracing::debug!(pool = %self.inner.id, max, "Max runspaces changed");
		shared.max = max;
		self.inner.admit_queued(&mut shared);
		Ok(())
	}

	/// Registers a new `NotStarted` pipeline. Requires `Opened`.
	pub fn create_pipeline(&self, commands: Vec<Command>) -> Result<Pipeline> {
		if commands.is_empty() {
			return Err(Error::InvalidArgument("a pipeline needs at least one command".into()));
		}

		let mut shared = self.inner.shared.lock();
		if shared.state != PoolState::Opened {
			return Err(invalid_state("create pipeline", shared.state));
		}

		let raw = self.inner.next_pipeline_id.fetch_add(1, Ordering::SeqCst);
		let id = PipelineId::new(raw)
			.ok_or_else(|| Error::InvalidArgument("pipeline id space exhausted".into()))?;
		let core = Arc::new(PipelineCore::new(id, commands));
		shared.pipelines.insert(id, Arc::clone(&core));
		tracing::debug!(pool = %self.inner.id, pipeline = %id, "Pipeline created");

		Ok(Pipeline::new(core, Arc::clone(&self.inner)))
	}

	/// Creates a pipeline and starts it (or queues it) without waiting.
	pub fn submit(&self, commands: Vec<Command>) -> Result<Pipeline> {
		let pipeline = self.create_pipeline(commands)?;
		pipeline.begin_invoke()?;
		Ok(pipeline)
	}

	/// Fuses `chain` into one pipeline when it is safe and targets this pool.
	///
	/// `None` means the caller should run the commands as separate round trips.
	pub fn submit_batched(&self, chain: &ChainDescriptor) -> Result<Option<Pipeline>> {
		match batch::try_batch(chain) {
			Some(fused) if fused.pool == self.inner.id => self.submit(fused.commands).map(Some),
			Some(fused) => {
				tracing::debug!(pool = %self.inner.id, fused_pool = %fused.pool, "Fused chain targets another pool");
				Ok(None)
			}
			None => Ok(None),
		}
	}
}

impl fmt::Debug for RunspacePool {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let shared = self.inner.shared.lock();
		f.debug_struct("RunspacePool")
			.field("id", &self.inner.id)
			.field("state", &shared.state)
			.field("running", &shared.running)
			.field("queued", &shared.queue.len())
			.field("max", &shared.max)
			.finish()
	}
}

impl PoolInner {
	fn set_state(&self, shared: &mut Shared, state: PoolState) {
		if shared.state == state {
			return;
		}
		tracing::debug!(pool = %self.id, from = %shared.state, to = %state, "Pool state changed");
		shared.state = state;
		self.state_tx.send_replace(state);
	}

	/// Starts a connection, sends `hello`, and waits for the host's answer.
	///
	/// `expected` is the state the pool must still be in once connected.
	async fn handshake(
		self: &Arc<Self>,
		operation: &'static str,
		expected: PoolState,
		parts: TransportParts,
		hello: Payload,
	) -> Result<()> {
		let answer = {
			let mut shared = self.shared.lock();
			if shared.state != expected {
				return Err(invalid_state(operation, shared.state));
			}
			shared.generation += 1;
			let link = Link::start(self, shared.generation, parts, self.options.connection_options())?;
			link.sender().send(Message::pool(hello))?;

			let (tx, rx) = oneshot::channel();
			shared.handshake = Some(tx);
			shared.link = Some(link);
			rx
		};

		answer
			.await
			.unwrap_or_else(|_| Err(Error::Connection("handshake abandoned".into())))
	}

	/// Drops the current channel from the pool, returning it for shutdown.
	fn detach(shared: &mut Shared) -> Option<Link> {
		shared.generation += 1;
		shared.sender = None;
		shared.handshake = None;
		shared.link.take()
	}

	/// Admits a `NotStarted` pipeline: starts it when a slot is free and
	/// nothing is waiting ahead of it, queues it otherwise.
	pub(crate) fn admit(&self, core: &Arc<PipelineCore>) -> Result<()> {
		let mut shared = self.shared.lock();
		if core.is_invoked() {
			return Err(Error::AlreadyInvoked {
				pipeline: core.id(),
			});
		}
		if shared.state != PoolState::Opened {
			return Err(invalid_state("invoke pipeline", shared.state));
		}
		if core.state() != PipelineState::NotStarted || !shared.pipelines.contains_key(&core.id()) {
			return Err(invalid_state("invoke pipeline", core.state()));
		}
		core.mark_invoked();

		if shared.running < shared.max && shared.queue.is_empty() {
			self.start_locked(&mut shared, core);
		} else {
			core.set_state(PipelineState::Queued);
			shared.queue.push_back(core.id());
			tracing::debug!(
				pool = %self.id,
				pipeline = %core.id(),
				queued = shared.queue.len(),
				"Pipeline queued"
			);
		}
		Ok(())
	}

	/// Sends `CreatePipeline` and takes a slot.
	fn start_locked(&self, shared: &mut Shared, core: &Arc<PipelineCore>) {
		let message = Message::pipeline(
			core.id(),
			Payload::CreatePipeline {
				commands: core.commands().to_vec(),
			},
		);
		let sent = match &shared.sender {
			Some(sender) => sender.send(message),
			None => Err(Error::ChannelClosed),
		};

		match sent {
			Ok(()) => {
				shared.running += 1;
				core.set_state(PipelineState::Running);
			}
			Err(e) => {
				tracing::warn!(pool = %self.id, pipeline = %core.id(), error = %e, "Failed to start pipeline");
				shared.queue.retain(|id| *id != core.id());
				core.finish(PipelineState::Failed, Some(error_record(&e)));
			}
		}
	}

	/// Starts queued pipelines, oldest first, while slots are free.
	fn admit_queued(&self, shared: &mut Shared) {
		while shared.state == PoolState::Opened && shared.running < shared.max {
			let Some(id) = shared.queue.pop_front() else {
				break;
			};
			let Some(core) = shared.pipelines.get(&id).cloned() else {
				continue;
			};
			if core.state() == PipelineState::Queued {
				self.start_locked(shared, &core);
			}
		}
	}

	/// Moves a pipeline to a terminal state and releases what it held.
	///
	/// Returns false if it had already finished.
	fn finish_locked(
		&self,
		shared: &mut Shared,
		core: &Arc<PipelineCore>,
		state: PipelineState,
		error: Option<serde_json::Value>,
	) -> bool {
		let previous = core.state();
		if previous.is_terminal() {
			return false;
		}
		core.finish(state, error);

		match previous {
			PipelineState::Running => {
				shared.running = shared.running.saturating_sub(1);
				self.admit_queued(shared);
			}
			PipelineState::Queued => shared.queue.retain(|id| *id != core.id()),
			_ => {}
		}
		true
	}

	fn stop_locked(&self, shared: &mut Shared, core: &Arc<PipelineCore>) {
		if core.state() == PipelineState::Running {
			if let Some(sender) = &shared.sender {
				if let Err(e) = sender.send(Message::pipeline(core.id(), Payload::StopPipeline)) {
					tracing::debug!(pipeline = %core.id(), error = %e, "Stop request not sent");
				}
			}
		}
		if self.finish_locked(shared, core, PipelineState::Stopped, None) {
			tracing::debug!(pool = %self.id, pipeline = %core.id(), "Pipeline stopped");
		}
	}

	/// Stops a submitted pipeline; one that was never invoked is left alone.
	pub(crate) fn stop_pipeline(&self, core: &Arc<PipelineCore>) {
		let mut shared = self.shared.lock();
		if core.state() == PipelineState::NotStarted {
			tracing::trace!(pool = %self.id, pipeline = %core.id(), "Ignoring stop of a pipeline never invoked");
			return;
		}
		self.stop_locked(&mut shared, core);
	}

	pub(crate) fn dispose_pipeline(&self, core: &Arc<PipelineCore>) {
		let mut shared = self.shared.lock();
		self.stop_locked(&mut shared, core);
		shared.pipelines.remove(&core.id());
	}

	/// Fails every `Running` pipeline, and queued ones too when `include_queued`.
	fn fail_in_flight(&self, shared: &mut Shared, error: &Error, include_queued: bool) {
		let affected: Vec<_> = shared
			.pipelines
			.values()
			.filter(|core| match core.state() {
				PipelineState::Running => true,
				PipelineState::Queued => include_queued,
				_ => false,
			})
			.cloned()
			.collect();

		for core in affected {
			self.finish_locked(shared, &core, PipelineState::Failed, Some(error_record(error)));
		}
	}
}
