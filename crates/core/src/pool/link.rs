//! The pool's side of a running channel: routes inbound messages, framing
//! faults, and channel loss into pool and pipeline state.

use std::sync::{Arc, Weak};

use rsh_protocol::{
	Message, Payload, PipelineId, RemotePipelineState, RemotePoolState, Target,
};
use rsh_runtime::{Connection, ConnectionOptions, Error, MessageHandler, MessageSender, Result, TransportParts};

use super::{PoolInner, Shared, connection_error};
use crate::pipeline::{error_record, remote_error_record};
use crate::state::{PipelineState, PoolState};

/// One channel generation: the connection plus the handler it reports to.
pub(super) struct Link {
	connection: Connection,
	_handler: Arc<LinkHandler>,
}

impl Link {
	pub(super) fn start(
		pool: &Arc<PoolInner>,
		generation: u64,
		parts: TransportParts,
		options: ConnectionOptions,
	) -> Result<Self> {
		let handler = Arc::new(LinkHandler {
			pool: Arc::downgrade(pool),
			generation,
		});
		let weak: Weak<LinkHandler> = Arc::downgrade(&handler);
		let weak: Weak<dyn MessageHandler> = weak;
		let connection = Connection::start(parts, weak, options)?;
		Ok(Self {
			connection,
			_handler: handler,
		})
	}

	pub(super) fn sender(&self) -> MessageSender {
		self.connection.sender()
	}

	pub(super) async fn shutdown(self) {
		self.connection.shutdown().await;
	}
}

/// Forwards connection callbacks to the pool, tagged with their generation.
struct LinkHandler {
	pool: Weak<PoolInner>,
	generation: u64,
}

impl MessageHandler for LinkHandler {
	fn on_message(&self, message: Message) {
		if let Some(pool) = self.pool.upgrade() {
			pool.on_link_message(self.generation, message);
		}
	}

	fn on_framing_error(&self, target: Target, error: Error) {
		if let Some(pool) = self.pool.upgrade() {
			pool.on_link_message_lost(self.generation, target, error, "inbound");
		}
	}

	fn on_send_failed(&self, target: Target, error: Error) {
		if let Some(pool) = self.pool.upgrade() {
			pool.on_link_message_lost(self.generation, target, error, "outbound");
		}
	}

	fn on_closed(&self, error: Option<Error>) {
		if let Some(pool) = self.pool.upgrade() {
			pool.on_link_closed(self.generation, error);
		}
	}
}

/// Shuts a detached link down off the callback path.
fn reap(link: Option<Link>) {
	if let Some(link) = link {
		tokio::spawn(link.shutdown());
	}
}

impl PoolInner {
	fn is_current(&self, shared: &Shared, generation: u64) -> bool {
		if shared.generation != generation {
			tracing::trace!(pool = %self.id, generation, "Ignoring callback from a replaced channel");
			return false;
		}
		true
	}

	fn on_link_message(&self, generation: u64, message: Message) {
		let mut shared = self.shared.lock();
		if !self.is_current(&shared, generation) {
			return;
		}
		match message.target {
			Target::Pool => self.on_pool_payload(&mut shared, message.payload),
			Target::Pipeline(id) => self.on_pipeline_payload(&mut shared, id, message.payload),
		}
	}

	fn on_pool_payload(&self, shared: &mut Shared, payload: Payload) {
		match payload {
			Payload::PoolState {
				state: RemotePoolState::Opened,
				..
			} => {
				let Some(handshake) = shared.handshake.take() else {
					tracing::debug!(pool = %self.id, "Ignoring unsolicited opened notice");
					return;
				};
				shared.sender = shared.link.as_ref().map(Link::sender);
				self.set_state(shared, PoolState::Opened);
				self.admit_queued(shared);
				let _ = handshake.send(Ok(()));
			}
			Payload::PoolState { state, reason } => {
				let reason = reason.unwrap_or_else(|| match state {
					RemotePoolState::Closed => "host closed the pool".to_string(),
					_ => "host reported the pool broken".to_string(),
				});
				let error = Error::Connection(reason);

				if let Some(handshake) = shared.handshake.take() {
					let _ = handshake.send(Err(error));
					return;
				}
				if shared.state == PoolState::Opened {
					tracing::warn!(pool = %self.id, error = %error, "Host ended the pool");
					self.set_state(shared, PoolState::Broken);
					self.fail_in_flight(shared, &error, true);
					reap(Self::detach(shared));
				}
			}
			other => {
				tracing::debug!(pool = %self.id, message = ?other, "Ignoring unexpected pool message");
			}
		}
	}

	fn on_pipeline_payload(&self, shared: &mut Shared, id: PipelineId, payload: Payload) {
		let Some(core) = shared.pipelines.get(&id).cloned() else {
			tracing::debug!(pool = %self.id, pipeline = %id, "Dropping message for unknown pipeline");
			return;
		};
		let current = core.state();
		if current != PipelineState::Running {
			tracing::debug!(pool = %self.id, pipeline = %id, state = %current, "Dropping late pipeline message");
			return;
		}

		match payload {
			Payload::Record { stream, data } => {
				core.push(stream, data);
			}
			Payload::PipelineState { state, reason } => {
				let (state, error) = match state {
					RemotePipelineState::Completed => (PipelineState::Completed, None),
					RemotePipelineState::Failed => (
						PipelineState::Failed,
						Some(remote_error_record(reason.as_deref())),
					),
					RemotePipelineState::Stopped => (PipelineState::Stopped, None),
				};
				self.finish_locked(shared, &core, state, error);
			}
			other => {
				tracing::debug!(pool = %self.id, pipeline = %id, message = ?other, "Ignoring unexpected pipeline message");
			}
		}
	}

	/// A message that was malformed on arrival, or could not be sent, fails
	/// the pipeline it was addressed to; the channel stays up.
	fn on_link_message_lost(&self, generation: u64, target: Target, error: Error, direction: &str) {
		let mut shared = self.shared.lock();
		if !self.is_current(&shared, generation) {
			return;
		}

		let id = match target {
			Target::Pipeline(id) => id,
			Target::Pool => {
				tracing::warn!(pool = %self.id, direction, error = %error, "Lost pool message");
				if let Some(handshake) = shared.handshake.take() {
					let _ = handshake.send(Err(connection_error(error)));
				}
				return;
			}
		};

		let Some(core) = shared.pipelines.get(&id).cloned() else {
			tracing::debug!(pool = %self.id, pipeline = %id, direction, "Lost message for unknown pipeline");
			return;
		};
		if core.state() == PipelineState::Running {
			tracing::warn!(pool = %self.id, pipeline = %id, direction, error = %error, "Pipeline failed on lost message");
			self.finish_locked(&mut shared, &core, PipelineState::Failed, Some(error_record(&error)));
		}
	}

	/// Channel loss: `Opened` becomes `Disconnected` and running pipelines
	/// fail; queued ones wait for a reconnect.
	fn on_link_closed(&self, generation: u64, error: Option<Error>) {
		let mut shared = self.shared.lock();
		if !self.is_current(&shared, generation) {
			return;
		}

		let error = match error {
			Some(error) => connection_error(error),
			None => Error::Connection("remote host closed the channel".into()),
		};

		if let Some(handshake) = shared.handshake.take() {
			// The pending open or reconnect owns the cleanup.
			let _ = handshake.send(Err(error));
			return;
		}

		if shared.state == PoolState::Opened {
			tracing::warn!(pool = %self.id, error = %error, "Channel lost, pool disconnected");
			self.set_state(&mut shared, PoolState::Disconnected);
			self.fail_in_flight(&mut shared, &error, false);
		}
		reap(Self::detach(&mut shared));
	}
}
