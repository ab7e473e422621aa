//! Protocol messages exchanged between a client pool and a remote host.
//!
//! A message is a [`Target`] plus a tagged JSON [`Payload`]. Only the payload
//! is encoded into the message body; the target travels in the header of
//! every fragment carrying that body (`0` addresses the pool).
//!
//! # Flow
//!
//! 1. Client sends [`Payload::InitPool`] and waits for [`Payload::PoolState`]
//! 2. Client sends [`Payload::CreatePipeline`] addressed to a pipeline id
//! 3. Host streams [`Payload::Record`]s, then one [`Payload::PipelineState`]
//! 4. Client sends [`Payload::ClosePool`] before closing the transport

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::Command;
use crate::error::WireError;
use crate::ids::{PipelineId, PoolId};

/// Addressee of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
	/// The runspace pool as a whole.
	Pool,
	/// One pipeline of the pool.
	Pipeline(PipelineId),
}

impl Target {
	pub(crate) fn to_wire(self) -> u64 {
		match self {
			Target::Pool => 0,
			Target::Pipeline(id) => id.get(),
		}
	}

	pub(crate) fn from_wire(raw: u64) -> Self {
		PipelineId::new(raw).map_or(Target::Pool, Target::Pipeline)
	}

	/// Returns the pipeline id for pipeline-addressed messages.
	pub fn pipeline(self) -> Option<PipelineId> {
		match self {
			Target::Pool => None,
			Target::Pipeline(id) => Some(id),
		}
	}
}

/// The result and diagnostic streams a pipeline produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
	Output,
	Error,
	Warning,
	Verbose,
	Debug,
	Information,
	Progress,
}

impl StreamKind {
	/// Every stream, in a stable order.
	pub const ALL: [StreamKind; 7] = [
		StreamKind::Output,
		StreamKind::Error,
		StreamKind::Warning,
		StreamKind::Verbose,
		StreamKind::Debug,
		StreamKind::Information,
		StreamKind::Progress,
	];

	/// Position of this stream within [`StreamKind::ALL`].
	pub fn index(self) -> usize {
		match self {
			StreamKind::Output => 0,
			StreamKind::Error => 1,
			StreamKind::Warning => 2,
			StreamKind::Verbose => 3,
			StreamKind::Debug => 4,
			StreamKind::Information => 5,
			StreamKind::Progress => 6,
		}
	}

	/// True for the auxiliary streams (everything but output and error).
	pub fn is_diagnostic(self) -> bool {
		!matches!(self, StreamKind::Output | StreamKind::Error)
	}
}

/// Pool states reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemotePoolState {
	Opened,
	Broken,
	Closed,
}

/// Terminal pipeline states reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemotePipelineState {
	Completed,
	Failed,
	Stopped,
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Payload {
	/// Client asks the host to create the remote pool.
	InitPool {
		pool_id: PoolId,
		min_runspaces: u32,
		max_runspaces: u32,
	},
	/// Client re-attaches to an existing remote pool over a new transport.
	ConnectPool { pool_id: PoolId },
	/// Client changes the pool's concurrency limit.
	SetMaxRunspaces { max_runspaces: u32 },
	/// Client starts a pipeline; the target header carries its id.
	CreatePipeline { commands: Vec<Command> },
	/// Client requests cancellation of the addressed pipeline.
	StopPipeline,
	/// Client is closing the pool.
	ClosePool,
	/// Host reports a pool state change.
	PoolState {
		state: RemotePoolState,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		reason: Option<String>,
	},
	/// Host delivers one record on one of the pipeline's streams.
	Record { stream: StreamKind, data: Value },
	/// Host reports that the addressed pipeline finished.
	PipelineState {
		state: RemotePipelineState,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		reason: Option<String>,
	},
}

/// A complete protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
	pub target: Target,
	pub payload: Payload,
}

impl Message {
	/// Creates a pool-level message.
	pub fn pool(payload: Payload) -> Self {
		Self {
			target: Target::Pool,
			payload,
		}
	}

	/// Creates a message addressed to one pipeline.
	pub fn pipeline(id: PipelineId, payload: Payload) -> Self {
		Self {
			target: Target::Pipeline(id),
			payload,
		}
	}

	/// Serializes the payload into a message body.
	pub fn encode(&self) -> Result<Vec<u8>, WireError> {
		Ok(serde_json::to_vec(&self.payload)?)
	}

	/// Parses a reassembled body addressed to `target`.
	pub fn decode(target: Target, body: &[u8]) -> Result<Self, WireError> {
		let payload = serde_json::from_slice(body)?;
		Ok(Self { target, payload })
	}
}
