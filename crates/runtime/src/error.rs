//! Error types for the rsh runtime.

use rsh_protocol::{PipelineId, WireError};
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by pools, pipelines, and the channel beneath them.
#[derive(Debug, Error)]
pub enum Error {
	/// Opening or keeping the channel to the remote host failed.
	#[error("Connection failed: {0}")]
	Connection(String),

	/// Sending or receiving on an open channel failed.
	#[error("Transport error: {0}")]
	Transport(String),

	/// Operation attempted in a state that forbids it.
	#[error("Invalid state: cannot {operation} while {state}")]
	InvalidState {
		operation: &'static str,
		state: String,
	},

	/// Malformed or out-of-order fragment sequence for one message.
	#[error("Protocol framing error on object {object_id}: {reason}")]
	ProtocolFraming { object_id: u64, reason: String },

	/// A pipeline instance was invoked a second time.
	#[error("Pipeline {pipeline} has already been invoked")]
	AlreadyInvoked { pipeline: PipelineId },

	/// Invalid argument provided to a method.
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),

	/// A reassembled message could not be decoded.
	#[error("Malformed message: {0}")]
	Decode(#[from] WireError),

	/// Channel closed unexpectedly.
	#[error("Channel closed unexpectedly")]
	ChannelClosed,

	/// I/O error.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// JSON serialization/deserialization error.
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

impl Error {
	/// Returns true for failures of the channel itself.
	pub fn is_connection(&self) -> bool {
		matches!(
			self,
			Error::Connection(_) | Error::Transport(_) | Error::ChannelClosed | Error::Io(_)
		)
	}

	/// Returns true for errors scoped to a single message.
	pub fn is_framing(&self) -> bool {
		matches!(self, Error::ProtocolFraming { .. } | Error::Decode(_))
	}

	/// Returns true for local precondition violations.
	pub fn is_invalid_state(&self) -> bool {
		matches!(self, Error::InvalidState { .. } | Error::AlreadyInvoked { .. })
	}

	/// Short category name, used in error records.
	pub fn category(&self) -> &'static str {
		match self {
			Error::Connection(_) | Error::Transport(_) | Error::ChannelClosed | Error::Io(_) => {
				"ConnectionError"
			}
			Error::ProtocolFraming { .. } | Error::Decode(_) => "ProtocolFramingError",
			Error::InvalidState { .. } => "InvalidState",
			Error::AlreadyInvoked { .. } => "AlreadyInvoked",
			Error::InvalidArgument(_) => "InvalidArgument",
			Error::Json(_) => "SerializationError",
		}
	}
}
