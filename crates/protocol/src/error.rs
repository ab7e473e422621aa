//! Codec errors for fragment records and message bodies.

use thiserror::Error;

/// Errors raised while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum WireError {
	/// A fragment payload is longer than the protocol allows.
	#[error("fragment payload of {length} bytes exceeds the {limit}-byte limit")]
	PayloadTooLarge { length: usize, limit: usize },

	/// A fragment record sets flag bits this protocol version does not define.
	#[error("reserved fragment flag bits set: {0:#04x}")]
	ReservedFlags(u8),

	/// The JSON body of a message could not be (de)serialized.
	#[error("malformed message body: {0}")]
	Body(#[from] serde_json::Error),
}
