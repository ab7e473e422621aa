//! Fragment records and their byte-stream framing.
//!
//! Every protocol message travels as one or more fragments. On the wire a
//! fragment is one contiguous record:
//!
//! ```text
//! ┌───────────┬─────────────┬──────────┬───────┬─────────────┬─────────┐
//! │ object id │ fragment id │  target  │ flags │ payload len │ payload │
//! │  u64 LE   │   u64 LE    │  u64 LE  │  u8   │   u32 LE    │  bytes  │
//! └───────────┴─────────────┴──────────┴───────┴─────────────┴─────────┘
//! ```
//!
//! Every fragment repeats the [`Target`] of its message, so a receiver can
//! attribute any fragment to its pipeline, even one whose message never
//! started or already finished.
//!
//! The transport may deliver bytes in arbitrary chunks, so [`FrameDecoder`]
//! buffers input and yields records only once they are complete.

use crate::error::WireError;
use crate::message::Target;

/// Size of the fixed record header preceding each payload.
pub const FRAGMENT_HEADER_LEN: usize = 8 + 8 + 8 + 1 + 4;

/// Smallest fragment payload size a sender may configure.
pub const MIN_FRAGMENT_PAYLOAD: usize = 64;

/// Largest payload a single record may carry.
pub const MAX_FRAGMENT_PAYLOAD: usize = 16 * 1024 * 1024;

/// Flag bit marking the last fragment of a message.
pub const FLAG_END: u8 = 0b0000_0001;

/// One bounded chunk of a protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
	/// Message this fragment belongs to.
	pub object_id: u64,
	/// Position within the message, contiguous from zero.
	pub fragment_id: u64,
	/// Addressee of the whole message; identical on every fragment.
	pub target: Target,
	/// Set on the final fragment of the message.
	pub is_end: bool,
	pub payload: Vec<u8>,
}

impl Fragment {
	/// Total size of the encoded record.
	pub fn encoded_len(&self) -> usize {
		FRAGMENT_HEADER_LEN + self.payload.len()
	}

	/// Appends the wire record for this fragment to `buf`.
	pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
		let length = self.payload.len();
		let wire_length = u32::try_from(length)
			.ok()
			.filter(|_| length <= MAX_FRAGMENT_PAYLOAD)
			.ok_or(WireError::PayloadTooLarge {
				length,
				limit: MAX_FRAGMENT_PAYLOAD,
			})?;

		buf.reserve(self.encoded_len());
		buf.extend_from_slice(&self.object_id.to_le_bytes());
		buf.extend_from_slice(&self.fragment_id.to_le_bytes());
		buf.extend_from_slice(&self.target.to_wire().to_le_bytes());
		buf.push(if self.is_end { FLAG_END } else { 0 });
		buf.extend_from_slice(&wire_length.to_le_bytes());
		buf.extend_from_slice(&self.payload);
		Ok(())
	}

	/// Encodes this fragment as a standalone record.
	pub fn encode(&self) -> Result<Vec<u8>, WireError> {
		let mut buf = Vec::with_capacity(self.encoded_len());
		self.encode_into(&mut buf)?;
		Ok(buf)
	}
}

/// Incremental parser turning a chunked byte stream into [`Fragment`]s.
///
/// A decode error means the stream itself is corrupt: record boundaries can no
/// longer be trusted and the channel must be abandoned.
#[derive(Debug, Default)]
pub struct FrameDecoder {
	buf: Vec<u8>,
	start: usize,
}

impl FrameDecoder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends a chunk received from the transport.
	pub fn extend(&mut self, chunk: &[u8]) {
		if self.start > 0 {
			self.buf.drain(..self.start);
			self.start = 0;
		}
		self.buf.extend_from_slice(chunk);
	}

	/// Bytes received but not yet consumed by a complete record.
	pub fn buffered(&self) -> usize {
		self.buf.len() - self.start
	}

	/// Returns the next complete record, or `None` if more input is needed.
	pub fn next_fragment(&mut self) -> Result<Option<Fragment>, WireError> {
		let available = &self.buf[self.start..];
		if available.len() < FRAGMENT_HEADER_LEN {
			return Ok(None);
		}

		let object_id = u64::from_le_bytes(read_array(available, 0));
		let fragment_id = u64::from_le_bytes(read_array(available, 8));
		let target = Target::from_wire(u64::from_le_bytes(read_array(available, 16)));
		let flags = available[24];
		let length = u32::from_le_bytes(read_array(available, 25)) as usize;

		if flags & !FLAG_END != 0 {
			return Err(WireError::ReservedFlags(flags));
		}
		if length > MAX_FRAGMENT_PAYLOAD {
			return Err(WireError::PayloadTooLarge {
				length,
				limit: MAX_FRAGMENT_PAYLOAD,
			});
		}

		let record_len = FRAGMENT_HEADER_LEN + length;
		if available.len() < record_len {
			return Ok(None);
		}

		let payload = available[FRAGMENT_HEADER_LEN..record_len].to_vec();
		self.start += record_len;

		Ok(Some(Fragment {
			object_id,
			fragment_id,
			target,
			is_end: flags & FLAG_END != 0,
			payload,
		}))
	}
}

fn read_array<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
	let mut out = [0u8; N];
	out.copy_from_slice(&bytes[at..at + N]);
	out
}
