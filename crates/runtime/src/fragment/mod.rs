//! Message fragmentation and reassembly.
//!
//! Outgoing messages are split into bounded [`Fragment`]s under a fresh object
//! id. Incoming fragments are accumulated per object id, so messages for
//! different objects may interleave on one channel without blocking each
//! other.
//!
//! # Object id lifecycle
//!
//! ```text
//! unseen ──fragment 0──▶ pending ──end flag──▶ retired
//!                           │
//!                           └──gap / out-of-order──▶ retired (error)
//! ```
//!
//! A retired id never starts a new message. Senders allocate ids densely from
//! zero, which lets the retired set collapse into a low watermark. The set is
//! capped at [`MAX_RETIRED_SPAN`] ids: past that, the watermark is forced
//! upward and ids it skips over count as retired, so a sender that leaves
//! holes in its id sequence costs bounded memory.

use std::collections::{BTreeSet, HashMap};

use rsh_protocol::{Fragment, MAX_FRAGMENT_PAYLOAD, MIN_FRAGMENT_PAYLOAD, Target};
use thiserror::Error;

use crate::error::{Error, Result};

/// Messages one receiver may hold partially reassembled at a time.
pub const MAX_PENDING_OBJECTS: usize = 1024;

/// Retired ids tracked individually above the watermark.
pub const MAX_RETIRED_SPAN: usize = 4096;

/// Splits `message` into fragments of at most `max_payload` bytes.
///
/// Every fragment repeats `target`. An empty message still yields one (empty)
/// fragment carrying the end flag.
pub fn fragment_message(
	object_id: u64,
	target: Target,
	message: &[u8],
	max_payload: usize,
) -> Vec<Fragment> {
	if message.is_empty() {
		return vec![Fragment {
			object_id,
			fragment_id: 0,
			target,
			is_end: true,
			payload: Vec::new(),
		}];
	}

	let chunks = message.chunks(max_payload.max(1));
	let last = chunks.len() - 1;
	chunks
		.enumerate()
		.map(|(index, chunk)| Fragment {
			object_id,
			fragment_id: index as u64,
			target,
			is_end: index == last,
			payload: chunk.to_vec(),
		})
		.collect()
}

/// Sender side: allocates object ids and splits messages.
#[derive(Debug)]
pub struct Fragmenter {
	max_payload: usize,
	next_object_id: u64,
}

impl Fragmenter {
	/// Creates a fragmenter emitting payloads of at most `max_payload` bytes.
	pub fn new(max_payload: usize) -> Result<Self> {
		if !(MIN_FRAGMENT_PAYLOAD..=MAX_FRAGMENT_PAYLOAD).contains(&max_payload) {
			return Err(Error::InvalidArgument(format!(
				"fragment size {max_payload} outside {MIN_FRAGMENT_PAYLOAD}..={MAX_FRAGMENT_PAYLOAD}"
			)));
		}
		Ok(Self {
			max_payload,
			next_object_id: 0,
		})
	}

	pub fn max_payload(&self) -> usize {
		self.max_payload
	}

	/// Fragments a message body for `target` under the next object id.
	pub fn push(&mut self, target: Target, message: &[u8]) -> Vec<Fragment> {
		let object_id = self.next_object_id;
		self.next_object_id += 1;
		fragment_message(object_id, target, message, self.max_payload)
	}
}

/// Why a fragment was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingErrorKind {
	/// First fragment seen for an object was not fragment zero.
	#[error("message started at fragment {got} instead of 0")]
	MissingStart { got: u64 },

	/// One or more fragments were skipped.
	#[error("expected fragment {expected}, got {got}")]
	Gap { expected: u64, got: u64 },

	/// A fragment id was repeated or arrived late.
	#[error("duplicate or out-of-order fragment {got}, expected {expected}")]
	OutOfOrder { expected: u64, got: u64 },

	/// The object id already finished (or failed) earlier.
	#[error("object id already finalized")]
	AlreadyFinalized,

	/// A continuation named a different target than the message's first fragment.
	#[error("fragment for {got:?} continues a message for {expected:?}")]
	TargetChanged { expected: Target, got: Target },

	/// The message outgrew the reassembly limit.
	#[error("message exceeds {limit} bytes")]
	TooLarge { limit: usize },

	/// Too many messages were left unfinished at once.
	#[error("more than {limit} messages pending")]
	TooManyPending { limit: usize },
}

/// A rejected fragment and the target of the message it belonged to.
#[derive(Debug, Error)]
#[error("object {object_id}: {kind}")]
pub struct FramingError {
	pub object_id: u64,
	/// Target of the lost message.
	pub target: Target,
	pub kind: FramingErrorKind,
}

impl From<FramingError> for Error {
	fn from(error: FramingError) -> Self {
		Error::ProtocolFraming {
			object_id: error.object_id,
			reason: error.kind.to_string(),
		}
	}
}

#[derive(Debug)]
struct Pending {
	target: Target,
	next_fragment: u64,
	buffer: Vec<u8>,
}

/// Receiver side: rebuilds messages from interleaved fragments.
#[derive(Debug)]
pub struct Reassembler {
	pending: HashMap<u64, Pending>,
	/// Every object id below this is retired unless still pending.
	retired_below: u64,
	/// Retired ids at or above the watermark.
	retired: BTreeSet<u64>,
	max_message_size: usize,
}

impl Reassembler {
	pub fn new(max_message_size: usize) -> Self {
		Self {
			pending: HashMap::new(),
			retired_below: 0,
			retired: BTreeSet::new(),
			max_message_size,
		}
	}

	/// Accepts one fragment, returning the message body it completes, if any.
	///
	/// A completed body belongs to the fragment's target. An error drops the
	/// affected object's buffered data and retires its id; other objects are
	/// untouched.
	pub fn feed(&mut self, fragment: Fragment) -> std::result::Result<Option<Vec<u8>>, FramingError> {
		let Fragment {
			object_id,
			fragment_id,
			target,
			is_end,
			payload,
		} = fragment;

		let fail = |target: Target, kind: FramingErrorKind| FramingError {
			object_id,
			target,
			kind,
		};

		if !self.pending.contains_key(&object_id) {
			if self.is_retired(object_id) {
				return Err(fail(target, FramingErrorKind::AlreadyFinalized));
			}
			if fragment_id != 0 {
				self.retire(object_id);
				return Err(fail(target, FramingErrorKind::MissingStart { got: fragment_id }));
			}
			if self.pending.len() >= MAX_PENDING_OBJECTS {
				self.retire(object_id);
				return Err(fail(
					target,
					FramingErrorKind::TooManyPending {
						limit: MAX_PENDING_OBJECTS,
					},
				));
			}
		}

		let pending = self.pending.entry(object_id).or_insert_with(|| Pending {
			target,
			next_fragment: 0,
			buffer: Vec::new(),
		});

		let expected = pending.next_fragment;
		let kind = if pending.target != target {
			Some(FramingErrorKind::TargetChanged {
				expected: pending.target,
				got: target,
			})
		} else if fragment_id < expected {
			Some(FramingErrorKind::OutOfOrder {
				expected,
				got: fragment_id,
			})
		} else if fragment_id > expected {
			Some(FramingErrorKind::Gap {
				expected,
				got: fragment_id,
			})
		} else if pending.buffer.len() + payload.len() > self.max_message_size {
			Some(FramingErrorKind::TooLarge {
				limit: self.max_message_size,
			})
		} else {
			None
		};

		if let Some(kind) = kind {
			let target = pending.target;
			self.pending.remove(&object_id);
			self.retire(object_id);
			return Err(fail(target, kind));
		}

		pending.buffer.extend_from_slice(&payload);
		pending.next_fragment += 1;
		if !is_end {
			return Ok(None);
		}

		let message = self.pending.remove(&object_id).map(|p| p.buffer);
		self.retire(object_id);
		Ok(message)
	}

	/// Number of messages currently partially received.
	pub fn pending_objects(&self) -> usize {
		self.pending.len()
	}

	/// True once `object_id` has completed, failed, or fallen below the watermark.
	pub fn is_retired(&self, object_id: u64) -> bool {
		!self.pending.contains_key(&object_id)
			&& (object_id < self.retired_below || self.retired.contains(&object_id))
	}

	fn retire(&mut self, object_id: u64) {
		if object_id < self.retired_below {
			return;
		}
		self.retired.insert(object_id);
		while self.retired.len() > MAX_RETIRED_SPAN {
			if let Some(lowest) = self.retired.pop_first() {
				self.retired_below = lowest.saturating_add(1);
			}
		}
		while self.retired.remove(&self.retired_below) {
			self.retired_below += 1;
		}
	}
}
