//! Identifiers for pools and pipelines.

use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a runspace pool, stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(Uuid);

impl PoolId {
	/// Generates a fresh random pool id.
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}

	pub fn from_uuid(uuid: Uuid) -> Self {
		Self(uuid)
	}

	pub fn as_uuid(&self) -> Uuid {
		self.0
	}
}

impl Default for PoolId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for PoolId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// Identity of a pipeline within its pool.
///
/// Zero is never a valid pipeline id: the message header uses it to address
/// the pool itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(NonZeroU64);

impl PipelineId {
	/// Returns `None` for zero.
	pub fn new(raw: u64) -> Option<Self> {
		NonZeroU64::new(raw).map(Self)
	}

	pub fn get(self) -> u64 {
		self.0.get()
	}
}

impl fmt::Display for PipelineId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}
