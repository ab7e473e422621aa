//! Pool and pipeline lifecycle states.
//!
//! ```text
//! Pool:
//!   BeforeOpen ──▶ Opening ──┬──▶ Opened ──┬──▶ Closing ──▶ Closed
//!                            │      ▲      ├──▶ Broken
//!                            │      │      └──▶ Disconnected ──┬──▶ Opened (reconnect)
//!                            └──▶ Broken                       └──▶ Closing
//!
//! Pipeline:
//!   NotStarted ──▶ Queued ──▶ Running ──┬──▶ Completed
//!        │            │                 ├──▶ Failed
//!        └────────────┴─────────────────┴──▶ Stopped
//! ```

use std::fmt;

/// Lifecycle of a runspace pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolState {
	BeforeOpen,
	Opening,
	Opened,
	Closing,
	Closed,
	/// Failed to open, or the host reported the pool unusable.
	Broken,
	/// The channel dropped while opened; `reconnect` may recover.
	Disconnected,
}

impl PoolState {
	/// `Broken` and `Closed` are final.
	pub fn is_terminal(&self) -> bool {
		matches!(self, PoolState::Broken | PoolState::Closed)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			PoolState::BeforeOpen => "BeforeOpen",
			PoolState::Opening => "Opening",
			PoolState::Opened => "Opened",
			PoolState::Closing => "Closing",
			PoolState::Closed => "Closed",
			PoolState::Broken => "Broken",
			PoolState::Disconnected => "Disconnected",
		}
	}
}

impl fmt::Display for PoolState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Lifecycle of one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
	NotStarted,
	/// Waiting in the pool's admission queue.
	Queued,
	Running,
	Completed,
	Failed,
	Stopped,
}

impl PipelineState {
	/// `Completed`, `Failed`, and `Stopped` are final and mutually exclusive.
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			PipelineState::Completed | PipelineState::Failed | PipelineState::Stopped
		)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			PipelineState::NotStarted => "NotStarted",
			PipelineState::Queued => "Queued",
			PipelineState::Running => "Running",
			PipelineState::Completed => "Completed",
			PipelineState::Failed => "Failed",
			PipelineState::Stopped => "Stopped",
		}
	}
}

impl fmt::Display for PipelineState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
