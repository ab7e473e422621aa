//! Pool and batching configuration.
//!
//! Loaded from JSON with camelCase keys; every field is optional:
//!
//! ```json
//! {
//!   "pool": { "minRunspaces": 1, "maxRunspaces": 4, "maxFragmentSize": 32768 },
//!   "batching": { "streamingRelays": ["Where-Object"], "materializingRelays": ["Sort-Object"] }
//! }
//! ```

use std::path::Path;

use rsh_protocol::{MAX_FRAGMENT_PAYLOAD, MIN_FRAGMENT_PAYLOAD};
use rsh_runtime::{
	ConnectionOptions, DEFAULT_MAX_FRAGMENT_SIZE, DEFAULT_MAX_MESSAGE_SIZE, Error, Result,
};
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemotingConfig {
	pub pool: PoolOptions,
	pub batching: BatchingConfig,
}

impl RemotingConfig {
	/// Reads and validates a JSON config file.
	pub fn load(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let text = std::fs::read_to_string(path)?;
		let config = Self::from_json_str(&text)?;
		tracing::debug!(path = %path.display(), "Loaded remoting config");
		Ok(config)
	}

	pub fn from_json_str(text: &str) -> Result<Self> {
		let config: Self = serde_json::from_str(text)?;
		config.pool.validate()?;
		Ok(config)
	}
}

/// Sizing for one runspace pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolOptions {
	pub min_runspaces: usize,
	pub max_runspaces: usize,
	/// Largest fragment payload this side sends.
	pub max_fragment_size: usize,
	/// Largest message body this side sends or accepts.
	pub max_message_size: usize,
}

impl Default for PoolOptions {
	fn default() -> Self {
		Self {
			min_runspaces: 1,
			max_runspaces: 1,
			max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
			max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
		}
	}
}

impl PoolOptions {
	/// Options with the given runspace bounds and default sizes.
	pub fn new(min_runspaces: usize, max_runspaces: usize) -> Self {
		Self {
			min_runspaces,
			max_runspaces,
			..Self::default()
		}
	}

	pub fn validate(&self) -> Result<()> {
		if self.min_runspaces < 1 || self.min_runspaces > self.max_runspaces {
			return Err(Error::InvalidArgument(format!(
				"runspace bounds must satisfy 1 <= min <= max (min {}, max {})",
				self.min_runspaces, self.max_runspaces
			)));
		}
		if u32::try_from(self.max_runspaces).is_err() {
			return Err(Error::InvalidArgument(format!(
				"max runspaces {} does not fit the wire format",
				self.max_runspaces
			)));
		}
		if !(MIN_FRAGMENT_PAYLOAD..=MAX_FRAGMENT_PAYLOAD).contains(&self.max_fragment_size) {
			return Err(Error::InvalidArgument(format!(
				"fragment size {} outside {MIN_FRAGMENT_PAYLOAD}..={MAX_FRAGMENT_PAYLOAD}",
				self.max_fragment_size
			)));
		}
		if self.max_message_size == 0 {
			return Err(Error::InvalidArgument("max message size must be positive".into()));
		}
		Ok(())
	}

	pub(crate) fn connection_options(&self) -> ConnectionOptions {
		ConnectionOptions {
			max_fragment_size: self.max_fragment_size,
			max_message_size: self.max_message_size,
		}
	}
}

/// Command-name allowlists for [`AllowlistClassifier`](crate::batch::AllowlistClassifier).
///
/// Names match case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchingConfig {
	/// Relays that pass records through one at a time.
	pub streaming_relays: Vec<String>,
	/// Relays that buffer their whole input before emitting anything.
	pub materializing_relays: Vec<String>,
}

impl Default for BatchingConfig {
	fn default() -> Self {
		Self {
			streaming_relays: ["Where-Object", "ForEach-Object", "Select-Object"]
				.map(String::from)
				.to_vec(),
			materializing_relays: ["Sort-Object", "Group-Object", "Measure-Object"]
				.map(String::from)
				.to_vec(),
		}
	}
}
