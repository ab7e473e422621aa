//! Batching: fusing a command chain into one remote pipeline.
//!
//! A chain such as `Get-RemoteItem | Where-Object ... | Select-Object ...`
//! would normally cost one round trip per remote command, with the relay
//! commands running locally in between. When every command is a remote proxy
//! or a streaming relay, the whole chain can instead run as one remote
//! pipeline.
//!
//! The decision only looks at each command's [`CommandClass`]; which names
//! map to which class is up to the [`Classifier`] the caller supplies.
//!
//! ```text
//! proxy | streaming relay | proxy          → fused
//! proxy | materializing relay              → fused (nothing remote after it)
//! proxy | materializing relay | proxy      → MaterializingBeforeProxy
//! proxy | opaque                           → Opaque
//! ```

use std::collections::{HashMap, HashSet};

use rsh_protocol::{Command, PoolId};
use thiserror::Error;

use crate::config::BatchingConfig;

/// How a relay command consumes its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relay {
	/// Emits records as they arrive (filters, projections).
	Streaming,
	/// Buffers its entire input first (sorts, aggregates).
	Materializing,
}

/// Capability of one command in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandClass {
	/// Runs on the remote pool `pool`.
	RemoteProxy { pool: PoolId },
	/// Known side-effect-free local relay.
	Relay(Relay),
	/// Anything else; never fused.
	Opaque,
}

/// Assigns a [`CommandClass`] to a command.
pub trait Classifier {
	fn classify(&self, command: &Command) -> CommandClass;
}

impl<F> Classifier for F
where
	F: Fn(&Command) -> CommandClass,
{
	fn classify(&self, command: &Command) -> CommandClass {
		self(command)
	}
}

/// Name-based classifier: proxies by registration, relays by allowlist.
#[derive(Debug, Clone, Default)]
pub struct AllowlistClassifier {
	proxies: HashMap<String, PoolId>,
	streaming: HashSet<String>,
	materializing: HashSet<String>,
}

impl AllowlistClassifier {
	pub fn new(config: &BatchingConfig) -> Self {
		let lower = |names: &[String]| -> HashSet<String> {
			names.iter().map(|name| name.to_ascii_lowercase()).collect()
		};
		Self {
			proxies: HashMap::new(),
			streaming: lower(&config.streaming_relays),
			materializing: lower(&config.materializing_relays),
		}
	}

	/// Registers `name` as a proxy command that executes on `pool`.
	pub fn with_proxy(mut self, name: impl AsRef<str>, pool: PoolId) -> Self {
		self.proxies.insert(name.as_ref().to_ascii_lowercase(), pool);
		self
	}
}

impl Classifier for AllowlistClassifier {
	fn classify(&self, command: &Command) -> CommandClass {
		let name = command.name.to_ascii_lowercase();
		if let Some(&pool) = self.proxies.get(&name) {
			CommandClass::RemoteProxy { pool }
		} else if self.streaming.contains(&name) {
			CommandClass::Relay(Relay::Streaming)
		} else if self.materializing.contains(&name) {
			CommandClass::Relay(Relay::Materializing)
		} else {
			CommandClass::Opaque
		}
	}
}

/// One classified command of a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainEntry {
	pub command: Command,
	pub class: CommandClass,
}

/// A proposed local command chain, in execution order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainDescriptor {
	entries: Vec<ChainEntry>,
}

impl ChainDescriptor {
	pub fn new(entries: Vec<ChainEntry>) -> Self {
		Self { entries }
	}

	/// Classifies each command with `classifier`.
	pub fn classify(commands: Vec<Command>, classifier: &impl Classifier) -> Self {
		let entries = commands
			.into_iter()
			.map(|command| ChainEntry {
				class: classifier.classify(&command),
				command,
			})
			.collect();
		Self { entries }
	}

	pub fn push(&mut self, command: Command, class: CommandClass) {
		self.entries.push(ChainEntry { command, class });
	}

	pub fn entries(&self) -> &[ChainEntry] {
		&self.entries
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

/// A chain rewritten as a single pipeline for one pool.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedChain {
	pub pool: PoolId,
	pub commands: Vec<Command>,
}

/// Why a chain was left unfused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
	#[error("chain has {len} command(s); fusion needs at least 2")]
	TooShort { len: usize },

	#[error("command {index} ({name}) is opaque")]
	Opaque { index: usize, name: String },

	#[error("no command in the chain runs remotely")]
	NoRemoteProxy,

	#[error("remote commands target different pools")]
	MixedTargets,

	#[error("command {index} materializes its input before a later remote command")]
	MaterializingBeforeProxy { index: usize },
}

/// Decides whether `chain` can run as one remote pipeline.
///
/// Pure: no I/O, no side effects.
pub fn analyze(chain: &ChainDescriptor) -> Result<FusedChain, Rejection> {
	let entries = chain.entries();
	if entries.len() < 2 {
		return Err(Rejection::TooShort { len: entries.len() });
	}

	if let Some((index, entry)) = entries
		.iter()
		.enumerate()
		.find(|(_, entry)| entry.class == CommandClass::Opaque)
	{
		return Err(Rejection::Opaque {
			index,
			name: entry.command.name.clone(),
		});
	}

	let mut pool = None;
	let mut last_proxy = 0;
	for (index, entry) in entries.iter().enumerate() {
		if let CommandClass::RemoteProxy { pool: target } = entry.class {
			match pool {
				None => pool = Some(target),
				Some(first) if first != target => return Err(Rejection::MixedTargets),
				Some(_) => {}
			}
			last_proxy = index;
		}
	}
	let Some(pool) = pool else {
		return Err(Rejection::NoRemoteProxy);
	};

	if let Some(index) = entries[..last_proxy]
		.iter()
		.position(|entry| entry.class == CommandClass::Relay(Relay::Materializing))
	{
		return Err(Rejection::MaterializingBeforeProxy { index });
	}

	Ok(FusedChain {
		pool,
		commands: entries.iter().map(|entry| entry.command.clone()).collect(),
	})
}

/// [`analyze`], discarding the reason for a refusal.
pub fn try_batch(chain: &ChainDescriptor) -> Option<FusedChain> {
	match analyze(chain) {
		Ok(fused) => {
			tracing::debug!(pool = %fused.pool, commands = fused.commands.len(), "Fused command chain");
			Some(fused)
		}
		Err(reason) => {
			tracing::trace!(%reason, "Chain not fused");
			None
		}
	}
}
