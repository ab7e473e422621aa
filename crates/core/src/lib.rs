//! rsh - remote command execution over runspace pools
//!
//! Runs command pipelines on a remote shell host over one multiplexed
//! channel per pool:
//!
//! - **Runspace pools**: open/close/reconnect state machine with min/max
//!   admission control and a FIFO queue ([`RunspacePool`])
//! - **Pipelines**: asynchronous invocation, cooperative stop, and ordered
//!   per-stream results ([`Pipeline`], [`RecordStream`])
//! - **Batching**: fusing a chain of proxy and relay commands into a single
//!   remote pipeline ([`batch`])
//!
//! The channel itself is pluggable: implement [`Connector`] for an endpoint,
//! or use [`PipeTransport`] over any async byte stream.
//!
//! # Example
//!
//! ```ignore
//! use rsh::{Command, PoolOptions, RunspacePool};
//!
//! let pool = RunspacePool::connect(connector, PoolOptions::new(1, 4)).await?;
//! let pipeline = pool.submit(vec![Command::new("Get-Process").param("Name", "sshd")])?;
//! let output = pipeline.output().expect("output stream");
//! for record in output.drain().await {
//!     println!("{record}");
//! }
//! pool.close().await?;
//! ```

pub mod batch;
pub mod config;
pub mod pipeline;
pub mod pool;
pub mod state;

pub use batch::{
	AllowlistClassifier, ChainDescriptor, ChainEntry, Classifier, CommandClass, FusedChain,
	Rejection, Relay, analyze, try_batch,
};
pub use config::{BatchingConfig, PoolOptions, RemotingConfig};
pub use pipeline::{Pipeline, RecordStream};
pub use pool::RunspacePool;
pub use rsh_protocol::{Argument, Command, PipelineId, PoolId, StreamKind};
pub use rsh_runtime::{
	BoxFuture, Connector, Error, PipeTransport, Result, Transport, TransportParts,
	TransportReceiver,
};
pub use state::{PipelineState, PoolState};
