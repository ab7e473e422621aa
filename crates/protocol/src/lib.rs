//! Wire types for the rsh remoting protocol.
//!
//! This crate holds everything both ends of a remoting channel must agree on,
//! and nothing that needs a runtime:
//!
//! - **Fragments**: bounded chunks of a message and their byte-stream framing
//! - **Messages**: a [`Target`] plus the tagged JSON [`Payload`]
//! - **Commands**: command descriptors submitted as a pipeline
//! - **Identifiers**: [`PoolId`] and [`PipelineId`]
//!
//! # Layering
//!
//! ```text
//! Payload ──serde_json──▶ Message bytes ──split──▶ Fragment records ──▶ transport
//! ```

pub mod command;
pub mod error;
pub mod fragment;
pub mod ids;
pub mod message;

pub use command::{Argument, Command};
pub use error::WireError;
pub use fragment::{
	FLAG_END, FRAGMENT_HEADER_LEN, Fragment, FrameDecoder, MAX_FRAGMENT_PAYLOAD, MIN_FRAGMENT_PAYLOAD,
};
pub use ids::{PipelineId, PoolId};
pub use message::{
	Message, Payload, RemotePipelineState, RemotePoolState, StreamKind, Target,
};
