//! rsh runtime - transport, fragmentation, and message dispatch
//!
//! This crate moves protocol messages between a client pool and a remote host:
//!
//! - **Transport**: pluggable duplex byte channel ([`Transport`], [`Connector`])
//! - **Fragmentation**: bounded records with per-object reassembly
//! - **Connection**: writer, reader, and dispatch tasks feeding a [`MessageHandler`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │     rsh     │  Pools, pipelines, batching
//! └──────┬──────┘
//!        │ implements MessageHandler
//! ┌──────▼──────┐
//! │ rsh-runtime │  This crate
//! │  ┌────────┐ │
//! │  │ Conn   │ │  Message dispatch
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │ Frag   │ │  Fragmenter / Reassembler
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │ Trans  │ │  Pipe transport, connector seam
//! │  └────────┘ │
//! └─────────────┘
//! ```
//!
//! # Decoupling via MessageHandler
//!
//! The `Connection` delivers decoded messages through the `MessageHandler`
//! trait and never sees pool or pipeline types, so this crate stays
//! independent of the `rsh` crate above it.

pub mod connection;
pub mod error;
pub mod fragment;
pub mod transport;

pub use connection::{
	Connection, ConnectionOptions, DEFAULT_MAX_FRAGMENT_SIZE, DEFAULT_MAX_MESSAGE_SIZE,
	MessageHandler, MessageSender,
};
pub use error::{Error, Result};
pub use fragment::{FramingError, FramingErrorKind, Fragmenter, Reassembler, fragment_message};
pub use transport::{
	BoxFuture, Connector, PipeTransport, PipeTransportReceiver, PipeTransportSender, Transport,
	TransportParts, TransportReceiver,
};
