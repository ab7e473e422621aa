//! Scripted remote host speaking the protocol over in-memory pipes.
//!
//! Each `connect` spawns a fresh host session. The session answers the pool
//! handshake, records everything the client sends as [`HostEvent`]s, and runs
//! a few canned commands on its own:
//!
//! - `Write-Output a b c`: one output record per positional argument, then completes
//! - `Write-Error msg`: one error record, then fails
//! - `Write-Streams`: one record on every stream, then completes
//!
//! Any other command keeps running until the test drives it through
//! [`MockHost::emit`], [`MockHost::complete`], and friends.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rsh::{
	BoxFuture, Command, Connector, Error, PipeTransport, PipelineId, Result, StreamKind, Transport,
	TransportParts,
};
use rsh_protocol::{FrameDecoder, Message, Payload, RemotePipelineState, RemotePoolState, Target};
use rsh_runtime::{DEFAULT_MAX_MESSAGE_SIZE, Fragmenter, Reassembler};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::mpsc;

/// Fragment size the host uses, small enough that most messages split.
pub const HOST_FRAGMENT_SIZE: usize = 64;

const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

/// Awaits `future`, failing the test if it takes too long.
pub async fn within<F: Future>(future: F) -> F::Output {
	tokio::time::timeout(TIMEOUT, future)
		.await
		.expect("timed out")
}

/// What the host saw from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
	InitPool { min: u32, max: u32 },
	ConnectPool,
	SetMaxRunspaces(u32),
	ClosePool,
	CreatePipeline { id: PipelineId, commands: Vec<Command> },
	StopPipeline(PipelineId),
}

/// How the host answers `InitPool` / `ConnectPool`.
#[derive(Debug, Clone)]
pub enum OpenReply {
	Opened,
	Broken(String),
	Hangup,
}

enum Control {
	Send(Message),
	/// Sends fragments 0 and 2 of a record for the pipeline, skipping 1.
	Malformed(PipelineId),
	/// Sends every fragment of a record for the pipeline except the first.
	MissingStart(PipelineId),
	Hangup,
}

struct HostState {
	open_reply: Mutex<OpenReply>,
	refuse: AtomicBool,
	fail_sends: Arc<AtomicBool>,
	connects: AtomicUsize,
	events_tx: mpsc::UnboundedSender<HostEvent>,
	events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<HostEvent>>,
	session: Mutex<Option<mpsc::UnboundedSender<Control>>>,
}

#[derive(Clone)]
pub struct MockHost {
	state: Arc<HostState>,
}

impl MockHost {
	pub fn new() -> Self {
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		Self {
			state: Arc::new(HostState {
				open_reply: Mutex::new(OpenReply::Opened),
				refuse: AtomicBool::new(false),
				fail_sends: Arc::new(AtomicBool::new(false)),
				connects: AtomicUsize::new(0),
				events_tx,
				events_rx: tokio::sync::Mutex::new(events_rx),
				session: Mutex::new(None),
			}),
		}
	}

	pub fn set_open_reply(&self, reply: OpenReply) {
		*self.state.open_reply.lock() = reply;
	}

	pub fn refuse_connections(&self, refuse: bool) {
		self.state.refuse.store(refuse, Ordering::SeqCst);
	}

	/// Makes the client's outbound writes fail, as if the socket had died.
	pub fn fail_sends(&self, fail: bool) {
		self.state.fail_sends.store(fail, Ordering::SeqCst);
	}

	/// Number of connection attempts so far.
	pub fn connects(&self) -> usize {
		self.state.connects.load(Ordering::SeqCst)
	}

	pub async fn next_event(&self) -> HostEvent {
		let mut events = self.state.events_rx.lock().await;
		within(events.recv()).await.expect("host event channel closed")
	}

	/// Skips events until one matches.
	pub async fn next_matching(&self, mut wanted: impl FnMut(&HostEvent) -> bool) -> HostEvent {
		loop {
			let event = self.next_event().await;
			if wanted(&event) {
				return event;
			}
		}
	}

	/// Waits for the host to be asked to run `id`.
	pub async fn created(&self, id: PipelineId) -> Vec<Command> {
		match self
			.next_matching(|event| matches!(event, HostEvent::CreatePipeline { id: seen, .. } if *seen == id))
			.await
		{
			HostEvent::CreatePipeline { commands, .. } => commands,
			other => unreachable!("matched {other:?}"),
		}
	}

	/// Returns a buffered event without waiting.
	pub fn try_event(&self) -> Option<HostEvent> {
		self.state.events_rx.try_lock().ok()?.try_recv().ok()
	}

	pub fn send(&self, message: Message) {
		self.control(Control::Send(message));
	}

	pub fn emit(&self, id: PipelineId, stream: StreamKind, data: Value) {
		self.send(record(id, stream, data));
	}

	pub fn complete(&self, id: PipelineId) {
		self.send(pipeline_state(id, RemotePipelineState::Completed, None));
	}

	pub fn fail(&self, id: PipelineId, reason: &str) {
		self.send(pipeline_state(id, RemotePipelineState::Failed, Some(reason)));
	}

	pub fn report_pool_state(&self, state: RemotePoolState, reason: Option<&str>) {
		self.send(Message::pool(Payload::PoolState {
			state,
			reason: reason.map(String::from),
		}));
	}

	pub fn send_malformed(&self, id: PipelineId) {
		self.control(Control::Malformed(id));
	}

	pub fn send_missing_start(&self, id: PipelineId) {
		self.control(Control::MissingStart(id));
	}

	/// Drops the current session's pipes.
	pub fn disconnect(&self) {
		self.control(Control::Hangup);
	}

	fn control(&self, control: Control) {
		let session = self.state.session.lock();
		let session = session.as_ref().expect("no host session");
		let _ = session.send(control);
	}
}

impl Connector for MockHost {
	fn connect(&self) -> BoxFuture<'_, Result<TransportParts>> {
		Box::pin(async move {
			self.state.connects.fetch_add(1, Ordering::SeqCst);
			if self.state.refuse.load(Ordering::SeqCst) {
				return Err(Error::Connection("host unreachable".into()));
			}

			let (remote_read, local_write) = duplex(64 * 1024);
			let (local_read, remote_write) = duplex(64 * 1024);
			let (control_tx, control_rx) = mpsc::unbounded_channel();
			*self.state.session.lock() = Some(control_tx);
			tokio::spawn(run_session(
				Arc::clone(&self.state),
				remote_read,
				remote_write,
				control_rx,
			));

			let (transport, inbound_rx) = PipeTransport::new(local_write, local_read);
			let mut parts = transport.into_transport_parts(inbound_rx);
			parts.sender = Box::new(SwitchedTransport {
				inner: parts.sender,
				fail: Arc::clone(&self.state.fail_sends),
			});
			Ok(parts)
		})
	}
}

/// Client-side sender that errors while its switch is on.
struct SwitchedTransport {
	inner: Box<dyn Transport>,
	fail: Arc<AtomicBool>,
}

impl Transport for SwitchedTransport {
	fn send(&mut self, bytes: Vec<u8>) -> BoxFuture<'_, Result<()>> {
		if self.fail.load(Ordering::SeqCst) {
			return Box::pin(async { Err(Error::Transport("broken pipe".into())) });
		}
		self.inner.send(bytes)
	}

	fn close(&mut self) -> BoxFuture<'_, Result<()>> {
		self.inner.close()
	}
}

fn record(id: PipelineId, stream: StreamKind, data: Value) -> Message {
	Message::pipeline(id, Payload::Record { stream, data })
}

fn pipeline_state(id: PipelineId, state: RemotePipelineState, reason: Option<&str>) -> Message {
	Message::pipeline(
		id,
		Payload::PipelineState {
			state,
			reason: reason.map(String::from),
		},
	)
}

async fn run_session(
	state: Arc<HostState>,
	mut reader: DuplexStream,
	mut writer: DuplexStream,
	mut control: mpsc::UnboundedReceiver<Control>,
) {
	let mut decoder = FrameDecoder::new();
	let mut reassembler = Reassembler::new(DEFAULT_MAX_MESSAGE_SIZE);
	let mut fragmenter = Fragmenter::new(HOST_FRAGMENT_SIZE).unwrap();
	let mut buf = vec![0u8; 4096];

	loop {
		let actions = tokio::select! {
			read = reader.read(&mut buf) => {
				let n = match read {
					Ok(0) | Err(_) => break,
					Ok(n) => n,
				};
				decoder.extend(&buf[..n]);

				let mut actions = Vec::new();
				while let Some(fragment) = decoder.next_fragment().unwrap() {
					let target = fragment.target;
					if let Some(body) = reassembler.feed(fragment).unwrap() {
						actions.extend(respond(&state, Message::decode(target, &body).unwrap()));
					}
				}
				actions
			}
			command = control.recv() => match command {
				Some(command) => vec![command],
				None => break,
			},
		};

		for action in actions {
			let written = match action {
				Control::Send(message) => write_message(&mut writer, &mut fragmenter, &message).await,
				Control::Malformed(id) => write_partial(&mut writer, &mut fragmenter, id, &[0, 2]).await,
				Control::MissingStart(id) => write_partial(&mut writer, &mut fragmenter, id, &[1, 2, 3]).await,
				Control::Hangup => return,
			};
			if written.is_err() {
				return;
			}
		}
	}
}

async fn write_message(
	writer: &mut DuplexStream,
	fragmenter: &mut Fragmenter,
	message: &Message,
) -> std::io::Result<()> {
	let bytes = message.encode().unwrap();
	for fragment in fragmenter.push(message.target, &bytes) {
		writer.write_all(&fragment.encode().unwrap()).await?;
	}
	Ok(())
}

/// Writes only the chosen fragments of a 300-byte output record.
async fn write_partial(
	writer: &mut DuplexStream,
	fragmenter: &mut Fragmenter,
	id: PipelineId,
	keep: &[usize],
) -> std::io::Result<()> {
	let message = record(id, StreamKind::Output, json!("z".repeat(300)));
	let fragments = fragmenter.push(message.target, &message.encode().unwrap());
	assert!(fragments.len() > *keep.iter().max().unwrap());
	for &index in keep {
		writer.write_all(&fragments[index].encode().unwrap()).await?;
	}
	Ok(())
}

fn respond(state: &HostState, message: Message) -> Vec<Control> {
	let event = |event: HostEvent| {
		let _ = state.events_tx.send(event);
	};

	match (message.target, message.payload) {
		(
			Target::Pool,
			Payload::InitPool {
				min_runspaces,
				max_runspaces,
				..
			},
		) => {
			event(HostEvent::InitPool {
				min: min_runspaces,
				max: max_runspaces,
			});
			open_reply(state)
		}
		(Target::Pool, Payload::ConnectPool { .. }) => {
			event(HostEvent::ConnectPool);
			open_reply(state)
		}
		(Target::Pool, Payload::SetMaxRunspaces { max_runspaces }) => {
			event(HostEvent::SetMaxRunspaces(max_runspaces));
			Vec::new()
		}
		(Target::Pool, Payload::ClosePool) => {
			event(HostEvent::ClosePool);
			Vec::new()
		}
		(Target::Pipeline(id), Payload::CreatePipeline { commands }) => {
			let actions = script(id, &commands);
			event(HostEvent::CreatePipeline { id, commands });
			actions
		}
		(Target::Pipeline(id), Payload::StopPipeline) => {
			event(HostEvent::StopPipeline(id));
			vec![Control::Send(pipeline_state(id, RemotePipelineState::Stopped, None))]
		}
		(target, payload) => panic!("host got unexpected {payload:?} for {target:?}"),
	}
}

fn open_reply(state: &HostState) -> Vec<Control> {
	let reply = state.open_reply.lock().clone();
	match reply {
		OpenReply::Opened => vec![Control::Send(Message::pool(Payload::PoolState {
			state: RemotePoolState::Opened,
			reason: None,
		}))],
		OpenReply::Broken(reason) => vec![Control::Send(Message::pool(Payload::PoolState {
			state: RemotePoolState::Broken,
			reason: Some(reason),
		}))],
		OpenReply::Hangup => vec![Control::Hangup],
	}
}

fn script(id: PipelineId, commands: &[Command]) -> Vec<Control> {
	let Some(first) = commands.first() else {
		return Vec::new();
	};

	let mut actions = Vec::new();
	match first.name.as_str() {
		"Write-Output" => {
			for value in first.positional() {
				actions.push(Control::Send(record(id, StreamKind::Output, value.clone())));
			}
			actions.push(Control::Send(pipeline_state(id, RemotePipelineState::Completed, None)));
		}
		"Write-Error" => {
			let message = first.positional().next().cloned().unwrap_or(Value::Null);
			actions.push(Control::Send(record(id, StreamKind::Error, message)));
			actions.push(Control::Send(pipeline_state(
				id,
				RemotePipelineState::Failed,
				Some("scripted failure"),
			)));
		}
		"Write-Streams" => {
			for kind in StreamKind::ALL {
				actions.push(Control::Send(record(id, kind, json!(format!("{kind:?}")))));
			}
			actions.push(Control::Send(pipeline_state(id, RemotePipelineState::Completed, None)));
		}
		_ => {}
	}
	actions
}
