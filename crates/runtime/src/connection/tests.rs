use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use rsh_protocol::{Command, Payload, PipelineId, RemotePipelineState, StreamKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::mpsc;

use super::*;
use crate::fragment::fragment_message;
use crate::transport::{BoxFuture, PipeTransport};

#[derive(Debug)]
enum Event {
	Message(Message),
	Framing(Target, Error),
	SendFailed(Target, Error),
	Closed(Option<Error>),
}

struct Recorder {
	tx: mpsc::UnboundedSender<Event>,
}

impl MessageHandler for Recorder {
	fn on_message(&self, message: Message) {
		let _ = self.tx.send(Event::Message(message));
	}

	fn on_framing_error(&self, target: Target, error: Error) {
		let _ = self.tx.send(Event::Framing(target, error));
	}

	fn on_send_failed(&self, target: Target, error: Error) {
		let _ = self.tx.send(Event::SendFailed(target, error));
	}

	fn on_closed(&self, error: Option<Error>) {
		let _ = self.tx.send(Event::Closed(error));
	}
}

struct Harness {
	connection: Connection,
	events: mpsc::UnboundedReceiver<Event>,
	_handler: Arc<Recorder>,
	/// Bytes the connection wrote.
	remote_read: DuplexStream,
	/// Bytes the connection will read.
	remote_write: DuplexStream,
}

fn start(max_fragment_size: usize) -> Harness {
	start_with(ConnectionOptions {
		max_fragment_size,
		..ConnectionOptions::default()
	})
}

fn start_with(options: ConnectionOptions) -> Harness {
	let (remote_read, local_write) = duplex(64 * 1024);
	let (local_read, remote_write) = duplex(64 * 1024);

	let (transport, inbound_rx) = PipeTransport::new(local_write, local_read);
	let parts = transport.into_transport_parts(inbound_rx);

	let (tx, events) = mpsc::unbounded_channel();
	let handler = Arc::new(Recorder { tx });
	let connection = Connection::start(parts, weak_handler(&handler), options).unwrap();

	Harness {
		connection,
		events,
		_handler: handler,
		remote_read,
		remote_write,
	}
}

fn weak_handler(handler: &Arc<Recorder>) -> Weak<dyn MessageHandler> {
	let weak: Weak<Recorder> = Arc::downgrade(handler);
	weak
}

fn pipeline(raw: u64) -> PipelineId {
	PipelineId::new(raw).unwrap()
}

fn record(id: u64, text: &str) -> Message {
	Message::pipeline(
		pipeline(id),
		Payload::Record {
			stream: StreamKind::Output,
			data: serde_json::json!(text),
		},
	)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
	tokio::time::timeout(Duration::from_secs(5), events.recv())
		.await
		.expect("timed out waiting for handler event")
		.expect("handler channel closed")
}

fn fragments_of(object_id: u64, message: &Message) -> Vec<Fragment> {
	fragment_message(object_id, message.target, &message.encode().unwrap(), 64)
}

async fn write_fragments(stream: &mut DuplexStream, fragments: &[Fragment]) {
	for fragment in fragments {
		stream.write_all(&fragment.encode().unwrap()).await.unwrap();
	}
}

/// Reads fragment records from the remote end until EOF.
async fn read_all_fragments(stream: &mut DuplexStream) -> Vec<Fragment> {
	let mut raw = Vec::new();
	tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
		.await
		.expect("timed out reading from connection")
		.unwrap();

	let mut decoder = FrameDecoder::new();
	decoder.extend(&raw);
	let mut fragments = Vec::new();
	while let Some(fragment) = decoder.next_fragment().unwrap() {
		fragments.push(fragment);
	}
	assert_eq!(decoder.buffered(), 0);
	fragments
}

fn reassemble(fragments: Vec<Fragment>) -> Vec<Message> {
	let mut reassembler = Reassembler::new(DEFAULT_MAX_MESSAGE_SIZE);
	fragments
		.into_iter()
		.filter_map(|fragment| {
			let target = fragment.target;
			let body = reassembler.feed(fragment).unwrap()?;
			Some(Message::decode(target, &body).unwrap())
		})
		.collect()
}

#[tokio::test]
async fn test_outbound_message_is_fragmented_under_one_object_id() {
	let mut harness = start(64);

	let message = Message::pipeline(
		pipeline(1),
		Payload::CreatePipeline {
			commands: vec![Command::new("Get-ChildItem").param("Path", "C:/".repeat(80))],
		},
	);
	harness.connection.sender().send(message.clone()).unwrap();
	harness.connection.shutdown().await;

	let fragments = read_all_fragments(&mut harness.remote_read).await;
	assert!(fragments.len() > 1);
	for (index, fragment) in fragments.iter().enumerate() {
		assert_eq!(fragment.object_id, 0);
		assert_eq!(fragment.fragment_id, index as u64);
		assert!(fragment.payload.len() <= 64);
		assert_eq!(fragment.is_end, index == fragments.len() - 1);
	}

	assert_eq!(reassemble(fragments), vec![message]);
}

#[tokio::test]
async fn test_shutdown_flushes_queued_messages_without_notifying() {
	let mut harness = start(DEFAULT_MAX_FRAGMENT_SIZE);

	let sender = harness.connection.sender();
	sender.send(Message::pool(Payload::SetMaxRunspaces { max_runspaces: 3 })).unwrap();
	sender.send(Message::pipeline(pipeline(2), Payload::StopPipeline)).unwrap();
	sender.send(Message::pool(Payload::ClosePool)).unwrap();
	harness.connection.shutdown().await;

	let messages = reassemble(read_all_fragments(&mut harness.remote_read).await);
	let payloads: Vec<_> = messages.into_iter().map(|m| m.payload).collect();
	assert_eq!(
		payloads,
		vec![
			Payload::SetMaxRunspaces { max_runspaces: 3 },
			Payload::StopPipeline,
			Payload::ClosePool,
		]
	);

	assert!(harness.events.try_recv().is_err());
	assert!(matches!(sender.send(Message::pool(Payload::ClosePool)), Err(Error::ChannelClosed)));
}

#[tokio::test]
async fn test_interleaved_inbound_messages_complete_independently() {
	let mut harness = start(64);

	let long = record(1, &"x".repeat(300));
	let short = Message::pipeline(
		pipeline(2),
		Payload::PipelineState {
			state: RemotePipelineState::Completed,
			reason: None,
		},
	);
	let long_fragments = fragments_of(0, &long);
	let short_fragments = fragments_of(1, &short);
	assert!(long_fragments.len() >= 3);
	assert_eq!(short_fragments.len(), 1);

	write_fragments(&mut harness.remote_write, &long_fragments[..1]).await;
	write_fragments(&mut harness.remote_write, &short_fragments).await;
	write_fragments(&mut harness.remote_write, &long_fragments[1..]).await;

	match next_event(&mut harness.events).await {
		Event::Message(message) => assert_eq!(message, short),
		other => panic!("Expected short message first, got {other:?}"),
	}
	match next_event(&mut harness.events).await {
		Event::Message(message) => assert_eq!(message, long),
		other => panic!("Expected long message, got {other:?}"),
	}
}

#[tokio::test]
async fn test_records_split_across_chunks_are_framed() {
	let mut harness = start(64);

	let message = record(5, "chunked");
	let mut raw = Vec::new();
	for fragment in fragments_of(0, &message) {
		fragment.encode_into(&mut raw).unwrap();
	}
	for byte in raw.chunks(3) {
		harness.remote_write.write_all(byte).await.unwrap();
	}

	match next_event(&mut harness.events).await {
		Event::Message(received) => assert_eq!(received, message),
		other => panic!("Expected message, got {other:?}"),
	}
}

#[tokio::test]
async fn test_fragment_gap_fails_only_that_message() {
	let mut harness = start(64);

	let broken = fragments_of(0, &record(7, &"y".repeat(300)));
	assert!(broken.len() >= 3);
	write_fragments(&mut harness.remote_write, &[broken[0].clone(), broken[2].clone()]).await;

	let healthy = record(8, "still flowing");
	let healthy_fragments = fragments_of(1, &healthy);
	write_fragments(&mut harness.remote_write, &healthy_fragments).await;

	match next_event(&mut harness.events).await {
		Event::Framing(target, error) => {
			assert_eq!(target, Target::Pipeline(pipeline(7)));
			assert!(error.is_framing());
			assert!(matches!(error, Error::ProtocolFraming { object_id: 0, .. }));
		}
		other => panic!("Expected framing error, got {other:?}"),
	}
	match next_event(&mut harness.events).await {
		Event::Message(message) => assert_eq!(message, healthy),
		other => panic!("Expected healthy message, got {other:?}"),
	}
}

#[tokio::test]
async fn test_undecodable_body_is_reported_with_target() {
	let mut harness = start(64);

	let target = Target::Pipeline(pipeline(9));
	write_fragments(
		&mut harness.remote_write,
		&fragment_message(0, target, b"{not json", 64),
	)
	.await;

	match next_event(&mut harness.events).await {
		Event::Framing(reported, error) => {
			assert_eq!(reported, target);
			assert!(matches!(error, Error::Decode(_)));
		}
		other => panic!("Expected decode failure, got {other:?}"),
	}
}

#[tokio::test]
async fn test_remote_eof_closes_cleanly() {
	let mut harness = start(64);

	let message = record(3, "last words");
	write_fragments(&mut harness.remote_write, &fragments_of(0, &message)).await;
	drop(harness.remote_write);

	match next_event(&mut harness.events).await {
		Event::Message(received) => assert_eq!(received, message),
		other => panic!("Expected message before close, got {other:?}"),
	}
	assert!(matches!(next_event(&mut harness.events).await, Event::Closed(None)));
}

#[tokio::test]
async fn test_reserved_flag_bits_end_the_channel() {
	let mut harness = start(64);

	let mut raw = Vec::new();
	raw.extend_from_slice(&0u64.to_le_bytes());
	raw.extend_from_slice(&0u64.to_le_bytes());
	raw.extend_from_slice(&0u64.to_le_bytes());
	raw.push(0x80);
	raw.extend_from_slice(&0u32.to_le_bytes());
	harness.remote_write.write_all(&raw).await.unwrap();

	match next_event(&mut harness.events).await {
		Event::Closed(Some(error)) => assert!(error.is_connection()),
		other => panic!("Expected fatal close, got {other:?}"),
	}
}

#[tokio::test]
async fn test_eof_inside_record_is_an_error() {
	let mut harness = start(64);

	harness.remote_write.write_all(&[1, 2, 3, 4, 5]).await.unwrap();
	drop(harness.remote_write);

	match next_event(&mut harness.events).await {
		Event::Closed(Some(Error::Transport(reason))) => assert!(reason.contains("5 bytes")),
		other => panic!("Expected truncated stream error, got {other:?}"),
	}
}

#[tokio::test]
async fn test_fragment_size_is_validated() {
	let (_remote_read, local_write) = duplex(1024);
	let (local_read, _remote_write) = duplex(1024);
	let (transport, inbound_rx) = PipeTransport::new(local_write, local_read);

	let handler = Arc::new(Recorder {
		tx: mpsc::unbounded_channel().0,
	});
	let weak = weak_handler(&handler);
	let options = ConnectionOptions {
		max_fragment_size: 8,
		..ConnectionOptions::default()
	};

	let result = Connection::start(transport.into_transport_parts(inbound_rx), weak, options);
	assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[tokio::test]
async fn test_message_missing_its_first_fragment_is_attributed() {
	let mut harness = start(64);

	let orphan = fragments_of(0, &record(4, &"q".repeat(300)));
	assert!(orphan.len() >= 3);
	write_fragments(&mut harness.remote_write, &orphan[1..]).await;

	match next_event(&mut harness.events).await {
		Event::Framing(target, error) => {
			assert_eq!(target, Target::Pipeline(pipeline(4)));
			assert!(error.to_string().contains("instead of 0"));
		}
		other => panic!("Expected framing error, got {other:?}"),
	}
	// Later fragments of the same object are dropped without another report.
	match next_event(&mut harness.events).await {
		Event::Framing(target, _) => assert_eq!(target, Target::Pipeline(pipeline(4))),
		other => panic!("Expected framing error, got {other:?}"),
	}
}

#[tokio::test]
async fn test_reused_object_id_is_attributed_to_its_new_target() {
	let mut harness = start(64);

	let first = record(1, "first");
	write_fragments(&mut harness.remote_write, &fragments_of(0, &first)).await;
	match next_event(&mut harness.events).await {
		Event::Message(message) => assert_eq!(message, first),
		other => panic!("Expected message, got {other:?}"),
	}

	write_fragments(&mut harness.remote_write, &fragments_of(0, &record(2, "reused"))).await;
	match next_event(&mut harness.events).await {
		Event::Framing(target, error) => {
			assert_eq!(target, Target::Pipeline(pipeline(2)));
			assert!(error.is_framing());
		}
		other => panic!("Expected framing error, got {other:?}"),
	}
}

#[tokio::test]
async fn test_oversized_outbound_message_is_reported_not_sent() {
	let mut harness = start_with(ConnectionOptions {
		max_fragment_size: 64,
		max_message_size: 256,
	});
	let sender = harness.connection.sender();

	let huge = Message::pipeline(
		pipeline(3),
		Payload::CreatePipeline {
			commands: vec![Command::new("Set-Content").param("Value", "v".repeat(1024))],
		},
	);
	sender.send(huge).unwrap();
	sender.send(Message::pool(Payload::ClosePool)).unwrap();

	match next_event(&mut harness.events).await {
		Event::SendFailed(target, error) => {
			assert_eq!(target, Target::Pipeline(pipeline(3)));
			assert!(matches!(error, Error::InvalidArgument(_)));
		}
		other => panic!("Expected send failure, got {other:?}"),
	}

	harness.connection.shutdown().await;
	let messages = reassemble(read_all_fragments(&mut harness.remote_read).await);
	assert_eq!(messages, vec![Message::pool(Payload::ClosePool)]);
}

/// Transport whose sends start failing after a fixed number of records.
struct FailingTransport {
	remaining: Arc<AtomicUsize>,
}

impl Transport for FailingTransport {
	fn send(&mut self, _bytes: Vec<u8>) -> BoxFuture<'_, Result<()>> {
		let remaining = Arc::clone(&self.remaining);
		Box::pin(async move {
			let left = remaining.load(Ordering::SeqCst);
			if left == 0 {
				return Err(Error::Transport("connection reset".into()));
			}
			remaining.store(left - 1, Ordering::SeqCst);
			Ok(())
		})
	}

	fn close(&mut self) -> BoxFuture<'_, Result<()>> {
		Box::pin(async { Ok(()) })
	}
}

#[tokio::test]
async fn test_transport_send_failure_closes_the_channel() {
	let (_remote_read, local_write) = duplex(1024);
	let (local_read, _remote_write) = duplex(1024);
	let (transport, inbound_rx) = PipeTransport::new(local_write, local_read);
	let mut parts = transport.into_transport_parts(inbound_rx);
	parts.sender = Box::new(FailingTransport {
		remaining: Arc::new(AtomicUsize::new(1)),
	});

	let (tx, mut events) = mpsc::unbounded_channel();
	let handler = Arc::new(Recorder { tx });
	let connection = Connection::start(parts, weak_handler(&handler), ConnectionOptions::default()).unwrap();

	let sender = connection.sender();
	sender.send(Message::pool(Payload::ClosePool)).unwrap();
	sender.send(Message::pipeline(pipeline(1), Payload::StopPipeline)).unwrap();

	match next_event(&mut events).await {
		Event::Closed(Some(error)) => {
			assert!(error.is_connection());
			assert!(error.to_string().contains("connection reset"));
		}
		other => panic!("Expected transport failure, got {other:?}"),
	}
	connection.shutdown().await;
	assert!(events.try_recv().is_err());
}
