// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{
  future::Future,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
  time::Duration,
};

use bytes::Bytes;
use dollop::{
  common::{
    connection::{ConnectionId, CLOSE_CODE_ERROR, CLOSE_CODE_GRACEFUL},
    protocol::{
      control::{
        request_tag, ControlMessage, ACK_STREAM_TAG, REQUEST_FRAME_STREAM_TAG,
        REQUEST_RAW_STREAM_TAG,
      },
      message::DATA_MESSAGE_TAG,
      router::HookResult,
    },
    transport::{
      duplex, BoxedReader, DuplexTransport, Link, TransportConnection, TransportError,
      TransportSide,
    },
  },
  util::framed::{self, Frame},
  ClientConnection, CloseReason, Connection, ConnectionConfig, ConnectionError, ConnectionEvent,
  ConnectionState, DataMessage, FrameRequest, FrameRouter, Message, MessageProtocol, RawRequest,
  RawRouter, ServerConnection, StreamFailurePolicy, StreamKind,
};
use futures::{future::BoxFuture, FutureExt};
use tokio::{
  sync::{broadcast, Semaphore},
  task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

async fn within<F: Future>(future: F) -> F::Output {
  tokio::time::timeout(Duration::from_secs(5), future)
    .await
    .expect("Test may be failing due to an await deadlock")
}

async fn next_event<F>(events: &mut broadcast::Receiver<ConnectionEvent>, mut wanted: F) -> ConnectionEvent
where
  F: FnMut(&ConnectionEvent) -> bool,
{
  within(async {
    loop {
      let event = events.recv().await.expect("event channel closed");
      if wanted(&event) {
        return event;
      }
    }
  })
  .await
}

struct RawEcho;

impl RawRouter for RawEcho {
  fn handle<'a>(&'a self, request: &'a RawRequest) -> BoxFuture<'a, HookResult> {
    async move {
      request.stream().write_all(request.data()).await?;
      Ok(())
    }
    .boxed()
  }
}

struct FrameEcho;

impl FrameRouter for FrameEcho {
  fn handle<'a>(&'a self, request: &'a FrameRequest) -> BoxFuture<'a, HookResult> {
    async move {
      request.stream().write_msg(request.message()).await?;
      Ok(())
    }
    .boxed()
  }
}

fn echo_protocol() -> Arc<MessageProtocol> {
  Arc::new(MessageProtocol::basic().with_route(DATA_MESSAGE_TAG, Arc::new(FrameEcho)))
}

type ServeHandle = JoinHandle<Result<CloseReason, ConnectionError>>;

fn spawn_server(
  listener: Arc<dyn TransportConnection>,
  config: ConnectionConfig,
  raw_routers: Vec<Arc<dyn RawRouter>>,
) -> (Arc<Connection>, CancellationToken, ServeHandle) {
  let connection = Connection::new(
    ConnectionId::new(1),
    listener,
    TransportSide::Listen,
    config,
    echo_protocol(),
    raw_routers,
  );
  let cancel = CancellationToken::new();
  let server = ServerConnection::new(connection.clone());
  let serve = tokio::spawn({
    let cancel = cancel.clone();
    async move { server.serve(cancel).await }
  });
  (connection, cancel, serve)
}

async fn client_over(connector: Arc<DuplexTransport>, config: ConnectionConfig) -> ClientConnection {
  let connection = Connection::new(
    ConnectionId::new(2),
    connector,
    TransportSide::Connect,
    config,
    echo_protocol(),
    Vec::new(),
  );
  within(ClientConnection::establish(connection)).await.unwrap()
}

struct Harness {
  listener: Arc<DuplexTransport>,
  connector: Arc<DuplexTransport>,
  server: Arc<Connection>,
  cancel: CancellationToken,
  serve: ServeHandle,
  client: ClientConnection,
}

async fn harness(config: ConnectionConfig) -> Harness {
  let (listener, connector) = duplex::pair();
  let (listener, connector) = (Arc::new(listener), Arc::new(connector));
  let echo: Arc<dyn RawRouter> = Arc::new(RawEcho);
  let (server, cancel, serve) = spawn_server(listener.clone(), config.clone(), vec![echo]);
  let client = client_over(connector.clone(), config).await;
  Harness {
    listener,
    connector,
    server,
    cancel,
    serve,
    client,
  }
}

async fn send_frame(writer: &mut dollop::common::transport::BoxedWriter, frame: Frame) {
  framed::write_frame(writer, &frame).await.unwrap();
}

/// Reads the next stream request off a raw control link and answers it with an acknowledged link
async fn answer_request(
  listener: &DuplexTransport,
  control_reader: &mut BoxedReader,
  kind: StreamKind,
) -> Link {
  let request = framed::read_frame(&mut *control_reader, None).await.unwrap();
  assert_eq!(request.tag(), request_tag(kind));
  let link = listener.open_link().await.unwrap();
  let (id, reader, mut writer) = link.into_parts();
  send_frame(&mut writer, ControlMessage::ack_for(kind).to_frame()).await;
  Link::new(id, reader, writer)
}

/// Holds every `open_link` until the gate is opened
struct GatedTransport {
  inner: Arc<DuplexTransport>,
  gate: Arc<Semaphore>,
}

impl GatedTransport {
  fn closed_gate(inner: Arc<DuplexTransport>) -> Self {
    Self {
      inner,
      gate: Arc::new(Semaphore::new(0)),
    }
  }

  fn open_gate(&self) {
    self.gate.add_permits(1);
  }
}

impl TransportConnection for GatedTransport {
  fn open_link(&self) -> BoxFuture<'static, Result<Link, TransportError>> {
    let gate = self.gate.clone();
    let inner = self.inner.clone();
    async move {
      let _permit = gate
        .acquire()
        .await
        .map_err(|_| TransportError::ConnectionClosed)?;
      inner.open_link().await
    }
    .boxed()
  }

  fn accept_link(&self) -> BoxFuture<'static, Result<Link, TransportError>> {
    self.inner.accept_link()
  }

  fn close_with_error(&self, code: u32, reason: &str) {
    self.inner.close_with_error(code, reason)
  }

  fn closed(&self) -> BoxFuture<'static, TransportError> {
    self.inner.closed()
  }
}

#[tokio::test]
async fn raw_streams_echo_through_routers() {
  let harness = harness(ConnectionConfig::default()).await;
  let stream = within(harness.client.open_raw_stream("hello")).await.unwrap();
  stream.write_all(b"ping").await.unwrap();
  let mut buffer = [0u8; 4];
  within(stream.read_exact(&mut buffer)).await.unwrap();
  assert_eq!(&buffer, b"ping");
  assert_eq!(harness.client.connection().raw_stream_count(), 1);
  assert_eq!(
    harness.server.raw_stream(stream.id()).unwrap().id(),
    stream.id()
  );
  assert_eq!(harness.server.state(), ConnectionState::Serving);
}

#[tokio::test]
async fn frame_streams_echo_through_the_bound_protocol() {
  let harness = harness(ConnectionConfig::default()).await;
  let stream = within(harness.client.open_frame_stream(Bytes::new()))
    .await
    .unwrap();
  for text in ["first", "second"] {
    stream.write_msg(&DataMessage::new(text)).await.unwrap();
    let echoed = within(stream.read_msg()).await.unwrap();
    assert_eq!(echoed.data().as_ref(), text.as_bytes());
  }
  assert!(harness.server.frame_stream(stream.id()).is_ok());
}

#[tokio::test]
async fn acknowledgement_for_another_kind_is_refused() {
  let (listener, connector) = duplex::pair();
  let (listener, connector) = (Arc::new(listener), Arc::new(connector));
  let client = client_over(connector.clone(), ConnectionConfig::default()).await;
  let control = within(listener.accept_link()).await.unwrap();
  let (_, mut control_reader, _control_writer) = control.into_parts();

  let responder = tokio::spawn({
    let listener = listener.clone();
    async move {
      let request = framed::read_frame(&mut control_reader, None).await.unwrap();
      assert_eq!(request.tag(), REQUEST_RAW_STREAM_TAG);
      let link = listener.open_link().await.unwrap();
      let id = link.id();
      let (_, reader, mut writer) = link.into_parts();
      let wrong = ControlMessage::ack_for(StreamKind::Frame).to_frame();
      send_frame(&mut writer, wrong).await;
      (id, reader, writer, control_reader)
    }
  });

  let result = within(client.open_raw_stream("raw please")).await;
  let (id, _reader, _writer, _control_reader) = responder.await.unwrap();
  assert!(matches!(
    result,
    Err(ConnectionError::AckMismatch {
      kind: StreamKind::Raw,
      id: mismatched,
      received: ACK_STREAM_TAG,
    }) if mismatched == id
  ));
  assert_eq!(client.connection().raw_stream_count(), 0);
  assert!(connector.shutdown_links().contains(&id));
  assert_eq!(client.connection().state(), ConnectionState::Serving);
}

#[tokio::test]
async fn unanswered_requests_time_out() {
  let (listener, connector) = duplex::pair();
  let (listener, connector) = (Arc::new(listener), Arc::new(connector));
  let config = ConnectionConfig {
    open_timeout: Duration::from_millis(100),
    ..ConnectionConfig::default()
  };
  let client = client_over(connector, config).await;
  let control = within(listener.accept_link()).await.unwrap();
  let (_, mut control_reader, _control_writer) = control.into_parts();

  let result = within(client.open_frame_stream("anyone?")).await;
  assert!(matches!(
    result,
    Err(ConnectionError::OpenTimedOut(StreamKind::Frame))
  ));
  let request = within(framed::read_frame(&mut control_reader, None))
    .await
    .unwrap();
  assert_eq!(request.tag(), REQUEST_FRAME_STREAM_TAG);
  assert_eq!(request.payload().as_ref(), b"anyone?");
  assert_eq!(client.connection().frame_stream_count(), 0);
}

#[tokio::test]
async fn late_answers_to_timed_out_requests_are_discarded() {
  let (listener, connector) = duplex::pair();
  let (listener, connector) = (Arc::new(listener), Arc::new(connector));
  let config = ConnectionConfig {
    open_timeout: Duration::from_millis(100),
    ..ConnectionConfig::default()
  };
  let client = client_over(connector.clone(), config).await;
  let control = within(listener.accept_link()).await.unwrap();
  let (_, mut control_reader, _control_writer) = control.into_parts();

  let result = within(client.open_raw_stream("too slow")).await;
  assert!(matches!(
    result,
    Err(ConnectionError::OpenTimedOut(StreamKind::Raw))
  ));
  let late = within(answer_request(&listener, &mut control_reader, StreamKind::Raw)).await;

  // A frame stream opened next must not be handed the late raw link
  let responder = tokio::spawn({
    let listener = listener.clone();
    async move {
      let link = answer_request(&listener, &mut control_reader, StreamKind::Frame).await;
      (link, control_reader)
    }
  });
  let frames = within(client.open_frame_stream("fresh")).await.unwrap();
  let (answered, mut control_reader) = responder.await.unwrap();
  assert_eq!(frames.id(), answered.id());
  assert!(connector.shutdown_links().contains(&late.id()));
  assert_eq!(client.connection().raw_stream_count(), 0);
  assert_eq!(client.connection().frame_stream_count(), 1);

  // Same for a late answer of the kind being requested
  let result = within(client.open_raw_stream("too slow again")).await;
  assert!(matches!(
    result,
    Err(ConnectionError::OpenTimedOut(StreamKind::Raw))
  ));
  let late = within(answer_request(&listener, &mut control_reader, StreamKind::Raw)).await;
  let responder = tokio::spawn({
    let listener = listener.clone();
    async move {
      let link = answer_request(&listener, &mut control_reader, StreamKind::Raw).await;
      (link, control_reader)
    }
  });
  let raw = within(client.open_raw_stream("fresh")).await.unwrap();
  let (answered, _control_reader) = responder.await.unwrap();
  assert_eq!(raw.id(), answered.id());
  assert_ne!(raw.id(), late.id());
  assert!(connector.shutdown_links().contains(&late.id()));
  assert_eq!(client.connection().raw_stream_count(), 1);
}

#[tokio::test]
async fn rejections_fail_the_pending_open() {
  let (listener, connector) = duplex::pair();
  let (listener, connector) = (Arc::new(listener), Arc::new(connector));
  let client = client_over(connector, ConnectionConfig::default()).await;
  let control = within(listener.accept_link()).await.unwrap();
  let (_, mut control_reader, mut control_writer) = control.into_parts();

  let responder = tokio::spawn(async move {
    let request = framed::read_frame(&mut control_reader, None).await.unwrap();
    assert_eq!(request.tag(), REQUEST_RAW_STREAM_TAG);
    send_frame(
      &mut control_writer,
      ControlMessage::reject_for(StreamKind::Raw).to_frame(),
    )
    .await;
    (control_reader, control_writer)
  });

  let result = within(client.open_raw_stream(Bytes::new())).await;
  let _control = responder.await.unwrap();
  assert!(matches!(
    result,
    Err(ConnectionError::Rejected(StreamKind::Raw))
  ));
  assert_eq!(client.connection().raw_stream_count(), 0);
}

#[tokio::test]
async fn queued_requests_are_all_served() {
  const REQUESTS: usize = 15;
  let (listener, connector) = duplex::pair();
  let (listener, connector) = (Arc::new(listener), Arc::new(connector));
  let config = ConnectionConfig {
    request_queue_capacity: 2,
    ..ConnectionConfig::default()
  };
  let (server, _cancel, _serve) = spawn_server(listener, config, Vec::new());

  let control = connector.open_link().await.unwrap();
  let (_, _control_reader, mut control_writer) = control.into_parts();
  for index in 0..REQUESTS {
    let request = ControlMessage::request_for(StreamKind::Raw, format!("{}", index));
    send_frame(&mut control_writer, request.to_frame()).await;
  }

  let mut links: Vec<Link> = Vec::with_capacity(REQUESTS);
  for _ in 0..REQUESTS {
    let link = within(connector.accept_link()).await.unwrap();
    let (id, mut reader, writer) = link.into_parts();
    let ack = within(framed::read_frame(&mut reader, None)).await.unwrap();
    assert_eq!(ack.tag(), ACK_STREAM_TAG);
    assert_eq!(ack.payload().as_ref(), &[REQUEST_RAW_STREAM_TAG]);
    links.push(Link::new(id, reader, writer));
  }
  within(async {
    while server.raw_stream_count() < REQUESTS {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await;
  let mut ids = links.iter().map(Link::id).collect::<Vec<_>>();
  ids.sort();
  ids.dedup();
  assert_eq!(ids.len(), REQUESTS);
}

#[tokio::test]
async fn full_request_queues_stop_the_control_reader() {
  const REQUESTS: usize = 12;
  const CAPACITY: usize = 2;
  // One empty request frame fills a link buffer
  const REQUEST_FRAME_LENGTH: usize = 5;
  let duplex::EntangledTransports {
    listener,
    connector,
  } = duplex::channel_with_buffer(REQUEST_FRAME_LENGTH);
  let connector = Arc::new(connector);
  let gated = Arc::new(GatedTransport::closed_gate(Arc::new(listener)));
  let config = ConnectionConfig {
    request_queue_capacity: CAPACITY,
    ..ConnectionConfig::default()
  };
  let (server, _cancel, _serve) = spawn_server(gated.clone(), config, Vec::new());

  let control = connector.open_link().await.unwrap();
  let (_, _control_reader, mut control_writer) = control.into_parts();
  let written = Arc::new(AtomicUsize::new(0));
  let writer = tokio::spawn({
    let written = written.clone();
    async move {
      for _ in 0..REQUESTS {
        let request = ControlMessage::request_for(StreamKind::Raw, Bytes::new());
        send_frame(&mut control_writer, request.to_frame()).await;
        written.fetch_add(1, Ordering::SeqCst);
      }
      control_writer
    }
  });

  tokio::time::sleep(Duration::from_millis(200)).await;
  // The servicer holds one request, the queue holds CAPACITY, the control
  // reader holds one it cannot enqueue, and one more sits in the link buffer
  let stalled = written.load(Ordering::SeqCst);
  assert!(stalled <= CAPACITY + 3, "{} requests were written", stalled);
  assert!(!writer.is_finished());
  assert_eq!(server.raw_stream_count(), 0);

  gated.open_gate();
  for _ in 0..REQUESTS {
    let link = within(connector.accept_link()).await.unwrap();
    let (_, mut reader, _writer) = link.into_parts();
    let ack = within(framed::read_frame(&mut reader, None)).await.unwrap();
    assert_eq!(ack.tag(), ACK_STREAM_TAG);
  }
  let _control_writer = within(writer).await.unwrap();
  assert_eq!(written.load(Ordering::SeqCst), REQUESTS);
  within(async {
    while server.raw_stream_count() < REQUESTS {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await;
}

#[tokio::test]
async fn unknown_tags_are_reported_and_reading_continues() {
  let harness = harness(ConnectionConfig::default()).await;
  let mut events = harness.server.subscribe();
  let stream = within(harness.client.open_frame_stream(Bytes::new()))
    .await
    .unwrap();
  stream.write_frame(&Frame::new(0x09, "who knows")).await.unwrap();
  let violation = next_event(&mut events, |event| {
    matches!(event, ConnectionEvent::ProtocolViolation { .. })
  })
  .await;
  assert!(matches!(
    violation,
    ConnectionEvent::ProtocolViolation { stream: id, tag: Some(0x09), .. } if id == stream.id()
  ));

  stream.write_msg(&DataMessage::new("still here")).await.unwrap();
  let echoed = within(stream.read_msg()).await.unwrap();
  assert_eq!(echoed.data().as_ref(), b"still here");
  assert!(harness.server.frame_stream(stream.id()).is_ok());
}

#[tokio::test]
async fn closing_cascades_to_every_stream() {
  let harness = harness(ConnectionConfig::default()).await;
  let control_id = harness.client.connection().control_stream().unwrap().id();
  let raw = within(harness.client.open_raw_stream(Bytes::new())).await.unwrap();
  let frame = within(harness.client.open_frame_stream(Bytes::new()))
    .await
    .unwrap();

  assert!(within(harness.client.close()).await);
  assert!(!harness.client.close().await);
  let closed = harness.connector.shutdown_links();
  assert_eq!(closed.first(), Some(&control_id));
  assert!(closed.contains(&raw.id()));
  assert!(closed.contains(&frame.id()));
  assert!(raw.is_closed() && frame.is_closed());
  assert!(matches!(
    raw.write_all(b"late").await,
    Err(dollop::common::stream::StreamError::Closed(_))
  ));
  let client = harness.client.connection();
  assert_eq!(client.raw_stream_count() + client.frame_stream_count(), 0);
  assert_eq!(client.state(), ConnectionState::Closed);
  assert_eq!(harness.connector.close_count(), 1);
  assert_eq!(
    harness.connector.close_record().map(|(code, _)| code),
    Some(CLOSE_CODE_GRACEFUL)
  );

  let reason = within(harness.serve).await.unwrap().unwrap();
  assert!(matches!(
    reason,
    CloseReason::RemoteClosed | CloseReason::Transport(_)
  ));
  assert_eq!(harness.server.state(), ConnectionState::Closed);
  assert_eq!(
    harness.server.raw_stream_count() + harness.server.frame_stream_count(),
    0
  );
  assert!(matches!(
    harness.client.open_raw_stream(Bytes::new()).await,
    Err(ConnectionError::Closed)
  ));
}

#[tokio::test]
async fn finished_streams_are_retired_alone_by_default() {
  let harness = harness(ConnectionConfig::default()).await;
  let mut events = harness.server.subscribe();
  let stream = within(harness.client.open_raw_stream(Bytes::new())).await.unwrap();
  let id = stream.id();
  within(harness.client.close_raw_stream(id)).await.unwrap();
  assert!(stream.is_closed());
  assert!(matches!(
    harness.client.connection().raw_stream(id),
    Err(ConnectionError::StreamNotFound {
      kind: StreamKind::Raw,
      ..
    })
  ));
  assert!(matches!(
    harness.client.close_raw_stream(id).await,
    Err(ConnectionError::StreamNotFound { .. })
  ));

  next_event(&mut events, |event| {
    matches!(event, ConnectionEvent::StreamClosed { kind: StreamKind::Raw, id: closed } if *closed == id)
  })
  .await;
  assert!(harness.server.raw_stream(id).is_err());
  assert_eq!(harness.server.state(), ConnectionState::Serving);
  assert!(!harness.listener.is_closed());

  let another = within(harness.client.open_raw_stream(Bytes::new())).await.unwrap();
  another.write_all(b"ok").await.unwrap();
  let mut buffer = [0u8; 2];
  within(another.read_exact(&mut buffer)).await.unwrap();
  assert_eq!(&buffer, b"ok");
}

#[tokio::test]
async fn finished_streams_close_the_connection_when_configured() {
  let config = ConnectionConfig {
    stream_failure_policy: StreamFailurePolicy::CloseConnection,
    ..ConnectionConfig::default()
  };
  let harness = harness(config).await;
  let stream = within(harness.client.open_raw_stream(Bytes::new())).await.unwrap();
  let id = stream.id();
  stream.close().await.unwrap();

  let reason = within(harness.serve).await.unwrap().unwrap();
  assert_eq!(
    reason,
    CloseReason::StreamFailed {
      kind: StreamKind::Raw,
      id
    }
  );
  assert_eq!(
    harness.listener.close_record().map(|(code, _)| code),
    Some(CLOSE_CODE_ERROR)
  );
  let mut state = harness.client.connection().watch_state();
  within(async {
    while *state.borrow_and_update() != ConnectionState::Closed {
      state.changed().await.unwrap();
    }
  })
  .await;
}

#[tokio::test]
async fn corrupt_control_streams_close_the_connection() {
  let (listener, connector) = duplex::pair();
  let (listener, connector) = (Arc::new(listener), Arc::new(connector));
  let (server, _cancel, serve) = spawn_server(listener.clone(), ConnectionConfig::default(), Vec::new());
  let control = connector.open_link().await.unwrap();
  let (_, _control_reader, mut control_writer) = control.into_parts();
  tokio::io::AsyncWriteExt::write_all(&mut control_writer, &[0, 0, 0, 0])
    .await
    .unwrap();

  let reason = within(serve).await.unwrap().unwrap();
  assert!(matches!(reason, CloseReason::ControlStreamLost(_)));
  assert_eq!(server.close_reason(), Some(reason));
  assert_eq!(
    listener.close_record().map(|(code, _)| code),
    Some(CLOSE_CODE_ERROR)
  );
  assert_eq!(listener.close_count(), 1);
}

#[tokio::test]
async fn truncated_control_frames_close_the_connection() {
  let (listener, connector) = duplex::pair();
  let (listener, connector) = (Arc::new(listener), Arc::new(connector));
  let (_server, _cancel, serve) = spawn_server(listener.clone(), ConnectionConfig::default(), Vec::new());
  let control = connector.open_link().await.unwrap();
  let (_, _control_reader, mut control_writer) = control.into_parts();
  tokio::io::AsyncWriteExt::write_all(&mut control_writer, &[0, 0])
    .await
    .unwrap();
  tokio::io::AsyncWriteExt::shutdown(&mut control_writer)
    .await
    .unwrap();

  let reason = within(serve).await.unwrap().unwrap();
  assert!(matches!(reason, CloseReason::ControlStreamLost(_)));
  assert_eq!(
    listener.close_record().map(|(code, _)| code),
    Some(CLOSE_CODE_ERROR)
  );
}

#[tokio::test]
async fn stray_control_messages_are_violations() {
  let (listener, connector) = duplex::pair();
  let (listener, connector) = (Arc::new(listener), Arc::new(connector));
  let (server, _cancel, _serve) = spawn_server(listener, ConnectionConfig::default(), Vec::new());
  let mut events = server.subscribe();
  let control = connector.open_link().await.unwrap();
  let (_, _control_reader, mut control_writer) = control.into_parts();

  send_frame(
    &mut control_writer,
    ControlMessage::ack_for(StreamKind::Raw).to_frame(),
  )
  .await;
  let violation = next_event(&mut events, |event| {
    matches!(event, ConnectionEvent::ProtocolViolation { .. })
  })
  .await;
  assert!(matches!(
    violation,
    ConnectionEvent::ProtocolViolation {
      tag: Some(ACK_STREAM_TAG),
      ..
    }
  ));

  send_frame(
    &mut control_writer,
    ControlMessage::request_for(StreamKind::Frame, Bytes::new()).to_frame(),
  )
  .await;
  let link = within(connector.accept_link()).await.unwrap();
  let (_, mut reader, _writer) = link.into_parts();
  let ack = within(framed::read_frame(&mut reader, None)).await.unwrap();
  assert_eq!(ack.tag(), ACK_STREAM_TAG);
  assert_eq!(server.state(), ConnectionState::Serving);
}

#[tokio::test]
async fn cancelling_serve_closes_gracefully() {
  let harness = harness(ConnectionConfig::default()).await;
  harness.cancel.cancel();
  let reason = within(harness.serve).await.unwrap().unwrap();
  assert_eq!(reason, CloseReason::Cancelled);
  assert_eq!(
    harness.listener.close_record().map(|(code, _)| code),
    Some(CLOSE_CODE_GRACEFUL)
  );
  within(harness.client.connection().closed()).await;
  assert!(matches!(
    harness.client.connection().close_reason(),
    Some(CloseReason::RemoteClosed | CloseReason::Transport(_))
  ));
}
