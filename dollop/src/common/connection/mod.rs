// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Per-connection state: the control stream, the sub-stream tables, and teardown
//!
//! A [`Connection`] is shared by every task working on it. The side-specific
//! behaviour lives in [`ServerConnection`] (answers stream requests and
//! dispatches inbound data) and [`ClientConnection`] (requests streams).

use std::{
  fmt::Display,
  future::Future,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
  },
  time::Duration,
};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::common::{
  protocol::{
    control::{control_protocol, ControlMessage, ControlStream},
    message::{DataMessage, Message, MessageError, MessageProtocol, MessageTag},
    router::{DispatchReport, Hook, RawRouter},
  },
  stream::{FrameStream, RawStream, StreamError, StreamId, StreamKind},
  transport::{TransportConnection, TransportError, TransportSide},
};

pub mod client;
pub mod id;
pub mod server;

pub use self::{
  client::ClientConnection,
  id::{ConnectionId, ConnectionIds},
  server::ServerConnection,
};
pub use crate::common::config::{ConnectionConfig, StreamFailurePolicy};

/// Application close code for orderly shutdowns
pub const CLOSE_CODE_GRACEFUL: u32 = 0;
/// Application close code for shutdowns caused by a failure
pub const CLOSE_CODE_ERROR: u32 = 701;

const EVENT_CHANNEL_CAPACITY: usize = 32;
const STREAM_CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
  AwaitingControlStream,
  ControlStreamBound,
  Serving,
  Closing,
  Closed,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
  #[error("Connection closed locally")]
  Local,
  #[error("Connection cancelled by its owner")]
  Cancelled,
  #[error("Peer finished the control stream")]
  RemoteClosed,
  #[error("Control stream lost: {0}")]
  ControlStreamLost(String),
  #[error("{kind:?} stream {id} failed")]
  StreamFailed { kind: StreamKind, id: StreamId },
  #[error("Transport closed: {0}")]
  Transport(TransportError),
}

impl CloseReason {
  pub fn code(&self) -> u32 {
    match self {
      CloseReason::Local | CloseReason::Cancelled | CloseReason::RemoteClosed => CLOSE_CODE_GRACEFUL,
      _ => CLOSE_CODE_ERROR,
    }
  }
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
  StateChanged(ConnectionState),
  StreamOpened {
    kind: StreamKind,
    id: StreamId,
  },
  StreamClosed {
    kind: StreamKind,
    id: StreamId,
  },
  ProtocolViolation {
    stream: StreamId,
    tag: Option<MessageTag>,
    detail: String,
  },
  DispatchFailed {
    kind: StreamKind,
    stream: StreamId,
    router: String,
    hook: Hook,
    error: String,
  },
  Closed(CloseReason),
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
  #[error("No {kind:?} stream registered with id {id}")]
  StreamNotFound { kind: StreamKind, id: StreamId },
  #[error("A {kind:?} stream is already registered with id {id}")]
  DuplicateStream { kind: StreamKind, id: StreamId },
  #[error("Expected an acknowledgement opening {kind:?} stream {id}, received tag {received:#04x}")]
  AckMismatch {
    kind: StreamKind,
    id: StreamId,
    received: MessageTag,
  },
  #[error("Peer rejected the {0:?} stream request")]
  Rejected(StreamKind),
  #[error("Control stream lost: {0}")]
  ControlStreamLost(#[source] MessageError),
  #[error("Control stream has not been bound")]
  ControlStreamNotBound,
  #[error("Control stream is already bound")]
  ControlStreamAlreadyBound,
  #[error("Timed out opening a {0:?} stream")]
  OpenTimedOut(StreamKind),
  #[error("Transport failure: {0}")]
  Transport(#[from] TransportError),
  #[error(transparent)]
  Message(#[from] MessageError),
  #[error(transparent)]
  Stream(#[from] StreamError),
  #[error("Connection is closed")]
  Closed,
}

pub struct Connection<M: Message = DataMessage> {
  id: ConnectionId,
  side: TransportSide,
  transport: Arc<dyn TransportConnection>,
  config: ConnectionConfig,
  control_protocol: Arc<MessageProtocol<ControlMessage>>,
  frame_protocol: Arc<MessageProtocol<M>>,
  raw_routers: Vec<Arc<dyn RawRouter<M>>>,
  control_stream: OnceLock<Arc<ControlStream>>,
  raw_streams: DashMap<StreamId, Arc<RawStream<M>>>,
  frame_streams: DashMap<StreamId, Arc<FrameStream<M>>>,
  state: watch::Sender<ConnectionState>,
  events: broadcast::Sender<ConnectionEvent>,
  closing: AtomicBool,
  close_reason: OnceLock<CloseReason>,
  shutdown: CancellationToken,
}

impl<M: Message> Connection<M> {
  pub fn new(
    id: ConnectionId,
    transport: Arc<dyn TransportConnection>,
    side: TransportSide,
    config: ConnectionConfig,
    frame_protocol: Arc<MessageProtocol<M>>,
    raw_routers: Vec<Arc<dyn RawRouter<M>>>,
  ) -> Arc<Self> {
    Arc::new(Self {
      id,
      side,
      transport,
      config,
      control_protocol: Arc::new(control_protocol()),
      frame_protocol,
      raw_routers,
      control_stream: OnceLock::new(),
      raw_streams: DashMap::new(),
      frame_streams: DashMap::new(),
      state: watch::channel(ConnectionState::AwaitingControlStream).0,
      events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
      closing: AtomicBool::new(false),
      close_reason: OnceLock::new(),
      shutdown: CancellationToken::new(),
    })
  }

  pub fn id(&self) -> ConnectionId {
    self.id
  }

  pub fn side(&self) -> TransportSide {
    self.side
  }

  pub fn config(&self) -> &ConnectionConfig {
    &self.config
  }

  pub fn transport(&self) -> &Arc<dyn TransportConnection> {
    &self.transport
  }

  pub fn control_protocol(&self) -> &Arc<MessageProtocol<ControlMessage>> {
    &self.control_protocol
  }

  /// Protocol bound to every frame stream of this connection
  pub fn frame_protocol(&self) -> &Arc<MessageProtocol<M>> {
    &self.frame_protocol
  }

  /// Routers bound to every raw stream this connection accepts
  pub fn raw_routers(&self) -> &[Arc<dyn RawRouter<M>>] {
    &self.raw_routers
  }

  pub fn state(&self) -> ConnectionState {
    *self.state.borrow()
  }

  pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
    self.state.subscribe()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
    self.events.subscribe()
  }

  pub fn control_stream(&self) -> Result<Arc<ControlStream>, ConnectionError> {
    self
      .control_stream
      .get()
      .cloned()
      .ok_or(ConnectionError::ControlStreamNotBound)
  }

  pub(crate) fn bind_control_stream(&self, stream: Arc<ControlStream>) -> Result<(), ConnectionError> {
    if self.is_closing() {
      return Err(ConnectionError::Closed);
    }
    self
      .control_stream
      .set(stream)
      .map_err(|_| ConnectionError::ControlStreamAlreadyBound)?;
    self.set_state(ConnectionState::ControlStreamBound);
    Ok(())
  }

  pub fn add_raw_stream(&self, stream: Arc<RawStream<M>>) -> Result<(), ConnectionError> {
    let id = stream.id();
    register(&self.raw_streams, StreamKind::Raw, id, stream, &self.closing)?;
    self.emit(ConnectionEvent::StreamOpened {
      kind: StreamKind::Raw,
      id,
    });
    Ok(())
  }

  pub fn add_frame_stream(&self, stream: Arc<FrameStream<M>>) -> Result<(), ConnectionError> {
    let id = stream.id();
    register(&self.frame_streams, StreamKind::Frame, id, stream, &self.closing)?;
    self.emit(ConnectionEvent::StreamOpened {
      kind: StreamKind::Frame,
      id,
    });
    Ok(())
  }

  pub fn raw_stream(&self, id: StreamId) -> Result<Arc<RawStream<M>>, ConnectionError> {
    self
      .raw_streams
      .get(&id)
      .map(|entry| entry.value().clone())
      .ok_or(ConnectionError::StreamNotFound {
        kind: StreamKind::Raw,
        id,
      })
  }

  pub fn frame_stream(&self, id: StreamId) -> Result<Arc<FrameStream<M>>, ConnectionError> {
    self
      .frame_streams
      .get(&id)
      .map(|entry| entry.value().clone())
      .ok_or(ConnectionError::StreamNotFound {
        kind: StreamKind::Frame,
        id,
      })
  }

  /// Unregisters a raw stream without closing it
  pub fn delete_raw_stream(&self, id: StreamId) -> Option<Arc<RawStream<M>>> {
    self.raw_streams.remove(&id).map(|(_, stream)| stream)
  }

  /// Unregisters a frame stream without closing it
  pub fn delete_frame_stream(&self, id: StreamId) -> Option<Arc<FrameStream<M>>> {
    self.frame_streams.remove(&id).map(|(_, stream)| stream)
  }

  /// Unregisters a raw stream and finishes its write half
  pub async fn close_raw_stream(&self, id: StreamId) -> Result<(), ConnectionError> {
    let stream = self
      .delete_raw_stream(id)
      .ok_or(ConnectionError::StreamNotFound {
        kind: StreamKind::Raw,
        id,
      })?;
    self.finish_stream(Some(StreamKind::Raw), id, stream.close()).await;
    Ok(())
  }

  /// Unregisters a frame stream and finishes its write half
  pub async fn close_frame_stream(&self, id: StreamId) -> Result<(), ConnectionError> {
    let stream = self
      .delete_frame_stream(id)
      .ok_or(ConnectionError::StreamNotFound {
        kind: StreamKind::Frame,
        id,
      })?;
    self.finish_stream(Some(StreamKind::Frame), id, stream.close()).await;
    Ok(())
  }

  pub fn raw_stream_count(&self) -> usize {
    self.raw_streams.len()
  }

  pub fn frame_stream_count(&self) -> usize {
    self.frame_streams.len()
  }

  pub fn is_closing(&self) -> bool {
    self.closing.load(Ordering::SeqCst)
  }

  /// The reason recorded by the first call to [`Connection::close`]
  pub fn close_reason(&self) -> Option<CloseReason> {
    self.close_reason.get().cloned()
  }

  /// Resolves once teardown has finished
  pub async fn closed(&self) {
    self.shutdown.cancelled().await
  }

  pub(crate) fn shutdown_token(&self) -> CancellationToken {
    self.shutdown.clone()
  }

  /// Closes the control stream, every raw stream, every frame stream, then the
  /// transport, in that order
  ///
  /// Only the first call does any work and returns `true`; concurrent and
  /// later callers return `false` immediately.
  pub async fn close(&self, reason: CloseReason) -> bool {
    if self.closing.swap(true, Ordering::SeqCst) {
      return false;
    }
    tracing::debug!(connection = %self.id, reason = %reason, "closing connection");
    let _ = self.close_reason.set(reason.clone());
    self.set_state(ConnectionState::Closing);

    if let Some(control) = self.control_stream.get() {
      self.finish_stream(None, control.id(), control.close()).await;
    }
    let raw_streams = self
      .raw_streams
      .iter()
      .map(|entry| entry.value().clone())
      .collect::<Vec<_>>();
    self.raw_streams.clear();
    futures::future::join_all(
      raw_streams
        .iter()
        .map(|stream| self.finish_stream(Some(StreamKind::Raw), stream.id(), stream.close())),
    )
    .await;
    let frame_streams = self
      .frame_streams
      .iter()
      .map(|entry| entry.value().clone())
      .collect::<Vec<_>>();
    self.frame_streams.clear();
    futures::future::join_all(
      frame_streams
        .iter()
        .map(|stream| self.finish_stream(Some(StreamKind::Frame), stream.id(), stream.close())),
    )
    .await;

    self
      .transport
      .close_with_error(reason.code(), &reason.to_string());
    self.shutdown.cancel();
    self.set_state(ConnectionState::Closed);
    self.emit(ConnectionEvent::Closed(reason));
    true
  }

  async fn finish_stream<F>(&self, kind: Option<StreamKind>, id: StreamId, close: F)
  where
    F: Future<Output = Result<(), StreamError>>,
  {
    match tokio::time::timeout(STREAM_CLOSE_GRACE, close).await {
      Ok(Ok(())) => {}
      Ok(Err(error)) => {
        tracing::trace!(stream_id = %id, error = %error, "stream close failed")
      }
      Err(_) => tracing::debug!(stream_id = %id, "stream close timed out"),
    }
    if let Some(kind) = kind {
      self.emit(ConnectionEvent::StreamClosed { kind, id });
    }
  }

  /// Applies the stream failure policy once a sub-stream's read loop ends
  pub(crate) async fn retire_stream(&self, kind: StreamKind, id: StreamId, failure: Option<StreamError>) {
    if self.is_closing() {
      return;
    }
    match &failure {
      None => tracing::debug!(stream_id = %id, kind = ?kind, "stream finished by peer"),
      Some(error) => tracing::warn!(stream_id = %id, kind = ?kind, error = %error, "stream read failed"),
    }
    match self.config.stream_failure_policy {
      StreamFailurePolicy::CloseStream => {
        let closed = match kind {
          StreamKind::Raw => self.close_raw_stream(id).await,
          StreamKind::Frame => self.close_frame_stream(id).await,
        };
        if let Err(error) = closed {
          tracing::trace!(stream_id = %id, error = %error, "stream was already unregistered");
        }
      }
      StreamFailurePolicy::CloseConnection => {
        self.close(CloseReason::StreamFailed { kind, id }).await;
      }
    }
  }

  pub(crate) fn set_state(&self, next: ConnectionState) {
    let changed = self.state.send_if_modified(|current| {
      // Teardown states are terminal for the lifecycle states before them
      if *current == next || (*current >= ConnectionState::Closing && next < *current) {
        false
      } else {
        *current = next;
        true
      }
    });
    if changed {
      tracing::trace!(connection = %self.id, state = ?next, "connection state changed");
      self.emit(ConnectionEvent::StateChanged(next));
    }
  }

  pub(crate) fn report_violation(&self, stream: StreamId, tag: Option<MessageTag>, detail: impl Display) {
    let detail = detail.to_string();
    tracing::warn!(
      connection = %self.id,
      stream_id = %stream,
      tag = ?tag,
      detail = %detail,
      "protocol violation"
    );
    self.emit(ConnectionEvent::ProtocolViolation {
      stream,
      tag,
      detail,
    });
  }

  pub(crate) fn report_dispatch(&self, kind: StreamKind, stream: StreamId, report: &DispatchReport) {
    for failure in report.failures() {
      self.emit(ConnectionEvent::DispatchFailed {
        kind,
        stream,
        router: failure.router.clone(),
        hook: failure.hook,
        error: failure.error.to_string(),
      });
    }
  }

  fn emit(&self, event: ConnectionEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }
}

fn register<S>(
  table: &DashMap<StreamId, Arc<S>>,
  kind: StreamKind,
  id: StreamId,
  stream: Arc<S>,
  closing: &AtomicBool,
) -> Result<(), ConnectionError> {
  if closing.load(Ordering::SeqCst) {
    return Err(ConnectionError::Closed);
  }
  match table.entry(id) {
    Entry::Occupied(_) => return Err(ConnectionError::DuplicateStream { kind, id }),
    Entry::Vacant(entry) => {
      entry.insert(stream);
    }
  }
  // A close that began after the first check may already have swept the table
  if closing.load(Ordering::SeqCst) {
    table.remove(&id);
    return Err(ConnectionError::Closed);
  }
  Ok(())
}

impl<M: Message> std::fmt::Debug for Connection<M> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection")
      .field("id", &self.id)
      .field("side", &self.side)
      .field("state", &self.state())
      .field("raw_streams", &self.raw_streams.len())
      .field("frame_streams", &self.frame_streams.len())
      .finish_non_exhaustive()
  }
}
