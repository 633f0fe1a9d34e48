// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![deny(unused_imports, dead_code)]

//! In-memory entangled transports
//!
//! Links opened by one side are accepted by the other, in open order. Each
//! side records which of its link write-halves were shut down and how often
//! it was asked to close, which makes teardown observable in tests.

use std::{
  pin::Pin,
  sync::{
    atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
    Arc, Mutex,
  },
  task::{Context, Poll},
};

use futures::{future::BoxFuture, ready, FutureExt};
use tokio::{
  io::AsyncWrite,
  sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tokio_util::sync::CancellationToken;

use crate::common::{
  stream::StreamId,
  transport::{Link, TransportConnection, TransportError, TransportSide},
};

const DEFAULT_LINK_BUFFER: usize = 8192;

type ShutdownLog = Arc<Mutex<Vec<StreamId>>>;

pub struct DuplexTransport {
  side: TransportSide,
  buffer_size: usize,
  next_id: Arc<AtomicI64>,
  channel_to_remote: Mutex<Option<UnboundedSender<Link>>>,
  incoming: Arc<tokio::sync::Mutex<UnboundedReceiver<Link>>>,
  local_shutdowns: ShutdownLog,
  remote_shutdowns: ShutdownLog,
  connection_closed: CancellationToken,
  closed_locally: Arc<AtomicBool>,
  close_calls: AtomicUsize,
  close_record: Mutex<Option<(u32, String)>>,
}

impl DuplexTransport {
  pub fn side(&self) -> TransportSide {
    self.side
  }

  /// Number of times `close_with_error` was invoked on this side
  pub fn close_count(&self) -> usize {
    self.close_calls.load(Ordering::SeqCst)
  }

  /// Code and reason of the first close issued by this side
  pub fn close_record(&self) -> Option<(u32, String)> {
    self.close_record.lock().ok().and_then(|record| record.clone())
  }

  /// Ids of links whose write half was shut down by this side, in order
  pub fn shutdown_links(&self) -> Vec<StreamId> {
    self
      .local_shutdowns
      .lock()
      .map(|log| log.clone())
      .unwrap_or_default()
  }

  pub fn is_closed(&self) -> bool {
    self.connection_closed.is_cancelled()
  }
}

impl TransportConnection for DuplexTransport {
  fn open_link(&self) -> BoxFuture<'static, Result<Link, TransportError>> {
    if self.connection_closed.is_cancelled() {
      return futures::future::ready(Err(self.closed_error())).boxed();
    }
    let id = StreamId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
    let (local, remote) = tokio::io::duplex(self.buffer_size);
    let (local_reader, local_writer) = tokio::io::split(local);
    let (remote_reader, remote_writer) = tokio::io::split(remote);
    let local_link = Link::new(
      id,
      Box::new(local_reader),
      Box::new(RecordingWriter::new(
        local_writer,
        id,
        self.local_shutdowns.clone(),
      )),
    );
    let remote_link = Link::new(
      id,
      Box::new(remote_reader),
      Box::new(RecordingWriter::new(
        remote_writer,
        id,
        self.remote_shutdowns.clone(),
      )),
    );
    let sent = match self.channel_to_remote.lock() {
      Ok(channel) => channel
        .as_ref()
        .map(|channel| channel.send(remote_link).is_ok())
        .unwrap_or(false),
      Err(_) => false,
    };
    let result = if sent {
      Ok(local_link)
    } else {
      Err(TransportError::ConnectionClosed)
    };
    futures::future::ready(result).boxed()
  }

  fn accept_link(&self) -> BoxFuture<'static, Result<Link, TransportError>> {
    let incoming = self.incoming.clone();
    let connection_closed = self.connection_closed.clone();
    let closed_error = self.closed_error_handle();
    async move {
      let mut incoming = incoming.lock().await;
      tokio::select! {
        _ = connection_closed.cancelled() => Err(closed_error.get()),
        link = incoming.recv() => link.ok_or(TransportError::ConnectionClosed),
      }
    }
    .boxed()
  }

  fn close_with_error(&self, code: u32, reason: &str) {
    self.close_calls.fetch_add(1, Ordering::SeqCst);
    if let Ok(mut record) = self.close_record.lock() {
      if record.is_none() {
        *record = Some((code, reason.to_string()));
      }
    }
    if !self.connection_closed.is_cancelled() {
      self.closed_locally.store(true, Ordering::SeqCst);
      self.connection_closed.cancel();
    }
    if let Ok(mut channel) = self.channel_to_remote.lock() {
      channel.take();
    }
  }

  fn closed(&self) -> BoxFuture<'static, TransportError> {
    let connection_closed = self.connection_closed.clone();
    let closed_error = self.closed_error_handle();
    async move {
      connection_closed.cancelled().await;
      closed_error.get()
    }
    .boxed()
  }
}

impl DuplexTransport {
  fn closed_error(&self) -> TransportError {
    self.closed_error_handle().get()
  }

  fn closed_error_handle(&self) -> ClosedError {
    ClosedError(self.closed_locally.clone())
  }
}

/// Resolves which side closed the shared connection at observation time
struct ClosedError(Arc<AtomicBool>);

impl ClosedError {
  fn get(&self) -> TransportError {
    if self.0.load(Ordering::SeqCst) {
      TransportError::LocallyClosed
    } else {
      TransportError::ApplicationClosed
    }
  }
}

pin_project_lite::pin_project! {
  struct RecordingWriter<W> {
    #[pin]
    inner: W,
    id: StreamId,
    log: ShutdownLog,
    recorded: bool,
  }
}

impl<W> RecordingWriter<W> {
  fn new(inner: W, id: StreamId, log: ShutdownLog) -> Self {
    Self {
      inner,
      id,
      log,
      recorded: false,
    }
  }
}

impl<W: AsyncWrite> AsyncWrite for RecordingWriter<W> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, std::io::Error>> {
    self.project().inner.poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
    let this = self.project();
    let result = ready!(this.inner.poll_shutdown(cx));
    if !*this.recorded {
      *this.recorded = true;
      if let Ok(mut log) = this.log.lock() {
        log.push(*this.id);
      }
    }
    Poll::Ready(result)
  }
}

/// Two entangled transports; links opened by either are accepted by the other
pub struct EntangledTransports {
  pub listener: DuplexTransport,
  pub connector: DuplexTransport,
}

impl From<EntangledTransports> for (DuplexTransport, DuplexTransport) {
  fn from(pair: EntangledTransports) -> Self {
    (pair.listener, pair.connector)
  }
}

pub fn channel() -> EntangledTransports {
  channel_with_buffer(DEFAULT_LINK_BUFFER)
}

/// Entangled pair as `(listener, connector)`
pub fn pair() -> (DuplexTransport, DuplexTransport) {
  channel().into()
}

/// Produces an entangled pair whose links buffer at most `buffer_size` bytes per direction
pub fn channel_with_buffer(buffer_size: usize) -> EntangledTransports {
  let (listener_up, connector_down) = mpsc::unbounded_channel::<Link>();
  let (connector_up, listener_down) = mpsc::unbounded_channel::<Link>();
  let next_id = Arc::new(AtomicI64::new(0));
  let connection_closed = CancellationToken::new();
  let listener_shutdowns = ShutdownLog::default();
  let connector_shutdowns = ShutdownLog::default();
  let listener_closed = Arc::new(AtomicBool::new(false));
  let connector_closed = Arc::new(AtomicBool::new(false));
  let make = |side, up, down, local: &ShutdownLog, remote: &ShutdownLog, closed: &Arc<AtomicBool>| {
    DuplexTransport {
      side,
      buffer_size,
      next_id: next_id.clone(),
      channel_to_remote: Mutex::new(Some(up)),
      incoming: Arc::new(tokio::sync::Mutex::new(down)),
      local_shutdowns: local.clone(),
      remote_shutdowns: remote.clone(),
      connection_closed: connection_closed.clone(),
      closed_locally: closed.clone(),
      close_calls: AtomicUsize::new(0),
      close_record: Mutex::new(None),
    }
  };
  EntangledTransports {
    listener: make(
      TransportSide::Listen,
      listener_up,
      listener_down,
      &listener_shutdowns,
      &connector_shutdowns,
      &listener_closed,
    ),
    connector: make(
      TransportSide::Connect,
      connector_up,
      connector_down,
      &connector_shutdowns,
      &listener_shutdowns,
      &connector_closed,
    ),
  }
}
