// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Multi-stream transport connections carrying dollop sub-streams

use std::net::SocketAddr;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::stream::StreamId;

pub mod duplex;
pub mod quinn_transport;

pub use self::{duplex::DuplexTransport, quinn_transport::QuinnTransport};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One bidirectional stream of a transport connection
pub struct Link {
  id: StreamId,
  reader: BoxedReader,
  writer: BoxedWriter,
}

impl Link {
  pub fn new(id: StreamId, reader: BoxedReader, writer: BoxedWriter) -> Self {
    Self { id, reader, writer }
  }

  pub fn id(&self) -> StreamId {
    self.id
  }

  pub fn into_parts(self) -> (StreamId, BoxedReader, BoxedWriter) {
    (self.id, self.reader, self.writer)
  }
}

impl std::fmt::Debug for Link {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Link").field("id", &self.id).finish_non_exhaustive()
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
  #[error("Connection closed")]
  ConnectionClosed,
  #[error("Connection closed by application")]
  ApplicationClosed,
  #[error("Connection timed out")]
  TimedOut,
  #[error("Transport error encountered")]
  TransportError,
  #[error("Connection closed locally")]
  LocallyClosed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransportSide {
  Connect,
  Listen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAddressInfo {
  Unidentified,
  Socket(SocketAddr),
}

impl std::fmt::Display for TransportAddressInfo {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Unidentified => f.write_str("Unidentified"),
      Self::Socket(socket_addr) => write!(f, "{}", socket_addr),
    }
  }
}

/// A connection able to open and accept bidirectional links
///
/// Futures are `'static` so callers may race them against cancellation
/// without borrowing the transport.
pub trait TransportConnection: Send + Sync + 'static {
  fn open_link(&self) -> BoxFuture<'static, Result<Link, TransportError>>;

  fn accept_link(&self) -> BoxFuture<'static, Result<Link, TransportError>>;

  /// Closes the whole connection with an application close code
  fn close_with_error(&self, code: u32, reason: &str);

  /// Resolves once the connection is closed, from either side
  fn closed(&self) -> BoxFuture<'static, TransportError>;

  fn remote_addr(&self) -> TransportAddressInfo {
    TransportAddressInfo::Unidentified
  }
}
