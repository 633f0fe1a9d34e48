// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![forbid(unused_imports, dead_code)]

use futures::{future::BoxFuture, FutureExt};

use crate::common::{
  stream::StreamId,
  transport::{Link, TransportAddressInfo, TransportConnection, TransportError, TransportSide},
};

pub struct QuinnTransport {
  connection: quinn::Connection,
  side: TransportSide,
  // Client endpoints are owned by their single connection
  endpoint: Option<quinn::Endpoint>,
}

impl QuinnTransport {
  pub fn new(connection: quinn::Connection, side: TransportSide) -> Self {
    Self {
      connection,
      side,
      endpoint: None,
    }
  }

  pub fn with_endpoint(
    connection: quinn::Connection,
    side: TransportSide,
    endpoint: quinn::Endpoint,
  ) -> Self {
    Self {
      connection,
      side,
      endpoint: Some(endpoint),
    }
  }

  pub fn side(&self) -> TransportSide {
    self.side
  }

  pub fn connection(&self) -> &quinn::Connection {
    &self.connection
  }
}

fn link_from_streams(send: quinn::SendStream, recv: quinn::RecvStream) -> Link {
  Link::new(send.id().into(), Box::new(recv), Box::new(send))
}

impl From<quinn::StreamId> for StreamId {
  fn from(id: quinn::StreamId) -> Self {
    StreamId::new(quinn::VarInt::from(id).into_inner() as i64)
  }
}

impl TransportConnection for QuinnTransport {
  fn open_link(&self) -> BoxFuture<'static, Result<Link, TransportError>> {
    let connection = self.connection.clone();
    async move {
      let (send, recv) = connection.open_bi().await?;
      Ok(link_from_streams(send, recv))
    }
    .boxed()
  }

  fn accept_link(&self) -> BoxFuture<'static, Result<Link, TransportError>> {
    let connection = self.connection.clone();
    async move {
      let (send, recv) = connection.accept_bi().await?;
      Ok(link_from_streams(send, recv))
    }
    .boxed()
  }

  fn close_with_error(&self, code: u32, reason: &str) {
    self
      .connection
      .close(quinn::VarInt::from_u32(code), reason.as_bytes());
    if let Some(endpoint) = &self.endpoint {
      endpoint.close(quinn::VarInt::from_u32(code), reason.as_bytes());
    }
  }

  fn closed(&self) -> BoxFuture<'static, TransportError> {
    let connection = self.connection.clone();
    async move { connection.closed().await.into() }.boxed()
  }

  fn remote_addr(&self) -> TransportAddressInfo {
    TransportAddressInfo::Socket(self.connection.remote_address())
  }
}

impl From<quinn::ConnectionError> for TransportError {
  fn from(connection_error: quinn::ConnectionError) -> Self {
    match connection_error {
      quinn::ConnectionError::VersionMismatch => Self::TransportError,
      quinn::ConnectionError::TransportError(_) => Self::TransportError,
      quinn::ConnectionError::ConnectionClosed(_) => Self::ConnectionClosed,
      quinn::ConnectionError::ApplicationClosed(_) => Self::ApplicationClosed,
      quinn::ConnectionError::Reset => Self::TransportError,
      quinn::ConnectionError::TimedOut => Self::TimedOut,
      quinn::ConnectionError::LocallyClosed => Self::LocallyClosed,
    }
  }
}
