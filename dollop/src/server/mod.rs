// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Types for building a dollop server and accepting, negotiating, and routing connections

use std::{
  net::SocketAddr,
  sync::Arc,
  time::Duration,
};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::{
  config::{ConfigError, ConnectionConfig, TransportSettings},
  connection::{
    CloseReason, Connection, ConnectionId, ConnectionIds, ServerConnection,
    CLOSE_CODE_GRACEFUL,
  },
  protocol::{
    message::{DataMessage, Message, MessageProtocol},
    router::RawRouter,
  },
  transport::{QuinnTransport, TransportSide},
};

const ENDPOINT_DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
  #[error("A server requires a TLS security configuration")]
  MissingSecurityConfig,
  #[error("Server has been stopped")]
  Stopped,
  #[error("Failed binding the server endpoint: {0}")]
  Bind(#[source] std::io::Error),
  #[error(transparent)]
  Config(#[from] ConfigError),
}

pub struct ServerBuilder<M: Message = DataMessage> {
  name: String,
  transport: TransportSettings,
  security: Option<rustls::ServerConfig>,
  raw_routers: Vec<Arc<dyn RawRouter<M>>>,
  frame_protocol: Option<Arc<MessageProtocol<M>>>,
  connection_config: ConnectionConfig,
}

impl<M: Message> ServerBuilder<M> {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      transport: TransportSettings::default(),
      security: None,
      raw_routers: Vec::new(),
      frame_protocol: None,
      connection_config: ConnectionConfig::default(),
    }
  }

  pub fn with_transport_config(mut self, transport: TransportSettings) -> Self {
    self.transport = transport;
    self
  }

  pub fn with_security_config(mut self, security: rustls::ServerConfig) -> Self {
    self.security = Some(security);
    self
  }

  /// Routers run, in the order added, for every chunk read from a raw stream
  pub fn with_raw_router(mut self, router: Arc<dyn RawRouter<M>>) -> Self {
    self.raw_routers.push(router);
    self
  }

  /// Protocol bound to every frame stream; defaults to an empty protocol
  pub fn with_frame_protocol(mut self, protocol: Arc<MessageProtocol<M>>) -> Self {
    self.frame_protocol = Some(protocol);
    self
  }

  pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
    self.connection_config = config;
    self
  }

  pub fn build(self) -> Result<Server<M>, ServerError> {
    let security = self.security.ok_or(ServerError::MissingSecurityConfig)?;
    self.connection_config.validate()?;
    let mut quinn_config = quinn::ServerConfig::with_crypto(Arc::new(security));
    quinn_config.transport_config(Arc::new(self.transport.to_quinn()?));
    let frame_protocol = self
      .frame_protocol
      .unwrap_or_else(|| Arc::new(MessageProtocol::new(self.name.clone(), "v0")));
    Ok(Server {
      name: self.name,
      quinn_config,
      connection_config: self.connection_config,
      frame_protocol,
      raw_routers: self.raw_routers,
      ids: ConnectionIds::from_clock(),
      stop: CancellationToken::new(),
      local_addr: watch::channel(None).0,
    })
  }
}

pub struct Server<M: Message = DataMessage> {
  name: String,
  quinn_config: quinn::ServerConfig,
  connection_config: ConnectionConfig,
  frame_protocol: Arc<MessageProtocol<M>>,
  raw_routers: Vec<Arc<dyn RawRouter<M>>>,
  ids: ConnectionIds,
  stop: CancellationToken,
  local_addr: watch::Sender<Option<SocketAddr>>,
}

impl<M: Message> Server<M> {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Accepts connections on `addr` until `cancel` fires or [`Server::stop`] is called
  ///
  /// Each connection is served on its own task. A failed handshake or
  /// negotiation only affects that connection.
  #[tracing::instrument(skip(self, cancel), fields(server = %self.name), err)]
  pub async fn serve(&self, cancel: CancellationToken, addr: SocketAddr) -> Result<(), ServerError> {
    if self.stop.is_cancelled() {
      return Err(ServerError::Stopped);
    }
    let endpoint =
      quinn::Endpoint::server(self.quinn_config.clone(), addr).map_err(ServerError::Bind)?;
    let bound = endpoint.local_addr().map_err(ServerError::Bind)?;
    self.local_addr.send_replace(Some(bound));
    tracing::info!(addr = %bound, "listening");

    let connections = cancel.child_token();
    loop {
      let connecting = tokio::select! {
        _ = cancel.cancelled() => break,
        _ = self.stop.cancelled() => break,
        connecting = endpoint.accept() => match connecting {
          Some(connecting) => connecting,
          None => break,
        },
      };
      let id = self.ids.next();
      let span = tracing::info_span!("connection", connection = %id, remote = %connecting.remote_address());
      tokio::spawn(
        serve_connection(
          id,
          connecting,
          self.connection_config.clone(),
          self.frame_protocol.clone(),
          self.raw_routers.clone(),
          connections.child_token(),
        )
        .instrument(span),
      );
    }

    tracing::info!("server stopping");
    connections.cancel();
    endpoint.close(quinn::VarInt::from_u32(CLOSE_CODE_GRACEFUL), b"server stopping");
    if tokio::time::timeout(ENDPOINT_DRAIN_GRACE, endpoint.wait_idle())
      .await
      .is_err()
    {
      tracing::debug!("endpoint did not drain before the grace period elapsed");
    }
    self.local_addr.send_replace(None);
    Ok(())
  }

  /// Stops every running and future call to [`Server::serve`]
  pub fn stop(&self) {
    self.stop.cancel();
  }

  pub fn is_stopped(&self) -> bool {
    self.stop.is_cancelled()
  }

  /// Address of the running endpoint, if any
  pub fn local_addr(&self) -> Option<SocketAddr> {
    *self.local_addr.borrow()
  }

  /// Resolves once [`Server::serve`] has bound its endpoint
  pub async fn bound(&self) -> Result<SocketAddr, ServerError> {
    let mut bound = self.local_addr.subscribe();
    loop {
      if let Some(addr) = *bound.borrow_and_update() {
        return Ok(addr);
      }
      tokio::select! {
        _ = self.stop.cancelled() => return Err(ServerError::Stopped),
        changed = bound.changed() => changed.map_err(|_| ServerError::Stopped)?,
      }
    }
  }
}

impl<M: Message> std::fmt::Debug for Server<M> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Server")
      .field("name", &self.name)
      .field("local_addr", &self.local_addr())
      .finish_non_exhaustive()
  }
}

async fn serve_connection<M: Message>(
  id: ConnectionId,
  connecting: quinn::Connecting,
  config: ConnectionConfig,
  frame_protocol: Arc<MessageProtocol<M>>,
  raw_routers: Vec<Arc<dyn RawRouter<M>>>,
  cancel: CancellationToken,
) {
  let quinn_connection = tokio::select! {
    _ = cancel.cancelled() => return,
    connection = connecting => match connection {
      Ok(connection) => connection,
      Err(error) => {
        tracing::warn!(error = %error, "handshake failed");
        return;
      }
    },
  };
  let transport = Arc::new(QuinnTransport::new(quinn_connection, TransportSide::Listen));
  let connection = Connection::new(
    id,
    transport,
    TransportSide::Listen,
    config,
    frame_protocol,
    raw_routers,
  );
  tracing::debug!("connection established");
  match ServerConnection::new(connection).serve(cancel).await {
    Ok(CloseReason::Local | CloseReason::Cancelled | CloseReason::RemoteClosed) => {}
    Ok(reason) => tracing::debug!(reason = %reason, "connection ended abnormally"),
    Err(error) => tracing::warn!(error = %error, "connection failed"),
  }
}

#[cfg(test)]
mod tests {
  use super::{ServerBuilder, ServerError};
  use crate::{common::config::ConnectionConfig, util::tls::create_server_config};

  #[test]
  fn security_config_is_required() {
    let result = ServerBuilder::<crate::DataMessage>::new("test").build();
    assert!(matches!(result, Err(ServerError::MissingSecurityConfig)));
  }

  #[test]
  fn invalid_connection_config_is_refused() {
    let security = create_server_config("localhost", None, None, true).unwrap();
    let result = ServerBuilder::<crate::DataMessage>::new("test")
      .with_security_config(security)
      .with_connection_config(ConnectionConfig {
        read_buffer_size: 0,
        ..ConnectionConfig::default()
      })
      .build();
    assert!(matches!(result, Err(ServerError::Config(_))));
  }

  #[tokio::test]
  async fn stopped_servers_refuse_to_serve() {
    let security = create_server_config("localhost", None, None, true).unwrap();
    let server = ServerBuilder::<crate::DataMessage>::new("test")
      .with_security_config(security)
      .build()
      .unwrap();
    server.stop();
    let result = server
      .serve(
        tokio_util::sync::CancellationToken::new(),
        "127.0.0.1:0".parse().unwrap(),
      )
      .await;
    assert!(matches!(result, Err(ServerError::Stopped)));
    assert!(matches!(server.bound().await, Err(ServerError::Stopped)));
  }
}
