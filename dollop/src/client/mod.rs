// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Connecting side of dollop: dials a server and negotiates the control stream

use std::{
  net::{Ipv4Addr, Ipv6Addr, SocketAddr},
  sync::Arc,
};

use crate::common::{
  config::{ConfigError, ConnectionConfig, TransportSettings},
  connection::{
    ClientConnection, CloseReason, Connection, ConnectionError, ConnectionIds,
  },
  protocol::message::{DataMessage, Message, MessageProtocol},
  transport::{QuinnTransport, TransportSide},
};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
  #[error("Failed binding the client endpoint: {0}")]
  Bind(#[source] std::io::Error),
  #[error("Failed starting the connection: {0}")]
  Connect(#[from] quinn::ConnectError),
  #[error("Connection failed: {0}")]
  Connection(#[from] quinn::ConnectionError),
  #[error("Failed establishing the control stream: {0}")]
  Negotiation(#[from] ConnectionError),
  #[error(transparent)]
  Config(#[from] ConfigError),
}

pub struct Client<M: Message = DataMessage> {
  name: String,
  security: Arc<rustls::ClientConfig>,
  transport: TransportSettings,
  connection_config: ConnectionConfig,
  frame_protocol: Arc<MessageProtocol<M>>,
  ids: ConnectionIds,
}

impl<M: Message> Client<M> {
  pub fn new(
    name: impl Into<String>,
    security: rustls::ClientConfig,
    transport: TransportSettings,
  ) -> Self {
    let name = name.into();
    Self {
      frame_protocol: Arc::new(MessageProtocol::new(name.clone(), "v0")),
      name,
      security: Arc::new(security),
      transport,
      connection_config: ConnectionConfig::default(),
      ids: ConnectionIds::default(),
    }
  }

  pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
    self.connection_config = config;
    self
  }

  /// Protocol bound to frame streams this client opens
  pub fn with_frame_protocol(mut self, protocol: Arc<MessageProtocol<M>>) -> Self {
    self.frame_protocol = protocol;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Dials `addr`, verifying its certificate against `server_name`, and opens
  /// the control stream
  #[tracing::instrument(skip(self), fields(client = %self.name), err)]
  pub async fn connect(
    &self,
    addr: SocketAddr,
    server_name: &str,
  ) -> Result<ClientConnection<M>, ClientError> {
    self.connection_config.validate()?;
    let bind_addr: SocketAddr = if addr.is_ipv6() {
      (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
      (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let mut endpoint = quinn::Endpoint::client(bind_addr).map_err(ClientError::Bind)?;
    let mut quinn_config = quinn::ClientConfig::new(self.security.clone());
    quinn_config.transport_config(Arc::new(self.transport.to_quinn()?));
    endpoint.set_default_client_config(quinn_config);

    let quinn_connection = endpoint.connect(addr, server_name)?.await?;
    tracing::debug!(remote = %quinn_connection.remote_address(), "handshake complete");
    let transport = Arc::new(QuinnTransport::with_endpoint(
      quinn_connection,
      TransportSide::Connect,
      endpoint,
    ));
    let connection = Connection::new(
      self.ids.next(),
      transport,
      TransportSide::Connect,
      self.connection_config.clone(),
      self.frame_protocol.clone(),
      Vec::new(),
    );
    match ClientConnection::establish(connection.clone()).await {
      Ok(client) => Ok(client),
      Err(error) => {
        connection
          .close(CloseReason::ControlStreamLost(error.to_string()))
          .await;
        Err(error.into())
      }
    }
  }
}

impl<M: Message> std::fmt::Debug for Client<M> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Client")
      .field("name", &self.name)
      .finish_non_exhaustive()
  }
}
