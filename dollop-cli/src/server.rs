// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use dollop::{
  common::protocol::{message::DATA_MESSAGE_TAG, router::HookResult},
  server::ServerBuilder,
  util::tls::create_server_config,
  DataMessage, DollopConfig, FrameRequest, FrameRouter, MessageProtocol, RawRequest, RawRouter,
};
use futures::future::{BoxFuture, FutureExt};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Parameters used to run a dollop echo server
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ServerArgs {
  pub addr: SocketAddr,
  pub cert: Option<PathBuf>,
  pub key: Option<PathBuf>,
  pub host: String,
  pub config: Option<PathBuf>,
  pub require_client_cert: bool,
}

/// Writes every raw chunk back to the stream it arrived on
pub struct RawEchoRouter;

impl RawRouter for RawEchoRouter {
  fn name(&self) -> &str {
    "raw-echo"
  }

  fn handle<'a>(&'a self, request: &'a RawRequest) -> BoxFuture<'a, HookResult> {
    async move {
      tracing::info!(
        stream_id = %request.stream().id(),
        data = %String::from_utf8_lossy(request.data()),
        "raw data received"
      );
      request
        .stream()
        .write_all(request.data())
        .await
        .context("Failed echoing raw data")
    }
    .boxed()
  }
}

/// Answers every data message with a copy of itself
pub struct FrameEchoRouter;

impl FrameRouter for FrameEchoRouter {
  fn name(&self) -> &str {
    "frame-echo"
  }

  fn handle<'a>(&'a self, request: &'a FrameRequest) -> BoxFuture<'a, HookResult> {
    async move {
      tracing::info!(
        stream_id = %request.stream().id(),
        data = %String::from_utf8_lossy(request.message().data()),
        "frame data received"
      );
      request
        .stream()
        .write_msg(&DataMessage::new(request.message().data().clone()))
        .await
        .context("Failed echoing data message")
    }
    .boxed()
  }
}

/// Run an echo server until interrupted
#[tracing::instrument(skip(config), fields(addr = %config.addr), err)]
pub async fn server_main(config: self::ServerArgs) -> Result<()> {
  let settings = match &config.config {
    Some(path) => DollopConfig::from_json_file(path)
      .with_context(|| format!("Failed loading configuration from {:?}", path))?,
    None => DollopConfig::default(),
  };
  let security = create_server_config(
    &config.host,
    config.cert.as_deref(),
    config.key.as_deref(),
    !config.require_client_cert,
  )
  .context("Failed building TLS configuration")?;

  let protocol =
    MessageProtocol::basic().with_route(DATA_MESSAGE_TAG, Arc::new(FrameEchoRouter));
  let server = ServerBuilder::<DataMessage>::new("dollop-echo")
    .with_security_config(security)
    .with_transport_config(settings.transport)
    .with_connection_config(settings.connection)
    .with_raw_router(Arc::new(RawEchoRouter))
    .with_frame_protocol(Arc::new(protocol))
    .build()?;

  let (shutdown, sigint_handler_task) = {
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let sigint_handler_task = tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::trace!("SIGINT detected, initiating graceful shutdown");
      shutdown_trigger.cancel();
    });
    (shutdown, sigint_handler_task)
  };

  let result = server.serve(shutdown, config.addr).await;
  sigint_handler_task.abort();
  result.context("Server failure")
}
