// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{future::Future, sync::Arc, time::Duration};

use dollop::{
  client::Client,
  common::protocol::{message::DATA_MESSAGE_TAG, router::HookResult},
  server::ServerBuilder,
  util::tls::{create_client_config, create_server_config},
  ConnectionState, DataMessage, FrameRequest, FrameRouter, MessageProtocol, RawRequest, RawRouter,
  TransportSettings,
};
use futures::{future::BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;

async fn within<F: Future>(future: F) -> F::Output {
  tokio::time::timeout(Duration::from_secs(10), future)
    .await
    .expect("Test may be failing due to an await deadlock")
}

struct Echo;

impl RawRouter for Echo {
  fn handle<'a>(&'a self, request: &'a RawRequest) -> BoxFuture<'a, HookResult> {
    async move {
      request.stream().write_all(request.data()).await?;
      Ok(())
    }
    .boxed()
  }
}

impl FrameRouter for Echo {
  fn handle<'a>(&'a self, request: &'a FrameRequest) -> BoxFuture<'a, HookResult> {
    async move {
      request.stream().write_msg(request.message()).await?;
      Ok(())
    }
    .boxed()
  }
}

#[tokio::test]
async fn streams_echo_over_a_real_quic_connection() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter("quinn=warn,quinn_proto=warn,dollop=debug")
    .with_test_writer()
    .try_init();

  let security = create_server_config("localhost", None, None, true).unwrap();
  let server = Arc::new(
    ServerBuilder::<DataMessage>::new("loopback")
      .with_security_config(security)
      .with_raw_router(Arc::new(Echo))
      .with_frame_protocol(Arc::new(
        MessageProtocol::basic().with_route(DATA_MESSAGE_TAG, Arc::new(Echo)),
      ))
      .build()
      .unwrap(),
  );
  let cancel = CancellationToken::new();
  let serving = tokio::spawn({
    let server = server.clone();
    let cancel = cancel.clone();
    async move { server.serve(cancel, "127.0.0.1:0".parse().unwrap()).await }
  });
  let addr = within(server.bound()).await.unwrap();

  let client = Client::<DataMessage>::new(
    "loopback-client",
    create_client_config(None, None, true).unwrap(),
    TransportSettings::default(),
  )
  .with_frame_protocol(Arc::new(MessageProtocol::basic()));
  let connection = within(client.connect(addr, "localhost")).await.unwrap();

  let raw = within(connection.open_raw_stream("raw")).await.unwrap();
  raw.write_all(b"over quic").await.unwrap();
  let mut buffer = [0u8; 9];
  within(raw.read_exact(&mut buffer)).await.unwrap();
  assert_eq!(&buffer, b"over quic");

  let frames = within(connection.open_frame_stream("frame")).await.unwrap();
  frames.write_msg(&DataMessage::new("framed")).await.unwrap();
  let echoed = within(frames.read_msg()).await.unwrap();
  assert_eq!(echoed.data().as_ref(), b"framed");

  assert!(connection.close().await);
  assert_eq!(connection.connection().state(), ConnectionState::Closed);
  cancel.cancel();
  within(serving).await.unwrap().unwrap();
  assert_eq!(server.local_addr(), None);
}
