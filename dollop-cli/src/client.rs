// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Result};
use bytes::Bytes;
use dollop::{
  client::Client, util::tls::create_client_config, DataMessage, MessageProtocol,
  TransportSettings,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ClientArgs {
  pub addr: SocketAddr,
  pub server_name: String,
  pub message: String,
  pub cert: Option<PathBuf>,
  pub key: Option<PathBuf>,
  pub verify: bool,
}

#[tracing::instrument(skip(config), fields(addr = %config.addr), err)]
pub async fn client_main(config: ClientArgs) -> Result<()> {
  let security = create_client_config(config.cert.as_deref(), config.key.as_deref(), !config.verify)
    .context("Failed building TLS configuration")?;
  let client = Client::<DataMessage>::new("dollop-client", security, TransportSettings::default())
    .with_frame_protocol(Arc::new(MessageProtocol::basic()));
  let connection = client
    .connect(config.addr, &config.server_name)
    .await
    .context("Failed connecting to server")?;
  let data = Bytes::from(config.message.clone().into_bytes());

  let raw = connection
    .open_raw_stream(Bytes::new())
    .await
    .context("Failed opening raw stream")?;
  tracing::info!(stream_id = %raw.id(), "sending {:?}", config.message);
  raw.write_all(&data).await?;
  let mut echoed = vec![0u8; data.len()];
  raw.read_exact(&mut echoed).await?;
  println!("raw echo: {}", String::from_utf8_lossy(&echoed));
  connection.close_raw_stream(raw.id()).await?;

  let frames = connection
    .open_frame_stream(Bytes::new())
    .await
    .context("Failed opening frame stream")?;
  frames.write_msg(&DataMessage::new(data)).await?;
  let reply = frames.read_msg().await?;
  println!("frame echo: {}", String::from_utf8_lossy(reply.data()));
  connection.close_frame_stream(frames.id()).await?;

  connection.close().await;
  Ok(())
}
