// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Responder side of a connection
//!
//! Accepts the control stream, queues stream requests per kind, opens and
//! acknowledges the requested sub-streams, and runs one read loop per
//! sub-stream that feeds the router pipeline.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::{
  connection::{CloseReason, Connection, ConnectionError, ConnectionState},
  protocol::{
    control::{ControlMessage, ControlStream},
    message::{DataMessage, Message, MessageError},
    router::{dispatch_frame, dispatch_raw, FrameRequest, RawRequest},
  },
  stream::{FrameStream, RawStream, StreamError, StreamKind},
};

pub struct ServerConnection<M: Message = DataMessage> {
  connection: Arc<Connection<M>>,
}

impl<M: Message> ServerConnection<M> {
  pub fn new(connection: Arc<Connection<M>>) -> Self {
    Self { connection }
  }

  pub fn connection(&self) -> &Arc<Connection<M>> {
    &self.connection
  }

  /// Serves the connection until it is cancelled, closed, or lost
  ///
  /// Returns the reason the connection closed with.
  #[tracing::instrument(skip_all, fields(connection = %self.connection.id()))]
  pub async fn serve(&self, cancel: CancellationToken) -> Result<CloseReason, ConnectionError> {
    let connection = &self.connection;
    let link = tokio::select! {
      _ = cancel.cancelled() => return Ok(self.finish(CloseReason::Cancelled).await),
      error = connection.transport().closed() => {
        return Ok(self.finish(CloseReason::Transport(error)).await)
      }
      link = connection.transport().accept_link() => match link {
        Ok(link) => link,
        Err(error) => {
          self.finish(CloseReason::Transport(error.clone())).await;
          return Err(error.into());
        }
      },
    };
    let control = Arc::new(ControlStream::with_max_frame_length(
      link,
      connection.config().max_frame_length,
    ));
    control.bind_protocol(connection.control_protocol().clone())?;
    if let Err(error) = connection.bind_control_stream(control.clone()) {
      let _ = control.close().await;
      return Err(error);
    }
    tracing::debug!(stream_id = %control.id(), "control stream accepted");

    let capacity = connection.config().request_queue_capacity.max(1);
    let (raw_requests, raw_queue) = mpsc::channel(capacity);
    let (frame_requests, frame_queue) = mpsc::channel(capacity);
    tokio::spawn(
      read_control_stream(connection.clone(), control, raw_requests, frame_requests)
        .in_current_span(),
    );
    tokio::spawn(serve_stream_requests(connection.clone(), StreamKind::Raw, raw_queue).in_current_span());
    tokio::spawn(
      serve_stream_requests(connection.clone(), StreamKind::Frame, frame_queue).in_current_span(),
    );
    connection.set_state(ConnectionState::Serving);

    let reason = tokio::select! {
      _ = cancel.cancelled() => CloseReason::Cancelled,
      error = connection.transport().closed() => CloseReason::Transport(error),
      _ = connection.closed() => CloseReason::Local,
    };
    Ok(self.finish(reason).await)
  }

  async fn finish(&self, reason: CloseReason) -> CloseReason {
    self.connection.close(reason.clone()).await;
    let reason = self.connection.close_reason().unwrap_or(reason);
    tracing::info!(reason = %reason, "connection closed");
    reason
  }
}

impl<M: Message> std::fmt::Debug for ServerConnection<M> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("ServerConnection").field(&self.connection).finish()
  }
}

/// Classifies control messages; stream requests go to their queue, which
/// blocks this loop while full
async fn read_control_stream<M: Message>(
  connection: Arc<Connection<M>>,
  control: Arc<ControlStream>,
  raw_requests: mpsc::Sender<ControlMessage>,
  frame_requests: mpsc::Sender<ControlMessage>,
) {
  let shutdown = connection.shutdown_token();
  loop {
    let message = tokio::select! {
      _ = shutdown.cancelled() => return,
      message = control.read_msg() => message,
    };
    let message = match message {
      Ok(message) => message,
      Err(MessageError::Stream(error)) => {
        lose_control_stream(&connection, error).await;
        return;
      }
      Err(error) => {
        connection.report_violation(control.id(), error.tag(), &error);
        continue;
      }
    };
    let queue = match message.requested_kind() {
      Some(StreamKind::Raw) => &raw_requests,
      Some(StreamKind::Frame) => &frame_requests,
      None => {
        connection.report_violation(
          control.id(),
          Some(message.tag()),
          "unexpected control message from the requester",
        );
        continue;
      }
    };
    tokio::select! {
      _ = shutdown.cancelled() => return,
      sent = queue.send(message) => {
        if sent.is_err() {
          return;
        }
      }
    }
  }
}

pub(crate) async fn lose_control_stream<M: Message>(connection: &Connection<M>, error: StreamError) {
  if connection.is_closing() {
    return;
  }
  let reason = if error.is_end_of_stream() {
    tracing::debug!("peer finished the control stream");
    CloseReason::RemoteClosed
  } else {
    tracing::warn!(error = %error, "control stream lost");
    CloseReason::ControlStreamLost(error.to_string())
  };
  connection.close(reason).await;
}

/// Answers queued requests of one kind, in arrival order
async fn serve_stream_requests<M: Message>(
  connection: Arc<Connection<M>>,
  kind: StreamKind,
  requests: mpsc::Receiver<ControlMessage>,
) {
  let shutdown = connection.shutdown_token();
  let stop = shutdown.clone();
  let requests = ReceiverStream::new(requests).take_until(async move { stop.cancelled().await });
  futures::pin_mut!(requests);
  while let Some(request) = requests.next().await {
    tracing::trace!(kind = ?kind, payload_len = request.payload().len(), "servicing stream request");
    let opened = tokio::select! {
      _ = shutdown.cancelled() => break,
      opened = open_requested_stream(&connection, kind) => opened,
    };
    if let Err(error) = opened {
      if connection.is_closing() {
        break;
      }
      tracing::warn!(kind = ?kind, error = %error, "failed to open requested stream");
      if let Ok(control) = connection.control_stream() {
        if let Err(error) = control.write_msg(&ControlMessage::reject_for(kind)).await {
          tracing::debug!(error = %error, "failed to send stream rejection");
        }
      }
    }
  }
  tracing::trace!(kind = ?kind, "stream request servicer stopped");
}

async fn open_requested_stream<M: Message>(
  connection: &Arc<Connection<M>>,
  kind: StreamKind,
) -> Result<(), ConnectionError> {
  let link = connection.transport().open_link().await?;
  let ack = ControlMessage::ack_for(kind).to_frame();
  match kind {
    StreamKind::Raw => {
      let stream = Arc::new(RawStream::new(link));
      let acknowledged = match ack.encode() {
        Ok(encoded) => stream.write_all(&encoded).await,
        Err(error) => Err(error.into()),
      };
      if let Err(error) = acknowledged {
        let _ = stream.close().await;
        return Err(error.into());
      }
      stream.bind_routers(connection.raw_routers().iter().cloned());
      if let Err(error) = connection.add_raw_stream(stream.clone()) {
        let _ = stream.close().await;
        return Err(error);
      }
      let span = tracing::debug_span!("raw_stream", stream_id = %stream.id());
      tokio::spawn(read_raw_stream(connection.clone(), stream).instrument(span));
    }
    StreamKind::Frame => {
      let stream = Arc::new(FrameStream::with_max_frame_length(
        link,
        connection.config().max_frame_length,
      ));
      if let Err(error) = stream.write_frame(&ack).await {
        let _ = stream.close().await;
        return Err(error.into());
      }
      stream.bind_protocol(connection.frame_protocol().clone())?;
      if let Err(error) = connection.add_frame_stream(stream.clone()) {
        let _ = stream.close().await;
        return Err(error);
      }
      let span = tracing::debug_span!("frame_stream", stream_id = %stream.id());
      tokio::spawn(read_frame_stream(connection.clone(), stream).instrument(span));
    }
  }
  Ok(())
}

async fn read_raw_stream<M: Message>(connection: Arc<Connection<M>>, stream: Arc<RawStream<M>>) {
  let shutdown = connection.shutdown_token();
  let mut buffer = vec![0u8; connection.config().read_buffer_size.max(1)];
  let failure = loop {
    let read = tokio::select! {
      _ = shutdown.cancelled() => return,
      read = stream.read(&mut buffer) => read,
    };
    match read {
      Ok(0) => break None,
      Ok(length) => {
        // Each request owns its bytes; the buffer is reused for the next read
        let data = Bytes::copy_from_slice(&buffer[..length]);
        let routers = stream.routers();
        let request = RawRequest::new(connection.clone(), stream.clone(), data);
        tokio::spawn(
          async move {
            let report = dispatch_raw(&routers, &request).await;
            request
              .connection()
              .report_dispatch(StreamKind::Raw, request.stream().id(), &report);
          }
          .in_current_span(),
        );
      }
      Err(error) => break Some(error),
    }
  };
  connection
    .retire_stream(StreamKind::Raw, stream.id(), failure)
    .await;
}

async fn read_frame_stream<M: Message>(connection: Arc<Connection<M>>, stream: Arc<FrameStream<M>>) {
  let shutdown = connection.shutdown_token();
  let failure = loop {
    let message = tokio::select! {
      _ = shutdown.cancelled() => return,
      message = stream.read_msg() => message,
    };
    match message {
      Ok(message) => {
        let tag = message.tag();
        match stream.router(tag) {
          Ok(router) => {
            let request = FrameRequest::new(connection.clone(), stream.clone(), message);
            tokio::spawn(
              async move {
                let report = dispatch_frame(router.as_ref(), &request).await;
                request
                  .connection()
                  .report_dispatch(StreamKind::Frame, request.stream().id(), &report);
              }
              .in_current_span(),
            );
          }
          Err(error) => connection.report_violation(stream.id(), Some(tag), &error),
        }
      }
      Err(MessageError::Stream(error)) if error.is_end_of_stream() => break None,
      Err(MessageError::Stream(error)) => break Some(error),
      Err(error) => connection.report_violation(stream.id(), error.tag(), &error),
    }
  };
  connection
    .retire_stream(StreamKind::Frame, stream.id(), failure)
    .await;
}
