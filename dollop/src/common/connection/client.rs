// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Requester side of a connection

use std::sync::Arc;

use bytes::Bytes;
use tokio::{
  io::AsyncWriteExt,
  sync::{mpsc, Mutex},
};
use tracing_futures::Instrument;

use crate::{
  common::{
    connection::{server::lose_control_stream, CloseReason, Connection, ConnectionError, ConnectionState},
    protocol::{
      control::{
        kind_for_request_tag, ControlMessage, ControlStream, ACK_STREAM_TAG, REJECT_STREAM_TAG,
      },
      message::{DataMessage, Message, MessageError},
    },
    stream::{FrameStream, RawStream, StreamError, StreamId, StreamKind},
    transport::Link,
  },
  util::framed,
};

pub struct ClientConnection<M: Message = DataMessage> {
  connection: Arc<Connection<M>>,
  // Held for the whole negotiation, which serializes stream opens
  negotiator: Mutex<Negotiator>,
}

struct Negotiator {
  rejections: mpsc::Receiver<StreamKind>,
  abandoned: Abandoned,
}

/// Requests that timed out after being sent; the responder may still answer them
#[derive(Debug, Default)]
struct Abandoned {
  raw: usize,
  frame: usize,
}

impl Abandoned {
  fn count(&mut self, kind: StreamKind) -> &mut usize {
    match kind {
      StreamKind::Raw => &mut self.raw,
      StreamKind::Frame => &mut self.frame,
    }
  }

  /// Attributes an answer of `kind` to the oldest abandoned request of that kind
  fn settle(&mut self, kind: StreamKind) -> bool {
    let count = self.count(kind);
    if *count == 0 {
      return false;
    }
    *count -= 1;
    true
  }
}

/// What the first frame of an accepted sub-stream answers
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Answer {
  Accepted(StreamKind),
  Rejected(StreamKind),
}

impl Answer {
  fn kind(self) -> StreamKind {
    match self {
      Answer::Accepted(kind) | Answer::Rejected(kind) => kind,
    }
  }
}

impl<M: Message> ClientConnection<M> {
  /// Opens the control stream on a fresh transport connection
  #[tracing::instrument(skip_all, fields(connection = %connection.id()))]
  pub async fn establish(connection: Arc<Connection<M>>) -> Result<Self, ConnectionError> {
    let link = connection.transport().open_link().await?;
    let control = Arc::new(ControlStream::with_max_frame_length(
      link,
      connection.config().max_frame_length,
    ));
    control.bind_protocol(connection.control_protocol().clone())?;
    if let Err(error) = connection.bind_control_stream(control.clone()) {
      let _ = control.close().await;
      return Err(error);
    }
    let (rejection_sender, rejections) =
      mpsc::channel(connection.config().request_queue_capacity.max(1));
    tokio::spawn(read_control_stream(connection.clone(), control, rejection_sender).in_current_span());
    tokio::spawn(watch_transport(connection.clone()).in_current_span());
    connection.set_state(ConnectionState::Serving);
    Ok(Self {
      connection,
      negotiator: Mutex::new(Negotiator {
        rejections,
        abandoned: Abandoned::default(),
      }),
    })
  }

  pub fn connection(&self) -> &Arc<Connection<M>> {
    &self.connection
  }

  /// Negotiates a raw sub-stream; the acknowledgement has been consumed when this returns
  #[tracing::instrument(skip_all, fields(connection = %self.connection.id()))]
  pub async fn open_raw_stream(&self, payload: impl Into<Bytes>) -> Result<Arc<RawStream<M>>, ConnectionError> {
    let link = self.negotiate(StreamKind::Raw, payload.into()).await?;
    let stream = Arc::new(RawStream::new(link));
    if let Err(error) = self.connection.add_raw_stream(stream.clone()) {
      let _ = stream.close().await;
      return Err(error);
    }
    tracing::debug!(stream_id = %stream.id(), "raw stream opened");
    Ok(stream)
  }

  /// Negotiates a frame sub-stream bound to the connection's frame protocol
  #[tracing::instrument(skip_all, fields(connection = %self.connection.id()))]
  pub async fn open_frame_stream(
    &self,
    payload: impl Into<Bytes>,
  ) -> Result<Arc<FrameStream<M>>, ConnectionError> {
    let link = self.negotiate(StreamKind::Frame, payload.into()).await?;
    let stream = Arc::new(FrameStream::with_max_frame_length(
      link,
      self.connection.config().max_frame_length,
    ));
    stream.bind_protocol(self.connection.frame_protocol().clone())?;
    if let Err(error) = self.connection.add_frame_stream(stream.clone()) {
      let _ = stream.close().await;
      return Err(error);
    }
    tracing::debug!(stream_id = %stream.id(), "frame stream opened");
    Ok(stream)
  }

  /// Unregisters and finishes a raw stream opened on this connection
  pub async fn close_raw_stream(&self, id: StreamId) -> Result<(), ConnectionError> {
    self.connection.close_raw_stream(id).await
  }

  /// Unregisters and finishes a frame stream opened on this connection
  pub async fn close_frame_stream(&self, id: StreamId) -> Result<(), ConnectionError> {
    self.connection.close_frame_stream(id).await
  }

  pub async fn close(&self) -> bool {
    self.connection.close(CloseReason::Local).await
  }

  async fn negotiate(&self, kind: StreamKind, payload: Bytes) -> Result<Link, ConnectionError> {
    let connection = &self.connection;
    if connection.is_closing() {
      return Err(ConnectionError::Closed);
    }
    let control = connection.control_stream()?;
    let mut negotiator = self.negotiator.lock().await;
    let Negotiator {
      rejections,
      abandoned,
    } = &mut *negotiator;
    while let Ok(rejected) = rejections.try_recv() {
      if !abandoned.settle(rejected) {
        tracing::debug!(kind = ?rejected, "dropping a rejection that answers no request");
      }
    }

    let mut sent = false;
    let mut answered = false;
    let exchange = async {
      control
        .write_msg(&ControlMessage::request_for(kind, payload))
        .await
        .map_err(ConnectionError::ControlStreamLost)?;
      sent = true;
      let mut accept = connection.transport().accept_link();
      let link = loop {
        let link = tokio::select! {
          link = &mut accept => link?,
          rejected = rejections.recv() => match rejected {
            Some(rejected) if abandoned.settle(rejected) => {
              tracing::debug!(kind = ?rejected, "discarding the rejection of an abandoned request");
              continue;
            }
            Some(rejected) if rejected == kind => {
              answered = true;
              return Err(ConnectionError::Rejected(kind));
            }
            Some(rejected) => {
              tracing::debug!(kind = ?rejected, "ignoring rejection of another stream kind");
              continue;
            }
            None => return Err(ConnectionError::Closed),
          },
        };
        accept = connection.transport().accept_link();
        // A link read past the deadline is assumed to answer this request
        answered = true;
        let (answer, link) = read_answer(connection, kind, link).await?;
        if abandoned.settle(answer.kind()) {
          tracing::debug!(stream_id = %link.id(), answer = ?answer, "discarding the late answer to an abandoned request");
          shut_down(link).await;
          answered = false;
          continue;
        }
        match answer {
          Answer::Accepted(accepted) if accepted == kind => break link,
          Answer::Rejected(rejected) if rejected == kind => {
            shut_down(link).await;
            return Err(ConnectionError::Rejected(kind));
          }
          Answer::Accepted(_) => {
            let id = link.id();
            tracing::warn!(stream_id = %id, kind = ?kind, answer = ?answer, "stream answers another request");
            shut_down(link).await;
            return Err(ConnectionError::AckMismatch {
              kind,
              id,
              received: ACK_STREAM_TAG,
            });
          }
          Answer::Rejected(_) => {
            let id = link.id();
            tracing::warn!(stream_id = %id, kind = ?kind, answer = ?answer, "stream answers another request");
            shut_down(link).await;
            return Err(ConnectionError::AckMismatch {
              kind,
              id,
              received: REJECT_STREAM_TAG,
            });
          }
        }
      };
      Ok::<Link, ConnectionError>(link)
    };
    let outcome = tokio::time::timeout(connection.config().open_timeout, exchange).await;
    match outcome {
      Ok(result) => result,
      Err(_) => {
        if sent && !answered {
          *abandoned.count(kind) += 1;
        }
        tracing::warn!(kind = ?kind, "stream negotiation timed out");
        Err(ConnectionError::OpenTimedOut(kind))
      }
    }
  }
}

impl<M: Message> std::fmt::Debug for ClientConnection<M> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("ClientConnection").field(&self.connection).finish()
  }
}

/// Reads the first frame of a new sub-stream, which must be an Ack or a Reject
///
/// An empty payload answers the request of `kind`.
async fn read_answer<M: Message>(
  connection: &Connection<M>,
  kind: StreamKind,
  link: Link,
) -> Result<(Answer, Link), ConnectionError> {
  let (id, mut reader, mut writer) = link.into_parts();
  let verdict = match framed::read_frame(&mut reader, connection.config().max_frame_length).await {
    Ok(frame) => {
      let received = frame.tag();
      let answer = match connection.control_protocol().parse_message(frame) {
        Ok(ControlMessage::AckStream(payload)) => answered_kind(kind, &payload).map(Answer::Accepted),
        Ok(ControlMessage::RejectStream(payload)) => answered_kind(kind, &payload).map(Answer::Rejected),
        _ => None,
      };
      answer.ok_or(ConnectionError::AckMismatch { kind, id, received })
    }
    Err(error) => Err(ConnectionError::Stream(StreamError::from(error))),
  };
  match verdict {
    Ok(answer) => Ok((answer, Link::new(id, reader, writer))),
    Err(error) => {
      tracing::warn!(stream_id = %id, kind = ?kind, error = %error, "stream acknowledgement failed");
      let _ = writer.shutdown().await;
      Err(error)
    }
  }
}

fn answered_kind(requested: StreamKind, payload: &[u8]) -> Option<StreamKind> {
  match payload {
    [] => Some(requested),
    [tag] => kind_for_request_tag(*tag),
    _ => None,
  }
}

async fn shut_down(link: Link) {
  let (_, _reader, mut writer) = link.into_parts();
  let _ = writer.shutdown().await;
}

async fn read_control_stream<M: Message>(
  connection: Arc<Connection<M>>,
  control: Arc<ControlStream>,
  rejections: mpsc::Sender<StreamKind>,
) {
  let shutdown = connection.shutdown_token();
  loop {
    let message = tokio::select! {
      _ = shutdown.cancelled() => return,
      message = control.read_msg() => message,
    };
    match message {
      Ok(message @ ControlMessage::RejectStream(_)) => match message.answered_kind() {
        Some(kind) => {
          tracing::debug!(kind = ?kind, "peer rejected a stream request");
          let _ = rejections.try_send(kind);
        }
        None => connection.report_violation(
          control.id(),
          Some(message.tag()),
          "rejection names no stream kind",
        ),
      },
      Ok(message) => connection.report_violation(
        control.id(),
        Some(message.tag()),
        "unexpected control message from the responder",
      ),
      Err(MessageError::Stream(error)) => {
        lose_control_stream(&connection, error).await;
        return;
      }
      Err(error) => connection.report_violation(control.id(), error.tag(), &error),
    }
  }
}

async fn watch_transport<M: Message>(connection: Arc<Connection<M>>) {
  let shutdown = connection.shutdown_token();
  tokio::select! {
    _ = shutdown.cancelled() => {}
    error = connection.transport().closed() => {
      connection.close(CloseReason::Transport(error)).await;
    }
  }
}
