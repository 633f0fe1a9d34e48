// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc, OnceLock,
};

use tokio::{io::AsyncWriteExt, sync::Mutex};

use crate::{
  common::{
    protocol::{
      message::{DataMessage, Message, MessageError, MessageProtocol, MessageTag},
      router::FrameRouter,
    },
    stream::{StreamError, StreamId},
    transport::{BoxedReader, BoxedWriter, Link},
  },
  util::framed::{self, Frame},
};

/// A length-delimited sub-stream carrying messages of one protocol
///
/// Whole frames are written under the write lock, so concurrent writers never
/// interleave bytes within a frame.
pub struct FrameStream<M: Message = DataMessage> {
  id: StreamId,
  reader: Mutex<BoxedReader>,
  writer: Mutex<BoxedWriter>,
  protocol: OnceLock<Arc<MessageProtocol<M>>>,
  max_frame_length: Option<usize>,
  closed: AtomicBool,
}

impl<M: Message> FrameStream<M> {
  pub fn new(link: Link) -> Self {
    Self::with_max_frame_length(link, None)
  }

  pub fn with_max_frame_length(link: Link, max_frame_length: Option<usize>) -> Self {
    let (id, reader, writer) = link.into_parts();
    Self {
      id,
      reader: Mutex::new(reader),
      writer: Mutex::new(writer),
      protocol: OnceLock::new(),
      max_frame_length,
      closed: AtomicBool::new(false),
    }
  }

  pub fn id(&self) -> StreamId {
    self.id
  }

  pub fn bind_protocol(&self, protocol: Arc<MessageProtocol<M>>) -> Result<(), MessageError> {
    self
      .protocol
      .set(protocol)
      .map_err(|_| MessageError::ProtocolAlreadyBound(self.id))
  }

  pub fn protocol(&self) -> Result<&Arc<MessageProtocol<M>>, MessageError> {
    self
      .protocol
      .get()
      .ok_or(MessageError::ProtocolNotBound(self.id))
  }

  pub async fn read_frame(&self) -> Result<Frame, StreamError> {
    let mut reader = self.reader.lock().await;
    Ok(framed::read_frame(&mut *reader, self.max_frame_length).await?)
  }

  pub async fn write_frame(&self, frame: &Frame) -> Result<(), StreamError> {
    if self.is_closed() {
      return Err(StreamError::Closed(self.id));
    }
    let mut writer = self.writer.lock().await;
    Ok(framed::write_frame(&mut *writer, frame).await?)
  }

  /// Reads one frame and decodes it with the bound protocol
  ///
  /// A frame with an unknown tag is consumed and reported as
  /// [`MessageError::UnknownMessageType`]; the stream stays usable.
  pub async fn read_msg(&self) -> Result<M, MessageError> {
    let protocol = self.protocol()?.clone();
    let frame = self.read_frame().await?;
    protocol.parse_message(frame)
  }

  pub async fn write_msg(&self, message: &M) -> Result<(), MessageError> {
    self.protocol()?;
    Ok(self.write_frame(&message.to_frame()).await?)
  }

  pub fn router(&self, tag: MessageTag) -> Result<Arc<dyn FrameRouter<M>>, MessageError> {
    self.protocol()?.router(tag)
  }

  /// Finishes the write half; later calls are no-ops
  pub async fn close(&self) -> Result<(), StreamError> {
    if self.closed.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    let mut writer = self.writer.lock().await;
    Ok(writer.shutdown().await?)
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }
}

impl<M: Message> std::fmt::Debug for FrameStream<M> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FrameStream")
      .field("id", &self.id)
      .field("protocol", &self.protocol.get().map(|p| p.name().to_string()))
      .field("closed", &self.is_closed())
      .finish()
  }
}
