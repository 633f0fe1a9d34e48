// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Typed messages and the per-stream protocol registry
//!
//! A [`MessageProtocol`] maps each frame tag to a decoder producing a typed
//! message, and to the [`FrameRouter`] handling messages of that tag. It is
//! constructed explicitly and bound once per frame stream; no process-wide
//! registry exists.

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use bytes::Bytes;

use crate::{
  common::{
    protocol::router::FrameRouter,
    stream::{StreamError, StreamId},
  },
  util::framed::{Frame, FrameTag},
};

pub type MessageTag = FrameTag;

/// A protocol-level message, carried in exactly one frame
pub trait Message: Send + Sync + std::fmt::Debug + 'static {
  fn tag(&self) -> MessageTag;

  fn payload(&self) -> Bytes;

  fn to_frame(&self) -> Frame {
    Frame::new(self.tag(), self.payload())
  }
}

pub type Decoder<M> = Arc<dyn Fn(Bytes) -> Result<M, MessageError> + Send + Sync>;

type RouteTable<M> = HashMap<MessageTag, Arc<dyn FrameRouter<M>>>;

#[derive(thiserror::Error, Debug)]
pub enum MessageError {
  #[error("Unknown message type {0:#04x}")]
  UnknownMessageType(MessageTag),
  #[error("No router bound for message type {0:#04x}")]
  NoRouterBound(MessageTag),
  #[error("No message protocol bound to stream {0}")]
  ProtocolNotBound(StreamId),
  #[error("A message protocol is already bound to stream {0}")]
  ProtocolAlreadyBound(StreamId),
  #[error("Malformed message of type {tag:#04x}: {reason}")]
  Malformed { tag: MessageTag, reason: String },
  #[error(transparent)]
  Stream(#[from] StreamError),
}

impl MessageError {
  /// Tag of the offending frame, when the error concerns one
  pub fn tag(&self) -> Option<MessageTag> {
    match self {
      MessageError::UnknownMessageType(tag)
      | MessageError::NoRouterBound(tag)
      | MessageError::Malformed { tag, .. } => Some(*tag),
      _ => None,
    }
  }
}

pub struct MessageProtocol<M: Message = DataMessage> {
  name: String,
  version: String,
  decoders: HashMap<MessageTag, Decoder<M>>,
  routes: ArcSwap<RouteTable<M>>,
}

impl<M: Message> MessageProtocol<M> {
  pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      version: version.into(),
      decoders: HashMap::new(),
      routes: ArcSwap::from_pointee(HashMap::new()),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn with_decoder<F>(mut self, tag: MessageTag, decoder: F) -> Self
  where
    F: Fn(Bytes) -> Result<M, MessageError> + Send + Sync + 'static,
  {
    self.add_decoder(tag, decoder);
    self
  }

  /// Registers the decoder for `tag`, replacing any previous one
  pub fn add_decoder<F>(&mut self, tag: MessageTag, decoder: F)
  where
    F: Fn(Bytes) -> Result<M, MessageError> + Send + Sync + 'static,
  {
    self.decoders.insert(tag, Arc::new(decoder));
  }

  pub fn with_route(self, tag: MessageTag, router: Arc<dyn FrameRouter<M>>) -> Self {
    self.add_route(tag, router);
    self
  }

  /// Registers or replaces the router for `tag`
  ///
  /// Safe while the protocol is bound and in use; readers observe either the
  /// previous table or the new one.
  pub fn add_route(&self, tag: MessageTag, router: Arc<dyn FrameRouter<M>>) {
    self.routes.rcu(|routes| {
      let mut routes = RouteTable::clone(routes);
      routes.insert(tag, router.clone());
      routes
    });
  }

  pub fn remove_route(&self, tag: MessageTag) -> Option<Arc<dyn FrameRouter<M>>> {
    let previous = self.routes.rcu(|routes| {
      let mut routes = RouteTable::clone(routes);
      routes.remove(&tag);
      routes
    });
    previous.get(&tag).cloned()
  }

  pub fn knows(&self, tag: MessageTag) -> bool {
    self.decoders.contains_key(&tag)
  }

  pub fn parse_message(&self, frame: Frame) -> Result<M, MessageError> {
    let (tag, payload) = frame.into_parts();
    let decoder = self
      .decoders
      .get(&tag)
      .ok_or(MessageError::UnknownMessageType(tag))?;
    (decoder.as_ref())(payload)
  }

  pub fn router(&self, tag: MessageTag) -> Result<Arc<dyn FrameRouter<M>>, MessageError> {
    self
      .routes
      .load()
      .get(&tag)
      .cloned()
      .ok_or(MessageError::NoRouterBound(tag))
  }
}

impl<M: Message> std::fmt::Debug for MessageProtocol<M> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut tags = self.decoders.keys().copied().collect::<Vec<_>>();
    tags.sort_unstable();
    f.debug_struct("MessageProtocol")
      .field("name", &self.name)
      .field("version", &self.version)
      .field("tags", &tags)
      .finish_non_exhaustive()
  }
}

pub const DATA_MESSAGE_TAG: MessageTag = 0x01;

/// The single message kind of the basic data protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
  payload: Bytes,
}

impl DataMessage {
  pub fn new(payload: impl Into<Bytes>) -> Self {
    Self {
      payload: payload.into(),
    }
  }

  pub fn data(&self) -> &Bytes {
    &self.payload
  }
}

impl Message for DataMessage {
  fn tag(&self) -> MessageTag {
    DATA_MESSAGE_TAG
  }

  fn payload(&self) -> Bytes {
    self.payload.clone()
  }
}

impl MessageProtocol<DataMessage> {
  /// Data messages under tag `0x01`, with no routes bound
  pub fn basic() -> Self {
    Self::new("basic", "v0").with_decoder(DATA_MESSAGE_TAG, |payload| Ok(DataMessage::new(payload)))
  }
}
