// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The control protocol, spoken on the first stream of every connection

use bytes::Bytes;

use crate::common::{
  protocol::message::{Message, MessageProtocol, MessageTag},
  stream::{FrameStream, StreamKind},
};

pub const REQUEST_RAW_STREAM_TAG: MessageTag = 0x01;
pub const REQUEST_FRAME_STREAM_TAG: MessageTag = 0x02;
pub const ACK_STREAM_TAG: MessageTag = 0x03;
pub const REJECT_STREAM_TAG: MessageTag = 0x04;

pub type ControlStream = FrameStream<ControlMessage>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
  RequestRawStream(Bytes),
  RequestFrameStream(Bytes),
  /// First unit written on a newly opened sub-stream; carries the answered request tag
  AckStream(Bytes),
  /// Sent on the control stream when a requested sub-stream could not be opened
  RejectStream(Bytes),
}

impl ControlMessage {
  pub fn request_for(kind: StreamKind, payload: impl Into<Bytes>) -> Self {
    match kind {
      StreamKind::Raw => Self::RequestRawStream(payload.into()),
      StreamKind::Frame => Self::RequestFrameStream(payload.into()),
    }
  }

  pub fn ack_for(kind: StreamKind) -> Self {
    Self::AckStream(Bytes::from_static(request_tag_bytes(kind)))
  }

  pub fn reject_for(kind: StreamKind) -> Self {
    Self::RejectStream(Bytes::from_static(request_tag_bytes(kind)))
  }

  /// The sub-stream kind this message asks for, if it is a request
  pub fn requested_kind(&self) -> Option<StreamKind> {
    match self {
      Self::RequestRawStream(_) => Some(StreamKind::Raw),
      Self::RequestFrameStream(_) => Some(StreamKind::Frame),
      Self::AckStream(_) | Self::RejectStream(_) => None,
    }
  }

  /// The sub-stream kind an Ack or Reject answers, when its payload names one
  pub fn answered_kind(&self) -> Option<StreamKind> {
    match self {
      Self::AckStream(payload) | Self::RejectStream(payload) => {
        payload.first().copied().and_then(kind_for_request_tag)
      }
      Self::RequestRawStream(_) | Self::RequestFrameStream(_) => None,
    }
  }
}

pub fn request_tag(kind: StreamKind) -> MessageTag {
  match kind {
    StreamKind::Raw => REQUEST_RAW_STREAM_TAG,
    StreamKind::Frame => REQUEST_FRAME_STREAM_TAG,
  }
}

pub fn kind_for_request_tag(tag: MessageTag) -> Option<StreamKind> {
  match tag {
    REQUEST_RAW_STREAM_TAG => Some(StreamKind::Raw),
    REQUEST_FRAME_STREAM_TAG => Some(StreamKind::Frame),
    _ => None,
  }
}

fn request_tag_bytes(kind: StreamKind) -> &'static [u8] {
  match kind {
    StreamKind::Raw => &[REQUEST_RAW_STREAM_TAG],
    StreamKind::Frame => &[REQUEST_FRAME_STREAM_TAG],
  }
}

impl Message for ControlMessage {
  fn tag(&self) -> MessageTag {
    match self {
      Self::RequestRawStream(_) => REQUEST_RAW_STREAM_TAG,
      Self::RequestFrameStream(_) => REQUEST_FRAME_STREAM_TAG,
      Self::AckStream(_) => ACK_STREAM_TAG,
      Self::RejectStream(_) => REJECT_STREAM_TAG,
    }
  }

  fn payload(&self) -> Bytes {
    match self {
      Self::RequestRawStream(payload)
      | Self::RequestFrameStream(payload)
      | Self::AckStream(payload)
      | Self::RejectStream(payload) => payload.clone(),
    }
  }
}

/// Builds the control protocol; it has decoders only, as control messages are
/// classified by the connection rather than routed
pub fn control_protocol() -> MessageProtocol<ControlMessage> {
  MessageProtocol::new("control", "v0")
    .with_decoder(REQUEST_RAW_STREAM_TAG, |payload| {
      Ok(ControlMessage::RequestRawStream(payload))
    })
    .with_decoder(REQUEST_FRAME_STREAM_TAG, |payload| {
      Ok(ControlMessage::RequestFrameStream(payload))
    })
    .with_decoder(ACK_STREAM_TAG, |payload| Ok(ControlMessage::AckStream(payload)))
    .with_decoder(REJECT_STREAM_TAG, |payload| {
      Ok(ControlMessage::RejectStream(payload))
    })
}
