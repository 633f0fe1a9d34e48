// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

pub mod frame;
pub mod raw;

pub use self::{frame::FrameStream, raw::RawStream};

use crate::util::framed::{ReadError, WriteError};

/// Transport-assigned identifier of a sub-stream, unique within its connection
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct StreamId(i64);

impl StreamId {
  pub fn new(inner: i64) -> StreamId {
    Self(inner)
  }

  pub fn inner(&self) -> i64 {
    self.0
  }
}

impl From<i64> for StreamId {
  fn from(inner: i64) -> Self {
    Self::new(inner)
  }
}

impl From<StreamId> for i64 {
  fn from(id: StreamId) -> Self {
    id.inner()
  }
}

impl std::fmt::Debug for StreamId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("StreamId").field(&self.0).finish()
  }
}

impl std::fmt::Display for StreamId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum StreamKind {
  Raw,
  Frame,
}

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
  #[error("Stream {0} is closed")]
  Closed(StreamId),
  #[error("Stream I/O failure: {0}")]
  Io(#[from] std::io::Error),
  #[error("Stream frame read failure: {0}")]
  Read(#[from] ReadError),
  #[error("Stream frame write failure: {0}")]
  Write(#[from] WriteError),
}

impl StreamError {
  /// True when the peer finished the stream without error
  pub fn is_end_of_stream(&self) -> bool {
    match self {
      StreamError::Read(read) => read.is_end_of_stream(),
      _ => false,
    }
  }
}
