// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Tagged, length-delimited frames
//!
//! Wire layout: `| length: u32 BE | tag: u8 | payload: length - 1 bytes |`.
//! The tag byte is counted in the length, so a well-formed frame never
//! declares a length of zero.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const LENGTH_PREFIX_SIZE: usize = std::mem::size_of::<u32>();
pub const TAG_SIZE: usize = std::mem::size_of::<u8>();

pub type FrameTag = u8;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Frame {
  tag: FrameTag,
  payload: Bytes,
}

impl Frame {
  pub fn new(tag: FrameTag, payload: impl Into<Bytes>) -> Self {
    Self {
      tag,
      payload: payload.into(),
    }
  }

  pub fn tag(&self) -> FrameTag {
    self.tag
  }

  pub fn payload(&self) -> &Bytes {
    &self.payload
  }

  pub fn into_parts(self) -> (FrameTag, Bytes) {
    (self.tag, self.payload)
  }

  /// Value of the length prefix this frame is written with
  pub fn wire_length(&self) -> usize {
    TAG_SIZE + self.payload.len()
  }

  pub fn encode(&self) -> Result<Bytes, WriteError> {
    encode(self.tag, &self.payload)
  }
}

impl std::fmt::Debug for Frame {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Frame")
      .field("tag", &format_args!("{:#04x}", self.tag))
      .field("payload_len", &self.payload.len())
      .finish()
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  LengthSpecifier,
  /// Part of the length prefix arrived
  LengthRemainder { received: usize },
  Content { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Frame length exceeded expectation of {expected} bytes with {received}")]
  MaxLengthExceeded { expected: usize, received: usize },
  #[error("Stream ended before the frame completed; expected {expected:?}")]
  ShortRead {
    expected: NextExpected,
    #[source]
    error: std::io::Error,
  },
  #[error("Frame declared a length of zero and carries no tag")]
  EmptyFrame,
}

impl ReadError {
  /// True when the peer finished the stream cleanly between two frames
  pub fn is_end_of_stream(&self) -> bool {
    matches!(
      self,
      ReadError::ShortRead {
        expected: NextExpected::LengthSpecifier,
        error,
      } if error.kind() == std::io::ErrorKind::UnexpectedEof
    )
  }
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
  #[error("Frame write failure: {0:?}")]
  UnexpectedEnd(#[from] std::io::Error),
  #[error("Frame of {0} bytes cannot be described by a u32 length prefix")]
  TooLarge(usize),
}

pub fn encode(tag: FrameTag, payload: &[u8]) -> Result<Bytes, WriteError> {
  let length = TAG_SIZE + payload.len();
  let prefix = u32::try_from(length).map_err(|_| WriteError::TooLarge(length))?;
  let mut buffer = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + length);
  buffer.put_u32(prefix);
  buffer.put_u8(tag);
  buffer.put_slice(payload);
  Ok(buffer.freeze())
}

/// Reads exactly one frame
///
/// Either a whole frame is returned or an error is; a partially received
/// frame is never surfaced to the caller.
pub async fn read_frame<T: AsyncRead + Unpin>(
  mut s: T,
  max_length: Option<usize>,
) -> Result<Frame, ReadError> {
  let length = read_length(&mut s).await?;
  if length == 0 {
    return Err(ReadError::EmptyFrame);
  }
  if let Some(max_length) = max_length {
    if length > max_length {
      return Err(ReadError::MaxLengthExceeded {
        expected: max_length,
        received: length,
      });
    }
  }
  let mut buffer = BytesMut::zeroed(length);
  s.read_exact(&mut buffer)
    .await
    .map_err(|error| ReadError::ShortRead {
      expected: NextExpected::Content { length },
      error,
    })?;
  let mut content = buffer.freeze();
  let payload = content.split_off(TAG_SIZE);
  Ok(Frame {
    tag: content[0],
    payload,
  })
}

/// Reads the length prefix; only a stream ending before its first byte is a clean end
async fn read_length<T: AsyncRead + Unpin>(s: &mut T) -> Result<usize, ReadError> {
  let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
  let mut received = 0;
  while received < LENGTH_PREFIX_SIZE {
    let expected = match received {
      0 => NextExpected::LengthSpecifier,
      received => NextExpected::LengthRemainder { received },
    };
    match s.read(&mut prefix[received..]).await {
      Ok(0) => {
        return Err(ReadError::ShortRead {
          expected,
          error: std::io::ErrorKind::UnexpectedEof.into(),
        })
      }
      Ok(read) => received += read,
      Err(error) => return Err(ReadError::ShortRead { expected, error }),
    }
  }
  Ok(u32::from_be_bytes(prefix) as usize)
}

/// Writes a whole frame in one `write_all` and flushes it
pub async fn write_frame<T: AsyncWrite + Unpin>(mut s: T, frame: &Frame) -> Result<(), WriteError> {
  let buffer = frame.encode()?;
  s.write_all(&buffer).await?;
  Ok(s.flush().await?)
}
