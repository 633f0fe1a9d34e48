// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use arc_swap::ArcSwap;
use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  sync::Mutex,
};

use crate::common::{
  protocol::{
    message::{DataMessage, Message},
    router::RawRouter,
  },
  stream::{StreamError, StreamId},
  transport::{BoxedReader, BoxedWriter, Link},
};

type RouterList<M> = Vec<Arc<dyn RawRouter<M>>>;

/// An unframed byte sub-stream
///
/// Reads and writes each take their own lock, so one task may read while
/// others write. Routers bound here are consulted, in binding order, for every
/// chunk the connection reads from the stream.
pub struct RawStream<M: Message = DataMessage> {
  id: StreamId,
  reader: Mutex<BoxedReader>,
  writer: Mutex<BoxedWriter>,
  routers: ArcSwap<RouterList<M>>,
  closed: AtomicBool,
}

impl<M: Message> RawStream<M> {
  pub fn new(link: Link) -> Self {
    let (id, reader, writer) = link.into_parts();
    Self {
      id,
      reader: Mutex::new(reader),
      writer: Mutex::new(writer),
      routers: ArcSwap::from_pointee(Vec::new()),
      closed: AtomicBool::new(false),
    }
  }

  pub fn id(&self) -> StreamId {
    self.id
  }

  pub fn bind_router(&self, router: Arc<dyn RawRouter<M>>) {
    self.routers.rcu(|routers| {
      let mut routers = RouterList::clone(routers);
      routers.push(router.clone());
      routers
    });
  }

  pub fn bind_routers<I>(&self, routers: I)
  where
    I: IntoIterator<Item = Arc<dyn RawRouter<M>>>,
  {
    let added = routers.into_iter().collect::<Vec<_>>();
    if added.is_empty() {
      return;
    }
    self.routers.rcu(|routers| {
      let mut routers = RouterList::clone(routers);
      routers.extend(added.iter().cloned());
      routers
    });
  }

  /// Snapshot of the bound routers, in binding order
  pub fn routers(&self) -> Arc<RouterList<M>> {
    self.routers.load_full()
  }

  /// Reads whatever is available; `Ok(0)` means the peer finished the stream
  pub async fn read(&self, buffer: &mut [u8]) -> Result<usize, StreamError> {
    let mut reader = self.reader.lock().await;
    Ok(reader.read(buffer).await?)
  }

  pub async fn read_exact(&self, buffer: &mut [u8]) -> Result<(), StreamError> {
    let mut reader = self.reader.lock().await;
    reader.read_exact(buffer).await?;
    Ok(())
  }

  pub async fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
    self.ensure_open()?;
    let mut writer = self.writer.lock().await;
    let written = writer.write(data).await?;
    writer.flush().await?;
    Ok(written)
  }

  pub async fn write_all(&self, data: &[u8]) -> Result<(), StreamError> {
    self.ensure_open()?;
    let mut writer = self.writer.lock().await;
    writer.write_all(data).await?;
    Ok(writer.flush().await?)
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

  fn ensure_open(&self) -> Result<(), StreamError> {
    if self.is_closed() {
      Err(StreamError::Closed(self.id))
    } else {
      Ok(())
    }
  }
}

impl<M: Message> std::fmt::Debug for RawStream<M> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RawStream")
      .field("id", &self.id)
      .field("routers", &self.routers.load().len())
      .field("closed", &self.is_closed())
      .finish()
  }
}
