// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Routers and the dispatch pipeline
//!
//! Each inbound unit (a chunk of raw bytes or one decoded message) becomes an
//! owned request handed to a single dispatch task. Routers observe it through
//! three hooks, run in order: `pre_handle`, `handle`, `post_handle`. Every hook
//! defaults to a no-op, so a router overrides only what it needs.
//!
//! Hook failures are collected into a [`DispatchReport`]; they never stop the
//! remaining hooks or routers.

use std::sync::Arc;

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};

use crate::common::{
  connection::Connection,
  protocol::message::{DataMessage, Message},
  stream::{FrameStream, RawStream, StreamId},
};

pub type HookResult = anyhow::Result<()>;

fn no_op<'a>() -> BoxFuture<'a, HookResult> {
  futures::future::ready(Ok(())).boxed()
}

pub trait RawRouter<M: Message = DataMessage>: Send + Sync + 'static {
  fn name(&self) -> &str {
    std::any::type_name::<Self>()
  }

  fn pre_handle<'a>(&'a self, _request: &'a RawRequest<M>) -> BoxFuture<'a, HookResult> {
    no_op()
  }

  fn handle<'a>(&'a self, _request: &'a RawRequest<M>) -> BoxFuture<'a, HookResult> {
    no_op()
  }

  fn post_handle<'a>(&'a self, _request: &'a RawRequest<M>) -> BoxFuture<'a, HookResult> {
    no_op()
  }
}

pub trait FrameRouter<M: Message = DataMessage>: Send + Sync + 'static {
  fn name(&self) -> &str {
    std::any::type_name::<Self>()
  }

  fn pre_handle<'a>(&'a self, _request: &'a FrameRequest<M>) -> BoxFuture<'a, HookResult> {
    no_op()
  }

  fn handle<'a>(&'a self, _request: &'a FrameRequest<M>) -> BoxFuture<'a, HookResult> {
    no_op()
  }

  fn post_handle<'a>(&'a self, _request: &'a FrameRequest<M>) -> BoxFuture<'a, HookResult> {
    no_op()
  }
}

/// A chunk of bytes read from a raw stream
pub struct RawRequest<M: Message = DataMessage> {
  connection: Arc<Connection<M>>,
  stream: Arc<RawStream<M>>,
  data: Bytes,
}

impl<M: Message> RawRequest<M> {
  pub fn new(connection: Arc<Connection<M>>, stream: Arc<RawStream<M>>, data: Bytes) -> Self {
    Self {
      connection,
      stream,
      data,
    }
  }

  pub fn connection(&self) -> &Arc<Connection<M>> {
    &self.connection
  }

  pub fn stream(&self) -> &Arc<RawStream<M>> {
    &self.stream
  }

  pub fn data(&self) -> &Bytes {
    &self.data
  }
}

impl<M: Message> std::fmt::Debug for RawRequest<M> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RawRequest")
      .field("connection", &self.connection.id())
      .field("stream", &self.stream.id())
      .field("data_len", &self.data.len())
      .finish()
  }
}

/// One decoded message read from a frame stream
pub struct FrameRequest<M: Message = DataMessage> {
  connection: Arc<Connection<M>>,
  stream: Arc<FrameStream<M>>,
  message: M,
}

impl<M: Message> FrameRequest<M> {
  pub fn new(connection: Arc<Connection<M>>, stream: Arc<FrameStream<M>>, message: M) -> Self {
    Self {
      connection,
      stream,
      message,
    }
  }

  pub fn connection(&self) -> &Arc<Connection<M>> {
    &self.connection
  }

  pub fn stream(&self) -> &Arc<FrameStream<M>> {
    &self.stream
  }

  pub fn message(&self) -> &M {
    &self.message
  }

  pub fn into_message(self) -> M {
    self.message
  }
}

impl<M: Message> std::fmt::Debug for FrameRequest<M> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FrameRequest")
      .field("connection", &self.connection.id())
      .field("stream", &self.stream.id())
      .field("message", &self.message)
      .finish()
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Hook {
  PreHandle,
  Handle,
  PostHandle,
}

#[derive(Debug)]
pub struct HookFailure {
  pub router: String,
  pub hook: Hook,
  pub error: anyhow::Error,
}

/// Outcome of running one request through its routers
#[derive(Debug, Default)]
pub struct DispatchReport {
  hooks_run: usize,
  failures: Vec<HookFailure>,
}

impl DispatchReport {
  pub fn is_clean(&self) -> bool {
    self.failures.is_empty()
  }

  pub fn hooks_run(&self) -> usize {
    self.hooks_run
  }

  pub fn failures(&self) -> &[HookFailure] {
    &self.failures
  }

  fn record(&mut self, stream: StreamId, router: &str, hook: Hook, result: HookResult) {
    self.hooks_run += 1;
    if let Err(error) = result {
      tracing::warn!(
        stream_id = %stream,
        router = router,
        hook = ?hook,
        error = %error,
        "router hook failed"
      );
      self.failures.push(HookFailure {
        router: router.to_string(),
        hook,
        error,
      });
    }
  }
}

/// Runs every router in registration order, each through all three hooks
pub async fn dispatch_raw<M: Message>(
  routers: &[Arc<dyn RawRouter<M>>],
  request: &RawRequest<M>,
) -> DispatchReport {
  let stream = request.stream().id();
  let mut report = DispatchReport::default();
  for router in routers {
    let name = router.name();
    report.record(stream, name, Hook::PreHandle, router.pre_handle(request).await);
    report.record(stream, name, Hook::Handle, router.handle(request).await);
    report.record(stream, name, Hook::PostHandle, router.post_handle(request).await);
  }
  report
}

pub async fn dispatch_frame<M: Message>(
  router: &dyn FrameRouter<M>,
  request: &FrameRequest<M>,
) -> DispatchReport {
  let stream = request.stream().id();
  let name = router.name();
  let mut report = DispatchReport::default();
  report.record(stream, name, Hook::PreHandle, router.pre_handle(request).await);
  report.record(stream, name, Hook::Handle, router.handle(request).await);
  report.record(stream, name, Hook::PostHandle, router.post_handle(request).await);
  report
}
