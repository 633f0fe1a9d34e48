// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{
  sync::atomic::{AtomicU64, Ordering},
  time::SystemTime,
};

/// Identifies a connection within the endpoint that created it
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
  pub fn new(inner: u64) -> ConnectionId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl From<u64> for ConnectionId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl std::fmt::Display for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "conn-{}", self.0)
  }
}

/// Hands out increasing connection ids; shared by every accept or connect of one endpoint
#[derive(Debug, Default)]
pub struct ConnectionIds {
  next: AtomicU64,
}

impl ConnectionIds {
  pub fn starting_at(first: u64) -> Self {
    Self {
      next: AtomicU64::new(first),
    }
  }

  /// Starts at the current unix time in milliseconds, so restarted endpoints
  /// do not reuse the ids of an earlier run
  pub fn from_clock() -> Self {
    let first = SystemTime::now()
      .duration_since(SystemTime::UNIX_EPOCH)
      .map(|elapsed| elapsed.as_millis() as u64)
      .unwrap_or_default();
    Self::starting_at(first)
  }

  pub fn next(&self) -> ConnectionId {
    ConnectionId::new(self.next.fetch_add(1, Ordering::Relaxed))
  }
}
