// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::util::framed::TAG_SIZE;

/// An Ack frame: its tag plus the request tag it answers
const MIN_FRAME_LENGTH: usize = TAG_SIZE + 1;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("Failed reading configuration: {0}")]
  Io(#[from] std::io::Error),
  #[error("Failed parsing configuration: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("Invalid configuration: {0}")]
  Invalid(String),
}

/// What a connection does when one of its sub-streams fails to read
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamFailurePolicy {
  /// Remove and close only the failed sub-stream
  #[default]
  CloseStream,
  /// Tear down the whole connection
  CloseConnection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
  /// Pending stream requests per kind before the control stream stops being read
  pub request_queue_capacity: usize,
  /// Upper bound on one stream negotiation, from request to acknowledgement
  pub open_timeout: Duration,
  /// Largest chunk handed to raw routers in one request
  pub read_buffer_size: usize,
  pub max_frame_length: Option<usize>,
  pub stream_failure_policy: StreamFailurePolicy,
}

impl Default for ConnectionConfig {
  fn default() -> Self {
    Self {
      request_queue_capacity: 10,
      open_timeout: Duration::from_secs(10),
      read_buffer_size: 4096,
      max_frame_length: Some(16 * 1024 * 1024),
      stream_failure_policy: StreamFailurePolicy::CloseStream,
    }
  }
}

impl ConnectionConfig {
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.request_queue_capacity == 0 {
      return Err(ConfigError::Invalid(
        "request_queue_capacity must be at least 1".into(),
      ));
    }
    if self.read_buffer_size == 0 {
      return Err(ConfigError::Invalid(
        "read_buffer_size must be at least 1".into(),
      ));
    }
    if self.open_timeout.is_zero() {
      return Err(ConfigError::Invalid("open_timeout must be non-zero".into()));
    }
    if let Some(max_frame_length) = self.max_frame_length {
      if max_frame_length < MIN_FRAME_LENGTH {
        return Err(ConfigError::Invalid(format!(
          "max_frame_length must be at least {} to carry stream acknowledgements",
          MIN_FRAME_LENGTH
        )));
      }
    }
    Ok(())
  }
}

/// QUIC transport parameters shared by servers and clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
  pub max_idle_timeout: Duration,
  pub keep_alive_interval: Option<Duration>,
  pub max_concurrent_bidi_streams: u32,
  pub stream_receive_window: u32,
  pub receive_window: u32,
}

impl Default for TransportSettings {
  fn default() -> Self {
    Self {
      max_idle_timeout: Duration::from_secs(5),
      keep_alive_interval: Some(Duration::from_secs(2)),
      max_concurrent_bidi_streams: 1000,
      stream_receive_window: 2 * 1024 * 1024,
      receive_window: 2 * 1024 * 1024,
    }
  }
}

impl TransportSettings {
  pub fn to_quinn(&self) -> Result<quinn::TransportConfig, ConfigError> {
    let idle_timeout = quinn::IdleTimeout::try_from(self.max_idle_timeout).map_err(|_| {
      ConfigError::Invalid(format!(
        "max_idle_timeout of {:?} is out of range",
        self.max_idle_timeout
      ))
    })?;
    let mut config = quinn::TransportConfig::default();
    config
      .max_idle_timeout(Some(idle_timeout))
      .keep_alive_interval(self.keep_alive_interval)
      .max_concurrent_bidi_streams(quinn::VarInt::from_u32(self.max_concurrent_bidi_streams))
      .stream_receive_window(quinn::VarInt::from_u32(self.stream_receive_window))
      .receive_window(quinn::VarInt::from_u32(self.receive_window));
    Ok(config)
  }
}

/// File-level configuration: connection behaviour plus transport parameters
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DollopConfig {
  pub connection: ConnectionConfig,
  pub transport: TransportSettings,
}

impl DollopConfig {
  pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_json::from_str(source)?;
    config.connection.validate()?;
    Ok(config)
  }

  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let source = std::fs::read_to_string(path)?;
    Self::from_json_str(&source)
  }
}
