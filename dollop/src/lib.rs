// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Stream multiplexing over a single QUIC connection
//!
//! A connection carries one control stream, used to negotiate sub-streams,
//! plus any number of raw byte streams and length-prefixed frame streams.
//! Inbound data is handed to routers bound to each stream.

pub mod common;
pub mod util;

pub mod client;
pub mod server;

pub use common::{
  config::{ConnectionConfig, DollopConfig, StreamFailurePolicy, TransportSettings},
  connection::{
    ClientConnection, CloseReason, Connection, ConnectionError, ConnectionEvent, ConnectionState,
    ServerConnection,
  },
  protocol::{
    message::{DataMessage, Message, MessageProtocol},
    router::{FrameRequest, FrameRouter, RawRequest, RawRouter},
  },
  stream::{FrameStream, RawStream, StreamId, StreamKind},
};
