// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Messages carried on frame streams and the routers that consume them
//!
//! The control protocol negotiates sub-streams; application protocols map
//! message tags to decoders and frame routers.

pub mod control;
pub mod message;
pub mod router;

pub use message::{Message, MessageError, MessageProtocol, MessageTag};
pub use router::{FrameRouter, RawRouter};
