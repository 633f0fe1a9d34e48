// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod framed;
pub mod tls;
pub mod validators;

/// ALPN protocol name negotiated by dollop endpoints
pub const ALPN_DOLLOP: &[u8] = b"dollop";
