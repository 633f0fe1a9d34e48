// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Argument validators for the command line front-end
//!
//! Each `validate_*` loads its input the way the endpoint will later, so a
//! bad certificate or config is reported before any socket is bound.

use anyhow::{Context, Result};
use std::{net::SocketAddr, path::Path};

use super::tls;
use crate::common::config::DollopConfig;

pub fn validate_certificate_file(v: &str) -> Result<(), String> {
  tls::load_certificates(Path::new(v))
    .map(|_| ())
    .map_err(|e| e.to_string())
}

pub fn validate_private_key_file(v: &str) -> Result<(), String> {
  tls::load_private_key(Path::new(v))
    .map(|_| ())
    .map_err(|e| e.to_string())
}

pub fn validate_config_file(v: &str) -> Result<(), String> {
  DollopConfig::from_json_file(v)
    .map(|_| ())
    .map_err(|e| e.to_string())
}

/// Resolves `host:port`, taking the first address the resolver yields
pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  v.to_socket_addrs()
    .with_context(|| format!("Could not resolve {:?}", v))?
    .next()
    .with_context(|| format!("No addresses were resolved for {:?}", v))
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}
