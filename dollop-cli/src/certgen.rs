// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Error as AnyErr, Result};
use std::path::{Path, PathBuf};
use tracing::instrument;

fn sibling(path: &Path, suffix: &str) -> Result<PathBuf> {
  let name = path
    .file_name()
    .and_then(|name| name.to_str())
    .ok_or_else(|| AnyErr::msg("Certificate path must end in a UTF-8 file name"))?;
  Ok(path.with_file_name(format!("{}{}", name, suffix)))
}

/// Writes `<path>.pub.pem` and `<path>.priv.pem` for a certificate naming `host_san`
#[instrument]
pub async fn certgen_main(output_base_path: String, host_san: String) -> Result<()> {
  use std::fs;
  let path = PathBuf::from(output_base_path);
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).context("Directory creation must succeed for certs")?;
  }
  let cert =
    rcgen::generate_simple_self_signed(vec![host_san]).context("Certificate generation failed")?;
  let public_pem = cert.serialize_pem()?;
  let private_pem = cert.serialize_private_key_pem();
  fs::write(sibling(&path, ".pub.pem")?, &public_pem).context("Failed writing public key")?;
  fs::write(sibling(&path, ".priv.pem")?, &private_pem).context("Failed writing private key")?;
  tracing::info!(path = ?path, "certificate written");
  Ok(())
}
