// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! TLS configuration for dollop endpoints
//!
//! Certificates and keys are read from PEM files. A server without a
//! certificate gets a freshly generated self-signed one.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::SystemTime,
};

use rustls::{
  client::{ServerCertVerified, ServerCertVerifier},
  server::AllowAnyAuthenticatedClient,
  Certificate, PrivateKey, RootCertStore, ServerName,
};

use super::ALPN_DOLLOP;

#[derive(thiserror::Error, Debug)]
pub enum SecurityError {
  #[error("Failed reading {path:?}: {error}")]
  Io {
    path: PathBuf,
    #[source]
    error: std::io::Error,
  },
  #[error("No certificates found in {0:?}")]
  NoCertificates(PathBuf),
  #[error("No private key found in {0:?}")]
  NoPrivateKey(PathBuf),
  #[error("Certificate generation failed: {0}")]
  Generation(#[from] rcgen::RcgenError),
  #[error("Invalid TLS configuration: {0}")]
  Tls(#[from] rustls::Error),
  #[error("Failed loading platform trust roots: {0}")]
  NativeRoots(#[source] std::io::Error),
}

fn read_pem(path: &Path) -> Result<Vec<rustls_pemfile::Item>, SecurityError> {
  let io_error = |error| SecurityError::Io {
    path: path.to_path_buf(),
    error,
  };
  let file = std::fs::File::open(path).map_err(io_error)?;
  rustls_pemfile::read_all(&mut std::io::BufReader::new(file)).map_err(io_error)
}

/// Loads every certificate in a PEM file, in file order
pub fn load_certificates(path: &Path) -> Result<Vec<Certificate>, SecurityError> {
  let certificates = read_pem(path)?
    .into_iter()
    .filter_map(|item| match item {
      rustls_pemfile::Item::X509Certificate(der) => Some(Certificate(der)),
      _ => None,
    })
    .collect::<Vec<_>>();
  if certificates.is_empty() {
    return Err(SecurityError::NoCertificates(path.to_path_buf()));
  }
  Ok(certificates)
}

/// Loads the first PKCS#8, PKCS#1, or SEC1 private key in a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKey, SecurityError> {
  read_pem(path)?
    .into_iter()
    .find_map(|item| match item {
      rustls_pemfile::Item::PKCS8Key(der)
      | rustls_pemfile::Item::RSAKey(der)
      | rustls_pemfile::Item::ECKey(der) => Some(PrivateKey(der)),
      _ => None,
    })
    .ok_or_else(|| SecurityError::NoPrivateKey(path.to_path_buf()))
}

/// Generates a self-signed certificate valid for `localhost` and `host`
pub fn generate_self_signed(host: &str) -> Result<(Vec<Certificate>, PrivateKey), SecurityError> {
  let mut names = vec![String::from("localhost")];
  if !host.is_empty() && host != "localhost" {
    names.push(host.to_string());
  }
  let cert = rcgen::generate_simple_self_signed(names)?;
  let der = cert.serialize_der()?;
  Ok((
    vec![Certificate(der)],
    PrivateKey(cert.serialize_private_key_der()),
  ))
}

fn load_identity(
  cert_path: Option<&Path>,
  key_path: Option<&Path>,
) -> Result<Option<(Vec<Certificate>, PrivateKey)>, SecurityError> {
  match (cert_path, key_path) {
    (Some(cert_path), Some(key_path)) => Ok(Some((
      load_certificates(cert_path)?,
      load_private_key(key_path)?,
    ))),
    _ => Ok(None),
  }
}

/// Builds the TLS configuration of a listening endpoint
///
/// Without both a certificate and a key, a self-signed certificate for `host`
/// is generated. Unless `skip_verify` is set, clients must present a
/// certificate issued by the server's own chain.
#[tracing::instrument(level = "debug", skip_all, fields(host = host), err)]
pub fn create_server_config(
  host: &str,
  cert_path: Option<&Path>,
  key_path: Option<&Path>,
  skip_verify: bool,
) -> Result<rustls::ServerConfig, SecurityError> {
  let (chain, key) = match load_identity(cert_path, key_path)? {
    Some(identity) => identity,
    None => {
      tracing::info!("no certificate configured, generating a self-signed certificate");
      generate_self_signed(host)?
    }
  };
  let builder = rustls::ServerConfig::builder().with_safe_defaults();
  let mut config = if skip_verify {
    builder.with_no_client_auth().with_single_cert(chain, key)?
  } else {
    let mut roots = RootCertStore::empty();
    let ders = chain.iter().map(|cert| cert.0.clone()).collect::<Vec<_>>();
    let (added, ignored) = roots.add_parsable_certificates(&ders);
    tracing::debug!(added, ignored, "client authorities loaded");
    builder
      .with_client_cert_verifier(AllowAnyAuthenticatedClient::new(roots).boxed())
      .with_single_cert(chain, key)?
  };
  config.alpn_protocols = vec![ALPN_DOLLOP.to_vec()];
  Ok(config)
}

/// Builds the TLS configuration of a connecting endpoint
///
/// With `skip_verify`, any server certificate is accepted; otherwise the
/// platform trust roots apply. A client certificate is presented when both
/// paths are given.
#[tracing::instrument(level = "debug", skip_all, err)]
pub fn create_client_config(
  cert_path: Option<&Path>,
  key_path: Option<&Path>,
  skip_verify: bool,
) -> Result<rustls::ClientConfig, SecurityError> {
  let identity = load_identity(cert_path, key_path)?;
  let builder = rustls::ClientConfig::builder().with_safe_defaults();
  let mut config = if skip_verify {
    tracing::warn!("server certificate verification is disabled");
    let builder = builder.with_custom_certificate_verifier(Arc::new(SkipServerVerification));
    match identity {
      Some((chain, key)) => builder.with_client_auth_cert(chain, key)?,
      None => builder.with_no_client_auth(),
    }
  } else {
    let builder = builder.with_root_certificates(native_roots()?);
    match identity {
      Some((chain, key)) => builder.with_client_auth_cert(chain, key)?,
      None => builder.with_no_client_auth(),
    }
  };
  config.alpn_protocols = vec![ALPN_DOLLOP.to_vec()];
  Ok(config)
}

fn native_roots() -> Result<RootCertStore, SecurityError> {
  let certs = rustls_native_certs::load_native_certs().map_err(SecurityError::NativeRoots)?;
  let ders = certs.into_iter().map(|cert| cert.0).collect::<Vec<_>>();
  let mut roots = RootCertStore::empty();
  let (added, ignored) = roots.add_parsable_certificates(&ders);
  tracing::trace!(added, ignored, "platform trust roots loaded");
  Ok(roots)
}

/// Accepts any server certificate
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
  fn verify_server_cert(
    &self,
    _end_entity: &Certificate,
    _intermediates: &[Certificate],
    _server_name: &ServerName,
    _scts: &mut dyn Iterator<Item = &[u8]>,
    _ocsp_response: &[u8],
    _now: SystemTime,
  ) -> Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }
}
