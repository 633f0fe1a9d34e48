// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use dollop::util;
use std::path::PathBuf;

use util::validators::{
  parse_socketaddr, validate_certificate_file, validate_config_file, validate_private_key_file,
  validate_socketaddr,
};

mod certgen;
mod client;
mod server;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quinn=warn,quinn_proto=warn,info"));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("client")
        .alias("-c")
        .about("Connect to a dollop server and exchange echoes on a raw and a frame stream")
        .arg(
          Arg::new("addr")
            .long("addr")
            .short('a')
            .validator(validate_socketaddr)
            .takes_value(true)
            .default_value("127.0.0.1:19999"),
        )
        .arg(
          Arg::new("server-name")
            .long("server-name")
            .visible_alias("san")
            .short('s')
            .takes_value(true)
            .default_value("localhost"),
        )
        .arg(
          Arg::new("message")
            .long("message")
            .short('m')
            .takes_value(true)
            .default_value("data from dollop client"),
        )
        .arg(
          Arg::new("cert")
            .long("cert")
            .short('c')
            .validator(validate_certificate_file)
            .takes_value(true)
            .requires("key"),
        )
        .arg(
          Arg::new("key")
            .long("key")
            .short('k')
            .validator(validate_private_key_file)
            .takes_value(true)
            .requires("cert"),
        )
        .arg(
          Arg::new("verify")
            .long("verify")
            .help("Verify the server certificate against the platform trust roots"),
        ),
    )
    .subcommand(
      Command::new("server")
        .alias("-s")
        .about("Run an echo server for raw and frame streams")
        .arg(
          Arg::new("addr")
            .long("addr")
            .short('a')
            .validator(validate_socketaddr)
            .takes_value(true)
            .default_value("127.0.0.1:19999"),
        )
        .arg(
          Arg::new("cert")
            .long("cert")
            .short('c')
            .validator(validate_certificate_file)
            .takes_value(true)
            .requires("key"),
        )
        .arg(
          Arg::new("key")
            .long("key")
            .short('k')
            .validator(validate_private_key_file)
            .takes_value(true)
            .requires("cert"),
        )
        .arg(
          Arg::new("host")
            .long("host")
            .help("Name placed in a generated certificate when no --cert is given")
            .takes_value(true)
            .default_value("localhost"),
        )
        .arg(
          Arg::new("config")
            .long("config")
            .help("JSON file holding connection and transport settings")
            .validator(validate_config_file)
            .takes_value(true),
        )
        .arg(
          Arg::new("require-client-cert")
            .long("require-client-cert")
            .help("Only accept clients presenting a certificate issued by the server's chain"),
        ),
    )
    .subcommand(
      Command::new("cert")
        .about("Generate self-signed certificates for local usage")
        .arg(Arg::new("path").takes_value(true).required(true))
        .arg(
          Arg::new("san")
            .long("san")
            .takes_value(true)
            .required(false)
            .default_value("localhost"),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn optional_path(args: &ArgMatches, name: &str) -> Option<PathBuf> {
  args.value_of(name).map(PathBuf::from)
}

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  Ok(client::ClientArgs {
    addr: parse_socketaddr(args.value_of("addr").unwrap_or_default())?,
    server_name: args.value_of("server-name").unwrap_or("localhost").into(),
    message: args.value_of("message").unwrap_or_default().into(),
    cert: optional_path(args, "cert"),
    key: optional_path(args, "key"),
    verify: args.is_present("verify"),
  })
}

pub fn server_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  Ok(server::ServerArgs {
    addr: parse_socketaddr(args.value_of("addr").unwrap_or_default())?,
    cert: optional_path(args, "cert"),
    key: optional_path(args, "key"),
    host: args.value_of("host").unwrap_or("localhost").into(),
    config: optional_path(args, "config"),
    require_client_cert: args.is_present("require-client-cert"),
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("server", opts) => {
      let config = server_arg_handling(opts)?;
      tracing::info!("Running as server with config {:#?}", config);
      server::server_main(config).await
    }
    ("client", opts) => {
      let config = client_arg_handling(opts)?;
      tracing::info!("Running as client with config {:#?}", config);
      client::client_main(config).await
    }
    ("cert", opts) => {
      tracing::info!("Generating certs...");
      let path_raw = opts.value_of("path").expect("Path argument is required");
      let san = opts.value_of("san").expect("SAN argument must exist");
      certgen::certgen_main(path_raw.into(), san.into()).await
    }
    (_, _) => unreachable!(),
  }
}
