// (C) Copyright 2020 Hewlett Packard Enterprise Development LP

extern crate chrono;
#[macro_use] extern crate lazy_static;
extern crate rand;
extern crate regex;
extern crate reqwest;
extern crate serde;
extern crate serde_json;
#[macro_use] extern crate simple_error;
extern crate structopt;
extern crate subprocess;
extern crate tracing;
extern crate tracing_subscriber;

#[cfg(test)] #[macro_use] extern crate spectral;

use std::error::Error;
use std::process;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

mod cluster;
mod collect;
mod config;
mod entry;
mod follow;
mod render;

use cluster::KubernetesCluster;
use config::Config;
use entry::EntryConverter;
use follow::{FollowOpts, Follower, DEFAULT_RETRY_INTERVAL};

fn main() -> Result<(), Box<dyn Error>> {
  let config = Config::from_args();

  // diagnostics go to stderr so they never mix with log output
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      EnvFilter::try_from_env("LJ_LOG")
        .unwrap_or_else(|_| EnvFilter::new("lumberjack=info"))
    )
    .init();

  if config.resources.is_empty() {
    eprintln!(
      "{}\n\n{}",
      "error: no workloads selected, pass at least one kind/name selector",
      "For more information, see --help"
    );

    process::exit(1);
  }

  let namespace = match &config.kubernetes.namespace {
    Some(namespace) => namespace.clone(),
    None => KubernetesCluster::default_namespace()?
  };

  let cluster = Arc::new(KubernetesCluster::connect(config.kubernetes.port)?);

  let (entry_tx, entry_rx) = channel();
  let renderer = render::plain_renderer(entry_rx);
  let convert: EntryConverter<String> = Arc::new(render::render_record);

  if config.follow {
    let retry_interval = config.retry_interval
      .map(Duration::from_secs)
      .unwrap_or(DEFAULT_RETRY_INTERVAL);

    let follower = Follower::start(
      cluster,
      &namespace,
      config.resources.clone(),
      FollowOpts {
        tail: config.tail,
        since: config.since,
        limit_bytes: config.limit_bytes
      },
      retry_interval,
      convert,
      entry_tx
    );

    // follows until the process is interrupted; streams are cleaned up by
    // the OS on exit
    follower.wait();
  } else {
    collect::collect_logs(
      cluster.as_ref(),
      &namespace,
      &config.resources,
      config.tail,
      config.since,
      convert,
      &entry_tx
    )?;

    drop(entry_tx);
    renderer.join().expect("renderer thread did not exit cleanly");
  }

  Ok(())
}
