// (C) Copyright 2020 Hewlett Packard Enterprise Development LP

use structopt::StructOpt;

use crate::cluster::{Resource, Since};

/// Kubernetes-specific config
#[derive(Debug, StructOpt)]
#[structopt(rename_all = "kebab-case")]
pub struct KubernetesConfig {
  /// Local kubernetes proxy port
  ///
  /// A kubernetes API proxy will be spawned on this port over the loopback
  /// interface. If unset, a random port will be selected.
  #[structopt(long, short = "p", env = "LJ_K8S_PORT")]
  pub port: Option<u16>,

  /// Kubernetes namespace to read
  ///
  /// If unset, the namespace of the current kubectl context is used.
  #[structopt(long, short = "n", env = "LJ_NAMESPACE")]
  pub namespace: Option<String>
}

#[derive(Debug, StructOpt)]
#[structopt(name = "lumberjack", rename_all = "kebab-case")]
pub struct Config {
  /// Workloads to read logs from, as `kind/name` selectors
  ///
  /// Kinds: pod, deployment, daemonset, statefulset (or their usual short
  /// names). A bare name selects a pod.
  pub resources: Vec<Resource>,

  /// Continuously follow the selected workloads
  ///
  /// Without this flag a single bounded fetch is made and the merged
  /// output is printed sorted by timestamp.
  #[structopt(long, short = "f")]
  pub follow: bool,

  /// Number of recent lines to fetch per container when attaching
  ///
  /// In one-shot mode this defaults to an even split of the in-memory
  /// line budget across all selected containers.
  #[structopt(long, short = "t", env = "LJ_TAIL")]
  pub tail: Option<u32>,

  /// How far back to read logs, e.g. 30s, 5m, 2h, 1d
  #[structopt(long, env = "LJ_SINCE")]
  pub since: Option<Since>,

  /// Byte cap per log stream in follow mode; unbounded if unset
  #[structopt(long, env = "LJ_LIMIT_BYTES")]
  pub limit_bytes: Option<i64>,

  /// Seconds between reconnect passes while following
  #[structopt(long, env = "LJ_RETRY_INTERVAL")]
  pub retry_interval: Option<u64>,

  #[structopt(flatten)]
  pub kubernetes: KubernetesConfig
}
