// (C) Copyright 2020 Hewlett Packard Enterprise Development LP

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use simple_error::{SimpleError, SimpleResult};

/// Containers whose name carries this prefix belong to the runtime's own
/// infrastructure and are never followed or collected.
pub const INFRA_CONTAINER_PREFIX: &str = "garden-";

/// Error message used by adapters when a log stream could not be opened due
/// to a plain HTTP-level failure, e.g. a pod that exists but is not ready to
/// serve logs yet. Callers treat this particular message as routine noise.
pub const HTTP_REQUEST_FAILED: &str = "HTTP request failed";

pub fn is_infra_container(container_name: &str) -> bool {
  container_name.starts_with(INFRA_CONTAINER_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
  Pod,
  Deployment,
  DaemonSet,
  StatefulSet
}

impl FromStr for ResourceKind {
  type Err = SimpleError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "pod" | "pods" | "po" => Ok(ResourceKind::Pod),
      "deployment" | "deployments" | "deploy" => Ok(ResourceKind::Deployment),
      "daemonset" | "daemonsets" | "ds" => Ok(ResourceKind::DaemonSet),
      "statefulset" | "statefulsets" | "sts" => Ok(ResourceKind::StatefulSet),
      _ => bail!("unknown resource kind: {}", s)
    }
  }
}

/// A workload handle that an adapter can expand into running containers.
///
/// The namespace is optional; when unset, the namespace of the enumeration
/// call applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
  pub kind: ResourceKind,
  pub name: String,
  pub namespace: Option<String>
}

impl Resource {
  pub fn new(kind: ResourceKind, name: &str) -> Self {
    Resource {
      kind,
      name: name.to_string(),
      namespace: None
    }
  }

  pub fn namespace_or<'a>(&'a self, fallback: &'a str) -> &'a str {
    match &self.namespace {
      Some(namespace) => namespace,
      None => fallback
    }
  }
}

impl FromStr for Resource {
  type Err = SimpleError;

  /// parses `kind/name` selectors; a bare name selects a pod
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut splits = s.splitn(2, '/');
    let head = splits.next().unwrap_or("");

    match splits.next() {
      Some(name) => {
        if name.is_empty() {
          bail!("missing resource name: {}", s);
        }

        Ok(Resource::new(head.parse()?, name))
      },
      None => {
        if head.is_empty() {
          bail!("empty resource selector");
        }

        Ok(Resource::new(ResourceKind::Pod, head))
      }
    }
  }
}

/// A single running container, the unit a log stream attaches to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerRef {
  pub pod_name: String,
  pub container_name: String,
  pub namespace: String
}

impl ContainerRef {
  pub fn new(namespace: &str, pod_name: &str, container_name: &str) -> Self {
    ContainerRef {
      pod_name: pod_name.to_string(),
      container_name: container_name.to_string(),
      namespace: namespace.to_string()
    }
  }

  /// stable registry key for the container's log connection
  pub fn connection_key(&self) -> String {
    format!("{}/{}", self.pod_name, self.container_name)
  }

  /// key scoping the duplicate-suppression window to this container
  pub fn dedup_key(&self) -> String {
    format!("{}.{}", self.pod_name, self.container_name)
  }
}

/// A relative log horizon, e.g. `10s`, `5m`, `2h`, `1d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Since(Duration);

impl Since {
  pub fn from_secs(secs: u64) -> Self {
    Since(Duration::from_secs(secs))
  }

  pub fn as_secs(&self) -> u64 {
    self.0.as_secs()
  }
}

impl FromStr for Since {
  type Err = SimpleError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    lazy_static! {
      static ref SINCE_RE: Regex = Regex::new(r"^(\d+)([smhd])$").unwrap();
    }

    let captures = match SINCE_RE.captures(s) {
      Some(captures) => captures,
      None => bail!("invalid duration: {}", s)
    };

    let count: u64 = captures[1].parse()
      .map_err(SimpleError::from)?;

    let unit = match &captures[2] {
      "s" => 1,
      "m" => 60,
      "h" => 60 * 60,
      "d" => 60 * 60 * 24,
      _ => unreachable!()
    };

    Ok(Since(Duration::from_secs(count * unit)))
  }
}

/// Options for a single log stream attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStreamParams {
  pub follow: bool,
  pub timestamps: bool,
  pub tail_lines: Option<u32>,
  pub since_seconds: Option<u64>,
  pub limit_bytes: Option<i64>
}

/// Receives the raw bytes and lifecycle signals of one log stream.
///
/// Adapters call `write` once per received chunk, `error` at most once if
/// the stream fails, and `closed` exactly once when no more data will
/// arrive. `error` is always followed by `closed`.
pub trait LogSink: Send + Sync {
  fn write(&self, chunk: &[u8]);
  fn error(&self, err: SimpleError);
  fn closed(&self);
}

/// Cancels an open log stream. Aborting is advisory: the stream's reader
/// winds down at its next wakeup and still delivers its `closed` signal.
pub trait StreamHandle: Send {
  fn abort(&self);
}

/// The cluster operations the follower and collector are built on.
pub trait Cluster: Send + Sync {
  /// Expands the given resources into the currently running containers
  /// belonging to them within a namespace.
  fn enumerate_containers(
    &self, namespace: &str, resources: &[Resource]
  ) -> SimpleResult<Vec<ContainerRef>>;

  /// Starts a log stream for one container, delivering bytes and lifecycle
  /// signals to `sink`.
  fn open_log_stream(
    &self, target: &ContainerRef, params: &LogStreamParams,
    sink: Arc<dyn LogSink>
  ) -> SimpleResult<Box<dyn StreamHandle>>;
}
