// (C) Copyright 2020 Hewlett Packard Enterprise Development LP

use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::prelude::*;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use simple_error::{SimpleError, SimpleResult};
use subprocess::{Exec, Popen, PopenConfig, Redirection};
use tracing::{debug, trace};

use super::types::{
  Cluster, ContainerRef, LogSink, LogStreamParams, Resource, ResourceKind,
  StreamHandle, HTTP_REQUEST_FAILED
};

/// Sockets that stay quiet this long are torn down by the client; for a
/// follow stream that surfaces as a stream error, and the next reconcile
/// pass reopens it.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct KubernetesMetadata {
  name: String
}

#[derive(Debug, Deserialize)]
struct KubernetesContainer {
  name: String
}

#[derive(Debug, Deserialize)]
struct KubernetesPodSpec {
  containers: Vec<KubernetesContainer>
}

#[derive(Debug, Deserialize)]
struct KubernetesPod {
  metadata: KubernetesMetadata,
  spec: KubernetesPodSpec
}

#[derive(Debug, Deserialize)]
struct KubernetesListObject {
  items: Vec<KubernetesPod>
}

fn workload_api_path(kind: ResourceKind) -> &'static str {
  match kind {
    ResourceKind::Deployment => "deployments",
    ResourceKind::DaemonSet => "daemonsets",
    ResourceKind::StatefulSet => "statefulsets",

    // pods are fetched directly, not expanded through a selector
    ResourceKind::Pod => unreachable!()
  }
}

/// builds a labelSelector query string from a workload's matchLabels
fn selector_from_labels(labels: &serde_json::Map<String, Value>) -> String {
  labels.iter()
    .map(|(key, value)| {
      format!("{}={}", key, value.as_str().unwrap_or_default())
    })
    .collect::<Vec<String>>()
    .join(",")
}

/// spawns a kubectl proxy, returning the child process and its port
///
/// the port is randomly selected unless pinned; if kubectl exits quickly
/// (for example, due to a port conflict), an Err is returned.
fn spawn_kubectl(port: Option<u16>) -> SimpleResult<(Popen, u16)> {
  let port = if let Some(port) = port {
    port
  } else {
    thread_rng().gen_range(1000, 65535)
  };

  let port_arg = format!("--port={}", port);
  let args = vec![
    "kubectl",
    "proxy",
    &port_arg
  ];

  let mut child = Popen::create(&args, PopenConfig {
    stdout: Redirection::Merge,
    stderr: Redirection::None,

    ..Default::default()
  }).map_err(SimpleError::from)?;

  // wait a bit to see if it exits
  thread::sleep(Duration::from_millis(250));

  if child.poll().is_some() {
    bail!("kubectl exited early");
  }

  Ok((child, port))
}

struct KubernetesStreamHandle {
  stopped: Arc<AtomicBool>
}

impl StreamHandle for KubernetesStreamHandle {
  fn abort(&self) {
    // the reader notices at its next line or idle-timeout wakeup
    self.stopped.store(true, Ordering::SeqCst);
  }
}

/// Cluster access through a locally spawned `kubectl proxy`, which also
/// takes care of kubeconfig auth. The proxy is terminated when this value
/// is dropped.
pub struct KubernetesCluster {
  client: Client,
  port: u16,
  proxy: Mutex<Popen>
}

impl KubernetesCluster {
  pub fn connect(port: Option<u16>) -> SimpleResult<Self> {
    let (proxy, port) = spawn_kubectl(port)?;
    debug!("started kubernetes api proxy on port {}", port);

    let client = Client::builder()
      .timeout(STREAM_IDLE_TIMEOUT)
      .build()
      .map_err(SimpleError::from)?;

    Ok(KubernetesCluster {
      client,
      port,
      proxy: Mutex::new(proxy)
    })
  }

  /// Resolves the namespace of the current kubectl context, or `default`
  /// if the context leaves it unset.
  pub fn default_namespace() -> SimpleResult<String> {
    // --minify removes all but the current context, so the jsonpath below
    // can't accidentally pick up some other context's namespace
    let data = Exec::cmd("kubectl")
      .args(&[
        "config",
        "view",
        "--minify",
        "-o",
        "jsonpath={.contexts[0].context.namespace}"
      ])
      .stdout(Redirection::Pipe)
      .stderr(Redirection::Pipe)
      .capture()
      .map_err(SimpleError::from)?;

    if data.success() {
      let output = data.stdout_str();
      if output.is_empty() {
        Ok("default".to_string())
      } else {
        Ok(output)
      }
    } else {
      bail!("kubectl error: {}", data.stderr_str());
    }
  }

  fn api_url(&self, path: &str) -> String {
    format!("http://localhost:{}{}", self.port, path)
  }

  fn list_pods(
    &self, namespace: &str, selector: Option<&str>
  ) -> SimpleResult<Vec<KubernetesPod>> {
    let query: Vec<(String, String)> = match selector {
      Some(selector) => vec![
        ("labelSelector".to_string(), selector.to_string())
      ],
      None => vec![]
    };

    let mut response = self.client
      .get(&self.api_url(&format!("/api/v1/namespaces/{}/pods", namespace)))
      .query(&query)
      .send().map_err(SimpleError::from)?;

    if !response.status().is_success() {
      bail!(
        "failed to list pods in namespace {}: {}",
        namespace, response.status().as_u16()
      );
    }

    let pod_list: KubernetesListObject = response.json()
      .map_err(SimpleError::from)?;

    Ok(pod_list.items)
  }

  /// fetches a single pod; a pod that no longer exists is not an error
  fn get_pod(
    &self, namespace: &str, name: &str
  ) -> SimpleResult<Option<KubernetesPod>> {
    let mut response = self.client
      .get(&self.api_url(&format!(
        "/api/v1/namespaces/{}/pods/{}", namespace, name
      )))
      .send().map_err(SimpleError::from)?;

    if response.status() == StatusCode::NOT_FOUND {
      return Ok(None);
    } else if !response.status().is_success() {
      bail!(
        "unable to get pod {}: {}", name, response.status().as_u16()
      );
    }

    Ok(Some(response.json().map_err(SimpleError::from)?))
  }

  /// expands a workload into the label selector of its pod template
  fn workload_selector(
    &self, namespace: &str, resource: &Resource
  ) -> SimpleResult<Option<String>> {
    let mut response = self.client
      .get(&self.api_url(&format!(
        "/apis/apps/v1/namespaces/{}/{}/{}",
        namespace, workload_api_path(resource.kind), resource.name
      )))
      .send().map_err(SimpleError::from)?;

    if response.status() == StatusCode::NOT_FOUND {
      return Ok(None);
    } else if !response.status().is_success() {
      bail!(
        "unable to get {:?} {}: {}",
        resource.kind, resource.name, response.status().as_u16()
      );
    }

    let workload: Value = response.json().map_err(SimpleError::from)?;

    // match-expression selectors aren't supported; every workload created
    // from a pod template carries matchLabels
    let labels = workload.pointer("/spec/selector/matchLabels")
      .and_then(|v| v.as_object());

    match labels {
      Some(labels) if !labels.is_empty() => {
        Ok(Some(selector_from_labels(labels)))
      },
      _ => {
        debug!(
          "{:?} {} has no matchLabels selector, skipping",
          resource.kind, resource.name
        );
        Ok(None)
      }
    }
  }

  fn expand_resource(
    &self, namespace: &str, resource: &Resource
  ) -> SimpleResult<Vec<KubernetesPod>> {
    match resource.kind {
      ResourceKind::Pod => {
        Ok(self.get_pod(namespace, &resource.name)?.into_iter().collect())
      },
      _ => {
        match self.workload_selector(namespace, resource)? {
          Some(selector) => self.list_pods(namespace, Some(&selector)),
          None => Ok(vec![])
        }
      }
    }
  }
}

impl Cluster for KubernetesCluster {
  fn enumerate_containers(
    &self, namespace: &str, resources: &[Resource]
  ) -> SimpleResult<Vec<ContainerRef>> {
    let mut seen = HashSet::new();
    let mut ret = Vec::new();

    for resource in resources {
      let namespace = resource.namespace_or(namespace);

      for pod in self.expand_resource(namespace, resource)? {
        for container in &pod.spec.containers {
          let container_ref = ContainerRef::new(
            namespace, &pod.metadata.name, &container.name
          );

          // overlapping selectors may return the same pod twice
          if seen.insert(container_ref.clone()) {
            ret.push(container_ref);
          }
        }
      }
    }

    Ok(ret)
  }

  fn open_log_stream(
    &self, target: &ContainerRef, params: &LogStreamParams,
    sink: Arc<dyn LogSink>
  ) -> SimpleResult<Box<dyn StreamHandle>> {
    let mut query: Vec<(String, String)> = vec![
      ("container".to_string(), target.container_name.clone()),
      ("follow".to_string(), params.follow.to_string()),
      ("timestamps".to_string(), params.timestamps.to_string())
    ];

    if let Some(tail_lines) = params.tail_lines {
      query.push(("tailLines".to_string(), tail_lines.to_string()));
    }

    if let Some(since_seconds) = params.since_seconds {
      query.push(("sinceSeconds".to_string(), since_seconds.to_string()));
    }

    if let Some(limit_bytes) = params.limit_bytes {
      query.push(("limitBytes".to_string(), limit_bytes.to_string()));
    }

    let response = self.client
      .get(&self.api_url(&format!(
        "/api/v1/namespaces/{}/pods/{}/log",
        target.namespace, target.pod_name
      )))
      .query(&query)
      .send().map_err(SimpleError::from)?;

    if !response.status().is_success() {
      // containers that haven't started yet land here; callers know to
      // treat this message as routine
      bail!(HTTP_REQUEST_FAILED);
    }

    let stopped = Arc::new(AtomicBool::new(false));
    let reader_stopped = Arc::clone(&stopped);
    let connection_key = target.connection_key();

    thread::Builder::new()
      .name(format!("log_stream_{}", target.pod_name))
      .spawn(move || {
        let reader = BufReader::new(response);

        for line in reader.lines() {
          if reader_stopped.load(Ordering::SeqCst) {
            break;
          }

          match line {
            Ok(line) => sink.write(line.as_bytes()),
            Err(e) => {
              // idle timeouts and mid-stream socket failures land here
              sink.error(SimpleError::from(e));
              break;
            }
          }
        }

        trace!("log stream {} ended", connection_key);
        sink.closed();
      })
      .map_err(SimpleError::from)?;

    Ok(Box::new(KubernetesStreamHandle { stopped }))
  }
}

impl Drop for KubernetesCluster {
  fn drop(&mut self) {
    if let Ok(mut proxy) = self.proxy.lock() {
      proxy.terminate().ok();
      proxy.wait().ok();
    }
  }
}
