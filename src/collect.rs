// (C) Copyright 2020 Hewlett Packard Enterprise Development LP

use std::mem;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};

use chrono::offset::Utc;
use simple_error::{SimpleError, SimpleResult};
use tracing::debug;

use crate::cluster::{
  is_infra_container, Cluster, ContainerRef, LogSink, LogStreamParams,
  Resource, Since
};
use crate::entry::{EntryConverter, LogRecord};
use crate::follow::parse::parse_line;

/// Upper bound on the lines buffered across all containers in one
/// collection pass; the per-container tail is derived from it.
pub const MAX_LOG_LINES_IN_MEMORY: usize = 100_000;

/// Gathers one bounded fetch worth of parsed records and reports them when
/// the stream closes.
struct CollectSink {
  container_name: String,
  records: Mutex<Vec<LogRecord>>,
  done: Mutex<Sender<Vec<LogRecord>>>
}

impl LogSink for CollectSink {
  fn write(&self, chunk: &[u8]) {
    let text = String::from_utf8_lossy(chunk);
    let mut records = self.records.lock().unwrap();

    for line in text.split('\n') {
      if let Some(parsed) = parse_line(line) {
        records.push(LogRecord::new(
          parsed.timestamp.unwrap_or_else(Utc::now),
          parsed.message,
          &self.container_name
        ));
      }
    }
  }

  fn error(&self, err: SimpleError) {
    debug!("log fetch for {} failed: {}", self.container_name, err);
  }

  fn closed(&self) {
    let records = mem::replace(&mut *self.records.lock().unwrap(), Vec::new());

    // the collector may already have given up waiting
    self.done.lock().unwrap().send(records).ok();
  }
}

/// Reads a bounded suffix of every target container's log in parallel,
/// merges the parsed entries, and writes them to the consumer sorted by
/// timestamp. Returns once every container's fetch has finished.
pub fn collect_logs<E: Send + 'static>(
  cluster: &dyn Cluster,
  namespace: &str,
  resources: &[Resource],
  tail: Option<u32>,
  since: Option<Since>,
  convert: EntryConverter<E>,
  consumer: &Sender<E>
) -> SimpleResult<()> {
  collect_logs_capped(
    cluster, namespace, resources, tail, since, convert, consumer,
    MAX_LOG_LINES_IN_MEMORY
  )
}

fn collect_logs_capped<E: Send + 'static>(
  cluster: &dyn Cluster,
  namespace: &str,
  resources: &[Resource],
  tail: Option<u32>,
  since: Option<Since>,
  convert: EntryConverter<E>,
  consumer: &Sender<E>,
  max_lines: usize
) -> SimpleResult<()> {
  let containers: Vec<ContainerRef> = cluster
    .enumerate_containers(namespace, resources)?
    .into_iter()
    .filter(|c| !is_infra_container(&c.container_name))
    .collect();

  if containers.is_empty() {
    debug!("no running containers in namespace {}", namespace);
    return Ok(());
  }

  // split the line budget evenly so one chatty container can't monopolize
  // it; containers enumerated after this point aren't accounted for
  let tail = tail.unwrap_or((max_lines / containers.len()) as u32);

  let params = LogStreamParams {
    follow: false,
    timestamps: true,
    tail_lines: Some(tail),
    since_seconds: since.map(|s| s.as_secs()),
    limit_bytes: None
  };

  let (done_tx, done_rx) = channel();
  let mut pending = 0;
  let mut handles = Vec::new();

  for container in &containers {
    let sink = Arc::new(CollectSink {
      container_name: container.container_name.clone(),
      records: Mutex::new(Vec::new()),
      done: Mutex::new(done_tx.clone())
    });

    match cluster.open_log_stream(container, &params, sink) {
      Ok(handle) => {
        pending += 1;
        handles.push(handle);
      },
      Err(e) => {
        debug!(
          "could not read logs for {}: {}", container.connection_key(), e
        );
      }
    }
  }

  let mut merged: Vec<LogRecord> = Vec::new();
  for _ in 0..pending {
    match done_rx.recv() {
      Ok(mut records) => merged.append(&mut records),
      Err(_) => break
    }
  }

  // stable, so equal timestamps keep their per-container arrival order
  merged.sort_by_key(|record| record.timestamp);

  for record in merged {
    if consumer.send((convert)(record)).is_err() {
      break;
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  use std::sync::mpsc::Receiver;

  use chrono::TimeZone;
  use spectral::prelude::*;

  use crate::cluster::testing::{FakeCluster, Session};
  use crate::cluster::ResourceKind;

  fn collect(
    cluster: &FakeCluster, tail: Option<u32>, max_lines: usize
  ) -> (SimpleResult<()>, Receiver<LogRecord>) {
    let (tx, rx) = channel();

    let result = collect_logs_capped(
      cluster,
      "default",
      &[Resource::new(ResourceKind::Deployment, "api")],
      tail,
      None,
      Arc::new(|record| record),
      &tx,
      max_lines
    );

    (result, rx)
  }

  #[test]
  fn test_tail_derived_from_line_budget() {
    let containers: Vec<ContainerRef> = (0..10)
      .map(|i| ContainerRef::new("default", &format!("pod-{}", i), "app"))
      .collect();

    let cluster = FakeCluster::new(vec![Ok(containers.clone())]);
    for (i, container) in containers.iter().enumerate() {
      let lines: Vec<String> = (0..100)
        .map(|j| format!("2024-01-01T{:02}:{:02}:00Z p{}l{}", i, j % 60, i, j))
        .collect();
      let line_refs: Vec<&str> = lines.iter().map(|l| l.as_str()).collect();

      cluster.script(&container.connection_key(), Session::closing(&line_refs));
    }

    let (result, rx) = collect(&cluster, None, 1000);
    assert_that!(result).is_ok();

    let entries: Vec<LogRecord> = rx.try_iter().collect();
    assert_that!(entries).has_length(1000);

    for (key, params) in cluster.opened.lock().unwrap().iter() {
      assert_that!(params.follow).is_false();
      assert_that!(params.timestamps).is_true();
      assert_that!(params.tail_lines).is_equal_to(Some(100));
      assert_that!(key.as_str().ends_with("/app")).is_true();
    }

    // the merged output is globally ordered
    for pair in entries.windows(2) {
      assert_that!(pair[0].timestamp <= pair[1].timestamp).is_true();
    }
  }

  #[test]
  fn test_merge_sorts_across_containers() {
    let cluster = FakeCluster::new(vec![Ok(vec![
      ContainerRef::new("default", "pod-a", "app"),
      ContainerRef::new("default", "pod-b", "app"),
    ])]);

    cluster.script("pod-a/app", Session::closing(&[
      "2024-01-01T00:00:00Z a0",
      "2024-01-01T00:00:02Z a1",
    ]));
    cluster.script("pod-b/app", Session::closing(&[
      "2024-01-01T00:00:01Z b0",
      "2024-01-01T00:00:03Z b1",
    ]));

    let (result, rx) = collect(&cluster, None, 1000);
    assert_that!(result).is_ok();

    let messages: Vec<String> = rx.try_iter()
      .map(|record| record.message)
      .collect();
    assert_that!(messages).is_equal_to(vec![
      "a0".to_string(),
      "b0".to_string(),
      "a1".to_string(),
      "b1".to_string(),
    ]);
  }

  #[test]
  fn test_explicit_tail_respected() {
    let cluster = FakeCluster::new(vec![Ok(vec![
      ContainerRef::new("default", "pod-a", "app"),
    ])]);
    cluster.script("pod-a/app", Session::closing(&["2024-01-01T00:00:00Z x"]));

    let (result, _rx) = collect(&cluster, Some(7), 1000);
    assert_that!(result).is_ok();

    let opened = cluster.opened.lock().unwrap();
    assert_that!(opened[0].1.tail_lines).is_equal_to(Some(7));
  }

  #[test]
  fn test_infrastructure_containers_excluded_from_budget() {
    let cluster = FakeCluster::new(vec![Ok(vec![
      ContainerRef::new("default", "pod-a", "app"),
      ContainerRef::new("default", "pod-a", "garden-sync"),
    ])]);
    cluster.script("pod-a/app", Session::closing(&["2024-01-01T00:00:00Z x"]));

    let (result, _rx) = collect(&cluster, None, 1000);
    assert_that!(result).is_ok();

    let opened = cluster.opened.lock().unwrap();
    assert_that!(opened.len()).is_equal_to(1);

    // the infra container doesn't dilute the per-container share
    assert_that!(opened[0].1.tail_lines).is_equal_to(Some(1000));
  }

  #[test]
  fn test_unparseable_lines_stamped_at_receive() {
    let cluster = FakeCluster::new(vec![Ok(vec![
      ContainerRef::new("default", "pod-a", "app"),
    ])]);
    cluster.script("pod-a/app", Session::closing(&["plain line"]));

    let before = Utc::now();
    let (result, rx) = collect(&cluster, None, 1000);
    let after = Utc::now();

    assert_that!(result).is_ok();

    let entries: Vec<LogRecord> = rx.try_iter().collect();
    assert_that!(entries).has_length(1);
    assert_that!(entries[0].message).is_equal_to("plain line".to_string());
    assert_that!(entries[0].timestamp >= before).is_true();
    assert_that!(entries[0].timestamp <= after).is_true();
  }

  #[test]
  fn test_enumeration_failure_propagates() {
    let cluster = FakeCluster::new(vec![
      Err(SimpleError::new("api server unavailable")),
    ]);

    let (result, _rx) = collect(&cluster, None, 1000);
    assert_that!(result).is_err();
  }

  #[test]
  fn test_sorted_output_with_parsed_timestamps() {
    let cluster = FakeCluster::new(vec![Ok(vec![
      ContainerRef::new("default", "pod-a", "app"),
    ])]);
    cluster.script("pod-a/app", Session::closing(&[
      "2024-01-01T00:00:00Z first",
    ]));

    let (result, rx) = collect(&cluster, None, 1000);
    assert_that!(result).is_ok();

    let entries: Vec<LogRecord> = rx.try_iter().collect();
    assert_that!(entries[0].timestamp)
      .is_equal_to(Utc.ymd(2024, 1, 1).and_hms(0, 0, 0));
  }
}
