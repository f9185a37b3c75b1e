// (C) Copyright 2020 Hewlett Packard Enterprise Development LP

pub mod dedup;
pub mod parse;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use chrono::offset::Utc;
use simple_error::SimpleError;
use tracing::{debug, trace};

use crate::cluster::{
  is_infra_container, Cluster, ContainerRef, LogSink, LogStreamParams,
  Resource, Since, StreamHandle, HTTP_REQUEST_FAILED
};
use crate::entry::{EntryConverter, LogRecord};
use dedup::DedupBuffer;
use parse::parse_line;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// On reconnect, re-fetch only this much recent history instead of the
/// caller's original `since`. The overlap this produces fits inside the
/// dedup window; the original horizon would not.
pub const RETRY_SINCE_SECONDS: u64 = 10;

/// Stream options for a follow session.
#[derive(Debug, Clone)]
pub struct FollowOpts {
  /// recent lines to fetch when first attaching to a container
  pub tail: Option<u32>,

  /// log horizon for the first attach; retries always use
  /// `RETRY_SINCE_SECONDS` instead
  pub since: Option<Since>,

  /// per-stream byte cap, `None` meaning unbounded; not defaulted so that
  /// callers state their memory-pressure decision explicitly
  pub limit_bytes: Option<i64>
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionStatus {
  Connected,
  Error,
  Closed
}

struct Connection {
  handle: Box<dyn StreamHandle>,
  status: Arc<Mutex<ConnectionStatus>>
}

impl Connection {
  fn is_live(&self) -> bool {
    *self.status.lock().unwrap() == ConnectionStatus::Connected
  }
}

struct FollowerShared<E: Send + 'static> {
  cluster: Arc<dyn Cluster>,
  namespace: String,
  resources: Vec<Resource>,
  opts: FollowOpts,
  convert: EntryConverter<E>,

  /// taken at stop; a consumer write is only possible while this holds the
  /// sender, so nothing can be written once `stop` has returned
  consumer: Mutex<Option<Sender<E>>>,

  connections: Mutex<HashMap<String, Connection>>,
  dedup: Mutex<DedupBuffer>,

  stopped: AtomicBool,
  wake: (Mutex<()>, Condvar),
  done: (Mutex<bool>, Condvar)
}

/// Receives one container's stream, feeding the parse → dedup → consumer
/// pipeline and tracking the connection's lifecycle.
struct ConnectionSink<E: Send + 'static> {
  shared: Arc<FollowerShared<E>>,
  connection_key: String,
  dedup_key: String,
  container_name: String,
  status: Arc<Mutex<ConnectionStatus>>
}

impl<E: Send + 'static> LogSink for ConnectionSink<E> {
  fn write(&self, chunk: &[u8]) {
    let text = String::from_utf8_lossy(chunk);

    for line in text.split('\n') {
      let parsed = match parse_line(line) {
        Some(parsed) => parsed,
        None => continue
      };

      let time_ms = parsed.timestamp
        .map(|t| t.timestamp_millis())
        .unwrap_or(0);

      let accepted = self.shared.dedup.lock().unwrap()
        .accept(&self.dedup_key, parsed.message, time_ms);
      if !accepted {
        continue;
      }

      let record = LogRecord::new(
        parsed.timestamp.unwrap_or_else(Utc::now),
        parsed.message,
        &self.container_name
      );

      let consumer = self.shared.consumer.lock().unwrap();
      if let Some(tx) = &*consumer {
        // a send failure means the consumer is gone; nothing we can do
        tx.send((self.shared.convert)(record)).ok();
      }
    }
  }

  fn error(&self, err: SimpleError) {
    trace!("log stream {} failed: {}", self.connection_key, err);
    *self.status.lock().unwrap() = ConnectionStatus::Error;
  }

  fn closed(&self) {
    let mut status = self.status.lock().unwrap();
    let previous = *status;
    *status = ConnectionStatus::Closed;

    // a close on the heels of an error is the same underlying event
    if previous != ConnectionStatus::Error {
      trace!("log stream {} closed", self.connection_key);
    }
  }
}

/// Continuously follows the logs of every container belonging to a set of
/// resources, writing parsed entries to the consumer as they arrive.
///
/// The follower owns a reconcile thread that re-enumerates the target
/// containers on an interval and (re)opens a log stream for every container
/// without a live connection. It runs until `stop` is called; `wait` blocks
/// until then.
pub struct Follower<E: Send + 'static> {
  shared: Arc<FollowerShared<E>>
}

impl<E: Send + 'static> Follower<E> {
  pub fn start(
    cluster: Arc<dyn Cluster>,
    namespace: &str,
    resources: Vec<Resource>,
    opts: FollowOpts,
    retry_interval: Duration,
    convert: EntryConverter<E>,
    consumer: Sender<E>
  ) -> Self {
    let shared = Arc::new(FollowerShared {
      cluster,
      namespace: namespace.to_string(),
      resources,
      opts,
      convert,
      consumer: Mutex::new(Some(consumer)),
      connections: Mutex::new(HashMap::new()),
      dedup: Mutex::new(DedupBuffer::default()),
      stopped: AtomicBool::new(false),
      wake: (Mutex::new(()), Condvar::new()),
      done: (Mutex::new(false), Condvar::new())
    });

    let loop_shared = Arc::clone(&shared);
    thread::Builder::new()
      .name("follow_reconcile".to_string())
      .spawn(move || {
        loop {
          if loop_shared.stopped.load(Ordering::SeqCst) {
            break;
          }

          reconcile(&loop_shared);

          let (lock, cvar) = &loop_shared.wake;
          let guard = lock.lock().unwrap();
          if loop_shared.stopped.load(Ordering::SeqCst) {
            break;
          }

          // stop() interrupts the interval through the condvar
          let _ = cvar.wait_timeout(guard, retry_interval).unwrap();
        }
      }).unwrap();

    Follower { shared }
  }

  /// Shuts the follower down: cancels the reconcile timer, detaches the
  /// consumer, aborts every registered stream, and releases `wait`.
  /// Calling it again is a no-op.
  pub fn stop(&self) {
    if self.shared.stopped.swap(true, Ordering::SeqCst) {
      return;
    }

    {
      let (lock, cvar) = &self.shared.wake;
      let _guard = lock.lock().unwrap();
      cvar.notify_all();
    }

    self.shared.consumer.lock().unwrap().take();

    let mut connections = self.shared.connections.lock().unwrap();
    for (key, connection) in connections.drain() {
      trace!("aborting log stream {}", key);
      connection.handle.abort();
    }
    drop(connections);

    let (lock, cvar) = &self.shared.done;
    *lock.lock().unwrap() = true;
    cvar.notify_all();
  }

  /// Blocks until `stop` has completed; the follower never finishes on its
  /// own.
  pub fn wait(&self) {
    let (lock, cvar) = &self.shared.done;
    let mut done = lock.lock().unwrap();
    while !*done {
      done = cvar.wait(done).unwrap();
    }
  }
}

fn reconcile<E: Send + 'static>(shared: &Arc<FollowerShared<E>>) {
  let containers = match shared.cluster
    .enumerate_containers(&shared.namespace, &shared.resources)
  {
    Ok(containers) => containers,
    Err(e) => {
      debug!("could not enumerate containers: {}", e);
      return;
    }
  };

  let containers: Vec<ContainerRef> = containers.into_iter()
    .filter(|c| !is_infra_container(&c.container_name))
    .collect();

  if containers.is_empty() {
    debug!("no running containers in namespace {}", shared.namespace);
    return;
  }

  for container in containers {
    if shared.stopped.load(Ordering::SeqCst) {
      return;
    }

    let key = container.connection_key();

    let retry = {
      let connections = shared.connections.lock().unwrap();
      match connections.get(&key) {
        Some(connection) if connection.is_live() => continue,
        Some(_) => true,
        None => false
      }
    };

    attach(shared, &container, key, retry);
  }
}

fn attach<E: Send + 'static>(
  shared: &Arc<FollowerShared<E>>,
  container: &ContainerRef,
  key: String,
  retry: bool
) {
  let params = LogStreamParams {
    follow: true,
    timestamps: true,

    // tailing history only makes sense on the first attach; a retry
    // re-fetches a short fixed horizon that the dedup window absorbs
    tail_lines: if retry { None } else { shared.opts.tail },
    since_seconds: if retry {
      Some(RETRY_SINCE_SECONDS)
    } else {
      shared.opts.since.map(|s| s.as_secs())
    },
    limit_bytes: shared.opts.limit_bytes
  };

  if retry {
    trace!("reattaching log stream {}", key);
  }

  let status = Arc::new(Mutex::new(ConnectionStatus::Connected));
  let sink = Arc::new(ConnectionSink {
    shared: Arc::clone(shared),
    connection_key: key.clone(),
    dedup_key: container.dedup_key(),
    container_name: container.container_name.clone(),
    status: Arc::clone(&status)
  });

  let handle = match shared.cluster.open_log_stream(container, &params, sink) {
    Ok(handle) => handle,
    Err(e) => {
      // pods that exist but aren't ready yet fail with a bare http error;
      // that churn isn't worth logging
      if e.as_str() != HTTP_REQUEST_FAILED {
        debug!("could not open log stream {}: {}", key, e);
      }
      return;
    }
  };

  let mut connections = shared.connections.lock().unwrap();
  if shared.stopped.load(Ordering::SeqCst) {
    // lost the race against stop(); don't leak the fresh stream
    handle.abort();
    return;
  }

  if let Some(previous) = connections.insert(key, Connection { handle, status }) {
    // the replaced entry was dead, but its reader may still be winding down
    previous.handle.abort();
  }
}
