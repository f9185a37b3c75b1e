// (C) Copyright 2020 Hewlett Packard Enterprise Development LP

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use simple_error::{SimpleError, SimpleResult};

use super::types::{
  Cluster, ContainerRef, LogSink, LogStreamParams, Resource, StreamHandle
};

/// One scripted stream session: the lines it delivers, whether it fails
/// before closing, and whether it stays open until aborted.
pub struct Session {
  lines: Vec<String>,
  error: Option<String>,
  hold: bool
}

impl Session {
  /// delivers its lines, then closes (as a finished or interrupted stream
  /// would)
  pub fn closing(lines: &[&str]) -> Session {
    Session {
      lines: lines.iter().map(|l| l.to_string()).collect(),
      error: None,
      hold: false
    }
  }

  /// delivers its lines, then fails with a stream error before closing
  pub fn failing(lines: &[&str], error: &str) -> Session {
    Session {
      lines: lines.iter().map(|l| l.to_string()).collect(),
      error: Some(error.to_string()),
      hold: false
    }
  }

  /// delivers its lines, then stays open until aborted
  pub fn holding(lines: &[&str]) -> Session {
    Session {
      lines: lines.iter().map(|l| l.to_string()).collect(),
      error: None,
      hold: true
    }
  }
}

/// An in-memory cluster driven entirely by scripts: a fixed sequence of
/// enumeration results (the last one repeats forever) and per-connection
/// queues of stream sessions. Opens and aborts are recorded for assertions.
pub struct FakeCluster {
  enumerations: Vec<SimpleResult<Vec<ContainerRef>>>,
  enumeration_calls: AtomicUsize,
  sessions: Mutex<HashMap<String, VecDeque<Session>>>,

  pub opened: Mutex<Vec<(String, LogStreamParams)>>,
  pub aborted: Arc<Mutex<Vec<String>>>
}

impl FakeCluster {
  pub fn new(enumerations: Vec<SimpleResult<Vec<ContainerRef>>>) -> Self {
    FakeCluster {
      enumerations,
      enumeration_calls: AtomicUsize::new(0),
      sessions: Mutex::new(HashMap::new()),
      opened: Mutex::new(Vec::new()),
      aborted: Arc::new(Mutex::new(Vec::new()))
    }
  }

  /// queues the next stream session for a connection key
  pub fn script(&self, connection_key: &str, session: Session) {
    self.sessions.lock().unwrap()
      .entry(connection_key.to_string())
      .or_insert_with(VecDeque::new)
      .push_back(session);
  }
}

struct FakeStreamHandle {
  connection_key: String,
  stopped: Arc<AtomicBool>,
  aborted: Arc<Mutex<Vec<String>>>
}

impl StreamHandle for FakeStreamHandle {
  fn abort(&self) {
    self.stopped.store(true, Ordering::SeqCst);
    self.aborted.lock().unwrap().push(self.connection_key.clone());
  }
}

impl Cluster for FakeCluster {
  fn enumerate_containers(
    &self, _namespace: &str, _resources: &[Resource]
  ) -> SimpleResult<Vec<ContainerRef>> {
    let call = self.enumeration_calls.fetch_add(1, Ordering::SeqCst);
    let index = call.min(self.enumerations.len().saturating_sub(1));

    match self.enumerations.get(index) {
      Some(Ok(containers)) => Ok(containers.clone()),
      Some(Err(e)) => Err(SimpleError::new(e.as_str())),
      None => Ok(Vec::new())
    }
  }

  fn open_log_stream(
    &self, target: &ContainerRef, params: &LogStreamParams,
    sink: Arc<dyn LogSink>
  ) -> SimpleResult<Box<dyn StreamHandle>> {
    let key = target.connection_key();
    self.opened.lock().unwrap().push((key.clone(), params.clone()));

    let session = self.sessions.lock().unwrap()
      .get_mut(&key)
      .and_then(|queue| queue.pop_front())
      .unwrap_or_else(|| Session::holding(&[]));

    let stopped = Arc::new(AtomicBool::new(false));
    let reader_stopped = Arc::clone(&stopped);

    thread::spawn(move || {
      for line in &session.lines {
        if reader_stopped.load(Ordering::SeqCst) {
          break;
        }
        sink.write(line.as_bytes());
      }

      if let Some(message) = &session.error {
        sink.error(SimpleError::new(message.as_str()));
      }

      if session.hold {
        while !reader_stopped.load(Ordering::SeqCst) {
          thread::sleep(Duration::from_millis(2));
        }
      }

      sink.closed();
    });

    Ok(Box::new(FakeStreamHandle {
      connection_key: key,
      stopped,
      aborted: Arc::clone(&self.aborted)
    }))
  }
}
