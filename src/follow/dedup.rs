// (C) Copyright 2020 Hewlett Packard Enterprise Development LP

use std::collections::{HashMap, VecDeque};

/// Default number of recent entries remembered per container, sized so the
/// ten-second re-fetch window of a reconnect fits comfortably.
pub const DEFAULT_DEDUP_WINDOW: usize = 500;

/// Sliding windows of recently emitted `(message, time_ms)` pairs, one per
/// container key, used to suppress lines re-observed after a reconnect.
///
/// Windows are never cleared while the owning follower runs; surviving a
/// connection cycle is the whole point.
pub struct DedupBuffer {
  windows: HashMap<String, VecDeque<(String, i64)>>,
  capacity: usize
}

impl DedupBuffer {
  pub fn new(capacity: usize) -> Self {
    DedupBuffer {
      windows: HashMap::new(),
      capacity
    }
  }

  /// Decides whether `(message, time_ms)` is new for `key`, recording it if
  /// so. Timestamps compare on exact millisecond equality; lines that had no
  /// parseable timestamp collapse to `time_ms = 0`.
  pub fn accept(&mut self, key: &str, message: &str, time_ms: i64) -> bool {
    let window = self.windows.entry(key.to_string())
      .or_insert_with(VecDeque::new);

    let duplicate = window.iter()
      .any(|(m, t)| *t == time_ms && m == message);

    if duplicate {
      return false;
    }

    window.push_back((message.to_string(), time_ms));
    if window.len() > self.capacity {
      window.pop_front();
    }

    true
  }
}

impl Default for DedupBuffer {
  fn default() -> Self {
    DedupBuffer::new(DEFAULT_DEDUP_WINDOW)
  }
}
