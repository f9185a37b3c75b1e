// (C) Copyright 2020 Hewlett Packard Enterprise Development LP

use std::sync::mpsc::Receiver;
use std::thread::{self, JoinHandle};

use crate::entry::LogRecord;

/// Formats one record for terminal output, attaching the source container.
pub fn render_record(record: LogRecord) -> String {
  format!(
    "{} [{}] {}",
    record.timestamp.to_rfc3339(),
    record.container_name,
    record.message
  )
}

/// Prints rendered entries until the producing side hangs up.
pub fn plain_renderer(rx: Receiver<String>) -> JoinHandle<()> {
  thread::Builder::new().name("plain_renderer".to_string()).spawn(move || {
    for line in rx {
      println!("{}", line);
    }
  }).unwrap()
}
