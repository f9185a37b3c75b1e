// (C) Copyright 2020 Hewlett Packard Enterprise Development LP

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::DateTime;
use chrono::offset::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
  Debug,
  Info,
  Warning,
  Error
}

impl fmt::Display for LogLevel {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

impl FromStr for LogLevel {
  type Err = ();

  fn from_str(s: &str) -> Result<LogLevel, ()> {
    match s.to_lowercase().as_str() {
      "debug" | "dbg" | "d" => Ok(LogLevel::Debug),
      "info" | "i" => Ok(LogLevel::Info),
      "warning" | "warn" | "w" => Ok(LogLevel::Warning),
      "error" | "err" | "e" => Ok(LogLevel::Error),
      _ => Err(())
    }
  }
}

/// One parsed log line as emitted by the follower or collector, before the
/// caller's converter shapes it for the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
  pub timestamp: DateTime<Utc>,
  pub message: String,
  pub container_name: String,
  pub level: LogLevel
}

impl LogRecord {
  pub fn new(
    timestamp: DateTime<Utc>, message: &str, container_name: &str
  ) -> Self {
    LogRecord {
      timestamp,
      message: message.to_string(),
      container_name: container_name.to_string(),

      // log streams carry no severity of their own
      level: LogLevel::Info
    }
  }
}

/// Shapes a raw record into whatever entry type the consumer stream carries,
/// e.g. to attach the owning service's name and tags. The follower treats
/// the result as opaque.
pub type EntryConverter<E> = Arc<dyn Fn(LogRecord) -> E + Send + Sync>;
