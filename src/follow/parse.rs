// (C) Copyright 2020 Hewlett Packard Enterprise Development LP

use chrono::DateTime;
use chrono::offset::Utc;

/// A log line split into its timestamp prefix and message body.
///
/// `timestamp` is `None` when the line carried no parseable RFC 3339 prefix;
/// in that case `message` is the whole line and callers substitute their own
/// receive time.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine<'a> {
  pub timestamp: Option<DateTime<Utc>>,
  pub message: &'a str
}

/// Parses one raw log line of the form `<rfc3339> <message>`.
///
/// Returns `None` for lines that are empty after trimming trailing
/// whitespace; those produce no entry at all.
pub fn parse_line(line: &str) -> Option<ParsedLine> {
  let line = line.trim_end();
  if line.is_empty() {
    return None;
  }

  let mut splits = line.splitn(2, ' ');
  let candidate = splits.next().unwrap_or("");

  if let Ok(timestamp) = DateTime::parse_from_rfc3339(candidate) {
    // lines with a bare timestamp and no body still count, as empty messages
    let message = splits.next().unwrap_or("");

    Some(ParsedLine {
      timestamp: Some(timestamp.with_timezone(&Utc)),
      message
    })
  } else {
    Some(ParsedLine {
      timestamp: None,
      message: line
    })
  }
}
