#![deny(warnings)]
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments
)]

//! A standalone `log::Log` implementation: a level filter, a colorized stderr sink, and an
//! optional file sink written alongside it. No Python log-level bridge and no per-thread
//! destination switching -- this process only ever logs to one place at a time.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use colored::Colorize;
use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

const TIME_FORMAT_STR: &str = "%H:%M:%S%.2f";

pub struct Logger {
  use_color: bool,
  file: Option<Mutex<std::fs::File>>,
}

impl Logger {
  /// Installs this logger as the global `log` sink. `level` governs what passes the global
  /// filter; `file_path` is opened in append mode (created if absent) and mirrors everything
  /// also written to stderr.
  pub fn init(level: LevelFilter, use_color: bool, file_path: Option<&Path>) -> Result<(), String> {
    let file = match file_path {
      None => None,
      Some(path) => {
        let file = OpenOptions::new()
          .create(true)
          .append(true)
          .open(path)
          .map_err(|e| format!("Failed to open log file {}: {e}", path.display()))?;
        Some(Mutex::new(file))
      }
    };
    let logger = Box::new(Logger { use_color, file });
    log::set_max_level(level);
    log::set_boxed_logger(logger).map_err(|e| format!("Logger already initialized: {e}"))
  }
}

impl Log for Logger {
  fn enabled(&self, metadata: &Metadata) -> bool {
    metadata.level() <= log::max_level()
  }

  fn log(&self, record: &Record) {
    if !self.enabled(record.metadata()) {
      return;
    }

    let now = chrono::Local::now();
    let time_str = now.format(TIME_FORMAT_STR);
    let level = record.level();

    let level_marker = if self.use_color {
      match level {
        Level::Error => format!("[{level}]").red(),
        Level::Warn => format!("[{level}]").yellow(),
        Level::Info => format!("[{level}]").normal(),
        Level::Debug => format!("[{level}]").green(),
        Level::Trace => format!("[{level}]").magenta(),
      }
    } else {
      format!("[{level}]").normal().clear()
    };

    let line = format!("{time_str} {level_marker} {}", record.args());
    eprintln!("{line}");

    if let Some(file) = &self.file {
      let mut file = file.lock();
      if let Err(e) = writeln!(file, "{line}") {
        eprintln!("failed to write to log file: {e}");
      }
    }
  }

  fn flush(&self) {
    if let Some(file) = &self.file {
      let _ = file.lock().flush();
    }
  }
}

/// Translates the `logging.level` config string into a `log::LevelFilter`, matching the set of
/// levels the source logger recognizes.
pub fn parse_level(level: &str) -> Result<LevelFilter, String> {
  match level.to_ascii_lowercase().as_str() {
    "off" => Ok(LevelFilter::Off),
    "error" => Ok(LevelFilter::Error),
    "warn" => Ok(LevelFilter::Warn),
    "info" => Ok(LevelFilter::Info),
    "debug" => Ok(LevelFilter::Debug),
    "trace" => Ok(LevelFilter::Trace),
    other => Err(format!("Unrecognized log level: {other:?}")),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_known_levels() {
    assert_eq!(parse_level("info").unwrap(), LevelFilter::Info);
    assert_eq!(parse_level("DEBUG").unwrap(), LevelFilter::Debug);
    assert!(parse_level("verbose").is_err());
  }

  #[test]
  fn writes_to_file_sink() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worker.log");
    let file = OpenOptions::new().create(true).append(true).open(&path).unwrap();
    let logger = Logger { use_color: false, file: Some(Mutex::new(file)) };
    let record = Record::builder()
      .args(format_args!("hello"))
      .level(Level::Info)
      .target("logsetup")
      .build();
    logger.log(&record);
    logger.flush();
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("hello"));
  }
}
