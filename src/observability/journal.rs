/// Operator-visible cleanup journal
///
/// The release agent runs with no terminal, so each teardown outcome is
/// appended as one human-readable line:
///
/// ```text
/// 2024-05-01 12:00:00 +0200: Successfully cleaned up lvpeek-20240501-115900-0123456789ab
/// 2024-05-01 12:00:00 +0200: Failed to clean up lvpeek-...: snapshot data/lvpeek-...: ...
/// ```
use chrono::{DateTime, Local};
use log::warn;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

#[derive(Debug, Clone, Default)]
pub struct Journal {
    /// `None` writes to stdout
    path: Option<PathBuf>,
}

impl Journal {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn record_success(&self, snapshot: &str) {
        self.append(&success_line(&Local::now(), snapshot));
    }

    pub fn record_failure(&self, snapshot: &str, reasons: &[String]) {
        self.append(&failure_line(&Local::now(), snapshot, reasons));
    }

    /// Never fails: a journal that cannot be written falls back to stdout
    fn append(&self, line: &str) {
        if let Some(path) = &self.path {
            let written = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| writeln!(file, "{}", line));
            match written {
                Ok(()) => return,
                Err(e) => warn!("Failed to write journal {}: {}", path.display(), e),
            }
        }
        println!("{}", line);
    }
}

pub fn success_line(at: &DateTime<Local>, snapshot: &str) -> String {
    format!(
        "{}: Successfully cleaned up {}",
        at.format(TIMESTAMP_FORMAT),
        snapshot
    )
}

pub fn failure_line(at: &DateTime<Local>, snapshot: &str, reasons: &[String]) -> String {
    format!(
        "{}: Failed to clean up {}: {}",
        at.format(TIMESTAMP_FORMAT),
        snapshot,
        reasons.join("; ")
    )
}
