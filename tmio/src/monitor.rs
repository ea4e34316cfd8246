//! Append-only log of per-session instrument traffic.
//!
//! Sessions call [`IoMonitor::log`] when their `tracing` attribute is on.
//! The monitor is shared between sessions through an `Arc`; logging is
//! best-effort and never fails the I/O operation that triggered it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Default monitor log location
pub const DEFAULT_MONITOR_PATH: &str = "/usr/local/etc/opentmlib.monitor";

/// Direction of a logged message, seen from the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Application to instrument
    Out,
    /// Instrument to application
    In,
}

/// Process-wide instrument traffic log
pub struct IoMonitor {
    file: Mutex<File>,
}

impl IoMonitor {
    /// Open (or create) the log file at `path`, appending to existing content.
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Open the monitor at its default location.
    pub fn open_default() -> std::io::Result<Self> {
        Self::open(DEFAULT_MONITOR_PATH)
    }

    /// Append one traffic record.
    ///
    /// `eol` records whether the end-of-line character was part of the wire
    /// message. Failures to write are swallowed; the monitor must never
    /// break the I/O path it observes.
    pub fn log(&self, name: &str, direction: Direction, payload: &str, eol: bool) {
        let arrow = match direction {
            Direction::Out => ">>",
            Direction::In => "<<",
        };
        let marker = if eol { "+eol" } else { "-eol" };
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{name} {arrow} {payload} [{marker}]");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn log_appends_directional_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor.log");

        let monitor = IoMonitor::open(&path).unwrap();
        monitor.log("scope", Direction::Out, "*IDN?", true);
        monitor.log("scope", Direction::In, "ACME,4461,123,1.0", false);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "scope >> *IDN? [+eol]");
        assert_eq!(lines[1], "scope << ACME,4461,123,1.0 [-eol]");
    }

    #[test]
    fn reopening_appends_instead_of_truncating() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor.log");

        IoMonitor::open(&path).unwrap().log("a", Direction::Out, "x", false);
        IoMonitor::open(&path).unwrap().log("b", Direction::Out, "y", false);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
