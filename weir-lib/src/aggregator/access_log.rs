//! Pass-through log for the JSON access lines received over UDP.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::{Mutex, PoisonError};

use tracing::error;

/// Raw line-oriented writer. Access lines arrive pre-formatted from the
/// proxy and are appended verbatim, one per line.
pub struct AccessLog {
    out: Mutex<Box<dyn Write + Send>>,
}

impl AccessLog {
    /// Open the given file for appending, or fall back to stdout when no
    /// path is configured.
    pub fn open(path: Option<&str>) -> crate::Result<Self> {
        let out: Box<dyn Write + Send> = match path {
            Some(path) => Box::new(OpenOptions::new().create(true).append(true).open(path)?),
            None => Box::new(std::io::stdout()),
        };
        Ok(Self { out: Mutex::new(out) })
    }

    pub fn write_line(&self, line: &str) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{line}").and_then(|_| out.flush()) {
            error!("failed to write access log line: {e}");
        }
    }
}
