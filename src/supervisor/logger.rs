//! Session log persistence
//!
//! Every byte a session prints is appended to `<log_dir>/<session-id>.log`,
//! escapes included. The file outlives the session.
//!
//! Default location: `~/.atelier/logs/{session-id}.log`

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::{AtelierError, Result};

/// Directory name for logs within ~/.atelier/
const LOGS_DIR: &str = "logs";

/// Get the default atelier logs directory
///
/// Returns `~/.atelier/logs/`, creating it if necessary.
pub fn default_logs_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        AtelierError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine home directory",
        ))
    })?;

    let logs_path = home.join(".atelier").join(LOGS_DIR);
    fs::create_dir_all(&logs_path)?;
    Ok(logs_path)
}

/// Get the log file path for a session inside `dir`
pub fn log_path_for_session(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{}.log", session_id))
}

/// Logger for a single session
///
/// Appends output to a persistent log file during the session lifetime.
pub struct SessionLogger {
    file: File,
    path: PathBuf,
    session_id: String,
    bytes_written: usize,
}

impl SessionLogger {
    /// Open (or create) the log file for `session_id` under `dir`
    pub fn create(dir: &Path, session_id: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = log_path_for_session(dir, session_id);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        tracing::debug!(session_id = %session_id, path = %path.display(), "Session log opened");

        Ok(Self {
            file,
            path,
            session_id: session_id.to_string(),
            bytes_written: 0,
        })
    }

    /// Write raw bytes to the log. ANSI escape codes are preserved.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        self.bytes_written += data.len();
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the session ID this logger is for
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get total bytes written to the log
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }
}

impl Drop for SessionLogger {
    fn drop(&mut self) {
        if let Err(e) = self.file.flush() {
            tracing::warn!(session_id = %self.session_id, "Session log flush failed: {}", e);
        }
        tracing::debug!(
            session_id = %self.session_id,
            bytes = self.bytes_written,
            "Session log closed"
        );
    }
}
