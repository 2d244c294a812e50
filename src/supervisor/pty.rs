//! PTY session backend
//!
//! Each session wraps a single agent process running in a pseudo-terminal.
//! A reader thread drains the PTY into the ring buffer and the session log.

use crate::{AtelierError, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use super::backend::{LaunchSpec, ProcessStatus, SessionBackend, SessionHandle};
use super::buffer::RingBuffer;
use super::logger::SessionLogger;

/// Runs agents in native pseudo-terminals
pub struct PtyBackend {
    rows: u16,
    cols: u16,
}

impl PtyBackend {
    pub fn new() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl Default for PtyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBackend for PtyBackend {
    fn name(&self) -> &'static str {
        "pty"
    }

    fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn SessionHandle>> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: self.rows,
                cols: self.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| AtelierError::SessionCreation(format!("openpty: {}", e)))?;

        let mut cmd = CommandBuilder::new(&spec.command);
        cmd.args(&spec.args);
        cmd.cwd(&spec.working_dir);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        // Spawn the process in the PTY
        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            AtelierError::SessionCreation(format!("spawn '{}': {}", spec.command, e))
        })?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| AtelierError::SessionCreation(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| AtelierError::SessionCreation(e.to_string()))?;

        let output_buffer = Arc::new(Mutex::new(RingBuffer::new(spec.buffer_capacity)));
        spawn_reader(
            spec.session_id.clone(),
            reader,
            output_buffer.clone(),
            spec.logger,
        );

        tracing::info!(
            session_id = %spec.session_id,
            agent_id = %spec.agent_id,
            command = %spec.command,
            pid = ?child.process_id(),
            "PTY session started"
        );

        Ok(Box::new(PtyHandle {
            _master: pair.master,
            writer,
            child,
            output_buffer,
            status: ProcessStatus::Running,
        }))
    }
}

/// Drain PTY output until EOF
fn spawn_reader(
    session_id: String,
    mut reader: Box<dyn Read + Send>,
    buffer: Arc<Mutex<RingBuffer>>,
    mut logger: SessionLogger,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if let Ok(mut ring) = buffer.lock() {
                        ring.write(&buf[..n]);
                    }
                    if let Err(e) = logger.write(&buf[..n]) {
                        tracing::warn!(session_id = %session_id, "Session log write failed: {}", e);
                    }
                }
                Err(e) => {
                    tracing::debug!(session_id = %session_id, "PTY read ended: {}", e);
                    break;
                }
            }
        }
        let _ = logger.flush();
    });
}

/// A single PTY-backed session
///
/// Owns the PTY master (kept alive for the reader), the input writer and the
/// child process handle.
struct PtyHandle {
    _master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    output_buffer: Arc<Mutex<RingBuffer>>,
    status: ProcessStatus,
}

impl SessionHandle for PtyHandle {
    fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .map_err(|e| AtelierError::Pty(e.to_string()))?;
        self.writer
            .flush()
            .map_err(|e| AtelierError::Pty(e.to_string()))?;
        Ok(())
    }

    fn output_buffer(&self) -> Arc<Mutex<RingBuffer>> {
        self.output_buffer.clone()
    }

    fn poll(&mut self) -> ProcessStatus {
        if !self.status.is_running() {
            return self.status.clone();
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.status = ProcessStatus::Exited(status.exit_code() as i32);
            }
            Ok(None) => {}
            Err(e) => {
                self.status = ProcessStatus::Failed(e.to_string());
            }
        }

        self.status.clone()
    }

    fn kill(&mut self) -> Result<()> {
        if !self.poll().is_running() {
            return Ok(());
        }
        self.child
            .kill()
            .map_err(|e| AtelierError::Pty(e.to_string()))?;
        self.status = ProcessStatus::Exited(-1);
        Ok(())
    }
}
