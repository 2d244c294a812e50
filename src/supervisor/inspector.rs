//! Process inspection
//!
//! Resource sampling sits behind [`ProcessInspector`] so monitoring can be
//! exercised without real OS processes.

use crate::{AtelierError, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// One CPU/memory reading of a process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

#[async_trait]
pub trait ProcessInspector: Send + Sync {
    /// Sample a process. `Ok(None)` when the process no longer exists.
    async fn sample(&self, pid: u32) -> Result<Option<ResourceSample>>;

    /// Whether a process with this pid still exists
    fn is_alive(&self, pid: u32) -> bool;
}

/// Inspector backed by `ps` and `kill(pid, 0)`
#[derive(Debug, Default, Clone, Copy)]
pub struct PsInspector;

impl PsInspector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessInspector for PsInspector {
    async fn sample(&self, pid: u32) -> Result<Option<ResourceSample>> {
        let output = Command::new("ps")
            .args(["-o", "%cpu=,rss=", "-p", &pid.to_string()])
            .output()
            .await?;

        // ps exits non-zero when the pid is gone
        if !output.status.success() {
            return Ok(None);
        }
        parse_ps_line(&String::from_utf8_lossy(&output.stdout))
            .map(Some)
            .ok_or_else(|| AtelierError::Session(format!("unparseable ps output for pid {}", pid)))
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // Signal 0 only checks existence and permission
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

/// Parse `"<cpu%> <rss KiB>"`
fn parse_ps_line(text: &str) -> Option<ResourceSample> {
    let mut fields = text.split_whitespace();
    let cpu_percent = fields.next()?.parse::<f64>().ok()?;
    let rss_kib = fields.next()?.parse::<u64>().ok()?;
    Some(ResourceSample {
        cpu_percent,
        memory_bytes: rss_kib * 1024,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ps_output() {
        let sample = parse_ps_line("  12.5  2048\n").unwrap();
        assert_eq!(sample.cpu_percent, 12.5);
        assert_eq!(sample.memory_bytes, 2048 * 1024);
        assert!(parse_ps_line("").is_none());
        assert!(parse_ps_line("abc 12").is_none());
    }

    #[test]
    fn current_process_is_alive() {
        assert!(PsInspector::new().is_alive(std::process::id()));
    }
}
