//! In-memory stand-ins for real agent processes
//!
//! [`ScriptedBackend`] behaves like a cooperative agent in a terminal: it
//! echoes input, answers every task instruction with a completion marker
//! after a configurable delay and exits on the shutdown command.
//! [`StaticInspector`] reports fixed resource samples. Used for dry runs and
//! tests; nothing here touches OS processes.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::accounting::{TokenAccountant, UsageRecord};
use crate::agent::protocol;
use crate::config::SupervisorConfig;
use crate::supervisor::{
    LaunchSpec, ProcessInspector, ProcessStatus, ResourceSample, RingBuffer, SessionBackend,
    SessionHandle, SessionId, SessionLogger,
};
use crate::{AtelierError, Result};

/// Longest a stalled process blocks a single call
const MAX_STALL: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Supervisor settings with short timings for tests
pub fn fast_supervisor_config(log_dir: &Path) -> SupervisorConfig {
    SupervisorConfig {
        log_dir: Some(log_dir.to_path_buf()),
        buffer_capacity: 64 * 1024,
        idle_timeout_ms: 60_000,
        resource_interval_ms: 50,
        io_timeout_ms: 200,
        shutdown_grace_ms: 500,
        ..Default::default()
    }
}

struct ScriptState {
    response_delay: Mutex<Duration>,
    shutdown_command: String,
    fail_next_launch: AtomicBool,
    ignore_shutdown: AtomicBool,
    launches: AtomicUsize,
    next_pid: AtomicU32,
    processes: Mutex<HashMap<SessionId, Arc<ScriptedProcess>>>,
    stalled: Mutex<HashSet<String>>,
    failing_types: Mutex<HashSet<String>>,
}

impl ScriptState {
    fn is_stalled(&self, agent_id: &str) -> bool {
        lock(&self.stalled).contains(agent_id)
    }
}

struct ScriptedProcess {
    agent_id: String,
    session_id: SessionId,
    pid: u32,
    output: Arc<Mutex<RingBuffer>>,
    logger: Mutex<SessionLogger>,
    exit_code: Mutex<Option<i32>>,
}

impl ScriptedProcess {
    fn emit(&self, bytes: &[u8]) {
        lock(&self.output).write(bytes);
        if let Err(e) = lock(&self.logger).write(bytes) {
            tracing::debug!(session_id = %self.session_id, "Scripted log write failed: {}", e);
        }
    }

    fn exit(&self, code: i32) {
        let mut exit_code = lock(&self.exit_code);
        if exit_code.is_none() {
            *exit_code = Some(code);
        }
    }

    fn has_exited(&self) -> bool {
        lock(&self.exit_code).is_some()
    }
}

/// Session backend that simulates agents in memory
pub struct ScriptedBackend {
    state: Arc<ScriptState>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ScriptState {
                response_delay: Mutex::new(Duration::from_millis(20)),
                shutdown_command: SupervisorConfig::default().shutdown_command,
                fail_next_launch: AtomicBool::new(false),
                ignore_shutdown: AtomicBool::new(false),
                launches: AtomicUsize::new(0),
                next_pid: AtomicU32::new(40_000),
                processes: Mutex::new(HashMap::new()),
                stalled: Mutex::new(HashSet::new()),
                failing_types: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// How long an agent takes to answer a task
    pub fn set_response_delay(&self, delay: Duration) {
        *lock(&self.state.response_delay) = delay;
    }

    /// Make the next launch fail like a missing binary
    pub fn fail_next_launch(&self) {
        self.state.fail_next_launch.store(true, Ordering::SeqCst);
    }

    /// Agents keep running after the shutdown command
    pub fn ignore_shutdown(&self, ignore: bool) {
        self.state.ignore_shutdown.store(ignore, Ordering::SeqCst);
    }

    /// Tasks of this type are answered with a failure marker
    pub fn fail_tasks_of_type(&self, task_type: &str) {
        lock(&self.state.failing_types).insert(task_type.to_string());
    }

    /// Block every handle call for the agent's sessions, like a hung process
    pub fn stall_agent(&self, agent_id: &str) {
        lock(&self.state.stalled).insert(agent_id.to_string());
    }

    pub fn resume_agent(&self, agent_id: &str) {
        lock(&self.state.stalled).remove(agent_id);
    }

    /// Kill a session's process behind the supervisor's back
    pub fn crash(&self, session_id: &str) -> bool {
        match lock(&self.state.processes).get(session_id) {
            Some(process) => {
                process.exit(137);
                true
            }
            None => false,
        }
    }

    pub fn launch_count(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    /// Sessions whose process is still running
    pub fn running_sessions(&self) -> usize {
        lock(&self.state.processes)
            .values()
            .filter(|p| !p.has_exited())
            .count()
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn SessionHandle>> {
        if self.state.fail_next_launch.swap(false, Ordering::SeqCst) {
            return Err(AtelierError::SessionCreation(format!(
                "spawn '{}': No such file or directory",
                spec.command
            )));
        }
        self.state.launches.fetch_add(1, Ordering::SeqCst);

        let process = Arc::new(ScriptedProcess {
            agent_id: spec.agent_id.clone(),
            session_id: spec.session_id.clone(),
            pid: self.state.next_pid.fetch_add(1, Ordering::SeqCst),
            output: Arc::new(Mutex::new(RingBuffer::new(spec.buffer_capacity))),
            logger: Mutex::new(spec.logger),
            exit_code: Mutex::new(None),
        });
        process.emit(format!("{} ready\r\n", spec.agent_id).as_bytes());
        lock(&self.state.processes).insert(spec.session_id.clone(), process.clone());

        Ok(Box::new(ScriptedHandle {
            process,
            state: self.state.clone(),
        }))
    }
}

struct ScriptedHandle {
    process: Arc<ScriptedProcess>,
    state: Arc<ScriptState>,
}

impl ScriptedHandle {
    fn wait_while_stalled(&self) {
        let started = Instant::now();
        while self.state.is_stalled(&self.process.agent_id) && started.elapsed() < MAX_STALL {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn answer(&self, task_id: &str, task_type: &str) {
        let failing = lock(&self.state.failing_types).contains(task_type);
        let delay = *lock(&self.state.response_delay);
        let process = self.process.clone();
        let task_id = task_id.to_string();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            if process.has_exited() {
                return;
            }
            let marker = if failing {
                protocol::failed_marker(&task_id)
            } else {
                protocol::done_marker(&task_id)
            };
            process.emit(format!("working on {}\r\n{}\r\n", task_id, marker).as_bytes());
        });
    }
}

impl SessionHandle for ScriptedHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.process.pid)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.wait_while_stalled();
        if self.process.has_exited() {
            return Err(AtelierError::Session(format!(
                "process for {} has exited",
                self.process.session_id
            )));
        }

        // Terminal echo
        let text = String::from_utf8_lossy(data).replace('\n', "\r\n");
        self.process.emit(text.as_bytes());

        for line in String::from_utf8_lossy(data).lines() {
            if line.trim() == self.state.shutdown_command {
                if !self.state.ignore_shutdown.load(Ordering::SeqCst) {
                    self.process.exit(0);
                }
            } else if let Some((task_id, task_type)) = protocol::parse_task_header(line) {
                self.answer(task_id, task_type);
            }
        }
        Ok(())
    }

    fn output_buffer(&self) -> Arc<Mutex<RingBuffer>> {
        self.process.output.clone()
    }

    fn poll(&mut self) -> ProcessStatus {
        self.wait_while_stalled();
        match *lock(&self.process.exit_code) {
            Some(code) => ProcessStatus::Exited(code),
            None => ProcessStatus::Running,
        }
    }

    fn kill(&mut self) -> Result<()> {
        self.wait_while_stalled();
        self.process.exit(-9);
        Ok(())
    }
}

/// Process inspector returning a fixed sample
pub struct StaticInspector {
    sample: Mutex<ResourceSample>,
    alive: AtomicBool,
}

impl StaticInspector {
    pub fn new(sample: ResourceSample) -> Self {
        Self {
            sample: Mutex::new(sample),
            alive: AtomicBool::new(true),
        }
    }

    pub fn set_sample(&self, sample: ResourceSample) {
        *lock(&self.sample) = sample;
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }
}

impl Default for StaticInspector {
    fn default() -> Self {
        Self::new(ResourceSample {
            cpu_percent: 1.0,
            memory_bytes: 64 * 1024 * 1024,
        })
    }
}

#[async_trait]
impl ProcessInspector for StaticInspector {
    async fn sample(&self, _pid: u32) -> Result<Option<ResourceSample>> {
        if !self.alive.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(*lock(&self.sample)))
    }

    fn is_alive(&self, _pid: u32) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Accountant charging a flat price per token and keeping every record
pub struct RecordingAccountant {
    cost_per_token: f64,
    records: Mutex<Vec<UsageRecord>>,
}

impl RecordingAccountant {
    pub fn new(cost_per_token: f64) -> Self {
        Self {
            cost_per_token,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        lock(&self.records).clone()
    }
}

#[async_trait]
impl TokenAccountant for RecordingAccountant {
    async fn record_usage(&self, usage: &UsageRecord) -> Result<f64> {
        lock(&self.records).push(usage.clone());
        Ok(usage.total_tokens() as f64 * self.cost_per_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::LaunchConfig;
    use tempfile::TempDir;

    fn launch(backend: &ScriptedBackend, dir: &TempDir) -> Box<dyn SessionHandle> {
        let logger = SessionLogger::create(dir.path(), "ses-test").unwrap();
        let spec = LaunchSpec::new(
            "ses-test".into(),
            "dev-1",
            &LaunchConfig::default(),
            dir.path().to_path_buf(),
            4096,
            logger,
        );
        backend.launch(spec).unwrap()
    }

    #[test]
    fn answers_tasks_and_exits_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::new();
        backend.set_response_delay(Duration::from_millis(1));
        let mut handle = launch(&backend, &dir);

        handle.write(b"[atelier task t-9] test: go\n").unwrap();
        let buffer = handle.output_buffer();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let text = String::from_utf8_lossy(&lock(&buffer).read_all()).to_string();
            if protocol::find_outcome(&text, "t-9").is_some() {
                break;
            }
            assert!(Instant::now() < deadline, "no completion marker");
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(handle.poll().is_running());
        handle.write(b"exit\n").unwrap();
        assert_eq!(handle.poll(), ProcessStatus::Exited(0));
        assert!(handle.write(b"hello\n").is_err());
    }

    #[test]
    fn failed_launch_is_session_creation_error() {
        let dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::new();
        backend.fail_next_launch();
        let logger = SessionLogger::create(dir.path(), "ses-x").unwrap();
        let spec = LaunchSpec::new(
            "ses-x".into(),
            "dev-1",
            &LaunchConfig::default(),
            dir.path().to_path_buf(),
            4096,
            logger,
        );
        let err = backend.launch(spec).err().unwrap();
        assert_eq!(err.kind(), "session_creation");
        assert_eq!(backend.launch_count(), 0);
    }
}
