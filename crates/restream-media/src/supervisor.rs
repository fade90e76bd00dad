//! Process supervision over `tokio::process`.
//!
//! The supervisor owns every child process it spawns, keyed by an internal
//! pid. `kill` is idempotent and reaps the entry; callers are expected to
//! call it unconditionally on every exit path.

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

use crate::error::{MediaError, MediaResult};

/// Supervisor-internal process id.
///
/// Stable across the process lifetime, unlike the OS pid which becomes
/// unavailable once the child has been reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u64);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Spawns, waits on, and kills OS processes.
///
/// The relay core only talks to subprocesses through this trait; tests
/// substitute a scripted fake.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Spawn a process from a full argv (`cmdline[0]` is the program).
    async fn spawn(&self, cmdline: &[String], tag: &str) -> MediaResult<Pid>;

    /// Wait up to `timeout` for the process to exit. Returns `true` if it
    /// exited (or was never known), `false` if it is still running.
    async fn wait(&self, pid: Pid, timeout: Duration) -> bool;

    /// Kill the process and reap its entry. Idempotent.
    async fn kill(&self, pid: Pid);

    /// Whether the process is currently running.
    async fn is_alive(&self, pid: Pid) -> bool;

    /// Take the process's stdin pipe. Returns `None` if already taken or the
    /// process is unknown.
    async fn stdin_writer(&self, pid: Pid) -> Option<Box<dyn AsyncWrite + Send + Unpin>>;

    /// Accumulated diagnostic output (stderr) of the process so far.
    async fn log_output(&self, pid: Pid) -> String;
}

struct ProcEntry {
    tag: String,
    child: tokio::sync::Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    log: Arc<Mutex<String>>,
}

/// Production supervisor for FFmpeg subprocesses.
pub struct FfmpegSupervisor {
    procs: Mutex<HashMap<u64, Arc<ProcEntry>>>,
    next_pid: AtomicU64,
}

impl FfmpegSupervisor {
    pub fn new() -> Self {
        Self {
            procs: Mutex::new(HashMap::new()),
            next_pid: AtomicU64::new(1),
        }
    }

    fn entry(&self, pid: Pid) -> Option<Arc<ProcEntry>> {
        self.procs.lock().unwrap_or_else(|e| e.into_inner()).get(&pid.0).cloned()
    }

    /// Number of live entries, for shutdown accounting.
    pub fn tracked(&self) -> usize {
        self.procs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for FfmpegSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessSupervisor for FfmpegSupervisor {
    async fn spawn(&self, cmdline: &[String], tag: &str) -> MediaResult<Pid> {
        let (program, args) = cmdline
            .split_first()
            .ok_or_else(|| MediaError::InvalidCommand("empty command line".to_string()))?;

        debug!(tag = tag, "Spawning process: {}", cmdline.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MediaError::spawn_failed(format!("{program}: {e}")))?;

        let stdin = child.stdin.take();
        let stderr = child.stderr.take();

        let pid = Pid(self.next_pid.fetch_add(1, Ordering::Relaxed));
        let log = Arc::new(Mutex::new(String::new()));

        // Drain stderr into the per-process log so fps parsing and failure
        // diagnostics survive the child's exit.
        if let Some(stderr) = stderr {
            let log = Arc::clone(&log);
            let tag = tag.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(tag = %tag, "{}", line);
                    let mut log = log.lock().unwrap_or_else(|e| e.into_inner());
                    log.push_str(&line);
                    log.push('\n');
                }
            });
        }

        let entry = Arc::new(ProcEntry {
            tag: tag.to_string(),
            child: tokio::sync::Mutex::new(child),
            stdin: Mutex::new(stdin),
            log,
        });
        self.procs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid.0, entry);

        metrics::counter!("restream_processes_spawned_total").increment(1);
        info!(tag = tag, pid = %pid, "Process started");
        Ok(pid)
    }

    async fn wait(&self, pid: Pid, timeout: Duration) -> bool {
        let Some(entry) = self.entry(pid) else {
            // Unknown pid means the process was already reaped.
            return true;
        };

        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut child = entry.child.lock().await;
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(tag = %entry.tag, pid = %pid, status = ?status.code(), "Process exited");
                        return true;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(tag = %entry.tag, pid = %pid, "Failed to poll process: {}", e);
                        return true;
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::time::sleep(remaining.min(Duration::from_millis(100))).await;
        }
    }

    async fn kill(&self, pid: Pid) {
        let entry = self
            .procs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pid.0);
        if let Some(entry) = entry {
            let mut child = entry.child.lock().await;
            if let Err(e) = child.kill().await {
                debug!(tag = %entry.tag, pid = %pid, "Kill ignored: {}", e);
            }
            metrics::counter!("restream_processes_killed_total").increment(1);
            info!(tag = %entry.tag, pid = %pid, "Process killed");
        }
    }

    async fn is_alive(&self, pid: Pid) -> bool {
        let Some(entry) = self.entry(pid) else {
            return false;
        };
        let mut child = entry.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    async fn stdin_writer(&self, pid: Pid) -> Option<Box<dyn AsyncWrite + Send + Unpin>> {
        let entry = self.entry(pid)?;
        let stdin = entry.stdin.lock().unwrap_or_else(|e| e.into_inner()).take()?;
        Some(Box::new(stdin))
    }

    async fn log_output(&self, pid: Pid) -> String {
        match self.entry(pid) {
            Some(entry) => entry.log.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            None => String::new(),
        }
    }
}
