// src/io/process.rs
use std::io::{self, BufRead, BufReader};
use std::process::{Child, ChildStderr, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

const EXIT_POLL: Duration = Duration::from_millis(10);

/// Owns one external process and guarantees it is killed and reaped.
///
/// Dropping the guard kills the child (if still running) and waits for it,
/// so no exit path (error, stop, panic unwinding) leaves a process or a
/// zombie behind.
pub struct ProcessGuard {
    label: String,
    child: Child,
    status: Option<ExitStatus>,
}

impl ProcessGuard {
    pub fn new(label: &str, mut child: Child) -> Self {
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger(label, stderr);
        }
        debug!("[process] {} started (pid {})", label, child.id());
        Self {
            label: label.to_string(),
            child,
            status: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Sends a kill signal without reaping. Harmless if already exited.
    pub fn kill(&mut self) {
        if self.status.is_some() {
            return;
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            self.status = Some(status);
            return;
        }
        if let Err(e) = self.child.kill() {
            if e.kind() != io::ErrorKind::InvalidInput {
                warn!("[process] failed to kill {}: {}", self.label, e);
            }
        }
    }

    /// Blocks until the process has exited; the status is cached.
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait()?;
        debug!("[process] {} exited: {}", self.label, status);
        self.status = Some(status);
        Ok(status)
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning
    /// `None` with the process still running.
    pub fn wait_deadline(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                debug!("[process] {} exited: {}", self.label, status);
                self.status = Some(status);
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(EXIT_POLL.min(deadline - now));
        }
    }

    pub fn terminate(&mut self) -> Option<ExitStatus> {
        self.kill();
        match self.wait() {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("[process] failed to reap {}: {}", self.label, e);
                None
            }
        }
    }

    pub fn has_exited(&mut self) -> bool {
        if self.status.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.status = Some(status);
                true
            }
            _ => false,
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if self.status.is_none() {
            self.terminate();
        }
    }
}

/// Processes chained for one session, in spawn order.
#[derive(Default)]
pub struct ProcessGroup {
    processes: Vec<ProcessGuard>,
}

impl ProcessGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, guard: ProcessGuard) {
        self.processes.push(guard);
    }

    pub fn append(&mut self, mut other: ProcessGroup) {
        self.processes.append(&mut other.processes);
    }

    pub fn pids(&self) -> Vec<u32> {
        self.processes.iter().map(|p| p.id()).collect()
    }

    pub fn kill_all(&mut self) {
        for process in self.processes.iter_mut() {
            process.kill();
        }
    }

    /// Statuses of all processes, or `None` while any is still running.
    pub fn try_statuses(&mut self) -> Option<Vec<(String, ExitStatus)>> {
        let mut statuses = Vec::with_capacity(self.processes.len());
        for process in self.processes.iter_mut() {
            if !process.has_exited() {
                return None;
            }
            statuses.push((process.label.clone(), process.status?));
        }
        Some(statuses)
    }

    pub fn terminate_all(&mut self) {
        self.kill_all();
        for process in self.processes.iter_mut() {
            process.terminate();
        }
    }
}

fn spawn_stderr_logger(label: &str, stderr: ChildStderr) {
    let label = label.to_string();
    let spawned = thread::Builder::new()
        .name(format!("{}-stderr", label))
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) if !line.trim().is_empty() => warn!("[{}] {}", label, line.trim()),
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });
    if let Err(e) = spawned {
        warn!("[process] could not spawn stderr logger: {}", e);
    }
}
