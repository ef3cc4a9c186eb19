/// Kill-on-close process guard.
///
/// The viewer application is spawned by the engine, not by us, so it is not
/// our child and would survive if this process died. The guard closes that
/// hole: every pid handed to `assign` is terminated when the guard is
/// released, and just as importantly when the supervising process dies
/// without running any cleanup code at all.
///
/// The Unix implementation delegates to a helper process (`docdiff
/// __reaper`) connected by a pipe. The helper collects pids from its stdin
/// and terminates them when the pipe reaches EOF, which happens on orderly
/// release and on any death of the supervisor, SIGKILL included.
use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

/// Hidden CLI argument that switches the binary into reaper mode.
pub const REAPER_SUBCOMMAND: &str = "__reaper";

/// Grace period between SIGTERM and SIGKILL when reaping.
const TERM_GRACE: Duration = Duration::from_millis(300);

/// Failure to allocate the guard construct. Rare; callers propagate it
/// instead of retrying.
#[derive(Debug)]
pub struct GuardError {
    source: std::io::Error,
}

impl std::fmt::Display for GuardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to allocate process guard: {}", self.source)
    }
}

impl std::error::Error for GuardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Capability interface for "terminate these processes when I go away".
///
/// Platform constructs differ (job objects, process groups, a reaper
/// helper); the session only needs assign and release.
pub trait ProcessGuard: Send {
    /// Place a process under the guard. Returns false (non-fatal) if the
    /// guard cannot track it, e.g. the helper or the process already exited.
    fn assign(&mut self, pid: u32) -> bool;

    /// Release the guard, terminating every process still assigned.
    /// Idempotent; also invoked on drop.
    fn release(&mut self);
}

/// Unix guard backed by a reaper helper process.
pub struct UnixReaperGuard {
    helper: Option<Child>,
    pipe: Option<ChildStdin>,
    assigned: Vec<u32>,
}

impl UnixReaperGuard {
    /// Spawn the reaper helper and return a live guard.
    pub fn create() -> Result<Self, GuardError> {
        let exe = std::env::current_exe().map_err(|e| GuardError { source: e })?;
        let mut command = Command::new(exe);
        command.arg(REAPER_SUBCOMMAND);
        Self::with_helper(command)
    }

    fn with_helper(mut command: Command) -> Result<Self, GuardError> {
        let mut helper = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| GuardError { source: e })?;
        let pipe = helper.stdin.take().ok_or_else(|| GuardError {
            source: std::io::Error::other("reaper helper has no stdin pipe"),
        })?;
        tracing::debug!(helper_pid = helper.id(), "process guard helper started");
        Ok(Self {
            helper: Some(helper),
            pipe: Some(pipe),
            assigned: Vec::new(),
        })
    }
}

impl ProcessGuard for UnixReaperGuard {
    fn assign(&mut self, pid: u32) -> bool {
        if !alive(pid as i32) {
            tracing::warn!(pid, "process exited before it could be guarded");
            return false;
        }
        let Some(pipe) = self.pipe.as_mut() else {
            return false;
        };
        let sent = writeln!(pipe, "KILL {pid}").and_then(|_| pipe.flush());
        match sent {
            Ok(()) => {
                self.assigned.push(pid);
                tracing::debug!(pid, "process placed under guard");
                true
            }
            Err(e) => {
                tracing::warn!(pid, error = %e, "guard helper rejected assignment");
                false
            }
        }
    }

    fn release(&mut self) {
        // Closing the pipe is the release signal; the helper terminates
        // everything it was told about and exits.
        drop(self.pipe.take());
        if let Some(mut helper) = self.helper.take() {
            match helper.wait() {
                Ok(status) => {
                    tracing::debug!(?status, assigned = self.assigned.len(), "process guard released")
                }
                Err(e) => tracing::warn!(error = %e, "failed to reap guard helper"),
            }
        }
    }
}

impl Drop for UnixReaperGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Entry point for the hidden reaper mode.
///
/// Reads `KILL <pid>` lines from stdin until EOF, then terminates every
/// registered pid. Runs with SIGINT/SIGHUP ignored so a Ctrl-C or terminal
/// close aimed at the supervisor cannot take the reaper down first.
pub fn run_reaper() -> std::process::ExitCode {
    unsafe {
        let _ = nix::sys::signal::signal(Signal::SIGINT, nix::sys::signal::SigHandler::SigIgn);
        let _ = nix::sys::signal::signal(Signal::SIGHUP, nix::sys::signal::SigHandler::SigIgn);
    }
    let stdin = std::io::stdin();
    let pids = collect_pids(stdin.lock());
    terminate_all(&pids);
    std::process::ExitCode::SUCCESS
}

/// Accumulate pids from `KILL <pid>` lines until the reader ends.
/// Unparseable lines are skipped.
fn collect_pids(reader: impl std::io::BufRead) -> Vec<i32> {
    let mut pids = Vec::new();
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if let Some(pid) = parse_command(&line) {
            pids.push(pid);
        }
    }
    pids
}

fn parse_command(line: &str) -> Option<i32> {
    let rest = line.strip_prefix("KILL ")?;
    rest.trim().parse::<i32>().ok()
}

/// Terminate the given pids and, best effort, their process groups:
/// SIGTERM first, a short grace period, then SIGKILL for survivors.
fn terminate_all(pids: &[i32]) {
    if pids.is_empty() {
        return;
    }
    for &pid in pids {
        let target = Pid::from_raw(pid);
        let _ = kill(target, Signal::SIGTERM);
        let _ = killpg(target, Signal::SIGTERM);
    }
    let deadline = std::time::Instant::now() + TERM_GRACE;
    while std::time::Instant::now() < deadline {
        if pids.iter().all(|&pid| !alive(pid)) {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    for &pid in pids {
        if alive(pid) {
            let target = Pid::from_raw(pid);
            let _ = kill(target, Signal::SIGKILL);
            let _ = killpg(target, Signal::SIGKILL);
        }
    }
}

/// Liveness probe via signal 0. EPERM still means "exists".
fn alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}
