/// Heuristic discovery of the spawned viewer process.
///
/// The viewer is launched detached through the engine, so no process handle
/// comes back from the spawn. The handle is recovered by correlation: snapshot
/// the pids of every instance of the viewer executable before launch, then
/// poll for an instance that was not there before. Inherently racy; the
/// search is bounded in time and resolved deterministically (latest start
/// time wins, first enumerated wins ties).
use std::collections::HashSet;
use std::ffi::OsStr;
use std::time::{Duration, Instant};

use sysinfo::{ProcessStatus, ProcessesToUpdate, System};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pids of every running instance of `executable`, taken before spawn so the
/// new instance can be told apart from pre-existing ones.
pub fn snapshot(executable: &str) -> HashSet<u32> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    sys.processes()
        .iter()
        .filter(|(_, process)| name_matches(process.name(), executable))
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

/// Poll for an instance of `executable` that is not in `excluding`.
///
/// Returns the pid with the latest start time when several qualify, or
/// `None` once `timeout` elapses. Processes that disappear mid-scan are
/// simply absent from the next refresh; an individual unreadable entry never
/// fails the whole call.
pub fn find_new(
    executable: &str,
    excluding: &HashSet<u32>,
    timeout: Duration,
    poll_interval: Duration,
) -> Option<u32> {
    let deadline = Instant::now() + timeout;
    let mut sys = System::new();
    loop {
        sys.refresh_processes(ProcessesToUpdate::All, true);
        let mut best: Option<(u32, u64)> = None;
        for (pid, process) in sys.processes() {
            let pid = pid.as_u32();
            if excluding.contains(&pid) || !name_matches(process.name(), executable) {
                continue;
            }
            match best {
                // Later start time replaces; equal keeps the first enumerated.
                Some((_, start)) if process.start_time() <= start => {}
                _ => best = Some((pid, process.start_time())),
            }
        }
        if let Some((pid, start_time)) = best {
            tracing::debug!(pid, start_time, executable, "new viewer instance identified");
            return Some(pid);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(poll_interval);
    }
}

/// Whether the process still runs. A zombie counts as exited: the viewer
/// is gone from the user's point of view even if its entry lingers.
pub fn is_running(pid: u32) -> bool {
    let target = sysinfo::Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    match sys.process(target) {
        Some(process) => process.status() != ProcessStatus::Zombie,
        None => false,
    }
}

/// Match a process name against the executable's base name, allowing for the
/// kernel's 15-byte truncation of long names.
fn name_matches(name: &OsStr, executable: &str) -> bool {
    let name = name.to_string_lossy();
    if name == executable {
        return true;
    }
    name.len() == 15 && executable.starts_with(name.as_ref())
}
