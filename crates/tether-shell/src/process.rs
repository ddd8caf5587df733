//! Process-tree helpers: exit status mapping, descendant discovery and
//! forced termination.
//!
//! Every child we spawn is made the leader of its own process group, so the
//! whole tree can be taken down with one `killpg`. Descendants of a session
//! shell share that group with the shell itself, which is why
//! [`kill_descendants`] walks the process table instead.

use std::collections::{HashMap, HashSet};
use std::io;
use std::process::ExitStatus;

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Map an exit status to a plain integer.
///
/// A child killed by a signal reports `128 + signal`, the way shells do.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// All live descendants of `pid`, children before grandchildren.
pub fn descendants(pid: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (proc_pid, process) in system.processes() {
        if process.status() == ProcessStatus::Zombie {
            continue;
        }
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*proc_pid);
        }
    }

    let root = Pid::from_u32(pid);
    let mut found = Vec::new();
    let mut seen: HashSet<Pid> = HashSet::from([root]);
    let mut queue = std::collections::VecDeque::from([root]);
    while let Some(current) = queue.pop_front() {
        for child in children.get(&current).into_iter().flatten() {
            if seen.insert(*child) {
                found.push(child.as_u32());
                queue.push_back(*child);
            }
        }
    }
    found
}

/// SIGKILL every descendant of `pid`, leaving `pid` itself alone.
///
/// Returns how many processes were signalled. Zero is not an error.
pub fn kill_descendants(pid: u32) -> usize {
    let targets = descendants(pid);
    let mut killed = 0;
    for target in &targets {
        match kill_pid(*target) {
            Ok(()) => killed += 1,
            Err(e) => warn!(pid = target, "failed to kill descendant: {e}"),
        }
    }
    debug!(parent = pid, killed, "descendants killed");
    killed
}

/// SIGKILL a single process. A process that is already gone is not an error.
#[cfg(unix)]
pub fn kill_pid(pid: u32) -> io::Result<()> {
    // Safety: plain kill(2); the worst case for a recycled PID is a failed
    // permission check.
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if result == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn kill_pid(pid: u32) -> io::Result<()> {
    let mut system = System::new();
    let target = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    if let Some(process) = system.process(target) {
        process.kill();
    }
    Ok(())
}

/// SIGKILL a whole process group. A group that is already gone is not an
/// error.
#[cfg(unix)]
pub fn kill_group(pgid: u32) -> io::Result<()> {
    // Safety: killpg(2) on a group we created with `process_group(0)`.
    let result = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if result == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

/// No process groups here; fall back to the leader and its tree.
#[cfg(not(unix))]
pub fn kill_group(pgid: u32) -> io::Result<()> {
    kill_descendants(pgid);
    kill_pid(pgid)
}

/// `true` while `pid` exists and is not a zombie.
pub fn is_alive(pid: u32) -> bool {
    let mut system = System::new();
    let target = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    system
        .process(target)
        .is_some_and(|process| process.status() != ProcessStatus::Zombie)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::Duration;

    #[test]
    fn exit_code_passes_real_codes_through() {
        let status = Command::new("sh").args(["-c", "exit 3"]).status().unwrap();
        assert_eq!(exit_code(status), 3);
    }

    #[test]
    fn exit_code_maps_signals() {
        let status = Command::new("sh")
            .args(["-c", "kill -9 $$"])
            .status()
            .unwrap();
        assert_eq!(exit_code(status), 137);
    }

    #[test]
    fn finds_and_kills_grandchildren() {
        // sh -> sh -> sleep
        let mut parent = Command::new("sh")
            .args(["-c", "sh -c 'sleep 30; true'; true"])
            .spawn()
            .unwrap();
        let pid = parent.id();

        let mut found = Vec::new();
        for _ in 0..50 {
            found = descendants(pid);
            if found.len() >= 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(found.len() >= 2, "expected child and grandchild, got {found:?}");

        assert!(kill_descendants(pid) >= 2);
        // Both inner processes are gone, so the outer shell finishes.
        let status = parent.wait().unwrap();
        assert!(status.success());
        for pid in found {
            let mut alive = true;
            for _ in 0..40 {
                alive = is_alive(pid);
                if !alive {
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            assert!(!alive, "pid {pid} survived");
        }
    }

    #[test]
    fn killing_nothing_is_fine() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        assert_eq!(kill_descendants(child.id()), 0);
        kill_pid(child.id()).unwrap();
        child.wait().unwrap();
        // Already reaped: ESRCH is swallowed.
        kill_pid(child.id()).unwrap();
    }
}
