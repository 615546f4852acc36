//! Signalling for children started as the leader of their own process group.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

/// Send `signal` to the group led by `pid`; a group that already exited is
/// silently skipped.
pub(crate) fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => tracing::debug!(pid, signal = ?signal, error = %err, "signal to process group failed"),
    }
}

/// SIGKILLs a child's whole process group on drop unless disarmed.
///
/// Dropping a `tokio::process::Child` with `kill_on_drop` only reaches the
/// direct child; anything it started in the background would survive.
#[derive(Debug)]
pub(crate) struct GroupKillGuard {
    pid: Option<u32>,
}

impl GroupKillGuard {
    pub(crate) fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    pub(crate) fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for GroupKillGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            signal_group(pid, Signal::SIGKILL);
        }
    }
}

/// Whether `pid` names a live, non-zombie process.
#[cfg(test)]
pub(crate) fn is_running(pid: u32) -> bool {
    // Zombies still answer signal 0; on Linux /proc tells them apart.
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        let state = stat.rsplit(')').next().map(str::trim_start).unwrap_or_default();
        return !(state.starts_with('Z') || state.starts_with('X'));
    }
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    nix::sys::signal::kill(Pid::from_raw(raw), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::os::unix::process::CommandExt;

    #[test]
    fn guard_kills_background_members_of_the_group() {
        let mut leader = Command::new("sh")
            .args(["-c", "sleep 30 & echo $!; wait"])
            .stdout(std::process::Stdio::piped())
            .process_group(0)
            .spawn()
            .unwrap();
        let mut line = String::new();
        std::io::BufRead::read_line(
            &mut std::io::BufReader::new(leader.stdout.take().unwrap()),
            &mut line,
        )
        .unwrap();
        let background: u32 = line.trim().parse().unwrap();
        assert!(is_running(background));

        drop(GroupKillGuard::new(Some(leader.id())));
        leader.wait().unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while is_running(background) {
            assert!(std::time::Instant::now() < deadline, "background sleep survived");
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
    }

    #[test]
    fn disarmed_guard_sends_nothing() {
        let mut child = Command::new("sleep").arg("30").process_group(0).spawn().unwrap();
        let mut guard = GroupKillGuard::new(Some(child.id()));
        guard.disarm();
        drop(guard);
        assert!(child.try_wait().unwrap().is_none());
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
