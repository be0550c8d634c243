//! pidfd-based process watching.
//!
//! One pidfd is held per watched PID; the descriptor becomes readable when
//! the process exits, at which point every registry entry carrying that
//! PID is removed. `pidfd_open` failing with `ESRCH` means the process is
//! already gone, so the removal happens immediately.
//!
//! glibc offers no wrapper for the syscall, so it goes through
//! `libc::syscall` directly.

use std::collections::HashMap;
use std::os::fd::{FromRawFd, OwnedFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::DaemonCmd;

fn pidfd_open(pid: u32) -> std::io::Result<OwnedFd> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0u32) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

/// Whether this kernel supports `pidfd_open`.
pub fn pidfd_supported() -> bool {
    match pidfd_open(std::process::id()) {
        Ok(_) => true,
        Err(e) => e.raw_os_error() != Some(libc::ENOSYS),
    }
}

struct WatchEntry {
    refs: u32,
    task: JoinHandle<()>,
}

/// Reference-counted pidfd watches keyed by PID. Owned by the registry
/// actor.
pub struct ProcessWatch {
    entries: HashMap<u32, WatchEntry>,
    cmd_tx: mpsc::Sender<DaemonCmd>,
}

impl ProcessWatch {
    pub(crate) fn new(cmd_tx: mpsc::Sender<DaemonCmd>) -> Self {
        Self {
            entries: HashMap::new(),
            cmd_tx,
        }
    }

    /// Start (or reference) a watch on `pid`.
    pub fn add(&mut self, pid: u32) {
        if let Some(entry) = self.entries.get_mut(&pid) {
            entry.refs += 1;
            return;
        }

        let fd = match pidfd_open(pid) {
            Ok(fd) => fd,
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                // Already gone; clean up as if we had seen the exit.
                debug!(pid, "process already exited at watch time");
                let tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(DaemonCmd::PidExited(pid)).await;
                });
                return;
            }
            Err(e) => {
                warn!(pid, "failed to watch process: {e}");
                return;
            }
        };

        let tx = self.cmd_tx.clone();
        let task = tokio::spawn(async move {
            let async_fd = match AsyncFd::with_interest(fd, Interest::READABLE) {
                Ok(fd) => fd,
                Err(e) => {
                    warn!(pid, "pidfd registration failed: {e}");
                    return;
                }
            };
            // Readable exactly once: when the process exits.
            if async_fd.readable().await.is_ok() {
                debug!(pid, "watched process exited");
                let _ = tx.send(DaemonCmd::PidExited(pid)).await;
            }
        });

        self.entries.insert(pid, WatchEntry { refs: 1, task });
    }

    /// Drop one reference on the watch; the pidfd is released with the
    /// last one.
    pub fn remove(&mut self, pid: u32) {
        let Some(entry) = self.entries.get_mut(&pid) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            if let Some(entry) = self.entries.remove(&pid) {
                entry.task.abort();
            }
        }
    }

}

impl Drop for ProcessWatch {
    fn drop(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_has_a_pidfd() {
        // The daemon probes support by opening a pidfd on itself.
        assert!(pidfd_supported());
        assert!(pidfd_open(std::process::id()).is_ok());
    }

    #[tokio::test]
    async fn exited_process_reports_immediately() {
        // A reaped child is guaranteed to be gone by the time it is
        // watched, which exercises the ESRCH short-circuit.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let mut watch = ProcessWatch::new(tx);
        watch.add(pid);
        match rx.recv().await {
            Some(DaemonCmd::PidExited(exited)) => assert_eq!(exited, pid),
            _ => panic!("expected immediate exit notification"),
        }
    }
}
