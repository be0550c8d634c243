//! Netlink-connector fallback for process watching.
//!
//! On kernels without `pidfd_open` the daemon subscribes to
//! `NETLINK_CONNECTOR`/`CN_IDX_PROC` and filters `PROC_EVENT_EXIT`
//! notifications. Only abnormal terminations matter: a cleanly exiting
//! process unregisters its own servers. When a process exits on a signal
//! the exit code is 128 plus the signal number, except SIGKILL where the
//! code is SIGKILL itself; 255 is an out-of-range exit code, not a signal.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::DaemonCmd;

const NLMSG_DONE: u16 = 0x3;
const NLMSG_HDRLEN: usize = 16;

const CN_IDX_PROC: u32 = 0x1;
const CN_VAL_PROC: u32 = 0x1;
const CN_MSG_LEN: usize = 20;

const PROC_CN_MCAST_LISTEN: u32 = 1;
const PROC_EVENT_EXIT: u32 = 0x8000_0000;

/// `what`(4) + `cpu`(4) + padding to the 8-aligned `timestamp_ns`(8).
const PROC_EVENT_DATA_OFFSET: usize = 16;

fn last_error() -> std::io::Error {
    std::io::Error::last_os_error()
}

/// Open, bind and subscribe the connector socket.
fn open_connector() -> std::io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::PF_NETLINK,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::NETLINK_CONNECTOR,
        )
    };
    if fd < 0 {
        return Err(last_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_pid = std::process::id();
    addr.nl_groups = CN_IDX_PROC;
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(last_error());
    }

    // Subscribe: nlmsghdr + cn_msg + PROC_CN_MCAST_LISTEN.
    let mut msg = Vec::with_capacity(NLMSG_HDRLEN + CN_MSG_LEN + 4);
    let total = (NLMSG_HDRLEN + CN_MSG_LEN + 4) as u32;
    msg.extend_from_slice(&total.to_ne_bytes());
    msg.extend_from_slice(&NLMSG_DONE.to_ne_bytes());
    msg.extend_from_slice(&0u16.to_ne_bytes()); // flags
    msg.extend_from_slice(&0u32.to_ne_bytes()); // seq
    msg.extend_from_slice(&std::process::id().to_ne_bytes());
    msg.extend_from_slice(&CN_IDX_PROC.to_ne_bytes());
    msg.extend_from_slice(&CN_VAL_PROC.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes()); // seq
    msg.extend_from_slice(&0u32.to_ne_bytes()); // ack
    msg.extend_from_slice(&4u16.to_ne_bytes()); // payload len
    msg.extend_from_slice(&0u16.to_ne_bytes()); // flags
    msg.extend_from_slice(&PROC_CN_MCAST_LISTEN.to_ne_bytes());

    let sent = unsafe {
        libc::send(
            fd.as_raw_fd(),
            msg.as_ptr() as *const libc::c_void,
            msg.len(),
            0,
        )
    };
    if sent < 0 {
        return Err(last_error());
    }
    Ok(fd)
}

/// Pull the abnormally-exited PID out of one connector datagram, if that
/// is what it carries.
fn parse_exit_event(buf: &[u8]) -> Option<u32> {
    if buf.len() < NLMSG_HDRLEN + CN_MSG_LEN {
        return None;
    }
    let nlmsg_type = u16::from_ne_bytes([buf[4], buf[5]]);
    if nlmsg_type != NLMSG_DONE {
        return None;
    }

    let event = &buf[NLMSG_HDRLEN + CN_MSG_LEN..];
    if event.len() < PROC_EVENT_DATA_OFFSET + 16 {
        return None;
    }
    let what = u32::from_ne_bytes(event[0..4].try_into().ok()?);
    if what != PROC_EVENT_EXIT {
        return None;
    }

    let data = &event[PROC_EVENT_DATA_OFFSET..];
    let pid = i32::from_ne_bytes(data[0..4].try_into().ok()?);
    let tgid = i32::from_ne_bytes(data[4..8].try_into().ok()?);
    let exit_code = u32::from_ne_bytes(data[8..12].try_into().ok()?);

    // Thread exits and orderly terminations are not interesting.
    if pid != tgid {
        return None;
    }
    let abnormal =
        exit_code == libc::SIGKILL as u32 || (exit_code > 128 && exit_code < 255);
    abnormal.then_some(pid as u32)
}

/// Subscribe to process exit events and forward abnormal terminations to
/// the registry actor.
pub(crate) fn spawn_exit_watch(
    cmd_tx: mpsc::Sender<DaemonCmd>,
) -> std::io::Result<JoinHandle<()>> {
    let fd = open_connector()?;
    let task = tokio::spawn(async move {
        let async_fd = match AsyncFd::with_interest(fd, Interest::READABLE) {
            Ok(fd) => fd,
            Err(e) => {
                warn!("connector registration failed: {e}");
                return;
            }
        };
        let mut buf = [0u8; 4096];
        loop {
            let mut guard = match async_fd.readable().await {
                Ok(guard) => guard,
                Err(_) => return,
            };
            let received = guard.try_io(|inner| {
                let n = unsafe {
                    libc::recv(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                    )
                };
                if n < 0 {
                    Err(last_error())
                } else {
                    Ok(n as usize)
                }
            });
            match received {
                Ok(Ok(n)) => {
                    if let Some(pid) = parse_exit_event(&buf[..n]) {
                        debug!(pid, "abnormal process exit observed");
                        if cmd_tx.send(DaemonCmd::PidExited(pid)).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!("connector receive failed: {e}");
                    return;
                }
                Err(_would_block) => continue,
            }
        }
    });
    Ok(task)
}
