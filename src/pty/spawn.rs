//! PTY allocation, terminal spawning, and resize.
//!
//! Thin wrappers over the `nix` PTY APIs, surfaced as `std::io` errors like
//! the rest of the gateway's process plumbing. The PTY master fd is kept
//! alive for the session lifetime so I/O and resize operations can be
//! performed on it.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::process::{Child, Command};

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Allocate a PTY pair at the given terminal geometry.
pub fn allocate_pty(rows: u16, cols: u16) -> std::io::Result<PtyPair> {
    let OpenptyResult { master, slave } = openpty(&winsize(rows, cols), None)
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
    Ok(PtyPair { master, slave })
}

/// Spawn a terminal program on the slave side of the PTY.
///
/// `argv[0]` is the program; the rest are its arguments — either the login
/// shell (`<shell> -l`) or the process muxer (`<muxer> -A -s <id>`). The
/// child becomes a session leader with the PTY slave as its controlling
/// terminal; stdin/stdout/stderr are all connected to the slave fd.
pub fn spawn_terminal(
    pty: &PtyPair,
    argv: &[String],
    working_dir: &str,
    env: &HashMap<String, String>,
) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| std::io::Error::other("empty terminal argv"))?;

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.current_dir(working_dir).kill_on_drop(true);

    // The child's stdio is handled by pre_exec (dup2 to PTY slave), so tell
    // tokio not to set up pipes.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    cmd.envs(env);

    // SAFETY: All syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            // Create a new session so the child is the session leader
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            // Set the PTY slave as the controlling terminal
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            // Redirect stdin/stdout/stderr to the PTY slave
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Resize a PTY's terminal window.
pub fn resize_pty(master: &OwnedFd, rows: u16, cols: u16) -> std::io::Result<()> {
    let size = winsize(rows, cols);
    // SAFETY: TIOCSWINSZ reads a Winsize struct through the pointer.
    let ret = unsafe {
        libc::ioctl(
            master.as_raw_fd(),
            libc::TIOCSWINSZ,
            std::ptr::addr_of!(size),
        )
    };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}
