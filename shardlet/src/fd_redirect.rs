//! File descriptor redirection for protocol isolation.
//!
//! The worker uses fd 0/1 as the channel to the daemon. Anything else that
//! writes to fd 1 (a stray `println!`, a library, a child process inheriting
//! it) injects garbage frames into that channel, and anything that reads fd 0
//! steals requests.
//!
//! [`isolate_protocol_stdio`] duplicates fd 0/1 for the protocol, then points
//! fd 1 at stderr and fd 0 at `/dev/null`. Must be called before any
//! application code touches stdio.
//!
//! ## Safety contracts
//!
//! The `unsafe` blocks rely on:
//! 1. Standard fds (0, 1, 2) being open for the life of the process
//! 2. Nothing else reading or writing fds 0/1 while the swap happens
//! 3. `forget` after `dup2` onto a standard fd, so it is never closed

#[cfg(unix)]
use std::io;
#[cfg(unix)]
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd};

#[cfg(unix)]
use nix::unistd::dup2;

#[cfg(unix)]
pub struct ProtocolStdio {
    pub input: tokio::fs::File,
    pub output: tokio::fs::File,
}

/// Move the protocol channel off fds 0/1.
#[cfg(unix)]
pub fn isolate_protocol_stdio() -> io::Result<ProtocolStdio> {
    // Safety: standard fds are open (contract 1). try_clone_to_owned dups
    // with CLOEXEC, so child processes do not inherit the protocol fds.
    let protocol_in = unsafe { BorrowedFd::borrow_raw(0) }.try_clone_to_owned()?;
    let protocol_out = unsafe { BorrowedFd::borrow_raw(1) }.try_clone_to_owned()?;

    tracing::debug!("Pointing fd 1 at stderr");
    let stderr = unsafe { BorrowedFd::borrow_raw(2) };
    let mut target_stdout = unsafe { OwnedFd::from_raw_fd(1) };
    dup2(stderr, &mut target_stdout)
        .map_err(|e| io::Error::other(format!("dup2(stderr -> 1) failed: {}", e)))?;
    std::mem::forget(target_stdout); // Don't close fd 1

    tracing::debug!("Pointing fd 0 at /dev/null");
    let devnull = OwnedFd::from(std::fs::File::open("/dev/null")?);
    let mut target_stdin = unsafe { OwnedFd::from_raw_fd(0) };
    dup2(&devnull, &mut target_stdin)
        .map_err(|e| io::Error::other(format!("dup2(/dev/null -> 0) failed: {}", e)))?;
    std::mem::forget(target_stdin); // Don't close fd 0

    tracing::info!("Protocol channel isolated from standard fds");

    Ok(ProtocolStdio {
        input: tokio::fs::File::from_std(std::fs::File::from(protocol_in)),
        output: tokio::fs::File::from_std(std::fs::File::from(protocol_out)),
    })
}

#[cfg(not(unix))]
pub struct ProtocolStdio {
    pub input: tokio::io::Stdin,
    pub output: tokio::io::Stdout,
}

#[cfg(not(unix))]
pub fn isolate_protocol_stdio() -> std::io::Result<ProtocolStdio> {
    // No fd redirection on non-Unix - stray output will reach the daemon
    tracing::warn!("Protocol isolation is only supported on unix");
    Ok(ProtocolStdio {
        input: tokio::io::stdin(),
        output: tokio::io::stdout(),
    })
}
