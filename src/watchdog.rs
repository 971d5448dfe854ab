// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The watchdog: a separate process that can kill a wedged parent.
//!
//! Forked before heavy initialization (and before any threads exist), the
//! child shares nothing with the parent but one pipe and its pid. The parent
//! writes a marker byte when shutdown begins; from then on the child allows
//! 30 s of cleanup, sends `SIGUSR1`, allows 15 s more, then `SIGKILL`s.
//! Pipe EOF at any point means the parent exited and the child goes away.
//! The child never does cleanup work itself; being a process rather than a
//! thread is exactly what lets it act when the parent can't.

use base::{err, Error};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, getppid, pipe, write, ForkResult, Pid};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use tracing::warn;

/// Cleanup allowance after the shutdown marker before `SIGUSR1`.
const USR1_AFTER_MS: i32 = 30_000;

/// Further allowance before `SIGKILL`.
const KILL_AFTER_MS: i32 = 15_000;

/// Parent-side handle. Dropping it (or exiting) closes the pipe, which the
/// child reads as a clean exit.
pub struct Watchdog {
    pipe_tx: OwnedFd,
}

impl Watchdog {
    /// Forks the watchdog child. Must run before the tokio runtime (or any
    /// other thread) exists.
    pub fn fork() -> Result<Watchdog, Error> {
        let (pipe_rx, pipe_tx) =
            pipe().map_err(|e| err!(Internal, msg("pipe failed"), source(e)))?;
        match unsafe { fork() }.map_err(|e| err!(Internal, msg("fork failed"), source(e)))? {
            ForkResult::Parent { .. } => {
                drop(pipe_rx);
                Ok(Watchdog { pipe_tx })
            }
            ForkResult::Child => {
                drop(pipe_tx);
                child_main(pipe_rx, getppid());
            }
        }
    }

    /// Tells the child cleanup has begun, starting its escalation clock.
    pub fn note_shutdown_begun(&self) {
        if let Err(e) = write(&self.pipe_tx, b"S") {
            warn!("unable to notify watchdog: {e}");
        }
    }
}

/// The child: syscalls only. No allocation, no logging, no locks; the
/// parent's heap and tracing state are unusable post-fork anyway.
fn child_main(pipe_rx: OwnedFd, parent: Pid) -> ! {
    let mut buf = [0u8; 1];
    loop {
        match nix::unistd::read(pipe_rx.as_raw_fd(), &mut buf) {
            Ok(0) => unsafe { libc::_exit(0) }, // parent exited cleanly
            Ok(_) if buf[0] == b'S' => break,   // shutdown began
            Ok(_) => {}
            Err(nix::Error::EINTR) => {}
            Err(_) => unsafe { libc::_exit(0) },
        }
    }
    if parent_gone_within(&pipe_rx, USR1_AFTER_MS) {
        unsafe { libc::_exit(0) }
    }
    let _ = kill(parent, Signal::SIGUSR1);
    if parent_gone_within(&pipe_rx, KILL_AFTER_MS) {
        unsafe { libc::_exit(0) }
    }
    let _ = kill(parent, Signal::SIGKILL);
    unsafe { libc::_exit(0) }
}

/// Waits up to `timeout_ms` for pipe EOF (parent exit).
fn parent_gone_within(pipe_rx: &OwnedFd, timeout_ms: i32) -> bool {
    let mut remaining = timeout_ms;
    loop {
        let mut fds = [PollFd::new(pipe_rx.as_fd(), PollFlags::POLLIN)];
        let timeout = nix::poll::PollTimeout::try_from(remaining as i128)
            .unwrap_or(nix::poll::PollTimeout::MAX);
        match poll(&mut fds, timeout) {
            Ok(0) => return false, // timeout
            Ok(_) => {
                let mut buf = [0u8; 1];
                match nix::unistd::read(pipe_rx.as_raw_fd(), &mut buf) {
                    Ok(0) | Err(_) => return true, // EOF or unreadable
                    Ok(_) => {}                    // stray byte; keep waiting
                }
            }
            Err(nix::Error::EINTR) => {
                // Imprecise re-wait is fine; the outer phases bound us.
                remaining = remaining.min(1_000);
            }
            Err(_) => return false,
        }
    }
}
