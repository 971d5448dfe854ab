// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The pid file: advisory-locked proof that one instance owns the var
//! directory, with eviction of a previous holder.

use base::clock::Clocks;
use base::{bail, err, Error};
use nix::fcntl::FlockArg;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io::{Read as _, Seek as _, Write as _};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// How long a SIGTERM'd previous instance gets to release the lock.
const EVICT_TERM_WAIT: Duration = Duration::from_secs(120);

/// Additional grace after SIGKILL.
const EVICT_KILL_WAIT: Duration = Duration::from_secs(5);

/// An exclusively locked pid file. The lock lives as long as this value;
/// dropping it removes the file.
pub struct PidFile {
    /// Held only for its flock; released on close.
    _file: fs::File,
    path: PathBuf,
}

impl PidFile {
    /// Claims `path`, evicting another holder if necessary: SIGTERM, wait,
    /// SIGKILL, wait. Failure to evict is an `Aborted` error, which the
    /// caller maps to exit code 2.
    pub fn claim<C: Clocks>(clocks: &C, path: &Path) -> Result<PidFile, Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if try_lock(&file)? {
            return Self::finish(file, path);
        }

        let holder = read_holder(&mut file);
        match holder {
            Some(pid) => {
                info!("evicting previous instance (pid {pid}) with SIGTERM");
                signal_holder(pid, Signal::SIGTERM);
            }
            None => warn!("pid file {} locked but unreadable", path.display()),
        }
        if Self::wait_for_lock(clocks, &file, EVICT_TERM_WAIT)? {
            return Self::finish(file, path);
        }
        if let Some(pid) = holder {
            warn!("previous instance (pid {pid}) ignored SIGTERM; sending SIGKILL");
            signal_holder(pid, Signal::SIGKILL);
        }
        if Self::wait_for_lock(clocks, &file, EVICT_KILL_WAIT)? {
            return Self::finish(file, path);
        }
        bail!(
            Aborted,
            msg("unable to evict holder of {}", path.display())
        )
    }

    /// Polls for the lock once a second up to `total`.
    fn wait_for_lock<C: Clocks>(
        clocks: &C,
        file: &fs::File,
        total: Duration,
    ) -> Result<bool, Error> {
        let deadline = clocks.monotonic() + total;
        loop {
            if try_lock(file)? {
                return Ok(true);
            }
            if clocks.monotonic() >= deadline {
                return Ok(false);
            }
            clocks.sleep(Duration::from_secs(1));
        }
    }

    fn finish(mut file: fs::File, path: &Path) -> Result<PidFile, Error> {
        file.set_len(0)?;
        file.rewind()?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(PidFile {
            _file: file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Unlink first; the lock itself releases when `file` closes.
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("unable to remove {}: {e}", self.path.display());
        }
    }
}

/// One non-blocking exclusive flock attempt.
fn try_lock(file: &fs::File) -> Result<bool, Error> {
    match nix::fcntl::flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(true),
        Err(nix::Error::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(err!(Unknown, msg("flock failed"), source(e))),
    }
}

/// Parses the decimal pid + newline written by a previous instance.
fn read_holder(file: &mut fs::File) -> Option<i32> {
    let mut contents = String::new();
    file.rewind().ok()?;
    file.read_to_string(&mut contents).ok()?;
    parse_pid(&contents)
}

fn parse_pid(contents: &str) -> Option<i32> {
    let pid: i32 = contents.trim().parse().ok()?;
    (pid > 1).then_some(pid)
}

fn signal_holder(pid: i32, signal: Signal) {
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) | Err(nix::Error::ESRCH) => {}
        Err(e) => warn!("unable to signal pid {pid}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::RealClocks;

    #[test]
    fn claim_writes_pid_and_drop_removes() {
        crate::testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lightnvr.pid");
        let p = PidFile::claim(&RealClocks {}, &path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
        assert!(contents.ends_with('\n'));
        drop(p);
        assert!(!path.exists());
    }

    #[test]
    fn second_open_sees_lock() {
        crate::testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lightnvr.pid");
        let _p = PidFile::claim(&RealClocks {}, &path).unwrap();
        // flock is per open-file-description; a second open conflicts even in
        // the same process.
        let other = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        assert!(!try_lock(&other).unwrap());
    }

    #[test]
    fn parse_holder_pid() {
        assert_eq!(parse_pid("1234\n"), Some(1234));
        assert_eq!(parse_pid("  99 "), Some(99));
        assert_eq!(parse_pid("0\n"), None);
        assert_eq!(parse_pid("ham"), None);
        assert_eq!(parse_pid(""), None);
    }
}
