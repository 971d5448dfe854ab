// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Subcommands.

use base::{err, Error, ResultExt as _};
use std::path::Path;

pub mod init;
pub mod run;

pub(crate) enum OpenMode {
    /// Open an existing database read/write.
    ReadWrite,

    /// Create a fresh database, failing if one exists.
    Create,
}

/// Opens the SQLite index at `<var_dir>/lightnvr.db`.
pub(crate) fn open_conn(var_dir: &Path, mode: OpenMode) -> Result<rusqlite::Connection, Error> {
    let path = var_dir.join("lightnvr.db");
    let flags = match mode {
        OpenMode::ReadWrite => rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE,
        OpenMode::Create => {
            if path.exists() {
                return Err(err!(
                    AlreadyExists,
                    msg("database {} already exists", path.display())
                ));
            }
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
        }
    };
    let conn = rusqlite::Connection::open_with_flags(
        &path,
        flags | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| err!(FailedPrecondition, msg("unable to open {}", path.display()), source(e)))?;
    conn.busy_timeout(std::time::Duration::from_secs(2))
        .err_kind(base::ErrorKind::Internal)?;
    Ok(conn)
}
