// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-process wrapper around the SQLite index.
//!
//! The [`Database`] mutex serializes all access to the connection. Writes from
//! the media path go through [`crate::writer`]'s single indexer task so a slow
//! disk can never stall a reader thread; background tasks (retention, the
//! reconciler) take the lock directly.

use crate::json::StreamCfg;
use crate::raw;
use crate::recording::{Time, Trigger};
use base::clock::{Clocks, RealClocks};
use base::{bail, err, Error, ErrorKind, Mutex, ResultExt as _};
use std::path::PathBuf;
use std::time::Duration;

/// Expected value of `meta.schema_version`.
pub const EXPECTED_SCHEMA_VERSION: i64 = 1;

/// A recording row as returned from queries.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordingRow {
    pub id: i64,
    pub stream: String,
    pub path: PathBuf,
    pub start: Time,
    pub end: Option<Time>,
    pub duration_90k: Option<i64>,
    pub size_bytes: i64,
    pub trigger: Trigger,
    pub completed: bool,
}

/// Arguments to open a new recording row (`completed=0, size=0`).
#[derive(Clone, Debug)]
pub struct RecordingToInsert {
    pub stream: String,
    pub path: PathBuf,
    pub start: Time,
    pub trigger: Trigger,
}

pub struct LockedDatabase {
    conn: rusqlite::Connection,
}

impl LockedDatabase {
    pub fn insert_recording(&mut self, r: &RecordingToInsert) -> Result<i64, Error> {
        let path = r
            .path
            .to_str()
            .ok_or_else(|| err!(InvalidArgument, msg("non-UTF-8 path {:?}", r.path)))?;
        raw::insert_recording(&self.conn, &r.stream, path, r.start, r.trigger)
    }

    pub fn update_recording_size(&mut self, id: i64, size_bytes: i64, end: Time) -> Result<(), Error> {
        raw::update_recording_size(&self.conn, id, size_bytes, end)
    }

    pub fn mark_recording_complete(
        &mut self,
        id: i64,
        size_bytes: i64,
        end: Time,
    ) -> Result<(), Error> {
        raw::mark_recording_complete(&self.conn, id, size_bytes, end)
    }

    pub fn delete_recording_row(&mut self, id: i64) -> Result<(), Error> {
        raw::delete_recording(&self.conn, id)
    }

    /// Visits completed recordings in ascending end-time order until `f`
    /// returns false.
    pub fn list_oldest_completed(
        &mut self,
        f: &mut dyn FnMut(RecordingRow) -> bool,
    ) -> Result<(), Error> {
        raw::list_oldest_completed(&self.conn, f)
    }

    pub fn list_uncompleted(&mut self) -> Result<Vec<RecordingRow>, Error> {
        raw::list_uncompleted(&self.conn)
    }

    pub fn total_completed_bytes(&mut self) -> Result<i64, Error> {
        raw::total_completed_bytes(&self.conn)
    }

    /// Total indexed bytes including files still being written.
    pub fn total_bytes(&mut self) -> Result<i64, Error> {
        raw::total_bytes(&self.conn)
    }

    pub fn list_completed_before(
        &mut self,
        stream: &str,
        before: Time,
    ) -> Result<Vec<RecordingRow>, Error> {
        raw::list_completed_before(&self.conn, stream, before)
    }

    pub fn streams(&mut self) -> Result<Vec<StreamCfg>, Error> {
        raw::list_streams(&self.conn)
    }

    pub fn insert_stream(&mut self, cfg: &StreamCfg) -> Result<(), Error> {
        raw::insert_stream(&self.conn, cfg)
    }

    pub fn update_stream(&mut self, cfg: &StreamCfg) -> Result<(), Error> {
        raw::update_stream(&self.conn, cfg)
    }

    pub fn delete_stream(&mut self, name: &str) -> Result<(), Error> {
        raw::delete_stream(&self.conn, name)
    }
}

pub struct Database<C: Clocks + Clone = RealClocks> {
    inner: Mutex<LockedDatabase>,
    clocks: C,
}

impl<C: Clocks + Clone> Database<C> {
    /// Wraps an open connection, verifying the schema version.
    pub fn new(clocks: C, conn: rusqlite::Connection) -> Result<Self, Error> {
        set_integrity_pragmas(&conn)?;
        let ver: Result<i64, _> =
            conn.query_row("select schema_version from meta", [], |row| row.get(0));
        match ver {
            Ok(EXPECTED_SCHEMA_VERSION) => {}
            Ok(v) => bail!(
                FailedPrecondition,
                msg("expected schema version {EXPECTED_SCHEMA_VERSION}, got {v}")
            ),
            Err(e) => bail!(
                FailedPrecondition,
                msg("unable to read schema version; was the database initialized with `lightnvr init`?"),
                source(e)
            ),
        }
        Ok(Database {
            inner: Mutex::new(LockedDatabase { conn }),
            clocks,
        })
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, LockedDatabase> {
        self.inner.lock()
    }

    pub fn clocks(&self) -> C {
        self.clocks.clone()
    }
}

fn set_integrity_pragmas(conn: &rusqlite::Connection) -> Result<(), Error> {
    // WAL keeps the indexer's writes from blocking the reconciler's reads.
    // The busy timeout bounds every statement so shutdown can always make
    // progress within its deadline.
    conn.pragma_update(None, "foreign_keys", true)
        .err_kind(ErrorKind::Internal)?;
    let _mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))
        .err_kind(ErrorKind::Internal)?;
    conn.pragma_update(None, "synchronous", "normal")
        .err_kind(ErrorKind::Internal)?;
    conn.busy_timeout(Duration::from_secs(2))
        .err_kind(ErrorKind::Internal)?;
    Ok(())
}

/// Initializes a fresh database; fails if it already has tables.
pub fn init(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    set_integrity_pragmas(conn)?;
    let tx = conn.transaction().err_kind(ErrorKind::Internal)?;
    tx.execute_batch(include_str!("schema.sql"))
        .map_err(|e| err!(FailedPrecondition, msg("unable to create schema"), source(e)))?;
    tx.execute(
        "insert into meta (schema_version) values (?1)",
        [EXPECTED_SCHEMA_VERSION],
    )
    .err_kind(ErrorKind::Internal)?;
    tx.commit().err_kind(ErrorKind::Internal)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn init_and_version_check() {
        testutil::init();
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        init(&mut conn).unwrap();
        let db = Database::new(base::clock::RealClocks {}, conn).unwrap();
        assert_eq!(db.lock().total_completed_bytes().unwrap(), 0);
    }

    #[test]
    fn uninitialized_rejected() {
        testutil::init();
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let e = Database::new(base::clock::RealClocks {}, conn).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::FailedPrecondition);
    }

    #[test]
    fn recording_row_lifecycle() {
        testutil::init();
        let db = testutil::TestDb::new();
        let id = db
            .db
            .lock()
            .insert_recording(&RecordingToInsert {
                stream: "driveway".to_owned(),
                path: "/tmp/x.mp4".into(),
                start: Time(100 * crate::TIME_UNITS_PER_SEC),
                trigger: Trigger::Continuous,
            })
            .unwrap();
        {
            let mut l = db.db.lock();
            let uncompleted = l.list_uncompleted().unwrap();
            assert_eq!(uncompleted.len(), 1);
            assert_eq!(uncompleted[0].id, id);
            assert_eq!(l.total_completed_bytes().unwrap(), 0);
            l.mark_recording_complete(id, 1_234, Time(160 * crate::TIME_UNITS_PER_SEC))
                .unwrap();
            assert!(l.list_uncompleted().unwrap().is_empty());
            assert_eq!(l.total_completed_bytes().unwrap(), 1_234);
            let mut rows = Vec::new();
            l.list_oldest_completed(&mut |r| {
                rows.push(r);
                true
            })
            .unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].duration_90k, Some(60 * crate::TIME_UNITS_PER_SEC));
            assert!(rows[0].completed);
            l.delete_recording_row(id).unwrap();
            assert_eq!(l.total_completed_bytes().unwrap(), 0);
        }
    }

    #[test]
    fn stream_config_persistence() {
        testutil::init();
        let db = testutil::TestDb::new();
        let mut cfg = testutil::stream_cfg("porch");
        db.db.lock().insert_stream(&cfg).unwrap();
        let e = db.db.lock().insert_stream(&cfg).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::AlreadyExists);
        cfg.record = true;
        db.db.lock().update_stream(&cfg).unwrap();
        assert_eq!(db.db.lock().streams().unwrap(), vec![cfg.clone()]);
        db.db.lock().delete_stream("porch").unwrap();
        assert!(db.db.lock().streams().unwrap().is_empty());
    }
}
