// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Raw database access: SQLite statements which do not touch any cached state.

use crate::db::RecordingRow;
use crate::json::StreamCfg;
use crate::recording::{Time, Trigger};
use base::{err, Error, ErrorKind, ResultExt as _};
use rusqlite::{named_params, params};
use std::path::PathBuf;

const INSERT_RECORDING_SQL: &str = r#"
    insert into recording (stream, path, start_ts_90k, trigger, completed)
    values (:stream, :path, :start_ts_90k, :trigger, 0)
"#;

const UPDATE_RECORDING_SIZE_SQL: &str = r#"
    update recording
    set size_bytes = :size_bytes, end_ts_90k = :end_ts_90k
    where id = :id
"#;

const MARK_RECORDING_COMPLETE_SQL: &str = r#"
    update recording
    set end_ts_90k = :end_ts_90k,
        duration_90k = :end_ts_90k - start_ts_90k,
        size_bytes = :size_bytes,
        completed = 1
    where id = :id
"#;

const DELETE_RECORDING_SQL: &str = r#"
    delete from recording where id = :id
"#;

const LIST_OLDEST_COMPLETED_SQL: &str = r#"
    select id, stream, path, start_ts_90k, end_ts_90k, duration_90k, size_bytes,
           trigger, completed
    from recording
    where completed = 1
    order by end_ts_90k
"#;

const LIST_UNCOMPLETED_SQL: &str = r#"
    select id, stream, path, start_ts_90k, end_ts_90k, duration_90k, size_bytes,
           trigger, completed
    from recording
    where completed = 0
"#;

const TOTAL_COMPLETED_BYTES_SQL: &str = r#"
    select coalesce(sum(size_bytes), 0) from recording where completed = 1
"#;

const TOTAL_BYTES_SQL: &str = r#"
    select coalesce(sum(size_bytes), 0) from recording
"#;

const OLDEST_COMPLETED_BEFORE_SQL: &str = r#"
    select id, stream, path, start_ts_90k, end_ts_90k, duration_90k, size_bytes,
           trigger, completed
    from recording
    where completed = 1 and stream = :stream and end_ts_90k < :before_90k
    order by end_ts_90k
"#;

fn row_from(row: &rusqlite::Row) -> Result<RecordingRow, Error> {
    Ok(RecordingRow {
        id: row.get(0).err_kind(ErrorKind::Internal)?,
        stream: row.get(1).err_kind(ErrorKind::Internal)?,
        path: PathBuf::from(row.get::<_, String>(2).err_kind(ErrorKind::Internal)?),
        start: Time(row.get(3).err_kind(ErrorKind::Internal)?),
        end: row
            .get::<_, Option<i64>>(4)
            .err_kind(ErrorKind::Internal)?
            .map(Time),
        duration_90k: row.get(5).err_kind(ErrorKind::Internal)?,
        size_bytes: row.get(6).err_kind(ErrorKind::Internal)?,
        trigger: Trigger::parse(&row.get::<_, String>(7).err_kind(ErrorKind::Internal)?)?,
        completed: row.get(8).err_kind(ErrorKind::Internal)?,
    })
}

pub(crate) fn insert_recording(
    conn: &rusqlite::Connection,
    stream: &str,
    path: &str,
    start: Time,
    trigger: Trigger,
) -> Result<i64, Error> {
    let mut stmt = conn
        .prepare_cached(INSERT_RECORDING_SQL)
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! {
        ":stream": stream,
        ":path": path,
        ":start_ts_90k": start.0,
        ":trigger": trigger.as_str(),
    })
    .err_kind(ErrorKind::Internal)?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn update_recording_size(
    conn: &rusqlite::Connection,
    id: i64,
    size_bytes: i64,
    end: Time,
) -> Result<(), Error> {
    let mut stmt = conn
        .prepare_cached(UPDATE_RECORDING_SIZE_SQL)
        .err_kind(ErrorKind::Internal)?;
    let changed = stmt
        .execute(named_params! {
            ":id": id,
            ":size_bytes": size_bytes,
            ":end_ts_90k": end.0,
        })
        .err_kind(ErrorKind::Internal)?;
    if changed != 1 {
        return Err(err!(NotFound, msg("no recording row {id}")));
    }
    Ok(())
}

pub(crate) fn mark_recording_complete(
    conn: &rusqlite::Connection,
    id: i64,
    size_bytes: i64,
    end: Time,
) -> Result<(), Error> {
    let mut stmt = conn
        .prepare_cached(MARK_RECORDING_COMPLETE_SQL)
        .err_kind(ErrorKind::Internal)?;
    let changed = stmt
        .execute(named_params! {
            ":id": id,
            ":size_bytes": size_bytes,
            ":end_ts_90k": end.0,
        })
        .err_kind(ErrorKind::Internal)?;
    if changed != 1 {
        return Err(err!(NotFound, msg("no recording row {id}")));
    }
    Ok(())
}

pub(crate) fn delete_recording(conn: &rusqlite::Connection, id: i64) -> Result<(), Error> {
    let mut stmt = conn
        .prepare_cached(DELETE_RECORDING_SQL)
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! { ":id": id })
        .err_kind(ErrorKind::Internal)?;
    Ok(())
}

/// Lists completed recordings in ascending `end_ts_90k` order, passing them to
/// a supplied function until it returns false. Given that the function is
/// called with the database lock held, it should be quick.
pub(crate) fn list_oldest_completed(
    conn: &rusqlite::Connection,
    f: &mut dyn FnMut(RecordingRow) -> bool,
) -> Result<(), Error> {
    let mut stmt = conn
        .prepare_cached(LIST_OLDEST_COMPLETED_SQL)
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt.query([]).err_kind(ErrorKind::Internal)?;
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        if !f(row_from(row)?) {
            break;
        }
    }
    Ok(())
}

pub(crate) fn list_uncompleted(
    conn: &rusqlite::Connection,
) -> Result<Vec<RecordingRow>, Error> {
    let mut stmt = conn
        .prepare_cached(LIST_UNCOMPLETED_SQL)
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt.query([]).err_kind(ErrorKind::Internal)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        out.push(row_from(row)?);
    }
    Ok(out)
}

pub(crate) fn total_completed_bytes(conn: &rusqlite::Connection) -> Result<i64, Error> {
    conn.query_row(TOTAL_COMPLETED_BYTES_SQL, [], |row| row.get(0))
        .err_kind(ErrorKind::Internal)
}

pub(crate) fn total_bytes(conn: &rusqlite::Connection) -> Result<i64, Error> {
    conn.query_row(TOTAL_BYTES_SQL, [], |row| row.get(0))
        .err_kind(ErrorKind::Internal)
}

pub(crate) fn list_completed_before(
    conn: &rusqlite::Connection,
    stream: &str,
    before: Time,
) -> Result<Vec<RecordingRow>, Error> {
    let mut stmt = conn
        .prepare_cached(OLDEST_COMPLETED_BEFORE_SQL)
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt
        .query(named_params! { ":stream": stream, ":before_90k": before.0 })
        .err_kind(ErrorKind::Internal)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        out.push(row_from(row)?);
    }
    Ok(out)
}

pub(crate) fn list_streams(conn: &rusqlite::Connection) -> Result<Vec<StreamCfg>, Error> {
    let mut stmt = conn
        .prepare_cached("select config from stream order by name")
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt.query([]).err_kind(ErrorKind::Internal)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        let config: String = row.get(0).err_kind(ErrorKind::Internal)?;
        out.push(
            serde_json::from_str(&config)
                .map_err(|e| err!(DataLoss, msg("bad stream config"), source(e)))?,
        );
    }
    Ok(out)
}

pub(crate) fn insert_stream(conn: &rusqlite::Connection, cfg: &StreamCfg) -> Result<(), Error> {
    let config =
        serde_json::to_string(cfg).map_err(|e| err!(Internal, source(e)))?;
    let r = conn
        .prepare_cached("insert into stream (name, config) values (?1, ?2)")
        .err_kind(ErrorKind::Internal)?
        .execute(params![&cfg.name, &config]);
    match r {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(err!(AlreadyExists, msg("stream {:?} already exists", cfg.name)))
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn update_stream(conn: &rusqlite::Connection, cfg: &StreamCfg) -> Result<(), Error> {
    let config =
        serde_json::to_string(cfg).map_err(|e| err!(Internal, source(e)))?;
    let changed = conn
        .prepare_cached("update stream set config = ?2 where name = ?1")
        .err_kind(ErrorKind::Internal)?
        .execute(params![&cfg.name, &config])
        .err_kind(ErrorKind::Internal)?;
    if changed != 1 {
        return Err(err!(NotFound, msg("no stream {:?}", cfg.name)));
    }
    Ok(())
}

pub(crate) fn delete_stream(conn: &rusqlite::Connection, name: &str) -> Result<(), Error> {
    let changed = conn
        .prepare_cached("delete from stream where name = ?1")
        .err_kind(ErrorKind::Internal)?
        .execute(params![name])
        .err_kind(ErrorKind::Internal)?;
    if changed != 1 {
        return Err(err!(NotFound, msg("no stream {name:?}")));
    }
    Ok(())
}
