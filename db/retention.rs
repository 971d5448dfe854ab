// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Retention: deleting old recordings to stay within the disk budget, plus
//! the periodic reconciler which corrects size drift in the index.
//!
//! The index is authoritative for what exists on disk; sweeps walk rows, not
//! directories. Deletion order is unlink first, then row, so a crash
//! mid-sweep leaves at worst a row pointing at a missing file, which the next
//! sweep's `ENOENT` tolerance cleans up.

use crate::db::Database;
use crate::recording::{Duration as Duration90k, Time};
use base::clock::Clocks;
use base::strutil::encode_size;
use base::{bail, Error};
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often the reconciler stats in-progress files.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Global disk budget and water marks.
#[derive(Clone, Copy, Debug)]
pub struct RetentionPolicy {
    pub max_storage_bytes: i64,

    /// Sweep when usage exceeds this; defaults to 95% of the budget.
    pub high_water_bytes: Option<i64>,

    /// Sweep down to this; defaults to 85% of the budget.
    pub low_water_bytes: Option<i64>,
}

impl RetentionPolicy {
    pub fn high_water(&self) -> i64 {
        self.high_water_bytes
            .unwrap_or(self.max_storage_bytes / 100 * 95)
    }

    pub fn low_water(&self) -> i64 {
        self.low_water_bytes
            .unwrap_or(self.max_storage_bytes / 100 * 85)
    }
}

/// Why a sweep is running now.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SweepReason {
    Scheduled,
    DiskPressure,
}

/// Handle for asking the retainer to sweep ahead of schedule, e.g. on a
/// writer's `ENOSPC`.
#[derive(Clone)]
pub struct RetainerChannel(mpsc::Sender<SweepReason>);

impl RetainerChannel {
    pub fn kick(&self, reason: SweepReason) {
        let _ = self.0.send(reason);
    }
}

/// Starts the retention/reconciler thread. It exits when every
/// [`RetainerChannel`] clone is dropped or shutdown is requested.
pub fn spawn_retainer<C: Clocks + Clone>(
    db: Arc<Database<C>>,
    policy: RetentionPolicy,
    shutdown_rx: base::shutdown::Receiver,
) -> (RetainerChannel, std::thread::JoinHandle<()>) {
    let (snd, rcv) = mpsc::channel();
    let join = std::thread::Builder::new()
        .name("retention".to_owned())
        .spawn(move || {
            info!("starting");
            let mut r = Retainer {
                db,
                policy,
                shutdown_rx,
            };
            r.run(rcv);
            info!("ending");
        })
        .expect("can't create retention thread");
    (RetainerChannel(snd), join)
}

struct Retainer<C: Clocks + Clone> {
    db: Arc<Database<C>>,
    policy: RetentionPolicy,
    shutdown_rx: base::shutdown::Receiver,
}

impl<C: Clocks + Clone> Retainer<C> {
    fn run(&mut self, rcv: mpsc::Receiver<SweepReason>) {
        let clocks = self.db.clocks();
        let mut next_reconcile = clocks.monotonic() + RECONCILE_INTERVAL;
        loop {
            if self.shutdown_rx.check().is_err() {
                break;
            }
            // Wake at least once a second so shutdown is never blocked on the
            // reconcile interval.
            match clocks.recv_timeout(&rcv, Duration::from_secs(1)) {
                Ok(reason) => {
                    if let Err(e) = self.sweep_if_needed(reason) {
                        warn!(err = %e.chain(), "sweep aborted");
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
            if clocks.monotonic() >= next_reconcile {
                next_reconcile = clocks.monotonic() + RECONCILE_INTERVAL;
                if let Err(e) = self.reconcile() {
                    warn!(err = %e.chain(), "reconcile failed");
                }
                if let Err(e) = self.enforce_ttl() {
                    warn!(err = %e.chain(), "ttl enforcement failed");
                }
                if let Err(e) = self.sweep_if_needed(SweepReason::Scheduled) {
                    warn!(err = %e.chain(), "sweep aborted");
                }
            }
        }
    }

    fn reconcile(&mut self) -> Result<(), Error> {
        let rows = self.db.lock().list_uncompleted()?;
        let now = Time::from_jiff(self.db.clocks().realtime());
        for row in rows {
            match std::fs::metadata(&row.path) {
                Ok(m) => {
                    let len = m.len() as i64;
                    if len != row.size_bytes {
                        debug!(
                            "{}: correcting size drift {} -> {}",
                            row.path.display(),
                            row.size_bytes,
                            len
                        );
                        self.db.lock().update_recording_size(row.id, len, now)?;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Either the writer hasn't created it yet or it's gone for
                    // good; startup adoption decides which.
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn enforce_ttl(&mut self) -> Result<(), Error> {
        let streams = self.db.lock().streams()?;
        let now = Time::from_jiff(self.db.clocks().realtime());
        for s in streams {
            let Some(ttl_days) = s.retention.and_then(|r| r.ttl_days) else {
                continue;
            };
            let cutoff = Time(now.0 - Duration90k::from_secs(i64::from(ttl_days) * 86_400).0);
            let expired = self.db.lock().list_completed_before(&s.name, cutoff)?;
            for row in expired {
                delete_recording_file(&row.path)?;
                self.db.lock().delete_recording_row(row.id)?;
                info!(
                    "{}: deleted expired recording {} ({})",
                    s.name,
                    row.path.display(),
                    encode_size(row.size_bytes)
                );
            }
        }
        Ok(())
    }

    fn sweep_if_needed(&mut self, reason: SweepReason) -> Result<(), Error> {
        let usage = self.db.lock().total_bytes()?;
        if usage <= self.policy.high_water() && reason != SweepReason::DiskPressure {
            return Ok(());
        }
        if usage <= self.policy.low_water() {
            return Ok(());
        }
        info!(
            ?reason,
            "sweeping: usage {} of budget {}",
            encode_size(usage),
            encode_size(self.policy.max_storage_bytes)
        );
        sweep(&self.db, usage, self.policy.low_water())
    }
}

/// Deletes completed recordings, oldest end time first, until `usage` is at
/// or below `low_water`. Aborts on the first unexpected unlink error.
pub fn sweep<C: Clocks + Clone>(
    db: &Database<C>,
    mut usage: i64,
    low_water: i64,
) -> Result<(), Error> {
    let mut candidates = Vec::new();
    {
        let mut needed = usage - low_water;
        db.lock().list_oldest_completed(&mut |row| {
            needed -= row.size_bytes;
            candidates.push(row);
            needed > 0
        })?;
    }
    for row in candidates {
        if usage <= low_water {
            break;
        }
        delete_recording_file(&row.path)?;
        db.lock().delete_recording_row(row.id)?;
        usage -= row.size_bytes;
        info!(
            "{}: deleted {} ({}); usage now {}",
            row.stream,
            row.path.display(),
            encode_size(row.size_bytes),
            encode_size(usage)
        );
    }
    if usage > low_water {
        bail!(
            ResourceExhausted,
            msg(
                "no deletable recordings left; usage {} still above low water {}",
                encode_size(usage),
                encode_size(low_water)
            )
        );
    }
    Ok(())
}

/// Unlinks a recording file. A missing file is fine (the row is stale); any
/// other error aborts the caller's sweep.
fn delete_recording_file(path: &Path) -> Result<(), Error> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("{}: already missing before deletion", path.display());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Startup pass over rows left `completed=0` by an earlier run: adopt the
/// file's current size if it exists, drop the row if it doesn't.
pub fn adopt_uncompleted<C: Clocks + Clone>(db: &Database<C>) -> Result<(), Error> {
    let rows = db.lock().list_uncompleted()?;
    let now = Time::from_jiff(db.clocks().realtime());
    for row in rows {
        match std::fs::metadata(&row.path) {
            Ok(m) => {
                info!(
                    "{}: adopting interrupted recording ({})",
                    row.path.display(),
                    encode_size(m.len() as i64)
                );
                db.lock()
                    .mark_recording_complete(row.id, m.len() as i64, row.end.unwrap_or(now))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("{}: file missing; dropping row", row.path.display());
                db.lock().delete_recording_row(row.id)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::RecordingToInsert;
    use crate::recording::{Trigger, TIME_UNITS_PER_SEC};
    use crate::testutil;

    const MIB: i64 = 1 << 20;

    /// Pre-seeds `n` completed 10 MiB recordings ending at hours 1..=n.
    fn seed(tdb: &testutil::TestDb, n: usize) -> Vec<std::path::PathBuf> {
        let mut paths = Vec::new();
        for i in 0..n {
            let path = tdb.tmpdir.path().join(format!("r{i}.mp4"));
            std::fs::write(&path, vec![0u8; 16]).unwrap(); // content size is irrelevant
            let id = tdb
                .db
                .lock()
                .insert_recording(&RecordingToInsert {
                    stream: "driveway".to_owned(),
                    path: path.clone(),
                    start: Time(i as i64 * 3600 * TIME_UNITS_PER_SEC),
                    trigger: Trigger::Continuous,
                })
                .unwrap();
            tdb.db
                .lock()
                .mark_recording_complete(
                    id,
                    10 * MIB,
                    Time((i as i64 + 1) * 3600 * TIME_UNITS_PER_SEC),
                )
                .unwrap();
            paths.push(path);
        }
        paths
    }

    #[test]
    fn sweep_deletes_oldest_to_low_water() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let paths = seed(&tdb, 10);
        let usage = tdb.db.lock().total_bytes().unwrap();
        assert_eq!(usage, 100 * MIB);

        // max 70 MiB, low water 60 MiB: exactly the 4 oldest go.
        sweep(&tdb.db, usage, 60 * MIB).unwrap();
        assert_eq!(tdb.db.lock().total_bytes().unwrap(), 60 * MIB);
        for (i, p) in paths.iter().enumerate() {
            assert_eq!(p.exists(), i >= 4, "file {i}");
        }
    }

    #[test]
    fn sweep_tolerates_missing_file() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let paths = seed(&tdb, 2);
        std::fs::remove_file(&paths[0]).unwrap();
        sweep(&tdb.db, 20 * MIB, 10 * MIB).unwrap();
        assert_eq!(tdb.db.lock().total_bytes().unwrap(), 10 * MIB);
    }

    #[test]
    fn sweep_never_touches_uncompleted() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let path = tdb.tmpdir.path().join("open.mp4");
        std::fs::write(&path, b"x").unwrap();
        let id = tdb
            .db
            .lock()
            .insert_recording(&RecordingToInsert {
                stream: "driveway".to_owned(),
                path: path.clone(),
                start: Time(0),
                trigger: Trigger::Continuous,
            })
            .unwrap();
        tdb.db.lock().update_recording_size(id, 100 * MIB, Time(1)).unwrap();
        // Nothing deletable: the sweep reports failure but leaves the open
        // file and its row alone.
        sweep(&tdb.db, 100 * MIB, 10 * MIB).unwrap_err();
        assert!(path.exists());
        assert_eq!(tdb.db.lock().list_uncompleted().unwrap().len(), 1);
    }

    #[test]
    fn adopt_interrupted_rows() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let kept = tdb.tmpdir.path().join("kept.mp4");
        std::fs::write(&kept, vec![0u8; 1234]).unwrap();
        let gone = tdb.tmpdir.path().join("gone.mp4");
        for p in [&kept, &gone] {
            tdb.db
                .lock()
                .insert_recording(&RecordingToInsert {
                    stream: "driveway".to_owned(),
                    path: p.clone(),
                    start: Time(0),
                    trigger: Trigger::Continuous,
                })
                .unwrap();
        }
        adopt_uncompleted(&tdb.db).unwrap();
        let mut l = tdb.db.lock();
        assert!(l.list_uncompleted().unwrap().is_empty());
        assert_eq!(l.total_completed_bytes().unwrap(), 1234);
    }
}
