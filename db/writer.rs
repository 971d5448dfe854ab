// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The indexer: a single writer task through which the media path updates
//! recording rows.
//!
//! Consumers never touch SQLite directly; they send commands keyed by a
//! caller-chosen token and keep streaming. A database hiccup retries with
//! jittered backoff, and a persistently sick database degrades the index to a
//! write-back queue which is flushed once it recovers. Commands sent on the
//! channel are therefore applied at least once, possibly late, but never
//! block a reader or writer thread.

use crate::db::{Database, RecordingToInsert};
use crate::recording::Time;
use base::clock::Clocks;
use base::{err, Error, FastHashMap};
use rand::Rng as _;
use std::collections::VecDeque;
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts per command before parking it on the write-back queue.
const MAX_ATTEMPTS: usize = 3;

/// How often the write-back queue is retried while commands are sparse.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

enum Command {
    Open {
        token: u64,
        rec: RecordingToInsert,
    },
    Update {
        token: u64,
        size_bytes: i64,
        end: Time,
    },
    Close {
        token: u64,
        size_bytes: i64,
        end: Time,
    },
    /// For tests: applies everything queued so far, then drops the sender.
    Flush(mpsc::Sender<()>),
}

/// A channel which can be used to send commands to the indexer.
/// Can be cloned to allow multiple threads to send commands.
#[derive(Clone)]
pub struct IndexerChannel(mpsc::Sender<Command>);

impl IndexerChannel {
    /// Asks the indexer to insert a row for a newly opened file. The `token`
    /// is caller-chosen and scopes later `update`/`close` calls; it need only
    /// be unique among rows this channel's clones have open.
    pub fn open(&self, token: u64, rec: RecordingToInsert) {
        let _ = self.0.send(Command::Open { token, rec });
    }

    pub fn update(&self, token: u64, size_bytes: i64, end: Time) {
        let _ = self.0.send(Command::Update {
            token,
            size_bytes,
            end,
        });
    }

    pub fn close(&self, token: u64, size_bytes: i64, end: Time) {
        let _ = self.0.send(Command::Close {
            token,
            size_bytes,
            end,
        });
    }

    /// Waits for all currently-queued commands to be applied (or parked).
    pub fn flush(&self) {
        let (snd, rcv) = mpsc::channel();
        if self.0.send(Command::Flush(snd)).is_err() {
            return;
        }
        // The indexer drops the sender once it has processed the command.
        let _ = rcv.recv();
    }
}

/// Starts the indexer thread for the given database.
///
/// The thread exits once every [`IndexerChannel`] clone has been dropped and
/// the queue is drained, so at program shutdown consumers should finalize
/// (sending their `close` commands), drop their channels, and then this
/// handle should be joined.
pub fn start_indexer<C: Clocks + Clone>(
    db: Arc<Database<C>>,
) -> (IndexerChannel, std::thread::JoinHandle<()>) {
    let (snd, rcv) = mpsc::channel();
    let join = std::thread::Builder::new()
        .name("indexer".to_owned())
        .spawn(move || {
            info!("starting");
            let mut indexer = Indexer {
                db,
                tokens: FastHashMap::default(),
                pending: VecDeque::new(),
            };
            indexer.run(rcv);
            info!("ending");
        })
        .expect("can't create indexer thread");
    (IndexerChannel(snd), join)
}

struct Indexer<C: Clocks + Clone> {
    db: Arc<Database<C>>,
    tokens: FastHashMap<u64, i64>,

    /// Commands awaiting a healthy database, oldest first.
    pending: VecDeque<Command>,
}

impl<C: Clocks + Clone> Indexer<C> {
    fn run(&mut self, rcv: mpsc::Receiver<Command>) {
        let clocks = self.db.clocks();
        loop {
            match clocks.recv_timeout(&rcv, RETRY_INTERVAL) {
                Ok(cmd) => self.handle(cmd),
                Err(mpsc::RecvTimeoutError::Timeout) => self.flush_pending(),
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        self.flush_pending();
        if !self.pending.is_empty() {
            warn!(
                "exiting with {} unindexed command(s); recordings will be \
                 reconciled on next startup",
                self.pending.len()
            );
        }
    }

    fn handle(&mut self, cmd: Command) {
        if let Command::Flush(snd) = cmd {
            self.flush_pending();
            drop(snd);
            return;
        }

        // Ordering matters: an `Update` must not overtake its own `Open`.
        if !self.pending.is_empty() {
            self.flush_pending();
            if !self.pending.is_empty() {
                self.pending.push_back(cmd);
                return;
            }
        }
        if let Err(e) = self.apply_with_retry(&cmd) {
            warn!(err = %e.chain(), "database unhealthy; queueing index updates");
            self.pending.push_back(cmd);
        }
    }

    fn flush_pending(&mut self) {
        while let Some(cmd) = self.pending.pop_front() {
            if let Err(e) = self.apply_with_retry(&cmd) {
                debug!(err = %e.chain(), "database still unhealthy");
                self.pending.push_front(cmd);
                return;
            }
        }
    }

    fn apply_with_retry(&mut self, cmd: &Command) -> Result<(), Error> {
        let clocks = self.db.clocks();
        let mut delay = Duration::from_millis(10);
        for attempt in 1.. {
            let e = match self.apply(cmd) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if attempt >= MAX_ATTEMPTS {
                return Err(e);
            }
            warn!(err = %e.chain(), attempt, "retrying index update");
            let jitter = rand::thread_rng().gen_range(0.5..1.5);
            clocks.sleep(delay.mul_f64(jitter));
            delay *= 2;
        }
        unreachable!();
    }

    fn apply(&mut self, cmd: &Command) -> Result<(), Error> {
        match cmd {
            Command::Open { token, rec } => {
                let id = self.db.lock().insert_recording(rec)?;
                self.tokens.insert(*token, id);
            }
            Command::Update {
                token,
                size_bytes,
                end,
            } => match self.tokens.get(token) {
                Some(&id) => self.db.lock().update_recording_size(id, *size_bytes, *end)?,
                None => return Err(err!(NotFound, msg("update for unknown token {token}"))),
            },
            Command::Close {
                token,
                size_bytes,
                end,
            } => match self.tokens.remove(token) {
                Some(id) => self.db.lock().mark_recording_complete(id, *size_bytes, *end)?,
                None => return Err(err!(NotFound, msg("close for unknown token {token}"))),
            },
            Command::Flush(_) => unreachable!("handled by caller"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{Trigger, TIME_UNITS_PER_SEC};
    use crate::testutil;

    #[test]
    fn open_update_close() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let (channel, join) = start_indexer(tdb.db.clone());
        channel.open(
            7,
            RecordingToInsert {
                stream: "driveway".to_owned(),
                path: "/tmp/a.mp4".into(),
                start: Time(0),
                trigger: Trigger::Continuous,
            },
        );
        channel.update(7, 1_000, Time(30 * TIME_UNITS_PER_SEC));
        channel.flush();
        {
            let mut l = tdb.db.lock();
            let rows = l.list_uncompleted().unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].size_bytes, 1_000);
        }
        channel.close(7, 2_000, Time(60 * TIME_UNITS_PER_SEC));
        channel.flush();
        {
            let mut l = tdb.db.lock();
            assert!(l.list_uncompleted().unwrap().is_empty());
            assert_eq!(l.total_completed_bytes().unwrap(), 2_000);
        }
        drop(channel);
        join.join().unwrap();
    }

    #[test]
    fn close_without_open_is_parked() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let (channel, join) = start_indexer(tdb.db.clone());
        channel.close(99, 1, Time(0));
        channel.flush();
        // No row was created; the command stays parked and the indexer still
        // exits cleanly.
        assert_eq!(tdb.db.lock().total_completed_bytes().unwrap(), 0);
        drop(channel);
        join.join().unwrap();
    }
}
