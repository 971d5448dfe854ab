// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The stream registry: add/remove/update/list, persist-then-apply.
//!
//! Callers (the API layer, the startup path) never see pipelines, only
//! [`StreamStatus`] snapshots. Config changes land in the database first and
//! are applied to the running orchestrators second, so a crash between the
//! two replays cleanly from persisted state at next startup. The registry
//! map enforces at most one pipeline per stream name.

use crate::stream;
use crate::streamer::{Environment, PipelineStatus, StreamState, Streamer};
use base::clock::Clocks;
use base::{bail, err, Error, FastHashMap, Mutex};
use db::json::StreamCfg;
use db::retention::RetainerChannel;
use db::writer::IndexerChannel;
use db::Database;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Snapshot of one stream for callers.
#[derive(Clone, Debug)]
pub struct StreamStatus {
    pub name: String,
    pub enabled: bool,
    pub status: PipelineStatus,
    pub last_packet_unix: Option<i64>,
    pub consecutive_failures: u32,
    pub next_reconnect_unix: Option<i64>,
}

struct Running {
    stop_tx: Option<base::shutdown::Sender>,
    join: std::thread::JoinHandle<()>,
    state: Arc<StreamState>,
}

struct Entry {
    cfg: StreamCfg,
    running: Option<Running>,
}

pub struct StreamManager<C: Clocks + Clone> {
    db: Arc<Database<C>>,
    clocks: C,
    opener: &'static dyn stream::Opener,
    indexer: IndexerChannel,
    retainer: Option<RetainerChannel>,
    storage_root: PathBuf,

    /// Entered in each supervisor thread so the RTSP client can reach the
    /// reactor; absent in tests without a runtime.
    runtime: Option<tokio::runtime::Handle>,

    entries: Mutex<FastHashMap<String, Entry>>,
}

impl<C: Clocks + Clone> StreamManager<C> {
    pub fn new(
        db: Arc<Database<C>>,
        opener: &'static dyn stream::Opener,
        indexer: IndexerChannel,
        retainer: Option<RetainerChannel>,
        storage_root: PathBuf,
        runtime: Option<tokio::runtime::Handle>,
    ) -> Self {
        let clocks = db.clocks();
        StreamManager {
            db,
            clocks,
            opener,
            indexer,
            retainer,
            storage_root,
            runtime,
            entries: Mutex::new(FastHashMap::default()),
        }
    }

    /// Loads persisted streams and starts the enabled ones. Startup only.
    pub fn start_persisted(&self) -> Result<(), Error> {
        let cfgs = self.db.lock().streams()?;
        for cfg in cfgs {
            let mut l = self.entries.lock();
            let name = cfg.name.clone();
            let entry = l.entry(name).or_insert(Entry {
                cfg: cfg.clone(),
                running: None,
            });
            if entry.cfg.enabled && entry.running.is_none() {
                entry.running = Some(self.spawn(&entry.cfg)?);
            }
        }
        Ok(())
    }

    /// Adds a stream: persists the config, then starts it if enabled.
    pub fn add(&self, cfg: StreamCfg) -> Result<(), Error> {
        validate(&cfg)?;
        let mut l = self.entries.lock();
        if l.contains_key(&cfg.name) {
            bail!(AlreadyExists, msg("stream {:?} already exists", cfg.name));
        }
        // Persist first; the running pipeline follows persisted state.
        self.db.lock().insert_stream(&cfg)?;
        let running = if cfg.enabled {
            Some(self.spawn(&cfg)?)
        } else {
            None
        };
        l.insert(cfg.name.clone(), Entry { cfg, running });
        Ok(())
    }

    /// Removes a stream: stops it, then deletes the persisted config.
    pub fn remove(&self, name: &str) -> Result<(), Error> {
        let entry = {
            let mut l = self.entries.lock();
            l.remove(name)
                .ok_or_else(|| err!(NotFound, msg("no stream {name:?}")))?
        };
        stop_running(name, entry.running);
        self.db.lock().delete_stream(name)?;
        Ok(())
    }

    /// Reconfigures a stream: persist, stop the old pipeline, start anew.
    pub fn update(&self, cfg: StreamCfg) -> Result<(), Error> {
        validate(&cfg)?;
        let old_running = {
            let mut l = self.entries.lock();
            let entry = l
                .get_mut(&cfg.name)
                .ok_or_else(|| err!(NotFound, msg("no stream {:?}", cfg.name)))?;
            self.db.lock().update_stream(&cfg)?;
            entry.cfg = cfg.clone();
            entry.running.take()
        };
        stop_running(&cfg.name, old_running);
        if cfg.enabled {
            let running = self.spawn(&cfg)?;
            self.entries
                .lock()
                .get_mut(&cfg.name)
                .expect("entry kept under lock")
                .running = Some(running);
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<StreamStatus> {
        let l = self.entries.lock();
        let mut out: Vec<StreamStatus> = l
            .values()
            .map(|e| {
                let state = e.running.as_ref().map(|r| &r.state);
                StreamStatus {
                    name: e.cfg.name.clone(),
                    enabled: e.cfg.enabled,
                    status: state.map(|s| s.status()).unwrap_or(PipelineStatus::Idle),
                    last_packet_unix: state.and_then(|s| s.last_packet_unix()),
                    consecutive_failures: state.map(|s| s.consecutive_failures()).unwrap_or(0),
                    next_reconnect_unix: state.and_then(|s| s.next_reconnect_unix()),
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn status(&self, name: &str) -> Option<StreamStatus> {
        self.list().into_iter().find(|s| s.name == name)
    }

    /// Signals every pipeline to stop without waiting; the coordinator's
    /// stop callback uses this so all streams wind down in parallel before
    /// the sequential joins.
    pub fn request_stop_all(&self) {
        let mut l = self.entries.lock();
        for e in l.values_mut() {
            if let Some(r) = &mut e.running {
                r.stop_tx.take();
            }
        }
    }

    /// Stops every pipeline; used by shutdown and by tests.
    pub fn stop_all(&self) {
        let drained: Vec<(String, Option<Running>)> = {
            let mut l = self.entries.lock();
            l.iter_mut()
                .map(|(name, e)| (name.clone(), e.running.take()))
                .collect()
        };
        for (name, running) in drained {
            stop_running(&name, running);
        }
    }

    fn spawn(&self, cfg: &StreamCfg) -> Result<Running, Error> {
        let (stop_tx, stop_rx) = base::shutdown::channel();
        let clocks = self.clocks.clone();
        let opener = self.opener;
        let indexer = self.indexer.clone();
        let retainer = self.retainer.clone();
        let storage_root = self.storage_root.clone();
        let runtime = self.runtime.clone();
        let cfg = cfg.clone();
        let name = cfg.name.clone();

        // The Streamer is built inside its own thread so the Environment can
        // borrow the thread-local clones.
        let (state_tx, state_rx) = std::sync::mpsc::sync_channel(1);
        let join = std::thread::Builder::new()
            .name(format!("s-{name}"))
            .spawn(move || {
                let _enter = runtime.as_ref().map(|h| h.enter());
                let env = Environment {
                    opener,
                    clocks: &clocks,
                    indexer: &indexer,
                    retainer: retainer.as_ref(),
                    shutdown_rx: &stop_rx,
                    storage_root: &storage_root,
                };
                let mut streamer = match Streamer::new(&env, cfg) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(err = %e.chain(), "unable to build streamer");
                        drop(state_tx);
                        return;
                    }
                };
                info!("starting streamer for {}", streamer.short_name());
                let _ = state_tx.send(streamer.state());
                drop(state_tx);
                streamer.run();
            })
            .map_err(|e| err!(Internal, msg("can't create stream thread"), source(e)))?;
        let state = state_rx
            .recv()
            .map_err(|_| err!(InvalidArgument, msg("stream {name:?} failed to start; see logs")))?;
        Ok(Running {
            stop_tx: Some(stop_tx),
            join,
            state,
        })
    }
}

fn validate(cfg: &StreamCfg) -> Result<(), Error> {
    if cfg.name.is_empty() || cfg.name.contains(['/', '\0']) {
        bail!(InvalidArgument, msg("bad stream name {:?}", cfg.name));
    }
    if let Some(d) = &cfg.detection {
        if !(0.0..=1.0).contains(&d.threshold) {
            bail!(
                InvalidArgument,
                msg("detection threshold {} outside [0, 1]", d.threshold)
            );
        }
    }
    Ok(())
}

fn stop_running(name: &str, running: Option<Running>) {
    let Some(mut running) = running else {
        return;
    };
    running.stop_tx.take(); // request shutdown
    if running.join.join().is_err() {
        warn!("stream {name:?} supervisor panicked during stop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use db::testutil::{stream_cfg, TestDb};
    use db::writer::start_indexer;

    /// An opener that refuses every connection, leaving pipelines in their
    /// reconnect loop.
    struct RefusingOpener;

    impl stream::Opener for RefusingOpener {
        fn open(
            &self,
            _label: String,
            _url: url::Url,
            _options: stream::Options,
        ) -> Result<Box<dyn stream::Stream>, Error> {
            Err(err!(Unavailable, msg("connection refused")))
        }
    }

    fn manager(tdb: &TestDb) -> (StreamManager<SimulatedClocks>, IndexerChannel) {
        let (indexer, _join) = start_indexer(tdb.db.clone());
        let m = StreamManager::new(
            tdb.db.clone(),
            &RefusingOpener,
            indexer.clone(),
            None,
            tdb.tmpdir.path().to_path_buf(),
            None,
        );
        (m, indexer)
    }

    #[test]
    fn add_persists_and_lists() {
        crate::testutil::init();
        let tdb = TestDb::new();
        let (m, _indexer) = manager(&tdb);
        let mut cfg = stream_cfg("porch");
        cfg.enabled = false;
        m.add(cfg.clone()).unwrap();
        assert_eq!(tdb.db.lock().streams().unwrap(), vec![cfg]);
        let listed = m.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, PipelineStatus::Idle);
        assert!(!listed[0].enabled);
    }

    #[test]
    fn duplicate_add_rejected() {
        crate::testutil::init();
        let tdb = TestDb::new();
        let (m, _indexer) = manager(&tdb);
        let mut cfg = stream_cfg("porch");
        cfg.enabled = false;
        m.add(cfg.clone()).unwrap();
        let e = m.add(cfg).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::AlreadyExists);
    }

    #[test]
    fn concurrent_add_yields_one_pipeline() {
        crate::testutil::init();
        let tdb = TestDb::new();
        let (m, _indexer) = manager(&tdb);
        let m = Arc::new(m);
        let mut results = Vec::new();
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let m = m.clone();
                    s.spawn(move || {
                        let mut cfg = stream_cfg("gate");
                        cfg.enabled = false;
                        m.add(cfg)
                    })
                })
                .collect();
            for h in handles {
                results.push(h.join().unwrap());
            }
        });
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(m.list().len(), 1);
        assert_eq!(tdb.db.lock().streams().unwrap().len(), 1);
    }

    #[test]
    fn remove_stops_and_deletes() {
        crate::testutil::init();
        let tdb = TestDb::new();
        let (m, _indexer) = manager(&tdb);
        m.add(stream_cfg("porch")).unwrap(); // enabled: pipeline spins up
        assert!(m.status("porch").is_some());
        m.remove("porch").unwrap();
        assert!(m.status("porch").is_none());
        assert!(tdb.db.lock().streams().unwrap().is_empty());
        assert_eq!(
            m.remove("porch").unwrap_err().kind(),
            base::ErrorKind::NotFound
        );
    }

    #[test]
    fn update_is_stop_then_start() {
        crate::testutil::init();
        let tdb = TestDb::new();
        let (m, _indexer) = manager(&tdb);
        m.add(stream_cfg("porch")).unwrap();
        let mut cfg = stream_cfg("porch");
        cfg.enabled = false;
        cfg.record = true;
        m.update(cfg.clone()).unwrap();
        assert_eq!(tdb.db.lock().streams().unwrap(), vec![cfg]);
        let s = m.status("porch").unwrap();
        assert_eq!(s.status, PipelineStatus::Idle);
        m.stop_all();
    }

    #[test]
    fn start_persisted_starts_only_enabled() {
        crate::testutil::init();
        let tdb = TestDb::new();
        {
            let mut l = tdb.db.lock();
            let mut a = stream_cfg("a");
            a.enabled = false;
            l.insert_stream(&a).unwrap();
            l.insert_stream(&stream_cfg("b")).unwrap();
        }
        let (m, _indexer) = manager(&tdb);
        m.start_persisted().unwrap();
        let listed = m.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(
            listed
                .iter()
                .filter(|s| s.status != PipelineStatus::Idle)
                .count(),
            1
        );
        m.stop_all();
    }
}
