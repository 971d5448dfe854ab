// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The `run` subcommand: the long-lived recorder process.
//!
//! Startup order is coordinator → (logging, done in `main`) → database →
//! storage → index/retention → streams → external helper; teardown runs in
//! reverse. Signal handlers touch nothing but atomics; all real shutdown
//! work happens on ordinary tasks under the phased forced-progress timers
//! and the watchdog process's escalation clock.

use crate::helper::TransportHelper;
use crate::manager::StreamManager;
use crate::pidfile::PidFile;
use crate::stream;
use crate::watchdog::Watchdog;
use base::clock::RealClocks;
use base::shutdown::ComponentState;
use base::{err, Error, ErrorKind, ResultExt as _};
use bpaf::Bpaf;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use self::config::ConfigFile;

mod config;

/// Runs the recorder.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the configuration file.
    #[bpaf(argument("PATH"), fallback("/etc/lightnvr.toml".into()), debug_fallback)]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = config::read_config(&args.config)?;
    let clocks = RealClocks {};

    // One instance per var dir; a previous holder is evicted or we give up
    // with a distinct exit code.
    let pid_file = match PidFile::claim(&clocks, &config.var_dir.join("lightnvr.pid")) {
        Ok(p) => p,
        Err(e) if e.kind() == ErrorKind::Aborted => {
            error!(err = %e.chain(), "another instance could not be evicted");
            return Ok(2);
        }
        Err(e) => return Err(e),
    };

    // The watchdog must fork before the runtime creates threads.
    let watchdog = Watchdog::fork()?;
    install_signal_handlers()?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = config.worker_threads {
        builder.worker_threads(worker_threads);
    }
    let rt = builder.build().err_kind(ErrorKind::Internal)?;
    let r = rt.block_on(async_run(&config, watchdog));

    // In the graceful path everything we care about is already joined; don't
    // wait on stragglers.
    rt.shutdown_background();
    drop(pid_file);
    r
}

extern "C" fn alarm_handler(_: libc::c_int) {
    base::shutdown::signal_alarm_expired();
}

extern "C" fn usr1_handler(_: libc::c_int) {
    base::shutdown::signal_request_shutdown();
}

/// Raw handlers for the signals tokio shouldn't own. Only flag stores and
/// `alarm()` happen inside them.
fn install_signal_handlers() -> Result<(), Error> {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    let alarm = SigAction::new(
        SigHandler::Handler(alarm_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let usr1 = SigAction::new(
        SigHandler::Handler(usr1_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGPIPE, &ignore)
            .map_err(|e| err!(Internal, msg("sigaction(SIGPIPE)"), source(e)))?;
        sigaction(Signal::SIGALRM, &alarm)
            .map_err(|e| err!(Internal, msg("sigaction(SIGALRM)"), source(e)))?;
        sigaction(Signal::SIGUSR1, &usr1)
            .map_err(|e| err!(Internal, msg("sigaction(SIGUSR1)"), source(e)))?;
    }
    Ok(())
}

/// Seeds config-file streams into the database when absent; the database is
/// authoritative afterwards. Detection model ids are resolved here, once.
fn seed_streams(
    db: &Arc<db::Database<RealClocks>>,
    config: &ConfigFile,
) -> Result<(), Error> {
    let existing: base::FastHashSet<String> = db
        .lock()
        .streams()?
        .into_iter()
        .map(|s| s.name)
        .collect();
    for cfg in &config.streams {
        if existing.contains(&cfg.name) {
            continue;
        }
        let mut cfg = cfg.clone();
        if let Some(d) = &mut cfg.detection {
            d.model = config::resolve_model(config.model_dir.as_deref(), &d.model);
        }
        info!("seeding stream {:?} from config", cfg.name);
        db.lock().insert_stream(&cfg)?;
    }
    Ok(())
}

async fn async_run(config: &ConfigFile, watchdog: Watchdog) -> Result<i32, Error> {
    let coord = base::shutdown::coordinator().clone();
    let shutdown_rx = coord.receiver();
    let clocks = RealClocks {};

    // Database.
    let conn = crate::cmds::open_conn(&config.var_dir, crate::cmds::OpenMode::ReadWrite)?;
    let db = Arc::new(db::Database::new(clocks, conn)?);
    info!("database is loaded");

    // Storage.
    std::fs::create_dir_all(config.storage_root.join("hls"))?;
    std::fs::create_dir_all(config.storage_root.join("mp4"))?;
    db::retention::adopt_uncompleted(&db)?;
    seed_streams(&db, config)?;

    // Index writer and retention.
    let indexer_c = coord.register("indexer");
    let (indexer, indexer_join) = db::writer::start_indexer(db.clone());
    let retention_c = coord.register("retention");
    let (retainer, retainer_join) =
        db::retention::spawn_retainer(db.clone(), config.retention.policy()?, shutdown_rx.clone());

    // Streams.
    let manager = Arc::new(StreamManager::new(
        db.clone(),
        &stream::OPENER,
        indexer.clone(),
        Some(retainer.clone()),
        config.storage_root.clone(),
        Some(tokio::runtime::Handle::current()),
    ));
    let streams_c = {
        let manager = manager.clone();
        coord.register_with_stop("streams", Box::new(move || manager.request_stop_all()))
    };
    manager.start_persisted()?;

    // External transport helper, last and optional: its absence degrades.
    // Probe and registration block (child spawn + HTTP), so they run off the
    // reactor.
    let helper = match config.helper.clone() {
        Some(hcfg) => {
            let streams: Vec<(String, std::path::PathBuf)> = manager
                .list()
                .into_iter()
                .map(|s| {
                    let playlist = config
                        .storage_root
                        .join("hls")
                        .join(&s.name)
                        .join("index.m3u8");
                    (s.name, playlist)
                })
                .collect();
            tokio::task::spawn_blocking(move || {
                let h = TransportHelper::spawn(&hcfg)?;
                if let Some(h) = &h {
                    for (name, playlist) in &streams {
                        if let Err(e) = h.register_stream(name, playlist) {
                            warn!(err = %e.chain(), "unable to register stream with helper");
                        }
                    }
                }
                Ok::<_, Error>(h)
            })
            .await
            .map_err(|e| err!(Internal, msg("helper spawn task died"), source(e)))??
        }
        None => None,
    };

    info!("ready");

    // Wait for a shutdown request: a signal owned by tokio, or the
    // async-signal-safe flag raw handlers set (polled once a second).
    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut poll_flag = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = int.recv() => { info!("received SIGINT; shutting down gracefully"); break }
            _ = term.recv() => { info!("received SIGTERM; shutting down gracefully"); break }
            _ = hup.recv() => { info!("received SIGHUP; shutting down gracefully"); break }
            _ = poll_flag.tick() => {
                if base::shutdown::signal_shutdown_requested() {
                    info!("shutdown requested via signal flag");
                    break;
                }
            }
        }
    }

    // Arm the forced-progress timers and the watchdog's escalation clock,
    // then tear down in reverse startup order.
    base::shutdown::signal_request_shutdown();
    watchdog.note_shutdown_begun();
    coord.initiate();

    if let Some(h) = helper {
        info!("stopping transport helper");
        tokio::task::spawn_blocking(move || h.shutdown())
            .await
            .map_err(|e| err!(Internal, msg("helper stop task died"), source(e)))?;
    }

    info!("stopping streams");
    streams_c.update_state(ComponentState::Stopping);
    {
        let manager = manager.clone();
        tokio::task::spawn_blocking(move || manager.stop_all())
            .await
            .map_err(|e| err!(Internal, msg("stream stop task died"), source(e)))?;
    }
    streams_c.update_state(ComponentState::Stopped);

    info!("stopping retention");
    retention_c.update_state(ComponentState::Stopping);
    drop(retainer);
    drop(manager); // releases its indexer and retainer clones
    tokio::task::spawn_blocking(move || retainer_join.join())
        .await
        .map_err(|e| err!(Internal, msg("retention join task died"), source(e)))?
        .map_err(|_| err!(Internal, msg("retention thread panicked")))?;
    retention_c.update_state(ComponentState::Stopped);

    info!("stopping indexer");
    indexer_c.update_state(ComponentState::Stopping);
    drop(indexer);
    tokio::task::spawn_blocking(move || indexer_join.join())
        .await
        .map_err(|e| err!(Internal, msg("indexer join task died"), source(e)))?
        .map_err(|_| err!(Internal, msg("indexer thread panicked")))?;
    indexer_c.update_state(ComponentState::Stopped);

    let coord2 = coord.clone();
    let all_stopped =
        tokio::task::spawn_blocking(move || coord2.wait_all_stopped(Duration::from_secs(20)))
            .await
            .map_err(|e| err!(Internal, msg("shutdown wait task died"), source(e)))?;
    if !all_stopped {
        for (name, state) in coord.snapshot() {
            if state != ComponentState::Stopped {
                warn!("component {name} stuck in state {state:?}");
            }
        }
        coord.force_stop_all();
    }

    info!("exiting");
    Ok(0)
}
