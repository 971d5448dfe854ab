// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-stream supervision: connect, read, fan out, reconnect.
//!
//! One `Streamer` runs on one named thread per enabled stream. It owns the
//! ingest pipeline end to end: the RTSP session, the normalizer, the fan-out,
//! and the consumer threads. Anything going wrong tears the pipeline down to
//! a clean slate and reconnects with jittered exponential backoff; shutdown
//! drains consumers in a fixed order with per-consumer deadlines.

use crate::detect;
use crate::fanout::{DropPolicy, Fanout, SinkStats};
use crate::hls;
use crate::normalize::Normalizer;
use crate::recorder;
use crate::stream;
use base::clock::{Clocks, TimerGuard};
use base::{err, Error};
use db::json::StreamCfg;
use db::recording::Duration as Duration90k;
use db::retention::RetainerChannel;
use db::writer::IndexerChannel;
use rand::Rng as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Reconnect backoff bounds.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// A connection this old counts as stable; backoff resets.
const STABLE_AFTER: Duration = Duration::from_secs(60);

/// Degradation rule: any sink sustaining more than this drop ratio for
/// [`DEGRADED_WINDOW`] gets the pipeline restarted.
const DEGRADED_DROP_RATIO: f64 = 0.5;
const DEGRADED_WINDOW: Duration = Duration::from_secs(30);
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Consumer stop deadlines, in teardown order.
const DETECT_STOP_DEADLINE: Duration = Duration::from_secs(2);
const HLS_STOP_DEADLINE: Duration = Duration::from_secs(2);
const MP4_STOP_DEADLINE: Duration = Duration::from_secs(5);

/// Externally visible pipeline status.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PipelineStatus {
    Idle = 0,
    Connecting = 1,
    Running = 2,
    Degraded = 3,
    Stopping = 4,
    Stopped = 5,
}

impl PipelineStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PipelineStatus::Idle,
            1 => PipelineStatus::Connecting,
            2 => PipelineStatus::Running,
            3 => PipelineStatus::Degraded,
            4 => PipelineStatus::Stopping,
            _ => PipelineStatus::Stopped,
        }
    }
}

/// Runtime state shared with the stream manager; owned by one supervisor.
pub struct StreamState {
    status: AtomicU8,
    last_packet_unix: AtomicI64,
    consecutive_failures: AtomicU32,
    next_reconnect_unix: AtomicI64,
}

impl StreamState {
    fn new() -> Self {
        StreamState {
            status: AtomicU8::new(PipelineStatus::Idle as u8),
            last_packet_unix: AtomicI64::new(0),
            consecutive_failures: AtomicU32::new(0),
            next_reconnect_unix: AtomicI64::new(0),
        }
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, s: PipelineStatus) {
        self.status.store(s as u8, Ordering::Release);
    }

    pub fn last_packet_unix(&self) -> Option<i64> {
        match self.last_packet_unix.load(Ordering::Relaxed) {
            0 => None,
            v => Some(v),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn next_reconnect_unix(&self) -> Option<i64> {
        match (
            self.status(),
            self.next_reconnect_unix.load(Ordering::Relaxed),
        ) {
            (PipelineStatus::Connecting, v) if v != 0 => Some(v),
            _ => None,
        }
    }
}

/// Common state that can be used by multiple [`Streamer`] instances.
pub struct Environment<'a, C: Clocks + Clone> {
    pub opener: &'a dyn stream::Opener,
    pub clocks: &'a C,
    pub indexer: &'a IndexerChannel,
    pub retainer: Option<&'a RetainerChannel>,
    pub shutdown_rx: &'a base::shutdown::Receiver,
    pub storage_root: &'a Path,
}

/// Connects to one source and supervises its consumers. Long-lived; sleeps
/// and retries after each failure until shutdown or disable.
pub struct Streamer<'a, C: Clocks + Clone> {
    shutdown_rx: base::shutdown::Receiver,
    clocks: C,
    opener: &'a dyn stream::Opener,
    indexer: IndexerChannel,
    retainer: Option<RetainerChannel>,
    storage_root: PathBuf,
    cfg: StreamCfg,
    state: Arc<StreamState>,
    short_name: String,
    url: Url,
    redacted_url: Url,
}

impl<'a, C: 'a + Clocks + Clone> Streamer<'a, C> {
    pub fn new(env: &Environment<'a, C>, cfg: StreamCfg) -> Result<Self, Error> {
        let mut url = Url::parse(&cfg.url)
            .map_err(|e| err!(InvalidArgument, msg("bad url for stream {:?}", cfg.name), source(e)))?;
        let mut redacted_url = url.clone();
        if !cfg.username.is_empty() {
            url.set_username(&cfg.username)
                .map_err(|()| err!(InvalidArgument, msg("can't set username")))?;
            redacted_url
                .set_username(&cfg.username)
                .map_err(|()| err!(InvalidArgument, msg("can't set username")))?;
            let _ = url.set_password(Some(&cfg.password));
            let _ = redacted_url.set_password(Some("redacted"));
        }
        Ok(Streamer {
            shutdown_rx: env.shutdown_rx.clone(),
            clocks: env.clocks.clone(),
            opener: env.opener,
            indexer: env.indexer.clone(),
            retainer: env.retainer.cloned(),
            storage_root: env.storage_root.to_path_buf(),
            short_name: cfg.name.clone(),
            cfg,
            state: Arc::new(StreamState::new()),
            url,
            redacted_url,
        })
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn state(&self) -> Arc<StreamState> {
        self.state.clone()
    }

    pub fn run(&mut self) {
        let mut backoff = BACKOFF_BASE;
        while self.shutdown_rx.check().is_ok() {
            self.state.set_status(PipelineStatus::Connecting);
            let connected_at = self.clocks.monotonic();
            let e = match self.run_once() {
                Ok(()) => break, // clean shutdown
                Err(e) => e,
            };
            if self.clocks.monotonic().saturating_sub(connected_at) >= STABLE_AFTER {
                backoff = BACKOFF_BASE;
            }
            self.state
                .consecutive_failures
                .fetch_add(1, Ordering::Relaxed);
            self.state.set_status(PipelineStatus::Connecting);
            let jitter: f64 = rand::thread_rng().gen_range(0.8..1.2);
            let sleep_time = backoff.mul_f64(jitter);
            warn!(
                "{}: sleeping for {:?} after error: {}",
                self.short_name,
                sleep_time,
                e.chain()
            );
            self.state.next_reconnect_unix.store(
                self.clocks.realtime().as_second() + sleep_time.as_secs() as i64,
                Ordering::Relaxed,
            );
            if sleep_or_shutdown(&self.clocks, &self.shutdown_rx, sleep_time).is_err() {
                break;
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
        self.state.set_status(PipelineStatus::Stopped);
        info!("{}: shutting down", self.short_name);
    }

    fn run_once(&mut self) -> Result<(), Error> {
        info!("{}: opening input: {}", self.short_name, self.redacted_url);
        let clocks = self.clocks.clone();

        let mut stream = {
            let _t = TimerGuard::new(&clocks, || format!("opening {}", self.redacted_url));
            self.opener.open(
                self.short_name.clone(),
                self.url.clone(),
                self.options(),
            )?
        };
        let sample_entry = stream.video_sample_entry().clone();
        let fanout = Fanout::new();
        let mut consumers = self.start_consumers(&fanout, &sample_entry)?;

        let mut normalizer = Normalizer::new();
        let mut first_packet = true;
        let mut last_stats_check = clocks.monotonic();
        let mut last_stats: Vec<(&'static str, SinkStats)> = Vec::new();
        let mut degraded_since: Option<base::clock::Instant> = None;

        let result = loop {
            if self.shutdown_rx.check().is_err() {
                break Ok(());
            }
            let mut pkt = {
                let _t = TimerGuard::new(&clocks, || "getting next packet");
                match stream.next() {
                    Ok(p) => p,
                    Err(e) => break Err(e),
                }
            };
            normalizer.normalize(&mut pkt);
            if first_packet {
                debug!("{}: have first packet", self.short_name);
                self.state.set_status(PipelineStatus::Running);
                self.state.consecutive_failures.store(0, Ordering::Relaxed);
                first_packet = false;
            }
            self.state
                .last_packet_unix
                .store(pkt.capture_time.as_second(), Ordering::Relaxed);
            fanout.publish(&Arc::new(pkt));

            // Consumer health: a dead writer or a sustained-drop sink means
            // this pipeline restarts rather than silently shedding.
            let now = clocks.monotonic();
            if now.saturating_sub(last_stats_check) >= STATS_INTERVAL {
                last_stats_check = now;
                if let Some(name) = consumers.iter().find(|c| c.failed()).map(|c| c.name) {
                    break Err(err!(Internal, msg("consumer {name} failed")));
                }
                let stats = fanout.sink_stats();
                let worst = worst_drop_ratio(&last_stats, &stats);
                last_stats = stats;
                if worst > DEGRADED_DROP_RATIO {
                    let since = *degraded_since.get_or_insert(now);
                    self.state.set_status(PipelineStatus::Degraded);
                    if now.saturating_sub(since) >= DEGRADED_WINDOW {
                        break Err(err!(
                            ResourceExhausted,
                            msg("sustained sink drops ({:.0}%)", worst * 100.)
                        ));
                    }
                } else if degraded_since.take().is_some() {
                    self.state.set_status(PipelineStatus::Running);
                }
            }
        };

        // Teardown order is invariant: detection → HLS → MP4, then the
        // demuxer and socket drop with `stream`.
        self.state.set_status(PipelineStatus::Stopping);
        fanout.shutdown();
        for c in consumers.drain(..) {
            c.stop();
        }
        drop(stream);
        result
    }

    fn options(&self) -> stream::Options {
        let session = retina::client::SessionOptions::default();
        let mut setup = retina::client::SetupOptions::default();
        setup = match self.cfg.transport {
            db::Transport::Auto => setup,
            db::Transport::Tcp => setup.transport(retina::client::Transport::default()),
            db::Transport::Udp => {
                setup.transport(retina::client::Transport::Udp(Default::default()))
            }
        };
        stream::Options { session, setup }
    }

    /// Spawns the consumer threads configured for this stream, in open order
    /// MP4 → HLS → detection (the reverse of teardown).
    fn start_consumers(
        &self,
        fanout: &Fanout,
        sample_entry: &stream::VideoSampleEntry,
    ) -> Result<Vec<Consumer>, Error> {
        let mut consumers = Vec::new();

        let recorder_mode = if self.cfg.record {
            Some(recorder::Mode::Continuous)
        } else {
            self.cfg.detection.as_ref().map(|d| recorder::Mode::Event {
                pre_buffer: Duration90k::from_secs(i64::from(d.pre_buffer_secs)),
                post_buffer: Duration90k::from_secs(i64::from(d.post_buffer_secs)),
            })
        };
        let mut recorder_channel = None;
        if let Some(mode) = recorder_mode {
            let (channel, commands) = recorder::channel();
            recorder_channel = Some(channel);
            let sink = fanout.add_sink(
                "mp4",
                64,
                DropPolicy::BlockBounded(Duration::from_millis(500)),
                false,
            );
            let cfg = recorder::RecorderConfig {
                stream_name: self.short_name.clone(),
                dir: self.storage_root.join("mp4").join(&self.short_name),
                segment_duration: Duration90k::from_secs(i64::from(
                    self.cfg.segment_duration_secs(),
                )),
                max_file_bytes: recorder::DEFAULT_MAX_FILE_BYTES,
                mode,
            };
            let r = recorder::Recorder::new(
                cfg,
                self.clocks.clone(),
                sample_entry.clone(),
                self.indexer.clone(),
                self.retainer.clone(),
                commands,
            );
            consumers.push(Consumer::spawn(
                "mp4",
                &self.short_name,
                MP4_STOP_DEADLINE,
                move |done| {
                    let mut r = r;
                    let result = r.run(sink);
                    drop(done);
                    result
                },
            )?);
        }

        if self.cfg.streaming_enabled {
            let sink = fanout.add_sink("hls", 64, DropPolicy::DropOldest, false);
            let dir = self.storage_root.join("hls").join(&self.short_name);
            let w = hls::HlsWriter::new(
                self.short_name.clone(),
                dir,
                sample_entry,
                hls::DEFAULT_TARGET_SECS,
                hls::DEFAULT_WINDOW,
            )?;
            consumers.push(Consumer::spawn(
                "hls",
                &self.short_name,
                HLS_STOP_DEADLINE,
                move |done| {
                    let mut w = w;
                    let result = w.run(sink);
                    drop(done);
                    result
                },
            )?);
        }

        if let Some(dcfg) = &self.cfg.detection {
            match (detect::for_model(&dcfg.model)?, &recorder_channel) {
                (Some(detector), Some(rc)) => {
                    let sink = fanout.add_sink("detect", 1, DropPolicy::DropNewestNonKey, true);
                    let reader = detect::DetectionReader::new(
                        self.short_name.clone(),
                        dcfg.clone(),
                        detector,
                        rc.clone(),
                        self.clocks.clone(),
                    );
                    consumers.push(Consumer::spawn(
                        "detect",
                        &self.short_name,
                        DETECT_STOP_DEADLINE,
                        move |done| {
                            let mut reader = reader;
                            let result = reader.run(sink);
                            drop(done);
                            result
                        },
                    )?);
                }
                _ => warn!("{}: detection configured but unavailable", self.short_name),
            }
        }

        // Teardown runs detection first, then HLS, then MP4.
        consumers.reverse();
        Ok(consumers)
    }
}

/// Largest per-sink drop ratio across the sampling interval.
fn worst_drop_ratio(prev: &[(&'static str, SinkStats)], cur: &[(&'static str, SinkStats)]) -> f64 {
    let mut worst: f64 = 0.;
    for (name, stats) in cur {
        let base = prev
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| *s)
            .unwrap_or_default();
        let dropped = stats.dropped.saturating_sub(base.dropped) as f64;
        let delivered = stats.delivered.saturating_sub(base.delivered) as f64;
        if dropped + delivered > 0. {
            worst = worst.max(dropped / (dropped + delivered));
        }
    }
    worst
}

/// Sleeps `d` in short slices, aborting promptly on shutdown.
fn sleep_or_shutdown<C: Clocks>(
    clocks: &C,
    shutdown_rx: &base::shutdown::Receiver,
    d: Duration,
) -> Result<(), base::shutdown::ShutdownError> {
    let mut remaining = d;
    while remaining > Duration::ZERO {
        shutdown_rx.check()?;
        let slice = remaining.min(Duration::from_secs(1));
        clocks.sleep(slice);
        remaining -= slice;
    }
    shutdown_rx.check()
}

/// A consumer thread plus its stop bookkeeping.
struct Consumer {
    name: &'static str,
    join: std::thread::JoinHandle<()>,
    done_rx: mpsc::Receiver<()>,
    deadline: Duration,
    failed: Arc<std::sync::atomic::AtomicBool>,
}

impl Consumer {
    fn spawn<F>(
        name: &'static str,
        stream_name: &str,
        deadline: Duration,
        body: F,
    ) -> Result<Consumer, Error>
    where
        F: FnOnce(mpsc::Sender<()>) -> Result<(), Error> + Send + 'static,
    {
        let failed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let failed2 = failed.clone();
        let (done_tx, done_rx) = mpsc::channel();
        let join = std::thread::Builder::new()
            .name(format!("{name}-{stream_name}"))
            .spawn(move || {
                if let Err(e) = body(done_tx) {
                    warn!(err = %e.chain(), "consumer failed");
                    failed2.store(true, Ordering::Release);
                }
            })
            .map_err(|e| err!(Internal, msg("can't create {name} thread"), source(e)))?;
        Ok(Consumer {
            name,
            join,
            done_rx,
            deadline,
            failed,
        })
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Waits for the consumer to finalize, bounded by its (wall-clock)
    /// deadline. A wedged consumer is abandoned (its thread keeps no shared
    /// locks) rather than holding the whole pipeline hostage.
    fn stop(self) {
        match self.done_rx.recv_timeout(self.deadline) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!("consumer {} missed its stop deadline", self.name);
            }
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                let _ = self.join.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testutil::{pkt, VecStream};
    use base::clock::SimulatedClocks;
    use db::testutil::TestDb;
    use db::writer::start_indexer;

    struct MockOpener {
        clocks: SimulatedClocks,
        streams: base::Mutex<Vec<VecStream>>,
        open_times: base::Mutex<Vec<base::clock::Instant>>,
        shutdown_tx: base::Mutex<Option<base::shutdown::Sender>>,
    }

    impl stream::Opener for MockOpener {
        fn open(
            &self,
            _label: String,
            _url: Url,
            _options: stream::Options,
        ) -> Result<Box<dyn stream::Stream>, Error> {
            self.open_times.lock().push(self.clocks.monotonic());
            match self.streams.lock().pop() {
                Some(s) => Ok(Box::new(s)),
                None => {
                    self.shutdown_tx.lock().take();
                    Err(err!(Unavailable, msg("out of streams")))
                }
            }
        }
    }

    /// 30 fps video, keyframe each second.
    fn packets(seconds: i64) -> Vec<stream::MediaPacket> {
        (0..seconds * 30)
            .map(|i| pkt(i * 3000, i % 30 == 0, 64))
            .collect()
    }

    fn stream_cfg(record: bool, streaming: bool) -> StreamCfg {
        let mut cfg = db::testutil::stream_cfg("driveway");
        cfg.record = record;
        cfg.streaming_enabled = streaming;
        cfg
    }

    #[test]
    fn records_then_stops_cleanly() {
        crate::testutil::init();
        let tdb = TestDb::new();
        let (indexer, indexer_join) = start_indexer(tdb.db.clone());
        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let opener = MockOpener {
            clocks: tdb.clocks.clone(),
            streams: base::Mutex::new(vec![VecStream::new(packets(130))]),
            open_times: base::Mutex::new(Vec::new()),
            shutdown_tx: base::Mutex::new(Some(shutdown_tx)),
        };
        let env = Environment {
            opener: &opener,
            clocks: &tdb.clocks,
            indexer: &indexer,
            retainer: None,
            shutdown_rx: &shutdown_rx,
            storage_root: tdb.tmpdir.path(),
        };
        let mut streamer = Streamer::new(&env, stream_cfg(true, false)).unwrap();
        let state = streamer.state();
        streamer.run();
        assert_eq!(state.status(), PipelineStatus::Stopped);
        assert!(opener.streams.lock().is_empty());

        indexer.flush();
        // The indexer exits once every channel clone is gone, including the
        // streamer's.
        drop(streamer);
        drop(indexer);
        indexer_join.join().unwrap();
        let mut rows = Vec::new();
        tdb.db
            .lock()
            .list_oldest_completed(&mut |r| {
                rows.push(r);
                true
            })
            .unwrap();
        // 130 s at the 60 s default rotation: at least three files (sink
        // pressure may rotate once more), all completed and on disk.
        assert!(rows.len() >= 3, "{rows:#?}");
        assert!(tdb.db.lock().list_uncompleted().unwrap().is_empty());
        for r in &rows {
            assert!(r.completed);
            assert!(r.path.exists());
            assert!(r
                .path
                .starts_with(tdb.tmpdir.path().join("mp4").join("driveway")));
        }
    }

    #[test]
    fn backoff_delays_double_with_jitter() {
        crate::testutil::init();
        let tdb = TestDb::new();
        let (indexer, indexer_join) = start_indexer(tdb.db.clone());
        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let opener = MockOpener {
            clocks: tdb.clocks.clone(),
            streams: base::Mutex::new(Vec::new()),
            open_times: base::Mutex::new(Vec::new()),
            shutdown_tx: base::Mutex::new(None),
        };
        let env = Environment {
            opener: &opener,
            clocks: &tdb.clocks,
            indexer: &indexer,
            retainer: None,
            shutdown_rx: &shutdown_rx,
            storage_root: tdb.tmpdir.path(),
        };
        let mut streamer = Streamer::new(&env, stream_cfg(false, false)).unwrap();

        // Drive run() on a scoped thread; the simulated clock makes the
        // backoff sleeps instantaneous in real time.
        std::thread::scope(|s| {
            let handle = s.spawn(|| streamer.run());
            let deadline = std::time::Instant::now() + Duration::from_secs(10);
            while opener.open_times.lock().len() < 6 && std::time::Instant::now() < deadline {
                std::thread::yield_now();
            }
            drop(shutdown_tx);
            handle.join().unwrap();
        });
        drop(streamer);
        drop(indexer);
        indexer_join.join().unwrap();

        let times = opener.open_times.lock();
        assert!(times.len() >= 6, "only {} opens", times.len());
        for (i, expected) in [1.0f64, 2.0, 4.0, 8.0, 16.0].iter().enumerate() {
            let delta = times[i + 1].saturating_sub(times[i]).as_secs_f64();
            assert!(
                delta >= expected * 0.8 - 0.001 && delta <= expected * 1.2 + 0.001,
                "delay {i}: {delta} vs expected {expected} ±20%"
            );
        }
    }
}
