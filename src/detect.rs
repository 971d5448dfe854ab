// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Keyframe sampling and detector invocation.
//!
//! The reader sits on a keyframe-only sink so it can never see (or hold up)
//! the full packet rate. The detector itself is an external collaborator
//! behind [`Detector`]; everything it does is bounded by [`DETECTOR_TIMEOUT`]
//! and failures are deliberately silent: a flaky detector must not destroy
//! an otherwise healthy stream.

use crate::fanout::{FanoutSink, SinkItem};
use crate::recorder::{Command, RecorderChannel};
use base::clock::{Clocks, Instant};
use base::{err, Error};
use db::json::DetectionCfg;
use db::recording::Trigger;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DETECTOR_TIMEOUT: Duration = Duration::from_secs(5);

/// One detected object.
#[derive(Clone, Debug, Deserialize)]
pub struct Detection {
    pub class: String,
    pub score: f32,

    /// `[x, y, width, height]`, normalized to `[0, 1]`.
    #[serde(default)]
    pub bbox: [f32; 4],
}

/// The external detector. Implementations must return within
/// [`DETECTOR_TIMEOUT`]; the reader treats errors and timeouts as
/// no-detection.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &[u8], model_id: &str) -> Result<Vec<Detection>, Error>;
}

/// Detector reached over HTTP: the model id is the endpoint URL, the request
/// body is the encoded keyframe, the response is a JSON list of detections.
pub struct HttpDetector {
    client: reqwest::blocking::Client,
}

impl HttpDetector {
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(DETECTOR_TIMEOUT)
            .build()
            .map_err(|e| err!(Internal, msg("unable to build http client"), source(e)))?;
        Ok(HttpDetector { client })
    }
}

impl Detector for HttpDetector {
    fn detect(&self, image: &[u8], model_id: &str) -> Result<Vec<Detection>, Error> {
        let resp = self
            .client
            .post(model_id)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .map_err(|e| err!(Unavailable, msg("detector request failed"), source(e)))?;
        let resp = resp
            .error_for_status()
            .map_err(|e| err!(Unavailable, msg("detector returned error"), source(e)))?;
        resp.json()
            .map_err(|e| err!(DataLoss, msg("bad detector response"), source(e)))
    }
}

/// Picks a detector backend for a resolved model identifier. HTTP(S) URLs get
/// [`HttpDetector`]; anything else would need an in-process inference backend,
/// which this build doesn't carry.
pub fn for_model(model_id: &str) -> Result<Option<Arc<dyn Detector>>, Error> {
    if model_id.starts_with("http://") || model_id.starts_with("https://") {
        return Ok(Some(Arc::new(HttpDetector::new()?)));
    }
    warn!("no in-process detector backend for model {model_id:?}; detection disabled");
    Ok(None)
}

/// Samples keyframes and forwards hits to the recorder.
pub struct DetectionReader<C: Clocks + Clone> {
    label: String,
    cfg: DetectionCfg,
    detector: Arc<dyn Detector>,
    recorder: RecorderChannel,
    clocks: C,
    last_invocation: Option<Instant>,
}

impl<C: Clocks + Clone> DetectionReader<C> {
    pub fn new(
        label: String,
        cfg: DetectionCfg,
        detector: Arc<dyn Detector>,
        recorder: RecorderChannel,
        clocks: C,
    ) -> Self {
        DetectionReader {
            label,
            cfg,
            detector,
            recorder,
            clocks,
            last_invocation: None,
        }
    }

    pub fn run(&mut self, sink: FanoutSink) -> Result<(), Error> {
        info!("{}: detection reader starting", self.label);
        loop {
            match sink.recv_timeout(Duration::from_millis(500)) {
                Some(SinkItem::Packet(pkt)) => {
                    if pkt.is_key {
                        self.sample(&pkt.data);
                    }
                }
                Some(SinkItem::Gap) | None => {}
                Some(SinkItem::Eof) => break,
            }
        }
        info!("{}: detection reader ending", self.label);
        Ok(())
    }

    /// Debounces to the sampling interval, runs the detector, and gates the
    /// recorder. No locks are held across the detector call.
    fn sample(&mut self, keyframe: &[u8]) {
        let now = self.clocks.monotonic();
        let interval = Duration::from_secs(u64::from(self.cfg.interval_secs()));
        if let Some(last) = self.last_invocation {
            if now.saturating_sub(last) < interval {
                return;
            }
        }
        self.last_invocation = Some(now);

        let detections = match self.detector.detect(keyframe, &self.cfg.model) {
            Ok(d) => d,
            Err(e) => {
                // Timeouts and errors are no-detection, not failures.
                debug!("{}: detector unavailable: {}", self.label, e.chain());
                return;
            }
        };
        let hit = detections
            .iter()
            .find(|d| d.score >= self.cfg.threshold);
        if let Some(d) = hit {
            debug!(
                "{}: {} score {:.2} >= {:.2}",
                self.label, d.class, d.score, self.cfg.threshold
            );
            self.recorder.send(Command::Event {
                trigger: Trigger::Detection,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{DropPolicy, Fanout};
    use crate::stream::testutil::pkt;
    use base::clock::SimulatedClocks;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockDetector {
        calls: AtomicUsize,
        result: Vec<Detection>,
        fail: bool,
    }

    impl Detector for MockDetector {
        fn detect(&self, _image: &[u8], _model: &str) -> Result<Vec<Detection>, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(err!(DeadlineExceeded, msg("simulated timeout")));
            }
            Ok(self.result.clone())
        }
    }

    fn cfg() -> DetectionCfg {
        serde_json::from_value(serde_json::json!({
            "model": "http://localhost:9000/detect",
            "threshold": 0.5,
            "interval_secs": 2,
        }))
        .unwrap()
    }

    fn reader(
        detector: Arc<MockDetector>,
        clocks: SimulatedClocks,
    ) -> (
        DetectionReader<SimulatedClocks>,
        std::sync::mpsc::Receiver<Command>,
    ) {
        let (channel, commands) = crate::recorder::channel();
        (
            DetectionReader::new("test".to_owned(), cfg(), detector, channel, clocks),
            commands,
        )
    }

    #[test]
    fn hit_above_threshold_opens_event() {
        crate::testutil::init();
        let clocks = SimulatedClocks::new("2026-04-26T00:00:00Z".parse().unwrap());
        let det = Arc::new(MockDetector {
            calls: AtomicUsize::new(0),
            result: vec![Detection {
                class: "person".to_owned(),
                score: 0.9,
                bbox: [0.0, 0.0, 0.5, 0.5],
            }],
            fail: false,
        });
        let (mut r, commands) = reader(det.clone(), clocks);
        r.sample(b"keyframe");
        assert_eq!(det.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            commands.try_recv(),
            Ok(Command::Event {
                trigger: Trigger::Detection
            })
        ));
    }

    #[test]
    fn below_threshold_is_quiet() {
        crate::testutil::init();
        let clocks = SimulatedClocks::new("2026-04-26T00:00:00Z".parse().unwrap());
        let det = Arc::new(MockDetector {
            calls: AtomicUsize::new(0),
            result: vec![Detection {
                class: "cat".to_owned(),
                score: 0.2,
                bbox: [0.0; 4],
            }],
            fail: false,
        });
        let (mut r, commands) = reader(det, clocks);
        r.sample(b"keyframe");
        assert!(commands.try_recv().is_err());
    }

    #[test]
    fn debounce_respects_interval() {
        crate::testutil::init();
        let clocks = SimulatedClocks::new("2026-04-26T00:00:00Z".parse().unwrap());
        let det = Arc::new(MockDetector {
            calls: AtomicUsize::new(0),
            result: Vec::new(),
            fail: false,
        });
        let (mut r, _commands) = reader(det.clone(), clocks.clone());
        r.sample(b"k1");
        r.sample(b"k2"); // same instant: debounced
        assert_eq!(det.calls.load(Ordering::SeqCst), 1);
        clocks.sleep(Duration::from_secs(2));
        r.sample(b"k3");
        assert_eq!(det.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn detector_failure_is_no_detection() {
        crate::testutil::init();
        let clocks = SimulatedClocks::new("2026-04-26T00:00:00Z".parse().unwrap());
        let det = Arc::new(MockDetector {
            calls: AtomicUsize::new(0),
            result: Vec::new(),
            fail: true,
        });
        let (mut r, commands) = reader(det, clocks);
        r.sample(b"keyframe");
        assert!(commands.try_recv().is_err());
    }

    #[test]
    fn run_samples_only_keyframes() {
        crate::testutil::init();
        let clocks = SimulatedClocks::new("2026-04-26T00:00:00Z".parse().unwrap());
        let det = Arc::new(MockDetector {
            calls: AtomicUsize::new(0),
            result: Vec::new(),
            fail: false,
        });
        let (mut r, _commands) = reader(det.clone(), clocks);
        let f = Fanout::new();
        let sink = f.add_sink("detect", 1, DropPolicy::DropNewestNonKey, true);
        f.publish(&Arc::new(pkt(0, true, 8)));
        f.publish(&Arc::new(pkt(3000, false, 8)));
        f.shutdown();
        r.run(sink).unwrap();
        assert_eq!(det.calls.load(Ordering::SeqCst), 1);
    }
}
