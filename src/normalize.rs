// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Repairs source timestamps into a monotonic presentation timeline.
//!
//! Cameras reboot, lose RTP packets, wrap their 32-bit timestamps, and
//! occasionally send nothing usable at all. Consumers downstream of the
//! fan-out rely on a per-track non-decreasing normalized PTS, with a
//! stream-wide discontinuity sequence that bumps whenever the source timeline
//! genuinely restarted (so they can cut segments / rotate files instead of
//! papering over the gap).

use crate::stream::MediaPacket;
use db::recording::TIME_UNITS_PER_SEC;

/// Backward jumps larger than this (after wrap healing) are treated as a
/// source timeline reset rather than jitter.
pub const DISCONT_THRESHOLD: i64 = 10 * TIME_UNITS_PER_SEC;

/// Frame duration assumed before any deltas have been observed (1/30 s).
const DEFAULT_FRAME_DURATION: i64 = TIME_UNITS_PER_SEC / 30;

/// Deltas above this are excluded from the rolling frame-duration average.
const MAX_PLAUSIBLE_DELTA: i64 = 2 * TIME_UNITS_PER_SEC;

const WRAP: i64 = 1 << 32;
const HALF_WRAP: i64 = 1 << 31;

#[derive(Default)]
struct TrackState {
    /// Accumulated multiple of 2^32 from healed wraparounds.
    wrap_offset: i64,

    /// Last accepted input PTS, after healing. `None` until the first packet.
    last_raw: Option<i64>,

    /// `out = healed_raw + offset`.
    offset: i64,

    last_out_pts: i64,
    last_out_dts: i64,

    /// Rolling average frame duration; 0 until two packets have been seen.
    avg_delta: i64,

    /// The stream-wide seq bumped while this track was idle; refreeze the
    /// offset on its next packet without bumping again.
    pending_reset: bool,
}

impl TrackState {
    fn frame_duration(&self) -> i64 {
        if self.avg_delta > 0 {
            self.avg_delta
        } else {
            DEFAULT_FRAME_DURATION
        }
    }
}

/// Per-stream timestamp normalizer; one per ingest session.
pub struct Normalizer {
    tracks: Vec<TrackState>,
    seq: u32,
    discont_threshold: i64,

    /// Healed raw PTS of the first packet of the whole stream; later tracks
    /// zero-base against it so audio/video stay aligned.
    global_base: Option<i64>,

    /// The source explicitly signaled a new segment.
    force_reset: bool,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::with_threshold(DISCONT_THRESHOLD)
    }

    pub fn with_threshold(discont_threshold: i64) -> Self {
        Normalizer {
            tracks: Vec::new(),
            seq: 0,
            discont_threshold,
            global_base: None,
            force_reset: false,
        }
    }

    /// Current discontinuity sequence.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Marks a source-signaled timeline restart; the next packet of every
    /// track refreezes its offset under a new seq.
    pub fn note_reset(&mut self) {
        self.force_reset = true;
    }

    /// Fills `pkt.pts`, `pkt.dts`, and `pkt.seq`.
    pub fn normalize(&mut self, pkt: &mut MediaPacket) {
        if self.force_reset {
            self.force_reset = false;
            self.seq = self.seq.wrapping_add(1);
            for t in &mut self.tracks {
                t.pending_reset = true;
            }
        }
        if pkt.track >= self.tracks.len() {
            self.tracks.resize_with(pkt.track + 1, TrackState::default);
        }

        let Some(raw_pts) = pkt.raw_pts else {
            self.synthesize(pkt);
            return;
        };

        let bump_others = {
            let t = &mut self.tracks[pkt.track];
            let mut healed = raw_pts + t.wrap_offset;
            if let Some(last_raw) = t.last_raw {
                while healed + HALF_WRAP < last_raw {
                    healed += WRAP;
                    t.wrap_offset += WRAP;
                }
            }

            let mut bump_others = false;
            match t.last_raw {
                None => {
                    // Zero base: first packet of the stream defines t=0;
                    // tracks joining later share it.
                    let base = *self.global_base.get_or_insert(healed);
                    t.offset = -base;
                    t.pending_reset = false;
                }
                Some(last_raw) => {
                    let reset_detected = healed + self.discont_threshold < last_raw;
                    if t.pending_reset || reset_detected {
                        if !t.pending_reset {
                            self.seq = self.seq.wrapping_add(1);
                            bump_others = true;
                        }
                        t.pending_reset = false;
                        t.offset = t.last_out_pts + t.frame_duration() - healed;
                    }
                }
            }

            let out_pts = (healed + t.offset).max(if t.last_raw.is_some() {
                t.last_out_pts
            } else {
                0
            });
            let out_dts = match pkt.raw_dts {
                Some(raw_dts) => (raw_dts + t.wrap_offset + t.offset).max(t.last_out_dts),
                None => out_pts,
            };

            if t.last_raw.is_some() {
                let delta = out_pts - t.last_out_pts;
                if delta > 0 && delta < MAX_PLAUSIBLE_DELTA {
                    t.avg_delta = if t.avg_delta == 0 {
                        delta
                    } else {
                        (t.avg_delta * 7 + delta) / 8
                    };
                }
            }

            t.last_raw = Some(healed);
            t.last_out_pts = out_pts;
            t.last_out_dts = out_dts;
            pkt.pts = out_pts;
            pkt.dts = out_dts;
            bump_others
        };
        if bump_others {
            for (i, t) in self.tracks.iter_mut().enumerate() {
                if i != pkt.track && t.last_raw.is_some() {
                    t.pending_reset = true;
                }
            }
        }
        pkt.seq = self.seq;
    }

    /// Unknown source PTS: extend the timeline by the estimated frame
    /// duration.
    fn synthesize(&mut self, pkt: &mut MediaPacket) {
        let t = &mut self.tracks[pkt.track];
        let out = if t.last_raw.is_some() || t.last_out_pts > 0 {
            t.last_out_pts + t.frame_duration()
        } else {
            0
        };
        t.last_out_pts = out;
        t.last_out_dts = out.max(t.last_out_dts);
        pkt.pts = out;
        pkt.dts = t.last_out_dts;
        pkt.seq = self.seq;
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testutil::pkt;

    fn run(n: &mut Normalizer, raw: impl IntoIterator<Item = Option<i64>>) -> Vec<(i64, u32)> {
        raw.into_iter()
            .map(|r| {
                let mut p = pkt(0, false, 1);
                p.raw_pts = r;
                p.raw_dts = r;
                n.normalize(&mut p);
                (p.pts, p.seq)
            })
            .collect()
    }

    #[test]
    fn wrap_heals_monotone() {
        let mut n = Normalizer::new();
        // 3000-tick cadence crossing the 2^32 boundary.
        let out = run(
            &mut n,
            [
                Some(WRAP - 6000),
                Some(WRAP - 3000),
                Some(0),
                Some(3000),
                Some(6000),
            ],
        );
        assert_eq!(
            out,
            vec![(0, 0), (3000, 0), (6000, 0), (9000, 0), (12000, 0)]
        );
    }

    #[test]
    fn reset_bumps_seq_and_stays_monotone() {
        let mut n = Normalizer::new();
        // 1000 s into the stream the source reboots and restarts at zero.
        let big = 1000 * TIME_UNITS_PER_SEC;
        let out = run(
            &mut n,
            [
                Some(big),
                Some(big + 3000),
                Some(big + 6000),
                Some(0),
                Some(3000),
            ],
        );
        assert_eq!(out[0], (0, 0));
        assert_eq!(out[1], (3000, 0));
        assert_eq!(out[2], (6000, 0));
        // Reset: output continues by the estimated frame duration, new seq.
        assert_eq!(out[3], (9000, 1));
        assert_eq!(out[4], (12000, 1));
    }

    #[test]
    fn small_backward_jitter_clamps_without_reset() {
        let mut n = Normalizer::new();
        let out = run(&mut n, [Some(0), Some(3000), Some(2000), Some(6000)]);
        assert_eq!(out, vec![(0, 0), (3000, 0), (3000, 0), (6000, 0)]);
    }

    #[test]
    fn unknown_pts_synthesized_from_cadence() {
        let mut n = Normalizer::new();
        let out = run(&mut n, [Some(0), Some(3000), None, Some(9000)]);
        assert_eq!(out[0], (0, 0));
        assert_eq!(out[1], (3000, 0));
        // Synthesized at last + rolling average (3000).
        assert_eq!(out[2], (6000, 0));
        assert_eq!(out[3], (9000, 0));
    }

    #[test]
    fn tracks_independent_but_share_seq() {
        let mut n = Normalizer::new();
        let mut video = pkt(0, true, 1);
        n.normalize(&mut video);
        let mut audio = pkt(0, false, 1);
        audio.track = 1;
        audio.codec = crate::stream::CodecKind::Aac;
        audio.raw_pts = Some(0);
        n.normalize(&mut audio);
        assert_eq!(audio.seq, 0);

        // Video resets; the audio track picks up the new seq on its next
        // packet without a second bump.
        let big = 1000 * TIME_UNITS_PER_SEC;
        for raw in [big, big + 3000, 0] {
            let mut p = pkt(raw, false, 1);
            n.normalize(&mut p);
        }
        assert_eq!(n.seq(), 1);
        let mut audio2 = pkt(0, false, 1);
        audio2.track = 1;
        audio2.raw_pts = Some(3000);
        n.normalize(&mut audio2);
        assert_eq!(audio2.seq, 1);
        assert_eq!(n.seq(), 1);
        assert!(audio2.pts >= 0);
    }

    #[test]
    fn forced_reset_bumps_once() {
        let mut n = Normalizer::new();
        run(&mut n, [Some(0), Some(3000)]);
        n.note_reset();
        let out = run(&mut n, [Some(0), Some(3000)]);
        assert_eq!(out[0].1, 1);
        assert_eq!(out[1].1, 1);
        assert!(out[0].0 >= 3000);
        assert!(out[1].0 > out[0].0);
    }

    #[test]
    fn dts_monotonic_independently() {
        let mut n = Normalizer::new();
        let mut p = pkt(0, true, 1);
        p.raw_dts = Some(0);
        n.normalize(&mut p);
        let mut p2 = pkt(6000, false, 1);
        p2.raw_dts = Some(3000);
        n.normalize(&mut p2);
        let mut p3 = pkt(3000, false, 1);
        p3.raw_dts = Some(6000); // DTS advances though PTS reordered back
        n.normalize(&mut p3);
        assert!(p3.dts >= p2.dts);
        assert!(p3.pts >= p2.pts); // clamped
    }
}
