// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Live HLS output: a rolling playlist of fragmented-MP4 media segments.
//!
//! Crash safety: segment files are fully written and fsynced before the
//! manifest mentions them, the manifest itself is replaced via
//! write-to-temp-and-rename, and files are unlinked only after a manifest
//! that no longer references them has landed. A reader therefore never sees
//! a manifest entry without a complete file behind it.

use crate::fanout::{FanoutSink, SinkItem};
use crate::fmp4;
use crate::stream::{MediaPacket, VideoSampleEntry};
use base::{Error, ErrorKind, ResultExt as _};
use db::recording::TIME_UNITS_PER_SEC;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Segment close is considered at the first keyframe past this.
pub const DEFAULT_TARGET_SECS: u32 = 4;

/// Playlist/on-disk window, in segments.
pub const DEFAULT_WINDOW: usize = 6;

/// Fallback duration for the final sample of a segment.
const DEFAULT_SAMPLE_DURATION: i64 = TIME_UNITS_PER_SEC / 30;

struct PendingSample {
    pts: i64,
    is_key: bool,
    data: bytes::Bytes,
}

struct CurrentSegment {
    builder: fmp4::FragmentBuilder,
    start_pts: i64,
    discontinuity: bool,
}

struct SegmentMeta {
    media_seq: u64,
    duration_90k: i64,
    discontinuity: bool,
}

pub struct HlsWriter {
    label: String,
    dir: PathBuf,
    target: i64,
    window: usize,

    next_media_seq: u64,
    frag_seq: u32,
    segments: VecDeque<SegmentMeta>,
    cur: Option<CurrentSegment>,
    pending: Option<PendingSample>,
    last_delta: i64,
    last_seq: u32,

    /// A discontinuity was seen; tag the next segment opened.
    discontinuity_flag: bool,
}

impl HlsWriter {
    /// Creates the output directory, clears stale segments from an earlier
    /// run, and writes the init segment.
    pub fn new(
        label: String,
        dir: PathBuf,
        sample_entry: &VideoSampleEntry,
        target_secs: u32,
        window: usize,
    ) -> Result<Self, Error> {
        fs::create_dir_all(&dir)?;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".m4s") || name.ends_with(".m3u8") || name.ends_with(".tmp") {
                let _ = fs::remove_file(entry.path());
            }
        }
        let init = fmp4::init_segment(sample_entry);
        let init_path = dir.join("init.mp4");
        let mut f = fs::File::create(&init_path)?;
        f.write_all(&init)?;
        f.sync_all()?;
        Ok(HlsWriter {
            label,
            dir,
            target: i64::from(target_secs.max(1)) * TIME_UNITS_PER_SEC,
            window: window.max(1),
            next_media_seq: 0,
            frag_seq: 0,
            segments: VecDeque::new(),
            cur: None,
            pending: None,
            last_delta: DEFAULT_SAMPLE_DURATION,
            last_seq: 0,
            discontinuity_flag: false,
        })
    }

    /// Drains the sink until EOF or an unrecoverable write error.
    pub fn run(&mut self, sink: FanoutSink) -> Result<(), Error> {
        info!("{}: hls writer starting", self.label);
        loop {
            match sink.recv_timeout(Duration::from_millis(500)) {
                Some(SinkItem::Packet(pkt)) => self.process(&pkt)?,
                Some(SinkItem::Gap) | None => {}
                Some(SinkItem::Eof) => break,
            }
        }
        self.finalize()?;
        info!("{}: hls writer ending", self.label);
        Ok(())
    }

    /// Handles one packet; non-video tracks are not ours.
    pub fn process(&mut self, pkt: &MediaPacket) -> Result<(), Error> {
        if pkt.track != 0 {
            return Ok(());
        }

        // A discontinuity forces a cut; the next segment gets the tag.
        if pkt.seq != self.last_seq {
            debug!("{}: discontinuity seq {} -> {}", self.label, self.last_seq, pkt.seq);
            self.last_seq = pkt.seq;
            self.flush_pending()?;
            self.close_segment(true)?;
        }

        if let Some(prev) = self.pending.take() {
            let delta = (pkt.pts - prev.pts).max(1);
            if delta < 2 * TIME_UNITS_PER_SEC {
                self.last_delta = delta;
            }
            self.add_sample(prev, delta)?;
        }
        self.pending = Some(PendingSample {
            pts: pkt.pts,
            is_key: pkt.is_key,
            data: pkt.data.clone(),
        });
        Ok(())
    }

    /// Adds a (now fully-timed) sample, cutting a segment first if due.
    fn add_sample(&mut self, sample: PendingSample, duration: i64) -> Result<(), Error> {
        if let Some(cur) = &self.cur {
            let elapsed = sample.pts - cur.start_pts;
            let cut = (sample.is_key && elapsed >= self.target) || elapsed >= 2 * self.target;
            if cut {
                self.close_segment(false)?;
            }
        }
        if self.cur.is_none() {
            if !sample.is_key {
                // Segments open on a keyframe; leading deltas are unusable.
                return Ok(());
            }
            self.cur = Some(CurrentSegment {
                builder: fmp4::FragmentBuilder::new(sample.pts.max(0) as u64),
                start_pts: sample.pts,
                discontinuity: std::mem::take(&mut self.discontinuity_flag),
            });
        }
        let cur = self.cur.as_mut().expect("opened above");
        cur.builder
            .add_sample(duration.min(i64::from(u32::MAX)) as u32, sample.is_key, &sample.data);
        Ok(())
    }

    /// Closes the open segment, if any: write, fsync, manifest update,
    /// window eviction.
    fn close_segment(&mut self, discontinuity_next: bool) -> Result<(), Error> {
        if discontinuity_next {
            self.discontinuity_flag = true;
        }
        let Some(cur) = self.cur.take() else {
            return Ok(());
        };
        if cur.builder.is_empty() {
            return Ok(());
        }
        let media_seq = self.next_media_seq;
        self.next_media_seq += 1;
        self.frag_seq += 1;
        let duration_90k = self.segment_duration(&cur);
        let frag = cur.builder.build(self.frag_seq);

        let path = self.dir.join(format!("seg_{media_seq}.m4s"));
        let mut f = fs::File::create(&path)?;
        f.write_all(&frag)?;
        f.sync_all()?;
        self.sync_dir()?;

        self.segments.push_back(SegmentMeta {
            media_seq,
            duration_90k,
            discontinuity: cur.discontinuity,
        });
        let mut evicted = Vec::new();
        while self.segments.len() > self.window {
            evicted.push(self.segments.pop_front().unwrap().media_seq);
        }
        self.write_playlist(false)?;
        // Only now are the evicted files unreferenced.
        for seq in evicted {
            let p = self.dir.join(format!("seg_{seq}.m4s"));
            if let Err(e) = fs::remove_file(&p) {
                warn!("{}: unable to remove {}: {e}", self.label, p.display());
            }
        }
        Ok(())
    }

    fn segment_duration(&self, cur: &CurrentSegment) -> i64 {
        match &self.pending {
            Some(p) if p.pts > cur.start_pts => p.pts - cur.start_pts,
            _ => self.last_delta * cur.builder.sample_count() as i64,
        }
    }

    fn write_playlist(&self, end_list: bool) -> Result<(), Error> {
        let max_duration = self
            .segments
            .iter()
            .map(|s| s.duration_90k)
            .max()
            .unwrap_or(self.target);
        let target_secs =
            (max_duration + TIME_UNITS_PER_SEC - 1).div_euclid(TIME_UNITS_PER_SEC);
        let mut m = String::with_capacity(256);
        m.push_str("#EXTM3U\n#EXT-X-VERSION:7\n");
        writeln!(&mut m, "#EXT-X-TARGETDURATION:{target_secs}").err_kind(ErrorKind::Internal)?;
        writeln!(
            &mut m,
            "#EXT-X-MEDIA-SEQUENCE:{}",
            self.segments.front().map(|s| s.media_seq).unwrap_or(0)
        )
        .err_kind(ErrorKind::Internal)?;
        m.push_str("#EXT-X-MAP:URI=\"init.mp4\"\n");
        for s in &self.segments {
            if s.discontinuity {
                m.push_str("#EXT-X-DISCONTINUITY\n");
            }
            let secs = s.duration_90k as f64 / TIME_UNITS_PER_SEC as f64;
            writeln!(&mut m, "#EXTINF:{secs:.3},\nseg_{}.m4s", s.media_seq)
                .err_kind(ErrorKind::Internal)?;
        }
        if end_list {
            m.push_str("#EXT-X-ENDLIST\n");
        }

        let tmp = self.dir.join("index.m3u8.tmp");
        let path = self.dir.join("index.m3u8");
        let mut f = fs::File::create(&tmp)?;
        f.write_all(m.as_bytes())?;
        f.sync_all()?;
        fs::rename(&tmp, &path)?;
        self.sync_dir()?;
        Ok(())
    }

    fn sync_dir(&self) -> Result<(), Error> {
        fs::File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    /// Flushes the lookahead sample with an estimated duration.
    fn flush_pending(&mut self) -> Result<(), Error> {
        if let Some(prev) = self.pending.take() {
            let delta = self.last_delta;
            self.add_sample(prev, delta)?;
        }
        Ok(())
    }

    /// Closes the final segment and marks the playlist ended.
    pub fn finalize(&mut self) -> Result<(), Error> {
        self.flush_pending()?;
        self.close_segment(false)?;
        self.write_playlist(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testutil::{pkt, sample_entry};

    fn writer(dir: &std::path::Path) -> HlsWriter {
        HlsWriter::new(
            "test".to_owned(),
            dir.to_path_buf(),
            &sample_entry(),
            4,
            3,
        )
        .unwrap()
    }

    /// 30 fps cadence with a keyframe every second.
    fn feed(w: &mut HlsWriter, seconds: i64) {
        for i in 0..seconds * 30 {
            let mut p = pkt(i * 3000, i % 30 == 0, 16);
            p.pts = p.raw_pts.unwrap();
            w.process(&p).unwrap();
        }
    }

    #[test]
    fn segments_open_on_keyframes_and_respect_target() {
        crate::testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path());

        // Leading non-keyframes are discarded, not segmented.
        let mut delta = pkt(0, false, 16);
        delta.pts = 0;
        w.process(&delta).unwrap();
        feed(&mut w, 13);
        w.finalize().unwrap();

        let manifest = std::fs::read_to_string(dir.path().join("index.m3u8")).unwrap();
        assert!(manifest.starts_with("#EXTM3U"));
        assert!(manifest.contains("#EXT-X-MAP:URI=\"init.mp4\""));
        assert!(manifest.contains("#EXT-X-ENDLIST"));
        // 13 s at a 4 s target: segments cut at the keyframes after each
        // 4 s mark.
        for line in manifest.lines() {
            if let Some(rest) = line.strip_prefix("#EXTINF:") {
                let secs: f64 = rest.trim_end_matches(',').parse().unwrap();
                assert!(secs >= 0.5 && secs <= 8.0, "duration {secs}");
            }
        }
        // Every referenced segment exists on disk.
        for line in manifest.lines() {
            if line.ends_with(".m4s") {
                assert!(dir.path().join(line).exists(), "{line} missing");
            }
        }
        assert!(dir.path().join("init.mp4").exists());
    }

    #[test]
    fn window_evicts_oldest_files() {
        crate::testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path());
        feed(&mut w, 30); // plenty of segments for a window of 3
        w.finalize().unwrap();
        let manifest = std::fs::read_to_string(dir.path().join("index.m3u8")).unwrap();
        let referenced: Vec<&str> = manifest.lines().filter(|l| l.ends_with(".m4s")).collect();
        assert!(referenced.len() <= 3);
        assert!(!dir.path().join("seg_0.m4s").exists());
        // MEDIA-SEQUENCE advanced past the evicted segments.
        assert!(!manifest.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
    }

    #[test]
    fn discontinuity_cuts_and_tags() {
        crate::testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path());
        feed(&mut w, 2);
        // Timeline restarts under a new discontinuity seq.
        for i in 0..60 {
            let mut p = pkt(0, i % 30 == 0, 16);
            p.pts = 2 * TIME_UNITS_PER_SEC + i * 3000;
            p.seq = 1;
            w.process(&p).unwrap();
        }
        w.finalize().unwrap();
        let manifest = std::fs::read_to_string(dir.path().join("index.m3u8")).unwrap();
        assert!(manifest.contains("#EXT-X-DISCONTINUITY\n"));
    }
}
