// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Single reader → many consumers packet routing.
//!
//! The reader publishes each packet to every registered sink under a read
//! lock; sinks are added and removed under a briefly-held write lock. Each
//! sink is a bounded ring with its own drop policy, so one slow consumer
//! can't stall the others: the recorder blocks the reader only within its
//! configured bound, HLS sheds load oldest-first, and the detection sampler
//! keeps only the freshest keyframe.

use crate::stream::MediaPacket;
use base::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// What a consumer pulls out of its sink.
#[derive(Clone, Debug)]
pub enum SinkItem {
    Packet(Arc<MediaPacket>),
    /// Packets were dropped here under `BlockBounded` pressure.
    Gap,
    /// The producer is done; finalize and exit.
    Eof,
}

/// Per-sink overflow behavior.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DropPolicy {
    /// Discard the oldest non-keyframe; keyframes go last.
    DropOldest,

    /// Discard the incoming packet unless it's a keyframe; a keyframe
    /// replaces the oldest queued item.
    DropNewestNonKey,

    /// Block the producer up to the given bound, then behave like
    /// `DropOldest` and mark a gap.
    BlockBounded(Duration),
}

/// Monotonic counters for one sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub delivered: u64,
    pub dropped: u64,
    pub high_water: u64,
}

struct Queue {
    items: VecDeque<SinkItem>,
    eof: bool,
}

struct Shared {
    name: &'static str,
    capacity: usize,
    policy: DropPolicy,
    keyframes_only: bool,
    queue: Mutex<Queue>,

    /// Signaled when an item (or EOF) is pushed.
    readable: Condvar,

    /// Signaled when space frees up; only `BlockBounded` producers wait here.
    writable: Condvar,

    detached: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
    high_water: AtomicU64,
}

/// Consumer handle for one bounded queue fed by the reader.
pub struct FanoutSink(Arc<Shared>);

impl FanoutSink {
    /// Blocks up to `timeout` for the next item. `None` means timeout.
    ///
    /// After `Eof` is observed once, it is returned again on every later
    /// call, so a consumer's drain loop can't miss it.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SinkItem> {
        let s = &self.0;
        let l = s.queue.lock();
        let (mut l, _) = s
            .readable
            .wait_timeout_while(l, timeout, |q| q.items.is_empty() && !q.eof);
        match l.items.pop_front() {
            Some(item) => {
                s.writable.notify_one();
                Some(item)
            }
            None if l.eof => Some(SinkItem::Eof),
            None => None,
        }
    }

    pub fn stats(&self) -> SinkStats {
        self.0.stats()
    }
}

impl Drop for FanoutSink {
    fn drop(&mut self) {
        self.0.detached.store(true, Ordering::Release);
        self.0.writable.notify_all();
    }
}

impl Shared {
    fn stats(&self) -> SinkStats {
        SinkStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            high_water: self.high_water.load(Ordering::Relaxed),
        }
    }

    fn push(&self, pkt: &Arc<MediaPacket>) {
        if self.keyframes_only && !pkt.is_key {
            return;
        }
        let mut l = self.queue.lock();
        if l.eof {
            return;
        }
        if queued_packets(&l) >= self.capacity {
            match self.policy {
                DropPolicy::DropOldest => {
                    drop_one_oldest(&mut l);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                DropPolicy::DropNewestNonKey => {
                    if pkt.is_key {
                        l.items.pop_front();
                    } else {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                DropPolicy::BlockBounded(bound) => {
                    let (l2, timeout) = self.writable.wait_timeout_while(l, bound, |q| {
                        queued_packets(q) >= self.capacity && !q.eof
                    });
                    l = l2;
                    if self.detached.load(Ordering::Acquire) || l.eof {
                        return;
                    }
                    if timeout.timed_out() {
                        drop_one_oldest(&mut l);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        if !matches!(l.items.back(), Some(SinkItem::Gap)) {
                            l.items.push_back(SinkItem::Gap);
                        }
                    }
                }
            }
        }
        l.items.push_back(SinkItem::Packet(pkt.clone()));
        let len = queued_packets(&l) as u64;
        self.high_water.fetch_max(len, Ordering::Relaxed);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        drop(l);
        self.readable.notify_one();
    }

    fn push_eof(&self) {
        let mut l = self.queue.lock();
        l.eof = true;
        drop(l);
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

fn queued_packets(q: &Queue) -> usize {
    q.items
        .iter()
        .filter(|i| matches!(i, SinkItem::Packet(_)))
        .count()
}

/// Removes the oldest droppable packet: the oldest non-keyframe, or the
/// oldest packet outright if only keyframes remain.
fn drop_one_oldest(q: &mut Queue) {
    let victim = q.items.iter().position(
        |i| matches!(i, SinkItem::Packet(p) if !p.is_key),
    );
    match victim {
        Some(i) => {
            q.items.remove(i);
        }
        None => {
            q.items.pop_front();
        }
    }
}

/// The producer-side registry.
pub struct Fanout {
    sinks: RwLock<Vec<Arc<Shared>>>,
}

impl Fanout {
    pub fn new() -> Self {
        Fanout {
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Registers a sink; the returned handle is the consumer's read side.
    pub fn add_sink(
        &self,
        name: &'static str,
        capacity: usize,
        policy: DropPolicy,
        keyframes_only: bool,
    ) -> FanoutSink {
        let shared = Arc::new(Shared {
            name,
            capacity: capacity.max(1),
            policy,
            keyframes_only,
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                eof: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            detached: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            high_water: AtomicU64::new(0),
        });
        let mut l = self.sinks.write().unwrap();
        l.retain(|s| !s.detached.load(Ordering::Acquire));
        l.push(shared.clone());
        FanoutSink(shared)
    }

    /// Delivers one packet to every attached sink, applying each sink's
    /// policy independently.
    pub fn publish(&self, pkt: &Arc<MediaPacket>) {
        let l = self.sinks.read().unwrap();
        for sink in l.iter() {
            if !sink.detached.load(Ordering::Acquire) {
                sink.push(pkt);
            }
        }
    }

    /// Marks end-of-stream on every sink and detaches them. Consumers see
    /// `Eof` after draining whatever is queued.
    pub fn shutdown(&self) {
        let mut l = self.sinks.write().unwrap();
        for sink in l.drain(..) {
            sink.push_eof();
        }
    }

    /// `(name, stats)` per attached sink, for the supervisor's degradation
    /// rule.
    pub fn sink_stats(&self) -> Vec<(&'static str, SinkStats)> {
        let l = self.sinks.read().unwrap();
        l.iter()
            .filter(|s| !s.detached.load(Ordering::Acquire))
            .map(|s| (s.name, s.stats()))
            .collect()
    }
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testutil::pkt;

    fn publish(f: &Fanout, p: MediaPacket) {
        f.publish(&Arc::new(p));
    }

    fn drain(sink: &FanoutSink) -> Vec<SinkItem> {
        let mut out = Vec::new();
        while let Some(item) = sink.recv_timeout(Duration::from_millis(10)) {
            let eof = matches!(item, SinkItem::Eof);
            out.push(item);
            if eof {
                break;
            }
        }
        out
    }

    fn pts_of(items: &[SinkItem]) -> Vec<i64> {
        items
            .iter()
            .filter_map(|i| match i {
                SinkItem::Packet(p) => Some(p.raw_pts.unwrap()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn drop_oldest_spares_keyframes() {
        let f = Fanout::new();
        let sink = f.add_sink("hls", 3, DropPolicy::DropOldest, false);
        publish(&f, pkt(0, true, 1));
        publish(&f, pkt(1, false, 1));
        publish(&f, pkt(2, false, 1));
        publish(&f, pkt(3, false, 1)); // drops pts 1
        publish(&f, pkt(4, false, 1)); // drops pts 2
        f.shutdown();
        let items = drain(&sink);
        assert_eq!(pts_of(&items), vec![0, 3, 4]);
        assert_eq!(sink.stats().dropped, 2);
        assert_eq!(sink.stats().delivered, 3);
    }

    #[test]
    fn drop_newest_non_key_keeps_fresh_keyframe() {
        let f = Fanout::new();
        let sink = f.add_sink("detect", 1, DropPolicy::DropNewestNonKey, true);
        publish(&f, pkt(0, true, 1));
        publish(&f, pkt(1, false, 1)); // filtered: keyframes only
        publish(&f, pkt(2, true, 1)); // replaces pts 0
        f.shutdown();
        let items = drain(&sink);
        assert_eq!(pts_of(&items), vec![2]);
    }

    #[test]
    fn block_bounded_emits_gap() {
        let f = Fanout::new();
        let sink = f.add_sink(
            "mp4",
            2,
            DropPolicy::BlockBounded(Duration::from_millis(5)),
            false,
        );
        publish(&f, pkt(0, false, 1));
        publish(&f, pkt(1, false, 1));
        // Full and nobody draining: blocks ≤5 ms, then drops oldest + gap.
        publish(&f, pkt(2, false, 1));
        f.shutdown();
        let items = drain(&sink);
        assert_eq!(pts_of(&items), vec![1, 2]);
        assert!(items.iter().any(|i| matches!(i, SinkItem::Gap)));
        assert_eq!(sink.stats().dropped, 1);
    }

    #[test]
    fn eof_persists() {
        let f = Fanout::new();
        let sink = f.add_sink("hls", 2, DropPolicy::DropOldest, false);
        publish(&f, pkt(0, true, 1));
        f.shutdown();
        assert!(matches!(
            sink.recv_timeout(Duration::from_millis(10)),
            Some(SinkItem::Packet(_))
        ));
        for _ in 0..2 {
            assert!(matches!(
                sink.recv_timeout(Duration::from_millis(10)),
                Some(SinkItem::Eof)
            ));
        }
    }

    #[test]
    fn detached_sink_is_skipped() {
        let f = Fanout::new();
        let sink = f.add_sink("hls", 2, DropPolicy::DropOldest, false);
        drop(sink);
        publish(&f, pkt(0, true, 1)); // no panic, no delivery
        assert!(f.sink_stats().is_empty());
    }
}
