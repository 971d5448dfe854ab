// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! JSON types for the `stream.config` column.
//!
//! These also serve as the wire format between the config loader and the
//! stream manager; the database copy is authoritative after startup.

use serde::{Deserialize, Serialize};

/// How to reach the camera's RTSP server.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Auto,
    Tcp,
    Udp,
}

/// Per-stream object detection settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DetectionCfg {
    /// Model identifier: a filesystem path, or an `http(s)://` URL naming a
    /// detector service.
    pub model: String,

    /// Minimum score in `[0, 1]` for an object to open an event recording.
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Seconds of video to retain ahead of the first triggering frame.
    #[serde(default = "default_buffer_secs")]
    pub pre_buffer_secs: u32,

    /// Seconds of quiet after the last triggering frame before closing.
    #[serde(default = "default_buffer_secs")]
    pub post_buffer_secs: u32,

    /// Keyframe sampling interval in whole seconds; clamped to ≥ 1.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u32,
}

fn default_threshold() -> f32 {
    0.5
}

fn default_buffer_secs() -> u32 {
    5
}

fn default_interval_secs() -> u32 {
    1
}

impl DetectionCfg {
    pub fn interval_secs(&self) -> u32 {
        self.interval_secs.max(1)
    }
}

/// Per-stream retention overrides; global pressure rules still apply.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionCfg {
    /// Delete this stream's recordings older than this many days even when
    /// the global budget has room.
    #[serde(default)]
    pub ttl_days: Option<u32>,
}

/// Configuration of one stream, as persisted in the `stream` table.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StreamCfg {
    pub name: String,

    /// Source URL, usually `rtsp://`. Credentials go in `username`/`password`,
    /// not the URL, so logs can stay redacted.
    pub url: String,

    #[serde(default)]
    pub transport: Transport,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Continuous recording to rolling MP4 files.
    #[serde(default)]
    pub record: bool,

    /// Live HLS output.
    #[serde(default = "default_true")]
    pub streaming_enabled: bool,

    #[serde(default)]
    pub detection: Option<DetectionCfg>,

    /// Rotation period for continuous recordings; default 60.
    #[serde(default)]
    pub segment_duration_secs: Option<u32>,

    #[serde(default)]
    pub retention: Option<RetentionCfg>,
}

fn default_true() -> bool {
    true
}

impl StreamCfg {
    pub fn segment_duration_secs(&self) -> u32 {
        self.segment_duration_secs.unwrap_or(60)
    }
}
