// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Recording index and stream-config persistence.

#[allow(clippy::module_inception)]
pub mod db;
pub mod json;
mod raw;
pub mod recording;
pub mod retention;
pub mod testutil;
pub mod writer;

pub use crate::db::{Database, LockedDatabase, RecordingRow, RecordingToInsert};
pub use crate::json::{DetectionCfg, RetentionCfg, StreamCfg, Transport};
pub use crate::recording::{Duration, Time, Trigger, TIME_UNITS_PER_SEC};
