// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Test infrastructure shared between this crate's tests and the binary
//! crate's.

use crate::db::Database;
use crate::json::StreamCfg;
use base::clock::SimulatedClocks;
use std::sync::Arc;

static INIT: std::sync::Once = std::sync::Once::new();

/// Performs global initialization for tests: installs the tracing subscriber.
/// Safe to call multiple times.
pub fn init() {
    INIT.call_once(base::tracing_setup::install_for_tests);
}

/// An in-memory database plus a temporary storage directory.
pub struct TestDb {
    pub db: Arc<Database<SimulatedClocks>>,
    pub clocks: SimulatedClocks,
    pub tmpdir: tempfile::TempDir,
}

impl TestDb {
    pub fn new() -> Self {
        // 2026-04-26T00:00:00Z.
        Self::with_boot("2026-04-26T00:00:00Z".parse().unwrap())
    }

    pub fn with_boot(boot: jiff::Timestamp) -> Self {
        let clocks = SimulatedClocks::new(boot);
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::db::init(&mut conn).unwrap();
        TestDb {
            db: Arc::new(Database::new(clocks.clone(), conn).unwrap()),
            clocks,
            tmpdir: tempfile::tempdir().unwrap(),
        }
    }
}

impl Default for TestDb {
    fn default() -> Self {
        Self::new()
    }
}

/// A minimal enabled stream config for tests.
pub fn stream_cfg(name: &str) -> StreamCfg {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "url": format!("rtsp://test-camera/{name}"),
    }))
    .unwrap()
}
