// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Shared test setup for the binary crate.

/// Installs the tracing subscriber (once) for tests.
pub fn init() {
    db::testutil::init();
}
