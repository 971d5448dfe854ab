// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Client side of the optional external transport helper: a child process
//! that serves RTSP/WebRTC out of our HLS output.
//!
//! The helper is a black box. It is spawned, probed for readiness, and told
//! about streams over its HTTP control API; if it never becomes ready the
//! system runs degraded (no re-streaming) rather than failing.

use base::{err, Error};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Readiness probe: this many attempts, one second apart.
const PROBE_ATTEMPTS: u32 = 10;
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Helper process settings, from the config file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HelperConfig {
    /// Executable to spawn.
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Base URL of the helper's HTTP control API, e.g. `http://127.0.0.1:8083`.
    pub control_url: String,
}

pub struct TransportHelper {
    child: std::process::Child,
    control_url: String,
    client: reqwest::blocking::Client,
}

impl TransportHelper {
    /// Spawns and probes the helper. `Ok(None)` means it didn't come up;
    /// callers continue without it.
    pub fn spawn(cfg: &HelperConfig) -> Result<Option<TransportHelper>, Error> {
        let mut child = std::process::Command::new(&cfg.command)
            .args(&cfg.args)
            .spawn()
            .map_err(|e| {
                err!(
                    FailedPrecondition,
                    msg("unable to spawn transport helper {:?}", cfg.command),
                    source(e)
                )
            })?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
            .map_err(|e| err!(Internal, source(e)))?;
        let health = format!("{}/health", cfg.control_url.trim_end_matches('/'));
        for attempt in 1..=PROBE_ATTEMPTS {
            match client.get(&health).send() {
                Ok(resp) if resp.status().is_success() => {
                    info!("transport helper ready after {attempt} probe(s)");
                    return Ok(Some(TransportHelper {
                        child,
                        control_url: cfg.control_url.trim_end_matches('/').to_owned(),
                        client,
                    }));
                }
                Ok(resp) => {
                    warn!("transport helper probe {attempt}: status {}", resp.status())
                }
                Err(e) => tracing::debug!("transport helper probe {attempt}: {e}"),
            }
            std::thread::sleep(PROBE_INTERVAL);
        }
        warn!("transport helper never became ready; continuing without it");
        let _ = child.kill();
        let _ = child.wait();
        Ok(None)
    }

    /// Registers a stream, pointing the helper at its HLS playlist.
    pub fn register_stream(&self, name: &str, playlist: &Path) -> Result<(), Error> {
        let url = format!("{}/streams", self.control_url);
        self.client
            .post(&url)
            .json(&serde_json::json!({
                "name": name,
                "source": playlist.to_string_lossy(),
            }))
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| err!(Unavailable, msg("unable to register {name:?}"), source(e)))?;
        Ok(())
    }

    pub fn unregister_stream(&self, name: &str) -> Result<(), Error> {
        let url = format!("{}/streams/{name}", self.control_url);
        self.client
            .delete(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| err!(Unavailable, msg("unable to unregister {name:?}"), source(e)))?;
        Ok(())
    }

    /// Terminates the helper during shutdown.
    pub fn shutdown(mut self) {
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => info!("transport helper exited: {status}"),
            Err(e) => warn!("unable to reap transport helper: {e}"),
        }
    }
}
