// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The config file: read once at startup, never re-read.

use crate::helper::HelperConfig;
use base::strutil::decode_size;
use base::{err, Error};
use db::json::StreamCfg;
use db::retention::RetentionPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_var_dir() -> PathBuf {
    crate::DEFAULT_VAR_DIR.into()
}

fn default_max_storage() -> String {
    "10G".to_owned()
}

/// Disk budget section; sizes are human-readable (`70M`, `2G`).
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetentionSection {
    #[serde(default = "default_max_storage")]
    pub max_storage_bytes: String,

    #[serde(default)]
    pub high_water_bytes: Option<String>,

    #[serde(default)]
    pub low_water_bytes: Option<String>,
}

impl Default for RetentionSection {
    fn default() -> Self {
        RetentionSection {
            max_storage_bytes: default_max_storage(),
            high_water_bytes: None,
            low_water_bytes: None,
        }
    }
}

impl RetentionSection {
    pub fn policy(&self) -> Result<RetentionPolicy, Error> {
        let decode = |what: &str, s: &str| {
            decode_size(s).map_err(|()| err!(InvalidArgument, msg("bad {what} size {s:?}")))
        };
        Ok(RetentionPolicy {
            max_storage_bytes: decode("max_storage_bytes", &self.max_storage_bytes)?,
            high_water_bytes: self
                .high_water_bytes
                .as_deref()
                .map(|s| decode("high_water_bytes", s))
                .transpose()?,
            low_water_bytes: self
                .low_water_bytes
                .as_deref()
                .map(|s| decode("low_water_bytes", s))
                .transpose()?,
        })
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Recording and HLS output root.
    pub storage_root: PathBuf,

    /// Database and pid file directory.
    #[serde(default = "default_var_dir")]
    pub var_dir: PathBuf,

    #[serde(default)]
    pub worker_threads: Option<usize>,

    #[serde(default)]
    pub retention: RetentionSection,

    #[serde(default)]
    pub helper: Option<HelperConfig>,

    /// Directory against which relative detection model paths resolve.
    #[serde(default)]
    pub model_dir: Option<PathBuf>,

    /// Streams seeded into the database when absent; the database copy is
    /// authoritative afterwards.
    #[serde(default, rename = "stream")]
    pub streams: Vec<StreamCfg>,
}

pub fn read_config(path: &Path) -> Result<ConfigFile, Error> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| err!(FailedPrecondition, msg("unable to read {}", path.display()), source(e)))?;
    toml::from_str(&raw)
        .map_err(|e| err!(InvalidArgument, msg("unable to parse {}", path.display()), source(e)))
}

/// Resolves a detection model id. Resolution happens exactly once, at seed
/// time; everything downstream sees the resolved form.
pub fn resolve_model(model_dir: Option<&Path>, model: &str) -> String {
    if model.starts_with("http://") || model.starts_with("https://") || model.starts_with('/') {
        return model.to_owned();
    }
    match model_dir {
        Some(d) => d.join(model).to_string_lossy().into_owned(),
        None => model.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config() {
        let c: ConfigFile = toml::from_str(
            r#"
            storage_root = "/srv/nvr"

            [[stream]]
            name = "driveway"
            url = "rtsp://cam1/main"
            record = true
            "#,
        )
        .unwrap();
        assert_eq!(c.storage_root, PathBuf::from("/srv/nvr"));
        assert_eq!(c.var_dir, PathBuf::from(crate::DEFAULT_VAR_DIR));
        assert_eq!(c.streams.len(), 1);
        assert!(c.streams[0].record);
        let policy = c.retention.policy().unwrap();
        assert_eq!(policy.max_storage_bytes, 10 << 30);
        assert_eq!(policy.high_water(), (10i64 << 30) / 100 * 95);
    }

    #[test]
    fn retention_sizes_parse() {
        let c: ConfigFile = toml::from_str(
            r#"
            storage_root = "/srv/nvr"

            [retention]
            max_storage_bytes = "70M"
            low_water_bytes = "60M"
            "#,
        )
        .unwrap();
        let p = c.retention.policy().unwrap();
        assert_eq!(p.max_storage_bytes, 70 << 20);
        assert_eq!(p.low_water(), 60 << 20);
        assert_eq!(p.high_water(), (70i64 << 20) / 100 * 95);
    }

    #[test]
    fn bad_size_rejected() {
        let c: ConfigFile = toml::from_str(
            r#"
            storage_root = "/srv/nvr"

            [retention]
            max_storage_bytes = "lots"
            "#,
        )
        .unwrap();
        c.retention.policy().unwrap_err();
    }

    #[test]
    fn model_resolution() {
        assert_eq!(
            resolve_model(Some(Path::new("/models")), "person.tflite"),
            "/models/person.tflite"
        );
        assert_eq!(
            resolve_model(Some(Path::new("/models")), "http://det:9000/v1"),
            "http://det:9000/v1"
        );
        assert_eq!(resolve_model(None, "person.tflite"), "person.tflite");
    }
}
