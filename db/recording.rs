// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Time units and recording-level types shared by the index and the media
//! path.

use base::{err, Error};

/// Normalized timestamps are in 90 kHz units, the common clock rate of RTP
/// video. Sources with other clock rates are rescaled on ingest.
pub const TIME_UNITS_PER_SEC: i64 = 90_000;

/// A wall-clock time in 90 kHz units since the Unix epoch.
#[derive(Copy, Clone, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Time(pub i64);

impl Time {
    pub fn from_jiff(ts: jiff::Timestamp) -> Self {
        Time((ts.as_nanosecond() * TIME_UNITS_PER_SEC as i128 / 1_000_000_000) as i64)
    }

    pub fn to_jiff(self) -> Result<jiff::Timestamp, Error> {
        jiff::Timestamp::from_nanosecond(
            self.0 as i128 * 1_000_000_000 / TIME_UNITS_PER_SEC as i128,
        )
        .map_err(|e| err!(OutOfRange, msg("time {} out of range", self.0), source(e)))
    }

    pub fn unix_seconds(self) -> i64 {
        self.0 / TIME_UNITS_PER_SEC
    }
}

impl std::ops::Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl std::ops::Sub<Time> for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_jiff() {
            Ok(ts) => write!(f, "{ts}"),
            Err(_) => write!(f, "{}@90k", self.0),
        }
    }
}

/// A duration in 90 kHz units.
#[derive(Copy, Clone, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Duration(pub i64);

impl Duration {
    pub fn from_secs(secs: i64) -> Self {
        Duration(secs * TIME_UNITS_PER_SEC)
    }

    pub fn from_millis(millis: i64) -> Self {
        Duration(millis * TIME_UNITS_PER_SEC / 1_000)
    }

    pub fn as_millis(self) -> i64 {
        self.0 * 1_000 / TIME_UNITS_PER_SEC
    }
}

impl std::ops::Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl std::fmt::Display for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ms = self.as_millis();
        write!(f, "{}.{:03}s", ms / 1_000, (ms % 1_000).abs())
    }
}

/// What caused a recording to exist.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trigger {
    Continuous,
    Motion,
    Detection,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Continuous => "continuous",
            Trigger::Motion => "motion",
            Trigger::Detection => "detection",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "continuous" => Trigger::Continuous,
            "motion" => Trigger::Motion,
            "detection" => Trigger::Detection,
            _ => return Err(err!(DataLoss, msg("bad trigger {s:?} in recording row"))),
        })
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_round_trip() {
        let ts: jiff::Timestamp = "2026-04-26T00:00:00Z".parse().unwrap();
        let t = Time::from_jiff(ts);
        assert_eq!(t.0 % TIME_UNITS_PER_SEC, 0);
        assert_eq!(t.to_jiff().unwrap(), ts);
    }

    #[test]
    fn duration_display() {
        assert_eq!(Duration::from_secs(61).to_string(), "61.000s");
        assert_eq!(Duration(45_000).to_string(), "0.500s");
    }

    #[test]
    fn trigger_round_trip() {
        for t in [Trigger::Continuous, Trigger::Motion, Trigger::Detection] {
            assert_eq!(Trigger::parse(t.as_str()).unwrap(), t);
        }
        Trigger::parse("nonsense").unwrap_err();
    }
}
