//! Tunables and the subscriber table.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::Deserialize;
use tracing::debug;

use crate::rate::RateParams;
use crate::types::{Kbps, MacAddr};
use crate::{Error, Result};

pub const DEFAULT_CAPACITY_KBPS: Kbps = 40_000;
pub const DEFAULT_BASELINE_KBPS: Kbps = 5_000;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_SATURATION: f64 = 0.7;
pub const DEFAULT_AMPLIFICATION: f64 = 1.5;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u16 = 30;
pub const DEFAULT_WORKERS: usize = 4;

/// Controller tunables.
#[derive(Clone, Debug, PartialEq)]
pub struct QosConfig {
    /// Per-port capacity cap shared by the subscribers on that port.
    pub capacity: Kbps,
    /// Rate of every port's default meter, and the floor of the demand
    /// estimate.
    pub baseline: Kbps,
    /// Time between two meter stats polls. Also the sampling interval used to
    /// turn byte counter deltas into rates.
    pub poll_interval: Duration,
    /// Fraction of its allocation a capped subscriber must use before its
    /// usage is amplified and its port reallocated.
    pub saturation: f64,
    pub amplification: f64,
    /// Idle timeout of learned forwarding rules, in seconds.
    pub idle_timeout: u16,
    /// Number of worker threads running admissions and reallocations.
    pub workers: usize,
}

impl Default for QosConfig {
    fn default() -> Self {
        QosConfig {
            capacity: DEFAULT_CAPACITY_KBPS,
            baseline: DEFAULT_BASELINE_KBPS,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            saturation: DEFAULT_SATURATION,
            amplification: DEFAULT_AMPLIFICATION,
            idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            workers: DEFAULT_WORKERS,
        }
    }
}

impl QosConfig {
    pub fn rate_params(&self) -> RateParams {
        RateParams {
            baseline: self.baseline,
            amplification: self.amplification,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error(String::from("capacity must be positive")));
        }

        if self.poll_interval.as_millis() == 0 {
            return Err(Error(String::from("poll interval must be positive")));
        }

        if !(self.saturation > 0.0 && self.saturation <= 1.0) {
            return Err(Error(format!(
                "saturation threshold must be in (0, 1]: {}",
                self.saturation
            )));
        }

        if !(self.amplification >= 1.0) {
            return Err(Error(format!(
                "amplification factor must be at least 1: {}",
                self.amplification
            )));
        }

        if self.workers == 0 {
            return Err(Error(String::from("need at least one worker")));
        }

        Ok(())
    }
}

/// Provisioned subscribers and their contracted rates.
///
/// The on-disk format is a JSON object keyed by MAC address. Rates may be
/// integers or numeric strings:
///
/// ```json
/// { "00:00:00:00:00:01": 10000, "00:00:00:00:00:02": "20000" }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct SubscriberTable(#[serde(deserialize_with = "deserialize_rates")] HashMap<MacAddr, Kbps>);

impl SubscriberTable {
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(Error::from)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| Error(format!("reading subscriber table {}: {}", path.display(), e)))?;
        let table = Self::from_json(&raw)?;
        debug!(path = %path.display(), subscribers = table.len(), "loaded subscriber table");
        Ok(table)
    }

    /// The contracted rate of `src`, if it is a subscriber.
    pub fn rate(&self, src: &MacAddr) -> Option<Kbps> {
        self.0.get(src).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MacAddr, &Kbps)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::iter::FromIterator<(MacAddr, Kbps)> for SubscriberTable {
    fn from_iter<I: IntoIterator<Item = (MacAddr, Kbps)>>(iter: I) -> Self {
        SubscriberTable(iter.into_iter().collect())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRate {
    Num(u64),
    Float(f64),
    Str(String),
}

impl RawRate {
    fn kbps(self) -> std::result::Result<Kbps, String> {
        match self {
            RawRate::Num(n) => Ok(n),
            RawRate::Float(f) if f >= 0.0 && f.is_finite() => Ok(f as Kbps),
            RawRate::Float(f) => Err(format!("invalid rate {}", f)),
            RawRate::Str(s) => s
                .trim()
                .parse::<Kbps>()
                .map_err(|e| format!("invalid rate {:?}: {}", s, e)),
        }
    }
}

fn deserialize_rates<'de, D>(deserializer: D) -> std::result::Result<HashMap<MacAddr, Kbps>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = HashMap::<MacAddr, RawRate>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(mac, r)| r.kbps().map(|k| (mac, k)).map_err(de::Error::custom))
        .collect()
}
