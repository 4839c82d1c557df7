//! Run settings
//!
//! Settings are read once at start-up from a JSON file. Every field has a
//! default, so the file only needs to name what differs, e.g.
//!
//! ```json
//! {"tdc": {"meas_mode": 2, "num_stop": 3, "calibration_periods": 40,
//!          "timeout": 165e-6},
//!  "batch_size": 1000, "simulate": true}
//! ```
use std::path::Path;

use heapless::String;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use tdc7201::{Configuration, RetryPolicy};

use crate::Error;

/// Largest accepted settings file.
const MAX_SIZE: usize = 4096;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<Level> for LevelFilter {
    fn from(value: Level) -> Self {
        match value {
            Level::Error => Self::Error,
            Level::Warn => Self::Warn,
            Level::Info => Self::Info,
            Level::Debug => Self::Debug,
            Level::Trace => Self::Trace,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Chip configuration.
    pub tdc: Configuration,
    /// Requested SPI clock in Hz.
    pub spi_speed: u32,
    /// Apply `spi_speed` without range checks.
    pub force_speed: bool,
    /// Give up configuring after this many read-back mismatches per register.
    /// Retries forever if absent.
    pub retry_limit: Option<u32>,
    /// Measurements per reported batch.
    pub batch_size: u32,
    /// Number of batches. Zero runs until interrupted.
    pub batches: u32,
    /// Synthesize START and STOP pulses.
    pub simulate: bool,
    /// Probability of each synthesized STOP pulse.
    pub stop_density: Option<f32>,
    /// Pulse generator seed.
    pub seed: u64,
    /// SPI device of a hardware chip. Only the simulated chip is supported
    /// when this is absent.
    pub device: Option<String<64>>,
    /// Telemetry topic prefix.
    pub prefix: String<64>,
    pub log_level: Level,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tdc: Configuration::default(),
            spi_speed: 20_000_000,
            force_speed: false,
            retry_limit: None,
            batch_size: 1000,
            batches: 1,
            simulate: true,
            stop_density: None,
            seed: 0x5eed,
            device: None,
            prefix: String::try_from("QTD/VDGG/qtd-0W").unwrap_or_default(),
            log_level: Level::Info,
        }
    }
}

impl Settings {
    pub fn from_json(data: &[u8]) -> Result<Self, Error> {
        let (settings, _) =
            serde_json_core::from_slice(data).map_err(Error::Settings)?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read(path)?;
        if data.len() > MAX_SIZE {
            log::warn!("{} is {} bytes, ignoring the rest", path.display(), data.len());
        }
        Self::from_json(&data[..data.len().min(MAX_SIZE)])
    }

    pub fn retry(&self) -> RetryPolicy {
        match self.retry_limit {
            Some(limit) => RetryPolicy::Bounded(limit),
            None => RetryPolicy::Unbounded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdc7201::Edge;

    #[test]
    fn defaults() {
        let s = Settings::from_json(b"{}").unwrap();
        assert_eq!(s, Settings::default());
        assert_eq!(s.retry(), RetryPolicy::Unbounded);
        assert_eq!(s.prefix.as_str(), "QTD/VDGG/qtd-0W");
    }

    #[test]
    fn partial() {
        let s = Settings::from_json(
            br#"{"tdc": {"meas_mode": 1, "num_stop": 3, "timeout": 1.5e-6,
                 "stop_edge": "Falling"},
                 "retry_limit": 5, "batches": 0, "log_level": "Debug",
                 "prefix": "QTD/bench"}"#,
        )
        .unwrap();
        assert_eq!(s.tdc.meas_mode, 1);
        assert_eq!(s.tdc.num_stop, 3);
        assert_eq!(s.tdc.timeout, Some(1.5e-6));
        assert_eq!(s.tdc.stop_edge, Edge::Falling);
        assert_eq!(s.tdc.calibration_periods, 10);
        assert_eq!(s.retry(), RetryPolicy::Bounded(5));
        assert_eq!(s.batches, 0);
        assert_eq!(LevelFilter::from(s.log_level), LevelFilter::Debug);
        assert_eq!(s.prefix.as_str(), "QTD/bench");
    }

    #[test]
    fn malformed() {
        assert!(matches!(
            Settings::from_json(b"{\"batch_size\": -1}"),
            Err(Error::Settings(_))
        ));
    }
}
