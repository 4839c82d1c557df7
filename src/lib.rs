//! Muon decay acquisition with the TDC7201.
//!
//! The binary configures the chip, runs batches of measurements and reports
//! an outcome histogram and decay interval statistics per batch.
pub mod batch;
pub mod logger;
pub mod settings;
pub mod statistics;
pub mod telemetry;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("TDC7201: {0}")]
    Tdc(#[from] tdc7201::Error),
    #[error("Settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Settings format: {0:?}")]
    Settings(serde_json_core::de::Error),
    #[error("No transport for bus {0}")]
    BusUnavailable(heapless::String<64>),
    #[error("Logger already installed")]
    Logger,
}
