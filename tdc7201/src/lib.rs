//! Driver for the TI TDC7201 time-to-digital converter.
//!
//! The chip measures the time between a START edge and up to five STOP edges
//! with a ring oscillator calibrated against the reference clock. This crate
//! covers side #1 of the chip: register access and configuration over SPI,
//! the per-measurement handshake on the TRIG/INT lines, optional synthesis of
//! START/STOP test pulses, and conversion of the raw counts to time of flight.
//!
//! Bus and pins are `embedded-hal` 1.0 traits. Two small additional seams
//! cover what `embedded-hal` does not: [RegisterBus] sets the bus clock and
//! [Monotonic] provides a time base for busy-wait deadlines.
#![no_std]

use embedded_hal::digital;
use embedded_hal::spi::{self, SpiDevice};

pub mod calibration;
pub mod config;
mod driver;
mod measure;
pub mod registers;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use calibration::{Calibration, Tofs};
pub use config::{Configuration, Edge};
pub use driver::{Pins, RetryPolicy, Tdc7201, Timing};
pub use measure::{Histogram, Outcome, Stimulus};
pub use registers::{Addr, Pair, RegisterFile};

/// Nanosecond time base.
pub type Instant = fugit::TimerInstantU64<1_000_000_000>;
pub type Duration = fugit::TimerDurationU64<1_000_000_000>;

/// A free running clock for deadline polling.
pub trait Monotonic {
    fn now(&mut self) -> Instant;
}

/// Register bus with an adjustable clock.
pub trait RegisterBus: SpiDevice<u8> {
    /// Set the SCLK frequency in Hz.
    fn set_speed(&mut self, hz: u32) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("SPI {0:?}")]
    Bus(spi::ErrorKind),
    #[error("GPIO {0:?}")]
    Pin(digital::ErrorKind),
    #[error("{register} readback {read:#x} != {wanted:#x}")]
    Verify {
        register: &'static str,
        wanted: u16,
        read: u16,
    },
    #[error("CLOCK_CNTR_OVF {0:#x} exceeds 0xffff")]
    Overflow(u32),
}

impl<E: spi::Error> From<E> for Error {
    fn from(value: E) -> Self {
        Self::Bus(value.kind())
    }
}

pub(crate) fn pin_error<E: digital::Error>(value: E) -> Error {
    Error::Pin(value.kind())
}
