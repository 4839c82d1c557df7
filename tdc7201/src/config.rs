//! Measurement configuration and its translation to register values.
use num_traits::float::FloatCore;
use serde::{Deserialize, Serialize};

use crate::registers::{
    AvgCycles, CalibrationPeriods, Config1, Config2, IntMask, MeasMode,
    NumStop,
};
use crate::Error;

/// Signal edge polarity.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Edge {
    #[default]
    Rising,
    Falling,
}

impl Edge {
    pub fn is_falling(&self) -> bool {
        *self == Self::Falling
    }

    /// Line level while the signal is not asserted.
    pub fn idle_high(&self) -> bool {
        self.is_falling()
    }
}

/// Reference clock fitted to the board.
pub const DEFAULT_CLOCK_FREQUENCY: f64 = 8e6;

/// Parameters chosen once per run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Measurement mode 1 or 2.
    pub meas_mode: u8,
    /// Calibrate after every measurement, even if it timed out.
    pub force_cal: bool,
    pub trigger_edge: Edge,
    pub start_edge: Edge,
    pub stop_edge: Edge,
    /// Requested calibration periods. Rounded up to 2, 10, 20 or 40.
    pub calibration_periods: u32,
    /// Requested averaging cycles. Rounded up to a power of two in 1..=128.
    pub avg_cycles: u32,
    /// Number of STOP pulses to wait for, 1..=5.
    pub num_stop: u8,
    /// Clock periods after START during which STOP pulses are ignored.
    pub clock_cntr_stop: u16,
    /// Clock periods after START until the measurement times out.
    pub clock_cntr_ovf: u32,
    /// Timeout in seconds. Overrides `clock_cntr_ovf` if given.
    pub timeout: Option<f64>,
    /// Reference clock frequency in Hz. Values below 1 Hz are replaced by
    /// [DEFAULT_CLOCK_FREQUENCY].
    pub clock_frequency: f64,
}

impl Default for Configuration {
    /// Hardware reset defaults, except for forced calibration and mode 2.
    fn default() -> Self {
        Self {
            meas_mode: 2,
            force_cal: true,
            trigger_edge: Edge::Rising,
            start_edge: Edge::Rising,
            stop_edge: Edge::Rising,
            calibration_periods: 10,
            avg_cycles: 1,
            num_stop: 1,
            clock_cntr_stop: 0,
            clock_cntr_ovf: 0xffff,
            timeout: None,
            clock_frequency: DEFAULT_CLOCK_FREQUENCY,
        }
    }
}

/// Register values derived from a [Configuration].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Registers {
    pub config1: Config1,
    pub config2: Config2,
    pub int_mask: IntMask,
    pub clock_cntr_stop_mask: u16,
    pub clock_cntr_ovf: u16,
}

/// Round a calibration period request up to the next supported tier.
pub fn calibration_periods(requested: u32) -> CalibrationPeriods {
    match requested {
        0..=2 => CalibrationPeriods::Two,
        3..=10 => CalibrationPeriods::Ten,
        11..=20 => CalibrationPeriods::Twenty,
        _ => {
            if requested > 40 {
                log::warn!(
                    "{requested} calibration periods not supported, using 40"
                );
            }
            CalibrationPeriods::Forty
        }
    }
}

/// Round an averaging request up to the next power of two, clamped to 1..=128.
pub fn avg_cycles(requested: u32) -> AvgCycles {
    if requested == 0 || requested > 128 {
        log::warn!("{requested} averaging cycles out of range 1..=128");
    }
    match requested {
        0..=1 => AvgCycles::One,
        2 => AvgCycles::Two,
        3..=4 => AvgCycles::Four,
        5..=8 => AvgCycles::Eight,
        9..=16 => AvgCycles::Sixteen,
        17..=32 => AvgCycles::ThirtyTwo,
        33..=64 => AvgCycles::SixtyFour,
        _ => AvgCycles::OneTwentyEight,
    }
}

pub fn num_stop(requested: u8) -> NumStop {
    match requested {
        1 => NumStop::One,
        2 => NumStop::Two,
        3 => NumStop::Three,
        4 => NumStop::Four,
        5 => NumStop::Five,
        _ => {
            log::warn!("{requested} is not a valid number of stop pulses, using 1");
            NumStop::One
        }
    }
}

pub fn meas_mode(requested: u8) -> MeasMode {
    match requested {
        1 => MeasMode::One,
        2 => MeasMode::Two,
        _ => {
            log::warn!("{requested} is not a legal measurement mode, using 1");
            MeasMode::One
        }
    }
}

impl Configuration {
    /// Usable reference clock frequency in Hz.
    pub fn reference_frequency(&self) -> f64 {
        if self.clock_frequency.is_finite() && self.clock_frequency >= 1. {
            self.clock_frequency
        } else {
            DEFAULT_CLOCK_FREQUENCY
        }
    }

    pub fn clock_period(&self) -> f64 {
        self.reference_frequency().recip()
    }

    /// Overflow in clock periods, before range checks.
    fn overflow(&self) -> u32 {
        match self.timeout {
            Some(timeout) => {
                (timeout * self.reference_frequency()).round() as u32
            }
            None => self.clock_cntr_ovf,
        }
    }

    /// Compute all control register values.
    ///
    /// Out-of-range requests are coerced to the nearest safe value with a
    /// warning. An overflow that does not fit the 16-bit register is an error.
    pub fn registers(&self) -> Result<Registers, Error> {
        if self.reference_frequency() != self.clock_frequency {
            log::warn!(
                "{} Hz is not a valid clock frequency, using {DEFAULT_CLOCK_FREQUENCY} Hz",
                self.clock_frequency
            );
        }
        let mode = meas_mode(self.meas_mode);
        let config1 = Config1::default()
            .with_force_cal(self.force_cal)
            .with_trigg_edge(self.trigger_edge.is_falling())
            .with_start_edge(self.start_edge.is_falling())
            .with_stop_edge(self.stop_edge.is_falling())
            .with_meas_mode(mode);
        let config2 = Config2::default()
            .with_calibration2_periods(calibration_periods(
                self.calibration_periods,
            ))
            .with_avg_cycles(avg_cycles(self.avg_cycles))
            .with_num_stop(num_stop(self.num_stop));

        let mut ovf = self.overflow();
        let timeout = ovf as f64 * self.clock_period();
        if mode == MeasMode::Two && timeout < 2e-6 {
            log::warn!(
                "Timeout {:.0} ns < 2000 ns in mode 2, mode 1 may be better",
                timeout * 1e9
            );
        } else if mode == MeasMode::One && timeout > 2e-6 {
            log::warn!(
                "Timeout {:.0} ns > 2000 ns in mode 1, mode 2 may be better",
                timeout * 1e9
            );
        }
        if ovf <= self.clock_cntr_stop as u32 {
            ovf = self.clock_cntr_stop as u32 + 1;
            log::warn!(
                "CLOCK_CNTR_OVF must exceed CLOCK_CNTR_STOP_MASK, using {ovf:#x}"
            );
        }
        let clock_cntr_ovf =
            u16::try_from(ovf).map_err(|_| Error::Overflow(ovf))?;

        Ok(Registers {
            config1,
            config2,
            int_mask: IntMask::default(),
            clock_cntr_stop_mask: self.clock_cntr_stop,
            clock_cntr_ovf,
        })
    }
}

/// Lowest usable bus clock.
pub const MIN_SPI_SPEED: u32 = 50_000;
/// Rated maximum bus clock.
pub const MAX_SPI_SPEED: u32 = 25_000_000;
/// Highest bus clock observed to work. Faster wedges the bus.
pub const ABS_MAX_SPI_SPEED: u32 = 33_300_000;

/// Clamp a requested bus clock to the usable range.
pub fn spi_speed(requested: u32) -> u32 {
    if requested < MIN_SPI_SPEED {
        log::warn!(
            "SPI clock {requested} Hz too low, using {MIN_SPI_SPEED} Hz"
        );
        return MIN_SPI_SPEED;
    }
    let mut speed = requested;
    if speed > ABS_MAX_SPI_SPEED {
        log::warn!(
            "SPI clock {requested} Hz way too high, using {ABS_MAX_SPI_SPEED} Hz"
        );
        speed = ABS_MAX_SPI_SPEED;
    }
    if speed > MAX_SPI_SPEED {
        log::warn!(
            "SPI clock {speed} Hz above rated {MAX_SPI_SPEED} Hz, not guaranteed to work"
        );
    }
    speed
}
