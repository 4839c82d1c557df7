//! Conversion of raw result counts to times of flight.
use heapless::Vec;
use serde::Serialize;

use crate::registers::{Addr, MeasMode, RegisterFile};

/// Ring oscillator calibration of one measurement.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Calibration {
    pub periods: u32,
    /// Ring oscillator counts per clock period.
    pub count: f64,
}

impl Calibration {
    /// `None` if the result does not carry a usable calibration.
    pub fn new(calibration1: u32, calibration2: u32, periods: u32) -> Option<Self> {
        if periods <= 1 {
            return None;
        }
        let count = (calibration2 as f64 - calibration1 as f64)
            / (periods - 1) as f64;
        (count != 0.0).then_some(Self { periods, count })
    }

    pub fn from_registers(regs: &RegisterFile) -> Option<Self> {
        Self::new(
            regs.wide(Addr::Calibration1),
            regs.wide(Addr::Calibration2),
            regs.config2().calibration2_periods().periods(),
        )
    }

    /// Seconds per ring oscillator count.
    pub fn norm_lsb(&self, clock_period: f64) -> f64 {
        clock_period / self.count
    }
}

/// Times of flight in seconds. Zero marks a slot without a pulse.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct Tofs {
    pub tof: [f64; 5],
}

impl Tofs {
    /// Mode 1: `TIME_n` counts from START to STOP n.
    pub fn mode1(regs: &RegisterFile, norm_lsb: f64) -> Self {
        let mut tof = [0.0; 5];
        for (t, addr) in tof.iter_mut().zip(Addr::TIME) {
            *t = norm_lsb * regs.wide(addr) as f64;
        }
        Self { tof }
    }

    /// Mode 2: fine counts at either end plus whole clock periods between.
    pub fn mode2(
        regs: &RegisterFile,
        norm_lsb: f64,
        clock_period: f64,
    ) -> Self {
        let avg = regs.config2().avg_cycles().cycles() as f64;
        let time1 = regs.wide(Addr::Time1) as f64;
        let mut tof = [0.0; 5];
        for (i, t) in tof.iter_mut().enumerate() {
            let time = regs.wide(Addr::TIME[i + 1]);
            let count = regs.wide(Addr::CLOCK_COUNT[i]);
            if time != 0 || count != 0 {
                *t = norm_lsb * (time1 - time as f64)
                    + count as f64 / avg * clock_period;
            }
        }
        Self { tof }
    }

    /// Compute from the result registers and the CONFIG mirror.
    ///
    /// `None` if the chip did not calibrate.
    pub fn from_registers(regs: &RegisterFile, clock_period: f64) -> Option<Self> {
        let norm_lsb = Calibration::from_registers(regs)?.norm_lsb(clock_period);
        Some(match regs.config1().meas_mode() {
            MeasMode::Two => Self::mode2(regs, norm_lsb, clock_period),
            _ => Self::mode1(regs, norm_lsb),
        })
    }

    /// Number of captured pulses. Gaps are not checked.
    pub fn pulses(&self) -> u8 {
        self.tof.iter().filter(|&&t| t != 0.0).count() as u8
    }

    /// Intervals between consecutive captured pulses.
    pub fn deltas(&self) -> Vec<f64, 4> {
        let n = self.pulses() as usize;
        self.tof[..n].windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Interval between the first two pulses.
    pub fn decay(&self) -> Option<f64> {
        self.deltas().first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::float::FloatCore;
    use crate::registers::{AvgCycles, CalibrationPeriods, Config1, Config2};

    const PERIOD: f64 = 125e-9;

    fn isclose(a: f64, b: f64, rtol: f64, atol: f64) -> bool {
        (a - b).abs() <= a.abs().max(b.abs()) * rtol + atol
    }

    fn calibrated(mode: MeasMode, periods: CalibrationPeriods) -> RegisterFile {
        let mut regs = RegisterFile::default();
        regs.set(
            Addr::Config1,
            Config1::default().with_meas_mode(mode).raw_value().into(),
        );
        regs.set(
            Addr::Config2,
            Config2::default()
                .with_calibration2_periods(periods)
                .raw_value()
                .into(),
        );
        regs.set(Addr::Calibration1, 100);
        regs.set(Addr::Calibration2, 3900);
        regs
    }

    #[test]
    fn calibration_count() {
        let regs = calibrated(MeasMode::One, CalibrationPeriods::Forty);
        let cal = Calibration::from_registers(&regs).unwrap();
        assert_eq!(cal.periods, 40);
        assert!(isclose(cal.count, 97.435_897_435_9, 1e-9, 0.0));
    }

    #[test]
    fn no_calibration() {
        assert_eq!(Calibration::new(100, 100, 10), None);
        assert_eq!(Calibration::new(0, 0, 40), None);
        assert_eq!(Calibration::new(100, 3900, 1), None);
        assert_eq!(Calibration::new(100, 3900, 0), None);
        let regs = RegisterFile::default();
        assert_eq!(Tofs::from_registers(&regs, PERIOD), None);
    }

    #[test]
    fn mode1_tof() {
        let mut regs = calibrated(MeasMode::One, CalibrationPeriods::Forty);
        regs.set(Addr::Time1, 500);
        let tofs = Tofs::from_registers(&regs, PERIOD).unwrap();
        let expect = PERIOD / (3800.0 / 39.0) * 500.0;
        assert!(isclose(tofs.tof[0], expect, 1e-12, 0.0));
        assert_eq!(tofs.pulses(), 1);
        assert_eq!(tofs.decay(), None);
    }

    #[test]
    fn mode2_tof() {
        let mut regs = calibrated(MeasMode::Two, CalibrationPeriods::Forty);
        let lsb = PERIOD / (3800.0 / 39.0);
        regs.set(Addr::Time1, 1000);
        regs.set(Addr::Time2, 400);
        regs.set(Addr::ClockCount1, 3);
        regs.set(Addr::Time3, 200);
        regs.set(Addr::ClockCount2, 10);
        let tofs = Tofs::from_registers(&regs, PERIOD).unwrap();
        assert_eq!(tofs.pulses(), 2);
        assert!(isclose(tofs.tof[0], 600.0 * lsb + 3.0 * PERIOD, 1e-12, 0.0));
        assert!(isclose(tofs.tof[1], 800.0 * lsb + 10.0 * PERIOD, 1e-12, 0.0));
        assert_eq!(tofs.tof[2], 0.0);
        let decay = tofs.decay().unwrap();
        assert!(isclose(decay, 200.0 * lsb + 7.0 * PERIOD, 1e-9, 0.0));
    }

    #[test]
    fn mode2_averaging() {
        let mut regs = calibrated(MeasMode::Two, CalibrationPeriods::Forty);
        let config2 = regs.config2().with_avg_cycles(AvgCycles::Four);
        regs.set(Addr::Config2, config2.raw_value().into());
        regs.set(Addr::Time1, 100);
        regs.set(Addr::Time2, 100);
        regs.set(Addr::ClockCount1, 40);
        let tofs = Tofs::from_registers(&regs, PERIOD).unwrap();
        assert!(isclose(tofs.tof[0], 10.0 * PERIOD, 1e-12, 0.0));
    }
}
