//! One measurement cycle: arm, trigger, optional test pulses, interrupt, readout.
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use rand_core::{RngCore, SeedableRng};
use rand_xorshift::XorShiftRng;
use serde::Serialize;

use crate::calibration::Tofs;
use crate::driver::{drive, sense, Tdc7201};
use crate::registers::{Addr, IntStatus};
use crate::{pin_error, Duration, Error, Monotonic, RegisterBus};

/// Result of one measurement attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Outcome {
    /// Number of captured STOP pulses, 0..=5.
    Pulses(u8),
    /// The chip did not calibrate, results are unusable.
    NoCalibration,
    /// No interrupt before the overflow deadline.
    InterruptTimeout,
    /// TRIG did not return to idle after START.
    TriggerFallTimeout,
    /// Interrupt asserted before START.
    InterruptEarly,
    /// TRIG did not assert after START_MEAS.
    TriggerRiseTimeout,
    /// TRIG was not idle before arming. The chip has been reset.
    TriggerPolarity,
    /// Interrupt still asserted from a previous measurement.
    InterruptAlreadyActive,
}

impl Outcome {
    /// Number of histogram buckets.
    pub const COUNT: usize = 13;

    /// Stable histogram bucket.
    pub fn index(&self) -> usize {
        match self {
            Self::Pulses(n) => (*n).min(5) as usize,
            Self::NoCalibration => 6,
            Self::InterruptTimeout => 7,
            Self::TriggerFallTimeout => 8,
            Self::InterruptEarly => 9,
            Self::TriggerRiseTimeout => 10,
            Self::TriggerPolarity => 11,
            Self::InterruptAlreadyActive => 12,
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Pulses(_))
    }
}

/// Outcome counts over a batch.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Histogram {
    pub counts: [u32; Outcome::COUNT],
}

impl Histogram {
    pub fn record(&mut self, outcome: Outcome) {
        self.counts[outcome.index()] += 1;
    }

    pub fn get(&self, outcome: Outcome) -> u32 {
        self.counts[outcome.index()]
    }

    pub fn total(&self) -> u32 {
        self.counts.iter().sum()
    }

    /// Attempts that ended in a protocol or timeout condition.
    pub fn errors(&self) -> u32 {
        self.counts[6..].iter().sum()
    }

    pub fn merge(&mut self, other: &Self) {
        for (a, b) in self.counts.iter_mut().zip(other.counts.iter()) {
            *a += b;
        }
    }
}

/// Synthesized START/STOP pulse source.
pub struct Stimulus {
    rng: XorShiftRng,
    density: Option<f32>,
}

impl Stimulus {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: XorShiftRng::seed_from_u64(seed),
            density: None,
        }
    }

    /// Probability that each STOP slot fires.
    ///
    /// Defaults to `min(n, 2) / n` for `n` stops so that two pulses are
    /// expected per measurement.
    pub fn with_density(mut self, density: f32) -> Self {
        self.density = Some(density);
        self
    }

    fn fires(&mut self, stops: u8) -> bool {
        let density = self
            .density
            .unwrap_or(stops.min(2) as f32 / stops.max(1) as f32);
        (self.rng.next_u32() as f64) < density as f64 * (1u64 << 32) as f64
    }

    /// Idle writes before the next STOP, 0..=3.
    fn spacing(&mut self) -> u32 {
        self.rng.next_u32() & 0b11
    }
}

impl<B, I, O, C> Tdc7201<B, I, O, C>
where
    B: RegisterBus,
    I: InputPin,
    O: OutputPin,
    C: Monotonic + DelayNs,
{
    /// INT is active low. `None` if unassigned.
    fn interrupt(&mut self) -> Result<Option<bool>, Error> {
        Ok(sense(&mut self.pins.int1)?.map(|high| !high))
    }

    /// Wait for TRIG to reach `high`. `None` if TRIG is unassigned.
    fn wait_trigger(
        &mut self,
        high: bool,
        timeout: Duration,
    ) -> Result<Option<bool>, Error> {
        let Some(pin) = self.pins.trig1.as_mut() else {
            return Ok(None);
        };
        let deadline = self.clock.now() + timeout;
        loop {
            if pin.is_high().map_err(pin_error)? == high {
                return Ok(Some(true));
            }
            if self.clock.now() >= deadline {
                return Ok(Some(false));
            }
        }
    }

    /// Wait for the measurement interrupt, polling INT_STATUS if INT is
    /// unassigned.
    fn wait_interrupt(&mut self, timeout: Duration) -> Result<bool, Error> {
        let deadline = self.clock.now() + timeout;
        loop {
            let done = match self.interrupt()? {
                Some(active) => active,
                None => {
                    let status = IntStatus::new_with_raw_value(
                        self.read8(Addr::IntStatus)?,
                    );
                    status.new_meas_int()
                        || status.clock_cntr_ovf_int()
                        || status.coarse_cntr_ovf_int()
                }
            };
            if done {
                return Ok(true);
            }
            if self.clock.now() >= deadline {
                return Ok(false);
            }
        }
    }

    fn pulse(pin: &mut Option<O>, idle: bool) -> Result<(), Error> {
        drive(pin, !idle)?;
        drive(pin, idle)
    }

    fn stimulate(&mut self, stimulus: &mut Stimulus) -> Result<(), Error> {
        let config1 = self.regs.config1();
        let stops = self.regs.config2().num_stop().stops();
        let stop_idle = config1.stop_edge();
        if self.pins.stop.is_none() {
            return Ok(());
        }
        for _ in 0..stops {
            for _ in 0..stimulus.spacing() {
                drive(&mut self.pins.stop, stop_idle)?;
            }
            if stimulus.fires(stops) {
                Self::pulse(&mut self.pins.stop, stop_idle)?;
            }
        }
        Ok(())
    }

    /// Run one measurement.
    ///
    /// With a `stimulus` the START and STOP pulses are synthesized on the
    /// respective outputs. Otherwise START must arrive on the signal path
    /// within the trigger timeout. Call [Tdc7201::clear_status] before the next
    /// measurement.
    pub fn measure(
        &mut self,
        stimulus: Option<&mut Stimulus>,
    ) -> Result<Outcome, Error> {
        self.tofs = None;
        let config1 = self.regs.config1().with_start_meas(false);
        let trig_idle = config1.trigg_edge();

        if self.interrupt()? == Some(true) {
            log::warn!("INT1 active before arming, clearing status");
            self.clear_status(false)?;
            return Ok(Outcome::InterruptAlreadyActive);
        }

        if let Some(level) = sense(&mut self.pins.trig1)? {
            if level != trig_idle {
                log::error!("TRIG1 not idle before arming, resetting chip");
                self.off()?;
                self.on()?;
                self.reconfigure()?;
                return Ok(Outcome::TriggerPolarity);
            }
        }

        self.write8(Addr::Config1, config1.with_start_meas(true).raw_value())?;
        // The chip clears START_MEAS on completion.
        self.regs.set(Addr::Config1, config1.raw_value().into());

        let timeout = self.timing.trigger;
        if self.wait_trigger(!trig_idle, timeout)? == Some(false) {
            log::warn!(
                "TRIG1 did not assert within {} us, CONFIG1 {:?} INT_STATUS {:?}",
                timeout.to_micros(),
                self.regs.get(Addr::Config1),
                self.regs.get(Addr::IntStatus)
            );
            return Ok(Outcome::TriggerRiseTimeout);
        }
        if self.interrupt()? == Some(true) {
            log::warn!("INT1 asserted before START");
            self.clear_status(false)?;
            return Ok(Outcome::InterruptEarly);
        }

        if stimulus.is_some() {
            Self::pulse(&mut self.pins.start, config1.start_edge())?;
        }
        // TRIG clears once START has been seen.
        if self.wait_trigger(trig_idle, timeout)? == Some(false) {
            log::warn!(
                "TRIG1 did not clear within {} us, CONFIG1 {:?} INT_STATUS {:?}",
                timeout.to_micros(),
                self.regs.get(Addr::Config1),
                self.regs.get(Addr::IntStatus)
            );
            return Ok(Outcome::TriggerFallTimeout);
        }
        if let Some(stimulus) = stimulus {
            self.stimulate(stimulus)?;
        }

        let timeout = self.interrupt_timeout();
        if !self.wait_interrupt(timeout)? {
            log::warn!(
                "No interrupt within {} us, INT_STATUS {:?}",
                timeout.to_micros(),
                self.regs.get(Addr::IntStatus)
            );
            return Ok(Outcome::InterruptTimeout);
        }

        self.read_regs24()?;
        match Tofs::from_registers(&self.regs, self.clock_period()) {
            Some(tofs) => {
                let pulses = tofs.pulses();
                self.tofs = Some(tofs);
                Ok(Outcome::Pulses(pulses))
            }
            None => {
                log::warn!(
                    "No calibration, CALIBRATION1 {} CALIBRATION2 {}",
                    self.regs.wide(Addr::Calibration1),
                    self.regs.wide(Addr::Calibration2)
                );
                Ok(Outcome::NoCalibration)
            }
        }
    }
}
