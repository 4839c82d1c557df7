//! Repeated measurements and their per-batch summary.
use std::fmt::Write as _;
use std::time::Instant;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use serde::Serialize;
use tdc7201::{Histogram, Monotonic, Outcome, RegisterBus, Stimulus, Tdc7201};

use crate::statistics::{DecayHistogram, ScaledStatistics, State};

/// Summary of one batch.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct Report {
    /// Outcome counts indexed by [Outcome::index].
    pub histogram: Histogram,
    /// First decay interval of every measurement with two or more pulses,
    /// in microseconds.
    pub decay: ScaledStatistics,
    /// The same intervals binned over the measurement window.
    pub decay_histogram: DecayHistogram,
    /// Measurements per second of wall time.
    pub rate: f32,
}

pub struct BatchRunner {
    size: u32,
    stimulus: Option<Stimulus>,
}

impl BatchRunner {
    /// Run batches of `size` measurements, synthesizing pulses from
    /// `stimulus` if given.
    pub fn new(size: u32, stimulus: Option<Stimulus>) -> Self {
        Self { size, stimulus }
    }

    pub fn run<B, I, O, C>(
        &mut self,
        tdc: &mut Tdc7201<B, I, O, C>,
    ) -> Result<Report, tdc7201::Error>
    where
        B: RegisterBus,
        I: InputPin,
        O: OutputPin,
        C: Monotonic + DelayNs,
    {
        let mut histogram = Histogram::default();
        let mut decay = State::default();
        let window = tdc.measurement_window().ticks() as f64 * 1e-9;
        let mut decay_histogram = DecayHistogram::new(window);
        let begin = Instant::now();
        for _ in 0..self.size {
            let outcome = tdc.measure(self.stimulus.as_mut())?;
            histogram.record(outcome);
            if let (Outcome::Pulses(n), Some(tofs)) = (outcome, tdc.tofs()) {
                if let Some(d) = tofs.decay() {
                    decay.update_seconds(d);
                    decay_histogram.record(d);
                }
                if log::log_enabled!(log::Level::Debug) {
                    let mut line = format!("P {n}");
                    for d in tofs.deltas() {
                        write!(line, " {:.3}", d * 1e6).ok();
                    }
                    log::debug!("{line}");
                }
            }
            tdc.clear_status(false)?;
        }
        let elapsed = begin.elapsed().as_secs_f32();
        let rate = if elapsed > 0. {
            self.size as f32 / elapsed
        } else {
            0.
        };
        log::info!(
            "{} measurements, {} errors, {:.0}/s",
            histogram.total(),
            histogram.errors(),
            rate
        );
        Ok(Report {
            histogram,
            decay: decay.get_scaled(1e-3),
            decay_histogram,
            rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use tdc7201::sim::SimChip;
    use tdc7201::Configuration;

    use super::*;

    #[test]
    fn simulated_batch() {
        let chip = RefCell::new(SimChip::default());
        let mut tdc = SimChip::driver(&chip).unwrap();
        tdc.set_clock_speed(20_000_000, false).unwrap();
        tdc.on().unwrap();
        tdc.configure(&Configuration {
            num_stop: 3,
            calibration_periods: 40,
            timeout: Some(165e-6),
            ..Default::default()
        })
        .unwrap();

        let mut runner = BatchRunner::new(500, Some(Stimulus::new(11)));
        let report = runner.run(&mut tdc).unwrap();
        let h = &report.histogram;
        assert_eq!(h.total(), 500);
        assert_eq!(h.errors(), 0);
        let decays = h.get(Outcome::Pulses(2)) + h.get(Outcome::Pulses(3));
        assert_eq!(report.decay.count, decays);
        assert!(report.decay.min >= 0.1);
        assert!(report.decay.max <= 1.0);
        // 165 us window in 32 bins, every decay lands in the first.
        let bins = &report.decay_histogram;
        assert!((bins.bin_width - 5.156_25).abs() < 1e-3);
        assert_eq!(bins.total(), decays);
        assert_eq!(bins.counts[0], decays);
        assert!(decays > 0);
    }
}
