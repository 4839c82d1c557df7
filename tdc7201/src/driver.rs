use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use num_traits::float::FloatCore;
use serde::{Deserialize, Serialize};

use crate::calibration::Tofs;
use crate::config::{self, Configuration, Registers};
use crate::registers::{
    Addr, Instruction, IntStatus, Pair, RegisterFile, REG24_COUNT, REG8_COUNT,
};
use crate::{pin_error, Duration, Error, Monotonic, RegisterBus};

/// GPIO lines of one chip. Unassigned lines disable the features using them.
pub struct Pins<I, O> {
    /// Chip enable, active high. Low resets the chip.
    pub enable: Option<O>,
    /// Reference oscillator enable.
    pub osc_enable: Option<O>,
    pub trig1: Option<I>,
    /// Interrupt, active low.
    pub int1: Option<I>,
    pub trig2: Option<I>,
    pub int2: Option<I>,
    /// Test pulse outputs wired to the START/STOP inputs.
    pub start: Option<O>,
    pub stop: Option<O>,
}

impl<I, O> Default for Pins<I, O> {
    fn default() -> Self {
        Self {
            enable: None,
            osc_enable: None,
            trig1: None,
            int1: None,
            trig2: None,
            int2: None,
            start: None,
            stop: None,
        }
    }
}

/// How often a configuration write is retried when its read-back differs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Retry until the register reads back what was written.
    #[default]
    Unbounded,
    /// Give up with [Error::Verify] after this many attempts.
    Bounded(u32),
}

impl RetryPolicy {
    fn exhausted(&self, attempts: u32) -> bool {
        match self {
            Self::Unbounded => false,
            Self::Bounded(limit) => attempts >= *limit,
        }
    }
}

/// Delays and deadlines.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Timing {
    /// Wait after ENABLE rises. The datasheet asks for at least 1.5 ms.
    pub settle: Duration,
    /// ENABLE low time for a reset.
    pub reset: Duration,
    /// Deadline for each TRIG transition.
    pub trigger: Duration,
    /// Added to the CLOCK_CNTR_OVF time to form the interrupt deadline.
    pub interrupt_margin: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            settle: Duration::millis(10),
            reset: Duration::micros(1),
            trigger: Duration::millis(1),
            interrupt_margin: Duration::micros(50),
        }
    }
}

pub(crate) fn drive<O: OutputPin>(
    pin: &mut Option<O>,
    high: bool,
) -> Result<(), Error> {
    if let Some(pin) = pin {
        pin.set_state(high.into()).map_err(pin_error)?;
    }
    Ok(())
}

/// Level of an input, `None` if unassigned.
pub(crate) fn sense<I: InputPin>(
    pin: &mut Option<I>,
) -> Result<Option<bool>, Error> {
    pin.as_mut()
        .map(|p| p.is_high())
        .transpose()
        .map_err(pin_error)
}

fn delay<C: DelayNs>(clock: &mut C, duration: Duration) {
    clock.delay_ns(u32::try_from(duration.ticks()).unwrap_or(u32::MAX));
}

/// A TDC7201 side #1 on an SPI bus.
pub struct Tdc7201<B, I, O, C> {
    pub(crate) bus: B,
    pub(crate) pins: Pins<I, O>,
    pub(crate) clock: C,
    pub(crate) regs: RegisterFile,
    pub(crate) timing: Timing,
    retry: RetryPolicy,
    clock_period: f64,
    pub(crate) tofs: Option<Tofs>,
}

impl<B, I, O, C> Tdc7201<B, I, O, C>
where
    B: RegisterBus,
    I: InputPin,
    O: OutputPin,
    C: Monotonic + DelayNs,
{
    /// Take ownership of the bus and pins.
    ///
    /// The oscillator is enabled and the chip held in reset. START and STOP
    /// are parked low.
    pub fn new(bus: B, mut pins: Pins<I, O>, clock: C) -> Result<Self, Error> {
        for (name, missing) in [
            ("ENABLE", pins.enable.is_none()),
            ("OSC_ENABLE", pins.osc_enable.is_none()),
            ("TRIG1", pins.trig1.is_none()),
            ("INT1", pins.int1.is_none()),
            ("START", pins.start.is_none()),
            ("STOP", pins.stop.is_none()),
        ] {
            if missing {
                log::warn!("{name} not assigned, feature disabled");
            }
        }
        if pins.trig2.is_some() || pins.int2.is_some() {
            log::info!("Side #2 lines assigned but unused");
        }

        drive(&mut pins.osc_enable, true)?;
        drive(&mut pins.enable, false)?;
        drive(&mut pins.start, false)?;
        drive(&mut pins.stop, false)?;

        Ok(Self {
            bus,
            pins,
            clock,
            regs: RegisterFile::default(),
            timing: Timing::default(),
            retry: RetryPolicy::default(),
            clock_period: Configuration::default().clock_period(),
            tofs: None,
        })
    }

    pub fn set_retry(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    pub fn set_timing(&mut self, timing: Timing) {
        self.timing = timing;
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Register mirror.
    pub fn registers(&self) -> &RegisterFile {
        &self.regs
    }

    /// Reference clock period in seconds.
    pub fn clock_period(&self) -> f64 {
        self.clock_period
    }

    /// Times of flight of the last successful measurement.
    pub fn tofs(&self) -> Option<&Tofs> {
        self.tofs.as_ref()
    }

    /// Drive ENABLE high and wait for the chip to settle.
    pub fn on(&mut self) -> Result<(), Error> {
        drive(&mut self.pins.enable, true)?;
        delay(&mut self.clock, self.timing.settle);
        log::info!("TDC7201 enabled");
        Ok(())
    }

    /// Drive ENABLE low. This resets all chip registers.
    pub fn off(&mut self) -> Result<(), Error> {
        drive(&mut self.pins.enable, false)?;
        delay(&mut self.clock, self.timing.reset);
        self.regs.invalidate_results();
        self.tofs = None;
        log::info!("TDC7201 disabled");
        Ok(())
    }

    fn transfer(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.bus.transfer_in_place(buf)?;
        Ok(())
    }

    pub fn write8(&mut self, addr: Addr, value: u8) -> Result<(), Error> {
        self.transfer(&mut [Instruction::frame(addr, true, false), value])?;
        self.regs.set(addr, value.into());
        Ok(())
    }

    pub fn read8(&mut self, addr: Addr) -> Result<u8, Error> {
        let mut buf = [Instruction::frame(addr, false, false), 0];
        self.transfer(&mut buf)?;
        self.regs.set(addr, buf[1].into());
        Ok(buf[1])
    }

    pub fn write16(&mut self, pair: Pair, value: u16) -> Result<(), Error> {
        let [h, l] = value.to_be_bytes();
        self.transfer(&mut [Instruction::frame(pair.high(), true, true), h, l])?;
        self.regs.set_pair(pair, value);
        Ok(())
    }

    pub fn read16(&mut self, pair: Pair) -> Result<u16, Error> {
        let mut buf = [Instruction::frame(pair.high(), false, true), 0, 0];
        self.transfer(&mut buf)?;
        let value = u16::from_be_bytes([buf[1], buf[2]]);
        self.regs.set_pair(pair, value);
        Ok(value)
    }

    pub fn read24(&mut self, addr: Addr) -> Result<u32, Error> {
        let mut buf = [Instruction::frame(addr, false, false), 0, 0, 0];
        self.transfer(&mut buf)?;
        let value = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]);
        self.regs.set(addr, value);
        Ok(value)
    }

    /// Refresh all 8-bit registers in one auto-increment transfer.
    pub fn read_regs8(&mut self) -> Result<(), Error> {
        let mut buf = [0; 1 + REG8_COUNT];
        buf[0] = Instruction::frame(Addr::Config1, false, true);
        self.transfer(&mut buf)?;
        let mut data = [0; REG8_COUNT];
        data.copy_from_slice(&buf[1..]);
        self.regs.load8(&data);
        Ok(())
    }

    /// Refresh all 24-bit registers in one auto-increment transfer.
    pub fn read_regs24(&mut self) -> Result<(), Error> {
        let mut buf = [0; 1 + 3 * REG24_COUNT];
        buf[0] = Instruction::frame(Addr::Time1, false, true);
        self.transfer(&mut buf)?;
        let mut data = [0; 3 * REG24_COUNT];
        data.copy_from_slice(&buf[1..]);
        self.regs.load24(&data);
        Ok(())
    }

    pub fn read_regs(&mut self) -> Result<(), Error> {
        self.read_regs8()?;
        self.read_regs24()
    }

    fn verify8(&mut self, addr: Addr, value: u8) -> Result<(), Error> {
        let mut attempts = 0;
        loop {
            self.write8(addr, value)?;
            let read = self.read8(addr)?;
            if read == value {
                return Ok(());
            }
            attempts += 1;
            log::warn!(
                "{} wanted {value:#04x} read {read:#04x}, attempt {attempts}",
                addr.name()
            );
            if self.retry.exhausted(attempts) {
                return Err(Error::Verify {
                    register: addr.name(),
                    wanted: value.into(),
                    read: read.into(),
                });
            }
        }
    }

    fn verify16(&mut self, pair: Pair, value: u16) -> Result<(), Error> {
        let mut attempts = 0;
        loop {
            self.write16(pair, value)?;
            let read = self.read16(pair)?;
            if read == value {
                return Ok(());
            }
            attempts += 1;
            log::warn!(
                "{} wanted {value:#06x} read {read:#06x}, attempt {attempts}",
                pair.name()
            );
            if self.retry.exhausted(attempts) {
                return Err(Error::Verify {
                    register: pair.name(),
                    wanted: value,
                    read,
                });
            }
        }
    }

    fn apply(&mut self, regs: &Registers) -> Result<(), Error> {
        self.verify8(
            Addr::Config1,
            regs.config1.with_start_meas(false).raw_value(),
        )?;
        self.verify8(Addr::Config2, regs.config2.raw_value())?;
        self.verify8(Addr::IntMask, regs.int_mask.raw_value())?;
        self.verify16(Pair::ClockCntrStopMask, regs.clock_cntr_stop_mask)?;
        self.verify16(Pair::ClockCntrOvf, regs.clock_cntr_ovf)
    }

    /// Write and verify all control registers for `cfg`.
    pub fn configure(&mut self, cfg: &Configuration) -> Result<(), Error> {
        let regs = cfg.registers()?;
        self.apply(&regs)?;
        self.clock_period = cfg.clock_period();
        log::info!(
            "Mode {}, {} stop(s), {} calibration periods, {} averaging cycles, \
             overflow {} ({:.1} us)",
            regs.config1.meas_mode().number(),
            regs.config2.num_stop().stops(),
            regs.config2.calibration2_periods().periods(),
            regs.config2.avg_cycles().cycles(),
            regs.clock_cntr_ovf,
            regs.clock_cntr_ovf as f64 * self.clock_period * 1e6,
        );
        Ok(())
    }

    /// Re-apply the mirrored control registers, e.g. after a reset.
    pub fn reconfigure(&mut self) -> Result<(), Error> {
        let regs = Registers {
            config1: self.regs.config1(),
            config2: self.regs.config2(),
            int_mask: self.regs.int_mask(),
            clock_cntr_stop_mask: self
                .regs
                .pair(Pair::ClockCntrStopMask)
                .unwrap_or_default(),
            clock_cntr_ovf: self
                .regs
                .pair(Pair::ClockCntrOvf)
                .unwrap_or(u16::MAX),
        };
        self.apply(&regs)
    }

    /// Clear the interrupt status bits.
    ///
    /// With `force` all bits are written without reading them first.
    pub fn clear_status(&mut self, force: bool) -> Result<(), Error> {
        let status = if force {
            IntStatus::ALL
        } else {
            self.read8(Addr::IntStatus)?
        };
        if status != 0 {
            self.write8(Addr::IntStatus, status)?;
            self.read8(Addr::IntStatus)?;
        }
        Ok(())
    }

    /// Set the bus clock and return the applied value.
    ///
    /// Without `force` the request is clamped to the usable range.
    pub fn set_clock_speed(
        &mut self,
        requested: u32,
        force: bool,
    ) -> Result<u32, Error> {
        let speed = if force {
            log::warn!("Forcing SPI clock to {requested} Hz");
            requested
        } else {
            config::spi_speed(requested)
        };
        self.bus.set_speed(speed)?;
        log::info!("SPI clock {speed} Hz");
        Ok(speed)
    }

    /// Time from START until the measurement overflows.
    pub fn measurement_window(&self) -> Duration {
        let ovf = self.regs.pair(Pair::ClockCntrOvf).unwrap_or(u16::MAX);
        let ns = (ovf as f64 * self.clock_period * 1e9).ceil() as u64;
        Duration::from_ticks(ns)
    }

    /// Deadline for the measurement interrupt.
    pub fn interrupt_timeout(&self) -> Duration {
        self.measurement_window() + self.timing.interrupt_margin
    }

    /// Log the register mirror.
    pub fn dump(&self) {
        for (addr, value) in self.regs.iter() {
            match value {
                Some(v) => log::info!("{:>22} {v:#08x} {v}", addr.name()),
                None => log::info!("{:>22} unknown", addr.name()),
            }
        }
        for pair in [
            Pair::CoarseCntrOvf,
            Pair::ClockCntrOvf,
            Pair::ClockCntrStopMask,
        ] {
            if let Some(v) = self.regs.pair(pair) {
                log::info!("{:>22} {v:#06x} {v}", pair.name());
            }
        }
    }

    /// Power down and release the bus, pins and clock.
    pub fn cleanup(mut self) -> Result<(B, Pins<I, O>, C), Error> {
        self.off()?;
        drive(&mut self.pins.osc_enable, false)?;
        Ok((self.bus, self.pins, self.clock))
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;

    use rand_core::{RngCore, SeedableRng};
    use rand_xorshift::XorShiftRng;

    use super::*;
    use crate::sim::SimChip;

    #[test]
    fn power_cycle() {
        let chip = RefCell::new(SimChip::default());
        let mut tdc = SimChip::driver(&chip).unwrap();
        assert!(!chip.borrow().enabled());
        tdc.on().unwrap();
        assert!(chip.borrow().enabled());
        assert!(chip.borrow().now() >= 10_000_000);
        tdc.off().unwrap();
        assert!(!chip.borrow().enabled());
    }

    #[test]
    fn round_trip() {
        let chip = RefCell::new(SimChip::default());
        let mut tdc = SimChip::driver(&chip).unwrap();
        tdc.on().unwrap();
        let mut rng = XorShiftRng::seed_from_u64(0x7dc);
        let writable: [Addr; 9] = [
            Addr::Config1,
            Addr::Config2,
            Addr::IntMask,
            Addr::CoarseCntrOvfH,
            Addr::CoarseCntrOvfL,
            Addr::ClockCntrOvfH,
            Addr::ClockCntrOvfL,
            Addr::ClockCntrStopMaskH,
            Addr::ClockCntrStopMaskL,
        ];
        for _ in 0..1000 {
            let r = rng.next_u32();
            let addr = writable[r as usize % writable.len()];
            let mut value = (r >> 8) as u8;
            if addr == Addr::Config1 {
                value &= !1;
            }
            tdc.write8(addr, value).unwrap();
            assert_eq!(tdc.read8(addr).unwrap(), value);
            assert_eq!(chip.borrow().register(addr), value as u32);
            assert_eq!(tdc.registers().get(addr), Some(value as u32));
        }
    }

    #[test]
    fn pair_composition() {
        let chip = RefCell::new(SimChip::default());
        let mut tdc = SimChip::driver(&chip).unwrap();
        tdc.on().unwrap();
        tdc.write16(Pair::ClockCntrOvf, 0x0528).unwrap();
        assert_eq!(tdc.read8(Addr::ClockCntrOvfH).unwrap(), 0x05);
        assert_eq!(tdc.read8(Addr::ClockCntrOvfL).unwrap(), 0x28);
        assert_eq!(tdc.read16(Pair::ClockCntrOvf).unwrap(), 0x0528);
        assert_eq!(tdc.registers().pair(Pair::ClockCntrOvf), Some(0x0528));

        tdc.read_regs().unwrap();
        assert_eq!(tdc.registers().pair(Pair::CoarseCntrOvf), Some(0xffff));
        assert_eq!(tdc.registers().get(Addr::Calibration2), Some(0));
    }

    #[test]
    fn configure_writes_registers() {
        let chip = RefCell::new(SimChip::default());
        let mut tdc = SimChip::driver(&chip).unwrap();
        tdc.on().unwrap();
        let cfg = Configuration {
            num_stop: 3,
            calibration_periods: 40,
            clock_cntr_stop: 0x10,
            timeout: Some(165e-6),
            ..Default::default()
        };
        tdc.configure(&cfg).unwrap();
        let c = chip.borrow();
        assert_eq!(c.register(Addr::Config1), 0x82);
        assert_eq!(c.register(Addr::Config2), 0xc2);
        assert_eq!(c.register(Addr::IntMask), 0x07);
        assert_eq!(c.register(Addr::ClockCntrStopMaskL), 0x10);
        assert_eq!(c.register(Addr::ClockCntrOvfH), 0x05);
        assert_eq!(c.register(Addr::ClockCntrOvfL), 0x28);
    }

    #[test]
    fn retry_recovers() {
        let chip = RefCell::new(SimChip::default());
        let mut tdc = SimChip::driver(&chip).unwrap();
        tdc.on().unwrap();
        chip.borrow_mut().faults.corrupt_writes = 3;
        tdc.configure(&Configuration::default()).unwrap();
        assert_eq!(chip.borrow().faults.corrupt_writes, 0);
        assert_eq!(chip.borrow().register(Addr::Config1), 0x82);
        assert_eq!(chip.borrow().register(Addr::Config2), 0x40);
    }

    #[test]
    fn retry_bounded() {
        let chip = RefCell::new(SimChip::default());
        let mut tdc = SimChip::driver(&chip).unwrap();
        tdc.on().unwrap();
        tdc.set_retry(RetryPolicy::Bounded(2));
        chip.borrow_mut().faults.corrupt_writes = 10;
        assert_eq!(
            tdc.configure(&Configuration::default()),
            Err(Error::Verify {
                register: "CONFIG1",
                wanted: 0x82,
                read: 0x02
            })
        );
        assert_eq!(chip.borrow().faults.corrupt_writes, 8);
    }

    #[test]
    fn retained_state() {
        let chip = RefCell::new(SimChip::default());
        let mut tdc = SimChip::driver(&chip).unwrap();
        tdc.on().unwrap();
        let cfg = Configuration {
            meas_mode: 1,
            num_stop: 5,
            clock_cntr_ovf: 0x20,
            ..Default::default()
        };
        tdc.configure(&cfg).unwrap();
        tdc.off().unwrap();
        tdc.on().unwrap();
        assert_eq!(chip.borrow().register(Addr::ClockCntrOvfL), 0xff);
        tdc.reconfigure().unwrap();
        assert_eq!(chip.borrow().register(Addr::Config1), 0x80);
        assert_eq!(chip.borrow().register(Addr::Config2), 0x44);
        assert_eq!(chip.borrow().register(Addr::ClockCntrOvfH), 0x00);
        assert_eq!(chip.borrow().register(Addr::ClockCntrOvfL), 0x20);
    }

    #[test]
    fn clock_speed() {
        let chip = RefCell::new(SimChip::default());
        let mut tdc = SimChip::driver(&chip).unwrap();
        assert_eq!(tdc.set_clock_speed(100, false), Ok(50_000));
        assert_eq!(chip.borrow().speed(), 50_000);
        assert_eq!(tdc.set_clock_speed(40_000_000, false), Ok(33_300_000));
        assert_eq!(tdc.set_clock_speed(40_000_000, true), Ok(40_000_000));
        assert_eq!(chip.borrow().speed(), 40_000_000);
    }

    #[test]
    fn overflow_is_fatal() {
        let chip = RefCell::new(SimChip::default());
        let mut tdc = SimChip::driver(&chip).unwrap();
        tdc.on().unwrap();
        let cfg = Configuration {
            clock_cntr_ovf: 0x1_0000,
            ..Default::default()
        };
        assert_eq!(tdc.configure(&cfg), Err(Error::Overflow(0x1_0000)));
    }

    #[test]
    fn zero_clock_frequency() {
        let chip = RefCell::new(SimChip::new(0));
        let mut tdc = SimChip::driver(&chip).unwrap();
        tdc.on().unwrap();
        let cfg = Configuration {
            clock_frequency: 0.,
            timeout: Some(165e-6),
            ..Default::default()
        };
        tdc.configure(&cfg).unwrap();
        assert_eq!(tdc.clock_period(), 125e-9);
        let window = tdc.measurement_window().ticks();
        assert!((165_000..165_002).contains(&window));
        assert_eq!(
            tdc.interrupt_timeout().ticks(),
            window + tdc.timing().interrupt_margin.ticks()
        );
    }

    #[test]
    fn release() {
        let chip = RefCell::new(SimChip::default());
        let mut tdc = SimChip::driver(&chip).unwrap();
        tdc.on().unwrap();
        let (_bus, pins, _clock) = tdc.cleanup().unwrap();
        assert!(!chip.borrow().enabled());
        assert!(pins.stop.is_some());
    }
}
