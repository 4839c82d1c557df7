//! In-memory TDC7201 model.
//!
//! The model shares one [SimChip] between the bus, pin and clock handles
//! through a `RefCell`. Time is simulated in nanoseconds and advances with
//! bus traffic, pin access and explicit delays only.
use core::cell::RefCell;
use core::convert::Infallible;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, InputPin, OutputPin};
use embedded_hal::spi::{self, Operation, SpiDevice};
use heapless::Vec;

use crate::driver::{Pins, Tdc7201};
use crate::registers::{
    Addr, Config1, Config2, Instruction, IntMask, IntStatus, MeasMode,
    REG24_COUNT, REG8_COUNT,
};
use crate::{Error, Instant, Monotonic, RegisterBus};

/// Cost of one pin access.
const PIN_NS: u64 = 100;
/// Chip select setup and hold per transaction.
const CS_NS: u64 = 200;
/// Time digitizer resolution.
const LSB_PS: u64 = 55;

const POWER_ON: [u8; REG8_COUNT] =
    [0x00, 0x40, 0x00, 0x07, 0xff, 0xff, 0xff, 0xff, 0x00, 0x00];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Input {
    Trig1,
    Int1,
    Trig2,
    Int2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Output {
    Enable,
    OscEnable,
    Start,
    Stop,
}

/// Injected misbehavior.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Faults {
    /// Number of upcoming control register writes that store a value with
    /// the top bit flipped.
    pub corrupt_writes: u32,
    /// Measurements never complete.
    pub hang: bool,
    /// TRIG stays asserted until the next reset.
    pub wedged: bool,
    /// TRIG wedges at the next START.
    pub stuck_trigger: bool,
    /// INT asserts at the next START_MEAS.
    pub early_interrupt: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Armed,
    Running { start: u64 },
}

#[derive(Copy, Clone, Debug)]
struct Cursor {
    addr: u8,
    write: bool,
    auto_increment: bool,
    byte: u32,
}

pub struct SimChip {
    now: u64,
    enabled: bool,
    reg8: [u8; REG8_COUNT],
    reg24: [u32; REG24_COUNT],
    state: State,
    stops: Vec<u64, 5>,
    int_asserted: bool,
    outputs: [bool; 4],
    period_ps: u64,
    speed: u32,
    cursor: Option<Cursor>,
    clocked: u64,
    pub faults: Faults,
}

impl Default for SimChip {
    fn default() -> Self {
        Self::new(8_000_000)
    }
}

impl SimChip {
    /// A chip in reset with the given reference clock in Hz.
    pub fn new(clock_frequency: u32) -> Self {
        Self {
            now: 0,
            enabled: false,
            reg8: POWER_ON,
            reg24: [0; REG24_COUNT],
            state: State::Idle,
            stops: Vec::new(),
            int_asserted: false,
            outputs: [false; 4],
            period_ps: 1_000_000_000_000 / clock_frequency.max(1) as u64,
            speed: 1_000_000,
            cursor: None,
            clocked: 0,
            faults: Faults::default(),
        }
    }

    /// Hand out a bus, the pins and a clock, all backed by `cell`.
    pub fn split(
        cell: &RefCell<Self>,
    ) -> (SimBus<'_>, Pins<SimInput<'_>, SimOutput<'_>>, SimClock<'_>) {
        let input = |line| Some(SimInput { chip: cell, line });
        let output = |line| Some(SimOutput { chip: cell, line });
        let pins = Pins {
            enable: output(Output::Enable),
            osc_enable: output(Output::OscEnable),
            trig1: input(Input::Trig1),
            int1: input(Input::Int1),
            trig2: input(Input::Trig2),
            int2: input(Input::Int2),
            start: output(Output::Start),
            stop: output(Output::Stop),
        };
        (SimBus { chip: cell }, pins, SimClock { chip: cell })
    }

    /// A driver with all pins assigned.
    pub fn driver(cell: &RefCell<Self>) -> Result<SimTdc7201<'_>, Error> {
        let (bus, pins, clock) = Self::split(cell);
        Tdc7201::new(bus, pins, clock)
    }

    /// Simulated time in ns.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Waiting for START.
    pub fn armed(&self) -> bool {
        self.state == State::Armed
    }

    /// Bus clock in Hz.
    pub fn speed(&self) -> u32 {
        self.speed
    }

    pub fn register(&self, addr: Addr) -> u32 {
        let a = u8::from(addr);
        if addr.is_wide() {
            self.reg24[(a - 0x10) as usize]
        } else {
            self.reg8[a as usize] as u32
        }
    }

    fn set24(&mut self, addr: Addr, value: u32) {
        self.reg24[(u8::from(addr) - 0x10) as usize] = value & 0xff_ffff;
    }

    fn config1(&self) -> Config1 {
        Config1::new_with_raw_value(self.reg8[Addr::Config1 as usize])
    }

    fn config2(&self) -> Config2 {
        Config2::new_with_raw_value(self.reg8[Addr::Config2 as usize])
    }

    fn pair(&self, high: Addr) -> u64 {
        let h = high as usize;
        u16::from_be_bytes([self.reg8[h], self.reg8[h + 1]]) as u64
    }

    fn reset(&mut self) {
        self.reg8 = POWER_ON;
        self.reg24 = [0; REG24_COUNT];
        self.state = State::Idle;
        self.stops.clear();
        self.int_asserted = false;
        self.faults.wedged = false;
        self.faults.stuck_trigger = false;
    }

    fn advance(&mut self, ns: u64) {
        self.now += ns;
        if let State::Running { start } = self.state {
            let ovf_ns =
                self.pair(Addr::ClockCntrOvfH) * self.period_ps / 1000;
            if self.now >= start + ovf_ns {
                self.finish(start, true);
            }
        }
    }

    fn counts(ps: u64) -> u32 {
        ((ps + LSB_PS / 2) / LSB_PS) as u32
    }

    /// First reference clock edge strictly after `ps`.
    fn next_edge(&self, ps: u64) -> u64 {
        (ps / self.period_ps + 1) * self.period_ps
    }

    fn finish(&mut self, start: u64, overflow: bool) {
        if self.faults.hang {
            return;
        }
        let config1 = self.config1();
        let config2 = self.config2();
        self.reg24 = [0; REG24_COUNT];

        if !overflow || config1.force_cal() {
            let periods = config2.calibration2_periods().periods() as u64;
            self.set24(Addr::Calibration1, Self::counts(self.period_ps));
            self.set24(
                Addr::Calibration2,
                Self::counts(self.period_ps * periods),
            );
        }

        let start_ps = start * 1000;
        let stops = self.stops.clone();
        match config1.meas_mode() {
            MeasMode::Two => {
                let avg = config2.avg_cycles().cycles();
                let a = self.next_edge(start_ps);
                self.set24(Addr::Time1, Self::counts(a - start_ps));
                for (i, &stop) in stops.iter().enumerate() {
                    let stop_ps = stop * 1000;
                    let b = self.next_edge(stop_ps);
                    self.set24(Addr::TIME[i + 1], Self::counts(b - stop_ps));
                    let count = ((b - a) / self.period_ps) as u32 * avg;
                    self.set24(Addr::CLOCK_COUNT[i], count);
                }
            }
            _ => {
                for (i, &stop) in stops.iter().enumerate() {
                    let tof_ps = (stop - start) * 1000;
                    self.set24(Addr::TIME[i], Self::counts(tof_ps));
                }
            }
        }

        let mut status = self
            .int_status()
            .with_new_meas_int(true)
            .with_meas_complete_flag(true);
        if overflow {
            status = status.with_clock_cntr_ovf_int(true);
        }
        self.reg8[Addr::IntStatus as usize] = status.raw_value();
        self.reg8[Addr::Config1 as usize] =
            config1.with_start_meas(false).raw_value();

        let mask =
            IntMask::new_with_raw_value(self.reg8[Addr::IntMask as usize]);
        self.int_asserted = mask.new_meas_mask()
            || (overflow && mask.clock_cntr_ovf_mask());
        self.state = State::Idle;
    }

    fn int_status(&self) -> IntStatus {
        IntStatus::new_with_raw_value(self.reg8[Addr::IntStatus as usize])
    }

    fn write8(&mut self, addr: u8, value: u8) {
        let Ok(addr) = Addr::try_from(addr) else {
            return;
        };
        let value = if self.faults.corrupt_writes > 0 && addr != Addr::IntStatus {
            self.faults.corrupt_writes -= 1;
            value ^ 0x80
        } else {
            value
        };
        match addr {
            Addr::IntStatus => {
                let status = &mut self.reg8[Addr::IntStatus as usize];
                *status &= !value;
                if *status & 0b111 == 0 {
                    self.int_asserted = false;
                }
            }
            Addr::Config1 => {
                self.reg8[Addr::Config1 as usize] = value;
                if Config1::new_with_raw_value(value).start_meas() {
                    self.reg24 = [0; REG24_COUNT];
                    self.stops.clear();
                    self.state = State::Armed;
                    if self.faults.early_interrupt {
                        self.faults.early_interrupt = false;
                        let status = self.int_status().with_new_meas_int(true);
                        self.reg8[Addr::IntStatus as usize] = status.raw_value();
                        self.int_asserted = true;
                    }
                }
            }
            addr if !addr.is_wide() => self.reg8[addr as usize] = value,
            _ => {}
        }
    }

    fn read(&mut self, cursor: &mut Cursor) -> u8 {
        let value = match Addr::try_from(cursor.addr) {
            Ok(addr) if addr.is_wide() => {
                let shift = 8 * (2 - cursor.byte);
                cursor.byte += 1;
                (self.register(addr) >> shift) as u8
            }
            Ok(addr) => self.reg8[addr as usize],
            Err(_) => 0,
        };
        if cursor.byte == 0 || cursor.byte == 3 {
            cursor.byte = 0;
            if cursor.auto_increment {
                cursor.addr += 1;
            }
        }
        value
    }

    /// Clock one byte through the shift register.
    fn exchange(&mut self, mosi: u8) -> u8 {
        self.clocked += 1;
        let Some(mut cursor) = self.cursor else {
            let instruction = Instruction::new_with_raw_value(mosi);
            self.cursor = Some(Cursor {
                addr: instruction.addr().value(),
                write: instruction.write(),
                auto_increment: instruction.auto_increment(),
                byte: 0,
            });
            return 0;
        };
        if !self.enabled {
            return 0;
        }
        let miso = if cursor.write {
            self.write8(cursor.addr, mosi);
            if cursor.auto_increment {
                cursor.addr += 1;
            }
            0
        } else {
            self.read(&mut cursor)
        };
        self.cursor = Some(cursor);
        miso
    }

    fn input(&mut self, line: Input) -> bool {
        self.advance(PIN_NS);
        match line {
            Input::Trig1 => {
                let active = self.enabled
                    && (self.state == State::Armed || self.faults.wedged);
                // TRIGG_EDGE set means TRIG idles high.
                self.enabled && (active != self.config1().trigg_edge())
            }
            Input::Int1 => !(self.enabled && self.int_asserted),
            Input::Trig2 => false,
            Input::Int2 => true,
        }
    }

    fn output(&mut self, line: Output, level: bool) {
        self.advance(PIN_NS);
        let previous = core::mem::replace(&mut self.outputs[line as usize], level);
        let asserted = |falling: bool| previous != level && level != falling;
        match line {
            Output::Enable => {
                if previous != level {
                    self.reset();
                }
                self.enabled = level;
            }
            Output::OscEnable => {}
            Output::Start => {
                if asserted(self.config1().start_edge()) && self.state == State::Armed {
                    self.state = State::Running { start: self.now };
                    if self.faults.stuck_trigger {
                        self.faults.wedged = true;
                    }
                    let status = self.int_status().with_meas_started_flag(true);
                    self.reg8[Addr::IntStatus as usize] = status.raw_value();
                }
            }
            Output::Stop => {
                let State::Running { start } = self.state else {
                    return;
                };
                if !asserted(self.config1().stop_edge()) {
                    return;
                }
                let mask_ns =
                    self.pair(Addr::ClockCntrStopMaskH) * self.period_ps / 1000;
                let wanted = self.config2().num_stop().stops() as usize;
                if self.now >= start + mask_ns && self.stops.len() < wanted {
                    self.stops.push(self.now).ok();
                    if self.stops.len() == wanted {
                        self.finish(start, false);
                    }
                }
            }
        }
    }
}

pub type SimTdc7201<'a> =
    Tdc7201<SimBus<'a>, SimInput<'a>, SimOutput<'a>, SimClock<'a>>;

pub struct SimBus<'a> {
    chip: &'a RefCell<SimChip>,
}

impl spi::ErrorType for SimBus<'_> {
    type Error = Infallible;
}

impl SpiDevice<u8> for SimBus<'_> {
    fn transaction(
        &mut self,
        operations: &mut [Operation<'_, u8>],
    ) -> Result<(), Self::Error> {
        let mut chip = self.chip.borrow_mut();
        chip.cursor = None;
        chip.clocked = 0;
        for op in operations.iter_mut() {
            match op {
                Operation::Read(buf) => {
                    for b in buf.iter_mut() {
                        *b = chip.exchange(0);
                    }
                }
                Operation::Write(buf) => {
                    for &b in buf.iter() {
                        chip.exchange(b);
                    }
                }
                Operation::Transfer(read, write) => {
                    for i in 0..read.len().max(write.len()) {
                        let miso = chip.exchange(write.get(i).copied().unwrap_or(0));
                        if let Some(r) = read.get_mut(i) {
                            *r = miso;
                        }
                    }
                }
                Operation::TransferInPlace(buf) => {
                    for b in buf.iter_mut() {
                        *b = chip.exchange(*b);
                    }
                }
                Operation::DelayNs(ns) => chip.advance(*ns as u64),
            }
        }
        chip.cursor = None;
        let ns = chip.clocked * 8 * 1_000_000_000 / chip.speed as u64;
        chip.advance(ns + CS_NS);
        Ok(())
    }
}

impl RegisterBus for SimBus<'_> {
    fn set_speed(&mut self, hz: u32) -> Result<(), Self::Error> {
        self.chip.borrow_mut().speed = hz.max(1);
        Ok(())
    }
}

pub struct SimInput<'a> {
    chip: &'a RefCell<SimChip>,
    line: Input,
}

impl digital::ErrorType for SimInput<'_> {
    type Error = Infallible;
}

impl InputPin for SimInput<'_> {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.chip.borrow_mut().input(self.line))
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.is_high()?)
    }
}

pub struct SimOutput<'a> {
    chip: &'a RefCell<SimChip>,
    line: Output,
}

impl digital::ErrorType for SimOutput<'_> {
    type Error = Infallible;
}

impl OutputPin for SimOutput<'_> {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.chip.borrow_mut().output(self.line, false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.chip.borrow_mut().output(self.line, true);
        Ok(())
    }
}

pub struct SimClock<'a> {
    chip: &'a RefCell<SimChip>,
}

impl Monotonic for SimClock<'_> {
    fn now(&mut self) -> Instant {
        Instant::from_ticks(self.chip.borrow().now)
    }
}

impl DelayNs for SimClock<'_> {
    fn delay_ns(&mut self, ns: u32) {
        self.chip.borrow_mut().advance(ns as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(chip: &RefCell<SimChip>, buf: &mut [u8]) {
        SimChip::split(chip).0.transfer_in_place(buf).unwrap();
    }

    #[test]
    fn reset_defaults() {
        let chip = RefCell::new(SimChip::default());
        let (_, mut pins, _) = SimChip::split(&chip);
        let enable = pins.enable.as_mut().unwrap();
        enable.set_high().unwrap();

        let mut buf = [0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        frame(&chip, &mut buf);
        assert_eq!(buf[1..], POWER_ON);

        frame(&chip, &mut [0x48, 0x12]);
        assert_eq!(chip.borrow().register(Addr::ClockCntrStopMaskH), 0x12);
        enable.set_low().unwrap();
        enable.set_high().unwrap();
        assert_eq!(chip.borrow().register(Addr::ClockCntrStopMaskH), 0x00);
    }

    #[test]
    fn disabled_chip_is_silent() {
        let chip = RefCell::new(SimChip::default());
        let mut buf = [0x01, 0];
        frame(&chip, &mut buf);
        assert_eq!(buf, [0, 0]);
    }

    #[test]
    fn mode1_results() {
        let chip = RefCell::new(SimChip::default());
        let (_, mut pins, _) = SimChip::split(&chip);
        pins.enable.as_mut().unwrap().set_high().unwrap();
        // Mode 1, one stop, two calibration periods.
        frame(&chip, &mut [0x41, 0x00]);
        frame(&chip, &mut [0x40, 0x01]);
        let start = pins.start.as_mut().unwrap();
        start.set_high().unwrap();
        start.set_low().unwrap();
        let stop = pins.stop.as_mut().unwrap();
        stop.set_high().unwrap();

        let c = chip.borrow();
        assert_eq!(c.register(Addr::Config1), 0x00);
        assert_eq!(c.register(Addr::IntStatus) & 0b1_0001, 0b1_0001);
        // START at its rising edge, STOP two pin writes later.
        assert_eq!(c.register(Addr::Time1), SimChip::counts(2 * PIN_NS * 1000));
        assert_eq!(c.register(Addr::Calibration1), 2273);
        assert_eq!(c.register(Addr::Calibration2), 4545);
        drop(c);
        assert!(!pins.int1.as_mut().unwrap().is_high().unwrap());

        frame(&chip, &mut [0x42, 0x1f]);
        assert!(pins.int1.as_mut().unwrap().is_high().unwrap());
    }
}
