//! TDC7201 register map, bit fields and the host-side register mirror.
//!
//! Each side of the chip has ten 8-bit control registers (0x00..=0x09) and
//! thirteen 24-bit result registers (0x10..=0x1C). Three adjacent H/L pairs of
//! 8-bit registers form 16-bit values.
use arbitrary_int::u6;
use bitbybit::{bitenum, bitfield};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// Physical register addresses. 0x0A..=0x0F are not addressable.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    IntoPrimitive,
    TryFromPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum Addr {
    Config1 = 0x00,
    Config2 = 0x01,
    IntStatus = 0x02,
    IntMask = 0x03,
    CoarseCntrOvfH = 0x04,
    CoarseCntrOvfL = 0x05,
    ClockCntrOvfH = 0x06,
    ClockCntrOvfL = 0x07,
    ClockCntrStopMaskH = 0x08,
    ClockCntrStopMaskL = 0x09,
    Time1 = 0x10,
    ClockCount1 = 0x11,
    Time2 = 0x12,
    ClockCount2 = 0x13,
    Time3 = 0x14,
    ClockCount3 = 0x15,
    Time4 = 0x16,
    ClockCount4 = 0x17,
    Time5 = 0x18,
    ClockCount5 = 0x19,
    Time6 = 0x1A,
    Calibration1 = 0x1B,
    Calibration2 = 0x1C,
}

impl Addr {
    pub const REG8: [Self; REG8_COUNT] = [
        Self::Config1,
        Self::Config2,
        Self::IntStatus,
        Self::IntMask,
        Self::CoarseCntrOvfH,
        Self::CoarseCntrOvfL,
        Self::ClockCntrOvfH,
        Self::ClockCntrOvfL,
        Self::ClockCntrStopMaskH,
        Self::ClockCntrStopMaskL,
    ];

    pub const REG24: [Self; REG24_COUNT] = [
        Self::Time1,
        Self::ClockCount1,
        Self::Time2,
        Self::ClockCount2,
        Self::Time3,
        Self::ClockCount3,
        Self::Time4,
        Self::ClockCount4,
        Self::Time5,
        Self::ClockCount5,
        Self::Time6,
        Self::Calibration1,
        Self::Calibration2,
    ];

    /// TIME1..=TIME6
    pub const TIME: [Self; 6] = [
        Self::Time1,
        Self::Time2,
        Self::Time3,
        Self::Time4,
        Self::Time5,
        Self::Time6,
    ];

    /// CLOCK_COUNT1..=CLOCK_COUNT5
    pub const CLOCK_COUNT: [Self; 5] = [
        Self::ClockCount1,
        Self::ClockCount2,
        Self::ClockCount3,
        Self::ClockCount4,
        Self::ClockCount5,
    ];

    pub fn is_wide(self) -> bool {
        u8::from(self) >= FIRST_REG24
    }

    /// Payload width in bytes.
    pub fn width(self) -> usize {
        if self.is_wide() {
            3
        } else {
            1
        }
    }

    /// Datasheet register name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Config1 => "CONFIG1",
            Self::Config2 => "CONFIG2",
            Self::IntStatus => "INT_STATUS",
            Self::IntMask => "INT_MASK",
            Self::CoarseCntrOvfH => "COARSE_CNTR_OVF_H",
            Self::CoarseCntrOvfL => "COARSE_CNTR_OVF_L",
            Self::ClockCntrOvfH => "CLOCK_CNTR_OVF_H",
            Self::ClockCntrOvfL => "CLOCK_CNTR_OVF_L",
            Self::ClockCntrStopMaskH => "CLOCK_CNTR_STOP_MASK_H",
            Self::ClockCntrStopMaskL => "CLOCK_CNTR_STOP_MASK_L",
            Self::Time1 => "TIME1",
            Self::ClockCount1 => "CLOCK_COUNT1",
            Self::Time2 => "TIME2",
            Self::ClockCount2 => "CLOCK_COUNT2",
            Self::Time3 => "TIME3",
            Self::ClockCount3 => "CLOCK_COUNT3",
            Self::Time4 => "TIME4",
            Self::ClockCount4 => "CLOCK_COUNT4",
            Self::Time5 => "TIME5",
            Self::ClockCount5 => "CLOCK_COUNT5",
            Self::Time6 => "TIME6",
            Self::Calibration1 => "CALIBRATION1",
            Self::Calibration2 => "CALIBRATION2",
        }
    }

    fn slot(self) -> usize {
        let a = u8::from(self);
        if a >= FIRST_REG24 {
            (a - FIRST_REG24) as usize
        } else {
            a as usize
        }
    }
}

pub const REG8_COUNT: usize = 10;
pub const REG24_COUNT: usize = 13;
const FIRST_REG24: u8 = 0x10;

/// 16-bit values spread over an H/L pair of 8-bit registers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pair {
    CoarseCntrOvf,
    ClockCntrOvf,
    ClockCntrStopMask,
}

impl Pair {
    pub fn high(self) -> Addr {
        match self {
            Self::CoarseCntrOvf => Addr::CoarseCntrOvfH,
            Self::ClockCntrOvf => Addr::ClockCntrOvfH,
            Self::ClockCntrStopMask => Addr::ClockCntrStopMaskH,
        }
    }

    pub fn low(self) -> Addr {
        match self {
            Self::CoarseCntrOvf => Addr::CoarseCntrOvfL,
            Self::ClockCntrOvf => Addr::ClockCntrOvfL,
            Self::ClockCntrStopMask => Addr::ClockCntrStopMaskL,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::CoarseCntrOvf => "COARSE_CNTR_OVF",
            Self::ClockCntrOvf => "CLOCK_CNTR_OVF",
            Self::ClockCntrStopMask => "CLOCK_CNTR_STOP_MASK",
        }
    }
}

/// First byte of every bus transfer.
#[bitfield(u8, default = 0x00)]
#[derive(Debug, PartialEq)]
pub struct Instruction {
    #[bits(0..=5, rw)]
    pub addr: u6,
    #[bit(6, rw)]
    pub write: bool,
    #[bit(7, rw)]
    pub auto_increment: bool,
}

impl Instruction {
    pub fn frame(addr: Addr, write: bool, auto_increment: bool) -> u8 {
        Self::default()
            .with_addr(u6::new(addr.into()))
            .with_write(write)
            .with_auto_increment(auto_increment)
            .raw_value()
    }
}

#[bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub enum MeasMode {
    One = 0,
    Two = 1,
    _Reserved2 = 2,
    _Reserved3 = 3,
}

impl MeasMode {
    pub fn number(&self) -> u8 {
        match self {
            Self::Two => 2,
            _ => 1,
        }
    }
}

#[bitfield(u8, default = 0x00)]
#[derive(Debug, PartialEq)]
pub struct Config1 {
    /// Start a new measurement. Cleared by the chip on completion.
    #[bit(0, rw)]
    pub start_meas: bool,
    #[bits(1..=2, rw)]
    pub meas_mode: MeasMode,
    #[bit(3, rw)]
    pub start_edge: bool,
    #[bit(4, rw)]
    pub stop_edge: bool,
    #[bit(5, rw)]
    pub trigg_edge: bool,
    #[bit(6, rw)]
    pub parity_en: bool,
    /// Calibrate even if the measurement was interrupted.
    #[bit(7, rw)]
    pub force_cal: bool,
}

#[bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub enum CalibrationPeriods {
    Two = 0,
    Ten = 1,
    Twenty = 2,
    Forty = 3,
}

impl CalibrationPeriods {
    pub fn periods(&self) -> u32 {
        match self {
            Self::Two => 2,
            Self::Ten => 10,
            Self::Twenty => 20,
            Self::Forty => 40,
        }
    }
}

#[bitenum(u3, exhaustive = true)]
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub enum AvgCycles {
    One = 0,
    Two = 1,
    Four = 2,
    Eight = 3,
    Sixteen = 4,
    ThirtyTwo = 5,
    SixtyFour = 6,
    OneTwentyEight = 7,
}

impl AvgCycles {
    pub fn cycles(&self) -> u32 {
        1 << self.raw_value().value()
    }
}

#[bitenum(u3, exhaustive = true)]
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub enum NumStop {
    One = 0,
    Two = 1,
    Three = 2,
    Four = 3,
    Five = 4,
    // The chip treats the remaining codes as a single stop.
    _One5 = 5,
    _One6 = 6,
    _One7 = 7,
}

impl NumStop {
    pub fn stops(&self) -> u8 {
        match self {
            Self::Two => 2,
            Self::Three => 3,
            Self::Four => 4,
            Self::Five => 5,
            _ => 1,
        }
    }
}

#[bitfield(u8, default = 0x40)]
#[derive(Debug, PartialEq)]
pub struct Config2 {
    #[bits(0..=2, rw)]
    pub num_stop: NumStop,
    #[bits(3..=5, rw)]
    pub avg_cycles: AvgCycles,
    #[bits(6..=7, rw)]
    pub calibration2_periods: CalibrationPeriods,
}

/// Write 1 to a bit to clear it.
#[bitfield(u8, default = 0x00)]
#[derive(Debug, PartialEq)]
pub struct IntStatus {
    #[bit(0, rw)]
    pub new_meas_int: bool,
    #[bit(1, rw)]
    pub coarse_cntr_ovf_int: bool,
    #[bit(2, rw)]
    pub clock_cntr_ovf_int: bool,
    #[bit(3, rw)]
    pub meas_started_flag: bool,
    #[bit(4, rw)]
    pub meas_complete_flag: bool,
}

impl IntStatus {
    pub const ALL: u8 = 0b0001_1111;
}

#[bitfield(u8, default = 0x07)]
#[derive(Debug, PartialEq)]
pub struct IntMask {
    #[bit(0, rw)]
    pub new_meas_mask: bool,
    #[bit(1, rw)]
    pub coarse_cntr_ovf_mask: bool,
    #[bit(2, rw)]
    pub clock_cntr_ovf_mask: bool,
}

/// Host mirror of one side's registers.
///
/// Slots start out unknown and are filled as registers are read or written.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegisterFile {
    reg8: [Option<u8>; REG8_COUNT],
    reg24: [Option<u32>; REG24_COUNT],
}

impl RegisterFile {
    pub fn get(&self, addr: Addr) -> Option<u32> {
        if addr.is_wide() {
            self.reg24[addr.slot()]
        } else {
            self.reg8[addr.slot()].map(u32::from)
        }
    }

    pub fn set(&mut self, addr: Addr, value: u32) {
        if addr.is_wide() {
            self.reg24[addr.slot()] = Some(value & 0xff_ffff);
        } else {
            self.reg8[addr.slot()] = Some(value as u8);
        }
    }

    /// Result register value, unknown slots read as zero.
    pub fn wide(&self, addr: Addr) -> u32 {
        self.get(addr).unwrap_or_default()
    }

    /// Synthesized `H << 8 | L` value of a register pair.
    pub fn pair(&self, pair: Pair) -> Option<u16> {
        let h = self.reg8[pair.high().slot()]?;
        let l = self.reg8[pair.low().slot()]?;
        Some(u16::from_be_bytes([h, l]))
    }

    pub fn set_pair(&mut self, pair: Pair, value: u16) {
        let [h, l] = value.to_be_bytes();
        self.reg8[pair.high().slot()] = Some(h);
        self.reg8[pair.low().slot()] = Some(l);
    }

    /// CONFIG1 mirror, power-on default if never accessed.
    pub fn config1(&self) -> Config1 {
        self.reg8[Addr::Config1.slot()]
            .map(Config1::new_with_raw_value)
            .unwrap_or_default()
    }

    pub fn config2(&self) -> Config2 {
        self.reg8[Addr::Config2.slot()]
            .map(Config2::new_with_raw_value)
            .unwrap_or_default()
    }

    pub fn int_mask(&self) -> IntMask {
        self.reg8[Addr::IntMask.slot()]
            .map(IntMask::new_with_raw_value)
            .unwrap_or_default()
    }

    /// Fill all 8-bit slots from a bulk read payload (echo byte removed).
    pub fn load8(&mut self, data: &[u8; REG8_COUNT]) {
        for (slot, &value) in self.reg8.iter_mut().zip(data.iter()) {
            *slot = Some(value);
        }
    }

    /// Fill all 24-bit slots from a bulk read payload (echo byte removed).
    pub fn load24(&mut self, data: &[u8; 3 * REG24_COUNT]) {
        for (slot, v) in self.reg24.iter_mut().zip(data.chunks_exact(3)) {
            *slot = Some(u32::from_be_bytes([0, v[0], v[1], v[2]]));
        }
    }

    /// Forget the result registers. The control mirror is kept so that a
    /// reset chip can be brought back to the same state.
    pub fn invalidate_results(&mut self) {
        self.reg24 = [None; REG24_COUNT];
        self.reg8[Addr::IntStatus.slot()] = None;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Addr, Option<u32>)> + '_ {
        Addr::REG8
            .iter()
            .chain(Addr::REG24.iter())
            .map(|&addr| (addr, self.get(addr)))
    }
}
