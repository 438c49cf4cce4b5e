//! MPSSE command encoding.
//!
//! A [`CommandBuffer`] accumulates opcodes for one exchange with the engine
//! and counts how many response bytes they will produce, so the reader knows
//! exactly how much to wait for.

use crate::constants::mpsse;
use crate::error::{Error, Result};
use crate::port::PinState;

/// Largest byte count a single shift opcode can carry.
pub const MAX_SHIFT_BYTES: usize = 65536;

/// Encode a transfer length for MPSSE commands (length - 1, little-endian).
///
/// `len` must be in `1..=65536`; callers split longer shifts.
#[inline]
pub(crate) fn encode_len(len: usize) -> [u8; 2] {
    debug_assert!((1..=MAX_SHIFT_BYTES).contains(&len), "MPSSE length {len}");
    let n = (len - 1) as u16;
    n.to_le_bytes()
}

/// Clock edge on which data is driven or sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockEdge {
    /// Low-to-high transition.
    Rising,
    /// High-to-low transition.
    Falling,
}

/// Bit order of a shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BitOrder {
    /// Most significant bit first.
    #[default]
    MsbFirst,
    /// Least significant bit first.
    LsbFirst,
}

/// Edge and bit-order selection for data shifts.
///
/// The four combinations of output and input edge cover every SPI mode and
/// JTAG; [`opcode`](Self::opcode) folds them into the shift opcode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShiftConfig {
    /// Edge on which DO/TDI changes.
    pub out_edge: ClockEdge,
    /// Edge on which DI/TDO is sampled.
    pub in_edge: ClockEdge,
    /// Bit order.
    pub bit_order: BitOrder,
}

impl Default for ShiftConfig {
    /// Drive on falling, sample on rising, MSB first (SPI mode 0).
    fn default() -> Self {
        Self::new(ClockEdge::Falling, ClockEdge::Rising, BitOrder::MsbFirst)
    }
}

impl ShiftConfig {
    /// Build a shift configuration.
    pub const fn new(out_edge: ClockEdge, in_edge: ClockEdge, bit_order: BitOrder) -> Self {
        Self {
            out_edge,
            in_edge,
            bit_order,
        }
    }

    /// Same edges, different bit order.
    pub const fn with_bit_order(self, bit_order: BitOrder) -> Self {
        Self { bit_order, ..self }
    }

    /// Shift opcode for the given direction and granularity.
    ///
    /// Edge flags only apply to the directions that are enabled, so a
    /// read-only shift sampling on the rising edge is plain `DO_READ`.
    pub fn opcode(self, write: bool, read: bool, bits: bool) -> u8 {
        let mut op = 0;
        if write {
            op |= mpsse::DO_WRITE;
            if self.out_edge == ClockEdge::Falling {
                op |= mpsse::WRITE_NEG;
            }
        }
        if read {
            op |= mpsse::DO_READ;
            if self.in_edge == ClockEdge::Falling {
                op |= mpsse::READ_NEG;
            }
        }
        if bits {
            op |= mpsse::BITMODE;
        }
        if self.bit_order == BitOrder::LsbFirst {
            op |= mpsse::LSB;
        }
        op
    }

    /// TMS shift opcode. TMS commands always shift LSB first.
    pub fn tms_opcode(self, read: bool) -> u8 {
        let mut op = mpsse::WRITE_TMS | mpsse::BITMODE | mpsse::LSB;
        if self.out_edge == ClockEdge::Falling {
            op |= mpsse::WRITE_NEG;
        }
        if read {
            op |= mpsse::DO_READ;
            if self.in_edge == ClockEdge::Falling {
                op |= mpsse::READ_NEG;
            }
        }
        op
    }
}

/// Align a bit-mode output value to where the engine takes its bits from.
///
/// MSB-first shifts send bits 7, 6, ...; LSB-first shifts send bits 0, 1, ...
/// Callers pass data in that alignment, so nothing to do on the way out.
/// On the way in the engine shifts bits in from the opposite end, leaving
/// MSB-first data in the low `count` bits and LSB-first data in the high
/// `count` bits. This moves it back to the output alignment and masks it.
pub fn align_bits_in(raw: u8, count: u8, order: BitOrder) -> u8 {
    let shift = 8 - count as u32;
    match order {
        BitOrder::MsbFirst => raw.wrapping_shl(shift) & (0xFFu8.wrapping_shl(shift)),
        BitOrder::LsbFirst => raw.wrapping_shr(shift) & (0xFFu8.wrapping_shr(shift)),
    }
}

/// A batch of MPSSE commands with its expected response length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandBuffer {
    bytes: Vec<u8>,
    expected: usize,
    low_pins: Option<(u8, u8)>,
    high_pins: Option<(u8, u8)>,
    loopback: Option<bool>,
}

impl CommandBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty buffer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// The encoded command bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of encoded bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing has been queued.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of bytes the engine will send back for these commands.
    pub fn expected_response_len(&self) -> usize {
        self.expected
    }

    /// Drop everything queued so far.
    pub fn clear(&mut self) {
        *self = Self {
            bytes: std::mem::take(&mut self.bytes),
            ..Self::default()
        };
        self.bytes.clear();
    }

    /// Append another buffer.
    pub fn extend(&mut self, other: &CommandBuffer) {
        self.bytes.extend_from_slice(&other.bytes);
        self.expected += other.expected;
        self.low_pins = other.low_pins.or(self.low_pins);
        self.high_pins = other.high_pins.or(self.high_pins);
        self.loopback = other.loopback.or(self.loopback);
    }

    /// Final pin state after these commands run, starting from `pins`.
    pub(crate) fn resulting_pins(&self, pins: PinState) -> PinState {
        let (mut lv, mut ld) = pins.low();
        let (mut hv, mut hd) = pins.high();
        if let Some((v, d)) = self.low_pins {
            lv = v;
            ld = d;
        }
        if let Some((v, d)) = self.high_pins {
            hv = v;
            hd = d;
        }
        PinState {
            direction: ld as u16 | (hd as u16) << 8,
            value: (lv & ld) as u16 | ((hv & hd) as u16) << 8,
        }
    }

    pub(crate) fn loopback_change(&self) -> Option<bool> {
        self.loopback
    }

    pub(crate) fn touches_high_pins(&self) -> bool {
        self.high_pins.is_some()
    }

    /// Append raw bytes that produce `response_len` bytes of response.
    pub fn raw(&mut self, bytes: &[u8], response_len: usize) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self.expected += response_len;
        self
    }

    // ---- Pins ----

    /// Drive the low GPIO byte (xDBUS0-7).
    pub fn set_bits_low(&mut self, value: u8, direction: u8) -> &mut Self {
        self.bytes
            .extend_from_slice(&[mpsse::SET_BITS_LOW, value, direction]);
        self.low_pins = Some((value, direction));
        self
    }

    /// Drive the high GPIO byte (xCBUS0-7).
    pub fn set_bits_high(&mut self, value: u8, direction: u8) -> &mut Self {
        self.bytes
            .extend_from_slice(&[mpsse::SET_BITS_HIGH, value, direction]);
        self.high_pins = Some((value, direction));
        self
    }

    /// Sample the low GPIO byte (one response byte).
    pub fn get_bits_low(&mut self) -> &mut Self {
        self.raw(&[mpsse::GET_BITS_LOW], 1)
    }

    /// Sample the high GPIO byte (one response byte).
    pub fn get_bits_high(&mut self) -> &mut Self {
        self.raw(&[mpsse::GET_BITS_HIGH], 1)
    }

    // ---- Engine configuration ----

    /// Connect DO to DI internally.
    pub fn loopback(&mut self, enable: bool) -> &mut Self {
        self.loopback = Some(enable);
        let op = if enable {
            mpsse::LOOPBACK_START
        } else {
            mpsse::LOOPBACK_END
        };
        self.raw(&[op], 0)
    }

    /// Program the clock divisor.
    pub fn set_divisor(&mut self, divisor: u16) -> &mut Self {
        let [lo, hi] = divisor.to_le_bytes();
        self.raw(&[mpsse::TCK_DIVISOR, lo, hi], 0)
    }

    /// Enable or disable the divide-by-5 prescaler (H-type only).
    pub fn div5(&mut self, enable: bool) -> &mut Self {
        let op = if enable {
            mpsse::EN_DIV_5
        } else {
            mpsse::DIS_DIV_5
        };
        self.raw(&[op], 0)
    }

    /// Enable or disable 3-phase data clocking (H-type only).
    pub fn three_phase(&mut self, enable: bool) -> &mut Self {
        let op = if enable {
            mpsse::EN_3_PHASE
        } else {
            mpsse::DIS_3_PHASE
        };
        self.raw(&[op], 0)
    }

    /// Enable or disable adaptive clocking (FT2232H / FT232H).
    pub fn adaptive(&mut self, enable: bool) -> &mut Self {
        let op = if enable {
            mpsse::EN_ADAPTIVE
        } else {
            mpsse::DIS_ADAPTIVE
        };
        self.raw(&[op], 0)
    }

    /// Ask the engine to flush its response buffer to the host now.
    pub fn send_immediate(&mut self) -> &mut Self {
        self.raw(&[mpsse::SEND_IMMEDIATE], 0)
    }

    // ---- Data shifts ----

    /// Clock bytes out without reading.
    pub fn shift_out(&mut self, cfg: ShiftConfig, data: &[u8]) -> &mut Self {
        let op = cfg.opcode(true, false, false);
        for chunk in data.chunks(MAX_SHIFT_BYTES) {
            self.bytes.push(op);
            self.bytes.extend_from_slice(&encode_len(chunk.len()));
            self.bytes.extend_from_slice(chunk);
        }
        self
    }

    /// Clock `len` bytes in without driving data.
    pub fn shift_in(&mut self, cfg: ShiftConfig, len: usize) -> &mut Self {
        let op = cfg.opcode(false, true, false);
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(MAX_SHIFT_BYTES);
            self.bytes.push(op);
            self.bytes.extend_from_slice(&encode_len(n));
            self.expected += n;
            remaining -= n;
        }
        self
    }

    /// Clock bytes out and in simultaneously; one response byte per byte sent.
    pub fn shift_inout(&mut self, cfg: ShiftConfig, data: &[u8]) -> &mut Self {
        let op = cfg.opcode(true, true, false);
        for chunk in data.chunks(MAX_SHIFT_BYTES) {
            self.bytes.push(op);
            self.bytes.extend_from_slice(&encode_len(chunk.len()));
            self.bytes.extend_from_slice(chunk);
            self.expected += chunk.len();
        }
        self
    }

    /// Shift 1-8 bits. `read` adds one response byte.
    ///
    /// With `write` false the data byte is omitted from the command.
    pub fn shift_bits(
        &mut self,
        cfg: ShiftConfig,
        data: u8,
        count: u8,
        write: bool,
        read: bool,
    ) -> Result<&mut Self> {
        if !(1..=8).contains(&count) {
            return Err(Error::InvalidArgument("bit count must be 1-8"));
        }
        if !write && !read {
            return Err(Error::InvalidArgument("shift must write, read, or both"));
        }
        self.bytes.push(cfg.opcode(write, read, true));
        self.bytes.push(count - 1);
        if write {
            self.bytes.push(data);
        }
        if read {
            self.expected += 1;
        }
        Ok(self)
    }

    /// Clock 1-7 TMS bits (LSB first) while holding TDI at `tdi`.
    pub fn clock_tms(
        &mut self,
        cfg: ShiftConfig,
        tms: u8,
        count: u8,
        tdi: bool,
        read: bool,
    ) -> Result<&mut Self> {
        if !(1..=7).contains(&count) {
            return Err(Error::InvalidArgument("TMS bit count must be 1-7"));
        }
        let data = (tms & 0x7F) | if tdi { 0x80 } else { 0 };
        self.bytes.extend_from_slice(&[cfg.tms_opcode(read), count - 1, data]);
        if read {
            self.expected += 1;
        }
        Ok(self)
    }

    /// Toggle the clock `count` (1-8) times without data (H-type only).
    pub fn clock_bits(&mut self, count: u8) -> Result<&mut Self> {
        if !(1..=8).contains(&count) {
            return Err(Error::InvalidArgument("bit count must be 1-8"));
        }
        Ok(self.raw(&[mpsse::CLK_BITS, count - 1], 0))
    }

    /// Toggle the clock `count * 8` times without data (H-type only).
    pub fn clock_bytes(&mut self, count: usize) -> Result<&mut Self> {
        if !(1..=MAX_SHIFT_BYTES).contains(&count) {
            return Err(Error::InvalidArgument("byte count must be 1-65536"));
        }
        let [lo, hi] = encode_len(count);
        Ok(self.raw(&[mpsse::CLK_BYTES, lo, hi], 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODE0: ShiftConfig = ShiftConfig::new(ClockEdge::Falling, ClockEdge::Rising, BitOrder::MsbFirst);
    const MODE1: ShiftConfig = ShiftConfig::new(ClockEdge::Rising, ClockEdge::Falling, BitOrder::MsbFirst);

    #[test]
    fn encode_len_edges() {
        assert_eq!(encode_len(1), [0x00, 0x00]);
        assert_eq!(encode_len(256), [0xFF, 0x00]);
        assert_eq!(encode_len(257), [0x00, 0x01]);
        assert_eq!(encode_len(65536), [0xFF, 0xFF]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "MPSSE length 0")]
    fn encode_len_rejects_zero() {
        encode_len(0);
    }

    #[test]
    fn clock_bytes_range_checked() {
        let mut cmd = CommandBuffer::new();
        assert!(cmd.clock_bytes(0).is_err());
        assert!(cmd.clock_bytes(MAX_SHIFT_BYTES + 1).is_err());
        assert!(cmd.is_empty());
    }

    #[test]
    fn opcodes_match_datasheet() {
        // Mode 0: write -ve, read +ve
        assert_eq!(MODE0.opcode(true, false, false), 0x11);
        assert_eq!(MODE0.opcode(false, true, false), 0x20);
        assert_eq!(MODE0.opcode(true, true, false), 0x31);
        // Mode 1: write +ve, read -ve
        assert_eq!(MODE1.opcode(true, false, false), 0x10);
        assert_eq!(MODE1.opcode(false, true, false), 0x24);
        assert_eq!(MODE1.opcode(true, true, false), 0x34);
        // JTAG-style LSB-first bit shift
        let jtag = MODE0.with_bit_order(BitOrder::LsbFirst);
        assert_eq!(jtag.opcode(true, true, false), 0x39);
        assert_eq!(jtag.opcode(true, true, true), 0x3B);
        assert_eq!(jtag.tms_opcode(false), 0x4B);
        assert_eq!(jtag.tms_opcode(true), 0x6B);
    }

    #[test]
    fn response_accounting() {
        let mut cmd = CommandBuffer::new();
        cmd.set_bits_low(0x08, 0x0B)
            .shift_out(MODE0, &[1, 2, 3])
            .shift_inout(MODE0, &[4, 5])
            .shift_in(MODE0, 7)
            .get_bits_low()
            .get_bits_high();
        cmd.shift_bits(MODE0, 0xA0, 3, true, true).unwrap();
        cmd.clock_tms(MODE0, 0x1F, 5, false, false).unwrap();
        assert_eq!(cmd.expected_response_len(), 2 + 7 + 1 + 1 + 1);

        assert_eq!(&cmd.as_bytes()[..3], &[0x80, 0x08, 0x0B]);
        assert_eq!(&cmd.as_bytes()[3..9], &[0x11, 0x02, 0x00, 1, 2, 3]);
    }

    #[test]
    fn long_shifts_are_split() {
        let data = vec![0x5A; MAX_SHIFT_BYTES + 10];
        let mut cmd = CommandBuffer::new();
        cmd.shift_inout(MODE0, &data);
        assert_eq!(cmd.expected_response_len(), data.len());
        assert_eq!(cmd.len(), data.len() + 6);
        assert_eq!(&cmd.as_bytes()[..3], &[0x31, 0xFF, 0xFF]);
        let second = 3 + MAX_SHIFT_BYTES;
        assert_eq!(&cmd.as_bytes()[second..second + 3], &[0x31, 0x09, 0x00]);

        let mut cmd = CommandBuffer::new();
        cmd.shift_in(MODE0, MAX_SHIFT_BYTES * 2);
        assert_eq!(cmd.as_bytes(), &[0x20, 0xFF, 0xFF, 0x20, 0xFF, 0xFF]);
    }

    #[test]
    fn bit_counts_validated() {
        let mut cmd = CommandBuffer::new();
        assert!(cmd.shift_bits(MODE0, 0, 0, true, false).is_err());
        assert!(cmd.shift_bits(MODE0, 0, 9, true, false).is_err());
        assert!(cmd.shift_bits(MODE0, 0, 4, false, false).is_err());
        assert!(cmd.clock_tms(MODE0, 0, 8, false, false).is_err());
        assert!(cmd.clock_bytes(0).is_err());
        assert!(cmd.is_empty());
    }

    #[test]
    fn read_only_bit_shift_has_no_data_byte() {
        let mut cmd = CommandBuffer::new();
        cmd.shift_bits(MODE0, 0xFF, 4, false, true).unwrap();
        assert_eq!(cmd.as_bytes(), &[0x22, 0x03]);
    }

    #[test]
    fn tms_carries_tdi_in_bit7() {
        let jtag = MODE0.with_bit_order(BitOrder::LsbFirst);
        let mut cmd = CommandBuffer::new();
        cmd.clock_tms(jtag, 0x01, 1, true, true).unwrap();
        assert_eq!(cmd.as_bytes(), &[0x6B, 0x00, 0x81]);
    }

    #[test]
    fn bit_alignment() {
        // 3 bits MSB-first land in the low bits
        assert_eq!(align_bits_in(0b101, 3, BitOrder::MsbFirst), 0b1010_0000);
        // 3 bits LSB-first land in the high bits
        assert_eq!(align_bits_in(0b1010_0000, 3, BitOrder::LsbFirst), 0b101);
        assert_eq!(align_bits_in(0xC3, 8, BitOrder::MsbFirst), 0xC3);
        assert_eq!(align_bits_in(0xC3, 8, BitOrder::LsbFirst), 0xC3);
    }

    #[test]
    fn pin_tracking() {
        let mut cmd = CommandBuffer::new();
        cmd.set_bits_low(0xFF, 0x0F).set_bits_low(0x09, 0x0B);
        let pins = cmd.resulting_pins(PinState {
            direction: 0x0300,
            value: 0x0100,
        });
        assert_eq!(pins.direction, 0x030B);
        assert_eq!(pins.value, 0x0109);
        assert!(!cmd.touches_high_pins());
    }

    #[test]
    fn clear_resets_accounting() {
        let mut cmd = CommandBuffer::new();
        cmd.get_bits_low().loopback(true);
        cmd.clear();
        assert!(cmd.is_empty());
        assert_eq!(cmd.expected_response_len(), 0);
        assert_eq!(cmd.loopback_change(), None);
    }
}
