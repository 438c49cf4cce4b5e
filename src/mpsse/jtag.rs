//! JTAG master on top of the MPSSE.
//!
//! # Pin Mapping
//!
//! | FTDI Pin | JTAG Signal | ADBUS Bit |
//! |----------|-------------|-----------|
//! | SK       | TCK         | 0         |
//! | DO       | TDI         | 1         |
//! | DI       | TDO         | 2         |
//! | GPIOL0   | TMS         | 3         |
//!
//! TRST# can be put on any spare pin and driven through
//! [`Port::configure_pins`] or [`GpioPin`](super::gpio::GpioPin).
//!
//! The bus tracks the TAP controller state across calls. Navigation
//! between any two states uses the shortest TMS sequence; from
//! [`TapState::Unknown`] a reset sequence is prepended.
//!
//! # Example
//!
//! ```no_run
//! use ftdi_engine::{Interface, Port, PortMode, PortOptions};
//! use ftdi_engine::mpsse::jtag::{JtagBus, JtagConfig};
//!
//! let mut port = Port::open(0x0403, 0x6010, Interface::A, PortOptions::default())?;
//! port.set_mode(PortMode::Mpsse, 0)?;
//! let mut jtag = JtagBus::new(&mut port, JtagConfig::default())?;
//! for id in jtag.scan_chain(&mut port, 8)? {
//!     println!("{id:#010x}");
//! }
//! # Ok::<(), ftdi_engine::Error>(())
//! ```

use std::collections::VecDeque;

use super::command::{align_bits_in, BitOrder, ClockEdge, CommandBuffer, ShiftConfig};
use crate::error::{Error, ProtocolViolation, Result};
use crate::port::{Port, PortMode};
use crate::transport::Transport;

/// TDI driven on falling TCK, TDO sampled on rising TCK, LSB first.
const JTAG_SHIFT: ShiftConfig =
    ShiftConfig::new(ClockEdge::Falling, ClockEdge::Rising, BitOrder::LsbFirst);

/// Low-byte direction: TCK, TDI and TMS out; TDO in.
const JTAG_DIR: u8 = 0x0B;
const JTAG_PINS: u8 = 0x0F;

/// Largest TMS burst the engine accepts in one command.
const MAX_TMS_BITS: usize = 7;

/// IEEE 1149.1 TAP controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapState {
    /// Test-Logic-Reset.
    Reset,
    /// Run-Test/Idle.
    Idle,
    /// Select-DR-Scan.
    SelectDr,
    /// Capture-DR.
    CaptureDr,
    /// Shift-DR.
    ShiftDr,
    /// Exit1-DR.
    Exit1Dr,
    /// Pause-DR.
    PauseDr,
    /// Exit2-DR.
    Exit2Dr,
    /// Update-DR.
    UpdateDr,
    /// Select-IR-Scan.
    SelectIr,
    /// Capture-IR.
    CaptureIr,
    /// Shift-IR.
    ShiftIr,
    /// Exit1-IR.
    Exit1Ir,
    /// Pause-IR.
    PauseIr,
    /// Exit2-IR.
    Exit2Ir,
    /// Update-IR.
    UpdateIr,
    /// Not known, e.g. before the first reset or after a failed exchange.
    Unknown,
}

impl TapState {
    const ALL: [TapState; 16] = [
        Self::Reset,
        Self::Idle,
        Self::SelectDr,
        Self::CaptureDr,
        Self::ShiftDr,
        Self::Exit1Dr,
        Self::PauseDr,
        Self::Exit2Dr,
        Self::UpdateDr,
        Self::SelectIr,
        Self::CaptureIr,
        Self::ShiftIr,
        Self::Exit1Ir,
        Self::PauseIr,
        Self::Exit2Ir,
        Self::UpdateIr,
    ];

    /// State after one TCK with the given TMS level.
    pub fn next(self, tms: bool) -> Self {
        use TapState::*;
        match (self, tms) {
            (Reset, true) => Reset,
            (Reset, false) => Idle,
            (Idle, true) => SelectDr,
            (Idle, false) => Idle,
            (SelectDr, true) => SelectIr,
            (SelectDr, false) => CaptureDr,
            (CaptureDr, true) => Exit1Dr,
            (CaptureDr, false) => ShiftDr,
            (ShiftDr, true) => Exit1Dr,
            (ShiftDr, false) => ShiftDr,
            (Exit1Dr, true) => UpdateDr,
            (Exit1Dr, false) => PauseDr,
            (PauseDr, true) => Exit2Dr,
            (PauseDr, false) => PauseDr,
            (Exit2Dr, true) => UpdateDr,
            (Exit2Dr, false) => ShiftDr,
            (UpdateDr, true) => SelectDr,
            (UpdateDr, false) => Idle,
            (SelectIr, true) => Reset,
            (SelectIr, false) => CaptureIr,
            (CaptureIr, true) => Exit1Ir,
            (CaptureIr, false) => ShiftIr,
            (ShiftIr, true) => Exit1Ir,
            (ShiftIr, false) => ShiftIr,
            (Exit1Ir, true) => UpdateIr,
            (Exit1Ir, false) => PauseIr,
            (PauseIr, true) => Exit2Ir,
            (PauseIr, false) => PauseIr,
            (Exit2Ir, true) => UpdateIr,
            (Exit2Ir, false) => ShiftIr,
            (UpdateIr, true) => SelectDr,
            (UpdateIr, false) => Idle,
            (Unknown, _) => Unknown,
        }
    }

    fn index(self) -> usize {
        Self::ALL.iter().position(|&s| s == self).unwrap_or(0)
    }

    /// Shortest TMS sequence from `self` to `target`.
    ///
    /// From `Unknown` the sequence starts with five TMS=1 clocks.
    pub fn path_to(self, target: TapState) -> Vec<bool> {
        let (start, mut path) = if self == Self::Unknown {
            (Self::Reset, vec![true; 5])
        } else {
            (self, Vec::new())
        };
        if target == Self::Unknown || start == target {
            return path;
        }

        // Breadth-first search over the 16 states
        let mut prev: [Option<(usize, bool)>; 16] = [None; 16];
        let mut seen = [false; 16];
        let mut queue = VecDeque::from([start]);
        seen[start.index()] = true;
        while let Some(state) = queue.pop_front() {
            if state == target {
                break;
            }
            for tms in [false, true] {
                let next = state.next(tms);
                if !seen[next.index()] {
                    seen[next.index()] = true;
                    prev[next.index()] = Some((state.index(), tms));
                    queue.push_back(next);
                }
            }
        }

        let mut tail = Vec::new();
        let mut at = target.index();
        while let Some((from, tms)) = prev[at] {
            tail.push(tms);
            at = from;
        }
        tail.reverse();
        path.extend(tail);
        path
    }

    /// Whether data can be shifted in this state.
    pub fn is_shift(self) -> bool {
        matches!(self, Self::ShiftDr | Self::ShiftIr)
    }
}

/// Settings for [`JtagBus::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JtagConfig {
    /// TCK rate in Hz.
    pub clock_hz: u32,
}

impl Default for JtagConfig {
    fn default() -> Self {
        Self {
            clock_hz: 1_000_000,
        }
    }
}

/// How the response to a queued shift is laid out.
#[derive(Debug, Clone, Copy)]
struct ShiftLayout {
    bit_count: usize,
    full_bytes: usize,
    tail_bits: usize,
    exit: bool,
}

impl ShiftLayout {
    /// Reassemble TDO into LSB-first bytes.
    fn decode(&self, response: &[u8]) -> Vec<u8> {
        let mut tdo = vec![0u8; self.bit_count.div_ceil(8)];
        tdo[..self.full_bytes].copy_from_slice(&response[..self.full_bytes]);
        let mut bit = self.full_bytes * 8;
        let mut idx = self.full_bytes;

        if self.tail_bits > 0 {
            let tail = align_bits_in(response[idx], self.tail_bits as u8, BitOrder::LsbFirst);
            for i in 0..self.tail_bits {
                if tail & (1 << i) != 0 {
                    tdo[bit / 8] |= 1 << (bit % 8);
                }
                bit += 1;
            }
            idx += 1;
        }
        if self.exit && align_bits_in(response[idx], 1, BitOrder::LsbFirst) != 0 {
            tdo[bit / 8] |= 1 << (bit % 8);
        }
        tdo
    }
}

/// A JTAG chain on an MPSSE port.
#[derive(Debug, Clone)]
pub struct JtagBus {
    clock_hz: u32,
    state: TapState,
}

impl JtagBus {
    /// Configure JTAG pins and clock.
    ///
    /// TCK, TDI and TMS are driven low; other pins keep their setting. The
    /// TAP state starts as [`TapState::Unknown`].
    pub fn new<T: Transport>(port: &mut Port<T>, config: JtagConfig) -> Result<Self> {
        port.require(PortMode::Mpsse)?;
        let clock_hz = port.set_clock(config.clock_hz)?;

        let pins = port.pins();
        let dir = (pins.direction & !(JTAG_PINS as u16)) | JTAG_DIR as u16;
        let value = pins.value & !(JTAG_PINS as u16);
        port.configure_pins(dir, value)?;

        log::debug!("JTAG at {clock_hz} Hz");
        Ok(Self {
            clock_hz,
            state: TapState::Unknown,
        })
    }

    /// Tracked TAP state.
    pub fn state(&self) -> TapState {
        self.state
    }

    /// The achieved TCK rate.
    pub fn clock_hz(&self) -> u32 {
        self.clock_hz
    }

    /// Force Test-Logic-Reset, then enter Run-Test/Idle.
    pub fn reset<T: Transport>(&mut self, port: &mut Port<T>) -> Result<()> {
        let mut cmd = CommandBuffer::new();
        self.queue_tms(&mut cmd, &[true; 5])?;
        self.queue_tms(&mut cmd, &[false])?;
        self.run(port, &cmd)
    }

    /// Move to `target` along the shortest TMS path.
    pub fn goto<T: Transport>(&mut self, port: &mut Port<T>, target: TapState) -> Result<()> {
        let mut cmd = CommandBuffer::new();
        self.queue_goto(&mut cmd, target)?;
        self.run(port, &cmd)
    }

    /// Move to Shift-IR.
    pub fn goto_shift_ir<T: Transport>(&mut self, port: &mut Port<T>) -> Result<()> {
        self.goto(port, TapState::ShiftIr)
    }

    /// Move to Shift-DR.
    pub fn goto_shift_dr<T: Transport>(&mut self, port: &mut Port<T>) -> Result<()> {
        self.goto(port, TapState::ShiftDr)
    }

    /// Move to Run-Test/Idle.
    pub fn goto_idle<T: Transport>(&mut self, port: &mut Port<T>) -> Result<()> {
        self.goto(port, TapState::Idle)
    }

    /// Clock an arbitrary TMS sequence, LSB of `tms` first.
    pub fn write_tms<T: Transport>(
        &mut self,
        port: &mut Port<T>,
        tms: u64,
        count: usize,
    ) -> Result<()> {
        if count > 64 {
            return Err(Error::InvalidArgument("at most 64 TMS bits per call"));
        }
        let bits: Vec<bool> = (0..count).map(|i| tms >> i & 1 != 0).collect();
        let mut cmd = CommandBuffer::new();
        self.queue_tms(&mut cmd, &bits)?;
        self.run(port, &cmd)
    }

    /// Spend `count` TCK cycles in Run-Test/Idle.
    pub fn idle_clocks<T: Transport>(&mut self, port: &mut Port<T>, count: usize) -> Result<()> {
        let mut cmd = CommandBuffer::new();
        self.queue_goto(&mut cmd, TapState::Idle)?;
        self.run(port, &cmd)?;
        if count == 0 {
            return Ok(());
        }
        if port.chip_type().is_h_type() {
            // TMS stays low after the last TMS command
            return port.clock_cycles(count);
        }
        let mut cmd = CommandBuffer::new();
        self.queue_tms(&mut cmd, &vec![false; count])?;
        self.run(port, &cmd)
    }

    /// Shift `bit_count` bits through the current scan register.
    ///
    /// The TAP must be in Shift-DR or Shift-IR. `tdi` is LSB first and
    /// zero-padded. With `exit` the last bit is clocked with TMS=1, leaving
    /// the TAP in Exit1. Returns TDO, LSB first.
    pub fn shift_bits<T: Transport>(
        &mut self,
        port: &mut Port<T>,
        tdi: &[u8],
        bit_count: usize,
        exit: bool,
    ) -> Result<Vec<u8>> {
        if bit_count == 0 {
            return Ok(Vec::new());
        }
        let mut cmd = CommandBuffer::new();
        let layout = self.queue_shift(&mut cmd, tdi, bit_count, exit)?;
        let response = self.exchange(port, &cmd)?;
        Ok(layout.decode(&response))
    }

    /// Load an instruction of `bits` length and return to Run-Test/Idle.
    ///
    /// Returns the bits captured from TDO during the shift.
    pub fn write_ir<T: Transport>(
        &mut self,
        port: &mut Port<T>,
        ir: &[u8],
        bits: usize,
    ) -> Result<Vec<u8>> {
        self.scan(port, TapState::ShiftIr, ir, bits)
    }

    /// Shift a data register of `bits` length and return to Run-Test/Idle.
    pub fn shift_dr<T: Transport>(
        &mut self,
        port: &mut Port<T>,
        dr: &[u8],
        bits: usize,
    ) -> Result<Vec<u8>> {
        self.scan(port, TapState::ShiftDr, dr, bits)
    }

    /// Read the IDCODEs of up to `max_devices` TAPs.
    ///
    /// After a reset every TAP selects IDCODE, or BYPASS if it has none. A
    /// stream of ones is shifted through; each device contributes a 32-bit
    /// IDCODE (bit 0 set) or a single 0 bit for BYPASS, reported as 0.
    /// The first all-ones word marks the end of the chain.
    pub fn scan_chain<T: Transport>(
        &mut self,
        port: &mut Port<T>,
        max_devices: usize,
    ) -> Result<Vec<u32>> {
        if max_devices == 0 {
            return Ok(Vec::new());
        }
        self.reset(port)?;

        let bits = 32 * (max_devices + 1);
        let ones = vec![0xFF; bits.div_ceil(8)];
        let tdo = self.shift_dr(port, &ones, bits)?;

        let bit = |i: usize| tdo[i / 8] >> (i % 8) & 1 != 0;
        let mut ids = Vec::new();
        let mut i = 0;
        while ids.len() < max_devices && i < bits {
            if !bit(i) {
                ids.push(0);
                i += 1;
                continue;
            }
            if i + 32 > bits {
                break;
            }
            let id = (0..32).fold(0u32, |acc, b| acc | (bit(i + b) as u32) << b);
            if id == u32::MAX {
                break;
            }
            ids.push(id);
            i += 32;
        }

        log::info!("JTAG chain: {} device(s) {:08x?}", ids.len(), ids);
        Ok(ids)
    }

    fn scan<T: Transport>(
        &mut self,
        port: &mut Port<T>,
        shift: TapState,
        tdi: &[u8],
        bits: usize,
    ) -> Result<Vec<u8>> {
        if bits == 0 {
            return Err(Error::InvalidArgument("scan length must be non-zero"));
        }
        let mut cmd = CommandBuffer::new();
        self.queue_goto(&mut cmd, shift)?;
        let layout = self.queue_shift(&mut cmd, tdi, bits, true)?;
        self.queue_goto(&mut cmd, TapState::Idle)?;
        let response = self.exchange(port, &cmd)?;
        Ok(layout.decode(&response))
    }

    /// Send `cmd`; on failure the TAP state is no longer known.
    fn exchange<T: Transport>(&mut self, port: &mut Port<T>, cmd: &CommandBuffer) -> Result<Vec<u8>> {
        let result = port.transfer(cmd);
        if result.is_err() {
            self.state = TapState::Unknown;
        }
        result
    }

    fn run<T: Transport>(&mut self, port: &mut Port<T>, cmd: &CommandBuffer) -> Result<()> {
        self.exchange(port, cmd).map(|_| ())
    }

    fn queue_tms(&mut self, cmd: &mut CommandBuffer, tms: &[bool]) -> Result<()> {
        for chunk in tms.chunks(MAX_TMS_BITS) {
            let bits = chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &b)| acc | (b as u8) << i);
            cmd.clock_tms(JTAG_SHIFT, bits, chunk.len() as u8, false, false)?;
        }
        // Five consecutive TMS=1 clocks reach Reset from any state
        let mut ones = 0;
        for &b in tms {
            ones = if b { ones + 1 } else { 0 };
            self.state = if ones >= 5 {
                TapState::Reset
            } else {
                self.state.next(b)
            };
        }
        Ok(())
    }

    fn queue_goto(&mut self, cmd: &mut CommandBuffer, target: TapState) -> Result<()> {
        let path = self.state.path_to(target);
        if path.is_empty() {
            return Ok(());
        }
        self.queue_tms(cmd, &path)
    }

    fn queue_shift(
        &mut self,
        cmd: &mut CommandBuffer,
        tdi: &[u8],
        bit_count: usize,
        exit: bool,
    ) -> Result<ShiftLayout> {
        if !self.state.is_shift() {
            return Err(ProtocolViolation::TapState {
                current: self.state,
            }
            .into());
        }

        let mut data = vec![0u8; bit_count.div_ceil(8)];
        let n = tdi.len().min(data.len());
        data[..n].copy_from_slice(&tdi[..n]);

        let plain_bits = if exit { bit_count - 1 } else { bit_count };
        let full_bytes = plain_bits / 8;
        let tail_bits = plain_bits % 8;

        if full_bytes > 0 {
            cmd.shift_inout(JTAG_SHIFT, &data[..full_bytes]);
        }
        if tail_bits > 0 {
            cmd.shift_bits(JTAG_SHIFT, data[full_bytes], tail_bits as u8, true, true)?;
        }
        if exit {
            let last = bit_count - 1;
            let tdi_last = data[last / 8] >> (last % 8) & 1 != 0;
            cmd.clock_tms(JTAG_SHIFT, 0x01, 1, tdi_last, true)?;
            self.state = self.state.next(true);
        }

        Ok(ShiftLayout {
            bit_count,
            full_bytes,
            tail_bits,
            exit,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::constants::mpsse;
    use crate::error::ErrorKind;
    use crate::port::PortOptions;
    use crate::sim::SimulatedChip;
    use crate::types::{ChipType, Interface};

    fn setup(chip: ChipType) -> (Port<SimulatedChip>, JtagBus, SimulatedChip) {
        let sim = SimulatedChip::new(chip);
        let options = PortOptions::default()
            .with_read_timeout(Duration::from_millis(50))
            .with_mode_settle(Duration::ZERO);
        let mut port = Port::with_transport(sim.clone(), chip, Interface::A, options).unwrap();
        port.set_mode(PortMode::Mpsse, 0).unwrap();
        let jtag = JtagBus::new(&mut port, JtagConfig::default()).unwrap();
        (port, jtag, sim)
    }

    #[test]
    fn shortest_paths() {
        use TapState::*;
        assert_eq!(Unknown.path_to(Idle), [true, true, true, true, true, false]);
        assert_eq!(Idle.path_to(ShiftDr), [true, false, false]);
        assert_eq!(Idle.path_to(ShiftIr), [true, true, false, false]);
        assert_eq!(Exit1Dr.path_to(Idle), [true, false]);
        assert_eq!(Exit1Ir.path_to(ShiftDr), [true, true, false, false]);
        assert!(Idle.path_to(Idle).is_empty());

        // Every state is reachable from every other
        for from in TapState::ALL {
            for to in TapState::ALL {
                let end = from.path_to(to).iter().fold(from, |s, &b| s.next(b));
                assert_eq!(end, to, "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn pins_and_initial_state() {
        let (port, jtag, _) = setup(ChipType::Ft232H);
        assert_eq!(jtag.state(), TapState::Unknown);
        assert_eq!(port.pins().direction & 0xFF, 0x0B);
        assert_eq!(port.pins().value & 0x0F, 0);
    }

    #[test]
    fn reset_clocks_five_ones_then_zero() {
        let (mut port, mut jtag, sim) = setup(ChipType::Ft232H);
        sim.clear_bulk_log();
        jtag.reset(&mut port).unwrap();
        assert_eq!(jtag.state(), TapState::Idle);
        assert_eq!(sim.bulk_log(), [0x4B, 0x04, 0x1F, 0x4B, 0x00, 0x00]);
    }

    #[test]
    fn shift_outside_shift_state_is_rejected() {
        let (mut port, mut jtag, _) = setup(ChipType::Ft232H);
        jtag.reset(&mut port).unwrap();
        let err = jtag.shift_bits(&mut port, &[0xFF], 8, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolState);
        assert!(matches!(
            err,
            Error::ProtocolState(ProtocolViolation::TapState {
                current: TapState::Idle
            })
        ));
    }

    #[test]
    fn loopback_dr_scan() {
        let (mut port, mut jtag, _) = setup(ChipType::Ft232H);
        port.set_loopback(true).unwrap();
        jtag.reset(&mut port).unwrap();
        let tdo = jtag.shift_dr(&mut port, &[0xA5, 0x3C, 0x0F], 20).unwrap();
        assert_eq!(tdo, [0xA5, 0x3C, 0x0F]);
        assert_eq!(jtag.state(), TapState::Idle);

        jtag.goto_shift_ir(&mut port).unwrap();
        let tdo = jtag.shift_bits(&mut port, &[0x05], 4, true).unwrap();
        assert_eq!(tdo, [0x05]);
        assert_eq!(jtag.state(), TapState::Exit1Ir);
    }

    #[test]
    fn scan_chain_reads_idcodes_and_bypass() {
        let (mut port, mut jtag, sim) = setup(ChipType::Ft2232H);
        let mut bits = Vec::new();
        let push_word = |bits: &mut Vec<bool>, w: u32| bits.extend((0..32).map(|i| w >> i & 1 != 0));
        push_word(&mut bits, 0x4BA0_0477);
        bits.push(false);
        push_word(&mut bits, 0x0643_1041);
        bits.resize(32 * 5, true);
        sim.queue_input_bits(&bits);

        let ids = jtag.scan_chain(&mut port, 4).unwrap();
        assert_eq!(ids, [0x4BA0_0477, 0, 0x0643_1041]);
        assert_eq!(jtag.state(), TapState::Idle);
    }

    #[test]
    fn long_tms_sequences_are_split() {
        let (mut port, mut jtag, sim) = setup(ChipType::Ft232H);
        jtag.reset(&mut port).unwrap();
        sim.clear_bulk_log();
        jtag.write_tms(&mut port, 0, 10).unwrap();
        assert_eq!(sim.bulk_log(), [0x4B, 0x06, 0x00, 0x4B, 0x02, 0x00]);
        assert_eq!(jtag.state(), TapState::Idle);
    }

    #[test]
    fn idle_clocks_without_clock_only_commands() {
        let (mut port, mut jtag, sim) = setup(ChipType::Ft2232C);
        jtag.reset(&mut port).unwrap();
        sim.clear_bulk_log();
        jtag.idle_clocks(&mut port, 9).unwrap();
        assert_eq!(sim.bulk_log(), [0x4B, 0x06, 0x00, 0x4B, 0x01, 0x00]);

        let (mut port, mut jtag, sim) = setup(ChipType::Ft232H);
        jtag.reset(&mut port).unwrap();
        sim.clear_bulk_log();
        jtag.idle_clocks(&mut port, 9).unwrap();
        assert_eq!(sim.bulk_log(), [mpsse::CLK_BYTES, 0x00, 0x00, mpsse::CLK_BITS, 0x00]);
    }
}
