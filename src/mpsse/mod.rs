//! MPSSE (Multi-Protocol Synchronous Serial Engine) command engine.
//!
//! Every operation here requires the port to be in [`PortMode::Mpsse`].
//! Commands are batched in a [`CommandBuffer`]; [`Port::transfer`] sends a
//! batch, then reads back exactly the number of bytes the batch declared.

pub mod clock;
pub mod command;
pub mod gpio;
pub mod jtag;
pub mod spi;

pub use clock::{clock_range, compute_clock, ClockConfig};
pub use command::{align_bits_in, BitOrder, ClockEdge, CommandBuffer, ShiftConfig};

use std::time::Duration;

use crate::constants::mpsse;
use crate::error::{Error, ProtocolViolation, Result, UnsupportedConfig};
use crate::port::{check_pin_width, PinState, Port, PortMode};
use crate::transport::Transport;

/// Bulk reads attempted while waiting for the synchronisation echo.
const SYNC_ATTEMPTS: usize = 10;

impl<T: Transport> Port<T> {
    /// Put a freshly selected MPSSE into a known state and synchronise.
    pub(crate) fn init_mpsse(&mut self) -> Result<()> {
        let chip = self.chip_type();
        let mut cmd = CommandBuffer::new();
        cmd.loopback(false);
        if chip.has_adaptive_clocking() {
            cmd.adaptive(false);
        }
        if chip.has_three_phase_clocking() {
            cmd.three_phase(false);
        }
        self.execute(&cmd)?;
        self.sync_mpsse()
    }

    /// Confirm the engine is parsing commands from a clean boundary.
    ///
    /// Sends a deliberately invalid opcode and waits for the engine's
    /// bad-command reply naming it. Any bytes received before the reply
    /// are discarded.
    pub fn sync_mpsse(&mut self) -> Result<()> {
        self.require(PortMode::Mpsse)?;
        let dev = self.device_mut();
        dev.clear_buffer();
        dev.write_all(&[mpsse::SYNC_OPCODE, mpsse::SEND_IMMEDIATE])?;

        let mut seen = Vec::new();
        let mut buf = [0u8; 64];
        for _ in 0..SYNC_ATTEMPTS {
            let n = dev.read_available(&mut buf)?;
            seen.extend_from_slice(&buf[..n]);
            if let Some(pos) = seen
                .windows(2)
                .position(|w| w == [mpsse::BAD_COMMAND, mpsse::SYNC_OPCODE])
            {
                if pos > 0 {
                    log::debug!("discarded {pos} stale bytes while synchronising MPSSE");
                }
                // Keep anything after the echo out of the next exchange
                dev.clear_buffer();
                return Ok(());
            }
            if n == 0 {
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        log::warn!("MPSSE did not echo the sync opcode");
        Err(ProtocolViolation::SyncFailed.into())
    }

    /// Send a command batch that expects no response.
    pub fn execute(&mut self, cmd: &CommandBuffer) -> Result<()> {
        self.require(PortMode::Mpsse)?;
        if cmd.expected_response_len() != 0 {
            return Err(Error::InvalidArgument(
                "command batch expects a response; use transfer",
            ));
        }
        if cmd.is_empty() {
            return Ok(());
        }
        self.check_batch(cmd)?;
        self.device_mut().write_all(cmd.as_bytes())?;
        self.commit(cmd);
        Ok(())
    }

    /// Send a command batch and read back exactly its declared response.
    ///
    /// A send-immediate is appended so the engine flushes without waiting
    /// for its latency timer. If the engine returns more bytes than the
    /// batch declared (for example a bad-command reply) the exchange fails
    /// with a protocol error instead of desynchronising later reads.
    pub fn transfer(&mut self, cmd: &CommandBuffer) -> Result<Vec<u8>> {
        self.require(PortMode::Mpsse)?;
        let expected = cmd.expected_response_len();
        if expected == 0 {
            self.execute(cmd)?;
            return Ok(Vec::new());
        }
        self.check_batch(cmd)?;

        let stale = self.device().buffered();
        if stale != 0 {
            self.device_mut().clear_buffer();
            return Err(ProtocolViolation::StaleResponse(stale).into());
        }

        let mut bytes = Vec::with_capacity(cmd.len() + 1);
        bytes.extend_from_slice(cmd.as_bytes());
        bytes.push(mpsse::SEND_IMMEDIATE);

        self.device_mut().write_all(&bytes)?;
        // The engine has the batch now, whatever happens to the reply.
        self.commit(cmd);

        let dev = self.device_mut();
        let response = dev.read_exact(expected)?;

        if dev.buffered() != 0 {
            let extra = dev.take_buffered();
            log::error!(
                "MPSSE returned {} bytes beyond the {} expected: {:02x?}",
                extra.len(),
                expected,
                &extra[..extra.len().min(8)]
            );
            if let [mpsse::BAD_COMMAND, op, ..] = extra[..] {
                return Err(ProtocolViolation::BadCommand(op).into());
            }
            return Err(ProtocolViolation::ResponseLength {
                expected,
                received: expected + extra.len(),
            }
            .into());
        }
        Ok(response)
    }

    /// Reject batches that address GPIO lines the chip does not have.
    fn check_batch(&self, cmd: &CommandBuffer) -> Result<()> {
        if cmd.touches_high_pins() {
            let pins = cmd.resulting_pins(self.pins());
            check_pin_width(self.chip_type(), pins.direction)?;
        }
        Ok(())
    }

    /// Fold a batch the engine has accepted into the cached engine state.
    fn commit(&mut self, cmd: &CommandBuffer) {
        let pins = cmd.resulting_pins(self.pins());
        self.set_pins_cache(pins);
        if let Some(enable) = cmd.loopback_change() {
            self.set_loopback_cache(enable);
        }
    }

    /// Set the shift clock frequency. Returns the achieved rate.
    pub fn set_clock(&mut self, hz: u32) -> Result<u32> {
        self.require(PortMode::Mpsse)?;
        let clock = compute_clock(self.chip_type(), hz)?;

        let mut cmd = CommandBuffer::with_capacity(4);
        if let Some(div5) = clock.div5 {
            cmd.div5(div5);
        }
        cmd.set_divisor(clock.divisor);
        self.execute(&cmd)?;
        self.set_clock_cache(clock);

        log::debug!(
            "MPSSE clock {} Hz -> {} Hz (divisor {}, base {} Hz)",
            hz,
            clock.achieved,
            clock.divisor,
            clock.base_hz
        );
        Ok(clock.achieved)
    }

    /// Set direction and output level of all GPIO lines.
    ///
    /// Bits 0-7 map to the low byte, bits 8-15 to the high byte. The high
    /// byte is only written when it changes and the chip has one.
    pub fn configure_pins(&mut self, direction: u16, value: u16) -> Result<()> {
        self.require(PortMode::Mpsse)?;
        check_pin_width(self.chip_type(), direction | value)?;

        let old = self.pins();
        let new = PinState {
            direction,
            value: value & direction,
        };
        let mut cmd = CommandBuffer::with_capacity(6);
        let (lv, ld) = new.low();
        cmd.set_bits_low(lv, ld);
        if self.chip_type().mpsse_gpio_width() > 8 && new.high() != old.high() {
            let (hv, hd) = new.high();
            cmd.set_bits_high(hv, hd);
        }
        self.execute(&cmd)
    }

    /// Sample all GPIO lines (inputs and outputs).
    pub fn read_gpio(&mut self) -> Result<u16> {
        self.require(PortMode::Mpsse)?;
        let mut cmd = CommandBuffer::new();
        cmd.get_bits_low();
        let has_high = self.chip_type().mpsse_gpio_width() > 8;
        if has_high {
            cmd.get_bits_high();
        }
        let r = self.transfer(&cmd)?;
        let high = if has_high { r[1] } else { 0 };
        Ok(r[0] as u16 | (high as u16) << 8)
    }

    /// Connect DO to DI inside the chip.
    pub fn set_loopback(&mut self, enable: bool) -> Result<()> {
        let mut cmd = CommandBuffer::new();
        cmd.loopback(enable);
        self.execute(&cmd)
    }

    /// Enable or disable adaptive (RTCK) clocking.
    pub fn set_adaptive_clocking(&mut self, enable: bool) -> Result<()> {
        self.require(PortMode::Mpsse)?;
        let chip = self.chip_type();
        if !chip.has_adaptive_clocking() {
            return Err(UnsupportedConfig::Feature {
                feature: "adaptive clocking",
                chip,
            }
            .into());
        }
        let mut cmd = CommandBuffer::new();
        cmd.adaptive(enable);
        self.execute(&cmd)
    }

    /// Enable or disable 3-phase data clocking.
    pub fn set_three_phase_clocking(&mut self, enable: bool) -> Result<()> {
        self.require(PortMode::Mpsse)?;
        let chip = self.chip_type();
        if !chip.has_three_phase_clocking() {
            return Err(UnsupportedConfig::Feature {
                feature: "3-phase clocking",
                chip,
            }
            .into());
        }
        let mut cmd = CommandBuffer::new();
        cmd.three_phase(enable);
        self.execute(&cmd)
    }

    /// Full-duplex byte shift; returns one byte per byte sent.
    pub fn shift_bytes(&mut self, out: &[u8], cfg: ShiftConfig) -> Result<Vec<u8>> {
        if out.is_empty() {
            self.require(PortMode::Mpsse)?;
            return Ok(Vec::new());
        }
        let mut cmd = CommandBuffer::with_capacity(out.len() + 8);
        cmd.shift_inout(cfg, out);
        self.transfer(&cmd)
    }

    /// Clock bytes out, discarding input.
    pub fn write_bytes(&mut self, out: &[u8], cfg: ShiftConfig) -> Result<()> {
        let mut cmd = CommandBuffer::with_capacity(out.len() + 8);
        cmd.shift_out(cfg, out);
        self.execute(&cmd)
    }

    /// Clock `len` bytes in.
    pub fn read_bytes(&mut self, len: usize, cfg: ShiftConfig) -> Result<Vec<u8>> {
        let mut cmd = CommandBuffer::new();
        cmd.shift_in(cfg, len);
        self.transfer(&cmd)
    }

    /// Full-duplex shift of 1-8 bits.
    ///
    /// MSB-first output is taken from the top `count` bits of `out`,
    /// LSB-first output from the bottom. The returned bits use the same
    /// alignment, with unused bits cleared.
    pub fn shift_bits(&mut self, out: u8, count: u8, cfg: ShiftConfig) -> Result<u8> {
        let mut cmd = CommandBuffer::new();
        cmd.shift_bits(cfg, out, count, true, true)?;
        let r = self.transfer(&cmd)?;
        Ok(align_bits_in(r[0], count, cfg.bit_order))
    }

    /// Toggle the clock `cycles` times without moving data (H-type only).
    pub fn clock_cycles(&mut self, cycles: usize) -> Result<()> {
        self.require(PortMode::Mpsse)?;
        let chip = self.chip_type();
        if !chip.is_h_type() {
            return Err(UnsupportedConfig::Feature {
                feature: "clock-only commands",
                chip,
            }
            .into());
        }
        let mut cmd = CommandBuffer::new();
        let mut remaining = cycles;
        while remaining >= 8 {
            let bytes = (remaining / 8).min(command::MAX_SHIFT_BYTES);
            cmd.clock_bytes(bytes)?;
            remaining -= bytes * 8;
        }
        if remaining > 0 {
            cmd.clock_bits(remaining as u8)?;
        }
        self.execute(&cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::port::PortOptions;
    use crate::sim::SimulatedChip;
    use crate::types::{ChipType, Interface};

    fn mpsse_port(chip: ChipType) -> (Port<SimulatedChip>, SimulatedChip) {
        let sim = SimulatedChip::new(chip);
        let options = PortOptions::default()
            .with_read_timeout(Duration::from_millis(50))
            .with_mode_settle(Duration::ZERO);
        let mut port = Port::with_transport(sim.clone(), chip, Interface::A, options).unwrap();
        port.set_mode(PortMode::Mpsse, 0).unwrap();
        (port, sim)
    }

    #[test]
    fn init_disables_loopback_and_h_type_extras() {
        let (_port, sim) = mpsse_port(ChipType::Ft232H);
        let written = sim.bulk_log();
        assert!(written.starts_with(&[
            mpsse::LOOPBACK_END,
            mpsse::DIS_ADAPTIVE,
            mpsse::DIS_3_PHASE,
            mpsse::SYNC_OPCODE,
            mpsse::SEND_IMMEDIATE,
        ]));
    }

    #[test]
    fn operations_need_mpsse_mode() {
        let sim = SimulatedChip::new(ChipType::Ft232H);
        let options = PortOptions::default().with_mode_settle(Duration::ZERO);
        let mut port = Port::with_transport(sim, ChipType::Ft232H, Interface::A, options).unwrap();
        let err = port.set_clock(1_000_000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolState);
        assert!(port.shift_bytes(&[1], ShiftConfig::default()).is_err());
        assert!(port.configure_pins(0x0B, 0x08).is_err());
    }

    #[test]
    fn pin_cache_follows_sent_batch_when_reply_fails() {
        let (mut port, _sim) = mpsse_port(ChipType::Ft232H);

        let mut cmd = CommandBuffer::new();
        cmd.set_bits_low(0x08, 0x0B).loopback(true).raw(&[], 1);
        assert!(matches!(port.transfer(&cmd), Err(Error::Timeout)));
        assert_eq!(port.pins().low(), (0x08, 0x0B));
        assert!(port.loopback());

        let mut cmd = CommandBuffer::new();
        cmd.set_bits_low(0x09, 0x0B).raw(&[mpsse::GET_BITS_LOW], 2);
        assert!(matches!(
            port.transfer(&cmd),
            Err(Error::PartialRead { expected: 2, received: 1 })
        ));
        assert_eq!(port.pins().low(), (0x09, 0x0B));
    }

    #[test]
    fn set_clock_sends_prescaler_then_divisor() {
        let (mut port, sim) = mpsse_port(ChipType::Ft232H);
        sim.clear_bulk_log();
        assert_eq!(port.set_clock(10_000_000).unwrap(), 10_000_000);
        assert_eq!(
            sim.bulk_log(),
            [mpsse::DIS_DIV_5, mpsse::TCK_DIVISOR, 0x02, 0x00]
        );
        assert_eq!(port.clock().map(|c| c.divisor), Some(2));
        assert_eq!(sim.mpsse_divisor(), 2);
    }

    #[test]
    fn gpio_round_trip() {
        let (mut port, sim) = mpsse_port(ChipType::Ft2232H);
        sim.set_input_pins(0x0404);
        port.configure_pins(0x0B03, 0x0902).unwrap();
        assert_eq!(port.pins().direction, 0x0B03);
        assert_eq!(port.pins().value, 0x0902);
        // Outputs read back as driven, inputs as presented
        assert_eq!(port.read_gpio().unwrap(), 0x0902 | 0x0404);
    }

    #[test]
    fn high_byte_rejected_without_pins() {
        let (mut port, _sim) = mpsse_port(ChipType::Ft4232H);
        let err = port.configure_pins(0x0100, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedConfig);
        assert_eq!(port.read_gpio().unwrap() & 0xFF00, 0);
    }

    #[test]
    fn loopback_shift_echoes() {
        let (mut port, _sim) = mpsse_port(ChipType::Ft232H);
        port.set_loopback(true).unwrap();
        assert!(port.loopback());
        let cfg = ShiftConfig::default();
        assert_eq!(port.shift_bytes(&[0xDE, 0xAD], cfg).unwrap(), [0xDE, 0xAD]);
        assert_eq!(port.shift_bits(0b1010_0000, 3, cfg).unwrap(), 0b1010_0000);
        let lsb = cfg.with_bit_order(BitOrder::LsbFirst);
        assert_eq!(port.shift_bits(0b0000_0101, 3, lsb).unwrap(), 0b0000_0101);
    }

    #[test]
    fn read_bytes_follow_target_input() {
        let (mut port, sim) = mpsse_port(ChipType::Ft232H);
        sim.queue_input_bytes(&[0x12, 0x34], BitOrder::MsbFirst);
        let data = port.read_bytes(2, ShiftConfig::default()).unwrap();
        assert_eq!(data, [0x12, 0x34]);
    }

    #[test]
    fn bad_opcode_is_reported() {
        let (mut port, _sim) = mpsse_port(ChipType::Ft232H);
        let mut cmd = CommandBuffer::new();
        cmd.get_bits_low().raw(&[0xEE], 0);
        match port.transfer(&cmd) {
            Err(Error::ProtocolState(ProtocolViolation::BadCommand(op))) => assert_eq!(op, 0xEE),
            other => panic!("unexpected {other:?}"),
        }
        // The stream is clean again afterwards
        assert!(port.read_gpio().is_ok());
    }

    #[test]
    fn short_response_times_out() {
        let (mut port, _sim) = mpsse_port(ChipType::Ft232H);
        let mut cmd = CommandBuffer::new();
        // Claims two response bytes but only produces one
        cmd.raw(&[mpsse::GET_BITS_LOW], 2);
        match port.transfer(&cmd) {
            Err(Error::PartialRead { expected, received }) => {
                assert_eq!((expected, received), (2, 1))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn feature_gates() {
        let (mut port, _sim) = mpsse_port(ChipType::Ft2232C);
        assert!(port.set_adaptive_clocking(true).is_err());
        assert!(port.set_three_phase_clocking(true).is_err());
        assert!(port.clock_cycles(16).is_err());

        let (mut port, _sim) = mpsse_port(ChipType::Ft4232H);
        assert!(port.set_adaptive_clocking(true).is_err());
        assert!(port.set_three_phase_clocking(true).is_ok());

        let (mut port, sim) = mpsse_port(ChipType::Ft232H);
        sim.clear_bulk_log();
        port.clock_cycles(8 * 3 + 5).unwrap();
        assert_eq!(
            sim.bulk_log(),
            [mpsse::CLK_BYTES, 0x02, 0x00, mpsse::CLK_BITS, 0x04]
        );
    }
}
