//! SPI master on top of the MPSSE.
//!
//! Supports the four CPOL/CPHA modes, either bit order, and an optional
//! chip-select line on the low GPIO byte.
//!
//! # Pin Mapping
//!
//! | FTDI Pin | SPI Signal | ADBUS Bit |
//! |----------|-----------|-----------|
//! | SK       | SCLK      | 0         |
//! | DO       | MOSI      | 1         |
//! | DI       | MISO      | 2         |
//! | CS#      | CS (user) | 3-7       |
//!
//! # Example
//!
//! ```no_run
//! use ftdi_engine::{Interface, Port, PortMode, PortOptions};
//! use ftdi_engine::mpsse::spi::{SpiBus, SpiConfig, SpiMode};
//!
//! let mut port = Port::open(0x0403, 0x6014, Interface::A, PortOptions::default())?;
//! port.set_mode(PortMode::Mpsse, 0)?;
//! let spi = SpiBus::new(&mut port, SpiConfig::new(SpiMode::Mode0, 1_000_000))?;
//!
//! // JEDEC ID
//! let id = spi.write_read(&mut port, &[0x9F], 3)?;
//! # Ok::<(), ftdi_engine::Error>(())
//! ```

use super::command::{align_bits_in, BitOrder, ClockEdge, CommandBuffer, ShiftConfig};
use crate::error::{Error, Result};
use crate::port::{PinState, Port, PortMode};
use crate::transport::Transport;

const SK: u8 = 0x01;
const DO: u8 = 0x02;
const DI: u8 = 0x04;

/// SPI clock polarity and phase mode.
///
/// | Mode | CPOL | CPHA | Description |
/// |------|------|------|-------------|
/// | 0    | 0    | 0    | Clock idle low, sample on rising edge |
/// | 1    | 0    | 1    | Clock idle low, sample on falling edge |
/// | 2    | 1    | 0    | Clock idle high, sample on falling edge |
/// | 3    | 1    | 1    | Clock idle high, sample on rising edge |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SpiMode {
    /// CPOL=0, CPHA=0.
    #[default]
    Mode0,
    /// CPOL=0, CPHA=1.
    Mode1,
    /// CPOL=1, CPHA=0.
    Mode2,
    /// CPOL=1, CPHA=1.
    Mode3,
}

impl SpiMode {
    /// Clock polarity: true = idle high.
    pub fn cpol(self) -> bool {
        matches!(self, Self::Mode2 | Self::Mode3)
    }

    /// Clock phase: true = sample on second edge.
    pub fn cpha(self) -> bool {
        matches!(self, Self::Mode1 | Self::Mode3)
    }

    /// Shift edges for this mode.
    ///
    /// Edge names are physical. With CPOL=1 the leading edge is falling, so
    /// modes 0 and 3 both sample on rising SK and modes 1 and 2 both
    /// sample on falling SK.
    pub fn shift_config(self, bit_order: BitOrder) -> ShiftConfig {
        match self {
            Self::Mode0 | Self::Mode3 => {
                ShiftConfig::new(ClockEdge::Falling, ClockEdge::Rising, bit_order)
            }
            Self::Mode1 | Self::Mode2 => {
                ShiftConfig::new(ClockEdge::Rising, ClockEdge::Falling, bit_order)
            }
        }
    }
}

/// Settings for [`SpiBus::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiConfig {
    /// Clock polarity and phase.
    pub mode: SpiMode,
    /// Bit order of every shift.
    pub bit_order: BitOrder,
    /// Chip-select bit in the low GPIO byte; 0 manages CS externally.
    pub cs_pin: u8,
    /// CS polarity.
    pub cs_active_low: bool,
    /// SCLK rate in Hz.
    pub clock_hz: u32,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self::new(SpiMode::Mode0, 1_000_000)
    }
}

impl SpiConfig {
    /// MSB-first, active-low CS on ADBUS3.
    pub fn new(mode: SpiMode, clock_hz: u32) -> Self {
        Self {
            mode,
            bit_order: BitOrder::MsbFirst,
            cs_pin: 0x08,
            cs_active_low: true,
            clock_hz,
        }
    }

    /// Use a different CS pin and polarity.
    pub fn with_cs(mut self, cs_pin: u8, active_low: bool) -> Self {
        self.cs_pin = cs_pin;
        self.cs_active_low = active_low;
        self
    }

    /// Use a different bit order.
    pub fn with_bit_order(mut self, bit_order: BitOrder) -> Self {
        self.bit_order = bit_order;
        self
    }
}

/// An SPI bus configured on a port.
///
/// The bus holds no reference to the port; every call takes it explicitly,
/// so GPIO on the spare pins can be driven in between.
#[derive(Debug, Clone)]
pub struct SpiBus {
    config: SpiConfig,
    shift: ShiftConfig,
    /// Clock achieved by the engine.
    clock_hz: u32,
}

impl SpiBus {
    /// Configure SPI on an MPSSE port.
    ///
    /// Programs the clock, drives SK to its idle level and deasserts CS.
    /// Direction and level of the other pins are preserved.
    pub fn new<T: Transport>(port: &mut Port<T>, config: SpiConfig) -> Result<Self> {
        port.require(PortMode::Mpsse)?;
        if config.cs_pin & (SK | DO | DI) != 0 {
            return Err(Error::InvalidArgument("CS cannot share a pin with SK, DO or DI"));
        }
        let clock_hz = port.set_clock(config.clock_hz)?;

        let pins = port.pins();
        let (idle_value, dir_mask) = idle_low(config, pins);
        port.configure_pins(
            (pins.direction & 0xFF00) | dir_mask as u16,
            (pins.value & 0xFF00) | idle_value as u16,
        )?;

        log::debug!(
            "SPI {:?} at {} Hz, CS mask {:#04x}",
            config.mode,
            clock_hz,
            config.cs_pin
        );

        Ok(Self {
            config,
            shift: config.mode.shift_config(config.bit_order),
            clock_hz,
        })
    }

    /// The bus configuration.
    pub fn config(&self) -> SpiConfig {
        self.config
    }

    /// The achieved SCLK rate.
    pub fn clock_hz(&self) -> u32 {
        self.clock_hz
    }

    /// Shift configuration used for data.
    pub fn shift_config(&self) -> ShiftConfig {
        self.shift
    }

    /// Full-duplex transfer with CS held for the whole exchange.
    pub fn transfer<T: Transport>(&self, port: &mut Port<T>, tx: &[u8]) -> Result<Vec<u8>> {
        if tx.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = CommandBuffer::with_capacity(tx.len() + 16);
        self.queue_cs_assert(port.pins(), &mut cmd);
        cmd.shift_inout(self.shift, tx);
        self.queue_cs_deassert(port.pins(), &mut cmd);
        port.transfer(&cmd)
    }

    /// Write-only transfer.
    pub fn write<T: Transport>(&self, port: &mut Port<T>, tx: &[u8]) -> Result<()> {
        if tx.is_empty() {
            return Ok(());
        }
        let mut cmd = CommandBuffer::with_capacity(tx.len() + 16);
        self.queue_cs_assert(port.pins(), &mut cmd);
        cmd.shift_out(self.shift, tx);
        self.queue_cs_deassert(port.pins(), &mut cmd);
        port.execute(&cmd)
    }

    /// Read-only transfer. MOSI is not driven.
    pub fn read<T: Transport>(&self, port: &mut Port<T>, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut cmd = CommandBuffer::new();
        self.queue_cs_assert(port.pins(), &mut cmd);
        cmd.shift_in(self.shift, len);
        self.queue_cs_deassert(port.pins(), &mut cmd);
        port.transfer(&cmd)
    }

    /// Write `tx` then read `read_len` bytes under one CS assertion.
    pub fn write_read<T: Transport>(
        &self,
        port: &mut Port<T>,
        tx: &[u8],
        read_len: usize,
    ) -> Result<Vec<u8>> {
        if read_len == 0 {
            return self.write(port, tx).map(|()| Vec::new());
        }
        let mut cmd = CommandBuffer::with_capacity(tx.len() + 16);
        self.queue_cs_assert(port.pins(), &mut cmd);
        if !tx.is_empty() {
            cmd.shift_out(self.shift, tx);
        }
        cmd.shift_in(self.shift, read_len);
        self.queue_cs_deassert(port.pins(), &mut cmd);
        port.transfer(&cmd)
    }

    /// Full-duplex transfer of 1-8 bits.
    ///
    /// Uses the same alignment as [`Port::shift_bits`]: MSB-first data sits
    /// in the top bits, LSB-first data in the bottom bits.
    pub fn transfer_bits<T: Transport>(
        &self,
        port: &mut Port<T>,
        out: u8,
        count: u8,
    ) -> Result<u8> {
        let mut cmd = CommandBuffer::new();
        self.queue_cs_assert(port.pins(), &mut cmd);
        cmd.shift_bits(self.shift, out, count, true, true)?;
        self.queue_cs_deassert(port.pins(), &mut cmd);
        let r = port.transfer(&cmd)?;
        Ok(align_bits_in(r[0], count, self.shift.bit_order))
    }

    /// Assert CS and leave it asserted.
    pub fn cs_assert<T: Transport>(&self, port: &mut Port<T>) -> Result<()> {
        let mut cmd = CommandBuffer::new();
        self.queue_cs_assert(port.pins(), &mut cmd);
        port.execute(&cmd)
    }

    /// Return CS and SK to idle.
    pub fn cs_deassert<T: Transport>(&self, port: &mut Port<T>) -> Result<()> {
        let mut cmd = CommandBuffer::new();
        self.queue_cs_deassert(port.pins(), &mut cmd);
        port.execute(&cmd)
    }

    /// Queue CS assertion on top of the current low-byte pin state.
    pub(crate) fn queue_cs_assert(&self, pins: PinState, cmd: &mut CommandBuffer) {
        if self.config.cs_pin == 0 {
            return;
        }
        let (idle, dir) = idle_low(self.config, pins);
        let value = if self.config.cs_active_low {
            idle & !self.config.cs_pin
        } else {
            idle | self.config.cs_pin
        };
        cmd.set_bits_low(value, dir);
    }

    pub(crate) fn queue_cs_deassert(&self, pins: PinState, cmd: &mut CommandBuffer) {
        if self.config.cs_pin == 0 {
            return;
        }
        let (idle, dir) = idle_low(self.config, pins);
        cmd.set_bits_low(idle, dir);
    }
}

/// Low-byte value and direction with CS deasserted and SK idle.
///
/// Pins outside the bus keep whatever level and direction `pins` holds.
fn idle_low(config: SpiConfig, pins: PinState) -> (u8, u8) {
    let (value, dir) = pins.low();
    let spi_pins = SK | DO | DI | config.cs_pin;
    let cs_idle = if config.cs_active_low { config.cs_pin } else { 0 };
    let clk_idle = if config.mode.cpol() { SK } else { 0 };
    (
        (value & !spi_pins) | clk_idle | cs_idle,
        (dir & !spi_pins) | SK | DO | config.cs_pin,
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::constants::mpsse;
    use crate::port::PortOptions;
    use crate::sim::SimulatedChip;
    use crate::types::{ChipType, Interface};

    fn setup(config: SpiConfig) -> (Port<SimulatedChip>, SpiBus, SimulatedChip) {
        let sim = SimulatedChip::new(ChipType::Ft232H);
        let options = PortOptions::default()
            .with_read_timeout(Duration::from_millis(50))
            .with_mode_settle(Duration::ZERO);
        let mut port =
            Port::with_transport(sim.clone(), ChipType::Ft232H, Interface::A, options).unwrap();
        port.set_mode(PortMode::Mpsse, 0).unwrap();
        let spi = SpiBus::new(&mut port, config).unwrap();
        (port, spi, sim)
    }

    #[test]
    fn mode_edges() {
        let fr = (ClockEdge::Falling, ClockEdge::Rising);
        let rf = (ClockEdge::Rising, ClockEdge::Falling);
        for (mode, edges) in [
            (SpiMode::Mode0, fr),
            (SpiMode::Mode1, rf),
            (SpiMode::Mode2, rf),
            (SpiMode::Mode3, fr),
        ] {
            let cfg = mode.shift_config(BitOrder::MsbFirst);
            assert_eq!((cfg.out_edge, cfg.in_edge), edges, "{mode:?}");
        }
    }

    #[test]
    fn idle_levels_follow_cpol() {
        let (port, _, _) = setup(SpiConfig::new(SpiMode::Mode0, 1_000_000));
        assert_eq!(port.pins().value & 0xFF, 0x08);
        assert_eq!(port.pins().direction & 0xFF, 0x0B);

        let (port, _, _) = setup(SpiConfig::new(SpiMode::Mode2, 1_000_000).with_cs(0x10, false));
        assert_eq!(port.pins().value & 0xFF, 0x01);
        assert_eq!(port.pins().direction & 0xFF, 0x13);
    }

    #[test]
    fn transfer_wraps_data_in_cs() {
        let (mut port, spi, sim) = setup(SpiConfig::new(SpiMode::Mode0, 1_000_000));
        sim.clear_bulk_log();
        sim.queue_input_bytes(&[0xEF, 0x40, 0x18], BitOrder::MsbFirst);
        let id = spi.transfer(&mut port, &[0x9F, 0, 0]).unwrap();
        assert_eq!(id, [0xEF, 0x40, 0x18]);
        assert_eq!(
            sim.bulk_log(),
            [
                mpsse::SET_BITS_LOW, 0x00, 0x0B,
                0x31, 0x02, 0x00, 0x9F, 0x00, 0x00,
                mpsse::SET_BITS_LOW, 0x08, 0x0B,
                mpsse::SEND_IMMEDIATE,
            ]
        );
        // CS ends deasserted
        assert_eq!(port.pins().value & 0x08, 0x08);
    }

    #[test]
    fn spare_pins_set_after_new_survive_transfers() {
        let (mut port, spi, sim) = setup(SpiConfig::new(SpiMode::Mode0, 1_000_000));
        port.configure_pins(0x004B, 0x0048).unwrap();
        sim.clear_bulk_log();
        sim.queue_input_bytes(&[0x5A], BitOrder::MsbFirst);
        assert_eq!(spi.transfer(&mut port, &[0x00]).unwrap(), [0x5A]);
        assert_eq!(
            sim.bulk_log(),
            [
                mpsse::SET_BITS_LOW, 0x40, 0x4B,
                0x31, 0x00, 0x00, 0x00,
                mpsse::SET_BITS_LOW, 0x48, 0x4B,
                mpsse::SEND_IMMEDIATE,
            ]
        );
        assert_eq!(port.pins().value & 0xFF, 0x48);
        assert_eq!(sim.mpsse_pins().0 & 0x40, 0x40);
    }

    #[test]
    fn write_read_uses_one_assertion() {
        let (mut port, spi, sim) = setup(SpiConfig::new(SpiMode::Mode1, 500_000));
        sim.clear_bulk_log();
        sim.queue_input_bytes(&[0xA5, 0x5A], BitOrder::MsbFirst);
        let r = spi.write_read(&mut port, &[0x03, 0x00], 2).unwrap();
        assert_eq!(r, [0xA5, 0x5A]);
        let log = sim.bulk_log();
        let asserts = log
            .windows(3)
            .filter(|w| w == &[mpsse::SET_BITS_LOW, 0x00, 0x0B])
            .count();
        assert_eq!(asserts, 1);
        assert!(log.contains(&0x10));
        assert!(log.contains(&0x24));
    }

    #[test]
    fn manual_cs_emits_no_pin_commands() {
        let (mut port, spi, sim) = setup(SpiConfig::new(SpiMode::Mode0, 1_000_000).with_cs(0, true));
        sim.clear_bulk_log();
        spi.write(&mut port, &[1, 2]).unwrap();
        assert_eq!(sim.bulk_log(), [0x11, 0x01, 0x00, 1, 2]);
        spi.cs_assert(&mut port).unwrap();
        assert_eq!(sim.bulk_log().len(), 5);
    }

    #[test]
    fn loopback_in_every_mode() {
        for mode in [SpiMode::Mode0, SpiMode::Mode1, SpiMode::Mode2, SpiMode::Mode3] {
            let (mut port, spi, _) = setup(SpiConfig::new(mode, 1_000_000));
            port.set_loopback(true).unwrap();
            let tx = [0x00, 0xFF, 0x5A, 0xC3];
            assert_eq!(spi.transfer(&mut port, &tx).unwrap(), tx, "{mode:?}");
            assert_eq!(spi.transfer_bits(&mut port, 0b1100_0000, 2).unwrap(), 0b1100_0000);
        }
    }

    #[test]
    fn cs_may_not_overlap_bus_pins() {
        let sim = SimulatedChip::new(ChipType::Ft232H);
        let options = PortOptions::default().with_mode_settle(Duration::ZERO);
        let mut port = Port::with_transport(sim, ChipType::Ft232H, Interface::A, options).unwrap();
        port.set_mode(PortMode::Mpsse, 0).unwrap();
        let cfg = SpiConfig::new(SpiMode::Mode0, 1_000_000).with_cs(0x04, true);
        assert!(SpiBus::new(&mut port, cfg).is_err());
    }

    #[test]
    fn needs_mpsse() {
        let sim = SimulatedChip::new(ChipType::Ft232H);
        let options = PortOptions::default().with_mode_settle(Duration::ZERO);
        let mut port = Port::with_transport(sim, ChipType::Ft232H, Interface::A, options).unwrap();
        assert!(SpiBus::new(&mut port, SpiConfig::default()).is_err());
    }
}
