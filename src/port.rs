//! Port mode state machine.
//!
//! A [`Port`] owns one [`FtdiDevice`] and tracks which bit mode the silicon
//! is in. Mode-specific operations live in [`crate::uart`],
//! [`crate::bitbang`] and [`crate::mpsse`], and each of them checks the mode
//! before touching the wire. Switching modes always goes through
//! [`Port::set_mode`], which forgets every cached pin, clock and line setting.

use std::time::Duration;

use crate::device::FtdiDevice;
use crate::device_info::DeviceFilter;
use crate::error::{Error, ProtocolViolation, Result, UnsupportedConfig};
use crate::mpsse::ClockConfig;
use crate::transport::{NusbTransport, Transport};
use crate::types::{ChipType, Interface};
use crate::uart::{BaudRate, LineConfig};

/// Default read/write timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default read/write buffer chunk size.
const DEFAULT_CHUNKSIZE: usize = 4096;

/// Default latency timer in milliseconds.
const DEFAULT_LATENCY_MS: u8 = 16;

/// Delay after a bit mode change before the chip accepts commands.
const DEFAULT_MODE_SETTLE: Duration = Duration::from_millis(50);

/// Operating mode of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PortMode {
    /// UART / FIFO operation (bit mode off).
    #[default]
    Reset,
    /// Asynchronous bitbang: writes drive the pins, reads sample them.
    AsyncBitbang,
    /// Synchronous bitbang: each written byte clocks one sampled byte back.
    SyncBitbang,
    /// Multi-Protocol Synchronous Serial Engine.
    Mpsse,
}

impl PortMode {
    /// Mode byte for the SET_BITMODE request.
    pub fn wire_value(self) -> u8 {
        match self {
            Self::Reset => 0x00,
            Self::AsyncBitbang => 0x01,
            Self::Mpsse => 0x02,
            Self::SyncBitbang => 0x04,
        }
    }

    /// Whether `chip` supports this mode on `interface`.
    pub fn is_supported(self, chip: ChipType, interface: Interface) -> bool {
        match self {
            Self::Reset => true,
            Self::AsyncBitbang => chip.has_async_bitbang(),
            Self::SyncBitbang => chip.has_sync_bitbang(),
            Self::Mpsse => chip.has_mpsse(interface),
        }
    }

    /// Whether this is one of the two bitbang modes.
    pub fn is_bitbang(self) -> bool {
        matches!(self, Self::AsyncBitbang | Self::SyncBitbang)
    }
}

/// Options applied when a port is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOptions {
    /// Deadline for a complete read.
    pub read_timeout: Duration,
    /// Timeout for each bulk write.
    pub write_timeout: Duration,
    /// Latency timer in milliseconds (1-255).
    pub latency_ms: u8,
    /// Bytes requested per bulk read.
    pub read_chunksize: usize,
    /// Upper bound on bytes per bulk write.
    pub write_chunksize: usize,
    /// Issue an SIO reset when the port is opened.
    pub reset_on_open: bool,
    /// Pause after each bit mode change.
    pub mode_settle: Duration,
}

impl Default for PortOptions {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            latency_ms: DEFAULT_LATENCY_MS,
            read_chunksize: DEFAULT_CHUNKSIZE,
            write_chunksize: DEFAULT_CHUNKSIZE,
            reset_on_open: true,
            mode_settle: DEFAULT_MODE_SETTLE,
        }
    }
}

impl PortOptions {
    /// Set the read deadline.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the latency timer.
    pub fn with_latency(mut self, latency_ms: u8) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Set both bulk chunk sizes.
    pub fn with_chunksize(mut self, read: usize, write: usize) -> Self {
        self.read_chunksize = read;
        self.write_chunksize = write;
        self
    }

    /// Choose whether to reset the port on open.
    pub fn with_reset_on_open(mut self, reset: bool) -> Self {
        self.reset_on_open = reset;
        self
    }

    /// Set the pause after bit mode changes.
    pub fn with_mode_settle(mut self, settle: Duration) -> Self {
        self.mode_settle = settle;
        self
    }
}

/// Cached direction and output levels of the GPIO lines.
///
/// In MPSSE mode bits 0-7 are the low byte and bits 8-15 the high byte. In
/// bitbang mode only the low byte is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PinState {
    /// 1 = output.
    pub direction: u16,
    /// Output levels; bits of input pins are kept at 0.
    pub value: u16,
}

impl PinState {
    pub(crate) fn low(self) -> (u8, u8) {
        (self.value as u8, self.direction as u8)
    }

    pub(crate) fn high(self) -> (u8, u8) {
        ((self.value >> 8) as u8, (self.direction >> 8) as u8)
    }
}

/// One FTDI port with its mode and cached engine state.
pub struct Port<T: Transport> {
    dev: FtdiDevice<T>,
    mode: PortMode,
    pins: PinState,
    clock: Option<ClockConfig>,
    loopback: bool,
    baud: Option<BaudRate>,
    line: LineConfig,
    latency_ms: u8,
    mode_settle: Duration,
}

impl<T: Transport> std::fmt::Debug for Port<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("device", &self.dev)
            .field("mode", &self.mode)
            .field("pins", &self.pins)
            .field("clock", &self.clock)
            .field("baud", &self.baud)
            .finish_non_exhaustive()
    }
}

impl Port<NusbTransport> {
    /// Open the first device matching the IDs and claim `interface`.
    ///
    /// ```no_run
    /// use ftdi_engine::{Interface, Port, PortMode, PortOptions};
    ///
    /// let mut port = Port::open(0x0403, 0x6014, Interface::A, PortOptions::default())?;
    /// port.set_mode(PortMode::Mpsse, 0)?;
    /// port.set_clock(1_000_000)?;
    /// # Ok::<(), ftdi_engine::Error>(())
    /// ```
    pub fn open(
        vendor: u16,
        product: u16,
        interface: Interface,
        options: PortOptions,
    ) -> Result<Self> {
        let transport = NusbTransport::open(vendor, product, interface)?;
        let chip = transport.chip_type();
        Self::with_transport(transport, chip, interface, options)
    }

    /// Open a device selected by `filter` and claim `interface`.
    pub fn open_with_filter(
        filter: &DeviceFilter,
        interface: Interface,
        options: PortOptions,
    ) -> Result<Self> {
        let transport = NusbTransport::open_with_filter(filter, interface)?;
        let chip = transport.chip_type();
        Self::with_transport(transport, chip, interface, options)
    }
}

impl<T: Transport> Port<T> {
    /// Bring up a port on an arbitrary transport.
    ///
    /// The port is reset (if requested), its latency timer programmed, and
    /// the bit mode forced to [`PortMode::Reset`].
    pub fn with_transport(
        transport: T,
        chip: ChipType,
        interface: Interface,
        options: PortOptions,
    ) -> Result<Self> {
        let mut dev = FtdiDevice::new(transport, chip, interface, &options)?;

        if options.reset_on_open {
            dev.usb_reset()?;
        }
        dev.write_latency_timer(options.latency_ms)?;
        dev.set_bitmode_raw(0, PortMode::Reset.wire_value())?;

        log::info!("{chip:?} port {interface:?} ready");

        Ok(Self {
            dev,
            mode: PortMode::Reset,
            pins: PinState::default(),
            clock: None,
            loopback: false,
            baud: None,
            line: LineConfig::default(),
            latency_ms: options.latency_ms,
            mode_settle: options.mode_settle,
        })
    }

    /// The current bit mode.
    pub fn mode(&self) -> PortMode {
        self.mode
    }

    /// The detected chip.
    pub fn chip_type(&self) -> ChipType {
        self.dev.chip_type()
    }

    /// The claimed port.
    pub fn interface(&self) -> Interface {
        self.dev.interface()
    }

    /// Cached GPIO direction and levels.
    pub fn pins(&self) -> PinState {
        self.pins
    }

    /// Active MPSSE clock configuration, if one has been set since the last
    /// mode switch.
    pub fn clock(&self) -> Option<ClockConfig> {
        self.clock
    }

    /// Whether MPSSE internal loopback is on.
    pub fn loopback(&self) -> bool {
        self.loopback
    }

    /// Baud rate (or bitbang rate generator setting) currently programmed.
    pub fn baud(&self) -> Option<BaudRate> {
        self.baud
    }

    /// Current UART line configuration.
    pub fn line_config(&self) -> LineConfig {
        self.line
    }

    /// Latency timer last written.
    pub fn latency_timer(&self) -> u8 {
        self.latency_ms
    }

    /// The low-level device handle.
    pub fn device(&self) -> &FtdiDevice<T> {
        &self.dev
    }

    /// Mutable access to the low-level device handle.
    ///
    /// Bypassing the port to change the bit mode desynchronises the cached
    /// state; use [`set_mode`](Self::set_mode) instead.
    pub fn device_mut(&mut self) -> &mut FtdiDevice<T> {
        &mut self.dev
    }

    /// Fail unless the handle is usable and the port is in `required` mode.
    ///
    /// A dead handle is reported before any mode mismatch.
    pub fn require(&self, required: PortMode) -> Result<()> {
        self.dev.ensure_open()?;
        if self.mode == required {
            Ok(())
        } else {
            Err(ProtocolViolation::WrongMode {
                required,
                current: self.mode,
            }
            .into())
        }
    }

    /// Fail unless the port is in one of the bitbang modes.
    pub fn require_bitbang(&self) -> Result<()> {
        self.dev.ensure_open()?;
        if self.mode.is_bitbang() {
            Ok(())
        } else {
            Err(ProtocolViolation::NotBitbang { current: self.mode }.into())
        }
    }

    /// Switch the port to `mode`.
    ///
    /// `direction` is the low-byte pin direction mask used by the bitbang
    /// modes (1 = output); MPSSE and Reset ignore it and start with every
    /// pin as an input. Both FIFOs are purged, cached pin, clock and line
    /// state is cleared, and on entering MPSSE the engine is put into a
    /// known state (loopback, adaptive and 3-phase clocking off) and
    /// synchronised.
    pub fn set_mode(&mut self, mode: PortMode, direction: u8) -> Result<()> {
        self.dev.ensure_open()?;

        let chip = self.chip_type();
        let interface = self.interface();
        if !mode.is_supported(chip, interface) {
            return Err(UnsupportedConfig::Mode {
                mode,
                chip,
                interface,
            }
            .into());
        }

        log::debug!("{:?} port {:?}: {:?} -> {:?}", chip, interface, self.mode, mode);

        // Any failure below leaves the chip in an unknown mode; fall back to
        // Reset so later calls do not trust stale state.
        self.forget_engine_state();
        self.mode = PortMode::Reset;

        if mode != PortMode::Reset {
            self.dev.set_bitmode_raw(0, PortMode::Reset.wire_value())?;
        }
        self.dev.purge_all()?;

        let direction = if mode.is_bitbang() { direction } else { 0 };
        self.dev.set_bitmode_raw(direction, mode.wire_value())?;
        if !self.mode_settle.is_zero() {
            std::thread::sleep(self.mode_settle);
        }

        self.mode = mode;
        self.pins.direction = direction as u16;

        if mode == PortMode::Mpsse {
            if let Err(e) = self.init_mpsse() {
                self.mode = PortMode::Reset;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Program the latency timer (1-255 ms).
    ///
    /// Lower values reduce round-trip time for small MPSSE exchanges at the
    /// cost of more USB traffic.
    pub fn set_latency_timer(&mut self, latency_ms: u8) -> Result<()> {
        self.dev.write_latency_timer(latency_ms)?;
        self.latency_ms = latency_ms;
        Ok(())
    }

    /// Return the port to Reset mode and release the transport.
    pub fn close(mut self) -> Result<()> {
        let result = if self.dev.is_open() && self.mode != PortMode::Reset {
            self.dev.set_bitmode_raw(0, PortMode::Reset.wire_value())
        } else {
            Ok(())
        };
        if let Err(e) = &result {
            log::warn!("failed to return port to reset mode on close: {e}");
        }
        self.dev.close();
        result
    }

    fn forget_engine_state(&mut self) {
        self.pins = PinState::default();
        self.clock = None;
        self.loopback = false;
        self.baud = None;
        self.line = LineConfig::default();
    }

    pub(crate) fn set_pins_cache(&mut self, pins: PinState) {
        self.pins = pins;
    }

    pub(crate) fn set_clock_cache(&mut self, clock: ClockConfig) {
        self.clock = Some(clock);
    }

    pub(crate) fn set_loopback_cache(&mut self, enable: bool) {
        self.loopback = enable;
    }

    pub(crate) fn set_baud_cache(&mut self, baud: BaudRate) {
        self.baud = Some(baud);
    }

    pub(crate) fn set_line_cache(&mut self, line: LineConfig) {
        self.line = line;
    }
}

/// Check a direction mask against the width of the port's GPIO bank.
pub(crate) fn check_pin_width(chip: ChipType, mask: u16) -> Result<()> {
    let width = chip.mpsse_gpio_width();
    let allowed: u16 = if width >= 16 {
        0xFFFF
    } else {
        (1u16 << width) - 1
    };
    if mask & !allowed != 0 {
        return Err(Error::Unsupported(UnsupportedConfig::PinWidth { mask, width }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SIO_SET_BITMODE_REQUEST;
    use crate::error::ErrorKind;
    use crate::sim::SimulatedChip;

    fn options() -> PortOptions {
        PortOptions::default()
            .with_read_timeout(Duration::from_millis(50))
            .with_mode_settle(Duration::ZERO)
    }

    fn port(chip: ChipType, interface: Interface) -> Port<SimulatedChip> {
        Port::with_transport(SimulatedChip::new(chip), chip, interface, options()).unwrap()
    }

    #[test]
    fn starts_in_reset() {
        let p = port(ChipType::Ft232H, Interface::A);
        assert_eq!(p.mode(), PortMode::Reset);
        assert_eq!(p.latency_timer(), 16);
        assert_eq!(p.device().transport().bitmode(), (0, 0));
    }

    #[test]
    fn wire_values() {
        assert_eq!(PortMode::Reset.wire_value(), 0x00);
        assert_eq!(PortMode::AsyncBitbang.wire_value(), 0x01);
        assert_eq!(PortMode::Mpsse.wire_value(), 0x02);
        assert_eq!(PortMode::SyncBitbang.wire_value(), 0x04);
    }

    #[test]
    fn bitbang_direction_goes_on_the_wire() {
        let mut p = port(ChipType::Ft232R, Interface::A);
        p.set_mode(PortMode::AsyncBitbang, 0x0F).unwrap();
        assert_eq!(p.device().transport().bitmode(), (0x0F, 0x01));
        assert_eq!(p.pins().direction, 0x0F);

        let requests = p.device().transport().control_log();
        let last = requests.last().unwrap();
        assert_eq!(last.request, SIO_SET_BITMODE_REQUEST);
        assert_eq!(last.value, 0x010F);
        assert_eq!(last.index, 1);
    }

    #[test]
    fn mpsse_rejected_where_absent() {
        let mut p = port(ChipType::Ft232R, Interface::A);
        let err = p.set_mode(PortMode::Mpsse, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedConfig);
        assert_eq!(p.mode(), PortMode::Reset);

        let mut p = port(ChipType::Ft4232H, Interface::C);
        assert!(p.set_mode(PortMode::Mpsse, 0).is_err());

        let mut p = port(ChipType::Bm, Interface::A);
        assert!(p.set_mode(PortMode::SyncBitbang, 0xFF).is_err());
        assert!(p.set_mode(PortMode::AsyncBitbang, 0xFF).is_ok());
    }

    #[test]
    fn switching_clears_cached_state() {
        let mut p = port(ChipType::Ft2232H, Interface::B);
        p.set_mode(PortMode::Mpsse, 0).unwrap();
        p.set_clock(1_000_000).unwrap();
        p.configure_pins(0x00FB, 0x0008).unwrap();
        assert!(p.clock().is_some());

        p.set_mode(PortMode::SyncBitbang, 0x01).unwrap();
        assert!(p.clock().is_none());
        assert_eq!(p.pins(), PinState { direction: 0x01, value: 0 });

        p.set_mode(PortMode::Mpsse, 0).unwrap();
        assert_eq!(p.pins(), PinState::default());
    }

    #[test]
    fn require_reports_both_modes() {
        let p = port(ChipType::Ft232H, Interface::A);
        match p.require(PortMode::Mpsse) {
            Err(Error::ProtocolState(ProtocolViolation::WrongMode { required, current })) => {
                assert_eq!(required, PortMode::Mpsse);
                assert_eq!(current, PortMode::Reset);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(p.require(PortMode::Reset).is_ok());
        assert!(p.require_bitbang().is_err());
    }

    #[test]
    fn latency_timer_round_trips() {
        let mut p = port(ChipType::Ft232H, Interface::A);
        p.set_latency_timer(2).unwrap();
        assert_eq!(p.latency_timer(), 2);
        assert_eq!(p.device_mut().read_latency_timer().unwrap(), 2);
        assert!(p.set_latency_timer(0).is_err());
    }

    #[test]
    fn close_returns_to_reset() {
        let mut p = port(ChipType::Ft232H, Interface::A);
        p.set_mode(PortMode::Mpsse, 0).unwrap();
        let sim = p.device().transport().clone();
        p.close().unwrap();
        assert_eq!(sim.bitmode(), (0, 0));
    }

    #[test]
    fn close_reports_failed_reset() {
        let mut p = port(ChipType::Ft232H, Interface::A);
        p.set_mode(PortMode::Mpsse, 0).unwrap();
        p.device().transport().disconnect();
        assert!(p.close().unwrap_err().is_disconnect());
    }

    #[test]
    fn dead_handle_wins_over_mode_mismatch() {
        let mut p = port(ChipType::Ft232H, Interface::A);
        p.device().transport().disconnect();
        assert!(p.set_mode(PortMode::Mpsse, 0).unwrap_err().is_disconnect());
        assert_eq!(p.mode(), PortMode::Reset);
        assert!(p.require(PortMode::Mpsse).unwrap_err().is_disconnect());
        assert!(p.require_bitbang().unwrap_err().is_disconnect());
    }

    #[test]
    fn pin_width_limits() {
        assert!(check_pin_width(ChipType::Ft232H, 0xFFFF).is_ok());
        assert!(check_pin_width(ChipType::Ft4232H, 0x00FF).is_ok());
        assert!(check_pin_width(ChipType::Ft4232H, 0x0100).is_err());
        assert!(check_pin_width(ChipType::Ft2232C, 0x0FFF).is_ok());
        assert!(check_pin_width(ChipType::Ft2232C, 0x1000).is_err());
    }
}
