//! Type definitions for FTDI chip communication.
//!
//! These types model the chip variants and their capabilities, the port
//! selection on multi-interface parts, serial line properties, and the
//! modem status carried in every bulk-IN packet.

/// Supported FTDI chip types.
///
/// The chip type is auto-detected when a device is opened, based on the
/// USB `bcdDevice` descriptor field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipType {
    /// Original FTDI chip (FT8U232AM).
    Am,
    /// B-type chip (FT232BM, FT245BM).
    Bm,
    /// Dual-port chip (FT2232C/D/L).
    Ft2232C,
    /// FT232R / FT245R.
    Ft232R,
    /// Dual hi-speed chip (FT2232H).
    Ft2232H,
    /// Quad-port chip (FT4232H).
    Ft4232H,
    /// Single hi-speed chip (FT232H).
    Ft232H,
    /// FT230X / FT231X / FT234XD.
    Ft230X,
}

impl ChipType {
    /// Detect the chip from the device descriptor's `bcdDevice` field.
    ///
    /// BM parts report 0x200 when no serial number string is programmed,
    /// which would otherwise read as AM.
    pub fn from_bcd_device(bcd: u16, has_serial: bool) -> Self {
        match bcd {
            0x0400 => ChipType::Bm,
            0x0200 if !has_serial => ChipType::Bm,
            0x0200 => ChipType::Am,
            0x0500 => ChipType::Ft2232C,
            0x0600 => ChipType::Ft232R,
            0x0700 => ChipType::Ft2232H,
            0x0800 => ChipType::Ft4232H,
            0x0900 => ChipType::Ft232H,
            0x1000 => ChipType::Ft230X,
            other => {
                log::warn!("unknown bcdDevice {other:#06x}, assuming BM-type chip");
                ChipType::Bm
            }
        }
    }

    /// Whether this is an H-type (hi-speed) chip.
    #[inline]
    pub fn is_h_type(self) -> bool {
        matches!(self, Self::Ft2232H | Self::Ft4232H | Self::Ft232H)
    }

    /// Number of independent ports (USB interfaces) on this chip.
    pub fn port_count(self) -> u8 {
        match self {
            Self::Ft2232C | Self::Ft2232H => 2,
            Self::Ft4232H => 4,
            _ => 1,
        }
    }

    /// Default bulk max-packet size when the descriptor cannot be read.
    pub fn default_max_packet_size(self) -> usize {
        if self.is_h_type() {
            512
        } else {
            64
        }
    }

    /// Whether asynchronous bitbang is available.
    pub fn has_async_bitbang(self) -> bool {
        self != Self::Am
    }

    /// Whether synchronous bitbang is available.
    pub fn has_sync_bitbang(self) -> bool {
        !matches!(self, Self::Am | Self::Bm)
    }

    /// Whether the given port has an MPSSE engine.
    pub fn has_mpsse(self, interface: Interface) -> bool {
        match self {
            Self::Ft2232C | Self::Ft232H => interface == Interface::A,
            Self::Ft2232H | Self::Ft4232H => matches!(interface, Interface::A | Interface::B),
            _ => false,
        }
    }

    /// Number of GPIO lines addressable through the MPSSE pin commands.
    ///
    /// Bits 0-7 are the low byte (xDBUS), bits 8-15 the high byte (xCBUS).
    pub fn mpsse_gpio_width(self) -> u8 {
        match self {
            Self::Ft232H | Self::Ft2232H => 16,
            Self::Ft2232C => 12,
            Self::Ft4232H => 8,
            _ => 0,
        }
    }

    /// Whether the divide-by-5 prescaler can be switched off (60 MHz MPSSE clock).
    pub fn has_div5_toggle(self) -> bool {
        self.is_h_type()
    }

    /// Whether the MPSSE supports adaptive (RTCK) clocking.
    pub fn has_adaptive_clocking(self) -> bool {
        matches!(self, Self::Ft2232H | Self::Ft232H)
    }

    /// Whether the MPSSE supports 3-phase data clocking.
    pub fn has_three_phase_clocking(self) -> bool {
        self.is_h_type()
    }
}

/// Parity mode for serial communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
    /// Mark parity (always 1).
    Mark,
    /// Space parity (always 0).
    Space,
}

impl Parity {
    pub(crate) fn wire_value(self) -> u16 {
        match self {
            Self::None => 0x00,
            Self::Odd => 0x01,
            Self::Even => 0x02,
            Self::Mark => 0x03,
            Self::Space => 0x04,
        }
    }
}

/// Number of stop bits for serial communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 1.5 stop bits.
    OnePointFive,
    /// 2 stop bits.
    Two,
}

impl StopBits {
    pub(crate) fn wire_value(self) -> u16 {
        match self {
            Self::One => 0x00,
            Self::OnePointFive => 0x01,
            Self::Two => 0x02,
        }
    }
}

/// Number of data bits for serial communication.
///
/// All widths can be expressed, but FTDI UARTs only implement 7 and 8; the
/// others are rejected when the line is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataBits {
    /// 5 data bits.
    Five,
    /// 6 data bits.
    Six,
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

impl DataBits {
    /// Number of bits per character.
    pub fn count(self) -> u16 {
        match self {
            Self::Five => 5,
            Self::Six => 6,
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }
}

/// Break signal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BreakType {
    /// Break off (normal operation).
    #[default]
    Off,
    /// Break on (hold TX low).
    On,
}

impl BreakType {
    pub(crate) fn wire_value(self) -> u16 {
        match self {
            Self::Off => 0x00,
            Self::On => 0x01,
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    Disabled,
    /// Hardware RTS/CTS flow control.
    RtsCts,
    /// Hardware DTR/DSR flow control.
    DtrDsr,
    /// XON/XOFF software flow control with the given characters.
    XonXoff {
        /// Character that resumes transmission.
        xon: u8,
        /// Character that pauses transmission.
        xoff: u8,
    },
}

/// Port selection for multi-interface chips.
///
/// Chips like the FT2232H (dual) and FT4232H (quad) expose multiple
/// independent ports, each with its own endpoints and bit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Interface {
    /// Interface A (port 0).
    #[default]
    A,
    /// Interface B (port 1).
    B,
    /// Interface C (port 2, FT4232H only).
    C,
    /// Interface D (port 3, FT4232H only).
    D,
}

/// Interface configuration resolved to concrete USB endpoint values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// The USB interface number (0-based).
    pub interface_num: u8,
    /// The USB index value used in control transfers (1-based).
    pub usb_index: u16,
    /// The bulk OUT endpoint address (host-to-device, for writing data).
    pub write_ep: u8,
    /// The bulk IN endpoint address (device-to-host, for reading data).
    pub read_ep: u8,
}

impl Interface {
    /// Look up a port by its 0-based index.
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::A),
            1 => Some(Self::B),
            2 => Some(Self::C),
            3 => Some(Self::D),
            _ => None,
        }
    }

    /// 0-based port index.
    pub fn index(self) -> u8 {
        self.config().interface_num
    }

    /// Resolve to concrete USB endpoint configuration.
    pub fn config(self) -> InterfaceConfig {
        let n = self as u8;
        InterfaceConfig {
            interface_num: n,
            usb_index: n as u16 + 1,
            write_ep: 0x02 + 2 * n,
            read_ep: 0x81 + 2 * n,
        }
    }
}

/// Decoded modem status from the FTDI chip.
///
/// The FTDI chip sends two status bytes as a header with every USB read.
/// Byte 0 carries the modem lines, byte 1 the line status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModemStatus {
    raw: u16,
}

impl ModemStatus {
    /// Create from the raw two-byte status value (byte 0 in the low half).
    pub fn from_raw(raw: u16) -> Self {
        Self { raw }
    }

    /// Create from the two header bytes of a bulk-IN packet.
    pub fn from_bytes(modem: u8, line: u8) -> Self {
        Self::from_raw(modem as u16 | (line as u16) << 8)
    }

    /// Raw 16-bit status value.
    pub fn raw(self) -> u16 {
        self.raw
    }

    /// The line status register byte.
    pub fn line_status(self) -> u8 {
        (self.raw >> 8) as u8
    }

    // -- Byte 0 (modem status lines) --

    /// Clear To Send (CTS) is active.
    pub fn cts(self) -> bool {
        self.raw & 0x10 != 0
    }

    /// Data Set Ready (DSR) is active.
    pub fn dsr(self) -> bool {
        self.raw & 0x20 != 0
    }

    /// Ring Indicator (RI) is active.
    pub fn ri(self) -> bool {
        self.raw & 0x40 != 0
    }

    /// Receive Line Signal Detect (RLSD / DCD) is active.
    pub fn rlsd(self) -> bool {
        self.raw & 0x80 != 0
    }

    // -- Byte 1 (line status) --

    /// Data Ready (DR).
    pub fn data_ready(self) -> bool {
        self.raw & 0x0100 != 0
    }

    /// Overrun Error (OE).
    pub fn overrun_error(self) -> bool {
        self.raw & 0x0200 != 0
    }

    /// Parity Error (PE).
    pub fn parity_error(self) -> bool {
        self.raw & 0x0400 != 0
    }

    /// Framing Error (FE).
    pub fn framing_error(self) -> bool {
        self.raw & 0x0800 != 0
    }

    /// Break Interrupt (BI).
    pub fn break_interrupt(self) -> bool {
        self.raw & 0x1000 != 0
    }

    /// Transmitter Holding Register Empty (THRE).
    pub fn transmitter_holding_empty(self) -> bool {
        self.raw & 0x2000 != 0
    }

    /// Transmitter Empty (TEMT).
    pub fn transmitter_empty(self) -> bool {
        self.raw & 0x4000 != 0
    }

    /// Error in RCVR FIFO.
    pub fn fifo_error(self) -> bool {
        self.raw & 0x8000 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_endpoints() {
        assert_eq!(
            Interface::A.config(),
            InterfaceConfig {
                interface_num: 0,
                usb_index: 1,
                write_ep: 0x02,
                read_ep: 0x81,
            }
        );
        let d = Interface::D.config();
        assert_eq!(d.usb_index, 4);
        assert_eq!(d.write_ep, 0x08);
        assert_eq!(d.read_ep, 0x87);
        assert_eq!(Interface::from_index(2), Some(Interface::C));
        assert_eq!(Interface::from_index(4), None);
    }

    #[test]
    fn chip_detection() {
        assert_eq!(ChipType::from_bcd_device(0x0700, true), ChipType::Ft2232H);
        assert_eq!(ChipType::from_bcd_device(0x0900, true), ChipType::Ft232H);
        assert_eq!(ChipType::from_bcd_device(0x0200, false), ChipType::Bm);
        assert_eq!(ChipType::from_bcd_device(0x0200, true), ChipType::Am);
    }

    #[test]
    fn mpsse_ports() {
        assert!(ChipType::Ft2232C.has_mpsse(Interface::A));
        assert!(!ChipType::Ft2232C.has_mpsse(Interface::B));
        assert!(ChipType::Ft4232H.has_mpsse(Interface::B));
        assert!(!ChipType::Ft4232H.has_mpsse(Interface::C));
        assert!(!ChipType::Ft232R.has_mpsse(Interface::A));
    }

    #[test]
    fn modem_status_bytes() {
        let st = ModemStatus::from_bytes(0x31, 0x62);
        assert!(st.cts());
        assert!(st.dsr());
        assert!(st.overrun_error());
        assert!(st.transmitter_holding_empty());
        assert!(!st.parity_error());
        assert_eq!(st.line_status(), 0x62);
    }
}
