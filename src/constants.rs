//! Protocol constants for FTDI chip communication.
//!
//! These constants define the USB vendor request codes, modem control values,
//! MPSSE opcodes and other wire-level details of the FTDI protocol. Most users
//! should not need them directly, but the [`mpsse`] opcode table is public for
//! callers building raw command sequences.

// ---- FTDI Vendor ID and known Product IDs ----

/// Default FTDI vendor ID.
pub const FTDI_VID: u16 = 0x0403;

/// Known FTDI product IDs.
pub mod pid {
    /// FT232AM, FT232BM, FT232R.
    pub const FT232: u16 = 0x6001;
    /// FT2232C/D/H.
    pub const FT2232: u16 = 0x6010;
    /// FT4232H.
    pub const FT4232: u16 = 0x6011;
    /// FT232H.
    pub const FT232H: u16 = 0x6014;
    /// FT230X.
    pub const FT230X: u16 = 0x6015;

    /// All product IDs recognised by device discovery.
    pub const ALL: [u16; 5] = [FT232, FT2232, FT4232, FT232H, FT230X];
}

// ---- SIO vendor request codes ----

pub(crate) const SIO_RESET_REQUEST: u8 = 0x00;
pub(crate) const SIO_SET_MODEM_CTRL_REQUEST: u8 = 0x01;
pub(crate) const SIO_SET_FLOW_CTRL_REQUEST: u8 = 0x02;
pub(crate) const SIO_SET_BAUDRATE_REQUEST: u8 = 0x03;
/// Set data characteristics (bits, parity, stop, break).
pub(crate) const SIO_SET_DATA_REQUEST: u8 = 0x04;
pub(crate) const SIO_POLL_MODEM_STATUS_REQUEST: u8 = 0x05;
pub(crate) const SIO_SET_EVENT_CHAR_REQUEST: u8 = 0x06;
pub(crate) const SIO_SET_ERROR_CHAR_REQUEST: u8 = 0x07;
pub(crate) const SIO_SET_LATENCY_TIMER_REQUEST: u8 = 0x09;
pub(crate) const SIO_GET_LATENCY_TIMER_REQUEST: u8 = 0x0A;
/// Select bit mode; value is `direction_mask | mode << 8`.
pub(crate) const SIO_SET_BITMODE_REQUEST: u8 = 0x0B;
/// Sample the pins directly, bypassing the bulk-IN stream.
pub(crate) const SIO_READ_PINS_REQUEST: u8 = 0x0C;

// ---- Reset sub-commands ----

pub(crate) const SIO_RESET_SIO: u16 = 0;
/// Flush RX FIFO (chip -> host direction).
pub(crate) const SIO_TCIFLUSH: u16 = 2;
/// Flush TX FIFO (host -> chip direction).
pub(crate) const SIO_TCOFLUSH: u16 = 1;

// ---- Flow control values ----

pub(crate) const SIO_DISABLE_FLOW_CTRL: u16 = 0x0;
pub(crate) const SIO_RTS_CTS_HS: u16 = 0x1 << 8;
pub(crate) const SIO_DTR_DSR_HS: u16 = 0x2 << 8;
pub(crate) const SIO_XON_XOFF_HS: u16 = 0x4 << 8;

// ---- Modem control line values ----

pub(crate) const SIO_SET_DTR_HIGH: u16 = 1 | (0x1 << 8);
pub(crate) const SIO_SET_DTR_LOW: u16 = 0x1 << 8;
pub(crate) const SIO_SET_RTS_HIGH: u16 = 2 | (0x2 << 8);
pub(crate) const SIO_SET_RTS_LOW: u16 = 0x2 << 8;

// ---- Clock constants ----

/// H-type UART reference clock: 120 MHz.
pub(crate) const H_CLK: u32 = 120_000_000;
/// Standard UART reference clock: 48 MHz.
pub(crate) const C_CLK: u32 = 48_000_000;
/// AM-type UART reference clock: 24 MHz.
pub(crate) const AM_CLK: u32 = 24_000_000;

/// MPSSE master clock on H-type chips with the divide-by-5 prescaler off.
pub const MPSSE_CLK_H: u32 = 60_000_000;
/// MPSSE master clock with the divide-by-5 prescaler on (and on FT2232C/D).
pub const MPSSE_CLK_DIV5: u32 = 12_000_000;

// ---- Line status bits (second status byte of every bulk-IN packet) ----

pub(crate) const LSR_OVERRUN: u8 = 0x02;
pub(crate) const LSR_PARITY: u8 = 0x04;
pub(crate) const LSR_FRAMING: u8 = 0x08;
pub(crate) const LSR_BREAK: u8 = 0x10;
pub(crate) const LSR_THRE: u8 = 0x20;
pub(crate) const LSR_TEMT: u8 = 0x40;
pub(crate) const LSR_FIFO: u8 = 0x80;

// ---- MPSSE commands ----

/// MPSSE shifting and pin commands, exposed for users building MPSSE command sequences.
pub mod mpsse {
    // Shifting commands
    /// Write TDI/DO on negative TCK/SK edge.
    pub const WRITE_NEG: u8 = 0x01;
    /// Write bits, not bytes.
    pub const BITMODE: u8 = 0x02;
    /// Sample TDO/DI on negative TCK/SK edge.
    pub const READ_NEG: u8 = 0x04;
    /// LSB first.
    pub const LSB: u8 = 0x08;
    /// Write TDI/DO.
    pub const DO_WRITE: u8 = 0x10;
    /// Read TDO/DI.
    pub const DO_READ: u8 = 0x20;
    /// Write TMS/CS.
    pub const WRITE_TMS: u8 = 0x40;

    // Pin commands
    /// Set data bits low byte.
    pub const SET_BITS_LOW: u8 = 0x80;
    /// Get data bits low byte.
    pub const GET_BITS_LOW: u8 = 0x81;
    /// Set data bits high byte.
    pub const SET_BITS_HIGH: u8 = 0x82;
    /// Get data bits high byte.
    pub const GET_BITS_HIGH: u8 = 0x83;
    /// Enable loopback.
    pub const LOOPBACK_START: u8 = 0x84;
    /// Disable loopback.
    pub const LOOPBACK_END: u8 = 0x85;
    /// Set TCK divisor.
    pub const TCK_DIVISOR: u8 = 0x86;
    /// Send immediate (flush the chip's response buffer to the host).
    pub const SEND_IMMEDIATE: u8 = 0x87;
    /// Wait until GPIOL1 is high.
    pub const WAIT_ON_HIGH: u8 = 0x88;
    /// Wait until GPIOL1 is low.
    pub const WAIT_ON_LOW: u8 = 0x89;

    // H-type specific commands
    /// Disable divide-by-5 prescaler (use 60 MHz master clock).
    pub const DIS_DIV_5: u8 = 0x8A;
    /// Enable divide-by-5 prescaler (use 12 MHz master clock).
    pub const EN_DIV_5: u8 = 0x8B;
    /// Enable 3-phase data clocking.
    pub const EN_3_PHASE: u8 = 0x8C;
    /// Disable 3-phase data clocking.
    pub const DIS_3_PHASE: u8 = 0x8D;
    /// Clock bits without data transfer.
    pub const CLK_BITS: u8 = 0x8E;
    /// Clock bytes without data transfer.
    pub const CLK_BYTES: u8 = 0x8F;
    /// Enable adaptive clocking.
    pub const EN_ADAPTIVE: u8 = 0x96;
    /// Disable adaptive clocking.
    pub const DIS_ADAPTIVE: u8 = 0x97;
    /// Drive open-collector outputs (FT232H only).
    pub const DRIVE_OPEN_COLLECTOR: u8 = 0x9E;

    /// First byte of the two-byte reply to an opcode the MPSSE does not know.
    pub const BAD_COMMAND: u8 = 0xFA;
    /// Deliberately invalid opcode used to resynchronise with the MPSSE.
    pub const SYNC_OPCODE: u8 = 0xAB;
}
