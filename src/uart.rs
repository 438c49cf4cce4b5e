//! UART configuration: baud rate divisors and line framing.
//!
//! FTDI chips use a fractional clock divider to generate baud rates.
//! The exact algorithm differs between chip generations:
//!
//! - **AM**: 24 MHz base clock, limited fractional divisors.
//! - **BM/2232C/R/230X**: 48 MHz base clock, 16x predivisor, 3 fractional bits.
//! - **H-type** (2232H/4232H/232H): Selectable 120 MHz or 48 MHz clock.
//!
//! The divisor is expressed in eighths; the 3-bit sub-integer part is sent
//! through a scrambled code table (0, 1/2, 1/4, 1/8, 3/8, 5/8, 3/4, 7/8).

use crate::constants::{AM_CLK, C_CLK, H_CLK};
use crate::error::{Error, Result, UnsupportedConfig};
use crate::port::{Port, PortMode};
use crate::transport::Transport;
use crate::types::{BreakType, ChipType, DataBits, FlowControl, Parity, StopBits};

/// A baud rate resolved to divider register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaudRate {
    /// Rate asked for.
    pub requested: u32,
    /// Nearest achievable rate.
    pub actual: u32,
    /// Integer part of the divisor.
    pub divisor: u32,
    /// Fractional part of the divisor, in eighths.
    pub fraction_eighths: u8,
    /// Divider input clock (reference clock over its fixed predivisor).
    pub base_hz: u32,
    /// `value` field of the SET_BAUDRATE request.
    pub value: u16,
    /// `index` field of the SET_BAUDRATE request.
    pub index: u16,
}

impl BaudRate {
    /// Whether `actual` lies within the 5% tolerance FTDI UARTs are specified for.
    pub fn within_tolerance(&self) -> bool {
        within_tolerance(self.requested, self.actual)
    }
}

/// Fractional code lookup table: maps 3-bit sub-divisor to FTDI encoding.
const FRAC_CODE: [u32; 8] = [0, 3, 2, 4, 1, 5, 6, 7];

/// AM-type: round-down adjustments for unsupported fractional values.
const AM_ADJUST_DN: [i32; 8] = [0, 0, 0, 1, 0, 3, 2, 1];
/// AM-type: round-up adjustments for unsupported fractional values.
const AM_ADJUST_UP: [i32; 8] = [0, 0, 0, 1, 0, 1, 2, 3];

/// Divider result: achieved rate, encoded register value, divisor in eighths.
struct Divider {
    baud: u32,
    encoded: u32,
    eighths: u32,
}

/// AM chips: 24 MHz clock, no 1/8-step fractions and no divisors 9-15.
fn clkbits_am(baudrate: u32) -> Divider {
    let baudrate = baudrate as i32;
    let mut divisor = AM_CLK as i32 / baudrate;

    divisor -= AM_ADJUST_DN[(divisor & 7) as usize];

    let mut best_divisor = 0i32;
    let mut best_baud = 0i32;
    let mut best_baud_diff = 0i32;

    for i in 0..2 {
        let mut try_divisor = divisor + i;

        if try_divisor <= 8 {
            try_divisor = 8;
        } else if divisor < 16 {
            try_divisor = 16;
        } else {
            try_divisor += AM_ADJUST_UP[(try_divisor & 7) as usize];
            if try_divisor > 0x1FFF8 {
                try_divisor = 0x1FFF8;
            }
        }

        let baud_estimate = (AM_CLK as i32 + (try_divisor / 2)) / try_divisor;
        let baud_diff = (baud_estimate - baudrate).abs();

        if i == 0 || baud_diff < best_baud_diff {
            best_divisor = try_divisor;
            best_baud = baud_estimate;
            best_baud_diff = baud_diff;
            if baud_diff == 0 {
                break;
            }
        }
    }

    let mut encoded = (best_divisor >> 3) as u32 | FRAC_CODE[(best_divisor & 7) as usize] << 14;

    // Divisors 1 and 1.5 have dedicated encodings
    if encoded == 1 {
        encoded = 0;
    } else if encoded == 0x4001 {
        encoded = 1;
    }

    Divider {
        baud: best_baud as u32,
        encoded,
        eighths: best_divisor as u32,
    }
}

/// Divider for a reference clock `clk` behind a fixed `clk_div` predivisor.
fn clkbits(baudrate: u32, clk: u32, clk_div: u32) -> Divider {
    // Divisors 1, 1.5 and 2 are special-cased by the hardware.
    if baudrate >= clk / clk_div {
        return Divider {
            baud: clk / clk_div,
            encoded: 0,
            eighths: 8,
        };
    }
    if baudrate >= clk / (clk_div + clk_div / 2) {
        return Divider {
            baud: clk / (clk_div + clk_div / 2),
            encoded: 1,
            eighths: 12,
        };
    }
    if baudrate >= clk / (2 * clk_div) {
        return Divider {
            baud: clk / (2 * clk_div),
            encoded: 2,
            eighths: 16,
        };
    }

    // Divide by 16 to get 3 fractional bits and one bit for rounding
    let divisor = clk * 16 / clk_div / baudrate;
    let best_divisor = if divisor & 1 != 0 {
        divisor / 2 + 1
    } else {
        divisor / 2
    };
    // 0x20000 itself is a valid divisor; only values above it are clamped.
    let best_divisor = if best_divisor > 0x20000 {
        0x1FFFF
    } else {
        best_divisor
    };

    let mut best_baud = clk * 16 / clk_div / best_divisor;
    if best_baud & 1 != 0 {
        best_baud = best_baud / 2 + 1;
    } else {
        best_baud /= 2;
    }

    let encoded = (best_divisor >> 3) | FRAC_CODE[(best_divisor & 0x7) as usize] << 14;

    Divider {
        baud: best_baud,
        encoded,
        eighths: best_divisor,
    }
}

/// Convert a requested baud rate to FTDI register values.
///
/// `usb_index` is the 1-based port number; H-type chips carry it in the
/// low byte of the request index. No tolerance check is applied here.
pub fn convert_baudrate(baudrate: u32, chip: ChipType, usb_index: u16) -> Result<BaudRate> {
    if baudrate == 0 {
        return Err(Error::InvalidArgument("baud rate must be > 0"));
    }
    // The AM divider search works in signed arithmetic.
    if baudrate > i32::MAX as u32 {
        return Err(Error::InvalidArgument("baud rate out of range"));
    }

    let (div, base_hz) = match chip {
        ChipType::Ft2232H | ChipType::Ft4232H | ChipType::Ft232H
            if (baudrate as u64) * 10 > (H_CLK as u64) / 0x3FFF =>
        {
            // 12 MHz base (120 MHz / 10)
            let mut div = clkbits(baudrate, H_CLK, 10);
            div.encoded |= 0x20000;
            (div, H_CLK / 10)
        }
        ChipType::Am => (clkbits_am(baudrate), AM_CLK / 8),
        _ => (clkbits(baudrate, C_CLK, 16), C_CLK / 16),
    };

    if div.baud == 0 {
        return Err(Error::InvalidArgument("baud rate out of range"));
    }

    let value = (div.encoded & 0xFFFF) as u16;
    let index = if chip.is_h_type() {
        ((div.encoded >> 8) as u16 & 0xFF00) | usb_index
    } else {
        (div.encoded >> 16) as u16
    };

    Ok(BaudRate {
        requested: baudrate,
        actual: div.baud,
        divisor: div.eighths >> 3,
        fraction_eighths: (div.eighths & 7) as u8,
        base_hz,
        value,
        index,
    })
}

/// Whether `actual` is within 5% of `requested`.
pub fn within_tolerance(requested: u32, actual: u32) -> bool {
    let (req, act) = (requested as u64, actual as u64);
    if act * 2 < req {
        return false;
    }
    if act < req {
        act * 21 >= req * 20
    } else {
        req * 21 >= act * 20
    }
}

/// Character framing for the UART.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LineConfig {
    /// Data bits per character.
    pub data_bits: DataBits,
    /// Stop bits.
    pub stop_bits: StopBits,
    /// Parity mode.
    pub parity: Parity,
    /// Whether TX is held in the break condition.
    pub break_type: BreakType,
}

impl LineConfig {
    /// Encode for the SET_DATA request: bits | parity << 8 | stop << 11 | break << 14.
    pub fn encode(&self) -> Result<u16> {
        if !matches!(self.data_bits, DataBits::Seven | DataBits::Eight) {
            return Err(UnsupportedConfig::LineProperty(
                "FTDI UARTs support only 7 or 8 data bits",
            )
            .into());
        }
        Ok(self.data_bits.count()
            | (self.parity.wire_value() << 8)
            | (self.stop_bits.wire_value() << 11)
            | (self.break_type.wire_value() << 14))
    }
}

/// Complete UART setup applied by [`Port::configure_uart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UartConfig {
    /// Baud rate in bits per second.
    pub baud: u32,
    /// Character framing.
    pub line: LineConfig,
    /// Flow control.
    pub flow_control: FlowControl,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            baud: 115_200,
            line: LineConfig::default(),
            flow_control: FlowControl::Disabled,
        }
    }
}

impl UartConfig {
    /// 8N1 at `baud` without flow control.
    pub fn new(baud: u32) -> Self {
        Self {
            baud,
            ..Self::default()
        }
    }
}

impl<T: Transport> Port<T> {
    /// Apply baud rate, framing and flow control in one go.
    pub fn configure_uart(&mut self, config: &UartConfig) -> Result<BaudRate> {
        self.require(PortMode::Reset)?;
        // Validate framing before touching the divider
        config.line.encode()?;
        let baud = self.set_baudrate(config.baud)?;
        self.set_line_property(config.line)?;
        self.set_flow_control(config.flow_control)?;
        Ok(baud)
    }

    /// Program the baud rate generator.
    ///
    /// Fails with an unsupported-configuration error if the nearest
    /// achievable rate deviates by more than 5%.
    pub fn set_baudrate(&mut self, baudrate: u32) -> Result<BaudRate> {
        self.require(PortMode::Reset)?;
        let usb_index = self.interface().config().usb_index;
        let baud = convert_baudrate(baudrate, self.chip_type(), usb_index)?;
        self.program_divider(baud)?;
        log::debug!(
            "baud {} -> {} (divisor {} + {}/8)",
            baudrate,
            baud.actual,
            baud.divisor,
            baud.fraction_eighths
        );
        Ok(baud)
    }

    /// Write a resolved divider after checking its tolerance.
    pub(crate) fn program_divider(&mut self, baud: BaudRate) -> Result<()> {
        if !baud.within_tolerance() {
            return Err(UnsupportedConfig::BaudRate {
                requested: baud.requested,
                actual: baud.actual,
            }
            .into());
        }
        self.device_mut().set_baud_divisor(baud.value, baud.index)?;
        self.set_baud_cache(baud);
        Ok(())
    }

    /// Set data bits, stop bits, parity and break state.
    pub fn set_line_property(&mut self, line: LineConfig) -> Result<()> {
        self.require(PortMode::Reset)?;
        let value = line.encode()?;
        self.device_mut().set_data_characteristics(value)?;
        self.set_line_cache(line);
        Ok(())
    }

    /// Assert or release a break condition, keeping the current framing.
    pub fn set_break(&mut self, on: bool) -> Result<()> {
        let mut line = self.line_config();
        line.break_type = if on { BreakType::On } else { BreakType::Off };
        self.set_line_property(line)
    }

    /// Set the flow control mode.
    pub fn set_flow_control(&mut self, flow: FlowControl) -> Result<()> {
        self.require(PortMode::Reset)?;
        self.device_mut().set_flow_control(flow)
    }

    /// Send bytes over the UART.
    pub fn uart_write(&mut self, data: &[u8]) -> Result<()> {
        self.require(PortMode::Reset)?;
        self.device_mut().write_all(data)
    }

    /// Receive exactly `len` bytes within the read timeout.
    pub fn uart_read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        self.require(PortMode::Reset)?;
        self.device_mut().read_exact(len)
    }

    /// Receive whatever is available; returns 0 if nothing arrived.
    pub fn uart_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.require(PortMode::Reset)?;
        self.device_mut().read_available(buf)
    }
}
