//! Single-pin and grouped GPIO access in MPSSE mode.
//!
//! MPSSE chips expose up to two GPIO banks:
//!
//! - **Low byte** (ADBUS0-7): pins 0-2 carry SK/DO/DI while a serial
//!   protocol is active. Pins 3-7 are free unless used as CS or TMS.
//! - **High byte** (ACBUS0-7): present on FT2232C/D (4 pins), FT2232H and
//!   FT232H. FT4232H has no high bank in MPSSE mode.
//!
//! Pins are updated through [`Port::configure_pins`], which works from the
//! port's cached pin state, so pins outside the mask are left alone.
//!
//! # Example
//!
//! ```no_run
//! use ftdi_engine::{Interface, Port, PortMode, PortOptions};
//! use ftdi_engine::mpsse::gpio::{GpioBank, GpioPin};
//!
//! let mut port = Port::open(0x0403, 0x6014, Interface::A, PortOptions::default())?;
//! port.set_mode(PortMode::Mpsse, 0)?;
//!
//! let led = GpioPin::new(GpioBank::High, 0);
//! led.set_output(&mut port, true)?;
//! let button = GpioPin::new(GpioBank::Low, 4);
//! let pressed = !button.read(&mut port)?;
//! # Ok::<(), ftdi_engine::Error>(())
//! ```

use crate::error::{Error, Result};
use crate::port::Port;
use crate::transport::Transport;

/// GPIO bank selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpioBank {
    /// Low byte GPIO (ADBUS0-7).
    Low,
    /// High byte GPIO (ACBUS0-7).
    High,
}

impl GpioBank {
    fn shift(self) -> u32 {
        match self {
            Self::Low => 0,
            Self::High => 8,
        }
    }
}

/// A single GPIO pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpioPin {
    bank: GpioBank,
    bit: u8,
}

impl GpioPin {
    /// Refer to pin `bit` (0-7) of `bank`.
    ///
    /// On the low bank, pins 0-2 double as SK/DO/DI.
    ///
    /// # Panics
    ///
    /// Panics if `bit > 7`.
    pub fn new(bank: GpioBank, bit: u8) -> Self {
        assert!(bit <= 7, "GPIO bit must be 0-7, got {}", bit);
        Self { bank, bit }
    }

    /// The bank this pin belongs to.
    pub fn bank(&self) -> GpioBank {
        self.bank
    }

    /// Bit position within the bank.
    pub fn bit(&self) -> u8 {
        self.bit
    }

    /// Mask of this pin in the 16-bit pin word.
    pub fn mask(&self) -> u16 {
        1 << (self.bit as u32 + self.bank.shift())
    }

    /// Make this pin an output driving `high`.
    pub fn set_output<T: Transport>(&self, port: &mut Port<T>, high: bool) -> Result<()> {
        let pins = port.pins();
        let mask = self.mask();
        let value = if high { pins.value | mask } else { pins.value & !mask };
        port.configure_pins(pins.direction | mask, value)
    }

    /// Make this pin an input.
    pub fn set_input<T: Transport>(&self, port: &mut Port<T>) -> Result<()> {
        let pins = port.pins();
        port.configure_pins(pins.direction & !self.mask(), pins.value)
    }

    /// Drive an output pin.
    pub fn write<T: Transport>(&self, port: &mut Port<T>, high: bool) -> Result<()> {
        if !self.is_output(port) {
            return Err(Error::InvalidArgument("pin is not configured as output"));
        }
        self.set_output(port, high)
    }

    /// Sample the pin.
    pub fn read<T: Transport>(&self, port: &mut Port<T>) -> Result<bool> {
        Ok(port.read_gpio()? & self.mask() != 0)
    }

    /// Whether the pin is currently an output.
    pub fn is_output<T: Transport>(&self, port: &Port<T>) -> bool {
        port.pins().direction & self.mask() != 0
    }
}

/// Several pins of one bank updated in a single command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpioGroup {
    bank: GpioBank,
    mask: u8,
}

impl GpioGroup {
    /// Group the pins set in `mask` on `bank`.
    pub fn new(bank: GpioBank, mask: u8) -> Self {
        Self { bank, mask }
    }

    /// The bank.
    pub fn bank(&self) -> GpioBank {
        self.bank
    }

    /// The group mask within the bank.
    pub fn mask(&self) -> u8 {
        self.mask
    }

    fn wide_mask(&self) -> u16 {
        (self.mask as u16) << self.bank.shift()
    }

    /// Make every pin in the group an output; bits of `values` outside the
    /// mask are ignored.
    pub fn set_all_output<T: Transport>(&self, port: &mut Port<T>, values: u8) -> Result<()> {
        let pins = port.pins();
        let mask = self.wide_mask();
        let values = (values as u16) << self.bank.shift();
        port.configure_pins(pins.direction | mask, (pins.value & !mask) | (values & mask))
    }

    /// Make every pin in the group an input.
    pub fn set_all_input<T: Transport>(&self, port: &mut Port<T>) -> Result<()> {
        let pins = port.pins();
        port.configure_pins(pins.direction & !self.wide_mask(), pins.value)
    }

    /// Sample the group; bits outside the mask are zero.
    pub fn read<T: Transport>(&self, port: &mut Port<T>) -> Result<u8> {
        let word = port.read_gpio()?;
        Ok((word >> self.bank.shift()) as u8 & self.mask)
    }
}
