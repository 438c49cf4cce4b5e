//! Asynchronous and synchronous bitbang.
//!
//! In both modes each byte written to the port drives the eight data pins
//! configured as outputs. Asynchronous bitbang updates the pins as fast as
//! the rate generator allows; synchronous bitbang samples the pins before
//! every update and returns one byte per byte written, so writes and reads
//! must stay paired.

use crate::error::{Error, ProtocolViolation, Result};
use crate::port::{PinState, Port, PortMode};
use crate::transport::Transport;
use crate::uart::convert_baudrate;

/// The rate generator runs at four times the programmed baud in bitbang.
const BITBANG_MULTIPLIER: u32 = 4;

/// Bytes sent per synchronous exchange round.
///
/// Keeps the echoed samples well inside the chip's receive FIFO.
const SYNC_CHUNK: usize = 64;

impl<T: Transport> Port<T> {
    /// Program the pin update rate. Returns the achieved rate in Hz.
    pub fn set_bitbang_rate(&mut self, hz: u32) -> Result<u32> {
        self.require_bitbang()?;
        let effective = hz
            .checked_mul(BITBANG_MULTIPLIER)
            .ok_or(Error::InvalidArgument("bitbang rate too high"))?;
        let usb_index = self.interface().config().usb_index;
        let baud = convert_baudrate(effective, self.chip_type(), usb_index)?;
        self.program_divider(baud)?;

        let achieved = baud.actual / BITBANG_MULTIPLIER;
        log::debug!("bitbang rate {hz} Hz -> {achieved} Hz");
        Ok(achieved)
    }

    /// Change which pins are outputs without leaving the current mode.
    pub fn set_pin_direction(&mut self, direction: u8) -> Result<()> {
        self.require_bitbang()?;
        let mode = self.mode().wire_value();
        self.device_mut().set_bitmode_raw(direction, mode)?;
        let pins = self.pins();
        self.set_pins_cache(PinState {
            direction: direction as u16,
            value: pins.value & direction as u16,
        });
        Ok(())
    }

    /// Drive the output pins.
    ///
    /// In synchronous mode the sample clocked back by the write is read and
    /// discarded.
    pub fn write_pins(&mut self, value: u8) -> Result<()> {
        self.require_bitbang()?;
        if self.mode() == PortMode::SyncBitbang {
            self.exchange(&[value])?;
            return Ok(());
        }
        self.device_mut().write_all(&[value])?;
        self.commit_pin_value(value);
        Ok(())
    }

    /// Sample all eight pins directly, bypassing the data FIFO.
    pub fn read_pins(&mut self) -> Result<u8> {
        self.require_bitbang()?;
        self.device_mut().read_pins()
    }

    /// Write a pattern in synchronous bitbang and return one sample per byte.
    ///
    /// Sample `i` is the pin state just before byte `i` was applied.
    pub fn exchange(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.require(PortMode::SyncBitbang)?;
        let stale = self.device().buffered();
        if stale != 0 {
            self.device_mut().clear_buffer();
            return Err(ProtocolViolation::StaleResponse(stale).into());
        }

        let mut samples = Vec::with_capacity(data.len());
        for chunk in data.chunks(SYNC_CHUNK) {
            let dev = self.device_mut();
            dev.write_all(chunk)?;
            samples.extend(dev.read_exact(chunk.len())?);
        }
        if let Some(&last) = data.last() {
            self.commit_pin_value(last);
        }
        Ok(samples)
    }

    fn commit_pin_value(&mut self, value: u8) {
        let pins = self.pins();
        self.set_pins_cache(PinState {
            direction: pins.direction,
            value: value as u16 & pins.direction,
        });
    }
}
