//! `embedded-hal` 1.0 and `embedded-io` trait implementations.
//!
//! Enable the `embedded-hal` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! ftdi-engine = { version = "0.1", features = ["embedded-hal"] }
//! ```
//!
//! # Provided implementations
//!
//! | Trait | Type | Notes |
//! |-------|------|-------|
//! | `embedded_hal::spi::SpiDevice` | [`FtdiSpiDevice`] | Wraps a [`Port`] + [`SpiBus`] |
//! | `embedded_io::Read` | [`FtdiDevice`] | Serial read |
//! | `embedded_io::Write` | [`FtdiDevice`] | Serial write |

use std::time::Duration;

use crate::device::FtdiDevice;
use crate::error::{Error, ErrorKind, Result, TransportError};
use crate::mpsse::spi::{SpiBus, SpiConfig};
use crate::mpsse::CommandBuffer;
use crate::port::{Port, PortMode, PortOptions};
use crate::transport::{NusbTransport, Transport};
use crate::types::Interface;

// ---- Error conversion ----

impl embedded_hal::spi::Error for Error {
    fn kind(&self) -> embedded_hal::spi::ErrorKind {
        // No SPI error kind describes a USB or protocol failure
        embedded_hal::spi::ErrorKind::Other
    }
}

impl embedded_io::Error for Error {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            Error::Timeout | Error::PartialRead { .. } => embedded_io::ErrorKind::TimedOut,
            Error::Transport(TransportError::WriteZero) => embedded_io::ErrorKind::WriteZero,
            Error::Transport(TransportError::Disconnected) => embedded_io::ErrorKind::NotConnected,
            Error::InvalidArgument(_) => embedded_io::ErrorKind::InvalidInput,
            _ => match Error::kind(self) {
                ErrorKind::UnsupportedConfig => embedded_io::ErrorKind::Unsupported,
                _ => embedded_io::ErrorKind::Other,
            },
        }
    }
}

// ---- embedded-io for FtdiDevice ----

impl<T: Transport> embedded_io::ErrorType for FtdiDevice<T> {
    type Error = Error;
}

impl<T: Transport> embedded_io::Read for FtdiDevice<T> {
    /// Blocks until at least one byte arrives or the read timeout expires.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.read_available(buf)? {
            0 => Err(Error::Timeout),
            n => Ok(n),
        }
    }
}

impl<T: Transport> embedded_io::Write for FtdiDevice<T> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        // Bulk writes complete before write_all returns
        Ok(())
    }
}

// ---- embedded-hal SPI ----

/// A [`Port`] in MPSSE mode bundled with an [`SpiBus`], implementing
/// `embedded_hal::spi::SpiDevice`.
///
/// Each transaction is sent as one command batch with CS held asserted
/// throughout. A `DelayNs` operation flushes the batch so far, sleeps, and
/// continues with CS still asserted.
///
/// # Example
///
/// ```no_run
/// use ftdi_engine::hal::FtdiSpiDevice;
/// use ftdi_engine::mpsse::spi::{SpiConfig, SpiMode};
///
/// let mut flash = FtdiSpiDevice::open(0x0403, 0x6014, SpiConfig::new(SpiMode::Mode0, 1_000_000))?;
///
/// use embedded_hal::spi::SpiDevice;
/// let mut id = [0u8; 4];
/// flash.transfer(&mut id, &[0x9F, 0, 0, 0])?;
/// # Ok::<(), ftdi_engine::Error>(())
/// ```
#[derive(Debug)]
pub struct FtdiSpiDevice<T: Transport> {
    port: Port<T>,
    bus: SpiBus,
}

impl FtdiSpiDevice<NusbTransport> {
    /// Open port A of the first matching device and set it up for SPI.
    pub fn open(vendor: u16, product: u16, config: SpiConfig) -> Result<Self> {
        let port = Port::open(vendor, product, Interface::A, PortOptions::default())?;
        Self::new(port, config)
    }
}

impl<T: Transport> FtdiSpiDevice<T> {
    /// Switch `port` to MPSSE if needed and configure the SPI pins.
    pub fn new(mut port: Port<T>, config: SpiConfig) -> Result<Self> {
        if port.mode() != PortMode::Mpsse {
            port.set_mode(PortMode::Mpsse, 0)?;
        }
        let bus = SpiBus::new(&mut port, config)?;
        Ok(Self { port, bus })
    }

    /// Create from an already configured port and bus.
    pub fn from_parts(port: Port<T>, bus: SpiBus) -> Self {
        Self { port, bus }
    }

    /// Borrow the port.
    pub fn port(&self) -> &Port<T> {
        &self.port
    }

    /// Mutably borrow the port.
    pub fn port_mut(&mut self) -> &mut Port<T> {
        &mut self.port
    }

    /// The bus settings.
    pub fn bus(&self) -> &SpiBus {
        &self.bus
    }

    /// Decompose into the underlying parts.
    pub fn into_parts(self) -> (Port<T>, SpiBus) {
        (self.port, self.bus)
    }

    /// Send `cmd` and scatter its response into the operations listed in
    /// `readers`.
    fn flush(
        &mut self,
        cmd: &mut CommandBuffer,
        operations: &mut [embedded_hal::spi::Operation<'_, u8>],
        readers: &mut Vec<usize>,
    ) -> Result<()> {
        use embedded_hal::spi::Operation;

        let response = self.port.transfer(cmd)?;
        let mut offset = 0;
        for &i in readers.iter() {
            match &mut operations[i] {
                Operation::Read(buf) | Operation::TransferInPlace(buf) => {
                    buf.copy_from_slice(&response[offset..offset + buf.len()]);
                    offset += buf.len();
                }
                Operation::Transfer(read, write) => {
                    read.copy_from_slice(&response[offset..offset + read.len()]);
                    offset += read.len().max(write.len());
                }
                Operation::Write(_) | Operation::DelayNs(_) => {}
            }
        }
        cmd.clear();
        readers.clear();
        Ok(())
    }

    fn run(&mut self, operations: &mut [embedded_hal::spi::Operation<'_, u8>]) -> Result<()> {
        use embedded_hal::spi::Operation;

        let shift = self.bus.shift_config();
        let mut cmd = CommandBuffer::new();
        let mut readers = Vec::new();
        self.bus.queue_cs_assert(self.port.pins(), &mut cmd);

        for i in 0..operations.len() {
            match &operations[i] {
                Operation::Read(buf) => {
                    if !buf.is_empty() {
                        cmd.shift_in(shift, buf.len());
                        readers.push(i);
                    }
                }
                Operation::Write(buf) => {
                    cmd.shift_out(shift, buf);
                }
                Operation::Transfer(read, write) => {
                    let len = read.len().max(write.len());
                    if len != 0 {
                        let mut out = write.to_vec();
                        out.resize(len, 0);
                        cmd.shift_inout(shift, &out);
                        readers.push(i);
                    }
                }
                Operation::TransferInPlace(buf) => {
                    if !buf.is_empty() {
                        cmd.shift_inout(shift, buf);
                        readers.push(i);
                    }
                }
                Operation::DelayNs(ns) => {
                    let delay = Duration::from_nanos(*ns as u64);
                    self.flush(&mut cmd, operations, &mut readers)?;
                    std::thread::sleep(delay);
                }
            }
        }

        self.bus.queue_cs_deassert(self.port.pins(), &mut cmd);
        self.flush(&mut cmd, operations, &mut readers)
    }
}

impl<T: Transport> embedded_hal::spi::ErrorType for FtdiSpiDevice<T> {
    type Error = Error;
}

impl<T: Transport> embedded_hal::spi::SpiDevice for FtdiSpiDevice<T> {
    fn transaction(
        &mut self,
        operations: &mut [embedded_hal::spi::Operation<'_, u8>],
    ) -> Result<()> {
        let result = self.run(operations);
        if result.is_err() && self.port.device().is_open() {
            // Release CS; the original error is what the caller needs
            if let Err(e) = self.bus.cs_deassert(&mut self.port) {
                log::warn!("failed to release CS after error: {e}");
            }
        }
        result
    }
}
