//! Low-level FTDI device handle.
//!
//! [`FtdiDevice`] wraps a [`Transport`] for one port and provides the SIO
//! vendor requests, chunked bulk writes and a buffered, header-stripping
//! reader. It knows nothing about bit modes; [`Port`](crate::Port) layers the
//! mode state machine on top.
//!
//! A handle whose transport reports a disconnect is poisoned: every later
//! call fails with [`TransportError::Disconnected`] without touching USB.

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use crate::constants::*;
use crate::error::{Error, ProtocolViolation, Result, TransportError};
use crate::frame::{FrameCodec, LineErrors};
use crate::port::PortOptions;
use crate::transport::Transport;
use crate::types::{ChipType, FlowControl, Interface, ModemStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Open,
    Disconnected,
    Closed,
}

/// An opened FTDI port.
pub struct FtdiDevice<T: Transport> {
    transport: T,
    chip_type: ChipType,
    interface: Interface,
    usb_index: u16,
    codec: FrameCodec,

    read_timeout: Duration,
    write_timeout: Duration,
    read_chunksize: usize,
    write_chunksize: usize,

    // Payload bytes received but not yet handed out
    rx: VecDeque<u8>,
    last_status: Option<ModemStatus>,
    line_errors: LineErrors,

    state: HandleState,
}

impl<T: Transport> std::fmt::Debug for FtdiDevice<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtdiDevice")
            .field("chip_type", &self.chip_type)
            .field("interface", &self.interface)
            .field("max_packet_size", &self.codec.max_packet_size())
            .field("buffered", &self.rx.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// ---- Construction ----

impl<T: Transport> FtdiDevice<T> {
    /// Wrap a transport bound to `interface` of a `chip_type` device.
    pub fn new(
        transport: T,
        chip_type: ChipType,
        interface: Interface,
        options: &PortOptions,
    ) -> Result<Self> {
        if interface.index() >= chip_type.port_count() {
            return Err(Error::InvalidArgument("chip does not have the requested port"));
        }
        if options.read_chunksize == 0 || options.write_chunksize == 0 {
            return Err(Error::InvalidArgument("chunk sizes must be non-zero"));
        }
        let codec = FrameCodec::new(transport.max_packet_size())?;

        Ok(Self {
            transport,
            chip_type,
            interface,
            usb_index: interface.config().usb_index,
            codec,
            read_timeout: options.read_timeout,
            write_timeout: options.write_timeout,
            read_chunksize: options.read_chunksize,
            write_chunksize: options.write_chunksize,
            rx: VecDeque::new(),
            last_status: None,
            line_errors: LineErrors::NONE,
            state: HandleState::Open,
        })
    }

    /// The detected FTDI chip type.
    pub fn chip_type(&self) -> ChipType {
        self.chip_type
    }

    /// The port this handle talks to.
    pub fn interface(&self) -> Interface {
        self.interface
    }

    /// The maximum USB packet size for this port.
    pub fn max_packet_size(&self) -> usize {
        self.codec.max_packet_size()
    }

    /// Shared access to the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Whether the handle can still be used.
    pub fn is_open(&self) -> bool {
        self.state == HandleState::Open
    }

    /// Release the transport. All later calls fail with a protocol error.
    pub fn close(&mut self) {
        if self.state != HandleState::Closed {
            self.transport.close();
            self.rx.clear();
            self.state = HandleState::Closed;
            log::debug!("closed {:?} port {:?}", self.chip_type, self.interface);
        }
    }
}

// ---- Handle state ----

impl<T: Transport> FtdiDevice<T> {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self.state {
            HandleState::Open => Ok(()),
            HandleState::Disconnected => Err(TransportError::Disconnected.into()),
            HandleState::Closed => Err(ProtocolViolation::Closed.into()),
        }
    }

    /// Poison the handle if `result` reports a disconnect.
    fn track<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(ref e) = result {
            if e.is_disconnect() && self.state == HandleState::Open {
                log::warn!(
                    "{:?} port {:?} disconnected; handle is now unusable",
                    self.chip_type,
                    self.interface
                );
                self.state = HandleState::Disconnected;
                self.rx.clear();
            }
        }
        result
    }
}

// ---- Control requests ----

impl<T: Transport> FtdiDevice<T> {
    /// Send a vendor OUT request addressed to this port.
    pub(crate) fn control_out(&mut self, request: u8, value: u16) -> Result<()> {
        self.control_out_index(request, value, self.usb_index)
    }

    /// Send a vendor OUT request with an explicit index field.
    pub(crate) fn control_out_index(&mut self, request: u8, value: u16, index: u16) -> Result<()> {
        self.ensure_open()?;
        log::trace!("control out req={request:#04x} value={value:#06x} index={index:#06x}");
        let result = self.transport.control_out(request, value, index, &[]);
        self.track(result).map(|_| ())
    }

    /// Send a vendor IN request addressed to this port, requiring `length` bytes back.
    pub(crate) fn control_in(&mut self, request: u8, value: u16, length: u16) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let result = self
            .transport
            .control_in(request, value, self.usb_index, length);
        let data = self.track(result)?;
        if data.len() < length as usize {
            return Err(ProtocolViolation::ResponseLength {
                expected: length as usize,
                received: data.len(),
            }
            .into());
        }
        Ok(data)
    }

    /// Perform an SIO reset of the port. The software read buffer is discarded.
    pub fn usb_reset(&mut self) -> Result<()> {
        self.control_out(SIO_RESET_REQUEST, SIO_RESET_SIO)?;
        self.rx.clear();
        Ok(())
    }

    /// Flush the receive (RX) buffer.
    ///
    /// Clears data in the chip's RX FIFO (data flowing from the serial
    /// device toward the host) and the internal software read buffer.
    pub fn purge_rx(&mut self) -> Result<()> {
        self.control_out(SIO_RESET_REQUEST, SIO_TCIFLUSH)?;
        self.rx.clear();
        Ok(())
    }

    /// Flush the transmit (TX) FIFO.
    pub fn purge_tx(&mut self) -> Result<()> {
        self.control_out(SIO_RESET_REQUEST, SIO_TCOFLUSH)
    }

    /// Flush both directions.
    pub fn purge_all(&mut self) -> Result<()> {
        self.purge_rx()?;
        self.purge_tx()
    }

    /// Program the bit mode register. `mode` is the wire mode byte.
    pub(crate) fn set_bitmode_raw(&mut self, direction: u8, mode: u8) -> Result<()> {
        let value = direction as u16 | (mode as u16) << 8;
        self.control_out(SIO_SET_BITMODE_REQUEST, value)
    }

    /// Program the baud rate generator with an already-encoded divisor.
    pub(crate) fn set_baud_divisor(&mut self, value: u16, index: u16) -> Result<()> {
        self.control_out_index(SIO_SET_BAUDRATE_REQUEST, value, index)
    }

    /// Program the data characteristics register.
    pub(crate) fn set_data_characteristics(&mut self, value: u16) -> Result<()> {
        self.control_out(SIO_SET_DATA_REQUEST, value)
    }

    /// Set the flow control mode.
    pub fn set_flow_control(&mut self, flow: FlowControl) -> Result<()> {
        let (value, mode) = match flow {
            FlowControl::Disabled => (0, SIO_DISABLE_FLOW_CTRL),
            FlowControl::RtsCts => (0, SIO_RTS_CTS_HS),
            FlowControl::DtrDsr => (0, SIO_DTR_DSR_HS),
            FlowControl::XonXoff { xon, xoff } => {
                (xon as u16 | (xoff as u16) << 8, SIO_XON_XOFF_HS)
            }
        };
        self.control_out_index(SIO_SET_FLOW_CTRL_REQUEST, value, mode | self.usb_index)
    }

    /// Set the DTR (Data Terminal Ready) line state.
    pub fn set_dtr(&mut self, state: bool) -> Result<()> {
        let val = if state {
            SIO_SET_DTR_HIGH
        } else {
            SIO_SET_DTR_LOW
        };
        self.control_out(SIO_SET_MODEM_CTRL_REQUEST, val)
    }

    /// Set the RTS (Request To Send) line state.
    pub fn set_rts(&mut self, state: bool) -> Result<()> {
        let val = if state {
            SIO_SET_RTS_HIGH
        } else {
            SIO_SET_RTS_LOW
        };
        self.control_out(SIO_SET_MODEM_CTRL_REQUEST, val)
    }

    /// Set both DTR and RTS lines in a single USB transfer.
    pub fn set_dtr_rts(&mut self, dtr: bool, rts: bool) -> Result<()> {
        let mut val = if dtr {
            SIO_SET_DTR_HIGH
        } else {
            SIO_SET_DTR_LOW
        };
        val |= if rts {
            SIO_SET_RTS_HIGH
        } else {
            SIO_SET_RTS_LOW
        };
        self.control_out(SIO_SET_MODEM_CTRL_REQUEST, val)
    }

    /// Set the special event character.
    ///
    /// When `enable` is true and this character is received, the chip
    /// immediately returns the data up to and including this character.
    pub fn set_event_char(&mut self, ch: u8, enable: bool) -> Result<()> {
        let val = (ch as u16) | if enable { 1 << 8 } else { 0 };
        self.control_out(SIO_SET_EVENT_CHAR_REQUEST, val)
    }

    /// Set the error character, inserted into the stream on parity errors.
    pub fn set_error_char(&mut self, ch: u8, enable: bool) -> Result<()> {
        let val = (ch as u16) | if enable { 1 << 8 } else { 0 };
        self.control_out(SIO_SET_ERROR_CHAR_REQUEST, val)
    }

    /// Poll the modem status, bypassing the bulk-IN stream.
    pub fn poll_modem_status(&mut self) -> Result<ModemStatus> {
        let data = self.control_in(SIO_POLL_MODEM_STATUS_REQUEST, 0, 2)?;
        Ok(ModemStatus::from_bytes(data[0], data[1]))
    }

    /// Program the latency timer (1-255 ms).
    pub(crate) fn write_latency_timer(&mut self, latency_ms: u8) -> Result<()> {
        if latency_ms < 1 {
            return Err(Error::InvalidArgument("latency must be between 1 and 255"));
        }
        self.control_out(SIO_SET_LATENCY_TIMER_REQUEST, latency_ms as u16)
    }

    /// Read the latency timer back from the chip.
    pub fn read_latency_timer(&mut self) -> Result<u8> {
        Ok(self.control_in(SIO_GET_LATENCY_TIMER_REQUEST, 0, 1)?[0])
    }

    /// Sample the pins directly, bypassing the read buffer.
    pub fn read_pins(&mut self) -> Result<u8> {
        Ok(self.control_in(SIO_READ_PINS_REQUEST, 0, 1)?[0])
    }
}

// ---- Timeouts / chunk sizes ----

impl<T: Transport> FtdiDevice<T> {
    /// Set the deadline for a complete read.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    /// Set the timeout for each bulk write.
    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
    }

    /// Get the current read timeout.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Get the current write timeout.
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Set the number of bytes requested per bulk read.
    pub fn set_read_chunksize(&mut self, chunksize: usize) -> Result<()> {
        if chunksize == 0 {
            return Err(Error::InvalidArgument("chunk size must be non-zero"));
        }
        self.read_chunksize = chunksize;
        Ok(())
    }

    /// Get the current read chunk size.
    pub fn read_chunksize(&self) -> usize {
        self.read_chunksize
    }

    /// Set the maximum number of bytes per bulk write.
    pub fn set_write_chunksize(&mut self, chunksize: usize) -> Result<()> {
        if chunksize == 0 {
            return Err(Error::InvalidArgument("chunk size must be non-zero"));
        }
        self.write_chunksize = chunksize;
        Ok(())
    }

    /// Get the current write chunk size.
    pub fn write_chunksize(&self) -> usize {
        self.write_chunksize
    }
}

// ---- Data transfer ----

impl<T: Transport> FtdiDevice<T> {
    /// Write all bytes to the device.
    ///
    /// Data is sent in packet-aligned chunks of at most
    /// [`write_chunksize`](Self::write_chunksize) bytes.
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.ensure_open()?;
        log::trace!("bulk out {} bytes: {:02x?}", buf.len(), &buf[..buf.len().min(32)]);

        let codec = self.codec;
        for chunk in codec.chunks(buf, self.write_chunksize) {
            let mut offset = 0;
            while offset < chunk.len() {
                let result = self
                    .transport
                    .bulk_write(&chunk[offset..], self.write_timeout);
                let n = self.track(result)?;
                if n == 0 {
                    return Err(TransportError::WriteZero.into());
                }
                offset += n;
            }
        }
        Ok(())
    }

    /// Number of received payload bytes waiting in the software buffer.
    pub fn buffered(&self) -> usize {
        self.rx.len()
    }

    /// Discard the software read buffer without touching the chip.
    pub fn clear_buffer(&mut self) {
        self.rx.clear();
    }

    /// Take the bytes currently held in the software buffer.
    pub(crate) fn take_buffered(&mut self) -> Vec<u8> {
        self.rx.drain(..).collect()
    }

    /// Status header of the most recent bulk-IN packet.
    pub fn last_status(&self) -> Option<ModemStatus> {
        self.last_status
    }

    /// Line errors seen since the last call, clearing them.
    pub fn take_line_errors(&mut self) -> LineErrors {
        std::mem::take(&mut self.line_errors)
    }

    /// Issue one bulk read and append its payload to the buffer.
    fn fill(&mut self, timeout: Duration) -> Result<usize> {
        let result = self.transport.bulk_read(self.read_chunksize, timeout);
        let raw = self.track(result)?;

        let before = self.rx.len();
        let mut payload = Vec::with_capacity(raw.len());
        let (status, errors, _) = self.codec.decode_into(&raw, &mut payload)?;
        self.rx.extend(payload);
        self.last_status = Some(status);
        self.line_errors |= errors;

        Ok(self.rx.len() - before)
    }

    /// Read whatever payload is available, waiting at most one bulk read.
    ///
    /// Returns 0 when the chip had nothing to send (status-only packets or
    /// a bulk timeout).
    pub fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        if buf.is_empty() {
            return Ok(0);
        }

        if self.rx.is_empty() {
            match self.fill(self.read_timeout) {
                Ok(_) => {}
                Err(Error::Timeout) => return Ok(0),
                Err(e) => return Err(e),
            }
        }

        let n = self.rx.len().min(buf.len());
        for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    /// Read exactly `len` payload bytes.
    ///
    /// Packets are concatenated across as many bulk reads as needed until
    /// the read timeout expires. Surplus bytes stay buffered for the next
    /// read. If the deadline passes with nothing received the result is
    /// [`Error::Timeout`]; with only part received it is
    /// [`Error::PartialRead`] and the partial data is dropped.
    pub fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let deadline = Instant::now() + self.read_timeout;

        while self.rx.len() < len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.fill(remaining) {
                Ok(_) => {}
                Err(Error::Timeout) => break,
                Err(e) => {
                    self.rx.clear();
                    return Err(e);
                }
            }
        }

        if self.rx.len() >= len {
            return Ok(self.rx.drain(..len).collect());
        }

        let received = self.rx.len();
        self.rx.clear();
        if received == 0 {
            log::debug!("read of {len} bytes timed out");
            Err(Error::Timeout)
        } else {
            log::warn!("read of {len} bytes timed out after {received}");
            Err(Error::PartialRead {
                expected: len,
                received,
            })
        }
    }
}

// ---- std::io trait implementations ----

impl<T: Transport> io::Read for FtdiDevice<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_available(buf).map_err(io::Error::other)
    }
}

impl<T: Transport> io::Write for FtdiDevice<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_all(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
