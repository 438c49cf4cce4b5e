//! In-memory FTDI chip for testing without hardware.
//!
//! [`SimulatedChip`] implements [`Transport`] for one port. It answers the
//! SIO vendor requests, runs an MPSSE command interpreter, echoes samples in
//! synchronous bitbang, and packetises everything it sends to the host the
//! way the silicon does: each bulk-IN packet starts with two status bytes.
//!
//! Clones share state, so a test can keep a handle for inspection and fault
//! injection after moving another into a [`Port`](crate::Port).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result, TransportError};
use crate::frame::{LineErrors, STATUS_LEN};
use crate::mpsse::BitOrder;
use crate::transport::Transport;
use crate::types::ChipType;

/// Modem status byte reported in every packet (low nibble fixed at 1).
const DEFAULT_MODEM_STATUS: u8 = 0x01;

/// Line status byte when idle: transmitter holding and shift registers empty.
const IDLE_LINE_STATUS: u8 = LSR_THRE | LSR_TEMT;

const BITMODE_RESET: u8 = 0x00;
const BITMODE_ASYNC: u8 = 0x01;
const BITMODE_MPSSE: u8 = 0x02;
const BITMODE_SYNC: u8 = 0x04;

/// One vendor OUT request as seen by the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    /// Request code.
    pub request: u8,
    /// `wValue`.
    pub value: u16,
    /// `wIndex`.
    pub index: u16,
}

#[derive(Debug)]
struct SimState {
    max_packet_size: usize,
    payload_per_packet: usize,
    connected: bool,
    empty_polls: usize,
    forced_errors: LineErrors,
    modem_status: u8,
    uart_echo: bool,

    bitmode: (u8, u8),
    latency: u8,
    baud: (u16, u16),
    line: u16,
    control_log: Vec<ControlRequest>,
    bulk_log: Vec<u8>,

    // Payload waiting to go to the host
    to_host: VecDeque<u8>,
    // Unparsed MPSSE command bytes
    pending: Vec<u8>,

    input_pins: u16,
    din: VecDeque<bool>,
    bitbang_out: u8,

    loopback: bool,
    divisor: u16,
    low: (u8, u8),
    high: (u8, u8),
}

/// A simulated FTDI port.
#[derive(Debug, Clone)]
pub struct SimulatedChip {
    chip: ChipType,
    state: Rc<RefCell<SimState>>,
}

impl SimulatedChip {
    /// A simulated port of `chip` with its usual packet size.
    pub fn new(chip: ChipType) -> Self {
        let mps = chip.default_max_packet_size();
        let state = SimState {
            max_packet_size: mps,
            payload_per_packet: mps - STATUS_LEN,
            connected: true,
            empty_polls: 0,
            forced_errors: LineErrors::NONE,
            modem_status: DEFAULT_MODEM_STATUS,
            uart_echo: false,
            bitmode: (0, BITMODE_RESET),
            latency: 16,
            baud: (0, 0),
            line: 0,
            control_log: Vec::new(),
            bulk_log: Vec::new(),
            to_host: VecDeque::new(),
            pending: Vec::new(),
            input_pins: 0,
            din: VecDeque::new(),
            bitbang_out: 0,
            loopback: false,
            divisor: 0,
            low: (0, 0),
            high: (0, 0),
        };
        Self {
            chip,
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// The simulated chip type.
    pub fn chip_type(&self) -> ChipType {
        self.chip
    }

    // ---- Stimulus ----

    /// Queue bytes for the host as if received on the UART.
    pub fn queue_rx(&self, data: &[u8]) {
        self.state.borrow_mut().to_host.extend(data);
    }

    /// Echo every byte written in UART mode back to the host.
    pub fn set_uart_echo(&self, enable: bool) {
        self.state.borrow_mut().uart_echo = enable;
    }

    /// Levels presented on pins that are not outputs (bit 8+ = high byte).
    pub fn set_input_pins(&self, pins: u16) {
        self.state.borrow_mut().input_pins = pins;
    }

    /// Bits the target drives on DI/TDO, consumed one per clock by reading
    /// shifts. Once exhausted DI reads as 0.
    pub fn queue_input_bits(&self, bits: &[bool]) {
        self.state.borrow_mut().din.extend(bits);
    }

    /// Queue whole bytes on DI in the order a shift with `order` consumes
    /// them, so the matching read returns the same bytes.
    pub fn queue_input_bytes(&self, bytes: &[u8], order: BitOrder) {
        let mut state = self.state.borrow_mut();
        for &b in bytes {
            for i in 0..8 {
                let bit = match order {
                    BitOrder::MsbFirst => b >> (7 - i) & 1,
                    BitOrder::LsbFirst => b >> i & 1,
                };
                state.din.push_back(bit != 0);
            }
        }
    }

    // ---- Packetisation and faults ----

    /// Cap the payload carried by each bulk-IN packet.
    ///
    /// Values below the packet payload make every packet short, so each
    /// bulk read returns a single packet.
    pub fn set_max_payload_per_packet(&self, n: usize) {
        let mut state = self.state.borrow_mut();
        state.payload_per_packet = n.clamp(1, state.max_packet_size - STATUS_LEN);
    }

    /// Answer the next `n` bulk reads with status-only packets.
    pub fn set_empty_polls(&self, n: usize) {
        self.state.borrow_mut().empty_polls = n;
    }

    /// Report `errors` in the line status of the next data-carrying read.
    pub fn inject_line_errors(&self, errors: LineErrors) {
        self.state.borrow_mut().forced_errors = errors;
    }

    /// Set the modem status byte reported in packets and polls.
    pub fn set_modem_status(&self, status: u8) {
        self.state.borrow_mut().modem_status = status;
    }

    /// Unplug the device. Every transfer fails until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.state.borrow_mut().connected = false;
    }

    /// Plug the device back in.
    pub fn reconnect(&self) {
        self.state.borrow_mut().connected = true;
    }

    // ---- Inspection ----

    /// Current (direction, mode) of the bit mode register.
    pub fn bitmode(&self) -> (u8, u8) {
        self.state.borrow().bitmode
    }

    /// Every vendor OUT request received so far.
    pub fn control_log(&self) -> Vec<ControlRequest> {
        self.state.borrow().control_log.clone()
    }

    /// Every byte written to the bulk-OUT endpoint so far.
    pub fn bulk_log(&self) -> Vec<u8> {
        self.state.borrow().bulk_log.clone()
    }

    /// Forget logged bulk-OUT traffic.
    pub fn clear_bulk_log(&self) {
        self.state.borrow_mut().bulk_log.clear();
    }

    /// Last (value, index) written to the baud rate generator.
    pub fn baud_divisor(&self) -> (u16, u16) {
        self.state.borrow().baud
    }

    /// Last value written to the data characteristics register.
    pub fn line_data(&self) -> u16 {
        self.state.borrow().line
    }

    /// Current latency timer.
    pub fn latency(&self) -> u8 {
        self.state.borrow().latency
    }

    /// Whether MPSSE loopback is on.
    pub fn mpsse_loopback(&self) -> bool {
        self.state.borrow().loopback
    }

    /// Last MPSSE clock divisor.
    pub fn mpsse_divisor(&self) -> u16 {
        self.state.borrow().divisor
    }

    /// MPSSE GPIO as (value, direction), low byte in bits 0-7.
    pub fn mpsse_pins(&self) -> (u16, u16) {
        let state = self.state.borrow();
        (
            state.low.0 as u16 | (state.high.0 as u16) << 8,
            state.low.1 as u16 | (state.high.1 as u16) << 8,
        )
    }

    fn check_connected(&self) -> Result<()> {
        if self.state.borrow().connected {
            Ok(())
        } else {
            Err(TransportError::Disconnected.into())
        }
    }
}

impl SimState {
    fn sample_low(&self) -> u8 {
        let (value, dir) = self.low;
        (value & dir) | (self.input_pins as u8 & !dir)
    }

    fn sample_high(&self) -> u8 {
        let (value, dir) = self.high;
        (value & dir) | ((self.input_pins >> 8) as u8 & !dir)
    }

    fn sample_bitbang(&self) -> u8 {
        let dir = self.bitmode.0;
        (self.bitbang_out & dir) | (self.input_pins as u8 & !dir)
    }

    fn control_out(&mut self, request: u8, value: u16) {
        match request {
            SIO_RESET_REQUEST => match value {
                SIO_RESET_SIO => {
                    self.to_host.clear();
                    self.pending.clear();
                }
                SIO_TCIFLUSH => self.to_host.clear(),
                SIO_TCOFLUSH => self.pending.clear(),
                _ => {}
            },
            SIO_SET_BITMODE_REQUEST => {
                self.bitmode = (value as u8, (value >> 8) as u8);
                self.pending.clear();
            }
            SIO_SET_DATA_REQUEST => self.line = value,
            SIO_SET_LATENCY_TIMER_REQUEST => self.latency = value as u8,
            _ => {}
        }
    }

    fn bulk_out(&mut self, chip: ChipType, data: &[u8]) {
        match self.bitmode.1 {
            BITMODE_ASYNC => {
                if let Some(&last) = data.last() {
                    self.bitbang_out = last;
                }
            }
            BITMODE_SYNC => {
                for &b in data {
                    let sample = self.sample_bitbang();
                    self.to_host.push_back(sample);
                    self.bitbang_out = b;
                }
            }
            BITMODE_MPSSE => {
                self.pending.extend_from_slice(data);
                self.run_mpsse(chip);
            }
            _ => {
                if self.uart_echo {
                    self.to_host.extend(data);
                }
            }
        }
    }

    /// Execute every complete command in `pending`.
    fn run_mpsse(&mut self, chip: ChipType) {
        let mut pos = 0;
        while pos < self.pending.len() {
            match self.mpsse_command(chip, pos) {
                Some(used) => pos += used,
                // Incomplete; wait for more bytes
                None => break,
            }
        }
        self.pending.drain(..pos);
    }

    /// Execute the command at `pos`; returns its length, or `None` if it is
    /// not complete yet.
    fn mpsse_command(&mut self, chip: ChipType, pos: usize) -> Option<usize> {
        let op = self.pending[pos];
        let args = [
            self.pending.get(pos + 1).copied(),
            self.pending.get(pos + 2).copied(),
        ];
        let arg = |n: usize| args[n - 1];

        if op & 0x80 == 0 {
            return self.mpsse_shift(op, pos);
        }

        let h_type = chip.is_h_type();
        let used = match op {
            mpsse::SET_BITS_LOW => {
                self.low = (arg(1)?, arg(2)?);
                3
            }
            mpsse::SET_BITS_HIGH => {
                self.high = (arg(1)?, arg(2)?);
                3
            }
            mpsse::GET_BITS_LOW => {
                let v = self.sample_low();
                self.to_host.push_back(v);
                1
            }
            mpsse::GET_BITS_HIGH => {
                let v = self.sample_high();
                self.to_host.push_back(v);
                1
            }
            mpsse::LOOPBACK_START => {
                self.loopback = true;
                1
            }
            mpsse::LOOPBACK_END => {
                self.loopback = false;
                1
            }
            mpsse::TCK_DIVISOR => {
                self.divisor = u16::from_le_bytes([arg(1)?, arg(2)?]);
                3
            }
            mpsse::SEND_IMMEDIATE | mpsse::WAIT_ON_HIGH | mpsse::WAIT_ON_LOW => 1,
            mpsse::EN_DIV_5 | mpsse::DIS_DIV_5 if h_type => 1,
            mpsse::EN_3_PHASE | mpsse::DIS_3_PHASE if h_type => 1,
            mpsse::EN_ADAPTIVE | mpsse::DIS_ADAPTIVE if chip.has_adaptive_clocking() => 1,
            mpsse::CLK_BITS if h_type => {
                arg(1)?;
                2
            }
            mpsse::CLK_BYTES if h_type => {
                arg(2)?;
                3
            }
            _ => {
                self.bad_command(op);
                1
            }
        };
        Some(used)
    }

    fn bad_command(&mut self, op: u8) {
        self.to_host.extend([mpsse::BAD_COMMAND, op]);
    }

    /// Data and TMS shifts (opcodes below 0x80).
    fn mpsse_shift(&mut self, op: u8, pos: usize) -> Option<usize> {
        let write = op & mpsse::DO_WRITE != 0;
        let read = op & mpsse::DO_READ != 0;
        let bits = op & mpsse::BITMODE != 0;
        let tms = op & mpsse::WRITE_TMS != 0;
        let lsb = op & mpsse::LSB != 0;

        let valid = if tms { bits && !write } else { write || read };
        if !valid {
            self.bad_command(op);
            return Some(1);
        }

        let buf = &self.pending[pos..];
        if tms || bits {
            let count = *buf.get(1)? as usize + 1;
            let has_data = tms || write;
            let data = if has_data { *buf.get(2)? } else { 0 };
            let used = if has_data { 3 } else { 2 };
            if count > 8 || (tms && count > 7) {
                self.bad_command(op);
                return Some(used);
            }

            let mut reg = 0u8;
            for i in 0..count {
                let out = if tms {
                    // TDI is held at bit 7 for the whole TMS burst
                    data & 0x80 != 0
                } else if lsb {
                    data >> i & 1 != 0
                } else {
                    data >> (7 - i) & 1 != 0
                };
                if read {
                    let bit = self.input_bit(out && (write || tms));
                    reg = if lsb || tms {
                        (reg >> 1) | (bit as u8) << 7
                    } else {
                        (reg << 1) | bit as u8
                    };
                }
            }
            if read {
                self.to_host.push_back(reg);
            }
            return Some(used);
        }

        let len = u16::from_le_bytes([*buf.get(1)?, *buf.get(2)?]) as usize + 1;
        let used = 3 + if write { len } else { 0 };
        if buf.len() < used {
            return None;
        }
        if read {
            let out: Vec<u8> = if write {
                buf[3..used].to_vec()
            } else {
                vec![0; len]
            };
            for byte in out {
                let mut reg = 0u8;
                for i in 0..8 {
                    let o = if lsb { byte >> i & 1 } else { byte >> (7 - i) & 1 };
                    let bit = self.input_bit(o != 0);
                    reg = if lsb {
                        (reg >> 1) | (bit as u8) << 7
                    } else {
                        (reg << 1) | bit as u8
                    };
                }
                self.to_host.push_back(reg);
            }
        }
        Some(used)
    }

    /// Level seen on DI for one clock; DO in loopback.
    fn input_bit(&mut self, out: bool) -> bool {
        if self.loopback {
            out
        } else {
            self.din.pop_front().unwrap_or(false)
        }
    }

    /// Build one bulk-IN transfer of at most `max_len` bytes.
    fn bulk_in(&mut self, max_len: usize) -> Option<Vec<u8>> {
        let mps = self.max_packet_size;
        if self.empty_polls > 0 {
            self.empty_polls -= 1;
            return Some(vec![self.modem_status, IDLE_LINE_STATUS]);
        }
        if self.to_host.is_empty() {
            return None;
        }

        let line = IDLE_LINE_STATUS | std::mem::take(&mut self.forced_errors).bits();
        let full_payload = mps - STATUS_LEN;
        let mut raw = Vec::with_capacity(max_len.max(mps));
        loop {
            let n = self.to_host.len().min(self.payload_per_packet);
            raw.push(self.modem_status);
            raw.push(line);
            raw.extend(self.to_host.drain(..n));
            // A short packet ends the transfer
            if n < full_payload || self.to_host.is_empty() || raw.len() + mps > max_len {
                break;
            }
        }
        Some(raw)
    }
}

impl Transport for SimulatedChip {
    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize> {
        self.check_connected()?;
        let mut state = self.state.borrow_mut();
        state.control_log.push(ControlRequest {
            request,
            value,
            index,
        });
        if request == SIO_SET_BAUDRATE_REQUEST {
            state.baud = (value, index);
        } else {
            state.control_out(request, value);
        }
        Ok(data.len())
    }

    fn control_in(&mut self, request: u8, _value: u16, _index: u16, length: u16) -> Result<Vec<u8>> {
        self.check_connected()?;
        let state = self.state.borrow();
        let mut data = match request {
            SIO_GET_LATENCY_TIMER_REQUEST => vec![state.latency],
            SIO_POLL_MODEM_STATUS_REQUEST => vec![state.modem_status, IDLE_LINE_STATUS],
            SIO_READ_PINS_REQUEST => match state.bitmode.1 {
                BITMODE_MPSSE => vec![state.sample_low()],
                BITMODE_ASYNC | BITMODE_SYNC => vec![state.sample_bitbang()],
                _ => vec![state.input_pins as u8],
            },
            _ => Vec::new(),
        };
        data.truncate(length as usize);
        Ok(data)
    }

    fn bulk_write(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
        self.check_connected()?;
        let mut state = self.state.borrow_mut();
        state.bulk_log.extend_from_slice(data);
        state.bulk_out(self.chip, data);
        Ok(data.len())
    }

    fn bulk_read(&mut self, max_len: usize, _timeout: Duration) -> Result<Vec<u8>> {
        self.check_connected()?;
        self.state
            .borrow_mut()
            .bulk_in(max_len)
            .ok_or(Error::Timeout)
    }

    fn max_packet_size(&self) -> usize {
        self.state.borrow().max_packet_size
    }
}
