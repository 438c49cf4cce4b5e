//! Error types for the ftdi-engine crate.

use crate::mpsse::jtag::TapState;
use crate::port::PortMode;
use crate::types::{ChipType, Interface};

/// The error type for FTDI operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No matching device was found.
    #[error("device not found")]
    NotFound,

    /// The device exists but could not be claimed (kernel driver, another
    /// process, or missing permissions).
    #[error("access denied: {0}; make sure the default FTDI driver is not in use")]
    AccessDenied(String),

    /// USB I/O failure or disconnect.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Nothing arrived before the read deadline. The caller may retry.
    #[error("timed out waiting for the device")]
    Timeout,

    /// The read deadline expired after only part of the expected payload
    /// arrived. The partial data has been discarded.
    #[error("partial read: expected {expected} bytes, received {received}")]
    PartialRead {
        /// Number of payload bytes requested.
        expected: usize,
        /// Number of payload bytes that arrived before the deadline.
        received: usize,
    },

    /// The operation is not valid in the current port or engine state.
    #[error("protocol state error: {0}")]
    ProtocolState(#[from] ProtocolViolation),

    /// The requested configuration cannot be achieved on this silicon.
    #[error("unsupported configuration: {0}")]
    Unsupported(#[from] UnsupportedConfig),

    /// Invalid argument(s) were provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// USB-level failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// An error from the nusb USB layer.
    #[error("USB error: {0}")]
    Usb(nusb::Error),

    /// A USB transfer error other than timeout or disconnect.
    #[error("USB transfer error: {0}")]
    Transfer(nusb::transfer::TransferError),

    /// A descriptor read failed.
    #[error("descriptor error: {0}")]
    Descriptor(#[from] nusb::GetDescriptorError),

    /// The device went away. The handle is unusable from now on.
    #[error("device disconnected")]
    Disconnected,

    /// A bulk-IN packet was too short to hold the 2-byte status header.
    #[error("bulk-IN frame of {len} bytes is shorter than the 2-byte status header")]
    ShortFrame {
        /// Length of the offending frame.
        len: usize,
    },

    /// A bulk write completed with zero bytes transferred.
    #[error("write returned zero bytes")]
    WriteZero,
}

/// Operations issued in a state that cannot accept them. These indicate a
/// programming error rather than a transient fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    /// The port is in the wrong bit mode for the operation.
    #[error("operation requires {required:?} mode but the port is in {current:?} mode")]
    WrongMode {
        /// Mode the operation needs.
        required: PortMode,
        /// Mode the port is currently in.
        current: PortMode,
    },

    /// A bitbang operation was issued while no bitbang mode is active.
    #[error("operation requires a bitbang mode but the port is in {current:?} mode")]
    NotBitbang {
        /// Mode the port is currently in.
        current: PortMode,
    },

    /// The device returned a different number of bytes than the queued
    /// commands asked for.
    #[error("expected {expected} response bytes from the device, received {received}")]
    ResponseLength {
        /// Bytes the command buffer declared.
        expected: usize,
        /// Bytes actually available.
        received: usize,
    },

    /// Unread response bytes were left over from an earlier exchange.
    #[error("{0} stale response bytes pending before a new exchange")]
    StaleResponse(usize),

    /// The MPSSE answered with the bad-command marker.
    #[error("MPSSE rejected opcode {0:#04x}")]
    BadCommand(u8),

    /// The MPSSE did not echo the synchronisation opcode.
    #[error("MPSSE synchronisation failed: no bad-command echo received")]
    SyncFailed,

    /// A JTAG data shift was requested outside Shift-DR / Shift-IR.
    #[error("JTAG shift requested while the TAP is in {current:?}")]
    TapState {
        /// Tracked TAP state at the time of the request.
        current: TapState,
    },

    /// The device handle has been closed.
    #[error("device handle is closed")]
    Closed,
}

/// Configuration requests the chip cannot honour.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnsupportedConfig {
    /// Requested MPSSE clock is outside the achievable range.
    #[error("clock {requested} Hz outside achievable range {min}..={max} Hz")]
    ClockOutOfRange {
        /// The requested frequency.
        requested: u32,
        /// Lowest achievable frequency.
        min: u32,
        /// Highest achievable frequency.
        max: u32,
    },

    /// The requested baud rate cannot be achieved within tolerance.
    #[error("unsupported baud rate: requested {requested}, nearest achievable {actual}")]
    BaudRate {
        /// The requested baud rate.
        requested: u32,
        /// The nearest achievable baud rate.
        actual: u32,
    },

    /// Data bits / stop bits / parity combination not supported.
    #[error("unsupported line property: {0}")]
    LineProperty(&'static str),

    /// The bit mode is not available on this chip or port.
    #[error("{mode:?} mode is not available on {chip:?} interface {interface:?}")]
    Mode {
        /// Requested mode.
        mode: PortMode,
        /// Detected chip.
        chip: ChipType,
        /// Port the request was made on.
        interface: Interface,
    },

    /// A chip feature (adaptive clocking, 3-phase clocking, ...) is missing.
    #[error("{feature} is not supported on {chip:?}")]
    Feature {
        /// Name of the feature.
        feature: &'static str,
        /// Detected chip.
        chip: ChipType,
    },

    /// Pin mask references GPIO lines the chip does not have.
    #[error("pin mask {mask:#06x} exceeds the {width}-bit GPIO width of this chip")]
    PinWidth {
        /// The offending mask.
        mask: u16,
        /// Number of MPSSE GPIO lines available.
        width: u8,
    },
}

/// Coarse classification of [`Error`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No matching device.
    NotFound,
    /// Device claimed elsewhere or permission denied.
    AccessDenied,
    /// USB failure, disconnect, or torn read. Not retried internally.
    Transport,
    /// No response within the deadline; safe to retry.
    Timeout,
    /// Programming error: wrong mode or byte-count mismatch.
    ProtocolState,
    /// Requested configuration not achievable.
    UnsupportedConfig,
    /// Malformed argument.
    InvalidArgument,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound => ErrorKind::NotFound,
            Error::AccessDenied(_) => ErrorKind::AccessDenied,
            Error::Transport(_) | Error::PartialRead { .. } => ErrorKind::Transport,
            Error::Timeout => ErrorKind::Timeout,
            Error::ProtocolState(_) => ErrorKind::ProtocolState,
            Error::Unsupported(_) => ErrorKind::UnsupportedConfig,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    /// Whether this error means the device handle is permanently unusable.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::Transport(TransportError::Disconnected))
    }
}

impl From<nusb::Error> for Error {
    fn from(err: nusb::Error) -> Self {
        match err.kind() {
            nusb::ErrorKind::NotFound => Error::NotFound,
            nusb::ErrorKind::PermissionDenied | nusb::ErrorKind::Busy => {
                Error::AccessDenied(err.to_string())
            }
            nusb::ErrorKind::Disconnected => Error::Transport(TransportError::Disconnected),
            _ => Error::Transport(TransportError::Usb(err)),
        }
    }
}

impl From<nusb::transfer::TransferError> for Error {
    fn from(err: nusb::transfer::TransferError) -> Self {
        use nusb::transfer::TransferError;

        match err {
            // nusb cancels a blocking transfer when its timeout expires.
            TransferError::Cancelled => Error::Timeout,
            TransferError::Disconnected => Error::Transport(TransportError::Disconnected),
            other => Error::Transport(TransportError::Transfer(other)),
        }
    }
}

impl From<nusb::GetDescriptorError> for Error {
    fn from(err: nusb::GetDescriptorError) -> Self {
        match err {
            nusb::GetDescriptorError::Transfer(e) => Error::from(e),
            other => Error::Transport(TransportError::Descriptor(other)),
        }
    }
}

/// A specialized `Result` type for FTDI operations.
pub type Result<T> = std::result::Result<T, Error>;
