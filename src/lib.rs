//! User-space protocol engine for FTDI USB bridge chips.
//!
//! This crate drives the FT232R, FT2232C/D/H, FT4232H, FT232H and FT230X
//! families over [nusb](https://crates.io/crates/nusb), with no C
//! dependencies or `libusb`. It covers the whole stack above the USB
//! endpoints: the vendor control requests, the bulk-IN status framing, the
//! bit modes, and the MPSSE command engine with SPI, JTAG and GPIO on top.
//!
//! # Quick Start
//!
//! ```no_run
//! use ftdi_engine::{Interface, Port, PortOptions, UartConfig};
//! use ftdi_engine::constants::{pid, FTDI_VID};
//!
//! let mut port = Port::open(FTDI_VID, pid::FT232, Interface::A, PortOptions::default())?;
//! port.configure_uart(&UartConfig::new(115_200))?;
//! port.uart_write(b"Hello from Rust!\r\n")?;
//! # Ok::<(), ftdi_engine::Error>(())
//! ```
//!
//! # Layers
//!
//! - [`transport`]: the four USB primitives, behind the [`Transport`]
//!   trait so a [`SimulatedChip`] can stand in for hardware.
//! - [`frame`]: strips the 2-byte status header from every bulk-IN packet.
//! - [`device`]: one claimed port; control requests and exact-length reads.
//! - [`port`]: bit mode state machine and cached pin/clock/line state.
//! - [`uart`], [`bitbang`], [`mpsse`]: the per-mode front-ends.
//!
//! # Features
//!
//! - **`embedded-hal`**: `SpiDevice` for an MPSSE SPI bus and
//!   `embedded_io` `Read`/`Write` for the serial stream ([`hal`]).

pub mod bitbang;
pub mod constants;
pub mod device;
pub mod device_info;
pub mod error;
pub mod frame;
#[cfg(feature = "embedded-hal")]
pub mod hal;
pub mod mpsse;
pub mod port;
pub mod sim;
pub mod transport;
pub mod types;
pub mod uart;

// ---- Convenience re-exports ----

pub use constants::FTDI_VID;
pub use device::FtdiDevice;
pub use device_info::{find_device, find_devices, list_matching, DeviceFilter};
pub use error::{Error, ErrorKind, ProtocolViolation, Result, TransportError, UnsupportedConfig};
pub use frame::{FrameCodec, LineErrors};
pub use mpsse::{BitOrder, ClockConfig, ClockEdge, CommandBuffer, ShiftConfig};
pub use port::{PinState, Port, PortMode, PortOptions};
pub use sim::SimulatedChip;
pub use transport::{NusbTransport, Transport};
pub use types::*;
pub use uart::{BaudRate, LineConfig, UartConfig};
