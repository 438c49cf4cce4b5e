//! USB transport abstraction.
//!
//! The protocol layers above this module never touch a USB handle directly.
//! They talk to a [`Transport`]: vendor control requests plus one bulk-OUT
//! and one bulk-IN endpoint belonging to a single FTDI port. [`NusbTransport`]
//! is the real implementation on top of [nusb](https://crates.io/crates/nusb);
//! [`crate::sim::SimulatedChip`] is an in-memory one used by the tests.

use std::time::Duration;

use nusb::transfer::{Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient};
use nusb::{self, DeviceInfo, MaybeFuture};

use crate::device_info::{find_device, DeviceFilter};
use crate::error::{Error, Result};
use crate::types::{ChipType, Interface, InterfaceConfig};

/// Default timeout for vendor control requests.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte-level access to one FTDI port.
///
/// Control requests are FTDI vendor requests addressed to the device; the
/// caller supplies the complete `index` field (port number plus any
/// request-specific high byte). Bulk transfers go to the port's fixed pair
/// of endpoints. `bulk_read` returns the raw packets including the 2-byte
/// status header; the frame codec strips it.
///
/// Implementations map "no data before the timeout" to [`Error::Timeout`]
/// and a vanished device to
/// [`TransportError::Disconnected`](crate::error::TransportError::Disconnected).
pub trait Transport {
    /// Issue a vendor OUT control request. Returns the number of data bytes sent.
    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize>;

    /// Issue a vendor IN control request, reading up to `length` bytes.
    fn control_in(&mut self, request: u8, value: u16, index: u16, length: u16)
        -> Result<Vec<u8>>;

    /// Write to the bulk-OUT endpoint. Returns the number of bytes accepted.
    fn bulk_write(&mut self, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Read up to `max_len` raw bytes from the bulk-IN endpoint.
    fn bulk_read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Bulk max-packet size of this port's endpoints.
    fn max_packet_size(&self) -> usize;

    /// Release the underlying handle. Further calls may fail.
    fn close(&mut self) {}
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize> {
        (**self).control_out(request, value, index, data)
    }

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>> {
        (**self).control_in(request, value, index, length)
    }

    fn bulk_write(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        (**self).bulk_write(data, timeout)
    }

    fn bulk_read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        (**self).bulk_read(max_len, timeout)
    }

    fn max_packet_size(&self) -> usize {
        (**self).max_packet_size()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// A claimed FTDI port on a real USB device.
pub struct NusbTransport {
    #[allow(dead_code)] // Kept to ensure the USB device stays open
    device: nusb::Device,
    interface: Option<nusb::Interface>,
    config: InterfaceConfig,
    port: Interface,
    chip_type: ChipType,
    max_packet_size: usize,
    control_timeout: Duration,
}

impl std::fmt::Debug for NusbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NusbTransport")
            .field("chip_type", &self.chip_type)
            .field("port", &self.port)
            .field("max_packet_size", &self.max_packet_size)
            .field("open", &self.interface.is_some())
            .finish_non_exhaustive()
    }
}

impl NusbTransport {
    /// Open the first device matching the given vendor and product IDs.
    pub fn open(vendor: u16, product: u16, port: Interface) -> Result<Self> {
        Self::open_with_filter(&DeviceFilter::new(vendor, product), port)
    }

    /// Open a device selected by a [`DeviceFilter`].
    pub fn open_with_filter(filter: &DeviceFilter, port: Interface) -> Result<Self> {
        let dev_info = find_device(filter)?;
        Self::from_device_info(dev_info, port)
    }

    /// Open a device by USB bus number and device address.
    pub fn open_bus_addr(bus: u8, addr: u8, port: Interface) -> Result<Self> {
        let dev_info = nusb::list_devices()
            .wait()?
            .find(|d| d.busnum() == bus && d.device_address() == addr)
            .ok_or(Error::NotFound)?;

        Self::from_device_info(dev_info, port)
    }

    /// Open a device from an already-discovered [`nusb::DeviceInfo`].
    pub fn from_device_info(dev_info: DeviceInfo, port: Interface) -> Result<Self> {
        let config = port.config();

        let device = dev_info.open().wait()?;

        let desc = device.device_descriptor();
        let chip_type = ChipType::from_bcd_device(
            desc.device_version(),
            desc.serial_number_string_index().is_some(),
        );

        if port.index() >= chip_type.port_count() {
            return Err(Error::InvalidArgument("chip does not have the requested port"));
        }

        // Detach kernel driver and claim interface
        let interface = device
            .detach_and_claim_interface(config.interface_num)
            .wait()?;

        let max_packet_size = determine_max_packet_size(&device, chip_type, config.interface_num);

        log::debug!(
            "opened {:?} port {:?} (bus {} addr {}), max packet {}",
            chip_type,
            port,
            dev_info.busnum(),
            dev_info.device_address(),
            max_packet_size
        );

        Ok(Self {
            device,
            interface: Some(interface),
            config,
            port,
            chip_type,
            max_packet_size,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
        })
    }

    /// The chip detected from the device descriptor.
    pub fn chip_type(&self) -> ChipType {
        self.chip_type
    }

    /// The claimed port.
    pub fn port(&self) -> Interface {
        self.port
    }

    /// Set the timeout used for vendor control requests.
    pub fn set_control_timeout(&mut self, timeout: Duration) {
        self.control_timeout = timeout;
    }

    fn claimed(&self) -> Result<&nusb::Interface> {
        self.interface
            .as_ref()
            .ok_or(Error::ProtocolState(crate::error::ProtocolViolation::Closed))
    }
}

impl Transport for NusbTransport {
    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize> {
        self.claimed()?
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                    data,
                },
                self.control_timeout,
            )
            .wait()?;
        Ok(data.len())
    }

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>> {
        let data = self
            .claimed()?
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                    length,
                },
                self.control_timeout,
            )
            .wait()?;
        Ok(data)
    }

    fn bulk_write(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        let mut ep = self.claimed()?.endpoint::<Bulk, Out>(self.config.write_ep)?;

        let mut buf = nusb::transfer::Buffer::new(data.len());
        buf.extend_from_slice(data);

        let completion = ep.transfer_blocking(buf, timeout);
        completion.status?;
        Ok(completion.actual_len)
    }

    fn bulk_read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut ep = self.claimed()?.endpoint::<Bulk, In>(self.config.read_ep)?;

        // IN transfers must be a whole number of packets.
        let len = max_len.max(1).div_ceil(self.max_packet_size) * self.max_packet_size;
        let buf = nusb::transfer::Buffer::new(len);

        let completion = ep.transfer_blocking(buf, timeout);
        completion.status?;

        let mut raw = completion.buffer.into_vec();
        raw.truncate(completion.actual_len);
        Ok(raw)
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn close(&mut self) {
        if self.interface.take().is_some() {
            log::debug!("released {:?} port {:?}", self.chip_type, self.port);
        }
    }
}

/// Determine the bulk max-packet size for an interface.
fn determine_max_packet_size(
    device: &nusb::Device,
    chip_type: ChipType,
    interface_num: u8,
) -> usize {
    let default_size = chip_type.default_max_packet_size();

    let config = match device.active_configuration() {
        Ok(c) => c,
        Err(_) => return default_size,
    };

    for iface_group in config.interfaces() {
        if iface_group.interface_number() != interface_num {
            continue;
        }
        for alt in iface_group.alt_settings() {
            if let Some(ep) = alt.endpoints().next() {
                return ep.max_packet_size();
            }
        }
    }

    default_size
}
