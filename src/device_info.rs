//! Device discovery and enumeration.
//!
//! Use [`find_devices`] to list connected FTDI devices, or [`DeviceFilter`]
//! for more precise matching by description, serial number, or device index.

use nusb::{self, DeviceInfo, MaybeFuture};
use std::num::NonZeroU8;
use std::time::Duration;

use crate::constants::{pid, FTDI_VID};
use crate::error::{Error, Result};

/// Filtering criteria for finding FTDI devices.
///
/// All fields beyond `vendor_id` and `product_id` are optional. When set,
/// they further restrict which devices match.
///
/// # Example
///
/// ```no_run
/// use ftdi_engine::DeviceFilter;
///
/// let filter = DeviceFilter::new(0x0403, 0x6010)
///     .serial("FT123456")
///     .index(0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    /// USB vendor ID to match.
    pub vendor_id: u16,
    /// USB product ID to match. `None` accepts any known FTDI product.
    pub product_id: Option<u16>,
    /// If set, match against the USB product description string.
    pub description: Option<String>,
    /// If set, match against the USB serial number string.
    pub serial: Option<String>,
    /// Select the Nth matching device (0-based). Defaults to 0.
    pub index: usize,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self::any_ftdi()
    }
}

impl DeviceFilter {
    /// Create a new filter matching the given vendor and product IDs.
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id: Some(product_id),
            description: None,
            serial: None,
            index: 0,
        }
    }

    /// Match any device with the FTDI vendor ID and a known product ID.
    pub fn any_ftdi() -> Self {
        Self {
            vendor_id: FTDI_VID,
            product_id: None,
            description: None,
            serial: None,
            index: 0,
        }
    }

    /// Require the product description to match.
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Require the serial number to match.
    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Select the Nth matching device (0-based).
    pub fn index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    /// Whether the IDs of `dev` satisfy this filter (strings are not checked).
    pub fn matches_ids(&self, vendor: u16, product: u16) -> bool {
        if vendor != self.vendor_id {
            return false;
        }
        match self.product_id {
            Some(p) => p == product,
            None => pid::ALL.contains(&product),
        }
    }

    fn needs_strings(&self) -> bool {
        self.description.is_some() || self.serial.is_some()
    }
}

/// USB string descriptor read timeout.
const STRING_TIMEOUT: Duration = Duration::from_secs(1);

/// List all connected devices matching the given vendor and product IDs.
///
/// # Example
///
/// ```no_run
/// use ftdi_engine::{find_devices, constants::FTDI_VID};
///
/// let devices = find_devices(FTDI_VID, 0x6014).unwrap();
/// for dev in &devices {
///     println!("Found: vid={:#06x} pid={:#06x}", dev.vendor_id(), dev.product_id());
/// }
/// ```
pub fn find_devices(vendor: u16, product: u16) -> Result<Vec<DeviceInfo>> {
    list_matching(&DeviceFilter::new(vendor, product))
}

/// List every connected device whose IDs match `filter`.
pub fn list_matching(filter: &DeviceFilter) -> Result<Vec<DeviceInfo>> {
    let devices: Vec<DeviceInfo> = nusb::list_devices()
        .wait()?
        .filter(|d| filter.matches_ids(d.vendor_id(), d.product_id()))
        .collect();
    log::trace!("{} device(s) match {:?}", devices.len(), filter);
    Ok(devices)
}

/// Find a single device matching the given filter criteria.
///
/// This opens each candidate temporarily to read string descriptors for
/// matching when `description` or `serial` filters are set.
pub fn find_device(filter: &DeviceFilter) -> Result<DeviceInfo> {
    let mut match_count = 0usize;

    for dev_info in list_matching(filter)? {
        if filter.needs_strings() && !strings_match(&dev_info, filter)? {
            continue;
        }

        if match_count == filter.index {
            return Ok(dev_info);
        }
        match_count += 1;
    }

    Err(Error::NotFound)
}

fn strings_match(dev_info: &DeviceInfo, filter: &DeviceFilter) -> Result<bool> {
    let device = dev_info.open().wait()?;
    let desc = device.device_descriptor();

    if let Some(ref expected) = filter.description {
        let product = read_string(&device, desc.product_string_index())?;
        if product.as_deref() != Some(expected.as_str()) {
            return Ok(false);
        }
    }

    if let Some(ref expected) = filter.serial {
        let serial = read_string(&device, desc.serial_number_string_index())?;
        if serial.as_deref() != Some(expected.as_str()) {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Read an English string descriptor; `None` if the device has none.
fn read_string(device: &nusb::Device, idx: Option<NonZeroU8>) -> Result<Option<String>> {
    match idx {
        Some(idx) => Ok(Some(
            device
                .get_string_descriptor(idx, 0x0409, STRING_TIMEOUT)
                .wait()?,
        )),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_product_match() {
        let f = DeviceFilter::new(FTDI_VID, pid::FT232H);
        assert!(f.matches_ids(FTDI_VID, pid::FT232H));
        assert!(!f.matches_ids(FTDI_VID, pid::FT2232));
        assert!(!f.matches_ids(0x1234, pid::FT232H));
    }

    #[test]
    fn any_ftdi_accepts_known_products_only() {
        let f = DeviceFilter::any_ftdi();
        for p in pid::ALL {
            assert!(f.matches_ids(FTDI_VID, p));
        }
        assert!(!f.matches_ids(FTDI_VID, 0xBEEF));
    }

    #[test]
    fn builder_sets_fields() {
        let f = DeviceFilter::new(FTDI_VID, pid::FT4232)
            .serial("FT0001")
            .description("Quad RS232-HS")
            .index(2);
        assert_eq!(f.serial.as_deref(), Some("FT0001"));
        assert_eq!(f.description.as_deref(), Some("Quad RS232-HS"));
        assert_eq!(f.index, 2);
        assert!(f.needs_strings());
    }
}
