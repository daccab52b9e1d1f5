//! Vendor plugin seam.
//!
//! A plugin turns operations into procedures for one hardware family and
//! declares the persistent unsolicited interests and error codes that
//! family needs. Plugins are selected by a prioritized strategy list, not
//! by inheritance: see the registry in `tether-plugins`.

use crate::correlator::{Handler, Pattern};
use crate::error::OpError;
use crate::op::Operation;
use crate::sequence::Procedure;
use crate::tables::ErrorTable;

/// What port probing learned about a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Manufacturer string as reported (`+CGMI`), or the USB vendor name.
    pub vendor: String,
    pub model: String,
    pub usb_vendor: Option<u16>,
    pub usb_product: Option<u16>,
    /// The device exposes a message (QMI/MBIM-style) control channel.
    pub message_channel: bool,
}

impl DeviceIdentity {
    pub fn new(vendor: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_usb(mut self, vendor: u16, product: u16) -> Self {
        self.usb_vendor = Some(vendor);
        self.usb_product = Some(product);
        self
    }

    pub fn with_message_channel(mut self) -> Self {
        self.message_channel = true;
        self
    }

    /// Case-insensitive vendor substring match.
    pub fn vendor_is(&self, needle: &str) -> bool {
        self.vendor.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
    }
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this plugin handles the device.
    fn supports(&self, device: &DeviceIdentity) -> bool;

    /// Build the procedure for one operation. Operations the family cannot
    /// perform fail with [`OpError::Unsupported`].
    fn procedure(&self, op: &Operation) -> Result<Box<dyn Procedure>, OpError>;

    /// Persistent unsolicited interests, registered in order.
    ///
    /// Must not include kinds this plugin's procedures await: persistent
    /// interests are registered first and would win the match.
    fn interests(&self) -> Vec<(Pattern, Handler)> {
        Vec::new()
    }

    /// Device error code table.
    fn errors(&self) -> ErrorTable {
        ErrorTable::standard()
    }
}
