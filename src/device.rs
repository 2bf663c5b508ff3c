//! Device records.

use std::{fmt, str::FromStr};

use thiserror::Error;

/// Whether a device has been attached or detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    Arrived,
    Removed,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Arrived => "arrived",
            DeviceStatus::Removed => "removed",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The properties of an attached device, as reported by a
/// [`DeviceProvider`](crate::provider::DeviceProvider).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceProperties {
    pub vendor_id: String,
    pub product_id: String,
    /// May be empty: not every device reports a serial number.
    pub serial_number: String,
    /// Mount point of the device's volume, empty if nothing is mounted.
    pub drive_letter: String,
}

impl DeviceProperties {
    pub fn new(
        vendor_id: impl Into<String>,
        product_id: impl Into<String>,
        serial_number: impl Into<String>,
    ) -> Self {
        Self {
            vendor_id: vendor_id.into(),
            product_id: product_id.into(),
            serial_number: serial_number.into(),
            drive_letter: String::new(),
        }
    }

    pub fn with_drive_letter(mut self, drive_letter: impl Into<String>) -> Self {
        self.drive_letter = drive_letter.into();
        self
    }

    pub fn key(&self) -> IdentityKey {
        IdentityKey::new(&self.vendor_id, &self.product_id, &self.serial_number)
    }
}

/// Identifies a physical device across rescans.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub vendor_id: String,
    pub product_id: String,
    pub serial_number: String,
}

impl IdentityKey {
    pub fn new(vendor_id: &str, product_id: &str, serial_number: &str) -> Self {
        Self {
            vendor_id: vendor_id.to_ascii_lowercase(),
            product_id: product_id.to_ascii_lowercase(),
            serial_number: serial_number.to_owned(),
        }
    }
}

/// One observation of a USB storage device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Sequence number assigned when the device was detected.
    ///
    /// It is not stable: the same device gets a new number when it comes back
    /// after a removal, and numbering starts over when the registry is cleared.
    pub device_number: u32,
    pub device_status: DeviceStatus,
    pub vendor_id: String,
    pub product_id: String,
    pub serial_number: String,
    pub drive_letter: String,
}

impl Device {
    pub(crate) fn arrived(device_number: u32, props: DeviceProperties) -> Self {
        Self {
            device_number,
            device_status: DeviceStatus::Arrived,
            vendor_id: props.vendor_id,
            product_id: props.product_id,
            serial_number: props.serial_number,
            drive_letter: props.drive_letter,
        }
    }

    pub fn key(&self) -> IdentityKey {
        IdentityKey::new(&self.vendor_id, &self.product_id, &self.serial_number)
    }

    /// Returns the value of the given property, formatted as a string.
    pub fn property(&self, name: PropertyName) -> String {
        match name {
            PropertyName::DeviceNumber => self.device_number.to_string(),
            PropertyName::DeviceStatus => self.device_status.to_string(),
            PropertyName::VendorId => self.vendor_id.clone(),
            PropertyName::ProductId => self.product_id.clone(),
            PropertyName::SerialNumber => self.serial_number.clone(),
            PropertyName::DriveLetter => self.drive_letter.clone(),
        }
    }

    /// Checks whether the given property is equal to `value`.
    ///
    /// USB ids are hexadecimal, they are compared without regard to case.
    pub fn matches(&self, name: PropertyName, value: &str) -> bool {
        match name {
            PropertyName::VendorId => self.vendor_id.eq_ignore_ascii_case(value),
            PropertyName::ProductId => self.product_id.eq_ignore_ascii_case(value),
            PropertyName::DeviceStatus => self.device_status.as_str().eq_ignore_ascii_case(value),
            _ => self.property(name) == value,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {}:{} serial={:?} drive={:?} ({})",
            self.device_number,
            self.vendor_id,
            self.product_id,
            self.serial_number,
            self.drive_letter,
            self.device_status
        )
    }
}

/// A field of [`Device`] that can be used in lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyName {
    DeviceNumber,
    DeviceStatus,
    VendorId,
    ProductId,
    SerialNumber,
    DriveLetter,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown device property {0:?}")]
pub struct UnknownProperty(pub String);

impl FromStr for PropertyName {
    type Err = UnknownProperty;

    /// Accepts both the camelCase names used by consumers and snake_case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deviceNumber" | "device_number" => Ok(Self::DeviceNumber),
            "deviceStatus" | "device_status" => Ok(Self::DeviceStatus),
            "vendorId" | "vendor_id" => Ok(Self::VendorId),
            "productId" | "product_id" => Ok(Self::ProductId),
            "serialNumber" | "serial_number" => Ok(Self::SerialNumber),
            "driveLetter" | "drive_letter" => Ok(Self::DriveLetter),
            _ => Err(UnknownProperty(s.to_owned())),
        }
    }
}

impl fmt::Display for PropertyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DeviceNumber => "deviceNumber",
            Self::DeviceStatus => "deviceStatus",
            Self::VendorId => "vendorId",
            Self::ProductId => "productId",
            Self::SerialNumber => "serialNumber",
            Self::DriveLetter => "driveLetter",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sandisk() -> Device {
        Device::arrived(
            1,
            DeviceProperties::new("0781", "5567", "ABC123").with_drive_letter("E:"),
        )
    }

    #[test]
    fn property_names() {
        assert_eq!(Ok(PropertyName::VendorId), "vendorId".parse());
        assert_eq!(Ok(PropertyName::DriveLetter), "drive_letter".parse());
        assert_eq!(
            Err(UnknownProperty("color".to_owned())),
            "color".parse::<PropertyName>()
        );
        assert_eq!("serialNumber", PropertyName::SerialNumber.to_string());
    }

    #[test]
    fn key_ignores_hex_case() {
        let a = DeviceProperties::new("0781", "55AB", "x").key();
        let b = DeviceProperties::new("0781", "55ab", "x").key();
        assert_eq!(a, b);
        let c = DeviceProperties::new("0781", "55ab", "X").key();
        assert!(a != c, "serial numbers are case sensitive");
    }

    #[test]
    fn matching() {
        let d = sandisk();
        assert!(d.matches(PropertyName::VendorId, "0781"));
        assert!(d.matches(PropertyName::DriveLetter, "E:"));
        assert!(d.matches(PropertyName::DeviceNumber, "1"));
        assert!(d.matches(PropertyName::DeviceStatus, "Arrived"));
        assert!(!d.matches(PropertyName::SerialNumber, "abc123"));
    }
}
