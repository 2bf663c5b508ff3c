//! Enumerate the USB storage devices with udev.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use crate::{
    device::DeviceProperties,
    mount::{mount_point_of, read_mounts},
    provider::{DeviceProvider, ProviderError},
};

/// Lists the attached USB devices that expose at least one disk.
///
/// The block devices are enumerated with udev; each of them is attributed to its
/// closest `usb_device` ancestor, which gives `idVendor`, `idProduct` and `serial`.
/// The drive letter is the mount point of the disk, or of its first mounted partition.
#[derive(Debug, Clone)]
pub struct UdevProvider {
    mounts_path: PathBuf,
}

/// A disk or a partition that belongs to a USB device.
#[derive(Debug, Clone)]
struct UsbBlock {
    /// sysfs path of the USB device.
    usb_path: PathBuf,
    vendor_id: String,
    product_id: String,
    serial_number: String,
    /// Kernel name of the block device, e.g. `sdb1`.
    name: String,
}

impl UdevProvider {
    pub fn new(mounts_path: impl Into<PathBuf>) -> Self {
        Self {
            mounts_path: mounts_path.into(),
        }
    }

    fn usb_blocks(&self) -> Result<Vec<UsbBlock>, ProviderError> {
        let mut enumerator = udev::Enumerator::new().map_err(ProviderError::Udev)?;
        enumerator
            .match_subsystem("block")
            .map_err(ProviderError::Udev)?;

        let mut blocks = Vec::new();
        for block in enumerator.scan_devices().map_err(ProviderError::Udev)? {
            let usb = match block.parent_with_subsystem_devtype("usb", "usb_device") {
                Ok(Some(usb)) => usb,
                Ok(None) => continue,
                Err(e) => {
                    log::debug!("no parent for {:?}: {e}", block.syspath());
                    continue;
                }
            };
            let (Some(vendor_id), Some(product_id)) = (
                attribute(&usb, "idVendor"),
                attribute(&usb, "idProduct"),
            ) else {
                log::debug!("{:?} has no USB ids, skipped", usb.syspath());
                continue;
            };
            blocks.push(UsbBlock {
                usb_path: usb.syspath().to_owned(),
                vendor_id,
                product_id,
                serial_number: attribute(&usb, "serial").unwrap_or_default(),
                name: block.sysname().to_string_lossy().into_owned(),
            });
        }
        Ok(blocks)
    }
}

impl DeviceProvider for UdevProvider {
    fn attached_devices(&self) -> Result<Vec<DeviceProperties>, ProviderError> {
        let blocks = self.usb_blocks()?;
        storage_devices(blocks, &self.mounts_path)
    }
}

fn attribute(device: &udev::Device, name: &str) -> Option<String> {
    device
        .attribute_value(name)
        .map(OsStr::to_string_lossy)
        .map(|v| v.trim().to_owned())
}

/// Groups the block devices by USB device, in the order of their first block.
///
/// The mount table is only read if there is at least one block.
fn storage_devices(
    blocks: Vec<UsbBlock>,
    mounts_path: &Path,
) -> Result<Vec<DeviceProperties>, ProviderError> {
    if blocks.is_empty() {
        return Ok(Vec::new());
    }
    let mounts = read_mounts(mounts_path)?;

    let mut devices: Vec<(PathBuf, DeviceProperties)> = Vec::new();
    for block in blocks {
        let mount_point = mount_point_of(&mounts, &block.name);
        log::trace!("{:?}: {} mounted on {mount_point:?}", block.usb_path, block.name);
        match devices.iter().position(|(path, _)| *path == block.usb_path) {
            Some(i) => {
                let props = &mut devices[i].1;
                if props.drive_letter.is_empty() {
                    if let Some(mount_point) = mount_point {
                        props.drive_letter = mount_point.to_owned();
                    }
                }
            }
            None => {
                let props = DeviceProperties {
                    vendor_id: block.vendor_id,
                    product_id: block.product_id,
                    serial_number: block.serial_number,
                    drive_letter: mount_point.unwrap_or_default().to_owned(),
                };
                devices.push((block.usb_path, props));
            }
        }
    }
    Ok(devices.into_iter().map(|(_, props)| props).collect())
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use pretty_assertions::assert_eq;

    use super::{storage_devices, UsbBlock};
    use crate::device::DeviceProperties;

    fn block(usb: &str, ids: (&str, &str, &str), name: &str) -> UsbBlock {
        UsbBlock {
            usb_path: PathBuf::from("/sys/devices/pci0000:00/0000:00:14.0/usb1").join(usb),
            vendor_id: ids.0.to_owned(),
            product_id: ids.1.to_owned(),
            serial_number: ids.2.to_owned(),
            name: name.to_owned(),
        }
    }

    #[test]
    fn one_entry_per_usb_device() {
        let dir = tempfile::tempdir().unwrap();
        let mounts = dir.path().join("mounts");
        fs::write(
            &mounts,
            "/dev/sda2 / ext4 rw 0 0\n/dev/sdb1 /media/usb vfat rw,relatime 0 0\n",
        )
        .unwrap();

        const STICK: (&str, &str, &str) = ("0781", "5567", "ABC123");
        const READER: (&str, &str, &str) = ("0bda", "0129", "");
        let blocks = vec![
            // the disk itself is not mounted, its partition is
            block("1-1", STICK, "sdb"),
            block("1-1", STICK, "sdb1"),
            // a card reader without serial and without mounted volume
            block("1-3", READER, "sdc"),
        ];
        assert_eq!(
            vec![
                DeviceProperties::new("0781", "5567", "ABC123").with_drive_letter("/media/usb"),
                DeviceProperties::new("0bda", "0129", ""),
            ],
            storage_devices(blocks, &mounts).unwrap()
        );
    }

    #[test]
    fn behind_a_hub() {
        let dir = tempfile::tempdir().unwrap();
        let mounts = dir.path().join("mounts");
        fs::write(&mounts, "/dev/sdd /media/whole-disk ext4 rw 0 0\n").unwrap();

        // the closest usb_device of the disk is the stick, not the hub
        let blocks = vec![block("2-1/2-1.4", ("0781", "5567", "XYZ"), "sdd")];
        assert_eq!(
            vec![DeviceProperties::new("0781", "5567", "XYZ").with_drive_letter("/media/whole-disk")],
            storage_devices(blocks, &mounts).unwrap()
        );
    }

    #[test]
    fn no_block_no_mount_table() {
        let dir = tempfile::tempdir().unwrap();
        // the mount table does not exist, it must not be read
        let devices = storage_devices(Vec::new(), &dir.path().join("mounts")).unwrap();
        assert_eq!(Vec::<DeviceProperties>::new(), devices);
    }
}
