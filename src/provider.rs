//! Source of the properties of the attached devices.

use std::io;

use thiserror::Error;

use crate::{device::DeviceProperties, mount::ReadError};

/// Enumerates the USB storage devices that are currently attached.
///
/// Returning an empty list is valid: it means that no matching device is attached.
pub trait DeviceProvider: Send + Sync {
    fn attached_devices(&self) -> Result<Vec<DeviceProperties>, ProviderError>;
}

impl<F> DeviceProvider for F
where
    F: Fn() -> Result<Vec<DeviceProperties>, ProviderError> + Send + Sync,
{
    fn attached_devices(&self) -> Result<Vec<DeviceProperties>, ProviderError> {
        self()
    }
}

/// Error while enumerating the attached devices.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to enumerate the devices with udev")]
    Udev(#[source] io::Error),
    #[error("failed to read the mount table")]
    Mounts(#[from] ReadError),
}
