//! Get notified when a USB storage device is attached or detached.

pub mod bridge;
pub mod config;
pub mod device;
pub mod enumerate;
pub mod gate;
pub mod listener;
pub mod mount;
pub mod provider;
pub mod registry;
pub mod session;
pub mod source;
pub mod uevent;
pub mod watcher;
mod worker;

pub use config::WatcherConfig;
pub use device::{Device, DeviceProperties, DeviceStatus};
pub use watcher::UsbWatcher;

#[cfg(not(target_os = "linux"))]
compile_error!("only Linux is supported");
