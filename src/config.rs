//! Configuration of the watcher.

use std::{env, path::PathBuf, time::Duration};

use crate::mount::PROC_MOUNTS_PATH;

/// How long to wait after a notification before reading the device properties,
/// to let the system finish setting the device up.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(3);

const ENV_SETTLE_MS: &str = "USB_WATCHER_SETTLE_MS";
const ENV_MOUNTS_PATH: &str = "USB_WATCHER_MOUNTS_PATH";

/// What the session controller does with the listener threads when the session stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerMode {
    /// Signal the threads to stop and wait for them.
    Joined,
    /// Signal the threads to stop and let them finish in the background.
    #[default]
    Detached,
}

/// The class of devices whose notifications are listened to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceFilter {
    pub subsystem: String,
    /// If `None`, any device type of the subsystem matches.
    pub devtype: Option<String>,
}

impl Default for InterfaceFilter {
    /// USB devices, excluding their interfaces.
    fn default() -> Self {
        Self {
            subsystem: String::from("usb"),
            devtype: Some(String::from("usb_device")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub settle_delay: Duration,
    pub listener_mode: ListenerMode,
    pub interface: InterfaceFilter,
    pub mounts_path: PathBuf,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            listener_mode: ListenerMode::default(),
            interface: InterfaceFilter::default(),
            mounts_path: PathBuf::from(PROC_MOUNTS_PATH),
        }
    }
}

impl WatcherConfig {
    /// The default configuration, overridden by the environment variables
    /// `USB_WATCHER_SETTLE_MS` and `USB_WATCHER_MOUNTS_PATH` when they are set.
    ///
    /// Invalid values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(ms) = env::var(ENV_SETTLE_MS) {
            match ms.trim().parse::<u64>() {
                Ok(ms) => config.settle_delay = Duration::from_millis(ms),
                Err(e) => log::warn!("ignoring {ENV_SETTLE_MS}={ms:?}: {e}"),
            }
        }
        if let Some(path) = env::var_os(ENV_MOUNTS_PATH) {
            config.mounts_path = PathBuf::from(path);
        }
        config
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn listener_mode(mut self, mode: ListenerMode) -> Self {
        self.listener_mode = mode;
        self
    }

    pub fn interface(mut self, interface: InterfaceFilter) -> Self {
        self.interface = interface;
        self
    }

    pub fn mounts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_path = path.into();
        self
    }
}
