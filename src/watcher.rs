//! Entry points for the consumers of the device changes.

use std::{io, sync::Arc};

use parking_lot::Mutex;

use crate::{
    config::WatcherConfig,
    device::{Device, PropertyName},
    provider::{DeviceProvider, ProviderError},
    registry::{DeviceRegistry, LookupError},
    enumerate::UdevProvider,
    session::{Session, SessionParts, SessionState},
    source::NotificationSource,
    uevent::UeventSocket,
};

type SourceFactory = Box<dyn Fn() -> Box<dyn NotificationSource> + Send + Sync>;

/// `UsbWatcher` reports the USB storage devices that are attached to or detached from the machine.
///
/// # Example
///
/// ```no_run
/// use usb_watcher::{UsbWatcher, WatcherConfig};
///
/// let watcher = UsbWatcher::new(WatcherConfig::from_env());
/// watcher.spy_on(
///     |device| println!("{device}"),
///     || println!("watching"),
/// ).unwrap();
/// std::thread::sleep(std::time::Duration::from_secs(60));
/// watcher.spy_off();
/// ```
pub struct UsbWatcher {
    config: WatcherConfig,
    provider: Arc<dyn DeviceProvider>,
    make_source: SourceFactory,
    sessions: Mutex<Vec<Session>>,
}

impl UsbWatcher {
    /// Creates a watcher that listens to the udev events and enumerates the devices with udev.
    pub fn new(config: WatcherConfig) -> Self {
        let provider = UdevProvider::new(&config.mounts_path);
        let interface = config.interface.clone();
        Self::with_parts(config, Arc::new(provider), move || {
            Box::new(UeventSocket::new(interface.clone())) as Box<dyn NotificationSource>
        })
    }

    /// Creates a watcher with a custom device provider and notification source.
    ///
    /// `make_source` is called once per session.
    pub fn with_parts(
        config: WatcherConfig,
        provider: Arc<dyn DeviceProvider>,
        make_source: impl Fn() -> Box<dyn NotificationSource> + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            provider,
            make_source: Box::new(make_source),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Starts a monitoring session.
    ///
    /// `on_device` is called for every device that is attached or detached while the session
    /// is active, and `on_ready` once the session has been set up.
    /// Calling `spy_on` again starts another, independent, session with its own registry.
    pub fn spy_on(
        &self,
        on_device: impl Fn(Device) + Send + Sync + 'static,
        on_ready: impl FnOnce() + Send + 'static,
    ) -> io::Result<()> {
        let mut sessions = self.sessions.lock();
        // forget the sessions that have ended on their own
        sessions.retain(|s| s.is_active());
        if !sessions.is_empty() {
            log::warn!("spy_on: a session is already active, starting another one");
        }
        let session = Session::start(SessionParts {
            registry: Arc::new(DeviceRegistry::new(self.provider.clone())),
            source: (self.make_source)(),
            sink: Arc::new(on_device),
            settle_delay: self.config.settle_delay,
            interface: self.config.interface.clone(),
            listener_mode: self.config.listener_mode,
            on_ready: Some(Box::new(on_ready)),
        })?;
        sessions.push(session);
        Ok(())
    }

    /// Stops the monitoring sessions. Does nothing if there is no active session.
    pub fn spy_off(&self) {
        let stopped: Vec<Session> = self.sessions.lock().drain(..).collect();
        for mut session in stopped {
            match session.stop() {
                SessionState::Failed(reason) => {
                    log::warn!("{} had failed: {reason}", session.name())
                }
                state => log::info!("{}: {state:?}", session.name()),
            }
        }
    }

    /// Returns whether at least one session is active.
    pub fn is_spying(&self) -> bool {
        self.sessions.lock().iter().any(Session::is_active)
    }

    /// The state of each session that has not been stopped by [`spy_off`](Self::spy_off).
    pub fn session_states(&self) -> Vec<SessionState> {
        self.sessions.lock().iter().map(Session::state).collect()
    }

    /// Returns the known USB storage devices.
    ///
    /// While a session is active, this is the registry of the most recent active session.
    /// Otherwise, the devices are enumerated on the spot.
    pub fn available_devices(&self) -> Result<Vec<Device>, ProviderError> {
        match self.registry() {
            Some(registry) => Ok(registry.list_all()),
            None => Ok(self.snapshot()?.list_all()),
        }
    }

    /// Returns the first available device whose property `name` is equal to `value`.
    ///
    /// When no session is active and the devices cannot be enumerated, the error of the
    /// provider is returned as [`LookupError::Provider`].
    pub fn device_by_property(&self, name: &str, value: &str) -> Result<Device, LookupError> {
        if name.is_empty() || value.is_empty() {
            return Err(LookupError::InvalidArgument(String::from(
                "the property name and value are required",
            )));
        }
        let property: PropertyName = name
            .parse()
            .map_err(|e| LookupError::InvalidArgument(format!("{e}")))?;
        match self.registry() {
            Some(registry) => registry.find_by_property(property, value),
            None => self.snapshot()?.find_by_property(property, value),
        }
    }

    /// The registry of the most recent active session.
    pub fn registry(&self) -> Option<Arc<DeviceRegistry>> {
        self.sessions
            .lock()
            .iter()
            .rev()
            .find(|s| s.is_active())
            .map(|s| s.registry().clone())
    }

    /// Enumerates the devices into a registry that no session uses.
    fn snapshot(&self) -> Result<DeviceRegistry, ProviderError> {
        let snapshot = DeviceRegistry::new(self.provider.clone());
        snapshot.rescan_changes(false)?;
        Ok(snapshot)
    }
}

impl Drop for UsbWatcher {
    fn drop(&mut self) {
        self.spy_off();
    }
}
