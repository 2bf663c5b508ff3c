//! Monitoring sessions: start, run in the background, stop.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::unbounded;
use parking_lot::Mutex;

use crate::{
    bridge::{DeliveryBridge, DeliverySink},
    config::{InterfaceFilter, ListenerMode},
    gate::ReadinessGate,
    listener::{spawn_listener, ListenerState},
    registry::DeviceRegistry,
    source::NotificationSource,
    worker::RescanWorker,
};

static SESSION_COUNT: AtomicU64 = AtomicU64::new(0);

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Active,
    Stopped,
    /// The listener could not be set up, or failed. A new session must be started.
    Failed(String),
}

/// Everything a session needs.
pub struct SessionParts {
    pub registry: Arc<DeviceRegistry>,
    pub source: Box<dyn NotificationSource>,
    pub sink: Arc<dyn DeliverySink>,
    pub settle_delay: Duration,
    pub interface: InterfaceFilter,
    pub listener_mode: ListenerMode,
    /// Called once the listener has been launched.
    pub on_ready: Option<Box<dyn FnOnce() + Send>>,
}

/// A monitoring session.
///
/// While the session is active, the devices that are attached or detached are
/// delivered to the sink. Starting two sessions creates two independent listeners.
///
/// # Example
///
/// ```no_run
/// use std::{sync::Arc, time::Duration};
/// use usb_watcher::{
///     bridge::delivery_channel,
///     config::{InterfaceFilter, ListenerMode},
///     enumerate::UdevProvider,
///     registry::DeviceRegistry,
///     session::{Session, SessionParts},
///     uevent::UeventSocket,
/// };
///
/// let provider = UdevProvider::new("/proc/mounts");
/// let (tx, rx) = delivery_channel();
/// let mut session = Session::start(SessionParts {
///     registry: Arc::new(DeviceRegistry::new(Arc::new(provider))),
///     source: Box::new(UeventSocket::new(InterfaceFilter::default())),
///     sink: Arc::new(tx),
///     settle_delay: Duration::from_secs(3),
///     interface: InterfaceFilter::default(),
///     listener_mode: ListenerMode::Detached,
///     on_ready: None,
/// }).unwrap();
/// for device in rx.iter().take(2) {
///     println!("{device}");
/// }
/// session.stop();
/// ```
pub struct Session {
    name: String,
    gate: Arc<ReadinessGate>,
    registry: Arc<DeviceRegistry>,
    state: Arc<Mutex<SessionState>>,
    controller: Option<JoinHandle<()>>,
}

impl Session {
    /// Opens the gate and starts the session controller in the background.
    pub fn start(parts: SessionParts) -> io::Result<Session> {
        let name = format!(
            "usb-watcher-session-{}",
            SESSION_COUNT.fetch_add(1, Ordering::Relaxed)
        );
        let gate = Arc::new(ReadinessGate::new());
        let registry = parts.registry.clone();
        let state = Arc::new(Mutex::new(SessionState::Starting));

        gate.open();
        let controller = Controller {
            name: name.clone(),
            gate: gate.clone(),
            state: state.clone(),
        };
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || controller.run(parts));
        let controller = match handle {
            Ok(h) => h,
            Err(e) => {
                gate.close();
                return Err(e);
            }
        };
        log::info!("{name} started");
        Ok(Session {
            name,
            gate,
            registry,
            state,
            controller: Some(controller),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Closes the gate and waits for the controller to tear the session down.
    ///
    /// When this returns, the registry has been cleared. Stopping a session that
    /// has already stopped (or failed) has no effect.
    pub fn stop(&mut self) -> SessionState {
        self.gate.close();
        if let Some(controller) = self.controller.take() {
            if controller.join().is_err() {
                log::error!("{}: controller thread panicked", self.name);
                *self.state.lock() = SessionState::Failed(String::from("panicked"));
            }
        }
        self.state()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.controller.is_some() {
            self.gate.close();
        }
    }
}

struct Controller {
    name: String,
    gate: Arc<ReadinessGate>,
    state: Arc<Mutex<SessionState>>,
}

impl Controller {
    fn run(self, parts: SessionParts) {
        let SessionParts {
            registry,
            source,
            sink,
            settle_delay,
            interface,
            listener_mode,
            on_ready,
        } = parts;

        // The devices that are already there are known, but not delivered.
        match registry.rescan_changes(false) {
            Ok(devices) => log::debug!("{}: {} device(s) attached", self.name, devices.len()),
            Err(e) => log::warn!("{}: initial rescan failed: {e}", self.name),
        }

        let halted = Arc::new(AtomicBool::new(false));
        let bridge = Arc::new(DeliveryBridge::new(sink, self.gate.clone()));
        let (tx, rx) = unbounded();
        let worker = RescanWorker::new(registry.clone(), bridge.clone(), halted.clone());
        let worker = match worker.spawn(rx, format!("{}-worker", self.name)) {
            Ok(w) => w,
            Err(e) => {
                self.fail(&registry, format!("failed to spawn the rescan worker: {e}"));
                return;
            }
        };
        let listener = match spawn_listener(source, settle_delay, interface, tx, self.gate.clone()) {
            Ok(l) => l,
            Err(e) => {
                halted.store(true, Ordering::Release);
                self.fail(&registry, e.to_string());
                return;
            }
        };

        *self.state.lock() = SessionState::Active;
        if let Some(on_ready) = on_ready {
            on_ready();
        }

        // Stay here for as long as the session is active.
        self.gate.wait_while_open();

        let listener_state = listener.stop(listener_mode);
        halted.store(true, Ordering::Release);
        if listener_mode == ListenerMode::Joined && worker.join().is_err() {
            log::error!("{}: rescan worker panicked", self.name);
        }
        registry.clear();

        let final_state = match listener_state {
            ListenerState::Failed(reason) => SessionState::Failed(reason),
            _ => SessionState::Stopped,
        };
        log::info!(
            "{} ended: {final_state:?}, {} device(s) delivered",
            self.name,
            bridge.delivered()
        );
        *self.state.lock() = final_state;
    }

    fn fail(&self, registry: &DeviceRegistry, reason: String) {
        log::error!("{}: {reason}", self.name);
        self.gate.close();
        registry.clear();
        *self.state.lock() = SessionState::Failed(reason);
    }
}
