//! Listen to device notifications.

use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    mem,
    os::fd::AsRawFd,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::Sender;
use mio::{unix::SourceFd, Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use thiserror::Error;
use timerfd::TimerFd;

use crate::{
    config::{InterfaceFilter, ListenerMode},
    gate::ReadinessGate,
    source::NotificationSource,
    uevent::{Notification, NotificationKind},
};

const SOURCE_TOKEN: Token = Token(0);
const TIMER_TOKEN: Token = Token(1);
const WAKE_TOKEN: Token = Token(2);

static LISTENER_COUNT: AtomicU64 = AtomicU64::new(0);

/// Error of the notification listener.
///
/// Every error is fatal for the listener: it is not retried.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to register the notification endpoint {endpoint} (os error {code})")]
    RegistrationFailed { endpoint: String, code: i32 },
    #[error("failed to initialize epoll")]
    PollInit(#[source] io::Error),
    #[error("failed to spawn the listener thread")]
    Spawn(#[source] io::Error),
    #[error("poll.poll() returned an error")]
    Dispatch(#[source] io::Error),
    #[error("failed to read the notifications")]
    Read(#[source] io::Error),
    #[error("could not set up a timer with delay {0:?} for the settle delay")]
    Timer(Duration, #[source] io::Error),
}

/// Lifecycle of a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Registered,
    Listening,
    Stopped,
    Failed(String),
}

/// Notifications received during a settle window, coalesced by device path.
///
/// When a device appears several times, only its latest notification is kept.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PendingRescan {
    by_path: HashMap<String, NotificationKind>,
}

impl PendingRescan {
    pub fn record(&mut self, notification: Notification) {
        self.by_path
            .insert(notification.device_path, notification.kind);
    }

    pub fn has_removals(&self) -> bool {
        self.by_path.values().any(|k| *k == NotificationKind::Removal)
    }

    pub fn has_arrivals(&self) -> bool {
        self.by_path.values().any(|k| *k == NotificationKind::Arrival)
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

/// Handle to a listener thread.
///
/// Dropping the handle stops the listener, without waiting for it.
pub struct ListenerHandle {
    endpoint: String,
    thread_handle: Option<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
    waker: Waker,
    state: Arc<Mutex<ListenerState>>,
}

impl ListenerHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ListenerState {
        self.state.lock().clone()
    }

    /// Signals the listener to stop.
    ///
    /// In [`ListenerMode::Joined`], waits for the thread to terminate and returns its final state.
    /// In [`ListenerMode::Detached`], returns immediately with the current state.
    pub fn stop(mut self, mode: ListenerMode) -> ListenerState {
        self.signal_stop();
        let Some(handle) = self.thread_handle.take() else {
            return self.state();
        };
        match mode {
            ListenerMode::Joined => {
                if handle.join().is_err() {
                    log::error!("{}: listener thread panicked", self.endpoint);
                    *self.state.lock() = ListenerState::Failed(String::from("panicked"));
                }
            }
            ListenerMode::Detached => drop(handle),
        }
        self.state()
    }

    fn signal_stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            log::error!("{}: failed to wake the listener up: {e}", self.endpoint);
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.signal_stop();
        }
    }
}

/// What to do after handling an event.
enum Flow {
    Continue,
    Stop,
}

struct Dispatcher {
    source: Box<dyn NotificationSource>,
    interface: InterfaceFilter,
    settle_delay: Duration,
    settle_timer: Option<TimerFd>,
    settling: bool,
    received: Vec<Notification>,
    pending: PendingRescan,
    rescans: Sender<PendingRescan>,
}

impl Dispatcher {
    fn on_readable(&mut self, poll: &Poll) -> Result<Flow, ListenerError> {
        self.source
            .read_notifications(&mut self.received)
            .map_err(ListenerError::Read)?;
        for notification in self.received.drain(..) {
            if !notification.matches(&self.interface) {
                log::trace!("ignoring {notification:?}");
                continue;
            }
            log::debug!(
                "{:?} of {} (seqnum {:?})",
                notification.kind,
                notification.device_path,
                notification.seqnum
            );
            self.pending.record(notification);
        }

        if self.pending.is_empty() {
            Ok(Flow::Continue)
        } else if self.settle_delay.is_zero() {
            Ok(self.flush())
        } else {
            if !self.settling {
                self.start_settling(poll)?;
            }
            Ok(Flow::Continue)
        }
    }

    fn on_timer(&mut self) -> Flow {
        if let Some(timer) = &mut self.settle_timer {
            // the timer is readable, this does not block
            timer.read();
        }
        self.settling = false;
        self.flush()
    }

    /// Hands the pending notifications to the rescan worker.
    fn flush(&mut self) -> Flow {
        if self.pending.is_empty() {
            return Flow::Continue;
        }
        let batch = mem::take(&mut self.pending);
        log::debug!("settled: {} device(s) to rescan", batch.len());
        match self.rescans.send(batch) {
            Ok(()) => Flow::Continue,
            Err(_) => {
                log::debug!("the rescan worker is gone");
                Flow::Stop
            }
        }
    }

    /// Arms the settle timer. The notifications that arrive before it expires
    /// are coalesced with the pending ones.
    fn start_settling(&mut self, poll: &Poll) -> Result<(), ListenerError> {
        let delay = self.settle_delay;
        log::trace!("settling for {delay:?}");
        let mut register = false;
        if self.settle_timer.is_none() {
            // create the timer, don't register it yet because it is not configured
            self.settle_timer = Some(TimerFd::new().map_err(|e| ListenerError::Timer(delay, e))?);
            register = true;
        }

        if let Some(timer) = &mut self.settle_timer {
            timer.set_state(
                timerfd::TimerState::Oneshot(delay),
                timerfd::SetTimeFlags::Default,
            );
            if register {
                let fd = timer.as_raw_fd();
                poll.registry()
                    .register(&mut SourceFd(&fd), TIMER_TOKEN, Interest::READABLE)
                    .map_err(|e| ListenerError::Timer(delay, e))?;
            }
        }
        self.settling = true;
        Ok(())
    }
}

/// Starts a thread that receives the notifications of `source`, coalesces them for
/// `settle_delay`, and sends the resulting batches to `rescans`.
///
/// If the listener fails, `gate` is closed, which ends the session.
pub(crate) fn spawn_listener(
    mut source: Box<dyn NotificationSource>,
    settle_delay: Duration,
    interface: InterfaceFilter,
    rescans: Sender<PendingRescan>,
    gate: Arc<ReadinessGate>,
) -> Result<ListenerHandle, ListenerError> {
    let endpoint = format!(
        "usb-watcher-listener-{}",
        LISTENER_COUNT.fetch_add(1, Ordering::Relaxed)
    );
    let mut poll = Poll::new().map_err(ListenerError::PollInit)?;
    let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(ListenerError::PollInit)?;

    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_thread = stop_flag.clone();
    let state = Arc::new(Mutex::new(ListenerState::Created));
    let state_thread = state.clone();
    let endpoint_thread = endpoint.clone();

    // Declare the polling loop separately to handle errors in a nicer way.
    let poll_loop = move || -> Result<(), ListenerError> {
        source.register(&endpoint_thread, poll.registry(), SOURCE_TOKEN)?;
        *state_thread.lock() = ListenerState::Registered;

        let mut dispatcher = Dispatcher {
            source,
            interface,
            settle_delay,
            settle_timer: None,
            settling: false,
            received: Vec::with_capacity(8),
            pending: PendingRescan::default(),
            rescans,
        };
        let mut events = Events::with_capacity(8);
        *state_thread.lock() = ListenerState::Listening;
        log::debug!("{endpoint_thread}: listening");

        loop {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue; // retry
                } else {
                    return Err(ListenerError::Dispatch(e));
                }
            }
            for event in events.iter() {
                let flow = match event.token() {
                    SOURCE_TOKEN => dispatcher.on_readable(&poll)?,
                    TIMER_TOKEN => dispatcher.on_timer(),
                    WAKE_TOKEN if stop_flag_thread.load(Ordering::Acquire) => Flow::Stop,
                    _ => Flow::Continue,
                };
                if let Flow::Stop = flow {
                    return Ok(());
                }
            }
        }
    };

    let state_exit = state.clone();
    let endpoint_exit = endpoint.clone();
    let thread_handle = thread::Builder::new()
        .name(endpoint.clone())
        .spawn(move || {
            let final_state = match poll_loop() {
                Ok(()) => ListenerState::Stopped,
                Err(e) => {
                    log::error!("{endpoint_exit}: {e}");
                    ListenerState::Failed(e.to_string())
                }
            };
            log::debug!("{endpoint_exit}: {final_state:?}");
            let failed = matches!(final_state, ListenerState::Failed(_));
            // the state must be set before the session wakes up
            *state_exit.lock() = final_state;
            if failed {
                gate.close();
            }
        })
        .map_err(ListenerError::Spawn)?;

    Ok(ListenerHandle {
        endpoint,
        thread_handle: Some(thread_handle),
        stop_flag,
        waker,
        state,
    })
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use crossbeam_channel::unbounded;
    use mio::{Registry, Token};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::source::PairedSource;

    fn notification(kind: NotificationKind, path: &str) -> Notification {
        Notification {
            kind,
            device_path: path.to_owned(),
            subsystem: "usb".to_owned(),
            devtype: Some("usb_device".to_owned()),
            seqnum: None,
        }
    }

    #[test]
    fn latest_notification_wins() {
        let mut pending = PendingRescan::default();
        pending.record(notification(NotificationKind::Arrival, "/devices/usb1/1-1"));
        pending.record(notification(NotificationKind::Removal, "/devices/usb1/1-1"));
        assert_eq!(1, pending.len());
        assert!(pending.has_removals());
        assert!(!pending.has_arrivals());

        pending.record(notification(NotificationKind::Arrival, "/devices/usb1/1-2"));
        assert_eq!(2, pending.len());
        assert!(pending.has_arrivals());
    }

    #[test]
    fn coalesce_within_settle_window() {
        let (source, feeder) = PairedSource::pair().unwrap();
        let (tx, rx) = unbounded();
        let gate = Arc::new(ReadinessGate::new());
        let listener = spawn_listener(
            Box::new(source),
            Duration::from_millis(200),
            InterfaceFilter::default(),
            tx,
            gate,
        )
        .unwrap();

        feeder.send(&notification(NotificationKind::Arrival, "/devices/usb1/1-1")).unwrap();
        feeder.send(&notification(NotificationKind::Arrival, "/devices/usb1/1-2")).unwrap();
        feeder.send(&notification(NotificationKind::Removal, "/devices/usb1/1-1")).unwrap();
        // not a usb_device: filtered out
        let mut iface = notification(NotificationKind::Arrival, "/devices/usb1/1-3/1-3:1.0");
        iface.devtype = Some("usb_interface".to_owned());
        feeder.send(&iface).unwrap();

        let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(2, batch.len());
        assert!(batch.has_arrivals() && batch.has_removals());
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        assert_eq!(ListenerState::Listening, listener.state());
        assert_eq!(ListenerState::Stopped, listener.stop(ListenerMode::Joined));
    }

    struct RejectingSource;

    impl NotificationSource for RejectingSource {
        fn register(&mut self, endpoint: &str, _: &Registry, _: Token) -> Result<(), ListenerError> {
            Err(ListenerError::RegistrationFailed {
                endpoint: endpoint.to_owned(),
                code: libc::EPERM,
            })
        }

        fn read_notifications(&mut self, _: &mut Vec<Notification>) -> io::Result<()> {
            unreachable!("never registered")
        }
    }

    #[test]
    fn registration_failure_closes_the_gate() {
        let (tx, _rx) = unbounded();
        let gate = Arc::new(ReadinessGate::new());
        gate.open();
        let listener = spawn_listener(
            Box::new(RejectingSource),
            Duration::ZERO,
            InterfaceFilter::default(),
            tx,
            gate.clone(),
        )
        .unwrap();

        gate.wait_while_open();
        let endpoint = listener.endpoint().to_owned();
        match listener.stop(ListenerMode::Joined) {
            ListenerState::Failed(reason) => {
                assert!(reason.contains(&endpoint), "{reason}");
                assert!(reason.contains("os error 1"), "{reason}");
            }
            other => panic!("unexpected state {other:?}"),
        }
    }
}
