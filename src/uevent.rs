//! Device hotplug notifications (uevents), received from udev.

use std::{ffi::OsStr, io, os::fd::AsRawFd};

use mio::{unix::SourceFd, Interest, Registry, Token};

use crate::{
    config::InterfaceFilter,
    listener::ListenerError,
    source::NotificationSource,
};

/// What happened to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Arrival,
    Removal,
}

/// A device arrival or removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    /// Path of the device in sysfs, relative to `/sys`.
    pub device_path: String,
    pub subsystem: String,
    pub devtype: Option<String>,
    pub seqnum: Option<u64>,
}

impl Notification {
    pub fn matches(&self, filter: &InterfaceFilter) -> bool {
        self.subsystem == filter.subsystem
            && filter
                .devtype
                .as_ref()
                .map_or(true, |t| self.devtype.as_ref() == Some(t))
    }

    /// Formats the notification the way the kernel sends it.
    pub fn to_uevent(&self) -> Vec<u8> {
        let action = match self.kind {
            NotificationKind::Arrival => "add",
            NotificationKind::Removal => "remove",
        };
        let mut msg = format!(
            "{action}@{path}\0ACTION={action}\0DEVPATH={path}\0SUBSYSTEM={subsystem}\0",
            path = self.device_path,
            subsystem = self.subsystem,
        );
        if let Some(devtype) = &self.devtype {
            msg.push_str(&format!("DEVTYPE={devtype}\0"));
        }
        if let Some(seqnum) = self.seqnum {
            msg.push_str(&format!("SEQNUM={seqnum}\0"));
        }
        msg.into_bytes()
    }
}

/// Parses a uevent message in the kernel format: a `action@devpath` header followed by
/// NUL-separated `KEY=value` pairs. [`PairedSource`](crate::source::PairedSource) uses
/// this format to replay recorded notifications.
///
/// Returns `None` for messages that are not arrivals or removals, and for
/// the messages rebroadcast by udev (which start with `libudev`).
pub fn parse_uevent(msg: &[u8]) -> Option<Notification> {
    let mut fields = msg
        .split(|b| *b == 0)
        .filter(|f| !f.is_empty())
        .map(String::from_utf8_lossy);
    let header = fields.next()?;
    if header.starts_with("libudev") || !header.contains('@') {
        return None;
    }

    let mut action = None;
    let mut device_path = None;
    let mut subsystem = None;
    let mut devtype = None;
    let mut seqnum = None;
    for field in fields {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        match key {
            "ACTION" => action = Some(value.to_owned()),
            "DEVPATH" => device_path = Some(value.to_owned()),
            "SUBSYSTEM" => subsystem = Some(value.to_owned()),
            "DEVTYPE" => devtype = Some(value.to_owned()),
            "SEQNUM" => seqnum = value.parse().ok(),
            _ => (),
        }
    }
    let kind = match action?.as_str() {
        "add" => NotificationKind::Arrival,
        "remove" => NotificationKind::Removal,
        _ => return None,
    };
    Some(Notification {
        kind,
        device_path: device_path?,
        subsystem: subsystem?,
        devtype,
        seqnum,
    })
}

/// Monitor of the device events that udev broadcasts once it has processed them.
///
/// The monitor only receives the events of the configured interface class; the filter
/// is installed on the socket by libudev.
pub struct UeventSocket {
    interface: InterfaceFilter,
    socket: Option<udev::MonitorSocket>,
}

impl UeventSocket {
    pub fn new(interface: InterfaceFilter) -> Self {
        Self {
            interface,
            socket: None,
        }
    }

    fn listen(&self) -> io::Result<udev::MonitorSocket> {
        let builder = udev::MonitorBuilder::new()?;
        let builder = match &self.interface.devtype {
            Some(devtype) => builder.match_subsystem_devtype(&self.interface.subsystem, devtype)?,
            None => builder.match_subsystem(&self.interface.subsystem)?,
        };
        let socket = builder.listen()?;

        // mio is edge-triggered: the socket is drained until it would block
        let fd = socket.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(socket)
    }
}

impl NotificationSource for UeventSocket {
    fn register(
        &mut self,
        endpoint: &str,
        registry: &Registry,
        token: Token,
    ) -> Result<(), ListenerError> {
        let failed = |e: io::Error| ListenerError::RegistrationFailed {
            endpoint: endpoint.to_owned(),
            code: e.raw_os_error().unwrap_or(-1),
        };
        let socket = self.listen().map_err(failed)?;
        registry
            .register(&mut SourceFd(&socket.as_raw_fd()), token, Interest::READABLE)
            .map_err(failed)?;
        self.socket = Some(socket);
        log::debug!("{endpoint}: udev monitor registered for {:?}", self.interface);
        Ok(())
    }

    fn read_notifications(&mut self, out: &mut Vec<Notification>) -> io::Result<()> {
        let Some(socket) = &self.socket else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "monitor not registered"));
        };
        for event in socket.iter() {
            let kind = match event.event_type() {
                udev::EventType::Add => NotificationKind::Arrival,
                udev::EventType::Remove => NotificationKind::Removal,
                other => {
                    log::trace!("ignoring {other:?} of {:?}", event.devpath());
                    continue;
                }
            };
            out.push(Notification {
                kind,
                device_path: event.devpath().to_string_lossy().into_owned(),
                subsystem: lossy(event.subsystem()).unwrap_or_default(),
                devtype: lossy(event.devtype()),
                seqnum: Some(event.sequence_number()),
            });
        }
        Ok(())
    }
}

fn lossy(value: Option<&OsStr>) -> Option<String> {
    value.map(|v| v.to_string_lossy().into_owned())
}
