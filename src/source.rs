//! Sources of device notifications.

use std::{io, os::unix::net::UnixDatagram as StdDatagram};

use mio::{net::UnixDatagram, Interest, Registry, Token};

use crate::{
    listener::ListenerError,
    uevent::{parse_uevent, Notification},
};

/// An OS facility that notifies the arrival and removal of devices.
///
/// The [`Listener`](crate::listener) calls [`register`](Self::register) once, from its own
/// thread, then [`read_notifications`](Self::read_notifications) every time the source is
/// readable.
pub trait NotificationSource: Send {
    /// Creates the endpoint that receives the notifications and registers it to the poll `registry`.
    ///
    /// `endpoint` is a name that is unique to the listener thread.
    fn register(&mut self, endpoint: &str, registry: &Registry, token: Token)
        -> Result<(), ListenerError>;

    /// Reads all the pending notifications, without blocking.
    fn read_notifications(&mut self, out: &mut Vec<Notification>) -> io::Result<()>;
}

/// A source that receives uevent messages from a local [`SourceFeeder`].
///
/// Useful to replay recorded notifications, or to drive a session without hardware.
pub struct PairedSource {
    socket: UnixDatagram,
    buf: Vec<u8>,
}

/// Sends messages to a [`PairedSource`].
pub struct SourceFeeder {
    socket: StdDatagram,
}

impl PairedSource {
    pub fn pair() -> io::Result<(PairedSource, SourceFeeder)> {
        let (ours, theirs) = StdDatagram::pair()?;
        ours.set_nonblocking(true)?;
        let source = PairedSource {
            socket: UnixDatagram::from_std(ours),
            buf: vec![0; 8192],
        };
        Ok((source, SourceFeeder { socket: theirs }))
    }
}

impl NotificationSource for PairedSource {
    fn register(
        &mut self,
        endpoint: &str,
        registry: &Registry,
        token: Token,
    ) -> Result<(), ListenerError> {
        registry
            .register(&mut self.socket, token, Interest::READABLE)
            .map_err(|e| ListenerError::RegistrationFailed {
                endpoint: endpoint.to_owned(),
                code: e.raw_os_error().unwrap_or(-1),
            })
    }

    fn read_notifications(&mut self, out: &mut Vec<Notification>) -> io::Result<()> {
        loop {
            match self.socket.recv(&mut self.buf) {
                // empty datagram, or the feeder has shut down
                Ok(0) => return Ok(()),
                Ok(n) => {
                    if let Some(notification) = parse_uevent(&self.buf[..n]) {
                        out.push(notification);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl SourceFeeder {
    /// Sends a raw uevent message.
    pub fn send_raw(&self, msg: &[u8]) -> io::Result<()> {
        self.socket.send(msg).map(|_| ())
    }

    pub fn send(&self, notification: &Notification) -> io::Result<()> {
        self.send_raw(&notification.to_uevent())
    }
}
