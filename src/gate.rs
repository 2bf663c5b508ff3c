//! Start/stop flag shared by a monitoring session.

use parking_lot::{Condvar, Mutex};

/// Governs whether a session is monitoring, and whether the detected changes are delivered.
///
/// The gate starts closed.
#[derive(Debug, Default)]
pub struct ReadinessGate {
    ready: Mutex<bool>,
    signal: Condvar,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the gate and wakes up a waiter.
    pub fn open(&self) {
        self.set(true);
    }

    /// Closes the gate and wakes up a waiter. Closing a closed gate has no effect.
    pub fn close(&self) {
        self.set(false);
    }

    fn set(&self, ready: bool) {
        {
            let mut guard = self.ready.lock();
            *guard = ready;
        }
        log::trace!("readiness gate set to {ready}");
        self.signal.notify_one();
    }

    pub fn is_open(&self) -> bool {
        *self.ready.lock()
    }

    /// Blocks the current thread for as long as the gate is open.
    ///
    /// Spurious wake-ups are absorbed: the wait only ends once the gate is seen closed.
    /// The next waiter is notified on the way out.
    pub fn wait_while_open(&self) {
        let mut guard = self.ready.lock();
        while *guard {
            self.signal.wait(&mut guard);
        }
        drop(guard);
        self.signal.notify_one();
    }
}
