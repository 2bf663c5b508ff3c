//! Delivery of the detected changes to the consumer.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::{device::Device, gate::ReadinessGate};

/// Receives the devices that have changed.
///
/// `deliver` is called from the rescan worker thread of the session, one device at a time.
pub trait DeliverySink: Send + Sync {
    fn deliver(&self, device: Device);
}

impl<F: Fn(Device) + Send + Sync> DeliverySink for F {
    fn deliver(&self, device: Device) {
        self(device)
    }
}

impl DeliverySink for Sender<Device> {
    fn deliver(&self, device: Device) {
        if let Err(e) = self.send(device) {
            log::warn!("device dropped, the receiver is gone: {}", e.into_inner());
        }
    }
}

/// Discards every device.
pub struct NullSink;

impl DeliverySink for NullSink {
    fn deliver(&self, _device: Device) {}
}

/// Returns a sink that forwards the devices to a channel, and the receiving end of the channel.
pub fn delivery_channel() -> (Sender<Device>, Receiver<Device>) {
    unbounded()
}

/// Forwards the devices to a [`DeliverySink`], while the session's gate is open.
pub struct DeliveryBridge {
    sink: Arc<dyn DeliverySink>,
    gate: Arc<ReadinessGate>,
    delivered: AtomicU64,
}

impl DeliveryBridge {
    pub fn new(sink: Arc<dyn DeliverySink>, gate: Arc<ReadinessGate>) -> Self {
        Self {
            sink,
            gate,
            delivered: AtomicU64::new(0),
        }
    }

    /// Delivers `device` if the gate is open, and returns whether it has been delivered.
    ///
    /// A device that is not delivered is dropped: it will not be delivered when the gate reopens.
    pub fn deliver(&self, device: Device) -> bool {
        if !self.gate.is_open() {
            log::debug!("gate closed, not delivering {device}");
            return false;
        }
        log::debug!("delivering {device}");
        self.sink.deliver(device);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Number of devices delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}
