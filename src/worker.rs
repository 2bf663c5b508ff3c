//! Background worker that rescans the devices after the notifications have settled.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::Receiver;

use crate::{
    bridge::DeliveryBridge, device::Device, listener::PendingRescan, registry::DeviceRegistry,
};

pub(crate) struct RescanWorker {
    registry: Arc<DeviceRegistry>,
    bridge: Arc<DeliveryBridge>,
    /// Set when the session is torn down: the registry must not be touched anymore.
    halted: Arc<AtomicBool>,
    /// Generation of the registry when the session started. Once the registry
    /// has been cleared, the rescans of this worker are discarded.
    generation: u64,
}

impl RescanWorker {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        bridge: Arc<DeliveryBridge>,
        halted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            generation: registry.generation(),
            registry,
            bridge,
            halted,
        }
    }

    /// Rescans the devices for a batch of notifications, and delivers the changes.
    ///
    /// Removals are processed first, so that a device that has been unplugged and
    /// plugged again during the settle delay is seen as present.
    /// Returns the number of delivered devices.
    pub fn process(&self, batch: &PendingRescan) -> usize {
        let mut delivered = 0;
        let passes = [(true, batch.has_removals()), (false, batch.has_arrivals())];
        for (was_removed, needed) in passes {
            if !needed || self.halted.load(Ordering::Acquire) {
                continue;
            }
            match self.registry.rescan_changes_in(self.generation, was_removed) {
                Ok(changes) => {
                    if changes.is_empty() {
                        log::debug!("rescan(was_removed: {was_removed}): nothing changed");
                    }
                    delivered += self.deliver_all(changes);
                }
                Err(e) => log::warn!("rescan(was_removed: {was_removed}) failed: {e}"),
            }
        }
        delivered
    }

    fn deliver_all(&self, changes: Vec<Device>) -> usize {
        changes
            .into_iter()
            .filter(|_| !self.halted.load(Ordering::Acquire))
            .map(|device| self.bridge.deliver(device))
            .filter(|delivered| *delivered)
            .count()
    }

    /// Processes the batches until the listener drops its end of the queue.
    pub fn spawn(self, batches: Receiver<PendingRescan>, name: String) -> io::Result<JoinHandle<()>> {
        thread::Builder::new().name(name).spawn(move || {
            for batch in batches.iter() {
                if self.halted.load(Ordering::Acquire) {
                    break;
                }
                self.process(&batch);
            }
            log::debug!("rescan worker stopped");
        })
    }
}
