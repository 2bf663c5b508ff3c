//! Registry of the known USB storage devices.

use std::{collections::HashSet, sync::Arc};

use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    device::{Device, DeviceProperties, DeviceStatus, IdentityKey, PropertyName},
    provider::{DeviceProvider, ProviderError},
};

/// Error returned by device lookups.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("no device with {property} = {value:?}")]
    NotFound { property: PropertyName, value: String },
    #[error("invalid lookup: {0}")]
    InvalidArgument(String),
    #[error("failed to enumerate the devices")]
    Provider(#[from] ProviderError),
}

/// Ordered collection of the known devices, with at most one entry per [`IdentityKey`].
///
/// The registry is only modified by [`rescan`](Self::rescan) (and its variants
/// [`rescan_changes`](Self::rescan_changes) and [`rescan_changes_in`](Self::rescan_changes_in))
/// and by [`clear`](Self::clear).
/// Queries return copies of the entries.
pub struct DeviceRegistry {
    provider: Arc<dyn DeviceProvider>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// In insertion order.
    devices: Vec<Device>,
    last_number: u32,
    last_changed: Option<IdentityKey>,
    /// Incremented by every [`clear`](DeviceRegistry::clear).
    generation: u64,
}

impl State {
    fn position(&self, key: &IdentityKey) -> Option<usize> {
        self.devices.iter().position(|d| &d.key() == key)
    }

    fn next_number(&mut self) -> u32 {
        self.last_number += 1;
        self.last_number
    }

    /// Marks as removed the devices that are not attached anymore.
    fn apply_removals(&mut self, attached: &[DeviceProperties], changes: &mut Vec<Device>) {
        for device in self.devices.iter_mut() {
            if device.device_status == DeviceStatus::Arrived
                && !attached.iter().any(|p| p.key() == device.key())
            {
                device.device_status = DeviceStatus::Removed;
                changes.push(device.clone());
            }
        }
    }

    /// Inserts the new devices and updates the ones that came back or changed.
    fn apply_arrivals(&mut self, attached: Vec<DeviceProperties>, changes: &mut Vec<Device>) {
        for props in attached {
            match self.position(&props.key()) {
                None => {
                    let device = Device::arrived(self.next_number(), props);
                    changes.push(device.clone());
                    self.devices.push(device);
                }
                Some(i) if self.devices[i].device_status == DeviceStatus::Removed => {
                    let number = self.next_number();
                    let device = &mut self.devices[i];
                    device.device_number = number;
                    device.device_status = DeviceStatus::Arrived;
                    device.drive_letter = props.drive_letter;
                    changes.push(device.clone());
                }
                Some(i) if self.devices[i].drive_letter != props.drive_letter => {
                    let device = &mut self.devices[i];
                    device.drive_letter = props.drive_letter;
                    changes.push(device.clone());
                }
                Some(_) => (),
            }
        }
    }
}

impl DeviceRegistry {
    pub fn new(provider: Arc<dyn DeviceProvider>) -> Self {
        Self {
            provider,
            state: Mutex::new(State::default()),
        }
    }

    /// Enumerates the attached devices, updates the registry and returns the changed entry.
    ///
    /// If `was_removed` is true, the entries of the devices that are no longer attached
    /// are marked as [`DeviceStatus::Removed`]. Otherwise, the attached devices are
    /// inserted, or marked as [`DeviceStatus::Arrived`] if they were removed before.
    ///
    /// If nothing has changed, the entry that changed last is returned again.
    /// Returns `None` if no entry has ever changed.
    pub fn rescan(&self, was_removed: bool) -> Result<Option<Device>, ProviderError> {
        let mut changes = self.rescan_changes(was_removed)?;
        if let Some(device) = changes.pop() {
            return Ok(Some(device));
        }
        let state = self.state.lock();
        let last = state
            .last_changed
            .as_ref()
            .and_then(|key| state.position(key))
            .map(|i| state.devices[i].clone());
        Ok(last)
    }

    /// Like [`rescan`](Self::rescan), but returns every entry that has changed, in order.
    pub fn rescan_changes(&self, was_removed: bool) -> Result<Vec<Device>, ProviderError> {
        self.rescan_inner(None, was_removed)
    }

    /// Like [`rescan_changes`](Self::rescan_changes), but only applies the changes if the
    /// registry has not been cleared since [`generation`](Self::generation) returned `generation`.
    ///
    /// The check and the update are done under the same lock: a rescan that was running
    /// while the registry got cleared changes nothing.
    pub fn rescan_changes_in(
        &self,
        generation: u64,
        was_removed: bool,
    ) -> Result<Vec<Device>, ProviderError> {
        self.rescan_inner(Some(generation), was_removed)
    }

    /// The number of times the registry has been cleared.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn rescan_inner(
        &self,
        generation: Option<u64>,
        was_removed: bool,
    ) -> Result<Vec<Device>, ProviderError> {
        // Don't hold the lock while the provider reads the devices.
        let attached = dedup_by_key(self.provider.attached_devices()?);
        let mut changes = Vec::new();

        let mut state = self.state.lock();
        if generation.is_some_and(|g| g != state.generation) {
            log::debug!("rescan(was_removed: {was_removed}) discarded: registry cleared");
            return Ok(changes);
        }
        if was_removed {
            state.apply_removals(&attached, &mut changes);
        } else {
            state.apply_arrivals(attached, &mut changes);
        }
        if let Some(last) = changes.last() {
            state.last_changed = Some(last.key());
        }
        log::trace!("rescan(was_removed: {was_removed}): {} changes", changes.len());
        Ok(changes)
    }

    /// Returns a snapshot of the registry.
    pub fn list_all(&self) -> Vec<Device> {
        self.state.lock().devices.clone()
    }

    /// Returns the first entry whose property `name` is equal to `value`.
    pub fn find_by_property(&self, name: PropertyName, value: &str) -> Result<Device, LookupError> {
        let state = self.state.lock();
        state
            .devices
            .iter()
            .find(|d| d.matches(name, value))
            .cloned()
            .ok_or_else(|| LookupError::NotFound {
                property: name,
                value: value.to_owned(),
            })
    }

    /// Removes every entry and restarts the numbering.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let generation = state.generation + 1;
        *state = State {
            generation,
            ..State::default()
        };
    }

    pub fn len(&self) -> usize {
        self.state.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps the first device of each identity.
///
/// Identical devices without serial number share an identity; the registry can only
/// track one of them.
fn dedup_by_key(mut attached: Vec<DeviceProperties>) -> Vec<DeviceProperties> {
    let mut seen = HashSet::with_capacity(attached.len());
    attached.retain(|props| {
        let first = seen.insert(props.key());
        if !first {
            log::debug!("ignoring {props:?}: another device has the same identity");
        }
        first
    });
    attached
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{collections::HashSet, sync::Arc};

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;

    /// Provider whose attached devices are set by the test.
    #[derive(Clone, Default)]
    pub(crate) struct FakeBus(pub Arc<Mutex<Vec<DeviceProperties>>>);

    impl FakeBus {
        pub fn plug(&self, props: DeviceProperties) {
            self.0.lock().push(props);
        }

        pub fn unplug(&self, key: &IdentityKey) {
            self.0.lock().retain(|p| &p.key() != key);
        }
    }

    impl DeviceProvider for FakeBus {
        fn attached_devices(&self) -> Result<Vec<DeviceProperties>, ProviderError> {
            Ok(self.0.lock().clone())
        }
    }

    fn sandisk() -> DeviceProperties {
        DeviceProperties::new("0781", "5567", "ABC123").with_drive_letter("E:")
    }

    fn registry() -> (FakeBus, DeviceRegistry) {
        let bus = FakeBus::default();
        let registry = DeviceRegistry::new(Arc::new(bus.clone()));
        (bus, registry)
    }

    #[test]
    fn arrival_then_removal() {
        let (bus, registry) = registry();
        assert_eq!(None, registry.rescan(false).unwrap());
        assert!(registry.is_empty());

        bus.plug(sandisk());
        let arrived = registry.rescan(false).unwrap().unwrap();
        assert_eq!(DeviceStatus::Arrived, arrived.device_status);
        assert_eq!(1, arrived.device_number);
        assert_eq!("E:", arrived.drive_letter);

        bus.unplug(&sandisk().key());
        let removed = registry.rescan(true).unwrap().unwrap();
        assert_eq!(DeviceStatus::Removed, removed.device_status);
        assert_eq!(1, removed.device_number);
        assert_eq!(vec![removed], registry.list_all());
    }

    #[test]
    fn rescan_is_idempotent() {
        let (bus, registry) = registry();
        bus.plug(sandisk());
        let first = registry.rescan(false).unwrap();
        let snapshot = registry.list_all();
        assert_eq!(first, registry.rescan(false).unwrap());
        assert_eq!(first, registry.rescan(true).unwrap());
        assert_eq!(snapshot, registry.list_all());
        assert!(registry.rescan_changes(false).unwrap().is_empty());
    }

    #[test]
    fn reinsertion_updates_in_place() {
        let (bus, registry) = registry();
        bus.plug(DeviceProperties::new("0951", "1666", "K1"));
        bus.plug(sandisk());
        registry.rescan(false).unwrap();

        bus.unplug(&sandisk().key());
        registry.rescan(true).unwrap();
        bus.plug(sandisk().with_drive_letter("F:"));
        let back = registry.rescan(false).unwrap().unwrap();

        assert_eq!(DeviceStatus::Arrived, back.device_status);
        assert_eq!("F:", back.drive_letter);
        assert_eq!(3, back.device_number, "a new number is assigned on re-arrival");
        let all = registry.list_all();
        assert_eq!(2, all.len());
        assert_eq!("0951", all[0].vendor_id, "insertion order is kept");
        assert_eq!(back, all[1]);
    }

    #[test]
    fn drive_letter_change_is_a_change() {
        let (bus, registry) = registry();
        bus.plug(DeviceProperties::new("0781", "5567", "ABC123"));
        registry.rescan(false).unwrap();
        // the volume is mounted a bit later
        bus.unplug(&sandisk().key());
        bus.plug(sandisk());
        let changes = registry.rescan_changes(false).unwrap();
        assert_eq!(1, changes.len());
        assert_eq!("E:", changes[0].drive_letter);
        assert_eq!(1, changes[0].device_number);
    }

    #[test]
    fn last_event_wins() {
        let (bus, registry) = registry();
        let keys: Vec<DeviceProperties> = (0..4)
            .map(|i| DeviceProperties::new("0781", "5567", format!("SN{i}")))
            .collect();
        let mut expected = std::collections::HashMap::new();

        // deterministic pseudo-random sequence of plug/unplug events
        let mut seed: u32 = 0x2545_f491;
        for _ in 0..200 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let props = &keys[(seed % 4) as usize];
            let plugged = bus.0.lock().iter().any(|p| p.key() == props.key());
            if plugged {
                bus.unplug(&props.key());
                registry.rescan(true).unwrap();
                expected.insert(props.key(), DeviceStatus::Removed);
            } else {
                bus.plug(props.clone());
                registry.rescan(false).unwrap();
                expected.insert(props.key(), DeviceStatus::Arrived);
            }
        }

        let all = registry.list_all();
        assert_eq!(expected.len(), all.len());
        for device in all {
            assert_eq!(expected[&device.key()], device.device_status, "{device}");
        }
    }

    #[test]
    fn find_by_property() {
        let (bus, registry) = registry();
        bus.plug(sandisk());
        registry.rescan(false).unwrap();

        for (name, value) in [
            (PropertyName::VendorId, "0781"),
            (PropertyName::ProductId, "5567"),
            (PropertyName::SerialNumber, "ABC123"),
            (PropertyName::DriveLetter, "E:"),
        ] {
            let found = registry.find_by_property(name, value).unwrap();
            assert_eq!("ABC123", found.serial_number);
        }
        match registry.find_by_property(PropertyName::DriveLetter, "F:") {
            Err(LookupError::NotFound { property, value }) => {
                assert_eq!(PropertyName::DriveLetter, property);
                assert_eq!("F:", value);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(registry
            .find_by_property(PropertyName::VendorId, "1234")
            .is_err());
    }

    #[test]
    fn clear_restarts_numbering() {
        let (bus, registry) = registry();
        bus.plug(sandisk());
        registry.rescan(false).unwrap();
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(None, registry.rescan(true).unwrap());

        let again = registry.rescan(false).unwrap().unwrap();
        assert_eq!(1, again.device_number);
    }

    #[test]
    fn identical_devices_are_tracked_once() {
        let (bus, registry) = registry();
        // two card readers of the same model, without serial number
        bus.plug(DeviceProperties::new("0bda", "0129", "").with_drive_letter("/media/a"));
        bus.plug(DeviceProperties::new("0bda", "0129", "").with_drive_letter("/media/b"));

        let first = registry.rescan_changes(false).unwrap();
        assert_eq!(1, first.len());
        assert_eq!("/media/a", first[0].drive_letter);
        for _ in 0..3 {
            assert!(registry.rescan_changes(false).unwrap().is_empty());
        }
        assert_eq!(first, registry.list_all());
    }

    #[test]
    fn rescan_after_clear_is_discarded() {
        let (bus, registry) = registry();
        let generation = registry.generation();
        bus.plug(sandisk());
        assert_eq!(1, registry.rescan_changes_in(generation, false).unwrap().len());

        registry.clear();
        assert_eq!(generation + 1, registry.generation());
        assert!(registry.rescan_changes_in(generation, false).unwrap().is_empty());
        assert!(registry.is_empty());

        // the current generation is still updated
        let changes = registry.rescan_changes_in(registry.generation(), false).unwrap();
        assert_eq!(1, changes.len());
    }
}
