//! Single-writer device registry.
//!
//! Each probe owns one [`Registry`]; nothing else mutates it, so no locking
//! is involved.

use std::collections::hash_map::{Entry, HashMap};

use chrono::{DateTime, Duration, Utc};

use crate::device::Device;

/// Mapping from a probe's lookup key to its devices.
#[derive(Debug, Clone)]
pub struct Registry<I> {
    devices: HashMap<String, Device<I>>,
}

impl<I> Default for Registry<I> {
    fn default() -> Self {
        Self {
            devices: HashMap::new(),
        }
    }
}

impl<I> Registry<I> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Returns `true` when no device is tracked.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Returns `true` when `id` is tracked.
    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Look up a device.
    pub fn get(&self, id: &str) -> Option<&Device<I>> {
        self.devices.get(id)
    }

    /// Look up a device for mutation.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Device<I>> {
        self.devices.get_mut(id)
    }

    /// Insert or replace a device.
    pub fn insert(&mut self, id: impl Into<String>, device: Device<I>) {
        self.devices.insert(id.into(), device);
    }

    /// Fetch a device, creating it on first sighting.
    ///
    /// The flag is `true` when the device was created by this call.
    pub fn get_or_insert_with(
        &mut self,
        id: &str,
        create: impl FnOnce() -> Device<I>,
    ) -> (&mut Device<I>, bool) {
        match self.devices.entry(id.to_owned()) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => (entry.insert(create()), true),
        }
    }

    /// Iterate over `(id, device)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Device<I>)> {
        self.devices.iter().map(|(id, device)| (id.as_str(), device))
    }

    /// Iterate mutably over `(id, device)` pairs.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Device<I>)> {
        self.devices
            .iter_mut()
            .map(|(id, device)| (id.as_str(), device))
    }

    /// Remove every device whose age exceeds `window` and return them.
    pub fn expire(&mut self, now: DateTime<Utc>, window: Duration) -> Vec<Device<I>> {
        let stale: Vec<String> = self
            .devices
            .iter()
            .filter(|(_, device)| device.age(now) > window)
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.devices.remove(&id))
            .collect()
    }
}
