// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The table of devices hosted by this worker, indexed by proxy-assigned
//! id.

use remote_pci_core::PciDevice;
use remote_protocol::MAX_REMOTE_DEVICES;
use remote_protocol::PciInfo;
use thiserror::Error;

/// Device id past the table's addressable range.
#[derive(Debug, Error)]
#[error("device id {0} out of range")]
pub(crate) struct IdOutOfRange(pub u64);

/// One hosted device.
pub(crate) struct DeviceEntry {
    /// The logical device name from the creation options, used for
    /// removal.
    pub name: String,
    pub device: Box<dyn PciDevice>,
    /// Configuration-space identity, captured from the creating factory.
    pub pci_info: PciInfo,
    /// Set by the first SET_IRQFD; config and BAR traffic short-circuits
    /// until then.
    pub created: bool,
}

/// Grow-only sparse table of devices.
///
/// The worker owns the devices; the proxy refers to them only by index.
#[derive(Default)]
pub(crate) struct DeviceTable {
    slots: Vec<Option<DeviceEntry>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `device` at `id`, growing the table with empty slots as
    /// needed. An occupied slot is overwritten; the displaced entry is
    /// returned for the caller to tear down.
    pub fn add(
        &mut self,
        id: u64,
        name: String,
        device: Box<dyn PciDevice>,
        pci_info: PciInfo,
    ) -> Result<Option<DeviceEntry>, IdOutOfRange> {
        if id >= MAX_REMOTE_DEVICES {
            return Err(IdOutOfRange(id));
        }
        let index = id as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        Ok(self.slots[index].replace(DeviceEntry {
            name,
            device,
            pci_info,
            created: false,
        }))
    }

    /// Looks up the device at `id`; out-of-bounds ids and empty slots both
    /// miss.
    pub fn get_mut(&mut self, id: u64) -> Option<&mut DeviceEntry> {
        self.slots.get_mut(id as usize)?.as_mut()
    }

    /// Removes the device with logical name `name`.
    pub fn remove_by_name(&mut self, name: &str) -> Option<DeviceEntry> {
        self.slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|entry| entry.name == name))?
            .take()
    }

    /// The lowest unoccupied id.
    pub fn first_free_id(&self) -> u64 {
        self.slots
            .iter()
            .position(|slot| slot.is_none())
            .unwrap_or(self.slots.len()) as u64
    }

    /// Iterates over occupied slots.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceEntry> {
        self.slots.iter_mut().filter_map(|slot| slot.as_mut())
    }
}
