// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits and machine-side state for emulated PCI devices hosted in a
//! remote worker process.
//!
//! The worker owns the devices; the hypervisor-side proxy holds only an
//! integer id per device. Device models implement [`PciDevice`] and are
//! constructed through a [`DeviceFactory`] looked up by driver name from
//! JSON options.

#![forbid(unsafe_code)]

mod bus;
mod machine;
pub mod testing;

pub use bus::Bus;
pub use bus::BusRegion;
pub use bus::MemTxError;
pub use bus::MemTxResult;
pub use bus::MmioHandler;
pub use machine::MachineSnapshot;
pub use machine::MachineState;
pub use machine::NoSnapshot;
pub use machine::RamRegion;
pub use machine::SysmemError;
pub use machine::SystemMemory;

use parking_lot::Mutex;
use remote_protocol::PciInfo;
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by device models and factories. These are reported back
/// to the proxy and never tear the link down.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unknown device driver {0:?}")]
    UnknownDriver(String),
    #[error("invalid device options: {0}")]
    InvalidOptions(String),
    #[error("irq vector {vector} out of range (device has {count})")]
    IrqVectorOutOfRange { vector: u32, count: u32 },
}

/// A BAR exposed by a device, to be mapped into one of the machine's
/// address spaces.
pub struct BarSpec {
    /// Region name, unique per device.
    pub name: String,
    /// Memory space when true, I/O space otherwise.
    pub memory: bool,
    /// Base address in the selected space.
    pub base: u64,
    /// Region length in bytes.
    pub len: u64,
    /// Access callbacks, shared with the device.
    pub handler: Arc<Mutex<dyn MmioHandler>>,
}

/// An emulated PCI device hosted by the remote worker.
///
/// The device's configuration-space identity lives with its factory
/// ([`DeviceFactory::typeinfo`]); the worker captures it when the device
/// is created.
pub trait PciDevice: Send {
    /// Reads `len` bytes (1, 2, or 4) of configuration space at `addr`.
    fn config_read(&mut self, addr: u32, len: u32) -> u32;

    /// Writes `len` bytes (1, 2, or 4) of configuration space at `addr`.
    fn config_write(&mut self, addr: u32, val: u32, len: u32);

    /// BAR regions to map when the device is installed.
    fn bar_regions(&self) -> Vec<BarSpec> {
        Vec::new()
    }

    /// Installs the interrupt fd pair for `vector`.
    fn set_irqfd(
        &mut self,
        vector: u32,
        irqfd: OwnedFd,
        resample: OwnedFd,
    ) -> Result<(), DeviceError>;

    /// Returns the device to its cold-boot state.
    fn reset(&mut self);
}

/// Constructor capability for one driver name.
pub trait DeviceFactory: Send + Sync {
    /// The configuration-space identity of devices this factory creates.
    fn typeinfo(&self) -> PciInfo;

    /// Builds a device from JSON options (reserved keys already stripped).
    fn create(
        &self,
        options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Box<dyn PciDevice>, DeviceError>;
}

/// Driver-name-keyed factory table, populated at bootstrap before any
/// device creation message is processed.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, Box<dyn DeviceFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `driver`, replacing any previous entry.
    pub fn register(&mut self, driver: impl Into<String>, factory: Box<dyn DeviceFactory>) {
        self.factories.insert(driver.into(), factory);
    }

    /// Looks up the factory for `driver`.
    pub fn get(&self, driver: &str) -> Result<&dyn DeviceFactory, DeviceError> {
        self.factories
            .get(driver)
            .map(|factory| factory.as_ref())
            .ok_or_else(|| DeviceError::UnknownDriver(driver.to_string()))
    }
}
