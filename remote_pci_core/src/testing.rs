// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mock device types for unit-testing the worker paths.

use crate::BarSpec;
use crate::DeviceError;
use crate::DeviceFactory;
use crate::MemTxResult;
use crate::MmioHandler;
use crate::PciDevice;
use parking_lot::Mutex;
use remote_protocol::PciInfo;
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// Identity reported by [`TestPciDevice`].
pub const TEST_PCI_INFO: PciInfo = PciInfo {
    vendor_id: 0x1de0,
    device_id: 0xabcd,
    class_id: 0x00ff,
    subsystem_id: 0x0001,
};

const CONFIG_SPACE_SIZE: usize = 256;
const BAR_SIZE: u64 = 0x1000;

/// A scratchpad BAR backing store, shared between the device and the bus.
struct ScratchBar {
    bytes: Vec<u8>,
}

impl MmioHandler for ScratchBar {
    fn read(&mut self, offset: u64, data: &mut [u8]) -> MemTxResult<()> {
        let offset = offset as usize;
        data.copy_from_slice(&self.bytes[offset..offset + data.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> MemTxResult<()> {
        let offset = offset as usize;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// A test-only PCI device: a 256-byte config space seeded with
/// [`TEST_PCI_INFO`] and one scratchpad BAR.
pub struct TestPciDevice {
    name: String,
    config: [u8; CONFIG_SPACE_SIZE],
    bar_base: u64,
    bar_memory: bool,
    bar: Arc<Mutex<ScratchBar>>,
    irqfds: Vec<(u32, OwnedFd, OwnedFd)>,
}

impl TestPciDevice {
    /// Builds the device. `bar_base` positions the scratch BAR; `memory`
    /// selects the address space it maps into.
    pub fn new(name: impl Into<String>, bar_base: u64, bar_memory: bool) -> Self {
        let mut config = [0u8; CONFIG_SPACE_SIZE];
        config[0..2].copy_from_slice(&TEST_PCI_INFO.vendor_id.to_le_bytes());
        config[2..4].copy_from_slice(&TEST_PCI_INFO.device_id.to_le_bytes());
        config[10..12].copy_from_slice(&TEST_PCI_INFO.class_id.to_le_bytes());
        config[46..48].copy_from_slice(&TEST_PCI_INFO.subsystem_id.to_le_bytes());
        Self {
            name: name.into(),
            config,
            bar_base,
            bar_memory,
            bar: Arc::new(Mutex::new(ScratchBar {
                bytes: vec![0; BAR_SIZE as usize],
            })),
            irqfds: Vec::new(),
        }
    }

    /// Vectors with an installed irqfd pair.
    pub fn irq_vectors(&self) -> Vec<u32> {
        self.irqfds.iter().map(|(vector, _, _)| *vector).collect()
    }
}

impl PciDevice for TestPciDevice {
    fn config_read(&mut self, addr: u32, len: u32) -> u32 {
        let mut val = 0u32;
        for i in (0..len.min(4)).rev() {
            let byte = self
                .config
                .get((addr + i) as usize)
                .copied()
                .unwrap_or(0xff);
            val = (val << 8) | u32::from(byte);
        }
        val
    }

    fn config_write(&mut self, addr: u32, val: u32, len: u32) {
        for i in 0..len.min(4) {
            if let Some(byte) = self.config.get_mut((addr + i) as usize) {
                *byte = (val >> (8 * i)) as u8;
            }
        }
    }

    fn bar_regions(&self) -> Vec<BarSpec> {
        vec![BarSpec {
            name: self.name.clone(),
            memory: self.bar_memory,
            base: self.bar_base,
            len: BAR_SIZE,
            handler: self.bar.clone(),
        }]
    }

    fn set_irqfd(
        &mut self,
        vector: u32,
        irqfd: OwnedFd,
        resample: OwnedFd,
    ) -> Result<(), DeviceError> {
        if vector >= 8 {
            return Err(DeviceError::IrqVectorOutOfRange { vector, count: 8 });
        }
        self.irqfds.push((vector, irqfd, resample));
        Ok(())
    }

    fn reset(&mut self) {
        self.bar.lock().bytes.fill(0);
        self.irqfds.clear();
    }
}

/// Factory for [`TestPciDevice`], honoring optional `bar_base` and
/// `bar_memory` options.
pub struct TestPciDeviceFactory;

impl DeviceFactory for TestPciDeviceFactory {
    fn typeinfo(&self) -> PciInfo {
        TEST_PCI_INFO
    }

    fn create(
        &self,
        options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Box<dyn PciDevice>, DeviceError> {
        let name = options
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("testpci")
            .to_string();
        let bar_base = match options.get("bar_base") {
            None => 0x1000,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| DeviceError::InvalidOptions("bar_base must be a number".into()))?,
        };
        let bar_memory = match options.get("bar_memory") {
            None => true,
            Some(v) => v
                .as_bool()
                .ok_or_else(|| DeviceError::InvalidOptions("bar_memory must be a bool".into()))?,
        };
        Ok(Box::new(TestPciDevice::new(name, bar_base, bar_memory)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_space_identity() {
        let mut dev = TestPciDevice::new("t", 0x1000, true);
        let vendor_device = dev.config_read(0, 4);
        assert_eq!(
            vendor_device,
            u32::from(TEST_PCI_INFO.vendor_id) | (u32::from(TEST_PCI_INFO.device_id) << 16)
        );
        assert_eq!(dev.config_read(0, 2), u32::from(TEST_PCI_INFO.vendor_id));
    }

    #[test]
    fn config_write_read_back() {
        let mut dev = TestPciDevice::new("t", 0x1000, true);
        dev.config_write(0x40, 0xa1b2_c3d4, 4);
        assert_eq!(dev.config_read(0x40, 4), 0xa1b2_c3d4);
        dev.config_write(0x40, 0xff, 1);
        assert_eq!(dev.config_read(0x40, 4), 0xa1b2_c3ff);
    }

    #[test]
    fn reset_clears_bar_and_irqs() {
        let dev = TestPciDevice::new("t", 0x1000, true);
        let regions = dev.bar_regions();
        regions[0].handler.lock().write(0, &[7]).unwrap();

        let mut dev = dev;
        dev.reset();
        let mut buf = [0xffu8];
        regions[0].handler.lock().read(0, &mut buf).unwrap();
        assert_eq!(buf, [0]);
    }
}
