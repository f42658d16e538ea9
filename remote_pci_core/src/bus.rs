// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Address spaces for BAR accesses.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// A failed bus transaction: the address range is unmapped or the region
/// refused the access.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
#[error("inaccessible address {addr:#x}")]
pub struct MemTxError {
    pub addr: u64,
}

pub type MemTxResult<T> = Result<T, MemTxError>;

/// Access callbacks for one mapped region. Offsets are region-relative.
pub trait MmioHandler: Send {
    fn read(&mut self, offset: u64, data: &mut [u8]) -> MemTxResult<()>;
    fn write(&mut self, offset: u64, data: &[u8]) -> MemTxResult<()>;
}

/// One mapped region of a [`Bus`].
pub struct BusRegion {
    name: String,
    base: u64,
    len: u64,
    handler: Arc<Mutex<dyn MmioHandler>>,
}

/// A flat address space of non-overlapping named regions.
///
/// The machine owns two: system memory and system I/O. Accesses outside
/// any region fail the transaction, mirroring a master abort on a real
/// bus.
#[derive(Default)]
pub struct Bus {
    regions: Vec<BusRegion>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `handler` at `[base, base + len)`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        base: u64,
        len: u64,
        handler: Arc<Mutex<dyn MmioHandler>>,
    ) {
        self.regions.push(BusRegion {
            name: name.into(),
            base,
            len,
            handler,
        });
    }

    /// Unmaps every region registered under `name`.
    pub fn unregister(&mut self, name: &str) {
        self.regions.retain(|region| region.name != name);
    }

    /// Reads `data.len()` bytes at `addr`.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> MemTxResult<()> {
        let region = self.find(addr, data.len() as u64)?;
        region.handler.lock().read(addr - region.base, data)
    }

    /// Writes `data` at `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> MemTxResult<()> {
        let region = self.find(addr, data.len() as u64)?;
        region.handler.lock().write(addr - region.base, data)
    }

    fn find(&self, addr: u64, len: u64) -> MemTxResult<&BusRegion> {
        self.regions
            .iter()
            .find(|region| {
                addr >= region.base
                    && len <= region.len
                    && addr - region.base <= region.len - len
            })
            .ok_or(MemTxError { addr })
    }
}
