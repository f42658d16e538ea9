// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Machine-wide state shared by every handler.

use crate::bus::Bus;
use remote_protocol::REMOTE_MAX_FDS;
use remote_protocol::RunState;
use remote_protocol::SysmemConfig;
use std::io::Read;
use std::io::Write;
use std::os::fd::OwnedFd;
use thiserror::Error;

/// Guest RAM reconfiguration failure. Fatal to the link: the worker's view
/// of guest memory is stale and no further DMA can be trusted.
#[derive(Debug, Error)]
pub enum SysmemError {
    #[error("no memory fds attached")]
    NoRegions,
    #[error("region {0} is empty")]
    EmptyRegion(usize),
    #[error("region {0} overlaps region {1}")]
    Overlap(usize, usize),
}

/// One guest RAM region, backed by a memory fd owned by the worker.
///
/// Mapping the fd into the address space is the host memory
/// infrastructure's business; this table only tracks the layout.
#[derive(Debug)]
pub struct RamRegion {
    pub fd: OwnedFd,
    pub gpa: u64,
    pub size: u64,
    pub offset: u64,
}

/// The guest RAM layout, replaced wholesale on every sysmem sync.
#[derive(Debug, Default)]
pub struct SystemMemory {
    regions: Vec<RamRegion>,
}

impl SystemMemory {
    /// Replaces the layout with the regions described by `config` and the
    /// attached fds; entry `i` of `config` pairs with `fds[i]`.
    ///
    /// No DMA arbitration is performed here; the proxy must quiesce
    /// devices before syncing.
    pub fn reconfig(&mut self, config: &SysmemConfig, fds: Vec<OwnedFd>) -> Result<(), SysmemError> {
        if fds.is_empty() || fds.len() > REMOTE_MAX_FDS {
            return Err(SysmemError::NoRegions);
        }

        let mut regions = Vec::with_capacity(fds.len());
        for (i, fd) in fds.into_iter().enumerate() {
            if config.sizes[i] == 0 {
                return Err(SysmemError::EmptyRegion(i));
            }
            regions.push(RamRegion {
                fd,
                gpa: config.gpas[i],
                size: config.sizes[i],
                offset: config.offsets[i],
            });
        }
        for i in 0..regions.len() {
            for j in i + 1..regions.len() {
                let (a, b) = (&regions[i], &regions[j]);
                if a.gpa < b.gpa.saturating_add(b.size) && b.gpa < a.gpa.saturating_add(a.size) {
                    return Err(SysmemError::Overlap(i, j));
                }
            }
        }

        self.regions = regions;
        Ok(())
    }

    /// The current layout.
    pub fn regions(&self) -> &[RamRegion] {
        &self.regions
    }
}

/// The machine save/restore primitive, provided by the embedder. The
/// worker invokes it for migration messages but does not define the
/// stream encoding.
pub trait MachineSnapshot: Send {
    /// Writes the machine state stream to `w`, returning the byte count.
    fn save(&mut self, w: &mut dyn Write) -> std::io::Result<u64>;

    /// Consumes a machine state stream from `r`.
    fn load(&mut self, r: &mut dyn Read) -> std::io::Result<()>;
}

/// A snapshot primitive for machines with no migratable state.
pub struct NoSnapshot;

impl MachineSnapshot for NoSnapshot {
    fn save(&mut self, _w: &mut dyn Write) -> std::io::Result<u64> {
        Ok(0)
    }

    fn load(&mut self, _r: &mut dyn Read) -> std::io::Result<()> {
        Ok(())
    }
}

type InitNotifier = Box<dyn FnOnce(&mut MachineState) + Send>;

/// State every handler may touch, guarded by the worker's single
/// I/O-thread lock.
pub struct MachineState {
    /// The memory address space.
    pub sysmem: Bus,
    /// The I/O address space.
    pub sysio: Bus,
    /// The guest RAM layout.
    pub guest_ram: SystemMemory,
    /// Current run state.
    pub run_state: RunState,
    snapshot: Box<dyn MachineSnapshot>,
    creation_done: bool,
    init_notifiers: Vec<InitNotifier>,
}

impl MachineState {
    pub fn new() -> Self {
        Self::with_snapshot(Box::new(NoSnapshot))
    }

    /// A machine whose migration messages drive `snapshot`.
    pub fn with_snapshot(snapshot: Box<dyn MachineSnapshot>) -> Self {
        Self {
            sysmem: Bus::new(),
            sysio: Bus::new(),
            guest_ram: SystemMemory::default(),
            run_state: RunState::Paused,
            snapshot,
            creation_done: false,
            init_notifiers: Vec::new(),
        }
    }

    /// Queues `notifier` to run when machine creation completes. Runs
    /// immediately if it already has.
    pub fn add_init_notifier(&mut self, notifier: InitNotifier) {
        if self.creation_done {
            notifier(self);
        } else {
            self.init_notifiers.push(notifier);
        }
    }

    /// Latches machine creation and fires deferred notifiers. One-shot;
    /// later calls are no-ops.
    pub fn creation_done(&mut self) {
        if self.creation_done {
            return;
        }
        self.creation_done = true;
        for notifier in std::mem::take(&mut self.init_notifiers) {
            notifier(self);
        }
    }

    /// Whether the creation latch has been raised.
    pub fn is_creation_done(&self) -> bool {
        self.creation_done
    }

    /// The machine save/restore primitive.
    pub fn snapshot(&mut self) -> &mut dyn MachineSnapshot {
        self.snapshot.as_mut()
    }
}

impl Default for MachineState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any_fd() -> OwnedFd {
        std::fs::File::open("/dev/null").unwrap().into()
    }

    fn config(entries: &[(u64, u64)]) -> SysmemConfig {
        let mut config = SysmemConfig {
            gpas: [0; 8],
            sizes: [0; 8],
            offsets: [0; 8],
        };
        for (i, &(gpa, size)) in entries.iter().enumerate() {
            config.gpas[i] = gpa;
            config.sizes[i] = size;
        }
        config
    }

    #[test]
    fn sysmem_replaces_layout() {
        let mut sysmem = SystemMemory::default();
        sysmem
            .reconfig(&config(&[(0, 0x10000), (0x10000, 0x10000)]), vec![any_fd(), any_fd()])
            .unwrap();
        assert_eq!(sysmem.regions().len(), 2);

        sysmem
            .reconfig(&config(&[(0, 0x4000)]), vec![any_fd()])
            .unwrap();
        assert_eq!(sysmem.regions().len(), 1);
        assert_eq!(sysmem.regions()[0].size, 0x4000);
    }

    #[test]
    fn sysmem_rejects_bad_layouts() {
        let mut sysmem = SystemMemory::default();
        assert!(matches!(
            sysmem.reconfig(&config(&[]), vec![]),
            Err(SysmemError::NoRegions)
        ));
        assert!(matches!(
            sysmem.reconfig(&config(&[(0, 0x1000)]), vec![any_fd(), any_fd()]),
            Err(SysmemError::EmptyRegion(1))
        ));
        assert!(matches!(
            sysmem.reconfig(
                &config(&[(0, 0x2000), (0x1000, 0x2000)]),
                vec![any_fd(), any_fd()]
            ),
            Err(SysmemError::Overlap(0, 1))
        ));
    }

    #[test]
    fn creation_latch_is_one_shot() {
        let mut machine = MachineState::new();
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let fired2 = fired.clone();
        machine.add_init_notifier(Box::new(move |_| {
            fired2.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));
        assert!(!machine.is_creation_done());
        machine.creation_done();
        machine.creation_done();
        assert!(machine.is_creation_done());
        assert_eq!(fired.load(std::sync::atomic::Ordering::Relaxed), 1);

        // Late registration runs immediately.
        let fired3 = fired.clone();
        machine.add_init_notifier(Box::new(move |_| {
            fired3.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));
        assert_eq!(fired.load(std::sync::atomic::Ordering::Relaxed), 2);
    }
}
