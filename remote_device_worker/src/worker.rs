// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Frame validation, dispatch, and the per-command handlers.

use crate::options;
use crate::options::DeviceOptions;
use crate::options::OptionsError;
use crate::registry::DeviceTable;
use crate::registry::IdOutOfRange;
use nix::fcntl::FcntlArg;
use nix::fcntl::fcntl;
use parking_lot::Mutex;
use remote_link::Channel;
use remote_link::ChannelError;
use remote_link::ChannelId;
use remote_link::Frame;
use remote_link::InlineData;
use remote_link::Link;
use remote_link::LinkError;
use remote_link::LoopControl;
use remote_link::notify;
use remote_pci_core::DeviceError;
use remote_pci_core::FactoryRegistry;
use remote_pci_core::MachineState;
use remote_pci_core::SysmemError;
use remote_protocol::BarAccess;
use remote_protocol::Command;
use remote_protocol::ConfigSpaceAccess;
use remote_protocol::MAX_REMOTE_DEVICES;
use remote_protocol::REMOTE_FAIL;
use remote_protocol::REMOTE_OK;
use remote_protocol::RunState;
use std::fs::File;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromBytes;

/// Errors that poison the link. Everything else is logged, answered if the
/// request carried a wait fd, and survived.
#[derive(Debug, Error)]
enum FatalError {
    #[error("device id {0} out of range")]
    IdOutOfRange(u64),
    #[error("{cmd:?} arrived with {got} fds")]
    FdCount { cmd: Command, got: usize },
    #[error("attached fd {index} is not open")]
    BadFd { index: usize },
    #[error("{0:?} is a reply, not a request")]
    UnexpectedReply(Command),
    #[error("failed to send reply")]
    Send(#[source] ChannelError),
    #[error("guest memory reconfiguration failed")]
    Sysmem(#[source] SysmemError),
}

#[derive(Debug, Error)]
enum CreateError {
    #[error(transparent)]
    Options(#[from] OptionsError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Registry(#[from] IdOutOfRange),
}

/// The dispatcher: owns the device table, the factory registry, and the
/// machine state, and consumes every frame the link delivers.
pub struct RemoteDeviceWorker {
    com: Arc<Channel>,
    mmio: Arc<Channel>,
    // The I/O-thread lock: serializes handler access to machine state with
    // any other thread sharing it. Innermost lock; never held across a
    // channel send or a wait-fd notify.
    machine: Mutex<MachineState>,
    factories: FactoryRegistry,
    devices: DeviceTable,
    // Command-line device options, applied once the proxy starts creating
    // devices.
    deferred_opts: Vec<String>,
    saw_dev_opts: bool,
}

impl RemoteDeviceWorker {
    /// Builds the dispatcher for `link`. `deferred_opts` holds device
    /// option blobs from the command line, applied at the first DEV_OPTS
    /// so every factory registered at bootstrap is available by then.
    pub fn new(
        link: &Link,
        factories: FactoryRegistry,
        machine: MachineState,
        deferred_opts: Vec<String>,
    ) -> Self {
        Self {
            com: link.com().clone(),
            mmio: link.mmio().clone(),
            machine: Mutex::new(machine),
            factories,
            devices: DeviceTable::new(),
            deferred_opts,
            saw_dev_opts: false,
        }
    }

    /// Runs the link's receive loop to completion. Any return means the
    /// link is torn down.
    pub fn run(mut self, link: Link) -> Result<(), LinkError> {
        link.run(|channel, frame| self.process_msg(channel, frame))
    }

    fn process_msg(&mut self, channel: ChannelId, mut frame: Frame) -> LoopControl {
        tracing::debug!(?channel, cmd = ?frame.cmd, id = frame.id, "frame received");
        if let Err(err) = self.validate(&frame) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                cmd = ?frame.cmd,
                "protocol violation"
            );
            return LoopControl::Shutdown;
        }
        match self.dispatch(&mut frame) {
            Ok(()) => LoopControl::Continue,
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    cmd = ?frame.cmd,
                    "fatal error, tearing link down"
                );
                LoopControl::Shutdown
            }
        }
    }

    /// Protocol-level checks beyond what the codec already enforced: id
    /// range, fd count for the command, and that every attached fd is
    /// actually open.
    fn validate(&self, frame: &Frame) -> Result<(), FatalError> {
        if frame.id >= MAX_REMOTE_DEVICES {
            return Err(FatalError::IdOutOfRange(frame.id));
        }
        let shape = frame.cmd.shape();
        let got = frame.fds.len();
        if got < usize::from(shape.min_fds) || got > usize::from(shape.max_fds) {
            return Err(FatalError::FdCount {
                cmd: frame.cmd,
                got,
            });
        }
        for (index, fd) in frame.fds.iter().enumerate() {
            if fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).is_err() {
                return Err(FatalError::BadFd { index });
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, frame: &mut Frame) -> Result<(), FatalError> {
        if frame.cmd.needs_device() && self.devices.get_mut(frame.id).is_none() {
            // A stale or never-assigned id. The proxy is confused but the
            // link is fine.
            tracing::error!(cmd = ?frame.cmd, id = frame.id, "message for unknown device");
            return Ok(());
        }

        match frame.cmd {
            Command::Init => Ok(()),

            Command::GetPciInfo => {
                let info = self.devices.get_mut(frame.id).unwrap().pci_info;
                self.com
                    .send(&Frame::inline(
                        Command::RetPciInfo,
                        frame.id,
                        InlineData::PciInfo(info),
                    ))
                    .map_err(FatalError::Send)
            }

            Command::PciConfigWrite => {
                let entry = self.devices.get_mut(frame.id).unwrap();
                if !entry.created {
                    return Ok(());
                }
                let conf =
                    ConfigSpaceAccess::read_from_bytes(frame.stream_bytes().unwrap()).unwrap();
                if !matches!(conf.len, 1 | 2 | 4) {
                    tracing::error!(len = conf.len, "bad config space access width");
                    return Ok(());
                }
                let _machine = self.machine.lock();
                entry.device.config_write(conf.addr, conf.val, conf.len);
                Ok(())
            }

            Command::PciConfigRead => {
                let wait = frame.take_fds().next().unwrap();
                let entry = self.devices.get_mut(frame.id).unwrap();
                if !entry.created {
                    // No reply; the proxy's wait times out.
                    return Ok(());
                }
                let conf =
                    ConfigSpaceAccess::read_from_bytes(frame.stream_bytes().unwrap()).unwrap();
                if !matches!(conf.len, 1 | 2 | 4) {
                    tracing::error!(len = conf.len, "bad config space access width");
                    return Ok(());
                }
                let val = {
                    let _machine = self.machine.lock();
                    entry.device.config_read(conf.addr, conf.len)
                };
                notify(wait.as_fd(), val.into());
                Ok(())
            }

            Command::BarWrite => {
                if !self.devices.get_mut(frame.id).unwrap().created {
                    return Ok(());
                }
                let bar = *frame.bar_access().unwrap();
                let Some(len) = access_width(bar.size) else {
                    tracing::error!(size = bar.size, "bad bar access width");
                    return Ok(());
                };
                let bytes = bar.val.to_le_bytes();
                let machine = self.machine.lock();
                let bus = if bar.memory != 0 {
                    &machine.sysmem
                } else {
                    &machine.sysio
                };
                if let Err(err) = bus.write(bar.addr, &bytes[..len]) {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "bar write failed"
                    );
                }
                Ok(())
            }

            Command::BarRead => {
                if !self.devices.get_mut(frame.id).unwrap().created {
                    return Ok(());
                }
                let bar = *frame.bar_access().unwrap();
                let Some(len) = access_width(bar.size) else {
                    tracing::error!(size = bar.size, "bad bar access width");
                    return Ok(());
                };
                let mut bytes = [0u8; 8];
                let val = {
                    let machine = self.machine.lock();
                    let bus = if bar.memory != 0 {
                        &machine.sysmem
                    } else {
                        &machine.sysio
                    };
                    match bus.read(bar.addr, &mut bytes[..len]) {
                        // Short reads land in the low bytes, masking the
                        // value to the requested width.
                        Ok(()) => u64::from_le_bytes(bytes),
                        Err(err) => {
                            tracing::error!(
                                error = &err as &dyn std::error::Error,
                                "bar read failed"
                            );
                            u64::MAX
                        }
                    }
                };
                self.mmio
                    .send(&Frame::inline(
                        Command::MmioReturn,
                        frame.id,
                        InlineData::Bar(BarAccess { val, ..bar }),
                    ))
                    .map_err(FatalError::Send)
            }

            Command::SyncSysmem => {
                let config = *frame.sysmem_config().unwrap();
                let fds = frame.take_fds().collect();
                self.machine
                    .lock()
                    .guest_ram
                    .reconfig(&config, fds)
                    .map_err(FatalError::Sysmem)
            }

            Command::SetIrqFd => {
                let irq = *frame.irq_setup().unwrap();
                let mut fds = frame.take_fds();
                let irqfd = fds.next().unwrap();
                let resample = fds.next().unwrap();
                let entry = self.devices.get_mut(frame.id).unwrap();
                match entry.device.set_irqfd(irq.vector, irqfd, resample) {
                    Ok(()) => {
                        entry.created = true;
                        // The first fully wired device completes machine
                        // creation.
                        self.machine.lock().creation_done();
                    }
                    Err(err) => tracing::error!(
                        error = &err as &dyn std::error::Error,
                        id = frame.id,
                        "failed to install irqfd"
                    ),
                }
                Ok(())
            }

            Command::DevOpts => {
                let wait = frame.take_fds().next().unwrap();
                let status = match self.create_device(frame.id, frame.stream_bytes().unwrap()) {
                    Ok(()) => REMOTE_OK,
                    Err(err) => {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            id = frame.id,
                            "failed to create device"
                        );
                        REMOTE_FAIL
                    }
                };
                notify(wait.as_fd(), status);
                if !self.saw_dev_opts {
                    self.saw_dev_opts = true;
                    self.flush_deferred_options();
                }
                Ok(())
            }

            Command::DeviceAdd => {
                let wait = frame.take_fds().next().unwrap();
                if let Err(err) = self.create_device(frame.id, frame.stream_bytes().unwrap()) {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        id = frame.id,
                        "hotplug add failed"
                    );
                }
                notify(wait.as_fd(), 1);
                Ok(())
            }

            Command::DeviceDel => {
                let wait = frame.take_fds().next().unwrap();
                match options::parse_del_options(frame.stream_bytes().unwrap()) {
                    Ok(name) => self.delete_device(&name),
                    Err(err) => tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "hotplug del failed"
                    ),
                }
                notify(wait.as_fd(), 1);
                Ok(())
            }

            Command::DeviceReset => {
                let wait = frame.take_fds().next();
                {
                    let _machine = self.machine.lock();
                    for entry in self.devices.iter_mut() {
                        entry.device.reset();
                    }
                }
                if let Some(wait) = wait {
                    notify(wait.as_fd(), 0);
                }
                Ok(())
            }

            Command::RemotePing => {
                let wait = frame.take_fds().next().unwrap();
                notify(wait.as_fd(), u64::from(std::process::id()));
                Ok(())
            }

            Command::StartMigOut => {
                let mut fds = frame.take_fds();
                let io = fds.next().unwrap();
                let wait = fds.next().unwrap();
                let mut stream = File::from(io);
                let val = match self.machine.lock().snapshot().save(&mut stream) {
                    Ok(written) => written,
                    Err(err) => {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            "state save failed"
                        );
                        u64::MAX
                    }
                };
                notify(wait.as_fd(), val);
                Ok(())
            }

            Command::StartMigIn => {
                let io = frame.take_fds().next().unwrap();
                let mut stream = File::from(io);
                if let Err(err) = self.machine.lock().snapshot().load(&mut stream) {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "state restore failed"
                    );
                }
                Ok(())
            }

            Command::RunstateSet => {
                let change = *frame.run_state_change().unwrap();
                let wait = frame.take_fds().next().unwrap();
                match RunState::from_u32(change.state) {
                    Some(state) => {
                        self.machine.lock().run_state = state;
                        tracing::debug!(?state, "run state set");
                    }
                    None => tracing::error!(state = change.state, "unknown run state"),
                }
                notify(wait.as_fd(), 0);
                Ok(())
            }

            Command::RetPciInfo | Command::MmioReturn => {
                Err(FatalError::UnexpectedReply(frame.cmd))
            }
        }
    }

    fn create_device(&mut self, id: u64, json: &[u8]) -> Result<(), CreateError> {
        let DeviceOptions {
            driver,
            name,
            options,
        } = options::parse_device_options(json)?;
        let factory = self.factories.get(&driver)?;
        let pci_info = factory.typeinfo();
        let device = factory.create(&options)?;
        let regions = device.bar_regions();
        let displaced = self.devices.add(id, name, device, pci_info)?;

        let mut machine = self.machine.lock();
        // A repeated id replaces the occupant; tear the old device down and
        // unmap its BARs before the replacement's go in.
        if let Some(mut old) = displaced {
            old.device.reset();
            for region in old.device.bar_regions() {
                let bus = if region.memory {
                    &mut machine.sysmem
                } else {
                    &mut machine.sysio
                };
                bus.unregister(&region.name);
            }
            tracing::info!(id, replaced = %old.name, "device displaced");
        }
        for region in regions {
            let bus = if region.memory {
                &mut machine.sysmem
            } else {
                &mut machine.sysio
            };
            bus.register(region.name, region.base, region.len, region.handler);
        }
        tracing::info!(id, %driver, "device created");
        Ok(())
    }

    fn delete_device(&mut self, name: &str) {
        let Some(mut entry) = self.devices.remove_by_name(name) else {
            tracing::error!(name, "no such device");
            return;
        };
        entry.device.reset();
        let mut machine = self.machine.lock();
        for region in entry.device.bar_regions() {
            let bus = if region.memory {
                &mut machine.sysmem
            } else {
                &mut machine.sysio
            };
            bus.unregister(&region.name);
        }
        tracing::info!(name, "device removed");
    }

    fn flush_deferred_options(&mut self) {
        for blob in std::mem::take(&mut self.deferred_opts) {
            let id = self.devices.first_free_id();
            if let Err(err) = self.create_device(id, blob.as_bytes()) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to create command line device"
                );
            }
        }
    }
}

fn access_width(size: u32) -> Option<usize> {
    matches!(size, 1 | 2 | 4 | 8).then_some(size as usize)
}
