// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end tests driving a worker over socket pairs, playing the
//! hypervisor-side proxy.

use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use nix::sys::socket::AddressFamily;
use nix::sys::socket::SockFlag;
use nix::sys::socket::SockType;
use nix::sys::socket::socketpair;
use parking_lot::Mutex;
use remote_device_worker::RemoteDeviceWorker;
use remote_link::Channel;
use remote_link::ChannelError;
use remote_link::Frame;
use remote_link::InlineData;
use remote_link::Link;
use remote_link::LinkError;
use remote_link::WaitPool;
use remote_pci_core::FactoryRegistry;
use remote_pci_core::MachineSnapshot;
use remote_pci_core::MachineState;
use remote_pci_core::testing::TEST_PCI_INFO;
use remote_pci_core::testing::TestPciDeviceFactory;
use remote_protocol::BarAccess;
use remote_protocol::Command;
use remote_protocol::ConfigSpaceAccess;
use remote_protocol::IrqSetup;
use remote_protocol::MsgHeader;
use remote_protocol::REMOTE_FAIL;
use remote_protocol::REMOTE_OK;
use remote_protocol::RunStateChange;
use remote_protocol::SysmemConfig;
use std::io::Read;
use std::io::Write;
use std::os::fd::AsFd;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::thread::JoinHandle;
use zerocopy::IntoBytes;

struct TestProxy {
    com: Channel,
    mmio: Channel,
    pool: WaitPool,
    worker: Option<JoinHandle<Result<(), LinkError>>>,
}

fn stream_pair() -> (OwnedFd, OwnedFd) {
    socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .unwrap()
}

fn eventfd() -> OwnedFd {
    let efd = EventFd::from_value_and_flags(0, EfdFlags::empty()).unwrap();
    efd.as_fd().try_clone_to_owned().unwrap()
}

fn start_worker() -> TestProxy {
    start_worker_with(MachineState::new(), Vec::new())
}

fn start_worker_with(machine: MachineState, deferred_opts: Vec<String>) -> TestProxy {
    let (com_remote, com_proxy) = stream_pair();
    let (mmio_remote, mmio_proxy) = stream_pair();
    let link = Link::new(com_remote, mmio_remote).unwrap();
    let mut factories = FactoryRegistry::new();
    factories.register("testpci", Box::new(TestPciDeviceFactory));
    let worker = RemoteDeviceWorker::new(&link, factories, machine, deferred_opts);
    let handle = std::thread::spawn(move || worker.run(link));
    TestProxy {
        com: Channel::new(com_proxy),
        mmio: Channel::new(mmio_proxy),
        pool: WaitPool::new(),
        worker: Some(handle),
    }
}

impl TestProxy {
    /// Sends `frame` with a wait fd attached and blocks for the reply
    /// value.
    fn call(&self, frame: Frame) -> u64 {
        let wait = self.pool.get().unwrap();
        let frame = frame.with_fd(wait.dup_for_send().unwrap());
        self.com.send(&frame).unwrap();
        let val = wait.wait();
        self.pool.put(wait);
        val
    }

    fn add_device(&self, id: u64, json: &str) -> u64 {
        self.call(Frame::stream(Command::DevOpts, id, json.as_bytes().to_vec()))
    }

    fn set_irqfd(&self, id: u64) {
        let frame = Frame::inline(
            Command::SetIrqFd,
            id,
            InlineData::Irq(IrqSetup { vector: 0, flags: 0 }),
        )
        .with_fd(eventfd())
        .with_fd(eventfd());
        self.com.send(&frame).unwrap();
    }

    fn config_read(&self, id: u64, addr: u32, len: u32) -> u64 {
        let conf = ConfigSpaceAccess { addr, val: 0, len };
        self.call(Frame::stream(
            Command::PciConfigRead,
            id,
            conf.as_bytes().to_vec(),
        ))
    }

    fn bar_read(&self, id: u64, addr: u64, size: u32) -> BarAccess {
        let bar = BarAccess {
            addr,
            val: 0,
            size,
            memory: 1,
        };
        self.com
            .send(&Frame::inline(Command::BarRead, id, InlineData::Bar(bar)))
            .unwrap();
        let reply = self.mmio.recv().unwrap();
        assert_eq!(reply.cmd, Command::MmioReturn);
        *reply.bar_access().unwrap()
    }

    /// Writes raw bytes on the control socket, bypassing the codec.
    fn send_raw(&self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let n = nix::unistd::write(self.com.as_fd(), bytes).unwrap();
            bytes = &bytes[n..];
        }
    }

    fn join(mut self) -> Result<(), LinkError> {
        self.worker.take().unwrap().join().unwrap()
    }
}

fn vendor_device_word() -> u64 {
    u64::from(TEST_PCI_INFO.vendor_id) | (u64::from(TEST_PCI_INFO.device_id) << 16)
}

#[test]
fn add_configure_remove() {
    let proxy = start_worker();
    assert_eq!(
        proxy.add_device(7, r#"{"driver":"testpci","id":"d0"}"#),
        REMOTE_OK
    );

    // Not wired up yet: config access short-circuits and the wait times
    // out.
    assert_eq!(proxy.config_read(7, 0, 4), u64::MAX);

    proxy.set_irqfd(7);
    assert_eq!(proxy.config_read(7, 0, 4), vendor_device_word());

    assert_eq!(
        proxy.call(Frame::stream(
            Command::DeviceDel,
            7,
            br#"{"id":"d0"}"#.to_vec()
        )),
        1
    );
    // The slot is empty again.
    assert_eq!(proxy.config_read(7, 0, 4), u64::MAX);
}

#[test]
fn config_read_returns_vendor_device() {
    let proxy = start_worker();
    assert_eq!(
        proxy.add_device(3, r#"{"driver":"testpci","id":"d3"}"#),
        REMOTE_OK
    );
    proxy.set_irqfd(3);
    assert_eq!(proxy.config_read(3, 0, 4), vendor_device_word());
    assert_eq!(
        proxy.config_read(3, 0, 2),
        u64::from(TEST_PCI_INFO.vendor_id)
    );
}

#[test]
fn bar_read_masks_to_access_width() {
    let proxy = start_worker();
    assert_eq!(
        proxy.add_device(0, r#"{"driver":"testpci","id":"d0","bar_base":4096}"#),
        REMOTE_OK
    );
    proxy.set_irqfd(0);

    let write = BarAccess {
        addr: 0x1010,
        val: 0xddcc_bbaa,
        size: 4,
        memory: 1,
    };
    proxy
        .com
        .send(&Frame::inline(Command::BarWrite, 0, InlineData::Bar(write)))
        .unwrap();

    assert_eq!(proxy.bar_read(0, 0x1010, 1).val, 0xaa);
    assert_eq!(proxy.bar_read(0, 0x1010, 2).val, 0xbbaa);
    assert_eq!(proxy.bar_read(0, 0x1010, 4).val, 0xddcc_bbaa);

    // An unmapped address fails the transaction and reports all-ones.
    assert_eq!(proxy.bar_read(0, 0xdead_0000, 4).val, u64::MAX);
}

#[test]
fn unknown_command_tears_link_down() {
    let mut proxy = start_worker();
    let header = MsgHeader {
        cmd: 0xdead,
        bytestream: 0,
        size: 0,
        id: 0,
        size_id: 0,
        num_fds: 0,
        pad: [0; 7],
    };
    proxy.send_raw(header.as_bytes());

    let result = proxy.worker.take().unwrap().join().unwrap();
    assert!(matches!(
        result,
        Err(LinkError::Recv(ChannelError::UnknownCommand(_)))
    ));
    // The worker closed its end on teardown; further sends fail.
    assert!(matches!(
        proxy.com.send(&Frame::new(Command::Init, 0)),
        Err(ChannelError::Io(_))
    ));
}

#[test]
fn oversize_fd_set_tears_link_down() {
    let proxy = start_worker();
    let header = MsgHeader {
        cmd: Command::Init as u32,
        bytestream: 0,
        size: 0,
        id: 0,
        size_id: 0,
        num_fds: 9,
        pad: [0; 7],
    };
    proxy.send_raw(header.as_bytes());
    assert!(matches!(
        proxy.join(),
        Err(LinkError::Recv(ChannelError::TooManyFds(9)))
    ));
}

#[test]
fn ping_returns_pid() {
    let proxy = start_worker();
    assert_eq!(
        proxy.call(Frame::new(Command::RemotePing, 0)),
        u64::from(std::process::id())
    );
}

#[test]
fn get_pci_info_replies_on_control_channel() {
    let proxy = start_worker();
    assert_eq!(
        proxy.add_device(2, r#"{"driver":"testpci","id":"d2"}"#),
        REMOTE_OK
    );
    proxy
        .com
        .send(&Frame::new(Command::GetPciInfo, 2))
        .unwrap();
    let reply = proxy.com.recv().unwrap();
    assert_eq!(reply.cmd, Command::RetPciInfo);
    assert_eq!(reply.id, 2);
    assert_eq!(reply.pci_info(), Some(&TEST_PCI_INFO));
}

#[test]
fn create_failures_report_remote_fail() {
    let proxy = start_worker();
    assert_eq!(
        proxy.add_device(1, r#"{"driver":"no-such-driver"}"#),
        REMOTE_FAIL
    );
    assert_eq!(proxy.add_device(1, "not json"), REMOTE_FAIL);
    assert_eq!(
        proxy.add_device(1, r#"{"driver":"testpci","id":"a"}"#),
        REMOTE_OK
    );
    // The link survived all of it.
    assert_eq!(
        proxy.call(Frame::new(Command::RemotePing, 0)),
        u64::from(std::process::id())
    );
}

#[test]
fn dev_opts_overwrites_occupied_slot() {
    let proxy = start_worker();
    assert_eq!(
        proxy.add_device(1, r#"{"driver":"testpci","id":"a","bar_base":4096}"#),
        REMOTE_OK
    );
    proxy.set_irqfd(1);
    assert_eq!(proxy.bar_read(1, 0x1000, 4).val, 0);

    // A repeated id displaces the occupant rather than failing.
    assert_eq!(
        proxy.add_device(1, r#"{"driver":"testpci","id":"b","bar_base":8192}"#),
        REMOTE_OK
    );
    // The replacement starts unwired.
    proxy.set_irqfd(1);
    // The displaced device's BAR is unmapped; the replacement's is live.
    assert_eq!(proxy.bar_read(1, 0x1000, 4).val, u64::MAX);
    assert_eq!(proxy.bar_read(1, 0x2000, 4).val, 0);
}

#[test]
fn sync_sysmem_applies_and_bad_layout_is_fatal() {
    let proxy = start_worker();
    let mut config = SysmemConfig {
        gpas: [0; 8],
        sizes: [0; 8],
        offsets: [0; 8],
    };
    config.sizes[0] = 0x10000;
    config.gpas[1] = 0x10000;
    config.sizes[1] = 0x10000;
    proxy
        .com
        .send(
            &Frame::inline(
                Command::SyncSysmem,
                0,
                InlineData::Sysmem(Box::new(config)),
            )
            .with_fd(eventfd())
            .with_fd(eventfd()),
        )
        .unwrap();
    // Still alive.
    assert_eq!(
        proxy.call(Frame::new(Command::RemotePing, 0)),
        u64::from(std::process::id())
    );

    // A region with no size is a reconfiguration failure, which poisons
    // the link.
    let bad = SysmemConfig {
        gpas: [0; 8],
        sizes: [0; 8],
        offsets: [0; 8],
    };
    proxy
        .com
        .send(
            &Frame::inline(Command::SyncSysmem, 0, InlineData::Sysmem(Box::new(bad)))
                .with_fd(eventfd()),
        )
        .unwrap();
    assert!(matches!(proxy.join(), Err(LinkError::Shutdown)));
}

#[test]
fn set_irqfd_with_wrong_fd_count_is_fatal() {
    let proxy = start_worker();
    assert_eq!(
        proxy.add_device(0, r#"{"driver":"testpci","id":"d0"}"#),
        REMOTE_OK
    );
    let frame = Frame::inline(
        Command::SetIrqFd,
        0,
        InlineData::Irq(IrqSetup { vector: 0, flags: 0 }),
    )
    .with_fd(eventfd());
    proxy.com.send(&frame).unwrap();
    assert!(matches!(proxy.join(), Err(LinkError::Shutdown)));
}

#[test]
fn device_reset_clears_bar_state() {
    let proxy = start_worker();
    assert_eq!(
        proxy.add_device(0, r#"{"driver":"testpci","id":"d0","bar_base":4096}"#),
        REMOTE_OK
    );
    proxy.set_irqfd(0);
    let write = BarAccess {
        addr: 0x1000,
        val: 0x55,
        size: 1,
        memory: 1,
    };
    proxy
        .com
        .send(&Frame::inline(Command::BarWrite, 0, InlineData::Bar(write)))
        .unwrap();
    assert_eq!(proxy.bar_read(0, 0x1000, 1).val, 0x55);

    assert_eq!(proxy.call(Frame::new(Command::DeviceReset, 0)), 0);
    assert_eq!(proxy.bar_read(0, 0x1000, 1).val, 0);
}

#[test]
fn runstate_set_acknowledges() {
    let proxy = start_worker();
    assert_eq!(
        proxy.add_device(0, r#"{"driver":"testpci","id":"d0"}"#),
        REMOTE_OK
    );
    assert_eq!(
        proxy.call(Frame::inline(
            Command::RunstateSet,
            0,
            InlineData::RunState(RunStateChange { state: 0 }),
        )),
        0
    );
    // An unknown state value is logged but still acknowledged.
    assert_eq!(
        proxy.call(Frame::inline(
            Command::RunstateSet,
            0,
            InlineData::RunState(RunStateChange { state: 99 }),
        )),
        0
    );
}

struct FixedSnapshot(&'static [u8]);

impl MachineSnapshot for FixedSnapshot {
    fn save(&mut self, w: &mut dyn Write) -> std::io::Result<u64> {
        w.write_all(self.0)?;
        Ok(self.0.len() as u64)
    }

    fn load(&mut self, _r: &mut dyn Read) -> std::io::Result<()> {
        Ok(())
    }
}

struct RecordingSnapshot(Arc<Mutex<Vec<u8>>>);

impl MachineSnapshot for RecordingSnapshot {
    fn save(&mut self, _w: &mut dyn Write) -> std::io::Result<u64> {
        Ok(0)
    }

    fn load(&mut self, r: &mut dyn Read) -> std::io::Result<()> {
        r.read_to_end(&mut self.0.lock())?;
        Ok(())
    }
}

#[test]
fn migration_out_streams_and_reports_length() {
    const STREAM: &[u8] = b"machine state stream";
    let proxy = start_worker_with(
        MachineState::with_snapshot(Box::new(FixedSnapshot(STREAM))),
        Vec::new(),
    );

    let (stream_r, stream_w) = nix::unistd::pipe().unwrap();
    let wait = proxy.pool.get().unwrap();
    let frame = Frame::new(Command::StartMigOut, 0)
        .with_fd(stream_w)
        .with_fd(wait.dup_for_send().unwrap());
    proxy.com.send(&frame).unwrap();
    drop(frame);
    assert_eq!(wait.wait(), STREAM.len() as u64);

    let mut out = Vec::new();
    std::fs::File::from(stream_r).read_to_end(&mut out).unwrap();
    assert_eq!(out, STREAM);
}

#[test]
fn migration_in_consumes_stream() {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let proxy = start_worker_with(
        MachineState::with_snapshot(Box::new(RecordingSnapshot(sink.clone()))),
        Vec::new(),
    );

    let (stream_r, stream_w) = nix::unistd::pipe().unwrap();
    proxy
        .com
        .send(&Frame::new(Command::StartMigIn, 0).with_fd(stream_r))
        .unwrap();
    let mut writer = std::fs::File::from(stream_w);
    writer.write_all(b"incoming state").unwrap();
    drop(writer);

    // Ping to synchronize: the worker finished the load before answering.
    assert_eq!(
        proxy.call(Frame::new(Command::RemotePing, 0)),
        u64::from(std::process::id())
    );
    assert_eq!(sink.lock().as_slice(), b"incoming state");
}

#[test]
fn command_line_devices_apply_at_first_dev_opts() {
    let proxy = start_worker_with(
        MachineState::new(),
        vec![r#"{"driver":"testpci","id":"cli0"}"#.to_string()],
    );
    assert_eq!(
        proxy.add_device(0, r#"{"driver":"testpci","id":"d0"}"#),
        REMOTE_OK
    );
    // The command line device landed in the next free slot.
    proxy
        .com
        .send(&Frame::new(Command::GetPciInfo, 1))
        .unwrap();
    let reply = proxy.com.recv().unwrap();
    assert_eq!(reply.cmd, Command::RetPciInfo);
    assert_eq!(reply.id, 1);
}

#[test]
fn malformed_payload_shape_tears_link_down() {
    let proxy = start_worker();
    // BAR_WRITE must be inline, not a bytestream.
    proxy
        .com
        .send(&Frame::stream(Command::BarWrite, 0, vec![0; 24]))
        .unwrap();
    assert!(matches!(
        proxy.join(),
        Err(LinkError::Recv(ChannelError::PayloadShape { .. }))
    ));
}
