// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire format shared by the hypervisor-side proxy and the remote device
//! worker.
//!
//! Every message on the control or MMIO socket is a fixed [`MsgHeader`]
//! followed by an optional payload. Non-bytestream payloads are a fixed-size
//! block of [`INLINE_DATA_SIZE`] bytes whose leading bytes are one of the
//! inline structs below, selected by the command; bytestream payloads are an
//! opaque byte buffer of exactly `size` bytes. Up to [`REMOTE_MAX_FDS`] file
//! descriptors ride along as a single `SCM_RIGHTS` control message.

#![forbid(unsafe_code)]

use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Maximum number of file descriptors attached to one message.
pub const REMOTE_MAX_FDS: usize = 8;

/// Upper bound on proxy-assigned device identifiers.
pub const MAX_REMOTE_DEVICES: u64 = 256;

/// Wait-fd status: the requested operation succeeded.
pub const REMOTE_OK: u64 = 0;

/// Wait-fd status: the requested operation failed.
pub const REMOTE_FAIL: u64 = 1;

/// Commands understood by the remote device worker.
///
/// The ordinals are wire-stable; new commands may only be appended.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Init = 0,
    GetPciInfo = 1,
    RetPciInfo = 2,
    PciConfigWrite = 3,
    PciConfigRead = 4,
    BarWrite = 5,
    BarRead = 6,
    MmioReturn = 7,
    SyncSysmem = 8,
    SetIrqFd = 9,
    DevOpts = 10,
    DeviceAdd = 11,
    DeviceDel = 12,
    DeviceReset = 13,
    RemotePing = 14,
    StartMigOut = 15,
    StartMigIn = 16,
    RunstateSet = 17,
}

/// The command ordinal one past the last valid command.
pub const COMMAND_MAX: u32 = 18;

/// Raw command value outside the enumeration.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
#[error("unknown command {0:#x}")]
pub struct UnknownCommand(pub u32);

impl Command {
    /// Decodes a raw command ordinal.
    pub fn from_u32(raw: u32) -> Result<Self, UnknownCommand> {
        Ok(match raw {
            0 => Self::Init,
            1 => Self::GetPciInfo,
            2 => Self::RetPciInfo,
            3 => Self::PciConfigWrite,
            4 => Self::PciConfigRead,
            5 => Self::BarWrite,
            6 => Self::BarRead,
            7 => Self::MmioReturn,
            8 => Self::SyncSysmem,
            9 => Self::SetIrqFd,
            10 => Self::DevOpts,
            11 => Self::DeviceAdd,
            12 => Self::DeviceDel,
            13 => Self::DeviceReset,
            14 => Self::RemotePing,
            15 => Self::StartMigOut,
            16 => Self::StartMigIn,
            17 => Self::RunstateSet,
            raw => return Err(UnknownCommand(raw)),
        })
    }

    /// The wire shape this command must arrive with.
    pub fn shape(&self) -> WireShape {
        match self {
            Self::Init => WireShape::empty(),
            Self::GetPciInfo => WireShape::empty(),
            Self::RetPciInfo => WireShape::inline(InlineKind::PciInfo),
            Self::PciConfigWrite => WireShape::stream_exact(CONFIG_SPACE_ACCESS_SIZE),
            Self::PciConfigRead => WireShape::stream_exact(CONFIG_SPACE_ACCESS_SIZE).fds(1),
            Self::BarWrite => WireShape::inline(InlineKind::Bar),
            Self::BarRead => WireShape::inline(InlineKind::Bar),
            Self::MmioReturn => WireShape::inline(InlineKind::Bar),
            Self::SyncSysmem => {
                WireShape::inline(InlineKind::Sysmem).fd_range(1, REMOTE_MAX_FDS as u8)
            }
            Self::SetIrqFd => WireShape::inline(InlineKind::Irq).fds(2),
            Self::DevOpts => WireShape::stream().fds(1),
            Self::DeviceAdd => WireShape::stream().fds(1),
            Self::DeviceDel => WireShape::stream().fds(1),
            Self::DeviceReset => WireShape::empty().fd_range(0, 1),
            Self::RemotePing => WireShape::empty().fds(1),
            Self::StartMigOut => WireShape::empty().fds(2),
            Self::StartMigIn => WireShape::empty().fds(1),
            Self::RunstateSet => WireShape::inline(InlineKind::RunState).fds(1),
        }
    }

    /// Whether the dispatcher must resolve the header `id` to a device
    /// before invoking the handler.
    pub fn needs_device(&self) -> bool {
        !matches!(
            self,
            Self::Init
                | Self::DevOpts
                | Self::SyncSysmem
                | Self::RemotePing
                | Self::StartMigIn
                | Self::StartMigOut
                | Self::DeviceReset
                | Self::DeviceAdd
                | Self::DeviceDel
        )
    }
}

/// Payload layout expected for a command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PayloadShape {
    /// `size == 0`, no payload body.
    Empty,
    /// Fixed block of [`INLINE_DATA_SIZE`] bytes, parsed as the given struct.
    Inline(InlineKind),
    /// Out-of-line byte buffer; `None` means any nonzero length.
    Stream(Option<u64>),
}

/// Which inline struct occupies the fixed payload block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InlineKind {
    Bar,
    Irq,
    Sysmem,
    RunState,
    PciInfo,
}

/// Per-command wire contract: payload layout plus accepted FD count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WireShape {
    pub payload: PayloadShape,
    pub min_fds: u8,
    pub max_fds: u8,
}

impl WireShape {
    const fn empty() -> Self {
        Self {
            payload: PayloadShape::Empty,
            min_fds: 0,
            max_fds: 0,
        }
    }

    const fn inline(kind: InlineKind) -> Self {
        Self {
            payload: PayloadShape::Inline(kind),
            min_fds: 0,
            max_fds: 0,
        }
    }

    const fn stream() -> Self {
        Self {
            payload: PayloadShape::Stream(None),
            min_fds: 0,
            max_fds: 0,
        }
    }

    const fn stream_exact(size: u64) -> Self {
        Self {
            payload: PayloadShape::Stream(Some(size)),
            min_fds: 0,
            max_fds: 0,
        }
    }

    const fn fds(self, n: u8) -> Self {
        self.fd_range(n, n)
    }

    const fn fd_range(mut self, min: u8, max: u8) -> Self {
        self.min_fds = min;
        self.max_fds = max;
        self
    }
}

/// Fixed message header, 40 bytes on the wire.
///
/// `size_id` is carried for compatibility but has no receive-side meaning.
#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, Copy, Clone, Debug)]
pub struct MsgHeader {
    pub cmd: u32,
    pub bytestream: u32,
    pub size: u64,
    pub id: u64,
    pub size_id: u64,
    pub num_fds: u8,
    pub pad: [u8; 7],
}

/// Size of [`MsgHeader`] on the wire.
pub const MSG_HEADER_SIZE: usize = size_of::<MsgHeader>();

const _: () = assert!(MSG_HEADER_SIZE == 40);

/// PCI configuration space access, the bytestream payload of
/// [`Command::PciConfigWrite`] and [`Command::PciConfigRead`].
#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConfigSpaceAccess {
    pub addr: u32,
    pub val: u32,
    pub len: u32,
}

/// Size of [`ConfigSpaceAccess`] on the wire.
pub const CONFIG_SPACE_ACCESS_SIZE: u64 = size_of::<ConfigSpaceAccess>() as u64;

/// BAR access request or MMIO reply value.
///
/// `memory` selects the memory address space when nonzero, the I/O address
/// space otherwise. `size` is the access width in bytes.
#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, Copy, Clone, Debug, PartialEq, Eq)]
pub struct BarAccess {
    pub addr: u64,
    pub val: u64,
    pub size: u32,
    pub memory: u32,
}

/// Interrupt routing setup for [`Command::SetIrqFd`]. The irqfd and
/// resample fd accompany the message as ancillary data.
#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, Copy, Clone, Debug, PartialEq, Eq)]
pub struct IrqSetup {
    pub vector: u32,
    pub flags: u32,
}

/// Guest RAM layout for [`Command::SyncSysmem`]. Entry `i` describes the
/// region backed by attached FD `i`; entries past `num_fds` are zero.
#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, Copy, Clone, Debug, PartialEq, Eq)]
pub struct SysmemConfig {
    pub gpas: [u64; REMOTE_MAX_FDS],
    pub sizes: [u64; REMOTE_MAX_FDS],
    pub offsets: [u64; REMOTE_MAX_FDS],
}

/// Machine run state transition for [`Command::RunstateSet`].
#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, Copy, Clone, Debug, PartialEq, Eq)]
pub struct RunStateChange {
    pub state: u32,
}

/// Identity of an emulated PCI device, the payload of
/// [`Command::RetPciInfo`].
#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, Copy, Clone, Debug, PartialEq, Eq)]
pub struct PciInfo {
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_id: u16,
    pub subsystem_id: u16,
}

/// Size of the fixed inline payload block: the largest inline struct.
pub const INLINE_DATA_SIZE: usize = size_of::<SysmemConfig>();

const _: () = assert!(size_of::<BarAccess>() <= INLINE_DATA_SIZE);
const _: () = assert!(size_of::<IrqSetup>() <= INLINE_DATA_SIZE);
const _: () = assert!(size_of::<RunStateChange>() <= INLINE_DATA_SIZE);
const _: () = assert!(size_of::<PciInfo>() <= INLINE_DATA_SIZE);

/// Machine run states settable over the wire.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunState {
    Running = 0,
    Paused = 1,
    Suspended = 2,
}

impl RunState {
    /// Decodes a raw run state value.
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Running,
            1 => Self::Paused,
            2 => Self::Suspended,
            _ => return None,
        })
    }
}
