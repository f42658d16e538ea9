// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Decoded message frames.

use remote_protocol::BarAccess;
use remote_protocol::Command;
use remote_protocol::INLINE_DATA_SIZE;
use remote_protocol::InlineKind;
use remote_protocol::IrqSetup;
use remote_protocol::PciInfo;
use remote_protocol::RunStateChange;
use remote_protocol::SysmemConfig;
use std::os::fd::OwnedFd;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// The inline payload of a non-bytestream frame, selected by the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlineData {
    Bar(BarAccess),
    Irq(IrqSetup),
    Sysmem(Box<SysmemConfig>),
    RunState(RunStateChange),
    PciInfo(PciInfo),
}

impl InlineData {
    /// Encodes the payload into the fixed-size inline block; trailing bytes
    /// are zero.
    pub(crate) fn to_wire(&self) -> [u8; INLINE_DATA_SIZE] {
        // Every inline struct fits the block by construction.
        let mut block = [0; INLINE_DATA_SIZE];
        match self {
            InlineData::Bar(v) => v.write_to_prefix(&mut block).unwrap(),
            InlineData::Irq(v) => v.write_to_prefix(&mut block).unwrap(),
            InlineData::Sysmem(v) => v.write_to_prefix(&mut block).unwrap(),
            InlineData::RunState(v) => v.write_to_prefix(&mut block).unwrap(),
            InlineData::PciInfo(v) => v.write_to_prefix(&mut block).unwrap(),
        }
        block
    }

    /// Parses the leading bytes of an inline block as `kind`.
    pub(crate) fn parse(kind: InlineKind, block: &[u8]) -> Option<Self> {
        Some(match kind {
            InlineKind::Bar => InlineData::Bar(BarAccess::read_from_prefix(block).ok()?.0),
            InlineKind::Irq => InlineData::Irq(IrqSetup::read_from_prefix(block).ok()?.0),
            InlineKind::Sysmem => {
                InlineData::Sysmem(Box::new(SysmemConfig::read_from_prefix(block).ok()?.0))
            }
            InlineKind::RunState => {
                InlineData::RunState(RunStateChange::read_from_prefix(block).ok()?.0)
            }
            InlineKind::PciInfo => InlineData::PciInfo(PciInfo::read_from_prefix(block).ok()?.0),
        })
    }
}

/// Frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Empty,
    Inline(InlineData),
    Stream(Vec<u8>),
}

/// One message on a channel: the decoded header fields, the payload, and
/// the attached file descriptors.
///
/// FDs not taken by a handler are closed when the frame is dropped.
#[derive(Debug)]
pub struct Frame {
    pub cmd: Command,
    pub id: u64,
    pub fds: Vec<OwnedFd>,
    pub payload: Payload,
}

impl Frame {
    /// A frame with no payload and no FDs.
    pub fn new(cmd: Command, id: u64) -> Self {
        Self {
            cmd,
            id,
            fds: Vec::new(),
            payload: Payload::Empty,
        }
    }

    /// A frame carrying an inline payload.
    pub fn inline(cmd: Command, id: u64, data: InlineData) -> Self {
        Self {
            payload: Payload::Inline(data),
            ..Self::new(cmd, id)
        }
    }

    /// A frame carrying an out-of-line byte buffer.
    pub fn stream(cmd: Command, id: u64, bytes: Vec<u8>) -> Self {
        Self {
            payload: Payload::Stream(bytes),
            ..Self::new(cmd, id)
        }
    }

    /// Attaches a file descriptor.
    pub fn with_fd(mut self, fd: OwnedFd) -> Self {
        self.fds.push(fd);
        self
    }

    /// Transfers ownership of all attached FDs, in wire order.
    pub fn take_fds(&mut self) -> std::vec::IntoIter<OwnedFd> {
        std::mem::take(&mut self.fds).into_iter()
    }

    /// The bytestream payload, if present.
    pub fn stream_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Stream(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The inline BAR access payload, if present.
    pub fn bar_access(&self) -> Option<&BarAccess> {
        match &self.payload {
            Payload::Inline(InlineData::Bar(bar)) => Some(bar),
            _ => None,
        }
    }

    /// The inline interrupt setup payload, if present.
    pub fn irq_setup(&self) -> Option<&IrqSetup> {
        match &self.payload {
            Payload::Inline(InlineData::Irq(irq)) => Some(irq),
            _ => None,
        }
    }

    /// The inline guest RAM layout payload, if present.
    pub fn sysmem_config(&self) -> Option<&SysmemConfig> {
        match &self.payload {
            Payload::Inline(InlineData::Sysmem(config)) => Some(config),
            _ => None,
        }
    }

    /// The inline run state payload, if present.
    pub fn run_state_change(&self) -> Option<&RunStateChange> {
        match &self.payload {
            Payload::Inline(InlineData::RunState(change)) => Some(change),
            _ => None,
        }
    }

    /// The inline PCI identity payload, if present.
    pub fn pci_info(&self) -> Option<&PciInfo> {
        match &self.payload {
            Payload::Inline(InlineData::PciInfo(info)) => Some(info),
            _ => None,
        }
    }
}
