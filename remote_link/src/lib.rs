// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The message link between a hypervisor-side proxy and the remote device
//! worker.
//!
//! A [`Link`] owns two [`Channel`]s over a pair of stream sockets: `com`
//! carries control traffic and `mmio` carries the BAR fast path. Each
//! channel frames messages as a fixed header plus an optional payload, with
//! file descriptors attached as `SCM_RIGHTS` ancillary data. Synchronous
//! replies travel out of band through a counter-valued wait fd (see
//! [`wait`]).

// UNSAFETY: Adopting file descriptors received as SCM_RIGHTS ancillary data
// requires OwnedFd::from_raw_fd.
#![expect(unsafe_code)]

mod channel;
mod frame;
mod link;
mod reactor;
mod wait;

pub use channel::Channel;
pub use channel::ChannelError;
pub use frame::Frame;
pub use frame::InlineData;
pub use frame::Payload;
pub use link::ChannelId;
pub use link::Link;
pub use link::LinkError;
pub use link::LoopControl;
pub use reactor::Reactor;
pub use reactor::Readiness;
pub use wait::WaitFd;
pub use wait::WaitPool;
pub use wait::notify;
pub use wait::wait;
pub use wait::WAIT_TIMEOUT_MS;
