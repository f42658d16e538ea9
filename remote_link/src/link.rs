// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The link: two channels, a reactor, and the receive loop.

use crate::channel::Channel;
use crate::channel::ChannelError;
use crate::frame::Frame;
use crate::reactor::Reactor;
use nix::errno::Errno;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use thiserror::Error;

const TOKEN_COM: u64 = 0;
const TOKEN_MMIO: u64 = 1;

/// Which channel a frame arrived on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelId {
    /// The control channel.
    Com,
    /// The MMIO fast path.
    Mmio,
}

/// Dispatch verdict for one frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Shutdown,
}

/// Why the link went down. The link is not restartable; a new one must be
/// constructed over fresh sockets.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("peer hung up")]
    Hangup,
    #[error("failed to receive frame")]
    Recv(#[source] ChannelError),
    #[error("dispatcher requested shutdown")]
    Shutdown,
    #[error("reactor failure")]
    Reactor(#[source] Errno),
}

/// A connected proxy/remote link.
pub struct Link {
    reactor: Reactor,
    com: Arc<Channel>,
    mmio: Arc<Channel>,
}

impl Link {
    /// Builds a link over two connected stream sockets and registers both
    /// with the reactor.
    pub fn new(com: OwnedFd, mmio: OwnedFd) -> Result<Self, LinkError> {
        let com = Arc::new(Channel::new(com));
        let mmio = Arc::new(Channel::new(mmio));
        let reactor = Reactor::new().map_err(LinkError::Reactor)?;
        reactor
            .register(com.as_fd(), TOKEN_COM)
            .map_err(LinkError::Reactor)?;
        reactor
            .register(mmio.as_fd(), TOKEN_MMIO)
            .map_err(LinkError::Reactor)?;
        Ok(Self { reactor, com, mmio })
    }

    /// The control channel.
    pub fn com(&self) -> &Arc<Channel> {
        &self.com
    }

    /// The MMIO channel.
    pub fn mmio(&self) -> &Arc<Channel> {
        &self.mmio
    }

    /// Runs the receive loop, handing each frame to `handler`, until the
    /// peer hangs up, a codec error poisons a channel, or the handler asks
    /// for shutdown.
    ///
    /// Consumes the link: on return both channels are closed.
    pub fn run<F>(self, mut handler: F) -> Result<(), LinkError>
    where
        F: FnMut(ChannelId, Frame) -> LoopControl,
    {
        loop {
            for ready in self.reactor.wait().map_err(LinkError::Reactor)? {
                let (channel, id) = match ready.token {
                    TOKEN_COM => (&self.com, ChannelId::Com),
                    _ => (&self.mmio, ChannelId::Mmio),
                };
                // Drain pending frames before acting on a hangup so a peer
                // that wrote and closed is fully heard.
                if ready.readable {
                    let frame = channel.recv().map_err(|err| match err {
                        ChannelError::Disconnected => LinkError::Hangup,
                        err => LinkError::Recv(err),
                    })?;
                    match handler(id, frame) {
                        LoopControl::Continue => {}
                        LoopControl::Shutdown => return Err(LinkError::Shutdown),
                    }
                } else if ready.closed {
                    return Err(LinkError::Hangup);
                }
            }
        }
    }
}
