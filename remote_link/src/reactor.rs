// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Minimal poll reactor for link channels.

use nix::errno::Errno;
use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;
use std::os::fd::BorrowedFd;

/// Readiness of one registered fd.
#[derive(Debug, Copy, Clone)]
pub struct Readiness {
    pub token: u64,
    pub readable: bool,
    pub closed: bool,
}

/// An epoll instance with level-triggered read/hangup/error interest.
#[derive(Debug)]
pub struct Reactor {
    epoll: Epoll,
}

impl Reactor {
    pub fn new() -> Result<Self, Errno> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::empty())?,
        })
    }

    /// Registers `fd` under `token`.
    pub fn register(&self, fd: BorrowedFd<'_>, token: u64) -> Result<(), Errno> {
        self.epoll.add(
            fd,
            EpollEvent::new(
                EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR,
                token,
            ),
        )
    }

    /// Blocks until at least one registered fd is ready.
    pub fn wait(&self) -> Result<Vec<Readiness>, Errno> {
        let mut events = [EpollEvent::empty(); 8];
        let n = loop {
            match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => break n,
                Err(Errno::EINTR) => {}
                Err(err) => return Err(err),
            }
        };
        Ok(events[..n]
            .iter()
            .map(|event| Readiness {
                token: event.data(),
                readable: event.events().contains(EpollFlags::EPOLLIN),
                closed: event
                    .events()
                    .intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR),
            })
            .collect())
    }
}
