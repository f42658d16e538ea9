// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The synchronous reply primitive.
//!
//! A request that needs a synchronous answer carries a counter-valued fd
//! (an eventfd) as ancillary data; the remote answers by writing the reply
//! value to it. A counter fd cannot distinguish "zero sent" from "nothing
//! sent yet", so values are shifted up by one on [`notify`] and corrected
//! on [`wait`], with `u64::MAX` passed through verbatim as the failure
//! value.

use nix::errno::Errno;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use nix::poll::poll;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use parking_lot::Mutex;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;

/// How long [`wait`] blocks for the remote before giving up.
pub const WAIT_TIMEOUT_MS: u16 = 1000;

/// Wakes the waiter on `fd` with `val`.
///
/// Errors are logged and swallowed; the waiter observes them as a timeout.
pub fn notify(fd: BorrowedFd<'_>, val: u64) {
    let wire = if val == u64::MAX { val } else { val + 1 };
    match nix::unistd::write(fd, &wire.to_ne_bytes()) {
        Ok(n) if n == size_of::<u64>() => {}
        Ok(n) => tracing::error!(n, "short write to wait fd"),
        Err(err) => tracing::error!(
            error = &err as &dyn std::error::Error,
            "failed to notify wait fd"
        ),
    }
}

/// Blocks for the reply value on `fd`, for at most [`WAIT_TIMEOUT_MS`].
///
/// Returns `u64::MAX` on timeout or I/O failure.
pub fn wait(fd: BorrowedFd<'_>) -> u64 {
    let mut pfds = [PollFd::new(fd, PollFlags::POLLIN)];
    loop {
        match poll(&mut pfds, PollTimeout::from(WAIT_TIMEOUT_MS)) {
            Ok(0) => {
                tracing::error!("timed out waiting for remote");
                return u64::MAX;
            }
            Ok(_) => break,
            Err(Errno::EINTR) => {}
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "poll error waiting for remote"
                );
                return u64::MAX;
            }
        }
    }

    let mut buf = [0u8; size_of::<u64>()];
    match nix::unistd::read(fd.as_raw_fd(), &mut buf) {
        Ok(n) if n == buf.len() => {}
        _ => return u64::MAX,
    }
    let val = u64::from_ne_bytes(buf);
    if val == u64::MAX { val } else { val - 1 }
}

/// A pooled wait fd held by the requesting side.
#[derive(Debug)]
pub struct WaitFd(EventFd);

impl WaitFd {
    /// Duplicates the fd for attachment to an outgoing frame. The original
    /// stays here to collect the reply.
    pub fn dup_for_send(&self) -> std::io::Result<OwnedFd> {
        self.0.as_fd().try_clone_to_owned()
    }

    /// Blocks for the reply on this fd.
    pub fn wait(&self) -> u64 {
        wait(self.0.as_fd())
    }
}

impl AsFd for WaitFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// A small free list of wait fds, one taken per in-flight request.
#[derive(Debug, Default)]
pub struct WaitPool {
    free: Mutex<Vec<EventFd>>,
}

impl WaitPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a wait fd from the pool, creating one if the pool is dry.
    pub fn get(&self) -> nix::Result<WaitFd> {
        if let Some(efd) = self.free.lock().pop() {
            return Ok(WaitFd(efd));
        }
        Ok(WaitFd(EventFd::from_value_and_flags(
            0,
            EfdFlags::EFD_NONBLOCK,
        )?))
    }

    /// Returns a wait fd to the pool, discarding any reply that was never
    /// collected.
    pub fn put(&self, fd: WaitFd) {
        let mut buf = [0u8; size_of::<u64>()];
        while nix::unistd::read(fd.0.as_raw_fd(), &mut buf).is_ok() {}
        self.free.lock().push(fd.0);
    }
}
