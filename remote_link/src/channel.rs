// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! One endpoint of a proxy/remote socket pair, with the frame codec.

use crate::frame::Frame;
use crate::frame::InlineData;
use crate::frame::Payload;
use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::ControlMessage;
use nix::sys::socket::ControlMessageOwned;
use nix::sys::socket::MsgFlags;
use nix::sys::socket::recvmsg;
use nix::sys::socket::sendmsg;
use parking_lot::Mutex;
use remote_protocol::Command;
use remote_protocol::INLINE_DATA_SIZE;
use remote_protocol::MSG_HEADER_SIZE;
use remote_protocol::MsgHeader;
use remote_protocol::PayloadShape;
use remote_protocol::REMOTE_MAX_FDS;
use remote_protocol::UnknownCommand;
use std::io::IoSlice;
use std::io::IoSliceMut;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Upper bound on a bytestream payload. The wire format itself carries a
/// 64-bit length; this bound keeps a corrupt header from driving a huge
/// allocation.
const MAX_STREAM_LEN: u64 = 1 << 20;

/// Frame codec failures. All of these are fatal to the link.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("peer disconnected")]
    Disconnected,
    #[error("socket i/o error")]
    Io(#[source] Errno),
    #[error(transparent)]
    UnknownCommand(UnknownCommand),
    #[error("frame carries {0} fds, limit {REMOTE_MAX_FDS}")]
    TooManyFds(usize),
    #[error("fd list truncated by the kernel")]
    FdsTruncated,
    #[error("truncated frame: got {got} of {want} header bytes")]
    TruncatedHeader { got: usize, want: usize },
    #[error("truncated payload for {cmd:?}")]
    TruncatedPayload { cmd: Command },
    #[error("payload size {size} invalid for {cmd:?} (bytestream={bytestream})")]
    PayloadShape {
        cmd: Command,
        size: u64,
        bytestream: u32,
    },
}

/// One socket endpoint with independent send and receive locks.
///
/// Sends and receives may proceed concurrently; two senders (or two
/// receivers) serialize against each other so frames never interleave.
pub struct Channel {
    sock: OwnedFd,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
}

impl Channel {
    /// Wraps a connected stream socket.
    pub fn new(sock: OwnedFd) -> Self {
        Self {
            sock,
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
        }
    }

    /// The underlying socket, for poll registration.
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }

    /// Sends one frame: header plus ancillary FDs in a single `sendmsg`,
    /// then the payload body.
    ///
    /// EINTR and EAGAIN are retried indefinitely. Any other error is
    /// returned without unwinding; the peer will observe a broken frame and
    /// tear the link down.
    pub fn send(&self, frame: &Frame) -> Result<(), ChannelError> {
        if frame.fds.len() > REMOTE_MAX_FDS {
            return Err(ChannelError::TooManyFds(frame.fds.len()));
        }

        let (bytestream, size) = match &frame.payload {
            Payload::Empty => (0, 0),
            Payload::Inline(_) => (0, INLINE_DATA_SIZE as u64),
            Payload::Stream(bytes) => (1, bytes.len() as u64),
        };
        let header = MsgHeader {
            cmd: frame.cmd as u32,
            bytestream,
            size,
            id: frame.id,
            size_id: 0,
            num_fds: frame.fds.len() as u8,
            pad: [0; 7],
        };

        let raw_fds: Vec<RawFd> = frame.fds.iter().map(|fd| fd.as_raw_fd()).collect();
        let cmsgs = if raw_fds.is_empty() {
            Vec::new()
        } else {
            vec![ControlMessage::ScmRights(&raw_fds)]
        };

        let _guard = self.send_lock.lock();

        let sent = loop {
            match sendmsg::<()>(
                self.sock.as_raw_fd(),
                &[IoSlice::new(header.as_bytes())],
                &cmsgs,
                MsgFlags::MSG_NOSIGNAL,
                None,
            ) {
                Ok(n) => break n,
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
                Err(err) => return Err(ChannelError::Io(err)),
            }
        };
        // The FDs were delivered with the first byte; any header remainder
        // goes out as plain bytes.
        if sent < MSG_HEADER_SIZE {
            self.write_all(&header.as_bytes()[sent..])?;
        }

        match &frame.payload {
            Payload::Empty => Ok(()),
            Payload::Inline(data) => self.write_all(&data.to_wire()),
            Payload::Stream(bytes) => self.write_all(bytes),
        }
    }

    /// Receives one frame, blocking until a full frame or a hard error.
    pub fn recv(&self) -> Result<Frame, ChannelError> {
        let _guard = self.recv_lock.lock();

        let mut header_buf = [0u8; MSG_HEADER_SIZE];
        let mut cmsg_buf = cmsg_space!([RawFd; REMOTE_MAX_FDS]);

        let (mut got, flags, fds) = {
            let mut iov = [IoSliceMut::new(&mut header_buf)];
            let msg = loop {
                match recvmsg::<()>(
                    self.sock.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::empty(),
                ) {
                    Ok(msg) => break msg,
                    Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
                    Err(err) => return Err(ChannelError::Io(err)),
                }
            };

            let mut fds = Vec::new();
            for cmsg in msg.cmsgs() {
                if let ControlMessageOwned::ScmRights(raw) = cmsg {
                    // SAFETY: the kernel installed these descriptors into
                    // this process for us to own.
                    fds.extend(
                        raw.into_iter()
                            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
                    );
                    break;
                }
            }
            (msg.bytes, msg.flags, fds)
        };

        if got == 0 {
            return Err(ChannelError::Disconnected);
        }
        while got < MSG_HEADER_SIZE {
            let n = self.read_some(&mut header_buf[got..])?;
            if n == 0 {
                return Err(ChannelError::TruncatedHeader {
                    got,
                    want: MSG_HEADER_SIZE,
                });
            }
            got += n;
        }

        // Infallible: the buffer is exactly header-sized.
        let header = MsgHeader::read_from_bytes(&header_buf).unwrap();

        if usize::from(header.num_fds) > REMOTE_MAX_FDS {
            return Err(ChannelError::TooManyFds(header.num_fds.into()));
        }
        if flags.contains(MsgFlags::MSG_CTRUNC) {
            return Err(ChannelError::FdsTruncated);
        }
        if fds.len() > REMOTE_MAX_FDS {
            return Err(ChannelError::TooManyFds(fds.len()));
        }

        let cmd = Command::from_u32(header.cmd).map_err(ChannelError::UnknownCommand)?;

        // Validate the advertised size against the command's shape before
        // trusting it for the payload read.
        let shape = cmd.shape();
        let shape_err = || ChannelError::PayloadShape {
            cmd,
            size: header.size,
            bytestream: header.bytestream,
        };
        let payload = match shape.payload {
            PayloadShape::Empty => {
                if header.bytestream != 0 || header.size != 0 {
                    return Err(shape_err());
                }
                Payload::Empty
            }
            PayloadShape::Inline(kind) => {
                if header.bytestream != 0 || header.size != INLINE_DATA_SIZE as u64 {
                    return Err(shape_err());
                }
                let mut block = [0u8; INLINE_DATA_SIZE];
                self.read_exact(&mut block, cmd)?;
                let data = InlineData::parse(kind, &block).ok_or_else(shape_err)?;
                Payload::Inline(data)
            }
            PayloadShape::Stream(exact) => {
                if header.bytestream == 0 || header.size == 0 || header.size > MAX_STREAM_LEN {
                    return Err(shape_err());
                }
                if exact.is_some_and(|want| want != header.size) {
                    return Err(shape_err());
                }
                let mut bytes = vec![0u8; header.size as usize];
                self.read_exact(&mut bytes, cmd)?;
                Payload::Stream(bytes)
            }
        };

        Ok(Frame {
            cmd,
            id: header.id,
            fds,
            payload,
        })
    }

    // MSG_NOSIGNAL: a dead peer must surface as EPIPE, not SIGPIPE.
    fn write_all(&self, mut buf: &[u8]) -> Result<(), ChannelError> {
        while !buf.is_empty() {
            match nix::sys::socket::send(self.sock.as_raw_fd(), buf, MsgFlags::MSG_NOSIGNAL) {
                Ok(0) => return Err(ChannelError::Io(Errno::EPIPE)),
                Ok(n) => buf = &buf[n..],
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
                Err(err) => return Err(ChannelError::Io(err)),
            }
        }
        Ok(())
    }

    fn read_some(&self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        loop {
            match nix::unistd::read(self.sock.as_raw_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
                Err(err) => return Err(ChannelError::Io(err)),
            }
        }
    }

    fn read_exact(&self, buf: &mut [u8], cmd: Command) -> Result<(), ChannelError> {
        let mut off = 0;
        while off < buf.len() {
            let n = self.read_some(&mut buf[off..])?;
            if n == 0 {
                return Err(ChannelError::TruncatedPayload { cmd });
            }
            off += n;
        }
        Ok(())
    }
}
