//! Client side of the control channel.
//!
//! Mirrors the server framing in `hires_common::layout::wire`: connect,
//! receive the hello carrying the region fd, then exchange two-byte requests
//! for status-prefixed replies. Used only at connect/reset time, never on
//! the hot path.

use std::io::{IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use hires_common::layout::{wire, RbMeta};
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixAddr};

use crate::ConnectionError;

pub(crate) struct ControlChannel {
    stream: UnixStream,
}

impl ControlChannel {
    /// Connect and complete the hello, returning the channel and the region
    /// fd the owner attached.
    pub(crate) fn connect(path: &Path) -> Result<(Self, OwnedFd), ConnectionError> {
        let stream = UnixStream::connect(path).map_err(|source| ConnectionError::Connect {
            path: path.to_path_buf(),
            source,
        })?;

        let mut status_buf = [0u8; wire::STATUS_SIZE];
        let mut received_fd: Option<RawFd> = None;
        {
            let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
            let mut iov = [IoSliceMut::new(&mut status_buf)];
            let msg = recvmsg::<UnixAddr>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )
            .map_err(ConnectionError::Os)?;
            if msg.bytes != wire::STATUS_SIZE {
                return Err(ConnectionError::Handshake);
            }
            for cmsg in msg.cmsgs().map_err(ConnectionError::Os)? {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    received_fd = fds.first().copied();
                }
            }
        }

        let status = i32::from_le_bytes(status_buf);
        if status != wire::STATUS_OK {
            if let Some(fd) = received_fd {
                drop(unsafe { OwnedFd::from_raw_fd(fd) });
            }
            return Err(ConnectionError::Status(status));
        }
        let fd = received_fd.ok_or(ConnectionError::Handshake)?;
        Ok((Self { stream }, unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// One request/reply exchange. Returns the command's payload on an OK
    /// status, the wire status otherwise.
    fn request(&self, cmd: u8, payload_len: usize) -> Result<Vec<u8>, ConnectionError> {
        (&self.stream)
            .write_all(&[wire::CONTROL_MAGIC, cmd])
            .map_err(ConnectionError::Io)?;

        let mut status_buf = [0u8; wire::STATUS_SIZE];
        (&self.stream)
            .read_exact(&mut status_buf)
            .map_err(ConnectionError::Io)?;
        let status = i32::from_le_bytes(status_buf);
        if status != wire::STATUS_OK {
            return Err(ConnectionError::Status(status));
        }

        let mut payload = vec![0u8; payload_len];
        if payload_len > 0 {
            (&self.stream)
                .read_exact(&mut payload)
                .map_err(ConnectionError::Io)?;
        }
        Ok(payload)
    }

    pub(crate) fn get_meta(&self) -> Result<RbMeta, ConnectionError> {
        let payload = self.request(wire::CMD_GET_META, core::mem::size_of::<RbMeta>())?;
        Ok(bytemuck::pod_read_unaligned(&payload))
    }

    /// Calibrated frequency, or `Status(-EFAULT)` when the owner has none.
    pub(crate) fn get_cycles_per_us(&self) -> Result<u64, ConnectionError> {
        let payload = self.request(wire::CMD_GET_CYCLES_PER_US, core::mem::size_of::<u64>())?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&payload);
        Ok(u64::from_le_bytes(bytes))
    }

    pub(crate) fn reset(&self) -> Result<(), ConnectionError> {
        self.request(wire::CMD_RESET, 0).map(|_| ())
    }
}
