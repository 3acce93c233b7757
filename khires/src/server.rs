//! Control channel server.
//!
//! Listens on a Unix socket. Accepting a connection plays the role the
//! character device's `open` played: the first thing a client receives is a
//! hello reply carrying the region fd as SCM_RIGHTS ancillary data, which it
//! then maps. After that the stream carries two-byte `[magic, cmd]` requests
//! and status-prefixed replies; none of this is on any hot path.

use std::io::{IoSlice, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use hires_common::layout::wire;
use log::{info, warn};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use thiserror::Error;

use crate::region::SharedRegion;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to remove stale control socket {path}: {source}")]
    RemoveStale {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to bind control socket {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Accept loop state shared with per-connection threads.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    region: Arc<SharedRegion>,
    cycles_per_us: u64,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale socket file if one is
    /// left over from a previous run.
    pub fn bind(
        path: &Path,
        region: Arc<SharedRegion>,
        cycles_per_us: u64,
    ) -> Result<Self, ServerError> {
        if path.exists() {
            std::fs::remove_file(path).map_err(|source| ServerError::RemoveStale {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let listener = UnixListener::bind(path).map_err(|source| ServerError::Bind {
            path: path.to_path_buf(),
            source,
        })?;
        info!("control socket listening at {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            region,
            cycles_per_us,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Serve clients until the listener fails. Each connection gets its own
    /// thread; clients are few (producers, one consumer, operator tooling).
    pub fn run(&self) {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let region = Arc::clone(&self.region);
                    let cycles_per_us = self.cycles_per_us;
                    thread::spawn(move || {
                        if let Err(err) = serve_client(stream, &region, cycles_per_us) {
                            warn!("control client dropped: {err}");
                        }
                    });
                }
                Err(err) => {
                    warn!("accept failed on control socket: {err}");
                }
            }
        }
    }
}

/// Send the hello reply: an OK status with the region fd attached.
fn send_region_fd(stream: &UnixStream, region: &SharedRegion) -> std::io::Result<()> {
    let status = wire::STATUS_OK.to_le_bytes();
    let iov = [IoSlice::new(&status)];
    let fds = [region.fd().as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(std::io::Error::from)?;
    Ok(())
}

fn reply_status(stream: &mut UnixStream, status: i32) -> std::io::Result<()> {
    stream.write_all(&status.to_le_bytes())
}

fn reply_payload(stream: &mut UnixStream, payload: &[u8]) -> std::io::Result<()> {
    stream.write_all(&wire::STATUS_OK.to_le_bytes())?;
    stream.write_all(payload)
}

fn serve_client(
    mut stream: UnixStream,
    region: &SharedRegion,
    cycles_per_us: u64,
) -> std::io::Result<()> {
    send_region_fd(&stream, region)?;

    let mut request = [0u8; 2];
    loop {
        match stream.read_exact(&mut request) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
        let [magic, cmd] = request;
        if magic != wire::CONTROL_MAGIC {
            warn!("control request with bad magic {magic:#04x}");
            reply_status(&mut stream, wire::STATUS_ERR_BAD_CMD)?;
            continue;
        }

        match cmd {
            wire::CMD_RESET => {
                info!("control: resetting ring buffer");
                region.reset();
                reply_status(&mut stream, wire::STATUS_OK)?;
            }
            wire::CMD_GET_META => {
                let meta = region.meta();
                reply_payload(&mut stream, bytemuck::bytes_of(&meta))?;
            }
            wire::CMD_GET_CYCLES_PER_US => {
                if cycles_per_us == 0 {
                    warn!("control: frequency requested before successful calibration");
                    reply_status(&mut stream, wire::STATUS_ERR_FAULT)?;
                } else {
                    reply_payload(&mut stream, &cycles_per_us.to_le_bytes())?;
                }
            }
            other => {
                warn!("control: unknown command {other}");
                reply_status(&mut stream, wire::STATUS_ERR_BAD_CMD)?;
            }
        }
    }
}
