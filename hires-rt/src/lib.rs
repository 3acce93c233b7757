//! User-space runtime for the HiRes event logger.
//!
//! A [`Connection`] encapsulates everything a process needs to act as a
//! producer and/or the consumer: the control channel to the region owner,
//! the mapped region, and the runtime metadata discovered during the
//! handshake. Producer and consumer operations are lock-free and never touch
//! the control channel.

mod control;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use hires_common::layout::{region_size_unaligned, wire, SharedRingBuffer};
use hires_common::ring::{Origin, RingView};
use log::{debug, info};
use memmap2::{MmapMut, MmapOptions};
use thiserror::Error;

pub use hires_common::layout::{entry_flags, LogEntry, RbMeta, CPU_ID_UNKNOWN};
pub use hires_common::ring::{PopStatus, ProduceStatus};
pub use hires_common::{cycles, DEFAULT_SOCKET_PATH};

use control::ControlChannel;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to control socket {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("control channel I/O failed: {0}")]
    Io(#[source] std::io::Error),
    #[error("control channel failed: {0}")]
    Os(#[source] nix::Error),
    #[error("control channel returned status {0}")]
    Status(i32),
    #[error("hello reply was malformed or carried no region fd")]
    Handshake,
    #[error("region metadata is inconsistent")]
    BadMetadata,
    #[error("failed to map the shared region: {0}")]
    Map(#[source] std::io::Error),
}

/// Counters kept by the consumer path. Gaps in the event stream can be
/// accounted for by combining these with the ring's `dropped_count`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    /// Entries returned to the caller.
    pub delivered: u64,
    /// Polls that found `tail == head`.
    pub empty: u64,
    /// Polls that gave up waiting on an unpublished slot.
    pub not_ready: u64,
}

#[derive(Default)]
struct StatsCells {
    delivered: AtomicU64,
    empty: AtomicU64,
    not_ready: AtomicU64,
}

/// A live mapping of the shared ring buffer region.
///
/// `log` may be called from any number of threads sharing one connection.
/// `pop` is single-consumer by contract: the region has exactly one drain
/// cursor, so only one thread across all processes may run it.
///
/// Dropping the connection unmaps the region and closes the control
/// channel; the owner-side region is unaffected. In-flight `log` calls must
/// be quiesced by the caller before dropping.
pub struct Connection {
    // Declaration order is drop order: unmap the region, then close the
    // control channel.
    map: MmapMut,
    control: ControlChannel,
    ring: RingView,
    capacity: u64,
    idx_mask: u64,
    mapped_size: usize,
    cycles_per_us: u64,
    stats: StatsCells,
}

impl Connection {
    /// Connect to the region owner and map the ring.
    ///
    /// `path` defaults to [`DEFAULT_SOCKET_PATH`]. The handshake queries the
    /// runtime metadata and the calibrated frequency, then maps exactly the
    /// advertised logical size at offset zero with the share-and-populate
    /// hints. Every step is all-or-nothing: any failure releases whatever
    /// was acquired before it. The one exception is a not-calibrated
    /// frequency reply, which records a frequency of zero; logging works on
    /// raw cycles regardless.
    pub fn connect(path: Option<&Path>) -> Result<Self, ConnectionError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_SOCKET_PATH));
        let (control, region_fd) = ControlChannel::connect(path)?;

        let meta = control.get_meta()?;
        if meta.capacity == 0
            || !meta.capacity.is_power_of_two()
            || meta.idx_mask != meta.capacity - 1
            || meta.shm_size_bytes_unaligned != region_size_unaligned(meta.capacity)
        {
            return Err(ConnectionError::BadMetadata);
        }

        let cycles_per_us = match control.get_cycles_per_us() {
            Ok(v) => v,
            Err(ConnectionError::Status(wire::STATUS_ERR_FAULT)) => {
                debug!("region owner has no calibrated frequency; caching 0");
                0
            }
            Err(err) => return Err(err),
        };

        let mapped_size = meta.shm_size_bytes_unaligned as usize;
        let mut map = unsafe {
            MmapOptions::new()
                .len(mapped_size)
                .populate()
                .map_mut(&region_fd)
                .map_err(ConnectionError::Map)?
        };
        // The region fd is only needed to establish the mapping.
        drop(region_fd);

        let ring = unsafe { RingView::from_raw(map.as_mut_ptr()) };
        info!(
            "connected: {} entries, {} bytes mapped, {} cycles/us",
            meta.capacity, mapped_size, cycles_per_us
        );

        Ok(Self {
            map,
            control,
            ring,
            capacity: meta.capacity,
            idx_mask: meta.idx_mask,
            mapped_size,
            cycles_per_us,
            stats: StatsCells::default(),
        })
    }

    /// Produce one entry from user context. Lock-free; a
    /// [`ProduceStatus::Dropped`] return means the ring was full and the
    /// drop counter was bumped.
    #[inline]
    pub fn log(&self, event_id: u32, data1: u64, data2: u64) -> ProduceStatus {
        self.ring.produce(event_id, data1, data2, Origin::User)
    }

    /// Drain one entry. Single consumer by contract (see type docs).
    pub fn pop(&self) -> PopStatus {
        let status = self.ring.consume();
        match status {
            PopStatus::Entry(_) => self.stats.delivered.fetch_add(1, Ordering::Relaxed),
            PopStatus::Empty => self.stats.empty.fetch_add(1, Ordering::Relaxed),
            PopStatus::NotReady => self.stats.not_ready.fetch_add(1, Ordering::Relaxed),
        };
        status
    }

    /// Ask the region owner to reset the ring. Operator action; racing
    /// producers may briefly re-assert a slot afterwards.
    pub fn reset(&self) -> Result<(), ConnectionError> {
        self.control.reset()
    }

    /// Raw pointer to the mapped control block, for advanced consumers.
    /// All access through it must follow the ring protocol.
    pub fn buffer_ptr(&self) -> *mut SharedRingBuffer {
        self.ring.as_ptr()
    }

    /// Bytes mapped into this process.
    pub fn mapped_size(&self) -> usize {
        self.mapped_size
    }

    /// Ring capacity in entries.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// `capacity - 1`.
    pub fn idx_mask(&self) -> u64 {
        self.idx_mask
    }

    /// Calibrated cycles-per-microsecond, or zero if the owner had no
    /// calibration when this connection was made.
    pub fn cycles_per_us(&self) -> u64 {
        self.cycles_per_us
    }

    /// Drop counter published in the shared region.
    pub fn dropped_count(&self) -> u64 {
        self.ring.dropped_count()
    }

    /// Snapshot of this connection's consumer counters.
    pub fn drain_stats(&self) -> DrainStats {
        DrainStats {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            empty: self.stats.empty.load(Ordering::Relaxed),
            not_ready: self.stats.not_ready.load(Ordering::Relaxed),
        }
    }

    /// Tear the connection down. Equivalent to dropping it; provided so
    /// call sites can be explicit about the lifecycle.
    pub fn disconnect(self) {
        drop(self);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!("disconnecting: unmapping {} bytes", self.map.len());
    }
}
