//! Byte-exact layout of the shared region.
//!
//! The region is a single page-aligned block: a cache-line padded control
//! block at offset 0, followed immediately by the entry array. Both sides of
//! the boundary map the same bytes, so every offset here is load-bearing and
//! pinned by compile-time assertions.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ head            (8 bytes + 56 pad, own cache line)        │
//! ├───────────────────────────────────────────────────────────┤
//! │ tail            (8 bytes + 56 pad, own cache line)        │
//! ├───────────────────────────────────────────────────────────┤
//! │ shm sizes, capacity, idx_mask, dropped_count (+24 pad)    │
//! ├───────────────────────────────────────────────────────────┤
//! │ buffer[capacity] (40-byte entries, cache-line aligned)    │
//! └───────────────────────────────────────────────────────────┘
//! ```

use bytemuck::{Pod, Zeroable};

/// Cache line size assumed for padding. 64 bytes on every target we run on.
pub const CACHE_LINE_SIZE: usize = 64;

/// Default log2 of the ring capacity (65 536 entries).
pub const DEFAULT_RB_SIZE_LOG2: u32 = 16;

/// Default control-socket path of the region owner.
pub const DEFAULT_SOCKET_PATH: &str = "/run/khires.sock";

/// Sentinel stored in [`LogEntry::cpu_id`] when the current CPU cannot be
/// determined.
pub const CPU_ID_UNKNOWN: u32 = u32::MAX;

/// Bits of [`LogEntry::flags`]. All unlisted bits are reserved and must be
/// written as zero.
pub mod entry_flags {
    /// Entry is published and readable by the consumer.
    pub const VALID: u16 = 1 << 0;
    /// Entry was produced by the resident (kernel-side) producer.
    pub const KERNEL: u16 = 1 << 1;
}

/// One fixed-size record in the ring.
///
/// `flags` is the sole visibility gate between producer and consumer; it is
/// only ever touched through atomic views of the field (see `ring`). The
/// padding is explicit so that both sides agree byte-for-byte.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct LogEntry {
    /// Raw cycle count sampled at produce time.
    pub timestamp: u64,
    /// Opaque event identifier.
    pub event_id: u32,
    /// Logical CPU the entry was produced on, or [`CPU_ID_UNKNOWN`].
    pub cpu_id: u32,
    /// See [`entry_flags`].
    pub flags: u16,
    pub _pad: [u8; 6],
    pub data1: u64,
    pub data2: u64,
}

/// Size of one entry in bytes.
pub const ENTRY_SIZE: usize = core::mem::size_of::<LogEntry>();

/// Control block at offset 0 of the shared region.
///
/// `head` and `tail` sit on their own cache lines so the producer and
/// consumer hot paths never false-share. The metadata words are written once
/// by the region owner before the region is shared; `head`, `tail` and
/// `dropped_count` are accessed exclusively through atomic views.
#[repr(C, align(64))]
#[derive(Copy, Clone)]
pub struct SharedRingBuffer {
    /// Monotone claim counter; slot index is `head & idx_mask`.
    pub head: u64,
    pub _pad0: [u8; 56],

    /// Monotone drain counter, advanced only by the single consumer.
    pub tail: u64,
    pub _pad1: [u8; 56],

    /// Logical region size user space requests from `mmap`.
    pub shm_size_bytes_unaligned: u64,
    /// Page-aligned size actually allocated.
    pub shm_size_bytes_aligned: u64,
    /// Power-of-two number of entries.
    pub capacity: u64,
    /// `capacity - 1`.
    pub idx_mask: u64,
    /// Monotone count of produce attempts rejected because the ring was full.
    pub dropped_count: u64,
    pub _pad2: [u8; 24],
    // buffer[capacity] follows immediately, cache-line aligned.
}

/// Byte offset of the entry array within the region.
pub const CONTROL_BLOCK_SIZE: usize = core::mem::size_of::<SharedRingBuffer>();

const _: () = {
    assert!(ENTRY_SIZE == 40);
    assert!(CONTROL_BLOCK_SIZE == 3 * CACHE_LINE_SIZE);
    assert!(CONTROL_BLOCK_SIZE % CACHE_LINE_SIZE == 0);
    assert!(core::mem::offset_of!(SharedRingBuffer, head) == 0);
    assert!(core::mem::offset_of!(SharedRingBuffer, tail) == CACHE_LINE_SIZE);
    assert!(core::mem::offset_of!(SharedRingBuffer, dropped_count) == 2 * CACHE_LINE_SIZE + 32);
    assert!(core::mem::offset_of!(LogEntry, flags) == 16);
    assert!(core::mem::offset_of!(LogEntry, data1) == 24);
};

/// Out-of-band metadata copied to clients over the control channel. User
/// space needs it before `mmap` to know how large a mapping to request.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct RbMeta {
    pub capacity: u64,
    pub idx_mask: u64,
    pub shm_size_bytes_unaligned: u64,
}

/// Logical region size for a given capacity, before page alignment.
pub const fn region_size_unaligned(capacity: u64) -> u64 {
    CONTROL_BLOCK_SIZE as u64 + capacity * ENTRY_SIZE as u64
}

/// Round a logical region size up to whole pages.
pub const fn region_size_aligned(unaligned: u64, page_size: u64) -> u64 {
    unaligned.div_ceil(page_size) * page_size
}

/// Control-channel wire protocol.
///
/// Every request is two bytes, `[MAGIC, cmd]`. Every reply starts with a
/// little-endian `i32` status: zero on success (followed by the command's
/// fixed-size payload, if any), or a negative errno value. On connect the
/// owner sends an unsolicited hello reply carrying the region file
/// descriptor as SCM_RIGHTS ancillary data.
pub mod wire {
    /// Magic byte prefixing every request.
    pub const CONTROL_MAGIC: u8 = b'h';

    /// Reset head, tail, dropped count and every VALID bit. No payload.
    pub const CMD_RESET: u8 = 1;
    /// Reply payload: [`super::RbMeta`] (24 bytes).
    pub const CMD_GET_META: u8 = 2;
    /// Reply payload: calibrated cycles-per-microsecond (`u64`).
    pub const CMD_GET_CYCLES_PER_US: u8 = 3;

    pub const STATUS_OK: i32 = 0;
    /// Region not initialized (EIO).
    pub const STATUS_ERR_IO: i32 = -(libc::EIO);
    /// Copy failure or frequency not calibrated (EFAULT).
    pub const STATUS_ERR_FAULT: i32 = -(libc::EFAULT);
    /// Rejected mapping request (EINVAL).
    pub const STATUS_ERR_INVAL: i32 = -(libc::EINVAL);
    /// Unknown command or bad magic (ENOTTY).
    pub const STATUS_ERR_BAD_CMD: i32 = -(libc::ENOTTY);

    /// Size of the status word every reply starts with.
    pub const STATUS_SIZE: usize = core::mem::size_of::<i32>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{align_of, size_of};

    #[test]
    fn entry_layout_is_fixed() {
        assert_eq!(size_of::<LogEntry>(), 40);
        assert_eq!(core::mem::offset_of!(LogEntry, timestamp), 0);
        assert_eq!(core::mem::offset_of!(LogEntry, event_id), 8);
        assert_eq!(core::mem::offset_of!(LogEntry, cpu_id), 12);
        assert_eq!(core::mem::offset_of!(LogEntry, flags), 16);
        assert_eq!(core::mem::offset_of!(LogEntry, data1), 24);
        assert_eq!(core::mem::offset_of!(LogEntry, data2), 32);
    }

    #[test]
    fn control_block_padding_isolates_hot_words() {
        assert_eq!(size_of::<SharedRingBuffer>(), 192);
        assert_eq!(align_of::<SharedRingBuffer>(), CACHE_LINE_SIZE);
        // head and tail must not share a cache line with anything else.
        assert_eq!(core::mem::offset_of!(SharedRingBuffer, head), 0);
        assert_eq!(core::mem::offset_of!(SharedRingBuffer, tail), 64);
        assert_eq!(
            core::mem::offset_of!(SharedRingBuffer, shm_size_bytes_unaligned),
            128
        );
        // Entry array starts on a cache-line boundary.
        assert_eq!(CONTROL_BLOCK_SIZE % CACHE_LINE_SIZE, 0);
    }

    #[test]
    fn meta_is_pod_and_packed() {
        assert_eq!(size_of::<RbMeta>(), 24);
        let meta = RbMeta {
            capacity: 8,
            idx_mask: 7,
            shm_size_bytes_unaligned: region_size_unaligned(8),
        };
        let bytes = bytemuck::bytes_of(&meta);
        let back: RbMeta = bytemuck::pod_read_unaligned(bytes);
        assert_eq!(back, meta);
    }

    #[test]
    fn region_sizes_round_to_pages() {
        let unaligned = region_size_unaligned(1 << 4);
        assert_eq!(unaligned, 192 + 16 * 40);
        assert_eq!(region_size_aligned(unaligned, 4096), 4096);
        assert_eq!(region_size_aligned(4096, 4096), 4096);
        assert_eq!(region_size_aligned(4097, 4096), 8192);
    }
}
