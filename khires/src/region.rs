//! Ownership of the shared region.
//!
//! The region is a sealed memfd: the kernel allocates its pages lazily and
//! non-contiguously, zero-filled, and demand-faults them into every mapping
//! of the fd. The owner's own mapping here is the contiguous view the
//! resident producer logs through; client mappings of the same fd see the
//! same pages. Grow/shrink seals pin the region size for its whole life, so
//! no mapping can be expanded out from under another.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use hires_common::layout::{region_size_aligned, region_size_unaligned, RbMeta};
use hires_common::ring::RingView;
use log::info;
use memmap2::{MmapMut, MmapOptions};
use nix::fcntl::{fcntl, FcntlArg, SealFlag};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd::{ftruncate, SysconfVar};
use thiserror::Error;

/// Largest accepted `rb_size_log2`. 2^30 entries is already a 40 GiB
/// region; anything above is a configuration mistake, not a workload.
pub const MAX_RB_SIZE_LOG2: u32 = 30;

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("rb_size_log2 must be in 1..={MAX_RB_SIZE_LOG2}, got {0}")]
    InvalidSizeLog2(u32),
    #[error("failed to create backing memfd: {0}")]
    Create(#[source] nix::Error),
    #[error("failed to size backing memfd to {size} bytes: {source}")]
    Size { size: u64, source: nix::Error },
    #[error("failed to seal backing memfd: {0}")]
    Seal(#[source] nix::Error),
    #[error("failed to map the region: {0}")]
    Map(#[source] std::io::Error),
    #[error("could not determine the system page size")]
    PageSize,
}

/// The shared region and its owner-side mapping.
///
/// Dropping the region unmaps the owner view first and then closes the
/// memfd; the kernel frees the pages once the last client mapping goes away.
pub struct SharedRegion {
    // Field order is drop order: unmap before close.
    map: MmapMut,
    memfd: OwnedFd,
    view: RingView,
    capacity: u64,
    size_unaligned: u64,
    size_aligned: u64,
}

// The mapping is shared memory driven entirely through RingView's protocol.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocate and initialize a region holding `1 << rb_size_log2` entries.
    ///
    /// Fails without leaking: each acquired resource is owned by the time
    /// the next step can fail, so teardown runs in reverse order
    /// automatically.
    pub fn allocate(rb_size_log2: u32) -> Result<Self, RegionError> {
        if rb_size_log2 < 1 || rb_size_log2 > MAX_RB_SIZE_LOG2 {
            return Err(RegionError::InvalidSizeLog2(rb_size_log2));
        }
        let capacity = 1u64 << rb_size_log2;
        let size_unaligned = region_size_unaligned(capacity);
        let page_size = nix::unistd::sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .filter(|&v| v > 0)
            .ok_or(RegionError::PageSize)? as u64;
        let size_aligned = region_size_aligned(size_unaligned, page_size);

        info!(
            "allocating region: {} entries, {} bytes unaligned, {} bytes aligned ({} pages)",
            capacity,
            size_unaligned,
            size_aligned,
            size_aligned / page_size
        );

        let memfd = memfd_create(
            c"khires",
            MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING,
        )
        .map_err(RegionError::Create)?;

        ftruncate(&memfd, size_aligned as i64).map_err(|source| RegionError::Size {
            size: size_aligned,
            source,
        })?;

        // The VM_DONTEXPAND of this world: nobody, owner included, can
        // resize the region once clients hold the fd.
        fcntl(
            memfd.as_raw_fd(),
            FcntlArg::F_ADD_SEALS(
                SealFlag::F_SEAL_GROW | SealFlag::F_SEAL_SHRINK | SealFlag::F_SEAL_SEAL,
            ),
        )
        .map_err(RegionError::Seal)?;

        let mut map = unsafe {
            MmapOptions::new()
                .len(size_aligned as usize)
                .map_mut(&memfd)
                .map_err(RegionError::Map)?
        };

        // Fresh memfd pages are zero; only the metadata words need writing.
        let view = unsafe {
            RingView::init_in_place(map.as_mut_ptr(), capacity, size_unaligned, size_aligned)
        };

        Ok(Self {
            map,
            memfd,
            view,
            capacity,
            size_unaligned,
            size_aligned,
        })
    }

    /// Protocol view over the owner mapping.
    pub fn view(&self) -> RingView {
        self.view
    }

    /// Metadata clients need before mapping.
    pub fn meta(&self) -> RbMeta {
        RbMeta {
            capacity: self.capacity,
            idx_mask: self.capacity - 1,
            shm_size_bytes_unaligned: self.size_unaligned,
        }
    }

    /// The fd handed to clients over the control channel.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.memfd.as_fd()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn size_unaligned(&self) -> u64 {
        self.size_unaligned
    }

    pub fn size_aligned(&self) -> u64 {
        self.size_aligned
    }

    /// Reset counters and visibility bits. See [`RingView::reset`] for the
    /// producer race this deliberately tolerates.
    pub fn reset(&self) {
        self.view.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hires_common::ring::{Origin, PopStatus, ProduceStatus};

    #[test]
    fn allocate_initializes_control_block() {
        let region = SharedRegion::allocate(4).unwrap();
        let v = region.view();
        assert_eq!(v.capacity(), 16);
        assert_eq!(v.idx_mask(), 15);
        assert_eq!(v.head(), 0);
        assert_eq!(v.tail(), 0);
        assert_eq!(v.shm_size_bytes_unaligned(), region.size_unaligned());
        assert_eq!(v.shm_size_bytes_aligned(), region.size_aligned());
        assert_eq!(region.size_aligned() % 4096, 0);
        assert!(region.size_aligned() >= region.size_unaligned());
    }

    #[test]
    fn rejects_out_of_range_sizes() {
        assert!(matches!(
            SharedRegion::allocate(0),
            Err(RegionError::InvalidSizeLog2(0))
        ));
        assert!(matches!(
            SharedRegion::allocate(MAX_RB_SIZE_LOG2 + 1),
            Err(RegionError::InvalidSizeLog2(_))
        ));
    }

    #[test]
    fn meta_matches_view() {
        let region = SharedRegion::allocate(3).unwrap();
        let meta = region.meta();
        assert_eq!(meta.capacity, 8);
        assert_eq!(meta.idx_mask, 7);
        assert_eq!(meta.shm_size_bytes_unaligned, region.size_unaligned());
    }

    #[test]
    fn region_is_usable_and_resettable() {
        let region = SharedRegion::allocate(3).unwrap();
        let v = region.view();
        assert_eq!(v.produce(1, 2, 3, Origin::Kernel), ProduceStatus::Logged);
        region.reset();
        assert_eq!(v.head(), 0);
        assert_eq!(v.consume(), PopStatus::Empty);
    }

    #[test]
    fn second_mapping_of_the_fd_sees_the_same_ring() {
        let region = SharedRegion::allocate(3).unwrap();
        let mut remap = unsafe {
            MmapOptions::new()
                .len(region.size_unaligned() as usize)
                .map_mut(&region.fd())
                .unwrap()
        };
        let other = unsafe { RingView::from_raw(remap.as_mut_ptr()) };

        assert_eq!(region.view().produce(5, 6, 7, Origin::User), ProduceStatus::Logged);
        match other.consume() {
            PopStatus::Entry(e) => {
                assert_eq!(e.event_id, 5);
                assert_eq!(e.data1, 6);
            }
            other => panic!("expected entry, got {other:?}"),
        }
    }
}
