//! Shared definitions for the HiRes event logger.
//!
//! This crate is the single source of truth for everything that crosses the
//! boundary between the region owner (`khires`) and user-space clients
//! (`hires-rt`): the byte-exact shared-memory layout, the lock-free MPSC
//! produce/consume protocol over that layout, the cycle-counter primitives
//! used for timestamps, and the control-channel wire constants.

pub mod cycles;
pub mod layout;
pub mod ring;

pub use layout::{
    entry_flags, wire, LogEntry, RbMeta, SharedRingBuffer, CACHE_LINE_SIZE, CONTROL_BLOCK_SIZE,
    CPU_ID_UNKNOWN, DEFAULT_RB_SIZE_LOG2, DEFAULT_SOCKET_PATH, ENTRY_SIZE,
};
pub use ring::{Origin, PopStatus, ProduceStatus, RingView, POP_SPIN_BUDGET};
