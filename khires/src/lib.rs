//! Region owner for the HiRes event logger.
//!
//! Owns the shared ring buffer region for the lifetime of the process,
//! calibrates the cycle counter once at startup, serves the control channel,
//! and exposes the resident producer entry point other subsystems in this
//! process call to log events with the KERNEL origin flag.

pub mod calibrate;
pub mod config;
pub mod region;
pub mod server;

use std::sync::Arc;

use hires_common::ring::{Origin, ProduceStatus};
use once_cell::sync::OnceCell;
use thiserror::Error;

pub use config::Config;
pub use region::SharedRegion;
pub use server::ControlServer;

// Cheap cycle reads for in-process callers, alongside `log`.
pub use hires_common::cycles::{rdtsc, rdtscp};

/// The singleton region the resident producer logs through. Installed once
/// during startup, read-only thereafter; mirrors the module-global buffer of
/// a kernel-resident logger.
static REGION: OnceCell<Arc<SharedRegion>> = OnceCell::new();

#[derive(Debug, Error)]
pub enum LogError {
    /// `log` was called before [`install_region`] (or installation failed).
    #[error("shared region not initialized")]
    NotInitialized,
    /// Ring was full; the drop counter was incremented.
    #[error("ring buffer full, entry dropped")]
    Dropped,
}

/// Install the process-wide region. Returns `false` if one is already
/// installed (the newcomer is dropped).
pub fn install_region(region: Arc<SharedRegion>) -> bool {
    REGION.set(region).is_ok()
}

/// The installed region, if any.
pub fn installed_region() -> Option<&'static Arc<SharedRegion>> {
    REGION.get()
}

/// Log an event from the resident producer.
///
/// Safe from any thread, never blocks, never allocates. Entries published
/// through here carry the KERNEL flag.
pub fn log(event_id: u32, data1: u64, data2: u64) -> Result<(), LogError> {
    let region = REGION.get().ok_or(LogError::NotInitialized)?;
    match region.view().produce(event_id, data1, data2, Origin::Kernel) {
        ProduceStatus::Logged => Ok(()),
        ProduceStatus::Dropped => Err(LogError::Dropped),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hires_common::entry_flags;
    use hires_common::ring::PopStatus;

    // The singleton can be installed once per process, so everything that
    // depends on it lives in one test.
    #[test]
    fn resident_producer_lifecycle() {
        assert!(matches!(log(1, 0, 0), Err(LogError::NotInitialized)));

        let region = Arc::new(SharedRegion::allocate(3).unwrap());
        assert!(install_region(Arc::clone(&region)));
        // A second install is refused.
        assert!(!install_region(Arc::clone(&region)));

        log(0xbeef, 1, 2).unwrap();
        match region.view().consume() {
            PopStatus::Entry(e) => {
                assert_eq!(e.event_id, 0xbeef);
                assert_ne!(e.flags & entry_flags::KERNEL, 0);
            }
            other => panic!("expected entry, got {other:?}"),
        }

        // Fill the ring; the next log reports the drop.
        for i in 0..8 {
            let _ = log(i, 0, 0);
        }
        assert!(matches!(log(99, 0, 0), Err(LogError::Dropped)));
    }
}
