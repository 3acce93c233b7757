//! C-callable façade over [`hires_rt::Connection`].
//!
//! Every entry point is non-throwing: panics are caught at the boundary and
//! converted into a failure return, with a diagnostic stored in a per-thread
//! last-error slot the caller can read through [`hires_last_error`]. Handles
//! are opaque; a null handle is reported as an error, never dereferenced.
//!
//! The matching declarations live in `include/hires_rt.h`.

use std::cell::RefCell;
use std::ffi::{c_char, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::ptr;

use hires_common::layout::{LogEntry, SharedRingBuffer};
use hires_rt::{Connection, PopStatus, ProduceStatus};

/// Opaque connection handle exposed to C.
pub struct HiresConn {
    inner: Connection,
}

thread_local! {
    /// Last diagnostic for this thread; allocated on first failure, freed at
    /// thread exit.
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn clear_last_error() {
    LAST_ERROR.with(|slot| slot.borrow_mut().take());
}

fn set_last_error(message: String) {
    let c = CString::new(message)
        .unwrap_or_else(|_| CString::new("error message contained NUL").unwrap());
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(c));
}

/// Run `f` with panics converted to an error-return plus a stored message.
fn guarded<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            set_last_error("internal panic in hires runtime".to_string());
            fallback
        }
    }
}

unsafe fn conn_ref<'a>(handle: *mut HiresConn) -> Option<&'a HiresConn> {
    handle.as_ref()
}

/// Connect to the region owner. `socket_path` may be null for the default
/// path. Returns null on failure; consult [`hires_last_error`].
///
/// # Safety
///
/// `socket_path`, when non-null, must point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn hires_connect(socket_path: *const c_char) -> *mut HiresConn {
    clear_last_error();
    guarded(ptr::null_mut(), || {
        let path = if socket_path.is_null() {
            None
        } else {
            match CStr::from_ptr(socket_path).to_str() {
                Ok(s) => Some(Path::new(s).to_path_buf()),
                Err(_) => {
                    set_last_error("socket path is not valid UTF-8".to_string());
                    return ptr::null_mut();
                }
            }
        };
        match Connection::connect(path.as_deref()) {
            Ok(inner) => Box::into_raw(Box::new(HiresConn { inner })),
            Err(err) => {
                set_last_error(err.to_string());
                ptr::null_mut()
            }
        }
    })
}

/// Disconnect and free the handle. Null-safe and idempotent on null.
///
/// # Safety
///
/// `handle` must be null or a value returned by [`hires_connect`] that has
/// not been disconnected yet.
#[no_mangle]
pub unsafe extern "C" fn hires_disconnect(handle: *mut HiresConn) {
    clear_last_error();
    guarded((), || {
        if !handle.is_null() {
            drop(Box::from_raw(handle));
        }
    })
}

/// Log one event. Returns false on a drop or a bad handle.
///
/// # Safety
///
/// `handle` must be null or a live handle from [`hires_connect`].
#[no_mangle]
pub unsafe extern "C" fn hires_log(
    handle: *mut HiresConn,
    event_id: u32,
    data1: u64,
    data2: u64,
) -> bool {
    clear_last_error();
    guarded(false, || match conn_ref(handle) {
        Some(conn) => matches!(conn.inner.log(event_id, data1, data2), ProduceStatus::Logged),
        None => {
            set_last_error("null handle passed to hires_log".to_string());
            false
        }
    })
}

/// Pop one entry into `out_entry`. Returns false when the buffer is empty,
/// the next slot is not ready, or a pointer argument is bad.
///
/// # Safety
///
/// `handle` must be null or a live handle; `out_entry` must be null or
/// point to writable storage for one entry.
#[no_mangle]
pub unsafe extern "C" fn hires_pop(handle: *mut HiresConn, out_entry: *mut LogEntry) -> bool {
    clear_last_error();
    guarded(false, || {
        let conn = match conn_ref(handle) {
            Some(conn) => conn,
            None => {
                set_last_error("null handle passed to hires_pop".to_string());
                return false;
            }
        };
        if out_entry.is_null() {
            set_last_error("null entry pointer passed to hires_pop".to_string());
            return false;
        }
        match conn.inner.pop() {
            PopStatus::Entry(entry) => {
                out_entry.write(entry);
                true
            }
            PopStatus::Empty | PopStatus::NotReady => false,
        }
    })
}

/// Raw pointer to the mapped region, or null on a bad handle.
///
/// # Safety
///
/// `handle` must be null or a live handle. The returned pointer is valid
/// until [`hires_disconnect`].
#[no_mangle]
pub unsafe extern "C" fn hires_get_buffer(handle: *mut HiresConn) -> *mut SharedRingBuffer {
    clear_last_error();
    guarded(ptr::null_mut(), || match conn_ref(handle) {
        Some(conn) => conn.inner.buffer_ptr(),
        None => {
            set_last_error("null handle passed to hires_get_buffer".to_string());
            ptr::null_mut()
        }
    })
}

/// Mapped size in bytes, or 0 on a bad handle.
///
/// # Safety
///
/// `handle` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn hires_get_mapped_size(handle: *mut HiresConn) -> usize {
    clear_last_error();
    guarded(0, || match conn_ref(handle) {
        Some(conn) => conn.inner.mapped_size(),
        None => {
            set_last_error("null handle passed to hires_get_mapped_size".to_string());
            0
        }
    })
}

/// Ring capacity in entries, or 0 on a bad handle.
///
/// # Safety
///
/// `handle` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn hires_get_capacity(handle: *mut HiresConn) -> u64 {
    clear_last_error();
    guarded(0, || match conn_ref(handle) {
        Some(conn) => conn.inner.capacity(),
        None => {
            set_last_error("null handle passed to hires_get_capacity".to_string());
            0
        }
    })
}

/// Index mask (`capacity - 1`), or 0 on a bad handle.
///
/// # Safety
///
/// `handle` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn hires_get_idx_mask(handle: *mut HiresConn) -> u64 {
    clear_last_error();
    guarded(0, || match conn_ref(handle) {
        Some(conn) => conn.inner.idx_mask(),
        None => {
            set_last_error("null handle passed to hires_get_idx_mask".to_string());
            0
        }
    })
}

/// Calibrated cycles-per-microsecond. 0 means uncalibrated or bad handle.
///
/// # Safety
///
/// `handle` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn hires_get_cycles_per_us(handle: *mut HiresConn) -> u64 {
    clear_last_error();
    guarded(0, || match conn_ref(handle) {
        Some(conn) => conn.inner.cycles_per_us(),
        None => {
            set_last_error("null handle passed to hires_get_cycles_per_us".to_string());
            0
        }
    })
}

/// Last diagnostic recorded on this thread, or null if the most recent call
/// succeeded. The pointer is valid until the next façade call on the same
/// thread.
#[no_mangle]
pub extern "C" fn hires_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| match slot.borrow().as_ref() {
        Some(message) => message.as_ptr(),
        None => ptr::null(),
    })
}
