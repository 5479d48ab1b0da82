//! # FFI Exports
//!
//! C entry points for programs that link the runtime as a static library.
//! They mirror the programmatic API:
//!
//! ```c
//! void __leakwatch_do_leak_check(void);
//! int  __leakwatch_do_recoverable_leak_check(void);
//! int  __leakwatch_ignore_object(const void *p);
//! int  __leakwatch_register_root_region(const void *p, size_t size);
//! int  __leakwatch_unregister_root_region(const void *p, size_t size);
//! void __leakwatch_disable(void);
//! int  __leakwatch_enable(void);
//! ```
//!
//! Functions returning `int` use 0 for success and -1 for failure.

use std::ffi::{c_int, c_void};

use crate::hooks;

/// Run the final leak check now, exiting under the `fail` policy if leaks
/// are found. Later calls, including the exit-time check, do nothing.
#[no_mangle]
pub extern "C" fn __leakwatch_do_leak_check() {
    crate::lifecycle::run_final_check();
}

/// Run a leak check. Returns 1 if unsuppressed leaks were found, else 0.
#[no_mangle]
pub extern "C" fn __leakwatch_do_recoverable_leak_check() -> c_int {
    match crate::detector() {
        Some(detector) => detector.do_leak_check() as c_int,
        None => 0,
    }
}

/// Exempt the heap object containing `p` from leak reports.
#[no_mangle]
pub extern "C" fn __leakwatch_ignore_object(p: *const c_void) -> c_int {
    match crate::detector() {
        Some(detector) => status(detector.ignore_object(p as usize).is_ok()),
        None => -1,
    }
}

/// Treat `[p, p + size)` as a root.
#[no_mangle]
pub extern "C" fn __leakwatch_register_root_region(p: *const c_void, size: usize) -> c_int {
    match crate::detector() {
        Some(detector) => status(detector.register_root_region(p as usize, size).is_ok()),
        None => -1,
    }
}

/// Undo one `__leakwatch_register_root_region` with the same arguments.
#[no_mangle]
pub extern "C" fn __leakwatch_unregister_root_region(p: *const c_void, size: usize) -> c_int {
    match crate::detector() {
        Some(detector) => status(detector.unregister_root_region(p as usize, size).is_ok()),
        None => -1,
    }
}

/// Exempt allocations made by the calling thread until the matching
/// `__leakwatch_enable`.
#[no_mangle]
pub extern "C" fn __leakwatch_disable() {
    hooks::disable();
}

/// Undo one `__leakwatch_disable`. Fails when there is nothing to undo.
#[no_mangle]
pub extern "C" fn __leakwatch_enable() -> c_int {
    status(hooks::enable().is_ok())
}

fn status(ok: bool) -> c_int {
    if ok {
        0
    } else {
        -1
    }
}
