//! Process lifecycle hooks.
//!
//! - **Exit**: one final leak check, registered with `atexit`. Under the
//!   `fail` policy a leaking process ends with `_exit(exitcode)`.
//! - **Fork**: the detector's locks are taken before `fork` and released on
//!   both sides, so the child never inherits a lock held by a thread that no
//!   longer exists. The child keeps only its own thread record.
//! - **Fatal signals**: a crashing process should not also report leaks;
//!   [`on_fatal_signal`] disarms the exit check.
//!
//! Every hook is idempotent and does nothing before [`crate::init`].

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

static AT_EXIT_INSTALLED: AtomicBool = AtomicBool::new(false);
static FORK_HOOKS_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Register the exit-time leak check. Returns whether this call installed it.
pub fn install_at_exit_check() -> bool {
    if AT_EXIT_INSTALLED.swap(true, Ordering::AcqRel) {
        return false;
    }
    // SAFETY: run_at_exit is a plain extern "C" function with no
    // preconditions.
    let rc = unsafe { libc::atexit(run_at_exit) };
    if rc != 0 {
        AT_EXIT_INSTALLED.store(false, Ordering::Release);
        return false;
    }
    debug!("installed exit-time leak check");
    true
}

extern "C" fn run_at_exit() {
    run_final_check();
}

/// Run the final check and apply the exit policy.
pub(crate) fn run_final_check() {
    let Some(detector) = crate::detector() else {
        return;
    };
    if let Some(code) = detector.do_final_leak_check().exit_code() {
        // SAFETY: terminating here is the configured policy. Later exit
        // handlers must not run and change the status.
        unsafe { libc::_exit(code) }
    }
}

/// Register the fork hooks.
#[cfg(unix)]
pub fn install_fork_hooks() -> Result<(), nix::errno::Errno> {
    if FORK_HOOKS_INSTALLED.swap(true, Ordering::AcqRel) {
        return Ok(());
    }
    // SAFETY: the three handlers are plain extern "C" functions.
    let rc = unsafe {
        libc::pthread_atfork(
            Some(before_fork as unsafe extern "C" fn()),
            Some(after_fork_parent as unsafe extern "C" fn()),
            Some(after_fork_child as unsafe extern "C" fn()),
        )
    };
    if rc != 0 {
        FORK_HOOKS_INSTALLED.store(false, Ordering::Release);
        return Err(nix::errno::Errno::from_raw(rc));
    }
    Ok(())
}

/// Register the fork hooks.
#[cfg(not(unix))]
pub fn install_fork_hooks() -> Result<(), nix::errno::Errno> {
    Ok(())
}

/// Take the detector's locks ahead of `fork`.
pub extern "C" fn before_fork() {
    if let Some(detector) = crate::detector() {
        detector.before_fork();
    }
}

/// Release the detector's locks in the parent after `fork`.
pub extern "C" fn after_fork_parent() {
    if let Some(detector) = crate::detector() {
        detector.after_fork_parent();
    }
}

/// Release the detector's locks in the child after `fork`.
pub extern "C" fn after_fork_child() {
    if let Some(detector) = crate::detector() {
        detector.after_fork_child();
    }
}

/// Disarm the exit-time check. Safe to call from a signal handler.
pub fn on_fatal_signal() {
    if let Some(detector) = crate::detector() {
        detector.disarm_final_check();
    }
}
