//! Signal-driven shutdown flag: the hosted equivalent of the original
//! resource manager's `SigTermHandler`, minus the parts (`resmgr_context_free`,
//! `ControllerFactory::DeleteController`) that belonged to the QNX dispatch
//! loop this binary doesn't have.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signo: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs `handle_signal` for the signals the original handler caught
/// that have a meaningful, safely-handleable userspace analogue: `SIGTERM`
/// and `SIGINT`. `SIGSEGV`/`SIGBUS`/`SIGILL`/`SIGFPE`/`SIGKILL` are left at
/// their default dispositions — `SIGKILL` cannot be caught at all, and
/// catching the others to run non-async-signal-safe cleanup (as the
/// original handler did) is itself undefined behavior.
pub fn install() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_signal as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;

        libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
    }
}

pub fn requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
