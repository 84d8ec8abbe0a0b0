//! Background-process setup: the classic double-fork daemonization the
//! original resource manager got for free from `procmgr_daemon`.

use std::io;

/// Forks into the background, detaches from the controlling terminal, and
/// returns in the grandchild process. The parent and the intermediate child
/// both exit. Standard streams are left attached (`PROCMGR_DAEMON_NOCLOSE`'s
/// hosted equivalent): the daemon logs through `env_logger`, which already
/// writes to stderr, so closing the descriptors would just lose log output.
pub fn daemonize() -> io::Result<()> {
    first_fork()?;
    // SAFETY: single-threaded at this point (called before any worker
    // thread is spawned); no other thread can observe the fork mid-flight.
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }
    second_fork()?;
    Ok(())
}

fn first_fork() -> io::Result<()> {
    // SAFETY: `fork` is async-signal-safe and the process is still
    // single-threaded; the parent exits immediately without touching any
    // shared state the child may be concurrently mutating.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(()),
        _child => std::process::exit(0),
    }
}

fn second_fork() -> io::Result<()> {
    // SAFETY: same reasoning as `first_fork`; this second fork prevents the
    // daemon from ever reacquiring a controlling terminal.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(()),
        _child => std::process::exit(0),
    }
}
