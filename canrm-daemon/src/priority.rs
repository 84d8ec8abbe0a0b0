//! Elevates the calling thread to a real-time round-robin priority, the
//! hosted-process equivalent of the "elevated priority (30)" treatment the
//! ISR and broadcast-feeder threads need.

/// Requests `SCHED_RR` at the given priority (clamped into the scheduler's
/// supported range) for the calling thread. Lacking `CAP_SYS_NICE` is not
/// fatal: the thread keeps running at the default priority and a warning is
/// logged, since correctness does not depend on scheduling class.
pub fn elevate_current_thread(priority: i32) {
    unsafe {
        let min = libc::sched_get_priority_min(libc::SCHED_RR);
        let max = libc::sched_get_priority_max(libc::SCHED_RR);
        let clamped = priority.clamp(min, max);

        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = clamped;

        let rc = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_RR, &param);
        if rc != 0 {
            log::warn!(
                "failed to set SCHED_RR priority {clamped} on this thread (errno {rc}); \
                 continuing at the default scheduling priority"
            );
        }
    }
}
