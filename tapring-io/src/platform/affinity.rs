use std::mem;

use log::{info, warn};

/// Pins the current thread to a specific CPU core.
///
/// # Logic
/// Uses `libc::sched_setaffinity` to restrict the scheduler to a single
/// bit in the CPU mask. The record consumer and the reverse-mode
/// synchronizer both live in tight poll-sleep loops; keeping each on one
/// core preserves cache locality of the hole pages they walk.
///
/// # Errors
/// Logs a warning and returns `false` if pinning fails (e.g. core index
/// out of bounds). The thread then runs floating; capture still works,
/// just with more jitter.
pub fn pin_thread_to_core(core_id: usize) -> bool {
    // SAFETY: zeroed cpu_set_t is a valid empty mask.
    let mut cpu_set: libc::cpu_set_t = unsafe { mem::zeroed() };

    // SAFETY: CPU_ZERO/CPU_SET write within the stack-allocated mask.
    unsafe {
        libc::CPU_ZERO(&mut cpu_set);
        libc::CPU_SET(core_id, &mut cpu_set);
    }

    // SAFETY:
    // - pid 0 refers to the current thread.
    // - cpu_set is stack-allocated and valid.
    // - sizeof(cpu_set_t) is correct for this libc.
    let ret = unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpu_set) };

    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!("Failed to pin thread to core {}: {} (running floating)", core_id, err);
        return false;
    }

    info!("Thread pinned to core {}", core_id);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_to_core_zero() {
        // Core 0 exists everywhere this runs.
        assert!(pin_thread_to_core(0));
    }
}
