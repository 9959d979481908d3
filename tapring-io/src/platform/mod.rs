pub mod affinity;
pub mod topology;

/// Locks the process's current pages into physical RAM.
///
/// # Logic
/// Calls `mlockall(MCL_CURRENT)` so the structures built during bring-up
/// cannot be swapped out. A capture process that stalls on a major fault
/// drops packets; the stream windows additionally pin themselves when they
/// are mapped.
///
/// Only current memory is locked: `MCL_FUTURE` interacts badly with
/// `ulimit -l` on ordinary machines, and every allocation that matters
/// after startup locks itself explicitly.
pub fn lock_memory_pages() {
    let flags = libc::MCL_CURRENT;

    // SAFETY: FFI call to mlockall with valid flags.
    let ret = unsafe { libc::mlockall(flags) };

    if ret != 0 {
        let err = std::io::Error::last_os_error();
        log::warn!("Failed to lock memory pages (mlockall): {}.", err);
        log::warn!("Fix: raise 'ulimit -l' or grant CAP_IPC_LOCK.");
        log::warn!("Continuing unpinned; packet loss under memory pressure is possible.");
    }
}
