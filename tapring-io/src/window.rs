//! The double-mapped stream window.
//!
//! A record that logically wraps the top of the circular hole is made to
//! appear contiguous by mapping the same physical hole a second time,
//! directly behind the first mapping. The price is virtual address space,
//! which is the cheap resource here.

use std::ptr::NonNull;

use log::{debug, warn};

use crate::device::{page_size, DeviceError, StreamDevice};

/// One stream's mapped window: the hole at `[0, hole_size)` and the first
/// `extra` bytes of the same hole aliased again at
/// `[hole_size, hole_size + extra)`.
pub struct DualWindow {
    base: NonNull<u8>,
    hole_size: usize,
    extra: usize,
}

// SAFETY: the window is exclusively owned by one stream's state; the
// adapter writing into the mapping concurrently is the protocol itself and
// is confined to ranges the cursor discipline keeps disjoint from reads.
unsafe impl Send for DualWindow {}

impl DualWindow {
    /// Reserves `hole_size + extra` bytes of address space and asks the
    /// device to map the hole into it twice.
    ///
    /// `extra` must not exceed `hole_size` — the alias can only replay the
    /// hole from its start.
    pub fn map(
        device: &dyn StreamDevice,
        stream: usize,
        hole_size: usize,
        extra: usize,
    ) -> Result<Self, DeviceError> {
        assert!(extra <= hole_size, "alias window larger than the hole");
        if hole_size == 0 || hole_size % page_size() != 0 {
            return Err(DeviceError::BadHoleSize(hole_size));
        }

        let total = hole_size + extra;
        // SAFETY: plain anonymous reservation; PROT_NONE until the device
        // maps real pages over it.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(DeviceError::Os(std::io::Error::last_os_error()));
        }
        let base = NonNull::new(base as *mut u8)
            .ok_or_else(|| DeviceError::Os(std::io::Error::last_os_error()))?;

        let mut reservation = Reservation {
            base,
            len: total,
            armed: true,
        };

        device.map_hole(stream, base, hole_size)?;
        if extra > 0 {
            // SAFETY: base + hole_size stays inside the reservation.
            let alias = unsafe { NonNull::new_unchecked(base.as_ptr().add(hole_size)) };
            device.map_hole(stream, alias, extra)?;
        }

        // Pin the window; losing pages of a capture hole to swap means
        // losing packets. Degraded mode is allowed, silent degradation is
        // not.
        // SAFETY: locking the range just mapped.
        if unsafe { libc::mlock(base.as_ptr() as *const libc::c_void, total) } != 0 {
            warn!(
                "failed to pin {:#x}-byte stream window: {} (continuing unpinned)",
                total,
                std::io::Error::last_os_error()
            );
        }

        reservation.armed = false;
        debug!(
            "stream {} window mapped: hole {:#x} + alias {:#x}",
            stream, hole_size, extra
        );
        Ok(Self {
            base,
            hole_size,
            extra,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn hole_size(&self) -> usize {
        self.hole_size
    }

    pub fn extra(&self) -> usize {
        self.extra
    }

    /// Total mapped length, hole plus alias.
    pub fn len(&self) -> usize {
        self.hole_size + self.extra
    }

    pub fn is_empty(&self) -> bool {
        self.hole_size == 0
    }

    /// Borrows `[offset, offset + len)` of the window.
    ///
    /// Panics when the range leaves the mapping; cursor discipline above
    /// this layer guarantees in-window ranges, so a violation is a logic
    /// bug.
    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len()),
            "window range [{:#x}, +{:#x}) outside {:#x}-byte mapping",
            offset,
            len,
            self.len()
        );
        // SAFETY: range checked above; the mapping is readable for the
        // lifetime of self.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(offset), len) }
    }

    /// Mutably borrows `[offset, offset + len)` of the window.
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len()),
            "window range [{:#x}, +{:#x}) outside {:#x}-byte mapping",
            offset,
            len,
            self.len()
        );
        // SAFETY: range checked above; &mut self gives exclusive software
        // access, and the cursor discipline keeps the adapter out of it.
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(offset), len) }
    }

    /// Zeroes the primary hole (receive start wants a clean slate).
    pub fn zero_hole(&mut self) {
        // SAFETY: [0, hole_size) is mapped read-write.
        unsafe { std::ptr::write_bytes(self.base.as_ptr(), 0, self.hole_size) }
    }
}

impl Drop for DualWindow {
    fn drop(&mut self) {
        let total = self.len();
        // SAFETY: unmapping exactly the reservation created in map(); the
        // munlock is best effort.
        unsafe {
            libc::munlock(self.base.as_ptr() as *const libc::c_void, total);
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, total);
        }
    }
}

/// Unmaps a half-built window if mapping fails partway.
struct Reservation {
    base: NonNull<u8>,
    len: usize,
    armed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            // SAFETY: the reservation was mapped with exactly this range.
            unsafe {
                libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
            }
        }
    }
}
