//! The device/driver contract and its software implementation.
//!
//! The engine never talks to a driver directly; it consumes this narrow
//! trait: an advisory per-stream lock, a device-info query, a raw mapping
//! primitive over the hole region, and the register windows. `SimDevice`
//! implements the whole contract in process memory so that software peers,
//! the daemon and the test suite can run the full stream protocol without
//! an adapter in the machine.

use std::collections::HashSet;
use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use thiserror::Error;

use crate::pbm::{PbmGeneration, PbmView};
use crate::register::RegisterBlock;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("stream {0} is locked by another owner")]
    Locked(usize),
    #[error("no stream {0} on this device")]
    NoSuchStream(usize),
    #[error("operation not supported by this device")]
    Unsupported,
    #[error("hole size {0:#x} is not a whole number of pages")]
    BadHoleSize(usize),
    #[error("device I/O failure: {0}")]
    Os(#[from] std::io::Error),
}

/// Snapshot of the device-global configuration. Re-queried at attach time
/// because a firmware reload can change every field.
#[derive(Clone, Copy, Debug)]
pub struct DeviceInfo {
    /// Burst-manager generation code as the driver reports it.
    pub firmware_generation: u32,
    pub stream_count: usize,
    /// Default hole size, also the upper bound a PBM-declared size is
    /// clamped to.
    pub hole_size: usize,
    /// Physical base of the hole region.
    pub phys_base: u64,
    pub has_pbm: bool,
    pub has_processor: bool,
}

/// The contract the stream engine consumes from the driver layer.
///
/// The advisory lock is keyed by `(stream, direction)`: a normal attach
/// and a reverse attach of the same stream are two different owners by
/// design, since that pairing is exactly how two software stacks share a
/// hole.
pub trait StreamDevice: Send + Sync {
    /// Re-reads the device-global configuration.
    fn refresh_info(&self) -> Result<DeviceInfo, DeviceError>;

    /// Takes the system-wide advisory lock for one stream direction.
    fn lock_stream(&self, stream: usize, reverse: bool) -> Result<(), DeviceError>;

    /// Releases a lock previously taken with `lock_stream`.
    fn unlock_stream(&self, stream: usize, reverse: bool);

    /// Maps the first `len` bytes of `stream`'s hole at the fixed address
    /// `at`, which must lie inside an address range the caller reserved.
    fn map_hole(&self, stream: usize, at: NonNull<u8>, len: usize) -> Result<(), DeviceError>;

    /// The burst-manager register window, if this firmware carries one.
    fn pbm_window(&self) -> Option<RegisterBlock>;

    /// The embedded-processor register window, if present.
    fn processor_window(&self) -> Option<RegisterBlock>;

    /// Per-stream physical hole base for generations that address above
    /// the 32-bit register fields.
    fn phys_addr_64(&self, stream: usize) -> Option<u64>;
}

/// Advisory-lock token as it appears on the driver wire: the stream index
/// with the sign bit standing in for the reverse flag. Unlock historically
/// passes the cleared-sign shape; the ledger here keys on the full token so
/// a normal/reverse pair can coexist.
fn lock_token(stream: usize, reverse: bool) -> i32 {
    let token = stream as i32;
    if reverse {
        token | i32::MIN
    } else {
        token
    }
}

const COPRO_WINDOW_LEN: usize = 0x40;

/// Simulated bus address of the first hole. Non-zero so that cursor values
/// look like the bus addresses real firmware programs.
const SIM_PHYS_BASE: u64 = 0x4000_0000;

/// An all-software stream device.
///
/// Holes are memfd-backed so the double mapping in `DualWindow` is a true
/// remap of the same pages; registers are a shared anonymous page driven
/// through the same `RegisterBlock` accessor the hardware path uses. One
/// `Arc<SimDevice>` shared between two sessions is a complete
/// software-to-software wiring.
pub struct SimDevice {
    info: DeviceInfo,
    holes: Vec<OwnedFd>,
    regs_base: NonNull<u8>,
    regs_map_len: usize,
    pbm_len: usize,
    locks: Mutex<HashSet<i32>>,
}

// SAFETY: the register mapping is shared memory accessed only through
// volatile word operations; the hole fds and the lock ledger are
// internally synchronized.
unsafe impl Send for SimDevice {}
unsafe impl Sync for SimDevice {}

impl SimDevice {
    /// Creates a software device with `stream_count` holes of `hole_size`
    /// bytes each, with the PBM registers programmed the way loaded
    /// firmware leaves them.
    pub fn new(
        generation: PbmGeneration,
        stream_count: usize,
        hole_size: usize,
    ) -> Result<Arc<Self>, DeviceError> {
        let dev = Self::build(generation, stream_count, hole_size, true, false)?;
        Ok(Arc::new(dev))
    }

    /// Like [`SimDevice::new`], but leaves every stream's registers at the
    /// all-zeros unconfigured sentinel, the state a reloaded firmware
    /// presents before anyone attaches.
    pub fn new_unconfigured(
        generation: PbmGeneration,
        stream_count: usize,
        hole_size: usize,
    ) -> Result<Arc<Self>, DeviceError> {
        let dev = Self::build(generation, stream_count, hole_size, false, false)?;
        Ok(Arc::new(dev))
    }

    /// A device with no burst manager: an embedded processor drives the
    /// hole and only the doorbell window exists.
    pub fn processor_driven(
        stream_count: usize,
        hole_size: usize,
    ) -> Result<Arc<Self>, DeviceError> {
        let dev = Self::build(PbmGeneration::Gen0, stream_count, hole_size, false, true)?;
        Ok(Arc::new(dev))
    }

    fn build(
        generation: PbmGeneration,
        stream_count: usize,
        hole_size: usize,
        program_pbm: bool,
        processor: bool,
    ) -> Result<Self, DeviceError> {
        let page = page_size();
        if hole_size == 0 || hole_size % page != 0 {
            return Err(DeviceError::BadHoleSize(hole_size));
        }
        if stream_count == 0 {
            return Err(DeviceError::NoSuchStream(0));
        }

        let mut holes = Vec::with_capacity(stream_count);
        for i in 0..stream_count {
            holes.push(create_hole(i, hole_size)?);
        }

        // One shared page set for the whole register space: the PBM window
        // first, the processor doorbell behind it.
        let pbm_len = 0x40 + stream_count * 0x60;
        let regs_map_len = (pbm_len + COPRO_WINDOW_LEN + page - 1) & !(page - 1);
        // SAFETY: anonymous shared mapping, length checked non-zero.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                regs_map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(DeviceError::Os(std::io::Error::last_os_error()));
        }
        let regs_base = NonNull::new(base as *mut u8)
            .ok_or_else(|| DeviceError::Os(std::io::Error::last_os_error()))?;

        let info = DeviceInfo {
            firmware_generation: generation as u32,
            stream_count,
            hole_size,
            phys_base: SIM_PHYS_BASE,
            has_pbm: !processor,
            has_processor: processor,
        };

        let dev = Self {
            info,
            holes,
            regs_base,
            regs_map_len,
            pbm_len,
            locks: Mutex::new(HashSet::new()),
        };

        if program_pbm {
            let regs = dev.pbm_window().expect("PBM window exists by construction");
            for s in 0..stream_count {
                let view = PbmView::bind(generation, regs, s, false)?;
                view.set_mem_addr(dev.stream_phys_base(s) as u32);
                view.set_mem_size(hole_size as u32);
            }
        }

        info!(
            "SimDevice up: generation {}, {} stream(s), {:#x}-byte holes{}",
            info.firmware_generation,
            stream_count,
            hole_size,
            if processor { " (processor-driven)" } else { "" }
        );
        Ok(dev)
    }

    fn stream_phys_base(&self, stream: usize) -> u64 {
        SIM_PHYS_BASE + (stream * self.info.hole_size) as u64
    }
}

impl StreamDevice for SimDevice {
    fn refresh_info(&self) -> Result<DeviceInfo, DeviceError> {
        Ok(self.info)
    }

    fn lock_stream(&self, stream: usize, reverse: bool) -> Result<(), DeviceError> {
        if stream >= self.info.stream_count {
            return Err(DeviceError::NoSuchStream(stream));
        }
        let token = lock_token(stream, reverse);
        let mut locks = self.locks.lock().expect("lock ledger poisoned");
        if !locks.insert(token) {
            warn!("stream {} ({}) already locked", stream, direction_name(reverse));
            return Err(DeviceError::Locked(stream));
        }
        debug!(
            "locked stream {} ({}), token {:#010x}",
            stream,
            direction_name(reverse),
            token as u32
        );
        Ok(())
    }

    fn unlock_stream(&self, stream: usize, reverse: bool) {
        let token = lock_token(stream, reverse);
        let mut locks = self.locks.lock().expect("lock ledger poisoned");
        if !locks.remove(&token) {
            warn!("unlock of stream {} ({}) which was not held", stream, direction_name(reverse));
        }
    }

    fn map_hole(&self, stream: usize, at: NonNull<u8>, len: usize) -> Result<(), DeviceError> {
        let fd = self
            .holes
            .get(stream)
            .ok_or(DeviceError::NoSuchStream(stream))?;
        if len == 0 || len > self.info.hole_size {
            return Err(DeviceError::Os(std::io::Error::from(
                std::io::ErrorKind::InvalidInput,
            )));
        }
        // SAFETY: the caller guarantees `at` lies inside an address range
        // it reserved; MAP_FIXED replaces exactly [at, at + len).
        let mapped = unsafe {
            libc::mmap(
                at.as_ptr() as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd.as_raw_fd(),
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(DeviceError::Os(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn pbm_window(&self) -> Option<RegisterBlock> {
        if !self.info.has_pbm {
            return None;
        }
        // SAFETY: the mapping covers pbm_len bytes and lives as long as
        // the device.
        Some(unsafe { RegisterBlock::new(self.regs_base, self.pbm_len) })
    }

    fn processor_window(&self) -> Option<RegisterBlock> {
        if !self.info.has_processor {
            return None;
        }
        // SAFETY: the doorbell sits directly behind the PBM window inside
        // the same mapping.
        let full = unsafe { RegisterBlock::new(self.regs_base, self.pbm_len + COPRO_WINDOW_LEN) };
        Some(full.subblock(self.pbm_len, COPRO_WINDOW_LEN))
    }

    fn phys_addr_64(&self, stream: usize) -> Option<u64> {
        if stream >= self.info.stream_count {
            return None;
        }
        Some(self.stream_phys_base(stream))
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        // SAFETY: unmapping the register mapping created in build(); the
        // hole fds close themselves.
        unsafe {
            libc::munmap(self.regs_base.as_ptr() as *mut libc::c_void, self.regs_map_len);
        }
    }
}

fn direction_name(reverse: bool) -> &'static str {
    if reverse {
        "reverse"
    } else {
        "normal"
    }
}

/// The system page size; hole sizes and window reservations are always
/// whole pages.
pub fn page_size() -> usize {
    // SAFETY: plain sysconf query.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        4096
    } else {
        page as usize
    }
}

fn create_hole(stream: usize, hole_size: usize) -> Result<OwnedFd, DeviceError> {
    let name = CString::new(format!("tapring-hole-{stream}")).expect("hole name has no NUL");
    // SAFETY: memfd_create with a valid C string and flag set.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(DeviceError::Os(std::io::Error::last_os_error()));
    }
    // SAFETY: fd was just returned by memfd_create and is owned here.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    // SAFETY: ftruncate on an owned, freshly created fd.
    if unsafe { libc::ftruncate(fd.as_raw_fd(), hole_size as libc::off_t) } != 0 {
        return Err(DeviceError::Os(std::io::Error::last_os_error()));
    }
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_per_direction() {
        let dev = SimDevice::new(PbmGeneration::Gen3, 2, page_size()).unwrap();

        dev.lock_stream(0, false).unwrap();
        assert!(matches!(dev.lock_stream(0, false), Err(DeviceError::Locked(0))));

        // The reverse direction is a distinct owner: that pairing is how
        // two software stacks share one hole.
        dev.lock_stream(0, true).unwrap();

        dev.unlock_stream(0, false);
        dev.lock_stream(0, false).unwrap();
    }

    #[test]
    fn registers_are_programmed_at_build() {
        let hole = page_size() * 4;
        let dev = SimDevice::new(PbmGeneration::Gen1, 2, hole).unwrap();
        let regs = dev.pbm_window().unwrap();

        let v0 = PbmView::bind(PbmGeneration::Gen1, regs, 0, false).unwrap();
        let v1 = PbmView::bind(PbmGeneration::Gen1, regs, 1, false).unwrap();
        assert!(!v0.unconfigured());
        assert_eq!(v0.mem_size() as usize, hole);
        assert_eq!(v1.mem_addr() as u64, SIM_PHYS_BASE + hole as u64);
    }

    #[test]
    fn unconfigured_device_reads_sentinel() {
        let dev = SimDevice::new_unconfigured(PbmGeneration::Gen0, 1, page_size()).unwrap();
        let regs = dev.pbm_window().unwrap();
        let view = PbmView::bind(PbmGeneration::Gen0, regs, 0, false).unwrap();
        assert!(view.unconfigured());
    }

    #[test]
    fn processor_device_has_no_pbm() {
        let dev = SimDevice::processor_driven(1, page_size()).unwrap();
        assert!(dev.pbm_window().is_none());
        let copro = dev.processor_window().unwrap();
        assert_eq!(copro.len(), COPRO_WINDOW_LEN);
    }

    #[test]
    fn rejects_unaligned_hole() {
        assert!(matches!(
            SimDevice::new(PbmGeneration::Gen2, 1, 1024),
            Err(DeviceError::BadHoleSize(1024))
        ));
    }
}
