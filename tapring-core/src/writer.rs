//! The transmit flow controller: space reservation and commit over the
//! same cursor protocol the reader uses, plus the copying convenience
//! path.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Instant;

use crate::capture::Capture;
use crate::cursor::{fold, free_space, safe_limit};
use crate::stream::{StreamState, StreamToken};
use crate::{Result, StreamError};

/// Outcome of waiting for transmit headroom.
enum WaitOutcome {
    Ready,
    /// The stream is a software reverse-mode peer and went (or already
    /// was) parked; blocking any longer would never end.
    PeerPaused,
}

impl Capture {
    /// Waits until `size` bytes of headroom exist and returns the
    /// contiguous writable span at the current write offset. The caller
    /// may fill any prefix of it, then make the bytes visible with
    /// [`Capture::commit`].
    pub fn reserve_space(&mut self, token: StreamToken, size: usize) -> Result<&mut [u8]> {
        let st = self.stream_mut(token)?;
        check_writable(st, size)?;
        if st.software_offset + size > st.window.len() {
            return Err(StreamError::InvalidArgument(
                "reservation exceeds the alias window",
            ));
        }
        match wait_free(st, size)? {
            WaitOutcome::Ready => {}
            WaitOutcome::PeerPaused => return Err(StreamError::OutOfMemory),
        }
        let offset = st.software_offset;
        Ok(st.window.slice_mut(offset, size))
    }

    /// Advances the write cursor over `size` reserved bytes and publishes
    /// the new limit. Space accounting happened at reservation; commit
    /// only moves the cursor. Returns the new write offset.
    pub fn commit(&mut self, token: StreamToken, size: usize) -> Result<usize> {
        let st = self.stream_mut(token)?;
        check_writable(st, size)?;
        let hole = st.ctl.hole_size;
        st.software_offset = fold(st.software_offset + size, hole);
        st.ctl
            .publish_limit_offset(safe_limit(st.software_offset, hole));
        st.processed += size as u64;
        Ok(st.software_offset)
    }

    /// Copies `data` into the stream, splitting at the hole boundary if
    /// the write wraps, and commits it. Returns the bytes written — which
    /// is also the return when a reverse-mode peer parks mid-wait: that
    /// early return is the back-off signal, not an error.
    pub fn copy_and_commit(&mut self, token: StreamToken, data: &[u8]) -> Result<usize> {
        let st = self.stream_mut(token)?;
        let size = data.len();
        check_writable(st, size)?;
        match wait_free(st, size)? {
            WaitOutcome::Ready => {}
            WaitOutcome::PeerPaused => return Ok(size),
        }
        let hole = st.ctl.hole_size;
        let offset = st.software_offset;
        // The copy path needs no alias: split at the hole top instead.
        let first = size.min(hole - offset);
        st.window.slice_mut(offset, first).copy_from_slice(&data[..first]);
        if first < size {
            st.window
                .slice_mut(0, size - first)
                .copy_from_slice(&data[first..]);
        }
        st.software_offset = fold(offset + size, hole);
        st.ctl
            .publish_limit_offset(safe_limit(st.software_offset, hole));
        st.processed += size as u64;
        Ok(size)
    }
}

fn check_writable(st: &StreamState, size: usize) -> Result<()> {
    if !st.started {
        return Err(StreamError::BadHandle);
    }
    if !st.ctl.is_producer() {
        return Err(StreamError::InvalidArgument("write on a receive stream"));
    }
    if size == 0 {
        return Err(StreamError::InvalidArgument("zero-byte write"));
    }
    if size > st.ctl.hole_size {
        return Err(StreamError::InvalidArgument("write exceeds the hole"));
    }
    Ok(())
}

/// Polls the peer's drain cursor until `size` bytes are free, respecting
/// the stream's poll configuration. On success the cached headroom has the
/// reservation already deducted.
fn wait_free(st: &mut StreamState, size: usize) -> Result<WaitOutcome> {
    let ctl = st.ctl.clone();
    let hole = ctl.hole_size;
    let deadline = (!st.poll.max_wait.is_zero()).then(|| Instant::now() + st.poll.max_wait);

    loop {
        if ctl.reverse && ctl.software_paused() {
            return Ok(WaitOutcome::PeerPaused);
        }
        let peer = st.peer_top();
        ctl.last_top
            .store(ctl.bus_base + peer as u64, Ordering::Release);
        let free = free_space(peer, st.software_offset, hole);
        if free >= size {
            st.free_space = free - size;
            return Ok(WaitOutcome::Ready);
        }
        if st.poll.min_data == 0 {
            return Err(StreamError::WouldBlock);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StreamError::TimedOut);
        }
        thread::sleep(st.poll.poll_interval);
    }
}
