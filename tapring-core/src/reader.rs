//! The record reader: cursor publication, availability polling, and
//! zero-copy record iteration.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Instant;

use tapring_erf::{Record, RecordHeader, RECORD_HEADER_SIZE};

use crate::capture::Capture;
use crate::cursor::{available, fold, peer_offset32, safe_limit, SAFETY_WINDOW};
use crate::stream::{StreamState, StreamToken};
use crate::{Result, StreamError};

impl Capture {
    /// Publishes the caller's consumed position and returns the window
    /// offset one past the currently available data.
    ///
    /// `bottom` is the last consumed position as a window offset; `None`
    /// means the buffer base on a first call, or — on a reverse stream
    /// rejoining mid-flight — a position reconstructed from the last
    /// published limit. A returned top greater than the hole size means
    /// the available span wraps and is readable contiguously through the
    /// alias; it never extends more than the alias length past the hole.
    ///
    /// Blocking follows the stream's poll configuration, and a timeout is
    /// not an error here: the call returns whatever is available, possibly
    /// nothing.
    pub fn advance(&mut self, token: StreamToken, bottom: Option<usize>) -> Result<usize> {
        let st = self.stream_mut(token)?;
        if !st.started {
            return Err(StreamError::BadHandle);
        }
        if st.ctl.is_producer() {
            return Err(StreamError::InvalidArgument("advance on a transmit stream"));
        }
        let bottom = resolve_bottom(st, bottom);
        let required = st.poll.min_data;
        let top = poll_top(st, bottom, required, true, true)?;
        st.first_access = false;
        Ok(unfold_top(st, bottom, top))
    }

    /// Returns the next record in the stream, zero-copy.
    ///
    /// The iterator is self-tracking: it consults the peer only when its
    /// cached availability cannot cover a header or the full record. A
    /// type byte outside the valid range or a length shorter than the
    /// header is framing corruption; the error is returned without
    /// advancing, and the session should be considered dead.
    pub fn next_record(&mut self, token: StreamToken) -> Result<Record<'_>> {
        let st = self.stream_mut(token)?;
        next_record_inner(st, true)
    }

    /// Forwarding variant of [`Capture::next_record`]: before checking
    /// availability, re-bounds the receive hole by the paired transmit
    /// stream's drain cursor, so the receive side never buffers more
    /// unread data than the transmit side has room to resend.
    pub fn next_record_forward(
        &mut self,
        rx_token: StreamToken,
        tx_token: StreamToken,
    ) -> Result<Record<'_>> {
        let (drained, tx_hole) = {
            let tx = self.stream_ref(tx_token)?;
            let tx_ctl = &*tx.ctl;
            if !tx_ctl.is_producer() {
                return Err(StreamError::InvalidArgument(
                    "forwarding pair needs a transmit stream",
                ));
            }
            let view = tx_ctl.view.as_ref().ok_or(StreamError::NoSuchDevice)?;
            let drained = peer_offset32(view.peer_cursor(), tx_ctl.bus_base as u32, tx_ctl.hole_size);
            // The pair's observations move together, transmit top first;
            // the foreground is the only writer of either field.
            tx_ctl
                .last_top
                .store(tx_ctl.bus_base + drained as u64, Ordering::Release);
            (drained, tx_ctl.hole_size)
        };

        let st = self.stream_mut(rx_token)?;
        if st.ctl.is_producer() {
            return Err(StreamError::InvalidArgument(
                "forwarding pair needs a receive stream",
            ));
        }
        if st.ctl.hole_size != tx_hole {
            return Err(StreamError::InvalidArgument("forwarding pair holes differ"));
        }
        st.ctl.publish_limit_offset(safe_limit(drained, tx_hole));
        st.ctl
            .last_bottom
            .store(st.ctl.bus_base + drained as u64, Ordering::Release);
        next_record_inner(st, false)
    }
}

fn next_record_inner(st: &mut StreamState, publish: bool) -> Result<Record<'_>> {
    if !st.started {
        return Err(StreamError::BadHandle);
    }
    if st.ctl.is_producer() {
        return Err(StreamError::InvalidArgument("record read on a transmit stream"));
    }
    let hole = st.ctl.hole_size;

    if st.first_access {
        st.software_offset = resolve_bottom(st, None);
        st.free_space = 0;
        st.first_access = false;
    }

    if st.free_space < RECORD_HEADER_SIZE {
        refill(st, RECORD_HEADER_SIZE, publish)?;
    }

    let header = RecordHeader::parse_checked(st.window.slice(st.software_offset, RECORD_HEADER_SIZE))?;
    let rlen = header.rlen as usize;
    if rlen > st.free_space {
        refill(st, rlen, publish)?;
    }

    let offset = st.software_offset;
    st.software_offset = fold(offset + rlen, hole);
    st.free_space -= rlen;
    st.processed += rlen as u64;
    Ok(Record::parse(st.window.slice(offset, rlen))?)
}

/// Brings the cached availability up to at least `needed` bytes, bounded
/// by the stream's poll configuration.
fn refill(st: &mut StreamState, needed: usize, publish: bool) -> Result<()> {
    let bottom = st.software_offset;
    let required = needed.max(st.poll.min_data);
    let top = poll_top(st, bottom, required, false, publish)?;
    let avail = available(top, bottom, st.ctl.hole_size);
    // Only the span the alias keeps contiguous is usable from here.
    let contiguous = st.window.len() - bottom;
    if avail.min(contiguous) < needed {
        return Err(StreamError::InvalidArgument(
            "alias window too small for this record",
        ));
    }
    st.free_space = avail.min(contiguous);
    Ok(())
}

/// Resolves a caller-supplied bottom cursor into the primary window.
fn resolve_bottom(st: &StreamState, bottom: Option<usize>) -> usize {
    let hole = st.ctl.hole_size;
    if let Some(b) = bottom {
        return fold(b, hole);
    }
    if st.ctl.reverse {
        if let Some(view) = st.ctl.view.as_ref() {
            let published = view.published_limit();
            if published != 0 {
                // Rejoining mid-stream: the published limit is the
                // consumed position minus the safety window; undo it,
                // wrapping at most once back into the hole. Whether one
                // wrap is the right tolerance for a peer that lapped
                // further is a long-standing ambiguity between the empty
                // and full readings; the historical behavior is kept.
                let raw = peer_offset32(published, st.ctl.bus_base as u32, hole);
                let mut b = raw + SAFETY_WINDOW;
                if b >= hole {
                    b -= hole;
                }
                return b;
            }
        }
    }
    0
}

/// The availability poll shared by `advance` and the record iterator.
///
/// Publishes the limit for `bottom` (unless the caller already coupled it
/// to another cursor), then waits until the peer's cursor yields at least
/// `required` bytes. With `allow_partial` the deadline returns whatever is
/// there; without it the caller gets `TimedOut`, or `WouldBlock` in
/// non-blocking mode.
fn poll_top(
    st: &mut StreamState,
    bottom: usize,
    required: usize,
    allow_partial: bool,
    publish: bool,
) -> Result<usize> {
    let ctl = st.ctl.clone();
    let hole = ctl.hole_size;
    debug_assert!(bottom < hole);

    if publish {
        // Publish before waiting: the producer may be stalled against the
        // old limit.
        ctl.publish_limit_offset(safe_limit(bottom, hole));
    }
    ctl.last_bottom
        .store(ctl.bus_base + bottom as u64, Ordering::Release);

    let non_blocking = st.poll.min_data == 0;
    let deadline = (!st.poll.max_wait.is_zero()).then(|| Instant::now() + st.poll.max_wait);
    let mut last_safetynet = ctl.view.as_ref().map(|v| v.safetynet_count());

    loop {
        let top = st.peer_top();
        ctl.last_top
            .store(ctl.bus_base + top as u64, Ordering::Release);
        if available(top, bottom, hole) >= required {
            return Ok(top);
        }
        if non_blocking {
            return if allow_partial {
                Ok(top)
            } else {
                Err(StreamError::WouldBlock)
            };
        }
        // Bytes can sit in a partially filled burst the manager has not
        // flushed; when the byte accounting moves while nothing shows up,
        // kick the timeout.
        if let Some(view) = ctl.view.as_ref() {
            let counter = view.safetynet_count();
            if available(top, bottom, hole) == 0 && Some(counter) != last_safetynet {
                view.kick_burst_timeout();
            }
            last_safetynet = Some(counter);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return if allow_partial {
                Ok(top)
            } else {
                Err(StreamError::TimedOut)
            };
        }
        thread::sleep(st.poll.poll_interval);
    }
}

/// Un-folds `top` past the hole end when the span wraps, clamped so the
/// result never leaves the alias.
fn unfold_top(st: &StreamState, bottom: usize, top: usize) -> usize {
    let hole = st.ctl.hole_size;
    let top = if top < bottom { top + hole } else { top };
    top.min(hole + st.window.extra())
}
