//! Per-stream state: the shared control block the synchronizer sees, the
//! private bookkeeping the owning session keeps, and the poll/timeout
//! configuration knobs.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_utils::CachePadded;
use tapring_io::{CoproView, DualWindow, PbmView};

use crate::cursor::{peer_offset32, processor_offset};

/// Blocking behavior of the read and reserve paths.
///
/// `min_data == 0` means never block: return immediately with whatever is
/// available. `max_wait` of zero means block forever.
#[derive(Clone, Copy, Debug)]
pub struct PollConfig {
    /// Minimum bytes a blocking call waits for before returning.
    pub min_data: usize,
    /// Wall-clock bound on one blocking call; zero blocks forever.
    pub max_wait: Duration,
    /// Sleep granularity inside the retry loop.
    pub poll_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_data: 16,
            max_wait: Duration::ZERO,
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// Opaque handle to an attached stream, returned by attach and required by
/// every subsequent call on it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StreamToken(pub(crate) u64);

/// Reverse-mode lifecycle, driven from two sides: `stop` moves
/// Running → PauseRequested → Idle, the synchronizer moves
/// PauseRequested → Resyncing → Running. The Resyncing claim is the only
/// mutual exclusion between the two; neither side ever holds a lock across
/// a sleep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SyncState {
    Idle = 0,
    PauseRequested = 1,
    Resyncing = 2,
    Running = 3,
}

impl SyncState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::PauseRequested,
            2 => Self::Resyncing,
            3 => Self::Running,
            _ => Self::Idle,
        }
    }
}

/// The slice of stream state shared between the owning session and the
/// reverse-mode synchronizer. Everything else about a stream is private to
/// the session that attached it.
pub(crate) struct StreamCtl {
    pub index: usize,
    pub reverse: bool,
    /// Bus address the adapter uses for the bottom of this hole.
    pub bus_base: u64,
    pub hole_size: usize,
    pub view: Option<PbmView>,
    state: AtomicU8,
    /// Last observed consumer-side cursor, bus space. Stall detection and
    /// diagnostics only.
    pub last_bottom: AtomicU64,
    /// Last observed producer-side cursor, bus space.
    pub last_top: AtomicU64,
}

impl StreamCtl {
    pub fn new(
        index: usize,
        reverse: bool,
        bus_base: u64,
        hole_size: usize,
        view: Option<PbmView>,
    ) -> Self {
        Self {
            index,
            reverse,
            bus_base,
            hole_size,
            view,
            state: AtomicU8::new(SyncState::Idle as u8),
            last_bottom: AtomicU64::new(0),
            last_top: AtomicU64::new(0),
        }
    }

    /// Whether this side produces data into the hole. Stream parity gives
    /// the hardware direction (even receive, odd transmit); reverse mode
    /// swaps the software role.
    pub fn is_producer(&self) -> bool {
        (self.index % 2 == 1) != self.reverse
    }

    pub fn sync_state(&self) -> SyncState {
        SyncState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_sync_state(&self, s: SyncState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// PauseRequested → Resyncing; the synchronizer's claim on the stream.
    pub fn try_claim_resync(&self) -> bool {
        self.state
            .compare_exchange(
                SyncState::PauseRequested as u8,
                SyncState::Resyncing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Resyncing → Running; releases the claim.
    pub fn finish_resync(&self) {
        self.state
            .store(SyncState::Running as u8, Ordering::Release);
    }

    /// Running → PauseRequested (no-op from any other state).
    pub fn request_pause(&self) {
        let _ = self.state.compare_exchange(
            SyncState::Running as u8,
            SyncState::PauseRequested as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// A reverse stream counts as paused until the synchronizer has run it
    /// up; normal streams answer from the hardware pause bit.
    pub fn software_paused(&self) -> bool {
        if self.reverse {
            self.sync_state() != SyncState::Running
        } else {
            self.view.as_ref().map(|v| v.paused()).unwrap_or(false)
        }
    }

    /// Publishes this side's cursor at `offset` bytes into the hole.
    pub fn publish_limit_offset(&self, offset: usize) {
        debug_assert!(offset < self.hole_size);
        if let Some(view) = self.view.as_ref() {
            view.publish_limit((self.bus_base + offset as u64) as u32);
        }
    }
}

/// Everything the owning session tracks for one attached stream.
pub(crate) struct StreamState {
    pub ctl: Arc<CachePadded<StreamCtl>>,
    pub window: DualWindow,
    pub copro: Option<CoproView>,
    pub poll: PollConfig,
    /// Next hole offset this side reads or writes, always `< hole_size`.
    pub software_offset: usize,
    /// Cached bytes known available (reader) or reserved headroom
    /// (writer); lazily recomputed.
    pub free_space: usize,
    /// Total bytes consumed or committed since start.
    pub processed: u64,
    pub started: bool,
    pub first_access: bool,
}

impl StreamState {
    /// Where the peer's cursor currently points, as a hole offset.
    pub fn peer_top(&self) -> usize {
        let ctl = &*self.ctl;
        if let Some(view) = ctl.view.as_ref() {
            peer_offset32(view.peer_cursor(), ctl.bus_base as u32, ctl.hole_size)
        } else if let Some(copro) = self.copro.as_ref() {
            processor_offset(copro.here(), ctl.bus_base, ctl.hole_size)
        } else {
            0
        }
    }
}

/// Observable snapshot of one stream, for diagnostics and callers that
/// want to watch progress without touching the data path.
#[derive(Clone, Copy, Debug)]
pub struct StreamStats {
    pub stream_index: usize,
    pub reverse: bool,
    pub started: bool,
    pub paused: bool,
    pub software_offset: usize,
    pub free_space: usize,
    pub processed: u64,
    pub hole_size: usize,
    pub drop_count: u32,
    /// Last observed cursors, bus-address space.
    pub last_bottom: u64,
    pub last_top: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_role_follows_parity_and_reverse() {
        let rx = StreamCtl::new(0, false, 0, 4096, None);
        let tx = StreamCtl::new(1, false, 0, 4096, None);
        let rx_rev = StreamCtl::new(0, true, 0, 4096, None);
        let tx_rev = StreamCtl::new(1, true, 0, 4096, None);

        assert!(!rx.is_producer());
        assert!(tx.is_producer());
        // The reverse side plays the hardware role: it produces into a
        // receive hole and drains a transmit hole.
        assert!(rx_rev.is_producer());
        assert!(!tx_rev.is_producer());
    }

    #[test]
    fn resync_claim_is_exclusive() {
        let ctl = StreamCtl::new(0, true, 0, 4096, None);
        ctl.set_sync_state(SyncState::PauseRequested);

        assert!(ctl.try_claim_resync());
        assert!(!ctl.try_claim_resync());
        assert_eq!(ctl.sync_state(), SyncState::Resyncing);

        ctl.finish_resync();
        assert_eq!(ctl.sync_state(), SyncState::Running);
        assert!(!ctl.software_paused());

        ctl.request_pause();
        assert_eq!(ctl.sync_state(), SyncState::PauseRequested);
        assert!(ctl.software_paused());
    }
}
