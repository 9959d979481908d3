//! The reverse-mode synchronizer.
//!
//! One background task per session walks every registered reverse stream
//! at a fixed cadence and plays the hardware side of the synchronization
//! handshake: when a peer has raised the sync request against a parked
//! stream, the task initializes the cursor relationship for the stream's
//! role, clears the pause, and acknowledges the request.
//!
//! The task and the foreground calls share only the per-stream control
//! block. The Resyncing claim is the whole mutual-exclusion story: a
//! concurrent `stop` waits for the claim to clear instead of racing the
//! pass, and nothing on either side holds a lock across a sleep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use log::{debug, info, warn};

use crate::cursor::{peer_offset32, safe_limit, SAFETY_WINDOW};
use crate::stream::StreamCtl;

/// Cadence of the synchronizer walk.
pub(crate) const SYNC_TICK: Duration = Duration::from_millis(20);

pub(crate) struct Synchronizer {
    shared: Arc<SyncShared>,
    handle: Option<JoinHandle<()>>,
}

struct SyncShared {
    streams: Mutex<Vec<Arc<CachePadded<StreamCtl>>>>,
    shutdown: AtomicBool,
}

impl Synchronizer {
    pub fn spawn() -> Self {
        let shared = Arc::new(SyncShared {
            streams: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });
        let task_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("tapring-syncd".into())
            .spawn(move || run(task_shared))
            .expect("failed to spawn the reverse-mode synchronizer");
        info!("reverse-mode synchronizer started");
        Self {
            shared,
            handle: Some(handle),
        }
    }

    pub fn register(&self, ctl: Arc<CachePadded<StreamCtl>>) {
        let mut streams = self.shared.streams.lock().expect("synchronizer registry poisoned");
        streams.push(ctl);
    }

    pub fn unregister(&self, ctl: &Arc<CachePadded<StreamCtl>>) {
        let mut streams = self.shared.streams.lock().expect("synchronizer registry poisoned");
        streams.retain(|other| !Arc::ptr_eq(other, ctl));
    }

    pub fn shutdown(mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("synchronizer thread panicked during shutdown");
            }
        }
        info!("reverse-mode synchronizer stopped");
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: Arc<SyncShared>) {
    while !shared.shutdown.load(Ordering::Acquire) {
        // Snapshot under the lock, service outside it: a resync pass may
        // take a few register writes and must not hold the registry.
        let snapshot: Vec<_> = {
            let streams = shared.streams.lock().expect("synchronizer registry poisoned");
            streams.clone()
        };
        for ctl in &snapshot {
            service(ctl);
        }
        thread::sleep(SYNC_TICK);
    }
}

/// One stream's share of a tick: answer a pending sync request if the
/// stream is parked, otherwise leave it alone.
fn service(ctl: &StreamCtl) {
    let Some(view) = ctl.view.as_ref() else {
        return;
    };
    if !view.sync_pending() {
        return;
    }
    // Only a parked stream resynchronizes; the claim keeps a concurrent
    // stop honest.
    if !ctl.try_claim_resync() {
        return;
    }

    let hole = ctl.hole_size;
    let peer = view.peer_cursor();
    if peer != 0 {
        // The peer is mid-flight: derive the resume point from its cursor,
        // backing off the safety window and wrapping at most once. A peer
        // more than one lap ahead is indistinguishable from an empty hole
        // here; the single-wrap behavior is kept as-is.
        let mut bottom = (peer as u64).wrapping_sub(SAFETY_WINDOW as u64);
        if bottom < ctl.bus_base {
            bottom += hole as u64;
        }
        ctl.last_bottom.store(bottom, Ordering::Release);
    } else {
        ctl.last_bottom.store(ctl.bus_base, Ordering::Release);
    }

    // Mirror of the start handshake, driven by the peer's state: a
    // producer parks its cursor at the hole base; a consumer advertises
    // everything up to the peer's position as drained.
    if ctl.is_producer() {
        if view.published_limit() == 0 {
            view.publish_limit(ctl.bus_base as u32);
        }
    } else {
        let drained = if peer != 0 {
            peer_offset32(peer, ctl.bus_base as u32, hole)
        } else {
            0
        };
        ctl.publish_limit_offset(safe_limit(drained, hole));
    }

    view.unpause();
    view.ack_sync();
    ctl.finish_resync();
    debug!("stream {} resynchronized", ctl.index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Capture;
    use tapring_io::{page_size, PbmGeneration, PbmView, SimDevice, StreamDevice};

    #[test]
    fn parked_reverse_stream_answers_sync_within_a_tick() {
        let hole = page_size();
        let dev = SimDevice::new(PbmGeneration::Gen3, 1, hole).unwrap();
        let mut cap = Capture::open(dev.clone()).unwrap();
        let token = cap.attach_reverse(0, 0).unwrap();
        cap.start(token).unwrap();

        let base = dev.phys_addr_64(0).unwrap() as u32;
        let regs = dev.pbm_window().unwrap();
        // Play the normal software side by hand: publish a limit, raise
        // the sync request.
        let peer = PbmView::bind(PbmGeneration::Gen3, regs, 0, false).unwrap();
        peer.publish_limit(base + 100);
        peer.request_sync();

        // Well within a few ticks the request is acknowledged, the pause
        // is cleared, and the resume point sits a safety window below the
        // peer cursor.
        std::thread::sleep(Duration::from_millis(100));
        assert!(!peer.sync_pending());
        let stats = cap.stream_stats(token).unwrap();
        assert!(!stats.paused);
        assert_eq!(stats.last_bottom, base as u64 + 100 - SAFETY_WINDOW as u64);
        // Fresh producer parked its published cursor at the hole base.
        assert_eq!(peer.peer_cursor(), base);
    }

    #[test]
    fn resume_point_wraps_once_when_peer_sits_below_the_window() {
        let hole = page_size();
        let dev = SimDevice::new(PbmGeneration::Gen3, 1, hole).unwrap();
        let mut cap = Capture::open(dev.clone()).unwrap();
        let token = cap.attach_reverse(0, 0).unwrap();
        cap.start(token).unwrap();

        let base = dev.phys_addr_64(0).unwrap() as u32;
        let regs = dev.pbm_window().unwrap();
        let peer = PbmView::bind(PbmGeneration::Gen3, regs, 0, false).unwrap();
        peer.publish_limit(base + 4);
        peer.request_sync();

        std::thread::sleep(Duration::from_millis(100));
        let stats = cap.stream_stats(token).unwrap();
        assert_eq!(
            stats.last_bottom,
            base as u64 + 4 - SAFETY_WINDOW as u64 + hole as u64
        );
    }

    #[test]
    fn stop_withdraws_the_request_and_parks_the_stream() {
        let hole = page_size();
        let dev = SimDevice::new(PbmGeneration::Gen3, 1, hole).unwrap();
        let mut cap = Capture::open(dev.clone()).unwrap();
        let token = cap.attach_reverse(0, 0).unwrap();
        cap.start(token).unwrap();

        let base = dev.phys_addr_64(0).unwrap() as u32;
        let regs = dev.pbm_window().unwrap();
        let peer = PbmView::bind(PbmGeneration::Gen3, regs, 0, false).unwrap();
        peer.publish_limit(base + 64);
        peer.request_sync();
        std::thread::sleep(Duration::from_millis(100));
        assert!(!cap.stream_stats(token).unwrap().paused);

        cap.stop(token).unwrap();
        let stats = cap.stream_stats(token).unwrap();
        assert!(stats.paused);
        assert!(!stats.started);
        assert!(!peer.sync_pending());

        // A stopped stream ignores further requests until restarted.
        peer.request_sync();
        std::thread::sleep(Duration::from_millis(100));
        assert!(peer.sync_pending());
        cap.detach(token).unwrap();
    }

    #[test]
    fn state_machine_transitions_via_public_lifecycle() {
        let dev = SimDevice::new(PbmGeneration::Gen2, 1, page_size()).unwrap();
        let mut cap = Capture::open(dev.clone()).unwrap();
        let token = cap.attach_reverse(0, 0).unwrap();

        // Attached but unstarted reverse stream is parked.
        assert!(cap.stream_stats(token).unwrap().paused);
        cap.start(token).unwrap();

        let regs = dev.pbm_window().unwrap();
        let peer = PbmView::bind(PbmGeneration::Gen2, regs, 0, false).unwrap();
        peer.request_sync();
        std::thread::sleep(Duration::from_millis(100));
        assert!(!cap.stream_stats(token).unwrap().paused);

        cap.stop(token).unwrap();
        assert!(cap.stream_stats(token).unwrap().paused);
    }
}
