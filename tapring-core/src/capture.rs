//! The stream lifecycle manager.
//!
//! A [`Capture`] session owns one device and a registry of attached
//! streams, keyed by the opaque token attach hands back. All mutual
//! exclusion against other processes is the device's advisory lock; inside
//! the process, the session owns its streams outright and only the
//! reverse-mode synchronizer shares the narrow control block.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_utils::CachePadded;
use log::{info, warn};
use tapring_io::pbm::{STATUS_AUTOWRAP, STATUS_BYTESWAP, STATUS_PAUSED, STATUS_SAFETY};
use tapring_io::pbm::BURST_TIMEOUT_MAX;
use tapring_io::{CoproView, DeviceInfo, DualWindow, PbmGeneration, PbmView, StreamDevice};

use crate::cursor::safe_limit;
use crate::stream::{PollConfig, StreamCtl, StreamState, StreamStats, StreamToken, SyncState};
use crate::syncd::Synchronizer;
use crate::{Result, StreamError};

/// Sleep granularity of the bounded lifecycle polls.
pub(crate) const POLL_STEP: Duration = Duration::from_millis(10);
/// Iteration bound of the lifecycle polls (~640 ms worst case).
pub(crate) const POLL_RETRIES: usize = 64;
/// How long `stop` waits for a synchronizer pass already in flight.
const QUIESCE_DEADLINE: Duration = Duration::from_millis(200);
/// How many stall checks detach grants a draining transmit stream.
const DRAIN_RETRIES: usize = 8;

/// One session against one device.
pub struct Capture {
    device: Arc<dyn StreamDevice>,
    info: DeviceInfo,
    streams: HashMap<StreamToken, StreamState>,
    next_token: u64,
    default_poll: PollConfig,
    syncd: Option<Synchronizer>,
}

impl Capture {
    /// Opens a session: queries the device once; nothing is locked or
    /// mapped until attach.
    pub fn open(device: Arc<dyn StreamDevice>) -> Result<Self> {
        let info = device.refresh_info()?;
        Ok(Self {
            device,
            info,
            streams: HashMap::new(),
            next_token: 1,
            default_poll: PollConfig::default(),
            syncd: None,
        })
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.info
    }

    /// Poll configuration applied to streams attached from now on.
    pub fn set_default_poll_config(&mut self, poll: PollConfig) {
        self.default_poll = poll;
    }

    pub fn set_poll_config(&mut self, token: StreamToken, poll: PollConfig) -> Result<()> {
        let st = self.streams.get_mut(&token).ok_or(StreamError::BadHandle)?;
        st.poll = poll;
        Ok(())
    }

    pub fn poll_config(&self, token: StreamToken) -> Result<PollConfig> {
        let st = self.streams.get(&token).ok_or(StreamError::BadHandle)?;
        Ok(st.poll)
    }

    pub fn stream_stats(&self, token: StreamToken) -> Result<StreamStats> {
        let st = self.streams.get(&token).ok_or(StreamError::BadHandle)?;
        let ctl = &*st.ctl;
        Ok(StreamStats {
            stream_index: ctl.index,
            reverse: ctl.reverse,
            started: st.started,
            paused: ctl.software_paused(),
            software_offset: st.software_offset,
            free_space: st.free_space,
            processed: st.processed,
            hole_size: ctl.hole_size,
            drop_count: ctl.view.as_ref().map(|v| v.drop_count()).unwrap_or(0),
            last_bottom: ctl.last_bottom.load(std::sync::atomic::Ordering::Acquire),
            last_top: ctl.last_top.load(std::sync::atomic::Ordering::Acquire),
        })
    }

    /// Attaches a stream: advisory lock, register binding, double mapping.
    ///
    /// `extra_window` bounds how many bytes past the hole top a record may
    /// extend and still appear contiguous; zero means "alias the whole
    /// hole", trading virtual address space for zero reader-side chunking
    /// discipline.
    pub fn attach(&mut self, stream: usize, extra_window: usize) -> Result<StreamToken> {
        self.attach_inner(stream, extra_window, false)
    }

    /// Attaches the software-emulated hardware side of a stream. The
    /// stream parks until the peer requests synchronization and the
    /// background synchronizer answers.
    pub fn attach_reverse(&mut self, stream: usize, extra_window: usize) -> Result<StreamToken> {
        self.attach_inner(stream, extra_window, true)
    }

    fn attach_inner(
        &mut self,
        stream: usize,
        extra_window: usize,
        reverse: bool,
    ) -> Result<StreamToken> {
        if stream >= self.info.stream_count {
            return Err(StreamError::InvalidArgument("stream index outside device"));
        }
        self.device.lock_stream(stream, reverse)?;
        match self.attach_locked(stream, extra_window, reverse) {
            Ok(token) => Ok(token),
            Err(e) => {
                self.device.unlock_stream(stream, reverse);
                Err(e)
            }
        }
    }

    fn attach_locked(
        &mut self,
        stream: usize,
        extra_window: usize,
        reverse: bool,
    ) -> Result<StreamToken> {
        // A firmware reload between attaches can change every global.
        self.info = self.device.refresh_info()?;
        let info = self.info;

        let mut copro = None;
        let (view, hole_size, bus_base) = if info.has_pbm {
            let regs = self.device.pbm_window().ok_or(StreamError::NoSuchDevice)?;
            let generation = PbmGeneration::from_code(info.firmware_generation)
                .ok_or(StreamError::NoSuchDevice)?;
            let view = PbmView::bind(generation, regs, stream, reverse)?;
            if view.unconfigured() {
                if stream == 0 {
                    // Reloaded firmware leaves the registers at the
                    // sentinel; stream 0 inherits the primary hole.
                    warn!("stream 0 registers unconfigured; programming the primary hole");
                    view.set_mem_addr(info.phys_base as u32);
                    view.set_mem_size(info.hole_size as u32);
                } else {
                    // No hole was ever assigned to this stream.
                    return Err(StreamError::OutOfMemory);
                }
            }
            // The map can shrink across a driver reload; never trust a
            // declared size beyond the device-global one.
            let hole = (view.mem_size() as usize).min(info.hole_size);
            let bus = self
                .device
                .phys_addr_64(stream)
                .unwrap_or(view.mem_addr() as u64);
            (Some(view), hole, bus)
        } else if info.has_processor {
            let regs = self
                .device
                .processor_window()
                .ok_or(StreamError::NoSuchDevice)?;
            copro = Some(CoproView::bind(regs));
            let bus = self.device.phys_addr_64(stream).unwrap_or(info.phys_base);
            (None, info.hole_size, bus)
        } else {
            return Err(StreamError::NoSuchDevice);
        };

        let extra = if extra_window == 0 {
            hole_size
        } else {
            extra_window.min(hole_size)
        };
        let window = DualWindow::map(&*self.device, stream, hole_size, extra)?;

        let ctl = Arc::new(CachePadded::new(StreamCtl::new(
            stream, reverse, bus_base, hole_size, view,
        )));
        if reverse {
            ctl.set_sync_state(SyncState::PauseRequested);
            if let Some(view) = ctl.view.as_ref() {
                view.pause();
            }
            self.synchronizer().register(ctl.clone());
        }

        let token = StreamToken(self.next_token);
        self.next_token += 1;
        self.streams.insert(
            token,
            StreamState {
                ctl,
                window,
                copro,
                poll: self.default_poll,
                software_offset: 0,
                free_space: 0,
                processed: 0,
                started: false,
                first_access: true,
            },
        );
        info!(
            "attached stream {} ({}, hole {:#x}, alias {:#x})",
            stream,
            if reverse { "reverse" } else { "normal" },
            hole_size,
            extra
        );
        Ok(token)
    }

    /// Runs the start handshake for an attached stream.
    pub fn start(&mut self, token: StreamToken) -> Result<()> {
        let st = self.streams.get_mut(&token).ok_or(StreamError::BadHandle)?;
        if st.started {
            return Err(StreamError::InvalidArgument("stream already started"));
        }
        let ctl = st.ctl.clone();

        if ctl.reverse {
            // The emulated-hardware side has no handshake to run locally;
            // it parks until the peer requests synchronization and the
            // background task answers.
            st.started = true;
            st.first_access = true;
            info!("stream {} (reverse) armed, awaiting peer sync", ctl.index);
            return Ok(());
        }

        let hole = ctl.hole_size;
        if let Some(view) = ctl.view.as_ref() {
            if ctl.is_producer() {
                view.pause();
                // Transmit starts with nothing written: the published
                // cursor rests at the hole base, raw.
                view.publish_limit(ctl.bus_base as u32);
                view.request_sync();
                poll_until(|| !view.sync_pending())?;
                view.unpause();
            } else {
                st.window.zero_hole();
                self.info = self.device.refresh_info()?;
                view.set_status_bits(STATUS_PAUSED | STATUS_SAFETY);
                poll_until(|| !view.request_pending())?;
                view.set_burst_timeout(BURST_TIMEOUT_MAX);
                ctl.publish_limit_offset(safe_limit(0, hole));
                view.request_sync();
                poll_until(|| !view.sync_pending())?;
                let mut bits = STATUS_AUTOWRAP;
                if view.needs_byteswap() {
                    bits |= STATUS_BYTESWAP;
                }
                view.set_status_bits(bits);
                view.clear_status_bits(STATUS_PAUSED | STATUS_SAFETY);
            }
        }

        let st = self.streams.get_mut(&token).ok_or(StreamError::BadHandle)?;
        if let Some(copro) = st.copro.as_ref() {
            copro.run();
            poll_until(|| copro.acknowledged())?;
        }

        st.started = true;
        st.first_access = true;
        st.software_offset = 0;
        st.free_space = 0;
        st.processed = 0;
        info!("stream {} started", ctl.index);
        Ok(())
    }

    /// Pauses the stream's active side and waits for it to drain. Errors
    /// from the burst-manager and processor sides are aggregated: both
    /// sides are always attempted, the first failure is reported.
    pub fn stop(&mut self, token: StreamToken) -> Result<()> {
        let st = self.streams.get_mut(&token).ok_or(StreamError::BadHandle)?;
        if !st.started {
            return Err(StreamError::InvalidArgument("stream not started"));
        }
        let ctl = st.ctl.clone();
        let mut first_err: Option<StreamError> = None;

        if let Some(view) = ctl.view.as_ref() {
            view.pause();
            if let Err(e) = poll_until(|| !view.request_pending()) {
                first_err.get_or_insert(e);
            }
        }
        if let Some(copro) = st.copro.as_ref() {
            copro.halt();
            if let Err(e) = poll_until(|| !copro.busy()) {
                first_err.get_or_insert(e);
            }
        }

        if ctl.reverse {
            // Withdraw any outstanding resync request, then wait out a
            // pass the synchronizer may already be running.
            if let Some(view) = ctl.view.as_ref() {
                view.ack_sync();
            }
            ctl.request_pause();
            if let Err(e) = ctl.wait_resync_idle(QUIESCE_DEADLINE) {
                first_err.get_or_insert(e);
            }
            ctl.set_sync_state(SyncState::Idle);
        }

        st.started = false;
        info!("stream {} stopped", ctl.index);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Detaches a stream: drains a transmit side briefly, unmaps the
    /// window, releases the advisory lock. Safe on a stream that failed
    /// partway through attach; a second call on the same token reports
    /// `BadHandle` and touches nothing.
    pub fn detach(&mut self, token: StreamToken) -> Result<()> {
        let st = self.streams.remove(&token).ok_or(StreamError::BadHandle)?;
        let ctl = st.ctl.clone();

        if ctl.is_producer() && st.started {
            // Pending data: watch the peer's drain cursor until it stalls.
            if let Some(view) = ctl.view.as_ref() {
                let mut last = view.peer_cursor();
                for _ in 0..DRAIN_RETRIES {
                    thread::sleep(POLL_STEP);
                    let now = view.peer_cursor();
                    if now == last {
                        break;
                    }
                    last = now;
                }
                view.pause();
            }
        }

        if ctl.reverse {
            if let Some(syncd) = self.syncd.as_ref() {
                syncd.unregister(&ctl);
            }
        }

        // Unmaps both the hole and the alias.
        drop(st);
        self.device.unlock_stream(ctl.index, ctl.reverse);
        info!(
            "detached stream {} ({})",
            ctl.index,
            if ctl.reverse { "reverse" } else { "normal" }
        );
        Ok(())
    }

    fn synchronizer(&mut self) -> &Synchronizer {
        if self.syncd.is_none() {
            self.syncd = Some(Synchronizer::spawn());
        }
        self.syncd.as_ref().expect("synchronizer just spawned")
    }

    pub(crate) fn stream_mut(&mut self, token: StreamToken) -> Result<&mut StreamState> {
        self.streams.get_mut(&token).ok_or(StreamError::BadHandle)
    }

    pub(crate) fn stream_ref(&self, token: StreamToken) -> Result<&StreamState> {
        self.streams.get(&token).ok_or(StreamError::BadHandle)
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        if let Some(syncd) = self.syncd.take() {
            syncd.shutdown();
        }
        let tokens: Vec<_> = self.streams.keys().copied().collect();
        for token in tokens {
            if let Err(e) = self.detach(token) {
                warn!("detach during session teardown failed: {e}");
            }
        }
    }
}

impl StreamCtl {
    /// Bounded wait for an in-flight synchronizer pass to finish.
    pub(crate) fn wait_resync_idle(&self, deadline: Duration) -> Result<()> {
        use crossbeam_utils::Backoff;
        let backoff = Backoff::new();
        let deadline = std::time::Instant::now() + deadline;
        while self.sync_state() == SyncState::Resyncing {
            if std::time::Instant::now() >= deadline {
                return Err(StreamError::TimedOut);
            }
            if backoff.is_completed() {
                thread::sleep(POLL_STEP);
            } else {
                backoff.snooze();
            }
        }
        Ok(())
    }
}

/// Bounded hardware poll: re-checks `ready` every [`POLL_STEP`] up to
/// [`POLL_RETRIES`] times.
pub(crate) fn poll_until(mut ready: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..POLL_RETRIES {
        if ready() {
            return Ok(());
        }
        thread::sleep(POLL_STEP);
    }
    Err(StreamError::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapring_erf::{build_record, TYPE_ETH};
    use tapring_io::{page_size, SimDevice};

    fn quick_poll() -> PollConfig {
        PollConfig {
            min_data: 16,
            max_wait: Duration::from_millis(100),
            poll_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn attach_detach_roundtrip_and_double_detach() {
        let dev = SimDevice::new(PbmGeneration::Gen3, 2, page_size()).unwrap();
        let mut cap = Capture::open(dev).unwrap();

        let token = cap.attach(0, 0).unwrap();
        let stats = cap.stream_stats(token).unwrap();
        assert_eq!(stats.stream_index, 0);
        assert!(!stats.started);

        cap.detach(token).unwrap();
        assert!(matches!(cap.detach(token), Err(StreamError::BadHandle)));
        assert!(matches!(cap.stream_stats(token), Err(StreamError::BadHandle)));
    }

    #[test]
    fn attach_conflicts_report_locked() {
        let dev = SimDevice::new(PbmGeneration::Gen2, 1, page_size()).unwrap();
        let mut a = Capture::open(dev.clone()).unwrap();
        let mut b = Capture::open(dev).unwrap();

        let _held = a.attach(0, 0).unwrap();
        assert!(matches!(b.attach(0, 0), Err(StreamError::Locked)));

        // The reverse direction is a different owner by design.
        let rev = b.attach_reverse(0, 0).unwrap();
        b.detach(rev).unwrap();
    }

    #[test]
    fn lock_released_when_attach_fails_late() {
        // Stream 1 unconfigured is fatal, but the advisory lock must not
        // leak out of the failed attach.
        let dev = SimDevice::new_unconfigured(PbmGeneration::Gen1, 2, page_size()).unwrap();
        let mut cap = Capture::open(dev.clone()).unwrap();

        assert!(matches!(cap.attach(1, 0), Err(StreamError::OutOfMemory)));
        // Lock is free again: a direct device lock succeeds.
        dev.lock_stream(1, false).unwrap();
        dev.unlock_stream(1, false);
    }

    #[test]
    fn unconfigured_stream_zero_inherits_primary_hole() {
        let hole = page_size();
        let dev = SimDevice::new_unconfigured(PbmGeneration::Gen0, 1, hole).unwrap();
        let mut cap = Capture::open(dev.clone()).unwrap();

        let token = cap.attach(0, 0).unwrap();
        assert_eq!(cap.stream_stats(token).unwrap().hole_size, hole);

        let regs = dev.pbm_window().unwrap();
        let view = PbmView::bind(PbmGeneration::Gen0, regs, 0, false).unwrap();
        assert!(!view.unconfigured());
        assert_eq!(view.mem_size() as usize, hole);
    }

    /// Delegating device that reports a firmware generation the engine
    /// has never heard of.
    struct ForgedGeneration(std::sync::Arc<SimDevice>);

    impl StreamDevice for ForgedGeneration {
        fn refresh_info(&self) -> std::result::Result<DeviceInfo, tapring_io::DeviceError> {
            let mut info = self.0.refresh_info()?;
            info.firmware_generation = 9;
            Ok(info)
        }
        fn lock_stream(
            &self,
            stream: usize,
            reverse: bool,
        ) -> std::result::Result<(), tapring_io::DeviceError> {
            self.0.lock_stream(stream, reverse)
        }
        fn unlock_stream(&self, stream: usize, reverse: bool) {
            self.0.unlock_stream(stream, reverse)
        }
        fn map_hole(
            &self,
            stream: usize,
            at: std::ptr::NonNull<u8>,
            len: usize,
        ) -> std::result::Result<(), tapring_io::DeviceError> {
            self.0.map_hole(stream, at, len)
        }
        fn pbm_window(&self) -> Option<tapring_io::RegisterBlock> {
            self.0.pbm_window()
        }
        fn processor_window(&self) -> Option<tapring_io::RegisterBlock> {
            self.0.processor_window()
        }
        fn phys_addr_64(&self, stream: usize) -> Option<u64> {
            self.0.phys_addr_64(stream)
        }
    }

    #[test]
    fn unknown_generation_fails_attach() {
        let sim = SimDevice::new(PbmGeneration::Gen3, 1, page_size()).unwrap();
        let dev: Arc<dyn StreamDevice> = Arc::new(ForgedGeneration(sim.clone()));
        let mut cap = Capture::open(dev).unwrap();
        assert!(matches!(cap.attach(0, 0), Err(StreamError::NoSuchDevice)));
        // The advisory lock was released on the failure path.
        sim.lock_stream(0, false).unwrap();
        sim.unlock_stream(0, false);
    }

    #[test]
    fn start_without_peer_times_out_and_stays_stopped() {
        let dev = SimDevice::new(PbmGeneration::Gen3, 1, page_size()).unwrap();
        let mut cap = Capture::open(dev).unwrap();
        let token = cap.attach(0, 0).unwrap();
        cap.set_poll_config(token, quick_poll()).unwrap();

        // Nobody acknowledges the sync request.
        assert!(matches!(cap.start(token), Err(StreamError::TimedOut)));
        assert!(!cap.stream_stats(token).unwrap().started);
        assert!(matches!(
            cap.stop(token),
            Err(StreamError::InvalidArgument(_))
        ));
    }

    #[test]
    fn default_poll_config_applies_at_attach() {
        let dev = SimDevice::new(PbmGeneration::Gen3, 2, page_size()).unwrap();
        let mut cap = Capture::open(dev).unwrap();

        let custom = PollConfig {
            min_data: 0,
            max_wait: Duration::from_millis(7),
            poll_interval: Duration::from_micros(500),
        };
        cap.set_default_poll_config(custom);
        let token = cap.attach(0, 0).unwrap();
        let poll = cap.poll_config(token).unwrap();
        assert_eq!(poll.min_data, 0);
        assert_eq!(poll.max_wait, Duration::from_millis(7));
    }

    #[test]
    fn software_loopback_pair_moves_records() {
        let hole = page_size();
        let dev = SimDevice::new(PbmGeneration::Gen3, 1, hole).unwrap();

        // Reverse side first: its synchronizer answers the consumer's
        // start handshake.
        let mut producer = Capture::open(dev.clone()).unwrap();
        let ptok = producer.attach_reverse(0, 0).unwrap();
        producer.start(ptok).unwrap();
        producer
            .set_poll_config(
                ptok,
                PollConfig {
                    min_data: 16,
                    max_wait: Duration::from_millis(100),
                    poll_interval: Duration::from_millis(1),
                },
            )
            .unwrap();

        let mut consumer = Capture::open(dev).unwrap();
        let ctok = consumer.attach(0, 0).unwrap();
        consumer
            .set_poll_config(
                ctok,
                PollConfig {
                    min_data: 16,
                    max_wait: Duration::from_millis(300),
                    poll_interval: Duration::from_millis(1),
                },
            )
            .unwrap();
        consumer.start(ctok).unwrap();

        for i in 0..3u64 {
            let rec = build_record(TYPE_ETH, i, &[i as u8; 84]);
            assert_eq!(rec.len(), 100);
            assert_eq!(producer.copy_and_commit(ptok, &rec).unwrap(), 100);
        }

        let r1 = consumer.next_record(ctok).unwrap();
        assert_eq!(r1.header().timestamp, 0);
        assert_eq!(r1.len(), 100);
        let r2 = consumer.next_record(ctok).unwrap();
        assert_eq!(r2.header().timestamp, 1);

        // The third record's tail sits behind the published safety
        // window until more data pushes the limit past it.
        assert!(matches!(
            consumer.next_record(ctok),
            Err(StreamError::TimedOut)
        ));
        let rec = build_record(TYPE_ETH, 3, &[3u8; 84]);
        producer.copy_and_commit(ptok, &rec).unwrap();
        let r3 = consumer.next_record(ctok).unwrap();
        assert_eq!(r3.header().timestamp, 2);

        let stats = consumer.stream_stats(ctok).unwrap();
        assert_eq!(stats.processed, 300);
        assert_eq!(stats.software_offset, 300);
    }

    #[test]
    fn processor_driven_attach_binds_copro() {
        let dev = SimDevice::processor_driven(1, page_size()).unwrap();
        let mut cap = Capture::open(dev.clone()).unwrap();
        let token = cap.attach(0, 0).unwrap();

        // Start needs the processor to acknowledge the run command.
        use tapring_io::pbm::{COPRO_CMD_RUN, COPRO_COMMAND, COPRO_STATUS, COPRO_STATUS_ACK};
        let copro_regs = dev.processor_window().unwrap();
        let actor = std::thread::spawn(move || {
            for _ in 0..200 {
                if copro_regs.read32(COPRO_COMMAND) == COPRO_CMD_RUN {
                    copro_regs.set_bits32(COPRO_STATUS, COPRO_STATUS_ACK);
                    break;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        });
        cap.start(token).unwrap();
        actor.join().unwrap();
        assert!(cap.stream_stats(token).unwrap().started);
    }
}
