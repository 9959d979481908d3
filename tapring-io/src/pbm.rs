//! The PCI Burst Manager register view.
//!
//! Four incompatible register layouts shipped across adapter generations.
//! The view binds one stream's register block at construction time and
//! makes the generations indistinguishable to everything above it: callers
//! see a peer-owned cursor, a self-owned cursor, a status word and a pair
//! of diagnostic counters, and never branch on the generation again.
//!
//! Direction of ownership is fixed by construction, not by call site. In
//! normal mode the adapter owns the record pointer and software owns the
//! limit pointer; a view bound with `reverse = true` swaps the two register
//! roles so that the same publish/observe code drives the emulated hardware
//! side of a software-to-software pair.

use crate::device::DeviceError;
use crate::register::RegisterBlock;

/// Stream status bits, uniform across generations once behind the view.
pub const STATUS_PAUSED: u32 = 1 << 0;
pub const STATUS_AUTOWRAP: u32 = 1 << 1;
pub const STATUS_SAFETY: u32 = 1 << 2;
pub const STATUS_SYNC_L2R: u32 = 1 << 3;
pub const STATUS_REQUEST_PENDING: u32 = 1 << 4;
pub const STATUS_BYTESWAP: u32 = 1 << 5;

/// Largest programmable burst timeout, in adapter clock ticks.
pub const BURST_TIMEOUT_MAX: u32 = 0x00FF_FFFF;

/// Register value of a hole that firmware never assigned. Freshly loaded
/// firmware reports all-zeros; a faulted configuration bus reads all-ones.
pub const UNCONFIGURED_ZEROS: u32 = 0;
pub const UNCONFIGURED_ONES: u32 = 0xFFFF_FFFF;

/// Burst-manager hardware generation, detected from the firmware code the
/// driver reports. Generations 2 and 3 share a register layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PbmGeneration {
    Gen0,
    Gen1,
    Gen2,
    Gen3,
}

impl PbmGeneration {
    /// Maps the driver's firmware-generation code to a known layout.
    /// An unknown code is a configuration fault and must fail the attach,
    /// never degrade to a guessed layout.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Gen0),
            1 => Some(Self::Gen1),
            2 => Some(Self::Gen2),
            3 => Some(Self::Gen3),
            _ => None,
        }
    }

    fn layout(self) -> &'static PbmLayout {
        match self {
            Self::Gen0 => &GEN0_LAYOUT,
            Self::Gen1 => &GEN1_LAYOUT,
            Self::Gen2 | Self::Gen3 => &GEN23_LAYOUT,
        }
    }
}

/// Byte offsets of the logical fields inside one stream's register block,
/// plus the generation quirks the view has to paper over.
struct PbmLayout {
    /// Length of the global register block in front of the stream blocks.
    global_len: usize,
    /// Stride between consecutive stream blocks.
    stride: usize,
    status: usize,
    mem_addr: usize,
    mem_size: usize,
    record_ptr: usize,
    limit_ptr: usize,
    safetynet_cnt: usize,
    drop_cnt: usize,
    /// Alternate copy of the stream's read position. On generations whose
    /// record pointer lags the true DMA position this is the field to
    /// trust.
    segment_addr: usize,
    /// Burst timeout register: offset into the global block when
    /// `burst_timeout_global`, else into the stream block.
    burst_timeout: usize,
    burst_timeout_global: bool,
    /// The record pointer is a stale substitute on this generation; read
    /// the segment address instead.
    record_ptr_stale: bool,
    /// Legacy firmware presents the hole big-endian; receive start must
    /// flip the byte-swap bit.
    byteswap: bool,
}

/// First generation: stream blocks packed at 0x60-byte strides straight
/// from the window base, no global block, per-stream burst timeout.
static GEN0_LAYOUT: PbmLayout = PbmLayout {
    global_len: 0x00,
    stride: 0x60,
    status: 0x00,
    mem_addr: 0x04,
    mem_size: 0x08,
    record_ptr: 0x0c,
    limit_ptr: 0x10,
    safetynet_cnt: 0x14,
    drop_cnt: 0x18,
    segment_addr: 0x1c,
    burst_timeout: 0x20,
    burst_timeout_global: false,
    record_ptr_stale: false,
    byteswap: true,
};

/// Second generation: 0x40-byte global block, 0x40-byte stream blocks.
/// The record pointer on this generation reports the last burst boundary,
/// not the DMA position, so the segment address is authoritative.
static GEN1_LAYOUT: PbmLayout = PbmLayout {
    global_len: 0x40,
    stride: 0x40,
    status: 0x00,
    mem_addr: 0x04,
    mem_size: 0x08,
    record_ptr: 0x0c,
    limit_ptr: 0x10,
    safetynet_cnt: 0x14,
    drop_cnt: 0x18,
    segment_addr: 0x1c,
    burst_timeout: 0x0c,
    burst_timeout_global: true,
    record_ptr_stale: true,
    byteswap: false,
};

/// Third and fourth generations share one layout; the drop counter moved
/// next to status and the cursor pair moved up.
static GEN23_LAYOUT: PbmLayout = PbmLayout {
    global_len: 0x40,
    stride: 0x40,
    status: 0x00,
    drop_cnt: 0x04,
    mem_addr: 0x08,
    mem_size: 0x0c,
    record_ptr: 0x10,
    limit_ptr: 0x14,
    safetynet_cnt: 0x18,
    segment_addr: 0x1c,
    burst_timeout: 0x0c,
    burst_timeout_global: true,
    record_ptr_stale: false,
    byteswap: false,
};

/// One stream's burst-manager registers, bound to a generation and a
/// direction at construction.
pub struct PbmView {
    regs: RegisterBlock,
    layout: &'static PbmLayout,
    generation: PbmGeneration,
    block: usize,
    reverse: bool,
    /// Resolved field offset of the cursor the peer publishes.
    cursor_theirs: usize,
    /// Resolved field offset of the cursor this side publishes.
    cursor_ours: usize,
}

impl PbmView {
    /// Binds stream `stream`'s register block inside the PBM window.
    ///
    /// `reverse` swaps the record/limit roles here, once; no call path
    /// ever re-decides which register it owns.
    pub fn bind(
        generation: PbmGeneration,
        regs: RegisterBlock,
        stream: usize,
        reverse: bool,
    ) -> Result<Self, DeviceError> {
        let layout = generation.layout();
        let block = layout.global_len + stream * layout.stride;
        if block + layout.stride > regs.len() {
            return Err(DeviceError::NoSuchStream(stream));
        }
        let (cursor_theirs, cursor_ours) = if reverse {
            (layout.limit_ptr, layout.record_ptr)
        } else {
            (layout.record_ptr, layout.limit_ptr)
        };
        Ok(Self {
            regs,
            layout,
            generation,
            block,
            reverse,
            cursor_theirs,
            cursor_ours,
        })
    }

    pub fn generation(&self) -> PbmGeneration {
        self.generation
    }

    pub fn reverse(&self) -> bool {
        self.reverse
    }

    /// Whether receive start must flip the legacy byte-swap bit.
    pub fn needs_byteswap(&self) -> bool {
        self.layout.byteswap
    }

    fn reg(&self, field: usize) -> usize {
        self.block + field
    }

    pub fn status(&self) -> u32 {
        self.regs.read32(self.reg(self.layout.status))
    }

    pub fn set_status_bits(&self, bits: u32) {
        self.regs.set_bits32(self.reg(self.layout.status), bits);
    }

    pub fn clear_status_bits(&self, bits: u32) {
        self.regs.clear_bits32(self.reg(self.layout.status), bits);
    }

    pub fn paused(&self) -> bool {
        self.status() & STATUS_PAUSED != 0
    }

    pub fn pause(&self) {
        self.set_status_bits(STATUS_PAUSED);
    }

    pub fn unpause(&self) {
        self.clear_status_bits(STATUS_PAUSED);
    }

    /// Raises the synchronization request for the other side to act on.
    pub fn request_sync(&self) {
        self.set_status_bits(STATUS_SYNC_L2R);
    }

    pub fn sync_pending(&self) -> bool {
        self.status() & STATUS_SYNC_L2R != 0
    }

    /// Acknowledges a synchronization request (the emulated-hardware side
    /// of the handshake).
    pub fn ack_sync(&self) {
        self.clear_status_bits(STATUS_SYNC_L2R);
    }

    pub fn request_pending(&self) -> bool {
        self.status() & STATUS_REQUEST_PENDING != 0
    }

    pub fn mem_addr(&self) -> u32 {
        self.regs.read32(self.reg(self.layout.mem_addr))
    }

    pub fn set_mem_addr(&self, addr: u32) {
        self.regs.write32(self.reg(self.layout.mem_addr), addr);
    }

    pub fn mem_size(&self) -> u32 {
        self.regs.read32(self.reg(self.layout.mem_size))
    }

    pub fn set_mem_size(&self, size: u32) {
        self.regs.write32(self.reg(self.layout.mem_size), size);
    }

    /// True when firmware never assigned a hole to this stream.
    pub fn unconfigured(&self) -> bool {
        let addr = self.mem_addr();
        let size = self.mem_size();
        addr == UNCONFIGURED_ZEROS
            || addr == UNCONFIGURED_ONES
            || size == UNCONFIGURED_ZEROS
            || size == UNCONFIGURED_ONES
    }

    /// The cursor the peer advertises, in bus-address space.
    ///
    /// On the stale-record-pointer generation the segment address carries
    /// the true position; everywhere else the bound peer cursor field is
    /// authoritative.
    pub fn peer_cursor(&self) -> u32 {
        if !self.reverse && self.layout.record_ptr_stale {
            self.regs.read32(self.reg(self.layout.segment_addr))
        } else {
            self.regs.read32(self.reg(self.cursor_theirs))
        }
    }

    /// Publishes this side's cursor, in bus-address space.
    ///
    /// When emulating hardware on the stale-record-pointer generation the
    /// segment address is mirrored too, since that is the field the normal
    /// side trusts.
    pub fn publish_limit(&self, bus_addr: u32) {
        self.regs.write32(self.reg(self.cursor_ours), bus_addr);
        if self.reverse && self.layout.record_ptr_stale {
            self.regs.write32(self.reg(self.layout.segment_addr), bus_addr);
        }
    }

    /// This side's last published cursor.
    pub fn published_limit(&self) -> u32 {
        self.regs.read32(self.reg(self.cursor_ours))
    }

    pub fn safetynet_count(&self) -> u32 {
        self.regs.read32(self.reg(self.layout.safetynet_cnt))
    }

    pub fn drop_count(&self) -> u32 {
        self.regs.read32(self.reg(self.layout.drop_cnt))
    }

    pub fn set_burst_timeout(&self, ticks: u32) {
        let offset = if self.layout.burst_timeout_global {
            self.layout.burst_timeout
        } else {
            self.reg(self.layout.burst_timeout)
        };
        self.regs.write32(offset, ticks);
    }

    /// Pulses the burst timeout to force the manager to close out a
    /// partially filled burst it is holding back.
    pub fn kick_burst_timeout(&self) {
        self.set_burst_timeout(1);
        self.set_burst_timeout(BURST_TIMEOUT_MAX);
    }
}

/// Command/status doorbell of the embedded-processor path.
///
/// Some firmware loads carry no burst manager at all; an on-card processor
/// owns the hole and exports a single "here" cursor plus this doorbell.
pub const COPRO_COMMAND: usize = 0x00;
pub const COPRO_STATUS: usize = 0x04;
pub const COPRO_HERE: usize = 0x08;

pub const COPRO_CMD_RUN: u32 = 1;
pub const COPRO_CMD_HALT: u32 = 2;
pub const COPRO_STATUS_ACK: u32 = 1 << 0;
pub const COPRO_STATUS_BUSY: u32 = 1 << 1;

/// Register view of the embedded processor driving a hole.
pub struct CoproView {
    regs: RegisterBlock,
}

impl CoproView {
    pub fn bind(regs: RegisterBlock) -> Self {
        Self { regs }
    }

    /// Issues the run command; the processor raises ACK when it is
    /// streaming.
    pub fn run(&self) {
        self.regs.write32(COPRO_COMMAND, COPRO_CMD_RUN);
    }

    pub fn halt(&self) {
        self.regs.write32(COPRO_COMMAND, COPRO_CMD_HALT);
    }

    pub fn acknowledged(&self) -> bool {
        self.regs.read32(COPRO_STATUS) & COPRO_STATUS_ACK != 0
    }

    pub fn busy(&self) -> bool {
        self.regs.read32(COPRO_STATUS) & COPRO_STATUS_BUSY != 0
    }

    /// The processor's "here" cursor: the bus address it has written (or
    /// read) up to.
    pub fn here(&self) -> u64 {
        self.regs.read64(COPRO_HERE)
    }

    pub fn set_here(&self, bus_addr: u64) {
        self.regs.write64(COPRO_HERE, bus_addr);
    }
}
