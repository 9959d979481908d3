//! TAPRING I/O: the hardware access layer.
//!
//! Everything that touches raw adapter memory lives in this crate: the
//! stream-device contract, the double-mapped circular window, volatile
//! register access, and platform glue (memory pinning, thread placement).
//! Cursor arithmetic and record framing live above, in `tapring-core`, and
//! operate on plain integers only — the only way across the pointer
//! boundary is through the types defined here.

pub mod device;
pub mod net;
pub mod pbm;
pub mod platform;
pub mod register;
pub mod window;

// Re-exports for easier access by tapring-core
pub use device::{page_size, DeviceError, DeviceInfo, SimDevice, StreamDevice};
pub use net::ExportListener;
pub use pbm::{CoproView, PbmGeneration, PbmView};
pub use platform::lock_memory_pages;
pub use register::RegisterBlock;
pub use window::DualWindow;
