//! Cache components.
//!
//! Every cache is a pipeline stage over a tag store. Reads, read-for-writes
//! and prefetches hit or miss in the tag array; writebacks install dirty
//! lines; evictions of dirty victims spawn writebacks that travel toward
//! memory and die back at their origin. The last-level variants implement
//! the different insertion/replacement schemes.

mod arc;
mod awb;
mod data;
mod dcp;
mod dynamic;
mod fdp;
mod fdp_ap;
mod llc;
mod mct;
mod pacman;
mod rtb;
mod ship;
mod ucp;
mod vts;

pub use arc::ArcCache;
pub use awb::AwbLlc;
pub use data::DataCache;
pub use dcp::DcpCache;
pub use dynamic::DynamicLlc;
pub use fdp::FdpCache;
pub use fdp_ap::FdpApCache;
pub use llc::BaselineLlc;
pub use mct::MctCache;
pub use pacman::PacmanCache;
pub use rtb::RtbCache;
pub use ship::ShipIpCache;
pub use ucp::UcpCache;
pub use vts::VtsLlc;

/// Lifecycle of a prefetched line, for prefetch-aware policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrefetchState {
    #[default]
    NotPrefetched,
    PrefetchedUnused,
    PrefetchedUsed,
    PrefetchedReused,
}
