//! Packet cache and prefetching
//!
//! Packets are pre-synthesized advice keyed by project, phase, domain, tool
//! and intent cluster. The hot path reads them; prefetch workers and the hot
//! path both write them; outcome feedback adjusts their effectiveness.

pub mod packet;
pub mod prefetch;
pub mod store;

pub use packet::{AdvisoryPacket, PacketKey, PacketSource};
pub use prefetch::{
    spawn_workers, EnqueueOutcome, LoadSignal, PrefetchQueue, PrefetchRequest, PrefetchRunner,
    PrefetchStats, PrefetchStatus,
};
pub use store::{CacheMatch, CacheStats, PacketCache, PacketFeedback};
