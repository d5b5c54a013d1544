#![forbid(unsafe_code)]
//! Transactional buffer cache for the silt object store.
//!
//! The cache mediates every read and write against the storage
//! substrate: it keeps an address-ordered index of live extents,
//! provides transactional isolation with optimistic concurrency,
//! routes fresh and mutated blocks toward the journal's record
//! builder, evicts clean extents by LRU under a byte budget, and
//! batches back-references (physical → logical reverse mappings) by
//! journal sequence for the index trees.
//!
//! Collaborators are consumed through narrow traits: the extent
//! placement manager performs device reads and allocation placement,
//! the journal consumes prepared records and returns `(final paddr,
//! commit seq)`, and the segment cleaner observes commit events.

mod backref;
mod cache;
mod epm;
mod extent;
mod index;
mod lru;
mod record;
mod stats;
mod transaction;

pub use backref::{BackrefEntry, BackrefOp, BufferedBackref};
pub use cache::{Cache, CacheOptions};
pub use epm::{Allocation, ExtentPlacementManager, SpaceObserver};
pub use extent::{CachedExtent, ExtentRef, ExtentState, PageBuf};
pub use record::{Delta, DeltaEntry, FreshBlock, Record, Retirement};
pub use stats::{CacheStats, IoStat, QueryCounters, NUM_SRC_COMB};
pub use transaction::Transaction;
