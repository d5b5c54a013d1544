//! Journal-facing record types.
//!
//! `prepare_record` builds a `Record` from a validated transaction; the
//! journal owns the byte layout and returns `(final_block_start, seq)`
//! once durable. Replay feeds `Delta` items back through the cache.

use serde::{Deserialize, Serialize};
use silt_types::{ExtentType, Laddr, Paddr};

/// A committed mutation to an existing extent.
///
/// The payload is opaque to the cache; each extent type owns its delta
/// encoding, and this cache ships full post-images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEntry {
    pub paddr: Paddr,
    pub laddr: Option<Laddr>,
    pub ext_type: ExtentType,
    pub length: u32,
    pub payload: Vec<u8>,
}

/// A freshly allocated block carried inline in the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshBlock {
    pub ext_type: ExtentType,
    pub laddr: Option<Laddr>,
    pub length: u32,
    pub data: Vec<u8>,
}

/// A retirement marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retirement {
    pub paddr: Paddr,
    pub laddr: Option<Laddr>,
    pub ext_type: ExtentType,
    pub length: u32,
}

/// The unit handed to the journal for one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub deltas: Vec<DeltaEntry>,
    pub fresh_blocks: Vec<FreshBlock>,
    pub retirements: Vec<Retirement>,
}

impl Record {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty() && self.fresh_blocks.is_empty() && self.retirements.is_empty()
    }

    /// Total bytes of fresh block content, the running length used to
    /// stamp final addresses at commit.
    #[must_use]
    pub fn fresh_bytes(&self) -> u64 {
        self.fresh_blocks
            .iter()
            .map(|b| u64::from(b.length))
            .sum()
    }
}

/// One replayable unit decoded from a journaled record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delta {
    /// Mutation to a single extent; root deltas carry
    /// `ExtentType::Root` and update the root in place.
    Extent(DeltaEntry),
    /// Allocation info used to rebuild the back-reference buffer.
    Alloc(Vec<crate::backref::BufferedBackref>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_bytes_sums_lengths() {
        let record = Record {
            deltas: Vec::new(),
            fresh_blocks: vec![
                FreshBlock {
                    ext_type: ExtentType::Data,
                    laddr: Some(Laddr(1)),
                    length: 4096,
                    data: vec![0; 4096],
                },
                FreshBlock {
                    ext_type: ExtentType::LaddrLeaf,
                    laddr: None,
                    length: 8192,
                    data: vec![0; 8192],
                },
            ],
            retirements: Vec::new(),
        };
        assert_eq!(record.fresh_bytes(), 12288);
        assert!(!record.is_empty());
        assert!(Record::default().is_empty());
    }
}
