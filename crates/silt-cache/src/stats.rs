//! Cache statistics: fixed arrays keyed by the closed source and
//! extent-type enums, plus the conflict matrix.

use silt_types::{ExtentType, JournalSeq, TransactionSource};

/// Distinct unordered source pairs, triangular over `COUNT`.
pub const NUM_SRC_COMB: usize =
    TransactionSource::COUNT * (TransactionSource::COUNT + 1) / 2;

/// Access/hit counters for cache queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryCounters {
    pub access: u64,
    pub hit: u64,
}

/// Extent-count and byte-count effort pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStat {
    pub extents: u64,
    pub bytes: u64,
}

impl IoStat {
    pub(crate) fn increment(&mut self, bytes: u64) {
        self.extents = self.extents.saturating_add(1);
        self.bytes = self.bytes.saturating_add(bytes);
    }
}

/// Triangular index of an unordered source pair.
///
/// Mirrors the layout used for conflict metrics: with `s1 <= s2`,
/// `n*s1 + s2 - s1*(s1+1)/2` walks the upper triangle row-major.
#[must_use]
pub fn conflict_index(a: TransactionSource, b: TransactionSource) -> usize {
    let (s1, s2) = if a.as_index() <= b.as_index() {
        (a.as_index(), b.as_index())
    } else {
        (b.as_index(), a.as_index())
    };
    let n = TransactionSource::COUNT;
    n * s1 + s2 - s1 * (s1 + 1) / 2
}

/// Gauges sampled from the cache body at snapshot time.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Gauges {
    pub(crate) lru_bytes: u64,
    pub(crate) lru_extents: usize,
    pub(crate) lru_capacity: u64,
    pub(crate) index_bytes: u64,
    pub(crate) index_extents: usize,
    pub(crate) dirty_extents: usize,
    pub(crate) dirty_bytes: u64,
    pub(crate) last_commit: JournalSeq,
    pub(crate) backref_batches: usize,
    pub(crate) backref_inserts: usize,
    pub(crate) backref_removes: usize,
}

#[derive(Debug, Default)]
pub(crate) struct StatsState {
    pub(crate) evictions: u64,
    pub(crate) trans_created_by_src: [u64; TransactionSource::COUNT],
    pub(crate) trans_committed_by_src: [u64; TransactionSource::COUNT],
    pub(crate) trans_conflicts_by_srcs: [u64; NUM_SRC_COMB],
    pub(crate) trans_conflicts_by_unknown: [u64; TransactionSource::COUNT],
    pub(crate) query_by_src: [QueryCounters; TransactionSource::COUNT],
    pub(crate) device_reads_by_ext: [IoStat; ExtentType::COUNT],
    pub(crate) fresh_by_ext: [IoStat; ExtentType::COUNT],
    pub(crate) mutate_by_ext: [IoStat; ExtentType::COUNT],
    pub(crate) retire_by_ext: [IoStat; ExtentType::COUNT],
}

impl StatsState {
    /// Record a conflict between this transaction and the (possibly
    /// unknown) committer that invalidated its read.
    pub(crate) fn account_conflict(
        &mut self,
        ours: TransactionSource,
        theirs: Option<TransactionSource>,
    ) {
        match theirs {
            Some(theirs) => {
                self.trans_conflicts_by_srcs[conflict_index(theirs, ours)] =
                    self.trans_conflicts_by_srcs[conflict_index(theirs, ours)].saturating_add(1);
            }
            None => {
                self.trans_conflicts_by_unknown[ours.as_index()] =
                    self.trans_conflicts_by_unknown[ours.as_index()].saturating_add(1);
            }
        }
    }

    pub(crate) fn snapshot(&self, gauges: Gauges) -> CacheStats {
        CacheStats {
            lru_bytes: gauges.lru_bytes,
            lru_extents: gauges.lru_extents,
            lru_capacity: gauges.lru_capacity,
            index_bytes: gauges.index_bytes,
            index_extents: gauges.index_extents,
            dirty_extents: gauges.dirty_extents,
            dirty_bytes: gauges.dirty_bytes,
            last_commit: gauges.last_commit,
            backref_batches: gauges.backref_batches,
            backref_inserts: gauges.backref_inserts,
            backref_removes: gauges.backref_removes,
            evictions: self.evictions,
            trans_created_by_src: self.trans_created_by_src,
            trans_committed_by_src: self.trans_committed_by_src,
            trans_conflicts_by_srcs: self.trans_conflicts_by_srcs,
            trans_conflicts_by_unknown: self.trans_conflicts_by_unknown,
            query_by_src: self.query_by_src,
            device_reads_by_ext: self.device_reads_by_ext,
            fresh_by_ext: self.fresh_by_ext,
            mutate_by_ext: self.mutate_by_ext,
            retire_by_ext: self.retire_by_ext,
        }
    }
}

/// Point-in-time snapshot of cache gauges and counters.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub lru_bytes: u64,
    pub lru_extents: usize,
    pub lru_capacity: u64,
    pub index_bytes: u64,
    pub index_extents: usize,
    pub dirty_extents: usize,
    pub dirty_bytes: u64,
    pub last_commit: JournalSeq,
    pub backref_batches: usize,
    pub backref_inserts: usize,
    pub backref_removes: usize,
    pub evictions: u64,
    pub trans_created_by_src: [u64; TransactionSource::COUNT],
    pub trans_committed_by_src: [u64; TransactionSource::COUNT],
    pub trans_conflicts_by_srcs: [u64; NUM_SRC_COMB],
    pub trans_conflicts_by_unknown: [u64; TransactionSource::COUNT],
    pub query_by_src: [QueryCounters; TransactionSource::COUNT],
    pub device_reads_by_ext: [IoStat; ExtentType::COUNT],
    pub fresh_by_ext: [IoStat; ExtentType::COUNT],
    pub mutate_by_ext: [IoStat; ExtentType::COUNT],
    pub retire_by_ext: [IoStat; ExtentType::COUNT],
}

impl CacheStats {
    /// Conflicts recorded between an unordered pair of sources.
    #[must_use]
    pub fn conflicts_between(&self, a: TransactionSource, b: TransactionSource) -> u64 {
        self.trans_conflicts_by_srcs[conflict_index(a, b)]
    }

    /// Cache hit ratio over all sources, in [0.0, 1.0].
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let (access, hit) = self.query_by_src.iter().fold((0_u64, 0_u64), |acc, q| {
            (acc.0 + q.access, acc.1 + q.hit)
        });
        if access == 0 {
            0.0
        } else {
            hit as f64 / access as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_index_is_symmetric_and_dense() {
        use TransactionSource as S;
        let all = [
            S::Mutate,
            S::Read,
            S::CleanerTrim,
            S::CleanerReclaim,
            S::TrimBackref,
        ];
        let mut seen = [false; NUM_SRC_COMB];
        for &a in &all {
            for &b in &all {
                let idx = conflict_index(a, b);
                assert_eq!(idx, conflict_index(b, a));
                assert!(idx < NUM_SRC_COMB);
                seen[idx] = true;
            }
        }
        assert!(seen.iter().all(|&s| s), "triangular index must be dense");
    }

    #[test]
    fn unknown_conflicts_bucket_by_our_source() {
        let mut stats = StatsState::default();
        stats.account_conflict(TransactionSource::Read, None);
        stats.account_conflict(TransactionSource::Read, None);
        assert_eq!(
            stats.trans_conflicts_by_unknown[TransactionSource::Read.as_index()],
            2
        );
    }
}
