#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical address on the storage substrate.
///
/// Absolute addresses identify a durable location and are the only form
/// allowed into the extent index. Relative addresses are placeholders
/// handed out for freshly allocated extents and are only meaningful
/// within the transaction that allocated them; they are resolved to
/// absolute addresses at commit.
///
/// Variant order gives `Absolute < Relative < Null`, which keeps
/// absolute addresses contiguous in ordered containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Paddr {
    Absolute(u64),
    Relative(u64),
    Null,
}

impl Paddr {
    pub const NULL: Self = Self::Null;

    #[must_use]
    pub fn is_absolute(self) -> bool {
        matches!(self, Self::Absolute(_))
    }

    #[must_use]
    pub fn is_relative(self) -> bool {
        matches!(self, Self::Relative(_))
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        matches!(self, Self::Null)
    }

    /// Add a byte count, staying within the same address space.
    ///
    /// Returns `None` on overflow or when applied to `Null`.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        match self {
            Self::Absolute(offset) => offset.checked_add(bytes).map(Self::Absolute),
            Self::Relative(offset) => offset.checked_add(bytes).map(Self::Relative),
            Self::Null => None,
        }
    }
}

impl fmt::Display for Paddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute(offset) => write!(f, "{offset:#x}"),
            Self::Relative(offset) => write!(f, "~{offset:#x}"),
            Self::Null => write!(f, "NULL"),
        }
    }
}

/// Logical address in the object-store namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Laddr(pub u64);

impl fmt::Display for Laddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{:#x}", self.0)
    }
}

/// Total-order identifier for committed journal records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JournalSeq(pub u64);

impl JournalSeq {
    pub const MIN: Self = Self(0);
}

impl fmt::Display for JournalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq={}", self.0)
    }
}

/// Closed enumeration of on-disk extent structures.
///
/// Discriminants are contiguous so fixed per-type statistics arrays can
/// be indexed with `as_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExtentType {
    Root = 0,
    LaddrInternal = 1,
    LaddrLeaf = 2,
    OmapInner = 3,
    OmapLeaf = 4,
    OnodeBlock = 5,
    BackrefInternal = 6,
    BackrefLeaf = 7,
    Data = 8,
    RetiredPlaceholder = 9,
}

impl ExtentType {
    pub const COUNT: usize = 10;

    #[must_use]
    pub fn as_index(self) -> usize {
        self as usize
    }

    /// Extents addressed from the logical namespace (carry an `Laddr`).
    #[must_use]
    pub fn is_logical(self) -> bool {
        matches!(
            self,
            Self::OmapInner | Self::OmapLeaf | Self::OnodeBlock | Self::Data
        )
    }

    #[must_use]
    pub fn is_backref_node(self) -> bool {
        matches!(self, Self::BackrefInternal | Self::BackrefLeaf)
    }

    #[must_use]
    pub fn is_root(self) -> bool {
        matches!(self, Self::Root)
    }

    #[must_use]
    pub fn is_placeholder(self) -> bool {
        matches!(self, Self::RetiredPlaceholder)
    }
}

/// Enumerated origin of a transaction, used for statistics keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionSource {
    Mutate = 0,
    Read = 1,
    CleanerTrim = 2,
    CleanerReclaim = 3,
    TrimBackref = 4,
}

impl TransactionSource {
    pub const COUNT: usize = 5;

    #[must_use]
    pub fn as_index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TransactionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mutate => "mutate",
            Self::Read => "read",
            Self::CleanerTrim => "cleaner_trim",
            Self::CleanerReclaim => "cleaner_reclaim",
            Self::TrimBackref => "trim_backref",
        };
        write!(f, "{name}")
    }
}

/// Placement hint passed through to the extent placement manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlacementHint {
    #[default]
    Hot,
    Cold,
    Rewrite,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paddr_ordering_keeps_absolute_first() {
        assert!(Paddr::Absolute(u64::MAX) < Paddr::Relative(0));
        assert!(Paddr::Relative(u64::MAX) < Paddr::Null);
        assert!(Paddr::Absolute(0x1000) < Paddr::Absolute(0x2000));
    }

    #[test]
    fn paddr_checked_add_respects_address_space() {
        assert_eq!(
            Paddr::Absolute(0x1000).checked_add(0x1000),
            Some(Paddr::Absolute(0x2000))
        );
        assert_eq!(
            Paddr::Relative(8).checked_add(8),
            Some(Paddr::Relative(16))
        );
        assert_eq!(Paddr::Absolute(u64::MAX).checked_add(1), None);
        assert_eq!(Paddr::Null.checked_add(1), None);
    }

    #[test]
    fn extent_type_indices_are_contiguous() {
        let all = [
            ExtentType::Root,
            ExtentType::LaddrInternal,
            ExtentType::LaddrLeaf,
            ExtentType::OmapInner,
            ExtentType::OmapLeaf,
            ExtentType::OnodeBlock,
            ExtentType::BackrefInternal,
            ExtentType::BackrefLeaf,
            ExtentType::Data,
            ExtentType::RetiredPlaceholder,
        ];
        assert_eq!(all.len(), ExtentType::COUNT);
        for (expected, ty) in all.iter().enumerate() {
            assert_eq!(ty.as_index(), expected);
        }
    }

    #[test]
    fn source_indices_are_contiguous() {
        let all = [
            TransactionSource::Mutate,
            TransactionSource::Read,
            TransactionSource::CleanerTrim,
            TransactionSource::CleanerReclaim,
            TransactionSource::TrimBackref,
        ];
        assert_eq!(all.len(), TransactionSource::COUNT);
        for (expected, src) in all.iter().enumerate() {
            assert_eq!(src.as_index(), expected);
        }
    }
}
