#![forbid(unsafe_code)]
//! Error types for silt.
//!
//! Defines `SiltError` and a `Result<T>` alias used throughout the
//! workspace.

use silt_types::{Paddr, TransactionSource};
use thiserror::Error;

/// Unified error type for all silt cache operations.
#[derive(Debug, Error)]
pub enum SiltError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("address {paddr} was retired by this transaction")]
    RetiredInTxn { paddr: Paddr },

    #[error(
        "transaction conflict: {ours} transaction read an extent at {paddr} \
         invalidated by a {theirs:?} transaction"
    )]
    TransactionConflict {
        ours: TransactionSource,
        theirs: Option<TransactionSource>,
        paddr: Paddr,
    },

    #[error("inconsistent cache state: {0}")]
    State(String),
}

/// Result alias using `SiltError`.
pub type Result<T> = std::result::Result<T, SiltError>;
