// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CDR serialization: error taxonomy, code sets and the two cursors.

pub mod decoder;
pub mod encoder;

pub use decoder::CdrDecoder;
pub use encoder::{CdrEncoder, FragmentSink};

use std::fmt;

/// Marshaling error taxonomy.
///
/// Every variant is fatal to the current message; there is no
/// partial-message recovery. Fragment release still happens on all error
/// paths (verified by the buffer accounting tests).
#[derive(Debug, Clone)]
pub enum CdrError {
    /// Stream truncated with no further fragments promised.
    UnexpectedEndOfData,
    /// Structurally invalid encoding: bad tag, bad chunk length, end-tag
    /// violation, unresolvable repository id.
    Marshal { reason: String },
    /// Back-reference to an offset that was never encoded/decoded.
    Indirection { offset: i64 },
    /// Caller passed null or otherwise invalid data to a write call.
    InvalidArgument { reason: String },
    /// Wait for a fragment exceeded the configured timeout.
    CommFailure { waited_ms: u64 },
    /// The read was cancelled by an explicit `cancel(reason)` call.
    Cancelled { reason: String },
}

impl fmt::Display for CdrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CdrError::UnexpectedEndOfData => write!(f, "unexpected end of data"),
            CdrError::Marshal { reason } => write!(f, "marshal error: {}", reason),
            CdrError::Indirection { offset } => {
                write!(f, "indirection to unknown offset {}", offset)
            }
            CdrError::InvalidArgument { reason } => write!(f, "invalid argument: {}", reason),
            CdrError::CommFailure { waited_ms } => {
                write!(f, "fragment wait timed out after {} ms", waited_ms)
            }
            CdrError::Cancelled { reason } => write!(f, "cancelled: {}", reason),
        }
    }
}

impl std::error::Error for CdrError {}

pub type CdrResult<T> = std::result::Result<T, CdrError>;

impl CdrError {
    /// Shorthand for a `Marshal` error with a formatted reason.
    pub(crate) fn marshal(reason: impl Into<String>) -> Self {
        CdrError::Marshal {
            reason: reason.into(),
        }
    }
}

/// Negotiated narrow code set for `char` and `string`.
///
/// `char` is always a single octet on the wire; the code set governs how
/// `string` bodies are encoded and validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeSet {
    /// ISO 8859-1: one octet per character, characters above U+00FF rejected.
    Latin1,
    /// UTF-8: multi-byte string bodies, full Unicode range.
    Utf8,
}

/// Upper bound on a single up-front read buffer allocation. Wire-declared
/// lengths are untrusted until the bytes actually arrive; anything larger
/// is filled in steps of this size so a truncated stream fails with
/// [`CdrError::UnexpectedEndOfData`] before the memory is committed.
pub(crate) const MAX_EAGER_ALLOC: usize = 64 * 1024;

/// Round `offset` up to the next multiple of `alignment` (a power of two).
pub(crate) fn align_up(offset: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    let mask = alignment - 1;
    (offset + mask) & !mask
}
