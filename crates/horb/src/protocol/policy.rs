// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream policy table.
//!
//! One small table, keyed by GIOP version and the legacy compatibility
//! flags, answers every version-sensitive question the codec layers have.
//! Adding a new protocol version is a localized change here; the scalar,
//! text, fragment and value layers consult the resulting [`StreamPolicy`]
//! instead of hard-coding version checks.

use crate::config::LegacyConfig;

/// GIOP protocol versions supported by this engine, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GiopVersion {
    V1_0,
    V1_1,
    V1_2,
}

impl GiopVersion {
    /// Major version byte (always 1 for the versions modeled here).
    pub const fn major(self) -> u8 {
        1
    }

    /// Minor version byte as it appears on the wire.
    pub const fn minor(self) -> u8 {
        match self {
            GiopVersion::V1_0 => 0,
            GiopVersion::V1_1 => 1,
            GiopVersion::V1_2 => 2,
        }
    }

    /// Parse a wire version pair. Returns `None` for unknown versions.
    pub fn from_parts(major: u8, minor: u8) -> Option<Self> {
        match (major, minor) {
            (1, 0) => Some(GiopVersion::V1_0),
            (1, 1) => Some(GiopVersion::V1_1),
            (1, 2) => Some(GiopVersion::V1_2),
            _ => None,
        }
    }
}

impl std::fmt::Display for GiopVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// Behavioral switches derived once per stream from the GIOP version and
/// the legacy flags, then consulted by all codec layers.
#[derive(Debug, Clone)]
pub struct StreamPolicy {
    /// Version this policy was derived from.
    pub version: GiopVersion,
    /// Are `wchar`/`wstring` permitted at all on this stream?
    pub wide_types_allowed: bool,
    /// Is each `wchar` length-prefixed and carrying its own byte-order
    /// marker (GIOP 1.2), decodable independent of the message order?
    pub wchar_length_prefixed: bool,
    /// Does the `wstring` length prefix count bytes with no terminator
    /// (GIOP 1.2) rather than code units including a trailing NUL (1.1)?
    pub wstring_counts_bytes: bool,
    /// Wide data encoded as bare fixed-width code units with no markers
    /// (GIOP 1.0 talking to a pre-patch ORB).
    pub legacy_wide_fixed_width: bool,
    /// Custom-marshaled values carry the format-2 empty-optional-data
    /// marker after their fields.
    pub empty_optional_marker: bool,
    /// Force one 8-byte alignment at the start of the message body.
    pub initial_eight_byte_align: bool,
    /// Tolerate an end tag smaller in magnitude than the open-value depth
    /// by treating it as closing exactly one level.
    pub lenient_end_tags: bool,
    /// May this stream be split across multiple physical fragments?
    pub fragments_allowed: bool,
}

/// Derive the policy for a stream. This is the only place in the crate
/// where GIOP versions are compared.
pub fn stream_policy(version: GiopVersion, legacy: &LegacyConfig) -> StreamPolicy {
    let (wide, prefixed, counts_bytes, fixed_width, fragments) = match version {
        GiopVersion::V1_0 => (legacy.pre_patch_orb, false, false, legacy.pre_patch_orb, false),
        GiopVersion::V1_1 => (true, false, false, false, true),
        GiopVersion::V1_2 => (true, true, true, false, true),
    };
    StreamPolicy {
        version,
        wide_types_allowed: wide,
        wchar_length_prefixed: prefixed,
        wstring_counts_bytes: counts_bytes,
        legacy_wide_fixed_width: fixed_width,
        empty_optional_marker: legacy.stream_format_2,
        initial_eight_byte_align: version == GiopVersion::V1_2,
        lenient_end_tags: legacy.lenient_end_tags || legacy.pre_patch_orb,
        fragments_allowed: fragments,
    }
}
