// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HORB Global Configuration - Single Source of Truth
//!
//! This module centralizes GIOP wire constants and runtime configuration.
//! **NEVER hardcode elsewhere!**
//!
//! - **Level 1 (Static)**: Compile-time constants (GIOP spec values)
//! - **Level 2 (Dynamic)**: [`OrbConfig`] for per-connection runtime config

use crate::core::ser::CodeSet;
use crate::protocol::policy::GiopVersion;
use std::time::Duration;

/// GIOP message header length in bytes (magic + version + flags + type + length).
pub const GIOP_HEADER_LEN: usize = 12;

/// Default output buffer capacity before a fragment flush is forced.
///
/// Matches the classic ORB internal buffer size of 1 KiB.
pub const DEFAULT_FRAGMENT_SIZE: usize = 1024;

/// Smallest permitted fragment size.
///
/// Below this the per-fragment header overhead dominates and chunk length
/// slots could no longer be guaranteed to fit in one fragment.
pub const MIN_FRAGMENT_SIZE: usize = 64;

/// Default bounded wait for a not-yet-arrived fragment (the classic ORB
/// fragment read timeout of 18 seconds).
pub const DEFAULT_FRAGMENT_TIMEOUT_MS: u64 = 18_000;

/// Compatibility switches for talking to older or buggy peer ORBs.
///
/// These are orthogonal to the GIOP version: the version selects the wire
/// grammar, the legacy flags select tolerances within it.
#[derive(Debug, Clone)]
pub struct LegacyConfig {
    /// Peer is a pre-patch ORB: wide characters are permitted even on
    /// GIOP 1.0 (as bare fixed-width code units) and end-tag checking is
    /// relaxed (see `lenient_end_tags`).
    pub pre_patch_orb: bool,
    /// Custom-marshal stream format version 2 (adds the empty-optional-data
    /// marker after custom-marshaled fields). Format 1 when false.
    pub stream_format_2: bool,
    /// Accept an end tag whose magnitude is smaller than the current
    /// open-value depth, treating it as a close-one-level instruction.
    ///
    /// Kept as an explicit flag rather than implied behavior so the
    /// tolerance can be retired independently of `pre_patch_orb`.
    pub lenient_end_tags: bool,
}

impl Default for LegacyConfig {
    fn default() -> Self {
        Self {
            pre_patch_orb: false,
            stream_format_2: true,
            lenient_end_tags: false,
        }
    }
}

/// Per-connection runtime configuration consumed by encoders and decoders.
#[derive(Debug, Clone)]
pub struct OrbConfig {
    /// Protocol version negotiated for this connection.
    pub giop_version: GiopVersion,
    /// Byte order for messages this side produces. Decoders take the order
    /// from each incoming message header instead.
    pub little_endian: bool,
    /// Output buffer capacity; reaching it triggers a fragment flush.
    pub fragment_size: usize,
    /// Bounded wait for the next fragment on a blocking read.
    pub fragment_timeout: Duration,
    /// Negotiated narrow code set for `char`/`string`.
    pub narrow_code_set: CodeSet,
    /// Legacy-ORB compatibility switches.
    pub legacy: LegacyConfig,
}

impl Default for OrbConfig {
    fn default() -> Self {
        Self {
            giop_version: GiopVersion::V1_2,
            little_endian: false,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            fragment_timeout: Duration::from_millis(DEFAULT_FRAGMENT_TIMEOUT_MS),
            narrow_code_set: CodeSet::Latin1,
            legacy: LegacyConfig::default(),
        }
    }
}

impl OrbConfig {
    /// Clamp the fragment size to the supported minimum.
    pub fn effective_fragment_size(&self) -> usize {
        self.fragment_size.max(MIN_FRAGMENT_SIZE)
    }
}
