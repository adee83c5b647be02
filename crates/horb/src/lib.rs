// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # HORB - GIOP/CDR marshaling engine
//!
//! A pure Rust implementation of the CORBA CDR (Common Data Representation)
//! encoding rules and the GIOP message framing that carries them: scalars,
//! strings, arrays and polymorphic value graphs, serialized into fragmentable,
//! versioned wire messages and decoded back with object identity preserved
//! across back-references.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                     Value Graph Codec                        |
//! |   chunking | end tags | indirection tables | custom values   |
//! +--------------------------------------------------------------+
//! |                  Scalar & Text Codec                         |
//! |   aligned primitives | narrow/wide strings | bulk arrays     |
//! +--------------------------------------------------------------+
//! |                Fragment & Buffer Manager                     |
//! |   pool accounting | blocking reads | cancel | mark/reset     |
//! +--------------------------------------------------------------+
//! |                  Stream Policy Layer                         |
//! |   GIOP 1.0 / 1.1 / 1.2 | legacy ORB compatibility flags      |
//! +--------------------------------------------------------------+
//! ```
//!
//! Every version-sensitive decision goes through [`protocol::policy`]; the
//! codec layers never hard-code protocol version checks.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`CdrEncoder`] | Output cursor: application data to wire bytes |
//! | [`CdrDecoder`] | Input cursor: wire bytes (possibly arriving as fragments) to data |
//! | [`FragmentQueue`] | Producer/consumer boundary for asynchronously delivered fragments |
//! | [`ValueRef`] | Shared handle to a node in a marshalable object graph |
//! | [`TypeRegistry`] | Repository-id to decode-strategy resolution |

/// Global configuration (protocol constants, runtime knobs, legacy flags).
pub mod config;
/// Core codec implementation (serialization, buffers, value graphs).
pub mod core;
/// GIOP protocol framing (message headers, reassembly, stream policy).
pub mod protocol;

pub use crate::config::{LegacyConfig, OrbConfig};
pub use crate::core::buffer::{BufferPool, Fragment, FragmentQueue};
pub use crate::core::ser::{CdrDecoder, CdrEncoder, CdrError, CdrResult, CodeSet, FragmentSink};
pub use crate::core::value::{
    DecodeStrategy, Field, FieldKind, FieldSpec, TypeKind, TypeRegistry, ValueBody, ValueCell,
    ValueRef,
};
pub use crate::protocol::giop::{msg_type, MessageHeader, Reassembler};
pub use crate::protocol::policy::{stream_policy, GiopVersion, StreamPolicy};

/// HORB version string.
pub const VERSION: &str = "0.2.0";
