// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Value graph model and codec.
//!
//! Values are reference types: the same [`ValueRef`] written twice encodes
//! once plus an indirection, and cycles decode back into cycles. A value's
//! body lives behind a lock so the decoder can register the cell (for
//! indirections targeting it) before its fields are read.

pub mod decode;
pub mod encode;
pub mod registry;

pub use registry::{DecodeStrategy, FieldSpec, TypeKind, TypeRegistry};

use parking_lot::RwLock;
use std::sync::Arc;

/// Base pattern of a value tag; the low octet holds the flag bits.
pub const VALUE_TAG_BASE: u32 = 0x7FFF_FF00;
/// Mask isolating the base pattern from the flag bits.
pub const VALUE_TAG_MASK: u32 = 0xFFFF_FF00;
/// Tag announcing a back-reference instead of an inline encoding.
pub const INDIRECTION_TAG: u32 = 0xFFFF_FFFF;

/// Tag bit: a codebase URL precedes the repository id.
pub const TAG_CODEBASE: u32 = 0x01;
/// Tag bits 1-2: repository id form. `0b01` is a single id, `0b11` a
/// counted list of ids (most to least derived).
pub const REPO_ID_MASK: u32 = 0x06;
pub const REPO_ID_SINGLE: u32 = 0x02;
pub const REPO_ID_LIST: u32 = 0x06;
/// Tag bit: the body is chunked and closed by an end tag.
pub const TAG_CHUNKED: u32 = 0x08;

/// Chunk lengths must stay below the value tag space so a reader can tell
/// a chunk continuation from a nested value tag.
pub const MAX_CHUNK_LEN: u32 = VALUE_TAG_BASE;

/// Shared handle to a value graph node. Identity (pointer equality) is
/// what the wire-level sharing and cycle rules preserve.
pub type ValueRef = Arc<ValueCell>;

/// One node of a value graph.
#[derive(Debug)]
pub struct ValueCell {
    repo_id: String,
    codebase: Option<String>,
    chunked: bool,
    body: RwLock<ValueBody>,
}

impl ValueCell {
    /// Field-structured value. Chunking is opt-in via
    /// [`ValueCell::new_chunked`]; custom-marshaled bodies always chunk.
    pub fn new(repo_id: impl Into<String>, fields: Vec<Field>) -> ValueRef {
        Arc::new(Self {
            repo_id: repo_id.into(),
            codebase: None,
            chunked: false,
            body: RwLock::new(ValueBody::Fields(fields)),
        })
    }

    pub fn new_chunked(repo_id: impl Into<String>, fields: Vec<Field>) -> ValueRef {
        Arc::new(Self {
            repo_id: repo_id.into(),
            codebase: None,
            chunked: true,
            body: RwLock::new(ValueBody::Fields(fields)),
        })
    }

    /// Custom-marshaled value: a stream-format header followed by opaque
    /// payload bytes.
    pub fn new_custom(
        repo_id: impl Into<String>,
        format: u8,
        default_data: bool,
        data: Vec<u8>,
    ) -> ValueRef {
        Arc::new(Self {
            repo_id: repo_id.into(),
            codebase: None,
            chunked: true,
            body: RwLock::new(ValueBody::Custom {
                format,
                default_data,
                data,
            }),
        })
    }

    /// Placeholder cell registered by the decoder before the body is read,
    /// so indirections (including cyclic ones) resolve to it.
    pub(crate) fn pending(repo_id: String, codebase: Option<String>, chunked: bool) -> ValueRef {
        Arc::new(Self {
            repo_id,
            codebase,
            chunked,
            body: RwLock::new(ValueBody::Pending),
        })
    }

    pub fn with_codebase(&self, codebase: impl Into<String>) -> ValueRef {
        Arc::new(Self {
            repo_id: self.repo_id.clone(),
            codebase: Some(codebase.into()),
            chunked: self.chunked,
            body: RwLock::new(self.body.read().clone()),
        })
    }

    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    pub fn codebase(&self) -> Option<&str> {
        self.codebase.as_deref()
    }

    pub fn chunked(&self) -> bool {
        self.chunked
    }

    /// Snapshot of the body.
    pub fn body(&self) -> ValueBody {
        self.body.read().clone()
    }

    pub(crate) fn set_body(&self, body: ValueBody) {
        *self.body.write() = body;
    }

    /// Mutate the fields in place. `None` is returned unchanged if the
    /// body is not field-structured.
    pub fn with_fields_mut<R>(&self, f: impl FnOnce(&mut Vec<Field>) -> R) -> Option<R> {
        match &mut *self.body.write() {
            ValueBody::Fields(fields) => Some(f(fields)),
            _ => None,
        }
    }
}

/// Body of a value graph node.
#[derive(Debug, Clone)]
pub enum ValueBody {
    /// Still being decoded; observable only through a cycle.
    Pending,
    /// Ordered named fields.
    Fields(Vec<Field>),
    /// Custom-marshaled payload with its stream-format header.
    Custom {
        format: u8,
        default_data: bool,
        data: Vec<u8>,
    },
    /// Chunked value of an unregistered type, skipped over with its
    /// chunk payload retained.
    Opaque(Vec<u8>),
}

/// A named field of a value.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.kind == other.kind
    }
}

/// A field's type and payload.
#[derive(Debug, Clone)]
pub enum FieldKind {
    Octet(u8),
    Boolean(bool),
    Char(char),
    WChar(char),
    Short(i16),
    UShort(u16),
    Long(i32),
    ULong(u32),
    LongLong(i64),
    ULongLong(u64),
    Float(f32),
    Double(f64),
    Str(String),
    WStr(String),
    /// Nested value reference; `None` is the null value.
    Value(Option<ValueRef>),
}

impl PartialEq for FieldKind {
    fn eq(&self, other: &Self) -> bool {
        use FieldKind::*;
        match (self, other) {
            (Octet(a), Octet(b)) => a == b,
            (Boolean(a), Boolean(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (WChar(a), WChar(b)) => a == b,
            (Short(a), Short(b)) => a == b,
            (UShort(a), UShort(b)) => a == b,
            (Long(a), Long(b)) => a == b,
            (ULong(a), ULong(b)) => a == b,
            (LongLong(a), LongLong(b)) => a == b,
            (ULongLong(a), ULongLong(b)) => a == b,
            // Bit equality so NaN payloads round-trip comparably.
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (Str(a), Str(b)) => a == b,
            (WStr(a), WStr(b)) => a == b,
            // Values compare by identity, matching the sharing semantics.
            (Value(a), Value(b)) => match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            },
            _ => false,
        }
    }
}
