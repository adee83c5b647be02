// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Repository-id to decode-strategy registry.
//!
//! The wire self-describes a value only down to its repository id; the
//! field layout behind that id is application knowledge and lives here.
//! Lookups are concurrent: many decoder threads share one registry.

use dashmap::DashMap;
use std::sync::Arc;

/// How to decode the body behind a repository id.
#[derive(Debug, Clone)]
pub enum DecodeStrategy {
    /// Ordered field layout, read one field at a time.
    Fields(Vec<FieldSpec>),
    /// Custom-marshaled: a stream-format header then opaque payload.
    Custom,
}

/// One field of a [`DecodeStrategy::Fields`] layout.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: TypeKind,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Wire type of a field, without a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Octet,
    Boolean,
    Char,
    WChar,
    Short,
    UShort,
    Long,
    ULong,
    LongLong,
    ULongLong,
    Float,
    Double,
    Str,
    WStr,
    Value,
}

/// Concurrent map from repository id to decode strategy.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    strategies: DashMap<String, Arc<DecodeStrategy>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the strategy for a repository id.
    pub fn register(&self, repo_id: impl Into<String>, strategy: DecodeStrategy) {
        let repo_id = repo_id.into();
        log::debug!("[Registry] register {}", repo_id);
        self.strategies.insert(repo_id, Arc::new(strategy));
    }

    pub fn resolve(&self, repo_id: &str) -> Option<Arc<DecodeStrategy>> {
        self.strategies.get(repo_id).map(|e| Arc::clone(e.value()))
    }

    /// Resolve against a most-to-least-derived id list: the first id with
    /// a registered strategy wins, allowing truncation to a known base.
    pub fn resolve_first(&self, repo_ids: &[String]) -> Option<(usize, Arc<DecodeStrategy>)> {
        repo_ids
            .iter()
            .enumerate()
            .find_map(|(i, id)| self.resolve(id).map(|s| (i, s)))
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}
