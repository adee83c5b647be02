// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fragment buffers and pool accounting.
//!
//! A [`Fragment`] is one physical delivery unit of a logical message. The
//! pool does not recycle allocations; it exists to enforce and observe the
//! release discipline: every delivered fragment is returned exactly once,
//! the moment no cursor (and no outstanding mark) still needs its bytes.

pub mod queue;

pub use queue::FragmentQueue;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Accounting home for fragments of one message exchange.
///
/// `delivered` counts fragments handed out by [`BufferPool::allocate`];
/// `released` counts fragments returned. Release is tied to ownership:
/// dropping a [`Fragment`] is the one and only release, so double release
/// is unrepresentable.
#[derive(Debug, Default)]
pub struct BufferPool {
    delivered: AtomicUsize,
    released: AtomicUsize,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wrap newly arrived bytes in a pool-tracked fragment.
    pub fn allocate(self: &Arc<Self>, bytes: Vec<u8>) -> Fragment {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Fragment {
            bytes,
            pool: Arc::clone(self),
        }
    }

    /// Fragments handed out so far.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Fragments returned so far.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    /// Fragments currently held by a cursor or queue.
    pub fn outstanding(&self) -> usize {
        self.delivered() - self.released()
    }
}

/// An immutable byte buffer owned by exactly one holder at a time.
#[derive(Debug)]
pub struct Fragment {
    bytes: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Fragment {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for Fragment {
    fn drop(&mut self) {
        self.pool.released.fetch_add(1, Ordering::Relaxed);
        log::trace!("[Pool] fragment released ({} bytes)", self.bytes.len());
    }
}
