// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Blocking fragment queue between the transport producer and one input
//! cursor.
//!
//! A `read(n)` that lacks bytes suspends the calling thread on a condvar
//! with a bounded deadline; the wait loop re-checks the actual predicate
//! (fragment available, cancelled, no more expected, deadline passed) on
//! every wakeup, so spurious wakeups are retried transparently.
//!
//! Cancellation is checked before data: a reader racing a concurrent
//! `append`/`cancel` pair always observes the cancellation.

use super::{BufferPool, Fragment};
use crate::core::ser::{CdrError, CdrResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct QueueState {
    arrived: VecDeque<Fragment>,
    more_expected: bool,
    cancelled: Option<String>,
}

/// Producer/consumer boundary for one message's fragments, delivered in
/// arrival order. Out-of-order delivery is the transport's problem, not
/// this layer's.
#[derive(Debug)]
pub struct FragmentQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    pool: Arc<BufferPool>,
}

impl FragmentQueue {
    pub fn new(pool: Arc<BufferPool>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                arrived: VecDeque::new(),
                more_expected: true,
                cancelled: None,
            }),
            cond: Condvar::new(),
            pool,
        })
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Make newly arrived bytes available to a blocked or future read.
    ///
    /// `more_coming` mirrors the message header's more-fragments flag; once
    /// it goes false the stream is complete and further reads past the end
    /// fail with `UnexpectedEndOfData`.
    pub fn push(self: &Arc<Self>, bytes: Vec<u8>, more_coming: bool) {
        let fragment = self.pool.allocate(bytes);
        let mut state = self.state.lock();
        log::debug!(
            "[FragQ] fragment arrived ({} bytes, more_coming={}, {} queued)",
            fragment.len(),
            more_coming,
            state.arrived.len() + 1
        );
        state.arrived.push_back(fragment);
        state.more_expected = more_coming;
        drop(state);
        self.cond.notify_all();
    }

    /// Abort the exchange. Any suspended or subsequent read fails with
    /// `Cancelled` carrying this reason, even if a fragment arrives
    /// concurrently with the cancel.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = self.state.lock();
        log::debug!("[FragQ] cancelled: {}", reason);
        if state.cancelled.is_none() {
            state.cancelled = Some(reason);
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Take the next fragment, waiting up to `timeout` for it to arrive.
    pub(crate) fn next_fragment(&self, timeout: Duration) -> CdrResult<Fragment> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut state = self.state.lock();
        loop {
            // Cancellation wins over concurrently arrived data.
            if let Some(reason) = &state.cancelled {
                return Err(CdrError::Cancelled {
                    reason: reason.clone(),
                });
            }
            if let Some(fragment) = state.arrived.pop_front() {
                return Ok(fragment);
            }
            if !state.more_expected {
                return Err(CdrError::UnexpectedEndOfData);
            }
            if Instant::now() >= deadline {
                return Err(CdrError::CommFailure {
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            // Predicate re-checked above on every wakeup, spurious or not.
            self.cond.wait_until(&mut state, deadline);
        }
    }

    /// Drop every fragment still queued. Used by cursor close.
    pub fn drain(&self) {
        let mut state = self.state.lock();
        let n = state.arrived.len();
        state.arrived.clear();
        if n > 0 {
            log::debug!("[FragQ] drained {} undelivered fragments", n);
        }
    }

    /// True once the final fragment has been announced.
    pub fn is_complete(&self) -> bool {
        !self.state.lock().more_expected
    }
}
