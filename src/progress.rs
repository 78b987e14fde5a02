//! Cooperative cancellation and progress reporting.
//!
//! Long-running operations (store creation, inflate/deflate, validation,
//! binary search, B-tree traversal) poll a [`CancellationToken`] at the
//! granularity named in each operation's doc comment and, if given a
//! [`ProgressSink`], report `(current, total)` ticks through it.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A flag another thread (or the same thread, later) can raise to abort an
/// in-progress call. Cloning shares the same underlying flag.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    /// A token that can never be cancelled; the zero-cost default for
    /// callers that don't need cancellation.
    pub fn none() -> Self {
        CancellationToken::new()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives `(current, total)` progress ticks. `total` is the value
/// `CalculateSearchComplexity`/page-count/etc. computed up front; it does
/// not change mid-call.
pub trait ProgressSink {
    fn report(&mut self, current: u64, total: u64);
}

impl<F: FnMut(u64, u64)> ProgressSink for F {
    fn report(&mut self, current: u64, total: u64) {
        (self)(current, total)
    }
}

/// A sink that discards every tick; used when callers pass `None`.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&mut self, _current: u64, _total: u64) {}
}

/// Records every tick it receives, for tests that assert on the exact
/// reported sequence (see `binary_search` module tests, which check the
/// "trailing duplicated tick at the final complexity" contract).
#[derive(Clone, Default)]
pub struct RecordingSink {
    ticks: Rc<Cell<Vec<(u64, u64)>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            ticks: Rc::new(Cell::new(Vec::new())),
        }
    }

    pub fn ticks(&self) -> Vec<(u64, u64)> {
        let v = self.ticks.take();
        let out = v.clone();
        self.ticks.set(v);
        out
    }
}

impl ProgressSink for RecordingSink {
    fn report(&mut self, current: u64, total: u64) {
        let mut v = self.ticks.take();
        v.push((current, total));
        self.ticks.set(v);
    }
}
