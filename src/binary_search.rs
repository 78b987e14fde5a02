//! Generic binary search over an abstract indexable ordered sequence.
//!
//! A standalone utility with floor/ceiling queries, progress reporting,
//! and cancellation, usable against any type implementing
//! [`BinarySearchable`].

use crate::progress::{CancellationToken, NullSink, ProgressSink};

/// An abstract, random-access, ordered sequence of (key, value) pairs a
/// [`search`]/[`find_ceiling`]/[`find_floor`] call can probe without
/// knowing anything about its backing storage.
pub trait BinarySearchable<K, V> {
    fn count(&self) -> usize;
    fn key_at(&self, index: usize) -> K;
    fn value_at(&self, index: usize) -> V;
    fn compare(&self, a: &K, b: &K) -> std::cmp::Ordering;
}

/// `⌈log2(max(n,1))⌉`, i.e. the worst-case probe count for a binary
/// search over `n` elements. `0` for `n == 0`.
pub fn search_complexity(n: usize) -> u32 {
    complexity_ceil_log2(n)
}

fn complexity_ceil_log2(n: usize) -> u32 {
    if n <= 1 {
        return 0;
    }
    n.next_power_of_two().trailing_zeros()
}

/// Binary search for an exact key match. Returns `(found, index)`; index
/// is `usize::MAX` on a miss (an unsigned stand-in for a `-1` sentinel).
pub fn try_find_index<K, V, S: BinarySearchable<K, V>>(
    seq: &S,
    key: &K,
    progress: Option<&mut dyn ProgressSink>,
    cancel: &CancellationToken,
) -> (bool, usize) {
    let mut null = NullSink;
    let progress: &mut dyn ProgressSink = progress.unwrap_or(&mut null);
    let n = seq.count();
    let complexity = complexity_ceil_log2(n);
    if n == 0 {
        progress.report(0, complexity);
        return (false, usize::MAX);
    }
    let mut lo = 0usize;
    let mut hi = n; // exclusive
    let mut probes = 0u64;
    while lo < hi {
        if cancel.is_cancelled() {
            return (false, usize::MAX);
        }
        let mid = lo + (hi - lo) / 2;
        probes += 1;
        let ord = seq.compare(&seq.key_at(mid), key);
        progress.report(probes.min(complexity as u64), complexity as u64);
        match ord {
            std::cmp::Ordering::Equal => {
                progress.report(complexity as u64, complexity as u64);
                return (true, mid);
            }
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
        }
    }
    (false, usize::MAX)
}

/// Binary search returning the value at an exact key match.
pub fn try_find_value<K, V, S: BinarySearchable<K, V>>(
    seq: &S,
    key: &K,
    progress: Option<&mut dyn ProgressSink>,
    cancel: &CancellationToken,
) -> Option<V> {
    let (found, idx) = try_find_index(seq, key, progress, cancel);
    if found {
        Some(seq.value_at(idx))
    } else {
        None
    }
}

/// The smallest key `>= key`, i.e. the ceiling. Returns `(found, index,
/// key)` when such a key exists.
pub fn try_find_ceiling<K: Clone, V, S: BinarySearchable<K, V>>(
    seq: &S,
    key: &K,
    mut progress: Option<&mut dyn ProgressSink>,
    cancel: &CancellationToken,
) -> Option<(usize, K)> {
    let n = seq.count();
    if n == 0 {
        if let Some(p) = progress.as_deref_mut() {
            p.report(0, 0);
        }
        return None;
    }
    let complexity = complexity_ceil_log2(n) as u64;
    let mut lo = 0usize;
    let mut hi = n;
    let mut probes = 0u64;
    let mut best: Option<usize> = None;
    while lo < hi {
        if cancel.is_cancelled() {
            return None;
        }
        let mid = lo + (hi - lo) / 2;
        probes += 1;
        let ord = seq.compare(&seq.key_at(mid), key);
        if let Some(p) = progress.as_deref_mut() {
            p.report(probes.min(complexity), complexity);
        }
        match ord {
            std::cmp::Ordering::Equal => {
                if let Some(p) = progress.as_deref_mut() {
                    p.report(complexity, complexity);
                }
                return Some((mid, seq.key_at(mid)));
            }
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => {
                best = Some(mid);
                hi = mid;
            }
        }
    }
    let idx = best?;
    if let Some(p) = progress.as_deref_mut() {
        p.report(complexity, complexity);
    }
    Some((idx, seq.key_at(idx)))
}

/// The greatest key `<= key`, i.e. the floor. Returns `(found, index,
/// key)` when such a key exists.
pub fn try_find_floor<K: Clone, V, S: BinarySearchable<K, V>>(
    seq: &S,
    key: &K,
    mut progress: Option<&mut dyn ProgressSink>,
    cancel: &CancellationToken,
) -> Option<(usize, K)> {
    let n = seq.count();
    if n == 0 {
        if let Some(p) = progress.as_deref_mut() {
            p.report(0, 0);
        }
        return None;
    }
    let complexity = complexity_ceil_log2(n) as u64;
    let mut lo = 0usize;
    let mut hi = n;
    let mut probes = 0u64;
    let mut best: Option<usize> = None;
    while lo < hi {
        if cancel.is_cancelled() {
            return None;
        }
        let mid = lo + (hi - lo) / 2;
        probes += 1;
        let ord = seq.compare(&seq.key_at(mid), key);
        if let Some(p) = progress.as_deref_mut() {
            p.report(probes.min(complexity), complexity);
        }
        match ord {
            std::cmp::Ordering::Equal => {
                if let Some(p) = progress.as_deref_mut() {
                    p.report(complexity, complexity);
                }
                return Some((mid, seq.key_at(mid)));
            }
            std::cmp::Ordering::Less => {
                best = Some(mid);
                lo = mid + 1;
            }
            std::cmp::Ordering::Greater => hi = mid,
        }
    }
    let idx = best?;
    if let Some(p) = progress.as_deref_mut() {
        p.report(complexity, complexity);
    }
    Some((idx, seq.key_at(idx)))
}
