//! `DataRegion` and `DataRegionSet`: closed integer intervals over byte
//! offsets, and a minimal disjoint cover of them.
//!
//! `CachedPageStorage` uses a `DataRegionSet` per cached page to track
//! which byte ranges are known-coherent ("cached") and which are dirty.
//! Expressed here as a plain sorted `Vec` of disjoint intervals.

use crate::error::{Result, StorageError};
use std::hash::{Hash, Hasher};

/// A closed interval `[first, last]` over non-negative integer offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataRegion {
    first: u64,
    last: u64,
}

impl DataRegion {
    /// Fails if `last < first`. `first`/`last` are `u64`, so a negative
    /// start index cannot arise in this representation.
    pub fn new(first: u64, last: u64) -> Result<Self> {
        if last < first {
            return Err(StorageError::out_of_range(
                "last",
                format!("last ({last}) must be >= first ({first})"),
            ));
        }
        Ok(DataRegion { first, last })
    }

    pub fn first(&self) -> u64 {
        self.first
    }

    pub fn last(&self) -> u64 {
        self.last
    }

    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    pub fn is_empty(&self) -> bool {
        false // a DataRegion always covers at least one offset
    }

    pub fn contains_index(&self, idx: u64) -> bool {
        self.first <= idx && idx <= self.last
    }

    pub fn contains_region(&self, other: &DataRegion) -> bool {
        self.first <= other.first && other.last <= self.last
    }

    pub fn intersects(&self, other: &DataRegion) -> bool {
        self.first <= other.last && other.first <= self.last
    }

    pub fn is_adjacent(&self, other: &DataRegion) -> bool {
        self.last.saturating_add(1) == other.first || other.last.saturating_add(1) == self.first
    }

    /// Clips `self` to the intersection with `q`. Returns `None` if they
    /// do not intersect.
    pub fn clip(&self, q: &DataRegion) -> Option<DataRegion> {
        if !self.intersects(q) {
            return None;
        }
        Some(DataRegion {
            first: self.first.max(q.first),
            last: self.last.min(q.last),
        })
    }

    /// Combines `self` with `other`, which must intersect or be adjacent.
    pub fn combine_with(&self, other: &DataRegion) -> Result<DataRegion> {
        if !self.intersects(other) && !self.is_adjacent(other) {
            return Err(StorageError::argument(format!(
                "{self:?} and {other:?} neither intersect nor are adjacent"
            )));
        }
        Ok(DataRegion {
            first: self.first.min(other.first),
            last: self.last.max(other.last),
        })
    }
}

/// A set of pairwise non-adjacent, non-intersecting `DataRegion`s,
/// maintained as a sorted vector. Adding a region coalesces every
/// intersecting or adjacent member into one; removing a region trims or
/// splits members so no byte of it remains covered.
#[derive(Clone, Debug, Default)]
pub struct DataRegionSet {
    regions: Vec<DataRegion>,
    /// Bumped on every mutation; enumerators capture it and fail fast if
    /// it changes mid-iteration.
    version: u64,
}

impl DataRegionSet {
    pub fn new() -> Self {
        DataRegionSet {
            regions: Vec::new(),
            version: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// The members, in ascending order. Not an enumerator: a plain slice
    /// snapshot, since callers that need fail-fast semantics use
    /// [`DataRegionSet::get_regions_within`].
    pub fn members(&self) -> &[DataRegion] {
        &self.regions
    }

    /// Adds `r`, coalescing with every intersecting or adjacent member.
    /// Returns the final merged region containing `r`.
    pub fn add(&mut self, r: DataRegion) -> DataRegion {
        self.version = self.version.wrapping_add(1);
        let mut merged = r;
        let start = self
            .regions
            .partition_point(|x| x.last().saturating_add(1) < merged.first());
        let mut end = start;
        while end < self.regions.len()
            && self.regions[end].first() <= merged.last().saturating_add(1)
        {
            merged = merged
                .combine_with(&self.regions[end])
                .expect("adjacency/intersection guaranteed by the scan bounds above");
            end += 1;
        }
        self.regions.splice(start..end, std::iter::once(merged));
        merged
    }

    /// Removes every byte covered by `r` from the set, trimming or
    /// splitting members as needed.
    pub fn remove(&mut self, r: DataRegion) {
        self.version = self.version.wrapping_add(1);
        let start = self.regions.partition_point(|x| x.last() < r.first());
        let mut end = start;
        let mut replacements = Vec::new();
        while end < self.regions.len() && self.regions[end].first() <= r.last() {
            let existing = self.regions[end];
            if existing.first() < r.first() {
                replacements.push(
                    DataRegion::new(existing.first(), r.first() - 1)
                        .expect("existing.first() < r.first() implies r.first() >= 1"),
                );
            }
            if existing.last() > r.last() {
                replacements.push(
                    DataRegion::new(r.last() + 1, existing.last())
                        .expect("existing.last() > r.last() implies r.last() + 1 <= existing.last()"),
                );
            }
            end += 1;
        }
        self.regions.splice(start..end, replacements);
    }

    /// Enumerates the intersections of members with `q`, clipped to `q`,
    /// in ascending order. Fails if the set is mutated mid-enumeration.
    pub fn get_regions_within(&self, q: DataRegion) -> RegionsWithinIter<'_> {
        let start = self.regions.partition_point(|x| x.last() < q.first());
        RegionsWithinIter {
            set: self,
            query: q,
            idx: start,
            expected_version: self.version,
        }
    }

    /// Enumerates the complement of the set's coverage within `q`, in
    /// ascending order. Fails if the set is mutated mid-enumeration.
    pub fn get_missing_regions(&self, q: DataRegion) -> MissingRegionsIter<'_> {
        let start = self.regions.partition_point(|x| x.last() < q.first());
        MissingRegionsIter {
            set: self,
            query: q,
            cursor: q.first(),
            idx: start,
            expected_version: self.version,
            exhausted: false,
        }
    }
}

impl PartialEq for DataRegionSet {
    fn eq(&self, other: &Self) -> bool {
        self.regions == other.regions
    }
}

impl Eq for DataRegionSet {}

impl Hash for DataRegionSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.regions.hash(state);
    }
}

pub struct RegionsWithinIter<'a> {
    set: &'a DataRegionSet,
    query: DataRegion,
    idx: usize,
    expected_version: u64,
}

impl<'a> Iterator for RegionsWithinIter<'a> {
    type Item = Result<DataRegion>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.set.version != self.expected_version {
            return Some(Err(StorageError::invalid_operation(
                "DataRegionSet modified during enumeration",
            )));
        }
        while self.idx < self.set.regions.len() {
            let candidate = self.set.regions[self.idx];
            self.idx += 1;
            if candidate.first() > self.query.last() {
                break;
            }
            if let Some(clipped) = candidate.clip(&self.query) {
                return Some(Ok(clipped));
            }
        }
        None
    }
}

pub struct MissingRegionsIter<'a> {
    set: &'a DataRegionSet,
    query: DataRegion,
    cursor: u64,
    idx: usize,
    expected_version: u64,
    exhausted: bool,
}

impl<'a> Iterator for MissingRegionsIter<'a> {
    type Item = Result<DataRegion>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.set.version != self.expected_version {
            return Some(Err(StorageError::invalid_operation(
                "DataRegionSet modified during enumeration",
            )));
        }
        if self.exhausted || self.cursor > self.query.last() {
            return None;
        }
        loop {
            if self.idx >= self.set.regions.len() {
                self.exhausted = true;
                return Some(Ok(DataRegion {
                    first: self.cursor,
                    last: self.query.last(),
                }));
            }
            let existing = self.set.regions[self.idx];
            if existing.last() < self.cursor {
                self.idx += 1;
                continue;
            }
            if existing.first() > self.query.last() {
                self.exhausted = true;
                return Some(Ok(DataRegion {
                    first: self.cursor,
                    last: self.query.last(),
                }));
            }
            if existing.first() > self.cursor {
                let gap = DataRegion {
                    first: self.cursor,
                    last: existing.first() - 1,
                };
                self.cursor = existing.last().saturating_add(1);
                self.idx += 1;
                return Some(Ok(gap));
            }
            self.cursor = existing.last().saturating_add(1);
            self.idx += 1;
            if self.cursor > self.query.last() {
                self.exhausted = true;
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(first: u64, last: u64) -> DataRegion {
        DataRegion::new(first, last).unwrap()
    }

    fn collect_ok(iter: impl Iterator<Item = Result<DataRegion>>) -> Vec<DataRegion> {
        iter.map(|x| x.unwrap()).collect()
    }

    #[test]
    fn region_rejects_inverted_bounds() {
        assert!(DataRegion::new(5, 4).is_err());
        assert!(DataRegion::new(5, 5).is_ok());
    }

    #[test]
    fn region_predicates() {
        let a = r(0, 5);
        let b = r(6, 10);
        let c = r(4, 8);
        assert!(a.is_adjacent(&b));
        assert!(!a.intersects(&b));
        assert!(a.intersects(&c));
        assert!(!a.is_adjacent(&c));
    }

    #[test]
    fn scenario_add_then_remove() {
        let mut set = DataRegionSet::new();
        assert_eq!(set.add(r(0, 0)), r(0, 0));
        assert_eq!(set.add(r(1, 1)), r(0, 1));
        assert_eq!(set.members(), &[r(0, 1)]);

        set.add(r(4, 4));
        set.add(r(5, 5));
        set.add(r(6, 6));
        assert_eq!(set.members(), &[r(0, 1), r(4, 6)]);

        set.add(r(2, 3));
        assert_eq!(set.members(), &[r(0, 6)]);

        set.add(r(7, 8));
        assert_eq!(set.members(), &[r(0, 8)]);

        set.remove(r(3, 3));
        assert_eq!(set.members(), &[r(0, 2), r(4, 8)]);
    }

    #[test]
    fn add_returns_existing_enclosing_region_when_contained() {
        let mut set = DataRegionSet::new();
        set.add(r(0, 100));
        let result = set.add(r(10, 20));
        assert_eq!(result, r(0, 100));
        assert_eq!(set.members(), &[r(0, 100)]);
    }

    #[test]
    fn remove_splits_a_member_in_two() {
        let mut set = DataRegionSet::new();
        set.add(r(0, 20));
        set.remove(r(5, 10));
        assert_eq!(set.members(), &[r(0, 4), r(11, 20)]);
    }

    #[test]
    fn get_regions_within_clips_to_query() {
        let mut set = DataRegionSet::new();
        set.add(r(0, 5));
        set.add(r(10, 20));
        let hits = collect_ok(set.get_regions_within(r(3, 15)));
        assert_eq!(hits, vec![r(3, 5), r(10, 15)]);
    }

    #[test]
    fn get_missing_regions_covers_complement() {
        let mut set = DataRegionSet::new();
        set.add(r(2, 4));
        set.add(r(8, 9));
        let gaps = collect_ok(set.get_missing_regions(r(0, 10)));
        assert_eq!(gaps, vec![r(0, 1), r(5, 7), r(10, 10)]);
    }

    #[test]
    fn enumeration_fails_fast_on_mutation() {
        let mut set = DataRegionSet::new();
        set.add(r(0, 10));
        let stale_version = set.version;
        set.add(r(20, 21));

        // Reconstruct the iterator state a stale enumerator would have had,
        // to assert the version check actually fires.
        let stale_iter = RegionsWithinIter {
            set: &set,
            query: r(0, 30),
            idx: 0,
            expected_version: stale_version,
        };
        let results: Vec<_> = stale_iter.collect();
        assert!(results[0].is_err());

        // A freshly created enumerator sees the current state and succeeds.
        let fresh = set.get_regions_within(r(0, 30));
        assert!(fresh.into_iter().all(|x| x.is_ok()));
    }

    #[test]
    fn structural_equality_ignores_mutation_history() {
        let mut a = DataRegionSet::new();
        a.add(r(0, 5));
        a.add(r(10, 15));

        let mut b = DataRegionSet::new();
        b.add(r(10, 15));
        b.add(r(0, 5));

        assert_eq!(a, b);
    }

    /// Brute-force reference model: a `DataRegionSet` is checked against a
    /// plain `HashSet<u64>` of covered offsets after interleaved adds and
    /// removes, over a small offset range so the reference stays cheap.
    mod proptests {
        use super::*;
        use proptest::collection::vec;
        use proptest::prelude::*;
        use std::collections::HashSet;

        #[derive(Clone, Copy, Debug)]
        enum Op {
            Add(u64, u64),
            Remove(u64, u64),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            (0u64..40, 0u64..8).prop_flat_map(|(first, span)| {
                let last = first + span;
                prop_oneof![
                    Just(Op::Add(first, last)),
                    Just(Op::Remove(first, last)),
                ]
            })
        }

        proptest! {
            /// P1: after any sequence of Add/Remove, the set's members are
            /// pairwise non-adjacent and non-intersecting, and the set's
            /// covered offsets exactly match a brute-force reference.
            #[test]
            fn p1_matches_brute_force_coverage(ops in vec(op_strategy(), 0..40)) {
                let mut set = DataRegionSet::new();
                let mut reference: HashSet<u64> = HashSet::new();
                for op in ops {
                    match op {
                        Op::Add(first, last) => {
                            set.add(r(first, last));
                            for i in first..=last {
                                reference.insert(i);
                            }
                        }
                        Op::Remove(first, last) => {
                            set.remove(r(first, last));
                            for i in first..=last {
                                reference.remove(&i);
                            }
                        }
                    }
                }

                let members = set.members();
                for w in members.windows(2) {
                    prop_assert!(!w[0].intersects(&w[1]));
                    prop_assert!(!w[0].is_adjacent(&w[1]));
                    prop_assert!(w[0].last() < w[1].first());
                }

                let covered: HashSet<u64> = members
                    .iter()
                    .flat_map(|m| m.first()..=m.last())
                    .collect();
                prop_assert_eq!(covered, reference);
            }
        }
    }
}
