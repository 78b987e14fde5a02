//! A disk-resident B-tree over a `PageStorage`. Every node, leaf or
//! internal, carries (key, value) pairs directly in the fixed-width slot
//! layout of `btree::node`, and removal repairs an under-filled child by
//! borrowing from a sibling before falling back to merge.
//!
//! `BTree` owns its `PageStorage` outright; it is generic over the key and
//! value types and their `Serializer`s, and over a caller-supplied
//! comparator closure (key ordering is explicitly a collaborator's
//! responsibility, never the tree's own `Ord` assumption).

mod node;

use std::cmp::Ordering;

use crate::error::{Result, StorageError};
use crate::progress::{CancellationToken, ProgressSink};
use crate::serializer::Serializer;
use crate::storage::{PageIndex, PageStorage};

use node::{decode_node, encode_node, split_in_half, Node, NodeLayout};

/// Outcome of an `insert` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key was absent; the pair was added and the tree's count grew.
    Inserted,
    /// The key was present and `update_if_exists` was set; value replaced.
    Updated,
    /// The key was present and `update_if_exists` was false; no change.
    AlreadyExists,
}

/// Bounds the number of pairs an implementation may move in a single
/// rotate/merge/split step. This implementation always moves a full
/// node's worth of pairs in one page write (split/merge already touch at
/// most `O(M)` pairs and a page write is atomic from the tree's point of
/// view), so the value is validated and stored for API parity with
/// implementations that chunk large moves, but does not otherwise change
/// behavior here.
pub const DEFAULT_MAX_MOVE_PAIR_COUNT: usize = 1024;

/// A disk-resident B-tree of `(K, V)` pairs over a `P: PageStorage`.
///
/// `BTree` does not itself persist its root index or pair count anywhere
/// durable — that is [`crate::dictionary::StorageDictionary`]'s job. A
/// `BTree` is a pure in-memory view of `root`/`count` bound to pages on
/// `storage`; construct one from a previously-persisted `(root, count)`
/// pair to resume working with an existing tree.
pub struct BTree<P, K, V, SK, SV, C> {
    storage: P,
    layout: NodeLayout,
    key_ser: SK,
    value_ser: SV,
    cmp: C,
    root: Option<PageIndex>,
    count: u64,
    max_move_pair_count: usize,
    /// Bumped on every structural mutation; `Traverse` captures it at
    /// creation and checks it on each step so a traversal outliving a
    /// mutation (even though the borrow checker already forbids that in
    /// safe code) fails loudly rather than silently, matching the
    /// enumerate-vs-mutate contract the rest of the crate follows
    /// (`DataRegionSet`'s version counter is the same idea).
    version: u64,
    _key: std::marker::PhantomData<K>,
    _value: std::marker::PhantomData<V>,
}

impl<P, K, V, SK, SV, C> BTree<P, K, V, SK, SV, C>
where
    P: PageStorage,
    K: Clone,
    V: Clone,
    SK: Serializer<K>,
    SV: Serializer<V>,
    C: Fn(&K, &K) -> Ordering,
{
    /// Binds a tree to `storage`, resuming from a previously-persisted
    /// `(root, count)` pair (use `(None, 0)` for a brand-new, empty tree).
    /// Fails if `max_move_pair_count < 1` or if a node doesn't fit at
    /// least `VeryMinKeyValuePairCapacity` pairs on one page.
    pub fn new(
        storage: P,
        root: Option<PageIndex>,
        count: u64,
        key_ser: SK,
        value_ser: SV,
        cmp: C,
        max_move_pair_count: usize,
    ) -> Result<Self> {
        if max_move_pair_count < 1 {
            return Err(StorageError::out_of_range(
                "max_move_pair_count",
                "must be >= 1",
            ));
        }
        let layout =
            NodeLayout::compute(storage.page_size(), key_ser.data_size(), value_ser.data_size())?;
        Ok(BTree {
            storage,
            layout,
            key_ser,
            value_ser,
            cmp,
            root,
            count,
            max_move_pair_count,
            version: 0,
            _key: std::marker::PhantomData,
            _value: std::marker::PhantomData,
        })
    }

    pub fn root(&self) -> Option<PageIndex> {
        self.root
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn max_move_pair_count(&self) -> usize {
        self.max_move_pair_count
    }

    /// The capacity `M` every node in this tree is laid out for.
    pub fn capacity(&self) -> usize {
        self.layout.m
    }

    pub fn storage(&self) -> &P {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut P {
        &mut self.storage
    }

    /// Gives back the wrapped storage, discarding the tree's own
    /// in-memory `root`/`count` view (a caller managing its own handle
    /// page, e.g. `StorageDictionary`, should have already persisted them).
    pub fn into_storage(self) -> P {
        self.storage
    }

    fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    fn min_fill(&self) -> usize {
        self.layout.min_fill()
    }

    fn mid(&self) -> usize {
        self.layout.m / 2
    }

    fn allocate_page(&mut self) -> Result<PageIndex> {
        match self.storage.try_allocate_page()? {
            Some(idx) => Ok(idx),
            None => Err(StorageError::not_enough_space(
                "page store has no free pages",
            )),
        }
    }

    fn free_page(&mut self, idx: PageIndex) -> Result<()> {
        self.storage.free_page(idx)?;
        Ok(())
    }

    fn read_node(&mut self, page: PageIndex) -> Result<Node<K, V>> {
        let mut buf = vec![0u8; self.layout.page_size as usize];
        let len = buf.len();
        self.storage.read_from(page, 0, &mut buf, 0, len)?;
        decode_node(&buf, &self.layout, &self.key_ser, &self.value_ser)
    }

    fn write_node(&mut self, page: PageIndex, node: &Node<K, V>) -> Result<()> {
        let buf = encode_node(node, &self.layout, &self.key_ser, &self.value_ser)?;
        let len = buf.len();
        self.storage.write_to(page, 0, &buf, 0, len)
    }

    /// `Ok(i)` on an exact match at index `i`; `Err(i)` with `i` the
    /// ceiling insertion point (`i == keys.len()` if `key` is greater
    /// than every live key) otherwise.
    fn locate(&self, keys: &[K], key: &K) -> std::result::Result<usize, usize> {
        keys.binary_search_by(|probe| (self.cmp)(probe, key))
    }

    // ---------------------------------------------------------------
    // Lookup
    // ---------------------------------------------------------------

    /// `TryGetValue(key)`: binary search down from the root, returning the
    /// paired value on an exact match. `O(log_M n)` pages visited; checks
    /// `cancel` once per descended node.
    pub fn try_get_value(&mut self, key: &K, cancel: &CancellationToken) -> Result<Option<V>> {
        let mut current = self.root;
        while let Some(idx) = current {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let node = self.read_node(idx)?;
            match self.locate(&node.keys, key) {
                Ok(i) => return Ok(Some(node.values[i].clone())),
                Err(i) => {
                    if node.is_leaf {
                        return Ok(None);
                    }
                    current = Some(node.children[i]);
                }
            }
        }
        Ok(None)
    }

    /// `UpdateValue(key, value)`: in-place replace of an existing pair's
    /// value. Never allocates (the value's serialized width is fixed), so
    /// unlike `insert` it needs no split/no-space fallback. Fails with
    /// `KeyNotFound` if `key` is absent.
    pub fn update_value(&mut self, key: &K, value: V) -> Result<()> {
        let mut current = self.root;
        while let Some(idx) = current {
            let mut node = self.read_node(idx)?;
            match self.locate(&node.keys, key) {
                Ok(i) => {
                    node.values[i] = value;
                    self.write_node(idx, &node)?;
                    self.bump_version();
                    return Ok(());
                }
                Err(i) => {
                    if node.is_leaf {
                        return Err(StorageError::KeyNotFound);
                    }
                    current = Some(node.children[i]);
                }
            }
        }
        Err(StorageError::KeyNotFound)
    }

    // ---------------------------------------------------------------
    // Insert
    // ---------------------------------------------------------------

    /// `Insert(key, value, update_if_exists)`, proactive-split-on-descent:
    /// a full node is split before the descent continues through it, so
    /// insertion never needs to re-ascend to fix up a full parent.
    pub fn insert(&mut self, key: K, value: V, update_if_exists: bool) -> Result<InsertOutcome> {
        let root_idx = match self.root {
            None => {
                let idx = self.allocate_page()?;
                let mut node = Node::new_leaf();
                node.keys.push(key);
                node.values.push(value);
                self.write_node(idx, &node)?;
                self.root = Some(idx);
                self.count += 1;
                self.bump_version();
                return Ok(InsertOutcome::Inserted);
            }
            Some(idx) => idx,
        };

        let root_node = self.read_node(root_idx)?;
        if root_node.pair_count() == self.layout.m {
            match self.split_root(root_idx, &root_node) {
                Ok(new_root) => {
                    self.root = Some(new_root);
                    self.insert_nonfull(new_root, key, value, update_if_exists)
                }
                Err(e) if matches!(e, StorageError::NotEnoughSpace(_)) => {
                    self.update_only(root_idx, &key, value, update_if_exists)
                }
                Err(e) => Err(e),
            }
        } else {
            self.insert_nonfull(root_idx, key, value, update_if_exists)
        }
    }

    /// Splits the root in place: allocates a sibling and a new root page,
    /// leaving the old root as the left child. Returns the new root's
    /// index. On any allocation failure, nothing durable has changed.
    fn split_root(&mut self, root_idx: PageIndex, root_node: &Node<K, V>) -> Result<PageIndex> {
        let sibling_idx = self.allocate_page()?;
        let new_root_idx = match self.allocate_page() {
            Ok(idx) => idx,
            Err(e) => {
                // Roll back the first allocation; no page was written yet.
                let _ = self.free_page(sibling_idx);
                return Err(e);
            }
        };
        let mid = self.mid();
        let (promoted_key, promoted_value, left, right) = split_in_half(root_node, mid);
        self.write_node(root_idx, &left)?;
        self.write_node(sibling_idx, &right)?;
        let mut new_root = Node::new_internal();
        new_root.keys.push(promoted_key);
        new_root.values.push(promoted_value);
        new_root.children = vec![root_idx, sibling_idx];
        self.write_node(new_root_idx, &new_root)?;
        log::debug!(
            "btree: split root page {root_idx} -> ({root_idx}, {sibling_idx}) under new root {new_root_idx}"
        );
        self.bump_version();
        Ok(new_root_idx)
    }

    /// Splits `parent.children[child_pos]` (already confirmed full) into
    /// itself and a new sibling, threading the promoted pair and the new
    /// child pointer into `parent` (which the caller must persist).
    fn split_child(
        &mut self,
        parent: &mut Node<K, V>,
        child_pos: usize,
        child: &Node<K, V>,
    ) -> Result<()> {
        let sibling_idx = self.allocate_page()?;
        let child_idx = parent.children[child_pos];
        let mid = self.mid();
        let (promoted_key, promoted_value, left, right) = split_in_half(child, mid);
        self.write_node(child_idx, &left)?;
        self.write_node(sibling_idx, &right)?;
        parent.keys.insert(child_pos, promoted_key);
        parent.values.insert(child_pos, promoted_value);
        parent.children.insert(child_pos + 1, sibling_idx);
        log::debug!("btree: split child page {child_idx} -> ({child_idx}, {sibling_idx})");
        self.bump_version();
        Ok(())
    }

    /// Recursive proactive-split insert: a full child is split before the
    /// descent steps into it, so the node at `page_idx` is guaranteed
    /// non-full on entry.
    fn insert_nonfull(
        &mut self,
        page_idx: PageIndex,
        key: K,
        value: V,
        update_if_exists: bool,
    ) -> Result<InsertOutcome> {
        let mut node = self.read_node(page_idx)?;
        match self.locate(&node.keys, &key) {
            Ok(i) => {
                if update_if_exists {
                    node.values[i] = value;
                    self.write_node(page_idx, &node)?;
                    self.bump_version();
                    Ok(InsertOutcome::Updated)
                } else {
                    Ok(InsertOutcome::AlreadyExists)
                }
            }
            Err(i) if node.is_leaf => {
                node.keys.insert(i, key);
                node.values.insert(i, value);
                self.write_node(page_idx, &node)?;
                self.count += 1;
                self.bump_version();
                Ok(InsertOutcome::Inserted)
            }
            Err(i) => {
                let child_idx = node.children[i];
                let child = self.read_node(child_idx)?;
                if child.pair_count() == self.layout.m {
                    match self.split_child(&mut node, i, &child) {
                        Ok(()) => {
                            self.write_node(page_idx, &node)?;
                            // Re-enter: the promoted key may equal `key`
                            // exactly, or the (now unfull) target child
                            // may have shifted by one position.
                            self.insert_nonfull(page_idx, key, value, update_if_exists)
                        }
                        Err(e) if matches!(e, StorageError::NotEnoughSpace(_)) => {
                            self.update_only(page_idx, &key, value, update_if_exists)
                        }
                        Err(e) => Err(e),
                    }
                } else {
                    self.insert_nonfull(child_idx, key, value, update_if_exists)
                }
            }
        }
    }

    /// No-space fallback: descend to find `key` and update its value in
    /// place without ever allocating or splitting. Used when a split
    /// could not acquire a page: an update to an existing key must still
    /// succeed even when no free pages remain to split into.
    fn update_only(
        &mut self,
        page_idx: PageIndex,
        key: &K,
        value: V,
        update_if_exists: bool,
    ) -> Result<InsertOutcome> {
        let mut node = self.read_node(page_idx)?;
        match self.locate(&node.keys, key) {
            Ok(i) => {
                if update_if_exists {
                    node.values[i] = value;
                    self.write_node(page_idx, &node)?;
                    self.bump_version();
                    Ok(InsertOutcome::Updated)
                } else {
                    Ok(InsertOutcome::AlreadyExists)
                }
            }
            Err(i) => {
                if node.is_leaf {
                    Err(StorageError::not_enough_space(
                        "no free pages to insert a new key",
                    ))
                } else {
                    let child_idx = node.children[i];
                    self.update_only(child_idx, key, value, update_if_exists)
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Remove
    // ---------------------------------------------------------------

    /// `Remove(key)`. Returns whether a pair was actually removed.
    pub fn remove(&mut self, key: &K) -> Result<bool> {
        let root_idx = match self.root {
            Some(idx) => idx,
            None => return Ok(false),
        };
        let removed = self.remove_descend(root_idx, key)?;
        if removed {
            self.count -= 1;
            self.collapse_root()?;
            self.bump_version();
        }
        Ok(removed)
    }

    /// After a removal, collapse a root that lost its last pair: an
    /// internal root with no keys has exactly one child left and is
    /// replaced by it; an empty leaf root becomes "no tree at all."
    fn collapse_root(&mut self) -> Result<()> {
        let root_idx = match self.root {
            Some(idx) => idx,
            None => return Ok(()),
        };
        let root_node = self.read_node(root_idx)?;
        if root_node.keys.is_empty() {
            if root_node.is_leaf {
                self.free_page(root_idx)?;
                self.root = None;
            } else {
                let only_child = root_node.children[0];
                self.free_page(root_idx)?;
                self.root = Some(only_child);
            }
        }
        Ok(())
    }

    /// Finds `key` in the subtree rooted at `page_idx`, pre-emptively
    /// rebalancing any child it's about to descend into (borrow-left,
    /// borrow-right, then merge, in that order) so removal from it can
    /// never violate the min-fill invariant. On an internal exact match,
    /// the pair is replaced by its in-order predecessor (the max of the
    /// left subtree), which is then itself removed recursively — see
    /// `remove_max`.
    fn remove_descend(&mut self, page_idx: PageIndex, key: &K) -> Result<bool> {
        let mut node = self.read_node(page_idx)?;
        let child_pos = match self.locate(&node.keys, key) {
            Ok(i) if node.is_leaf => {
                node.keys.remove(i);
                node.values.remove(i);
                self.write_node(page_idx, &node)?;
                return Ok(true);
            }
            Ok(i) => i,
            Err(_) if node.is_leaf => return Ok(false),
            Err(i) => i,
        };

        let child_idx = node.children[child_pos];
        let child = self.read_node(child_idx)?;
        if child.pair_count() <= self.min_fill() {
            self.rebalance_child(&mut node, child_pos)?;
            self.write_node(page_idx, &node)?;
            self.bump_version();
            // The structure under `page_idx` changed (a borrow or a
            // merge); retry from scratch rather than reason about how
            // `child_pos` shifted.
            return self.remove_descend(page_idx, key);
        }

        match self.locate(&node.keys, key) {
            Ok(i) => {
                debug_assert_eq!(i, child_pos);
                let (pred_key, pred_value) = self.remove_max(child_idx)?;
                node.keys[i] = pred_key;
                node.values[i] = pred_value;
                self.write_node(page_idx, &node)?;
                Ok(true)
            }
            Err(_) => self.remove_descend(child_idx, key),
        }
    }

    /// Removes and returns the rightmost (max) pair of the subtree rooted
    /// at `page_idx`, applying the same pre-emptive rebalancing along the
    /// way. Used to find an internal node's in-order predecessor.
    fn remove_max(&mut self, page_idx: PageIndex) -> Result<(K, V)> {
        let mut node = self.read_node(page_idx)?;
        if node.is_leaf {
            let k = node.keys.pop().expect("leaf removed from has no pairs");
            let v = node.values.pop().expect("leaf removed from has no pairs");
            self.write_node(page_idx, &node)?;
            return Ok((k, v));
        }
        let last = node.children.len() - 1;
        let child_idx = node.children[last];
        let child = self.read_node(child_idx)?;
        if child.pair_count() <= self.min_fill() {
            self.rebalance_child(&mut node, last)?;
            self.write_node(page_idx, &node)?;
            self.bump_version();
            return self.remove_max(page_idx);
        }
        self.remove_max(child_idx)
    }

    /// Ensures `parent.children[child_pos]` has more than the minimum
    /// legal fill, by borrowing from a sibling or, failing that, merging
    /// with one. Mutates `parent` in memory; the caller persists it.
    fn rebalance_child(&mut self, parent: &mut Node<K, V>, child_pos: usize) -> Result<()> {
        if child_pos > 0 {
            let left_idx = parent.children[child_pos - 1];
            let left_sibling = self.read_node(left_idx)?;
            if left_sibling.pair_count() > self.min_fill() {
                return self.borrow_from_left(parent, child_pos, left_idx, left_sibling);
            }
        }
        if child_pos + 1 < parent.children.len() {
            let right_idx = parent.children[child_pos + 1];
            let right_sibling = self.read_node(right_idx)?;
            if right_sibling.pair_count() > self.min_fill() {
                return self.borrow_from_right(parent, child_pos, right_idx, right_sibling);
            }
        }
        if child_pos + 1 < parent.children.len() {
            self.merge_children(parent, child_pos)
        } else {
            self.merge_children(parent, child_pos - 1)
        }
    }

    /// Rotate: the separator left of `child_pos` moves down to become the
    /// child's new first pair; the left sibling's last pair moves up to
    /// become the new separator (and, for internal nodes, its last child
    /// pointer moves across too).
    fn borrow_from_left(
        &mut self,
        parent: &mut Node<K, V>,
        child_pos: usize,
        left_idx: PageIndex,
        mut left_sibling: Node<K, V>,
    ) -> Result<()> {
        let child_idx = parent.children[child_pos];
        let mut child = self.read_node(child_idx)?;
        let sep = child_pos - 1;

        let moved_key = left_sibling.keys.pop().expect("left sibling has extra pairs");
        let moved_value = left_sibling
            .values
            .pop()
            .expect("left sibling has extra pairs");

        child.keys.insert(0, parent.keys[sep].clone());
        child.values.insert(0, parent.values[sep].clone());
        if !child.is_leaf {
            let moved_child = left_sibling
                .children
                .pop()
                .expect("internal left sibling has extra child");
            child.children.insert(0, moved_child);
        }

        parent.keys[sep] = moved_key;
        parent.values[sep] = moved_value;

        self.write_node(left_idx, &left_sibling)?;
        self.write_node(child_idx, &child)?;
        log::debug!("btree: borrowed from left sibling {left_idx} into child {child_idx}");
        Ok(())
    }

    /// Symmetric to `borrow_from_left`: the separator right of `child_pos`
    /// moves down to become the child's new last pair; the right
    /// sibling's first pair moves up to become the new separator.
    fn borrow_from_right(
        &mut self,
        parent: &mut Node<K, V>,
        child_pos: usize,
        right_idx: PageIndex,
        mut right_sibling: Node<K, V>,
    ) -> Result<()> {
        let child_idx = parent.children[child_pos];
        let mut child = self.read_node(child_idx)?;
        let sep = child_pos;

        let moved_key = right_sibling.keys.remove(0);
        let moved_value = right_sibling.values.remove(0);

        child.keys.push(parent.keys[sep].clone());
        child.values.push(parent.values[sep].clone());
        if !child.is_leaf {
            let moved_child = right_sibling.children.remove(0);
            child.children.push(moved_child);
        }

        parent.keys[sep] = moved_key;
        parent.values[sep] = moved_value;

        self.write_node(right_idx, &right_sibling)?;
        self.write_node(child_idx, &child)?;
        log::debug!("btree: borrowed from right sibling {right_idx} into child {child_idx}");
        Ok(())
    }

    /// Merges `parent.children[left_pos]`, the separator at `left_pos`,
    /// and `parent.children[left_pos + 1]` into one node (the left one);
    /// frees the emptied right sibling's page.
    fn merge_children(&mut self, parent: &mut Node<K, V>, left_pos: usize) -> Result<()> {
        let left_idx = parent.children[left_pos];
        let right_idx = parent.children[left_pos + 1];
        let mut left = self.read_node(left_idx)?;
        let right = self.read_node(right_idx)?;

        left.keys.push(parent.keys[left_pos].clone());
        left.values.push(parent.values[left_pos].clone());
        left.keys.extend(right.keys);
        left.values.extend(right.values);
        if !left.is_leaf {
            left.children.extend(right.children);
        }

        self.write_node(left_idx, &left)?;
        self.free_page(right_idx)?;

        parent.keys.remove(left_pos);
        parent.values.remove(left_pos);
        parent.children.remove(left_pos + 1);

        log::debug!("btree: merged page {right_idx} into {left_idx}, freeing {right_idx}");
        Ok(())
    }

    // ---------------------------------------------------------------
    // Traversal
    // ---------------------------------------------------------------

    /// A lazy, forward-or-reverse in-order sequence of `(key, value)`
    /// pairs. Borrows `self` mutably for its whole lifetime — the borrow
    /// checker already forbids mutating the tree while a traversal is
    /// alive, a compile-time guarantee stronger than the runtime
    /// fail-fast used for enumerators elsewhere in the crate. `cancel` is
    /// checked once per yielded pair.
    pub fn traverse(&mut self, ascending: bool, cancel: CancellationToken) -> Traverse<'_, P, K, V, SK, SV, C> {
        let expected_version = self.version;
        Traverse {
            tree: self,
            ascending,
            cancel,
            stack: Vec::new(),
            expected_version,
            started: false,
        }
    }

    // ---------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------

    /// Structural self-check: I1–I5, key ordering within nodes, and that
    /// every referenced child page is allocated. Only legal over a
    /// read-only store. `Ok(false)` on cancellation, `Err(Corrupt)` on a
    /// genuine violation.
    pub fn validate(
        &mut self,
        mut progress: Option<&mut dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if !self.storage.is_read_only() {
            return Err(StorageError::invalid_operation(
                "Validate requires a read-only store",
            ));
        }
        let mut visited = 0u64;
        let mut total_pairs = 0u64;
        let root = self.root;
        let ok = self.validate_node(
            root,
            None,
            None,
            true,
            &mut visited,
            &mut total_pairs,
            progress.as_deref_mut(),
            cancel,
        )?;
        if !ok {
            return Ok(false);
        }
        if total_pairs != self.count {
            return Err(StorageError::corrupt(format!(
                "tree handle reports {} pairs but nodes contain {}",
                self.count, total_pairs
            )));
        }
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn validate_node(
        &mut self,
        page: Option<PageIndex>,
        lower: Option<&K>,
        upper: Option<&K>,
        is_root: bool,
        visited: &mut u64,
        total: &mut u64,
        mut progress: Option<&mut dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let page = match page {
            Some(p) => p,
            None => return Ok(true),
        };
        if cancel.is_cancelled() {
            return Ok(false);
        }
        if !self.storage.is_page_allocated(page) {
            return Err(StorageError::corrupt(format!(
                "page {page} is referenced but not allocated"
            )));
        }
        let node = self.read_node(page)?;
        *visited += 1;
        if let Some(p) = progress.as_deref_mut() {
            p.report(*visited, *visited);
        }

        let n = node.pair_count();
        if n > self.layout.m {
            return Err(StorageError::corrupt(format!(
                "page {page} has {n} pairs, exceeds capacity {}",
                self.layout.m
            )));
        }
        if !is_root && n < self.min_fill() {
            return Err(StorageError::corrupt(format!(
                "page {page} has {n} pairs, below minimum fill {}",
                self.min_fill()
            )));
        }
        if !node.is_leaf && node.children.len() != n + 1 {
            return Err(StorageError::corrupt(format!(
                "internal page {page} has {n} keys but {} children",
                node.children.len()
            )));
        }
        for i in 1..n {
            if (self.cmp)(&node.keys[i - 1], &node.keys[i]) != Ordering::Less {
                return Err(StorageError::corrupt(format!(
                    "page {page} keys out of order at index {i}"
                )));
            }
        }
        if let (Some(lo), true) = (lower, n > 0) {
            if (self.cmp)(lo, &node.keys[0]) != Ordering::Less {
                return Err(StorageError::corrupt(format!(
                    "page {page} violates its lower bound"
                )));
            }
        }
        if let (Some(hi), true) = (upper, n > 0) {
            if (self.cmp)(&node.keys[n - 1], hi) != Ordering::Less {
                return Err(StorageError::corrupt(format!(
                    "page {page} violates its upper bound"
                )));
            }
        }
        *total += n as u64;

        if !node.is_leaf {
            for i in 0..=n {
                let child_lower = if i == 0 { lower } else { Some(&node.keys[i - 1]) };
                let child_upper = if i == n { upper } else { Some(&node.keys[i]) };
                let ok = self.validate_node(
                    Some(node.children[i]),
                    child_lower,
                    child_upper,
                    false,
                    visited,
                    total,
                    progress.as_deref_mut(),
                    cancel,
                )?;
                if !ok {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

/// Lazy in-order (or reverse) iterator over a `BTree`'s pairs, returned by
/// [`BTree::traverse`]. Holds a stack of ancestor frames rather than
/// buffering the whole tree, descending one more page only when the
/// current frame is exhausted.
pub struct Traverse<'a, P, K, V, SK, SV, C> {
    tree: &'a mut BTree<P, K, V, SK, SV, C>,
    ascending: bool,
    cancel: CancellationToken,
    stack: Vec<Frame<K, V>>,
    expected_version: u64,
    started: bool,
}

struct Frame<K, V> {
    node: Node<K, V>,
    /// Ascending: next key index to emit, counting up from 0.
    /// Descending: next key index to emit, counting down from `keys.len()`.
    pos: usize,
}

impl<'a, P, K, V, SK, SV, C> Traverse<'a, P, K, V, SK, SV, C>
where
    P: PageStorage,
    K: Clone,
    V: Clone,
    SK: Serializer<K>,
    SV: Serializer<V>,
    C: Fn(&K, &K) -> Ordering,
{
    fn push_left_spine(&mut self, mut page_idx: PageIndex) -> Result<()> {
        loop {
            let node = self.tree.read_node(page_idx)?;
            let next = if node.is_leaf {
                None
            } else {
                Some(node.children[0])
            };
            self.stack.push(Frame { node, pos: 0 });
            match next {
                Some(c) => page_idx = c,
                None => return Ok(()),
            }
        }
    }

    fn push_right_spine(&mut self, mut page_idx: PageIndex) -> Result<()> {
        loop {
            let node = self.tree.read_node(page_idx)?;
            let next = if node.is_leaf {
                None
            } else {
                Some(*node.children.last().unwrap())
            };
            let pos = node.keys.len();
            self.stack.push(Frame { node, pos });
            match next {
                Some(c) => page_idx = c,
                None => return Ok(()),
            }
        }
    }

    fn ensure_started(&mut self) -> Result<()> {
        if !self.started {
            self.started = true;
            if let Some(root) = self.tree.root() {
                if self.ascending {
                    self.push_left_spine(root)?;
                } else {
                    self.push_right_spine(root)?;
                }
            }
        }
        Ok(())
    }

    fn next_ascending(&mut self) -> Option<Result<(K, V)>> {
        loop {
            let frame = self.stack.last_mut()?;
            if frame.pos < frame.node.keys.len() {
                let i = frame.pos;
                frame.pos += 1;
                let key = frame.node.keys[i].clone();
                let value = frame.node.values[i].clone();
                if !frame.node.is_leaf {
                    let child = frame.node.children[i + 1];
                    if let Err(e) = self.push_left_spine(child) {
                        return Some(Err(e));
                    }
                }
                return Some(Ok((key, value)));
            }
            self.stack.pop();
        }
    }

    fn next_descending(&mut self) -> Option<Result<(K, V)>> {
        loop {
            let frame = self.stack.last_mut()?;
            if frame.pos == 0 {
                self.stack.pop();
                continue;
            }
            frame.pos -= 1;
            let i = frame.pos;
            let key = frame.node.keys[i].clone();
            let value = frame.node.values[i].clone();
            if !frame.node.is_leaf {
                let child = frame.node.children[i];
                if let Err(e) = self.push_right_spine(child) {
                    return Some(Err(e));
                }
            }
            return Some(Ok((key, value)));
        }
    }
}

impl<'a, P, K, V, SK, SV, C> Iterator for Traverse<'a, P, K, V, SK, SV, C>
where
    P: PageStorage,
    K: Clone,
    V: Clone,
    SK: Serializer<K>,
    SV: Serializer<V>,
    C: Fn(&K, &K) -> Ordering,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.tree.version != self.expected_version {
            return Some(Err(StorageError::invalid_operation(
                "tree was modified during traversal",
            )));
        }
        if self.cancel.is_cancelled() {
            return None;
        }
        if let Err(e) = self.ensure_started() {
            return Some(Err(e));
        }
        if self.ascending {
            self.next_ascending()
        } else {
            self.next_descending()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::{I64Serializer, U64Serializer};
    use crate::storage::streaming::StreamingPageStorage;
    use std::io::Cursor;

    type TestTree = BTree<
        StreamingPageStorage<Cursor<Vec<u8>>>,
        i64,
        u64,
        I64Serializer,
        U64Serializer,
        fn(&i64, &i64) -> Ordering,
    >;

    fn new_tree(page_size: u64) -> TestTree {
        let storage = StreamingPageStorage::create(
            Cursor::new(Vec::new()),
            page_size,
            1,
            None,
            &CancellationToken::none(),
            false,
            8,
        )
        .unwrap();
        BTree::new(
            storage,
            None,
            0,
            I64Serializer,
            U64Serializer,
            (|a: &i64, b: &i64| a.cmp(b)) as fn(&i64, &i64) -> Ordering,
            DEFAULT_MAX_MOVE_PAIR_COUNT,
        )
        .unwrap()
    }

    #[test]
    fn capacity_for_i64_u64_pairs_is_five_at_min_page_size() {
        let tree = new_tree(128);
        // M=5 for this page size / key+value width combination.
        assert_eq!(tree.capacity(), 5);
    }

    #[test]
    fn insert_lookup_and_update_round_trip() {
        let mut tree = new_tree(128);
        let none = CancellationToken::none();
        assert_eq!(
            tree.insert(1, 100, false).unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(tree.try_get_value(&1, &none).unwrap(), Some(100));
        assert_eq!(
            tree.insert(1, 999, false).unwrap(),
            InsertOutcome::AlreadyExists
        );
        assert_eq!(tree.try_get_value(&1, &none).unwrap(), Some(100));
        assert_eq!(tree.insert(1, 999, true).unwrap(), InsertOutcome::Updated);
        assert_eq!(tree.try_get_value(&1, &none).unwrap(), Some(999));
        assert_eq!(tree.count(), 1);
    }

    #[test]
    fn remove_of_missing_key_returns_false() {
        let mut tree = new_tree(128);
        tree.insert(1, 1, false).unwrap();
        assert!(!tree.remove(&2).unwrap());
        assert_eq!(tree.count(), 1);
    }

    /// With M=5: insert 0..1024 ascending, then remove in the same order;
    /// allocated pages strictly decrease back to none once the tree is
    /// empty, and a read-only reopen validates.
    #[test]
    fn scenario_insert_then_remove_ascending_shrinks_back() {
        let mut tree = new_tree(128);
        let none = CancellationToken::none();

        for k in 0..1024i64 {
            assert_eq!(
                tree.insert(k, k as u64, false).unwrap(),
                InsertOutcome::Inserted
            );
        }
        assert_eq!(tree.count(), 1024);
        for k in 0..1024i64 {
            assert_eq!(tree.try_get_value(&k, &none).unwrap(), Some(k as u64));
        }
        let pairs: Vec<(i64, u64)> = tree
            .traverse(true, CancellationToken::none())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(pairs.len(), 1024);
        for i in 1..pairs.len() {
            assert!(pairs[i - 1].0 < pairs[i].0);
        }

        let peak_pages = tree.storage().allocated_page_count();
        assert!(peak_pages > 1);

        for k in 0..1024i64 {
            assert!(tree.remove(&k).unwrap());
        }
        assert_eq!(tree.count(), 0);
        assert_eq!(tree.root(), None);
        assert!(tree.storage().allocated_page_count() < peak_pages);
    }

    #[test]
    fn traverse_descending_yields_strictly_decreasing_keys() {
        let mut tree = new_tree(256);
        for k in [5i64, 1, 9, 3, 7] {
            tree.insert(k, k as u64, false).unwrap();
        }
        let pairs: Vec<(i64, u64)> = tree
            .traverse(false, CancellationToken::none())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(pairs.iter().map(|p| p.0).collect::<Vec<_>>(), vec![9, 7, 5, 3, 1]);
    }
}
