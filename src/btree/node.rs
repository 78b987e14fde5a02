//! On-page layout of a `BTreeNode`.
//!
//! Every node — leaf or internal — is a fixed-width slot array:
//! `M` key slots, `M` value slots and, whether or not the node is a leaf,
//! room for `M+1` child indices (a leaf simply never populates them).
//! Reserving that space uniformly keeps `M` identical for every node in
//! the tree, which is what the split/merge arithmetic in `mod.rs` assumes.

use crate::error::{Result, StorageError};
use crate::serializer::Serializer;
use crate::storage::PageIndex;

/// Byte 0: flags. Bytes 1..9: pair count `N` (u64 LE). Bytes 9..16: reserved.
pub(crate) const NODE_HEADER_SIZE: u64 = 16;
const LEAF_FLAG: u8 = 0x01;

/// Smallest odd pair-count capacity a node is allowed to have, per spec.
pub(crate) const VERY_MIN_KEY_VALUE_PAIR_CAPACITY: usize = 3;

/// Precomputed slot geometry for a given `(page_size, key_size, value_size)`
/// triple. Shared by every node in one `BTree` — node shape never varies
/// within a tree.
#[derive(Clone, Copy, Debug)]
pub(crate) struct NodeLayout {
    pub page_size: u64,
    pub key_size: usize,
    pub value_size: usize,
    /// The largest odd pair count that fits in one page.
    pub m: usize,
}

impl NodeLayout {
    /// Solves for the largest odd `m` such that
    /// `HEADER + m*(key+value) + (m+1)*8 <= page_size`. Fails if even
    /// `m = VERY_MIN_KEY_VALUE_PAIR_CAPACITY`
    /// doesn't fit (page too small for these key/value sizes).
    pub fn compute(page_size: u64, key_size: usize, value_size: usize) -> Result<Self> {
        let idx_size = 8u64;
        let pair_size = (key_size + value_size) as u64;
        let budget = page_size.saturating_sub(NODE_HEADER_SIZE + idx_size);
        let mut m = (budget / (pair_size + idx_size)) as i64;
        if m % 2 == 0 {
            m -= 1;
        }
        if m < VERY_MIN_KEY_VALUE_PAIR_CAPACITY as i64 {
            return Err(StorageError::argument(format!(
                "page_size {page_size} is too small to hold {VERY_MIN_KEY_VALUE_PAIR_CAPACITY} \
                 pairs of size {key_size}+{value_size}"
            )));
        }
        Ok(NodeLayout {
            page_size,
            key_size,
            value_size,
            m: m as usize,
        })
    }

    fn key_offset(&self, i: usize) -> usize {
        NODE_HEADER_SIZE as usize + i * self.key_size
    }

    fn value_offset(&self, i: usize) -> usize {
        NODE_HEADER_SIZE as usize + self.m * self.key_size + i * self.value_size
    }

    fn child_offset(&self, i: usize) -> usize {
        NODE_HEADER_SIZE as usize + self.m * (self.key_size + self.value_size) + i * 8
    }

    /// Minimum legal live pair count for a non-root node. The split
    /// algorithm (§4.5) promotes the pair at index `m = M/2` and leaves
    /// exactly `m` pairs behind in the left half, so `m` is simultaneously
    /// the split point and the only fill level two full siblings can
    /// merge back out of (`m + m + 1 == M`). The prose's `⌈M/2⌉` does not
    /// satisfy that arithmetic for odd `M`; `M/2` (floor) is what the
    /// split and merge algorithms actually require.
    pub fn min_fill(&self) -> usize {
        self.m / 2
    }
}

/// A node's decoded in-memory form. `children` is empty for a leaf and has
/// `keys.len() + 1` entries for an internal node.
#[derive(Clone, Debug)]
pub(crate) struct Node<K, V> {
    pub is_leaf: bool,
    pub keys: Vec<K>,
    pub values: Vec<V>,
    pub children: Vec<PageIndex>,
}

impl<K, V> Node<K, V> {
    pub fn new_leaf() -> Self {
        Node {
            is_leaf: true,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn new_internal() -> Self {
        Node {
            is_leaf: false,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn pair_count(&self) -> usize {
        self.keys.len()
    }
}

pub(crate) fn encode_node<K, V>(
    node: &Node<K, V>,
    layout: &NodeLayout,
    key_ser: &dyn Serializer<K>,
    value_ser: &dyn Serializer<V>,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; layout.page_size as usize];
    let n = node.pair_count();
    if n > layout.m {
        return Err(StorageError::invalid_operation(format!(
            "node has {n} pairs, exceeds capacity {}",
            layout.m
        )));
    }
    buf[0] = if node.is_leaf { LEAF_FLAG } else { 0 };
    buf[1..9].copy_from_slice(&(n as u64).to_le_bytes());
    for i in 0..n {
        let ko = layout.key_offset(i);
        key_ser.encode(&node.keys[i], &mut buf[ko..ko + layout.key_size])?;
        let vo = layout.value_offset(i);
        value_ser.encode(&node.values[i], &mut buf[vo..vo + layout.value_size])?;
    }
    if !node.is_leaf {
        debug_assert_eq!(node.children.len(), n + 1);
        for (i, child) in node.children.iter().enumerate() {
            let co = layout.child_offset(i);
            buf[co..co + 8].copy_from_slice(&child.to_le_bytes());
        }
    }
    Ok(buf)
}

pub(crate) fn decode_node<K, V>(
    buf: &[u8],
    layout: &NodeLayout,
    key_ser: &dyn Serializer<K>,
    value_ser: &dyn Serializer<V>,
) -> Result<Node<K, V>> {
    let is_leaf = buf[0] & LEAF_FLAG != 0;
    let mut n_bytes = [0u8; 8];
    n_bytes.copy_from_slice(&buf[1..9]);
    let n = u64::from_le_bytes(n_bytes) as usize;
    if n > layout.m {
        return Err(StorageError::corrupt(format!(
            "node claims {n} pairs, exceeds capacity {}",
            layout.m
        )));
    }
    let mut keys = Vec::with_capacity(n);
    let mut values = Vec::with_capacity(n);
    for i in 0..n {
        let ko = layout.key_offset(i);
        keys.push(key_ser.decode(&buf[ko..ko + layout.key_size])?);
        let vo = layout.value_offset(i);
        values.push(value_ser.decode(&buf[vo..vo + layout.value_size])?);
    }
    let mut children = Vec::new();
    if !is_leaf {
        children.reserve(n + 1);
        for i in 0..=n {
            let co = layout.child_offset(i);
            let mut cb = [0u8; 8];
            cb.copy_from_slice(&buf[co..co + 8]);
            children.push(u64::from_le_bytes(cb));
        }
    }
    Ok(Node {
        is_leaf,
        keys,
        values,
        children,
    })
}

/// Splits a full node (`M` pairs) at `mid = M/2`: the pair at
/// `mid` is promoted, `[0,mid)` stays in the left half, `[mid+1,M)` moves
/// to the new right half (and, for internal nodes, children `[mid+1,M]`
/// move with it).
pub(crate) fn split_in_half<K: Clone, V: Clone>(
    node: &Node<K, V>,
    mid: usize,
) -> (K, V, Node<K, V>, Node<K, V>) {
    let promoted_key = node.keys[mid].clone();
    let promoted_value = node.values[mid].clone();

    let left = Node {
        is_leaf: node.is_leaf,
        keys: node.keys[..mid].to_vec(),
        values: node.values[..mid].to_vec(),
        children: if node.is_leaf {
            Vec::new()
        } else {
            node.children[..=mid].to_vec()
        },
    };
    let right = Node {
        is_leaf: node.is_leaf,
        keys: node.keys[mid + 1..].to_vec(),
        values: node.values[mid + 1..].to_vec(),
        children: if node.is_leaf {
            Vec::new()
        } else {
            node.children[mid + 1..].to_vec()
        },
    };
    (promoted_key, promoted_value, left, right)
}
