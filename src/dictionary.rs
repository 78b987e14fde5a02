//! `StorageDictionary`: a `BTree` bound to one reserved handle page.
//!
//! The handle page's first sixteen bytes are the root index (`i64`,
//! `-1` = none) and the live pair count (`i64`); the remainder is a
//! fixed-size, caller-owned `AuxDataSize` blob the dictionary never
//! interprets.
//!
//! Every mutating call re-persists the handle afterward, so a reload
//! always sees the tree exactly as the last completed mutation left it.

use std::cmp::Ordering;

use crate::btree::{BTree, InsertOutcome, Traverse};
use crate::error::{Result, StorageError};
use crate::progress::{CancellationToken, ProgressSink};
use crate::serializer::Serializer;
use crate::storage::{PageIndex, PageStorage};

const HANDLE_ROOT_OFFSET: u64 = 0;
const HANDLE_COUNT_OFFSET: u64 = 8;
const HANDLE_AUX_OFFSET: u64 = 16;
const HANDLE_PREFIX_SIZE: u64 = 16;

/// A `BTree` plus the one page that durably records its root and count.
pub struct StorageDictionary<P, K, V, SK, SV, C> {
    tree: BTree<P, K, V, SK, SV, C>,
    handle_page: PageIndex,
    aux_data_size: usize,
}

impl<P, K, V, SK, SV, C> StorageDictionary<P, K, V, SK, SV, C>
where
    P: PageStorage,
    K: Clone,
    V: Clone,
    SK: Serializer<K>,
    SV: Serializer<V>,
    C: Fn(&K, &K) -> Ordering,
{
    /// Allocates a fresh handle page and binds a brand-new, empty tree to
    /// it. `aux_data_size` is the caller-reserved blob's width; it must
    /// fit alongside the 16-byte root/count prefix on one page.
    pub fn create(
        mut storage: P,
        key_ser: SK,
        value_ser: SV,
        cmp: C,
        max_move_pair_count: usize,
        aux_data_size: usize,
    ) -> Result<Self> {
        if HANDLE_PREFIX_SIZE as usize + aux_data_size > storage.page_size() as usize {
            return Err(StorageError::out_of_range(
                "aux_data_size",
                "does not fit on one page alongside the root/count prefix",
            ));
        }
        let handle_page = match storage.try_allocate_page()? {
            Some(idx) => idx,
            None => {
                return Err(StorageError::not_enough_space(
                    "no free page for the dictionary handle",
                ))
            }
        };
        let tree = BTree::new(storage, None, 0, key_ser, value_ser, cmp, max_move_pair_count)?;
        let mut dict = StorageDictionary {
            tree,
            handle_page,
            aux_data_size,
        };
        dict.persist_handle()?;
        Ok(dict)
    }

    /// Reads a previously-created handle page and resumes the tree it
    /// describes. `aux_data_size` must match what `create` was given.
    pub fn load(
        mut storage: P,
        handle_page: PageIndex,
        key_ser: SK,
        value_ser: SV,
        cmp: C,
        max_move_pair_count: usize,
        aux_data_size: usize,
    ) -> Result<Self> {
        if !storage.is_page_allocated(handle_page) {
            return Err(StorageError::argument(format!(
                "handle page {handle_page} is not allocated"
            )));
        }
        let mut prefix = [0u8; HANDLE_PREFIX_SIZE as usize];
        storage.read_from(handle_page, HANDLE_ROOT_OFFSET, &mut prefix, 0, prefix.len())?;
        let root_raw = i64::from_le_bytes(prefix[0..8].try_into().unwrap());
        let count_raw = i64::from_le_bytes(prefix[8..16].try_into().unwrap());
        if count_raw < 0 {
            return Err(StorageError::corrupt(format!(
                "handle page {handle_page} has negative pair count {count_raw}"
            )));
        }
        let root = if root_raw < 0 {
            None
        } else {
            Some(root_raw as u64)
        };
        let tree = BTree::new(
            storage,
            root,
            count_raw as u64,
            key_ser,
            value_ser,
            cmp,
            max_move_pair_count,
        )?;
        Ok(StorageDictionary {
            tree,
            handle_page,
            aux_data_size,
        })
    }

    fn persist_handle(&mut self) -> Result<()> {
        let root_raw: i64 = match self.tree.root() {
            None => -1,
            Some(idx) => idx as i64,
        };
        let count_raw = self.tree.count() as i64;
        let mut prefix = [0u8; HANDLE_PREFIX_SIZE as usize];
        prefix[0..8].copy_from_slice(&root_raw.to_le_bytes());
        prefix[8..16].copy_from_slice(&count_raw.to_le_bytes());
        let handle_page = self.handle_page;
        let len = prefix.len();
        self.tree
            .storage_mut()
            .write_to(handle_page, HANDLE_ROOT_OFFSET, &prefix, 0, len)
    }

    pub fn handle_page(&self) -> PageIndex {
        self.handle_page
    }

    pub fn count(&self) -> u64 {
        self.tree.count()
    }

    pub fn storage(&self) -> &P {
        self.tree.storage()
    }

    pub fn storage_mut(&mut self) -> &mut P {
        self.tree.storage_mut()
    }

    /// Reads the caller-reserved auxiliary blob from the handle page.
    pub fn read_aux_data(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.aux_data_size];
        let len = buf.len();
        let handle_page = self.handle_page;
        self.tree
            .storage_mut()
            .read_from(handle_page, HANDLE_AUX_OFFSET, &mut buf, 0, len)?;
        Ok(buf)
    }

    /// Overwrites the caller-reserved auxiliary blob on the handle page.
    /// Fails if `data.len()` doesn't match the `aux_data_size` the
    /// dictionary was created/loaded with.
    pub fn write_aux_data(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.aux_data_size {
            return Err(StorageError::argument(format!(
                "aux data is {} bytes, expected {}",
                data.len(),
                self.aux_data_size
            )));
        }
        let handle_page = self.handle_page;
        let len = data.len();
        self.tree
            .storage_mut()
            .write_to(handle_page, HANDLE_AUX_OFFSET, data, 0, len)
    }

    pub fn try_get_value(&mut self, key: &K, cancel: &CancellationToken) -> Result<Option<V>> {
        self.tree.try_get_value(key, cancel)
    }

    pub fn update_value(&mut self, key: &K, value: V) -> Result<()> {
        self.tree.update_value(key, value)
    }

    pub fn insert(&mut self, key: K, value: V, update_if_exists: bool) -> Result<InsertOutcome> {
        let outcome = self.tree.insert(key, value, update_if_exists)?;
        self.persist_handle()?;
        Ok(outcome)
    }

    pub fn remove(&mut self, key: &K) -> Result<bool> {
        let removed = self.tree.remove(key)?;
        if removed {
            self.persist_handle()?;
        }
        Ok(removed)
    }

    pub fn traverse(
        &mut self,
        ascending: bool,
        cancel: CancellationToken,
    ) -> Traverse<'_, P, K, V, SK, SV, C> {
        self.tree.traverse(ascending, cancel)
    }

    /// Validates both the wrapped `BTree`'s structure and that the handle
    /// page's persisted `(root, count)` agrees with the in-memory tree.
    pub fn validate(
        &mut self,
        progress: Option<&mut dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if !self.tree.storage().is_page_allocated(self.handle_page) {
            return Err(StorageError::corrupt("dictionary handle page is not allocated"));
        }
        let mut prefix = [0u8; HANDLE_PREFIX_SIZE as usize];
        let handle_page = self.handle_page;
        let len = prefix.len();
        self.tree
            .storage_mut()
            .read_from(handle_page, HANDLE_ROOT_OFFSET, &mut prefix, 0, len)?;
        let root_raw = i64::from_le_bytes(prefix[0..8].try_into().unwrap());
        let count_raw = i64::from_le_bytes(prefix[8..16].try_into().unwrap());
        let expected_root: i64 = match self.tree.root() {
            None => -1,
            Some(idx) => idx as i64,
        };
        if root_raw != expected_root || count_raw as u64 != self.tree.count() {
            return Err(StorageError::corrupt(
                "dictionary handle page diverged from its tree's in-memory state",
            ));
        }
        self.tree.validate(progress, cancel)
    }

    pub fn into_tree(self) -> BTree<P, K, V, SK, SV, C> {
        self.tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::DEFAULT_MAX_MOVE_PAIR_COUNT;
    use crate::serializer::{I64Serializer, U64Serializer};
    use crate::storage::streaming::StreamingPageStorage;
    use std::io::Cursor;

    type TestDict = StorageDictionary<
        StreamingPageStorage<Cursor<Vec<u8>>>,
        i64,
        u64,
        I64Serializer,
        U64Serializer,
        fn(&i64, &i64) -> Ordering,
    >;

    fn new_dict(aux_data_size: usize) -> TestDict {
        let none = CancellationToken::none();
        let storage =
            StreamingPageStorage::create(Cursor::new(Vec::new()), 128, 2, None, &none, false, 2)
                .unwrap();
        StorageDictionary::create(
            storage,
            I64Serializer,
            U64Serializer,
            (|a: &i64, b: &i64| a.cmp(b)) as fn(&i64, &i64) -> Ordering,
            DEFAULT_MAX_MOVE_PAIR_COUNT,
            aux_data_size,
        )
        .unwrap()
    }

    #[test]
    fn create_reserves_handle_page_zero_and_starts_empty() {
        let dict = new_dict(8);
        assert_eq!(dict.handle_page(), 0);
        assert_eq!(dict.count(), 0);
    }

    #[test]
    fn aux_data_round_trips_and_survives_mutation() {
        let mut dict = new_dict(8);
        dict.write_aux_data(b"userdat!").unwrap();
        dict.insert(1, 10, false).unwrap();
        assert_eq!(dict.read_aux_data().unwrap(), b"userdat!".to_vec());
    }

    #[test]
    fn insert_and_remove_update_count_and_lookup() {
        let none = CancellationToken::none();
        let mut dict = new_dict(0);
        for k in 0..50i64 {
            dict.insert(k, k as u64, false).unwrap();
        }
        assert_eq!(dict.count(), 50);
        assert_eq!(dict.try_get_value(&10, &none).unwrap(), Some(10));

        dict.remove(&10).unwrap();
        assert_eq!(dict.count(), 49);
        assert_eq!(dict.try_get_value(&10, &none).unwrap(), None);
    }

    #[test]
    fn reload_from_same_medium_sees_persisted_state() {
        let none = CancellationToken::none();
        let storage =
            StreamingPageStorage::create(Cursor::new(Vec::new()), 128, 2, None, &none, false, 2)
                .unwrap();
        let mut dict = StorageDictionary::create(
            storage,
            I64Serializer,
            U64Serializer,
            (|a: &i64, b: &i64| a.cmp(b)) as fn(&i64, &i64) -> Ordering,
            DEFAULT_MAX_MOVE_PAIR_COUNT,
            0,
        )
        .unwrap();
        for k in 0..50i64 {
            dict.insert(k, k as u64, false).unwrap();
        }
        let handle_page = dict.handle_page();
        let medium = dict.into_tree().into_storage().into_inner();

        let reopened_storage = StreamingPageStorage::load(medium, true, true, false).unwrap();
        let mut reopened = StorageDictionary::load(
            reopened_storage,
            handle_page,
            I64Serializer,
            U64Serializer,
            (|a: &i64, b: &i64| a.cmp(b)) as fn(&i64, &i64) -> Ordering,
            DEFAULT_MAX_MOVE_PAIR_COUNT,
            0,
        )
        .unwrap();
        assert_eq!(reopened.count(), 50);
        for k in 0..50i64 {
            assert_eq!(reopened.try_get_value(&k, &none).unwrap(), Some(k as u64));
        }
        assert!(reopened.validate(None, &none).unwrap());
    }
}
