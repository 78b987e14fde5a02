//! `CachedPageStorage`: an LRU page cache wrapped around any `PageStorage`.
//!
//! No external LRU crate: an intrusive doubly linked list (parallel `Vec`s
//! of nodes and slots, indexed by a stable slot id, with a free list for
//! reuse) backs the cache. Per-page [`DataRegionSet`]s track which byte
//! ranges of a cached page are valid and which are dirty, so a page can
//! be partially cached without eagerly reading the whole thing.

use super::{PageIndex, PageStorage};
use crate::error::{Result, StorageError};
use crate::progress::{CancellationToken, ProgressSink};
use crate::region::{DataRegion, DataRegionSet};
use std::collections::HashMap;

/// How a [`CachedPageStorage`] treats writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheMode {
    /// No writes permitted through the cache at all.
    ReadOnly,
    /// Every write is mirrored to the inner store immediately.
    WriteThrough,
    /// Writes accumulate in the cache and reach the inner store only on
    /// eviction or an explicit [`CachedPageStorage::flush`].
    WriteBack,
}

struct CacheEntry {
    page: PageIndex,
    buf: Vec<u8>,
    cached: DataRegionSet,
    dirty: DataRegionSet,
}

struct LruNode {
    prev: Option<usize>,
    next: Option<usize>,
}

/// Wraps any [`PageStorage`] with a bounded-size LRU page cache.
///
/// `Drop` makes a best-effort attempt to flush dirty `WriteBack` pages to
/// the inner store, since a cache falling out of scope unflushed must not
/// silently discard committed writes. Its I/O errors cannot be reported
/// from `drop`, though, so prefer an explicit [`Self::flush`] or
/// [`Self::into_inner`] call when the caller needs to know flushing
/// actually succeeded.
pub struct CachedPageStorage<P: PageStorage> {
    /// `None` only in the instant between `into_inner`/`drop` taking
    /// ownership of the wrapped store and the `CachedPageStorage` itself
    /// going out of scope; every other method sees `Some`.
    inner: Option<P>,
    mode: CacheMode,
    capacity: usize,
    index: HashMap<PageIndex, usize>,
    nodes: Vec<LruNode>,
    slots: Vec<Option<CacheEntry>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    simulate_out_of_memory: bool,
}

impl<P: PageStorage> CachedPageStorage<P> {
    /// Wraps `inner` with a cache that holds at most `capacity` pages
    /// resident at once.
    pub fn new(inner: P, mode: CacheMode, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(StorageError::out_of_range("capacity", "must be >= 1"));
        }
        Ok(CachedPageStorage {
            inner: Some(inner),
            mode,
            capacity,
            index: HashMap::new(),
            nodes: Vec::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            simulate_out_of_memory: false,
        })
    }

    /// Diagnostic test hook: forces every subsequent admission
    /// to fail as though the allocator refused it, so callers can exercise
    /// the direct-inner-store-I/O fallback path without actually filling
    /// memory. Does not evict or disturb pages already resident.
    pub fn simulate_out_of_memory(&mut self, on: bool) {
        self.simulate_out_of_memory = on;
    }

    /// Number of pages currently resident in the cache.
    pub fn resident_count(&self) -> usize {
        self.index.len()
    }

    /// Returns the wrapped store, after flushing any pending writes.
    pub fn into_inner(mut self) -> Result<P> {
        self.flush()?;
        Ok(self.inner.take().expect("inner is Some until into_inner/drop"))
    }

    fn inner(&self) -> &P {
        self.inner.as_ref().expect("inner is Some until into_inner/drop")
    }

    fn inner_mut(&mut self) -> &mut P {
        self.inner.as_mut().expect("inner is Some until into_inner/drop")
    }

    fn detach(&mut self, id: usize) {
        let (prev, next) = (self.nodes[id].prev, self.nodes[id].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[id].prev = None;
        self.nodes[id].next = None;
    }

    fn push_front(&mut self, id: usize) {
        self.nodes[id].prev = None;
        self.nodes[id].next = self.head;
        if let Some(h) = self.head {
            self.nodes[h].prev = Some(id);
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }

    fn touch(&mut self, id: usize) {
        if self.head == Some(id) {
            return;
        }
        self.detach(id);
        self.push_front(id);
    }

    fn alloc_slot(&mut self, entry: CacheEntry) -> usize {
        let id = if let Some(id) = self.free.pop() {
            self.slots[id] = Some(entry);
            self.nodes[id] = LruNode { prev: None, next: None };
            id
        } else {
            self.slots.push(Some(entry));
            self.nodes.push(LruNode { prev: None, next: None });
            self.slots.len() - 1
        };
        self.push_front(id);
        id
    }

    /// Writes a cache entry's dirty regions back to `inner` and clears
    /// them. Leaves the entry resident.
    fn flush_entry(inner: &mut P, entry: &mut CacheEntry) -> Result<()> {
        let dirty_regions: Vec<DataRegion> = entry.dirty.members().to_vec();
        for region in dirty_regions {
            let off = region.first();
            let len = region.len() as usize;
            inner.write_to(
                entry.page,
                off,
                &entry.buf,
                off as usize,
                len,
            )?;
        }
        entry.dirty = DataRegionSet::new();
        Ok(())
    }

    fn evict_slot(&mut self, id: usize) -> Result<()> {
        self.detach(id);
        if let Some(mut entry) = self.slots[id].take() {
            if self.mode == CacheMode::WriteBack {
                Self::flush_entry(self.inner_mut(), &mut entry)?;
            }
            self.index.remove(&entry.page);
            log::debug!("CACHE_EVICT [page={}]", entry.page);
        }
        self.free.push(id);
        Ok(())
    }

    fn evict_lru_if_full(&mut self) -> Result<()> {
        if self.index.len() < self.capacity {
            return Ok(());
        }
        if let Some(tail) = self.tail {
            self.evict_slot(tail)?;
        }
        Ok(())
    }

    /// Finds or creates a resident entry for `page`, moving it to the
    /// most-recently-used position. Evicts the LRU entry if the cache is
    /// already at capacity and `page` is not already resident. Returns
    /// `Ok(None)` when admission is refused (currently only by
    /// [`Self::simulate_out_of_memory`]) — the caller degrades to a direct
    /// inner-store access for that one operation.
    fn entry_for(&mut self, page: PageIndex) -> Result<Option<usize>> {
        if let Some(&id) = self.index.get(&page) {
            self.touch(id);
            return Ok(Some(id));
        }
        if self.simulate_out_of_memory {
            log::warn!("CACHE_ADMIT_REFUSED [page={page}] (simulated out of memory)");
            return Ok(None);
        }
        self.evict_lru_if_full()?;
        let page_size = self.inner().page_size() as usize;
        let entry = CacheEntry {
            page,
            buf: vec![0u8; page_size],
            cached: DataRegionSet::new(),
            dirty: DataRegionSet::new(),
        };
        let id = self.alloc_slot(entry);
        self.index.insert(page, id);
        log::debug!("CACHE_ADMIT [page={page}]");
        Ok(Some(id))
    }

    /// Drops `page` from the cache without writing back dirty data. Used
    /// when a shrink has already removed the page from the inner store, so
    /// any dirty bytes held for it are stale and must not be flushed.
    fn discard(&mut self, page: PageIndex) {
        if let Some(id) = self.index.remove(&page) {
            self.detach(id);
            self.slots[id] = None;
            self.free.push(id);
        }
    }

    /// Evicts every resident page, flushing dirty data first. A test hook
    /// for exercising cache-miss paths under simulated memory pressure.
    pub fn evict_all(&mut self) -> Result<()> {
        let ids: Vec<usize> = self.index.values().copied().collect();
        for id in ids {
            self.evict_slot(id)?;
        }
        Ok(())
    }

    fn ensure_region_cached(&mut self, id: usize, region: DataRegion) -> Result<()> {
        let missing: Vec<DataRegion> = {
            let entry = self.slots[id].as_ref().unwrap();
            entry
                .cached
                .get_missing_regions(region)
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        for gap in missing {
            let off = gap.first();
            let len = gap.len() as usize;
            let page = self.slots[id].as_ref().unwrap().page;
            let mut buf = vec![0u8; len];
            if self.inner().is_page_allocated(page) {
                self.inner_mut().read_from(page, off, &mut buf, 0, len)?;
            }
            let entry = self.slots[id].as_mut().unwrap();
            entry.buf[off as usize..off as usize + len].copy_from_slice(&buf);
            entry.cached.add(gap);
        }
        Ok(())
    }
}

impl<P: PageStorage> PageStorage for CachedPageStorage<P> {
    fn page_size(&self) -> u64 {
        self.inner().page_size()
    }

    fn page_capacity(&self) -> u64 {
        self.inner().page_capacity()
    }

    fn allocated_page_count(&self) -> u64 {
        self.inner().allocated_page_count()
    }

    fn is_read_only(&self) -> bool {
        self.mode == CacheMode::ReadOnly || self.inner().is_read_only()
    }

    fn is_capacity_fixed(&self) -> bool {
        self.mode == CacheMode::ReadOnly || self.inner().is_capacity_fixed()
    }

    fn try_allocate_page(&mut self) -> Result<Option<PageIndex>> {
        if self.mode == CacheMode::ReadOnly {
            return Err(StorageError::invalid_operation("cache is read-only"));
        }
        self.inner_mut().try_allocate_page()
    }

    fn free_page(&mut self, index: PageIndex) -> Result<bool> {
        if self.mode == CacheMode::ReadOnly {
            return Err(StorageError::invalid_operation("cache is read-only"));
        }
        if let Some(&id) = self.index.get(&index) {
            self.evict_slot(id)?;
        }
        self.inner_mut().free_page(index)
    }

    fn is_page_allocated(&self, index: PageIndex) -> bool {
        self.inner().is_page_allocated(index)
    }

    fn is_page_on_storage(&self, index: PageIndex) -> bool {
        self.inner().is_page_on_storage(index)
    }

    fn read_from(
        &mut self,
        page: PageIndex,
        src_off: u64,
        buf: &mut [u8],
        dst_off: usize,
        len: usize,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let region = DataRegion::new(src_off, src_off + len as u64 - 1)?;
        match self.entry_for(page)? {
            Some(id) => {
                self.ensure_region_cached(id, region)?;
                let entry = self.slots[id].as_ref().unwrap();
                buf[dst_off..dst_off + len]
                    .copy_from_slice(&entry.buf[src_off as usize..src_off as usize + len]);
            }
            None => self.inner_mut().read_from(page, src_off, buf, dst_off, len)?,
        }
        Ok(())
    }

    fn write_to(
        &mut self,
        page: PageIndex,
        dst_off: u64,
        buf: &[u8],
        src_off: usize,
        len: usize,
    ) -> Result<()> {
        if self.mode == CacheMode::ReadOnly {
            return Err(StorageError::invalid_operation("cache is read-only"));
        }
        if len == 0 {
            return Ok(());
        }
        let region = DataRegion::new(dst_off, dst_off + len as u64 - 1)?;
        let id = match self.entry_for(page)? {
            Some(id) => id,
            None => {
                // Admission was refused: degrade to a direct inner-store
                // write. The page isn't resident, so there is no cached
                // or dirty state to reconcile — visible semantics are
                // identical to the cached path.
                self.inner_mut().write_to(page, dst_off, buf, src_off, len)?;
                return Ok(());
            }
        };
        {
            let entry = self.slots[id].as_mut().unwrap();
            entry.buf[dst_off as usize..dst_off as usize + len]
                .copy_from_slice(&buf[src_off..src_off + len]);
            entry.cached.add(region);
        }
        match self.mode {
            CacheMode::WriteThrough => {
                self.inner_mut().write_to(page, dst_off, buf, src_off, len)?;
            }
            CacheMode::WriteBack => {
                let entry = self.slots[id].as_mut().unwrap();
                entry.dirty.add(region);
            }
            CacheMode::ReadOnly => unreachable!(),
        }
        Ok(())
    }

    fn try_inflate(
        &mut self,
        amount: u64,
        progress: Option<&mut dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if self.mode == CacheMode::ReadOnly {
            return Err(StorageError::invalid_operation("cache is read-only"));
        }
        self.inner_mut().try_inflate(amount, progress, cancel)
    }

    fn try_deflate(
        &mut self,
        amount: u64,
        progress: Option<&mut dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if self.mode == CacheMode::ReadOnly {
            return Err(StorageError::invalid_operation("cache is read-only"));
        }
        let removed = self.inner_mut().try_deflate(amount, progress, cancel)?;
        let floor = self.inner().page_capacity();
        let stale: Vec<PageIndex> = self
            .index
            .keys()
            .copied()
            .filter(|&p| p >= floor)
            .collect();
        for page in stale {
            self.discard(page);
        }
        Ok(removed)
    }

    fn entry_page_index(&self) -> Option<PageIndex> {
        self.inner().entry_page_index()
    }

    fn set_entry_page_index(&mut self, index: Option<PageIndex>) -> Result<()> {
        if self.mode == CacheMode::ReadOnly {
            return Err(StorageError::invalid_operation("cache is read-only"));
        }
        // Always write-through: this pointer is small, precious metadata.
        self.inner_mut().set_entry_page_index(index)
    }

    fn validate(
        &mut self,
        progress: Option<&mut dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.flush()?;
        self.inner_mut().validate(progress, cancel)
    }

    fn flush(&mut self) -> Result<()> {
        if self.mode == CacheMode::WriteBack {
            let ids: Vec<usize> = self.index.values().copied().collect();
            for id in ids {
                if let Some(mut entry) = self.slots[id].take() {
                    Self::flush_entry(self.inner_mut(), &mut entry)?;
                    self.slots[id] = Some(entry);
                }
            }
        }
        self.inner_mut().flush()
    }
}

impl<P: PageStorage> Drop for CachedPageStorage<P> {
    fn drop(&mut self) {
        if self.mode != CacheMode::WriteBack || self.inner.is_none() {
            return;
        }
        let ids: Vec<usize> = self.index.values().copied().collect();
        for id in ids {
            if let Some(mut entry) = self.slots[id].take() {
                if let Err(e) = Self::flush_entry(self.inner_mut(), &mut entry) {
                    log::warn!("CACHE_DROP_FLUSH_FAILED [page={}]: {e}", entry.page);
                }
            }
        }
    }
}
