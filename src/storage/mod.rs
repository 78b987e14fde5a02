//! The `IPageStorage` contract and its two implementations.
//!
//! `PageStorage` is the small, closed capability set every paged block
//! store exposes: [`streaming::StreamingPageStorage`] implements it
//! directly over a byte medium; [`cached::CachedPageStorage`] wraps any
//! `PageStorage` with an LRU cache and implements it again, so the two
//! are interchangeable wherever a `&mut dyn PageStorage` (or a generic
//! `P: PageStorage`) is expected — the B-tree never knows which one it
//! has.

pub mod cached;
pub mod streaming;

use crate::error::Result;
use crate::progress::{CancellationToken, ProgressSink};

/// A page index; `None` is the "no page" sentinel (encoded on disk as
/// `-1`).
pub type PageIndex = u64;

/// The minimum legal `PageSize`. Small enough for tests to exercise many
/// pages cheaply, large enough that a node can hold at least the
/// `VeryMinKeyValuePairCapacity = 3` pairs the B-tree requires.
pub const MIN_PAGE_SIZE: u64 = 128;

/// Paged block storage: fixed `PageSize`, a `PageCapacity` that may grow
/// or shrink, an allocation bitmap, and per-page random I/O.
///
/// Implementors must not leak their concrete type across this boundary —
/// callers (the cache, the B-tree) only ever hold a `&mut dyn PageStorage`
/// or a generic `P: PageStorage` type parameter.
pub trait PageStorage {
    /// Fixed at creation; never changes for the lifetime of the store.
    fn page_size(&self) -> u64;

    /// The number of pages the store currently has room for. May grow or
    /// shrink via `try_inflate`/`try_deflate`.
    fn page_capacity(&self) -> u64;

    /// Number of pages currently allocated.
    fn allocated_page_count(&self) -> u64;

    /// `true` if no write operation is permitted.
    fn is_read_only(&self) -> bool;

    /// `true` if `page_capacity` cannot change (fixed-capacity store, or
    /// a cache in `ReadOnly` mode wrapping anything).
    fn is_capacity_fixed(&self) -> bool;

    /// Attempts to allocate a free page, returning its index.
    fn try_allocate_page(&mut self) -> Result<Option<PageIndex>>;

    /// Frees `index`. Idempotent: returns whether a bit actually flipped
    /// from set to clear. Fails if `index` is out of range.
    fn free_page(&mut self, index: PageIndex) -> Result<bool>;

    /// `true` iff `index` is within range and currently allocated.
    fn is_page_allocated(&self, index: PageIndex) -> bool;

    /// `true` iff `index` is within `[0, page_capacity)`, allocated or not.
    fn is_page_on_storage(&self, index: PageIndex) -> bool;

    /// Reads `len` bytes from `page` at `src_off` into `buf[dst_off..]`.
    fn read_from(
        &mut self,
        page: PageIndex,
        src_off: u64,
        buf: &mut [u8],
        dst_off: usize,
        len: usize,
    ) -> Result<()>;

    /// Writes `len` bytes from `buf[src_off..]` into `page` at `dst_off`.
    fn write_to(
        &mut self,
        page: PageIndex,
        dst_off: u64,
        buf: &[u8],
        src_off: usize,
        len: usize,
    ) -> Result<()>;

    /// Grows `page_capacity` by up to `amount` pages, returning the
    /// number actually added.
    fn try_inflate(
        &mut self,
        amount: u64,
        progress: Option<&mut dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<u64>;

    /// Shrinks `page_capacity` by up to `amount` pages, returning the
    /// number actually removed. Never frees the last allocated page from
    /// the tail to make room.
    fn try_deflate(
        &mut self,
        amount: u64,
        progress: Option<&mut dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<u64>;

    /// The store-level entry page pointer, if any.
    fn entry_page_index(&self) -> Option<PageIndex>;

    /// Sets the store-level entry page pointer. Writable only when the
    /// store is not read-only.
    fn set_entry_page_index(&mut self, index: Option<PageIndex>) -> Result<()>;

    /// Structural self-check: header, bitmap, and allocation count are
    /// mutually consistent. `Ok(true)` if sound, `Ok(false)` if
    /// cancelled, `Err(Corrupt)` on a genuine mismatch.
    fn validate(
        &mut self,
        progress: Option<&mut dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    /// Flushes any buffered state to the medium. A no-op for stores with
    /// no write buffering of their own (`CachedPageStorage` overrides
    /// this meaningfully).
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
