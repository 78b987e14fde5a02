//! `StreamingPageStorage`: a concrete `PageStorage` over a byte medium.
//!
//! Owns a `Disk: Read + Write + Seek` medium and persists a small header
//! on every mutation: a bitmap allocator reuses freed pages, the header
//! carries a magic/version/checksum, and capacity changes go through
//! incremental, cancellable `try_inflate`/`try_deflate`.

use super::{PageIndex, PageStorage, MIN_PAGE_SIZE};
use crate::error::{Result, StorageError};
use crate::progress::{CancellationToken, ProgressSink};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// The byte medium a `StreamingPageStorage` is built on: anything
/// readable, writable, and seekable. Deliberately the crate's only
/// assumption about durable storage — it never assumes a `File`.
pub trait Disk: Read + Write + Seek {}
impl<T: Read + Write + Seek> Disk for T {}

const MAGIC: &[u8; 8] = b"PGSTORE1";
const VERSION: u32 = 1;

/// Fixed size of the on-disk header, magic through reserved padding.
pub const HEADER_SIZE: u64 = 64;

#[derive(Clone, Copy, Debug)]
struct Header {
    page_size: u64,
    page_capacity: u64,
    entry_page_index: i64,
    allocated_count: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..12].copy_from_slice(&VERSION.to_le_bytes());
        buf[12..20].copy_from_slice(&self.page_size.to_le_bytes());
        buf[20..28].copy_from_slice(&self.page_capacity.to_le_bytes());
        buf[28..36].copy_from_slice(&self.entry_page_index.to_le_bytes());
        buf[36..44].copy_from_slice(&self.allocated_count.to_le_bytes());
        let checksum = crate::binary::checksum32(&buf[0..44]);
        buf[44..48].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_SIZE as usize]) -> Result<Header> {
        if &buf[0..8] != MAGIC {
            return Err(StorageError::corrupt("bad magic signature"));
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if version != VERSION {
            return Err(StorageError::corrupt(format!(
                "unsupported version {version}"
            )));
        }
        let expected_checksum = u32::from_le_bytes(buf[44..48].try_into().unwrap());
        let actual_checksum = crate::binary::checksum32(&buf[0..44]);
        if expected_checksum != actual_checksum {
            return Err(StorageError::corrupt("header checksum mismatch"));
        }
        Ok(Header {
            page_size: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            page_capacity: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
            entry_page_index: i64::from_le_bytes(buf[28..36].try_into().unwrap()),
            allocated_count: u64::from_le_bytes(buf[36..44].try_into().unwrap()),
        })
    }
}

fn bitmap_bytes_for(capacity: u64) -> u64 {
    (capacity + 7) / 8
}

/// `HeaderSize + ceil(capacity/8) + capacity * pageSize`.
pub fn required_stream_size(page_size: u64, capacity: u64) -> u64 {
    HEADER_SIZE + bitmap_bytes_for(capacity) + capacity * page_size
}

/// A paged block store laid out directly on a byte medium: a fixed header,
/// an allocation bitmap, and a contiguous page array.
pub struct StreamingPageStorage<D: Disk> {
    medium: D,
    header: Header,
    bitmap: Vec<u8>,
    read_only: bool,
    fixed_capacity: bool,
    #[allow(dead_code)]
    leave_open: bool,
    growth_increment: u64,
}

impl<D: Disk> StreamingPageStorage<D> {
    fn page_array_start(&self) -> u64 {
        HEADER_SIZE + bitmap_bytes_for(self.header.page_capacity)
    }

    fn persist_header(&mut self) -> Result<()> {
        self.medium.seek(SeekFrom::Start(0))?;
        self.medium.write_all(&self.header.encode())?;
        Ok(())
    }

    fn persist_bitmap(&mut self) -> Result<()> {
        self.medium.seek(SeekFrom::Start(HEADER_SIZE))?;
        self.medium.write_all(&self.bitmap)?;
        Ok(())
    }

    fn persist_bitmap_byte(&mut self, byte_index: usize) -> Result<()> {
        self.medium
            .seek(SeekFrom::Start(HEADER_SIZE + byte_index as u64))?;
        self.medium.write_all(&self.bitmap[byte_index..byte_index + 1])?;
        Ok(())
    }

    fn extend_medium_to(&mut self, target_len: u64) -> Result<()> {
        let current = self.medium.seek(SeekFrom::End(0))?;
        if target_len <= current {
            return Ok(());
        }
        self.medium.seek(SeekFrom::Start(current))?;
        let mut remaining = target_len - current;
        let chunk = vec![0u8; 8192];
        while remaining > 0 {
            let take = remaining.min(chunk.len() as u64) as usize;
            self.medium.write_all(&chunk[..take])?;
            remaining -= take as u64;
        }
        Ok(())
    }

    /// Shifts `len` bytes starting at `old_start` so they instead start at
    /// `new_start` (`new_start > old_start`). Used when bitmap growth
    /// pushes the page array's start offset forward. The medium must
    /// already be long enough to hold the relocated data.
    fn shift_region_forward(&mut self, old_start: u64, len: u64, new_start: u64) -> Result<()> {
        if len == 0 || new_start == old_start {
            return Ok(());
        }
        let chunk_size: u64 = 8192;
        let mut remaining = len;
        let mut buf = vec![0u8; chunk_size as usize];
        while remaining > 0 {
            let take = remaining.min(chunk_size);
            let src_off = old_start + remaining - take;
            let dst_off = new_start + remaining - take;
            self.medium.seek(SeekFrom::Start(src_off))?;
            self.medium.read_exact(&mut buf[..take as usize])?;
            self.medium.seek(SeekFrom::Start(dst_off))?;
            self.medium.write_all(&buf[..take as usize])?;
            remaining -= take;
        }
        Ok(())
    }

    /// Mirror of [`Self::shift_region_forward`] for deflate: shifts a
    /// region backward (`new_start < old_start`).
    fn shift_region_backward(&mut self, old_start: u64, len: u64, new_start: u64) -> Result<()> {
        if len == 0 || new_start == old_start {
            return Ok(());
        }
        let chunk_size: u64 = 8192;
        let mut done = 0u64;
        let mut buf = vec![0u8; chunk_size as usize];
        while done < len {
            let take = (len - done).min(chunk_size);
            let src_off = old_start + done;
            let dst_off = new_start + done;
            self.medium.seek(SeekFrom::Start(src_off))?;
            self.medium.read_exact(&mut buf[..take as usize])?;
            self.medium.seek(SeekFrom::Start(dst_off))?;
            self.medium.write_all(&buf[..take as usize])?;
            done += take;
        }
        Ok(())
    }

    fn grow_by_one_page(&mut self) -> Result<()> {
        let page_size = self.header.page_size;
        let old_capacity = self.header.page_capacity;
        let new_capacity = old_capacity + 1;
        let old_bitmap_bytes = bitmap_bytes_for(old_capacity);
        let new_bitmap_bytes = bitmap_bytes_for(new_capacity);
        let extra_bitmap_bytes = new_bitmap_bytes - old_bitmap_bytes;

        let old_page_array_start = HEADER_SIZE + old_bitmap_bytes;
        let old_page_array_len = old_capacity * page_size;
        let new_page_array_start = HEADER_SIZE + new_bitmap_bytes;
        let new_total_len = new_page_array_start + old_page_array_len + page_size;

        // The medium is extended before anything else is mutated: if this
        // fails (the medium refuses to grow), no in-memory or on-disk
        // state has changed yet.
        self.extend_medium_to(new_total_len)?;

        if extra_bitmap_bytes > 0 {
            self.shift_region_forward(old_page_array_start, old_page_array_len, new_page_array_start)?;
            self.bitmap.push(0);
        }
        self.header.page_capacity = new_capacity;
        self.persist_bitmap()?;
        self.persist_header()?;
        Ok(())
    }

    fn shrink_by_one_page(&mut self) -> Result<()> {
        let page_size = self.header.page_size;
        let old_capacity = self.header.page_capacity;
        debug_assert!(old_capacity > 0);
        let new_capacity = old_capacity - 1;
        let old_bitmap_bytes = bitmap_bytes_for(old_capacity);
        let new_bitmap_bytes = bitmap_bytes_for(new_capacity);
        let shrink_bitmap_bytes = old_bitmap_bytes - new_bitmap_bytes;

        let old_page_array_start = HEADER_SIZE + old_bitmap_bytes;
        let new_page_array_start = HEADER_SIZE + new_bitmap_bytes;
        let remaining_page_array_len = new_capacity * page_size;

        if shrink_bitmap_bytes > 0 {
            self.shift_region_backward(
                old_page_array_start,
                remaining_page_array_len,
                new_page_array_start,
            )?;
            self.bitmap.pop();
        }
        self.header.page_capacity = new_capacity;
        // The shrunk header is persisted before the medium is reduced, so a
        // crash mid-shrink leaves a still-valid, larger store.
        self.persist_bitmap()?;
        self.persist_header()?;
        Ok(())
    }

    fn validate_page_index(&self, index: PageIndex) -> Result<()> {
        if index >= self.header.page_capacity {
            return Err(StorageError::out_of_range(
                "index",
                format!(
                    "page {index} is outside capacity {}",
                    self.header.page_capacity
                ),
            ));
        }
        Ok(())
    }

    fn bit_is_set(&self, index: PageIndex) -> bool {
        let byte = (index / 8) as usize;
        let bit = (index % 8) as u8;
        self.bitmap
            .get(byte)
            .map(|b| (b >> bit) & 1 == 1)
            .unwrap_or(false)
    }

    /// Creates a new store, growing the medium from zero pages up to
    /// `initial_capacity` in `growth_increment`-page chunks, reporting
    /// progress and honoring cancellation at each chunk boundary.
    pub fn create(
        medium: D,
        page_size: u64,
        initial_capacity: u64,
        mut progress: Option<&mut dyn ProgressSink>,
        cancel: &CancellationToken,
        leave_open: bool,
        growth_increment: u64,
    ) -> Result<Self> {
        if page_size < MIN_PAGE_SIZE {
            return Err(StorageError::out_of_range(
                "page_size",
                format!("must be >= {MIN_PAGE_SIZE}"),
            ));
        }
        if growth_increment < 1 {
            return Err(StorageError::out_of_range(
                "growth_increment",
                "must be >= 1",
            ));
        }

        let mut store = StreamingPageStorage {
            medium,
            header: Header {
                page_size,
                page_capacity: 0,
                entry_page_index: -1,
                allocated_count: 0,
            },
            bitmap: Vec::new(),
            read_only: false,
            fixed_capacity: false,
            leave_open,
            growth_increment,
        };
        store.extend_medium_to(HEADER_SIZE)?;
        store.persist_bitmap()?;
        store.persist_header()?;

        let mut done = 0u64;
        while done < initial_capacity {
            let chunk = (initial_capacity - done).min(growth_increment);
            for _ in 0..chunk {
                store.grow_by_one_page()?;
            }
            done += chunk;
            if let Some(sink) = progress.as_deref_mut() {
                sink.report(done, initial_capacity);
            }
            if done < initial_capacity && cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
        }
        Ok(store)
    }

    /// Creates a store that treats the medium's current length as its
    /// fixed capacity; it never resizes afterward.
    pub fn create_fixed(
        mut medium: D,
        page_size: u64,
        mut progress: Option<&mut dyn ProgressSink>,
        cancel: &CancellationToken,
        leave_open: bool,
    ) -> Result<Self> {
        if page_size < MIN_PAGE_SIZE {
            return Err(StorageError::out_of_range(
                "page_size",
                format!("must be >= {MIN_PAGE_SIZE}"),
            ));
        }
        let medium_len = medium.seek(SeekFrom::End(0))?;
        let mut capacity = if medium_len <= HEADER_SIZE {
            0
        } else {
            (medium_len - HEADER_SIZE) / page_size
        };
        while capacity > 0 && required_stream_size(page_size, capacity) > medium_len {
            capacity -= 1;
        }

        let mut store = StreamingPageStorage {
            medium,
            header: Header {
                page_size,
                page_capacity: capacity,
                entry_page_index: -1,
                allocated_count: 0,
            },
            bitmap: vec![0u8; bitmap_bytes_for(capacity) as usize],
            read_only: false,
            fixed_capacity: true,
            leave_open,
            growth_increment: 1,
        };
        store.extend_medium_to(required_stream_size(page_size, capacity))?;
        store.persist_bitmap()?;
        store.persist_header()?;
        if let Some(sink) = progress.as_deref_mut() {
            sink.report(capacity, capacity);
        }
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(store)
    }

    /// Opens an existing store, verifying its header. A writable load
    /// with variable capacity is rejected: writable loads must commit to
    /// `fixed_capacity = true` up front.
    pub fn load(mut medium: D, read_only: bool, fixed_capacity: bool, leave_open: bool) -> Result<Self> {
        if !read_only && !fixed_capacity {
            return Err(StorageError::argument(
                "Load cannot open a writable, variable-capacity store; use fixed_capacity=true",
            ));
        }
        medium.seek(SeekFrom::Start(0))?;
        let mut raw = [0u8; HEADER_SIZE as usize];
        medium.read_exact(&mut raw)?;
        let header = Header::decode(&raw)?;

        let bitmap_len = bitmap_bytes_for(header.page_capacity) as usize;
        let mut bitmap = vec![0u8; bitmap_len];
        medium.seek(SeekFrom::Start(HEADER_SIZE))?;
        medium.read_exact(&mut bitmap)?;

        Ok(StreamingPageStorage {
            medium,
            header,
            bitmap,
            read_only,
            fixed_capacity,
            leave_open,
            growth_increment: 1,
        })
    }

    /// Returns the wrapped medium, consuming the store. Callers that
    /// passed `leave_open = true` use this instead of relying on `Drop`.
    pub fn into_inner(self) -> D {
        self.medium
    }
}

impl<D: Disk> PageStorage for StreamingPageStorage<D> {
    fn page_size(&self) -> u64 {
        self.header.page_size
    }

    fn page_capacity(&self) -> u64 {
        self.header.page_capacity
    }

    fn allocated_page_count(&self) -> u64 {
        self.header.allocated_count
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn is_capacity_fixed(&self) -> bool {
        self.fixed_capacity
    }

    fn try_allocate_page(&mut self) -> Result<Option<PageIndex>> {
        if self.read_only {
            return Err(StorageError::invalid_operation("store is read-only"));
        }
        for byte in 0..self.bitmap.len() {
            if self.bitmap[byte] == 0xFF {
                continue;
            }
            for bit in 0..8u64 {
                let idx = byte as u64 * 8 + bit;
                if idx >= self.header.page_capacity {
                    break;
                }
                if (self.bitmap[byte] >> bit) & 1 == 0 {
                    self.bitmap[byte] |= 1 << bit;
                    self.header.allocated_count += 1;
                    self.persist_bitmap_byte(byte)?;
                    self.persist_header()?;
                    log::debug!("ALLOCATE_PAGE [index={idx}]");
                    return Ok(Some(idx));
                }
            }
        }
        Ok(None)
    }

    fn free_page(&mut self, index: PageIndex) -> Result<bool> {
        if self.read_only {
            return Err(StorageError::invalid_operation("store is read-only"));
        }
        self.validate_page_index(index)?;
        let byte = (index / 8) as usize;
        let bit = (index % 8) as u8;
        let was_set = (self.bitmap[byte] >> bit) & 1 == 1;
        if was_set {
            self.bitmap[byte] &= !(1 << bit);
            self.header.allocated_count -= 1;
            self.persist_bitmap_byte(byte)?;
            self.persist_header()?;
            log::debug!("FREE_PAGE [index={index}]");
        }
        Ok(was_set)
    }

    fn is_page_allocated(&self, index: PageIndex) -> bool {
        if index >= self.header.page_capacity {
            return false;
        }
        self.bit_is_set(index)
    }

    fn is_page_on_storage(&self, index: PageIndex) -> bool {
        index < self.header.page_capacity
    }

    fn read_from(
        &mut self,
        page: PageIndex,
        src_off: u64,
        buf: &mut [u8],
        dst_off: usize,
        len: usize,
    ) -> Result<()> {
        self.validate_page_index(page)?;
        if !self.is_page_allocated(page) {
            return Err(StorageError::argument(format!("page {page} is not allocated")));
        }
        if src_off + len as u64 > self.header.page_size {
            return Err(StorageError::out_of_range("len", "read exceeds page bounds"));
        }
        if dst_off + len > buf.len() {
            return Err(StorageError::argument("destination buffer too small"));
        }
        let abs = self.page_array_start() + page * self.header.page_size + src_off;
        self.medium.seek(SeekFrom::Start(abs))?;
        self.medium.read_exact(&mut buf[dst_off..dst_off + len])?;
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
        if self.read_only {
            return Err(StorageError::invalid_operation("store is read-only"));
        }
        self.validate_page_index(page)?;
        if !self.is_page_allocated(page) {
            return Err(StorageError::argument(format!("page {page} is not allocated")));
        }
        if dst_off + len as u64 > self.header.page_size {
            return Err(StorageError::out_of_range("len", "write exceeds page bounds"));
        }
        if src_off + len > buf.len() {
            return Err(StorageError::argument("source buffer too small"));
        }
        let abs = self.page_array_start() + page * self.header.page_size + dst_off;
        self.medium.seek(SeekFrom::Start(abs))?;
        self.medium.write_all(&buf[src_off..src_off + len])?;
        Ok(())
    }

    fn try_inflate(
        &mut self,
        amount: u64,
        mut progress: Option<&mut dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if self.read_only {
            return Err(StorageError::invalid_operation("store is read-only"));
        }
        if self.fixed_capacity {
            return Ok(0);
        }
        let mut done = 0u64;
        for _ in 0..amount {
            if cancel.is_cancelled() {
                break;
            }
            match self.grow_by_one_page() {
                Ok(()) => {
                    done += 1;
                    if let Some(sink) = progress.as_deref_mut() {
                        sink.report(done, amount);
                    }
                }
                Err(StorageError::Io(_)) => {
                    log::warn!("INFLATE_CAPPED [requested={amount}][achieved={done}]");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    fn try_deflate(
        &mut self,
        amount: u64,
        mut progress: Option<&mut dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if self.read_only {
            return Err(StorageError::invalid_operation("store is read-only"));
        }
        if self.fixed_capacity {
            return Ok(0);
        }
        let mut done = 0u64;
        for _ in 0..amount {
            if cancel.is_cancelled() {
                break;
            }
            if self.header.page_capacity == 0 {
                break;
            }
            let tail = self.header.page_capacity - 1;
            if self.is_page_allocated(tail) {
                break;
            }
            match self.shrink_by_one_page() {
                Ok(()) => {
                    done += 1;
                    if let Some(sink) = progress.as_deref_mut() {
                        sink.report(done, amount);
                    }
                }
                Err(StorageError::Io(_)) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    fn entry_page_index(&self) -> Option<PageIndex> {
        if self.header.entry_page_index < 0 {
            None
        } else {
            Some(self.header.entry_page_index as u64)
        }
    }

    fn set_entry_page_index(&mut self, index: Option<PageIndex>) -> Result<()> {
        if self.read_only {
            return Err(StorageError::invalid_operation("store is read-only"));
        }
        self.header.entry_page_index = match index {
            None => -1,
            Some(idx) => idx as i64,
        };
        self.persist_header()
    }

    fn validate(
        &mut self,
        mut progress: Option<&mut dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut raw = [0u8; HEADER_SIZE as usize];
        self.medium.seek(SeekFrom::Start(0))?;
        self.medium.read_exact(&mut raw)?;
        let on_disk = Header::decode(&raw)?;
        if on_disk.page_size != self.header.page_size
            || on_disk.page_capacity != self.header.page_capacity
            || on_disk.entry_page_index != self.header.entry_page_index
            || on_disk.allocated_count != self.header.allocated_count
        {
            return Err(StorageError::corrupt("in-memory header diverged from disk"));
        }

        let total = self.bitmap.len() as u64;
        let mut counted = 0u64;
        for (i, &byte) in self.bitmap.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            counted += byte.count_ones() as u64;
            if let Some(sink) = progress.as_deref_mut() {
                sink.report(i as u64 + 1, total);
            }
        }
        // bits beyond page_capacity within the final byte must be clear
        let valid_bits = self.header.page_capacity;
        let trailing_from = valid_bits;
        let mut idx = trailing_from;
        while idx < total * 8 {
            if self.bit_is_set(idx) {
                return Err(StorageError::corrupt("bit set past page_capacity"));
            }
            idx += 1;
        }
        if counted != self.header.allocated_count {
            return Err(StorageError::corrupt(format!(
                "bitmap reports {counted} allocated pages but header says {}",
                self.header.allocated_count
            )));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn cursor() -> Cursor<Vec<u8>> {
        Cursor::new(Vec::new())
    }

    #[test]
    fn create_then_load_matches_p2() {
        let none = CancellationToken::none();
        let store = StreamingPageStorage::create(cursor(), 256, 4, None, &none, false, 2).unwrap();
        assert_eq!(store.page_size(), 256);
        assert_eq!(store.page_capacity(), 4);
        assert_eq!(store.allocated_page_count(), 0);
        assert_eq!(store.entry_page_index(), None);

        let medium = store.into_inner();
        let reopened = StreamingPageStorage::load(medium, true, true, false).unwrap();
        assert_eq!(reopened.page_size(), 256);
        assert_eq!(reopened.page_capacity(), 4);
        assert_eq!(reopened.allocated_page_count(), 0);
        assert_eq!(reopened.entry_page_index(), None);
    }

    #[test]
    fn scenario_allocate_write_reload_read() {
        let none = CancellationToken::none();
        let mut store =
            StreamingPageStorage::create(cursor(), MIN_PAGE_SIZE, 1, None, &none, false, 1).unwrap();
        let (ok, idx) = store.try_allocate_page().map(|o| (o.is_some(), o.unwrap_or(0))).unwrap();
        assert!(ok);
        assert_eq!(idx, 0);
        store.write_to(0, 5, &[1, 3, 2, 4], 0, 4).unwrap();

        let medium = store.into_inner();
        let mut reopened = StreamingPageStorage::load(medium, true, true, false).unwrap();
        let mut buf = [0u8; 4];
        reopened.read_from(0, 5, &mut buf, 0, 4).unwrap();
        assert_eq!(buf, [1, 3, 2, 4]);
    }

    #[test]
    fn allocation_bitmap_tracks_liveness() {
        let none = CancellationToken::none();
        let mut store = StreamingPageStorage::create(cursor(), 256, 3, None, &none, false, 3).unwrap();
        let a = store.try_allocate_page().unwrap().unwrap();
        let b = store.try_allocate_page().unwrap().unwrap();
        let c = store.try_allocate_page().unwrap().unwrap();
        assert_eq!([a, b, c], [0, 1, 2]);
        assert!(store.try_allocate_page().unwrap().is_none());

        assert!(store.free_page(b).unwrap());
        assert!(!store.free_page(b).unwrap()); // idempotent
        assert!(!store.is_page_allocated(b));
        let reused = store.try_allocate_page().unwrap().unwrap();
        assert_eq!(reused, b);
    }

    #[test]
    fn write_read_round_trip_across_page_boundary_growth() {
        let none = CancellationToken::none();
        let mut store = StreamingPageStorage::create(cursor(), 256, 1, None, &none, false, 1).unwrap();
        // force a bitmap-byte crossing by inflating past 8 pages
        for _ in 0..20 {
            store.try_allocate_page().ok();
            store.try_inflate(1, None, &none).unwrap();
        }
        let idx = store.try_allocate_page().unwrap().unwrap();
        store.write_to(idx, 0, b"round-trip-data!", 0, 16).unwrap();
        let mut buf = [0u8; 16];
        store.read_from(idx, 0, &mut buf, 0, 16).unwrap();
        assert_eq!(&buf, b"round-trip-data!");
        store.validate(None, &none).unwrap();
    }

    #[test]
    fn deflate_refuses_to_drop_an_allocated_tail_page() {
        let none = CancellationToken::none();
        let mut store = StreamingPageStorage::create(cursor(), 256, 3, None, &none, false, 3).unwrap();
        store.try_allocate_page().unwrap();
        store.try_allocate_page().unwrap();
        let last = store.try_allocate_page().unwrap().unwrap();
        assert_eq!(last, 2);
        let removed = store.try_deflate(2, None, &none).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(store.page_capacity(), 3);
    }

    /// A medium that refuses growth past its initial length caps inflate
    /// at 0 and leaves capacity unchanged.
    #[test]
    fn scenario_inflate_capped_by_refusing_medium() {
        struct Capped {
            inner: Cursor<Vec<u8>>,
            cap: u64,
        }
        impl Read for Capped {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.inner.read(buf)
            }
        }
        impl Seek for Capped {
            fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
                self.inner.seek(pos)
            }
        }
        impl Write for Capped {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                let pos = self.inner.position();
                if pos >= self.cap {
                    return Err(io::Error::new(io::ErrorKind::Other, "medium refuses growth"));
                }
                let allowed = (self.cap - pos).min(buf.len() as u64) as usize;
                if allowed == 0 {
                    return Err(io::Error::new(io::ErrorKind::Other, "medium refuses growth"));
                }
                self.inner.write(&buf[..allowed])
            }
            fn flush(&mut self) -> io::Result<()> {
                self.inner.flush()
            }
        }

        let none = CancellationToken::none();
        let store = StreamingPageStorage::create(cursor(), MIN_PAGE_SIZE, 1, None, &none, false, 1).unwrap();
        let required = required_stream_size(MIN_PAGE_SIZE, 1);
        let medium = store.into_inner();
        let capped = Capped {
            inner: medium,
            cap: required,
        };
        let mut store = StreamingPageStorage::load(capped, false, true, false).unwrap();
        // load() with fixed_capacity=true means try_inflate is a no-op by
        // construction; rebuild as a variable-capacity handle to exercise
        // the refusing-medium path honestly.
        store.fixed_capacity = false;
        let grown = store.try_inflate(16, None, &none).unwrap();
        assert_eq!(grown, 0);
        assert_eq!(store.page_capacity(), 1);
    }

    /// P9: cancelling an inflate mid-way returns `m <= n`, and a reopen
    /// sees exactly `initial_capacity + m` pages.
    #[test]
    fn p9_cancelled_inflate_persists_partial_growth() {
        let token = CancellationToken::new();
        let mut store =
            StreamingPageStorage::create(cursor(), 256, 2, None, &CancellationToken::none(), false, 2)
                .unwrap();
        store.fixed_capacity = false;

        // Cancel after the first page of a 10-page request by flipping the
        // token from inside a one-shot progress sink.
        let mut first_tick = true;
        let grown = {
            let mut sink = |_current: u64, _total: u64| {
                if first_tick {
                    first_tick = false;
                    token.cancel();
                }
            };
            store.try_inflate(10, Some(&mut sink), &token).unwrap()
        };
        assert!(grown <= 10);
        assert!(grown >= 1);
        let expected_capacity = 2 + grown;
        assert_eq!(store.page_capacity(), expected_capacity);

        let medium = store.into_inner();
        let reopened = StreamingPageStorage::load(medium, true, true, false).unwrap();
        assert_eq!(reopened.page_capacity(), expected_capacity);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// P2: for any (page_size, capacity), Create then Load yields a
            /// store whose PageSize, PageCapacity, AllocatedPageCount=0,
            /// and EntryPageIndex=none match.
            #[test]
            fn p2_create_then_load_matches(
                page_size in (MIN_PAGE_SIZE..MIN_PAGE_SIZE * 4),
                capacity in 0u64..12,
            ) {
                let none = CancellationToken::none();
                let store =
                    StreamingPageStorage::create(cursor(), page_size, capacity, None, &none, false, 4)
                        .unwrap();
                prop_assert_eq!(store.page_size(), page_size);
                prop_assert_eq!(store.page_capacity(), capacity);
                prop_assert_eq!(store.allocated_page_count(), 0);
                prop_assert_eq!(store.entry_page_index(), None);

                let medium = store.into_inner();
                let reopened = StreamingPageStorage::load(medium, true, true, false).unwrap();
                prop_assert_eq!(reopened.page_size(), page_size);
                prop_assert_eq!(reopened.page_capacity(), capacity);
                prop_assert_eq!(reopened.allocated_page_count(), 0);
                prop_assert_eq!(reopened.entry_page_index(), None);
            }
        }
    }
}
