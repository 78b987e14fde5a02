//! An embedded, single-process storage engine providing a durable, ordered
//! key-value map persisted on a random-access byte medium (a file or an
//! in-memory stream).
//!
//! Three layers, leaves first:
//!
//! - [`storage`] — a paged block store ([`storage::streaming::StreamingPageStorage`])
//!   behind a small capability trait ([`storage::PageStorage`]), plus an LRU
//!   page cache ([`storage::cached::CachedPageStorage`]) that wraps any
//!   `PageStorage`.
//! - [`btree`] — a disk-resident B-tree of `(K, V)` pairs over a
//!   `PageStorage`, balanced by proactive split-on-descent insert and
//!   borrow/merge-on-descent removal.
//! - [`dictionary`] — [`dictionary::StorageDictionary`], a thin façade
//!   binding a `BTree` to a reserved handle page so its root index and pair
//!   count survive a reload.
//!
//! [`region`] (closed byte intervals and their minimal disjoint cover),
//! [`binary`] (fixed-width/short-string wire encoding), [`binary_search`]
//! (a generic floor/ceiling search), [`serializer`] (the `Serializer<T>`
//! contract keys and values are encoded through), [`progress`]
//! (cancellation and progress reporting) and [`error`] (the crate's single
//! `Result`/`StorageError`) are the supporting utilities the three layers
//! above are built from.
//!
//! # Glossary
//!
//! - **Page** — fixed-size byte block in the block store.
//! - **PageIndex** — non-negative integer identifying a page; `None` is the
//!   "no page" sentinel (encoded on disk as `-1`).
//! - **Entry page** — the store-level root pointer header field; typically
//!   points at a top-level structure's handle page.
//! - **B-tree node** — a page holding sorted pairs plus child indices (if
//!   internal).
//! - **Region** — closed integer interval over byte offsets within a page.
//! - **Region set** — minimal disjoint cover of regions.
//! - **LRU** — least-recently-used; victim policy for cache eviction.
//! - **Write-through / write-back** — cache policies: propagate writes
//!   immediately vs defer until flush or eviction.
//! - **Flush** — force all dirty cached bytes to the inner store.
//! - **Inflate / Deflate** — grow or shrink `PageCapacity` by a given number
//!   of pages.
//! - **Validate** — structural self-check returning true/false or failing
//!   with `Corrupt`.

pub mod binary;
pub mod binary_search;
pub mod btree;
pub mod dictionary;
pub mod error;
pub mod progress;
pub mod region;
pub mod serializer;
pub mod storage;

pub use btree::{BTree, InsertOutcome};
pub use dictionary::StorageDictionary;
pub use error::{Result, StorageError};
pub use progress::{CancellationToken, ProgressSink};
pub use region::{DataRegion, DataRegionSet};
pub use serializer::Serializer;
pub use storage::cached::{CacheMode, CachedPageStorage};
pub use storage::streaming::StreamingPageStorage;
pub use storage::{PageIndex, PageStorage};
