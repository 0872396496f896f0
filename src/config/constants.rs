//! # Pagoda Configuration Constants
//!
//! This module centralizes the layout constants of the on-disk format and the
//! tunables of the page cache. Constants that depend on each other are
//! co-located and tied together with compile-time assertions so that a change
//! to one cannot silently invalidate another.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (1024 bytes)
//!       │
//!       ├─> NODE_HEADER_SIZE (8 bytes: right_child + two u16 indexes)
//!       │     │
//!       │     └─> USABLE_SPACE (derived: PAGE_SIZE - NODE_HEADER_SIZE)
//!       │           │
//!       │           └─> MAX_LOCAL_PAYLOAD (derived, see below)
//!       │
//!       ├─> OVERFLOW_HEADER_SIZE (4 bytes: next_page)
//!       │     │
//!       │     └─> OVERFLOW_CAPACITY (derived: PAGE_SIZE - OVERFLOW_HEADER_SIZE)
//!       │
//!       ├─> TRUNK_HEADER_SIZE (8 bytes: next_page + entry count)
//!       │     │
//!       │     └─> TRUNK_MAX_ENTRIES (derived)
//!       │
//!       └─> JOURNAL_RECORD_SIZE (page number + full page image)
//!
//! CELL_HEADER_SIZE (20 bytes)
//!       │
//!       ├─> MIN_CELL_SIZE (header + 4 payload bytes)
//!       │
//!       └─> MAX_LOCAL_PAYLOAD
//!             Chosen so at least four cells fit on every page:
//!             USABLE_SPACE/4 - CELL_HEADER_SIZE + PAGE_NUMBER_SIZE
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced below with `const` assertions:
//!
//! 1. `USABLE_SPACE == PAGE_SIZE - NODE_HEADER_SIZE`
//! 2. `MAX_LOCAL_PAYLOAD == 238` (four cells per page)
//! 3. `4 * (MAX_LOCAL_PAYLOAD + CELL_HEADER_SIZE - PAGE_NUMBER_SIZE) == USABLE_SPACE`
//! 4. `JOURNAL_RECORD_SIZE == PAGE_NUMBER_SIZE + PAGE_SIZE`

/// Size of one database page in bytes. The whole on-disk format is built
/// around this unit; it is not configurable at runtime.
pub const PAGE_SIZE: usize = 1024;

/// Size of a page number on disk (u32).
pub const PAGE_NUMBER_SIZE: usize = 4;

/// Maximum number of pages in a database file.
pub const MAX_PAGE_COUNT: u32 = 1_073_741_823;

/// Default number of page frames held by the cache.
pub const DEFAULT_CACHE_SIZE: usize = 10;

/// Lower bound on the cache size; smaller requests are clamped up to this.
pub const MIN_CACHE_SIZE: usize = 10;

/// Size of the node-page header: `right_child: u32`, `first_cell: u16`,
/// `first_free_block: u16`.
pub const NODE_HEADER_SIZE: usize = 8;

/// Bytes on a node page available for cells and free blocks.
pub const USABLE_SPACE: usize = PAGE_SIZE - NODE_HEADER_SIZE;

/// Size of a cell header on disk. 20 bytes: `left_child: u32`,
/// `key_size: u32`, `data_size: u32`, `next_cell: u16`, two bytes of
/// padding, `overflow_page: u32`.
pub const CELL_HEADER_SIZE: usize = 20;

/// Size of a free-block header: `size: u16`, `next_block: u16`.
pub const FREE_BLOCK_SIZE: usize = 4;

/// Smallest cell that can land on a page: a header plus four payload bytes.
pub const MIN_CELL_SIZE: usize = CELL_HEADER_SIZE + 4;

/// The maximum amount of payload (in bytes) stored locally for an entry.
/// Larger payloads go entirely onto overflow pages. The formula guarantees
/// at least four cells fit on every page; the value works out to 238.
pub const MAX_LOCAL_PAYLOAD: usize = USABLE_SPACE / 4 - CELL_HEADER_SIZE + PAGE_NUMBER_SIZE;

/// Size of the overflow-page header: `next_page: u32`.
pub const OVERFLOW_HEADER_SIZE: usize = 4;

/// Payload bytes carried by one overflow page.
pub const OVERFLOW_CAPACITY: usize = PAGE_SIZE - OVERFLOW_HEADER_SIZE;

/// Size of a free-list trunk header: `next_page: u32`, `num_free_pages: u32`.
pub const TRUNK_HEADER_SIZE: usize = 8;

/// Number of freed leaf page numbers one trunk page can hold inline.
pub const TRUNK_MAX_ENTRIES: usize = (PAGE_SIZE - TRUNK_HEADER_SIZE) / PAGE_NUMBER_SIZE;

/// Magic prefix identifying a rollback-journal file. The byte sequence is
/// the classic one used by single-file rollback journals.
pub const JOURNAL_MAGIC: [u8; 8] = [0xd9, 0xd5, 0x05, 0xf9, 0x20, 0xa1, 0x63, 0xd4];

/// Journal header: magic plus the pre-transaction page count.
pub const JOURNAL_HEADER_SIZE: usize = JOURNAL_MAGIC.len() + PAGE_NUMBER_SIZE;

/// One journal record: page number followed by the full page image.
pub const JOURNAL_RECORD_SIZE: usize = PAGE_NUMBER_SIZE + PAGE_SIZE;

/// Magic integer stored at the start of the header page (page 1). A
/// mismatch on open means the file is not a database.
pub const HEADER_MAGIC: i32 = 12345;

/// Number of caller-visible metadata slots on the header page. Slot 0
/// aliases the free-page count; slots 1..4 are opaque to the storage layer.
pub const META_ARRAY_SIZE: usize = 4;

const _: () = assert!(USABLE_SPACE == 1016);
const _: () = assert!(
    MAX_LOCAL_PAYLOAD == 238,
    "MAX_LOCAL_PAYLOAD must leave room for four cells per page"
);
const _: () = assert!(4 * (MAX_LOCAL_PAYLOAD + CELL_HEADER_SIZE - PAGE_NUMBER_SIZE) == USABLE_SPACE);
const _: () = assert!(JOURNAL_RECORD_SIZE == 1028);
const _: () = assert!(TRUNK_MAX_ENTRIES == 254);
const _: () = assert!(MIN_CACHE_SIZE <= DEFAULT_CACHE_SIZE);
