//! # Pagoda - Embedded Single-File Storage Engine
//!
//! Pagoda is an embedded, single-file transactional storage engine: ordered
//! key→value storage with durable commit and rollback, exposed to a higher
//! query layer through two stacked interfaces.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Query layer (caller)         │
//! ├─────────────────────────────────────┤
//! │  BTree        trees, cursors,       │
//! │               insert/delete/seek    │
//! ├─────────────────────────────────────┤
//! │  Pager        page cache, journal,  │
//! │               checkpoint, locking   │
//! ├─────────────────────────────────────┤
//! │  DbFile       positioned I/O,       │
//! │               advisory file locks   │
//! └─────────────────────────────────────┘
//! ```
//!
//! The **pager** materialises the database file as 1-indexed 1024-byte
//! pages in a bounded cache, copying each page's pre-image to a rollback
//! journal before its first modification in a transaction. Commit is
//! journal-fsync, dirty-page write-out, database-fsync, journal removal; a
//! journal found at open time is replayed before anything else reads. A
//! nested *checkpoint* offers a savepoint with identical mechanics against
//! a second journal file.
//!
//! The **tree** organises pages into balanced multiway trees: one or more
//! named trees per file (tables and indexes share the layout), variable
//! length keys and values in a slotted-page format, overflow chains for
//! large payloads, a trunk-page free list, and cursors for ordered
//! traversal. A three-way redistribution keeps nodes between half-full and
//! full as entries come and go.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pagoda::{BTree, Result};
//!
//! fn main() -> Result<()> {
//!     let mut db = BTree::open(std::path::Path::new("app.db"), 64)?;
//!     db.begin_trans()?;
//!     let table = db.create_table()?;
//!     let cursor = db.cursor_open(table, true)?;
//!     db.insert(cursor, b"alpha", b"first letter")?;
//!     let hit = db.move_to(cursor, b"alpha")?;
//!     assert_eq!(hit, 0);
//!     assert_eq!(db.data(cursor, 0, 12)?, b"first letter");
//!     db.cursor_close(cursor)?;
//!     db.commit()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Files on Disk
//!
//! A database `DB` keeps its rollback journal in `DB-journal` and its
//! checkpoint journal in `DB-checkpoint`, both transient. The database
//! file itself begins with a header page (magic, free-list head, a small
//! meta array for the caller); every other page is a tree node, an
//! overflow page, or a free-list trunk.
//!
//! ## Error Reporting
//!
//! Every fallible call returns [`ResultCode`] through [`Result`]; codes
//! carry stable integers with the primary kind in the low 8 bits. See
//! [`rc`].
//!
//! ## Concurrency Model
//!
//! One handle is single-threaded; handles in different processes (or the
//! same one) coordinate through advisory file locks — many readers or one
//! writer, acquired lazily and dropped when the last page pin goes away.

pub mod btree;
pub mod config;
pub mod rc;
pub mod storage;

pub use btree::{BTree, CursorId};
pub use rc::{Result, ResultCode};
pub use storage::{DbFile, EvictionPolicy, PageNumber, Pager};
