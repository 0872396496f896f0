//! # Balanced Multiway Tree
//!
//! Ordered key→value storage built on the pager. One [`BTree`] handle owns
//! one database file and hosts any number of named trees, each identified
//! by the page number of its root; tables and indexes share the layout.
//!
//! ## Layout
//!
//! ```text
//! page 1   header page: magic, free-list head, meta array
//! page 2   reserved root created with the database
//! page 3+  node pages, overflow chains, free-list trunks
//! ```
//!
//! Keys and values are arbitrary byte strings ordered bytewise. A cell
//! whose payload exceeds the local threshold spills entirely onto a chain
//! of overflow pages. Freed pages are recycled through trunk pages before
//! the file grows.
//!
//! ## Module Map
//!
//! - [`node`]: the slotted-page layout of one node, and the derived
//!   per-frame state ([`node::NodeState`]) the pager carries for us.
//! - [`cursor`]: cursors — creation rules, positioning, reads, insert and
//!   delete.
//! - [`balance`]: the three-way redistribution restoring page occupancy
//!   after inserts and deletes.
//!
//! This file holds the tree-level plumbing those modules share:
//! transaction control, table creation and teardown, the free-list, the
//! meta array, overflow chains, and parent-link bookkeeping.
//!
//! ## Parent Links and Pins
//!
//! Every cached node may record its parent's page number in its overlay
//! state; while the link is set the child's frame holds one pin on the
//! parent, so a cursor's whole ancestor path stays resident. The link is
//! installed by [`BTree::init_page`], moved by re-parenting, and released
//! when the frame is recycled, the page is freed, or the link changes.

pub mod balance;
pub mod cursor;
pub mod node;

use std::collections::HashMap;
use std::path::Path;

use crate::config::{DEFAULT_CACHE_SIZE, META_ARRAY_SIZE, OVERFLOW_CAPACITY, OVERFLOW_HEADER_SIZE};
use crate::rc::{Result, ResultCode};
use crate::storage::freelist::{trunk_can_insert, trunk_insert, trunk_pop_entry, TrunkHeader};
use crate::storage::headers::{read_meta, write_meta, DbHeader, OverflowHeader};
use crate::storage::{EvictionPolicy, PageExtra, PageNumber, Pager};

use cursor::Cursor;
use node::{Cell, NodeMut, NodeRef, NodeState};

/// Handle to one cursor owned by a [`BTree`]. Stale handles (closed, or
/// never issued by this tree) are reported as errors, never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorId(pub(crate) u64);

/// One open database file with its trees and cursors.
pub struct BTree {
    pub(crate) pager: Pager<NodeState>,
    pub(crate) cursors: HashMap<u64, Cursor>,
    next_cursor: u64,
    /// Per-root cursor accounting: n > 0 readers, -1 one writer.
    pub(crate) lock_counts: HashMap<PageNumber, i32>,
    pub(crate) has_writable_cursor: bool,
    pub(crate) read_only: bool,
    pub(crate) in_trans: bool,
    in_ckpt: bool,
    /// Whether this handle holds its standing pin on page 1.
    pub(crate) first_page_pinned: bool,
}

impl BTree {
    /// Opens (creating on first write) the database at `path`.
    pub fn open(path: &Path, cache_size: usize) -> Result<BTree> {
        Self::open_with_policy(path, cache_size, EvictionPolicy::default())
    }

    /// Opens with an explicit cache eviction policy.
    pub fn open_with_policy(
        path: &Path,
        cache_size: usize,
        policy: EvictionPolicy,
    ) -> Result<BTree> {
        let pager = Pager::open(path, cache_size.max(DEFAULT_CACHE_SIZE), policy)?;
        let read_only = pager.is_read_only();
        Ok(BTree {
            pager,
            cursors: HashMap::new(),
            next_cursor: 1,
            lock_counts: HashMap::new(),
            has_writable_cursor: false,
            read_only,
            in_trans: false,
            in_ckpt: false,
            first_page_pinned: false,
        })
    }

    /// Number of pages in the database file.
    pub fn page_count(&mut self) -> PageNumber {
        self.pager.page_count()
    }

    /// Grows the page cache.
    pub fn set_cache_size(&mut self, frames: usize) {
        self.pager.set_cache_size(frames);
    }

    /// Whether the file was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Starts a write transaction. Everything that modifies the tree
    /// requires one.
    pub fn begin_trans(&mut self) -> Result<()> {
        if self.in_trans {
            return Err(ResultCode::Error);
        }
        self.lock_btree()?;
        let started = if self.read_only {
            Ok(())
        } else {
            self.pager.begin().and_then(|()| self.new_database())
        };
        match started {
            std::result::Result::Ok(()) => {
                self.in_trans = true;
                self.in_ckpt = false;
                Ok(())
            }
            Err(rc) => {
                self.unlock_if_unused();
                Err(rc)
            }
        }
    }

    /// Durably publishes the transaction. Open cursors survive but drop
    /// their pins and must be repositioned before reuse.
    pub fn commit(&mut self) -> Result<()> {
        if !self.in_trans {
            return Err(ResultCode::Error);
        }
        let rc = if self.read_only {
            Ok(())
        } else {
            self.pager.commit()
        };
        self.in_trans = false;
        self.in_ckpt = false;
        self.invalidate_cursors();
        self.unlock_if_unused();
        rc
    }

    /// Undoes the transaction. All cursors are invalidated.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.in_trans {
            return Ok(());
        }
        self.in_trans = false;
        self.in_ckpt = false;
        self.invalidate_cursors();
        let rc = if self.read_only {
            Ok(())
        } else {
            self.pager.rollback()
        };
        self.unlock_if_unused();
        rc
    }

    /// Opens the nested checkpoint sub-transaction.
    pub fn begin_ckpt(&mut self) -> Result<()> {
        if !self.in_trans || self.in_ckpt {
            return Err(ResultCode::Error);
        }
        let rc = if self.read_only {
            Ok(())
        } else {
            self.pager.ckpt_begin()
        };
        self.in_ckpt = true;
        rc
    }

    /// Folds the checkpoint into the enclosing transaction.
    pub fn commit_ckpt(&mut self) -> Result<()> {
        let rc = if self.in_ckpt && !self.read_only {
            self.pager.ckpt_commit()
        } else {
            Ok(())
        };
        self.in_ckpt = false;
        rc
    }

    /// Rewinds to the checkpoint. All cursors are invalidated.
    pub fn rollback_ckpt(&mut self) -> Result<()> {
        if !self.in_ckpt || self.read_only {
            self.in_ckpt = false;
            return Ok(());
        }
        self.invalidate_cursors();
        let rc = self.pager.ckpt_rollback();
        self.in_ckpt = false;
        rc
    }

    fn invalidate_cursors(&mut self) {
        let pages: Vec<PageNumber> = self
            .cursors
            .values_mut()
            .filter_map(|c| c.page.take())
            .collect();
        for page_no in pages {
            self.pager.unref(page_no);
        }
    }

    // ------------------------------------------------------------------
    // Tables
    // ------------------------------------------------------------------

    /// Allocates and zeroes a fresh root page, returning its number. In a
    /// new database the first root lands on page 3.
    pub fn create_table(&mut self) -> Result<PageNumber> {
        if !self.in_trans {
            return Err(ResultCode::Error);
        }
        if self.read_only {
            return Err(ResultCode::ReadOnly);
        }
        let page_no = self.allocate_page()?;
        if !self.pager.is_writable(page_no) {
            self.pager.unref(page_no);
            return Err(ResultCode::Error);
        }
        self.node_mut(page_no)?.zero_page();
        self.pager.unref(page_no);
        Ok(page_no)
    }

    /// Indexes share the table layout.
    pub fn create_index(&mut self) -> Result<PageNumber> {
        self.create_table()
    }

    /// Removes every entry of the tree rooted at `root`, keeping the root
    /// page itself. Refused while any cursor holds the root.
    pub fn clear_table(&mut self, root: PageNumber) -> Result<()> {
        if !self.in_trans {
            return Err(ResultCode::Error);
        }
        if self.read_only {
            return Err(ResultCode::ReadOnly);
        }
        if *self.lock_counts.get(&root).unwrap_or(&0) != 0 {
            return Err(ResultCode::Locked);
        }
        match self.clear_database_page(root, false) {
            std::result::Result::Ok(()) => Ok(()),
            Err(rc) => {
                let _ = self.rollback();
                Err(rc)
            }
        }
    }

    /// Clears the tree and returns its pages (the root included) to the
    /// free list. Page 2 is preserved by zeroing instead.
    pub fn drop_table(&mut self, root: PageNumber) -> Result<()> {
        if !self.in_trans {
            return Err(ResultCode::Error);
        }
        if self.read_only {
            return Err(ResultCode::ReadOnly);
        }
        self.pager.get(root)?;
        if let Err(rc) = self.clear_table(root) {
            self.pager.unref(root);
            return Err(rc);
        }
        let rc = if root > 2 {
            self.free_page(root)
        } else {
            self.node_mut(root).map(|mut n| n.zero_page())
        };
        self.pager.unref(root);
        rc
    }

    /// Reads the meta array on page 1. Element 0 is the free-page count.
    pub fn get_meta(&mut self) -> Result<[i32; META_ARRAY_SIZE]> {
        self.pager.get(1)?;
        let meta = read_meta(self.pager.image(1)?);
        self.pager.unref(1);
        meta
    }

    /// Writes meta slots 1..4 on page 1; slot 0 is owned by the free-list
    /// accounting and ignored.
    pub fn update_meta(&mut self, meta: &[i32; META_ARRAY_SIZE]) -> Result<()> {
        if !self.in_trans {
            return Err(ResultCode::Error);
        }
        if self.read_only {
            return Err(ResultCode::ReadOnly);
        }
        self.pager.get(1)?;
        if let Err(rc) = self.pager.write(1) {
            self.pager.unref(1);
            return Err(rc);
        }
        write_meta(self.pager.image_mut(1)?, meta);
        self.pager.unref(1);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Plumbing shared by cursor and balance code
    // ------------------------------------------------------------------

    pub(crate) fn node_ref(&self, page_no: PageNumber) -> Result<NodeRef<'_>> {
        let image = self.pager.image(page_no)?;
        let state = self.pager.extra(page_no)?;
        Ok(NodeRef::new(image, state))
    }

    pub(crate) fn node_mut(&mut self, page_no: PageNumber) -> Result<NodeMut<'_>> {
        let (image, state) = self.pager.parts_mut(page_no)?;
        Ok(NodeMut::new(image, state))
    }

    /// Pins page 1 and verifies the database magic. Idempotent.
    pub(crate) fn lock_btree(&mut self) -> Result<()> {
        if self.first_page_pinned {
            return Ok(());
        }
        self.pager.get(1)?;
        self.first_page_pinned = true;
        if self.pager.page_count() > 0 {
            let good = DbHeader::from_bytes(&self.pager.image(1)?[..])
                .map(|h| h.has_magic())
                .unwrap_or(false);
            if !good {
                self.first_page_pinned = false;
                self.pager.unref(1);
                return Err(ResultCode::Corrupt);
            }
        }
        Ok(())
    }

    /// Releases the standing page-1 pin once nothing needs it: no
    /// transaction, no cursors.
    pub(crate) fn unlock_if_unused(&mut self) {
        if !self.in_trans && self.cursors.is_empty() && self.first_page_pinned {
            self.first_page_pinned = false;
            self.in_ckpt = false;
            self.pager.unref(1);
        }
    }

    /// Lays out a fresh database: header page plus the reserved root on
    /// page 2. No-op once the file has more than one page.
    fn new_database(&mut self) -> Result<()> {
        if self.pager.page_count() > 1 {
            return Ok(());
        }
        debug_assert!(self.first_page_pinned);
        self.pager.write(1)?;
        self.pager.get(2)?;
        if let Err(rc) = self.pager.write(2) {
            self.pager.unref(2);
            return Err(rc);
        }
        DbHeader::new().write_to(&mut self.pager.image_mut(1)?[..]);
        self.node_mut(2)?.zero_page();
        self.pager.unref(2);
        Ok(())
    }

    /// Builds a page's derived state from its image if not already built,
    /// and records `parent` as its parent link (pinning the parent). A
    /// conflicting existing link is structural corruption.
    pub(crate) fn init_page(
        &mut self,
        page_no: PageNumber,
        parent: Option<PageNumber>,
    ) -> Result<()> {
        if let Some(parent_no) = parent {
            let existing = self.pager.extra(page_no)?.parent;
            match existing {
                Some(linked) if linked != parent_no => return Err(ResultCode::Error),
                Some(_) => {}
                None => {
                    self.pager.ref_page(parent_no);
                    self.pager.extra_mut(page_no)?.parent = Some(parent_no);
                }
            }
        }
        if self.pager.extra(page_no)?.is_init {
            return Ok(());
        }
        self.node_mut(page_no)?.rebuild_from_image()
    }

    /// Repoints a cached page's parent link, moving the pin it holds.
    pub(crate) fn set_parent(
        &mut self,
        page_no: PageNumber,
        new_parent: Option<PageNumber>,
    ) -> Result<()> {
        let old = self.pager.extra(page_no)?.parent;
        if old == new_parent {
            return Ok(());
        }
        if let Some(parent_no) = new_parent {
            self.pager.ref_page(parent_no);
        }
        self.pager.extra_mut(page_no)?.parent = new_parent;
        if let Some(parent_no) = old {
            self.pager.unref(parent_no);
        }
        Ok(())
    }

    /// Updates the parent link of `page_no` if it is cached and
    /// initialized; absent pages pick their parent up on the next
    /// [`BTree::init_page`].
    pub(crate) fn reparent_page(
        &mut self,
        page_no: PageNumber,
        parent_no: PageNumber,
    ) -> Result<()> {
        if page_no == 0 {
            return Ok(());
        }
        if !self.pager.lookup(page_no)? {
            return Ok(());
        }
        let is_init = self.pager.extra(page_no)?.is_init;
        if is_init {
            self.set_parent(page_no, Some(parent_no))?;
        }
        self.pager.unref(page_no);
        Ok(())
    }

    /// Points every child of `page_no` back at it.
    pub(crate) fn reparent_children(&mut self, page_no: PageNumber) -> Result<()> {
        let (lefts, right) = {
            let node = self.node_ref(page_no)?;
            let lefts: Vec<PageNumber> = (0..node.num_cells())
                .map(|i| node.cell_header(i).left_child)
                .collect();
            (lefts, node.right_child())
        };
        for child in lefts {
            self.reparent_page(child, page_no)?;
        }
        self.reparent_page(right, page_no)
    }

    // ------------------------------------------------------------------
    // Page allocation and the free list
    // ------------------------------------------------------------------

    /// Hands out a pinned, writable page: the most recently freed leaf of
    /// the head trunk, the drained trunk itself, or a page extending the
    /// file.
    pub(crate) fn allocate_page(&mut self) -> Result<PageNumber> {
        if !self.first_page_pinned {
            return Err(ResultCode::Error);
        }
        let header = *DbHeader::from_bytes(&self.pager.image(1)?[..])?;
        if header.first_free_page() != 0 {
            self.pager.write(1)?;
            {
                let h = DbHeader::from_bytes_mut(&mut self.pager.image_mut(1)?[..])?;
                h.set_num_free_pages(h.num_free_pages().saturating_sub(1));
            }
            let trunk_no = header.first_free_page();
            self.pager.get(trunk_no)?;
            if let Err(rc) = self.pager.write(trunk_no) {
                self.pager.unref(trunk_no);
                return Err(rc);
            }
            let (next_trunk, leaves) = {
                let image = self.pager.image(trunk_no)?;
                let trunk = TrunkHeader::from_bytes(&image[..])?;
                (trunk.next_page(), trunk.count())
            };
            if leaves == 0 {
                // The trunk has no leaves left: the trunk page itself is
                // the allocation and the list head advances.
                DbHeader::from_bytes_mut(&mut self.pager.image_mut(1)?[..])?
                    .set_first_free_page(next_trunk);
                Ok(trunk_no)
            } else {
                let leaf = trunk_pop_entry(&mut self.pager.image_mut(trunk_no)?[..])?;
                self.pager.unref(trunk_no);
                if leaf == 0 {
                    return Err(ResultCode::Corrupt);
                }
                self.pager.get(leaf)?;
                if let Err(rc) = self.pager.write(leaf) {
                    self.pager.unref(leaf);
                    return Err(rc);
                }
                Ok(leaf)
            }
        } else {
            let page_no = self.pager.page_count() + 1;
            self.pager.get(page_no)?;
            if let Err(rc) = self.pager.write(page_no) {
                self.pager.unref(page_no);
                return Err(rc);
            }
            Ok(page_no)
        }
    }

    /// Returns `page_no` to the free list: appended to the head trunk when
    /// it has room, otherwise the page becomes the new head trunk.
    pub(crate) fn free_page(&mut self, page_no: PageNumber) -> Result<()> {
        if page_no <= 2 {
            return Err(ResultCode::Error);
        }
        if !self.first_page_pinned {
            return Err(ResultCode::Error);
        }
        // Drop the page's derived state; it stops being a node now.
        if self.pager.is_cached(page_no) {
            let parent = self.pager.extra_mut(page_no)?.destroy();
            if let Some(parent_no) = parent {
                self.pager.unref(parent_no);
            }
        }

        self.pager.write(1)?;
        {
            let h = DbHeader::from_bytes_mut(&mut self.pager.image_mut(1)?[..])?;
            h.set_num_free_pages(h.num_free_pages() + 1);
        }
        let header = *DbHeader::from_bytes(&self.pager.image(1)?[..])?;

        if header.first_free_page() != 0 {
            let trunk_no = header.first_free_page();
            self.pager.get(trunk_no)?;
            let has_room = trunk_can_insert(&self.pager.image(trunk_no)?[..]);
            if has_room {
                if let Err(rc) = self.pager.write(trunk_no) {
                    self.pager.unref(trunk_no);
                    return Err(rc);
                }
                trunk_insert(&mut self.pager.image_mut(trunk_no)?[..], page_no)?;
                self.pager.unref(trunk_no);
                // The leaf's content is garbage now; no need to flush it.
                self.pager.dont_write(page_no);
                return Ok(());
            }
            self.pager.unref(trunk_no);
        }

        // The freed page becomes the new head trunk.
        self.pager.get(page_no)?;
        if let Err(rc) = self.pager.write(page_no) {
            self.pager.unref(page_no);
            return Err(rc);
        }
        {
            let image = self.pager.image_mut(page_no)?;
            OverflowHeader::from_bytes_mut(&mut image[..])?
                .set_next_page(header.first_free_page());
            image[OVERFLOW_HEADER_SIZE..].fill(0);
        }
        DbHeader::from_bytes_mut(&mut self.pager.image_mut(1)?[..])?.set_first_free_page(page_no);
        self.pager.unref(page_no);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Overflow chains
    // ------------------------------------------------------------------

    /// Frees the overflow chain of the cell at `index` on `page_no`, if it
    /// has one. A chain that loops back on itself is corruption.
    pub(crate) fn clear_cell(&mut self, page_no: PageNumber, index: usize) -> Result<()> {
        let header = self.node_ref(page_no)?.cell_header(index);
        if header.overflow_page == 0 && !header.needs_overflow() {
            return Ok(());
        }
        let mut overflow = header.overflow_page;
        while overflow != 0 {
            self.pager.get(overflow)?;
            // Read the link before free_page repurposes the field.
            let next = OverflowHeader::from_bytes(&self.pager.image(overflow)?[..])?.next_page();
            let freed = self.free_page(overflow);
            self.pager.unref(overflow);
            freed?;
            if next == overflow {
                return Err(ResultCode::Corrupt);
            }
            overflow = next;
        }
        Ok(())
    }

    /// Spills an oversized cell's payload onto a fresh overflow chain,
    /// leaving the cell as a bare header referencing it.
    pub(crate) fn fill_in_cell(&mut self, cell: &mut Cell) -> Result<()> {
        if !cell.needs_overflow() {
            return Ok(());
        }
        let payload = std::mem::take(&mut cell.payload);
        let mut prior: Option<PageNumber> = None;
        let mut offset = 0usize;
        while offset < payload.len() {
            let page_no = self.allocate_page()?;
            match prior {
                None => cell.header.overflow_page = page_no,
                Some(prev) => {
                    OverflowHeader::from_bytes_mut(&mut self.pager.image_mut(prev)?[..])?
                        .set_next_page(page_no);
                    self.pager.unref(prev);
                }
            }
            let take = (payload.len() - offset).min(OVERFLOW_CAPACITY);
            {
                let image = self.pager.image_mut(page_no)?;
                OverflowHeader::from_bytes_mut(&mut image[..])?.set_next_page(0);
                image[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + take]
                    .copy_from_slice(&payload[offset..offset + take]);
            }
            offset += take;
            prior = Some(page_no);
        }
        if let Some(prev) = prior {
            self.pager.unref(prev);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Recursive teardown
    // ------------------------------------------------------------------

    /// Clears every cell (and overflow chain) reachable from `page_no`,
    /// recursing into children; frees the page itself when `free` is set,
    /// otherwise zeroes it.
    pub(crate) fn clear_database_page(&mut self, page_no: PageNumber, free: bool) -> Result<()> {
        self.pager.get(page_no)?;
        let result = self.clear_database_page_pinned(page_no, free);
        self.pager.unref(page_no);
        result
    }

    fn clear_database_page_pinned(&mut self, page_no: PageNumber, free: bool) -> Result<()> {
        self.pager.write(page_no)?;
        self.init_page(page_no, None)?;
        let cells = self.node_ref(page_no)?.num_cells();
        for index in 0..cells {
            let left = self.node_ref(page_no)?.cell_header(index).left_child;
            if left != 0 {
                self.clear_database_page(left, true)?;
            }
            self.clear_cell(page_no, index)?;
        }
        let right = self.node_ref(page_no)?.right_child();
        if right != 0 {
            self.clear_database_page(right, true)?;
        }
        if free {
            self.free_page(page_no)
        } else {
            self.node_mut(page_no)?.zero_page();
            Ok(())
        }
    }
}
