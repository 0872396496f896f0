//! # Cursors
//!
//! A cursor is the iterator the query layer drives over one tree: it names
//! a root page, the node page it currently rests on (pinned while held),
//! the cell index within that node, and the outcome of its latest key
//! comparison. Cursors are owned by the tree and addressed by [`CursorId`];
//! a stale handle reports an error instead of dangling.
//!
//! ## Creation Rules
//!
//! At most one writable cursor exists per tree, and a root with any open
//! reader refuses a writer (and vice versa): the per-root lock count is
//! `n > 0` for `n` readers and `-1` for the writer. Violations report
//! `locked`.
//!
//! ## Positioning
//!
//! `move_to` binary-searches each node on the way down and stops on an
//! exact hit, recording the final comparison in the cursor; `first`,
//! `last` and `next` maintain strict key order, descending to the leftmost
//! leaf of a right-child subtree when stepping off an interior node.
//! `delete` leaves the cursor parked so that one `skip_next` step keeps a
//! scan from advancing twice past the removed entry.
//!
//! ## Payloads
//!
//! Key and data reads clamp to the cell's sizes and transparently walk the
//! overflow chain when the payload is not local. A chain that terminates
//! early (or loops) is reported as corruption.

use crate::config::{CELL_HEADER_SIZE, OVERFLOW_CAPACITY, OVERFLOW_HEADER_SIZE};
use crate::rc::{Result, ResultCode};
use crate::storage::headers::OverflowHeader;
use crate::storage::PageNumber;

use super::node::{Cell, CellTracker};
use super::{BTree, CursorId};

/// Cursor state proper; lives in the tree's registry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cursor {
    pub root: PageNumber,
    pub page: Option<PageNumber>,
    pub cell_index: u16,
    pub writable: bool,
    pub skip_next: bool,
    /// Latest comparison between the cell under the cursor and a sought
    /// key; zero means the cursor sits on an exact match.
    pub compare: i32,
}

fn ord_to_int(o: std::cmp::Ordering) -> i32 {
    match o {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

impl BTree {
    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Registers a cursor over the tree rooted at `root`. Writable cursors
    /// are exclusive per tree and per root; see the module docs.
    pub fn cursor_open(&mut self, root: PageNumber, writable: bool) -> Result<CursorId> {
        if writable && self.has_writable_cursor {
            return Err(ResultCode::Locked);
        }
        self.lock_btree()?;
        if writable && self.read_only {
            self.unlock_if_unused();
            return Err(ResultCode::ReadOnly);
        }
        if let Err(rc) = self.pager.get(root) {
            self.unlock_if_unused();
            return Err(rc);
        }
        let locks = *self.lock_counts.get(&root).unwrap_or(&0);
        if locks < 0 || (locks > 0 && writable) {
            self.pager.unref(root);
            self.unlock_if_unused();
            return Err(ResultCode::Locked);
        }
        self.lock_counts
            .insert(root, if writable { -1 } else { locks + 1 });

        let id = self.next_cursor;
        self.next_cursor += 1;
        self.cursors.insert(
            id,
            Cursor {
                root,
                page: Some(root),
                cell_index: 0,
                writable,
                skip_next: false,
                compare: 0,
            },
        );
        if writable {
            self.has_writable_cursor = true;
        }
        Ok(CursorId(id))
    }

    /// Unpins and deregisters the cursor.
    pub fn cursor_close(&mut self, id: CursorId) -> Result<()> {
        let cursor = self.cursors.remove(&id.0).ok_or(ResultCode::Error)?;
        let locks = *self.lock_counts.get(&cursor.root).unwrap_or(&0);
        self.lock_counts
            .insert(cursor.root, if locks < 0 { 0 } else { (locks - 1).max(0) });
        if cursor.writable {
            self.has_writable_cursor = false;
        }
        if let Some(page_no) = cursor.page {
            self.pager.unref(page_no);
        }
        self.unlock_if_unused();
        Ok(())
    }

    fn cursor(&self, id: CursorId) -> Result<Cursor> {
        self.cursors.get(&id.0).copied().ok_or(ResultCode::Error)
    }

    fn take_cursor(&mut self, id: CursorId) -> Result<Cursor> {
        self.cursors.remove(&id.0).ok_or(ResultCode::Error)
    }

    fn put_cursor(&mut self, id: CursorId, cursor: Cursor) {
        self.cursors.insert(id.0, cursor);
    }

    // ------------------------------------------------------------------
    // Reading the current cell
    // ------------------------------------------------------------------

    /// Size of the current cell's key; zero when the cursor is off any
    /// entry.
    pub fn key_size(&mut self, id: CursorId) -> Result<u32> {
        let cursor = self.cursor(id)?;
        let Some(page_no) = cursor.page else {
            return Ok(0);
        };
        let node = self.node_ref(page_no)?;
        if cursor.cell_index as usize >= node.num_cells() {
            return Ok(0);
        }
        Ok(node.cell_header(cursor.cell_index as usize).key_size)
    }

    /// Size of the current cell's data; zero when off any entry.
    pub fn data_size(&mut self, id: CursorId) -> Result<u32> {
        let cursor = self.cursor(id)?;
        let Some(page_no) = cursor.page else {
            return Ok(0);
        };
        let node = self.node_ref(page_no)?;
        if cursor.cell_index as usize >= node.num_cells() {
            return Ok(0);
        }
        Ok(node.cell_header(cursor.cell_index as usize).data_size)
    }

    /// Reads `amount` key bytes starting at `offset`, clamped to the key.
    pub fn key(&mut self, id: CursorId, offset: u32, mut amount: u32) -> Result<Vec<u8>> {
        let cursor = self.cursor(id)?;
        let Some(page_no) = cursor.page else {
            return Ok(Vec::new());
        };
        {
            let node = self.node_ref(page_no)?;
            if amount == 0 || cursor.cell_index as usize >= node.num_cells() {
                return Ok(Vec::new());
            }
            let key_size = node.cell_header(cursor.cell_index as usize).key_size;
            if amount + offset > key_size {
                amount = key_size.saturating_sub(offset);
            }
        }
        if amount == 0 {
            return Ok(Vec::new());
        }
        self.payload(&cursor, offset, amount)
    }

    /// Reads `amount` data bytes starting at `offset`, clamped to the
    /// data.
    pub fn data(&mut self, id: CursorId, offset: u32, mut amount: u32) -> Result<Vec<u8>> {
        let cursor = self.cursor(id)?;
        let Some(page_no) = cursor.page else {
            return Ok(Vec::new());
        };
        let key_size;
        {
            let node = self.node_ref(page_no)?;
            if amount == 0 || cursor.cell_index as usize >= node.num_cells() {
                return Ok(Vec::new());
            }
            let header = node.cell_header(cursor.cell_index as usize);
            key_size = header.key_size;
            if amount + offset > header.data_size {
                amount = header.data_size.saturating_sub(offset);
            }
        }
        if amount == 0 {
            return Ok(Vec::new());
        }
        self.payload(&cursor, offset + key_size, amount)
    }

    /// Compares the current cell's key (minus `num_ignore` trailing bytes)
    /// against `key`. Negative: cell key sorts before `key`.
    pub fn key_compare(&mut self, id: CursorId, key: &[u8], num_ignore: u32) -> Result<i32> {
        let cursor = self.cursor(id)?;
        if cursor.page.is_none() {
            return Err(ResultCode::Error);
        }
        self.compare_key_at(&cursor, key, num_ignore)
    }

    /// Depth of the node under the cursor, counting the root as 1. A
    /// testing aid.
    pub fn node_depth(&mut self, id: CursorId) -> Result<u32> {
        let cursor = self.cursor(id)?;
        let mut page_no = cursor.page.ok_or(ResultCode::Abort)?;
        let mut depth = 1u32;
        while let Some(parent) = self.pager.extra(page_no)?.parent {
            page_no = parent;
            depth += 1;
        }
        Ok(depth)
    }

    // ------------------------------------------------------------------
    // Positioning
    // ------------------------------------------------------------------

    /// Parks the cursor on the smallest entry. `Ok(true)` when the tree is
    /// empty. Positioning also revives a cursor whose pin was dropped by a
    /// commit or rollback.
    pub fn first(&mut self, id: CursorId) -> Result<bool> {
        let mut cursor = self.take_cursor(id)?;
        let result = self.first_inner(&mut cursor);
        self.put_cursor(id, cursor);
        result
    }

    /// Parks the cursor on the largest entry. `Ok(true)` when empty.
    pub fn last(&mut self, id: CursorId) -> Result<bool> {
        let mut cursor = self.take_cursor(id)?;
        let result = self.last_inner(&mut cursor);
        self.put_cursor(id, cursor);
        result
    }

    /// Seeks `key`, landing on the exact match or a neighbouring entry.
    /// The returned comparison is between the entry under the cursor and
    /// `key` (zero for an exact hit), and is remembered by the cursor.
    pub fn move_to(&mut self, id: CursorId, key: &[u8]) -> Result<i32> {
        let mut cursor = self.take_cursor(id)?;
        let result = self.move_to_inner(&mut cursor, key);
        self.put_cursor(id, cursor);
        result
    }

    /// Advances to the next entry in key order. `Ok(true)` when the cursor
    /// was already on the last entry.
    pub fn next(&mut self, id: CursorId) -> Result<bool> {
        let mut cursor = self.take_cursor(id)?;
        let result = self.next_inner(&mut cursor);
        self.put_cursor(id, cursor);
        result
    }

    /// Inserts (or replaces) `key → data`, leaving the cursor on the new
    /// entry.
    pub fn insert(&mut self, id: CursorId, key: &[u8], data: &[u8]) -> Result<()> {
        let mut cursor = self.take_cursor(id)?;
        let result = self.insert_inner(&mut cursor, key, data);
        self.put_cursor(id, cursor);
        result
    }

    /// Deletes the entry under the cursor. The cursor must sit on an exact
    /// match from its latest positioning; otherwise nothing is removed and
    /// `not_found` is reported.
    pub fn delete(&mut self, id: CursorId) -> Result<()> {
        let mut cursor = self.take_cursor(id)?;
        let result = self.delete_inner(&mut cursor);
        self.put_cursor(id, cursor);
        result
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn cells_at(&self, page_no: PageNumber) -> Result<usize> {
        Ok(self.node_ref(page_no)?.num_cells())
    }

    fn move_to_root(&mut self, cursor: &mut Cursor) -> Result<()> {
        self.pager.get(cursor.root)?;
        if let Err(rc) = self.init_page(cursor.root, None) {
            self.pager.unref(cursor.root);
            return Err(rc);
        }
        if let Some(old) = cursor.page.replace(cursor.root) {
            self.pager.unref(old);
        }
        cursor.cell_index = 0;
        Ok(())
    }

    fn move_to_child(&mut self, cursor: &mut Cursor, child: PageNumber) -> Result<()> {
        self.pager.get(child)?;
        if let Err(rc) = self.init_page(child, cursor.page) {
            self.pager.unref(child);
            return Err(rc);
        }
        if let Some(old) = cursor.page.replace(child) {
            self.pager.unref(old);
        }
        cursor.cell_index = 0;
        Ok(())
    }

    fn move_to_parent(&mut self, cursor: &mut Cursor) -> Result<()> {
        let page_no = cursor.page.ok_or(ResultCode::Abort)?;
        let parent = self
            .pager
            .extra(page_no)?
            .parent
            .ok_or(ResultCode::Internal)?;
        self.pager.ref_page(parent);
        self.pager.unref(page_no);
        cursor.page = Some(parent);

        let node = self.node_ref(parent)?;
        let mut index = node.num_cells();
        for i in 0..node.num_cells() {
            if node.cell_header(i).left_child == page_no {
                index = i;
                break;
            }
        }
        cursor.cell_index = index as u16;
        Ok(())
    }

    fn move_to_leftmost(&mut self, cursor: &mut Cursor) -> Result<()> {
        loop {
            let page_no = cursor.page.ok_or(ResultCode::Abort)?;
            let node = self.node_ref(page_no)?;
            if cursor.cell_index as usize >= node.num_cells() {
                return Ok(());
            }
            let left = node.cell_header(cursor.cell_index as usize).left_child;
            if left == 0 {
                return Ok(());
            }
            self.move_to_child(cursor, left)?;
        }
    }

    pub(crate) fn first_inner(&mut self, cursor: &mut Cursor) -> Result<bool> {
        self.move_to_root(cursor)?;
        if self.cells_at(cursor.root)? == 0 {
            return Ok(true);
        }
        self.move_to_leftmost(cursor)?;
        cursor.skip_next = false;
        cursor.compare = 0;
        Ok(false)
    }

    pub(crate) fn last_inner(&mut self, cursor: &mut Cursor) -> Result<bool> {
        self.move_to_root(cursor)?;
        if self.cells_at(cursor.root)? == 0 {
            return Ok(true);
        }
        loop {
            let page_no = cursor.page.ok_or(ResultCode::Abort)?;
            let right = self.node_ref(page_no)?.right_child();
            if right == 0 {
                cursor.cell_index = self.cells_at(page_no)?.saturating_sub(1) as u16;
                break;
            }
            self.move_to_child(cursor, right)?;
        }
        cursor.skip_next = false;
        cursor.compare = 0;
        Ok(false)
    }

    pub(crate) fn move_to_inner(&mut self, cursor: &mut Cursor, key: &[u8]) -> Result<i32> {
        cursor.skip_next = false;
        self.move_to_root(cursor)?;
        loop {
            let page_no = cursor.page.ok_or(ResultCode::Abort)?;
            let cells = self.cells_at(page_no)? as i32;
            let mut lower = 0i32;
            let mut upper = cells - 1;
            let mut compare = -1i32;
            while lower <= upper {
                cursor.cell_index = ((lower + upper) / 2) as u16;
                compare = self.compare_key_at(cursor, key, 0)?;
                if compare == 0 {
                    cursor.compare = 0;
                    return Ok(0);
                }
                if compare < 0 {
                    lower = cursor.cell_index as i32 + 1;
                } else {
                    upper = cursor.cell_index as i32 - 1;
                }
            }
            let child = if lower >= cells {
                self.node_ref(page_no)?.right_child()
            } else {
                self.node_ref(page_no)?.cell_header(lower as usize).left_child
            };
            if child == 0 {
                cursor.compare = compare;
                return Ok(compare);
            }
            self.move_to_child(cursor, child)?;
        }
    }

    pub(crate) fn next_inner(&mut self, cursor: &mut Cursor) -> Result<bool> {
        let page_no = cursor.page.ok_or(ResultCode::Abort)?;
        if cursor.skip_next && (cursor.cell_index as usize) < self.cells_at(page_no)? {
            cursor.skip_next = false;
            cursor.compare = 0;
            return Ok(false);
        }
        cursor.cell_index += 1;
        if cursor.cell_index as usize >= self.cells_at(page_no)? {
            let right = self.node_ref(page_no)?.right_child();
            if right != 0 {
                self.move_to_child(cursor, right)?;
                self.move_to_leftmost(cursor)?;
                cursor.compare = 0;
                return Ok(false);
            }
            loop {
                let at = cursor.page.ok_or(ResultCode::Abort)?;
                if self.pager.extra(at)?.parent.is_none() {
                    return Ok(true);
                }
                self.move_to_parent(cursor)?;
                let at = cursor.page.ok_or(ResultCode::Abort)?;
                if (cursor.cell_index as usize) < self.cells_at(at)? {
                    break;
                }
            }
            cursor.compare = 0;
            return Ok(false);
        }
        self.move_to_leftmost(cursor)?;
        cursor.compare = 0;
        Ok(false)
    }

    pub(crate) fn insert_inner(
        &mut self,
        cursor: &mut Cursor,
        key: &[u8],
        data: &[u8],
    ) -> Result<()> {
        if !self.in_trans || key.len() + data.len() == 0 {
            return Err(ResultCode::Abort);
        }
        if !cursor.writable {
            return Err(ResultCode::Perm);
        }
        let compare = self.move_to_inner(cursor, key)?;
        let page_no = cursor.page.ok_or(ResultCode::Abort)?;
        self.pager.write(page_no)?;

        let mut cell = Cell::new(key, data);
        self.fill_in_cell(&mut cell)?;

        let cells = self.cells_at(page_no)?;
        if compare == 0 {
            // Exact match: replace, keeping the subtree pointer.
            let old = self
                .node_ref(page_no)?
                .cell_header(cursor.cell_index as usize);
            cell.header.left_child = old.left_child;
            self.clear_cell(page_no, cursor.cell_index as usize)?;
            self.node_mut(page_no)?
                .drop_cell(cursor.cell_index as usize);
        } else if compare < 0 && cells > 0 {
            cursor.cell_index += 1;
        } else if self.node_ref(page_no)?.right_child() != 0 {
            return Err(ResultCode::Error);
        }
        if !self.pager.is_writable(page_no) {
            return Err(ResultCode::Error);
        }
        self.node_mut(page_no)?
            .insert_cell(cell, cursor.cell_index as usize);
        cursor.compare = 0;
        self.balance(page_no, cursor)
    }

    pub(crate) fn delete_inner(&mut self, cursor: &mut Cursor) -> Result<()> {
        let page_no = cursor.page.ok_or(ResultCode::Abort)?;
        if !self.in_trans {
            return Err(ResultCode::Error);
        }
        let index = cursor.cell_index as usize;
        if index >= self.cells_at(page_no)? {
            return Err(ResultCode::Error);
        }
        if !cursor.writable {
            return Err(ResultCode::Perm);
        }
        if cursor.compare != 0 {
            // The latest positioning missed: there is no entry "under" the
            // cursor to delete.
            return Err(ResultCode::NotFound);
        }
        self.pager.write(page_no)?;

        let key_size = self.node_ref(page_no)?.cell_header(index).key_size;
        let target_key = self.payload(cursor, 0, key_size)?;
        let child = self.node_ref(page_no)?.cell_header(index).left_child;
        self.clear_cell(page_no, index)?;

        if child != 0 {
            // Interior entry: promote the in-order successor from its
            // leaf, then delete it down there.
            let mut leaf = self.temp_cursor(cursor);
            let promoted = self.promote_successor(cursor, &mut leaf, page_no, index, child);
            self.drop_temp_cursor(leaf);
            promoted
        } else {
            self.node_mut(page_no)?.drop_cell(index);
            let cells = self.cells_at(page_no)?;
            if index >= cells {
                if cells == 0 {
                    cursor.cell_index = 0;
                    cursor.skip_next = true;
                } else {
                    cursor.cell_index = (cells - 1) as u16;
                    cursor.skip_next = false;
                }
            } else {
                cursor.skip_next = true;
            }
            self.balance(page_no, cursor)?;

            // Second pass: if an interior copy of the key survived the
            // rebalance, take it out too. Each pass removes one entry, so
            // the walk is bounded; with unique keys it finds nothing.
            let compare = self.move_to_inner(cursor, &target_key)?;
            if compare == 0 {
                self.delete_inner(cursor)?;
            } else {
                // Re-park the one-step skip: a scan's next() must land on
                // the deleted key's successor, wherever the re-seek
                // stopped.
                cursor.skip_next = compare > 0;
            }
            Ok(())
        }
    }

    fn promote_successor(
        &mut self,
        cursor: &mut Cursor,
        leaf: &mut Cursor,
        page_no: PageNumber,
        index: usize,
        child: PageNumber,
    ) -> Result<()> {
        // The temp cursor must genuinely advance to the successor.
        leaf.skip_next = false;
        let at_last = self.next_inner(leaf)?;
        if at_last {
            // An interior cell always has a successor below it.
            return Err(ResultCode::Corrupt);
        }
        let leaf_no = leaf.page.ok_or(ResultCode::Abort)?;
        self.pager.write(leaf_no)?;

        self.node_mut(page_no)?.drop_cell(index);
        let mut successor = self.node_ref(leaf_no)?.cell(leaf.cell_index as usize);
        successor.header.left_child = child;
        self.node_mut(page_no)?.insert_cell(successor, index);
        self.balance(page_no, cursor)?;

        cursor.skip_next = true;
        let leaf_no = leaf.page.ok_or(ResultCode::Abort)?;
        self.node_mut(leaf_no)?.drop_cell(leaf.cell_index as usize);
        self.balance(leaf_no, leaf)
    }

    fn temp_cursor(&mut self, cursor: &Cursor) -> Cursor {
        let temp = *cursor;
        if let Some(page_no) = temp.page {
            self.pager.ref_page(page_no);
        }
        temp
    }

    fn drop_temp_cursor(&mut self, temp: Cursor) {
        if let Some(page_no) = temp.page {
            self.pager.unref(page_no);
        }
    }

    // ------------------------------------------------------------------
    // Payload access and comparison
    // ------------------------------------------------------------------

    /// Reads `amount` payload bytes of the current cell starting at
    /// `offset` into the `key ‖ data` stream, following the overflow chain
    /// when the payload is not local.
    pub(crate) fn payload(
        &mut self,
        cursor: &Cursor,
        mut offset: u32,
        mut amount: u32,
    ) -> Result<Vec<u8>> {
        let page_no = cursor.page.ok_or(ResultCode::Error)?;
        let index = cursor.cell_index as usize;
        let overflow = {
            let node = self.node_ref(page_no)?;
            if index >= node.num_cells() {
                return Err(ResultCode::Error);
            }
            let header = node.cell_header(index);
            if header.overflow_page == 0 {
                if offset + amount > header.payload_size() {
                    return Err(ResultCode::Error);
                }
                let bytes = match &node.state.trackers[index] {
                    CellTracker::Loose(cell) => {
                        cell.payload[offset as usize..(offset + amount) as usize].to_vec()
                    }
                    CellTracker::OnPage(at) => {
                        let start = *at as usize + CELL_HEADER_SIZE + offset as usize;
                        node.image[start..start + amount as usize].to_vec()
                    }
                };
                return Ok(bytes);
            }
            header.overflow_page
        };

        let mut result = Vec::with_capacity(amount as usize);
        let mut next = overflow;
        while amount > 0 && next != 0 {
            self.pager.get(next)?;
            let new_next;
            {
                let image = self.pager.image(next)?;
                new_next = OverflowHeader::from_bytes(&image[..])?.next_page();
                if (offset as usize) < OVERFLOW_CAPACITY {
                    let take = (amount as usize).min(OVERFLOW_CAPACITY - offset as usize);
                    let start = OVERFLOW_HEADER_SIZE + offset as usize;
                    result.extend_from_slice(&image[start..start + take]);
                    offset = 0;
                    amount -= take as u32;
                } else {
                    offset -= OVERFLOW_CAPACITY as u32;
                }
            }
            self.pager.unref(next);
            next = new_next;
        }
        if amount > 0 {
            return Err(ResultCode::Corrupt);
        }
        Ok(result)
    }

    /// Compares the cell under `cursor` against `key`: bytewise over the
    /// common prefix, then by length. `num_ignore` trailing bytes of the
    /// cell key are left out of the comparison.
    pub(crate) fn compare_key_at(
        &mut self,
        cursor: &Cursor,
        key: &[u8],
        num_ignore: u32,
    ) -> Result<i32> {
        let page_no = cursor.page.ok_or(ResultCode::Abort)?;
        let index = cursor.cell_index as usize;

        let (cell_len, local) = {
            let node = self.node_ref(page_no)?;
            if index >= node.num_cells() {
                return Err(ResultCode::Error);
            }
            let header = node.cell_header(index);
            let cell_len = header.key_size.saturating_sub(num_ignore);
            if header.overflow_page != 0 {
                (cell_len, None)
            } else {
                let n = cell_len.min(key.len() as u32) as usize;
                let bytes = match &node.state.trackers[index] {
                    CellTracker::Loose(cell) => cell.payload[..n].to_vec(),
                    CellTracker::OnPage(at) => {
                        let start = *at as usize + CELL_HEADER_SIZE;
                        node.image[start..start + n].to_vec()
                    }
                };
                (cell_len, Some((header.overflow_page, bytes)))
            }
        };

        if let Some((_, bytes)) = local {
            let n = bytes.len();
            let compare = ord_to_int(bytes[..].cmp(&key[..n]));
            if compare != 0 {
                return Ok(compare);
            }
            return Ok(ord_to_int(cell_len.cmp(&(key.len() as u32))));
        }

        // Key bytes live on the overflow chain; compare chunk by chunk.
        let overflow = self.node_ref(page_no)?.cell_header(index).overflow_page;
        let mut remaining_cell = cell_len;
        let mut remaining_key = key.len() as u32;
        let mut key_at = 0usize;
        let mut next = overflow;
        while remaining_cell > 0 && remaining_key > 0 {
            if next == 0 {
                return Err(ResultCode::Corrupt);
            }
            self.pager.get(next)?;
            let n = remaining_cell
                .min(remaining_key)
                .min(OVERFLOW_CAPACITY as u32) as usize;
            let (compare, new_next) = {
                let image = self.pager.image(next)?;
                let chunk = &image[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + n];
                (
                    ord_to_int(chunk.cmp(&key[key_at..key_at + n])),
                    OverflowHeader::from_bytes(&image[..])?.next_page(),
                )
            };
            self.pager.unref(next);
            if compare != 0 {
                return Ok(compare);
            }
            remaining_cell -= n as u32;
            remaining_key -= n as u32;
            key_at += n;
            next = new_next;
        }
        Ok(ord_to_int(remaining_cell.cmp(&remaining_key)))
    }
}
