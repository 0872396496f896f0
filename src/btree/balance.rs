//! # Balancing
//!
//! Restores page occupancy after an insert or delete, walking from the
//! modified node toward the root. A node is left alone once it is not
//! overfull, is at least half full, and holds two or more cells; the walk
//! then just relinks its cell chain and stops.
//!
//! ## Redistribution
//!
//! For a node that does need work, up to three consecutive children of its
//! parent (the node and its nearest siblings — the *divider pages*) are
//! dissolved: their cells, interleaved with the parent cells separating
//! them (the *divider cells*), form one ordered run. The run is packed
//! greedily into fresh pages up to the usable space, evened out from the
//! tail so no page ends up less than half full, and re-emitted; each
//! boundary between new pages puts one cell back into the parent as a new
//! divider. The old pages are freed before the new ones are allocated, so
//! the free list usually hands the same numbers straight back; the new
//! pages are sorted by page number to keep the file laid out for
//! sequential scans.
//!
//! The cursor attached to the operation survives the reshuffle: its
//! position is converted to an index into the combined run beforehand and
//! mapped back to whichever new page (or parent slot) receives that cell.
//!
//! ## The Root
//!
//! The root page cannot move (its number names the tree), so it is handled
//! by content transfer instead: an overfull root pushes its cells down
//! into a fresh child and redistributes from there; a root left empty with
//! a single right child pulls that child's content up and frees the child.

use smallvec::SmallVec;

use crate::config::USABLE_SPACE;
use crate::rc::{Result, ResultCode};
use crate::storage::PageNumber;

use super::cursor::Cursor;
use super::node::Cell;
use super::BTree;

enum RootOutcome {
    /// The root needed no redistribution (or absorbed its child).
    Done,
    /// The root's content moved into `child`; redistribute that, with the
    /// root acting as parent. `extra_unref` carries the allocation pin
    /// when the cursor did not take it over.
    Continue {
        child: PageNumber,
        extra_unref: Option<PageNumber>,
    },
}

impl BTree {
    /// Balances `page_no` (which must be writable) and its ancestors.
    /// `cursor` is the cursor driving the mutation; its position follows
    /// the cells it points at.
    pub(crate) fn balance(&mut self, page_no: PageNumber, cursor: &mut Cursor) -> Result<()> {
        if !self.pager.is_writable(page_no) {
            return Err(ResultCode::Error);
        }

        {
            let node = self.node_ref(page_no)?;
            if !node.is_overfull()
                && node.free_bytes() < (USABLE_SPACE / 2) as u32
                && node.num_cells() >= 2
            {
                self.node_mut(page_no)?.relink_cell_list();
                return Ok(());
            }
        }

        let mut page_no = page_no;
        let mut parent = self.pager.extra(page_no)?.parent;
        let mut extra_unref = None;

        if parent.is_none() {
            match self.balance_root(page_no, cursor)? {
                RootOutcome::Done => return Ok(()),
                RootOutcome::Continue {
                    child,
                    extra_unref: extra,
                } => {
                    parent = Some(page_no);
                    page_no = child;
                    extra_unref = extra;
                }
            }
        }
        let parent = match parent {
            Some(p) => p,
            None => return Err(ResultCode::Internal),
        };

        let result = self.balance_nonroot(page_no, parent, cursor);
        if let Some(extra) = extra_unref {
            self.pager.unref(extra);
        }
        result
    }

    fn balance_root(&mut self, root: PageNumber, cursor: &mut Cursor) -> Result<RootOutcome> {
        if self.node_ref(root)?.num_cells() == 0 {
            let right = self.node_ref(root)?.right_child();
            if right != 0 {
                // A lone right child: pull its content up into the root
                // and retire the child page.
                self.pager.get(right)?;
                if let Err(rc) = self.init_page(right, Some(root)) {
                    self.pager.unref(right);
                    return Err(rc);
                }
                let (image, mut state) = self.node_mut(right)?.snapshot();
                state.parent = None;
                self.node_mut(root)?.install(image, state);
                self.reparent_children(root)?;
                if cursor.page == Some(right) {
                    self.pager.unref(right);
                    cursor.page = Some(root);
                    self.pager.ref_page(root);
                }
                self.free_page(right)?;
                self.pager.unref(right);
            } else {
                self.node_mut(root)?.relink_cell_list();
            }
            return Ok(RootOutcome::Done);
        }

        if !self.node_ref(root)?.is_overfull() {
            self.node_mut(root)?.relink_cell_list();
            return Ok(RootOutcome::Done);
        }

        // Overfull root: push its content into a fresh child and let the
        // redistribution below split that child, with the root as parent.
        self.pager.write(root)?;
        let child = self.allocate_page()?;
        {
            let (image, mut state) = self.node_mut(root)?.snapshot();
            state.parent = None;
            state.overfull = true;
            self.node_mut(child)?.install(image, state);
        }
        self.set_parent(child, Some(root))?;

        let extra_unref = if cursor.page == Some(root) {
            self.pager.unref(root);
            cursor.page = Some(child);
            None
        } else {
            Some(child)
        };

        self.node_mut(root)?.zero_page();
        self.node_mut(root)?.set_right_child(child);
        Ok(RootOutcome::Continue { child, extra_unref })
    }

    fn find_child_index(
        &self,
        page_no: PageNumber,
        parent: PageNumber,
    ) -> Result<Option<usize>> {
        let node = self.node_ref(parent)?;
        for i in 0..node.num_cells() {
            if node.cell_header(i).left_child == page_no {
                return Ok(Some(i));
            }
        }
        if node.right_child() == page_no {
            return Ok(Some(node.num_cells()));
        }
        Ok(None)
    }

    fn balance_nonroot(
        &mut self,
        page_no: PageNumber,
        parent: PageNumber,
        cursor: &mut Cursor,
    ) -> Result<()> {
        self.pager.ref_page(parent);
        let mut pinned: SmallVec<[PageNumber; 8]> = SmallVec::new();
        let result = self.redistribute(page_no, parent, cursor, &mut pinned);
        for page in pinned {
            self.pager.unref(page);
        }
        if cursor.page.is_none() {
            // Donate the parent reference to the stranded cursor.
            cursor.page = Some(parent);
            cursor.cell_index = 0;
        } else {
            self.pager.unref(parent);
        }
        result
    }

    fn redistribute(
        &mut self,
        page_no: PageNumber,
        parent: PageNumber,
        cursor: &mut Cursor,
        pinned: &mut SmallVec<[PageNumber; 8]>,
    ) -> Result<()> {
        self.pager.write(parent)?;
        let idx = match self.find_child_index(page_no, parent)? {
            Some(i) => i,
            None => return Err(ResultCode::Corrupt),
        };

        let parent_cells = self.node_ref(parent)?.num_cells();
        let divider_start = if idx == parent_cells {
            idx.saturating_sub(2)
        } else {
            idx.saturating_sub(1)
        };

        // The divider set: up to three consecutive children of the parent,
        // with the parent cells that separate them.
        let mut divider_pages: SmallVec<[PageNumber; 3]> = SmallVec::new();
        let mut divider_cell_idx: SmallVec<[usize; 2]> = SmallVec::new();
        let mut divider_cells: SmallVec<[Cell; 2]> = SmallVec::new();
        let mut divider_right: SmallVec<[PageNumber; 3]> = SmallVec::new();
        let mut divider_counts: SmallVec<[usize; 3]> = SmallVec::new();

        for k in divider_start..divider_start + 3 {
            let child = if k < parent_cells {
                divider_cell_idx.push(k);
                let header = self.node_ref(parent)?.cell_header(k);
                divider_cells.push(self.node_ref(parent)?.cell(k));
                header.left_child
            } else if k == parent_cells {
                self.node_ref(parent)?.right_child()
            } else {
                break;
            };
            self.pager.get(child)?;
            pinned.push(child);
            self.init_page(child, Some(parent))?;
            // The page will be dissolved and zeroed below; its pre-image
            // must reach the journal first.
            self.pager.write(child)?;
            divider_pages.push(child);
            divider_right.push(self.node_ref(child)?.right_child());
            divider_counts.push(self.node_ref(child)?.num_cells());
        }

        // Freeze the cursor's position as an index into the combined run.
        let old_cursor_page = cursor.page;
        let mut cursor_linear: Option<usize> = None;
        {
            let mut acc = 0usize;
            for (i, &dpn) in divider_pages.iter().enumerate() {
                if cursor.page == Some(dpn) {
                    cursor_linear = Some(acc + cursor.cell_index as usize);
                    break;
                }
                acc += divider_counts[i];
                if i < divider_pages.len() - 1 {
                    if cursor.page == Some(parent)
                        && cursor.cell_index as usize == divider_cell_idx[i]
                    {
                        cursor_linear = Some(acc);
                        break;
                    }
                    acc += 1;
                }
            }
        }

        // Pull every cell into one ordered run, dissolving the divider
        // pages and dropping the divider cells from the parent.
        let mut cells: Vec<Cell> = Vec::new();
        let mut final_right_child = 0;
        for i in 0..divider_pages.len() {
            let dpn = divider_pages[i];
            {
                let node = self.node_ref(dpn)?;
                for j in 0..node.num_cells() {
                    cells.push(node.cell(j));
                }
            }
            if i < divider_pages.len() - 1 {
                let mut divider = divider_cells[i].clone();
                divider.header.left_child = divider_right[i];
                cells.push(divider);
                self.node_mut(parent)?.drop_cell(divider_start);
            } else {
                final_right_child = divider_right[i];
            }
            self.node_mut(dpn)?.zero_page();
            self.free_page(dpn)?;
        }
        let cell_sizes: Vec<i64> = cells.iter().map(|c| c.cell_size() as i64).collect();

        // Greedy packing into page-sized partitions.
        let mut partition_totals: Vec<i64> = Vec::new();
        let mut partition_ends: Vec<usize> = Vec::new();
        let mut subtotal = 0i64;
        for (i, &size) in cell_sizes.iter().enumerate() {
            if subtotal + size > USABLE_SPACE as i64 {
                partition_totals.push(subtotal);
                partition_ends.push(i);
                subtotal = size;
            } else {
                subtotal += size;
            }
        }
        partition_totals.push(subtotal);
        partition_ends.push(cells.len());

        // Even out from the tail: no page ends up less than half full.
        for i in (1..partition_totals.len()).rev() {
            while partition_totals[i] < (USABLE_SPACE / 2) as i64 {
                let boundary = partition_ends[i - 1];
                if boundary == 0 {
                    break;
                }
                partition_ends[i - 1] = boundary - 1;
                partition_totals[i] += cell_sizes[boundary - 1];
                if boundary >= 2 {
                    partition_totals[i - 1] -= cell_sizes[boundary - 2];
                }
            }
        }

        // Fresh pages for each partition; the free list typically returns
        // the numbers just freed. Ascending page order keeps neighbouring
        // cells in neighbouring file positions.
        let mut new_pages: SmallVec<[PageNumber; 4]> = SmallVec::new();
        for _ in 0..partition_totals.len() {
            let page = self.allocate_page()?;
            pinned.push(page);
            self.node_mut(page)?.zero_page();
            new_pages.push(page);
        }
        new_pages.sort_unstable();

        // Re-emit the run: cells into the new pages, boundary cells into
        // the parent as fresh dividers.
        let mut inserted = 0usize;
        let mut divider_at = divider_start;
        let mut cursor_moved = false;
        for (i, &npn) in new_pages.iter().enumerate() {
            while inserted < partition_ends[i] {
                if cursor_linear == Some(inserted) {
                    cursor.page = Some(npn);
                    cursor.cell_index = self.node_ref(npn)?.num_cells() as u16;
                    cursor_moved = true;
                }
                let cell = std::mem::take(&mut cells[inserted]);
                let end = self.node_ref(npn)?.num_cells();
                self.node_mut(npn)?.insert_cell(cell, end);
                inserted += 1;
            }
            if i < new_pages.len() - 1 {
                let boundary_left = cells[inserted].header.left_child;
                self.node_mut(npn)?.set_right_child(boundary_left);
                let mut divider = std::mem::take(&mut cells[inserted]);
                divider.header.left_child = npn;
                if cursor_linear == Some(inserted) {
                    cursor.page = Some(parent);
                    cursor.cell_index = divider_at as u16;
                    cursor_moved = true;
                }
                self.node_mut(parent)?.insert_cell(divider, divider_at);
                inserted += 1;
                divider_at += 1;
            }
        }

        let last_page = *new_pages.last().ok_or(ResultCode::Internal)?;
        self.node_mut(last_page)?.set_right_child(final_right_child);
        // The emitted cells carried next_cell offsets from their old
        // pages; fix the on-disk chains while the pages are still pinned.
        for &npn in new_pages.iter() {
            self.node_mut(npn)?.relink_cell_list();
        }
        if divider_at == self.node_ref(parent)?.num_cells() {
            self.node_mut(parent)?.set_right_child(last_page);
        } else {
            let mut header = self.node_ref(parent)?.cell_header(divider_at);
            header.left_child = last_page;
            self.node_mut(parent)?.set_cell_header(divider_at, header);
        }

        // Patch the cursor's bookkeeping for the reshuffle. Freed pages are
        // usually handed straight back as new pages, so page numbers alone
        // cannot tell whether the cursor was relocated.
        if cursor_moved {
            if cursor.page != old_cursor_page {
                if let Some(old) = old_cursor_page {
                    self.pager.unref(old);
                }
                if let Some(new) = cursor.page {
                    self.pager.ref_page(new);
                }
            }
        } else if old_cursor_page.is_some_and(|p| divider_pages.contains(&p)) {
            // The cursor pointed one past the cells of the divider set;
            // park it past the end of the last new page.
            cursor.page = Some(last_page);
            cursor.cell_index = self.node_ref(last_page)?.num_cells() as u16;
            if old_cursor_page != Some(last_page) {
                if let Some(old) = old_cursor_page {
                    self.pager.unref(old);
                }
                self.pager.ref_page(last_page);
            }
        } else if old_cursor_page == Some(parent)
            && cursor.cell_index as usize >= divider_start + divider_cells.len()
        {
            // The cursor sat on a parent cell beyond the divider range;
            // its index shifts by the change in divider count.
            cursor.cell_index = (cursor.cell_index as usize - divider_cells.len()
                + (new_pages.len() - 1)) as u16;
        }

        for &npn in new_pages.iter() {
            self.reparent_children(npn)?;
        }
        self.reparent_children(parent)?;

        self.balance(parent, cursor)
    }
}
