//! # Journal and Checkpoint Playback
//!
//! The rollback journal is the pre-image log that makes commit and rollback
//! atomic. This module holds the pager's journal-side operations: playback
//! (shared by crash recovery and rollback), the flush path used under cache
//! pressure, write-lock release, and the nested checkpoint sub-transaction.
//!
//! ## Journal File Format
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ----------  ------------------------------------------
//! 0       8     magic       d9 d5 05 f9 20 a1 63 d4
//! 8       4     page_count  Database pages before the transaction
//! 12      1028  record[0]   {page_number: u32, image: [u8; 1024]}
//! ...           record[n]   One record per first modification
//! ```
//!
//! ## Playback
//!
//! Truncate the database back to the recorded page count, then apply the
//! records newest-first: refresh the cached copy of the page if resident
//! (dropping its overlay state) and rewrite the image at
//! `(page_number - 1) * PAGE_SIZE`. Each page appears at most once per
//! journal, so one pass restores the exact pre-transaction file. A journal
//! that never got past its header means the database was never touched;
//! it is discarded without replaying anything.
//!
//! ## Checkpoint
//!
//! A checkpoint is an inner savepoint with the same mechanics against a
//! second journal file, holding pre-images of the database's state as of
//! `ckpt_begin`. Its records carry no header; the remembered page count
//! plays that role. `ckpt_rollback` replays and then commits the
//! checkpoint to clear it. The outer journal is left untouched: the
//! pre-transaction images it holds remain valid for a full rollback.

use crate::config::{JOURNAL_HEADER_SIZE, JOURNAL_MAGIC, JOURNAL_RECORD_SIZE, PAGE_SIZE};
use crate::rc::{Result, ResultCode};
use crate::storage::file::DbFile;
use crate::storage::pager::{LockState, PageExtra, Pager, ERR_CORRUPT};
use crate::storage::PageNumber;

impl<E: PageExtra> Pager<E> {
    /// Replays the main journal, restoring the database file and any cached
    /// pages to their pre-transaction images, then releases the write lock
    /// (which also deletes the journal).
    pub(crate) fn playback(&mut self) -> Result<()> {
        debug_assert!(self.journal.is_some());

        let size_res = self.journal.as_mut().ok_or(ResultCode::Internal)?.size();
        let size = match size_res {
            std::result::Result::Ok(s) => s,
            Err(e) => return Err(self.playback_failure(e)),
        };

        if size < JOURNAL_HEADER_SIZE as u64 {
            // The header never reached the disk, so no page record did
            // either: the database was never modified.
            return self.release_write_lock();
        }
        let num_records =
            ((size - JOURNAL_HEADER_SIZE as u64) / JOURNAL_RECORD_SIZE as u64) as u32;

        let mut header = [0u8; JOURNAL_HEADER_SIZE];
        {
            let journal = self.journal.as_mut().ok_or(ResultCode::Internal)?;
            if journal.seek(0).and_then(|_| journal.read(&mut header)).is_err() {
                return Err(self.playback_failure(ResultCode::Corrupt));
            }
        }
        if header[..8] != JOURNAL_MAGIC {
            return Err(self.playback_failure(ResultCode::Corrupt));
        }
        let original =
            PageNumber::from_ne_bytes(header[8..JOURNAL_HEADER_SIZE].try_into().unwrap());

        if self
            .file
            .truncate(u64::from(original) * PAGE_SIZE as u64)
            .is_err()
        {
            return Err(self.playback_failure(ResultCode::Corrupt));
        }
        self.db_size = Some(original);

        for i in (0..num_records).rev() {
            let offset =
                JOURNAL_HEADER_SIZE as u64 + u64::from(i) * JOURNAL_RECORD_SIZE as u64;
            let seeked = self
                .journal
                .as_mut()
                .ok_or(ResultCode::Internal)?
                .seek(offset);
            if seeked.is_err() || self.playback_one_page(false).is_err() {
                return Err(self.playback_failure(ResultCode::Corrupt));
            }
        }
        self.release_write_lock()
    }

    fn playback_failure(&mut self, rc: ResultCode) -> ResultCode {
        let _ = self.release_write_lock();
        self.err_mask |= ERR_CORRUPT;
        rc
    }

    /// Reads one record at the current journal position and applies it to
    /// the cache and the database file.
    fn playback_one_page(&mut self, from_ckpt: bool) -> Result<()> {
        let mut record = [0u8; JOURNAL_RECORD_SIZE];
        {
            let source = if from_ckpt {
                self.ckpt_journal.as_mut()
            } else {
                self.journal.as_mut()
            }
            .ok_or(ResultCode::Internal)?;
            source.read(&mut record)?;
        }
        let page_no = PageNumber::from_ne_bytes(record[..4].try_into().unwrap());
        if page_no == 0 || page_no > self.db_size.unwrap_or(0) {
            return Err(ResultCode::Corrupt);
        }
        let image = &record[4..];

        // Refresh the resident copy, invalidating its overlay state.
        let released = match self.cache.get_mut(page_no) {
            Some(frame) => {
                frame.image.copy_from_slice(image);
                frame.extra.destroy()
            }
            None => None,
        };
        if let Some(parent) = released {
            self.unpin_for_overlay(parent);
        }

        self.file.seek(u64::from(page_no - 1) * PAGE_SIZE as u64)?;
        self.file.write(image)?;
        Ok(())
    }

    /// Makes every unpinned dirty page clean: syncs the journal if needed,
    /// then writes the images out. Called under cache pressure before a
    /// frame can be recycled.
    pub(crate) fn sync_all_pages(&mut self) -> Result<()> {
        if self.journal_need_sync {
            self.journal.as_mut().ok_or(ResultCode::Internal)?.sync()?;
            self.journal_need_sync = false;
        }
        for page_no in self.cache.free_frames() {
            let dirty = self.cache.get(page_no).map(|f| f.dirty).unwrap_or(false);
            if !dirty {
                continue;
            }
            self.file
                .seek(u64::from(page_no - 1) * PAGE_SIZE as u64)?;
            let frame = self.cache.get_mut(page_no).ok_or(ResultCode::Internal)?;
            self.file.write(&frame.image[..])?;
            frame.dirty = false;
        }
        Ok(())
    }

    /// Ends the write transaction: commits any open checkpoint, closes and
    /// deletes the journal, clears per-page transaction flags, and
    /// downgrades the file lock back to shared.
    pub(crate) fn release_write_lock(&mut self) -> Result<()> {
        if self.state != LockState::Write {
            return Ok(());
        }
        self.ckpt_commit()?;
        self.ckpt_journal = None;
        self.journal = None;
        let _ = DbFile::delete(&self.journal_path);
        self.in_journal.clear();
        for page_no in self.cache.pages() {
            if let Some(frame) = self.cache.get_mut(page_no) {
                frame.in_journal = false;
                frame.dirty = false;
            }
        }
        self.file.read_lock()?;
        self.state = LockState::Read;
        Ok(())
    }

    /// Opens a checkpoint: remembers the current page count and journal
    /// size and prepares the checkpoint journal. Only valid inside a write
    /// transaction, one checkpoint at a time.
    pub fn ckpt_begin(&mut self) -> Result<()> {
        if self.state != LockState::Write || self.ckpt_in_use {
            return Err(ResultCode::Misuse);
        }
        self.in_ckpt_journal.clear();
        self.ckpt_journal_size = self.journal.as_mut().ok_or(ResultCode::Internal)?.size()?;
        self.ckpt_size = self.db_size.unwrap_or(0);
        if self.ckpt_journal.is_none() {
            let (file, _) = DbFile::open_read_write(&self.ckpt_path)?;
            self.ckpt_journal = Some(file);
        }
        if let Some(ckpt) = self.ckpt_journal.as_mut() {
            ckpt.seek(0)?;
        }
        self.ckpt_in_use = true;
        Ok(())
    }

    /// Commits the checkpoint: truncates its journal and clears per-page
    /// checkpoint flags. The enclosing transaction is unaffected.
    pub fn ckpt_commit(&mut self) -> Result<()> {
        if !self.ckpt_in_use {
            return Ok(());
        }
        if let Some(ckpt) = self.ckpt_journal.as_mut() {
            let _ = ckpt.truncate(0);
            let _ = ckpt.seek(0);
        }
        self.ckpt_in_use = false;
        self.in_ckpt_journal.clear();
        for page_no in self.cache.pages() {
            if let Some(frame) = self.cache.get_mut(page_no) {
                frame.in_ckpt = false;
            }
        }
        Ok(())
    }

    /// Rolls the database back to the state captured at `ckpt_begin`, then
    /// commits the (now spent) checkpoint to clear it.
    pub fn ckpt_rollback(&mut self) -> Result<()> {
        if !self.ckpt_in_use {
            return Ok(());
        }
        let played = self.ckpt_playback();
        self.ckpt_commit()?;
        played
    }

    /// Mechanically identical to journal playback, against the checkpoint
    /// journal: truncate to the remembered page count and apply records
    /// newest-first. The outer journal is left intact; its pre-transaction
    /// images stay valid for a full rollback.
    fn ckpt_playback(&mut self) -> Result<()> {
        let size_res = self
            .ckpt_journal
            .as_mut()
            .ok_or(ResultCode::Internal)?
            .size();
        let size = match size_res {
            std::result::Result::Ok(s) => s,
            Err(_) => {
                self.err_mask |= ERR_CORRUPT;
                return Err(ResultCode::Corrupt);
            }
        };
        let num_records = (size / JOURNAL_RECORD_SIZE as u64) as u32;

        if self
            .file
            .truncate(u64::from(self.ckpt_size) * PAGE_SIZE as u64)
            .is_err()
        {
            self.err_mask |= ERR_CORRUPT;
            return Err(ResultCode::Corrupt);
        }
        self.db_size = Some(self.ckpt_size);

        // Pages allocated after ckpt_begin die with the truncation; their
        // cached frames must not be flushed back at commit.
        for page_no in self.cache.pages() {
            if page_no > self.ckpt_size {
                if let Some(frame) = self.cache.get_mut(page_no) {
                    frame.dirty = false;
                }
            }
        }

        for i in (0..num_records).rev() {
            let offset = u64::from(i) * JOURNAL_RECORD_SIZE as u64;
            let seeked = self
                .ckpt_journal
                .as_mut()
                .ok_or(ResultCode::Internal)?
                .seek(offset);
            if seeked.is_err() || self.playback_one_page(true).is_err() {
                self.err_mask |= ERR_CORRUPT;
                return Err(ResultCode::Corrupt);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use crate::config::DEFAULT_CACHE_SIZE;
    use crate::rc::ResultCode;
    use crate::storage::file::DbFile;
    use crate::storage::{EvictionPolicy, PageNumber, Pager};

    fn scratch() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        (dir, path)
    }

    fn open(path: &Path) -> Pager {
        Pager::open(path, DEFAULT_CACHE_SIZE, EvictionPolicy::FirstNonDirty).unwrap()
    }

    fn fill_page(pager: &mut Pager, page_no: PageNumber, byte: u8) {
        pager.get(page_no).unwrap();
        pager.write(page_no).unwrap();
        pager.image_mut(page_no).unwrap().fill(byte);
    }

    #[test]
    fn crash_with_hot_journal_replays_on_reopen() {
        let (_dir, path) = scratch();
        let journal_path = {
            let mut pager = open(&path);
            fill_page(&mut pager, 1, 0xaa);
            fill_page(&mut pager, 2, 0xab);
            pager.commit().unwrap();

            // A second transaction that reaches the disk but never commits.
            pager.write(1).unwrap();
            pager.image_mut(1).unwrap().fill(0xcc);
            pager.sync_all_pages().unwrap();
            pager.journal_path.clone()
            // Dropping the pager here simulates the crash: the journal
            // stays behind and the partial write sits in the file.
        };
        assert!(DbFile::exists(&journal_path));

        let mut pager = open(&path);
        pager.get(1).unwrap();
        assert!(pager.image(1).unwrap().iter().all(|&b| b == 0xaa));
        assert!(!DbFile::exists(&journal_path));
        pager.unref(1);
    }

    #[test]
    fn header_only_journal_means_untouched_database() {
        let (_dir, path) = scratch();
        {
            let mut pager = open(&path);
            fill_page(&mut pager, 1, 0x42);
            pager.commit().unwrap();
        }

        // Fabricate a journal that crashed right after begin.
        let journal_path = {
            let pager: Pager = open(&path);
            pager.journal_path.clone()
        };
        let mut header = Vec::from(crate::config::JOURNAL_MAGIC);
        header.extend_from_slice(&1u32.to_ne_bytes());
        std::fs::write(&journal_path, header).unwrap();

        let mut pager = open(&path);
        pager.get(1).unwrap();
        assert!(pager.image(1).unwrap().iter().all(|&b| b == 0x42));
        assert!(!DbFile::exists(&journal_path));
        pager.unref(1);
    }

    #[test]
    fn garbage_journal_is_corruption() {
        let (_dir, path) = scratch();
        let journal_path = {
            let mut pager = open(&path);
            fill_page(&mut pager, 1, 0x42);
            pager.commit().unwrap();
            pager.journal_path.clone()
        };
        // Plausible length, wrong magic.
        std::fs::write(&journal_path, vec![0x5a; 2068]).unwrap();

        let mut pager = open(&path);
        assert_eq!(pager.get(1).err(), Some(ResultCode::Corrupt));
    }

    #[test]
    fn ckpt_rollback_restores_checkpoint_state() {
        let (_dir, path) = scratch();
        let mut pager = open(&path);
        fill_page(&mut pager, 1, 0x11);
        pager.commit().unwrap();

        pager.write(1).unwrap();
        pager.image_mut(1).unwrap().fill(0x22);

        pager.ckpt_begin().unwrap();
        pager.write(1).unwrap();
        pager.image_mut(1).unwrap().fill(0x33);
        pager.ckpt_rollback().unwrap();

        // Back to the state at ckpt_begin, transaction still alive.
        assert!(pager.image(1).unwrap().iter().all(|&b| b == 0x22));
        pager.commit().unwrap();
        pager.unref(1);

        let mut pager = open(&path);
        pager.get(1).unwrap();
        assert!(pager.image(1).unwrap().iter().all(|&b| b == 0x22));
        pager.unref(1);
    }

    #[test]
    fn ckpt_commit_keeps_inner_changes() {
        let (_dir, path) = scratch();
        let mut pager = open(&path);
        fill_page(&mut pager, 1, 0x11);
        pager.commit().unwrap();

        pager.write(1).unwrap();
        pager.image_mut(1).unwrap().fill(0x22);
        pager.ckpt_begin().unwrap();
        pager.write(1).unwrap();
        pager.image_mut(1).unwrap().fill(0x33);
        pager.ckpt_commit().unwrap();
        pager.commit().unwrap();
        pager.unref(1);

        let mut pager = open(&path);
        pager.get(1).unwrap();
        assert!(pager.image(1).unwrap().iter().all(|&b| b == 0x33));
        pager.unref(1);
    }

    #[test]
    fn full_rollback_unwinds_past_a_committed_ckpt() {
        let (_dir, path) = scratch();
        let mut pager = open(&path);
        fill_page(&mut pager, 1, 0x11);
        pager.commit().unwrap();

        pager.write(1).unwrap();
        pager.image_mut(1).unwrap().fill(0x22);
        pager.ckpt_begin().unwrap();
        pager.write(1).unwrap();
        pager.image_mut(1).unwrap().fill(0x33);
        pager.ckpt_commit().unwrap();

        pager.rollback().unwrap();
        assert!(pager.image(1).unwrap().iter().all(|&b| b == 0x11));
        pager.unref(1);
    }

    #[test]
    fn ckpt_requires_write_transaction() {
        let (_dir, path) = scratch();
        let mut pager = open(&path);
        pager.get(1).unwrap();
        assert_eq!(pager.ckpt_begin().err(), Some(ResultCode::Misuse));
        pager.unref(1);
    }

    #[test]
    fn ckpt_rollback_restores_page_count() {
        let (_dir, path) = scratch();
        let mut pager = open(&path);
        fill_page(&mut pager, 1, 0x11);
        pager.commit().unwrap();

        pager.write(1).unwrap();
        pager.ckpt_begin().unwrap();
        fill_page(&mut pager, 2, 0x22);
        fill_page(&mut pager, 3, 0x33);
        pager.unref(2);
        pager.unref(3);
        pager.ckpt_rollback().unwrap();

        assert_eq!(pager.page_count(), 1);
        pager.commit().unwrap();
        pager.unref(1);
    }
}
