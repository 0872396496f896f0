//! # Pager
//!
//! Presents the database file as a sequence of 1-indexed fixed-size pages,
//! cached in memory, with write-ahead rollback journaling. One `Pager` owns
//! one open database file; at this level the pager *is* the database
//! connection.
//!
//! ## Lock States
//!
//! ```text
//! Unlocked ──get()──> ReadLock ──write()──> WriteLock
//!     ^                  │   ^                  │
//!     └── last unpin ────┘   └── commit/rollback┘
//! ```
//!
//! The first `get` acquires the shared file lock (replaying a leftover
//! journal first if one exists). The first `write` in a transaction takes
//! the exclusive lock, creates the journal and stamps it with the magic
//! prefix and the pre-transaction page count. Commit and rollback drop back
//! to the shared lock; releasing the last pin resets the cache and drops
//! the shared lock too.
//!
//! ## Pre-image Protocol
//!
//! Before a page is modified for the first time in a transaction its
//! original image goes into the journal, exactly once, tracked by a page
//! bitmap. Pages beyond the pre-transaction file size are not journaled:
//! rollback restores them by truncation. Dirty pages reach the database
//! file only at commit (or under cache pressure), strictly after the
//! journal has been made durable.
//!
//! ## Typed Pages
//!
//! Layers above attach derived in-memory state to every frame through the
//! [`PageExtra`] parameter. The cache clears that state when a frame is
//! recycled or overwritten by journal playback; the `destroy` hook may
//! surrender one page number the overlay held pinned (its parent link) so
//! the pin is returned to the cache.
//!
//! ## Fault Masking
//!
//! I/O faults latch into an error mask. Once a fault other than `full` is
//! latched, every entry point reports it until a successful `rollback`
//! clears the state.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use roaring::RoaringBitmap;

use crate::config::{DEFAULT_CACHE_SIZE, PAGE_SIZE};
use crate::rc::{Result, ResultCode};
use crate::storage::cache::{zeroed_image, Frame, PageCache};
use crate::storage::file::DbFile;
use crate::storage::{EvictionPolicy, PageImage, PageNumber};

/// Derived in-memory state carried by every cached frame.
///
/// The pager constructs it with `Default` when a page is admitted and calls
/// [`PageExtra::destroy`] when the frame is recycled or its image is
/// replaced by journal playback. `destroy` returns the page number of a
/// page the overlay held a reference on, if any, so the cache can release
/// that pin.
pub trait PageExtra: Default {
    fn destroy(&mut self) -> Option<PageNumber>;
}

impl PageExtra for () {
    fn destroy(&mut self) -> Option<PageNumber> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockState {
    Unlocked,
    Read,
    Write,
}

pub(crate) const ERR_FULL: u8 = 0x01;
pub(crate) const ERR_MEM: u8 = 0x02;
pub(crate) const ERR_LOCK: u8 = 0x04;
pub(crate) const ERR_CORRUPT: u8 = 0x08;
pub(crate) const ERR_DISK: u8 = 0x10;

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// The paged file with journal. See the module docs for the protocol.
pub struct Pager<E: PageExtra = ()> {
    pub(crate) file: DbFile,
    pub(crate) journal_path: PathBuf,
    pub(crate) ckpt_path: PathBuf,
    pub(crate) journal: Option<DbFile>,
    pub(crate) ckpt_journal: Option<DbFile>,
    pub(crate) cache: PageCache<E>,
    pub(crate) state: LockState,
    read_only: bool,
    /// Number of pages in the file; `None` means "recompute from size".
    pub(crate) db_size: Option<PageNumber>,
    /// Page count when the journal was created.
    pub(crate) original_db_size: PageNumber,
    /// Page count when the active checkpoint was opened.
    pub(crate) ckpt_size: PageNumber,
    /// Main-journal size when the active checkpoint was opened.
    pub(crate) ckpt_journal_size: u64,
    pub(crate) ckpt_in_use: bool,
    /// Any page modified since the transaction began.
    pub(crate) dirty: bool,
    pub(crate) journal_sync_allowed: bool,
    pub(crate) journal_need_sync: bool,
    pub(crate) in_journal: RoaringBitmap,
    pub(crate) in_ckpt_journal: RoaringBitmap,
    pub(crate) err_mask: u8,
    /// Frames with a positive pin count.
    pub(crate) pinned: u32,
    hits: u64,
    misses: u64,
    recycles: u64,
}

impl<E: PageExtra> Pager<E> {
    /// Opens (creating if needed) the database at `path` with a cache of
    /// `cache_size` frames. Journal and checkpoint files live beside the
    /// database as `<path>-journal` and `<path>-checkpoint`.
    pub fn open(path: &Path, cache_size: usize, policy: EvictionPolicy) -> Result<Pager<E>> {
        let (file, read_only) = DbFile::open_read_write(path)?;
        Ok(Pager {
            journal_path: with_suffix(path, "-journal"),
            ckpt_path: with_suffix(path, "-checkpoint"),
            file,
            journal: None,
            ckpt_journal: None,
            cache: PageCache::new(cache_size, policy),
            state: LockState::Unlocked,
            read_only,
            db_size: None,
            original_db_size: 0,
            ckpt_size: 0,
            ckpt_journal_size: 0,
            ckpt_in_use: false,
            dirty: false,
            journal_sync_allowed: true,
            journal_need_sync: false,
            in_journal: RoaringBitmap::new(),
            in_ckpt_journal: RoaringBitmap::new(),
            err_mask: 0,
            pinned: 0,
            hits: 0,
            misses: 0,
            recycles: 0,
        })
    }

    /// Opens with the default cache size and eviction policy.
    pub fn open_default(path: &Path) -> Result<Pager<E>> {
        Self::open(path, DEFAULT_CACHE_SIZE, EvictionPolicy::default())
    }

    /// Returns a pinned page. Admits the page into the cache if absent:
    /// evicting under pressure, reading the image from the file (pages
    /// beyond end-of-file stay zero-filled), and stamping journal
    /// membership. The very first `get` of a quiescent pager acquires the
    /// shared lock and replays a leftover journal.
    pub fn get(&mut self, page_no: PageNumber) -> Result<()> {
        if page_no == 0 {
            return Err(ResultCode::Error);
        }
        if self.err_mask & !ERR_FULL != 0 {
            return Err(self.error_code());
        }

        if self.pinned == 0 {
            debug_assert_eq!(self.cache.len(), 0);
            self.file.read_lock()?;
            self.state = LockState::Read;
            if DbFile::exists(&self.journal_path) {
                // Hot journal: recover under the exclusive lock before
                // letting anyone read.
                if self.file.write_lock().is_err() {
                    let _ = self.file.unlock();
                    self.state = LockState::Unlocked;
                    return Err(ResultCode::BusyRecovery);
                }
                self.state = LockState::Write;
                match DbFile::open_read_write(&self.journal_path) {
                    std::result::Result::Ok((journal, _)) => self.journal = Some(journal),
                    Err(_) => {
                        let _ = self.file.unlock();
                        self.state = LockState::Unlocked;
                        return Err(ResultCode::BusyRecovery);
                    }
                }
                self.playback()?;
            }
        } else if self.cache.get(page_no).is_some() {
            self.hits += 1;
            self.pin(page_no);
            self.cache.touch(page_no);
            return Ok(());
        }

        self.misses += 1;
        let image = if !self.cache.is_full() || !self.cache.has_free_frames() {
            zeroed_image()
        } else {
            let victim = match self.cache.pick_victim() {
                Some(v) => v,
                None => {
                    // Every unpinned frame is dirty: make them clean by
                    // syncing the journal and flushing, then retry.
                    if self.sync_all_pages().is_err() {
                        let _ = self.rollback();
                        return Err(ResultCode::IoError);
                    }
                    match self.cache.pick_victim() {
                        Some(v) => v,
                        None => return Err(ResultCode::Internal),
                    }
                }
            };
            self.recycles += 1;
            let mut old = self.cache.remove(victim).ok_or(ResultCode::Internal)?;
            if let Some(parent) = old.extra.destroy() {
                self.unpin_for_overlay(parent);
            }
            old.image.fill(0);
            old.image
        };

        let mut frame = Frame::new(page_no, image);
        frame.pin_count = 1;
        frame.in_journal =
            page_no <= self.original_db_size && self.in_journal.contains(page_no);
        frame.in_ckpt = page_no <= self.ckpt_size && self.in_ckpt_journal.contains(page_no);
        self.pinned += 1;

        if self.db_size.is_none() {
            self.page_count();
        }
        let on_disk = self.db_size.unwrap_or(0) >= page_no;
        self.cache.insert(frame);
        self.cache.touch(page_no);
        if on_disk {
            self.file.seek(u64::from(page_no - 1) * PAGE_SIZE as u64)?;
            let frame = self.cache.get_mut(page_no).ok_or(ResultCode::Internal)?;
            self.file.read(&mut frame.image[..])?;
        }
        Ok(())
    }

    /// Pins and returns `true` only if the page is already cached. Unlike
    /// [`Pager::get`] this never touches the file.
    pub fn lookup(&mut self, page_no: PageNumber) -> Result<bool> {
        if page_no == 0 {
            return Err(ResultCode::Format);
        }
        if self.err_mask & !ERR_FULL != 0 {
            return Err(ResultCode::Error);
        }
        if self.pinned == 0 || self.cache.get(page_no).is_none() {
            return Ok(false);
        }
        self.pin(page_no);
        self.cache.touch(page_no);
        Ok(true)
    }

    /// Increments the pin count of a cached page.
    pub fn ref_page(&mut self, page_no: PageNumber) {
        debug_assert!(self.cache.get(page_no).is_some());
        self.pin(page_no);
        self.cache.touch(page_no);
    }

    /// Decrements the pin count. A page reaching zero joins the
    /// reclaimable pool; when the last pin in the cache is released the
    /// pager resets and drops its file lock.
    pub fn unref(&mut self, page_no: PageNumber) {
        let now_zero = match self.cache.get_mut(page_no) {
            Some(frame) => {
                debug_assert!(frame.pin_count > 0, "unref of unpinned page {page_no}");
                frame.pin_count -= 1;
                frame.pin_count == 0
            }
            None => return,
        };
        if now_zero {
            self.cache.note_unpinned(page_no);
            self.pinned -= 1;
            if self.pinned == 0 {
                self.reset();
            }
        }
    }

    /// Pin release on behalf of an overlay's parent link. Never triggers a
    /// reset; only called while the cache is mid-operation.
    pub(crate) fn unpin_for_overlay(&mut self, page_no: PageNumber) {
        let now_zero = match self.cache.get_mut(page_no) {
            Some(frame) if frame.pin_count > 0 => {
                frame.pin_count -= 1;
                frame.pin_count == 0
            }
            _ => return,
        };
        if now_zero {
            self.cache.note_unpinned(page_no);
            self.pinned -= 1;
        }
    }

    fn pin(&mut self, page_no: PageNumber) {
        let was_zero = match self.cache.get_mut(page_no) {
            Some(frame) => {
                frame.pin_count += 1;
                frame.pin_count == 1
            }
            None => return,
        };
        if was_zero {
            self.cache.note_pinned(page_no);
            self.pinned += 1;
        }
    }

    /// Declares intent to modify a pinned page: starts the write
    /// transaction if needed, records the pre-image in the journal (and the
    /// checkpoint journal) unless already recorded, and marks the page
    /// dirty.
    pub fn write(&mut self, page_no: PageNumber) -> Result<()> {
        if self.err_mask != 0 {
            return Err(ResultCode::Error);
        }
        if self.read_only {
            return Err(ResultCode::Perm);
        }
        {
            let frame = self.cache.get_mut(page_no).ok_or(ResultCode::Error)?;
            debug_assert!(frame.pin_count > 0);
            frame.dirty = true;
        }
        self.cache.touch(page_no);

        let (in_journal, in_ckpt) = {
            let frame = self.cache.get(page_no).ok_or(ResultCode::Error)?;
            (frame.in_journal, frame.in_ckpt)
        };
        if in_journal && (in_ckpt || !self.ckpt_in_use) {
            self.dirty = true;
            return Ok(());
        }

        self.begin_internal()?;
        self.dirty = true;

        if !in_journal && page_no <= self.original_db_size {
            if let Err(rc) = self.append_journal_record(page_no, false) {
                let _ = self.rollback();
                self.err_mask |= ERR_FULL;
                return Err(rc);
            }
            self.in_journal.insert(page_no);
            self.journal_need_sync = self.journal_sync_allowed;
            if let Some(frame) = self.cache.get_mut(page_no) {
                frame.in_journal = true;
                if self.ckpt_in_use {
                    frame.in_ckpt = true;
                }
            }
            if self.ckpt_in_use {
                self.in_ckpt_journal.insert(page_no);
            }
        }

        let in_ckpt = self
            .cache
            .get(page_no)
            .map(|f| f.in_ckpt)
            .unwrap_or(false);
        if self.ckpt_in_use && !in_ckpt && page_no <= self.ckpt_size {
            if let Err(rc) = self.append_journal_record(page_no, true) {
                let _ = self.rollback();
                self.err_mask |= ERR_FULL;
                return Err(rc);
            }
            self.in_ckpt_journal.insert(page_no);
            if let Some(frame) = self.cache.get_mut(page_no) {
                frame.in_ckpt = true;
            }
        }

        if self.db_size.unwrap_or(0) < page_no {
            self.db_size = Some(page_no);
        }
        Ok(())
    }

    fn append_journal_record(&mut self, page_no: PageNumber, to_ckpt: bool) -> Result<()> {
        let image = {
            let frame = self.cache.get(page_no).ok_or(ResultCode::Error)?;
            *frame.image
        };
        let target = if to_ckpt {
            self.ckpt_journal.as_mut()
        } else {
            self.journal.as_mut()
        }
        .ok_or(ResultCode::Internal)?;
        target.write(&page_no.to_ne_bytes())?;
        target.write(&image[..])?;
        Ok(())
    }

    /// Whether `write` has succeeded for this page in the current
    /// transaction, i.e. whether its image may be modified.
    pub fn is_writable(&self, page_no: PageNumber) -> bool {
        self.cache.get(page_no).map(|f| f.dirty).unwrap_or(false)
    }

    /// Suppresses the dirty mark of a cached page so commit skips it. Used
    /// for pages whose content became irrelevant (freed leaves).
    pub fn dont_write(&mut self, page_no: PageNumber) {
        if let Some(frame) = self.cache.get_mut(page_no) {
            frame.dirty = false;
        }
    }

    /// Number of pages in the database file. Cached per transaction; a
    /// failed size probe latches a disk fault and reports zero.
    pub fn page_count(&mut self) -> PageNumber {
        if let Some(n) = self.db_size {
            return n;
        }
        let bytes = match self.file.size() {
            std::result::Result::Ok(n) => n,
            Err(_) => {
                self.err_mask |= ERR_DISK;
                return 0;
            }
        };
        let pages = (bytes / PAGE_SIZE as u64) as PageNumber;
        if self.state != LockState::Unlocked {
            self.db_size = Some(pages);
        }
        pages
    }

    /// Whether the underlying file fell back to a read-only open.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Grows the cache. Requests below the configured minimum are ignored.
    pub fn set_cache_size(&mut self, frames: usize) {
        self.cache.set_capacity(frames);
    }

    /// `(hits, misses, recycles)` counters of the cache.
    pub fn cache_stats(&self) -> (u64, u64, u64) {
        (self.hits, self.misses, self.recycles)
    }

    /// Begins a write transaction on behalf of the caller. At least one
    /// page must be pinned (the pager must hold its read lock).
    pub fn begin(&mut self) -> Result<()> {
        if self.state == LockState::Unlocked {
            return Err(ResultCode::Misuse);
        }
        self.begin_internal()
    }

    pub(crate) fn begin_internal(&mut self) -> Result<()> {
        debug_assert!(self.state != LockState::Unlocked);
        if self.state != LockState::Read {
            return Ok(());
        }
        debug_assert!(self.in_journal.is_empty());
        self.file.write_lock()?;

        match DbFile::open_exclusive(&self.journal_path) {
            std::result::Result::Ok(journal) => self.journal = Some(journal),
            Err(_) => {
                let _ = self.file.read_lock();
                return Err(ResultCode::CantOpen);
            }
        }
        self.state = LockState::Write;
        self.journal_need_sync = false;
        self.dirty = false;
        self.page_count();
        self.original_db_size = self.db_size.unwrap_or(0);

        let mut header = [0u8; crate::config::JOURNAL_HEADER_SIZE];
        header[..8].copy_from_slice(&crate::config::JOURNAL_MAGIC);
        header[8..].copy_from_slice(&self.original_db_size.to_ne_bytes());
        let write_ok = self
            .journal
            .as_mut()
            .map(|j| j.write(&header).is_ok())
            .unwrap_or(false);
        if !write_ok {
            self.release_write_lock()?;
            return Err(ResultCode::Full);
        }
        Ok(())
    }

    /// Atomically publishes the transaction: journal fsync, dirty-page
    /// write-out, database fsync, journal removal, lock downgrade.
    pub fn commit(&mut self) -> Result<()> {
        if self.err_mask & ERR_FULL != 0 {
            self.rollback()?;
            return Err(ResultCode::Full);
        }
        if self.err_mask != 0 {
            return Err(self.error_code());
        }
        if self.state != LockState::Write {
            return Err(ResultCode::Error);
        }
        debug_assert!(self.journal.is_some());
        if !self.dirty {
            // Nothing changed; skip the fsyncs.
            let rc = self.release_write_lock();
            self.db_size = None;
            return rc;
        }

        if self.journal_need_sync {
            let synced = self
                .journal
                .as_mut()
                .map(|j| j.sync().is_ok())
                .unwrap_or(false);
            if !synced {
                return self.commit_abort();
            }
        }

        let mut pages = self.cache.pages();
        pages.sort_unstable();
        for page_no in pages {
            let dirty = self.cache.get(page_no).map(|f| f.dirty).unwrap_or(false);
            if !dirty {
                continue;
            }
            if self
                .file
                .seek(u64::from(page_no - 1) * PAGE_SIZE as u64)
                .is_err()
            {
                return self.commit_abort();
            }
            let frame = self.cache.get(page_no).ok_or(ResultCode::Internal)?;
            if self.file.write(&frame.image[..]).is_err() {
                return self.commit_abort();
            }
        }
        if self.journal_sync_allowed && self.file.sync().is_err() {
            return self.commit_abort();
        }
        let rc = self.release_write_lock();
        self.db_size = None;
        rc
    }

    fn commit_abort(&mut self) -> Result<()> {
        self.rollback()?;
        Err(ResultCode::Full)
    }

    /// Restores the pre-transaction state from the journal and drops back
    /// to the shared lock. A successful rollback also clears any latched
    /// fault so the pager is usable again.
    pub fn rollback(&mut self) -> Result<()> {
        if self.err_mask & !ERR_FULL != 0 {
            let code = self.error_code();
            if self.state == LockState::Write && self.playback().is_ok() {
                self.err_mask = 0;
            }
            self.db_size = None;
            return Err(code);
        }
        if self.state != LockState::Write {
            self.err_mask = 0;
            return Ok(());
        }
        match self.playback() {
            std::result::Result::Ok(()) => {
                self.err_mask = 0;
                self.db_size = None;
                Ok(())
            }
            Err(_) => {
                self.err_mask |= ERR_CORRUPT;
                self.db_size = None;
                Err(ResultCode::Corrupt)
            }
        }
    }

    pub(crate) fn error_code(&self) -> ResultCode {
        let mut rc = ResultCode::Ok;
        if self.err_mask & ERR_LOCK != 0 {
            rc = ResultCode::Protocol;
        }
        if self.err_mask & ERR_DISK != 0 {
            rc = ResultCode::IoError;
        }
        if self.err_mask & ERR_FULL != 0 {
            rc = ResultCode::Full;
        }
        if self.err_mask & ERR_MEM != 0 {
            rc = ResultCode::NoMem;
        }
        if self.err_mask & ERR_CORRUPT != 0 {
            rc = ResultCode::Corrupt;
        }
        rc
    }

    /// Drops every cached frame, rolls back a live transaction, and
    /// releases the file lock. Runs when the last pin is released.
    fn reset(&mut self) {
        self.cache.clear();
        self.pinned = 0;
        if self.state == LockState::Write {
            let _ = self.rollback();
        }
        if self.state != LockState::Unlocked {
            let _ = self.file.unlock();
        }
        self.state = LockState::Unlocked;
        self.db_size = None;
    }

    /// Shared read access to a cached page image.
    pub fn image(&self, page_no: PageNumber) -> Result<&PageImage> {
        self.cache
            .get(page_no)
            .map(|f| f.image.as_ref())
            .ok_or(ResultCode::Error)
    }

    /// Exclusive access to a cached page image. The caller is responsible
    /// for having called [`Pager::write`] first; [`Pager::is_writable`]
    /// tells.
    pub fn image_mut(&mut self, page_no: PageNumber) -> Result<&mut PageImage> {
        self.cache
            .get_mut(page_no)
            .map(|f| f.image.as_mut())
            .ok_or(ResultCode::Error)
    }

    /// Shared access to a frame's overlay state.
    pub fn extra(&self, page_no: PageNumber) -> Result<&E> {
        self.cache
            .get(page_no)
            .map(|f| &f.extra)
            .ok_or(ResultCode::Error)
    }

    /// Exclusive access to a frame's overlay state.
    pub fn extra_mut(&mut self, page_no: PageNumber) -> Result<&mut E> {
        self.cache
            .get_mut(page_no)
            .map(|f| &mut f.extra)
            .ok_or(ResultCode::Error)
    }

    /// Image and overlay of one frame, borrowed together.
    pub fn parts_mut(&mut self, page_no: PageNumber) -> Result<(&mut PageImage, &mut E)> {
        let frame = self.cache.get_mut(page_no).ok_or(ResultCode::Error)?;
        Ok((frame.image.as_mut(), &mut frame.extra))
    }

    /// Whether the page currently sits in the cache.
    pub fn is_cached(&self, page_no: PageNumber) -> bool {
        self.cache.get(page_no).is_some()
    }

    /// Pin count of a cached page; zero when absent. Testing aid.
    pub fn pin_count(&self, page_no: PageNumber) -> u32 {
        self.cache.get(page_no).map(|f| f.pin_count).unwrap_or(0)
    }
}
