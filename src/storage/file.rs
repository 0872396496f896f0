//! # OS File Facade
//!
//! Thin contract over byte-addressable files as the pager consumes them:
//! positioned reads and writes, fsync, truncate, and whole-file advisory
//! locking in two levels (shared and exclusive).
//!
//! ## Locking Model
//!
//! OS-level locks are taken per file handle with [`fs2`]. On top of that, a
//! process-wide table keyed by `(device, inode)` tracks a lock count for each
//! underlying file:
//!
//! ```text
//! cnt == 0    unlocked
//! cnt  > 0    cnt handles in this process hold shared locks
//! cnt == -1   one handle in this process holds the exclusive lock
//! ```
//!
//! POSIX-style advisory locks are owned by the *process*, so two handles in
//! one process cannot rely on the OS alone to exclude each other; the table
//! makes in-process exclusion explicit and keeps a shared lock from being
//! silently stolen by an in-process upgrade. The table is guarded by a
//! process-wide mutex held only during lock transitions. On platforms
//! without a usable `(device, inode)` pair the table degrades to per-handle
//! bookkeeping and the OS lock does all the work.
//!
//! ## Error Mapping
//!
//! Failures surface as the extended `io_error_*` codes; lock contention is
//! `busy`. Write failures report `full`, matching the journal-growth
//! semantics of the layer above.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use parking_lot::Mutex;

use crate::rc::{Result, ResultCode};

/// Buffer length filled by [`random_seed`].
pub const RANDOM_SEED_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LockKey {
    dev: u64,
    ino: u64,
}

struct LockInfo {
    /// 0 unlocked, n > 0 shared by n handles, -1 exclusively held.
    cnt: i32,
    /// Open handles referring to this file.
    num_ref: u32,
}

static LOCK_TABLE: LazyLock<Mutex<HashMap<LockKey, LockInfo>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[cfg(unix)]
fn lock_key(file: &File) -> Result<LockKey> {
    use std::os::unix::fs::MetadataExt;
    let meta = file.metadata().map_err(|_| ResultCode::IoErrorFstat)?;
    Ok(LockKey {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

#[cfg(not(unix))]
fn lock_key(_file: &File) -> Result<LockKey> {
    use std::sync::atomic::{AtomicU64, Ordering};
    // Without a stable (device, inode) pair each handle gets its own entry;
    // cross-handle exclusion falls to the OS lock alone.
    static NEXT: AtomicU64 = AtomicU64::new(1);
    Ok(LockKey {
        dev: u64::MAX,
        ino: NEXT.fetch_add(1, Ordering::Relaxed),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockLevel {
    None,
    Shared,
    Exclusive,
}

/// An open database, journal, or checkpoint file.
///
/// Dropping the handle closes the file, releases any OS lock it holds, and
/// retires its entry in the process-wide lock table.
pub struct DbFile {
    file: File,
    path: PathBuf,
    key: LockKey,
    level: LockLevel,
}

impl DbFile {
    /// Opens `path` read-write, creating it if absent. Falls back to
    /// read-only when the file exists but cannot be opened for writing; the
    /// second tuple element reports whether the fallback was taken.
    pub fn open_read_write(path: &Path) -> Result<(DbFile, bool)> {
        let rw = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path);
        let (file, read_only) = match rw {
            std::result::Result::Ok(f) => (f, false),
            Err(_) => {
                let f = File::open(path).map_err(|_| ResultCode::CantOpen)?;
                (f, true)
            }
        };
        DbFile::register(file, path).map(|db| (db, read_only))
    }

    /// Creates `path` exclusively; fails if it already exists.
    pub fn open_exclusive(path: &Path) -> Result<DbFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|_| ResultCode::CantOpen)?;
        DbFile::register(file, path)
    }

    /// Opens `path` read-only.
    pub fn open_read_only(path: &Path) -> Result<DbFile> {
        let file = File::open(path).map_err(|_| ResultCode::CantOpen)?;
        DbFile::register(file, path)
    }

    fn register(file: File, path: &Path) -> Result<DbFile> {
        let key = lock_key(&file)?;
        let mut table = LOCK_TABLE.lock();
        table
            .entry(key)
            .or_insert(LockInfo { cnt: 0, num_ref: 0 })
            .num_ref += 1;
        Ok(DbFile {
            file,
            path: path.to_path_buf(),
            key,
            level: LockLevel::None,
        })
    }

    /// Whether `path` names an existing file.
    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    /// Removes `path` from the file system.
    pub fn delete(path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|_| ResultCode::IoErrorDelete)
    }

    /// The path this handle was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads exactly `buf.len()` bytes at the current position.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact(buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                ResultCode::IoErrorShortRead
            } else {
                ResultCode::IoErrorRead
            }
        })
    }

    /// Writes all of `buf` at the current position. A failed write is
    /// reported as `full`: the dominant cause is an exhausted volume, and
    /// the pager treats it as "the journal cannot grow".
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf).map_err(|_| ResultCode::Full)
    }

    /// Moves the file cursor to an absolute offset.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map(|_| ())
            .map_err(|_| ResultCode::IoErrorSeek)
    }

    /// Current absolute position of the file cursor.
    pub fn position(&mut self) -> Result<u64> {
        self.file
            .stream_position()
            .map_err(|_| ResultCode::IoErrorSeek)
    }

    /// Forces file contents and metadata to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().map_err(|_| ResultCode::IoErrorFsync)
    }

    /// Truncates or extends the file to `size` bytes.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        self.file
            .set_len(size)
            .map_err(|_| ResultCode::IoErrorTruncate)
    }

    /// File size in bytes.
    pub fn size(&mut self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|_| ResultCode::IoErrorFstat)
    }

    /// Acquires a shared lock. Downgrades in place when this handle holds
    /// the exclusive lock. `busy` when an in-process or foreign writer holds
    /// the file.
    pub fn read_lock(&mut self) -> Result<()> {
        match self.level {
            LockLevel::Shared => Ok(()),
            LockLevel::Exclusive => {
                self.file
                    .lock_shared()
                    .map_err(|_| ResultCode::IoErrorRdlock)?;
                let mut table = LOCK_TABLE.lock();
                if let Some(info) = table.get_mut(&self.key) {
                    info.cnt = 1;
                }
                self.level = LockLevel::Shared;
                Ok(())
            }
            LockLevel::None => {
                let mut table = LOCK_TABLE.lock();
                let info = table.get_mut(&self.key).ok_or(ResultCode::Error)?;
                if info.cnt < 0 {
                    return Err(ResultCode::Busy);
                }
                self.file
                    .try_lock_shared()
                    .map_err(|_| ResultCode::Busy)?;
                info.cnt += 1;
                self.level = LockLevel::Shared;
                Ok(())
            }
        }
    }

    /// Acquires the exclusive lock, upgrading a shared lock this handle
    /// already holds. `busy` while any other holder exists.
    pub fn write_lock(&mut self) -> Result<()> {
        if self.level == LockLevel::Exclusive {
            return Ok(());
        }
        let mut table = LOCK_TABLE.lock();
        let info = table.get_mut(&self.key).ok_or(ResultCode::Error)?;
        let upgradable =
            info.cnt == 0 || (info.cnt == 1 && self.level == LockLevel::Shared);
        if !upgradable {
            return Err(ResultCode::Busy);
        }
        self.file
            .try_lock_exclusive()
            .map_err(|_| ResultCode::Busy)?;
        info.cnt = -1;
        self.level = LockLevel::Exclusive;
        Ok(())
    }

    /// Releases whatever lock this handle holds.
    pub fn unlock(&mut self) -> Result<()> {
        if self.level == LockLevel::None {
            return Err(ResultCode::Error);
        }
        FileExt::unlock(&self.file).map_err(|_| ResultCode::IoErrorUnlock)?;
        let mut table = LOCK_TABLE.lock();
        if let Some(info) = table.get_mut(&self.key) {
            if self.level == LockLevel::Exclusive {
                info.cnt = 0;
            } else if info.cnt > 0 {
                info.cnt -= 1;
            }
        }
        self.level = LockLevel::None;
        Ok(())
    }
}

impl Drop for DbFile {
    fn drop(&mut self) {
        let mut table = LOCK_TABLE.lock();
        if let Some(info) = table.get_mut(&self.key) {
            match self.level {
                LockLevel::Exclusive => info.cnt = 0,
                LockLevel::Shared if info.cnt > 0 => info.cnt -= 1,
                _ => {}
            }
            info.num_ref -= 1;
            if info.num_ref == 0 {
                table.remove(&self.key);
            }
        }
        // The OS releases the advisory lock when the descriptor closes.
    }
}

/// Suspends the calling thread; the busy-retry primitive of the facade.
pub fn sleep_ms(millis: u64) {
    std::thread::sleep(std::time::Duration::from_millis(millis));
}

/// Fills `seed` with weak process-local entropy (clock and pid mix). Enough
/// to seed retry jitter; not a cryptographic source.
pub fn random_seed(seed: &mut [u8; RANDOM_SEED_SIZE]) {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let pid = std::process::id();
    seed[..16].copy_from_slice(&nanos.to_ne_bytes());
    seed[16..20].copy_from_slice(&pid.to_ne_bytes());
    let mut x = nanos as u64 ^ u64::from(pid).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    for chunk in seed[20..].chunks_mut(8) {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        let bytes = x.to_ne_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
}
