//! # On-Disk Header Views
//!
//! Byte-view structs for the two special page layouts owned by the storage
//! layer: the header page (page 1) and the overflow-page prefix. Views are
//! `#[repr(C)]` zerocopy types read and written in place over a page
//! image; the `Unaligned` wrappers let them sit at any offset of a plain
//! byte buffer. Multi-byte integers are host byte order, consistently
//! across the file.
//!
//! ## Header Page (page 1)
//!
//! ```text
//! Offset  Size  Field            Description
//! ------  ----  ---------------  -------------------------------------
//! 0       4     magic            HEADER_MAGIC; mismatch => not a database
//! 4       4     first_free_page  Head trunk of the free list (0 = empty)
//! 8       4     num_free_pages   Total pages on the free list
//! 12      12    meta[1..4]       Opaque i32 slots for the query layer
//! ```
//!
//! The caller-visible meta array has four slots; slot 0 aliases
//! `num_free_pages` and is therefore not stored separately.
//!
//! ## Overflow Page
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ----------  ----------------------------------------
//! 0       4     next_page   Next chain page (0 terminates)
//! 4       1020  payload     Cell payload bytes
//! ```

use zerocopy::native_endian::{I32, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{HEADER_MAGIC, META_ARRAY_SIZE, OVERFLOW_HEADER_SIZE, PAGE_SIZE};
use crate::rc::{Result, ResultCode};

/// Fixed fields at the start of page 1.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DbHeader {
    magic: I32,
    first_free_page: U32,
    num_free_pages: U32,
}

pub const DB_HEADER_SIZE: usize = size_of::<DbHeader>();

const _: () = assert!(DB_HEADER_SIZE == 12);

impl DbHeader {
    pub fn new() -> Self {
        Self {
            magic: I32::new(HEADER_MAGIC),
            first_free_page: U32::new(0),
            num_free_pages: U32::new(0),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        if data.len() < DB_HEADER_SIZE {
            return Err(ResultCode::Corrupt);
        }
        Self::ref_from_bytes(&data[..DB_HEADER_SIZE]).map_err(|_| ResultCode::Corrupt)
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        if data.len() < DB_HEADER_SIZE {
            return Err(ResultCode::Corrupt);
        }
        Self::mut_from_bytes(&mut data[..DB_HEADER_SIZE]).map_err(|_| ResultCode::Corrupt)
    }

    pub fn write_to(&self, data: &mut [u8]) {
        data[..DB_HEADER_SIZE].copy_from_slice(self.as_bytes());
    }

    pub fn has_magic(&self) -> bool {
        self.magic.get() == HEADER_MAGIC
    }

    pub fn first_free_page(&self) -> u32 {
        self.first_free_page.get()
    }

    pub fn set_first_free_page(&mut self, page_no: u32) {
        self.first_free_page = U32::new(page_no);
    }

    pub fn num_free_pages(&self) -> u32 {
        self.num_free_pages.get()
    }

    pub fn set_num_free_pages(&mut self, count: u32) {
        self.num_free_pages = U32::new(count);
    }
}

impl Default for DbHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the caller-visible meta array; slot 0 aliases the free-page count.
pub fn read_meta(image: &[u8; PAGE_SIZE]) -> Result<[i32; META_ARRAY_SIZE]> {
    let header = DbHeader::from_bytes(image)?;
    let mut meta = [0i32; META_ARRAY_SIZE];
    meta[0] = header.num_free_pages() as i32;
    for (i, slot) in meta.iter_mut().enumerate().skip(1) {
        let at = DB_HEADER_SIZE + (i - 1) * 4;
        *slot = i32::from_ne_bytes(image[at..at + 4].try_into().unwrap_or([0; 4]));
    }
    Ok(meta)
}

/// Writes meta slots 1..4. Slot 0 belongs to the free-list accounting and
/// is ignored here.
pub fn write_meta(image: &mut [u8; PAGE_SIZE], meta: &[i32; META_ARRAY_SIZE]) {
    for (i, slot) in meta.iter().enumerate().skip(1) {
        let at = DB_HEADER_SIZE + (i - 1) * 4;
        image[at..at + 4].copy_from_slice(&slot.to_ne_bytes());
    }
}

/// Leading field of an overflow page.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct OverflowHeader {
    next_page: U32,
}

const _: () = assert!(size_of::<OverflowHeader>() == OVERFLOW_HEADER_SIZE);

impl OverflowHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        if data.len() < OVERFLOW_HEADER_SIZE {
            return Err(ResultCode::Corrupt);
        }
        Self::ref_from_bytes(&data[..OVERFLOW_HEADER_SIZE]).map_err(|_| ResultCode::Corrupt)
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        if data.len() < OVERFLOW_HEADER_SIZE {
            return Err(ResultCode::Corrupt);
        }
        Self::mut_from_bytes(&mut data[..OVERFLOW_HEADER_SIZE]).map_err(|_| ResultCode::Corrupt)
    }

    pub fn next_page(&self) -> u32 {
        self.next_page.get()
    }

    pub fn set_next_page(&mut self, page_no: u32) {
        self.next_page = U32::new(page_no);
    }
}
