//! # Free-List Trunk Pages
//!
//! Freed pages are chained into a linked list of *trunk* pages rooted at the
//! header page. Each trunk starts with the shared overflow prefix
//! (`next_page`, linking trunk to trunk), followed by a count and an inline
//! array of freed *leaf* page numbers it owns.
//!
//! ## Trunk Page Layout
//!
//! ```text
//! Offset  Size   Field        Description
//! ------  -----  -----------  ----------------------------------------
//! 0       4      next_page    Next trunk page (0 = last trunk)
//! 4       4      count        Leaf entries stored in this trunk
//! 8       4*N    entries      Freed leaf page numbers, append order
//! ```
//!
//! With 1024-byte pages a trunk holds up to 254 leaf entries.
//!
//! ## Allocation Strategy
//!
//! Allocation drains leaves from the current head trunk, most recently
//! freed first. An empty trunk is itself the next allocation, advancing the
//! list head to `next_page`. Freeing appends to the head trunk when it has
//! room; otherwise the freed page becomes the new head trunk pointing at
//! the old head.

use zerocopy::native_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{PAGE_NUMBER_SIZE, TRUNK_HEADER_SIZE, TRUNK_MAX_ENTRIES};
use crate::rc::{Result, ResultCode};
use crate::storage::PageNumber;

/// Header of a free-list trunk page. The leading field doubles as the
/// overflow-page prefix, which is what lets a trunk be reused as a plain
/// data page without rewriting its first bytes.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct TrunkHeader {
    next_page: U32,
    count: U32,
}

const _: () = assert!(size_of::<TrunkHeader>() == TRUNK_HEADER_SIZE);

impl TrunkHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        if data.len() < TRUNK_HEADER_SIZE {
            return Err(ResultCode::Corrupt);
        }
        Self::ref_from_bytes(&data[..TRUNK_HEADER_SIZE]).map_err(|_| ResultCode::Corrupt)
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        if data.len() < TRUNK_HEADER_SIZE {
            return Err(ResultCode::Corrupt);
        }
        Self::mut_from_bytes(&mut data[..TRUNK_HEADER_SIZE]).map_err(|_| ResultCode::Corrupt)
    }

    pub fn next_page(&self) -> PageNumber {
        self.next_page.get()
    }

    pub fn set_next_page(&mut self, page_no: PageNumber) {
        self.next_page = U32::new(page_no);
    }

    pub fn count(&self) -> u32 {
        self.count.get()
    }

    pub fn set_count(&mut self, count: u32) {
        self.count = U32::new(count);
    }

    pub fn is_full(&self) -> bool {
        self.count.get() as usize >= TRUNK_MAX_ENTRIES
    }

    pub fn is_empty(&self) -> bool {
        self.count.get() == 0
    }
}

fn entry_offset(index: usize) -> usize {
    TRUNK_HEADER_SIZE + index * PAGE_NUMBER_SIZE
}

/// Reads leaf entry `index` of a trunk image. Zero when out of range.
pub fn trunk_entry(image: &[u8], index: usize) -> PageNumber {
    let header = match TrunkHeader::from_bytes(image) {
        std::result::Result::Ok(h) => h,
        Err(_) => return 0,
    };
    if index >= header.count() as usize {
        return 0;
    }
    let at = entry_offset(index);
    PageNumber::from_ne_bytes(image[at..at + PAGE_NUMBER_SIZE].try_into().unwrap())
}

/// The most recently appended leaf entry, or zero for an empty trunk.
pub fn trunk_last_entry(image: &[u8]) -> PageNumber {
    let header = match TrunkHeader::from_bytes(image) {
        std::result::Result::Ok(h) => h,
        Err(_) => return 0,
    };
    if header.is_empty() {
        return 0;
    }
    trunk_entry(image, header.count() as usize - 1)
}

/// Pops the most recently appended leaf entry. Zero for an empty trunk.
pub fn trunk_pop_entry(image: &mut [u8]) -> Result<PageNumber> {
    let count = TrunkHeader::from_bytes(image)?.count();
    if count == 0 {
        return Ok(0);
    }
    let page_no = trunk_entry(image, count as usize - 1);
    TrunkHeader::from_bytes_mut(image)?.set_count(count - 1);
    Ok(page_no)
}

/// Whether the trunk still has room for another leaf entry.
pub fn trunk_can_insert(image: &[u8]) -> bool {
    TrunkHeader::from_bytes(image).map(|h| !h.is_full()).unwrap_or(false)
}

/// Appends a freed leaf page number to the trunk. No-op when full.
pub fn trunk_insert(image: &mut [u8], page_no: PageNumber) -> Result<()> {
    let count = {
        let header = TrunkHeader::from_bytes(image)?;
        if header.is_full() {
            return Ok(());
        }
        header.count()
    };
    let at = entry_offset(count as usize);
    image[at..at + PAGE_NUMBER_SIZE].copy_from_slice(&page_no.to_ne_bytes());
    TrunkHeader::from_bytes_mut(image)?.set_count(count + 1);
    Ok(())
}
