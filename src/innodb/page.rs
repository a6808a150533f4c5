//! InnoDB page header parsing and in-place mutation.
//!
//! Every InnoDB page begins with a 38-byte FIL header ([`FilHeader`])
//! containing the checksum, page number, prev/next pointers, LSN, page type
//! and space ID. The last 8 bytes form the FIL trailer. Page 0 additionally
//! carries the FSP header ([`FspHeader`]) at byte offset 38, and B+Tree pages
//! carry the index page header ([`IndexPageHeader`]) there instead.
//!
//! Unlike a read-only analysis tool, the import pipeline rewrites pages, so
//! this module also provides the narrow set of field mutators the converter
//! needs (space id stamp, index id, PAGE_MAX_TRX_ID, sibling links, FSEG
//! space rewrite). All access is bounds-checked slice indexing at named
//! offsets; there is no struct reinterpretation.

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

use crate::innodb::constants::*;
use crate::innodb::page_types::PageType;

/// Parsed FIL header (38 bytes, present at the start of every InnoDB page).
#[derive(Debug, Clone, Serialize)]
pub struct FilHeader {
    /// Checksum (or the crypt checksum on encrypted pages). Bytes 0-3.
    pub checksum: u32,
    /// Page number within the tablespace. Bytes 4-7.
    pub page_number: u32,
    /// Previous page in the doubly-linked list, FIL_NULL if none. Bytes 8-11.
    pub prev_page: u32,
    /// Next page in the doubly-linked list, FIL_NULL if none. Bytes 12-15.
    pub next_page: u32,
    /// LSN of the newest modification. Bytes 16-23.
    pub lsn: u64,
    /// Page type. Bytes 24-25.
    pub page_type: PageType,
    /// Encryption key version (0 when the page is not encrypted). Bytes 26-29.
    pub key_version: u32,
    /// Space ID this page belongs to. Bytes 34-37.
    pub space_id: u32,
}

impl FilHeader {
    /// Parse a FIL header from a page buffer of at least 38 bytes.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < SIZE_FIL_HEAD {
            return None;
        }

        Some(FilHeader {
            checksum: BigEndian::read_u32(&data[FIL_PAGE_SPACE_OR_CHKSUM..]),
            page_number: BigEndian::read_u32(&data[FIL_PAGE_OFFSET..]),
            prev_page: BigEndian::read_u32(&data[FIL_PAGE_PREV..]),
            next_page: BigEndian::read_u32(&data[FIL_PAGE_NEXT..]),
            lsn: BigEndian::read_u64(&data[FIL_PAGE_LSN..]),
            page_type: PageType::from_u16(BigEndian::read_u16(&data[FIL_PAGE_TYPE..])),
            key_version: BigEndian::read_u32(&data[FIL_PAGE_KEY_VERSION..]),
            space_id: BigEndian::read_u32(&data[FIL_PAGE_SPACE_ID..]),
        })
    }

    /// Returns true if prev_page points at a real page.
    pub fn has_prev(&self) -> bool {
        self.prev_page != FIL_NULL
    }

    /// Returns true if next_page points at a real page.
    pub fn has_next(&self) -> bool {
        self.next_page != FIL_NULL
    }
}

/// Parsed FSP header (from page 0 of a tablespace, starts at FIL_PAGE_DATA).
#[derive(Debug, Clone, Serialize)]
pub struct FspHeader {
    /// Space ID.
    pub space_id: u32,
    /// Size of the tablespace in pages.
    pub size: u32,
    /// Minimum page number not yet initialized.
    pub free_limit: u32,
    /// Space flags (page size, zip size, compression, checksum format).
    pub flags: u32,
    /// Number of used pages in the FSP_FREE_FRAG list.
    pub frag_n_used: u32,
}

impl FspHeader {
    /// Parse the FSP header from a full page-0 buffer.
    pub fn parse(page_data: &[u8]) -> Option<Self> {
        let offset = FIL_PAGE_DATA;
        if page_data.len() < offset + FSP_HEADER_SIZE {
            return None;
        }
        let data = &page_data[offset..];

        Some(FspHeader {
            space_id: BigEndian::read_u32(&data[FSP_SPACE_ID..]),
            size: BigEndian::read_u32(&data[FSP_SIZE..]),
            free_limit: BigEndian::read_u32(&data[FSP_FREE_LIMIT..]),
            flags: BigEndian::read_u32(&data[FSP_SPACE_FLAGS..]),
            frag_n_used: BigEndian::read_u32(&data[FSP_FRAG_N_USED..]),
        })
    }
}

/// Extract the logical page size from FSP flags.
///
/// ssize 0 means the default 16K; otherwise the size is `1 << (ssize + 9)`.
pub fn logical_size_from_flags(flags: u32) -> u32 {
    let ssize = (flags & FSP_FLAGS_MASK_PAGE_SSIZE) >> FSP_FLAGS_POS_PAGE_SSIZE;
    if ssize == 0 {
        SIZE_PAGE_DEFAULT
    } else {
        1u32 << (ssize + 9)
    }
}

/// Extract the ROW_FORMAT=COMPRESSED physical page size from FSP flags,
/// or 0 if the tablespace is not zip-compressed.
pub fn zip_size_from_flags(flags: u32) -> u32 {
    let ssize = (flags & FSP_FLAGS_MASK_ZIP_SSIZE) >> FSP_FLAGS_POS_ZIP_SSIZE;
    if ssize == 0 {
        0
    } else {
        1u32 << (ssize + 9)
    }
}

/// The physical page size: zip size when compressed, logical size otherwise.
pub fn physical_size_from_flags(flags: u32) -> u32 {
    match zip_size_from_flags(flags) {
        0 => logical_size_from_flags(flags),
        zip => zip,
    }
}

/// True if the space uses the full-CRC32 page format.
pub fn full_crc32(flags: u32) -> bool {
    flags & FSP_FLAGS_FCRC32_MARKER != 0
}

/// True if the space uses page compression.
pub fn page_compression(flags: u32) -> bool {
    flags & FSP_FLAGS_PAGE_COMPRESSION != 0
}

/// Check that space flags look structurally valid: a known page size and
/// no bits outside the defined masks.
pub fn is_valid_flags(flags: u32) -> bool {
    let defined = FSP_FLAGS_MASK_ZIP_SSIZE
        | FSP_FLAGS_FCRC32_MARKER
        | FSP_FLAGS_RESERVED
        | FSP_FLAGS_MASK_PAGE_SSIZE
        | FSP_FLAGS_PAGE_COMPRESSION
        | FSP_FLAGS_MASK_COMP_ALGO;
    if flags & !defined != 0 {
        return false;
    }
    let logical = logical_size_from_flags(flags);
    if !(SIZE_PAGE_MIN..=SIZE_PAGE_MAX).contains(&logical) {
        return false;
    }
    let zip = zip_size_from_flags(flags);
    zip == 0 || zip <= logical
}

/// Derive the FSP space flags a table with the given dictionary flags is
/// expected to use.
pub fn table_flags_to_fsp_flags(table_flags: u32) -> u32 {
    let zip_ssize = (table_flags & DICT_TF_MASK_ZIP_SSIZE) >> DICT_TF_POS_ZIP_SSIZE;
    zip_ssize << FSP_FLAGS_POS_ZIP_SSIZE
}

/// Compare expected vs. actual space flags, ignoring the bits the import
/// normalizes (checksum format, reserved bit, page compression choice).
pub fn fsp_flags_match(expected: u32, actual: u32) -> bool {
    let ignore = FSP_FLAGS_FCRC32_MARKER
        | FSP_FLAGS_RESERVED
        | FSP_FLAGS_MASK_PAGE_SSIZE
        | FSP_FLAGS_PAGE_COMPRESSION
        | FSP_FLAGS_MASK_COMP_ALGO;
    (expected & !ignore) == (actual & !ignore)
}

/// Parsed INDEX page header (at FIL_PAGE_DATA within a B+Tree page).
#[derive(Debug, Clone, Serialize)]
pub struct IndexPageHeader {
    /// Number of directory slots in the page directory.
    pub n_dir_slots: u16,
    /// Pointer to record heap top.
    pub heap_top: u16,
    /// Number of records in the heap. Bit 15 is the compact format flag.
    pub n_heap_raw: u16,
    /// Pointer to the start of the free record list (0 if none).
    pub free: u16,
    /// Number of bytes in deleted records.
    pub garbage: u16,
    /// Number of user records on the page.
    pub n_recs: u16,
    /// Highest trx id that may have modified a record (secondary leaf only).
    pub max_trx_id: u64,
    /// Level in the B+Tree (0 = leaf).
    pub level: u16,
    /// Index ID the page belongs to.
    pub index_id: u64,
}

impl IndexPageHeader {
    /// Parse an index page header from a full page buffer.
    pub fn parse(page_data: &[u8]) -> Option<Self> {
        let base = FIL_PAGE_DATA;
        if page_data.len() < base + PAGE_HEADER_SIZE {
            return None;
        }
        let d = &page_data[base..];

        Some(IndexPageHeader {
            n_dir_slots: BigEndian::read_u16(&d[PAGE_N_DIR_SLOTS..]),
            heap_top: BigEndian::read_u16(&d[PAGE_HEAP_TOP..]),
            n_heap_raw: BigEndian::read_u16(&d[PAGE_N_HEAP..]),
            free: BigEndian::read_u16(&d[PAGE_FREE..]),
            garbage: BigEndian::read_u16(&d[PAGE_GARBAGE..]),
            n_recs: BigEndian::read_u16(&d[PAGE_N_RECS..]),
            max_trx_id: BigEndian::read_u64(&d[PAGE_MAX_TRX_ID..]),
            level: BigEndian::read_u16(&d[PAGE_LEVEL..]),
            index_id: BigEndian::read_u64(&d[PAGE_INDEX_ID..]),
        })
    }

    /// Number of heap records with the compact flag masked out.
    pub fn n_heap(&self) -> u16 {
        self.n_heap_raw & 0x7FFF
    }

    /// True if the page uses the compact record format.
    pub fn is_compact(&self) -> bool {
        (self.n_heap_raw & 0x8000) != 0
    }

    /// True for leaf-level pages.
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }
}

/// True if the page has neither a previous nor a next sibling, i.e. is the
/// root (or sole) page of its tree level.
pub fn page_is_root(page: &[u8]) -> bool {
    BigEndian::read_u32(&page[FIL_PAGE_PREV..]) == FIL_NULL
        && BigEndian::read_u32(&page[FIL_PAGE_NEXT..]) == FIL_NULL
}

/// True if the index page is a leaf (level 0).
pub fn page_is_leaf(page: &[u8]) -> bool {
    BigEndian::read_u16(&page[FIL_PAGE_DATA + PAGE_LEVEL..]) == 0
}

/// True if the index page holds no user records.
pub fn page_is_empty(page: &[u8]) -> bool {
    BigEndian::read_u16(&page[FIL_PAGE_DATA + PAGE_N_RECS..]) == 0
}

/// Read the index id of a B+Tree page.
pub fn page_get_index_id(page: &[u8]) -> u64 {
    BigEndian::read_u64(&page[FIL_PAGE_DATA + PAGE_INDEX_ID..])
}

/// Read the embedded page number.
pub fn page_get_page_no(page: &[u8]) -> u32 {
    BigEndian::read_u32(&page[FIL_PAGE_OFFSET..])
}

/// Stamp the space id field of the FIL header (present on every page).
pub fn page_set_space_id(page: &mut [u8], space_id: u32) {
    BigEndian::write_u32(&mut page[FIL_PAGE_SPACE_ID..], space_id);
}

/// Write the index id of a B+Tree page.
pub fn page_set_index_id(page: &mut [u8], index_id: u64) {
    BigEndian::write_u64(&mut page[FIL_PAGE_DATA + PAGE_INDEX_ID..], index_id);
}

/// Write PAGE_MAX_TRX_ID.
pub fn page_set_max_trx_id(page: &mut [u8], trx_id: u64) {
    BigEndian::write_u64(&mut page[FIL_PAGE_DATA + PAGE_MAX_TRX_ID..], trx_id);
}

/// Write the previous-page link.
pub fn page_set_prev(page: &mut [u8], prev: u32) {
    BigEndian::write_u32(&mut page[FIL_PAGE_PREV..], prev);
}

/// Write the next-page link.
pub fn page_set_next(page: &mut [u8], next: u32) {
    BigEndian::write_u32(&mut page[FIL_PAGE_NEXT..], next);
}

/// Write the page type code.
pub fn page_set_type(page: &mut [u8], page_type: PageType) {
    BigEndian::write_u16(&mut page[FIL_PAGE_TYPE..], page_type.to_u16());
}

/// Rewrite the space id of both B+Tree segment headers on a root page
/// (leaf and top copies). Returns the previous space ids.
pub fn page_set_fseg_space(page: &mut [u8], space_id: u32) -> (u32, u32) {
    let leaf = FIL_PAGE_DATA + PAGE_BTR_SEG_LEAF + FSEG_HDR_SPACE;
    let top = FIL_PAGE_DATA + PAGE_BTR_SEG_TOP + FSEG_HDR_SPACE;
    let old_leaf = BigEndian::read_u32(&page[leaf..]);
    let old_top = BigEndian::read_u32(&page[top..]);
    BigEndian::write_u32(&mut page[leaf..], space_id);
    BigEndian::write_u32(&mut page[top..], space_id);
    (old_leaf, old_top)
}

/// Read the space ids of the two B+Tree segment headers on a root page.
pub fn page_get_fseg_space(page: &[u8]) -> (u32, u32) {
    let leaf = FIL_PAGE_DATA + PAGE_BTR_SEG_LEAF + FSEG_HDR_SPACE;
    let top = FIL_PAGE_DATA + PAGE_BTR_SEG_TOP + FSEG_HDR_SPACE;
    (
        BigEndian::read_u32(&page[leaf..]),
        BigEndian::read_u32(&page[top..]),
    )
}
