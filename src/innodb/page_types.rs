//! InnoDB page type definitions.
//!
//! Maps the 2-byte page type field (bytes 24-25 of the FIL header) to a
//! [`PageType`] enum. Only the page types the import pipeline has to handle
//! are enumerated; anything else parses as [`PageType::Other`] and is treated
//! as corruption by the page converter, because guessing at an unrecognized
//! layout is unsafe.

use serde::Serialize;
use std::fmt;

/// Page types encountered while importing a tablespace.
///
/// Values are from `fil0fil.h`. Page-compressed types (34354/37401) follow
/// the MariaDB numbering; `Instant` (0x4594) marks the clustered root page
/// of a table with instantly added columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PageType {
    /// Freshly allocated, type field not initialized (FIL_PAGE_TYPE_ALLOCATED = 0)
    Allocated,
    /// Undo log page (FIL_PAGE_UNDO_LOG = 2)
    UndoLog,
    /// File segment inode (FIL_PAGE_INODE = 3)
    Inode,
    /// Insert buffer free list (FIL_PAGE_IBUF_FREE_LIST = 4)
    IbufFreeList,
    /// Insert buffer bitmap (FIL_PAGE_IBUF_BITMAP = 5)
    IbufBitmap,
    /// System internal page (FIL_PAGE_TYPE_SYS = 6)
    Sys,
    /// Transaction system header (FIL_PAGE_TYPE_TRX_SYS = 7)
    TrxSys,
    /// File space header, page 0 of each tablespace (FIL_PAGE_TYPE_FSP_HDR = 8)
    FspHdr,
    /// Extent descriptor (FIL_PAGE_TYPE_XDES = 9)
    Xdes,
    /// Uncompressed BLOB page (FIL_PAGE_TYPE_BLOB = 10)
    Blob,
    /// First compressed BLOB page (FIL_PAGE_TYPE_ZBLOB = 11)
    ZBlob,
    /// Subsequent compressed BLOB page (FIL_PAGE_TYPE_ZBLOB2 = 12)
    ZBlob2,
    /// Instant ALTER clustered root page (FIL_PAGE_TYPE_INSTANT = 0x4594)
    Instant,
    /// R-tree index page for spatial indexes (FIL_PAGE_RTREE = 17854)
    Rtree,
    /// B+Tree index page for table and index data (FIL_PAGE_INDEX = 17855)
    Index,
    /// Page-compressed page (FIL_PAGE_PAGE_COMPRESSED = 34354)
    PageCompressed,
    /// Page-compressed and encrypted page (FIL_PAGE_PAGE_COMPRESSED_ENCRYPTED = 37401)
    PageCompressedEncrypted,
    /// Any other value; carries the raw code.
    Other(u16),
}

impl PageType {
    /// Parse a page type from a u16 value read from the FIL header.
    pub fn from_u16(val: u16) -> Self {
        match val {
            0 => PageType::Allocated,
            2 => PageType::UndoLog,
            3 => PageType::Inode,
            4 => PageType::IbufFreeList,
            5 => PageType::IbufBitmap,
            6 => PageType::Sys,
            7 => PageType::TrxSys,
            8 => PageType::FspHdr,
            9 => PageType::Xdes,
            10 => PageType::Blob,
            11 => PageType::ZBlob,
            12 => PageType::ZBlob2,
            0x4594 => PageType::Instant,
            17854 => PageType::Rtree,
            17855 => PageType::Index,
            34354 => PageType::PageCompressed,
            37401 => PageType::PageCompressedEncrypted,
            other => PageType::Other(other),
        }
    }

    /// The raw on-disk type code.
    pub fn to_u16(self) -> u16 {
        match self {
            PageType::Allocated => 0,
            PageType::UndoLog => 2,
            PageType::Inode => 3,
            PageType::IbufFreeList => 4,
            PageType::IbufBitmap => 5,
            PageType::Sys => 6,
            PageType::TrxSys => 7,
            PageType::FspHdr => 8,
            PageType::Xdes => 9,
            PageType::Blob => 10,
            PageType::ZBlob => 11,
            PageType::ZBlob2 => 12,
            PageType::Instant => 0x4594,
            PageType::Rtree => 17854,
            PageType::Index => 17855,
            PageType::PageCompressed => 34354,
            PageType::PageCompressedEncrypted => 37401,
            PageType::Other(v) => v,
        }
    }

    /// The MySQL source name for this page type.
    pub fn name(&self) -> &'static str {
        match self {
            PageType::Allocated => "FIL_PAGE_TYPE_ALLOCATED",
            PageType::UndoLog => "FIL_PAGE_UNDO_LOG",
            PageType::Inode => "FIL_PAGE_INODE",
            PageType::IbufFreeList => "FIL_PAGE_IBUF_FREE_LIST",
            PageType::IbufBitmap => "FIL_PAGE_IBUF_BITMAP",
            PageType::Sys => "FIL_PAGE_TYPE_SYS",
            PageType::TrxSys => "FIL_PAGE_TYPE_TRX_SYS",
            PageType::FspHdr => "FIL_PAGE_TYPE_FSP_HDR",
            PageType::Xdes => "FIL_PAGE_TYPE_XDES",
            PageType::Blob => "FIL_PAGE_TYPE_BLOB",
            PageType::ZBlob => "FIL_PAGE_TYPE_ZBLOB",
            PageType::ZBlob2 => "FIL_PAGE_TYPE_ZBLOB2",
            PageType::Instant => "FIL_PAGE_TYPE_INSTANT",
            PageType::Rtree => "FIL_PAGE_RTREE",
            PageType::Index => "FIL_PAGE_INDEX",
            PageType::PageCompressed => "FIL_PAGE_PAGE_COMPRESSED",
            PageType::PageCompressedEncrypted => "FIL_PAGE_PAGE_COMPRESSED_ENCRYPTED",
            PageType::Other(_) => "UNKNOWN",
        }
    }

    /// True for B+Tree node pages (INDEX, RTREE, or the instant root).
    pub fn is_index(&self) -> bool {
        matches!(self, PageType::Index | PageType::Rtree | PageType::Instant)
    }

    /// True for the page-compressed wrapper types.
    pub fn is_page_compressed(&self) -> bool {
        matches!(
            self,
            PageType::PageCompressed | PageType::PageCompressedEncrypted
        )
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageType::Other(v) => write!(f, "UNKNOWN({})", v),
            _ => write!(f, "{}", self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_codes() {
        for code in [0u16, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 17854, 17855, 34354, 37401] {
            assert_eq!(PageType::from_u16(code).to_u16(), code);
        }
        assert_eq!(PageType::from_u16(0x4594), PageType::Instant);
    }

    #[test]
    fn test_unknown_preserved() {
        let t = PageType::from_u16(12345);
        assert_eq!(t, PageType::Other(12345));
        assert_eq!(t.to_u16(), 12345);
        assert_eq!(t.name(), "UNKNOWN");
    }

    #[test]
    fn test_index_predicate() {
        assert!(PageType::Index.is_index());
        assert!(PageType::Rtree.is_index());
        assert!(PageType::Instant.is_index());
        assert!(!PageType::Blob.is_index());
        assert!(PageType::PageCompressed.is_page_compressed());
        assert!(!PageType::Index.is_page_compressed());
    }
}
