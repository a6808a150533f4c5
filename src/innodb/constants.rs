/// InnoDB page and file structure constants.
///
/// These values are derived from the MySQL/InnoDB source code headers:
/// - fil0fil.h (FIL header/trailer)
/// - page0page.h (page header, directory)
/// - fsp0fsp.h (FSP header, extent descriptors)
/// - btr0btr.h (external field references)
// Page sizes
pub const SIZE_PAGE_DEFAULT: u32 = 16384;
pub const SIZE_PAGE_MIN: u32 = 4096;
pub const SIZE_PAGE_MAX: u32 = 65536;

// FIL Header (38 bytes total)
pub const SIZE_FIL_HEAD: usize = 38;
pub const FIL_PAGE_SPACE_OR_CHKSUM: usize = 0; // 4 bytes - checksum
pub const FIL_PAGE_OFFSET: usize = 4; // 4 bytes - page number
pub const FIL_PAGE_PREV: usize = 8; // 4 bytes - previous page
pub const FIL_PAGE_NEXT: usize = 12; // 4 bytes - next page
pub const FIL_PAGE_LSN: usize = 16; // 8 bytes - LSN of newest modification
pub const FIL_PAGE_TYPE: usize = 24; // 2 bytes - page type
pub const FIL_PAGE_FILE_FLUSH_LSN: usize = 26; // 8 bytes - flush LSN (page 0 only)
pub const FIL_PAGE_SPACE_ID: usize = 34; // 4 bytes - space id

// The 8-byte flush-LSN slot is meaningful only on page 0. On all other
// pages the pipeline reuses it for crypt/compression bookkeeping:
pub const FIL_PAGE_KEY_VERSION: usize = 26; // 4 bytes - encryption key version (0 = clear)
pub const FIL_PAGE_ORIGINAL_TYPE: usize = 30; // 2 bytes - saved type of a page-compressed page
pub const FIL_PAGE_COMPRESS_ALGO: usize = 32; // 1 byte  - compression algorithm id

// FIL Trailer (8 bytes at page_size - 8)
pub const SIZE_FIL_TRAILER: usize = 8;

// Start of page data (immediately after FIL header)
pub const FIL_PAGE_DATA: usize = 38;

// FSP Header (112 bytes, starts at FIL_PAGE_DATA on page 0)
pub const FSP_HEADER_SIZE: usize = 112;
pub const FSP_SPACE_ID: usize = 0; // 4 bytes - space id
pub const FSP_NOT_USED: usize = 4; // 4 bytes - unused
pub const FSP_SIZE: usize = 8; // 4 bytes - tablespace size in pages
pub const FSP_FREE_LIMIT: usize = 12; // 4 bytes - minimum page not yet initialized
pub const FSP_SPACE_FLAGS: usize = 16; // 4 bytes - flags
pub const FSP_FRAG_N_USED: usize = 20; // 4 bytes - used pages in FSP_FREE_FRAG list

// FSP space flag layout.
//   bits 0-3   ROW_FORMAT=COMPRESSED zip ssize (0 = uncompressed)
//   bit  4     full-crc32 checksum format marker
//   bit  5     reserved (garbage on some exporters, cleared on import)
//   bits 6-9   logical page ssize
//   bit  16    page compression enabled
//   bits 17-19 page compression algorithm (1 = zlib, 2 = lz4)
pub const FSP_FLAGS_POS_ZIP_SSIZE: u32 = 0;
pub const FSP_FLAGS_MASK_ZIP_SSIZE: u32 = 0xF << FSP_FLAGS_POS_ZIP_SSIZE;
pub const FSP_FLAGS_FCRC32_MARKER: u32 = 1 << 4;
pub const FSP_FLAGS_RESERVED: u32 = 1 << 5;
pub const FSP_FLAGS_POS_PAGE_SSIZE: u32 = 6;
pub const FSP_FLAGS_MASK_PAGE_SSIZE: u32 = 0xF << FSP_FLAGS_POS_PAGE_SSIZE;
pub const FSP_FLAGS_PAGE_COMPRESSION: u32 = 1 << 16;
pub const FSP_FLAGS_POS_COMP_ALGO: u32 = 17;
pub const FSP_FLAGS_MASK_COMP_ALGO: u32 = 0x7 << FSP_FLAGS_POS_COMP_ALGO;

// Table (dictionary) flags as serialized in the .cfg file.
pub const DICT_TF_COMPACT: u32 = 1;
pub const DICT_TF_POS_ZIP_SSIZE: u32 = 1;
pub const DICT_TF_MASK_ZIP_SSIZE: u32 = 0xF << DICT_TF_POS_ZIP_SSIZE;
pub const DICT_TF_MASK_ATOMIC_BLOBS: u32 = 1 << 5;
pub const DICT_TF_MASK_DATA_DIR: u32 = 1 << 6;
pub const DICT_TF_MASK_VALID: u32 =
    DICT_TF_COMPACT | DICT_TF_MASK_ZIP_SSIZE | DICT_TF_MASK_ATOMIC_BLOBS | DICT_TF_MASK_DATA_DIR;

// Extent descriptors. One XDES page describes `physical page size` pages;
// the descriptor array starts right after the FSP header area.
pub const FSP_EXTENT_SIZE: u32 = 64;
pub const XDES_ARR_OFFSET: usize = FIL_PAGE_DATA + FSP_HEADER_SIZE;
pub const XDES_ID: usize = 0; // 8 bytes - segment id
pub const XDES_FLST_NODE: usize = 8; // 12 bytes - list node
pub const XDES_STATE: usize = 20; // 4 bytes - extent state
pub const XDES_BITMAP: usize = 24; // 16 bytes - 2 bits per page
pub const XDES_SIZE: usize = 40;
pub const XDES_BITS_PER_PAGE: u32 = 2;
pub const XDES_FREE_BIT: u32 = 0;
pub const XDES_STATE_FREE: u32 = 1;

// Change buffer bitmap: 4 bits per page, stored from FIL_PAGE_DATA on
// IBUF_BITMAP pages (page 1 of each descriptor group).
pub const IBUF_BITMAP: usize = FIL_PAGE_DATA;
pub const IBUF_BITS_PER_PAGE: u32 = 4;
pub const IBUF_BITMAP_FREE: u32 = 0; // 2 bits
pub const IBUF_BITMAP_BUFFERED: u32 = 2;
pub const IBUF_BITMAP_IBUF: u32 = 3;

// Page Header (INDEX page specific, offsets relative to FIL_PAGE_DATA)
pub const PAGE_N_DIR_SLOTS: usize = 0; // 2 bytes - number of directory slots
pub const PAGE_HEAP_TOP: usize = 2; // 2 bytes - pointer to record heap top
pub const PAGE_N_HEAP: usize = 4; // 2 bytes - records in heap (bit 15 = compact flag)
pub const PAGE_FREE: usize = 6; // 2 bytes - start of free record list
pub const PAGE_GARBAGE: usize = 8; // 2 bytes - bytes in deleted records
pub const PAGE_LAST_INSERT: usize = 10; // 2 bytes - last inserted record
pub const PAGE_DIRECTION: usize = 12; // 2 bytes - last insert direction
pub const PAGE_N_DIRECTION: usize = 14; // 2 bytes - consecutive inserts in same direction
pub const PAGE_N_RECS: usize = 16; // 2 bytes - number of user records
pub const PAGE_MAX_TRX_ID: usize = 18; // 8 bytes - max trx id (secondary leaf pages)
pub const PAGE_LEVEL: usize = 26; // 2 bytes - level in the B+tree (0 = leaf)
pub const PAGE_INDEX_ID: usize = 28; // 8 bytes - index id
pub const PAGE_BTR_SEG_LEAF: usize = 36; // 10 bytes - leaf segment header (root only)
pub const PAGE_BTR_SEG_TOP: usize = 46; // 10 bytes - non-leaf segment header (root only)
pub const PAGE_HEADER_SIZE: usize = 56;

// On root pages of tables with instantly added columns the otherwise unused
// PAGE_N_DIRECTION slot carries the core (pre-ALTER) field count.
pub const PAGE_INSTANT_FIELDS: usize = PAGE_N_DIRECTION;

// FSEG header layout (10 bytes)
pub const FSEG_HEADER_SIZE: usize = 10;
pub const FSEG_HDR_SPACE: usize = 0; // 4 bytes - space id of the inode
pub const FSEG_HDR_PAGE_NO: usize = 4; // 4 bytes - page number of the inode
pub const FSEG_HDR_OFFSET: usize = 8; // 2 bytes - byte offset of the inode

// Record extra bytes (compact format)
pub const REC_N_NEW_EXTRA_BYTES: usize = 5;

// System records: PAGE_DATA = PAGE_HEADER + 36 + 2 * FSEG_HEADER_SIZE = 94
pub const PAGE_DATA_OFFSET: usize = 94;
pub const PAGE_NEW_INFIMUM: usize = PAGE_DATA_OFFSET + REC_N_NEW_EXTRA_BYTES; // 99
pub const PAGE_NEW_SUPREMUM: usize = PAGE_DATA_OFFSET + 2 * REC_N_NEW_EXTRA_BYTES + 8; // 112
pub const PAGE_HEAP_NO_USER_LOW: u16 = 2; // heap numbers 0/1 are infimum/supremum

// Page directory: 2-byte slots growing downwards from the trailer.
pub const PAGE_DIR_SLOT_SIZE: usize = 2;
pub const PAGE_DIR_SLOT_MAX_N_OWNED: usize = 8;
pub const PAGE_DIR_SLOT_MIN_N_OWNED: usize = 4;

// Record header info bits (byte 0 of the 5-byte extra header)
pub const REC_INFO_MIN_REC_FLAG: u8 = 0x10;
pub const REC_INFO_DELETED_FLAG: u8 = 0x20;

// Node pointer records carry the child page number in their last 4 bytes.
pub const REC_NODE_PTR_SIZE: usize = 4;

// System column widths
pub const DATA_ROW_ID_LEN: usize = 6;
pub const DATA_TRX_ID_LEN: usize = 6;
pub const DATA_ROLL_PTR_LEN: usize = 7;

/// Reset value for DB_TRX_ID + DB_ROLL_PTR: trx id 0, roll pointer with only
/// the insert-flag bit set ("committed, no history").
pub const RESET_TRX_ID_ROLL_PTR: [u8; DATA_TRX_ID_LEN + DATA_ROLL_PTR_LEN] =
    [0, 0, 0, 0, 0, 0, 0x80, 0, 0, 0, 0, 0, 0];

// External (BLOB) field reference, stored at the end of the local prefix.
pub const BTR_EXTERN_FIELD_REF_SIZE: usize = 20;
pub const BTR_EXTERN_SPACE_ID: usize = 0; // 4 bytes
pub const BTR_EXTERN_PAGE_NO: usize = 4; // 4 bytes
pub const BTR_EXTERN_OFFSET: usize = 8; // 4 bytes
pub const BTR_EXTERN_LEN: usize = 12; // 8 bytes

// Column precise-type bits (subset used by the import pipeline)
pub const DATA_NOT_NULL: u32 = 256;

// Special page number values
pub const FIL_NULL: u32 = 0xFFFFFFFF;

// Checksum constants
pub const UT_HASH_RANDOM_MASK: u32 = 1463735687;
pub const UT_HASH_RANDOM_MASK2: u32 = 1653893711;
pub const BUF_NO_CHECKSUM_MAGIC: u32 = 0xDEADBEEF;

// Metadata (.cfg) file limits
pub const CFG_VERSION_V1: u32 = 1;
pub const CFG_MAX_INDEXES: u32 = 1024;
pub const CFG_MAX_COLS: u32 = 1024;
pub const CFG_MAX_FIELDS: u32 = 1024;
pub const CFG_MAX_COL_NAME_LEN: u32 = 128;
pub const CFG_MAX_NAME_LEN: u32 = 4000;

// Field encodings in the .cfg index records
pub const CFG_FIELD_PREFIX_MASK: u32 = 0xFFF; // low 12 bits
pub const CFG_FIELD_FIXED_MASK: u32 = 0x3FF; // low 10 bits

/// I/O batch size for tablespace iteration, in pages for the given
/// physical page size (1 MiB of pages per batch).
pub const fn io_batch_pages(physical_size: u32) -> u32 {
    (1024 * 1024) / physical_size
}
