//! Compact (new-style) record format: parsing, layout and in-page deletion.
//!
//! Each record is preceded by a 5-byte extra header carrying the info bits
//! (delete mark, min-rec flag), the owned-record count, the heap number and
//! record type, and a relative next-record pointer. Records form a singly
//! linked chain from the infimum system record to the supremum.
//!
//! Field boundaries are not self-describing: a [`RecordLayout`] built from
//! the index and column descriptors resolves per-field offsets and lengths,
//! including the backwards-growing null bitmap and variable-length header
//! (whose two-byte form carries the external-storage bit). All positions are
//! produced as validated offsets into the page buffer.
//!
//! Deleting a record unlinks it from the chain, pushes it onto the page free
//! list, adjusts the garbage and record counters, and rebuilds the sparse
//! page directory from the surviving chain.

use byteorder::{BigEndian, ByteOrder};

use crate::innodb::constants::*;
use crate::ImportError;

/// Record type extracted from the 3 status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Ordinary user record (leaf page).
    Ordinary,
    /// Node pointer record (non-leaf page).
    NodePtr,
    /// Infimum system record.
    Infimum,
    /// Supremum system record.
    Supremum,
}

impl RecordType {
    /// Convert the low 3 bits of the status field.
    pub fn from_u8(val: u8) -> Self {
        match val & 0x07 {
            1 => RecordType::NodePtr,
            2 => RecordType::Infimum,
            3 => RecordType::Supremum,
            _ => RecordType::Ordinary,
        }
    }
}

/// Parsed compact record header (the 5 bytes preceding the record origin).
#[derive(Debug, Clone)]
pub struct CompactRecordHeader {
    /// Number of records owned in the page directory (0 if not an owner).
    pub n_owned: u8,
    /// Delete-mark flag.
    pub delete_mark: bool,
    /// Min-rec flag (leftmost record on a non-leaf level, or the hidden
    /// metadata record of an instant-ALTER table).
    pub min_rec: bool,
    /// Position in the record heap.
    pub heap_no: u16,
    /// Record type.
    pub rec_type: RecordType,
    /// Relative offset to the next record (two's complement).
    pub next_offset: i16,
}

impl CompactRecordHeader {
    /// Parse from the 5-byte extra header.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < REC_N_NEW_EXTRA_BYTES {
            return None;
        }

        let byte0 = data[0];
        let two = BigEndian::read_u16(&data[1..3]);

        Some(CompactRecordHeader {
            n_owned: byte0 & 0x0F,
            delete_mark: byte0 & REC_INFO_DELETED_FLAG != 0,
            min_rec: byte0 & REC_INFO_MIN_REC_FLAG != 0,
            heap_no: (two >> 3) & 0x1FFF,
            rec_type: RecordType::from_u8((two & 0x07) as u8),
            next_offset: BigEndian::read_i16(&data[3..5]),
        })
    }
}

/// Read the header of the record whose origin is at `origin`.
pub fn rec_header(page: &[u8], origin: usize) -> Option<CompactRecordHeader> {
    if origin < REC_N_NEW_EXTRA_BYTES || origin > page.len() {
        return None;
    }
    CompactRecordHeader::parse(&page[origin - REC_N_NEW_EXTRA_BYTES..])
}

/// Delete-mark flag of the record at `origin`.
pub fn rec_is_deleted(page: &[u8], origin: usize) -> bool {
    page[origin - REC_N_NEW_EXTRA_BYTES] & REC_INFO_DELETED_FLAG != 0
}

/// Min-rec flag of the record at `origin`.
pub fn rec_is_min_rec(page: &[u8], origin: usize) -> bool {
    page[origin - REC_N_NEW_EXTRA_BYTES] & REC_INFO_MIN_REC_FLAG != 0
}

/// Absolute origin of the record following `origin`, or None at end of chain.
pub fn rec_next(page: &[u8], origin: usize) -> Option<usize> {
    let hdr = rec_header(page, origin)?;
    if hdr.next_offset == 0 {
        return None;
    }
    let next = origin as i32 + hdr.next_offset as i32;
    if next < REC_N_NEW_EXTRA_BYTES as i32 || next as usize >= page.len() {
        return None;
    }
    Some(next as usize)
}

/// Point the next-pointer of the record at `origin` to `next_abs`
/// (0 terminates the chain).
pub fn rec_set_next(page: &mut [u8], origin: usize, next_abs: usize) {
    let rel = if next_abs == 0 {
        0i16
    } else {
        (next_abs as i32 - origin as i32) as i16
    };
    BigEndian::write_i16(&mut page[origin - 2..], rel);
}

/// Set or clear the owned-record count of the record at `origin`.
pub fn rec_set_n_owned(page: &mut [u8], origin: usize, n_owned: u8) {
    let b = origin - REC_N_NEW_EXTRA_BYTES;
    page[b] = (page[b] & 0xF0) | (n_owned & 0x0F);
}

/// Walk the record chain from infimum, returning user-record origins in
/// order. Fails with `Corruption` on a cycle or an out-of-bounds link.
pub fn walk_records(page: &[u8]) -> Result<Vec<usize>, ImportError> {
    let mut origins = Vec::new();

    if page.len() < PAGE_NEW_SUPREMUM + REC_N_NEW_EXTRA_BYTES {
        return Err(ImportError::Corruption(
            "page too short for system records".into(),
        ));
    }

    let mut current = PAGE_NEW_INFIMUM;
    let max_iter = page.len() / REC_N_NEW_EXTRA_BYTES;

    for _ in 0..max_iter {
        let next = match rec_next(page, current) {
            Some(n) => n,
            None => {
                return Err(ImportError::Corruption(format!(
                    "record chain broken at offset {}",
                    current
                )))
            }
        };

        let hdr = rec_header(page, next).ok_or_else(|| {
            ImportError::Corruption(format!("bad record header at offset {}", next))
        })?;

        match hdr.rec_type {
            RecordType::Supremum => return Ok(origins),
            RecordType::Infimum => {
                return Err(ImportError::Corruption(
                    "record chain loops back to infimum".into(),
                ))
            }
            _ => origins.push(next),
        }
        current = next;
    }

    Err(ImportError::Corruption("record chain does not terminate".into()))
}

/// Shape of one index field for layout resolution.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Fixed byte length, or 0 for variable-length fields.
    pub fixed_len: u16,
    /// Whether the field can be NULL (consumes a null-bitmap bit).
    pub nullable: bool,
}

/// One resolved field of a parsed record.
#[derive(Debug, Clone)]
pub struct RecField {
    /// Absolute offset of the field data within the page.
    pub offset: usize,
    /// Stored (local) length in bytes; includes the 20-byte reference for
    /// externally stored columns.
    pub len: usize,
    /// The field is stored externally (BLOB pointer at the end).
    pub external: bool,
    /// The field is SQL NULL (no stored data).
    pub is_null: bool,
}

/// A parsed record: resolved extra size, data size and field positions.
#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub origin: usize,
    /// Bytes before the origin: 5-byte header + null bitmap + var-len header.
    pub extra_size: usize,
    /// Bytes of field data from the origin.
    pub data_size: usize,
    pub fields: Vec<RecField>,
}

impl ParsedRecord {
    /// Total stored footprint of the record.
    pub fn total_size(&self) -> usize {
        self.extra_size + self.data_size
    }

    /// True if any field is stored externally.
    pub fn has_external(&self) -> bool {
        self.fields.iter().any(|f| f.external)
    }
}

/// Field layout of one index's records, built from the descriptors.
#[derive(Debug, Clone)]
pub struct RecordLayout {
    /// All fields in stored order. For clustered indexes this includes
    /// DB_TRX_ID and DB_ROLL_PTR at positions `n_uniq` and `n_uniq + 1`.
    pub fields: Vec<FieldSpec>,
    /// Number of fields that uniquely identify a record.
    pub n_uniq: usize,
    /// Clustered index records carry the system columns.
    pub clustered: bool,
}

impl RecordLayout {
    /// Position of DB_TRX_ID in the field list, if this is a clustered index.
    pub fn trx_id_pos(&self) -> Option<usize> {
        if self.clustered {
            Some(if self.n_uniq > 0 { self.n_uniq } else { 1 })
        } else {
            None
        }
    }

    /// Resolve the fields of a leaf record at `origin`.
    pub fn parse_leaf(&self, page: &[u8], origin: usize) -> Result<ParsedRecord, ImportError> {
        self.parse(page, origin, self.fields.len(), false)
    }

    /// Resolve the fields of a node-pointer record at `origin`: the first
    /// `n_uniq` key fields followed by the 4-byte child page number.
    pub fn parse_node_ptr(&self, page: &[u8], origin: usize) -> Result<ParsedRecord, ImportError> {
        self.parse(page, origin, self.n_uniq, true)
    }

    fn parse(
        &self,
        page: &[u8],
        origin: usize,
        n_fields: usize,
        node_ptr: bool,
    ) -> Result<ParsedRecord, ImportError> {
        if origin < REC_N_NEW_EXTRA_BYTES || origin >= page.len() {
            return Err(ImportError::Corruption(format!(
                "record origin {} out of bounds",
                origin
            )));
        }

        let specs = &self.fields[..n_fields.min(self.fields.len())];
        let n_nullable = specs.iter().filter(|f| f.nullable).count();
        let bitmap_len = n_nullable.div_ceil(8);

        let bitmap_end = origin - REC_N_NEW_EXTRA_BYTES;
        if bitmap_end < bitmap_len {
            return Err(ImportError::Corruption(
                "null bitmap overruns page start".into(),
            ));
        }
        let bitmap_start = bitmap_end - bitmap_len;

        // The variable-length header grows backwards from the null bitmap.
        let mut var_pos = bitmap_start;
        let mut null_bit = 0usize;
        let mut fields = Vec::with_capacity(n_fields);
        let mut data_off = origin;

        for spec in specs {
            let mut is_null = false;
            if spec.nullable {
                let byte = page[bitmap_start + null_bit / 8];
                is_null = byte & (1 << (null_bit % 8)) != 0;
                null_bit += 1;
            }

            if is_null {
                fields.push(RecField {
                    offset: data_off,
                    len: 0,
                    external: false,
                    is_null: true,
                });
                continue;
            }

            let (len, external) = if spec.fixed_len > 0 {
                (spec.fixed_len as usize, false)
            } else {
                if var_pos == 0 {
                    return Err(ImportError::Corruption(
                        "variable-length header overruns page start".into(),
                    ));
                }
                var_pos -= 1;
                let b0 = page[var_pos];
                if b0 & 0x80 != 0 {
                    if var_pos == 0 {
                        return Err(ImportError::Corruption(
                            "variable-length header overruns page start".into(),
                        ));
                    }
                    var_pos -= 1;
                    let b1 = page[var_pos];
                    let len = (((b0 & 0x3F) as usize) << 8) | b1 as usize;
                    (len, b0 & 0x40 != 0)
                } else {
                    (b0 as usize, false)
                }
            };

            if data_off + len > page.len() {
                return Err(ImportError::Corruption(format!(
                    "record field at offset {} overruns the page",
                    data_off
                )));
            }

            fields.push(RecField {
                offset: data_off,
                len,
                external,
                is_null: false,
            });
            data_off += len;
        }

        if node_ptr {
            if data_off + REC_NODE_PTR_SIZE > page.len() {
                return Err(ImportError::Corruption(
                    "node pointer overruns the page".into(),
                ));
            }
            data_off += REC_NODE_PTR_SIZE;
        }

        Ok(ParsedRecord {
            origin,
            extra_size: REC_N_NEW_EXTRA_BYTES + bitmap_len + (bitmap_start - var_pos),
            data_size: data_off - origin,
            fields,
        })
    }
}

/// Child page number of a parsed node-pointer record (its last 4 bytes).
pub fn node_ptr_child(page: &[u8], rec: &ParsedRecord) -> u32 {
    let end = rec.origin + rec.data_size;
    BigEndian::read_u32(&page[end - REC_NODE_PTR_SIZE..])
}

/// Remove the record at `origin` from the page.
///
/// The record is unlinked from the chain, pushed onto the PAGE_FREE list,
/// counted into PAGE_GARBAGE, and the page directory is rebuilt from the
/// surviving chain. The caller supplies the parsed record for its size.
pub fn delete_record(
    page: &mut [u8],
    page_size: usize,
    origin: usize,
    rec: &ParsedRecord,
) -> Result<(), ImportError> {
    let base = FIL_PAGE_DATA;

    // Find the predecessor in the chain.
    let mut pred = PAGE_NEW_INFIMUM;
    loop {
        let next = rec_next(page, pred).ok_or_else(|| {
            ImportError::Corruption(format!("record {} not found in page chain", origin))
        })?;
        if next == origin {
            break;
        }
        if next == PAGE_NEW_SUPREMUM {
            return Err(ImportError::Corruption(format!(
                "record {} not found in page chain",
                origin
            )));
        }
        pred = next;
    }

    let next_abs = rec_next(page, origin).ok_or_else(|| {
        ImportError::Corruption("deleted record has no successor".into())
    })?;

    // Unlink and push onto the free list.
    rec_set_next(page, pred, next_abs);
    let old_free = BigEndian::read_u16(&page[base + PAGE_FREE..]) as usize;
    rec_set_next(page, origin, old_free);
    BigEndian::write_u16(&mut page[base + PAGE_FREE..], origin as u16);

    let garbage = BigEndian::read_u16(&page[base + PAGE_GARBAGE..]);
    BigEndian::write_u16(
        &mut page[base + PAGE_GARBAGE..],
        garbage.wrapping_add(rec.total_size() as u16),
    );

    let n_recs = BigEndian::read_u16(&page[base + PAGE_N_RECS..]);
    if n_recs == 0 {
        return Err(ImportError::Corruption(
            "record count underflow on delete".into(),
        ));
    }
    BigEndian::write_u16(&mut page[base + PAGE_N_RECS..], n_recs - 1);
    BigEndian::write_u16(&mut page[base + PAGE_LAST_INSERT..], 0);

    rebuild_directory(page, page_size)
}

/// Rebuild the sparse page directory from the record chain.
///
/// Slot 0 owns infimum alone; user records are grouped into runs of at most
/// `PAGE_DIR_SLOT_MAX_N_OWNED - 1`; the final slot is supremum owning the
/// remaining tail plus itself.
pub fn rebuild_directory(page: &mut [u8], page_size: usize) -> Result<(), ImportError> {
    let records = walk_records(page)?;

    for &origin in &records {
        rec_set_n_owned(page, origin, 0);
    }
    rec_set_n_owned(page, PAGE_NEW_INFIMUM, 1);

    let mut slots: Vec<usize> = vec![PAGE_NEW_INFIMUM];
    let mut owned = 0u8;
    for &origin in &records {
        owned += 1;
        if owned as usize == PAGE_DIR_SLOT_MAX_N_OWNED - 1 {
            rec_set_n_owned(page, origin, owned);
            slots.push(origin);
            owned = 0;
        }
    }
    rec_set_n_owned(page, PAGE_NEW_SUPREMUM, owned + 1);
    slots.push(PAGE_NEW_SUPREMUM);

    let dir_top = page_size - SIZE_FIL_TRAILER;
    if slots.len() * PAGE_DIR_SLOT_SIZE > dir_top {
        return Err(ImportError::Corruption("page directory overflow".into()));
    }
    for (i, &origin) in slots.iter().enumerate() {
        let at = dir_top - (i + 1) * PAGE_DIR_SLOT_SIZE;
        BigEndian::write_u16(&mut page[at..], origin as u16);
    }
    BigEndian::write_u16(
        &mut page[FIL_PAGE_DATA + PAGE_N_DIR_SLOTS..],
        slots.len() as u16,
    );

    Ok(())
}
