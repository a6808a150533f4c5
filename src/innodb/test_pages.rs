//! Test-only builders for index pages and record layouts.
//!
//! Shared by the unit tests of the record, converter and purge modules so
//! they all agree on one fixture dialect: a clustered index with an 8-byte
//! key, the two system columns, and a 16-byte payload.

use byteorder::{BigEndian, ByteOrder};

use crate::innodb::constants::*;
use crate::innodb::record::{rebuild_directory, rec_set_next, FieldSpec, RecordLayout};

pub const PS: usize = SIZE_PAGE_DEFAULT as usize;

/// Clustered layout: key(8) + DB_TRX_ID + DB_ROLL_PTR + payload(16).
pub fn fixed_layout() -> RecordLayout {
    RecordLayout {
        fields: vec![
            FieldSpec { fixed_len: 8, nullable: false },
            FieldSpec { fixed_len: DATA_TRX_ID_LEN as u16, nullable: false },
            FieldSpec { fixed_len: DATA_ROLL_PTR_LEN as u16, nullable: false },
            FieldSpec { fixed_len: 16, nullable: false },
        ],
        n_uniq: 1,
        clustered: true,
    }
}

/// Clustered layout with a variable-length payload column.
pub fn var_layout() -> RecordLayout {
    RecordLayout {
        fields: vec![
            FieldSpec { fixed_len: 8, nullable: false },
            FieldSpec { fixed_len: DATA_TRX_ID_LEN as u16, nullable: false },
            FieldSpec { fixed_len: DATA_ROLL_PTR_LEN as u16, nullable: false },
            FieldSpec { fixed_len: 0, nullable: false },
        ],
        n_uniq: 1,
        clustered: true,
    }
}

/// Secondary layout: a single 8-byte key field.
pub fn sec_layout() -> RecordLayout {
    RecordLayout {
        fields: vec![FieldSpec { fixed_len: 8, nullable: false }],
        n_uniq: 1,
        clustered: false,
    }
}

/// Build an empty compact index page at the given level.
pub fn empty_index_page(page_no: u32, space_id: u32, index_id: u64, level: u16) -> Vec<u8> {
    let mut page = vec![0u8; PS];
    BigEndian::write_u32(&mut page[FIL_PAGE_OFFSET..], page_no);
    BigEndian::write_u32(&mut page[FIL_PAGE_PREV..], FIL_NULL);
    BigEndian::write_u32(&mut page[FIL_PAGE_NEXT..], FIL_NULL);
    BigEndian::write_u64(&mut page[FIL_PAGE_LSN..], 900);
    BigEndian::write_u16(&mut page[FIL_PAGE_TYPE..], 17855);
    BigEndian::write_u32(&mut page[FIL_PAGE_SPACE_ID..], space_id);

    let base = FIL_PAGE_DATA;
    BigEndian::write_u16(&mut page[base + PAGE_N_HEAP..], 0x8000 | 2);
    BigEndian::write_u16(&mut page[base + PAGE_HEAP_TOP..], (PAGE_NEW_SUPREMUM + 8) as u16);
    BigEndian::write_u16(&mut page[base + PAGE_LEVEL..], level);
    BigEndian::write_u64(&mut page[base + PAGE_INDEX_ID..], index_id);

    // Infimum: n_owned 1, heap_no 0, status infimum, next -> supremum.
    let inf_extra = PAGE_NEW_INFIMUM - REC_N_NEW_EXTRA_BYTES;
    page[inf_extra] = 0x01;
    BigEndian::write_u16(&mut page[inf_extra + 1..], 2); // heap 0, infimum
    page[PAGE_NEW_INFIMUM..PAGE_NEW_INFIMUM + 8].copy_from_slice(b"infimum\0");
    rec_set_next(&mut page, PAGE_NEW_INFIMUM, PAGE_NEW_SUPREMUM);

    // Supremum: n_owned 1, heap_no 1, status supremum, end of chain.
    let sup_extra = PAGE_NEW_SUPREMUM - REC_N_NEW_EXTRA_BYTES;
    page[sup_extra] = 0x01;
    BigEndian::write_u16(&mut page[sup_extra + 1..], (1 << 3) | 3);
    page[PAGE_NEW_SUPREMUM..PAGE_NEW_SUPREMUM + 8].copy_from_slice(b"supremum");
    rec_set_next(&mut page, PAGE_NEW_SUPREMUM, 0);

    rebuild_directory(&mut page, PS).unwrap();
    page
}

/// Build an empty compact leaf page.
pub fn empty_leaf_page(page_no: u32, space_id: u32, index_id: u64) -> Vec<u8> {
    empty_index_page(page_no, space_id, index_id, 0)
}

fn chain_tail(page: &[u8]) -> usize {
    let mut cur = PAGE_NEW_INFIMUM;
    loop {
        let next = crate::innodb::record::rec_next(page, cur).unwrap();
        if next == PAGE_NEW_SUPREMUM {
            return cur;
        }
        cur = next;
    }
}

fn append_raw(
    page: &mut Vec<u8>,
    extra_tail: &[u8],
    data: &[u8],
    rec_type: u8,
    deleted: bool,
) -> usize {
    let base = FIL_PAGE_DATA;
    let heap_top = BigEndian::read_u16(&page[base + PAGE_HEAP_TOP..]) as usize;
    let n_heap = BigEndian::read_u16(&page[base + PAGE_N_HEAP..]);
    let heap_no = n_heap & 0x7FFF;

    // extra layout: [var header / null bitmap][5-byte header][origin]
    let origin = heap_top + extra_tail.len() + REC_N_NEW_EXTRA_BYTES;
    page[heap_top..heap_top + extra_tail.len()].copy_from_slice(extra_tail);

    let hdr = origin - REC_N_NEW_EXTRA_BYTES;
    page[hdr] = if deleted { REC_INFO_DELETED_FLAG } else { 0 };
    BigEndian::write_u16(&mut page[hdr + 1..], (heap_no << 3) | rec_type as u16);

    page[origin..origin + data.len()].copy_from_slice(data);

    let tail = chain_tail(page);
    rec_set_next(page, tail, origin);
    rec_set_next(page, origin, PAGE_NEW_SUPREMUM);

    BigEndian::write_u16(&mut page[base + PAGE_N_HEAP..], 0x8000 | (heap_no + 1));
    BigEndian::write_u16(
        &mut page[base + PAGE_HEAP_TOP..],
        (origin + data.len()) as u16,
    );
    let n_recs = BigEndian::read_u16(&page[base + PAGE_N_RECS..]);
    BigEndian::write_u16(&mut page[base + PAGE_N_RECS..], n_recs + 1);

    rebuild_directory(page, PS).unwrap();
    origin
}

/// Append a fixed-layout clustered record; trx id and roll pointer carry
/// recognizable non-reset values.
pub fn append_record(page: &mut Vec<u8>, layout: &RecordLayout, key: u64, deleted: bool) -> usize {
    assert!(layout.clustered);
    let mut data = Vec::new();
    data.extend_from_slice(&key.to_be_bytes());
    data.extend_from_slice(&[0, 0, 0, 0, 0x13, 0x37]); // DB_TRX_ID
    data.extend_from_slice(&[0x01, 2, 3, 4, 5, 6, 7]); // DB_ROLL_PTR
    data.extend_from_slice(&[0xEE; 16]);
    append_raw(page, &[], &data, 0, deleted)
}

/// Append a variable-payload clustered record; the payload uses the
/// two-byte length form, optionally flagged as externally stored.
pub fn append_var_record(
    page: &mut Vec<u8>,
    layout: &RecordLayout,
    key: u64,
    payload: &[u8],
    external: bool,
) -> usize {
    assert!(layout.clustered);
    let len = payload.len();
    let extern_bit = if external { 0x40u8 } else { 0 };
    let b0 = 0x80u8 | extern_bit | ((len >> 8) as u8 & 0x3F);
    let b1 = (len & 0xFF) as u8;
    // read order is b0 first (closest to the header), then b1
    let extra_tail = [b1, b0];

    let mut data = Vec::new();
    data.extend_from_slice(&key.to_be_bytes());
    data.extend_from_slice(&[0, 0, 0, 0, 0x13, 0x37]);
    data.extend_from_slice(&[0x01, 2, 3, 4, 5, 6, 7]);
    data.extend_from_slice(payload);
    append_raw(page, &extra_tail, &data, 0, false)
}

/// Append a secondary-index record (key only).
pub fn append_sec_record(page: &mut Vec<u8>, key: u64, deleted: bool) -> usize {
    append_raw(page, &[], &key.to_be_bytes(), 0, deleted)
}

/// Append a node-pointer record: key + 4-byte child page number.
pub fn append_node_ptr(page: &mut Vec<u8>, key: u64, child: u32) -> usize {
    let mut data = Vec::new();
    data.extend_from_slice(&key.to_be_bytes());
    data.extend_from_slice(&child.to_be_bytes());
    append_raw(page, &[], &data, 1, false)
}
