//! Instant-ALTER metadata validation.
//!
//! A table that had columns added via instant ALTER TABLE marks the
//! clustered root page with the instant page type and stores the original
//! (core) field count in the otherwise unused PAGE_N_DIRECTION slot. The
//! serialized defaults for the added columns live in a hidden metadata
//! record at the head of the leftmost leaf: the first user record, flagged
//! both min-rec and delete-marked, optionally pointing at a BLOB-style
//! chain for large default values.
//!
//! None of this structure can be guessed at: any inconsistency between the
//! marker bits, the field counts and the pointer chain fails the import
//! closed with `Corruption` rather than importing a table whose hidden
//! defaults would be misread. Tables with instantly *dropped* columns are
//! refused outright.

use byteorder::{BigEndian, ByteOrder};

use crate::innodb::constants::*;
use crate::innodb::page::{page_is_leaf, IndexPageHeader};
use crate::innodb::page_types::PageType;
use crate::innodb::record::{
    node_ptr_child, rec_is_deleted, rec_is_min_rec, walk_records, RecordLayout,
};
use crate::innodb::tablespace::TablespaceFile;
use crate::ImportError;

/// Core (pre-ALTER) field count stored on an instant root page.
pub fn instant_core_fields(page: &[u8]) -> u32 {
    BigEndian::read_u16(&page[FIL_PAGE_DATA + PAGE_INSTANT_FIELDS..]) as u32
}

/// Validate the instant markers on a clustered root page.
///
/// The core field count must be nonzero and must not exceed the live field
/// count; a core count above it means columns were instantly dropped,
/// which cannot be imported.
pub fn validate_instant_root(page: &[u8], n_fields: u32) -> Result<(), ImportError> {
    let core = instant_core_fields(page);
    if core == 0 {
        return Err(ImportError::Corruption(
            "instant root page carries a zero core field count".into(),
        ));
    }
    if core > n_fields {
        return Err(ImportError::Corruption(format!(
            "clustered index has {} core fields but only {} fields; tables with \
             instantly dropped columns cannot be imported",
            core, n_fields
        )));
    }
    Ok(())
}

/// Resolve and validate the instant-ALTER metadata of the clustered index
/// before the conversion pass touches any page.
///
/// Descends from the clustered root to the leftmost leaf reading raw
/// (exporter-stamped) pages, then checks the hidden metadata record for
/// structural self-consistency. A root without the instant page type
/// returns immediately.
pub fn resolve_instant_metadata(
    ts: &mut TablespaceFile,
    codec: &mut crate::innodb::codec::PageCodec,
    root_page_no: u32,
    layout: &RecordLayout,
    n_fields: u32,
) -> Result<(), ImportError> {
    let mut page = ts.read_logical_page(codec, root_page_no)?;

    let page_type = PageType::from_u16(BigEndian::read_u16(&page[FIL_PAGE_TYPE..]));
    if page_type != PageType::Instant {
        return Ok(());
    }

    validate_instant_root(&page, n_fields)?;
    let core = instant_core_fields(&page);

    // Walk down the leftmost edge of the tree.
    let mut page_no = root_page_no;
    let mut hops = 0u32;
    while !page_is_leaf(&page) {
        hops += 1;
        if hops > 64 {
            return Err(ImportError::Corruption(
                "clustered index deeper than 64 levels".into(),
            ));
        }

        let records = walk_records(&page)?;
        let first = *records.first().ok_or_else(|| {
            ImportError::Corruption(format!(
                "non-leaf page {} of the clustered index is empty",
                page_no
            ))
        })?;
        let rec = layout.parse_node_ptr(&page, first)?;
        let child = node_ptr_child(&page, &rec);
        if child == FIL_NULL || child as u64 >= ts.page_count() {
            return Err(ImportError::Corruption(format!(
                "node pointer on page {} references invalid child page {}",
                page_no, child
            )));
        }
        page_no = child;
        page = ts.read_logical_page(codec, page_no)?;
    }

    let records = walk_records(&page)?;
    let metadata = records
        .first()
        .copied()
        .filter(|&origin| rec_is_min_rec(&page, origin));

    let origin = match metadata {
        Some(origin) => origin,
        None => {
            if core < n_fields {
                // The root promises instantly added columns; their
                // defaults must exist.
                return Err(ImportError::Corruption(
                    "instant root page without a metadata record".into(),
                ));
            }
            return Ok(());
        }
    };

    // The metadata record must carry both marker bits.
    if !rec_is_deleted(&page, origin) {
        return Err(ImportError::Corruption(
            "metadata record is not delete-marked".into(),
        ));
    }

    // Validate the BLOB-style pointer chain of the serialized defaults.
    let rec = layout.parse_leaf(&page, origin)?;
    for field in &rec.fields {
        if !field.external {
            continue;
        }
        if field.len < BTR_EXTERN_FIELD_REF_SIZE {
            return Err(ImportError::Corruption(format!(
                "metadata record external reference is only {} bytes",
                field.len
            )));
        }
        let ref_start = field.offset + field.len - BTR_EXTERN_FIELD_REF_SIZE;
        let ext_page = BigEndian::read_u32(&page[ref_start + BTR_EXTERN_PAGE_NO..]);
        let ext_len = BigEndian::read_u64(&page[ref_start + BTR_EXTERN_LEN..]);
        if ext_page == 0 || ext_page == FIL_NULL || ext_page as u64 >= ts.page_count() {
            return Err(ImportError::Corruption(format!(
                "metadata record references invalid BLOB page {}",
                ext_page
            )));
        }
        if ext_len == 0 {
            return Err(ImportError::Corruption(
                "metadata record references a zero-length BLOB chain".into(),
            ));
        }
    }

    let hdr = IndexPageHeader::parse(&page).ok_or_else(|| {
        ImportError::Corruption("leftmost leaf has no index header".into())
    })?;
    log::info!(
        "Resolved instant metadata: {} core fields, metadata record on page {} \
         ({} records on the leaf)",
        core,
        page_no,
        hdr.n_recs
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::innodb::checksum::{recalculate_checksum, ChecksumAlgorithm};
    use crate::innodb::codec::PageCodec;
    use crate::innodb::tablespace::build_fsp_page;
    use crate::innodb::test_pages;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const PS: u32 = SIZE_PAGE_DEFAULT;

    #[test]
    fn test_validate_instant_root_bounds() {
        let mut page = test_pages::empty_leaf_page(3, 1, 500);

        BigEndian::write_u16(&mut page[FIL_PAGE_DATA + PAGE_INSTANT_FIELDS..], 0);
        assert!(validate_instant_root(&page, 4).is_err());

        BigEndian::write_u16(&mut page[FIL_PAGE_DATA + PAGE_INSTANT_FIELDS..], 3);
        validate_instant_root(&page, 4).unwrap();

        // more core fields than live fields: instantly dropped columns
        BigEndian::write_u16(&mut page[FIL_PAGE_DATA + PAGE_INSTANT_FIELDS..], 5);
        let err = validate_instant_root(&page, 4).unwrap_err();
        assert!(err.to_string().contains("dropped"));
    }

    fn instant_fixture(core_fields: u16, with_metadata_record: bool) -> NamedTempFile {
        let layout = test_pages::fixed_layout();
        let mut root = test_pages::empty_leaf_page(1, 9, 700);

        if with_metadata_record {
            let origin = test_pages::append_record(&mut root, &layout, 0, true);
            // metadata pseudo-record carries the min-rec marker too
            root[origin - REC_N_NEW_EXTRA_BYTES] |= REC_INFO_MIN_REC_FLAG;
        }
        test_pages::append_record(&mut root, &layout, 10, false);

        BigEndian::write_u16(&mut root[FIL_PAGE_TYPE..], PageType::Instant.to_u16());
        BigEndian::write_u16(
            &mut root[FIL_PAGE_DATA + PAGE_INSTANT_FIELDS..],
            core_fields,
        );
        recalculate_checksum(&mut root, PS, ChecksumAlgorithm::Crc32c);

        let mut tmp = NamedTempFile::new().unwrap();
        let flags = 5 << FSP_FLAGS_POS_PAGE_SSIZE;
        tmp.write_all(&build_fsp_page(9, 2, flags, 100, PS)).unwrap();
        tmp.write_all(&root).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    #[test]
    fn test_resolve_accepts_consistent_metadata() {
        let tmp = instant_fixture(3, true);
        let mut ts = crate::innodb::tablespace::TablespaceFile::open_rw(tmp.path(), PS).unwrap();
        let mut codec = PageCodec::new(9, ts.space_flags(), PS as usize, None);
        let layout = test_pages::fixed_layout();

        resolve_instant_metadata(&mut ts, &mut codec, 1, &layout, 4).unwrap();
    }

    #[test]
    fn test_resolve_fails_closed_without_metadata_record() {
        // the root promises instantly added columns (core 3 < 4 fields)
        // but no metadata record exists
        let tmp = instant_fixture(3, false);
        let mut ts = crate::innodb::tablespace::TablespaceFile::open_rw(tmp.path(), PS).unwrap();
        let mut codec = PageCodec::new(9, ts.space_flags(), PS as usize, None);
        let layout = test_pages::fixed_layout();

        let err = resolve_instant_metadata(&mut ts, &mut codec, 1, &layout, 4).unwrap_err();
        assert!(matches!(err, ImportError::Corruption(_)));
    }

    #[test]
    fn test_resolve_ignores_plain_roots() {
        let tmp = instant_fixture(3, false);
        let mut ts = crate::innodb::tablespace::TablespaceFile::open_rw(tmp.path(), PS).unwrap();
        let mut codec = PageCodec::new(9, ts.space_flags(), PS as usize, None);
        let layout = test_pages::fixed_layout();

        // rewrite the root back to a plain INDEX page
        let mut root = ts.read_page(1).unwrap();
        BigEndian::write_u16(&mut root[FIL_PAGE_TYPE..], 17855);
        recalculate_checksum(&mut root, PS, ChecksumAlgorithm::Crc32c);
        ts.write_page(1, &root).unwrap();

        resolve_instant_metadata(&mut ts, &mut codec, 1, &layout, 4).unwrap();
    }
}
