//! The per-page conversion pass and the root-discovery pass.
//!
//! [`PageConverter`] re-homes every page of an imported tablespace into the
//! destination server, keyed on the page type:
//!
//! - the header page gets its redundant space-id stamps rewritten, its
//!   stale flush-LSN/key-version slot cleared and its flags normalized;
//! - B+Tree pages get the owning index resolved from their embedded index
//!   id (unknown ids are tolerated as remnants of dropped indexes), the
//!   index id rewritten to the destination's, PAGE_MAX_TRX_ID set on
//!   secondary leaf pages and cleared everywhere else, and root pages get
//!   both B+Tree segment headers restamped;
//! - leaf records of the clustered index have DB_TRX_ID/DB_ROLL_PTR reset
//!   to the committed-no-history sentinel and their external (BLOB)
//!   references re-stamped with the destination space id;
//! - delete-marked records are removed in place when that needs no tree
//!   restructuring, otherwise counted for the later purge pass;
//! - every other known page type only gets the space-id stamp;
//! - an unrecognized page type is corruption, because guessing is unsafe.
//!
//! After each rewrite the page checksum and trailer are recomputed for the
//! space's checksum format.
//!
//! [`RootPageFetcher`] is the metadata-absent discovery pass: it collects
//! pages whose sibling links are both nil (candidate index roots) and
//! validates the tablespace flags against the table definition on the
//! first candidate.

use std::collections::HashSet;

use crate::innodb::catalog::Interrupt;
use crate::innodb::checksum::{recalculate_checksum, ChecksumAlgorithm};
use crate::innodb::constants::*;
use crate::innodb::instant;
use crate::innodb::iterator::XdesCache;
use crate::innodb::metadata::{ImportDescriptor, IndexDescriptor, IndexStats};
use crate::innodb::page::{
    self, full_crc32, fsp_flags_match, page_get_index_id, page_get_page_no, page_is_empty,
    page_is_leaf, page_is_root, page_set_fseg_space, page_set_index_id, page_set_max_trx_id,
    page_set_space_id, table_flags_to_fsp_flags, FspHeader,
};
use crate::innodb::page_types::PageType;
use crate::innodb::record::{
    self, rec_is_deleted, rec_is_min_rec, rec_next, RecordLayout,
};
use crate::innodb::schema::TableDef;
use crate::ImportError;

use byteorder::{BigEndian, ByteOrder};

/// Discovery pass for tablespaces without a metadata file: find the index
/// root pages by looking for B+Tree pages with both sibling links nil.
pub struct RootPageFetcher<'a> {
    table: &'a TableDef,
    space_flags: u32,
    space_id: u32,
    candidates: Vec<(u64, u32)>,
    interrupt: Interrupt,
}

impl<'a> RootPageFetcher<'a> {
    pub fn new(table: &'a TableDef, space_id: u32, space_flags: u32, interrupt: Interrupt) -> Self {
        RootPageFetcher {
            table,
            space_flags,
            space_id,
            candidates: Vec::new(),
            interrupt,
        }
    }

    pub(crate) fn visit(
        &mut self,
        page_no: u32,
        page: &mut [u8],
        xdes: &XdesCache,
    ) -> Result<bool, ImportError> {
        if self.interrupt.is_interrupted() {
            return Err(ImportError::Interrupted);
        }

        let page_type =
            PageType::from_u16(BigEndian::read_u16(&page[FIL_PAGE_TYPE..]));

        if page_type.is_index() && !xdes.is_free(page_no) && page_is_root(page) {
            let id = page_get_index_id(page);
            self.candidates.push((id, page_no));

            if self.candidates.len() == 1 {
                // Cross-check the tablespace flags against the table
                // definition while we hold the first B+Tree page.
                let expected = table_flags_to_fsp_flags(self.table.flags);
                if !fsp_flags_match(expected, self.space_flags) {
                    log::error!(
                        "Expected FSP_SPACE_FLAGS=0x{:x}, .ibd file contains 0x{:x}",
                        expected,
                        self.space_flags
                    );
                    return Err(ImportError::Corruption(format!(
                        "tablespace flags 0x{:x} do not match the table definition",
                        self.space_flags
                    )));
                }
            }
        }

        Ok(false)
    }

    /// Build a synthesized descriptor from the discovered roots.
    pub fn build_descriptor(&self, srv_page_size: u32) -> Result<ImportDescriptor, ImportError> {
        if self.candidates.is_empty() {
            log::error!("No B+Tree found in tablespace");
            return Err(ImportError::Corruption(
                "no B+Tree found in tablespace".into(),
            ));
        }

        let indexes = self
            .candidates
            .iter()
            .map(|&(id, page_no)| IndexDescriptor {
                id,
                space: self.space_id,
                page_no,
                type_bits: 0,
                trx_id_offset: 0,
                n_user_defined: 0,
                n_uniq: 0,
                n_nullable: 0,
                n_fields: 0,
                name: format!("index_{}", id),
                fields: Vec::new(),
                srv_index: None,
                stats: IndexStats::default(),
            })
            .collect();

        Ok(ImportDescriptor {
            version: CFG_VERSION_V1,
            hostname: String::new(),
            table_name: self.table.name.clone(),
            autoinc: 0,
            page_size: srv_page_size,
            flags: self.table.flags,
            columns: Vec::new(),
            indexes,
            missing: true,
        })
    }
}

/// The conversion pass over one tablespace.
pub struct PageConverter<'a> {
    cfg: &'a mut ImportDescriptor,
    table: &'a TableDef,
    /// Destination space id.
    space_id: u32,
    /// Normalized space flags to write into the header page.
    space_flags: u32,
    /// Importing transaction id, stamped into secondary leaf pages.
    trx_id: u64,
    logical_size: u32,
    checksum: ChecksumAlgorithm,
    /// Record layouts parallel to `cfg.indexes`.
    layouts: Vec<Option<RecordLayout>>,
    /// Ordinal of the index whose pages we are currently walking.
    current: usize,
    /// Index ids seen on pages but known to no resolved index.
    unknown_ids: HashSet<u64>,
    /// Pages skipped because their index id resolved to nothing.
    pub n_skipped_unknown: u64,
    interrupt: Interrupt,
}

impl<'a> PageConverter<'a> {
    pub fn new(
        cfg: &'a mut ImportDescriptor,
        table: &'a TableDef,
        space_id: u32,
        space_flags: u32,
        trx_id: u64,
        logical_size: u32,
        interrupt: Interrupt,
    ) -> Self {
        let layouts = cfg
            .indexes
            .iter()
            .map(|index| {
                if cfg.missing {
                    // No metadata: lean on the live definition instead.
                    index
                        .srv_index
                        .map(|ord| table.record_layout(&table.indexes[ord]))
                } else {
                    Some(cfg.record_layout(index))
                }
            })
            .collect();

        let checksum = if full_crc32(space_flags) {
            ChecksumAlgorithm::FullCrc32
        } else {
            ChecksumAlgorithm::Crc32c
        };

        PageConverter {
            cfg,
            table,
            space_id,
            space_flags,
            trx_id,
            logical_size,
            checksum,
            layouts,
            current: 0,
            unknown_ids: HashSet::new(),
            n_skipped_unknown: 0,
            interrupt,
        }
    }

    pub(crate) fn visit(
        &mut self,
        page_no: u32,
        page: &mut [u8],
        xdes: &XdesCache,
    ) -> Result<bool, ImportError> {
        if self.interrupt.is_interrupted() {
            return Err(ImportError::Interrupted);
        }

        let page_type = PageType::from_u16(BigEndian::read_u16(&page[FIL_PAGE_TYPE..]));

        match page_type {
            PageType::FspHdr => {
                self.update_header(page)?;
            }
            PageType::Index | PageType::Rtree | PageType::Instant => {
                page_set_space_id(page, self.space_id);
                self.update_index_page(page_no, page, page_type, xdes)?;
            }
            PageType::Sys => {
                // Page 0 of the system tablespace has no business here.
                return Err(ImportError::Corruption(format!(
                    "page {} is a system page; this is not a user tablespace",
                    page_no
                )));
            }
            PageType::Allocated
            | PageType::UndoLog
            | PageType::Inode
            | PageType::IbufFreeList
            | PageType::IbufBitmap
            | PageType::TrxSys
            | PageType::Xdes
            | PageType::Blob
            | PageType::ZBlob
            | PageType::ZBlob2 => {
                // Only the space-id stamp; no structural inspection.
                page_set_space_id(page, self.space_id);
            }
            PageType::PageCompressed | PageType::PageCompressedEncrypted => {
                // The codec unwraps these before we ever see them.
                return Err(ImportError::Corruption(format!(
                    "page {} still carries a page-compressed wrapper",
                    page_no
                )));
            }
            PageType::Other(code) => {
                log::warn!("Unknown page type ({}) on page {}", code, page_no);
                return Err(ImportError::Corruption(format!(
                    "unknown page type {} on page {}",
                    code, page_no
                )));
            }
        }

        recalculate_checksum(page, self.logical_size, self.checksum);
        Ok(true)
    }

    /// Rewrite the tablespace header page.
    fn update_header(&mut self, page: &mut [u8]) -> Result<(), ImportError> {
        let fsp = FspHeader::parse(page).ok_or_else(|| {
            ImportError::Corruption("header page has no FSP header".into())
        })?;

        if fsp.space_id == 0 {
            return Err(ImportError::Corruption(
                "header page carries space id 0".into(),
            ));
        }
        let fil_space = BigEndian::read_u32(&page[FIL_PAGE_SPACE_ID..]);
        if fil_space != fsp.space_id {
            log::warn!(
                "Space id check in the header failed ({} vs {}): ignored",
                fil_space,
                fsp.space_id
            );
        }

        // Clear the stale flush-LSN / key-version slot.
        BigEndian::write_u64(&mut page[FIL_PAGE_FILE_FLUSH_LSN..], 0);

        // Write back the normalized flags and the new space id, in both
        // redundant locations.
        BigEndian::write_u32(
            &mut page[FIL_PAGE_DATA + FSP_SPACE_FLAGS..],
            self.space_flags,
        );
        BigEndian::write_u32(&mut page[FIL_PAGE_DATA + FSP_SPACE_ID..], self.space_id);
        page_set_space_id(page, self.space_id);

        Ok(())
    }

    /// Resolve the owning index of a B+Tree page. Updates `self.current`
    /// on success; `Ok(None)` means the page should be skipped.
    fn resolve_index(&mut self, page_no: u32, page: &[u8]) -> Result<Option<usize>, ImportError> {
        let id = page_get_index_id(page);

        if self
            .cfg
            .indexes
            .get(self.current)
            .is_some_and(|i| i.id == id)
        {
            return Ok(Some(self.current));
        }

        match self.cfg.index_by_id(id) {
            Some(ordinal) => {
                self.current = ordinal;
                Ok(Some(ordinal))
            }
            None => {
                // Most likely a remnant of an index dropped on the
                // exporting server after the pages were written.
                self.n_skipped_unknown += 1;
                if !self.cfg.missing && self.unknown_ids.insert(id) {
                    log::warn!(
                        "Page {} is an index page with id {} but that index is not in \
                         the configuration file; treating its pages as remnants of a \
                         dropped index",
                        page_no,
                        id
                    );
                }
                Ok(None)
            }
        }
    }

    /// Rewrite a B+Tree page: index id, max trx id, root segment headers,
    /// and for resolved leaves the record contents.
    fn update_index_page(
        &mut self,
        page_no: u32,
        page: &mut [u8],
        page_type: PageType,
        xdes: &XdesCache,
    ) -> Result<(), ImportError> {
        if xdes.is_free(page_no) {
            return Ok(());
        }

        let ordinal = match self.resolve_index(page_no, page)? {
            Some(ordinal) => ordinal,
            None => return Ok(()),
        };

        let srv_ordinal = match self.cfg.indexes[ordinal].srv_index {
            Some(ord) => ord,
            // Without metadata an unmatched index is not an error.
            None if self.cfg.missing => return Ok(()),
            None => {
                return Err(ImportError::Corruption(format!(
                    "index {} was never resolved against the table definition",
                    self.cfg.indexes[ordinal].name
                )))
            }
        };

        let srv_index = &self.table.indexes[srv_ordinal];
        let is_root = page_is_root(page);
        let leaf = page_is_leaf(page);

        page_set_index_id(page, srv_index.id);

        if srv_index.is_clustered() {
            if is_root {
                if page_type == PageType::Instant {
                    instant::validate_instant_root(page, srv_index.fields.len() as u32)?;
                }
                // The root's PAGE_MAX_TRX_ID slot doubles as the
                // persistent autoinc counter; leave it alone.
            } else {
                // Historical importers stamped clustered pages too.
                page_set_max_trx_id(page, 0);
            }
        } else {
            page_set_max_trx_id(page, if leaf { self.trx_id } else { 0 });
        }

        if is_root && self.cfg.indexes[ordinal].page_no == page_no {
            page_set_fseg_space(page, self.space_id);
        }

        if page_is_empty(page) {
            // Only a root can legally be empty.
            if !is_root {
                return Err(ImportError::Corruption(format!(
                    "page {} is empty but has sibling links",
                    page_no
                )));
            }
            return Ok(());
        }

        if leaf {
            self.update_records(page_no, page, ordinal, srv_index.is_clustered())?;
        }

        Ok(())
    }

    /// Walk the leaf records: reset clustered system columns, re-stamp BLOB
    /// references, opportunistically purge delete-marked records.
    fn update_records(
        &mut self,
        page_no: u32,
        page: &mut [u8],
        ordinal: usize,
        clustered: bool,
    ) -> Result<(), ImportError> {
        let layout = match &self.layouts[ordinal] {
            Some(layout) => layout.clone(),
            None => return Ok(()),
        };
        let ps = self.logical_size as usize;

        let mut cursor = PAGE_NEW_INFIMUM;
        loop {
            let origin = match rec_next(page, cursor) {
                Some(next) => next,
                None => {
                    return Err(ImportError::Corruption(format!(
                        "page {}: record chain broken",
                        page_no
                    )))
                }
            };
            if origin == PAGE_NEW_SUPREMUM {
                break;
            }

            // The hidden instant-ALTER metadata record is left untouched;
            // it is validated separately.
            if clustered && rec_is_min_rec(page, origin) {
                cursor = origin;
                continue;
            }

            let deleted = rec_is_deleted(page, origin);
            let parsed = if clustered || deleted {
                Some(self.adjustable_record(page, origin, &layout, clustered)?)
            } else {
                None
            };

            if deleted {
                self.cfg.indexes[ordinal].stats.n_deleted += 1;
                let n_recs = BigEndian::read_u16(&page[FIL_PAGE_DATA + PAGE_N_RECS..]);
                // In-page removal is only safe when it cannot empty the
                // page or orphan off-page columns.
                match parsed {
                    Some(ref rec) if n_recs > 1 && !rec.has_external() => {
                        record::delete_record(page, ps, origin, rec)?;
                        self.cfg.indexes[ordinal].stats.n_purged += 1;
                        // The cursor's successor is now the record after
                        // the one we removed; do not advance.
                        continue;
                    }
                    _ => self.cfg.indexes[ordinal].stats.n_purge_failed += 1,
                }
            } else {
                self.cfg.indexes[ordinal].stats.n_rows += 1;
            }

            cursor = origin;
        }

        Ok(())
    }

    /// Parse one record and, for the clustered index, adjust its BLOB
    /// references and reset its system columns.
    fn adjustable_record(
        &mut self,
        page: &mut [u8],
        origin: usize,
        layout: &RecordLayout,
        clustered: bool,
    ) -> Result<record::ParsedRecord, ImportError> {
        let rec = layout.parse_leaf(page, origin)?;

        if !clustered {
            return Ok(rec);
        }

        for (i, field) in rec.fields.iter().enumerate() {
            if !field.external {
                continue;
            }
            if field.len < BTR_EXTERN_FIELD_REF_SIZE {
                return Err(ImportError::Corruption(format!(
                    "externally stored column({}) has a reference length of {} \
                     in the cluster index {}",
                    i,
                    field.len,
                    self.table.clustered_index().name
                )));
            }
            let ref_start = field.offset + field.len - BTR_EXTERN_FIELD_REF_SIZE;
            BigEndian::write_u32(
                &mut page[ref_start + BTR_EXTERN_SPACE_ID..],
                self.space_id,
            );
        }

        // Reset DB_TRX_ID and DB_ROLL_PTR: committed, no history.
        if let Some(pos) = layout.trx_id_pos() {
            let trx_field = rec.fields.get(pos).ok_or_else(|| {
                ImportError::Corruption("clustered record is missing DB_TRX_ID".into())
            })?;
            if trx_field.len != DATA_TRX_ID_LEN {
                return Err(ImportError::Corruption(format!(
                    "DB_TRX_ID has length {} instead of {}",
                    trx_field.len, DATA_TRX_ID_LEN
                )));
            }
            page[trx_field.offset..trx_field.offset + RESET_TRX_ID_ROLL_PTR.len()]
                .copy_from_slice(&RESET_TRX_ID_ROLL_PTR);
        }

        Ok(rec)
    }
}

/// Verify and adjust an index root page after the conversion pass: the
/// page must carry the destination index id, and both B+Tree segment
/// headers must point into the destination space.
pub fn btr_root_adjust(
    root_page: &mut [u8],
    expected_index_id: u64,
    space_id: u32,
    logical_size: u32,
    fcrc32: bool,
) -> Result<(), ImportError> {
    if page_get_index_id(root_page) != expected_index_id {
        return Err(ImportError::Corruption(format!(
            "root page {} carries index id {} instead of {}",
            page_get_page_no(root_page),
            page_get_index_id(root_page),
            expected_index_id
        )));
    }
    if !page_is_root(root_page) {
        return Err(ImportError::Corruption(format!(
            "page {} is not a root page",
            page_get_page_no(root_page)
        )));
    }

    let (leaf, top) = page::page_get_fseg_space(root_page);
    if leaf != space_id || top != space_id {
        page_set_fseg_space(root_page, space_id);
    }

    let algorithm = if fcrc32 {
        ChecksumAlgorithm::FullCrc32
    } else {
        ChecksumAlgorithm::Crc32c
    };
    recalculate_checksum(root_page, logical_size, algorithm);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::innodb::metadata::{
        ColumnDescriptor, FieldDescriptor, INDEX_TYPE_CLUSTERED, INDEX_TYPE_UNIQUE,
    };
    use crate::innodb::schema::{ColumnDef, FieldDef, IndexDef};
    use crate::innodb::test_pages;

    const PS: u32 = SIZE_PAGE_DEFAULT;

    fn fixture_cfg(root: u32) -> ImportDescriptor {
        ImportDescriptor {
            version: CFG_VERSION_V1,
            hostname: "host".into(),
            table_name: "test/t1".into(),
            autoinc: 0,
            page_size: PS,
            flags: DICT_TF_COMPACT | DICT_TF_MASK_ATOMIC_BLOBS,
            columns: vec![
                ColumnDescriptor {
                    prtype: DATA_NOT_NULL,
                    mtype: 6,
                    len: 8,
                    mbminlen: 1,
                    mbmaxlen: 1,
                    ind: 0,
                    ord_part: 1,
                    max_prefix: 0,
                    name: "id".into(),
                },
                ColumnDescriptor {
                    prtype: DATA_NOT_NULL,
                    mtype: 1,
                    len: 16,
                    mbminlen: 1,
                    mbmaxlen: 1,
                    ind: 1,
                    ord_part: 0,
                    max_prefix: 0,
                    name: "val".into(),
                },
            ],
            indexes: vec![crate::innodb::metadata::IndexDescriptor {
                id: 500,
                space: 7,
                page_no: root,
                type_bits: INDEX_TYPE_CLUSTERED | INDEX_TYPE_UNIQUE,
                trx_id_offset: 8,
                n_user_defined: 1,
                n_uniq: 1,
                n_nullable: 0,
                n_fields: 4,
                name: "PRIMARY".into(),
                fields: vec![
                    FieldDescriptor { prefix_len: 0, fixed_len: 8, name: "id".into() },
                    FieldDescriptor { prefix_len: 0, fixed_len: 6, name: "DB_TRX_ID".into() },
                    FieldDescriptor { prefix_len: 0, fixed_len: 7, name: "DB_ROLL_PTR".into() },
                    FieldDescriptor { prefix_len: 0, fixed_len: 16, name: "val".into() },
                ],
                srv_index: Some(0),
                stats: IndexStats::default(),
            }],
            missing: false,
        }
    }

    fn fixture_table() -> TableDef {
        TableDef {
            name: "test/t1".into(),
            id: 21,
            flags: DICT_TF_COMPACT | DICT_TF_MASK_ATOMIC_BLOBS,
            space_id: 44,
            columns: vec![
                ColumnDef {
                    name: "id".into(),
                    prtype: DATA_NOT_NULL,
                    mtype: 6,
                    len: 8,
                    mbminlen: 1,
                    mbmaxlen: 1,
                    ind: 0,
                    ord_part: 1,
                    max_prefix: 0,
                },
                ColumnDef {
                    name: "val".into(),
                    prtype: DATA_NOT_NULL,
                    mtype: 1,
                    len: 16,
                    mbminlen: 1,
                    mbmaxlen: 1,
                    ind: 1,
                    ord_part: 0,
                    max_prefix: 0,
                },
            ],
            indexes: vec![IndexDef {
                name: "PRIMARY".into(),
                id: 9000,
                root_page: 3,
                type_bits: INDEX_TYPE_CLUSTERED | INDEX_TYPE_UNIQUE,
                n_uniq: 1,
                n_nullable: 0,
                fields: vec![
                    FieldDef { name: "id".into(), prefix_len: 0, fixed_len: 8 },
                    FieldDef { name: "DB_TRX_ID".into(), prefix_len: 0, fixed_len: 6 },
                    FieldDef { name: "DB_ROLL_PTR".into(), prefix_len: 0, fixed_len: 7 },
                    FieldDef { name: "val".into(), prefix_len: 0, fixed_len: 16 },
                ],
                corrupted: false,
            }],
            row_id_generated: false,
            file_unreadable: true,
            autoinc: 0,
        }
    }

    fn empty_xdes() -> XdesCache {
        let mut cache = XdesCache::new(PS, 1000);
        // an in-use extent with every covered page allocated
        let mut page = vec![0u8; PS as usize];
        BigEndian::write_u32(&mut page[XDES_ARR_OFFSET + XDES_STATE..], 2);
        cache.set_current(0, &page);
        cache
    }

    fn converter<'a>(
        cfg: &'a mut ImportDescriptor,
        table: &'a TableDef,
    ) -> PageConverter<'a> {
        PageConverter::new(cfg, table, 44, 0, 1234, PS, Interrupt::new())
    }

    #[test]
    fn test_clustered_leaf_records_reset() {
        let mut cfg = fixture_cfg(3);
        let table = fixture_table();
        let layout = test_pages::fixed_layout();

        let mut page = test_pages::empty_leaf_page(3, 7, 500);
        let a = test_pages::append_record(&mut page, &layout, 10, false);
        let b = test_pages::append_record(&mut page, &layout, 20, false);

        let xdes = empty_xdes();
        let mut conv = converter(&mut cfg, &table);
        assert!(conv.visit(3, &mut page, &xdes).unwrap());

        // index id rewritten to the destination id
        assert_eq!(page_get_index_id(&page), 9000);
        // space id stamped
        assert_eq!(BigEndian::read_u32(&page[FIL_PAGE_SPACE_ID..]), 44);
        // root page: both segment headers restamped
        assert_eq!(page::page_get_fseg_space(&page), (44, 44));
        // system columns reset on every record
        for origin in [a, b] {
            let rec = layout.parse_leaf(&page, origin).unwrap();
            let trx = &page[rec.fields[1].offset..rec.fields[1].offset + 13];
            assert_eq!(trx, &RESET_TRX_ID_ROLL_PTR);
        }
        assert_eq!(cfg.indexes[0].stats.n_rows, 2);
        assert_eq!(cfg.indexes[0].stats.n_deleted, 0);
        // checksum finalized
        assert!(crate::innodb::checksum::validate_checksum(&page, PS, false).valid);
    }

    #[test]
    fn test_delete_marked_record_purged_in_place() {
        let mut cfg = fixture_cfg(3);
        let table = fixture_table();
        let layout = test_pages::fixed_layout();

        let mut page = test_pages::empty_leaf_page(3, 7, 500);
        test_pages::append_record(&mut page, &layout, 10, false);
        test_pages::append_record(&mut page, &layout, 20, true);
        test_pages::append_record(&mut page, &layout, 30, false);

        let xdes = empty_xdes();
        let mut conv = converter(&mut cfg, &table);
        conv.visit(3, &mut page, &xdes).unwrap();

        let stats = cfg.indexes[0].stats;
        assert_eq!(stats.n_rows, 2);
        assert_eq!(stats.n_deleted, 1);
        assert_eq!(stats.n_purged, 1);
        assert_eq!(stats.n_purge_failed, 0);
        assert_eq!(record::walk_records(&page).unwrap().len(), 2);
    }

    #[test]
    fn test_sole_delete_marked_record_is_deferred() {
        let mut cfg = fixture_cfg(3);
        let table = fixture_table();
        let layout = test_pages::fixed_layout();

        let mut page = test_pages::empty_leaf_page(3, 7, 500);
        test_pages::append_record(&mut page, &layout, 10, true);

        let xdes = empty_xdes();
        let mut conv = converter(&mut cfg, &table);
        conv.visit(3, &mut page, &xdes).unwrap();

        let stats = cfg.indexes[0].stats;
        assert_eq!(stats.n_purged, 0);
        assert_eq!(stats.n_purge_failed, 1);
        assert_eq!(record::walk_records(&page).unwrap().len(), 1);
    }

    #[test]
    fn test_blob_reference_restamped() {
        let mut cfg = fixture_cfg(3);
        // swap the payload for a variable-length column
        cfg.indexes[0].fields[3].fixed_len = 0;
        cfg.columns[1].prtype = DATA_NOT_NULL;
        let mut table = fixture_table();
        table.indexes[0].fields[3].fixed_len = 0;

        let layout = test_pages::var_layout();
        let mut page = test_pages::empty_leaf_page(3, 7, 500);
        let mut payload = vec![0u8; 40];
        // external reference tail: space id 7, page 99
        BigEndian::write_u32(&mut payload[20 + BTR_EXTERN_SPACE_ID..], 7);
        BigEndian::write_u32(&mut payload[20 + BTR_EXTERN_PAGE_NO..], 99);
        let origin = test_pages::append_var_record(&mut page, &layout, 10, &payload, true);

        let xdes = empty_xdes();
        let mut conv = converter(&mut cfg, &table);
        conv.visit(3, &mut page, &xdes).unwrap();

        let rec = layout.parse_leaf(&page, origin).unwrap();
        let field = &rec.fields[3];
        let ref_start = field.offset + field.len - BTR_EXTERN_FIELD_REF_SIZE;
        assert_eq!(
            BigEndian::read_u32(&page[ref_start + BTR_EXTERN_SPACE_ID..]),
            44
        );
        assert_eq!(
            BigEndian::read_u32(&page[ref_start + BTR_EXTERN_PAGE_NO..]),
            99
        );
    }

    #[test]
    fn test_unknown_index_id_skipped_not_fatal() {
        let mut cfg = fixture_cfg(3);
        let table = fixture_table();
        let layout = test_pages::fixed_layout();

        let mut page = test_pages::empty_leaf_page(5, 7, 31337);
        test_pages::append_record(&mut page, &layout, 10, false);

        let xdes = empty_xdes();
        let mut conv = converter(&mut cfg, &table);
        conv.visit(5, &mut page, &xdes).unwrap();

        assert_eq!(conv.n_skipped_unknown, 1);
        // index id untouched
        assert_eq!(page_get_index_id(&page), 31337);
    }

    #[test]
    fn test_empty_page_with_siblings_is_corruption() {
        let mut cfg = fixture_cfg(3);
        let table = fixture_table();

        let mut page = test_pages::empty_leaf_page(5, 7, 500);
        crate::innodb::page::page_set_next(&mut page, 6);

        let xdes = empty_xdes();
        let mut conv = converter(&mut cfg, &table);
        assert!(matches!(
            conv.visit(5, &mut page, &xdes),
            Err(ImportError::Corruption(_))
        ));
    }

    #[test]
    fn test_secondary_leaf_gets_max_trx_id() {
        let mut cfg = fixture_cfg(3);
        cfg.indexes.push(crate::innodb::metadata::IndexDescriptor {
            id: 501,
            space: 7,
            page_no: 4,
            type_bits: 0,
            trx_id_offset: 0,
            n_user_defined: 1,
            n_uniq: 1,
            n_nullable: 0,
            n_fields: 1,
            name: "idx_val".into(),
            fields: vec![FieldDescriptor {
                prefix_len: 0,
                fixed_len: 8,
                name: "id".into(),
            }],
            srv_index: Some(1),
            stats: IndexStats::default(),
        });
        let mut table = fixture_table();
        table.indexes.push(IndexDef {
            name: "idx_val".into(),
            id: 9001,
            root_page: 4,
            type_bits: 0,
            n_uniq: 1,
            n_nullable: 0,
            fields: vec![FieldDef { name: "id".into(), prefix_len: 0, fixed_len: 8 }],
            corrupted: false,
        });

        let mut page = test_pages::empty_leaf_page(4, 7, 501);
        test_pages::append_sec_record(&mut page, 10, false);

        let xdes = empty_xdes();
        let mut conv = converter(&mut cfg, &table);
        conv.visit(4, &mut page, &xdes).unwrap();

        let hdr = crate::innodb::page::IndexPageHeader::parse(&page).unwrap();
        assert_eq!(hdr.max_trx_id, 1234);
        assert_eq!(hdr.index_id, 9001);
    }

    #[test]
    fn test_header_page_rewrite() {
        let mut cfg = fixture_cfg(3);
        let table = fixture_table();

        let mut page = crate::innodb::tablespace::build_fsp_page(
            7,
            8,
            5 << FSP_FLAGS_POS_PAGE_SSIZE,
            1000,
            PS,
        );
        // stale key-version garbage
        BigEndian::write_u64(&mut page[FIL_PAGE_FILE_FLUSH_LSN..], 0xDEAD);

        let xdes = empty_xdes();
        let mut conv = converter(&mut cfg, &table);
        conv.visit(0, &mut page, &xdes).unwrap();

        assert_eq!(BigEndian::read_u32(&page[FIL_PAGE_SPACE_ID..]), 44);
        assert_eq!(
            BigEndian::read_u32(&page[FIL_PAGE_DATA + FSP_SPACE_ID..]),
            44
        );
        assert_eq!(BigEndian::read_u64(&page[FIL_PAGE_FILE_FLUSH_LSN..]), 0);
    }

    #[test]
    fn test_unknown_page_type_is_corruption() {
        let mut cfg = fixture_cfg(3);
        let table = fixture_table();

        let mut page = vec![0u8; PS as usize];
        BigEndian::write_u32(&mut page[FIL_PAGE_OFFSET..], 2);
        BigEndian::write_u16(&mut page[FIL_PAGE_TYPE..], 999);

        let xdes = empty_xdes();
        let mut conv = converter(&mut cfg, &table);
        assert!(matches!(
            conv.visit(2, &mut page, &xdes),
            Err(ImportError::Corruption(_))
        ));
    }

    #[test]
    fn test_root_fetcher_collects_candidates() {
        let table = fixture_table();
        let layout = test_pages::fixed_layout();

        let mut root = test_pages::empty_leaf_page(3, 7, 500);
        test_pages::append_record(&mut root, &layout, 1, false);
        let mut linked = test_pages::empty_leaf_page(4, 7, 500);
        crate::innodb::page::page_set_prev(&mut linked, 3);

        let xdes = empty_xdes();
        let mut fetcher = RootPageFetcher::new(&table, 7, 0, Interrupt::new());
        assert!(!fetcher.visit(3, &mut root, &xdes).unwrap());
        assert!(!fetcher.visit(4, &mut linked, &xdes).unwrap());

        let cfg = fetcher.build_descriptor(PS).unwrap();
        assert!(cfg.missing);
        assert_eq!(cfg.indexes.len(), 1);
        assert_eq!(cfg.indexes[0].page_no, 3);
        assert_eq!(cfg.indexes[0].name, "index_500");
    }

    #[test]
    fn test_root_fetcher_rejects_flag_mismatch() {
        let mut table = fixture_table();
        // table expects a zip size the file does not have
        table.flags |= 4 << DICT_TF_POS_ZIP_SSIZE;
        let layout = test_pages::fixed_layout();

        let mut root = test_pages::empty_leaf_page(3, 7, 500);
        test_pages::append_record(&mut root, &layout, 1, false);

        let xdes = empty_xdes();
        let mut fetcher = RootPageFetcher::new(&table, 7, 0, Interrupt::new());
        assert!(matches!(
            fetcher.visit(3, &mut root, &xdes),
            Err(ImportError::Corruption(_))
        ));
    }

    #[test]
    fn test_no_roots_found_is_corruption() {
        let table = fixture_table();
        let fetcher = RootPageFetcher::new(&table, 7, 0, Interrupt::new());
        assert!(matches!(
            fetcher.build_descriptor(PS),
            Err(ImportError::Corruption(_))
        ));
    }

    #[test]
    fn test_btr_root_adjust() {
        let layout = test_pages::fixed_layout();
        let mut root = test_pages::empty_leaf_page(3, 44, 9000);
        test_pages::append_record(&mut root, &layout, 1, false);

        btr_root_adjust(&mut root, 9000, 44, PS, false).unwrap();
        assert_eq!(page::page_get_fseg_space(&root), (44, 44));

        assert!(matches!(
            btr_root_adjust(&mut root, 1, 44, PS, false),
            Err(ImportError::Corruption(_))
        ));
    }
}
