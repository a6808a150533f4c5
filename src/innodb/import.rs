//! The import orchestrator.
//!
//! [`import_tablespace`] sequences a full tablespace import: transaction
//! assignment, metadata read (or root-page discovery when the metadata file
//! is absent), schema matching, root assignment, instant-ALTER metadata
//! resolution, the page conversion pass, re-validation of the converted
//! space, change-buffer bitmap checks, per-index root adjustment and purge,
//! row-id synchronization, a synchronous flush, and finally the catalog
//! commit that makes the table readable again.
//!
//! Every failure after the transaction was assigned funnels through one
//! cleanup path: the table is marked unreadable, its in-memory root pages
//! are reset, the staged catalog changes are discarded, and the transaction
//! is committed anyway so its bookkeeping is released. The tablespace is
//! never left in a half-imported-but-readable state.

use std::path::Path;
use std::time::{Duration, Instant};

use crate::innodb::catalog::{Catalog, Interrupt, Transaction, TxnFactory};
use crate::innodb::codec::{CryptDescriptor, PageCodec};
use crate::innodb::constants::*;
use crate::innodb::converter::{btr_root_adjust, PageConverter, RootPageFetcher};
use crate::innodb::instant;
use crate::innodb::iterator::{PageVisitor, TablespaceIterator};
use crate::innodb::metadata::{self, ImportDescriptor};
use crate::innodb::page::{
    full_crc32, fsp_flags_match, page_get_page_no, table_flags_to_fsp_flags,
};
use crate::innodb::purge::IndexPurge;
use crate::innodb::record::{node_ptr_child, walk_records, RecordLayout};
use crate::innodb::schema::{self, TableDef};
use crate::innodb::tablespace::TablespaceFile;
use crate::ImportError;

use byteorder::{BigEndian, ByteOrder};

/// Tunables of one import run.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Pages per I/O batch; defaults to 1 MiB worth of pages.
    pub io_batch_pages: Option<u32>,
    /// Treat a metadata file with an unrecognized version as absent and
    /// fall back to heuristic root discovery, instead of failing.
    pub treat_unsupported_as_missing: bool,
    /// Warn if the final flush takes longer than this.
    pub slow_flush_warning: Duration,
}

impl Default for ImportOptions {
    fn default() -> Self {
        ImportOptions {
            io_batch_pages: None,
            treat_unsupported_as_missing: false,
            slow_flush_warning: Duration::from_secs(30),
        }
    }
}

/// Everything an import needs from its environment, passed explicitly.
pub struct ImportContext<'a> {
    pub txn_factory: &'a TxnFactory,
    pub catalog: &'a mut Catalog,
    pub interrupt: Interrupt,
    /// The destination server's configured page size.
    pub srv_page_size: u32,
    /// Crypt material for the tablespace, if it is encrypted.
    pub crypt: Option<CryptDescriptor>,
    pub options: ImportOptions,
}

/// Summary of a successful import.
#[derive(Debug, Clone)]
pub struct ImportReport {
    /// Surviving rows in the clustered index.
    pub n_rows: u64,
    /// Autoincrement value adopted from the metadata file (0 if none).
    pub autoinc: u64,
    /// Secondary indexes the import gave up on; they need a rebuild.
    pub corrupt_indexes: Vec<String>,
    /// Pages skipped because their index id matched no resolved index.
    pub n_skipped_unknown_index: u64,
}

/// Import the tablespace file at `ibd_path` into `table`, reading the
/// schema snapshot from `cfg_path` if it exists.
pub fn import_tablespace(
    ctx: &mut ImportContext<'_>,
    table: &mut TableDef,
    ibd_path: &Path,
    cfg_path: &Path,
) -> Result<ImportReport, ImportError> {
    // Assign the covering transaction first; without it there is no
    // crash-recoverable bookkeeping, so nothing else may start.
    let mut txn = ctx.txn_factory.begin()?;

    match run(ctx, table, &mut txn, ibd_path, cfg_path) {
        Ok(report) => {
            for index in &table.indexes {
                txn.update_index_root(
                    table.id,
                    index.id,
                    table.space_id,
                    index.root_page,
                    index.type_bits,
                );
            }
            txn.update_discarded_flag(table.id, false);
            ctx.catalog.commit(txn);

            table.file_unreadable = false;
            if report.autoinc != 0 {
                table.autoinc = report.autoinc;
                log::info!("{} autoinc value set to {}", table.name, report.autoinc);
            }

            Ok(report)
        }
        Err(err) => Err(cleanup(ctx, table, txn, err)),
    }
}

/// The failure path: leave the table discarded and unreadable, release the
/// transaction, report the error.
fn cleanup(
    ctx: &mut ImportContext<'_>,
    table: &mut TableDef,
    mut txn: Transaction,
    err: ImportError,
) -> ImportError {
    if !matches!(err, ImportError::Interrupted) {
        log::warn!("Import of table {} failed: {}", table.name, err);
    }
    log::info!("Discarding tablespace of table {}: {}", table.name, err);

    // The on-disk root page numbers may already be rewritten; make sure
    // the in-memory definition does not pretend to be loadable.
    for index in &mut table.indexes {
        index.root_page = FIL_NULL;
    }
    table.file_unreadable = true;

    // Commit the transaction anyway so its undo bookkeeping is released;
    // only the staged catalog changes are dropped.
    txn.discard_changes();
    ctx.catalog.commit(txn);

    err
}

fn run(
    ctx: &mut ImportContext<'_>,
    table: &mut TableDef,
    txn: &mut Transaction,
    ibd_path: &Path,
    cfg_path: &Path,
) -> Result<ImportReport, ImportError> {
    let srv_page_size = ctx.srv_page_size;

    // ── Metadata ────────────────────────────────────────────────────
    let mut cfg = read_metadata(ctx, table, cfg_path)?;

    let mut ts = TablespaceFile::open_rw(ibd_path, srv_page_size)?;

    let expected_flags = table_flags_to_fsp_flags(table.flags);
    if !fsp_flags_match(expected_flags, ts.space_flags()) {
        return Err(ImportError::Corruption(format!(
            "expected FSP_SPACE_FLAGS=0x{:x}, .ibd file contains 0x{:x}",
            expected_flags,
            ts.space_flags()
        )));
    }

    let mut autoinc = 0u64;
    if let Some(cfg) = cfg.as_ref() {
        autoinc = cfg.autoinc;
    }

    let mut cfg = match cfg.take() {
        Some(mut cfg) => {
            schema::match_schema(table, &mut cfg)?;
            schema::set_root_by_name(table, &cfg);
            cfg
        }
        None => {
            // Discover the index roots from the file itself.
            let mut fetcher = RootPageFetcher::new(
                table,
                ts.space_id(),
                ts.space_flags(),
                ctx.interrupt.clone(),
            );
            let codec = PageCodec::new(
                ts.space_id(),
                ts.space_flags(),
                srv_page_size as usize,
                ctx.crypt.clone(),
            );
            let batch = ctx
                .options
                .io_batch_pages
                .unwrap_or_else(|| io_batch_pages(ts.physical_size()));
            TablespaceIterator::new(&mut ts, codec, batch, ctx.interrupt.clone())
                .run(PageVisitor::FetchRoots(&mut fetcher))?;

            let mut cfg = fetcher.build_descriptor(srv_page_size)?;
            schema::set_root_by_heuristic(table, &mut cfg)?;
            cfg
        }
    };

    // ── Instant-ALTER metadata ──────────────────────────────────────
    let clust_layout = layout_for(&cfg, table, 0).ok_or_else(|| {
        ImportError::Corruption("the clustered index was never resolved".into())
    })?;
    {
        let mut codec = PageCodec::new(
            ts.space_id(),
            ts.space_flags(),
            srv_page_size as usize,
            ctx.crypt.clone(),
        );
        instant::resolve_instant_metadata(
            &mut ts,
            &mut codec,
            table.indexes[0].root_page,
            &clust_layout,
            table.clustered_index().fields.len() as u32,
        )?;
    }

    // ── Phase I: page conversion ────────────────────────────────────
    log::info!("Phase I - Update all pages");
    let n_skipped_unknown_index;
    {
        let space_flags = ts.space_flags();
        let mut codec = PageCodec::new(
            ts.space_id(),
            space_flags,
            srv_page_size as usize,
            ctx.crypt.clone(),
        );
        // Pages are decrypted under the exporter's space id but written
        // back under ours.
        codec.rebind_space(table.space_id);
        let mut converter = PageConverter::new(
            &mut cfg,
            table,
            table.space_id,
            space_flags,
            txn.id(),
            srv_page_size,
            ctx.interrupt.clone(),
        );
        let batch = ctx
            .options
            .io_batch_pages
            .unwrap_or_else(|| io_batch_pages(ts.physical_size()));
        TablespaceIterator::new(&mut ts, codec, batch, ctx.interrupt.clone())
            .run(PageVisitor::Convert(&mut converter))?;
        n_skipped_unknown_index = converter.n_skipped_unknown;
    }

    // ── Open the converted space under its destination identity ─────
    ts.reload_header()?;
    if ts.space_id() != table.space_id {
        return Err(ImportError::Corruption(format!(
            "converted tablespace carries space id {} instead of {}",
            ts.space_id(),
            table.space_id
        )));
    }
    let mut codec = PageCodec::new(
        table.space_id,
        ts.space_flags(),
        srv_page_size as usize,
        ctx.crypt.clone(),
    );

    check_ibuf_bitmaps(&mut ts, &mut codec)?;

    // ── Root adjustment and purge ───────────────────────────────────
    let fcrc32 = full_crc32(ts.space_flags());
    let clust_name = table.indexes[0].name.clone();

    adjust_root(&mut ts, &mut codec, table, 0, fcrc32)?;
    if cfg.requires_purge(&clust_name) {
        let mut purge = IndexPurge::new(
            &mut ts,
            &mut codec,
            clust_layout.clone(),
            &clust_name,
            table.indexes[0].root_page,
            ctx.interrupt.clone(),
        );
        purge.garbage_collect()?;
    }

    let n_rows_in_table = cfg.n_rows(&clust_name);
    let mut corrupt_indexes = Vec::new();

    for ordinal in 1..table.indexes.len() {
        if table.indexes[ordinal].corrupted
            || table.indexes[ordinal].root_page == FIL_NULL
        {
            log::warn!(
                "Skip adjustment of root pages for index {}",
                table.indexes[ordinal].name
            );
            flag_corrupt(table, ordinal, &mut corrupt_indexes);
            continue;
        }

        if let Err(err) = adjust_root(&mut ts, &mut codec, table, ordinal, fcrc32) {
            log::warn!(
                "Index {} not found or corrupt, you should recreate this index: {}",
                table.indexes[ordinal].name,
                err
            );
            flag_corrupt(table, ordinal, &mut corrupt_indexes);
            continue;
        }

        let name = table.indexes[ordinal].name.clone();
        if !cfg.requires_purge(&name) {
            continue;
        }

        let layout = match layout_for(&cfg, table, ordinal) {
            Some(layout) => layout,
            None => {
                flag_corrupt(table, ordinal, &mut corrupt_indexes);
                continue;
            }
        };
        let mut purge = IndexPurge::new(
            &mut ts,
            &mut codec,
            layout,
            &name,
            table.indexes[ordinal].root_page,
            ctx.interrupt.clone(),
        );
        let survivors = purge.garbage_collect()?;

        if survivors != n_rows_in_table {
            log::warn!(
                "Index '{}' contains {} entries, should be {}, you should \
                 recreate this index",
                name,
                survivors,
                n_rows_in_table
            );
            flag_corrupt(table, ordinal, &mut corrupt_indexes);
        }
    }

    // ── Row-id high-water mark ──────────────────────────────────────
    if table.row_id_generated {
        let row_id = max_row_id(
            &mut ts,
            &mut codec,
            &clust_layout,
            table.indexes[0].root_page,
        )?;
        if row_id != 0 {
            ctx.catalog.sync_row_id(row_id);
        }
    }

    // ── Phase III: flush ────────────────────────────────────────────
    log::info!("Phase III - Flush changes to disk");
    let start = Instant::now();
    ts.flush()?;
    let elapsed = start.elapsed();
    if elapsed > ctx.options.slow_flush_warning {
        log::warn!(
            "Flushing the imported tablespace took {:?}; storage may be overloaded",
            elapsed
        );
    }
    log::info!("Phase IV - Flush complete");

    Ok(ImportReport {
        n_rows: cfg.n_rows(&clust_name),
        autoinc,
        corrupt_indexes,
        n_skipped_unknown_index,
    })
}

/// Read the metadata file, or decide to proceed without one.
///
/// Returns `Ok(None)` for the heuristic path. The heuristic path is only
/// allowed for tables whose secondary indexes were dropped: the ordinal
/// root pairing cannot be trusted beyond a single index.
fn read_metadata(
    ctx: &ImportContext<'_>,
    table: &TableDef,
    cfg_path: &Path,
) -> Result<Option<ImportDescriptor>, ImportError> {
    let heuristic = |reason: &str| -> Result<Option<ImportDescriptor>, ImportError> {
        if table.indexes.len() > 1 {
            return Err(ImportError::SchemaMismatch(vec![format!(
                "the metadata file {} is {} and table {} has {} secondary indexes; \
                 drop the secondary indexes before importing without metadata and \
                 recreate them afterwards",
                cfg_path.display(),
                reason,
                table.name,
                table.indexes.len() - 1
            )]));
        }
        log::warn!(
            "Error opening {}: will attempt to import without schema verification",
            cfg_path.display()
        );
        Ok(None)
    };

    if !cfg_path.exists() {
        return heuristic("missing");
    }

    match metadata::read_cfg(cfg_path, ctx.srv_page_size) {
        Ok(cfg) => Ok(Some(cfg)),
        Err(ImportError::UnsupportedVersion(version))
            if ctx.options.treat_unsupported_as_missing =>
        {
            // Present-but-too-new is treated as absent, not as bad.
            log::warn!(
                "Unsupported meta-data version number ({}), file ignored",
                version
            );
            heuristic("unreadable")
        }
        Err(err) => Err(err),
    }
}

/// Record layout of the live index at `live_ordinal`, resolved through the
/// matched descriptor entry (the descriptor's own order is not trusted).
fn layout_for(
    cfg: &ImportDescriptor,
    table: &TableDef,
    live_ordinal: usize,
) -> Option<RecordLayout> {
    let cfg_index = cfg
        .indexes
        .iter()
        .find(|i| i.srv_index == Some(live_ordinal))?;
    if cfg.missing {
        Some(table.record_layout(&table.indexes[live_ordinal]))
    } else {
        Some(cfg.record_layout(cfg_index))
    }
}

fn flag_corrupt(table: &mut TableDef, ordinal: usize, names: &mut Vec<String>) {
    table.indexes[ordinal].corrupted = true;
    if !names.contains(&table.indexes[ordinal].name) {
        names.push(table.indexes[ordinal].name.clone());
    }
}

/// Verify and restamp one index's root page.
fn adjust_root(
    ts: &mut TablespaceFile,
    codec: &mut PageCodec,
    table: &TableDef,
    ordinal: usize,
    fcrc32: bool,
) -> Result<(), ImportError> {
    let index = &table.indexes[ordinal];
    let root = index.root_page;
    if root == FIL_NULL || root as u64 >= ts.page_count() {
        return Err(ImportError::Corruption(format!(
            "index {} has no valid root page",
            index.name
        )));
    }

    let mut page = ts.read_logical_page(codec, root)?;
    btr_root_adjust(&mut page, index.id, table.space_id, ts.logical_size(), fcrc32)?;
    ts.write_logical_page(codec, root, &page)
}

/// Validate the change-buffer bitmap pages of the imported space: no page
/// may claim to have buffered changes, since the exporting server's change
/// buffer did not travel with the file.
fn check_ibuf_bitmaps(
    ts: &mut TablespaceFile,
    codec: &mut PageCodec,
) -> Result<(), ImportError> {
    // buffered bits of the two pages packed into each byte
    const BUFFERED_BITS: u8 = 0x44;

    let group = ts.physical_size();
    let mut page_no = 1u32;
    while (page_no as u64) < ts.page_count() {
        let page = ts.read_logical_page(codec, page_no)?;
        let page_type = BigEndian::read_u16(&page[FIL_PAGE_TYPE..]);
        if page_type == crate::innodb::page_types::PageType::IbufBitmap.to_u16() {
            let end = ts.logical_size() as usize - SIZE_FIL_TRAILER;
            for (i, byte) in page[IBUF_BITMAP..end].iter().enumerate() {
                if byte & BUFFERED_BITS != 0 {
                    return Err(ImportError::Corruption(format!(
                        "change buffer bitmap page {} marks buffered changes \
                         (byte {}); the space cannot be imported",
                        page_no, i
                    )));
                }
            }
        }
        page_no = match page_no.checked_add(group) {
            Some(next) => next,
            None => break,
        };
    }

    Ok(())
}

/// Highest DB_ROW_ID stored in the clustered index (0 for an empty table).
fn max_row_id(
    ts: &mut TablespaceFile,
    codec: &mut PageCodec,
    layout: &RecordLayout,
    root: u32,
) -> Result<u64, ImportError> {
    // Descend to the leftmost leaf, then follow the chain to its end.
    let mut page_no = root;
    let mut page = ts.read_logical_page(codec, page_no)?;
    let mut hops = 0u32;
    while !crate::innodb::page::page_is_leaf(&page) {
        hops += 1;
        if hops > 64 {
            return Err(ImportError::Corruption(
                "clustered index deeper than 64 levels".into(),
            ));
        }
        let records = walk_records(&page)?;
        let first = *records.first().ok_or_else(|| {
            ImportError::Corruption(format!("non-leaf page {} is empty", page_no))
        })?;
        let rec = layout.parse_node_ptr(&page, first)?;
        page_no = node_ptr_child(&page, &rec);
        if page_no == FIL_NULL || page_no as u64 >= ts.page_count() {
            return Err(ImportError::Corruption(format!(
                "node pointer references invalid child page {}",
                page_no
            )));
        }
        page = ts.read_logical_page(codec, page_no)?;
    }

    let mut visited = 0u64;
    loop {
        visited += 1;
        if visited > ts.page_count() {
            return Err(ImportError::Corruption(
                "clustered leaf chain does not terminate".into(),
            ));
        }
        let next = BigEndian::read_u32(&page[FIL_PAGE_NEXT..]);
        if next == FIL_NULL {
            break;
        }
        page_no = next;
        page = ts.read_logical_page(codec, page_no)?;
        if page_get_page_no(&page) != page_no {
            return Err(ImportError::Corruption(format!(
                "sibling link leads to page {} which claims to be page {}",
                page_no,
                page_get_page_no(&page)
            )));
        }
    }

    let records = walk_records(&page)?;
    match records.last() {
        None => Ok(0),
        Some(&origin) => {
            let rec = layout.parse_leaf(&page, origin)?;
            let field = rec.fields.first().ok_or_else(|| {
                ImportError::Corruption("clustered record has no fields".into())
            })?;
            if field.len < DATA_ROW_ID_LEN {
                return Err(ImportError::Corruption(
                    "DB_ROW_ID column is shorter than 6 bytes".into(),
                ));
            }
            let mut buf = [0u8; 8];
            buf[2..].copy_from_slice(&page[field.offset..field.offset + DATA_ROW_ID_LEN]);
            Ok(u64::from_be_bytes(buf))
        }
    }
}
