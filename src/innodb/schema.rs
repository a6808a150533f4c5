//! Live table definitions and the schema matcher.
//!
//! The destination table's catalog definition is handed to the import as a
//! [`TableDef`]. Before any page is rewritten, [`match_schema`] verifies that
//! the exported snapshot in the `.cfg` file will be interpretable under that
//! definition: table flags, column count and per-column attributes, index
//! count and per-index fields. Mismatches are collected into one batch of
//! diagnostics so the operator sees every discrepancy at once, not just the
//! first.
//!
//! Matching also resolves each descriptor index to its live counterpart and
//! transfers the exported root page numbers onto the live definition
//! ([`set_root_by_name`]). When no metadata file exists, the pairing falls
//! back to ordinal position over the discovered roots
//! ([`set_root_by_heuristic`]), which is best-effort and logged loudly.

use serde::Serialize;

use crate::innodb::constants::*;
use crate::innodb::metadata::{ImportDescriptor, INDEX_TYPE_FTS};
use crate::ImportError;

/// One field of a live index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDef {
    pub name: String,
    /// Indexed prefix length (0 = whole column).
    pub prefix_len: u32,
    /// Fixed stored length (0 = variable).
    pub fixed_len: u32,
}

/// One live index of the destination table.
#[derive(Debug, Clone, Serialize)]
pub struct IndexDef {
    pub name: String,
    /// Index id on the destination server.
    pub id: u64,
    /// Root page number; FIL_NULL while the tablespace is discarded.
    pub root_page: u32,
    /// Index type bitmask (same encoding as the metadata file).
    pub type_bits: u32,
    pub n_uniq: u32,
    pub n_nullable: u32,
    pub fields: Vec<FieldDef>,
    /// Set when the import had to give up on this index; the operator is
    /// expected to rebuild it.
    pub corrupted: bool,
}

impl IndexDef {
    pub fn is_clustered(&self) -> bool {
        self.type_bits & crate::innodb::metadata::INDEX_TYPE_CLUSTERED != 0
    }

    pub fn is_fts(&self) -> bool {
        self.type_bits & INDEX_TYPE_FTS != 0
    }
}

/// One live column of the destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub name: String,
    pub prtype: u32,
    pub mtype: u32,
    pub len: u32,
    pub mbminlen: u32,
    pub mbmaxlen: u32,
    /// Ordinal position.
    pub ind: u32,
    pub ord_part: u32,
    pub max_prefix: u32,
}

/// The destination table's live definition, as the import sees it.
#[derive(Debug, Clone, Serialize)]
pub struct TableDef {
    pub name: String,
    pub id: u64,
    /// Dictionary flags (same encoding as the metadata file).
    pub flags: u32,
    /// The space id assigned to this table on the destination server.
    pub space_id: u32,
    pub columns: Vec<ColumnDef>,
    /// Indexes in dictionary order, clustered first.
    pub indexes: Vec<IndexDef>,
    /// True when the clustered key is the auto-generated DB_ROW_ID.
    pub row_id_generated: bool,
    /// Set while the tablespace is discarded or a failed import left the
    /// table unreadable.
    pub file_unreadable: bool,
    /// In-memory autoincrement counter.
    pub autoinc: u64,
}

impl TableDef {
    /// The clustered index (always first in dictionary order).
    pub fn clustered_index(&self) -> &IndexDef {
        &self.indexes[0]
    }

    pub fn index_by_name(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Record layout of one live index, used when no metadata file exists
    /// to derive it from.
    pub fn record_layout(&self, index: &IndexDef) -> crate::innodb::record::RecordLayout {
        let fields = index
            .fields
            .iter()
            .map(|f| crate::innodb::record::FieldSpec {
                fixed_len: f.fixed_len as u16,
                nullable: self
                    .columns
                    .iter()
                    .find(|c| c.name == f.name)
                    .map(|c| c.prtype & DATA_NOT_NULL == 0)
                    .unwrap_or(false),
            })
            .collect();

        crate::innodb::record::RecordLayout {
            fields,
            n_uniq: index.n_uniq as usize,
            clustered: index.is_clustered(),
        }
    }
}

/// Human-readable row format of a set of table flags, for mismatch
/// diagnostics.
pub fn row_format_name(flags: u32) -> String {
    let zip_ssize = (flags & DICT_TF_MASK_ZIP_SSIZE) >> DICT_TF_POS_ZIP_SSIZE;
    if zip_ssize != 0 {
        let kb = match zip_ssize {
            1 => "1",
            2 => "2",
            3 => "4",
            4 => "8",
            5 => "16",
            _ => return "strange KEY_BLOCK_SIZE".into(),
        };
        return format!("ROW_FORMAT=COMPRESSED KEY_BLOCK_SIZE={}", kb);
    }
    if flags & DICT_TF_MASK_ATOMIC_BLOBS != 0 {
        "ROW_FORMAT=DYNAMIC".into()
    } else if flags & DICT_TF_COMPACT != 0 {
        "ROW_FORMAT=COMPACT".into()
    } else {
        "ROW_FORMAT=REDUNDANT".into()
    }
}

fn match_table_columns(table: &TableDef, cfg: &ImportDescriptor, diags: &mut Vec<String>) {
    for col in &table.columns {
        let cfg_ord = match cfg.find_col(&col.name) {
            Some(ord) => ord,
            None => {
                diags.push(format!("Column {} not found in tablespace.", col.name));
                continue;
            }
        };

        if cfg_ord as u32 != col.ind {
            diags.push(format!(
                "Column {} ordinal value mismatch, it's at {} in the table and {} \
                 in the tablespace meta-data file",
                col.name, col.ind, cfg_ord
            ));
            continue;
        }

        let cfg_col = &cfg.columns[cfg_ord];
        if cfg_col.prtype != col.prtype {
            diags.push(format!("Column {} precise type mismatch.", col.name));
        }
        if cfg_col.mtype != col.mtype {
            diags.push(format!("Column {} main type mismatch.", col.name));
        }
        if cfg_col.len != col.len {
            diags.push(format!("Column {} length mismatch.", col.name));
        }
        if cfg_col.mbminlen != col.mbminlen || cfg_col.mbmaxlen != col.mbmaxlen {
            diags.push(format!("Column {} multi-byte len mismatch.", col.name));
        }
        if cfg_col.ord_part != col.ord_part {
            diags.push(format!("Column {} ordering mismatch.", col.name));
        }
        if cfg_col.max_prefix != col.max_prefix {
            diags.push(format!("Column {} max prefix mismatch.", col.name));
        }
    }
}

fn match_index_columns(
    live_ordinal: usize,
    index: &IndexDef,
    cfg: &mut ImportDescriptor,
    diags: &mut Vec<String>,
) {
    let cfg_index = match cfg.index_by_name_mut(&index.name) {
        Some(i) => i,
        None => {
            diags.push(format!(
                "Index {} not found in tablespace meta-data file.",
                index.name
            ));
            return;
        }
    };

    if cfg_index.n_fields as usize != index.fields.len() {
        diags.push(format!(
            "Index {} field count {} doesn't match tablespace metadata file value {}",
            index.name,
            index.fields.len(),
            cfg_index.n_fields
        ));
        return;
    }

    cfg_index.srv_index = Some(live_ordinal);

    for (pos, (field, cfg_field)) in index.fields.iter().zip(&cfg_index.fields).enumerate() {
        if field.name != cfg_field.name {
            diags.push(format!(
                "Index field name {} doesn't match tablespace metadata field name {} \
                 for field position {}",
                field.name, cfg_field.name, pos
            ));
        }
        if field.prefix_len != cfg_field.prefix_len {
            diags.push(format!(
                "Index {} field {} prefix len {} doesn't match metadata file value {}",
                index.name, field.name, field.prefix_len, cfg_field.prefix_len
            ));
        }
        if field.fixed_len != cfg_field.fixed_len {
            diags.push(format!(
                "Index {} field {} fixed len {} doesn't match metadata file value {}",
                index.name, field.name, field.fixed_len, cfg_field.fixed_len
            ));
        }
    }
}

/// Verify that the exported schema matches the live table definition.
///
/// On success every descriptor index has its `srv_index` resolved. On
/// failure all accumulated diagnostics are returned (and logged) as one
/// [`ImportError::SchemaMismatch`].
pub fn match_schema(table: &TableDef, cfg: &mut ImportDescriptor) -> Result<(), ImportError> {
    let mut diags = Vec::new();

    // Coarse shape checks first; finer matching is meaningless if these fail.
    let flag_mismatch = (table.flags ^ cfg.flags) & !DICT_TF_MASK_DATA_DIR;
    if flag_mismatch != 0 {
        diags.push(format!(
            "Table flags don't match, server table has 0x{:x} and the meta-data \
             file has 0x{:x}; .cfg file uses {}",
            table.flags,
            cfg.flags,
            row_format_name(cfg.flags)
        ));
    } else if table.columns.len() != cfg.columns.len() {
        diags.push(format!(
            "Number of columns don't match, table has {} columns but the \
             tablespace meta-data file has {} columns",
            table.columns.len(),
            cfg.columns.len()
        ));
    } else if table.indexes.len() != cfg.indexes.len() {
        // It is easy for the user to create a table matching the export.
        diags.push(format!(
            "Number of indexes don't match, table has {} indexes but the \
             tablespace meta-data file has {} indexes",
            table.indexes.len(),
            cfg.indexes.len()
        ));
    } else {
        match_table_columns(table, cfg, &mut diags);
        for (ordinal, index) in table.indexes.iter().enumerate() {
            match_index_columns(ordinal, index, cfg, &mut diags);
        }
    }

    if diags.is_empty() {
        Ok(())
    } else {
        for diag in &diags {
            log::error!("Schema mismatch: {}", diag);
        }
        Err(ImportError::SchemaMismatch(diags))
    }
}

/// Transfer the exported root page numbers onto the live indexes, matched
/// by name. Only valid after a successful [`match_schema`].
pub fn set_root_by_name(table: &mut TableDef, cfg: &ImportDescriptor) {
    for cfg_index in &cfg.indexes {
        if let Some(index) = table.indexes.iter_mut().find(|i| i.name == cfg_index.name) {
            index.root_page = cfg_index.page_no;
        }
    }
}

/// Pair discovered roots with live indexes by ordinal position, renaming
/// the synthesized descriptor entries after the live indexes.
///
/// This is inherently best-effort: nothing ties a discovered root to a
/// particular live index beyond its position, so the pairing is logged as a
/// warning for the operator.
pub fn set_root_by_heuristic(
    table: &mut TableDef,
    cfg: &mut ImportDescriptor,
) -> Result<(), ImportError> {
    if table.indexes.len() != cfg.indexes.len() {
        log::warn!(
            "Table {} should have {} indexes but the tablespace has {} indexes",
            table.name,
            table.indexes.len(),
            cfg.indexes.len()
        );
    }

    let mut slot = 0usize;
    for (ordinal, index) in table.indexes.iter_mut().enumerate() {
        if index.is_fts() {
            index.corrupted = true;
            log::warn!("Skipping FTS index: {}", index.name);
            continue;
        }
        if slot >= cfg.indexes.len() {
            break;
        }

        let cfg_index = &mut cfg.indexes[slot];
        log::warn!(
            "Pairing discovered root page {} (exporter index id {}) with index {} \
             by ordinal position; no metadata is available to verify this",
            cfg_index.page_no,
            cfg_index.id,
            index.name
        );
        cfg_index.name = index.name.clone();
        cfg_index.srv_index = Some(ordinal);
        index.root_page = cfg_index.page_no;
        slot += 1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::innodb::metadata::{
        ColumnDescriptor, FieldDescriptor, ImportDescriptor, IndexDescriptor, IndexStats,
        INDEX_TYPE_CLUSTERED, INDEX_TYPE_UNIQUE,
    };

    fn sample_cfg() -> ImportDescriptor {
        ImportDescriptor {
            version: CFG_VERSION_V1,
            hostname: "host".into(),
            table_name: "test/t1".into(),
            autoinc: 0,
            page_size: SIZE_PAGE_DEFAULT,
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
                    prtype: 0,
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
            indexes: vec![IndexDescriptor {
                id: 900,
                space: 5,
                page_no: 3,
                type_bits: INDEX_TYPE_CLUSTERED | INDEX_TYPE_UNIQUE,
                trx_id_offset: 8,
                n_user_defined: 1,
                n_uniq: 1,
                n_nullable: 1,
                n_fields: 2,
                name: "PRIMARY".into(),
                fields: vec![
                    FieldDescriptor { prefix_len: 0, fixed_len: 8, name: "id".into() },
                    FieldDescriptor { prefix_len: 0, fixed_len: 0, name: "val".into() },
                ],
                srv_index: None,
                stats: IndexStats::default(),
            }],
            missing: false,
        }
    }

    /// A live table definition structurally identical to `sample_cfg`.
    fn sample_table() -> TableDef {
        let cfg = sample_cfg();
        TableDef {
            name: "test/t1".into(),
            id: 11,
            flags: cfg.flags,
            space_id: 30,
            columns: cfg
                .columns
                .iter()
                .map(|c| ColumnDef {
                    name: c.name.clone(),
                    prtype: c.prtype,
                    mtype: c.mtype,
                    len: c.len,
                    mbminlen: c.mbminlen,
                    mbmaxlen: c.mbmaxlen,
                    ind: c.ind,
                    ord_part: c.ord_part,
                    max_prefix: c.max_prefix,
                })
                .collect(),
            indexes: cfg
                .indexes
                .iter()
                .map(|i| IndexDef {
                    name: i.name.clone(),
                    id: i.id + 1000,
                    root_page: FIL_NULL,
                    type_bits: i.type_bits,
                    n_uniq: i.n_uniq,
                    n_nullable: i.n_nullable,
                    fields: i
                        .fields
                        .iter()
                        .map(|f| FieldDef {
                            name: f.name.clone(),
                            prefix_len: f.prefix_len,
                            fixed_len: f.fixed_len,
                        })
                        .collect(),
                    corrupted: false,
                })
                .collect(),
            row_id_generated: false,
            file_unreadable: true,
            autoinc: 0,
        }
    }

    #[test]
    fn test_identical_schemas_match() {
        let table = sample_table();
        let mut cfg = sample_cfg();
        match_schema(&table, &mut cfg).unwrap();
        assert_eq!(cfg.indexes[0].srv_index, Some(0));
    }

    #[test]
    fn test_single_field_difference_named_in_diagnostics() {
        let table = sample_table();
        let mut bad_cfg = sample_cfg();
        bad_cfg.columns[1].len = 32;
        match match_schema(&table, &mut bad_cfg) {
            Err(ImportError::SchemaMismatch(diags)) => {
                assert!(diags.iter().any(|d| d.contains("val")), "{:?}", diags);
            }
            other => panic!("expected SchemaMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_multiple_diagnostics_accumulate() {
        let table = sample_table();
        let mut cfg = sample_cfg();
        cfg.columns[0].mtype = 9;
        cfg.columns[1].len = 99;
        cfg.indexes[0].fields[0].fixed_len = 4;

        match match_schema(&table, &mut cfg) {
            Err(ImportError::SchemaMismatch(diags)) => {
                assert!(diags.len() >= 3, "{:?}", diags);
            }
            other => panic!("expected SchemaMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_flag_mismatch_reports_row_format() {
        let table = sample_table();
        let mut cfg = sample_cfg();
        cfg.flags = DICT_TF_COMPACT; // COMPACT, not DYNAMIC

        match match_schema(&table, &mut cfg) {
            Err(ImportError::SchemaMismatch(diags)) => {
                assert!(diags[0].contains("ROW_FORMAT=COMPACT"), "{:?}", diags);
            }
            other => panic!("expected SchemaMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_index_count_mismatch() {
        let mut table = sample_table();
        table.indexes.push(IndexDef {
            name: "idx_extra".into(),
            id: 5,
            root_page: FIL_NULL,
            type_bits: 0,
            n_uniq: 1,
            n_nullable: 0,
            fields: vec![],
            corrupted: false,
        });
        let mut cfg = sample_cfg();

        match match_schema(&table, &mut cfg) {
            Err(ImportError::SchemaMismatch(diags)) => {
                assert!(diags[0].contains("Number of indexes"));
            }
            other => panic!("expected SchemaMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_set_root_by_name() {
        let mut table = sample_table();
        let mut cfg = sample_cfg();
        match_schema(&table, &mut cfg).unwrap();
        set_root_by_name(&mut table, &cfg);
        assert_eq!(table.indexes[0].root_page, 3);
    }

    #[test]
    fn test_set_root_by_heuristic_renames_and_pairs() {
        let mut table = sample_table();
        let mut cfg = sample_cfg();
        cfg.indexes[0].name = "index_900".into(); // synthesized name

        set_root_by_heuristic(&mut table, &mut cfg).unwrap();
        assert_eq!(cfg.indexes[0].name, "PRIMARY");
        assert_eq!(cfg.indexes[0].srv_index, Some(0));
        assert_eq!(table.indexes[0].root_page, 3);
    }

    #[test]
    fn test_row_format_names() {
        assert_eq!(row_format_name(0), "ROW_FORMAT=REDUNDANT");
        assert_eq!(row_format_name(DICT_TF_COMPACT), "ROW_FORMAT=COMPACT");
        assert_eq!(
            row_format_name(DICT_TF_COMPACT | DICT_TF_MASK_ATOMIC_BLOBS),
            "ROW_FORMAT=DYNAMIC"
        );
        assert_eq!(
            row_format_name(DICT_TF_COMPACT | (4 << DICT_TF_POS_ZIP_SSIZE)),
            "ROW_FORMAT=COMPRESSED KEY_BLOCK_SIZE=8"
        );
    }
}
