//! Export metadata (`.cfg`) side-file: reader, writer and descriptors.
//!
//! A tablespace export produces, next to the `.ibd` file, a binary metadata
//! file describing the schema snapshot at export time: hostname, table name,
//! next autoincrement value, page size, table flags, the ordered column list
//! and the ordered index list with per-index fields and root page numbers.
//! All integers are big-endian; every string is length-prefixed, with the
//! length counting the terminating NUL.
//!
//! Reading goes through [`CfgReader`], which performs exact-size reads and
//! names the missing field in every error. The NUL-inclusive string
//! convention is decoded in exactly one place. Column, index and field
//! counts are checked against generous ceilings so a truncated or corrupt
//! file cannot be half-parsed into absurd allocations.
//!
//! Only format version 1 is recognized; anything else is
//! [`ImportError::UnsupportedVersion`] and the caller may elect to proceed
//! as if the file were absent.

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::innodb::constants::*;
use crate::innodb::record::{FieldSpec, RecordLayout};
use crate::ImportError;

/// Index type bit: clustered index.
pub const INDEX_TYPE_CLUSTERED: u32 = 1;
/// Index type bit: unique index.
pub const INDEX_TYPE_UNIQUE: u32 = 2;
/// Index type bit: full-text index (never importable, always skipped).
pub const INDEX_TYPE_FTS: u32 = 32;

/// One column of the exported table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    /// Precise type (collation, NOT NULL flag, unsigned flag, ...).
    pub prtype: u32,
    /// Main type.
    pub mtype: u32,
    /// Column length in bytes.
    pub len: u32,
    /// Minimum character length in a multi-byte charset.
    pub mbminlen: u32,
    /// Maximum character length in a multi-byte charset.
    pub mbmaxlen: u32,
    /// Ordinal position in the table.
    pub ind: u32,
    /// Nonzero if the column participates in an ordering (is indexed).
    pub ord_part: u32,
    /// Maximum indexed prefix length.
    pub max_prefix: u32,
    /// Column name.
    pub name: String,
}

impl ColumnDescriptor {
    /// True if the column cannot be NULL.
    pub fn not_null(&self) -> bool {
        self.prtype & DATA_NOT_NULL != 0
    }
}

/// One field of an exported index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDescriptor {
    /// Indexed prefix length (0 = whole column).
    pub prefix_len: u32,
    /// Fixed stored length (0 = variable).
    pub fixed_len: u32,
    /// Field (column) name.
    pub name: String,
}

/// Row statistics gathered for one index during the conversion pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IndexStats {
    /// Rows that are not delete-marked.
    pub n_rows: u64,
    /// Delete-marked rows seen.
    pub n_deleted: u64,
    /// Delete-marked rows removed in place.
    pub n_purged: u64,
    /// Delete-marked rows left for the purge pass.
    pub n_purge_failed: u64,
}

/// One index of the exported table definition.
#[derive(Debug, Clone, Serialize)]
pub struct IndexDescriptor {
    /// Index id assigned by the exporting server.
    pub id: u64,
    /// Tablespace id on the exporting server.
    pub space: u32,
    /// Root page number inside the tablespace file.
    pub page_no: u32,
    /// Index type bitmask.
    pub type_bits: u32,
    /// Byte offset of DB_TRX_ID in clustered records with a fixed-length
    /// prefix, or 0 when the prefix is variable.
    pub trx_id_offset: u32,
    /// User-defined column count.
    pub n_user_defined: u32,
    /// Number of fields that uniquely identify a row.
    pub n_uniq: u32,
    /// Nullable field count.
    pub n_nullable: u32,
    /// Total field count.
    pub n_fields: u32,
    /// Index name.
    pub name: String,
    /// Ordered fields.
    pub fields: Vec<FieldDescriptor>,
    /// Ordinal of the matched live index, set by the schema matcher.
    #[serde(skip)]
    pub srv_index: Option<usize>,
    /// Conversion statistics.
    #[serde(skip)]
    pub stats: IndexStats,
}

impl IndexDescriptor {
    /// True for the clustered index.
    pub fn is_clustered(&self) -> bool {
        self.type_bits & INDEX_TYPE_CLUSTERED != 0
    }
}

/// Parsed contents of the `.cfg` file, plus the live-root bookkeeping the
/// import attaches while it runs.
#[derive(Debug, Clone, Serialize)]
pub struct ImportDescriptor {
    /// Metadata format version.
    pub version: u32,
    /// Hostname of the exporting server.
    pub hostname: String,
    /// Table name on the exporting server.
    pub table_name: String,
    /// Next autoincrement value.
    pub autoinc: u64,
    /// Logical page size of the exporting server.
    pub page_size: u32,
    /// Table flags.
    pub flags: u32,
    /// Ordered columns.
    pub columns: Vec<ColumnDescriptor>,
    /// Ordered indexes, clustered first.
    pub indexes: Vec<IndexDescriptor>,
    /// True when no metadata file was found and the descriptor was
    /// synthesized from the tablespace itself.
    #[serde(skip)]
    pub missing: bool,
}

impl ImportDescriptor {
    /// ROW_FORMAT=COMPRESSED physical page size derived from the table
    /// flags, or 0 for uncompressed row formats.
    pub fn zip_size(&self) -> u32 {
        let ssize = (self.flags & DICT_TF_MASK_ZIP_SSIZE) >> DICT_TF_POS_ZIP_SSIZE;
        if ssize == 0 {
            0
        } else {
            1u32 << (ssize + 9)
        }
    }

    /// Find a column's ordinal by name.
    pub fn find_col(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Find an index by name.
    pub fn index_by_name(&self, name: &str) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Find an index by name, mutably.
    pub fn index_by_name_mut(&mut self, name: &str) -> Option<&mut IndexDescriptor> {
        self.indexes.iter_mut().find(|i| i.name == name)
    }

    /// Find an index by its exporter-assigned id.
    pub fn index_by_id(&self, id: u64) -> Option<usize> {
        self.indexes.iter().position(|i| i.id == id)
    }

    /// Number of surviving rows counted for an index during conversion.
    pub fn n_rows(&self, name: &str) -> u64 {
        self.index_by_name(name).map_or(0, |i| i.stats.n_rows)
    }

    /// True if the conversion pass left delete-marked rows behind in the
    /// named index.
    pub fn requires_purge(&self, name: &str) -> bool {
        self.index_by_name(name)
            .is_some_and(|i| i.stats.n_purge_failed > 0)
    }

    /// Build the record layout of one index from its fields and the table
    /// columns (for per-field nullability).
    pub fn record_layout(&self, index: &IndexDescriptor) -> RecordLayout {
        let fields = index
            .fields
            .iter()
            .map(|f| FieldSpec {
                fixed_len: f.fixed_len as u16,
                nullable: self
                    .columns
                    .iter()
                    .find(|c| c.name == f.name)
                    .map(|c| !c.not_null())
                    .unwrap_or(false),
            })
            .collect();

        RecordLayout {
            fields,
            n_uniq: index.n_uniq as usize,
            clustered: index.is_clustered(),
        }
    }
}

/// Exact-size reader over the metadata file. Every read names the field it
/// was fetching so short reads surface as actionable I/O errors.
struct CfgReader<R: Read> {
    inner: R,
}

impl<R: Read> CfgReader<R> {
    fn new(inner: R) -> Self {
        CfgReader { inner }
    }

    fn read_exact(&mut self, buf: &mut [u8], what: &str) -> Result<(), ImportError> {
        self.inner
            .read_exact(buf)
            .map_err(|e| ImportError::Io(format!("while reading {}: {}", what, e)))
    }

    fn read_u32(&mut self, what: &str) -> Result<u32, ImportError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf, what)?;
        Ok(BigEndian::read_u32(&buf))
    }

    fn read_u64(&mut self, what: &str) -> Result<u64, ImportError> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf, what)?;
        Ok(BigEndian::read_u64(&buf))
    }

    /// Read a length-prefixed string. The prefix counts the terminating
    /// NUL; the NUL must sit exactly at the end and nowhere earlier.
    fn read_string(&mut self, max_len: u32, what: &str) -> Result<String, ImportError> {
        let len = self.read_u32(what)?;
        if len == 0 || len > max_len {
            return Err(ImportError::Corruption(format!(
                "{} length {} is invalid",
                what, len
            )));
        }

        let mut buf = vec![0u8; len as usize];
        self.read_exact(&mut buf, what)?;

        match buf.iter().position(|&b| b == 0) {
            Some(pos) if pos == buf.len() - 1 => {}
            _ => {
                return Err(ImportError::Corruption(format!(
                    "{} is not NUL-terminated at its declared length",
                    what
                )))
            }
        }
        buf.pop();

        String::from_utf8(buf)
            .map_err(|_| ImportError::Corruption(format!("{} is not valid UTF-8", what)))
    }
}

fn read_columns<R: Read>(
    r: &mut CfgReader<R>,
    n_cols: u32,
) -> Result<Vec<ColumnDescriptor>, ImportError> {
    let mut columns = Vec::with_capacity(n_cols as usize);

    for i in 0..n_cols {
        let what = format!("table column meta-data (column {})", i);
        let prtype = r.read_u32(&what)?;
        let mtype = r.read_u32(&what)?;
        let len = r.read_u32(&what)?;
        let mbminmax = r.read_u32(&what)?;
        let ind = r.read_u32(&what)?;
        let ord_part = r.read_u32(&what)?;
        let max_prefix = r.read_u32(&what)?;
        let name = r.read_string(CFG_MAX_COL_NAME_LEN, "table column name")?;

        columns.push(ColumnDescriptor {
            prtype,
            mtype,
            len,
            mbminlen: mbminmax % 5,
            mbmaxlen: mbminmax / 5,
            ind: ind & 0x3FF,
            ord_part,
            max_prefix,
            name,
        });
    }

    Ok(columns)
}

fn read_index_fields<R: Read>(
    r: &mut CfgReader<R>,
    n_fields: u32,
) -> Result<Vec<FieldDescriptor>, ImportError> {
    let mut fields = Vec::with_capacity(n_fields as usize);

    for i in 0..n_fields {
        let what = format!("index fields (field {})", i);
        let prefix_len = r.read_u32(&what)? & CFG_FIELD_PREFIX_MASK;
        let fixed_len = r.read_u32(&what)? & CFG_FIELD_FIXED_MASK;
        let name = r.read_string(CFG_MAX_COL_NAME_LEN, "index field name")?;

        fields.push(FieldDescriptor {
            prefix_len,
            fixed_len,
            name,
        });
    }

    Ok(fields)
}

fn read_indexes<R: Read>(r: &mut CfgReader<R>) -> Result<Vec<IndexDescriptor>, ImportError> {
    let n_indexes = r.read_u32("number of indexes")?;
    if n_indexes == 0 {
        return Err(ImportError::Corruption(
            "number of indexes in the meta-data file is 0".into(),
        ));
    }
    if n_indexes > CFG_MAX_INDEXES {
        return Err(ImportError::Corruption(format!(
            "number of indexes in the meta-data file is too high: {}",
            n_indexes
        )));
    }

    let mut indexes = Vec::with_capacity(n_indexes as usize);

    for i in 0..n_indexes {
        let what = format!("index meta-data (index {})", i);
        let id = r.read_u64(&what)?;
        let space = r.read_u32(&what)?;
        let page_no = r.read_u32(&what)?;
        let type_bits = r.read_u32(&what)?;
        let trx_id_offset = r.read_u32(&what)?;
        let n_user_defined = r.read_u32(&what)?;
        let n_uniq = r.read_u32(&what)?;
        let n_nullable = r.read_u32(&what)?;
        let n_fields = r.read_u32(&what)?;
        let name = r.read_string(CFG_MAX_NAME_LEN, "index name")?;

        if n_fields > CFG_MAX_FIELDS {
            return Err(ImportError::Corruption(format!(
                "index {} field count {} is too high",
                name, n_fields
            )));
        }

        let fields = read_index_fields(r, n_fields)?;

        indexes.push(IndexDescriptor {
            id,
            space,
            page_no,
            type_bits,
            trx_id_offset,
            n_user_defined,
            n_uniq,
            n_nullable,
            n_fields,
            name,
            fields,
            srv_index: None,
            stats: IndexStats::default(),
        });
    }

    Ok(indexes)
}

fn read_v1<R: Read>(
    r: &mut CfgReader<R>,
    srv_page_size: u32,
) -> Result<ImportDescriptor, ImportError> {
    let hostname = r.read_string(CFG_MAX_NAME_LEN, "meta-data export hostname")?;
    let table_name = r.read_string(CFG_MAX_NAME_LEN, "meta-data table name")?;
    let autoinc = r.read_u64("autoinc value")?;

    let page_size = r.read_u32("meta-data header")?;
    if page_size != srv_page_size {
        return Err(ImportError::SchemaMismatch(vec![format!(
            "Tablespace to be imported has a different page size than this \
             server. Server page size is {}, whereas tablespace page size is {}",
            srv_page_size, page_size
        )]));
    }

    let flags = r.read_u32("meta-data header")?;
    let n_cols = r.read_u32("meta-data header")?;

    if flags & !DICT_TF_MASK_VALID != 0 {
        return Err(ImportError::Corruption(format!(
            "invalid table flags: 0x{:x}",
            flags
        )));
    }
    if n_cols == 0 || n_cols > CFG_MAX_COLS {
        return Err(ImportError::Corruption(format!(
            "number of columns {} is invalid",
            n_cols
        )));
    }

    log::info!(
        "Importing tablespace for table '{}' that was exported from host '{}'",
        table_name,
        hostname
    );

    let columns = read_columns(r, n_cols)?;
    let indexes = read_indexes(r)?;

    Ok(ImportDescriptor {
        version: CFG_VERSION_V1,
        hostname,
        table_name,
        autoinc,
        page_size,
        flags,
        columns,
        indexes,
        missing: false,
    })
}

/// Read a metadata stream. `srv_page_size` is the destination server's
/// configured page size; a mismatch fails before anything else is parsed.
pub fn read_meta_data<R: Read>(
    reader: R,
    srv_page_size: u32,
) -> Result<ImportDescriptor, ImportError> {
    let mut r = CfgReader::new(reader);

    let version = r.read_u32("meta-data version")?;
    match version {
        CFG_VERSION_V1 => read_v1(&mut r, srv_page_size),
        other => Err(ImportError::UnsupportedVersion(other)),
    }
}

/// Read the `.cfg` file at `path`.
pub fn read_cfg<P: AsRef<Path>>(
    path: P,
    srv_page_size: u32,
) -> Result<ImportDescriptor, ImportError> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| ImportError::Io(format!("cannot open {}: {}", path.display(), e)))?;
    read_meta_data(BufReader::new(file), srv_page_size)
}

fn write_string<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
    let len = s.len() as u32 + 1;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(s.as_bytes())?;
    w.write_all(&[0u8])
}

/// Serialize a descriptor in the v1 format (the export side of the
/// pipeline, and the fixture builder for round-trip tests).
pub fn write_meta_data<W: Write>(w: &mut W, cfg: &ImportDescriptor) -> Result<(), ImportError> {
    let io = |e: std::io::Error| ImportError::Io(format!("while writing meta-data: {}", e));

    w.write_all(&CFG_VERSION_V1.to_be_bytes()).map_err(io)?;
    write_string(w, &cfg.hostname).map_err(io)?;
    write_string(w, &cfg.table_name).map_err(io)?;
    w.write_all(&cfg.autoinc.to_be_bytes()).map_err(io)?;
    w.write_all(&cfg.page_size.to_be_bytes()).map_err(io)?;
    w.write_all(&cfg.flags.to_be_bytes()).map_err(io)?;
    w.write_all(&(cfg.columns.len() as u32).to_be_bytes())
        .map_err(io)?;

    for col in &cfg.columns {
        w.write_all(&col.prtype.to_be_bytes()).map_err(io)?;
        w.write_all(&col.mtype.to_be_bytes()).map_err(io)?;
        w.write_all(&col.len.to_be_bytes()).map_err(io)?;
        let mbminmax = col.mbmaxlen * 5 + col.mbminlen;
        w.write_all(&mbminmax.to_be_bytes()).map_err(io)?;
        w.write_all(&col.ind.to_be_bytes()).map_err(io)?;
        w.write_all(&col.ord_part.to_be_bytes()).map_err(io)?;
        w.write_all(&col.max_prefix.to_be_bytes()).map_err(io)?;
        write_string(w, &col.name).map_err(io)?;
    }

    w.write_all(&(cfg.indexes.len() as u32).to_be_bytes())
        .map_err(io)?;

    for index in &cfg.indexes {
        w.write_all(&index.id.to_be_bytes()).map_err(io)?;
        w.write_all(&index.space.to_be_bytes()).map_err(io)?;
        w.write_all(&index.page_no.to_be_bytes()).map_err(io)?;
        w.write_all(&index.type_bits.to_be_bytes()).map_err(io)?;
        w.write_all(&index.trx_id_offset.to_be_bytes()).map_err(io)?;
        w.write_all(&index.n_user_defined.to_be_bytes()).map_err(io)?;
        w.write_all(&index.n_uniq.to_be_bytes()).map_err(io)?;
        w.write_all(&index.n_nullable.to_be_bytes()).map_err(io)?;
        w.write_all(&index.n_fields.to_be_bytes()).map_err(io)?;
        write_string(w, &index.name).map_err(io)?;

        for field in &index.fields {
            w.write_all(&field.prefix_len.to_be_bytes()).map_err(io)?;
            w.write_all(&field.fixed_len.to_be_bytes()).map_err(io)?;
            write_string(w, &field.name).map_err(io)?;
        }
    }

    Ok(())
}

/// Write the `.cfg` file at `path`.
pub fn write_cfg<P: AsRef<Path>>(path: P, cfg: &ImportDescriptor) -> Result<(), ImportError> {
    let path = path.as_ref();
    let file = File::create(path)
        .map_err(|e| ImportError::Io(format!("cannot create {}: {}", path.display(), e)))?;
    let mut w = BufWriter::new(file);
    write_meta_data(&mut w, cfg)?;
    w.flush()
        .map_err(|e| ImportError::Io(format!("cannot flush {}: {}", path.display(), e)))
}
