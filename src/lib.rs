//! InnoDB tablespace import pipeline.
//!
//! The `innodb-import` crate (library name `ibimport`) re-binds a physical
//! `.ibd` tablespace file produced by another server instance (or the same
//! instance after a `DISCARD TABLESPACE`) into a running destination
//! server: it validates structural compatibility against the exported
//! schema snapshot, rewrites every page's embedded identifiers, repairs
//! BLOB back-references, purges stale deleted rows, and commits the result
//! atomically into the catalog. On any failure the table is left discarded
//! and unreadable; there is no half-imported state.
//!
//! # Quick example
//!
//! ```no_run
//! use std::path::Path;
//! use ibimport::innodb::catalog::{Catalog, Interrupt, TxnFactory};
//! use ibimport::innodb::import::{import_tablespace, ImportContext, ImportOptions};
//! # fn table_definition() -> ibimport::innodb::schema::TableDef { unimplemented!() }
//!
//! let txn_factory = TxnFactory::new(128);
//! let mut catalog = Catalog::new();
//! let mut table = table_definition(); // from the data dictionary
//!
//! let mut ctx = ImportContext {
//!     txn_factory: &txn_factory,
//!     catalog: &mut catalog,
//!     interrupt: Interrupt::new(),
//!     srv_page_size: 16384,
//!     crypt: None,
//!     options: ImportOptions::default(),
//! };
//!
//! let report = import_tablespace(
//!     &mut ctx,
//!     &mut table,
//!     Path::new("test/t1.ibd"),
//!     Path::new("test/t1.cfg"),
//! ).unwrap();
//! println!("imported {} rows", report.n_rows);
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`innodb::import`] | The orchestrator: metadata → match → convert → purge → commit |
//! | [`innodb::metadata`] | `.cfg` side-file reader/writer and the import descriptors |
//! | [`innodb::schema`] | Live table definitions and the schema matcher |
//! | [`innodb::iterator`] | Batched tablespace iteration with per-page visitors |
//! | [`innodb::converter`] | The per-page rewrite pass and root-page discovery |
//! | [`innodb::purge`] | Leaf-level purge of delete-marked records |
//! | [`innodb::codec`] | Per-page decryption and (de)compression |
//! | [`innodb::instant`] | Instant-ALTER metadata validation |
//! | [`innodb::tablespace`] | Read-write file I/O and page-size detection |
//! | [`innodb::record`] | Compact record parsing, layout and in-page deletion |
//! | [`innodb::page`] | FIL/FSP/index header parsing and mutation |
//! | [`innodb::checksum`] | CRC-32C, legacy and full-CRC32 page checksums |
//! | [`innodb::catalog`] | Transactions, interrupts and catalog mutations |
//! | [`innodb::constants`] | InnoDB page/file structure constants |

pub mod innodb;

use thiserror::Error;

/// Errors returned by import operations.
#[derive(Error, Debug)]
pub enum ImportError {
    /// A read, write or flush failed; carries the file path and the OS
    /// error text.
    #[error("I/O error: {0}")]
    Io(String),

    /// A structural page or metadata inconsistency with no safe repair.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// A scratch-buffer allocation failed. Fatal; never retried.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// The exported schema does not match the live table definition; all
    /// collected diagnostics are reported together.
    #[error("Schema mismatch: {}", .0.join("; "))]
    SchemaMismatch(Vec<String>),

    /// The metadata file format is too new or too old.
    #[error("Unsupported meta-data version number ({0})")]
    UnsupportedVersion(u32),

    /// Cooperative cancellation was honored.
    #[error("Interrupted")]
    Interrupted,

    /// No transaction slot (undo segment) could be assigned.
    #[error("Too many concurrent transactions")]
    TooManyConcurrentTransactions,
}
