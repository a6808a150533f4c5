//! Explicit execution contexts and the catalog surface of the import.
//!
//! The import never touches ambient global state: cancellation arrives
//! through an [`Interrupt`] handle, the covering transaction is a
//! [`Transaction`] issued by a bounded [`TxnFactory`], and the only catalog
//! mutations the pipeline performs are `update_index_root` and
//! `update_discarded_flag`, staged on the transaction and applied by
//! [`Catalog::commit`].
//!
//! A transaction is committed even when the import fails; the failure path
//! discards the staged changes first, so committing only releases the
//! transaction's bookkeeping (the undo-segment analogue) without making the
//! table importable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::ImportError;

/// Cooperative cancellation flag, polled at batch and page-transition
/// granularity. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Interrupt::default()
    }

    /// Request cancellation. The current batch still runs to completion.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// One staged catalog mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogChange {
    IndexRoot {
        table_id: u64,
        index_id: u64,
        space_id: u32,
        page_no: u32,
        type_bits: u32,
    },
    DiscardedFlag {
        table_id: u64,
        discarded: bool,
    },
}

struct TxnSlot {
    active: Arc<AtomicUsize>,
}

impl Drop for TxnSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The transaction covering one import. Catalog changes are staged here and
/// only reach the catalog through [`Catalog::commit`].
pub struct Transaction {
    id: u64,
    changes: Vec<CatalogChange>,
    _slot: TxnSlot,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stage the root-page update for one index: one relational update per
    /// index, nothing else.
    pub fn update_index_root(
        &mut self,
        table_id: u64,
        index_id: u64,
        space_id: u32,
        page_no: u32,
        type_bits: u32,
    ) {
        self.changes.push(CatalogChange::IndexRoot {
            table_id,
            index_id,
            space_id,
            page_no,
            type_bits,
        });
    }

    /// Stage the discarded-flag update for the table.
    pub fn update_discarded_flag(&mut self, table_id: u64, discarded: bool) {
        self.changes.push(CatalogChange::DiscardedFlag {
            table_id,
            discarded,
        });
    }

    /// Drop every staged change; the failure path commits an empty
    /// transaction so the undo bookkeeping is released without mutating
    /// the catalog.
    pub fn discard_changes(&mut self) {
        self.changes.clear();
    }
}

/// Issues transactions up to a fixed concurrency bound.
pub struct TxnFactory {
    max_active: usize,
    active: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

impl TxnFactory {
    pub fn new(max_active: usize) -> Self {
        TxnFactory {
            max_active,
            active: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Begin a transaction, or fail with `TooManyConcurrentTransactions`
    /// when every slot (undo segment) is taken.
    pub fn begin(&self) -> Result<Transaction, ImportError> {
        let prev = self.active.fetch_add(1, Ordering::SeqCst);
        if prev >= self.max_active {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return Err(ImportError::TooManyConcurrentTransactions);
        }

        Ok(Transaction {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            changes: Vec::new(),
            _slot: TxnSlot {
                active: Arc::clone(&self.active),
            },
        })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// The slice of the data dictionary the import is allowed to mutate, plus
/// the system row-id generator.
#[derive(Debug, Default)]
pub struct Catalog {
    index_roots: HashMap<(u64, u64), (u32, u32, u32)>,
    discarded: HashMap<u64, bool>,
    row_id: u64,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    /// Apply the transaction's staged changes and consume it.
    pub fn commit(&mut self, txn: Transaction) {
        for change in &txn.changes {
            match *change {
                CatalogChange::IndexRoot {
                    table_id,
                    index_id,
                    space_id,
                    page_no,
                    type_bits,
                } => {
                    self.index_roots
                        .insert((table_id, index_id), (space_id, page_no, type_bits));
                }
                CatalogChange::DiscardedFlag {
                    table_id,
                    discarded,
                } => {
                    self.discarded.insert(table_id, discarded);
                }
            }
        }
    }

    /// Committed root entry for one index: (space id, page no, type bits).
    pub fn index_root(&self, table_id: u64, index_id: u64) -> Option<(u32, u32, u32)> {
        self.index_roots.get(&(table_id, index_id)).copied()
    }

    /// Committed discarded flag for the table, if any update reached the
    /// catalog.
    pub fn discarded_flag(&self, table_id: u64) -> Option<bool> {
        self.discarded.get(&table_id).copied()
    }

    /// Current system row id.
    pub fn row_id(&self) -> u64 {
        self.row_id
    }

    /// Advance the row-id generator past a row id observed in imported
    /// data. Never moves backwards.
    pub fn sync_row_id(&mut self, seen: u64) {
        if seen >= self.row_id {
            self.row_id = seen + 1;
        }
    }
}
