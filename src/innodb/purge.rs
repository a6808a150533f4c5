//! Index purge: remove the delete-marked records the conversion pass left
//! behind.
//!
//! The conversion pass only removes a delete-marked record when doing so
//! needs no tree restructuring. Everything else is handled here after the
//! tablespace has been converted: the purge opens the index at its
//! leftmost leaf (descending along the first node pointer of each level)
//! and scans the leaf chain record by record. Surviving records are
//! counted; delete-marked records are removed with a pessimistic delete
//! that may unlink an emptied leaf from its sibling chain, free the page
//! and remove the referencing node pointer from the parent level
//! (recursively, if a parent empties in turn).
//!
//! Interruption is polled once per page transition, since the check is
//! comparatively expensive next to a record step. A sibling or child link
//! that does not lead where it claims is corruption.
//!
//! The final survivor count is returned for cross-checking against the row
//! count gathered during conversion; the caller treats a mismatch as a
//! per-index warning, not a fatal error.

use byteorder::{BigEndian, ByteOrder};

use crate::innodb::catalog::Interrupt;
use crate::innodb::checksum::{recalculate_checksum, ChecksumAlgorithm};
use crate::innodb::codec::PageCodec;
use crate::innodb::constants::*;
use crate::innodb::page::{
    full_crc32, page_get_page_no, page_is_empty, page_is_leaf, page_set_next, page_set_prev,
};
use crate::innodb::record::{
    delete_record, node_ptr_child, rec_is_deleted, rec_is_min_rec, rec_next, walk_records,
    RecordLayout,
};
use crate::innodb::tablespace::TablespaceFile;
use crate::ImportError;

/// One purge pass over one index.
pub struct IndexPurge<'a> {
    ts: &'a mut TablespaceFile,
    codec: &'a mut PageCodec,
    layout: RecordLayout,
    index_name: String,
    root: u32,
    clustered: bool,
    interrupt: Interrupt,
    checksum: ChecksumAlgorithm,
    n_rows: u64,
    n_purged: u64,
}

impl<'a> IndexPurge<'a> {
    pub fn new(
        ts: &'a mut TablespaceFile,
        codec: &'a mut PageCodec,
        layout: RecordLayout,
        index_name: &str,
        root: u32,
        interrupt: Interrupt,
    ) -> Self {
        let checksum = if full_crc32(ts.space_flags()) {
            ChecksumAlgorithm::FullCrc32
        } else {
            ChecksumAlgorithm::Crc32c
        };
        let clustered = layout.clustered;
        IndexPurge {
            ts,
            codec,
            layout,
            index_name: index_name.to_string(),
            root,
            clustered,
            interrupt,
            checksum,
            n_rows: 0,
            n_purged: 0,
        }
    }

    /// Records removed by this pass.
    pub fn n_purged(&self) -> u64 {
        self.n_purged
    }

    /// Scan the index and purge every delete-marked record. Returns the
    /// number of surviving (non-deleted) records.
    pub fn garbage_collect(&mut self) -> Result<u64, ImportError> {
        log::info!("Phase II - Purge records from index {}", self.index_name);

        let mut page_no = self.leftmost_leaf()?;
        let mut visited = 0u64;

        loop {
            visited += 1;
            if visited > self.ts.page_count() {
                return Err(ImportError::Corruption(format!(
                    "index {}: leaf chain does not terminate",
                    self.index_name
                )));
            }

            let mut page = self.ts.read_logical_page(self.codec, page_no)?;
            if page_get_page_no(&page) != page_no {
                return Err(ImportError::Corruption(format!(
                    "index {}: sibling link leads to page {} which claims to be page {}",
                    self.index_name,
                    page_no,
                    page_get_page_no(&page)
                )));
            }

            let next = BigEndian::read_u32(&page[FIL_PAGE_NEXT..]);
            let dirty = self.purge_page(&mut page, page_no)?;

            if page_is_empty(&page) && page_no != self.root {
                self.unlink_empty_leaf(page_no, &page)?;
            } else if dirty {
                recalculate_checksum(&mut page, self.ts.logical_size(), self.checksum);
                self.ts.write_logical_page(self.codec, page_no, &page)?;
            }

            if next == FIL_NULL {
                break;
            }
            // Check after every page because the check is expensive.
            if self.interrupt.is_interrupted() {
                return Err(ImportError::Interrupted);
            }
            page_no = next;
        }

        Ok(self.n_rows)
    }

    /// Descend along the leftmost node pointers to the first leaf.
    fn leftmost_leaf(&mut self) -> Result<u32, ImportError> {
        let mut page_no = self.root;
        let mut hops = 0u32;

        loop {
            let page = self.ts.read_logical_page(self.codec, page_no)?;
            if page_is_leaf(&page) {
                return Ok(page_no);
            }

            hops += 1;
            if hops > 64 {
                return Err(ImportError::Corruption(format!(
                    "index {} deeper than 64 levels",
                    self.index_name
                )));
            }

            let records = walk_records(&page)?;
            let first = *records.first().ok_or_else(|| {
                ImportError::Corruption(format!(
                    "index {}: non-leaf page {} is empty",
                    self.index_name, page_no
                ))
            })?;
            let rec = self.layout.parse_node_ptr(&page, first)?;
            let child = node_ptr_child(&page, &rec);
            if child == FIL_NULL || child as u64 >= self.ts.page_count() {
                return Err(ImportError::Corruption(format!(
                    "index {}: node pointer on page {} references invalid child {}",
                    self.index_name, page_no, child
                )));
            }
            page_no = child;
        }
    }

    /// Remove every delete-marked record on one leaf page. Returns whether
    /// the page was modified.
    fn purge_page(&mut self, page: &mut [u8], page_no: u32) -> Result<bool, ImportError> {
        let ps = self.ts.logical_size() as usize;
        let mut dirty = false;
        let mut cursor = PAGE_NEW_INFIMUM;

        loop {
            let origin = match rec_next(page, cursor) {
                Some(next) => next,
                None => {
                    return Err(ImportError::Corruption(format!(
                        "index {}: record chain broken on page {}",
                        self.index_name, page_no
                    )))
                }
            };
            if origin == PAGE_NEW_SUPREMUM {
                break;
            }

            // Leave the hidden instant metadata record alone.
            if self.clustered && rec_is_min_rec(page, origin) {
                cursor = origin;
                continue;
            }

            if rec_is_deleted(page, origin) {
                let rec = self.layout.parse_leaf(page, origin)?;
                delete_record(page, ps, origin, &rec)?;
                self.n_purged += 1;
                dirty = true;
                // the cursor's successor is now the following record
                continue;
            }

            self.n_rows += 1;
            cursor = origin;
        }

        Ok(dirty)
    }

    /// A leaf emptied by the purge: unlink it from the sibling chain, free
    /// the page and remove the node pointer that references it.
    fn unlink_empty_leaf(&mut self, page_no: u32, page: &[u8]) -> Result<(), ImportError> {
        let prev = BigEndian::read_u32(&page[FIL_PAGE_PREV..]);
        let next = BigEndian::read_u32(&page[FIL_PAGE_NEXT..]);

        if prev != FIL_NULL {
            let mut sibling = self.ts.read_logical_page(self.codec, prev)?;
            if page_get_page_no(&sibling) != prev {
                return Err(ImportError::Corruption(format!(
                    "index {}: previous-page link of page {} is inconsistent",
                    self.index_name, page_no
                )));
            }
            page_set_next(&mut sibling, next);
            recalculate_checksum(&mut sibling, self.ts.logical_size(), self.checksum);
            self.ts.write_logical_page(self.codec, prev, &sibling)?;
        }
        if next != FIL_NULL {
            let mut sibling = self.ts.read_logical_page(self.codec, next)?;
            if page_get_page_no(&sibling) != next {
                return Err(ImportError::Corruption(format!(
                    "index {}: next-page link of page {} is inconsistent",
                    self.index_name, page_no
                )));
            }
            page_set_prev(&mut sibling, prev);
            recalculate_checksum(&mut sibling, self.ts.logical_size(), self.checksum);
            self.ts.write_logical_page(self.codec, next, &sibling)?;
        }

        // The page itself becomes a freshly-deallocated page.
        let zeros = vec![0u8; self.ts.physical_size() as usize];
        self.ts.write_page(page_no, &zeros)?;

        if !self.remove_node_ptr(self.root, page_no)? {
            return Err(ImportError::Corruption(format!(
                "index {}: no node pointer references emptied page {}",
                self.index_name, page_no
            )));
        }

        Ok(())
    }

    /// Search the internal levels below `from` for the node pointer whose
    /// child is `target` and remove it. Returns whether it was found.
    fn remove_node_ptr(&mut self, from: u32, target: u32) -> Result<bool, ImportError> {
        let mut page = self.ts.read_logical_page(self.codec, from)?;
        if page_is_leaf(&page) {
            return Ok(false);
        }

        let ps = self.ts.logical_size() as usize;
        let mut children = Vec::new();

        for origin in walk_records(&page)? {
            let rec = self.layout.parse_node_ptr(&page, origin)?;
            let child = node_ptr_child(&page, &rec);
            if child == FIL_NULL || child as u64 >= self.ts.page_count() {
                return Err(ImportError::Corruption(format!(
                    "index {}: node pointer on page {} references invalid child {}",
                    self.index_name, from, child
                )));
            }

            if child == target {
                delete_record(&mut page, ps, origin, &rec)?;
                recalculate_checksum(&mut page, self.ts.logical_size(), self.checksum);
                self.ts.write_logical_page(self.codec, from, &page)?;

                if page_is_empty(&page) && from != self.root {
                    self.unlink_empty_internal(from, &page)?;
                }
                return Ok(true);
            }
            children.push(child);
        }

        for child in children {
            if self.remove_node_ptr(child, target)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// An internal page emptied of its last node pointer: unlink it like a
    /// leaf and drop its own parent reference.
    fn unlink_empty_internal(&mut self, page_no: u32, page: &[u8]) -> Result<(), ImportError> {
        self.unlink_empty_leaf(page_no, page)
    }
}
