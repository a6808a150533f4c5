//! InnoDB tablespace file I/O.
//!
//! [`TablespaceFile`] opens a `.ibd` file read-write for the import, detects
//! the logical and physical page sizes from the FSP flags on page 0
//! (normalizing legacy flag garbage), and exposes page- and batch-granular
//! reads and writes plus an explicit flush to stable storage.
//!
//! Unlike a buffer-pool-backed tablespace, every access here is a direct,
//! synchronous file operation; the import owns the file exclusively until
//! the space is declared imported.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};

use crate::innodb::constants::*;
use crate::innodb::page::{
    self, is_valid_flags, logical_size_from_flags, physical_size_from_flags, zip_size_from_flags,
    FspHeader,
};
use crate::ImportError;

/// An open tablespace file with its detected geometry.
#[derive(Debug)]
pub struct TablespaceFile {
    file: std::fs::File,
    path: PathBuf,
    file_size: u64,
    space_id: u32,
    space_flags: u32,
    logical_size: u32,
    physical_size: u32,
    /// FSP_SIZE from the header page.
    fsp_size: u32,
    /// FSP_FREE_LIMIT from the header page; pages at or above this limit
    /// are by definition unallocated.
    free_limit: u32,
}

impl TablespaceFile {
    /// Open a tablespace file read-write and validate its geometry against
    /// the destination server's configured page size.
    pub fn open_rw<P: AsRef<Path>>(path: P, srv_page_size: u32) -> Result<Self, ImportError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| ImportError::Io(format!("cannot open {}: {}", path.display(), e)))?;

        let file_size = file
            .metadata()
            .map_err(|e| ImportError::Io(format!("cannot stat {}: {}", path.display(), e)))?
            .len();

        if file_size < (SIZE_FIL_HEAD + FSP_HEADER_SIZE) as u64 {
            return Err(ImportError::Corruption(format!(
                "{}: file too small to be a valid tablespace: {} bytes",
                path.display(),
                file_size
            )));
        }

        let read_size = std::cmp::min(file_size, SIZE_PAGE_MAX as u64) as usize;
        let mut buf = vec![0u8; read_size];
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_exact(&mut buf))
            .map_err(|e| ImportError::Io(format!("cannot read page 0 of {}: {}", path.display(), e)))?;

        let fsp = FspHeader::parse(&buf).ok_or_else(|| {
            ImportError::Corruption(format!("{}: missing FSP header", path.display()))
        })?;

        // Some exporters leave garbage in the reserved bit; clear it before
        // validating the rest.
        let space_flags = fsp.flags & !FSP_FLAGS_RESERVED;
        if !is_valid_flags(space_flags) {
            return Err(ImportError::Corruption(format!(
                "{}: invalid FSP_SPACE_FLAGS=0x{:x}",
                path.display(),
                fsp.flags
            )));
        }

        let logical_size = logical_size_from_flags(space_flags);
        let physical_size = physical_size_from_flags(space_flags);

        if logical_size != srv_page_size {
            return Err(ImportError::Corruption(format!(
                "Page size {} of ibd file is not the same as the server page size {}",
                logical_size, srv_page_size
            )));
        }
        if file_size % physical_size as u64 != 0 {
            return Err(ImportError::Corruption(format!(
                "File size {} is not a multiple of the page size {}",
                file_size, physical_size
            )));
        }

        Ok(TablespaceFile {
            file,
            path: path.to_path_buf(),
            file_size,
            space_id: fsp.space_id,
            space_flags,
            logical_size,
            physical_size,
            fsp_size: fsp.size,
            free_limit: fsp.free_limit,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Space id read from the FSP header (the exporter's id until the
    /// conversion pass rewrites it).
    pub fn space_id(&self) -> u32 {
        self.space_id
    }

    pub fn space_flags(&self) -> u32 {
        self.space_flags
    }

    pub fn logical_size(&self) -> u32 {
        self.logical_size
    }

    /// Physical page size: the zip frame size under ROW_FORMAT=COMPRESSED,
    /// the logical size otherwise.
    pub fn physical_size(&self) -> u32 {
        self.physical_size
    }

    /// ROW_FORMAT=COMPRESSED frame size, or 0.
    pub fn zip_size(&self) -> u32 {
        zip_size_from_flags(self.space_flags)
    }

    pub fn is_compressed(&self) -> bool {
        self.zip_size() != 0
    }

    pub fn fsp_size(&self) -> u32 {
        self.fsp_size
    }

    pub fn free_limit(&self) -> u32 {
        self.free_limit
    }

    /// Number of physical pages in the file.
    pub fn page_count(&self) -> u64 {
        self.file_size / self.physical_size as u64
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), ImportError> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(buf))
            .map_err(|e| {
                ImportError::Io(format!(
                    "{}: read of {} bytes at offset {} failed: {}",
                    self.path.display(),
                    buf.len(),
                    offset,
                    e
                ))
            })
    }

    /// Write `buf` at `offset`.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), ImportError> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(buf))
            .map_err(|e| {
                ImportError::Io(format!(
                    "{}: write of {} bytes at offset {} failed: {}",
                    self.path.display(),
                    buf.len(),
                    offset,
                    e
                ))
            })
    }

    /// Read one physical page.
    pub fn read_page(&mut self, page_no: u32) -> Result<Vec<u8>, ImportError> {
        if (page_no as u64) >= self.page_count() {
            return Err(ImportError::Corruption(format!(
                "page {} out of range (tablespace has {} pages)",
                page_no,
                self.page_count()
            )));
        }
        let mut buf = vec![0u8; self.physical_size as usize];
        self.read_at(page_no as u64 * self.physical_size as u64, &mut buf)?;
        Ok(buf)
    }

    /// Write one physical page.
    pub fn write_page(&mut self, page_no: u32, data: &[u8]) -> Result<(), ImportError> {
        if data.len() != self.physical_size as usize {
            return Err(ImportError::Corruption(format!(
                "page buffer is {} bytes, expected {}",
                data.len(),
                self.physical_size
            )));
        }
        self.write_at(page_no as u64 * self.physical_size as u64, data)
    }

    /// Flush file contents to stable storage.
    pub fn flush(&mut self) -> Result<(), ImportError> {
        self.file.sync_all().map_err(|e| {
            ImportError::Io(format!("{}: flush failed: {}", self.path.display(), e))
        })
    }

    /// Read one page in its logical form, running it through the codec
    /// (zip expansion, decryption, decompression).
    pub fn read_logical_page(
        &mut self,
        codec: &mut crate::innodb::codec::PageCodec,
        page_no: u32,
    ) -> Result<Vec<u8>, ImportError> {
        let frame = self.read_page(page_no)?;
        if self.is_compressed() {
            let mut logical = vec![0u8; self.logical_size as usize];
            codec.zip_decompress(&frame, &mut logical, page_no)?;
            Ok(logical)
        } else {
            let mut logical = frame;
            codec.decode(&mut logical, page_no)?;
            Ok(logical)
        }
    }

    /// Write one logical page back through the codec. The caller is
    /// responsible for having finalized the logical checksum.
    pub fn write_logical_page(
        &mut self,
        codec: &mut crate::innodb::codec::PageCodec,
        page_no: u32,
        logical: &[u8],
    ) -> Result<(), ImportError> {
        if self.is_compressed() {
            let mut frame = vec![0u8; self.physical_size as usize];
            codec.zip_compress(logical, &mut frame, page_no)?;
            self.write_page(page_no, &frame)
        } else {
            let mut frame = logical.to_vec();
            codec.encode(&mut frame, page_no)?;
            self.write_page(page_no, &frame)
        }
    }

    /// Re-read the FSP header (after the conversion pass rewrote it) and
    /// refresh the cached space id and flags.
    pub fn reload_header(&mut self) -> Result<(), ImportError> {
        let mut buf = vec![0u8; self.physical_size as usize];
        self.read_at(0, &mut buf)?;
        let fsp = FspHeader::parse(&buf).ok_or_else(|| {
            ImportError::Corruption(format!("{}: missing FSP header", self.path.display()))
        })?;
        self.space_id = fsp.space_id;
        self.space_flags = fsp.flags & !FSP_FLAGS_RESERVED;
        self.fsp_size = fsp.size;
        self.free_limit = fsp.free_limit;
        Ok(())
    }
}

/// Build a minimal valid FSP header page for a new tablespace image.
pub fn build_fsp_page(
    space_id: u32,
    total_pages: u32,
    flags: u32,
    lsn: u64,
    page_size: u32,
) -> Vec<u8> {
    let ps = page_size as usize;
    let mut page_data = vec![0u8; ps];

    BigEndian::write_u32(&mut page_data[FIL_PAGE_OFFSET..], 0);
    BigEndian::write_u32(&mut page_data[FIL_PAGE_PREV..], FIL_NULL);
    BigEndian::write_u32(&mut page_data[FIL_PAGE_NEXT..], FIL_NULL);
    BigEndian::write_u64(&mut page_data[FIL_PAGE_LSN..], lsn);
    BigEndian::write_u16(&mut page_data[FIL_PAGE_TYPE..], 8); // FSP_HDR
    BigEndian::write_u32(&mut page_data[FIL_PAGE_SPACE_ID..], space_id);

    let fsp = FIL_PAGE_DATA;
    BigEndian::write_u32(&mut page_data[fsp + FSP_SPACE_ID..], space_id);
    BigEndian::write_u32(&mut page_data[fsp + FSP_SIZE..], total_pages);
    BigEndian::write_u32(&mut page_data[fsp + FSP_FREE_LIMIT..], total_pages);
    BigEndian::write_u32(&mut page_data[fsp + FSP_SPACE_FLAGS..], flags);

    let algorithm = if page::full_crc32(flags) {
        crate::innodb::checksum::ChecksumAlgorithm::FullCrc32
    } else {
        crate::innodb::checksum::ChecksumAlgorithm::Crc32c
    };
    crate::innodb::checksum::recalculate_checksum(&mut page_data, page_size, algorithm);
    page_data
}
