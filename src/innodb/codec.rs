//! Page codec: per-page decryption and decompression.
//!
//! Turns a physical on-disk page image into its logical, parseable form and
//! back. The decode path runs, in order:
//!
//! 1. If the tablespace carries crypt material and the page's key-version
//!    field is set, verify the crypt checksum stored in the first 4 bytes
//!    (CRC-32C over the encrypted body), then decrypt the body in place
//!    with AES-256-CBC. The per-page IV is derived from the tablespace IV,
//!    the space id and the page number, binding the ciphertext to its
//!    position.
//! 2. If the page type marks page compression, verify the payload checksum
//!    (unless the page was encrypted, in which case the crypt checksum
//!    already covered it), decompress into a scratch buffer sized once for
//!    the worst case, and restore the original page type. A payload that
//!    does not decompress to exactly the body size is corruption:
//!    compression must always shrink.
//! 3. Otherwise verify the general page checksum. Pages that were encrypted
//!    skip this step: their on-disk checksum slot holds the crypt checksum,
//!    which was already validated.
//!
//! The encode path is the inverse: compress, then encrypt, then stamp the
//! crypt checksum. Checksum finalization of the logical page itself is the
//! page converter's job; the codec never recomputes it.
//!
//! ROW_FORMAT=COMPRESSED tablespaces store whole pages as smaller physical
//! "zip" frames; [`PageCodec::zip_decompress`]/[`PageCodec::zip_compress`]
//! convert between the zip frame and the logical page image.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use byteorder::{BigEndian, ByteOrder};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

use crate::innodb::checksum::{page_is_zeroes, validate_checksum};
use crate::innodb::constants::*;
use crate::innodb::page::{full_crc32, page_compression};
use crate::innodb::page_types::PageType;
use crate::ImportError;

type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;

const AES_BLOCK: usize = 16;

/// Page compression algorithms carried in the space flags / page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    Zlib,
    Lz4,
}

impl CompressionAlgorithm {
    /// Algorithm id as stored on disk (and in the space flags).
    pub fn to_id(self) -> u8 {
        match self {
            CompressionAlgorithm::Zlib => 1,
            CompressionAlgorithm::Lz4 => 2,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(CompressionAlgorithm::Zlib),
            2 => Some(CompressionAlgorithm::Lz4),
            _ => None,
        }
    }
}

/// Crypt material for one tablespace: the unwrapped key, the base IV and the
/// key version stamped into encrypted pages.
#[derive(Clone)]
pub struct CryptDescriptor {
    pub key: [u8; 32],
    pub iv: [u8; 32],
    pub key_version: u32,
}

impl std::fmt::Debug for CryptDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("CryptDescriptor")
            .field("key_version", &self.key_version)
            .finish()
    }
}

/// Per-tablespace page codec. Scratch buffers are sized once at
/// construction and reused for every page of the pass.
///
/// The per-page IV binds the space id, so the codec keeps two: pages are
/// decrypted under the id the exporter stamped them with, and encrypted
/// under the destination id. [`PageCodec::rebind_space`] switches the
/// write side when the conversion pass starts re-homing pages.
pub struct PageCodec {
    read_space_id: u32,
    write_space_id: u32,
    space_flags: u32,
    logical_size: usize,
    crypt: Option<CryptDescriptor>,
    scratch: Vec<u8>,
}

impl PageCodec {
    pub fn new(
        space_id: u32,
        space_flags: u32,
        logical_size: usize,
        crypt: Option<CryptDescriptor>,
    ) -> Self {
        PageCodec {
            read_space_id: space_id,
            write_space_id: space_id,
            space_flags,
            logical_size,
            crypt,
            // worst case: an incompressible body plus codec overhead
            scratch: vec![0u8; logical_size + 1024],
        }
    }

    /// Encrypt pages under a different space id than they are decrypted
    /// with (the conversion pass reads exporter pages and writes
    /// destination pages).
    pub fn rebind_space(&mut self, write_space_id: u32) {
        self.write_space_id = write_space_id;
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypt.is_some()
    }

    fn body_len(&self) -> usize {
        self.logical_size - FIL_PAGE_DATA - SIZE_FIL_TRAILER
    }

    /// Derive the per-page IV: SHA-256 over base IV, space id and page
    /// number, truncated to the AES block size.
    fn page_iv(crypt: &CryptDescriptor, space_id: u32, page_no: u32) -> [u8; AES_BLOCK] {
        let mut h = Sha256::new();
        h.update(crypt.iv);
        h.update(space_id.to_be_bytes());
        h.update(page_no.to_be_bytes());
        let digest = h.finalize();
        let mut iv = [0u8; AES_BLOCK];
        iv.copy_from_slice(&digest[..AES_BLOCK]);
        iv
    }

    /// Decode a physical page into its logical form, in place.
    pub fn decode(&mut self, page: &mut [u8], page_no: u32) -> Result<(), ImportError> {
        let ps = self.logical_size;
        if page.len() < ps {
            return Err(ImportError::Corruption(format!(
                "page {} buffer shorter than the page size",
                page_no
            )));
        }

        if page_is_zeroes(&page[..ps]) {
            return Ok(());
        }

        // Page 0 is never encrypted or page-compressed.
        let mut was_encrypted = false;
        if page_no > 0 {
            let key_version = BigEndian::read_u32(&page[FIL_PAGE_KEY_VERSION..]);
            if key_version != 0 {
                let crypt = self.crypt.as_ref().ok_or_else(|| {
                    ImportError::Corruption(format!(
                        "page {} is encrypted (key version {}) but no crypt data is available",
                        page_no, key_version
                    ))
                })?;

                let stored = BigEndian::read_u32(&page[FIL_PAGE_SPACE_OR_CHKSUM..]);
                let body_end = ps - SIZE_FIL_TRAILER;
                let calculated = crc32c::crc32c(&page[FIL_PAGE_DATA..body_end]);
                if stored != calculated {
                    return Err(ImportError::Corruption(format!(
                        "page {}: crypt checksum mismatch (stored 0x{:08X}, calculated 0x{:08X})",
                        page_no, stored, calculated
                    )));
                }

                let iv = Self::page_iv(crypt, self.read_space_id, page_no);
                let main_len = (self.body_len() / AES_BLOCK) * AES_BLOCK;
                let dec = Aes256CbcDec::new_from_slices(&crypt.key, &iv)
                    .map_err(|e| ImportError::Corruption(format!("AES init failed: {}", e)))?;
                dec.decrypt_padded_mut::<NoPadding>(
                    &mut page[FIL_PAGE_DATA..FIL_PAGE_DATA + main_len],
                )
                .map_err(|e| {
                    ImportError::Corruption(format!("page {}: AES decrypt failed: {}", page_no, e))
                })?;

                BigEndian::write_u32(&mut page[FIL_PAGE_KEY_VERSION..], 0);
                was_encrypted = true;
            }
        }

        let page_type = PageType::from_u16(BigEndian::read_u16(&page[FIL_PAGE_TYPE..]));
        if page_type.is_page_compressed() {
            self.decompress(page, page_no, was_encrypted)?;
            return Ok(());
        }

        if !was_encrypted {
            let result = validate_checksum(page, ps as u32, full_crc32(self.space_flags));
            if !result.valid {
                return Err(ImportError::Corruption(format!(
                    "page {}: checksum mismatch (stored 0x{:08X}, calculated 0x{:08X})",
                    page_no, result.stored_checksum, result.calculated_checksum
                )));
            }
        }

        Ok(())
    }

    /// Encode a logical page for writing: compress if the space is
    /// page-compressed, then encrypt if crypt material is present.
    pub fn encode(&mut self, page: &mut [u8], page_no: u32) -> Result<(), ImportError> {
        let ps = self.logical_size;
        if page_no == 0 || page_is_zeroes(&page[..ps]) {
            return Ok(());
        }

        if page_compression(self.space_flags) {
            self.compress(page)?;
        }

        if let Some(crypt) = self.crypt.clone() {
            let iv = Self::page_iv(&crypt, self.write_space_id, page_no);
            let main_len = (self.body_len() / AES_BLOCK) * AES_BLOCK;
            let enc = Aes256CbcEnc::new_from_slices(&crypt.key, &iv)
                .map_err(|e| ImportError::Corruption(format!("AES init failed: {}", e)))?;
            enc.encrypt_padded_mut::<NoPadding>(
                &mut page[FIL_PAGE_DATA..FIL_PAGE_DATA + main_len],
                main_len,
            )
            .map_err(|e| {
                ImportError::Corruption(format!("page {}: AES encrypt failed: {}", page_no, e))
            })?;

            BigEndian::write_u32(&mut page[FIL_PAGE_KEY_VERSION..], crypt.key_version);
            let body_end = ps - SIZE_FIL_TRAILER;
            let ck = crc32c::crc32c(&page[FIL_PAGE_DATA..body_end]);
            BigEndian::write_u32(&mut page[FIL_PAGE_SPACE_OR_CHKSUM..], ck);
        }

        Ok(())
    }

    fn algorithm(&self) -> Result<CompressionAlgorithm, ImportError> {
        let id = ((self.space_flags & FSP_FLAGS_MASK_COMP_ALGO) >> FSP_FLAGS_POS_COMP_ALGO) as u8;
        CompressionAlgorithm::from_id(id).ok_or_else(|| {
            ImportError::Corruption(format!("unknown compression algorithm id {}", id))
        })
    }

    fn decompress(
        &mut self,
        page: &mut [u8],
        page_no: u32,
        was_encrypted: bool,
    ) -> Result<(), ImportError> {
        let ps = self.logical_size;
        let body_len = self.body_len();

        let orig_type = BigEndian::read_u16(&page[FIL_PAGE_ORIGINAL_TYPE..]);
        let algo = CompressionAlgorithm::from_id(page[FIL_PAGE_COMPRESS_ALGO]).ok_or_else(|| {
            ImportError::Corruption(format!(
                "page {}: unknown compression algorithm id {}",
                page_no, page[FIL_PAGE_COMPRESS_ALGO]
            ))
        })?;

        let payload_len = BigEndian::read_u32(&page[FIL_PAGE_DATA..]) as usize;
        // Compression must always shrink; a payload as large as the body is
        // as corrupt as one that overruns it.
        if payload_len == 0 || payload_len + 4 >= body_len {
            return Err(ImportError::Corruption(format!(
                "page {}: compressed payload length {} out of range",
                page_no, payload_len
            )));
        }

        if !was_encrypted {
            let stored = BigEndian::read_u32(&page[FIL_PAGE_SPACE_OR_CHKSUM..]);
            let calculated =
                crc32c::crc32c(&page[FIL_PAGE_DATA..FIL_PAGE_DATA + 4 + payload_len]);
            if stored != calculated {
                return Err(ImportError::Corruption(format!(
                    "page {}: compressed payload checksum mismatch",
                    page_no
                )));
            }
        }

        let payload = &page[FIL_PAGE_DATA + 4..FIL_PAGE_DATA + 4 + payload_len];
        let out_len = match algo {
            CompressionAlgorithm::Zlib => {
                let mut decoder = flate2::read::ZlibDecoder::new(payload).take(body_len as u64 + 1);
                let mut n = 0usize;
                loop {
                    match decoder.read(&mut self.scratch[n..]) {
                        Ok(0) => break,
                        Ok(read) => n += read,
                        Err(e) => {
                            return Err(ImportError::Corruption(format!(
                                "page {}: zlib decompression failed: {}",
                                page_no, e
                            )))
                        }
                    }
                }
                n
            }
            CompressionAlgorithm::Lz4 => {
                let out = lz4_flex::decompress(payload, body_len).map_err(|e| {
                    ImportError::Corruption(format!(
                        "page {}: lz4 decompression failed: {}",
                        page_no, e
                    ))
                })?;
                self.scratch[..out.len()].copy_from_slice(&out);
                out.len()
            }
        };

        if out_len != body_len {
            return Err(ImportError::Corruption(format!(
                "page {}: decompressed length {} does not match the body size {}",
                page_no, out_len, body_len
            )));
        }

        let body_end = ps - SIZE_FIL_TRAILER;
        page[FIL_PAGE_DATA..body_end].copy_from_slice(&self.scratch[..body_len]);
        BigEndian::write_u16(&mut page[FIL_PAGE_TYPE..], orig_type);
        BigEndian::write_u16(&mut page[FIL_PAGE_ORIGINAL_TYPE..], 0);
        page[FIL_PAGE_COMPRESS_ALGO] = 0;

        Ok(())
    }

    fn compress(&mut self, page: &mut [u8]) -> Result<(), ImportError> {
        let ps = self.logical_size;
        let body_len = self.body_len();
        let body_end = ps - SIZE_FIL_TRAILER;
        let algo = self.algorithm()?;

        let compressed = match algo {
            CompressionAlgorithm::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(&page[FIL_PAGE_DATA..body_end])
                    .map_err(|e| ImportError::Io(format!("zlib compression failed: {}", e)))?;
                encoder
                    .finish()
                    .map_err(|e| ImportError::Io(format!("zlib compression failed: {}", e)))?
            }
            CompressionAlgorithm::Lz4 => lz4_flex::compress(&page[FIL_PAGE_DATA..body_end]),
        };

        // Not worth it (or would not shrink): leave the page uncompressed.
        if compressed.len() + 4 >= body_len {
            return Ok(());
        }

        let orig_type = BigEndian::read_u16(&page[FIL_PAGE_TYPE..]);
        let wrapper = if self.crypt.is_some() {
            PageType::PageCompressedEncrypted
        } else {
            PageType::PageCompressed
        };

        BigEndian::write_u16(&mut page[FIL_PAGE_TYPE..], wrapper.to_u16());
        BigEndian::write_u16(&mut page[FIL_PAGE_ORIGINAL_TYPE..], orig_type);
        page[FIL_PAGE_COMPRESS_ALGO] = algo.to_id();
        BigEndian::write_u32(&mut page[FIL_PAGE_DATA..], compressed.len() as u32);
        page[FIL_PAGE_DATA + 4..FIL_PAGE_DATA + 4 + compressed.len()].copy_from_slice(&compressed);
        for b in &mut page[FIL_PAGE_DATA + 4 + compressed.len()..body_end] {
            *b = 0;
        }

        if self.crypt.is_none() {
            let ck = crc32c::crc32c(&page[FIL_PAGE_DATA..FIL_PAGE_DATA + 4 + compressed.len()]);
            BigEndian::write_u32(&mut page[FIL_PAGE_SPACE_OR_CHKSUM..], ck);
        }

        Ok(())
    }

    /// Expand a ROW_FORMAT=COMPRESSED physical frame into the logical page
    /// image. The frame keeps the FIL header verbatim; the body is a zlib
    /// stream prefixed with its length.
    pub fn zip_decompress(
        &mut self,
        frame: &[u8],
        logical: &mut [u8],
        page_no: u32,
    ) -> Result<(), ImportError> {
        let ps = self.logical_size;
        if page_is_zeroes(frame) {
            for b in logical[..ps].iter_mut() {
                *b = 0;
            }
            return Ok(());
        }

        let result = validate_checksum(frame, frame.len() as u32, false);
        if !result.valid {
            return Err(ImportError::Corruption(format!(
                "page {}: zip frame checksum mismatch (stored 0x{:08X}, calculated 0x{:08X})",
                page_no, result.stored_checksum, result.calculated_checksum
            )));
        }

        let payload_len = BigEndian::read_u32(&frame[FIL_PAGE_DATA..]) as usize;
        if payload_len == 0 || FIL_PAGE_DATA + 4 + payload_len > frame.len() {
            return Err(ImportError::Corruption(format!(
                "page {}: zip payload length {} out of range",
                page_no, payload_len
            )));
        }

        let body_len = self.body_len();
        let payload = &frame[FIL_PAGE_DATA + 4..FIL_PAGE_DATA + 4 + payload_len];
        let mut decoder = flate2::read::ZlibDecoder::new(payload).take(body_len as u64 + 1);
        let mut n = 0usize;
        loop {
            match decoder.read(&mut self.scratch[n..]) {
                Ok(0) => break,
                Ok(read) => n += read,
                Err(e) => {
                    return Err(ImportError::Corruption(format!(
                        "page {}: zip decompression failed: {}",
                        page_no, e
                    )))
                }
            }
        }
        if n != body_len {
            return Err(ImportError::Corruption(format!(
                "page {}: zip frame decompressed to {} bytes, want {}",
                page_no, n, body_len
            )));
        }

        logical[..FIL_PAGE_DATA].copy_from_slice(&frame[..FIL_PAGE_DATA]);
        logical[FIL_PAGE_DATA..ps - SIZE_FIL_TRAILER].copy_from_slice(&self.scratch[..body_len]);
        logical[ps - SIZE_FIL_TRAILER..ps]
            .copy_from_slice(&frame[frame.len() - SIZE_FIL_TRAILER..]);

        // The frame's checksum lived in the shared header slot; give the
        // expanded image a checksum of its own so it validates standalone.
        crate::innodb::checksum::recalculate_checksum(
            &mut logical[..ps],
            ps as u32,
            crate::innodb::checksum::ChecksumAlgorithm::Crc32c,
        );
        Ok(())
    }

    /// Compress a logical page image back into its zip frame.
    pub fn zip_compress(
        &mut self,
        logical: &[u8],
        frame: &mut [u8],
        page_no: u32,
    ) -> Result<(), ImportError> {
        let ps = self.logical_size;
        let zip_size = frame.len();
        if page_is_zeroes(&logical[..ps]) {
            for b in frame.iter_mut() {
                *b = 0;
            }
            return Ok(());
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&logical[FIL_PAGE_DATA..ps - SIZE_FIL_TRAILER])
            .map_err(|e| ImportError::Io(format!("zlib compression failed: {}", e)))?;
        let compressed = encoder
            .finish()
            .map_err(|e| ImportError::Io(format!("zlib compression failed: {}", e)))?;

        if FIL_PAGE_DATA + 4 + compressed.len() > zip_size - SIZE_FIL_TRAILER {
            return Err(ImportError::Corruption(format!(
                "page {}: page does not fit its compressed frame ({} bytes compressed)",
                page_no,
                compressed.len()
            )));
        }

        for b in frame.iter_mut() {
            *b = 0;
        }
        frame[..FIL_PAGE_DATA].copy_from_slice(&logical[..FIL_PAGE_DATA]);
        BigEndian::write_u32(&mut frame[FIL_PAGE_DATA..], compressed.len() as u32);
        frame[FIL_PAGE_DATA + 4..FIL_PAGE_DATA + 4 + compressed.len()]
            .copy_from_slice(&compressed);
        frame[zip_size - SIZE_FIL_TRAILER..]
            .copy_from_slice(&logical[ps - SIZE_FIL_TRAILER..ps]);

        crate::innodb::checksum::recalculate_checksum(
            frame,
            zip_size as u32,
            crate::innodb::checksum::ChecksumAlgorithm::Crc32c,
        );
        Ok(())
    }
}
