//! MFT attributes.
//!
//! An attribute header lives inside a fixed-up MFT entry buffer; the
//! accessors here are plain little-endian reads at known offsets. The
//! attribute's content is reached through `data()`, which returns a
//! `RangeReader` whether the content is resident, non-resident, sparse or
//! compressed.

use std::sync::Arc;

use log::debug;

use crate::context::NtfsContext;
use crate::error::Result;
use crate::mft::EntryBuf;
use crate::reader::read_some_at;
use crate::runs::{
    compressed_range_reader, decode_runlist, uncompressed_range_reader, Backing, MappedReader,
    RangeReader, Run,
};

// Attribute type codes.
pub const ATTR_TYPE_STANDARD_INFORMATION: u64 = 0x10;
pub const ATTR_TYPE_ATTRIBUTE_LIST: u64 = 0x20;
pub const ATTR_TYPE_FILE_NAME: u64 = 0x30;
pub const ATTR_TYPE_OBJECT_ID: u64 = 0x40;
pub const ATTR_TYPE_SECURITY_DESCRIPTOR: u64 = 0x50;
pub const ATTR_TYPE_VOLUME_NAME: u64 = 0x60;
pub const ATTR_TYPE_VOLUME_INFORMATION: u64 = 0x70;
pub const ATTR_TYPE_DATA: u64 = 0x80;
pub const ATTR_TYPE_INDEX_ROOT: u64 = 0x90;
pub const ATTR_TYPE_INDEX_ALLOCATION: u64 = 0xA0;
pub const ATTR_TYPE_BITMAP: u64 = 0xB0;
pub const ATTR_TYPE_REPARSE_POINT: u64 = 0xC0;
pub const ATTR_TYPE_LOGGED_UTILITY_STREAM: u64 = 0x100;

// Attribute flags (u16 at offset 12).
pub const ATTR_FLAG_COMPRESSED: u16 = 1 << 0;
pub const ATTR_FLAG_ENCRYPTED: u16 = 1 << 14;
pub const ATTR_FLAG_SPARSE: u16 = 1 << 15;

/// Largest resident content we will ever copy out of an entry.
pub const MAX_MFT_ENTRY_SIZE: u32 = 0x10000;

/// Largest attribute-list stream we will walk, in bytes.
const MAX_ATTRIBUTE_LIST_SIZE: i64 = 16 * 1024 * 1024;

/// Display name for an attribute type code.
pub fn attribute_type_name(attr_type: u64) -> &'static str {
    match attr_type {
        ATTR_TYPE_STANDARD_INFORMATION => "$STANDARD_INFORMATION",
        ATTR_TYPE_ATTRIBUTE_LIST => "$ATTRIBUTE_LIST",
        ATTR_TYPE_FILE_NAME => "$FILE_NAME",
        ATTR_TYPE_OBJECT_ID => "$OBJECT_ID",
        ATTR_TYPE_SECURITY_DESCRIPTOR => "$SECURITY_DESCRIPTOR",
        ATTR_TYPE_VOLUME_NAME => "$VOLUME_NAME",
        ATTR_TYPE_VOLUME_INFORMATION => "$VOLUME_INFORMATION",
        ATTR_TYPE_DATA => "$DATA",
        ATTR_TYPE_INDEX_ROOT => "$INDEX_ROOT",
        ATTR_TYPE_INDEX_ALLOCATION => "$INDEX_ALLOCATION",
        ATTR_TYPE_BITMAP => "$BITMAP",
        ATTR_TYPE_REPARSE_POINT => "$REPARSE_POINT",
        ATTR_TYPE_LOGGED_UTILITY_STREAM => "$LOGGED_UTILITY_STREAM",
        _ => "Unknown",
    }
}

/// Decode UTF-16LE bytes, replacing invalid sequences.
pub(crate) fn parse_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// One attribute inside a fixed-up MFT entry.
#[derive(Clone)]
pub struct Attribute {
    pub entry: Arc<EntryBuf>,
    pub offset: usize,
}

impl Attribute {
    fn u8_at(&self, rel: usize) -> u8 {
        self.entry.buf.get(self.offset + rel).copied().unwrap_or(0)
    }

    fn u16_at(&self, rel: usize) -> u16 {
        let p = self.offset + rel;
        match self.entry.buf.get(p..p + 2) {
            Some(b) => u16::from_le_bytes([b[0], b[1]]),
            None => 0,
        }
    }

    fn u32_at(&self, rel: usize) -> u32 {
        let p = self.offset + rel;
        match self.entry.buf.get(p..p + 4) {
            Some(b) => u32::from_le_bytes(b.try_into().unwrap()),
            None => 0,
        }
    }

    fn u64_at(&self, rel: usize) -> u64 {
        let p = self.offset + rel;
        match self.entry.buf.get(p..p + 8) {
            Some(b) => u64::from_le_bytes(b.try_into().unwrap()),
            None => 0,
        }
    }

    pub fn attr_type(&self) -> u64 {
        self.u32_at(0) as u64
    }

    pub fn type_name(&self) -> &'static str {
        attribute_type_name(self.attr_type())
    }

    pub fn length(&self) -> u32 {
        self.u32_at(4)
    }

    pub fn is_resident(&self) -> bool {
        self.u8_at(8) == 0
    }

    pub fn name_length(&self) -> u8 {
        self.u8_at(9)
    }

    fn name_offset(&self) -> u16 {
        self.u16_at(10)
    }

    pub fn flags(&self) -> u16 {
        self.u16_at(12)
    }

    pub fn is_compressed(&self) -> bool {
        self.flags() & ATTR_FLAG_COMPRESSED != 0
    }

    pub fn is_sparse(&self) -> bool {
        self.flags() & ATTR_FLAG_SPARSE != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags() & ATTR_FLAG_ENCRYPTED != 0
    }

    pub fn attribute_id(&self) -> u16 {
        self.u16_at(14)
    }

    // Resident form.
    pub fn content_size(&self) -> u32 {
        self.u32_at(16)
    }

    pub fn content_offset(&self) -> u16 {
        self.u16_at(20)
    }

    // Non-resident form.
    pub fn vcn_start(&self) -> u64 {
        self.u64_at(16)
    }

    pub fn vcn_end(&self) -> u64 {
        self.u64_at(24)
    }

    pub fn runlist_offset(&self) -> u16 {
        self.u16_at(32)
    }

    pub fn compression_unit_exponent(&self) -> u16 {
        self.u16_at(34)
    }

    pub fn allocated_size(&self) -> u64 {
        self.u64_at(40)
    }

    pub fn actual_size(&self) -> u64 {
        self.u64_at(48)
    }

    pub fn initialized_size(&self) -> u64 {
        self.u64_at(56)
    }

    /// Compression unit size in clusters (typically 16).
    pub fn compression_unit(&self) -> i64 {
        1i64 << self.compression_unit_exponent().min(16)
    }

    /// The attribute's UTF-16 name; empty for unnamed streams.
    pub fn name(&self) -> String {
        let len = (self.name_length() as usize) * 2;
        if len == 0 {
            return String::new();
        }
        let start = self.offset + self.name_offset() as usize;
        match self.entry.buf.get(start..start + len) {
            Some(bytes) => parse_utf16le(bytes),
            None => String::new(),
        }
    }

    /// Content size as seen by callers: inline size when resident,
    /// logical stream size otherwise.
    pub fn data_size(&self) -> i64 {
        if self.is_resident() {
            self.content_size() as i64
        } else {
            self.actual_size() as i64
        }
    }

    /// Decode this attribute's runlist.
    pub fn run_list(&self) -> Result<Vec<Run>> {
        let start = self.offset + self.runlist_offset() as usize;
        let end = self.offset + self.length() as usize;
        let end = end.min(self.entry.buf.len());
        if start >= end {
            return Ok(Vec::new());
        }
        decode_runlist(&self.entry.buf[start..end])
    }

    /// Copy of the resident content, capped to the entry.
    pub fn resident_content(&self) -> Vec<u8> {
        let size = self.content_size().min(MAX_MFT_ENTRY_SIZE) as usize;
        let start = self.offset + self.content_offset() as usize;
        let end = (start + size).min(self.entry.buf.len());
        if start >= end {
            return Vec::new();
        }
        self.entry.buf[start..end].to_vec()
    }

    /// A reader over this single attribute's content. For multi-VCN
    /// streams use `stream::open_stream`, which joins the fragments.
    pub fn data(&self, ntfs: &NtfsContext) -> Result<RangeReader> {
        if self.is_resident() {
            let content = self.resident_content();
            let len = content.len() as i64;
            return Ok(RangeReader::new(vec![MappedReader {
                file_offset: 0,
                target_offset: 0,
                length: len,
                cluster_size: 1,
                compressed_length: 0,
                is_sparse: false,
                backing: Backing::Bytes(Arc::new(content)),
            }]));
        }

        let runs = self.run_list()?;
        let inner = if self.is_compressed() {
            compressed_range_reader(
                &runs,
                ntfs.cluster_size(),
                ntfs.disk_reader(),
                self.compression_unit(),
            )
        } else {
            uncompressed_range_reader(&runs, ntfs.cluster_size(), ntfs.disk_reader())
        };

        // Clamp the mapping to the attribute's logical size.
        Ok(RangeReader::new(vec![MappedReader {
            file_offset: 0,
            target_offset: 0,
            length: self.actual_size() as i64,
            cluster_size: 1,
            compressed_length: 0,
            is_sparse: false,
            backing: Backing::Nested(Arc::new(inner)),
        }]))
    }
}

impl std::fmt::Debug for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Attribute({} id {} name {:?} resident {})",
            self.type_name(),
            self.attribute_id(),
            self.name(),
            self.is_resident()
        )
    }
}

/// One entry of an `$ATTRIBUTE_LIST` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeListEntry {
    pub attr_type: u64,
    pub length: u16,
    pub starting_vcn: u64,
    pub mft_reference: u64,
    /// Single byte at offset 24; offset 25 is reserved padding.
    pub attribute_id: u8,
}

/// Parse the entries of an attribute list stream.
///
/// The stream may itself be non-resident, so it is consumed through a
/// reader rather than a slice.
pub fn parse_attribute_list(reader: &RangeReader, data_size: i64) -> Vec<AttributeListEntry> {
    let mut entries = Vec::new();
    let size = data_size.min(MAX_ATTRIBUTE_LIST_SIZE);
    let mut offset = 0i64;

    while offset < size {
        let mut header = [0u8; 26];
        let n = match read_some_at(reader, offset as u64, &mut header) {
            Ok(n) => n,
            Err(e) => {
                debug!("attribute list read failed at {}: {}", offset, e);
                break;
            }
        };
        if n < 26 {
            break;
        }

        let length = u16::from_le_bytes([header[4], header[5]]);
        if length == 0 {
            break;
        }

        entries.push(AttributeListEntry {
            attr_type: u32::from_le_bytes(header[0..4].try_into().unwrap()) as u64,
            length,
            starting_vcn: u64::from_le_bytes(header[8..16].try_into().unwrap()),
            mft_reference: u64::from_le_bytes(header[16..24].try_into().unwrap())
                & 0x0000_FFFF_FFFF_FFFF,
            attribute_id: header[24],
        });

        offset += length as i64;
    }

    entries
}
