//! MFT entries and the record-level views hanging off them.
//!
//! An `MftEntry` owns an independent fixed-up copy of its 1 KiB record;
//! every view into it (attributes, `$STANDARD_INFORMATION`, `$FILE_NAME`)
//! is a little-endian accessor over that buffer. The original disk offset
//! travels along so callers can still report physical positions.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use log::debug;

use crate::attribute::{
    parse_attribute_list, parse_utf16le, Attribute, ATTR_TYPE_ATTRIBUTE_LIST, ATTR_TYPE_FILE_NAME,
    ATTR_TYPE_INDEX_ALLOCATION, ATTR_TYPE_INDEX_ROOT, ATTR_TYPE_STANDARD_INFORMATION,
};
use crate::context::NtfsContext;
use crate::error::{NtfsError, Result};
use crate::index::{decode_index_block, IndexNode, IndexRecordEntry, INDEX_BLOCK_SIZE};
use crate::fixup::apply_fixup;
use crate::reader::{read_exact_at, read_some_at, ReadAt};
use crate::runs::RangeReader;

/// MFT record number of the root directory.
pub const MFT_RECORD_ROOT: u64 = 5;

// MFT entry header flags.
pub const MFT_FLAG_ALLOCATED: u16 = 1 << 0;
pub const MFT_FLAG_DIRECTORY: u16 = 1 << 1;

/// Longest file name we will decode, in UTF-16 units.
pub const MAX_FILENAME_UNITS: usize = 255;

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_EPOCH_DIFF: i64 = 11_644_473_600;

/// Convert a Windows FILETIME (100 ns ticks since 1601, UTC) to a UTC
/// timestamp. The local zone is deliberately never consulted.
pub fn filetime_to_datetime(ft: u64) -> DateTime<Utc> {
    let secs = (ft / 10_000_000) as i64 - FILETIME_EPOCH_DIFF;
    let nanos = ((ft % 10_000_000) * 100) as u32;
    match Utc.timestamp_opt(secs, nanos) {
        chrono::LocalResult::Single(t) => t,
        _ => DateTime::<Utc>::UNIX_EPOCH,
    }
}

/// FILETIME expressed as unix seconds, for plausibility windows.
pub fn filetime_unix_seconds(ft: u64) -> i64 {
    (ft / 10_000_000) as i64 - FILETIME_EPOCH_DIFF
}

/// A fixed-up MFT record buffer plus its physical origin.
pub struct EntryBuf {
    pub buf: Vec<u8>,
    pub disk_offset: u64,
}

fn buf_u16(buf: &[u8], off: usize) -> u16 {
    match buf.get(off..off + 2) {
        Some(b) => u16::from_le_bytes([b[0], b[1]]),
        None => 0,
    }
}

fn buf_u32(buf: &[u8], off: usize) -> u32 {
    match buf.get(off..off + 4) {
        Some(b) => u32::from_le_bytes(b.try_into().unwrap()),
        None => 0,
    }
}

fn buf_u64(buf: &[u8], off: usize) -> u64 {
    match buf.get(off..off + 8) {
        Some(b) => u64::from_le_bytes(b.try_into().unwrap()),
        None => 0,
    }
}

/// One MFT record, fixed up and ready to parse.
#[derive(Clone)]
pub struct MftEntry {
    pub data: Arc<EntryBuf>,
}

impl MftEntry {
    /// Read `record_size` bytes at `offset`, verify the `FILE` magic and
    /// apply fixups. Uninitialized or torn records fail here.
    pub fn from_reader(reader: &dyn ReadAt, offset: u64, record_size: usize) -> Result<MftEntry> {
        if record_size < 48 {
            return Err(NtfsError::Parse(format!(
                "implausible MFT record size {}",
                record_size
            )));
        }
        let mut buf = vec![0u8; record_size];
        read_exact_at(reader, offset, &mut buf)?;

        if &buf[0..4] != b"FILE" {
            return Err(NtfsError::Parse(format!(
                "MFT record at {:#x} has invalid magic {:?}",
                offset,
                &buf[0..4]
            )));
        }

        let fixup_offset = buf_u16(&buf, 4) as usize;
        let fixup_count = buf_u16(&buf, 6) as usize;
        apply_fixup(&mut buf, fixup_offset, fixup_count, offset)?;

        Ok(MftEntry {
            data: Arc::new(EntryBuf {
                buf,
                disk_offset: offset,
            }),
        })
    }

    pub fn disk_offset(&self) -> u64 {
        self.data.disk_offset
    }

    pub fn logfile_sequence_number(&self) -> u64 {
        buf_u64(&self.data.buf, 8)
    }

    pub fn sequence_value(&self) -> u16 {
        buf_u16(&self.data.buf, 16)
    }

    pub fn link_count(&self) -> u16 {
        buf_u16(&self.data.buf, 18)
    }

    pub fn attribute_offset(&self) -> u16 {
        buf_u16(&self.data.buf, 20)
    }

    pub fn flags(&self) -> u16 {
        buf_u16(&self.data.buf, 22)
    }

    pub fn is_allocated(&self) -> bool {
        self.flags() & MFT_FLAG_ALLOCATED != 0
    }

    pub fn is_directory_flag(&self) -> bool {
        self.flags() & MFT_FLAG_DIRECTORY != 0
    }

    /// Bytes of the record actually in use.
    pub fn used_size(&self) -> u32 {
        buf_u32(&self.data.buf, 24)
    }

    pub fn allocated_size(&self) -> u32 {
        buf_u32(&self.data.buf, 28)
    }

    /// Non-zero for extension records: the base record they belong to.
    pub fn base_record_reference(&self) -> u64 {
        buf_u64(&self.data.buf, 32) & 0x0000_FFFF_FFFF_FFFF
    }

    pub fn next_attribute_id(&self) -> u16 {
        buf_u16(&self.data.buf, 40)
    }

    pub fn record_number(&self) -> u64 {
        buf_u32(&self.data.buf, 44) as u64
    }

    /// The attributes physically stored in this record, in header order.
    /// No `$ATTRIBUTE_LIST` expansion happens here.
    pub fn direct_attributes(&self) -> Vec<Attribute> {
        let mut result = Vec::new();
        let bound = (self.used_size() as usize).min(self.data.buf.len());
        let mut offset = self.attribute_offset() as usize;

        loop {
            let attr = Attribute {
                entry: self.data.clone(),
                offset,
            };
            if attr.attr_type() == 0xFFFF_FFFF || attr.attr_type() == 0 {
                break;
            }
            let length = attr.length() as usize;
            if length == 0 || offset + length > bound {
                break;
            }
            result.push(attr);
            offset += length;
        }

        result
    }

    /// Iterate the attributes of this record, expanding `$ATTRIBUTE_LIST`
    /// indirections.
    ///
    /// A list entry pointing back at this same record is ignored (that is
    /// how the on-disk format expresses "the rest of me is right here",
    /// and following it would recurse). Foreign references are resolved
    /// with a direct lookup that never expands nested lists. The list
    /// attribute itself is emitted after its expansions so callers can
    /// still inspect it.
    pub fn enumerate_attributes(&self, ntfs: &NtfsContext) -> Vec<Attribute> {
        let mut result = Vec::new();
        for attr in self.direct_attributes() {
            if attr.attr_type() == ATTR_TYPE_ATTRIBUTE_LIST {
                result.extend(self.expand_attribute_list(ntfs, &attr));
            }
            result.push(attr);
        }
        result
    }

    fn expand_attribute_list(&self, ntfs: &NtfsContext, attr: &Attribute) -> Vec<Attribute> {
        let mut result = Vec::new();
        let list_reader = match attr.data(ntfs) {
            Ok(r) => r,
            Err(e) => {
                debug!(
                    "cannot read $ATTRIBUTE_LIST of entry {}: {}",
                    self.record_number(),
                    e
                );
                return result;
            }
        };

        for entry in parse_attribute_list(&list_reader, attr.data_size()) {
            if entry.mft_reference == self.record_number() {
                continue;
            }
            let foreign = match ntfs.get_mft(entry.mft_reference) {
                Ok(m) => m,
                Err(e) => {
                    debug!("attribute list references bad entry {}: {}", entry.mft_reference, e);
                    continue;
                }
            };
            match foreign.get_direct_attribute(entry.attr_type, entry.attribute_id as u16) {
                Ok(a) => result.push(a),
                Err(_) => debug!(
                    "entry {} has no direct attribute type {:#x} id {}",
                    entry.mft_reference, entry.attr_type, entry.attribute_id
                ),
            }
        }

        result
    }

    /// Find an exact (type, id) attribute in this record without expanding
    /// attribute lists. Safe to call from within a list expansion.
    pub fn get_direct_attribute(&self, attr_type: u64, attr_id: u16) -> Result<Attribute> {
        self.direct_attributes()
            .into_iter()
            .find(|attr| attr.attr_type() == attr_type && attr.attribute_id() == attr_id)
            .ok_or(NtfsError::AttributeNotFound)
    }

    /// First attribute of `attr_type`, optionally requiring an exact id.
    pub fn get_attribute(
        &self,
        ntfs: &NtfsContext,
        attr_type: u64,
        attr_id: Option<u16>,
    ) -> Result<Attribute> {
        for attr in self.enumerate_attributes(ntfs) {
            if attr.attr_type() == attr_type {
                match attr_id {
                    None => return Ok(attr),
                    Some(id) if attr.attribute_id() == id => return Ok(attr),
                    Some(_) => continue,
                }
            }
        }
        Err(NtfsError::AttributeNotFound)
    }

    /// The `$STANDARD_INFORMATION` attribute: canonical timestamps.
    pub fn standard_information(&self, ntfs: &NtfsContext) -> Result<StandardInformation> {
        for attr in self.enumerate_attributes(ntfs) {
            if attr.attr_type() == ATTR_TYPE_STANDARD_INFORMATION {
                let reader = attr.data(ntfs)?;
                return StandardInformation::from_reader(&reader);
            }
        }
        Err(NtfsError::AttributeNotFound)
    }

    /// All `$FILE_NAME` attributes of this record (hard links and DOS
    /// aliases included).
    pub fn file_names(&self, ntfs: &NtfsContext) -> Vec<FileName> {
        let mut result = Vec::new();
        for attr in self.enumerate_attributes(ntfs) {
            if attr.attr_type() == ATTR_TYPE_FILE_NAME {
                if let Ok(reader) = attr.data(ntfs) {
                    if let Some(fnm) = FileName::from_stream(&reader) {
                        result.push(fnm);
                    }
                }
            }
        }
        result
    }

    /// A record is a directory when it carries index attributes.
    pub fn is_dir(&self, ntfs: &NtfsContext) -> bool {
        self.enumerate_attributes(ntfs).iter().any(|attr| {
            matches!(
                attr.attr_type(),
                ATTR_TYPE_INDEX_ROOT | ATTR_TYPE_INDEX_ALLOCATION
            )
        })
    }

    /// All index nodes of this directory: the resident `$INDEX_ROOT` node
    /// plus one node per fixed-up 4 KiB `$INDEX_ALLOCATION` block.
    pub fn dir_nodes(&self, ntfs: &NtfsContext) -> Vec<IndexNode> {
        let mut result = Vec::new();

        for attr in self.enumerate_attributes(ntfs) {
            match attr.attr_type() {
                ATTR_TYPE_INDEX_ROOT => {
                    let content = attr.resident_content();
                    if let Some(node) = IndexNode::from_index_root(content) {
                        result.push(node);
                    }
                }
                ATTR_TYPE_INDEX_ALLOCATION => {
                    let reader = match attr.data(ntfs) {
                        Ok(r) => r,
                        Err(_) => continue,
                    };
                    let size = attr.data_size();
                    let mut offset = 0i64;
                    while offset < size {
                        let mut block = vec![0u8; INDEX_BLOCK_SIZE];
                        match read_some_at(&reader, offset as u64, &mut block) {
                            Ok(n) if n > 0 => match decode_index_block(block, offset as u64) {
                                Ok(node) => result.push(node),
                                Err(e) => debug!("bad INDX block at {}: {}", offset, e),
                            },
                            _ => {}
                        }
                        offset += INDEX_BLOCK_SIZE as i64;
                    }
                }
                _ => {}
            }
        }

        result
    }

    /// Live directory entries, in index-tree order.
    pub fn dir(&self, ntfs: &NtfsContext) -> Vec<IndexRecordEntry> {
        let mut result = Vec::new();
        for node in self.dir_nodes(ntfs) {
            result.extend(node.records());
        }
        result
    }

    /// Walk a path from this directory. Components match
    /// case-insensitively; both separators are accepted.
    pub fn open(&self, ntfs: &NtfsContext, path: &str) -> Result<MftEntry> {
        let normalized = path.replace('\\', "/");
        let mut current = self.clone();

        for component in normalized.split('/') {
            if component.is_empty() || component == "." {
                continue;
            }
            let wanted = component.to_lowercase();
            let mut found = None;
            for record in current.dir(ntfs) {
                if let Some(fnm) = record.file() {
                    if fnm.name().to_lowercase() == wanted {
                        found = Some(record.mft_reference());
                        break;
                    }
                }
            }
            match found {
                Some(reference) => current = ntfs.get_mft(reference)?,
                None => {
                    return Err(NtfsError::NotFound(format!(
                        "path component {:?} not found",
                        component
                    )))
                }
            }
        }

        Ok(current)
    }
}

impl std::fmt::Debug for MftEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MftEntry({} seq {} @ {:#x})",
            self.record_number(),
            self.sequence_value(),
            self.disk_offset()
        )
    }
}

/// File name type stored in a `$FILE_NAME` attribute.
pub fn name_type_name(name_type: u8) -> &'static str {
    match name_type {
        0 => "POSIX",
        1 => "Win32",
        2 => "DOS",
        3 => "DOS+Win32",
        _ => "Unknown",
    }
}

/// A decoded `$FILE_NAME` attribute value.
#[derive(Clone)]
pub struct FileName {
    data: Vec<u8>,
}

impl FileName {
    /// Header size up to (and excluding) the name characters.
    pub const MIN_SIZE: usize = 66;

    /// Decode from a byte slice; `None` when even the header is missing.
    pub fn from_slice(data: &[u8]) -> Option<FileName> {
        if data.len() < Self::MIN_SIZE {
            return None;
        }
        let name_len = (data[64] as usize).min(MAX_FILENAME_UNITS) * 2;
        let end = (Self::MIN_SIZE + name_len).min(data.len());
        Some(FileName {
            data: data[..end].to_vec(),
        })
    }

    /// Decode from an attribute content stream.
    pub fn from_stream(reader: &RangeReader) -> Option<FileName> {
        let mut buf = vec![0u8; Self::MIN_SIZE + MAX_FILENAME_UNITS * 2];
        let n = read_some_at(reader, 0, &mut buf).ok()?;
        buf.truncate(n);
        Self::from_slice(&buf)
    }

    /// Parent MFT id (lower 48 bits of the reference).
    pub fn mft_reference(&self) -> u64 {
        buf_u64(&self.data, 0) & 0x0000_FFFF_FFFF_FFFF
    }

    /// Sequence number the parent must have for this link to be live.
    pub fn parent_sequence(&self) -> u16 {
        buf_u16(&self.data, 6)
    }

    pub fn created_raw(&self) -> u64 {
        buf_u64(&self.data, 8)
    }

    pub fn file_modified_raw(&self) -> u64 {
        buf_u64(&self.data, 16)
    }

    pub fn mft_modified_raw(&self) -> u64 {
        buf_u64(&self.data, 24)
    }

    pub fn file_accessed_raw(&self) -> u64 {
        buf_u64(&self.data, 32)
    }

    pub fn created(&self) -> DateTime<Utc> {
        filetime_to_datetime(self.created_raw())
    }

    pub fn file_modified(&self) -> DateTime<Utc> {
        filetime_to_datetime(self.file_modified_raw())
    }

    pub fn mft_modified(&self) -> DateTime<Utc> {
        filetime_to_datetime(self.mft_modified_raw())
    }

    pub fn file_accessed(&self) -> DateTime<Utc> {
        filetime_to_datetime(self.file_accessed_raw())
    }

    pub fn allocated_size(&self) -> u64 {
        buf_u64(&self.data, 40)
    }

    pub fn size(&self) -> u64 {
        buf_u64(&self.data, 48)
    }

    pub fn file_flags(&self) -> u32 {
        buf_u32(&self.data, 56)
    }

    pub fn name_type(&self) -> u8 {
        self.data.get(65).copied().unwrap_or(0)
    }

    pub fn name_type_name(&self) -> &'static str {
        name_type_name(self.name_type())
    }

    pub fn name(&self) -> String {
        let len = (self.data.get(64).copied().unwrap_or(0) as usize).min(MAX_FILENAME_UNITS) * 2;
        let end = (Self::MIN_SIZE + len).min(self.data.len());
        parse_utf16le(&self.data[Self::MIN_SIZE..end])
    }
}

impl std::fmt::Debug for FileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FileName({:?} type {} parent {}-{})",
            self.name(),
            self.name_type_name(),
            self.mft_reference(),
            self.parent_sequence()
        )
    }
}

// $STANDARD_INFORMATION flag bits, as they appear in stat output.
const SI_FLAG_NAMES: [(u32, &str); 13] = [
    (0x0001, "READ_ONLY"),
    (0x0002, "HIDDEN"),
    (0x0004, "SYSTEM"),
    (0x0020, "ARCHIVE"),
    (0x0040, "DEVICE"),
    (0x0080, "NORMAL"),
    (0x0100, "TEMPORARY"),
    (0x0200, "SPARSE"),
    (0x0400, "REPARSE_POINT"),
    (0x0800, "COMPRESSED"),
    (0x1000, "OFFLINE"),
    (0x2000, "NOT_INDEXED"),
    (0x4000, "ENCRYPTED"),
];

/// A decoded `$STANDARD_INFORMATION` attribute value.
#[derive(Clone)]
pub struct StandardInformation {
    data: Vec<u8>,
}

impl StandardInformation {
    pub fn from_reader(reader: &RangeReader) -> Result<StandardInformation> {
        let mut buf = vec![0u8; 72];
        let n = read_some_at(reader, 0, &mut buf)?;
        if n < 36 {
            return Err(NtfsError::ShortRead {
                offset: 0,
                wanted: 36,
                got: n,
            });
        }
        buf.truncate(n);
        Ok(StandardInformation { data: buf })
    }

    pub fn create_time_raw(&self) -> u64 {
        buf_u64(&self.data, 0)
    }

    pub fn file_altered_time_raw(&self) -> u64 {
        buf_u64(&self.data, 8)
    }

    pub fn mft_altered_time_raw(&self) -> u64 {
        buf_u64(&self.data, 16)
    }

    pub fn file_accessed_time_raw(&self) -> u64 {
        buf_u64(&self.data, 24)
    }

    pub fn create_time(&self) -> DateTime<Utc> {
        filetime_to_datetime(self.create_time_raw())
    }

    pub fn file_altered_time(&self) -> DateTime<Utc> {
        filetime_to_datetime(self.file_altered_time_raw())
    }

    pub fn mft_altered_time(&self) -> DateTime<Utc> {
        filetime_to_datetime(self.mft_altered_time_raw())
    }

    pub fn file_accessed_time(&self) -> DateTime<Utc> {
        filetime_to_datetime(self.file_accessed_time_raw())
    }

    pub fn flags(&self) -> u32 {
        buf_u32(&self.data, 32)
    }

    /// Flag names, for user-facing records.
    pub fn flag_names(&self) -> Vec<&'static str> {
        let flags = self.flags();
        SI_FLAG_NAMES
            .iter()
            .filter(|(bit, _)| flags & bit != 0)
            .map(|&(_, name)| name)
            .collect()
    }
}
