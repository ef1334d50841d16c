//! USN change journal (`$Extend\$UsnJrnl:$J`).
//!
//! The `$J` stream is mostly sparse: old records are punched out and new
//! ones appended, with zero padding between records. The iterator walks
//! only the non-sparse ranges, advancing record by record and
//! resynchronizing across padding; the carver sweeps arbitrary byte
//! ranges (free space, unallocated clusters) for records that survived
//! deletion.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::attribute::ATTR_TYPE_DATA;
use crate::context::NtfsContext;
use crate::error::{NtfsError, Result};
use crate::mft::{filetime_to_datetime, filetime_unix_seconds};
use crate::reader::{read_some_at, ReadAt};
use crate::runs::{Range, RangeReader};
use crate::stream::open_stream;
use crate::CancelToken;

/// V2 record header size; shorter candidates are garbage.
const USN_HEADER_SIZE: usize = 60;

/// Record lengths outside [64, 1024] are implausible.
const MIN_RECORD_LENGTH: u32 = 64;
const MAX_RECORD_LENGTH: u32 = 1024;

/// How much padding the resynchronizer reads per step.
const RESYNC_CHUNK: usize = 0x10000;

/// Longest file name we will pull out of a record, in bytes.
const MAX_USN_NAME_BYTES: usize = 510;

// Carving accepts timestamps in this window only (unix seconds,
// 2020-01-01 .. 2040-01-01).
const CARVE_EARLIEST: i64 = 1_577_836_800;
const CARVE_LATEST: i64 = 2_208_988_800;

const REASON_NAMES: [(u32, &str); 22] = [
    (0x0000_0001, "DATA_OVERWRITE"),
    (0x0000_0002, "DATA_EXTEND"),
    (0x0000_0004, "DATA_TRUNCATION"),
    (0x0000_0010, "NAMED_DATA_OVERWRITE"),
    (0x0000_0020, "NAMED_DATA_EXTEND"),
    (0x0000_0040, "NAMED_DATA_TRUNCATION"),
    (0x0000_0100, "FILE_CREATE"),
    (0x0000_0200, "FILE_DELETE"),
    (0x0000_0400, "EA_CHANGE"),
    (0x0000_0800, "SECURITY_CHANGE"),
    (0x0000_1000, "RENAME_OLD_NAME"),
    (0x0000_2000, "RENAME_NEW_NAME"),
    (0x0000_4000, "INDEXABLE_CHANGE"),
    (0x0000_8000, "BASIC_INFO_CHANGE"),
    (0x0001_0000, "HARD_LINK_CHANGE"),
    (0x0002_0000, "COMPRESSION_CHANGE"),
    (0x0004_0000, "ENCRYPTION_CHANGE"),
    (0x0008_0000, "OBJECT_ID_CHANGE"),
    (0x0010_0000, "REPARSE_POINT_CHANGE"),
    (0x0020_0000, "STREAM_CHANGE"),
    (0x0040_0000, "TRANSACTED_CHANGE"),
    (0x8000_0000, "CLOSE"),
];

const SOURCE_INFO_NAMES: [(u32, &str); 3] = [
    (0x0000_0001, "DATA_MANAGEMENT"),
    (0x0000_0002, "AUXILIARY_DATA"),
    (0x0000_0004, "REPLICATION_MANAGEMENT"),
];

const FILE_ATTRIBUTE_NAMES: [(u32, &str); 14] = [
    (0x0000_0001, "READ_ONLY"),
    (0x0000_0002, "HIDDEN"),
    (0x0000_0004, "SYSTEM"),
    (0x0000_0010, "DIRECTORY"),
    (0x0000_0020, "ARCHIVE"),
    (0x0000_0040, "DEVICE"),
    (0x0000_0080, "NORMAL"),
    (0x0000_0100, "TEMPORARY"),
    (0x0000_0200, "SPARSE_FILE"),
    (0x0000_0400, "REPARSE_POINT"),
    (0x0000_0800, "COMPRESSED"),
    (0x0000_1000, "OFFLINE"),
    (0x0000_2000, "NOT_CONTENT_INDEXED"),
    (0x0000_4000, "ENCRYPTED"),
];

fn flag_names(value: u32, table: &'static [(u32, &'static str)]) -> Vec<&'static str> {
    table
        .iter()
        .filter(|(bit, _)| value & bit != 0)
        .map(|&(_, name)| name)
        .collect()
}

/// One USN_RECORD_V2 view over a stream.
#[derive(Clone)]
pub struct UsnRecord {
    reader: Arc<dyn ReadAt>,
    pub offset: i64,
    header: [u8; USN_HEADER_SIZE],
}

impl UsnRecord {
    pub fn new(reader: Arc<dyn ReadAt>, offset: i64) -> UsnRecord {
        let mut header = [0u8; USN_HEADER_SIZE];
        let _ = read_some_at(reader.as_ref(), offset.max(0) as u64, &mut header);
        UsnRecord {
            reader,
            offset,
            header,
        }
    }

    fn u16_at(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.header[off], self.header[off + 1]])
    }

    fn u32_at(&self, off: usize) -> u32 {
        u32::from_le_bytes(self.header[off..off + 4].try_into().unwrap())
    }

    fn u64_at(&self, off: usize) -> u64 {
        u64::from_le_bytes(self.header[off..off + 8].try_into().unwrap())
    }

    pub fn record_length(&self) -> u32 {
        self.u32_at(0)
    }

    pub fn major_version(&self) -> u16 {
        self.u16_at(4)
    }

    pub fn minor_version(&self) -> u16 {
        self.u16_at(6)
    }

    /// MFT id of the file this record describes.
    pub fn file_reference(&self) -> u64 {
        self.u64_at(8) & 0x0000_FFFF_FFFF_FFFF
    }

    pub fn file_sequence(&self) -> u16 {
        (self.u64_at(8) >> 48) as u16
    }

    pub fn parent_reference(&self) -> u64 {
        self.u64_at(16) & 0x0000_FFFF_FFFF_FFFF
    }

    pub fn parent_sequence(&self) -> u16 {
        (self.u64_at(16) >> 48) as u16
    }

    pub fn usn(&self) -> u64 {
        self.u64_at(24)
    }

    pub fn timestamp_raw(&self) -> u64 {
        self.u64_at(32)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        filetime_to_datetime(self.timestamp_raw())
    }

    pub fn reason_raw(&self) -> u32 {
        self.u32_at(40)
    }

    pub fn source_info_raw(&self) -> u32 {
        self.u32_at(44)
    }

    pub fn security_id(&self) -> u32 {
        self.u32_at(48)
    }

    pub fn file_attributes_raw(&self) -> u32 {
        self.u32_at(52)
    }

    fn name_length(&self) -> u16 {
        self.u16_at(56)
    }

    fn name_offset(&self) -> u16 {
        self.u16_at(58)
    }

    pub fn filename(&self) -> String {
        let len = (self.name_length() as usize).min(MAX_USN_NAME_BYTES);
        if len == 0 {
            return String::new();
        }
        let mut buf = vec![0u8; len];
        let start = self.offset + self.name_offset() as i64;
        match read_some_at(self.reader.as_ref(), start.max(0) as u64, &mut buf) {
            Ok(n) => crate::attribute::parse_utf16le(&buf[..n & !1]),
            Err(_) => String::new(),
        }
    }

    pub fn reason(&self) -> Vec<&'static str> {
        flag_names(self.reason_raw(), &REASON_NAMES)
    }

    pub fn source_info(&self) -> Vec<&'static str> {
        flag_names(self.source_info_raw(), &SOURCE_INFO_NAMES)
    }

    pub fn file_attributes(&self) -> Vec<&'static str> {
        flag_names(self.file_attributes_raw(), &FILE_ATTRIBUTE_NAMES)
    }

    /// Minimum plausibility for sequential iteration.
    pub fn validate(&self) -> bool {
        self.usn() > 0 && self.record_length() != 0
    }

    /// Strict validity: what carving and the iteration invariant demand.
    pub fn validate_strict(&self) -> bool {
        let length = self.record_length();
        if !(MIN_RECORD_LENGTH..=MAX_RECORD_LENGTH).contains(&length) || length % 8 != 0 {
            return false;
        }
        self.major_version() == 2
    }

    /// The record following this one, staying inside `[.., max_offset)`.
    ///
    /// The nominal successor sits at `offset + record_length`; when that
    /// does not hold a valid record, scan forward for the next non-zero
    /// byte (the journal zero-pads between records) and try again there.
    pub fn next(&self, max_offset: i64) -> Option<UsnRecord> {
        let length = self.record_length() as i64;

        if length > 0 && length < MAX_RECORD_LENGTH as i64 && (self.offset + length) % 8 == 0 {
            let candidate = UsnRecord::new(self.reader.clone(), self.offset + length);
            if candidate.offset < max_offset && candidate.validate() {
                return Some(candidate);
            }
        }

        resync(&self.reader, self.offset + length, max_offset)
    }

    /// All paths of this record's file, resolved through the *parent*
    /// entry (the file itself may already be deleted) with the record's
    /// own name appended. Backslash separated.
    pub fn links(&self, ntfs: &NtfsContext) -> Vec<String> {
        if ntfs.options().disable_full_path_resolution {
            return vec![self.filename()];
        }

        let parent_id = self.parent_reference();
        let parent_seq = self.parent_sequence();

        // Verify the parent is the incarnation this record was written
        // against; a recycled parent would produce a nonsensical path.
        match ntfs
            .summary_cache()
            .require_summary(ntfs, parent_id, parent_seq)
        {
            Ok(_) => {}
            Err(NtfsError::InvalidParent {
                entry,
                actual,
                required,
            }) => {
                return vec![format!(
                    "<Err>\\<Parent {}-{} need {}>\\{}",
                    entry,
                    actual,
                    required,
                    self.filename()
                )]
            }
            Err(e) => {
                return vec![format!(
                    "<Err>\\<Parent {} Error {}>\\{}",
                    parent_id,
                    e,
                    self.filename()
                )]
            }
        }

        let components = crate::hardlinks::get_hard_links(ntfs, parent_id, parent_seq, 0);
        if components.is_empty() {
            return vec![self.filename()];
        }
        components
            .into_iter()
            .map(|mut path| {
                path.push(self.filename());
                path.join("\\")
            })
            .collect()
    }

    /// The first resolved path.
    pub fn full_path(&self, ntfs: &NtfsContext) -> String {
        self.links(ntfs).into_iter().next().unwrap_or_default()
    }

    /// The serializable summary of this record.
    pub fn info(&self) -> UsnRecordInfo {
        UsnRecordInfo {
            usn: self.usn(),
            offset: self.offset,
            name: self.filename(),
            file_reference: self.file_reference(),
            file_sequence: self.file_sequence(),
            parent_reference: self.parent_reference(),
            parent_sequence: self.parent_sequence(),
            timestamp: self.timestamp(),
            reason: self.reason().iter().map(|s| s.to_string()).collect(),
            attributes: self
                .file_attributes()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            source_info: self.source_info().iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl std::fmt::Debug for UsnRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UsnRecord(usn {:#x} @ {:#x} {:?})",
            self.usn(),
            self.offset,
            self.filename()
        )
    }
}

/// Serializable form of a USN record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsnRecordInfo {
    pub usn: u64,
    pub offset: i64,
    pub name: String,
    pub file_reference: u64,
    pub file_sequence: u16,
    pub parent_reference: u64,
    pub parent_sequence: u16,
    pub timestamp: DateTime<Utc>,
    pub reason: Vec<String>,
    pub attributes: Vec<String>,
    pub source_info: Vec<String>,
}

/// Scan forward from `offset` for the first position holding a record
/// that validates. Padding between records is zeros, so only non-zero
/// bytes are probed.
fn resync(reader: &Arc<dyn ReadAt>, mut offset: i64, max_offset: i64) -> Option<UsnRecord> {
    while offset < max_offset {
        let to_read = ((max_offset - offset) as usize).min(RESYNC_CHUNK);
        let mut data = vec![0u8; to_read];
        let n = match read_some_at(reader.as_ref(), offset as u64, &mut data) {
            Ok(0) | Err(_) => return None,
            Ok(n) => n,
        };

        for (i, &byte) in data[..n].iter().enumerate() {
            if byte != 0 {
                let candidate = UsnRecord::new(reader.clone(), offset + i as i64);
                if candidate.validate() {
                    return Some(candidate);
                }
            }
        }

        offset += n as i64;
    }
    None
}

/// Locate the `$J` stream of `$Extend\$UsnJrnl` and open it.
pub fn open_usn_stream(ntfs: &NtfsContext) -> Result<RangeReader> {
    let root = ntfs.get_mft(crate::mft::MFT_RECORD_ROOT)?;
    let entry = root.open(ntfs, "$Extend/$UsnJrnl")?;

    for attr in entry.enumerate_attributes(ntfs) {
        if attr.attr_type() == ATTR_TYPE_DATA && attr.name() == "$J" {
            return open_stream(
                ntfs,
                &entry,
                ATTR_TYPE_DATA,
                attr.attribute_id(),
                Some("$J"),
            );
        }
    }
    Err(NtfsError::NotFound("$Extend\\$UsnJrnl:$J".into()))
}

/// Sequential iterator over USN records, ordered by offset.
pub struct UsnIterator {
    stream: Arc<RangeReader>,
    ranges: Vec<Range>,
    range_idx: usize,
    pending: Option<UsnRecord>,
    /// End of the range the pending record came from; a record never
    /// crosses into the following (sparse) range.
    run_end: i64,
    starting_offset: i64,
    token: CancelToken,
}

/// Iterate USN records from `starting_offset` to the stream's end.
pub fn parse_usn(stream: Arc<RangeReader>, starting_offset: i64, token: CancelToken) -> UsnIterator {
    let ranges = stream.ranges();
    UsnIterator {
        stream,
        ranges,
        range_idx: 0,
        pending: None,
        run_end: 0,
        starting_offset,
        token,
    }
}

impl Iterator for UsnIterator {
    type Item = UsnRecord;

    fn next(&mut self) -> Option<UsnRecord> {
        loop {
            if self.token.is_cancelled() {
                return None;
            }

            if let Some(record) = self.pending.take() {
                self.pending = record.next(self.run_end);
                if record.offset >= self.starting_offset {
                    return Some(record);
                }
                continue;
            }

            // Seed from the next non-sparse range holding records.
            if self.range_idx >= self.ranges.len() {
                return None;
            }
            let rng = self.ranges[self.range_idx];
            self.range_idx += 1;
            if rng.is_sparse || self.starting_offset > rng.offset + rng.length {
                continue;
            }

            let reader: Arc<dyn ReadAt> = self.stream.clone();
            let run_end = rng.offset + rng.length;
            let first = UsnRecord::new(reader.clone(), rng.offset);
            self.pending = if first.validate() {
                Some(first)
            } else {
                resync(&reader, rng.offset, run_end)
            };
            self.run_end = run_end;
        }
    }
}

/// Follow the journal live: parse everything past the last existing
/// record, then keep re-reading (purging caches first) every `period`.
pub fn watch_usn(ntfs: NtfsContext, period: Duration, token: CancelToken) -> UsnWatcher {
    UsnWatcher {
        ntfs,
        period: if period.is_zero() {
            Duration::from_secs(30)
        } else {
            period
        },
        token,
        start_offset: 0,
        seeded: false,
        queue: VecDeque::new(),
    }
}

pub struct UsnWatcher {
    ntfs: NtfsContext,
    period: Duration,
    token: CancelToken,
    start_offset: i64,
    seeded: bool,
    queue: VecDeque<UsnRecord>,
}

impl UsnWatcher {
    /// Offset of the journal's final record, if any.
    fn last_usn_offset(&self) -> Result<i64> {
        let stream = Arc::new(open_usn_stream(&self.ntfs)?);
        let last_range = stream
            .ranges()
            .into_iter()
            .filter(|r| !r.is_sparse)
            .next_back()
            .ok_or(NtfsError::EndOfFile)?;

        let mut result = None;
        for record in parse_usn(stream, last_range.offset, self.token.clone()) {
            result = Some(record.offset);
        }
        result.ok_or(NtfsError::EndOfFile)
    }

    /// Sleep one period, waking early on cancellation.
    fn sleep(&self) {
        let mut remaining = self.period;
        let step = Duration::from_millis(100);
        while !remaining.is_zero() && !self.token.is_cancelled() {
            let chunk = remaining.min(step);
            std::thread::sleep(chunk);
            remaining -= chunk;
        }
    }
}

impl Iterator for UsnWatcher {
    type Item = UsnRecord;

    fn next(&mut self) -> Option<UsnRecord> {
        loop {
            if self.token.is_cancelled() {
                return None;
            }

            if let Some(record) = self.queue.pop_front() {
                return Some(record);
            }

            if !self.seeded {
                match self.last_usn_offset() {
                    Ok(offset) => {
                        self.start_offset = offset;
                        self.seeded = true;
                    }
                    Err(e) => {
                        debug!("usn watch cannot seed yet: {}", e);
                        self.sleep();
                        continue;
                    }
                }
            }

            // Fresh pass over the journal.
            self.ntfs.purge();
            let stream = match open_usn_stream(&self.ntfs) {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    debug!("usn watch cannot reopen stream: {}", e);
                    return None;
                }
            };

            for record in parse_usn(stream, self.start_offset, self.token.clone()) {
                if record.offset > self.start_offset {
                    self.start_offset = record.offset;
                    self.queue.push_back(record);
                }
            }

            if self.queue.is_empty() {
                self.sleep();
            }
        }
    }
}

/// A record recovered from raw bytes rather than the live journal.
#[derive(Debug, Clone)]
pub struct UsnCarvedRecord {
    pub record: UsnRecord,
    /// Physical offset of the record within the carved source.
    pub disk_offset: i64,
}

/// Sweep `size` bytes of `reader` for USN records, in overlapping
/// windows, probing every 16-byte-aligned position.
pub fn carve_usn(
    cluster_size: i64,
    reader: Arc<dyn ReadAt>,
    size: i64,
    token: CancelToken,
) -> UsnCarver {
    let cluster = if cluster_size > 0 { cluster_size } else { 0x1000 };
    UsnCarver {
        reader,
        size,
        token,
        cluster_size: cluster,
        window: Vec::new(),
        window_base: 0,
        window_len: 0,
        probe: 0,
        exhausted: false,
    }
}

pub struct UsnCarver {
    reader: Arc<dyn ReadAt>,
    size: i64,
    token: CancelToken,
    cluster_size: i64,

    window: Vec<u8>,
    window_base: i64,
    window_len: usize,
    probe: usize,
    exhausted: bool,
}

impl UsnCarver {
    fn window_size(&self) -> i64 {
        10 * self.cluster_size
    }

    /// Load the next window. Windows overlap by one cluster so a record
    /// split across a boundary is still seen whole once.
    fn advance_window(&mut self) -> bool {
        let next_base = if self.window_len == 0 && self.window_base == 0 {
            0
        } else {
            self.window_base + self.window_size() - self.cluster_size
        };
        if next_base >= self.size {
            return false;
        }

        let want = (self.size - next_base).min(self.window_size()) as usize;
        self.window.clear();
        self.window.resize(want, 0);
        let n = match read_some_at(self.reader.as_ref(), next_base as u64, &mut self.window) {
            Ok(n) => n,
            Err(_) => 0,
        };
        if n < USN_HEADER_SIZE + 4 {
            return false;
        }

        self.window_base = next_base;
        self.window_len = n;
        // Positions up to one cluster minus a header were already probed
        // by the previous window; resume just past them.
        self.probe = if next_base == 0 {
            0
        } else {
            (self.cluster_size as usize).saturating_sub(64) & !15
        };
        true
    }

    /// Full plausibility test at a candidate position.
    fn test_candidate(&self, pos: i64) -> Option<UsnRecord> {
        let record = UsnRecord::new(self.reader.clone(), pos);
        if !record.validate_strict() || record.minor_version() != 0 {
            return None;
        }
        if record.name_offset() > 255 || record.name_length() > 255 {
            return None;
        }
        let unix = filetime_unix_seconds(record.timestamp_raw());
        if !(CARVE_EARLIEST..=CARVE_LATEST).contains(&unix) {
            return None;
        }
        Some(record)
    }
}

impl Iterator for UsnCarver {
    type Item = UsnCarvedRecord;

    fn next(&mut self) -> Option<UsnCarvedRecord> {
        if self.exhausted {
            return None;
        }

        loop {
            if self.token.is_cancelled() {
                self.exhausted = true;
                return None;
            }

            if self.window_len == 0 || self.probe + USN_HEADER_SIZE >= self.window_len {
                if !self.advance_window() {
                    self.exhausted = true;
                    return None;
                }
            }

            while self.probe + USN_HEADER_SIZE < self.window_len {
                let j = self.probe;
                self.probe += 16;

                // Major version 2, minor 0: cheap screen before the full
                // record test.
                if self.window[j + 4] != 2
                    || self.window[j + 5] != 0
                    || self.window[j + 6] != 0
                    || self.window[j + 7] != 0
                {
                    continue;
                }

                let pos = self.window_base + j as i64;
                if let Some(record) = self.test_candidate(pos) {
                    return Some(UsnCarvedRecord {
                        record,
                        disk_offset: pos,
                    });
                }
            }
        }
    }
}
