//! Directory indexes (`$I30`).
//!
//! Small directories keep their entries in the resident `$INDEX_ROOT`
//! attribute; larger ones spill into 4 KiB `$INDEX_ALLOCATION` blocks that
//! carry a second layer of fixups. Deleted entries are not scrubbed, so
//! the slack between the last live entry and the end of the allocation
//! frequently holds stale records — the slack scanner carves those out,
//! keeping only candidates whose four embedded timestamps look sane.

use std::sync::Arc;

use crate::error::{NtfsError, Result};
use crate::fixup::apply_fixup;
use crate::mft::{filetime_unix_seconds, FileName};

/// Size of one `$INDEX_ALLOCATION` block.
pub const INDEX_BLOCK_SIZE: usize = 0x1000;

// INDX block header layout.
const INDX_FIXUP_OFFSET: usize = 4;
const INDX_FIXUP_COUNT: usize = 6;
const INDX_NODE_OFFSET: usize = 24;

// Node header layout (relative to the node header start).
const NODE_OFF_ENTRY_START: usize = 0;
const NODE_OFF_ENTRY_END: usize = 4;
const NODE_OFF_ALLOC_SIZE: usize = 8;

// Index record entry layout.
const ENTRY_OFF_SIZE: usize = 8;
const ENTRY_OFF_FILE_NAME: usize = 16;

/// Slack scanning stops this many bytes short of the allocation end: a
/// candidate needs at least a full FILE_NAME header to be worth testing.
const SLACK_TAIL_MARGIN: u32 = 0x52;

/// Timestamps outside this window mark a carved candidate as garbage
/// (2001-09-09 .. 2033-05-18 in unix seconds).
const EARLIEST_VALID_TIME: i64 = 1_000_000_000;
const LATEST_VALID_TIME: i64 = 2_000_000_000;

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

/// One index node: a shared buffer plus the node header position inside
/// it. `base_offset` is where the buffer sits within its stream, so slack
/// hits can be reported with a real position.
#[derive(Clone)]
pub struct IndexNode {
    data: Arc<Vec<u8>>,
    node_offset: usize,
    base_offset: u64,
}

impl IndexNode {
    /// The node inside a resident `$INDEX_ROOT` value (header at +16).
    pub fn from_index_root(content: Vec<u8>) -> Option<IndexNode> {
        if content.len() < 32 {
            return None;
        }
        Some(IndexNode {
            data: Arc::new(content),
            node_offset: 16,
            base_offset: 0,
        })
    }

    fn node_u32(&self, rel: usize) -> u32 {
        buf_u32(&self.data, self.node_offset + rel)
    }

    pub fn entry_start(&self) -> u32 {
        self.node_u32(NODE_OFF_ENTRY_START)
    }

    pub fn entry_end(&self) -> u32 {
        self.node_u32(NODE_OFF_ENTRY_END)
    }

    pub fn alloc_size(&self) -> u32 {
        self.node_u32(NODE_OFF_ALLOC_SIZE)
    }

    /// Walk the live entries from the node's entry area. Entries have
    /// varied sizes; a zero size terminates the walk.
    pub fn records(&self) -> Vec<IndexRecordEntry> {
        let mut result = Vec::new();
        let start = self.node_offset + self.entry_start() as usize;
        let end = (self.node_offset + self.entry_end() as usize).min(self.data.len());

        let mut offset = start;
        while offset + FileName::MIN_SIZE < end {
            let record = IndexRecordEntry {
                data: self.data.clone(),
                offset,
                base_offset: self.base_offset,
                is_slack: false,
            };
            let size = record.entry_size() as usize;
            result.push(record);
            if size == 0 {
                break;
            }
            offset += size;
        }

        result
    }

    /// Carve the slack area after the live entries, byte by byte. Only
    /// candidates whose four FILE_NAME timestamps fall inside the validity
    /// window are returned.
    pub fn scan_slack(&self) -> Vec<IndexRecordEntry> {
        let mut result = Vec::new();
        let start = self.node_offset + self.entry_end() as usize;
        let alloc = self.alloc_size().saturating_sub(SLACK_TAIL_MARGIN);
        let end = (self.node_offset + alloc as usize).min(self.data.len());

        let mut offset = start;
        while offset < end {
            let candidate = IndexRecordEntry {
                data: self.data.clone(),
                offset,
                base_offset: self.base_offset,
                is_slack: true,
            };
            if candidate.is_valid() {
                result.push(candidate);
            }
            offset += 1;
        }

        result
    }
}

/// One entry of a directory index: a 48-bit MFT reference followed by an
/// embedded FILE_NAME.
#[derive(Clone)]
pub struct IndexRecordEntry {
    data: Arc<Vec<u8>>,
    offset: usize,
    base_offset: u64,
    is_slack: bool,
}

impl IndexRecordEntry {
    pub fn mft_reference(&self) -> u64 {
        buf_u64(&self.data, self.offset) & 0x0000_FFFF_FFFF_FFFF
    }

    pub fn sequence(&self) -> u16 {
        buf_u16(&self.data, self.offset + 6)
    }

    pub fn entry_size(&self) -> u16 {
        buf_u16(&self.data, self.offset + ENTRY_OFF_SIZE)
    }

    pub fn flags(&self) -> u32 {
        buf_u32(&self.data, self.offset + 12)
    }

    pub fn is_slack(&self) -> bool {
        self.is_slack
    }

    /// Position of this entry within its stream (block base + offset).
    pub fn stream_offset(&self) -> u64 {
        self.base_offset + self.offset as u64
    }

    /// The embedded FILE_NAME, when enough bytes exist for its header.
    pub fn file(&self) -> Option<FileName> {
        let start = self.offset + ENTRY_OFF_FILE_NAME;
        FileName::from_slice(self.data.get(start..)?)
    }

    /// Validity predicate used for slack carving: all four timestamps of
    /// the embedded FILE_NAME fall in the plausible window.
    pub fn is_valid(&self) -> bool {
        let Some(file) = self.file() else {
            return false;
        };
        for raw in [
            file.file_modified_raw(),
            file.file_accessed_raw(),
            file.mft_modified_raw(),
            file.created_raw(),
        ] {
            let unix = filetime_unix_seconds(raw);
            if !(EARLIEST_VALID_TIME..=LATEST_VALID_TIME).contains(&unix) {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for IndexRecordEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "IndexRecordEntry(ref {} @ {}{})",
            self.mft_reference(),
            self.stream_offset(),
            if self.is_slack { " slack" } else { "" }
        )
    }
}

/// Decode one `$INDEX_ALLOCATION` block: verify the INDX magic, apply the
/// second-layer fixup, and expose the node at offset 24.
pub fn decode_index_block(mut block: Vec<u8>, stream_offset: u64) -> Result<IndexNode> {
    if block.len() < INDX_NODE_OFFSET + 16 {
        return Err(NtfsError::ShortRead {
            offset: stream_offset,
            wanted: INDX_NODE_OFFSET + 16,
            got: block.len(),
        });
    }
    if &block[0..4] != b"INDX" {
        return Err(NtfsError::Parse(format!(
            "bad INDX magic at stream offset {:#x}",
            stream_offset
        )));
    }

    let fixup_offset = buf_u16(&block, INDX_FIXUP_OFFSET) as usize;
    let fixup_count = buf_u16(&block, INDX_FIXUP_COUNT) as usize;
    apply_fixup(&mut block, fixup_offset, fixup_count, stream_offset)?;

    Ok(IndexNode {
        data: Arc::new(block),
        node_offset: INDX_NODE_OFFSET,
        base_offset: stream_offset,
    })
}
