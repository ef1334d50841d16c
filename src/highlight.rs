//! Bulk MFT triage.
//!
//! `parse_mft_file` sweeps an entire `$MFT` stream (typically extracted
//! from an image, sometimes carved) slot by slot and emits one summary
//! row per decodable record, plus one row per alternate data stream.
//! Records whose fixups fail are skipped, not fatal: half the point is
//! running this over damaged evidence.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::attribute::{
    ATTR_TYPE_DATA, ATTR_TYPE_FILE_NAME, ATTR_TYPE_INDEX_ROOT, ATTR_TYPE_STANDARD_INFORMATION,
};
use crate::context::NtfsContext;
use crate::hardlinks::{display_name, full_path_components, get_hard_links};
use crate::mft::{FileName, MftEntry, StandardInformation};
use crate::reader::ReadAt;
use crate::stat::InodeFormatter;
use crate::CancelToken;

/// One row of the bulk MFT sweep.
///
/// Rows are plain data and serialize directly; `full_path` and `links`
/// are resolved lazily through the iterator's context because they can
/// cost an MFT walk each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MftHighlight {
    pub entry_number: u64,
    pub inode: String,
    pub sequence: u16,
    pub in_use: bool,
    pub parent_entry_number: u64,
    pub parent_sequence: u16,
    pub file_name: String,
    pub file_names: Vec<String>,
    pub file_size: i64,
    pub reference_count: u16,
    pub is_dir: bool,
    pub has_ads: bool,
    pub si_flags: Vec<String>,

    pub created_0x10: DateTime<Utc>,
    pub created_0x30: DateTime<Utc>,
    pub last_modified_0x10: DateTime<Utc>,
    pub last_modified_0x30: DateTime<Utc>,
    pub last_record_change_0x10: DateTime<Utc>,
    pub last_record_change_0x30: DateTime<Utc>,
    pub last_access_0x10: DateTime<Utc>,
    pub last_access_0x30: DateTime<Utc>,

    pub logfile_seq_num: u64,
}

impl MftHighlight {
    /// Resolve the row's primary path: the parent chain joined with this
    /// row's own name (works for deleted entries whose parent survives).
    pub fn full_path(&self, ntfs: &NtfsContext) -> String {
        match ntfs.get_mft(self.parent_entry_number) {
            Ok(parent) => {
                let mut components = full_path_components(ntfs, &parent);
                components.push(self.file_name.clone());
                format!("/{}", components.join("/"))
            }
            Err(_) => format!("/<unknown>/{}", self.file_name),
        }
    }

    /// Every path this row's entry is known by.
    pub fn links(&self, ntfs: &NtfsContext) -> Vec<Vec<String>> {
        get_hard_links(ntfs, self.entry_number, self.sequence, 0)
    }
}

/// Sweep a raw `$MFT` stream, yielding highlight rows.
///
/// `size` bounds the sweep; `record_size` is the slot size (1024 on
/// nearly every volume). The iterator owns a synthetic context over the
/// stream so parent lookups and attribute lists resolve within it.
pub fn parse_mft_file(
    reader: Arc<dyn ReadAt>,
    size: i64,
    cluster_size: i64,
    record_size: i64,
    token: CancelToken,
) -> MftHighlightIterator {
    let ntfs = NtfsContext::from_mft_stream(reader, cluster_size, record_size.max(1));
    MftHighlightIterator {
        ntfs,
        size,
        record_size: record_size.max(1),
        offset: 0,
        queue: VecDeque::new(),
        token,
    }
}

pub struct MftHighlightIterator {
    ntfs: NtfsContext,
    size: i64,
    record_size: i64,
    offset: i64,
    queue: VecDeque<MftHighlight>,
    token: CancelToken,
}

impl MftHighlightIterator {
    /// The context rows resolve `full_path`/`links` against.
    pub fn context(&self) -> &NtfsContext {
        &self.ntfs
    }

    fn rows_for_entry(&self, entry: &MftEntry) -> Vec<MftHighlight> {
        let mut file_names: Vec<FileName> = Vec::new();
        let mut si: Option<StandardInformation> = None;
        let mut size: i64 = 0;
        let mut ads: Vec<(u16, String, i64)> = Vec::new();
        let mut unnamed_data: Option<(u16, u64)> = None;
        let mut index_attr: Option<(u16, u64)> = None;

        for attr in entry.enumerate_attributes(&self.ntfs) {
            match attr.attr_type() {
                ATTR_TYPE_DATA => {
                    if !attr.is_resident() && attr.vcn_start() != 0 {
                        continue;
                    }
                    let name = attr.name();
                    if name.is_empty() {
                        if size == 0 {
                            size = attr.data_size();
                        }
                        if unnamed_data.is_none() {
                            unnamed_data = Some((attr.attribute_id(), attr.attr_type()));
                        }
                    } else {
                        ads.push((attr.attribute_id(), name, attr.data_size()));
                    }
                }
                ATTR_TYPE_FILE_NAME => {
                    if let Ok(reader) = attr.data(&self.ntfs) {
                        if let Some(file_name) = FileName::from_stream(&reader) {
                            file_names.push(file_name);
                        }
                    }
                }
                ATTR_TYPE_STANDARD_INFORMATION => {
                    if let Ok(reader) = attr.data(&self.ntfs) {
                        si = StandardInformation::from_reader(&reader).ok();
                    }
                }
                ATTR_TYPE_INDEX_ROOT => {
                    index_attr = Some((attr.attribute_id(), attr.attr_type()));
                }
                _ => {}
            }
        }

        // A record without names or standard times is either free or an
        // extension record; neither is a row of its own.
        if file_names.is_empty() {
            return Vec::new();
        }
        let Some(si) = si else {
            return Vec::new();
        };

        let entry_number = entry.record_number();
        let first_name = &file_names[0];

        let mut inode_formatter = InodeFormatter::default();
        let inode = match (unnamed_data, index_attr) {
            (Some((attr_id, attr_type)), _) | (None, Some((attr_id, attr_type))) => {
                inode_formatter.inode(entry_number, attr_type, attr_id, "")
            }
            (None, None) => format!("{}-{}-0", entry_number, ATTR_TYPE_DATA),
        };

        let row = MftHighlight {
            entry_number,
            inode,
            sequence: entry.sequence_value(),
            in_use: entry.is_allocated(),
            parent_entry_number: first_name.mft_reference(),
            parent_sequence: first_name.parent_sequence(),
            file_name: display_name(&file_names),
            file_names: file_names.iter().map(|f| f.name()).collect(),
            file_size: size,
            reference_count: entry.link_count(),
            is_dir: entry.is_directory_flag(),
            has_ads: !ads.is_empty(),
            si_flags: si.flag_names().iter().map(|s| s.to_string()).collect(),
            created_0x10: si.create_time(),
            created_0x30: first_name.created(),
            last_modified_0x10: si.file_altered_time(),
            last_modified_0x30: first_name.file_modified(),
            last_record_change_0x10: si.mft_altered_time(),
            last_record_change_0x30: first_name.mft_modified(),
            last_access_0x10: si.file_accessed_time(),
            last_access_0x30: first_name.file_accessed(),
            logfile_seq_num: entry.logfile_sequence_number(),
        };

        let mut rows = vec![row.clone()];
        for (attr_id, name, ads_size) in ads {
            let mut ads_row = row.clone();
            ads_row.inode = format!(
                "{}-{}-{}:{}",
                entry_number, ATTR_TYPE_DATA, attr_id, name
            );
            ads_row.file_name = format!("{}:{}", row.file_name, name);
            ads_row.file_size = ads_size;
            ads_row.is_dir = false;
            rows.push(ads_row);
        }
        rows
    }
}

impl Iterator for MftHighlightIterator {
    type Item = MftHighlight;

    fn next(&mut self) -> Option<MftHighlight> {
        loop {
            if self.token.is_cancelled() {
                return None;
            }

            if let Some(row) = self.queue.pop_front() {
                return Some(row);
            }

            if self.offset >= self.size {
                return None;
            }
            let offset = self.offset;
            self.offset += self.record_size;

            let entry = match MftEntry::from_reader(
                &self.ntfs.mft_reader(),
                offset as u64,
                self.record_size as usize,
            ) {
                Ok(entry) => entry,
                Err(e) => {
                    // Free slots and torn records are expected mid-sweep.
                    debug!("skipping MFT slot at {:#x}: {}", offset, e);
                    continue;
                }
            };

            let rows = self.rows_for_entry(&entry);
            self.queue.extend(rows);
        }
    }
}
