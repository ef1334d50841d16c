//! User-facing file information.
//!
//! `stat` flattens one MFT entry into rows an investigator can use
//! directly: canonical `$STANDARD_INFORMATION` times, the Win32 display
//! name with DOS aliases as extra names, one row per `$DATA` stream
//! (alternate streams marked with their `:name` suffix), and the `$I30`
//! listing with slack-carved historical entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attribute::{
    ATTR_TYPE_DATA, ATTR_TYPE_FILE_NAME, ATTR_TYPE_INDEX_ALLOCATION, ATTR_TYPE_INDEX_ROOT,
    ATTR_TYPE_STANDARD_INFORMATION,
};
use crate::context::NtfsContext;
use crate::error::{NtfsError, Result};
use crate::mft::{FileName, MftEntry, StandardInformation, MFT_RECORD_ROOT};
use crate::runs::RangeReader;
use crate::stream::{open_stream, WILDCARD_STREAM_ID};

/// One user-facing row describing a stream of an MFT entry (or a carved
/// index-slack entry).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInfo {
    /// Inode string: `mft-type-attrid`, plus `:name` when ambiguous.
    pub mft_id: String,
    pub sequence_number: u16,
    /// `$STANDARD_INFORMATION` times (FILE_NAME times for slack rows).
    pub mtime: Option<DateTime<Utc>>,
    pub atime: Option<DateTime<Utc>>,
    pub ctime: Option<DateTime<Utc>>,
    pub btime: Option<DateTime<Utc>>,
    /// Birth and modified times from `$FILE_NAME`, which normal APIs
    /// cannot rewrite.
    pub fn_btime: Option<DateTime<Utc>>,
    pub fn_mtime: Option<DateTime<Utc>>,
    pub name: String,
    pub name_type: String,
    pub extra_names: Vec<String>,
    pub is_dir: bool,
    pub size: i64,
    pub allocated_size: i64,
    /// True when the row was carved out of index slack.
    pub is_slack: bool,
    pub slack_offset: i64,
}

/// Formats inode strings unambiguously: `mft-type-attrid`, appending
/// `:name` only when another stream shares the same (type, id).
#[derive(Debug, Default)]
pub struct InodeFormatter {
    seen: Vec<u32>,
}

impl InodeFormatter {
    pub fn inode(&mut self, mft_id: u64, attr_type: u64, attr_id: u16, name: &str) -> String {
        let mut inode = format!("{}-{}-{}", mft_id, attr_type, attr_id);
        let needle = ((attr_id as u32) << 16) | (attr_type as u32 & 0xFFFF);

        if self.seen.contains(&needle) {
            if !name.is_empty() {
                inode.push(':');
                inode.push_str(name);
            }
        } else {
            self.seen.push(needle);
        }
        inode
    }
}

/// Selector parsed from the `"<mft-id>[-<type>[-<attr-id>]][:<stream>]"`
/// syntax. A missing type means `$DATA`, a missing attribute id is the
/// wildcard 0xFFFF, a missing stream name matches any stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MftIdSelector {
    pub mft_id: u64,
    pub attr_type: u64,
    pub attr_id: u16,
    pub stream_name: Option<String>,
}

/// Parse an inode selector string, e.g. `"46-128-5"` or `"5:stream"`.
pub fn parse_mft_id(inode: &str) -> Result<MftIdSelector> {
    let (id_part, stream_name) = match inode.split_once(':') {
        Some((id, stream)) => (id, Some(stream.to_string())),
        None => (inode, None),
    };

    if let Some(name) = &stream_name {
        if name.encode_utf16().count() > 255 {
            return Err(NtfsError::NameTooLong(name.len()));
        }
    }

    let bad = || NtfsError::Parse("incorrect format for MFT id: e.g. 5-144-1".into());

    let mut components = Vec::new();
    for part in id_part.split('-') {
        components.push(part.parse::<u64>().map_err(|_| bad())?);
    }

    let selector = match components.as_slice() {
        [mft_id] => MftIdSelector {
            mft_id: *mft_id,
            attr_type: ATTR_TYPE_DATA,
            attr_id: WILDCARD_STREAM_ID,
            stream_name,
        },
        [mft_id, attr_type] => MftIdSelector {
            mft_id: *mft_id,
            attr_type: *attr_type,
            attr_id: WILDCARD_STREAM_ID,
            stream_name,
        },
        [mft_id, attr_type, attr_id] => {
            if *attr_id > u16::MAX as u64 {
                return Err(bad());
            }
            MftIdSelector {
                mft_id: *mft_id,
                attr_type: *attr_type,
                attr_id: *attr_id as u16,
                stream_name,
            }
        }
        _ => return Err(bad()),
    };

    Ok(selector)
}

/// Open the stream an inode selector points at.
pub fn get_data_for_mft_id(ntfs: &NtfsContext, inode: &str) -> Result<RangeReader> {
    let selector = parse_mft_id(inode)?;
    let entry = ntfs.get_mft(selector.mft_id)?;
    open_stream(
        ntfs,
        &entry,
        selector.attr_type,
        selector.attr_id,
        selector.stream_name.as_deref(),
    )
}

/// Open a file's data by path. `\` and `/` both separate components,
/// matching is case-insensitive, and `path:stream` addresses an ADS.
pub fn get_data_for_path(ntfs: &NtfsContext, path: &str) -> Result<RangeReader> {
    let (file_part, stream_name) = match path.split_once(':') {
        Some((p, stream)) => (p, Some(stream)),
        None => (path, None),
    };

    let root = ntfs.get_mft(MFT_RECORD_ROOT)?;
    let entry = root.open(ntfs, file_part)?;
    open_stream(
        ntfs,
        &entry,
        ATTR_TYPE_DATA,
        WILDCARD_STREAM_ID,
        stream_name,
    )
}

/// Build the user-facing rows for one MFT entry: one row for the index
/// attribute of a directory, one per `$DATA` stream, each duplicated for
/// non-trivial extra names.
pub fn stat(ntfs: &NtfsContext, node_mft: &MftEntry) -> Vec<FileInfo> {
    let mut si: Option<StandardInformation> = None;
    let mut win32_name: Option<FileName> = None;
    let mut other_file_names: Vec<FileName> = Vec::new();
    let mut data_attributes = Vec::new();
    let mut index_attribute = None;
    let mut fn_btime = None;
    let mut fn_mtime = None;

    let mft_id = node_mft.record_number();
    let is_dir = node_mft.is_directory_flag();

    for attr in node_mft.enumerate_attributes(ntfs) {
        match attr.attr_type() {
            ATTR_TYPE_STANDARD_INFORMATION => {
                if let Ok(reader) = attr.data(ntfs) {
                    si = StandardInformation::from_reader(&reader).ok();
                }
            }
            ATTR_TYPE_FILE_NAME => {
                let Ok(reader) = attr.data(ntfs) else { continue };
                let Some(file_name) = FileName::from_stream(&reader) else {
                    continue;
                };

                // The FILE_NAME birth time cannot be rewritten through
                // normal APIs, so it anchors timeline analysis.
                fn_btime = Some(file_name.created());
                fn_mtime = Some(file_name.created());

                match file_name.name_type_name() {
                    "POSIX" | "Win32" | "DOS+Win32" => win32_name = Some(file_name),
                    _ => other_file_names.push(file_name),
                }
            }
            ATTR_TYPE_DATA => {
                // Only the first VCN fragment represents a stream.
                if !attr.is_resident() && attr.vcn_start() != 0 {
                    continue;
                }
                data_attributes.push(attr);
            }
            ATTR_TYPE_INDEX_ROOT | ATTR_TYPE_INDEX_ALLOCATION => {
                index_attribute = Some(attr);
            }
            _ => {}
        }
    }

    let (Some(si), Some(win32_name)) = (si, win32_name) else {
        return Vec::new();
    };

    let mut result: Vec<FileInfo> = Vec::new();

    let base_info = |name: String, inode: String| FileInfo {
        mft_id: inode,
        sequence_number: node_mft.sequence_value(),
        mtime: Some(si.file_altered_time()),
        atime: Some(si.file_accessed_time()),
        ctime: Some(si.mft_altered_time()),
        btime: Some(si.create_time()),
        fn_btime,
        fn_mtime,
        name,
        name_type: win32_name.name_type_name().to_string(),
        is_dir,
        ..FileInfo::default()
    };

    // Mirror rows for alternate names, skipping 8.3-style tilde aliases.
    let add_extra_names =
        |result: &mut Vec<FileInfo>, info: &mut FileInfo, ads: &str| {
            for name in &other_file_names {
                let extra_name = name.name();
                info.extra_names.push(format!("{extra_name}{ads}"));

                if !extra_name.contains('~') {
                    let mut copy = info.clone();
                    copy.name = format!("{extra_name}{ads}");
                    copy.extra_names = vec![format!("{}{}", win32_name.name(), ads)];
                    result.push(copy);
                }
            }
        };

    if let Some(index_attr) = &index_attribute {
        let inode = format!(
            "{}-{}-{}",
            mft_id,
            index_attr.attr_type(),
            index_attr.attribute_id()
        );
        let mut info = base_info(win32_name.name(), inode);
        add_extra_names(&mut result, &mut info, "");
        result.push(info);
    }

    let mut inode_formatter = InodeFormatter::default();
    for attr in &data_attributes {
        let name = attr.name();
        let ads = match name.as_str() {
            "" | "$I30" => String::new(),
            other => format!(":{other}"),
        };

        let inode = inode_formatter.inode(mft_id, attr.attr_type(), attr.attribute_id(), &name);
        let mut info = base_info(format!("{}{}", win32_name.name(), ads), inode);
        info.size = attr.data_size();
        info.allocated_size = if attr.is_resident() {
            attr.content_size() as i64
        } else {
            attr.allocated_size() as i64
        };

        add_extra_names(&mut result, &mut info, &ads);

        // A named data stream is never itself a directory, even when it
        // hangs off one.
        if !ads.is_empty() {
            info.is_dir = false;
        }

        result.push(info);
    }

    result
}

/// Stat every entry of a directory, de-duplicating the index's multiple
/// references to the same MFT record.
pub fn list_dir(ntfs: &NtfsContext, root: &MftEntry) -> Vec<FileInfo> {
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();

    for record in root.dir(ntfs) {
        let node_mft_id = record.mft_reference();
        if !seen.insert(node_mft_id) {
            continue;
        }
        let Ok(node_mft) = ntfs.get_mft(node_mft_id) else {
            continue;
        };
        result.extend(stat(ntfs, &node_mft));
    }

    result
}

/// List a directory's `$I30` entries including slack-carved ones. Rows
/// keep the FILE_NAME timestamps; slack rows carry their stream offset.
pub fn extract_i30_list(ntfs: &NtfsContext, dir: &MftEntry) -> Vec<FileInfo> {
    let mut records = Vec::new();
    for node in dir.dir_nodes(ntfs) {
        records.extend(node.records());
        records.extend(node.scan_slack());
    }

    let mut result = Vec::new();
    for record in records {
        if !record.is_valid() {
            continue;
        }
        let Some(file_name) = record.file() else {
            continue;
        };

        result.push(FileInfo {
            mft_id: record.mft_reference().to_string(),
            mtime: Some(file_name.file_modified()),
            atime: Some(file_name.file_accessed()),
            ctime: Some(file_name.mft_modified()),
            btime: Some(file_name.created()),
            name: file_name.name(),
            name_type: file_name.name_type_name().to_string(),
            size: file_name.size() as i64,
            allocated_size: file_name.allocated_size() as i64,
            is_slack: record.is_slack(),
            slack_offset: if record.is_slack() {
                record.stream_offset() as i64
            } else {
                0
            },
            ..FileInfo::default()
        });
    }

    result
}
