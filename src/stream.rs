//! Stream assembly.
//!
//! In NTFS one logical stream may be split over several attributes: all
//! fragments share (type, id, name) but map different VCN windows.
//! `open_stream` picks the stream a caller asked for, gathers every
//! fragment, joins the runlists, and returns one contiguous reader whose
//! tail is padded out to `actual_size` when the stream is not fully
//! initialized.

use std::sync::Arc;

use log::debug;

use crate::attribute::{Attribute, MAX_MFT_ENTRY_SIZE};
use crate::context::NtfsContext;
use crate::error::{NtfsError, Result};
use crate::mft::MftEntry;
use crate::runs::{
    compressed_range_reader, uncompressed_range_reader, Backing, MappedReader, RangeReader, Run,
};

/// Attribute id meaning "any stream": pick by name and VCN instead.
pub const WILDCARD_STREAM_ID: u16 = 0xFFFF;

/// Most fragments a single stream may be split into.
const MAX_VCN_FRAGMENTS: usize = 20;

struct AttrInfo {
    attr_type: u64,
    attr_id: u16,
    name: String,
    resident: bool,
    vcn_start: u64,
    vcn_end: u64,
    attr: Attribute,
}

impl AttrInfo {
    fn is_first_fragment(&self) -> bool {
        self.resident || self.vcn_start == 0
    }
}

/// Selection precedence, first match wins:
/// 1. wildcard id + wildcard name: an unnamed first-VCN stream, else any
///    first-VCN stream of the type;
/// 2. wildcard id + concrete name: the first-VCN stream with that name;
/// 3. concrete id (+ optional name): the exact attribute.
fn select_attribute<'a>(
    attributes: &'a [AttrInfo],
    attr_type: u64,
    attr_id: u16,
    stream_name: Option<&str>,
) -> Result<&'a AttrInfo> {
    if attr_id == WILDCARD_STREAM_ID && stream_name.is_none() {
        for info in attributes {
            if info.attr_type == attr_type && info.name.is_empty() && info.is_first_fragment() {
                return Ok(info);
            }
        }
        for info in attributes {
            if info.attr_type == attr_type && info.is_first_fragment() {
                return Ok(info);
            }
        }
        return Err(NtfsError::StreamNotFound);
    }

    if attr_id == WILDCARD_STREAM_ID {
        let wanted = stream_name.unwrap_or_default();
        for info in attributes {
            if info.attr_type == attr_type && info.name == wanted && info.is_first_fragment() {
                return Ok(info);
            }
        }
        return Err(NtfsError::StreamNotFound);
    }

    for info in attributes {
        if info.attr_type == attr_type && info.attr_id == attr_id {
            if let Some(wanted) = stream_name {
                if wanted != info.name {
                    continue;
                }
            }
            if info.is_first_fragment() {
                return Ok(info);
            }
        }
    }
    Err(NtfsError::StreamNotFound)
}

/// Gather the selected stream plus every later VCN fragment of it, in
/// fragment-chain order.
fn gather_vcns<'a>(
    attributes: &'a [AttrInfo],
    selected: &'a AttrInfo,
) -> Vec<&'a AttrInfo> {
    let mut result = vec![selected];
    if selected.resident {
        return result;
    }

    let mut current = selected;
    while result.len() <= MAX_VCN_FRAGMENTS {
        // A fragment whose VCN window is empty cannot chain further.
        if current.vcn_end <= current.vcn_start {
            break;
        }
        let next = attributes.iter().find(|info| {
            info.attr_type == current.attr_type
                && info.name == current.name
                && !info.resident
                && info.vcn_start == current.vcn_end + 1
        });
        match next {
            Some(info) => {
                result.push(info);
                current = info;
            }
            None => break,
        }
    }
    if result.len() > MAX_VCN_FRAGMENTS {
        debug!("stream truncated at {} fragments", MAX_VCN_FRAGMENTS);
    }

    result
}

/// Open the full stream identified by `(attr_type, attr_id, stream_name)`
/// on an MFT entry. `attr_id` 0xFFFF and a `None` name are wildcards.
///
/// The returned reader covers `[0, actual_size)`: mapped data, zeros for
/// sparse ranges, and a zero tail past `initialized_size`.
pub fn open_stream(
    ntfs: &NtfsContext,
    mft_entry: &MftEntry,
    attr_type: u64,
    attr_id: u16,
    stream_name: Option<&str>,
) -> Result<RangeReader> {
    let attributes: Vec<AttrInfo> = mft_entry
        .enumerate_attributes(ntfs)
        .into_iter()
        .map(|attr| AttrInfo {
            attr_type: attr.attr_type(),
            attr_id: attr.attribute_id(),
            name: attr.name(),
            resident: attr.is_resident(),
            vcn_start: attr.vcn_start(),
            vcn_end: attr.vcn_end(),
            attr,
        })
        .collect();

    let selected = select_attribute(&attributes, attr_type, attr_id, stream_name)?;

    if selected.resident {
        let content = selected.attr.resident_content();
        let len = (content.len() as u32).min(MAX_MFT_ENTRY_SIZE) as i64;
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

    let mut vcns = gather_vcns(&attributes, selected);
    vcns.sort_by_key(|info| info.vcn_start);

    Ok(RangeReader::new(join_vcns(ntfs, &vcns)?))
}

/// Join the runlists of all fragments into one mapped view.
///
/// The first fragment carries the authoritative sizes and compression
/// unit for the whole stream; later fragments leave those fields zero.
fn join_vcns(ntfs: &NtfsContext, vcns: &[&AttrInfo]) -> Result<Vec<MappedReader>> {
    let mut actual_size = 0i64;
    let mut initialized_size = 0i64;
    let mut compression_unit = 0i64;
    let mut runs: Vec<Run> = Vec::new();
    let mut compressed = false;

    for (idx, info) in vcns.iter().enumerate() {
        if actual_size == 0 {
            actual_size = info.attr.actual_size() as i64;
        }
        if initialized_size == 0 {
            initialized_size = info.attr.initialized_size() as i64;
        }
        if compression_unit == 0 {
            compression_unit = info.attr.compression_unit();
        }
        if idx == 0 {
            compressed = info.attr.is_compressed();
        }
        runs.extend(info.attr.run_list()?);
    }

    let inner = if compressed {
        compressed_range_reader(
            &runs,
            ntfs.cluster_size(),
            ntfs.disk_reader(),
            compression_unit,
        )
    } else {
        uncompressed_range_reader(&runs, ntfs.cluster_size(), ntfs.disk_reader())
    };

    let mut mapped = Vec::new();
    if initialized_size > 0 {
        mapped.push(MappedReader {
            file_offset: 0,
            target_offset: 0,
            length: initialized_size,
            cluster_size: 1,
            compressed_length: 0,
            is_sparse: false,
            backing: Backing::Nested(Arc::new(inner)),
        });
    }

    // The uninitialized tail reads as zeros.
    if actual_size > initialized_size {
        mapped.push(MappedReader {
            file_offset: initialized_size,
            target_offset: 0,
            length: actual_size - initialized_size,
            cluster_size: 1,
            compressed_length: 0,
            is_sparse: true,
            backing: Backing::Null,
        });
    }

    Ok(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::Range;

    fn info(
        attr_type: u64,
        attr_id: u16,
        name: &str,
        resident: bool,
        vcn_start: u64,
        vcn_end: u64,
    ) -> AttrInfo {
        AttrInfo {
            attr_type,
            attr_id,
            name: name.to_string(),
            resident,
            vcn_start,
            vcn_end,
            attr: Attribute {
                entry: Arc::new(crate::mft::EntryBuf {
                    buf: vec![0u8; 64],
                    disk_offset: 0,
                }),
                offset: 0,
            },
        }
    }

    #[test]
    fn test_select_prefers_unnamed_default_stream() {
        let attrs = vec![
            info(0x80, 4, "ads", true, 0, 0),
            info(0x80, 1, "", true, 0, 0),
        ];
        let selected = select_attribute(&attrs, 0x80, WILDCARD_STREAM_ID, None).unwrap();
        assert_eq!(selected.attr_id, 1);
    }

    #[test]
    fn test_select_falls_back_to_named_stream() {
        let attrs = vec![info(0x80, 4, "ads", true, 0, 0)];
        let selected = select_attribute(&attrs, 0x80, WILDCARD_STREAM_ID, None).unwrap();
        assert_eq!(selected.attr_id, 4);
    }

    #[test]
    fn test_select_by_name() {
        let attrs = vec![
            info(0x80, 1, "", true, 0, 0),
            info(0x80, 4, "goodbye.txt", true, 0, 0),
        ];
        let selected =
            select_attribute(&attrs, 0x80, WILDCARD_STREAM_ID, Some("goodbye.txt")).unwrap();
        assert_eq!(selected.attr_id, 4);
    }

    #[test]
    fn test_select_by_exact_id() {
        let attrs = vec![
            info(0x80, 1, "", true, 0, 0),
            info(0x80, 5, "x", true, 0, 0),
        ];
        let selected = select_attribute(&attrs, 0x80, 5, None).unwrap();
        assert_eq!(selected.attr_id, 5);
        assert!(select_attribute(&attrs, 0x80, 9, None).is_err());
    }

    #[test]
    fn test_select_skips_non_first_vcn_fragments() {
        let attrs = vec![
            info(0x80, 1, "", false, 16, 31),
            info(0x80, 1, "", false, 0, 15),
        ];
        let selected = select_attribute(&attrs, 0x80, WILDCARD_STREAM_ID, None).unwrap();
        assert_eq!(selected.vcn_start, 0);
    }

    #[test]
    fn test_select_rejects_wrong_name_with_exact_id() {
        let attrs = vec![info(0x80, 5, "x", true, 0, 0)];
        assert!(select_attribute(&attrs, 0x80, 5, Some("y")).is_err());
        assert!(select_attribute(&attrs, 0x80, 5, Some("x")).is_ok());
    }

    #[test]
    fn test_gather_vcns_follows_chain() {
        let attrs = vec![
            info(0x80, 1, "", false, 0, 15),
            info(0x80, 2, "", false, 16, 31),
            info(0x80, 3, "", false, 32, 47),
            info(0x80, 9, "other", false, 16, 31),
        ];
        let chain = gather_vcns(&attrs, &attrs[0]);
        let starts: Vec<u64> = chain.iter().map(|i| i.vcn_start).collect();
        assert_eq!(starts, vec![0, 16, 32]);
    }

    #[test]
    fn test_gather_vcns_resident_is_single() {
        let attrs = vec![info(0x80, 1, "", true, 0, 0)];
        let chain = gather_vcns(&attrs, &attrs[0]);
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_uninitialized_tail_pad() {
        // A stream with actual > initialized must end with one sparse
        // range covering the difference.
        let ntfs = NtfsContext::for_tests();
        let mut entry_buf = vec![0u8; 1024];

        // Non-resident $DATA: vcn 0..0, one run of 4 clusters at cluster
        // 2, actual 16384, initialized 8192.
        let runlist: [u8; 4] = [0x11, 0x04, 0x02, 0x00];
        let b = &mut entry_buf[0..];
        b[0..4].copy_from_slice(&0x80u32.to_le_bytes());
        b[4..8].copy_from_slice(&0x80u32.to_le_bytes()); // attr length
        b[8] = 1; // non-resident
        b[14..16].copy_from_slice(&1u16.to_le_bytes()); // id
        b[16..24].copy_from_slice(&0u64.to_le_bytes()); // vcn start
        b[24..32].copy_from_slice(&3u64.to_le_bytes()); // vcn end
        b[32..34].copy_from_slice(&0x48u16.to_le_bytes()); // runlist offset
        b[40..48].copy_from_slice(&16384u64.to_le_bytes()); // allocated
        b[48..56].copy_from_slice(&16384u64.to_le_bytes()); // actual
        b[56..64].copy_from_slice(&8192u64.to_le_bytes()); // initialized
        b[0x48..0x4C].copy_from_slice(&runlist);

        let attr = Attribute {
            entry: Arc::new(crate::mft::EntryBuf {
                buf: entry_buf,
                disk_offset: 0,
            }),
            offset: 0,
        };
        let infos = vec![AttrInfo {
            attr_type: 0x80,
            attr_id: 1,
            name: String::new(),
            resident: false,
            vcn_start: 0,
            vcn_end: 3,
            attr,
        }];

        let mapped = join_vcns(&ntfs, &[&infos[0]]).unwrap();
        let rr = RangeReader::new(mapped);
        let ranges = rr.ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(
            ranges[0],
            Range {
                offset: 0,
                length: 8192,
                is_sparse: false
            }
        );
        assert_eq!(
            ranges[1],
            Range {
                offset: 8192,
                length: 8192,
                is_sparse: true
            }
        );
    }
}
