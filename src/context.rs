//! The volume context.
//!
//! `NtfsContext` is the single anchor every operation takes explicitly: it
//! owns the boot-sector geometry, the reconstructed `$MFT` reader and the
//! bounded caches. Views (`MftEntry`, `Attribute`, index nodes) stay plain
//! data and never point back at the context.
//!
//! Bootstrapping is the one circular step in NTFS: the `$MFT` file's own
//! layout is described by MFT record 0, which lives inside the `$MFT`
//! file. Record 0 is therefore read straight from the disk at the cluster
//! the boot sector names, and its `$DATA` runlist becomes the reader all
//! other records come from. When record 0 itself spills into extension
//! records (an `$ATTRIBUTE_LIST` is present), a provisional reader over
//! the first `$DATA` fragment is used to re-read record 0 and join every
//! fragment into the final reader.

use std::sync::{Arc, Mutex};

use log::debug;

use crate::attribute::{
    parse_utf16le, ATTR_TYPE_ATTRIBUTE_LIST, ATTR_TYPE_DATA, ATTR_TYPE_VOLUME_INFORMATION,
    ATTR_TYPE_VOLUME_NAME,
};
use crate::boot::BootSector;
use crate::cache::Lru;
use crate::error::{NtfsError, Result};
use crate::mft::MftEntry;
use crate::reader::{NullReader, OffsetReader, ReadAt};
use crate::stream::{open_stream, WILDCARD_STREAM_ID};
use crate::summary::{MftEntrySummary, MftSummaryCache};

/// MFT record number of `$Volume`.
const MFT_RECORD_VOLUME: u64 = 3;

/// Analysis options, scoped to one context. No globals, no environment.
#[derive(Debug, Clone)]
pub struct Options {
    /// Keep DOS 8.3 aliases in link analysis output.
    pub include_short_names: bool,
    /// Cap on the number of hard links walked per entry.
    pub max_links: usize,
    /// Cap on parent-chain depth during path resolution.
    pub max_directory_depth: usize,
    /// Components prepended to every resolved path.
    pub prefix_components: Vec<String>,
    /// Skip MFT lookups when resolving USN paths (no MFT available).
    pub disable_full_path_resolution: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            include_short_names: false,
            max_links: 20,
            max_directory_depth: 20,
            prefix_components: Vec::new(),
            disable_full_path_resolution: false,
        }
    }
}

/// NTFS version and flags from `$VOLUME_INFORMATION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    pub major: u8,
    pub minor: u8,
    pub flags: u16,
}

/// Shared, read-only anchor for one parsed volume.
///
/// Cloning produces an independent context sharing the underlying readers
/// and caches; options are copied and may diverge.
#[derive(Clone)]
pub struct NtfsContext {
    disk_reader: Arc<dyn ReadAt>,
    mft_reader: Arc<dyn ReadAt>,
    has_mft: bool,
    boot: Option<BootSector>,
    cluster_size: i64,
    record_size: i64,
    options: Options,

    mft_entry_lru: Arc<Mutex<Lru<u64, MftEntry>>>,
    summary_cache: MftSummaryCache,
    full_path_lru: Arc<Mutex<Lru<u64, Arc<Vec<String>>>>>,
}

impl NtfsContext {
    /// Open a volume whose boot sector sits at `offset` within `disk`.
    pub fn new(disk: Arc<dyn ReadAt>, offset: u64) -> Result<NtfsContext> {
        // All cluster arithmetic is volume-relative; rebase once here.
        let disk: Arc<dyn ReadAt> = if offset == 0 {
            disk
        } else {
            Arc::new(OffsetReader::new(disk, offset))
        };

        let boot = BootSector::read(&disk, 0)?;
        boot.validate()?;

        let cluster_size = boot.cluster_size();
        let record_size = boot.record_size();
        let mft_offset = (boot.mft_cluster() * cluster_size) as u64;

        let mut ntfs = NtfsContext {
            disk_reader: disk,
            mft_reader: Arc::new(NullReader),
            has_mft: false,
            boot: Some(boot),
            cluster_size,
            record_size,
            options: Options::default(),
            mft_entry_lru: Arc::new(Mutex::new(Lru::with_capacity(1000))),
            summary_cache: MftSummaryCache::new(),
            full_path_lru: Arc::new(Mutex::new(Lru::with_capacity(10_000))),
        };

        // Read $MFT's own record straight off the disk.
        let entry0 =
            MftEntry::from_reader(ntfs.disk_reader.as_ref(), mft_offset, record_size as usize)?;

        let data_attr = entry0
            .direct_attributes()
            .into_iter()
            .find(|attr| attr.attr_type() == ATTR_TYPE_DATA)
            .ok_or_else(|| NtfsError::Parse("$MFT has no $DATA attribute".into()))?;

        ntfs.mft_reader = Arc::new(data_attr.data(&ntfs)?);
        ntfs.has_mft = true;

        // When record 0 spills over, re-read it through the provisional
        // reader and join every $DATA fragment.
        let has_attribute_list = entry0
            .direct_attributes()
            .iter()
            .any(|attr| attr.attr_type() == ATTR_TYPE_ATTRIBUTE_LIST);
        if has_attribute_list {
            debug!("$MFT carries an $ATTRIBUTE_LIST, joining all $DATA fragments");
            let entry0 = ntfs.get_mft(0)?;
            let full = open_stream(&ntfs, &entry0, ATTR_TYPE_DATA, WILDCARD_STREAM_ID, None)?;
            ntfs.mft_reader = Arc::new(full);
            ntfs.mft_entry_lru.lock().unwrap().purge();
        }

        Ok(ntfs)
    }

    /// A context over a bare `$MFT` stream (no volume around it), as used
    /// for bulk iteration of extracted MFT files. `get_mft` works; stream
    /// reads hit zeros.
    pub fn from_mft_stream(
        mft_reader: Arc<dyn ReadAt>,
        cluster_size: i64,
        record_size: i64,
    ) -> NtfsContext {
        NtfsContext {
            disk_reader: Arc::new(NullReader),
            mft_reader,
            has_mft: true,
            boot: None,
            cluster_size,
            record_size,
            options: Options::default(),
            mft_entry_lru: Arc::new(Mutex::new(Lru::with_capacity(1000))),
            summary_cache: MftSummaryCache::new(),
            full_path_lru: Arc::new(Mutex::new(Lru::with_capacity(10_000))),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> NtfsContext {
        Self::from_mft_stream(Arc::new(NullReader), 4096, 1024)
    }

    pub fn disk_reader(&self) -> Arc<dyn ReadAt> {
        self.disk_reader.clone()
    }

    pub fn mft_reader(&self) -> Arc<dyn ReadAt> {
        self.mft_reader.clone()
    }

    pub fn boot(&self) -> Option<&BootSector> {
        self.boot.as_ref()
    }

    pub fn cluster_size(&self) -> i64 {
        self.cluster_size
    }

    pub fn record_size(&self) -> i64 {
        self.record_size
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn set_options(&mut self, options: Options) {
        self.options = options;
    }

    /// Fetch an MFT record by id through the bounded entry cache.
    pub fn get_mft(&self, id: u64) -> Result<MftEntry> {
        if let Some(hit) = self.mft_entry_lru.lock().unwrap().get(&id) {
            return Ok(hit.clone());
        }

        if !self.has_mft {
            return Err(NtfsError::Parse("no $MFT reader available".into()));
        }

        let offset = id
            .checked_mul(self.record_size as u64)
            .ok_or(NtfsError::RunlistOverflow)?;
        let entry =
            MftEntry::from_reader(self.mft_reader.as_ref(), offset, self.record_size as usize)?;
        self.mft_entry_lru.lock().unwrap().insert(id, entry.clone());
        Ok(entry)
    }

    /// Summary of `(id, sequence)` via the summary cache.
    pub fn get_summary(&self, id: u64, required_sequence: u16) -> Result<Arc<MftEntrySummary>> {
        self.summary_cache.get_summary(self, id, required_sequence)
    }

    pub fn summary_cache(&self) -> &MftSummaryCache {
        &self.summary_cache
    }

    pub(crate) fn full_path_lru(&self) -> &Arc<Mutex<Lru<u64, Arc<Vec<String>>>>> {
        &self.full_path_lru
    }

    /// Drop every cache and ask the disk reader to do the same. Live
    /// monitoring calls this between passes to observe fresh data.
    pub fn purge(&self) {
        self.mft_entry_lru.lock().unwrap().purge();
        self.summary_cache.purge();
        self.full_path_lru.lock().unwrap().purge();
        self.disk_reader.flush();
    }

    /// The volume label from `$Volume`'s `$VOLUME_NAME`.
    pub fn volume_name(&self) -> Option<String> {
        let entry = self.get_mft(MFT_RECORD_VOLUME).ok()?;
        for attr in entry.enumerate_attributes(self) {
            if attr.attr_type() == ATTR_TYPE_VOLUME_NAME && attr.is_resident() {
                let label = parse_utf16le(&attr.resident_content());
                let label = label.trim_end_matches('\0').trim().to_string();
                if label.is_empty() {
                    return None;
                }
                return Some(label);
            }
        }
        None
    }

    /// NTFS version and volume flags from `$VOLUME_INFORMATION`.
    pub fn volume_info(&self) -> Option<VolumeInfo> {
        let entry = self.get_mft(MFT_RECORD_VOLUME).ok()?;
        for attr in entry.enumerate_attributes(self) {
            if attr.attr_type() == ATTR_TYPE_VOLUME_INFORMATION && attr.is_resident() {
                let content = attr.resident_content();
                if content.len() >= 12 {
                    return Some(VolumeInfo {
                        major: content[8],
                        minor: content[9],
                        flags: u16::from_le_bytes([content[10], content[11]]),
                    });
                }
            }
        }
        None
    }
}

impl std::fmt::Debug for NtfsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NtfsContext(cluster {} record {} mft {})",
            self.cluster_size, self.record_size, self.has_mft
        )
    }
}
