//! Compact per-entry summaries.
//!
//! Path resolution only needs an entry's sequence number and its FILE_NAME
//! links, not the whole record, so those are cached separately from the
//! MFT entry LRU. Summaries can also be preloaded from external evidence
//! (USN records of deleted files) keyed by `(id, sequence)`, letting
//! historical records coexist with the live ones.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::context::NtfsContext;
use crate::error::Result;

/// One FILE_NAME link of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FnSummary {
    pub name: String,
    pub name_type: String,
    pub parent_entry: u64,
    pub parent_sequence: u16,
}

/// What path resolution needs to know about one MFT entry.
#[derive(Debug, Clone, Default)]
pub struct MftEntrySummary {
    pub sequence: u16,
    pub filenames: Vec<FnSummary>,
}

/// Bounded cache of entry summaries plus the preload side table.
#[derive(Clone)]
pub struct MftSummaryCache {
    lru: Arc<Mutex<crate::cache::Lru<u64, Arc<MftEntrySummary>>>>,
    preload: Arc<Mutex<HashMap<(u64, u16), Arc<MftEntrySummary>>>>,
}

impl Default for MftSummaryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MftSummaryCache {
    pub fn new() -> Self {
        MftSummaryCache {
            lru: Arc::new(Mutex::new(crate::cache::Lru::with_capacity(10_000))),
            preload: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn get_live(&self, ntfs: &NtfsContext, id: u64) -> Result<Arc<MftEntrySummary>> {
        if let Some(hit) = self.lru.lock().unwrap().get(&id) {
            return Ok(hit.clone());
        }

        let mft_entry = ntfs.get_mft(id)?;
        let mut summary = MftEntrySummary {
            sequence: mft_entry.sequence_value(),
            filenames: Vec::new(),
        };
        for fnm in mft_entry.file_names(ntfs) {
            summary.filenames.push(FnSummary {
                name: fnm.name(),
                name_type: fnm.name_type_name().to_string(),
                parent_entry: fnm.mft_reference(),
                parent_sequence: fnm.parent_sequence(),
            });
        }

        let summary = Arc::new(summary);
        self.lru.lock().unwrap().insert(id, summary.clone());
        Ok(summary)
    }

    /// Fetch the summary for `(id, required_sequence)`.
    ///
    /// The live MFT wins when its sequence matches; otherwise the preload
    /// table is consulted for a historical summary of that incarnation.
    /// When neither matches, whatever the MFT holds is returned so the
    /// caller can report the sequence mismatch explicitly.
    pub fn get_summary(
        &self,
        ntfs: &NtfsContext,
        id: u64,
        required_sequence: u16,
    ) -> Result<Arc<MftEntrySummary>> {
        let live = self.get_live(ntfs, id);

        if let Ok(summary) = &live {
            if summary.sequence == required_sequence {
                return live;
            }
        }

        if let Some(pre) = self.preload.lock().unwrap().get(&(id, required_sequence)) {
            return Ok(pre.clone());
        }

        live
    }

    /// Like `get_summary`, but fail with `InvalidParent` when the only
    /// available summary belongs to a different incarnation of the entry.
    pub fn require_summary(
        &self,
        ntfs: &NtfsContext,
        id: u64,
        required_sequence: u16,
    ) -> Result<Arc<MftEntrySummary>> {
        let summary = self.get_summary(ntfs, id, required_sequence)?;
        if summary.sequence != required_sequence {
            return Err(crate::error::NtfsError::InvalidParent {
                entry: id,
                actual: summary.sequence,
                required: required_sequence,
            });
        }
        Ok(summary)
    }

    /// Install or merge a preloaded summary for `(id, sequence)`.
    ///
    /// The callback receives the existing preloaded summary (if any) and
    /// returns the one to store, or `None` to leave the table unchanged.
    pub fn set_preload<F>(&self, id: u64, sequence: u16, merge: F)
    where
        F: FnOnce(Option<Arc<MftEntrySummary>>) -> Option<Arc<MftEntrySummary>>,
    {
        let mut preload = self.preload.lock().unwrap();
        let existing = preload.get(&(id, sequence)).cloned();
        if let Some(updated) = merge(existing) {
            preload.insert((id, sequence), updated);
        }
    }

    pub fn purge(&self) {
        self.lru.lock().unwrap().purge();
    }
}
