//! Read-only forensic parser for NTFS volume images.
//!
//! The crate consumes any random-access byte source holding an NTFS
//! volume (a raw device, a partition, an acquired image) and exposes its
//! structure for analysis: file and directory enumeration, full-path
//! resolution, stream reads (compressed, sparse and multi-fragment),
//! index-slack carving, USN change-journal parsing and bulk MFT
//! iteration.
//!
//! Nothing here ever writes. Construction starts at the boot sector:
//!
//! ```no_run
//! use std::sync::Arc;
//! use rusty_ntfs::{NtfsContext, PagedReader};
//!
//! # fn main() -> anyhow::Result<()> {
//! let file = std::fs::File::open("volume.dd")?;
//! let reader = Arc::new(PagedReader::with_defaults(Arc::new(file)));
//! let ntfs = NtfsContext::new(reader, 0)?;
//!
//! let data = rusty_ntfs::get_data_for_path(&ntfs, "Folder A/file.txt:stream")?;
//! # let _ = data;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod attribute;
pub mod boot;
pub mod cache;
pub mod context;
pub mod error;
pub mod fixup;
pub mod hardlinks;
pub mod highlight;
pub mod index;
pub mod lznt1;
pub mod mft;
pub mod paged;
pub mod reader;
pub mod runs;
pub mod stat;
pub mod stream;
pub mod summary;
pub mod usn;

pub use attribute::{Attribute, ATTR_TYPE_DATA};
pub use boot::BootSector;
pub use context::{NtfsContext, Options, VolumeInfo};
pub use error::{NtfsError, Result};
pub use hardlinks::{full_path, full_path_components, get_components, get_hard_links};
pub use highlight::{parse_mft_file, MftHighlight, MftHighlightIterator};
pub use index::{IndexNode, IndexRecordEntry};
pub use mft::{FileName, MftEntry, StandardInformation, MFT_RECORD_ROOT};
pub use paged::PagedReader;
pub use reader::{NullReader, OffsetReader, ReadAt};
pub use runs::{Range, RangeReader};
pub use stat::{
    extract_i30_list, get_data_for_mft_id, get_data_for_path, list_dir, parse_mft_id, stat,
    FileInfo, MftIdSelector,
};
pub use stream::{open_stream, WILDCARD_STREAM_ID};
pub use summary::{FnSummary, MftEntrySummary, MftSummaryCache};
pub use usn::{
    carve_usn, open_usn_stream, parse_usn, watch_usn, UsnCarvedRecord, UsnCarver, UsnIterator,
    UsnRecord, UsnRecordInfo, UsnWatcher,
};

/// Cooperative cancellation for the long-running iterators (USN parse,
/// watch, carve, bulk MFT). Checked at every emitted record.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
