//! Runlists and the virtual-to-physical mapping layer.
//!
//! A non-resident attribute stores its data as a runlist: a compact
//! sequence of (cluster delta, cluster count) records. This module decodes
//! runlists and composes them into `MappedReader` segments — plain,
//! sparse, or LZNT1-compressed — which a `RangeReader` stitches into one
//! contiguous `ReadAt` surface.
//!
//! Compressed streams allocate in whole compression units (typically 16
//! clusters). A unit that compressed well is stored as a short data run
//! followed by a sparse run padding the unit out; normalization collapses
//! each such pair into a single compressed segment so the read path can
//! decompress exactly one unit at a time.

use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::error::{NtfsError, Result};
use crate::lznt1::lznt1_decompress;
use crate::reader::ReadAt;

/// Upper bound on a single decoded run length, in clusters. Anything
/// larger than this is corrupt input, not a real extent.
const MAX_RUN_LENGTH: i64 = 1 << 48;

/// A decoded runlist record: cluster delta relative to the previous run
/// and length in clusters. A zero delta marks a sparse run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub relative_offset: i64,
    pub length: i64,
}

/// Decode NTFS data-run bytes into runs.
///
/// Each record starts with a header byte whose low nibble is the length
/// field width and high nibble the offset field width; a zero header
/// terminates. Both fields are little-endian, the offset sign-extended
/// from its top encoded byte. Every read is bounded by the buffer.
pub fn decode_runlist(data: &[u8]) -> Result<Vec<Run>> {
    let mut runs = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        let header = data[pos];
        if header == 0 {
            break;
        }
        pos += 1;

        let length_size = (header & 0x0F) as usize;
        let offset_size = (header >> 4) as usize;

        if length_size == 0 || pos + length_size + offset_size > data.len() {
            break;
        }

        let mut length: u64 = 0;
        for i in 0..length_size {
            length |= (data[pos + i] as u64) << (i * 8);
        }
        pos += length_size;

        let mut offset: i64 = 0;
        if offset_size > 0 {
            let mut sign: u8 = 0;
            if data[pos + offset_size - 1] & 0x80 != 0 {
                sign = 0xFF;
            }
            let mut bytes = [sign; 8];
            for (i, b) in bytes.iter_mut().enumerate().take(8.min(offset_size)) {
                *b = data[pos + i];
            }
            offset = i64::from_le_bytes(bytes);
            pos += offset_size;
        }

        if length as i64 > MAX_RUN_LENGTH || (length as i64) < 0 {
            return Err(NtfsError::RunlistOverflow);
        }

        runs.push(Run {
            relative_offset: offset,
            length: length as i64,
        });
    }

    Ok(runs)
}

/// What actually backs a mapped segment.
#[derive(Clone)]
pub enum Backing {
    /// The disk (or any leaf byte source).
    Disk(Arc<dyn ReadAt>),
    /// Zeros: sparse runs and uninitialized tails.
    Null,
    /// An owned byte buffer: resident attribute content.
    Bytes(Arc<Vec<u8>>),
    /// A nested composition of further segments.
    Nested(Arc<RangeReader>),
}

impl Backing {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            Backing::Disk(r) => r.read_at(offset, buf),
            Backing::Null => {
                buf.fill(0);
                Ok(buf.len())
            }
            Backing::Bytes(b) => b.read_at(offset, buf),
            Backing::Nested(r) => r.read_at(offset, buf),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Backing::Disk(_) => "disk",
            Backing::Null => "null",
            Backing::Bytes(_) => "bytes",
            Backing::Nested(_) => "nested",
        }
    }
}

/// One contiguous mapped segment of a stream.
///
/// Offsets and lengths are in cluster units scaled by `cluster_size`;
/// `cluster_size == 1` denotes plain byte units. A positive
/// `compressed_length` marks an LZNT1 compression unit whose first
/// `compressed_length` clusters of backing data decompress to the full
/// segment.
#[derive(Clone)]
pub struct MappedReader {
    pub file_offset: i64,
    pub target_offset: i64,
    pub length: i64,
    pub cluster_size: i64,
    pub compressed_length: i64,
    pub is_sparse: bool,
    pub backing: Backing,
}

impl fmt::Debug for MappedReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MappedReader(file {} -> target {} len {} cs {} clen {} sparse {} via {})",
            self.file_offset,
            self.target_offset,
            self.length,
            self.cluster_size,
            self.compressed_length,
            self.is_sparse,
            self.backing.kind()
        )
    }
}

/// A byte extent of a stream as reported by `ranges()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub offset: i64,
    pub length: i64,
    pub is_sparse: bool,
}

impl MappedReader {
    pub fn file_start(&self) -> i64 {
        self.file_offset * self.cluster_size
    }

    pub fn file_end(&self) -> i64 {
        (self.file_offset + self.length) * self.cluster_size
    }

    /// Decompress this segment's whole compression unit.
    fn decompress(&self) -> Result<Vec<u8>> {
        let cs = self.cluster_size;
        let mut compressed = vec![0u8; (self.compressed_length * cs) as usize];
        let target = self.target_offset * cs;
        if target < 0 {
            return Err(NtfsError::InvalidCompressed(
                "negative compressed target offset".into(),
            ));
        }
        let n = match self.backing.read_at(target as u64, &mut compressed) {
            Ok(n) => n,
            Err(NtfsError::EndOfFile) => 0,
            Err(e) => return Err(e),
        };
        compressed.truncate(n);

        let mut decompressed = lznt1_decompress(&compressed)?;
        // The compressor stops emitting once the unit's data is exhausted;
        // the remainder of the unit is zeros.
        decompressed.resize((self.length * cs) as usize, 0);
        Ok(decompressed)
    }

    pub fn ranges(&self) -> Vec<Range> {
        let start = self.file_start();
        let length = self.length * self.cluster_size;

        // A compressed segment is one opaque extent; its nested backing
        // describes the compressed source, not the mapped view.
        if !self.is_sparse && self.compressed_length == 0 {
            if let Backing::Nested(nested) = &self.backing {
                // Surface the composition beneath the mapping, clipped to
                // our window and coalesced so a long extent of like-kind
                // segments reads as one range.
                let shift = start - self.target_offset * self.cluster_size;
                let mut result: Vec<Range> = Vec::new();
                for inner in nested.ranges() {
                    let mut offset = inner.offset + shift;
                    let mut len = inner.length;
                    if offset + len <= start || offset >= start + length {
                        continue;
                    }
                    if offset < start {
                        len -= start - offset;
                        offset = start;
                    }
                    if offset + len > start + length {
                        len = start + length - offset;
                    }
                    match result.last_mut() {
                        Some(prev)
                            if prev.is_sparse == inner.is_sparse
                                && prev.offset + prev.length == offset =>
                        {
                            prev.length += len;
                        }
                        _ => result.push(Range {
                            offset,
                            length: len,
                            is_sparse: inner.is_sparse,
                        }),
                    }
                }
                return result;
            }
        }

        vec![Range {
            offset: start,
            length,
            is_sparse: self.is_sparse,
        }]
    }
}

impl ReadAt for MappedReader {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let cs = self.cluster_size;
        let off = offset as i64;
        let file_start = self.file_start();
        let file_end = self.file_end();
        if off < file_start || off >= file_end {
            return Err(NtfsError::EndOfFile);
        }

        let run_offset = off - file_start;
        let to_read = ((file_end - off) as usize).min(buf.len());

        if self.is_sparse {
            buf[..to_read].fill(0);
            return Ok(to_read);
        }

        if self.compressed_length > 0 {
            let decompressed = self.decompress()?;
            let start = run_offset as usize;
            let n = to_read.min(decompressed.len().saturating_sub(start));
            buf[..n].copy_from_slice(&decompressed[start..start + n]);
            return Ok(n);
        }

        let target = self.target_offset * cs + run_offset;
        if target < 0 {
            return Err(NtfsError::Parse("negative mapped offset".into()));
        }
        self.backing.read_at(target as u64, &mut buf[..to_read])
    }
}

/// An ordered, contiguous vector of mapped segments presenting one stream.
#[derive(Debug, Clone, Default)]
pub struct RangeReader {
    pub runs: Vec<MappedReader>,
}

impl RangeReader {
    pub fn new(runs: Vec<MappedReader>) -> Self {
        RangeReader { runs }
    }

    pub fn ranges(&self) -> Vec<Range> {
        let mut result = Vec::with_capacity(self.runs.len());
        for run in &self.runs {
            result.extend(run.ranges());
        }
        result
    }

    /// End offset of the stream: where the last range stops.
    pub fn range_size(&self) -> i64 {
        match self.ranges().last() {
            Some(last) => last.offset + last.length,
            None => 0,
        }
    }
}

impl ReadAt for RangeReader {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut idx = 0usize;
        let mut off = offset as i64;

        for run in &self.runs {
            if idx >= buf.len() {
                break;
            }
            if run.file_start() <= off && off < run.file_end() {
                match run.read_at(off as u64, &mut buf[idx..]) {
                    Ok(0) | Err(NtfsError::EndOfFile) => break,
                    Ok(n) => {
                        idx += n;
                        off += n as i64;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if idx == 0 {
            return Err(NtfsError::EndOfFile);
        }
        Ok(idx)
    }
}

/// Intermediate absolute run used while composing readers.
#[derive(Debug, Clone, Copy)]
struct AbsoluteRun {
    file_offset: i64,
    target_offset: i64,
    length: i64,
    is_sparse: bool,
}

/// Convert relative runs into absolute cluster extents.
fn make_absolute_runs(runs: &[Run]) -> Vec<AbsoluteRun> {
    let mut result = Vec::with_capacity(runs.len());
    let mut file_offset = 0i64;
    let mut target_offset = 0i64;

    for run in runs {
        target_offset += run.relative_offset;
        if run.relative_offset == 0 {
            result.push(AbsoluteRun {
                file_offset,
                target_offset: 0,
                length: run.length,
                is_sparse: true,
            });
        } else {
            result.push(AbsoluteRun {
                file_offset,
                target_offset,
                length: run.length,
                is_sparse: false,
            });
        }
        file_offset += run.length;
    }
    result
}

/// Build a reader for an uncompressed (possibly sparse) runlist.
pub fn uncompressed_range_reader(
    runs: &[Run],
    cluster_size: i64,
    disk: Arc<dyn ReadAt>,
) -> RangeReader {
    let mut mapped = Vec::with_capacity(runs.len());
    for run in make_absolute_runs(runs) {
        mapped.push(MappedReader {
            file_offset: run.file_offset,
            target_offset: run.target_offset,
            length: run.length,
            cluster_size,
            compressed_length: 0,
            is_sparse: run.is_sparse,
            backing: if run.is_sparse {
                Backing::Null
            } else {
                Backing::Disk(disk.clone())
            },
        });
    }
    RangeReader::new(mapped)
}

/// Build a reader for a compressed runlist, normalizing the segments to
/// whole compression units.
pub fn compressed_range_reader(
    runs: &[Run],
    cluster_size: i64,
    disk: Arc<dyn ReadAt>,
    compression_unit: i64,
) -> RangeReader {
    let cu = compression_unit.max(1);
    let mut queue = make_absolute_runs(runs);
    let mut out: Vec<MappedReader> = Vec::new();

    let mut i = 0usize;
    while i < queue.len() {
        let mut run = queue[i];
        if run.length == 0 {
            i += 1;
            continue;
        }

        if run.is_sparse {
            out.push(MappedReader {
                file_offset: run.file_offset,
                target_offset: 0,
                length: run.length,
                cluster_size,
                compressed_length: 0,
                is_sparse: true,
                backing: Backing::Null,
            });
            i += 1;
            continue;
        }

        // Emit the pure-data prefix covering whole compression units.
        if run.length >= cu {
            let whole = run.length - run.length % cu;
            out.push(MappedReader {
                file_offset: run.file_offset,
                target_offset: run.target_offset,
                length: whole,
                cluster_size,
                compressed_length: 0,
                is_sparse: false,
                backing: Backing::Disk(disk.clone()),
            });
            run.file_offset += whole;
            run.target_offset += whole;
            run.length -= whole;
            if run.length == 0 {
                i += 1;
                continue;
            }
            queue[i] = run;
        }

        // A remainder shorter than one unit. Gather any further small data
        // runs that belong to the same unit.
        let mut parts = vec![run];
        let mut total = run.length;
        let mut j = i + 1;
        while total < cu && j < queue.len() && !queue[j].is_sparse && queue[j].length > 0 {
            let take = queue[j].length.min(cu - total);
            parts.push(AbsoluteRun {
                length: take,
                ..queue[j]
            });
            queue[j].file_offset += take;
            queue[j].target_offset += take;
            queue[j].length -= take;
            total += take;
            if queue[j].length == 0 {
                j += 1;
            }
        }

        let followed_by_sparse =
            j < queue.len() && queue[j].is_sparse && queue[j].length + total >= cu;

        if followed_by_sparse {
            // This unit compressed: `total` clusters of data swallowed the
            // sparse padding that completes the unit.
            if parts.len() == 1 {
                out.push(MappedReader {
                    file_offset: run.file_offset,
                    target_offset: run.target_offset,
                    length: cu,
                    cluster_size,
                    compressed_length: run.length,
                    is_sparse: false,
                    backing: Backing::Disk(disk.clone()),
                });
            } else {
                // Several fragments hold one unit's compressed data: wrap
                // them so the decompressor sees one contiguous source.
                let mut inner = Vec::with_capacity(parts.len());
                let mut inner_offset = 0i64;
                for part in &parts {
                    inner.push(MappedReader {
                        file_offset: inner_offset,
                        target_offset: part.target_offset,
                        length: part.length,
                        cluster_size,
                        compressed_length: 0,
                        is_sparse: false,
                        backing: Backing::Disk(disk.clone()),
                    });
                    inner_offset += part.length;
                }
                out.push(MappedReader {
                    file_offset: run.file_offset,
                    target_offset: 0,
                    length: cu,
                    cluster_size,
                    compressed_length: total,
                    is_sparse: false,
                    backing: Backing::Nested(Arc::new(RangeReader::new(inner))),
                });
            }
            // The sparse run loses the clusters the unit swallowed.
            let swallowed = cu - total;
            queue[j].file_offset += swallowed;
            queue[j].length -= swallowed;
            i = j;
            continue;
        }

        // No sparse completion: the tail is stored uncompressed.
        for part in &parts {
            out.push(MappedReader {
                file_offset: part.file_offset,
                target_offset: part.target_offset,
                length: part.length,
                cluster_size,
                compressed_length: 0,
                is_sparse: false,
                backing: Backing::Disk(disk.clone()),
            });
        }
        i = j;
    }

    debug!(
        "normalized {} runs into {} segments (cu {})",
        runs.len(),
        out.len(),
        cu
    );
    RangeReader::new(out)
}
