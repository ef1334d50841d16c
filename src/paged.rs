//! Page-aligned cached reader.
//!
//! Raw devices and acquired images are slow to hit with many tiny reads,
//! and raw windows devices can only be read on sector boundaries. The
//! `PagedReader` turns arbitrary reads into page-aligned reads against the
//! backing source and keeps recently used pages in a bounded LRU. Evicted
//! page buffers land on a free list so steady-state operation does not
//! allocate.

use std::sync::{Arc, Mutex};

use log::trace;

use crate::cache::Lru;
use crate::error::{NtfsError, Result};
use crate::reader::ReadAt;

/// Default page size used by the convenience constructors.
pub const DEFAULT_PAGE_SIZE: u64 = 1024;

/// Default number of cached pages (~10 MiB at the default page size).
pub const DEFAULT_CACHE_PAGES: usize = 10_000;

/// Cache effectiveness counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagedStats {
    pub hits: u64,
    pub misses: u64,
}

struct PageState {
    lru: Lru<u64, Vec<u8>>,
    freelist: Vec<Vec<u8>>,
    /// Byte position of EOF, once observed.
    eof: Option<u64>,
    stats: PagedStats,
}

/// An LRU-cached, page-aligned `ReadAt` over an unaligned backing reader.
///
/// Reads that straddle EOF return the full buffer zero-padded past the
/// end; reads that start at or beyond EOF fail with `EndOfFile`. Large
/// page-multiple reads bypass the cache entirely.
pub struct PagedReader {
    inner: Arc<dyn ReadAt>,
    pagesize: u64,
    state: Mutex<PageState>,
}

impl PagedReader {
    pub fn new(inner: Arc<dyn ReadAt>, pagesize: u64, cache_pages: usize) -> Self {
        PagedReader {
            inner,
            pagesize: pagesize.max(1),
            state: Mutex::new(PageState {
                lru: Lru::with_capacity(cache_pages.max(1)),
                freelist: Vec::new(),
                eof: None,
                stats: PagedStats::default(),
            }),
        }
    }

    pub fn with_defaults(inner: Arc<dyn ReadAt>) -> Self {
        Self::new(inner, DEFAULT_PAGE_SIZE, DEFAULT_CACHE_PAGES)
    }

    pub fn pagesize(&self) -> u64 {
        self.pagesize
    }

    pub fn stats(&self) -> PagedStats {
        self.state.lock().unwrap().stats
    }

    /// Drop all cached pages. The `watch` loop calls this between passes so
    /// a live journal is re-read from the source.
    pub fn purge(&self) {
        let mut state = self.state.lock().unwrap();
        let pages = state.lru.purge();
        state.freelist.extend(pages);
        state.eof = None;
    }

    /// Fetch the page starting at `page` into the cache, returning a copy
    /// window. The page buffer is zero-filled past a short read.
    fn load_page(&self, state: &mut PageState, page: u64) -> Result<Vec<u8>> {
        let mut page_buf = state
            .freelist
            .pop()
            .unwrap_or_else(|| vec![0u8; self.pagesize as usize]);
        page_buf.resize(self.pagesize as usize, 0);

        let n = match self.inner.read_at(page, &mut page_buf) {
            Ok(n) => n,
            Err(NtfsError::EndOfFile) => 0,
            Err(e) => {
                state.freelist.push(page_buf);
                return Err(e);
            }
        };

        if n < self.pagesize as usize {
            // Partial tail page: remember where the file really ends and
            // zero the stale remainder of the recycled buffer.
            page_buf[n..].fill(0);
            state.eof = Some(page + n as u64);
            trace!("paged: eof discovered at {:#x}", page + n as u64);
        }

        if n == 0 {
            state.freelist.push(page_buf);
            return Err(NtfsError::EndOfFile);
        }

        if let Some((_, old)) = state.lru.insert(page, page_buf.clone()) {
            state.freelist.push(old);
        }
        Ok(page_buf)
    }
}

impl ReadAt for PagedReader {
    fn flush(&self) {
        self.purge();
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // Big page-multiple reads are faster straight from the source.
        if buf.len() as u64 > 10 * self.pagesize && buf.len() as u64 % self.pagesize == 0 {
            return self.inner.read_at(offset, buf);
        }

        let mut state = self.state.lock().unwrap();
        let mut idx = 0usize;
        let mut off = offset;

        while idx < buf.len() {
            if let Some(eof) = state.eof {
                if off >= eof {
                    if idx == 0 {
                        return Err(NtfsError::EndOfFile);
                    }
                    // Straddled EOF: pad out the rest of the buffer.
                    buf[idx..].fill(0);
                    idx = buf.len();
                    break;
                }
            }

            let page = off - off % self.pagesize;
            let page_off = (off - page) as usize;
            let to_read = (self.pagesize as usize - page_off).min(buf.len() - idx);

            let st = &mut *state;
            if let Some(cached) = st.lru.get(&page) {
                st.stats.hits += 1;
                buf[idx..idx + to_read].copy_from_slice(&cached[page_off..page_off + to_read]);
            } else {
                st.stats.misses += 1;
                trace!("paged: miss for page {:#x} ({} cached)", page, st.lru.len());
                match self.load_page(st, page) {
                    Ok(page_buf) => {
                        buf[idx..idx + to_read]
                            .copy_from_slice(&page_buf[page_off..page_off + to_read]);
                    }
                    Err(NtfsError::EndOfFile) => {
                        if idx == 0 {
                            return Err(NtfsError::EndOfFile);
                        }
                        buf[idx..].fill(0);
                        idx = buf.len();
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            idx += to_read;
            off += to_read as u64;
        }

        Ok(idx)
    }
}
