//! The two-tier byte source abstraction (spec.md §4.1).
//!
//! `MetaReader` is the cursor-based reader used for sequential metadata
//! parsing (superblocks, object headers, heaps, B-trees): `seek`, `read`,
//! `tell`, matching `zh5.file.FileReadStrategy` in the original Python.
//! `RangeFetcher` is a separate, cursor-free, `Send + Sync` snapshot used
//! only for the parallel bulk chunk-byte fetch in `dataset::read_chunked`
//! (spec.md §4.11 step 4) — it always bypasses the page cache, per
//! spec.md §4.1's "chunk-fetch path bypasses the page cache" rule.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A stateful, cursor-based reader over a local file or remote endpoint.
pub trait MetaReader: Send {
    fn seek(&mut self, pos: u64) -> Result<()>;
    fn read(&mut self, n: usize) -> Result<Vec<u8>>;
    fn tell(&self) -> u64;
    fn is_remote(&self) -> bool {
        false
    }
    /// A cursor-free snapshot of this reader's normal read path — cached,
    /// for a paged reader.
    fn range_fetcher(&self) -> Arc<dyn RangeFetcher>;

    /// The cache-bypassing fetcher for bulk raw-chunk reads (spec.md §4.1,
    /// §4.11 step 4: "the chunk-fetch path bypasses the page cache"). Most
    /// readers have no cache of their own, so this defaults to
    /// `range_fetcher()`; `PagedReader` overrides it to skip its page cache.
    fn bypass_fetcher(&self) -> Arc<dyn RangeFetcher> {
        self.range_fetcher()
    }

    /// Total byte length of the source, when known up front (local files,
    /// HTTP sources after the opening `HEAD`). `None` for adapters with no
    /// fixed length of their own (e.g. `FetchCursor`).
    fn total_len(&self) -> Option<u64> {
        None
    }

    /// Page-cache counters, observable on `File` regardless of whether the
    /// underlying reader is paged (spec.md §6): non-paged readers report 0
    /// and treat `reset_cache` as a no-op.
    fn cache_hits(&self) -> u64 {
        0
    }
    fn cache_misses(&self) -> u64 {
        0
    }
    fn reset_cache(&mut self) {}
}

/// A stateless, thread-safe range reader used for parallel chunk fetch.
pub trait RangeFetcher: Send + Sync {
    fn fetch(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn is_remote(&self) -> bool {
        false
    }
    /// Total byte length of the source, when known up front. `None` when
    /// the fetcher has no fixed length of its own (e.g. a paged fetcher's
    /// last partial page is clamped by its own underlying fetcher instead).
    fn total_len(&self) -> Option<u64> {
        None
    }
}

/// Local file, backed by a read-only memory map.
pub struct LocalSource {
    map: Arc<memmap2::Mmap>,
    pos: u64,
}

impl LocalSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let map = unsafe { memmap2::Mmap::map(&file)? };
        Ok(LocalSource { map: Arc::new(map), pos: 0 })
    }

    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }
}

struct LocalFetcher {
    map: Arc<memmap2::Mmap>,
}

impl RangeFetcher for LocalFetcher {
    fn fetch(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let start = offset as usize;
        let end = start + len;
        if end > self.map.len() {
            return Err(Error::Corrupt(format!(
                "range {}..{} is out of bounds for a {}-byte file",
                start,
                end,
                self.map.len()
            )));
        }
        Ok(self.map[start..end].to_vec())
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.map.len() as u64)
    }
}

impl MetaReader for LocalSource {
    fn seek(&mut self, pos: u64) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let start = self.pos as usize;
        let end = start + n;
        if end > self.map.len() {
            return Err(Error::Corrupt(format!(
                "read of {} bytes at {} runs past end of {}-byte file",
                n,
                start,
                self.map.len()
            )));
        }
        self.pos += n as u64;
        Ok(self.map[start..end].to_vec())
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn range_fetcher(&self) -> Arc<dyn RangeFetcher> {
        Arc::new(LocalFetcher { map: self.map.clone() })
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.map.len() as u64)
    }
}

const HTTP_MAX_RETRIES: u32 = 3;

fn backoff_delay(attempt: u32) -> std::time::Duration {
    std::time::Duration::from_millis(100u64 << attempt)
}

/// HTTP(S) byte source, reading with `Range: bytes=a-b` requests.
///
/// Mirrors `zh5.remote.HTTPRangeReader`: a `HEAD` request at construction
/// learns the total length, and `seek` only moves a logical cursor.
pub struct HttpSource {
    client: Arc<reqwest::blocking::Client>,
    url: String,
    length: u64,
    pos: u64,
}

impl HttpSource {
    pub fn open(url: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::new();
        let resp = client.head(url).send()?;
        let length = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| Error::Corrupt(format!("no Content-Length from {url}")))?;
        Ok(HttpSource { client: Arc::new(client), url: url.to_string(), length, pos: 0 })
    }

    pub fn len(&self) -> u64 {
        self.length
    }
}

struct HttpFetcher {
    client: Arc<reqwest::blocking::Client>,
    url: String,
    length: u64,
}

fn range_get(
    client: &reqwest::blocking::Client,
    url: &str,
    start: u64,
    len: usize,
) -> Result<Vec<u8>> {
    let end = start + len as u64 - 1;
    let header = format!("bytes={start}-{end}");
    let mut attempt = 0;
    loop {
        tracing::debug!(range = %header, "HTTP range request");
        let result = client
            .get(url)
            .header(reqwest::header::RANGE, header.clone())
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.bytes());
        match result {
            Ok(bytes) => return Ok(bytes.to_vec()),
            Err(e) => {
                let retriable = e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false);
                if !retriable || attempt >= HTTP_MAX_RETRIES {
                    return Err(Error::Http(e));
                }
                std::thread::sleep(backoff_delay(attempt));
                attempt += 1;
            }
        }
    }
}

impl RangeFetcher for HttpFetcher {
    fn fetch(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        range_get(&self.client, &self.url, offset, len)
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.length)
    }
}

impl MetaReader for HttpSource {
    fn seek(&mut self, pos: u64) -> Result<()> {
        self.pos = pos.min(self.length);
        Ok(())
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let bytes = range_get(&self.client, &self.url, self.pos, n)?;
        self.pos += bytes.len() as u64;
        Ok(bytes)
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn range_fetcher(&self) -> Arc<dyn RangeFetcher> {
        Arc::new(HttpFetcher { client: self.client.clone(), url: self.url.clone(), length: self.length })
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.length)
    }
}

/// Opens a local path or an `http(s)://` URL, per spec.md §6.
pub fn open_source(name: &str) -> Result<Box<dyn MetaReader>> {
    if name.starts_with("http://") || name.starts_with("https://") {
        Ok(Box::new(HttpSource::open(name)?))
    } else {
        Ok(Box::new(LocalSource::open(name)?))
    }
}

/// The page cache itself, shared (via `Arc`) between a `PagedReader`'s own
/// cursor reads and every `PagedFetcher` snapshot handed out by
/// `range_fetcher()` — so metadata traversal done through either path reads
/// and populates the same cache and the same hit/miss counters. `direct` is
/// the uncached fetcher pages are actually filled from, and is also what
/// `PagedReader::bypass_fetcher` hands back untouched for bulk chunk reads.
struct PagedState {
    direct: Arc<dyn RangeFetcher>,
    page_size: u64,
    cache: Mutex<HashMap<u64, Vec<u8>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl PagedState {
    fn page(&self, page_id: u64) -> Result<Vec<u8>> {
        if let Some(bytes) = self.cache.lock().unwrap().get(&page_id) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(bytes.clone());
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let page_offset = page_id * self.page_size;
        let want = match self.direct.total_len() {
            Some(total) => self.page_size.min(total.saturating_sub(page_offset)),
            None => self.page_size,
        };
        let bytes = self.direct.fetch(page_offset, want as usize)?;
        self.cache.lock().unwrap().insert(page_id, bytes.clone());
        Ok(bytes)
    }

    fn fetch(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut remaining = len as u64;
        let mut cur = offset;
        while remaining > 0 {
            let page_id = cur / self.page_size;
            let page_offset = cur % self.page_size;
            let take = remaining.min(self.page_size - page_offset);
            let page = self.page(page_id)?;
            let from = page_offset as usize;
            let to = from + take as usize;
            if to > page.len() {
                return Err(Error::Corrupt(format!(
                    "read past end of file at offset {cur} (page {page_id} has only {} bytes)",
                    page.len()
                )));
            }
            out.extend_from_slice(&page[from..to]);
            cur += take;
            remaining -= take;
        }
        Ok(out)
    }

    fn reset(&self) {
        self.cache.lock().unwrap().clear();
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
    }
}

/// Page-aligned cache decorator (spec.md §4.1, `zh5.file.PageFileReadStrategy`).
pub struct PagedReader {
    state: Arc<PagedState>,
    pos: u64,
}

impl PagedReader {
    pub fn new(inner: Box<dyn MetaReader>, page_size: u64, pos: u64) -> Self {
        let direct = inner.range_fetcher();
        PagedReader {
            state: Arc::new(PagedState {
                direct,
                page_size,
                cache: Mutex::new(HashMap::new()),
                cache_hits: AtomicU64::new(0),
                cache_misses: AtomicU64::new(0),
            }),
            pos,
        }
    }

    pub fn cache_hits(&self) -> u64 {
        self.state.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.state.cache_misses.load(Ordering::Relaxed)
    }

    pub fn reset_cache(&mut self) {
        self.state.reset();
    }
}

/// A cursor-free snapshot of a `PagedReader`'s cache, handed out by
/// `range_fetcher()` so `Group`/`Dataset` metadata reads (link enumeration,
/// B-tree traversal, heap resolution) go through the same page cache as the
/// reader that opened the file, instead of bypassing it (spec.md §4.1).
struct PagedFetcher {
    state: Arc<PagedState>,
}

impl RangeFetcher for PagedFetcher {
    fn fetch(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.state.fetch(offset, len)
    }

    fn is_remote(&self) -> bool {
        self.state.direct.is_remote()
    }
}

impl MetaReader for PagedReader {
    fn seek(&mut self, pos: u64) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let bytes = self.state.fetch(self.pos, n)?;
        self.pos += n as u64;
        Ok(bytes)
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn is_remote(&self) -> bool {
        self.state.direct.is_remote()
    }

    fn range_fetcher(&self) -> Arc<dyn RangeFetcher> {
        Arc::new(PagedFetcher { state: self.state.clone() })
    }

    /// Bulk raw-chunk reads go straight to the direct fetcher this page
    /// cache fills its pages from, never through the cache itself (spec.md
    /// §4.1, §4.11 step 4).
    fn bypass_fetcher(&self) -> Arc<dyn RangeFetcher> {
        self.state.direct.clone()
    }

    fn cache_hits(&self) -> u64 {
        PagedReader::cache_hits(self)
    }

    fn cache_misses(&self) -> u64 {
        PagedReader::cache_misses(self)
    }

    fn reset_cache(&mut self) {
        PagedReader::reset_cache(self)
    }

    fn total_len(&self) -> Option<u64> {
        self.state.direct.total_len()
    }
}

/// Reads `n` bytes from `reader` without disturbing a caller-visible cursor
/// convention other than the standard seek/read/tell contract.
pub fn read_exact_at(reader: &mut dyn MetaReader, offset: u64, n: usize) -> Result<Vec<u8>> {
    reader.seek(offset)?;
    reader.read(n)
}

/// Adapts a cursor-free `RangeFetcher` snapshot to the `MetaReader` cursor
/// contract, so metadata traversal (object headers, links, heaps) can run
/// against a plain fetcher without needing a `File`'s own cursor. This is
/// what lets `Group`/`Dataset` resolve further entries with only `&self`.
pub struct FetchCursor {
    fetcher: Arc<dyn RangeFetcher>,
    pos: u64,
}

impl FetchCursor {
    pub fn new(fetcher: Arc<dyn RangeFetcher>) -> Self {
        FetchCursor { fetcher, pos: 0 }
    }
}

impl MetaReader for FetchCursor {
    fn seek(&mut self, pos: u64) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let bytes = self.fetcher.fetch(self.pos, n)?;
        self.pos += n as u64;
        Ok(bytes)
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn is_remote(&self) -> bool {
        self.fetcher.is_remote()
    }

    fn range_fetcher(&self) -> Arc<dyn RangeFetcher> {
        self.fetcher.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(bytes: &[u8], name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path
    }

    /// A `range_fetcher()` snapshot of a `PagedReader` must share the same
    /// cache as the reader's own cursor reads: a page already pulled in by
    /// `read` is a hit when later touched through the fetcher, and vice
    /// versa. This is the behavior `Group`/`Dataset` metadata traversal
    /// depends on (spec.md §4.1).
    #[test]
    fn range_fetcher_shares_cache_with_cursor_reads() {
        let data: Vec<u8> = (0u8..=255).collect();
        let path = write_temp(&data, "hdf5_reader_test_bs_paged_shared.bin");
        let source = LocalSource::open(&path).unwrap();
        let mut paged = PagedReader::new(Box::new(source), 64, 0);

        paged.seek(0).unwrap();
        let first = paged.read(16).unwrap();
        assert_eq!(first, data[0..16]);
        assert_eq!(paged.cache_misses(), 1);
        assert_eq!(paged.cache_hits(), 0);

        let fetcher = paged.range_fetcher();
        let via_fetcher = fetcher.fetch(16, 16).unwrap();
        assert_eq!(via_fetcher, data[16..32]);
        // same page (0) as the cursor read above: a hit, not a second miss.
        assert_eq!(paged.cache_misses(), 1);
        assert_eq!(paged.cache_hits(), 1);

        // a fetch into a fresh page is still a miss, observed through the
        // reader even though it was driven by the fetcher.
        let _ = fetcher.fetch(64, 8).unwrap();
        assert_eq!(paged.cache_misses(), 2);

        std::fs::remove_file(&path).ok();
    }

    /// `bypass_fetcher()` must read correct bytes without ever touching the
    /// page cache's hit/miss counters (spec.md §4.1's "chunk-fetch path
    /// bypasses the page cache").
    #[test]
    fn bypass_fetcher_does_not_touch_cache_counters() {
        let data: Vec<u8> = (0u8..=255).collect();
        let path = write_temp(&data, "hdf5_reader_test_bs_paged_bypass.bin");
        let source = LocalSource::open(&path).unwrap();
        let paged = PagedReader::new(Box::new(source), 64, 0);

        let bypass = paged.bypass_fetcher();
        let bytes = bypass.fetch(100, 10).unwrap();
        assert_eq!(bytes, data[100..110]);
        assert_eq!(paged.cache_hits(), 0);
        assert_eq!(paged.cache_misses(), 0);

        std::fs::remove_file(&path).ok();
    }

    /// The final, partial page of a file whose length isn't a multiple of
    /// the page size must not fail with an out-of-bounds read.
    #[test]
    fn partial_final_page_reads_cleanly() {
        let data: Vec<u8> = (0u8..100).collect(); // 100 bytes, page size 64 -> last page is 36 bytes
        let path = write_temp(&data, "hdf5_reader_test_bs_paged_partial.bin");
        let source = LocalSource::open(&path).unwrap();
        let mut paged = PagedReader::new(Box::new(source), 64, 0);

        paged.seek(90).unwrap();
        let tail = paged.read(10).unwrap();
        assert_eq!(tail, data[90..100]);

        std::fs::remove_file(&path).ok();
    }
}
