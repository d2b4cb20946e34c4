//! Disk-backed page management.
//!
//! The pager hides the file from the tree: it hands out cached page
//! buffers by page id, tracks which of them have been written, recycles
//! freed pages, and persists the small file header that makes the file
//! self-describing.
//!
//! Cache policy: at most [`CACHE_CAP`] resident buffers with LRU
//! eviction. Only pages in the dirty set are ever written back; clean
//! pages are discarded without I/O. Earlier revisions flushed every
//! cached page on close, which under read-mostly workloads wrote an
//! order of magnitude more than necessary.
//!
//! The freelist is a chain of reclaimable page ids held in RAM
//! (`free_head` plus a page-to-next map). Freed page bodies are never
//! written with chain links; the chain is serialized to a side-file on
//! close and rejected wholesale at open if it fails validation.

use crate::errors::Error;
use crate::storage::node::{Node, PAGE_SIZE};
use bincode::{config, Decode, Encode};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Hard cap on the number of pages in one file.
pub const TABLE_MAX_PAGES: u32 = 100_000;

/// Maximum number of resident page buffers.
pub const CACHE_CAP: usize = 100;

/// The first 8 bytes of the file, preceding page 0.
pub const FILE_HEADER_SIZE: usize = 8;

#[derive(Encode, Decode, Debug)]
struct FileHeader {
    /// Page id of the tree root.
    root_page: u32,
    /// Page id of the first reclaimable page; 0 means none.
    free_head: u32,
}

/// Serialized form of the freelist chain, kept in a side-file next to
/// the database so freed page bodies stay untyped.
#[derive(Encode, Decode, Debug, Default)]
struct FreelistFile {
    head: u32,
    links: Vec<(u32, u32)>,
}

fn wire_config() -> impl bincode::config::Config {
    config::standard().with_fixed_int_encoding()
}

pub struct Pager {
    file: File,
    path: PathBuf,
    /// Pages addressable this session, including ones not yet on disk.
    num_pages: u32,
    /// Pages currently backed by file bytes.
    file_pages: u32,
    root_page: u32,
    free_head: u32,
    /// Freelist chain: page id to its successor (0 terminates).
    free_links: HashMap<u32, u32>,
    cache: HashMap<u32, Node>,
    /// Resident page ids, least recently used first.
    lru: heapless::Vec<u32, CACHE_CAP>,
    dirty: HashSet<u32>,
}

impl Pager {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let file_len = file.metadata()?.len();

        let (root_page, free_head, file_pages) = if file_len == 0 {
            (0, 0, 0)
        } else {
            if file_len < FILE_HEADER_SIZE as u64
                || (file_len - FILE_HEADER_SIZE as u64) % PAGE_SIZE as u64 != 0
            {
                return Err(err!(
                    Corrupt,
                    "file is {} bytes, not a header plus a whole number of pages",
                    file_len
                ));
            }
            let header = read_header(&mut file)?;
            let file_pages = ((file_len - FILE_HEADER_SIZE as u64) / PAGE_SIZE as u64) as u32;
            if header.root_page >= file_pages.max(1) {
                return Err(err!(
                    Corrupt,
                    "header root page {} past end of file ({} pages)",
                    header.root_page,
                    file_pages
                ));
            }
            (header.root_page, header.free_head, file_pages)
        };

        let mut pager = Pager {
            file,
            path: path.to_path_buf(),
            num_pages: file_pages,
            file_pages,
            root_page,
            free_head,
            free_links: HashMap::new(),
            cache: HashMap::new(),
            lru: heapless::Vec::new(),
            dirty: HashSet::new(),
        };
        if pager.free_head != 0 {
            pager.load_freelist();
        }
        debug!(
            path = %pager.path.display(),
            num_pages = pager.num_pages,
            root_page = pager.root_page,
            "opened database file"
        );
        Ok(pager)
    }

    pub fn root_page(&self) -> u32 {
        self.root_page
    }

    pub fn set_root_page(&mut self, page_num: u32) {
        self.root_page = page_num;
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    /// Borrows a cached page for reading.
    pub fn page(&mut self, page_num: u32) -> Result<&Node, Error> {
        self.ensure_cached(page_num)?;
        self.cache
            .get(&page_num)
            .ok_or_else(|| err!(Disk, "page {} vanished from cache", page_num))
    }

    /// Borrows a cached page for writing and marks it dirty in the same
    /// call. Every mutating path goes through here, so no structural
    /// update can be lost to an unmarked page.
    pub fn page_mut(&mut self, page_num: u32) -> Result<&mut Node, Error> {
        self.ensure_cached(page_num)?;
        self.dirty.insert(page_num);
        self.cache
            .get_mut(&page_num)
            .ok_or_else(|| err!(Disk, "page {} vanished from cache", page_num))
    }

    pub fn mark_dirty(&mut self, page_num: u32) {
        self.dirty.insert(page_num);
    }

    /// Pops the freelist if it has a valid chain, otherwise extends the
    /// file. The returned page is zero-filled, resident, and dirty.
    pub fn allocate_page(&mut self) -> Result<u32, Error> {
        if self.free_head != 0 {
            if let Err(e) = self.validate_freelist() {
                warn!(error = %e, "freelist failed validation, dropping reclaimable pages");
                self.free_head = 0;
                self.free_links.clear();
            }
        }
        let page_num = if self.free_head != 0 {
            let page_num = self.free_head;
            self.free_head = self.free_links.remove(&page_num).unwrap_or(0);
            trace!(page = page_num, "reusing freed page");
            page_num
        } else {
            if self.num_pages >= TABLE_MAX_PAGES {
                return Err(Error::TableFull);
            }
            let page_num = self.num_pages;
            self.num_pages += 1;
            page_num
        };
        if self.cache.len() >= CACHE_CAP {
            self.evict_lru()?;
        }
        self.cache.insert(page_num, Node::zeroed());
        self.touch(page_num);
        self.dirty.insert(page_num);
        debug!(page = page_num, num_pages = self.num_pages, "allocated page");
        Ok(page_num)
    }

    /// Returns `page_num` to the freelist and drops its buffer, so a
    /// later read cannot observe the stale contents.
    pub fn free_page(&mut self, page_num: u32) -> Result<(), Error> {
        if page_num == 0 || page_num >= self.num_pages {
            return Err(Error::PageOutOfBounds(page_num));
        }
        self.cache.remove(&page_num);
        self.dirty.remove(&page_num);
        self.drop_from_lru(page_num);
        self.free_links.insert(page_num, self.free_head);
        self.free_head = page_num;
        debug!(page = page_num, "freed page");
        Ok(())
    }

    /// Writes one cached page back to disk and clears its dirty flag.
    pub fn flush_page(&mut self, page_num: u32) -> Result<(), Error> {
        let node = self
            .cache
            .get(&page_num)
            .ok_or_else(|| err!(Disk, "flush of page {} not in cache", page_num))?;
        let offset = FILE_HEADER_SIZE as u64 + page_num as u64 * PAGE_SIZE as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| err!(Disk, "seek to page {}: {}", page_num, e))?;
        self.file
            .write_all(node.as_bytes())
            .map_err(|e| err!(Disk, "write of page {}: {}", page_num, e))?;
        if page_num >= self.file_pages {
            self.file_pages = page_num + 1;
        }
        self.dirty.remove(&page_num);
        Ok(())
    }

    /// Flushes exactly the dirty set, then the header and the freelist
    /// side-file. Clean cached pages are discarded without I/O.
    pub fn close(&mut self) -> Result<(), Error> {
        let mut dirty: Vec<u32> = self.dirty.iter().copied().collect();
        dirty.sort_unstable();
        let flushed = dirty.len();
        for page_num in dirty {
            self.flush_page(page_num)?;
        }
        self.write_header()?;
        self.write_freelist()?;
        self.file
            .sync_all()
            .map_err(|e| err!(Disk, "sync at close: {}", e))?;
        debug!(flushed, num_pages = self.num_pages, "closed database file");
        Ok(())
    }

    /// Walks the freelist chain with a slow and a fast pointer, failing
    /// on a cycle or an entry past the end of the file. Runs before
    /// every pop; the chain is bounded, so the cost stays small.
    pub fn validate_freelist(&self) -> Result<(), Error> {
        if self.free_head == 0 {
            return Ok(());
        }
        let step = |page_num: u32| -> Result<u32, Error> {
            if page_num >= self.num_pages {
                return Err(err!(
                    Corrupt,
                    "freelist entry {} past end of file ({} pages)",
                    page_num,
                    self.num_pages
                ));
            }
            Ok(self.free_links.get(&page_num).copied().unwrap_or(0))
        };
        let mut slow = self.free_head;
        let mut fast = step(self.free_head)?;
        while fast != 0 {
            if slow == fast {
                return Err(err!(Corrupt, "freelist cycle through page {}", slow));
            }
            slow = step(slow)?;
            fast = step(fast)?;
            if fast != 0 {
                fast = step(fast)?;
            }
        }
        Ok(())
    }

    /// Page ids on the freelist, in chain order. Assumes the chain has
    /// already passed [`Pager::validate_freelist`].
    pub fn free_pages(&self) -> Vec<u32> {
        let mut pages = Vec::new();
        let mut current = self.free_head;
        while current != 0 && pages.len() <= self.num_pages as usize {
            pages.push(current);
            current = self.free_links.get(&current).copied().unwrap_or(0);
        }
        pages
    }

    fn ensure_cached(&mut self, page_num: u32) -> Result<(), Error> {
        if page_num >= TABLE_MAX_PAGES || page_num >= self.num_pages {
            return Err(Error::PageOutOfBounds(page_num));
        }
        if self.cache.contains_key(&page_num) {
            self.touch(page_num);
            return Ok(());
        }
        if self.cache.len() >= CACHE_CAP {
            self.evict_lru()?;
        }
        let node = self.read_page(page_num)?;
        self.cache.insert(page_num, node);
        self.touch(page_num);
        Ok(())
    }

    /// Fills a buffer from disk, or with zeroes for a page the file does
    /// not cover yet. A short read inside the covered range is fatal.
    fn read_page(&mut self, page_num: u32) -> Result<Node, Error> {
        let mut node = Node::zeroed();
        if page_num < self.file_pages {
            let offset = FILE_HEADER_SIZE as u64 + page_num as u64 * PAGE_SIZE as u64;
            self.file
                .seek(SeekFrom::Start(offset))
                .map_err(|e| err!(Disk, "seek to page {}: {}", page_num, e))?;
            self.file
                .read_exact(node.as_bytes_mut())
                .map_err(|e| err!(Disk, "short read of page {}: {}", page_num, e))?;
        }
        Ok(node)
    }

    fn evict_lru(&mut self) -> Result<(), Error> {
        if self.lru.is_empty() {
            return Err(err!(Disk, "page cache full with nothing to evict"));
        }
        let victim = self.lru.remove(0);
        if self.dirty.contains(&victim) {
            self.flush_page(victim)?;
        }
        self.cache.remove(&victim);
        trace!(page = victim, "evicted page");
        Ok(())
    }

    /// Moves `page_num` to the most recently used position.
    fn touch(&mut self, page_num: u32) {
        self.drop_from_lru(page_num);
        // Eviction keeps the cache and the order list strictly within
        // capacity, so this push cannot be refused.
        let _ = self.lru.push(page_num);
    }

    fn drop_from_lru(&mut self, page_num: u32) {
        if let Some(pos) = self.lru.iter().position(|&p| p == page_num) {
            self.lru.remove(pos);
        }
    }

    fn write_header(&mut self) -> Result<(), Error> {
        let header = FileHeader {
            root_page: self.root_page,
            free_head: self.free_head,
        };
        let bytes = bincode::encode_to_vec(&header, wire_config())
            .map_err(|e| err!(Disk, "encode file header: {}", e))?;
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| err!(Disk, "seek to file header: {}", e))?;
        self.file
            .write_all(&bytes)
            .map_err(|e| err!(Disk, "write file header: {}", e))?;
        Ok(())
    }

    fn freelist_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.freelist", self.path.display()))
    }

    fn write_freelist(&self) -> Result<(), Error> {
        let record = FreelistFile {
            head: self.free_head,
            links: self.free_links.iter().map(|(&p, &n)| (p, n)).collect(),
        };
        let bytes = bincode::encode_to_vec(&record, wire_config())
            .map_err(|e| err!(Disk, "encode freelist: {}", e))?;
        std::fs::write(self.freelist_path(), bytes)
            .map_err(|e| err!(Disk, "write freelist file: {}", e))?;
        Ok(())
    }

    /// Recovers the chain saved by the previous session. Any
    /// inconsistency rejects the whole list: losing reclaimable pages is
    /// recoverable, losing live data is not.
    fn load_freelist(&mut self) {
        let path = self.freelist_path();
        let loaded = (|| -> Result<(), Error> {
            let bytes = std::fs::read(&path)
                .map_err(|e| err!(Corrupt, "freelist file unreadable: {}", e))?;
            let (record, _): (FreelistFile, usize) =
                bincode::decode_from_slice(&bytes, wire_config())
                    .map_err(|e| err!(Corrupt, "freelist file undecodable: {}", e))?;
            if record.head != self.free_head {
                return Err(err!(
                    Corrupt,
                    "freelist head {} does not match header {}",
                    record.head,
                    self.free_head
                ));
            }
            self.free_links = record.links.into_iter().collect();
            self.validate_freelist()
        })();
        if let Err(e) = loaded {
            warn!(error = %e, "freelist rejected at open, starting empty");
            self.free_head = 0;
            self.free_links.clear();
        }
    }
}

fn read_header(file: &mut File) -> Result<FileHeader, Error> {
    file.seek(SeekFrom::Start(0))
        .map_err(|e| err!(Disk, "seek to file header: {}", e))?;
    let mut buf = [0u8; FILE_HEADER_SIZE];
    file.read_exact(&mut buf)
        .map_err(|e| err!(Disk, "short read of file header: {}", e))?;
    let (header, _) = bincode::decode_from_slice(&buf, wire_config())
        .map_err(|e| err!(Corrupt, "undecodable file header: {}", e))?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn db_path(dir: &TempDir) -> PathBuf {
        dir.path().join("pager_test.db")
    }

    #[test]
    fn fresh_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let pager = Pager::open(&db_path(&dir)).unwrap();
        assert_eq!(pager.num_pages(), 0);
        assert_eq!(pager.root_page(), 0);
        assert!(pager.free_pages().is_empty());
    }

    #[test]
    fn pages_survive_close_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);
        {
            let mut pager = Pager::open(&path).unwrap();
            let page_num = pager.allocate_page().unwrap();
            pager.page_mut(page_num).unwrap().as_bytes_mut()[100] = 0xAB;
            pager.close().unwrap();
        }
        let mut pager = Pager::open(&path).unwrap();
        assert_eq!(pager.num_pages(), 1);
        assert_eq!(pager.page(0).unwrap().as_bytes()[100], 0xAB);
    }

    #[test]
    fn reading_does_not_dirty() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);
        {
            let mut pager = Pager::open(&path).unwrap();
            let page_num = pager.allocate_page().unwrap();
            pager.page_mut(page_num).unwrap().as_bytes_mut()[0] = 3;
            pager.close().unwrap();
        }
        let mut pager = Pager::open(&path).unwrap();
        let _ = pager.page(0).unwrap();
        assert!(pager.dirty.is_empty());
        pager.page_mut(0).unwrap();
        assert!(pager.dirty.contains(&0));
    }

    #[test]
    fn eviction_preserves_dirty_pages() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);
        let mut pager = Pager::open(&path).unwrap();
        let total = (CACHE_CAP + 50) as u32;
        for i in 0..total {
            let page_num = pager.allocate_page().unwrap();
            assert_eq!(page_num, i);
            pager.page_mut(page_num).unwrap().as_bytes_mut()[0] = (i % 251) as u8;
        }
        // Everything before the tail of the LRU has been evicted; the
        // dirty ones must have hit the disk on the way out.
        for i in 0..total {
            assert_eq!(pager.page(i).unwrap().as_bytes()[0], (i % 251) as u8);
        }
    }

    #[test]
    fn freed_pages_are_reused_before_extending() {
        let dir = TempDir::new().unwrap();
        let mut pager = Pager::open(&db_path(&dir)).unwrap();
        for _ in 0..4 {
            pager.allocate_page().unwrap();
        }
        pager.free_page(2).unwrap();
        pager.free_page(3).unwrap();
        assert_eq!(pager.free_pages(), vec![3, 2]);
        assert_eq!(pager.allocate_page().unwrap(), 3);
        assert_eq!(pager.allocate_page().unwrap(), 2);
        assert_eq!(pager.allocate_page().unwrap(), 4);
        assert_eq!(pager.num_pages(), 5);
    }

    #[test]
    fn reused_page_comes_back_zeroed() {
        let dir = TempDir::new().unwrap();
        let mut pager = Pager::open(&db_path(&dir)).unwrap();
        pager.allocate_page().unwrap();
        let page_num = pager.allocate_page().unwrap();
        pager.page_mut(page_num).unwrap().as_bytes_mut().fill(0xFF);
        pager.free_page(page_num).unwrap();
        let again = pager.allocate_page().unwrap();
        assert_eq!(again, page_num);
        assert!(pager.page(again).unwrap().as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn freelist_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);
        {
            let mut pager = Pager::open(&path).unwrap();
            for _ in 0..3 {
                let p = pager.allocate_page().unwrap();
                pager.page_mut(p).unwrap();
            }
            pager.free_page(1).unwrap();
            pager.close().unwrap();
        }
        let mut pager = Pager::open(&path).unwrap();
        assert_eq!(pager.free_pages(), vec![1]);
        assert_eq!(pager.allocate_page().unwrap(), 1);
    }

    #[test]
    fn corrupt_freelist_file_resets_to_empty() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);
        {
            let mut pager = Pager::open(&path).unwrap();
            for _ in 0..3 {
                let p = pager.allocate_page().unwrap();
                pager.page_mut(p).unwrap();
            }
            pager.free_page(2).unwrap();
            pager.close().unwrap();
        }
        std::fs::write(format!("{}.freelist", path.display()), b"garbage").unwrap();
        let mut pager = Pager::open(&path).unwrap();
        assert!(pager.free_pages().is_empty());
        // Reclamation lost, allocation still sound: page 2 was freed
        // before ever reaching the disk, so the reopened file ends at
        // page 1 and allocation extends from there.
        assert_eq!(pager.allocate_page().unwrap(), 2);
    }

    #[test]
    fn out_of_range_page_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut pager = Pager::open(&db_path(&dir)).unwrap();
        pager.allocate_page().unwrap();
        assert!(matches!(pager.page(5), Err(Error::PageOutOfBounds(5))));
        assert!(matches!(
            pager.page(TABLE_MAX_PAGES),
            Err(Error::PageOutOfBounds(_))
        ));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);
        {
            let mut pager = Pager::open(&path).unwrap();
            let p = pager.allocate_page().unwrap();
            pager.page_mut(p).unwrap();
            pager.close().unwrap();
        }
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 7]).unwrap();
        assert!(Pager::open(&path).is_err());
    }
}
