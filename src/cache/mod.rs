//! On-disk revision cache, a decorator over any backend.
//!
//! The cache directory (one per repository UUID) holds a `lock` file,
//! a gzip-compressed `index`, and append-only shards `cache.0`,
//! `cache.1`, ... capped at 4 MiB each. Shards store length-prefixed
//! zlib-compressed revision records; the index maps revision IDs to
//! `(shard, offset)` plus a CRC32 of the compressed block that the
//! `check` pass verifies. Every write happens inside a signal-deferral
//! scope so an interrupt cannot tear a record in half.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::backend::{Backend, LogIterator};
use crate::bstream::{BinReader, BinWriter};
use crate::config::Options;
use crate::diff::Diffstat;
use crate::error::{Error, Result};
use crate::revision::Revision;
use crate::sigblock::{self, SignalDeferral};
use crate::tag::Tag;

mod lock;

use lock::CacheLock;

/// Version of the on-disk format written by this crate.
pub const CACHE_VERSION: u32 = 5;

/// Size cap per shard, checked before each write.
const MAX_SHARD_SIZE: u64 = 4_194_304;

#[derive(Clone, Copy)]
struct IndexEntry {
    shard: u32,
    offset: u32,
}

/// Open file state shared with the deferred-signal flush hook.
#[derive(Default)]
struct CacheFiles {
    dir: PathBuf,
    index: FxHashMap<String, IndexEntry>,
    iout: Option<BinWriter>,
    cout: Option<BinWriter>,
    cout_shard: u32,
    cin: Option<BinReader>,
    cin_shard: u32,
    lock: Option<CacheLock>,
}

enum VersionCheck {
    Current,
    OutOfDate,
    Unknown,
}

/// Revision cache wrapping a backend; to the iterator it is just
/// another backend.
pub struct Cache {
    backend: Box<dyn Backend>,
    opts: Options,
    files: Arc<Mutex<CacheFiles>>,
    loaded: bool,
    uuid: Option<String>,
}

impl Cache {
    /// Wraps `backend`. Nothing touches the disk until the first
    /// lookup or write.
    pub fn new(backend: Box<dyn Backend>, opts: Options) -> Self {
        Self {
            backend,
            opts,
            files: Arc::new(Mutex::new(CacheFiles::default())),
            loaded: false,
            uuid: None,
        }
    }

    fn repo_uuid(&mut self) -> Result<String> {
        if let Some(uuid) = &self.uuid {
            return Ok(uuid.clone());
        }
        let uuid = self.backend.uuid()?;
        self.uuid = Some(uuid.clone());
        Ok(uuid)
    }

    fn cache_dir(&mut self) -> Result<PathBuf> {
        let uuid = self.repo_uuid()?;
        Ok(self.opts.cache_dir.join(uuid))
    }

    /// True if the revision is already cached.
    pub fn lookup(&mut self, id: &str) -> Result<bool> {
        self.ensure_loaded()?;
        Ok(self.files.lock().index.contains_key(id))
    }

    /// Writes one revision to the current shard and appends its index
    /// entry. Signals are deferred for the duration of the write.
    pub fn put(&mut self, id: &str, revision: &Revision) -> Result<()> {
        self.ensure_loaded()?;
        let _guard = SignalDeferral::new();
        let mut files = self.files.lock();
        let dir = files.dir.clone();

        // Pick the output shard: the lowest-numbered one below the
        // size cap, or the next free number.
        if files.cout.is_none() {
            let mut shard = 0u32;
            loop {
                let path = shard_path(&dir, shard);
                match fs::metadata(&path) {
                    Ok(meta) if meta.len() >= MAX_SHARD_SIZE => shard += 1,
                    _ => break,
                }
            }
            files.cout = Some(BinWriter::file(shard_path(&dir, shard), true)?);
            files.cout_shard = shard;
        } else if files.cout.as_ref().is_some_and(|w| w.tell() >= MAX_SHARD_SIZE) {
            if let Some(mut done) = files.cout.take() {
                done.flush()?;
            }
            let shard = files.cout_shard + 1;
            files.cout = Some(BinWriter::file(shard_path(&dir, shard), true)?);
            files.cout_shard = shard;
        }

        let shard = files.cout_shard;
        let out = files.cout.as_mut().expect("shard writer is open");
        let offset = out.tell() as u32;

        let mut record = BinWriter::memory();
        revision.encode(&mut record);
        let compressed = compress(&record.into_data())?;
        out.write_bytes(&compressed);
        if !out.ok() {
            return Err(Error::Corruption(format!(
                "unable to write to cache file: {}",
                shard_path(&dir, shard).display()
            )));
        }

        if files.iout.is_none() {
            let path = dir.join("index");
            files.iout = Some(if path.exists() {
                BinWriter::gzip(&path, true)?
            } else {
                let mut out = BinWriter::gzip(&path, false)?;
                out.write_u32(CACHE_VERSION);
                out
            });
        }
        let iout = files.iout.as_mut().expect("index writer is open");
        iout.write_string(id);
        iout.write_u32(shard);
        iout.write_u32(offset);
        iout.write_u32(crc32fast::hash(&compressed));
        if !iout.ok() {
            return Err(Error::Corruption(format!(
                "unable to write to cache index: {}",
                dir.join("index").display()
            )));
        }

        files.index.insert(id.to_owned(), IndexEntry { shard, offset });
        Ok(())
    }

    /// Reconstitutes a cached revision. Any deviation from the stored
    /// format is a hard error.
    pub fn get(&mut self, id: &str) -> Result<Revision> {
        self.ensure_loaded()?;
        let mut files = self.files.lock();
        let entry = *files
            .index
            .get(id)
            .ok_or_else(|| Error::Corruption(format!("revision {id} is not in the cache index")))?;
        let path = shard_path(&files.dir, entry.shard);
        let unreadable = || Error::Corruption(format!("unable to read from cache file: {}", path.display()));

        if files.cin.is_none() || files.cin_shard != entry.shard {
            files.cin = Some(BinReader::file(&path).map_err(|_| unreadable())?);
            files.cin_shard = entry.shard;
        }
        let input = files.cin.as_mut().expect("shard reader is open");
        if !input.seek(entry.offset as u64) {
            return Err(unreadable());
        }
        let compressed = input.read_bytes();
        if compressed.is_empty() || !input.ok() {
            return Err(unreadable());
        }
        let data = uncompress(&compressed).map_err(|_| unreadable())?;
        let mut record = BinReader::memory(data);
        Revision::decode(&mut record, id).ok_or_else(unreadable)
    }

    /// Closes open streams; they reopen lazily on the next access.
    /// Also invoked by the signal flush hook.
    pub fn flush(&mut self) -> Result<()> {
        close_streams(&mut self.files.lock())
    }

    /// Removes every file in the cache directory.
    pub fn clear(&mut self) -> Result<()> {
        let dir = self.cache_dir()?;
        let mut files = self.files.lock();
        close_streams(&mut files)?;
        files.index.clear();
        if !dir.is_dir() {
            return Ok(());
        }
        debug!(dir = %dir.display(), "clearing cache");
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() {
                trace!(path = %path.display(), "unlinking");
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Verifies every indexed entry against its shard and CRC, then
    /// rewrites the index without the corrupted ones. On a version
    /// mismatch the cache is cleared only when `force` is set.
    pub fn check(&mut self, force: bool) -> Result<Vec<String>> {
        let dir = self.cache_dir()?;
        debug!(dir = %dir.display(), "checking cache");
        let created = ensure_dir(&dir)?;
        self.acquire_lock(&dir)?;
        self.install_flush_hook();
        if created {
            info!("created an empty cache");
            return Ok(Vec::new());
        }

        let mut input = match BinReader::gzip(dir.join("index")) {
            Ok(input) => input,
            Err(_) => {
                info!("cache is empty, nothing to check");
                return Ok(Vec::new());
            }
        };
        let version = input.read_u32();
        if input.eof() || !input.ok() {
            info!("cache is empty, nothing to check");
            return Ok(Vec::new());
        }
        match self.check_version(version) {
            VersionCheck::Current => {}
            VersionCheck::OutOfDate | VersionCheck::Unknown => {
                if force {
                    warn!(version, "cache version mismatch, clearing");
                    drop(input);
                    self.clear()?;
                } else {
                    warn!(version, "cache version mismatch - won't clear it until forced to do so");
                }
                return Ok(Vec::new());
            }
        }

        let mut surviving: BTreeMap<String, (IndexEntry, u32)> = BTreeMap::new();
        let mut corrupted: Vec<String> = Vec::new();
        let mut shard_in: Option<BinReader> = None;
        let mut shard_no = u32::MAX;

        loop {
            let id = input.read_string();
            if input.eof() || id.is_empty() {
                break;
            }
            let entry = IndexEntry {
                shard: input.read_u32(),
                offset: input.read_u32(),
            };
            let crc = input.read_u32();
            if input.eof() || !input.ok() {
                // Truncated mid-record; the tail of the index is gone.
                corrupted.push(id);
                break;
            }

            let ok = verify_entry(&dir, &mut shard_in, &mut shard_no, &entry, crc);
            if ok {
                trace!(id = %id, "revision ok");
                surviving.insert(id, (entry, crc));
            } else {
                warn!(id = %id, "revision is corrupted, removing from index file");
                surviving.remove(&id);
                corrupted.push(id);
            }
        }

        // A corrupted record disqualifies its ID even when a duplicate
        // entry for the same ID verified fine.
        for id in &corrupted {
            surviving.remove(id);
        }

        info!(
            checked = surviving.len() + corrupted.len(),
            corrupted = corrupted.len(),
            "cache check finished"
        );
        if corrupted.is_empty() {
            return Ok(corrupted);
        }

        // Rewrite the index without the corrupted entries, atomically.
        {
            let _guard = SignalDeferral::new();
            let tmp = tempfile::NamedTempFile::new_in(&dir)?;
            {
                let mut out = BinWriter::gzip(tmp.path(), false)?;
                out.write_u32(CACHE_VERSION);
                for (id, (entry, crc)) in &surviving {
                    out.write_string(id);
                    out.write_u32(entry.shard);
                    out.write_u32(entry.offset);
                    out.write_u32(*crc);
                }
                out.flush()?;
                if !out.ok() {
                    return Err(Error::Corruption(
                        "unable to rewrite the cache index".into(),
                    ));
                }
            }
            tmp.persist(dir.join("index"))
                .map_err(|e| Error::Io(e.error))?;
        }

        // Refresh the in-memory view to match the rewritten file.
        let mut files = self.files.lock();
        files.iout = None;
        files.index = surviving
            .into_iter()
            .map(|(id, (entry, _))| (id, entry))
            .collect();
        files.dir = dir;
        drop(files);
        self.loaded = true;
        Ok(corrupted)
    }

    fn ensure_loaded(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        self.load()
    }

    fn acquire_lock(&mut self, dir: &Path) -> Result<()> {
        let mut files = self.files.lock();
        if files.lock.is_some() {
            trace!("cache already locked");
            return Ok(());
        }
        files.lock = Some(CacheLock::acquire(dir.join("lock"))?);
        Ok(())
    }

    // Reads the index into memory. CRCs are ignored here; they exist
    // for the check pass.
    fn load(&mut self) -> Result<()> {
        let dir = self.cache_dir()?;
        debug!(dir = %dir.display(), "using cache dir");

        let created = ensure_dir(&dir)?;
        self.acquire_lock(&dir)?;
        self.install_flush_hook();
        {
            let mut files = self.files.lock();
            files.index.clear();
            files.dir = dir.clone();
        }
        self.loaded = true;
        if created {
            return Ok(());
        }

        let mut input = match BinReader::gzip(dir.join("index")) {
            Ok(input) => input,
            Err(_) => {
                info!("empty cache for this repository");
                return Ok(());
            }
        };
        let version = input.read_u32();
        if input.eof() || !input.ok() {
            info!("empty cache for this repository");
            return Ok(());
        }
        match self.check_version(version) {
            VersionCheck::Current => {}
            VersionCheck::OutOfDate => return Err(Error::OutOfDate(version)),
            VersionCheck::Unknown => return Err(Error::UnknownVersion(version)),
        }

        let mut files = self.files.lock();
        loop {
            let id = input.read_string();
            if input.eof() || id.is_empty() {
                break;
            }
            let entry = IndexEntry {
                shard: input.read_u32(),
                offset: input.read_u32(),
            };
            let _crc = input.read_u32();
            if input.eof() {
                break;
            }
            // Later records win over earlier ones for the same ID.
            files.index.insert(id, entry);
        }
        info!(revisions = files.index.len(), "cache index loaded");
        Ok(())
    }

    fn check_version(&self, version: u32) -> VersionCheck {
        if version == 0 {
            return VersionCheck::Unknown;
        }
        if version <= 1 {
            // Early formats carried flawed diffstats for every backend.
            return VersionCheck::OutOfDate;
        }
        if version <= 2 && self.backend.name() == "svn" {
            // Invalid diffstats for deleted files.
            return VersionCheck::OutOfDate;
        }
        if version <= 4 && self.backend.name() == "git" {
            // Invalid commit times.
            return VersionCheck::OutOfDate;
        }
        if version <= CACHE_VERSION {
            VersionCheck::Current
        } else {
            VersionCheck::Unknown
        }
    }

    fn install_flush_hook(&self) {
        sigblock::install();
        let files = Arc::clone(&self.files);
        sigblock::set_flush_hook(Box::new(move || {
            let _ = close_streams(&mut files.lock());
        }));
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if self.flush().is_err() {
            warn!("unable to flush the cache on close");
        }
        sigblock::clear_flush_hook();
        // Dropping the lock guard releases the directory.
        self.files.lock().lock = None;
    }
}

impl Backend for Cache {
    fn name(&self) -> &'static str {
        self.backend.name()
    }

    fn uuid(&mut self) -> Result<String> {
        self.repo_uuid()
    }

    fn head(&mut self, branch: &str) -> Result<String> {
        self.backend.head(branch)
    }

    fn main_branch(&mut self) -> Result<String> {
        self.backend.main_branch()
    }

    fn branches(&mut self) -> Result<Vec<String>> {
        self.backend.branches()
    }

    fn tags(&mut self) -> Result<Vec<Tag>> {
        self.backend.tags()
    }

    fn tree(&mut self, revision: &str) -> Result<Vec<String>> {
        self.backend.tree(revision)
    }

    fn cat(&mut self, path: &str, revision: &str) -> Result<Vec<u8>> {
        self.backend.cat(path, revision)
    }

    fn log_iterator(
        &mut self,
        branch: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<LogIterator> {
        self.backend.log_iterator(branch, start, end)
    }

    fn revision(&mut self, id: &str) -> Result<Revision> {
        if !self.lookup(id)? {
            trace!(id, "cache miss");
            let revision = self.backend.revision(id)?;
            self.put(id, &revision)?;
            return Ok(revision);
        }
        trace!(id, "cache hit");
        self.get(id)
    }

    fn diffstat(&mut self, id: &str) -> Result<Diffstat> {
        if !self.lookup(id)? {
            trace!(id, "cache miss");
            return self.backend.diffstat(id);
        }
        trace!(id, "cache hit");
        Ok(self.get(id)?.diffstat().clone())
    }

    // Only revisions the cache cannot serve are worth the backend's
    // worker time.
    fn prefetch(&mut self, ids: &[String]) -> Result<()> {
        let mut missing = Vec::new();
        for id in ids {
            if !self.lookup(id)? {
                missing.push(id.clone());
            }
        }
        debug!(
            cached = ids.len() - missing.len(),
            missing = missing.len(),
            "prefetch filtered through the cache"
        );
        if !missing.is_empty() {
            self.backend.prefetch(&missing)?;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.backend.finalize()
    }
}

fn shard_path(dir: &Path, shard: u32) -> PathBuf {
    dir.join(format!("cache.{shard}"))
}

fn ensure_dir(dir: &Path) -> Result<bool> {
    if dir.is_dir() {
        return Ok(false);
    }
    fs::create_dir_all(dir)
        .map_err(|e| Error::Corruption(format!("unable to create cache directory: {e}")))?;
    debug!(dir = %dir.display(), "created cache directory");
    Ok(true)
}

fn close_streams(files: &mut CacheFiles) -> Result<()> {
    trace!("flushing cache");
    if let Some(mut out) = files.iout.take() {
        out.flush()?;
    }
    if let Some(mut out) = files.cout.take() {
        out.flush()?;
    }
    files.cin = None;
    trace!("cache flushed");
    Ok(())
}

fn verify_entry(
    dir: &Path,
    shard_in: &mut Option<BinReader>,
    shard_no: &mut u32,
    entry: &IndexEntry,
    crc: u32,
) -> bool {
    if shard_in.is_none() || *shard_no != entry.shard {
        *shard_in = BinReader::file(shard_path(dir, entry.shard)).ok();
        *shard_no = entry.shard;
    }
    let Some(input) = shard_in.as_mut() else {
        return false;
    };
    if !input.seek(entry.offset as u64) {
        return false;
    }
    let data = input.read_bytes();
    if data.is_empty() || !input.ok() || input.eof() {
        return false;
    }
    crc32fast::hash(&data) == crc
}

fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(9));
    encoder.write_all(data)?;
    encoder.finish()
}

fn uncompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
