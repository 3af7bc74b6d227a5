#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use flate2::write::GzEncoder;
use flate2::Compression;
use revstat::backend::testutil::StubBackend;
use revstat::{Backend, Cache, Error, Options, Result};
use tempfile::tempdir;

fn opts_in(dir: &std::path::Path) -> Options {
    Options {
        cache_dir: dir.to_path_buf(),
        ..Options::default()
    }
}

fn populated_cache(dir: &std::path::Path, ids: &[&str]) -> Result<()> {
    let backend = StubBackend::with_history(["A", "B", "C"]);
    let mut cache = Cache::new(Box::new(backend), opts_in(dir));
    for id in ids {
        cache.revision(id)?;
    }
    cache.flush()?;
    Ok(())
}

#[test]
fn clean_cache_reports_no_corruption() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    populated_cache(dir.path(), &["A", "A:B"])?;

    let backend = StubBackend::with_history(["A", "B", "C"]);
    let mut cache = Cache::new(Box::new(backend), opts_in(dir.path()));
    let corrupted = cache.check(false)?;
    assert!(corrupted.is_empty());
    Ok(())
}

#[test]
fn flipped_byte_is_detected_and_dropped_from_the_index() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    populated_cache(dir.path(), &["A", "A:B", "B:C"])?;
    let shard = dir.path().join("stub-0000-repo").join("cache.0");

    // Flip one byte in the middle of the first record's payload.
    {
        let mut file = OpenOptions::new().read(true).write(true).open(&shard)?;
        file.seek(SeekFrom::Start(10))?;
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte)?;
        byte[0] ^= 0xa5;
        file.seek(SeekFrom::Start(10))?;
        file.write_all(&byte)?;
    }
    let shard_bytes_before = std::fs::metadata(&shard)?.len();

    let backend = StubBackend::with_history(["A", "B", "C"]);
    let mut cache = Cache::new(Box::new(backend), opts_in(dir.path()));
    let corrupted = cache.check(false)?;
    assert_eq!(corrupted, vec!["A".to_owned()]);

    // The shard is left untouched; only the index shrank.
    assert_eq!(std::fs::metadata(&shard)?.len(), shard_bytes_before);
    assert!(!cache.lookup("A")?);
    assert!(cache.lookup("A:B")?);
    assert!(cache.lookup("B:C")?);
    Ok(())
}

#[test]
fn survivors_are_still_readable_after_an_index_rewrite() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    populated_cache(dir.path(), &["A", "A:B"])?;
    let shard = dir.path().join("stub-0000-repo").join("cache.0");

    {
        let mut file = OpenOptions::new().read(true).write(true).open(&shard)?;
        file.seek(SeekFrom::Start(8))?;
        file.write_all(&[0xff])?;
    }

    let backend = StubBackend::with_history(["A", "B", "C"]);
    let mut cache = Cache::new(Box::new(backend), opts_in(dir.path()));
    cache.check(false)?;
    let survivor = cache.get("A:B")?;
    assert_eq!(survivor.id(), "B");
    Ok(())
}

fn write_versioned_index(dir: &std::path::Path, version: u32) {
    let uuid_dir = dir.join("stub-0000-repo");
    std::fs::create_dir_all(&uuid_dir).expect("cache dir");
    let file = std::fs::File::create(uuid_dir.join("index")).expect("index");
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(&version.to_be_bytes()).expect("version");
    encoder.finish().expect("gzip");
}

#[test]
fn stale_version_is_fatal_at_load() {
    let dir = tempdir().expect("tmpdir");
    write_versioned_index(dir.path(), 2);

    // The stub reports the centralized backend's name so the gating
    // table treats version 2 as out of date.
    struct SvnNamed(StubBackend);
    impl Backend for SvnNamed {
        fn name(&self) -> &'static str {
            "svn"
        }
        fn uuid(&mut self) -> Result<String> {
            self.0.uuid()
        }
        fn head(&mut self, b: &str) -> Result<String> {
            self.0.head(b)
        }
        fn main_branch(&mut self) -> Result<String> {
            self.0.main_branch()
        }
        fn branches(&mut self) -> Result<Vec<String>> {
            self.0.branches()
        }
        fn tags(&mut self) -> Result<Vec<revstat::Tag>> {
            self.0.tags()
        }
        fn tree(&mut self, r: &str) -> Result<Vec<String>> {
            self.0.tree(r)
        }
        fn cat(&mut self, p: &str, r: &str) -> Result<Vec<u8>> {
            self.0.cat(p, r)
        }
        fn log_iterator(
            &mut self,
            b: &str,
            s: Option<i64>,
            e: Option<i64>,
        ) -> Result<revstat::LogIterator> {
            self.0.log_iterator(b, s, e)
        }
        fn revision(&mut self, id: &str) -> Result<revstat::Revision> {
            self.0.revision(id)
        }
        fn diffstat(&mut self, id: &str) -> Result<revstat::Diffstat> {
            self.0.diffstat(id)
        }
    }

    let backend = SvnNamed(StubBackend::with_history(["A"]));
    let mut cache = Cache::new(Box::new(backend), opts_in(dir.path()));
    let err = cache.lookup("A").unwrap_err();
    assert!(matches!(err, Error::OutOfDate(2)), "got {err:?}");
    assert!(err.is_version_mismatch());

    // A forced check clears the directory and leaves an empty cache.
    cache.check(true).unwrap();
    assert!(!dir
        .path()
        .join("stub-0000-repo")
        .join("index")
        .exists());
    assert!(!cache.lookup("A").unwrap());
}

#[test]
fn future_version_is_unknown() {
    let dir = tempdir().expect("tmpdir");
    write_versioned_index(dir.path(), 99);
    let backend = StubBackend::with_history(["A"]);
    let mut cache = Cache::new(Box::new(backend), opts_in(dir.path()));
    let err = cache.lookup("A").unwrap_err();
    assert!(matches!(err, Error::UnknownVersion(99)), "got {err:?}");
}

#[test]
fn unforced_check_leaves_a_stale_cache_alone() {
    let dir = tempdir().expect("tmpdir");
    write_versioned_index(dir.path(), 1);
    let backend = StubBackend::with_history(["A"]);
    let mut cache = Cache::new(Box::new(backend), opts_in(dir.path()));
    cache.check(false).unwrap();
    assert!(dir.path().join("stub-0000-repo").join("index").exists());
}
