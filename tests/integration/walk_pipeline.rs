#![allow(missing_docs)]

use revstat::backend::testutil::StubBackend;
use revstat::{Backend, Cache, Options, Repository, Result, SignalDeferral};
use tempfile::tempdir;

fn opts_in(dir: &std::path::Path) -> Options {
    Options {
        cache_dir: dir.to_path_buf(),
        ..Options::default()
    }
}

#[test]
fn clean_walk_populates_the_cache_and_reruns_stay_offline() -> Result<()> {
    let dir = tempdir().expect("tmpdir");

    // First walk over two linear commits with no prior cache.
    let backend = StubBackend::with_history(["A", "B"]);
    let first_counters = backend.counters();
    {
        let mut repo =
            Repository::with_backend(Box::new(backend), opts_in(dir.path()));
        let mut seen = Vec::new();
        repo.walk(None, None, None, |rev| {
            seen.push((rev.id().to_owned(), rev.parent_id().map(str::to_owned)));
            Ok(())
        })?;
        assert_eq!(
            seen,
            vec![
                ("A".to_owned(), None),
                ("B".to_owned(), Some("A".to_owned()))
            ]
        );
    }
    assert_eq!(first_counters.revision_calls(), 2);

    // The cache directory now holds both revisions: the shard carries
    // exactly two length-prefixed blocks.
    let shard = dir.path().join("stub-0000-repo").join("cache.0");
    let bytes = std::fs::read(&shard)?;
    let mut blocks = 0;
    let mut pos = 0usize;
    while pos + 4 <= bytes.len() {
        let len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4 + len;
        blocks += 1;
    }
    assert_eq!(pos, bytes.len(), "trailing garbage in the shard");
    assert_eq!(blocks, 2);

    // Re-running the walk with the same cache must not invoke the
    // backend's revision or diffstat fetching at all.
    let backend = StubBackend::with_history(["A", "B"]);
    let second_counters = backend.counters();
    {
        let mut repo =
            Repository::with_backend(Box::new(backend), opts_in(dir.path()));
        let mut count = 0;
        repo.walk(None, None, None, |_| {
            count += 1;
            Ok(())
        })?;
        assert_eq!(count, 2);
    }
    assert_eq!(second_counters.revision_calls(), 0);
    assert_eq!(second_counters.diffstat_calls(), 0);
    assert!(second_counters.prefetched().is_empty());
    Ok(())
}

#[test]
fn cached_and_live_revisions_are_identical() -> Result<()> {
    let dir = tempdir().expect("tmpdir");

    let backend = StubBackend::with_history(["A", "B", "C"]);
    let mut live = Vec::new();
    {
        let mut repo =
            Repository::with_backend(Box::new(backend), opts_in(dir.path()));
        repo.walk(None, None, None, |rev| {
            live.push(rev.clone());
            Ok(())
        })?;
    }

    let backend = StubBackend::with_history(["A", "B", "C"]);
    let mut cached = Vec::new();
    {
        let mut repo =
            Repository::with_backend(Box::new(backend), opts_in(dir.path()));
        repo.walk(None, None, None, |rev| {
            cached.push(rev.clone());
            Ok(())
        })?;
    }
    assert_eq!(live, cached);
    Ok(())
}

#[test]
fn walk_without_cache_goes_straight_to_the_backend() -> Result<()> {
    let backend = StubBackend::with_history(["A", "B"]);
    let counters = backend.counters();
    let opts = Options {
        use_cache: false,
        ..Options::default()
    };
    let mut repo = Repository::with_backend(Box::new(backend), opts);
    repo.walk(None, None, None, |_| Ok(()))?;
    repo.walk(None, None, None, |_| Ok(()))?;
    assert_eq!(counters.revision_calls(), 4);
    Ok(())
}

// Writes complete even when a termination signal arrives mid-put: the
// deferral scope holds it back, so a restart finds a consistent cache.
#[test]
fn deferred_writes_leave_a_consistent_cache() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    {
        let backend = StubBackend::with_history(["A", "B"]);
        let mut cache = Cache::new(Box::new(backend), opts_in(dir.path()));
        let guard = SignalDeferral::new();
        cache.revision("A")?;
        cache.revision("A:B")?;
        drop(guard);
        cache.flush()?;
    }

    let backend = StubBackend::with_history(["A", "B"]);
    let mut cache = Cache::new(Box::new(backend), opts_in(dir.path()));
    assert!(cache.check(false)?.is_empty());
    assert!(cache.lookup("A")?);
    assert!(cache.lookup("A:B")?);
    Ok(())
}
