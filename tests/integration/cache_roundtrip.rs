#![allow(missing_docs)]

use revstat::backend::testutil::StubBackend;
use revstat::{Backend, Cache, Options, Result, Revision};
use tempfile::tempdir;

fn opts_in(dir: &std::path::Path) -> Options {
    Options {
        cache_dir: dir.to_path_buf(),
        ..Options::default()
    }
}

#[test]
fn put_then_get_is_identity() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let backend = StubBackend::with_history(["A", "B", "C"]);
    let mut cache = Cache::new(Box::new(backend), opts_in(dir.path()));

    let rev = Revision::new(
        "A:B",
        1_200_000,
        "Someone",
        "a message\nwith two lines\n",
        revstat::Diffstat::new(),
    );
    assert!(!cache.lookup("A:B")?);
    cache.put("A:B", &rev)?;
    assert!(cache.lookup("A:B")?);
    let back = cache.get("A:B")?;
    assert_eq!(back, rev);
    Ok(())
}

#[test]
fn entries_survive_reopening_the_cache() -> Result<()> {
    let dir = tempdir().expect("tmpdir");

    let revision = {
        let backend = StubBackend::with_history(["A", "B"]);
        let mut cache = Cache::new(Box::new(backend), opts_in(dir.path()));
        let revision = cache.revision("A")?;
        cache.flush()?;
        revision
    };

    // A fresh instance over the same directory must serve the entry
    // without asking the backend.
    let backend = StubBackend::with_history(["A", "B"]);
    let counters = backend.counters();
    let mut cache = Cache::new(Box::new(backend), opts_in(dir.path()));
    assert!(cache.lookup("A")?);
    let back = cache.get("A")?;
    assert_eq!(back, revision);
    assert_eq!(counters.revision_calls(), 0);
    Ok(())
}

#[test]
fn revision_misses_populate_the_cache_on_the_hot_path() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let backend = StubBackend::with_history(["A", "B"]);
    let counters = backend.counters();
    let mut cache = Cache::new(Box::new(backend), opts_in(dir.path()));

    let first = cache.revision("A:B")?;
    assert_eq!(counters.revision_calls(), 1);
    let second = cache.revision("A:B")?;
    assert_eq!(counters.revision_calls(), 1, "second read must hit the cache");
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn prefetch_skips_cached_revisions() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let backend = StubBackend::with_history(["A", "B"]);
    let counters = backend.counters();
    let mut cache = Cache::new(Box::new(backend), opts_in(dir.path()));

    cache.revision("A")?;
    cache.prefetch(&["A".to_owned(), "A:B".to_owned()])?;
    assert_eq!(counters.prefetched(), vec!["A:B".to_owned()]);
    Ok(())
}

#[test]
fn shard_rollover_starts_a_new_file_after_the_cap() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let backend = StubBackend::with_history(["A"]);
    let mut cache = Cache::new(Box::new(backend), opts_in(dir.path()));

    // Random-ish payloads compress badly, pushing a shard over the
    // 4 MiB cap quickly.
    let mut state = 0x2545f491u64;
    let mut noise = String::new();
    for _ in 0..3_000_000 {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        noise.push(char::from(b'!' + (state % 90) as u8));
    }

    for i in 0..3 {
        let rev = Revision::new(
            format!("bulk-{i}"),
            i,
            "bulk",
            noise.clone(),
            revstat::Diffstat::new(),
        );
        cache.put(&format!("bulk-{i}"), &rev)?;
    }
    cache.flush()?;

    let uuid_dir = dir.path().join("stub-0000-repo");
    assert!(uuid_dir.join("cache.0").is_file());
    assert!(
        uuid_dir.join("cache.1").is_file(),
        "a put past the cap must allocate the next shard"
    );

    // Every entry is still readable after the rollover.
    for i in 0..3 {
        let back = cache.get(&format!("bulk-{i}"))?;
        assert_eq!(back.message(), noise);
    }
    Ok(())
}

#[test]
fn concurrent_open_of_the_same_cache_dir_is_refused() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let backend = StubBackend::with_history(["A"]);
    let mut cache = Cache::new(Box::new(backend), opts_in(dir.path()));
    cache.revision("A")?;

    // fcntl locks do not exclude the owning process, so exclusion is
    // exercised from a child process instead.
    #[cfg(unix)]
    {
        use std::process::Command;
        let lock_path = dir.path().join("stub-0000-repo").join("lock");
        let script = format!(
            "import fcntl, sys\nf = open({lock_path:?}, 'w')\ntry:\n    fcntl.lockf(f, fcntl.LOCK_EX | fcntl.LOCK_NB)\nexcept OSError:\n    sys.exit(42)\nsys.exit(0)\n"
        );
        let status = Command::new("python3").arg("-c").arg(&script).status();
        if let Ok(status) = status {
            assert_eq!(status.code(), Some(42), "the lock must be held");
        }
    }
    Ok(())
}
