//! In-memory backend for exercising the pipeline without repository
//! tooling. Used by the crate's own tests; kept out of the docs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Backend, LogIterator};
use crate::diff::{Diffstat, FileStat};
use crate::error::{Error, Result};
use crate::revision::Revision;
use crate::tag::Tag;

/// Shared call counters surviving a move of the backend into a cache.
#[derive(Clone, Default)]
pub struct StubCounters {
    revision_calls: Arc<AtomicUsize>,
    diffstat_calls: Arc<AtomicUsize>,
    prefetched: Arc<Mutex<Vec<String>>>,
}

impl StubCounters {
    /// Number of `revision()` calls that reached the stub.
    pub fn revision_calls(&self) -> usize {
        self.revision_calls.load(Ordering::SeqCst)
    }

    /// Number of `diffstat()` calls that reached the stub.
    pub fn diffstat_calls(&self) -> usize {
        self.diffstat_calls.load(Ordering::SeqCst)
    }

    /// Every ID handed to `prefetch`, in order.
    pub fn prefetched(&self) -> Vec<String> {
        self.prefetched.lock().clone()
    }
}

/// Deterministic linear-history backend.
#[derive(Default)]
pub struct StubBackend {
    history: Vec<String>,
    revisions: BTreeMap<String, Revision>,
    counters: StubCounters,
    fail_revision: Option<String>,
}

impl StubBackend {
    /// Builds a linear history from bare IDs; the second through last
    /// become `parent:child` log entries like a real distributed log.
    pub fn with_history<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bare: Vec<String> = ids.into_iter().map(Into::into).collect();
        let mut log = bare.clone();
        for i in (1..log.len()).rev() {
            log[i] = format!("{}:{}", log[i - 1], log[i]);
        }
        let mut revisions = BTreeMap::new();
        for (i, full) in log.iter().enumerate() {
            let mut stat = Diffstat::new();
            stat.record(
                format!("src/file-{i}.txt"),
                FileStat {
                    bytes_added: 10 * (i as u64 + 1),
                    lines_added: i as u64 + 1,
                    bytes_removed: 2 * i as u64,
                    lines_removed: i as u64,
                },
            );
            let revision = Revision::new(
                full.clone(),
                1_000_000 + 86_400 * i as i64,
                format!("Author {i}"),
                format!("commit {i}\n"),
                stat,
            );
            revisions.insert(full.clone(), revision);
        }
        Self {
            history: log,
            revisions,
            counters: StubCounters::default(),
            fail_revision: None,
        }
    }

    /// Clone of the shared counters.
    pub fn counters(&self) -> StubCounters {
        self.counters.clone()
    }

    /// IDs handed to `prefetch` so far.
    pub fn prefetched(&self) -> Vec<String> {
        self.counters.prefetched()
    }

    /// Makes `revision()` and `diffstat()` fail for one ID.
    pub fn fail_on(&mut self, id: impl Into<String>) {
        self.fail_revision = Some(id.into());
    }
}

impl Backend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn uuid(&mut self) -> Result<String> {
        Ok("stub-0000-repo".to_owned())
    }

    fn head(&mut self, _branch: &str) -> Result<String> {
        self.history
            .last()
            .map(|id| crate::revision::child_id(id).to_owned())
            .ok_or_else(|| Error::Backend("empty history".into()))
    }

    fn main_branch(&mut self) -> Result<String> {
        Ok("main".to_owned())
    }

    fn branches(&mut self) -> Result<Vec<String>> {
        Ok(vec!["main".to_owned()])
    }

    fn tags(&mut self) -> Result<Vec<Tag>> {
        Ok(Vec::new())
    }

    fn tree(&mut self, _revision: &str) -> Result<Vec<String>> {
        Ok((0..self.history.len())
            .map(|i| format!("src/file-{i}.txt"))
            .collect())
    }

    fn cat(&mut self, path: &str, revision: &str) -> Result<Vec<u8>> {
        Ok(format!("{path}@{revision}\n").into_bytes())
    }

    fn log_iterator(
        &mut self,
        _branch: &str,
        _start: Option<i64>,
        _end: Option<i64>,
    ) -> Result<LogIterator> {
        Ok(LogIterator::from_ids(self.history.clone()))
    }

    fn revision(&mut self, id: &str) -> Result<Revision> {
        self.counters.revision_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_revision.as_deref() == Some(id) {
            return Err(Error::Backend(format!("injected failure for {id}")));
        }
        self.revisions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("unknown revision {id}")))
    }

    fn diffstat(&mut self, id: &str) -> Result<Diffstat> {
        self.counters.diffstat_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_revision.as_deref() == Some(id) {
            return Err(Error::Backend(format!("injected failure for {id}")));
        }
        self.revisions
            .get(id)
            .map(|rev| rev.diffstat().clone())
            .ok_or_else(|| Error::Backend(format!("unknown revision {id}")))
    }

    fn prefetch(&mut self, ids: &[String]) -> Result<()> {
        self.counters.prefetched.lock().extend(ids.iter().cloned());
        Ok(())
    }
}
