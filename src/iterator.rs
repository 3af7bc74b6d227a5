//! Consumer side of the revision pipeline.
//!
//! The iterator couples the asynchronous log producer with prefetched
//! result consumption: every refill hands the fresh IDs to the backend
//! for background fetching before the consumer sees them, so by the
//! time a revision is materialized its data is usually already sitting
//! in a result queue.

use std::collections::VecDeque;

use tracing::trace;

use crate::backend::{Backend, LogIterator};
use crate::error::Result;
use crate::revision::Revision;

/// Whether a walk schedules upcoming revisions on the prefetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrefetchMode {
    /// Hand fresh log IDs to the backend's worker pools (the default).
    #[default]
    PrefetchRevisions,
    /// Fetch every revision synchronously on demand.
    NoPrefetch,
}

/// Streaming iterator over the revisions of one branch.
pub struct RevisionIterator<'a> {
    backend: &'a mut dyn Backend,
    log: LogIterator,
    queue: VecDeque<String>,
    total: usize,
    consumed: usize,
    mode: PrefetchMode,
}

impl<'a> RevisionIterator<'a> {
    /// Starts a walk over `branch` bounded by optional epoch
    /// timestamps.
    pub fn new(
        backend: &'a mut dyn Backend,
        branch: &str,
        start: Option<i64>,
        end: Option<i64>,
        mode: PrefetchMode,
    ) -> Result<Self> {
        let log = backend.log_iterator(branch, start, end)?;
        Ok(Self {
            backend,
            log,
            queue: VecDeque::new(),
            total: 0,
            consumed: 0,
            mode,
        })
    }

    /// True once every produced ID has been consumed.
    pub fn at_end(&mut self) -> bool {
        if self.total == 0 {
            // Iteration has just started and it is unknown whether
            // there are any revisions at all.
            self.fetch_logs();
        }
        self.queue.is_empty()
    }

    /// The next revision ID, or `None` at the end of the walk.
    pub fn next_id(&mut self) -> Option<String> {
        if self.at_end() {
            return None;
        }
        if self.queue.len() <= 1 {
            self.fetch_logs();
        }
        let id = self.queue.pop_front()?;
        self.consumed += 1;
        trace!(id = %id, "iterator advanced");
        Some(id)
    }

    /// Materializes the next revision through the backend (and its
    /// cache/prefetcher fast paths). Log-producer failures surface
    /// here once the stream has drained.
    pub fn next_revision(&mut self) -> Result<Option<Revision>> {
        match self.next_id() {
            Some(id) => self.backend.revision(&id).map(Some),
            None => match self.log.take_error() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    /// Percentage of observed revisions consumed; 0 while the log
    /// producer is still running.
    pub fn progress(&self) -> u32 {
        if self.log.running() || self.total == 0 {
            return 0;
        }
        (self.consumed * 100 / self.total) as u32
    }

    fn fetch_logs(&mut self) {
        let mut fresh = VecDeque::new();
        if !self.log.next_ids(&mut fresh) {
            return;
        }
        self.total += fresh.len();
        let ids: Vec<String> = fresh.iter().cloned().collect();
        self.queue.append(&mut fresh);
        if self.mode == PrefetchMode::PrefetchRevisions {
            if let Err(err) = self.backend.prefetch(&ids) {
                trace!(%err, "prefetch scheduling failed");
            }
        }
    }
}
