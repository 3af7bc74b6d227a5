//! Background fetching of revision data ahead of consumer demand.
//!
//! Two pools share two keyed queues: diffstat workers each own a
//! long-lived connection to the repository tooling and work one
//! revision at a time; metadata workers batch requests where the
//! backend supports it. The split keeps heavy diff computation from
//! serializing behind cheap metadata batches and vice versa.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::diff::Diffstat;
use crate::jobqueue::JobQueue;
use crate::revision::child_id;

/// Commit metadata delivered by the metadata pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionMeta {
    /// Seconds since the epoch, committer-local.
    pub date: i64,
    /// Author display name, email stripped.
    pub author: String,
    /// Message body.
    pub message: String,
}

/// Backend-specific worker bodies. Each call owns one worker thread for
/// the lifetime of the queue and must loop on `get_arg`/`get_args`
/// until the queue stops.
pub trait PrefetchWorkers: Send + Sync + 'static {
    /// Long-lived diffstat worker.
    fn diffstat_worker(&self, jobs: &JobQueue<String, Diffstat>);
    /// Metadata worker; keys are always bare child IDs.
    fn metadata_worker(&self, jobs: &JobQueue<String, RevisionMeta>);
}

/// The thread-pool subsystem computing future revisions in the
/// background.
pub struct Prefetcher {
    diff_queue: Arc<JobQueue<String, Diffstat>>,
    meta_queue: Arc<JobQueue<String, RevisionMeta>>,
    threads: Vec<JoinHandle<()>>,
}

const META_QUEUE_BOUND: usize = 4096;
const MAX_META_WORKERS: usize = 4;

impl Prefetcher {
    /// Starts `workers` pools: `n` diffstat workers and `min(n, 4)`
    /// metadata workers. `n = None` derives a count from the available
    /// parallelism.
    pub fn start(workers: Arc<dyn PrefetchWorkers>, n: Option<usize>) -> Self {
        let n = n.unwrap_or_else(default_pool_size).max(1);
        let diff_queue: Arc<JobQueue<String, Diffstat>> = Arc::new(JobQueue::default());
        let meta_queue: Arc<JobQueue<String, RevisionMeta>> =
            Arc::new(JobQueue::new(META_QUEUE_BOUND));

        let mut threads = Vec::new();
        for i in 0..n {
            let workers = Arc::clone(&workers);
            let queue = Arc::clone(&diff_queue);
            let handle = thread::Builder::new()
                .name(format!("revstat-diff-{i}"))
                .spawn(move || workers.diffstat_worker(&queue))
                .expect("spawning a diffstat worker");
            threads.push(handle);
        }

        let meta_workers = n.min(MAX_META_WORKERS);
        for i in 0..meta_workers {
            let workers = Arc::clone(&workers);
            let queue = Arc::clone(&meta_queue);
            let handle = thread::Builder::new()
                .name(format!("revstat-meta-{i}"))
                .spawn(move || workers.metadata_worker(&queue))
                .expect("spawning a metadata worker");
            threads.push(handle);
        }

        info!(
            diffstat_workers = n,
            metadata_workers = meta_workers,
            "prefetcher started"
        );
        Self {
            diff_queue,
            meta_queue,
            threads,
        }
    }

    /// Schedules IDs on both queues. The metadata queue only ever sees
    /// bare child IDs.
    pub fn prefetch(&self, ids: &[String]) {
        self.diff_queue.put(ids.iter().cloned());
        self.meta_queue
            .put(ids.iter().map(|id| child_id(id).to_owned()));
        debug!(count = ids.len(), "scheduled revisions for prefetching");
    }

    /// Blocks for the diffstat of `id`; `None` if the job failed or the
    /// pools were stopped.
    pub fn get_diffstat(&self, id: &str) -> Option<Diffstat> {
        self.diff_queue.get_result(&id.to_owned())
    }

    /// Blocks for the metadata of `id` (the child part is looked up).
    pub fn get_meta(&self, id: &str) -> Option<RevisionMeta> {
        self.meta_queue.get_result(&child_id(id).to_owned())
    }

    /// Fast path probe: will the diffstat pool deliver this ID?
    pub fn will_fetch_diffstat(&self, id: &str) -> bool {
        self.diff_queue.has_arg(&id.to_owned())
    }

    /// Fast path probe: will the metadata pool deliver this ID?
    pub fn will_fetch_meta(&self, id: &str) -> bool {
        self.meta_queue.has_arg(&child_id(id).to_owned())
    }

    /// Wakes every worker and consumer with a cancel indication.
    pub fn stop(&self) {
        self.diff_queue.stop();
        self.meta_queue.stop();
    }

    /// True once the pools have been told to stop; a `None` result then
    /// means cancellation, not failure.
    pub fn is_stopped(&self) -> bool {
        self.diff_queue.stopped()
    }

    /// Joins the worker threads. Call after [`Self::stop`].
    pub fn wait(&mut self) {
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("prefetch worker panicked");
            }
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

fn default_pool_size() -> usize {
    let cores = thread::available_parallelism().map_or(1, |n| n.get());
    (cores / 2).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::FileStat;

    struct CountingWorkers;

    impl PrefetchWorkers for CountingWorkers {
        fn diffstat_worker(&self, jobs: &JobQueue<String, Diffstat>) {
            while let Some(id) = jobs.get_arg() {
                if id == "bad" {
                    jobs.failed(id);
                    continue;
                }
                let mut stat = Diffstat::new();
                stat.record(
                    format!("file-{id}"),
                    FileStat {
                        lines_added: 1,
                        ..FileStat::default()
                    },
                );
                jobs.done(id, stat);
            }
        }

        fn metadata_worker(&self, jobs: &JobQueue<String, RevisionMeta>) {
            while let Some(batch) = jobs.get_args(64) {
                for id in batch {
                    let meta = RevisionMeta {
                        date: 100,
                        author: format!("author of {id}"),
                        message: String::new(),
                    };
                    jobs.done(id, meta);
                }
            }
        }
    }

    #[test]
    fn results_are_keyed_not_ordered() {
        let mut prefetcher = Prefetcher::start(Arc::new(CountingWorkers), Some(3));
        let ids: Vec<String> = vec!["p:c".into(), "a".into(), "bad".into()];
        prefetcher.prefetch(&ids);

        assert!(prefetcher.will_fetch_diffstat("a"));
        assert!(prefetcher.will_fetch_meta("p:c"));

        let stat = prefetcher.get_diffstat("p:c").expect("diffstat for p:c");
        assert_eq!(stat.lines_added("file-p:c"), 1);
        assert!(prefetcher.get_diffstat("bad").is_none());
        // Metadata is keyed by the child part of a composite ID.
        let meta = prefetcher.get_meta("p:c").expect("meta for c");
        assert_eq!(meta.author, "author of c");

        prefetcher.stop();
        prefetcher.wait();
        assert!(prefetcher.get_diffstat("a").is_none());
    }
}
