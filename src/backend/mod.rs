//! Repository backends and the log producer they feed.
//!
//! A [`Backend`] is the capability set shared by the concrete adapters
//! and by the cache decorator: repository introspection, a log
//! producer, per-revision metadata and diffstats, and prefetch
//! scheduling. Both adapters drive external tooling; the subprocess
//! helpers here turn non-zero exits into typed errors.

use std::collections::VecDeque;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::Options;
use crate::diff::Diffstat;
use crate::error::{Error, Result};
use crate::revision::Revision;
use crate::tag::Tag;

pub mod git;
pub mod svn;
#[doc(hidden)]
pub mod testutil;

pub use git::GitBackend;
pub use svn::SvnBackend;

/// Operations the revision pipeline needs from a repository.
///
/// The cache implements this same trait as a decorator, so everything
/// downstream of the factory works against `dyn Backend`.
pub trait Backend {
    /// Short stable backend name, also used by the cache version gate.
    fn name(&self) -> &'static str;

    /// Stable identifier for the repository behind this backend.
    fn uuid(&mut self) -> Result<String>;

    /// Head revision of the given branch (empty = default).
    fn head(&mut self, branch: &str) -> Result<String>;

    /// The branch a fresh walk uses when none is given.
    fn main_branch(&mut self) -> Result<String>;

    /// Branch names known to the repository.
    fn branches(&mut self) -> Result<Vec<String>>;

    /// Tags with the revisions they point at, sorted by name.
    fn tags(&mut self) -> Result<Vec<Tag>>;

    /// File listing at the given revision (empty = head).
    fn tree(&mut self, revision: &str) -> Result<Vec<String>>;

    /// Raw file contents at the given revision (empty = head).
    fn cat(&mut self, path: &str, revision: &str) -> Result<Vec<u8>>;

    /// Log producer for a branch, bounded by optional epoch timestamps.
    fn log_iterator(
        &mut self,
        branch: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<LogIterator>;

    /// Fully assembled revision data for one log ID.
    fn revision(&mut self, id: &str) -> Result<Revision>;

    /// Per-file change counters for one log ID.
    fn diffstat(&mut self, id: &str) -> Result<Diffstat>;

    /// Offers IDs for background fetching. The default does nothing.
    fn prefetch(&mut self, _ids: &[String]) -> Result<()> {
        Ok(())
    }

    /// Tears down prefetch workers after a walk. The default does
    /// nothing.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Picks a backend from the options: forced name first, URL sniffing
/// otherwise.
pub fn backend_for(opts: &Options) -> Result<Box<dyn Backend>> {
    match &opts.forced_backend {
        Some(name) => backend_for_name(name, opts),
        None => backend_for_url(&opts.repository, opts),
    }
}

/// Constructs a backend by its short name.
pub fn backend_for_name(name: &str, opts: &Options) -> Result<Box<dyn Backend>> {
    match name {
        "git" => Ok(Box::new(GitBackend::open(opts.clone())?)),
        "svn" | "subversion" => Ok(Box::new(SvnBackend::open(opts.clone())?)),
        other => Err(Error::Unsupported(format!("no such backend: {other}"))),
    }
}

/// Guesses the backend by examining the repository URL.
pub fn backend_for_url(url: &str, opts: &Options) -> Result<Box<dyn Backend>> {
    if svn::handles(url) {
        return Ok(Box::new(SvnBackend::open(opts.clone())?));
    }
    if git::handles(url) {
        return Ok(Box::new(GitBackend::open(opts.clone())?));
    }
    Err(Error::Unsupported(format!(
        "unable to determine a backend for '{url}'"
    )))
}

struct LogState {
    ids: Vec<String>,
    taken: usize,
    finished: bool,
    error: Option<Error>,
}

struct LogShared {
    state: Mutex<LogState>,
    cond: Condvar,
}

/// Handle the producer thread publishes revision IDs through.
///
/// IDs are buffered and flushed in chunks so the consumer wakes for
/// batches instead of single revisions.
pub struct LogPublisher {
    shared: Arc<LogShared>,
    pending: Vec<String>,
}

const PUBLISH_CHUNK: usize = 64;

impl LogPublisher {
    /// Queues one ID, publishing the chunk when it is full.
    pub fn push(&mut self, id: String) {
        self.pending.push(id);
        if self.pending.len() >= PUBLISH_CHUNK {
            self.flush();
        }
    }

    /// Publishes buffered IDs immediately.
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let mut state = self.shared.state.lock();
        state.ids.append(&mut self.pending);
        drop(state);
        self.shared.cond.notify_all();
    }
}

/// Producer side of the log: a thread walking the repository history
/// and handing out IDs in bounded chunks.
pub struct LogIterator {
    shared: Arc<LogShared>,
    handle: Option<JoinHandle<()>>,
}

impl LogIterator {
    /// Log over a precomputed ID list; the producer side is already
    /// finished.
    pub fn from_ids(ids: Vec<String>) -> Self {
        Self {
            shared: Arc::new(LogShared {
                state: Mutex::new(LogState {
                    ids,
                    taken: 0,
                    finished: true,
                    error: None,
                }),
                cond: Condvar::new(),
            }),
            handle: None,
        }
    }

    /// Starts a producer thread running `producer` with a publisher.
    /// The producer's error, if any, surfaces through
    /// [`Self::take_error`] once the stream ends.
    pub fn spawn<F>(producer: F) -> Self
    where
        F: FnOnce(&mut LogPublisher) -> Result<()> + Send + 'static,
    {
        let shared = Arc::new(LogShared {
            state: Mutex::new(LogState {
                ids: Vec::new(),
                taken: 0,
                finished: false,
                error: None,
            }),
            cond: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("revstat-log".into())
            .spawn(move || {
                let mut publisher = LogPublisher {
                    shared: Arc::clone(&thread_shared),
                    pending: Vec::new(),
                };
                let result = producer(&mut publisher);
                publisher.flush();
                let mut state = thread_shared.state.lock();
                if let Err(err) = result {
                    warn!(%err, "log producer failed");
                    state.error = Some(err);
                }
                state.finished = true;
                drop(state);
                thread_shared.cond.notify_all();
            })
            .expect("spawning the log producer thread");
        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Blocks until new IDs are available and appends them to `out`.
    /// Returns false once the producer has finished and everything has
    /// been drained.
    pub fn next_ids(&mut self, out: &mut VecDeque<String>) -> bool {
        let mut state = self.shared.state.lock();
        while state.taken >= state.ids.len() && !state.finished {
            self.shared.cond.wait(&mut state);
        }
        if state.taken >= state.ids.len() {
            return false;
        }
        while state.taken < state.ids.len() {
            out.push_back(state.ids[state.taken].clone());
            state.taken += 1;
        }
        true
    }

    /// True while the producer thread is still emitting IDs.
    pub fn running(&self) -> bool {
        !self.shared.state.lock().finished
    }

    /// Error recorded by the producer, if it failed.
    pub fn take_error(&mut self) -> Option<Error> {
        self.shared.state.lock().error.take()
    }
}

impl Drop for LogIterator {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // The producer only blocks on repository I/O, never on the
            // consumer, so the join completes even for abandoned walks.
            if handle.join().is_err() {
                warn!("log producer thread panicked");
            }
        }
    }
}

/// Runs an external tool to completion, returning stdout. Non-zero
/// exits and spawn failures map to [`Error::Backend`].
pub(crate) fn run_tool(cmd: &mut Command, what: &str) -> Result<Vec<u8>> {
    debug!(?cmd, "running {what}");
    let output = cmd
        .stdin(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| Error::Backend(format!("unable to run {what}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Backend(format!(
            "{what} failed ({}): {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(output.stdout)
}

/// [`run_tool`] with lossy UTF-8 conversion of stdout.
pub(crate) fn run_tool_utf8(cmd: &mut Command, what: &str) -> Result<String> {
    let stdout = run_tool(cmd, what)?;
    Ok(String::from_utf8_lossy(&stdout).into_owned())
}

/// Non-empty lines of a tool's output, trailing newline removed.
pub(crate) fn output_lines(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}
