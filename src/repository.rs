//! Consumer-facing repository facade.

use tracing::{debug, info, warn};

use crate::backend::{self, Backend};
use crate::cache::Cache;
use crate::config::Options;
use crate::error::Result;
use crate::iterator::{PrefetchMode, RevisionIterator};
use crate::revision::Revision;
use crate::tag::Tag;

/// A source-control repository plus the revision pipeline around it.
///
/// Opening selects a backend (by forced name or URL sniffing) and, by
/// default, wraps it in the on-disk revision cache. Everything the
/// report layer needs goes through this type.
pub struct Repository {
    backend: Box<dyn Backend>,
    opts: Options,
}

impl Repository {
    /// Opens the repository described by `opts`.
    pub fn open(opts: Options) -> Result<Self> {
        let backend = backend::backend_for(&opts)?;
        Ok(Self::assemble(backend, opts))
    }

    /// Wraps an already-constructed backend; used by embedders and
    /// tests that bring their own.
    pub fn with_backend(backend: Box<dyn Backend>, opts: Options) -> Self {
        Self::assemble(backend, opts)
    }

    fn assemble(backend: Box<dyn Backend>, opts: Options) -> Self {
        let backend: Box<dyn Backend> = if opts.use_cache {
            Box::new(Cache::new(backend, opts.clone()))
        } else {
            backend
        };
        Self { backend, opts }
    }

    /// The repository URL these options were opened with.
    pub fn url(&self) -> &str {
        &self.opts.repository
    }

    /// Short name of the active backend ("git", "svn").
    pub fn kind(&self) -> &'static str {
        self.backend.name()
    }

    /// Head revision of `branch`, or of the default branch.
    pub fn head(&mut self, branch: Option<&str>) -> Result<String> {
        let branch = match branch {
            Some(name) => name.to_owned(),
            None => self.backend.main_branch()?,
        };
        self.backend.head(&branch)
    }

    /// The branch walks use when none is named.
    pub fn default_branch(&mut self) -> Result<String> {
        self.backend.main_branch()
    }

    /// All branch names.
    pub fn branches(&mut self) -> Result<Vec<String>> {
        self.backend.branches()
    }

    /// All tags, sorted by name.
    pub fn tags(&mut self) -> Result<Vec<Tag>> {
        self.backend.tags()
    }

    /// File listing at `revision` (default: head).
    pub fn tree(&mut self, revision: Option<&str>) -> Result<Vec<String>> {
        self.backend.tree(revision.unwrap_or_default())
    }

    /// Raw file contents at `revision` (default: head).
    pub fn cat(&mut self, path: &str, revision: Option<&str>) -> Result<Vec<u8>> {
        self.backend.cat(path, revision.unwrap_or_default())
    }

    /// One fully populated revision.
    pub fn revision(&mut self, id: &str) -> Result<Revision> {
        self.backend.revision(id)
    }

    /// Streaming iterator over a branch (default branch when `None`).
    pub fn iterator(
        &mut self,
        branch: Option<&str>,
        start: Option<i64>,
        end: Option<i64>,
        mode: PrefetchMode,
    ) -> Result<RevisionIterator<'_>> {
        let branch = match branch {
            Some(name) => name.to_owned(),
            None => self.backend.main_branch()?,
        };
        RevisionIterator::new(&mut *self.backend, &branch, start, end, mode)
    }

    /// Drives `callback` over every revision of the branch in log
    /// order, prefetching ahead of the consumer.
    pub fn walk<F>(
        &mut self,
        branch: Option<&str>,
        start: Option<i64>,
        end: Option<i64>,
        mut callback: F,
    ) -> Result<()>
    where
        F: FnMut(&Revision) -> Result<()>,
    {
        let prefix = self.opts.path_prefix.clone();
        let branch = match branch {
            Some(name) => name.to_owned(),
            None => self.backend.main_branch()?,
        };
        info!(branch = %branch, "fetching revisions");

        let mut last_id: Option<String> = None;
        let mut iter = RevisionIterator::new(
            &mut *self.backend,
            &branch,
            start,
            end,
            PrefetchMode::PrefetchRevisions,
        )?;
        loop {
            let mut revision = match iter.next_revision() {
                Ok(Some(revision)) => revision,
                Ok(None) => break,
                Err(err) => {
                    match &last_id {
                        Some(last) => warn!(%err, last = %last, "walk aborted after revision"),
                        None => warn!(%err, "walk aborted before the first revision"),
                    }
                    return Err(err);
                }
            };
            if let Some(prefix) = &prefix {
                revision.filter_diffstat(prefix);
            }
            debug!(id = revision.id(), progress = iter.progress(), "fetched revision");
            callback(&revision)?;
            last_id = Some(revision.id().to_owned());
        }
        info!("fetching revisions done");
        self.backend.finalize()
    }
}
