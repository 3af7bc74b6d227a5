//! # revstat - SCM history statistics engine
//!
//! revstat walks the history of a source-control repository and hands
//! fully populated revision records (authorship, commit dates, per-file
//! line and byte churn) to report code. The value lives in the
//! acquisition pipeline: a concurrent prefetcher extracts metadata and
//! diffstats from the repository tooling, a content-addressed on-disk
//! cache memoizes the results with crash-safe writes, and a streaming
//! iterator feeds the consumer in log order.
//!
//! ## Quick start
//!
//! ```no_run
//! use revstat::{Options, Repository};
//!
//! let mut repo = Repository::open(Options::for_repository("/path/to/repo"))?;
//! let mut commits = 0u64;
//! repo.walk(None, None, None, |revision| {
//!     commits += 1;
//!     println!("{} {}", revision.id(), revision.author());
//!     Ok(())
//! })?;
//! println!("{commits} commits");
//! # Ok::<(), revstat::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - **Backends**: adapters over distributed (`git`) and centralized
//!   (`svn`) tooling, behind one trait.
//! - **Prefetcher**: two worker pools over keyed job queues, one for
//!   heavy diffstats and one for batched metadata.
//! - **Cache**: a log-structured revision store with CRC-checked
//!   shards, a gzip index, version gating, and an exclusive directory
//!   lock; it implements the backend trait and wraps the real one.
//! - **Iterators**: a producer thread streams revision IDs while the
//!   consumer-facing iterator assembles revisions in order.

pub mod backend;
pub mod bstream;
pub mod cache;
pub mod config;
pub mod diff;
pub mod error;
pub mod iterator;
pub mod jobqueue;
pub mod logging;
pub mod prefetch;
pub mod repository;
pub mod revision;
pub mod sigblock;
pub mod tag;

// Re-export the main public API
pub use crate::backend::{backend_for, backend_for_name, backend_for_url, Backend, LogIterator};
pub use crate::cache::{Cache, CACHE_VERSION};
pub use crate::config::Options;
pub use crate::diff::{DiffParser, Diffstat, FileStat};
pub use crate::error::{Error, Result};
pub use crate::iterator::{PrefetchMode, RevisionIterator};
pub use crate::jobqueue::JobQueue;
pub use crate::prefetch::{Prefetcher, RevisionMeta};
pub use crate::repository::Repository;
pub use crate::revision::Revision;
pub use crate::sigblock::SignalDeferral;
pub use crate::tag::Tag;
