//! Backend for centralized repositories addressed by revision number,
//! driven by the installed `svn` client.
//!
//! Revision IDs are decimal strings. The log is fetched in windows so a
//! slow server never stalls the pipeline behind one long request, and
//! diffstats stream the emitted patch through a pipe into the diff
//! parser running on its own thread.

use std::io::BufReader;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, trace};

use super::{output_lines, run_tool, run_tool_utf8, Backend, LogIterator};
use crate::config::Options;
use crate::diff::{DiffParser, Diffstat};
use crate::error::{Error, Result};
use crate::jobqueue::JobQueue;
use crate::prefetch::{Prefetcher, PrefetchWorkers, RevisionMeta};
use crate::revision::{child_id, parent_id, Revision};
use crate::tag::Tag;

/// Window size for paginated log queries; `file://` URLs use a single
/// window.
const LOG_WINDOW: usize = 1024;

const DEFAULT_DIFF_WORKERS: usize = 4;

/// True if `url` names a repository this backend can reach.
pub fn handles(url: &str) -> bool {
    const SCHEMES: [&str; 5] = ["svn://", "svn+ssh://", "http://", "https://", "file://"];
    if SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        return true;
    }
    // Local repository without the file:// prefix.
    let path = Path::new(url);
    path.is_dir() && path.join("locks").is_dir() && path.join("db").join("uuid").exists()
}

/// Centralized-revision-number backend.
pub struct SvnBackend {
    opts: Options,
    url: String,
    uuid: String,
    prefetcher: Option<Prefetcher>,
}

impl SvnBackend {
    /// Opens the connection by probing the server for its UUID.
    pub fn open(opts: Options) -> Result<Self> {
        let url = normalize_url(&opts.repository);
        let uuid = run_tool_utf8(
            Command::new("svn").args(["info", "--show-item", "repos-uuid", url.as_str()]),
            "repository probe",
        )?
        .trim()
        .to_owned();
        if uuid.is_empty() {
            return Err(Error::Backend(format!(
                "server did not report a repository UUID for '{url}'"
            )));
        }
        debug!(%url, %uuid, "svn backend opened");
        Ok(Self {
            opts,
            url,
            uuid,
            prefetcher: None,
        })
    }

    fn branch_prefix(&self, branch: &str) -> String {
        if branch == "trunk" {
            self.opts.trunk_dir.clone()
        } else if !branch.is_empty() {
            format!("{}/{}", self.opts.branches_dir, branch)
        } else {
            String::new()
        }
    }

    fn target(&self, prefix: &str) -> String {
        if prefix.is_empty() {
            self.url.clone()
        } else {
            format!("{}/{}", self.url, prefix)
        }
    }

    fn head_revision(&self) -> Result<i64> {
        let out = run_tool_utf8(
            Command::new("svn").args(["info", "--show-item", "revision", self.url.as_str()]),
            "head revision lookup",
        )?;
        parse_revnum(out.trim())
    }

    fn dated_revision(&self, timestamp: i64, towards_head: bool) -> Result<Option<i64>> {
        let date = OffsetDateTime::from_unix_timestamp(timestamp)
            .map_err(|e| Error::Parse(format!("timestamp out of range: {e}")))?
            .format(&Rfc3339)
            .map_err(|e| Error::Parse(format!("unable to format timestamp: {e}")))?;
        let range = if towards_head {
            format!("{{{date}}}:HEAD")
        } else {
            format!("{{{date}}}:0")
        };
        let out = run_tool_utf8(
            Command::new("svn").args(["log", "-q", "-r", range.as_str(), "--limit", "1", self.url.as_str()]),
            "dated revision lookup",
        )?;
        Ok(parse_log_revisions(&out).first().copied())
    }
}

impl Backend for SvnBackend {
    fn name(&self) -> &'static str {
        "svn"
    }

    fn uuid(&mut self) -> Result<String> {
        Ok(self.uuid.clone())
    }

    fn head(&mut self, branch: &str) -> Result<String> {
        let prefix = self.branch_prefix(branch);
        let target = self.target(&prefix);
        let result = run_tool_utf8(
            Command::new("svn").args(["info", "--show-item", "last-changed-revision", target.as_str()]),
            "head lookup",
        );
        let out = match result {
            Ok(out) => out,
            // Repositories without the conventional layout keep their
            // history at the root.
            Err(_) if branch.is_empty() || branch == "trunk" => run_tool_utf8(
                Command::new("svn").args([
                    "info",
                    "--show-item",
                    "last-changed-revision",
                    self.url.as_str(),
                ]),
                "head lookup",
            )?,
            Err(err) => return Err(err),
        };
        let rev = parse_revnum(out.trim())?;
        Ok(rev.to_string())
    }

    fn main_branch(&mut self) -> Result<String> {
        Ok("trunk".to_owned())
    }

    fn branches(&mut self) -> Result<Vec<String>> {
        let target = format!("{}/{}", self.url, self.opts.branches_dir);
        let mut branches = vec!["trunk".to_owned()];
        let Ok(out) = run_tool_utf8(Command::new("svn").args(["list", target.as_str()]), "branch listing")
        else {
            // No branches directory; the main branch is all there is.
            return Ok(branches);
        };
        let mut rest: Vec<String> = output_lines(&out)
            .into_iter()
            .filter_map(|line| line.strip_suffix('/').map(str::to_owned))
            .collect();
        rest.sort();
        branches.extend(rest);
        Ok(branches)
    }

    fn tags(&mut self) -> Result<Vec<Tag>> {
        let target = format!("{}/{}", self.url, self.opts.tags_dir);
        let Ok(out) = run_tool_utf8(
            Command::new("svn").args(["list", "--verbose", target.as_str()]),
            "tag listing",
        ) else {
            return Ok(Vec::new());
        };
        let mut tags = Vec::new();
        for line in output_lines(&out) {
            // "     23 jdoe       Apr 02  2010 v1.0/"
            let Some(name) = line.split_whitespace().last() else {
                continue;
            };
            let Some(name) = name.strip_suffix('/') else {
                continue;
            };
            if name == "." {
                continue;
            }
            let Some(rev) = line.split_whitespace().next() else {
                continue;
            };
            if rev.parse::<u64>().is_ok() {
                tags.push(Tag::new(rev, name));
            }
        }
        tags.sort();
        Ok(tags)
    }

    fn tree(&mut self, revision: &str) -> Result<Vec<String>> {
        let mut cmd = Command::new("svn");
        cmd.args(["list", "--recursive"]);
        if !revision.is_empty() {
            cmd.args(["-r", revision]);
        }
        cmd.arg(&self.url);
        let out = run_tool_utf8(&mut cmd, "tree listing")?;
        Ok(output_lines(&out)
            .into_iter()
            .filter(|line| !line.ends_with('/'))
            .collect())
    }

    fn cat(&mut self, path: &str, revision: &str) -> Result<Vec<u8>> {
        let target = format!("{}/{}", self.url, path);
        let mut cmd = Command::new("svn");
        cmd.arg("cat");
        if !revision.is_empty() {
            cmd.args(["-r", revision]);
        }
        cmd.arg(&target);
        run_tool(&mut cmd, "file contents")
    }

    fn log_iterator(
        &mut self,
        branch: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<LogIterator> {
        let start_rev = match start {
            Some(ts) => match self.dated_revision(ts, true)? {
                Some(rev) => rev,
                None => return Ok(LogIterator::from_ids(Vec::new())),
            },
            None => 0,
        };
        let end_rev = match end {
            Some(ts) => match self.dated_revision(ts, false)? {
                Some(rev) => rev,
                None => return Ok(LogIterator::from_ids(Vec::new())),
            },
            None => self.head_revision()?,
        };

        let window = if self.url.starts_with("file://") {
            0
        } else {
            LOG_WINDOW
        };
        let target = self.target(&self.branch_prefix(branch));
        Ok(LogIterator::spawn(move |publisher| {
            let mut wstart = start_rev;
            loop {
                if wstart > end_rev {
                    break;
                }
                trace!(wstart, end_rev, window, "fetching log window");
                let range = format!("{wstart}:{end_rev}");
                let mut cmd = Command::new("svn");
                cmd.args(["log", "-q", "-r", range.as_str()]);
                if window > 0 {
                    let limit = window.to_string();
                    cmd.args(["--limit", limit.as_str()]);
                }
                cmd.arg(&target);
                let out = run_tool_utf8(&mut cmd, "log window")?;
                let revisions = parse_log_revisions(&out);
                for rev in &revisions {
                    publisher.push(rev.to_string());
                }
                publisher.flush();
                let Some(&latest) = revisions.last() else {
                    break;
                };
                if window == 0 || latest >= end_rev {
                    break;
                }
                wstart = latest + 1;
            }
            Ok(())
        }))
    }

    fn revision(&mut self, id: &str) -> Result<Revision> {
        let meta = match &self.prefetcher {
            Some(prefetcher) if prefetcher.will_fetch_meta(id) => prefetcher
                .get_meta(id)
                .ok_or_else(|| Error::Backend(format!("failed to retrieve metadata for revision {id}")))?,
            _ => {
                trace!(id, "fetching revision metadata synchronously");
                fetch_meta(&self.url, child_id(id))?
            }
        };
        let diffstat = self.diffstat(id)?;
        Ok(Revision::new(id, meta.date, meta.author, meta.message, diffstat))
    }

    fn diffstat(&mut self, id: &str) -> Result<Diffstat> {
        if let Some(prefetcher) = &self.prefetcher {
            if prefetcher.will_fetch_diffstat(id) {
                trace!(id, "revision will be prefetched");
                return prefetcher.get_diffstat(id).ok_or_else(|| {
                    if prefetcher.is_stopped() {
                        Error::Stopped
                    } else {
                        Error::Backend(format!("failed to retrieve diffstat for revision {id}"))
                    }
                });
            }
        }
        diffstat_range(&self.url, id)
    }

    fn prefetch(&mut self, ids: &[String]) -> Result<()> {
        let prefetcher = self.prefetcher.get_or_insert_with(|| {
            Prefetcher::start(
                Arc::new(SvnWorkers {
                    url: self.url.clone(),
                }),
                Some(self.opts.workers.unwrap_or(DEFAULT_DIFF_WORKERS)),
            )
        });
        prefetcher.prefetch(ids);
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if let Some(mut prefetcher) = self.prefetcher.take() {
            prefetcher.stop();
            prefetcher.wait();
        }
        Ok(())
    }
}

impl Drop for SvnBackend {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

fn normalize_url(repository: &str) -> String {
    if repository.starts_with('/') {
        format!("file://{repository}")
    } else {
        repository.to_owned()
    }
}

fn parse_revnum(text: &str) -> Result<i64> {
    text.parse()
        .map_err(|_| Error::Parse(format!("malformed revision number: '{text}'")))
}

/// Revision numbers from quiet log output, in emission order.
fn parse_log_revisions(out: &str) -> Vec<i64> {
    out.lines()
        .filter_map(|line| {
            let rest = line.strip_prefix('r')?;
            let (num, _) = rest.split_once(' ')?;
            num.parse().ok()
        })
        .collect()
}

/// The diff range for an ID: an explicit `parent:child` pair, or the
/// single-revision change `id-1:id`.
fn diff_range(id: &str) -> Result<(i64, i64)> {
    match parent_id(id) {
        Some(parent) => Ok((parse_revnum(parent)?, parse_revnum(child_id(id))?)),
        None => {
            let rev = parse_revnum(id)?;
            Ok(((rev - 1).max(0), rev))
        }
    }
}

/// Streams the patch for a revision range through a pipe into the diff
/// parser running on a second thread.
fn diffstat_range(url: &str, id: &str) -> Result<Diffstat> {
    let (r1, r2) = diff_range(id)?;
    if r2 == 0 {
        return Ok(Diffstat::new());
    }
    let range = format!("{r1}:{r2}");
    let mut child = Command::new("svn")
        .args(["diff", "-r", range.as_str(), "--ignore-properties", url])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::Backend(format!("unable to run the diff client: {e}")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Backend("diff client has no stdout".into()))?;

    let parser = thread::spawn(move || DiffParser::parse(BufReader::new(stdout)));
    let status = child
        .wait()
        .map_err(|e| Error::Backend(format!("diff client did not exit: {e}")))?;
    let stat = parser
        .join()
        .map_err(|_| Error::Backend("diff parser thread panicked".into()))?;
    if !status.success() {
        return Err(Error::Backend(format!(
            "diff request for revision {id} failed ({status})"
        )));
    }
    Ok(stat)
}

/// Metadata for one bare revision number via a single log request.
fn fetch_meta(url: &str, id: &str) -> Result<RevisionMeta> {
    let out = run_tool_utf8(
        Command::new("svn").args(["log", "-r", id, url]),
        "revision metadata lookup",
    )?;
    parse_log_entry(&out).ok_or_else(|| Error::Parse(format!("malformed log entry for revision {id}")))
}

// One verbose log entry:
//   ------------------------------------------------------------------------
//   r4 | jdoe | 2010-04-02 14:20:00 +0200 (Fri, 02 Apr 2010) | 1 line
//
//   message text
//   ------------------------------------------------------------------------
fn parse_log_entry(out: &str) -> Option<RevisionMeta> {
    let mut lines = out.lines();
    let header = loop {
        let line = lines.next()?;
        if line.starts_with('r') && line.contains(" | ") {
            break line;
        }
    };
    let fields: Vec<&str> = header.split(" | ").collect();
    if fields.len() < 3 {
        return None;
    }
    let author = fields[1].trim().to_owned();
    let date = parse_log_date(fields[2])?;

    let mut message = String::new();
    let mut first = true;
    for line in lines {
        if line.starts_with("----------------------------------------") {
            break;
        }
        if first && line.is_empty() {
            first = false;
            continue;
        }
        first = false;
        message.push_str(line);
        message.push('\n');
    }

    Some(RevisionMeta {
        date,
        author,
        message,
    })
}

// "2010-04-02 14:20:00 +0200 (Fri, 02 Apr 2010)" - the parenthesized
// part is client-locale noise.
fn parse_log_date(text: &str) -> Option<i64> {
    let format = format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second] [offset_hour sign:mandatory][offset_minute]"
    );
    let trimmed = text.split(" (").next()?.trim();
    let parsed = OffsetDateTime::parse(trimmed, &format).ok()?;
    Some(parsed.unix_timestamp() + i64::from(parsed.offset().whole_seconds()))
}

struct SvnWorkers {
    url: String,
}

impl PrefetchWorkers for SvnWorkers {
    fn diffstat_worker(&self, jobs: &JobQueue<String, Diffstat>) {
        while let Some(id) = jobs.get_arg() {
            match diffstat_range(&self.url, &id) {
                Ok(stat) => jobs.done(id, stat),
                Err(err) => {
                    debug!(id = %id, %err, "diffstat job failed");
                    jobs.failed(id);
                }
            }
        }
    }

    // The server answers metadata one revision at a time; there is no
    // batched form worth using.
    fn metadata_worker(&self, jobs: &JobQueue<String, RevisionMeta>) {
        while let Some(id) = jobs.get_arg() {
            match fetch_meta(&self.url, &id) {
                Ok(meta) => jobs.done(id, meta),
                Err(err) => {
                    debug!(id = %id, %err, "metadata job failed");
                    jobs.failed(id);
                }
            }
        }
    }
}
