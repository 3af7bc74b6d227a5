//! Backend for distributed commit-graph repositories driven by the
//! `git` command-line tooling.
//!
//! All repository access goes through subprocesses: ancestry listing
//! via `rev-list`, batched raw commit headers, and a single long-lived
//! `diff-tree` child per diffstat worker that receives revision pairs
//! over stdin and terminates each diff with a marker line the parser
//! recognizes.

use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;

use tracing::{debug, trace};

use super::{output_lines, run_tool, run_tool_utf8, Backend, LogIterator};
use crate::config::Options;
use crate::diff::{DiffParser, Diffstat};
use crate::error::{Error, Result};
use crate::jobqueue::JobQueue;
use crate::prefetch::{Prefetcher, PrefetchWorkers, RevisionMeta};
use crate::revision::{child_id, parent_id, Revision};
use crate::tag::Tag;

/// Line fed to the shared diff child after each revision; the tool does
/// not understand it and echoes it back, which ends the record for the
/// parser.
const DIFF_RECORD_MARKER: u8 = 0xff;

/// Sidecar file in the repository control directory caching root
/// commits per branch: `<branch> <head> <root>` lines.
const UUID_SIDECAR: &str = "revstat.cache";

const META_BATCH: usize = 64;

/// True if `url` looks like a repository this backend can open.
pub fn handles(url: &str) -> bool {
    if Path::new(url).join(".git").is_dir() {
        return true;
    }
    if Path::new(url).join(".git").is_file() {
        debug!("detached repository detected");
        return true;
    }
    // Bare repository layout.
    if Path::new(url).is_dir()
        && Path::new(url).join("HEAD").is_file()
        && Path::new(url).join("objects").is_dir()
    {
        debug!("bare repository detected");
        return true;
    }
    false
}

/// Distributed-commit-graph backend.
pub struct GitBackend {
    opts: Options,
    git_dir: PathBuf,
    prefetcher: Option<Prefetcher>,
}

impl GitBackend {
    /// Resolves the repository control directory and verifies the
    /// tooling is present.
    pub fn open(opts: Options) -> Result<Self> {
        let git_dir = resolve_git_dir(&opts.repository)?;
        run_tool_utf8(Command::new("git").arg("--version"), "git version probe")?;
        debug!(git_dir = %git_dir.display(), "git backend opened");
        Ok(Self {
            opts,
            git_dir,
            prefetcher: None,
        })
    }

    fn git(&self) -> Command {
        git_command(&self.git_dir)
    }

    fn read_sidecar(&self, branch: &str) -> (Option<String>, Option<String>) {
        let path = self.git_dir.join(UUID_SIDECAR);
        let Ok(contents) = fs::read_to_string(&path) else {
            return (None, None);
        };
        for line in contents.lines() {
            if !line.starts_with(branch) {
                continue;
            }
            let parts: Vec<&str> = line.split(' ').collect();
            if parts.len() == 3 && parts[0] == branch {
                return (Some(parts[1].to_owned()), Some(parts[2].to_owned()));
            }
            break;
        }
        (None, None)
    }

    fn write_sidecar(&self, branch: &str, head: &str, root: &str) -> Result<()> {
        let path = self.git_dir.join(UUID_SIDECAR);
        let mut lines = vec![format!("{branch} {head} {root}")];
        if let Ok(contents) = fs::read_to_string(&path) {
            for line in contents.lines() {
                if line.is_empty() || line.starts_with(branch) {
                    continue;
                }
                lines.push(line.to_owned());
            }
        }
        let tmp = path.with_extension("cache.tmp");
        fs::write(&tmp, lines.join("\n") + "\n")?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl Backend for GitBackend {
    fn name(&self) -> &'static str {
        "git"
    }

    // The root commit of the current main branch identifies the
    // repository. Rediscovery walks the whole branch, so the result is
    // cached in a sidecar keyed by branch and validated against the
    // cached head on every advance.
    fn uuid(&mut self) -> Result<String> {
        let branch = self.main_branch()?;
        let headrev = self.head(&branch)?;

        let (old_head, old_root) = self.read_sidecar(&branch);
        if let (Some(old_head), Some(old_root)) = (&old_head, &old_root) {
            if *old_head == headrev {
                trace!("found cached root commit");
                return Ok(old_root.clone());
            }
        }

        let mut root = String::new();
        if let (Some(old_head), Some(old_root)) = (&old_head, &old_root) {
            // The cached root stays valid if the old head is an
            // ancestor of the new one.
            let range = format!("{old_head}..{headrev}");
            if let Ok(out) =
                run_tool_utf8(self.git().args(["rev-list", "-1", range.as_str()]), "ancestry probe")
            {
                if !out.trim().is_empty() {
                    debug!(%old_head, "cached head is a valid ancestor, updating sidecar");
                    root = old_root.clone();
                }
            }
        }

        if root.is_empty() {
            let out = run_tool_utf8(
                self.git().args(["rev-list", "--reverse", branch.as_str(), "--"]),
                "root commit discovery",
            )?;
            root = out
                .lines()
                .next()
                .map(str::to_owned)
                .ok_or_else(|| Error::Backend(format!("no root commit on branch '{branch}'")))?;
        }

        self.write_sidecar(&branch, &headrev, &root)?;
        Ok(root)
    }

    fn head(&mut self, branch: &str) -> Result<String> {
        let name = if branch.is_empty() { "HEAD" } else { branch };
        let out = run_tool_utf8(
            self.git().args(["rev-list", "-1", name, "--"]),
            "head lookup",
        )?;
        Ok(out.trim().to_owned())
    }

    fn main_branch(&mut self) -> Result<String> {
        let out = run_tool_utf8(self.git().arg("branch"), "branch listing")?;
        let mut names = Vec::new();
        for line in out.lines() {
            if line.len() < 2 {
                continue;
            }
            if let Some(current) = line.strip_prefix("* ") {
                return Ok(current.to_owned());
            }
            names.push(line[2..].to_owned());
        }
        for fallback in ["master", "remotes/origin/master"] {
            if names.iter().any(|n| n == fallback) {
                return Ok(fallback.to_owned());
            }
        }
        Ok("master".to_owned())
    }

    fn branches(&mut self) -> Result<Vec<String>> {
        let out = run_tool_utf8(self.git().arg("branch"), "branch listing")?;
        Ok(out
            .lines()
            .filter(|line| line.len() >= 2)
            .map(|line| line[2..].to_owned())
            .collect())
    }

    fn tags(&mut self) -> Result<Vec<Tag>> {
        let out = run_tool_utf8(self.git().arg("tag"), "tag listing")?;
        let mut tags = Vec::new();
        for name in output_lines(&out) {
            let id = run_tool_utf8(
                self.git().args(["rev-list", "-1", name.as_str()]),
                "tag resolution",
            )?;
            let id = id.trim();
            if !id.is_empty() {
                tags.push(Tag::new(id, name));
            }
        }
        Ok(tags)
    }

    fn tree(&mut self, revision: &str) -> Result<Vec<String>> {
        let rev = if revision.is_empty() {
            "HEAD"
        } else {
            revision
        };
        let out = run_tool_utf8(
            self.git()
                .args(["ls-tree", "-r", "--full-name", "--name-only", rev]),
            "tree listing",
        )?;
        Ok(output_lines(&out))
    }

    fn cat(&mut self, path: &str, revision: &str) -> Result<Vec<u8>> {
        let rev = if revision.is_empty() {
            "HEAD"
        } else {
            revision
        };
        let spec = format!("{rev}:{path}");
        run_tool(self.git().args(["show", spec.as_str()]), "file contents")
    }

    fn log_iterator(
        &mut self,
        branch: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<LogIterator> {
        let mut cmd = self.git();
        cmd.args(["rev-list", "--first-parent", "--reverse"]);
        if let Some(start) = start {
            cmd.arg(format!("--max-age={start}"));
        }
        if let Some(end) = end {
            cmd.arg(format!("--min-age={end}"));
        }
        cmd.arg(branch);
        cmd.arg("--");
        let out = run_tool_utf8(&mut cmd, "branch log")?;
        let mut revisions = output_lines(&out);
        compose_ranges(&mut revisions);
        Ok(LogIterator::from_ids(revisions))
    }

    fn revision(&mut self, id: &str) -> Result<Revision> {
        let meta = match &self.prefetcher {
            Some(prefetcher) if prefetcher.will_fetch_meta(id) => prefetcher
                .get_meta(id)
                .ok_or_else(|| Error::Backend(format!("failed to retrieve metadata for revision {id}")))?,
            _ => {
                trace!(id, "fetching revision metadata synchronously");
                fetch_meta(&self.git_dir, child_id(id))?
            }
        };
        let diffstat = self.diffstat(id)?;
        Ok(Revision::new(id, meta.date, meta.author, meta.message, diffstat))
    }

    fn diffstat(&mut self, id: &str) -> Result<Diffstat> {
        if let Some(prefetcher) = &self.prefetcher {
            if prefetcher.will_fetch_diffstat(id) {
                return prefetcher.get_diffstat(id).ok_or_else(|| {
                    if prefetcher.is_stopped() {
                        Error::Stopped
                    } else {
                        Error::Backend(format!("failed to retrieve diffstat for revision {id}"))
                    }
                });
            }
        }
        trace!(id, "fetching diffstat synchronously");
        diffstat_once(&self.git_dir, id)
    }

    fn prefetch(&mut self, ids: &[String]) -> Result<()> {
        let prefetcher = self.prefetcher.get_or_insert_with(|| {
            Prefetcher::start(
                Arc::new(GitWorkers {
                    git_dir: self.git_dir.clone(),
                }),
                self.opts.workers,
            )
        });
        prefetcher.prefetch(ids);
        debug!(count = ids.len(), "started prefetching revisions");
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if let Some(mut prefetcher) = self.prefetcher.take() {
            debug!("waiting for prefetcher");
            prefetcher.stop();
            prefetcher.wait();
        }
        Ok(())
    }
}

impl Drop for GitBackend {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

fn git_command(git_dir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.env("GIT_DIR", git_dir);
    cmd
}

fn resolve_git_dir(repository: &str) -> Result<PathBuf> {
    let repo = Path::new(repository);
    if repo.join("HEAD").is_file() {
        return Ok(repo.to_path_buf());
    }
    if repo.join(".git").join("HEAD").is_file() {
        return Ok(repo.join(".git"));
    }
    if repo.join(".git").is_file() {
        // Worktree redirection file: "gitdir: <path>".
        debug!("parsing .git redirection file");
        let contents = fs::read_to_string(repo.join(".git"))?;
        let first = contents.lines().next().unwrap_or_default();
        let target = first
            .split_once(':')
            .map(|(_, path)| path.trim())
            .filter(|path| !path.is_empty())
            .ok_or_else(|| {
                Error::Unsupported(format!("unable to parse .git file in '{repository}'"))
            })?;
        let target = Path::new(target);
        if target.is_absolute() {
            return Ok(target.to_path_buf());
        }
        return Ok(repo.join(target));
    }
    Err(Error::Unsupported(format!(
        "not a git repository: {repository}"
    )))
}

/// Rewrites a bare ancestry list so the second through last entries
/// carry their diff base: `[A, B, C]` becomes `[A, A:B, B:C]`.
fn compose_ranges(revisions: &mut [String]) {
    for i in (1..revisions.len()).rev() {
        revisions[i] = format!("{}:{}", revisions[i - 1], revisions[i]);
    }
}

/// Synchronous diffstat for one possibly composite ID.
fn diffstat_once(git_dir: &Path, id: &str) -> Result<Diffstat> {
    let mut cmd = git_command(git_dir);
    cmd.args(["diff-tree", "-U0", "--no-renames"]);
    match parent_id(id) {
        Some(parent) => {
            cmd.arg(parent);
            cmd.arg(child_id(id));
        }
        None => {
            cmd.arg("--root");
            cmd.arg(id);
        }
    }
    let out = run_tool(&mut cmd, "diff computation")?;
    Ok(DiffParser::parse(out.as_slice()))
}

/// Synchronous metadata fetch for one bare commit ID.
fn fetch_meta(git_dir: &Path, id: &str) -> Result<RevisionMeta> {
    let mut cmd = git_command(git_dir);
    cmd.args(["rev-list", "-1", "--header", id]);
    let out = run_tool_utf8(&mut cmd, "metadata lookup")?;
    let record = out.trim_end_matches('\0');
    let (_, meta) = parse_commit_header(record)?;
    Ok(meta)
}

/// Parses one raw commit header as printed by the batched header
/// listing: the commit hash, `tree`/`parent`/`author`/`committer`
/// lines, a blank separator, and the message indented by four spaces.
fn parse_commit_header(record: &str) -> Result<(String, RevisionMeta)> {
    let lines: Vec<&str> = record.lines().collect();
    let id = lines
        .first()
        .map(|l| l.trim().to_owned())
        .filter(|l| !l.is_empty())
        .ok_or_else(|| Error::Parse("empty commit header".into()))?;

    let author_line = lines
        .iter()
        .position(|l| l.starts_with("author "))
        .ok_or_else(|| Error::Parse(format!("no author in header of {id}")))?;

    let mut author = lines[author_line][7..].to_owned();
    // Strip the email and the date, assuming the address starts at the
    // last '<'.
    if let Some(pos) = author.rfind('<') {
        author.truncate(pos);
    }
    let author = author.trim().to_owned();

    let committer = lines
        .get(author_line + 1)
        .filter(|l| l.starts_with("committer "))
        .ok_or_else(|| Error::Parse(format!("no committer in header of {id}")))?;
    let date = parse_committer_date(committer)
        .ok_or_else(|| Error::Parse(format!("unable to parse commit date: {committer}")))?;

    let mut message = String::new();
    for line in &lines[author_line + 2..] {
        if line.len() > 4 {
            message.push_str(&line[4..]);
        }
        if !line.is_empty() {
            message.push('\n');
        }
    }

    Ok((
        id,
        RevisionMeta {
            date,
            author,
            message,
        },
    ))
}

// "committer Name <mail> 1269952800 +0200" - epoch plus an offset whose
// sign applies to hours and minutes alike.
fn parse_committer_date(line: &str) -> Option<i64> {
    let mut parts = line.rsplitn(3, ' ');
    let offset = parts.next()?;
    let epoch: i64 = parts.next()?.parse().ok()?;
    if offset.len() != 5 {
        return None;
    }
    let sign = match offset.as_bytes()[0] {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let hours: i64 = offset[1..3].parse().ok()?;
    let minutes: i64 = offset[3..5].parse().ok()?;
    Some(epoch + sign * (hours * 3600 + minutes * 60))
}

struct DiffPipe {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl DiffPipe {
    fn spawn(git_dir: &Path) -> Result<Self> {
        let mut cmd = git_command(git_dir);
        cmd.args(["diff-tree", "-U0", "--no-renames", "--stdin", "--root"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Backend(format!("unable to start the diff tool: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Backend("diff tool has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| Error::Backend("diff tool has no stdout".into()))?;
        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }

    fn request(&mut self, id: &str) -> Result<Diffstat> {
        let line = match parent_id(id) {
            Some(parent) => format!("{} {}\n", child_id(id), parent),
            None => format!("{id}\n"),
        };
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.write_all(&[DIFF_RECORD_MARKER, b'\n'])?;
        self.stdin.flush()?;
        let stat = DiffParser::parse_record(&mut self.stdout, Some(DIFF_RECORD_MARKER))?;
        if self.child.try_wait()?.is_some() {
            return Err(Error::Backend("diff tool exited unexpectedly".into()));
        }
        Ok(stat)
    }
}

impl Drop for DiffPipe {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct GitWorkers {
    git_dir: PathBuf,
}

impl PrefetchWorkers for GitWorkers {
    fn diffstat_worker(&self, jobs: &JobQueue<String, Diffstat>) {
        let mut pipe: Option<DiffPipe> = None;
        while let Some(id) = jobs.get_arg() {
            let ready = match &mut pipe {
                Some(p) => Ok(p),
                None => match DiffPipe::spawn(&self.git_dir) {
                    Ok(p) => Ok(pipe.insert(p)),
                    Err(e) => Err(e),
                },
            };
            let result = ready.and_then(|p| p.request(&id));
            match result {
                Ok(stat) => jobs.done(id, stat),
                Err(err) => {
                    debug!(id = %id, %err, "diffstat job failed");
                    jobs.failed(id);
                    // The shared child may be wedged; start fresh.
                    pipe = None;
                }
            }
        }
    }

    fn metadata_worker(&self, jobs: &JobQueue<String, RevisionMeta>) {
        while let Some(ids) = jobs.get_args(META_BATCH) {
            let mut cmd = git_command(&self.git_dir);
            cmd.args(["rev-list", "--no-walk", "--header"]);
            cmd.args(&ids);
            match run_tool_utf8(&mut cmd, "batched metadata lookup") {
                Ok(out) => {
                    let mut answered = std::collections::HashSet::new();
                    for record in out.split('\0').filter(|r| !r.trim().is_empty()) {
                        match parse_commit_header(record) {
                            Ok((id, meta)) => {
                                answered.insert(id.clone());
                                jobs.done(id, meta);
                            }
                            Err(err) => {
                                debug!(%err, "error parsing a revision header");
                            }
                        }
                    }
                    // Anything the batch did not answer is failed so
                    // consumers do not block forever.
                    for id in ids {
                        if !answered.contains(&id) {
                            jobs.failed(id);
                        }
                    }
                }
                Err(err) => {
                    debug!(%err, "batched metadata lookup failed, retrying one by one");
                    for id in ids {
                        match fetch_meta(&self.git_dir, &id) {
                            Ok(meta) => jobs.done(id, meta),
                            Err(err) => {
                                debug!(id = %id, %err, "metadata job failed");
                                jobs.failed(id);
                            }
                        }
                    }
                }
            }
        }
    }
}
