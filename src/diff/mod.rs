//! Per-file change counters and the unified-diff parser that produces
//! them.
//!
//! The parser understands two header dialects: `Index: PATH` lines as
//! emitted by centralized clients, and `diff --git a/PATH b/PATH` lines
//! from distributed tooling. Everything else is counted or skipped line
//! by line; see [`DiffParser::parse`].

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::io::{self, BufRead};

use crate::bstream::{BinReader, BinWriter};

/// Counters for a single path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Bytes on added lines, excluding the `+` sign.
    pub bytes_added: u64,
    /// Number of added lines.
    pub lines_added: u64,
    /// Bytes on removed lines, excluding the `-` sign.
    pub bytes_removed: u64,
    /// Number of removed lines.
    pub lines_removed: u64,
}

impl FileStat {
    fn merge(&mut self, other: &FileStat) {
        self.bytes_added += other.bytes_added;
        self.lines_added += other.lines_added;
        self.bytes_removed += other.bytes_removed;
        self.lines_removed += other.lines_removed;
    }
}

/// Mapping of path to change counters for one revision.
///
/// Paths come from the backend untouched; the map keeps them sorted so
/// the binary encoding is deterministic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Diffstat {
    stats: BTreeMap<String, FileStat>,
}

impl Diffstat {
    /// Empty stat; a valid value for revisions that touch nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of touched paths.
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    /// True when no path was touched.
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Touched paths in sorted order.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.stats.keys().map(String::as_str)
    }

    /// Counters for one path, if present.
    pub fn get(&self, path: &str) -> Option<&FileStat> {
        self.stats.get(path)
    }

    /// Lines added to `path`, 0 if untouched.
    pub fn lines_added(&self, path: &str) -> u64 {
        self.stats.get(path).map_or(0, |s| s.lines_added)
    }

    /// Bytes added to `path`, 0 if untouched.
    pub fn bytes_added(&self, path: &str) -> u64 {
        self.stats.get(path).map_or(0, |s| s.bytes_added)
    }

    /// Lines removed from `path`, 0 if untouched.
    pub fn lines_removed(&self, path: &str) -> u64 {
        self.stats.get(path).map_or(0, |s| s.lines_removed)
    }

    /// Bytes removed from `path`, 0 if untouched.
    pub fn bytes_removed(&self, path: &str) -> u64 {
        self.stats.get(path).map_or(0, |s| s.bytes_removed)
    }

    /// Records counters for a path, accumulating over repeated headers.
    pub fn record(&mut self, path: String, stat: FileStat) {
        match self.stats.entry(path) {
            Entry::Vacant(slot) => {
                slot.insert(stat);
            }
            Entry::Occupied(mut slot) => slot.get_mut().merge(&stat),
        }
    }

    /// Drops every path that does not start with `prefix`.
    pub fn retain_prefix(&mut self, prefix: &str) {
        self.stats.retain(|path, _| path.starts_with(prefix));
    }

    /// Serializes the stat: `u32` count, then per path the NUL-terminated
    /// path and four `u64` counters.
    pub fn encode(&self, out: &mut BinWriter) {
        out.write_u32(self.stats.len() as u32);
        for (path, stat) in &self.stats {
            out.write_string(path);
            out.write_u64(stat.bytes_added);
            out.write_u64(stat.lines_added);
            out.write_u64(stat.bytes_removed);
            out.write_u64(stat.lines_removed);
        }
    }

    /// Reads back what [`Self::encode`] wrote; `None` on a malformed or
    /// truncated record.
    pub fn decode(input: &mut BinReader) -> Option<Self> {
        let count = input.read_u32();
        if input.eof() {
            return None;
        }
        let mut stats = BTreeMap::new();
        for _ in 0..count {
            let path = input.read_string();
            if path.is_empty() {
                return None;
            }
            let stat = FileStat {
                bytes_added: input.read_u64(),
                lines_added: input.read_u64(),
                bytes_removed: input.read_u64(),
                lines_removed: input.read_u64(),
            };
            if input.eof() || !input.ok() {
                return None;
            }
            stats.insert(path, stat);
        }
        Some(Self { stats })
    }
}

/// Line scanner turning unified-diff output into a [`Diffstat`].
pub struct DiffParser;

impl DiffParser {
    /// Parses a complete diff, reading `input` to end of stream.
    pub fn parse(input: impl BufRead) -> Diffstat {
        let mut input = input;
        Self::parse_record(&mut input, None).unwrap_or_default()
    }

    /// Parses one diff record from a shared pipe, stopping after a line
    /// that starts with `marker`. Used by workers that multiplex many
    /// revisions over a single child process.
    pub fn parse_record(input: &mut impl BufRead, marker: Option<u8>) -> io::Result<Diffstat> {
        let mut stat = Diffstat::new();
        let mut current = FileStat::default();
        let mut file: Option<String> = None;
        let mut line = Vec::new();

        loop {
            line.clear();
            let n = input.read_until(b'\n', &mut line)?;
            if n == 0 {
                break;
            }
            if line.ends_with(b"\n") {
                line.pop();
            }
            if let Some(m) = marker {
                if line.first() == Some(&m) {
                    break;
                }
            }

            if let Some(rest) = line.strip_prefix(b"Index: ") {
                flush(&mut stat, &mut file, &mut current);
                file = Some(String::from_utf8_lossy(rest).into_owned());
            } else if let Some(rest) = line.strip_prefix(b"diff --git ") {
                flush(&mut stat, &mut file, &mut current);
                file = Some(git_header_path(rest));
            } else if line.starts_with(b"====")
                || line.starts_with(b"--- ")
                || line.starts_with(b"+++ ")
            {
                continue;
            } else if line.first() == Some(&b'-') {
                current.bytes_removed += (line.len() - 1) as u64;
                current.lines_removed += 1;
            } else if line.first() == Some(&b'+') {
                current.bytes_added += (line.len() - 1) as u64;
                current.lines_added += 1;
            }
        }

        flush(&mut stat, &mut file, &mut current);
        Ok(stat)
    }
}

fn flush(stat: &mut Diffstat, file: &mut Option<String>, current: &mut FileStat) {
    if let Some(path) = file.take() {
        stat.record(path, std::mem::take(current));
    }
    *current = FileStat::default();
}

// "a/old b/new" - take the pre-image side without its a/ prefix, matching
// how the headers name unrenamed files.
fn git_header_path(rest: &[u8]) -> String {
    let text = String::from_utf8_lossy(rest);
    let first = match text.split_once(" b/") {
        Some((a, _)) => a,
        None => text.as_ref(),
    };
    first.strip_prefix("a/").unwrap_or(first).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const GIT_DIFF: &str = "\
diff --git a/src/main.rs b/src/main.rs
index 83db48f..bf269f4 100644
--- a/src/main.rs
+++ b/src/main.rs
@@ -1,3 +1,2 @@
-old line
-gone
+fresh
diff --git a/README b/README
new file mode 100644
--- /dev/null
+++ b/README
@@ -0,0 +1 @@
+hello
";

    const SVN_DIFF: &str = "\
Index: trunk/notes.txt
===================================================================
--- trunk/notes.txt\t(revision 3)
+++ trunk/notes.txt\t(revision 4)
@@ -1 +1,2 @@
 context stays
+added
Index: trunk/empty.txt
===================================================================
";

    #[test]
    fn parses_distributed_dialect() {
        let stat = DiffParser::parse(Cursor::new(GIT_DIFF));
        assert_eq!(stat.len(), 2);
        assert_eq!(stat.lines_removed("src/main.rs"), 2);
        assert_eq!(stat.bytes_removed("src/main.rs"), 12);
        assert_eq!(stat.lines_added("src/main.rs"), 1);
        assert_eq!(stat.bytes_added("src/main.rs"), 5);
        assert_eq!(stat.lines_added("README"), 1);
        assert_eq!(stat.bytes_added("README"), 5);
    }

    #[test]
    fn parses_centralized_dialect() {
        let stat = DiffParser::parse(Cursor::new(SVN_DIFF));
        assert_eq!(stat.len(), 2);
        assert_eq!(stat.lines_added("trunk/notes.txt"), 1);
        assert_eq!(stat.bytes_added("trunk/notes.txt"), 5);
        assert_eq!(stat.lines_removed("trunk/notes.txt"), 0);
        // A header with no body still yields a zero-filled entry.
        assert_eq!(stat.get("trunk/empty.txt"), Some(&FileStat::default()));
    }

    #[test]
    fn empty_input_yields_empty_stat() {
        let stat = DiffParser::parse(Cursor::new(""));
        assert!(stat.is_empty());
    }

    #[test]
    fn marker_splits_records_on_a_shared_pipe() {
        let mut feed = GIT_DIFF.as_bytes().to_vec();
        feed.extend_from_slice(&[0xff, b'\n']);
        feed.extend_from_slice(b"Index: other.txt\n+more\n");
        feed.extend_from_slice(&[0xff, b'\n']);
        let mut cursor = Cursor::new(feed);
        let first = DiffParser::parse_record(&mut cursor, Some(0xff)).unwrap();
        assert_eq!(first.len(), 2);
        let second = DiffParser::parse_record(&mut cursor, Some(0xff)).unwrap();
        assert_eq!(second.lines_added("other.txt"), 1);
        let rest = DiffParser::parse_record(&mut cursor, Some(0xff)).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn codec_roundtrip() {
        let mut stat = Diffstat::new();
        stat.record(
            "a/b.txt".into(),
            FileStat {
                bytes_added: 10,
                lines_added: 2,
                bytes_removed: 3,
                lines_removed: 1,
            },
        );
        stat.record("zero".into(), FileStat::default());
        let mut out = BinWriter::memory();
        stat.encode(&mut out);
        let mut input = BinReader::memory(out.into_data());
        let back = Diffstat::decode(&mut input).unwrap();
        assert_eq!(back, stat);
    }

    #[test]
    fn truncated_record_fails_decode() {
        let mut stat = Diffstat::new();
        stat.record("file".into(), FileStat::default());
        let mut out = BinWriter::memory();
        stat.encode(&mut out);
        let mut data = out.into_data();
        data.truncate(data.len() - 4);
        let mut input = BinReader::memory(data);
        assert!(Diffstat::decode(&mut input).is_none());
    }

    #[test]
    fn prefix_filter_drops_foreign_paths() {
        let mut stat = Diffstat::new();
        stat.record("src/lib.rs".into(), FileStat::default());
        stat.record("docs/a.md".into(), FileStat::default());
        stat.retain_prefix("src/");
        assert_eq!(stat.files().collect::<Vec<_>>(), vec!["src/lib.rs"]);
    }
}
