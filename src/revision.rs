use crate::bstream::{BinReader, BinWriter};
use crate::diff::Diffstat;

const HEAD_MARKER: u8 = b'R';
const TAIL_MARKER: u8 = b'V';
const RECORD_VERSION: u8 = 1;

/// One fully assembled revision. Immutable once built.
///
/// The stored ID may be a composite `parent:child` pair when the
/// revision encodes a diff range; [`Self::id`] always reports the child
/// side, which is what consumers think of as "the" revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    id: String,
    date: i64,
    author: String,
    message: String,
    diffstat: Diffstat,
}

impl Revision {
    /// Assembles a revision from backend-supplied parts.
    pub fn new(
        id: impl Into<String>,
        date: i64,
        author: impl Into<String>,
        message: impl Into<String>,
        diffstat: Diffstat,
    ) -> Self {
        Self {
            id: id.into(),
            date,
            author: author.into(),
            message: message.into(),
            diffstat,
        }
    }

    /// The revision ID (the child side of a composite range).
    pub fn id(&self) -> &str {
        match self.id.split_once(':') {
            Some((_, child)) => child,
            None => &self.id,
        }
    }

    /// The parent side of a composite range, if the ID carries one.
    pub fn parent_id(&self) -> Option<&str> {
        self.id.split_once(':').map(|(parent, _)| parent)
    }

    /// The full ID as produced by the log, including any range prefix.
    pub fn full_id(&self) -> &str {
        &self.id
    }

    /// Commit time as seconds since the epoch, committer-local.
    pub fn date(&self) -> i64 {
        self.date
    }

    /// Author display name with the email part stripped.
    pub fn author(&self) -> &str {
        &self.author
    }

    /// Commit message body.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Per-file change counters.
    pub fn diffstat(&self) -> &Diffstat {
        &self.diffstat
    }

    /// Applies the configured path-prefix filter to the diffstat.
    pub fn filter_diffstat(&mut self, prefix: &str) {
        self.diffstat.retain_prefix(prefix);
    }

    /// Writes the framed record: head marker, version, payload fields,
    /// tail marker. The ID is not part of the record; the cache index
    /// carries it.
    pub fn encode(&self, out: &mut BinWriter) {
        out.write_u8(HEAD_MARKER);
        out.write_u8(RECORD_VERSION);
        out.write_i64(self.date);
        out.write_string(&self.author);
        out.write_string(&self.message);
        self.diffstat.encode(out);
        out.write_u8(TAIL_MARKER);
    }

    /// Reads a framed record back, attaching `id`. `None` on a wrong
    /// marker, unknown version, or truncated payload.
    pub fn decode(input: &mut BinReader, id: impl Into<String>) -> Option<Self> {
        if input.read_u8() != HEAD_MARKER {
            return None;
        }
        let version = input.read_u8();
        if version != RECORD_VERSION {
            tracing::debug!(version, "unknown revision record version");
            return None;
        }
        let date = input.read_i64();
        let author = input.read_string();
        let message = input.read_string();
        if input.eof() {
            return None;
        }
        let diffstat = Diffstat::decode(input)?;
        if input.read_u8() != TAIL_MARKER || input.eof() || !input.ok() {
            return None;
        }
        Some(Self {
            id: id.into(),
            date,
            author,
            message,
            diffstat,
        })
    }
}

/// The child side of a possibly composite `parent:child` ID.
pub fn child_id(id: &str) -> &str {
    match id.split_once(':') {
        Some((_, child)) => child,
        None => id,
    }
}

/// The parent side of a composite ID, if present.
pub fn parent_id(id: &str) -> Option<&str> {
    id.split_once(':').map(|(parent, _)| parent)
}
