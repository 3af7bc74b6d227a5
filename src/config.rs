use std::env;
use std::path::PathBuf;

/// Runtime options consumed by backends, the cache, and the repository
/// facade. Command-line handling lives outside this crate; callers fill
/// this struct however they see fit.
#[derive(Debug, Clone)]
pub struct Options {
    /// Repository URL or local path.
    pub repository: String,
    /// Directory holding one cache subdirectory per repository UUID.
    pub cache_dir: PathBuf,
    /// Explicit backend selection ("git", "svn"); `None` sniffs the URL.
    pub forced_backend: Option<String>,
    /// Wrap the backend in the on-disk revision cache.
    pub use_cache: bool,
    /// Worker count for the diffstat pool; `None` derives it from the
    /// available parallelism.
    pub workers: Option<usize>,
    /// Restrict diffstats to paths below this prefix.
    pub path_prefix: Option<String>,
    /// Layout directory names used by the centralized backend.
    pub trunk_dir: String,
    pub branches_dir: String,
    pub tags_dir: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            repository: String::new(),
            cache_dir: default_cache_dir(),
            forced_backend: None,
            use_cache: true,
            workers: None,
            path_prefix: None,
            trunk_dir: "trunk".into(),
            branches_dir: "branches".into(),
            tags_dir: "tags".into(),
        }
    }
}

impl Options {
    /// Options for the given repository URL with everything else defaulted.
    pub fn for_repository(url: impl Into<String>) -> Self {
        Self {
            repository: url.into(),
            ..Self::default()
        }
    }
}

fn default_cache_dir() -> PathBuf {
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".cache").join("revstat"),
        None => PathBuf::from(".revstat-cache"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_a_cache_dir() {
        let opts = Options::default();
        assert!(opts.use_cache);
        assert!(!opts.cache_dir.as_os_str().is_empty());
        assert_eq!(opts.trunk_dir, "trunk");
    }
}
