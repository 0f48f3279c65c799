//! Replaces the reference tool's global `g_loglevel` / `g_logprefix` /
//! `g_uelf_name` / `g_relf_name` state with an explicit struct threaded
//! through the pipeline.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Normal,
    Warn,
    Err,
}

impl LogLevel {
    pub fn to_tracing(self) -> Level {
        match self {
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Normal => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Err => Level::ERROR,
        }
    }
}

/// Per-invocation context: log level, a log prefix derived from the source
/// object's basename (so concurrent invocations can be told apart in a
/// shared log stream), and the two input file names used in diagnostics.
#[derive(Debug, Clone)]
pub struct Context {
    level: LogLevel,
    prefix: String,
    original_object: PathBuf,
    running_binary: PathBuf,
}

impl Context {
    pub fn new(level: LogLevel, original_object: &Path, running_binary: &Path) -> Self {
        let prefix = original_object
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upatch-diff".to_string());
        Self {
            level,
            prefix,
            original_object: original_object.to_path_buf(),
            running_binary: running_binary.to_path_buf(),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn original_object(&self) -> &Path {
        &self.original_object
    }

    pub fn running_binary(&self) -> &Path {
        &self.running_binary
    }

    /// True iff a message at `level` would be emitted under the current configuration.
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.prefix)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_is_source_basename() {
        let ctx = Context::new(
            LogLevel::Normal,
            Path::new("/tmp/build/foo.o"),
            Path::new("/proc/123/exe"),
        );
        assert_eq!(ctx.prefix(), "foo.o");
    }

    #[test]
    fn level_gating() {
        let ctx = Context::new(LogLevel::Warn, Path::new("a.o"), Path::new("b"));
        assert!(!ctx.enabled(LogLevel::Debug));
        assert!(!ctx.enabled(LogLevel::Normal));
        assert!(ctx.enabled(LogLevel::Warn));
        assert!(ctx.enabled(LogLevel::Err));
    }
}
