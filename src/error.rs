//! Error taxonomy for the patch-differencing engine.
//!
//! Every variant carries the `file`/`function`/`line` triple identifying
//! where the failure was detected, so the `Display` impl can always render
//! the mandated `ERROR: <file>: <fn>: <line>: <message>` shape without the
//! caller having to format anything itself.

use std::fmt;

/// Where in the pipeline an error was raised. Filled in with `Site::here!()`
/// at the call site, mirroring the original tool's `__FILE__`/`__func__`/`__LINE__`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Site {
    pub file: &'static str,
    pub function: &'static str,
    pub line: u32,
}

impl Site {
    pub const fn new(file: &'static str, function: &'static str, line: u32) -> Self {
        Self {
            file,
            function,
            line,
        }
    }
}

/// Captures `Site::new(file!(), "enclosing function", line!())` at the call site.
///
/// Rust has no `__func__` equivalent reachable from a macro without nightly,
/// so callers pass the enclosing function's name explicitly.
#[macro_export]
macro_rules! site {
    ($func:expr) => {
        $crate::error::Site::new(file!(), $func, line!())
    };
}

#[derive(thiserror::Error, Debug)]
/// Fatal errors raised while differencing two ELF objects against a running binary.
///
/// Every variant is fatal at the point it is detected: there is no
/// recoverable-error path in this pipeline, matching the original tool's
/// abort-on-first-error behavior.
pub enum Error {
    /// Bad command-line invocation: missing/unreadable argument.
    #[error("{site}: {message}")]
    Usage { site: Site, message: String },

    /// Malformed or unsupported ELF input (bad header, truncated section, non-ET_REL, non-zero program headers).
    #[error("{site}: {message}")]
    Format { site: Site, message: String },

    /// Unsupported or mismatched target architecture.
    #[error("{site}: {message}")]
    Arch { site: Site, message: String },

    /// Correlation between the original and patched objects failed or produced an ambiguous match.
    #[error("{site}: {message}")]
    Correlation { site: Site, message: String },

    /// Structural comparison of correlated elements could not be completed.
    #[error("{site}: {message}")]
    Comparison { site: Site, message: String },

    /// A changed element fails the patchability audit (unsupported data/section/symbol change).
    #[error("{site}: {message}")]
    Patchability { site: Site, message: String },

    /// A symbol required for partial resolution could not be found or was ambiguous in the running binary.
    #[error("{site}: {message}")]
    Resolution { site: Site, message: String },

    /// Underlying I/O failure (open/read/write/mmap) on one of the three input files or the output file.
    #[error("{site}: {message}")]
    Io {
        site: Site,
        message: String,
        #[source]
        source: std::io::Error,
    },
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERROR: {}: {}: {}", self.file, self.function, self.line)
    }
}

impl Error {
    pub fn io(site: Site, message: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            site,
            message: message.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_matches_mandated_shape() {
        let err = Error::Format {
            site: site!("load_test"),
            message: "truncated section header table".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.starts_with("ERROR: "));
        assert!(rendered.contains("load_test"));
        assert!(rendered.ends_with("truncated section header table"));
    }

    #[test]
    fn every_variant_is_non_empty() {
        let sites = [
            Error::Usage {
                site: site!("f"),
                message: "missing -s".into(),
            },
            Error::Arch {
                site: site!("f"),
                message: "unsupported machine".into(),
            },
        ];
        for e in sites {
            assert!(!e.to_string().is_empty());
        }
    }
}
