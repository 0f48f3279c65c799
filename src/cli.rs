//! Command-line surface: `-s/-p/-r/-o` pick the three input files and the
//! output path, `-d` raises logging to debug level.

use std::path::PathBuf;

use clap::Parser;

use crate::context::LogLevel;
use crate::error::{Error, Result};
use crate::orchestrator::Inputs;
use crate::site;

/// Computes the relocatable patch object between an original and a patched
/// ELF object, against the symbols of the binary they were both built from.
#[derive(Debug, Parser)]
#[command(name = "upatch-diff", version, about)]
pub struct Args {
    /// Original (pre-patch) relocatable object.
    #[arg(short = 's', long = "source", value_name = "FILE")]
    pub original_object: PathBuf,

    /// Patched relocatable object.
    #[arg(short = 'p', long = "patched", value_name = "FILE")]
    pub patched_object: PathBuf,

    /// Running binary both objects were built from.
    #[arg(short = 'r', long = "running", value_name = "FILE")]
    pub running_binary: PathBuf,

    /// Where to write the resulting patch object.
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: PathBuf,

    /// Raise logging to debug level and dump the included-element tables
    /// before writing the output object.
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,
}

impl Args {
    /// Validates that every input path actually exists, producing the
    /// `Usage` error the orchestrator's caller reports and exits non-zero on.
    pub fn validate(&self) -> Result<()> {
        for (flag, path) in [
            ("-s", &self.original_object),
            ("-p", &self.patched_object),
            ("-r", &self.running_binary),
        ] {
            if !path.exists() {
                return Err(Error::Usage {
                    site: site!("Args::validate"),
                    message: format!("{flag}: no such file: {}", path.display()),
                });
            }
        }
        Ok(())
    }

    pub fn log_level(&self) -> LogLevel {
        if self.debug {
            LogLevel::Debug
        } else {
            LogLevel::Normal
        }
    }

    pub fn into_inputs(self) -> Inputs {
        Inputs {
            original_object: self.original_object,
            patched_object: self.patched_object,
            running_binary: self.running_binary,
            output: self.output,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_short_flags() {
        let args = Args::parse_from(["upatch-diff", "-s", "a.o", "-p", "b.o", "-r", "bin", "-o", "out.o", "-d"]);
        assert_eq!(args.original_object, PathBuf::from("a.o"));
        assert_eq!(args.patched_object, PathBuf::from("b.o"));
        assert_eq!(args.running_binary, PathBuf::from("bin"));
        assert_eq!(args.output, PathBuf::from("out.o"));
        assert!(args.debug);
        assert_eq!(args.log_level(), LogLevel::Debug);
    }

    #[test]
    fn missing_source_file_fails_validation() {
        let args = Args::parse_from([
            "upatch-diff", "-s", "/no/such/file.o", "-p", "/no/such/file.o",
            "-r", "/no/such/file", "-o", "/tmp/out.o",
        ]);
        assert!(args.validate().is_err());
    }
}
