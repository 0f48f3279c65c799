//! Stage J: drives the whole pipeline in the order `create-diff-object.c`'s
//! `main` uses — load, bundle, correlate, compare, build the inclusion
//! closure, resolve against the running binary, and synthesize the output
//! object.

use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use crate::bundle;
use crate::compare;
use crate::config::Config;
use crate::context::{Context, LogLevel};
use crate::correlate;
use crate::error::Result;
use crate::include;
use crate::load;
use crate::model::ElfModel;
use crate::raw::{Identifier, ELFCLASS64, ELFDATA2LSB};
use crate::reloc_normalize;
use crate::resolve;
use crate::running::RunningElf;
use crate::synth;

/// Paths to the three inputs and one output a diff run needs.
pub struct Inputs {
    pub original_object: PathBuf,
    pub patched_object: PathBuf,
    pub running_binary: PathBuf,
    pub output: PathBuf,
}

/// Outcome of a run: either an output object was written, or the two objects
/// carried no functional change and nothing was written.
pub enum Outcome {
    Written(PathBuf),
    NoFunctionalChange,
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn prepare(model: &mut ElfModel) -> Result<()> {
    bundle::bundle_symbols(model);
    bundle::detect_child_functions(model);
    bundle::mark_grouped_sections(model);
    reloc_normalize::replace_section_syms(model)
}

/// Runs the full differencing pipeline and either writes a patch object or
/// reports that the two objects have no functional difference.
#[instrument(skip_all, fields(prefix = %ctx))]
pub fn run(ctx: &Context, config: &Config, inputs: &Inputs) -> Result<Outcome> {
    info!("loading original and patched objects");
    let mut orig = load::load_object(&inputs.original_object)?;
    let mut patched = load::load_object(&inputs.patched_object)?;

    prepare(&mut orig)?;
    prepare(&mut patched)?;

    correlate::correlate(&mut orig, &mut patched)?;

    let binary_basename = basename(&inputs.running_binary);
    compare::compare_sections(&mut orig, &mut patched, config, &binary_basename)?;
    compare::compare_symbols(&orig, &mut patched)?;
    compare::mark_file_symbols(&mut patched);
    drop(orig);

    include::include_standard_elements(&mut patched);
    include::include_changed_functions(&mut patched);
    include::include_new_globals(&mut patched);
    include::mark_partial_resolve_candidates(&mut patched);

    if let Some(eh_frame) = patched.section_by_name(".eh_frame") {
        if patched.section(eh_frame).include {
            debug!("rebuilding .eh_frame for the included function subset");
            crate::eh_frame::rebuild(&mut patched, eh_frame);
        }
    }

    if !include::has_functional_changes(&patched) {
        info!("no functional changes between original and patched objects");
        return Ok(Outcome::NoFunctionalChange);
    }

    include::verify_patchability(&patched)?;

    info!(running = %inputs.running_binary.display(), "resolving against the running binary");
    let relf = RunningElf::load(&inputs.running_binary)?;
    resolve::resolve_against_running(&mut patched, &relf)?;
    resolve::partly_resolve(&mut patched);

    if config.dump_kelf() {
        dump_kelf(&patched);
    }

    let ident = Identifier {
        class: ELFCLASS64,
        data: ELFDATA2LSB,
        version: 1,
        os_abi: 0,
        abi_version: 0,
    };
    let machine = patched.arch.to_machine();
    let bytes = synth::synthesize(&mut patched, ident, machine)?;
    synth::write_output(&bytes, &inputs.output)?;
    info!(output = %inputs.output.display(), "wrote patch object");
    Ok(Outcome::Written(inputs.output.clone()))
}

fn dump_kelf(model: &ElfModel) {
    for s in &model.symbols {
        if s.include {
            debug!(name = %s.name, status = ?s.status, "included symbol");
        }
    }
    for s in &model.sections {
        if s.include {
            debug!(name = %s.name, status = ?s.status, "included section");
        }
    }
}

/// Constructs the [`Context`] a run should log under, honoring `-d`'s effect
/// of raising the level to DEBUG.
pub fn build_context(level: LogLevel, inputs: &Inputs) -> Context {
    Context::new(level, &inputs.original_object, &inputs.running_binary)
}

#[cfg(test)]
mod test {
    use super::*;

    fn inputs() -> Inputs {
        Inputs {
            original_object: PathBuf::from("/build/orig.o"),
            patched_object: PathBuf::from("/build/patched.o"),
            running_binary: PathBuf::from("/proc/123/exe"),
            output: PathBuf::from("/tmp/patch.o"),
        }
    }

    #[test]
    fn basename_strips_directory_components() {
        assert_eq!(basename(Path::new("/proc/123/exe")), "exe");
        assert_eq!(basename(Path::new("redis-server")), "redis-server");
    }

    #[test]
    fn context_is_built_with_the_requested_level() {
        let ctx = build_context(LogLevel::Debug, &inputs());
        assert_eq!(ctx.level(), LogLevel::Debug);
        assert_eq!(ctx.prefix(), "orig.o");
    }
}
