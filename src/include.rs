//! Stage G: computes the transitive inclusion closure of every changed or
//! new element, then audits the result for changes this patching mechanism
//! cannot express.
//!
//! Grounded on `include_standard_elements`, `include_changed_functions`,
//! `include_new_globals`, `include_symbol`/`include_section`, and
//! `verify_patchability`.

use crate::error::{Error, Result};
use crate::model::{ElfModel, SecIdx, Status, SymIdx};
use crate::raw::{STB_GLOBAL, STB_WEAK, STT_FUNC};
use crate::site;

/// Marks the NULL symbol included; every other "always present" element is
/// synthesized directly by the output stage rather than carried through the
/// inclusion closure.
pub fn include_standard_elements(model: &mut ElfModel) {
    if !model.symbols.is_empty() {
        model.symbols[0].include = true;
    }
}

/// Includes `sym`, transitively including its owning section and recursing
/// into every relocation target reachable from that section, matching
/// `include_symbol`/`include_section`'s mutual recursion.
pub fn include_symbol(model: &mut ElfModel, sym: SymIdx) {
    if model.symbol(sym).include {
        return;
    }
    model.symbol_mut(sym).include = true;
    if let Some(sec) = model.symbol(sym).section {
        include_section(model, sec);
    }
    let children = model.symbol(sym).children.clone();
    for child in children {
        include_symbol(model, child);
    }
}

/// Includes `sec`, its section symbol, its bundled symbol, and every target
/// symbol of every relocation against it — the closure invariant that
/// guarantees the output object never references a symbol it doesn't also
/// carry.
pub fn include_section(model: &mut ElfModel, sec: SecIdx) {
    if model.section(sec).include {
        return;
    }
    model.section_mut(sec).include = true;

    if let Some(secsym) = model.section(sec).secsym() {
        model.symbol_mut(secsym).include = true;
    }
    if let Some(bundled) = model.section(sec).bundled_sym() {
        include_symbol(model, bundled);
    }

    if let Some(rela_idx) = model.section(sec).rela_section() {
        model.section_mut(rela_idx).include = true;
        let targets: Vec<SymIdx> = model
            .section(rela_idx)
            .relas()
            .iter()
            .map(|r| SymIdx(r.r_sym as usize))
            .collect();
        for target in targets {
            include_symbol(model, target);
        }
    }
}

/// Includes every CHANGED `FUNC` symbol, every CHANGED exception-handling
/// section's bundled symbol, and every `STT_FILE` symbol — file symbols
/// carry no code themselves but are needed so debug-info consumers can still
/// resolve which translation unit an included function came from.
pub fn include_changed_functions(model: &mut ElfModel) {
    let mut to_include = Vec::new();
    for sym in &model.symbols {
        if sym.status != Status::Changed {
            continue;
        }
        if sym.kind() == STT_FUNC || sym.is_file() {
            to_include.push(sym.index);
        }
    }
    for sym in to_include {
        include_symbol(model, sym);
    }
}

/// Includes every NEW symbol with GLOBAL or WEAK binding, together with its
/// owning section — a brand new externally visible function/object the
/// patched binary must be able to resolve against.
pub fn include_new_globals(model: &mut ElfModel) {
    let mut to_include = Vec::new();
    for sym in &model.symbols {
        if sym.status == Status::New && matches!(sym.bind(), STB_GLOBAL | STB_WEAK) {
            to_include.push(sym.index);
        }
    }
    for sym in to_include {
        include_symbol(model, sym);
    }
}

/// True iff the closure computed above contains at least one functional
/// change — the "no functional changes" early exit in the orchestrator
/// checks this before doing any further work.
pub fn has_functional_changes(model: &ElfModel) -> bool {
    model.symbols.iter().any(|s| {
        s.include && s.index != crate::model::NULL_SYM && !s.is_file()
    })
}

/// For every CHANGED LOCAL symbol that an included, changed function
/// references but that was not itself included (because it didn't change),
/// marks it for partial resolution against the running binary instead of
/// static linking — mirroring `include_special_local_section`'s
/// `SYM_OTHER`-tagged placeholder entries.
pub fn mark_partial_resolve_candidates(model: &mut ElfModel) {
    let referenced: Vec<SymIdx> = model
        .sections
        .iter()
        .filter(|s| s.include && s.is_rela())
        .flat_map(|s| s.relas().iter().map(|r| SymIdx(r.r_sym as usize)))
        .collect();

    for sym in referenced {
        let s = model.symbol(sym);
        if !s.include && s.status != Status::New {
            model.symbol_mut(sym).needs_partial_resolve = true;
            model.symbol_mut(sym).include = true;
        }
    }
}

/// Audits the inclusion closure for changes this engine cannot express as a
/// live patch, failing fast with a `Patchability` error on the first one
/// found.
pub fn verify_patchability(model: &ElfModel) -> Result<()> {
    for sec in &model.sections {
        if !sec.include || sec.status != Status::Changed {
            continue;
        }
        if sec.grouped {
            return Err(Error::Patchability {
                site: site!("verify_patchability"),
                message: format!(
                    "section {} is a member of a COMDAT group and cannot be hot-patched",
                    sec.name
                ),
            });
        }
        if sec.sh_type == crate::raw::SHT_NOBITS {
            return Err(Error::Patchability {
                site: site!("verify_patchability"),
                message: format!(".bss section {} changed; uninitialized data layout changes are not patchable", sec.name),
            });
        }
    }

    for sym in &model.symbols {
        if !sym.include || sym.status != Status::Changed {
            continue;
        }
        if sym.kind() == crate::raw::STT_OBJECT && sym.bind() == crate::raw::STB_GLOBAL {
            return Err(Error::Patchability {
                site: site!("verify_patchability"),
                message: format!(
                    "global data object {} changed; global data changes are not patchable",
                    sym.name
                ),
            });
        }
        if let Some(parent) = sym.parent {
            if !model.symbol(parent).include {
                return Err(Error::Patchability {
                    site: site!("verify_patchability"),
                    message: format!(
                        "{} is a split cold/part partition of {}, which was not included",
                        sym.name,
                        model.symbol(parent).name
                    ),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::Arch;
    use crate::model::{Section, SectionKind, Strip, Symbol};
    use crate::raw::{ShFlags, Sym, STB_LOCAL, STT_FUNC};
    use std::borrow::Cow;

    fn push_func(model: &mut ElfModel<'static>, name: &'static str, status: Status) -> SymIdx {
        let sec = model.push_section(Section {
            name: Cow::Borrowed(name),
            index: SecIdx(0),
            sh_type: crate::raw::SHT_PROGBITS,
            sh_flags: ShFlags::ALLOC | ShFlags::EXECINSTR,
            sh_entsize: 0,
            sh_addralign: 1,
            size: 4,
            data: vec![0x90; 4],
            status,
            include: false,
            ignore: false,
            grouped: false,
            twin: None,
            kind: SectionKind::Content { secsym: None, sym: None, rela: None },
        });
        let sym = model.push_symbol(Symbol {
            name: Cow::Borrowed(name),
            index: SymIdx(0),
            raw: Sym::builder()
                .st_name(0)
                .st_info(Sym::st_info_from(STB_LOCAL, STT_FUNC))
                .st_other(0)
                .st_shndx(1)
                .st_value(0)
                .st_size(4)
                .build(),
            section: Some(sec),
            parent: None,
            children: Vec::new(),
            status,
            include: false,
            strip: Strip::Default,
            twin: None,
            relf_match: None,
            needs_partial_resolve: false,
        });
        model.section_mut(sec).set_bundled_sym(sym);
        sym
    }

    #[test]
    fn closure_includes_owning_section() {
        let mut model = ElfModel::new(Arch::X86_64);
        // symbol 0 is NULL in a real object; push a placeholder so indices line up.
        model.push_symbol(Symbol {
            name: Cow::Borrowed(""),
            index: SymIdx(0),
            raw: Sym::builder().st_name(0).st_info(0).st_other(0).st_shndx(0).st_value(0).st_size(0).build(),
            section: None,
            parent: None,
            children: Vec::new(),
            status: Status::Same,
            include: false,
            strip: Strip::Default,
            twin: None,
            relf_match: None,
            needs_partial_resolve: false,
        });
        let f = push_func(&mut model, ".text.foo", Status::Changed);
        include_changed_functions(&mut model);
        assert!(model.symbol(f).include);
        let sec = model.symbol(f).section.unwrap();
        assert!(model.section(sec).include);
    }

    #[test]
    fn grouped_changed_section_fails_patchability() {
        let mut model = ElfModel::new(Arch::X86_64);
        let f = push_func(&mut model, ".text.foo", Status::Changed);
        let sec = model.symbol(f).section.unwrap();
        model.section_mut(sec).grouped = true;
        model.symbol_mut(f).include = true;
        model.section_mut(sec).include = true;
        assert!(verify_patchability(&model).is_err());
    }

    #[test]
    fn ungrouped_changed_function_passes() {
        let mut model = ElfModel::new(Arch::X86_64);
        let f = push_func(&mut model, ".text.foo", Status::Changed);
        let sec = model.symbol(f).section.unwrap();
        model.symbol_mut(f).include = true;
        model.section_mut(sec).include = true;
        assert!(verify_patchability(&model).is_ok());
    }
}
