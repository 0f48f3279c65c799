//! Stage F: structural comparison of correlated sections and symbols.
//! Grounded on `elf-compare.c`: two correlated entities are SAME only if
//! their headers, raw bytes, and relocation lists all agree — except for a
//! narrow `__LINE__`-only filter that tolerates a changed immediate load
//! when nothing else in the instruction stream moved.

use crate::arch::Arch;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{ElfModel, SecIdx, Status, Symbol, SymIdx};
use crate::raw::{Rela, ShFlags, STT_OBJECT};
use crate::site;

/// Two relocations are equal for comparison purposes if they carry the same
/// type and addend, and either both cache the same string-literal content or
/// (when neither targets a literal) target symbols with the same (mangled)
/// name. A relocation with a cached literal never compares equal to one
/// without one: that means the two sides resolved to different kinds of
/// target even though the raw addend happened to line up, e.g. one side's
/// merged `.rodata.str1.*` symbol moved to a non-literal section.
fn rela_equal(
    orig: &ElfModel,
    patched: &ElfModel,
    a: &Rela,
    b: &Rela,
) -> bool {
    if a.r_type != b.r_type || a.r_addend != b.r_addend {
        return false;
    }
    match (&a.string, &b.string) {
        (Some(sa), Some(sb)) => return sa == sb,
        (None, None) => {}
        _ => return false,
    }
    let sa = &orig.symbols[a.r_sym as usize];
    let sb = &patched.symbols[b.r_sym as usize];
    crate::correlate::mangled_strcmp(&sa.name, &sb.name)
}

fn compare_rela_sections(
    orig: &ElfModel,
    patched: &ElfModel,
    orig_rela: Option<SecIdx>,
    patched_rela: Option<SecIdx>,
) -> bool {
    match (orig_rela, patched_rela) {
        (None, None) => true,
        (Some(o), Some(p)) => {
            let oa = orig.section(o).relas();
            let pa = patched.section(p).relas();
            oa.len() == pa.len()
                && oa.iter().zip(pa.iter()).all(|(a, b)| rela_equal(orig, patched, a, b))
        }
        _ => false,
    }
}

/// True iff the only difference between `a` and `b` is the immediate operand
/// of a single load-immediate instruction that is itself followed by a
/// relocation targeting a known `__LINE__`-reporting function, matching the
/// reference tool's tolerance for a source-line renumbering that only
/// perturbs an inlined `__LINE__` constant, not the function's actual
/// behavior. `relas` is the patched section's own relocation list (not the
/// containing function's name): the whitelist check is against the
/// relocation's *target*, e.g. the `_serverPanic` a `mov $__LINE__, %esi`
/// is about to be passed into, not whatever function happens to own this
/// section.
fn line_macro_change_only(
    arch: Arch,
    config: &Config,
    binary_basename: &str,
    relas: &[Rela],
    patched: &ElfModel,
    a: &[u8],
    b: &[u8],
) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut offset = 0usize;
    let mut saw_difference = false;
    let mut diff_end = 0usize;
    while offset < a.len() {
        let Ok(len) = crate::arch::insn_length(arch, a, offset) else {
            return false;
        };
        let len = len.min(a.len() - offset);
        if a[offset..offset + len] != b[offset..offset + len] {
            if saw_difference {
                return false;
            }
            if !crate::arch::insn_is_load_immediate(arch, a, offset) {
                return false;
            }
            saw_difference = true;
            diff_end = offset + len;
        }
        offset += len.max(1);
    }
    if !saw_difference {
        return false;
    }
    // The relocation for the call the line-macro-carrying instruction feeds
    // is whichever one sits at or after the end of the differing
    // instruction.
    let Some(rela) = relas.iter().filter(|r| r.r_offset as usize >= diff_end).min_by_key(|r| r.r_offset) else {
        return false;
    };
    let Some(target) = patched.symbols.get(rela.r_sym as usize) else {
        return false;
    };
    config.line_macro_whitelisted(binary_basename, &target.name)
}

/// True for sections whose content is allowed to vary without the change
/// counting as a "real" difference: link-time notes and the
/// architecture-specific patchable-function-entry table are rebuilt by the
/// toolchain on every compile and carry no patch-relevant information.
fn is_forced_same_section(name: &str) -> bool {
    name.starts_with(".note") || name.contains("__patchable_function_entries")
}

fn is_text_or_string_section(flags: ShFlags) -> bool {
    flags.contains(ShFlags::EXECINSTR) || flags.contains(ShFlags::STRINGS)
}

fn compare_section_pair(
    orig: &ElfModel,
    patched: &ElfModel,
    arch: Arch,
    config: &Config,
    binary_basename: &str,
    o: SecIdx,
    p: SecIdx,
) -> Result<Status> {
    let os = orig.section(o);
    let ps = patched.section(p);

    if os.sh_type != ps.sh_type || os.sh_flags != ps.sh_flags || os.sh_entsize != ps.sh_entsize {
        return Err(Error::Comparison {
            site: site!("compare_section_pair"),
            message: format!("section {} changed type/flags/entsize across versions", ps.name),
        });
    }
    if !is_text_or_string_section(os.sh_flags) && os.sh_addralign != ps.sh_addralign {
        return Err(Error::Comparison {
            site: site!("compare_section_pair"),
            message: format!("section {} changed addralign across versions", ps.name),
        });
    }
    if is_forced_same_section(&ps.name) {
        return Ok(Status::Same);
    }
    if os.size != ps.size
        || os.data.len() != ps.data.len()
        || os.rela_section().is_some() != ps.rela_section().is_some()
    {
        return Ok(Status::Changed);
    }

    let relas_equal = compare_rela_sections(orig, patched, os.rela_section(), ps.rela_section());
    if os.data == ps.data && relas_equal {
        return Ok(Status::Same);
    }
    if relas_equal {
        let relas: &[Rela] = ps.rela_section().map(|r| patched.section(r).relas()).unwrap_or(&[]);
        if line_macro_change_only(arch, config, binary_basename, relas, patched, &os.data, &ps.data) {
            return Ok(Status::Same);
        }
    }
    Ok(Status::Changed)
}

/// Classifies every section in `patched` as SAME, CHANGED, or NEW against
/// its twin in `orig` (absent twin => NEW), and mirrors the classification
/// back onto `orig`'s twin for SAME/CHANGED sections.
pub fn compare_sections(
    orig: &mut ElfModel,
    patched: &mut ElfModel,
    config: &Config,
    binary_basename: &str,
) -> Result<()> {
    let arch = patched.arch;
    let pairs: Vec<(SecIdx, SecIdx)> = patched
        .sections
        .iter()
        .filter_map(|s| s.twin.map(|t| (t, s.index)))
        .collect();

    for (o, p) in pairs {
        let status = compare_section_pair(orig, patched, arch, config, binary_basename, o, p)?;
        patched.section_mut(p).status = status;
        orig.section_mut(o).status = status;
    }
    for s in &mut patched.sections {
        if s.twin.is_none() {
            s.status = Status::New;
        }
    }
    Ok(())
}

/// Compares one correlated symbol pair, raising `Error::Comparison` for the
/// mismatches the comparator treats as fatal (info bits, owning-section
/// presence or twin, OBJECT size) rather than folding them into CHANGED.
fn compare_symbol_pair(orig: &ElfModel, patched: &ElfModel, o: &Symbol, p: &Symbol) -> Result<Status> {
    if o.bind() != p.bind() || o.kind() != p.kind() {
        return Err(Error::Comparison {
            site: site!("compare_symbol_pair"),
            message: format!("symbol {} changed bind/kind across versions", p.name),
        });
    }
    match (o.section, p.section) {
        (Some(os), Some(ps)) => {
            if orig.section(os).twin != Some(ps) {
                return Err(Error::Comparison {
                    site: site!("compare_symbol_pair"),
                    message: format!(
                        "symbol {}'s owning section did not correlate to its twin's owning section",
                        p.name
                    ),
                });
            }
            if p.kind() == STT_OBJECT && o.raw.st_size != p.raw.st_size {
                return Err(Error::Comparison {
                    site: site!("compare_symbol_pair"),
                    message: format!("OBJECT symbol {} changed size across versions", p.name),
                });
            }
            if orig.section(os).status == Status::Same && patched.section(ps).status == Status::Same {
                Ok(Status::Same)
            } else {
                Ok(Status::Changed)
            }
        }
        (None, None) => Ok(Status::Same),
        _ => Err(Error::Comparison {
            site: site!("compare_symbol_pair"),
            message: format!("symbol {} changed owning-section presence across versions", p.name),
        }),
    }
}

/// Classifies every symbol in `patched` against its twin: SAME iff the raw
/// headers match and the owning section (if any) compared SAME; absent twin
/// => NEW.
pub fn compare_symbols(orig: &ElfModel, patched: &mut ElfModel) -> Result<()> {
    for pi in 0..patched.symbols.len() {
        let twin = patched.symbols[pi].twin;
        let status = match twin {
            None => Status::New,
            Some(oi) => {
                let o = &orig.symbols[oi.0];
                let p = &patched.symbols[pi];
                compare_symbol_pair(orig, patched, o, p)?
            }
        };
        patched.symbols[pi].status = status;
    }
    Ok(())
}

/// Propagates CHANGED status up to the owning `STT_FILE` symbol: once any
/// symbol in a translation unit changed, the compilation-unit marker symbol
/// itself is considered changed, matching `mark_file_symbols`' role of
/// making later "did this translation unit change at all" checks a single
/// symbol lookup.
pub fn mark_file_symbols(model: &mut ElfModel) {
    let mut current_file: Option<SymIdx> = None;
    let mut changed_files = Vec::new();
    for sym in &model.symbols {
        if sym.is_file() {
            current_file = Some(sym.index);
            continue;
        }
        if sym.status == Status::Changed {
            if let Some(f) = current_file {
                changed_files.push(f);
            }
        }
    }
    for f in changed_files {
        model.symbol_mut(f).status = Status::Changed;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::Arch;
    use crate::raw::{Sym, STB_GLOBAL, STT_FUNC};
    use std::borrow::Cow;
    use std::collections::{HashMap, HashSet};

    fn helper_symbol(name: &'static str) -> Symbol<'static> {
        Symbol {
            name: Cow::Borrowed(name),
            index: SymIdx(0),
            raw: Sym::builder()
                .st_name(0)
                .st_info(Sym::st_info_from(STB_GLOBAL, STT_FUNC))
                .st_other(0)
                .st_shndx(0)
                .st_value(0)
                .st_size(0)
                .build(),
            section: None,
            parent: None,
            children: Vec::new(),
            status: Status::Same,
            include: false,
            strip: crate::model::Strip::Default,
            twin: None,
            relf_match: None,
            needs_partial_resolve: false,
        }
    }

    #[test]
    fn identical_bytes_never_count_as_line_macro_changed() {
        let a = [0x90u8, 0x90, 0x90];
        let b = [0x90u8, 0x90, 0x90];
        let model = ElfModel::new(Arch::X86_64);
        assert!(!line_macro_change_only(Arch::X86_64, &Config::default(), "a.out", &[], &model, &a, &b));
    }

    #[test]
    fn line_macro_tolerance_checks_the_relocation_target_not_the_owning_function() {
        // be 2a 00 00 00       mov    $0x2a,%esi
        // e8 00 00 00 00       call   _serverPanic
        let a = [0xbeu8, 0x2a, 0x00, 0x00, 0x00, 0xe8, 0x00, 0x00, 0x00, 0x00];
        let b = [0xbeu8, 0x2b, 0x00, 0x00, 0x00, 0xe8, 0x00, 0x00, 0x00, 0x00];

        let mut model = ElfModel::new(Arch::X86_64);
        let helper = model.push_symbol(helper_symbol("_serverPanic"));
        let other = model.push_symbol(helper_symbol("do_work"));
        let relas = vec![Rela::from_info(5, ((helper.0 as u64) << 32) | 4, 0)];

        let mut table = HashMap::new();
        table.insert("redis-server".to_string(), HashSet::from(["_serverPanic".to_string()]));
        let config = Config::builder().line_whitelist(table).build();

        assert!(line_macro_change_only(Arch::X86_64, &config, "redis-server", &relas, &model, &a, &b));
        assert!(!line_macro_change_only(Arch::X86_64, &Config::default(), "redis-server", &relas, &model, &a, &b));

        let relas_other = vec![Rela::from_info(5, ((other.0 as u64) << 32) | 4, 0)];
        assert!(!line_macro_change_only(Arch::X86_64, &config, "redis-server", &relas_other, &model, &a, &b));
    }

    #[test]
    fn line_macro_tolerance_requires_a_following_relocation() {
        // Same immediate-only difference, but no relocation anywhere past it.
        let a = [0xbeu8, 0x2a, 0x00, 0x00, 0x00];
        let b = [0xbeu8, 0x2b, 0x00, 0x00, 0x00];
        let model = ElfModel::new(Arch::X86_64);
        let mut table = HashMap::new();
        table.insert("redis-server".to_string(), HashSet::from(["_serverPanic".to_string()]));
        let config = Config::builder().line_whitelist(table).build();
        assert!(!line_macro_change_only(Arch::X86_64, &config, "redis-server", &[], &model, &a, &b));
    }

    #[test]
    fn line_macro_tolerance_rejects_second_difference() {
        let a = [0xbeu8, 0x2a, 0x00, 0x00, 0x00, 0x90];
        let b = [0xbeu8, 0x2b, 0x00, 0x00, 0x00, 0xcc];
        let model = ElfModel::new(Arch::X86_64);
        let mut table = HashMap::new();
        table.insert("vmlinux".to_string(), HashSet::from(["do_work".to_string()]));
        let config = Config::builder().line_whitelist(table).build();
        assert!(!line_macro_change_only(Arch::X86_64, &config, "vmlinux", &[], &model, &a, &b));
    }
}
