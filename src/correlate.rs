//! Stage E: correlates sections and symbols between the original and patched
//! object models by name, tolerating the numeric suffix the compiler
//! appends to file-local symbols/sections across separate compilation units
//! (`.123`-style disambiguation), and links the result via `twin`.

use crate::error::{Error, Result};
use crate::model::{ElfModel, SecIdx, SymIdx};
use crate::site;

/// Compares two compiler-mangled names for the purpose of correlation.
///
/// Whenever the literal substring `.str1.` occurs anywhere in either name —
/// the marker GCC uses for mergeable string-literal sections
/// (`.rodata.str1.1`, `.rodata.str1.8`, …) — comparison is verbatim, because
/// the trailing digits there are part of the alignment-class name, not a
/// per-translation-unit disambiguator. Otherwise, exactly one trailing
/// `.<digits>` run is stripped from each name before comparing, since that
/// is the shape the compiler uses to disambiguate same-named file-local
/// symbols pulled from different translation units.
pub fn mangled_strcmp(a: &str, b: &str) -> bool {
    if a.contains(".str1.") || b.contains(".str1.") {
        return a == b;
    }
    strip_one_trailing_numeric_suffix(a) == strip_one_trailing_numeric_suffix(b)
}

fn strip_one_trailing_numeric_suffix(name: &str) -> &str {
    if let Some(dot) = name.rfind('.') {
        let (head, tail) = name.split_at(dot);
        let digits = &tail[1..];
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            return head;
        }
    }
    name
}

/// Correlates sections by name (via [`mangled_strcmp`]), recording each
/// match as a mutual `twin` link. A name with more than one candidate on
/// either side is resolved by positional order, matching the reference
/// tool's behavior for repeated anonymous sections such as multiple
/// `.rodata.str1.1` occurrences once those compare verbatim-equal.
pub fn correlate_sections(orig: &mut ElfModel, patched: &mut ElfModel) -> Result<()> {
    let mut patched_used = vec![false; patched.sections.len()];
    for oi in 0..orig.sections.len() {
        let oname = orig.sections[oi].name.to_string();
        if let Some(pi) = (0..patched.sections.len()).find(|&pi| {
            !patched_used[pi] && mangled_strcmp(&oname, &patched.sections[pi].name)
        }) {
            patched_used[pi] = true;
            orig.sections[oi].twin = Some(SecIdx(pi));
            patched.sections[pi].twin = Some(SecIdx(oi));
        }
    }
    Ok(())
}

/// Correlates symbols by name, bind and kind (via [`mangled_strcmp`] on the
/// name), recording mutual `twin` links the same way section correlation
/// does.
pub fn correlate_symbols(orig: &mut ElfModel, patched: &mut ElfModel) -> Result<()> {
    let mut patched_used = vec![false; patched.symbols.len()];
    for oi in 0..orig.symbols.len() {
        let (oname, obind, okind) = {
            let s = &orig.symbols[oi];
            (s.name.to_string(), s.bind(), s.kind())
        };
        if let Some(pi) = (0..patched.symbols.len()).find(|&pi| {
            if patched_used[pi] {
                return false;
            }
            let p = &patched.symbols[pi];
            p.bind() == obind && p.kind() == okind && mangled_strcmp(&oname, &p.name)
        }) {
            patched_used[pi] = true;
            orig.symbols[oi].twin = Some(SymIdx(pi));
            patched.symbols[pi].twin = Some(SymIdx(oi));
        }
    }
    Ok(())
}

/// Correlates file-local (`static`) data-object symbols that correlation by
/// name alone cannot resolve reliably because the compiler renames them
/// per-translation-unit merge order: falls back to matching by owning
/// section twin plus relative position among same-named candidates within
/// that section.
pub fn correlate_static_local_variables(orig: &mut ElfModel, patched: &mut ElfModel) -> Result<()> {
    let unresolved: Vec<SymIdx> = orig
        .symbols
        .iter()
        .filter(|s| {
            s.twin.is_none()
                && s.kind() == crate::raw::STT_OBJECT
                && s.bind() == crate::raw::STB_LOCAL
        })
        .map(|s| s.index)
        .collect();

    for sym_idx in unresolved {
        let Some(sec) = orig.symbol(sym_idx).section else {
            continue;
        };
        let Some(sec_twin) = orig.section(sec).twin else {
            continue;
        };
        let oname = orig.symbol(sym_idx).name.to_string();
        let candidate = patched.symbols.iter().find(|p| {
            p.twin.is_none()
                && p.section == Some(sec_twin)
                && p.kind() == crate::raw::STT_OBJECT
                && p.bind() == crate::raw::STB_LOCAL
                && mangled_strcmp(&oname, &p.name)
        });
        if let Some(p) = candidate {
            let pidx = p.index;
            orig.symbol_mut(sym_idx).twin = Some(pidx);
            patched.symbol_mut(pidx).twin = Some(sym_idx);
        }
    }
    Ok(())
}

/// Runs the full correlation pass in the order the reference pipeline uses
/// it: sections, then symbols, then the static-local fallback.
pub fn correlate(orig: &mut ElfModel, patched: &mut ElfModel) -> Result<()> {
    if orig.arch != patched.arch {
        return Err(Error::Arch {
            site: site!("correlate"),
            message: "original and patched objects target different architectures".to_string(),
        });
    }
    correlate_sections(orig, patched)?;
    correlate_symbols(orig, patched)?;
    correlate_static_local_variables(orig, patched)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn str1_sections_compare_verbatim() {
        assert!(mangled_strcmp(".rodata.str1.1", ".rodata.str1.1"));
        assert!(!mangled_strcmp(".rodata.str1.1", ".rodata.str1.8"));
    }

    #[test]
    fn trailing_numeric_suffix_is_stripped_once() {
        assert!(mangled_strcmp("helper.123", "helper.456"));
        assert!(mangled_strcmp("helper", "helper.7"));
        // Stripping is applied once per name, so this collapses both to "helper.1".
        assert!(mangled_strcmp("helper.1.2", "helper.1.3"));
    }

    #[test]
    fn names_without_suffix_must_match_exactly() {
        assert!(!mangled_strcmp("helper", "helper_other"));
    }

    #[test]
    fn only_one_trailing_suffix_is_stripped() {
        // The final component isn't numeric, so nothing is stripped and the
        // full names are compared verbatim.
        assert!(!mangled_strcmp("helper.1.bar", "helper.2.bar"));
    }
}
