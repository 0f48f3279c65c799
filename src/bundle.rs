//! Stage C: symbol bundling. Groups each FUNC/OBJECT symbol with the single
//! section the compiler emitted it into under `-ffunction-sections`/
//! `-fdata-sections`, links `.cold`/`.part` split subfunctions back to their
//! parent, and marks `SHT_GROUP` (COMDAT) members.

use crate::model::{ElfModel, SecIdx, SymIdx};
use crate::raw::{STB_GLOBAL, STB_LOCAL, STB_WEAK, STT_FUNC, STT_OBJECT};

/// Section name prefixes a bundleable symbol's owning section is expected to
/// carry, depending on the symbol's kind.
const FUNC_PREFIXES: &[&str] = &[".text.", ".text.unlikely.", ".text.hot.", ".text.startup."];
const OBJECT_PREFIXES: &[&str] = &[".data.", ".data.rel.", ".rodata.", ".bss."];

/// True iff `section_name` is the section a compiler would have emitted
/// `symbol_name` into under per-function/per-data sectioning. `.cold` split
/// partitions are the one irregular case: the compiler keeps the
/// `.text.unlikely.<name>` section name but appends `.cold` (or a numeric
/// `.cold.N` suffix) only to the *symbol* name, so the plain prefix-stripped
/// comparison has to tolerate a trailing `.cold[.N]` on the symbol side.
pub fn is_bundleable(section_name: &str, symbol_name: &str, is_func: bool) -> bool {
    let prefixes: &[&str] = if is_func { FUNC_PREFIXES } else { OBJECT_PREFIXES };
    for prefix in prefixes {
        if let Some(suffix) = section_name.strip_prefix(prefix) {
            if suffix == symbol_name {
                return true;
            }
            if let Some(base) = symbol_name.strip_suffix(".cold").or_else(|| {
                symbol_name.rsplit_once(".cold.").map(|(b, _)| b)
            }) {
                if suffix == base {
                    return true;
                }
            }
        }
    }
    false
}

fn is_exception_section(name: &str) -> bool {
    name == "__ex_table" || name.starts_with(".discard.addressable")
}

/// For every FUNC/OBJECT symbol, if its owning section is bundleable for it,
/// record it as that section's bundled symbol. Exception-table-style
/// sections bundle their lone symbol unconditionally, since there is no
/// per-function naming convention to match against.
pub fn bundle_symbols(model: &mut ElfModel) {
    let candidates: Vec<(SymIdx, SecIdx, bool)> = model
        .symbols
        .iter()
        .filter_map(|sym| {
            let kind = sym.kind();
            if kind != STT_FUNC && kind != STT_OBJECT {
                return None;
            }
            if !matches!(sym.bind(), STB_LOCAL | STB_GLOBAL | STB_WEAK) {
                return None;
            }
            sym.section.map(|sec| (sym.index, sec, kind == STT_FUNC))
        })
        .collect();

    for (sym_idx, sec_idx, is_func) in candidates {
        let section_name = model.section(sec_idx).name.to_string();
        let symbol_name = model.symbol(sym_idx).name.to_string();
        if is_exception_section(&section_name) || is_bundleable(&section_name, &symbol_name, is_func) {
            model.section_mut(sec_idx).set_bundled_sym(sym_idx);
        }
    }
}

/// Links `.cold`/`.part` split subfunctions to their parent by name: a
/// function symbol named `foo.cold` or `foo.cold.3` (emitted for the
/// unlikely-taken half of `foo` when the compiler splits it) or `foo.part.2`
/// (an outlined partial-inlining fragment of `foo`) is linked as a child of
/// the symbol named plain `foo`, if one exists.
pub fn detect_child_functions(model: &mut ElfModel) {
    let mut links = Vec::new();
    for sym in &model.symbols {
        if sym.kind() != STT_FUNC {
            continue;
        }
        let name = sym.name.as_ref();
        let Some(base) = split_child_suffix(name) else {
            continue;
        };
        if let Some(parent_idx) = model
            .symbols
            .iter()
            .find(|s| s.kind() == STT_FUNC && s.name == base)
            .map(|s| s.index)
        {
            if parent_idx != sym.index {
                links.push((parent_idx, sym.index));
            }
        }
    }
    for (parent, child) in links {
        model.symbol_mut(child).parent = Some(parent);
        model.symbol_mut(parent).children.push(child);
    }
}

/// Strips a `.cold[.N]` or `.part.N` suffix from a mangled function name,
/// returning the parent's name, or `None` if the name carries neither.
fn split_child_suffix(name: &str) -> Option<&str> {
    for marker in [".cold", ".part"] {
        if let Some(pos) = name.find(marker) {
            return Some(&name[..pos]);
        }
    }
    None
}

/// `.gnu.warning.*` sections are synthesized by the linker into executable
/// images to carry link-time warning text; they never appear in a
/// relocatable object and any symbol that appears to reference one by name
/// in the running binary should be treated as linker-discarded, not missing.
pub fn discarded_sym(name: &str) -> bool {
    name.starts_with(".gnu.warning.")
}

/// Parses an `SHT_GROUP` section's raw word array (first word is the group
/// flags, which this only needs to skip) and marks every member section
/// `grouped`. Member words are raw file section-header indices, which
/// `load` re-densifies away from the model's own `SecIdx` space, so they are
/// translated through the model's raw-index map rather than compared
/// directly against `SecIdx`.
pub fn mark_grouped_sections(model: &mut ElfModel) {
    let group_sections: Vec<SecIdx> = model
        .sections
        .iter()
        .filter(|s| s.sh_type == crate::raw::SHT_GROUP)
        .map(|s| s.index)
        .collect();

    for group_idx in group_sections {
        let data = model.section(group_idx).data.clone();
        let member_raw_indices: Vec<u32> = data
            .chunks_exact(4)
            .skip(1)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        for raw_idx in member_raw_indices {
            if let Some(member) = model.section_by_raw_index(raw_idx as usize) {
                model.section_mut(member).grouped = true;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_bundle_matches_prefix_plus_name() {
        assert!(is_bundleable(".text.do_work", "do_work", true));
        assert!(!is_bundleable(".text.do_other", "do_work", true));
    }

    #[test]
    fn cold_partition_keeps_unlikely_prefix_but_suffixes_symbol() {
        assert!(is_bundleable(".text.unlikely.do_work", "do_work.cold", true));
        assert!(is_bundleable(".text.unlikely.do_work", "do_work.cold.1", true));
        assert!(!is_bundleable(".text.unlikely.do_work", "do_other.cold", true));
    }

    #[test]
    fn object_bundle_uses_data_prefixes() {
        assert!(is_bundleable(".rodata.table", "table", false));
        assert!(is_bundleable(".bss.counter", "counter", false));
    }

    #[test]
    fn child_suffix_splitting() {
        assert_eq!(split_child_suffix("foo.cold"), Some("foo"));
        assert_eq!(split_child_suffix("foo.cold.2"), Some("foo"));
        assert_eq!(split_child_suffix("foo.part.1"), Some("foo"));
        assert_eq!(split_child_suffix("foo"), None);
    }

    #[test]
    fn discarded_sym_matches_gnu_warning_sections() {
        assert!(discarded_sym(".gnu.warning.foo"));
        assert!(!discarded_sym(".text.foo"));
    }
}
