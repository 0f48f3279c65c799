//! Stage H: resolves included symbols against the running binary's symbol
//! view, producing the `(old_addr, old_size, sympos)` triple the output
//! synthesizer needs for every function/object this patch replaces.
//!
//! Grounded on `locals_match`/`find_local_syms`/`find_debug_symbol` (the
//! STT_FILE-scoped search for LOCAL symbols) and `upatch_partly_resolve`
//! (filling in value/size for symbols whose body is left for the runtime
//! loader to resolve rather than statically linked into the patch).

use crate::error::{Error, Result};
use crate::model::{ElfModel, ResolvedTarget, Status, SymIdx};
use crate::raw::{STB_LOCAL, STT_FILE};
use crate::running::{LocalMatch, RunningElf};
use crate::site;

/// Finds the `STT_FILE` symbol owning `sym` in its source model by walking
/// backward from `sym`'s index to the nearest preceding FILE symbol.
fn owning_file_name(model: &ElfModel, sym: SymIdx) -> Option<String> {
    model.symbols[..=sym.0]
        .iter()
        .rev()
        .find(|s| s.kind() == STT_FILE)
        .map(|s| s.name.to_string())
}

fn file_start(relf: &RunningElf, file_name: &str) -> Option<usize> {
    relf.symbols
        .iter()
        .find(|s| s.kind == STT_FILE && s.name == file_name)
        .map(|s| s.index)
}

/// Resolves every included, CHANGED FUNC/OBJECT symbol (and every symbol
/// flagged `needs_partial_resolve`) against the running binary, filling in
/// `relf_match`. LOCAL symbols are looked up within the STT_FILE block of
/// their owning translation unit; GLOBAL/WEAK symbols are looked up across
/// the whole binary.
pub fn resolve_against_running(model: &mut ElfModel, relf: &RunningElf) -> Result<()> {
    let candidates: Vec<SymIdx> = model
        .symbols
        .iter()
        .filter(|s| s.include && (s.status == Status::Changed || s.needs_partial_resolve))
        .map(|s| s.index)
        .collect();

    for sym_idx in candidates {
        let (name, bind, is_local) = {
            let s = model.symbol(sym_idx);
            (s.name.to_string(), s.bind(), s.is_local())
        };

        if crate::bundle::discarded_sym(&name) {
            continue;
        }

        let matched = if is_local {
            let Some(file_name) = owning_file_name(model, sym_idx) else {
                return Err(Error::Resolution {
                    site: site!("resolve_against_running"),
                    message: format!("{name} has no owning STT_FILE symbol to scope its lookup"),
                });
            };
            let Some(start) = file_start(relf, &file_name) else {
                return Err(Error::Resolution {
                    site: site!("resolve_against_running"),
                    message: format!("running binary has no translation unit named {file_name}"),
                });
            };
            match relf.lookup_in_file_block(start, &name, bind) {
                LocalMatch::Found(s) => Some((s.addr, s.size, relf.sympos(start, s.index, &name, bind))),
                LocalMatch::NotFound => {
                    return Err(Error::Resolution {
                        site: site!("resolve_against_running"),
                        message: format!("{name} not found in running binary's {file_name} symbols"),
                    })
                }
                LocalMatch::Empty => None,
            }
        } else {
            relf.lookup(&name, bind)?.map(|s| (s.addr, s.size, 0))
        };

        if let Some((addr, size, sympos)) = matched {
            model.symbol_mut(sym_idx).relf_match = Some(ResolvedTarget {
                old_addr: addr,
                old_size: size,
                sympos,
            });
        }
    }
    Ok(())
}

/// Fills in value/size for every symbol flagged `needs_partial_resolve`
/// directly from its running-binary match, leaving it otherwise undefined
/// for static-link purposes — mirroring `upatch_partly_resolve` copying
/// `symbol.symbol->addr`/`size` into `sym->sym.st_value`/`st_size` without
/// giving the symbol a defined section.
pub fn partly_resolve(model: &mut ElfModel) {
    let candidates: Vec<SymIdx> = model
        .symbols
        .iter()
        .filter(|s| s.needs_partial_resolve)
        .map(|s| s.index)
        .collect();
    for sym_idx in candidates {
        if let Some(m) = model.symbol(sym_idx).relf_match.clone() {
            let sym = model.symbol_mut(sym_idx);
            sym.raw.st_value = m.old_addr;
            sym.raw.st_size = m.old_size;
            sym.raw.st_shndx = crate::raw::SHN_UNDEF;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::Arch;
    use crate::model::{Status, Strip, Symbol};
    use crate::raw::{Sym, STB_GLOBAL, STT_FUNC};
    use crate::running::RunningSymbol;
    use std::borrow::Cow;

    fn make_running() -> RunningElf {
        RunningElf {
            is_exec: true,
            symbols: vec![
                RunningSymbol { name: "a.c".into(), index: 0, kind: STT_FILE, bind: STB_LOCAL, shndx: 0, addr: 0, size: 0 },
                RunningSymbol { name: "do_work".into(), index: 1, kind: STT_FUNC, bind: STB_GLOBAL, shndx: 1, addr: 0x4000, size: 32 },
            ],
        }
    }

    #[test]
    fn global_symbol_resolves_by_whole_binary_lookup() {
        let relf = make_running();
        let mut model = ElfModel::new(Arch::X86_64);
        let sym = model.push_symbol(Symbol {
            name: Cow::Borrowed("do_work"),
            index: SymIdx(0),
            raw: Sym::builder()
                .st_name(0)
                .st_info(Sym::st_info_from(STB_GLOBAL, STT_FUNC))
                .st_other(0)
                .st_shndx(1)
                .st_value(0)
                .st_size(32)
                .build(),
            section: None,
            parent: None,
            children: Vec::new(),
            status: Status::Changed,
            include: true,
            strip: Strip::Default,
            twin: None,
            relf_match: None,
            needs_partial_resolve: false,
        });
        resolve_against_running(&mut model, &relf).unwrap();
        let m = model.symbol(sym).relf_match.as_ref().unwrap();
        assert_eq!(m.old_addr, 0x4000);
        assert_eq!(m.old_size, 32);
        assert_eq!(m.sympos, 0);
    }

    #[test]
    fn unresolved_local_without_file_symbol_is_an_error() {
        let relf = make_running();
        let mut model = ElfModel::new(Arch::X86_64);
        model.push_symbol(Symbol {
            name: Cow::Borrowed("static_helper"),
            index: SymIdx(0),
            raw: Sym::builder()
                .st_name(0)
                .st_info(Sym::st_info_from(STB_LOCAL, STT_FUNC))
                .st_other(0)
                .st_shndx(1)
                .st_value(0)
                .st_size(16)
                .build(),
            section: None,
            parent: None,
            children: Vec::new(),
            status: Status::Changed,
            include: true,
            strip: Strip::Default,
            twin: None,
            relf_match: None,
            needs_partial_resolve: false,
        });
        assert!(resolve_against_running(&mut model, &relf).is_err());
    }
}
