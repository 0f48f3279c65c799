//! Stage D: rewrites relocations that target an `STT_SECTION` symbol onto a
//! more specific symbol, so that later correlation has a name to match on
//! instead of an anonymous section reference.
//!
//! Grounded on `replace_section_syms`: a relocation against a section symbol
//! is rewritten onto that section's single bundled function/object symbol
//! when one exists, and otherwise onto whichever data/rodata symbol's value
//! range covers the relocation's target offset inside that section — the
//! common case for `gcc`-inlined string-literal arrays and jump tables living
//! in a shared `.rodata`/`.data.rel.ro` section alongside several objects.

use crate::error::{Error, Result};
use crate::model::{ElfModel, SecIdx};
use crate::raw::{ShFlags, STT_SECTION};
use crate::site;

/// Rewrites every relocation in `model` whose target symbol is an
/// `STT_SECTION` symbol, in place.
pub fn replace_section_syms(model: &mut ElfModel) -> Result<()> {
    let arch = model.arch;
    let rela_sections: Vec<SecIdx> = model
        .sections
        .iter()
        .filter(|s| s.is_rela())
        .map(|s| s.index)
        .collect();

    for rela_idx in rela_sections {
        let base = model.section(rela_idx).base().expect("rela section always has a base");
        let count = model.section(rela_idx).relas().len();
        for i in 0..count {
            let (r_sym, r_addend, r_type, r_offset) = {
                let relas = model.section(rela_idx).relas();
                (relas[i].r_sym, relas[i].r_addend, relas[i].r_type, relas[i].r_offset)
            };
            let target = &model.symbols[r_sym as usize];
            if target.kind() != STT_SECTION {
                continue;
            }
            let target_section = match target.section {
                Some(s) => s,
                None => continue,
            };

            let sec = model.section(target_section);
            let is_text = sec.sh_flags.contains(ShFlags::EXECINSTR);
            let code = sec.data.clone();
            let target_off =
                crate::arch::rela_target_offset(arch, r_type, r_addend, is_text, &code, r_offset)?;

            let replacement = find_replacement(model, target_section, target_off)?;
            if let Some((new_sym, new_addend)) = replacement {
                let relas = model.section_mut(rela_idx).relas_mut().unwrap();
                relas[i].r_sym = new_sym.0 as u32;
                relas[i].r_addend = new_addend;
            }
        }
        let _ = base;
    }
    Ok(())
}

/// Finds the symbol a section-relative relocation with addend `offset` into
/// `section` should be rewritten onto, and the addend relative to that
/// symbol's own value. Returns `None` when the section carries a bundled
/// function/object symbol at offset 0 covering the whole section — the
/// common case, handled separately by the caller via the section's `sym`.
fn find_replacement(
    model: &ElfModel,
    section: SecIdx,
    offset: i64,
) -> Result<Option<(crate::model::SymIdx, i64)>> {
    let sec = model.section(section);
    if let Some(bundled) = sec.bundled_sym() {
        return Ok(Some((bundled, offset)));
    }

    // No single bundled symbol: this is a shared data/rodata section holding
    // several objects (e.g. several string-literal arrays folded together by
    // the compiler). Find the OBJECT symbol whose [value, value+size) range
    // covers `offset`. A negative offset cannot be covered by any symbol.
    if offset < 0 {
        return Ok(None);
    }
    let offset_u = offset as u64;
    let candidate = model
        .symbols
        .iter()
        .find(|s| {
            s.section == Some(section)
                && s.kind() == crate::raw::STT_OBJECT
                && offset_u >= s.raw.st_value
                && offset_u < s.raw.st_value + s.raw.st_size.max(1)
        });

    match candidate {
        Some(sym) => Ok(Some((sym.index, offset - sym.raw.st_value as i64))),
        None if offset_u >= sec.size => Err(Error::Format {
            site: site!("find_replacement"),
            message: format!(
                "relocation target offset {offset} runs past the end of section {} (size {})",
                sec.name, sec.size
            ),
        }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::Arch;
    use crate::model::{Section, SectionKind, Status, Symbol};
    use crate::raw::{Rela, ShFlags, Sym, STB_LOCAL, STT_OBJECT};
    use std::borrow::Cow;

    fn make_model() -> (ElfModel<'static>, SecIdx) {
        let mut model = ElfModel::new(Arch::X86_64);
        let rodata = model.push_section(Section {
            name: Cow::Borrowed(".rodata"),
            index: SecIdx(0),
            sh_type: crate::raw::SHT_PROGBITS,
            sh_flags: ShFlags::ALLOC,
            sh_entsize: 0,
            sh_addralign: 1,
            size: 32,
            data: vec![0u8; 32],
            status: Status::Same,
            include: false,
            ignore: false,
            grouped: false,
            twin: None,
            kind: SectionKind::Content {
                secsym: None,
                sym: None,
                rela: None,
            },
        });
        (model, rodata)
    }

    #[test]
    fn rewrites_onto_covering_object_symbol() {
        let (mut model, rodata) = make_model();
        let sym_a = model.push_symbol(Symbol {
            name: Cow::Borrowed("str_a"),
            index: crate::model::SymIdx(0),
            raw: Sym::builder()
                .st_name(0)
                .st_info(Sym::st_info_from(STB_LOCAL, STT_OBJECT))
                .st_other(0)
                .st_shndx(1)
                .st_value(0)
                .st_size(8)
                .build(),
            section: Some(rodata),
            parent: None,
            children: Vec::new(),
            status: Status::Same,
            include: false,
            strip: crate::model::Strip::Default,
            twin: None,
            relf_match: None,
            needs_partial_resolve: false,
        });
        let sym_b = model.push_symbol(Symbol {
            name: Cow::Borrowed("str_b"),
            index: crate::model::SymIdx(0),
            raw: Sym::builder()
                .st_name(0)
                .st_info(Sym::st_info_from(STB_LOCAL, STT_OBJECT))
                .st_other(0)
                .st_shndx(1)
                .st_value(8)
                .st_size(8)
                .build(),
            section: Some(rodata),
            parent: None,
            children: Vec::new(),
            status: Status::Same,
            include: false,
            strip: crate::model::Strip::Default,
            twin: None,
            relf_match: None,
            needs_partial_resolve: false,
        });

        // A section symbol targeting .rodata, used as the placeholder relocation target.
        let secsym = model.push_symbol(Symbol {
            name: Cow::Borrowed(".rodata"),
            index: crate::model::SymIdx(0),
            raw: Sym::builder()
                .st_name(0)
                .st_info(Sym::st_info_from(STB_LOCAL, STT_SECTION))
                .st_other(0)
                .st_shndx(1)
                .st_value(0)
                .st_size(0)
                .build(),
            section: Some(rodata),
            parent: None,
            children: Vec::new(),
            status: Status::Same,
            include: false,
            strip: crate::model::Strip::Default,
            twin: None,
            relf_match: None,
            needs_partial_resolve: false,
        });

        let rela_sec = model.push_section(Section {
            name: Cow::Borrowed(".rela.text"),
            index: SecIdx(0),
            sh_type: crate::raw::SHT_RELA,
            sh_flags: ShFlags::empty(),
            sh_entsize: 24,
            sh_addralign: 8,
            size: 0,
            data: Vec::new(),
            status: Status::Same,
            include: false,
            ignore: false,
            grouped: false,
            twin: None,
            kind: SectionKind::Relocation {
                base: rodata,
                relas: vec![
                    Rela::from_info(0, ((secsym.0 as u64) << 32) | 1, 0),
                    Rela::from_info(8, ((secsym.0 as u64) << 32) | 1, 12),
                ],
            },
        });
        replace_section_syms(&mut model).unwrap();
        let relas = model.section(rela_sec).relas();
        assert_eq!(relas[0].r_sym, sym_a.0 as u32);
        assert_eq!(relas[0].r_addend, 0);
        assert_eq!(relas[1].r_sym, sym_b.0 as u32);
        assert_eq!(relas[1].r_addend, 4);
    }
}
