//! Stage I: synthesizes the output relocatable object from the inclusion
//! closure computed by earlier stages — string pool, `.upatch.funcs`,
//! `.upatch.symbols`/`.upatch.relocations`, reordered/stripped/reindexed
//! symbol table, rebuilt relocations, and the final `.shstrtab`/`.strtab`/
//! `.symtab`/section-header table.
//!
//! Grounded on `upatch_create_strings_elements` through
//! `upatch_write_output_elf` in the reference tool's main driver.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Write as _;

use crate::error::{Error, Result};
use crate::model::{ElfModel, SecIdx, SectionKind, Status, Strip, SymIdx};
use crate::raw::{
    Ehdr, HasWrittenSize, Identifier, Rela, ShFlags, Shdr, Sym, ToWriter, ET_REL, SHT_NULL,
    SHT_PROGBITS, SHT_RELA, SHT_STRTAB, SHT_SYMTAB, STB_LOCAL, STT_FILE, STT_FUNC,
};
use crate::site;

const UPATCH_STRINGS: &str = ".upatch.strings";
const UPATCH_FUNCS: &str = ".upatch.funcs";
const UPATCH_SYMBOLS: &str = ".upatch.symbols";
const UPATCH_RELOCATIONS: &str = ".upatch.relocations";

/// On-disk layout of one `.upatch.funcs` entry.
struct PatchFunc {
    new_addr: u64,
    new_size: u32,
    old_addr: u64,
    old_size: u32,
    sympos: u32,
    name_offset: u32,
}

impl ToWriter for PatchFunc {
    fn to_writer<W: std::io::Write>(&self, w: &mut W) -> Result<()> {
        let err = |e| Error::io(site!("PatchFunc::to_writer"), "writing .upatch.funcs entry", e);
        w.write_all(&self.new_addr.to_le_bytes()).map_err(err)?;
        w.write_all(&self.new_size.to_le_bytes()).map_err(err)?;
        w.write_all(&self.old_addr.to_le_bytes()).map_err(err)?;
        w.write_all(&self.old_size.to_le_bytes()).map_err(err)?;
        w.write_all(&self.sympos.to_le_bytes()).map_err(err)?;
        w.write_all(&self.name_offset.to_le_bytes()).map_err(err)?;
        Ok(())
    }
}
const PATCH_FUNC_SIZE: usize = 8 + 4 + 8 + 4 + 4 + 4;

/// On-disk layout of one `.upatch.symbols` entry describing a running-binary
/// symbol a dynamic relocation must bind against.
struct UpatchSymbol {
    src: u64,
    sympos: u32,
    bind: u8,
    ty: u8,
    name: u32,
}

impl ToWriter for UpatchSymbol {
    fn to_writer<W: std::io::Write>(&self, w: &mut W) -> Result<()> {
        let err = |e| Error::io(site!("UpatchSymbol::to_writer"), "writing .upatch.symbols entry", e);
        w.write_all(&self.src.to_le_bytes()).map_err(err)?;
        w.write_all(&self.sympos.to_le_bytes()).map_err(err)?;
        w.write_all(&[self.bind, self.ty]).map_err(err)?;
        w.write_all(&[0u8; 2]).map_err(err)?;
        w.write_all(&self.name.to_le_bytes()).map_err(err)?;
        Ok(())
    }
}
const UPATCH_SYMBOL_SIZE: usize = 8 + 4 + 1 + 1 + 2 + 4;

/// On-disk layout of one `.upatch.relocations` entry: the dynamic
/// counterpart of an ordinary RELA record, resolved by the patch loader
/// against the running binary instead of by the static linker.
struct UpatchRelocation {
    dst: u64,
    ty: u32,
    addend: i64,
    sym: u32,
}

impl ToWriter for UpatchRelocation {
    fn to_writer<W: std::io::Write>(&self, w: &mut W) -> Result<()> {
        let err = |e| Error::io(site!("UpatchRelocation::to_writer"), "writing .upatch.relocations entry", e);
        w.write_all(&self.dst.to_le_bytes()).map_err(err)?;
        w.write_all(&self.ty.to_le_bytes()).map_err(err)?;
        w.write_all(&self.addend.to_le_bytes()).map_err(err)?;
        w.write_all(&self.sym.to_le_bytes()).map_err(err)?;
        Ok(())
    }
}
const UPATCH_RELOCATION_SIZE: usize = 8 + 4 + 8 + 4;

/// Builds `.upatch.strings`: the concatenated, NUL-terminated string pool,
/// plus a section-type symbol for it so other synthesized sections can
/// target it with a relocation.
fn build_strings_section(model: &mut ElfModel) -> (SecIdx, HashMap<usize, u32>) {
    let mut data = Vec::new();
    let mut offsets = HashMap::new();
    for (i, s) in model.strings().to_vec().iter().enumerate() {
        offsets.insert(i, data.len() as u32);
        data.extend_from_slice(s.as_bytes());
        data.push(0);
    }
    let size = data.len() as u64;
    let sec = model.push_section(crate::model::Section {
        name: Cow::Borrowed(UPATCH_STRINGS),
        index: SecIdx(0),
        sh_type: SHT_PROGBITS,
        sh_flags: ShFlags::empty(),
        sh_entsize: 0,
        sh_addralign: 1,
        size,
        data,
        status: Status::New,
        include: true,
        ignore: false,
        grouped: false,
        twin: None,
        kind: SectionKind::Content { secsym: None, sym: None, rela: None },
    });
    let secsym = model.push_symbol(crate::model::Symbol {
        name: Cow::Borrowed(UPATCH_STRINGS),
        index: SymIdx(0),
        raw: Sym::builder()
            .st_name(0)
            .st_info(Sym::st_info_from(STB_LOCAL, STT_SECTION))
            .st_other(0)
            .st_shndx(0)
            .st_value(0)
            .st_size(0)
            .build(),
        section: Some(sec),
        parent: None,
        children: Vec::new(),
        status: Status::New,
        include: true,
        strip: Strip::Used,
        twin: None,
        relf_match: None,
        needs_partial_resolve: false,
    });
    if let SectionKind::Content { secsym: slot, .. } = &mut model.section_mut(sec).kind {
        *slot = Some(secsym);
    }
    (sec, offsets)
}

fn offset_of(offsets: &HashMap<usize, u32>, model: &mut ElfModel, s: &str) -> u32 {
    let idx = model.offset_of_string(s);
    *offsets.get(&idx).unwrap_or(&0)
}

/// Builds `.upatch.funcs` and its companion `.rela.upatch.funcs`: one entry
/// per included, CHANGED, non-child FUNC symbol.
fn build_patch_functions_section(
    model: &mut ElfModel,
    strings_sec: SecIdx,
    strings_offsets: &HashMap<usize, u32>,
) -> Result<()> {
    let eligible: Vec<SymIdx> = model
        .symbols
        .iter()
        .filter(|s| s.include && s.status == Status::Changed && s.kind() == STT_FUNC && s.parent.is_none())
        .map(|s| s.index)
        .collect();

    let mut data = Vec::with_capacity(eligible.len() * PATCH_FUNC_SIZE);
    let mut relas = Vec::with_capacity(eligible.len() * 2);
    let strings_secsym = model.section(strings_sec).secsym().expect("strings section always has a secsym");

    for (i, &sym_idx) in eligible.iter().enumerate() {
        let sym = model.symbol(sym_idx);
        let Some(matched) = sym.relf_match.clone() else {
            return Err(Error::Resolution {
                site: site!("build_patch_functions_section"),
                message: format!("{} was not resolved against the running binary before synthesis", sym.name),
            });
        };
        let name = sym.name.to_string();
        let new_size = sym.raw.st_size as u32;
        let name_offset = offset_of(strings_offsets, model, &name);

        let record_off = (i * PATCH_FUNC_SIZE) as u64;
        PatchFunc {
            new_addr: 0,
            new_size,
            old_addr: matched.old_addr,
            old_size: matched.old_size as u32,
            sympos: matched.sympos,
            name_offset: 0,
        }
        .to_writer(&mut data)?;

        // new_addr field: absolute relocation against the function's own symbol.
        relas.push(Rela::from_info(record_off, ((sym_idx.0 as u64) << 32) | 1, 0));
        // name_offset field (offset 24 into the record): absolute relocation
        // against `.upatch.strings`'s section symbol, addend = string offset.
        relas.push(Rela::from_info(
            record_off + 24,
            ((strings_secsym.0 as u64) << 32) | 1,
            name_offset as i64,
        ));
    }

    let size = data.len() as u64;
    let funcs_sec = model.push_section(crate::model::Section {
        name: Cow::Borrowed(UPATCH_FUNCS),
        index: SecIdx(0),
        sh_type: SHT_PROGBITS,
        sh_flags: ShFlags::ALLOC,
        sh_entsize: PATCH_FUNC_SIZE as u64,
        sh_addralign: 8,
        size,
        data,
        status: Status::New,
        include: true,
        ignore: false,
        grouped: false,
        twin: None,
        kind: SectionKind::Content { secsym: None, sym: None, rela: None },
    });
    let rela_sec = model.push_section(crate::model::Section {
        name: Cow::Owned(format!(".rela{UPATCH_FUNCS}")),
        index: SecIdx(0),
        sh_type: SHT_RELA,
        sh_flags: ShFlags::empty(),
        sh_entsize: Rela::WRITTEN_SIZE as u64,
        sh_addralign: 8,
        size: (relas.len() * Rela::WRITTEN_SIZE) as u64,
        data: Vec::new(),
        status: Status::New,
        include: true,
        ignore: false,
        grouped: false,
        twin: None,
        kind: SectionKind::Relocation { base: funcs_sec, relas },
    });
    if let SectionKind::Content { rela, .. } = &mut model.section_mut(funcs_sec).kind {
        *rela = Some(rela_sec);
    }
    Ok(())
}

/// Builds `.upatch.symbols` and `.upatch.relocations`: one pair of entries
/// per migrated relocation whose target is a LOCAL symbol resolved against
/// the running binary (a dynamic relocation the static linker cannot
/// satisfy on its own).
fn build_dynrela_sections(
    model: &mut ElfModel,
    strings_sec: SecIdx,
    strings_offsets: &HashMap<usize, u32>,
) -> Result<()> {
    let rela_sections: Vec<SecIdx> = model
        .sections
        .iter()
        .filter(|s| {
            s.include
                && s.is_rela()
                && s.name != format!(".rela{UPATCH_FUNCS}")
                && s.name != format!(".rela{UPATCH_SYMBOLS}")
                && s.name != format!(".rela{UPATCH_RELOCATIONS}")
        })
        .map(|s| s.index)
        .collect();

    let mut dynrela_targets: Vec<(SecIdx, usize, SymIdx)> = Vec::new();
    for &rela_idx in &rela_sections {
        let count = model.section(rela_idx).relas().len();
        for i in 0..count {
            let r_sym = model.section(rela_idx).relas()[i].r_sym;
            let target = &model.symbols[r_sym as usize];
            if target.is_local() && target.relf_match.is_some() {
                dynrela_targets.push((rela_idx, i, target.index));
            }
        }
    }

    let mut symbols_data = Vec::with_capacity(dynrela_targets.len() * UPATCH_SYMBOL_SIZE);
    let mut relocations_data = Vec::with_capacity(dynrela_targets.len() * UPATCH_RELOCATION_SIZE);
    let mut symbols_relas = Vec::new();
    let mut relocations_relas = Vec::new();
    let strings_secsym = model.section(strings_sec).secsym().unwrap();

    for (entry_idx, (rela_idx, rela_i, target_idx)) in dynrela_targets.iter().enumerate() {
        let (dst_base, r_type, r_addend) = {
            let r = &model.section(*rela_idx).relas()[*rela_i];
            (model.section(*rela_idx).base().unwrap(), r.r_type, r.r_addend)
        };
        let target = model.symbol(*target_idx);
        let matched = target.relf_match.clone().unwrap();
        let name = target.name.to_string();
        let name_offset = offset_of(strings_offsets, model, &name);
        let bind = target.bind();
        let ty = target.kind();

        let sym_record_off = (entry_idx * UPATCH_SYMBOL_SIZE) as u64;
        UpatchSymbol {
            src: matched.old_addr,
            sympos: matched.sympos,
            bind,
            ty,
            name: 0,
        }
        .to_writer(&mut symbols_data)?;
        symbols_relas.push(Rela::from_info(
            sym_record_off + 16,
            ((strings_secsym.0 as u64) << 32) | 1,
            name_offset as i64,
        ));

        let reloc_record_off = (entry_idx * UPATCH_RELOCATION_SIZE) as u64;
        UpatchRelocation {
            dst: 0,
            ty: r_type,
            addend: r_addend,
            sym: entry_idx as u32,
        }
        .to_writer(&mut relocations_data)?;
        // dst: absolute relocation against the base section's bundled
        // symbol (or its section symbol, lacking one), addend = r_offset,
        // so the loader sees the final load-time address this relocation
        // site will occupy.
        let base_sym = model
            .section(dst_base)
            .bundled_sym()
            .or_else(|| model.section(dst_base).secsym())
            .expect("an included relocated section always carries a symbol");
        let r_offset = model.section(*rela_idx).relas()[*rela_i].r_offset;
        relocations_relas.push(Rela::from_info(
            reloc_record_off,
            ((base_sym.0 as u64) << 32) | 1,
            r_offset as i64,
        ));
    }

    let symbols_size = symbols_data.len() as u64;
    let symbols_sec = model.push_section(crate::model::Section {
        name: Cow::Borrowed(UPATCH_SYMBOLS),
        index: SecIdx(0),
        sh_type: SHT_PROGBITS,
        sh_flags: ShFlags::ALLOC,
        sh_entsize: UPATCH_SYMBOL_SIZE as u64,
        sh_addralign: 8,
        size: symbols_size,
        data: symbols_data,
        status: Status::New,
        include: true,
        ignore: false,
        grouped: false,
        twin: None,
        kind: SectionKind::Content { secsym: None, sym: None, rela: None },
    });
    let symbols_rela_sec = model.push_section(crate::model::Section {
        name: Cow::Owned(format!(".rela{UPATCH_SYMBOLS}")),
        index: SecIdx(0),
        sh_type: SHT_RELA,
        sh_flags: ShFlags::empty(),
        sh_entsize: Rela::WRITTEN_SIZE as u64,
        sh_addralign: 8,
        size: (symbols_relas.len() * Rela::WRITTEN_SIZE) as u64,
        data: Vec::new(),
        status: Status::New,
        include: true,
        ignore: false,
        grouped: false,
        twin: None,
        kind: SectionKind::Relocation { base: symbols_sec, relas: symbols_relas },
    });
    if let SectionKind::Content { rela, .. } = &mut model.section_mut(symbols_sec).kind {
        *rela = Some(symbols_rela_sec);
    }

    let relocations_size = relocations_data.len() as u64;
    let relocations_sec = model.push_section(crate::model::Section {
        name: Cow::Borrowed(UPATCH_RELOCATIONS),
        index: SecIdx(0),
        sh_type: SHT_PROGBITS,
        sh_flags: ShFlags::ALLOC,
        sh_entsize: UPATCH_RELOCATION_SIZE as u64,
        sh_addralign: 8,
        size: relocations_size,
        data: relocations_data,
        status: Status::New,
        include: true,
        ignore: false,
        grouped: false,
        twin: None,
        kind: SectionKind::Content { secsym: None, sym: None, rela: None },
    });
    let relocations_rela_sec = model.push_section(crate::model::Section {
        name: Cow::Owned(format!(".rela{UPATCH_RELOCATIONS}")),
        index: SecIdx(0),
        sh_type: SHT_RELA,
        sh_flags: ShFlags::empty(),
        sh_entsize: Rela::WRITTEN_SIZE as u64,
        sh_addralign: 8,
        size: (relocations_relas.len() * Rela::WRITTEN_SIZE) as u64,
        data: Vec::new(),
        status: Status::New,
        include: true,
        ignore: false,
        grouped: false,
        twin: None,
        kind: SectionKind::Relocation { base: relocations_sec, relas: relocations_relas },
    });
    if let SectionKind::Content { rela, .. } = &mut model.section_mut(relocations_sec).kind {
        *rela = Some(relocations_rela_sec);
    }

    Ok(())
}

/// Partitions included symbols into NULL / FILE / LOCAL FUNC / other LOCAL /
/// the rest, strips any symbol marked `Strip::Strip`, and returns the
/// ordered, final symbol index list together with an old-to-new index map.
fn reorder_and_strip(model: &ElfModel) -> (Vec<SymIdx>, HashMap<usize, u32>) {
    let included: Vec<&crate::model::Symbol> = model
        .symbols
        .iter()
        .filter(|s| s.include && s.strip != Strip::Strip)
        .collect();

    let mut null_syms = Vec::new();
    let mut file_syms = Vec::new();
    let mut local_funcs = Vec::new();
    let mut other_locals = Vec::new();
    let mut globals = Vec::new();

    for s in included {
        if s.index == crate::model::NULL_SYM {
            null_syms.push(s.index);
        } else if s.kind() == STT_FILE {
            file_syms.push(s.index);
        } else if s.is_local() && s.kind() == STT_FUNC {
            local_funcs.push(s.index);
        } else if s.is_local() {
            other_locals.push(s.index);
        } else {
            globals.push(s.index);
        }
    }

    let mut ordered = Vec::new();
    ordered.extend(null_syms);
    ordered.extend(file_syms);
    ordered.extend(local_funcs);
    ordered.extend(other_locals);
    ordered.extend(globals);

    let mut map = HashMap::new();
    for (new_idx, old) in ordered.iter().enumerate() {
        map.insert(old.0, new_idx as u32);
    }
    (ordered, map)
}

/// Migrates every `include`-marked section (plus the synthesized metadata
/// sections built above) into a final section order, assigns dense 1-based
/// section indices (the first on-disk section header is always the reserved
/// NULL section), and returns the ordered list together with an
/// old-to-new index map.
fn reorder_sections(model: &ElfModel) -> (Vec<SecIdx>, HashMap<usize, u16>) {
    let ordered: Vec<SecIdx> = model
        .sections
        .iter()
        .filter(|s| s.include && s.sh_type != SHT_NULL)
        .map(|s| s.index)
        .collect();
    let mut map = HashMap::new();
    for (i, sec) in ordered.iter().enumerate() {
        map.insert(sec.0, (i + 1) as u16);
    }
    (ordered, map)
}

/// Registers every symbol name in the string pool up front, so that by the
/// time `.upatch.strings` is serialized, no later stage needs to grow it.
fn register_names_in_pool(model: &mut ElfModel) {
    let names: Vec<String> = model.symbols.iter().map(|s| s.name.to_string()).collect();
    for name in names {
        model.offset_of_string(&name);
    }
}

/// Drives the whole output stage: builds the metadata sections, reorders and
/// reindexes everything, rebuilds every migrated relocation section against
/// the new symbol indices, and serializes the result to bytes.
pub fn synthesize(model: &mut ElfModel, ident: Identifier, machine: u16) -> Result<Vec<u8>> {
    // Every name any synthesized metadata record might reference must enter
    // the string pool before `.upatch.strings` is serialized below — the
    // pool only ever appends, so an offset computed after serialization
    // would point past the end of the finished section.
    register_names_in_pool(model);
    let (strings_sec, strings_offsets) = build_strings_section(model);
    build_patch_functions_section(model, strings_sec, &strings_offsets)?;
    build_dynrela_sections(model, strings_sec, &strings_offsets)?;

    let (ordered_syms, sym_map) = reorder_and_strip(model);
    let (ordered_secs, sec_map) = reorder_sections(model);

    // Resolve each surviving symbol's on-disk shndx and rebuild relocation
    // target indices using `sym_map` before any byte layout is decided.
    let mut final_syms = Vec::with_capacity(ordered_syms.len());
    let mut local_count = 0u32;
    for sym_idx in &ordered_syms {
        let sym = model.symbol(*sym_idx);
        let shndx = match sym.section {
            Some(sec) if model.section(sec).include => {
                *sec_map.get(&sec.0).unwrap_or(&0)
            }
            _ => crate::raw::SHN_UNDEF,
        };
        if sym.is_local() {
            local_count += 1;
        }
        final_syms.push((sym.index, shndx));
    }

    // shstrtab / strtab.
    let mut shstrtab = vec![0u8];
    let mut sec_name_offsets = HashMap::new();
    for sec in &ordered_secs {
        let off = shstrtab.len() as u32;
        sec_name_offsets.insert(sec.0, off);
        shstrtab.extend_from_slice(model.section(*sec).name.as_bytes());
        shstrtab.push(0);
    }
    let shstrtab_name_off = shstrtab.len() as u32;
    shstrtab.extend_from_slice(b".shstrtab\0");
    let strtab_name_off = shstrtab.len() as u32;
    shstrtab.extend_from_slice(b".strtab\0");
    let symtab_name_off = shstrtab.len() as u32;
    shstrtab.extend_from_slice(b".symtab\0");

    let mut strtab = vec![0u8];
    let mut sym_name_offsets = HashMap::new();
    for (sym_idx, _) in &final_syms {
        if sym_idx.0 == 0 {
            sym_name_offsets.insert(sym_idx.0, 0u32);
            continue;
        }
        let off = strtab.len() as u32;
        sym_name_offsets.insert(sym_idx.0, off);
        strtab.extend_from_slice(model.symbol(*sym_idx).name.as_bytes());
        strtab.push(0);
    }

    // Rebuild every migrated relocation section's on-disk entries using the
    // final symbol indices.
    for sec in &ordered_secs {
        if !model.section(*sec).is_rela() {
            continue;
        }
        let count = model.section(*sec).relas().len();
        for i in 0..count {
            let old_sym = model.section(*sec).relas()[i].r_sym;
            let new_sym = *sym_map.get(&(old_sym as usize)).unwrap_or(&0);
            model.section_mut(*sec).relas_mut().unwrap()[i].r_sym = new_sym;
        }
    }

    // Lay out section data, in order, right after the ELF header.
    let mut body = Vec::new();
    let mut section_layout = Vec::new(); // (sh_offset, sh_size) per ordered_secs index
    for sec in &ordered_secs {
        let s = model.section(*sec);
        let offset = Ehdr::WRITTEN_SIZE as u64 + body.len() as u64;
        if s.is_rela() {
            for r in s.relas() {
                r.to_writer(&mut body)?;
            }
        } else if s.sh_type != crate::raw::SHT_NOBITS {
            body.extend_from_slice(&s.data);
        }
        let size = if s.is_rela() {
            (s.relas().len() * Rela::WRITTEN_SIZE) as u64
        } else {
            s.size
        };
        section_layout.push((offset, size));
    }

    // symtab entries, now that we know final shstrtab/strtab/symtab won't
    // move again.
    let mut symtab_data = Vec::with_capacity(final_syms.len() * Sym::WRITTEN_SIZE);
    for (sym_idx, shndx) in &final_syms {
        let sym = model.symbol(*sym_idx);
        let st_name = *sym_name_offsets.get(&sym_idx.0).unwrap_or(&0);
        let entry = Sym {
            st_name,
            st_info: sym.raw.st_info,
            st_other: sym.raw.st_other,
            st_shndx: *shndx,
            st_value: sym.raw.st_value,
            st_size: sym.raw.st_size,
        };
        entry.to_writer(&mut symtab_data)?;
    }

    // shstrtab/strtab/symtab sections are appended after the migrated ones.
    let shstrtab_offset = Ehdr::WRITTEN_SIZE as u64 + body.len() as u64;
    body.extend_from_slice(&shstrtab);
    let strtab_offset = Ehdr::WRITTEN_SIZE as u64 + body.len() as u64;
    body.extend_from_slice(&strtab);
    let symtab_offset = Ehdr::WRITTEN_SIZE as u64 + body.len() as u64;
    body.extend_from_slice(&symtab_data);

    let total_secs = 1 + ordered_secs.len() + 3; // NULL + migrated + shstrtab/strtab/symtab
    let shoff = Ehdr::WRITTEN_SIZE as u64 + body.len() as u64;
    let shstrndx = (ordered_secs.len() + 1) as u16;
    let strtab_idx = (ordered_secs.len() + 2) as u16;
    let symtab_idx = (ordered_secs.len() + 3) as u16;

    let mut headers = Vec::with_capacity(total_secs);
    headers.push(Shdr::builder()
        .sh_name(0)
        .sh_type(SHT_NULL)
        .sh_flags(ShFlags::empty())
        .sh_addr(0)
        .sh_offset(0)
        .sh_size(0)
        .sh_link(0)
        .sh_info(0)
        .sh_addralign(0)
        .sh_entsize(0)
        .build());

    for (i, sec) in ordered_secs.iter().enumerate() {
        let s = model.section(*sec);
        let (sh_offset, sh_size) = section_layout[i];
        let (sh_link, sh_info) = if s.is_rela() {
            (symtab_idx as u32, *sec_map.get(&s.base().unwrap().0).unwrap_or(&0) as u32)
        } else {
            (0, 0)
        };
        headers.push(Shdr::builder()
            .sh_name(*sec_name_offsets.get(&sec.0).unwrap_or(&0))
            .sh_type(s.sh_type)
            .sh_flags(s.sh_flags)
            .sh_addr(0)
            .sh_offset(sh_offset)
            .sh_size(sh_size)
            .sh_link(sh_link)
            .sh_info(sh_info)
            .sh_addralign(s.sh_addralign.max(1))
            .sh_entsize(s.sh_entsize)
            .build());
    }

    headers.push(Shdr::builder()
        .sh_name(shstrtab_name_off)
        .sh_type(SHT_STRTAB)
        .sh_flags(ShFlags::empty())
        .sh_addr(0)
        .sh_offset(shstrtab_offset)
        .sh_size(shstrtab.len() as u64)
        .sh_link(0)
        .sh_info(0)
        .sh_addralign(1)
        .sh_entsize(0)
        .build());
    headers.push(Shdr::builder()
        .sh_name(strtab_name_off)
        .sh_type(SHT_STRTAB)
        .sh_flags(ShFlags::empty())
        .sh_addr(0)
        .sh_offset(strtab_offset)
        .sh_size(strtab.len() as u64)
        .sh_link(0)
        .sh_info(0)
        .sh_addralign(1)
        .sh_entsize(0)
        .build());
    headers.push(Shdr::builder()
        .sh_name(symtab_name_off)
        .sh_type(SHT_SYMTAB)
        .sh_flags(ShFlags::empty())
        .sh_addr(0)
        .sh_offset(symtab_offset)
        .sh_size(symtab_data.len() as u64)
        .sh_link(strtab_idx as u32)
        .sh_info(local_count)
        .sh_addralign(8)
        .sh_entsize(Sym::WRITTEN_SIZE as u64)
        .build());

    let ehdr = Ehdr::builder()
        .ident(ident)
        .e_type(ET_REL)
        .e_machine(machine)
        .e_version(1)
        .e_entry(0)
        .e_phoff(0)
        .e_shoff(shoff)
        .e_flags(0)
        .e_ehsize(Ehdr::WRITTEN_SIZE as u16)
        .e_phentsize(0)
        .e_phnum(0)
        .e_shentsize(Shdr::WRITTEN_SIZE as u16)
        .e_shnum(total_secs as u16)
        .e_shstrndx(shstrndx)
        .build();

    let mut out = Vec::with_capacity(Ehdr::WRITTEN_SIZE + body.len() + headers.len() * Shdr::WRITTEN_SIZE);
    ehdr.to_writer(&mut out)?;
    out.extend_from_slice(&body);
    for h in &headers {
        h.to_writer(&mut out)?;
    }
    Ok(out)
}

/// Writes `bytes` to `path`.
pub fn write_output(bytes: &[u8], path: &std::path::Path) -> Result<()> {
    let mut f = std::fs::File::create(path)
        .map_err(|e| Error::io(site!("write_output"), format!("creating {}", path.display()), e))?;
    f.write_all(bytes)
        .map_err(|e| Error::io(site!("write_output"), format!("writing {}", path.display()), e))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::Arch;
    use crate::model::Symbol;
    use crate::raw::{ELFCLASS64, ELFDATA2LSB, STB_GLOBAL};

    #[test]
    fn write_output_round_trips_through_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patch.o");
        write_output(b"\x7fELF...", &path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"\x7fELF...");
    }

    #[test]
    fn strings_section_dedups_and_nul_terminates() {
        let mut model = ElfModel::new(Arch::X86_64);
        model.offset_of_string("alpha");
        model.offset_of_string("beta");
        let (sec, offsets) = build_strings_section(&mut model);
        let data = &model.section(sec).data;
        assert_eq!(data, b"alpha\0beta\0");
        assert_eq!(offsets.get(&0), Some(&0));
        assert_eq!(offsets.get(&1), Some(&6));
    }

    #[test]
    fn reorder_and_strip_places_null_first_and_globals_last() {
        let mut model = ElfModel::new(Arch::X86_64);
        // NULL symbol.
        model.push_symbol(Symbol {
            name: Cow::Borrowed(""),
            index: SymIdx(0),
            raw: Sym::builder().st_name(0).st_info(0).st_other(0).st_shndx(0).st_value(0).st_size(0).build(),
            section: None,
            parent: None,
            children: Vec::new(),
            status: Status::Same,
            include: true,
            strip: Strip::Default,
            twin: None,
            relf_match: None,
            needs_partial_resolve: false,
        });
        let global = model.push_symbol(Symbol {
            name: Cow::Borrowed("public_fn"),
            index: SymIdx(0),
            raw: Sym::builder().st_name(0).st_info(Sym::st_info_from(STB_GLOBAL, STT_FUNC)).st_other(0).st_shndx(0).st_value(0).st_size(4).build(),
            section: None,
            parent: None,
            children: Vec::new(),
            status: Status::New,
            include: true,
            strip: Strip::Default,
            twin: None,
            relf_match: None,
            needs_partial_resolve: false,
        });
        let local_func = model.push_symbol(Symbol {
            name: Cow::Borrowed("static_fn"),
            index: SymIdx(0),
            raw: Sym::builder().st_name(0).st_info(Sym::st_info_from(STB_LOCAL, STT_FUNC)).st_other(0).st_shndx(0).st_value(0).st_size(4).build(),
            section: None,
            parent: None,
            children: Vec::new(),
            status: Status::New,
            include: true,
            strip: Strip::Default,
            twin: None,
            relf_match: None,
            needs_partial_resolve: false,
        });
        let (ordered, _map) = reorder_and_strip(&model);
        assert_eq!(ordered[0], crate::model::NULL_SYM);
        assert_eq!(ordered[1], local_func);
        assert_eq!(ordered[2], global);
    }

    #[test]
    fn synthesize_minimal_model_round_trips_through_raw_reader() {
        let mut model = ElfModel::new(Arch::X86_64);
        model.push_symbol(Symbol {
            name: Cow::Borrowed(""),
            index: SymIdx(0),
            raw: Sym::builder().st_name(0).st_info(0).st_other(0).st_shndx(0).st_value(0).st_size(0).build(),
            section: None,
            parent: None,
            children: Vec::new(),
            status: Status::Same,
            include: true,
            strip: Strip::Default,
            twin: None,
            relf_match: None,
            needs_partial_resolve: false,
        });
        let ident = Identifier {
            class: ELFCLASS64,
            data: ELFDATA2LSB,
            version: 1,
            os_abi: 0,
            abi_version: 0,
        };
        let bytes = synthesize(&mut model, ident, crate::arch::EM_X86_64).unwrap();
        let reloaded = crate::load::load_object_bytes(&bytes).unwrap();
        assert!(reloaded.section_by_name(".shstrtab").is_some());
        assert!(reloaded.section_by_name(".symtab").is_some());
    }
}
