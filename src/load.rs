//! Stage A: loads a relocatable ELF object from disk into an [`ElfModel`].
//!
//! Mirrors `upatch_elf_open` / `create_section_list` / `create_symbol_list` /
//! `create_rela_list`: validate the header, read every section header, then
//! build the symbol and relocation arenas against the section arena.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::path::Path;

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::model::{ElfModel, Section, SectionKind, SecIdx, Status, Symbol, SymIdx};
use crate::raw::{
    Ehdr, FromReader, Rela, Shdr, Sym, ET_REL, SHN_XINDEX, SHT_RELA, SHT_SYMTAB,
    SHT_SYMTAB_SHNDX, STT_SECTION,
};
use crate::site;

fn fmt_err(function: &'static str, message: impl Into<String>) -> Error {
    Error::Format {
        site: site!(function),
        message: message.into(),
    }
}

/// Reads the string literal `rela`'s target symbol points into, when that
/// symbol lives in a mergeable string section — the merged `.rodata.str1.*`
/// sections `gcc` folds identical string-literal initializers into.
fn string_literal_for(model: &ElfModel, rela: &Rela) -> Option<String> {
    let target = model.symbols.get(rela.r_sym as usize)?;
    let sec_idx = target.section?;
    let sec = model.section(sec_idx);
    if !sec
        .sh_flags
        .contains(crate::raw::ShFlags::MERGE | crate::raw::ShFlags::STRINGS)
    {
        return None;
    }
    let start: usize = (target.raw.st_value as i64 + rela.r_addend).try_into().ok()?;
    let bytes = sec.data.get(start..)?;
    let end = bytes.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

fn cstr_at(buf: &[u8], offset: usize) -> Result<String> {
    let tail = buf.get(offset..).ok_or_else(|| {
        fmt_err("cstr_at", "string table offset past end of section")
    })?;
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}

/// Loads one relocatable object file into a fresh [`ElfModel`].
///
/// Rejects anything that is not `ET_REL`, and rejects any object carrying
/// program headers: the reference tool's `check_program_headers` treats a
/// non-zero `e_phnum` on a relocatable object as malformed input, since
/// program headers only make sense in a loadable image.
pub fn load_object(path: &Path) -> Result<ElfModel<'static>> {
    let bytes = fs::read(path).map_err(|e| {
        Error::io(site!("load_object"), format!("reading {}", path.display()), e)
    })?;
    load_object_bytes(&bytes)
}

pub fn load_object_bytes(bytes: &[u8]) -> Result<ElfModel<'static>> {
    let mut cursor = Cursor::new(bytes);
    let ehdr = Ehdr::from_reader(&mut cursor)?;

    if ehdr.e_type != ET_REL {
        return Err(fmt_err(
            "load_object_bytes",
            format!("expected ET_REL, found e_type={}", ehdr.e_type),
        ));
    }
    if ehdr.e_phnum != 0 {
        return Err(fmt_err(
            "load_object_bytes",
            "relocatable object carries program headers",
        ));
    }

    let arch = Arch::from_machine(ehdr.e_machine)?;
    let mut model = ElfModel::new(arch);

    let shnum = ehdr.e_shnum as usize;
    let mut raw_headers = Vec::with_capacity(shnum);
    for i in 0..shnum {
        let offset = ehdr.e_shoff as usize + i * ehdr.e_shentsize as usize;
        let slice = bytes.get(offset..).ok_or_else(|| {
            fmt_err("load_object_bytes", "section header table truncated")
        })?;
        let mut shdr_cursor = Cursor::new(slice);
        raw_headers.push(Shdr::from_reader(&mut shdr_cursor)?);
    }

    let shstrtab = raw_headers
        .get(ehdr.e_shstrndx as usize)
        .ok_or_else(|| fmt_err("load_object_bytes", "invalid e_shstrndx"))?;
    let shstrtab_data = section_bytes(bytes, shstrtab)?;

    let symtab_shndx_idx = raw_headers
        .iter()
        .position(|h| h.sh_type == SHT_SYMTAB_SHNDX);
    let symtab_shndx_table: Vec<u32> = match symtab_shndx_idx {
        Some(i) => {
            let data = section_bytes(bytes, &raw_headers[i])?;
            data.chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect()
        }
        None => Vec::new(),
    };

    // Pass 1: build every non-symtab, non-rela section as a Content section
    // with no symtab-derived links yet.
    let mut index_map: HashMap<usize, SecIdx> = HashMap::new();
    let mut symtab_raw_idx = None;
    let mut rela_headers: Vec<(usize, &Shdr)> = Vec::new();

    for (i, shdr) in raw_headers.iter().enumerate() {
        if shdr.sh_type == SHT_SYMTAB {
            symtab_raw_idx = Some(i);
            continue;
        }
        if shdr.sh_type == SHT_RELA {
            rela_headers.push((i, shdr));
            continue;
        }
        if shdr.sh_type == SHT_SYMTAB_SHNDX {
            continue;
        }
        let name = cstr_at(shstrtab_data, shdr.sh_name as usize)?;
        let data = section_bytes(bytes, shdr)?.to_vec();
        let idx = model.push_section(Section {
            name: Cow::Owned(name),
            index: SecIdx(0),
            sh_type: shdr.sh_type,
            sh_flags: shdr.sh_flags,
            sh_entsize: shdr.sh_entsize,
            sh_addralign: shdr.sh_addralign,
            size: shdr.sh_size,
            data,
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
        index_map.insert(i, idx);
    }

    // Pass 2: build the symbol table against the now-complete section arena.
    if let Some(si) = symtab_raw_idx {
        let symtab_hdr = &raw_headers[si];
        let data = section_bytes(bytes, symtab_hdr)?;
        let strtab_hdr = raw_headers
            .get(symtab_hdr.sh_link as usize)
            .ok_or_else(|| fmt_err("load_object_bytes", "symtab sh_link out of range"))?;
        let strtab_data = section_bytes(bytes, strtab_hdr)?;

        let entsize = if symtab_hdr.sh_entsize == 0 {
            crate::raw::Sym::WRITTEN_SIZE as u64
        } else {
            symtab_hdr.sh_entsize
        };
        use crate::raw::HasWrittenSize;
        let count = data.len() / entsize as usize;
        for i in 0..count {
            let off = i * entsize as usize;
            let mut c = Cursor::new(&data[off..]);
            let raw: Sym = Sym::from_reader(&mut c)?;
            let mut name = if raw.st_name == 0 {
                String::new()
            } else {
                cstr_at(strtab_data, raw.st_name as usize)?
            };

            let shndx = if raw.st_shndx == SHN_XINDEX {
                *symtab_shndx_table
                    .get(i)
                    .ok_or_else(|| fmt_err("load_object_bytes", "missing SHN_XINDEX entry"))?
                    as usize
            } else {
                raw.st_shndx as usize
            };
            let section = index_map.get(&shndx).copied();

            if raw.kind() == STT_SECTION {
                if let Some(sec_idx) = section {
                    name = model.section(sec_idx).name.to_string();
                }
            }

            let sym_idx = model.push_symbol(Symbol {
                name: Cow::Owned(name),
                index: SymIdx(0),
                raw,
                section,
                parent: None,
                children: Vec::new(),
                status: Status::Same,
                include: false,
                strip: crate::model::Strip::Default,
                twin: None,
                relf_match: None,
                needs_partial_resolve: false,
            });

            if raw.kind() == STT_SECTION {
                if let Some(sec_idx) = section {
                    if let SectionKind::Content { secsym, .. } =
                        &mut model.section_mut(sec_idx).kind
                    {
                        *secsym = Some(sym_idx);
                    }
                }
            }
        }
    }

    // Pass 3: rela sections, linked to their base content section.
    for (i, shdr) in rela_headers {
        let base_raw = shdr.sh_info as usize;
        let base_idx = *index_map.get(&base_raw).ok_or_else(|| {
            fmt_err("load_object_bytes", "rela section sh_info has no matching base section")
        })?;
        let name = cstr_at(shstrtab_data, shdr.sh_name as usize)?;
        let data = section_bytes(bytes, shdr)?;
        use crate::raw::HasWrittenSize;
        let entsize = if shdr.sh_entsize == 0 {
            Rela::WRITTEN_SIZE
        } else {
            shdr.sh_entsize as usize
        };
        let count = data.len() / entsize;
        let mut relas = Vec::with_capacity(count);
        for j in 0..count {
            let off = j * entsize;
            let mut c = Cursor::new(&data[off..]);
            relas.push(Rela::from_reader(&mut c)?);
        }
        for rela in relas.iter_mut() {
            rela.string = string_literal_for(&model, rela);
        }

        let rela_idx = model.push_section(Section {
            name: Cow::Owned(name),
            index: SecIdx(0),
            sh_type: shdr.sh_type,
            sh_flags: shdr.sh_flags,
            sh_entsize: shdr.sh_entsize,
            sh_addralign: shdr.sh_addralign,
            size: shdr.sh_size,
            data: Vec::new(),
            status: Status::Same,
            include: false,
            ignore: false,
            grouped: false,
            twin: None,
            kind: SectionKind::Relocation {
                base: base_idx,
                relas,
            },
        });
        index_map.insert(i, rela_idx);
        if let SectionKind::Content { rela, .. } = &mut model.section_mut(base_idx).kind {
            *rela = Some(rela_idx);
        }
    }

    model.set_raw_section_index(index_map);
    Ok(model)
}

fn section_bytes<'a>(bytes: &'a [u8], shdr: &Shdr) -> Result<&'a [u8]> {
    if shdr.sh_type == crate::raw::SHT_NOBITS || shdr.sh_size == 0 {
        return Ok(&[]);
    }
    bytes
        .get(shdr.sh_offset as usize..(shdr.sh_offset + shdr.sh_size) as usize)
        .ok_or_else(|| fmt_err("section_bytes", "section data runs past end of file"))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::raw::{
        HasWrittenSize, Identifier, ToWriter, ELFCLASS64, ELFDATA2LSB,
    };

    fn build_minimal_object() -> Vec<u8> {
        // A minimal ET_REL object: ELF header, one NULL section, shstrtab
        // with one entry, symtab with the NULL symbol only.
        let shstrtab_data: Vec<u8> = b"\0.shstrtab\0".to_vec();
        let mut sections = Vec::new();

        // section 0: SHT_NULL
        sections.push((0u32, 0u32, 0u64, 0u64, vec![]));
        // section 1: .shstrtab
        sections.push((1u32, crate::raw::SHT_STRTAB, 0u64, 0u64, shstrtab_data.clone()));

        let ehdr_size = Ehdr::WRITTEN_SIZE as u64;
        let mut offset = ehdr_size;
        let mut shdrs_bytes = Vec::new();
        let mut data_bytes = Vec::new();
        let mut final_sections = Vec::new();
        for (name_off, sh_type, _, _, data) in &sections {
            let this_off = offset;
            data_bytes.extend_from_slice(data);
            offset += data.len() as u64;
            final_sections.push((*name_off, *sh_type, this_off, data.len() as u64));
        }

        for (name_off, sh_type, sh_offset, sh_size) in &final_sections {
            let shdr = Shdr::builder()
                .sh_name(*name_off)
                .sh_type(*sh_type)
                .sh_flags(crate::raw::ShFlags::empty())
                .sh_addr(0)
                .sh_offset(*sh_offset)
                .sh_size(*sh_size)
                .sh_link(0)
                .sh_info(0)
                .sh_addralign(1)
                .sh_entsize(0)
                .build();
            shdr.to_writer(&mut shdrs_bytes).unwrap();
        }

        let shoff = ehdr_size + data_bytes.len() as u64;
        let ehdr = Ehdr::builder()
            .ident(Identifier {
                class: ELFCLASS64,
                data: ELFDATA2LSB,
                version: 1,
                os_abi: 0,
                abi_version: 0,
            })
            .e_type(ET_REL)
            .e_machine(crate::arch::EM_X86_64)
            .e_version(1)
            .e_entry(0)
            .e_phoff(0)
            .e_shoff(shoff)
            .e_flags(0)
            .e_ehsize(Ehdr::WRITTEN_SIZE as u16)
            .e_phentsize(0)
            .e_phnum(0)
            .e_shentsize(Shdr::WRITTEN_SIZE as u16)
            .e_shnum(final_sections.len() as u16)
            .e_shstrndx(1)
            .build();

        let mut out = Vec::new();
        ehdr.to_writer(&mut out).unwrap();
        out.extend_from_slice(&data_bytes);
        out.extend_from_slice(&shdrs_bytes);
        out
    }

    #[test]
    fn loads_minimal_object() {
        let bytes = build_minimal_object();
        let model = load_object_bytes(&bytes).expect("should parse");
        assert_eq!(model.sections.len(), 2);
        assert_eq!(model.section_by_name(".shstrtab"), Some(SecIdx(1)));
    }

    #[test]
    fn rejects_non_rel_type() {
        let mut bytes = build_minimal_object();
        // e_type lives right after the 16-byte identifier.
        bytes[16] = 2; // ET_EXEC
        bytes[17] = 0;
        assert!(load_object_bytes(&bytes).is_err());
    }
}
