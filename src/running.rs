//! Stage B: the symbol view over the already-running binary this patch will
//! be applied to. Grounded on `relf_open`/`lookup_relf`: a flat, STT_FILE-
//! partitioned symbol sequence rather than a full object graph, because the
//! running binary is only ever consulted for name/address lookups.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use crate::error::{Error, Result};
use crate::raw::{Ehdr, FromReader, Shdr, Sym, HasWrittenSize, SHT_SYMTAB, STT_FILE};
use crate::site;

#[derive(Debug, Clone)]
pub struct RunningSymbol {
    pub name: String,
    pub index: usize,
    pub kind: u8,
    pub bind: u8,
    pub shndx: u16,
    pub addr: u64,
    pub size: u64,
}

/// A flat, ordered view of the running binary's symbol table. Executables
/// (`ET_EXEC`) and shared objects (`ET_DYN`) are both accepted; whichever it
/// is only changes whether addresses are absolute or need base-relocation,
/// which is outside this view's concern.
pub struct RunningElf {
    pub is_exec: bool,
    pub symbols: Vec<RunningSymbol>,
}

pub enum LocalMatch<'a> {
    Found(&'a RunningSymbol),
    NotFound,
    /// The STT_FILE block that would contain this name is itself empty.
    Empty,
}

impl RunningElf {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| {
            Error::io(site!("RunningElf::load"), format!("reading {}", path.display()), e)
        })?;
        Self::load_bytes(&bytes)
    }

    pub fn load_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let ehdr = Ehdr::from_reader(&mut cursor)?;
        // ET_EXEC == 2, ET_DYN == 3; anything else cannot be "the running binary".
        let is_exec = ehdr.e_type == 2;
        if ehdr.e_type != 2 && ehdr.e_type != 3 {
            return Err(Error::Format {
                site: site!("RunningElf::load_bytes"),
                message: format!(
                    "running binary must be ET_EXEC or ET_DYN, found e_type={}",
                    ehdr.e_type
                ),
            });
        }

        let shnum = ehdr.e_shnum as usize;
        let mut headers = Vec::with_capacity(shnum);
        for i in 0..shnum {
            let offset = ehdr.e_shoff as usize + i * ehdr.e_shentsize as usize;
            let slice = bytes.get(offset..).ok_or_else(|| Error::Format {
                site: site!("RunningElf::load_bytes"),
                message: "section header table truncated".to_string(),
            })?;
            let mut c = Cursor::new(slice);
            headers.push(Shdr::from_reader(&mut c)?);
        }

        let symtab = headers.iter().find(|h| h.sh_type == SHT_SYMTAB);
        let mut symbols = Vec::new();
        if let Some(symtab_hdr) = symtab {
            let data = bytes
                .get(symtab_hdr.sh_offset as usize..(symtab_hdr.sh_offset + symtab_hdr.sh_size) as usize)
                .ok_or_else(|| Error::Format {
                    site: site!("RunningElf::load_bytes"),
                    message: "symtab runs past end of file".to_string(),
                })?;
            let strtab_hdr = headers
                .get(symtab_hdr.sh_link as usize)
                .ok_or_else(|| Error::Format {
                    site: site!("RunningElf::load_bytes"),
                    message: "symtab sh_link out of range".to_string(),
                })?;
            let strtab = bytes
                .get(strtab_hdr.sh_offset as usize..(strtab_hdr.sh_offset + strtab_hdr.sh_size) as usize)
                .ok_or_else(|| Error::Format {
                    site: site!("RunningElf::load_bytes"),
                    message: "strtab runs past end of file".to_string(),
                })?;

            let entsize = if symtab_hdr.sh_entsize == 0 {
                Sym::WRITTEN_SIZE
            } else {
                symtab_hdr.sh_entsize as usize
            };
            let count = data.len() / entsize;
            for i in 0..count {
                let off = i * entsize;
                let mut c = Cursor::new(&data[off..]);
                let raw = Sym::from_reader(&mut c)?;
                let name = if raw.st_name == 0 {
                    String::new()
                } else {
                    let tail = strtab.get(raw.st_name as usize..).unwrap_or(&[]);
                    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
                    String::from_utf8_lossy(&tail[..end]).into_owned()
                };
                symbols.push(RunningSymbol {
                    name,
                    index: i,
                    kind: raw.kind(),
                    bind: raw.bind(),
                    shndx: raw.st_shndx,
                    addr: raw.st_value,
                    size: raw.st_size,
                });
            }
        }

        Ok(RunningElf { is_exec, symbols })
    }

    /// Finds `name` with binding `bind` within the STT_FILE block starting
    /// at `file_start` (the index of a STT_FILE symbol, or 0 for "no
    /// preceding file marker"). Stops scanning at the next STT_FILE boundary,
    /// matching the reference tool's `locals_match`/`find_local_syms`.
    pub fn lookup_in_file_block(
        &self,
        file_start: usize,
        name: &str,
        bind: u8,
    ) -> LocalMatch<'_> {
        let mut found = None;
        let mut saw_any = false;
        for sym in self.symbols.iter().skip(file_start) {
            if sym.kind == STT_FILE && sym.index != file_start {
                break;
            }
            if sym.kind == STT_FILE {
                continue;
            }
            saw_any = true;
            if sym.name == name && sym.bind == bind {
                found = Some(sym);
            }
        }
        match found {
            Some(s) => LocalMatch::Found(s),
            None if saw_any => LocalMatch::NotFound,
            None => LocalMatch::Empty,
        }
    }

    /// Linear, whole-binary lookup by name and bind, matching `lookup_relf`:
    /// stops at the next STT_FILE boundary once a match has been found, and
    /// treats a second same-bind match before that boundary as ambiguous.
    pub fn lookup(&self, name: &str, bind: u8) -> Result<Option<&RunningSymbol>> {
        let mut found: Option<&RunningSymbol> = None;
        for sym in &self.symbols {
            if sym.kind == STT_FILE {
                if found.is_some() {
                    break;
                }
                continue;
            }
            if sym.name == name && sym.bind == bind {
                if found.is_some() {
                    return Err(Error::Resolution {
                        site: site!("RunningElf::lookup"),
                        message: format!("symbol {name} matches more than once before the next file boundary"),
                    });
                }
                found = Some(sym);
            }
        }
        Ok(found)
    }

    /// The 1-based positional index of the symbol at `target_index` among
    /// identical-named, identical-bind symbols within the STT_FILE block
    /// starting at `file_start` — 0 if `bind` is not `STB_LOCAL`, since
    /// globals are unique across the whole binary and need no disambiguation.
    pub fn sympos(&self, file_start: usize, target_index: usize, name: &str, bind: u8) -> u32 {
        if bind != crate::raw::STB_LOCAL {
            return 0;
        }
        let mut pos = 0u32;
        for sym in self.symbols.iter().skip(file_start) {
            if sym.kind == STT_FILE && sym.index != file_start {
                break;
            }
            if sym.name == name && sym.bind == bind {
                pos += 1;
                if sym.index == target_index {
                    return pos;
                }
            }
        }
        pos
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sym(name: &str, index: usize, kind: u8, bind: u8) -> RunningSymbol {
        RunningSymbol {
            name: name.to_string(),
            index,
            kind,
            bind,
            shndx: 1,
            addr: 0x1000 + index as u64,
            size: 16,
        }
    }

    #[test]
    fn lookup_stops_at_next_file_boundary() {
        let relf = RunningElf {
            is_exec: true,
            symbols: vec![
                sym("a.c", 0, STT_FILE, crate::raw::STB_LOCAL),
                sym("helper", 1, crate::raw::STT_FUNC, crate::raw::STB_LOCAL),
                sym("b.c", 2, STT_FILE, crate::raw::STB_LOCAL),
                sym("helper", 3, crate::raw::STT_FUNC, crate::raw::STB_LOCAL),
            ],
        };
        match relf.lookup_in_file_block(0, "helper", crate::raw::STB_LOCAL) {
            LocalMatch::Found(s) => assert_eq!(s.index, 1),
            _ => panic!("expected a match in the first file block"),
        }
        match relf.lookup_in_file_block(2, "helper", crate::raw::STB_LOCAL) {
            LocalMatch::Found(s) => assert_eq!(s.index, 3),
            _ => panic!("expected a match in the second file block"),
        }
    }

    #[test]
    fn sympos_counts_duplicates_within_block() {
        let relf = RunningElf {
            is_exec: true,
            symbols: vec![
                sym("a.c", 0, STT_FILE, crate::raw::STB_LOCAL),
                sym("dup", 1, crate::raw::STT_FUNC, crate::raw::STB_LOCAL),
                sym("dup", 2, crate::raw::STT_FUNC, crate::raw::STB_LOCAL),
            ],
        };
        assert_eq!(relf.sympos(0, 1, "dup", crate::raw::STB_LOCAL), 1);
        assert_eq!(relf.sympos(0, 2, "dup", crate::raw::STB_LOCAL), 2);
        assert_eq!(relf.sympos(0, 1, "dup", crate::raw::STB_GLOBAL), 0);
    }
}
