//! On-disk ELF64 little-endian structures: the identifier, the file header,
//! section headers, symbol table entries, and relocation-with-addend
//! entries, plus the `FromReader`/`ToWriter`/`HasWrittenSize` traits used to
//! move between bytes and these structures.
//!
//! Narrowed to ELF64 LE only: every architecture this tool targets (x86_64,
//! aarch64, riscv64) only ever appears as ELF64 little-endian in practice, so
//! the class/data-encoding generality of a general-purpose ELF crate is
//! dropped in favor of plain struct fields.

use std::io::{Read, Write};

use bitflags::bitflags;
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};
use crate::site;

/// Reads `Self` from a byte stream positioned at the start of its on-disk representation.
pub trait FromReader: Sized {
    fn from_reader<R: Read>(reader: &mut R) -> Result<Self>;
}

/// Writes `Self`'s on-disk representation to a byte stream.
pub trait ToWriter {
    fn to_writer<W: Write>(&self, writer: &mut W) -> Result<()>;
}

/// The number of bytes `Self`'s on-disk representation occupies.
pub trait HasWrittenSize {
    const WRITTEN_SIZE: usize;
}

fn io_err(site_fn: &'static str, e: std::io::Error) -> Error {
    Error::io(
        crate::error::Site::new(file!(), site_fn, line!()),
        "I/O error while parsing an ELF structure",
        e,
    )
}

pub const EI_NIDENT: usize = 16;
pub const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identifier {
    pub class: u8,
    pub data: u8,
    pub version: u8,
    pub os_abi: u8,
    pub abi_version: u8,
}

impl FromReader for Identifier {
    fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; EI_NIDENT];
        reader.read_exact(&mut buf).map_err(|e| io_err("Identifier::from_reader", e))?;
        if buf[0..4] != ELFMAG {
            return Err(Error::Format {
                site: site!("Identifier::from_reader"),
                message: "missing ELF magic number".to_string(),
            });
        }
        if buf[4] != ELFCLASS64 {
            return Err(Error::Format {
                site: site!("Identifier::from_reader"),
                message: format!("unsupported ELF class {} (only ELFCLASS64 is supported)", buf[4]),
            });
        }
        if buf[5] != ELFDATA2LSB {
            return Err(Error::Format {
                site: site!("Identifier::from_reader"),
                message: format!(
                    "unsupported ELF data encoding {} (only ELFDATA2LSB is supported)",
                    buf[5]
                ),
            });
        }
        Ok(Identifier {
            class: buf[4],
            data: buf[5],
            version: buf[6],
            os_abi: buf[7],
            abi_version: buf[8],
        })
    }
}

impl ToWriter for Identifier {
    fn to_writer<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buf = [0u8; EI_NIDENT];
        buf[0..4].copy_from_slice(&ELFMAG);
        buf[4] = self.class;
        buf[5] = self.data;
        buf[6] = self.version;
        buf[7] = self.os_abi;
        buf[8] = self.abi_version;
        writer.write_all(&buf).map_err(|e| io_err("Identifier::to_writer", e))
    }
}

impl HasWrittenSize for Identifier {
    const WRITTEN_SIZE: usize = EI_NIDENT;
}

/// Object file type. Only `ET_REL` is ever accepted as input; the engine
/// always produces `ET_REL` output.
pub const ET_REL: u16 = 1;

#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct Ehdr {
    pub ident: Identifier,
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

macro_rules! read_u16 { ($r:expr) => {{ let mut b = [0u8; 2]; $r.read_exact(&mut b).map_err(|e| io_err("Ehdr::from_reader", e))?; u16::from_le_bytes(b) }}; }
macro_rules! read_u32 { ($r:expr) => {{ let mut b = [0u8; 4]; $r.read_exact(&mut b).map_err(|e| io_err("Ehdr::from_reader", e))?; u32::from_le_bytes(b) }}; }
macro_rules! read_u64 { ($r:expr) => {{ let mut b = [0u8; 8]; $r.read_exact(&mut b).map_err(|e| io_err("Ehdr::from_reader", e))?; u64::from_le_bytes(b) }}; }

impl FromReader for Ehdr {
    fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let ident = Identifier::from_reader(reader)?;
        let e_type = read_u16!(reader);
        let e_machine = read_u16!(reader);
        let e_version = read_u32!(reader);
        let e_entry = read_u64!(reader);
        let e_phoff = read_u64!(reader);
        let e_shoff = read_u64!(reader);
        let e_flags = read_u32!(reader);
        let e_ehsize = read_u16!(reader);
        let e_phentsize = read_u16!(reader);
        let e_phnum = read_u16!(reader);
        let e_shentsize = read_u16!(reader);
        let e_shnum = read_u16!(reader);
        let e_shstrndx = read_u16!(reader);
        Ok(Ehdr {
            ident,
            e_type,
            e_machine,
            e_version,
            e_entry,
            e_phoff,
            e_shoff,
            e_flags,
            e_ehsize,
            e_phentsize,
            e_phnum,
            e_shentsize,
            e_shnum,
            e_shstrndx,
        })
    }
}

impl ToWriter for Ehdr {
    fn to_writer<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.ident.to_writer(writer)?;
        let err = |e| io_err("Ehdr::to_writer", e);
        writer.write_all(&self.e_type.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.e_machine.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.e_version.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.e_entry.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.e_phoff.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.e_shoff.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.e_flags.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.e_ehsize.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.e_phentsize.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.e_phnum.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.e_shentsize.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.e_shnum.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.e_shstrndx.to_le_bytes()).map_err(err)?;
        Ok(())
    }
}

impl HasWrittenSize for Ehdr {
    const WRITTEN_SIZE: usize = EI_NIDENT + 2 + 2 + 4 + 8 + 8 + 8 + 4 + 2 + 2 + 2 + 2 + 2 + 2;
}

bitflags! {
    /// Section header `sh_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShFlags: u64 {
        /// Section contains writable data.
        const WRITE = 0x1;
        /// Section occupies memory during process execution.
        const ALLOC = 0x2;
        /// Section contains executable instructions.
        const EXECINSTR = 0x4;
        /// Section may be merged to eliminate duplication.
        const MERGE = 0x10;
        /// Section contains null-terminated strings.
        const STRINGS = 0x20;
        /// `sh_info` holds a section header table index.
        const INFO_LINK = 0x40;
        /// Section is part of a link order.
        const LINK_ORDER = 0x80;
        /// Section is a member of a section group.
        const GROUP = 0x200;
    }
}

pub const SHT_NULL: u32 = 0;
pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;
pub const SHT_NOBITS: u32 = 8;
pub const SHT_GROUP: u32 = 17;
pub const SHT_SYMTAB_SHNDX: u32 = 18;

#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: ShFlags,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

impl FromReader for Shdr {
    fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let err = |e| io_err("Shdr::from_reader", e);
        let sh_name = read_u32!(reader);
        let sh_type = read_u32!(reader);
        let sh_flags = ShFlags::from_bits_truncate(read_u64!(reader));
        let sh_addr = read_u64!(reader);
        let sh_offset = read_u64!(reader);
        let sh_size = read_u64!(reader);
        let sh_link = read_u32!(reader);
        let sh_info = read_u32!(reader);
        let sh_addralign = read_u64!(reader);
        let sh_entsize = read_u64!(reader);
        let _ = err;
        Ok(Shdr {
            sh_name,
            sh_type,
            sh_flags,
            sh_addr,
            sh_offset,
            sh_size,
            sh_link,
            sh_info,
            sh_addralign,
            sh_entsize,
        })
    }
}

impl ToWriter for Shdr {
    fn to_writer<W: Write>(&self, writer: &mut W) -> Result<()> {
        let err = |e| io_err("Shdr::to_writer", e);
        writer.write_all(&self.sh_name.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.sh_type.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.sh_flags.bits().to_le_bytes()).map_err(err)?;
        writer.write_all(&self.sh_addr.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.sh_offset.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.sh_size.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.sh_link.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.sh_info.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.sh_addralign.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.sh_entsize.to_le_bytes()).map_err(err)?;
        Ok(())
    }
}

impl HasWrittenSize for Shdr {
    const WRITTEN_SIZE: usize = 4 + 4 + 8 + 8 + 8 + 8 + 4 + 4 + 8 + 8;
}

pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;
pub const STT_SECTION: u8 = 3;
pub const STT_FILE: u8 = 4;

pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;

pub const SHN_UNDEF: u16 = 0;
pub const SHN_ABS: u16 = 0xfff1;
pub const SHN_COMMON: u16 = 0xfff2;
pub const SHN_XINDEX: u16 = 0xffff;

#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct Sym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

impl Sym {
    pub fn bind(&self) -> u8 {
        self.st_info >> 4
    }

    pub fn kind(&self) -> u8 {
        self.st_info & 0xf
    }

    pub fn st_info_from(bind: u8, kind: u8) -> u8 {
        (bind << 4) | (kind & 0xf)
    }
}

impl FromReader for Sym {
    fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let err = |e| io_err("Sym::from_reader", e);
        let st_name = read_u32!(reader);
        let mut st_info = [0u8; 1];
        reader.read_exact(&mut st_info).map_err(err)?;
        let mut st_other = [0u8; 1];
        reader.read_exact(&mut st_other).map_err(err)?;
        let st_shndx = read_u16!(reader);
        let st_value = read_u64!(reader);
        let st_size = read_u64!(reader);
        Ok(Sym {
            st_name,
            st_info: st_info[0],
            st_other: st_other[0],
            st_shndx,
            st_value,
            st_size,
        })
    }
}

impl ToWriter for Sym {
    fn to_writer<W: Write>(&self, writer: &mut W) -> Result<()> {
        let err = |e| io_err("Sym::to_writer", e);
        writer.write_all(&self.st_name.to_le_bytes()).map_err(err)?;
        writer.write_all(&[self.st_info]).map_err(err)?;
        writer.write_all(&[self.st_other]).map_err(err)?;
        writer.write_all(&self.st_shndx.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.st_value.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.st_size.to_le_bytes()).map_err(err)?;
        Ok(())
    }
}

impl HasWrittenSize for Sym {
    const WRITTEN_SIZE: usize = 4 + 1 + 1 + 2 + 8 + 8;
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct Rela {
    pub r_offset: u64,
    pub r_sym: u32,
    pub r_type: u32,
    pub r_addend: i64,
    /// Cached copy of the string literal this relocation's target points
    /// into, when that target lives in a mergeable string section. Populated
    /// during load, not part of the on-disk record — `None` for relocations
    /// that do not target a string literal.
    #[builder(default)]
    pub string: Option<String>,
}

impl Rela {
    pub fn r_info(&self) -> u64 {
        ((self.r_sym as u64) << 32) | (self.r_type as u64)
    }

    pub fn from_info(r_offset: u64, r_info: u64, r_addend: i64) -> Self {
        Rela {
            r_offset,
            r_sym: (r_info >> 32) as u32,
            r_type: (r_info & 0xffff_ffff) as u32,
            r_addend,
            string: None,
        }
    }
}

impl FromReader for Rela {
    fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let r_offset = read_u64!(reader);
        let r_info = read_u64!(reader);
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf).map_err(|e| io_err("Rela::from_reader", e))?;
        let r_addend = i64::from_le_bytes(buf);
        Ok(Rela::from_info(r_offset, r_info, r_addend))
    }
}

impl ToWriter for Rela {
    fn to_writer<W: Write>(&self, writer: &mut W) -> Result<()> {
        let err = |e| io_err("Rela::to_writer", e);
        writer.write_all(&self.r_offset.to_le_bytes()).map_err(err)?;
        writer.write_all(&self.r_info().to_le_bytes()).map_err(err)?;
        writer.write_all(&self.r_addend.to_le_bytes()).map_err(err)?;
        Ok(())
    }
}

impl HasWrittenSize for Rela {
    const WRITTEN_SIZE: usize = 8 + 8 + 8;
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn sym_round_trips() {
        let sym = Sym::builder()
            .st_name(5)
            .st_info(Sym::st_info_from(STB_GLOBAL, STT_FUNC))
            .st_other(0)
            .st_shndx(3)
            .st_value(0x1000)
            .st_size(64)
            .build();
        let mut buf = Vec::new();
        sym.to_writer(&mut buf).unwrap();
        assert_eq!(buf.len(), Sym::WRITTEN_SIZE);
        let mut cursor = Cursor::new(buf);
        let back = Sym::from_reader(&mut cursor).unwrap();
        assert_eq!(back.st_name, 5);
        assert_eq!(back.bind(), STB_GLOBAL);
        assert_eq!(back.kind(), STT_FUNC);
        assert_eq!(back.st_value, 0x1000);
    }

    #[test]
    fn rela_round_trips_through_r_info() {
        let rela = Rela::from_info(0x40, ((7u64) << 32) | 2, -4);
        let mut buf = Vec::new();
        rela.to_writer(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        let back = Rela::from_reader(&mut cursor).unwrap();
        assert_eq!(back.r_sym, 7);
        assert_eq!(back.r_type, 2);
        assert_eq!(back.r_addend, -4);
    }

    #[test]
    fn identifier_rejects_bad_magic() {
        let bytes = [0u8; EI_NIDENT];
        let mut cursor = Cursor::new(bytes);
        assert!(Identifier::from_reader(&mut cursor).is_err());
    }
}
