//! The in-memory object graph: sections, symbols, relocations, arena-indexed
//! instead of the reference tool's intrusive pointer lists.
//!
//! Two design-notes mappings are applied throughout this module: the C
//! intrusive lists become an arena (`Vec<Section>` / `Vec<Symbol>`) addressed
//! by a typed index (`SecIdx` / `SymIdx`), and the cold/part "twin" links
//! become `Option<SecIdx>` / `Option<SymIdx>` rather than raw pointers. The
//! NULL symbol is not special-cased through `Option`: it is symbol index 0,
//! exactly as in the source binary's own symbol table, because code that
//! walks symbols by index needs index 0 to mean "the NULL symbol", not
//! "absent".

use std::borrow::Cow;
use std::collections::HashMap;

use crate::arch::Arch;
use crate::raw::{Rela, ShFlags, Sym};

/// Index into an [`ElfModel`]'s section arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecIdx(pub usize);

/// Index into an [`ElfModel`]'s symbol arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymIdx(pub usize);

/// Symbol index 0: always the NULL symbol, present in every valid symtab.
pub const NULL_SYM: SymIdx = SymIdx(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Same,
    Changed,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strip {
    /// Kept unless nothing references it.
    Default,
    /// Referenced by an included relocation; must be kept.
    Used,
    /// Dropped from the output symbol table.
    Strip,
}

/// A name that is either borrowed from the mapped source ELF or owned
/// because this model synthesized or renamed it (e.g. the `.cold`-suffixed
/// name manufactured for a split cold partition's symbol).
pub type SectionName<'elf> = Cow<'elf, str>;

/// What a section's relocation-adjacent fields mean depends on whether the
/// section itself carries relocations (a `.rela.*` section) or is the
/// content being relocated. The reference tool overlays both shapes on one
/// struct via a union; here that is a tagged enum instead.
#[derive(Debug, Clone)]
pub enum SectionKind {
    /// A `.rela.*` section: relocates `base`, carries an ordered rela list.
    Relocation {
        base: SecIdx,
        relas: Vec<Rela>,
    },
    /// An ordinary content section: optionally has a section symbol, a
    /// bundled function/object symbol, and a relocation section.
    Content {
        secsym: Option<SymIdx>,
        sym: Option<SymIdx>,
        rela: Option<SecIdx>,
    },
}

#[derive(Debug, Clone)]
pub struct Section<'elf> {
    pub name: SectionName<'elf>,
    pub index: SecIdx,
    pub sh_type: u32,
    pub sh_flags: ShFlags,
    pub sh_entsize: u64,
    pub sh_addralign: u64,
    pub size: u64,
    pub data: Vec<u8>,
    pub status: Status,
    pub include: bool,
    pub ignore: bool,
    pub grouped: bool,
    pub twin: Option<SecIdx>,
    pub kind: SectionKind,
}

impl<'elf> Section<'elf> {
    pub fn is_rela(&self) -> bool {
        matches!(self.kind, SectionKind::Relocation { .. })
    }

    pub fn base(&self) -> Option<SecIdx> {
        match &self.kind {
            SectionKind::Relocation { base, .. } => Some(*base),
            SectionKind::Content { .. } => None,
        }
    }

    pub fn relas(&self) -> &[Rela] {
        match &self.kind {
            SectionKind::Relocation { relas, .. } => relas,
            SectionKind::Content { .. } => &[],
        }
    }

    pub fn relas_mut(&mut self) -> Option<&mut Vec<Rela>> {
        match &mut self.kind {
            SectionKind::Relocation { relas, .. } => Some(relas),
            SectionKind::Content { .. } => None,
        }
    }

    pub fn bundled_sym(&self) -> Option<SymIdx> {
        match &self.kind {
            SectionKind::Content { sym, .. } => *sym,
            SectionKind::Relocation { .. } => None,
        }
    }

    pub fn set_bundled_sym(&mut self, sym: SymIdx) {
        if let SectionKind::Content { sym: slot, .. } = &mut self.kind {
            *slot = Some(sym);
        }
    }

    pub fn secsym(&self) -> Option<SymIdx> {
        match &self.kind {
            SectionKind::Content { secsym, .. } => *secsym,
            SectionKind::Relocation { .. } => None,
        }
    }

    pub fn rela_section(&self) -> Option<SecIdx> {
        match &self.kind {
            SectionKind::Content { rela, .. } => *rela,
            SectionKind::Relocation { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub old_addr: u64,
    pub old_size: u64,
    pub sympos: u32,
}

#[derive(Debug, Clone)]
pub struct Symbol<'elf> {
    pub name: SectionName<'elf>,
    pub index: SymIdx,
    pub raw: Sym,
    pub section: Option<SecIdx>,
    pub parent: Option<SymIdx>,
    pub children: Vec<SymIdx>,
    pub status: Status,
    pub include: bool,
    pub strip: Strip,
    pub twin: Option<SymIdx>,
    /// Set once this symbol has been matched against the running binary's
    /// symbol view (stage H).
    pub relf_match: Option<ResolvedTarget>,
    /// Mirrors the reference tool's `SYM_OTHER` bit: a changed LOCAL symbol
    /// that was not itself included but is referenced by an included one,
    /// and therefore must be partially resolved against the running binary
    /// rather than statically linked.
    pub needs_partial_resolve: bool,
}

impl<'elf> Symbol<'elf> {
    pub fn bind(&self) -> u8 {
        self.raw.bind()
    }

    pub fn kind(&self) -> u8 {
        self.raw.kind()
    }

    pub fn is_local(&self) -> bool {
        self.bind() == crate::raw::STB_LOCAL
    }

    pub fn is_function(&self) -> bool {
        self.kind() == crate::raw::STT_FUNC
    }

    pub fn is_file(&self) -> bool {
        self.kind() == crate::raw::STT_FILE
    }
}

/// Owns the three insertion-ordered arenas (sections, symbols, string pool)
/// that make up one loaded ELF object, plus the architecture tag shared by
/// every entity in the model.
pub struct ElfModel<'elf> {
    pub arch: Arch,
    pub sections: Vec<Section<'elf>>,
    pub symbols: Vec<Symbol<'elf>>,
    strings: Vec<String>,
    /// Maps a raw section header index from the file this model was loaded
    /// from onto this model's own dense `SecIdx`. `load` re-densifies
    /// indices (skipping symtab/rela sections on the first pass, appending
    /// rela sections on the third), so anything that needs to translate a
    /// raw index found inside section data itself — `SHT_GROUP` member
    /// words, in particular — needs this map rather than assuming the two
    /// index spaces line up. Empty for a model not built by `load`.
    raw_section_index: HashMap<usize, SecIdx>,
}

impl<'elf> ElfModel<'elf> {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            sections: Vec::new(),
            symbols: Vec::new(),
            strings: Vec::new(),
            raw_section_index: HashMap::new(),
        }
    }

    pub fn set_raw_section_index(&mut self, map: HashMap<usize, SecIdx>) {
        self.raw_section_index = map;
    }

    pub fn section_by_raw_index(&self, raw_idx: usize) -> Option<SecIdx> {
        self.raw_section_index.get(&raw_idx).copied()
    }

    pub fn section(&self, idx: SecIdx) -> &Section<'elf> {
        &self.sections[idx.0]
    }

    pub fn section_mut(&mut self, idx: SecIdx) -> &mut Section<'elf> {
        &mut self.sections[idx.0]
    }

    pub fn symbol(&self, idx: SymIdx) -> &Symbol<'elf> {
        &self.symbols[idx.0]
    }

    pub fn symbol_mut(&mut self, idx: SymIdx) -> &mut Symbol<'elf> {
        &mut self.symbols[idx.0]
    }

    pub fn push_section(&mut self, mut section: Section<'elf>) -> SecIdx {
        let idx = SecIdx(self.sections.len());
        section.index = idx;
        self.sections.push(section);
        idx
    }

    pub fn push_symbol(&mut self, mut symbol: Symbol<'elf>) -> SymIdx {
        let idx = SymIdx(self.symbols.len());
        symbol.index = idx;
        self.symbols.push(symbol);
        idx
    }

    /// Dedup-or-append lookup into the string pool, returning the pool index
    /// (not a byte offset — the byte offset is computed once the pool is
    /// serialized, see `synth::strings`).
    pub fn offset_of_string(&mut self, s: &str) -> usize {
        if let Some(pos) = self.strings.iter().position(|existing| existing == s) {
            return pos;
        }
        self.strings.push(s.to_string());
        self.strings.len() - 1
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn section_by_name(&self, name: &str) -> Option<SecIdx> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.index)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn string_pool_dedups() {
        let mut model = ElfModel::new(Arch::X86_64);
        let a = model.offset_of_string("hello");
        let b = model.offset_of_string("world");
        let c = model.offset_of_string("hello");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(model.strings().len(), 2);
    }

    #[test]
    fn pushing_sections_assigns_dense_indices() {
        let mut model = ElfModel::new(Arch::Aarch64);
        let s0 = model.push_section(Section {
            name: Cow::Borrowed(""),
            index: SecIdx(0),
            sh_type: 0,
            sh_flags: ShFlags::empty(),
            sh_entsize: 0,
            sh_addralign: 0,
            size: 0,
            data: Vec::new(),
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
        let s1 = model.push_section(Section {
            name: Cow::Borrowed(".text.foo"),
            index: SecIdx(0),
            sh_type: 1,
            sh_flags: ShFlags::empty(),
            sh_entsize: 0,
            sh_addralign: 0,
            size: 0,
            data: Vec::new(),
            status: Status::New,
            include: true,
            ignore: false,
            grouped: false,
            twin: None,
            kind: SectionKind::Content {
                secsym: None,
                sym: None,
                rela: None,
            },
        });
        assert_eq!(s0, SecIdx(0));
        assert_eq!(s1, SecIdx(1));
        assert_eq!(model.section(s1).name, ".text.foo");
    }
}
