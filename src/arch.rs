//! Per-architecture constants and the minimal instruction-length decoding
//! needed to compute relocation target offsets and recognize `__LINE__`
//! load-immediate patterns on x86_64.

use crate::error::{Error, Result};
use crate::site;

/// `e_machine` value for x86_64.
pub const EM_X86_64: u16 = 62;
/// `e_machine` value for AArch64.
pub const EM_AARCH64: u16 = 183;
/// `e_machine` value for RISC-V.
pub const EM_RISCV: u16 = 243;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Aarch64,
    Riscv64,
}

impl Arch {
    pub fn from_machine(e_machine: u16) -> Result<Self> {
        match e_machine {
            EM_X86_64 => Ok(Arch::X86_64),
            EM_AARCH64 => Ok(Arch::Aarch64),
            EM_RISCV => Ok(Arch::Riscv64),
            other => Err(Error::Arch {
                site: site!("Arch::from_machine"),
                message: format!("unsupported e_machine value {other}"),
            }),
        }
    }

    pub fn to_machine(self) -> u16 {
        match self {
            Arch::X86_64 => EM_X86_64,
            Arch::Aarch64 => EM_AARCH64,
            Arch::Riscv64 => EM_RISCV,
        }
    }
}

// x86_64 relocation types relevant to target-offset computation and rebuild.
pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_PC32: u32 = 2;
pub const R_X86_64_GOT32: u32 = 3;
pub const R_X86_64_PLT32: u32 = 4;
pub const R_X86_64_32: u32 = 10;
pub const R_X86_64_32S: u32 = 11;

// AArch64 relocation types relevant here.
pub const R_AARCH64_ABS64: u32 = 257;
pub const R_AARCH64_ABS32: u32 = 258;
pub const R_AARCH64_CALL26: u32 = 283;
pub const R_AARCH64_JUMP26: u32 = 282;

// RISC-V relocation types relevant here.
pub const R_RISCV_64: u32 = 2;
pub const R_RISCV_CALL: u32 = 18;
pub const R_RISCV_CALL_PLT: u32 = 19;

/// Length in bytes of the instruction starting at `code[offset..]`.
///
/// AArch64 instructions are always 4 bytes. RISC-V instructions are 2 bytes
/// (compressed, "C" extension) unless the low two bits of the first byte are
/// `0b11`, in which case they are 4 bytes. x86_64 uses the minimal decoder in
/// [`x86_64_insn_length`].
pub fn insn_length(arch: Arch, code: &[u8], offset: usize) -> Result<usize> {
    match arch {
        Arch::Aarch64 => Ok(4),
        Arch::Riscv64 => {
            let first = *code.get(offset).ok_or_else(|| Error::Format {
                site: site!("insn_length"),
                message: "instruction offset past end of section".to_string(),
            })?;
            Ok(if first & 0x3 == 0x3 { 4 } else { 2 })
        }
        Arch::X86_64 => x86_64_insn_length(code, offset),
    }
}

/// A minimal x86_64 instruction-length decoder: enough to skip legacy
/// prefixes, a single REX prefix, the opcode (including the 0x0f escape), and
/// the handful of ModRM/SIB/displacement/immediate combinations that appear
/// in relocatable object code around call/jump/mov-immediate sites.
///
/// This intentionally does not attempt to be a complete x86 disassembler; it
/// only needs to find the byte immediately after the instruction containing
/// a given relocation so that PC-relative target offsets can be computed.
pub fn x86_64_insn_length(code: &[u8], offset: usize) -> Result<usize> {
    let oob = || Error::Format {
        site: site!("x86_64_insn_length"),
        message: "instruction decode ran past end of section".to_string(),
    };
    let mut pos = offset;
    let byte = |p: usize| code.get(p).copied().ok_or_else(oob);

    // Legacy prefixes.
    loop {
        match byte(pos)? {
            0x66 | 0x67 | 0xf0 | 0xf2 | 0xf3 | 0x2e | 0x36 | 0x3e | 0x26 | 0x64 | 0x65 => {
                pos += 1;
            }
            _ => break,
        }
    }
    // REX prefix.
    let mut rex = 0u8;
    if (0x40..=0x4f).contains(&byte(pos)?) {
        rex = byte(pos)?;
        pos += 1;
    }

    let opcode = byte(pos)?;
    pos += 1;
    let two_byte = opcode == 0x0f;
    let opcode2 = if two_byte {
        let b = byte(pos)?;
        pos += 1;
        Some(b)
    } else {
        None
    };

    // Opcodes that take a 4-byte immediate and no ModRM (`mov reg, imm32`).
    if !two_byte && (0xb8..=0xbf).contains(&opcode) {
        let imm_bytes = if rex & 0x08 != 0 { 8 } else { 4 };
        return Ok(pos + imm_bytes - offset);
    }
    // `call rel32` / `jmp rel32`: 4-byte immediate, no ModRM. These are the
    // overwhelmingly common carriers of PC32/PLT32 relocations.
    if !two_byte && (opcode == 0xe8 || opcode == 0xe9) {
        return Ok(pos + 4 - offset);
    }
    // `jmp rel8`: 1-byte immediate, no ModRM.
    if !two_byte && opcode == 0xeb {
        return Ok(pos + 1 - offset);
    }

    let has_modrm = !two_byte || opcode2.is_some();
    if !has_modrm {
        return Ok(pos - offset);
    }

    let modrm = byte(pos)?;
    pos += 1;
    let md = modrm >> 6;
    let rm = modrm & 0x7;

    if md != 0b11 && rm == 0b100 {
        // SIB byte.
        pos += 1;
    }
    match md {
        0b00 => {
            if rm == 0b101 {
                pos += 4; // disp32 (RIP-relative on x86_64)
            }
        }
        0b01 => pos += 1,
        0b10 => pos += 4,
        _ => {}
    }

    // Opcodes that additionally carry an immediate.
    let imm_len = match (two_byte, opcode) {
        (false, 0x68) => 4,
        (false, 0x6a) => 1,
        (false, 0x80 | 0x82 | 0x83) => 1,
        (false, 0x81) => 4,
        (false, 0xc6) => 1,
        (false, 0xc7) => 4,
        _ => 0,
    };
    Ok(pos + imm_len - offset)
}

/// Recognizes the handful of x86_64 `mov imm32, %reg` encodings the line-macro
/// filter uses to tell "only the inlined `__LINE__` constant changed" apart
/// from a real code change: `0xbe` (`mov imm,%esi`), `0xba` (`mov imm,%edx`),
/// and `0x41 0xb8` (REX.B + `mov imm,%r8d`).
pub fn insn_is_load_immediate(arch: Arch, code: &[u8], offset: usize) -> bool {
    if arch != Arch::X86_64 {
        return false;
    }
    match code.get(offset) {
        Some(0xbe) | Some(0xba) => true,
        Some(0x41) => code.get(offset + 1) == Some(&0xb8),
        _ => false,
    }
}

/// Computes the addend-relative target offset for a relocation whose raw
/// addend is `addend`, given the instruction bytes of the section it lives
/// in and the relocation's offset within that section.
///
/// For RISC-V and AArch64 the addend is used as-is. For x86_64, absolute
/// relocations (and any relocation outside a text-like section) also use the
/// addend as-is; PC-relative relocations (`PC32`/`PLT32`/`GOT32`) instead need
/// the offset of the byte following the instruction that contains them,
/// because the addend alone does not capture instruction length.
pub fn rela_target_offset(
    arch: Arch,
    reloc_type: u32,
    addend: i64,
    is_text: bool,
    code: &[u8],
    rela_offset: u64,
) -> Result<i64> {
    match arch {
        Arch::Riscv64 | Arch::Aarch64 => Ok(addend),
        Arch::X86_64 => {
            let pc_relative = matches!(reloc_type, R_X86_64_PC32 | R_X86_64_PLT32 | R_X86_64_GOT32);
            if !is_text || !pc_relative {
                return Ok(addend);
            }
            let insn_start = rela_offset as usize;
            let len = x86_64_insn_length(code, insn_start)?;
            Ok((insn_start + len) as i64 - rela_offset as i64)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recognizes_supported_machines() {
        assert_eq!(Arch::from_machine(EM_X86_64).unwrap(), Arch::X86_64);
        assert_eq!(Arch::from_machine(EM_AARCH64).unwrap(), Arch::Aarch64);
        assert_eq!(Arch::from_machine(EM_RISCV).unwrap(), Arch::Riscv64);
        assert!(Arch::from_machine(3).is_err());
    }

    #[test]
    fn aarch64_insns_are_always_four_bytes() {
        let code = [0u8; 16];
        assert_eq!(insn_length(Arch::Aarch64, &code, 4).unwrap(), 4);
    }

    #[test]
    fn riscv_compressed_detection() {
        // low bits != 0b11 -> 2-byte compressed instruction
        let code = [0b0000_0001, 0x00, 0x00, 0x00];
        assert_eq!(insn_length(Arch::Riscv64, &code, 0).unwrap(), 2);
        // low bits == 0b11 -> 4-byte instruction
        let code = [0b0000_0011, 0x00, 0x00, 0x00];
        assert_eq!(insn_length(Arch::Riscv64, &code, 0).unwrap(), 4);
    }

    #[test]
    fn x86_64_mov_imm32_esi() {
        // be 2a 00 00 00       mov    $0x2a,%esi
        let code = [0xbe, 0x2a, 0x00, 0x00, 0x00];
        assert_eq!(x86_64_insn_length(&code, 0).unwrap(), 5);
        assert!(insn_is_load_immediate(Arch::X86_64, &code, 0));
    }

    #[test]
    fn x86_64_rex_mov_imm32_r8d() {
        // 41 b8 2a 00 00 00    mov    $0x2a,%r8d
        let code = [0x41, 0xb8, 0x2a, 0x00, 0x00, 0x00];
        assert_eq!(x86_64_insn_length(&code, 0).unwrap(), 6);
        assert!(insn_is_load_immediate(Arch::X86_64, &code, 0));
    }

    #[test]
    fn x86_64_call_rel32_is_not_load_immediate() {
        // e8 00 00 00 00       call   ...
        let code = [0xe8, 0x00, 0x00, 0x00, 0x00];
        assert!(!insn_is_load_immediate(Arch::X86_64, &code, 0));
    }
}
