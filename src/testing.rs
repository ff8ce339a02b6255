//! Test support: a tiny assembler buffer and an ELF image builder.
//!
//! The test suite assembles guest programs with the encoders from
//! [`crate::exec::isa`] and wraps them into minimal XCore ELF images that
//! exercise the same loader path as real binaries.

use byteorder::{ByteOrder, LittleEndian};

use crate::exec::isa::{self, InstructionOpcode};

/// Assembly buffer tracking the current address.
#[derive(Debug, Clone)]
pub struct Asm {
    pub origin: u32,
    pub halfwords: Vec<u16>,
}

impl Asm {
    pub fn new(origin: u32) -> Self {
        Asm { origin, halfwords: Vec::new() }
    }

    /// Byte address of the next instruction.
    pub fn here(&self) -> u32 {
        self.origin + 2 * self.halfwords.len() as u32
    }

    pub fn emit(&mut self, hw: u16) -> &mut Self {
        self.halfwords.push(hw);
        self
    }

    pub fn emit_long(&mut self, hws: [u16; 2]) -> &mut Self {
        self.halfwords.extend_from_slice(&hws);
        self
    }

    /// Load a 16-bit constant, choosing the short or prefixed form.
    pub fn ldc(&mut self, reg: u32, value: u32) -> &mut Self {
        debug_assert!(value < 1 << 16);
        if value < 64 {
            self.emit(isa::encode_ru6(InstructionOpcode::Ldc, reg, value))
        } else {
            self.emit_long(isa::encode_lru6(InstructionOpcode::Ldc, reg, value))
        }
    }

    /// Load a full 32-bit constant using a scratch register.
    pub fn ldc32(&mut self, reg: u32, scratch: u32, value: u32) -> &mut Self {
        self.ldc(reg, value >> 16);
        self.ldc(scratch, 16);
        self.emit(isa::encode_3r(InstructionOpcode::Shl, reg, reg, scratch));
        self.ldc(scratch, value & 0xFFFF);
        self.emit(isa::encode_3r(InstructionOpcode::Or, reg, reg, scratch))
    }

    /// Branch-and-link to an absolute address, emitted as the prefixed
    /// form so the offset arithmetic is fixed-size.
    pub fn bl(&mut self, target: u32) -> &mut Self {
        let next = self.here() + 4;
        if target >= next {
            let imm = (target - next) / 2;
            self.emit_long(isa::encode_lu10(InstructionOpcode::Blrf, imm))
        } else {
            let imm = (next - target) / 2;
            self.emit_long(isa::encode_lu10(InstructionOpcode::Blrb, imm))
        }
    }

    /// Unconditional branch to an absolute address (prefixed form).
    pub fn bru(&mut self, target: u32) -> &mut Self {
        let next = self.here() + 4;
        if target >= next {
            let imm = (target - next) / 2;
            self.emit_long(isa::encode_lu6(InstructionOpcode::Brfu, imm))
        } else {
            let imm = (next - target) / 2;
            self.emit_long(isa::encode_lu6(InstructionOpcode::Brbu, imm))
        }
    }
}

/// Builds minimal XCore ELF32 images: loadable segments plus a symbol
/// table, enough for the loader to place code and find the trap symbols.
#[derive(Debug, Clone, Default)]
pub struct ElfBuilder {
    entry: u32,
    segments: Vec<(u32, Vec<u8>)>,
    symbols: Vec<(String, u32)>,
}

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const SHDR_SIZE: usize = 40;
const SYM_SIZE: usize = 16;

impl ElfBuilder {
    pub fn new(entry: u32) -> Self {
        ElfBuilder { entry, ..ElfBuilder::default() }
    }

    /// Add a code segment from halfwords.
    pub fn code(mut self, address: u32, halfwords: &[u16]) -> Self {
        let mut bytes = Vec::with_capacity(halfwords.len() * 2);
        for hw in halfwords {
            let mut b = [0u8; 2];
            LittleEndian::write_u16(&mut b, *hw);
            bytes.extend_from_slice(&b);
        }
        self.segments.push((address, bytes));
        self
    }

    /// Add a data segment.
    pub fn data(mut self, address: u32, bytes: &[u8]) -> Self {
        self.segments.push((address, bytes.to_vec()));
        self
    }

    pub fn symbol(mut self, name: &str, value: u32) -> Self {
        self.symbols.push((name.to_string(), value));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let phnum = self.segments.len();
        let mut out = vec![0u8; EHDR_SIZE + phnum * PHDR_SIZE];

        // Segment data.
        let mut seg_offsets = Vec::new();
        for (_, bytes) in &self.segments {
            seg_offsets.push(out.len());
            out.extend_from_slice(bytes);
        }
        while out.len() % 4 != 0 {
            out.push(0);
        }

        // Symbol table: null entry plus one per symbol.
        let symtab_offset = out.len();
        let mut strtab = vec![0u8];
        out.extend_from_slice(&[0u8; SYM_SIZE]);
        for (name, value) in &self.symbols {
            let name_offset = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            let mut sym = [0u8; SYM_SIZE];
            LittleEndian::write_u32(&mut sym[0..4], name_offset);
            LittleEndian::write_u32(&mut sym[4..8], *value);
            sym[12] = 0x12; // global function
            LittleEndian::write_u16(&mut sym[14..16], 1);
            out.extend_from_slice(&sym);
        }
        let symtab_size = out.len() - symtab_offset;

        let strtab_offset = out.len();
        out.extend_from_slice(&strtab);

        let shstrtab = b"\0.symtab\0.strtab\0.shstrtab\0";
        let shstrtab_offset = out.len();
        out.extend_from_slice(shstrtab);
        while out.len() % 4 != 0 {
            out.push(0);
        }

        // Section headers: null, .symtab, .strtab, .shstrtab.
        let shoff = out.len();
        out.extend_from_slice(&[0u8; SHDR_SIZE]);
        out.extend_from_slice(&shdr(1, 2, symtab_offset, symtab_size, 2, 1, SYM_SIZE as u32));
        out.extend_from_slice(&shdr(9, 3, strtab_offset, strtab.len(), 0, 0, 0));
        out.extend_from_slice(&shdr(17, 3, shstrtab_offset, shstrtab.len(), 0, 0, 0));

        // ELF header.
        out[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        out[4] = 1; // 32-bit
        out[5] = 1; // little-endian
        out[6] = 1; // current version
        LittleEndian::write_u16(&mut out[16..18], 2); // ET_EXEC
        LittleEndian::write_u16(&mut out[18..20], crate::loader::XCORE_ELF_MACHINE);
        LittleEndian::write_u32(&mut out[20..24], 1);
        LittleEndian::write_u32(&mut out[24..28], self.entry);
        LittleEndian::write_u32(&mut out[28..32], EHDR_SIZE as u32); // e_phoff
        LittleEndian::write_u32(&mut out[32..36], shoff as u32);
        LittleEndian::write_u16(&mut out[40..42], EHDR_SIZE as u16);
        LittleEndian::write_u16(&mut out[42..44], PHDR_SIZE as u16);
        LittleEndian::write_u16(&mut out[44..46], phnum as u16);
        LittleEndian::write_u16(&mut out[46..48], SHDR_SIZE as u16);
        LittleEndian::write_u16(&mut out[48..50], 4);
        LittleEndian::write_u16(&mut out[50..52], 3); // shstrndx

        // Program headers.
        for (i, (address, bytes)) in self.segments.iter().enumerate() {
            let p = EHDR_SIZE + i * PHDR_SIZE;
            LittleEndian::write_u32(&mut out[p..p + 4], 1); // PT_LOAD
            LittleEndian::write_u32(&mut out[p + 4..p + 8], seg_offsets[i] as u32);
            LittleEndian::write_u32(&mut out[p + 8..p + 12], *address); // vaddr
            LittleEndian::write_u32(&mut out[p + 12..p + 16], *address); // paddr
            LittleEndian::write_u32(&mut out[p + 16..p + 20], bytes.len() as u32);
            LittleEndian::write_u32(&mut out[p + 20..p + 24], bytes.len() as u32);
            LittleEndian::write_u32(&mut out[p + 24..p + 28], 7); // rwx
            LittleEndian::write_u32(&mut out[p + 28..p + 32], 4);
        }
        out
    }
}

fn shdr(
    name: u32,
    sh_type: u32,
    offset: usize,
    size: usize,
    link: u32,
    info: u32,
    entsize: u32,
) -> [u8; SHDR_SIZE] {
    let mut out = [0u8; SHDR_SIZE];
    LittleEndian::write_u32(&mut out[0..4], name);
    LittleEndian::write_u32(&mut out[4..8], sh_type);
    LittleEndian::write_u32(&mut out[16..20], offset as u32);
    LittleEndian::write_u32(&mut out[20..24], size as u32);
    LittleEndian::write_u32(&mut out[24..28], link);
    LittleEndian::write_u32(&mut out[28..32], info);
    LittleEndian::write_u32(&mut out[32..36], 4);
    LittleEndian::write_u32(&mut out[36..40], entsize);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elf_parses_with_goblin() {
        let elf = ElfBuilder::new(0x10000)
            .code(0x10000, &[0x1234])
            .symbol("_DoSyscall", 0x10100)
            .build();
        let parsed = goblin::elf::Elf::parse(&elf).expect("valid ELF");
        assert_eq!(parsed.header.e_machine, crate::loader::XCORE_ELF_MACHINE);
        assert_eq!(parsed.header.e_entry, 0x10000);
        assert_eq!(parsed.program_headers.len(), 1);
        let names: Vec<&str> =
            parsed.syms.iter().filter_map(|s| parsed.strtab.get_at(s.st_name)).collect();
        assert!(names.contains(&"_DoSyscall"));
    }

    #[test]
    fn test_asm_addresses() {
        let mut asm = Asm::new(0x10000);
        asm.ldc(0, 5);
        assert_eq!(asm.here(), 0x10002);
        asm.ldc(1, 0x1234);
        assert_eq!(asm.here(), 0x10006);
    }
}
