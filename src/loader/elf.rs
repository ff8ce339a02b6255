//! Guest ELF image loading.
//!
//! Images are ELF class32 little-endian with the XCore machine type (0xCB,
//! or the legacy 0xB49E). Every program header with a non-zero file size is
//! copied to its physical address, provided the whole segment lies inside
//! the core's RAM window. The entry point comes from `e_entry` when it is a
//! valid RAM address, otherwise the RAM base.

use goblin::elf::Elf;
use thiserror::Error;

use crate::device::core::Core;

/// Current XCore ELF machine type.
pub const XCORE_ELF_MACHINE: u16 = 0xCB;
/// Machine type used by older toolchains.
pub const XCORE_ELF_MACHINE_OLD: u16 = 0xB49E;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("not a valid ELF image: {0}")]
    Parse(#[from] goblin::error::Error),

    #[error("not an XCore ELF (machine type {0:#x})")]
    WrongMachine(u16),

    #[error("no ELF program headers")]
    NoProgramHeaders,

    #[error("program header {0} has an invalid file offset")]
    InvalidOffset(usize),

    #[error("program header {0} does not fit in memory")]
    SegmentOutOfRange(usize),
}

/// What loading an image produced: where to start, and where the host trap
/// symbols live.
#[derive(Debug, Clone, Default)]
pub struct LoadedImage {
    pub entry_point: u32,
    pub syscall_address: Option<u32>,
    pub exception_address: Option<u32>,
}

/// Load an ELF image into a core's RAM.
pub fn load_elf(core: &mut Core, data: &[u8]) -> Result<LoadedImage, LoadError> {
    let elf = Elf::parse(data)?;
    let machine = elf.header.e_machine;
    if machine != XCORE_ELF_MACHINE && machine != XCORE_ELF_MACHINE_OLD {
        return Err(LoadError::WrongMachine(machine));
    }
    if elf.program_headers.is_empty() {
        return Err(LoadError::NoProgramHeaders);
    }

    for (i, phdr) in elf.program_headers.iter().enumerate() {
        if phdr.p_filesz == 0 {
            continue;
        }
        if phdr.p_offset as usize > data.len()
            || (phdr.p_offset + phdr.p_filesz) as usize > data.len()
        {
            return Err(LoadError::InvalidOffset(i));
        }
        let paddr = phdr.p_paddr as u32;
        let end = paddr.wrapping_add(phdr.p_memsz as u32);
        if core.is_valid_ram_address(paddr) && core.is_valid_ram_address(end) {
            let bytes = &data[phdr.p_offset as usize..(phdr.p_offset + phdr.p_filesz) as usize];
            core.write_memory(paddr, bytes);
            log::debug!(
                "loaded segment {}: {:#x}..{:#x} ({} bytes)",
                i,
                paddr,
                paddr + phdr.p_filesz as u32,
                phdr.p_filesz
            );
        } else if !core.is_valid_ram_address(phdr.p_vaddr as u32)
            || !core.is_valid_ram_address((phdr.p_vaddr as u32).wrapping_add(phdr.p_memsz as u32))
        {
            return Err(LoadError::SegmentOutOfRange(i));
        }
    }

    let mut image = LoadedImage { entry_point: core.ram_base, ..LoadedImage::default() };
    let entry = elf.header.e_entry as u32;
    if entry != 0 {
        if core.is_valid_ram_address(entry) {
            image.entry_point = entry;
        } else {
            log::warn!("invalid ELF entry point {:#x}", entry);
        }
    }

    for sym in elf.syms.iter() {
        let Some(name) = elf.strtab.get_at(sym.st_name) else {
            continue;
        };
        match name {
            "_DoSyscall" => image.syscall_address = Some(sym.st_value as u32),
            "_DoException" => image.exception_address = Some(sym.st_value as u32),
            _ => {}
        }
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ElfBuilder;

    #[test]
    fn test_load_simple_image() {
        let mut core = Core::new(0);
        let base = core.ram_base;
        let elf = ElfBuilder::new(base)
            .code(base, &[0x1234, 0x5678])
            .symbol("_DoSyscall", base + 0x40)
            .build();
        let image = load_elf(&mut core, &elf).unwrap();
        assert_eq!(image.entry_point, base);
        assert_eq!(image.syscall_address, Some(base + 0x40));
        assert_eq!(image.exception_address, None);
        assert_eq!(core.read_u16(base), 0x1234);
        assert_eq!(core.read_u16(base + 2), 0x5678);
    }

    #[test]
    fn test_rejects_wrong_machine() {
        let mut core = Core::new(0);
        let mut elf = ElfBuilder::new(core.ram_base).code(core.ram_base, &[0]).build();
        // Patch e_machine to something else.
        elf[18] = 0x3E;
        elf[19] = 0x00;
        match load_elf(&mut core, &elf) {
            Err(LoadError::WrongMachine(0x3E)) => {}
            other => panic!("expected WrongMachine, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_segment_outside_ram() {
        let mut core = Core::new(0);
        let elf = ElfBuilder::new(core.ram_base).code(0x100, &[0]).build();
        assert!(matches!(load_elf(&mut core, &elf), Err(LoadError::SegmentOutOfRange(_))));
    }

    #[test]
    fn test_rejects_virtual_range_overflowing_ram() {
        use byteorder::{ByteOrder, LittleEndian};

        let mut core = Core::new(0);
        let base = core.ram_base;
        let size = 1u32 << core.ram_size_log2;
        // Physical address outside RAM; patch the virtual address so the
        // start is in the window but the end overflows out of it.
        let mut elf =
            ElfBuilder::new(base).code(0x100, &[0, 0, 0, 0]).build();
        let phdr = 52; // first program header
        LittleEndian::write_u32(&mut elf[phdr + 8..phdr + 12], base + size - 2);
        assert!(matches!(load_elf(&mut core, &elf), Err(LoadError::SegmentOutOfRange(_))));
    }

    #[test]
    fn test_invalid_entry_falls_back_to_ram_base() {
        let mut core = Core::new(0);
        let base = core.ram_base;
        let elf = ElfBuilder::new(0x40).code(base, &[0]).build();
        let image = load_elf(&mut core, &elf).unwrap();
        assert_eq!(image.entry_point, base);
    }
}
