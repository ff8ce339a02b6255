//! A processor core: RAM, resource arenas and the opcode cache.
//!
//! # Performance
//!
//! The opcode cache holds one cell per RAM halfword. A cell starts as a
//! decode entry, is promoted to a pre-decoded interpret entry on first
//! execution, then to a fragment stub once hot, and finally to a fragment
//! entry once the fragment compiler has run (see [`crate::exec::jit`]).
//! Guest stores consult a per-halfword code bitmap so that only stores
//! overlapping compiled code pay the invalidation cost.

use crate::device::chanend::Chanend;
use crate::device::clock::ClockBlock;
use crate::device::lock::Lock;
use crate::device::port::Port;
use crate::device::resource::{ResourceId, ResourceType};
use crate::device::sync::Synchroniser;
use crate::device::thread::ThreadState;
use crate::device::timer::Timer;
use crate::device::xs1_spec::*;
use crate::exec::isa::{Instruction, InstructionOpcode};
use crate::exec::jit::JitCore;

/// Dispatch state of one opcode-cache cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellKind {
    /// Not yet decoded.
    #[default]
    Decode,
    /// Pre-decoded; interpreted with an execution-frequency counter.
    Interpret,
    /// Hot: the next execution invokes the fragment compiler.
    JitStub,
    /// Entry point of a compiled fragment.
    FragmentEntry,
    /// Host breakpoint; execution stops before this instruction.
    Breakpoint,
}

/// One opcode-cache cell: a handler kind plus the decoded operand tuple.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeCell {
    pub kind: CellKind,
    pub inst: Instruction,
    pub exec_count: u32,
}

impl Default for OpcodeCell {
    fn default() -> Self {
        OpcodeCell {
            kind: CellKind::Decode,
            inst: Instruction::new(InstructionOpcode::Nop, [0; 4], 2),
            exec_count: 0,
        }
    }
}

/// One processor core.
#[derive(Debug)]
pub struct Core {
    /// Value matched against the node field of incoming chanend IDs.
    pub core_id: u32,
    pub ram: Vec<u8>,
    pub ram_base: u32,
    pub ram_size_log2: u32,
    pub threads: Vec<ThreadState>,
    pub syncs: Vec<Synchroniser>,
    pub locks: Vec<Lock>,
    pub timers: Vec<Timer>,
    pub chanends: Vec<Chanend>,
    pub clock_blocks: Vec<ClockBlock>,
    pub ports: Vec<Port>,
    pub opcode_cache: Vec<OpcodeCell>,
    /// Bit per halfword: set while the halfword is covered by a compiled
    /// fragment.
    code_bits: Vec<u64>,
    pub jit: JitCore,
}

/// Flat port-array layout: offset of each width family.
const PORT_FAMILIES: [(u32, usize, usize); 5] = [
    (1, 0, NUM_1BIT_PORTS),
    (4, NUM_1BIT_PORTS, NUM_4BIT_PORTS),
    (8, NUM_1BIT_PORTS + NUM_4BIT_PORTS, NUM_8BIT_PORTS),
    (
        16,
        NUM_1BIT_PORTS + NUM_4BIT_PORTS + NUM_8BIT_PORTS,
        NUM_16BIT_PORTS,
    ),
    (
        32,
        NUM_1BIT_PORTS + NUM_4BIT_PORTS + NUM_8BIT_PORTS + NUM_16BIT_PORTS,
        NUM_32BIT_PORTS,
    ),
];

impl Core {
    pub fn new(core_id: u32) -> Self {
        let mut ports = Vec::with_capacity(NUM_PORTS);
        for (width, _, count) in PORT_FAMILIES {
            for _ in 0..count {
                ports.push(Port::new(width));
            }
        }
        let mut clock_blocks = vec![ClockBlock::default(); NUM_CLKBLKS];
        // Clock block 0 is the always-running reference clock.
        clock_blocks[0] = ClockBlock::reference();
        Core {
            core_id,
            ram: vec![0; RAM_SIZE as usize],
            ram_base: RAM_BASE,
            ram_size_log2: RAM_SIZE_LOG2,
            threads: vec![ThreadState::default(); NUM_THREADS],
            syncs: vec![Synchroniser::default(); NUM_SYNCS],
            locks: vec![Lock::default(); NUM_LOCKS],
            timers: vec![Timer::default(); NUM_TIMERS],
            chanends: vec![Chanend::default(); NUM_CHANENDS],
            clock_blocks,
            ports,
            opcode_cache: vec![OpcodeCell::default(); (RAM_SIZE / 2) as usize],
            code_bits: vec![0; (RAM_SIZE / 2 / 64) as usize],
            jit: JitCore::default(),
        }
    }

    /// The multiple the RAM window sits at: an address `a` is in RAM iff
    /// `a >> ram_size_log2 == ram_base_multiple`.
    #[inline]
    pub fn ram_base_multiple(&self) -> u32 {
        self.ram_base >> self.ram_size_log2
    }

    #[inline]
    pub fn is_valid_ram_address(&self, address: u32) -> bool {
        address >> self.ram_size_log2 == self.ram_base_multiple()
    }

    #[inline]
    pub fn ram_offset(&self, address: u32) -> usize {
        (address - self.ram_base) as usize
    }

    pub fn read_u8(&self, address: u32) -> u8 {
        self.ram[self.ram_offset(address)]
    }

    pub fn read_u16(&self, address: u32) -> u16 {
        let o = self.ram_offset(address);
        u16::from_le_bytes([self.ram[o], self.ram[o + 1]])
    }

    pub fn read_u32(&self, address: u32) -> u32 {
        let o = self.ram_offset(address);
        u32::from_le_bytes([self.ram[o], self.ram[o + 1], self.ram[o + 2], self.ram[o + 3]])
    }

    pub fn write_u8(&mut self, address: u32, value: u8) {
        let o = self.ram_offset(address);
        self.ram[o] = value;
    }

    pub fn write_u16(&mut self, address: u32, value: u16) {
        let o = self.ram_offset(address);
        self.ram[o..o + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, address: u32, value: u32) {
        let o = self.ram_offset(address);
        self.ram[o..o + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Bulk write used by the image loader. The caller has validated the
    /// address range.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) {
        let o = self.ram_offset(address);
        self.ram[o..o + data.len()].copy_from_slice(data);
        self.invalidate_cells(address, data.len() as u32);
    }

    /// Opcode-cache index for a program counter, or None if the PC does not
    /// point at an aligned RAM halfword.
    #[inline]
    pub fn opcode_index(&self, pc: u32) -> Option<usize> {
        if pc & 1 != 0 || !self.is_valid_ram_address(pc) {
            return None;
        }
        Some(((pc - self.ram_base) >> 1) as usize)
    }

    /// Reset the opcode cells covering `[address, address + len)` to decode
    /// entries. Used after any memory write over code. The preceding
    /// halfword is included: it may hold the decoded form of a prefixed
    /// instruction whose second halfword was overwritten.
    pub fn invalidate_cells(&mut self, address: u32, len: u32) {
        let first = ((address & !1).saturating_sub(2)).max(self.ram_base);
        let mut a = first;
        while a < address + len {
            if let Some(index) = self.opcode_index(a & !1) {
                self.opcode_cache[index] = OpcodeCell::default();
            }
            a += 2;
        }
    }

    // -- code-presence bitmap --------------------------------------------

    #[inline]
    fn code_bit_index(&self, address: u32) -> (usize, u64) {
        let halfword = (address - self.ram_base) >> 1;
        ((halfword / 64) as usize, 1u64 << (halfword % 64))
    }

    /// Whether any halfword in `[address, address + len)` is covered by a
    /// compiled fragment.
    pub fn code_present(&self, address: u32, len: u32) -> bool {
        let mut a = address & !1;
        while a < address + len {
            if self.is_valid_ram_address(a) {
                let (word, bit) = self.code_bit_index(a);
                if self.code_bits[word] & bit != 0 {
                    return true;
                }
            }
            a += 2;
        }
        false
    }

    pub fn set_code_present(&mut self, address: u32, len: u32) {
        let mut a = address & !1;
        while a < address + len {
            if self.is_valid_ram_address(a) {
                let (word, bit) = self.code_bit_index(a);
                self.code_bits[word] |= bit;
            }
            a += 2;
        }
    }

    pub fn clear_all_code_present(&mut self) {
        for w in self.code_bits.iter_mut() {
            *w = 0;
        }
    }

    // -- resource lookup --------------------------------------------------

    /// Flat port index for a port resource ID.
    pub fn port_index(&self, id: ResourceId) -> Option<usize> {
        if id.ty() != Some(ResourceType::Port) {
            return None;
        }
        let width = id.port_width();
        let num = id.num() as usize;
        for (w, offset, count) in PORT_FAMILIES {
            if w == width {
                if num < count {
                    return Some(offset + num);
                }
                return None;
            }
        }
        None
    }

    /// Port resource ID for a flat index.
    pub fn port_id(&self, index: usize) -> ResourceId {
        for (w, offset, count) in PORT_FAMILIES {
            if index < offset + count {
                return ResourceId::new(ResourceType::Port, (index - offset) as u32, w);
            }
        }
        unreachable!("port index out of range");
    }

    /// Resolve a resource ID to its arena index.
    pub fn resource_index(&self, id: ResourceId) -> Option<(ResourceType, usize)> {
        let ty = id.ty()?;
        let num = id.num() as usize;
        let index = match ty {
            ResourceType::Port => self.port_index(id)?,
            ResourceType::Timer if num < NUM_TIMERS => num,
            ResourceType::Chanend if num < NUM_CHANENDS => num,
            ResourceType::Sync if num < NUM_SYNCS => num,
            ResourceType::Thread if num < NUM_THREADS => num,
            ResourceType::Lock if num < NUM_LOCKS => num,
            ResourceType::ClkBlk if num < NUM_CLKBLKS => num,
            _ => return None,
        };
        Some((ty, index))
    }

    /// Find a free resource of an allocatable type for `getr`.
    pub fn find_free_resource(&self, ty: ResourceType) -> Option<usize> {
        match ty {
            ResourceType::Timer => self.timers.iter().position(|t| !t.base.in_use),
            ResourceType::Chanend => self.chanends.iter().position(|c| !c.base.in_use),
            ResourceType::Sync => self.syncs.iter().position(|s| !s.base.in_use),
            ResourceType::Lock => self.locks.iter().position(|l| !l.base.in_use),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_window() {
        let core = Core::new(0);
        assert!(core.is_valid_ram_address(RAM_BASE));
        assert!(core.is_valid_ram_address(RAM_BASE + RAM_SIZE - 1));
        assert!(!core.is_valid_ram_address(RAM_BASE - 1));
        assert!(!core.is_valid_ram_address(RAM_BASE + RAM_SIZE));
    }

    #[test]
    fn test_memory_roundtrip() {
        let mut core = Core::new(0);
        core.write_u32(RAM_BASE + 0x100, 0xDEADBEEF);
        assert_eq!(core.read_u32(RAM_BASE + 0x100), 0xDEADBEEF);
        assert_eq!(core.read_u8(RAM_BASE + 0x100), 0xEF);
        assert_eq!(core.read_u16(RAM_BASE + 0x102), 0xDEAD);
    }

    #[test]
    fn test_opcode_index() {
        let core = Core::new(0);
        assert_eq!(core.opcode_index(RAM_BASE), Some(0));
        assert_eq!(core.opcode_index(RAM_BASE + 2), Some(1));
        assert_eq!(core.opcode_index(RAM_BASE + 1), None);
        assert_eq!(core.opcode_index(0), None);
    }

    #[test]
    fn test_code_bitmap() {
        let mut core = Core::new(0);
        assert!(!core.code_present(RAM_BASE + 0x40, 4));
        core.set_code_present(RAM_BASE + 0x40, 8);
        assert!(core.code_present(RAM_BASE + 0x40, 1));
        assert!(core.code_present(RAM_BASE + 0x44, 2));
        assert!(!core.code_present(RAM_BASE + 0x48, 2));
        core.clear_all_code_present();
        assert!(!core.code_present(RAM_BASE + 0x40, 8));
    }

    #[test]
    fn test_port_index_lookup() {
        let core = Core::new(0);
        let p0 = ResourceId::new(ResourceType::Port, 0, 1);
        assert_eq!(core.port_index(p0), Some(0));
        let p4 = ResourceId::new(ResourceType::Port, 2, 4);
        assert_eq!(core.port_index(p4), Some(NUM_1BIT_PORTS + 2));
        let bad = ResourceId::new(ResourceType::Port, 99, 1);
        assert_eq!(core.port_index(bad), None);
        assert_eq!(core.port_id(0), p0);
        assert_eq!(core.port_id(NUM_1BIT_PORTS + 2), p4);
    }

    #[test]
    fn test_find_free_resource() {
        let mut core = Core::new(0);
        assert_eq!(core.find_free_resource(ResourceType::Timer), Some(0));
        core.timers[0].base.in_use = true;
        assert_eq!(core.find_free_resource(ResourceType::Timer), Some(1));
    }
}
