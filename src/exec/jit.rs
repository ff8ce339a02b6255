//! The fragment compiler.
//!
//! Hot straight-line runs of guest code are compiled into *fragments*:
//! pre-decoded instruction vectors executed back to back without refetch,
//! redecode or cache dispatch, with their memory checks consolidated at
//! fragment entry. A fragment is single-entry, extends until the first
//! branch (included), an undecodable halfword, or a host breakpoint, and
//! tail-chains to statically known successor fragments.
//!
//! Invalidation is coarse: a guest store that overlaps compiled code kills
//! every fragment containing the stored-to range plus the transitive closure
//! of fragments that tail-call into them. Killed fragments are demoted to
//! stubs immediately but their bodies are only reclaimed on the next
//! compilation pass, when no fragment can be mid-execution.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use smallvec::SmallVec;

use crate::device::core::{CellKind, Core};
use crate::exec::decode::decode;
use crate::exec::isa::{static_successors, Instruction, InstructionOpcode};

/// Executions of an interpret cell before it is promoted to a stub.
pub const DEFAULT_JIT_THRESHOLD: u32 = 128;

/// Upper bound on instructions per fragment.
const MAX_FRAGMENT_INSTS: usize = 64;

/// Base register of a guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemBase {
    Reg(u8),
    Dp,
    Sp,
}

/// A compile-time-known memory access performed by a fragment instruction.
/// All checks are evaluated against entry-time register values; a failure
/// bails out to the interpreter, which re-checks per instruction.
#[derive(Debug, Clone, Copy)]
pub struct MemoryCheck {
    /// Index of the instruction within the fragment this check guards.
    pub index: usize,
    pub base: MemBase,
    pub offset_reg: Option<u8>,
    pub scale: u32,
    pub imm: u32,
    pub size: u32,
    /// Stores must additionally bail when the target overlaps compiled
    /// code, so the interpreter performs the invalidation.
    pub is_store: bool,
}

/// The memory access performed by an instruction, if any.
pub fn memory_access(inst: &Instruction) -> Option<(MemBase, Option<u8>, u32, u32, bool)> {
    use InstructionOpcode::*;
    match inst.op {
        Ldw3 => Some((MemBase::Reg(inst.operands[1] as u8), Some(inst.operands[2] as u8), 4, 0, false)),
        Stw3 => Some((MemBase::Reg(inst.operands[1] as u8), Some(inst.operands[2] as u8), 4, 0, true)),
        Ldwdp => Some((MemBase::Dp, None, 0, inst.operands[1] * 4, false)),
        Stwdp => Some((MemBase::Dp, None, 0, inst.operands[1] * 4, true)),
        Ldwsp => Some((MemBase::Sp, None, 0, inst.operands[1] * 4, false)),
        Stwsp => Some((MemBase::Sp, None, 0, inst.operands[1] * 4, true)),
        _ => None,
    }
}

/// One instruction of a compiled fragment.
#[derive(Debug, Clone, Copy)]
pub struct FragmentInst {
    pub inst: Instruction,
    pub pc: u32,
    pub next_pc: u32,
}

/// A compiled straight-line fragment.
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    pub start_pc: u32,
    /// Exclusive byte end of the instruction window.
    pub end_pc: u32,
    pub insts: Vec<FragmentInst>,
    /// Static tail-call targets of the terminating branch.
    pub successors: SmallVec<[u32; 2]>,
    /// Fragments that tail-call into this one, by start PC.
    pub references: HashSet<u32>,
    /// Consolidated entry checks.
    pub checks: Vec<MemoryCheck>,
    /// True for an uncompiled or invalidated entry awaiting compilation or
    /// reclamation.
    pub stub: bool,
}

/// Per-core fragment cache. Fragments are reference-counted so a fragment
/// can keep executing after an invalidation demotes its cache entry.
#[derive(Debug, Default)]
pub struct JitCore {
    pub fragments: HashMap<u32, Rc<Fragment>>,
    /// Invalidated fragment keys pending reclamation.
    unreachable: Vec<u32>,
    pub compiles: u64,
    pub invalidations: u64,
}

impl JitCore {
    pub fn fragment(&self, pc: u32) -> Option<Rc<Fragment>> {
        self.fragments.get(&pc).filter(|f| !f.stub).cloned()
    }
}

/// Compile the block starting at `pc`: one fragment per basic block,
/// following fall-through until a block boundary.
pub fn compile_block(core: &mut Core, mut pc: u32) {
    reclaim_unreachable(core);
    loop {
        let (_, end_of_block, next_pc) = compile_one_fragment(core, pc);
        pc = next_pc;
        if end_of_block {
            break;
        }
    }
}

/// Reclaim fragments invalidated since the last compilation pass. Safe to
/// call only from the dispatcher, when no fragment is on the stack.
fn reclaim_unreachable(core: &mut Core) {
    let pending = std::mem::take(&mut core.jit.unreachable);
    for pc in pending {
        let remove = core.jit.fragments.get(&pc).map(|f| f.stub).unwrap_or(false);
        if remove {
            core.jit.fragments.remove(&pc);
        }
    }
}

/// Gather the straight-line instruction run starting at `pc`.
fn gather_fragment(
    core: &Core,
    start_pc: u32,
    insts: &mut Vec<FragmentInst>,
    end_of_block: &mut bool,
    next_pc: &mut u32,
) {
    let mut pc = start_pc;
    *end_of_block = false;
    *next_pc = pc;
    loop {
        let Some(index) = core.opcode_index(pc) else {
            *end_of_block = true;
            break;
        };
        // A breakpoint cell must stay interpreted so the dispatcher sees it.
        if core.opcode_cache[index].kind == CellKind::Breakpoint {
            break;
        }
        let hw0 = core.read_u16(pc);
        let hw1 = if core.is_valid_ram_address(pc + 2) { core.read_u16(pc + 2) } else { 0 };
        let Some(inst) = decode(hw0, hw1, pc) else {
            *end_of_block = true;
            break;
        };
        let inst_next = pc + inst.size as u32;
        insts.push(FragmentInst { inst, pc, next_pc: inst_next });
        *next_pc = inst_next;
        pc = inst_next;
        if inst.op.may_branch() {
            *end_of_block = true;
            break;
        }
        if insts.len() >= MAX_FRAGMENT_INSTS {
            break;
        }
    }
}

/// Compile a single fragment at `pc`. Returns (compiled, end_of_block,
/// pc_after_fragment).
fn compile_one_fragment(core: &mut Core, start_pc: u32) -> (bool, bool, u32) {
    if let Some(existing) = core.jit.fragments.get(&start_pc) {
        if !existing.stub {
            return (false, true, start_pc);
        }
    }

    let mut insts = Vec::new();
    let mut end_of_block = false;
    let mut next_pc = start_pc;
    gather_fragment(core, start_pc, &mut insts, &mut end_of_block, &mut next_pc);
    if insts.is_empty() {
        return (false, true, next_pc);
    }

    let mut checks = Vec::new();
    for (i, fi) in insts.iter().enumerate() {
        if let Some((base, offset_reg, scale, imm, is_store)) = memory_access(&fi.inst) {
            checks.push(MemoryCheck { index: i, base, offset_reg, scale, imm, size: 4, is_store });
        }
    }

    let last = insts.last().unwrap();
    let successors = if last.inst.op.may_branch() {
        static_successors(last.inst.op, &last.inst.operands, last.next_pc).unwrap_or_default()
    } else {
        SmallVec::new()
    };

    let end_pc = next_pc;
    // Register this fragment as a caller of each static successor, creating
    // stub entries for successors not yet compiled.
    for &succ in &successors {
        let entry = core.jit.fragments.entry(succ).or_insert_with(|| {
            Rc::new(Fragment { start_pc: succ, stub: true, ..Fragment::default() })
        });
        Rc::make_mut(entry).references.insert(start_pc);
    }

    let references = core
        .jit
        .fragments
        .get(&start_pc)
        .map(|f| f.references.clone())
        .unwrap_or_default();
    core.jit.fragments.insert(
        start_pc,
        Rc::new(Fragment {
            start_pc,
            end_pc,
            insts,
            successors,
            references,
            checks,
            stub: false,
        }),
    );
    core.jit.compiles += 1;
    core.set_code_present(start_pc, end_pc - start_pc);
    if let Some(index) = core.opcode_index(start_pc) {
        core.opcode_cache[index].kind = CellKind::FragmentEntry;
        core.opcode_cache[index].exec_count = 0;
    }
    log::trace!("compiled fragment {:#x}..{:#x}", start_pc, end_pc);
    (true, end_of_block, next_pc)
}

/// A guest store hit `[address, address + len)` inside compiled code:
/// invalidate every fragment overlapping the range and, transitively, all
/// fragments that tail-call into them. Returns whether anything was
/// invalidated.
pub fn invalidate_range(core: &mut Core, address: u32, len: u32) -> bool {
    let mut worklist: Vec<u32> = core
        .jit
        .fragments
        .values()
        .filter(|f| !f.stub && f.start_pc < address + len && address < f.end_pc)
        .map(|f| f.start_pc)
        .collect();
    if worklist.is_empty() {
        return false;
    }
    let mut to_invalidate: HashSet<u32> = worklist.iter().copied().collect();
    while let Some(pc) = worklist.pop() {
        let refs: Vec<u32> = core
            .jit
            .fragments
            .get(&pc)
            .map(|f| f.references.iter().copied().collect())
            .unwrap_or_default();
        for r in refs {
            if to_invalidate.insert(r) {
                worklist.push(r);
            }
        }
    }
    for &pc in &to_invalidate {
        if let Some(f) = core.jit.fragments.get_mut(&pc) {
            Rc::make_mut(f).stub = true;
        }
        core.jit.unreachable.push(pc);
        if let Some(index) = core.opcode_index(pc) {
            if core.opcode_cache[index].kind == CellKind::FragmentEntry {
                core.opcode_cache[index].kind = CellKind::JitStub;
                core.opcode_cache[index].exec_count = 0;
            }
        }
        core.jit.invalidations += 1;
    }
    // Rebuild the code bitmap from the surviving fragments.
    core.clear_all_code_present();
    let live: Vec<(u32, u32)> = core
        .jit
        .fragments
        .values()
        .filter(|f| !f.stub)
        .map(|f| (f.start_pc, f.end_pc))
        .collect();
    for (start, end) in live {
        core.set_code_present(start, end - start);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::xs1_spec::RAM_BASE;
    use crate::exec::isa::*;

    fn write_program(core: &mut Core, at: u32, halfwords: &[u16]) {
        let mut addr = at;
        for hw in halfwords {
            core.write_u16(addr, *hw);
            addr += 2;
        }
    }

    #[test]
    fn test_fragment_ends_at_branch() {
        let mut core = Core::new(0);
        write_program(
            &mut core,
            RAM_BASE,
            &[
                encode_3r(InstructionOpcode::Add, 0, 1, 2),
                encode_3r(InstructionOpcode::Sub, 3, 4, 5),
                encode_u6(InstructionOpcode::Brfu, 2),
            ],
        );
        compile_block(&mut core, RAM_BASE);
        let frag = core.jit.fragment(RAM_BASE).expect("fragment compiled");
        assert_eq!(frag.insts.len(), 3);
        assert_eq!(frag.end_pc, RAM_BASE + 6);
        // brfu 2 at RAM_BASE+4: target = RAM_BASE + 6 + 4.
        assert_eq!(frag.successors.as_slice(), &[RAM_BASE + 10]);
        // The successor has a stub entry referencing us.
        let stub = core.jit.fragments.get(&(RAM_BASE + 10)).unwrap();
        assert!(stub.stub);
        assert!(stub.references.contains(&RAM_BASE));
    }

    #[test]
    fn test_fragment_entry_cell_promoted() {
        let mut core = Core::new(0);
        write_program(
            &mut core,
            RAM_BASE,
            &[encode_3r(InstructionOpcode::Add, 0, 1, 2), encode_u6(InstructionOpcode::Brfu, 0)],
        );
        compile_block(&mut core, RAM_BASE);
        let index = core.opcode_index(RAM_BASE).unwrap();
        assert_eq!(core.opcode_cache[index].kind, CellKind::FragmentEntry);
        assert!(core.code_present(RAM_BASE, 4));
    }

    #[test]
    fn test_invalidation_transitive() {
        let mut core = Core::new(0);
        // Fragment A at RAM_BASE branches to B at RAM_BASE+8; B is plain code.
        write_program(
            &mut core,
            RAM_BASE,
            &[
                encode_3r(InstructionOpcode::Add, 0, 1, 2),
                encode_u6(InstructionOpcode::Brfu, 2), // target RAM_BASE+8
            ],
        );
        write_program(
            &mut core,
            RAM_BASE + 8,
            &[
                encode_3r(InstructionOpcode::Sub, 0, 1, 2),
                encode_u6(InstructionOpcode::Brbu, 4), // somewhere backwards
            ],
        );
        compile_block(&mut core, RAM_BASE);
        compile_block(&mut core, RAM_BASE + 8);
        assert!(core.jit.fragment(RAM_BASE).is_some());
        assert!(core.jit.fragment(RAM_BASE + 8).is_some());

        // A store into B must kill B and, transitively, its caller A.
        assert!(invalidate_range(&mut core, RAM_BASE + 8, 4));
        assert!(core.jit.fragment(RAM_BASE + 8).is_none());
        assert!(core.jit.fragment(RAM_BASE).is_none());
        assert!(!core.code_present(RAM_BASE, 12));
        let index = core.opcode_index(RAM_BASE).unwrap();
        assert_eq!(core.opcode_cache[index].kind, CellKind::JitStub);
    }

    #[test]
    fn test_memory_checks_collected() {
        let mut core = Core::new(0);
        write_program(
            &mut core,
            RAM_BASE,
            &[
                encode_ru6(InstructionOpcode::Ldwdp, 0, 1),
                encode_ru6(InstructionOpcode::Stwdp, 0, 2),
                encode_u6(InstructionOpcode::Brfu, 0),
            ],
        );
        compile_block(&mut core, RAM_BASE);
        let frag = core.jit.fragment(RAM_BASE).unwrap();
        assert_eq!(frag.checks.len(), 2);
        assert_eq!(frag.checks[0].index, 0);
        assert!(!frag.checks[0].is_store);
        assert!(frag.checks[1].is_store);
        assert_eq!(frag.checks[1].imm, 8);
    }

    #[test]
    fn test_reclaim_after_invalidate() {
        let mut core = Core::new(0);
        write_program(
            &mut core,
            RAM_BASE,
            &[encode_3r(InstructionOpcode::Add, 0, 1, 2), encode_u6(InstructionOpcode::Brfu, 0)],
        );
        compile_block(&mut core, RAM_BASE);
        invalidate_range(&mut core, RAM_BASE, 2);
        // Entry still present (two-phase), marked stub.
        assert!(core.jit.fragments.get(&RAM_BASE).unwrap().stub);
        // The next compilation pass sweeps it and recompiles.
        compile_block(&mut core, RAM_BASE);
        assert!(core.jit.fragment(RAM_BASE).is_some());
    }
}
