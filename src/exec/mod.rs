//! The execution engine: dispatcher, interpreter and fragment runner.
//!
//! A thread entering [`run_thread`] executes instructions until it
//! deschedules, hits a host breakpoint, or exhausts its slice budget (in
//! which case it requeues behind anything else scheduled at its current
//! time). Each program counter dispatches through its opcode-cache cell:
//! decode entries are promoted to pre-decoded interpret cells, hot interpret
//! cells to stubs, and stubs to compiled fragments (see [`jit`]).

pub mod decode;
pub mod isa;
pub mod jit;
pub mod ops;
pub mod syscall;

use crate::device::core::CellKind;
use crate::device::thread::sr;
use crate::device::{ThreadRef, Ticks};
use crate::exec::jit::{Fragment, MemBase, MemoryCheck};
use crate::system::SystemState;

/// Guest exception causes, as loaded into ET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExceptionType {
    LinkError = 1,
    IllegalPc = 2,
    IllegalInstruction = 3,
    IllegalResource = 4,
    LoadStore = 5,
    IllegalPs = 6,
    Arithmetic = 7,
    Ecall = 8,
    ResourceDep = 9,
    KCall = 10,
}

/// Why the dispatcher returned control to the top-level loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopEvent {
    /// A host breakpoint cell was reached.
    Breakpoint,
    /// A guest exception with no kernel entry point installed.
    UnhandledException,
}

/// Result of executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecResult {
    Continue,
    /// The thread parked itself; do not requeue.
    Deschedule,
    Stop(StopEvent),
}

/// Instructions per scheduler slice. Fairness comes from time ordering, not
/// from this value; it only bounds how far a thread can run ahead between
/// queue visits.
const ITERATIONS_PER_SLICE: u32 = 64;

/// Maximum fragments chained per dispatch before revisiting the cache.
const MAX_TAIL_CHAIN: u32 = 8;

enum Step {
    Continue,
    Deschedule,
    Stop(StopEvent),
}

/// Run a thread for one scheduler slice.
pub(crate) fn run_thread(sys: &mut SystemState, t: ThreadRef, wake_time: Ticks) -> Option<StopEvent> {
    {
        let th = sys.thread_mut(t);
        if !th.in_use {
            return None;
        }
        th.time = th.time.max(wake_time);
    }
    for _ in 0..ITERATIONS_PER_SLICE {
        match step(sys, t) {
            Step::Continue => {}
            Step::Deschedule => {
                sys.thread_mut(t).set_sr_bit(sr::WAITING, true);
                return None;
            }
            Step::Stop(event) => return Some(event),
        }
    }
    let time = sys.thread(t).time;
    sys.schedule_thread(t, time);
    None
}

/// Fetch, dispatch and execute at the thread's program counter.
fn step(sys: &mut SystemState, t: ThreadRef) -> Step {
    let pc = sys.thread(t).pc;
    let Some(index) = sys.core(t.core).opcode_index(pc) else {
        return exec_to_step(ops::raise_exception(sys, t, ExceptionType::IllegalPc, pc));
    };
    let kind = sys.core(t.core).opcode_cache[index].kind;
    match kind {
        CellKind::Breakpoint => Step::Stop(StopEvent::Breakpoint),
        CellKind::Decode => {
            let core = sys.core(t.core);
            let hw0 = core.read_u16(pc);
            let hw1 = if core.is_valid_ram_address(pc + 2) { core.read_u16(pc + 2) } else { 0 };
            match decode::decode(hw0, hw1, pc) {
                Some(inst) => {
                    let cell = &mut sys.core_mut(t.core).opcode_cache[index];
                    cell.kind = CellKind::Interpret;
                    cell.inst = inst;
                    cell.exec_count = 0;
                    interpret(sys, t, index)
                }
                None => exec_to_step(ops::raise_exception(
                    sys,
                    t,
                    ExceptionType::IllegalInstruction,
                    pc,
                )),
            }
        }
        CellKind::Interpret => interpret(sys, t, index),
        CellKind::JitStub => {
            if sys.config.jit {
                jit::compile_block(sys.core_mut(t.core), pc);
                if sys.core(t.core).opcode_cache[index].kind == CellKind::FragmentEntry {
                    return run_fragments(sys, t, pc);
                }
            }
            interpret(sys, t, index)
        }
        CellKind::FragmentEntry => run_fragments(sys, t, pc),
    }
}

/// Interpret the pre-decoded cell at `index`, promoting it to a stub once
/// its execution frequency crosses the threshold.
fn interpret(sys: &mut SystemState, t: ThreadRef, index: usize) -> Step {
    let inst = {
        let core = sys.core_mut(t.core);
        let cell = &mut core.opcode_cache[index];
        cell.exec_count += 1;
        cell.inst
    };
    if sys.config.jit {
        let threshold = sys.config.jit_threshold;
        let cell = &mut sys.core_mut(t.core).opcode_cache[index];
        if cell.kind == CellKind::Interpret && cell.exec_count >= threshold {
            cell.kind = CellKind::JitStub;
        }
    }
    if sys.config.trace {
        let pc = sys.thread(t).pc;
        sys.tracer.instruction_begin(t, pc, inst.op);
    }
    let result = ops::execute(sys, t, &inst);
    if !matches!(result, ExecResult::Deschedule) {
        let th = sys.thread_mut(t);
        th.time += 1;
        th.count += 1;
    }
    exec_to_step(result)
}

fn exec_to_step(result: ExecResult) -> Step {
    match result {
        ExecResult::Continue => Step::Continue,
        ExecResult::Deschedule => Step::Deschedule,
        ExecResult::Stop(e) => Step::Stop(e),
    }
}

/// Evaluate one consolidated memory check against current register state.
fn check_passes(sys: &SystemState, t: ThreadRef, check: &MemoryCheck) -> bool {
    use crate::device::thread::Register;
    let th = sys.thread(t);
    let base = match check.base {
        MemBase::Reg(r) => th.regs[r as usize],
        MemBase::Dp => th.regs[Register::DP as usize],
        MemBase::Sp => th.regs[Register::SP as usize],
    };
    let offset = check
        .offset_reg
        .map(|r| th.regs[r as usize].wrapping_mul(check.scale))
        .unwrap_or(0);
    let address = base.wrapping_add(offset).wrapping_add(check.imm);
    if address % check.size != 0 {
        return false;
    }
    let core = sys.core(t.core);
    if !core.is_valid_ram_address(address) {
        return false;
    }
    if check.is_store && core.code_present(address, check.size) {
        return false;
    }
    true
}

/// Execute the fragment at `start_pc`, tail-chaining through statically
/// known successors.
fn run_fragments(sys: &mut SystemState, t: ThreadRef, mut start_pc: u32) -> Step {
    for _ in 0..MAX_TAIL_CHAIN {
        let Some(fragment) = sys.core(t.core).jit.fragment(start_pc) else {
            // Demoted under us; the dispatcher will re-resolve the cell.
            return Step::Continue;
        };
        match run_one_fragment(sys, t, fragment.as_ref()) {
            Step::Continue => {}
            other => return other,
        }
        let pc = sys.thread(t).pc;
        if !fragment.successors.contains(&pc) {
            return Step::Continue;
        }
        if sys.core(t.core).jit.fragment(pc).is_none() {
            return Step::Continue;
        }
        start_pc = pc;
    }
    Step::Continue
}

fn run_one_fragment(sys: &mut SystemState, t: ThreadRef, fragment: &Fragment) -> Step {
    let mut check_cursor = 0usize;
    for (i, fi) in fragment.insts.iter().enumerate() {
        // Checks are placed before the instruction they guard; a failure
        // bails out so the interpreter re-executes with full checking.
        while check_cursor < fragment.checks.len() && fragment.checks[check_cursor].index == i {
            if !check_passes(sys, t, &fragment.checks[check_cursor]) {
                debug_assert_eq!(sys.thread(t).pc, fi.pc);
                if i == 0 {
                    return interpret_one(sys, t);
                }
                // End of trace: earlier instructions already committed.
                return Step::Continue;
            }
            check_cursor += 1;
        }
        if sys.config.trace {
            sys.tracer.instruction_begin(t, fi.pc, fi.inst.op);
        }
        let result = ops::execute(sys, t, &fi.inst);
        match result {
            ExecResult::Deschedule => return Step::Deschedule,
            ExecResult::Stop(e) => return Step::Stop(e),
            ExecResult::Continue => {
                let th = sys.thread_mut(t);
                th.time += 1;
                th.count += 1;
                // An event or interrupt between instructions redirects the
                // program counter; end the trace.
                if th.pc != fi.next_pc && i + 1 != fragment.insts.len() {
                    return Step::Continue;
                }
            }
        }
    }
    Step::Continue
}

/// Interpret exactly one instruction at the current program counter,
/// bypassing the opcode cache. The fallback path for failed fragment entry
/// checks.
fn interpret_one(sys: &mut SystemState, t: ThreadRef) -> Step {
    let pc = sys.thread(t).pc;
    let core = sys.core(t.core);
    let Some(_) = core.opcode_index(pc) else {
        return exec_to_step(ops::raise_exception(sys, t, ExceptionType::IllegalPc, pc));
    };
    let hw0 = core.read_u16(pc);
    let hw1 = if core.is_valid_ram_address(pc + 2) { core.read_u16(pc + 2) } else { 0 };
    let Some(inst) = decode::decode(hw0, hw1, pc) else {
        return exec_to_step(ops::raise_exception(sys, t, ExceptionType::IllegalInstruction, pc));
    };
    let result = ops::execute(sys, t, &inst);
    if !matches!(result, ExecResult::Deschedule) {
        let th = sys.thread_mut(t);
        th.time += 1;
        th.count += 1;
    }
    exec_to_step(result)
}
