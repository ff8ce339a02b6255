//! Instruction semantics.
//!
//! One function per dispatch: [`execute`] performs a single decoded
//! instruction on a thread, updating its program counter and touching
//! resources through the system. Resource operations return a discriminated
//! outcome: `Illegal` raises the corresponding guest exception, and
//! `Descheduled` parks the thread, leaving the program counter on the
//! instruction so it retries on wakeup (synchronisation instructions commit
//! the program counter first and resume after it instead).

use crate::device::resource::{setc, Condition, ResOp, ResourceId, ResourceType};
use crate::device::thread::{sr, Register, SyncMembership};
use crate::device::{ResourceRef, ThreadRef, Ticks};
use crate::exec::isa::{Instruction, InstructionOpcode};
use crate::exec::{ExceptionType, ExecResult, StopEvent};
use crate::system::SystemState;

use Register::*;

#[inline]
fn reg(sys: &SystemState, t: ThreadRef, index: u32) -> u32 {
    sys.thread(t).regs[index as usize]
}

#[inline]
fn set_reg(sys: &mut SystemState, t: ThreadRef, index: u32, value: u32) {
    sys.thread_mut(t).regs[index as usize] = value;
    if sys.config.trace {
        // Safe cast: operand registers are always r0-r11.
        let r = match index {
            0 => R0,
            1 => R1,
            2 => R2,
            3 => R3,
            4 => R4,
            5 => R5,
            6 => R6,
            7 => R7,
            8 => R8,
            9 => R9,
            10 => R10,
            _ => R11,
        };
        self_tracer(sys).reg_write(t, r, value);
    }
}

fn self_tracer(sys: &mut SystemState) -> &mut dyn crate::trace::Tracer {
    sys.tracer.as_mut()
}

/// Raise a guest exception on the thread: save the context, load ET/ED and
/// enter the kernel at KEP. With no valid kernel entry installed the
/// exception is unhandled and stops the simulation.
pub(crate) fn raise_exception(
    sys: &mut SystemState,
    t: ThreadRef,
    ty: ExceptionType,
    data: u32,
) -> ExecResult {
    sys.tracer.exception(t, ty, data);
    let kep = {
        let th = sys.thread_mut(t);
        th.regs[SSR as usize] = th.sr as u32;
        th.regs[SPC as usize] = th.pc;
        th.regs[SED as usize] = th.regs[ED as usize];
        th.regs[ET as usize] = ty as u32;
        th.regs[ED as usize] = data;
        th.set_sr_bit(sr::INK, true);
        th.set_sr_bit(sr::EEBLE, false);
        th.set_sr_bit(sr::IEBLE, false);
        th.regs[KEP as usize]
    };
    if sys.core(t.core).opcode_index(kep).is_some() {
        sys.thread_mut(t).pc = kep;
        ExecResult::Continue
    } else {
        ExecResult::Stop(StopEvent::UnhandledException)
    }
}

/// Resolve a resource ID held in a register to the issuing core's arenas.
fn resolve(sys: &SystemState, t: ThreadRef, id_value: u32) -> Option<ResourceRef> {
    let (ty, index) = sys.core(t.core).resource_index(ResourceId(id_value))?;
    Some(ResourceRef { core: t.core, ty, index })
}

fn load_word(sys: &mut SystemState, t: ThreadRef, address: u32) -> Result<u32, ExecResult> {
    let core = sys.core(t.core);
    if address & 3 != 0 || !core.is_valid_ram_address(address) {
        return Err(raise_exception(sys, t, ExceptionType::LoadStore, address));
    }
    Ok(core.read_u32(address))
}

fn store_word(
    sys: &mut SystemState,
    t: ThreadRef,
    address: u32,
    value: u32,
) -> Result<(), ExecResult> {
    if address & 3 != 0 || !sys.core(t.core).is_valid_ram_address(address) {
        return Err(raise_exception(sys, t, ExceptionType::LoadStore, address));
    }
    let core = sys.core_mut(t.core);
    core.write_u32(address, value);
    core.invalidate_cells(address, 4);
    if core.code_present(address, 4) {
        crate::exec::jit::invalidate_range(core, address, 4);
    }
    Ok(())
}

/// Map a value-producing resource outcome onto the execution result,
/// writing the destination register and committing the program counter on
/// completion.
fn finish_value(
    sys: &mut SystemState,
    t: ThreadRef,
    outcome: ResOp<u32>,
    dst: u32,
    next_pc: u32,
    id_value: u32,
) -> ExecResult {
    match outcome {
        ResOp::Done(value) => {
            set_reg(sys, t, dst, value);
            sys.thread_mut(t).pc = next_pc;
            ExecResult::Continue
        }
        ResOp::Descheduled => ExecResult::Deschedule,
        ResOp::Illegal => raise_exception(sys, t, ExceptionType::IllegalResource, id_value),
    }
}

/// As [`finish_value`] for outcomes with no result. `commit_on_deschedule`
/// distinguishes resume-after instructions (synchronisation) from
/// retry-on-wakeup ones (everything else).
fn finish_unit(
    sys: &mut SystemState,
    t: ThreadRef,
    outcome: ResOp<()>,
    next_pc: u32,
    id_value: u32,
    commit_on_deschedule: bool,
) -> ExecResult {
    match outcome {
        ResOp::Done(()) => {
            sys.thread_mut(t).pc = next_pc;
            ExecResult::Continue
        }
        ResOp::Descheduled => {
            if commit_on_deschedule {
                sys.thread_mut(t).pc = next_pc;
            }
            ExecResult::Deschedule
        }
        ResOp::Illegal => raise_exception(sys, t, ExceptionType::IllegalResource, id_value),
    }
}

/// Execute one instruction. The thread's clock and instruction count are
/// advanced by the caller.
pub(crate) fn execute(sys: &mut SystemState, t: ThreadRef, inst: &Instruction) -> ExecResult {
    use InstructionOpcode::*;
    let ops = &inst.operands;
    let pc = sys.thread(t).pc;
    let next_pc = pc.wrapping_add(inst.size as u32);
    let time: Ticks = sys.thread(t).time;

    macro_rules! commit {
        () => {{
            sys.thread_mut(t).pc = next_pc;
            ExecResult::Continue
        }};
    }

    match inst.op {
        // -- arithmetic and logic ----------------------------------------
        Add => {
            let v = reg(sys, t, ops[1]).wrapping_add(reg(sys, t, ops[2]));
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        Sub => {
            let v = reg(sys, t, ops[1]).wrapping_sub(reg(sys, t, ops[2]));
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        And => {
            let v = reg(sys, t, ops[1]) & reg(sys, t, ops[2]);
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        Or => {
            let v = reg(sys, t, ops[1]) | reg(sys, t, ops[2]);
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        Xor => {
            let v = reg(sys, t, ops[1]) ^ reg(sys, t, ops[2]);
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        Mul => {
            let v = reg(sys, t, ops[1]).wrapping_mul(reg(sys, t, ops[2]));
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        Shl => {
            let amount = reg(sys, t, ops[2]);
            let v = if amount >= 32 { 0 } else { reg(sys, t, ops[1]) << amount };
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        Shr => {
            let amount = reg(sys, t, ops[2]);
            let v = if amount >= 32 { 0 } else { reg(sys, t, ops[1]) >> amount };
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        Eq => {
            let v = (reg(sys, t, ops[1]) == reg(sys, t, ops[2])) as u32;
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        Lss => {
            let v = ((reg(sys, t, ops[1]) as i32) < (reg(sys, t, ops[2]) as i32)) as u32;
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        Lsu => {
            let v = (reg(sys, t, ops[1]) < reg(sys, t, ops[2])) as u32;
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        Not => {
            let v = !reg(sys, t, ops[1]);
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        Addi => {
            let v = reg(sys, t, ops[1]).wrapping_add(ops[2]);
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        Subi => {
            let v = reg(sys, t, ops[1]).wrapping_sub(ops[2]);
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        Shli => {
            let v = if ops[2] >= 32 { 0 } else { reg(sys, t, ops[1]) << ops[2] };
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        Shri => {
            let v = if ops[2] >= 32 { 0 } else { reg(sys, t, ops[1]) >> ops[2] };
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        Ldc => {
            set_reg(sys, t, ops[0], ops[1]);
            commit!()
        }

        // -- memory -------------------------------------------------------
        Ldw3 => {
            let address = reg(sys, t, ops[1]).wrapping_add(reg(sys, t, ops[2]).wrapping_mul(4));
            match load_word(sys, t, address) {
                Ok(v) => {
                    set_reg(sys, t, ops[0], v);
                    commit!()
                }
                Err(r) => r,
            }
        }
        Stw3 => {
            let address = reg(sys, t, ops[1]).wrapping_add(reg(sys, t, ops[2]).wrapping_mul(4));
            let value = reg(sys, t, ops[0]);
            match store_word(sys, t, address, value) {
                Ok(()) => commit!(),
                Err(r) => r,
            }
        }
        Ldwdp | Ldwsp => {
            let base = if inst.op == Ldwdp { DP } else { SP };
            let address = sys.thread(t).regs[base as usize].wrapping_add(ops[1] * 4);
            match load_word(sys, t, address) {
                Ok(v) => {
                    set_reg(sys, t, ops[0], v);
                    commit!()
                }
                Err(r) => r,
            }
        }
        Stwdp | Stwsp => {
            let base = if inst.op == Stwdp { DP } else { SP };
            let address = sys.thread(t).regs[base as usize].wrapping_add(ops[1] * 4);
            let value = reg(sys, t, ops[0]);
            match store_word(sys, t, address, value) {
                Ok(()) => commit!(),
                Err(r) => r,
            }
        }

        // -- control flow -------------------------------------------------
        Brft | Brbt => {
            sys.thread_mut(t).pc = if reg(sys, t, ops[0]) != 0 { ops[1] } else { next_pc };
            ExecResult::Continue
        }
        Brff | Brbf => {
            sys.thread_mut(t).pc = if reg(sys, t, ops[0]) == 0 { ops[1] } else { next_pc };
            ExecResult::Continue
        }
        Brfu | Brbu => {
            sys.thread_mut(t).pc = ops[0];
            ExecResult::Continue
        }
        Blrf | Blrb => {
            sys.thread_mut(t).regs[LR as usize] = next_pc;
            sys.thread_mut(t).pc = ops[0];
            ExecResult::Continue
        }
        Ldapf | Ldapb => {
            set_reg(sys, t, 11, ops[0]);
            commit!()
        }
        Bau => {
            let target = reg(sys, t, ops[0]);
            sys.thread_mut(t).pc = target;
            ExecResult::Continue
        }
        Retsp => {
            let th = sys.thread_mut(t);
            th.regs[SP as usize] = th.regs[SP as usize].wrapping_add(ops[0] * 4);
            th.pc = th.regs[LR as usize];
            ExecResult::Continue
        }

        // -- status register ----------------------------------------------
        Setsr => {
            let new_sr = sys.thread(t).sr | (ops[0] as u8);
            sys.thread_mut(t).pc = next_pc;
            sys.thread_set_sr(t, new_sr);
            ExecResult::Continue
        }
        Clrsr => {
            let new_sr = sys.thread(t).sr & !(ops[0] as u8);
            sys.thread_mut(t).sr = new_sr;
            commit!()
        }
        Getid => {
            set_reg(sys, t, ops[0], t.index as u32);
            commit!()
        }

        // -- resource allocation ------------------------------------------
        Getr => {
            let ty = match ops[1] {
                1 => Some(ResourceType::Timer),
                2 => Some(ResourceType::Chanend),
                3 => Some(ResourceType::Sync),
                5 => Some(ResourceType::Lock),
                _ => None,
            };
            let id = ty.and_then(|ty| sys.alloc_resource(t, ty)).unwrap_or(0);
            set_reg(sys, t, ops[0], id);
            commit!()
        }
        Freer => {
            let id = reg(sys, t, ops[0]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if sys.free_resource(res) {
                commit!()
            } else {
                raise_exception(sys, t, ExceptionType::IllegalResource, id)
            }
        }

        // -- resource input/output ---------------------------------------
        In => {
            let id = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            let outcome = match res.ty {
                ResourceType::Chanend => sys.chanend_in_word(t, res, time),
                ResourceType::Timer => sys.timer_in(t, res, time),
                ResourceType::Port => sys.port_in(t, res, time),
                ResourceType::Lock => match sys.lock_acquire(t, res, time) {
                    ResOp::Done(()) => ResOp::Done(id),
                    ResOp::Descheduled => ResOp::Descheduled,
                    ResOp::Illegal => ResOp::Illegal,
                },
                _ => ResOp::Illegal,
            };
            finish_value(sys, t, outcome, ops[0], next_pc, id)
        }
        Out => {
            let id = reg(sys, t, ops[0]);
            let value = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            let outcome = match res.ty {
                ResourceType::Chanend => sys.chanend_out_word(t, res, value, time),
                ResourceType::Port => sys.port_out(t, res, value, time),
                ResourceType::Lock => sys.lock_release(t, res, time),
                _ => ResOp::Illegal,
            };
            finish_unit(sys, t, outcome, next_pc, id, false)
        }
        Outt => {
            let id = reg(sys, t, ops[0]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Chanend {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            let value = reg(sys, t, ops[1]) as u8;
            let outcome = sys.chanend_out_token(t, res, value, time);
            finish_unit(sys, t, outcome, next_pc, id, false)
        }
        Int => {
            let id = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Chanend {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            let outcome = sys.chanend_in_token(t, res, time);
            finish_value(sys, t, outcome, ops[0], next_pc, id)
        }
        Inct => {
            let id = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Chanend {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            let outcome = sys.chanend_in_ct(t, res, time);
            finish_value(sys, t, outcome, ops[0], next_pc, id)
        }
        Outcti | Outct2 => {
            let id = reg(sys, t, ops[0]);
            let value = if inst.op == Outcti { ops[1] as u8 } else { reg(sys, t, ops[1]) as u8 };
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Chanend {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            let outcome = sys.chanend_out_ct(t, res, value, time);
            finish_unit(sys, t, outcome, next_pc, id, false)
        }
        Chkcti | Chkct2 => {
            let id = reg(sys, t, ops[0]);
            let value = if inst.op == Chkcti { ops[1] as u8 } else { reg(sys, t, ops[1]) as u8 };
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Chanend {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            let outcome = sys.chanend_chkct(t, res, value, time);
            finish_unit(sys, t, outcome, next_pc, id, false)
        }
        Testct => {
            let id = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            let outcome = sys.chanend_testct(t, res);
            finish_value(sys, t, outcome, ops[0], next_pc, id)
        }
        Testwct => {
            let id = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            let outcome = sys.chanend_testwct(t, res);
            finish_value(sys, t, outcome, ops[0], next_pc, id)
        }

        // -- resource configuration --------------------------------------
        Setd => {
            let id = reg(sys, t, ops[0]);
            let value = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            let ok = match res.ty {
                ResourceType::Chanend => sys.chanend_set_dest(res, value),
                ResourceType::Port => {
                    sys.port_set_data(res, value, time);
                    true
                }
                ResourceType::Timer => {
                    sys.timer_set_data(res, value, time);
                    true
                }
                ResourceType::ClkBlk => {
                    sys.clock_set_divide(t.core, res.index, value, time);
                    true
                }
                _ => false,
            };
            if ok {
                commit!()
            } else {
                raise_exception(sys, t, ExceptionType::IllegalResource, id)
            }
        }
        Setci => {
            let id = reg(sys, t, ops[0]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            let outcome = resource_setc(sys, t, res, ops[1], time);
            finish_unit(sys, t, outcome, next_pc, id, false)
        }
        Setv | Setev => {
            let id = reg(sys, t, ops[0]);
            let value = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if sys.eventable_parts(res).is_none() {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            let (base, ev) = sys.eventable_parts_mut(res).unwrap();
            base.owner = Some(t);
            if inst.op == Setv {
                ev.vector = value;
            } else {
                ev.ev_data = value;
            }
            commit!()
        }
        Eeu => {
            let id = reg(sys, t, ops[0]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if !sys.eventable_enable(t, res) {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            commit!()
        }
        Edu => {
            let id = reg(sys, t, ops[0]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            sys.eventable_disable(res);
            commit!()
        }
        Clre => {
            sys.thread_clre(t);
            commit!()
        }
        Waiteu => {
            sys.thread_mut(t).pc = next_pc;
            let new_sr = sys.thread(t).sr | sr::EEBLE;
            if sys.thread_set_sr(t, new_sr) {
                ExecResult::Continue
            } else {
                ExecResult::Deschedule
            }
        }

        // -- ports --------------------------------------------------------
        Getts => {
            let id = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Port {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            let v = sys.port_get_timestamp(res, time);
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        Setpt => {
            let id = reg(sys, t, ops[0]);
            let value = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Port {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            let outcome = sys.port_set_port_time(t, res, value, time);
            finish_unit(sys, t, outcome, next_pc, id, false)
        }
        Clrpt => {
            let id = reg(sys, t, ops[0]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Port {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            sys.port_clear_port_time(res, time);
            commit!()
        }
        Setpsc => {
            let id = reg(sys, t, ops[0]);
            let value = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Port {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            let outcome = sys.port_setpsc(res, value, time);
            finish_unit(sys, t, outcome, next_pc, id, false)
        }
        Endin => {
            let id = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Port {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            let outcome = sys.port_endin(res, time);
            finish_value(sys, t, outcome, ops[0], next_pc, id)
        }
        Peek => {
            let id = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Port {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            let v = sys.port_peek(res, time);
            set_reg(sys, t, ops[0], v);
            commit!()
        }
        Syncr => {
            let id = reg(sys, t, ops[0]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Port {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            let outcome = sys.port_sync(t, res, time);
            finish_unit(sys, t, outcome, next_pc, id, false)
        }
        Setclk => {
            let id = reg(sys, t, ops[0]);
            let value = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            let ok = match res.ty {
                ResourceType::Port => {
                    match sys.core(t.core).resource_index(ResourceId(value)) {
                        Some((ResourceType::ClkBlk, clk)) => sys.port_set_clock(res, clk, time),
                        _ => false,
                    }
                }
                ResourceType::ClkBlk => sys.clock_set_source(t.core, res.index, value, time),
                _ => false,
            };
            if ok {
                commit!()
            } else {
                raise_exception(sys, t, ExceptionType::IllegalResource, id)
            }
        }
        Setrdy => {
            let id = reg(sys, t, ops[0]);
            let value = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            let source = sys.core(t.core).port_index(ResourceId(value));
            let ok = match (res.ty, source) {
                (ResourceType::Port, Some(source)) => sys.port_set_ready(res, source, time),
                _ => false,
            };
            if ok {
                commit!()
            } else {
                raise_exception(sys, t, ExceptionType::IllegalResource, id)
            }
        }
        Settw => {
            let id = reg(sys, t, ops[0]);
            let value = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Port || !sys.port_set_transfer_width(res, value, time) {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            commit!()
        }

        // -- threads and synchronisation ---------------------------------
        Getst => {
            let id = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Sync {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            let outcome = match sys.sync_get_thread(t, res, time) {
                ResOp::Done(num) => {
                    ResOp::Done(ResourceId::new(ResourceType::Thread, num, 0).0)
                }
                ResOp::Descheduled => ResOp::Descheduled,
                ResOp::Illegal => ResOp::Illegal,
            };
            finish_value(sys, t, outcome, ops[0], next_pc, id)
        }
        Msync => {
            let id = reg(sys, t, ops[0]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Sync {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            let outcome = sys.sync_msync(t, res, time);
            finish_unit(sys, t, outcome, next_pc, id, true)
        }
        Mjoin => {
            let id = reg(sys, t, ops[0]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Sync {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            let outcome = sys.sync_mjoin(t, res, time);
            finish_unit(sys, t, outcome, next_pc, id, true)
        }
        Ssync => {
            let membership = sys.thread(t).sync;
            let Some(membership) = membership else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, 0);
            };
            let index = match membership {
                SyncMembership::Master(i) | SyncMembership::Slave(i) => i,
            };
            let res = ResourceRef { core: t.core, ty: ResourceType::Sync, index };
            let outcome = sys.sync_ssync(t, res, time);
            finish_unit(sys, t, outcome, next_pc, 0, true)
        }
        Freet => {
            if sys.thread(t).sync.is_some() {
                return raise_exception(sys, t, ExceptionType::IllegalResource, 0);
            }
            sys.thread_mut(t).free();
            ExecResult::Deschedule
        }
        Tinitpc | Tinitsp | Tinitdp | Tinitcp | Tinitlr => {
            let id = reg(sys, t, ops[0]);
            let value = reg(sys, t, ops[1]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Thread {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            let target = ThreadRef { core: t.core, index: res.index };
            let th = sys.thread_mut(target);
            match inst.op {
                Tinitpc => th.pc = value,
                Tinitsp => th.regs[SP as usize] = value,
                Tinitdp => th.regs[DP as usize] = value,
                Tinitcp => th.regs[CP as usize] = value,
                Tinitlr => th.regs[LR as usize] = value,
                _ => unreachable!(),
            }
            commit!()
        }
        Tsetr => {
            let id = reg(sys, t, ops[1]);
            let value = reg(sys, t, ops[2]);
            let Some(res) = resolve(sys, t, id) else {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            };
            if res.ty != ResourceType::Thread || ops[0] >= 12 {
                return raise_exception(sys, t, ExceptionType::IllegalResource, id);
            }
            let target = ThreadRef { core: t.core, index: res.index };
            sys.thread_mut(target).regs[ops[0] as usize] = value;
            commit!()
        }
        Nop => commit!(),
        Pfix => {
            // A bare prefix never reaches execution; the decoder folds it
            // into the following instruction.
            raise_exception(sys, t, ExceptionType::IllegalInstruction, pc)
        }
    }
}

/// `setc`: resource mode configuration, dispatched on the value's mode
/// class.
fn resource_setc(
    sys: &mut SystemState,
    t: ThreadRef,
    res: ResourceRef,
    value: u32,
    time: Ticks,
) -> ResOp<()> {
    let ok = match value {
        setc::INUSE_ON => resource_set_in_use(sys, t, res, true, time),
        setc::INUSE_OFF => resource_set_in_use(sys, t, res, false, time),
        setc::COND_FULL => set_condition(sys, res, Condition::Full, time),
        setc::COND_AFTER => set_condition(sys, res, Condition::After, time),
        setc::COND_EQ => set_condition(sys, res, Condition::Eq, time),
        setc::COND_NEQ => set_condition(sys, res, Condition::Neq, time),
        setc::IE_MODE_EVENT | setc::IE_MODE_INTERRUPT => {
            match sys.eventable_parts_mut(res) {
                Some((_, ev)) => {
                    ev.interrupt_mode = value == setc::IE_MODE_INTERRUPT;
                    true
                }
                None => false,
            }
        }
        setc::RUN_STARTR if res.ty == ResourceType::ClkBlk => {
            sys.clock_start(res.core, res.index, time);
            true
        }
        setc::RUN_STOPR if res.ty == ResourceType::ClkBlk => {
            sys.clock_stop(res.core, res.index, time);
            true
        }
        setc::RUN_CLRBUF if res.ty == ResourceType::Port => {
            sys.port_clear_buf(res, time);
            true
        }
        setc::MS_MASTER if res.ty == ResourceType::Port => {
            sys.port_set_master_slave(res, crate::device::port::MasterSlave::Master, time)
        }
        setc::MS_SLAVE if res.ty == ResourceType::Port => {
            sys.port_set_master_slave(res, crate::device::port::MasterSlave::Slave, time)
        }
        setc::BUF_BUFFERS if res.ty == ResourceType::Port => {
            sys.port_set_buffered(res, true, time)
        }
        setc::BUF_NOBUFFERS if res.ty == ResourceType::Port => {
            sys.port_set_buffered(res, false, time)
        }
        setc::RDY_NOREADY if res.ty == ResourceType::Port => {
            sys.port_set_ready_mode(res, crate::device::port::ReadyMode::None, time)
        }
        setc::RDY_STROBED if res.ty == ResourceType::Port => {
            sys.port_set_ready_mode(res, crate::device::port::ReadyMode::Strobed, time)
        }
        setc::RDY_HANDSHAKE if res.ty == ResourceType::Port => {
            sys.port_set_ready_mode(res, crate::device::port::ReadyMode::Handshake, time)
        }
        setc::PORT_DATAPORT if res.ty == ResourceType::Port => {
            sys.port_set_port_type(res, crate::device::port::PortKind::Data, time)
        }
        setc::PORT_CLOCKPORT if res.ty == ResourceType::Port => {
            sys.port_set_port_type(res, crate::device::port::PortKind::Clock, time)
        }
        setc::PORT_READYPORT if res.ty == ResourceType::Port => {
            sys.port_set_port_type(res, crate::device::port::PortKind::Ready, time)
        }
        _ => false,
    };
    if ok {
        ResOp::Done(())
    } else {
        ResOp::Illegal
    }
}

fn set_condition(sys: &mut SystemState, res: ResourceRef, cond: Condition, time: Ticks) -> bool {
    match res.ty {
        ResourceType::Timer => sys.timer_set_condition(res, cond, time),
        ResourceType::Port => sys.port_set_condition(res, cond, time),
        ResourceType::Chanend => cond == Condition::Full,
        _ => false,
    }
}

fn resource_set_in_use(
    sys: &mut SystemState,
    t: ThreadRef,
    res: ResourceRef,
    value: bool,
    time: Ticks,
) -> bool {
    match res.ty {
        ResourceType::Port => {
            sys.port_set_in_use(t, res, value, time);
            true
        }
        ResourceType::ClkBlk => {
            let clk = &mut sys.core_mut(res.core).clock_blocks[res.index];
            if value {
                clk.base.set_in_use_on(t);
                clk.divide = 1;
                clk.source = crate::device::clock::ClockSource::Reference;
            } else {
                clk.base.set_in_use_off();
                clk.stop();
            }
            true
        }
        ResourceType::Timer => {
            if value {
                if !sys.timer(res).base.in_use {
                    sys.timer_mut(res).alloc(t);
                }
            } else {
                sys.eventable_disable(res);
                sys.timer_mut(res).free();
            }
            true
        }
        ResourceType::Chanend => {
            if value {
                if !sys.chanend(res).base.in_use {
                    sys.chanend_mut(res).alloc(t);
                }
            } else {
                sys.eventable_disable(res);
                sys.chanend_mut(res).free();
            }
            true
        }
        ResourceType::Lock => {
            if value {
                if !sys.lock(res).base.in_use {
                    sys.lock_mut(res).alloc(t);
                }
            } else {
                sys.lock_mut(res).free();
            }
            true
        }
        _ => false,
    }
}
