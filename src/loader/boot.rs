//! The boot sequencer.
//!
//! A boot archive is a sequence of typed sectors: ELF images attached to a
//! `(jtag index, core number)` pair, CALL sectors (run the image until it
//! signals done) and GOTO sectors (jump to an address and run). The
//! sequencer flattens these into steps: consecutive CALL sectors aggregate
//! into a single RUN step whose done-syscall count equals the number of
//! participating cores, and a GOTO flushes pending CALLs first.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::device::thread::Register;
use crate::device::{CoreRef, ThreadRef};
use crate::exec::syscall::{BreakpointType, SyscallHandler, SyscallOutcome};
use crate::loader::elf::{load_elf, LoadError};
use crate::system::{StopReason, SystemState};

/// A sector of a boot archive, already parsed out of its container.
#[derive(Debug, Clone)]
pub enum BootSector {
    Elf { jtag_index: usize, core: usize, data: Vec<u8> },
    Call { jtag_index: usize, core: usize },
    Goto { jtag_index: usize, core: usize, address: u32 },
}

#[derive(Debug)]
enum BootStep {
    LoadElf { core: CoreRef, data: Vec<u8> },
    Schedule { core: CoreRef, address: u32 },
    Run { num_done_syscalls: usize },
}

#[derive(Debug, Error)]
pub enum BootError {
    #[error("cannot find node {jtag_index}, core {core}")]
    UnknownCore { jtag_index: usize, core: usize },

    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Flattens boot sectors into steps and drives the scheduler through them.
#[derive(Debug, Default)]
pub struct BootSequencer {
    steps: Vec<BootStep>,
    syscall_handler: SyscallHandler,
}

impl BootSequencer {
    pub fn new() -> Self {
        BootSequencer::default()
    }

    pub fn syscall_handler(&self) -> &SyscallHandler {
        &self.syscall_handler
    }

    pub fn syscall_handler_mut(&mut self) -> &mut SyscallHandler {
        &mut self.syscall_handler
    }

    pub fn add_elf(&mut self, core: CoreRef, data: Vec<u8>) {
        self.steps.push(BootStep::LoadElf { core, data });
    }

    pub fn add_schedule(&mut self, core: CoreRef, address: u32) {
        self.steps.push(BootStep::Schedule { core, address });
    }

    pub fn add_run(&mut self, num_done_syscalls: usize) {
        self.steps.push(BootStep::Run { num_done_syscalls });
    }

    /// Build the step list from archive sectors.
    pub fn populate_from_sectors(
        &mut self,
        sys: &SystemState,
        sectors: Vec<BootSector>,
    ) -> Result<(), BootError> {
        let mut core_map: HashMap<(usize, usize), CoreRef> = HashMap::new();
        for (n, node) in sys.nodes.iter().enumerate() {
            for c in 0..node.cores.len() {
                core_map.insert((node.jtag_index, c), CoreRef { node: n, core: c });
            }
        }
        let lookup = |jtag_index: usize, core: usize| {
            core_map
                .get(&(jtag_index, core))
                .copied()
                .ok_or(BootError::UnknownCore { jtag_index, core })
        };

        let mut call_cores: HashSet<CoreRef> = HashSet::new();
        let mut goto_cores: HashSet<CoreRef> = HashSet::new();
        for sector in sectors {
            match sector {
                BootSector::Elf { jtag_index, core, data } => {
                    let core = lookup(jtag_index, core)?;
                    if goto_cores.contains(&core) {
                        continue;
                    }
                    if call_cores.contains(&core) {
                        self.add_run(call_cores.len());
                        call_cores.clear();
                    }
                    self.add_elf(core, data);
                }
                BootSector::Call { jtag_index, core } => {
                    let core = lookup(jtag_index, core)?;
                    if !goto_cores.is_empty() {
                        continue;
                    }
                    if !call_cores.insert(core) {
                        self.add_run(call_cores.len());
                        call_cores.clear();
                        call_cores.insert(core);
                    }
                }
                BootSector::Goto { jtag_index, core, address } => {
                    let core = lookup(jtag_index, core)?;
                    if !call_cores.is_empty() {
                        // A GOTO supersedes the pending CALLs.
                        self.add_run(call_cores.len());
                        call_cores.clear();
                    }
                    if goto_cores.insert(core) {
                        self.add_schedule(core, address);
                    }
                }
            }
        }
        if !goto_cores.is_empty() {
            self.add_run(goto_cores.len());
        } else if !call_cores.is_empty() {
            self.add_run(call_cores.len());
        }
        Ok(())
    }

    /// Run the boot sequence to completion, returning the process exit
    /// status.
    pub fn execute(&mut self, sys: &mut SystemState) -> Result<i32, BootError> {
        let steps = std::mem::take(&mut self.steps);
        for step in steps {
            let status = match step {
                BootStep::LoadElf { core, data } => {
                    self.execute_elf(sys, core, &data)?;
                    0
                }
                BootStep::Schedule { core, address } => {
                    Self::schedule_thread_zero(sys, core, address);
                    0
                }
                BootStep::Run { num_done_syscalls } => {
                    let status = self.execute_run(sys, num_done_syscalls);
                    sys.unset_breakpoints();
                    status
                }
            };
            if status != 0 {
                return Ok(status);
            }
        }
        Ok(0)
    }

    fn execute_elf(&mut self, sys: &mut SystemState, core: CoreRef, data: &[u8]) -> Result<(), BootError> {
        let image = load_elf(sys.core_mut(core), data)?;
        if let Some(address) = image.syscall_address {
            if !sys.set_breakpoint(core, address, BreakpointType::Syscall) {
                log::warn!("invalid _DoSyscall address {:#x}", address);
            }
        }
        if let Some(address) = image.exception_address {
            if !sys.set_breakpoint(core, address, BreakpointType::Exception) {
                log::warn!("invalid _DoException address {:#x}", address);
            }
        }
        Self::schedule_thread_zero(sys, core, image.entry_point);
        Ok(())
    }

    fn schedule_thread_zero(sys: &mut SystemState, core: CoreRef, address: u32) {
        let t = ThreadRef { core, index: 0 };
        if !sys.thread(t).in_use {
            sys.thread_mut(t).alloc(0);
        }
        sys.thread_mut(t).pc = address;
        let time = sys.thread(t).time;
        sys.schedule_thread(t, time);
    }

    /// One RUN step: drive the scheduler, servicing breakpoint stops, until
    /// the guest exits or nothing is left to run.
    fn execute_run(&mut self, sys: &mut SystemState, num_done_syscalls: usize) -> i32 {
        self.syscall_handler.set_done_syscalls_required(num_done_syscalls);
        loop {
            match sys.run() {
                StopReason::Breakpoint(t) => {
                    let pc = sys.thread(t).pc;
                    match sys.breakpoint_type(t.core, pc) {
                        Some(BreakpointType::Syscall) => {
                            match self.syscall_handler.do_syscall(sys, t) {
                                SyscallOutcome::Exit(status) => return status,
                                SyscallOutcome::Continue => {
                                    let lr = sys.thread(t).reg(Register::LR);
                                    sys.thread_mut(t).pc = lr;
                                    let time = sys.thread(t).time;
                                    sys.schedule_thread(t, time);
                                }
                                SyscallOutcome::Deschedule => {}
                            }
                        }
                        Some(BreakpointType::Exception) => {
                            self.syscall_handler.do_exception(sys, t);
                            return 1;
                        }
                        _ => {
                            log::error!("stopped at unknown breakpoint {:#x}", pc);
                            return 1;
                        }
                    }
                }
                StopReason::Exit(status) => return status,
                StopReason::NoRunnableThreads | StopReason::Timeout => return 1,
            }
        }
    }
}

/// Load a single ELF image on the first core and run it to completion.
pub fn run_elf(sys: &mut SystemState, core: CoreRef, data: &[u8]) -> Result<(i32, Vec<u8>), BootError> {
    let mut sequencer = BootSequencer::new();
    sequencer.add_elf(core, data.to_vec());
    sequencer.add_run(0);
    let status = sequencer.execute(sys)?;
    let stdout = sequencer.syscall_handler_mut().take_stdout();
    Ok((status, stdout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::device::xs1_spec::{CYCLES_PER_TICK, RAM_BASE};
    use crate::exec::isa::InstructionOpcode::*;
    use crate::exec::isa::*;
    use crate::testing::{Asm, ElfBuilder};

    const SYSCALL_ADDR: u32 = RAM_BASE + 0x800;
    const STR_ADDR: u32 = RAM_BASE + 0xA00;

    /// `_exit(status)`.
    fn emit_exit(asm: &mut Asm, status: u32) {
        asm.ldc(0, crate::exec::syscall::number::EXIT);
        asm.ldc(1, status);
        asm.bl(SYSCALL_ADDR);
    }

    fn build(asm: Asm) -> Vec<u8> {
        ElfBuilder::new(asm.origin)
            .code(asm.origin, &asm.halfwords)
            .symbol("_DoSyscall", SYSCALL_ADDR)
            .build()
    }

    #[test]
    fn test_exit_status() {
        let mut asm = Asm::new(RAM_BASE);
        emit_exit(&mut asm, 7);
        let (mut sys, core) = crate::system::SystemState::single_core(SimConfig::default());
        let (status, _) = run_elf(&mut sys, core, &build(asm)).unwrap();
        assert_eq!(status, 7);
    }

    #[test]
    fn test_hello_world() {
        let mut asm = Asm::new(RAM_BASE);
        asm.ldc(0, crate::exec::syscall::number::WRITE);
        asm.ldc(1, 1);
        asm.ldc32(2, 11, STR_ADDR);
        asm.ldc(3, 6);
        asm.bl(SYSCALL_ADDR);
        emit_exit(&mut asm, 0);
        let elf = ElfBuilder::new(RAM_BASE)
            .code(RAM_BASE, &asm.halfwords)
            .data(STR_ADDR, b"Hello\n")
            .symbol("_DoSyscall", SYSCALL_ADDR)
            .build();

        let (mut sys, core) = crate::system::SystemState::single_core(SimConfig::default());
        let (status, stdout) = run_elf(&mut sys, core, &elf).unwrap();
        assert_eq!(status, 0);
        assert_eq!(stdout, b"Hello\n");
        let t = crate::device::ThreadRef { core, index: 0 };
        assert!(sys.thread(t).count > 0);
    }

    #[test]
    fn test_timer_gate() {
        let mut asm = Asm::new(RAM_BASE);
        asm.emit(encode_2r(Getr, 0, 1)); // r0 = timer
        asm.emit(encode_ru6(Setci, 0, crate::device::resource::setc::COND_AFTER));
        asm.ldc(1, 1000);
        asm.emit(encode_2r(Setd, 0, 1));
        asm.emit(encode_2r(In, 2, 0)); // r2 = timer value
        asm.emit(encode_3r(Lsu, 3, 2, 1)); // r3 = (r2 < 1000)
        asm.ldc(0, crate::exec::syscall::number::EXIT);
        asm.emit(encode_2rus(Addi, 1, 3, 0)); // status = r3
        asm.bl(SYSCALL_ADDR);

        let (mut sys, core) = crate::system::SystemState::single_core(SimConfig::default());
        let (status, _) = run_elf(&mut sys, core, &build(asm)).unwrap();
        assert_eq!(status, 0, "timer returned a value below the AFTER condition");
        let t = crate::device::ThreadRef { core, index: 0 };
        assert!(sys.thread(t).reg(crate::device::Register::R2) >= 1000);
        assert!(sys.thread(t).time >= 1000 * CYCLES_PER_TICK as u64);
    }

    #[test]
    fn test_channel_ping_across_cores() {
        // Thread A on core 0 sends a word to core 1; thread B checks it.
        let mut a = Asm::new(RAM_BASE);
        a.emit(encode_2r(Getr, 0, 2)); // r0 = chanend
        // Give B time to allocate its chanend before the route opens.
        a.emit(encode_2r(Getr, 4, 1));
        a.emit(encode_ru6(Setci, 4, crate::device::resource::setc::COND_AFTER));
        a.ldc(5, 100);
        a.emit(encode_2r(Setd, 4, 5));
        a.emit(encode_2r(In, 6, 4));
        a.ldc32(1, 11, 0x0001_0002); // chanend 0 on core 1
        a.emit(encode_2r(Setd, 0, 1));
        a.ldc32(2, 11, 0xDEAD_BEEF);
        a.emit(encode_2r(Out, 0, 2));
        a.emit(encode_ru6(Outcti, 0, 1)); // CT_END
        a.emit(encode_0r(Waiteu)); // park forever

        let mut b = Asm::new(RAM_BASE);
        b.emit(encode_2r(Getr, 0, 2)); // r0 = chanend (num 0)
        b.emit(encode_2r(In, 1, 0)); // r1 = word
        b.emit(encode_ru6(Chkcti, 0, 1)); // CT_END
        b.ldc32(2, 3, 0xDEAD_BEEF);
        b.emit(encode_3r(Eq, 3, 1, 2)); // r3 = (r1 == expected)
        b.ldc(4, 1);
        b.emit(encode_3r(Sub, 1, 4, 3)); // status = 1 - r3
        b.ldc(0, crate::exec::syscall::number::EXIT);
        b.bl(SYSCALL_ADDR);

        let mut sys = crate::system::SystemState::new(SimConfig::default());
        let node = sys.add_node(crate::device::NodeType::L, 0);
        let core0 = sys.add_core(node);
        let core1 = sys.add_core(node);

        let mut sequencer = BootSequencer::new();
        sequencer.add_elf(core0, build(a));
        sequencer.add_elf(core1, build(b));
        sequencer.add_run(0);
        let status = sequencer.execute(&mut sys).unwrap();
        assert_eq!(status, 0, "receiver saw the wrong word");

        let ta = crate::device::ThreadRef { core: core0, index: 0 };
        let tb = crate::device::ThreadRef { core: core1, index: 0 };
        assert!(sys.thread(ta).time <= sys.thread(tb).time);
    }

    fn sum_loop_program() -> Vec<u8> {
        let mut asm = Asm::new(RAM_BASE);
        asm.ldc(0, 0);
        asm.ldc(1, 10);
        let loop_top = asm.here();
        asm.emit(encode_3r(Add, 0, 0, 1));
        asm.ldc(2, 1);
        asm.emit(encode_3r(Sub, 1, 1, 2));
        let next = asm.here() + 2;
        asm.emit(encode_ru6(Brbt, 1, (next - loop_top) / 2));
        asm.emit(encode_2rus(Addi, 1, 0, 0)); // status = sum
        asm.ldc(0, crate::exec::syscall::number::EXIT);
        asm.bl(SYSCALL_ADDR);
        build(asm)
    }

    #[test]
    fn test_jit_matches_interpreter() {
        let run = |jit: bool| {
            let config = SimConfig { jit, jit_threshold: 2, ..SimConfig::default() };
            let (mut sys, core) = crate::system::SystemState::single_core(config);
            let (status, _) = run_elf(&mut sys, core, &sum_loop_program()).unwrap();
            let t = crate::device::ThreadRef { core, index: 0 };
            (status, sys.thread(t).count, sys.thread(t).time, sys.thread(t).regs)
        };
        let with_jit = run(true);
        let without_jit = run(false);
        assert_eq!(with_jit.0, 55);
        assert_eq!(with_jit, without_jit);
    }

    /// A hot loop whose body is overwritten by a guest store: the next
    /// fetch must see the new instruction, through compiled fragments and
    /// all.
    fn self_modifying_program() -> Vec<u8> {
        let mut asm = Asm::new(RAM_BASE);
        asm.ldc(4, 0); // loop counter
        asm.ldc(5, 10);
        let x = asm.here();
        assert_eq!(x % 4, 0);
        asm.emit(encode_ru6(Ldc, 1, 1)); // the instruction to overwrite
        asm.emit(encode_0r(Nop)); // keeps the store word-aligned
        asm.emit(encode_2rus(Addi, 4, 4, 1));
        asm.emit(encode_3r(Lsu, 6, 4, 5));
        let next = asm.here() + 2;
        asm.emit(encode_ru6(Brbt, 6, (next - x) / 2));
        let brft_at = asm.halfwords.len();
        asm.emit(0); // placeholder: brft r7, done
        asm.ldc32(2, 3, x);
        let new_word = ((encode_0r(Nop) as u32) << 16) | encode_ru6(Ldc, 1, 0) as u32;
        asm.ldc32(0, 3, new_word);
        asm.ldc(3, 0);
        asm.emit(encode_3r(Stw3, 0, 2, 3));
        asm.ldc(7, 1);
        asm.ldc(4, 0);
        asm.bru(x);
        let done = asm.here();
        let brft_pc = asm.origin + 2 * brft_at as u32;
        asm.halfwords[brft_at] = encode_ru6(Brft, 7, (done - (brft_pc + 2)) / 2);
        asm.emit(encode_2rus(Addi, 1, 1, 0)); // status = r1
        asm.ldc(0, crate::exec::syscall::number::EXIT);
        asm.bl(SYSCALL_ADDR);
        build(asm)
    }

    #[test]
    fn test_store_invalidates_compiled_code() {
        for jit in [true, false] {
            let config = SimConfig { jit, jit_threshold: 3, ..SimConfig::default() };
            let (mut sys, core) = crate::system::SystemState::single_core(config);
            let (status, _) = run_elf(&mut sys, core, &self_modifying_program()).unwrap();
            assert_eq!(status, 0, "stale instruction executed after store (jit={})", jit);
        }
    }

    #[test]
    fn test_populate_aggregates_calls() {
        let mut sys = crate::system::SystemState::new(SimConfig::default());
        let node = sys.add_node(crate::device::NodeType::L, 0);
        let _core0 = sys.add_core(node);
        let _core1 = sys.add_core(node);
        let mut sequencer = BootSequencer::new();
        sequencer
            .populate_from_sectors(
                &sys,
                vec![
                    BootSector::Call { jtag_index: 0, core: 0 },
                    BootSector::Call { jtag_index: 0, core: 1 },
                ],
            )
            .unwrap();
        // Two consecutive CALLs collapse into one RUN with two done
        // syscalls required.
        assert_eq!(sequencer.steps.len(), 1);
        match &sequencer.steps[0] {
            BootStep::Run { num_done_syscalls } => assert_eq!(*num_done_syscalls, 2),
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_populate_goto_flushes_calls() {
        let mut sys = crate::system::SystemState::new(SimConfig::default());
        let node = sys.add_node(crate::device::NodeType::L, 0);
        let _core0 = sys.add_core(node);
        let _core1 = sys.add_core(node);
        let mut sequencer = BootSequencer::new();
        sequencer
            .populate_from_sectors(
                &sys,
                vec![
                    BootSector::Call { jtag_index: 0, core: 0 },
                    BootSector::Goto { jtag_index: 0, core: 1, address: 0x10040 },
                ],
            )
            .unwrap();
        // CALL flushed as its own RUN, then the GOTO schedule + final RUN.
        assert_eq!(sequencer.steps.len(), 3);
        assert!(matches!(sequencer.steps[0], BootStep::Run { num_done_syscalls: 1 }));
        assert!(matches!(sequencer.steps[1], BootStep::Schedule { address: 0x10040, .. }));
        assert!(matches!(sequencer.steps[2], BootStep::Run { num_done_syscalls: 1 }));
    }

    #[test]
    fn test_unknown_core_rejected() {
        let sys = crate::system::SystemState::new(SimConfig::default());
        let mut sequencer = BootSequencer::new();
        let err = sequencer
            .populate_from_sectors(&sys, vec![BootSector::Call { jtag_index: 3, core: 0 }])
            .unwrap_err();
        assert!(matches!(err, BootError::UnknownCore { jtag_index: 3, core: 0 }));
    }
}
