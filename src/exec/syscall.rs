//! Host syscall handling.
//!
//! Guest programs trap to the host through a breakpoint installed at the
//! `_DoSyscall` symbol. The syscall number travels in R0, arguments in
//! R1 onwards, and the result is returned in R0. `_DoException` traps the
//! same way for unhandled guest exceptions.

use crate::device::thread::Register;
use crate::device::ThreadRef;
use crate::system::SystemState;

/// What a breakpoint cell stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointType {
    Syscall,
    Exception,
    Other,
}

/// Syscall numbers.
pub mod number {
    pub const EXIT: u32 = 0;
    pub const PRINTC: u32 = 1;
    pub const PRINTINT: u32 = 2;
    pub const READ: u32 = 3;
    pub const WRITE: u32 = 4;
    /// Boot-sequencer rendezvous: a CALL image signals completion.
    pub const DONE: u32 = 5;
}

/// Outcome of a syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Resume the thread after the call site.
    Continue,
    /// The thread stays parked (e.g. a DONE waiting for its peers).
    Deschedule,
    /// Terminate the simulation with a status.
    Exit(i32),
}

/// Host-side syscall state: output capture and the DONE rendezvous counter.
#[derive(Debug, Default)]
pub struct SyscallHandler {
    done_syscalls_required: usize,
    done_syscalls_seen: usize,
    stdout: Vec<u8>,
}

impl SyscallHandler {
    pub fn new() -> Self {
        SyscallHandler::default()
    }

    /// Number of DONE syscalls that complete the current run step.
    pub fn set_done_syscalls_required(&mut self, count: usize) {
        self.done_syscalls_required = count;
        self.done_syscalls_seen = 0;
    }

    /// Everything the guest wrote to stdout/stderr so far.
    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub fn take_stdout(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.stdout)
    }

    /// Handle the syscall the given thread trapped into.
    pub fn do_syscall(&mut self, sys: &mut SystemState, t: ThreadRef) -> SyscallOutcome {
        use Register::*;
        let num = sys.thread(t).reg(R0);
        sys.tracer.syscall(t, num);
        match num {
            number::EXIT => SyscallOutcome::Exit(sys.thread(t).reg(R1) as i32),
            number::PRINTC => {
                self.stdout.push(sys.thread(t).reg(R1) as u8);
                sys.thread_mut(t).set_reg(R0, 0);
                SyscallOutcome::Continue
            }
            number::PRINTINT => {
                let value = sys.thread(t).reg(R1);
                self.stdout.extend_from_slice(value.to_string().as_bytes());
                sys.thread_mut(t).set_reg(R0, 0);
                SyscallOutcome::Continue
            }
            number::READ => {
                // No host input is wired up: report end of file.
                sys.thread_mut(t).set_reg(R0, 0);
                SyscallOutcome::Continue
            }
            number::WRITE => {
                let fd = sys.thread(t).reg(R1);
                let address = sys.thread(t).reg(R2);
                let length = sys.thread(t).reg(R3);
                let core = sys.core(t.core);
                let end = address.wrapping_add(length);
                if length > 0
                    && (!core.is_valid_ram_address(address)
                        || !core.is_valid_ram_address(end.wrapping_sub(1)))
                {
                    sys.thread_mut(t).set_reg(R0, u32::MAX);
                    return SyscallOutcome::Continue;
                }
                let offset = core.ram_offset(address);
                let bytes = core.ram[offset..offset + length as usize].to_vec();
                if fd == 1 || fd == 2 {
                    self.stdout.extend_from_slice(&bytes);
                    log::info!("guest: {}", String::from_utf8_lossy(&bytes));
                }
                sys.thread_mut(t).set_reg(R0, length);
                SyscallOutcome::Continue
            }
            number::DONE => {
                self.done_syscalls_seen += 1;
                if self.done_syscalls_seen >= self.done_syscalls_required {
                    SyscallOutcome::Exit(0)
                } else {
                    SyscallOutcome::Deschedule
                }
            }
            _ => {
                log::warn!("unknown syscall {}", num);
                sys.thread_mut(t).set_reg(R0, u32::MAX);
                SyscallOutcome::Continue
            }
        }
    }

    /// Report the exception context the thread trapped into `_DoException`
    /// with.
    pub fn do_exception(&self, sys: &SystemState, t: ThreadRef) {
        use Register::*;
        let th = sys.thread(t);
        log::error!(
            "unhandled exception: et={} ed={:#x} spc={:#x}",
            th.reg(ET),
            th.reg(ED),
            th.reg(SPC)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;

    #[test]
    fn test_exit_returns_status() {
        let (mut sys, core) = SystemState::single_core(SimConfig::default());
        let t = ThreadRef { core, index: 0 };
        sys.thread_mut(t).in_use = true;
        sys.thread_mut(t).set_reg(Register::R0, number::EXIT);
        sys.thread_mut(t).set_reg(Register::R1, 7);
        let mut handler = SyscallHandler::new();
        assert_eq!(handler.do_syscall(&mut sys, t), SyscallOutcome::Exit(7));
    }

    #[test]
    fn test_write_captures_stdout() {
        let (mut sys, core) = SystemState::single_core(SimConfig::default());
        let base = sys.core(core).ram_base;
        sys.core_mut(core).write_memory(base + 0x100, b"Hello\n");
        let t = ThreadRef { core, index: 0 };
        sys.thread_mut(t).in_use = true;
        sys.thread_mut(t).set_reg(Register::R0, number::WRITE);
        sys.thread_mut(t).set_reg(Register::R1, 1);
        sys.thread_mut(t).set_reg(Register::R2, base + 0x100);
        sys.thread_mut(t).set_reg(Register::R3, 6);
        let mut handler = SyscallHandler::new();
        assert_eq!(handler.do_syscall(&mut sys, t), SyscallOutcome::Continue);
        assert_eq!(handler.stdout(), b"Hello\n");
        assert_eq!(sys.thread(t).reg(Register::R0), 6);
    }

    #[test]
    fn test_done_rendezvous() {
        let (mut sys, core) = SystemState::single_core(SimConfig::default());
        let t = ThreadRef { core, index: 0 };
        sys.thread_mut(t).in_use = true;
        sys.thread_mut(t).set_reg(Register::R0, number::DONE);
        let mut handler = SyscallHandler::new();
        handler.set_done_syscalls_required(2);
        assert_eq!(handler.do_syscall(&mut sys, t), SyscallOutcome::Deschedule);
        assert_eq!(handler.do_syscall(&mut sys, t), SyscallOutcome::Exit(0));
    }
}
