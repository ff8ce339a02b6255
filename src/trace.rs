//! Trace back-ends.
//!
//! The simulator reports observable events through the [`Tracer`] trait. The
//! default back-end is [`NullTracer`]; [`LoggingTracer`] emits through the
//! `log` crate (enable with `RUST_LOG=trace` and the `trace` config flag).

use crate::device::thread::Register;
use crate::device::{ResourceRef, ThreadRef, Ticks};
use crate::exec::isa::InstructionOpcode;
use crate::exec::ExceptionType;

/// Observer of simulator events. All methods default to no-ops so back-ends
/// implement only what they need.
pub trait Tracer {
    fn instruction_begin(&mut self, _thread: ThreadRef, _pc: u32, _op: InstructionOpcode) {}
    fn reg_write(&mut self, _thread: ThreadRef, _reg: Register, _value: u32) {}
    fn event(&mut self, _thread: ThreadRef, _res: ResourceRef, _pc: u32, _ed: u32) {}
    fn interrupt(&mut self, _thread: ThreadRef, _res: ResourceRef, _pc: u32) {}
    fn exception(&mut self, _thread: ThreadRef, _ty: ExceptionType, _data: u32) {}
    fn syscall(&mut self, _thread: ThreadRef, _number: u32) {}
    fn sswitch_read(&mut self, _node: usize, _dest: u32, _regnum: u32) {}
    fn sswitch_write(&mut self, _node: usize, _dest: u32, _regnum: u32, _value: u32) {}
    fn sswitch_ack(&mut self, _node: usize, _dest: u32) {}
    fn sswitch_nack(&mut self, _node: usize, _dest: u32) {}
    fn timeout(&mut self, _time: Ticks) {}
    fn no_runnable_threads(&mut self) {}
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullTracer;

impl Tracer for NullTracer {}

/// Emits events through the `log` crate.
#[derive(Debug, Default)]
pub struct LoggingTracer;

impl Tracer for LoggingTracer {
    fn instruction_begin(&mut self, thread: ThreadRef, pc: u32, op: InstructionOpcode) {
        log::trace!(
            "n{}c{}t{} {:#07x} {:?}",
            thread.core.node,
            thread.core.core,
            thread.index,
            pc,
            op
        );
    }

    fn reg_write(&mut self, thread: ThreadRef, reg: Register, value: u32) {
        log::trace!("t{} {:?} <- {:#x}", thread.index, reg, value);
    }

    fn event(&mut self, thread: ThreadRef, res: ResourceRef, pc: u32, ed: u32) {
        log::debug!(
            "event t{} on {:?}[{}] vector {:#x} ed {:#x}",
            thread.index,
            res.ty,
            res.index,
            pc,
            ed
        );
    }

    fn interrupt(&mut self, thread: ThreadRef, res: ResourceRef, pc: u32) {
        log::debug!("interrupt t{} on {:?}[{}] vector {:#x}", thread.index, res.ty, res.index, pc);
    }

    fn exception(&mut self, thread: ThreadRef, ty: ExceptionType, data: u32) {
        log::warn!("exception t{} {:?} data {:#x}", thread.index, ty, data);
    }

    fn syscall(&mut self, thread: ThreadRef, number: u32) {
        log::debug!("syscall t{} number {}", thread.index, number);
    }

    fn sswitch_read(&mut self, node: usize, dest: u32, regnum: u32) {
        log::debug!("sswitch read node {} reg {:#x} reply to {:#x}", node, regnum, dest);
    }

    fn sswitch_write(&mut self, node: usize, dest: u32, regnum: u32, value: u32) {
        log::debug!(
            "sswitch write node {} reg {:#x} <- {:#x} reply to {:#x}",
            node,
            regnum,
            value,
            dest
        );
    }

    fn sswitch_ack(&mut self, node: usize, dest: u32) {
        log::debug!("sswitch ack node {} to {:#x}", node, dest);
    }

    fn sswitch_nack(&mut self, node: usize, dest: u32) {
        log::debug!("sswitch nack node {} to {:#x}", node, dest);
    }

    fn timeout(&mut self, time: Ticks) {
        log::warn!("wall-clock timeout at simulated time {}", time);
    }

    fn no_runnable_threads(&mut self) {
        log::info!("no runnable threads");
    }
}
