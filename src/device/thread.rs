//! Per-thread architectural state.
//!
//! Each core has a fixed array of thread slots. A slot holds the register
//! file, the program counter, the thread's simulated clock and the status
//! bits, plus the bookkeeping that ties the thread to the resources it owns:
//! the resource it is paused on, its synchroniser membership, and the lists
//! of resources with events or interrupts enabled.

use crate::device::{ResourceRef, Ticks};

/// Register numbers. R0..R11 are general purpose; the rest are the special
/// registers defined by the architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
#[allow(clippy::upper_case_acronyms)]
pub enum Register {
    R0 = 0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    CP,
    DP,
    SP,
    LR,
    ET,
    ED,
    KEP,
    KSP,
    SPC,
    SED,
    SSR,
}

pub const NUM_REGISTERS: usize = Register::SSR as usize + 1;

/// Status-register bits.
pub mod sr {
    /// Events enabled on the thread.
    pub const EEBLE: u8 = 1 << 0;
    /// Interrupts enabled on the thread.
    pub const IEBLE: u8 = 1 << 1;
    /// The thread is enabled for events.
    pub const INENB: u8 = 1 << 2;
    /// The thread is servicing an interrupt.
    pub const ININT: u8 = 1 << 3;
    /// The thread is in kernel mode.
    pub const INK: u8 = 1 << 4;
    pub const SINK: u8 = 1 << 5;
    /// The thread is paused.
    pub const WAITING: u8 = 1 << 6;
    pub const FAST: u8 = 1 << 7;
}

/// Synchroniser membership of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMembership {
    /// Master of the synchroniser with the given index.
    Master(usize),
    /// Slave of the synchroniser with the given index.
    Slave(usize),
}

/// State of one hardware thread.
#[derive(Debug, Clone)]
pub struct ThreadState {
    /// Register file, indexed by [`Register`].
    pub regs: [u32; NUM_REGISTERS],
    /// Program counter, as a virtual byte address.
    pub pc: u32,
    /// The thread's clock, approximating the processor clock.
    pub time: Ticks,
    /// Instructions executed.
    pub count: u64,
    /// Status register.
    pub sr: u8,
    /// Whether the thread slot is allocated.
    pub in_use: bool,
    /// The resource the thread is paused on, if any.
    pub paused_on: Option<ResourceRef>,
    /// Synchroniser membership, if any.
    pub sync: Option<SyncMembership>,
    /// Whether the thread is at its synchronisation point. New slave threads
    /// start here; cleared when the group is released.
    pub at_sync: bool,
    /// Resources owned by this thread with events enabled.
    pub event_resources: Vec<ResourceRef>,
    /// Resources owned by this thread with interrupts enabled.
    pub interrupt_resources: Vec<ResourceRef>,
    /// Whether the thread currently has an entry in the scheduler queue.
    pub queued: bool,
}

impl Default for ThreadState {
    fn default() -> Self {
        ThreadState {
            regs: [0; NUM_REGISTERS],
            pc: 0,
            time: 0,
            count: 0,
            sr: 0,
            in_use: false,
            paused_on: None,
            sync: None,
            at_sync: false,
            event_resources: Vec::new(),
            interrupt_resources: Vec::new(),
            queued: false,
        }
    }
}

impl ThreadState {
    /// Reinitialise the slot for a fresh allocation at time `t`.
    pub fn alloc(&mut self, t: Ticks) {
        self.in_use = true;
        self.time = t;
        self.pc = 0;
        self.sr = 0;
        self.paused_on = None;
        self.sync = None;
        self.at_sync = false;
        self.event_resources.clear();
        self.interrupt_resources.clear();
        for r in self.regs.iter_mut() {
            *r = 0;
        }
    }

    pub fn free(&mut self) {
        self.in_use = false;
        self.sync = None;
        self.paused_on = None;
        self.event_resources.clear();
        self.interrupt_resources.clear();
    }

    #[inline]
    pub fn reg(&self, r: Register) -> u32 {
        self.regs[r as usize]
    }

    #[inline]
    pub fn set_reg(&mut self, r: Register, value: u32) {
        self.regs[r as usize] = value;
    }

    #[inline]
    pub fn eeble(&self) -> bool {
        self.sr & sr::EEBLE != 0
    }

    #[inline]
    pub fn ieble(&self) -> bool {
        self.sr & sr::IEBLE != 0
    }

    #[inline]
    pub fn waiting(&self) -> bool {
        self.sr & sr::WAITING != 0
    }

    pub fn set_sr_bit(&mut self, bit: u8, value: bool) {
        if value {
            self.sr |= bit;
        } else {
            self.sr &= !bit;
        }
    }

    pub fn add_event_resource(&mut self, res: ResourceRef) {
        if !self.event_resources.contains(&res) {
            self.event_resources.push(res);
        }
    }

    pub fn remove_event_resource(&mut self, res: ResourceRef) {
        self.event_resources.retain(|r| *r != res);
    }

    pub fn add_interrupt_resource(&mut self, res: ResourceRef) {
        if !self.interrupt_resources.contains(&res) {
            self.interrupt_resources.push(res);
        }
    }

    pub fn remove_interrupt_resource(&mut self, res: ResourceRef) {
        self.interrupt_resources.retain(|r| *r != res);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CoreRef, ResourceType};

    fn res(index: usize) -> ResourceRef {
        ResourceRef {
            core: CoreRef { node: 0, core: 0 },
            ty: ResourceType::Timer,
            index,
        }
    }

    #[test]
    fn test_alloc_resets_state() {
        let mut t = ThreadState::default();
        t.regs[3] = 7;
        t.sr = sr::EEBLE;
        t.alloc(100);
        assert!(t.in_use);
        assert_eq!(t.time, 100);
        assert_eq!(t.regs[3], 0);
        assert_eq!(t.sr, 0);
    }

    #[test]
    fn test_event_list_no_duplicates() {
        let mut t = ThreadState::default();
        t.add_event_resource(res(1));
        t.add_event_resource(res(1));
        assert_eq!(t.event_resources.len(), 1);
        t.remove_event_resource(res(1));
        assert!(t.event_resources.is_empty());
    }

    #[test]
    fn test_sr_bits() {
        let mut t = ThreadState::default();
        t.set_sr_bit(sr::EEBLE, true);
        assert!(t.eeble());
        assert!(!t.ieble());
        t.set_sr_bit(sr::EEBLE, false);
        assert!(!t.eeble());
    }
}
