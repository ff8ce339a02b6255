//! Synchronisers.
//!
//! A synchroniser binds a master thread to a group of slave threads. Slaves
//! sit at their synchronisation point (`ssync`); the master releases the
//! whole group with `msync` or terminates it with `mjoin`. Freshly created
//! slaves start at the synchronisation point, so the first `msync` is what
//! actually starts them running.

use crate::device::resource::{ResOp, ResourceBase};
use crate::device::thread::SyncMembership;
use crate::device::{ResourceRef, ThreadRef, Ticks};
use crate::system::SystemState;

/// What the master is blocked in, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MasterStatus {
    #[default]
    Running,
    InMsync,
    InMjoin,
}

/// One synchroniser resource.
#[derive(Debug, Clone, Default)]
pub struct Synchroniser {
    pub base: ResourceBase,
    pub master: Option<ThreadRef>,
    pub slaves: Vec<ThreadRef>,
    /// Number of slaves currently at the synchronisation point.
    pub paused_slaves: usize,
    pub master_status: MasterStatus,
}

impl Synchroniser {
    pub fn alloc(&mut self, master: ThreadRef) {
        debug_assert!(!self.base.in_use, "allocating in-use synchroniser");
        self.master = Some(master);
        self.slaves.clear();
        self.paused_slaves = 0;
        self.master_status = MasterStatus::Running;
        self.base.set_in_use_on(master);
    }

    pub fn free(&mut self) {
        self.base.set_in_use_off();
        self.master = None;
        self.slaves.clear();
        self.paused_slaves = 0;
    }

    #[inline]
    pub fn all_slaves_paused(&self) -> bool {
        self.paused_slaves == self.slaves.len()
    }
}

impl SystemState {
    /// `getst`: allocate a free thread slot as a new slave of the group.
    /// The slave starts at its synchronisation point and is not scheduled
    /// until the master synchronises. Returns the slave's thread number.
    pub(crate) fn sync_get_thread(
        &mut self,
        master: ThreadRef,
        res: ResourceRef,
        time: Ticks,
    ) -> ResOp<u32> {
        let core = self.core_mut(master.core);
        let Some(slot) = core.threads.iter().position(|t| !t.in_use) else {
            return ResOp::Illegal;
        };
        core.threads[slot].alloc(time);
        let slave = ThreadRef { core: master.core, index: slot };
        {
            let t = self.thread_mut(slave);
            t.sync = Some(SyncMembership::Slave(res.index));
            t.at_sync = true;
        }
        let sync = self.sync_mut(res);
        sync.slaves.push(slave);
        sync.paused_slaves += 1;
        ResOp::Done(slot as u32)
    }

    /// `ssync` from a slave: park at the synchronisation point and release
    /// the group if everyone has now arrived. The caller must have committed
    /// its program counter; the slave resumes after the instruction.
    pub(crate) fn sync_ssync(&mut self, thread: ThreadRef, res: ResourceRef, time: Ticks) -> ResOp<()> {
        let is_master = self.sync(res).master == Some(thread);
        if is_master {
            return self.sync_msync(thread, res, time);
        }
        {
            let t = self.thread_mut(thread);
            t.at_sync = true;
            t.paused_on = Some(res);
        }
        self.sync_mut(res).paused_slaves += 1;
        self.sync_release_if_ready(res, time);
        ResOp::Descheduled
    }

    /// `msync` from the master: release the group if all slaves are at the
    /// synchronisation point, otherwise wait for them.
    pub(crate) fn sync_msync(&mut self, thread: ThreadRef, res: ResourceRef, time: Ticks) -> ResOp<()> {
        let sync = self.sync_mut(res);
        if sync.all_slaves_paused() {
            sync.master_status = MasterStatus::Running;
            self.sync_wake_slaves(res, time);
            ResOp::Done(())
        } else {
            sync.master_status = MasterStatus::InMsync;
            self.thread_mut(thread).paused_on = Some(res);
            ResOp::Descheduled
        }
    }

    /// `mjoin` from the master: wait for all slaves, then terminate the
    /// group, freeing the slave thread slots.
    pub(crate) fn sync_mjoin(&mut self, thread: ThreadRef, res: ResourceRef, _time: Ticks) -> ResOp<()> {
        let sync = self.sync_mut(res);
        if sync.all_slaves_paused() {
            self.sync_free_slaves(res);
            ResOp::Done(())
        } else {
            let sync = self.sync_mut(res);
            sync.master_status = MasterStatus::InMjoin;
            self.thread_mut(thread).paused_on = Some(res);
            ResOp::Descheduled
        }
    }

    /// If every slave has arrived and the master is waiting, release or
    /// terminate the group.
    fn sync_release_if_ready(&mut self, res: ResourceRef, time: Ticks) {
        let sync = self.sync(res);
        if !sync.all_slaves_paused() {
            return;
        }
        let master = sync.master;
        match sync.master_status {
            MasterStatus::Running => {}
            MasterStatus::InMsync => {
                self.sync_mut(res).master_status = MasterStatus::Running;
                self.sync_wake_slaves(res, time);
                if let Some(m) = master {
                    self.wake_thread(m, time);
                }
            }
            MasterStatus::InMjoin => {
                self.sync_mut(res).master_status = MasterStatus::Running;
                self.sync_free_slaves(res);
                if let Some(m) = master {
                    self.wake_thread(m, time);
                }
            }
        }
    }

    fn sync_wake_slaves(&mut self, res: ResourceRef, time: Ticks) {
        let slaves = self.sync(res).slaves.clone();
        self.sync_mut(res).paused_slaves = 0;
        for slave in slaves {
            self.thread_mut(slave).at_sync = false;
            self.wake_thread(slave, time);
        }
    }

    fn sync_free_slaves(&mut self, res: ResourceRef) {
        let slaves = std::mem::take(&mut self.sync_mut(res).slaves);
        for slave in slaves {
            self.thread_mut(slave).free();
        }
        self.sync_mut(res).paused_slaves = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CoreRef;

    #[test]
    fn test_all_slaves_paused_empty_group() {
        let mut sync = Synchroniser::default();
        let master = ThreadRef { core: CoreRef { node: 0, core: 0 }, index: 0 };
        sync.alloc(master);
        assert!(sync.all_slaves_paused());
    }
}
