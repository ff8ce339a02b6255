//! Locks.
//!
//! A lock is a single-owner mutex. `in` acquires it, descheduling the caller
//! while another thread holds it; `out` releases it and hands it to the
//! oldest waiter.

use std::collections::VecDeque;

use crate::device::resource::{ResOp, ResourceBase};
use crate::device::{ResourceRef, ThreadRef, Ticks};
use crate::system::SystemState;

/// One lock resource.
#[derive(Debug, Clone, Default)]
pub struct Lock {
    pub base: ResourceBase,
    /// Thread currently holding the lock.
    pub held_by: Option<ThreadRef>,
    /// Threads paused waiting to acquire, oldest first.
    pub waiters: VecDeque<ThreadRef>,
}

impl Lock {
    pub fn alloc(&mut self, owner: ThreadRef) {
        debug_assert!(!self.base.in_use, "allocating in-use lock");
        self.held_by = None;
        self.waiters.clear();
        self.base.set_in_use_on(owner);
    }

    pub fn free(&mut self) {
        self.base.set_in_use_off();
        self.held_by = None;
        self.waiters.clear();
    }
}

impl SystemState {
    /// Acquire the lock. A held lock deschedules the caller — including the
    /// holder itself; the lock is not reentrant.
    pub(crate) fn lock_acquire(
        &mut self,
        thread: ThreadRef,
        res: ResourceRef,
        _time: Ticks,
    ) -> ResOp<()> {
        let lock = self.lock_mut(res);
        match lock.held_by {
            None => {
                lock.held_by = Some(thread);
                ResOp::Done(())
            }
            Some(_) => {
                if !lock.waiters.contains(&thread) {
                    lock.waiters.push_back(thread);
                }
                self.thread_mut(thread).paused_on = Some(res);
                ResOp::Descheduled
            }
        }
    }

    /// Release the lock and wake the oldest waiter, which will retry its
    /// acquire and take ownership.
    pub(crate) fn lock_release(
        &mut self,
        thread: ThreadRef,
        res: ResourceRef,
        time: Ticks,
    ) -> ResOp<()> {
        let lock = self.lock_mut(res);
        if lock.held_by != Some(thread) {
            return ResOp::Illegal;
        }
        lock.held_by = None;
        if let Some(next) = lock.waiters.pop_front() {
            self.wake_thread(next, time);
        }
        ResOp::Done(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CoreRef;

    #[test]
    fn test_alloc_clears_holder() {
        let mut lock = Lock::default();
        let t = ThreadRef { core: CoreRef { node: 0, core: 0 }, index: 0 };
        lock.held_by = Some(t);
        lock.waiters.push_back(t);
        lock.alloc(t);
        assert!(lock.base.in_use);
        assert!(lock.held_by.is_none());
        assert!(lock.waiters.is_empty());
    }
}
