//! Timers.
//!
//! A timer reads the 100 MHz reference counter. With `COND_AFTER` set it
//! becomes ready only once the counter has passed the `data` register,
//! using wrap-around comparison; an `in` then returns the counter and clears
//! the condition.

use crate::device::resource::{Condition, Eventable, ResOp, ResourceBase};
use crate::device::xs1_spec::CYCLES_PER_TICK;
use crate::device::{ResourceRef, ThreadRef, Ticks};
use crate::sched::Runnable;
use crate::system::SystemState;

/// One timer resource.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    pub base: ResourceBase,
    pub eventable: Eventable,
    /// Whether the AFTER condition is armed.
    pub after: bool,
    /// Comparison value, in reference-clock ticks.
    pub data: u32,
    /// Thread paused on an input instruction.
    pub paused_in: Option<ThreadRef>,
}

impl Timer {
    /// The timer value at simulated time `time`.
    #[inline]
    pub fn value(time: Ticks) -> u32 {
        (time / CYCLES_PER_TICK as Ticks) as u32
    }

    /// Whether the condition is met at `time`. Wrap-around is handled by the
    /// signed comparison.
    pub fn condition_met(&self, time: Ticks) -> bool {
        if !self.after {
            return true;
        }
        Self::value(time).wrapping_sub(self.data) as i32 >= 0
    }

    /// Earliest time at or after `now` at which the timer will be ready.
    pub fn earliest_ready_time(&self, now: Ticks) -> Ticks {
        if self.condition_met(now) {
            return now;
        }
        let delta = self.data.wrapping_sub(Self::value(now)) as i32;
        now + delta as Ticks * CYCLES_PER_TICK as Ticks
    }

    pub fn alloc(&mut self, owner: ThreadRef) {
        debug_assert!(!self.base.in_use, "allocating in-use timer");
        self.after = false;
        self.data = 0;
        self.paused_in = None;
        self.eventable.reset();
        self.base.set_in_use_on(owner);
    }

    pub fn free(&mut self) {
        self.base.set_in_use_off();
        self.paused_in = None;
    }
}

impl SystemState {
    /// `in` on a timer: returns the counter once the condition is met,
    /// otherwise parks the thread.
    pub(crate) fn timer_in(
        &mut self,
        thread: ThreadRef,
        res: ResourceRef,
        time: Ticks,
    ) -> ResOp<u32> {
        let timer = self.timer_mut(res);
        if timer.condition_met(time) {
            timer.after = false;
            ResOp::Done(Timer::value(time))
        } else {
            timer.paused_in = Some(thread);
            let ready = timer.earliest_ready_time(time);
            self.thread_mut(thread).paused_on = Some(res);
            self.schedule(Runnable::Timer { core: res.core, index: res.index }, ready);
            ResOp::Descheduled
        }
    }

    pub(crate) fn timer_set_condition(
        &mut self,
        res: ResourceRef,
        cond: Condition,
        time: Ticks,
    ) -> bool {
        let after = match cond {
            Condition::After => true,
            Condition::Full => false,
            _ => return false,
        };
        let timer = self.timer_mut(res);
        timer.after = after;
        self.timer_schedule_if_needed(res, time);
        true
    }

    pub(crate) fn timer_set_data(&mut self, res: ResourceRef, data: u32, time: Ticks) {
        self.timer_mut(res).data = data;
        self.timer_schedule_if_needed(res, time);
    }

    /// Scheduler callback: wake the paused thread or fire the event.
    pub(crate) fn timer_run(&mut self, res: ResourceRef, time: Ticks) {
        let timer = self.timer(res);
        if !timer.base.in_use || !timer.condition_met(time) {
            return;
        }
        if let Some(t) = self.timer_mut(res).paused_in.take() {
            self.wake_thread(t, time);
        }
        if self.events_permitted(res) {
            self.fire_event(res, time);
        }
    }

    /// Called when events are enabled on the owning thread. Returns true if
    /// an event fired.
    pub(crate) fn timer_see_event_enable(&mut self, res: ResourceRef, time: Ticks) -> bool {
        if self.timer(res).condition_met(time) {
            self.fire_event(res, time);
            return true;
        }
        self.timer_schedule_if_needed(res, time);
        false
    }

    fn timer_schedule_if_needed(&mut self, res: ResourceRef, time: Ticks) {
        let timer = self.timer(res);
        if timer.paused_in.is_none() && !self.events_permitted(res) {
            return;
        }
        let ready = self.timer(res).earliest_ready_time(time);
        self.schedule(Runnable::Timer { core: res.core, index: res.index }, ready);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_met_when_after_clear() {
        let t = Timer::default();
        assert!(t.condition_met(0));
        assert!(t.condition_met(u64::MAX / 2));
    }

    #[test]
    fn test_after_condition() {
        let t = Timer { after: true, data: 100, ..Timer::default() };
        let ticks = 100 * CYCLES_PER_TICK as Ticks;
        assert!(!t.condition_met(ticks - CYCLES_PER_TICK as Ticks));
        assert!(t.condition_met(ticks));
        assert!(t.condition_met(ticks + 4));
    }

    #[test]
    fn test_wraparound_comparison() {
        // data just behind the counter after wrap still counts as met.
        let t = Timer { after: true, data: 0xFFFF_FFF0, ..Timer::default() };
        let now = 0x10u64 * CYCLES_PER_TICK as Ticks;
        // value(now) = 0x10, data = 0xFFFFFFF0: difference is small positive
        // in wrapping arithmetic.
        assert!(t.condition_met(now));
    }

    #[test]
    fn test_earliest_ready_time() {
        let t = Timer { after: true, data: 1000, ..Timer::default() };
        let ready = t.earliest_ready_time(0);
        assert_eq!(ready, 1000 * CYCLES_PER_TICK as Ticks);
        assert!(t.condition_met(ready));
    }
}
