//! System state and the simulation loop.
//!
//! [`SystemState`] owns the nodes (and through them every core and
//! resource), the runnable queue and the tracer. All mutation of resource
//! state happens inside a call initiated by the scheduler-selected runnable;
//! cross-references are arena indices, never pointers.
//!
//! This module also hosts the channel-endpoint dispatch: the closed set of
//! things a packet can be routed to ([`crate::device::EndpointRef`]) with an
//! explicit match per operation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::SimConfig;
use crate::device::core::{CellKind, Core};
use crate::device::node::{Node, NodeType};
use crate::device::resource::{Eventable, ResourceBase, ResourceType};
use crate::device::thread::{sr, ThreadState};
use crate::device::{
    Chanend, CoreRef, EndpointRef, Lock, Port, ResourceRef, Synchroniser, ThreadRef, Ticks, Timer,
};
use crate::exec::syscall::BreakpointType;
use crate::exec::StopEvent;
use crate::sched::{Runnable, Scheduler};
use crate::trace::Tracer;

/// Why the simulation loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A host breakpoint was hit by the given thread.
    Breakpoint(ThreadRef),
    /// The guest exited with a status.
    Exit(i32),
    /// The queue drained with nothing left to run.
    NoRunnableThreads,
    /// The wall-clock limit expired.
    Timeout,
}

/// Result of claiming a route to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    /// Route open; tokens go to the returned endpoint (a group claim
    /// refines to the concrete link).
    Claimed(EndpointRef),
    /// Route "open" but everything sent will be junked.
    Junk(EndpointRef),
    /// The destination is busy; the claimant was queued and will get
    /// `notify_dest_claimed` when the route frees up.
    Deferred,
}

/// The complete simulated system.
pub struct SystemState {
    pub nodes: Vec<Node>,
    pub scheduler: Scheduler,
    pub config: SimConfig,
    pub tracer: Box<dyn Tracer>,
    pub current_thread: Option<ThreadRef>,
    breakpoints: HashMap<(CoreRef, u32), BreakpointType>,
}

impl SystemState {
    pub fn new(config: SimConfig) -> Self {
        SystemState {
            nodes: Vec::new(),
            scheduler: Scheduler::new(),
            config,
            tracer: Box::new(crate::trace::NullTracer),
            current_thread: None,
            breakpoints: HashMap::new(),
        }
    }

    /// Convenience: one L-type node with one core and no links.
    pub fn single_core(config: SimConfig) -> (Self, CoreRef) {
        let mut sys = SystemState::new(config);
        let node = sys.add_node(NodeType::L, 0);
        let core = sys.add_core(node);
        (sys, core)
    }

    pub fn set_tracer(&mut self, tracer: Box<dyn Tracer>) {
        self.tracer = tracer;
    }

    pub fn add_node(&mut self, node_type: NodeType, num_xlinks: usize) -> usize {
        let mut node = Node::new(node_type, num_xlinks);
        node.jtag_index = self.nodes.len();
        node.set_node_id(self.nodes.len() as u32);
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn add_core(&mut self, node: usize) -> CoreRef {
        let n = &mut self.nodes[node];
        let index = n.cores.len();
        let core_id = (n.node_id << n.non_node_number_bits()) | index as u32;
        n.cores.push(Core::new(core_id));
        CoreRef { node, core: index }
    }

    // -- accessors --------------------------------------------------------

    #[inline]
    pub fn core(&self, c: CoreRef) -> &Core {
        &self.nodes[c.node].cores[c.core]
    }

    #[inline]
    pub fn core_mut(&mut self, c: CoreRef) -> &mut Core {
        &mut self.nodes[c.node].cores[c.core]
    }

    #[inline]
    pub fn thread(&self, t: ThreadRef) -> &ThreadState {
        &self.core(t.core).threads[t.index]
    }

    #[inline]
    pub fn thread_mut(&mut self, t: ThreadRef) -> &mut ThreadState {
        &mut self.nodes[t.core.node].cores[t.core.core].threads[t.index]
    }

    #[inline]
    pub(crate) fn timer(&self, r: ResourceRef) -> &Timer {
        &self.core(r.core).timers[r.index]
    }

    #[inline]
    pub(crate) fn timer_mut(&mut self, r: ResourceRef) -> &mut Timer {
        &mut self.nodes[r.core.node].cores[r.core.core].timers[r.index]
    }

    #[inline]
    pub(crate) fn chanend(&self, r: ResourceRef) -> &Chanend {
        &self.core(r.core).chanends[r.index]
    }

    #[inline]
    pub(crate) fn chanend_mut(&mut self, r: ResourceRef) -> &mut Chanend {
        &mut self.nodes[r.core.node].cores[r.core.core].chanends[r.index]
    }

    #[inline]
    pub(crate) fn port(&self, r: ResourceRef) -> &Port {
        &self.core(r.core).ports[r.index]
    }

    #[inline]
    pub(crate) fn port_mut(&mut self, r: ResourceRef) -> &mut Port {
        &mut self.nodes[r.core.node].cores[r.core.core].ports[r.index]
    }

    #[inline]
    pub(crate) fn sync(&self, r: ResourceRef) -> &Synchroniser {
        &self.core(r.core).syncs[r.index]
    }

    #[inline]
    pub(crate) fn sync_mut(&mut self, r: ResourceRef) -> &mut Synchroniser {
        &mut self.nodes[r.core.node].cores[r.core.core].syncs[r.index]
    }

    #[inline]
    pub(crate) fn lock(&self, r: ResourceRef) -> &Lock {
        &self.core(r.core).locks[r.index]
    }

    #[inline]
    pub(crate) fn lock_mut(&mut self, r: ResourceRef) -> &mut Lock {
        &mut self.nodes[r.core.node].cores[r.core.core].locks[r.index]
    }

    // -- scheduling -------------------------------------------------------

    pub fn schedule(&mut self, runnable: Runnable, time: Ticks) {
        self.scheduler.push(runnable, time);
    }

    /// Queue a thread, unless it already has a pending entry.
    pub fn schedule_thread(&mut self, t: ThreadRef, time: Ticks) {
        let th = self.thread_mut(t);
        if th.queued || !th.in_use {
            return;
        }
        th.queued = true;
        th.set_sr_bit(sr::WAITING, false);
        self.scheduler.push(Runnable::Thread(t), time);
    }

    /// Unblock a thread: its clock is clamped forward to `time` so it never
    /// observes an earlier moment than what woke it.
    pub fn wake_thread(&mut self, t: ThreadRef, time: Ticks) {
        let th = self.thread_mut(t);
        th.time = th.time.max(time);
        th.paused_on = None;
        let at = th.time;
        self.schedule_thread(t, at);
    }

    /// Latest simulated time reached by any thread.
    pub fn max_time(&self) -> Ticks {
        self.nodes
            .iter()
            .flat_map(|n| n.cores.iter())
            .flat_map(|c| c.threads.iter())
            .map(|t| t.time)
            .max()
            .unwrap_or(0)
    }

    // -- events and interrupts -------------------------------------------

    /// Event state of an eventable resource, or None for resource kinds
    /// that cannot generate events.
    pub(crate) fn eventable_parts(&self, res: ResourceRef) -> Option<(&ResourceBase, &Eventable)> {
        match res.ty {
            ResourceType::Timer => {
                let t = self.timer(res);
                Some((&t.base, &t.eventable))
            }
            ResourceType::Chanend => {
                let c = self.chanend(res);
                Some((&c.base, &c.eventable))
            }
            ResourceType::Port => {
                let p = self.port(res);
                Some((&p.base, &p.eventable))
            }
            _ => None,
        }
    }

    pub(crate) fn eventable_parts_mut(
        &mut self,
        res: ResourceRef,
    ) -> Option<(&mut ResourceBase, &mut Eventable)> {
        let core = &mut self.nodes[res.core.node].cores[res.core.core];
        match res.ty {
            ResourceType::Timer => {
                let t = &mut core.timers[res.index];
                Some((&mut t.base, &mut t.eventable))
            }
            ResourceType::Chanend => {
                let c = &mut core.chanends[res.index];
                Some((&mut c.base, &mut c.eventable))
            }
            ResourceType::Port => {
                let p = &mut core.ports[res.index];
                Some((&mut p.base, &mut p.eventable))
            }
            _ => None,
        }
    }

    /// Whether the resource may generate an event or interrupt right now.
    pub(crate) fn events_permitted(&self, res: ResourceRef) -> bool {
        let Some((base, ev)) = self.eventable_parts(res) else {
            return false;
        };
        if !base.in_use {
            return false;
        }
        let Some(owner) = base.owner else {
            return false;
        };
        let th = self.thread(owner);
        (ev.event_enabled && th.eeble()) || (ev.interrupt_enabled && th.ieble())
    }

    /// Deliver the resource's event or interrupt to its owner.
    pub(crate) fn fire_event(&mut self, res: ResourceRef, time: Ticks) {
        let Some((base, ev)) = self.eventable_parts(res) else {
            return;
        };
        let Some(owner) = base.owner else {
            return;
        };
        let interrupt = ev.interrupt_enabled && self.thread(owner).ieble();
        self.complete_event(owner, res, interrupt, time);
    }

    /// Transfer control of the owning thread to the resource's vector. For
    /// interrupts the interrupted context is saved to SSR/SPC/SED first.
    pub(crate) fn complete_event(
        &mut self,
        owner: ThreadRef,
        res: ResourceRef,
        interrupt: bool,
        time: Ticks,
    ) {
        use crate::device::thread::Register::*;
        let (vector, ev_data) = {
            let (_, ev) = self.eventable_parts(res).expect("event on non-eventable resource");
            (ev.vector, ev.ev_data)
        };
        {
            let th = self.thread_mut(owner);
            if interrupt {
                th.regs[SSR as usize] = th.sr as u32;
                th.regs[SPC as usize] = th.pc;
                th.regs[SED as usize] = th.regs[ED as usize];
                th.set_sr_bit(sr::IEBLE, false);
                th.set_sr_bit(sr::ININT, true);
                th.set_sr_bit(sr::INK, true);
            } else {
                th.set_sr_bit(sr::INENB, false);
            }
            th.set_sr_bit(sr::EEBLE, false);
            th.regs[ED as usize] = ev_data;
            th.pc = vector;
        }
        if res.ty == ResourceType::Port {
            // Hold the transferred data for the handler to collect.
            self.port_mut(res).hold_transfer_reg = true;
        }
        if interrupt {
            self.tracer.interrupt(owner, res, vector);
        } else {
            self.tracer.event(owner, res, vector, ev_data);
        }
        self.wake_thread(owner, time);
    }

    /// `eeu`/`edu` style enable. Uses the resource's interrupt-mode flag to
    /// pick the list. Returns false for non-eventable resources.
    pub(crate) fn eventable_enable(&mut self, t: ThreadRef, res: ResourceRef) -> bool {
        let interrupt_mode = {
            let Some((base, ev)) = self.eventable_parts_mut(res) else {
                return false;
            };
            base.owner = Some(t);
            ev.interrupt_mode
        };
        {
            let (_, ev) = self.eventable_parts_mut(res).unwrap();
            ev.event_enabled = !interrupt_mode;
            ev.interrupt_enabled = interrupt_mode;
        }
        let th = self.thread_mut(t);
        if interrupt_mode {
            th.remove_event_resource(res);
            th.add_interrupt_resource(res);
        } else {
            th.remove_interrupt_resource(res);
            th.add_event_resource(res);
        }
        if self.events_permitted(res) {
            let time = self.thread(t).time;
            self.see_event_enable(res, time);
        }
        true
    }

    pub(crate) fn eventable_disable(&mut self, res: ResourceRef) {
        let owner = {
            let Some((base, ev)) = self.eventable_parts_mut(res) else {
                return;
            };
            ev.event_enabled = false;
            ev.interrupt_enabled = false;
            base.owner
        };
        if let Some(owner) = owner {
            let th = self.thread_mut(owner);
            th.remove_event_resource(res);
            th.remove_interrupt_resource(res);
        }
    }

    /// Ask the resource to fire immediately if its condition is already
    /// met, or to arrange a wakeup for when it will be.
    pub(crate) fn see_event_enable(&mut self, res: ResourceRef, time: Ticks) -> bool {
        match res.ty {
            ResourceType::Timer => self.timer_see_event_enable(res, time),
            ResourceType::Chanend => self.chanend_see_event_enable(res, time),
            ResourceType::Port => self.port_see_event_enable(res, time),
            _ => false,
        }
    }

    /// Update the status register, honouring newly enabled events or
    /// interrupts before the next instruction. Returns true if an event or
    /// interrupt was taken (the thread's PC has changed).
    pub(crate) fn thread_set_sr(&mut self, t: ThreadRef, new_sr: u8) -> bool {
        let old = self.thread(t).sr;
        self.thread_mut(t).sr = new_sr;
        let enabled = new_sr & !old;
        if enabled & (sr::EEBLE | sr::IEBLE) == 0 {
            return false;
        }
        self.thread_check_pending(t)
    }

    /// Walk the enabled-resource lists and take the first met condition.
    pub(crate) fn thread_check_pending(&mut self, t: ThreadRef) -> bool {
        let time = self.thread(t).time;
        if self.thread(t).eeble() {
            for res in self.thread(t).event_resources.clone() {
                if self.see_event_enable(res, time) {
                    return true;
                }
            }
        }
        if self.thread(t).ieble() {
            for res in self.thread(t).interrupt_resources.clone() {
                if self.see_event_enable(res, time) {
                    return true;
                }
            }
        }
        false
    }

    /// `clre`: disable events on every resource owned by the thread.
    pub(crate) fn thread_clre(&mut self, t: ThreadRef) {
        let th = self.thread_mut(t);
        th.set_sr_bit(sr::EEBLE, false);
        th.set_sr_bit(sr::INENB, false);
        let resources = th.event_resources.clone();
        for res in resources {
            self.eventable_disable(res);
        }
    }

    // -- resource allocation ---------------------------------------------

    /// `getr`: allocate a resource of the requested type, returning its ID.
    pub(crate) fn alloc_resource(&mut self, t: ThreadRef, ty: ResourceType) -> Option<u32> {
        let index = self.core(t.core).find_free_resource(ty)?;
        let node_field = match ty {
            ResourceType::Chanend => self.core(t.core).core_id,
            _ => 0,
        };
        match ty {
            ResourceType::Timer => self.core_mut(t.core).timers[index].alloc(t),
            ResourceType::Chanend => self.core_mut(t.core).chanends[index].alloc(t),
            ResourceType::Lock => self.core_mut(t.core).locks[index].alloc(t),
            ResourceType::Sync => {
                self.core_mut(t.core).syncs[index].alloc(t);
                let th = self.thread_mut(t);
                if th.sync.is_none() {
                    th.sync = Some(crate::device::thread::SyncMembership::Master(index));
                }
            }
            _ => return None,
        }
        Some(crate::device::ResourceId::new(ty, index as u32, node_field).0)
    }

    /// `freer`: release a resource back to its pool.
    pub(crate) fn free_resource(&mut self, res: ResourceRef) -> bool {
        self.eventable_disable(res);
        match res.ty {
            ResourceType::Timer => self.timer_mut(res).free(),
            ResourceType::Chanend => self.chanend_mut(res).free(),
            ResourceType::Lock => self.lock_mut(res).free(),
            ResourceType::Sync => self.sync_mut(res).free(),
            ResourceType::Port => {
                let p = self.port_mut(res);
                p.base.set_in_use_off();
            }
            _ => return false,
        }
        true
    }

    // -- breakpoints ------------------------------------------------------

    /// Install a breakpoint cell at a guest PC. Compiled fragments covering
    /// the address are invalidated so the dispatcher sees the cell.
    pub fn set_breakpoint(&mut self, core: CoreRef, address: u32, ty: BreakpointType) -> bool {
        let Some(index) = self.core(core).opcode_index(address) else {
            return false;
        };
        crate::exec::jit::invalidate_range(self.core_mut(core), address, 2);
        self.core_mut(core).opcode_cache[index].kind = CellKind::Breakpoint;
        self.breakpoints.insert((core, address), ty);
        true
    }

    pub fn unset_breakpoints(&mut self) {
        let keys: Vec<(CoreRef, u32)> = self.breakpoints.keys().copied().collect();
        for (core, address) in keys {
            if let Some(index) = self.core(core).opcode_index(address) {
                self.core_mut(core).opcode_cache[index] = Default::default();
            }
        }
        self.breakpoints.clear();
    }

    pub fn breakpoint_type(&self, core: CoreRef, address: u32) -> Option<BreakpointType> {
        self.breakpoints.get(&(core, address)).copied()
    }

    // -- endpoint dispatch ------------------------------------------------

    pub(crate) fn endpoint_dest_id(&self, ep: EndpointRef) -> u32 {
        match ep {
            EndpointRef::Chanend(core, index) => {
                self.core(core).chanends[index].dest_id
            }
            EndpointRef::SSwitch(node) => self.nodes[node].sswitch.dest_id,
            EndpointRef::XLink { node, link } => self.xlink(node, link).dest_id,
            EndpointRef::XLinkGroup { .. } => 0,
        }
    }

    /// Claim a route to `ep` on behalf of `source`.
    pub(crate) fn endpoint_claim(&mut self, ep: EndpointRef, source: EndpointRef) -> ClaimResult {
        match ep {
            EndpointRef::Chanend(core, index) => {
                let res = ResourceRef { core, ty: ResourceType::Chanend, index };
                let ce = self.chanend_mut(res);
                if ce.junk_incoming {
                    return ClaimResult::Junk(ep);
                }
                if ce.source == Some(source) {
                    return ClaimResult::Claimed(ep);
                }
                if ce.source.is_some() {
                    if !ce.claim_queue.contains(&source) {
                        ce.claim_queue.push_back(source);
                    }
                    return ClaimResult::Deferred;
                }
                ce.source = Some(source);
                ClaimResult::Claimed(ep)
            }
            EndpointRef::SSwitch(node) => {
                let ss = &mut self.nodes[node].sswitch;
                if ss.source == Some(source) {
                    return ClaimResult::Claimed(ep);
                }
                if ss.source.is_some() {
                    if !ss.claim_queue.contains(&source) {
                        ss.claim_queue.push_back(source);
                    }
                    return ClaimResult::Deferred;
                }
                ss.source = Some(source);
                ClaimResult::Claimed(ep)
            }
            EndpointRef::XLink { node, link } => {
                let dest_id = self.endpoint_dest_id(source);
                let l = self.xlink_mut(node, link);
                if l.source == Some(source) {
                    return ClaimResult::Claimed(ep);
                }
                if l.source.is_none() {
                    l.source = Some(source);
                    l.dest_id = dest_id;
                    return ClaimResult::Claimed(ep);
                }
                // Queue on the sending side's direction group.
                if let Some((pn, pl)) = self.xlink(node, link).dest {
                    let direction = self.xlink(pn, pl).direction as usize;
                    self.nodes[pn].xlink_groups[direction].queue.push_back(source);
                }
                ClaimResult::Deferred
            }
            EndpointRef::XLinkGroup { node, direction } => {
                self.xlink_group_claim(node, direction, source)
            }
        }
    }

    pub(crate) fn endpoint_can_accept_tokens(&self, ep: EndpointRef, tokens: usize) -> bool {
        match ep {
            EndpointRef::Chanend(core, index) => {
                self.core(core).chanends[index].can_accept_tokens(tokens)
            }
            EndpointRef::SSwitch(node) => self.nodes[node].sswitch.can_accept_token(),
            EndpointRef::XLink { node, link } => self.xlink_can_accept_tokens(node, link, tokens),
            EndpointRef::XLinkGroup { .. } => false,
        }
    }

    pub(crate) fn endpoint_receive_data_token(&mut self, ep: EndpointRef, time: Ticks, value: u8) {
        match ep {
            EndpointRef::Chanend(core, index) => {
                let res = ResourceRef { core, ty: ResourceType::Chanend, index };
                self.chanend_receive_data_token(res, time, value);
            }
            EndpointRef::SSwitch(node) => self.sswitch_receive_data_token(node, time, value),
            EndpointRef::XLink { node, link } => {
                self.xlink_receive_token(node, link, time, crate::device::Token::data(value, time));
            }
            EndpointRef::XLinkGroup { .. } => {}
        }
    }

    pub(crate) fn endpoint_receive_data_tokens(
        &mut self,
        ep: EndpointRef,
        time: Ticks,
        values: &[u8],
    ) {
        match ep {
            EndpointRef::Chanend(core, index) => {
                let res = ResourceRef { core, ty: ResourceType::Chanend, index };
                self.chanend_receive_data_tokens(res, time, values);
            }
            _ => {
                for &v in values {
                    self.endpoint_receive_data_token(ep, time, v);
                }
            }
        }
    }

    pub(crate) fn endpoint_receive_ctrl_token(&mut self, ep: EndpointRef, time: Ticks, value: u8) {
        match ep {
            EndpointRef::Chanend(core, index) => {
                let res = ResourceRef { core, ty: ResourceType::Chanend, index };
                self.chanend_receive_ctrl_token(res, time, value);
            }
            EndpointRef::SSwitch(node) => self.sswitch_receive_ctrl_token(node, time, value),
            EndpointRef::XLink { node, link } => {
                self.xlink_receive_token(node, link, time, crate::device::Token::ctrl(value, time));
            }
            EndpointRef::XLinkGroup { .. } => {}
        }
    }

    /// Tell a queued claimant its route is now open.
    pub(crate) fn endpoint_notify_dest_claimed(&mut self, ep: EndpointRef, time: Ticks) {
        match ep {
            EndpointRef::Chanend(core, index) => {
                let res = ResourceRef { core, ty: ResourceType::Chanend, index };
                self.chanend_notify_dest_claimed(res, time);
            }
            EndpointRef::SSwitch(node) => self.sswitch_notify_dest_claimed(node, time),
            EndpointRef::XLink { node, link } => {
                self.schedule(Runnable::XLink { node, link }, time);
            }
            EndpointRef::XLinkGroup { .. } => {}
        }
    }

    /// Tell a blocked sender the destination has buffer room again.
    pub(crate) fn endpoint_notify_dest_can_accept_tokens(
        &mut self,
        ep: EndpointRef,
        time: Ticks,
        tokens: usize,
    ) {
        match ep {
            EndpointRef::Chanend(core, index) => {
                let res = ResourceRef { core, ty: ResourceType::Chanend, index };
                self.chanend_notify_can_accept(res, time);
            }
            EndpointRef::SSwitch(node) => self.sswitch_notify_can_accept(node, time, tokens),
            EndpointRef::XLink { node, link } => {
                self.schedule(Runnable::XLink { node, link }, time);
            }
            EndpointRef::XLinkGroup { .. } => {}
        }
    }

    // -- the simulation loop ----------------------------------------------

    /// Run until a breakpoint, exit, drained queue or timeout.
    pub fn run(&mut self) -> StopReason {
        let deadline = self
            .config
            .timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let mut iterations: u32 = 0;
        loop {
            iterations = iterations.wrapping_add(1);
            if iterations & 0x3FF == 0 {
                if let Some(deadline) = deadline {
                    if Instant::now() > deadline {
                        let time = self.max_time();
                        self.tracer.timeout(time);
                        return StopReason::Timeout;
                    }
                }
            }
            let Some((runnable, time)) = self.scheduler.pop() else {
                self.tracer.no_runnable_threads();
                return StopReason::NoRunnableThreads;
            };
            match runnable {
                Runnable::Thread(t) => {
                    {
                        let th = self.thread_mut(t);
                        th.queued = false;
                        // Stale entry: the thread descheduled or was freed
                        // after this entry was pushed.
                        if !th.in_use || th.waiting() {
                            continue;
                        }
                    }
                    self.current_thread = Some(t);
                    let stop = crate::exec::run_thread(self, t, time);
                    self.current_thread = None;
                    if let Some(stop) = stop {
                        return match stop {
                            StopEvent::Breakpoint => StopReason::Breakpoint(t),
                            StopEvent::UnhandledException => StopReason::Exit(1),
                        };
                    }
                }
                Runnable::Timer { core, index } => {
                    let res = ResourceRef { core, ty: ResourceType::Timer, index };
                    self.timer_run(res, time);
                }
                Runnable::Port { core, index } => {
                    let res = ResourceRef { core, ty: ResourceType::Port, index };
                    self.port_run(res, time);
                }
                Runnable::Chanend { .. } => {
                    // Chanends react to deliveries synchronously; a queue
                    // entry has nothing left to do.
                }
                Runnable::XLink { node, link } => self.xlink_run(node, link, time),
                Runnable::SSwitch { node } => self.sswitch_run(node, time),
            }
        }
    }

    /// Resource reference for a port's flat index.
    pub(crate) fn port_ref(&self, core: CoreRef, index: usize) -> ResourceRef {
        ResourceRef { core, ty: ResourceType::Port, index }
    }

    /// Look up a port by resource ID.
    pub fn port_ref_by_id(&self, core: CoreRef, id: crate::device::ResourceId) -> Option<ResourceRef> {
        let index = self.core(core).port_index(id)?;
        Some(self.port_ref(core, index))
    }

    /// Wire two ports on the same core together: each drives the other's
    /// input pins.
    pub fn set_loopback(&mut self, core: CoreRef, a: crate::device::ResourceId, b: crate::device::ResourceId) -> bool {
        let (Some(ia), Some(ib)) = (self.core(core).port_index(a), self.core(core).port_index(b))
        else {
            return false;
        };
        self.core_mut(core).ports[ia].loopback = Some(ib);
        self.core_mut(core).ports[ib].loopback = Some(ia);
        true
    }
}

impl std::fmt::Debug for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemState")
            .field("nodes", &self.nodes.len())
            .field("queued", &self.scheduler.len())
            .field("current_thread", &self.current_thread)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_core_layout() {
        let (sys, core) = SystemState::single_core(SimConfig::default());
        assert_eq!(sys.nodes.len(), 1);
        assert_eq!(sys.core(core).threads.len(), crate::device::xs1_spec::NUM_THREADS);
        assert_eq!(sys.core(core).core_id, 0);
    }

    #[test]
    fn test_core_ids_follow_node_ids() {
        let mut sys = SystemState::new(SimConfig::default());
        let n0 = sys.add_node(NodeType::L, 1);
        let n1 = sys.add_node(NodeType::L, 1);
        let c0 = sys.add_core(n0);
        let c1 = sys.add_core(n1);
        assert_eq!(sys.core(c0).core_id, 0);
        assert_eq!(sys.core(c1).core_id, 1 << 8);
    }

    #[test]
    fn test_empty_queue_reports_no_runnable_threads() {
        let (mut sys, _core) = SystemState::single_core(SimConfig::default());
        assert_eq!(sys.run(), StopReason::NoRunnableThreads);
    }

    #[test]
    fn test_enabling_events_fires_met_condition_immediately() {
        use crate::device::thread::sr;

        let (mut sys, core) = SystemState::single_core(SimConfig::default());
        let t = ThreadRef { core, index: 0 };
        sys.thread_mut(t).alloc(0);

        // A freshly allocated timer has no AFTER condition: always ready.
        let id = sys.alloc_resource(t, ResourceType::Timer).unwrap();
        let (_, index) = sys.core(core).resource_index(crate::device::ResourceId(id)).unwrap();
        let res = ResourceRef { core, ty: ResourceType::Timer, index };
        {
            let (_, ev) = sys.eventable_parts_mut(res).unwrap();
            ev.vector = 0x1_0040;
            ev.ev_data = 0xABCD;
        }
        assert!(sys.eventable_enable(t, res));
        // Events disabled on the thread: nothing fired yet.
        assert_ne!(sys.thread(t).pc, 0x1_0040);

        let new_sr = sys.thread(t).sr | sr::EEBLE;
        assert!(sys.thread_set_sr(t, new_sr), "met condition must fire on enable");
        assert_eq!(sys.thread(t).pc, 0x1_0040);
        assert_eq!(sys.thread(t).regs[crate::device::Register::ED as usize], 0xABCD);
        assert!(!sys.thread(t).eeble(), "event delivery clears EEBLE");
    }

    #[test]
    fn test_interrupt_saves_context() {
        use crate::device::thread::sr;
        use crate::device::Register;

        let (mut sys, core) = SystemState::single_core(SimConfig::default());
        let t = ThreadRef { core, index: 0 };
        sys.thread_mut(t).alloc(0);
        sys.thread_mut(t).pc = 0x1_0010;
        sys.thread_mut(t).regs[Register::ED as usize] = 7;

        let id = sys.alloc_resource(t, ResourceType::Timer).unwrap();
        let (_, index) = sys.core(core).resource_index(crate::device::ResourceId(id)).unwrap();
        let res = ResourceRef { core, ty: ResourceType::Timer, index };
        {
            let (_, ev) = sys.eventable_parts_mut(res).unwrap();
            ev.vector = 0x1_0080;
            ev.ev_data = 0x55;
            ev.interrupt_mode = true;
        }
        assert!(sys.eventable_enable(t, res));
        let new_sr = sys.thread(t).sr | sr::IEBLE;
        assert!(sys.thread_set_sr(t, new_sr));

        let th = sys.thread(t);
        assert_eq!(th.pc, 0x1_0080);
        assert_eq!(th.regs[Register::SPC as usize], 0x1_0010);
        assert_eq!(th.regs[Register::SED as usize], 7);
        assert_eq!(th.regs[Register::ED as usize], 0x55);
        assert!(th.sr & sr::ININT != 0);
        assert!(th.sr & sr::INK != 0);
        assert!(!th.ieble());
    }

    #[test]
    fn test_wake_thread_clamps_time() {
        let (mut sys, core) = SystemState::single_core(SimConfig::default());
        let t = ThreadRef { core, index: 0 };
        sys.thread_mut(t).in_use = true;
        sys.thread_mut(t).time = 50;
        sys.wake_thread(t, 100);
        assert_eq!(sys.thread(t).time, 100);
        sys.thread_mut(t).queued = false;
        sys.wake_thread(t, 20);
        assert_eq!(sys.thread(t).time, 100);
    }
}
