//! Ports.
//!
//! A port is a width-parameterised shift register synchronised to a clock
//! block's edge stream. Output ports shift one port-width slice onto the
//! pins per falling edge; input ports sample the pins on rising edges and
//! transfer a full shift register into the transfer register, waking paused
//! threads and firing events when the port's condition is met.
//!
//! Ports do not single-step every edge. When nothing observable can happen
//! (no paused thread, no event armed, no observer of the pins) intermediate
//! edges are skipped in bulk and only the edges that determine the final
//! state are replayed. Setting `slow_ports` in the config forces edge-by-edge
//! processing, which is the oracle the fast path is checked against.

use smallvec::SmallVec;

use crate::device::clock::{ClockSource, EdgeIterator, EdgeKind};
use crate::device::resource::{Condition, Eventable, ResOp, ResourceBase};
use crate::device::{ResourceRef, ResourceType, ThreadRef, Ticks};
use crate::sched::Runnable;
use crate::system::SystemState;

/// What the port's pins are wired as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortKind {
    #[default]
    Data,
    Clock,
    Ready,
}

/// Ready-signal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyMode {
    #[default]
    None,
    Strobed,
    Handshake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MasterSlave {
    #[default]
    Master,
    Slave,
}

/// Side effects of processing clock edges, applied by the caller once the
/// port borrow is released.
#[derive(Debug, Default)]
pub struct EdgeEffects {
    pub wake: SmallVec<[ThreadRef; 2]>,
    /// New pin value driven by the port.
    pub pins_changed: Option<u32>,
    pub ready_out_changed: Option<bool>,
    pub fire_event: bool,
    pub event_time: Ticks,
}

/// One port resource.
#[derive(Debug, Clone)]
pub struct Port {
    pub base: ResourceBase,
    pub eventable: Eventable,
    /// Port width in bits (1, 4, 8, 16 or 32).
    pub width: u32,
    pub kind: PortKind,
    /// Driving the pins (true) or sampling them (false).
    pub output: bool,
    pub buffered: bool,
    pub ready_mode: ReadyMode,
    pub master_slave: MasterSlave,
    pub transfer_width: u32,
    pub shift_reg: u32,
    /// Number of port-width slices the shift register holds.
    pub shift_reg_entries: u32,
    pub valid_shift_reg_entries: u32,
    /// Slices remaining until the next transfer completes.
    pub port_shift_count: u32,
    pub transfer_reg: u32,
    pub transfer_reg_valid: bool,
    /// Transfer register held for an event handler to read.
    pub hold_transfer_reg: bool,
    pub time_reg: u16,
    pub time_reg_valid: bool,
    pub timestamp_reg: u16,
    /// Free-running counter incremented on falling edges.
    pub port_counter: u16,
    pub condition: Condition,
    /// Comparison value for EQ/NEQ conditions.
    pub data: u32,
    /// Clock block driving this port (index into the core's clock blocks).
    pub clock: usize,
    /// Port whose ready-out drives our pins, for ready ports.
    pub ready_out_of: Option<usize>,
    /// Peer port receiving our pin values, if looped back.
    pub loopback: Option<usize>,
    /// Clock blocks sourced from this port's pins.
    pub source_of: SmallVec<[usize; 2]>,
    /// Clock blocks taking their ready-in from this port.
    pub ready_in_of: SmallVec<[usize; 2]>,
    /// Ports that output our ready-out value on their pins.
    pub ready_out_ports: SmallVec<[usize; 2]>,
    pub paused_in: Option<ThreadRef>,
    pub paused_out: Option<ThreadRef>,
    pub paused_sync: Option<ThreadRef>,
    pub ready_out: bool,
    /// Local time the port state is valid for.
    pub time: Ticks,
    /// Current value on the pins when sampling.
    pub pins_input_value: u32,
    /// Cursor into the driving clock's edge stream.
    pub next_edge: EdgeIterator,
}

impl Port {
    pub fn new(width: u32) -> Self {
        Port {
            base: ResourceBase::default(),
            eventable: Eventable::default(),
            width,
            kind: PortKind::Data,
            output: false,
            buffered: false,
            ready_mode: ReadyMode::None,
            master_slave: MasterSlave::Master,
            transfer_width: width,
            shift_reg: 0,
            shift_reg_entries: 1,
            valid_shift_reg_entries: 0,
            port_shift_count: 1,
            transfer_reg: 0,
            transfer_reg_valid: false,
            hold_transfer_reg: false,
            time_reg: 0,
            time_reg_valid: false,
            timestamp_reg: 0,
            port_counter: 0,
            condition: Condition::Full,
            data: 0,
            clock: 0,
            ready_out_of: None,
            loopback: None,
            source_of: SmallVec::new(),
            ready_in_of: SmallVec::new(),
            ready_out_ports: SmallVec::new(),
            paused_in: None,
            paused_out: None,
            paused_sync: None,
            ready_out: false,
            time: 0,
            pins_input_value: 0,
            next_edge: EdgeIterator::new(0, 2, 0),
        }
    }

    #[inline]
    pub fn width_mask(&self) -> u32 {
        if self.width == 32 {
            u32::MAX
        } else {
            (1 << self.width) - 1
        }
    }

    /// Pins value currently driven or sampled by a data port.
    pub fn data_pins_value(&self) -> u32 {
        if self.output {
            self.shift_reg & self.width_mask()
        } else {
            self.pins_input_value & self.width_mask()
        }
    }

    pub fn value_meets_condition(&self, value: u32) -> bool {
        match self.condition {
            Condition::Full => true,
            Condition::Eq => self.data == value,
            Condition::Neq => self.data != value,
            Condition::After => false,
        }
    }

    /// The shift register after one output shift; the top slice repeats so
    /// steady output keeps driving the last value.
    pub fn next_shift_reg_output(&self, old: u32) -> u32 {
        let repeat = old >> (self.transfer_width - self.width);
        (old >> self.width) | (repeat << (self.transfer_width - self.width))
    }

    pub fn is_valid_port_shift_count(&self, count: u32) -> bool {
        count >= self.width && count <= self.transfer_width && count % self.width == 0
    }

    #[inline]
    pub fn use_ready_in(&self) -> bool {
        self.ready_mode != ReadyMode::None && self.master_slave == MasterSlave::Slave
    }

    #[inline]
    pub fn use_ready_out(&self) -> bool {
        self.ready_mode != ReadyMode::None
    }

    /// Input data is ready to be collected and any condition is satisfied.
    pub fn time_and_condition_met(&self) -> bool {
        if !self.transfer_reg_valid || self.time_reg_valid {
            return false;
        }
        match self.condition {
            Condition::Full => true,
            _ => self.value_meets_condition(self.data_pins_value()),
        }
    }

    pub fn next_ready_out(&self) -> bool {
        if !self.use_ready_out() {
            return false;
        }
        if self.output {
            return self.valid_shift_reg_entries != 0;
        }
        if self.time_reg_valid {
            return self.port_counter == self.time_reg;
        }
        self.valid_shift_reg_entries != self.port_shift_count
    }

    /// An input should restart its fill because the condition machinery
    /// wants realignment to the incoming data.
    fn should_realign(&self, events_permitted: bool) -> bool {
        debug_assert!(!self.output);
        if !self.buffered {
            return false;
        }
        if self.paused_in.is_none() && !events_permitted {
            return false;
        }
        if self.hold_transfer_reg {
            return false;
        }
        if self.time_reg_valid {
            return !self.use_ready_out() && self.port_counter == self.time_reg;
        }
        self.condition != Condition::Full && self.value_meets_condition(self.data_pins_value())
    }

    /// Process one clock edge. `ready_in_high` is the sampled ready-in value
    /// (true when ready-in is unused). Side effects accumulate into `fx`.
    pub fn see_edge(
        &mut self,
        kind: EdgeKind,
        time: Ticks,
        ready_in_high: bool,
        events_permitted: bool,
        fx: &mut EdgeEffects,
    ) {
        debug_assert!(time >= self.time);
        self.time = time;
        if self.kind != PortKind::Data {
            return;
        }
        match kind {
            EdgeKind::Falling => self.see_falling_edge(time, ready_in_high, fx),
            EdgeKind::Rising => self.see_rising_edge(ready_in_high, events_permitted, fx),
        }
    }

    fn see_falling_edge(&mut self, time: Ticks, ready_in_high: bool, fx: &mut EdgeEffects) {
        self.port_counter = self.port_counter.wrapping_add(1);
        if self.output {
            if self.time_reg_valid && self.time_reg == self.port_counter {
                self.time_reg_valid = false;
                self.valid_shift_reg_entries = 0;
            }
            if ready_in_high {
                let mut next_shift_reg = self.shift_reg;
                let mut next_output = self.output;
                if self.valid_shift_reg_entries > 0 {
                    self.valid_shift_reg_entries -= 1;
                }
                if self.valid_shift_reg_entries != 0 {
                    next_shift_reg = self.next_shift_reg_output(self.shift_reg);
                }
                if self.valid_shift_reg_entries == 0 {
                    if !self.transfer_reg_valid {
                        if let Some(t) = self.paused_sync.take() {
                            fx.wake.push(t);
                        }
                    }
                    if self.transfer_reg_valid && !self.time_reg_valid {
                        self.valid_shift_reg_entries = self.port_shift_count;
                        self.port_shift_count = self.shift_reg_entries;
                        next_shift_reg = self.transfer_reg;
                        self.timestamp_reg = self.port_counter;
                        self.transfer_reg_valid = false;
                        if let Some(t) = self.paused_out.take() {
                            fx.wake.push(t);
                        }
                    } else if self.paused_in.is_some() {
                        // A read is pending: turn the port around.
                        next_output = false;
                        self.valid_shift_reg_entries = 0;
                    }
                }
                let mask = self.width_mask();
                let new_pins = if next_output { next_shift_reg } else { 0 };
                let pins_change = (self.shift_reg ^ new_pins) & mask != 0;
                self.shift_reg = next_shift_reg;
                self.output = next_output;
                if pins_change {
                    fx.pins_changed = Some(new_pins & mask);
                }
            }
        } else if self.use_ready_out() && self.time_reg_valid && self.port_counter == self.time_reg
        {
            self.time_reg_valid = false;
            self.valid_shift_reg_entries = 0;
        }
        self.update_ready_out(time, fx);
    }

    fn see_rising_edge(&mut self, ready_in_high: bool, events_permitted: bool, fx: &mut EdgeEffects) {
        if self.output {
            return;
        }
        if self.use_ready_out() && (!self.ready_out || self.time_reg_valid) {
            return;
        }
        if !ready_in_high {
            return;
        }
        let current = self.data_pins_value();
        self.shift_reg >>= self.width;
        self.shift_reg |= current << (self.transfer_width - self.width);
        self.valid_shift_reg_entries += 1;
        if self.should_realign(events_permitted) {
            self.valid_shift_reg_entries = self.shift_reg_entries;
            self.transfer_reg_valid = false;
            self.time_reg_valid = false;
        }
        if self.valid_shift_reg_entries == self.port_shift_count
            && (!self.use_ready_out()
                || !self.transfer_reg_valid
                || self.time_reg_valid
                || self.condition != Condition::Full)
        {
            self.valid_shift_reg_entries = 0;
            if !self.hold_transfer_reg {
                self.port_shift_count = self.shift_reg_entries;
                self.transfer_reg = self.shift_reg;
                self.timestamp_reg = self.port_counter;
                self.transfer_reg_valid = true;
                if self.time_and_condition_met() {
                    self.time_reg_valid = false;
                    if let Some(t) = self.paused_in.take() {
                        fx.wake.push(t);
                    }
                    if events_permitted {
                        fx.fire_event = true;
                        fx.event_time = self.time;
                    }
                    if self.buffered {
                        self.condition = Condition::Full;
                    }
                }
            }
        }
    }

    /// Fast-forward over `falling`/`rising` edges whose data cannot be
    /// observed, maintaining the counters only.
    pub fn skip_edges(&mut self, falling: u64, rising: u64) {
        self.port_counter = self.port_counter.wrapping_add(falling as u16);
        if self.output {
            if falling as u32 > self.valid_shift_reg_entries {
                self.valid_shift_reg_entries = 0;
            } else {
                self.valid_shift_reg_entries -= falling as u32;
            }
        } else {
            let mut rising = rising;
            if self.port_shift_count != self.shift_reg_entries {
                if self.valid_shift_reg_entries as u64 + rising < self.port_shift_count as u64 {
                    self.valid_shift_reg_entries += rising as u32;
                    return;
                }
                rising -= self.port_shift_count as u64;
                self.port_shift_count = self.shift_reg_entries;
            }
            self.valid_shift_reg_entries = ((self.valid_shift_reg_entries as u64 + rising)
                % self.shift_reg_entries as u64) as u32;
        }
    }

    fn update_ready_out(&mut self, _time: Ticks, fx: &mut EdgeEffects) {
        let new_value = self.next_ready_out();
        if new_value != self.ready_out {
            self.ready_out = new_value;
            fx.ready_out_changed = Some(new_value);
        }
    }

    pub fn clear_ready_out(&mut self, fx: &mut EdgeEffects) {
        if self.ready_out {
            self.ready_out = false;
            fx.ready_out_changed = Some(false);
        }
    }

    /// Reset the port state for `setc INUSE_ON`.
    pub fn reset_for_use(&mut self, time: Ticks) {
        self.data = 0;
        self.condition = Condition::Full;
        self.output = false;
        self.buffered = false;
        self.transfer_reg_valid = false;
        self.time_reg_valid = false;
        self.hold_transfer_reg = false;
        self.valid_shift_reg_entries = 0;
        self.timestamp_reg = 0;
        self.shift_reg = 0;
        self.shift_reg_entries = 1;
        self.port_shift_count = 1;
        self.port_counter = 0;
        self.ready_mode = ReadyMode::None;
        self.master_slave = MasterSlave::Master;
        self.kind = PortKind::Data;
        self.transfer_width = self.width;
        self.time = time;
        self.paused_in = None;
        self.paused_out = None;
        self.paused_sync = None;
    }
}

impl SystemState {
    /// Bring the port up to date with simulated time `new_time`.
    pub(crate) fn port_update(&mut self, res: ResourceRef, new_time: Ticks) {
        let slow = self.config.slow_ports;
        loop {
            let ready_in_value = {
                let p = self.port(res);
                if new_time <= p.time {
                    return;
                }
                let clk = &self.core(res.core).clock_blocks[p.clock];
                if !p.base.in_use
                    || p.kind != PortKind::Data
                    || !clk.is_fixed_frequency()
                    || !clk.running
                {
                    self.port_mut(res).time = new_time;
                    return;
                }
                clk.ready_in_value
            };
            let ready_in_high = {
                let p = self.port(res);
                !p.use_ready_in() || ready_in_value != 0
            };
            let events_permitted = self.events_permitted(res);
            let mut fx = EdgeEffects::default();
            let done = {
                let p = self.port_mut(res);
                if p.next_edge.time() > new_time {
                    p.time = new_time;
                    true
                } else if !slow && p.paused_in.is_none() && p.paused_out.is_none()
                    && p.paused_sync.is_none()
                    && !events_permitted
                    && !p.time_reg_valid
                    && p.ready_mode == ReadyMode::None
                    && p.source_of.is_empty()
                    && p.ready_in_of.is_empty()
                    && p.loopback.is_none()
                    && (!p.output || (p.valid_shift_reg_entries == 0 && !p.transfer_reg_valid))
                {
                    // Nothing observable can happen: skip edges in bulk.
                    let total = p.next_edge.edges_until(new_time);
                    let mut falling = 0;
                    let mut rising = 0;
                    let mut kind = p.next_edge.kind();
                    for _ in 0..total {
                        match kind {
                            EdgeKind::Rising => {
                                rising += 1;
                                kind = EdgeKind::Falling;
                            }
                            EdgeKind::Falling => {
                                falling += 1;
                                kind = EdgeKind::Rising;
                            }
                        }
                    }
                    p.skip_edges(falling, rising);
                    p.next_edge.advance_by(total);
                    p.time = new_time;
                    true
                } else {
                    let time = p.next_edge.time();
                    let kind = p.next_edge.kind();
                    p.see_edge(kind, time, ready_in_high, events_permitted, &mut fx);
                    p.next_edge.advance();
                    false
                }
            };
            self.port_apply_effects(res, fx);
            if done {
                return;
            }
        }
    }

    fn port_apply_effects(&mut self, res: ResourceRef, fx: EdgeEffects) {
        for t in &fx.wake {
            self.wake_thread(*t, self.port(res).time);
        }
        if let Some(pins) = fx.pins_changed {
            self.port_output_value(res, pins, self.port(res).time);
        }
        if let Some(value) = fx.ready_out_changed {
            self.port_handle_ready_out_change(res, value, self.port(res).time);
        }
        if fx.fire_event {
            self.fire_event(res, fx.event_time);
        }
    }

    /// Drive a value onto the pins: loopback peers and observers see it.
    pub(crate) fn port_output_value(&mut self, res: ResourceRef, value: u32, time: Ticks) {
        if let Some(peer) = self.port(res).loopback {
            let peer_res = ResourceRef { core: res.core, ty: ResourceType::Port, index: peer };
            self.port_see_pins_change(peer_res, value, time);
        }
        if self.port(res).output {
            self.port_handle_pins_change(res, value, time);
        }
    }

    /// The pins of this port changed; propagate to clocks sourced from it.
    fn port_handle_pins_change(&mut self, res: ResourceRef, value: u32, time: Ticks) {
        log::trace!(
            "port {}.{} pins <- {:#x} @ {}",
            res.core.core,
            res.index,
            value,
            time
        );
        let sources: SmallVec<[usize; 2]> = self.port(res).source_of.clone();
        for clk in sources {
            self.clock_set_value(res.core, clk, value, time);
        }
        let readies: SmallVec<[usize; 2]> = self.port(res).ready_in_of.clone();
        for clk in readies {
            self.clock_set_ready_in(res.core, clk, value, time);
        }
    }

    fn port_handle_ready_out_change(&mut self, res: ResourceRef, value: bool, time: Ticks) {
        let ports: SmallVec<[usize; 2]> = self.port(res).ready_out_ports.clone();
        for p in ports {
            let pres = ResourceRef { core: res.core, ty: ResourceType::Port, index: p };
            self.port_output_value(pres, value as u32, time);
        }
    }

    /// An input port sees new pin values (driven by a loopback peer or an
    /// external stimulus).
    pub(crate) fn port_see_pins_change(&mut self, res: ResourceRef, value: u32, time: Ticks) {
        self.port_update(res, time);
        let p = self.port_mut(res);
        p.pins_input_value = value;
        if !p.base.in_use || p.output {
            return;
        }
        self.port_handle_pins_change(res, value, time);
        self.port_schedule_update_if_needed(res);
    }

    /// Scheduler callback.
    pub(crate) fn port_run(&mut self, res: ResourceRef, time: Ticks) {
        if !self.port(res).base.in_use {
            return;
        }
        self.port_update(res, time);
        self.port_schedule_update_if_needed(res);
    }

    /// Work out the next edge at which something observable can happen and
    /// schedule the port for then. Conservative: scheduling too early only
    /// costs a wasted wakeup.
    pub(crate) fn port_schedule_update_if_needed(&mut self, res: ResourceRef) {
        let when = {
            let p = self.port(res);
            if !p.base.in_use || p.kind != PortKind::Data {
                return;
            }
            let clk = &self.core(res.core).clock_blocks[p.clock];
            if !clk.is_fixed_frequency() || !clk.running {
                return;
            }
            if self.config.slow_ports {
                // Oracle mode: take every edge while anything can be
                // observed. Unwatched inputs catch up lazily instead, as in
                // the fast path.
                let observed = p.paused_in.is_some()
                    || p.paused_out.is_some()
                    || p.paused_sync.is_some()
                    || self.events_permitted(res)
                    || p.time_reg_valid
                    || p.use_ready_out()
                    || (p.output && (p.valid_shift_reg_entries != 0 || p.transfer_reg_valid));
                if observed {
                    Some(p.next_edge.time())
                } else {
                    None
                }
            } else if p.output {
                self.port_next_update_output(p)
            } else {
                self.port_next_update_input(res, p)
            }
        };
        if let Some(time) = when {
            self.schedule(Runnable::Port { core: res.core, index: res.index }, time);
        }
    }

    fn port_next_update_output(&self, p: &Port) -> Option<Ticks> {
        // Anything pending on the output side resolves on a falling edge.
        if p.paused_sync.is_some()
            || p.paused_out.is_some()
            || p.paused_in.is_some()
            || p.valid_shift_reg_entries != 0
            || p.transfer_reg_valid
            || p.time_reg_valid
            || p.use_ready_out()
        {
            let n = match p.next_edge.kind() {
                EdgeKind::Falling => 0,
                EdgeKind::Rising => 1,
            };
            return Some(p.next_edge.peek_time(n));
        }
        // Observers (loopback peers, sourced clocks) only matter while the
        // shift register is moving, which the pending checks above cover.
        None
    }

    fn port_next_update_input(&self, res: ResourceRef, p: &Port) -> Option<Ticks> {
        if p.time_reg_valid {
            // The port counter advances on falling edges; step edge by edge
            // from here.
            return Some(p.next_edge.time());
        }
        if p.paused_out.is_some() {
            return Some(p.next_edge.time());
        }
        if p.paused_in.is_some() || self.events_permitted(res) || (p.use_ready_out() && p.ready_out)
        {
            if p.value_meets_condition(p.data_pins_value()) || p.condition == Condition::Full {
                let n = match p.next_edge.kind() {
                    EdgeKind::Rising => 0,
                    EdgeKind::Falling => 1,
                };
                return Some(p.next_edge.peek_time(n));
            }
            // Condition not currently met: the pins can only change through
            // seePinsChange, which will reschedule us.
            return None;
        }
        None
    }

    // -- thread-facing operations ----------------------------------------

    /// `in`: read the transfer register.
    pub(crate) fn port_in(
        &mut self,
        thread: ThreadRef,
        res: ResourceRef,
        time: Ticks,
    ) -> ResOp<u32> {
        self.port_update(res, time);
        let p = self.port_mut(res);
        if p.kind != PortKind::Data {
            return ResOp::Done(0);
        }
        if !p.output && p.time_and_condition_met() {
            let value = p.transfer_reg;
            if p.valid_shift_reg_entries == p.port_shift_count {
                p.port_shift_count = p.shift_reg_entries;
                p.transfer_reg = p.shift_reg;
                p.valid_shift_reg_entries = 0;
                p.timestamp_reg = p.port_counter;
            } else {
                p.transfer_reg_valid = false;
            }
            p.hold_transfer_reg = false;
            return ResOp::Done(value);
        }
        p.paused_in = Some(thread);
        self.thread_mut(thread).paused_on = Some(res);
        self.port_schedule_update_if_needed(res);
        ResOp::Descheduled
    }

    /// `inpw`: read part of a word; `width` must divide into port widths.
    pub(crate) fn port_inpw(
        &mut self,
        thread: ThreadRef,
        res: ResourceRef,
        width: u32,
        time: Ticks,
    ) -> ResOp<u32> {
        self.port_update(res, time);
        {
            let p = self.port(res);
            if !p.buffered || !p.is_valid_port_shift_count(width) {
                return ResOp::Illegal;
            }
            if p.kind != PortKind::Data {
                return ResOp::Done(0);
            }
        }
        let p = self.port_mut(res);
        if !p.output && p.time_and_condition_met() {
            let value = p.transfer_reg;
            if p.valid_shift_reg_entries == p.port_shift_count {
                p.port_shift_count = p.shift_reg_entries;
                p.transfer_reg = p.shift_reg;
                p.timestamp_reg = p.port_counter;
            } else {
                p.transfer_reg_valid = false;
            }
            p.hold_transfer_reg = false;
            return ResOp::Done(value);
        }
        let shift_count = width / p.width;
        p.port_shift_count = shift_count;
        p.paused_in = Some(thread);
        self.thread_mut(thread).paused_on = Some(res);
        self.port_schedule_update_if_needed(res);
        ResOp::Descheduled
    }

    /// `out`: write the transfer register, turning the port around to
    /// output if needed.
    pub(crate) fn port_out(
        &mut self,
        thread: ThreadRef,
        res: ResourceRef,
        value: u32,
        time: Ticks,
    ) -> ResOp<()> {
        self.port_update(res, time);
        let p = self.port_mut(res);
        if p.kind != PortKind::Data {
            return ResOp::Done(());
        }
        if p.output {
            if p.transfer_reg_valid {
                p.paused_out = Some(thread);
                self.thread_mut(thread).paused_on = Some(res);
                self.port_schedule_update_if_needed(res);
                return ResOp::Descheduled;
            }
        } else {
            p.valid_shift_reg_entries = 1;
        }
        p.transfer_reg_valid = true;
        p.transfer_reg = value;
        p.output = true;
        self.port_schedule_update_if_needed(res);
        ResOp::Done(())
    }

    /// `outpw`: write `width` bits of a word.
    pub(crate) fn port_outpw(
        &mut self,
        thread: ThreadRef,
        res: ResourceRef,
        value: u32,
        width: u32,
        time: Ticks,
    ) -> ResOp<()> {
        self.port_update(res, time);
        {
            let p = self.port(res);
            if !p.buffered || !p.is_valid_port_shift_count(width) {
                return ResOp::Illegal;
            }
            if p.kind != PortKind::Data {
                return ResOp::Done(());
            }
        }
        let p = self.port_mut(res);
        if p.output {
            if p.transfer_reg_valid {
                p.paused_out = Some(thread);
                self.thread_mut(thread).paused_on = Some(res);
                self.port_schedule_update_if_needed(res);
                return ResOp::Descheduled;
            }
        } else {
            p.valid_shift_reg_entries = 1;
        }
        p.transfer_reg_valid = true;
        p.port_shift_count = width / p.width;
        p.transfer_reg = value;
        p.output = true;
        self.port_schedule_update_if_needed(res);
        ResOp::Done(())
    }

    /// `setpsc`: set the shift count for the next transfer.
    pub(crate) fn port_setpsc(&mut self, res: ResourceRef, width: u32, time: Ticks) -> ResOp<()> {
        self.port_update(res, time);
        let p = self.port_mut(res);
        if !p.buffered || !p.is_valid_port_shift_count(width) {
            return ResOp::Illegal;
        }
        if p.kind != PortKind::Data {
            return ResOp::Done(());
        }
        p.port_shift_count = width / p.width;
        self.port_schedule_update_if_needed(res);
        ResOp::Done(())
    }

    /// `endin`: terminate the current input and report buffered bits.
    pub(crate) fn port_endin(&mut self, res: ResourceRef, time: Ticks) -> ResOp<u32> {
        self.port_update(res, time);
        let p = self.port_mut(res);
        if p.output || !p.buffered {
            return ResOp::Illegal;
        }
        if p.kind != PortKind::Data {
            return ResOp::Done(0);
        }
        let mut entries = p.valid_shift_reg_entries;
        if p.transfer_reg_valid {
            entries += p.shift_reg_entries;
            if p.valid_shift_reg_entries != 0 {
                p.port_shift_count = p.valid_shift_reg_entries;
            }
        } else if p.valid_shift_reg_entries != 0 {
            p.valid_shift_reg_entries = 0;
            p.port_shift_count = p.shift_reg_entries;
            p.transfer_reg = p.shift_reg;
            p.timestamp_reg = p.port_counter;
            p.transfer_reg_valid = true;
        }
        let value = entries * p.width;
        self.port_schedule_update_if_needed(res);
        ResOp::Done(value)
    }

    /// `syncr`: wait until all buffered output has reached the pins.
    pub(crate) fn port_sync(&mut self, thread: ThreadRef, res: ResourceRef, time: Ticks) -> ResOp<()> {
        self.port_update(res, time);
        let p = self.port_mut(res);
        if p.kind != PortKind::Data || !p.output {
            return ResOp::Done(());
        }
        if p.valid_shift_reg_entries == 0 && !p.transfer_reg_valid {
            return ResOp::Done(());
        }
        p.paused_sync = Some(thread);
        self.thread_mut(thread).paused_on = Some(res);
        self.port_schedule_update_if_needed(res);
        ResOp::Descheduled
    }

    /// `peek`: sample the pins without affecting the port.
    pub(crate) fn port_peek(&mut self, res: ResourceRef, time: Ticks) -> u32 {
        self.port_update(res, time);
        self.port(res).data_pins_value()
    }

    /// `getts`: read the timestamp register.
    pub(crate) fn port_get_timestamp(&mut self, res: ResourceRef, time: Ticks) -> u32 {
        self.port_update(res, time);
        self.port(res).timestamp_reg as u32
    }

    /// `setpt`: arm the port time register.
    pub(crate) fn port_set_port_time(
        &mut self,
        thread: ThreadRef,
        res: ResourceRef,
        value: u32,
        time: Ticks,
    ) -> ResOp<()> {
        self.port_update(res, time);
        let p = self.port_mut(res);
        if p.kind != PortKind::Data {
            return ResOp::Done(());
        }
        if p.output && p.transfer_reg_valid {
            p.paused_out = Some(thread);
            self.thread_mut(thread).paused_on = Some(res);
            self.port_schedule_update_if_needed(res);
            return ResOp::Descheduled;
        }
        p.time_reg = value as u16;
        p.time_reg_valid = true;
        self.port_schedule_update_if_needed(res);
        ResOp::Done(())
    }

    /// `clrpt`: disarm the port time register.
    pub(crate) fn port_clear_port_time(&mut self, res: ResourceRef, time: Ticks) {
        self.port_update(res, time);
        self.port_mut(res).time_reg_valid = false;
    }

    /// `setc RUN_CLRBUF`.
    pub(crate) fn port_clear_buf(&mut self, res: ResourceRef, time: Ticks) {
        self.port_update(res, time);
        let mut fx = EdgeEffects::default();
        {
            let p = self.port_mut(res);
            p.transfer_reg_valid = false;
            p.hold_transfer_reg = false;
            p.valid_shift_reg_entries = 0;
            p.clear_ready_out(&mut fx);
        }
        self.port_apply_effects(res, fx);
    }

    pub(crate) fn port_set_condition(
        &mut self,
        res: ResourceRef,
        cond: Condition,
        time: Ticks,
    ) -> bool {
        self.port_update(res, time);
        if cond == Condition::After {
            return false;
        }
        self.port_mut(res).condition = cond;
        self.port_schedule_update_if_needed(res);
        true
    }

    pub(crate) fn port_set_data(&mut self, res: ResourceRef, value: u32, time: Ticks) {
        self.port_update(res, time);
        let p = self.port_mut(res);
        p.data = value & p.width_mask();
        self.port_schedule_update_if_needed(res);
    }

    /// `setclk`: attach the port to a different clock block.
    pub(crate) fn port_set_clock(&mut self, res: ResourceRef, clk: usize, time: Ticks) -> bool {
        if clk >= self.core(res.core).clock_blocks.len() {
            return false;
        }
        self.port_update(res, time);
        let old = self.port(res).clock;
        self.core_mut(res.core).clock_blocks[old].detach_port(res.index);
        self.core_mut(res.core).clock_blocks[clk].attach_port(res.index);
        let p = self.port_mut(res);
        p.clock = clk;
        p.port_counter = 0;
        self.port_see_clock_change(res, time);
        true
    }

    /// `setrdy`: drive this 1-bit port from another port's ready-out.
    pub(crate) fn port_set_ready(&mut self, res: ResourceRef, source: usize, time: Ticks) -> bool {
        self.port_update(res, time);
        if self.port(res).width != 1 {
            return false;
        }
        if let Some(old) = self.port(res).ready_out_of {
            let old_res = ResourceRef { core: res.core, ty: ResourceType::Port, index: old };
            self.port_mut(old_res).ready_out_ports.retain(|p| *p != res.index);
        }
        let src_res = ResourceRef { core: res.core, ty: ResourceType::Port, index: source };
        self.port_mut(src_res).ready_out_ports.push(res.index);
        self.port_mut(res).ready_out_of = Some(source);
        let value = self.port(src_res).ready_out;
        self.port_output_value(res, value as u32, time);
        true
    }

    pub(crate) fn port_set_buffered(&mut self, res: ResourceRef, value: bool, time: Ticks) -> bool {
        self.port_update(res, time);
        let p = self.port_mut(res);
        if !value && (p.transfer_width != p.width || p.ready_mode != ReadyMode::None) {
            return false;
        }
        p.buffered = value;
        true
    }

    pub(crate) fn port_set_ready_mode(
        &mut self,
        res: ResourceRef,
        mode: ReadyMode,
        time: Ticks,
    ) -> bool {
        self.port_update(res, time);
        let p = self.port_mut(res);
        if mode != ReadyMode::None && !p.buffered {
            return false;
        }
        p.ready_mode = mode;
        self.port_schedule_update_if_needed(res);
        true
    }

    pub(crate) fn port_set_master_slave(
        &mut self,
        res: ResourceRef,
        value: MasterSlave,
        time: Ticks,
    ) -> bool {
        self.port_update(res, time);
        self.port_mut(res).master_slave = value;
        self.port_schedule_update_if_needed(res);
        true
    }

    pub(crate) fn port_set_port_type(&mut self, res: ResourceRef, kind: PortKind, time: Ticks) -> bool {
        self.port_update(res, time);
        let changed = {
            let p = self.port_mut(res);
            if p.kind == kind {
                false
            } else {
                p.kind = kind;
                if kind == PortKind::Data {
                    p.output = true;
                }
                true
            }
        };
        if changed {
            let value = self.port(res).data_pins_value();
            self.port_output_value(res, value, time);
            self.port_schedule_update_if_needed(res);
        }
        true
    }

    pub(crate) fn port_set_transfer_width(&mut self, res: ResourceRef, value: u32, time: Ticks) -> bool {
        self.port_update(res, time);
        let p = self.port_mut(res);
        if value < p.width || (value != p.width && value != 8 && value != 32) {
            return false;
        }
        p.transfer_width = value;
        p.shift_reg_entries = value / p.width;
        p.port_shift_count = p.shift_reg_entries;
        true
    }

    /// `setc INUSE_ON`/`INUSE_OFF` for ports.
    pub(crate) fn port_set_in_use(&mut self, thread: ThreadRef, res: ResourceRef, value: bool, time: Ticks) {
        if value {
            let clk = self.port(res).clock;
            let clock = self.core(res.core).clock_blocks[clk].clone();
            let p = self.port_mut(res);
            p.reset_for_use(time);
            if clock.is_fixed_frequency() && clock.running {
                p.next_edge = clock.edge_iterator(time);
            }
            p.base.set_in_use_on(thread);
            let mut fx = EdgeEffects::default();
            self.port_mut(res).clear_ready_out(&mut fx);
            self.port_apply_effects(res, fx);
        } else {
            self.eventable_disable(res);
            let p = self.port_mut(res);
            p.base.set_in_use_off();
            p.eventable.reset();
        }
    }

    /// The driving clock started or changed: re-anchor the edge cursor.
    pub(crate) fn port_see_clock_change(&mut self, res: ResourceRef, time: Ticks) {
        let p = self.port(res);
        if !p.base.in_use {
            return;
        }
        let clk = self.core(res.core).clock_blocks[p.clock].clone();
        if p.kind == PortKind::Data && clk.is_fixed_frequency() && clk.running {
            self.port_mut(res).next_edge = clk.edge_iterator(time);
        }
        self.port_schedule_update_if_needed(res);
    }

    pub(crate) fn port_see_clock_start(&mut self, res: ResourceRef, time: Ticks) {
        if !self.port(res).base.in_use {
            return;
        }
        self.port_mut(res).port_counter = 0;
        self.port_see_clock_change(res, time);
    }

    /// Called when events are enabled on the owning thread.
    pub(crate) fn port_see_event_enable(&mut self, res: ResourceRef, time: Ticks) -> bool {
        self.port_update(res, time);
        if self.port(res).time_and_condition_met() {
            self.fire_event(res, time);
            return true;
        }
        self.port_schedule_update_if_needed(res);
        false
    }

    // -- clock plumbing ---------------------------------------------------

    /// A clock block sourced from a port sees a new pin value. Edges of the
    /// source value are forwarded to the attached ports directly.
    pub(crate) fn clock_set_value(&mut self, core: crate::device::CoreRef, clk: usize, value: u32, time: Ticks) {
        let (old, ports): (u32, Vec<usize>) = {
            let c = &self.core(core).clock_blocks[clk];
            (c.value, c.attached_ports.clone())
        };
        let edge = if old == 0 && value != 0 {
            Some(EdgeKind::Rising)
        } else if old != 0 && value == 0 {
            Some(EdgeKind::Falling)
        } else {
            None
        };
        self.core_mut(core).clock_blocks[clk].value = value;
        if let Some(kind) = edge {
            for port in ports {
                let res = ResourceRef { core, ty: ResourceType::Port, index: port };
                let events_permitted = self.events_permitted(res);
                let mut fx = EdgeEffects::default();
                self.port_mut(res).see_edge(kind, time, true, events_permitted, &mut fx);
                self.port_apply_effects(res, fx);
            }
        }
    }

    pub(crate) fn clock_set_ready_in(&mut self, core: crate::device::CoreRef, clk: usize, value: u32, time: Ticks) {
        self.core_mut(core).clock_blocks[clk].ready_in_value = value;
        let ports = self.core(core).clock_blocks[clk].attached_ports.clone();
        for port in ports {
            let res = ResourceRef { core, ty: ResourceType::Port, index: port };
            self.port_update(res, time);
            self.port_schedule_update_if_needed(res);
        }
    }

    /// `setc RUN_STARTR` on a clock block.
    pub(crate) fn clock_start(&mut self, core: crate::device::CoreRef, clk: usize, time: Ticks) {
        self.core_mut(core).clock_blocks[clk].start(time);
        let ports = self.core(core).clock_blocks[clk].attached_ports.clone();
        for port in ports {
            let res = ResourceRef { core, ty: ResourceType::Port, index: port };
            self.port_see_clock_start(res, time);
        }
    }

    /// `setc RUN_STOPR` on a clock block.
    pub(crate) fn clock_stop(&mut self, core: crate::device::CoreRef, clk: usize, time: Ticks) {
        let ports = self.core(core).clock_blocks[clk].attached_ports.clone();
        for port in ports.iter() {
            let res = ResourceRef { core, ty: ResourceType::Port, index: *port };
            self.port_update(res, time);
        }
        self.core_mut(core).clock_blocks[clk].stop();
    }

    /// `setd` on a clock block sets the divide.
    pub(crate) fn clock_set_divide(&mut self, core: crate::device::CoreRef, clk: usize, value: u32, time: Ticks) {
        let ports = self.core(core).clock_blocks[clk].attached_ports.clone();
        for port in ports.iter() {
            let res = ResourceRef { core, ty: ResourceType::Port, index: *port };
            self.port_update(res, time);
        }
        let c = &mut self.core_mut(core).clock_blocks[clk];
        c.divide = value;
        c.start_time = time;
        for port in ports {
            let res = ResourceRef { core, ty: ResourceType::Port, index: port };
            self.port_see_clock_change(res, time);
        }
    }

    /// `setclk` on a clock block selects its source.
    pub(crate) fn clock_set_source(
        &mut self,
        core: crate::device::CoreRef,
        clk: usize,
        value: u32,
        time: Ticks,
    ) -> bool {
        use crate::device::clock::CLK_REF;
        let source = if value == CLK_REF {
            ClockSource::Reference
        } else {
            let id = crate::device::ResourceId(value);
            match self.core(core).port_index(id) {
                Some(index) => {
                    self.port_mut(ResourceRef { core, ty: ResourceType::Port, index })
                        .source_of
                        .push(clk);
                    ClockSource::Port(index)
                }
                None => return false,
            }
        };
        let c = &mut self.core_mut(core).clock_blocks[clk];
        c.source = source;
        c.start_time = time;
        let ports = self.core(core).clock_blocks[clk].attached_ports.clone();
        for port in ports {
            let res = ResourceRef { core, ty: ResourceType::Port, index: port };
            self.port_see_clock_change(res, time);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_port(width: u32) -> Port {
        let mut p = Port::new(width);
        p.reset_for_use(0);
        p.base.in_use = true;
        p.output = true;
        p
    }

    #[test]
    fn test_width_mask() {
        assert_eq!(Port::new(1).width_mask(), 0x1);
        assert_eq!(Port::new(8).width_mask(), 0xFF);
        assert_eq!(Port::new(32).width_mask(), u32::MAX);
    }

    #[test]
    fn test_output_shift_sequence() {
        // A 1-bit port with an 8-bit transfer shifts the word out LSB first,
        // one bit per falling edge.
        let mut p = output_port(1);
        p.transfer_width = 8;
        p.shift_reg_entries = 8;
        p.port_shift_count = 8;
        p.transfer_reg = 0b10101010;
        p.transfer_reg_valid = true;

        let mut seen = Vec::new();
        let mut time = 0;
        for k in 0..9 {
            let mut fx = EdgeEffects::default();
            time += 2;
            p.see_edge(EdgeKind::Falling, time, true, false, &mut fx);
            if k == 0 {
                // First falling edge loads the transfer register.
                assert!(!p.transfer_reg_valid);
            }
            seen.push(p.data_pins_value());
        }
        // After the load the pins show bit 0, then bit 1, ...
        assert_eq!(&seen[..8], &[0, 1, 0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn test_input_fills_transfer_register() {
        let mut p = Port::new(1);
        p.reset_for_use(0);
        p.base.in_use = true;
        p.buffered = true;
        p.transfer_width = 4;
        p.shift_reg_entries = 4;
        p.port_shift_count = 4;
        p.paused_in = Some(ThreadRef {
            core: crate::device::CoreRef { node: 0, core: 0 },
            index: 0,
        });

        let bits = [1u32, 0, 1, 1];
        let mut time = 0;
        let mut fx = EdgeEffects::default();
        for b in bits {
            p.pins_input_value = b;
            time += 2;
            p.see_edge(EdgeKind::Rising, time, true, false, &mut fx);
            time += 2;
            p.see_edge(EdgeKind::Falling, time, true, false, &mut fx);
        }
        assert!(p.transfer_reg_valid);
        // LSB arrived first.
        assert_eq!(p.transfer_reg, 0b1101);
        assert_eq!(fx.wake.len(), 1);
    }

    #[test]
    fn test_skip_edges_counter() {
        let mut p = output_port(1);
        p.valid_shift_reg_entries = 3;
        p.skip_edges(5, 5);
        assert_eq!(p.port_counter, 5);
        assert_eq!(p.valid_shift_reg_entries, 0);
    }

    #[test]
    fn test_ready_out_output_port() {
        let mut p = output_port(1);
        p.ready_mode = ReadyMode::Strobed;
        p.valid_shift_reg_entries = 1;
        assert!(p.next_ready_out());
        p.valid_shift_reg_entries = 0;
        assert!(!p.next_ready_out());
    }

    #[test]
    fn test_loopback_streams_bits_between_ports() {
        use crate::config::SimConfig;
        use crate::device::{ResourceId, ResourceType, ThreadRef};
        use crate::system::SystemState;

        for slow in [false, true] {
            let config = SimConfig { slow_ports: slow, ..SimConfig::default() };
            let (mut sys, core) = SystemState::single_core(config);
            let t0 = ThreadRef { core, index: 0 };
            sys.thread_mut(t0).alloc(0);

            let out_id = ResourceId::new(ResourceType::Port, 0, 1);
            let in_id = ResourceId::new(ResourceType::Port, 1, 1);
            assert!(sys.set_loopback(core, out_id, in_id));
            let out_res = sys.port_ref_by_id(core, out_id).unwrap();
            let in_res = sys.port_ref_by_id(core, in_id).unwrap();

            sys.port_set_in_use(t0, out_res, true, 0);
            assert!(sys.port_set_buffered(out_res, true, 0));
            assert!(sys.port_set_transfer_width(out_res, 8, 0));

            // Enable the input between the first output shift and the first
            // sample so the streams line up.
            sys.port_set_in_use(t0, in_res, true, 3);
            assert!(sys.port_set_buffered(in_res, true, 3));
            assert!(sys.port_set_transfer_width(in_res, 8, 3));

            assert_eq!(sys.port_out(t0, out_res, 0xAA, 0), crate::device::ResOp::Done(()));
            // Drain the scheduled port updates.
            assert_eq!(sys.run(), crate::system::StopReason::NoRunnableThreads);

            // Eight rising edges later the input holds the same byte.
            match sys.port_in(t0, in_res, 40) {
                crate::device::ResOp::Done(v) => {
                    assert_eq!(v, 0xAA, "slow_ports={}", slow)
                }
                other => panic!("input not ready: {:?} (slow_ports={})", other, slow),
            }
        }
    }

    #[test]
    fn test_output_pin_sequence_over_edges() {
        use crate::config::SimConfig;
        use crate::device::{ResourceId, ResourceType, ThreadRef};
        use crate::system::SystemState;

        // Property: with transfer width w and port width p, after w/p
        // falling edges the pins have carried the word LSB-slice first.
        let (mut sys, core) = SystemState::single_core(SimConfig::default());
        let t0 = ThreadRef { core, index: 0 };
        sys.thread_mut(t0).alloc(0);
        let id = ResourceId::new(ResourceType::Port, 0, 4);
        let res = sys.port_ref_by_id(core, id).unwrap();
        sys.port_set_in_use(t0, res, true, 0);
        assert!(sys.port_set_buffered(res, true, 0));
        assert!(sys.port_set_transfer_width(res, 8, 0));
        assert_eq!(sys.port_out(t0, res, 0x5C, 0), crate::device::ResOp::Done(()));

        let mut seen = Vec::new();
        // Falling edges land at t = 4, 8: sample the pins after each.
        for t in [5u64, 9] {
            sys.port_update(res, t);
            seen.push(sys.port(res).data_pins_value());
        }
        assert_eq!(seen, vec![0xC, 0x5]);
    }

    #[test]
    fn test_condition_eq() {
        let mut p = Port::new(4);
        p.reset_for_use(0);
        p.condition = Condition::Eq;
        p.data = 0x5;
        assert!(p.value_meets_condition(0x5));
        assert!(!p.value_meets_condition(0x4));
    }
}
