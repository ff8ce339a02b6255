//! Channel ends.
//!
//! A channel end sends packets to a destination resource ID and receives
//! tokens into a bounded buffer. A packet is an implicit route claim followed
//! by data/control tokens; `END` closes the route (handing it to the oldest
//! queued claimant), `PAUSE` releases it without ending the transaction.
//!
//! Outgoing tokens carry a modelled arrival time: each hop of the route
//! contributes a per-token delay, and the first token of a packet pays a
//! header surcharge (see [`TokenDelay`]).

use std::collections::VecDeque;

use crate::device::resource::{Eventable, ResOp, ResourceBase, ResourceType};
use crate::device::token::{control, Token, TokenBuffer};
use crate::device::xs1_spec::CHANEND_BUFFER_SIZE;
use crate::device::{EndpointRef, ResourceRef, ThreadRef, Ticks};
use crate::system::{ClaimResult, SystemState};

/// Whether the route header has been accounted for in the delay model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderSent {
    /// Nothing sent yet this packet; the next token pays the header cost.
    #[default]
    No,
    /// Local route: no header cost.
    Local,
    Yes,
}

/// Cut-through timing model for an open route.
///
/// `delay` is the total route latency, `trate` the per-token delay of the
/// slowest hop, `rrec` the time the remote end will have received everything
/// sent so far.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenDelay {
    pub delay: u64,
    pub trate: u64,
    pub hops: u32,
    pub rrec: Ticks,
    pub header: HeaderSent,
}

impl TokenDelay {
    pub fn local() -> Self {
        TokenDelay { header: HeaderSent::Local, ..TokenDelay::default() }
    }

    /// Account for `n_tokens` leaving at `time`; afterwards `rrec` is the
    /// remote arrival time of the last of them.
    pub fn advance(&mut self, time: Ticks, n_tokens: u32) {
        let n = n_tokens as u64;
        let rtime = time + self.delay + (n - 1) * self.trate;
        if rtime <= self.rrec {
            self.rrec += n * self.trate;
        } else {
            self.rrec = rtime;
        }
        match self.header {
            HeaderSent::No => {
                let per_hop = if self.hops > 2 { 16 } else { 8 };
                self.rrec += 3 * self.trate + per_hop * self.hops as u64;
                self.header = HeaderSent::Yes;
            }
            HeaderSent::Local => self.header = HeaderSent::Yes,
            HeaderSent::Yes => {}
        }
    }
}

/// One channel end resource.
#[derive(Debug, Clone)]
pub struct Chanend {
    pub base: ResourceBase,
    pub eventable: Eventable,
    /// Input token buffer.
    pub buf: TokenBuffer,
    /// Destination resource ID, set with `setd`.
    pub dest_id: u32,
    /// Destination endpoint while a packet is open.
    pub dest: Option<EndpointRef>,
    pub in_packet: bool,
    pub junk_packet: bool,
    /// Junk anything routed at us while not in use.
    pub junk_incoming: bool,
    /// The endpoint currently holding the route to us.
    pub source: Option<EndpointRef>,
    /// Endpoints waiting for the route to us to become free.
    pub claim_queue: VecDeque<EndpointRef>,
    pub paused_in: Option<ThreadRef>,
    /// Whether the paused input wants a whole word rather than one token.
    pub wait_for_word: bool,
    pub paused_out: Option<ThreadRef>,
    pub delay: TokenDelay,
}

impl Default for Chanend {
    fn default() -> Self {
        Chanend {
            base: ResourceBase::default(),
            eventable: Eventable::default(),
            buf: TokenBuffer::new(CHANEND_BUFFER_SIZE),
            dest_id: 0,
            dest: None,
            in_packet: false,
            junk_packet: false,
            junk_incoming: true,
            source: None,
            claim_queue: VecDeque::new(),
            paused_in: None,
            wait_for_word: false,
            paused_out: None,
            delay: TokenDelay::default(),
        }
    }
}

impl Chanend {
    pub fn alloc(&mut self, owner: ThreadRef) {
        debug_assert!(!self.base.in_use, "allocating in-use chanend");
        self.buf.clear();
        self.dest_id = 0;
        self.dest = None;
        self.in_packet = false;
        self.junk_packet = false;
        self.junk_incoming = false;
        self.paused_in = None;
        self.paused_out = None;
        self.eventable.reset();
        self.base.set_in_use_on(owner);
    }

    pub fn free(&mut self) {
        self.base.set_in_use_off();
        self.junk_incoming = true;
        self.paused_in = None;
        self.paused_out = None;
    }

    #[inline]
    pub fn can_accept_token(&self) -> bool {
        !self.buf.is_full()
    }

    #[inline]
    pub fn can_accept_tokens(&self, tokens: usize) -> bool {
        self.buf.remaining() >= tokens
    }
}

impl SystemState {
    /// Open a route for an outgoing packet, claiming the destination.
    /// Returns false if the claim was deferred; the thread should deschedule
    /// and will be notified when the route becomes available.
    fn chanend_open_route(&mut self, res: ResourceRef, _time: Ticks) -> bool {
        if self.chanend(res).in_packet {
            return true;
        }
        let dest_id = self.chanend(res).dest_id;
        let this = EndpointRef::Chanend(res.core, res.index);
        match self.chanend_route(res.core, dest_id) {
            None => {
                // No such destination: the packet is junked.
                self.chanend_mut(res).delay = TokenDelay::local();
                self.chanend_mut(res).junk_packet = true;
            }
            Some((ep, delay)) => {
                self.chanend_mut(res).delay = delay;
                match self.endpoint_claim(ep, this) {
                    ClaimResult::Claimed(actual) => {
                        let ce = self.chanend_mut(res);
                        ce.dest = Some(actual);
                    }
                    ClaimResult::Junk(actual) => {
                        let ce = self.chanend_mut(res);
                        ce.dest = Some(actual);
                        ce.junk_packet = true;
                    }
                    ClaimResult::Deferred => return false,
                }
            }
        }
        self.chanend_mut(res).in_packet = true;
        true
    }

    /// `outt`: send one data token.
    pub(crate) fn chanend_out_token(
        &mut self,
        thread: ThreadRef,
        res: ResourceRef,
        value: u8,
        time: Ticks,
    ) -> ResOp<()> {
        if !self.chanend_open_route(res, time) {
            return self.chanend_pause_out(thread, res);
        }
        if self.chanend(res).junk_packet {
            return ResOp::Done(());
        }
        let dest = self.chanend(res).dest.expect("open packet with no destination");
        if !self.endpoint_can_accept_tokens(dest, 1) {
            return self.chanend_pause_out(thread, res);
        }
        let receive_time = {
            let ce = self.chanend_mut(res);
            ce.delay.advance(time, 1);
            ce.delay.rrec
        };
        self.endpoint_receive_data_token(dest, receive_time, value);
        ResOp::Done(())
    }

    /// `out`: send one word as four data tokens, big-endian.
    pub(crate) fn chanend_out_word(
        &mut self,
        thread: ThreadRef,
        res: ResourceRef,
        value: u32,
        time: Ticks,
    ) -> ResOp<()> {
        if !self.chanend_open_route(res, time) {
            return self.chanend_pause_out(thread, res);
        }
        if self.chanend(res).junk_packet {
            return ResOp::Done(());
        }
        let dest = self.chanend(res).dest.expect("open packet with no destination");
        if !self.endpoint_can_accept_tokens(dest, 4) {
            return self.chanend_pause_out(thread, res);
        }
        let receive_time = {
            let ce = self.chanend_mut(res);
            ce.delay.advance(time, 4);
            ce.delay.rrec
        };
        let tokens = value.to_be_bytes();
        self.endpoint_receive_data_tokens(dest, receive_time, &tokens);
        ResOp::Done(())
    }

    /// `outct`: send one control token. `END` and `PAUSE` close the packet.
    pub(crate) fn chanend_out_ct(
        &mut self,
        thread: ThreadRef,
        res: ResourceRef,
        value: u8,
        time: Ticks,
    ) -> ResOp<()> {
        if !self.chanend_open_route(res, time) {
            return self.chanend_pause_out(thread, res);
        }
        let closes = value == control::CT_END || value == control::CT_PAUSE;
        if self.chanend(res).junk_packet {
            if closes {
                let ce = self.chanend_mut(res);
                ce.in_packet = false;
                ce.junk_packet = false;
                ce.dest = None;
            }
            return ResOp::Done(());
        }
        let dest = self.chanend(res).dest.expect("open packet with no destination");
        if !self.endpoint_can_accept_tokens(dest, 1) {
            return self.chanend_pause_out(thread, res);
        }
        let receive_time = {
            let ce = self.chanend_mut(res);
            ce.delay.advance(time, 1);
            ce.delay.rrec
        };
        self.endpoint_receive_ctrl_token(dest, receive_time, value);
        if closes {
            let ce = self.chanend_mut(res);
            ce.in_packet = false;
            ce.dest = None;
        }
        ResOp::Done(())
    }

    fn chanend_pause_out(&mut self, thread: ThreadRef, res: ResourceRef) -> ResOp<()> {
        self.chanend_mut(res).paused_out = Some(thread);
        self.thread_mut(thread).paused_on = Some(res);
        ResOp::Descheduled
    }

    /// Check for a leading token, pausing the thread on an empty buffer.
    /// Returns whether the front token is a control token.
    fn chanend_test_ct(&mut self, thread: ThreadRef, res: ResourceRef) -> Option<bool> {
        let ce = self.chanend_mut(res);
        match ce.buf.front() {
            Some(token) => Some(token.is_control()),
            None => {
                ce.paused_in = Some(thread);
                ce.wait_for_word = false;
                self.thread_mut(thread).paused_on = Some(res);
                None
            }
        }
    }

    /// `testct`: report whether the next token is a control token.
    pub(crate) fn chanend_testct(&mut self, thread: ThreadRef, res: ResourceRef) -> ResOp<u32> {
        match self.chanend_test_ct(thread, res) {
            Some(is_ct) => ResOp::Done(is_ct as u32),
            None => ResOp::Descheduled,
        }
    }

    /// `testwct`: position (1-based) of the first control token within the
    /// next word, or 0 if the next four tokens are all data.
    pub(crate) fn chanend_testwct(&mut self, thread: ThreadRef, res: ResourceRef) -> ResOp<u32> {
        match self.chanend_scan_word(thread, res) {
            Some(position) => ResOp::Done(position),
            None => ResOp::Descheduled,
        }
    }

    fn chanend_scan_word(&mut self, thread: ThreadRef, res: ResourceRef) -> Option<u32> {
        let ce = self.chanend_mut(res);
        let available = ce.buf.len().min(4);
        for i in 0..available {
            if ce.buf.get(i).unwrap().is_control() {
                return Some(i as u32 + 1);
            }
        }
        if ce.buf.len() < 4 {
            ce.paused_in = Some(thread);
            ce.wait_for_word = true;
            self.thread_mut(thread).paused_on = Some(res);
            return None;
        }
        Some(0)
    }

    /// Pop one token and tell the packet source buffer space is available.
    fn chanend_pop_token(&mut self, res: ResourceRef, time: Ticks) -> u8 {
        let ce = self.chanend_mut(res);
        let token = ce.buf.pop_front().expect("pop on empty chanend buffer");
        let remaining = ce.buf.remaining();
        if let Some(source) = ce.source {
            self.endpoint_notify_dest_can_accept_tokens(source, time, remaining);
        }
        token.value()
    }

    /// `int`: read one data token.
    pub(crate) fn chanend_in_token(
        &mut self,
        thread: ThreadRef,
        res: ResourceRef,
        time: Ticks,
    ) -> ResOp<u32> {
        match self.chanend_test_ct(thread, res) {
            None => ResOp::Descheduled,
            Some(true) => ResOp::Illegal,
            Some(false) => ResOp::Done(self.chanend_pop_token(res, time) as u32),
        }
    }

    /// `inct`: read one control token.
    pub(crate) fn chanend_in_ct(
        &mut self,
        thread: ThreadRef,
        res: ResourceRef,
        time: Ticks,
    ) -> ResOp<u32> {
        match self.chanend_test_ct(thread, res) {
            None => ResOp::Descheduled,
            Some(false) => ResOp::Illegal,
            Some(true) => ResOp::Done(self.chanend_pop_token(res, time) as u32),
        }
    }

    /// `chkct`: consume the expected control token, trapping on mismatch.
    pub(crate) fn chanend_chkct(
        &mut self,
        thread: ThreadRef,
        res: ResourceRef,
        value: u8,
        time: Ticks,
    ) -> ResOp<()> {
        match self.chanend_test_ct(thread, res) {
            None => ResOp::Descheduled,
            Some(false) => ResOp::Illegal,
            Some(true) => {
                if self.chanend(res).buf.front().unwrap().value() != value {
                    return ResOp::Illegal;
                }
                self.chanend_pop_token(res, time);
                ResOp::Done(())
            }
        }
    }

    /// `in`: read one word (four data tokens), big-endian.
    pub(crate) fn chanend_in_word(
        &mut self,
        thread: ThreadRef,
        res: ResourceRef,
        time: Ticks,
    ) -> ResOp<u32> {
        match self.chanend_scan_word(thread, res) {
            None => ResOp::Descheduled,
            Some(position) if position != 0 => ResOp::Illegal,
            Some(_) => {
                let value = {
                    let ce = self.chanend_mut(res);
                    let b = |i: usize| ce.buf.get(i).unwrap().value() as u32;
                    let v = (b(0) << 24) | (b(1) << 16) | (b(2) << 8) | b(3);
                    ce.buf.drop_front(4);
                    v
                };
                let ce = self.chanend(res);
                let remaining = ce.buf.remaining();
                if let Some(source) = ce.source {
                    self.endpoint_notify_dest_can_accept_tokens(source, time, remaining);
                }
                ResOp::Done(value)
            }
        }
    }

    /// `setd`: set the destination. Only chanend and config IDs are valid.
    pub(crate) fn chanend_set_dest(&mut self, res: ResourceRef, value: u32) -> bool {
        let ce = self.chanend_mut(res);
        if ce.in_packet {
            return false;
        }
        match crate::device::ResourceId(value).ty() {
            Some(ResourceType::Chanend) | Some(ResourceType::Config) => {
                ce.dest_id = value;
                true
            }
            _ => false,
        }
    }

    // -- receive side -----------------------------------------------------

    pub(crate) fn chanend_receive_data_token(&mut self, res: ResourceRef, time: Ticks, value: u8) {
        self.chanend_mut(res).buf.push_back(Token::data(value, time));
        self.chanend_update(res, time);
    }

    pub(crate) fn chanend_receive_data_tokens(
        &mut self,
        res: ResourceRef,
        time: Ticks,
        values: &[u8],
    ) {
        let ce = self.chanend_mut(res);
        for &v in values {
            ce.buf.push_back(Token::data(v, time));
        }
        self.chanend_update(res, time);
    }

    pub(crate) fn chanend_receive_ctrl_token(&mut self, res: ResourceRef, time: Ticks, value: u8) {
        match value {
            control::CT_END => {
                self.chanend_mut(res).buf.push_back(Token::ctrl(value, time));
                self.chanend_release(res, time);
                self.chanend_update(res, time);
            }
            control::CT_PAUSE => {
                self.chanend_release(res, time);
            }
            _ => {
                self.chanend_mut(res).buf.push_back(Token::ctrl(value, time));
                self.chanend_update(res, time);
            }
        }
    }

    /// The current packet into us is done: hand the route to the oldest
    /// queued claimant, if any.
    pub(crate) fn chanend_release(&mut self, res: ResourceRef, time: Ticks) {
        let ce = self.chanend_mut(res);
        match ce.claim_queue.pop_front() {
            None => ce.source = None,
            Some(next) => {
                ce.source = Some(next);
                self.endpoint_notify_dest_claimed(next, time);
            }
        }
    }

    /// Wake a paused reader or fire an event after new tokens arrived.
    fn chanend_update(&mut self, res: ResourceRef, time: Ticks) {
        debug_assert!(!self.chanend(res).buf.is_empty());
        if self.events_permitted(res) {
            self.fire_event(res, time);
            return;
        }
        // A token arriving in the owner's future drags the owner's clock
        // forward to the modelled arrival time, so the token can never be
        // read as if it were already there.
        let owner = self.chanend(res).base.owner;
        if let Some(owner) = owner {
            if self.thread(owner).time < time {
                self.chanend_mut(res).paused_in = None;
                self.wake_thread(owner, time);
                return;
            }
        }
        let ce = self.chanend_mut(res);
        if ce.paused_in.is_none() {
            return;
        }
        if ce.wait_for_word && ce.buf.len() < 4 {
            return;
        }
        let thread = ce.paused_in.take().unwrap();
        self.wake_thread(thread, time);
    }

    pub(crate) fn chanend_notify_dest_claimed(&mut self, res: ResourceRef, time: Ticks) {
        if let Some(thread) = self.chanend_mut(res).paused_out.take() {
            self.wake_thread(thread, time);
        }
    }

    pub(crate) fn chanend_notify_can_accept(&mut self, res: ResourceRef, time: Ticks) {
        if let Some(thread) = self.chanend_mut(res).paused_out.take() {
            self.wake_thread(thread, time);
        }
    }

    /// Called when events are enabled on the owning thread. Returns true if
    /// an event fired.
    pub(crate) fn chanend_see_event_enable(&mut self, res: ResourceRef, time: Ticks) -> bool {
        if self.chanend(res).buf.is_empty() {
            return false;
        }
        self.fire_event(res, time);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_delay_local_is_immediate() {
        let mut d = TokenDelay::local();
        d.advance(100, 1);
        assert_eq!(d.rrec, 100);
        d.advance(104, 4);
        assert_eq!(d.rrec, 104);
    }

    #[test]
    fn test_token_delay_header_surcharge() {
        let mut d = TokenDelay { delay: 10, trate: 4, hops: 1, ..TokenDelay::default() };
        d.advance(0, 1);
        // route delay + header: 10 + 3*4 + 8*1 = 30
        assert_eq!(d.rrec, 30);
        let first = d.rrec;
        d.advance(1, 1);
        // Pipelined: one more token rate on top of the outstanding stream.
        assert_eq!(d.rrec, first + 4);
    }

    #[test]
    fn test_token_delay_idle_gap_resets_pipeline() {
        let mut d = TokenDelay { delay: 2, trate: 1, hops: 0, header: HeaderSent::Local, ..TokenDelay::default() };
        d.advance(0, 1);
        assert_eq!(d.rrec, 2);
        // A long idle gap: arrival tracks send time again.
        d.advance(100, 1);
        assert_eq!(d.rrec, 102);
    }

    #[test]
    fn test_local_pair_preserves_order_and_time() {
        use crate::config::SimConfig;
        use crate::device::{ResourceId, ResourceRef, ResourceType};
        use crate::system::SystemState;

        let (mut sys, core) = SystemState::single_core(SimConfig::default());
        let t0 = ThreadRef { core, index: 0 };
        let t1 = ThreadRef { core, index: 1 };
        sys.thread_mut(t0).alloc(0);
        sys.thread_mut(t1).alloc(0);

        let a_id = sys.alloc_resource(t0, ResourceType::Chanend).unwrap();
        let b_id = sys.alloc_resource(t1, ResourceType::Chanend).unwrap();
        let (_, a_idx) = sys.core(core).resource_index(ResourceId(a_id)).unwrap();
        let (_, b_idx) = sys.core(core).resource_index(ResourceId(b_id)).unwrap();
        let a = ResourceRef { core, ty: ResourceType::Chanend, index: a_idx };
        let b = ResourceRef { core, ty: ResourceType::Chanend, index: b_idx };

        assert!(sys.chanend_set_dest(a, b_id));
        let send_time = 100;
        assert_eq!(sys.chanend_out_word(t0, a, 0x0102_0304, send_time), ResOp::Done(()));

        // Delivered in order with timestamps at or after the send.
        let times: Vec<u64> = (0..4).map(|i| sys.chanend(b).buf.get(i).unwrap().time()).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert!(times[0] >= send_time);

        assert_eq!(sys.chanend_in_word(t1, b, 200), ResOp::Done(0x0102_0304));
        assert_eq!(sys.chanend_out_ct(t0, a, control::CT_END, 210), ResOp::Done(()));
        assert_eq!(sys.chanend_chkct(t1, b, control::CT_END, 220), ResOp::Done(()));
        // Route released after END.
        assert!(sys.chanend(b).source.is_none());
        assert!(!sys.chanend(a).in_packet);
    }

    #[test]
    fn test_full_buffer_pauses_sender_and_resumes() {
        use crate::config::SimConfig;
        use crate::device::{ResourceId, ResourceRef, ResourceType};
        use crate::system::SystemState;

        let (mut sys, core) = SystemState::single_core(SimConfig::default());
        let t0 = ThreadRef { core, index: 0 };
        let t1 = ThreadRef { core, index: 1 };
        sys.thread_mut(t0).alloc(0);
        sys.thread_mut(t1).alloc(0);
        let a_id = sys.alloc_resource(t0, ResourceType::Chanend).unwrap();
        let b_id = sys.alloc_resource(t1, ResourceType::Chanend).unwrap();
        let (_, a_idx) = sys.core(core).resource_index(ResourceId(a_id)).unwrap();
        let (_, b_idx) = sys.core(core).resource_index(ResourceId(b_id)).unwrap();
        let a = ResourceRef { core, ty: ResourceType::Chanend, index: a_idx };
        let b = ResourceRef { core, ty: ResourceType::Chanend, index: b_idx };
        assert!(sys.chanend_set_dest(a, b_id));

        // Two words fill the eight-token buffer; the third pauses the
        // sender.
        assert_eq!(sys.chanend_out_word(t0, a, 1, 0), ResOp::Done(()));
        assert_eq!(sys.chanend_out_word(t0, a, 2, 1), ResOp::Done(()));
        assert_eq!(sys.chanend_out_word(t0, a, 3, 2), ResOp::Descheduled);
        assert_eq!(sys.chanend(a).paused_out, Some(t0));

        // The consumer popping a word notifies the sender.
        assert_eq!(sys.chanend_in_word(t1, b, 10), ResOp::Done(1));
        assert!(sys.chanend(a).paused_out.is_none());
        assert!(sys.thread(t0).queued);
    }

    #[test]
    fn test_claim_queue_hands_over_route() {
        use crate::config::SimConfig;
        use crate::device::{EndpointRef, ResourceId, ResourceRef, ResourceType};
        use crate::system::SystemState;

        let (mut sys, core) = SystemState::single_core(SimConfig::default());
        let t0 = ThreadRef { core, index: 0 };
        let t1 = ThreadRef { core, index: 1 };
        let t2 = ThreadRef { core, index: 2 };
        for t in [t0, t1, t2] {
            sys.thread_mut(t).alloc(0);
        }
        let a_id = sys.alloc_resource(t0, ResourceType::Chanend).unwrap();
        let b_id = sys.alloc_resource(t1, ResourceType::Chanend).unwrap();
        let c_id = sys.alloc_resource(t2, ResourceType::Chanend).unwrap();
        let lookup = |sys: &SystemState, id: u32| {
            let (_, idx) = sys.core(core).resource_index(ResourceId(id)).unwrap();
            ResourceRef { core, ty: ResourceType::Chanend, index: idx }
        };
        let a = lookup(&sys, a_id);
        let b = lookup(&sys, b_id);
        let c = lookup(&sys, c_id);

        // A and B both talk to C; A gets the route, B's claim defers.
        assert!(sys.chanend_set_dest(a, c_id));
        assert!(sys.chanend_set_dest(b, c_id));
        assert_eq!(sys.chanend_out_token(t0, a, 0x11, 0), ResOp::Done(()));
        assert_eq!(sys.chanend_out_token(t1, b, 0x22, 0), ResOp::Descheduled);
        assert_eq!(sys.chanend(c).source, Some(EndpointRef::Chanend(core, a.index)));

        // END hands the route to B and wakes it.
        assert_eq!(sys.chanend_out_ct(t0, a, control::CT_END, 5), ResOp::Done(()));
        assert_eq!(sys.chanend(c).source, Some(EndpointRef::Chanend(core, b.index)));
        assert!(sys.thread(t1).queued);
    }

    #[test]
    fn test_chanend_free_junks_incoming() {
        let mut ce = Chanend::default();
        assert!(ce.junk_incoming);
        let owner = ThreadRef { core: crate::device::CoreRef { node: 0, core: 0 }, index: 0 };
        ce.alloc(owner);
        assert!(!ce.junk_incoming);
        ce.free();
        assert!(ce.junk_incoming);
    }
}
