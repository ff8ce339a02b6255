//! Inter-node links.
//!
//! An XLink is one end of a point-to-point connection between two nodes.
//! Tokens sent across a link land in the receiving end's ring buffer and are
//! forwarded hop by hop towards their destination when the link runs.
//! Transmission is credit-gated: a link may only transmit while it holds at
//! least 8 credits, granted by the receiving end with `CREDIT*` control
//! tokens (initially in response to `HELLO`).

use std::collections::VecDeque;

use crate::device::token::{control, Token, TokenBuffer};
use crate::device::xs1_spec::XLINK_BUFFER_SIZE;
use crate::device::{EndpointRef, Ticks};
use crate::sched::Runnable;
use crate::system::{ClaimResult, SystemState};

/// Credits consumed per transmitted token.
pub const CREDIT_PER_TOKEN: u32 = 8;

/// One end of an inter-node link.
#[derive(Debug, Clone)]
pub struct XLink {
    /// The other end, as (node, link index).
    pub dest: Option<(usize, usize)>,
    pub enabled: bool,
    pub five_wire: bool,
    pub network: u8,
    pub direction: u8,
    /// Raw delay register values; the effective delays include the
    /// hardware's fixed offsets (see [`XLink::set_inter_token_delay`]).
    pub inter_token_delay: u16,
    pub inter_symbol_delay: u16,
    /// Credits available for transmitting towards `dest`.
    pub output_credit: u32,
    /// Whether this end has granted credit to its peer.
    pub issued_credit: bool,
    /// Tokens received from the peer, waiting to be forwarded.
    pub buf: TokenBuffer,
    /// Endpoint currently routed through this end (claimed on the sending
    /// node, recorded on the receiving end).
    pub source: Option<EndpointRef>,
    /// Destination ID of the packet currently routed through this end.
    pub dest_id: u32,
    /// Forwarding state towards the next hop.
    pub fwd_dest: Option<EndpointRef>,
    pub fwd_in_packet: bool,
    pub fwd_junk: bool,
}

impl Default for XLink {
    fn default() -> Self {
        XLink {
            dest: None,
            enabled: false,
            five_wire: false,
            network: 0,
            direction: 0,
            inter_token_delay: 2,
            inter_symbol_delay: 1,
            output_credit: 0,
            issued_credit: false,
            buf: TokenBuffer::new(XLINK_BUFFER_SIZE),
            source: None,
            dest_id: 0,
            fwd_dest: None,
            fwd_in_packet: false,
            fwd_junk: false,
        }
    }
}

impl XLink {
    /// Effective per-token delay: `8/bits-per-symbol` symbol delays plus the
    /// inter-token gap.
    pub fn token_delay(&self) -> Ticks {
        let bps: u64 = if self.five_wire { 2 } else { 1 };
        (8 / bps) * self.inter_symbol_delay as u64 + self.inter_token_delay as u64
    }

    /// The register write value excludes the hardware's fixed two-cycle gap.
    pub fn set_inter_token_delay(&mut self, value: u16) {
        self.inter_token_delay = value + 2;
    }

    pub fn set_inter_symbol_delay(&mut self, value: u16) {
        self.inter_symbol_delay = value + 1;
    }

    #[inline]
    pub fn has_credit(&self) -> bool {
        self.output_credit >= CREDIT_PER_TOKEN
    }
}

/// The set of links forwarding in one direction, plus the claimants waiting
/// for one of them to become free.
#[derive(Debug, Clone, Default)]
pub struct XLinkGroup {
    pub links: Vec<usize>,
    pub queue: VecDeque<EndpointRef>,
}

impl SystemState {
    #[inline]
    pub(crate) fn xlink(&self, node: usize, link: usize) -> &XLink {
        &self.nodes[node].xlinks[link]
    }

    #[inline]
    pub(crate) fn xlink_mut(&mut self, node: usize, link: usize) -> &mut XLink {
        &mut self.nodes[node].xlinks[link]
    }

    /// Both ends enabled with matching wire counts.
    pub(crate) fn xlink_connected(&self, node: usize, link: usize) -> bool {
        let l = self.xlink(node, link);
        if !l.enabled {
            return false;
        }
        let Some((dn, dl)) = l.dest else {
            return false;
        };
        let peer = self.xlink(dn, dl);
        peer.enabled && peer.five_wire == l.five_wire
    }

    /// Wire two link ends together and bring the link up with initial
    /// credit in both directions.
    pub fn connect_xlinks(&mut self, a: (usize, usize), b: (usize, usize)) {
        {
            let l = self.xlink_mut(a.0, a.1);
            l.dest = Some(b);
            l.enabled = true;
            l.output_credit = 64;
            l.issued_credit = true;
        }
        {
            let l = self.xlink_mut(b.0, b.1);
            l.dest = Some(a);
            l.enabled = true;
            l.output_credit = 64;
            l.issued_credit = true;
        }
    }

    /// Claim an outgoing route through a direction group. On success the
    /// returned endpoint is the *receiving* end of the chosen link.
    pub(crate) fn xlink_group_claim(
        &mut self,
        node: usize,
        direction: usize,
        source: EndpointRef,
    ) -> ClaimResult {
        let links = self.nodes[node].xlink_groups[direction].links.clone();
        // The route may already be held by this claimant (a deferred claim
        // handed over on release).
        for &l in &links {
            if let Some((dn, dl)) = self.xlink(node, l).dest {
                if self.xlink(dn, dl).source == Some(source) {
                    return ClaimResult::Claimed(EndpointRef::XLink { node: dn, link: dl });
                }
            }
        }
        for &l in &links {
            if !self.xlink_connected(node, l) {
                continue;
            }
            let (dn, dl) = self.xlink(node, l).dest.unwrap();
            if self.xlink(dn, dl).source.is_none() {
                let dest_id = self.endpoint_dest_id(source);
                let remote = self.xlink_mut(dn, dl);
                remote.source = Some(source);
                remote.dest_id = dest_id;
                return ClaimResult::Claimed(EndpointRef::XLink { node: dn, link: dl });
            }
        }
        self.nodes[node].xlink_groups[direction].queue.push_back(source);
        ClaimResult::Deferred
    }

    /// The packet routed into this receiving end is finished: hand the link
    /// to the oldest queued claimant on the sending side.
    pub(crate) fn xlink_release(&mut self, node: usize, link: usize, time: Ticks) {
        let peer = self.xlink(node, link).dest;
        self.xlink_mut(node, link).source = None;
        self.xlink_mut(node, link).dest_id = 0;
        let Some((pn, pl)) = peer else {
            return;
        };
        let direction = self.xlink(pn, pl).direction as usize;
        let next = self.nodes[pn].xlink_groups[direction].queue.pop_front();
        if let Some(next) = next {
            let dest_id = self.endpoint_dest_id(next);
            let l = self.xlink_mut(node, link);
            l.source = Some(next);
            l.dest_id = dest_id;
            self.endpoint_notify_dest_claimed(next, time);
        }
    }

    /// Room for `tokens` more tokens: buffer space here and transmit credit
    /// on the sending side.
    pub(crate) fn xlink_can_accept_tokens(&self, node: usize, link: usize, tokens: usize) -> bool {
        let l = self.xlink(node, link);
        if l.buf.remaining() < tokens {
            return false;
        }
        match l.dest {
            Some((pn, pl)) => {
                self.xlink(pn, pl).output_credit >= CREDIT_PER_TOKEN * tokens as u32
            }
            None => false,
        }
    }

    pub(crate) fn xlink_receive_token(&mut self, node: usize, link: usize, time: Ticks, token: Token) {
        let is_link_ctrl = token.is_control()
            && matches!(
                token.value(),
                control::CT_HELLO | control::CT_CREDIT8 | control::CT_CREDIT16 | control::CT_CREDIT64
            );
        if !is_link_ctrl {
            // Data consumed credit on the transmitting side.
            if let Some((pn, pl)) = self.xlink(node, link).dest {
                let peer = self.xlink_mut(pn, pl);
                peer.output_credit = peer.output_credit.saturating_sub(CREDIT_PER_TOKEN);
            }
        }
        let was_empty = self.xlink(node, link).buf.is_empty();
        if self.xlink(node, link).buf.is_full() {
            log::warn!("xlink {}:{} buffer overflow, token dropped", node, link);
            return;
        }
        self.xlink_mut(node, link).buf.push_back(token);
        if was_empty {
            self.schedule(Runnable::XLink { node, link }, time);
        }
    }

    /// Open the forwarding route for the packet currently held by this end.
    fn xlink_open_fwd_route(&mut self, node: usize, link: usize) -> bool {
        if self.xlink(node, link).fwd_dest.is_some() || self.xlink(node, link).fwd_junk {
            return true;
        }
        let dest_id = crate::device::ResourceId(self.xlink(node, link).dest_id);
        let this = EndpointRef::XLink { node, link };
        match self.next_endpoint(node, dest_id) {
            None => {
                self.xlink_mut(node, link).fwd_junk = true;
            }
            Some(ep) => match self.endpoint_claim(ep, this) {
                ClaimResult::Claimed(actual) => {
                    self.xlink_mut(node, link).fwd_dest = Some(actual);
                }
                ClaimResult::Junk(actual) => {
                    let l = self.xlink_mut(node, link);
                    l.fwd_dest = Some(actual);
                    l.fwd_junk = true;
                }
                ClaimResult::Deferred => return false,
            },
        }
        self.xlink_mut(node, link).fwd_in_packet = true;
        true
    }

    /// Forward the front token towards its destination. Returns whether the
    /// token was consumed.
    fn xlink_forward(&mut self, node: usize, link: usize, time: Ticks, token: Token) -> bool {
        if !self.xlink_open_fwd_route(node, link) {
            return false;
        }
        let value = token.value();
        let closes = token.is_ct_end() || token.is_ct_pause();
        if self.xlink(node, link).fwd_junk {
            if closes {
                let l = self.xlink_mut(node, link);
                l.fwd_in_packet = false;
                l.fwd_junk = false;
                l.fwd_dest = None;
                self.xlink_release(node, link, time);
            }
            return true;
        }
        let dest = self.xlink(node, link).fwd_dest.expect("open route with no destination");
        if !self.endpoint_can_accept_tokens(dest, 1) {
            return false;
        }
        if token.is_control() {
            self.endpoint_receive_ctrl_token(dest, time, value);
            if closes {
                let l = self.xlink_mut(node, link);
                l.fwd_in_packet = false;
                l.fwd_dest = None;
                self.xlink_release(node, link, time);
            }
        } else {
            self.endpoint_receive_data_token(dest, time, value);
        }
        true
    }

    /// Scheduler callback: process the front of the receive buffer.
    pub(crate) fn xlink_run(&mut self, node: usize, link: usize, time: Ticks) {
        let Some(front) = self.xlink(node, link).buf.front().copied() else {
            return;
        };
        let tok_delay = self.xlink(node, link).token_delay();
        let peer = self.xlink(node, link).dest;
        let mut consumed = true;
        let mut return_credit = false;
        if front.is_control() {
            match front.value() {
                control::CT_HELLO => {
                    self.xlink_mut(node, link).issued_credit = true;
                    if let Some((pn, pl)) = peer {
                        self.xlink_receive_token(
                            pn,
                            pl,
                            time + tok_delay,
                            Token::ctrl(control::CT_CREDIT64, time),
                        );
                    }
                }
                control::CT_CREDIT8 | control::CT_CREDIT16 | control::CT_CREDIT64 => {
                    let amount = match front.value() {
                        control::CT_CREDIT8 => 8,
                        control::CT_CREDIT16 => 16,
                        _ => 64,
                    };
                    let had_credit = self.xlink(node, link).has_credit();
                    self.xlink_mut(node, link).output_credit += amount;
                    if !had_credit {
                        // Traffic through our peer's receiving end was
                        // stalled on credit; let the sender retry.
                        if let Some((pn, pl)) = peer {
                            if let Some(src) = self.xlink(pn, pl).source {
                                self.endpoint_notify_dest_can_accept_tokens(
                                    src,
                                    time,
                                    (amount / CREDIT_PER_TOKEN) as usize,
                                );
                            }
                        }
                    }
                }
                _ => {
                    consumed = self.xlink_forward(node, link, time, front);
                    return_credit = consumed;
                }
            }
        } else {
            consumed = self.xlink_forward(node, link, time, front);
            return_credit = consumed;
        }
        if consumed {
            self.xlink_mut(node, link).buf.pop_front();
            if return_credit && self.xlink(node, link).issued_credit {
                if let Some((pn, pl)) = peer {
                    self.xlink_receive_token(
                        pn,
                        pl,
                        time + tok_delay,
                        Token::ctrl(control::CT_CREDIT8, time),
                    );
                }
            }
        }
        if !self.xlink(node, link).buf.is_empty() {
            self.schedule(Runnable::XLink { node, link }, time + tok_delay);
        }
    }

    /// `HELLO` initiation from a switch register write: zero our credit and
    /// ask the peer for a fresh grant.
    pub(crate) fn xlink_hello(&mut self, node: usize, link: usize, time: Ticks) {
        let tok_delay = self.xlink(node, link).token_delay();
        self.xlink_mut(node, link).output_credit = 0;
        if let Some((pn, pl)) = self.xlink(node, link).dest {
            self.xlink_receive_token(pn, pl, time + tok_delay, Token::ctrl(control::CT_HELLO, time));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_delay() {
        let mut l = XLink::default();
        // Defaults: two-wire, symbol delay 1, token delay 2: 8*1 + 2.
        assert_eq!(l.token_delay(), 10);
        l.five_wire = true;
        assert_eq!(l.token_delay(), 6);
        l.set_inter_symbol_delay(3);
        l.set_inter_token_delay(0);
        assert_eq!(l.token_delay(), 4 * 4 + 2);
    }

    #[test]
    fn test_credit_threshold() {
        let mut l = XLink::default();
        assert!(!l.has_credit());
        l.output_credit = 8;
        assert!(l.has_credit());
    }
}
