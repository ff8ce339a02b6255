//! The system switch.
//!
//! Each node's switch listens on the reserved switch-control resource ID and
//! speaks a fixed request/response protocol: a `READC` or `WRITEC` control
//! token, a big-endian return address (16-bit node, 8-bit chanend number), a
//! 16-bit register number, a 32-bit value for writes, and a closing `END`.
//! The reply is `ACK` (plus the value for reads) or `NACK`, then `END`.
//! Anything malformed is junked without reply.

use std::collections::VecDeque;

use byteorder::{BigEndian, ByteOrder};

use crate::device::resource::ResourceId;
use crate::device::token::{control, Token};
use crate::device::{EndpointRef, Ticks};
use crate::sched::Runnable;
use crate::system::{ClaimResult, SystemState};

/// Request tokens before the closing `END`, for reads and writes.
const READ_REQUEST_LENGTH: usize = 6;
const WRITE_REQUEST_LENGTH: usize = 10;

/// Ticks between accepting a request and emitting the response.
const RESPONSE_DELAY: Ticks = 8;

/// Switch register numbers.
pub mod regnum {
    /// Device identification.
    pub const DEVICE_ID: u32 = 0x00;
    /// Switch description (link and processor counts).
    pub const DESCRIPTION: u32 = 0x01;
    /// Switch configuration: node-number-bit count.
    pub const SWITCH_CONFIG: u32 = 0x04;
    /// Node identifier.
    pub const NODE_ID: u32 = 0x05;
    /// Directions for node-number bits 0-7, one nibble each.
    pub const DIRECTIONS0: u32 = 0x0C;
    /// Directions for node-number bits 8-15.
    pub const DIRECTIONS1: u32 = 0x0D;
    /// First link control/status register; one per link.
    pub const XLINK_BASE: u32 = 0x20;
}

/// Link register fields.
mod xlink_reg {
    pub const INTER_SYMBOL_SHIFT: u32 = 0;
    pub const INTER_SYMBOL_MASK: u32 = 0x7FF;
    pub const INTER_TOKEN_SHIFT: u32 = 11;
    pub const INTER_TOKEN_MASK: u32 = 0x7FF;
    pub const DIRECTION_SHIFT: u32 = 22;
    pub const DIRECTION_MASK: u32 = 0xF;
    pub const HELLO_BIT: u32 = 1 << 26;
    pub const ISSUED_CREDIT_BIT: u32 = 1 << 27;
    pub const FIVE_WIRE_BIT: u32 = 1 << 30;
    pub const ENABLE_BIT: u32 = 1 << 31;
}

/// A parsed switch request.
#[derive(Debug, Clone, Copy)]
struct Request {
    write: bool,
    return_node: u32,
    return_num: u32,
    regnum: u32,
    data: u32,
}

/// Per-node switch protocol state.
#[derive(Debug, Clone)]
pub struct SSwitch {
    /// Request tokens received so far.
    recv: Vec<Token>,
    junk_incoming_tokens: bool,
    /// Response tokens awaiting transmission.
    response: Vec<Token>,
    sending_response: bool,
    /// Endpoint holding the route into us.
    pub source: Option<EndpointRef>,
    pub claim_queue: VecDeque<EndpointRef>,
    /// Outgoing response routing state.
    pub dest_id: u32,
    pub dest: Option<EndpointRef>,
    pub in_packet: bool,
    pub junk_packet: bool,
}

impl Default for SSwitch {
    fn default() -> Self {
        SSwitch {
            recv: Vec::with_capacity(WRITE_REQUEST_LENGTH),
            junk_incoming_tokens: false,
            response: Vec::with_capacity(6),
            sending_response: false,
            source: None,
            claim_queue: VecDeque::new(),
            dest_id: 0,
            dest: None,
            in_packet: false,
            junk_packet: false,
        }
    }
}

impl SSwitch {
    pub fn can_accept_token(&self) -> bool {
        !self.sending_response
    }

    fn parse_request(&self) -> Option<Request> {
        let first = self.recv.first()?;
        if !first.is_control() {
            return None;
        }
        let (write, expected) = match first.value() {
            control::CT_READC => (false, READ_REQUEST_LENGTH),
            control::CT_WRITEC => (true, WRITE_REQUEST_LENGTH),
            _ => return None,
        };
        if self.recv.len() != expected {
            return None;
        }
        if self.recv[1..].iter().any(|t| t.is_control()) {
            return None;
        }
        let bytes: Vec<u8> = self.recv[1..].iter().map(|t| t.value()).collect();
        let return_node = BigEndian::read_u16(&bytes[0..2]) as u32;
        let return_num = bytes[2] as u32;
        let regnum = BigEndian::read_u16(&bytes[3..5]) as u32;
        let data = if write { BigEndian::read_u32(&bytes[5..9]) } else { 0 };
        Some(Request { write, return_node, return_num, regnum, data })
    }
}

impl SystemState {
    /// Read a switch register. Returns None for unknown registers, which
    /// NACK.
    pub(crate) fn sswitch_read_reg(&self, node: usize, regnum: u32) -> Option<u32> {
        let n = &self.nodes[node];
        match regnum {
            regnum::DEVICE_ID => Some(n.node_id),
            regnum::DESCRIPTION => {
                Some((n.xlinks.len() as u32) << 8 | n.cores.len() as u32)
            }
            regnum::SWITCH_CONFIG => Some(n.node_number_bits),
            regnum::NODE_ID => Some(n.node_id),
            regnum::DIRECTIONS0 | regnum::DIRECTIONS1 => {
                let base = if regnum == regnum::DIRECTIONS0 { 0 } else { 8 };
                let mut value = 0u32;
                for i in 0..8usize {
                    if let Some(d) = n.directions.get(base + i) {
                        value |= (*d as u32 & 0xF) << (i * 4);
                    }
                }
                Some(value)
            }
            r if r >= regnum::XLINK_BASE
                && ((r - regnum::XLINK_BASE) as usize) < n.xlinks.len() =>
            {
                let l = &n.xlinks[(r - regnum::XLINK_BASE) as usize];
                use xlink_reg::*;
                let mut value = 0;
                value |= (l.inter_symbol_delay as u32 & INTER_SYMBOL_MASK) << INTER_SYMBOL_SHIFT;
                value |= (l.inter_token_delay as u32 & INTER_TOKEN_MASK) << INTER_TOKEN_SHIFT;
                value |= (l.direction as u32 & DIRECTION_MASK) << DIRECTION_SHIFT;
                if l.issued_credit {
                    value |= ISSUED_CREDIT_BIT;
                }
                if l.five_wire {
                    value |= FIVE_WIRE_BIT;
                }
                if l.enabled {
                    value |= ENABLE_BIT;
                }
                Some(value)
            }
            _ => None,
        }
    }

    /// Write a switch register. The write is committed before the ACK is
    /// sent, so a read-back through the same switch sees the new state.
    pub(crate) fn sswitch_write_reg(
        &mut self,
        node: usize,
        regnum: u32,
        value: u32,
        time: Ticks,
    ) -> bool {
        match regnum {
            regnum::SWITCH_CONFIG => {
                self.nodes[node].set_node_number_bits(value & 0x1F);
                true
            }
            regnum::NODE_ID => {
                self.nodes[node].set_node_id(value & 0xFFFF);
                true
            }
            regnum::DIRECTIONS0 | regnum::DIRECTIONS1 => {
                let base = if regnum == regnum::DIRECTIONS0 { 0 } else { 8 };
                for i in 0..8usize {
                    let d = ((value >> (i * 4)) & 0xF) as u8;
                    if base + i < self.nodes[node].directions.len() {
                        self.nodes[node].directions[base + i] = d;
                    }
                }
                true
            }
            r if r >= regnum::XLINK_BASE
                && ((r - regnum::XLINK_BASE) as usize) < self.nodes[node].xlinks.len() =>
            {
                let link = (r - regnum::XLINK_BASE) as usize;
                use xlink_reg::*;
                {
                    let l = &mut self.nodes[node].xlinks[link];
                    l.set_inter_symbol_delay(((value >> INTER_SYMBOL_SHIFT) & INTER_SYMBOL_MASK) as u16);
                    l.set_inter_token_delay(((value >> INTER_TOKEN_SHIFT) & INTER_TOKEN_MASK) as u16);
                    l.five_wire = value & FIVE_WIRE_BIT != 0;
                    l.enabled = value & ENABLE_BIT != 0;
                }
                let direction = ((value >> DIRECTION_SHIFT) & DIRECTION_MASK) as u8;
                self.nodes[node].set_xlink_direction(link, direction);
                if value & HELLO_BIT != 0 {
                    self.xlink_hello(node, link, time);
                }
                true
            }
            _ => false,
        }
    }

    pub(crate) fn sswitch_receive_data_token(&mut self, node: usize, time: Ticks, value: u8) {
        let ss = &mut self.nodes[node].sswitch;
        if ss.junk_incoming_tokens {
            return;
        }
        if ss.recv.len() == WRITE_REQUEST_LENGTH {
            ss.junk_incoming_tokens = true;
            return;
        }
        ss.recv.push(Token::data(value, time));
    }

    pub(crate) fn sswitch_receive_ctrl_token(&mut self, node: usize, time: Ticks, value: u8) {
        match value {
            control::CT_END => {
                let request = {
                    let ss = &self.nodes[node].sswitch;
                    if ss.junk_incoming_tokens { None } else { ss.parse_request() }
                };
                if let Some(request) = request {
                    self.sswitch_handle_request(node, time, request);
                }
                let ss = &mut self.nodes[node].sswitch;
                ss.recv.clear();
                ss.junk_incoming_tokens = false;
                self.sswitch_release(node, time);
            }
            control::CT_PAUSE => {
                self.sswitch_release(node, time);
            }
            _ => {
                let ss = &mut self.nodes[node].sswitch;
                if ss.junk_incoming_tokens {
                    return;
                }
                if ss.recv.len() == WRITE_REQUEST_LENGTH {
                    ss.junk_incoming_tokens = true;
                    return;
                }
                ss.recv.push(Token::ctrl(value, time));
            }
        }
    }

    fn sswitch_handle_request(&mut self, node: usize, time: Ticks, request: Request) {
        let dest_id = ResourceId::chanend(request.return_num, request.return_node);
        let (ack, value) = if request.write {
            let ack = self.sswitch_write_reg(node, request.regnum, request.data, time);
            self.tracer.sswitch_write(node, dest_id.0, request.regnum, request.data);
            if ack {
                self.tracer.sswitch_ack(node, dest_id.0);
            } else {
                self.tracer.sswitch_nack(node, dest_id.0);
            }
            (ack, 0)
        } else {
            let value = self.sswitch_read_reg(node, request.regnum);
            self.tracer.sswitch_read(node, dest_id.0, request.regnum);
            if value.is_some() {
                self.tracer.sswitch_ack(node, dest_id.0);
            } else {
                self.tracer.sswitch_nack(node, dest_id.0);
            }
            (value.is_some(), value.unwrap_or(0))
        };
        if request.return_num == 0xFF {
            // Null return chanend: no reply.
            self.nodes[node].sswitch.dest = None;
            return;
        }
        let send_time = time + RESPONSE_DELAY;
        {
            let ss = &mut self.nodes[node].sswitch;
            ss.dest_id = dest_id.0;
            ss.sending_response = true;
            ss.response.clear();
            if ack {
                ss.response.push(Token::ctrl(control::CT_ACK, send_time));
                if !request.write {
                    let mut bytes = [0u8; 4];
                    BigEndian::write_u32(&mut bytes, value);
                    for b in bytes {
                        ss.response.push(Token::data(b, send_time));
                    }
                }
            } else {
                ss.response.push(Token::ctrl(control::CT_NACK, send_time));
            }
            ss.response.push(Token::ctrl(control::CT_END, send_time));
        }
        if !self.sswitch_open_route(node) {
            return;
        }
        if self.nodes[node].sswitch.junk_packet {
            let ss = &mut self.nodes[node].sswitch;
            ss.sending_response = false;
            ss.in_packet = false;
            ss.junk_packet = false;
            ss.dest = None;
            return;
        }
        self.schedule(Runnable::SSwitch { node }, send_time);
    }

    fn sswitch_open_route(&mut self, node: usize) -> bool {
        if self.nodes[node].sswitch.dest.is_some() {
            return true;
        }
        let dest_id = ResourceId(self.nodes[node].sswitch.dest_id);
        let this = EndpointRef::SSwitch(node);
        match self.next_endpoint(node, dest_id) {
            None => {
                self.nodes[node].sswitch.junk_packet = true;
            }
            Some(ep) => match self.endpoint_claim(ep, this) {
                ClaimResult::Claimed(actual) => {
                    self.nodes[node].sswitch.dest = Some(actual);
                }
                ClaimResult::Junk(actual) => {
                    let ss = &mut self.nodes[node].sswitch;
                    ss.dest = Some(actual);
                    ss.junk_packet = true;
                }
                ClaimResult::Deferred => return false,
            },
        }
        self.nodes[node].sswitch.in_packet = true;
        true
    }

    /// Scheduler callback: transmit the pending response if the destination
    /// has room for all of it.
    pub(crate) fn sswitch_run(&mut self, node: usize, time: Ticks) {
        if !self.nodes[node].sswitch.sending_response {
            return;
        }
        if !self.sswitch_open_route(node) {
            return;
        }
        if self.nodes[node].sswitch.junk_packet {
            let ss = &mut self.nodes[node].sswitch;
            ss.sending_response = false;
            ss.in_packet = false;
            ss.junk_packet = false;
            ss.dest = None;
            return;
        }
        let dest = self.nodes[node].sswitch.dest.expect("response with no route");
        let len = self.nodes[node].sswitch.response.len();
        if !self.endpoint_can_accept_tokens(dest, len) {
            return;
        }
        let tokens = self.nodes[node].sswitch.response.clone();
        for t in tokens {
            if t.is_control() {
                self.endpoint_receive_ctrl_token(dest, time, t.value());
            } else {
                self.endpoint_receive_data_token(dest, time, t.value());
            }
        }
        let ss = &mut self.nodes[node].sswitch;
        ss.sending_response = false;
        ss.in_packet = false;
        ss.dest = None;
        ss.response.clear();
    }

    pub(crate) fn sswitch_release(&mut self, node: usize, time: Ticks) {
        let ss = &mut self.nodes[node].sswitch;
        match ss.claim_queue.pop_front() {
            None => ss.source = None,
            Some(next) => {
                ss.source = Some(next);
                self.endpoint_notify_dest_claimed(next, time);
            }
        }
    }

    /// A deferred response route became available.
    pub(crate) fn sswitch_notify_dest_claimed(&mut self, node: usize, time: Ticks) {
        if self.nodes[node].sswitch.sending_response {
            self.schedule(Runnable::SSwitch { node }, time);
        }
    }

    pub(crate) fn sswitch_notify_can_accept(&mut self, node: usize, time: Ticks, tokens: usize) {
        let ss = &self.nodes[node].sswitch;
        if ss.sending_response && tokens >= ss.response.len() {
            self.schedule(Runnable::SSwitch { node }, time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_request(ss: &mut SSwitch, write: bool, regnum: u32, data: u32) {
        let ct = if write { control::CT_WRITEC } else { control::CT_READC };
        ss.recv.push(Token::ctrl(ct, 0));
        // return node 0x0001, return num 2
        for b in [0u8, 1, 2] {
            ss.recv.push(Token::data(b, 0));
        }
        ss.recv.push(Token::data((regnum >> 8) as u8, 0));
        ss.recv.push(Token::data(regnum as u8, 0));
        if write {
            let mut bytes = [0u8; 4];
            BigEndian::write_u32(&mut bytes, data);
            for b in bytes {
                ss.recv.push(Token::data(b, 0));
            }
        }
    }

    /// Park a driver thread on a `waiteu` loop so forced wakeups from
    /// arriving tokens have somewhere harmless to run.
    fn park_thread(sys: &mut crate::system::SystemState, t: crate::device::ThreadRef) {
        use crate::exec::isa::{encode_0r, encode_u6, InstructionOpcode};
        let base = sys.core(t.core).ram_base;
        sys.core_mut(t.core).write_u16(base, encode_0r(InstructionOpcode::Waiteu));
        sys.core_mut(t.core).write_u16(base + 2, encode_u6(InstructionOpcode::Brbu, 2));
        sys.thread_mut(t).pc = base;
    }

    #[test]
    fn test_readc_round_trip_across_nodes() {
        use crate::config::SimConfig;
        use crate::device::node::NodeType;
        use crate::device::resource::{ResOp, ResourceId, ResourceType};
        use crate::device::{ResourceRef, ThreadRef};
        use crate::system::{StopReason, SystemState};

        let mut sys = SystemState::new(SimConfig::default());
        let n0 = sys.add_node(NodeType::L, 1);
        let n1 = sys.add_node(NodeType::L, 1);
        let core0 = sys.add_core(n0);
        let _core1 = sys.add_core(n1);
        sys.connect_xlinks((n0, 0), (n1, 0));

        let t = ThreadRef { core: core0, index: 0 };
        sys.thread_mut(t).alloc(0);
        park_thread(&mut sys, t);
        let ce_id = sys.alloc_resource(t, ResourceType::Chanend).unwrap();
        let (_, index) = sys.core(core0).resource_index(ResourceId(ce_id)).unwrap();
        let ce = ResourceRef { core: core0, ty: ResourceType::Chanend, index };

        // Address the switch of node 1 through the reserved config ID.
        let node1_field = sys.nodes[n1].node_id << sys.nodes[n1].non_node_number_bits();
        assert!(sys.chanend_set_dest(ce, ResourceId::config_ssctrl(node1_field).0));

        // READC, return address (node 0, chanend 0), register NODE_ID, END.
        assert_eq!(sys.chanend_out_ct(t, ce, control::CT_READC, 0), ResOp::Done(())); 
        for byte in [0u8, 0, 0, 0, regnum::NODE_ID as u8] {
            assert_eq!(sys.chanend_out_token(t, ce, byte, 0), ResOp::Done(()));
        }
        assert_eq!(sys.chanend_out_ct(t, ce, control::CT_END, 0), ResOp::Done(()));

        // Drain the switch response and the link forwarding.
        assert_eq!(sys.run(), StopReason::NoRunnableThreads);

        // ACK + 32-bit node ID + END.
        assert_eq!(sys.chanend_chkct(t, ce, control::CT_ACK, 100), ResOp::Done(()));
        assert_eq!(sys.chanend_in_word(t, ce, 100), ResOp::Done(1));
        assert_eq!(sys.chanend_chkct(t, ce, control::CT_END, 100), ResOp::Done(()));
    }

    #[test]
    fn test_writec_commits_before_ack() {
        use crate::config::SimConfig;
        use crate::device::node::NodeType;
        use crate::device::resource::{ResOp, ResourceId, ResourceType};
        use crate::device::{ResourceRef, ThreadRef};
        use crate::system::{StopReason, SystemState};

        let mut sys = SystemState::new(SimConfig::default());
        let n0 = sys.add_node(NodeType::L, 1);
        let n1 = sys.add_node(NodeType::L, 1);
        let core0 = sys.add_core(n0);
        let _core1 = sys.add_core(n1);
        sys.connect_xlinks((n0, 0), (n1, 0));

        let t = ThreadRef { core: core0, index: 0 };
        sys.thread_mut(t).alloc(0);
        park_thread(&mut sys, t);
        let ce_id = sys.alloc_resource(t, ResourceType::Chanend).unwrap();
        let (_, index) = sys.core(core0).resource_index(ResourceId(ce_id)).unwrap();
        let ce = ResourceRef { core: core0, ty: ResourceType::Chanend, index };
        let node1_field = sys.nodes[n1].node_id << sys.nodes[n1].non_node_number_bits();
        assert!(sys.chanend_set_dest(ce, ResourceId::config_ssctrl(node1_field).0));

        // WRITEC directions0 <- direction 2 for node-number bit 0.
        assert_eq!(sys.chanend_out_ct(t, ce, control::CT_WRITEC, 0), ResOp::Done(()));
        for byte in [0u8, 0, 0, 0, regnum::DIRECTIONS0 as u8, 0, 0, 0, 2] {
            assert_eq!(sys.chanend_out_token(t, ce, byte, 0), ResOp::Done(()));
        }
        assert_eq!(sys.chanend_out_ct(t, ce, control::CT_END, 0), ResOp::Done(()));
        assert_eq!(sys.run(), StopReason::NoRunnableThreads);

        // The write is visible in the node state and was ACKed.
        assert_eq!(sys.nodes[n1].directions[0], 2);
        assert_eq!(sys.chanend_chkct(t, ce, control::CT_ACK, 200), ResOp::Done(()));
        assert_eq!(sys.chanend_chkct(t, ce, control::CT_END, 200), ResOp::Done(()));
    }

    #[test]
    fn test_malformed_request_is_junked() {
        use crate::config::SimConfig;
        use crate::device::node::NodeType;
        use crate::device::resource::{ResOp, ResourceId, ResourceType};
        use crate::device::{ResourceRef, ThreadRef};
        use crate::system::{StopReason, SystemState};

        let mut sys = SystemState::new(SimConfig::default());
        let n0 = sys.add_node(NodeType::L, 1);
        let n1 = sys.add_node(NodeType::L, 1);
        let core0 = sys.add_core(n0);
        let _core1 = sys.add_core(n1);
        sys.connect_xlinks((n0, 0), (n1, 0));
        let t = ThreadRef { core: core0, index: 0 };
        sys.thread_mut(t).alloc(0);
        park_thread(&mut sys, t);
        let ce_id = sys.alloc_resource(t, ResourceType::Chanend).unwrap();
        let (_, index) = sys.core(core0).resource_index(ResourceId(ce_id)).unwrap();
        let ce = ResourceRef { core: core0, ty: ResourceType::Chanend, index };
        let node1_field = sys.nodes[n1].node_id << sys.nodes[n1].non_node_number_bits();
        assert!(sys.chanend_set_dest(ce, ResourceId::config_ssctrl(node1_field).0));

        // Truncated request: READC + one byte + END.
        assert_eq!(sys.chanend_out_ct(t, ce, control::CT_READC, 0), ResOp::Done(()));
        assert_eq!(sys.chanend_out_token(t, ce, 0, 0), ResOp::Done(()));
        assert_eq!(sys.chanend_out_ct(t, ce, control::CT_END, 0), ResOp::Done(()));
        assert_eq!(sys.run(), StopReason::NoRunnableThreads);

        // No reply of any kind.
        assert!(sys.chanend(ce).buf.is_empty());
    }

    #[test]
    fn test_parse_read_request() {
        let mut ss = SSwitch::default();
        push_request(&mut ss, false, 0x0005, 0);
        let req = ss.parse_request().unwrap();
        assert!(!req.write);
        assert_eq!(req.return_node, 1);
        assert_eq!(req.return_num, 2);
        assert_eq!(req.regnum, 5);
    }

    #[test]
    fn test_parse_write_request() {
        let mut ss = SSwitch::default();
        push_request(&mut ss, true, 0x0C, 0xCAFEBABE);
        let req = ss.parse_request().unwrap();
        assert!(req.write);
        assert_eq!(req.regnum, 0x0C);
        assert_eq!(req.data, 0xCAFEBABE);
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        let mut ss = SSwitch::default();
        push_request(&mut ss, false, 5, 0);
        ss.recv.pop();
        assert!(ss.parse_request().is_none());
    }

    #[test]
    fn test_parse_rejects_embedded_control() {
        let mut ss = SSwitch::default();
        push_request(&mut ss, false, 5, 0);
        ss.recv[3] = Token::ctrl(control::CT_ACK, 0);
        assert!(ss.parse_request().is_none());
    }
}
