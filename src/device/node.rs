//! Nodes and inter-node routing.
//!
//! A node owns a system switch, a set of links and (for a processor node)
//! one or more cores. The 16-bit node field of a resource ID splits into a
//! high-order node number and a low-order local field; the split width is
//! configurable through the switch. Routing XORs the destination node number
//! with the local one and forwards towards the highest differing bit using
//! the node's per-bit direction table.

use crate::device::chanend::{HeaderSent, TokenDelay};
use crate::device::core::Core;
use crate::device::resource::{ResourceId, ResourceType, RES_CONFIG_SSCTRL};
use crate::device::sswitch::SSwitch;
use crate::device::xlink::{XLink, XLinkGroup};
use crate::device::xs1_spec::NUM_CHANENDS;
use crate::device::{CoreRef, EndpointRef};
use crate::system::SystemState;

/// Number of direction values a node distinguishes.
pub const NUM_DIRECTIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Single-core L-series device.
    L,
    /// G-series device.
    G,
}

/// One routing node.
#[derive(Debug)]
pub struct Node {
    pub node_type: NodeType,
    /// Node number, compared against the high bits of resource-ID node
    /// fields.
    pub node_id: u32,
    /// Width of the node-number field within the 16-bit node field.
    pub node_number_bits: u32,
    /// Direction per node-number bit.
    pub directions: Vec<u8>,
    pub jtag_index: usize,
    pub cores: Vec<Core>,
    pub xlinks: Vec<XLink>,
    pub xlink_groups: Vec<XLinkGroup>,
    pub sswitch: SSwitch,
}

impl Node {
    pub fn new(node_type: NodeType, num_xlinks: usize) -> Self {
        let node_number_bits = 8;
        let mut groups = Vec::with_capacity(NUM_DIRECTIONS);
        for _ in 0..NUM_DIRECTIONS {
            groups.push(XLinkGroup::default());
        }
        // Links start in direction 0.
        groups[0].links = (0..num_xlinks).collect();
        Node {
            node_type,
            node_id: 0,
            node_number_bits,
            directions: vec![0; node_number_bits as usize],
            jtag_index: 0,
            cores: Vec::new(),
            xlinks: (0..num_xlinks).map(|_| XLink::default()).collect(),
            xlink_groups: groups,
            sswitch: SSwitch::default(),
        }
    }

    #[inline]
    pub fn non_node_number_bits(&self) -> u32 {
        16 - self.node_number_bits
    }

    pub fn set_node_number_bits(&mut self, value: u32) {
        self.node_number_bits = value.min(16);
        self.directions.resize(self.node_number_bits as usize, 0);
    }

    /// Update the node number and renumber the cores' chanend IDs.
    pub fn set_node_id(&mut self, value: u32) {
        self.node_id = value;
        let shift = self.non_node_number_bits();
        for (i, core) in self.cores.iter_mut().enumerate() {
            core.core_id = (value << shift) | i as u32;
        }
    }

    pub fn has_matching_node_id(&self, id: ResourceId) -> bool {
        id.node() >> self.non_node_number_bits() == self.node_id
    }

    /// Move a link between direction groups.
    pub fn set_xlink_direction(&mut self, link: usize, direction: u8) {
        let direction = (direction as usize) % NUM_DIRECTIONS;
        let old = self.xlinks[link].direction as usize;
        if old == direction {
            return;
        }
        self.xlink_groups[old].links.retain(|l| *l != link);
        self.xlink_groups[direction].links.push(link);
        self.xlinks[link].direction = direction as u8;
    }
}

impl SystemState {
    /// Resolve an ID addressed at `node` to a node-local endpoint.
    pub(crate) fn local_chanend_dest(&self, node: usize, id: ResourceId) -> Option<EndpointRef> {
        if id.is_config() {
            if id.num() == RES_CONFIG_SSCTRL {
                return Some(EndpointRef::SSwitch(node));
            }
            return None;
        }
        if id.ty() != Some(ResourceType::Chanend) {
            return None;
        }
        let n = &self.nodes[node];
        let local_mask = (1u32 << n.non_node_number_bits()) - 1;
        let core = (id.node() & local_mask) as usize;
        if core >= n.cores.len() || id.num() as usize >= NUM_CHANENDS {
            return None;
        }
        Some(EndpointRef::Chanend(CoreRef { node, core }, id.num() as usize))
    }

    /// One routing hop for the ID seen at `node`: a local endpoint, the
    /// outgoing link group, or None to junk the packet.
    pub(crate) fn next_endpoint(&self, node: usize, id: ResourceId) -> Option<EndpointRef> {
        let n = &self.nodes[node];
        let dest_node = id.node() >> n.non_node_number_bits();
        let diff = dest_node ^ n.node_id;
        if diff == 0 {
            return self.local_chanend_dest(node, id);
        }
        let bit = (31 - diff.leading_zeros()) as usize;
        if bit >= n.directions.len() {
            return None;
        }
        let direction = n.directions[bit] as usize % NUM_DIRECTIONS;
        if n.xlink_groups[direction].links.is_empty() {
            return None;
        }
        Some(EndpointRef::XLinkGroup { node, direction })
    }

    /// Walk the route from `core` to the resource identified by `id_value`,
    /// accumulating the cut-through delay model. Uses Brent's algorithm to
    /// junk packets whose route cycles.
    pub(crate) fn chanend_route(
        &self,
        core: CoreRef,
        id_value: u32,
    ) -> Option<(EndpointRef, TokenDelay)> {
        let id = ResourceId(id_value);
        let mut node = core.node;
        let mut tortoise = node;
        let mut hops = 0u32;
        let mut leap = 8u32;
        let mut delay = 0u64;
        let mut trate = 0u64;
        loop {
            let n = &self.nodes[node];
            let dest_node = id.node() >> n.non_node_number_bits();
            let diff = dest_node ^ n.node_id;
            if diff == 0 {
                break;
            }
            let bit = (31 - diff.leading_zeros()) as usize;
            if bit >= n.directions.len() {
                return None;
            }
            let direction = n.directions[bit] as usize % NUM_DIRECTIONS;
            let link = n.xlink_groups[direction]
                .links
                .iter()
                .copied()
                .find(|&l| self.xlink_connected(node, l))?;
            let xl = &n.xlinks[link];
            let hop_delay = xl.token_delay();
            delay += hop_delay;
            trate = trate.max(hop_delay);
            node = xl.dest.expect("connected link with no destination").0;
            hops += 1;
            if node == tortoise {
                return None;
            }
            if hops == leap {
                leap <<= 1;
                tortoise = node;
            }
        }
        let ep = self.local_chanend_dest(node, id)?;
        let header = if hops == 0 { HeaderSent::Local } else { HeaderSent::No };
        Some((ep, TokenDelay { delay, trate, hops, rrec: 0, header }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_field_split() {
        let mut n = Node::new(NodeType::L, 0);
        assert_eq!(n.non_node_number_bits(), 8);
        n.set_node_id(3);
        assert!(n.has_matching_node_id(ResourceId::chanend(0, 3 << 8)));
        assert!(!n.has_matching_node_id(ResourceId::chanend(0, 2 << 8)));
    }

    #[test]
    fn test_set_node_number_bits_resizes_directions() {
        let mut n = Node::new(NodeType::L, 0);
        n.set_node_number_bits(4);
        assert_eq!(n.directions.len(), 4);
        assert_eq!(n.non_node_number_bits(), 12);
    }

    #[test]
    fn test_route_cycle_is_junked() {
        use crate::config::SimConfig;
        use crate::system::SystemState;

        // Two nodes whose direction tables bounce a nonexistent destination
        // between them: cycle detection must junk the packet rather than
        // walk forever.
        let mut sys = SystemState::new(SimConfig::default());
        let n0 = sys.add_node(NodeType::L, 1);
        let n1 = sys.add_node(NodeType::L, 1);
        let core0 = sys.add_core(n0);
        let _core1 = sys.add_core(n1);
        sys.connect_xlinks((n0, 0), (n1, 0));

        // Destination node number 3 exists on neither node.
        let dest = ResourceId::chanend(0, 3 << 8);
        assert!(sys.chanend_route(core0, dest.0).is_none());

        // A reachable destination still resolves.
        let good = ResourceId::chanend(0, 1 << 8);
        let (ep, delay) = sys.chanend_route(core0, good.0).unwrap();
        assert!(matches!(ep, EndpointRef::Chanend(_, 0)));
        assert_eq!(delay.hops, 1);
        assert!(delay.delay > 0);
    }

    #[test]
    fn test_local_route_resolves_core() {
        use crate::config::SimConfig;
        use crate::system::SystemState;

        let mut sys = SystemState::new(SimConfig::default());
        let n0 = sys.add_node(NodeType::L, 0);
        let core0 = sys.add_core(n0);
        let core1 = sys.add_core(n0);
        let _ = core1;
        let id = ResourceId::chanend(4, 1); // core 1, chanend 4
        let (ep, delay) = sys.chanend_route(core0, id.0).unwrap();
        assert_eq!(ep, EndpointRef::Chanend(crate::device::CoreRef { node: 0, core: 1 }, 4));
        assert_eq!(delay.hops, 0);
        assert_eq!(delay.delay, 0);
    }

    #[test]
    fn test_xlink_direction_groups() {
        let mut n = Node::new(NodeType::G, 2);
        assert_eq!(n.xlink_groups[0].links, vec![0, 1]);
        n.set_xlink_direction(1, 3);
        assert_eq!(n.xlink_groups[0].links, vec![0]);
        assert_eq!(n.xlink_groups[3].links, vec![1]);
        assert_eq!(n.xlinks[1].direction, 3);
    }
}
