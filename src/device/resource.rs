//! Resource identifiers and state common to all hardware resources.
//!
//! Every owned resource carries a 32-bit ID with a type tag in the low byte,
//! a local number in the second byte and a node/core field in the top half.
//! Eventable resources (ports, timers, channel ends) additionally hold the
//! saved event vector and environment that are loaded into the owning thread
//! when an event fires.

use crate::device::ThreadRef;

/// Resource type tags, as found in the low byte of a resource ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResourceType {
    Port = 0,
    Timer = 1,
    Chanend = 2,
    Sync = 3,
    Thread = 4,
    Lock = 5,
    ClkBlk = 6,
    Config = 12,
}

impl ResourceType {
    pub fn from_id(value: u32) -> Option<ResourceType> {
        match value & 0xFF {
            0 => Some(ResourceType::Port),
            1 => Some(ResourceType::Timer),
            2 => Some(ResourceType::Chanend),
            3 => Some(ResourceType::Sync),
            4 => Some(ResourceType::Thread),
            5 => Some(ResourceType::Lock),
            6 => Some(ResourceType::ClkBlk),
            12 => Some(ResourceType::Config),
            _ => None,
        }
    }
}

/// Local number of the switch-control endpoint on the config resource type.
pub const RES_CONFIG_SSCTRL: u32 = 0x0C;

/// A 32-bit resource identifier.
///
/// Layout: bits [0,8) type tag, bits [8,16) local number, bits [16,32) node
/// field. For ports the node field carries the port width instead, since
/// ports are never addressed across the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u32);

impl ResourceId {
    pub fn new(ty: ResourceType, num: u32, node: u32) -> Self {
        ResourceId((node << 16) | ((num & 0xFF) << 8) | ty as u32)
    }

    /// Construct a channel-end ID for `num` on the core identified by `node`.
    pub fn chanend(num: u32, node: u32) -> Self {
        ResourceId::new(ResourceType::Chanend, num, node)
    }

    /// The switch-control endpoint of the node identified by `node`.
    pub fn config_ssctrl(node: u32) -> Self {
        ResourceId::new(ResourceType::Config, RES_CONFIG_SSCTRL, node)
    }

    #[inline]
    pub fn ty(&self) -> Option<ResourceType> {
        ResourceType::from_id(self.0)
    }

    #[inline]
    pub fn num(&self) -> u32 {
        (self.0 >> 8) & 0xFF
    }

    #[inline]
    pub fn node(&self) -> u32 {
        self.0 >> 16
    }

    #[inline]
    pub fn is_config(&self) -> bool {
        self.ty() == Some(ResourceType::Config)
    }

    /// Port width encoded in the node field, for port IDs.
    #[inline]
    pub fn port_width(&self) -> u32 {
        self.node()
    }
}

/// Outcome of a resource operation issued by a thread.
///
/// `Done` completes immediately, `Descheduled` parks the thread on the
/// resource (the instruction retries when the thread is woken unless the
/// operation committed its own program counter), `Illegal` raises a resource
/// exception on the issuing thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResOp<T> {
    Done(T),
    Descheduled,
    Illegal,
}

pub type ResOpResult = ResOp<()>;

/// Condition selector for conditioned inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Condition {
    #[default]
    Full,
    After,
    Eq,
    Neq,
}

/// `setc` operand values. The low three bits select the mode class; the
/// remaining bits select the value within the class.
pub mod setc {
    pub const INUSE_OFF: u32 = 0x0;
    pub const INUSE_ON: u32 = 0x8;
    pub const COND_FULL: u32 = 0x1;
    pub const COND_AFTER: u32 = 0x9;
    pub const COND_EQ: u32 = 0x11;
    pub const COND_NEQ: u32 = 0x19;
    pub const IE_MODE_EVENT: u32 = 0x2;
    pub const IE_MODE_INTERRUPT: u32 = 0xA;
    pub const RUN_STOPR: u32 = 0x7;
    pub const RUN_STARTR: u32 = 0xF;
    pub const RUN_CLRBUF: u32 = 0x17;
    pub const MS_MASTER: u32 = 0x1007;
    pub const MS_SLAVE: u32 = 0x100F;
    pub const BUF_NOBUFFERS: u32 = 0x2007;
    pub const BUF_BUFFERS: u32 = 0x200F;
    pub const RDY_NOREADY: u32 = 0x3007;
    pub const RDY_STROBED: u32 = 0x300F;
    pub const RDY_HANDSHAKE: u32 = 0x3017;
    pub const PORT_DATAPORT: u32 = 0x5007;
    pub const PORT_CLOCKPORT: u32 = 0x500F;
    pub const PORT_READYPORT: u32 = 0x5017;
}

/// In-use and ownership state carried by every resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceBase {
    pub in_use: bool,
    pub owner: Option<ThreadRef>,
}

impl ResourceBase {
    pub fn set_in_use_on(&mut self, owner: ThreadRef) {
        self.in_use = true;
        self.owner = Some(owner);
    }

    pub fn set_in_use_off(&mut self) {
        self.in_use = false;
        self.owner = None;
    }
}

/// Event/interrupt state for eventable resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct Eventable {
    /// Saved program counter jumped to when the event fires.
    pub vector: u32,
    /// Saved environment value loaded into ED when the event fires.
    pub ev_data: u32,
    /// `setc IE_MODE_INTERRUPT` was applied: unit enables arm the interrupt
    /// path instead of the event path.
    pub interrupt_mode: bool,
    pub event_enabled: bool,
    pub interrupt_enabled: bool,
}

impl Eventable {
    pub fn reset(&mut self) {
        *self = Eventable::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_fields() {
        let id = ResourceId::chanend(3, 0x12);
        assert_eq!(id.ty(), Some(ResourceType::Chanend));
        assert_eq!(id.num(), 3);
        assert_eq!(id.node(), 0x12);
        assert!(!id.is_config());
    }

    #[test]
    fn test_ssctrl_id() {
        let id = ResourceId::config_ssctrl(2);
        assert!(id.is_config());
        assert_eq!(id.num(), RES_CONFIG_SSCTRL);
        assert_eq!(id.node(), 2);
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(ResourceType::from_id(0x99), None);
        assert_eq!(ResourceType::from_id(0x0C), Some(ResourceType::Config));
    }
}
