//! Hardware state model for XS1-class devices.
//!
//! This module provides:
//! - Resource identifiers and the state shared by all resources
//! - The per-core resource arenas (threads, timers, locks, synchronisers,
//!   channel ends, clock blocks, ports) and the opcode cache
//! - Nodes, inter-node links and the system switch
//!
//! # Architecture Overview
//!
//! A simulated system is a set of nodes joined by links:
//!
//! ```text
//!   +----------- Node 0 -----------+       +----------- Node 1 -----------+
//!   | SSwitch                      | XLink | SSwitch                      |
//!   |   Core 0   Core 1            |<=====>|   Core 0                     |
//!   |   threads  threads           |       |   threads                    |
//!   |   chanends chanends          |       |   chanends ...               |
//!   |   ports/clocks/timers/locks  |       |                              |
//!   +------------------------------+       +------------------------------+
//! ```
//!
//! Cross-references between resources are held as stable indices
//! ([`CoreRef`], [`ThreadRef`], [`ResourceRef`]) into the arenas owned by
//! [`crate::system::SystemState`], never as pointers.

pub mod chanend;
pub mod clock;
pub mod core;
pub mod lock;
pub mod node;
pub mod port;
pub mod resource;
pub mod sswitch;
pub mod sync;
pub mod thread;
pub mod timer;
pub mod token;
pub mod xlink;
pub mod xs1_spec;

pub use chanend::Chanend;
pub use clock::{ClockBlock, EdgeIterator, EdgeKind};
pub use core::Core;
pub use lock::Lock;
pub use node::{Node, NodeType};
pub use port::Port;
pub use resource::{
    Condition, Eventable, ResOp, ResOpResult, ResourceBase, ResourceId, ResourceType,
};
pub use sswitch::SSwitch;
pub use sync::Synchroniser;
pub use thread::{Register, ThreadState};
pub use timer::Timer;
pub use token::{Token, TokenBuffer};
pub use xlink::{XLink, XLinkGroup};

/// Simulated time, in processor cycles since reset.
pub type Ticks = u64;

/// Identifies a core within the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreRef {
    pub node: usize,
    pub core: usize,
}

/// Identifies a thread slot on a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadRef {
    pub core: CoreRef,
    pub index: usize,
}

/// Weak reference to a resource in a core's arenas.
///
/// For ports, `index` is the flat index into the port array, not the number
/// within the width family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub core: CoreRef,
    pub ty: ResourceType,
    pub index: usize,
}

/// A channel endpoint anywhere in the system.
///
/// Channel routing terminates at one of these. The variant set is closed and
/// performance-critical, so dispatch is an explicit match (see
/// `system::endpoint`) rather than trait objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRef {
    Chanend(CoreRef, usize),
    SSwitch(usize),
    XLink { node: usize, link: usize },
    XLinkGroup { node: usize, direction: usize },
}
