//! XS1 architecture constants.
//!
//! Fixed per-core resource counts and memory geometry for the simulated
//! device family. These match the L-series parts: changing them resizes the
//! resource arenas built in [`crate::device::core::Core`].

/// Number of hardware threads per core.
pub const NUM_THREADS: usize = 8;

/// Number of synchronisers per core.
pub const NUM_SYNCS: usize = 8;

/// Number of locks per core.
pub const NUM_LOCKS: usize = 4;

/// Number of timers per core.
pub const NUM_TIMERS: usize = 10;

/// Number of channel ends per core.
pub const NUM_CHANENDS: usize = 32;

/// Number of clock blocks per core.
pub const NUM_CLKBLKS: usize = 6;

/// Port counts per width family.
pub const NUM_1BIT_PORTS: usize = 16;
pub const NUM_4BIT_PORTS: usize = 6;
pub const NUM_8BIT_PORTS: usize = 4;
pub const NUM_16BIT_PORTS: usize = 4;
pub const NUM_32BIT_PORTS: usize = 2;

/// Total ports per core.
pub const NUM_PORTS: usize = NUM_1BIT_PORTS
    + NUM_4BIT_PORTS
    + NUM_8BIT_PORTS
    + NUM_16BIT_PORTS
    + NUM_32BIT_PORTS;

/// Log base 2 of the per-core RAM size in bytes.
pub const RAM_SIZE_LOG2: u32 = 16;

/// Per-core RAM size in bytes.
pub const RAM_SIZE: u32 = 1 << RAM_SIZE_LOG2;

/// RAM base address. The address window is [RAM_BASE, RAM_BASE + RAM_SIZE).
pub const RAM_BASE: u32 = RAM_SIZE;

/// Size of the input token buffer in a channel end.
pub const CHANEND_BUFFER_SIZE: usize = 8;

/// Size of the input token buffer in an inter-node link.
pub const XLINK_BUFFER_SIZE: usize = 16;

/// Processor cycles per 100 MHz reference-clock tick. Thread time is counted
/// in processor cycles; timers and port counters run off the reference clock.
pub const CYCLES_PER_TICK: u32 = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_total() {
        assert_eq!(NUM_PORTS, 32);
    }

    #[test]
    fn test_ram_window() {
        assert_eq!(RAM_BASE, RAM_SIZE);
        assert_eq!(RAM_SIZE, 0x10000);
    }
}
