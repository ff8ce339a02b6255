//! Clock blocks.
//!
//! A clock block produces the edge stream that drives port shift registers.
//! An internally sourced clock divides the reference clock and is *fixed
//! frequency*: its future edges are known, so ports can compute the exact
//! time of their next observable change instead of stepping every edge. An
//! externally sourced clock follows a port's pin value and has no edge
//! iterator.

use crate::device::resource::ResourceBase;
use crate::device::xs1_spec::CYCLES_PER_TICK;
use crate::device::Ticks;

/// Value written with `setclk` to select the reference clock as source.
pub const CLK_REF: u32 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Rising,
    Falling,
}

/// Cursor over the edge stream of a fixed-frequency clock.
///
/// Edge `k` (k >= 1) occurs at `origin + k * half_period`; odd edges are
/// rising (the clock starts low).
#[derive(Debug, Clone, Copy)]
pub struct EdgeIterator {
    origin: Ticks,
    half_period: Ticks,
    k: u64,
}

impl EdgeIterator {
    pub fn new(origin: Ticks, half_period: Ticks, from: Ticks) -> Self {
        debug_assert!(half_period > 0);
        // First edge at or after `from`.
        let k = if from <= origin {
            1
        } else {
            (from - origin).div_ceil(half_period).max(1)
        };
        EdgeIterator { origin, half_period, k }
    }

    /// Time of the edge under the cursor.
    #[inline]
    pub fn time(&self) -> Ticks {
        self.origin + self.k * self.half_period
    }

    /// Kind of the edge under the cursor.
    #[inline]
    pub fn kind(&self) -> EdgeKind {
        if self.k % 2 == 1 {
            EdgeKind::Rising
        } else {
            EdgeKind::Falling
        }
    }

    /// Advance the cursor one edge.
    #[inline]
    pub fn advance(&mut self) {
        self.k += 1;
    }

    pub fn advance_by(&mut self, n: u64) {
        self.k += n;
    }

    /// Time of the edge `n` places after the cursor (0 = current edge).
    #[inline]
    pub fn peek_time(&self, n: u64) -> Ticks {
        self.origin + (self.k + n) * self.half_period
    }

    /// Number of edges from the cursor (inclusive) up to and including time
    /// `t`. Zero if the current edge is later than `t`.
    pub fn edges_until(&self, t: Ticks) -> u64 {
        if t < self.time() {
            return 0;
        }
        (t - self.origin) / self.half_period - self.k + 1
    }
}

/// Clock source selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockSource {
    /// Internal: reference clock divided by `divide`.
    #[default]
    Reference,
    /// External: driven by the pin value of the given port (flat index).
    Port(usize),
}

/// One clock block resource.
#[derive(Debug, Clone, Default)]
pub struct ClockBlock {
    pub base: ResourceBase,
    pub source: ClockSource,
    /// Reference divide; 0 behaves as 1.
    pub divide: u32,
    pub running: bool,
    /// Time the clock was last started; phase origin of the edge stream.
    pub start_time: Ticks,
    /// Last pin value seen from an external source port.
    pub value: u32,
    /// Port providing the ready-in signal for ports clocked off this block.
    pub ready_in_port: Option<usize>,
    /// Last value seen from the ready-in port.
    pub ready_in_value: u32,
    /// Flat indices of ports clocked off this block.
    pub attached_ports: Vec<usize>,
}

impl ClockBlock {
    /// A clock block that is already running off the reference clock; used
    /// for the default clock every port starts attached to.
    pub fn reference() -> Self {
        ClockBlock { running: true, divide: 1, ..ClockBlock::default() }
    }

    #[inline]
    pub fn is_fixed_frequency(&self) -> bool {
        matches!(self.source, ClockSource::Reference)
    }

    /// Half the output period, in processor cycles.
    pub fn half_period(&self) -> Ticks {
        let div = self.divide.max(1) as Ticks;
        div * (CYCLES_PER_TICK as Ticks / 2)
    }

    /// Edge cursor positioned at the first edge at or after `time`.
    pub fn edge_iterator(&self, time: Ticks) -> EdgeIterator {
        EdgeIterator::new(self.start_time, self.half_period(), time)
    }

    pub fn start(&mut self, time: Ticks) {
        self.running = true;
        self.start_time = time;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn attach_port(&mut self, port: usize) {
        if !self.attached_ports.contains(&port) {
            self.attached_ports.push(port);
        }
    }

    pub fn detach_port(&mut self, port: usize) {
        self.attached_ports.retain(|p| *p != port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_sequence() {
        let clk = ClockBlock::reference();
        let mut it = clk.edge_iterator(0);
        // half period = 2 ticks: rising at 2, falling at 4, rising at 6 ...
        assert_eq!(it.time(), 2);
        assert_eq!(it.kind(), EdgeKind::Rising);
        it.advance();
        assert_eq!(it.time(), 4);
        assert_eq!(it.kind(), EdgeKind::Falling);
    }

    #[test]
    fn test_iterator_from_midstream() {
        let clk = ClockBlock::reference();
        let it = clk.edge_iterator(5);
        assert_eq!(it.time(), 6);
        assert_eq!(it.kind(), EdgeKind::Rising);
    }

    #[test]
    fn test_edges_until() {
        let clk = ClockBlock::reference();
        let it = clk.edge_iterator(0);
        assert_eq!(it.edges_until(1), 0);
        assert_eq!(it.edges_until(2), 1);
        assert_eq!(it.edges_until(7), 3); // edges at 2, 4, 6
    }

    #[test]
    fn test_divide_stretches_period() {
        let mut clk = ClockBlock::reference();
        clk.divide = 4;
        assert_eq!(clk.half_period(), 8);
        let it = clk.edge_iterator(0);
        assert_eq!(it.time(), 8);
    }

    #[test]
    fn test_restart_reanchors_phase() {
        let mut clk = ClockBlock::reference();
        clk.start(100);
        let it = clk.edge_iterator(100);
        assert_eq!(it.time(), 102);
    }
}
