//! Execution statistics.
//!
//! Per-thread instruction counts and simulated times, collected from the
//! system on demand and rendered as the end-of-run summary.

use std::fmt;

use crate::device::{CoreRef, Ticks};
use crate::system::SystemState;

/// Snapshot of one thread's counters.
#[derive(Debug, Clone, Copy)]
pub struct ThreadStats {
    pub core: CoreRef,
    pub thread: usize,
    pub time: Ticks,
    pub count: u64,
}

/// Snapshot of the whole system's execution counters.
#[derive(Debug, Clone, Default)]
pub struct SystemStats {
    pub threads: Vec<ThreadStats>,
    pub total_instructions: u64,
    pub max_time: Ticks,
}

impl SystemStats {
    pub fn collect(sys: &SystemState) -> Self {
        let mut stats = SystemStats::default();
        for (n, node) in sys.nodes.iter().enumerate() {
            for (c, core) in node.cores.iter().enumerate() {
                for (i, thread) in core.threads.iter().enumerate() {
                    if thread.count == 0 {
                        continue;
                    }
                    stats.threads.push(ThreadStats {
                        core: CoreRef { node: n, core: c },
                        thread: i,
                        time: thread.time,
                        count: thread.count,
                    });
                    stats.total_instructions += thread.count;
                    stats.max_time = stats.max_time.max(thread.time);
                }
            }
        }
        stats
    }
}

impl fmt::Display for SystemStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>8} {:>8} {:>12} {:>12}", "Core", "Thread", "Time", "Insts")?;
        for t in &self.threads {
            writeln!(
                f,
                "{:>8} {:>8} {:>12} {:>12}",
                format!("{}.{}", t.core.node, t.core.core),
                t.thread,
                t.time,
                t.count
            )?;
        }
        writeln!(f)?;
        writeln!(f, "Total instructions executed:  {}", self.total_instructions)?;
        writeln!(f, "Total cycles:                 {}", self.max_time)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::device::ThreadRef;

    #[test]
    fn test_collect_skips_idle_threads() {
        let (mut sys, core) = SystemState::single_core(SimConfig::default());
        let t = ThreadRef { core, index: 0 };
        sys.thread_mut(t).count = 10;
        sys.thread_mut(t).time = 42;
        let stats = SystemStats::collect(&sys);
        assert_eq!(stats.threads.len(), 1);
        assert_eq!(stats.total_instructions, 10);
        assert_eq!(stats.max_time, 42);
    }
}
