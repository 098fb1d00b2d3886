//! Per-interface delta and rate engine.
//!
//! Converts the cumulative counters read from the kernel table into
//! per-interval deltas and rates, and keeps the last-seen state a live mirror
//! of the table's key set.

pub mod classify;
pub mod nic;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::tracer::event::{FlowKey, FlowStats};

/// Counter increase attributed to one interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowDelta {
    pub packets: u64,
    pub bytes: u64,
}

/// Throughput derived from a delta.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlowRate {
    pub bytes_per_sec: f64,
    pub bits_per_sec: f64,
}

impl FlowRate {
    /// Console rendering unit, MiB per second.
    pub fn mib_per_sec(&self) -> f64 {
        self.bytes_per_sec / 1024.0 / 1024.0
    }

    /// Console rendering unit, megabits per second.
    pub fn mbps(&self) -> f64 {
        self.bits_per_sec / 1_000_000.0
    }
}

/// Delta between the current counters and the previous observation.
///
/// A counter that went backwards is treated as a fresh entry: the delta is the
/// current value, not a wraparound distance.
pub fn compute_delta(current: &FlowStats, last: Option<&FlowStats>) -> FlowDelta {
    match last {
        None => FlowDelta {
            packets: current.packets,
            bytes: current.bytes,
        },
        Some(last) => FlowDelta {
            packets: counter_delta(current.packets, last.packets),
            bytes: counter_delta(current.bytes, last.bytes),
        },
    }
}

fn counter_delta(current: u64, last: u64) -> u64 {
    if current >= last {
        current - last
    } else {
        current
    }
}

/// Rate over the measured interval. Zero when no time has elapsed.
pub fn compute_rate(delta_bytes: u64, elapsed: Duration) -> FlowRate {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return FlowRate::default();
    }
    let bytes_per_sec = delta_bytes as f64 / secs;
    FlowRate {
        bytes_per_sec,
        bits_per_sec: bytes_per_sec * 8.0,
    }
}

#[derive(Debug, Clone, Copy)]
struct Seen {
    stats: FlowStats,
    generation: u64,
}

/// Last-seen state for one interface.
///
/// Each tick is bracketed by [`begin_tick`](Self::begin_tick) and
/// [`end_tick`](Self::end_tick); keys not observed in between are dropped.
#[derive(Debug)]
pub struct FlowTracker {
    last: HashMap<FlowKey, Seen>,
    generation: u64,
    last_tick: Instant,
}

impl FlowTracker {
    /// Create an empty tracker. `start` anchors the first interval.
    pub fn new(start: Instant) -> Self {
        Self {
            last: HashMap::with_capacity(1024),
            generation: 0,
            last_tick: start,
        }
    }

    /// Start a tick at `now` and return the wall time since the previous one.
    pub fn begin_tick(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        self.generation = self.generation.wrapping_add(1);
        elapsed
    }

    /// Record the current counters for `key` and return the interval delta.
    pub fn observe(&mut self, key: FlowKey, current: FlowStats) -> FlowDelta {
        let generation = self.generation;
        match self.last.get_mut(&key) {
            Some(seen) => {
                let delta = compute_delta(&current, Some(&seen.stats));
                seen.stats = current;
                seen.generation = generation;
                delta
            }
            None => {
                self.last.insert(
                    key,
                    Seen {
                        stats: current,
                        generation,
                    },
                );
                compute_delta(&current, None)
            }
        }
    }

    /// Drop every key not observed during the current tick. Returns the number pruned.
    pub fn end_tick(&mut self) -> usize {
        let generation = self.generation;
        let before = self.last.len();
        self.last.retain(|_, seen| seen.generation == generation);
        before - self.last.len()
    }

    /// Last counters recorded for `key`.
    pub fn last_stats(&self, key: &FlowKey) -> Option<&FlowStats> {
        self.last.get(key).map(|seen| &seen.stats)
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.last.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
