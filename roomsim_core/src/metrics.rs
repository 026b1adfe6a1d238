//! Room Metrics Module
//! ===================
//!
//! Per-tick snapshots taken in the last tick phase, plus running figures
//! the room loop uses to report health:
//! - **Tick duration**: wall time spent inside `tick()`
//! - **Overruns**: ticks that exceeded their budget (next tick ran late)
//! - **Throughput**: zone transitions, cast resolutions and events per tick

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Snapshot taken at the end of every tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickMetrics {
    /// Tick number (1-based)
    pub tick: u64,

    /// Time spent executing the tick
    pub duration: Duration,

    /// Entities present after movement
    pub entities: usize,

    /// Entities that moved this tick
    pub moved: usize,

    /// Zone changes this tick
    pub zone_transitions: usize,

    /// Proximity enters + exits this tick
    pub proximity_changes: usize,

    /// Casts that reached a terminal state this tick
    pub casts_resolved: usize,

    /// Casts still waiting after resolution
    pub pending_casts: usize,

    /// Effects removed by the expiration sweep
    pub effects_expired: usize,

    /// Effects still attached after the sweep
    pub active_effects: usize,

    /// Envelopes ever appended to the event log
    pub events_total: u64,
}

/// Running metrics for one room.
#[derive(Debug, Clone, Default)]
pub struct RoomMetrics {
    last: Option<TickMetrics>,
    ticks: u64,
    overruns: u64,
    /// Exponential moving average of tick duration, in seconds
    avg_tick_secs: f64,
    casts_resolved_total: u64,
    zone_transitions_total: u64,
}

/// Smoothing factor for the tick-duration EMA
const EMA_ALPHA: f64 = 0.1;

impl RoomMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a finished tick.
    pub fn record(&mut self, snapshot: TickMetrics) {
        let secs = snapshot.duration.as_secs_f64();
        self.avg_tick_secs = if self.ticks == 0 {
            secs
        } else {
            EMA_ALPHA * secs + (1.0 - EMA_ALPHA) * self.avg_tick_secs
        };
        self.ticks += 1;
        self.casts_resolved_total += snapshot.casts_resolved as u64;
        self.zone_transitions_total += snapshot.zone_transitions as u64;
        self.last = Some(snapshot);
    }

    /// Records that a tick overran its budget.
    pub fn record_overrun(&mut self) {
        self.overruns += 1;
    }

    pub fn last(&self) -> Option<&TickMetrics> {
        self.last.as_ref()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    pub fn avg_tick_duration(&self) -> Duration {
        Duration::from_secs_f64(self.avg_tick_secs)
    }

    pub fn casts_resolved_total(&self) -> u64 {
        self.casts_resolved_total
    }

    pub fn zone_transitions_total(&self) -> u64 {
        self.zone_transitions_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_record_accumulates_totals() {
        let mut metrics = RoomMetrics::new();
        metrics.record(TickMetrics {
            tick: 1,
            duration: Duration::from_millis(10),
            casts_resolved: 2,
            zone_transitions: 1,
            ..Default::default()
        });
        metrics.record(TickMetrics {
            tick: 2,
            duration: Duration::from_millis(20),
            casts_resolved: 1,
            ..Default::default()
        });

        assert_eq!(metrics.ticks(), 2);
        assert_eq!(metrics.casts_resolved_total(), 3);
        assert_eq!(metrics.zone_transitions_total(), 1);
        assert_eq!(metrics.last().unwrap().tick, 2);
        // 0.1 * 20ms + 0.9 * 10ms
        assert_relative_eq!(metrics.avg_tick_duration().as_secs_f64(), 0.011, epsilon = 1e-9);
    }

    #[test]
    fn test_overruns_counted() {
        let mut metrics = RoomMetrics::new();
        metrics.record_overrun();
        metrics.record_overrun();
        assert_eq!(metrics.overruns(), 2);
    }
}
