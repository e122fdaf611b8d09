//! Scheduler and stream counters.

use serde::Serialize;

use crate::device::HwQueueStats;
use crate::memory::AllocatorStats;
use crate::stream::StreamId;

/// Counters kept per stream by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamMetrics {
    /// Instructions dispatched.
    pub dispatched: u64,
    /// Instructions whose completion was observed.
    pub completed: u64,
    /// Highest simultaneous in-flight count.
    pub max_in_flight: usize,
    /// Sum of dispatch-to-done latencies (nanoseconds).
    pub latency_ns: u64,
}

impl StreamMetrics {
    /// Record a dispatch that brought in-flight to `in_flight`.
    pub fn record_dispatch(&mut self, in_flight: usize) {
        self.dispatched += 1;
        self.max_in_flight = self.max_in_flight.max(in_flight);
    }

    /// Record an observed completion.
    pub fn record_completion(&mut self, latency_ns: u64) {
        self.completed += 1;
        self.latency_ns += latency_ns;
    }

    /// Mean dispatch-to-done latency in milliseconds.
    #[must_use]
    pub fn avg_latency_ms(&self) -> f64 {
        if self.completed == 0 {
            return 0.0;
        }
        self.latency_ns as f64 / self.completed as f64 / 1_000_000.0
    }
}

/// Snapshot of one stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSnapshot {
    /// Stream.
    pub stream: StreamId,
    /// Scheduler counters.
    pub metrics: StreamMetrics,
    /// Hardware queue counters.
    pub queue: HwQueueStats,
    /// Allocator counters.
    pub memory: AllocatorStats,
    /// Instructions awaiting dispatch.
    pub waiting: usize,
    /// Instructions in flight.
    pub in_flight: usize,
}

impl std::fmt::Display for StreamSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: dispatched={}, completed={}, max_in_flight={}, avg_latency={:.3}ms, mem_peak={}B",
            self.stream,
            self.metrics.dispatched,
            self.metrics.completed,
            self.metrics.max_in_flight,
            self.metrics.avg_latency_ms(),
            self.memory.peak
        )
    }
}

/// VM-wide counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VmMetrics {
    /// Instructions accepted.
    pub enqueued: u64,
    /// Instructions dispatched.
    pub dispatched: u64,
    /// Completions observed.
    pub completed: u64,
    /// Instructions retired.
    pub retired: u64,
    /// Scheduler ticks.
    pub ticks: u64,
    /// Ticks that made no progress.
    pub idle_ticks: u64,
    /// Instructions not yet retired.
    pub live_instructions: usize,
    /// Per-stream snapshots.
    pub streams: Vec<StreamSnapshot>,
}

impl VmMetrics {
    /// Snapshot for one stream.
    pub fn stream(&self, id: StreamId) -> Option<&StreamSnapshot> {
        self.streams.iter().find(|s| s.stream == id)
    }

    /// Fraction of ticks that made progress.
    #[must_use]
    pub fn tick_efficiency(&self) -> f64 {
        if self.ticks == 0 {
            return 0.0;
        }
        (self.ticks - self.idle_ticks) as f64 / self.ticks as f64
    }
}

impl std::fmt::Display for VmMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "VM Metrics: enqueued={}, dispatched={}, completed={}, retired={}, ticks={} ({:.1}% busy)",
            self.enqueued,
            self.dispatched,
            self.completed,
            self.retired,
            self.ticks,
            self.tick_efficiency() * 100.0
        )?;
        for stream in &self.streams {
            writeln!(f, "  {}", stream)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_type::StreamKind;

    #[test]
    fn test_stream_metrics() {
        let mut metrics = StreamMetrics::default();
        metrics.record_dispatch(1);
        metrics.record_dispatch(2);
        metrics.record_completion(2_000_000);
        metrics.record_completion(4_000_000);

        assert_eq!(metrics.dispatched, 2);
        assert_eq!(metrics.max_in_flight, 2);
        assert!((metrics.avg_latency_ms() - 3.0).abs() < 0.001);
    }

    #[test]
    fn test_vm_metrics_display() {
        let id = StreamId::new(StreamKind::Cpu, 0);
        let metrics = VmMetrics {
            enqueued: 3,
            ticks: 4,
            idle_ticks: 1,
            streams: vec![StreamSnapshot {
                stream: id,
                metrics: StreamMetrics::default(),
                queue: HwQueueStats::default(),
                memory: AllocatorStats::default(),
                waiting: 0,
                in_flight: 0,
            }],
            ..Default::default()
        };

        assert!((metrics.tick_efficiency() - 0.75).abs() < 0.001);
        let text = metrics.to_string();
        assert!(text.contains("enqueued=3"));
        assert!(text.contains("cpu:0"));
        assert!(metrics.stream(id).is_some());
    }
}
