use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Default)]
pub struct MetricsCollector {
    pub frames_written: u64,
    pub repeats_written: u64,
    pub bytes_written: u64,
    pub start_time: Option<Instant>,
}

/// Point-in-time view of a [`MetricsCollector`], for the run report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_written: u64,
    pub repeats_written: u64,
    pub bytes_written: u64,
    pub uptime_secs: f64,
    pub average_fps: f64,
    pub average_throughput_mbps: f64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn uptime_secs(&self) -> f64 {
        self.start_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Output rate including repeats, which stand in for a frame each.
    pub fn average_fps(&self) -> f64 {
        let uptime = self.uptime_secs();
        if uptime > 0.0 {
            (self.frames_written + self.repeats_written) as f64 / uptime
        } else {
            0.0
        }
    }

    pub fn average_throughput_mbps(&self) -> f64 {
        let uptime = self.uptime_secs();
        if uptime > 0.0 {
            (self.bytes_written * 8) as f64 / uptime / 1_000_000.0
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_written: self.frames_written,
            repeats_written: self.repeats_written,
            bytes_written: self.bytes_written,
            uptime_secs: self.uptime_secs(),
            average_fps: self.average_fps(),
            average_throughput_mbps: self.average_throughput_mbps(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_without_start_time() {
        let metrics = MetricsCollector { frames_written: 10, ..Default::default() };
        assert_eq!(metrics.average_fps(), 0.0);
        assert_eq!(metrics.average_throughput_mbps(), 0.0);
    }

    #[test]
    fn test_snapshot_copies_counters() {
        let mut metrics = MetricsCollector::new();
        metrics.frames_written = 3;
        metrics.repeats_written = 2;
        metrics.bytes_written = 1024;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_written, 3);
        assert_eq!(snapshot.repeats_written, 2);
        assert_eq!(snapshot.bytes_written, 1024);
        assert!(snapshot.uptime_secs >= 0.0);
    }
}
