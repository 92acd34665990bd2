//! Per-worker and per-queue metrics

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Weight of the newest sample in the speed average.
const SPEED_SMOOTHING: f64 = 0.3;

/// What a processor is doing, or last did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessorMetrics {
    pub worker: String,
    pub pair_id: Option<i64>,
    pub handler: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Bytes moved by the last handler
    pub bytes: u64,
    /// Exponential moving average of transfer speed, bytes per second
    pub speed: Option<f64>,
    pub processed: u64,
}

impl ProcessorMetrics {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            ..Self::default()
        }
    }

    pub fn begin(&mut self, pair_id: i64, handler: &str) {
        self.pair_id = Some(pair_id);
        self.handler = Some(handler.to_string());
        self.start = Some(Utc::now());
        self.end = None;
        self.bytes = 0;
    }

    /// Close the current handler, folding `bytes` into the speed average.
    pub fn finish(&mut self, bytes: u64) {
        let end = Utc::now();
        self.end = Some(end);
        self.bytes = bytes;
        self.processed += 1;
        if bytes == 0 {
            return;
        }
        let Some(start) = self.start else {
            return;
        };
        let elapsed = (end - start).num_milliseconds().max(1) as f64 / 1000.0;
        self.record_speed(bytes as f64 / elapsed);
    }

    pub(crate) fn record_speed(&mut self, sample: f64) {
        self.speed = Some(match self.speed {
            Some(current) => SPEED_SMOOTHING * sample + (1.0 - SPEED_SMOOTHING) * current,
            None => sample,
        });
    }

    pub fn duration_ms(&self) -> Option<i64> {
        Some((self.end? - self.start?).num_milliseconds())
    }
}

/// Sizes of the queue manager's queues.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub local_folder_queue: usize,
    pub local_file_queue: usize,
    pub remote_folder_queue: usize,
    pub remote_file_queue: usize,
    pub error_queue: usize,
    pub total_queue: usize,
    pub processors: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_average() {
        let mut metrics = ProcessorMetrics::new("GenericProcessor#0");
        metrics.record_speed(100.0);
        assert_eq!(metrics.speed, Some(100.0));
        metrics.record_speed(200.0);
        let speed = metrics.speed.unwrap();
        assert!((speed - 130.0).abs() < 1e-9);
    }

    #[test]
    fn test_begin_finish() {
        let mut metrics = ProcessorMetrics::new("LocalFileProcessor");
        metrics.begin(3, "locally_created");
        assert_eq!(metrics.handler.as_deref(), Some("locally_created"));
        metrics.finish(0);
        assert_eq!(metrics.processed, 1);
        assert!(metrics.speed.is_none());
        assert!(metrics.duration_ms().unwrap() >= 0);

        metrics.begin(4, "remotely_created");
        metrics.finish(1024);
        assert!(metrics.speed.unwrap() > 0.0);
        assert_eq!(metrics.bytes, 1024);
    }
}
