use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::core::ErrorKind;

/// Default number of records kept in the window
pub const DEFAULT_WINDOW: usize = 1000;

/// One execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub fingerprint: String,
    pub recorded_at: DateTime<Utc>,
    pub execution_time: Duration,
    pub success: bool,
    pub cache_hit: bool,
    pub row_count: usize,
    pub bytes_processed: Option<u64>,
    pub error_kind: Option<ErrorKind>,
}

/// Aggregate view, computed when read
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub successful_queries: u64,
    pub failed_queries: u64,
    pub cache_hits: u64,
    /// 0.0 when nothing has been recorded
    pub cache_hit_rate: f64,
    pub avg_execution_ms: f64,
    pub total_bytes_processed: u64,
    pub validation_rejections: u64,
    pub timeouts: u64,
    /// Over the retained window only
    pub p95_execution_ms: f64,
    pub window_size: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    successes: u64,
    failures: u64,
    cache_hits: u64,
    total_time: Duration,
    total_bytes: u64,
    validation_rejections: u64,
    timeouts: u64,
}

#[derive(Debug, Default)]
struct MetricsState {
    counters: Counters,
    window: VecDeque<MetricRecord>,
}

/// Lifetime counters plus a bounded window of recent records
#[derive(Debug)]
pub struct MetricsLog {
    capacity: usize,
    state: Mutex<MetricsState>,
}

impl MetricsLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(MetricsState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, record: MetricRecord) {
        let mut state = self.lock();
        let c = &mut state.counters;
        c.total += 1;
        if record.success {
            c.successes += 1;
        } else {
            c.failures += 1;
        }
        if record.cache_hit {
            c.cache_hits += 1;
        }
        c.total_time += record.execution_time;
        c.total_bytes += record.bytes_processed.unwrap_or(0);
        match record.error_kind {
            Some(ErrorKind::Validation) => c.validation_rejections += 1,
            Some(ErrorKind::Timeout) => c.timeouts += 1,
            _ => {}
        }

        if state.window.len() == self.capacity {
            state.window.pop_front();
        }
        state.window.push_back(record);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.lock();
        let c = &state.counters;

        let (cache_hit_rate, avg_execution_ms) = if c.total == 0 {
            (0.0, 0.0)
        } else {
            (
                c.cache_hits as f64 / c.total as f64,
                c.total_time.as_secs_f64() * 1000.0 / c.total as f64,
            )
        };

        MetricsSnapshot {
            total_queries: c.total,
            successful_queries: c.successes,
            failed_queries: c.failures,
            cache_hits: c.cache_hits,
            cache_hit_rate,
            avg_execution_ms,
            total_bytes_processed: c.total_bytes,
            validation_rejections: c.validation_rejections,
            timeouts: c.timeouts,
            p95_execution_ms: percentile_ms(&state.window, 0.95),
            window_size: state.window.len(),
        }
    }

    /// Up to `n` most recent records, oldest first
    pub fn recent(&self, n: usize) -> Vec<MetricRecord> {
        let state = self.lock();
        let skip = state.window.len().saturating_sub(n);
        state.window.iter().skip(skip).cloned().collect()
    }

    pub fn reset(&self) {
        *self.lock() = MetricsState::default();
    }
}

impl Default for MetricsLog {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

/// Nearest-rank percentile of execution times
fn percentile_ms(window: &VecDeque<MetricRecord>, p: f64) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let mut times: Vec<f64> = window
        .iter()
        .map(|r| r.execution_time.as_secs_f64() * 1000.0)
        .collect();
    times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (p * times.len() as f64).ceil() as usize;
    times[rank.clamp(1, times.len()) - 1]
}
