//! In-memory pipeline counters and per-phase latency rollups.
//!
//! Keeps a bounded sample window per phase so p50/p95 stay cheap to compute
//! without any persistent storage.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::pipeline::types::{Phase, ResultSource, millis};

const MAX_SAMPLES_PER_PHASE: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseLatencyRollup {
    pub phase: Phase,
    pub sample_count: usize,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
    pub from_cache: u64,
    pub fallbacks: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub cache_hits: u64,
    pub retries: u64,
    pub persistence_retries: u64,
    pub phases: Vec<PhaseLatencyRollup>,
}

#[derive(Debug, Default)]
struct PhaseWindow {
    samples_ms: VecDeque<u64>,
    from_cache: u64,
    fallbacks: u64,
    failures: u64,
}

/// Shared counters; cheap to update from many tasks.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    cache_hits: AtomicU64,
    retries: AtomicU64,
    persistence_retries: AtomicU64,
    windows: Mutex<BTreeMap<Phase, PhaseWindow>>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_succeeded(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retries(&self, retries: u32) {
        self.retries.fetch_add(u64::from(retries), Ordering::Relaxed);
    }

    pub fn record_persistence_retry(&self) {
        self.persistence_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished phase. `from_cache` is true only for genuine cache
    /// hits, never for coalesced waits.
    pub fn record_phase(&self, phase: Phase, elapsed: Duration, from_cache: bool, source: Option<ResultSource>) {
        if from_cache {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        let Ok(mut windows) = self.windows.lock() else {
            return;
        };
        let window = windows.entry(phase).or_default();
        if window.samples_ms.len() >= MAX_SAMPLES_PER_PHASE {
            window.samples_ms.pop_front();
        }
        window.samples_ms.push_back(millis(elapsed));
        if from_cache {
            window.from_cache += 1;
        }
        if source == Some(ResultSource::Fallback) {
            window.fallbacks += 1;
        }
    }

    pub fn record_phase_failure(&self, phase: Phase) {
        let Ok(mut windows) = self.windows.lock() else {
            return;
        };
        windows.entry(phase).or_default().failures += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let phases = match self.windows.lock() {
            Ok(windows) => windows
                .iter()
                .map(|(phase, window)| {
                    let mut values: Vec<u64> = window.samples_ms.iter().copied().collect();
                    values.sort_unstable();
                    PhaseLatencyRollup {
                        phase: *phase,
                        sample_count: values.len(),
                        p50_ms: percentile(&values, 50.0).unwrap_or(0),
                        p95_ms: percentile(&values, 95.0).unwrap_or(0),
                        max_ms: values.last().copied().unwrap_or(0),
                        from_cache: window.from_cache,
                        fallbacks: window.fallbacks,
                        failures: window.failures,
                    }
                })
                .collect(),
            Err(_) => Vec::new(),
        };

        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            persistence_retries: self.persistence_retries.load(Ordering::Relaxed),
            phases,
        }
    }

    /// Emit one info line per phase plus the totals.
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            processed = snapshot.processed,
            succeeded = snapshot.succeeded,
            failed = snapshot.failed,
            cancelled = snapshot.cancelled,
            cache_hits = snapshot.cache_hits,
            retries = snapshot.retries,
            "Pipeline totals"
        );
        for rollup in &snapshot.phases {
            info!(
                phase = %rollup.phase,
                samples = rollup.sample_count,
                p50_ms = rollup.p50_ms,
                p95_ms = rollup.p95_ms,
                max_ms = rollup.max_ms,
                from_cache = rollup.from_cache,
                fallbacks = rollup.fallbacks,
                failures = rollup.failures,
                "Phase latency"
            );
        }
    }
}

fn percentile(values: &[u64], p: f64) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len();
    let rank = ((p / 100.0) * n as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(n - 1);
    Some(values[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_of_empty_is_none() {
        assert_eq!(percentile(&[], 95.0), None);
    }

    #[test]
    fn percentile_small_samples() {
        let values = vec![10_u64, 20, 30];
        assert_eq!(percentile(&values, 50.0), Some(20));
        assert_eq!(percentile(&values, 95.0), Some(30));
    }

    #[test]
    fn window_is_bounded() {
        let metrics = PipelineMetrics::new();
        for ms in 1..=300 {
            metrics.record_phase(Phase::Phase2, Duration::from_millis(ms), false, Some(ResultSource::Model));
        }
        let snapshot = metrics.snapshot();
        let rollup = snapshot
            .phases
            .iter()
            .find(|r| r.phase == Phase::Phase2)
            .expect("rollup");
        assert_eq!(rollup.sample_count, MAX_SAMPLES_PER_PHASE);
        assert_eq!(rollup.max_ms, 300);
        assert!(rollup.p50_ms >= 170);
    }

    #[test]
    fn huge_latency_saturates() {
        let metrics = PipelineMetrics::new();
        metrics.record_phase(Phase::Phase3, Duration::MAX, false, Some(ResultSource::Model));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.phases[0].max_ms, u64::MAX);
    }

    #[test]
    fn counters_track_outcomes() {
        let metrics = PipelineMetrics::new();
        metrics.record_succeeded();
        metrics.record_succeeded();
        metrics.record_failed();
        metrics.record_cancelled();
        metrics.record_retries(3);
        metrics.record_phase(Phase::Phase2, Duration::from_millis(1), true, Some(ResultSource::Fallback));
        metrics.record_phase_failure(Phase::Phase3);

        let s = metrics.snapshot();
        assert_eq!(s.processed, 4);
        assert_eq!(s.succeeded, 2);
        assert_eq!(s.failed, 1);
        assert_eq!(s.cancelled, 1);
        assert_eq!(s.retries, 3);
        assert_eq!(s.cache_hits, 1);
        assert_eq!(s.phases.len(), 2);
        assert_eq!(s.phases[0].phase, Phase::Phase2);
        assert_eq!(s.phases[0].fallbacks, 1);
        assert_eq!(s.phases[1].failures, 1);
    }
}
