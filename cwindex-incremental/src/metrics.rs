//! Formula metrics
//!
//! Counters for cache effectiveness and evaluation cost, kept per formula.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Metrics for a single formula
#[derive(Debug, Default)]
pub struct FormulaMetrics {
    /// Served from a cached computation
    pub hit_count: AtomicU64,

    /// Needed a fresh evaluation
    pub miss_count: AtomicU64,

    /// Number of evaluations, including those made by range computations
    pub execution_count: AtomicU64,

    /// Total time spent evaluating (nanoseconds)
    pub total_compute_time_ns: AtomicU64,

    pub range_count: AtomicU64,
}

impl FormulaMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.miss_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `evaluations` evaluations that took `duration` in total
    pub fn record_execution(&self, evaluations: u64, duration: Duration) {
        self.execution_count.fetch_add(evaluations, Ordering::Relaxed);
        self.total_compute_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_range(&self) {
        self.range_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Get cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        self.snapshot("").hit_rate()
    }

    pub fn reset(&self) {
        self.hit_count.store(0, Ordering::Relaxed);
        self.miss_count.store(0, Ordering::Relaxed);
        self.execution_count.store(0, Ordering::Relaxed);
        self.total_compute_time_ns.store(0, Ordering::Relaxed);
        self.range_count.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self, formula: &str) -> MetricsSnapshot {
        MetricsSnapshot {
            formula: formula.to_string(),
            hits: self.hit_count.load(Ordering::Relaxed),
            misses: self.miss_count.load(Ordering::Relaxed),
            executions: self.execution_count.load(Ordering::Relaxed),
            ranges: self.range_count.load(Ordering::Relaxed),
            total_time_ns: self.total_compute_time_ns.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of formula metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub formula: String,
    pub hits: u64,
    pub misses: u64,
    pub executions: u64,
    pub ranges: u64,
    pub total_time_ns: u64,
}

impl MetricsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn avg_execution_time(&self) -> Duration {
        if self.executions == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.total_time_ns / self.executions)
        }
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Formula: {}", self.formula)?;
        writeln!(
            f,
            "  Hits: {} | Misses: {} | Hit Rate: {:.1}%",
            self.hits,
            self.misses,
            self.hit_rate() * 100.0
        )?;
        writeln!(
            f,
            "  Evaluations: {} | Ranges: {}",
            self.executions, self.ranges
        )?;
        writeln!(
            f,
            "  Avg Time: {:.2}ms | Total Time: {:.2}ms",
            self.avg_execution_time().as_secs_f64() * 1000.0,
            Duration::from_nanos(self.total_time_ns).as_secs_f64() * 1000.0
        )?;
        Ok(())
    }
}

/// Metrics for every formula that has been evaluated
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    formulas: DashMap<String, Arc<FormulaMetrics>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_formula(&self, formula: &str) -> Arc<FormulaMetrics> {
        if let Some(metrics) = self.formulas.get(formula) {
            return metrics.clone();
        }
        self.formulas
            .entry(formula.to_string())
            .or_default()
            .clone()
    }

    /// Snapshots sorted by formula name
    pub fn snapshot_all(&self) -> Vec<MetricsSnapshot> {
        let mut snapshots: Vec<_> = self
            .formulas
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();
        snapshots.sort_by(|a, b| a.formula.cmp(&b.formula));
        snapshots
    }
}
