//! Per-run validation counters, aggregated across phases.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ValidationMetrics {
    valid: AtomicU64,
    invalid: AtomicU64,
}

impl ValidationMetrics {
    pub fn record_valid(&self) {
        self.valid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ValidationSnapshot {
        let valid = self.valid.load(Ordering::Relaxed);
        let invalid = self.invalid.load(Ordering::Relaxed);
        ValidationSnapshot::new(valid, invalid)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ValidationSnapshot {
    pub total_records_processed: u64,
    pub valid_records: u64,
    pub invalid_records: u64,
    /// Percentage of records that passed validation; 100 for an empty run.
    pub validation_rate: f64,
}

impl ValidationSnapshot {
    pub fn new(valid: u64, invalid: u64) -> Self {
        let total = valid + invalid;
        let rate = if total == 0 {
            100.0
        } else {
            (valid as f64 / total as f64) * 100.0
        };
        Self {
            total_records_processed: total,
            valid_records: valid,
            invalid_records: invalid,
            validation_rate: rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_reflects_counts() {
        let m = ValidationMetrics::default();
        for _ in 0..9 {
            m.record_valid();
        }
        m.record_invalid();
        let snap = m.snapshot();
        assert_eq!(snap.total_records_processed, 10);
        assert_eq!(snap.valid_records, 9);
        assert_eq!(snap.invalid_records, 1);
        assert!((snap.validation_rate - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_run_counts_as_fully_valid() {
        let snap = ValidationMetrics::default().snapshot();
        assert_eq!(snap.total_records_processed, 0);
        assert_eq!(snap.validation_rate, 100.0);
    }
}
