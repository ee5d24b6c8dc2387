//! Counters and timings for one scoring run.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Metrics collected while scoring a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    /// Records in the incoming batch
    pub records_received: u64,
    /// Records that received a probability and profit figures
    pub scored: u64,
    /// Records dropped before prediction
    pub unscored: u64,
    /// Records meeting the expected profit threshold
    pub selected: u64,
    /// Probability of default distribution buckets
    pub p_default_buckets: [u64; 10],
    /// Sum of expected profit over every scored loan
    pub total_expected_profit: f64,
    /// Sum of expected profit over selected loans
    pub selected_expected_profit: f64,
    /// Stage timings (in microseconds)
    pub load_us: u64,
    pub predict_us: u64,
    pub profit_us: u64,
}

impl BatchMetrics {
    pub fn new(records_received: usize) -> Self {
        Self {
            records_received: records_received as u64,
            ..Self::default()
        }
    }

    /// Record one scored loan
    pub fn record_loan(&mut self, p_default: f64, expected_profit: f64) {
        self.scored += 1;
        self.total_expected_profit += expected_profit;

        let bucket = (p_default * 10.0).clamp(0.0, 9.0) as usize;
        self.p_default_buckets[bucket] += 1;
    }

    /// Record one loan meeting the threshold
    pub fn record_selected(&mut self, expected_profit: f64) {
        self.selected += 1;
        self.selected_expected_profit += expected_profit;
    }

    pub fn record_unscored(&mut self, count: usize) {
        self.unscored += count as u64;
    }

    pub fn record_load_time(&mut self, duration: Duration) {
        self.load_us = duration.as_micros() as u64;
    }

    pub fn record_predict_time(&mut self, duration: Duration) {
        self.predict_us = duration.as_micros() as u64;
    }

    pub fn record_profit_time(&mut self, duration: Duration) {
        self.profit_us = duration.as_micros() as u64;
    }

    /// Share of scored loans that met the threshold, in percent
    pub fn selection_rate(&self) -> f64 {
        if self.scored > 0 {
            (self.selected as f64 / self.scored as f64) * 100.0
        } else {
            0.0
        }
    }

    /// Print summary statistics
    pub fn print_summary(&self) {
        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║            LOAN DEFAULT SCORING - BATCH SUMMARY              ║");
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Records Received: {:>8}  │  Scored:   {:>8}            ║",
            self.records_received, self.scored
        );
        info!(
            "║ Unscored:         {:>8}  │  Selected: {:>8} ({:>5.1}%)  ║",
            self.unscored,
            self.selected,
            self.selection_rate()
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Expected Profit: total={:>12.2} selected={:>12.2}    ║",
            self.total_expected_profit, self.selected_expected_profit
        );
        info!(
            "║ Stage Time (μs): load={:>8} predict={:>8} profit={:>8}  ║",
            self.load_us, self.predict_us, self.profit_us
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Default Probability Distribution:                            ║");
        let total: u64 = self.p_default_buckets.iter().sum();
        for (i, &count) in self.p_default_buckets.iter().enumerate() {
            let pct = if total > 0 { (count as f64 / total as f64) * 100.0 } else { 0.0 };
            let bar: String = "█".repeat(((pct / 2.0) as usize).min(20));
            info!(
                "║   {:.1}-{:.1}: {:>6} ({:>5.1}%) {}",
                i as f64 / 10.0,
                (i + 1) as f64 / 10.0,
                count,
                pct,
                bar
            );
        }
        info!("╚══════════════════════════════════════════════════════════════╝");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let mut metrics = BatchMetrics::new(3);

        metrics.record_loan(0.05, 1200.0);
        metrics.record_loan(1.0, -5000.0);
        metrics.record_selected(1200.0);
        metrics.record_unscored(1);

        assert_eq!(metrics.records_received, 3);
        assert_eq!(metrics.scored, 2);
        assert_eq!(metrics.unscored, 1);
        assert_eq!(metrics.selected, 1);
        assert_eq!(metrics.p_default_buckets[0], 1);
        assert_eq!(metrics.p_default_buckets[9], 1);
        assert_eq!(metrics.total_expected_profit, -3800.0);
        assert_eq!(metrics.selection_rate(), 50.0);
    }

    #[test]
    fn test_empty_batch_rate() {
        assert_eq!(BatchMetrics::new(0).selection_rate(), 0.0);
    }

    #[test]
    fn test_timings_in_micros() {
        let mut metrics = BatchMetrics::default();
        metrics.record_predict_time(Duration::from_millis(3));
        assert_eq!(metrics.predict_us, 3000);
    }
}
