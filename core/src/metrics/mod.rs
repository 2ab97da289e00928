//! Push-only metrics sink for the ledger core. Counters and gauges are
//! plain atomics; histograms use fixed bucket bounds. External exporters
//! pull the rendered text; nothing here blocks a writer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::config::Config;
use crate::events::AlertLevel;
use crate::mempool::MempoolStats;

/// Fixed-bound histogram. `observe` files a value into the first bucket
/// whose upper bound contains it; the overflow bucket is implicit.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<u64>,
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<u64>) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: u64) {
        let idx = self
            .bounds
            .iter()
            .position(|b| value <= *b)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    /// Cumulative counts per bound, plus the overflow bucket.
    pub fn cumulative_buckets(&self) -> Vec<(Option<u64>, u64)> {
        let mut total = 0;
        let mut out = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            total += bucket.load(Ordering::Relaxed);
            out.push((self.bounds.get(i).copied(), total));
        }
        out
    }
}

/// Counters, gauges and histograms pushed by the core.
pub struct CoreMetrics {
    // -- Counters --
    pub blocks_mined: AtomicU64,
    pub transactions_processed: AtomicU64,
    pub blocks_propagated: AtomicU64,
    pub errors_encountered: AtomicU64,
    rejections_by_reason: Mutex<HashMap<String, u64>>,
    security_events_by_severity: Mutex<HashMap<String, u64>>,

    // -- Gauges --
    pub chain_height: AtomicU64,
    pub difficulty: AtomicU64,
    pub pending_transactions: AtomicU64,
    pub mempool_bytes: AtomicU64,
    pub active_sender_bans: AtomicU64,
    pub last_block_time: AtomicU64,
    start_time: Instant,

    // -- Histograms --
    pub mining_duration_ms: Histogram,
    pub block_propagation_ms: Histogram,
    pub tx_validation_us: Histogram,
    pub timestamp_drift_secs: Histogram,
}

impl CoreMetrics {
    pub fn new() -> Self {
        Self {
            blocks_mined: AtomicU64::new(0),
            transactions_processed: AtomicU64::new(0),
            blocks_propagated: AtomicU64::new(0),
            errors_encountered: AtomicU64::new(0),
            rejections_by_reason: Mutex::new(HashMap::new()),
            security_events_by_severity: Mutex::new(HashMap::new()),
            chain_height: AtomicU64::new(0),
            difficulty: AtomicU64::new(0),
            pending_transactions: AtomicU64::new(0),
            mempool_bytes: AtomicU64::new(0),
            active_sender_bans: AtomicU64::new(0),
            last_block_time: AtomicU64::new(0),
            start_time: Instant::now(),
            mining_duration_ms: Histogram::new(vec![10, 100, 1_000, 10_000, 60_000]),
            block_propagation_ms: Histogram::new(vec![50, 250, 1_000, 5_000]),
            tx_validation_us: Histogram::new(vec![100, 1_000, 10_000, 100_000]),
            timestamp_drift_secs: Histogram::new(vec![1, 10, 60, 600, 7_200]),
        }
    }

    pub fn record_rejection(&self, reason: &str) {
        *self
            .rejections_by_reason
            .lock()
            .unwrap()
            .entry(reason.to_string())
            .or_insert(0) += 1;
    }

    pub fn rejection_count(&self, reason: &str) -> u64 {
        self.rejections_by_reason
            .lock()
            .unwrap()
            .get(reason)
            .copied()
            .unwrap_or(0)
    }

    pub fn record_security_event(&self, severity: &str) {
        *self
            .security_events_by_severity
            .lock()
            .unwrap()
            .entry(severity.to_string())
            .or_insert(0) += 1;
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// 0-100 health score: penalties for a stale tip, mempool backlog and
    /// accumulated errors.
    pub fn health_score(&self, now: u64) -> f64 {
        let mut score = 100.0;

        let last_block = self.last_block_time.load(Ordering::Relaxed);
        if last_block > 0 {
            let stale = now.saturating_sub(last_block);
            if stale > 600 {
                score -= (stale as f64 / 60.0).min(30.0);
            }
        }

        let pending = self.pending_transactions.load(Ordering::Relaxed);
        if pending > 10_000 {
            score -= ((pending - 10_000) as f64 / 500.0).min(20.0);
        }

        let errors = self.errors_encountered.load(Ordering::Relaxed);
        if errors > 10 {
            score -= (errors as f64).min(25.0);
        }

        score.max(0.0)
    }

    pub fn health_status(&self, now: u64) -> &'static str {
        let score = self.health_score(now);
        if score >= 80.0 {
            "healthy"
        } else if score >= 60.0 {
            "degraded"
        } else if score >= 40.0 {
            "warning"
        } else {
            "critical"
        }
    }

    /// Text exposition for the external pull exporter.
    pub fn render(&self) -> String {
        let mut out = String::new();

        let counter = |out: &mut String, name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n"
            ));
        };
        let gauge = |out: &mut String, name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n\n"
            ));
        };

        counter(&mut out, "onyx_blocks_mined_total", "Blocks mined by this node",
            self.blocks_mined.load(Ordering::Relaxed));
        counter(&mut out, "onyx_transactions_processed_total", "Transactions confirmed",
            self.transactions_processed.load(Ordering::Relaxed));
        counter(&mut out, "onyx_blocks_propagated_total", "Externally produced blocks accepted",
            self.blocks_propagated.load(Ordering::Relaxed));
        counter(&mut out, "onyx_errors_total", "Errors recorded by the core",
            self.errors_encountered.load(Ordering::Relaxed));

        for (reason, count) in self.rejections_by_reason.lock().unwrap().iter() {
            out.push_str(&format!(
                "onyx_mempool_rejections_total{{reason=\"{reason}\"}} {count}\n"
            ));
        }
        for (severity, count) in self.security_events_by_severity.lock().unwrap().iter() {
            out.push_str(&format!(
                "onyx_security_events_total{{severity=\"{severity}\"}} {count}\n"
            ));
        }
        out.push('\n');

        gauge(&mut out, "onyx_chain_height", "Current chain height",
            self.chain_height.load(Ordering::Relaxed));
        gauge(&mut out, "onyx_difficulty", "Current difficulty in leading zero bits",
            self.difficulty.load(Ordering::Relaxed));
        gauge(&mut out, "onyx_pending_transactions", "Mempool transaction count",
            self.pending_transactions.load(Ordering::Relaxed));
        gauge(&mut out, "onyx_mempool_bytes", "Mempool size in bytes",
            self.mempool_bytes.load(Ordering::Relaxed));
        gauge(&mut out, "onyx_active_sender_bans", "Currently banned senders",
            self.active_sender_bans.load(Ordering::Relaxed));
        gauge(&mut out, "onyx_uptime_seconds", "Node uptime", self.uptime_seconds());

        for (name, hist) in [
            ("onyx_mining_duration_ms", &self.mining_duration_ms),
            ("onyx_block_propagation_ms", &self.block_propagation_ms),
            ("onyx_tx_validation_us", &self.tx_validation_us),
            ("onyx_timestamp_drift_secs", &self.timestamp_drift_secs),
        ] {
            out.push_str(&format!("# TYPE {name} histogram\n"));
            for (bound, cumulative) in hist.cumulative_buckets() {
                let le = bound
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "+Inf".to_string());
                out.push_str(&format!("{name}_bucket{{le=\"{le}\"}} {cumulative}\n"));
            }
            out.push_str(&format!("{name}_sum {}\n", hist.sum()));
            out.push_str(&format!("{name}_count {}\n\n", hist.count()));
        }

        out
    }
}

impl Default for CoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// One fired alert, ready to be published on the event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredAlert {
    pub name: String,
    pub message: String,
    pub level: AlertLevel,
}

/// Evaluates alert rules against the current counters on each tick.
/// Only the transition from quiet to firing produces an alert.
pub struct AlertEngine {
    invalid_delta_threshold: u64,
    ban_delta_threshold: u64,
    active_bans_threshold: u64,

    last_invalid_total: AtomicU64,
    last_ban_total: AtomicU64,
    firing: Mutex<HashSet<String>>,
}

impl AlertEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            invalid_delta_threshold: config.mempool_alert_invalid_delta,
            ban_delta_threshold: config.mempool_alert_ban_delta,
            active_bans_threshold: config.mempool_alert_active_bans,
            last_invalid_total: AtomicU64::new(0),
            last_ban_total: AtomicU64::new(0),
            firing: Mutex::new(HashSet::new()),
        }
    }

    pub fn evaluate(&self, stats: &MempoolStats) -> Vec<FiredAlert> {
        let invalid_delta = stats
            .invalid_submissions_total
            .saturating_sub(self.last_invalid_total.swap(stats.invalid_submissions_total, Ordering::Relaxed));
        let ban_delta = stats
            .ban_rejections_total
            .saturating_sub(self.last_ban_total.swap(stats.ban_rejections_total, Ordering::Relaxed));

        let conditions = [
            (
                "mempool_invalid_surge",
                invalid_delta >= self.invalid_delta_threshold,
                format!("{invalid_delta} invalid submissions since last tick"),
                AlertLevel::Warning,
            ),
            (
                "mempool_ban_surge",
                ban_delta >= self.ban_delta_threshold,
                format!("{ban_delta} banned-sender rejections since last tick"),
                AlertLevel::Warning,
            ),
            (
                "mempool_active_bans",
                stats.active_bans as u64 >= self.active_bans_threshold,
                format!("{} senders currently banned", stats.active_bans),
                AlertLevel::Critical,
            ),
        ];

        let mut firing = self.firing.lock().unwrap();
        let mut fired = Vec::new();
        for (name, active, message, level) in conditions {
            if active {
                if firing.insert(name.to_string()) {
                    fired.push(FiredAlert {
                        name: name.to_string(),
                        message,
                        level,
                    });
                }
            } else {
                firing.remove(name);
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_and_totals() {
        let hist = Histogram::new(vec![10, 100]);
        hist.observe(5);
        hist.observe(50);
        hist.observe(500);

        assert_eq!(hist.count(), 3);
        assert_eq!(hist.sum(), 555);
        let buckets = hist.cumulative_buckets();
        assert_eq!(buckets[0], (Some(10), 1));
        assert_eq!(buckets[1], (Some(100), 2));
        assert_eq!(buckets[2], (None, 3));
    }

    #[test]
    fn rejection_counters_by_reason() {
        let metrics = CoreMetrics::new();
        metrics.record_rejection("low_fee_rate");
        metrics.record_rejection("low_fee_rate");
        metrics.record_rejection("sender_banned");
        assert_eq!(metrics.rejection_count("low_fee_rate"), 2);
        assert_eq!(metrics.rejection_count("sender_banned"), 1);
        assert_eq!(metrics.rejection_count("unknown"), 0);
    }

    #[test]
    fn render_contains_counters_and_histograms() {
        let metrics = CoreMetrics::new();
        metrics.blocks_mined.store(7, Ordering::Relaxed);
        metrics.chain_height.store(42, Ordering::Relaxed);
        metrics.record_rejection("sender_cap");
        metrics.timestamp_drift_secs.observe(3);

        let text = metrics.render();
        assert!(text.contains("onyx_blocks_mined_total 7"));
        assert!(text.contains("onyx_chain_height 42"));
        assert!(text.contains("onyx_mempool_rejections_total{reason=\"sender_cap\"} 1"));
        assert!(text.contains("onyx_timestamp_drift_secs_bucket{le=\"+Inf\"} 1"));
    }

    #[test]
    fn health_score_penalizes_stale_tip() {
        let metrics = CoreMetrics::new();
        metrics.last_block_time.store(1_000_000, Ordering::Relaxed);
        let fresh = metrics.health_score(1_000_100);
        let stale = metrics.health_score(1_002_000);
        assert_eq!(fresh, 100.0);
        assert!(stale < fresh);
        assert_eq!(metrics.health_status(1_000_100), "healthy");
    }

    #[test]
    fn alerts_fire_on_rising_edge_only() {
        let cfg = Config {
            mempool_alert_invalid_delta: 5,
            mempool_alert_ban_delta: 3,
            mempool_alert_active_bans: 2,
            ..Config::default()
        };
        let engine = AlertEngine::new(&cfg);

        let quiet = MempoolStats::default();
        assert!(engine.evaluate(&quiet).is_empty());

        let noisy = MempoolStats {
            invalid_submissions_total: 10,
            active_bans: 3,
            ..MempoolStats::default()
        };
        let fired = engine.evaluate(&noisy);
        let names: Vec<&str> = fired.iter().map(|a| a.name.as_str()).collect();
        assert!(names.contains(&"mempool_invalid_surge"));
        assert!(names.contains(&"mempool_active_bans"));

        // Same state again: still firing, no new alerts.
        let again = engine.evaluate(&MempoolStats {
            invalid_submissions_total: 10,
            active_bans: 3,
            ..MempoolStats::default()
        });
        let again_names: Vec<&str> = again.iter().map(|a| a.name.as_str()).collect();
        assert!(!again_names.contains(&"mempool_active_bans"));

        // Recovery clears the latch; a later surge fires again.
        engine.evaluate(&MempoolStats {
            invalid_submissions_total: 10,
            ..MempoolStats::default()
        });
        let refired = engine.evaluate(&MempoolStats {
            invalid_submissions_total: 10,
            active_bans: 5,
            ..MempoolStats::default()
        });
        assert!(refired.iter().any(|a| a.name == "mempool_active_bans"));
    }
}
