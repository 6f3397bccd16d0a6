//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the wallet ledger.
//! Each [`Metrics`] owns its registry, so several ledgers (and tests) can run
//! in one process.
//!
//! # Metrics
//!
//! - `wallet_transfers_total` - Committed transfers
//! - `wallet_transfer_failures_total{reason}` - Rejected or aborted transfers
//! - `wallet_transfer_duration_seconds` - Histogram of transfer latencies
//! - `wallet_credits_total` - Committed webhook credits
//! - `wallet_credit_duplicates_total` - Deliveries resolved as already processed
//! - `wallet_webhook_rejections_total{outcome}` - Deliveries acknowledged without a credit
//! - `wallet_wallets_created_total` - Wallets created (explicit or lazy)
//! - `wallet_notifications_dropped_total` - Notifications lost to a full or closed channel

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Committed transfers
    pub transfers_total: IntCounter,

    /// Failed transfers by error type
    pub transfer_failures: IntCounterVec,

    /// Transfer duration histogram
    pub transfer_duration: Histogram,

    /// Committed credits
    pub credits_total: IntCounter,

    /// Duplicate deliveries
    pub credit_duplicates: IntCounter,

    /// Acknowledged deliveries that did not credit
    pub webhook_rejections: IntCounterVec,

    /// Wallets created
    pub wallets_created: IntCounter,

    /// Dropped notifications
    pub notifications_dropped: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let transfers_total = IntCounter::new("wallet_transfers_total", "Committed transfers")?;
        registry.register(Box::new(transfers_total.clone()))?;

        let transfer_failures = IntCounterVec::new(
            Opts::new(
                "wallet_transfer_failures_total",
                "Rejected or aborted transfers",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(transfer_failures.clone()))?;

        let transfer_duration = Histogram::with_opts(
            HistogramOpts::new(
                "wallet_transfer_duration_seconds",
                "Histogram of transfer latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5]),
        )?;
        registry.register(Box::new(transfer_duration.clone()))?;

        let credits_total = IntCounter::new("wallet_credits_total", "Committed webhook credits")?;
        registry.register(Box::new(credits_total.clone()))?;

        let credit_duplicates = IntCounter::new(
            "wallet_credit_duplicates_total",
            "Deliveries resolved as already processed",
        )?;
        registry.register(Box::new(credit_duplicates.clone()))?;

        let webhook_rejections = IntCounterVec::new(
            Opts::new(
                "wallet_webhook_rejections_total",
                "Deliveries acknowledged without a credit",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(webhook_rejections.clone()))?;

        let wallets_created = IntCounter::new("wallet_wallets_created_total", "Wallets created")?;
        registry.register(Box::new(wallets_created.clone()))?;

        let notifications_dropped = IntCounter::new(
            "wallet_notifications_dropped_total",
            "Notifications lost to a full or closed channel",
        )?;
        registry.register(Box::new(notifications_dropped.clone()))?;

        Ok(Self {
            transfers_total,
            transfer_failures,
            transfer_duration,
            credits_total,
            credit_duplicates,
            webhook_rejections,
            wallets_created,
            notifications_dropped,
            registry,
        })
    }

    /// Record a committed transfer
    pub fn record_transfer(&self, duration_seconds: f64) {
        self.transfers_total.inc();
        self.transfer_duration.observe(duration_seconds);
    }

    /// Record a failed transfer
    pub fn record_transfer_failure(&self, reason: &str) {
        self.transfer_failures.with_label_values(&[reason]).inc();
    }

    /// Record a committed credit
    pub fn record_credit(&self) {
        self.credits_total.inc();
    }

    /// Record a duplicate delivery
    pub fn record_duplicate(&self) {
        self.credit_duplicates.inc();
    }

    /// Record a delivery acknowledged without a credit
    pub fn record_webhook_rejection(&self, outcome: &str) {
        self.webhook_rejections.with_label_values(&[outcome]).inc();
    }

    /// Record wallet creation
    pub fn record_wallet_created(&self) {
        self.wallets_created.inc();
    }

    /// Record a dropped notification
    pub fn record_notification_dropped(&self) {
        self.notifications_dropped.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.transfers_total.get(), 0);
        assert_eq!(metrics.credits_total.get(), 0);

        // Registries are per instance
        let other = Metrics::new().unwrap();
        other.record_credit();
        assert_eq!(metrics.credits_total.get(), 0);
    }

    #[test]
    fn test_record_transfer() {
        let metrics = Metrics::new().unwrap();
        metrics.record_transfer(0.002);
        metrics.record_transfer(0.004);
        assert_eq!(metrics.transfers_total.get(), 2);
        assert_eq!(metrics.transfer_duration.get_sample_count(), 2);
    }

    #[test]
    fn test_labelled_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_transfer_failure("insufficient_funds");
        metrics.record_transfer_failure("insufficient_funds");
        metrics.record_webhook_rejection("payer_not_found");

        assert_eq!(
            metrics
                .transfer_failures
                .with_label_values(&["insufficient_funds"])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .webhook_rejections
                .with_label_values(&["payer_not_found"])
                .get(),
            1
        );
    }

    #[test]
    fn test_registry_gathers_all_families() {
        let metrics = Metrics::new().unwrap();
        metrics.record_transfer_failure("same_account");
        metrics.record_webhook_rejection("ignored");
        assert_eq!(metrics.registry().gather().len(), 8);
    }
}
