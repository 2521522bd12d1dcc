//! Metrics collection for observability
//!
//! Every ledger owns its own Prometheus registry, so several ledgers (one
//! per test, say) can live in one process.
//!
//! # Metrics
//!
//! - `reward_credits_total{kind}` - Rewards credited, by transaction type
//! - `reward_credited_trx_total{kind}` - TRX credited, by transaction type
//! - `reward_refusals_total{reason}` - Operations refused by a business rule
//! - `reward_cas_conflicts_total` - Optimistic update conflicts (retried)
//! - `reward_withdrawals_total{outcome}` - Withdrawals requested/approved/rejected
//! - `reward_repair_candidates` - Mutations missing their log entry

use crate::types::TransactionType;
use prometheus::{
    CounterVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Credits by transaction type
    pub credits_total: IntCounterVec,

    /// Credited amount by transaction type
    pub credited_trx: CounterVec,

    /// Refusals by reason
    pub refusals_total: IntCounterVec,

    /// CAS conflicts
    pub cas_conflicts: IntCounter,

    /// Withdrawals by outcome
    pub withdrawals_total: IntCounterVec,

    /// Outstanding repair candidates
    pub repair_candidates: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("cas_conflicts", &self.cas_conflicts.get())
            .field("repair_candidates", &self.repair_candidates.get())
            .finish()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let credits_total = IntCounterVec::new(
            Opts::new("reward_credits_total", "Rewards credited, by transaction type"),
            &["kind"],
        )?;
        registry.register(Box::new(credits_total.clone()))?;

        let credited_trx = CounterVec::new(
            Opts::new("reward_credited_trx_total", "TRX credited, by transaction type"),
            &["kind"],
        )?;
        registry.register(Box::new(credited_trx.clone()))?;

        let refusals_total = IntCounterVec::new(
            Opts::new("reward_refusals_total", "Operations refused by a business rule"),
            &["reason"],
        )?;
        registry.register(Box::new(refusals_total.clone()))?;

        let cas_conflicts = IntCounter::new(
            "reward_cas_conflicts_total",
            "Optimistic update conflicts",
        )?;
        registry.register(Box::new(cas_conflicts.clone()))?;

        let withdrawals_total = IntCounterVec::new(
            Opts::new("reward_withdrawals_total", "Withdrawals by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(withdrawals_total.clone()))?;

        let repair_candidates = IntGauge::new(
            "reward_repair_candidates",
            "Mutations missing their log entry",
        )?;
        registry.register(Box::new(repair_candidates.clone()))?;

        Ok(Self {
            credits_total,
            credited_trx,
            refusals_total,
            cas_conflicts,
            withdrawals_total,
            repair_candidates,
            registry,
        })
    }

    /// Record a credit
    pub fn record_credit(&self, kind: TransactionType, amount: Decimal) {
        self.credits_total.with_label_values(&[kind.as_str()]).inc();
        if let Some(amount) = amount.to_f64() {
            if amount > 0.0 {
                self.credited_trx.with_label_values(&[kind.as_str()]).inc_by(amount);
            }
        }
    }

    /// Record a refused operation
    pub fn record_refusal(&self, reason: &str) {
        self.refusals_total.with_label_values(&[reason]).inc();
    }

    /// Record a withdrawal transition
    pub fn record_withdrawal(&self, outcome: &str) {
        self.withdrawals_total.with_label_values(&[outcome]).inc();
    }

    /// Update the repair-candidate gauge
    pub fn set_repair_candidates(&self, count: usize) {
        self.repair_candidates.set(count as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
