//! Finance settings loaded from the environment.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::Duration;
use tracing::warn;

use tally_core::TenantId;
use tally_ledger::{ReconciliationEngine, StrategyKind};

pub const PAYMENT_TERM_DAYS: &str = "TALLY_PAYMENT_TERM_DAYS";
pub const CALLBACK_DEDUP_CAPACITY: &str = "TALLY_CALLBACK_DEDUP_CAPACITY";
pub const CALLBACK_AUTO_RECONCILE: &str = "TALLY_CALLBACK_AUTO_RECONCILE";
pub const TENANT_STRATEGIES: &str = "TALLY_TENANT_STRATEGIES";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinanceSettings {
    /// Days until an ordinary obligation falls due.
    pub payment_term_days: u32,
    pub callback_dedup_capacity: usize,
    /// Run FIFO reconciliation after a callback confirms an instrument.
    pub callback_auto_reconcile: bool,
    pub tenant_strategies: HashMap<TenantId, StrategyKind>,
}

impl Default for FinanceSettings {
    fn default() -> Self {
        Self {
            payment_term_days: 30,
            callback_dedup_capacity: 100_000,
            callback_auto_reconcile: true,
            tenant_strategies: HashMap::new(),
        }
    }
}

impl FinanceSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. Unset keys keep their default;
    /// unparsable values keep it too, with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let payment_term_days = parse_or(&lookup, PAYMENT_TERM_DAYS, defaults.payment_term_days);
        let callback_dedup_capacity =
            match parse_or(&lookup, CALLBACK_DEDUP_CAPACITY, defaults.callback_dedup_capacity) {
                0 => {
                    warn!(key = CALLBACK_DEDUP_CAPACITY, "capacity must be positive; using default");
                    defaults.callback_dedup_capacity
                }
                n => n,
            };
        let callback_auto_reconcile =
            parse_or(&lookup, CALLBACK_AUTO_RECONCILE, defaults.callback_auto_reconcile);
        let tenant_strategies = lookup(TENANT_STRATEGIES)
            .map(|raw| parse_tenant_strategies(&raw))
            .unwrap_or_default();

        Self {
            payment_term_days,
            callback_dedup_capacity,
            callback_auto_reconcile,
            tenant_strategies,
        }
    }

    pub fn payment_term(&self) -> Duration {
        Duration::days(i64::from(self.payment_term_days))
    }

    /// Engine preloaded with the configured per-tenant strategies.
    pub fn reconciliation_engine(&self) -> ReconciliationEngine {
        ReconciliationEngine::new().with_tenant_defaults(
            self.tenant_strategies.iter().map(|(tenant, kind)| (*tenant, *kind)),
        )
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + core::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, fallback = %default, "unparsable setting; using default");
            default
        }),
    }
}

/// `<tenant-uuid>=fifo|manual` pairs separated by commas. Bad entries are skipped.
fn parse_tenant_strategies(raw: &str) -> HashMap<TenantId, StrategyKind> {
    let mut strategies = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let parsed = entry.split_once('=').and_then(|(tenant, kind)| {
            let tenant = tenant.parse::<TenantId>().ok()?;
            let kind = kind.parse::<StrategyKind>().ok()?;
            Some((tenant, kind))
        });
        match parsed {
            Some((tenant, kind)) => {
                strategies.insert(tenant, kind);
            }
            None => warn!(key = TENANT_STRATEGIES, entry, "ignoring malformed tenant strategy"),
        }
    }
    strategies
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let settings = FinanceSettings::from_lookup(|_| None);
        assert_eq!(settings, FinanceSettings::default());
        assert_eq!(settings.payment_term(), Duration::days(30));
    }

    #[test]
    fn reads_overrides() {
        let tenant = TenantId::new();
        let strategies = format!("{}=manual", tenant.as_uuid());
        let settings = FinanceSettings::from_lookup(lookup_from(&[
            (PAYMENT_TERM_DAYS, "45"),
            (CALLBACK_DEDUP_CAPACITY, "16"),
            (CALLBACK_AUTO_RECONCILE, "false"),
            (TENANT_STRATEGIES, strategies.as_str()),
        ]));

        assert_eq!(settings.payment_term_days, 45);
        assert_eq!(settings.callback_dedup_capacity, 16);
        assert!(!settings.callback_auto_reconcile);
        assert_eq!(settings.tenant_strategies.get(&tenant), Some(&StrategyKind::Manual));
        assert_eq!(
            settings.reconciliation_engine().select_strategy(tenant, None),
            StrategyKind::Manual
        );
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let settings = FinanceSettings::from_lookup(lookup_from(&[
            (PAYMENT_TERM_DAYS, "soon"),
            (CALLBACK_DEDUP_CAPACITY, "0"),
            (TENANT_STRATEGIES, "not-a-uuid=fifo, ,also-bad"),
        ]));
        assert_eq!(settings.payment_term_days, 30);
        assert_eq!(settings.callback_dedup_capacity, 100_000);
        assert!(settings.tenant_strategies.is_empty());
    }
}
