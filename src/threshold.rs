//! Adaptive Threshold Manager (C7): per-category Z-score multipliers, a
//! category enable-set gate, and learned adjustments derived from alert
//! resolution history.

use std::collections::HashMap;

use clickhouse::Row;
use serde::Deserialize;

use crate::config::{RootCauseConfig, ThresholdConfig};
use crate::store::Store;

/// Maps a root-cause alert type to the config multiplier / learned-delta
/// bucket it belongs to. Several alert types share one category because the
/// config surface (`root_cause_threshold_multipliers`) is deliberately
/// coarser than the per-(alert_type, metric_type) learning granularity.
fn category_for_alert_type(alert_type: &str) -> &'static str {
    match alert_type {
        "db_slow_queries" | "db_connection_failure" => "db_error",
        "dependency_latency" | "dependency_failure" => "dependency_error",
        "exception_surge" => "exception_surge",
        "new_exception_type" => "new_exception_type",
        _ => "default",
    }
}

pub struct ThresholdManager {
    base: f64,
    multipliers: HashMap<String, f64>,
    enabled_types: Vec<String>,
    adjustment: f64,
    /// Keyed by `(alert_type, metric_type)`, clamped to `[-1.0, 1.0]`.
    learned: HashMap<(String, String), f64>,
}

#[derive(Row, Deserialize)]
struct AlertHistoryRow {
    alert_type: String,
    metric_type: String,
    total: u64,
    auto_resolved: u64,
    with_investigation_summary: u64,
}

impl ThresholdManager {
    pub fn new(thresholds: &ThresholdConfig, root_cause: &RootCauseConfig) -> Self {
        Self {
            base: thresholds.zscore_threshold,
            multipliers: root_cause.threshold_multipliers.clone(),
            enabled_types: root_cause.enabled_types.clone(),
            adjustment: root_cause.adaptive_threshold_adjustment,
            learned: HashMap::new(),
        }
    }

    /// Empty enabled-set means every root-cause category is enabled.
    pub fn category_enabled(&self, root_cause_type: &str) -> bool {
        self.enabled_types.is_empty()
            || self.enabled_types.iter().any(|t| t.eq_ignore_ascii_case(root_cause_type))
    }

    /// Effective Z-score threshold for a symptom/root-cause finding, floored
    /// at 1.0 per spec.
    pub fn effective_threshold(&self, alert_type: &str, metric_type: &str) -> f64 {
        let category = category_for_alert_type(alert_type);
        let mult = self.multipliers.get(category).copied().unwrap_or(1.0);
        let delta = self
            .learned
            .get(&(alert_type.to_string(), metric_type.to_string()))
            .copied()
            .unwrap_or(0.0);
        (self.base * mult + delta).max(1.0)
    }

    /// Recomputes learned adjustments from the last 7 days of alert history.
    /// Called once per baseline recomputation (C5's cadence).
    pub async fn learn_from_alert_history(&mut self, store: &Store, adaptive_enabled: bool) {
        if !adaptive_enabled {
            return;
        }
        let sql = "
            SELECT
                a.alert_type AS alert_type,
                a.metric_type AS metric_type,
                count() AS total,
                countIf(a.auto_resolved) AS auto_resolved,
                countIf(
                    a.auto_resolved = 0
                    AND i.root_cause_summary != ''
                ) AS with_investigation_summary
            FROM observability.alerts AS a
            LEFT JOIN observability.alert_investigations AS i ON i.alert_id = a.alert_id
            WHERE a.created_at >= now() - INTERVAL 7 DAY
            GROUP BY a.alert_type, a.metric_type
            HAVING total >= 5
        ";
        let rows: Vec<AlertHistoryRow> = store.fetch_all(sql).await.unwrap_or_default();
        for row in rows {
            let resolve_rate = row.auto_resolved as f64 / row.total as f64;
            let investigated_rate = row.with_investigation_summary as f64 / row.total as f64;
            let key = (row.alert_type.clone(), row.metric_type.clone());
            let current = self.learned.get(&key).copied().unwrap_or(0.0);
            let delta = if resolve_rate > 0.7 {
                self.adjustment
            } else if resolve_rate < 0.3 && investigated_rate > 0.3 {
                -0.5 * self.adjustment
            } else {
                0.0
            };
            if delta != 0.0 {
                let updated = (current + delta).clamp(-1.0, 1.0);
                tracing::info!(
                    "adaptive threshold: {}/{} resolve_rate={resolve_rate:.2} delta={delta:+.2} -> learned={updated:.2}",
                    row.alert_type, row.metric_type
                );
                self.learned.insert(key, updated);
            }
        }
    }

    #[cfg(test)]
    pub fn set_learned(&mut self, alert_type: &str, metric_type: &str, delta: f64) {
        self.learned.insert((alert_type.to_string(), metric_type.to_string()), delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RootCauseConfig, ThresholdConfig};

    fn thresholds() -> ThresholdConfig {
        ThresholdConfig {
            zscore_threshold: 3.0,
            error_rate_warning: 0.05,
            error_rate_critical: 0.20,
            min_samples_for_baseline: 10,
            alert_cooldown_minutes: 15,
        }
    }

    fn root_cause(mults: &[(&str, f64)]) -> RootCauseConfig {
        RootCauseConfig {
            enabled: true,
            enabled_types: vec![],
            threshold_multipliers: mults.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            adaptive_thresholds_enabled: true,
            adaptive_threshold_adjustment: 0.1,
        }
    }

    #[test]
    fn empty_enabled_set_allows_all_categories() {
        let mgr = ThresholdManager::new(&thresholds(), &root_cause(&[]));
        assert!(mgr.category_enabled("DB_SLOW_QUERIES"));
    }

    #[test]
    fn multiplier_scales_base_threshold() {
        let mgr = ThresholdManager::new(&thresholds(), &root_cause(&[("db_error", 0.8)]));
        assert!((mgr.effective_threshold("db_connection_failure", "db_postgresql_error_rate") - 2.4).abs() < 1e-9);
    }

    #[test]
    fn effective_threshold_floors_at_one() {
        let mut mgr = ThresholdManager::new(&thresholds(), &root_cause(&[("db_error", 0.1)]));
        mgr.set_learned("db_connection_failure", "db_postgresql_error_rate", -1.0);
        assert_eq!(mgr.effective_threshold("db_connection_failure", "db_postgresql_error_rate"), 1.0);
    }

    #[test]
    fn learned_delta_applies_only_to_its_alert_metric_pair() {
        let mut mgr = ThresholdManager::new(&thresholds(), &root_cause(&[]));
        mgr.set_learned("db_connection_failure", "db_postgresql_error_rate", 0.1);
        assert_eq!(mgr.effective_threshold("db_connection_failure", "db_postgresql_error_rate"), 3.1);
        assert_eq!(mgr.effective_threshold("db_connection_failure", "db_mysql_error_rate"), 3.0);
    }
}
