//! Alert Manager (C8): dedup, cooldown, state machine, and auto-resolution
//! over the `alerts` table. `alerts` is a ClickHouse `ReplacingMergeTree`
//! keyed by `alert_id` (see `migrations.rs`), so a "row-level UPDATE" is
//! implemented the way the teacher's own versioned tables are — inserting a
//! new row with a newer `updated_at` version and reading with `FINAL` —
//! rather than ClickHouse's slow, asynchronous `ALTER TABLE ... UPDATE`
//! mutations.

use std::collections::HashMap;

use clickhouse::Row;
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::detector::{Finding, Severity};
use crate::rows::AlertRow;
use crate::store::Store;

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct AlertKey {
    pub service_name: String,
    pub alert_type: String,
    pub metric_type: String,
}

impl AlertKey {
    fn from_finding(f: &Finding) -> Self {
        Self {
            service_name: f.service_name.clone(),
            alert_type: f.alert_type.clone(),
            metric_type: f.metric_type.clone(),
        }
    }
}

pub struct AlertManager {
    active: HashMap<AlertKey, AlertRow>,
    /// Latest `resolved_at` per key across `resolved`/`archived` history,
    /// used to enforce the post-resolve cooldown window. Archived alerts
    /// are treated as equivalent to resolved for cooldown purposes (see
    /// DESIGN.md's Open Question decision).
    last_resolved: HashMap<AlertKey, OffsetDateTime>,
}

#[derive(Row, Deserialize)]
struct ResolvedAtRow {
    service_name: String,
    alert_type: String,
    metric_type: String,
    #[serde(with = "clickhouse::serde::time::datetime64::nanos::option")]
    resolved_at: Option<OffsetDateTime>,
}

impl AlertManager {
    /// Rebuilds the in-memory active-alert index from the store at startup.
    /// The store is the source of truth; this cache only exists to avoid a
    /// read-before-write on every finding.
    pub async fn load(store: &Store) -> Self {
        let active_rows: Vec<AlertRow> = store
            .fetch_all("SELECT * FROM observability.alerts FINAL WHERE status IN ('active', 'acknowledged')")
            .await
            .unwrap_or_default();
        let mut active = HashMap::new();
        for row in active_rows {
            let key = AlertKey {
                service_name: row.service_name.clone(),
                alert_type: row.alert_type.clone(),
                metric_type: row.metric_type.clone(),
            };
            active.insert(key, row);
        }

        let resolved_rows: Vec<ResolvedAtRow> = store
            .fetch_all(
                "SELECT service_name, alert_type, metric_type, max(resolved_at) AS resolved_at
                 FROM observability.alerts FINAL
                 WHERE status IN ('resolved', 'archived')
                 GROUP BY service_name, alert_type, metric_type",
            )
            .await
            .unwrap_or_default();
        let mut last_resolved = HashMap::new();
        for row in resolved_rows {
            if let Some(resolved_at) = row.resolved_at {
                last_resolved.insert(
                    AlertKey { service_name: row.service_name, alert_type: row.alert_type, metric_type: row.metric_type },
                    resolved_at,
                );
            }
        }

        tracing::info!("alert manager: loaded {} active alerts, {} cooldown entries", active.len(), last_resolved.len());
        Self { active, last_resolved }
    }

    fn in_cooldown(&self, key: &AlertKey, now: OffsetDateTime, cooldown_minutes: i64) -> bool {
        match self.last_resolved.get(key) {
            Some(resolved_at) => now - *resolved_at < time::Duration::minutes(cooldown_minutes),
            None => false,
        }
    }

    /// Processes one detection pass's findings: creates new alerts,
    /// updates existing ones, and returns the newly-created alerts (for the
    /// investigator, which only looks at *new* alerts).
    pub async fn apply_findings(&mut self, store: &Store, findings: &[Finding], cooldown_minutes: i64) -> Vec<AlertRow> {
        let now = OffsetDateTime::now_utc();
        let mut newly_created = Vec::new();

        for finding in findings {
            let key = AlertKey::from_finding(finding);
            if let Some(existing) = self.active.get(&key) {
                let updated = AlertRow {
                    updated_at: now,
                    current_value: finding.current_value,
                    z_score: finding.z_score,
                    severity: finding.severity.as_str().to_string(),
                    ..existing.clone()
                };
                if store.append("alerts", std::slice::from_ref(&updated)).await.is_ok() {
                    self.active.insert(key, updated);
                } else {
                    tracing::error!("failed to persist alert update for {:?}", key);
                }
                continue;
            }

            if self.in_cooldown(&key, now, cooldown_minutes) {
                tracing::debug!("alert suppressed by cooldown: {:?}", key);
                continue;
            }

            let alert_id = Uuid::new_v4().simple().to_string()[..8].to_string();
            let row = AlertRow {
                alert_id,
                created_at: now,
                updated_at: now,
                service_name: finding.service_name.clone(),
                alert_type: finding.alert_type.clone(),
                severity: finding.severity.as_str().to_string(),
                title: finding.title.clone(),
                description: finding.description.clone(),
                metric_type: finding.metric_type.clone(),
                current_value: finding.current_value,
                threshold_value: finding.expected_value,
                baseline_value: finding.baseline_mean,
                z_score: finding.z_score,
                status: "active".to_string(),
                resolved_at: None,
                auto_resolved: false,
            };

            if store.append("alerts", std::slice::from_ref(&row)).await.is_ok() {
                newly_created.push(row.clone());
                self.active.insert(key, row);
            } else {
                tracing::error!("failed to persist new alert for {:?}", key);
            }
        }

        newly_created
    }

    /// Auto-resolves every active alert whose key was absent from the
    /// current pass's findings. Idempotent: a key already transitioned out
    /// of `active` on a prior pass cannot be re-resolved (it's no longer in
    /// `self.active`).
    pub async fn auto_resolve_missing(&mut self, store: &Store, findings: &[Finding]) {
        let observed: std::collections::HashSet<AlertKey> = findings.iter().map(AlertKey::from_finding).collect();
        let now = OffsetDateTime::now_utc();
        let stale_keys: Vec<AlertKey> = self.active.keys().filter(|k| !observed.contains(k)).cloned().collect();

        for key in stale_keys {
            let Some(existing) = self.active.remove(&key) else { continue };
            let resolved = AlertRow {
                updated_at: now,
                status: "resolved".to_string(),
                resolved_at: Some(now),
                auto_resolved: true,
                ..existing
            };
            if store.append("alerts", std::slice::from_ref(&resolved)).await.is_ok() {
                self.last_resolved.insert(key, now);
                tracing::info!("auto-resolved alert {} ({})", resolved.alert_id, resolved.service_name);
            } else {
                tracing::error!("failed to persist auto-resolve for alert {}", resolved.alert_id);
                self.active.insert(key, resolved);
            }
        }
    }
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(service: &str, alert_type: &str, metric_type: &str) -> AlertKey {
        AlertKey { service_name: service.to_string(), alert_type: alert_type.to_string(), metric_type: metric_type.to_string() }
    }

    #[test]
    fn cooldown_suppresses_within_window_and_expires_after() {
        let mgr = AlertManager {
            active: HashMap::new(),
            last_resolved: {
                let mut m = HashMap::new();
                m.insert(key("checkout", "error_spike", "error_rate"), OffsetDateTime::now_utc() - time::Duration::minutes(5));
                m
            },
        };
        assert!(mgr.in_cooldown(&key("checkout", "error_spike", "error_rate"), OffsetDateTime::now_utc(), 15));
        assert!(!mgr.in_cooldown(&key("checkout", "error_spike", "error_rate"), OffsetDateTime::now_utc(), 3));
    }

    #[test]
    fn severity_as_str_matches_table_values() {
        assert_eq!(Severity::Info.as_str(), "info");
        assert_eq!(Severity::Warning.as_str(), "warning");
        assert_eq!(Severity::Critical.as_str(), "critical");
    }
}
